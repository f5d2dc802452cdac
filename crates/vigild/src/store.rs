//! JSON-file template store.
//!
//! Layout: `{ "users": [{id, active}], "templates": [{id, user_id,
//! ciphertext, quality_score, created_at}] }` with the ciphertext base64
//! encoded. Writes go to a temp file in the same directory and are renamed
//! into place, so readers never observe a half-written store.

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::sync::Mutex;
use vigil_core::{FaceTemplate, TemplateStore};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to read template store {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write template store {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("template store {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("template store worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TemplateRecord {
    id: String,
    user_id: String,
    ciphertext: String,
    quality_score: f32,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    users: Vec<UserRecord>,
    #[serde(default)]
    templates: Vec<TemplateRecord>,
}

impl From<&FaceTemplate> for TemplateRecord {
    fn from(t: &FaceTemplate) -> Self {
        Self {
            id: t.id.clone(),
            user_id: t.user_id.clone(),
            ciphertext: general_purpose::STANDARD.encode(&t.ciphertext),
            quality_score: t.quality_score,
            created_at: t.created_at,
        }
    }
}

pub struct FileTemplateStore {
    path: PathBuf,
    /// Serialises read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl FileTemplateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<StoreFile, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StoreFile::default()),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    async fn save(&self, file: StoreFile) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &file)).await?
    }

    /// Add a template, registering its owner as active on first enrollment.
    /// With `replace`, the owner's earlier templates are dropped.
    pub async fn append(&self, template: &FaceTemplate, replace: bool) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load().await?;

        if !file.users.iter().any(|u| u.id == template.user_id) {
            file.users.push(UserRecord {
                id: template.user_id.clone(),
                active: true,
            });
        }
        let before = file.templates.len();
        if replace {
            file.templates.retain(|t| t.user_id != template.user_id);
        }
        let removed = before - file.templates.len();
        file.templates.push(TemplateRecord::from(template));
        self.save(file).await?;

        tracing::info!(
            user = %template.user_id,
            template = %template.id,
            replaced = removed,
            "template stored"
        );
        Ok(())
    }

    /// Mark a user active or inactive; inactive users never authenticate.
    /// Returns `false` when the user is unknown.
    pub async fn set_user_active(&self, user_id: &str, active: bool) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load().await?;
        let Some(user) = file.users.iter_mut().find(|u| u.id == user_id) else {
            return Ok(false);
        };
        user.active = active;
        self.save(file).await?;
        tracing::info!(user = user_id, active, "user status changed");
        Ok(true)
    }

    pub async fn users(&self) -> Result<Vec<UserRecord>, StoreError> {
        Ok(self.load().await?.users)
    }

    pub async fn template_count(&self) -> Result<usize, StoreError> {
        Ok(self.load().await?.templates.len())
    }
}

impl TemplateStore for FileTemplateStore {
    type Error = StoreError;

    async fn fetch_active_templates(&self) -> Result<Vec<FaceTemplate>, StoreError> {
        let file = self.load().await?;
        let active: Vec<&str> = file
            .users
            .iter()
            .filter(|u| u.active)
            .map(|u| u.id.as_str())
            .collect();

        let mut templates = Vec::new();
        for record in file.templates {
            if !active.contains(&record.user_id.as_str()) {
                continue;
            }
            // A record that is not even base64 can never decrypt; leave it to
            // the scan's skip path as an empty blob.
            let ciphertext = general_purpose::STANDARD
                .decode(&record.ciphertext)
                .unwrap_or_else(|e| {
                    tracing::warn!(template = %record.id, error = %e, "template ciphertext is not base64");
                    Vec::new()
                });
            templates.push(FaceTemplate {
                id: record.id,
                user_id: record.user_id,
                ciphertext,
                quality_score: record.quality_score,
                created_at: record.created_at,
            });
        }
        Ok(templates)
    }
}

fn write_atomic(path: &Path, file: &StoreFile) -> Result<(), StoreError> {
    let write_err = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir).map_err(write_err)?;

    let body = serde_json::to_vec_pretty(file).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))
            .map_err(write_err)?;
    }
    tmp.write_all(&body).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn template(id: &str, user: &str, blob: &[u8]) -> FaceTemplate {
        FaceTemplate {
            id: id.to_string(),
            user_id: user.to_string(),
            ciphertext: blob.to_vec(),
            quality_score: 0.8,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn missing_file_is_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = FileTemplateStore::new(dir.path().join("templates.json"));
        assert!(store.fetch_active_templates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn append_then_fetch() {
        let dir = TempDir::new().unwrap();
        let store = FileTemplateStore::new(dir.path().join("nested/templates.json"));
        store.append(&template("t1", "alice", &[1, 2, 3]), false).await.unwrap();
        store.append(&template("t2", "alice", &[4, 5]), false).await.unwrap();

        let templates = store.fetch_active_templates().await.unwrap();
        assert_eq!(templates.len(), 2);
        assert_eq!(templates[0].ciphertext, vec![1, 2, 3]);
        assert_eq!(store.users().await.unwrap(), vec![UserRecord { id: "alice".into(), active: true }]);
    }

    #[tokio::test]
    async fn replace_drops_only_that_users_templates() {
        let dir = TempDir::new().unwrap();
        let store = FileTemplateStore::new(dir.path().join("templates.json"));
        store.append(&template("t1", "alice", &[1]), false).await.unwrap();
        store.append(&template("t2", "bob", &[2]), false).await.unwrap();
        store.append(&template("t3", "alice", &[3]), true).await.unwrap();

        let ids: Vec<String> = store
            .fetch_active_templates()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec!["t2", "t3"]);
    }

    #[tokio::test]
    async fn inactive_users_are_filtered() {
        let dir = TempDir::new().unwrap();
        let store = FileTemplateStore::new(dir.path().join("templates.json"));
        store.append(&template("t1", "alice", &[1]), false).await.unwrap();
        store.append(&template("t2", "bob", &[2]), false).await.unwrap();

        assert!(store.set_user_active("bob", false).await.unwrap());
        assert!(!store.set_user_active("carol", false).await.unwrap());

        let templates = store.fetch_active_templates().await.unwrap();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].user_id, "alice");
        assert_eq!(store.template_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("templates.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let store = FileTemplateStore::new(&path);
        assert!(matches!(
            store.fetch_active_templates().await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn store_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("templates.json");
        let store = FileTemplateStore::new(&path);
        store.append(&template("t1", "alice", &[1]), false).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
