use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::time::Instant;
use vigil_core::{Frame, FrameSource};

/// Latest-frame source backed by a JPEG that an external capture helper
/// keeps overwriting. The file's mtime is taken as the capture time.
pub struct SnapshotFrameSource {
    path: PathBuf,
}

impl SnapshotFrameSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> std::io::Result<Frame> {
        let modified = tokio::fs::metadata(&self.path).await?.modified()?;
        let jpeg = tokio::fs::read(&self.path).await?;
        // Clock skew into the future reads as "just captured".
        let age = SystemTime::now().duration_since(modified).unwrap_or_default();
        let now = Instant::now();
        Ok(Frame {
            jpeg,
            captured_at: now.checked_sub(age).unwrap_or(now),
        })
    }
}

impl FrameSource for SnapshotFrameSource {
    async fn current_frame(&self) -> Option<Frame> {
        match self.read().await {
            Ok(frame) if !frame.jpeg.is_empty() => Some(frame),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(path = %self.path.display(), error = %e, "no camera frame available");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn missing_file_is_no_frame() {
        let dir = tempfile::tempdir().unwrap();
        let source = SnapshotFrameSource::new(dir.path().join("frame.jpg"));
        assert!(source.current_frame().await.is_none());
    }

    #[tokio::test]
    async fn empty_file_is_no_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.jpg");
        std::fs::write(&path, b"").unwrap();
        assert!(SnapshotFrameSource::new(&path).current_frame().await.is_none());
    }

    #[tokio::test]
    async fn fresh_file_is_recent_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.jpg");
        std::fs::write(&path, [0xFF, 0xD8, 0xFF, 0xD9]).unwrap();

        let frame = SnapshotFrameSource::new(&path).current_frame().await.unwrap();
        assert_eq!(frame.jpeg, vec![0xFF, 0xD8, 0xFF, 0xD9]);
        assert!(frame.captured_at.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn old_file_reports_its_age() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.jpg");
        std::fs::write(&path, [0xFF, 0xD8]).unwrap();
        let a_minute_ago = SystemTime::now() - Duration::from_secs(60);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(a_minute_ago)
            .unwrap();

        let frame = SnapshotFrameSource::new(&path).current_frame().await.unwrap();
        assert!(frame.captured_at.elapsed() >= Duration::from_secs(50));
    }
}
