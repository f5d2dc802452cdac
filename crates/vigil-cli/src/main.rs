use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use vigil_ipc::{ClientConfig, DetectionClient, DEFAULT_SOCKET_PATH};
use zbus::Connection;

#[zbus::proxy(
    interface = "org.freedesktop.Vigil1",
    default_service = "org.freedesktop.Vigil1",
    default_path = "/org/freedesktop/Vigil1"
)]
trait Vigil {
    async fn authenticate(&self) -> zbus::Result<String>;
    async fn start_monitoring(&self) -> zbus::Result<bool>;
    async fn stop_monitoring(&self) -> zbus::Result<()>;
    async fn clear_lock(&self) -> zbus::Result<()>;
    async fn enroll(&self, user: &str, image_path: &str, replace: bool) -> zbus::Result<String>;
    async fn set_user_active(&self, user: &str, active: bool) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "vigil", about = "Vigil face authentication and presence guard CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authenticate the person in front of the camera
    Authenticate,
    /// Control presence monitoring
    Monitor {
        #[command(subcommand)]
        action: MonitorAction,
    },
    /// Re-arm the guard after the session was unlocked by other means
    ClearLock,
    /// Enroll a face from a JPEG image
    Enroll {
        #[arg(short, long)]
        user: String,
        /// Path to a JPEG containing exactly one face
        #[arg(short, long)]
        image: PathBuf,
        /// Drop the user's earlier templates
        #[arg(long)]
        replace: bool,
    },
    /// Enable or disable an enrolled user
    User {
        #[command(subcommand)]
        action: UserAction,
    },
    /// Show daemon status
    Status,
    /// Check the detection engine directly, bypassing the daemon
    Ping {
        #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
        socket: PathBuf,
    },
}

#[derive(Subcommand)]
enum MonitorAction {
    Start,
    Stop,
}

#[derive(Subcommand)]
enum UserAction {
    Enable { user: String },
    Disable { user: String },
}

async fn daemon(system: bool) -> Result<VigilProxy<'static>> {
    let conn = if system {
        Connection::system().await
    } else {
        Connection::session().await
    }
    .context("connecting to D-Bus")?;
    VigilProxy::new(&conn)
        .await
        .context("vigild is not reachable on D-Bus")
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned malformed JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Authenticate => {
            let report = daemon(cli.system).await?.authenticate().await?;
            print_json(&report)?;
        }
        Commands::Monitor { action: MonitorAction::Start } => {
            if daemon(cli.system).await?.start_monitoring().await? {
                println!("Presence monitoring started");
            } else {
                println!("Monitoring not started (already running, or nobody has authenticated yet)");
            }
        }
        Commands::Monitor { action: MonitorAction::Stop } => {
            daemon(cli.system).await?.stop_monitoring().await?;
            println!("Presence monitoring stopped");
        }
        Commands::ClearLock => {
            daemon(cli.system).await?.clear_lock().await?;
            println!("Lock flag cleared");
        }
        Commands::Enroll { user, image, replace } => {
            // vigild runs with its own working directory.
            let image = std::fs::canonicalize(&image)
                .with_context(|| format!("cannot access {}", image.display()))?;
            let path = image.to_str().context("image path is not valid UTF-8")?;
            let id = daemon(cli.system).await?.enroll(&user, path, replace).await?;
            println!("Enrolled {user}: template {id}");
        }
        Commands::User { action } => {
            let (user, active) = match action {
                UserAction::Enable { user } => (user, true),
                UserAction::Disable { user } => (user, false),
            };
            if daemon(cli.system).await?.set_user_active(&user, active).await? {
                println!("{user}: {}", if active { "enabled" } else { "disabled" });
            } else {
                anyhow::bail!("unknown user: {user}");
            }
        }
        Commands::Status => {
            let status = daemon(cli.system).await?.status().await?;
            print_json(&status)?;
        }
        Commands::Ping { socket } => {
            tracing::debug!(socket = %socket.display(), "pinging detection engine");
            let client = DetectionClient::new(ClientConfig {
                socket_path: socket.clone(),
                ..ClientConfig::default()
            });
            let rtt = client
                .ping()
                .await
                .with_context(|| format!("detection engine at {} did not answer", socket.display()))?;
            println!("Detection engine alive ({} ms)", rtt.as_millis());
        }
    }

    Ok(())
}
