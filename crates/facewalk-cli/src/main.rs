use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facewalk_core::FaceAlbum;

#[zbus::proxy(
    interface = "org.freedesktop.FaceWalk1",
    default_service = "org.freedesktop.FaceWalk1",
    default_path = "/org/freedesktop/FaceWalk1"
)]
trait FaceWalk {
    async fn status(&self) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn merge_identities(&self, target: &str, source: &str) -> zbus::Result<u32>;
    async fn erase_face(&self, face_album: &str, face_key: &str) -> zbus::Result<()>;
    async fn attach_client(&self) -> zbus::Result<u64>;
    async fn detach_client(&self, session: u64) -> zbus::Result<bool>;
}

#[derive(Parser)]
#[command(name = "facewalk", about = "FaceWalk face identity CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// List face albums and their face counts
    Identities {
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Fold one identity into another
    Merge {
        /// Identity hash to keep
        target: String,
        /// Identity hash to fold into the target
        source: String,
    },
    /// Remove one face instance from a face album
    Erase {
        /// Face album key (e.g. "face:Ada Lovelace")
        album: String,
        /// Face key of the instance inside that album
        face: String,
    },
    /// Pause background extraction until Ctrl-C
    Hold,
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Status => "status",
            Commands::Identities { .. } => "identities",
            Commands::Merge { .. } => "merge",
            Commands::Erase { .. } => "erase",
            Commands::Hold => "hold",
        }
    }
}

fn format_identities(identities: &[FaceAlbum]) -> String {
    if identities.is_empty() {
        return "No identities".to_string();
    }
    let width = identities.iter().map(|a| a.name.len()).max().unwrap_or(0);
    identities
        .iter()
        .map(|a| {
            let hashes: Vec<&str> = a.hashes.iter().map(|h| h.as_str()).collect();
            format!("{:<width$}  {:>5}  {}", a.name, a.count, hashes.join(","))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let connection = zbus::Connection::session()
        .await
        .context("connecting to the session bus")?;
    tracing::debug!(unique_name = ?connection.unique_name(), "connected to session bus");
    let proxy = FaceWalkProxy::new(&connection)
        .await
        .context("facewalkd is not reachable")?;

    let command = cli.command.name();
    tracing::debug!(command, "sending request to facewalkd");

    match cli.command {
        Commands::Status => {
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Identities { json } => {
            let raw = proxy.list_identities().await?;
            if json {
                println!("{raw}");
            } else {
                let identities: Vec<FaceAlbum> = serde_json::from_str(&raw)?;
                println!("{}", format_identities(&identities));
            }
        }
        Commands::Merge { target, source } => {
            let rewritten = proxy.merge_identities(&target, &source).await?;
            tracing::info!(target = %target, source = %source, rewritten, "identities merged");
            println!("Merged {source} into {target} ({rewritten} faces reassigned)");
        }
        Commands::Erase { album, face } => {
            proxy.erase_face(&album, &face).await?;
            tracing::info!(%album, "face erased");
            println!("Erased face from {album}");
        }
        Commands::Hold => {
            let session = proxy.attach_client().await?;
            tracing::debug!(session, "attached as interactive client");
            println!("Background extraction paused (session {session}); press Ctrl-C to release");
            tokio::signal::ctrl_c().await?;
            let detached = proxy.detach_client(session).await?;
            tracing::debug!(session, detached, "detached");
            println!("Released");
        }
    }
    tracing::debug!(command, "request complete");

    Ok(())
}
