use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.likeness.Likeness1",
    default_service = "org.likeness.Likeness1",
    default_path = "/org/likeness/Likeness1"
)]
trait Likeness {
    fn register(&self, image: &[u8], name: &str, description: &str) -> zbus::Result<u64>;
    fn recognize(&self, image: &[u8]) -> zbus::Result<String>;
    fn detect(&self, image: &[u8]) -> zbus::Result<String>;
    fn list_identities(&self) -> zbus::Result<String>;
    fn delete_identity(&self, id: u64) -> zbus::Result<bool>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "likeness", about = "Likeness face registration and recognition CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the single face in an image under a name
    Register {
        /// Image file (JPEG, PNG, ...)
        image: PathBuf,
        /// Identity name; re-registering an existing name updates it
        #[arg(short, long)]
        name: String,
        /// Free-text description
        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// Recognize every face in an image
    Recognize {
        /// Image file (JPEG, PNG, ...)
        image: PathBuf,
    },
    /// Locate faces in an image without matching them
    Detect {
        /// Image file (JPEG, PNG, ...)
        image: PathBuf,
    },
    /// List registered identities
    List,
    /// Delete a registered identity
    Delete {
        /// Identity ID to delete
        id: u64,
    },
    /// Show daemon status
    Status,
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

/// Re-indent a JSON string returned by the daemon.
fn pretty(json: &str) -> String {
    serde_json::from_str::<serde_json::Value>(json)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| json.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let connection = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = LikenessProxy::new(&connection)
        .await
        .context("likenessd is not reachable")?;

    match cli.command {
        Commands::Register {
            image,
            name,
            description,
        } => {
            let bytes = read_image(&image)?;
            tracing::debug!(path = %image.display(), bytes = bytes.len(), "sending register");
            let id = proxy.register(&bytes, &name, &description).await?;
            println!("Registered {name} as identity {id}");
        }
        Commands::Recognize { image } => {
            let bytes = read_image(&image)?;
            let results = proxy.recognize(&bytes).await?;
            println!("{}", pretty(&results));
        }
        Commands::Detect { image } => {
            let bytes = read_image(&image)?;
            let faces = proxy.detect(&bytes).await?;
            println!("{}", pretty(&faces));
        }
        Commands::List => {
            let identities = proxy.list_identities().await?;
            println!("{}", pretty(&identities));
        }
        Commands::Delete { id } => {
            proxy.delete_identity(id).await?;
            println!("Deleted identity {id}");
        }
        Commands::Status => {
            println!("{}", pretty(&proxy.status().await?));
        }
    }

    Ok(())
}
