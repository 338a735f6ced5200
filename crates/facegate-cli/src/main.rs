use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// Exit status when the daemon asks the client to back off.
const EXIT_RATE_LIMITED: u8 = 75;

#[zbus::proxy(
    interface = "org.facegate.Facegate1",
    default_service = "org.facegate.Facegate1",
    default_path = "/org/facegate/Facegate1"
)]
trait Facegate {
    fn identify(&self, image: &[u8]) -> zbus::Result<String>;
    fn register(&self, name: &str, image: &[u8]) -> zbus::Result<String>;
    fn list_faces(&self) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facegate", about = "Facegate face enrollment and identification CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify the face in an image
    Identify {
        /// Image file (JPEG, PNG, ...) or a text file holding a data URL
        image: PathBuf,
    },
    /// Register the face in an image under a name
    Register {
        /// Name to enroll the face under
        #[arg(short, long)]
        name: String,
        image: PathBuf,
    },
    /// List enrolled faces
    List,
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            if let Some(message) = rate_limit_message(&err) {
                eprintln!("facegate: too many requests, slow down and try again shortly ({message})");
                return ExitCode::from(EXIT_RATE_LIMITED);
            }
            eprintln!("facegate: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = FacegateProxy::new(&conn).await?;

    let (reply, registration) = match cli.command {
        Commands::Identify { image } => (proxy.identify(&read_image(&image)?).await?, false),
        Commands::Register { name, image } => {
            (proxy.register(&name, &read_image(&image)?).await?, true)
        }
        Commands::List => (proxy.list_faces().await?, false),
        Commands::Status => (proxy.status().await?, false),
    };

    let value: serde_json::Value =
        serde_json::from_str(&reply).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);

    if registration && value["status"] != "success" {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    tracing::debug!(path = %path.display(), bytes = bytes.len(), "image loaded");
    Ok(bytes)
}

fn rate_limit_message(err: &anyhow::Error) -> Option<String> {
    match err.downcast_ref::<zbus::Error>()? {
        zbus::Error::MethodError(name, message, _) if name.as_str().ends_with(".RateLimited") => {
            Some(message.clone().unwrap_or_default())
        }
        _ => None,
    }
}
