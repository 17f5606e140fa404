use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use gatehouse::config::Config;
use gatehouse::server;

#[derive(Parser)]
#[command(name = "gatehouse")]
#[command(version, about = "Control plane and reverse proxy for the heron gateway")]
struct Cli {
    /// Port the wrapper listens on
    #[arg(short, long, env = "PORT", default_value = "3000")]
    port: u16,

    /// Persistent volume holding the agent home directory
    #[arg(long, env = "GATEHOUSE_HOME", default_value = "/data")]
    home: PathBuf,

    /// Directory of onboarding templates shipped with the image
    #[arg(long, env = "GATEHOUSE_SETUP_DIR", default_value = "/app/setup")]
    setup_dir: PathBuf,

    /// Enable dev mode (CORS permissive for a local UI dev server)
    #[arg(long)]
    dev: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::new(cli.home, cli.setup_dir, cli.port, cli.dev);
    server::start_server(config).await
}
