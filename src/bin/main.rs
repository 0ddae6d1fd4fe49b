//! Interstellar binary.
//!
//! This binary runs the server half of the Interstellar call-lifecycle layer
//! and inspects the protocol packages available to the client half.

use clap::Parser;
use interstellar_core::{
    cli::commands::Commands,
    cli::handlers::{handle_describe, handle_packages, handle_serve},
    config::{Args, Settings},
    logging,
};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub args: Args,

    #[command(subcommand)]
    pub command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli.args)?;

    // Held until exit so buffered file output is flushed
    let _guard = logging::init(&settings.logging)?;

    info!("Interstellar starting up");

    match cli.command {
        Commands::Serve(cmd) => handle_serve(settings, cmd).await?,
        Commands::Packages(cmd) => handle_packages(settings, cmd)?,
        Commands::Describe(cmd) => handle_describe(settings, cmd)?,
    }

    Ok(())
}
