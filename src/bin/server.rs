use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use burrow::server::{self, ServerConfig};
use burrow::{config, logging};

#[derive(Parser)]
#[command(name = "burrow-server", about = "Transparent tunneling proxy server")]
struct Args {
    /// Path to the config file.
    #[arg(short = 'c', long = "config", default_value = "server.scf")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut cfg = ServerConfig::default();
    config::load(&mut cfg, &args.config)?;
    logging::init(cfg.log_file.as_deref(), cfg.log_level)?;

    tracing::info!("start");
    server::run(cfg).await?;
    tracing::info!("exit");
    Ok(())
}
