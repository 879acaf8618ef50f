//! Field Agent - Main entry point

use anyhow::Result;
use clap::Parser;
use field_agent::{config::Config, daemon, utils};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Run one sync and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level, &config.log.format)?;

    config.validate()?;

    tracing::info!(
        "Starting field-agent v{} (agent_id: {})",
        env!("CARGO_PKG_VERSION"),
        config.agent.id
    );

    if args.once {
        let result = daemon::run_once(&config).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        if !result.success {
            anyhow::bail!("sync finished with {} failed file(s)", result.files_failed);
        }
        return Ok(());
    }

    let port = args.port.unwrap_or(config.agent.port);
    daemon::run(config, port).await
}
