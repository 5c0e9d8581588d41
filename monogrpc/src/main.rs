use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use monogrpc_core::{config::Config, runtime::RuntimeWrapper};
use monogrpc_services::{echo::EchoService, Server};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the config file, TOML or JSON. Defaults apply when omitted.
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::default(),
    };

    let mut runtime =
        RuntimeWrapper::build(&config.runtime).context("failed to build runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    let mut server = Server::new(&[&EchoService], config.server);
    server.start_from_config()?;
    tracing::info!(
        methods = ?server.mapping().paths().collect::<Vec<_>>(),
        "serving, press Ctrl-C to stop"
    );

    monoio::utils::CtrlC::new()?.await;
    tracing::info!("interrupted, shutting down");
    server.close()?;
    server.wait_closed().await?;
    Ok(())
}
