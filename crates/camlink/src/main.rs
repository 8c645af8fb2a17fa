//! camlink: client for a remote camera's live video and two-way audio.
//!
//! ## Modes
//! - `run`: negotiate WebRTC video (falling back to still frames) and open the audio channel;
//!   listen/talk are toggled from stdin.
//! - `listen`: audio only, play the camera microphone until Ctrl-C.
//! - `devices`: list audio devices for `--device` / `--input-device`.

mod cli;
mod config;
mod runtime;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,camlink=info")),
        )
        .init();

    match args.cmd {
        cli::Command::Devices => runtime::list_devices(),
        cli::Command::Listen => {
            let config = resolve_config(&args.conn)?;
            runtime::run_listen(config).await
        }
        cli::Command::Run { no_video, frame_out } => {
            let config = resolve_config(&args.conn)?;
            runtime::run_client(
                config,
                runtime::RunOptions {
                    video: !no_video,
                    frame_out,
                },
            )
            .await
        }
    }
}

fn resolve_config(conn: &cli::ConnectionArgs) -> Result<config::ClientConfig> {
    let file = config::FileConfig::discover(conn.config.as_ref())?;
    let config = config::ClientConfig::resolve(conn, file)?;
    tracing::info!(
        server = %config.server,
        output = config.output_device.as_deref().unwrap_or("default"),
        input = config.input_device.as_deref().unwrap_or("default"),
        "client config"
    );
    Ok(config)
}
