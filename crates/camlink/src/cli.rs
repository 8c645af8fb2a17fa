use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "camlink", version = VERSION, about = "Camera video + two-way audio client")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    #[command(flatten)]
    pub conn: ConnectionArgs,
}

/// Settings shared by every subcommand; each one overrides the config file.
#[derive(ClapArgs, Debug, Default)]
pub struct ConnectionArgs {
    /// TOML config file (defaults to config.toml next to the executable, if present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Camera base URL, e.g. https://cam.local:8443
    #[arg(long, global = true)]
    pub server: Option<String>,

    /// Access token for the camera
    #[arg(long, global = true, env = "CAMLINK_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Output device by substring match
    #[arg(long, global = true)]
    pub device: Option<String>,

    /// Input (microphone) device by substring match
    #[arg(long, global = true)]
    pub input_device: Option<String>,

    /// Playback volume in percent (0-100)
    #[arg(long, global = true, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub volume: Option<u8>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect video and audio; control listen/talk from stdin
    Run {
        /// Audio only
        #[arg(long)]
        no_video: bool,

        /// Write the latest fallback still frame to this path
        #[arg(long)]
        frame_out: Option<PathBuf>,
    },

    /// Listen to the camera microphone until interrupted
    Listen,

    /// List audio input and output devices
    Devices,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_follow_the_subcommand() {
        let args = Args::try_parse_from([
            "camlink",
            "run",
            "--server",
            "https://cam.local",
            "--volume",
            "40",
            "--no-video",
        ])
        .unwrap();
        assert_eq!(args.conn.server.as_deref(), Some("https://cam.local"));
        assert_eq!(args.conn.volume, Some(40));
        assert!(matches!(args.cmd, Command::Run { no_video: true, frame_out: None }));
    }

    #[test]
    fn volume_above_hundred_is_rejected() {
        assert!(Args::try_parse_from(["camlink", "listen", "--volume", "150"]).is_err());
    }
}
