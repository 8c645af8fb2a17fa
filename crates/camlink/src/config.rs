//! Configuration loading and resolution.
//!
//! The TOML file supplies defaults; command-line flags win over it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use camlink_audio::config::AudioConfig;
use camlink_transport::{ReconnectPolicy, SocketIoConfig};
use camlink_video::{FallbackConfig, VideoConfig};
use serde::Deserialize;
use url::Url;

use crate::cli::ConnectionArgs;

/// Client configuration as written in TOML. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Camera base URL.
    pub server: Option<String>,
    pub token: Option<String>,
    pub output_device: Option<String>,
    pub input_device: Option<String>,
    /// Playback volume in percent.
    pub volume: Option<u8>,
    /// STUN/TURN urls for the peer connection.
    pub ice_servers: Option<Vec<String>>,
    pub video: Option<VideoSection>,
    pub channel: Option<ChannelSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VideoSection {
    pub max_retries: Option<u32>,
    pub retry_base_ms: Option<u64>,
    pub disconnect_delay_ms: Option<u64>,
    pub fallback_probe_secs: Option<u64>,
    pub fallback_interval_ms: Option<u64>,
}

/// Event channel reconnection settings.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelSection {
    pub reconnect_initial_ms: Option<u64>,
    pub reconnect_max_ms: Option<u64>,
    pub reconnect_attempts: Option<u32>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        toml::from_str::<FileConfig>(&raw).with_context(|| format!("parse config {:?}", path))
    }

    /// Load `path`, or `config.toml` beside the executable when it exists, or nothing.
    pub fn discover(path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let auto_path = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("config.toml")));
        match auto_path {
            Some(path) if path.exists() => {
                tracing::info!(path = ?path, "using config beside executable");
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }
}

/// Fully resolved client settings.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub server: Url,
    pub token: Option<String>,
    pub output_device: Option<String>,
    pub input_device: Option<String>,
    pub ice_servers: Vec<String>,
    pub audio: AudioConfig,
    pub video: VideoConfig,
    pub fallback: FallbackConfig,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    pub fn resolve(args: &ConnectionArgs, file: FileConfig) -> Result<Self> {
        let server = args
            .server
            .clone()
            .or(file.server)
            .ok_or_else(|| anyhow!("camera url is required; use --server or set `server` in the config"))?;
        let server = Url::parse(server.trim()).with_context(|| format!("parse server url {server}"))?;

        let mut audio = AudioConfig::default();
        if let Some(percent) = args.volume.or(file.volume) {
            audio.initial_volume = f32::from(percent.min(100)) / 100.0;
        }

        let mut video = VideoConfig::default();
        let mut fallback = FallbackConfig::default();
        if let Some(section) = file.video {
            if let Some(n) = section.max_retries {
                video.max_retries = n;
            }
            if let Some(ms) = section.retry_base_ms {
                video.retry_base = Duration::from_millis(ms);
            }
            if let Some(ms) = section.disconnect_delay_ms {
                video.disconnect_delay = Duration::from_millis(ms);
            }
            if let Some(secs) = section.fallback_probe_secs {
                video.fallback_probe = Duration::from_secs(secs.max(1));
            }
            if let Some(ms) = section.fallback_interval_ms {
                fallback.interval = Duration::from_millis(ms.max(1));
            }
        }

        let mut reconnect = ReconnectPolicy::default();
        if let Some(section) = file.channel {
            if let Some(ms) = section.reconnect_initial_ms {
                reconnect.initial = Duration::from_millis(ms);
            }
            if let Some(ms) = section.reconnect_max_ms {
                reconnect.max = Duration::from_millis(ms);
            }
            if section.reconnect_attempts.is_some() {
                reconnect.max_attempts = section.reconnect_attempts;
            }
        }

        Ok(Self {
            server,
            token: normalize(args.token.clone()).or_else(|| normalize(file.token)),
            output_device: normalize(args.device.clone()).or_else(|| normalize(file.output_device)),
            input_device: normalize(args.input_device.clone())
                .or_else(|| normalize(file.input_device)),
            ice_servers: file.ice_servers.unwrap_or_default(),
            audio,
            video,
            fallback,
            reconnect,
        })
    }

    pub fn socket_io(&self) -> SocketIoConfig {
        let mut config = SocketIoConfig::new(self.server.clone());
        config.token = self.token.clone();
        config.reconnect = self.reconnect.clone();
        config
    }
}

/// Trim, and treat blank as unset.
fn normalize(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> FileConfig {
        toml::from_str(raw).unwrap()
    }

    #[test]
    fn flags_override_file() {
        let file = parse(
            r#"
            server = "https://file.local"
            token = "from-file"
            output_device = "Speakers"
            volume = 30
            "#,
        );
        let args = ConnectionArgs {
            server: Some("https://flag.local:8443".to_string()),
            volume: Some(90),
            ..Default::default()
        };
        let cfg = ClientConfig::resolve(&args, file).unwrap();
        assert_eq!(cfg.server.as_str(), "https://flag.local:8443/");
        assert_eq!(cfg.token.as_deref(), Some("from-file"));
        assert_eq!(cfg.output_device.as_deref(), Some("Speakers"));
        assert!((cfg.audio.initial_volume - 0.9).abs() < 1e-6);
    }

    #[test]
    fn missing_server_is_an_error() {
        let err = ClientConfig::resolve(&ConnectionArgs::default(), FileConfig::default()).unwrap_err();
        assert!(err.to_string().contains("--server"));
    }

    #[test]
    fn blank_device_names_are_unset() {
        let args = ConnectionArgs {
            server: Some("http://cam".to_string()),
            device: Some("   ".to_string()),
            input_device: Some("  USB  Mic ".to_string()),
            ..Default::default()
        };
        let cfg = ClientConfig::resolve(&args, FileConfig::default()).unwrap();
        assert_eq!(cfg.output_device, None);
        assert_eq!(cfg.input_device.as_deref(), Some("USB  Mic"));
    }

    #[test]
    fn video_section_tunes_retry_policy() {
        let file = parse(
            r#"
            server = "http://cam"
            ice_servers = ["stun:stun.example:3478"]

            [video]
            max_retries = 3
            retry_base_ms = 500
            fallback_interval_ms = 1000

            [channel]
            reconnect_attempts = 10
            "#,
        );
        let cfg = ClientConfig::resolve(&ConnectionArgs::default(), file).unwrap();
        assert_eq!(cfg.video.max_retries, 3);
        assert_eq!(cfg.video.backoff(3), Duration::from_secs(2));
        assert_eq!(cfg.video.disconnect_delay, Duration::from_secs(5));
        assert_eq!(cfg.fallback.interval, Duration::from_secs(1));
        assert_eq!(cfg.reconnect.max_attempts, Some(10));
        assert_eq!(cfg.ice_servers.len(), 1);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<FileConfig>("sever = \"typo\"").is_err());
    }
}
