//! Input/output device discovery and selection.
//!
//! Thin wrappers around CPAL for:
//! - listing available devices in both directions
//! - selecting either the default device or a device by substring match
//! - choosing a stream config close to the wire rate

use cpal::traits::{DeviceTrait, HostTrait};

/// Which side of the host a device belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Input => f.pad("input"),
            Direction::Output => f.pad("output"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("no {0} device matched: {1}")]
    NotFound(Direction, String),
    #[error("no default {0} device")]
    NoDefault(Direction),
    #[error("no supported {0} configs")]
    NoConfig(Direction),
    #[error("audio backend: {0}")]
    Backend(String),
}

fn backend(err: impl std::fmt::Display) -> DeviceError {
    DeviceError::Backend(err.to_string())
}

/// Pick the first device in `direction` whose name contains `needle` (case-insensitive), or the
/// host default device when `needle` is `None`.
pub fn pick_device(
    host: &cpal::Host,
    direction: Direction,
    needle: Option<&str>,
) -> Result<cpal::Device, DeviceError> {
    if let Some(needle) = needle {
        let mut devices: Vec<cpal::Device> = match direction {
            Direction::Input => host.input_devices().map_err(backend)?.collect(),
            Direction::Output => host.output_devices().map_err(backend)?.collect(),
        };
        return devices
            .drain(..)
            .find(|d| {
                d.description()
                    .ok()
                    .map(|n| matches_device_name(&n.name(), needle))
                    .unwrap_or(false)
            })
            .ok_or_else(|| DeviceError::NotFound(direction, needle.to_string()));
    }

    let default = match direction {
        Direction::Input => host.default_input_device(),
        Direction::Output => host.default_output_device(),
    };
    default.ok_or(DeviceError::NoDefault(direction))
}

/// Choose the stream config closest to `target_rate`.
///
/// Prefers the highest supported rate that is `<= target_rate`; if none are, the lowest rate
/// above it. Ties are broken by sample format (`f32` first).
pub fn pick_config(
    device: &cpal::Device,
    direction: Direction,
    target_rate: u32,
) -> Result<cpal::SupportedStreamConfig, DeviceError> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = match direction {
        Direction::Input => device.supported_input_configs().map_err(backend)?.collect(),
        Direction::Output => device.supported_output_configs().map_err(backend)?.collect(),
    };

    let mut best: Option<(Candidate, cpal::SupportedStreamConfig)> = None;
    for range in ranges {
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let candidate = Candidate {
            below: rate <= target_rate,
            rate,
            format_rank: sample_format_rank(range.sample_format()),
        };
        let replace = match &best {
            None => true,
            Some((current, _)) => candidate.is_better_than(current, target_rate),
        };
        if replace {
            best = Some((candidate, range.with_sample_rate(rate)));
        }
    }

    best.map(|(_, cfg)| cfg).ok_or(DeviceError::NoConfig(direction))
}

/// Device buffer size we ask for when the device lets us choose.
pub const TARGET_BUFFER_FRAMES: u32 = 1_024;

/// Prefer a fixed buffer size if the device advertises one, near [`TARGET_BUFFER_FRAMES`].
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            Some(cpal::BufferSize::Fixed(buffer_frames_in_range(*min, *max)))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

fn buffer_frames_in_range(min: u32, max: u32) -> u32 {
    TARGET_BUFFER_FRAMES.min(max).max(min)
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    below: bool,
    rate: u32,
    format_rank: u8,
}

impl Candidate {
    fn is_better_than(&self, best: &Candidate, target: u32) -> bool {
        if self.below != best.below {
            self.below
        } else if self.rate != best.rate {
            if self.below {
                self.rate > best.rate
            } else {
                self.rate.abs_diff(target) < best.rate.abs_diff(target)
            }
        } else {
            self.format_rank < best.format_rank
        }
    }
}

fn pick_rate_for_range(min: u32, max: u32, target: u32) -> u32 {
    target.clamp(min, max.max(min))
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

/// Device metadata for `camlink devices`.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub direction: Direction,
    pub name: String,
    pub is_default: bool,
    pub min_rate: u32,
    pub max_rate: u32,
}

/// Enumerate input and output devices on `host`.
pub fn list_devices(host: &cpal::Host) -> Result<Vec<DeviceInfo>, DeviceError> {
    let default_in = host
        .default_input_device()
        .and_then(|d| d.description().ok())
        .map(|d| d.name().to_string());
    let default_out = host
        .default_output_device()
        .and_then(|d| d.description().ok())
        .map(|d| d.name().to_string());

    let mut out = Vec::new();
    for (direction, devices, default) in [
        (
            Direction::Input,
            host.input_devices().map_err(backend)?.collect::<Vec<_>>(),
            default_in,
        ),
        (
            Direction::Output,
            host.output_devices().map_err(backend)?.collect::<Vec<_>>(),
            default_out,
        ),
    ] {
        for d in devices {
            let Ok(desc) = d.description() else {
                continue;
            };
            let name = desc.name().to_string();
            let ranges: Vec<cpal::SupportedStreamConfigRange> = match direction {
                Direction::Input => d.supported_input_configs().map(|r| r.collect()),
                Direction::Output => d.supported_output_configs().map(|r| r.collect()),
            }
            .unwrap_or_default();
            let Some((min_rate, max_rate)) = rate_span(&ranges) else {
                tracing::debug!(device = %name, %direction, "skipping device without usable configs");
                continue;
            };
            out.push(DeviceInfo {
                direction,
                is_default: default.as_deref() == Some(name.as_str()),
                name,
                min_rate,
                max_rate,
            });
        }
    }
    Ok(out)
}

fn rate_span(ranges: &[cpal::SupportedStreamConfigRange]) -> Option<(u32, u32)> {
    let min = ranges.iter().map(|r| r.min_sample_rate()).min()?;
    let max = ranges.iter().map(|r| r.max_sample_rate()).max()?;
    (min > 0 && max >= min).then_some((min, max))
}

pub(crate) fn device_name(device: &cpal::Device) -> String {
    device
        .description()
        .map(|d| d.name().to_string())
        .unwrap_or_else(|_| "<unknown>".to_string())
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}
