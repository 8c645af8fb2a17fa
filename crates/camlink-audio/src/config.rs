use camlink_types::WIRE_SAMPLE_RATE;

/// Audio tuning shared by capture, playback and the session.
#[derive(Clone, Debug)]
pub struct AudioConfig {
    /// Rate of audio on the wire (Hz).
    pub wire_rate: u32,
    /// Capture frame size in device-rate samples; one chunk is emitted per frame.
    pub capture_frame: usize,
    /// Playback volume applied before any `set_volume` call.
    pub initial_volume: f32,
}

impl Default for AudioConfig {
    /// Matches the device's 16 kHz mono stream with ~85-93 ms capture frames.
    fn default() -> Self {
        Self {
            wire_rate: WIRE_SAMPLE_RATE,
            capture_frame: 4096,
            initial_volume: 0.8,
        }
    }
}
