/// Observable state of the video transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VideoState {
    /// Not connected and not trying to be.
    #[default]
    Idle,
    /// Negotiating a new peer session.
    Connecting,
    /// Peer transport reports "connected".
    Connected,
    /// Peer transport dropped; a retry is scheduled.
    Disconnected,
    /// Waiting on a backoff timer.
    Retrying,
    /// Serving still frames; a periodic probe tries peer-to-peer again.
    Fallback,
}

impl VideoState {
    pub fn as_str(self) -> &'static str {
        match self {
            VideoState::Idle => "idle",
            VideoState::Connecting => "connecting",
            VideoState::Connected => "connected",
            VideoState::Disconnected => "disconnected",
            VideoState::Retrying => "retrying",
            VideoState::Fallback => "fallback",
        }
    }
}

impl std::fmt::Display for VideoState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
