#[derive(Debug, thiserror::Error)]
pub enum VideoError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("endpoint returned {0}")]
    Status(reqwest::StatusCode),
    #[error("webrtc: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("negotiation: {0}")]
    Negotiation(String),
}
