//! Offer/answer exchange with the device's negotiation endpoint.

use async_trait::async_trait;
use camlink_types::{OfferAnswer, OfferRequest};
use url::Url;

use crate::error::VideoError;

/// Remote side of session negotiation.
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Submit a local offer; returns the device's answer and the session id it issued.
    async fn post_offer(&self, offer: OfferRequest) -> Result<OfferAnswer, VideoError>;

    /// Release the server-side session `pc_id`.
    async fn release(&self, pc_id: &str) -> Result<(), VideoError>;
}

/// `POST /api/webrtc/offer` and `DELETE /api/webrtc/{pc_id}` over HTTP.
pub struct HttpSignaling {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl HttpSignaling {
    pub fn new(base: Url, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: with_trailing_slash(base),
            token,
        }
    }

    fn offer_url(&self) -> Result<Url, VideoError> {
        Ok(self.base.join("api/webrtc/offer")?)
    }

    fn session_url(&self, pc_id: &str) -> Result<Url, VideoError> {
        let mut url = self.base.join("api/webrtc/")?;
        url.path_segments_mut()
            .map_err(|_| VideoError::Negotiation(format!("base url cannot hold a path: {}", self.base)))?
            .pop_if_empty()
            .push(pc_id);
        Ok(url)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl Signaling for HttpSignaling {
    async fn post_offer(&self, offer: OfferRequest) -> Result<OfferAnswer, VideoError> {
        let url = self.offer_url()?;
        tracing::debug!(%url, sdp_len = offer.sdp.len(), "posting offer");
        let resp = self
            .authorize(self.client.post(url))
            .json(&offer)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(VideoError::Status(resp.status()));
        }
        let answer: OfferAnswer = resp.json().await?;
        tracing::debug!(pc_id = %answer.pc_id, "offer answered");
        Ok(answer)
    }

    async fn release(&self, pc_id: &str) -> Result<(), VideoError> {
        let url = self.session_url(pc_id)?;
        let resp = self.authorize(self.client.delete(url)).send().await?;
        if !resp.status().is_success() {
            return Err(VideoError::Status(resp.status()));
        }
        Ok(())
    }
}

/// `Url::join` drops the last path segment unless the base ends in `/`.
pub(crate) fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_resolve_against_host_root() {
        let sig = HttpSignaling::new(Url::parse("http://cam.local:8080").unwrap(), None);
        assert_eq!(sig.offer_url().unwrap().as_str(), "http://cam.local:8080/api/webrtc/offer");
        assert_eq!(
            sig.session_url("abc-123").unwrap().as_str(),
            "http://cam.local:8080/api/webrtc/abc-123"
        );
    }

    #[test]
    fn endpoints_keep_base_path_prefix() {
        let sig = HttpSignaling::new(Url::parse("https://gw.example/cam").unwrap(), None);
        assert_eq!(sig.offer_url().unwrap().as_str(), "https://gw.example/cam/api/webrtc/offer");
    }

    #[test]
    fn session_id_is_escaped_as_one_segment() {
        let sig = HttpSignaling::new(Url::parse("http://cam.local/").unwrap(), None);
        assert_eq!(
            sig.session_url("a/b c").unwrap().as_str(),
            "http://cam.local/api/webrtc/a%2Fb%20c"
        );
    }
}
