//! Availability probe for anonymously served resources.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe request failed: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for ProbeError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Issues the status-only GET the gate uses to decide whether a public
/// resource can be served without a session.
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn status(&self, url: &str) -> Result<u16, ProbeError>;
}

pub struct HttpResourceProbe {
    http: reqwest::Client,
}

impl HttpResourceProbe {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ResourceProbe for HttpResourceProbe {
    async fn status(&self, url: &str) -> Result<u16, ProbeError> {
        let response = self.http.get(url).send().await?;
        Ok(response.status().as_u16())
    }
}
