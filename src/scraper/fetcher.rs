use crate::model::ExtractionError;

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) TargetSniper/0.1";

pub fn build_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
}

/// Supplies the rendered HTML of the charting widget.
#[async_trait]
pub trait DomSource: Send + Sync {
    async fn snapshot(&self) -> Result<String, ExtractionError>;
}

/// Fetches the rendered widget markup from a snapshot endpoint.
pub struct HttpDomSource {
    client: Client,
    url: String,
}

impl HttpDomSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ExtractionError> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl DomSource for HttpDomSource {
    async fn snapshot(&self) -> Result<String, ExtractionError> {
        let response = self.client.get(&self.url).send().await?;

        if !response.status().is_success() {
            return Err(ExtractionError::InvalidResponse(format!(
                "snapshot returned {}",
                response.status()
            )));
        }

        Ok(response.text().await?)
    }
}
