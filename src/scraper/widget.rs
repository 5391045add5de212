// Price straight from the embedded widget's messaging protocol.
use crate::config::PriceBand;
use crate::model::{ExtractionError, PriceSample, PriceSource};
use crate::scraper::fetcher::build_client;
use crate::scraper::traits::PriceStrategy;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetRequest {
    pub command: String,
}

impl WidgetRequest {
    pub fn current_price() -> Self {
        Self {
            command: "get-current-price".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WidgetMessage {
    #[serde(rename = "current-price-response")]
    CurrentPrice { price: f64 },
    #[serde(other)]
    Other,
}

/// Transport to the widget: posts one request, returns one message.
#[async_trait]
pub trait WidgetChannel: Send + Sync {
    async fn request(&self, req: &WidgetRequest) -> Result<WidgetMessage, ExtractionError>;
}

/// Relays widget messages through an HTTP bridge running next to the page.
pub struct HttpWidgetChannel {
    client: Client,
    url: String,
}

impl HttpWidgetChannel {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ExtractionError> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl WidgetChannel for HttpWidgetChannel {
    async fn request(&self, req: &WidgetRequest) -> Result<WidgetMessage, ExtractionError> {
        let response = self.client.post(&self.url).json(req).send().await?;
        if !response.status().is_success() {
            return Err(ExtractionError::InvalidResponse(format!(
                "widget bridge returned {}",
                response.status()
            )));
        }
        Ok(response.json::<WidgetMessage>().await?)
    }
}

pub struct WidgetApiStrategy {
    channel: Arc<dyn WidgetChannel>,
    band: PriceBand,
    response_timeout: Duration,
}

impl WidgetApiStrategy {
    pub fn new(channel: Arc<dyn WidgetChannel>, band: PriceBand, response_timeout: Duration) -> Self {
        Self {
            channel,
            band,
            response_timeout,
        }
    }
}

#[async_trait]
impl PriceStrategy for WidgetApiStrategy {
    fn source(&self) -> PriceSource {
        PriceSource::WidgetApi
    }

    async fn sample(&self, _reference: Option<f64>) -> Result<PriceSample, ExtractionError> {
        let request = WidgetRequest::current_price();
        let message = timeout(self.response_timeout, self.channel.request(&request))
            .await
            .map_err(|_| ExtractionError::Timeout("widget price response"))??;

        match message {
            WidgetMessage::CurrentPrice { price } if self.band.contains(price) => {
                debug!("Widget reported {}", price);
                Ok(PriceSample::new(price, PriceSource::WidgetApi))
            }
            WidgetMessage::CurrentPrice { price } => Err(ExtractionError::OutOfBand {
                value: price,
                min: self.band.min,
                max: self.band.max,
            }),
            WidgetMessage::Other => Err(ExtractionError::InvalidResponse(
                "widget answered with a different message type".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedChannel(WidgetMessage);

    #[async_trait]
    impl WidgetChannel for FixedChannel {
        async fn request(&self, req: &WidgetRequest) -> Result<WidgetMessage, ExtractionError> {
            assert_eq!(req.command, "get-current-price");
            Ok(self.0.clone())
        }
    }

    struct SilentChannel;

    #[async_trait]
    impl WidgetChannel for SilentChannel {
        async fn request(&self, _req: &WidgetRequest) -> Result<WidgetMessage, ExtractionError> {
            std::future::pending().await
        }
    }

    fn strategy(channel: impl WidgetChannel + 'static) -> WidgetApiStrategy {
        WidgetApiStrategy::new(
            Arc::new(channel),
            PriceBand::new(500.0, 5000.0),
            Duration::from_secs(2),
        )
    }

    #[test]
    fn protocol_messages_match_the_widget_format() {
        let req = serde_json::to_string(&WidgetRequest::current_price()).unwrap();
        assert_eq!(req, r#"{"command":"get-current-price"}"#);

        let msg: WidgetMessage =
            serde_json::from_str(r#"{"type":"current-price-response","price":3061.2}"#).unwrap();
        assert_eq!(msg, WidgetMessage::CurrentPrice { price: 3061.2 });

        let other: WidgetMessage = serde_json::from_str(r#"{"type":"ready"}"#).unwrap();
        assert_eq!(other, WidgetMessage::Other);
    }

    #[tokio::test]
    async fn plausible_price_becomes_a_sample() {
        let sample = strategy(FixedChannel(WidgetMessage::CurrentPrice { price: 3061.2 }))
            .sample(None)
            .await
            .unwrap();
        assert_eq!(sample.value, 3061.2);
        assert_eq!(sample.source, PriceSource::WidgetApi);
    }

    #[tokio::test]
    async fn implausible_price_is_rejected() {
        let err = strategy(FixedChannel(WidgetMessage::CurrentPrice { price: 12.0 }))
            .sample(None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::OutOfBand { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_widget_times_out() {
        let err = strategy(SilentChannel).sample(None).await.unwrap_err();
        assert!(matches!(err, ExtractionError::Timeout(_)));
    }
}
