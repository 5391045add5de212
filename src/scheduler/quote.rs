use crate::model::FetchError;
use crate::scraper::fetcher::build_client;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Remote price used when the live feed has nothing fresh.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn fetch_quote(&self, symbol: &str) -> Result<f64, FetchError>;
}

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    price: f64,
}

pub struct HttpQuoteSource {
    client: Client,
    url_template: String,
}

impl HttpQuoteSource {
    /// `url_template` contains `{symbol}`, e.g. `https://quotes.local/v1/{symbol}`.
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        Ok(Self {
            client: build_client(timeout)?,
            url_template: url_template.into(),
        })
    }

    pub fn quote_url(&self, symbol: &str) -> String {
        self.url_template.replace("{symbol}", symbol)
    }
}

pub fn parse_quote(body: &str) -> Result<f64, FetchError> {
    let parsed: QuoteResponse =
        serde_json::from_str(body).map_err(|e| FetchError::InvalidResponse(e.to_string()))?;
    if !parsed.price.is_finite() {
        return Err(FetchError::InvalidResponse(format!(
            "non-finite price {}",
            parsed.price
        )));
    }
    Ok(parsed.price)
}

#[async_trait]
impl QuoteSource for HttpQuoteSource {
    async fn fetch_quote(&self, symbol: &str) -> Result<f64, FetchError> {
        let url = self.quote_url(symbol);
        debug!("Fetching quote: {}", url);

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::HttpError(format!(
                "quote endpoint returned {}",
                response.status()
            )));
        }

        let body = response.text().await?;
        parse_quote(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_is_substituted_into_the_url() {
        let source =
            HttpQuoteSource::new("https://quotes.local/v1/{symbol}/last", Duration::from_secs(1))
                .unwrap();
        assert_eq!(
            source.quote_url("XAUUSD"),
            "https://quotes.local/v1/XAUUSD/last"
        );
    }

    #[test]
    fn quote_body_must_carry_a_price() {
        assert_eq!(parse_quote(r#"{"price": 3061.2, "bid": 3061.0}"#).unwrap(), 3061.2);
        assert!(matches!(
            parse_quote(r#"{"last": 3061.2}"#),
            Err(FetchError::InvalidResponse(_))
        ));
        assert!(parse_quote("<html>").is_err());
    }
}
