// Price text scraped from the widget's rendered markup.
use crate::config::PriceBand;
use crate::model::{ExtractionError, PriceSample, PriceSource};
use crate::scraper::fetcher::DomSource;
use crate::scraper::traits::PriceStrategy;

use async_trait::async_trait;
use regex::Regex;
use ::scraper::{Html, Selector};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct DomScrapeStrategy {
    source: Arc<dyn DomSource>,
    selectors: Vec<(String, Selector)>,
    number: Regex,
    band: PriceBand,
}

impl DomScrapeStrategy {
    /// Selectors are tried in the given order; ones that fail to parse are skipped.
    pub fn new(
        source: Arc<dyn DomSource>,
        selectors: &[String],
        band: PriceBand,
    ) -> Result<Self, ExtractionError> {
        let mut parsed = Vec::new();
        for raw in selectors {
            match Selector::parse(raw) {
                Ok(sel) => parsed.push((raw.clone(), sel)),
                Err(e) => warn!("Skipping invalid selector {:?}: {}", raw, e),
            }
        }
        if parsed.is_empty() {
            return Err(ExtractionError::InvalidResponse(
                "no usable DOM selectors configured".into(),
            ));
        }

        Ok(Self {
            source,
            selectors: parsed,
            number: Regex::new(r"\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?")?,
            band,
        })
    }

    /// First selector whose text holds a number wins.
    pub fn parse_html(&self, html: &str) -> Option<f64> {
        let document = Html::parse_document(html);

        for (raw, selector) in &self.selectors {
            for element in document.select(selector) {
                let text = element.text().collect::<String>();
                if let Some(value) = self.parse_price_text(&text) {
                    debug!("Selector {} yielded {}", raw, value);
                    return Some(value);
                }
            }
        }

        None
    }

    fn parse_price_text(&self, text: &str) -> Option<f64> {
        let m = self.number.find(text.trim())?;
        m.as_str().replace(',', "").parse::<f64>().ok()
    }
}

#[async_trait]
impl PriceStrategy for DomScrapeStrategy {
    fn source(&self) -> PriceSource {
        PriceSource::DomScrape
    }

    async fn sample(&self, _reference: Option<f64>) -> Result<PriceSample, ExtractionError> {
        let html = self.source.snapshot().await?;
        let value = self.parse_html(&html).ok_or(ExtractionError::NoCandidate)?;

        if !self.band.contains(value) {
            return Err(ExtractionError::OutOfBand {
                value,
                min: self.band.min,
                max: self.band.max,
            });
        }

        Ok(PriceSample::new(value, PriceSource::DomScrape))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticDom(&'static str);

    #[async_trait]
    impl DomSource for StaticDom {
        async fn snapshot(&self) -> Result<String, ExtractionError> {
            Ok(self.0.to_string())
        }
    }

    fn strategy(html: &'static str) -> DomScrapeStrategy {
        let selectors = vec![
            ".price-axis__last-value".to_string(),
            "div[[broken".to_string(),
            ".js-symbol-last".to_string(),
        ];
        DomScrapeStrategy::new(
            Arc::new(StaticDom(html)),
            &selectors,
            PriceBand::new(500.0, 5000.0),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn selectors_are_tried_in_priority_order() {
        let html = r#"<html><body>
            <span class="js-symbol-last">3059.90</span>
            <div class="price-axis__last-value"> 3,061.20 </div>
        </body></html>"#;
        let sample = strategy(html).sample(None).await.unwrap();
        assert_eq!(sample.value, 3061.2);
        assert_eq!(sample.source, PriceSource::DomScrape);
    }

    #[tokio::test]
    async fn falls_through_to_the_next_selector_when_text_is_not_numeric() {
        let html = r#"<div class="price-axis__last-value">n/a</div>
            <span class="js-symbol-last">3059.9</span>"#;
        assert_eq!(strategy(html).sample(None).await.unwrap().value, 3059.9);
    }

    #[tokio::test]
    async fn missing_or_implausible_price_is_an_error() {
        let err = strategy("<p>loading</p>").sample(None).await.unwrap_err();
        assert!(matches!(err, ExtractionError::NoCandidate));

        let err = strategy(r#"<span class="js-symbol-last">42</span>"#)
            .sample(None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::OutOfBand { .. }));
    }

    #[test]
    fn rejects_a_config_without_valid_selectors() {
        let result = DomScrapeStrategy::new(
            Arc::new(StaticDom("")),
            &["[[".to_string()],
            PriceBand::new(500.0, 5000.0),
        );
        assert!(result.is_err());
    }
}
