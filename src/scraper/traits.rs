use crate::model::{ExtractionError, PriceSample, PriceSource};

/// One independent way of reading the live price.
#[async_trait::async_trait]
pub trait PriceStrategy: Send + Sync {
    fn source(&self) -> PriceSource;

    /// `reference` is the last canonical price, used to disambiguate candidates.
    async fn sample(&self, reference: Option<f64>) -> Result<PriceSample, ExtractionError>;

    /// Called when the feed has gone stale; bounded strategies may re-arm here.
    fn on_stale(&self) {}
}
