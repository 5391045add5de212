// Last persisted price, used when every live source is down.
use crate::model::{ExtractionError, PriceSample, PriceSource};
use crate::scraper::traits::PriceStrategy;
use crate::storage::SqliteStorage;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub struct CachedFallbackStrategy {
    storage: Arc<Mutex<SqliteStorage>>,
    symbol: String,
}

impl CachedFallbackStrategy {
    pub fn new(storage: Arc<Mutex<SqliteStorage>>, symbol: impl Into<String>) -> Self {
        Self {
            storage,
            symbol: symbol.into(),
        }
    }
}

#[async_trait]
impl PriceStrategy for CachedFallbackStrategy {
    fn source(&self) -> PriceSource {
        PriceSource::Cache
    }

    /// Keeps the cached timestamp so consumers can see how old the value is.
    async fn sample(&self, _reference: Option<f64>) -> Result<PriceSample, ExtractionError> {
        let cached = {
            let storage = self.storage.lock().await;
            storage.load_cached_sample(&self.symbol)?
        };

        let Some(sample) = cached else {
            return Err(ExtractionError::NoCandidate);
        };
        debug!(
            "Cache for {} holds {} from {}",
            self.symbol, sample.value, sample.source
        );

        Ok(PriceSample {
            source: PriceSource::Cache,
            ..sample
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_cache_contributes_nothing() {
        let storage = Arc::new(Mutex::new(SqliteStorage::new(":memory:").unwrap()));
        let cache = CachedFallbackStrategy::new(storage, "XAUUSD");
        assert!(matches!(
            cache.sample(None).await,
            Err(ExtractionError::NoCandidate)
        ));
    }

    #[tokio::test]
    async fn cached_value_is_relabelled() {
        let storage = Arc::new(Mutex::new(SqliteStorage::new(":memory:").unwrap()));
        let live = PriceSample::new(3061.2, PriceSource::WidgetApi);
        storage
            .lock()
            .await
            .save_cached_sample("XAUUSD", &live)
            .unwrap();

        let sample = CachedFallbackStrategy::new(storage, "XAUUSD")
            .sample(None)
            .await
            .unwrap();
        assert_eq!(sample.value, 3061.2);
        assert_eq!(sample.source, PriceSource::Cache);
    }
}
