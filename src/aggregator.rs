// One canonical live price per symbol, chosen from all strategies by priority.
use crate::config::{AppConfig, PriceBand, SymbolConfig};
use crate::events::{AppEvent, EventBus};
use crate::model::{ExtractionError, PriceSample, PriceSource};
use crate::scraper::PriceStrategy;
use crate::storage::SqliteStorage;

use futures::future::join_all;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct AggregatorState {
    current: Option<PriceSample>,
    /// Rank of the best source accepted in the running tick.
    tick_rank: Option<usize>,
    /// Best non-cache sample accepted in the running tick.
    tick_fresh: Option<PriceSample>,
    misses: u32,
}

pub struct PriceAggregator {
    symbol: String,
    band: PriceBand,
    priority: Vec<PriceSource>,
    stale_after: u32,
    polling_interval: Duration,
    strategies: Vec<Arc<dyn PriceStrategy>>,
    storage: Arc<Mutex<SqliteStorage>>,
    events: Arc<EventBus>,
    state: StdMutex<AggregatorState>,
    shutdown: CancellationToken,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl PriceAggregator {
    pub fn new(
        symbol_cfg: &SymbolConfig,
        cfg: &AppConfig,
        strategies: Vec<Arc<dyn PriceStrategy>>,
        storage: Arc<Mutex<SqliteStorage>>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            symbol: symbol_cfg.symbol.clone(),
            band: symbol_cfg.band(),
            priority: cfg.strategy_priority.clone(),
            stale_after: cfg.stale_after_misses.max(1),
            polling_interval: cfg.polling_interval(),
            strategies,
            storage,
            events,
            state: StdMutex::new(AggregatorState::default()),
            shutdown: CancellationToken::new(),
            task: StdMutex::new(None),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn band(&self) -> PriceBand {
        self.band
    }

    pub fn current(&self) -> Option<PriceSample> {
        self.lock_state().current
    }

    /// Consecutive ticks without a fresh sample.
    pub fn staleness(&self) -> u32 {
        self.lock_state().misses
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.events.subscribe()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, AggregatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sources missing from the priority list rank below every listed one.
    fn rank(&self, source: PriceSource) -> usize {
        self.priority
            .iter()
            .position(|s| *s == source)
            .unwrap_or(self.priority.len())
    }

    /// Offers one candidate. Returns true if it became the current price.
    pub fn observe(&self, sample: PriceSample) -> bool {
        if !self.band.contains(sample.value) {
            debug!(
                "{}: rejecting {} from {} outside [{}, {}]",
                self.symbol, sample.value, sample.source, self.band.min, self.band.max
            );
            return false;
        }

        let rank = self.rank(sample.source);
        let event = {
            let mut state = self.lock_state();

            if let Some(best) = state.tick_rank {
                if rank > best {
                    return false;
                }
            }
            if sample.source == PriceSource::Cache {
                if let Some(cur) = state.current {
                    if cur.timestamp >= sample.timestamp {
                        return false;
                    }
                }
            }

            let changed = state
                .current
                .map(|cur| cur.value != sample.value || cur.source != sample.source)
                .unwrap_or(true);

            state.tick_rank = Some(rank);
            if sample.source != PriceSource::Cache {
                state.tick_fresh = Some(sample);
            }
            state.current = Some(sample);

            changed.then(|| AppEvent::PriceChanged {
                symbol: self.symbol.clone(),
                sample,
            })
        };

        if let Some(event) = event {
            debug!("{}: price {} ({})", self.symbol, sample.value, sample.source);
            self.events.publish(event);
        }
        true
    }

    pub fn begin_tick(&self) {
        let mut state = self.lock_state();
        state.tick_rank = None;
        state.tick_fresh = None;
    }

    /// Closes the tick: persists its fresh sample, or counts a miss.
    pub async fn finish_tick(&self) {
        let (fresh, stale_misses) = {
            let mut state = self.lock_state();
            let fresh = state.tick_fresh.take();
            state.tick_rank = None;

            if fresh.is_some() {
                if state.misses >= self.stale_after {
                    info!("{}: live price recovered after {} misses", self.symbol, state.misses);
                }
                state.misses = 0;
                (fresh, None)
            } else {
                state.misses = state.misses.saturating_add(1);
                let reached = state.misses == self.stale_after;
                (None, reached.then_some(state.misses))
            }
        };

        if let Some(sample) = fresh {
            let storage = self.storage.lock().await;
            if let Err(e) = storage.save_cached_sample(&self.symbol, &sample) {
                warn!("{}: failed to cache price: {}", self.symbol, e);
            }
        }

        if let Some(misses) = stale_misses {
            warn!("{}: no fresh price for {} ticks", self.symbol, misses);
            self.events.publish(AppEvent::PriceStale {
                symbol: self.symbol.clone(),
                misses,
            });
            for strategy in &self.strategies {
                strategy.on_stale();
            }
        }
    }

    /// Runs every strategy once and feeds the results in, best source first.
    pub async fn poll_once(&self) -> Option<PriceSample> {
        self.begin_tick();
        let reference = self.current().map(|s| s.value);

        let results = join_all(self.strategies.iter().map(|s| s.sample(reference))).await;

        let mut samples = Vec::new();
        for (strategy, result) in self.strategies.iter().zip(results) {
            match result {
                Ok(sample) => samples.push(sample),
                Err(
                    e @ (ExtractionError::NoCandidate
                    | ExtractionError::Busy
                    | ExtractionError::Exhausted),
                ) => {
                    debug!("{}: {} gave nothing: {}", self.symbol, strategy.source(), e);
                }
                Err(e) => warn!("{}: {} failed: {}", self.symbol, strategy.source(), e),
            }
        }
        samples.sort_by_key(|s| self.rank(s.source));

        for sample in samples {
            self.observe(sample);
        }
        self.finish_tick().await;

        self.current()
    }

    /// Spawns the polling loop. Calling it twice has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            warn!("{}: aggregator already started", self.symbol);
            return;
        }

        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            info!(
                "{}: polling {} strategies every {:?}",
                this.symbol,
                this.strategies.len(),
                this.polling_interval
            );
            let mut ticker = tokio::time::interval(this.polling_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        this.poll_once().await;
                    }
                }
            }
            info!("{}: polling stopped", this.symbol);
        }));
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("{}: polling task ended abnormally: {}", self.symbol, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        source: PriceSource,
        value: Option<f64>,
        stale_calls: AtomicUsize,
    }

    impl Fixed {
        fn new(source: PriceSource, value: Option<f64>) -> Arc<Self> {
            Arc::new(Self {
                source,
                value,
                stale_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PriceStrategy for Fixed {
        fn source(&self) -> PriceSource {
            self.source
        }

        async fn sample(&self, _reference: Option<f64>) -> Result<PriceSample, ExtractionError> {
            self.value
                .map(|v| PriceSample::new(v, self.source))
                .ok_or(ExtractionError::NoCandidate)
        }

        fn on_stale(&self) {
            self.stale_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn aggregator(
        strategies: Vec<Arc<dyn PriceStrategy>>,
    ) -> (Arc<PriceAggregator>, Arc<Mutex<SqliteStorage>>, Arc<EventBus>) {
        let storage = Arc::new(Mutex::new(SqliteStorage::new(":memory:").unwrap()));
        let events = Arc::new(EventBus::default());
        let cfg = AppConfig {
            stale_after_misses: 2,
            ..AppConfig::default()
        };
        let agg = PriceAggregator::new(
            &SymbolConfig::default(),
            &cfg,
            strategies,
            storage.clone(),
            events.clone(),
        );
        (Arc::new(agg), storage, events)
    }

    fn sample(value: f64, source: PriceSource) -> PriceSample {
        PriceSample::new(value, source)
    }

    #[test]
    fn out_of_band_samples_never_change_current() {
        let (agg, _, _) = aggregator(vec![]);
        for bad in [42.0, 499.99, 5000.01, f64::NAN, f64::INFINITY] {
            assert!(!agg.observe(sample(bad, PriceSource::WidgetApi)));
            assert!(agg.current().is_none());
        }

        agg.observe(sample(3061.2, PriceSource::DomScrape));
        agg.begin_tick();
        for bad in [12.0, 9000.0, -3061.2] {
            assert!(!agg.observe(sample(bad, PriceSource::WidgetApi)));
            assert_eq!(agg.current().unwrap().value, 3061.2);
        }
    }

    #[test]
    fn priority_wins_regardless_of_arrival_order() {
        let orders = [
            [PriceSource::DomScrape, PriceSource::Ocr, PriceSource::Cache],
            [PriceSource::Ocr, PriceSource::DomScrape, PriceSource::Cache],
            [PriceSource::Cache, PriceSource::Ocr, PriceSource::DomScrape],
            [PriceSource::Ocr, PriceSource::Cache, PriceSource::DomScrape],
        ];
        for order in orders {
            let (agg, _, _) = aggregator(vec![]);
            agg.begin_tick();
            for source in order {
                let value = match source {
                    PriceSource::DomScrape => 3061.2,
                    PriceSource::Ocr => 3065.48,
                    _ => 3059.9,
                };
                agg.observe(sample(value, source));
            }
            let current = agg.current().unwrap();
            assert_eq!(current.value, 3061.2, "order {:?}", order);
            assert_eq!(current.source.as_str(), "DOMScrape");
        }
    }

    #[test]
    fn lower_priority_can_win_in_a_later_tick() {
        let (agg, _, _) = aggregator(vec![]);
        agg.begin_tick();
        agg.observe(sample(3061.2, PriceSource::WidgetApi));
        assert!(!agg.observe(sample(3062.0, PriceSource::Ocr)));

        agg.begin_tick();
        assert!(agg.observe(sample(3062.0, PriceSource::Ocr)));
        assert_eq!(agg.current().unwrap().source, PriceSource::Ocr);
    }

    #[test]
    fn older_cache_value_does_not_replace_a_live_one() {
        let (agg, _, _) = aggregator(vec![]);
        let cached = PriceSample {
            timestamp: Utc::now() - chrono::Duration::minutes(10),
            ..sample(3040.0, PriceSource::Cache)
        };
        agg.observe(sample(3061.2, PriceSource::WidgetApi));
        agg.begin_tick();
        assert!(!agg.observe(cached));
        assert_eq!(agg.current().unwrap().value, 3061.2);
    }

    #[tokio::test]
    async fn one_event_per_accepted_change() {
        let (agg, _, events) = aggregator(vec![]);
        let mut rx = events.subscribe();

        let first = sample(3061.2, PriceSource::DomScrape);
        agg.observe(first);
        agg.begin_tick();
        agg.observe(PriceSample { timestamp: Utc::now(), ..first });
        agg.begin_tick();
        agg.observe(sample(3062.0, PriceSource::DomScrape));

        let mut values = Vec::new();
        while let Ok(AppEvent::PriceChanged { sample, .. }) = rx.try_recv() {
            values.push(sample.value);
        }
        assert_eq!(values, vec![3061.2, 3062.0]);
    }

    #[tokio::test]
    async fn poll_once_publishes_best_source_and_caches_it() {
        let (agg, storage, _) = aggregator(vec![
            Fixed::new(PriceSource::Cache, Some(3059.9)),
            Fixed::new(PriceSource::Ocr, Some(3065.48)),
            Fixed::new(PriceSource::DomScrape, Some(3061.2)),
            Fixed::new(PriceSource::WidgetApi, None),
        ]);

        let current = agg.poll_once().await.unwrap();
        assert_eq!(current.value, 3061.2);
        assert_eq!(current.source, PriceSource::DomScrape);

        let cached = storage.lock().await.load_cached_sample("XAUUSD").unwrap().unwrap();
        assert_eq!(cached.value, 3061.2);
        assert_eq!(agg.staleness(), 0);
    }

    #[tokio::test]
    async fn stale_feed_is_reported_once_and_rearms_strategies() {
        let ocr = Fixed::new(PriceSource::Ocr, None);
        let (agg, _, events) = aggregator(vec![ocr.clone()]);
        let mut rx = events.subscribe();

        agg.observe(sample(3061.2, PriceSource::WidgetApi));
        for _ in 0..4 {
            agg.poll_once().await;
        }

        assert_eq!(agg.staleness(), 4);
        assert_eq!(agg.current().unwrap().value, 3061.2);
        assert_eq!(ocr.stale_calls.load(Ordering::SeqCst), 1);

        let mut stale = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let AppEvent::PriceStale { misses, .. } = event {
                stale.push(misses);
            }
        }
        assert_eq!(stale, vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn start_polls_until_stopped() {
        let (agg, _, _) = aggregator(vec![Fixed::new(PriceSource::WidgetApi, Some(3061.2))]);
        agg.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(agg.current().unwrap().value, 3061.2);
        agg.stop().await;
    }
}
