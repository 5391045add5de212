// Periodic and manual evaluation cycles over all active analyses.

pub mod quote;
pub mod retry;

pub use quote::{HttpQuoteSource, QuoteSource};
pub use retry::{AttemptLog, AttemptRecord, AttemptStatus, RetryError, RetryPolicy};

use crate::aggregator::PriceAggregator;
use crate::analyzer::{group_by_symbol, AnalysisEvaluator, Evaluator, Transition};
use crate::archive::{ArchiveMover, ArchiveOutcome};
use crate::config::{AppConfig, SymbolConfig};
use crate::events::{AppEvent, EventBus};
use crate::model::{AnalysisRecord, PriceSource};
use crate::storage::{ActiveFilter, SqliteStorage};
use retry::run_with_retry;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOrigin {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Completed,
    /// Another cycle was already running.
    Skipped,
    /// Pre-empted by a manual check or shut down.
    Aborted,
    /// The active set could not be read.
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckSummary {
    pub origin: CheckOrigin,
    pub status: CheckStatus,
    /// Records evaluated.
    pub checked: usize,
    pub activated: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub expired: usize,
    /// Expired records removed after their grace period.
    pub deleted: usize,
    /// Symbol groups left unpriced this cycle.
    pub price_failures: usize,
}

impl CheckSummary {
    fn new(origin: CheckOrigin, status: CheckStatus) -> Self {
        Self {
            origin,
            status,
            checked: 0,
            activated: 0,
            succeeded: 0,
            failed: 0,
            expired: 0,
            deleted: 0,
            price_failures: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub check_interval: Duration,
    pub expiry_grace: chrono::Duration,
    pub max_sample_age: chrono::Duration,
    pub retry: RetryPolicy,
    pub symbols: Vec<SymbolConfig>,
}

impl SchedulerConfig {
    pub fn from_app(cfg: &AppConfig) -> Self {
        Self {
            check_interval: cfg.check_interval(),
            expiry_grace: chrono::Duration::seconds(cfg.expiry_grace_seconds as i64),
            max_sample_age: chrono::Duration::seconds(cfg.max_sample_age_seconds as i64),
            retry: RetryPolicy::new(cfg.max_retries, cfg.retry_base_delay()),
            symbols: cfg.symbols.clone(),
        }
    }
}

enum PriceError {
    Aborted,
    Unavailable(String),
}

struct InFlight {
    cycle: u64,
    origin: CheckOrigin,
    token: CancellationToken,
}

/// Frees the in-flight slot unless a newer cycle has taken it over.
struct CycleGuard<'a> {
    slot: &'a StdMutex<Option<InFlight>>,
    cycle: u64,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().map(|f| f.cycle) == Some(self.cycle) {
            *slot = None;
        }
    }
}

pub struct CheckScheduler {
    config: SchedulerConfig,
    storage: Arc<Mutex<SqliteStorage>>,
    archive: ArchiveMover,
    evaluator: Box<dyn Evaluator + Send + Sync>,
    aggregators: HashMap<String, Arc<PriceAggregator>>,
    quotes: Option<Arc<dyn QuoteSource>>,
    events: Arc<EventBus>,
    in_flight: StdMutex<Option<InFlight>>,
    next_cycle: AtomicU64,
    attempts: StdMutex<AttemptLog>,
    manual: Notify,
    shutdown: CancellationToken,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl CheckScheduler {
    pub fn new(
        config: SchedulerConfig,
        storage: Arc<Mutex<SqliteStorage>>,
        aggregators: Vec<Arc<PriceAggregator>>,
        quotes: Option<Arc<dyn QuoteSource>>,
        events: Arc<EventBus>,
    ) -> Self {
        let aggregators = aggregators
            .into_iter()
            .map(|a| (a.symbol().to_string(), a))
            .collect();

        Self {
            config,
            archive: ArchiveMover::new(storage.clone()),
            storage,
            evaluator: Box::new(AnalysisEvaluator::new()),
            aggregators,
            quotes,
            events,
            in_flight: StdMutex::new(None),
            next_cycle: AtomicU64::new(1),
            attempts: StdMutex::new(AttemptLog::default()),
            manual: Notify::new(),
            shutdown: CancellationToken::new(),
            task: StdMutex::new(None),
        }
    }

    pub fn recent_attempts(&self) -> Vec<AttemptRecord> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    /// Asks the running loop for a manual check.
    pub fn request_manual(&self) {
        self.manual.notify_one();
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Runs one cycle. An auto trigger while busy is skipped; a manual one
    /// cancels the running cycle and takes its place.
    pub async fn trigger_check(&self, origin: CheckOrigin) -> CheckSummary {
        let (cycle, token) = {
            let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(running) = slot.as_ref() {
                match origin {
                    CheckOrigin::Auto => {
                        debug!("Check {} still running; skipping auto trigger", running.cycle);
                        return CheckSummary::new(origin, CheckStatus::Skipped);
                    }
                    CheckOrigin::Manual => {
                        info!(
                            "Manual check pre-empts {:?} check {}",
                            running.origin, running.cycle
                        );
                        running.token.cancel();
                    }
                }
            }

            let cycle = self.next_cycle.fetch_add(1, Ordering::SeqCst);
            let token = self.shutdown.child_token();
            *slot = Some(InFlight {
                cycle,
                origin,
                token: token.clone(),
            });
            (cycle, token)
        };
        let _guard = CycleGuard {
            slot: &self.in_flight,
            cycle,
        };

        let summary = self.run_cycle(origin, &token).await;
        info!(
            "Check {} ({:?}) {:?}: {} checked, {} activated, {} succeeded, {} failed, {} expired, {} deleted",
            cycle,
            origin,
            summary.status,
            summary.checked,
            summary.activated,
            summary.succeeded,
            summary.failed,
            summary.expired,
            summary.deleted
        );
        summary
    }

    async fn run_cycle(&self, origin: CheckOrigin, token: &CancellationToken) -> CheckSummary {
        let mut summary = CheckSummary::new(origin, CheckStatus::Completed);

        let records = {
            let storage = self.storage.lock().await;
            match storage.delete_expired(self.config.expiry_grace, Utc::now()) {
                Ok(n) => summary.deleted = n,
                Err(e) => error!("Failed to delete expired analyses: {}", e),
            }
            match storage.list_active(&ActiveFilter::default()) {
                Ok(records) => records,
                Err(e) => {
                    error!("Failed to load active analyses: {}", e);
                    summary.status = CheckStatus::Failed;
                    return summary;
                }
            }
        };

        for (symbol, group) in group_by_symbol(records, &self.config.symbols) {
            if token.is_cancelled() {
                summary.status = CheckStatus::Aborted;
                return summary;
            }

            let price = match self.resolve_price(&symbol, token).await {
                Ok(price) => price,
                Err(PriceError::Aborted) => {
                    summary.status = CheckStatus::Aborted;
                    return summary;
                }
                Err(PriceError::Unavailable(error)) => {
                    warn!("{}: no price this cycle: {}", symbol, error);
                    summary.price_failures += 1;
                    self.events.publish(AppEvent::CheckFailed { error });
                    if !self.expire_overdue(&group, token, &mut summary).await {
                        summary.status = CheckStatus::Aborted;
                        return summary;
                    }
                    continue;
                }
            };

            for record in &group {
                if let Err(e) = record.check_levels() {
                    warn!("Data quality: {}", e);
                }
                let now = Utc::now();
                let transition = self.evaluator.evaluate(record, price, now);
                if !self.apply(record, transition, now, token, &mut summary).await {
                    summary.status = CheckStatus::Aborted;
                    return summary;
                }
            }

            self.events.publish(AppEvent::Checked {
                timestamp: Utc::now(),
                count: group.len(),
                symbol,
            });
        }

        summary
    }

    /// Expiry does not depend on price, so overdue records still expire when the
    /// group could not be priced. Returns false if the cycle was cancelled.
    async fn expire_overdue(
        &self,
        group: &[AnalysisRecord],
        token: &CancellationToken,
        summary: &mut CheckSummary,
    ) -> bool {
        for record in group {
            let now = Utc::now();
            if now <= record.expiry_at {
                continue;
            }
            if !self.apply(record, Transition::Expired, now, token, summary).await {
                return false;
            }
        }
        true
    }

    /// A fresh live sample if there is one, otherwise the remote quote.
    async fn resolve_price(&self, symbol: &str, token: &CancellationToken) -> Result<f64, PriceError> {
        let aggregator = self.aggregators.get(symbol);

        if let Some(sample) = aggregator.and_then(|a| a.current()) {
            let age = sample.age(Utc::now());
            if sample.source != PriceSource::Cache && age <= self.config.max_sample_age {
                debug!("{}: using live {} price {}", symbol, sample.source, sample.value);
                return Ok(sample.value);
            }
            debug!("{}: live price is {}s old", symbol, age.num_seconds());
        }

        let band = aggregator.map(|a| a.band()).or_else(|| {
            self.config
                .symbols
                .iter()
                .find(|s| s.symbol == symbol)
                .map(|s| s.band())
        });

        let Some(quotes) = self.quotes.as_ref() else {
            return Err(PriceError::Unavailable(format!(
                "{}: no fresh live price and no quote endpoint configured",
                symbol
            )));
        };

        let start_time = Utc::now();
        let result = run_with_retry(
            &format!("quote {}", symbol),
            &self.config.retry,
            token,
            || quotes.fetch_quote(symbol),
        )
        .await;

        let (status, retry_count, error, outcome) = match result {
            Ok(quote) if band.map_or(true, |b| b.contains(quote.value)) => {
                (AttemptStatus::Success, quote.retries, None, Ok(quote.value))
            }
            Ok(quote) => {
                let msg = format!("{}: quote {} outside plausible band", symbol, quote.value);
                (AttemptStatus::Failed, quote.retries, Some(msg.clone()), Err(PriceError::Unavailable(msg)))
            }
            Err(RetryError::Aborted { retries }) => {
                (AttemptStatus::Aborted, retries, None, Err(PriceError::Aborted))
            }
            Err(RetryError::Exhausted { retries, last }) => {
                let msg = format!("{}: quote failed after {} retries: {}", symbol, retries, last);
                (AttemptStatus::Failed, retries, Some(msg.clone()), Err(PriceError::Unavailable(msg)))
            }
        };

        self.record_attempt(AttemptRecord {
            symbol: symbol.to_string(),
            start_time,
            end_time: Utc::now(),
            status,
            retry_count,
            error,
        });
        outcome
    }

    fn record_attempt(&self, record: AttemptRecord) {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    /// Persists one transition. Returns false if the cycle was cancelled first.
    async fn apply(
        &self,
        record: &AnalysisRecord,
        transition: Transition,
        now: DateTime<Utc>,
        token: &CancellationToken,
        summary: &mut CheckSummary,
    ) -> bool {
        if token.is_cancelled() {
            return false;
        }
        summary.checked += 1;

        match transition {
            Transition::Unchanged => {}
            Transition::Checked { price } => {
                let storage = self.storage.lock().await;
                if token.is_cancelled() {
                    return false;
                }
                if let Err(e) = storage.update_checked(&record.id, price, now) {
                    error!("Failed to record check of {}: {}", record.id, e);
                }
            }
            Transition::Activated { price } => {
                let updated = {
                    let storage = self.storage.lock().await;
                    if token.is_cancelled() {
                        return false;
                    }
                    storage.mark_activated(&record.id, price, now)
                };
                match updated {
                    Ok(true) => {
                        info!("{} entered at {}", record.id, price);
                        summary.activated += 1;
                        self.publish_transition(record, transition);
                    }
                    Ok(false) => debug!("{} was no longer pending", record.id),
                    Err(e) => error!("Failed to activate {}: {}", record.id, e),
                }
            }
            Transition::Success { exit_price } => {
                match self.archive(record, transition, exit_price, true, false, token).await {
                    None => return false,
                    Some(true) => summary.succeeded += 1,
                    Some(false) => {}
                }
            }
            Transition::Failure {
                exit_price,
                entry_point_evaluation,
            } => {
                match self
                    .archive(record, transition, exit_price, false, entry_point_evaluation, token)
                    .await
                {
                    None => return false,
                    Some(true) => summary.failed += 1,
                    Some(false) => {}
                }
            }
            Transition::Expired => {
                let updated = {
                    let storage = self.storage.lock().await;
                    if token.is_cancelled() {
                        return false;
                    }
                    storage.mark_expired(&record.id, now)
                };
                match updated {
                    Ok(true) => {
                        info!("{} expired", record.id);
                        summary.expired += 1;
                        self.publish_transition(record, transition);
                    }
                    Ok(false) => debug!("{} already left the active set", record.id),
                    Err(e) => error!("Failed to expire {}: {}", record.id, e),
                }
            }
        }
        true
    }

    /// Errors leave the record where it is; the next cycle evaluates it again.
    /// `None` if the cycle was cancelled before anything was written.
    async fn archive(
        &self,
        record: &AnalysisRecord,
        transition: Transition,
        exit_price: f64,
        is_success: bool,
        is_entry_point_evaluation: bool,
        token: &CancellationToken,
    ) -> Option<bool> {
        match self
            .archive
            .archive_unless_cancelled(
                &record.id,
                exit_price,
                is_success,
                is_entry_point_evaluation,
                token,
            )
            .await
        {
            Ok(None) => None,
            Ok(Some(ArchiveOutcome::Archived(_))) => {
                self.publish_transition(record, transition);
                Some(true)
            }
            Ok(Some(ArchiveOutcome::AlreadyArchived)) => Some(false),
            Err(e) => {
                error!("Failed to archive {}: {}; will retry next cycle", record.id, e);
                Some(false)
            }
        }
    }

    fn publish_transition(&self, record: &AnalysisRecord, transition: Transition) {
        self.events.publish(AppEvent::AnalysisTransitioned {
            id: record.id.clone(),
            symbol: record.symbol.clone(),
            from: record.state,
            to: transition.next_state(record.state),
        });
    }

    /// Spawns the periodic loop. Each check runs on its own task so a manual
    /// request can pre-empt a running one.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            warn!("Scheduler already started");
            return;
        }

        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            info!("Checking analyses every {:?}", this.config.check_interval);
            let mut ticker = tokio::time::interval(this.config.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                let origin = tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    _ = ticker.tick() => CheckOrigin::Auto,
                    _ = this.manual.notified() => CheckOrigin::Manual,
                };

                let scheduler = Arc::clone(&this);
                tokio::spawn(async move {
                    scheduler.trigger_check(origin).await;
                });
            }
            info!("Scheduler stopped");
        }));
    }

    /// Stops the loop and cancels any running check.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Scheduler task ended abnormally: {}", e);
            }
        }
    }
}
