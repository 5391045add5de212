use target_sniper::aggregator::PriceAggregator;
use target_sniper::config::{load_config, AppConfig, SymbolConfig};
use target_sniper::enhancer::ImageEnhancer;
use target_sniper::events::{AppEvent, EventBus};
use target_sniper::model::{AnalysisRecord, ExtractionError, NewAnalysis};
use target_sniper::normalizer::normalize_symbol;
use target_sniper::parser::PriceTextExtractor;
use target_sniper::scheduler::{CheckScheduler, HttpQuoteSource, QuoteSource, SchedulerConfig};
use target_sniper::scraper::{
    CachedFallbackStrategy, DomScrapeStrategy, FileCapture, HttpDomSource, HttpWidgetChannel,
    OcrLimits, PriceStrategy, ScreenshotOcrStrategy, TesseractRecognizer, WidgetApiStrategy,
};
use target_sniper::storage::SqliteStorage;

use chrono::Utc;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Set panic hook to log details about any panic
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Panic occurred: {:?}", panic_info);
    }));

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());
    let config: Arc<AppConfig> = match load_config(&config_path) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!("Config load error ({}): {}", config_path, e);
            return;
        }
    };

    let storage = match SqliteStorage::new(&config.database_path) {
        Ok(s) => Arc::new(Mutex::new(s)),
        Err(e) => {
            error!("Failed to initialize storage: {:?}", e);
            return;
        }
    };

    let events = Arc::new(EventBus::default());
    spawn_event_logger(events.subscribe());

    let enhancer = Arc::new(ImageEnhancer::default());
    let mut aggregators = Vec::new();
    for symbol_cfg in &config.symbols {
        let strategies = match build_strategies(symbol_cfg, &config, storage.clone(), enhancer.clone()) {
            Ok(s) => s,
            Err(e) => {
                error!("{}: cannot set up price strategies: {}", symbol_cfg.symbol, e);
                return;
            }
        };
        info!(
            "{}: strategies {:?}",
            symbol_cfg.symbol,
            strategies.iter().map(|s| s.source()).collect::<Vec<_>>()
        );
        aggregators.push(Arc::new(PriceAggregator::new(
            symbol_cfg,
            &config,
            strategies,
            storage.clone(),
            events.clone(),
        )));
    }

    let quotes: Option<Arc<dyn QuoteSource>> = match &config.quote_url {
        Some(url) => match HttpQuoteSource::new(url.clone(), config.request_timeout()) {
            Ok(source) => Some(Arc::new(source) as Arc<dyn QuoteSource>),
            Err(e) => {
                error!("Cannot create quote client: {}", e);
                return;
            }
        },
        None => {
            warn!("No quote_url configured; checks rely on the live feed only");
            None
        }
    };

    let scheduler = Arc::new(CheckScheduler::new(
        SchedulerConfig::from_app(&config),
        storage.clone(),
        aggregators.clone(),
        quotes,
        events.clone(),
    ));

    for aggregator in &aggregators {
        aggregator.start();
    }
    scheduler.start();

    spawn_command_listener(
        scheduler.clone(),
        aggregators.clone(),
        storage.clone(),
        config.clone(),
    );
    info!("target-sniper running; type `check`, `status` or `add <json>`");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Shutting down...");
    scheduler.stop().await;
    for aggregator in &aggregators {
        aggregator.stop().await;
    }
}

/// Live sources are enabled by their endpoints; the cache is always last in line.
fn build_strategies(
    symbol_cfg: &SymbolConfig,
    config: &AppConfig,
    storage: Arc<Mutex<SqliteStorage>>,
    enhancer: Arc<ImageEnhancer>,
) -> Result<Vec<Arc<dyn PriceStrategy>>, ExtractionError> {
    let band = symbol_cfg.band();
    let mut strategies: Vec<Arc<dyn PriceStrategy>> = Vec::new();

    if let Some(url) = &config.widget_bridge_url {
        let channel = HttpWidgetChannel::new(url.clone(), config.request_timeout())?;
        strategies.push(Arc::new(WidgetApiStrategy::new(
            Arc::new(channel),
            band,
            config.request_timeout(),
        )));
    }

    if let Some(url) = &config.dom_snapshot_url {
        let source = HttpDomSource::new(url.clone(), config.request_timeout())?;
        strategies.push(Arc::new(DomScrapeStrategy::new(
            Arc::new(source),
            &symbol_cfg.dom_selectors,
            band,
        )?));
    }

    if let Some(path) = &config.capture_path {
        let binary = config
            .tesseract_path
            .clone()
            .unwrap_or_else(|| "tesseract".to_string());
        strategies.push(Arc::new(ScreenshotOcrStrategy::new(
            Arc::new(FileCapture::new(path)),
            Arc::new(TesseractRecognizer::new(binary)),
            enhancer,
            Arc::new(PriceTextExtractor::new(symbol_cfg)?),
            symbol_cfg.capture_target.clone(),
            OcrLimits {
                max_attempts: config.ocr_max_attempts,
                stable_repeats: config.ocr_stable_repeats,
                enhance_timeout: config.enhance_timeout(),
            },
        )));
    }

    strategies.push(Arc::new(CachedFallbackStrategy::new(
        storage,
        symbol_cfg.symbol.clone(),
    )));
    Ok(strategies)
}

fn spawn_event_logger(mut rx: broadcast::Receiver<AppEvent>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(AppEvent::PriceChanged { symbol, sample }) => {
                    info!("{}: {:.2} via {}", symbol, sample.value, sample.source);
                }
                Ok(AppEvent::PriceStale { symbol, misses }) => {
                    warn!("{}: price stale for {} polls", symbol, misses);
                }
                Ok(AppEvent::Checked {
                    timestamp,
                    count,
                    symbol,
                }) => {
                    info!("{}: {} analyses checked at {}", symbol, count, timestamp);
                }
                Ok(AppEvent::CheckFailed { error }) => {
                    warn!("Check failed: {}", error);
                }
                Ok(AppEvent::AnalysisTransitioned { id, symbol, from, to }) => {
                    info!("{} [{}]: {} -> {}", id, symbol, from, to);
                }
                Err(RecvError::Lagged(n)) => warn!("Event logger skipped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Reads commands from stdin: `check` forces a check, `status` prints prices,
/// `add <json>` submits a new analysis.
fn spawn_command_listener(
    scheduler: Arc<CheckScheduler>,
    aggregators: Vec<Arc<PriceAggregator>>,
    storage: Arc<Mutex<SqliteStorage>>,
    config: Arc<AppConfig>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            let (command, rest) = line.split_once(' ').unwrap_or((line, ""));

            match command {
                "check" => {
                    info!("Manual check requested");
                    scheduler.request_manual();
                }
                "status" => {
                    for aggregator in &aggregators {
                        match aggregator.current() {
                            Some(s) => info!(
                                "{}: {:.2} via {} at {} ({} misses)",
                                aggregator.symbol(),
                                s.value,
                                s.source,
                                s.timestamp,
                                aggregator.staleness()
                            ),
                            None => info!("{}: no price yet", aggregator.symbol()),
                        }
                    }
                    for attempt in scheduler.recent_attempts() {
                        info!(
                            "quote {} {:?} retries={} {}",
                            attempt.symbol,
                            attempt.status,
                            attempt.retry_count,
                            attempt.error.unwrap_or_default()
                        );
                    }
                }
                "add" => submit_analysis(rest, &storage, &config).await,
                "" => {}
                other => warn!("Unknown command: {}", other),
            }
        }
    });
}

async fn submit_analysis(json: &str, storage: &Arc<Mutex<SqliteStorage>>, config: &AppConfig) {
    let mut request: NewAnalysis = match serde_json::from_str(json) {
        Ok(r) => r,
        Err(e) => {
            warn!("Invalid analysis: {}", e);
            return;
        }
    };
    request.symbol = normalize_symbol(&request.symbol, &config.symbols);

    let now = Utc::now();
    let id = format!("{}-{}", request.symbol, now.timestamp_millis());
    let record = match AnalysisRecord::new(id, request, now) {
        Ok(r) => r,
        Err(e) => {
            warn!("Rejected analysis: {}", e);
            return;
        }
    };
    if let Err(e) = record.check_levels() {
        warn!("Accepted analysis with suspicious levels: {}", e);
    }

    match storage.lock().await.insert_analysis(&record) {
        Ok(()) => info!("Added analysis {} ({})", record.id, record.state),
        Err(e) => warn!("DB save error: {:?}", e),
    }
}
