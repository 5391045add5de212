use crate::model::{ConfigError, PriceSource};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PriceBand {
    pub min: f64,
    pub max: f64,
}

impl PriceBand {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value.is_finite() && value >= self.min && value <= self.max
    }
}

/// Per-instrument settings: plausibility band, OCR hints and where the price is rendered.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SymbolConfig {
    pub symbol: String,
    pub aliases: Vec<String>,
    pub min_price: f64,
    pub max_price: f64,
    /// Tight band around the current level; a candidate inside it wins outright.
    pub narrow_band: Option<PriceBand>,
    /// Values that are only the trailing part of a price (e.g. "65.48" of 3065.48).
    pub fragment_band: PriceBand,
    pub base_price: Option<f64>,
    pub sanity_floor: f64,
    pub dom_selectors: Vec<String>,
    pub capture_target: String,
}

impl Default for SymbolConfig {
    fn default() -> Self {
        Self {
            symbol: "XAUUSD".into(),
            aliases: vec!["XAUUSD".into(), "XAU/USD".into(), "GOLD".into()],
            min_price: 500.0,
            max_price: 5000.0,
            narrow_band: None,
            fragment_band: PriceBand::new(50.0, 100.0),
            base_price: None,
            sanity_floor: 100.0,
            dom_selectors: vec![
                ".price-axis__last-value".into(),
                "[data-name=\"legend-series-item\"] .valueValue".into(),
                ".pane-legend-item-value-container .pane-legend-item-value".into(),
                ".js-symbol-last".into(),
            ],
            capture_target: ".chart-markup-table".into(),
        }
    }
}

impl SymbolConfig {
    pub fn band(&self) -> PriceBand {
        PriceBand::new(self.min_price, self.max_price)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: String,
    pub symbols: Vec<SymbolConfig>,
    pub polling_interval_ms: u64,
    pub check_interval_seconds: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub request_timeout_ms: u64,
    pub ocr_max_attempts: u32,
    pub ocr_stable_repeats: u32,
    pub enhance_timeout_ms: u64,
    pub strategy_priority: Vec<PriceSource>,
    pub stale_after_misses: u32,
    pub expiry_grace_seconds: u64,
    pub max_sample_age_seconds: u64,
    pub widget_bridge_url: Option<String>,
    pub dom_snapshot_url: Option<String>,
    pub capture_path: Option<String>,
    pub tesseract_path: Option<String>,
    /// `{symbol}` is substituted with the instrument name.
    pub quote_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: "data.db".into(),
            symbols: vec![SymbolConfig::default()],
            polling_interval_ms: 2_000,
            check_interval_seconds: 60,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            request_timeout_ms: 10_000,
            ocr_max_attempts: 5,
            ocr_stable_repeats: 3,
            enhance_timeout_ms: 5_000,
            strategy_priority: vec![
                PriceSource::WidgetApi,
                PriceSource::DomScrape,
                PriceSource::Ocr,
                PriceSource::Cache,
            ],
            stale_after_misses: 5,
            expiry_grace_seconds: 300,
            max_sample_age_seconds: 30,
            widget_bridge_url: None,
            dom_snapshot_url: None,
            capture_path: None,
            tesseract_path: None,
            quote_url: None,
        }
    }
}

impl AppConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn enhance_timeout(&self) -> Duration {
        Duration::from_millis(self.enhance_timeout_ms)
    }

    pub fn symbol(&self, name: &str) -> Option<&SymbolConfig> {
        self.symbols.iter().find(|s| s.symbol == name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbols.is_empty() {
            return Err(ConfigError::Invalid("no symbols configured".into()));
        }
        for s in &self.symbols {
            if s.symbol.trim().is_empty() {
                return Err(ConfigError::Invalid("empty symbol name".into()));
            }
            if !(s.min_price < s.max_price) {
                return Err(ConfigError::Invalid(format!(
                    "{}: min_price {} must be below max_price {}",
                    s.symbol, s.min_price, s.max_price
                )));
            }
            if s.fragment_band.min > s.fragment_band.max {
                return Err(ConfigError::Invalid(format!(
                    "{}: inverted fragment band",
                    s.symbol
                )));
            }
            if let Some(narrow) = s.narrow_band {
                if narrow.min > narrow.max {
                    return Err(ConfigError::Invalid(format!(
                        "{}: inverted narrow band",
                        s.symbol
                    )));
                }
            }
        }
        if self.strategy_priority.is_empty() {
            return Err(ConfigError::Invalid("strategy_priority is empty".into()));
        }
        if self.polling_interval_ms == 0 || self.check_interval_seconds == 0 {
            return Err(ConfigError::Invalid("intervals must be positive".into()));
        }
        Ok(())
    }
}

pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: AppConfig = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}
