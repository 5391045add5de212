// Core structs: PriceSample, AnalysisRecord, ArchiveEntry and the error types
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Where a price sample came from. Ordering of the default priority lives in the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PriceSource {
    WidgetApi,
    DomScrape,
    Ocr,
    Cache,
}

impl PriceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceSource::WidgetApi => "WidgetAPI",
            PriceSource::DomScrape => "DOMScrape",
            PriceSource::Ocr => "OCR",
            PriceSource::Cache => "Cache",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "WidgetAPI" | "WidgetApi" => Some(PriceSource::WidgetApi),
            "DOMScrape" | "DomScrape" => Some(PriceSource::DomScrape),
            "OCR" | "Ocr" => Some(PriceSource::Ocr),
            "Cache" => Some(PriceSource::Cache),
            _ => None,
        }
    }
}

impl fmt::Display for PriceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceSample {
    pub value: f64,
    pub source: PriceSource,
    pub timestamp: DateTime<Utc>,
}

impl PriceSample {
    pub fn new(value: f64, source: PriceSource) -> Self {
        Self {
            value,
            source,
            timestamp: Utc::now(),
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.timestamp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "up" | "long" | "buy" => Some(Direction::Up),
            "down" | "short" | "sell" => Some(Direction::Down),
            _ => None,
        }
    }

    /// True when `price` has reached `level` in the direction of the trade.
    pub fn is_favorable(&self, price: f64, level: f64) -> bool {
        match self {
            Direction::Up => price >= level,
            Direction::Down => price <= level,
        }
    }

    /// True when `price` has reached `level` against the trade.
    pub fn is_adverse(&self, price: f64, level: f64) -> bool {
        match self {
            Direction::Up => price <= level,
            Direction::Down => price >= level,
        }
    }

    /// Profit of moving from `from` to `to` in this direction.
    pub fn signed_move(&self, from: f64, to: f64) -> f64 {
        match self {
            Direction::Up => to - from,
            Direction::Down => from - to,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnalysisState {
    PendingEntry,
    Active,
    Success,
    Failure,
    Expired,
}

impl AnalysisState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisState::PendingEntry => "PENDING_ENTRY",
            AnalysisState::Active => "ACTIVE",
            AnalysisState::Success => "SUCCESS",
            AnalysisState::Failure => "FAILURE",
            AnalysisState::Expired => "EXPIRED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING_ENTRY" => Some(AnalysisState::PendingEntry),
            "ACTIVE" => Some(AnalysisState::Active),
            "SUCCESS" => Some(AnalysisState::Success),
            "FAILURE" => Some(AnalysisState::Failure),
            "EXPIRED" => Some(AnalysisState::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AnalysisState::Success | AnalysisState::Failure | AnalysisState::Expired
        )
    }

    /// Lifecycle is monotonic: no edge ever leads back to an earlier state.
    pub fn can_transition_to(&self, next: AnalysisState) -> bool {
        use AnalysisState::*;
        match (self, next) {
            (PendingEntry, Active) | (PendingEntry, Failure) => true,
            (Active, Success) | (Active, Failure) => true,
            (PendingEntry, Expired) | (Active, Expired) => true,
            _ => false,
        }
    }
}

impl fmt::Display for AnalysisState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub price: f64,
    #[serde(default)]
    pub expected_time: Option<DateTime<Utc>>,
}

impl Target {
    pub fn at(price: f64) -> Self {
        Self {
            price,
            expected_time: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub price: f64,
    pub reason: String,
}

/// What a user submits; turned into an [`AnalysisRecord`] by [`AnalysisRecord::new`].
#[derive(Debug, Clone, Deserialize)]
pub struct NewAnalysis {
    pub symbol: String,
    pub direction: Direction,
    pub reference_price: f64,
    pub expiry_at: DateTime<Utc>,
    pub stop_loss: f64,
    pub targets: Vec<Target>,
    #[serde(default)]
    pub best_entry_point: Option<EntryPoint>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRecord {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    /// Live price at the moment the analysis was attached.
    pub reference_price: f64,
    pub created_at: DateTime<Utc>,
    pub expiry_at: DateTime<Utc>,
    pub stop_loss: f64,
    /// Never empty; nearest to the entry first.
    pub targets: Vec<Target>,
    pub best_entry_point: Option<EntryPoint>,
    pub state: AnalysisState,
    pub entry_hit: bool,
    pub last_checked_price: Option<f64>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl AnalysisRecord {
    pub fn new(
        id: impl Into<String>,
        req: NewAnalysis,
        created_at: DateTime<Utc>,
    ) -> Result<Self, RecordError> {
        if req.targets.is_empty() {
            return Err(RecordError::EmptyTargets);
        }
        if req.expiry_at <= created_at {
            return Err(RecordError::InvalidExpiry);
        }

        let entry = req
            .best_entry_point
            .as_ref()
            .map(|e| e.price)
            .unwrap_or(req.reference_price);
        let mut targets = req.targets;
        targets.sort_by(|a, b| (a.price - entry).abs().total_cmp(&(b.price - entry).abs()));

        let state = if req.best_entry_point.is_some() {
            AnalysisState::PendingEntry
        } else {
            AnalysisState::Active
        };

        Ok(Self {
            id: id.into(),
            symbol: req.symbol,
            direction: req.direction,
            reference_price: req.reference_price,
            created_at,
            expiry_at: req.expiry_at,
            stop_loss: req.stop_loss,
            targets,
            best_entry_point: req.best_entry_point,
            state,
            entry_hit: false,
            last_checked_price: None,
            last_checked_at: None,
            expired_at: None,
        })
    }

    /// Price the trade is measured from: the entry point if one was given.
    pub fn entry_price(&self) -> f64 {
        self.best_entry_point
            .as_ref()
            .map(|e| e.price)
            .unwrap_or(self.reference_price)
    }

    pub fn nearest_target(&self) -> Option<&Target> {
        self.targets.first()
    }

    /// Up requires stop_loss < entry <= nearest target, Down the mirror image.
    pub fn check_levels(&self) -> Result<(), RecordError> {
        let entry = self.entry_price();
        let Some(target) = self.nearest_target() else {
            return Err(RecordError::EmptyTargets);
        };
        let ordered = match self.direction {
            Direction::Up => self.stop_loss < entry && entry <= target.price,
            Direction::Down => self.stop_loss > entry && entry >= target.price,
        };
        if ordered {
            Ok(())
        } else {
            Err(RecordError::InconsistentLevels(format!(
                "{} {}: stop {} / entry {} / target {}",
                self.id,
                self.direction.as_str(),
                self.stop_loss,
                entry,
                target.price
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveEntry {
    pub source_record_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub exit_price: f64,
    pub is_success: bool,
    pub is_entry_point_evaluation: bool,
    pub entry_hit: bool,
    pub target_hit: bool,
    pub profit_loss: f64,
    pub archived_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("no price candidate")]
    NoCandidate,
    #[error("price {value} outside plausible band [{min}, {max}]")]
    OutOfBand { value: f64, min: f64, max: f64 },
    #[error("extraction already in progress")]
    Busy,
    #[error("attempt budget exhausted")]
    Exhausted,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
    #[error("capture failed: {0}")]
    Capture(String),
    #[error("recognition failed: {0}")]
    Recognition(String),
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),
    #[error("invalid stored data: {0}")]
    InvalidData(String),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http error: {0}")]
    HttpError(String),
    #[error("request timed out")]
    Timeout,
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::HttpError(e.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("analysis needs at least one target")]
    EmptyTargets,
    #[error("expiry must be after creation")]
    InvalidExpiry,
    #[error("inconsistent levels: {0}")]
    InconsistentLevels(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn request(direction: Direction, targets: Vec<f64>) -> NewAnalysis {
        NewAnalysis {
            symbol: "XAUUSD".into(),
            direction,
            reference_price: 3045.0,
            expiry_at: Utc::now() + Duration::hours(4),
            stop_loss: 3030.0,
            targets: targets.into_iter().map(Target::at).collect(),
            best_entry_point: Some(EntryPoint {
                price: 3050.0,
                reason: "breakout".into(),
            }),
        }
    }

    #[test]
    fn new_record_sorts_targets_and_starts_pending() {
        let record = AnalysisRecord::new("a1", request(Direction::Up, vec![3120.0, 3080.0, 3100.0]), Utc::now())
            .unwrap();
        let prices: Vec<f64> = record.targets.iter().map(|t| t.price).collect();
        assert_eq!(prices, vec![3080.0, 3100.0, 3120.0]);
        assert_eq!(record.state, AnalysisState::PendingEntry);
        assert!(record.check_levels().is_ok());
    }

    #[test]
    fn record_without_entry_point_starts_active() {
        let mut req = request(Direction::Up, vec![3080.0]);
        req.best_entry_point = None;
        let record = AnalysisRecord::new("a2", req, Utc::now()).unwrap();
        assert_eq!(record.state, AnalysisState::Active);
        assert_eq!(record.entry_price(), 3045.0);
    }

    #[test]
    fn rejects_empty_targets_and_bad_expiry() {
        let req = request(Direction::Up, vec![]);
        assert!(matches!(
            AnalysisRecord::new("a3", req, Utc::now()),
            Err(RecordError::EmptyTargets)
        ));

        let mut req = request(Direction::Up, vec![3080.0]);
        let now = Utc::now();
        req.expiry_at = now;
        assert!(matches!(
            AnalysisRecord::new("a4", req, now),
            Err(RecordError::InvalidExpiry)
        ));
    }

    #[test]
    fn inconsistent_levels_are_reported() {
        // a Down analysis with an Up-shaped ladder
        let record = AnalysisRecord::new("a5", request(Direction::Down, vec![3080.0]), Utc::now())
            .unwrap();
        assert!(matches!(
            record.check_levels(),
            Err(RecordError::InconsistentLevels(_))
        ));
    }

    #[test]
    fn transitions_are_monotonic() {
        use AnalysisState::*;
        assert!(PendingEntry.can_transition_to(Active));
        assert!(PendingEntry.can_transition_to(Failure));
        assert!(Active.can_transition_to(Success));
        assert!(Active.can_transition_to(Expired));
        assert!(!Active.can_transition_to(PendingEntry));
        assert!(!Success.can_transition_to(Failure));
        assert!(!Expired.can_transition_to(Active));
        assert!(!PendingEntry.can_transition_to(Success));
    }

    #[test]
    fn names_round_trip() {
        for state in [
            AnalysisState::PendingEntry,
            AnalysisState::Active,
            AnalysisState::Success,
            AnalysisState::Failure,
            AnalysisState::Expired,
        ] {
            assert_eq!(AnalysisState::parse(state.as_str()), Some(state));
        }
        assert_eq!(PriceSource::parse("DOMScrape"), Some(PriceSource::DomScrape));
        assert_eq!(Direction::parse("Short"), Some(Direction::Down));
    }
}
