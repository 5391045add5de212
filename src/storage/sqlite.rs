use crate::config::SymbolConfig;
use crate::model::{
    AnalysisRecord, AnalysisState, ArchiveEntry, Direction, EntryPoint, PriceSample, PriceSource,
    StorageError, Target,
};
use crate::utils::{format_datetime, parse_datetime};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::warn;

const RECORD_COLUMNS: &str = "id, symbol, direction, reference_price, created_at, expiry_at, stop_loss,
     targets, entry_price, entry_reason, state, entry_hit, last_checked_price, last_checked_at, expired_at";

/// Which active analyses to load. States are always the non-terminal ones.
/// An empty name list matches every symbol; names compare case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct ActiveFilter {
    pub symbols: Vec<String>,
}

impl ActiveFilter {
    /// Matches the stored symbol exactly as given (ignoring case).
    pub fn for_symbol(symbol: impl Into<String>) -> Self {
        Self {
            symbols: vec![symbol.into()],
        }
    }

    /// Matches the instrument under its configured name or any of its aliases.
    pub fn for_instrument(cfg: &SymbolConfig) -> Self {
        let mut symbols = vec![cfg.symbol.clone()];
        symbols.extend(cfg.aliases.iter().cloned());
        Self { symbols }
    }

    fn matches(&self, symbol: &str) -> bool {
        let symbol = symbol.trim();
        self.symbols.is_empty() || self.symbols.iter().any(|s| s.eq_ignore_ascii_case(symbol))
    }
}

pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Opens (or creates) the database and runs migrations. ":memory:" works for tests.
    pub fn new(db_path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS analyses (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL,
                reference_price REAL NOT NULL,
                created_at TEXT NOT NULL,
                expiry_at TEXT NOT NULL,
                stop_loss REAL NOT NULL,
                targets TEXT NOT NULL,
                entry_price REAL,
                entry_reason TEXT,
                state TEXT NOT NULL,
                last_checked_price REAL,
                last_checked_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_analyses_symbol_state ON analyses (symbol, state);

            CREATE TABLE IF NOT EXISTS archive (
                source_record_id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL,
                exit_price REAL NOT NULL,
                is_success INTEGER NOT NULL,
                is_entry_point_evaluation INTEGER NOT NULL,
                entry_hit INTEGER NOT NULL,
                target_hit INTEGER NOT NULL,
                profit_loss REAL NOT NULL,
                archived_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS price_cache (
                symbol TEXT PRIMARY KEY,
                value REAL NOT NULL,
                source TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            ",
        )?;

        Self::migrate_add_column_if_missing(&conn, "analyses", "entry_hit", "INTEGER NOT NULL DEFAULT 0")?;
        Self::migrate_add_column_if_missing(&conn, "analyses", "expired_at", "TEXT")?;

        Ok(Self { conn })
    }

    /// Adds the column if an older database does not have it yet.
    fn migrate_add_column_if_missing(
        conn: &Connection,
        table: &str,
        column: &str,
        column_def: &str,
    ) -> Result<(), StorageError> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let existing_columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<_, _>>()?;

        if !existing_columns.iter().any(|c| c == column) {
            let alter_sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, column_def);
            conn.execute(&alter_sql, [])?;
        }

        Ok(())
    }

    pub fn insert_analysis(&self, record: &AnalysisRecord) -> Result<(), StorageError> {
        let targets = serde_json::to_string(&record.targets)
            .map_err(|e| StorageError::InvalidData(e.to_string()))?;
        let (entry_price, entry_reason) = match &record.best_entry_point {
            Some(e) => (Some(e.price), Some(e.reason.clone())),
            None => (None, None),
        };

        self.conn.execute(
            "INSERT INTO analyses (
                id, symbol, direction, reference_price, created_at, expiry_at, stop_loss,
                targets, entry_price, entry_reason, state, entry_hit,
                last_checked_price, last_checked_at, expired_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                &record.id,
                &record.symbol,
                record.direction.as_str(),
                record.reference_price,
                format_datetime(&record.created_at),
                format_datetime(&record.expiry_at),
                record.stop_loss,
                targets,
                entry_price,
                entry_reason,
                record.state.as_str(),
                record.entry_hit,
                record.last_checked_price,
                record.last_checked_at.as_ref().map(format_datetime),
                record.expired_at.as_ref().map(format_datetime),
            ],
        )?;
        Ok(())
    }

    pub fn get_analysis(&self, id: &str) -> Result<Option<AnalysisRecord>, StorageError> {
        let sql = format!("SELECT {} FROM analyses WHERE id = ?1", RECORD_COLUMNS);
        let record = self
            .conn
            .query_row(&sql, params![id], Self::map_record)
            .optional()?;
        Ok(record)
    }

    /// Pending and active analyses, oldest first.
    pub fn list_active(&self, filter: &ActiveFilter) -> Result<Vec<AnalysisRecord>, StorageError> {
        let sql = format!(
            "SELECT {} FROM analyses
             WHERE state IN ('PENDING_ENTRY', 'ACTIVE')
             ORDER BY created_at ASC",
            RECORD_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::map_record)?;

        let mut records = Vec::new();
        for record in rows {
            let record = record?;
            if filter.matches(&record.symbol) {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Records the last price an analysis was checked against. Returns false if it is gone.
    pub fn update_checked(
        &self,
        id: &str,
        price: f64,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let changed = self.conn.execute(
            "UPDATE analyses SET last_checked_price = ?2, last_checked_at = ?3
             WHERE id = ?1 AND state IN ('PENDING_ENTRY', 'ACTIVE')",
            params![id, price, format_datetime(&at)],
        )?;
        Ok(changed > 0)
    }

    /// PENDING_ENTRY -> ACTIVE. A no-op for records in any other state.
    pub fn mark_activated(
        &self,
        id: &str,
        price: f64,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let changed = self.conn.execute(
            "UPDATE analyses SET state = 'ACTIVE', entry_hit = 1,
                 last_checked_price = ?2, last_checked_at = ?3
             WHERE id = ?1 AND state = 'PENDING_ENTRY'",
            params![id, price, format_datetime(&at)],
        )?;
        Ok(changed > 0)
    }

    pub fn mark_expired(&self, id: &str, at: DateTime<Utc>) -> Result<bool, StorageError> {
        let changed = self.conn.execute(
            "UPDATE analyses SET state = 'EXPIRED', expired_at = ?2
             WHERE id = ?1 AND state IN ('PENDING_ENTRY', 'ACTIVE')",
            params![id, format_datetime(&at)],
        )?;
        Ok(changed > 0)
    }

    /// Deletes expired analyses whose grace period has elapsed.
    pub fn delete_expired(&self, grace: Duration, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, expired_at FROM analyses WHERE state = 'EXPIRED'")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;

        let mut due = Vec::new();
        for row in rows {
            let (id, expired_at) = row?;
            let ripe = match expired_at.as_deref().and_then(parse_datetime) {
                Some(at) => at + grace <= now,
                None => {
                    warn!(
                        "Expired analysis {} has no readable expired_at ({:?}); deleting without grace",
                        id, expired_at
                    );
                    true
                }
            };
            if ripe {
                due.push(id);
            }
        }

        let mut deleted = 0;
        for id in &due {
            deleted += self.conn.execute(
                "DELETE FROM analyses WHERE id = ?1 AND state = 'EXPIRED'",
                params![id],
            )?;
        }
        Ok(deleted)
    }

    /// Moves one analysis into the archive in a single transaction.
    /// `Ok(None)` means the record was no longer active (already archived elsewhere).
    pub fn archive_record<F>(&self, id: &str, build: F) -> Result<Option<ArchiveEntry>, StorageError>
    where
        F: FnOnce(&AnalysisRecord) -> ArchiveEntry,
    {
        let tx = self.conn.unchecked_transaction()?;

        let sql = format!(
            "SELECT {} FROM analyses WHERE id = ?1 AND state IN ('PENDING_ENTRY', 'ACTIVE')",
            RECORD_COLUMNS
        );
        let Some(record) = tx.query_row(&sql, params![id], Self::map_record).optional()? else {
            return Ok(None);
        };

        let entry = build(&record);
        tx.execute(
            "INSERT OR IGNORE INTO archive (
                source_record_id, symbol, direction, exit_price, is_success,
                is_entry_point_evaluation, entry_hit, target_hit, profit_loss, archived_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                &entry.source_record_id,
                &entry.symbol,
                entry.direction.as_str(),
                entry.exit_price,
                entry.is_success,
                entry.is_entry_point_evaluation,
                entry.entry_hit,
                entry.target_hit,
                entry.profit_loss,
                format_datetime(&entry.archived_at),
            ],
        )?;
        tx.execute("DELETE FROM analyses WHERE id = ?1", params![id])?;
        tx.commit()?;

        Ok(Some(entry))
    }

    pub fn get_archive_entries(&self) -> Result<Vec<ArchiveEntry>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT source_record_id, symbol, direction, exit_price, is_success,
                    is_entry_point_evaluation, entry_hit, target_hit, profit_loss, archived_at
             FROM archive ORDER BY archived_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let direction: String = row.get(2)?;
            let archived_at: String = row.get(9)?;
            Ok(ArchiveEntry {
                source_record_id: row.get(0)?,
                symbol: row.get(1)?,
                direction: Direction::parse(&direction)
                    .ok_or_else(|| conversion_error(2, format!("unknown direction {}", direction)))?,
                exit_price: row.get(3)?,
                is_success: row.get(4)?,
                is_entry_point_evaluation: row.get(5)?,
                entry_hit: row.get(6)?,
                target_hit: row.get(7)?,
                profit_loss: row.get(8)?,
                archived_at: parse_datetime(&archived_at)
                    .ok_or_else(|| conversion_error(9, format!("bad timestamp {}", archived_at)))?,
            })
        })?;

        let mut entries = Vec::new();
        for entry in rows {
            entries.push(entry?);
        }
        Ok(entries)
    }

    pub fn save_cached_sample(&self, symbol: &str, sample: &PriceSample) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO price_cache (symbol, value, source, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                symbol,
                sample.value,
                sample.source.as_str(),
                format_datetime(&sample.timestamp),
            ],
        )?;
        Ok(())
    }

    pub fn load_cached_sample(&self, symbol: &str) -> Result<Option<PriceSample>, StorageError> {
        let sample = self
            .conn
            .query_row(
                "SELECT value, source, timestamp FROM price_cache WHERE symbol = ?1",
                params![symbol],
                |row| {
                    let source: String = row.get(1)?;
                    let timestamp: String = row.get(2)?;
                    Ok(PriceSample {
                        value: row.get(0)?,
                        source: PriceSource::parse(&source)
                            .ok_or_else(|| conversion_error(1, format!("unknown source {}", source)))?,
                        timestamp: parse_datetime(&timestamp)
                            .ok_or_else(|| conversion_error(2, format!("bad timestamp {}", timestamp)))?,
                    })
                },
            )
            .optional()?;
        Ok(sample)
    }

    fn map_record(row: &Row) -> Result<AnalysisRecord, rusqlite::Error> {
        let direction: String = row.get(2)?;
        let created_at: String = row.get(4)?;
        let expiry_at: String = row.get(5)?;
        let targets_json: String = row.get(7)?;
        let entry_price: Option<f64> = row.get(8)?;
        let entry_reason: Option<String> = row.get(9)?;
        let state: String = row.get(10)?;
        let last_checked_at: Option<String> = row.get(13)?;
        let expired_at: Option<String> = row.get(14)?;

        let targets: Vec<Target> = serde_json::from_str(&targets_json)
            .map_err(|e| conversion_error(7, format!("bad targets: {}", e)))?;

        Ok(AnalysisRecord {
            id: row.get(0)?,
            symbol: row.get(1)?,
            direction: Direction::parse(&direction)
                .ok_or_else(|| conversion_error(2, format!("unknown direction {}", direction)))?,
            reference_price: row.get(3)?,
            created_at: parse_datetime(&created_at)
                .ok_or_else(|| conversion_error(4, format!("bad timestamp {}", created_at)))?,
            expiry_at: parse_datetime(&expiry_at)
                .ok_or_else(|| conversion_error(5, format!("bad timestamp {}", expiry_at)))?,
            stop_loss: row.get(6)?,
            targets,
            best_entry_point: entry_price.map(|price| EntryPoint {
                price,
                reason: entry_reason.unwrap_or_default(),
            }),
            state: AnalysisState::parse(&state)
                .ok_or_else(|| conversion_error(10, format!("unknown state {}", state)))?,
            entry_hit: row.get(11)?,
            last_checked_price: row.get(12)?,
            last_checked_at: last_checked_at.as_deref().and_then(parse_datetime),
            expired_at: expired_at.as_deref().and_then(parse_datetime),
        })
    }
}

fn conversion_error(column: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewAnalysis;

    fn record(id: &str, symbol: &str, entry: Option<f64>) -> AnalysisRecord {
        let now = Utc::now();
        AnalysisRecord::new(
            id,
            NewAnalysis {
                symbol: symbol.into(),
                direction: Direction::Up,
                reference_price: 3045.0,
                expiry_at: now + Duration::hours(2),
                stop_loss: 3030.0,
                targets: vec![Target::at(3100.0), Target::at(3080.0)],
                best_entry_point: entry.map(|price| EntryPoint {
                    price,
                    reason: "retest".into(),
                }),
            },
            now,
        )
        .unwrap()
    }

    fn archive_entry(r: &AnalysisRecord) -> ArchiveEntry {
        ArchiveEntry {
            source_record_id: r.id.clone(),
            symbol: r.symbol.clone(),
            direction: r.direction,
            exit_price: 3085.0,
            is_success: true,
            is_entry_point_evaluation: false,
            entry_hit: r.entry_hit,
            target_hit: true,
            profit_loss: 40.0,
            archived_at: Utc::now(),
        }
    }

    #[test]
    fn records_round_trip() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let original = record("a1", "XAUUSD", Some(3050.0));
        storage.insert_analysis(&original).unwrap();

        let loaded = storage.get_analysis("a1").unwrap().unwrap();
        assert_eq!(loaded.state, AnalysisState::PendingEntry);
        assert_eq!(loaded.targets[0].price, 3080.0);
        assert_eq!(loaded.best_entry_point.unwrap().reason, "retest");
        assert!(storage.get_analysis("missing").unwrap().is_none());
    }

    #[test]
    fn list_active_filters_by_symbol_and_state() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        storage.insert_analysis(&record("a1", "XAUUSD", None)).unwrap();
        storage.insert_analysis(&record("a2", "EURUSD", None)).unwrap();
        storage.insert_analysis(&record("a3", "XAUUSD", None)).unwrap();
        storage.mark_expired("a3", Utc::now()).unwrap();

        assert_eq!(storage.list_active(&ActiveFilter::default()).unwrap().len(), 2);
        let gold = storage.list_active(&ActiveFilter::for_symbol("XAUUSD")).unwrap();
        assert_eq!(gold.len(), 1);
        assert_eq!(gold[0].id, "a1");
    }

    #[test]
    fn instrument_filter_finds_records_stored_under_an_alias() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        storage.insert_analysis(&record("a1", "XAUUSD", None)).unwrap();
        storage.insert_analysis(&record("a2", "gold", None)).unwrap();
        storage.insert_analysis(&record("a3", "EURUSD", None)).unwrap();

        let gold = storage
            .list_active(&ActiveFilter::for_instrument(&SymbolConfig::default()))
            .unwrap();
        let mut ids: Vec<&str> = gold.iter().map(|r| r.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a1", "a2"]);

        let exact = storage.list_active(&ActiveFilter::for_symbol("xauusd")).unwrap();
        assert_eq!(exact.len(), 1);
    }

    #[test]
    fn activation_is_one_way() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        storage.insert_analysis(&record("a1", "XAUUSD", Some(3050.0))).unwrap();
        let now = Utc::now();

        assert!(storage.mark_activated("a1", 3051.0, now).unwrap());
        assert!(!storage.mark_activated("a1", 3052.0, now).unwrap());

        let loaded = storage.get_analysis("a1").unwrap().unwrap();
        assert_eq!(loaded.state, AnalysisState::Active);
        assert!(loaded.entry_hit);
        assert_eq!(loaded.last_checked_price, Some(3051.0));
    }

    #[test]
    fn archiving_twice_leaves_one_entry() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        storage.insert_analysis(&record("a1", "XAUUSD", None)).unwrap();

        assert!(storage.archive_record("a1", archive_entry).unwrap().is_some());
        assert!(storage.archive_record("a1", archive_entry).unwrap().is_none());

        assert_eq!(storage.get_archive_entries().unwrap().len(), 1);
        assert!(storage.get_analysis("a1").unwrap().is_none());
    }

    #[test]
    fn expired_records_wait_for_the_grace_period() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        storage.insert_analysis(&record("a1", "XAUUSD", None)).unwrap();
        let expired_at = Utc::now();
        storage.mark_expired("a1", expired_at).unwrap();

        let grace = Duration::minutes(5);
        assert_eq!(storage.delete_expired(grace, expired_at + Duration::minutes(1)).unwrap(), 0);
        assert_eq!(storage.delete_expired(grace, expired_at + Duration::minutes(6)).unwrap(), 1);
        assert!(storage.get_analysis("a1").unwrap().is_none());
    }

    #[test]
    fn unreadable_expiry_timestamp_does_not_block_deletion() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        storage.insert_analysis(&record("a1", "XAUUSD", None)).unwrap();
        storage.insert_analysis(&record("a2", "XAUUSD", None)).unwrap();
        let now = Utc::now();
        storage.mark_expired("a1", now).unwrap();
        storage.mark_expired("a2", now).unwrap();
        storage
            .conn
            .execute("UPDATE analyses SET expired_at = 'garbage' WHERE id = 'a1'", [])
            .unwrap();

        assert_eq!(storage.delete_expired(Duration::minutes(5), now).unwrap(), 1);
        assert!(storage.get_analysis("a1").unwrap().is_none());
        assert!(storage.get_analysis("a2").unwrap().is_some());
    }

    #[test]
    fn cached_sample_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let path = path.to_str().unwrap();
        let sample = PriceSample::new(3061.2, PriceSource::DomScrape);

        SqliteStorage::new(path)
            .unwrap()
            .save_cached_sample("XAUUSD", &sample)
            .unwrap();

        let reopened = SqliteStorage::new(path).unwrap();
        let loaded = reopened.load_cached_sample("XAUUSD").unwrap().unwrap();
        assert_eq!(loaded.value, 3061.2);
        assert_eq!(loaded.source, PriceSource::DomScrape);
        assert!(reopened.load_cached_sample("EURUSD").unwrap().is_none());
    }
}
