// Moves terminal analyses from the active table into the archive.
use crate::model::{ArchiveEntry, StorageError};
use crate::storage::SqliteStorage;

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub enum ArchiveOutcome {
    Archived(ArchiveEntry),
    /// The record was no longer active; nothing was written.
    AlreadyArchived,
}

pub struct ArchiveMover {
    storage: Arc<Mutex<SqliteStorage>>,
}

impl ArchiveMover {
    pub fn new(storage: Arc<Mutex<SqliteStorage>>) -> Self {
        Self { storage }
    }

    /// Insert-and-delete in one transaction. Safe to call again for the same id.
    pub async fn archive_and_remove(
        &self,
        id: &str,
        exit_price: f64,
        is_success: bool,
        is_entry_point_evaluation: bool,
    ) -> Result<ArchiveOutcome, StorageError> {
        let storage = self.storage.lock().await;
        Self::move_record(&storage, id, exit_price, is_success, is_entry_point_evaluation)
    }

    /// Like `archive_and_remove`, but writes nothing if `token` is cancelled by the
    /// time the storage lock is held. `Ok(None)` means the move was abandoned.
    pub async fn archive_unless_cancelled(
        &self,
        id: &str,
        exit_price: f64,
        is_success: bool,
        is_entry_point_evaluation: bool,
        token: &CancellationToken,
    ) -> Result<Option<ArchiveOutcome>, StorageError> {
        let storage = self.storage.lock().await;
        if token.is_cancelled() {
            debug!("Archive of {} abandoned: check cancelled", id);
            return Ok(None);
        }
        Self::move_record(&storage, id, exit_price, is_success, is_entry_point_evaluation).map(Some)
    }

    fn move_record(
        storage: &SqliteStorage,
        id: &str,
        exit_price: f64,
        is_success: bool,
        is_entry_point_evaluation: bool,
    ) -> Result<ArchiveOutcome, StorageError> {
        let archived = storage.archive_record(id, |record| ArchiveEntry {
            source_record_id: record.id.clone(),
            symbol: record.symbol.clone(),
            direction: record.direction,
            exit_price,
            is_success,
            is_entry_point_evaluation,
            entry_hit: record.entry_hit,
            target_hit: is_success && !is_entry_point_evaluation,
            profit_loss: record.direction.signed_move(record.entry_price(), exit_price),
            archived_at: Utc::now(),
        })?;

        match archived {
            Some(entry) => {
                info!(
                    "Archived {} ({}) at {} with P/L {:.2}",
                    entry.source_record_id,
                    if entry.is_success { "success" } else { "failure" },
                    entry.exit_price,
                    entry.profit_loss
                );
                Ok(ArchiveOutcome::Archived(entry))
            }
            None => {
                debug!("Record {} already archived or gone", id);
                Ok(ArchiveOutcome::AlreadyArchived)
            }
        }
    }
}
