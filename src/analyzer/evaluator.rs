// Pure lifecycle transition: (record, price, now) -> what should happen next.
use crate::model::{AnalysisRecord, AnalysisState};
use crate::utils::spans;

use chrono::{DateTime, Utc};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transition {
    /// Terminal record; nothing to do.
    Unchanged,
    /// No level reached; remember the price.
    Checked { price: f64 },
    Activated { price: f64 },
    Success { exit_price: f64 },
    Failure {
        exit_price: f64,
        /// Stopped out before the entry point was ever reached.
        entry_point_evaluation: bool,
    },
    Expired,
}

impl Transition {
    pub fn next_state(&self, current: AnalysisState) -> AnalysisState {
        match self {
            Transition::Unchanged | Transition::Checked { .. } => current,
            Transition::Activated { .. } => AnalysisState::Active,
            Transition::Success { .. } => AnalysisState::Success,
            Transition::Failure { .. } => AnalysisState::Failure,
            Transition::Expired => AnalysisState::Expired,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Transition::Success { .. } | Transition::Failure { .. } | Transition::Expired
        )
    }

    /// Applies the transition to an in-memory record.
    pub fn apply(&self, record: &mut AnalysisRecord, now: DateTime<Utc>) {
        match *self {
            Transition::Unchanged => return,
            Transition::Checked { price } => {
                record.last_checked_price = Some(price);
            }
            Transition::Activated { price } => {
                record.entry_hit = true;
                record.last_checked_price = Some(price);
            }
            Transition::Success { exit_price } | Transition::Failure { exit_price, .. } => {
                record.last_checked_price = Some(exit_price);
            }
            Transition::Expired => record.expired_at = Some(now),
        }
        record.state = self.next_state(record.state);
        record.last_checked_at = Some(now);
    }
}

pub trait Evaluator {
    fn evaluate(&self, record: &AnalysisRecord, price: f64, now: DateTime<Utc>) -> Transition;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AnalysisEvaluator;

impl AnalysisEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn evaluate_pending(&self, record: &AnalysisRecord, price: f64) -> Transition {
        if record.direction.is_adverse(price, record.stop_loss) {
            return Transition::Failure {
                exit_price: price,
                entry_point_evaluation: true,
            };
        }

        let Some(entry) = record.best_entry_point.as_ref() else {
            // A pending record without an entry point activates on the first price.
            return Transition::Activated { price };
        };
        let previous = record.last_checked_price.unwrap_or(record.reference_price);
        if spans(previous, price, entry.price) {
            Transition::Activated { price }
        } else {
            Transition::Checked { price }
        }
    }

    fn evaluate_active(&self, record: &AnalysisRecord, price: f64) -> Transition {
        let stop_hit = record.direction.is_adverse(price, record.stop_loss);
        let target_hit = record
            .nearest_target()
            .map(|t| record.direction.is_favorable(price, t.price))
            .unwrap_or(false);

        match (target_hit, stop_hit) {
            (true, true) => {
                warn!(
                    "{}: price {} hits both target and stop ({:?}); failing safe",
                    record.id,
                    price,
                    record.check_levels().err()
                );
                Transition::Failure {
                    exit_price: price,
                    entry_point_evaluation: false,
                }
            }
            (true, false) => Transition::Success { exit_price: price },
            (false, true) => Transition::Failure {
                exit_price: price,
                entry_point_evaluation: false,
            },
            (false, false) => Transition::Checked { price },
        }
    }
}

impl Evaluator for AnalysisEvaluator {
    fn evaluate(&self, record: &AnalysisRecord, price: f64, now: DateTime<Utc>) -> Transition {
        if record.state.is_terminal() {
            return Transition::Unchanged;
        }
        if now > record.expiry_at {
            return Transition::Expired;
        }

        match record.state {
            AnalysisState::PendingEntry => self.evaluate_pending(record, price),
            AnalysisState::Active => self.evaluate_active(record, price),
            _ => Transition::Unchanged,
        }
    }
}
