// Typed event channel shared by the price feeds and the check scheduler.
use crate::model::{AnalysisState, PriceSample};
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    /// A new canonical price was accepted for `symbol`.
    PriceChanged { symbol: String, sample: PriceSample },

    /// No fresh sample for `misses` consecutive ticks.
    PriceStale { symbol: String, misses: u32 },

    /// One symbol group went through the evaluator.
    Checked {
        timestamp: DateTime<Utc>,
        count: usize,
        symbol: String,
    },

    /// Price resolution for a group gave up after exhausting its retries.
    CheckFailed { error: String },

    AnalysisTransitioned {
        id: String,
        symbol: String,
        from: AnalysisState,
        to: AnalysisState,
    },
}

/// Publish/subscribe over `tokio::sync::broadcast`; every subscriber sees every event.
pub struct EventBus {
    sender: broadcast::Sender<AppEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Events published with no subscribers are dropped.
    pub fn publish(&self, event: AppEvent) {
        match self.sender.send(event) {
            Ok(receiver_count) => {
                tracing::trace!("event published to {} subscribers", receiver_count);
            }
            Err(_) => {
                tracing::trace!("event published with no subscribers");
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
