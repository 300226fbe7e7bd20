//! Advisory, non-blocking event bus.
//!
//! Handlers are invoked synchronously by the firing task but MUST NOT be
//! allowed to hold the pipeline open — this bus backs onto a broadcast
//! channel (fire-and-forget: a send with no subscribers, or a subscriber
//! whose queue lags, never blocks the firing stage).

use tokio::sync::broadcast;

/// One optimization-tag event or a budget/recommendation signal.
#[derive(Debug, Clone)]
pub enum OptimizationEvent {
    /// An optimization tag was applied to a call.
    OptimizationApplied(String),
    BudgetWarning(String),
    BudgetExceeded(String),
    RecommendationGenerated(Recommendation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecommendationKind {
    Caching,
    Summarization,
    Deduplication,
}

#[derive(Debug, Clone)]
pub struct Recommendation {
    pub tool_name: String,
    pub kind: RecommendationKind,
    /// 1 (highest) .. N.
    pub priority: u8,
    pub estimated_savings: u64,
}

/// Cloneable handle onto a broadcast channel. Cloning shares the same
/// underlying channel (like `tokio::sync::broadcast::Sender`), so the
/// manager and its components can each hold a handle and fire events from
/// either side.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OptimizationEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        // Lagging subscribers drop old events rather than stall the bus;
        // advisory delivery, not a durable log.
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    /// Subscribe to future events. Independent of existing subscribers.
    pub fn subscribe(&self) -> broadcast::Receiver<OptimizationEvent> {
        self.sender.subscribe()
    }

    /// Fire-and-forget. A channel with zero subscribers is not an error.
    pub fn emit(&self, event: OptimizationEvent) {
        let _ = self.sender.send(event);
    }
}
