//! Status - outbox / hospital の件数と run-loop の状態

use std::fmt;

use super::consumer_loop::LoopState;
use crate::ports::OutboxCounts;

/// Snapshot of a running relay.
///
/// # 使用例
/// ```ignore
/// let status = running.status().await?;
/// if status.counts.hospitalized > 0 {
///     warn!(%status, "events in hospital");
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStatus {
    pub counts: OutboxCounts,
    /// `(loop name, state)` per business topic, in topic order.
    pub consumers: Vec<(String, LoopState)>,
    pub retry_coordinator: LoopState,
    /// A delivery run is holding claimed rows right now.
    pub delivery_in_flight: bool,
}

impl RelayStatus {
    /// Every run-loop is polling or dispatching.
    pub fn is_healthy(&self) -> bool {
        let live = |state: &LoopState| matches!(state, LoopState::Polling | LoopState::Dispatching);
        live(&self.retry_coordinator) && self.consumers.iter().all(|(_, state)| live(state))
    }
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "outbox pending={} scheduled={} in_flight={} hospitalized={}",
            self.counts.pending,
            self.counts.scheduled,
            self.counts.in_flight,
            self.counts.hospitalized
        )?;
        for (name, state) in &self.consumers {
            write!(f, " {name}={state:?}")?;
        }
        write!(f, " retry={:?}", self.retry_coordinator)
    }
}
