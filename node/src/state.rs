//! Node lifecycle states.

/// Node operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Stores are connected, background tasks not yet running.
    Starting,
    /// Accepting ledger requests and sweeping settlement queues.
    Running,
    /// No new requests; background tasks are draining.
    ShuttingDown,
    Stopped,
}

impl NodeState {
    /// Check if the node is operational.
    pub fn is_operational(&self) -> bool {
        matches!(self, NodeState::Running)
    }

    /// Check if the node is accepting new requests.
    pub fn accepts_requests(&self) -> bool {
        matches!(self, NodeState::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Stopped)
    }
}
