//! ClosedLoop Node
//!
//! Wires the ledger engine, correspondent settlement and telex messaging into
//! one process with a lifecycle, periodic settlement sweeps and metrics.

pub mod config;
pub mod error;
pub mod metrics;
pub mod node;
pub mod state;

pub use config::{LogFormat, NodeConfig};
pub use error::NodeError;
pub use metrics::{Metrics, MetricsSnapshot, SharedMetrics};
pub use node::Node;
pub use state::NodeState;
