//! §4.1 Agent: owns a detector, a local blacklist, a ledger cursor, and
//! step-local state; produces and validates signatures.

mod detection_agent;

pub use detection_agent::DetectionAgent;

use crate::types::NodeId;

/// Configuration a single agent is constructed with.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub node_id: NodeId,
    pub batch_size: usize,
    pub anomaly_rate: f64,
    pub rolling_window: usize,
    pub score_threshold: f64,
    pub validation_threshold: f64,
    pub min_confidence: f64,
    pub n_trees: usize,
    pub subsample_size: usize,
    pub seed: u64,
}
