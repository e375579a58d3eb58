//! The homogeneous peer agent: owns a detector, a local blacklist, a
//! ledger cursor, and step-local state. Implements §4.1 in full.

use super::AgentConfig;
use crate::detector::{DetectorState, IsolationForest};
use crate::error::EngineResult;
use crate::events::SharedEventSink;
use crate::ledger::Ledger;
use crate::traffic::{SyntheticTrafficSource, TrafficSource};
use crate::types::{
    AnomalyFeatures, Fingerprint, NodeId, Signature, StepReport, TrafficPoint,
    UnassignedSignature, Vote,
};
use chrono::Utc;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

/// The autonomous participant that detects anomalies and votes on peers'.
pub struct DetectionAgent {
    node_id: NodeId,
    ledger: Arc<Ledger>,
    event_sink: SharedEventSink,
    traffic_source: Box<dyn TrafficSource>,
    detector: DetectorState,
    blacklist: HashSet<Fingerprint>,
    cursor_high_water: u64,
    last_anomaly: Option<AnomalyFeatures>,
    batch_size: usize,
    score_threshold: f64,
    validation_threshold: f64,
    min_confidence: f64,
    closed: bool,
}

impl DetectionAgent {
    /// `New(node_id, options, ledger, event_sink) -> Agent`.
    pub fn new(config: AgentConfig, ledger: Arc<Ledger>, event_sink: SharedEventSink) -> Self {
        let model = IsolationForest::new(
            config.n_trees,
            config.subsample_size,
            config.seed.wrapping_add(config.node_id.0),
        );
        let traffic_source = SyntheticTrafficSource::new(
            config.seed.wrapping_add(config.node_id.0 * 31),
            config.node_id.to_string(),
            config.anomaly_rate,
        );

        Self {
            node_id: config.node_id,
            ledger,
            event_sink,
            traffic_source: Box::new(traffic_source),
            detector: DetectorState::new(config.rolling_window, Box::new(model), config.score_threshold),
            blacklist: HashSet::new(),
            cursor_high_water: 0,
            last_anomaly: None,
            batch_size: config.batch_size,
            score_threshold: config.score_threshold,
            validation_threshold: config.validation_threshold,
            min_confidence: config.min_confidence,
            closed: false,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn cursor(&self) -> u64 {
        self.cursor_high_water
    }

    pub fn blacklist_len(&self) -> usize {
        self.blacklist.len()
    }

    /// One simulation tick; idempotent with respect to failed detection
    /// attempts (empty report on no anomaly).
    #[instrument(skip(self), fields(node = %self.node_id))]
    pub async fn step(&mut self) -> StepReport {
        if self.closed {
            return StepReport::default();
        }

        // Next Step must rebuild the detector on the current rolling
        // buffer before Detect if consensus left it dirty.
        self.detector.refit_if_needed();

        let batch = self.traffic_source.next(self.batch_size);
        if batch.is_empty() {
            return StepReport::default();
        }

        let buffer_snapshot = self.detector.buffer_snapshot();
        let combined: Vec<TrafficPoint> = buffer_snapshot
            .iter()
            .cloned()
            .chain(batch.iter().cloned())
            .collect();

        let flagged = self.detector.detect(&combined);
        self.detector.push_batch(&batch);

        if flagged.is_empty() {
            self.event_sink
                .counter("sentrymesh_steps_quiet_total", 1, &[]);
            return StepReport::default();
        }

        let features = self.build_features(&combined, &flagged);
        self.last_anomaly = Some(features.clone());

        let unsigned = UnassignedSignature {
            timestamp_nanos: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            node_id: self.node_id,
            confidence: features.confidence,
            features,
        };

        let own_signature_id = match self.ledger.append(unsigned).await {
            Ok(id) => {
                self.event_sink
                    .counter("sentrymesh_signatures_broadcast_total", 1, &[]);
                Some(id)
            }
            Err(e) => {
                error!(node = %self.node_id, error = %e, "ledger append failed");
                self.event_sink
                    .error("ledger.append_failed", &[("node", &self.node_id.to_string())]);
                None
            }
        };

        let polled = match self
            .ledger
            .read_since(self.cursor_high_water, Some(self.node_id))
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                warn!(node = %self.node_id, error = %e, "ledger read_since failed, skipping validation this step");
                self.event_sink
                    .warn("ledger.read_failed", &[("node", &self.node_id.to_string())]);
                Vec::new()
            }
        };

        if let Some(max_id) = polled.iter().map(|s| s.id).max() {
            self.cursor_high_water = self.cursor_high_water.max(max_id);
        }

        let votes_emitted = polled
            .iter()
            .map(|sig| Vote {
                signature_id: sig.id,
                voter_node_id: self.node_id,
                is_valid: self.validate(sig),
            })
            .collect();

        debug!(node = %self.node_id, own_signature_id, polled = polled.len(), "step complete");

        StepReport {
            own_signature_id,
            votes_emitted,
        }
    }

    /// Peer-side validation; pure with respect to agent state. A malformed
    /// signature can never reach here (the Ledger rejects those at
    /// decode time), so this never raises.
    pub fn validate(&self, sig: &Signature) -> bool {
        let similarity = match &self.last_anomaly {
            Some(reference) => reference.cosine_similarity(&sig.features),
            None => 0.0,
        };
        similarity >= self.validation_threshold && sig.confidence >= self.min_confidence
    }

    /// Triggered by the resolver on accepted signatures. Idempotent:
    /// calling twice with the same signature is a no-op the second time.
    pub fn apply_consensus(&mut self, sig: &Signature) {
        let fingerprint = sig.features.fingerprint();
        let newly_inserted = self.blacklist.insert(fingerprint);
        if newly_inserted {
            self.detector.mark_dirty();
            self.event_sink.counter(
                "sentrymesh_blacklist_entries_total",
                1,
                &[("node", &self.node_id.to_string())],
            );
        }
    }

    /// Releases detector resources.
    pub fn close(&mut self) {
        self.closed = true;
    }

    fn build_features(&self, combined: &[TrafficPoint], flagged: &[(usize, f64)]) -> AnomalyFeatures {
        let points: Vec<&TrafficPoint> = flagged.iter().map(|(i, _)| &combined[*i]).collect();
        let source_ids: BTreeSet<String> = points.iter().map(|p| p.source_id.clone()).collect();

        let channel_count = points.first().map(|p| p.channels().len()).unwrap_or(0);
        let mut feature_vector = Vec::with_capacity(channel_count * 2);

        for channel in 0..channel_count {
            let values: Vec<f64> = points.iter().map(|p| p.channels()[channel]).collect();
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            let variance =
                values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
            feature_vector.push(mean);
            feature_vector.push(variance.sqrt());
        }

        let mean_score = flagged.iter().map(|(_, s)| *s).sum::<f64>() / flagged.len() as f64;
        let confidence = (mean_score / self.score_threshold).clamp(0.0, 1.0);

        AnomalyFeatures {
            source_ids,
            feature_vector,
            confidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullEventSink;
    use std::time::Duration;

    fn config(node: u64) -> AgentConfig {
        AgentConfig {
            node_id: NodeId(node),
            batch_size: 32,
            anomaly_rate: 0.0,
            rolling_window: 64,
            score_threshold: 0.55,
            validation_threshold: 0.7,
            min_confidence: 0.5,
            n_trees: 40,
            subsample_size: 32,
            seed: 42,
        }
    }

    async fn ledger() -> (Arc<Ledger>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path(), 4, Duration::from_millis(200), 2, 64).unwrap();
        (Arc::new(ledger), dir)
    }

    #[tokio::test]
    async fn quiet_traffic_yields_empty_report() {
        let (ledger, _dir) = ledger().await;
        let mut agent = DetectionAgent::new(config(1), ledger, Arc::new(NullEventSink));

        for _ in 0..5 {
            let report = agent.step().await;
            assert!(report.own_signature_id.is_none());
            assert!(report.votes_emitted.is_empty());
        }
    }

    #[tokio::test]
    async fn validate_rejects_without_prior_anomaly() {
        let (ledger, _dir) = ledger().await;
        let agent = DetectionAgent::new(config(1), ledger.clone(), Arc::new(NullEventSink));

        let sig = Signature {
            id: 1,
            timestamp_nanos: 0,
            node_id: NodeId(2),
            features: AnomalyFeatures {
                source_ids: BTreeSet::new(),
                feature_vector: vec![1.0, 2.0],
                confidence: 0.9,
            },
            confidence: 0.9,
        };
        assert!(!agent.validate(&sig));
    }

    #[tokio::test]
    async fn apply_consensus_is_idempotent() {
        let (ledger, _dir) = ledger().await;
        let mut agent = DetectionAgent::new(config(1), ledger, Arc::new(NullEventSink));

        let sig = Signature {
            id: 1,
            timestamp_nanos: 0,
            node_id: NodeId(2),
            features: AnomalyFeatures {
                source_ids: BTreeSet::new(),
                feature_vector: vec![1.0, 2.0],
                confidence: 0.9,
            },
            confidence: 0.9,
        };

        agent.apply_consensus(&sig);
        let len_after_first = agent.blacklist_len();
        agent.apply_consensus(&sig);
        assert_eq!(agent.blacklist_len(), len_after_first);
    }

    #[tokio::test]
    async fn closed_agent_steps_are_no_ops() {
        let (ledger, _dir) = ledger().await;
        let mut agent = DetectionAgent::new(config(1), ledger, Arc::new(NullEventSink));
        agent.close();
        let report = agent.step().await;
        assert!(report.own_signature_id.is_none());
        assert!(report.votes_emitted.is_empty());
    }
}
