//! §4.5 Detector: an unsupervised outlier detector built from a recent
//! traffic window. The default realization is a tree-ensemble isolation
//! detector, deterministic given a seed; any equivalent detector
//! satisfying the `Detector` contract is acceptable.

mod isolation_forest;

pub use isolation_forest::IsolationForest;

use crate::types::TrafficPoint;

/// `Fit`/`Score` contract. The consensus layer depends only on this
/// contract, never on the concrete realization.
pub trait Detector: Send {
    /// Rebuild the model over the current rolling window.
    fn fit(&mut self, samples: &[TrafficPoint]);

    /// Per-sample anomaly score; higher is more anomalous.
    fn score(&self, samples: &[TrafficPoint]) -> Vec<f64>;
}

/// `Uninitialized -> Fitted` on first `Fit`, `Fitted -> Dirty` on
/// `ApplyConsensus`, `Dirty -> Fitted` on the next pre-Detect refit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStatus {
    Uninitialized,
    Fitted,
    Dirty,
}

/// Rolling traffic buffer plus the fitted model (or its refit marker).
/// Owned exclusively by a single agent.
pub struct DetectorState {
    buffer: std::collections::VecDeque<TrafficPoint>,
    capacity: usize,
    model: Box<dyn Detector>,
    status: ModelStatus,
    pub score_threshold: f64,
}

impl DetectorState {
    pub fn new(capacity: usize, model: Box<dyn Detector>, score_threshold: f64) -> Self {
        Self {
            buffer: std::collections::VecDeque::with_capacity(capacity),
            capacity,
            model,
            status: ModelStatus::Uninitialized,
            score_threshold,
        }
    }

    pub fn status(&self) -> ModelStatus {
        self.status
    }

    /// Mark the model dirty; the next `Step` must rebuild it before
    /// `Detect` runs. Triggered by `ApplyConsensus`.
    pub fn mark_dirty(&mut self) {
        if self.status == ModelStatus::Fitted {
            self.status = ModelStatus::Dirty;
        }
    }

    /// Push new points into the rolling window, evicting the oldest once
    /// `capacity` is exceeded.
    pub fn push_batch(&mut self, batch: &[TrafficPoint]) {
        for point in batch {
            if self.buffer.len() == self.capacity {
                self.buffer.pop_front();
            }
            self.buffer.push_back(point.clone());
        }
    }

    /// Rebuild the model on the current rolling window if uninitialized or
    /// dirty. No-op when already fitted, matching the state machine.
    pub fn refit_if_needed(&mut self) {
        if self.status == ModelStatus::Fitted {
            return;
        }
        let samples: Vec<TrafficPoint> = self.buffer.iter().cloned().collect();
        self.model.fit(&samples);
        self.status = ModelStatus::Fitted;
    }

    /// Run detection over the concatenation of the rolling buffer and a
    /// new batch; returns flagged indices (relative to `batch`) and their
    /// scores. The detector must already be fitted by the time this runs.
    pub fn detect(&self, batch: &[TrafficPoint]) -> Vec<(usize, f64)> {
        if batch.is_empty() {
            return Vec::new();
        }
        let scores = self.model.score(batch);
        scores
            .into_iter()
            .enumerate()
            .filter(|(_, score)| *score >= self.score_threshold)
            .collect()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// A clone of the current rolling buffer contents, oldest first.
    pub fn buffer_snapshot(&self) -> Vec<TrafficPoint> {
        self.buffer.iter().cloned().collect()
    }
}
