//! Core data model: traffic points, anomaly features, signatures, votes,
//! cursors, and blacklists.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

/// Identifier for an originating agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// A fixed-shape numeric traffic observation. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficPoint {
    pub source_id: String,
    pub packet_size: f64,
    pub mean_latency: f64,
    /// Additional channels beyond the two required for consensus.
    pub extra: Vec<f64>,
}

impl TrafficPoint {
    /// The fixed-length numeric channel vector used by the detector:
    /// `[packet_size, mean_latency, ...extra]`.
    pub fn channels(&self) -> Vec<f64> {
        let mut v = Vec::with_capacity(2 + self.extra.len());
        v.push(self.packet_size);
        v.push(self.mean_latency);
        v.extend_from_slice(&self.extra);
        v
    }
}

/// Aggregated summary of a detection event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyFeatures {
    /// Unordered set of opaque identifiers present in the anomalous window.
    pub source_ids: BTreeSet<String>,
    /// Fixed-length vector: mean then standard deviation of each channel.
    pub feature_vector: Vec<f64>,
    /// Severity in [0, 1], monotonically increasing in anomaly severity.
    pub confidence: f64,
}

impl AnomalyFeatures {
    /// Self-describing binary encoding: length-prefixed source id bytes
    /// followed by a length-prefixed float vector. This is the on-disk
    /// `features` blob format described for the Ledger's backing store.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();

        out.extend_from_slice(&(self.source_ids.len() as u32).to_le_bytes());
        for id in &self.source_ids {
            let bytes = id.as_bytes();
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(bytes);
        }

        out.extend_from_slice(&(self.feature_vector.len() as u32).to_le_bytes());
        for f in &self.feature_vector {
            out.extend_from_slice(&f.to_le_bytes());
        }

        out.extend_from_slice(&self.confidence.to_le_bytes());
        out
    }

    /// Inverse of [`AnomalyFeatures::encode`]. Returns `None` on any
    /// malformed input rather than panicking; callers map this to
    /// `EngineError::Corrupt`.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut cursor = 0usize;

        let read_u32 = |buf: &[u8], at: usize| -> Option<u32> {
            buf.get(at..at + 4).map(|s| u32::from_le_bytes(s.try_into().unwrap()))
        };

        let id_count = read_u32(bytes, cursor)? as usize;
        cursor += 4;

        let mut source_ids = BTreeSet::new();
        for _ in 0..id_count {
            let len = read_u32(bytes, cursor)? as usize;
            cursor += 4;
            let slice = bytes.get(cursor..cursor + len)?;
            source_ids.insert(String::from_utf8(slice.to_vec()).ok()?);
            cursor += len;
        }

        let vec_len = read_u32(bytes, cursor)? as usize;
        cursor += 4;

        let mut feature_vector = Vec::with_capacity(vec_len);
        for _ in 0..vec_len {
            let slice = bytes.get(cursor..cursor + 8)?;
            feature_vector.push(f64::from_le_bytes(slice.try_into().unwrap()));
            cursor += 8;
        }

        let slice = bytes.get(cursor..cursor + 8)?;
        let confidence = f64::from_le_bytes(slice.try_into().unwrap());

        Some(Self {
            source_ids,
            feature_vector,
            confidence,
        })
    }

    /// Zero-mean, unit-norm cosine similarity against another feature
    /// vector. Zero-vector inputs yield `0.0`, never `NaN`.
    pub fn cosine_similarity(&self, other: &AnomalyFeatures) -> f64 {
        cosine_similarity(&self.feature_vector, &other.feature_vector)
    }

    /// A grow-only blacklist fingerprint derived from these features:
    /// a SHA-256 digest over the sorted source ids and quantized feature
    /// vector, stable across encode/decode round trips.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        for id in &self.source_ids {
            hasher.update(id.as_bytes());
            hasher.update([0u8]);
        }
        for f in &self.feature_vector {
            // Quantize to damp floating point jitter across peers.
            let q = (f * 1e6).round() as i64;
            hasher.update(q.to_le_bytes());
        }
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Fingerprint(out)
    }
}

/// Zero-mean, unit-norm cosine similarity. Returns `0.0` for degenerate
/// (zero-norm or empty) inputs rather than `NaN`.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mean = |v: &[f64]| v.iter().sum::<f64>() / v.len() as f64;
    let a_mean = mean(a);
    let b_mean = mean(b);
    let a_c: Vec<f64> = a.iter().map(|x| x - a_mean).collect();
    let b_c: Vec<f64> = b.iter().map(|x| x - b_mean).collect();

    let a_norm = a_c.iter().map(|x| x * x).sum::<f64>().sqrt();
    let b_norm = b_c.iter().map(|x| x * x).sum::<f64>().sqrt();

    if a_norm == 0.0 || b_norm == 0.0 {
        return 0.0;
    }

    let dot: f64 = a_c.iter().zip(b_c.iter()).map(|(x, y)| x * y).sum();
    (dot / (a_norm * b_norm)).clamp(-1.0, 1.0)
}

/// Grow-only blacklist fingerprint, derived from `AnomalyFeatures`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// The unit exchanged via the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    /// Assigned exclusively by the Ledger at append time.
    pub id: u64,
    /// Wall-clock instant at creation, nanoseconds since epoch.
    pub timestamp_nanos: i64,
    pub node_id: NodeId,
    pub features: AnomalyFeatures,
    /// Denormalized copy of `features.confidence`.
    pub confidence: f64,
}

/// A signature before the Ledger has assigned it an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnassignedSignature {
    pub timestamp_nanos: i64,
    pub node_id: NodeId,
    pub features: AnomalyFeatures,
    pub confidence: f64,
}

/// `(signature_id, voter_node_id, is_valid)`. Ephemeral: lives only for the
/// step in which it was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub signature_id: u64,
    pub voter_node_id: NodeId,
    pub is_valid: bool,
}

/// Per-agent watermark bounding which ledger ids have been validated.
/// Invariant: non-decreasing across the lifetime of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor(pub u64);

impl Cursor {
    pub fn advance_to(&mut self, id: u64) {
        if id > self.0 {
            self.0 = id;
        }
    }
}

/// Outcome of a single agent `Step` call.
#[derive(Debug, Clone, Default)]
pub struct StepReport {
    pub own_signature_id: Option<u64>,
    pub votes_emitted: Vec<Vote>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_features() -> AnomalyFeatures {
        AnomalyFeatures {
            source_ids: ["10.0.0.1".to_string(), "10.0.0.2".to_string()]
                .into_iter()
                .collect(),
            feature_vector: vec![1.5, -2.25, 3.0, 0.0],
            confidence: 0.87,
        }
    }

    #[test]
    fn encode_decode_round_trips() {
        let features = sample_features();
        let encoded = features.encode();
        let decoded = AnomalyFeatures::decode(&encoded).expect("decode");
        assert_eq!(features, decoded);
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let features = sample_features();
        let mut encoded = features.encode();
        encoded.truncate(encoded.len() - 3);
        assert!(AnomalyFeatures::decode(&encoded).is_none());
    }

    #[test]
    fn cosine_similarity_zero_vector_never_nan() {
        let sim = cosine_similarity(&[0.0, 0.0, 0.0], &[1.0, 2.0, 3.0]);
        assert_eq!(sim, 0.0);
        assert!(!sim.is_nan());
    }

    #[test]
    fn cosine_similarity_identical_vectors_is_one() {
        let v = vec![1.0, 4.0, 2.0, 9.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-9);
    }

    #[test]
    fn fingerprint_is_stable_across_clones() {
        let features = sample_features();
        assert_eq!(features.fingerprint(), features.clone().fingerprint());
    }

    #[test]
    fn cursor_never_decreases() {
        let mut c = Cursor::default();
        c.advance_to(5);
        c.advance_to(3);
        assert_eq!(c.0, 5);
        c.advance_to(9);
        assert_eq!(c.0, 9);
    }
}
