//! §4.4 ConsensusResolver: evaluates the signatures newly appended in a
//! step against that same step's votes, decides which reach consensus,
//! and dispatches `ApplyConsensus` to every agent exactly once per
//! accepted signature.

use crate::agents::DetectionAgent;
use crate::error::EngineResult;
use crate::ledger::Ledger;
use crate::scheduler::AgentStep;
use crate::types::NodeId;
use std::collections::{HashMap, HashSet};
use tracing::{instrument, trace};

/// Acceptance state. Lives for the lifetime of an `Engine`, not just a
/// single step, but only to guarantee at-most-once dispatch — vote
/// tallies themselves are never carried across steps.
pub struct ConsensusResolver {
    majority_ratio: f64,
    min_votes: usize,
    accepted: HashSet<u64>,
}

impl ConsensusResolver {
    pub fn new(majority_ratio: f64, min_votes: usize) -> Self {
        Self {
            majority_ratio,
            min_votes,
            accepted: HashSet::new(),
        }
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.len()
    }

    fn acceptance_threshold(&self, total_voters: usize) -> usize {
        let ratio_threshold = (total_voters as f64 * self.majority_ratio).ceil() as usize;
        ratio_threshold.max(self.min_votes)
    }

    /// Evaluates only the signatures this step's reports mark as freshly
    /// appended (`own_signature_id`) against only this step's votes on
    /// them, decides which cross the acceptance threshold, and applies
    /// consensus for those to every currently-available agent in
    /// ascending node-id order. A signature not accepted in the step it
    /// was appended is never revisited: votes on a stale signature id
    /// that trickle in on a later step are discarded. Returns the
    /// newly-accepted signature ids, ascending.
    #[instrument(skip(self, agents, reports, ledger))]
    pub async fn resolve(
        &mut self,
        agents: &mut HashMap<NodeId, DetectionAgent>,
        reports: &[AgentStep],
        ledger: &Ledger,
        total_agents: usize,
    ) -> EngineResult<Vec<u64>> {
        let step_signature_ids: HashSet<u64> = reports
            .iter()
            .filter_map(|(_, report)| report.as_ref().and_then(|r| r.own_signature_id))
            .collect();

        let mut approvals: HashMap<u64, HashSet<NodeId>> = HashMap::new();
        for (voter, report) in reports {
            let Some(report) = report else { continue };
            for vote in &report.votes_emitted {
                if vote.voter_node_id != *voter {
                    continue;
                }
                if !step_signature_ids.contains(&vote.signature_id) {
                    // A vote on a signature that wasn't appended this
                    // step, e.g. a lagging cursor catching up late; its
                    // window already closed.
                    continue;
                }
                if vote.is_valid {
                    approvals
                        .entry(vote.signature_id)
                        .or_default()
                        .insert(vote.voter_node_id);
                }
            }
        }

        let total_voters = total_agents.saturating_sub(1);
        let threshold = self.acceptance_threshold(total_voters);

        let mut newly_accepted: Vec<u64> = step_signature_ids
            .iter()
            .filter(|id| {
                !self.accepted.contains(id)
                    && approvals.get(id).map(HashSet::len).unwrap_or(0) >= threshold
            })
            .copied()
            .collect();
        newly_accepted.sort_unstable();

        for id in &newly_accepted {
            self.accepted.insert(*id);
        }

        for id in &newly_accepted {
            let Some(sig) = ledger.get_by_id(*id).await? else {
                trace!(id, "accepted signature no longer in ledger, skipping dispatch");
                continue;
            };
            let mut node_ids: Vec<NodeId> = agents.keys().copied().collect();
            node_ids.sort_unstable();
            for node_id in node_ids {
                if let Some(agent) = agents.get_mut(&node_id) {
                    agent.apply_consensus(&sig);
                }
            }
        }

        Ok(newly_accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentConfig;
    use crate::events::NullEventSink;
    use crate::types::{StepReport, Vote};
    use std::sync::Arc;
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
            n_trees: 20,
            subsample_size: 16,
            seed: 7,
        }
    }

    async fn ledger_with_one_signature() -> (Arc<Ledger>, tempfile::TempDir, u64) {
        use crate::types::{AnomalyFeatures, UnassignedSignature};
        use std::collections::BTreeSet;

        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path(), 4, Duration::from_millis(200), 2, 64).unwrap();
        let id = ledger
            .append(UnassignedSignature {
                timestamp_nanos: 0,
                node_id: NodeId(1),
                features: AnomalyFeatures {
                    source_ids: BTreeSet::new(),
                    feature_vector: vec![1.0, 2.0],
                    confidence: 0.9,
                },
                confidence: 0.9,
            })
            .await
            .unwrap();
        (Arc::new(ledger), dir, id)
    }

    /// Builds one step's reports: the originator's `own_signature_id`
    /// report plus a vote report from each voter, all in the same step —
    /// matching the resolver's requirement that a signature's votes be
    /// evaluated in the step it was appended.
    fn step_with_votes(signature_id: u64, originator: u64, voters: &[u64]) -> Vec<AgentStep> {
        let mut reports = vec![(
            NodeId(originator),
            Some(StepReport {
                own_signature_id: Some(signature_id),
                votes_emitted: Vec::new(),
            }),
        )];
        reports.extend(voters.iter().map(|v| {
            (
                NodeId(*v),
                Some(StepReport {
                    own_signature_id: None,
                    votes_emitted: vec![Vote {
                        signature_id,
                        voter_node_id: NodeId(*v),
                        is_valid: true,
                    }],
                }),
            )
        }));
        reports
    }

    #[tokio::test]
    async fn accepts_once_majority_and_min_votes_are_met() {
        let (ledger, _dir, id) = ledger_with_one_signature().await;
        let mut resolver = ConsensusResolver::new(0.5, 2);
        let mut agents = HashMap::new();
        for n in 1..=4 {
            agents.insert(
                NodeId(n),
                DetectionAgent::new(config(n), ledger.clone(), Arc::new(NullEventSink)),
            );
        }

        let reports = step_with_votes(id, 1, &[2, 3]);
        let accepted = resolver
            .resolve(&mut agents, &reports, &ledger, 4)
            .await
            .unwrap();
        assert_eq!(accepted, vec![id]);
        assert_eq!(resolver.accepted_count(), 1);
    }

    #[tokio::test]
    async fn below_threshold_stays_pending() {
        let (ledger, _dir, id) = ledger_with_one_signature().await;
        let mut resolver = ConsensusResolver::new(0.9, 1);
        let mut agents = HashMap::new();
        agents.insert(
            NodeId(1),
            DetectionAgent::new(config(1), ledger.clone(), Arc::new(NullEventSink)),
        );

        let reports = step_with_votes(id, 1, &[2]);
        let accepted = resolver
            .resolve(&mut agents, &reports, &ledger, 5)
            .await
            .unwrap();
        assert!(accepted.is_empty());
    }

    #[tokio::test]
    async fn votes_on_a_signature_missed_in_its_own_step_are_not_revisited() {
        let (ledger, _dir, id) = ledger_with_one_signature().await;
        let mut resolver = ConsensusResolver::new(0.9, 1);
        let mut agents = HashMap::new();
        agents.insert(
            NodeId(1),
            DetectionAgent::new(config(1), ledger.clone(), Arc::new(NullEventSink)),
        );

        // Step 1: the signature is appended but only one vote arrives,
        // short of the 0.9-ratio threshold over 4 voters (needs 4).
        let first_step = step_with_votes(id, 1, &[2]);
        let first = resolver
            .resolve(&mut agents, &first_step, &ledger, 5)
            .await
            .unwrap();
        assert!(first.is_empty());

        // Step 2: three more votes trickle in for the same signature, but
        // it is no longer marked as this step's own_signature_id, so its
        // window has closed; these votes must not resurrect it even
        // though the cumulative vote count would now clear the threshold.
        let late_votes: Vec<AgentStep> = vec![3, 4, 5]
            .into_iter()
            .map(|v| {
                (
                    NodeId(v),
                    Some(StepReport {
                        own_signature_id: None,
                        votes_emitted: vec![Vote {
                            signature_id: id,
                            voter_node_id: NodeId(v),
                            is_valid: true,
                        }],
                    }),
                )
            })
            .collect();
        let second = resolver
            .resolve(&mut agents, &late_votes, &ledger, 5)
            .await
            .unwrap();
        assert!(second.is_empty());
        assert_eq!(resolver.accepted_count(), 0);
    }

    #[tokio::test]
    async fn accepted_signatures_are_never_dispatched_twice() {
        let (ledger, _dir, id) = ledger_with_one_signature().await;
        let mut resolver = ConsensusResolver::new(0.5, 1);
        let mut agents = HashMap::new();
        agents.insert(
            NodeId(1),
            DetectionAgent::new(config(1), ledger.clone(), Arc::new(NullEventSink)),
        );

        let reports = step_with_votes(id, 1, &[2]);
        let first = resolver
            .resolve(&mut agents, &reports, &ledger, 2)
            .await
            .unwrap();
        assert_eq!(first, vec![id]);

        let second = resolver
            .resolve(&mut agents, &reports, &ledger, 2)
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn single_agent_never_reaches_consensus() {
        let (ledger, _dir, _id) = ledger_with_one_signature().await;
        let mut resolver = ConsensusResolver::new(0.5, 1);
        let mut agents = HashMap::new();
        agents.insert(
            NodeId(1),
            DetectionAgent::new(config(1), ledger.clone(), Arc::new(NullEventSink)),
        );

        let accepted = resolver.resolve(&mut agents, &[], &ledger, 1).await.unwrap();
        assert!(accepted.is_empty());
    }
}
