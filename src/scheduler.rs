//! §4.3 Scheduler: drives one simulation step across all agents, either
//! sequentially or over a bounded worker pool, respecting a per-step
//! deadline and a cooperative cancellation token.

use crate::agents::DetectionAgent;
use crate::cancellation::CancellationToken;
use crate::error::{EngineError, EngineResult};
use crate::types::{NodeId, StepReport};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{Id, JoinSet};
use tracing::{instrument, warn};

/// One agent's contribution to a step, or `None` if it missed the
/// deadline and was skipped from consensus this round.
pub type AgentStep = (NodeId, Option<StepReport>);

type AgentTask = (NodeId, DetectionAgent, StepReport);

/// Executes the agent phase of a step. Agents are handed in by value for
/// the duration of the call and handed back once their task completes —
/// possibly on a later call, if they missed the deadline this round.
pub struct Scheduler {
    parallel_enabled: bool,
    parallel_threshold: usize,
    max_workers: usize,
    step_deadline: Duration,
    /// A single persistent `JoinSet`: agents that miss a step's deadline
    /// keep running here in the background and are reclaimed (without a
    /// report) the next time their result is observed.
    tasks: Mutex<JoinSet<AgentTask>>,
}

impl Scheduler {
    pub fn new(
        parallel_enabled: bool,
        parallel_threshold: usize,
        max_workers: usize,
        step_deadline: Duration,
    ) -> Self {
        Self {
            parallel_enabled,
            parallel_threshold,
            max_workers: max_workers.max(1),
            step_deadline,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Runs one step's agent phase. A single wall-clock deadline bounds
    /// the entire phase (not each agent individually); agents still
    /// running when it elapses are skipped from this step's consensus
    /// and reclaimed automatically on a later call once they finish.
    #[instrument(skip(self, agents, cancel))]
    pub async fn run_step(
        &self,
        agents: &mut HashMap<NodeId, DetectionAgent>,
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<AgentStep>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Canceled);
        }

        let mut tasks = self.tasks.lock().await;

        // Drain any agents that straggled past an earlier deadline and have
        // since finished; they rejoin the pool silently, with no report for
        // the step they missed.
        while let Some(res) = tasks.try_join_next() {
            match res {
                Ok((node_id, agent, _stale_report)) => {
                    agents.insert(node_id, agent);
                }
                Err(join_err) => {
                    warn!(error = %join_err, "recovered agent task panicked, dropping");
                }
            }
        }

        let participant_count = agents.len();
        let worker_limit = if self.parallel_enabled && participant_count >= self.parallel_threshold
        {
            self.max_workers.min(participant_count.max(1))
        } else {
            1
        };

        let semaphore = Arc::new(Semaphore::new(worker_limit));
        let mut node_ids: Vec<NodeId> = agents.keys().copied().collect();
        node_ids.sort();

        // Spawn every agent's step up front, gated only by the shared
        // semaphore, so `worker_limit` agents genuinely run at once
        // instead of one at a time.
        let mut id_to_node: HashMap<Id, NodeId> = HashMap::with_capacity(node_ids.len());
        for node_id in node_ids {
            let Some(mut agent) = agents.remove(&node_id) else {
                continue;
            };
            let sem = semaphore.clone();
            let handle = tasks.spawn(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore never closed");
                let report = agent.step().await;
                (node_id, agent, report)
            });
            id_to_node.insert(handle.id(), node_id);
        }

        let mut pending: HashSet<Id> = id_to_node.keys().copied().collect();
        let mut reports = Vec::with_capacity(pending.len());

        let deadline = tokio::time::sleep(self.step_deadline);
        tokio::pin!(deadline);

        while !pending.is_empty() {
            tokio::select! {
                joined = tasks.join_next_with_id() => {
                    match joined {
                        Some(Ok((id, (node_id, agent, report)))) => {
                            agents.insert(node_id, agent);
                            if pending.remove(&id) {
                                reports.push((node_id, Some(report)));
                            }
                        }
                        Some(Err(join_err)) => {
                            let id = join_err.id();
                            if pending.remove(&id) {
                                let node_id = id_to_node.get(&id).copied();
                                warn!(?node_id, error = %join_err, "agent step task panicked");
                                if let Some(node_id) = node_id {
                                    reports.push((node_id, None));
                                }
                            } else {
                                warn!(error = %join_err, "recovered agent task panicked, dropping");
                            }
                        }
                        None => break,
                    }
                }
                _ = &mut deadline => {
                    for id in pending.drain() {
                        if let Some(node_id) = id_to_node.get(&id).copied() {
                            warn!(%node_id, "agent missed step deadline, contribution discarded");
                            reports.push((node_id, None));
                        }
                    }
                    break;
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(EngineError::Canceled);
        }

        Ok(reports)
    }
}
