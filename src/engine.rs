//! §4.6 / C8 Engine: composes the Ledger, Scheduler, ConsensusResolver
//! and the agent population into a runnable simulation.

use crate::agents::{AgentConfig, DetectionAgent};
use crate::cancellation::CancellationToken;
use crate::config::EngineOptions;
use crate::consensus::ConsensusResolver;
use crate::error::{EngineError, EngineResult};
use crate::events::SharedEventSink;
use crate::ledger::Ledger;
use crate::scheduler::Scheduler;
use crate::types::NodeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, instrument};

/// Point-in-time counters surfaced to the (external) dashboard / CLI.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct EngineStats {
    pub steps_run: u64,
    pub ledger_size: u64,
    pub signatures_accepted: u64,
    pub agents_online: usize,
}

/// Owns every long-lived component for one simulation run.
pub struct Engine {
    ledger: Arc<Ledger>,
    scheduler: Scheduler,
    resolver: ConsensusResolver,
    agents: HashMap<NodeId, DetectionAgent>,
    event_sink: SharedEventSink,
    num_agents: usize,
    steps_run: AtomicU64,
    cancel: CancellationToken,
}

impl Engine {
    /// `New(options, event_sink) -> Engine`. Opens the ledger, seeds one
    /// `DetectionAgent` per configured node, and wires the scheduler and
    /// resolver from the same options snapshot.
    #[instrument(skip(options, event_sink))]
    pub fn new(options: &EngineOptions, event_sink: SharedEventSink) -> EngineResult<Self> {
        options.validate()?;

        let ledger = Arc::new(Ledger::open(
            &options.ledger.path,
            options.ledger.pool_size,
            options.acquire_timeout(),
            options.ledger.retry_attempts,
            options.ledger.pool_size * 16,
        )?);

        let mut agents = HashMap::with_capacity(options.num_agents);
        for n in 0..options.num_agents as u64 {
            let node_id = NodeId(n);
            let config = AgentConfig {
                node_id,
                batch_size: options.batch_size,
                anomaly_rate: options.anomaly_rate,
                rolling_window: options.rolling_window,
                score_threshold: options.score_threshold,
                validation_threshold: options.validation_threshold,
                min_confidence: options.min_confidence,
                n_trees: 100,
                subsample_size: 256.min(options.rolling_window.max(16)),
                seed: options.seed,
            };
            agents.insert(
                node_id,
                DetectionAgent::new(config, ledger.clone(), event_sink.clone()),
            );
        }

        let scheduler = Scheduler::new(
            options.parallel_enabled,
            options.parallel_threshold,
            options.max_workers,
            options.step_deadline(),
        );
        let resolver = ConsensusResolver::new(options.majority_ratio, options.resolved_min_votes());

        Ok(Self {
            ledger,
            scheduler,
            resolver,
            agents,
            event_sink,
            num_agents: options.num_agents,
            steps_run: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        })
    }

    /// A token external callers can use to request a graceful stop; takes
    /// effect at the next step boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Runs the agent phase across the whole population, then the
    /// consensus phase over the resulting votes, exactly once.
    #[instrument(skip(self))]
    pub async fn step(&mut self) -> EngineResult<Vec<u64>> {
        let reports = self.scheduler.run_step(&mut self.agents, &self.cancel).await?;

        let accepted = self
            .resolver
            .resolve(&mut self.agents, &reports, &self.ledger, self.num_agents)
            .await?;

        self.steps_run.fetch_add(1, Ordering::Relaxed);
        if !accepted.is_empty() {
            self.event_sink.counter(
                "sentrymesh_signatures_accepted_total",
                accepted.len() as i64,
                &[],
            );
        }
        self.event_sink
            .gauge("sentrymesh_ledger_size", self.ledger.size() as f64, &[]);

        Ok(accepted)
    }

    /// Runs `steps` sequential steps, stopping early on cancellation or a
    /// fatal error from any step.
    #[instrument(skip(self))]
    pub async fn run(&mut self, steps: u64) -> EngineResult<()> {
        for _ in 0..steps {
            if self.cancel.is_cancelled() {
                return Err(EngineError::Canceled);
            }
            match self.step().await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    self.event_sink
                        .warn("engine.step_failed", &[("kind", e.kind())]);
                }
            }
        }
        info!(steps_run = self.steps_run.load(Ordering::Relaxed), "run complete");
        Ok(())
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            steps_run: self.steps_run.load(Ordering::Relaxed),
            ledger_size: self.ledger.size(),
            signatures_accepted: self.resolver.accepted_count() as u64,
            agents_online: self.agents.len(),
        }
    }

    /// Releases every agent and the ledger's backing store.
    pub async fn close(&mut self) -> EngineResult<()> {
        for agent in self.agents.values_mut() {
            agent.close();
        }
        self.ledger.close().await
    }
}
