//! Single-worker agent: the whole model in this process

use super::build::{build_shard, Shard};
use super::{AgentState, ModelAgent};
use crate::backend::{BackendFactory, ComputeBackend, ShardContext};
use crate::cache::cache_swapping;
use crate::config::{CacheConfig, ModelConfig};
use crate::errors::{AgentError, Result};
use crate::inputs::{StepInput, StepOutput};
use crate::memory::MemoryPlanner;
use crate::stats::StepStats;
use crate::tensor::Tensor;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Runs build, plan and forward in one process.
pub struct BaseModelAgent<F: BackendFactory> {
    model_config: ModelConfig,
    cache_config: CacheConfig,
    backend: Option<F::Backend>,
    cache_engine: Option<F::Cache>,
    state: AgentState,
    stats: Arc<StepStats>,
}

impl<F: BackendFactory> BaseModelAgent<F> {
    /// Build the model, plan the cache and construct the cache engine.
    pub fn new(
        factory: &F,
        ctx: ShardContext,
        cache_config: &CacheConfig,
        planner: &MemoryPlanner,
    ) -> Result<Self> {
        let mut state = AgentState::Uninitialized;
        let Shard {
            backend,
            cache_engine,
            cache_config,
        } = build_shard(factory, &ctx, cache_config, planner, None, &mut state).map_err(|e| {
            warn!(state = ?state, error = %e, "Model agent construction failed");
            e
        })?;

        info!(
            num_gpu_blocks = cache_config.num_gpu_blocks,
            num_cpu_blocks = cache_config.num_cpu_blocks,
            "Model agent ready"
        );

        Ok(Self {
            model_config: ctx.model,
            cache_config,
            backend: Some(backend),
            cache_engine: Some(cache_engine),
            state,
            stats: Arc::new(StepStats::new()),
        })
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// The cache engine, or `None` once the agent is closed.
    pub fn cache_engine(&self) -> Option<&F::Cache> {
        self.cache_engine.as_ref()
    }

    pub fn cache_engine_mut(&mut self) -> Option<&mut F::Cache> {
        self.cache_engine.as_mut()
    }

    pub fn stats(&self) -> Arc<StepStats> {
        Arc::clone(&self.stats)
    }
}

impl<F: BackendFactory> ModelAgent for BaseModelAgent<F> {
    fn forward(&mut self, step: StepInput) -> Result<StepOutput> {
        let (backend, cache) = match (self.state, &mut self.backend, &mut self.cache_engine) {
            (AgentState::Ready, Some(backend), Some(cache)) => (backend, cache),
            (state, _, _) => {
                return Err(AgentError::InvalidState(format!(
                    "forward called on a {:?} agent",
                    state
                )))
            }
        };

        let start = Instant::now();
        let result = cache_swapping(cache, &step.swap_in, &step.swap_out)
            .and_then(|_| backend.forward(&step.inputs, cache, 1));
        match &result {
            Ok(_) => {
                self.stats.record_swaps(step.swap_in.len(), step.swap_out.len());
                self.stats
                    .record_step(step.inputs.seq_length.iter().sum(), start.elapsed());
            }
            Err(_) => self.stats.record_failure(),
        }
        result
    }

    fn get_logits(&self, hidden_states: &Tensor) -> Result<Tensor> {
        self.backend
            .as_ref()
            .ok_or_else(|| AgentError::InvalidState("get_logits called on a closed agent".into()))?
            .get_logits(hidden_states)
    }

    fn model_config(&self) -> &ModelConfig {
        &self.model_config
    }

    fn cache_config(&self) -> &CacheConfig {
        &self.cache_config
    }

    fn close(&mut self) {
        if self.state == AgentState::Closed {
            return;
        }
        self.backend = None;
        self.cache_engine = None;
        self.state = AgentState::Closed;
        self.stats.print_summary();
        info!("Model agent closed");
    }
}
