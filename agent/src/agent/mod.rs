//! Model agents
//!
//! A [`ModelAgent`] owns one model shard and its KV cache and turns a
//! [`StepInput`] into a [`StepOutput`]. [`BaseModelAgent`] runs everything in
//! this process; [`TpModelAgent`] coordinates a tensor-parallel fleet of
//! subordinate processes that each hold one shard.

pub mod base;
pub mod build;
pub mod tp;
pub mod worker;

pub use base::BaseModelAgent;
pub use build::{build_shard, min_cache_config, reconcile_cache_config, Shard};
pub use tp::TpModelAgent;
pub use worker::{
    read_bootstrap, run_worker, run_worker_process, CommandLauncher, WorkerBootstrap,
    WorkerLauncher,
};

use crate::backend::{BackendFactory, ShardContext};
use crate::config::{AgentConfig, CacheConfig, ModelConfig};
use crate::errors::Result;
use crate::inputs::{StepInput, StepOutput};
use crate::memory::MemoryPlanner;
use crate::tensor::Tensor;
use async_trait::async_trait;

/// Lifecycle of an agent.
///
/// [`build_shard`] advances `Uninitialized -> Built -> Ready`; a failed
/// construction reports the state it stopped in. A tensor-parallel agent
/// moves to `Closed` on `close` or when a step fails past the barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Uninitialized,
    /// Model built, cache not yet planned
    Built,
    Ready,
    Closed,
}

/// One model shard plus its cache, driven one step at a time.
#[async_trait]
pub trait ModelAgent: Send {
    /// Apply the step's swaps, then run the model.
    fn forward(&mut self, step: StepInput) -> Result<StepOutput>;

    /// [`ModelAgent::forward`], yielding to the runtime once the step completes.
    async fn forward_async(&mut self, step: StepInput) -> Result<StepOutput> {
        let output = self.forward(step);
        tokio::task::yield_now().await;
        output
    }

    /// Project hidden states to vocabulary logits.
    fn get_logits(&self, hidden_states: &Tensor) -> Result<Tensor>;

    fn model_config(&self) -> &ModelConfig;

    /// The cache configuration every rank agreed on.
    fn cache_config(&self) -> &CacheConfig;

    /// Release the model, the cache and any subordinate processes. Idempotent.
    fn close(&mut self);
}

/// Build the agent `config` asks for: single-process when `tp == 1`, a
/// tensor-parallel fleet otherwise.
pub fn build_model_agent<F: BackendFactory>(
    factory: &F,
    config: &AgentConfig,
) -> Result<Box<dyn ModelAgent>> {
    if config.tp == 1 {
        let planner = MemoryPlanner::new(config.memory_source()?.probe(), config.host_mem_bytes()?);
        let ctx = ShardContext {
            model_path: config.model_path.clone(),
            model: config.model.clone(),
            adapters: config.adapters.clone(),
            rank: 0,
            world_size: 1,
            device_id: 0,
        };
        Ok(Box::new(BaseModelAgent::new(factory, ctx, &config.cache, &planner)?))
    } else {
        Ok(Box::new(TpModelAgent::new(factory, config)?))
    }
}
