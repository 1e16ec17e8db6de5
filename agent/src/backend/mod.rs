//! Compute backend contract
//!
//! The agent never looks inside the model. A [`BackendFactory`] builds one
//! shard's model, optional graph runner and cache engine; the resulting
//! [`ComputeBackend`] runs one forward step at a time against that cache.

pub mod reference;

pub use reference::{ReferenceBackend, ReferenceFactory};

use crate::cache::CacheEngine;
use crate::config::{CacheConfig, ModelConfig};
use crate::errors::Result;
use crate::inputs::{ModelInputs, StepOutput};
use crate::tensor::Tensor;
use std::collections::BTreeMap;

/// Everything a rank knows about the shard it is building.
#[derive(Debug, Clone)]
pub struct ShardContext {
    pub model_path: String,
    pub model: ModelConfig,
    pub adapters: BTreeMap<String, String>,
    pub rank: usize,
    pub world_size: usize,
    pub device_id: usize,
}

/// One built model shard.
pub trait ComputeBackend: Send {
    type Cache: CacheEngine;

    /// Run one step. Only `cache` may carry state between calls.
    fn forward(
        &mut self,
        inputs: &ModelInputs,
        cache: &mut Self::Cache,
        world_size: usize,
    ) -> Result<StepOutput>;

    /// Project hidden states to vocabulary logits.
    fn get_logits(&self, hidden_states: &Tensor) -> Result<Tensor>;
}

/// Builds the collaborators of one rank.
pub trait BackendFactory: Send + Sync + 'static {
    type Cache: CacheEngine + 'static;
    type Backend: ComputeBackend<Cache = Self::Cache> + 'static;

    /// Build the patched model shard and load its weights and adapters.
    fn build_model(&self, ctx: &ShardContext) -> Result<Self::Backend>;

    /// Wrap the model in an execution graph once the cache geometry is known.
    fn build_graph_runner(
        &self,
        backend: Self::Backend,
        _ctx: &ShardContext,
        _cache: &CacheConfig,
    ) -> Result<Self::Backend> {
        Ok(backend)
    }

    fn build_cache_engine(&self, ctx: &ShardContext, cache: &CacheConfig) -> Result<Self::Cache>;
}
