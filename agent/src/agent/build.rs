//! Shard construction and fleet-wide cache budget reconciliation

use super::AgentState;
use crate::backend::{BackendFactory, ShardContext};
use crate::config::CacheConfig;
use crate::errors::{AgentError, Result};
use crate::group::ProcessGroup;
use crate::memory::MemoryPlanner;
use tracing::{debug, info, warn};

/// The collaborators one rank runs steps with.
pub struct Shard<F: BackendFactory> {
    pub backend: F::Backend,
    pub cache_engine: F::Cache,
    pub cache_config: CacheConfig,
}

/// Elementwise minimum of the gathered block counts.
///
/// Every other field is taken from the first config (rank 0's). Block size
/// and quantization policy are assumed identical across ranks and are only
/// reported when they differ, not corrected.
pub fn min_cache_config(configs: &[CacheConfig]) -> Result<CacheConfig> {
    let first = configs
        .first()
        .ok_or_else(|| AgentError::Group("no cache configs gathered".into()))?;

    for (rank, config) in configs.iter().enumerate().skip(1) {
        if config.block_size != first.block_size || config.quant_policy != first.quant_policy {
            warn!(
                rank,
                block_size = config.block_size,
                quant_policy = ?config.quant_policy,
                rank0_block_size = first.block_size,
                rank0_quant_policy = ?first.quant_policy,
                "Cache geometry differs from rank 0; only block counts are reconciled"
            );
        }
    }

    let mut unified = first.clone();
    unified.num_gpu_blocks = configs.iter().map(|c| c.num_gpu_blocks).min().unwrap_or(0);
    unified.num_cpu_blocks = configs.iter().map(|c| c.num_cpu_blocks).min().unwrap_or(0);
    Ok(unified)
}

/// Gather every rank's planned config on rank 0, take the minimum block
/// counts and broadcast the result so every rank holds the same value.
pub fn reconcile_cache_config(group: &mut ProcessGroup, local: CacheConfig) -> Result<CacheConfig> {
    if group.world_size() == 1 {
        return Ok(local);
    }
    let unified = match group.gather_object(local)? {
        Some(gathered) => {
            let unified = min_cache_config(&gathered)?;
            info!(
                num_gpu_blocks = unified.num_gpu_blocks,
                num_cpu_blocks = unified.num_cpu_blocks,
                "Reconciled cache budget across ranks"
            );
            group.broadcast_object(Some(unified))?
        }
        None => group.broadcast_object(None)?,
    };
    debug!(rank = group.rank(), num_gpu_blocks = unified.num_gpu_blocks, "Cache budget received");
    Ok(unified)
}

/// Build one rank's shard: model, local budget, graph runner, reconciled
/// budget, cache engine. `group` is `None` for a single-worker agent.
pub fn build_shard<F: BackendFactory>(
    factory: &F,
    ctx: &ShardContext,
    cache: &CacheConfig,
    planner: &MemoryPlanner,
    group: Option<&mut ProcessGroup>,
    state: &mut AgentState,
) -> Result<Shard<F>> {
    debug!(rank = ctx.rank, state = ?state, "Building shard");
    let backend = factory.build_model(ctx)?;
    *state = AgentState::Built;
    debug!(rank = ctx.rank, state = ?state, "Model built");

    let local = planner.plan::<F::Cache>(&ctx.model, cache, ctx.device_id, ctx.rank, ctx.world_size)?;
    let backend = factory.build_graph_runner(backend, ctx, &local)?;

    let cache_config = match group {
        Some(group) => reconcile_cache_config(group, local)?,
        None => local,
    };
    ensure_usable(&cache_config)?;
    let cache_engine = factory.build_cache_engine(ctx, &cache_config)?;
    *state = AgentState::Ready;

    Ok(Shard {
        backend,
        cache_engine,
        cache_config,
    })
}

/// Assert the invariant every reconciled config must satisfy.
pub(crate) fn ensure_usable(config: &CacheConfig) -> Result<()> {
    if config.num_gpu_blocks == 0 || config.num_cpu_blocks == 0 {
        return Err(AgentError::InsufficientMemory(format!(
            "reconciled cache has {} gpu and {} cpu blocks",
            config.num_gpu_blocks, config.num_cpu_blocks
        )));
    }
    Ok(())
}
