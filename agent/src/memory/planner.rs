//! KV cache memory budget planning
//!
//! Turns one free-memory reading into concrete block counts. The planner
//! leaves room for transient runtime buffers first, shrinking the per-step
//! prefill ceiling until at least [`MIN_CACHE_BLOCKS`] blocks fit, then hands
//! the remainder (scaled by `cache_max_entry_count`) to the device cache.

use super::{format_bytes, DeviceMemory};
use crate::cache::CacheEngine;
use crate::config::{CacheConfig, ModelConfig};
use crate::errors::{AgentError, Result};
use tracing::{debug, info, warn};

/// Key head dims at or above this force the smaller block size.
pub const LARGE_HEAD_DIM: usize = 512;
/// Block size used for large-head models.
pub const LARGE_HEAD_BLOCK_SIZE: usize = 32;
/// lm_head output (2) + upcast to float (4) + misc (1)
pub const RUNTIME_MULTIPLIER: u64 = 7;
/// Smallest device cache the runtime reservation may leave.
pub const MIN_CACHE_BLOCKS: u64 = 16;

/// Computes a rank-local [`CacheConfig`] from free memory and model geometry.
pub struct MemoryPlanner {
    probe: Box<dyn DeviceMemory>,
    host_mem_size: u64,
}

impl MemoryPlanner {
    pub fn new(probe: Box<dyn DeviceMemory>, host_mem_size: u64) -> Self {
        Self {
            probe,
            host_mem_size,
        }
    }

    /// Plan the cache for `device_id`.
    ///
    /// Non-zero block counts already present in `cache` are kept as given.
    pub fn plan<C: CacheEngine>(
        &self,
        model: &ModelConfig,
        cache: &CacheConfig,
        device_id: usize,
        rank: usize,
        world_size: usize,
    ) -> Result<CacheConfig> {
        let mut planned = cache.clone();

        if model.k_head_dim >= LARGE_HEAD_DIM && planned.block_size > LARGE_HEAD_BLOCK_SIZE {
            planned.block_size = LARGE_HEAD_BLOCK_SIZE;
            if rank == 0 {
                warn!(
                    block_size = planned.block_size,
                    head_dim = model.k_head_dim,
                    "Update block_size for large head_dim"
                );
            }
        }

        let block_bytes =
            C::block_size_bytes(planned.block_size, model, world_size, planned.quant_policy) as u64;
        if block_bytes == 0 {
            return Err(AgentError::Config("Cache block size computed as zero bytes".into()));
        }

        let free = self.probe.free_memory(device_id)?;
        debug!(device = device_id, free = %format_bytes(free), "Free device memory");

        let (runtime_bytes, prefill) = runtime_reservation(
            free,
            block_bytes,
            model.vocab_size as u64,
            planned.max_prefill_token_num as u64,
            planned.cache_max_entry_count,
        );
        if prefill != planned.max_prefill_token_num as u64 {
            if prefill == 0 {
                return Err(AgentError::InsufficientMemory(
                    "No enough gpu memory for runtime.".into(),
                ));
            }
            planned.max_prefill_token_num = prefill as usize;
            warn!(
                device = device_id,
                max_prefill_token_num = prefill,
                "No enough memory. update max_prefill_token_num"
            );
        }
        debug!(runtime = %format_bytes(runtime_bytes), "Estimated max runtime memory");

        let device_budget =
            free.saturating_sub(runtime_bytes) as f64 * planned.cache_max_entry_count;

        if planned.num_cpu_blocks == 0 {
            planned.num_cpu_blocks = (self.host_mem_size / block_bytes) as usize;
            if planned.num_cpu_blocks == 0 {
                return Err(AgentError::InsufficientMemory(
                    "No enough host memory for kv cache.".into(),
                ));
            }
        }
        if planned.num_gpu_blocks == 0 {
            planned.num_gpu_blocks = (device_budget / block_bytes as f64) as usize;
            if planned.num_gpu_blocks == 0 {
                return Err(AgentError::InsufficientMemory(
                    "No enough gpu memory for kv cache.".into(),
                ));
            }
        }

        planned.window_size = model.sliding_window;

        info!(
            rank,
            device = device_id,
            block_size = planned.block_size,
            block_bytes = %format_bytes(block_bytes),
            num_gpu_blocks = planned.num_gpu_blocks,
            num_cpu_blocks = planned.num_cpu_blocks,
            max_prefill_token_num = planned.max_prefill_token_num,
            "Planned KV cache"
        );

        Ok(planned)
    }
}

/// Halve the prefill ceiling until the runtime reservation leaves room for
/// [`MIN_CACHE_BLOCKS`] blocks. Returns `(runtime_bytes, prefill)`; a prefill of
/// zero means no ceiling fits.
fn runtime_reservation(
    free: u64,
    block_bytes: u64,
    vocab_size: u64,
    mut prefill: u64,
    entry_fraction: f64,
) -> (u64, u64) {
    let mut runtime = 0u64;
    while prefill > 0 {
        runtime = prefill
            .saturating_mul(vocab_size)
            .saturating_mul(RUNTIME_MULTIPLIER);
        let available = (free as f64 - runtime as f64) * entry_fraction;
        if available > 0.0 && (available as u64) / block_bytes >= MIN_CACHE_BLOCKS {
            break;
        }
        prefill /= 2;
    }
    (runtime, prefill)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{cache_block_size, HostCacheEngine};
    use crate::config::QuantPolicy;
    use crate::memory::FixedMemory;
    use crate::tensor::DType;

    const GIB: u64 = 1 << 30;

    fn model() -> ModelConfig {
        ModelConfig {
            hidden_size: 4096,
            num_layers: 32,
            num_attention_heads: 32,
            num_key_value_heads: 8,
            k_head_dim: 128,
            v_head_dim: 128,
            vocab_size: 32000,
            sliding_window: Some(4096),
            dtype: DType::BF16,
            tp: 1,
        }
    }

    fn planner(free: u64, host: u64) -> MemoryPlanner {
        MemoryPlanner::new(Box::new(FixedMemory(vec![free])), host)
    }

    #[test]
    fn test_plan_fills_block_counts() {
        let model = model();
        let cache = CacheConfig::default();
        let planned = planner(24 * GIB, GIB)
            .plan::<HostCacheEngine>(&model, &cache, 0, 0, 1)
            .unwrap();

        let block = cache_block_size(64, &model, 1, QuantPolicy::None) as u64;
        let runtime = 4096 * 32000 * 7;
        let expected_gpu = (((24 * GIB - runtime) as f64 * 0.8) / block as f64) as usize;
        assert_eq!(planned.num_gpu_blocks, expected_gpu);
        assert_eq!(planned.num_cpu_blocks, (GIB / block) as usize);
        assert_eq!(planned.max_prefill_token_num, 4096);
        assert_eq!(planned.window_size, Some(4096));
        // input untouched
        assert_eq!(cache.num_gpu_blocks, 0);
    }

    #[test]
    fn test_plan_keeps_preset_counts() {
        let cache = CacheConfig {
            num_gpu_blocks: 10,
            num_cpu_blocks: 3,
            ..CacheConfig::default()
        };
        let planned = planner(24 * GIB, GIB)
            .plan::<HostCacheEngine>(&model(), &cache, 0, 0, 1)
            .unwrap();
        assert_eq!(planned.num_gpu_blocks, 10);
        assert_eq!(planned.num_cpu_blocks, 3);
    }

    #[test]
    fn test_large_head_dim_caps_block_size() {
        let mut model = model();
        model.k_head_dim = 576;
        let planned = planner(24 * GIB, GIB)
            .plan::<HostCacheEngine>(&model, &CacheConfig::default(), 0, 1, 1)
            .unwrap();
        assert_eq!(planned.block_size, LARGE_HEAD_BLOCK_SIZE);

        let small = CacheConfig {
            block_size: 16,
            ..CacheConfig::default()
        };
        let planned = planner(24 * GIB, GIB)
            .plan::<HostCacheEngine>(&model, &small, 0, 0, 1)
            .unwrap();
        assert_eq!(planned.block_size, 16);
    }

    #[test]
    fn test_prefill_ceiling_shrinks_under_pressure() {
        let model = model();
        let block = cache_block_size(64, &model, 1, QuantPolicy::None) as u64;
        // room for 16 blocks only after the ceiling drops to 1024
        let runtime_1024 = 1024 * 32000 * 7;
        let free = runtime_1024 + (16 * block) * 10 / 8 + block;
        let planned = planner(free, GIB)
            .plan::<HostCacheEngine>(&model, &CacheConfig::default(), 0, 0, 1)
            .unwrap();
        assert_eq!(planned.max_prefill_token_num, 1024);
        assert!(planned.num_gpu_blocks >= 16);
    }

    #[test]
    fn test_no_memory_for_runtime() {
        let err = planner(1 << 20, GIB)
            .plan::<HostCacheEngine>(&model(), &CacheConfig::default(), 0, 0, 1)
            .unwrap_err();
        assert!(matches!(err, AgentError::InsufficientMemory(_)));
        assert!(err.to_string().contains("No enough gpu memory for runtime."));
    }

    #[test]
    fn test_no_host_memory_for_cache() {
        let err = planner(24 * GIB, 1024)
            .plan::<HostCacheEngine>(&model(), &CacheConfig::default(), 0, 0, 1)
            .unwrap_err();
        assert!(err.to_string().contains("No enough host memory for kv cache."));
    }

    #[test]
    fn test_no_gpu_memory_for_cache() {
        // no prefill ceiling to shrink, and the device is nearly empty
        let cache = CacheConfig {
            max_prefill_token_num: 0,
            ..CacheConfig::default()
        };
        let err = planner(1024, GIB)
            .plan::<HostCacheEngine>(&model(), &cache, 0, 0, 1)
            .unwrap_err();
        assert!(err.to_string().contains("No enough gpu memory for kv cache."));
    }

    #[test]
    fn test_never_returns_zero_blocks() {
        for free_mib in [1u64, 64, 512, 2048, 8192, 40960] {
            match planner(free_mib << 20, GIB).plan::<HostCacheEngine>(
                &model(),
                &CacheConfig::default(),
                0,
                0,
                1,
            ) {
                Ok(planned) => {
                    assert!(planned.num_gpu_blocks > 0);
                    assert!(planned.num_cpu_blocks > 0);
                }
                Err(e) => assert!(matches!(e, AgentError::InsufficientMemory(_))),
            }
        }
    }

    #[test]
    fn test_unknown_device_is_config_error() {
        let err = planner(GIB, GIB)
            .plan::<HostCacheEngine>(&model(), &CacheConfig::default(), 3, 0, 1)
            .unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }
}
