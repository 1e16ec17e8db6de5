//! KV cache engine contract, block sizing and swap orchestration

pub mod host;

pub use host::HostCacheEngine;

use crate::config::{ModelConfig, QuantPolicy};
use crate::errors::Result;
use crate::inputs::SwapMap;

/// Owner of the device-resident and host-resident cache block arrays.
///
/// Swaps are issued asynchronously; [`CacheEngine::wait`] blocks until every
/// issued copy has landed.
pub trait CacheEngine: Send {
    /// Copy host blocks to device blocks (`src` host index -> `dst` device index).
    fn swap_in(&mut self, map: &SwapMap) -> Result<()>;

    /// Copy device blocks to host blocks (`src` device index -> `dst` host index).
    fn swap_out(&mut self, map: &SwapMap) -> Result<()>;

    /// Block until all issued copies have completed.
    fn wait(&self) -> Result<()>;

    /// Bytes occupied by one cache block on one rank.
    fn block_size_bytes(
        block_size: usize,
        model: &ModelConfig,
        world_size: usize,
        quant: QuantPolicy,
    ) -> usize
    where
        Self: Sized,
    {
        cache_block_size(block_size, model, world_size, quant)
    }
}

/// Bytes per token-head for one of the key or value caches.
fn token_head_bytes(head_dim: usize, elem: usize, quant: QuantPolicy) -> usize {
    match quant.bits() {
        None => head_dim * elem,
        // packed values plus a scale/zero pair in the model dtype
        Some(bits) => (head_dim * bits).div_ceil(8) + 2 * elem,
    }
}

/// Default block sizing: key block plus value block, summed over layers.
pub fn cache_block_size(
    block_size: usize,
    model: &ModelConfig,
    world_size: usize,
    quant: QuantPolicy,
) -> usize {
    let elem = model.dtype.size();
    let kv_heads = (model.num_key_value_heads / world_size.max(1)).max(1);
    let key = block_size * kv_heads * token_head_bytes(model.k_head_dim, elem, quant);
    let value = block_size * kv_heads * token_head_bytes(model.v_head_dim, elem, quant);
    model.num_layers * (key + value)
}

/// Apply one step's swaps, then wait once for both directions.
///
/// Returns whether a synchronization was needed; empty maps are a no-op.
pub fn cache_swapping<C: CacheEngine + ?Sized>(
    engine: &mut C,
    swap_in: &SwapMap,
    swap_out: &SwapMap,
) -> Result<bool> {
    let mut issued = false;
    if !swap_in.is_empty() {
        engine.swap_in(swap_in)?;
        issued = true;
    }
    if !swap_out.is_empty() {
        engine.swap_out(swap_out)?;
        issued = true;
    }
    if issued {
        engine.wait()?;
    }
    Ok(issued)
}
