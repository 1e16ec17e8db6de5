//! Deterministic reference backend
//!
//! Writes every input token into its cache slot, then emits hidden states that
//! fold in every cached token of the sequence up to the current position. Two
//! ranks with the same inputs and cache contents produce identical outputs, and
//! a step that reads a block before its swap landed produces a different one.

use super::{BackendFactory, ComputeBackend, ShardContext};
use crate::cache::HostCacheEngine;
use crate::config::{CacheConfig, ModelConfig};
use crate::errors::{AgentError, Result};
use crate::inputs::{ModelInputs, StepOutput};
use crate::tensor::{DType, Tensor};
use std::collections::BTreeMap;
use tracing::{debug, info};

pub struct ReferenceBackend {
    model: ModelConfig,
    rank: usize,
}

impl ReferenceBackend {
    pub fn new(model: ModelConfig, rank: usize) -> Self {
        Self { model, rank }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }
}

/// Position-weighted sum of a sequence's cached tokens, kept small enough for f32.
fn fold_tokens(tokens: impl Iterator<Item = i64>) -> i64 {
    tokens
        .enumerate()
        .fold(0i64, |acc, (pos, token)| {
            (acc + token.wrapping_mul(pos as i64 + 1)).rem_euclid(1 << 20)
        })
}

impl ComputeBackend for ReferenceBackend {
    type Cache = HostCacheEngine;

    fn forward(
        &mut self,
        inputs: &ModelInputs,
        cache: &mut HostCacheEngine,
        world_size: usize,
    ) -> Result<StepOutput> {
        let ids = inputs.input_ids()?.to_i64_vec()?;
        let block_size = cache.block_size();
        let hidden = self.model.hidden_size;

        let mut states = Vec::with_capacity(ids.len() * hidden);
        let mut metas = Vec::with_capacity(inputs.seq_length.len());
        let mut cursor = 0usize;

        for (seq, &len) in inputs.seq_length.iter().enumerate() {
            let (history, blocks) = match (
                inputs.history_lengths.get(seq),
                inputs.block_offsets.get(seq),
            ) {
                (Some(h), Some(b)) => (*h, b),
                _ => {
                    return Err(AgentError::Backend(format!(
                        "Sequence {} has no history length or block table",
                        seq
                    )))
                }
            };
            let slot = |pos: usize| -> Result<(u32, usize)> {
                blocks
                    .get(pos / block_size)
                    .map(|b| (*b, pos % block_size))
                    .ok_or_else(|| {
                        AgentError::Backend(format!(
                            "Sequence {} position {} has no block ({} blocks mapped)",
                            seq,
                            pos,
                            blocks.len()
                        ))
                    })
            };

            let tokens = ids.get(cursor..cursor + len).ok_or_else(|| {
                AgentError::Backend(format!(
                    "seq_length overruns input_ids ({} tokens)",
                    ids.len()
                ))
            })?;
            for (j, &token) in tokens.iter().enumerate() {
                let (block, offset) = slot(history + j)?;
                cache.write_slot(block, offset, token)?;
            }

            for j in 0..len {
                let end = history + j + 1;
                let cached = (0..end)
                    .map(|pos| slot(pos).and_then(|(b, o)| cache.read_slot(b, o)))
                    .collect::<Result<Vec<_>>>()?;
                let base = fold_tokens(cached.into_iter()) as f32;
                states.extend((0..hidden).map(|k| base + k as f32));
            }

            let mut meta = BTreeMap::new();
            meta.insert("history_length".to_string(), (history + len) as i64);
            metas.push(meta);
            cursor += len;
        }

        debug!(
            rank = self.rank,
            world_size,
            tokens = ids.len(),
            decoding = inputs.is_decoding,
            "Reference forward"
        );

        Ok(StepOutput {
            hidden_states: Tensor::from_f32(&states, vec![ids.len(), hidden]),
            model_metas: Some(metas),
        })
    }

    fn get_logits(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let values = hidden_states.to_f32_vec()?;
        let hidden = self.model.hidden_size;
        let vocab = self.model.vocab_size;
        if hidden_states.shape.last() != Some(&hidden) {
            return Err(AgentError::Backend(format!(
                "Hidden states shape {:?} does not end in hidden size {}",
                hidden_states.shape, hidden
            )));
        }
        let tokens = values.len() / hidden;
        let logits: Vec<f32> = values
            .chunks_exact(hidden)
            .flat_map(|row| (0..vocab).map(move |v| row[v % hidden]))
            .collect();
        Ok(Tensor::new(
            DType::F32,
            vec![tokens, vocab],
            logits.iter().flat_map(|v| v.to_le_bytes()).collect(),
        ))
    }
}

/// Builds [`ReferenceBackend`] shards over a [`HostCacheEngine`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceFactory;

impl BackendFactory for ReferenceFactory {
    type Cache = HostCacheEngine;
    type Backend = ReferenceBackend;

    fn build_model(&self, ctx: &ShardContext) -> Result<ReferenceBackend> {
        if ctx.rank == 0 {
            info!(model_path = %ctx.model_path, "build model.");
            info!("loading weights.");
            info!(adapters = ctx.adapters.len(), "loading adapters.");
        }
        Ok(ReferenceBackend::new(ctx.model.clone(), ctx.rank))
    }

    fn build_cache_engine(
        &self,
        _ctx: &ShardContext,
        cache: &CacheConfig,
    ) -> Result<HostCacheEngine> {
        HostCacheEngine::new(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheEngine;
    use crate::inputs::SwapMap;

    fn model() -> ModelConfig {
        ModelConfig {
            hidden_size: 4,
            num_layers: 1,
            num_attention_heads: 2,
            num_key_value_heads: 2,
            k_head_dim: 8,
            v_head_dim: 8,
            vocab_size: 6,
            sliding_window: None,
            dtype: DType::F32,
            tp: 1,
        }
    }

    fn cache() -> HostCacheEngine {
        HostCacheEngine::new(&CacheConfig {
            block_size: 2,
            num_gpu_blocks: 4,
            num_cpu_blocks: 4,
            ..CacheConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_forward_writes_cache_slots() {
        let mut backend = ReferenceBackend::new(model(), 0);
        let mut cache = cache();
        let inputs = ModelInputs::new(&[vec![5, 6, 7]], vec![0], vec![vec![1, 3]], false).unwrap();
        let out = backend.forward(&inputs, &mut cache, 1).unwrap();

        assert_eq!(cache.device_block(1), vec![5, 6]);
        assert_eq!(cache.device_block(3), vec![7, 0]);
        assert_eq!(out.hidden_states.shape, vec![3, 4]);
        let states = out.hidden_states.to_f32_vec().unwrap();
        // last token folds 5*1 + 6*2 + 7*3
        assert_eq!(&states[8..12], &[38.0, 39.0, 40.0, 41.0]);
        let metas = out.model_metas.unwrap();
        assert_eq!(metas[0]["history_length"], 3);
    }

    #[test]
    fn test_decode_sees_cached_history() {
        let mut backend = ReferenceBackend::new(model(), 0);
        let mut cache = cache();
        cache.fill_host_block(0, &[5, 6]).unwrap();
        cache.swap_in(&SwapMap::from([(0, 2)])).unwrap();
        cache.wait().unwrap();

        let inputs = ModelInputs::new(&[vec![7]], vec![2], vec![vec![2, 3]], true).unwrap();
        let out = backend.forward(&inputs, &mut cache, 1).unwrap();
        let states = out.hidden_states.to_f32_vec().unwrap();
        assert_eq!(states[0], 38.0);
    }

    #[test]
    fn test_missing_block_is_error() {
        let mut backend = ReferenceBackend::new(model(), 0);
        let mut cache = cache();
        let inputs = ModelInputs::new(&[vec![1, 2, 3]], vec![0], vec![vec![0]], false).unwrap();
        assert!(backend.forward(&inputs, &mut cache, 1).is_err());
    }

    #[test]
    fn test_get_logits_shape() {
        let backend = ReferenceBackend::new(model(), 0);
        let hidden = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], vec![1, 4]);
        let logits = backend.get_logits(&hidden).unwrap();
        assert_eq!(logits.shape, vec![1, 6]);
        assert_eq!(
            logits.to_f32_vec().unwrap(),
            vec![1.0, 2.0, 3.0, 4.0, 1.0, 2.0]
        );
    }
}
