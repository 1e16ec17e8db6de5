//! Per-step model inputs and outputs

use crate::errors::{AgentError, Result};
use crate::tensor::{Tensor, TensorMeta};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Source block index -> destination block index.
pub type SwapMap = BTreeMap<u32, u32>;

/// The large tensor of a step input: either real data or a shape-only stand-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Materialized(Tensor),
    Placeholder(TensorMeta),
}

impl Payload {
    pub fn meta(&self) -> TensorMeta {
        match self {
            Payload::Materialized(t) => t.meta(),
            Payload::Placeholder(meta) => meta.clone(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Payload::Placeholder(_))
    }
}

/// Prepared inputs for one forward step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInputs {
    /// Token ids, `[total_tokens]` of i64
    pub input_ids: Payload,
    /// Tokens contributed by each sequence this step
    pub seq_length: Vec<usize>,
    /// Tokens already cached for each sequence
    pub history_lengths: Vec<usize>,
    /// Device block table of each sequence
    pub block_offsets: Vec<Vec<u32>>,
    pub is_decoding: bool,
}

impl ModelInputs {
    /// Build inputs from token ids, one slice per sequence.
    pub fn new(
        sequences: &[Vec<i64>],
        history_lengths: Vec<usize>,
        block_offsets: Vec<Vec<u32>>,
        is_decoding: bool,
    ) -> Result<Self> {
        if sequences.len() != history_lengths.len() || sequences.len() != block_offsets.len() {
            return Err(AgentError::InvalidState(format!(
                "Batch of {} sequences has {} history lengths and {} block tables",
                sequences.len(),
                history_lengths.len(),
                block_offsets.len()
            )));
        }
        let seq_length = sequences.iter().map(Vec::len).collect();
        let ids: Vec<i64> = sequences.iter().flatten().copied().collect();
        let n = ids.len();
        Ok(Self {
            input_ids: Payload::Materialized(Tensor::from_i64(&ids, vec![n])),
            seq_length,
            history_lengths,
            block_offsets,
            is_decoding,
        })
    }

    /// Materialized token ids; fails on a placeholder.
    pub fn input_ids(&self) -> Result<&Tensor> {
        match &self.input_ids {
            Payload::Materialized(t) => Ok(t),
            Payload::Placeholder(_) => Err(AgentError::InvalidState(
                "input_ids payload has not been received yet".into(),
            )),
        }
    }

    /// Split off the payload, leaving a placeholder in its place.
    pub fn into_parts(self) -> (Self, Option<Tensor>) {
        match self.input_ids {
            Payload::Materialized(tensor) => {
                let meta = tensor.meta();
                (
                    Self {
                        input_ids: Payload::Placeholder(meta),
                        ..self
                    },
                    Some(tensor),
                )
            }
            Payload::Placeholder(_) => (self, None),
        }
    }

    /// Fill the placeholder with a received payload of the matching shape.
    pub fn with_payload(self, tensor: Tensor) -> Result<Self> {
        let expected = self.input_ids.meta();
        if tensor.meta() != expected {
            return Err(AgentError::Group(format!(
                "Payload {:?}{:?} does not match placeholder {:?}{:?}",
                tensor.dtype, tensor.shape, expected.dtype, expected.shape
            )));
        }
        Ok(Self {
            input_ids: Payload::Materialized(tensor),
            ..self
        })
    }
}

/// One step's inputs plus the swaps to apply before compute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInput {
    pub inputs: ModelInputs,
    pub swap_in: SwapMap,
    pub swap_out: SwapMap,
}

impl StepInput {
    pub fn new(inputs: ModelInputs, swap_in: SwapMap, swap_out: SwapMap) -> Self {
        Self {
            inputs,
            swap_in,
            swap_out,
        }
    }
}

/// Result of one forward step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub hidden_states: Tensor,
    /// Opaque per-sequence metadata produced by the backend
    pub model_metas: Option<Vec<BTreeMap<String, i64>>>,
}
