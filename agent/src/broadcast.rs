//! Two-phase step-input broadcast
//!
//! Phase 1 sends the step input over the host channel with its token payload
//! swapped for a shape-only placeholder. Phase 2 sends the payload bytes over
//! the device channel; receivers allocate a buffer from the placeholder and
//! fill it in place. Rank 0 always sends, every other rank always receives.

use crate::errors::{AgentError, Result};
use crate::group::wire::encode_object;
use crate::group::ProcessGroup;
use crate::inputs::{ModelInputs, Payload, StepInput, SwapMap};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Phase 1 message: payload-free inputs plus both swap maps.
#[derive(Debug, Serialize, Deserialize)]
struct StepHeader {
    inputs: ModelInputs,
    swap_in: SwapMap,
    swap_out: SwapMap,
}

/// Rank 0's step input, split and encoded so that nothing left to do before
/// sending can fail except I/O.
#[derive(Debug)]
pub struct PreparedStep {
    header: StepHeader,
    frame: Vec<u8>,
    payload: Tensor,
}

impl PreparedStep {
    pub fn new(step: StepInput) -> Result<Self> {
        let (stripped, payload) = step.inputs.into_parts();
        let payload = payload.ok_or_else(|| {
            AgentError::InvalidState("rank 0 step input has no materialized payload".into())
        })?;
        let header = StepHeader {
            inputs: stripped,
            swap_in: step.swap_in,
            swap_out: step.swap_out,
        };
        let frame = encode_object(&header)
            .map_err(|e| AgentError::InvalidState(format!("step header cannot be sent: {}", e)))?;
        Ok(Self {
            header,
            frame,
            payload,
        })
    }

    /// Encoded header size in bytes.
    pub fn header_len(&self) -> usize {
        self.frame.len()
    }

    fn into_step(self) -> Result<StepInput> {
        Ok(StepInput::new(
            self.header.inputs.with_payload(self.payload)?,
            self.header.swap_in,
            self.header.swap_out,
        ))
    }
}

/// Send a prepared step from rank 0 to every other rank.
pub fn send_prepared(group: &mut ProcessGroup, mut prepared: PreparedStep) -> Result<StepInput> {
    if !group.is_leader() {
        return Err(AgentError::InvalidState(
            "only rank 0 sends the step input".into(),
        ));
    }
    if group.world_size() > 1 {
        group.broadcast_encoded(&prepared.frame)?;
        group.broadcast_payload(prepared.payload.as_bytes_mut())?;
        trace!(bytes = prepared.payload.as_bytes().len(), "Step input sent");
    }
    prepared.into_step()
}

/// Distribute one step input from rank 0 to every rank.
///
/// Rank 0 passes `Some(step)`; other ranks pass `None`. Every rank returns an
/// independent copy value-equal to rank 0's input.
pub fn broadcast_inputs(group: &mut ProcessGroup, step: Option<StepInput>) -> Result<StepInput> {
    if group.is_leader() {
        let step = step.ok_or_else(|| {
            AgentError::InvalidState("rank 0 must supply the step input".into())
        })?;
        if group.world_size() == 1 {
            return Ok(step);
        }
        send_prepared(group, PreparedStep::new(step)?)
    } else {
        let header: StepHeader = group.broadcast_object(None)?;
        let meta = match &header.inputs.input_ids {
            Payload::Placeholder(meta) => meta.clone(),
            Payload::Materialized(_) => {
                return Err(AgentError::Group(
                    "step header arrived with a materialized payload".into(),
                ))
            }
        };
        let mut payload = Tensor::zeros(&meta);
        group.broadcast_payload(payload.as_bytes_mut())?;
        trace!(rank = group.rank(), bytes = payload.as_bytes().len(), "Step input received");

        Ok(StepInput::new(
            header.inputs.with_payload(payload)?,
            header.swap_in,
            header.swap_out,
        ))
    }
}
