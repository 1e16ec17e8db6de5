//! Tensor-parallel model agent
//!
//! Owns one model's shards and KV cache and executes forward steps. With
//! `tp > 1` the agent spawns one subordinate process per extra rank, keeps them
//! in lockstep with a step barrier, broadcasts every step's input from rank 0
//! and tears the whole fleet down when any member dies.

pub mod agent;
pub mod backend;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod errors;
pub mod group;
pub mod inputs;
pub mod memory;
pub mod observability;
pub mod stats;
pub mod supervisor;
pub mod tensor;

pub use agent::{build_model_agent, AgentState, BaseModelAgent, ModelAgent, TpModelAgent};
pub use backend::{BackendFactory, ComputeBackend, ReferenceFactory, ShardContext};
pub use cache::{CacheEngine, HostCacheEngine};
pub use config::{AgentConfig, CacheConfig, ModelConfig, QuantPolicy};
pub use errors::{AgentError, Result};
pub use inputs::{ModelInputs, StepInput, StepOutput, SwapMap};
pub use memory::{format_bytes, parse_memory_string, MemoryPlanner};
pub use observability::{init_production_logging, init_simple_logging, init_worker_logging};
pub use stats::StepStats;
pub use tensor::{DType, Tensor, TensorMeta};
