//! Model, cache and agent configuration
//!
//! [`ModelConfig`] is immutable once the agent starts and is shared read-only
//! by every rank. [`CacheConfig`] is refined by the memory planner on each rank,
//! reconciled to one fleet-wide value, and frozen before the first step.
//! [`AgentConfig`] is the TOML file the CLI reads.

use crate::errors::{AgentError, Result};
use crate::memory::{parse_memory_string, MemorySource};
use crate::supervisor::signal::MAX_TRACKED_WORKERS;
use crate::tensor::DType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Immutable description of the loaded model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub k_head_dim: usize,
    pub v_head_dim: usize,
    pub vocab_size: usize,
    /// Sliding attention window, `None` for full attention
    #[serde(default)]
    pub sliding_window: Option<usize>,
    pub dtype: DType,
    /// Number of tensor-parallel shards the weights are split into
    #[serde(default = "default_tp")]
    pub tp: usize,
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("hidden_size", self.hidden_size),
            ("num_layers", self.num_layers),
            ("num_attention_heads", self.num_attention_heads),
            ("num_key_value_heads", self.num_key_value_heads),
            ("k_head_dim", self.k_head_dim),
            ("v_head_dim", self.v_head_dim),
            ("vocab_size", self.vocab_size),
            ("tp", self.tp),
        ];
        for (name, value) in dims {
            if value == 0 {
                return Err(AgentError::Config(format!("model.{} must be positive", name)));
            }
        }
        Ok(())
    }
}

/// KV cache quantization policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantPolicy {
    #[default]
    None,
    Int4,
    Int8,
}

impl QuantPolicy {
    /// Bits per cached element, `None` when elements keep the model dtype.
    pub fn bits(&self) -> Option<usize> {
        match self {
            QuantPolicy::None => None,
            QuantPolicy::Int4 => Some(4),
            QuantPolicy::Int8 => Some(8),
        }
    }
}

/// Memory-budget parameters of the KV cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Tokens per cache block
    pub block_size: usize,
    /// Device-resident blocks (0 = let the planner decide)
    pub num_gpu_blocks: usize,
    /// Host-resident blocks (0 = let the planner decide)
    pub num_cpu_blocks: usize,
    /// Ceiling on tokens processed in one prefill step
    pub max_prefill_token_num: usize,
    /// Fraction of free device memory handed to the cache
    pub cache_max_entry_count: f64,
    pub quant_policy: QuantPolicy,
    pub window_size: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: 64,
            num_gpu_blocks: 0,
            num_cpu_blocks: 0,
            max_prefill_token_num: 4096,
            cache_max_entry_count: 0.8,
            quant_policy: QuantPolicy::None,
            window_size: None,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(AgentError::Config("cache.block_size must be positive".into()));
        }
        if !(self.cache_max_entry_count > 0.0 && self.cache_max_entry_count <= 1.0) {
            return Err(AgentError::Config(format!(
                "cache.cache_max_entry_count must be in (0, 1], got {}",
                self.cache_max_entry_count
            )));
        }
        Ok(())
    }
}

/// Where free device memory readings come from, as written in the config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MemorySpec {
    /// Probe the host with sysinfo
    #[default]
    System,
    /// Fixed per-device sizes such as `["24GiB", "16GiB"]`
    Fixed { devices: Vec<String> },
}

/// Agent configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Path to the model weights (opaque to the agent, handed to the backend)
    pub model_path: String,

    /// Tensor-parallel world size
    #[serde(default = "default_tp")]
    pub tp: usize,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Host memory budget for swapped-out cache blocks (e.g. "1GiB")
    #[serde(default = "default_host_mem_size")]
    pub host_mem_size: String,

    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,

    /// Timeout applied to every process-group operation
    #[serde(default = "default_group_timeout_secs")]
    pub group_timeout_secs: u64,

    /// LoRA adapters: name -> path
    #[serde(default)]
    pub adapters: BTreeMap<String, String>,

    #[serde(default)]
    pub memory: MemorySpec,

    /// Executable launched for subordinate ranks (defaults to the current binary)
    #[serde(default)]
    pub worker_program: Option<PathBuf>,

    pub model: ModelConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

fn default_tp() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host_mem_size() -> String {
    "1GiB".to_string()
}

fn default_watchdog_interval_ms() -> u64 {
    1000
}

/// Roughly 35600 days: group operations never time out in practice.
pub const UNBOUNDED_GROUP_TIMEOUT_SECS: u64 = 35_600 * 24 * 60 * 60;

fn default_group_timeout_secs() -> u64 {
    UNBOUNDED_GROUP_TIMEOUT_SECS
}

impl AgentConfig {
    /// Load agent configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Parse and validate agent configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(contents)
            .map_err(|e| AgentError::Config(format!("failed to parse agent config: {}", e)))?;
        // The shard count always follows the configured world size
        config.model.tp = config.tp;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tp == 0 {
            return Err(AgentError::Config("tp must be at least 1".into()));
        }
        if self.tp > MAX_TRACKED_WORKERS + 1 {
            return Err(AgentError::Config(format!(
                "tp {} exceeds the supported maximum of {}",
                self.tp,
                MAX_TRACKED_WORKERS + 1
            )));
        }
        if self.watchdog_interval_ms == 0 {
            return Err(AgentError::Config("watchdog_interval_ms must be positive".into()));
        }
        if self.group_timeout_secs == 0 {
            return Err(AgentError::Config("group_timeout_secs must be positive".into()));
        }
        self.model.validate()?;
        self.cache.validate()?;
        self.host_mem_bytes()?;
        if let MemorySource::Fixed(devices) = self.memory_source()? {
            if devices.len() < self.tp {
                return Err(AgentError::Config(format!(
                    "memory.devices lists {} devices but tp is {}",
                    devices.len(),
                    self.tp
                )));
            }
        }
        Ok(())
    }

    pub fn host_mem_bytes(&self) -> Result<u64> {
        parse_memory_string(&self.host_mem_size)
    }

    pub fn memory_source(&self) -> Result<MemorySource> {
        match &self.memory {
            MemorySpec::System => Ok(MemorySource::System),
            MemorySpec::Fixed { devices } => devices
                .iter()
                .map(|d| parse_memory_string(d))
                .collect::<Result<Vec<_>>>()
                .map(MemorySource::Fixed),
        }
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn group_timeout(&self) -> Duration {
        Duration::from_secs(self.group_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MINIMAL: &str = r#"
model_path = "/models/llama"
tp = 2

[model]
hidden_size = 4096
num_layers = 32
num_attention_heads = 32
num_key_value_heads = 8
k_head_dim = 128
v_head_dim = 128
vocab_size = 32000
dtype = "bf16"
"#;

    #[test]
    fn test_toml_parse_defaults() {
        let config = AgentConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.tp, 2);
        assert_eq!(config.model.tp, 2);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.watchdog_interval(), Duration::from_secs(1));
        assert_eq!(config.group_timeout_secs, UNBOUNDED_GROUP_TIMEOUT_SECS);
        assert_eq!(config.cache, CacheConfig::default());
        assert_eq!(config.host_mem_bytes().unwrap(), 1_073_741_824);
        assert_eq!(config.memory_source().unwrap(), MemorySource::System);
        assert!(config.adapters.is_empty());
    }

    #[test]
    fn test_toml_parse_fixed_memory_and_cache() {
        let toml_str = format!(
            "{}\n[cache]\nblock_size = 32\nquant_policy = \"int8\"\n\n[memory]\nkind = \"fixed\"\ndevices = [\"24GiB\", \"16GiB\"]\n",
            MINIMAL
        );
        let config = AgentConfig::from_toml(&toml_str).unwrap();
        assert_eq!(config.cache.block_size, 32);
        assert_eq!(config.cache.quant_policy, QuantPolicy::Int8);
        assert_eq!(config.cache.max_prefill_token_num, 4096);
        assert_eq!(
            config.memory_source().unwrap(),
            MemorySource::Fixed(vec![24 * 1_073_741_824, 16 * 1_073_741_824])
        );
    }

    #[test]
    fn test_validate_rejects_zero_tp() {
        let toml_str = MINIMAL.replace("tp = 2", "tp = 0");
        let err = AgentConfig::from_toml(&toml_str).unwrap_err();
        assert!(err.to_string().contains("tp must be at least 1"));
    }

    #[test]
    fn test_validate_rejects_short_device_list() {
        let toml_str = format!(
            "{}\n[memory]\nkind = \"fixed\"\ndevices = [\"24GiB\"]\n",
            MINIMAL
        );
        assert!(AgentConfig::from_toml(&toml_str).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_entry_count() {
        let mut cache = CacheConfig::default();
        cache.cache_max_entry_count = 1.5;
        assert!(cache.validate().is_err());
        cache.cache_max_entry_count = 0.0;
        assert!(cache.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("agent.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = AgentConfig::from_file(&path).unwrap();
        assert_eq!(config.model.vocab_size, 32000);
        assert_eq!(config.model.dtype, DType::BF16);
    }

    #[test]
    fn test_from_file_invalid() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("agent.toml");
        std::fs::write(&path, "this is not valid toml {{{").unwrap();
        let err = AgentConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn test_quant_policy_bits() {
        assert_eq!(QuantPolicy::None.bits(), None);
        assert_eq!(QuantPolicy::Int4.bits(), Some(4));
        assert_eq!(QuantPolicy::Int8.bits(), Some(8));
    }
}
