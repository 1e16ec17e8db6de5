//! Free-memory probes and memory size helpers
//!
//! The planner only needs one number per device: how many bytes are free right
//! now. [`DeviceMemory`] abstracts where that number comes from so the planner
//! stays deterministic under test.

pub mod planner;

pub use planner::MemoryPlanner;

use crate::errors::{AgentError, Result};
use serde::{Deserialize, Serialize};

/// Source of free device memory readings.
pub trait DeviceMemory: Send + Sync {
    /// Free bytes on `device_id` at the time of the call.
    fn free_memory(&self, device_id: usize) -> Result<u64>;
}

/// Reads available memory from the host via sysinfo.
///
/// Used when no accelerator runtime is linked; every device id maps to the
/// same host pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemory;

impl DeviceMemory for SystemMemory {
    fn free_memory(&self, _device_id: usize) -> Result<u64> {
        use sysinfo::System;
        let mut sys = System::new();
        sys.refresh_memory();
        Ok(sys.available_memory())
    }
}

/// Fixed per-device free memory, indexed by device id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedMemory(pub Vec<u64>);

impl DeviceMemory for FixedMemory {
    fn free_memory(&self, device_id: usize) -> Result<u64> {
        self.0.get(device_id).copied().ok_or_else(|| {
            AgentError::Config(format!(
                "No memory reading configured for device {} ({} devices known)",
                device_id,
                self.0.len()
            ))
        })
    }
}

/// Serializable choice of memory probe, passed to subordinate workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemorySource {
    System,
    Fixed(Vec<u64>),
}

impl MemorySource {
    pub fn probe(&self) -> Box<dyn DeviceMemory> {
        match self {
            MemorySource::System => Box::new(SystemMemory),
            MemorySource::Fixed(devices) => Box::new(FixedMemory(devices.clone())),
        }
    }
}

/// Parse memory string (e.g., "24GB", "512MB", "1GiB")
///
/// Supports both decimal (SI) and binary (IEC) units:
/// - Decimal: KB, MB, GB (1000-based)
/// - Binary: KiB, MiB, GiB (1024-based)
/// - Raw bytes when no unit is given
pub fn parse_memory_string(s: &str) -> Result<u64> {
    let upper = s.trim().to_uppercase();

    const UNITS: [(&str, f64); 6] = [
        ("GIB", 1_073_741_824.0),
        ("MIB", 1_048_576.0),
        ("KIB", 1_024.0),
        ("GB", 1_000_000_000.0),
        ("MB", 1_000_000.0),
        ("KB", 1_000.0),
    ];

    for (suffix, scale) in UNITS {
        if let Some(number) = upper.strip_suffix(suffix) {
            let value: f64 = number
                .trim()
                .parse()
                .map_err(|_| AgentError::Config(format!("Invalid memory format: {}", s)))?;
            if value < 0.0 {
                return Err(AgentError::Config(format!("Negative memory size: {}", s)));
            }
            return Ok((value * scale) as u64);
        }
    }

    upper.parse::<u64>().map_err(|_| {
        AgentError::Config(format!(
            "Invalid memory format: {} (expected e.g. 24GB, 512MiB or a byte count)",
            s
        ))
    })
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1 << 30 {
        format!("{:.1} GiB", bytes as f64 / (1u64 << 30) as f64)
    } else if bytes >= 1 << 20 {
        format!("{:.1} MiB", bytes as f64 / (1u64 << 20) as f64)
    } else if bytes >= 1 << 10 {
        format!("{:.1} KiB", bytes as f64 / (1u64 << 10) as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
