//! Subordinate worker processes: launch on rank 0, step loop on ranks 1..N

use super::build::{build_shard, Shard};
use super::AgentState;
use crate::backend::{BackendFactory, ComputeBackend, ShardContext};
use crate::broadcast::broadcast_inputs;
use crate::cache::cache_swapping;
use crate::config::{AgentConfig, CacheConfig, ModelConfig};
use crate::errors::{AgentError, Result};
use crate::group::wire::{read_object, write_object};
use crate::group::{BarrierMember, ProcessGroup, Rendezvous};
use crate::memory::{MemoryPlanner, MemorySource};
use crate::observability::init_worker_logging;
use crate::supervisor::{ChildProcess, ProcessHandle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Everything a subordinate needs, handed over explicitly at spawn time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerBootstrap {
    pub rank: usize,
    pub world_size: usize,
    pub model_path: String,
    pub model: ModelConfig,
    pub cache: CacheConfig,
    pub adapters: BTreeMap<String, String>,
    pub rendezvous: Rendezvous,
    pub barrier_addr: SocketAddr,
    pub group_timeout_secs: u64,
    pub log_level: String,
    pub host_mem_size: u64,
    pub memory: MemorySource,
}

impl WorkerBootstrap {
    pub fn group_timeout(&self) -> Duration {
        Duration::from_secs(self.group_timeout_secs)
    }

    pub fn shard_context(&self) -> ShardContext {
        ShardContext {
            model_path: self.model_path.clone(),
            model: self.model.clone(),
            adapters: self.adapters.clone(),
            rank: self.rank,
            world_size: self.world_size,
            device_id: self.rank,
        }
    }
}

/// Starts one subordinate process.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, bootstrap: &WorkerBootstrap) -> Result<Box<dyn ProcessHandle>>;
}

/// Launches `program args...` and writes the CBOR bootstrap to its stdin.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-execute the running binary's `worker` subcommand.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, vec!["worker".to_string()]))
    }

    /// Use `worker_program` from the config when set, else the running binary.
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        match &config.worker_program {
            Some(program) => Ok(Self::new(program, vec!["worker".to_string()])),
            None => Self::current_exe(),
        }
    }
}

impl WorkerLauncher for CommandLauncher {
    fn launch(&self, bootstrap: &WorkerBootstrap) -> Result<Box<dyn ProcessHandle>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                AgentError::WorkerSpawn(format!(
                    "failed to start rank {} via {}: {}",
                    bootstrap.rank,
                    self.program.display(),
                    e
                ))
            })?;

        let handed_over = match child.stdin.take() {
            Some(mut stdin) => write_object(&mut stdin, bootstrap).map_err(|e| {
                AgentError::WorkerSpawn(format!("bootstrap of rank {} failed: {}", bootstrap.rank, e))
            }),
            None => Err(AgentError::WorkerSpawn("worker stdin not captured".into())),
        };

        let mut handle = ChildProcess::new(bootstrap.rank, child);
        if let Err(e) = handed_over {
            handle.close();
            return Err(e);
        }
        debug!(rank = bootstrap.rank, pid = handle.pid(), "Worker launched");
        Ok(Box::new(handle))
    }
}

/// Read the bootstrap a coordinator wrote to this process's stdin.
pub fn read_bootstrap<R: Read>(reader: &mut R) -> Result<WorkerBootstrap> {
    read_object(reader).map_err(|e| AgentError::Serialization(format!("worker bootstrap: {}", e)))
}

/// Build this rank's shard and serve steps until the barrier is aborted.
///
/// Never returns `Ok`: the loop ends with [`AgentError::BarrierAborted`] on a
/// clean shutdown or with the error that broke it.
pub fn run_worker<F: BackendFactory>(factory: &F, bootstrap: &WorkerBootstrap) -> Result<()> {
    let timeout = bootstrap.group_timeout();
    let mut group = ProcessGroup::connect(
        &bootstrap.rendezvous,
        bootstrap.rank,
        bootstrap.world_size,
        timeout,
    )?;

    let result = serve(factory, bootstrap, &mut group);
    if let Err(e) = &result {
        if !e.is_abort() {
            group.destroy();
        }
    }
    result
}

fn serve<F: BackendFactory>(
    factory: &F,
    bootstrap: &WorkerBootstrap,
    group: &mut ProcessGroup,
) -> Result<()> {
    let mut barrier =
        BarrierMember::connect(bootstrap.barrier_addr, bootstrap.rank, bootstrap.group_timeout())?;

    let planner = MemoryPlanner::new(bootstrap.memory.probe(), bootstrap.host_mem_size);
    let ctx = bootstrap.shard_context();
    let mut state = AgentState::Uninitialized;
    let Shard {
        mut backend,
        mut cache_engine,
        cache_config,
    } = build_shard(factory, &ctx, &bootstrap.cache, &planner, Some(&mut *group), &mut state)
        .map_err(|e| {
            warn!(rank = bootstrap.rank, state = ?state, error = %e, "Shard construction failed");
            e
        })?;
    info!(
        rank = bootstrap.rank,
        num_gpu_blocks = cache_config.num_gpu_blocks,
        "Worker ready"
    );

    loop {
        barrier.wait()?;
        let step = broadcast_inputs(group, None)?;
        cache_swapping(&mut cache_engine, &step.swap_in, &step.swap_out)?;
        backend.forward(&step.inputs, &mut cache_engine, bootstrap.world_size)?;
    }
}

/// Entry point of a subordinate process. Returns the process exit code.
pub fn run_worker_process<F: BackendFactory>(factory: &F) -> i32 {
    let bootstrap = match read_bootstrap(&mut std::io::stdin().lock()) {
        Ok(bootstrap) => bootstrap,
        Err(e) => {
            eprintln!("tp-agent worker: {}", e);
            return 1;
        }
    };

    if let Err(e) = init_worker_logging(&bootstrap.log_level, bootstrap.rank) {
        eprintln!("tp-agent worker: failed to initialize logging: {}", e);
    }

    match run_worker(factory, &bootstrap) {
        Ok(()) => 0,
        Err(e) if e.is_abort() => {
            warn!("Rank[{}] exit.", bootstrap.rank);
            0
        }
        Err(e) => {
            error!(rank = bootstrap.rank, error = %e, "Rank[{}] failed.", bootstrap.rank);
            1
        }
    }
}
