//! Tensor-parallel agent: rank 0 in this process, ranks 1..N as subordinates

use super::build::{build_shard, Shard};
use super::worker::{CommandLauncher, WorkerBootstrap, WorkerLauncher};
use super::{AgentState, ModelAgent};
use crate::backend::{BackendFactory, ComputeBackend, ShardContext};
use crate::broadcast::{send_prepared, PreparedStep};
use crate::cache::cache_swapping;
use crate::config::{AgentConfig, CacheConfig, ModelConfig};
use crate::errors::{AgentError, Result};
use crate::group::{BarrierHost, ProcessGroup, Rendezvous};
use crate::inputs::{StepInput, StepOutput};
use crate::memory::MemoryPlanner;
use crate::stats::StepStats;
use crate::supervisor::{exit_process, signal, FailureAction, SharedHandles, Watchdog};
use crate::tensor::Tensor;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long `close` waits for a subordinate to exit on its own before killing it.
pub const WORKER_JOIN_GRACE: Duration = Duration::from_secs(10);

/// Grace period for subordinates when the fleet is torn down after a failure.
const FAILURE_GRACE: Duration = Duration::from_secs(2);

/// Coordinator of a tensor-parallel fleet.
///
/// Every `forward` passes the step barrier, broadcasts the step input from
/// rank 0, then runs swap and compute locally. The subordinates run the same
/// sequence in their own processes.
///
/// An input rank 0 cannot send is rejected before the barrier and the agent
/// stays `Ready`. A failure past the barrier shuts the fleet down and leaves
/// the agent `Closed`.
pub struct TpModelAgent<F: BackendFactory> {
    model_config: ModelConfig,
    cache_config: CacheConfig,
    world_size: usize,
    backend: Option<F::Backend>,
    cache_engine: Option<F::Cache>,
    group: ProcessGroup,
    barrier: BarrierHost,
    workers: SharedHandles,
    watchdog: Option<Watchdog>,
    state: AgentState,
    stats: Arc<StepStats>,
}

/// Fleet pieces that exist before rank 0's shard is built.
struct Fleet {
    barrier: Option<BarrierHost>,
    group: Option<ProcessGroup>,
    workers: SharedHandles,
    watchdog: Option<Watchdog>,
    state: AgentState,
}

impl Fleet {
    fn teardown(&mut self) {
        teardown_after_failure(
            &mut self.watchdog,
            self.barrier.as_ref(),
            self.group.as_mut(),
            &self.workers,
        );
    }
}

/// Release every subordinate wherever it is blocked, then reap them.
fn teardown_after_failure(
    watchdog: &mut Option<Watchdog>,
    barrier: Option<&BarrierHost>,
    group: Option<&mut ProcessGroup>,
    workers: &SharedHandles,
) {
    if let Some(mut watchdog) = watchdog.take() {
        watchdog.stop();
    }
    if let Some(barrier) = barrier {
        barrier.abort();
    }
    // Subordinates still blocked in a collective only notice EOF
    if let Some(group) = group {
        group.destroy();
    }
    shutdown_workers(workers, FAILURE_GRACE);
}

impl<F: BackendFactory> TpModelAgent<F> {
    /// Spawn the fleet described by `config`, exiting the process if a
    /// subordinate dies.
    pub fn new(factory: &F, config: &AgentConfig) -> Result<Self> {
        let launcher = CommandLauncher::from_config(config)?;
        Self::with_launcher(factory, config, &launcher, exit_process())
    }

    /// Spawn the fleet with an explicit launcher and fleet-failure action.
    pub fn with_launcher(
        factory: &F,
        config: &AgentConfig,
        launcher: &dyn WorkerLauncher,
        on_failure: FailureAction,
    ) -> Result<Self> {
        let world_size = config.tp;
        if world_size < 2 {
            return Err(AgentError::Config(format!(
                "tensor-parallel agent needs tp >= 2, got {}",
                world_size
            )));
        }

        signal::install_sigterm_handler()?;

        let fleet_failed = Arc::new(AtomicBool::new(false));
        let on_failure: FailureAction = {
            let fleet_failed = Arc::clone(&fleet_failed);
            Arc::new(move |code| {
                fleet_failed.store(true, Ordering::SeqCst);
                on_failure(code);
            })
        };

        let mut fleet = Fleet {
            barrier: None,
            group: None,
            workers: Arc::new(Mutex::new(Vec::new())),
            watchdog: None,
            state: AgentState::Uninitialized,
        };

        match Self::assemble(factory, config, launcher, on_failure, &fleet_failed, &mut fleet) {
            Ok(shard) => {
                let (Some(barrier), Some(group)) = (fleet.barrier.take(), fleet.group.take()) else {
                    fleet.teardown();
                    return Err(AgentError::InvalidState("fleet assembled without a group".into()));
                };
                info!(
                    world_size,
                    num_gpu_blocks = shard.cache_config.num_gpu_blocks,
                    num_cpu_blocks = shard.cache_config.num_cpu_blocks,
                    "Tensor-parallel agent ready"
                );
                Ok(Self {
                    model_config: config.model.clone(),
                    cache_config: shard.cache_config,
                    world_size,
                    backend: Some(shard.backend),
                    cache_engine: Some(shard.cache_engine),
                    group,
                    barrier,
                    workers: fleet.workers,
                    watchdog: fleet.watchdog,
                    state: fleet.state,
                    stats: Arc::new(StepStats::new()),
                })
            }
            Err(e) => {
                warn!(state = ?fleet.state, error = %e, "Tensor-parallel agent construction failed");
                fleet.teardown();
                Err(e)
            }
        }
    }

    fn assemble(
        factory: &F,
        config: &AgentConfig,
        launcher: &dyn WorkerLauncher,
        on_failure: FailureAction,
        fleet_failed: &Arc<AtomicBool>,
        fleet: &mut Fleet,
    ) -> Result<Shard<F>> {
        let world_size = config.tp;
        let timeout = config.group_timeout();
        let memory = config.memory_source()?;
        let host_mem_size = config.host_mem_bytes()?;

        let barrier_addr = fleet.barrier.insert(BarrierHost::bind(world_size)?).addr();
        let (rendezvous, listener) = Rendezvous::bind_leader()?;
        info!(
            world_size,
            addr = %rendezvous.addr,
            port = rendezvous.port,
            "Starting tensor-parallel fleet"
        );

        for rank in 1..world_size {
            let bootstrap = WorkerBootstrap {
                rank,
                world_size,
                model_path: config.model_path.clone(),
                model: config.model.clone(),
                cache: config.cache.clone(),
                adapters: config.adapters.clone(),
                rendezvous: rendezvous.clone(),
                barrier_addr,
                group_timeout_secs: config.group_timeout_secs,
                log_level: config.log_level.clone(),
                host_mem_size,
                memory: memory.clone(),
            };
            let handle = launcher.launch(&bootstrap)?;
            let pid = handle.pid();
            fleet.workers.lock().push(handle);
            signal::register_pid(pid)?;
        }

        fleet.watchdog = Some(Watchdog::start(
            Arc::clone(&fleet.workers),
            config.watchdog_interval(),
            on_failure,
        )?);

        let cancelled = || fleet_failed.load(Ordering::SeqCst);
        let group = fleet.group.insert(ProcessGroup::init_leader_until(
            listener,
            rendezvous.group_id,
            world_size,
            timeout,
            &cancelled,
        )?);
        if let Some(barrier) = fleet.barrier.as_mut() {
            barrier.accept_members_until(timeout, &cancelled)?;
        }

        let planner = MemoryPlanner::new(memory.probe(), host_mem_size);
        let ctx = ShardContext {
            model_path: config.model_path.clone(),
            model: config.model.clone(),
            adapters: config.adapters.clone(),
            rank: 0,
            world_size,
            device_id: 0,
        };
        build_shard(factory, &ctx, &config.cache, &planner, Some(group), &mut fleet.state)
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Pids of the subordinate processes, in rank order.
    pub fn worker_pids(&self) -> Vec<u32> {
        self.workers.lock().iter().map(|w| w.pid()).collect()
    }

    /// Whether the liveness watchdog is still polling.
    pub fn watchdog_running(&self) -> bool {
        self.watchdog.as_ref().is_some_and(Watchdog::is_running)
    }

    /// Rank 0's cache engine, or `None` once closed.
    pub fn cache_engine(&self) -> Option<&F::Cache> {
        self.cache_engine.as_ref()
    }

    pub fn stats(&self) -> Arc<StepStats> {
        Arc::clone(&self.stats)
    }

    fn step(&mut self, step: StepInput) -> Result<StepOutput> {
        if self.state != AgentState::Ready {
            return Err(AgentError::InvalidState(format!(
                "forward called on a {:?} agent",
                self.state
            )));
        }

        // Rejections happen here, while every subordinate is still parked at the barrier
        let prepared = PreparedStep::new(step)?;

        match self.run_step(prepared) {
            Ok(output) => Ok(output),
            Err(e) => {
                self.abandon(&e);
                Err(e)
            }
        }
    }

    /// Barrier, broadcast, swap and compute. Any error leaves the fleet out of step.
    fn run_step(&mut self, prepared: PreparedStep) -> Result<StepOutput> {
        let (backend, cache) = match (&mut self.backend, &mut self.cache_engine) {
            (Some(backend), Some(cache)) => (backend, cache),
            _ => return Err(AgentError::InvalidState("agent has no shard".into())),
        };

        let wait_start = Instant::now();
        self.barrier.wait()?;
        self.stats.record_barrier_wait(wait_start.elapsed());

        let start = Instant::now();
        let step = send_prepared(&mut self.group, prepared)?;
        cache_swapping(cache, &step.swap_in, &step.swap_out)?;
        let output = backend.forward(&step.inputs, cache, self.world_size)?;

        self.stats.record_swaps(step.swap_in.len(), step.swap_out.len());
        self.stats
            .record_step(step.inputs.seq_length.iter().sum(), start.elapsed());
        Ok(output)
    }

    /// Tear the fleet down after a step failed past the barrier.
    fn abandon(&mut self, error: &AgentError) {
        warn!(error = %error, "Step failed after the barrier, shutting the fleet down");
        self.backend = None;
        self.cache_engine = None;
        teardown_after_failure(
            &mut self.watchdog,
            Some(&self.barrier),
            Some(&mut self.group),
            &self.workers,
        );
        self.state = AgentState::Closed;
    }
}

/// Join every subordinate within the grace period, killing stragglers.
fn shutdown_workers(workers: &SharedHandles, grace: Duration) {
    let mut workers = workers.lock();
    for worker in workers.iter_mut() {
        match worker.join(grace) {
            Ok(Some(exit)) if exit.is_abnormal() => {
                warn!(rank = worker.rank(), exit = ?exit, "Worker exited abnormally")
            }
            Ok(Some(exit)) => debug!(rank = worker.rank(), exit = ?exit, "Worker exited"),
            Ok(None) => {
                warn!(rank = worker.rank(), "Worker did not exit in time, killing");
                if let Err(e) = worker.kill() {
                    warn!(rank = worker.rank(), error = %e, "Failed to kill worker");
                }
            }
            Err(e) => warn!(rank = worker.rank(), error = %e, "Failed to join worker"),
        }
        worker.close();
    }
}

impl<F: BackendFactory> ModelAgent for TpModelAgent<F> {
    fn forward(&mut self, step: StepInput) -> Result<StepOutput> {
        let was_ready = self.state == AgentState::Ready;
        let result = self.step(step);
        if result.is_err() {
            self.stats.record_failure();
            if was_ready && self.state == AgentState::Closed {
                self.stats.print_summary();
            }
        }
        result
    }

    fn get_logits(&self, hidden_states: &Tensor) -> Result<Tensor> {
        self.backend
            .as_ref()
            .ok_or_else(|| AgentError::InvalidState("get_logits called on a closed agent".into()))?
            .get_logits(hidden_states)
    }

    fn model_config(&self) -> &ModelConfig {
        &self.model_config
    }

    fn cache_config(&self) -> &CacheConfig {
        &self.cache_config
    }

    fn close(&mut self) {
        if self.state == AgentState::Closed {
            return;
        }
        info!("Closing tensor-parallel agent");
        self.backend = None;
        self.cache_engine = None;

        if let Some(mut watchdog) = self.watchdog.take() {
            watchdog.stop();
        }
        self.barrier.abort();
        shutdown_workers(&self.workers, WORKER_JOIN_GRACE);
        self.group.destroy();

        self.state = AgentState::Closed;
        self.stats.print_summary();
        info!("Tensor-parallel agent closed");
    }
}

impl<F: BackendFactory> Drop for TpModelAgent<F> {
    fn drop(&mut self) {
        self.close();
    }
}
