//! Host-memory cache engine with a background copy stream
//!
//! Blocks hold one token id per slot. Storage is sparse: a block that was never
//! written reads as zeros, so planning millions of blocks costs nothing until
//! they are touched. Swaps are queued to a copy thread and complete
//! asynchronously; [`CacheEngine::wait`] is the only synchronization point.

use super::CacheEngine;
use crate::config::CacheConfig;
use crate::errors::{AgentError, Result};
use crate::inputs::SwapMap;
use crossbeam::channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// host -> device
    In,
    /// device -> host
    Out,
}

struct CopyJob {
    direction: Direction,
    pairs: Vec<(u32, u32)>,
}

/// Sparse block storage: block index -> token slots.
#[derive(Default)]
struct BlockArray {
    blocks: HashMap<u32, Box<[i64]>>,
}

impl BlockArray {
    fn read(&self, block: u32, offset: usize) -> i64 {
        self.blocks.get(&block).map_or(0, |b| b[offset])
    }
}

struct Storage {
    device: BlockArray,
    host: BlockArray,
}

/// Issued-but-unfinished copy jobs.
struct Pending {
    count: Mutex<usize>,
    done: Condvar,
}

/// Reference [`CacheEngine`] keeping both block arrays in host memory.
pub struct HostCacheEngine {
    block_size: usize,
    num_device_blocks: usize,
    num_host_blocks: usize,
    storage: Arc<Mutex<Storage>>,
    pending: Arc<Pending>,
    jobs: Option<Sender<CopyJob>>,
    copier: Option<JoinHandle<()>>,
}

impl HostCacheEngine {
    /// Create an engine sized by a reconciled cache config and start its copy stream.
    pub fn new(config: &CacheConfig) -> Result<Self> {
        if config.num_gpu_blocks == 0 || config.num_cpu_blocks == 0 {
            return Err(AgentError::Cache(format!(
                "Cache engine needs at least one block per tier (gpu={}, cpu={})",
                config.num_gpu_blocks, config.num_cpu_blocks
            )));
        }

        let storage = Arc::new(Mutex::new(Storage {
            device: BlockArray::default(),
            host: BlockArray::default(),
        }));
        let pending = Arc::new(Pending {
            count: Mutex::new(0),
            done: Condvar::new(),
        });
        let (tx, rx) = unbounded::<CopyJob>();

        let copier = {
            let storage = Arc::clone(&storage);
            let pending = Arc::clone(&pending);
            std::thread::Builder::new()
                .name("cache-copy".into())
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        {
                            let mut storage = storage.lock();
                            let Storage { device, host } = &mut *storage;
                            let (src, dst) = match job.direction {
                                Direction::In => (&*host, device),
                                Direction::Out => (&*device, host),
                            };
                            for (from, to) in &job.pairs {
                                match src.blocks.get(from) {
                                    Some(data) => {
                                        dst.blocks.insert(*to, data.clone());
                                    }
                                    None => {
                                        dst.blocks.remove(to);
                                    }
                                }
                            }
                            trace!(direction = ?job.direction, blocks = job.pairs.len(), "copy job done");
                        }
                        let mut count = pending.count.lock();
                        *count -= 1;
                        pending.done.notify_all();
                    }
                })?
        };

        debug!(
            num_gpu_blocks = config.num_gpu_blocks,
            num_cpu_blocks = config.num_cpu_blocks,
            block_size = config.block_size,
            "Host cache engine ready"
        );

        Ok(Self {
            block_size: config.block_size,
            num_device_blocks: config.num_gpu_blocks,
            num_host_blocks: config.num_cpu_blocks,
            storage,
            pending,
            jobs: Some(tx),
            copier: Some(copier),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_device_blocks(&self) -> usize {
        self.num_device_blocks
    }

    pub fn num_host_blocks(&self) -> usize {
        self.num_host_blocks
    }

    fn check_slot(&self, block: u32, offset: usize) -> Result<()> {
        if block as usize >= self.num_device_blocks || offset >= self.block_size {
            return Err(AgentError::Cache(format!(
                "Slot ({}, {}) outside device cache of {} blocks x {} tokens",
                block, offset, self.num_device_blocks, self.block_size
            )));
        }
        Ok(())
    }

    /// Read one token slot of a device block.
    pub fn read_slot(&self, block: u32, offset: usize) -> Result<i64> {
        self.check_slot(block, offset)?;
        Ok(self.storage.lock().device.read(block, offset))
    }

    /// Write one token slot of a device block, materializing the block on first touch.
    pub fn write_slot(&mut self, block: u32, offset: usize, value: i64) -> Result<()> {
        self.check_slot(block, offset)?;
        let block_size = self.block_size;
        let mut storage = self.storage.lock();
        let data = storage
            .device
            .blocks
            .entry(block)
            .or_insert_with(|| vec![0i64; block_size].into_boxed_slice());
        data[offset] = value;
        Ok(())
    }

    /// Snapshot of a device block's slots.
    pub fn device_block(&self, block: u32) -> Vec<i64> {
        let storage = self.storage.lock();
        (0..self.block_size)
            .map(|offset| storage.device.read(block, offset))
            .collect()
    }

    /// Snapshot of a host block's slots.
    pub fn host_block(&self, block: u32) -> Vec<i64> {
        let storage = self.storage.lock();
        (0..self.block_size)
            .map(|offset| storage.host.read(block, offset))
            .collect()
    }

    /// Write a whole host block (used to seed swapped-out state).
    pub fn fill_host_block(&mut self, block: u32, values: &[i64]) -> Result<()> {
        if block as usize >= self.num_host_blocks || values.len() != self.block_size {
            return Err(AgentError::Cache(format!(
                "Host block {} fill of {} values rejected ({} blocks x {} tokens)",
                block,
                values.len(),
                self.num_host_blocks,
                self.block_size
            )));
        }
        self.storage
            .lock()
            .host
            .blocks
            .insert(block, values.to_vec().into_boxed_slice());
        Ok(())
    }

    fn submit(&self, direction: Direction, map: &SwapMap) -> Result<()> {
        let (src_limit, dst_limit) = match direction {
            Direction::In => (self.num_host_blocks, self.num_device_blocks),
            Direction::Out => (self.num_device_blocks, self.num_host_blocks),
        };
        for (&src, &dst) in map {
            if src as usize >= src_limit || dst as usize >= dst_limit {
                return Err(AgentError::Cache(format!(
                    "Swap {:?} {} -> {} out of range (src blocks {}, dst blocks {})",
                    direction, src, dst, src_limit, dst_limit
                )));
            }
        }

        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| AgentError::Cache("Cache engine is shut down".into()))?;

        *self.pending.count.lock() += 1;
        let job = CopyJob {
            direction,
            pairs: map.iter().map(|(s, d)| (*s, *d)).collect(),
        };
        if jobs.send(job).is_err() {
            let mut count = self.pending.count.lock();
            *count -= 1;
            return Err(AgentError::Cache("Copy stream stopped".into()));
        }
        Ok(())
    }
}

impl CacheEngine for HostCacheEngine {
    fn swap_in(&mut self, map: &SwapMap) -> Result<()> {
        self.submit(Direction::In, map)
    }

    fn swap_out(&mut self, map: &SwapMap) -> Result<()> {
        self.submit(Direction::Out, map)
    }

    fn wait(&self) -> Result<()> {
        let mut count = self.pending.count.lock();
        while *count > 0 {
            if self.copier.as_ref().map_or(true, |h| h.is_finished()) {
                return Err(AgentError::Cache(
                    "Copy stream exited with jobs outstanding".into(),
                ));
            }
            self.pending.done.wait(&mut count);
        }
        Ok(())
    }
}

impl Drop for HostCacheEngine {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(handle) = self.copier.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(gpu: usize, cpu: usize) -> HostCacheEngine {
        let config = CacheConfig {
            block_size: 4,
            num_gpu_blocks: gpu,
            num_cpu_blocks: cpu,
            ..CacheConfig::default()
        };
        HostCacheEngine::new(&config).unwrap()
    }

    #[test]
    fn test_rejects_empty_tier() {
        let config = CacheConfig {
            num_gpu_blocks: 4,
            num_cpu_blocks: 0,
            ..CacheConfig::default()
        };
        assert!(HostCacheEngine::new(&config).is_err());
    }

    #[test]
    fn test_unwritten_blocks_read_zero() {
        let engine = engine(4, 4);
        assert_eq!(engine.device_block(3), vec![0; 4]);
        assert_eq!(engine.read_slot(0, 2).unwrap(), 0);
    }

    #[test]
    fn test_write_and_read_slot() {
        let mut engine = engine(4, 4);
        engine.write_slot(1, 3, 77).unwrap();
        assert_eq!(engine.read_slot(1, 3).unwrap(), 77);
        assert!(engine.write_slot(4, 0, 1).is_err());
        assert!(engine.write_slot(0, 4, 1).is_err());
    }

    #[test]
    fn test_swap_in_and_out() {
        let mut engine = engine(4, 4);
        engine.fill_host_block(0, &[1, 2, 3, 4]).unwrap();
        engine.write_slot(1, 0, 9).unwrap();

        engine.swap_in(&SwapMap::from([(0, 2)])).unwrap();
        engine.swap_out(&SwapMap::from([(1, 3)])).unwrap();
        engine.wait().unwrap();

        assert_eq!(engine.device_block(2), vec![1, 2, 3, 4]);
        assert_eq!(engine.host_block(3), vec![9, 0, 0, 0]);
    }

    #[test]
    fn test_swap_of_untouched_block_clears_destination() {
        let mut engine = engine(4, 4);
        engine.write_slot(2, 0, 5).unwrap();
        engine.swap_in(&SwapMap::from([(1, 2)])).unwrap();
        engine.wait().unwrap();
        assert_eq!(engine.device_block(2), vec![0; 4]);
    }

    #[test]
    fn test_swap_rejects_out_of_range() {
        let mut engine = engine(4, 2);
        assert!(engine.swap_in(&SwapMap::from([(2, 0)])).is_err());
        assert!(engine.swap_out(&SwapMap::from([(0, 2)])).is_err());
        // nothing was queued
        engine.wait().unwrap();
    }

    #[test]
    fn test_wait_without_jobs_returns() {
        let engine = engine(2, 2);
        engine.wait().unwrap();
    }
}
