//! Integration tests for the fleet collectives
//!
//! Every rank runs on its own thread over real loopback sockets: process group
//! formation, cache budget reconciliation, step barrier and input broadcast.

use std::thread::JoinHandle;
use std::time::Duration;
use tp_agent::agent::reconcile_cache_config;
use tp_agent::broadcast::broadcast_inputs;
use tp_agent::group::{find_available_port, BarrierHost, BarrierMember, ProcessGroup, Rendezvous};
use tp_agent::{AgentError, CacheConfig, ModelInputs, StepInput, SwapMap};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Form a group of `world_size` ranks and run `member` on every subordinate thread.
fn form_group<T, M>(base_port: u16, world_size: usize, member: M) -> (ProcessGroup, Vec<JoinHandle<T>>)
where
    T: Send + 'static,
    M: Fn(usize, ProcessGroup) -> T + Send + Sync + Clone + 'static,
{
    let (port, listener) = find_available_port("127.0.0.1", base_port).unwrap();
    let rdzv = Rendezvous::new("127.0.0.1", port);

    let handles = (1..world_size)
        .map(|rank| {
            let rdzv = rdzv.clone();
            let member = member.clone();
            std::thread::spawn(move || {
                let group = ProcessGroup::connect(&rdzv, rank, world_size, TIMEOUT).unwrap();
                member(rank, group)
            })
        })
        .collect();

    let leader = ProcessGroup::init_leader(listener, rdzv.group_id, world_size, TIMEOUT).unwrap();
    (leader, handles)
}

fn planned(gpu: usize, cpu: usize) -> CacheConfig {
    CacheConfig {
        num_gpu_blocks: gpu,
        num_cpu_blocks: cpu,
        ..CacheConfig::default()
    }
}

fn step(tokens: Vec<i64>, history: usize, swap_in: SwapMap, swap_out: SwapMap) -> StepInput {
    let inputs = ModelInputs::new(&[tokens], vec![history], vec![vec![0, 1]], history > 0).unwrap();
    StepInput::new(inputs, swap_in, swap_out)
}

#[test]
fn test_reconcile_takes_fleet_minimum() {
    let per_rank = [planned(120, 40), planned(100, 60), planned(110, 50)];

    let (mut leader, handles) = form_group(34100, 3, move |rank, mut group| {
        let local = [planned(120, 40), planned(100, 60), planned(110, 50)][rank].clone();
        reconcile_cache_config(&mut group, local).unwrap()
    });

    let unified = reconcile_cache_config(&mut leader, per_rank[0].clone()).unwrap();
    assert_eq!(unified.num_gpu_blocks, 100);
    assert_eq!(unified.num_cpu_blocks, 40);

    for handle in handles {
        assert_eq!(handle.join().unwrap(), unified);
    }
}

#[test]
fn test_broadcast_delivers_identical_steps() {
    let steps = vec![
        step(vec![3, 1, 4, 1, 5], 0, SwapMap::new(), SwapMap::new()),
        step(vec![9], 5, SwapMap::from([(0, 2), (3, 1)]), SwapMap::new()),
        step(vec![2], 6, SwapMap::new(), SwapMap::from([(1, 7)])),
    ];
    let count = steps.len();

    let (mut leader, handles) = form_group(34200, 3, move |_, mut group| {
        (0..count)
            .map(|_| broadcast_inputs(&mut group, None).unwrap())
            .collect::<Vec<_>>()
    });

    for s in &steps {
        let sent = broadcast_inputs(&mut leader, Some(s.clone())).unwrap();
        assert_eq!(&sent, s);
    }

    for handle in handles {
        let received = handle.join().unwrap();
        assert_eq!(received, steps);
        assert!(!received[0].inputs.input_ids.is_placeholder());
    }
}

#[test]
fn test_barrier_gates_every_step() {
    let mut host = BarrierHost::bind(3).unwrap();
    let addr = host.addr();

    let (mut leader, handles) = form_group(34300, 3, move |rank, mut group| {
        let mut barrier = BarrierMember::connect(addr, rank, TIMEOUT).unwrap();
        let mut seen = Vec::new();
        loop {
            if let Err(e) = barrier.wait() {
                assert!(matches!(e, AgentError::BarrierAborted));
                break;
            }
            let step = broadcast_inputs(&mut group, None).unwrap();
            seen.push((barrier.generation(), step.inputs.history_lengths[0]));
        }
        seen
    });
    host.accept_members(TIMEOUT).unwrap();

    for history in [0usize, 4, 5, 6] {
        host.wait().unwrap();
        broadcast_inputs(&mut leader, Some(step(vec![1], history, SwapMap::new(), SwapMap::new())))
            .unwrap();
    }
    host.abort();
    assert!(host.is_aborted());
    assert!(matches!(host.wait(), Err(AgentError::BarrierAborted)));

    for handle in handles {
        let seen = handle.join().unwrap();
        assert_eq!(seen, vec![(1, 0), (2, 4), (3, 5), (4, 6)]);
    }
}

#[test]
fn test_dead_member_breaks_collective() {
    let (mut leader, handles) = form_group(34400, 2, |_, group| drop(group));
    for handle in handles {
        handle.join().unwrap();
    }

    let err = reconcile_cache_config(&mut leader, planned(10, 10)).unwrap_err();
    assert!(matches!(err, AgentError::Group(_)));
}

#[test]
fn test_reconcile_keeps_rank0_geometry() {
    let mut rank0 = planned(50, 5);
    rank0.window_size = Some(128);

    let (mut leader, handles) = form_group(34500, 2, |_, mut group| {
        reconcile_cache_config(&mut group, planned(40, 8)).unwrap()
    });
    let unified = reconcile_cache_config(&mut leader, rank0).unwrap();
    assert_eq!(unified.window_size, Some(128));
    assert_eq!((unified.num_gpu_blocks, unified.num_cpu_blocks), (40, 5));
    assert_eq!(handles.into_iter().next().unwrap().join().unwrap(), unified);
}
