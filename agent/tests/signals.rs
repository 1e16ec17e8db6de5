//! SIGTERM handling of a running `tp-agent run` coordinator
//!
//! The coordinator must kill every subordinate, then die from the signal
//! itself rather than exiting normally.

#![cfg(target_os = "linux")]

use std::io::{BufRead, BufReader};
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Stdio};
use std::time::Duration;

const BIN: &str = env!("CARGO_BIN_EXE_tp-agent");

const CONFIG: &str = r#"
model_path = "/models/reference"
tp = 2
log_level = "warn"
host_mem_size = "1MiB"
watchdog_interval_ms = 50
group_timeout_secs = 30

[model]
hidden_size = 4
num_layers = 2
num_attention_heads = 2
num_key_value_heads = 2
k_head_dim = 8
v_head_dim = 8
vocab_size = 8
dtype = "f16"

[cache]
block_size = 16
num_gpu_blocks = 70000
num_cpu_blocks = 8

[memory]
kind = "fixed"
devices = ["1GiB", "1GiB"]
"#;

/// Fields of `/proc/<pid>/stat` after the command name.
fn stat_fields(pid: u32) -> Option<Vec<String>> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let rest = stat.get(stat.rfind(')')? + 1..)?;
    Some(rest.split_whitespace().map(str::to_string).collect())
}

fn children_of(parent: u32) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| {
            let pid: u32 = entry.ok()?.file_name().to_str()?.parse().ok()?;
            let ppid: u32 = stat_fields(pid)?.get(1)?.parse().ok()?;
            (ppid == parent).then_some(pid)
        })
        .collect()
}

/// Gone or a zombie waiting to be reaped.
fn is_dead(pid: u32) -> bool {
    match stat_fields(pid) {
        None => true,
        Some(fields) => matches!(fields.first().map(String::as_str), Some("Z") | Some("X")),
    }
}

fn wait_until_dead(pid: u32) -> bool {
    for _ in 0..200 {
        if is_dead(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    false
}

#[test]
fn test_sigterm_kills_workers_and_coordinator() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("agent.toml");
    std::fs::write(&config_path, CONFIG).unwrap();

    let mut child = Command::new(BIN)
        .arg("run")
        .arg("--config")
        .arg(&config_path)
        .arg("--steps")
        .arg("1000000")
        .arg("--log-dir")
        .arg(dir.path().join("logs"))
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    // the first step line means the fleet is up and every worker is tracked
    let stdout = child.stdout.take().unwrap();
    let mut lines = BufReader::new(stdout).lines();
    let started = lines
        .by_ref()
        .map_while(|line| line.ok())
        .any(|line| line.trim_start().starts_with("step"));
    assert!(started, "coordinator never completed a step");

    let workers = children_of(child.id());
    assert_eq!(workers.len(), 1, "expected one subordinate, found {:?}", workers);

    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }

    let status = child.wait().unwrap();
    assert_eq!(status.signal(), Some(libc::SIGTERM), "coordinator status: {:?}", status);
    for pid in workers {
        assert!(wait_until_dead(pid), "worker {} survived SIGTERM", pid);
    }
    drop(lines);
}
