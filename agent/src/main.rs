//! Tensor-parallel model agent - Command Line Interface
//!
//! ## Commands
//! - `run` - Build the agent described by a config file and drive demo steps
//! - `plan` - Print the KV cache budget a device would get
//! - `worker` - Subordinate rank entry point (spawned by `run`, not for direct use)

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tp_agent::agent::run_worker_process;
use tp_agent::cache::cache_block_size;
use tp_agent::{
    build_model_agent, format_bytes, init_production_logging, init_simple_logging, AgentConfig,
    HostCacheEngine, MemoryPlanner, ModelAgent, ModelInputs, ReferenceFactory, StepInput,
    SwapMap,
};
use tracing::info;

/// Tensor-parallel model agent
#[derive(Parser, Debug)]
#[command(name = "tp-agent")]
#[command(about = "Tensor-parallel model agent", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the agent and run a prefill followed by decode steps
    Run {
        /// Agent config (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Number of forward steps (the first one is the prefill)
        #[arg(short, long, default_value = "4")]
        steps: usize,

        /// Prompt length in tokens
        #[arg(long, default_value = "8")]
        prompt_len: usize,

        /// Log directory (defaults to ~/.tp-agent/logs)
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },

    /// Print the KV cache budget planned for one device
    Plan {
        /// Agent config (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Device index to probe
        #[arg(short, long, default_value = "0")]
        device: usize,
    },

    /// Run a subordinate rank; reads its bootstrap from stdin
    #[command(hide = true)]
    Worker,
}

fn main() -> Result<()> {
    match Cli::parse().command {
        // Subordinates are plain blocking processes
        Commands::Worker => std::process::exit(run_worker_process(&ReferenceFactory)),
        command => run(command),
    }
}

#[tokio::main]
async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Run {
            config,
            steps,
            prompt_len,
            log_dir,
        } => {
            let config = load_config(&config)?;
            init_production_logging(&config.log_level, log_dir, "tp-agent.log")?;
            cmd_run(config, steps, prompt_len).await?;
        }

        Commands::Plan { config, device } => {
            let config = load_config(&config)?;
            init_simple_logging("warn")?;
            cmd_plan(&config, device)?;
        }

        Commands::Worker => bail!("the worker command runs outside the async runtime"),
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<AgentConfig> {
    AgentConfig::from_file(path)
        .with_context(|| format!("Failed to load agent config from {}", path.display()))
}

/// Blocks covering the first `tokens` positions, allocated in order.
fn block_table(tokens: usize, block_size: usize) -> Vec<u32> {
    (0..tokens.div_ceil(block_size) as u32).collect()
}

/// Build the agent and drive one sequence through prefill and decode.
async fn cmd_run(config: AgentConfig, steps: usize, prompt_len: usize) -> Result<()> {
    if steps == 0 || prompt_len == 0 {
        bail!("steps and prompt_len must both be positive");
    }

    println!("🚀 Starting tensor-parallel agent (tp={})...\n", config.tp);
    let mut agent = tokio::task::spawn_blocking(move || build_model_agent(&ReferenceFactory, &config))
        .await
        .context("Agent construction panicked")?
        .context("Failed to build model agent")?;

    let cache = agent.cache_config().clone();
    println!("📋 Cache: block_size={}", cache.block_size);
    println!("   GPU blocks: {}", cache.num_gpu_blocks);
    println!("   CPU blocks: {}", cache.num_cpu_blocks);
    println!("   Max prefill tokens: {}\n", cache.max_prefill_token_num);

    let total = prompt_len + steps - 1;
    if total.div_ceil(cache.block_size) > cache.num_gpu_blocks {
        agent.close();
        bail!(
            "{} tokens need more than the {} planned device blocks",
            total,
            cache.num_gpu_blocks
        );
    }

    let vocab = agent.model_config().vocab_size as i64;
    let mut next: Vec<i64> = (1..=prompt_len as i64).map(|t| t % vocab).collect();
    let mut history = 0usize;

    for step in 0..steps {
        let len = next.len();
        let inputs = ModelInputs::new(
            &[next.clone()],
            vec![history],
            vec![block_table(history + len, cache.block_size)],
            step > 0,
        )?;

        let output = agent
            .forward_async(StepInput::new(inputs, SwapMap::new(), SwapMap::new()))
            .await
            .with_context(|| format!("Step {} failed", step))?;
        let logits = agent.get_logits(&output.hidden_states)?;

        let vocab = logits.shape[1];
        let values = logits.to_f32_vec()?;
        let last = &values[values.len() - vocab..];
        let token = last
            .iter()
            .enumerate()
            .fold((0usize, f32::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
            .0 as i64;

        history += len;
        println!(
            "   step {:>3}: {} token(s), history {}, next token {}",
            step, len, history, token
        );
        info!(step, tokens = len, history, token, "Step complete");
        next = vec![token];
    }

    agent.close();
    println!("\n✅ Agent closed");
    Ok(())
}

/// Plan the cache for one device without building anything.
fn cmd_plan(config: &AgentConfig, device: usize) -> Result<()> {
    let planner = MemoryPlanner::new(config.memory_source()?.probe(), config.host_mem_bytes()?);
    let planned = planner.plan::<HostCacheEngine>(&config.model, &config.cache, device, 0, config.tp)?;
    let block_bytes = cache_block_size(
        planned.block_size,
        &config.model,
        config.tp,
        planned.quant_policy,
    );

    println!("📊 KV cache plan for device {} (tp={})", device, config.tp);
    println!("   Block size: {} tokens", planned.block_size);
    println!("   Block bytes: {}", format_bytes(block_bytes as u64));
    println!("   GPU blocks: {}", planned.num_gpu_blocks);
    println!("   CPU blocks: {}", planned.num_cpu_blocks);
    println!("   Max prefill tokens: {}", planned.max_prefill_token_num);
    if let Some(window) = planned.window_size {
        println!("   Window size: {}", window);
    }
    Ok(())
}
