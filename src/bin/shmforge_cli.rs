use std::path::PathBuf;
use std::process::{Command, ExitCode};
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use shmforge::logging::{self, LogLevel, LoggingConfig};
use shmforge::shm::{inspect, segment_path};
use shmforge::{
    init_shm_manager_with_config, join_shm_manager, release_shm_manager, shm_all_gather,
    shm_allreduce, shm_barrier, shm_gather, shm_recv_tensor_list, shm_send_tensor_list,
    shm_stats, DType, HostTensor, ShmConfig, StatsSnapshot,
};

#[derive(Parser, Debug)]
#[command(name = "shmforge-cli", version)]
#[command(about = "Run, launch and inspect shared-memory collective groups", long_about = None)]
struct Cli {
    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one rank of a self-checking collective workload
    Run {
        /// Rank of this process
        #[arg(long)]
        rank: i64,
        #[command(flatten)]
        group: GroupArgs,
    },
    /// Spawn every rank of a group as a child process and wait for them
    Launch {
        #[command(flatten)]
        group: GroupArgs,
    },
    /// Print the header of an existing segment as JSON
    Inspect {
        /// Segment name
        #[arg(long, conflicts_with = "path")]
        name: Option<String>,
        /// Segment file path
        #[arg(long)]
        path: Option<PathBuf>,
        /// Directory holding segment files
        #[arg(long)]
        segment_dir: Option<PathBuf>,
    },
}

#[derive(Args, Debug, Clone)]
struct GroupArgs {
    /// Segment name shared by all ranks
    #[arg(long)]
    name: Option<String>,
    /// Number of ranks
    #[arg(long)]
    group_size: i64,
    /// Directory holding segment files (defaults to SHMFORGE_SEGMENT_DIR or /dev/shm)
    #[arg(long)]
    segment_dir: Option<PathBuf>,
    /// Per-rank collective slot size in bytes
    #[arg(long)]
    slot_bytes: Option<usize>,
    /// Per-channel point-to-point buffer size in bytes
    #[arg(long)]
    p2p_bytes: Option<usize>,
    /// Fail a collective that waits longer than this for a peer
    #[arg(long)]
    wait_timeout_ms: Option<u64>,
    /// Elements per rank in each collective
    #[arg(long, default_value_t = 4096)]
    elements: usize,
    /// Workload iterations
    #[arg(long, default_value_t = 10)]
    iterations: usize,
}

impl GroupArgs {
    fn config(&self) -> anyhow::Result<ShmConfig> {
        let mut config = ShmConfig::from_env().context("reading SHMFORGE_* environment")?;
        if let Some(dir) = &self.segment_dir {
            config = config.with_segment_dir(dir);
        }
        if let Some(bytes) = self.slot_bytes {
            config = config.with_slot_bytes(bytes);
        }
        if let Some(bytes) = self.p2p_bytes {
            config = config.with_p2p_bytes(bytes);
        }
        if let Some(ms) = self.wait_timeout_ms {
            config = config.with_wait_timeout(Some(Duration::from_millis(ms)));
        }
        config.validate()?;
        Ok(config)
    }

    fn to_args(&self, name: &str) -> Vec<String> {
        let mut args = vec![
            "--name".to_string(),
            name.to_string(),
            "--group-size".to_string(),
            self.group_size.to_string(),
            "--elements".to_string(),
            self.elements.to_string(),
            "--iterations".to_string(),
            self.iterations.to_string(),
        ];
        if let Some(dir) = &self.segment_dir {
            args.push("--segment-dir".to_string());
            args.push(dir.display().to_string());
        }
        if let Some(bytes) = self.slot_bytes {
            args.push("--slot-bytes".to_string());
            args.push(bytes.to_string());
        }
        if let Some(bytes) = self.p2p_bytes {
            args.push("--p2p-bytes".to_string());
            args.push(bytes.to_string());
        }
        if let Some(ms) = self.wait_timeout_ms {
            args.push("--wait-timeout-ms".to_string());
            args.push(ms.to_string());
        }
        args
    }
}

/// One line of JSON printed by each rank when its workload finishes
#[derive(Debug, Serialize)]
struct RankReport {
    name: String,
    rank: i64,
    group_size: i64,
    iterations: usize,
    elements: usize,
    elapsed_ms: u128,
    ok: bool,
    stats: StatsSnapshot,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut log_config = LoggingConfig::from_env();
    if let Some(level) = cli.log_level.as_deref() {
        match LogLevel::parse(level) {
            Some(level) => log_config = log_config.with_level(level),
            None => {
                eprintln!("unknown log level {:?}", level);
                return ExitCode::from(2);
            }
        }
    }
    if let Err(e) = logging::init_with_config(&log_config) {
        eprintln!("WARN: logging disabled: {}", e);
    }

    let result = match cli.command {
        Commands::Run { rank, group } => run_rank(rank, &group),
        Commands::Launch { group } => launch(&group),
        Commands::Inspect {
            name,
            path,
            segment_dir,
        } => inspect_segment(name, path, segment_dir),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_rank(rank: i64, group: &GroupArgs) -> anyhow::Result<()> {
    let name = group
        .name
        .clone()
        .context("--name is required for `run`")?;
    let config = group.config()?;
    let g = group.group_size;
    let n = group.elements;

    let handle = init_shm_manager_with_config(&name, g, rank, config)
        .with_context(|| format!("initializing rank {} of {:?}", rank, name))?;
    let result = run_workload(handle, &name, rank, g, n, group.iterations);
    let stats = shm_stats(handle)?;
    release_shm_manager(handle)?;
    let elapsed = result?;

    let report = RankReport {
        name,
        rank,
        group_size: g,
        iterations: group.iterations,
        elements: n,
        elapsed_ms: elapsed.as_millis(),
        ok: true,
        stats,
    };
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

fn run_workload(
    handle: i64,
    name: &str,
    rank: i64,
    g: i64,
    n: usize,
    iterations: usize,
) -> anyhow::Result<Duration> {
    join_shm_manager(handle, name).context("joining group")?;
    let start = Instant::now();
    let gu = g as usize;

    for iter in 0..iterations {
        // allreduce: rank r contributes (r + 1) * v, so the sum is v * g(g+1)/2
        let base: Vec<f32> = (0..n).map(|i| ((i + iter) % 97) as f32).collect();
        let mine: Vec<f32> = base.iter().map(|v| v * (rank + 1) as f32).collect();
        let mut data = HostTensor::from_1d(&mine);
        shm_allreduce(handle, &mut data).context("allreduce")?;
        let factor = (g * (g + 1) / 2) as f32;
        for (i, (got, v)) in data.as_slice::<f32>()?.iter().zip(&base).enumerate() {
            ensure!(
                *got == v * factor,
                "allreduce mismatch at iteration {} index {}: {} != {}",
                iter,
                i,
                got,
                v * factor
            );
        }

        // all_gather: every rank's block is tagged with its rank
        let block: Vec<i32> = (0..n).map(|i| rank as i32 * 1_000_000 + i as i32).collect();
        let mut gathered = HostTensor::zeros(DType::I32, &[n * gu]);
        shm_all_gather(handle, &HostTensor::from_1d(&block), &mut gathered).context("all_gather")?;
        let values = gathered.as_slice::<i32>()?;
        let probes = if n == 0 { vec![] } else { vec![0, n / 2, n - 1] };
        for r in 0..gu {
            for &i in &probes {
                let want = r as i32 * 1_000_000 + i as i32;
                ensure!(
                    values[r * n + i] == want,
                    "all_gather mismatch: rank {} index {}",
                    r,
                    i
                );
            }
        }

        // gather to a rotating destination
        let dst = (iter % gu) as i64;
        let payload = HostTensor::from_1d(&vec![rank as i64 + iter as i64; n]);
        if rank == dst {
            let mut outs: Vec<HostTensor> = (0..gu).map(|_| HostTensor::zeros(DType::I64, &[n])).collect();
            shm_gather(handle, &payload, Some(outs.as_mut_slice()), dst).context("gather")?;
            for (r, out) in outs.iter().enumerate() {
                ensure!(
                    out.as_slice::<i64>()?.iter().all(|&v| v == r as i64 + iter as i64),
                    "gather mismatch from rank {}",
                    r
                );
            }
        } else {
            shm_gather(handle, &payload, None, dst).context("gather")?;
        }

        // ring exchange; even ranks send first so the ring cannot stall
        if g > 1 {
            let next = (rank + 1) % g;
            let prev = (rank + g - 1) % g;
            let outgoing = vec![
                HostTensor::from_1d(&[rank as i32, iter as i32]),
                HostTensor::from_1d(&vec![rank as f32; n]),
            ];
            let incoming = if rank % 2 == 0 {
                shm_send_tensor_list(handle, &outgoing, next).context("send")?;
                shm_recv_tensor_list(handle, prev).context("recv")?
            } else {
                let got = shm_recv_tensor_list(handle, prev).context("recv")?;
                shm_send_tensor_list(handle, &outgoing, next).context("send")?;
                got
            };
            ensure!(incoming.len() == 2, "expected 2 tensors, got {}", incoming.len());
            ensure!(
                incoming[0].to_vec::<i32>()? == vec![prev as i32, iter as i32],
                "ring message from rank {} out of order",
                prev
            );
        }

        shm_barrier(handle).context("barrier")?;
        tracing::debug!("Rank {} finished iteration {}", rank, iter);
    }

    Ok(start.elapsed())
}

fn launch(group: &GroupArgs) -> anyhow::Result<()> {
    let name = group
        .name
        .clone()
        .unwrap_or_else(|| format!("launch-{}", std::process::id()));
    if group.group_size < 1 {
        bail!("--group-size must be at least 1");
    }
    // Fail fast on bad sizes before spawning anything
    group.config()?;

    let exe = std::env::current_exe().context("locating own executable")?;
    let mut children = Vec::new();
    for rank in 0..group.group_size {
        let child = Command::new(&exe)
            .arg("run")
            .arg("--rank")
            .arg(rank.to_string())
            .args(group.to_args(&name))
            .spawn()
            .with_context(|| format!("spawning rank {}", rank))?;
        tracing::info!("Spawned rank {} as pid {}", rank, child.id());
        children.push((rank, child));
    }

    let mut failed = Vec::new();
    for (rank, mut child) in children {
        let status = child
            .wait()
            .with_context(|| format!("waiting for rank {}", rank))?;
        if !status.success() {
            tracing::error!("Rank {} exited with {}", rank, status);
            failed.push(rank);
        }
    }

    if !failed.is_empty() {
        bail!("ranks {:?} of {:?} failed", failed, name);
    }
    tracing::info!("All {} ranks of {:?} completed", group.group_size, name);
    Ok(())
}

fn inspect_segment(
    name: Option<String>,
    path: Option<PathBuf>,
    segment_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let path = match (name, path) {
        (_, Some(path)) => path,
        (Some(name), None) => {
            let dir = match segment_dir {
                Some(dir) => dir,
                None => ShmConfig::from_env()?.segment_dir,
            };
            segment_path(&dir, &name)
        }
        (None, None) => bail!("pass --name or --path"),
    };

    let info = inspect(&path).with_context(|| format!("inspecting {}", path.display()))?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}
