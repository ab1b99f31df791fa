// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use scx_stats::prelude::*;

use fairland::agent::AgentManager;
use fairland::dispatch::{self, DispatchOpts, WaitType};
use fairland::enclave::Enclave;
use fairland::scheduler::Scheduler;
use fairland::sim::{SimEnclave, TaskProfile};
use fairland::stats;
use fairland::task::Gtid;

/// fairland: a user-space CFS-style scheduling agent.
///
/// The engine keeps one pinned agent thread per CPU. Each agent drains
/// task lifecycle messages from its per-CPU channel, maintains a run
/// queue ordered by virtual runtime, and commits run decisions through
/// transactional run-requests that fail cleanly when the agent's view
/// went stale.
///
/// `sched` drives the engine against a deterministic in-process enclave
/// so the scheduling behavior can be observed on any machine. `bench`
/// runs the dispatch orchestrator: a load generator feeding request
/// batches to a pool of workers with an idle/runnable handshake over a
/// shared priority table or per-worker futexes.
#[derive(Debug, Parser)]
#[command(name = "fairland", version)]
struct Opts {
    #[command(subcommand)]
    command: Cmd,

    /// Enable verbose output.
    #[clap(short = 'v', long, action = clap::ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Run the scheduling engine on a simulated enclave.
    Sched(SchedArgs),
    /// Run the dispatch orchestrator benchmark.
    Bench(BenchArgs),
}

#[derive(Debug, Parser)]
struct SchedArgs {
    /// Number of CPUs in the enclave.
    #[clap(long, default_value = "4")]
    nr_cpus: usize,

    /// Minimum on-cpu quantum before preemption is considered, in
    /// microseconds.
    #[clap(long, default_value = "1000")]
    min_granularity_us: u64,

    /// Target scheduling latency across all runnable tasks on a CPU, in
    /// microseconds.
    #[clap(long, default_value = "6000")]
    latency_us: u64,

    /// Number of workload tasks to spawn.
    #[clap(long, default_value = "16")]
    tasks: usize,

    /// Total on-cpu time of each workload task, in milliseconds.
    #[clap(long, default_value = "50")]
    task_runtime_ms: u64,

    /// On-cpu time a task accrues per commit, in microseconds.
    #[clap(long, default_value = "500")]
    slice_us: u64,

    /// Make workload tasks yield every N slices.
    #[clap(long)]
    yield_period: Option<u32>,

    /// Enable stats monitoring with the specified interval in seconds.
    #[clap(long)]
    stats: Option<f64>,

    /// Run in stats monitoring mode with the specified interval.
    /// Scheduler is not launched.
    #[clap(long)]
    monitor: Option<f64>,
}

#[derive(Debug, Parser)]
struct BenchArgs {
    /// Worker thread count.
    #[clap(long, default_value = "4")]
    num_workers: usize,

    /// Max requests per assignment.
    #[clap(long, default_value = "8")]
    batch: usize,

    /// CPU the load generator is affined to.
    #[clap(long, default_value = "0")]
    load_generator_cpu: usize,

    /// How workers wait for work.
    #[clap(long, value_enum, default_value = "prio-table")]
    wait_type: WaitType,

    /// QoS value written to the work class.
    #[clap(long, default_value = "2")]
    qos: u32,

    /// Total requests to push through the pool.
    #[clap(long, default_value = "10000")]
    requests: u64,

    /// Synthetic work per request, in microseconds.
    #[clap(long, default_value = "20")]
    request_work_us: u64,
}

fn run_sched(args: &SchedArgs) -> Result<()> {
    if let Some(intv) = args.monitor.or(args.stats) {
        let jh = thread::spawn(move || stats::monitor(Duration::from_secs_f64(intv)).unwrap());
        if args.monitor.is_some() {
            let _ = jh.join();
            return Ok(());
        }
    }

    let sim = SimEnclave::new_blocking(args.nr_cpus);
    let enclave: Arc<dyn Enclave> = Arc::new(sim.clone());

    let scheduler = Arc::new(Scheduler::new(
        enclave.clone(),
        (0..args.nr_cpus).collect(),
        args.min_granularity_us * 1_000,
        args.latency_us * 1_000,
    ));

    let stats_server = match args.stats {
        Some(_) => Some(StatsServer::new(stats::server_data()).launch()?),
        None => None,
    };
    let stats_channels = stats_server.as_ref().map(|server| server.channels());

    let agents = AgentManager::start(scheduler.clone(), enclave);

    info!(
        "spawning {} task(s), {}ms runtime each",
        args.tasks, args.task_runtime_ms
    );
    for id in 0..args.tasks as u64 {
        sim.spawn_task(
            Gtid(id + 1),
            TaskProfile {
                total_runtime_ns: args.task_runtime_ms * 1_000_000,
                slice_ns: args.slice_us * 1_000,
                yield_period: args.yield_period,
            },
        );
    }

    while sim.tasks_remaining() > 0 {
        if let Some((res_ch, req_ch)) = &stats_channels {
            if req_ch.try_recv().is_ok() {
                res_ch.send(scheduler.metrics())?;
            }
        }
        thread::sleep(Duration::from_millis(1));
    }

    sim.finish();
    agents.join()?;

    let metrics = scheduler.metrics();
    info!(
        "clean drain: {} commits ({} stale), {} preemptions, {} migrations",
        metrics.nr_commits,
        metrics.nr_commit_failures,
        metrics.nr_preemptions,
        metrics.nr_migrations
    );

    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let loglevel = if opts.verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    match &opts.command {
        Cmd::Sched(args) => run_sched(args),
        Cmd::Bench(args) => dispatch::run_bench(
            DispatchOpts {
                num_workers: args.num_workers,
                batch: args.batch,
                load_generator_cpu: args.load_generator_cpu,
                wait_type: args.wait_type,
                qos: args.qos,
            },
            args.requests,
            args.request_work_us * 1_000,
        ),
    }
}
