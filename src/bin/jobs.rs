//! jobs CLI: drive job trees from the command line.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{info, warn};

use jobs_rs::config::Config;
use jobs_rs::event;
use jobs_rs::model::DEFAULT_WEIGHT;
use jobs_rs::telemetry::{TelemetryConfig, init_telemetry};
use jobs_rs::{Aggregator, Job, JobFuture, Observer, Outcome, Worker};

#[derive(Parser)]
#[command(name = "jobs", about = "Run cancellable, progress-reporting job trees")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a series of leaf jobs under one aggregator
    Demo(DemoArgs),
    /// Drive an observer from a polling loop
    Observe {
        #[arg(long, default_value_t = 10)]
        steps: u64,
        #[arg(long, default_value_t = 50)]
        delay_ms: u64,
        /// Cancel once this step has been reported
        #[arg(long)]
        cancel_at: Option<u64>,
    },
}

#[derive(Args)]
struct DemoArgs {
    /// Number of leaf jobs (series)
    #[arg(long, default_value_t = 4)]
    series: usize,
    /// Steps per series
    #[arg(long, default_value_t = 10)]
    instances: u64,
    /// Sleep per step, in milliseconds
    #[arg(long, default_value_t = 50)]
    delay_ms: u64,
    /// Make this series fail halfway through
    #[arg(long)]
    fail_series: Option<usize>,
    /// Cancel the whole tree after this many milliseconds
    #[arg(long)]
    cancel_after_ms: Option<u64>,
    /// Print the final snapshot as JSON
    #[arg(long)]
    json: bool,
    /// Stream the aggregator's events as JSON lines
    #[arg(long)]
    events: bool,
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .max_blocking_threads(config.worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let _guard = init_telemetry(TelemetryConfig::from_config(&config))?;
        let worker: Arc<dyn Worker> = Arc::new(tokio::runtime::Handle::current());

        match cli.command {
            Command::Demo(args) => cmd_demo(worker, args, config.event_capacity).await,
            Command::Observe {
                steps,
                delay_ms,
                cancel_at,
            } => cmd_observe(worker, steps, Duration::from_millis(delay_ms), cancel_at).await,
        }
    })
}

async fn cmd_demo(
    worker: Arc<dyn Worker>,
    args: DemoArgs,
    event_capacity: usize,
) -> anyhow::Result<()> {
    let instances = args.instances;
    let delay = Duration::from_millis(args.delay_ms);

    let demo = Aggregator::new("demo");
    if args.events {
        stream_events(&demo, event_capacity);
    }
    for index in 0..args.series {
        let fail = args.fail_series == Some(index);
        let job = Job::with_worker(
            format!("series-{index}"),
            move |job: &Job| {
                job.set_total_work_units(instances);
                for step in 0..instances {
                    if job.cancel_requested() {
                        job.log("canceled");
                        return Ok(());
                    }
                    if fail && step == instances / 2 {
                        anyhow::bail!("series {index} failed at step {step}");
                    }
                    std::thread::sleep(delay);
                    job.done_work(step + 1);
                }
                job.log(format!("loaded {instances} instances"));
                Ok(())
            },
            Arc::clone(&worker),
        );
        demo.add(&job, DEFAULT_WEIGHT)?;
    }

    print_progress(&demo);
    let future = demo.run()?;

    if let Some(after) = args.cancel_after_ms.map(Duration::from_millis) {
        let demo = demo.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            warn!(job = %demo.name(), "canceling");
            demo.cancel();
        });
    }

    let outcome = future.join().await;
    for line in demo.logs() {
        println!("{line}");
    }
    if args.json {
        println!("{}", serde_json::to_string_pretty(&demo.snapshot())?);
    }
    report_outcome(&demo, outcome)
}

async fn cmd_observe(
    worker: Arc<dyn Worker>,
    steps: u64,
    delay: Duration,
    cancel_at: Option<u64>,
) -> anyhow::Result<()> {
    let observer = Observer::with_total_work_units("observe", steps);
    print_progress(&observer);
    if let Some(cancel_at) = cancel_at {
        let marker = step_message(cancel_at);
        observer.add_log_hook(move |job, message| {
            if message == marker {
                job.cancel();
            }
        });
    }

    let future: JobFuture = observer.run()?;

    // The polling loop only sees plain callbacks.
    let report = observer.progress_callback();
    let canceled = observer.cancel_requested_callback();
    let looped = observer.clone();
    worker.execute(Box::new(move || {
        for step in 1..=steps {
            if canceled() {
                return;
            }
            std::thread::sleep(delay);
            report(step);
            looped.log(step_message(step));
        }
        looped.finish();
    }));

    let outcome = future.join().await;
    report_outcome(&observer, outcome)
}

/// Print every event of `job` as one JSON line until the job is dropped.
fn stream_events(job: &Job, capacity: usize) {
    let mut rx = event::subscribe(job, capacity);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, "failed to encode event"),
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn step_message(step: u64) -> String {
    format!("step {step}")
}

/// Print progress whenever the whole percentage changes.
fn print_progress(job: &Job) {
    let last = Arc::new(AtomicU64::new(u64::MAX));
    job.add_done_work_hook(move |job, _| {
        let percent = (job.progress() * 100.0).round() as u64;
        if last.swap(percent, Ordering::Relaxed) != percent {
            eprintln!("{}: {percent:>3}%", job.name());
        }
    });
}

fn report_outcome(job: &Job, outcome: Outcome) -> anyhow::Result<()> {
    let (done, total) = job.work_units();
    info!(job = %job.name(), state = %job.state(), done, total, "job settled");
    println!("{}: {} ({done}/{total})", job.name(), job.state());
    outcome.map_err(anyhow::Error::from)
}
