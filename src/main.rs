//! keyferry - batched, resumable key-space transfer for Redis-protocol stores
//!
//! Provides commands to run, inspect, and reset copy/reshard jobs, plus a
//! small helper that renders plain-text commands as wire protocol for mass
//! insertion.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::process::ExitCode;

use anyhow::{anyhow, bail, Context};
use bytes::BytesMut;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;

use keyferry::config::{DIRECT_PREFIX, SHARD_PREFIX};
use keyferry::endpoint::parse_node_spec;
use keyferry::orchestrator::SourceOutcome;
use keyferry::protocol::encode_command;
use keyferry::{
    Address, JobConfig, PlacementSpec, TransferOrchestrator, DEFAULT_BATCH_SIZE,
    DEFAULT_PARALLELISM,
};

/// keyferry - copy or reshard live key spaces in resumable batches
#[derive(Parser, Debug)]
#[command(name = "keyferry")]
#[command(author, version, about = "Batched, resumable key-space transfer")]
struct CliArgs {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Transfer one batch per source (repeat to make progress)
    Run {
        #[command(flatten)]
        job: JobArgs,

        /// Keep running batches until every source is complete
        #[arg(long)]
        until_complete: bool,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show snapshot and checkpoint positions without transferring
    Status {
        #[command(flatten)]
        job: JobArgs,

        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete all persisted job state (lock, flags, snapshots, checkpoints)
    Clean {
        #[command(flatten)]
        job: JobArgs,
    },

    /// Render plain-text commands from stdin as wire protocol on stdout,
    /// suitable for mass insertion via --pipe
    Proto,
}

/// Connection and tuning flags shared by the job subcommands.
#[derive(Args, Debug)]
struct JobArgs {
    /// Source server address(es), host:port, comma-separated
    #[arg(long, value_delimiter = ',', required = true)]
    source: Vec<Address>,

    /// Single target server address (plain copy)
    #[arg(long, conflicts_with = "nodes")]
    target: Option<Address>,

    /// Sharded target nodes, node_<i>#host:port, comma-separated
    #[arg(long, value_delimiter = ',')]
    nodes: Vec<String>,

    /// Database indices to transfer, comma-separated
    #[arg(long, value_delimiter = ',', default_value = "0")]
    databases: Vec<u32>,

    /// Keys transferred per source per batch
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: u64,

    /// Concurrent transfer workers within a batch
    #[arg(long, default_value_t = DEFAULT_PARALLELISM)]
    workers: usize,

    /// Override the reserved-key prefix namespacing job state
    #[arg(long)]
    prefix: Option<String>,

    /// Skip the one-time destructive flush of target databases
    #[arg(long)]
    no_flush: bool,

    /// Leave the final snapshot entry untransferred (legacy boundary rule)
    #[arg(long)]
    reserve_final_key: bool,
}

impl JobArgs {
    fn into_config(self) -> anyhow::Result<JobConfig> {
        let placement = if let Some(target) = self.target {
            PlacementSpec::Direct(target)
        } else if !self.nodes.is_empty() {
            let mut map = BTreeMap::new();
            for spec in &self.nodes {
                let (number, addr) =
                    parse_node_spec(spec).with_context(|| format!("bad node spec {:?}", spec))?;
                if map.insert(number, addr).is_some() {
                    bail!("duplicate target node node_{}", number);
                }
            }
            PlacementSpec::Sharded(map)
        } else {
            bail!("either --target or --nodes is required");
        };

        let prefix = self.prefix.unwrap_or_else(|| match &placement {
            PlacementSpec::Direct(_) => DIRECT_PREFIX.to_string(),
            PlacementSpec::Sharded(_) => SHARD_PREFIX.to_string(),
        });

        Ok(JobConfig {
            sources: self.source,
            placement,
            databases: self.databases,
            batch_size: self.batch_size,
            parallelism: self.workers,
            prefix,
            reserve_final_key: self.reserve_final_key,
            flush_on_first_run: !self.no_flush,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: CliArgs) -> anyhow::Result<()> {
    match args.command {
        Commands::Run {
            job,
            until_complete,
            json,
        } => cmd_run(job.into_config()?, until_complete, json).await,
        Commands::Status { job, json } => cmd_status(job.into_config()?, json).await,
        Commands::Clean { job } => cmd_clean(job.into_config()?).await,
        Commands::Proto => cmd_proto(),
    }
}

// ── Run ──────────────────────────────────────────────────────────────

async fn cmd_run(config: JobConfig, until_complete: bool, json: bool) -> anyhow::Result<()> {
    let orchestrator = TransferOrchestrator::new(config)?;

    loop {
        let report = orchestrator.run().await?;

        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_report(&report);
        }

        if report.has_failures() {
            return Err(anyhow!("one or more sources failed; rerun to retry"));
        }
        if report.is_complete() {
            if !json {
                println!("{} all sources complete", "✓".green().bold());
            }
            return Ok(());
        }
        if !until_complete {
            if !json {
                println!(
                    "{} more batches remain; rerun or pass --until-complete",
                    "→".cyan().bold()
                );
            }
            return Ok(());
        }
    }
}

fn print_report(report: &keyferry::RunReport) {
    println!("{}", "Run Report".bold().underline());
    for (source, outcome) in &report.sources {
        match outcome {
            SourceOutcome::AlreadyComplete { eligible } => {
                println!(
                    "  {} {:25} complete ({} keys)",
                    "✓".green(),
                    source.yellow(),
                    eligible
                );
            }
            SourceOutcome::Transferred { from, to, eligible } => {
                println!(
                    "  {} {:25} {} → {} of {}",
                    "→".cyan(),
                    source.yellow(),
                    from,
                    to,
                    eligible
                );
            }
            SourceOutcome::Failed { error } => {
                println!("  {} {:25} {}", "✗".red(), source.yellow(), error.red());
            }
        }
    }

    let p = &report.progress;
    println!(
        "  copied {} keys ({} skipped, {} bytes) in {:.1}s ({:.0} keys/s)",
        p.keys_copied, p.keys_skipped, p.bytes_copied, p.elapsed_secs, p.keys_per_sec
    );
    for (target, count) in &p.per_target {
        println!("    {:21} {} keys", target.to_string().dimmed(), count);
    }
}

// ── Status ───────────────────────────────────────────────────────────

async fn cmd_status(config: JobConfig, json: bool) -> anyhow::Result<()> {
    let orchestrator = TransferOrchestrator::new(config)?;
    let status = orchestrator.status().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("{}", "Job Status".bold().underline());
    println!(
        "  Locked:      {}",
        if status.locked {
            "yes".red().to_string()
        } else {
            "no".green().to_string()
        }
    );
    println!(
        "  First flush: {}",
        if status.first_run_done { "done" } else { "pending" }
    );
    for s in &status.sources {
        let state = if !s.snapshot_complete {
            "no snapshot".dimmed().to_string()
        } else if s.checkpoint >= s.eligible {
            "complete".green().to_string()
        } else {
            format!("{}/{}", s.checkpoint, s.eligible).cyan().to_string()
        };
        println!(
            "  {:25} {} ({} keys in db)",
            s.source.yellow(),
            state,
            s.db_keys
        );
    }
    Ok(())
}

// ── Clean ────────────────────────────────────────────────────────────

async fn cmd_clean(config: JobConfig) -> anyhow::Result<()> {
    let orchestrator = TransferOrchestrator::new(config)?;
    orchestrator.clean().await?;
    println!("{} job state removed", "✓".green().bold());
    Ok(())
}

// ── Proto ────────────────────────────────────────────────────────────

/// Encode whitespace-separated commands, one per line, as wire frames.
/// Blank lines are skipped. `keyferry proto < data.txt | redis-cli --pipe`
fn cmd_proto() -> anyhow::Result<()> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut buf = BytesMut::new();

    for line in stdin.lock().lines() {
        let line = line.context("reading stdin")?;
        let args: Vec<&str> = line.split_whitespace().collect();
        if args.is_empty() {
            continue;
        }
        buf.clear();
        encode_command(&args, &mut buf);
        out.write_all(&buf).context("writing stdout")?;
    }
    out.flush().context("flushing stdout")?;
    Ok(())
}
