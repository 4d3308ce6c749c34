use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use engine_core::{EngineError, JobId, ScanStatus};
use scan_scheduler::{Engine, JobEvent, SubmitOptions};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::{debug, info, warn};

#[cfg(feature = "archive")]
mod archive;
mod config;
mod report;

use report::Report;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat { Text, Json, Jsonl }

#[derive(Debug, Parser)]
#[command(name = "scantool", version, about = "Run external security tools as managed scan jobs")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./scantool.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Write logs to stderr as JSON lines
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,
    /// SQLite archive for finished scans (overrides archive.path from config)
    #[cfg(feature = "archive")]
    #[arg(long, global = true, value_name = "FILE")]
    archive: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// List the capabilities this build can run
    Capabilities {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Run one capability against one target and wait for the result (Ctrl-C cancels)
    Scan {
        /// Capability name, e.g. dns-lookup or port-scan
        capability: String,
        /// Target host, domain, CIDR, URL or package, depending on the capability
        target: String,
        /// Owner the job is accounted to
        #[arg(long, default_value = "cli")]
        owner: String,
        /// Timeout in seconds (default: the tool's own timeout)
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Output format: text, json, or jsonl
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
        /// Output file (overwrites)
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
        /// Write CSV (one row per finding) when --out is provided
        #[arg(long, default_value_t = false)]
        csv: bool,
    },
    /// Run one capability against many targets; results stream as jobs finish
    Batch {
        capability: String,
        /// File with newline-delimited targets (comments with # and blanks ignored)
        #[arg(long, value_name = "FILE")]
        targets: PathBuf,
        #[arg(long, default_value = "cli")]
        owner: String,
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Scans running at once (overrides engine.global_max_concurrent and the per-owner limit)
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Jsonl)]
        format: OutputFormat,
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        csv: bool,
    },
    /// Show archived scans, or the findings of one archived scan
    #[cfg(feature = "archive")]
    History {
        #[arg(long)]
        owner: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Print the findings recorded for this job id
        #[arg(long)]
        job: Option<String>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

fn read_targets(file: &Path) -> Result<Vec<String>> {
    let br = BufReader::new(File::open(file)?);
    let mut targets = Vec::new();
    for line in br.lines() {
        let line = line?;
        let t = line.trim();
        if t.is_empty() || t.starts_with('#') { continue; }
        targets.push(t.to_string());
    }
    Ok(targets)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    config::init_tracing(cli.log_json);
    let loaded_cfg = config::load_config(cli.config.as_deref())?;
    let mut cfg = loaded_cfg.unwrap_or_default();
    #[cfg(feature = "archive")]
    let archive_path = cli.archive.clone().or_else(|| cfg.archive.path.clone());
    #[cfg(not(feature = "archive"))]
    let archive_path: Option<PathBuf> = None;

    match cli.command {
        Commands::Version => {
            println!("scantool {} (core {})", env!("CARGO_PKG_VERSION"), engine_core::version());
        }
        Commands::Capabilities { format } => {
            let reg = cfg.registry()?;
            for spec in reg.capabilities() {
                match format {
                    OutputFormat::Text => println!(
                        "{:<16} {:<12} {:>5}s  {}",
                        spec.capability,
                        spec.executable,
                        spec.timeout_secs,
                        spec.description
                    ),
                    OutputFormat::Json | OutputFormat::Jsonl => {
                        let obj = serde_json::json!({
                            "capability": spec.capability,
                            "executable": spec.executable,
                            "target": spec.target,
                            "output_format": spec.output_format,
                            "timeout_secs": spec.timeout_secs,
                            "max_output_bytes": spec.max_output_bytes,
                            "description": spec.description,
                        });
                        println!("{}", serde_json::to_string(&obj)?);
                    }
                }
            }
        }
        Commands::Scan { capability, target, owner, timeout_secs, format, out, csv } => {
            let mut report = Report::new(format, out.as_deref(), csv)?;
            let opts = SubmitOptions { timeout: timeout_secs.map(Duration::from_secs) };
            let rt = tokio::runtime::Runtime::new()?;
            let (job, writer) = rt.block_on(async {
                let (engine, writer) = start(&cfg, archive_path.as_deref(), &owner)?;
                let res = scan_one(&engine, &capability, &target, &owner, opts).await;
                engine.shutdown().await;
                drop(engine);
                Ok::<_, anyhow::Error>((res?, writer))
            })?;
            drop(rt);
            report.job(&job)?;
            finish_writer(writer);
            if job.status() == Some(ScanStatus::Failed) {
                std::process::exit(1);
            }
        }
        Commands::Batch { capability, targets, owner, timeout_secs, concurrency, format, out, csv } => {
            if let Some(n) = concurrency {
                if n == 0 { return Err(anyhow!("--concurrency must be > 0")); }
                cfg.engine.global_max_concurrent = n;
                cfg.engine.per_owner_max_concurrent = n;
            }
            let targets_vec = read_targets(&targets)?;
            let mut report = Report::new(format, out.as_deref(), csv)?;
            let opts = SubmitOptions { timeout: timeout_secs.map(Duration::from_secs) };

            // Writer thread serializes output while jobs finish in any order
            let (tx, rx) = mpsc::unbounded_channel::<Line>();
            let writer_handle = std::thread::spawn(move || -> Result<()> {
                let mut rx = rx;
                while let Some(line) = rx.blocking_recv() {
                    match line {
                        Line::Job(job) => report.job(&job)?,
                        Line::Rejected { capability, target, error } => report.rejected(&capability, &target, &error)?,
                    }
                }
                Ok(())
            });

            let rt = tokio::runtime::Runtime::new()?;
            let archive_writer = rt.block_on(async {
                let (engine, writer) = start(&cfg, archive_path.as_deref(), &owner)?;
                let res = run_batch(&engine, &capability, targets_vec, &owner, opts, tx).await;
                engine.shutdown().await;
                drop(engine);
                res?;
                Ok::<_, anyhow::Error>(writer)
            })?;
            drop(rt);
            writer_handle.join().map_err(|_| anyhow!("output writer panicked"))??;
            finish_writer(archive_writer);
        }
        #[cfg(feature = "archive")]
        Commands::History { owner, limit, job, format } => {
            let path = archive_path.ok_or_else(|| anyhow!("no archive configured; pass --archive <FILE> or set archive.path"))?;
            let db = scan_sqlite::Db::open_or_create(&path)?;
            if let Some(id) = job {
                let job_id: JobId = id.parse().map_err(|_| anyhow!("invalid job id: {}", id))?;
                let findings = db.findings_for(&job_id)?;
                for f in findings {
                    match format {
                        OutputFormat::Text => println!("[{}] {} :: {}", f.severity, f.title, f.evidence),
                        OutputFormat::Json | OutputFormat::Jsonl => println!("{}", serde_json::to_string(&f)?),
                    }
                }
                return Ok(());
            }
            for s in db.recent_scans(owner.as_deref(), limit)? {
                match format {
                    OutputFormat::Text => println!(
                        "{} {} {} {} {} {} findings{}",
                        report::rfc3339_ms(s.finished_at_ms),
                        s.job_id,
                        s.capability,
                        s.target,
                        s.state,
                        s.finding_count,
                        s.error_message.as_deref().map(|m| format!(" ({})", m)).unwrap_or_default(),
                    ),
                    OutputFormat::Json | OutputFormat::Jsonl => println!("{}", serde_json::to_string(&s)?),
                }
            }
        }
    }
    Ok(())
}

enum Line {
    Job(engine_core::ScanJob),
    Rejected { capability: String, target: String, error: String },
}

type ArchiveWriter = Option<std::thread::JoinHandle<usize>>;

/// Builds the engine inside the runtime and attaches the archive writer.
/// Only `owner` submits through this engine, so its job list covers any
/// events the writer misses.
fn start(cfg: &config::Config, archive_path: Option<&Path>, owner: &str) -> Result<(Engine, ArchiveWriter)> {
    let engine = Engine::with_process_runner(cfg.registry()?, cfg.engine.clone())?;
    #[cfg(feature = "archive")]
    if let Some(path) = archive_path {
        let db = scan_sqlite::Db::open_or_create(path)?;
        let view = engine.view();
        let owner = owner.to_string();
        let writer = archive::spawn_writer(db, engine.subscribe(), move || view.list(&owner));
        return Ok((engine, Some(writer)));
    }
    let _ = (archive_path, owner);
    Ok((engine, None))
}

fn finish_writer(writer: ArchiveWriter) {
    if let Some(handle) = writer {
        match handle.join() {
            Ok(n) => debug!(archived = n, "archive writer finished"),
            Err(_) => warn!("archive writer panicked"),
        }
    }
}

async fn scan_one(
    engine: &Engine,
    capability: &str,
    target: &str,
    owner: &str,
    opts: SubmitOptions,
) -> Result<engine_core::ScanJob> {
    let job_id = engine.submit_with(capability, target, owner, opts)?;
    info!(%job_id, capability, target, "scan submitted");
    let job = tokio::select! {
        res = engine.wait(job_id) => res?,
        _ = tokio::signal::ctrl_c() => {
            let ack = engine.cancel(job_id, owner)?;
            warn!(%job_id, ?ack, "interrupted, cancelling scan");
            engine.wait(job_id).await?
        }
    };
    Ok(job)
}

/// Submits every target, pacing on backpressure, and forwards each terminal
/// job as it arrives. Ctrl-C cancels whatever has not finished.
async fn run_batch(
    engine: &Engine,
    capability: &str,
    targets: Vec<String>,
    owner: &str,
    opts: SubmitOptions,
    tx: mpsc::UnboundedSender<Line>,
) -> Result<()> {
    let mut events = engine.subscribe();
    let mut queue: VecDeque<String> = targets.into();
    let mut pending: HashMap<JobId, String> = HashMap::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        while !interrupted {
            let Some(target) = queue.front() else { break };
            match engine.submit_with(capability, target, owner, opts.clone()) {
                Ok(job_id) => {
                    if let Some(t) = queue.pop_front() {
                        pending.insert(job_id, t);
                    }
                }
                Err(EngineError::ResourceExhausted(reason)) => {
                    debug!(%reason, pending = pending.len(), "engine busy, holding remaining targets");
                    break;
                }
                Err(e) => {
                    let target = queue.pop_front().unwrap_or_default();
                    let _ = tx.send(Line::Rejected { capability: capability.to_string(), target, error: e.to_string() });
                }
            }
        }
        if pending.is_empty() && (queue.is_empty() || interrupted) {
            break;
        }
        tokio::select! {
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                warn!(pending = pending.len(), unsubmitted = queue.len(), "interrupted, cancelling batch");
                queue.clear();
                for job_id in pending.keys() {
                    if let Err(e) = engine.cancel(*job_id, owner) {
                        warn!(%job_id, error = %e, "cancel failed");
                    }
                }
            }
            ev = events.recv() => match ev {
                Ok(JobEvent { job }) if job.is_terminal() => {
                    if pending.remove(&job.job_id).is_some() {
                        let _ = tx.send(Line::Job(job));
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "batch lagged behind engine events, polling pending jobs");
                    let ids: Vec<JobId> = pending.keys().copied().collect();
                    for job_id in ids {
                        if let Ok(job) = engine.status(job_id) {
                            if job.is_terminal() {
                                pending.remove(&job_id);
                                let _ = tx.send(Line::Job(job));
                            }
                        }
                    }
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::time::sleep(Duration::from_secs(1)), if !queue.is_empty() && !interrupted => {}
        }
    }
    Ok(())
}
