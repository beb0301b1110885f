//! Subcommand handlers extracted from `main.rs`.
//!
//! Keeps `main.rs` slim: clap parsing stays there, wiring and the
//! offline job commands live here.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::approval::ApprovalBroker;
use crate::backend;
use crate::comm::TransportRegistry;
use crate::config::Config;
use crate::coordinator::{Collaborators, RunCoordinator};
use crate::events::{self, EventBus};
use crate::queue::SessionQueue;
use crate::scheduler::{JobSchedule, JobStore, Scheduler};
use crate::session::TranscriptStore;
use crate::tools::ToolPolicy;

// ── Config ───────────────────────────────────────────────────────────────────

/// Load the config at `path`, or fall back to defaults when no file exists.
/// A file that exists but doesn't parse is still an error.
pub async fn load_config(path: &Path) -> anyhow::Result<Config> {
    match Config::load(path).await {
        Ok(cfg) => Ok(cfg),
        Err(e) if !config_exists(path) => {
            warn!(path = %path.display(), error = %e, "no config file, using defaults");
            Ok(Config::default())
        }
        Err(e) => Err(e),
    }
}

fn config_exists(path: &Path) -> bool {
    let mut bak = path.as_os_str().to_os_string();
    bak.push(".bak");
    path.exists() || Path::new(&bak).exists()
}

// ── Wiring ───────────────────────────────────────────────────────────────────

/// Everything a running daemon (or console session) holds on to.
pub struct Runtime {
    pub coordinator: RunCoordinator,
    pub job_dispatcher: JoinHandle<()>,
    pub monitor: JoinHandle<()>,
}

impl Runtime {
    /// Stop the timer wheel and background tasks.  Persisted jobs survive.
    pub async fn shutdown(self) {
        self.coordinator.scheduler().shutdown().await;
        self.job_dispatcher.abort();
        self.monitor.abort();
    }
}

/// Build the coordinator and its collaborators from `cfg`, restore
/// persisted jobs and start consuming fired jobs.
pub async fn build_runtime(cfg: &Config) -> anyhow::Result<Runtime> {
    let events = EventBus::new();
    let monitor = events::spawn_monitor(&events);

    let transports = TransportRegistry::new();
    let queue = SessionQueue::new(events.clone(), cfg.idle_grace());

    let store = JobStore::new(cfg.scheduler.jobs_path());
    let (scheduler, due_rx) = Scheduler::new(store, events.clone(), cfg.scheduler.timezone()?).await?;
    let restored = scheduler.load().await;
    info!(jobs = restored, "scheduler ready");

    let approvals = ApprovalBroker::new(transports.clone(), events.clone());
    let transcripts = TranscriptStore::new(cfg.transcripts.dir());
    let backend = backend::build_backend(&cfg.backend)?;
    info!(backend = backend.name(), "backend ready");

    let policy = ToolPolicy {
        require_approval: cfg.approval.require_for.iter().cloned().collect(),
        approval_timeout: cfg.approval_timeout(),
    };

    let parts = Collaborators {
        queue,
        scheduler,
        approvals,
        transports,
        transcripts,
        events,
    };
    let coordinator = RunCoordinator::new(cfg.agent_id.clone(), parts, backend, policy, cfg.backend.history_limit);
    let job_dispatcher = coordinator.spawn_job_dispatcher(due_rx);

    Ok(Runtime {
        coordinator,
        job_dispatcher,
        monitor,
    })
}

// ── Daemon ───────────────────────────────────────────────────────────────────

/// Run the daemon until Ctrl-C.
pub async fn run_daemon(cfg: Config) -> anyhow::Result<()> {
    let runtime = build_runtime(&cfg).await?;
    let coordinator = runtime.coordinator.clone();

    let discord = match &cfg.channels.discord {
        Some(dc) => match crate::discord::start(dc, coordinator.clone()).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "discord disabled");
                None
            }
        },
        None => {
            info!("discord not configured");
            None
        }
    };

    let gateway = crate::gateway::spawn_gateway_if_enabled(&cfg.gateway, coordinator.clone()).await;

    let platforms = coordinator.transports().platforms().await;
    info!(
        agent = %coordinator.agent_id(),
        platforms = ?platforms,
        gateway = ?gateway.as_ref().map(|g| g.addr),
        "clawd ready"
    );

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    info!("received Ctrl-C, shutting down…");

    if let Some(gw) = gateway {
        gw.handle.abort();
    }
    if let Some(handle) = discord {
        handle.abort();
    }
    runtime.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

/// Run a local chat on stdin/stdout.
pub async fn run_console(cfg: Config) -> anyhow::Result<()> {
    let runtime = build_runtime(&cfg).await?;
    let result = crate::console::run(runtime.coordinator.clone()).await;
    runtime.shutdown().await;
    result
}

// ── Jobs (offline) ───────────────────────────────────────────────────────────

fn describe_schedule(schedule: &JobSchedule) -> String {
    match schedule {
        JobSchedule::Delayed { execute_at } => format!("at {}", execute_at.to_rfc3339()),
        JobSchedule::Recurring { interval_secs } => format!("every {interval_secs}s"),
        JobSchedule::Cron { expression } => format!("cron '{expression}'"),
    }
}

/// Print the persisted jobs.
pub async fn list_jobs(cfg: &Config) -> anyhow::Result<()> {
    let store = JobStore::new(cfg.scheduler.jobs_path());
    let jobs = store.load().await;
    if jobs.is_empty() {
        println!("No scheduled jobs ({}).", store.path().display());
        return Ok(());
    }
    for job in &jobs {
        println!(
            "{}  {:<9} {:<28} -> {}:{}  {}",
            job.id,
            job.schedule.kind(),
            describe_schedule(&job.schedule),
            job.target.platform,
            job.target.chat_id,
            job.description,
        );
    }
    println!("{} job(s)", jobs.len());
    Ok(())
}

/// Remove a job from the job file.  A running daemon keeps its own copy
/// until restart, so prefer the gateway or `/cancel` while it is up.
pub async fn cancel_job(cfg: &Config, id: &str) -> anyhow::Result<()> {
    let store = JobStore::new(cfg.scheduler.jobs_path());
    let mut jobs = store.load().await;
    let before = jobs.len();
    jobs.retain(|j| j.id != id);
    if jobs.len() == before {
        anyhow::bail!("no job with id '{id}' in {}", store.path().display());
    }
    store.save(&jobs).await?;
    println!("Cancelled {id}.");
    Ok(())
}

// ── Status ───────────────────────────────────────────────────────────────────

/// Check whether the daemon is running by hitting the gateway's
/// `/api/status` endpoint.
pub async fn check_status(cfg: &Config) -> anyhow::Result<()> {
    let addr = &cfg.gateway.addr;
    let url = format!("http://{addr}/api/status");

    let client = reqwest::Client::builder().timeout(Duration::from_secs(3)).build()?;

    let mut req = client.get(&url);
    if let Some(token) = crate::gateway::api_token_from_env() {
        req = req.bearer_auth(token);
    }

    match req.send().await {
        Ok(resp) if resp.status().is_success() => {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            println!("✅ clawd is running");
            println!("   Gateway:   http://{addr}");
            if let Some(agent) = body.get("agent_id").and_then(|s| s.as_str()) {
                println!("   Agent:     {agent}");
            }
            if let Some(platforms) = body.get("platforms").and_then(|p| p.as_array()) {
                let names: Vec<&str> = platforms.iter().filter_map(|p| p.as_str()).collect();
                println!("   Platforms: {}", names.join(", "));
            }
            if let Some(queue) = body.get("queue") {
                println!(
                    "   Queue:     {} active, {} pending, {} processed",
                    queue["active_conversations"], queue["total_pending"], queue["total_processed"]
                );
            }
            if let Some(jobs) = body.get("jobs") {
                println!("   Jobs:      {jobs}");
            }
            Ok(())
        }
        Ok(resp) => {
            println!("⚠️  clawd responded with status: {}", resp.status());
            Ok(())
        }
        Err(_) => {
            println!("❌ clawd is not running (no response at http://{addr})");
            println!("   Start it with: clawd start");
            Ok(())
        }
    }
}
