//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cartograph_core::{Orchestrator, PipelineHealth, ProgressReporter, Settled, TickReport};
use cartograph_shared::{
    AgentType, AppConfig, EntityId, Job, JobId, TimeRange, init_config, load_config,
    resolve_db_path, validate_credentials,
};
use cartograph_storage::Storage;

use crate::feed;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Cartograph: continuously enrich a catalogue of domains.
#[derive(Parser)]
#[command(
    name = "cartograph",
    version,
    about = "Schedule enrichment agents over a domain catalogue and track what changes.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run scheduler ticks and work the queues.
    Run {
        /// Entity feed to enroll first (JSON lines or one domain per line).
        #[arg(long)]
        entities: Option<PathBuf>,

        /// Number of tick-and-drain rounds.
        #[arg(long, default_value = "1", conflicts_with = "forever")]
        ticks: u32,

        /// Keep running with per-agent workers until interrupted.
        #[arg(long)]
        forever: bool,
    },

    /// Queue enrichment for one entity.
    Submit {
        entity: String,

        /// Agent to run (repeatable). Defaults to the entry agents for the
        /// entity's kind.
        #[arg(long = "agent")]
        agents: Vec<AgentType>,
    },

    /// Stop enriching an entity and withdraw its queued jobs.
    Cancel { entity: String },

    /// Print the current fact record of an entity.
    Facts { entity: String },

    /// Print change records for an entity.
    History {
        entity: String,

        /// Earliest period end, `YYYY-MM-DD` or RFC 3339.
        #[arg(long)]
        since: Option<String>,

        /// Latest period end, `YYYY-MM-DD` (inclusive) or RFC 3339.
        #[arg(long)]
        until: Option<String>,
    },

    /// Queue depths, dead letters, and provider breaker states.
    Health,

    /// Inspect or replay dead-lettered jobs.
    DeadLetter {
        #[command(subcommand)]
        action: DeadLetterAction,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum DeadLetterAction {
    /// List dead-lettered jobs.
    List,
    /// Put a dead-lettered job back in its queue with a fresh attempt budget.
    Replay { job_id: JobId },
}

#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "cartograph=info",
        1 => "cartograph=debug",
        _ => "cartograph=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            entities,
            ticks,
            forever,
        } => cmd_run(entities.as_deref(), ticks, forever).await,
        Command::Submit { entity, agents } => cmd_submit(&entity, &agents).await,
        Command::Cancel { entity } => cmd_cancel(&entity).await,
        Command::Facts { entity } => cmd_facts(&entity).await,
        Command::History {
            entity,
            since,
            until,
        } => cmd_history(&entity, since.as_deref(), until.as_deref()).await,
        Command::Health => cmd_health().await,
        Command::DeadLetter { action } => match action {
            DeadLetterAction::List => cmd_dead_letter_list().await,
            DeadLetterAction::Replay { job_id } => cmd_dead_letter_replay(&job_id).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Orchestrator setup
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum Access {
    ReadWrite,
    ReadOnly,
}

/// Open the pipeline database and rebuild the orchestrator from it.
async fn open_orchestrator(
    config: AppConfig,
    progress: Arc<dyn ProgressReporter>,
    access: Access,
) -> Result<Orchestrator> {
    let db_path = resolve_db_path(&config)?;
    let storage = match access {
        Access::ReadWrite => Storage::open(&db_path).await?,
        Access::ReadOnly => {
            if !db_path.exists() {
                return Err(eyre!(
                    "no pipeline state at '{}'. Run `cartograph run` first.",
                    db_path.display()
                ));
            }
            Storage::open_readonly(&db_path).await?
        }
    };

    let orchestrator = Orchestrator::from_config(config, Some(Arc::new(storage)), progress)?;
    let report = orchestrator.restore().await?;
    info!(
        db = %db_path.display(),
        entities = report.entities,
        jobs = report.jobs,
        "pipeline state loaded"
    );
    Ok(orchestrator)
}

async fn open_readonly() -> Result<Orchestrator> {
    let config = load_config()?;
    open_orchestrator(config, Arc::new(cartograph_core::SilentProgress), Access::ReadOnly).await
}

async fn open_writable() -> Result<Orchestrator> {
    let config = load_config()?;
    open_orchestrator(config, Arc::new(cartograph_core::SilentProgress), Access::ReadWrite).await
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(entities: Option<&Path>, ticks: u32, forever: bool) -> Result<()> {
    let config = load_config()?;
    validate_credentials(&config)?;

    let progress = Arc::new(CliProgress::new());
    let orchestrator = open_orchestrator(config, progress.clone(), Access::ReadWrite).await?;

    if let Some(path) = entities {
        let feed = feed::read_feed(path, Utc::now())?;
        let total = feed.len();
        let added = orchestrator.enroll(feed).await?;
        info!(feed = %path.display(), total, added, "entity feed enrolled");
    }
    orchestrator.enroll_keyword_batches().await?;

    if forever {
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("interrupt received, shutting down");
                    signal.cancel();
                }
                Err(e) => warn!(error = %e, "cannot listen for interrupts"),
            }
        });
        orchestrator.run(shutdown).await?;
    } else {
        for round in 1..=ticks {
            progress.phase(&format!("Round {round}/{ticks}"));
            orchestrator.tick().await?;
            orchestrator.drain().await?;
        }
    }
    progress.finish();

    println!();
    println!("  Jobs settled:  {}", progress.settled());
    println!("  Dead-lettered: {}", progress.dead_lettered());
    print_health(&orchestrator.get_pipeline_health());
    Ok(())
}

async fn cmd_submit(entity: &str, agents: &[AgentType]) -> Result<()> {
    let orchestrator = open_writable().await?;
    let entity_id = EntityId::new(entity);
    let requested = (!agents.is_empty()).then_some(agents);
    let submission = orchestrator
        .submit_for_enrichment(&entity_id, requested)
        .await?;
    println!("{}", serde_json::to_string_pretty(&submission)?);
    Ok(())
}

async fn cmd_cancel(entity: &str) -> Result<()> {
    let orchestrator = open_writable().await?;
    let withdrawn = orchestrator.cancel_entity(&EntityId::new(entity)).await?;
    println!("Cancelled {entity}: {withdrawn} queued job(s) withdrawn");
    Ok(())
}

async fn cmd_facts(entity: &str) -> Result<()> {
    let orchestrator = open_readonly().await?;
    let record = orchestrator
        .get_current_fact_record(&EntityId::new(entity))
        .await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

async fn cmd_history(entity: &str, since: Option<&str>, until: Option<&str>) -> Result<()> {
    let range = TimeRange {
        since: since.map(|s| parse_bound(s, Bound::Start)).transpose()?,
        until: until.map(|s| parse_bound(s, Bound::End)).transpose()?,
    };
    let orchestrator = open_readonly().await?;
    let history = orchestrator.get_change_history(&EntityId::new(entity), range);
    println!("{}", serde_json::to_string_pretty(&history)?);
    Ok(())
}

async fn cmd_health() -> Result<()> {
    let orchestrator = open_readonly().await?;
    print_health(&orchestrator.get_pipeline_health());
    Ok(())
}

async fn cmd_dead_letter_list() -> Result<()> {
    let orchestrator = open_readonly().await?;
    let jobs = orchestrator.dead_letters();
    if jobs.is_empty() {
        println!("No dead-lettered jobs.");
        return Ok(());
    }
    for job in &jobs {
        println!("{}", describe_dead_letter(job));
    }
    Ok(())
}

async fn cmd_dead_letter_replay(job_id: &JobId) -> Result<()> {
    let orchestrator = open_writable().await?;
    let job = orchestrator.replay_dead_letter(job_id).await?;
    println!(
        "Replayed {} ({} on {}), queued for {}",
        job.job_id,
        job.agent_type,
        job.entity_id,
        job.not_before.to_rfc3339()
    );
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Output helpers
// ---------------------------------------------------------------------------

fn print_health(health: &PipelineHealth) {
    println!();
    println!("  {:<18} {:>7} {:>7}", "agent", "queued", "running");
    for (agent, h) in &health.agents {
        println!("  {agent:<18} {:>7} {:>7}", h.queued, h.running);
    }
    println!();
    println!("  Entities:      {}", health.entities);
    println!("  In flight:     {}", health.in_flight);
    println!("  Retired:       {}", health.retired);
    println!("  Dead letters:  {}", health.dead_letters);
    for p in &health.providers {
        let probe = p
            .next_probe_at
            .map(|at| format!(", probe at {}", at.to_rfc3339()))
            .unwrap_or_default();
        println!(
            "  Provider {}: {} ({} failures, opened {} times{probe})",
            p.provider_id,
            p.state.as_str(),
            p.consecutive_failures,
            p.open_events
        );
    }
    println!();
}

fn describe_dead_letter(job: &Job) -> String {
    let last = job
        .history
        .last()
        .map(|h| match &h.detail {
            Some(detail) => format!("{}: {detail}", h.outcome),
            None => h.outcome.clone(),
        })
        .unwrap_or_default();
    format!(
        "{}  {:<16} {:<24} attempts={}  {last}",
        job.job_id, job.agent_type, job.entity_id, job.attempt_count
    )
}

#[derive(Clone, Copy)]
enum Bound {
    Start,
    End,
}

/// Parse `YYYY-MM-DD` (start or end of that UTC day) or an RFC 3339 time.
fn parse_bound(raw: &str, bound: Bound) -> Result<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| eyre!("invalid date '{raw}': {e}"))?;
    let naive = match bound {
        Bound::Start => date.and_hms_opt(0, 0, 0),
        Bound::End => date.and_hms_milli_opt(23, 59, 59, 999),
    }
    .ok_or_else(|| eyre!("invalid date '{raw}'"))?;
    Ok(naive.and_utc())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
    settled: AtomicUsize,
    dead_lettered: AtomicUsize,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self {
            spinner,
            settled: AtomicUsize::new(0),
            dead_lettered: AtomicUsize::new(0),
        }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }

    fn settled(&self) -> usize {
        self.settled.load(Ordering::Relaxed)
    }

    fn dead_lettered(&self) -> usize {
        self.dead_lettered.load(Ordering::Relaxed)
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn job_started(&self, job: &Job) {
        self.spinner
            .set_message(format!("{} {}", job.agent_type, job.entity_id));
    }

    fn job_settled(&self, job: &Job, settled: &Settled) {
        self.settled.fetch_add(1, Ordering::Relaxed);
        if let Settled::DeadLettered { reason } = settled {
            self.dead_lettered.fetch_add(1, Ordering::Relaxed);
            self.spinner.println(format!(
                "  dead-lettered {} {}: {reason}",
                job.agent_type, job.entity_id
            ));
        }
    }

    fn ticked(&self, report: &TickReport) {
        self.spinner.set_message(format!(
            "Tick: {} enqueued, {} gated, {} held",
            report.enqueued, report.gated, report.held
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn date_bounds_cover_whole_days() {
        let start = parse_bound("2026-03-01", Bound::Start).unwrap();
        let end = parse_bound("2026-03-01", Bound::End).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap());
        assert!(end > Utc.with_ymd_and_hms(2026, 3, 1, 23, 59, 59).unwrap());
        assert!(end < Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap());

        let exact = parse_bound("2026-03-01T06:30:00+01:00", Bound::End).unwrap();
        assert_eq!(exact, Utc.with_ymd_and_hms(2026, 3, 1, 5, 30, 0).unwrap());

        assert!(parse_bound("March 1st", Bound::Start).is_err());
    }

    #[test]
    fn cli_parses_repeated_agents() {
        let cli = Cli::try_parse_from([
            "cartograph",
            "submit",
            "example.co.uk",
            "--agent",
            "seo_metrics",
            "--agent",
            "tech_stack",
        ])
        .unwrap();
        let Command::Submit { entity, agents } = cli.command else {
            panic!("expected submit");
        };
        assert_eq!(entity, "example.co.uk");
        assert_eq!(agents, vec![AgentType::SeoMetrics, AgentType::TechStack]);
    }

    #[test]
    fn ticks_and_forever_conflict() {
        assert!(Cli::try_parse_from(["cartograph", "run", "--ticks", "3", "--forever"]).is_err());
        assert!(Cli::try_parse_from(["cartograph", "-v", "run", "--forever"]).is_ok());
    }
}
