//! Command-line interface for podmon.
//!
//! Provides commands for running the pipeline, processing a single feed,
//! rerunning one stage of an episode, syncing feeds, inspecting episodes
//! and their event history, and listing recent failures.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use fs2::FileExt;
use tracing::info;

use crate::adapters::{
    AssemblyAiTranscriber, ChatClient, ChatEnricher, ChatProducer, Collaborators, HttpAcquirer,
    ResendDistributor, RssFeedSource, Transformer, WhisperTranscriber,
};
use crate::config::{Config, TranscriberKind};
use crate::core::{resolver, Database, FeedReport, Orchestrator, RunReport};
use crate::domain::{EventPayload, EventStatus, Stage};

/// podmon - Event-sourced podcast monitoring pipeline
#[derive(Parser, Debug)]
#[command(name = "podmon")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Directory holding podcasts.yaml and config.yaml
    #[arg(long, global = true, env = "PODMON_CONFIG_DIR", default_value = ".")]
    pub config_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process every active feed once
    Run,

    /// Process one active feed
    Process {
        /// Feed slug from podcasts.yaml
        #[arg(long)]
        feed: String,

        /// Only the newest N episodes of the feed
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Download audio for an episode
    Download {
        /// Episode guid
        guid: String,
    },

    /// Generate context for an episode
    Contextualize {
        /// Episode guid
        guid: String,
    },

    /// Transcribe an episode's downloaded audio
    Transcribe {
        /// Episode guid
        guid: String,
    },

    /// Summarize an episode's transcript
    Summarize {
        /// Episode guid
        guid: String,
    },

    /// Email an episode's summary to its feed's recipients
    Email {
        /// Episode guid
        guid: String,
    },

    /// Mark an episode completed and archive its audio
    Complete {
        /// Episode guid
        guid: String,
    },

    /// Mirror configured feeds into the registry without processing
    Sync,

    /// Show the current status of an episode
    Status {
        /// Episode guid
        guid: String,
    },

    /// Show the full event history of an episode
    Events {
        /// Episode guid
        guid: String,
    },

    /// List episodes whose latest event is a failure
    Failed {
        /// Only failures recorded within this many hours
        #[arg(long)]
        hours: Option<i64>,
    },

    /// Show resolved configuration (debug)
    Config,
}

/// How a command finished when it did not error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,

    /// The command ran but some feeds or episodes failed
    Degraded,
}

impl From<Outcome> for ExitCode {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => ExitCode::SUCCESS,
            Outcome::Degraded => ExitCode::from(1),
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<Outcome> {
        let config = Config::load(&self.config_dir)?;

        match self.command {
            Commands::Run => run(&config).await,
            Commands::Process { feed, limit } => process(&config, &feed, limit).await,
            Commands::Download { guid } => run_stage(&config, &guid, Stage::Acquire).await,
            Commands::Contextualize { guid } => run_stage(&config, &guid, Stage::Enrich).await,
            Commands::Transcribe { guid } => run_stage(&config, &guid, Stage::Transform).await,
            Commands::Summarize { guid } => run_stage(&config, &guid, Stage::Produce).await,
            Commands::Email { guid } => run_stage(&config, &guid, Stage::Distribute).await,
            Commands::Complete { guid } => run_stage(&config, &guid, Stage::Complete).await,
            Commands::Sync => sync(&config),
            Commands::Status { guid } => show_status(&config, &guid),
            Commands::Events { guid } => show_events(&config, &guid),
            Commands::Failed { hours } => list_failed(&config, hours),
            Commands::Config => show_config(&config),
        }
    }
}

/// Open the state database, creating the home directory on first use
fn open_database(config: &Config) -> Result<Database> {
    std::fs::create_dir_all(&config.home)
        .with_context(|| format!("Failed to create {}", config.home.display()))?;
    let path = config.db_path();
    Database::open(&path).with_context(|| format!("Failed to open database {}", path.display()))
}

/// Hold an exclusive lock for the duration of a run.
///
/// The lock is released when the returned file is dropped.
fn acquire_run_lock(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

    if file.try_lock_exclusive().is_err() {
        bail!("Another run holds {}", path.display());
    }
    Ok(file)
}

/// Wire production collaborators from configuration
fn build_collaborators(config: &Config) -> Result<Collaborators> {
    config.validate_secrets()?;
    let settings = &config.settings;
    let secrets = &config.secrets;
    let llm_key = secrets.llm_api_key.clone().unwrap_or_default();
    let llm = config.llm_endpoint();
    info!(provider = ?llm.provider, base_url = %llm.base_url, "Using chat provider");

    let transformer: Box<dyn Transformer> = match settings.transcriber {
        TranscriberKind::Whisper => Box::new(WhisperTranscriber::new(
            &settings.whisper_model,
            &settings.transcription_language,
        )),
        TranscriberKind::AssemblyAi => Box::new(AssemblyAiTranscriber::new(
            secrets.assemblyai_api_key.clone().unwrap_or_default(),
        )?),
    };

    Ok(Collaborators {
        feeds: Box::new(RssFeedSource::new(
            settings.check_last_n_episodes as usize,
            settings.max_audio_length_minutes,
        )?),
        acquirer: Box::new(HttpAcquirer::new(&config.audio_dir())?),
        enricher: Box::new(ChatEnricher::new(ChatClient::new(
            &llm.base_url,
            llm_key.clone(),
            &llm.context_model,
        )?)),
        transformer,
        producer: Box::new(ChatProducer::new(
            ChatClient::new(&llm.base_url, llm_key, &llm.summary_model)?,
            &config.summary_system_prompt,
        )),
        distributor: Box::new(ResendDistributor::new(
            secrets.resend_api_key.clone().unwrap_or_default(),
            &settings.system_email,
            settings.reply_to_email.clone(),
        )?),
    })
}

async fn run(config: &Config) -> Result<Outcome> {
    let collaborators = build_collaborators(config)?;
    let _lock = lock_home(config)?;
    let db = open_database(config)?;

    let orchestrator = Orchestrator::new(&db, config, collaborators);
    let report = orchestrator.run().await?;
    print_report(&report);

    Ok(if report.is_degraded() {
        Outcome::Degraded
    } else {
        Outcome::Success
    })
}

/// Create the home directory and take the run lock
fn lock_home(config: &Config) -> Result<File> {
    std::fs::create_dir_all(&config.home)
        .with_context(|| format!("Failed to create {}", config.home.display()))?;
    acquire_run_lock(&config.lock_path())
}

async fn process(config: &Config, slug: &str, limit: Option<usize>) -> Result<Outcome> {
    let collaborators = build_collaborators(config)?;
    let _lock = lock_home(config)?;
    let db = open_database(config)?;

    let orchestrator = Orchestrator::new(&db, config, collaborators);
    let report = orchestrator.run_feed(slug, limit).await?;
    print_feed(&report);

    let degraded = report.error.is_some() || report.episodes.iter().any(|e| e.outcome.is_problem());
    Ok(if degraded {
        Outcome::Degraded
    } else {
        Outcome::Success
    })
}

async fn run_stage(config: &Config, guid: &str, stage: Stage) -> Result<Outcome> {
    let collaborators = build_collaborators(config)?;
    let _lock = lock_home(config)?;
    let db = open_database(config)?;

    let orchestrator = Orchestrator::new(&db, config, collaborators);
    let outcome = orchestrator.run_stage_for(guid, stage).await?;
    println!("{} {}: {}", stage, guid, outcome);

    Ok(if outcome.is_problem() {
        Outcome::Degraded
    } else {
        Outcome::Success
    })
}

fn print_feed(feed: &FeedReport) {
    match &feed.error {
        Some(error) => println!("{}: FAILED ({})", feed.slug, error),
        None => println!("{}: {} episode(s)", feed.slug, feed.episodes.len()),
    }
    for episode in &feed.episodes {
        println!("  {:<40} {}", truncate(&episode.title, 40), episode.outcome);
    }
}

fn print_report(report: &RunReport) {
    report.feeds.iter().for_each(print_feed);

    let counts = report.counts();
    println!();
    println!(
        "completed: {}  failed: {}  partial: {}  unchanged: {}  skipped: {}",
        counts.completed, counts.failed, counts.partial, counts.unchanged, counts.skipped
    );
}

fn sync(config: &Config) -> Result<Outcome> {
    let db = open_database(config)?;
    let deactivated = db.registry().sync_feeds(&config.feed_flags())?;
    let active = db.registry().active_feeds()?;
    info!(active = active.len(), deactivated, "Feeds synced");

    for feed in active {
        println!("{}", feed.slug);
    }
    Ok(Outcome::Success)
}

fn show_status(config: &Config, guid: &str) -> Result<Outcome> {
    let db = open_database(config)?;
    let Some(episode) = db.registry().episode_by_guid(guid)? else {
        bail!("No episode with guid: {}", guid);
    };
    let status = db.events().current_status(episode.id)?;
    let delivered = db.deliveries().delivered_to(episode.id)?;
    let feed = db.registry().feed_by_id(episode.feed_id)?;

    println!("Episode: {}", episode.title);
    println!("Guid: {}", episode.guid);
    if let Some(feed) = feed {
        println!("Feed: {}", feed.slug);
    }
    if let Some(published) = &episode.published_at {
        println!("Published: {}", published);
    }
    match status {
        Some(status) => println!("Status: {}", status),
        None => println!("Status: (not started)"),
    }
    if status == Some(EventStatus::Failed) {
        let history: Vec<EventStatus> = db
            .events()
            .all(episode.id, None)?
            .iter()
            .map(|e| e.status())
            .collect();
        if let Some(stage) = resolver::failed_stage_from_history(&history) {
            println!("Failed stage: {}", stage);
        }
        if let Some(event) = db.events().latest_of(episode.id, EventStatus::Failed)? {
            if let EventPayload::Failed(data) = &event.payload {
                println!("Error: {}", data.error_message);
            }
        }
    }
    if !delivered.is_empty() {
        println!("Delivered to: {}", delivered.join(", "));
    }

    Ok(Outcome::Success)
}

fn show_events(config: &Config, guid: &str) -> Result<Outcome> {
    let db = open_database(config)?;
    let Some(episode) = db.registry().episode_by_guid(guid)? else {
        bail!("No episode with guid: {}", guid);
    };

    let events = db.events().all(episode.id, None)?;
    if events.is_empty() {
        println!("No events recorded");
        return Ok(Outcome::Success);
    }

    println!("{:<6} {:<16} {:<28} {}", "ID", "STATUS", "AT", "DATA");
    println!("{}", "-".repeat(80));
    for event in events {
        let data = event
            .payload
            .data_json()
            .context("Failed to serialize event data")?
            .unwrap_or_default();
        println!(
            "{:<6} {:<16} {:<28} {}",
            event.id,
            event.status(),
            event.created_at.to_rfc3339(),
            data
        );
    }

    Ok(Outcome::Success)
}

fn list_failed(config: &Config, hours: Option<i64>) -> Result<Outcome> {
    let db = open_database(config)?;
    let since = hours.map(|h| Utc::now() - Duration::hours(h));
    let failed = db.events().failed_episodes(since)?;

    if failed.is_empty() {
        println!("No failed episodes");
        return Ok(Outcome::Success);
    }

    println!("{:<20} {:<40} {:<12} {}", "FEED", "TITLE", "STAGE", "ERROR");
    println!("{}", "-".repeat(100));
    for episode in failed {
        println!(
            "{:<20} {:<40} {:<12} {}",
            truncate(&episode.feed_slug, 20),
            truncate(&episode.title, 40),
            episode.failed_stage,
            episode.error_message
        );
    }

    Ok(Outcome::Success)
}

fn show_config(config: &Config) -> Result<Outcome> {
    let yaml = serde_yaml::to_string(&config.view()).context("Failed to render configuration")?;
    println!("Database: {}", config.db_path().display());
    println!("Audio:    {}", config.audio_dir().display());
    println!();
    print!("{}", yaml);
    Ok(Outcome::Success)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a much longer title", 10), "a much ...");
    }

    #[test]
    fn test_run_lock_is_exclusive() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("podmon.lock");

        let held = acquire_run_lock(&path).unwrap();
        assert!(acquire_run_lock(&path).is_err());
        drop(held);
        assert!(acquire_run_lock(&path).is_ok());
    }

    #[test]
    fn test_parse_commands() {
        let cli = Cli::try_parse_from(["podmon", "--config-dir", "/etc/podmon", "failed", "--hours", "6"])
            .unwrap();
        assert_eq!(cli.config_dir, PathBuf::from("/etc/podmon"));
        assert!(matches!(cli.command, Commands::Failed { hours: Some(6) }));

        let cli = Cli::try_parse_from(["podmon", "status", "guid-1"]).unwrap();
        assert!(matches!(cli.command, Commands::Status { guid } if guid == "guid-1"));

        let cli = Cli::try_parse_from(["podmon", "process", "--feed", "alpha", "--limit", "2"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Process { feed, limit: Some(2) } if feed == "alpha"
        ));
        assert!(Cli::try_parse_from(["podmon", "process"]).is_err());

        let cli = Cli::try_parse_from(["podmon", "transcribe", "guid-1"]).unwrap();
        assert!(matches!(cli.command, Commands::Transcribe { guid } if guid == "guid-1"));
    }
}
