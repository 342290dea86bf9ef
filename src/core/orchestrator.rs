//! Stage orchestrator.
//!
//! Drives every episode of every active feed through
//! acquire → enrich → transform → produce → distribute → complete.
//! The next stage is always derived from the latest recorded event, so a
//! rerun resumes where the previous run stopped and never repeats a stage
//! that already succeeded.
//!
//! Failures are isolated at two levels: an episode failure is recorded as
//! a `failed` event and the next episode runs; a feed failure is reported
//! and the next feed runs. Only errors reading the registry itself abort.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{Duration, Utc};
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{Artifact, Collaborators, EnrichRequest, ProduceRequest};
use crate::config::{Config, FeedConfig};
use crate::domain::{
    Episode, EpisodeCandidate, EventPayload, EventStatus, FailedStage, Feed, FeedMetadata,
    Stage,
};

use super::db::Database;
use super::report::{EpisodeOutcome, EpisodeReport, FeedReport, RunReport, StageOutcome};
use super::resolver;

/// Audio extensions kept from the source URL; anything else becomes `.mp3`
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "aac", "ogg", "opus", "wav", "flac"];

/// Everything a stage needs to know about the feed it runs under
struct FeedContext<'a> {
    feed: &'a Feed,
    config: &'a FeedConfig,
    metadata: Option<&'a FeedMetadata>,
}

/// How a stage ended when it did not fail
enum StageResult {
    /// The stage recorded this status
    Advanced(EventStatus),

    /// Distribution reached only some destinations
    Partial { pending: Vec<String> },
}

/// Main pipeline orchestrator
pub struct Orchestrator<'a> {
    db: &'a Database,
    config: &'a Config,
    collaborators: Collaborators,
}

impl<'a> Orchestrator<'a> {
    pub fn new(db: &'a Database, config: &'a Config, collaborators: Collaborators) -> Self {
        Self {
            db,
            config,
            collaborators,
        }
    }

    /// Mirror configured feeds into the registry
    pub fn sync_feeds(&self) -> Result<()> {
        let deactivated = self
            .db
            .registry()
            .sync_feeds(&self.config.feed_flags())
            .context("Failed to sync feeds")?;
        info!(
            configured = self.config.feeds.len(),
            deactivated, "Synced feeds from configuration"
        );
        Ok(())
    }

    /// One full periodic run: sync, process every active feed, housekeeping.
    ///
    /// Returns `Err` only when the registry cannot be read. Per-feed and
    /// per-episode problems are in the report.
    pub async fn run(&self) -> Result<RunReport> {
        let mut report = RunReport::new();

        self.sync_feeds()?;
        let feeds = self
            .db
            .registry()
            .active_feeds()
            .context("Failed to list active feeds")?;
        info!(count = feeds.len(), "Processing active feeds");

        for feed in &feeds {
            report.feeds.push(self.feed_report(feed, None).await);
        }

        self.cleanup_failed().await;
        self.report_failures().await;

        report.finish();
        let counts = report.counts();
        info!(
            completed = counts.completed,
            failed = counts.failed,
            partial = counts.partial,
            unchanged = counts.unchanged,
            skipped = counts.skipped,
            failed_feeds = report.failed_feeds().count(),
            degraded = report.is_degraded(),
            "Run finished"
        );
        Ok(report)
    }

    /// Sync and process one active feed, newest `limit` candidates only.
    ///
    /// Housekeeping is left to full runs.
    pub async fn run_feed(&self, slug: &str, limit: Option<usize>) -> Result<FeedReport> {
        self.sync_feeds()?;
        let feed = self
            .db
            .registry()
            .feed_by_slug(slug)
            .context("Failed to look up feed")?
            .ok_or_else(|| anyhow!("Feed '{}' is not configured", slug))?;
        if !feed.active {
            bail!("Feed '{}' is inactive", slug);
        }
        Ok(self.feed_report(&feed, limit).await)
    }

    /// Run exactly one stage for an episode, whatever its current status.
    ///
    /// Events are appended as a full run would append them, including a
    /// `failed` event attributed to `stage` when it fails.
    #[instrument(skip(self))]
    pub async fn run_stage_for(&self, guid: &str, stage: Stage) -> Result<StageOutcome> {
        let registry = self.db.registry();
        let episode = registry
            .episode_by_guid(guid)
            .context("Failed to look up episode")?
            .ok_or_else(|| anyhow!("No episode with guid: {}", guid))?;
        let feed = registry
            .feed_by_id(episode.feed_id)
            .context("Failed to look up feed")?
            .ok_or_else(|| anyhow!("Episode {} has no feed", guid))?;
        let feed_config = self
            .config
            .feed(&feed.slug)
            .ok_or_else(|| anyhow!("Feed '{}' is not configured", feed.slug))?;

        let ctx = FeedContext {
            feed: &feed,
            config: feed_config,
            metadata: feed.metadata.as_ref(),
        };
        if let Some(status) = self.db.events().current_status(episode.id)? {
            info!(%status, %stage, "Running stage from current status");
        }

        Ok(match self.run_stage(stage, &ctx, &episode).await {
            Ok(StageResult::Advanced(status)) => StageOutcome::Recorded(status),
            Ok(StageResult::Partial { pending }) => StageOutcome::PartiallyDelivered { pending },
            Err(e) => {
                let stage = FailedStage::from(stage);
                let error = self.append_failure(&episode, stage, e);
                StageOutcome::Failed { stage, error }
            }
        })
    }

    async fn feed_report(&self, feed: &Feed, limit: Option<usize>) -> FeedReport {
        match self.process_feed(feed, limit).await {
            Ok(episodes) => FeedReport {
                slug: feed.slug.clone(),
                episodes,
                error: None,
            },
            Err(e) => {
                error!(slug = %feed.slug, error = %format!("{:#}", e), "Feed failed");
                FeedReport::failed(&feed.slug, format!("{:#}", e))
            }
        }
    }

    #[instrument(skip_all, fields(slug = %feed.slug))]
    async fn process_feed(&self, feed: &Feed, limit: Option<usize>) -> Result<Vec<EpisodeReport>> {
        let feed_config = self
            .config
            .feed(&feed.slug)
            .ok_or_else(|| anyhow!("Feed '{}' is not configured", feed.slug))?;

        let fetch = self
            .collaborators
            .feeds
            .fetch(&feed_config.rss_url)
            .await
            .with_context(|| format!("Failed to fetch feed '{}'", feed.slug))?;

        let fresh = (!fetch.metadata.is_empty()).then_some(&fetch.metadata);
        self.db
            .registry()
            .record_poll(feed.id, fresh)
            .context("Failed to record poll")?;

        let ctx = FeedContext {
            feed,
            config: feed_config,
            metadata: fresh.or(feed.metadata.as_ref()),
        };

        let take = limit.unwrap_or(fetch.episodes.len());
        let mut reports = Vec::with_capacity(take.min(fetch.episodes.len()));
        for candidate in fetch.episodes.iter().take(take) {
            reports.push(self.process_candidate(&ctx, candidate).await);
        }
        Ok(reports)
    }

    /// Resolve identity and drive one candidate. Never fails.
    async fn process_candidate(
        &self,
        ctx: &FeedContext<'_>,
        candidate: &EpisodeCandidate,
    ) -> EpisodeReport {
        let report = |outcome| EpisodeReport {
            guid: candidate.guid.clone(),
            title: candidate.title.clone(),
            outcome,
        };

        let identity = match self.db.registry().resolve_episode(ctx.feed.id, candidate) {
            Ok(identity) => identity,
            Err(e) => {
                error!(guid = %candidate.guid, error = %e, "Failed to register episode");
                return report(EpisodeOutcome::Failed {
                    stage: resolver::failed_stage(None),
                    error: e.to_string(),
                });
            }
        };
        if identity.is_new() {
            info!(guid = %candidate.guid, title = %candidate.title, "New episode");
        }
        let episode = identity.into_episode();

        let outcome = match self.process_episode(ctx, &episode).await {
            Ok(outcome) => outcome,
            Err(e) => self.record_failure(&episode, None, e),
        };
        report(outcome)
    }

    #[instrument(skip_all, fields(guid = %episode.guid))]
    async fn process_episode(
        &self,
        ctx: &FeedContext<'_>,
        episode: &Episode,
    ) -> Result<EpisodeOutcome> {
        let status = self.db.events().current_status(episode.id)?;

        if let Some(status) = status.filter(EventStatus::is_terminal) {
            debug!(%status, "Episode already terminal");
            return Ok(EpisodeOutcome::AlreadyTerminal(status));
        }

        let limits = self.config.settings.eligibility();
        if let Err(reason) = limits.check(episode, &ctx.config.emails, status.is_some(), Utc::now()) {
            info!(title = %episode.title, %reason, "Skipping episode");
            return Ok(EpisodeOutcome::Skipped(reason));
        }

        if let Some(status) = status {
            info!(%status, "Resuming episode");
        }

        let mut current = status;
        while let Some(stage) = resolver::next_stage(current) {
            debug!(%stage, "Running stage");
            match self.run_stage(stage, ctx, episode).await {
                Ok(StageResult::Advanced(next)) => current = Some(next),
                Ok(StageResult::Partial { pending }) => {
                    warn!(pending = pending.len(), "Distribution incomplete; will retry next run");
                    return Ok(EpisodeOutcome::PartiallyDelivered { pending });
                }
                Err(e) => return Ok(self.record_failure(episode, current, e)),
            }
        }

        info!(title = %episode.title, "Episode completed");
        Ok(EpisodeOutcome::Completed)
    }

    /// Append the single `failed` event for an episode.
    ///
    /// `preceding` is the status before the failing stage; `None` with an
    /// unknown position is looked up from the store. An unreadable status
    /// attributes the failure to no stage.
    fn record_failure(
        &self,
        episode: &Episode,
        preceding: Option<EventStatus>,
        err: anyhow::Error,
    ) -> EpisodeOutcome {
        let stage = match preceding {
            Some(status) => resolver::failed_stage(Some(status)),
            None => match self.db.events().current_status(episode.id) {
                Ok(status) => resolver::failed_stage(status),
                Err(e) => {
                    warn!(guid = %episode.guid, error = %e, "Failed to read status for failure");
                    FailedStage::Unknown
                }
            },
        };

        let error = self.append_failure(episode, stage, err);
        EpisodeOutcome::Failed { stage, error }
    }

    /// Append a `failed` event attributed to `stage`; returns the message
    fn append_failure(&self, episode: &Episode, stage: FailedStage, err: anyhow::Error) -> String {
        let message = format!("{:#}", err);
        error!(guid = %episode.guid, %stage, error = %message, "Episode failed");
        if let Err(e) = self.db.events().append(
            episode.id,
            &EventPayload::failed(message.clone(), stage),
            None,
        ) {
            error!(guid = %episode.guid, error = %e, "Failed to record failure");
        }
        message
    }

    async fn run_stage(
        &self,
        stage: Stage,
        ctx: &FeedContext<'_>,
        episode: &Episode,
    ) -> Result<StageResult> {
        let status = match stage {
            Stage::Acquire => self.acquire(episode).await?,
            Stage::Enrich => self.enrich(ctx, episode).await?,
            Stage::Transform => self.transform(ctx, episode).await?,
            Stage::Produce => self.produce(ctx, episode).await?,
            Stage::Distribute => return self.distribute(ctx, episode).await,
            Stage::Complete => self.complete(episode).await?,
        };
        Ok(StageResult::Advanced(status))
    }

    async fn acquire(&self, episode: &Episode) -> Result<EventStatus> {
        let file_name = format!(
            "{}.{}",
            episode.file_stem(),
            audio_extension(&episode.content_url)
        );
        info!(title = %episode.title, "Downloading audio");

        let acquired = self
            .collaborators
            .acquirer
            .acquire(
                &episode.content_url,
                &file_name,
                self.config.settings.max_audio_file_size_mb as f64,
            )
            .await
            .context("Failed to download audio")?
            .ok_or_else(|| anyhow!("Failed to download audio"))?;

        let registry = self.db.registry();
        registry.update_file_size(episode.id, acquired.size_mb)?;
        self.db
            .events()
            .append(episode.id, &EventPayload::downloaded(&acquired.path), None)?;
        Ok(EventStatus::Downloaded)
    }

    async fn enrich(&self, ctx: &FeedContext<'_>, episode: &Episode) -> Result<EventStatus> {
        info!(title = %episode.title, "Contextualizing episode");
        let context = self
            .collaborators
            .enricher
            .enrich(EnrichRequest {
                feed_name: &ctx.config.name,
                feed: ctx.metadata,
                episode,
                prompt: &self.config.contextualize_prompt,
            })
            .await
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| anyhow!("Failed to generate context"))?;

        self.db.registry().update_context(episode.id, &context)?;
        self.db
            .events()
            .append(episode.id, &EventPayload::Contextualized, None)?;
        Ok(EventStatus::Contextualized)
    }

    async fn transform(&self, ctx: &FeedContext<'_>, episode: &Episode) -> Result<EventStatus> {
        let audio = self
            .db
            .events()
            .latest_audio_path(episode.id)?
            .ok_or_else(|| anyhow!("No downloaded audio recorded"))?;
        let output = self
            .config
            .transcripts_dir()
            .join(&ctx.feed.slug)
            .join(format!("{}.raw.txt", episode.file_stem()));
        info!(title = %episode.title, "Transcribing episode");

        let transcript = self
            .collaborators
            .transformer
            .transform(&audio, &output)
            .await
            .context("Failed to transcribe audio")?
            .ok_or_else(|| anyhow!("Failed to transcribe audio"))?;

        self.db
            .events()
            .append(episode.id, &EventPayload::transcribed(&transcript), None)?;
        Ok(EventStatus::Transcribed)
    }

    async fn produce(&self, ctx: &FeedContext<'_>, episode: &Episode) -> Result<EventStatus> {
        let transcript_path = self
            .db
            .events()
            .latest_transcript_path(episode.id)?
            .ok_or_else(|| anyhow!("No transcript recorded"))?;
        let transcript = tokio::fs::read_to_string(&transcript_path)
            .await
            .with_context(|| format!("Failed to read transcript {}", transcript_path.display()))?;

        // Context was written by the enrich stage, possibly in an earlier run
        let context = self
            .db
            .registry()
            .episode_by_id(episode.id)?
            .and_then(|e| e.context);

        info!(title = %episode.title, "Summarizing episode");
        let summary = self
            .collaborators
            .producer
            .produce(ProduceRequest {
                transcript: &transcript,
                prompt: self.config.summary_prompt(ctx.config),
                context: context.as_deref(),
                feed: ctx.metadata,
            })
            .await
            .context("Failed to generate summary")?
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| anyhow!("Failed to generate summary"))?;

        let summary_path = self
            .config
            .summaries_dir()
            .join(&ctx.feed.slug)
            .join(format!("{}.summary.md", episode.file_stem()));
        store_artifact(&summary_path, &summary).await?;

        self.db.registry().update_result(episode.id, &summary)?;
        self.db
            .events()
            .append(episode.id, &EventPayload::summarized(&summary_path), None)?;
        Ok(EventStatus::Summarized)
    }

    async fn distribute(&self, ctx: &FeedContext<'_>, episode: &Episode) -> Result<StageResult> {
        let fresh = self
            .db
            .registry()
            .episode_by_id(episode.id)?
            .ok_or_else(|| anyhow!("Episode {} disappeared", episode.id))?;
        let summary = fresh
            .result
            .as_deref()
            .ok_or_else(|| anyhow!("No summary recorded"))?;

        let artifact = Artifact {
            feed_name: &ctx.config.name,
            feed: ctx.metadata,
            episode: &fresh,
            summary,
        };

        let ledger = self.db.deliveries();
        let destinations = &ctx.config.emails;
        let mut pending = Vec::new();
        for destination in destinations {
            if ledger.already_delivered(episode.id, destination)? {
                info!(destination = %destination, "Already delivered");
            } else {
                pending.push(destination.clone());
            }
        }

        let mut failed = Vec::new();
        if !pending.is_empty() {
            info!(count = pending.len(), "Sending summary");
            let outcomes = self
                .collaborators
                .distributor
                .deliver(&artifact, &pending)
                .await
                .context("Failed to send summary")?;

            for destination in &pending {
                let outcome = outcomes.iter().find(|o| &o.destination == destination);
                match outcome {
                    Some(o) if o.delivered => {
                        ledger.record_delivered(episode.id, destination)?;
                    }
                    Some(o) => {
                        warn!(destination = %destination, error = ?o.error, "Delivery failed");
                        failed.push(destination.clone());
                    }
                    None => {
                        warn!(destination = %destination, "No delivery outcome reported");
                        failed.push(destination.clone());
                    }
                }
            }
        }

        if !failed.is_empty() {
            return Ok(StageResult::Partial { pending: failed });
        }

        let rendered = self.collaborators.distributor.render(&artifact);
        self.db.events().append(
            episode.id,
            &EventPayload::emailed(destinations.clone()),
            Some(&rendered),
        )?;
        Ok(StageResult::Advanced(EventStatus::Emailed))
    }

    async fn complete(&self, episode: &Episode) -> Result<EventStatus> {
        self.db
            .events()
            .append(episode.id, &EventPayload::Completed, None)?;

        // Best-effort; the episode stays completed either way
        match self.db.events().latest_audio_path(episode.id) {
            Ok(Some(audio)) => {
                if let Err(e) = self.collaborators.acquirer.archive(&audio).await {
                    warn!(path = %audio.display(), error = %e, "Failed to archive audio");
                }
            }
            Ok(None) => debug!("No audio to archive"),
            Err(e) => warn!(error = %e, "Failed to look up audio for archiving"),
        }
        Ok(EventStatus::Completed)
    }

    /// Delete audio belonging to failed episodes. Best-effort.
    pub async fn cleanup_failed(&self) {
        let failed = match self.db.events().failed_episodes(None) {
            Ok(failed) => failed,
            Err(e) => {
                warn!(error = %e, "Failed to list failed episodes for cleanup");
                return;
            }
        };

        let with_audio: Vec<PathBuf> = failed.into_iter().filter_map(|f| f.audio_path).collect();
        if with_audio.is_empty() {
            debug!("No failed episode audio to clean up");
            return;
        }

        info!(count = with_audio.len(), "Cleaning up audio of failed episodes");
        for path in with_audio {
            if let Err(e) = self.collaborators.acquirer.purge(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to delete audio");
            }
        }
    }

    /// Send recent failures to the administrator. Best-effort.
    pub async fn report_failures(&self) {
        let since = Utc::now() - Duration::hours(self.config.settings.failure_report_hours);
        let failed = match self.db.events().failed_episodes(Some(since)) {
            Ok(failed) => failed,
            Err(e) => {
                warn!(error = %e, "Failed to list recent failures");
                return;
            }
        };

        if failed.is_empty() {
            info!("No failed episodes to report");
            return;
        }

        info!(count = failed.len(), "Sending failure report");
        if let Err(e) = self.collaborators.distributor.report_failures(&failed).await {
            warn!(error = %format!("{:#}", e), "Failed to send failure report");
        }
    }
}

/// Extension from the URL path when it names a known audio type
fn audio_extension(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    ext.and_then(|ext| AUDIO_EXTENSIONS.iter().copied().find(|known| *known == ext))
        .unwrap_or("mp3")
}

/// Write a stage artifact to disk, creating parent directories
async fn store_artifact(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    debug!(path = %path.display(), "Stored artifact");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_extension() {
        assert_eq!(audio_extension("https://cdn.example.com/ep.m4a?token=1"), "m4a");
        assert_eq!(audio_extension("https://cdn.example.com/ep.MP3"), "mp3");
        assert_eq!(audio_extension("https://cdn.example.com/stream"), "mp3");
        assert_eq!(audio_extension("https://cdn.example.com/ep.php"), "mp3");
    }

    #[tokio::test]
    async fn test_store_artifact_creates_dirs() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("a").join("b").join("x.summary.md");
        store_artifact(&path, "hello").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
    }
}
