//! Shared fixtures: an in-memory database, a config rooted in a temp dir
//! and scripted collaborators that count their calls.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use podmon::adapters::{
    Acquired, Artifact, Collaborators, ContentAcquirer, DeliveryOutcome, Distributor,
    EnrichRequest, Enricher, FeedSource, ProduceRequest, Producer, Transformer,
};
use podmon::config::{Config, Secrets};
use podmon::core::{Database, FailedEpisode, Orchestrator, RunReport};
use podmon::domain::{EpisodeCandidate, FeedFetch, FeedMetadata};

pub const ALPHA_URL: &str = "https://feeds.example.com/alpha.xml";
pub const BETA_URL: &str = "https://feeds.example.com/beta.xml";

const PODCASTS: &str = r#"
podcasts:
  - name: Alpha Show
    slug: alpha
    rss_url: https://feeds.example.com/alpha.xml
    active: true
    emails:
      - a@example.com
      - b@example.com
  - name: Beta Show
    slug: beta
    rss_url: https://feeds.example.com/beta.xml
    active: true
    emails:
      - c@example.com
  - name: Gamma Show
    slug: gamma
    rss_url: https://feeds.example.com/gamma.xml
    active: false
    emails:
      - d@example.com
"#;

const APP: &str = r#"
settings:
  system_email: admin@example.com
summary_default_prompt: Summarize the episode.
summary_system_prompt: You write podcast summaries.
default_contextualize_prompt: Describe the episode.
"#;

/// What the scripted collaborators return and how often they were called
#[derive(Default)]
pub struct Fakes {
    pub feeds: Mutex<HashMap<String, Vec<EpisodeCandidate>>>,
    pub broken_feeds: Mutex<HashSet<String>>,
    pub failing_downloads: Mutex<HashSet<String>>,
    pub failing_destinations: Mutex<HashSet<String>>,
    pub fail_transform: AtomicBool,

    pub fetches: AtomicUsize,
    pub acquires: AtomicUsize,
    pub enriches: AtomicUsize,
    pub transforms: AtomicUsize,
    pub produces: AtomicUsize,
    pub deliver_calls: AtomicUsize,
    pub archives: AtomicUsize,
    pub purges: AtomicUsize,
    pub failure_reports: AtomicUsize,

    /// Every destination that received a message, in send order
    pub delivered: Mutex<Vec<String>>,
}

impl Fakes {
    pub fn publish(&self, feed_url: &str, candidates: Vec<EpisodeCandidate>) {
        self.feeds
            .lock()
            .unwrap()
            .insert(feed_url.to_string(), candidates);
    }

    pub fn break_feed(&self, feed_url: &str) {
        self.broken_feeds.lock().unwrap().insert(feed_url.to_string());
    }

    pub fn fail_download(&self, content_url: &str) {
        self.failing_downloads
            .lock()
            .unwrap()
            .insert(content_url.to_string());
    }

    pub fn fail_destination(&self, destination: &str) {
        self.failing_destinations
            .lock()
            .unwrap()
            .insert(destination.to_string());
    }

    pub fn heal_destination(&self, destination: &str) {
        self.failing_destinations.lock().unwrap().remove(destination);
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct Harness {
    pub temp: TempDir,
    pub db: Database,
    pub config: Config,
    pub fakes: Arc<Fakes>,
}

impl Harness {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let config = Config::from_yaml(
            Path::new("podcasts.yaml"),
            PODCASTS,
            Path::new("config.yaml"),
            APP,
            temp.path().to_path_buf(),
            Secrets::default(),
        )
        .unwrap();

        Self {
            db: Database::in_memory().unwrap(),
            config,
            fakes: Arc::new(Fakes::default()),
            temp,
        }
    }

    /// Same fixtures over a database file, for tests that need a second
    /// connection; returns the file path
    pub fn on_disk() -> (Self, PathBuf) {
        let mut harness = Self::new();
        let path = harness.temp.path().join("podmon.db");
        harness.db = Database::open(&path).unwrap();
        (harness, path)
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            feeds: Box::new(FakeFeeds(self.fakes.clone())),
            acquirer: Box::new(FakeAcquirer {
                fakes: self.fakes.clone(),
                dir: self.config.audio_dir(),
            }),
            enricher: Box::new(FakeEnricher(self.fakes.clone())),
            transformer: Box::new(FakeTransformer(self.fakes.clone())),
            producer: Box::new(FakeProducer(self.fakes.clone())),
            distributor: Box::new(FakeDistributor(self.fakes.clone())),
        }
    }

    pub async fn run(&self) -> RunReport {
        Orchestrator::new(&self.db, &self.config, self.collaborators())
            .run()
            .await
            .unwrap()
    }

    pub fn episode_id(&self, guid: &str) -> i64 {
        self.db
            .registry()
            .episode_by_guid(guid)
            .unwrap()
            .unwrap_or_else(|| panic!("episode {} not registered", guid))
            .id
    }
}

/// A candidate published an hour ago
pub fn candidate(guid: &str) -> EpisodeCandidate {
    EpisodeCandidate {
        guid: guid.to_string(),
        title: format!("Episode {}", guid),
        description: Some(format!("All about {}", guid)),
        content_url: content_url(guid),
        published_at: Some((Utc::now() - chrono::Duration::hours(1)).to_rfc3339()),
        duration_minutes: Some(42),
        ..Default::default()
    }
}

pub fn content_url(guid: &str) -> String {
    format!("https://cdn.example.com/{}.mp3", guid)
}

struct FakeFeeds(Arc<Fakes>);

#[async_trait]
impl FeedSource for FakeFeeds {
    async fn fetch(&self, url: &str) -> Result<FeedFetch> {
        self.0.fetches.fetch_add(1, Ordering::SeqCst);
        if self.0.broken_feeds.lock().unwrap().contains(url) {
            return Err(anyhow!("HTTP error 500 for {}", url));
        }
        let episodes = self
            .0
            .feeds
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_default();
        Ok(FeedFetch {
            episodes,
            metadata: FeedMetadata {
                title: Some("A Show".to_string()),
                ..Default::default()
            },
        })
    }
}

struct FakeAcquirer {
    fakes: Arc<Fakes>,
    dir: PathBuf,
}

#[async_trait]
impl ContentAcquirer for FakeAcquirer {
    async fn acquire(
        &self,
        url: &str,
        file_name: &str,
        _max_size_mb: f64,
    ) -> Result<Option<Acquired>> {
        self.fakes.acquires.fetch_add(1, Ordering::SeqCst);
        if self.fakes.failing_downloads.lock().unwrap().contains(url) {
            return Ok(None);
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(file_name);
        tokio::fs::write(&path, b"ID3 audio").await?;
        Ok(Some(Acquired { path, size_mb: 1.5 }))
    }

    async fn archive(&self, _path: &Path) -> Result<()> {
        self.fakes.archives.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn purge(&self, path: &Path) -> Result<()> {
        self.fakes.purges.fetch_add(1, Ordering::SeqCst);
        let _ = tokio::fs::remove_file(path).await;
        Ok(())
    }
}

struct FakeEnricher(Arc<Fakes>);

#[async_trait]
impl Enricher for FakeEnricher {
    async fn enrich(&self, request: EnrichRequest<'_>) -> Option<String> {
        self.0.enriches.fetch_add(1, Ordering::SeqCst);
        Some(format!("Context for {}", request.episode.title))
    }
}

struct FakeTransformer(Arc<Fakes>);

#[async_trait]
impl Transformer for FakeTransformer {
    async fn transform(&self, _input: &Path, output: &Path) -> Result<Option<PathBuf>> {
        self.0.transforms.fetch_add(1, Ordering::SeqCst);
        if self.0.fail_transform.load(Ordering::SeqCst) {
            return Err(anyhow!("speech-to-text provider unavailable"));
        }
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(output, "Speaker A: hello").await?;
        Ok(Some(output.to_path_buf()))
    }
}

struct FakeProducer(Arc<Fakes>);

#[async_trait]
impl Producer for FakeProducer {
    async fn produce(&self, request: ProduceRequest<'_>) -> Result<Option<String>> {
        self.0.produces.fetch_add(1, Ordering::SeqCst);
        Ok(Some(format!(
            "Summary of [{}] with [{}]",
            request.transcript,
            request.context.unwrap_or("no context")
        )))
    }
}

struct FakeDistributor(Arc<Fakes>);

#[async_trait]
impl Distributor for FakeDistributor {
    fn render(&self, artifact: &Artifact<'_>) -> String {
        format!("<h1>{}</h1><p>{}</p>", artifact.episode.title, artifact.summary)
    }

    async fn deliver(
        &self,
        _artifact: &Artifact<'_>,
        destinations: &[String],
    ) -> Result<Vec<DeliveryOutcome>> {
        self.0.deliver_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self.0.failing_destinations.lock().unwrap().clone();
        let mut delivered = self.0.delivered.lock().unwrap();

        Ok(destinations
            .iter()
            .map(|d| {
                if failing.contains(d) {
                    DeliveryOutcome::failed(d.clone(), "mailbox unavailable")
                } else {
                    delivered.push(d.clone());
                    DeliveryOutcome::delivered(d.clone())
                }
            })
            .collect())
    }

    async fn report_failures(&self, _failures: &[FailedEpisode]) -> Result<()> {
        self.0.failure_reports.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
