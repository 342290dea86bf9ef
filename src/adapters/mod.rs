//! Collaborator interfaces for external systems.
//!
//! Each pipeline stage calls exactly one collaborator and awaits a single
//! result. Polling, retries inside a provider call and file handling stay
//! inside the adapter. `Ok(None)` and `Err(_)` both mean the stage failed;
//! the orchestrator does not distinguish the two.

pub mod assemblyai;
pub mod chat;
pub mod downloader;
pub mod resend;
pub mod rss;
pub mod whisper;

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::core::event_store::FailedEpisode;
use crate::domain::{Episode, FeedFetch, FeedMetadata};

pub use assemblyai::AssemblyAiTranscriber;
pub use chat::{ChatClient, ChatEnricher, ChatProducer};
pub use downloader::HttpAcquirer;
pub use resend::ResendDistributor;
pub use rss::RssFeedSource;
pub use whisper::WhisperTranscriber;

/// Content fetched to local storage
#[derive(Debug, Clone, PartialEq)]
pub struct Acquired {
    pub path: PathBuf,

    /// Measured size on disk
    pub size_mb: f64,
}

/// Inputs for the enrich stage
#[derive(Debug, Clone, Copy)]
pub struct EnrichRequest<'a> {
    pub feed_name: &'a str,
    pub feed: Option<&'a FeedMetadata>,
    pub episode: &'a Episode,
    pub prompt: &'a str,
}

/// Inputs for the produce stage
#[derive(Debug, Clone, Copy)]
pub struct ProduceRequest<'a> {
    pub transcript: &'a str,
    pub prompt: &'a str,

    /// Output of the enrich stage, if any
    pub context: Option<&'a str>,

    pub feed: Option<&'a FeedMetadata>,
}

/// The final artifact as handed to the distributor
#[derive(Debug, Clone, Copy)]
pub struct Artifact<'a> {
    pub feed_name: &'a str,
    pub feed: Option<&'a FeedMetadata>,
    pub episode: &'a Episode,
    pub summary: &'a str,
}

/// Per-destination result of a distribution call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub destination: String,
    pub delivered: bool,
    pub error: Option<String>,
}

impl DeliveryOutcome {
    pub fn delivered(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            delivered: true,
            error: None,
        }
    }

    pub fn failed(destination: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            delivered: false,
            error: Some(error.into()),
        }
    }
}

/// Polls a feed for candidate episodes
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Candidates newest first. An empty list is not an error.
    async fn fetch(&self, url: &str) -> Result<FeedFetch>;
}

/// Fetches source content to local storage
#[async_trait]
pub trait ContentAcquirer: Send + Sync {
    /// Fetch `url` as `file_name`. `None` when the fetch failed or the
    /// content exceeded `max_size_mb`; no partial file is left behind.
    async fn acquire(&self, url: &str, file_name: &str, max_size_mb: f64)
        -> Result<Option<Acquired>>;

    /// Move fetched content out of the working area once processing is done
    async fn archive(&self, path: &Path) -> Result<()>;

    /// Delete fetched content wherever it currently lives
    async fn purge(&self, path: &Path) -> Result<()>;
}

/// Generates descriptive context from metadata.
///
/// Provider errors collapse to `None`; this call never fails loudly.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, request: EnrichRequest<'_>) -> Option<String>;
}

/// Turns fetched content into text (speech-to-text)
#[async_trait]
pub trait Transformer: Send + Sync {
    /// Write the text to `output` and return its path
    async fn transform(&self, input: &Path, output: &Path) -> Result<Option<PathBuf>>;
}

/// Produces the final artifact text
#[async_trait]
pub trait Producer: Send + Sync {
    async fn produce(&self, request: ProduceRequest<'_>) -> Result<Option<String>>;
}

/// Delivers the artifact to destinations
#[async_trait]
pub trait Distributor: Send + Sync {
    /// Rendered form of the artifact, kept alongside the `emailed` event
    fn render(&self, artifact: &Artifact<'_>) -> String;

    /// One outcome per requested destination, in request order
    async fn deliver(
        &self,
        artifact: &Artifact<'_>,
        destinations: &[String],
    ) -> Result<Vec<DeliveryOutcome>>;

    /// Send a digest of recent failures to the administrator
    async fn report_failures(&self, failures: &[FailedEpisode]) -> Result<()> {
        info!(count = failures.len(), "Failure report not supported by distributor");
        Ok(())
    }
}

/// The collaborator set handed to the orchestrator
pub struct Collaborators {
    pub feeds: Box<dyn FeedSource>,
    pub acquirer: Box<dyn ContentAcquirer>,
    pub enricher: Box<dyn Enricher>,
    pub transformer: Box<dyn Transformer>,
    pub producer: Box<dyn Producer>,
    pub distributor: Box<dyn Distributor>,
}
