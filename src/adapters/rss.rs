//! RSS/Atom feed source.
//!
//! Fetches with reqwest and parses with feed-rs. Only entries carrying an
//! audio enclosure become candidates.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use feed_rs::model::{Entry, Feed};
use tracing::{debug, info, warn};

use super::FeedSource;
use crate::domain::{EpisodeCandidate, FeedFetch, FeedMetadata};

const USER_AGENT: &str = concat!("podmon/", env!("CARGO_PKG_VERSION"));

/// Feed source over HTTP
pub struct RssFeedSource {
    client: reqwest::Client,

    /// Only the newest N entries are considered
    check_last_n: usize,

    /// Entries longer than this are dropped
    max_length_minutes: i64,
}

impl RssFeedSource {
    pub fn new(check_last_n: usize, max_length_minutes: i64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            check_last_n,
            max_length_minutes,
        })
    }

    /// Parse a feed document into candidates and metadata
    pub fn parse(&self, body: &[u8]) -> Result<FeedFetch> {
        let feed = feed_rs::parser::parse(body).context("Failed to parse RSS/Atom feed")?;
        let metadata = extract_metadata(&feed);

        let mut episodes = Vec::new();
        for entry in feed.entries.iter().take(self.check_last_n) {
            let Some(candidate) = parse_entry(entry) else {
                continue;
            };

            if let Some(minutes) = candidate.duration_minutes {
                if minutes > self.max_length_minutes {
                    warn!(
                        title = %candidate.title,
                        minutes,
                        limit = self.max_length_minutes,
                        "Skipping episode over length limit"
                    );
                    continue;
                }
            }
            episodes.push(candidate);
        }

        Ok(FeedFetch { episodes, metadata })
    }
}

#[async_trait]
impl FeedSource for RssFeedSource {
    async fn fetch(&self, url: &str) -> Result<FeedFetch> {
        info!(url, "Fetching feed");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch feed {}", url))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("HTTP error {} fetching feed {}", status, url);
        }

        let body = response.bytes().await.context("Failed to read feed body")?;
        let fetch = self.parse(&body)?;

        if fetch.episodes.is_empty() {
            warn!(url, "No usable entries in feed");
        } else {
            info!(url, count = fetch.episodes.len(), "Parsed feed");
        }
        Ok(fetch)
    }
}

fn extract_metadata(feed: &Feed) -> FeedMetadata {
    let mut categories: Vec<String> = Vec::new();
    for category in &feed.categories {
        if !category.term.is_empty() && !categories.contains(&category.term) {
            categories.push(category.term.clone());
        }
    }

    FeedMetadata {
        title: feed.title.as_ref().map(|t| t.content.clone()),
        author: feed.authors.first().map(|p| p.name.clone()),
        description: feed.description.as_ref().map(|t| t.content.clone()),
        link: feed
            .links
            .iter()
            .find(|l| l.rel.as_deref() != Some("self"))
            .map(|l| l.href.clone()),
        image_url: feed
            .logo
            .as_ref()
            .or(feed.icon.as_ref())
            .map(|i| i.uri.clone()),
        categories,
    }
}

/// Audio URL and declared size (bytes) from enclosures, then links
fn audio_enclosure(entry: &Entry) -> Option<(String, Option<u64>)> {
    let from_media = entry.media.iter().flat_map(|m| m.content.iter()).find_map(|c| {
        let is_audio = c
            .content_type
            .as_ref()
            .map(|t| t.to_string().starts_with("audio/"))
            .unwrap_or(false);
        match (&c.url, is_audio) {
            (Some(url), true) => Some((url.to_string(), c.size)),
            _ => None,
        }
    });

    from_media.or_else(|| {
        entry
            .links
            .iter()
            .find(|l| {
                l.media_type
                    .as_deref()
                    .map(|t| t.starts_with("audio/"))
                    .unwrap_or(false)
            })
            .map(|l| (l.href.clone(), l.length))
    })
}

/// Duration rounded up to whole minutes
fn duration_minutes(entry: &Entry) -> Option<i64> {
    let duration = entry.media.iter().find_map(|m| {
        m.duration
            .or_else(|| m.content.iter().find_map(|c| c.duration))
    })?;
    let secs = duration.as_secs() as i64;
    Some(secs / 60 + i64::from(secs % 60 > 0))
}

fn artwork_url(entry: &Entry) -> Option<String> {
    entry.media.iter().find_map(|m| {
        m.thumbnails.first().map(|t| t.image.uri.clone()).or_else(|| {
            m.content
                .iter()
                .find(|c| {
                    c.content_type
                        .as_ref()
                        .map(|t| t.to_string().starts_with("image/"))
                        .unwrap_or(false)
                })
                .and_then(|c| c.url.as_ref().map(|u| u.to_string()))
        })
    })
}

fn parse_entry(entry: &Entry) -> Option<EpisodeCandidate> {
    let title = entry
        .title
        .as_ref()
        .map(|t| t.content.clone())
        .unwrap_or_default();

    if entry.id.is_empty() {
        warn!(title = %title, "Entry missing guid, skipping");
        return None;
    }

    let Some((content_url, size_bytes)) = audio_enclosure(entry) else {
        debug!(title = %title, "No audio enclosure, skipping");
        return None;
    };

    let published_at = entry
        .published
        .or(entry.updated)
        .map(|dt| dt.to_rfc3339());
    let description = entry
        .summary
        .as_ref()
        .map(|t| t.content.clone())
        .or_else(|| entry.content.as_ref().and_then(|c| c.body.clone()));
    let link = entry
        .links
        .iter()
        .find(|l| {
            !l.media_type
                .as_deref()
                .map(|t| t.starts_with("audio/"))
                .unwrap_or(false)
        })
        .map(|l| l.href.clone());
    let duration_minutes = duration_minutes(entry);

    let raw_record = serde_json::json!({
        "id": entry.id,
        "title": title,
        "published": published_at,
        "links": entry.links.iter().map(|l| l.href.clone()).collect::<Vec<_>>(),
        "enclosure": content_url,
        "enclosure_length": size_bytes,
    })
    .to_string();

    Some(EpisodeCandidate {
        guid: entry.id.clone(),
        title,
        description,
        link,
        content_url,
        artwork_url: artwork_url(entry),
        published_at,
        duration_minutes,
        file_size_mb: size_bytes
            .filter(|b| *b > 0)
            .map(|b| b as f64 / (1024.0 * 1024.0)),
        raw_record: Some(raw_record),
    })
}
