//! Feeds: the parent collections that produce episodes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::episode::EpisodeCandidate;

/// Descriptive metadata refreshed from the feed on every poll.
///
/// Stored as an opaque JSON blob on the feed row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
}

impl FeedMetadata {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// A feed record from the registry
#[derive(Debug, Clone, PartialEq)]
pub struct Feed {
    pub id: i64,

    /// Stable external identity (immutable)
    pub slug: String,

    pub active: bool,

    pub metadata: Option<FeedMetadata>,

    pub last_polled_at: Option<DateTime<Utc>>,
}

/// Result of polling a feed
#[derive(Debug, Clone, Default)]
pub struct FeedFetch {
    /// Candidate episodes, newest first
    pub episodes: Vec<EpisodeCandidate>,

    pub metadata: FeedMetadata,
}
