//! Episodes: the work items driven through the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Longest title fragment kept in artifact file names
const MAX_STEM_TITLE_LEN: usize = 100;

/// An item as reported by a feed source, before registration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpisodeCandidate {
    /// Globally unique item token (the deduplication key)
    pub guid: String,

    pub title: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub link: Option<String>,

    pub content_url: String,

    #[serde(default)]
    pub artwork_url: Option<String>,

    /// Published time as reported by the source (RFC 3339 when known)
    #[serde(default)]
    pub published_at: Option<String>,

    #[serde(default)]
    pub duration_minutes: Option<i64>,

    #[serde(default)]
    pub file_size_mb: Option<f64>,

    /// Raw source record kept for audit
    #[serde(default)]
    pub raw_record: Option<String>,
}

/// A registered episode
#[derive(Debug, Clone, PartialEq)]
pub struct Episode {
    pub id: i64,
    pub feed_id: i64,
    pub guid: String,
    pub title: String,
    pub description: Option<String>,
    pub link: Option<String>,
    pub content_url: String,
    pub artwork_url: Option<String>,
    pub published_at: Option<String>,
    pub duration_minutes: Option<i64>,
    pub file_size_mb: Option<f64>,

    /// Derived context from the enrich stage
    pub context: Option<String>,

    /// Final artifact text from the produce stage
    pub result: Option<String>,

    pub raw_record: Option<String>,
}

impl Episode {
    /// Published time, if the stored value parses.
    ///
    /// Accepts RFC 3339 and RFC 2822 (the common feed format).
    pub fn published(&self) -> Option<DateTime<Utc>> {
        parse_published(self.published_at.as_deref()?)
    }

    /// Base name for files derived from this episode: `yyyymmdd-title`
    pub fn file_stem(&self) -> String {
        file_stem(&self.title, self.published(), &self.guid)
    }
}

pub fn parse_published(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_rfc2822(raw))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Build a deterministic, filesystem-safe stem.
///
/// The prefix is the publish date, or the first 8 hex chars of the guid's
/// SHA-256 when the date is unknown. A title with nothing ASCII to keep is
/// replaced by the guid hash as well, so such episodes never share a stem.
pub fn file_stem(title: &str, published: Option<DateTime<Utc>>, guid: &str) -> String {
    let guid_hash = || hex::encode(&Sha256::digest(guid.as_bytes())[..4]);
    let prefix = match published {
        Some(date) => date.format("%Y%m%d").to_string(),
        None => guid_hash(),
    };

    let mut slug = String::with_capacity(title.len());
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if (c.is_whitespace() || c == '-') && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug: String = slug.trim_matches('-').chars().take(MAX_STEM_TITLE_LEN).collect();
    let slug = slug.trim_end_matches('-');

    if slug.is_empty() {
        return match published {
            Some(_) => format!("{}-{}", prefix, guid_hash()),
            None => prefix,
        };
    }
    format!("{}-{}", prefix, slug)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_file_stem_with_date() {
        let published = Utc.with_ymd_and_hms(2024, 3, 15, 9, 0, 0).unwrap();
        let stem = file_stem("Episode 42: The  Answer!", Some(published), "guid-1");
        assert_eq!(stem, "20240315-episode-42-the-answer");
    }

    #[test]
    fn test_file_stem_falls_back_to_guid_hash() {
        let a = file_stem("Same Title", None, "guid-a");
        let b = file_stem("Same Title", None, "guid-a");
        let c = file_stem("Same Title", None, "guid-b");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.ends_with("-same-title"));
        assert_eq!(a.split('-').next().unwrap().len(), 8);
    }

    #[test]
    fn test_file_stem_without_ascii_title_uses_guid() {
        let published = Utc.with_ymd_and_hms(2024, 3, 15, 9, 0, 0).unwrap();
        let a = file_stem("第一回 🎙", Some(published), "guid-a");
        let b = file_stem("第二回 🎙", Some(published), "guid-b");

        assert_ne!(a, b);
        assert!(a.starts_with("20240315-"));
        assert!(!a.ends_with('-'));
        assert_eq!(a.len(), "20240315-".len() + 8);

        let undated = file_stem("🎙", None, "guid-a");
        assert_eq!(undated.len(), 8);
        assert!(!undated.ends_with('-'));
    }

    #[test]
    fn test_file_stem_truncates_long_titles() {
        let title = "word ".repeat(60);
        let stem = file_stem(&title, None, "g");
        assert!(stem.len() <= 9 + MAX_STEM_TITLE_LEN);
        assert!(!stem.ends_with('-'));
    }

    #[test]
    fn test_parse_published_formats() {
        assert!(parse_published("2024-03-15T09:00:00Z").is_some());
        assert!(parse_published("Fri, 15 Mar 2024 09:00:00 +0000").is_some());
        assert!(parse_published("last tuesday").is_none());
    }
}
