//! Item registry: feeds and the episodes they produce.
//!
//! Episodes are keyed by their external guid. The UNIQUE constraint on
//! `episodes.episode_guid` is the only creation boundary; re-seeing a guid
//! resolves to the existing row.

use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info, warn};

use crate::domain::{Episode, EpisodeCandidate, Feed, FeedMetadata};

use super::db::{is_unique_violation, now_timestamp, parse_timestamp, Database, StoreError};

const FEED_COLUMNS: &str = "id, slug, active, metadata, last_polled_at";

const EPISODE_COLUMNS: &str = "id, feed_id, episode_guid, title, description, link, content_url, \
     artwork_url, published_at, duration_minutes, file_size_mb, context, result, raw_record";

/// Outcome of resolving a candidate against the registry
#[derive(Debug, Clone, PartialEq)]
pub enum EpisodeIdentity {
    /// First sighting: a new row was inserted
    Created(Episode),

    /// The guid was already registered
    Existing(Episode),
}

impl EpisodeIdentity {
    pub fn episode(&self) -> &Episode {
        match self {
            Self::Created(episode) | Self::Existing(episode) => episode,
        }
    }

    pub fn into_episode(self) -> Episode {
        match self {
            Self::Created(episode) | Self::Existing(episode) => episode,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// View over the `feeds` and `episodes` tables
pub struct Registry<'a> {
    db: &'a Database,
}

struct RawFeed {
    id: i64,
    slug: String,
    active: bool,
    metadata: Option<String>,
    last_polled_at: Option<String>,
}

impl RawFeed {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            slug: row.get(1)?,
            active: row.get(2)?,
            metadata: row.get(3)?,
            last_polled_at: row.get(4)?,
        })
    }

    fn into_feed(self) -> Result<Feed, StoreError> {
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str::<FeedMetadata>)
            .transpose()?;
        let last_polled_at = self
            .last_polled_at
            .as_deref()
            .map(parse_timestamp)
            .transpose()?;

        Ok(Feed {
            id: self.id,
            slug: self.slug,
            active: self.active,
            metadata,
            last_polled_at,
        })
    }
}

fn episode_from_row(row: &Row<'_>) -> rusqlite::Result<Episode> {
    Ok(Episode {
        id: row.get(0)?,
        feed_id: row.get(1)?,
        guid: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        link: row.get(5)?,
        content_url: row.get(6)?,
        artwork_url: row.get(7)?,
        published_at: row.get(8)?,
        duration_minutes: row.get(9)?,
        file_size_mb: row.get(10)?,
        context: row.get(11)?,
        result: row.get(12)?,
        raw_record: row.get(13)?,
    })
}

impl<'a> Registry<'a> {
    pub(crate) fn new(db: &'a Database) -> Self {
        Self { db }
    }

    // ---- feeds ----

    /// Insert a feed or update its active flag. Returns the feed id.
    pub fn upsert_feed(&self, slug: &str, active: bool) -> Result<i64, StoreError> {
        let now = now_timestamp();
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO feeds (slug, active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(slug) DO UPDATE SET active = excluded.active, updated_at = excluded.updated_at",
            params![slug, active, now],
        )?;
        let id = conn.query_row(
            "SELECT id FROM feeds WHERE slug = ?1",
            params![slug],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Mirror configuration into the registry.
    ///
    /// Every configured slug is upserted with its active flag. Stored slugs
    /// missing from `configured` are deactivated, never deleted. Returns the
    /// number of feeds deactivated that way.
    pub fn sync_feeds(&self, configured: &[(&str, bool)]) -> Result<usize, StoreError> {
        for (slug, active) in configured {
            self.upsert_feed(slug, *active)?;
        }

        let stale: Vec<String> = {
            let conn = self.db.conn()?;
            let mut stmt = conn.prepare("SELECT slug FROM feeds WHERE active = 1")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
        .into_iter()
        .filter(|slug| !configured.iter().any(|(s, _)| s == slug))
        .collect();

        if !stale.is_empty() {
            let now = now_timestamp();
            let conn = self.db.conn()?;
            for slug in &stale {
                conn.execute(
                    "UPDATE feeds SET active = 0, updated_at = ?1 WHERE slug = ?2",
                    params![now, slug],
                )?;
                info!(slug = %slug, "Deactivated feed missing from configuration");
            }
        }

        Ok(stale.len())
    }

    /// Active feeds in storage order
    pub fn active_feeds(&self) -> Result<Vec<Feed>, StoreError> {
        let raws = {
            let conn = self.db.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {FEED_COLUMNS} FROM feeds WHERE active = 1 ORDER BY id"
            ))?;
            let rows = stmt.query_map([], RawFeed::from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        raws.into_iter().map(RawFeed::into_feed).collect()
    }

    pub fn feed_by_slug(&self, slug: &str) -> Result<Option<Feed>, StoreError> {
        self.feed_where("slug = ?1", params![slug])
    }

    pub fn feed_by_id(&self, id: i64) -> Result<Option<Feed>, StoreError> {
        self.feed_where("id = ?1", params![id])
    }

    fn feed_where(
        &self,
        clause: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Option<Feed>, StoreError> {
        let raw = {
            let conn = self.db.conn()?;
            conn.query_row(
                &format!("SELECT {FEED_COLUMNS} FROM feeds WHERE {clause}"),
                args,
                RawFeed::from_row,
            )
            .optional()?
        };
        raw.map(RawFeed::into_feed).transpose()
    }

    /// Stamp a poll; replaces the metadata blob when one is supplied
    pub fn record_poll(
        &self,
        feed_id: i64,
        metadata: Option<&FeedMetadata>,
    ) -> Result<(), StoreError> {
        let now = now_timestamp();
        let conn = self.db.conn()?;
        match metadata {
            Some(metadata) => {
                conn.execute(
                    "UPDATE feeds SET metadata = ?1, last_polled_at = ?2, updated_at = ?2 WHERE id = ?3",
                    params![serde_json::to_string(metadata)?, now, feed_id],
                )?;
            }
            None => {
                conn.execute(
                    "UPDATE feeds SET last_polled_at = ?1, updated_at = ?1 WHERE id = ?2",
                    params![now, feed_id],
                )?;
            }
        }
        Ok(())
    }

    // ---- episodes ----

    pub fn episode_by_guid(&self, guid: &str) -> Result<Option<Episode>, StoreError> {
        let conn = self.db.conn()?;
        Ok(conn
            .query_row(
                &format!("SELECT {EPISODE_COLUMNS} FROM episodes WHERE episode_guid = ?1"),
                params![guid],
                episode_from_row,
            )
            .optional()?)
    }

    pub fn episode_by_id(&self, id: i64) -> Result<Option<Episode>, StoreError> {
        let conn = self.db.conn()?;
        Ok(conn
            .query_row(
                &format!("SELECT {EPISODE_COLUMNS} FROM episodes WHERE id = ?1"),
                params![id],
                episode_from_row,
            )
            .optional()?)
    }

    /// Insert a new episode row. A known guid is rejected with
    /// [`StoreError::DuplicateGuid`].
    pub fn insert_episode(
        &self,
        feed_id: i64,
        candidate: &EpisodeCandidate,
    ) -> Result<i64, StoreError> {
        let now = now_timestamp();
        let conn = self.db.conn()?;
        let inserted = conn.execute(
            "INSERT INTO episodes (
                feed_id, episode_guid, title, description, link, content_url, artwork_url,
                published_at, duration_minutes, file_size_mb, raw_record, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
            params![
                feed_id,
                candidate.guid,
                candidate.title,
                candidate.description,
                candidate.link,
                candidate.content_url,
                candidate.artwork_url,
                candidate.published_at,
                candidate.duration_minutes,
                candidate.file_size_mb,
                candidate.raw_record,
                now
            ],
        );

        match inserted {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => {
                Err(StoreError::DuplicateGuid(candidate.guid.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Look up a candidate by guid, creating the episode on first sight
    pub fn resolve_episode(
        &self,
        feed_id: i64,
        candidate: &EpisodeCandidate,
    ) -> Result<EpisodeIdentity, StoreError> {
        if let Some(existing) = self.episode_by_guid(&candidate.guid)? {
            if existing.feed_id != feed_id {
                warn!(
                    guid = %candidate.guid,
                    owner = existing.feed_id,
                    seen_in = feed_id,
                    "Episode guid already owned by another feed"
                );
            }
            return Ok(EpisodeIdentity::Existing(existing));
        }

        match self.insert_episode(feed_id, candidate) {
            Ok(id) => {
                debug!(guid = %candidate.guid, episode_id = id, "Registered new episode");
                let episode = self
                    .episode_by_id(id)?
                    .ok_or_else(|| StoreError::DuplicateGuid(candidate.guid.clone()))?;
                Ok(EpisodeIdentity::Created(episode))
            }
            // Lost a race with another insert of the same guid
            Err(StoreError::DuplicateGuid(guid)) => self
                .episode_by_guid(&guid)?
                .map(EpisodeIdentity::Existing)
                .ok_or(StoreError::DuplicateGuid(guid)),
            Err(e) => Err(e),
        }
    }

    pub fn update_file_size(&self, episode_id: i64, file_size_mb: f64) -> Result<(), StoreError> {
        self.update_column(episode_id, "file_size_mb", &file_size_mb)
    }

    pub fn update_context(&self, episode_id: i64, context: &str) -> Result<(), StoreError> {
        self.update_column(episode_id, "context", &context)
    }

    pub fn update_result(&self, episode_id: i64, result: &str) -> Result<(), StoreError> {
        self.update_column(episode_id, "result", &result)
    }

    fn update_column(
        &self,
        episode_id: i64,
        column: &'static str,
        value: &dyn rusqlite::ToSql,
    ) -> Result<(), StoreError> {
        let conn = self.db.conn()?;
        conn.execute(
            &format!("UPDATE episodes SET {column} = ?1, updated_at = ?2 WHERE id = ?3"),
            params![value, now_timestamp(), episode_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(guid: &str) -> EpisodeCandidate {
        EpisodeCandidate {
            guid: guid.to_string(),
            title: format!("Episode {guid}"),
            content_url: format!("https://example.com/{guid}.mp3"),
            published_at: Some("2024-03-15T09:00:00Z".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_upsert_feed_is_stable() {
        let db = Database::in_memory().unwrap();
        let a = db.registry().upsert_feed("show", true).unwrap();
        let b = db.registry().upsert_feed("show", false).unwrap();
        assert_eq!(a, b);
        assert!(!db.registry().feed_by_slug("show").unwrap().unwrap().active);
    }

    #[test]
    fn test_sync_deactivates_unconfigured_feeds() {
        let db = Database::in_memory().unwrap();
        let registry = db.registry();
        registry.sync_feeds(&[("a", true), ("b", true)]).unwrap();

        let deactivated = registry.sync_feeds(&[("a", true)]).unwrap();
        assert_eq!(deactivated, 1);

        let active: Vec<String> = registry
            .active_feeds()
            .unwrap()
            .into_iter()
            .map(|f| f.slug)
            .collect();
        assert_eq!(active, vec!["a".to_string()]);
        assert!(registry.feed_by_slug("b").unwrap().is_some());
    }

    #[test]
    fn test_record_poll_replaces_metadata() {
        let db = Database::in_memory().unwrap();
        let registry = db.registry();
        let id = registry.upsert_feed("show", true).unwrap();

        let metadata = FeedMetadata {
            author: Some("Host".to_string()),
            ..Default::default()
        };
        registry.record_poll(id, Some(&metadata)).unwrap();
        registry.record_poll(id, None).unwrap();

        let feed = registry.feed_by_id(id).unwrap().unwrap();
        assert_eq!(feed.metadata, Some(metadata));
        assert!(feed.last_polled_at.is_some());
    }

    #[test]
    fn test_duplicate_guid_is_rejected() {
        let db = Database::in_memory().unwrap();
        let registry = db.registry();
        let feed_id = registry.upsert_feed("show", true).unwrap();

        registry.insert_episode(feed_id, &candidate("g1")).unwrap();
        let err = registry.insert_episode(feed_id, &candidate("g1")).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateGuid(ref g) if g == "g1"));
    }

    #[test]
    fn test_unknown_feed_is_not_a_duplicate() {
        let db = Database::in_memory().unwrap();
        let err = db.registry().insert_episode(42, &candidate("g1")).unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
    }

    #[test]
    fn test_resolve_returns_original_identity() {
        let db = Database::in_memory().unwrap();
        let registry = db.registry();
        let feed_id = registry.upsert_feed("show", true).unwrap();

        let first = registry.resolve_episode(feed_id, &candidate("g1")).unwrap();
        assert!(first.is_new());

        let mut changed = candidate("g1");
        changed.title = "Retitled".to_string();
        let second = registry.resolve_episode(feed_id, &changed).unwrap();
        assert!(!second.is_new());
        assert_eq!(second.episode().id, first.episode().id);
        assert_eq!(second.episode().title, "Episode g1");
    }

    #[test]
    fn test_updates_land_on_row() {
        let db = Database::in_memory().unwrap();
        let registry = db.registry();
        let feed_id = registry.upsert_feed("show", true).unwrap();
        let id = registry.insert_episode(feed_id, &candidate("g1")).unwrap();

        registry.update_file_size(id, 12.5).unwrap();
        registry.update_context(id, "context").unwrap();
        registry.update_result(id, "summary").unwrap();

        let episode = registry.episode_by_id(id).unwrap().unwrap();
        assert_eq!(episode.file_size_mb, Some(12.5));
        assert_eq!(episode.context.as_deref(), Some("context"));
        assert_eq!(episode.result.as_deref(), Some("summary"));
    }
}
