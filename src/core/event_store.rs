//! Append-only event store backed by SQLite.
//!
//! Events are never updated or deleted. The current status of an episode
//! is the status of its most recently created event, ties broken by
//! insertion order.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use crate::domain::events::{DownloadedData, FailedData};
use crate::domain::{Event, EventPayload, EventStatus, FailedStage};

use super::db::{format_timestamp, now_timestamp, parse_timestamp, Database, StoreError};

const EVENT_COLUMNS: &str =
    "id, episode_id, status, event_data, additional_details, created_at";

/// View over the `processing_events` table
pub struct EventStore<'a> {
    db: &'a Database,
}

/// An episode whose latest event is `failed`
#[derive(Debug, Clone, PartialEq)]
pub struct FailedEpisode {
    pub episode_id: i64,
    pub feed_slug: String,
    pub guid: String,
    pub title: String,
    pub error_message: String,
    pub failed_stage: FailedStage,

    /// Audio from the most recent `downloaded` event, if any
    pub audio_path: Option<PathBuf>,

    pub failed_at: DateTime<Utc>,
}

/// Row as stored, before payload decoding
struct RawEvent {
    id: i64,
    episode_id: i64,
    status: String,
    data: Option<String>,
    details: Option<String>,
    created_at: String,
}

impl RawEvent {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            episode_id: row.get(1)?,
            status: row.get(2)?,
            data: row.get(3)?,
            details: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_event(self) -> Result<Event, StoreError> {
        let status = parse_status(self.id, &self.status)?;
        let payload = EventPayload::from_parts(status, self.data.as_deref())
            .map_err(|source| StoreError::CorruptPayload { id: self.id, source })?;

        Ok(Event {
            id: self.id,
            episode_id: self.episode_id,
            payload,
            additional_details: self.details,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

fn parse_status(id: i64, raw: &str) -> Result<EventStatus, StoreError> {
    raw.parse().map_err(|e: crate::domain::events::UnknownStatus| {
        StoreError::CorruptEvent {
            id,
            reason: e.to_string(),
        }
    })
}

impl<'a> EventStore<'a> {
    pub(crate) fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Append an event to the log.
    ///
    /// No successor validation happens here; stage ordering is the
    /// orchestrator's job.
    pub fn append(
        &self,
        episode_id: i64,
        payload: &EventPayload,
        additional_details: Option<&str>,
    ) -> Result<Event, StoreError> {
        let data = payload.data_json()?;
        let created_at = now_timestamp();

        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO processing_events (episode_id, status, event_data, additional_details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                episode_id,
                payload.status().as_str(),
                data,
                additional_details,
                created_at
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(episode_id, event_id = id, status = %payload.status(), "Appended event");

        Ok(Event {
            id,
            episode_id,
            payload: payload.clone(),
            additional_details: additional_details.map(str::to_string),
            created_at: parse_timestamp(&created_at)?,
        })
    }

    /// The single most recent event for an episode
    pub fn latest(&self, episode_id: i64) -> Result<Option<Event>, StoreError> {
        let raw = {
            let conn = self.db.conn()?;
            conn.query_row(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM processing_events
                     WHERE episode_id = ?1
                     ORDER BY created_at DESC, id DESC
                     LIMIT 1"
                ),
                params![episode_id],
                RawEvent::from_row,
            )
            .optional()?
        };
        raw.map(RawEvent::into_event).transpose()
    }

    /// All events for an episode, newest first, optionally one status only
    pub fn all(
        &self,
        episode_id: i64,
        status: Option<EventStatus>,
    ) -> Result<Vec<Event>, StoreError> {
        let raws = {
            let conn = self.db.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM processing_events
                 WHERE episode_id = ?1 AND (?2 IS NULL OR status = ?2)
                 ORDER BY created_at DESC, id DESC"
            ))?;
            let rows = stmt.query_map(
                params![episode_id, status.map(|s| s.as_str())],
                RawEvent::from_row,
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        raws.into_iter().map(RawEvent::into_event).collect()
    }

    /// Most recent event with the given status, even if later events exist
    pub fn latest_of(
        &self,
        episode_id: i64,
        status: EventStatus,
    ) -> Result<Option<Event>, StoreError> {
        let raw = {
            let conn = self.db.conn()?;
            conn.query_row(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM processing_events
                     WHERE episode_id = ?1 AND status = ?2
                     ORDER BY created_at DESC, id DESC
                     LIMIT 1"
                ),
                params![episode_id, status.as_str()],
                RawEvent::from_row,
            )
            .optional()?
        };
        raw.map(RawEvent::into_event).transpose()
    }

    /// Status of the latest event (reads only the status column)
    pub fn current_status(&self, episode_id: i64) -> Result<Option<EventStatus>, StoreError> {
        let conn = self.db.conn()?;
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, status FROM processing_events
                 WHERE episode_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT 1",
                params![episode_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        row.map(|(id, status)| parse_status(id, &status)).transpose()
    }

    /// Audio path recorded by the most recent `downloaded` event
    pub fn latest_audio_path(&self, episode_id: i64) -> Result<Option<PathBuf>, StoreError> {
        Ok(match self.latest_of(episode_id, EventStatus::Downloaded)? {
            Some(Event {
                payload: EventPayload::Downloaded(data),
                ..
            }) => Some(data.audio_path),
            _ => None,
        })
    }

    /// Transcript path recorded by the most recent `transcribed` event
    pub fn latest_transcript_path(&self, episode_id: i64) -> Result<Option<PathBuf>, StoreError> {
        Ok(match self.latest_of(episode_id, EventStatus::Transcribed)? {
            Some(Event {
                payload: EventPayload::Transcribed(data),
                ..
            }) => Some(data.transcript_path),
            _ => None,
        })
    }

    /// Episodes whose latest event is `failed`, newest failure first.
    ///
    /// `since` limits the result to failures recorded at or after that time.
    pub fn failed_episodes(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<FailedEpisode>, StoreError> {
        struct RawFailure {
            event_id: i64,
            episode_id: i64,
            slug: String,
            guid: String,
            title: String,
            data: Option<String>,
            failed_at: String,
            download: Option<String>,
        }

        let raws = {
            let conn = self.db.conn()?;
            let mut stmt = conn.prepare(
                "SELECT pe.id, e.id, f.slug, e.episode_guid, e.title, pe.event_data, pe.created_at,
                        (SELECT d.event_data FROM processing_events d
                         WHERE d.episode_id = e.id AND d.status = 'downloaded'
                         ORDER BY d.created_at DESC, d.id DESC LIMIT 1)
                 FROM processing_events pe
                 JOIN episodes e ON pe.episode_id = e.id
                 JOIN feeds f ON e.feed_id = f.id
                 WHERE pe.status = 'failed'
                   AND (?1 IS NULL OR pe.created_at >= ?1)
                   AND pe.id = (
                       SELECT pe2.id FROM processing_events pe2
                       WHERE pe2.episode_id = pe.episode_id
                       ORDER BY pe2.created_at DESC, pe2.id DESC
                       LIMIT 1
                   )
                 ORDER BY pe.created_at DESC, pe.id DESC",
            )?;
            let rows = stmt.query_map(params![since.map(format_timestamp)], |row| {
                Ok(RawFailure {
                    event_id: row.get(0)?,
                    episode_id: row.get(1)?,
                    slug: row.get(2)?,
                    guid: row.get(3)?,
                    title: row.get(4)?,
                    data: row.get(5)?,
                    failed_at: row.get(6)?,
                    download: row.get(7)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        raws.into_iter()
            .map(|raw| {
                let failure: FailedData = match raw.data.as_deref() {
                    Some(json) => serde_json::from_str(json)?,
                    None => {
                        return Err(StoreError::CorruptEvent {
                            id: raw.event_id,
                            reason: "failed event without data".to_string(),
                        })
                    }
                };
                let audio_path = raw
                    .download
                    .as_deref()
                    .and_then(|json| serde_json::from_str::<DownloadedData>(json).ok())
                    .map(|d| d.audio_path);

                Ok(FailedEpisode {
                    episode_id: raw.episode_id,
                    feed_slug: raw.slug,
                    guid: raw.guid,
                    title: raw.title,
                    error_message: failure.error_message,
                    failed_stage: failure.failed_stage,
                    audio_path,
                    failed_at: parse_timestamp(&raw.failed_at)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EpisodeCandidate;

    fn setup() -> (Database, i64) {
        let db = Database::in_memory().unwrap();
        let feed_id = db.registry().upsert_feed("test-podcast", true).unwrap();
        let candidate = EpisodeCandidate {
            guid: "guid-1".to_string(),
            title: "Episode One".to_string(),
            content_url: "https://example.com/1.mp3".to_string(),
            ..Default::default()
        };
        let episode_id = db.registry().insert_episode(feed_id, &candidate).unwrap();
        (db, episode_id)
    }

    #[test]
    fn test_no_events_means_no_status() {
        let (db, episode_id) = setup();
        assert!(db.events().latest(episode_id).unwrap().is_none());
        assert!(db.events().current_status(episode_id).unwrap().is_none());
        assert!(db.events().all(episode_id, None).unwrap().is_empty());
    }

    #[test]
    fn test_latest_wins_over_best() {
        let (db, episode_id) = setup();
        let events = db.events();

        events
            .append(episode_id, &EventPayload::downloaded("/a/b.mp3"), None)
            .unwrap();
        events
            .append(
                episode_id,
                &EventPayload::failed("boom", FailedStage::Enrich),
                None,
            )
            .unwrap();

        assert_eq!(
            events.current_status(episode_id).unwrap(),
            Some(EventStatus::Failed)
        );
        assert_eq!(events.latest(episode_id).unwrap().unwrap().status(), EventStatus::Failed);
    }

    #[test]
    fn test_all_is_newest_first_and_filterable() {
        let (db, episode_id) = setup();
        let events = db.events();

        events.append(episode_id, &EventPayload::downloaded("/old.mp3"), None).unwrap();
        events.append(episode_id, &EventPayload::Contextualized, None).unwrap();
        events.append(episode_id, &EventPayload::downloaded("/new.mp3"), None).unwrap();

        let all = events.all(episode_id, None).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].id > all[1].id && all[1].id > all[2].id);

        let downloads = events.all(episode_id, Some(EventStatus::Downloaded)).unwrap();
        assert_eq!(downloads.len(), 2);
        assert_eq!(downloads[0].payload, EventPayload::downloaded("/new.mp3"));

        assert_eq!(
            events.latest_audio_path(episode_id).unwrap(),
            Some(PathBuf::from("/new.mp3"))
        );
    }

    #[test]
    fn test_supplementary_text_is_kept() {
        let (db, episode_id) = setup();
        let event = db
            .events()
            .append(
                episode_id,
                &EventPayload::emailed(vec!["a@example.com".to_string()]),
                Some("<html>summary</html>"),
            )
            .unwrap();

        let stored = db.events().latest(episode_id).unwrap().unwrap();
        assert_eq!(stored, event);
        assert_eq!(stored.additional_details.as_deref(), Some("<html>summary</html>"));
    }

    #[test]
    fn test_unknown_status_is_corruption() {
        let (db, episode_id) = setup();
        {
            let conn = db.conn().unwrap();
            conn.execute(
                "INSERT INTO processing_events (episode_id, status, created_at)
                 VALUES (?1, 'queued', ?2)",
                params![episode_id, now_timestamp()],
            )
            .unwrap();
        }

        let err = db.events().current_status(episode_id).unwrap_err();
        assert!(matches!(err, StoreError::CorruptEvent { .. }));
    }

    #[test]
    fn test_append_requires_existing_episode() {
        let (db, _) = setup();
        let result = db.events().append(9999, &EventPayload::Completed, None);
        assert!(matches!(result, Err(StoreError::Database(_))));
    }
}
