//! Delivery ledger: at-most-once distribution per (episode, destination).
//!
//! The UNIQUE index on `deliveries(episode_id, destination)` carries the
//! guarantee. [`DeliveryLedger::already_delivered`] only saves redundant
//! external calls.

use rusqlite::params;
use tracing::debug;

use super::db::{now_timestamp, Database, StoreError};

/// View over the `deliveries` table
pub struct DeliveryLedger<'a> {
    db: &'a Database,
}

impl<'a> DeliveryLedger<'a> {
    pub(crate) fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn already_delivered(&self, episode_id: i64, destination: &str) -> Result<bool, StoreError> {
        let conn = self.db.conn()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM deliveries WHERE episode_id = ?1 AND destination = ?2)",
            params![episode_id, destination],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Record a confirmed delivery.
    ///
    /// Returns `false` when the pair was already recorded; storage rejects
    /// the duplicate and nothing changes.
    pub fn record_delivered(&self, episode_id: i64, destination: &str) -> Result<bool, StoreError> {
        let conn = self.db.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO deliveries (episode_id, destination, delivered_at)
             VALUES (?1, ?2, ?3)",
            params![episode_id, destination, now_timestamp()],
        )?;
        if inserted == 0 {
            debug!(episode_id, destination, "Delivery already recorded");
        }
        Ok(inserted == 1)
    }

    /// Destinations already recorded for an episode, in delivery order
    pub fn delivered_to(&self, episode_id: i64) -> Result<Vec<String>, StoreError> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            "SELECT destination FROM deliveries WHERE episode_id = ?1 ORDER BY delivered_at, id",
        )?;
        let rows = stmt.query_map(params![episode_id], |row| row.get(0))?;
        let destinations = rows.collect::<Result<Vec<String>, _>>()?;
        Ok(destinations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EpisodeCandidate;

    fn setup() -> (Database, i64) {
        let db = Database::in_memory().unwrap();
        let feed_id = db.registry().upsert_feed("show", true).unwrap();
        let candidate = EpisodeCandidate {
            guid: "g1".to_string(),
            title: "One".to_string(),
            content_url: "https://example.com/1.mp3".to_string(),
            ..Default::default()
        };
        let id = db.registry().insert_episode(feed_id, &candidate).unwrap();
        (db, id)
    }

    #[test]
    fn test_record_then_check() {
        let (db, id) = setup();
        let ledger = db.deliveries();

        assert!(!ledger.already_delivered(id, "a@example.com").unwrap());
        assert!(ledger.record_delivered(id, "a@example.com").unwrap());
        assert!(ledger.already_delivered(id, "a@example.com").unwrap());
        assert!(!ledger.already_delivered(id, "b@example.com").unwrap());
    }

    #[test]
    fn test_duplicate_pair_is_a_no_op() {
        let (db, id) = setup();
        let ledger = db.deliveries();

        assert!(ledger.record_delivered(id, "a@example.com").unwrap());
        assert!(!ledger.record_delivered(id, "a@example.com").unwrap());
        assert_eq!(ledger.delivered_to(id).unwrap(), vec!["a@example.com".to_string()]);
    }
}
