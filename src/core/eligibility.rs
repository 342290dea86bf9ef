//! Pre-flight eligibility filters.
//!
//! Evaluated before any side-effecting call. An ineligible episode is
//! logged and skipped; no event is recorded for it.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::Episode;

/// Limits applied before an episode enters the pipeline
#[derive(Debug, Clone)]
pub struct EligibilityLimits {
    /// Episodes published longer ago than this are not started
    pub max_episode_age_days: i64,
}

impl Default for EligibilityLimits {
    fn default() -> Self {
        Self {
            max_episode_age_days: 3,
        }
    }
}

/// Why an episode is skipped
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Ineligible {
    #[error("feed has no distribution destinations")]
    NoDestinations,

    #[error("episode is {age_days} days old (limit: {limit})")]
    TooOld { age_days: i64, limit: i64 },
}

impl EligibilityLimits {
    /// Check an episode before its first stage.
    ///
    /// `in_flight` is true when the episode already has events; the age
    /// filter only gates episodes that have never started. An unparseable
    /// published time never causes a skip.
    pub fn check(
        &self,
        episode: &Episode,
        destinations: &[String],
        in_flight: bool,
        now: DateTime<Utc>,
    ) -> Result<(), Ineligible> {
        if destinations.is_empty() {
            return Err(Ineligible::NoDestinations);
        }

        if in_flight {
            return Ok(());
        }

        if let Some(published) = episode.published() {
            let age_days = (now - published).num_days();
            if age_days > self.max_episode_age_days {
                return Err(Ineligible::TooOld {
                    age_days,
                    limit: self.max_episode_age_days,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn episode(published_at: Option<&str>) -> Episode {
        Episode {
            id: 1,
            feed_id: 1,
            guid: "g".to_string(),
            title: "t".to_string(),
            description: None,
            link: None,
            content_url: "https://example.com/a.mp3".to_string(),
            artwork_url: None,
            published_at: published_at.map(str::to_string),
            duration_minutes: None,
            file_size_mb: None,
            context: None,
            result: None,
            raw_record: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()
    }

    fn dests() -> Vec<String> {
        vec!["a@example.com".to_string()]
    }

    #[test]
    fn test_no_destinations_always_skips() {
        let limits = EligibilityLimits::default();
        let ep = episode(Some("2024-03-15T09:00:00Z"));
        assert_eq!(limits.check(&ep, &[], false, now()), Err(Ineligible::NoDestinations));
        assert_eq!(limits.check(&ep, &[], true, now()), Err(Ineligible::NoDestinations));
    }

    #[test]
    fn test_old_episode_skipped_before_start() {
        let limits = EligibilityLimits::default();
        let published = (now() - Duration::days(10)).to_rfc3339();
        let ep = episode(Some(&published));

        assert_eq!(
            limits.check(&ep, &dests(), false, now()),
            Err(Ineligible::TooOld { age_days: 10, limit: 3 })
        );
        // Already started: resumes regardless of age
        assert!(limits.check(&ep, &dests(), true, now()).is_ok());
    }

    #[test]
    fn test_unparseable_date_proceeds() {
        let limits = EligibilityLimits::default();
        assert!(limits.check(&episode(Some("sometime")), &dests(), false, now()).is_ok());
        assert!(limits.check(&episode(None), &dests(), false, now()).is_ok());
    }

    #[test]
    fn test_boundary_age_is_eligible() {
        let limits = EligibilityLimits::default();
        let published = (now() - Duration::days(3)).to_rfc3339();
        assert!(limits.check(&episode(Some(&published)), &dests(), false, now()).is_ok());
    }
}
