//! Run outcome aggregation.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::domain::{EventStatus, FailedStage};

use super::eligibility::Ineligible;

/// What happened to one episode during a run
#[derive(Debug, Clone, PartialEq)]
pub enum EpisodeOutcome {
    /// Every stage finished; `completed` recorded
    Completed,

    /// A stage failed; `failed` recorded (when the episode row exists)
    Failed { stage: FailedStage, error: String },

    /// Some destinations failed; delivered ones are in the ledger and the
    /// rest are retried on the next run
    PartiallyDelivered { pending: Vec<String> },

    /// Already `completed` or `failed`; nothing was done
    AlreadyTerminal(EventStatus),

    /// Pre-flight filter; nothing was recorded
    Skipped(Ineligible),
}

impl EpisodeOutcome {
    /// Outcomes that make the run degraded
    pub fn is_problem(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::PartiallyDelivered { .. })
    }
}

impl fmt::Display for EpisodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed { stage, error } => write!(f, "failed at {}: {}", stage, error),
            Self::PartiallyDelivered { pending } => {
                write!(f, "partially delivered ({} pending)", pending.len())
            }
            Self::AlreadyTerminal(status) => write!(f, "already {}", status),
            Self::Skipped(reason) => write!(f, "skipped: {}", reason),
        }
    }
}

/// What happened when one stage was run on request
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// The stage recorded this status
    Recorded(EventStatus),

    /// Some destinations failed; delivered ones are in the ledger
    PartiallyDelivered { pending: Vec<String> },

    /// The stage failed; `failed` recorded
    Failed { stage: FailedStage, error: String },
}

impl StageOutcome {
    pub fn is_problem(&self) -> bool {
        !matches!(self, Self::Recorded(_))
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recorded(status) => write!(f, "{}", status),
            Self::PartiallyDelivered { pending } => {
                write!(f, "partially delivered ({} pending)", pending.len())
            }
            Self::Failed { stage, error } => write!(f, "failed at {}: {}", stage, error),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeReport {
    pub guid: String,
    pub title: String,
    pub outcome: EpisodeOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedReport {
    pub slug: String,
    pub episodes: Vec<EpisodeReport>,

    /// Set when the feed as a whole could not be processed
    pub error: Option<String>,
}

impl FeedReport {
    pub fn failed(slug: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            episodes: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Aggregate result of one periodic run
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub feeds: Vec<FeedReport>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub completed: usize,
    pub failed: usize,
    pub partial: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            feeds: Vec::new(),
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn episodes(&self) -> impl Iterator<Item = &EpisodeReport> {
        self.feeds.iter().flat_map(|f| f.episodes.iter())
    }

    pub fn failed_feeds(&self) -> impl Iterator<Item = &FeedReport> {
        self.feeds.iter().filter(|f| f.error.is_some())
    }

    /// True if any feed failed, or any episode failed or is partially delivered
    pub fn is_degraded(&self) -> bool {
        self.failed_feeds().next().is_some() || self.episodes().any(|e| e.outcome.is_problem())
    }

    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for episode in self.episodes() {
            match episode.outcome {
                EpisodeOutcome::Completed => counts.completed += 1,
                EpisodeOutcome::Failed { .. } => counts.failed += 1,
                EpisodeOutcome::PartiallyDelivered { .. } => counts.partial += 1,
                EpisodeOutcome::AlreadyTerminal(_) => counts.unchanged += 1,
                EpisodeOutcome::Skipped(_) => counts.skipped += 1,
            }
        }
        counts
    }
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn episode(outcome: EpisodeOutcome) -> EpisodeReport {
        EpisodeReport {
            guid: "g".to_string(),
            title: "t".to_string(),
            outcome,
        }
    }

    #[test]
    fn test_clean_run_is_not_degraded() {
        let mut report = RunReport::new();
        report.feeds.push(FeedReport {
            slug: "a".to_string(),
            episodes: vec![
                episode(EpisodeOutcome::Completed),
                episode(EpisodeOutcome::AlreadyTerminal(EventStatus::Failed)),
                episode(EpisodeOutcome::Skipped(Ineligible::NoDestinations)),
            ],
            error: None,
        });
        assert!(!report.is_degraded());
        assert_eq!(
            report.counts(),
            OutcomeCounts {
                completed: 1,
                unchanged: 1,
                skipped: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_failures_degrade_the_run() {
        let mut report = RunReport::new();
        report.feeds.push(FeedReport {
            slug: "a".to_string(),
            episodes: vec![episode(EpisodeOutcome::PartiallyDelivered {
                pending: vec!["b@example.com".to_string()],
            })],
            error: None,
        });
        assert!(report.is_degraded());

        let mut report = RunReport::new();
        report.feeds.push(FeedReport::failed("b", "HTTP error 500"));
        assert!(report.is_degraded());
        assert_eq!(report.failed_feeds().count(), 1);
    }

    #[test]
    fn test_outcome_display() {
        let outcome = EpisodeOutcome::Failed {
            stage: FailedStage::Transform,
            error: "Failed to transcribe audio".to_string(),
        };
        assert_eq!(outcome.to_string(), "failed at transform: Failed to transcribe audio");
    }
}
