//! Event types for the episode lifecycle.
//!
//! Stage completion is recorded as immutable events in an append-only log.
//! An episode's current status is the status of its most recent event.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed status vocabulary for processing events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Source content fetched to local storage
    Downloaded,

    /// Derived context generated from metadata
    Contextualized,

    /// Content transformed into text
    Transcribed,

    /// Final artifact produced
    Summarized,

    /// Artifact distributed to every destination
    Emailed,

    /// Pipeline finished (terminal)
    Completed,

    /// Processing stopped on an error (terminal)
    Failed,
}

impl EventStatus {
    pub const ALL: [EventStatus; 7] = [
        Self::Downloaded,
        Self::Contextualized,
        Self::Transcribed,
        Self::Summarized,
        Self::Emailed,
        Self::Completed,
        Self::Failed,
    ];

    /// Storage tag for this status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Downloaded => "downloaded",
            Self::Contextualized => "contextualized",
            Self::Transcribed => "transcribed",
            Self::Summarized => "summarized",
            Self::Emailed => "emailed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal statuses are never advanced automatically
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// A status tag outside the fixed vocabulary
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event status: {0}")]
pub struct UnknownStatus(pub String);

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Acquire,
    Enrich,
    Transform,
    Produce,
    Distribute,
    Complete,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acquire => "acquire",
            Self::Enrich => "enrich",
            Self::Transform => "transform",
            Self::Produce => "produce",
            Self::Distribute => "distribute",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage a failure is attributed to in failure reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedStage {
    Acquire,
    Enrich,
    Transform,
    Produce,
    Distribute,
    Unknown,
}

impl FailedStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acquire => "acquire",
            Self::Enrich => "enrich",
            Self::Transform => "transform",
            Self::Produce => "produce",
            Self::Distribute => "distribute",
            Self::Unknown => "unknown",
        }
    }
}

impl From<Stage> for FailedStage {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Acquire => Self::Acquire,
            Stage::Enrich => Self::Enrich,
            Stage::Transform => Self::Transform,
            Stage::Produce => Self::Produce,
            Stage::Distribute => Self::Distribute,
            Stage::Complete => Self::Unknown,
        }
    }
}

impl fmt::Display for FailedStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadedData {
    pub audio_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscribedData {
    pub transcript_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummarizedData {
    pub summary_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailedData {
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedData {
    pub error_message: String,
    pub failed_stage: FailedStage,
}

/// Status-specific event data.
///
/// Each status carries its own schema, so the data available for a status
/// is known at compile time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    Downloaded(DownloadedData),
    Contextualized,
    Transcribed(TranscribedData),
    Summarized(SummarizedData),
    Emailed(EmailedData),
    Completed,
    Failed(FailedData),
}

impl EventPayload {
    pub fn downloaded(audio_path: impl Into<PathBuf>) -> Self {
        Self::Downloaded(DownloadedData {
            audio_path: audio_path.into(),
        })
    }

    pub fn transcribed(transcript_path: impl Into<PathBuf>) -> Self {
        Self::Transcribed(TranscribedData {
            transcript_path: transcript_path.into(),
        })
    }

    pub fn summarized(summary_path: impl Into<PathBuf>) -> Self {
        Self::Summarized(SummarizedData {
            summary_path: summary_path.into(),
        })
    }

    pub fn emailed(recipients: Vec<String>) -> Self {
        Self::Emailed(EmailedData { recipients })
    }

    pub fn failed(error_message: impl Into<String>, failed_stage: FailedStage) -> Self {
        Self::Failed(FailedData {
            error_message: error_message.into(),
            failed_stage,
        })
    }

    /// The status tag this payload is recorded under
    pub fn status(&self) -> EventStatus {
        match self {
            Self::Downloaded(_) => EventStatus::Downloaded,
            Self::Contextualized => EventStatus::Contextualized,
            Self::Transcribed(_) => EventStatus::Transcribed,
            Self::Summarized(_) => EventStatus::Summarized,
            Self::Emailed(_) => EventStatus::Emailed,
            Self::Completed => EventStatus::Completed,
            Self::Failed(_) => EventStatus::Failed,
        }
    }

    /// Serialize the status-specific data (None for data-less statuses)
    pub fn data_json(&self) -> Result<Option<String>, serde_json::Error> {
        let json = match self {
            Self::Downloaded(data) => serde_json::to_string(data)?,
            Self::Transcribed(data) => serde_json::to_string(data)?,
            Self::Summarized(data) => serde_json::to_string(data)?,
            Self::Emailed(data) => serde_json::to_string(data)?,
            Self::Failed(data) => serde_json::to_string(data)?,
            Self::Contextualized | Self::Completed => return Ok(None),
        };
        Ok(Some(json))
    }

    /// Rebuild a payload from its stored status tag and data column
    pub fn from_parts(status: EventStatus, data: Option<&str>) -> Result<Self, PayloadError> {
        fn parse<T: serde::de::DeserializeOwned>(
            status: EventStatus,
            data: Option<&str>,
        ) -> Result<T, PayloadError> {
            let raw = data.ok_or(PayloadError::Missing(status))?;
            serde_json::from_str(raw).map_err(|source| PayloadError::Malformed { status, source })
        }

        Ok(match status {
            EventStatus::Downloaded => Self::Downloaded(parse(status, data)?),
            EventStatus::Contextualized => Self::Contextualized,
            EventStatus::Transcribed => Self::Transcribed(parse(status, data)?),
            EventStatus::Summarized => Self::Summarized(parse(status, data)?),
            EventStatus::Emailed => Self::Emailed(parse(status, data)?),
            EventStatus::Completed => Self::Completed,
            EventStatus::Failed => Self::Failed(parse(status, data)?),
        })
    }
}

/// Stored event data that does not match its status schema
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("event data missing for status '{0}'")]
    Missing(EventStatus),

    #[error("malformed event data for status '{status}': {source}")]
    Malformed {
        status: EventStatus,
        #[source]
        source: serde_json::Error,
    },
}

/// A single event in the append-only processing log.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Row id (insertion order, breaks timestamp ties)
    pub id: i64,

    /// The episode this event belongs to
    pub episode_id: i64,

    /// Status-specific data
    pub payload: EventPayload,

    /// Large supplementary text (e.g. the rendered message)
    pub additional_details: Option<String>,

    /// When this event was appended
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn status(&self) -> EventStatus {
        self.payload.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_tags_round_trip() {
        for status in EventStatus::ALL {
            assert_eq!(status.as_str().parse::<EventStatus>().unwrap(), status);
        }
        assert!("queued".parse::<EventStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(EventStatus::Completed.is_terminal());
        assert!(EventStatus::Failed.is_terminal());
        assert!(!EventStatus::Emailed.is_terminal());
        assert!(!EventStatus::Downloaded.is_terminal());
    }

    #[test]
    fn test_downloaded_data_shape() {
        let payload = EventPayload::downloaded("/a/b.mp3");
        let json = payload.data_json().unwrap().unwrap();
        assert_eq!(json, r#"{"audio_path":"/a/b.mp3"}"#);
    }

    #[test]
    fn test_failed_data_shape() {
        let payload = EventPayload::failed("Failed to transcribe audio", FailedStage::Transform);
        let value: serde_json::Value =
            serde_json::from_str(&payload.data_json().unwrap().unwrap()).unwrap();
        assert_eq!(value["error_message"], "Failed to transcribe audio");
        assert_eq!(value["failed_stage"], "transform");
    }

    #[test]
    fn test_dataless_statuses_store_nothing() {
        assert!(EventPayload::Contextualized.data_json().unwrap().is_none());
        assert!(EventPayload::Completed.data_json().unwrap().is_none());
        assert_eq!(
            EventPayload::from_parts(EventStatus::Completed, None).unwrap(),
            EventPayload::Completed
        );
    }

    #[test]
    fn test_missing_data_is_rejected() {
        let err = EventPayload::from_parts(EventStatus::Downloaded, None).unwrap_err();
        assert!(matches!(err, PayloadError::Missing(EventStatus::Downloaded)));

        let err = EventPayload::from_parts(EventStatus::Transcribed, Some("{not json")).unwrap_err();
        assert!(matches!(err, PayloadError::Malformed { .. }));
    }
}
