//! State resolver: pure mapping from current status to the next stage.

use crate::domain::{EventStatus, FailedStage, Stage};

/// Next stage to attempt for an episode at `current`.
///
/// `None` means there is nothing left to do: the episode is terminal.
pub fn next_stage(current: Option<EventStatus>) -> Option<Stage> {
    match current {
        None => Some(Stage::Acquire),
        Some(EventStatus::Downloaded) => Some(Stage::Enrich),
        Some(EventStatus::Contextualized) => Some(Stage::Transform),
        Some(EventStatus::Transcribed) => Some(Stage::Produce),
        Some(EventStatus::Summarized) => Some(Stage::Distribute),
        Some(EventStatus::Emailed) => Some(Stage::Complete),
        Some(EventStatus::Completed) | Some(EventStatus::Failed) => None,
    }
}

/// Status preceding a failure → stage the failure is attributed to.
///
/// Surfaced in failure reports; keep in sync with report consumers.
const FAILED_STAGE_TABLE: &[(Option<EventStatus>, FailedStage)] = &[
    (None, FailedStage::Acquire),
    (Some(EventStatus::Downloaded), FailedStage::Enrich),
    (Some(EventStatus::Contextualized), FailedStage::Transform),
    (Some(EventStatus::Transcribed), FailedStage::Produce),
    (Some(EventStatus::Summarized), FailedStage::Distribute),
];

/// Infer which stage failed from the status recorded just before the failure
pub fn failed_stage(preceding: Option<EventStatus>) -> FailedStage {
    FAILED_STAGE_TABLE
        .iter()
        .find(|(status, _)| *status == preceding)
        .map(|(_, stage)| *stage)
        .unwrap_or(FailedStage::Unknown)
}

/// Infer the failed stage from an episode's history (newest first).
///
/// Looks at the event immediately preceding the most recent `failed`
/// event. Returns `None` when the history holds no failure.
pub fn failed_stage_from_history(newest_first: &[EventStatus]) -> Option<FailedStage> {
    let idx = newest_first.iter().position(|s| *s == EventStatus::Failed)?;
    Some(failed_stage(newest_first.get(idx + 1).copied()))
}
