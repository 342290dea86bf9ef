//! Domain types for the podmon pipeline.
//!
//! This module contains the core data structures:
//! - Events: Immutable records of stage completion
//! - Feed: Parent collections and their metadata
//! - Episode: Work items and feed candidates

pub mod episode;
pub mod events;
pub mod feed;

// Re-export commonly used types
pub use episode::{Episode, EpisodeCandidate};
pub use events::{Event, EventPayload, EventStatus, FailedStage, PayloadError, Stage};
pub use feed::{Feed, FeedFetch, FeedMetadata};
