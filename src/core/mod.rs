//! Core orchestration logic.
//!
//! This module contains:
//! - Database: SQLite connection and schema
//! - EventStore: Append-only event log per episode
//! - Registry: Feed and episode identity
//! - DeliveryLedger: Per-destination delivery records
//! - Resolver: Next-stage and failed-stage derivation
//! - Eligibility: Pre-flight filters
//! - Orchestrator: Main execution engine

pub mod db;
pub mod delivery;
pub mod eligibility;
pub mod event_store;
pub mod orchestrator;
pub mod registry;
pub mod report;
pub mod resolver;

// Re-export commonly used types
pub use db::{Database, StoreError};
pub use delivery::DeliveryLedger;
pub use eligibility::{EligibilityLimits, Ineligible};
pub use event_store::{EventStore, FailedEpisode};
pub use orchestrator::Orchestrator;
pub use registry::{EpisodeIdentity, Registry};
pub use report::{
    EpisodeOutcome, EpisodeReport, FeedReport, OutcomeCounts, RunReport, StageOutcome,
};
