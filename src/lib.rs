//! podmon - Event-sourced podcast monitoring pipeline
//!
//! Polls configured podcast feeds and drives each new episode through
//! download, contextualization, transcription, summarization and email
//! delivery.
//!
//! # Architecture
//!
//! The system is built around event sourcing:
//! - Every completed stage is recorded as an immutable event
//! - An episode's status is the status of its latest event
//! - A rerun resumes each episode from the stage after its latest event
//! - Deliveries are recorded per destination so no address gets a repeat
//!
//! # Modules
//!
//! - `adapters`: External collaborators (RSS, HTTP download, LLM, STT, email)
//! - `core`: Storage and orchestration (EventStore, Registry, Orchestrator)
//! - `domain`: Data structures (Event, Feed, Episode)
//! - `config`: YAML configuration and secrets
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Process every active feed once
//! podmon run
//!
//! # Inspect an episode
//! podmon status <guid>
//! podmon events <guid>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use config::Config;
pub use core::{Database, Orchestrator, RunReport};
pub use domain::{Episode, Event, EventPayload, EventStatus, Feed};
