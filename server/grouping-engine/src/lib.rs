//! Vigil Eye grouping engine: deterministic error grouping and alert triggers.
//!
//! Validates inbound error events, fingerprints them, folds them into
//! per-environment error groups, records every occurrence, and decides when an
//! environment's Telegram triggers should fire.
//!
//! No DB, no network; in-memory state with one lock per group.

pub mod config;
pub mod engine;
pub mod environment;
pub mod error;
pub mod evaluator;
pub mod fingerprint;
pub mod normalize;
pub mod recorder;
pub mod store;
pub mod types;
pub mod window;

pub use config::Config;
pub use engine::Engine;
pub use environment::{Environment, EnvironmentRegistry, EnvironmentUpdate};
pub use error::EngineError;
pub use types::{
  AlertIntent, AlertRule, EnvironmentSettings, ErrorGroup, ErrorLog, GroupFilter, GroupStatus,
  InboundEvent, IngestOutcome, NotificationSettings, OccurrenceFilter,
};
