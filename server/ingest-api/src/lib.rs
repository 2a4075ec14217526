//! Vigil Eye Ingest API
//!
//! HTTP service in front of the grouping engine: API-key ingestion, error group
//! triage, environment management and background Telegram delivery.
//! Bind to 127.0.0.1 by default.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod limit;
pub mod routes;
pub mod state;
pub mod telegram;

pub use config::{ConfigError, ServiceConfig};
pub use dispatch::{ChatTarget, DeliveryRecord, DeliveryStatus, DispatchError, Dispatcher, Notifier};
pub use routes::router;
pub use state::AppState;
pub use telegram::TelegramNotifier;
