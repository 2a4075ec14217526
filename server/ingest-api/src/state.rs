//! Shared application state.

use std::sync::Arc;

use grouping_engine::{Config, Engine};

use crate::config::ServiceConfig;
use crate::dispatch::{Dispatcher, Notifier};
use crate::limit::IngestLimiter;

pub struct AppState {
  pub engine: Arc<Engine>,
  pub dispatcher: Arc<Dispatcher>,
  pub ingest_limiter: Option<IngestLimiter>,
  pub config: ServiceConfig,
}

impl AppState {
  pub fn new(config: ServiceConfig, notifier: Arc<dyn Notifier>) -> Self {
    let engine = Arc::new(Engine::new(Config {
      fingerprint_max_frames: config.fingerprint_max_frames,
      ..Config::default()
    }));
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&engine), notifier, &config));
    Self {
      engine,
      dispatcher,
      ingest_limiter: IngestLimiter::per_minute(config.ingest_rate_per_minute),
      config,
    }
  }
}
