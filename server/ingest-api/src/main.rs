//! Binary entrypoint for the ingest API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ingest_api::{AppState, ServiceConfig, TelegramNotifier};

fn init_tracing() {
  let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
  if std::env::var("LOG_FORMAT").unwrap_or_default() == "json" {
    tracing_subscriber::fmt().json().with_env_filter(filter).init();
  } else {
    tracing_subscriber::fmt().with_env_filter(filter).init();
  }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  init_tracing();

  let config = ServiceConfig::from_env()?;
  let notifier = TelegramNotifier::new(config.telegram_api_base.clone(), config.telegram_timeout)?;
  let addr = SocketAddr::new(config.bind_addr, config.port);
  let state = Arc::new(AppState::new(config, Arc::new(notifier)));

  if state.ingest_limiter.is_some() {
    let state = Arc::clone(&state);
    tokio::spawn(async move {
      let mut tick = tokio::time::interval(Duration::from_secs(60));
      loop {
        tick.tick().await;
        if let Some(limiter) = &state.ingest_limiter {
          limiter.retain_recent();
        }
      }
    });
  }

  let app = ingest_api::router(state);

  tracing::info!(%addr, "ingest-api listening");
  let listener = tokio::net::TcpListener::bind(addr).await?;
  axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

  Ok(())
}
