//! Service configuration from environment variables.

use std::net::IpAddr;
use std::{env, num::ParseIntError, time::Duration};
use thiserror::Error;

pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Clone)]
pub struct ServiceConfig {
  pub bind_addr: IpAddr,
  pub port: u16,
  /// Dashboard origin used for "view details" links in alerts.
  pub base_url: String,
  /// A group notified less than this long ago is not notified again.
  pub notify_debounce: Duration,
  pub telegram_api_base: String,
  pub telegram_timeout: Duration,
  pub fingerprint_max_frames: usize,
  /// Delivery attempts kept in memory, across all environments.
  pub history_limit: usize,
  /// Ingest requests allowed per client IP per minute; 0 disables the limit.
  pub ingest_rate_per_minute: u32,
}

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("invalid integer in env var {name}: {source}")]
  InvalidInteger { name: String, source: ParseIntError },
  #[error("invalid address in env var {name}: {value}")]
  InvalidAddr { name: String, value: String },
}

impl Default for ServiceConfig {
  fn default() -> Self {
    Self {
      bind_addr: IpAddr::from([127, 0, 0, 1]),
      port: 4000,
      base_url: "http://localhost:5173".to_owned(),
      notify_debounce: Duration::from_secs(60),
      telegram_api_base: DEFAULT_TELEGRAM_API_BASE.to_owned(),
      telegram_timeout: Duration::from_secs(10),
      fingerprint_max_frames: 10,
      history_limit: 500,
      ingest_rate_per_minute: 100,
    }
  }
}

impl ServiceConfig {
  pub fn from_env() -> Result<Self, ConfigError> {
    let defaults = Self::default();

    let bind_addr = match read_optional("BIND_ADDR") {
      Some(raw) => raw.parse::<IpAddr>().map_err(|_| ConfigError::InvalidAddr {
        name: "BIND_ADDR".to_owned(),
        value: raw,
      })?,
      None => defaults.bind_addr,
    };

    let port = read_parsed("PORT")?.unwrap_or(defaults.port);
    let base_url = read_optional("BASE_URL")
      .map(|url| url.trim_end_matches('/').to_owned())
      .unwrap_or(defaults.base_url);
    let notify_debounce = read_parsed::<u64>("NOTIFY_DEBOUNCE_SECS")?
      .map(Duration::from_secs)
      .unwrap_or(defaults.notify_debounce);
    let telegram_api_base = read_optional("TELEGRAM_API_BASE")
      .map(|url| url.trim_end_matches('/').to_owned())
      .unwrap_or(defaults.telegram_api_base);
    let fingerprint_max_frames =
      read_parsed("FINGERPRINT_MAX_FRAMES")?.unwrap_or(defaults.fingerprint_max_frames);
    let ingest_rate_per_minute =
      read_parsed("INGEST_RATE_LIMIT_PER_MIN")?.unwrap_or(defaults.ingest_rate_per_minute);

    Ok(Self {
      bind_addr,
      port,
      base_url,
      notify_debounce,
      telegram_api_base,
      fingerprint_max_frames,
      ingest_rate_per_minute,
      ..defaults
    })
  }
}

fn read_optional(name: &str) -> Option<String> {
  env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn read_parsed<T>(name: &str) -> Result<Option<T>, ConfigError>
where
  T: std::str::FromStr<Err = ParseIntError>,
{
  read_optional(name)
    .map(|raw| {
      raw.trim().parse::<T>().map_err(|source| ConfigError::InvalidInteger {
        name: name.to_owned(),
        source,
      })
    })
    .transpose()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_match_local_dev() {
    let config = ServiceConfig::default();
    assert_eq!(config.port, 4000);
    assert_eq!(config.base_url, "http://localhost:5173");
    assert_eq!(config.notify_debounce, Duration::from_secs(60));
    assert_eq!(config.ingest_rate_per_minute, 100);
    assert!(config.bind_addr.is_loopback());
  }

  #[test]
  fn bad_integer_names_the_variable() {
    env::set_var("VIGIL_TEST_BAD_PORT", "12x");
    let err = read_parsed::<u16>("VIGIL_TEST_BAD_PORT").unwrap_err();
    assert!(err.to_string().contains("VIGIL_TEST_BAD_PORT"));
  }

  #[test]
  fn blank_values_fall_back() {
    env::set_var("VIGIL_TEST_BLANK", "  ");
    assert_eq!(read_parsed::<u64>("VIGIL_TEST_BLANK").unwrap(), None);
    assert_eq!(read_optional("VIGIL_TEST_UNSET_VAR"), None);
  }
}
