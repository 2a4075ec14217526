//! Binary entrypoint: read JSON lines from stdin, write JSON lines to stdout.
//!
//! Each input line is an InboundEvent. Every line produces one output line:
//! - An IngestOutcome (with `alert` set when a trigger fired)
//! - An ErrorOutput (when input validation fails)
//!
//! Trigger settings come from an environment settings JSON file
//! (`{"notifications":{"telegram":{...}}}`); without one, no alerts fire.

use clap::Parser;
use grouping_engine::types::ErrorOutput;
use grouping_engine::{Config, Engine, EngineError, EnvironmentSettings, InboundEvent};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "grouping-engine", about = "Group error events and evaluate alert triggers")]
struct Cli {
  /// Environment settings JSON used for trigger evaluation
  #[arg(long, env = "VIGIL_SETTINGS")]
  settings: Option<PathBuf>,

  /// Max stack lines included in the fingerprint
  #[arg(long, env = "FINGERPRINT_MAX_FRAMES", default_value_t = 10)]
  max_frames: usize,
}

fn init_tracing() {
  let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
  // stdout carries the output stream; logs go to stderr.
  if std::env::var("LOG_FORMAT").unwrap_or_default() == "json" {
    tracing_subscriber::fmt()
      .json()
      .with_env_filter(filter)
      .with_writer(io::stderr)
      .init();
  } else {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(io::stderr)
      .init();
  }
}

fn load_settings(path: Option<&PathBuf>) -> Result<EnvironmentSettings, String> {
  let Some(path) = path else {
    return Ok(EnvironmentSettings::default());
  };
  let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e))?;
  serde_json::from_str(&text).map_err(|e| format!("{}: {}", path.display(), e))
}

fn write_line<T: serde::Serialize>(out: &mut impl Write, value: &T) {
  let _ = serde_json::to_writer(&mut *out, value);
  let _ = writeln!(out);
}

fn main() {
  let cli = Cli::parse();
  init_tracing();

  let settings = match load_settings(cli.settings.as_ref()) {
    Ok(s) => s,
    Err(e) => {
      let _ = writeln!(io::stderr(), "grouping-engine: settings: {}", e);
      std::process::exit(2);
    }
  };

  let engine = Engine::new(Config {
    fingerprint_max_frames: cli.max_frames,
    ..Config::default()
  });

  let stdin = io::stdin();
  let stdout = io::stdout();
  let mut out = io::BufWriter::new(stdout.lock());

  for line in stdin.lock().lines() {
    let line = match line {
      Ok(l) => l,
      Err(e) => {
        let _ = writeln!(io::stderr(), "grouping-engine: read error: {}", e);
        std::process::exit(1);
      }
    };

    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }

    let raw: InboundEvent = match serde_json::from_str(trimmed) {
      Ok(v) => v,
      Err(e) => {
        write_line(&mut out, &ErrorOutput::new(format!("json parse: {}", e)));
        continue;
      }
    };

    match engine.ingest(&raw, &settings.notifications) {
      Ok(outcome) => write_line(&mut out, &outcome),
      Err(EngineError::Validation { field, reason }) => {
        write_line(&mut out, &ErrorOutput::new(reason).with_field(field));
      }
      Err(e) => write_line(&mut out, &ErrorOutput::new(e.to_string())),
    }
  }

  let _ = out.flush();
}
