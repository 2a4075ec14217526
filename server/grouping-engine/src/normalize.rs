//! Validate inbound events into canonical Events, and normalize text for fingerprinting.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;

use crate::error::EngineError;
use crate::types::*;

static UUID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b").unwrap()
});
static TIMESTAMP_REGEX: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}(:\d{2}(\.\d+)?)?(Z|[+-]\d{2}:?\d{2})?").unwrap()
});
static HEX_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\b0x[0-9a-f]+\b").unwrap());
static NUMBER_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

/// Parse and validate an InboundEvent into a canonical Event.
pub fn normalize(raw: &InboundEvent) -> Result<Event, EngineError> {
  let project_id = raw
    .project_id
    .ok_or_else(|| EngineError::validation("project_id", "required"))?;
  let environment_id = raw
    .environment_id
    .ok_or_else(|| EngineError::validation("environment_id", "required"))?;

  if raw.message.trim().is_empty() {
    return Err(EngineError::validation("message", "must not be empty"));
  }

  if raw.level.is_empty() {
    return Err(EngineError::validation("level", "required"));
  }
  let level = Level::from_str_loose(&raw.level)
    .ok_or_else(|| EngineError::validation("level", "expected error|warn|info"))?;

  if raw.source.is_empty() {
    return Err(EngineError::validation("source", "required"));
  }
  let source = Source::from_str_loose(&raw.source)
    .ok_or_else(|| EngineError::validation("source", "expected frontend|backend"))?;

  if raw.timestamp.is_empty() {
    return Err(EngineError::validation("timestamp", "required"));
  }
  let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(&raw.timestamp)
    .map_err(|e| EngineError::validation("timestamp", &format!("invalid RFC3339: {}", e)))?
    .with_timezone(&Utc);

  let event_id = raw
    .event_id
    .as_deref()
    .map(str::trim)
    .filter(|id| !id.is_empty())
    .map(str::to_string);

  Ok(Event {
    project_id,
    environment_id,
    event_id,
    timestamp,
    source,
    level,
    message: raw.message.clone(),
    stack: raw.stack.clone().filter(|s| !s.trim().is_empty()),
    context: RequestContext {
      url: raw.url.clone(),
      method: raw.method.clone(),
      status_code: raw.status_code,
      user_agent: raw.user_agent.clone(),
      user_id: raw.user_id.clone(),
      request_body: raw.request_body.clone(),
      request_headers: raw.request_headers.clone(),
      response_body: raw.response_body.clone(),
      response_time_ms: raw.response_time_ms,
      extra_data: raw.extra_data.clone(),
    },
  })
}

/// Strip dynamic substrings from an error message:
/// - UUIDs -> `<uuid>`
/// - ISO-8601 timestamps -> `<ts>`
/// - 0x hex -> `<hex>`
/// - remaining digit runs -> `<n>`
/// - whitespace collapsed
pub fn normalize_message(msg: &str) -> String {
  let msg = UUID_REGEX.replace_all(msg, "<uuid>");
  let msg = TIMESTAMP_REGEX.replace_all(&msg, "<ts>");
  let msg = HEX_REGEX.replace_all(&msg, "<hex>");
  let msg = NUMBER_REGEX.replace_all(&msg, "<n>");
  msg.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Keep the top `max_frames` non-empty stack lines, trimmed, with memory
/// addresses replaced. File names and line numbers are kept.
pub fn normalize_stack(stack: &str, max_frames: usize) -> Vec<String> {
  stack
    .lines()
    .map(str::trim)
    .filter(|line| !line.is_empty())
    .take(max_frames)
    .map(|line| HEX_REGEX.replace_all(line, "<addr>").into_owned())
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn raw() -> InboundEvent {
    InboundEvent {
      project_id: Some(1),
      environment_id: Some(2),
      timestamp: "2025-01-15T10:30:00Z".into(),
      source: "backend".into(),
      level: "error".into(),
      message: "boom".into(),
      ..Default::default()
    }
  }

  #[test]
  fn message_ids_are_stripped() {
    assert_eq!(
      normalize_message("User 123 not found"),
      normalize_message("User 98765 not found")
    );
    assert_eq!(normalize_message("User 123 not found"), "User <n> not found");
  }

  #[test]
  fn message_uuid_and_timestamp_are_stripped() {
    let a = normalize_message("order 3f2b8c1e-1111-4abc-9def-0123456789ab failed at 2025-01-15T10:30:00Z");
    let b = normalize_message("order AAAAAAAA-2222-4abc-9def-ffffffffffff failed at 2024-12-01 08:00:12.5+02:00");
    assert_eq!(a, b);
    assert_eq!(a, "order <uuid> failed at <ts>");
  }

  #[test]
  fn message_hex_and_whitespace() {
    assert_eq!(
      normalize_message("segfault  at 0xDEADBEEF\n"),
      "segfault at <hex>"
    );
  }

  #[test]
  fn stack_keeps_top_frames_and_strips_addresses() {
    let stack = "Error: boom\n  at f (src/a.js:10:5)\n\n  at g (0x7ffe1234)\n  at h (src/c.js:3:1)";
    let frames = normalize_stack(stack, 3);
    assert_eq!(
      frames,
      vec!["Error: boom", "at f (src/a.js:10:5)", "at g (<addr>)"]
    );
  }

  #[test]
  fn normalize_valid_event() {
    let mut r = raw();
    r.level = "Warning".into();
    r.source = "Frontend".into();
    r.event_id = Some("  ".into());
    r.stack = Some("".into());
    let event = normalize(&r).unwrap();
    assert_eq!(event.level, Level::Warn);
    assert_eq!(event.source, Source::Frontend);
    assert!(event.event_id.is_none());
    assert!(event.stack.is_none());
  }

  #[test]
  fn normalize_rejects_missing_fields() {
    let cases: [(&str, fn(&mut InboundEvent)); 6] = [
      ("project_id", |r: &mut InboundEvent| r.project_id = None),
      ("environment_id", |r: &mut InboundEvent| r.environment_id = None),
      ("message", |r: &mut InboundEvent| r.message = "  ".into()),
      ("level", |r: &mut InboundEvent| r.level = "".into()),
      ("source", |r: &mut InboundEvent| r.source = "".into()),
      ("timestamp", |r: &mut InboundEvent| r.timestamp = "".into()),
    ];
    for (field, mutate) in cases {
      let mut r = raw();
      mutate(&mut r);
      match normalize(&r) {
        Err(EngineError::Validation { field: f, .. }) => assert_eq!(f, field),
        other => panic!("expected validation error on {}, got {:?}", field, other),
      }
    }
  }

  #[test]
  fn normalize_rejects_bad_values() {
    let mut r = raw();
    r.level = "loud".into();
    assert!(normalize(&r).unwrap_err().to_string().contains("level"));

    let mut r = raw();
    r.timestamp = "yesterday".into();
    assert!(normalize(&r).unwrap_err().to_string().contains("timestamp"));
  }
}
