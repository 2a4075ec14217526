//! Core types for the grouping engine (JSON contracts + internal models).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Inbound types (JSON contract, as sent by the SDK)
// ---------------------------------------------------------------------------

/// One ingested error event. Unknown fields are silently ignored; required
/// fields default to empty so validation can name the missing one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundEvent {
  #[serde(default)]
  pub project_id: Option<i64>,
  #[serde(default)]
  pub environment_id: Option<i64>,
  /// Optional client-side id; makes re-delivery idempotent.
  #[serde(default)]
  pub event_id: Option<String>,
  #[serde(default)]
  pub timestamp: String,
  #[serde(default)]
  pub source: String,
  #[serde(default)]
  pub level: String,
  #[serde(default)]
  pub message: String,
  #[serde(default)]
  pub stack: Option<String>,
  #[serde(default)]
  pub url: Option<String>,
  #[serde(default)]
  pub method: Option<String>,
  #[serde(default)]
  pub status_code: Option<i32>,
  #[serde(default)]
  pub user_agent: Option<String>,
  #[serde(default)]
  pub user_id: Option<String>,
  #[serde(default)]
  pub request_body: Option<String>,
  #[serde(default)]
  pub request_headers: Option<serde_json::Value>,
  #[serde(default)]
  pub response_body: Option<String>,
  #[serde(default)]
  pub response_time_ms: Option<i64>,
  #[serde(default)]
  pub extra_data: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Enums (normalized)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
  Error,
  Warn,
  Info,
}

impl Level {
  pub fn from_str_loose(s: &str) -> Option<Self> {
    match s.to_ascii_lowercase().as_str() {
      "error" | "err" | "fatal" | "critical" => Some(Self::Error),
      "warn" | "warning" => Some(Self::Warn),
      "info" => Some(Self::Info),
      _ => None,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Error => "error",
      Self::Warn => "warn",
      Self::Info => "info",
    }
  }
}

impl fmt::Display for Level {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
  Frontend,
  Backend,
}

impl Source {
  pub fn from_str_loose(s: &str) -> Option<Self> {
    match s.to_ascii_lowercase().as_str() {
      "frontend" | "browser" | "client" => Some(Self::Frontend),
      "backend" | "server" => Some(Self::Backend),
      _ => None,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Frontend => "frontend",
      Self::Backend => "backend",
    }
  }
}

impl fmt::Display for Source {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Lifecycle status of an error group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
  Unresolved,
  Resolved,
  Ignored,
}

impl GroupStatus {
  pub fn from_str_loose(s: &str) -> Option<Self> {
    match s.to_ascii_lowercase().as_str() {
      "unresolved" | "open" => Some(Self::Unresolved),
      "resolved" => Some(Self::Resolved),
      "ignored" => Some(Self::Ignored),
      _ => None,
    }
  }

  /// Legal edges: resolve and ignore leave `unresolved`; reopen returns to it.
  pub fn can_transition_to(self, to: GroupStatus) -> bool {
    matches!(
      (self, to),
      (Self::Unresolved, Self::Resolved)
        | (Self::Unresolved, Self::Ignored)
        | (Self::Resolved, Self::Unresolved)
        | (Self::Ignored, Self::Unresolved)
    )
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Unresolved => "unresolved",
      Self::Resolved => "resolved",
      Self::Ignored => "ignored",
    }
  }
}

impl fmt::Display for GroupStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

// ---------------------------------------------------------------------------
// Internal normalized types
// ---------------------------------------------------------------------------

/// Request/response context attached to an occurrence; stored verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
  pub url: Option<String>,
  pub method: Option<String>,
  pub status_code: Option<i32>,
  pub user_agent: Option<String>,
  pub user_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub request_body: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub request_headers: Option<serde_json::Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub response_body: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub response_time_ms: Option<i64>,
  pub extra_data: Option<serde_json::Value>,
}

/// Canonical internal event after validation.
#[derive(Debug, Clone)]
pub struct Event {
  pub project_id: i64,
  pub environment_id: i64,
  pub event_id: Option<String>,
  pub timestamp: DateTime<Utc>,
  pub source: Source,
  pub level: Level,
  pub message: String,
  pub stack: Option<String>,
  pub context: RequestContext,
}

/// A stable hex string identifying a unique error group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Identity of an error group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
  pub project_id: i64,
  pub environment_id: i64,
  pub fingerprint: Fingerprint,
}

impl GroupKey {
  pub fn for_event(event: &Event, fingerprint: Fingerprint) -> Self {
    Self {
      project_id: event.project_id,
      environment_id: event.environment_id,
      fingerprint,
    }
  }
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

/// Aggregated error group. Serialized in the dashboard's camelCase shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorGroup {
  pub id: i64,
  pub project_id: i64,
  pub environment_id: i64,
  pub fingerprint: Fingerprint,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub stack: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub url: Option<String>,
  pub source: Source,
  pub level: Level,
  pub first_seen: DateTime<Utc>,
  pub last_seen: DateTime<Utc>,
  pub occurrence_count: u64,
  pub status: GroupStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub resolved_at: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub resolved_by: Option<i64>,
  pub notification_count: u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub last_notified_at: Option<DateTime<Utc>>,
  pub created_at: DateTime<Utc>,
}

/// One stored occurrence of an error group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLog {
  pub id: i64,
  pub project_id: i64,
  pub environment_id: i64,
  pub error_group_id: i64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub event_id: Option<String>,
  pub timestamp: DateTime<Utc>,
  pub source: Source,
  pub level: Level,
  pub message: String,
  pub stack: Option<String>,
  #[serde(flatten)]
  pub context: RequestContext,
  pub resolved: bool,
  pub created_at: DateTime<Utc>,
}

/// Query for listing groups of one project.
#[derive(Debug, Clone)]
pub struct GroupFilter {
  pub project_id: i64,
  pub environment_id: Option<i64>,
  pub status: Option<GroupStatus>,
  pub limit: usize,
  pub offset: usize,
}

impl GroupFilter {
  pub const DEFAULT_LIMIT: usize = 50;

  pub fn project(project_id: i64) -> Self {
    Self {
      project_id,
      environment_id: None,
      status: None,
      limit: Self::DEFAULT_LIMIT,
      offset: 0,
    }
  }
}

/// Query for listing occurrences across a project.
#[derive(Debug, Clone)]
pub struct OccurrenceFilter {
  pub project_id: i64,
  pub environment_id: Option<i64>,
  pub error_group_id: Option<i64>,
  pub level: Option<Level>,
  pub source: Option<Source>,
  pub limit: usize,
  pub offset: usize,
}

impl OccurrenceFilter {
  pub const DEFAULT_LIMIT: usize = 100;

  pub fn project(project_id: i64) -> Self {
    Self {
      project_id,
      environment_id: None,
      error_group_id: None,
      level: None,
      source: None,
      limit: Self::DEFAULT_LIMIT,
      offset: 0,
    }
  }

  pub fn matches(&self, log: &ErrorLog) -> bool {
    log.project_id == self.project_id
      && self.environment_id.map_or(true, |id| id == log.environment_id)
      && self.error_group_id.map_or(true, |id| id == log.error_group_id)
      && self.level.map_or(true, |level| level == log.level)
      && self.source.map_or(true, |source| source == log.source)
  }
}

// ---------------------------------------------------------------------------
// Notification settings (embedded in Environment.settings)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSettings {
  #[serde(default)]
  pub notifications: NotificationSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationSettings {
  #[serde(default)]
  pub telegram: TelegramSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelegramSettings {
  #[serde(default)]
  pub enabled: bool,
  #[serde(default)]
  pub bot_token: String,
  #[serde(default)]
  pub chat_id: String,
  #[serde(default)]
  pub triggers: Triggers,
}

impl TelegramSettings {
  /// Enabled and carrying both credentials.
  pub fn is_deliverable(&self) -> bool {
    self.enabled && !self.bot_token.trim().is_empty() && !self.chat_id.trim().is_empty()
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Triggers {
  #[serde(default)]
  pub new_error: bool,
  #[serde(default)]
  pub threshold: ThresholdTrigger,
  #[serde(default)]
  pub spike_on_ignored: bool,
  /// Alert when a resolved group receives a new occurrence.
  #[serde(default)]
  pub regression: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdTrigger {
  #[serde(default)]
  pub enabled: bool,
  #[serde(default, deserialize_with = "loose_u32")]
  pub count: u32,
  #[serde(default, deserialize_with = "loose_u32")]
  pub window_minutes: u32,
}

/// The dashboard posts numeric inputs either as numbers or strings ("" means unset).
fn loose_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
  D: Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Loose {
    Int(u64),
    Float(f64),
    Text(String),
    Null,
  }

  match Loose::deserialize(deserializer)? {
    Loose::Int(v) => u32::try_from(v).map_err(serde::de::Error::custom),
    Loose::Float(v) if v.fract() != 0.0 => {
      Err(serde::de::Error::custom(format!("expected a whole number: {}", v)))
    }
    Loose::Float(v) if v >= 0.0 && v <= f64::from(u32::MAX) => Ok(v as u32),
    Loose::Float(v) => Err(serde::de::Error::custom(format!("out of range: {}", v))),
    Loose::Text(s) if s.trim().is_empty() => Ok(0),
    Loose::Text(s) => s.trim().parse::<u32>().map_err(serde::de::Error::custom),
    Loose::Null => Ok(0),
  }
}

// ---------------------------------------------------------------------------
// Alerting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertRule {
  NewError,
  ThresholdExceeded,
  IgnoredSpike,
  Regression,
}

impl AlertRule {
  pub fn label(self) -> &'static str {
    match self {
      Self::NewError => "New error",
      Self::ThresholdExceeded => "Threshold exceeded",
      Self::IgnoredSpike => "Ignored error spike",
      Self::Regression => "Regression",
    }
  }
}

/// Decision to notify; handed to a dispatcher, never sent by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertIntent {
  pub project_id: i64,
  pub environment_id: i64,
  pub group_id: i64,
  pub rule: AlertRule,
  pub level: Level,
  pub occurrence_count: u64,
  pub message_summary: String,
  pub at: DateTime<Utc>,
}

/// Result of one ingested event.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
  pub occurrence_id: i64,
  pub group_id: i64,
  pub fingerprint: String,
  pub created: bool,
  pub duplicate: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub alert: Option<AlertIntent>,
}

// ---------------------------------------------------------------------------
// CLI stream wrappers
// ---------------------------------------------------------------------------

/// Structured error output for rejected input.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorOutput {
  pub error: bool,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub field: Option<String>,
}

impl ErrorOutput {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      error: true,
      message: message.into(),
      field: None,
    }
  }

  pub fn with_field(mut self, field: impl Into<String>) -> Self {
    self.field = Some(field.into());
    self
  }
}
