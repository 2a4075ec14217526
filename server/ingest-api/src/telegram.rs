//! Telegram Bot API notifier and alert message formatting.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use grouping_engine::types::{AlertRule, Level};
use grouping_engine::{ErrorGroup, GroupStatus};

use crate::dispatch::{ChatTarget, DispatchError, Notifier};

const STACK_PREVIEW_LINES: usize = 3;
/// Bot API cap on `sendMessage` text.
pub const TELEGRAM_TEXT_LIMIT: usize = 4096;
/// Raw characters kept from the error message; escaping at most doubles them.
const MESSAGE_MAX_CHARS: usize = 500;
const STACK_LINE_MAX_CHARS: usize = 200;

// ---------------------------------------------------------------------------
// Bot API client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct TelegramNotifier {
  client: reqwest::Client,
  api_base: String,
}

#[derive(Serialize)]
struct SendMessage<'a> {
  chat_id: &'a str,
  text: &'a str,
  parse_mode: &'static str,
}

#[derive(Deserialize)]
struct ApiReply {
  #[serde(default)]
  description: Option<String>,
}

impl TelegramNotifier {
  pub fn new(api_base: impl Into<String>, timeout: Duration) -> Result<Self, DispatchError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| DispatchError::Transport(e.to_string()))?;
    Ok(Self {
      client,
      api_base: api_base.into(),
    })
  }
}

#[async_trait::async_trait]
impl Notifier for TelegramNotifier {
  async fn send_message(&self, target: &ChatTarget, text: &str) -> Result<(), DispatchError> {
    let url = format!("{}/bot{}/sendMessage", self.api_base, target.bot_token);
    let payload = SendMessage {
      chat_id: &target.chat_id,
      text,
      parse_mode: "Markdown",
    };

    // Errors carry the request URL, which embeds the bot token.
    let resp = self
      .client
      .post(&url)
      .json(&payload)
      .send()
      .await
      .map_err(|e| DispatchError::Transport(e.without_url().to_string()))?;

    let status = resp.status();
    if status.is_success() {
      return Ok(());
    }
    let description = resp.json::<ApiReply>().await.ok().and_then(|r| r.description);
    Err(describe_failure(status.as_u16(), description.as_deref()))
  }
}

/// Map a Bot API error reply onto something a project admin can act on.
pub fn describe_failure(status: u16, description: Option<&str>) -> DispatchError {
  match description {
    Some(d) if d.contains("bot was blocked") => DispatchError::BotBlocked,
    Some(d) if d.contains("chat not found") => DispatchError::ChatNotFound,
    Some(d) if d.contains("Unauthorized") => DispatchError::InvalidToken,
    Some(d) => DispatchError::Api(d.to_owned()),
    None => DispatchError::Status(status),
  }
}

// ---------------------------------------------------------------------------
// Messages (legacy Markdown parse mode)
// ---------------------------------------------------------------------------

pub struct AlertMessage<'a> {
  pub rule: AlertRule,
  pub group: &'a ErrorGroup,
  pub environment: &'a str,
  pub view_url: String,
}

/// Escape the characters legacy Markdown treats as markup.
pub fn escape_markdown(text: &str) -> String {
  let mut out = String::with_capacity(text.len());
  for c in text.chars() {
    if matches!(c, '_' | '*' | '`' | '[') {
      out.push('\\');
    }
    out.push(c);
  }
  out
}

/// Cut `text` to `max` characters, marking the cut with an ellipsis.
fn clip(text: &str, max: usize) -> String {
  if text.chars().count() <= max {
    return text.to_owned();
  }
  let mut out: String = text.chars().take(max).collect();
  out.push('…');
  out
}

fn stack_preview(stack: Option<&str>) -> Option<String> {
  let lines: Vec<&str> = stack?.lines().filter(|l| !l.trim().is_empty()).collect();
  if lines.is_empty() {
    return None;
  }
  let mut preview = lines
    .iter()
    .take(STACK_PREVIEW_LINES)
    .map(|l| clip(&l.replace('`', "'"), STACK_LINE_MAX_CHARS))
    .collect::<Vec<_>>()
    .join("\n");
  if lines.len() > STACK_PREVIEW_LINES {
    preview.push_str("\n... (view full stack in dashboard)");
  }
  Some(preview)
}

pub fn format_alert(msg: &AlertMessage<'_>) -> String {
  let group = msg.group;
  let env = escape_markdown(msg.environment);
  let message = escape_markdown(&clip(&group.message, MESSAGE_MAX_CHARS));

  let mut text = match msg.rule {
    AlertRule::IgnoredSpike => {
      return format!(
        "⚠️ *IGNORED ERROR SPIKE* in {env}\n\n\
         An ignored error is suddenly spiking!\n\n\
         *Error:* {message}\n\
         *Environment:* {env}\n\
         *Occurrences:* {count}\n\
         *Status:* Previously ignored\n\n\
         This might indicate a new issue. Consider investigating.\n\n\
         [View Details]({url})",
        count = group.occurrence_count,
        url = msg.view_url,
      );
    }
    AlertRule::ThresholdExceeded => format!("🚨 *ERROR THRESHOLD REACHED* in {}\n\n", env),
    AlertRule::Regression => format!("♻️ *REGRESSION* in {}\n\nA resolved error occurred again.\n\n", env),
    AlertRule::NewError => {
      let emoji = if group.level == Level::Warn { "🟡" } else { "🔴" };
      let status = if group.occurrence_count > 1 { "RECURRING" } else { "NEW" };
      format!("{} *{} ERROR* in {}\n\n", emoji, status, env)
    }
  };

  let status = match group.status {
    GroupStatus::Unresolved => "Unresolved",
    GroupStatus::Resolved => "Resolved",
    GroupStatus::Ignored => "Ignored",
  };
  text.push_str(&format!(
    "*Message:* {}\n*Environment:* {}\n*Level:* {}\n*Occurrences:* {}\n*First Seen:* {}\n*Status:* {}\n\n",
    message,
    env,
    group.level,
    group.occurrence_count,
    group.first_seen.format("%b %-d, %-I:%M %p"),
    status,
  ));

  if let Some(preview) = stack_preview(group.stack.as_deref()) {
    text.push_str(&format!("*Stack Trace:*\n```\n{}\n```\n\n", preview));
  }
  text.push_str(&format!("[View Full Details]({})", msg.view_url));
  if text.chars().count() > TELEGRAM_TEXT_LIMIT {
    text = clip(&text, TELEGRAM_TEXT_LIMIT - 1);
  }
  text
}

pub fn test_message() -> String {
  "🔔 *Test Notification from Vigil Eye*\n\n\
   Your Telegram notifications are configured correctly!\n\n\
   You will receive alerts when:\n\
   • New unique errors occur\n\
   • Error thresholds are reached\n\
   • Ignored errors spike unexpectedly\n\n\
   ✅ Setup complete!"
    .to_owned()
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{TimeZone, Utc};
  use grouping_engine::types::{Fingerprint, Source};

  fn group(count: u64, level: Level, stack: Option<&str>) -> ErrorGroup {
    let ts = Utc.with_ymd_and_hms(2025, 1, 2, 15, 4, 0).unwrap();
    ErrorGroup {
      id: 12,
      project_id: 3,
      environment_id: 4,
      fingerprint: Fingerprint("0".repeat(32)),
      message: "user_id is *missing*".into(),
      stack: stack.map(str::to_owned),
      url: None,
      source: Source::Backend,
      level,
      first_seen: ts,
      last_seen: ts,
      occurrence_count: count,
      status: GroupStatus::Unresolved,
      resolved_at: None,
      resolved_by: None,
      notification_count: 0,
      last_notified_at: None,
      created_at: ts,
    }
  }

  fn message(rule: AlertRule, group: &ErrorGroup) -> String {
    format_alert(&AlertMessage {
      rule,
      group,
      environment: "production",
      view_url: "http://localhost:5173/projects/3/error-groups/12".into(),
    })
  }

  #[test]
  fn new_error_message() {
    let g = group(1, Level::Error, Some("Error: boom\n at a\n at b\n at c\n at d"));
    let text = message(AlertRule::NewError, &g);
    assert!(text.starts_with("🔴 *NEW ERROR* in production"));
    assert!(text.contains("*Message:* user\\_id is \\*missing\\*"));
    assert!(text.contains("*First Seen:* Jan 2, 3:04 PM"));
    assert!(text.contains(" at b\n... (view full stack in dashboard)"));
    assert!(!text.contains(" at c"));
    assert!(text.ends_with("[View Full Details](http://localhost:5173/projects/3/error-groups/12)"));
  }

  #[test]
  fn warning_and_recurring_variants() {
    let g = group(4, Level::Warn, None);
    let text = message(AlertRule::NewError, &g);
    assert!(text.starts_with("🟡 *RECURRING ERROR*"));
    assert!(!text.contains("Stack Trace"));
  }

  #[test]
  fn spike_and_threshold_headers() {
    let g = group(250, Level::Error, None);
    assert!(message(AlertRule::IgnoredSpike, &g).starts_with("⚠️ *IGNORED ERROR SPIKE* in production"));
    assert!(message(AlertRule::IgnoredSpike, &g).contains("*Occurrences:* 250"));
    assert!(message(AlertRule::ThresholdExceeded, &g).starts_with("🚨 *ERROR THRESHOLD REACHED*"));
    assert!(message(AlertRule::Regression, &g).contains("A resolved error occurred again."));
  }

  #[test]
  fn long_errors_fit_in_one_message() {
    let long_line = "x".repeat(5000);
    let mut g = group(1, Level::Error, Some(&format!("{l}\n{l}\n{l}\n{l}", l = long_line)));
    g.message = "_*".repeat(3000);
    for rule in [
      AlertRule::NewError,
      AlertRule::ThresholdExceeded,
      AlertRule::IgnoredSpike,
      AlertRule::Regression,
    ] {
      let text = message(rule, &g);
      assert!(text.chars().count() <= TELEGRAM_TEXT_LIMIT, "{:?}: {}", rule, text.chars().count());
      assert!(text.contains('…'));
      assert!(text.contains("[View"));
    }
  }

  #[test]
  fn api_errors_are_made_friendly() {
    assert!(matches!(
      describe_failure(403, Some("Forbidden: bot was blocked by the user")),
      DispatchError::BotBlocked
    ));
    assert!(matches!(
      describe_failure(400, Some("Bad Request: chat not found")),
      DispatchError::ChatNotFound
    ));
    assert!(matches!(describe_failure(401, Some("Unauthorized")), DispatchError::InvalidToken));
    assert_eq!(
      describe_failure(400, Some("Bad Request: message is too long")).to_string(),
      "telegram API error: Bad Request: message is too long"
    );
    assert_eq!(describe_failure(502, None).to_string(), "telegram API error: status 502");
  }
}
