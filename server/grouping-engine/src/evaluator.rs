//! Alert trigger evaluation: decide whether an occurrence should notify.
//!
//! Rules run in a fixed order and the first match wins, so one occurrence
//! yields at most one alert intent:
//! 1. new error (group was just created)
//! 2. threshold (N occurrences in the trailing window), edge-triggered
//! 3. spike on an ignored group (current rate vs established baseline)
//! 4. regression (first occurrence on a group since it was resolved)

use chrono::{DateTime, Duration, Utc};

use crate::config::Config;
use crate::types::{AlertIntent, AlertRule, ErrorGroup, GroupStatus, Level, NotificationSettings};
use crate::window::OccurrenceWindow;

/// Edge-trigger memory of one group.
#[derive(Debug, Clone, Default)]
pub struct TriggerState {
  pub threshold_fired_at: Option<DateTime<Utc>>,
  /// `resolved_at` of the resolution a regression was already reported for.
  pub regression_fired_for: Option<DateTime<Utc>>,
}

impl TriggerState {
  /// Suppressed until the window has rolled past the triggering occurrence.
  fn threshold_suppressed(&self, now: DateTime<Utc>, window: Duration) -> bool {
    self.threshold_fired_at.is_some_and(|fired| now < fired + window)
  }

  /// A regression fires once per resolution; resolving again re-arms it.
  fn regression_pending(&self, resolved_at: Option<DateTime<Utc>>) -> bool {
    resolved_at.is_some() && self.regression_fired_for != resolved_at
  }
}

/// Everything the evaluator looks at for one occurrence.
#[derive(Debug, Clone, Copy)]
pub struct TriggerInput<'a> {
  pub group: &'a ErrorGroup,
  pub created: bool,
  pub regression: bool,
  pub level: Level,
  pub at: DateTime<Utc>,
  pub settings: &'a NotificationSettings,
}

/// Evaluate all rules for one occurrence.
///
/// `window` must already contain the occurrence being evaluated.
pub fn evaluate(
  input: TriggerInput<'_>,
  window: &OccurrenceWindow,
  state: &mut TriggerState,
  config: &Config,
) -> Option<AlertIntent> {
  let telegram = &input.settings.telegram;
  if !telegram.is_deliverable() {
    return None;
  }
  let triggers = &telegram.triggers;

  // Threshold is evaluated up front so a burst that qualifies while another
  // rule wins still arms the edge trigger.
  let threshold_hit = if triggers.threshold.enabled && triggers.threshold.count > 0 {
    let minutes = i64::from(triggers.threshold.window_minutes);
    let span = Duration::minutes(minutes);
    let count = window.count_trailing(input.at, minutes);
    if count >= triggers.threshold.count as usize && !state.threshold_suppressed(input.at, span) {
      state.threshold_fired_at = Some(input.at);
      true
    } else {
      false
    }
  } else {
    false
  };

  // Same for regression: one resolution yields at most one regression alert.
  let regression_hit = if triggers.regression
    && input.regression
    && state.regression_pending(input.group.resolved_at)
  {
    state.regression_fired_for = input.group.resolved_at;
    true
  } else {
    false
  };

  let rule = if triggers.new_error && input.created {
    Some(AlertRule::NewError)
  } else if threshold_hit {
    Some(AlertRule::ThresholdExceeded)
  } else if triggers.spike_on_ignored
    && input.group.status == GroupStatus::Ignored
    && is_spike(input.at, window, config)
  {
    Some(AlertRule::IgnoredSpike)
  } else if regression_hit {
    Some(AlertRule::Regression)
  } else {
    None
  };
  let rule = rule?;

  Some(AlertIntent {
    project_id: input.group.project_id,
    environment_id: input.group.environment_id,
    group_id: input.group.id,
    rule,
    level: input.level,
    occurrence_count: input.group.occurrence_count,
    message_summary: summarize(rule, &input.group.message, config.summary_max_chars),
    at: input.at,
  })
}

fn is_spike(at: DateTime<Utc>, window: &OccurrenceWindow, config: &Config) -> bool {
  window
    .spike_reading(at, config.spike_current_minutes, config.spike_baseline_minutes)
    .factor()
    .is_some_and(|factor| factor >= config.spike_factor)
}

/// "<rule label>: <message>", message cut at `max_chars` on a char boundary.
fn summarize(rule: AlertRule, message: &str, max_chars: usize) -> String {
  let first_line = message.lines().next().unwrap_or_default().trim();
  let mut text: String = first_line.chars().take(max_chars).collect();
  if first_line.chars().count() > max_chars {
    text.push('…');
  }
  format!("{}: {}", rule.label(), text)
}
