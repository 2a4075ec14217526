//! Core engine: owns the stores, ingests events, evaluates alert triggers.

use chrono::Utc;

use crate::config::Config;
use crate::environment::EnvironmentRegistry;
use crate::error::EngineError;
use crate::evaluator::{self, TriggerInput};
use crate::recorder::Recorder;
use crate::store::GroupStore;
use crate::types::*;

/// The grouping engine. Shared across request handlers behind an `Arc`.
#[derive(Debug, Default)]
pub struct Engine {
  config: Config,
  store: GroupStore,
  environments: EnvironmentRegistry,
}

impl Engine {
  pub fn new(config: Config) -> Self {
    Self {
      config,
      store: GroupStore::new(),
      environments: EnvironmentRegistry::new(),
    }
  }

  pub fn with_defaults() -> Self {
    Self::new(Config::default())
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn store(&self) -> &GroupStore {
    &self.store
  }

  pub fn environments(&self) -> &EnvironmentRegistry {
    &self.environments
  }

  /// Ingest one event: record it, then evaluate triggers against `settings`.
  ///
  /// Recording and evaluation happen under the same group lock, so concurrent
  /// events of one group see each other's counts in order.
  pub fn ingest(
    &self,
    raw: &InboundEvent,
    settings: &NotificationSettings,
  ) -> Result<IngestOutcome, EngineError> {
    let threshold_minutes = i64::from(settings.telegram.triggers.threshold.window_minutes);
    let recorder = Recorder::new(&self.store, &self.config).with_retention(threshold_minutes);

    let (recorded, alert) = recorder.record_then(raw, |slot, recorded| {
      let input = TriggerInput {
        group: &recorded.group,
        created: recorded.created,
        regression: recorded.regression,
        level: recorded.level,
        at: recorded.timestamp,
        settings,
      };
      evaluator::evaluate(input, &slot.window, &mut slot.triggers, &self.config)
    })?;
    let alert = alert.flatten();

    if let Some(intent) = &alert {
      tracing::info!(
        group_id = intent.group_id,
        rule = ?intent.rule,
        occurrence_count = intent.occurrence_count,
        "alert triggered"
      );
    }

    Ok(IngestOutcome {
      occurrence_id: recorded.occurrence_id,
      group_id: recorded.group.id,
      fingerprint: recorded.fingerprint.0,
      created: recorded.created,
      duplicate: recorded.duplicate,
      alert,
    })
  }

  // -------------------------------------------------------------------------
  // Group lifecycle
  // -------------------------------------------------------------------------

  pub fn set_status(
    &self,
    group_id: i64,
    to: GroupStatus,
    acting_user_id: Option<i64>,
  ) -> Result<ErrorGroup, EngineError> {
    self.store.set_status(group_id, to, acting_user_id, Utc::now())
  }

  pub fn resolve(&self, group_id: i64, acting_user_id: Option<i64>) -> Result<ErrorGroup, EngineError> {
    self.set_status(group_id, GroupStatus::Resolved, acting_user_id)
  }

  pub fn ignore(&self, group_id: i64, acting_user_id: Option<i64>) -> Result<ErrorGroup, EngineError> {
    self.set_status(group_id, GroupStatus::Ignored, acting_user_id)
  }

  pub fn reopen(&self, group_id: i64, acting_user_id: Option<i64>) -> Result<ErrorGroup, EngineError> {
    self.set_status(group_id, GroupStatus::Unresolved, acting_user_id)
  }

  // -------------------------------------------------------------------------
  // Reads
  // -------------------------------------------------------------------------

  /// One group, scoped to its project.
  pub fn group(&self, project_id: i64, group_id: i64) -> Result<ErrorGroup, EngineError> {
    let group = self.store.get(group_id)?;
    if group.project_id != project_id {
      return Err(EngineError::not_found("error group", group_id));
    }
    Ok(group)
  }

  pub fn list_groups(&self, filter: &GroupFilter) -> Result<Vec<ErrorGroup>, EngineError> {
    self.store.list(filter)
  }

  pub fn occurrences(
    &self,
    project_id: i64,
    group_id: i64,
    limit: usize,
    offset: usize,
  ) -> Result<Vec<ErrorLog>, EngineError> {
    self.group(project_id, group_id)?;
    self.store.occurrences(group_id, limit, offset)
  }

  pub fn list_occurrences(&self, filter: &OccurrenceFilter) -> Result<Vec<ErrorLog>, EngineError> {
    self.store.list_occurrences(filter)
  }

  /// Groups of an environment that have been alerted on, for the notification history.
  pub fn notified_groups(
    &self,
    project_id: i64,
    environment_id: i64,
    limit: usize,
  ) -> Result<Vec<ErrorGroup>, EngineError> {
    self.store.notified(project_id, environment_id, limit)
  }

  pub fn occurrence(&self, project_id: i64, occurrence_id: i64) -> Result<ErrorLog, EngineError> {
    let log = self.store.occurrence(occurrence_id)?;
    if log.project_id != project_id {
      return Err(EngineError::not_found("occurrence", occurrence_id));
    }
    Ok(log)
  }

  pub fn set_occurrence_resolved(
    &self,
    project_id: i64,
    occurrence_id: i64,
    resolved: bool,
  ) -> Result<ErrorLog, EngineError> {
    self.occurrence(project_id, occurrence_id)?;
    self.store.set_occurrence_resolved(occurrence_id, resolved)
  }

  pub fn mark_notified(&self, group_id: i64) -> Result<ErrorGroup, EngineError> {
    self.store.mark_notified(group_id, Utc::now())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn make_inbound(message: &str, ts: &str) -> InboundEvent {
    InboundEvent {
      project_id: Some(1),
      environment_id: Some(2),
      timestamp: ts.into(),
      source: "backend".into(),
      level: "error".into(),
      message: message.into(),
      stack: Some("Error\n  at handler (src/api.ts:42:7)\n  at next (src/router.ts:10:3)".into()),
      ..Default::default()
    }
  }

  fn telegram(triggers: Triggers) -> NotificationSettings {
    NotificationSettings {
      telegram: TelegramSettings {
        enabled: true,
        bot_token: "123:abc".into(),
        chat_id: "-100200".into(),
        triggers,
      },
    }
  }

  #[test]
  fn repeated_error_groups_and_alerts_once() {
    let engine = Engine::with_defaults();
    let settings = telegram(Triggers {
      new_error: true,
      ..Triggers::default()
    });

    let outcomes: Vec<IngestOutcome> = ["10:00:00", "10:00:05", "10:00:10"]
      .iter()
      .map(|t| {
        engine
          .ingest(&make_inbound("Order 17 failed", &format!("2025-01-15T{}Z", t)), &settings)
          .unwrap()
      })
      .collect();

    assert!(outcomes.iter().all(|o| o.group_id == outcomes[0].group_id));
    assert_eq!(outcomes.iter().filter(|o| o.alert.is_some()).count(), 1);
    assert_eq!(outcomes[0].alert.as_ref().unwrap().rule, AlertRule::NewError);

    let group = engine.group(1, outcomes[0].group_id).unwrap();
    assert_eq!(group.occurrence_count, 3);
    assert_eq!(engine.occurrences(1, group.id, 50, 0).unwrap().len(), 3);
  }

  #[test]
  fn different_numbers_share_a_group() {
    let engine = Engine::with_defaults();
    let settings = NotificationSettings::default();
    let a = engine.ingest(&make_inbound("Order 17 failed", "2025-01-15T10:00:00Z"), &settings).unwrap();
    let b = engine.ingest(&make_inbound("Order 942 failed", "2025-01-15T10:00:01Z"), &settings).unwrap();
    let c = engine.ingest(&make_inbound("Payment declined", "2025-01-15T10:00:02Z"), &settings).unwrap();
    assert_eq!(a.group_id, b.group_id);
    assert_ne!(a.group_id, c.group_id);
  }

  #[test]
  fn threshold_fires_on_tenth_within_window() {
    let engine = Engine::with_defaults();
    let settings = telegram(Triggers {
      threshold: ThresholdTrigger {
        enabled: true,
        count: 10,
        window_minutes: 5,
      },
      ..Triggers::default()
    });

    let mut fired = Vec::new();
    for i in 0..12 {
      let ts = format!("2025-01-15T10:0{}:{:02}Z", i / 3, (i % 3) * 20);
      let out = engine.ingest(&make_inbound("Timeout calling upstream", &ts), &settings).unwrap();
      if let Some(alert) = out.alert {
        fired.push((i + 1, alert.rule));
      }
    }
    assert_eq!(fired, vec![(10, AlertRule::ThresholdExceeded)]);
  }

  #[test]
  fn disabled_telegram_never_alerts() {
    let engine = Engine::with_defaults();
    let mut settings = telegram(Triggers {
      new_error: true,
      ..Triggers::default()
    });
    settings.telegram.enabled = false;

    let out = engine.ingest(&make_inbound("boom", "2025-01-15T10:00:00Z"), &settings).unwrap();
    assert!(out.created);
    assert!(out.alert.is_none());
  }

  #[test]
  fn resolved_group_stays_resolved_and_can_alert_regression() {
    let engine = Engine::with_defaults();
    let settings = telegram(Triggers {
      regression: true,
      ..Triggers::default()
    });
    let first = engine.ingest(&make_inbound("boom", "2025-01-15T10:00:00Z"), &settings).unwrap();
    engine.resolve(first.group_id, Some(9)).unwrap();

    let again = engine.ingest(&make_inbound("boom", "2025-01-15T10:10:00Z"), &settings).unwrap();
    assert_eq!(again.alert.unwrap().rule, AlertRule::Regression);

    let group = engine.group(1, first.group_id).unwrap();
    assert_eq!(group.status, GroupStatus::Resolved);
    assert_eq!(group.resolved_by, Some(9));
    assert_eq!(group.occurrence_count, 2);
  }

  #[test]
  fn regression_alerts_once_until_resolved_again() {
    let engine = Engine::with_defaults();
    let settings = telegram(Triggers {
      regression: true,
      ..Triggers::default()
    });
    let first = engine.ingest(&make_inbound("boom", "2025-01-15T10:00:00Z"), &settings).unwrap();
    engine.resolve(first.group_id, None).unwrap();

    let rules: Vec<Option<AlertRule>> = (1..=5)
      .map(|i| {
        let ts = format!("2025-01-15T10:{:02}:00Z", i * 2);
        engine
          .ingest(&make_inbound("boom", &ts), &settings)
          .unwrap()
          .alert
          .map(|a| a.rule)
      })
      .collect();
    assert_eq!(rules.iter().filter(|r| r.is_some()).count(), 1);
    assert_eq!(rules[0], Some(AlertRule::Regression));

    engine.reopen(first.group_id, None).unwrap();
    assert!(engine
      .ingest(&make_inbound("boom", "2025-01-15T10:20:00Z"), &settings)
      .unwrap()
      .alert
      .is_none());
    engine.resolve(first.group_id, None).unwrap();
    let again = engine.ingest(&make_inbound("boom", "2025-01-15T10:30:00Z"), &settings).unwrap();
    assert_eq!(again.alert.map(|a| a.rule), Some(AlertRule::Regression));
  }

  #[test]
  fn reads_are_scoped_to_project() {
    let engine = Engine::with_defaults();
    let out = engine
      .ingest(&make_inbound("boom", "2025-01-15T10:00:00Z"), &NotificationSettings::default())
      .unwrap();
    assert!(matches!(engine.group(99, out.group_id), Err(EngineError::NotFound { .. })));
    assert!(engine.occurrence(99, out.occurrence_id).is_err());
    assert!(engine.set_occurrence_resolved(1, out.occurrence_id, true).unwrap().resolved);
  }

  #[test]
  fn invalid_transition_is_rejected() {
    let engine = Engine::with_defaults();
    let out = engine
      .ingest(&make_inbound("boom", "2025-01-15T10:00:00Z"), &NotificationSettings::default())
      .unwrap();
    engine.ignore(out.group_id, None).unwrap();
    let err = engine.resolve(out.group_id, None).unwrap_err();
    assert!(matches!(err, EngineError::InvalidStateTransition { .. }));
  }
}
