//! Alert delivery: debounce, send through a [`Notifier`], record the attempt.
//!
//! Delivery never feeds back into grouping. A failed send is logged and kept in
//! the delivery log; the only write back into the engine is `mark_notified` after a
//! successful send.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

use grouping_engine::types::{AlertRule, TelegramSettings};
use grouping_engine::{AlertIntent, Engine, Environment};

use crate::config::ServiceConfig;
use crate::telegram::{self, AlertMessage};

#[derive(Debug, Error)]
pub enum DispatchError {
  #[error("telegram notifications not configured or enabled")]
  NotConfigured,
  #[error("bot was blocked by user or removed from group")]
  BotBlocked,
  #[error("invalid chat ID or bot not in group")]
  ChatNotFound,
  #[error("invalid bot token")]
  InvalidToken,
  #[error("telegram API error: {0}")]
  Api(String),
  #[error("telegram API error: status {0}")]
  Status(u16),
  #[error("failed to send request: {0}")]
  Transport(String),
}

/// Where a message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTarget {
  pub bot_token: String,
  pub chat_id: String,
}

impl ChatTarget {
  /// Target for enabled settings carrying both credentials.
  pub fn from_settings(settings: &TelegramSettings) -> Option<Self> {
    settings.is_deliverable().then(|| Self {
      bot_token: settings.bot_token.trim().to_owned(),
      chat_id: settings.chat_id.trim().to_owned(),
    })
  }
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
  async fn send_message(&self, target: &ChatTarget, text: &str) -> Result<(), DispatchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
  Sent,
  Failed,
  Debounced,
}

/// One delivery attempt, as shown in the delivery log.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryRecord {
  pub project_id: i64,
  pub environment_id: i64,
  /// `None` for test messages.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error_group_id: Option<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub rule: Option<AlertRule>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub occurrence_count: Option<u64>,
  pub status: DeliveryStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  pub at: DateTime<Utc>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
  m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Dispatcher {
  engine: Arc<Engine>,
  notifier: Arc<dyn Notifier>,
  base_url: String,
  debounce: Duration,
  history_limit: usize,
  history: Mutex<VecDeque<DeliveryRecord>>,
  /// Last send claimed per group; closes the gap before `mark_notified` lands.
  claims: Mutex<HashMap<i64, DateTime<Utc>>>,
}

impl Dispatcher {
  pub fn new(engine: Arc<Engine>, notifier: Arc<dyn Notifier>, config: &ServiceConfig) -> Self {
    Self {
      engine,
      notifier,
      base_url: config.base_url.clone(),
      debounce: config.notify_debounce,
      history_limit: config.history_limit.max(1),
      history: Mutex::new(VecDeque::new()),
      claims: Mutex::new(HashMap::new()),
    }
  }

  /// Deliver in the background; the caller never waits on Telegram.
  pub fn spawn(
    self: &Arc<Self>,
    env: Environment,
    intent: AlertIntent,
  ) -> tokio::task::JoinHandle<DeliveryStatus> {
    let dispatcher = Arc::clone(self);
    tokio::spawn(async move { dispatcher.deliver(&env, &intent).await })
  }

  pub async fn deliver(&self, env: &Environment, intent: &AlertIntent) -> DeliveryStatus {
    let now = Utc::now();
    let record = |status: DeliveryStatus, error: Option<String>| DeliveryRecord {
      project_id: env.project_id,
      environment_id: env.id,
      error_group_id: Some(intent.group_id),
      rule: Some(intent.rule),
      message: Some(intent.message_summary.clone()),
      occurrence_count: Some(intent.occurrence_count),
      status,
      error,
      at: now,
    };

    let group = match self.engine.store().get(intent.group_id) {
      Ok(group) => group,
      Err(e) => {
        tracing::warn!(group_id = intent.group_id, error = %e, "alert dropped: group unavailable");
        self.push_history(record(DeliveryStatus::Failed, Some(e.to_string())));
        return DeliveryStatus::Failed;
      }
    };

    let Some(target) = ChatTarget::from_settings(&env.notifications().telegram) else {
      self.push_history(record(
        DeliveryStatus::Failed,
        Some(DispatchError::NotConfigured.to_string()),
      ));
      return DeliveryStatus::Failed;
    };

    if !self.claim(group.id, group.last_notified_at, now) {
      tracing::debug!(group_id = group.id, "alert debounced");
      self.push_history(record(DeliveryStatus::Debounced, None));
      return DeliveryStatus::Debounced;
    }

    let text = telegram::format_alert(&AlertMessage {
      rule: intent.rule,
      group: &group,
      environment: &env.name,
      view_url: format!(
        "{}/projects/{}/error-groups/{}",
        self.base_url, group.project_id, group.id
      ),
    });

    match self.notifier.send_message(&target, &text).await {
      Ok(()) => {
        if let Err(e) = self.engine.mark_notified(group.id) {
          tracing::warn!(group_id = group.id, error = %e, "failed to record notification");
        }
        tracing::info!(group_id = group.id, rule = ?intent.rule, "alert sent");
        self.push_history(record(DeliveryStatus::Sent, None));
        DeliveryStatus::Sent
      }
      Err(e) => {
        self.release(group.id, now);
        tracing::warn!(group_id = group.id, error = %e, "alert delivery failed");
        self.push_history(record(DeliveryStatus::Failed, Some(e.to_string())));
        DeliveryStatus::Failed
      }
    }
  }

  /// Send the setup test message for an environment.
  pub async fn send_test(&self, env: &Environment) -> Result<(), DispatchError> {
    let result = match ChatTarget::from_settings(&env.notifications().telegram) {
      Some(target) => self.notifier.send_message(&target, &telegram::test_message()).await,
      None => Err(DispatchError::NotConfigured),
    };

    let (status, error) = match &result {
      Ok(()) => (DeliveryStatus::Sent, None),
      Err(e) => {
        tracing::warn!(environment_id = env.id, error = %e, "test notification failed");
        (DeliveryStatus::Failed, Some(e.to_string()))
      }
    };
    self.push_history(DeliveryRecord {
      project_id: env.project_id,
      environment_id: env.id,
      error_group_id: None,
      rule: None,
      message: None,
      occurrence_count: None,
      status,
      error,
      at: Utc::now(),
    });
    result
  }

  /// Delivery attempts for one environment, newest first.
  pub fn deliveries(&self, project_id: i64, environment_id: i64, limit: usize) -> Vec<DeliveryRecord> {
    lock(&self.history)
      .iter()
      .filter(|r| r.project_id == project_id && r.environment_id == environment_id)
      .take(limit)
      .cloned()
      .collect()
  }

  fn push_history(&self, record: DeliveryRecord) {
    let mut history = lock(&self.history);
    history.push_front(record);
    history.truncate(self.history_limit);
  }

  fn within_debounce(&self, last: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    // A future timestamp (clock skew) counts as recent.
    (now - last).to_std().map_or(true, |elapsed| elapsed < self.debounce)
  }

  /// Reserve the right to notify `group_id` now; false while debounced.
  fn claim(&self, group_id: i64, last_notified_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    let mut claims = lock(&self.claims);
    let last = last_notified_at.max(claims.get(&group_id).copied());
    if last.is_some_and(|last| self.within_debounce(last, now)) {
      return false;
    }
    claims.insert(group_id, now);
    true
  }

  fn release(&self, group_id: i64, claimed_at: DateTime<Utc>) {
    let mut claims = lock(&self.claims);
    if claims.get(&group_id) == Some(&claimed_at) {
      claims.remove(&group_id);
    }
  }
}
