//! Occurrence recorder: validate, fingerprint, upsert the group and persist the raw event.

use chrono::{DateTime, Duration, Utc};

use crate::config::Config;
use crate::error::EngineError;
use crate::fingerprint;
use crate::normalize;
use crate::store::{GroupSlot, GroupStore};
use crate::types::*;

/// Result of recording one event.
#[derive(Debug, Clone)]
pub struct Recorded {
  pub occurrence_id: i64,
  pub fingerprint: Fingerprint,
  /// Group after the update (unchanged for a duplicate delivery).
  pub group: ErrorGroup,
  pub created: bool,
  pub regression: bool,
  /// The external event id was already recorded; nothing was written.
  pub duplicate: bool,
  pub level: Level,
  pub timestamp: DateTime<Utc>,
}

/// Records occurrences into a [`GroupStore`].
pub struct Recorder<'a> {
  store: &'a GroupStore,
  config: &'a Config,
  retention: Duration,
}

impl<'a> Recorder<'a> {
  pub fn new(store: &'a GroupStore, config: &'a Config) -> Self {
    Self {
      store,
      config,
      retention: Duration::minutes(config.spike_retention_minutes()),
    }
  }

  /// Keep at least `minutes` of occurrence history per group.
  pub fn with_retention(mut self, minutes: i64) -> Self {
    self.retention = self.retention.max(Duration::minutes(minutes));
    self
  }

  /// Record one event and return the stored occurrence id plus the group outcome.
  pub fn record(&self, raw: &InboundEvent) -> Result<Recorded, EngineError> {
    self.record_then(raw, |_, _| ()).map(|(recorded, _)| recorded)
  }

  /// Record one event, then run `then` while the group is still locked.
  ///
  /// `then` is skipped for duplicate deliveries. Validation happens before the
  /// store is touched, so a rejected event leaves no trace.
  pub fn record_then<T>(
    &self,
    raw: &InboundEvent,
    then: impl FnOnce(&mut GroupSlot, &Recorded) -> T,
  ) -> Result<(Recorded, Option<T>), EngineError> {
    let event = normalize::normalize(raw)?;
    let fp = fingerprint::compute(&event, self.config.fingerprint_max_frames);
    let key = GroupKey::for_event(&event, fp.clone());

    self.store.with_key(&key, |slot| {
      if let Some(existing) = event.event_id.as_deref().and_then(|id| slot.seen_event(id)) {
        let group = slot
          .group()
          .cloned()
          .ok_or_else(|| EngineError::storage("event seen without a group"))?;
        tracing::debug!(occurrence_id = existing, group_id = group.id, "duplicate delivery ignored");
        let recorded = Recorded {
          occurrence_id: existing,
          fingerprint: fp.clone(),
          group,
          created: false,
          regression: false,
          duplicate: true,
          level: event.level,
          timestamp: event.timestamp,
        };
        return Ok((recorded, None));
      }

      let log = ErrorLog {
        id: self.store.allocate_occurrence_id(),
        project_id: event.project_id,
        environment_id: event.environment_id,
        error_group_id: slot.id(),
        event_id: event.event_id.clone(),
        timestamp: event.timestamp,
        source: event.source,
        level: event.level,
        message: event.message.clone(),
        stack: event.stack.clone(),
        context: event.context.clone(),
        resolved: false,
        created_at: Utc::now(),
      };
      let occurrence_id = log.id;
      let upsert = self
        .store
        .apply_occurrence(slot, &key, &event, Some(log), self.retention)?;

      if upsert.created {
        tracing::info!(
          group_id = upsert.group.id,
          fingerprint = %fp,
          project_id = event.project_id,
          environment_id = event.environment_id,
          "error group created"
        );
      }

      let recorded = Recorded {
        occurrence_id,
        fingerprint: fp.clone(),
        group: upsert.group,
        created: upsert.created,
        regression: upsert.regression,
        duplicate: false,
        level: event.level,
        timestamp: event.timestamp,
      };
      let extra = then(slot, &recorded);
      Ok((recorded, Some(extra)))
    })
  }
}
