//! In-memory error group store.
//!
//! Each group key owns one slot behind its own mutex: writers to the same key
//! are serialized, different keys proceed in parallel. Index maps sit behind
//! RwLocks and are never held while a slot is locked, except that a committing
//! writer takes the occurrence index after its slot (slot -> index, never the
//! reverse).

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::EngineError;
use crate::evaluator::TriggerState;
use crate::types::*;
use crate::window::OccurrenceWindow;

type SlotRef = Arc<Mutex<GroupSlot>>;

/// Post-update view of a group after one occurrence.
#[derive(Debug, Clone)]
pub struct Upsert {
  pub group: ErrorGroup,
  /// The occurrence created the group.
  pub created: bool,
  /// The occurrence landed on a resolved group (status left unchanged).
  pub regression: bool,
}

/// Everything the store keeps for one group key.
#[derive(Debug)]
pub struct GroupSlot {
  id: i64,
  group: Option<ErrorGroup>,
  occurrences: Vec<ErrorLog>,
  pub(crate) window: OccurrenceWindow,
  pub(crate) triggers: TriggerState,
  seen_events: HashMap<String, i64>,
}

impl GroupSlot {
  fn new(id: i64) -> Self {
    Self {
      id,
      group: None,
      occurrences: Vec::new(),
      window: OccurrenceWindow::new(),
      triggers: TriggerState::default(),
      seen_events: HashMap::new(),
    }
  }

  pub fn id(&self) -> i64 {
    self.id
  }

  pub fn group(&self) -> Option<&ErrorGroup> {
    self.group.as_ref()
  }

  /// Occurrence id already stored for this external event id, if any.
  pub fn seen_event(&self, event_id: &str) -> Option<i64> {
    self.seen_events.get(event_id).copied()
  }

  /// Compute the group as it would look after `event`, without mutating.
  fn plan_occurrence(&self, key: &GroupKey, event: &Event, now: DateTime<Utc>) -> Upsert {
    match &self.group {
      None => Upsert {
        group: ErrorGroup {
          id: self.id,
          project_id: key.project_id,
          environment_id: key.environment_id,
          fingerprint: key.fingerprint.clone(),
          message: event.message.clone(),
          stack: event.stack.clone(),
          url: event.context.url.clone(),
          source: event.source,
          level: event.level,
          first_seen: event.timestamp,
          last_seen: event.timestamp,
          occurrence_count: 1,
          status: GroupStatus::Unresolved,
          resolved_at: None,
          resolved_by: None,
          notification_count: 0,
          last_notified_at: None,
          created_at: now,
        },
        created: true,
        regression: false,
      },
      Some(existing) => {
        let mut group = existing.clone();
        group.occurrence_count += 1;
        group.last_seen = group.last_seen.max(event.timestamp);
        group.first_seen = group.first_seen.min(event.timestamp);
        Upsert {
          regression: group.status == GroupStatus::Resolved,
          group,
          created: false,
        }
      }
    }
  }

  /// Apply a planned group update together with its occurrence.
  fn commit(
    &mut self,
    group: ErrorGroup,
    log: Option<ErrorLog>,
    at: DateTime<Utc>,
    retention: Duration,
  ) {
    self.window.record(at, retention);
    if let Some(log) = log {
      if let Some(event_id) = &log.event_id {
        self.seen_events.insert(event_id.clone(), log.id);
      }
      self.occurrences.push(log);
    }
    self.group = Some(group);
  }
}

/// Find-or-create store of error groups and their occurrences.
#[derive(Debug)]
pub struct GroupStore {
  by_key: RwLock<HashMap<GroupKey, SlotRef>>,
  by_id: RwLock<HashMap<i64, SlotRef>>,
  occurrence_index: RwLock<HashMap<i64, i64>>,
  next_group_id: AtomicI64,
  next_occurrence_id: AtomicI64,
}

impl Default for GroupStore {
  fn default() -> Self {
    Self::new()
  }
}

impl GroupStore {
  pub fn new() -> Self {
    Self {
      by_key: RwLock::new(HashMap::new()),
      by_id: RwLock::new(HashMap::new()),
      occurrence_index: RwLock::new(HashMap::new()),
      next_group_id: AtomicI64::new(1),
      next_occurrence_id: AtomicI64::new(1),
    }
  }

  /// Find or create the slot for `key`.
  fn slot_for_key(&self, key: &GroupKey) -> Result<SlotRef, EngineError> {
    if let Some(slot) = self.by_key.read()?.get(key) {
      return Ok(Arc::clone(slot));
    }

    let mut by_key = self.by_key.write()?;
    if let Some(slot) = by_key.get(key) {
      return Ok(Arc::clone(slot));
    }
    let id = self.next_group_id.fetch_add(1, Ordering::Relaxed);
    let slot = Arc::new(Mutex::new(GroupSlot::new(id)));
    self.by_id.write()?.insert(id, Arc::clone(&slot));
    by_key.insert(key.clone(), Arc::clone(&slot));
    Ok(slot)
  }

  fn slot_for_id(&self, group_id: i64) -> Result<SlotRef, EngineError> {
    self
      .by_id
      .read()?
      .get(&group_id)
      .cloned()
      .ok_or_else(|| EngineError::not_found("error group", group_id))
  }

  /// Run `f` with exclusive access to the slot of `key`, creating it if needed.
  pub fn with_key<T>(
    &self,
    key: &GroupKey,
    f: impl FnOnce(&mut GroupSlot) -> Result<T, EngineError>,
  ) -> Result<T, EngineError> {
    let slot = self.slot_for_key(key)?;
    let mut guard = slot.lock()?;
    f(&mut guard)
  }

  /// Run `f` with exclusive access to an existing group.
  pub fn with_group<T>(
    &self,
    group_id: i64,
    f: impl FnOnce(&mut GroupSlot) -> Result<T, EngineError>,
  ) -> Result<T, EngineError> {
    let slot = self.slot_for_id(group_id)?;
    let mut guard = slot.lock()?;
    if guard.group.is_none() {
      return Err(EngineError::not_found("error group", group_id));
    }
    f(&mut guard)
  }

  pub(crate) fn allocate_occurrence_id(&self) -> i64 {
    self.next_occurrence_id.fetch_add(1, Ordering::Relaxed)
  }

  /// Find-or-create the group for `key` and apply one occurrence's aggregate update.
  ///
  /// A resolved group stays resolved; the caller sees `regression = true`.
  pub fn upsert_on_occurrence(
    &self,
    key: &GroupKey,
    event: &Event,
    retention: Duration,
  ) -> Result<Upsert, EngineError> {
    self.with_key(key, |slot| self.apply_occurrence(slot, key, event, None, retention))
  }

  /// Apply one occurrence to an already locked slot: the group aggregate, the
  /// occurrence window and, when given, the stored log.
  ///
  /// The occurrence index is locked before anything is written, so a failure
  /// leaves both the group and the occurrence untouched.
  pub(crate) fn apply_occurrence(
    &self,
    slot: &mut GroupSlot,
    key: &GroupKey,
    event: &Event,
    log: Option<ErrorLog>,
    retention: Duration,
  ) -> Result<Upsert, EngineError> {
    let mut index = match &log {
      Some(_) => Some(self.occurrence_index.write()?),
      None => None,
    };
    let upsert = slot.plan_occurrence(key, event, Utc::now());
    if let (Some(index), Some(log)) = (index.as_mut(), log.as_ref()) {
      index.insert(log.id, slot.id);
    }
    slot.commit(upsert.group.clone(), log, event.timestamp, retention);
    Ok(upsert)
  }

  /// Move a group along a legal status edge.
  ///
  /// Resolving stamps `resolved_at`/`resolved_by`; ignore and reopen clear them.
  /// Counters and timestamps are never touched.
  pub fn set_status(
    &self,
    group_id: i64,
    to: GroupStatus,
    acting_user_id: Option<i64>,
    at: DateTime<Utc>,
  ) -> Result<ErrorGroup, EngineError> {
    self.with_group(group_id, |slot| {
      let group = slot
        .group
        .as_mut()
        .ok_or_else(|| EngineError::not_found("error group", group_id))?;
      if !group.status.can_transition_to(to) {
        return Err(EngineError::InvalidStateTransition {
          from: group.status,
          to,
        });
      }
      group.status = to;
      if to == GroupStatus::Resolved {
        group.resolved_at = Some(at);
        group.resolved_by = acting_user_id;
      } else {
        group.resolved_at = None;
        group.resolved_by = None;
      }
      tracing::info!(group_id, status = %to, actor = ?acting_user_id, "error group status changed");
      Ok(group.clone())
    })
  }

  pub fn get(&self, group_id: i64) -> Result<ErrorGroup, EngineError> {
    self.with_group(group_id, |slot| {
      slot
        .group
        .clone()
        .ok_or_else(|| EngineError::not_found("error group", group_id))
    })
  }

  /// Groups of one project, newest `last_seen` first, paged.
  pub fn list(&self, filter: &GroupFilter) -> Result<Vec<ErrorGroup>, EngineError> {
    let slots: Vec<SlotRef> = self.by_id.read()?.values().cloned().collect();

    let mut groups = Vec::new();
    for slot in slots {
      let guard = slot.lock()?;
      let Some(group) = guard.group.as_ref() else {
        continue;
      };
      if group.project_id != filter.project_id {
        continue;
      }
      if filter.environment_id.is_some_and(|env| env != group.environment_id) {
        continue;
      }
      if filter.status.is_some_and(|status| status != group.status) {
        continue;
      }
      groups.push(group.clone());
    }

    groups.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| b.id.cmp(&a.id)));
    Ok(groups.into_iter().skip(filter.offset).take(filter.limit).collect())
  }

  /// Groups of one environment that were notified at least once, most recently notified first.
  pub fn notified(
    &self,
    project_id: i64,
    environment_id: i64,
    limit: usize,
  ) -> Result<Vec<ErrorGroup>, EngineError> {
    let mut filter = GroupFilter::project(project_id);
    filter.environment_id = Some(environment_id);
    filter.limit = usize::MAX;
    let mut groups: Vec<ErrorGroup> = self
      .list(&filter)?
      .into_iter()
      .filter(|g| g.notification_count > 0)
      .collect();
    groups.sort_by(|a, b| {
      b.last_notified_at
        .cmp(&a.last_notified_at)
        .then_with(|| b.id.cmp(&a.id))
    });
    groups.truncate(limit);
    Ok(groups)
  }

  /// Occurrences of one group, newest first, paged.
  pub fn occurrences(
    &self,
    group_id: i64,
    limit: usize,
    offset: usize,
  ) -> Result<Vec<ErrorLog>, EngineError> {
    self.with_group(group_id, |slot| {
      let mut logs: Vec<ErrorLog> = slot.occurrences.clone();
      logs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
      Ok(logs.into_iter().skip(offset).take(limit).collect())
    })
  }

  /// Occurrences across a project, newest first, paged.
  pub fn list_occurrences(&self, filter: &OccurrenceFilter) -> Result<Vec<ErrorLog>, EngineError> {
    let slots: Vec<SlotRef> = match filter.error_group_id {
      Some(id) => self.by_id.read()?.get(&id).cloned().into_iter().collect(),
      None => self.by_id.read()?.values().cloned().collect(),
    };

    let mut logs = Vec::new();
    for slot in slots {
      let guard = slot.lock()?;
      let in_scope = guard.group.as_ref().is_some_and(|g| {
        g.project_id == filter.project_id
          && filter.environment_id.map_or(true, |env| env == g.environment_id)
      });
      if in_scope {
        logs.extend(guard.occurrences.iter().filter(|l| filter.matches(l)).cloned());
      }
    }

    logs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
    Ok(logs.into_iter().skip(filter.offset).take(filter.limit).collect())
  }

  fn group_of_occurrence(&self, occurrence_id: i64) -> Result<i64, EngineError> {
    self
      .occurrence_index
      .read()?
      .get(&occurrence_id)
      .copied()
      .ok_or_else(|| EngineError::not_found("occurrence", occurrence_id))
  }

  pub fn occurrence(&self, occurrence_id: i64) -> Result<ErrorLog, EngineError> {
    let group_id = self.group_of_occurrence(occurrence_id)?;
    self.with_group(group_id, |slot| {
      slot
        .occurrences
        .iter()
        .find(|l| l.id == occurrence_id)
        .cloned()
        .ok_or_else(|| EngineError::not_found("occurrence", occurrence_id))
    })
  }

  /// Flip the per-occurrence `resolved` flag; independent of the group status.
  pub fn set_occurrence_resolved(
    &self,
    occurrence_id: i64,
    resolved: bool,
  ) -> Result<ErrorLog, EngineError> {
    let group_id = self.group_of_occurrence(occurrence_id)?;
    self.with_group(group_id, |slot| {
      let log = slot
        .occurrences
        .iter_mut()
        .find(|l| l.id == occurrence_id)
        .ok_or_else(|| EngineError::not_found("occurrence", occurrence_id))?;
      log.resolved = resolved;
      Ok(log.clone())
    })
  }

  /// Record that an alert for this group was delivered.
  pub fn mark_notified(&self, group_id: i64, at: DateTime<Utc>) -> Result<ErrorGroup, EngineError> {
    self.with_group(group_id, |slot| {
      let group = slot
        .group
        .as_mut()
        .ok_or_else(|| EngineError::not_found("error group", group_id))?;
      group.notification_count += 1;
      group.last_notified_at = Some(at);
      Ok(group.clone())
    })
  }

  pub fn group_count(&self) -> Result<usize, EngineError> {
    Ok(self.by_id.read()?.len())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::{Fingerprint, Level, RequestContext, Source};
  use chrono::TimeZone;

  fn ts(min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, 10, min, 0).unwrap()
  }

  fn key(fp: &str) -> GroupKey {
    GroupKey {
      project_id: 1,
      environment_id: 2,
      fingerprint: Fingerprint(fp.into()),
    }
  }

  fn event(at: DateTime<Utc>) -> Event {
    Event {
      project_id: 1,
      environment_id: 2,
      event_id: None,
      timestamp: at,
      source: Source::Backend,
      level: Level::Error,
      message: "boom".into(),
      stack: Some("at f (a.rs:1)".into()),
      context: RequestContext::default(),
    }
  }

  fn retention() -> Duration {
    Duration::minutes(65)
  }

  #[test]
  fn first_occurrence_creates_group() {
    let store = GroupStore::new();
    let up = store.upsert_on_occurrence(&key("a"), &event(ts(0)), retention()).unwrap();
    assert!(up.created);
    assert!(!up.regression);
    assert_eq!(up.group.occurrence_count, 1);
    assert_eq!(up.group.first_seen, ts(0));
    assert_eq!(up.group.last_seen, ts(0));
    assert_eq!(up.group.status, GroupStatus::Unresolved);
  }

  #[test]
  fn counts_and_last_seen_track_max() {
    let store = GroupStore::new();
    let k = key("a");
    for m in [3, 1, 7, 2] {
      store.upsert_on_occurrence(&k, &event(ts(m)), retention()).unwrap();
    }
    let up = store.upsert_on_occurrence(&k, &event(ts(5)), retention()).unwrap();
    assert!(!up.created);
    assert_eq!(up.group.occurrence_count, 5);
    assert_eq!(up.group.last_seen, ts(7));
    assert_eq!(up.group.first_seen, ts(1));
  }

  #[test]
  fn keys_are_scoped_by_environment() {
    let store = GroupStore::new();
    let a = store.upsert_on_occurrence(&key("a"), &event(ts(0)), retention()).unwrap();
    let mut other_env = key("a");
    other_env.environment_id = 3;
    let b = store.upsert_on_occurrence(&other_env, &event(ts(0)), retention()).unwrap();
    assert!(b.created);
    assert_ne!(a.group.id, b.group.id);
    assert_eq!(store.group_count().unwrap(), 2);
  }

  #[test]
  fn resolved_group_is_not_reopened() {
    let store = GroupStore::new();
    let k = key("a");
    let id = store.upsert_on_occurrence(&k, &event(ts(0)), retention()).unwrap().group.id;
    store.set_status(id, GroupStatus::Resolved, Some(9), ts(1)).unwrap();

    let up = store.upsert_on_occurrence(&k, &event(ts(2)), retention()).unwrap();
    assert!(up.regression);
    assert_eq!(up.group.status, GroupStatus::Resolved);
    assert_eq!(up.group.occurrence_count, 2);
  }

  #[test]
  fn status_transitions() {
    let store = GroupStore::new();
    let id = store.upsert_on_occurrence(&key("a"), &event(ts(0)), retention()).unwrap().group.id;
    let before = store.get(id).unwrap();

    let resolved = store.set_status(id, GroupStatus::Resolved, Some(9), ts(1)).unwrap();
    assert_eq!(resolved.resolved_at, Some(ts(1)));
    assert_eq!(resolved.resolved_by, Some(9));

    let err = store.set_status(id, GroupStatus::Resolved, Some(9), ts(2)).unwrap_err();
    assert!(matches!(err, EngineError::InvalidStateTransition { .. }));
    let err = store.set_status(id, GroupStatus::Ignored, None, ts(2)).unwrap_err();
    assert!(matches!(err, EngineError::InvalidStateTransition { .. }));
    // Rejected transitions leave no trace.
    assert_eq!(store.get(id).unwrap(), resolved);

    let reopened = store.set_status(id, GroupStatus::Unresolved, None, ts(3)).unwrap();
    assert_eq!(reopened, before);

    let ignored = store.set_status(id, GroupStatus::Ignored, None, ts(4)).unwrap();
    assert_eq!(ignored.status, GroupStatus::Ignored);
    assert!(ignored.resolved_at.is_none());
    assert!(store.set_status(id, GroupStatus::Resolved, None, ts(5)).is_err());
    assert!(store.set_status(id, GroupStatus::Unresolved, None, ts(5)).is_ok());
  }

  #[test]
  fn unknown_group_is_not_found() {
    let store = GroupStore::new();
    let err = store.set_status(42, GroupStatus::Resolved, None, ts(0)).unwrap_err();
    assert!(matches!(err, EngineError::NotFound { id: 42, .. }));
  }

  #[test]
  fn list_filters_and_orders() {
    let store = GroupStore::new();
    let a = store.upsert_on_occurrence(&key("a"), &event(ts(1)), retention()).unwrap().group.id;
    let b = store.upsert_on_occurrence(&key("b"), &event(ts(5)), retention()).unwrap().group.id;
    let c = store.upsert_on_occurrence(&key("c"), &event(ts(3)), retention()).unwrap().group.id;
    store.set_status(c, GroupStatus::Ignored, None, ts(4)).unwrap();

    let all = store.list(&GroupFilter::project(1)).unwrap();
    assert_eq!(all.iter().map(|g| g.id).collect::<Vec<_>>(), vec![b, c, a]);

    let mut filter = GroupFilter::project(1);
    filter.status = Some(GroupStatus::Ignored);
    assert_eq!(store.list(&filter).unwrap().len(), 1);

    let mut filter = GroupFilter::project(1);
    filter.offset = 1;
    filter.limit = 1;
    assert_eq!(store.list(&filter).unwrap()[0].id, c);

    assert!(store.list(&GroupFilter::project(99)).unwrap().is_empty());
  }

  #[test]
  fn project_occurrences_are_filtered_newest_first() {
    let store = GroupStore::new();
    let config = crate::config::Config::default();
    let recorder = crate::recorder::Recorder::new(&store, &config);
    let raw = |message: &str, level: &str, env: i64| InboundEvent {
      project_id: Some(1),
      environment_id: Some(env),
      timestamp: "2025-01-15T10:00:00Z".into(),
      source: "backend".into(),
      level: level.into(),
      message: message.into(),
      ..Default::default()
    };

    let a = recorder.record(&raw("boom", "error", 2)).unwrap();
    let b = recorder.record(&raw("slow query", "warn", 2)).unwrap();
    let c = recorder.record(&raw("boom", "error", 3)).unwrap();
    let d = recorder.record(&raw("boom", "error", 2)).unwrap();

    let ids = |filter: &OccurrenceFilter| -> Vec<i64> {
      store.list_occurrences(filter).unwrap().iter().map(|l| l.id).collect()
    };

    let all = OccurrenceFilter::project(1);
    assert_eq!(ids(&all), vec![d.occurrence_id, c.occurrence_id, b.occurrence_id, a.occurrence_id]);

    let mut errors_in_env = OccurrenceFilter::project(1);
    errors_in_env.environment_id = Some(2);
    errors_in_env.level = Some(Level::Error);
    assert_eq!(ids(&errors_in_env), vec![d.occurrence_id, a.occurrence_id]);

    let mut by_group = OccurrenceFilter::project(1);
    by_group.error_group_id = Some(b.group.id);
    assert_eq!(ids(&by_group), vec![b.occurrence_id]);

    let mut frontend = OccurrenceFilter::project(1);
    frontend.source = Some(Source::Frontend);
    assert!(ids(&frontend).is_empty());

    let mut paged = OccurrenceFilter::project(1);
    paged.offset = 1;
    paged.limit = 2;
    assert_eq!(ids(&paged), vec![c.occurrence_id, b.occurrence_id]);

    assert!(ids(&OccurrenceFilter::project(9)).is_empty());
  }

  #[test]
  fn mark_notified_counts() {
    let store = GroupStore::new();
    let id = store.upsert_on_occurrence(&key("a"), &event(ts(0)), retention()).unwrap().group.id;
    store.mark_notified(id, ts(1)).unwrap();
    let g = store.mark_notified(id, ts(2)).unwrap();
    assert_eq!(g.notification_count, 2);
    assert_eq!(g.last_notified_at, Some(ts(2)));
  }

  #[test]
  fn notified_groups_by_recency() {
    let store = GroupStore::new();
    let a = store.upsert_on_occurrence(&key("a"), &event(ts(0)), retention()).unwrap().group.id;
    let b = store.upsert_on_occurrence(&key("b"), &event(ts(0)), retention()).unwrap().group.id;
    store.upsert_on_occurrence(&key("c"), &event(ts(0)), retention()).unwrap();
    store.mark_notified(a, ts(5)).unwrap();
    store.mark_notified(b, ts(3)).unwrap();

    let ids: Vec<i64> = store.notified(1, 2, 50).unwrap().iter().map(|g| g.id).collect();
    assert_eq!(ids, vec![a, b]);
    assert_eq!(store.notified(1, 2, 1).unwrap().len(), 1);
    assert!(store.notified(1, 3, 50).unwrap().is_empty());
  }

  #[test]
  fn concurrent_upserts_are_not_lost() {
    let store = Arc::new(GroupStore::new());
    let handles: Vec<_> = (0..8)
      .map(|t| {
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
          for i in 0..50u32 {
            let k = key(if t % 2 == 0 { "even" } else { "odd" });
            store.upsert_on_occurrence(&k, &event(ts(i % 60)), retention()).unwrap();
          }
        })
      })
      .collect();
    for h in handles {
      h.join().unwrap();
    }
    let groups = store.list(&GroupFilter::project(1)).unwrap();
    assert_eq!(groups.len(), 2);
    assert!(groups.iter().all(|g| g.occurrence_count == 200));
    assert!(groups.iter().all(|g| g.last_seen == ts(49)));
  }
}
