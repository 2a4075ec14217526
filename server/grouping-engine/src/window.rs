//! Per-group sliding occurrence history: trailing counts and spike rates.

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// Occurrence timestamps of one group, kept sorted and trimmed to a retention span.
#[derive(Debug, Clone, Default)]
pub struct OccurrenceWindow {
  times: VecDeque<DateTime<Utc>>,
}

/// Current vs baseline occurrence rates (per minute) at a point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpikeReading {
  pub current: usize,
  pub baseline: usize,
  pub current_rate: f64,
  pub baseline_rate: f64,
}

impl SpikeReading {
  /// Ratio of current to baseline rate; `None` until a baseline exists.
  pub fn factor(&self) -> Option<f64> {
    (self.baseline_rate > 0.0).then(|| self.current_rate / self.baseline_rate)
  }
}

impl OccurrenceWindow {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.times.len()
  }

  pub fn is_empty(&self) -> bool {
    self.times.is_empty()
  }

  /// Record one occurrence and drop everything older than `retention` before the newest.
  ///
  /// Late events are inserted in order, so counts stay correct for out-of-order delivery.
  pub fn record(&mut self, ts: DateTime<Utc>, retention: Duration) {
    let idx = self.times.partition_point(|t| *t <= ts);
    self.times.insert(idx, ts);

    if let Some(newest) = self.times.back().copied() {
      let cutoff = newest - retention;
      while self.times.front().is_some_and(|t| *t < cutoff) {
        self.times.pop_front();
      }
    }
  }

  /// Occurrences with `start <= t < end`.
  pub fn count_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> usize {
    if end <= start {
      return 0;
    }
    let lo = self.times.partition_point(|t| *t < start);
    let hi = self.times.partition_point(|t| *t < end);
    hi.saturating_sub(lo)
  }

  /// Occurrences with `now - minutes <= t <= now`.
  pub fn count_trailing(&self, now: DateTime<Utc>, minutes: i64) -> usize {
    let lo = self.times.partition_point(|t| *t < now - Duration::minutes(minutes));
    let hi = self.times.partition_point(|t| *t <= now);
    hi.saturating_sub(lo)
  }

  /// Compare the trailing `current_minutes` against the `baseline_minutes` just before it.
  pub fn spike_reading(
    &self,
    now: DateTime<Utc>,
    current_minutes: i64,
    baseline_minutes: i64,
  ) -> SpikeReading {
    let current = self.count_trailing(now, current_minutes);
    let current_start = now - Duration::minutes(current_minutes);
    let baseline = self.count_range(current_start - Duration::minutes(baseline_minutes), current_start);

    let per_minute = |count: usize, minutes: i64| {
      if minutes > 0 {
        count as f64 / minutes as f64
      } else {
        0.0
      }
    };

    SpikeReading {
      current,
      baseline,
      current_rate: per_minute(current, current_minutes),
      baseline_rate: per_minute(baseline, baseline_minutes),
    }
  }
}
