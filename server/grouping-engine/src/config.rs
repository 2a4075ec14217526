//! Engine configuration with sane defaults.

/// Tunable limits for grouping and trigger evaluation.
#[derive(Debug, Clone)]
pub struct Config {
  /// Max stack lines (frames) to include in the fingerprint.
  pub fingerprint_max_frames: usize,
  /// Current rate must reach this multiple of the baseline rate to count as a spike.
  pub spike_factor: f64,
  /// Width of the "current rate" window for spike detection.
  pub spike_current_minutes: i64,
  /// Width of the baseline window that precedes the current window.
  pub spike_baseline_minutes: i64,
  /// Max characters of the group message carried in an alert summary.
  pub summary_max_chars: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      fingerprint_max_frames: 10,
      spike_factor: 100.0,
      spike_current_minutes: 5,
      spike_baseline_minutes: 60,
      summary_max_chars: 200,
    }
  }
}

impl Config {
  /// Minutes of occurrence history the spike rule needs per group.
  pub fn spike_retention_minutes(&self) -> i64 {
    self.spike_current_minutes + self.spike_baseline_minutes
  }
}
