//! Stable fingerprint computation for grouping events into error groups.

use crate::normalize::{normalize_message, normalize_stack};
use crate::types::{Event, Fingerprint, Source};

/// Compute a stable fingerprint from an event.
///
/// Key components: normalized message + top N normalized stack lines + source.
/// Project and environment are not hashed; they are part of the group key.
pub fn compute(event: &Event, max_frames: usize) -> Fingerprint {
  compute_parts(&event.message, event.stack.as_deref(), event.source, max_frames)
}

/// Same as [`compute`] for callers holding raw parts rather than an Event.
pub fn compute_parts(
  message: &str,
  stack: Option<&str>,
  source: Source,
  max_frames: usize,
) -> Fingerprint {
  let mut hasher = blake3::Hasher::new();
  hasher.update(normalize_message(message).as_bytes());

  for frame in normalize_stack(stack.unwrap_or_default(), max_frames) {
    hasher.update(b"|");
    hasher.update(frame.as_bytes());
  }

  hasher.update(b"|");
  hasher.update(source.as_str().as_bytes());

  let hash = hasher.finalize();
  // First 16 bytes (32 hex chars) keep the id compact.
  let hex = hash.to_hex();
  Fingerprint(hex[..32].to_string())
}
