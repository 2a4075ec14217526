//! Per-client rate limiting for the ingestion routes.

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::error::ApiError;
use crate::state::AppState;

/// Token bucket per client IP: `n` requests per minute with a burst of `n`.
pub struct IngestLimiter {
  inner: DefaultKeyedRateLimiter<IpAddr>,
}

impl IngestLimiter {
  /// `None` when `n` is 0, which disables limiting.
  pub fn per_minute(n: u32) -> Option<Self> {
    NonZeroU32::new(n).map(|n| Self {
      inner: RateLimiter::keyed(Quota::per_minute(n)),
    })
  }

  pub fn check(&self, client: IpAddr) -> bool {
    self.inner.check_key(&client).is_ok()
  }

  /// Drop buckets of clients that are back to full capacity.
  pub fn retain_recent(&self) {
    self.inner.retain_recent();
  }
}

/// Peer address of the connection. Without connection info (in-process callers),
/// falls back to the first `X-Forwarded-For` hop.
fn client_ip(req: &Request) -> IpAddr {
  if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
    return addr.ip();
  }
  req
    .headers()
    .get("x-forwarded-for")
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.split(',').next())
    .and_then(|v| v.trim().parse().ok())
    .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

pub async fn limit_ingest(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
  if let Some(limiter) = &state.ingest_limiter {
    let client = client_ip(&req);
    if !limiter.check(client) {
      tracing::warn!(%client, "ingest rate limit exceeded");
      return ApiError::RateLimited.into_response();
    }
  }
  next.run(req).await
}
