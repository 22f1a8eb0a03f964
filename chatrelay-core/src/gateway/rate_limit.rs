//! Fixed-window request limiter keyed by client IP.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::Json;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::config::RateLimitCfg;
use crate::model::ErrorBody;

const LIMITED_MESSAGE: &str = "Too many requests, please try again later.";

/// Stale windows are swept once the table grows past this many callers.
const SWEEP_THRESHOLD: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed { remaining: u32, reset_secs: u64 },
    Limited { retry_after_secs: u64 },
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    windows: Mutex<HashMap<IpAddr, Window>>,
}

impl RateLimiter {
    pub fn new(cfg: &RateLimitCfg) -> Self {
        Self {
            window: Duration::from_secs(cfg.window_secs.max(1)),
            max_requests: cfg.max_requests,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.max_requests > 0
    }

    pub fn limit(&self) -> u32 {
        self.max_requests
    }

    pub fn check(&self, ip: IpAddr) -> Decision {
        self.check_at(ip, Instant::now())
    }

    fn check_at(&self, ip: IpAddr, now: Instant) -> Decision {
        let mut windows = self.windows.lock().unwrap_or_else(|p| p.into_inner());
        if windows.len() > SWEEP_THRESHOLD {
            let span = self.window;
            windows.retain(|_, w| now.duration_since(w.started) < span);
        }

        let w = windows.entry(ip).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(w.started) >= self.window {
            *w = Window {
                started: now,
                count: 0,
            };
        }
        let reset = self.window.saturating_sub(now.duration_since(w.started));
        let reset_secs = reset.as_secs() + u64::from(reset.subsec_nanos() > 0);

        if w.count >= self.max_requests {
            return Decision::Limited {
                retry_after_secs: reset_secs.max(1),
            };
        }
        w.count += 1;
        Decision::Allowed {
            remaining: self.max_requests - w.count,
            reset_secs,
        }
    }
}

/// Middleware for the `/api` routes. Requests without connection info
/// (in-process callers) share one bucket.
pub async fn enforce(State(limiter): State<Arc<RateLimiter>>, req: Request, next: Next) -> Response {
    if !limiter.enabled() {
        return next.run(req).await;
    }
    let ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    match limiter.check(ip) {
        Decision::Allowed {
            remaining,
            reset_secs,
        } => {
            let mut resp = next.run(req).await;
            put_standard_headers(resp.headers_mut(), limiter.limit(), remaining, reset_secs);
            resp
        }
        Decision::Limited { retry_after_secs } => {
            tracing::warn!(%ip, retry_after_secs, "rate limit exceeded");
            let mut resp = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(ErrorBody::new(LIMITED_MESSAGE)),
            )
                .into_response();
            let headers = resp.headers_mut();
            put_standard_headers(headers, limiter.limit(), 0, retry_after_secs);
            headers.insert("retry-after", HeaderValue::from(retry_after_secs));
            resp
        }
    }
}

fn put_standard_headers(headers: &mut HeaderMap, limit: u32, remaining: u32, reset_secs: u64) {
    headers.insert("ratelimit-limit", HeaderValue::from(limit));
    headers.insert("ratelimit-remaining", HeaderValue::from(remaining));
    headers.insert("ratelimit-reset", HeaderValue::from(reset_secs));
}
