use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::AppState;
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

// ============================================================
// Rate Limiter: two fixed windows per identity
// ============================================================
//
// Every request passes the general window; completions additionally
// pass the (much tighter) completion window. Identity is the user id
// when authenticated, otherwise the client IP. Loopback traffic is
// exempt so local development is never throttled.
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    General,
    Completion,
}

#[derive(Debug, Clone, Copy)]
pub struct LimitRule {
    pub max_requests: u32,
    pub window: Duration,
}

struct Window {
    started: Instant,
    count: u32,
}

pub struct RateLimiter {
    general: LimitRule,
    completion: LimitRule,
    windows: Mutex<HashMap<(Scope, String), Window>>,
}

impl RateLimiter {
    pub fn new(general: LimitRule, completion: LimitRule) -> Self {
        Self {
            general,
            completion,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or reject one request. On rejection returns the seconds
    /// until the window resets, for the `retry-after` hint.
    pub fn check(&self, scope: Scope, identity: &str) -> Result<(), u64> {
        if is_local_identity(identity) {
            return Ok(());
        }

        let rule = match scope {
            Scope::General => self.general,
            Scope::Completion => self.completion,
        };

        let mut windows = self.windows.lock().unwrap();
        if windows.len() > 4096 {
            let horizon = self.general.window.max(self.completion.window);
            windows.retain(|_, w| w.started.elapsed() < horizon);
        }

        let window = windows
            .entry((scope, identity.to_string()))
            .or_insert_with(|| Window { started: Instant::now(), count: 0 });

        if window.started.elapsed() >= rule.window {
            window.started = Instant::now();
            window.count = 0;
        }

        if window.count >= rule.max_requests {
            let elapsed = window.started.elapsed();
            let remaining = rule.window.saturating_sub(elapsed);
            return Err(remaining.as_secs().max(1));
        }

        window.count += 1;
        Ok(())
    }
}

impl Default for RateLimiter {
    /// Defaults: 500 requests / 5 minutes general,
    /// 30 requests / minute for completions.
    fn default() -> Self {
        Self::new(
            LimitRule { max_requests: 500, window: Duration::from_secs(300) },
            LimitRule { max_requests: 30, window: Duration::from_secs(60) },
        )
    }
}

fn is_local_identity(identity: &str) -> bool {
    matches!(identity, "127.0.0.1" | "::1" | "localhost")
}

// ============================================================
// Middleware
// ============================================================

/// General window applied to every route. Authenticated requests are
/// keyed by user id (the auth layer runs first), everything else by
/// client IP.
pub async fn general_rate_limit(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let identity = request
        .extensions()
        .get::<AuthUser>()
        .map(|user| user.0.to_string())
        .unwrap_or_else(|| client_ip(&request, addr));

    state
        .rate_limiter
        .check(Scope::General, &identity)
        .map_err(|retry_after_secs| ApiError::RateLimited { retry_after_secs })?;
    Ok(next.run(request).await)
}

/// Honors the first x-forwarded-for hop when present, so deployments
/// behind a proxy key on the real client.
fn client_ip(request: &Request, addr: SocketAddr) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|ip| ip.trim().to_string())
        .unwrap_or_else(|| addr.ip().to_string())
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tight_limiter() -> RateLimiter {
        RateLimiter::new(
            LimitRule { max_requests: 3, window: Duration::from_secs(60) },
            LimitRule { max_requests: 2, window: Duration::from_secs(60) },
        )
    }

    #[test]
    fn admits_under_the_limit() {
        let limiter = tight_limiter();
        for _ in 0..3 {
            assert!(limiter.check(Scope::General, "10.0.0.1").is_ok());
        }
    }

    #[test]
    fn rejects_over_the_limit_with_retry_hint() {
        let limiter = tight_limiter();
        for _ in 0..3 {
            limiter.check(Scope::General, "10.0.0.1").unwrap();
        }
        let retry = limiter.check(Scope::General, "10.0.0.1").unwrap_err();
        assert!(retry >= 1 && retry <= 60);
    }

    #[test]
    fn scopes_are_independent() {
        let limiter = tight_limiter();
        for _ in 0..2 {
            limiter.check(Scope::Completion, "u1").unwrap();
        }
        assert!(limiter.check(Scope::Completion, "u1").is_err());
        // General window for the same identity is untouched.
        assert!(limiter.check(Scope::General, "u1").is_ok());
    }

    #[test]
    fn identities_are_independent() {
        let limiter = tight_limiter();
        for _ in 0..3 {
            limiter.check(Scope::General, "10.0.0.1").unwrap();
        }
        assert!(limiter.check(Scope::General, "10.0.0.2").is_ok());
    }

    #[test]
    fn window_resets_after_expiry() {
        let limiter = RateLimiter::new(
            LimitRule { max_requests: 1, window: Duration::from_millis(20) },
            LimitRule { max_requests: 1, window: Duration::from_millis(20) },
        );
        limiter.check(Scope::General, "10.0.0.1").unwrap();
        assert!(limiter.check(Scope::General, "10.0.0.1").is_err());
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.check(Scope::General, "10.0.0.1").is_ok());
    }

    #[test]
    fn loopback_bypasses_both_windows() {
        let limiter = RateLimiter::new(
            LimitRule { max_requests: 1, window: Duration::from_secs(60) },
            LimitRule { max_requests: 1, window: Duration::from_secs(60) },
        );
        for _ in 0..50 {
            assert!(limiter.check(Scope::General, "127.0.0.1").is_ok());
            assert!(limiter.check(Scope::Completion, "::1").is_ok());
        }
    }
}
