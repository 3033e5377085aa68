use chrono::{DateTime, Duration, Utc};
use globset::{Glob, GlobMatcher};
use hashbrown::HashMap;
use log::warn;
use miette::Diagnostic;
use thiserror::Error;

use sluice_model::{ServerConfig, User, secs_to_ceil};
use sluice_store::Registry;

const DEFAULT_POINTS: u64 = 10;

#[derive(Debug, Error, Diagnostic)]
pub enum LimiterError {
    #[error("user is blacklisted")]
    Blacklisted,

    #[error("rate limit exceeded ({metric}), retry in {retry_after}s")]
    Limited { metric: String, retry_after: u64 },

    #[error("registry error in limiter")]
    Registry(#[from] sluice_store::RegistryError),
}

/// Outcome of a served request: per-metric remaining counts and the next
/// minute boundary, surfaced as X-RateLimit headers.
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterVerdict {
    pub bypass: bool,
    pub remaining: Vec<(&'static str, u64)>,
    pub reset: DateTime<Utc>,
}

impl LimiterVerdict {
    fn bypass() -> LimiterVerdict {
        LimiterVerdict {
            bypass: true,
            remaining: Vec::new(),
            reset: Utc::now(),
        }
    }

    pub fn remaining_header(&self) -> String {
        self.remaining
            .iter()
            .map(|(name, left)| format!("{name}={left}"))
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// Atomic multi-window counters over the shared registry: requests,
/// response bytes and route points, each per minute/hour/day.
pub struct RateLimiter {
    registry: Registry,
    route_points: Vec<(GlobMatcher, u64)>,
    exact_points: HashMap<String, u64>,
    whitelist: Vec<String>,
    blacklist: Vec<String>,
}

fn compile_route_table(
    patterns: &std::collections::HashMap<String, u64>,
) -> (HashMap<String, u64>, Vec<(GlobMatcher, u64)>) {
    let mut exact = HashMap::new();
    let mut globs = Vec::new();
    for (pattern, points) in patterns {
        if pattern.contains(['*', '?', '[']) {
            match Glob::new(pattern) {
                Ok(glob) => globs.push((glob.compile_matcher(), *points)),
                Err(e) => warn!("ignoring bad route pattern {pattern:?}: {e}"),
            }
        } else {
            exact.insert(pattern.clone(), *points);
        }
    }
    (exact, globs)
}

/// Point cost of a route: exact match, then glob patterns, then the
/// engine default of 10.
fn lookup_points(
    exact: &HashMap<String, u64>,
    globs: &[(GlobMatcher, u64)],
    path: &str,
) -> u64 {
    if let Some(points) = exact.get(path) {
        return *points;
    }
    for (matcher, points) in globs {
        if matcher.is_match(path) {
            return *points;
        }
    }
    DEFAULT_POINTS
}

impl RateLimiter {
    pub fn new(registry: Registry, config: &ServerConfig) -> RateLimiter {
        let (exact_points, route_points) = compile_route_table(&config.route_points);
        RateLimiter {
            registry,
            route_points,
            exact_points,
            whitelist: config.whitelist.clone(),
            blacklist: config.blacklist.clone(),
        }
    }

    pub fn route_points(&self, path: &str) -> u64 {
        lookup_points(&self.exact_points, &self.route_points, path)
    }

    fn counter_key(&self, metric: &str, uid: &str) -> String {
        format!("{}:limiter:{metric}:{uid}", self.registry.ns())
    }

    /// Serve-or-reject one request and commit the counters. Concurrent
    /// requests for the same user may each pass the pre-check against the
    /// same pre-state; the pipelined INCRBY then over-shoots by at most
    /// one increment, never under-counts.
    pub async fn check_and_increment(
        &self,
        user: &User,
        path: &str,
        response_bytes: u64,
    ) -> Result<LimiterVerdict, LimiterError> {
        if self.blacklist.iter().any(|uid| uid == &user.uid) {
            warn!("blacklisted user {} attempted {path}", user.uid);
            return Err(LimiterError::Blacklisted);
        }
        if user.is_admin() || self.whitelist.iter().any(|uid| uid == &user.uid) {
            return Ok(LimiterVerdict::bypass());
        }

        let points = self.route_points(path);
        self.consume(user, points, response_bytes).await
    }

    /// Charge an explicit point cost (WebSocket subscribes) alongside one
    /// request.
    pub async fn consume_points(
        &self,
        user: &User,
        points: u64,
    ) -> Result<LimiterVerdict, LimiterError> {
        if user.is_admin() || self.whitelist.iter().any(|uid| uid == &user.uid) {
            return Ok(LimiterVerdict::bypass());
        }
        self.consume(user, points, 0).await
    }

    async fn consume(
        &self,
        user: &User,
        points: u64,
        response_bytes: u64,
    ) -> Result<LimiterVerdict, LimiterError> {
        let active = user.rate_limits.active();
        if active.is_empty() {
            return Ok(LimiterVerdict::bypass());
        }

        let keys: Vec<String> = active
            .iter()
            .map(|(name, _, _)| self.counter_key(name, &user.uid))
            .collect();
        let current = self.registry.counters(&keys).await?;

        let remaining = evaluate_limits(&active, &current, response_bytes, points)
            .map_err(|(metric, retry_after)| {
                warn!("rate limit exceeded for {} ({metric})", user.uid);
                LimiterError::Limited {
                    metric: metric.to_string(),
                    retry_after,
                }
            })?;

        let now = Utc::now();
        let bumps: Vec<(String, u64, u64)> = active
            .iter()
            .zip(&keys)
            .map(|((name, window, _), key)| {
                (
                    key.clone(),
                    increment_for(name, response_bytes, points),
                    secs_to_ceil(*window, now),
                )
            })
            .collect();
        self.registry.bump_counters(&bumps).await?;

        Ok(LimiterVerdict {
            bypass: false,
            remaining,
            reset: now + Duration::seconds(secs_to_ceil(60, now) as i64),
        })
    }

    /// Current limiter state for `/limits`: per active metric, the cap,
    /// what remains, the window width and the wall-clock reset.
    pub async fn get_user_limits(
        &self,
        user: &User,
    ) -> Result<serde_json::Value, LimiterError> {
        let active = user.rate_limits.active();
        let keys: Vec<String> = active
            .iter()
            .map(|(name, _, _)| self.counter_key(name, &user.uid))
            .collect();
        let states = self.registry.counters_with_ttl(&keys).await?;
        let now = Utc::now();
        let mut out = serde_json::Map::new();
        for ((name, window, cap), (count, ttl)) in active.iter().zip(states) {
            let ttl = if ttl > 0 { ttl as u64 } else { *window };
            out.insert(
                name.to_string(),
                serde_json::json!({
                    "cap": cap,
                    "remaining": cap.saturating_sub(count),
                    "ttl": window,
                    "reset": (now + Duration::seconds(ttl as i64)).to_rfc3339(),
                }),
            );
        }
        Ok(serde_json::Value::Object(out))
    }
}

fn increment_for(metric: &str, response_bytes: u64, points: u64) -> u64 {
    match metric.as_bytes().first() {
        Some(b'r') => 1,
        Some(b's') => response_bytes,
        _ => points,
    }
}

/// Pure pre-check: every active metric must admit its increment, request
/// counters by `current >= cap` (the slot is consumed on acceptance),
/// byte/point counters by `current + increment > cap`. On rejection,
/// surface the tightest expiring window among the rejected kind.
fn evaluate_limits(
    active: &[(&'static str, u64, u64)],
    current: &[u64],
    response_bytes: u64,
    points: u64,
) -> Result<Vec<(&'static str, u64)>, (&'static str, u64)> {
    let now = Utc::now();
    for ((name, _, cap), count) in active.iter().zip(current) {
        let increment = increment_for(name, response_bytes, points);
        let exceeded = if name.starts_with('r') {
            *count >= *cap
        } else {
            count + increment > *cap
        };
        if exceeded {
            let kind = &name[..1];
            let retry_after = active
                .iter()
                .filter(|(n, _, _)| n.starts_with(kind))
                .map(|(_, window, _)| secs_to_ceil(*window, now))
                .min()
                .unwrap_or(60);
            return Err((*name, retry_after));
        }
    }
    Ok(active
        .iter()
        .zip(current)
        .map(|((name, _, cap), count)| {
            let next = count + increment_for(name, response_bytes, points);
            (*name, cap.saturating_sub(next))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_model::RateLimits;

    fn active_with(rpm: u64, ppm: u64) -> Vec<(&'static str, u64, u64)> {
        let limits = RateLimits {
            rpm,
            rph: 0,
            rpd: 0,
            spm: 0,
            sph: 0,
            spd: 0,
            ppm,
            pph: 0,
            ppd: 0,
        };
        limits.active()
    }

    #[test]
    fn request_counters_admit_exactly_cap_requests() {
        // rpm=3: counts 0,1,2 pass; 3 rejects. Matches remaining 2,1,0
        // then a 429.
        let active = active_with(3, 0);
        for (count, want_remaining) in [(0u64, 2u64), (1, 1), (2, 0)] {
            let verdict = evaluate_limits(&active, &[count], 0, 1).unwrap();
            assert_eq!(verdict, vec![("rpm", want_remaining)]);
        }
        let (metric, retry_after) = evaluate_limits(&active, &[3], 0, 1).unwrap_err();
        assert_eq!(metric, "rpm");
        assert!(retry_after <= 60);
    }

    #[test]
    fn point_counters_check_the_next_value() {
        let active = active_with(0, 100);
        // 95 consumed, 5 requested: exactly at cap passes.
        assert!(evaluate_limits(&active, &[95], 0, 5).is_ok());
        // 96 consumed, 5 requested: overflow rejects.
        let (metric, _) = evaluate_limits(&active, &[96], 0, 5).unwrap_err();
        assert_eq!(metric, "ppm");
    }

    #[test]
    fn byte_counters_use_the_response_size() {
        let limits = RateLimits {
            spm: 1_000,
            rpm: 0,
            rph: 0,
            rpd: 0,
            sph: 0,
            spd: 0,
            ppm: 0,
            pph: 0,
            ppd: 0,
        };
        let active = limits.active();
        assert!(evaluate_limits(&active, &[500], 500, 0).is_ok());
        assert!(evaluate_limits(&active, &[500], 501, 0).is_err());
    }

    #[test]
    fn retry_after_picks_the_tightest_window_of_the_kind() {
        let limits = RateLimits {
            rpm: 1,
            rph: 10,
            rpd: 0,
            spm: 0,
            sph: 0,
            spd: 0,
            ppm: 0,
            pph: 0,
            ppd: 0,
        };
        let active = limits.active();
        // Both request windows full; retry_after must come from the
        // minute window, not the hour.
        let (_, retry_after) = evaluate_limits(&active, &[1, 10], 0, 1).unwrap_err();
        assert!(retry_after <= 60, "retry_after {retry_after} beyond minute window");
    }

    #[test]
    fn increments_never_undercount() {
        assert_eq!(increment_for("rpm", 4096, 15), 1);
        assert_eq!(increment_for("sph", 4096, 15), 4096);
        assert_eq!(increment_for("ppd", 4096, 15), 15);
    }

    #[test]
    fn route_points_match_exact_then_glob_then_default() {
        let config = sluice_model::ServerConfig::default();
        let (exact, globs) = compile_route_table(&config.route_points);
        assert_eq!(lookup_points(&exact, &globs, "/ping"), 1);
        assert_eq!(lookup_points(&exact, &globs, "/history/BTCUSD"), 5);
        assert_eq!(lookup_points(&exact, &globs, "/analysis/BTCUSD"), 15);
        assert_eq!(lookup_points(&exact, &globs, "/admin/users"), 1);
        assert_eq!(lookup_points(&exact, &globs, "/nonexistent"), 10);
    }
}
