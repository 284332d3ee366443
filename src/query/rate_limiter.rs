//! Per-user query rate limiter
//!
//! Two sliding windows per user: total queries over 60 seconds and
//! complex queries (score at or above the complexity threshold) over an
//! hour. Rejections carry a `retry_after` hint derived from the oldest
//! entry in the violated window.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub retry_after_secs: Option<u64>,
}

impl RateDecision {
    fn allowed() -> Self {
        Self { allowed: true, reason: None, retry_after_secs: None }
    }

    fn denied(reason: String, retry_after_secs: u64) -> Self {
        Self { allowed: false, reason: Some(reason), retry_after_secs: Some(retry_after_secs) }
    }
}

#[derive(Debug, Default)]
struct UserWindows {
    minute: VecDeque<DateTime<Utc>>,
    hour: VecDeque<DateTime<Utc>>,
}

pub struct RateLimiter {
    users: DashMap<String, UserWindows>,
    max_per_minute: u32,
    max_complex_per_hour: u32,
    complexity_threshold: u32,
}

impl RateLimiter {
    pub fn new(max_per_minute: u32, max_complex_per_hour: u32, complexity_threshold: u32) -> Self {
        Self {
            users: DashMap::new(),
            max_per_minute,
            max_complex_per_hour,
            complexity_threshold,
        }
    }

    /// Check and record one query attempt for `user`. Allowed attempts
    /// are recorded in the relevant windows; denied attempts are not.
    pub fn check(&self, user: &str, complexity_score: u32, now: DateTime<Utc>) -> RateDecision {
        let mut windows = self.users.entry(user.to_string()).or_default();

        prune(&mut windows.minute, now - Duration::seconds(60));
        prune(&mut windows.hour, now - Duration::seconds(3_600));

        if windows.minute.len() >= self.max_per_minute as usize {
            let retry = retry_after(windows.minute.front(), now, 60);
            return RateDecision::denied(
                format!("rate limit exceeded: {} queries per minute", self.max_per_minute),
                retry,
            );
        }

        let complex = complexity_score >= self.complexity_threshold;
        if complex && windows.hour.len() >= self.max_complex_per_hour as usize {
            let retry = retry_after(windows.hour.front(), now, 3_600);
            return RateDecision::denied(
                format!(
                    "rate limit exceeded: {} complex queries per hour",
                    self.max_complex_per_hour
                ),
                retry,
            );
        }

        windows.minute.push_back(now);
        if complex {
            windows.hour.push_back(now);
        }
        RateDecision::allowed()
    }

    /// Drop users with no recent activity (periodic housekeeping)
    pub fn sweep(&self, now: DateTime<Utc>) {
        self.users.retain(|_, windows| {
            prune(&mut windows.minute, now - Duration::seconds(60));
            prune(&mut windows.hour, now - Duration::seconds(3_600));
            !(windows.minute.is_empty() && windows.hour.is_empty())
        });
    }

    pub fn tracked_users(&self) -> usize {
        self.users.len()
    }
}

fn prune(window: &mut VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) {
    while window.front().is_some_and(|ts| *ts < cutoff) {
        window.pop_front();
    }
}

fn retry_after(oldest: Option<&DateTime<Utc>>, now: DateTime<Utc>, window_secs: i64) -> u64 {
    match oldest {
        Some(oldest) => {
            let free_at = *oldest + Duration::seconds(window_secs);
            (free_at - now).num_seconds().max(1) as u64
        }
        None => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thirty_simple_queries_then_cliff() {
        let limiter = RateLimiter::new(30, 10, 50);
        let start = Utc::now();

        // 30 queries spread over 58 seconds are all admitted
        for i in 0..30 {
            let ts = start + Duration::seconds(i * 2);
            let decision = limiter.check("alice", 10, ts);
            assert!(decision.allowed, "query {} was denied", i);
        }

        // The 31st inside the same minute is rejected with retry ~2s:
        // the oldest entry (t=0) leaves the window at t=60
        let decision = limiter.check("alice", 10, start + Duration::seconds(58));
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_secs, Some(2));

        // Another user is unaffected
        assert!(limiter.check("bob", 10, start + Duration::seconds(58)).allowed);
    }

    #[test]
    fn test_complex_queries_have_hourly_window() {
        let limiter = RateLimiter::new(100, 10, 50);
        let start = Utc::now();

        for i in 0..10 {
            let decision = limiter.check("alice", 80, start + Duration::seconds(i));
            assert!(decision.allowed, "complex query {} was denied", i);
        }

        // The 11th complex query within the hour is rejected with a
        // retry hint close to the full hour
        let decision = limiter.check("alice", 80, start + Duration::seconds(20));
        assert!(!decision.allowed);
        let retry = decision.retry_after_secs.unwrap();
        assert!((3_500..=3_600).contains(&retry), "retry was {}", retry);

        // A simple query still passes
        assert!(limiter.check("alice", 10, start + Duration::seconds(21)).allowed);
    }

    #[test]
    fn test_window_slides() {
        let limiter = RateLimiter::new(2, 10, 50);
        let start = Utc::now();

        assert!(limiter.check("u", 0, start).allowed);
        assert!(limiter.check("u", 0, start + Duration::seconds(1)).allowed);
        assert!(!limiter.check("u", 0, start + Duration::seconds(2)).allowed);

        // Once the first entry ages out, capacity returns
        assert!(limiter.check("u", 0, start + Duration::seconds(61)).allowed);
    }

    #[test]
    fn test_sweep_drops_idle_users() {
        let limiter = RateLimiter::new(30, 10, 50);
        let start = Utc::now();
        limiter.check("alice", 10, start);
        assert_eq!(limiter.tracked_users(), 1);

        limiter.sweep(start + Duration::hours(2));
        assert_eq!(limiter.tracked_users(), 0);
    }

    #[test]
    fn test_denied_attempts_are_not_recorded() {
        let limiter = RateLimiter::new(1, 10, 50);
        let start = Utc::now();
        assert!(limiter.check("u", 0, start).allowed);
        for i in 0..5 {
            assert!(!limiter.check("u", 0, start + Duration::seconds(1 + i)).allowed);
        }
        // The single recorded entry ages out on schedule regardless of
        // the denied attempts
        assert!(limiter.check("u", 0, start + Duration::seconds(61)).allowed);
    }
}
