use std::collections::HashMap;
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("too many failed verifications; try again in {}s", remaining.as_secs().max(1))]
pub struct LockedOut {
    pub remaining: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub max_failures: u32,
    pub window: Duration,
    pub lockout: Duration,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            max_failures: 5,
            window: Duration::from_secs(60),
            lockout: Duration::from_secs(300),
        }
    }
}

struct SubjectRecord {
    failures: u32,
    window_start: Instant,
    locked_until: Option<Instant>,
}

impl SubjectRecord {
    fn fresh(now: Instant) -> Self {
        Self {
            failures: 0,
            window_start: now,
            locked_until: None,
        }
    }
}

/// Per-subject rate limiter for verification sessions.
///
/// A session that ends in a `Fail` result counts once against its subject;
/// after `max_failures` within `window` the subject is locked out for
/// `lockout`. Load and detector errors do not count. Photo comparisons are
/// gated but never recorded.
pub struct RateLimiter {
    limits: RateLimits,
    records: HashMap<String, SubjectRecord>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            records: HashMap::new(),
        }
    }

    /// `Ok(())` if the subject may open a session or verify.
    pub fn check(&mut self, subject: &str, now: Instant) -> Result<(), LockedOut> {
        let Some(record) = self.records.get_mut(subject) else {
            return Ok(());
        };

        if let Some(locked_until) = record.locked_until {
            if now < locked_until {
                return Err(LockedOut {
                    remaining: locked_until.duration_since(now),
                });
            }
            // Lockout expired
            *record = SubjectRecord::fresh(now);
        } else if now.duration_since(record.window_start) >= self.limits.window {
            *record = SubjectRecord::fresh(now);
        }
        Ok(())
    }

    /// Record a failed session. May trigger a lockout.
    pub fn record_failure(&mut self, subject: &str, now: Instant) {
        let limits = self.limits;
        let record = self
            .records
            .entry(subject.to_string())
            .or_insert_with(|| SubjectRecord::fresh(now));

        if now.duration_since(record.window_start) >= limits.window {
            *record = SubjectRecord::fresh(now);
        }

        record.failures += 1;
        if record.failures >= limits.max_failures {
            record.locked_until = Some(now + limits.lockout);
            tracing::warn!(
                subject,
                failures = record.failures,
                lockout_secs = limits.lockout.as_secs(),
                "rate limit triggered, locking subject"
            );
        } else {
            tracing::debug!(
                subject,
                failures = record.failures,
                max = limits.max_failures,
                "session failed, incrementing failure counter"
            );
        }
    }

    /// A successful session clears the subject's record.
    pub fn record_success(&mut self, subject: &str) {
        self.records.remove(subject);
    }
}
