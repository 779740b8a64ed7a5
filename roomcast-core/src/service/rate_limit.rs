//! Per-address token bucket for inbound events: 100 events per 10 seconds,
//! then a 5 second cooldown. Loopback traffic bypasses the limiter.

use dashmap::DashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::{Error, Result};

pub const BUCKET_CAPACITY: f64 = 100.0;
pub const WINDOW_SECS: f64 = 10.0;
pub const COOLDOWN_SECS: u64 = 5;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    cooldown_until: Option<Instant>,
}

/// In-memory token-bucket limiter keyed by remote address.
pub struct RateLimiter {
    buckets: DashMap<IpAddr, Bucket>,
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Account one event for `addr`. Returns `Error::RateLimit` with the
    /// remaining cooldown when exhausted.
    pub fn check(&self, addr: IpAddr) -> Result<()> {
        self.check_at(addr, Instant::now())
    }

    fn check_at(&self, addr: IpAddr, now: Instant) -> Result<()> {
        if addr.is_loopback() {
            return Ok(());
        }

        let mut entry = self.buckets.entry(addr).or_insert_with(|| Bucket {
            tokens: BUCKET_CAPACITY,
            last_refill: now,
            cooldown_until: None,
        });
        let bucket = entry.value_mut();

        if let Some(until) = bucket.cooldown_until {
            if now < until {
                let retry_after = (until - now).as_secs().max(1);
                return Err(Error::RateLimit {
                    retry_after_seconds: retry_after,
                });
            }
            bucket.cooldown_until = None;
            bucket.tokens = BUCKET_CAPACITY;
            bucket.last_refill = now;
        }

        // Continuous refill at capacity/window.
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens =
            (bucket.tokens + elapsed * (BUCKET_CAPACITY / WINDOW_SECS)).min(BUCKET_CAPACITY);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            bucket.cooldown_until = Some(now + Duration::from_secs(COOLDOWN_SECS));
            Err(Error::RateLimit {
                retry_after_seconds: COOLDOWN_SECS,
            })
        }
    }

    /// Number of addresses currently tracked.
    #[must_use]
    pub fn tracked_addresses(&self) -> usize {
        self.buckets.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn remote() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50))
    }

    #[test]
    fn allows_up_to_capacity_then_cools_down() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        for _ in 0..100 {
            limiter.check_at(remote(), now).expect("within limit");
        }
        let err = limiter.check_at(remote(), now).expect_err("exhausted");
        match err {
            Error::RateLimit {
                retry_after_seconds,
            } => assert_eq!(retry_after_seconds, COOLDOWN_SECS),
            other => panic!("unexpected error: {other}"),
        }

        // Still cooling down shortly after.
        assert!(limiter
            .check_at(remote(), now + Duration::from_secs(2))
            .is_err());
        // Cooldown elapsed: full bucket again.
        limiter
            .check_at(remote(), now + Duration::from_secs(COOLDOWN_SECS))
            .expect("cooldown over");
    }

    #[test]
    fn refills_over_time() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        for _ in 0..100 {
            limiter.check_at(remote(), now).expect("drain");
        }
        // Half the window later, half the bucket is back.
        let t1 = now + Duration::from_secs(5);
        for _ in 0..50 {
            limiter.check_at(remote(), t1).expect("refilled");
        }
        assert!(limiter.check_at(remote(), t1).is_err());
    }

    #[test]
    fn loopback_bypasses() {
        let limiter = RateLimiter::new();
        let local = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let now = Instant::now();
        for _ in 0..1000 {
            limiter.check_at(local, now).expect("loopback is unmetered");
        }
        assert_eq!(limiter.tracked_addresses(), 0);
    }

    #[test]
    fn addresses_are_independent() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        for _ in 0..100 {
            limiter.check_at(remote(), now).expect("drain first");
        }
        let other = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));
        limiter.check_at(other, now).expect("fresh bucket");
    }
}
