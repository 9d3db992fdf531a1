//! Token-bucket rate limiting, per (tenant, user) and per source IP.

use std::net::IpAddr;
use std::time::Instant;

use dashmap::DashMap;
use uuid::Uuid;

struct Bucket {
    tokens: f64,
    last: Instant,
}

impl Bucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last: Instant::now(),
        }
    }

    /// Refill at `rpm`/60 tokens per second (capped at `rpm`), then try
    /// to take one.
    fn allow(&mut self, rpm: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * rpm / 60.0).min(rpm);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct RateLimiter {
    per_user: DashMap<(Uuid, Uuid), Bucket>,
    per_ip: DashMap<IpAddr, Bucket>,
    user_rpm: u32,
    ip_rpm: u32,
}

impl RateLimiter {
    pub fn new(user_rpm: u32, ip_rpm: u32) -> Self {
        Self {
            per_user: DashMap::new(),
            per_ip: DashMap::new(),
            user_rpm,
            ip_rpm,
        }
    }

    pub fn allow_user(&self, tenant_id: Uuid, user_id: Uuid) -> bool {
        let mut bucket = self
            .per_user
            .entry((tenant_id, user_id))
            .or_insert_with(|| Bucket::new(self.user_rpm as f64));
        bucket.allow(self.user_rpm as f64)
    }

    pub fn allow_ip(&self, ip: IpAddr) -> bool {
        let mut bucket = self
            .per_ip
            .entry(ip)
            .or_insert_with(|| Bucket::new(self.ip_rpm as f64));
        bucket.allow(self.ip_rpm as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_up_to_capacity_then_blocked() {
        let limiter = RateLimiter::new(5, 100);
        let tenant = Uuid::new_v4();
        let user = Uuid::new_v4();
        for _ in 0..5 {
            assert!(limiter.allow_user(tenant, user));
        }
        assert!(!limiter.allow_user(tenant, user));
    }

    #[test]
    fn buckets_are_independent_per_user() {
        let limiter = RateLimiter::new(1, 100);
        let tenant = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(limiter.allow_user(tenant, a));
        assert!(!limiter.allow_user(tenant, a));
        assert!(limiter.allow_user(tenant, b));
    }

    #[test]
    fn ip_bucket_is_separate_from_user_bucket() {
        let limiter = RateLimiter::new(1, 2);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(limiter.allow_ip(ip));
        assert!(limiter.allow_ip(ip));
        assert!(!limiter.allow_ip(ip));
    }
}
