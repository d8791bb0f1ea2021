/// Process-local limiter for unauthenticated endpoints
///
/// Registration and login have no principal to meter against, so they get a
/// shared in-memory token bucket instead of cache counters.
use crate::error::{ApiError, ApiResult};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

#[derive(Clone)]
pub struct PublicRateLimiter {
    limiter: Arc<GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl PublicRateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::new(30).unwrap()),
        );
        Self { limiter: Arc::new(GovernorLimiter::direct(quota)) }
    }

    pub fn check(&self) -> ApiResult<()> {
        self.limiter.check().map_err(|_| ApiError::QuotaExceeded {
            bucket: "public_requests_per_minute".to_string(),
            retry_after_secs: 60,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_past_quota_is_denied() {
        let limiter = PublicRateLimiter::new(5);
        for _ in 0..5 {
            assert!(limiter.check().is_ok());
        }
        assert!(limiter.check().is_err());
    }
}
