//! Per-key request rate limiting.
//!
//! One token-bucket limiter per API key, created on first use. The
//! acquire is non-blocking: a rejected call reports how long the caller
//! should back off without consuming anything from the bucket.

use std::num::NonZeroU32;
use std::sync::Arc;

use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::error::{Error, Result};

type KeyLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

struct RegisteredLimiter {
    rate_per_sec: u32,
    limiter: Arc<KeyLimiter>,
}

#[derive(Default)]
pub struct RateLimiterRegistry {
    limiters: DashMap<String, RegisteredLimiter>,
    clock: DefaultClock,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking acquire of one request slot for `key_id`.
    ///
    /// A zero rate means unlimited. When the key's configured rate
    /// changes, the old bucket is replaced rather than left running at
    /// the stale rate.
    pub fn check(&self, key_id: &str, rate_per_sec: u32) -> Result<()> {
        if rate_per_sec == 0 {
            return Ok(());
        }
        let rate = NonZeroU32::new(rate_per_sec).expect("non-zero checked above");

        let limiter = {
            let mut entry = self
                .limiters
                .entry(key_id.to_owned())
                .or_insert_with(|| Self::build(rate));
            if entry.rate_per_sec != rate_per_sec {
                *entry = Self::build(rate);
            }
            entry.limiter.clone()
        };

        match limiter.check() {
            Ok(()) => Ok(()),
            Err(not_until) => Err(Error::RateLimited {
                retry_after: not_until.wait_time_from(self.clock.now()),
            }),
        }
    }

    fn build(rate: NonZeroU32) -> RegisteredLimiter {
        let quota = Quota::per_second(rate).allow_burst(rate);
        RegisteredLimiter {
            rate_per_sec: rate.get(),
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}
