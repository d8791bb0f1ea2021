/// Time source and ID minting, injectable for deterministic tests
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Monotonic wall-clock source
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Opaque unique-ID minter
pub trait IdGen: Send + Sync {
    fn mint(&self) -> Uuid;
}

/// Production clock backed by the system time
#[derive(Debug, Default, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Production ID generator (UUIDv4)
#[derive(Debug, Default, Clone)]
pub struct UuidGen;

impl IdGen for UuidGen {
    fn mint(&self) -> Uuid {
        Uuid::new_v4()
    }
}

/// Manually-advanced clock for tests
#[derive(Debug)]
pub struct ManualClock {
    // unix micros; chrono DateTime is not atomically swappable
    micros: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { micros: AtomicI64::new(start.timestamp_micros()) }
    }

    pub fn advance(&self, duration: chrono::Duration) {
        self.micros.fetch_add(
            duration.num_microseconds().unwrap_or(i64::MAX),
            Ordering::SeqCst,
        );
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        self.micros.store(instant.timestamp_micros(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_micros(self.micros.load(Ordering::SeqCst))
            .unwrap_or_else(Utc::now)
    }
}

/// Sequential ID generator for tests; IDs are stable across runs
#[derive(Debug, Default)]
pub struct SeqIdGen {
    counter: AtomicU64,
}

impl IdGen for SeqIdGen {
    fn mint(&self) -> Uuid {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Uuid::from_u128(n as u128)
    }
}

pub type SharedClock = Arc<dyn Clock>;
pub type SharedIdGen = Arc<dyn IdGen>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::minutes(16));
        assert_eq!(clock.now(), start + Duration::minutes(16));
    }

    #[test]
    fn seq_idgen_is_deterministic() {
        let ids = SeqIdGen::default();
        let a = ids.mint();
        let b = ids.mint();
        assert_ne!(a, b);
        assert_eq!(a, Uuid::from_u128(1));
        assert_eq!(b, Uuid::from_u128(2));
    }
}
