// Capacity Limiter
// Token-bucket pacing for loops that issue many physical operations

use crate::db::catalog::Catalog;
use crate::db::traits::CapacityLimits;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Token bucket with continuous refill
///
/// Tokens are fractional so slow rates (below one unit per second) still
/// refill smoothly.
#[derive(Debug)]
pub struct TokenBucket {
    /// Maximum tokens in the bucket
    capacity: f64,

    /// Current number of tokens
    tokens: f64,

    /// Last refill time
    last_refill: Instant,

    tokens_per_sec: f64,
}

impl TokenBucket {
    /// Create a full bucket holding `capacity` tokens, refilled at `rate` per second
    pub fn new(capacity: f64, rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
            tokens_per_sec: rate,
        }
    }

    /// Try to consume tokens
    ///
    /// Returns `true` if successful, `false` if insufficient tokens.
    pub fn try_consume(&mut self, tokens: f64) -> bool {
        self.refill();

        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    /// Time until `tokens` can be consumed, zero if available now
    pub fn delay_for(&mut self, tokens: f64) -> Duration {
        self.refill();
        if self.tokens >= tokens || self.tokens_per_sec <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((tokens - self.tokens) / self.tokens_per_sec)
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = self.capacity.min(self.tokens + self.tokens_per_sec * elapsed);
        self.last_refill = now;
    }

    /// Get current token count (after refill)
    pub fn available_tokens(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn rate(&self) -> f64 {
        self.tokens_per_sec
    }
}

/// Default scaling applied to provisioned capacity by bulk operations
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapacityFactors {
    pub update: f64,
    pub delete: f64,
    pub scan: f64,
}

impl Default for CapacityFactors {
    fn default() -> Self {
        Self {
            update: 0.25,
            delete: 0.35,
            scan: 0.9,
        }
    }
}

/// Caller overrides for `Catalog::get_capacity`
#[derive(Debug, Clone, Default)]
pub struct CapacityOptions {
    /// Explicit units per second instead of the configured capacity
    pub capacity: Option<f64>,
    /// Burst ceiling, defaults to the unscaled capacity
    pub max_capacity: Option<f64>,
    /// Fraction of the capacity this operation may use
    pub factor: Option<f64>,
    /// Pace writes instead of reads
    pub use_write: bool,
    /// Secondary index the operation reads through
    pub index: Option<String>,
}

/// Rate descriptor for one table or index, alive for the duration of a bulk operation
#[derive(Debug)]
pub struct Capacity {
    pub table: String,
    pub read_capacity: f64,
    pub write_capacity: f64,
    /// Refill rate after scaling
    pub rate: f64,
    /// Burst ceiling
    pub max: f64,
    bucket: Mutex<TokenBucket>,
}

impl Capacity {
    pub fn new(table: &str, rate: f64, max: f64) -> Self {
        Self {
            table: table.to_string(),
            read_capacity: rate,
            write_capacity: rate,
            rate,
            max,
            bucket: Mutex::new(TokenBucket::new(max, rate)),
        }
    }

    /// Unthrottled descriptor
    pub fn unlimited(table: &str) -> Self {
        Self::new(table, 0.0, 0.0)
    }

    pub fn is_limited(&self) -> bool {
        self.rate > 0.0
    }

    /// Consume `units`, returning how long the caller must wait first
    fn reserve(&self, units: f64) -> Duration {
        let mut bucket = self.bucket.lock();
        if bucket.try_consume(units) {
            Duration::ZERO
        } else {
            bucket.delay_for(units).max(Duration::from_millis(1))
        }
    }
}

/// Consume `units` from the descriptor's bucket, sleeping until they are available
pub async fn check_capacity(capacity: &Capacity, units: f64) {
    if !capacity.is_limited() || units <= 0.0 {
        return;
    }
    // More than the burst ceiling can never fit in the bucket
    let units = units.min(capacity.max.max(1.0));
    loop {
        let delay = capacity.reserve(units);
        if delay.is_zero() {
            return;
        }
        tracing::debug!(table = %capacity.table, delay_ms = delay.as_millis() as u64, "Capacity wait");
        tokio::time::sleep(delay).await;
    }
}

impl Catalog {
    /// Build a capacity descriptor for a table from config, pool metadata or explicit options
    pub fn get_capacity(&self, table: &str, options: &CapacityOptions) -> Capacity {
        let limits = self.capacity_limits(table, options.index.as_deref());
        let (read, write) = match options.capacity {
            Some(units) => (units, units),
            None => (limits.read, limits.write),
        };
        let base = if options.use_write { write } else { read };
        let factor = options
            .factor
            .filter(|f| *f > 0.0 && *f <= 1.0)
            .unwrap_or(1.0);
        let rate = base * factor;
        let max = options.max_capacity.unwrap_or(base).max(rate);
        Capacity {
            table: table.to_string(),
            read_capacity: read,
            write_capacity: write,
            rate,
            max,
            bucket: Mutex::new(TokenBucket::new(max, rate)),
        }
    }

    fn capacity_limits(&self, table: &str, index: Option<&str>) -> CapacityLimits {
        let tc = self.table_config(table);
        let mut limits = CapacityLimits {
            read: tc.read_capacity.unwrap_or(0.0),
            write: tc.write_capacity.unwrap_or(0.0),
        };
        if let Ok(pool) = self.pool_for_table(table, None) {
            let meta = pool.metadata().read();
            let indexed = index.and_then(|i| meta.dbcapacity.get(&format!("{}/{}", table, i)));
            if let Some(found) = indexed.or_else(|| meta.dbcapacity.get(table)) {
                if tc.read_capacity.is_none() {
                    limits.read = found.read;
                }
                if tc.write_capacity.is_none() {
                    limits.write = found.write;
                }
            }
        }
        limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_token_bucket_basic() {
        let mut bucket = TokenBucket::new(10.0, 10.0);

        assert!(bucket.try_consume(5.0));
        assert!(bucket.try_consume(5.0));

        // Should fail - no tokens left
        assert!(!bucket.try_consume(1.0));
        let delay = bucket.delay_for(1.0);
        assert!(delay > Duration::from_millis(80) && delay <= Duration::from_millis(100));
    }

    #[test]
    fn test_token_bucket_refill() {
        let mut bucket = TokenBucket::new(10.0, 100.0);
        assert!(bucket.try_consume(10.0));

        thread::sleep(Duration::from_millis(150));

        assert!(bucket.try_consume(10.0));
        assert!(bucket.available_tokens() < 10.0);
    }

    #[tokio::test]
    async fn test_eleventh_call_waits_for_refill() {
        let capacity = Capacity::new("t", 10.0, 10.0);
        let started = Instant::now();
        for _ in 0..10 {
            check_capacity(&capacity, 1.0).await;
        }
        assert!(started.elapsed() < Duration::from_millis(50));

        let before = Instant::now();
        check_capacity(&capacity, 1.0).await;
        assert!(before.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_unlimited_never_waits() {
        let capacity = Capacity::unlimited("t");
        let started = Instant::now();
        for _ in 0..1000 {
            check_capacity(&capacity, 5.0).await;
        }
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_default_factors() {
        let factors = CapacityFactors::default();
        assert_eq!(factors.update, 0.25);
        assert_eq!(factors.delete, 0.35);
        assert_eq!(factors.scan, 0.9);
    }
}
