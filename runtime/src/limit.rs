//! Named token buckets with blocking reservation.
//!
//! Byte-rate and op-rate buckets refill linearly at `rate` tokens per
//! second up to `capacity == rate`; total buckets hold a fixed quota and
//! never refill. Rate buckets start empty, so the first second of traffic
//! is already paced. Waiters on one bucket queue on its internal lock and
//! are served in arrival order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{LimitError, RtError};

const NANOS_PER_SEC: u128 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    /// Bytes per second.
    ByteRate,
    /// Operations per second.
    OpRate,
    /// Fixed quota, never refilled.
    Total,
}

/// Declared limit: the unit of configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limit {
    pub name: String,
    pub kind: LimitKind,
    pub rate: u64,
}

impl Limit {
    pub fn new(name: impl Into<String>, kind: LimitKind, rate: u64) -> Self {
        Self {
            name: name.into(),
            kind,
            rate,
        }
    }
}

#[derive(Debug)]
struct BucketState {
    available: u64,
    last_refill: Instant,
}

#[derive(Debug)]
struct Bucket {
    kind: LimitKind,
    capacity: u64,
    state: Mutex<BucketState>,
}

impl Bucket {
    fn new(kind: LimitKind, rate: u64) -> Self {
        let available = match kind {
            // A quota is spendable immediately.
            LimitKind::Total => rate,
            // Rate buckets accrue from zero.
            LimitKind::ByteRate | LimitKind::OpRate => 0,
        };
        Self {
            kind,
            capacity: rate,
            state: Mutex::new(BucketState {
                available,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Credit tokens for the time elapsed since the last refill.
    ///
    /// `last_refill` only advances when at least one whole token accrued,
    /// so sub-token slivers of time are not silently discarded.
    fn refill(&self, state: &mut BucketState, now: Instant) {
        if self.kind == LimitKind::Total {
            return;
        }
        let elapsed = now.saturating_duration_since(state.last_refill);
        let add = elapsed.as_nanos().saturating_mul(u128::from(self.capacity)) / NANOS_PER_SEC;
        if add > 0 {
            state.available = state.available.saturating_add(add as u64).min(self.capacity);
            state.last_refill = now;
        }
    }
}

/// Registry of named buckets. Built once per [`crate::Context`] tree and
/// shared; absent names mean "no limit declared".
#[derive(Debug, Default)]
pub struct Limiter {
    buckets: HashMap<String, Arc<Bucket>>,
}

impl Limiter {
    #[must_use]
    pub fn new(limits: impl IntoIterator<Item = Limit>) -> Self {
        let buckets = limits
            .into_iter()
            .map(|l| (l.name, Arc::new(Bucket::new(l.kind, l.rate))))
            .collect();
        Self { buckets }
    }

    /// Current refill rate (or remaining quota size for total buckets).
    pub fn rate(&self, name: &str) -> Result<u64, LimitError> {
        self.buckets
            .get(name)
            .map(|b| b.capacity)
            .ok_or_else(|| LimitError::RateUnknown {
                name: name.to_string(),
            })
    }

    /// Rate if the bucket exists; `None` means unlimited.
    #[must_use]
    pub fn declared_rate(&self, name: &str) -> Option<u64> {
        self.buckets.get(name).map(|b| b.capacity)
    }

    /// Block until `n` tokens are available in bucket `name`, then deduct.
    ///
    /// Undeclared bucket names succeed immediately. Total buckets fail with
    /// [`LimitError::QuotaExhausted`] instead of waiting. The wait observes
    /// `cancel` and returns [`RtError::Cancelled`] promptly when it fires.
    pub async fn take(&self, name: &str, n: u64, cancel: &CancellationToken) -> Result<(), RtError> {
        let Some(bucket) = self.buckets.get(name) else {
            return Ok(());
        };
        // A single request can exceed a rate bucket's one-second capacity
        // (callers normally chunk, but nothing forces them to); split it so
        // each slice fits the bucket.
        let mut remaining = n;
        while remaining > 0 {
            let slice = match bucket.kind {
                LimitKind::Total => remaining,
                _ => remaining.min(bucket.capacity.max(1)),
            };
            self.take_slice(name, bucket.as_ref(), slice, cancel).await?;
            remaining -= slice;
        }
        Ok(())
    }

    async fn take_slice(
        &self,
        name: &str,
        bucket: &Bucket,
        n: u64,
        cancel: &CancellationToken,
    ) -> Result<(), RtError> {
        // Holding the bucket lock across the sleep is what makes waiters
        // FIFO: later arrivals queue on the lock until this reservation is
        // fully paid for.
        let mut state = bucket.state.lock().await;
        loop {
            let now = Instant::now();
            bucket.refill(&mut state, now);
            if state.available >= n {
                state.available -= n;
                return Ok(());
            }
            if bucket.kind == LimitKind::Total {
                return Err(LimitError::QuotaExhausted {
                    name: name.to_string(),
                }
                .into());
            }
            let missing = u128::from(n - state.available);
            let wait_ns = (missing * NANOS_PER_SEC).div_ceil(u128::from(bucket.capacity.max(1)));
            let wait = Duration::from_nanos(wait_ns.min(u128::from(u64::MAX)) as u64);
            tracing::trace!(limit = name, need = n, have = state.available, ?wait, "throttled");
            tokio::select! {
                () = cancel.cancelled() => return Err(RtError::Cancelled),
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Snapshot of a bucket's balance after refilling it to now.
    pub async fn available(&self, name: &str) -> Option<u64> {
        let bucket = self.buckets.get(name)?;
        let mut state = bucket.state.lock().await;
        bucket.refill(&mut state, Instant::now());
        Some(state.available)
    }

    /// Capacity invariant check used by tests: `available <= capacity`.
    pub async fn within_capacity(&self, name: &str) -> bool {
        match self.buckets.get(name) {
            Some(bucket) => {
                let state = bucket.state.lock().await;
                state.available <= bucket.capacity
            }
            None => true,
        }
    }
}
