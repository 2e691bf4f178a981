use crate::policy::Policy;

/// Reset horizon reported when a bucket can never refill (rate <= 0).
/// Config validation rejects such policies, the guard is kept so the
/// algorithm itself never divides by zero.
pub const FAR_FUTURE_RESET_SECS: f64 = 31_536_000.0;

/// Persisted per-key bucket state.
///
/// Absence of a record is equivalent to a full bucket; creation is lazy on
/// first access. `last_refill` is epoch seconds supplied by the gateway, the
/// store itself holds no clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill: f64,
}

/// Result of one atomic refill-and-consume against a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckOutcome {
    pub allowed: bool,
    pub tokens_remaining: f64,
    /// Epoch seconds at which at least one token will be available.
    /// Equal to `now` when a token is already available.
    pub reset_time: f64,
}

/// The refill-and-consume algorithm, as a pure function of stored state,
/// policy and the caller-supplied clock.
///
/// Returns the state to write back (written unconditionally, even on deny,
/// so elapsed time is never double-counted) and the outcome. The Lua script
/// in `redis.rs` implements exactly this function server-side; the in-memory
/// store calls it directly.
pub fn refill_and_consume(
    state: Option<BucketState>,
    policy: &Policy,
    now: f64,
) -> (BucketState, CheckOutcome) {
    let capacity = policy.capacity as f64;
    let rate = policy.refill_rate_per_second;

    let current = state.unwrap_or(BucketState {
        tokens: capacity,
        last_refill: now,
    });

    let elapsed = (now - current.last_refill).max(0.0);
    let mut tokens = (current.tokens + elapsed * rate).min(capacity);

    let allowed = tokens >= 1.0;
    if allowed {
        tokens -= 1.0;
    }

    let reset_time = if rate <= 0.0 {
        now + FAR_FUTURE_RESET_SECS
    } else if tokens >= 1.0 {
        now
    } else {
        now + (1.0 - tokens) / rate
    };

    (
        BucketState {
            tokens,
            last_refill: now,
        },
        CheckOutcome {
            allowed,
            tokens_remaining: tokens,
            reset_time,
        },
    )
}

/// Truncate a fractional reset time to whole epoch seconds for the
/// externally visible contract.
pub fn reset_epoch(reset_time: f64) -> i64 {
    reset_time as i64
}
