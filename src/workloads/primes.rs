//! Prime counting over a partitioned range.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::OrchestrationContext;

pub const PRIMES_ORCHESTRATION: &str = "PrimesOrchestration";
pub const CALCULATE_PRIMES_ACTIVITY: &str = "CalculatePrimes";

/// Inclusive sub-range `[start, end]`. Empty when `end < start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Boundary {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimesInput {
    pub max: u64,
    pub parallel: u8,
    /// Stretch the last boundary to end exactly at `max`.
    #[serde(default)]
    pub clamp_last: bool,
}

/// Trial division by odd divisors up to `sqrt(candidate)`; among even
/// numbers only 2 is prime. Candidates below 2 are not prime.
pub fn is_prime(candidate: u64) -> bool {
    if candidate < 2 {
        return false;
    }
    if candidate & 1 == 0 {
        return candidate == 2;
    }
    let mut i = 3u64;
    while i <= candidate / i {
        if candidate % i == 0 {
            return false;
        }
        i += 2;
    }
    true
}

pub fn count_primes_in_range(boundary: Boundary) -> u64 {
    if boundary.end < boundary.start {
        return 0;
    }
    (boundary.start..=boundary.end).filter(|n| is_prime(*n)).count() as u64
}

/// `parts` boundaries of width `max / parts`, built by advancing both ends
/// of a window from `[1, max / parts]`. The remainder of the division is not
/// covered, so the last `end` can fall short of `max`.
pub fn partition_range(max: u64, parts: u8) -> Vec<Boundary> {
    if parts == 0 {
        return Vec::new();
    }
    let range = max / u64::from(parts);
    let mut start = 1u64;
    let mut end = range;
    let mut out = Vec::with_capacity(parts as usize);
    for _ in 0..parts {
        out.push(Boundary { start, end });
        start += range;
        end += range;
    }
    out
}

/// Like [`partition_range`] but the last boundary ends at `max`, so the
/// boundaries cover `[1, max]` exactly once.
pub fn partition_range_clamped(max: u64, parts: u8) -> Vec<Boundary> {
    let mut out = partition_range(max, parts);
    if let Some(last) = out.last_mut() {
        last.end = max;
    }
    out
}

pub(crate) async fn calculate_primes_activity(boundary: Boundary) -> Result<u64, String> {
    info!(start = boundary.start, end = boundary.end, "seeking primes");
    let found = count_primes_in_range(boundary);
    info!(found, start = boundary.start, end = boundary.end, "primes found");
    Ok(found)
}

/// Partition `[1, max]`, count primes per boundary in parallel, and sum.
pub async fn primes(ctx: OrchestrationContext, input: PrimesInput) -> Result<u64, String> {
    if input.parallel == 0 {
        crate::durable_error!(ctx, max = input.max, "rejecting primes request with parallel = 0");
        return Err("parallel must be at least 1".to_string());
    }
    let remainder = input.max % u64::from(input.parallel);
    if remainder != 0 && !input.clamp_last {
        crate::durable_warn!(ctx, max = input.max, remainder, "top of the range is not covered by any boundary");
    }
    let boundaries = if input.clamp_last {
        partition_range_clamped(input.max, input.parallel)
    } else {
        partition_range(input.max, input.parallel)
    };
    let tasks = boundaries
        .iter()
        .map(|b| ctx.schedule_activity_typed(CALCULATE_PRIMES_ACTIVITY, b))
        .collect();
    let counts: Vec<u64> = ctx.join_typed(tasks).await?;
    let total: u64 = counts.iter().sum();
    ctx.trace_info(format!("READY: {total} primes found in the range 1 - {}", input.max));
    Ok(total)
}
