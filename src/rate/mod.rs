//! Token-bucket rate limiting with hierarchical limits.
//!
//! Rate is distributed fairly between buckets, with any overflow
//! redistributed to buckets still having capacity:
//!
//! * Hierarchical: limits can be nested, the effective limit of a leaf is
//!   the lowest limit imposed by any of its parents.
//! * Fair: all buckets get an equal share of tokens, weighted by subtree
//!   size.
//! * No waste: excess tokens are distributed to buckets with spare
//!   capacity.
//! * Token distribution is O(n), adding and removing nodes is O(1).
//! * No unneeded wakeups during periods of idleness.
//! * Thread-safe.

mod layer;
mod limiter;

pub use self::layer::{CompoundRateLimitedLayer, RateLimitedLayer};
pub use self::limiter::{Bucket, BucketObserver, RateLimitManager, RateLimiter};

/// Token amounts and rates in octets (per second).
pub type Rate = u64;

/// Sentinel for "no limit".
pub const UNLIMITED: Rate = u64::MAX;

/// Transfer direction of rate-limited data.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Data received.
    Inbound = 0,
    /// Data sent.
    Outbound = 1,
}

pub(crate) const DIRECTIONS: [Direction; 2] = [Direction::Inbound, Direction::Outbound];
