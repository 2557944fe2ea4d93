/// Virtual time for the simulation kernel.
///
/// Represents a logical timestamp with no dependency on `std::time`.
/// Time advances only when the kernel processes events — never from
/// wall-clock observation. Delays produced by variate generators are
/// fractional, so the clock is an `f64` with a total ordering.

use std::cmp::Ordering;

/// A point in virtual time.
///
/// Ordering and equality go through `f64::total_cmp`, which makes the
/// type usable as a heap key. Timestamps produced by the kernel are
/// always finite; NaN never enters the clock because delays are
/// validated at dispatch.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct VirtualTime(f64);

impl VirtualTime {
    /// The zero-point of simulation time.
    pub const ZERO: VirtualTime = VirtualTime(0.0);

    /// Create a `VirtualTime` from a raw timestamp.
    #[inline]
    pub fn new(at: f64) -> Self {
        VirtualTime(at)
    }

    /// Return the raw timestamp.
    #[inline]
    pub fn value(self) -> f64 {
        self.0
    }

    /// The point in time `delay` after `self`.
    #[inline]
    pub fn plus(self, delay: f64) -> VirtualTime {
        VirtualTime(self.0 + delay)
    }

    /// Returns `true` if `self` is strictly before `other`.
    #[inline]
    pub fn is_before(self, other: VirtualTime) -> bool {
        self.cmp(&other) == Ordering::Less
    }

    /// The duration from `earlier` up to `self`.
    #[inline]
    pub fn duration_since(self, earlier: VirtualTime) -> f64 {
        self.0 - earlier.0
    }
}

impl PartialEq for VirtualTime {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for VirtualTime {}

impl PartialOrd for VirtualTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VirtualTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl std::fmt::Display for VirtualTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T={}", self.0)
    }
}
