/// Rolling rate limiter.
///
/// A throttle with `slots` slots and gap `g` lets the first `slots`
/// callers through immediately (a burst), then spaces later callers so
/// that two uses of the same slot are never closer than `g` apart. Slot
/// reuse is round-robin, so sustained load settles into `slots` passes
/// per `g` units of virtual time.

use crate::process::Action;
use crate::time::VirtualTime;

// ── ThrottleId ────────────────────────────────────────────────────────

/// A unique identifier for a throttle within one simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ThrottleId(usize);

impl ThrottleId {
    #[inline]
    pub fn new(index: usize) -> Self {
        ThrottleId(index)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for ThrottleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "th{}", self.0)
    }
}

// ── Throttle ──────────────────────────────────────────────────────────

/// The throttle's state: a circular array of next-eligible timestamps.
#[derive(Debug, Clone)]
pub struct Throttle {
    /// Per-slot next-eligible times.
    slots: Vec<VirtualTime>,
    cursor: usize,
    /// Set once every slot has been used; before that, slots are free.
    warmed: bool,
    gap: f64,
}

impl Throttle {
    /// Create a throttle with a burst of `slots` and minimum per-slot
    /// reuse gap `gap`.
    pub fn new(slots: usize, gap: f64) -> Self {
        assert!(slots >= 1, "a throttle needs at least one slot");
        Throttle {
            slots: vec![VirtualTime::ZERO; slots],
            cursor: 0,
            warmed: false,
            gap,
        }
    }

    /// Claim the next slot and return how long the caller must wait
    /// from `now` before proceeding (0 while the burst lasts).
    pub fn next_wait(&mut self, now: VirtualTime) -> f64 {
        let slot = self.cursor;
        self.cursor = (slot + 1) % self.slots.len();
        let eligible = if self.warmed {
            now.max(self.slots[slot].plus(self.gap))
        } else {
            now
        };
        self.slots[slot] = eligible;
        if self.cursor == 0 {
            self.warmed = true;
        }
        eligible.duration_since(now)
    }
}

// ── ThrottleHandle ────────────────────────────────────────────────────

/// A cheap handle to a kernel-owned throttle.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleHandle {
    id: ThrottleId,
}

impl ThrottleHandle {
    pub(crate) fn new(id: ThrottleId) -> Self {
        ThrottleHandle { id }
    }

    /// The throttle's id.
    pub fn id(&self) -> ThrottleId {
        self.id
    }

    /// Build the action that gates the yielding process through this
    /// throttle.
    pub fn gate(&self) -> Action {
        Action::Throttle(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_spaced() {
        // Ten callers all arriving at T=0: 4 pass at 0, 4 at 2, 2 at 4.
        let mut th = Throttle::new(4, 2.0);
        let now = VirtualTime::ZERO;
        let waits: Vec<f64> = (0..10).map(|_| th.next_wait(now)).collect();
        assert_eq!(waits, vec![0.0, 0.0, 0.0, 0.0, 2.0, 2.0, 2.0, 2.0, 4.0, 4.0]);
    }

    #[test]
    fn test_single_slot_is_a_plain_gap() {
        let mut th = Throttle::new(1, 3.0);
        assert_eq!(th.next_wait(VirtualTime::ZERO), 0.0);
        assert_eq!(th.next_wait(VirtualTime::ZERO), 3.0);
        assert_eq!(th.next_wait(VirtualTime::ZERO), 6.0);
        // A caller arriving after the backlog clears passes immediately.
        assert_eq!(th.next_wait(VirtualTime::new(9.0)), 0.0);
    }

    #[test]
    fn test_spacing_respects_elapsed_time() {
        let mut th = Throttle::new(2, 5.0);
        assert_eq!(th.next_wait(VirtualTime::ZERO), 0.0);
        assert_eq!(th.next_wait(VirtualTime::ZERO), 0.0);
        // Slot 0 was used at T=0; at T=3 it is eligible again at T=5.
        assert_eq!(th.next_wait(VirtualTime::new(3.0)), 2.0);
        // Slot 1 was used at T=0; at T=6 the gap has already passed.
        assert_eq!(th.next_wait(VirtualTime::new(6.0)), 0.0);
    }

    #[test]
    fn test_handle_builds_the_action() {
        let handle = ThrottleHandle::new(ThrottleId::new(2));
        match handle.gate() {
            Action::Throttle(id) => assert_eq!(id, ThrottleId::new(2)),
            other => panic!("unexpected action: {:?}", other),
        }
    }
}
