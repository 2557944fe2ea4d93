/// Cooperative processes and the actions they yield.
///
/// A process is a resumable state machine: the kernel resumes it with
/// the current time and an [`Outcome`], and the process either yields
/// its next [`Action`] and re-suspends, or finishes. Processes own
/// nothing about scheduling — when and why they resume is entirely the
/// kernel's business.

use crate::event::Outcome;
use crate::resource::{ResourceId, Ticket};
use crate::throttle::ThrottleId;
use crate::time::VirtualTime;

// ── ProcessId ─────────────────────────────────────────────────────────

/// A unique identifier for a simulated process.
///
/// Assigned monotonically by the kernel, starting at 1. Doubles as the
/// event queue's heap identity: a process has at most one pending event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ProcessId(u64);

impl ProcessId {
    #[inline]
    pub fn new(id: u64) -> Self {
        ProcessId(id)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.0)
    }
}

// ── Process trait ─────────────────────────────────────────────────────

/// A boxed process, as stored by the kernel.
pub type BoxProcess = Box<dyn Process>;

/// A factory that builds a watcher process from its assigned id.
pub type WatcherFactory = Box<dyn FnOnce(ProcessId) -> BoxProcess>;

/// Trait implemented by every simulated process.
///
/// `resume` is called exactly once per scheduled event. Returning
/// `Some(action)` re-suspends the process at that action; returning
/// `None` completes it, after which the kernel drops it.
///
/// # Contract
/// - Implementations must not use wall-clock time or global mutable
///   state; `now` is the only clock.
/// - All interaction with resources, throttles and other processes goes
///   through the yielded `Action`.
pub trait Process {
    /// Advance to the next suspension point.
    fn resume(&mut self, now: VirtualTime, outcome: Outcome) -> Option<Action>;
}

/// A process backed by a closure — the lightweight way to write small
/// state machines in tests and scenarios (keep a step counter in the
/// captured state).
impl<F> Process for F
where
    F: FnMut(VirtualTime, Outcome) -> Option<Action>,
{
    fn resume(&mut self, now: VirtualTime, outcome: Outcome) -> Option<Action> {
        (self)(now, outcome)
    }
}

// ── Action ────────────────────────────────────────────────────────────

/// The single value a process yields when it suspends.
///
/// A closed sum type: the kernel's dispatch is an exhaustive match, so
/// every case is statically guaranteed to be handled.
pub enum Action {
    /// Resume after this many units of virtual time.
    Delay(f64),

    /// Ask a resource for `capacity` units at `priority` (1 = highest).
    /// If the request cannot be satisfied immediately and `watcher` is
    /// present, the kernel spawns it bound to the queued ticket.
    Request {
        resource: ResourceId,
        capacity: u32,
        priority: usize,
        watcher: Option<WatcherFactory>,
    },

    /// Return `capacity` units to a resource. The amount is the
    /// caller's claim; the kernel does not cross-check it against the
    /// original grant.
    Release { resource: ResourceId, capacity: u32 },

    /// Cancel the pending request tied to this watcher's impatience
    /// binding; the cancelled process resumes with `Desisted`.
    Desist,

    /// Like `Desist`, but the cancelled process resumes with
    /// `Preempted`.
    Preempt,

    /// Cancel another process's scheduled resumption and force it to
    /// resume now.
    Interrupt(ProcessId),

    /// Gate through a rate limiter.
    Throttle(ThrottleId),
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Delay(d) => write!(f, "Delay({})", d),
            Action::Request {
                resource,
                capacity,
                priority,
                watcher,
            } => write!(
                f,
                "Request({}, cap={}, prio={}{})",
                resource,
                capacity,
                priority,
                if watcher.is_some() { ", impatient" } else { "" }
            ),
            Action::Release { resource, capacity } => {
                write!(f, "Release({}, cap={})", resource, capacity)
            }
            Action::Desist => write!(f, "Desist"),
            Action::Preempt => write!(f, "Preempt"),
            Action::Interrupt(pid) => write!(f, "Interrupt({})", pid),
            Action::Throttle(tid) => write!(f, "Throttle({})", tid),
        }
    }
}

// ── Impatience ────────────────────────────────────────────────────────

/// The binding between a watcher process and the queued request it
/// monitors. Only processes carrying this binding may desist/preempt,
/// and they may never request or release resources themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Impatience {
    /// The queued request's cancellation handle.
    pub ticket: Ticket,
    /// The resource the request is queued on.
    pub resource: ResourceId,
}

// ── Script ────────────────────────────────────────────────────────────

/// A process that replays a fixed list of actions, ignoring outcomes.
///
/// The interpreter-over-an-instruction-list encoding of a coroutine:
/// enough for straight-line scenarios (hold, wait, release) without
/// writing a state machine by hand.
pub struct Script {
    actions: std::collections::VecDeque<Action>,
}

impl Script {
    /// Create a script that yields `actions` in order, then completes.
    pub fn new(actions: Vec<Action>) -> Self {
        Script {
            actions: actions.into(),
        }
    }
}

impl Process for Script {
    fn resume(&mut self, _now: VirtualTime, _outcome: Outcome) -> Option<Action> {
        self.actions.pop_front()
    }
}
