/// Events for the scheduling kernel.
///
/// An event is a scheduled resumption: at `time`, wake `process` and
/// hand it `outcome`. Events live in the identity-indexed heap so that
/// an interrupt can cancel a specific process's resumption in O(log n).

use std::cmp::Ordering;

use crate::heap::IndexedMinHeap;
use crate::process::ProcessId;
use crate::time::VirtualTime;

// ── Outcome ───────────────────────────────────────────────────────────

/// The resume result delivered to a process when its event fires.
///
/// Outcomes are the kernel's entire in-band signalling vocabulary:
/// capacity rejections, cancellations and interrupts all arrive here,
/// never as errors from `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum Outcome {
    /// The previous action completed normally.
    Ok,
    /// A request asked for more capacity than the resource can ever hold.
    ExceedsCapacity,
    /// The pending request was cancelled by a desisting watcher.
    Desisted,
    /// The pending request was cancelled by a preempting watcher.
    Preempted,
    /// The throttle imposed a non-zero wait before this resumption.
    Throttled,
    /// Another process cancelled this process's scheduled resumption.
    Interrupted,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Outcome::Ok => "Ok",
            Outcome::ExceedsCapacity => "ExceedsCapacity",
            Outcome::Desisted => "Desisted",
            Outcome::Preempted => "Preempted",
            Outcome::Throttled => "Throttled",
            Outcome::Interrupted => "Interrupted",
        };
        write!(f, "{}", name)
    }
}

// ── Event ─────────────────────────────────────────────────────────────

/// A scheduled resumption of one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// When the process resumes.
    pub time: VirtualTime,
    /// Which process resumes.
    pub process: ProcessId,
    /// What the process is told about why it resumed.
    pub outcome: Outcome,
}

impl Event {
    /// Convenience constructor.
    pub fn new(time: VirtualTime, process: ProcessId, outcome: Outcome) -> Self {
        Event {
            time,
            process,
            outcome,
        }
    }
}

// ── EventQueue ────────────────────────────────────────────────────────

/// The kernel's pending-event queue, keyed by process id.
///
/// Ordered by `time` only. Among events at the same virtual time the
/// dispatch order is whatever the heap's swap sequence produces —
/// callers must not rely on it. A process has at most one pending event
/// at any moment (one suspension point per yielded action), which is
/// what makes the process id a valid heap identity.
pub type EventQueue = IndexedMinHeap<Event>;

/// Create an empty event queue.
pub fn event_queue() -> EventQueue {
    IndexedMinHeap::new(compare_by_time, process_key)
}

fn compare_by_time(a: &Event, b: &Event) -> Ordering {
    a.time.cmp(&b.time)
}

fn process_key(e: &Event) -> u64 {
    e.process.raw()
}
