//! # Kairos — Discrete-Event Simulation Kernel
//!
//! A virtual-time scheduler that runs many cooperatively-suspended
//! processes, arbitrates contention for capacity-limited resources with
//! priority queuing, preemption, reneging and interruption, and records
//! resource-usage telemetry. No async, no threads, no wall-clock time —
//! just resumable state machines driven by a virtual clock.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────┐
//! │        Simulation          │ ← scheduling loop + facade
//! │  ┌─────────────────────┐  │
//! │  │   IndexedMinHeap     │  │ ← event queue, O(log n) cancel
//! │  └─────────────────────┘  │
//! │  ┌─────────────────────┐  │
//! │  │   ResourceState      │  │ ← admission / release / sweep
//! │  └─────────────────────┘  │
//! │  ┌─────────────────────┐  │
//! │  │   Throttle           │  │ ← rolling rate limiter
//! │  └─────────────────────┘  │
//! │  ┌─────────────────────┐  │
//! │  │   VirtualTime        │  │ ← logical clock
//! │  └─────────────────────┘  │
//! └───────────────────────────┘
//! ```
//!
//! A process yields an [`Action`] each time it suspends; the kernel
//! reacts — advancing the clock, moving capacity around, cancelling
//! other processes' resumptions — and eventually resumes it with an
//! [`Outcome`]. Everything is single-threaded and deterministic given
//! the same inputs, apart from dispatch order among events at the exact
//! same virtual time, which is explicitly unspecified.

pub mod error;
pub mod event;
pub mod heap;
pub mod process;
pub mod report;
pub mod resource;
pub mod simulation;
pub mod throttle;
pub mod time;
pub mod variate;

// Re-exports for convenience.
pub use error::{KairosError, KairosResult};
pub use event::{Event, EventQueue, Outcome};
pub use heap::IndexedMinHeap;
pub use process::{Action, BoxProcess, Impatience, Process, ProcessId, Script};
pub use resource::{ResourceHandle, ResourceId, Ticket, UsageEntry};
pub use simulation::Simulation;
pub use throttle::{Throttle, ThrottleHandle, ThrottleId};
pub use time::VirtualTime;
pub use variate::DeterministicRng;
