//! Structured error types for the kairos kernel.
//!
//! Simulation outcomes — capacity rejections, cancelled requests,
//! interrupts, races that resolve to nothing — are delivered in-band as
//! [`Outcome`](crate::Outcome) values and are never errors. `KairosError`
//! covers the remaining category: protocol misuse, a caller bug that
//! leaves the simulation in a state the kernel refuses to guess about,
//! so `run` aborts instead of continuing.

use crate::process::ProcessId;
use crate::resource::ResourceId;
use crate::throttle::ThrottleId;

/// The top-level error type for the kairos simulation kernel.
#[derive(Debug, Clone, PartialEq)]
pub enum KairosError {
    // ── Impatience protocol ───────────────────────────────

    /// A process without an impatience binding yielded `Desist`/`Preempt`.
    DesistOutsideWatcher(ProcessId),

    /// An impatience watcher tried to request or release a resource.
    WatcherResourceAccess(ProcessId),

    // ── Resource protocol ─────────────────────────────────

    /// A process released a resource it holds no open usage entry for.
    ReleaseWithoutRequest {
        process: ProcessId,
        resource: ResourceId,
    },

    /// A request named a priority outside `1..=levels`.
    InvalidPriority {
        resource: ResourceId,
        priority: usize,
        levels: usize,
    },

    // ── Scheduling protocol ───────────────────────────────

    /// A process yielded a negative or non-finite delay; virtual time
    /// is monotone by contract.
    NegativeDelay(f64),

    /// An action referenced a resource unknown to this simulation
    /// (a handle from a different instance).
    UnknownResource(ResourceId),

    /// An action referenced a throttle unknown to this simulation.
    UnknownThrottle(ThrottleId),
}

impl std::fmt::Display for KairosError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KairosError::DesistOutsideWatcher(pid) => {
                write!(f, "process {} desisted without an impatience binding", pid)
            }
            KairosError::WatcherResourceAccess(pid) => write!(
                f,
                "impatience watcher {} may not request or release resources",
                pid
            ),
            KairosError::ReleaseWithoutRequest { process, resource } => write!(
                f,
                "process {} released resource {} without an open request",
                process, resource
            ),
            KairosError::InvalidPriority {
                resource,
                priority,
                levels,
            } => write!(
                f,
                "priority {} is outside 1..={} for resource {}",
                priority, levels, resource
            ),
            KairosError::NegativeDelay(d) => {
                write!(f, "cannot delay by {}: virtual time is monotone", d)
            }
            KairosError::UnknownResource(rid) => {
                write!(f, "resource {} does not belong to this simulation", rid)
            }
            KairosError::UnknownThrottle(tid) => {
                write!(f, "throttle {} does not belong to this simulation", tid)
            }
        }
    }
}

impl std::error::Error for KairosError {}

/// Convenience alias for `Result<T, KairosError>`.
pub type KairosResult<T> = Result<T, KairosError>;
