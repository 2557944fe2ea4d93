/// Capacity-limited resources with priority queuing.
///
/// A resource is a named pool of capacity units. Requests that fit are
/// granted on the spot; the rest wait in per-priority FIFO queues until
/// a release or a capacity increase runs the admission sweep. Every
/// request's lifecycle — arrival, admission or cancellation, release —
/// is recorded as a usage-log entry.

use std::collections::{BTreeMap, VecDeque};

use crate::error::{KairosError, KairosResult};
use crate::process::{Action, BoxProcess, Process, ProcessId, WatcherFactory};
use crate::time::VirtualTime;

// ── ResourceId ────────────────────────────────────────────────────────

/// A unique identifier for a resource within one simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ResourceId(usize);

impl ResourceId {
    #[inline]
    pub fn new(index: usize) -> Self {
        ResourceId(index)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "R{}", self.0)
    }
}

// ── Ticket ────────────────────────────────────────────────────────────

/// A handle to a queued-but-ungranted request, used for cancellation.
///
/// Tickets are strictly increasing within a resource, so each priority
/// bucket stays sorted by ticket and cancellation can binary-search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Ticket(u64);

impl Ticket {
    #[inline]
    pub fn new(raw: u64) -> Self {
        Ticket(raw)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

// ── UsageEntry ────────────────────────────────────────────────────────

/// The lifecycle record of one resource request.
///
/// Opened at request time, stamped with queue-exit fields at admission
/// (or cancellation), stamped with release fields at release, and moved
/// to the permanent log exactly once — at cancellation, at release, or
/// force-closed when the simulation ends.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct UsageEntry {
    /// The requesting process.
    pub process: ProcessId,
    /// The resource requested.
    pub resource: ResourceId,
    /// Priority of the request (1 = highest).
    pub priority: usize,
    /// When the request arrived.
    pub requested_at: VirtualTime,
    /// Capacity units requested.
    pub capacity: u32,
    /// When the request left the queue (granted or cancelled); absent
    /// for requests still queued at simulation end.
    pub queue_exited_at: Option<VirtualTime>,
    /// Available capacity the instant before the grant; absent unless
    /// granted.
    pub available_before: Option<u32>,
    /// When the holder released; absent if never released.
    pub released_at: Option<VirtualTime>,
    /// Capacity units the holder claimed to release.
    pub released: Option<u32>,
}

// ── Admission ─────────────────────────────────────────────────────────

/// What the admission routine decided about a fresh request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Capacity was available; the requester holds it now.
    Granted,
    /// The request waits in a priority bucket under this ticket.
    Queued(Ticket),
    /// The request can never fit (`capacity > max_capacity`); no ticket
    /// was consumed and no usage entry was opened.
    Rejected,
}

// ── ResourceState ─────────────────────────────────────────────────────

/// The mutable state of one resource, owned by the kernel loop.
pub(crate) struct ResourceState {
    index: ResourceId,
    name: String,
    max_capacity: u32,
    strict: bool,
    available: u32,
    next_ticket: u64,
    /// One FIFO queue per priority bucket; bucket 0 is the highest
    /// priority. Sorted by ticket (enqueue order) at all times.
    queues: Vec<VecDeque<(Ticket, ProcessId)>>,
    /// Open usage entries, keyed by holder/requester.
    active: BTreeMap<ProcessId, UsageEntry>,
    /// The permanent usage log.
    log: Vec<UsageEntry>,
}

impl ResourceState {
    /// Create a resource. Strict admission is forced for single-unit
    /// resources, where head-of-line order and scan order coincide.
    pub(crate) fn new(
        index: ResourceId,
        name: impl Into<String>,
        capacity: u32,
        strict: bool,
        priority_levels: usize,
    ) -> Self {
        assert!(priority_levels >= 1, "a resource needs at least one priority level");
        ResourceState {
            index,
            name: name.into(),
            max_capacity: capacity,
            strict: capacity == 1 || strict,
            available: capacity,
            next_ticket: 0,
            queues: (0..priority_levels).map(|_| VecDeque::new()).collect(),
            active: BTreeMap::new(),
            log: Vec::new(),
        }
    }

    pub(crate) fn index(&self) -> ResourceId {
        self.index
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> u32 {
        self.available
    }

    #[cfg(test)]
    pub(crate) fn is_strict(&self) -> bool {
        self.strict
    }

    /// The permanent usage log (closed entries only).
    pub(crate) fn log(&self) -> &[UsageEntry] {
        &self.log
    }

    /// Admit or enqueue a request.
    pub(crate) fn request(
        &mut self,
        process: ProcessId,
        capacity: u32,
        priority: usize,
        now: VirtualTime,
    ) -> KairosResult<Admission> {
        if priority == 0 || priority > self.queues.len() {
            return Err(KairosError::InvalidPriority {
                resource: self.index,
                priority,
                levels: self.queues.len(),
            });
        }
        if capacity > self.max_capacity {
            return Ok(Admission::Rejected);
        }

        let mut entry = UsageEntry {
            process,
            resource: self.index,
            priority,
            requested_at: now,
            capacity,
            queue_exited_at: None,
            available_before: None,
            released_at: None,
            released: None,
        };

        let admission = if capacity <= self.available {
            entry.queue_exited_at = Some(now);
            entry.available_before = Some(self.available);
            self.available -= capacity;
            Admission::Granted
        } else {
            self.next_ticket += 1;
            let ticket = Ticket::new(self.next_ticket);
            self.queues[priority - 1].push_back((ticket, process));
            Admission::Queued(ticket)
        };

        // A process that requests again without releasing displaces its
        // open entry; archive it so every opened entry is logged once.
        if let Some(displaced) = self.active.insert(process, entry) {
            self.log.push(displaced);
        }
        Ok(admission)
    }

    /// Close the holder's usage entry, return capacity to the pool and
    /// run the admission sweep. Returns the newly admitted processes.
    ///
    /// The released amount is taken at face value: matching it against
    /// the original grant is the caller's responsibility.
    pub(crate) fn release(
        &mut self,
        process: ProcessId,
        capacity: u32,
        now: VirtualTime,
    ) -> KairosResult<Vec<ProcessId>> {
        let mut entry =
            self.active
                .remove(&process)
                .ok_or(KairosError::ReleaseWithoutRequest {
                    process,
                    resource: self.index,
                })?;
        entry.released_at = Some(now);
        entry.released = Some(capacity);
        self.log.push(entry);
        self.available += capacity;
        Ok(self.fitting_processes(now))
    }

    /// Grow the pool and run the admission sweep.
    pub(crate) fn add_capacity(&mut self, delta: u32, now: VirtualTime) -> Vec<ProcessId> {
        self.available += delta;
        self.fitting_processes(now)
    }

    /// Cancel a queued request by ticket.
    ///
    /// Returns the dequeued process, or `None` if the ticket is gone —
    /// already admitted or already cancelled. Callers treat `None` as a
    /// benign race, not an error.
    pub(crate) fn cancel(&mut self, ticket: Ticket, now: VirtualTime) -> Option<ProcessId> {
        for bucket in &mut self.queues {
            if let Ok(pos) = bucket.binary_search_by(|&(t, _)| t.cmp(&ticket)) {
                let (_, process) = bucket.remove(pos)?;
                let mut entry = self.active.remove(&process)?;
                entry.queue_exited_at = Some(now);
                self.log.push(entry);
                return Some(process);
            }
        }
        None
    }

    /// Force-close every still-open usage entry into the permanent log.
    /// Called once when the scheduling loop exits.
    pub(crate) fn complete_pending(&mut self) {
        let active = std::mem::take(&mut self.active);
        self.log.extend(active.into_values());
        for bucket in &mut self.queues {
            bucket.clear();
        }
    }

    /// The admission sweep: walk buckets from highest priority, admit
    /// whatever the policy allows with the remaining capacity.
    ///
    /// Strict policy examines only each bucket's head and stops at the
    /// first head that does not fit (head-of-line blocking). Relaxed
    /// policy scans the whole bucket, admitting any entry that fits in
    /// place and skipping the rest. Both continue into lower-priority
    /// buckets with whatever capacity remains.
    fn fitting_processes(&mut self, now: VirtualTime) -> Vec<ProcessId> {
        let mut admitted = Vec::new();
        for bucket in 0..self.queues.len() {
            if self.strict {
                while let Some(&(_, process)) = self.queues[bucket].front() {
                    if !self.try_admit(process, now) {
                        break;
                    }
                    self.queues[bucket].pop_front();
                    admitted.push(process);
                }
            } else {
                let mut i = 0;
                while i < self.queues[bucket].len() {
                    let process = self.queues[bucket][i].1;
                    if self.try_admit(process, now) {
                        self.queues[bucket].remove(i);
                        admitted.push(process);
                        // The next entry shifted into slot i; rescan it.
                    } else {
                        i += 1;
                    }
                }
            }
        }
        admitted
    }

    fn try_admit(&mut self, process: ProcessId, now: VirtualTime) -> bool {
        let entry = self
            .active
            .get_mut(&process)
            .expect("queued process has an open usage entry");
        if entry.capacity <= self.available {
            entry.queue_exited_at = Some(now);
            entry.available_before = Some(self.available);
            self.available -= entry.capacity;
            true
        } else {
            false
        }
    }
}

// ── ResourceHandle ────────────────────────────────────────────────────

/// A cheap, cloneable handle to a resource.
///
/// Handles only *build actions*; all state lives in the kernel. A
/// handle from one simulation is meaningless in another (the kernel
/// rejects unknown ids).
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    id: ResourceId,
    name: String,
}

impl ResourceHandle {
    pub(crate) fn new(id: ResourceId, name: String) -> Self {
        ResourceHandle { id, name }
    }

    /// The resource's id.
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// The resource's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask for `capacity` units at `priority` (1 = highest).
    pub fn request(&self, capacity: u32, priority: usize) -> Action {
        Action::Request {
            resource: self.id,
            capacity,
            priority,
            watcher: None,
        }
    }

    /// Like [`request`](Self::request), but if the request has to queue,
    /// spawn `watcher` bound to the queued ticket so it can later desist
    /// or preempt.
    pub fn request_impatient<P, F>(&self, watcher: F, capacity: u32, priority: usize) -> Action
    where
        P: Process + 'static,
        F: FnOnce(ProcessId) -> P + 'static,
    {
        let factory: WatcherFactory = Box::new(move |id| Box::new(watcher(id)) as BoxProcess);
        Action::Request {
            resource: self.id,
            capacity,
            priority,
            watcher: Some(factory),
        }
    }

    /// Return `capacity` units to the resource.
    pub fn release(&self, capacity: u32) -> Action {
        Action::Release {
            resource: self.id,
            capacity,
        }
    }
}
