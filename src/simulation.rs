/// The scheduling kernel.
///
/// Owns the clock, the event queue, the process table and the resource
/// and throttle tables. Drives each process forward by resuming it with
/// an [`Outcome`] and interpreting the [`Action`] it yields next. All
/// shared state is touched exclusively from within this loop — the
/// simulation is single-threaded and cooperative, so interleaving is
/// purely time-ordered and no locking exists anywhere.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::error::{KairosError, KairosResult};
use crate::event::{event_queue, Event, EventQueue, Outcome};
use crate::process::{Action, BoxProcess, Impatience, Process, ProcessId};
use crate::resource::{Admission, ResourceHandle, ResourceId, ResourceState, UsageEntry};
use crate::throttle::{Throttle, ThrottleHandle, ThrottleId};
use crate::time::VirtualTime;

/// A reusable process constructor, as kept by an arrival driver.
type SpawnFactory = dyn Fn(ProcessId) -> BoxProcess;

/// What the kernel holds for one live process.
enum ProcessBody {
    /// An ordinary user process.
    User(BoxProcess),
    /// An arrival driver created by `generate`: waits out each delay of
    /// the sequence, spawning a fresh process after each one.
    Arrivals {
        delays: Box<dyn Iterator<Item = f64>>,
        factory: Rc<SpawnFactory>,
        /// False until the first delay has elapsed; nothing is spawned
        /// on the driver's first resumption.
        primed: bool,
    },
}

struct ProcessEntry {
    body: ProcessBody,
    /// Present only on impatience watchers.
    impatience: Option<Impatience>,
}

// ── Simulation ────────────────────────────────────────────────────────

/// A discrete-event simulation instance.
///
/// All state is owned here — no globals — so independent simulations
/// can coexist (e.g. one per scenario in a comparison run).
///
/// Events strictly earlier in virtual time are always processed first.
/// Among events at the identical time, order is determined by heap
/// mechanics and must not be relied upon.
pub struct Simulation {
    time: VirtualTime,
    queue: EventQueue,
    /// Suspended processes by id. A process is absent exactly while the
    /// kernel is resuming it, and permanently once it completes.
    table: BTreeMap<ProcessId, ProcessEntry>,
    next_process: u64,
    resources: Vec<ResourceState>,
    throttles: Vec<Throttle>,
    events_processed: u64,
}

impl Simulation {
    /// Create a simulation starting at time zero.
    pub fn new() -> Self {
        Simulation {
            time: VirtualTime::ZERO,
            queue: event_queue(),
            table: BTreeMap::new(),
            next_process: 0,
            resources: Vec::new(),
            throttles: Vec::new(),
            events_processed: 0,
        }
    }

    /// Current virtual time.
    pub fn time(&self) -> VirtualTime {
        self.time
    }

    /// Number of pending events.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Total events dispatched so far.
    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    // ── Spawning ──────────────────────────────────────────────────

    /// Spawn a process. The factory receives the assigned id; the
    /// process first resumes at `time + delay` with `Outcome::Ok`.
    pub fn spawn<P, F>(&mut self, factory: F, delay: f64) -> ProcessId
    where
        P: Process + 'static,
        F: FnOnce(ProcessId) -> P,
    {
        assert!(
            delay.is_finite() && delay >= 0.0,
            "spawn delay must be finite and non-negative, got {}",
            delay
        );
        let id = self.allocate();
        let body = Box::new(factory(id)) as BoxProcess;
        self.table.insert(
            id,
            ProcessEntry {
                body: ProcessBody::User(body),
                impatience: None,
            },
        );
        self.schedule(delay, id, Outcome::Ok);
        id
    }

    /// Spawn with a caller context: the factory receives the assigned
    /// id alongside `ctx`.
    pub fn spawn_with<C, P, F>(&mut self, factory: F, ctx: C, delay: f64) -> ProcessId
    where
        P: Process + 'static,
        F: FnOnce(ProcessId, C) -> P,
    {
        self.spawn(move |id| factory(id, ctx), delay)
    }

    /// Spawn an arrival driver: for each value of `delays` (lazy,
    /// possibly infinite), wait that long and then spawn a fresh
    /// process from `factory`. The driver is itself a process subject
    /// to ordinary scheduling. Returns the driver's id.
    pub fn generate<I, P, F>(&mut self, delays: I, factory: F) -> ProcessId
    where
        I: IntoIterator<Item = f64>,
        I::IntoIter: 'static,
        P: Process + 'static,
        F: Fn(ProcessId) -> P + 'static,
    {
        let factory: Rc<SpawnFactory> = Rc::new(move |id| Box::new(factory(id)) as BoxProcess);
        let id = self.allocate();
        self.table.insert(
            id,
            ProcessEntry {
                body: ProcessBody::Arrivals {
                    delays: Box::new(delays.into_iter()),
                    factory,
                    primed: false,
                },
                impatience: None,
            },
        );
        self.schedule(0.0, id, Outcome::Ok);
        id
    }

    /// `generate` with a caller context cloned into every spawned
    /// process.
    pub fn generate_with<I, C, P, F>(&mut self, delays: I, factory: F, ctx: C) -> ProcessId
    where
        I: IntoIterator<Item = f64>,
        I::IntoIter: 'static,
        C: Clone + 'static,
        P: Process + 'static,
        F: Fn(ProcessId, C) -> P + 'static,
    {
        self.generate(delays, move |id| factory(id, ctx.clone()))
    }

    // ── Resources & throttles ─────────────────────────────────────

    /// Create a resource. `strict` is forced for `capacity == 1`;
    /// `priority_levels` is the number of priority buckets (1 gives
    /// plain FIFO).
    pub fn resource(
        &mut self,
        name: &str,
        capacity: u32,
        strict: bool,
        priority_levels: usize,
    ) -> ResourceHandle {
        let id = ResourceId::new(self.resources.len());
        self.resources
            .push(ResourceState::new(id, name, capacity, strict, priority_levels));
        ResourceHandle::new(id, name.to_string())
    }

    /// Create a throttle with a burst of `slots` and per-slot reuse gap
    /// `gap`.
    pub fn throttle(&mut self, slots: usize, gap: f64) -> ThrottleHandle {
        let id = ThrottleId::new(self.throttles.len());
        self.throttles.push(Throttle::new(slots, gap));
        ThrottleHandle::new(id)
    }

    /// Look up a resource by exact name (the first match, if names
    /// collide).
    pub fn find(&self, name: &str) -> Option<ResourceHandle> {
        self.resources
            .iter()
            .find(|r| r.name() == name)
            .map(|r| ResourceHandle::new(r.index(), r.name().to_string()))
    }

    /// All resources whose name satisfies the predicate, in creation
    /// order.
    pub fn find_matching(&self, predicate: impl Fn(&str) -> bool) -> Vec<ResourceHandle> {
        self.resources
            .iter()
            .filter(|r| predicate(r.name()))
            .map(|r| ResourceHandle::new(r.index(), r.name().to_string()))
            .collect()
    }

    /// Grow a resource's capacity and reschedule every process the
    /// admission sweep lets through.
    pub fn add_capacity(&mut self, handle: &ResourceHandle, delta: u32) -> KairosResult<()> {
        let now = self.time;
        let resource = self
            .resources
            .get_mut(handle.id().index())
            .ok_or(KairosError::UnknownResource(handle.id()))?;
        let admitted = resource.add_capacity(delta, now);
        for process in admitted {
            self.schedule(0.0, process, Outcome::Ok);
        }
        Ok(())
    }

    /// Build the action that cancels `process`'s scheduled resumption.
    pub fn interrupt(&self, process: ProcessId) -> Action {
        Action::Interrupt(process)
    }

    // ── Telemetry ─────────────────────────────────────────────────

    /// All permanent usage-log entries, across every resource.
    pub fn logs(&self) -> Vec<UsageEntry> {
        self.resources
            .iter()
            .flat_map(|r| r.log().iter().cloned())
            .collect()
    }

    /// One resource's permanent usage log.
    pub fn resource_log(&self, handle: &ResourceHandle) -> &[UsageEntry] {
        self.resources
            .get(handle.id().index())
            .map(|r| r.log())
            .unwrap_or(&[])
    }

    /// The usage log as JSON.
    #[cfg(feature = "serialize")]
    pub fn logs_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.logs())
    }

    // ── The loop ──────────────────────────────────────────────────

    /// Run until the event queue is exhausted. On exit, every resource
    /// force-closes its still-open usage entries into the permanent
    /// log.
    pub fn run(&mut self) -> KairosResult<()> {
        self.run_inner(None)
    }

    /// Run until the queue is exhausted or the next event would land at
    /// or past `total_time`; in the latter case the clock is clamped to
    /// `total_time` and the event is not delivered. Processes mid-hold
    /// or mid-queue at the cutoff still produce usage records.
    pub fn run_until(&mut self, total_time: f64) -> KairosResult<()> {
        self.run_inner(Some(VirtualTime::new(total_time)))
    }

    /// Dispatch exactly one event. Returns its time, or `None` when the
    /// queue is empty. Unlike `run`, stepping never force-closes usage
    /// logs; use it to interleave kernel steps with facade calls such
    /// as `add_capacity`.
    pub fn step(&mut self) -> KairosResult<Option<VirtualTime>> {
        let Some(event) = self.queue.pop() else {
            return Ok(None);
        };
        let at = event.time;
        self.time = at;
        self.events_processed += 1;
        self.dispatch(event)?;
        Ok(Some(at))
    }

    fn run_inner(&mut self, bound: Option<VirtualTime>) -> KairosResult<()> {
        while let Some(event) = self.queue.pop() {
            if let Some(total) = bound {
                if event.time >= total {
                    self.time = total;
                    break;
                }
            }
            self.time = event.time;
            self.events_processed += 1;
            self.dispatch(event)?;
        }
        for resource in &mut self.resources {
            resource.complete_pending();
        }
        Ok(())
    }

    // ── Dispatch ──────────────────────────────────────────────────

    fn dispatch(&mut self, event: Event) -> KairosResult<()> {
        let pid = event.process;
        // Events only exist for processes in the table; a miss means
        // the process was dropped and the event is stale. Ignore.
        let Some(mut entry) = self.table.remove(&pid) else {
            return Ok(());
        };

        if matches!(entry.body, ProcessBody::Arrivals { .. }) {
            return self.advance_arrivals(pid, entry);
        }

        let ProcessBody::User(ref mut body) = entry.body else {
            unreachable!()
        };
        match body.resume(self.time, event.outcome) {
            Some(action) => self.apply(pid, entry, action),
            // The process completed; its entry is dropped here.
            None => Ok(()),
        }
    }

    /// One tick of an arrival driver: spawn the previous arrival (if
    /// any delay has already elapsed), then wait out the next delay.
    fn advance_arrivals(&mut self, pid: ProcessId, entry: ProcessEntry) -> KairosResult<()> {
        let ProcessBody::Arrivals {
            mut delays,
            factory,
            primed,
        } = entry.body
        else {
            unreachable!()
        };

        if primed {
            let id = self.allocate();
            let body = factory(id);
            self.table.insert(
                id,
                ProcessEntry {
                    body: ProcessBody::User(body),
                    impatience: None,
                },
            );
            self.schedule(0.0, id, Outcome::Ok);
        }

        match delays.next() {
            Some(d) if d.is_finite() && d >= 0.0 => {
                self.schedule(d, pid, Outcome::Ok);
                self.table.insert(
                    pid,
                    ProcessEntry {
                        body: ProcessBody::Arrivals {
                            delays,
                            factory,
                            primed: true,
                        },
                        impatience: None,
                    },
                );
                Ok(())
            }
            Some(d) => Err(KairosError::NegativeDelay(d)),
            // Sequence exhausted: the driver completes.
            None => Ok(()),
        }
    }

    fn apply(&mut self, pid: ProcessId, entry: ProcessEntry, action: Action) -> KairosResult<()> {
        match action {
            Action::Delay(d) => {
                if !d.is_finite() || d < 0.0 {
                    return Err(KairosError::NegativeDelay(d));
                }
                self.schedule(d, pid, Outcome::Ok);
                self.table.insert(pid, entry);
                Ok(())
            }

            Action::Throttle(tid) => {
                let now = self.time;
                let throttle = self
                    .throttles
                    .get_mut(tid.index())
                    .ok_or(KairosError::UnknownThrottle(tid))?;
                let wait = throttle.next_wait(now);
                let outcome = if wait == 0.0 {
                    Outcome::Ok
                } else {
                    Outcome::Throttled
                };
                self.schedule(wait, pid, outcome);
                self.table.insert(pid, entry);
                Ok(())
            }

            Action::Request {
                resource,
                capacity,
                priority,
                watcher,
            } => {
                if entry.impatience.is_some() {
                    return Err(KairosError::WatcherResourceAccess(pid));
                }
                let now = self.time;
                let state = self
                    .resources
                    .get_mut(resource.index())
                    .ok_or(KairosError::UnknownResource(resource))?;
                match state.request(pid, capacity, priority, now)? {
                    Admission::Granted => self.schedule(0.0, pid, Outcome::Ok),
                    Admission::Rejected => self.schedule(0.0, pid, Outcome::ExceedsCapacity),
                    Admission::Queued(ticket) => {
                        // The requester stays parked until admitted or
                        // cancelled; only the watcher gets scheduled.
                        if let Some(factory) = watcher {
                            let wid = self.allocate();
                            let body = factory(wid);
                            self.table.insert(
                                wid,
                                ProcessEntry {
                                    body: ProcessBody::User(body),
                                    impatience: Some(Impatience { ticket, resource }),
                                },
                            );
                            self.schedule(0.0, wid, Outcome::Ok);
                        }
                    }
                }
                self.table.insert(pid, entry);
                Ok(())
            }

            Action::Release { resource, capacity } => {
                if entry.impatience.is_some() {
                    return Err(KairosError::WatcherResourceAccess(pid));
                }
                let now = self.time;
                self.schedule(0.0, pid, Outcome::Ok);
                let state = self
                    .resources
                    .get_mut(resource.index())
                    .ok_or(KairosError::UnknownResource(resource))?;
                let admitted = state.release(pid, capacity, now)?;
                for waiter in admitted {
                    self.schedule(0.0, waiter, Outcome::Ok);
                }
                self.table.insert(pid, entry);
                Ok(())
            }

            Action::Desist => self.cancel_via_watcher(pid, entry, Outcome::Desisted),
            Action::Preempt => self.cancel_via_watcher(pid, entry, Outcome::Preempted),

            Action::Interrupt(target) => {
                let removed = self.queue.remove(target.raw());
                self.schedule(0.0, pid, Outcome::Ok);
                self.table.insert(pid, entry);
                if let Some(cancelled) = removed {
                    // An event that was due right now anyway keeps its
                    // original outcome; only a genuinely future event
                    // turns into an interruption.
                    let outcome = if cancelled.time == self.time {
                        cancelled.outcome
                    } else {
                        Outcome::Interrupted
                    };
                    self.schedule(0.0, target, outcome);
                }
                Ok(())
            }
        }
    }

    /// Shared tail of `Desist`/`Preempt`: cancel the bound ticket and,
    /// if a process was actually dequeued, resume it with `outcome`.
    /// The watcher itself is done either way and is never resumed.
    fn cancel_via_watcher(
        &mut self,
        pid: ProcessId,
        entry: ProcessEntry,
        outcome: Outcome,
    ) -> KairosResult<()> {
        let Some(binding) = entry.impatience else {
            return Err(KairosError::DesistOutsideWatcher(pid));
        };
        let now = self.time;
        let state = self
            .resources
            .get_mut(binding.resource.index())
            .ok_or(KairosError::UnknownResource(binding.resource))?;
        if let Some(cancelled) = state.cancel(binding.ticket, now) {
            self.schedule(0.0, cancelled, outcome);
        }
        Ok(())
    }

    fn allocate(&mut self) -> ProcessId {
        self.next_process += 1;
        ProcessId::new(self.next_process)
    }

    fn schedule(&mut self, delay: f64, process: ProcessId, outcome: Outcome) {
        self.queue
            .push(Event::new(self.time.plus(delay), process, outcome));
    }
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Script;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    /// Shorthand for the shared observation vectors the tests use.
    fn recorder<T>() -> (Rc<RefCell<Vec<T>>>, Rc<RefCell<Vec<T>>>) {
        let r = Rc::new(RefCell::new(Vec::new()));
        (Rc::clone(&r), r)
    }

    #[test]
    fn test_single_process_resumes_at_its_delay() {
        let mut sim = Simulation::new();
        let (times, sink) = recorder::<f64>();

        sim.spawn(
            move |_id| {
                let sink = Rc::clone(&sink);
                let mut step = 0;
                move |now: VirtualTime, _outcome: Outcome| -> Option<Action> {
                    step += 1;
                    sink.borrow_mut().push(now.value());
                    if step == 1 {
                        Some(Action::Delay(1.0))
                    } else {
                        None
                    }
                }
            },
            3.0,
        );

        sim.run().unwrap();
        assert_eq!(*times.borrow(), vec![3.0, 4.0]);
        assert_eq!(sim.time(), VirtualTime::new(4.0));
    }

    #[test]
    fn test_distinct_delays_resume_in_ascending_order() {
        let mut sim = Simulation::new();
        let (times, _) = recorder::<f64>();

        for start in [100.0, 10.0, 1.0] {
            let sink = Rc::clone(&times);
            sim.spawn(
                move |_id| {
                    move |now: VirtualTime, _outcome: Outcome| -> Option<Action> {
                        sink.borrow_mut().push(now.value());
                        None
                    }
                },
                start,
            );
        }

        sim.run().unwrap();
        assert_eq!(*times.borrow(), vec![1.0, 10.0, 100.0]);
    }

    #[test]
    fn test_interleaved_holds_advance_time_together() {
        // Two processes spawned at 0 and 1, each holding for 2 units:
        // observed timestamps are [0, 1, 2, 3].
        let mut sim = Simulation::new();
        let (times, _) = recorder::<f64>();

        for start in [0.0, 1.0] {
            let sink = Rc::clone(&times);
            sim.spawn(
                move |_id| {
                    let mut step = 0;
                    move |now: VirtualTime, _outcome: Outcome| -> Option<Action> {
                        step += 1;
                        sink.borrow_mut().push(now.value());
                        if step == 1 {
                            Some(Action::Delay(2.0))
                        } else {
                            None
                        }
                    }
                },
                start,
            );
        }

        sim.run().unwrap();
        assert_eq!(*times.borrow(), vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_same_time_events_are_a_set_not_a_sequence() {
        // Tie order among simultaneous events is explicitly not
        // guaranteed: assert the set of resumptions, nothing more.
        let mut sim = Simulation::new();
        let (seen, _) = recorder::<u64>();

        for _ in 0..5 {
            let sink = Rc::clone(&seen);
            sim.spawn(
                move |id| {
                    move |now: VirtualTime, _outcome: Outcome| -> Option<Action> {
                        assert_eq!(now.value(), 7.0);
                        sink.borrow_mut().push(id.raw());
                        None
                    }
                },
                7.0,
            );
        }

        sim.run().unwrap();
        let mut ids = seen.borrow().clone();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_resource_grant_release_cycle() {
        let mut sim = Simulation::new();
        let res = sim.resource("pool", 2, false, 1);
        let count = Rc::new(Cell::new(0));

        sim.spawn(
            {
                let res = res.clone();
                move |_id| Script::new(vec![res.request(2, 1), res.release(2)])
            },
            0.0,
        );
        for _ in 0..2 {
            let res = res.clone();
            let count = Rc::clone(&count);
            sim.spawn(
                move |_id| {
                    let mut step = 0;
                    move |_now: VirtualTime, outcome: Outcome| -> Option<Action> {
                        step += 1;
                        if step == 1 {
                            Some(res.request(1, 1))
                        } else {
                            assert_eq!(outcome, Outcome::Ok);
                            count.set(count.get() + 1);
                            None
                        }
                    }
                },
                0.0,
            );
        }

        sim.run().unwrap();
        // One release of 2 units admits both queued single-unit waiters.
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn test_exceeds_capacity_is_delivered_in_band() {
        let mut sim = Simulation::new();
        let res = sim.resource("pool", 2, false, 1);
        let (outcomes, _) = recorder::<Outcome>();

        let sink = Rc::clone(&outcomes);
        sim.spawn(
            move |_id| {
                let mut step = 0;
                move |_now: VirtualTime, outcome: Outcome| -> Option<Action> {
                    step += 1;
                    if step == 1 {
                        Some(res.request(5, 1))
                    } else {
                        sink.borrow_mut().push(outcome);
                        None
                    }
                }
            },
            0.0,
        );

        sim.run().unwrap();
        assert_eq!(*outcomes.borrow(), vec![Outcome::ExceedsCapacity]);
        // Rejected synchronously: no usage entry was ever opened.
        assert!(sim.logs().is_empty());
    }

    #[test]
    fn test_impatient_watcher_preempts_queued_request() {
        let mut sim = Simulation::new();
        let res = sim.resource("teller", 1, true, 1);
        let ran = Rc::new(Cell::new(false));

        let watcher = |_id: ProcessId| Script::new(vec![Action::Delay(10.0), Action::Preempt]);

        sim.spawn(
            {
                let res = res.clone();
                move |_id| {
                    let mut step = 0;
                    move |_now: VirtualTime, outcome: Outcome| -> Option<Action> {
                        step += 1;
                        match step {
                            1 => Some(res.request_impatient(watcher, 1, 1)),
                            2 => {
                                assert_eq!(outcome, Outcome::Ok);
                                Some(Action::Delay(100.0))
                            }
                            _ => None,
                        }
                    }
                }
            },
            0.0,
        );
        sim.spawn(
            {
                let res = res.clone();
                let ran = Rc::clone(&ran);
                move |_id| {
                    let mut step = 0;
                    move |now: VirtualTime, outcome: Outcome| -> Option<Action> {
                        step += 1;
                        if step == 1 {
                            Some(res.request_impatient(watcher, 1, 1))
                        } else {
                            assert_eq!(outcome, Outcome::Preempted);
                            assert_eq!(now.value(), 10.0);
                            ran.set(true);
                            None
                        }
                    }
                }
            },
            0.0,
        );

        sim.run().unwrap();
        assert!(ran.get());
    }

    #[test]
    fn test_impatience_advances_non_strict_queue() {
        // Capacity 4: a holder keeps 2; a 4-unit request queues with a
        // watcher that preempts at T=10; small 1-unit requests are
        // granted around the blocked head.
        let mut sim = Simulation::new();
        let res = sim.resource("pool", 4, false, 1);
        let count = Rc::new(Cell::new(0));

        sim.spawn(
            {
                let res = res.clone();
                move |_id| Script::new(vec![res.request(2, 1), Action::Delay(20.0)])
            },
            0.0,
        );
        sim.spawn(
            {
                let res = res.clone();
                let count = Rc::clone(&count);
                move |_id| {
                    let mut step = 0;
                    move |now: VirtualTime, outcome: Outcome| -> Option<Action> {
                        step += 1;
                        if step == 1 {
                            Some(res.request_impatient(
                                |_id| {
                                    Script::new(vec![Action::Delay(10.0), Action::Preempt])
                                },
                                4,
                                1,
                            ))
                        } else {
                            assert_eq!(outcome, Outcome::Preempted);
                            assert_eq!(now.value(), 10.0);
                            count.set(count.get() + 1);
                            None
                        }
                    }
                }
            },
            0.0,
        );
        sim.spawn(
            {
                let res = res.clone();
                move |_id| {
                    let mut step = 0;
                    move |_now: VirtualTime, _outcome: Outcome| -> Option<Action> {
                        step += 1;
                        if step == 1 {
                            Some(res.request(4, 1))
                        } else {
                            panic!("the 4-unit request should stay queued for the whole run");
                        }
                    }
                }
            },
            0.0,
        );
        for _ in 0..2 {
            let res = res.clone();
            let count = Rc::clone(&count);
            sim.spawn(
                move |_id| {
                    let mut step = 0;
                    move |_now: VirtualTime, outcome: Outcome| -> Option<Action> {
                        step += 1;
                        if step == 1 {
                            Some(res.request(1, 1))
                        } else {
                            assert_eq!(outcome, Outcome::Ok);
                            count.set(count.get() + 1);
                            None
                        }
                    }
                },
                0.0,
            );
        }

        sim.run().unwrap();
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn test_priority_buckets_admit_in_priority_order() {
        let mut sim = Simulation::new();
        let res = sim.resource("gate", 1, true, 3);
        let (order, _) = recorder::<usize>();

        // Holder occupies the single unit until T=5.
        sim.spawn(
            {
                let res = res.clone();
                move |_id| {
                    Script::new(vec![res.request(1, 1), Action::Delay(5.0), res.release(1)])
                }
            },
            0.0,
        );
        // Requesters arrive in priority order 3, 2, 1 — admission must
        // run 1, 2, 3 regardless.
        for priority in [3usize, 2, 1] {
            let res = res.clone();
            let sink = Rc::clone(&order);
            sim.spawn(
                move |_id| {
                    let mut step = 0;
                    move |_now: VirtualTime, _outcome: Outcome| -> Option<Action> {
                        step += 1;
                        match step {
                            1 => Some(res.request(1, priority)),
                            2 => {
                                sink.borrow_mut().push(priority);
                                Some(res.release(1))
                            }
                            _ => None,
                        }
                    }
                },
                0.0,
            );
        }

        sim.run().unwrap();
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn test_throttle_burst_then_spacing() {
        let mut sim = Simulation::new();
        let th = sim.throttle(4, 2.0);
        let (passes, _) = recorder::<(f64, Outcome)>();

        for _ in 0..10 {
            let sink = Rc::clone(&passes);
            sim.spawn(
                move |_id| {
                    let mut step = 0;
                    move |now: VirtualTime, outcome: Outcome| -> Option<Action> {
                        step += 1;
                        if step == 1 {
                            Some(th.gate())
                        } else {
                            sink.borrow_mut().push((now.value(), outcome));
                            None
                        }
                    }
                },
                0.0,
            );
        }

        sim.run().unwrap();
        let mut times: Vec<f64> = passes.borrow().iter().map(|&(t, _)| t).collect();
        times.sort_by(f64::total_cmp);
        assert_eq!(times, vec![0.0, 0.0, 0.0, 0.0, 2.0, 2.0, 2.0, 2.0, 4.0, 4.0]);
        // Burst passes are Ok; delayed passes are Throttled.
        let ok = passes.borrow().iter().filter(|&&(t, o)| o == Outcome::Ok && t == 0.0).count();
        let throttled = passes
            .borrow()
            .iter()
            .filter(|&&(_, o)| o == Outcome::Throttled)
            .count();
        assert_eq!(ok, 4);
        assert_eq!(throttled, 6);
    }

    #[test]
    fn test_interrupt_of_later_event_delivers_interrupted() {
        let mut sim = Simulation::new();
        let (seen, _) = recorder::<(f64, Outcome)>();

        let sink = Rc::clone(&seen);
        let target = sim.spawn(
            move |_id| {
                let mut step = 0;
                move |now: VirtualTime, outcome: Outcome| -> Option<Action> {
                    step += 1;
                    if step == 1 {
                        Some(Action::Delay(10.0))
                    } else {
                        sink.borrow_mut().push((now.value(), outcome));
                        None
                    }
                }
            },
            0.0,
        );
        sim.spawn(
            move |_id| {
                let mut step = 0;
                move |_now: VirtualTime, _outcome: Outcome| -> Option<Action> {
                    step += 1;
                    match step {
                        1 => Some(Action::Delay(5.0)),
                        2 => Some(Action::Interrupt(target)),
                        _ => None,
                    }
                }
            },
            0.0,
        );

        sim.run().unwrap();
        assert_eq!(*seen.borrow(), vec![(5.0, Outcome::Interrupted)]);
    }

    #[test]
    fn test_interrupt_at_due_time_preserves_original_outcome() {
        // The interrupter must act at the exact time the target's event
        // is due, which requires it to pop first among equals. This
        // test pins the current heap mechanics (spawn order decides);
        // tie order remains a non-guarantee of the public API.
        let mut sim = Simulation::new();
        let (seen, _) = recorder::<(f64, Outcome)>();
        let target_pid = Rc::new(Cell::new(0u64));

        let shared = Rc::clone(&target_pid);
        sim.spawn(
            move |_id| {
                let mut step = 0;
                let shared = Rc::clone(&shared);
                move |_now: VirtualTime, _outcome: Outcome| -> Option<Action> {
                    step += 1;
                    match step {
                        1 => Some(Action::Delay(5.0)),
                        2 => Some(Action::Interrupt(ProcessId::new(shared.get()))),
                        _ => None,
                    }
                }
            },
            0.0,
        );
        let sink = Rc::clone(&seen);
        let target = sim.spawn(
            move |_id| {
                let mut step = 0;
                move |now: VirtualTime, outcome: Outcome| -> Option<Action> {
                    step += 1;
                    if step == 1 {
                        Some(Action::Delay(5.0))
                    } else {
                        sink.borrow_mut().push((now.value(), outcome));
                        None
                    }
                }
            },
            0.0,
        );
        target_pid.set(target.raw());

        sim.run().unwrap();
        // Due "now" anyway: the original Ok survives, not Interrupted.
        assert_eq!(*seen.borrow(), vec![(5.0, Outcome::Ok)]);
    }

    #[test]
    fn test_interrupt_without_pending_event_is_a_noop_for_the_target() {
        let mut sim = Simulation::new();
        let continued = Rc::new(Cell::new(false));

        // Completes immediately; has no pending event afterwards.
        let target = sim.spawn(
            |_id| move |_now: VirtualTime, _outcome: Outcome| -> Option<Action> { None },
            0.0,
        );
        let flag = Rc::clone(&continued);
        sim.spawn(
            move |_id| {
                let mut step = 0;
                let flag = Rc::clone(&flag);
                move |now: VirtualTime, _outcome: Outcome| -> Option<Action> {
                    step += 1;
                    match step {
                        1 => Some(Action::Delay(5.0)),
                        2 => Some(Action::Interrupt(target)),
                        _ => {
                            // The interrupter itself still resumes.
                            assert_eq!(now.value(), 5.0);
                            flag.set(true);
                            None
                        }
                    }
                }
            },
            0.0,
        );

        sim.run().unwrap();
        assert!(continued.get());
    }

    #[test]
    fn test_run_until_clamps_time_and_closes_logs() {
        let mut sim = Simulation::new();
        let res = sim.resource("pool", 2, false, 1);

        // Holds 1 unit from T=0 and would release at T=10.
        sim.spawn(
            {
                let res = res.clone();
                move |_id| {
                    Script::new(vec![res.request(1, 1), Action::Delay(10.0), res.release(1)])
                }
            },
            0.0,
        );
        // Queued forever (needs 2, only 1 free).
        sim.spawn(
            {
                let res = res.clone();
                move |_id| Script::new(vec![res.request(2, 1)])
            },
            0.0,
        );

        sim.run_until(5.0).unwrap();
        assert_eq!(sim.time(), VirtualTime::new(5.0));

        // Both the holder and the still-queued request were force-closed.
        let logs = sim.logs();
        assert_eq!(logs.len(), 2);
        let holder = logs.iter().find(|e| e.capacity == 1).unwrap();
        assert!(holder.queue_exited_at.is_some());
        assert!(holder.released_at.is_none());
        let queued = logs.iter().find(|e| e.capacity == 2).unwrap();
        assert!(queued.queue_exited_at.is_none());
    }

    #[test]
    fn test_run_until_queue_drains_before_bound() {
        let mut sim = Simulation::new();
        sim.spawn(
            |_id| Script::new(vec![Action::Delay(1.0)]),
            0.0,
        );
        sim.run_until(100.0).unwrap();
        // The queue drained before the bound; the clock stays at the
        // last processed event.
        assert_eq!(sim.time(), VirtualTime::new(1.0));
        assert_eq!(sim.events_processed(), 2);
    }

    #[test]
    fn test_generate_spawns_after_each_delay() {
        let mut sim = Simulation::new();
        let (times, _) = recorder::<f64>();

        let sink = Rc::clone(&times);
        sim.generate(vec![1.0, 2.0, 3.0], move |_id| {
            let sink = Rc::clone(&sink);
            move |now: VirtualTime, _outcome: Outcome| -> Option<Action> {
                sink.borrow_mut().push(now.value());
                None
            }
        });

        sim.run().unwrap();
        assert_eq!(*times.borrow(), vec![1.0, 3.0, 6.0]);
    }

    #[test]
    fn test_generate_with_bounded_variate_sequence() {
        use crate::variate::stop_at;

        let mut sim = Simulation::new();
        let (times, _) = recorder::<f64>();

        let sink = Rc::clone(&times);
        sim.generate(
            stop_at(0.0, 5.0, std::iter::repeat(2.0)),
            move |_id| {
                let sink = Rc::clone(&sink);
                move |now: VirtualTime, _outcome: Outcome| -> Option<Action> {
                    sink.borrow_mut().push(now.value());
                    None
                }
            },
        );

        sim.run().unwrap();
        assert_eq!(*times.borrow(), vec![2.0, 4.0]);
    }

    #[test]
    fn test_spawn_with_merges_context_and_id() {
        #[derive(Clone)]
        struct Customer {
            label: &'static str,
        }

        let mut sim = Simulation::new();
        let (seen, _) = recorder::<(u64, &'static str)>();

        let sink = Rc::clone(&seen);
        sim.spawn_with(
            move |id, ctx: Customer| {
                let sink = Rc::clone(&sink);
                move |_now: VirtualTime, _outcome: Outcome| -> Option<Action> {
                    sink.borrow_mut().push((id.raw(), ctx.label));
                    None
                }
            },
            Customer { label: "alice" },
            0.0,
        );

        sim.run().unwrap();
        assert_eq!(*seen.borrow(), vec![(1, "alice")]);
    }

    #[test]
    fn test_find_and_find_matching() {
        let mut sim = Simulation::new();
        sim.resource("teller-1", 1, true, 1);
        sim.resource("teller-2", 1, true, 1);
        sim.resource("atm", 1, true, 1);

        assert_eq!(sim.find("atm").map(|h| h.name().to_string()), Some("atm".into()));
        assert!(sim.find("vault").is_none());

        let tellers = sim.find_matching(|name| name.starts_with("teller"));
        let names: Vec<&str> = tellers.iter().map(|h| h.name()).collect();
        assert_eq!(names, vec!["teller-1", "teller-2"]);
    }

    #[test]
    fn test_add_capacity_admits_between_steps() {
        let mut sim = Simulation::new();
        let res = sim.resource("pool", 2, false, 1);
        let admitted_at = Rc::new(Cell::new(-1.0));

        sim.spawn(
            {
                let res = res.clone();
                move |_id| {
                    Script::new(vec![res.request(2, 1), Action::Delay(100.0), res.release(2)])
                }
            },
            0.0,
        );
        let sink = Rc::clone(&admitted_at);
        sim.spawn(
            {
                let res = res.clone();
                move |_id| {
                    let mut step = 0;
                    move |now: VirtualTime, _outcome: Outcome| -> Option<Action> {
                        step += 1;
                        if step == 1 {
                            Some(res.request(1, 1))
                        } else {
                            sink.set(now.value());
                            None
                        }
                    }
                }
            },
            0.0,
        );

        // Drain the T=0 events: holder grabs everything, waiter queues.
        while let Some(at) = sim.step().unwrap() {
            if at.value() > 0.0 {
                break;
            }
            if sim.pending() == 1 {
                break;
            }
        }
        assert_eq!(admitted_at.get(), -1.0);

        sim.add_capacity(&res, 1).unwrap();
        sim.run().unwrap();
        assert_eq!(admitted_at.get(), 0.0);
    }

    #[test]
    fn test_every_usage_entry_logged_exactly_once() {
        let mut sim = Simulation::new();
        let res = sim.resource("pool", 2, false, 1);

        // p1 grants and releases; p2 queues and gets preempted; p3
        // queues and is still waiting at the cutoff; p4 holds at the
        // cutoff.
        sim.spawn(
            {
                let res = res.clone();
                move |_id| {
                    Script::new(vec![res.request(2, 1), Action::Delay(3.0), res.release(2)])
                }
            },
            0.0,
        );
        sim.spawn(
            {
                let res = res.clone();
                move |_id| {
                    let mut step = 0;
                    move |_now: VirtualTime, outcome: Outcome| -> Option<Action> {
                        step += 1;
                        if step == 1 {
                            Some(res.request_impatient(
                                |_id| Script::new(vec![Action::Delay(1.0), Action::Desist]),
                                2,
                                1,
                            ))
                        } else {
                            assert_eq!(outcome, Outcome::Desisted);
                            None
                        }
                    }
                }
            },
            0.0,
        );
        sim.spawn(
            {
                let res = res.clone();
                move |_id| Script::new(vec![res.request(2, 1), res.release(2)])
            },
            2.0,
        );
        sim.spawn(
            {
                let res = res.clone();
                move |_id| {
                    Script::new(vec![res.request(1, 1), Action::Delay(50.0), res.release(1)])
                }
            },
            3.5,
        );

        sim.run_until(10.0).unwrap();

        let logs = sim.logs();
        assert_eq!(logs.len(), 4);
        // Exactly one entry per process, in every lifecycle state.
        let mut pids: Vec<u64> = logs.iter().map(|e| e.process.raw()).collect();
        pids.sort_unstable();
        pids.dedup();
        assert_eq!(pids.len(), 4);
    }

    #[test]
    fn test_desist_outside_watcher_aborts_the_run() {
        let mut sim = Simulation::new();
        sim.spawn(|_id| Script::new(vec![Action::Desist]), 0.0);
        assert_eq!(
            sim.run(),
            Err(KairosError::DesistOutsideWatcher(ProcessId::new(1)))
        );
    }

    #[test]
    fn test_watcher_requesting_resources_aborts_the_run() {
        let mut sim = Simulation::new();
        let res = sim.resource("pool", 1, true, 1);

        sim.spawn(
            {
                let res = res.clone();
                move |_id| {
                    Script::new(vec![res.request(1, 1), Action::Delay(10.0), res.release(1)])
                }
            },
            0.0,
        );
        sim.spawn(
            {
                let res = res.clone();
                move |_id| {
                    let watcher_res = res.clone();
                    let mut step = 0;
                    move |_now: VirtualTime, _outcome: Outcome| -> Option<Action> {
                        step += 1;
                        if step == 1 {
                            let watcher_res = watcher_res.clone();
                            Some(res.request_impatient(
                                move |_id| Script::new(vec![watcher_res.request(1, 1)]),
                                1,
                                1,
                            ))
                        } else {
                            None
                        }
                    }
                }
            },
            0.0,
        );

        assert!(matches!(
            sim.run(),
            Err(KairosError::WatcherResourceAccess(_))
        ));
    }

    #[test]
    fn test_negative_delay_aborts_the_run() {
        let mut sim = Simulation::new();
        sim.spawn(|_id| Script::new(vec![Action::Delay(-1.0)]), 0.0);
        assert_eq!(sim.run(), Err(KairosError::NegativeDelay(-1.0)));
    }

    #[test]
    fn test_desist_after_admission_is_a_benign_race() {
        let mut sim = Simulation::new();
        let res = sim.resource("pool", 1, true, 1);
        let done = Rc::new(Cell::new(false));

        sim.spawn(
            {
                let res = res.clone();
                move |_id| {
                    Script::new(vec![res.request(1, 1), Action::Delay(2.0), res.release(1)])
                }
            },
            0.0,
        );
        let flag = Rc::clone(&done);
        sim.spawn(
            {
                let res = res.clone();
                move |_id| {
                    let mut step = 0;
                    let flag = Rc::clone(&flag);
                    move |_now: VirtualTime, outcome: Outcome| -> Option<Action> {
                        step += 1;
                        match step {
                            1 => Some(res.request_impatient(
                                // Fires at T=5, well after the T=2 admission.
                                |_id| Script::new(vec![Action::Delay(5.0), Action::Desist]),
                                1,
                                1,
                            )),
                            2 => {
                                assert_eq!(outcome, Outcome::Ok);
                                Some(res.release(1))
                            }
                            _ => {
                                flag.set(true);
                                None
                            }
                        }
                    }
                }
            },
            0.0,
        );

        sim.run().unwrap();
        assert!(done.get());
    }

    #[test]
    fn test_events_processed_counts_dispatches() {
        let mut sim = Simulation::new();
        sim.spawn(|_id| Script::new(vec![Action::Delay(1.0), Action::Delay(1.0)]), 0.0);
        sim.run().unwrap();
        // Three resumptions: spawn, after each delay.
        assert_eq!(sim.events_processed(), 3);
        assert_eq!(sim.pending(), 0);
    }
}
