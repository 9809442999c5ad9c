#![forbid(unsafe_code)]

//! Batched update scheduler.
//!
//! # Design
//!
//! [`UpdateScheduler`] owns a FIFO of pending change requests and a
//! [`HandlerSet`]. Any number of requests enqueued before a flush runs are
//! applied by that single flush, which then runs at most one notification
//! fan-out:
//!
//! ```text
//!   enqueue ──► Idle? ──yes──► Pending ──(microtask / inline)──► Flushing
//!                 │                                                 │
//!                 no: queue grows,                    queue observed empty
//!                 upcoming flush drains it                          │
//!                                                                   ▼
//!                                   handlers, then afters ◄──────  Idle
//! ```
//!
//! A flush pops requests until the queue is empty, so requests enqueued by an
//! updater during the loop are applied in the same pass. The phase returns to
//! `Idle` as soon as the loop sees the empty queue, before any handler or
//! `after` callback runs; requests enqueued from those callbacks therefore
//! schedule a fresh flush.
//!
//! # Fan-out
//!
//! Handlers are iterated from a snapshot of the set. Before each call the
//! handler is looked up in the live set again, so a handler removed by an
//! earlier handler does not fire, and a handler added during the fan-out
//! waits for the next flush.
//!
//! # Invariants
//!
//! 1. Requests are applied in global enqueue order across all services.
//! 2. An empty or absent patch changes nothing, fires nothing, and drops its
//!    `after` callback.
//! 3. Handlers fire at most once per flush, and only for flushes that merged
//!    at least one patch.
//! 4. `after` callbacks run after all handlers, in enqueue order, with the
//!    state current at the end of the flush.
//! 5. Deferred and synchronous modes share one code path; only the point at
//!    which `flush` is invoked differs.
//!
//! # Failure Modes
//!
//! - **Panicking updater, handler, or `after`**: unwinds out of the flush.
//!   Merges already applied stay applied. Requests still queued are not run
//!   in this pass; the phase goes back to `Pending` and a follow-up flush is
//!   posted to the microtask queue (in synchronous mode too, so nothing
//!   re-enters while unwinding). Queued requests are always processed
//!   eventually.
//! - **Re-entrant read inside an updater**: an updater receives `&S` while
//!   the service state is borrowed. Reading the same service again is fine;
//!   mutating it directly is impossible by construction.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use web_time::Instant;

use crate::config::{FlushMode, SchedulerConfig};
use crate::handler::{Handler, HandlerSet};
use crate::microtask::MicrotaskQueue;
use crate::service::StatefulService;
use crate::state::{State, Updater};

/// Completion callback receiving the final state of its service.
pub type AfterFn<S> = Box<dyn FnOnce(&S)>;

/// Scheduler lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPhase {
    /// Queue empty, no flush scheduled.
    Idle,
    /// A flush is scheduled and has not started.
    Pending,
    /// A flush is draining the queue.
    Flushing,
}

/// Cumulative scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Flush passes started.
    pub flushes: u64,
    /// Requests whose patch was merged.
    pub applied: u64,
    /// Requests skipped as no-ops.
    pub skipped: u64,
    /// Handler invocations.
    pub notifications: u64,
    /// `after` invocations.
    pub afters: u64,
}

/// One queued state change for one service.
pub struct ChangeRequest<S: State> {
    service: StatefulService<S>,
    updater: Updater<S>,
    after: Option<AfterFn<S>>,
}

impl<S: State> ChangeRequest<S> {
    /// Request `updater` to be applied to `service`.
    #[must_use]
    pub fn new(service: StatefulService<S>, updater: Updater<S>) -> Self {
        Self {
            service,
            updater,
            after: None,
        }
    }

    /// Attach a completion callback.
    #[must_use]
    pub fn with_after(mut self, after: impl FnOnce(&S) + 'static) -> Self {
        self.after = Some(Box::new(after));
        self
    }
}

impl<S: State> std::fmt::Debug for ChangeRequest<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeRequest")
            .field("service", &std::any::type_name::<S>())
            .field("updater", &self.updater)
            .field("has_after", &self.after.is_some())
            .finish()
    }
}

enum Applied {
    Skipped,
    Changed(Option<Box<dyn FnOnce()>>),
}

/// Type-erased queue entry, so services with different state types share
/// one queue.
trait QueuedChange {
    fn apply(self: Box<Self>) -> Applied;
}

impl<S: State> QueuedChange for ChangeRequest<S> {
    fn apply(self: Box<Self>) -> Applied {
        let ChangeRequest {
            service,
            updater,
            after,
        } = *self;
        let Some(patch) = service.with(|current| updater.resolve(current)) else {
            return Applied::Skipped;
        };
        service.merge(patch);
        Applied::Changed(after.map(|after| -> Box<dyn FnOnce()> {
            Box::new(move || {
                // Snapshot so the callback may enqueue (and, in synchronous
                // mode, flush) without a live borrow on the state.
                let state = service.state();
                after(&state);
            })
        }))
    }
}

struct Shared {
    name: String,
    queue: RefCell<VecDeque<Box<dyn QueuedChange>>>,
    handlers: RefCell<HandlerSet>,
    phase: Cell<FlushPhase>,
    synchronous: Cell<bool>,
    stats: Cell<SchedulerStats>,
    microtasks: MicrotaskQueue,
}

/// Restores the phase if a flush unwinds mid-loop: `Idle` for an empty
/// queue, otherwise `Pending` with a follow-up flush posted.
struct PhaseReset<'a>(&'a Rc<Shared>);

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        let shared = self.0;
        if shared.phase.get() != FlushPhase::Flushing {
            return;
        }
        let stranded = shared.queue.try_borrow().map_or(0, |queue| queue.len());
        if stranded == 0 {
            shared.phase.set(FlushPhase::Idle);
            return;
        }
        tracing::warn!(
            scheduler = %shared.name,
            stranded,
            "flush unwound, rescheduling queued requests"
        );
        shared.phase.set(FlushPhase::Pending);
        shared.post_flush();
    }
}

impl Shared {
    fn bump(&self, f: impl FnOnce(&mut SchedulerStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    fn post_flush(self: &Rc<Self>) {
        let weak = Rc::downgrade(self);
        self.microtasks.post(move || {
            if let Some(shared) = weak.upgrade() {
                shared.flush();
            }
        });
    }

    fn flush(self: &Rc<Self>) {
        let _span = tracing::debug_span!("scheduler_flush", scheduler = %self.name).entered();
        let started = Instant::now();

        self.phase.set(FlushPhase::Flushing);
        let _reset = PhaseReset(self);
        self.bump(|s| s.flushes += 1);

        let mut applied = 0u64;
        let mut skipped = 0u64;
        let mut afters: Vec<Box<dyn FnOnce()>> = Vec::new();

        loop {
            let next = self.queue.borrow_mut().pop_front();
            let Some(change) = next else {
                self.phase.set(FlushPhase::Idle);
                break;
            };
            match change.apply() {
                Applied::Skipped => {
                    skipped += 1;
                    self.bump(|s| s.skipped += 1);
                }
                Applied::Changed(after) => {
                    applied += 1;
                    self.bump(|s| s.applied += 1);
                    afters.extend(after);
                }
            }
        }

        if applied == 0 {
            tracing::debug!(skipped, "flush produced no change");
            return;
        }

        let snapshot = self.handlers.borrow().snapshot();
        let mut notified = 0u64;
        for handler in &snapshot {
            let live = self.handlers.borrow().contains(handler);
            if live {
                handler.call();
                notified += 1;
                self.bump(|s| s.notifications += 1);
            }
        }

        let after_count = afters.len();
        for after in afters {
            after();
            self.bump(|s| s.afters += 1);
        }

        tracing::debug!(
            applied,
            skipped,
            notified,
            afters = after_count,
            elapsed_us = started.elapsed().as_micros() as u64,
            "flush complete"
        );
    }
}

/// Shared handle to a batched update scheduler.
///
/// Cloning yields another handle to the **same** scheduler.
#[derive(Clone)]
pub struct UpdateScheduler {
    shared: Rc<Shared>,
}

/// Non-owning handle to an [`UpdateScheduler`].
#[derive(Clone, Default)]
pub struct WeakScheduler {
    shared: Weak<Shared>,
}

impl WeakScheduler {
    /// A handle that never upgrades.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recover the scheduler if any strong handle is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<UpdateScheduler> {
        self.shared.upgrade().map(|shared| UpdateScheduler { shared })
    }
}

impl std::fmt::Debug for WeakScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakScheduler")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

impl Default for UpdateScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateScheduler {
    /// Deferred scheduler on the thread-local microtask queue.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Scheduler on the thread-local microtask queue.
    #[must_use]
    pub fn with_config(config: SchedulerConfig) -> Self {
        Self::with_queue(config, MicrotaskQueue::current())
    }

    /// Scheduler deferring its flushes onto `queue`.
    #[must_use]
    pub fn with_queue(config: SchedulerConfig, queue: MicrotaskQueue) -> Self {
        Self {
            shared: Rc::new(Shared {
                name: config.name,
                queue: RefCell::new(VecDeque::new()),
                handlers: RefCell::new(HandlerSet::new()),
                phase: Cell::new(FlushPhase::Idle),
                synchronous: Cell::new(config.mode == FlushMode::Synchronous),
                stats: Cell::new(SchedulerStats::default()),
                microtasks: queue,
            }),
        }
    }

    /// Append `request` to the queue, scheduling a flush if none is
    /// scheduled or running.
    pub fn enqueue_update<S: State>(&self, request: ChangeRequest<S>) {
        let pending = {
            let mut queue = self.shared.queue.borrow_mut();
            queue.push_back(Box::new(request));
            queue.len()
        };
        let phase = self.shared.phase.get();
        tracing::trace!(
            scheduler = %self.shared.name,
            pending,
            ?phase,
            "update enqueued"
        );
        if phase == FlushPhase::Idle {
            self.shared.phase.set(FlushPhase::Pending);
            self.schedule_flush();
        }
    }

    fn schedule_flush(&self) {
        if self.shared.synchronous.get() {
            self.shared.flush();
            return;
        }
        self.shared.post_flush();
    }

    /// Add `handler` to the handler set. Returns `false` if already present.
    pub fn subscribe(&self, handler: &Handler) -> bool {
        self.shared.handlers.borrow_mut().insert(handler.clone())
    }

    /// Remove `handler`. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, handler: &Handler) -> bool {
        self.shared.handlers.borrow_mut().remove(handler)
    }

    #[must_use]
    pub fn is_subscribed(&self, handler: &Handler) -> bool {
        self.shared.handlers.borrow().contains(handler)
    }

    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.shared.handlers.borrow().len()
    }

    #[must_use]
    pub fn phase(&self) -> FlushPhase {
        self.shared.phase.get()
    }

    /// Number of requests waiting to be applied.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.shared.queue.borrow().len()
    }

    #[must_use]
    pub fn is_synchronous(&self) -> bool {
        self.shared.synchronous.get()
    }

    /// Toggle inline flushing. Takes effect for the next scheduled flush; a
    /// flush already posted to the microtask queue still runs there.
    pub fn set_synchronous(&self, synchronous: bool) {
        self.shared.synchronous.set(synchronous);
    }

    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats.get()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The queue deferred flushes are posted to.
    #[must_use]
    pub fn microtasks(&self) -> &MicrotaskQueue {
        &self.shared.microtasks
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakScheduler {
        WeakScheduler {
            shared: Rc::downgrade(&self.shared),
        }
    }

    /// Whether two handles refer to the same scheduler.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }
}

impl std::fmt::Debug for UpdateScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateScheduler")
            .field("name", &self.shared.name)
            .field("phase", &self.shared.phase.get())
            .field("pending", &self.pending_len())
            .field("handlers", &self.handler_count())
            .field("synchronous", &self.shared.synchronous.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io;
    use std::sync::{Arc, Mutex};

    crate::reactive_state! {
        #[derive(Debug, Clone, PartialEq)]
        struct Sample => SamplePatch {
            test: String,
            test2: String,
        }
    }

    fn sample() -> Sample {
        Sample {
            test: "testing".into(),
            test2: "testing 2".into(),
        }
    }

    fn set_test(value: &str) -> SamplePatch {
        SamplePatch::default().test(value.into())
    }

    fn set_test2(value: &str) -> SamplePatch {
        SamplePatch::default().test2(value.into())
    }

    struct Fixture {
        scheduler: UpdateScheduler,
        queue: MicrotaskQueue,
        service: StatefulService<Sample>,
    }

    fn fixture() -> Fixture {
        let queue = MicrotaskQueue::new();
        let scheduler = UpdateScheduler::with_queue(SchedulerConfig::default(), queue.clone());
        let service = StatefulService::new(sample(), &scheduler);
        Fixture {
            scheduler,
            queue,
            service,
        }
    }

    fn counting_handler() -> (Handler, Rc<Cell<u32>>) {
        let calls = Rc::new(Cell::new(0));
        let c = Rc::clone(&calls);
        (Handler::new(move || c.set(c.get() + 1)), calls)
    }

    fn enqueue(f: &Fixture, updater: Updater<Sample>) {
        f.scheduler
            .enqueue_update(ChangeRequest::new(f.service.clone(), updater));
    }

    #[test]
    fn performs_an_object_state_change() {
        let f = fixture();
        enqueue(&f, Updater::patch(set_test("new-value")));
        assert_eq!(f.scheduler.phase(), FlushPhase::Pending);

        f.queue.run_until_idle();
        assert_eq!(
            f.service.state(),
            Sample {
                test: "new-value".into(),
                test2: "testing 2".into(),
            }
        );
        assert_eq!(f.scheduler.phase(), FlushPhase::Idle);
    }

    #[test]
    fn fires_all_connected_handlers_once() {
        let f = fixture();
        let (h1, c1) = counting_handler();
        let (h2, c2) = counting_handler();
        f.scheduler.subscribe(&h1);
        f.scheduler.subscribe(&h2);

        enqueue(&f, Updater::patch(set_test("new value")));
        f.queue.run_until_idle();

        assert_eq!(c1.get(), 1);
        assert_eq!(c2.get(), 1);
    }

    #[test]
    fn coalesces_rapid_updates_into_one_flush() {
        let f = fixture();
        let (h, calls) = counting_handler();
        f.scheduler.subscribe(&h);

        enqueue(&f, Updater::patch(set_test("new value")));
        enqueue(&f, Updater::patch(set_test2("changed value")));
        for i in 0..10 {
            enqueue(&f, Updater::patch(set_test(&format!("v{i}"))));
        }
        assert_eq!(f.queue.len(), 1, "exactly one flush scheduled");

        f.queue.run_until_idle();
        assert_eq!(f.service.state().test, "v9");
        assert_eq!(f.service.state().test2, "changed value");
        assert_eq!(calls.get(), 1);

        let stats = f.scheduler.stats();
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.applied, 12);
        assert_eq!(stats.notifications, 1);
    }

    #[test]
    fn updater_sees_changes_applied_earlier_in_the_batch() {
        let f = fixture();
        let seen = Rc::new(RefCell::new(None));

        enqueue(&f, Updater::patch(set_test2("changed value")));
        let s = Rc::clone(&seen);
        enqueue(
            &f,
            Updater::compute(move |prev: &Sample| {
                *s.borrow_mut() = Some(prev.clone());
                Some(set_test("new value"))
            }),
        );
        f.queue.run_until_idle();

        assert_eq!(
            seen.borrow().clone(),
            Some(Sample {
                test: "testing".into(),
                test2: "changed value".into(),
            })
        );
        assert_eq!(f.service.state().test, "new value");
    }

    #[test]
    fn after_receives_final_state_of_whole_flush() {
        let f = fixture();
        let seen = Rc::new(RefCell::new(None));
        let s = Rc::clone(&seen);
        f.scheduler.enqueue_update(
            ChangeRequest::new(f.service.clone(), Updater::patch(set_test("new value")))
                .with_after(move |state| *s.borrow_mut() = Some(state.clone())),
        );
        enqueue(&f, Updater::patch(set_test2("changed value")));
        f.queue.run_until_idle();

        assert_eq!(
            seen.borrow().clone(),
            Some(Sample {
                test: "new value".into(),
                test2: "changed value".into(),
            })
        );
    }

    #[test]
    fn afters_run_after_handlers_in_enqueue_order() {
        let f = fixture();
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = Rc::clone(&log);
        let handler = Handler::new(move || l.borrow_mut().push("handler"));
        f.scheduler.subscribe(&handler);

        for name in ["after1", "after2", "after3"] {
            let l = Rc::clone(&log);
            f.scheduler.enqueue_update(
                ChangeRequest::new(f.service.clone(), Updater::patch(set_test(name)))
                    .with_after(move |_| l.borrow_mut().push(name)),
            );
        }
        f.queue.run_until_idle();

        assert_eq!(
            *log.borrow(),
            vec!["handler", "after1", "after2", "after3"]
        );
    }

    #[test]
    fn noop_updaters_fire_nothing() {
        let f = fixture();
        let (h, calls) = counting_handler();
        f.scheduler.subscribe(&h);
        let afters = Rc::new(Cell::new(0));

        let updaters: Vec<Updater<Sample>> = vec![
            Updater::nothing(),
            Updater::compute(|_| None),
            Updater::patch(SamplePatch::default()),
            Updater::compute(|_| Some(SamplePatch::default())),
        ];
        for updater in updaters {
            let a = Rc::clone(&afters);
            f.scheduler.enqueue_update(
                ChangeRequest::new(f.service.clone(), updater)
                    .with_after(move |_| a.set(a.get() + 1)),
            );
        }
        f.queue.run_until_idle();

        assert_eq!(calls.get(), 0);
        assert_eq!(afters.get(), 0);
        assert_eq!(f.service.state(), sample());
        assert_eq!(f.scheduler.stats().skipped, 4);
    }

    #[test]
    fn skipped_request_drops_its_after_even_when_batch_changed() {
        let f = fixture();
        let (h, calls) = counting_handler();
        f.scheduler.subscribe(&h);
        let skipped_after = Rc::new(Cell::new(false));
        let applied_after = Rc::new(Cell::new(false));

        let s = Rc::clone(&skipped_after);
        f.scheduler.enqueue_update(
            ChangeRequest::new(f.service.clone(), Updater::compute(|_| None))
                .with_after(move |_| s.set(true)),
        );
        let a = Rc::clone(&applied_after);
        f.scheduler.enqueue_update(
            ChangeRequest::new(f.service.clone(), Updater::patch(set_test("x")))
                .with_after(move |_| a.set(true)),
        );
        f.queue.run_until_idle();

        assert_eq!(calls.get(), 1);
        assert!(!skipped_after.get());
        assert!(applied_after.get());
    }

    #[test]
    fn handler_unsubscribed_by_earlier_handler_does_not_fire() {
        let f = fixture();
        let (victim, victim_calls) = counting_handler();

        let scheduler = f.scheduler.clone();
        let target = victim.clone();
        let killer = Handler::new(move || {
            scheduler.unsubscribe(&target);
        });
        f.scheduler.subscribe(&killer);
        f.scheduler.subscribe(&victim);

        enqueue(&f, Updater::patch(set_test("x")));
        f.queue.run_until_idle();

        assert_eq!(victim_calls.get(), 0);
        assert!(!f.scheduler.is_subscribed(&victim));
    }

    #[test]
    fn handler_added_during_fan_out_waits_for_next_flush() {
        let f = fixture();
        let (late, late_calls) = counting_handler();

        let scheduler = f.scheduler.clone();
        let added = late.clone();
        let adder = Handler::new(move || {
            scheduler.subscribe(&added);
        });
        f.scheduler.subscribe(&adder);

        enqueue(&f, Updater::patch(set_test("x")));
        f.queue.run_until_idle();
        assert_eq!(late_calls.get(), 0);

        enqueue(&f, Updater::patch(set_test("y")));
        f.queue.run_until_idle();
        assert_eq!(late_calls.get(), 1);
    }

    #[test]
    fn rebinding_handler_fires_once() {
        let f = fixture();
        let calls = Rc::new(Cell::new(0));
        let handler_slot: Rc<RefCell<Option<Handler>>> = Rc::new(RefCell::new(None));

        let scheduler = f.scheduler.clone();
        let c = Rc::clone(&calls);
        let slot = Rc::clone(&handler_slot);
        let handler = Handler::new(move || {
            c.set(c.get() + 1);
            if let Some(me) = slot.borrow().as_ref() {
                scheduler.unsubscribe(me);
                scheduler.subscribe(me);
            }
        });
        *handler_slot.borrow_mut() = Some(handler.clone());
        let (other, other_calls) = counting_handler();
        f.scheduler.subscribe(&handler);
        f.scheduler.subscribe(&other);

        enqueue(&f, Updater::patch(set_test("x")));
        f.queue.run_until_idle();

        assert_eq!(calls.get(), 1);
        assert_eq!(other_calls.get(), 1);
        assert!(f.scheduler.is_subscribed(&handler));
        handler_slot.borrow_mut().take();
    }

    #[test]
    fn double_subscribe_fires_once() {
        let f = fixture();
        let (h, calls) = counting_handler();
        assert!(f.scheduler.subscribe(&h));
        assert!(!f.scheduler.subscribe(&h));
        assert_eq!(f.scheduler.handler_count(), 1);

        enqueue(&f, Updater::patch(set_test("x")));
        f.queue.run_until_idle();
        assert_eq!(calls.get(), 1);

        assert!(f.scheduler.unsubscribe(&h));
        assert!(!f.scheduler.unsubscribe(&h));
    }

    #[test]
    fn enqueue_from_updater_drains_in_same_pass() {
        let f = fixture();
        let (h, calls) = counting_handler();
        f.scheduler.subscribe(&h);

        let service = f.service.clone();
        enqueue(
            &f,
            Updater::compute(move |_| {
                service.set_state(set_test2("from updater")).unwrap();
                Some(set_test("outer"))
            }),
        );
        assert_eq!(f.queue.run_until_idle(), 1);

        assert_eq!(f.service.state().test, "outer");
        assert_eq!(f.service.state().test2, "from updater");
        assert_eq!(f.scheduler.stats().flushes, 1);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn enqueue_from_after_schedules_follow_up_flush() {
        let f = fixture();
        let service = f.service.clone();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        f.scheduler.enqueue_update(
            ChangeRequest::new(f.service.clone(), Updater::patch(set_test("x1"))).with_after(
                move |state| {
                    s.borrow_mut().push(state.test.clone());
                    service.set_state(set_test("x2")).unwrap();
                },
            ),
        );

        assert!(f.queue.run_next());
        assert_eq!(f.service.state().test, "x1");
        assert_eq!(*seen.borrow(), vec!["x1".to_string()]);
        assert_eq!(f.scheduler.phase(), FlushPhase::Pending);
        assert_eq!(f.scheduler.pending_len(), 1);

        assert!(f.queue.run_next());
        assert_eq!(f.service.state().test, "x2");
        assert_eq!(f.scheduler.stats().flushes, 2);
        assert_eq!(f.scheduler.phase(), FlushPhase::Idle);
    }

    #[test]
    fn enqueue_from_handler_schedules_follow_up_flush() {
        let f = fixture();
        let service = f.service.clone();
        let fired = Rc::new(Cell::new(0));
        let fi = Rc::clone(&fired);
        let handler = Handler::new(move || {
            fi.set(fi.get() + 1);
            if fi.get() == 1 {
                service.set_state(set_test2("from handler")).unwrap();
            }
        });
        f.scheduler.subscribe(&handler);

        enqueue(&f, Updater::patch(set_test("x")));
        assert_eq!(f.queue.run_until_idle(), 2);
        assert_eq!(fired.get(), 2);
        assert_eq!(f.service.state().test2, "from handler");
    }

    #[test]
    fn synchronous_mode_flushes_inline() {
        let queue = MicrotaskQueue::new();
        let scheduler =
            UpdateScheduler::with_queue(SchedulerConfig::new().synchronous(), queue.clone());
        let service = StatefulService::new(sample(), &scheduler);
        let (h, calls) = counting_handler();
        scheduler.subscribe(&h);

        service.set_state(set_test("inline")).unwrap();
        assert_eq!(service.state().test, "inline");
        assert_eq!(calls.get(), 1);
        assert!(queue.is_empty(), "nothing deferred");
        assert_eq!(scheduler.phase(), FlushPhase::Idle);
    }

    #[test]
    fn synchronous_after_enqueue_runs_nested_flush() {
        let scheduler = UpdateScheduler::with_queue(
            SchedulerConfig::new().synchronous(),
            MicrotaskQueue::new(),
        );
        let service = StatefulService::new(sample(), &scheduler);
        let inner = service.clone();
        service
            .set_state_then(set_test("x1"), move |_| {
                inner.set_state(set_test("x2")).unwrap();
            })
            .unwrap();
        assert_eq!(service.state().test, "x2");
        assert_eq!(scheduler.stats().flushes, 2);
    }

    #[test]
    fn toggling_synchronous_flag() {
        let f = fixture();
        assert!(!f.scheduler.is_synchronous());
        f.scheduler.set_synchronous(true);
        assert!(f.scheduler.is_synchronous());
        enqueue(&f, Updater::patch(set_test("now")));
        assert_eq!(f.service.state().test, "now");
    }

    #[test]
    fn panicking_updater_aborts_pass_and_recovers() {
        let f = fixture();
        enqueue(&f, Updater::patch(set_test("applied")));
        enqueue(&f, Updater::compute(|_| panic!("updater fault")));
        enqueue(&f, Updater::patch(set_test2("later")));

        let queue = f.queue.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| queue.run_next()));
        assert!(result.is_err());

        assert_eq!(f.service.state().test, "applied", "no rollback");
        assert_eq!(f.service.state().test2, "testing 2");
        assert_eq!(f.scheduler.phase(), FlushPhase::Pending);
        assert_eq!(f.scheduler.pending_len(), 1);
        assert_eq!(f.queue.len(), 1, "follow-up flush posted");

        f.queue.run_until_idle();
        assert_eq!(f.service.state().test2, "later");
        assert_eq!(f.scheduler.pending_len(), 0);
        assert_eq!(f.scheduler.phase(), FlushPhase::Idle);
    }

    #[test]
    fn synchronous_unwind_defers_remaining_requests() {
        let f = fixture();
        f.scheduler.set_synchronous(true);
        let service = f.service.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            // The first request triggers the inline flush; queue the rest
            // from inside it so they are pending when the fault hits.
            let inner = service.clone();
            service
                .update(move |_| {
                    inner.set_state(set_test2("stranded")).unwrap();
                    panic!("updater fault");
                })
                .unwrap();
        }));
        assert!(result.is_err());

        assert_eq!(f.service.state().test2, "testing 2");
        assert_eq!(f.scheduler.phase(), FlushPhase::Pending);
        assert_eq!(f.queue.len(), 1);

        f.queue.run_until_idle();
        assert_eq!(f.service.state().test2, "stranded");
        assert_eq!(f.scheduler.phase(), FlushPhase::Idle);
    }

    #[test]
    fn unwind_with_empty_queue_returns_to_idle() {
        let f = fixture();
        enqueue(&f, Updater::compute(|_| panic!("updater fault")));
        let queue = f.queue.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| queue.run_next()));
        assert!(result.is_err());
        assert_eq!(f.scheduler.phase(), FlushPhase::Idle);
        assert!(f.queue.is_empty());
    }

    #[test]
    fn dropped_scheduler_makes_pending_flush_noop() {
        let f = fixture();
        enqueue(&f, Updater::patch(set_test("never")));
        let Fixture {
            scheduler,
            queue,
            service,
        } = f;
        drop(scheduler);
        assert_eq!(queue.run_until_idle(), 1);
        assert_eq!(service.state().test, "testing");
    }

    #[test]
    fn global_order_across_services() {
        let queue = MicrotaskQueue::new();
        let scheduler = UpdateScheduler::with_queue(SchedulerConfig::default(), queue.clone());
        let a: StatefulService<BTreeMap<&'static str, i32>> =
            StatefulService::new(BTreeMap::new(), &scheduler);
        let b = StatefulService::new(sample(), &scheduler);
        let (h, calls) = counting_handler();
        scheduler.subscribe(&h);
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = Rc::clone(&log);
        a.update(move |_| {
            l.borrow_mut().push("a1");
            Some([("k", 1)].into_iter().collect())
        })
        .unwrap();
        let l = Rc::clone(&log);
        b.update(move |_| {
            l.borrow_mut().push("b1");
            Some(set_test("b"))
        })
        .unwrap();
        let l = Rc::clone(&log);
        a.update(move |prev| {
            l.borrow_mut().push("a2");
            Some([("k", prev[&"k"] + 1)].into_iter().collect())
        })
        .unwrap();

        queue.run_until_idle();
        assert_eq!(*log.borrow(), vec!["a1", "b1", "a2"]);
        assert_eq!(a.state()[&"k"], 2);
        assert_eq!(b.state().test, "b");
        assert_eq!(calls.get(), 1, "one fan-out for both services");
    }

    #[test]
    fn debug_format() {
        let f = fixture();
        let dbg = format!("{:?}", f.scheduler);
        assert!(dbg.contains("UpdateScheduler"));
        assert!(dbg.contains("Idle"));
        let weak = format!("{:?}", f.scheduler.downgrade());
        assert!(weak.contains("alive: true"));
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl io::Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn flush_emits_tracing_span() {
        let buf = SharedBuf::default();
        let writer = buf.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let queue = MicrotaskQueue::new();
            let scheduler = UpdateScheduler::with_queue(
                SchedulerConfig::new().named("traced"),
                queue.clone(),
            );
            let service = StatefulService::new(sample(), &scheduler);
            service.set_state(set_test("x")).unwrap();
            queue.run_until_idle();
        });

        let output = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("scheduler_flush"), "{output}");
        assert!(output.contains("traced"), "{output}");
        assert!(output.contains("flush complete"), "{output}");
    }
}
