#![no_main]

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use rsvc_runtime::{FlushPhase, Handler, MicrotaskQueue, SchedulerConfig, StatefulService, UpdateScheduler};

type Record = BTreeMap<u8, u8>;

#[derive(Arbitrary, Debug)]
enum FuzzOp {
    Patch(Vec<(u8, u8)>),
    Bump(u8),
    Noop,
    Subscribe(u8),
    Unsubscribe(u8),
    ToggleSync,
    RunNext,
    Drain,
    /// Enqueue from inside an `after` callback.
    Chain(u8, u8),
}

fuzz_target!(|ops: Vec<FuzzOp>| {
    let queue = MicrotaskQueue::new();
    let scheduler = UpdateScheduler::with_queue(SchedulerConfig::new(), queue.clone());
    let service = StatefulService::new(Record::new(), &scheduler);
    let hits = Rc::new(Cell::new(0u64));
    let handlers: Vec<Handler> = (0..4)
        .map(|_| {
            let h = Rc::clone(&hits);
            Handler::new(move || h.set(h.get() + 1))
        })
        .collect();

    for op in ops.into_iter().take(256) {
        match op {
            FuzzOp::Patch(pairs) => {
                let _ = service.set_state(pairs.into_iter().take(8).collect());
            }
            FuzzOp::Bump(key) => {
                let _ = service.update(move |s| {
                    let value = s.get(&key).copied().unwrap_or(0).wrapping_add(1);
                    Some(Record::from([(key, value)]))
                });
            }
            FuzzOp::Noop => {
                let _ = service.update(|_| None);
            }
            FuzzOp::Subscribe(i) => {
                scheduler.subscribe(&handlers[usize::from(i) % handlers.len()]);
            }
            FuzzOp::Unsubscribe(i) => {
                scheduler.unsubscribe(&handlers[usize::from(i) % handlers.len()]);
            }
            FuzzOp::ToggleSync => scheduler.set_synchronous(!scheduler.is_synchronous()),
            FuzzOp::RunNext => {
                queue.run_next();
            }
            FuzzOp::Drain => {
                queue.run_until_idle();
            }
            FuzzOp::Chain(key, value) => {
                let inner = service.clone();
                let _ = service.set_state_then(Record::from([(key, value)]), move |_| {
                    let _ = inner.set_state(Record::from([(key.wrapping_add(1), value)]));
                });
            }
        }
    }

    queue.run_until_idle();
    assert_eq!(scheduler.pending_len(), 0);
    assert_eq!(scheduler.phase(), FlushPhase::Idle);
    assert!(hits.get() <= scheduler.stats().flushes * handlers.len() as u64);
});
