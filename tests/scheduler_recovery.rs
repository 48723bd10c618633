use std::cell::RefCell;
use std::rc::Rc;

use chrono::{Duration, TimeZone, Utc};
use merlin_events::channel::BufferChannel;
use merlin_events::engine::EventEngine;
use merlin_events::object::ObjRef;
use merlin_events::persist::MemoryStore;
use merlin_events::registry::EventTypeDecl;
use merlin_events::time::{Clock, FixedInterval, ManualClock};
use serde_json::json;

fn clock() -> ManualClock {
    ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap())
}

fn engine_with(store: &MemoryStore, clock: &ManualClock) -> (EventEngine, Rc<RefCell<Vec<String>>>) {
    let channel = BufferChannel::new();
    let lines = channel.handle();
    let mut engine = EventEngine::new(
        Box::new(store.clone()),
        Box::new(channel),
        Box::new(clock.clone()),
        Box::new(FixedInterval(60.0)),
    );
    engine.start().expect("engine start");
    (engine, lines)
}

fn garden() -> ObjRef {
    ObjRef::new(7, "garden", "room")
}

#[test]
fn restart_after_deadline_rearms_with_zero_delay() {
    let store = MemoryStore::new();
    let clock = clock();
    let obj = garden();
    let (mut engine, _lines) = engine_with(&store, &clock);
    let id = engine.schedule(10.0, &obj, "ping");
    drop(engine);

    clock.advance_secs(15.0);
    let (mut engine, _lines) = engine_with(&store, &clock);
    assert_eq!(engine.scheduler().task_count(), 1, "the task survived the restart");
    let deadline = engine.scheduler().armed_deadline(id).expect("re-armed task");
    assert_eq!(deadline, clock.now(), "an overdue task fires with zero remaining delay");

    engine.tick();
    assert_eq!(engine.scheduler().task_count(), 0, "the overdue task fired on the first pump");
}

#[test]
fn restart_before_deadline_keeps_remaining_delay() {
    let store = MemoryStore::new();
    let clock = clock();
    let obj = garden();
    let (mut engine, _lines) = engine_with(&store, &clock);
    let id = engine.schedule(10.0, &obj, "ping");
    drop(engine);

    clock.advance_secs(3.0);
    let (mut engine, _lines) = engine_with(&store, &clock);
    let deadline = engine.scheduler().armed_deadline(id).expect("re-armed task");
    assert_eq!(deadline, clock.now() + Duration::seconds(7));

    // Not due yet.
    engine.tick();
    assert_eq!(engine.scheduler().task_count(), 1);
    clock.advance_secs(7.0);
    engine.tick();
    assert_eq!(engine.scheduler().task_count(), 0);
}

#[test]
fn double_completion_dispatches_exactly_once() {
    let store = MemoryStore::new();
    let clock = clock();
    let obj = garden();
    let (mut engine, lines) = engine_with(&store, &clock);
    // Each dispatch of "ping" produces exactly one channel line.
    engine.add_event(&obj, "ping", "boom();", None, true, "");
    let id = engine.schedule(5.0, &obj, "ping");

    engine.complete_task(id);
    assert_eq!(lines.borrow().len(), 1, "first completion dispatched the event");
    assert_eq!(engine.scheduler().task_count(), 0);

    engine.complete_task(id);
    assert_eq!(lines.borrow().len(), 1, "second completion found nothing to run");
}

#[test]
fn early_completion_disarms_the_pending_deadline() {
    let store = MemoryStore::new();
    let clock = clock();
    let obj = garden();
    let (mut engine, lines) = engine_with(&store, &clock);
    engine.add_event(&obj, "ping", "boom();", None, true, "");
    let id = engine.schedule(5.0, &obj, "ping");

    engine.complete_task(id);
    assert_eq!(lines.borrow().len(), 1);
    assert!(engine.scheduler().armed_deadline(id).is_none(), "the deadline went with the task");

    // The old deadline passing must not surface a stale firing.
    clock.advance_secs(5.0);
    engine.tick();
    assert_eq!(lines.borrow().len(), 1);
    assert_eq!(engine.scheduler().task_count(), 0);
}

#[test]
fn snapshot_drops_unstorable_values_and_restores_the_rest() {
    let store = MemoryStore::new();
    let clock = clock();
    let obj = garden();
    let (mut engine, lines) = engine_with(&store, &clock);
    engine.registry_mut().declare("room", "greet", EventTypeDecl::new(&["me"], ""));
    engine.add_event(&obj, "greet", "let count = 7;\ncall_in(me, \"later\", 5.0);", None, true, "");
    engine.add_event(&obj, "later", "if count == 7 { boom(); }", None, true, "");

    assert!(engine.call_event(&obj, "greet", &[rhai::Dynamic::from(obj.clone())], Default::default()));
    let task = engine.scheduler().task(0).expect("scheduled task");
    assert_eq!(task.snapshot.get("count"), Some(&json!(7)));
    assert!(task.snapshot.get("me").is_none(), "object handles cannot be durably encoded");

    clock.advance_secs(5.0);
    engine.tick();
    let lines = lines.borrow();
    assert_eq!(lines.len(), 1, "the restored snapshot drove the follow-up dispatch");
    assert!(lines[0].starts_with("Error in later of garden"), "got: {}", lines[0]);
}

#[test]
fn completion_before_start_is_dropped() {
    let store = MemoryStore::new();
    let clock = clock();
    let channel = BufferChannel::new();
    let mut engine = EventEngine::new(
        Box::new(store.clone()),
        Box::new(channel),
        Box::new(clock.clone()),
        Box::new(FixedInterval(60.0)),
    );

    // Never started: the completion is logged and dropped, not a panic.
    engine.complete_task(3);
    assert_eq!(engine.scheduler().task_count(), 0);
}
