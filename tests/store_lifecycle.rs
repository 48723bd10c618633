use std::cell::RefCell;
use std::rc::Rc;

use chrono::{TimeZone, Utc};
use merlin_events::channel::BufferChannel;
use merlin_events::engine::EventEngine;
use merlin_events::object::ObjRef;
use merlin_events::persist::MemoryStore;
use merlin_events::registry::EventTypeDecl;
use merlin_events::time::{FixedInterval, ManualClock};
use merlin_events::StoreError;

fn clock() -> ManualClock {
    ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap())
}

fn new_engine(clock: &ManualClock) -> EventEngine {
    let mut engine = EventEngine::new(
        Box::new(MemoryStore::new()),
        Box::new(BufferChannel::new()),
        Box::new(clock.clone()),
        Box::new(FixedInterval(60.0)),
    );
    engine.start().expect("engine start");
    engine
}

fn garden() -> ObjRef {
    ObjRef::new(7, "garden", "room")
}

#[test]
fn add_invalid_enqueues_then_accept_clears() {
    let clock = clock();
    let mut engine = new_engine(&clock);
    let obj = garden();

    let added = engine.add_event(&obj, "greet", "log(\"hello\");", Some("ann"), false, "");
    assert_eq!(added.index, 0);
    assert!(!added.fragment.valid);
    assert_eq!(engine.store().pending_validation().len(), 1);

    engine.accept_event(&obj, "greet", 0).expect("accept");
    let fragment = engine.store().fragment(&obj, "greet", 0).expect("fragment");
    assert!(fragment.valid);
    assert!(engine.store().pending_validation().is_empty());

    // Accepting again is idempotent.
    engine.accept_event(&obj, "greet", 0).expect("second accept");
}

#[test]
fn edit_toggles_validation_queue_membership() {
    let clock = clock();
    let mut engine = new_engine(&clock);
    let obj = garden();

    engine.add_event(&obj, "greet", "log(\"a\");", None, true, "");
    assert!(engine.store().pending_validation().is_empty());

    clock.advance_secs(5.0);
    let edited = engine.edit_event(&obj, "greet", 0, "log(\"b\");", Some("bob"), false).expect("edit");
    assert!(edited.fragment.updated.is_some());
    assert_eq!(engine.store().pending_validation().len(), 1);

    engine.edit_event(&obj, "greet", 0, "log(\"c\");", Some("bob"), true).expect("edit back");
    assert!(engine.store().pending_validation().is_empty());
}

#[test]
fn delete_renumbers_queue_locks_and_triggers() {
    let clock = clock();
    let mut engine = new_engine(&clock);
    let obj = garden();

    for step in 0..4 {
        engine.add_event(&obj, "greet", &format!("log(\"{step}\");"), None, false, "");
    }
    engine.lock_event(&obj, "greet", 2);
    let bound_low = engine.add_trigger(&obj, "greet", Some(1), None, 30.0);
    let bound_high = engine.add_trigger(&obj, "greet", Some(3), None, 30.0);

    engine.del_event(&obj, "greet", 1).expect("delete");

    let queued: Vec<usize> =
        engine.store().pending_validation().iter().map(|(_, _, index)| *index).collect();
    assert_eq!(queued, vec![0, 1, 2]);
    assert!(engine.store().is_locked(&obj, "greet", 1), "lock should follow the fragment");
    assert!(!engine.store().is_locked(&obj, "greet", 2));

    assert!(engine.trigger(bound_low).is_none(), "trigger bound to the deleted index stops");
    assert_eq!(engine.trigger(bound_high).expect("surviving trigger").index, Some(2));
}

#[test]
fn locked_fragment_rejects_edit_and_delete() {
    let clock = clock();
    let mut engine = new_engine(&clock);
    let obj = garden();

    engine.add_event(&obj, "greet", "log(\"a\");", None, true, "");
    engine.lock_event(&obj, "greet", 0);

    let edit = engine.edit_event(&obj, "greet", 0, "log(\"b\");", None, true);
    assert!(matches!(edit, Err(StoreError::LockedEvent { index: 0, .. })));
    let delete = engine.del_event(&obj, "greet", 0);
    assert!(matches!(delete, Err(StoreError::LockedEvent { index: 0, .. })));

    engine.unlock_event(&obj, "greet", 0);
    engine.del_event(&obj, "greet", 0).expect("delete after unlock");
}

#[test]
fn add_invalid_then_delete_removes_everywhere() {
    let clock = clock();
    let mut engine = new_engine(&clock);
    let obj = garden();

    engine.add_event(&obj, "greet", "log(\"a\");", None, false, "");
    engine.del_event(&obj, "greet", 0).expect("delete");

    assert!(engine.store().fragments(&obj, "greet").is_empty());
    assert!(engine.store().pending_validation().is_empty());
}

#[test]
fn on_add_hook_receives_index_and_parameters() {
    let clock = clock();
    let mut engine = new_engine(&clock);
    let obj = garden();

    let seen: Rc<RefCell<Vec<(usize, String)>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    engine.registry_mut().declare(
        "room",
        "greet",
        EventTypeDecl::new(&[], "").with_on_add(move |_obj, _name, index, parameters| {
            sink.borrow_mut().push((index, parameters.to_string()));
        }),
    );

    engine.add_event(&obj, "greet", "log(\"a\");", None, true, "morning");
    engine.add_event(&obj, "greet", "log(\"b\");", None, true, "evening");

    assert_eq!(
        *seen.borrow(),
        vec![(0, "morning".to_string()), (1, "evening".to_string())]
    );
}
