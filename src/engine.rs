use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::Result;
use rhai::Dynamic;
use tracing::{error, warn};

use crate::channel::ErrorChannel;
use crate::errors::StoreError;
use crate::object::ObjRef;
use crate::persist::{Persistence, PersistState};
use crate::registry::TypeRegistry;
use crate::scheduler::TaskScheduler;
use crate::scripts::{Namespace, Outcome, PendingQueue, ScheduleRequest, ScriptRuntime};
use crate::store::{EventStore, FragmentRef};
use crate::time::{secs, Clock, ClockMath};
use crate::trigger::{renumber_triggers, TriggerRecord, TriggerState};

/// Options for one dispatch call.
#[derive(Default)]
pub struct CallOpts<'a> {
    /// Only run the fragment whose stored index equals this.
    pub number: Option<usize>,
    /// Free-form parameters handed to the type's on-call hook.
    pub parameters: Option<&'a str>,
    /// Replacement namespace, used verbatim instead of binding arguments.
    pub namespace: Option<Namespace>,
}

/// The one live engine instance per process: event store, type registry,
/// dispatch, task scheduler and standing triggers behind a single serialized
/// entry point.
pub struct EventEngine {
    registry: TypeRegistry,
    store: EventStore,
    scheduler: TaskScheduler,
    runtime: ScriptRuntime,
    triggers: Vec<TriggerState>,
    next_trigger_id: u64,
    helper_paths: Vec<PathBuf>,
    // Call-scoped execution contexts; the top entry is the published one.
    context: Rc<RefCell<Vec<Namespace>>>,
    pending: PendingQueue,
    persistence: Box<dyn Persistence>,
    channel: Box<dyn ErrorChannel>,
    clock: Box<dyn Clock>,
    clock_math: Box<dyn ClockMath>,
    started: bool,
}

impl EventEngine {
    pub fn new(
        persistence: Box<dyn Persistence>,
        channel: Box<dyn ErrorChannel>,
        clock: Box<dyn Clock>,
        clock_math: Box<dyn ClockMath>,
    ) -> Self {
        let pending: PendingQueue = Rc::new(RefCell::new(Vec::new()));
        let runtime = ScriptRuntime::new(pending.clone());
        Self {
            registry: TypeRegistry::new(),
            store: EventStore::new(),
            scheduler: TaskScheduler::new(),
            runtime,
            triggers: Vec::new(),
            next_trigger_id: 0,
            helper_paths: Vec::new(),
            context: Rc::new(RefCell::new(Vec::new())),
            pending,
            persistence,
            channel,
            clock,
            clock_math,
            started: false,
        }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut TypeRegistry {
        &mut self.registry
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn set_base_var(&mut self, name: &str, value: Dynamic) {
        self.runtime.set_base_var(name, value);
    }

    pub fn add_helper_source(&mut self, path: impl Into<PathBuf>) {
        self.helper_paths.push(path.into());
    }

    /// Load persisted state, compile helper bundles, and re-arm every pending
    /// task exactly once with its freshly computed remaining delay. Until
    /// this runs, task completions are dropped.
    pub fn start(&mut self) -> Result<()> {
        if let Some(state) = self.persistence.load()? {
            self.store = EventStore::from_state(state.store);
            self.scheduler = TaskScheduler::from_state(state.scheduler);
            self.next_trigger_id = state.next_trigger_id;
            let now = self.clock.now();
            self.triggers = state
                .triggers
                .into_iter()
                .map(|record| {
                    let next_fire = now + secs(record.interval_secs);
                    TriggerState { record, usual: None, next_fire }
                })
                .collect();
        }
        let paths = self.helper_paths.clone();
        for path in &paths {
            self.runtime.load_helpers(path)?;
        }
        self.scheduler.rearm_all(self.clock.now());
        self.started = true;
        Ok(())
    }

    pub fn add_event(
        &mut self,
        obj: &ObjRef,
        name: &str,
        code: &str,
        author: Option<&str>,
        valid: bool,
        parameters: &str,
    ) -> FragmentRef {
        let now = self.clock.now();
        let fragment = self.store.add(obj, name, code, author, valid, parameters, now);
        let resolved = self.registry.resolve(&obj.type_id);
        if let Some(decl) = resolved.get(name) {
            if let Some(hook) = &decl.on_add {
                hook(obj, name, fragment.index, parameters);
            }
        }
        self.flush();
        fragment
    }

    pub fn edit_event(
        &mut self,
        obj: &ObjRef,
        name: &str,
        index: usize,
        code: &str,
        author: Option<&str>,
        valid: bool,
    ) -> Result<FragmentRef, StoreError> {
        let now = self.clock.now();
        let fragment = self.store.edit(obj, name, index, code, author, valid, now)?;
        self.flush();
        Ok(fragment)
    }

    pub fn del_event(&mut self, obj: &ObjRef, name: &str, index: usize) -> Result<(), StoreError> {
        self.store.delete(obj, name, index)?;
        renumber_triggers(&mut self.triggers, obj, name, index);
        self.flush();
        Ok(())
    }

    pub fn accept_event(
        &mut self,
        obj: &ObjRef,
        name: &str,
        index: usize,
    ) -> Result<(), StoreError> {
        self.store.accept(obj, name, index)?;
        self.flush();
        Ok(())
    }

    pub fn lock_event(&mut self, obj: &ObjRef, name: &str, index: usize) {
        self.store.lock(obj, name, index);
        self.flush();
    }

    pub fn unlock_event(&mut self, obj: &ObjRef, name: &str, index: usize) {
        self.store.unlock(obj, name, index);
        self.flush();
    }

    /// Dispatch every valid fragment of `(obj, name)` in list order. Returns
    /// true when the list ran to the end without an interrupt; faults are
    /// reported per fragment and never abort siblings.
    pub fn call_event(
        &mut self,
        obj: &ObjRef,
        name: &str,
        args: &[Dynamic],
        opts: CallOpts<'_>,
    ) -> bool {
        let resolved = self.registry.resolve(&obj.type_id);
        let decl = resolved.get(name).cloned();

        let ns = match (opts.namespace, decl.as_ref()) {
            (Some(ns), _) => ns,
            (None, None) => {
                error!(obj = %obj, event = name, type_id = %obj.type_id,
                    "no event type declaration found");
                return false;
            }
            (None, Some(decl)) => {
                let mut ns = self.runtime.base_namespace();
                let mut bound = true;
                for (position, param) in decl.params.iter().enumerate() {
                    match args.get(position) {
                        Some(value) => {
                            ns.insert(param.clone(), value.clone());
                        }
                        None => {
                            error!(obj = %obj, event = name, variable = %param, position,
                                "missing positional argument for event call");
                            bound = false;
                            break;
                        }
                    }
                }
                if !bound {
                    return false;
                }
                ns
            }
        };

        let mut fragments = self.store.fragments(obj, name);
        if let Some(decl) = &decl {
            if let Some(hook) = &decl.on_call {
                fragments = hook(fragments, opts.parameters);
            }
        }

        self.context.borrow_mut().push(ns);
        let mut completed = true;
        for frag in &fragments {
            if !frag.fragment.valid {
                continue;
            }
            if let Some(number) = opts.number {
                if frag.index != number {
                    continue;
                }
            }
            let outcome = {
                let mut stack = self.context.borrow_mut();
                match stack.last_mut() {
                    Some(ns) => self.runtime.execute(&frag.fragment.code, ns),
                    None => break,
                }
            };
            // Requests made by the fragment are armed even if it then
            // faulted or interrupted.
            self.drain_pending();
            match outcome {
                Outcome::Completed => {}
                Outcome::Interrupted => {
                    completed = false;
                    break;
                }
                Outcome::Fault { message, line, trace } => {
                    error!(obj = %obj, id = obj.id, event = name, index = frag.index, %trace,
                        "error during event execution");
                    self.report_fault(obj, name, frag, line, &message);
                }
            }
        }
        self.context.borrow_mut().pop();
        completed
    }

    /// Value of a variable in the currently published execution context, as
    /// of the last fragment that finished.
    pub fn get_variable(&self, name: &str) -> Option<Dynamic> {
        self.context.borrow().last().and_then(|ns| ns.get(name).cloned())
    }

    /// Freeze the published namespace and arm a persistent one-shot task.
    /// Values the substrate cannot durably encode are dropped from the
    /// snapshot; the loss is by design.
    pub fn schedule(&mut self, delay_secs: f64, obj: &ObjRef, name: &str) -> u64 {
        let snapshot = {
            let stack = self.context.borrow();
            match stack.last() {
                Some(ns) => freeze(ns, self.persistence.as_ref()),
                None => HashMap::new(),
            }
        };
        let id = self.scheduler.schedule(
            self.clock.now(),
            delay_secs,
            obj.clone(),
            name.to_string(),
            snapshot,
        );
        self.flush();
        id
    }

    /// Complete a one-shot task: pop its record and dispatch the stored event
    /// with the thawed snapshot as the namespace. A second completion for the
    /// same id finds nothing and is logged, not raised.
    pub fn complete_task(&mut self, task_id: u64) {
        if !self.started {
            error!(task_id, "event engine not started, dropping task");
            return;
        }
        let Some(record) = self.scheduler.pop(task_id) else {
            error!(task_id, "task was scheduled but cannot be found");
            return;
        };
        self.flush();
        let mut ns = Namespace::new();
        for (key, value) in &record.snapshot {
            if let Ok(thawed) = rhai::serde::to_dynamic(value.clone()) {
                ns.insert(key.clone(), thawed);
            }
        }
        self.call_event(
            &record.obj,
            &record.name,
            &[],
            CallOpts { namespace: Some(ns), ..CallOpts::default() },
        );
    }

    pub fn add_trigger(
        &mut self,
        obj: &ObjRef,
        name: &str,
        index: Option<usize>,
        time_format: Option<&str>,
        interval_secs: f64,
    ) -> u64 {
        let id = self.next_trigger_id;
        self.next_trigger_id += 1;
        let record = TriggerRecord {
            id,
            obj: obj.clone(),
            name: name.to_string(),
            index,
            time_format: time_format.map(str::to_string),
            interval_secs,
        };
        let next_fire = self.clock.now() + secs(interval_secs);
        self.triggers.push(TriggerState { record, usual: None, next_fire });
        self.flush();
        id
    }

    /// Remove the standing binding. An already-armed one-shot task timer is
    /// not cancelled; it completes as a follow-through.
    pub fn stop_trigger(&mut self, trigger_id: u64) {
        self.triggers.retain(|trigger| trigger.record.id != trigger_id);
        self.flush();
    }

    pub fn trigger(&self, trigger_id: u64) -> Option<&TriggerRecord> {
        self.triggers.iter().find(|trigger| trigger.record.id == trigger_id).map(|t| &t.record)
    }

    /// Pump due timers on the host's serialized loop: task completions first,
    /// then periodic trigger firings.
    pub fn tick(&mut self) {
        let now = self.clock.now();
        for task_id in self.scheduler.take_due(now) {
            self.complete_task(task_id);
        }
        let due: Vec<u64> = self
            .triggers
            .iter()
            .filter(|trigger| trigger.next_fire <= now)
            .map(|trigger| trigger.record.id)
            .collect();
        for trigger_id in due {
            self.fire_trigger(trigger_id);
        }
    }

    fn fire_trigger(&mut self, trigger_id: u64) {
        let now = self.clock.now();
        let mut target = None;
        if let Some(trigger) = self.triggers.iter_mut().find(|t| t.record.id == trigger_id) {
            let mut wait = trigger.record.interval_secs;
            if let Some(format) = trigger.record.time_format.clone() {
                let seconds = match trigger.usual {
                    Some(usual) => usual,
                    None => match self.clock_math.next_wait(&format, now) {
                        Ok(next) => {
                            trigger.usual = Some(next.average);
                            next.seconds
                        }
                        Err(err) => {
                            warn!(trigger_id, %err, "clock math failed, keeping current interval");
                            trigger.record.interval_secs
                        }
                    },
                };
                if (trigger.record.interval_secs - seconds).abs() > f64::EPSILON {
                    trigger.record.interval_secs = seconds;
                }
                wait = seconds;
            }
            trigger.next_fire = now + secs(wait);
            if let Some(index) = trigger.record.index {
                target = Some((trigger.record.obj.clone(), trigger.record.name.clone(), index));
            }
        }
        if let Some((obj, name, index)) = target {
            // The object may have lost event support since binding.
            if self.registry.resolve(&obj.type_id).contains_key(&name) {
                self.call_event(&obj, &name, &[], CallOpts { number: Some(index), ..CallOpts::default() });
            }
        }
        self.flush();
    }

    fn drain_pending(&mut self) {
        let requests: Vec<ScheduleRequest> = self.pending.borrow_mut().drain(..).collect();
        for request in requests {
            self.schedule(request.delay_secs, &request.obj, &request.name);
        }
    }

    fn report_fault(
        &self,
        obj: &ObjRef,
        name: &str,
        frag: &FragmentRef,
        line: Option<usize>,
        message: &str,
    ) {
        let lineno = line.map(|l| l.to_string()).unwrap_or_else(|| "unknown".to_string());
        let source_line = line
            .and_then(|l| frag.fragment.code.lines().nth(l.saturating_sub(1)))
            .unwrap_or("unknown");
        self.channel.msg(&format!(
            "Error in {} of {} (#{})[{}], line {}: {}\n{}",
            name,
            obj,
            obj.id,
            frag.index + 1,
            lineno,
            source_line,
            message
        ));
    }

    fn flush(&mut self) {
        let state = PersistState {
            store: self.store.to_state(),
            scheduler: self.scheduler.to_state(),
            triggers: self.triggers.iter().map(|trigger| trigger.record.clone()).collect(),
            next_trigger_id: self.next_trigger_id,
        };
        if let Err(err) = self.persistence.save(&state) {
            warn!(%err, "failed to persist event state");
        }
    }
}

fn freeze(ns: &Namespace, persistence: &dyn Persistence) -> HashMap<String, serde_json::Value> {
    let mut snapshot = HashMap::new();
    for (key, value) in ns {
        if !persistence.is_storable(value) {
            continue;
        }
        if let Ok(encoded) = serde_json::to_value(value) {
            snapshot.insert(key.clone(), encoded);
        }
    }
    snapshot
}
