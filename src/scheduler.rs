use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::object::ObjRef;
use crate::time::secs;

/// A persisted request to re-invoke dispatch at a future time with a frozen
/// namespace snapshot. The snapshot only holds values the persistence
/// substrate could durably encode; everything else was dropped at freeze
/// time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub fire_at: DateTime<Utc>,
    pub obj: ObjRef,
    pub name: String,
    pub snapshot: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerState {
    pub next_id: u64,
    pub tasks: Vec<(u64, TaskRecord)>,
}

/// Owns task records and their armed deadlines. Timers are plain deadlines;
/// the engine pumps `take_due` from its serialized loop, so arming is always
/// non-blocking.
#[derive(Default)]
pub struct TaskScheduler {
    next_id: u64,
    tasks: HashMap<u64, TaskRecord>,
    armed: Vec<(DateTime<Utc>, u64)>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(
        &mut self,
        now: DateTime<Utc>,
        delay_secs: f64,
        obj: ObjRef,
        name: String,
        snapshot: HashMap<String, Value>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let fire_at = now + secs(delay_secs);
        self.tasks.insert(id, TaskRecord { fire_at, obj, name, snapshot });
        self.armed.push((fire_at, id));
        id
    }

    /// Pop semantics: a task id completes at most once. An early completion
    /// also disarms the deadline so it never surfaces as a stale firing.
    pub fn pop(&mut self, id: u64) -> Option<TaskRecord> {
        let record = self.tasks.remove(&id)?;
        self.armed.retain(|(_, armed_id)| *armed_id != id);
        Some(record)
    }

    /// Deadlines that have come due, in firing order.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<u64> {
        let mut due: Vec<(DateTime<Utc>, u64)> = Vec::new();
        self.armed.retain(|(at, id)| {
            if *at <= now {
                due.push((*at, *id));
                false
            } else {
                true
            }
        });
        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }

    /// Re-arm every persisted task exactly once after a restart. A task whose
    /// fire time has already passed is armed with zero remaining delay rather
    /// than dropped.
    pub fn rearm_all(&mut self, now: DateTime<Utc>) {
        self.armed.clear();
        for (id, record) in &self.tasks {
            let deadline = if record.fire_at <= now { now } else { record.fire_at };
            self.armed.push((deadline, *id));
        }
    }

    pub fn task(&self, id: u64) -> Option<&TaskRecord> {
        self.tasks.get(&id)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn armed_deadline(&self, id: u64) -> Option<DateTime<Utc>> {
        self.armed.iter().find(|(_, armed_id)| *armed_id == id).map(|(at, _)| *at)
    }

    pub fn to_state(&self) -> SchedulerState {
        SchedulerState {
            next_id: self.next_id,
            tasks: self.tasks.iter().map(|(id, record)| (*id, record.clone())).collect(),
        }
    }

    pub fn from_state(state: SchedulerState) -> Self {
        Self {
            next_id: state.next_id,
            tasks: state.tasks.into_iter().collect(),
            armed: Vec::new(),
        }
    }
}
