use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result};
use rhai::Dynamic;
use serde::{Deserialize, Serialize};

use crate::scheduler::SchedulerState;
use crate::store::StoreState;
use crate::trigger::TriggerRecord;

/// Everything the engine persists: fragment lists, validation queue, lock
/// set, task counter and map, and the standing trigger bindings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistState {
    pub store: StoreState,
    pub scheduler: SchedulerState,
    pub triggers: Vec<TriggerRecord>,
    pub next_trigger_id: u64,
}

/// Durable storage boundary. `is_storable` is the predicate the scheduler
/// uses when freezing namespace snapshots; values that fail it are silently
/// dropped from the snapshot.
pub trait Persistence {
    fn load(&self) -> Result<Option<PersistState>>;
    fn save(&self, state: &PersistState) -> Result<()>;

    fn is_storable(&self, value: &Dynamic) -> bool {
        serde_json::to_value(value).is_ok()
    }
}

pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Persistence for JsonFileStore {
    fn load(&self) -> Result<Option<PersistState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let state = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(Some(state))
    }

    fn save(&self, state: &PersistState) -> Result<()> {
        let text = serde_json::to_string_pretty(state)?;
        fs::write(&self.path, text).with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }
}

/// In-memory substrate for tests. Clones share state, so a dropped engine's
/// writes stay visible to the next one, which is how restarts are simulated.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Rc<RefCell<Option<PersistState>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Option<PersistState> {
        self.state.borrow().clone()
    }
}

impl Persistence for MemoryStore {
    fn load(&self) -> Result<Option<PersistState>> {
        Ok(self.state.borrow().clone())
    }

    fn save(&self, state: &PersistState) -> Result<()> {
        *self.state.borrow_mut() = Some(state.clone());
        Ok(())
    }
}
