use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::StoreError;
use crate::object::ObjRef;

/// One stored script body attached to an object under an event name. Its
/// index is its position in the `(object, name)` list, always dense `0..len`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFragment {
    pub code: String,
    pub parameters: String,
    pub author: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: Option<DateTime<Utc>>,
    pub valid: bool,
}

/// A fragment together with its address. This is what dispatch and on-call
/// hooks see; the index survives hook filtering and reordering.
#[derive(Debug, Clone)]
pub struct FragmentRef {
    pub obj: ObjRef,
    pub name: String,
    pub index: usize,
    pub fragment: EventFragment,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    pub events: Vec<(ObjRef, Vec<(String, Vec<EventFragment>)>)>,
    pub to_validate: Vec<(ObjRef, String, usize)>,
    pub locked: Vec<(ObjRef, String, usize)>,
}

/// Per-object fragment lists plus the validation queue and lock set. The
/// sole mutator of fragment data: every deletion renumbers the queue and the
/// lock set so stored indices stay dense.
#[derive(Default)]
pub struct EventStore {
    events: HashMap<ObjRef, HashMap<String, Vec<EventFragment>>>,
    to_validate: Vec<(ObjRef, String, usize)>,
    locked: Vec<(ObjRef, String, usize)>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        obj: &ObjRef,
        name: &str,
        code: &str,
        author: Option<&str>,
        valid: bool,
        parameters: &str,
        now: DateTime<Utc>,
    ) -> FragmentRef {
        let list = self
            .events
            .entry(obj.clone())
            .or_default()
            .entry(name.to_string())
            .or_default();
        list.push(EventFragment {
            code: code.to_string(),
            parameters: parameters.to_string(),
            author: author.map(str::to_string),
            created: now,
            updated: None,
            valid,
        });
        let index = list.len() - 1;
        let fragment = list[index].clone();
        if !valid {
            self.to_validate.push((obj.clone(), name.to_string(), index));
        }
        FragmentRef { obj: obj.clone(), name: name.to_string(), index, fragment }
    }

    pub fn edit(
        &mut self,
        obj: &ObjRef,
        name: &str,
        index: usize,
        code: &str,
        author: Option<&str>,
        valid: bool,
        now: DateTime<Utc>,
    ) -> Result<FragmentRef, StoreError> {
        if self.is_locked(obj, name, index) {
            return Err(StoreError::LockedEvent { obj: obj.clone(), name: name.to_string(), index });
        }
        let fragment = self
            .events
            .get_mut(obj)
            .and_then(|names| names.get_mut(name))
            .and_then(|list| list.get_mut(index))
            .ok_or_else(|| StoreError::MissingFragment {
                obj: obj.clone(),
                name: name.to_string(),
                index,
            })?;
        fragment.code = code.to_string();
        fragment.author = author.map(str::to_string);
        fragment.valid = valid;
        fragment.updated = Some(now);
        let fragment = fragment.clone();

        let entry = (obj.clone(), name.to_string(), index);
        if valid {
            self.to_validate.retain(|queued| queued != &entry);
        } else if !self.to_validate.contains(&entry) {
            self.to_validate.push(entry);
        }
        Ok(FragmentRef { obj: obj.clone(), name: name.to_string(), index, fragment })
    }

    /// Remove a fragment and renumber everything that references a higher
    /// index on the same `(object, name)`. Deleting a missing index is a
    /// silent no-op.
    pub fn delete(
        &mut self,
        obj: &ObjRef,
        name: &str,
        index: usize,
    ) -> Result<Option<EventFragment>, StoreError> {
        if self.is_locked(obj, name, index) {
            return Err(StoreError::LockedEvent { obj: obj.clone(), name: name.to_string(), index });
        }
        let Some(list) = self.events.get_mut(obj).and_then(|names| names.get_mut(name)) else {
            return Ok(None);
        };
        if index >= list.len() {
            return Ok(None);
        }
        let removed = list.remove(index);
        info!(obj = %obj, event = name, index, code = %removed.code, "deleting event");

        self.to_validate
            .retain(|(o, n, i)| !(o == obj && n.as_str() == name && *i == index));
        for (o, n, i) in self.to_validate.iter_mut() {
            if *o == *obj && n.as_str() == name && *i > index {
                *i -= 1;
            }
        }
        self.locked
            .retain(|(o, n, i)| !(o == obj && n.as_str() == name && *i == index));
        for (o, n, i) in self.locked.iter_mut() {
            if *o == *obj && n.as_str() == name && *i > index {
                *i -= 1;
            }
        }
        Ok(Some(removed))
    }

    /// Mark a fragment valid and drop it from the validation queue.
    /// Idempotent when the queue entry is already gone.
    pub fn accept(&mut self, obj: &ObjRef, name: &str, index: usize) -> Result<(), StoreError> {
        let fragment = self
            .events
            .get_mut(obj)
            .and_then(|names| names.get_mut(name))
            .and_then(|list| list.get_mut(index))
            .ok_or_else(|| StoreError::MissingFragment {
                obj: obj.clone(),
                name: name.to_string(),
                index,
            })?;
        fragment.valid = true;
        let entry = (obj.clone(), name.to_string(), index);
        self.to_validate.retain(|queued| queued != &entry);
        Ok(())
    }

    pub fn lock(&mut self, obj: &ObjRef, name: &str, index: usize) {
        let entry = (obj.clone(), name.to_string(), index);
        if !self.locked.contains(&entry) {
            self.locked.push(entry);
        }
    }

    pub fn unlock(&mut self, obj: &ObjRef, name: &str, index: usize) {
        let entry = (obj.clone(), name.to_string(), index);
        self.locked.retain(|locked| locked != &entry);
    }

    pub fn is_locked(&self, obj: &ObjRef, name: &str, index: usize) -> bool {
        self.locked.iter().any(|(o, n, i)| o == obj && n.as_str() == name && *i == index)
    }

    pub fn fragments(&self, obj: &ObjRef, name: &str) -> Vec<FragmentRef> {
        self.events
            .get(obj)
            .and_then(|names| names.get(name))
            .map(|list| {
                list.iter()
                    .enumerate()
                    .map(|(index, fragment)| FragmentRef {
                        obj: obj.clone(),
                        name: name.to_string(),
                        index,
                        fragment: fragment.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn fragment(&self, obj: &ObjRef, name: &str, index: usize) -> Option<&EventFragment> {
        self.events.get(obj).and_then(|names| names.get(name)).and_then(|list| list.get(index))
    }

    pub fn pending_validation(&self) -> &[(ObjRef, String, usize)] {
        &self.to_validate
    }

    pub fn locked_entries(&self) -> &[(ObjRef, String, usize)] {
        &self.locked
    }

    pub fn to_state(&self) -> StoreState {
        StoreState {
            events: self
                .events
                .iter()
                .map(|(obj, names)| {
                    (
                        obj.clone(),
                        names.iter().map(|(name, list)| (name.clone(), list.clone())).collect(),
                    )
                })
                .collect(),
            to_validate: self.to_validate.clone(),
            locked: self.locked.clone(),
        }
    }

    pub fn from_state(state: StoreState) -> Self {
        Self {
            events: state
                .events
                .into_iter()
                .map(|(obj, names)| (obj, names.into_iter().collect()))
                .collect(),
            to_validate: state.to_validate,
            locked: state.locked,
        }
    }
}
