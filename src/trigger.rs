use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::object::ObjRef;

/// Standing binding of one recurring firing to one stored fragment, plus the
/// optional time-format spec handed to the clock-math collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRecord {
    pub id: u64,
    pub obj: ObjRef,
    pub name: String,
    pub index: Option<usize>,
    pub time_format: Option<String>,
    pub interval_secs: f64,
}

/// Runtime state of a standing trigger. The cached average is not persisted:
/// the first firing after a restart re-consults the clock math and the
/// schedule converges within two firings.
pub struct TriggerState {
    pub record: TriggerRecord,
    pub usual: Option<f64>,
    pub next_fire: DateTime<Utc>,
}

/// Apply fragment-deletion renumbering to the standing triggers: drop the
/// trigger bound to the removed index, shift higher bound indices down.
pub fn renumber_triggers(
    triggers: &mut Vec<TriggerState>,
    obj: &ObjRef,
    name: &str,
    removed: usize,
) {
    triggers.retain(|trigger| {
        !(trigger.record.obj == *obj
            && trigger.record.name.as_str() == name
            && trigger.record.index == Some(removed))
    });
    for trigger in triggers.iter_mut() {
        if trigger.record.obj == *obj && trigger.record.name.as_str() == name {
            if let Some(index) = &mut trigger.record.index {
                if *index > removed {
                    *index -= 1;
                }
            }
        }
    }
}
