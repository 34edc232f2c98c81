use serde::Serialize;
use tracing::{debug, warn};

use crate::fit::Record;

const SET_LABEL_MARKERS: [&str; 3] = ["set", "exercise", "strength"];

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum FilterStatus {
    Applied,
    /// No record exposed a category label; nothing was removed.
    Degraded(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct CleanOutcome {
    pub records: Vec<Record>,
    pub removed_count: usize,
    pub status: FilterStatus,
}

/// Whether a category label names strength-set data.
pub fn is_set_category(label: &str) -> bool {
    let lowered = label.to_ascii_lowercase();
    SET_LABEL_MARKERS.iter().any(|m| lowered.contains(m))
}

pub fn is_set_record(record: &Record) -> bool {
    record
        .category()
        .map(|label| is_set_category(&label))
        .unwrap_or(false)
}

/// Drop existing strength-set records, keeping everything else in order.
pub fn clean(records: Vec<Record>) -> CleanOutcome {
    if !records.is_empty() && records.iter().all(|r| r.category().is_none()) {
        let reason = format!("none of {} records carries a category label", records.len());
        warn!(%reason, "leaving recording unfiltered");
        return CleanOutcome {
            records,
            removed_count: 0,
            status: FilterStatus::Degraded(reason),
        };
    }

    let before = records.len();
    let kept: Vec<Record> = records.into_iter().filter(|r| !is_set_record(r)).collect();
    let removed_count = before - kept.len();
    debug!(kept = kept.len(), removed_count, "filtered recording");
    CleanOutcome {
        records: kept,
        removed_count,
        status: FilterStatus::Applied,
    }
}
