//! Merge Hevy strength-training exports into Garmin FIT activity recordings.
//!
//! The recording keeps every sensor, lap and session message bit-for-bit;
//! existing strength-set messages are replaced by sets synthesized from the
//! workout CSV and spread across the recording's span.

use serde::Serialize;
use thiserror::Error;

pub mod classify;
pub mod clean;
pub mod config;
pub mod exercise;
pub mod fit;
pub mod merge;
pub mod schedule;
pub mod sets;
pub mod synth;
pub mod timing;
pub mod validate;

#[cfg(test)]
pub(crate) mod fixtures;

pub use classify::{classify, KeywordTable, SetType};
pub use clean::{clean, CleanOutcome, FilterStatus};
pub use config::{MergeConfig, Settings, TimingMode, TimingOptions, WeightUnit};
pub use exercise::{
    find_unmapped, suggest, ExerciseMapping, ExerciseResolver, FixedResolver, MappingTable,
    Resolution, SuggestionResolver,
};
pub use fit::{FitContainer, FitHeader, Record};
pub use merge::{
    merge, resolve_phase, MergeOutcome, MergePlan, MergeReport, PendingMerge, Phase,
    ScheduledMerge,
};
pub use schedule::{schedule, ExerciseSummary, GarminSet, Schedule, ScheduleOptions, SetEdit};
pub use sets::{parse, read_rows, read_rows_path, ColumnMap, ParseOutcome, ParsedSet, RawRow};
pub use synth::{synthesize, MergedRecording, SynthesisStatus};
pub use timing::{extract_span, RecordingSpan, SpanSource};
pub use validate::{validate, validate_path, ValidationResult, ValidationState, Validator};

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to decode FIT data: {0}")]
    FitDecode(String),
    #[error("FIT checksum mismatch: stored {stored:#06x}, computed {computed:#06x}")]
    Checksum { stored: u16, computed: u16 },
    #[error("failed to encode FIT data: {0}")]
    FitEncode(String),
    #[error("failed to read workout CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
    #[error("invalid setting: {0}")]
    InvalidSetting(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("exercises without a Garmin mapping: {}", .0.join(", "))]
    Unresolved(Vec<String>),
    #[error("invalid set edit: {0}")]
    InvalidEdit(String),
    #[error("output validation failed: {0}")]
    ValidationFailed(String),
}

/// Non-fatal problems collected over a merge and returned with the report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeWarning {
    #[error("skipped workout row {row}: {reason}")]
    RowSkipped { row: usize, reason: String },
    #[error("set {set_number} of '{exercise}' (row {row}) does not follow the previous set")]
    SetOrder {
        exercise: String,
        set_number: u32,
        row: usize,
    },
    #[error("record filter degraded: {reason}")]
    FilterDegraded { reason: String },
    #[error("set synthesis degraded: {reason}")]
    SynthesisDegraded { reason: String },
    #[error("validation: {message}")]
    Validation { message: String },
}

/// Decode a recording using the provided format hint (extension).
pub fn decode_recording(input: &[u8], format: &str) -> Result<FitContainer, MergeError> {
    let format_lc = format.to_ascii_lowercase();
    if format_lc.ends_with(".fit") || format_lc == "fit" {
        fit::decode(input)
    } else {
        Err(MergeError::UnsupportedFormat(format.to_string()))
    }
}
