//! Merge pipeline: parse, filter, time, resolve, schedule, synthesize,
//! encode, validate.
//!
//! Resolution of unknown exercise names is a suspension point. A plan that
//! finds unmapped names comes back as [`Phase::NeedsMappings`]; the caller
//! gathers display names however it likes and resumes with a
//! [`Resolution`]. [`merge`] drives the same protocol with a blocking
//! [`ExerciseResolver`].

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::clean::{clean, FilterStatus};
use crate::config::MergeConfig;
use crate::exercise::{
    apply_resolution, find_unmapped, suggest, ExerciseMapping, ExerciseResolver, MappingTable,
    Resolution,
};
use crate::fit::{self, FitContainer};
use crate::schedule::{schedule, ExerciseSummary, GarminSet, Schedule, ScheduleOptions, SetEdit};
use crate::sets::{parse, ParsedSet, RawRow};
use crate::synth::{synthesize, SynthesisStatus};
use crate::timing::{extract_span, RecordingSpan};
use crate::validate::{ValidationResult, Validator};
use crate::{MergeError, MergeWarning};

/// Everything written alongside the merged file.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MergeReport {
    pub input_records: usize,
    pub removed_set_records: usize,
    pub output_records: usize,
    pub inserted_sets: usize,
    pub span: RecordingSpan,
    pub start_time: Option<DateTime<Utc>>,
    pub total_reps: u64,
    pub exercises: Vec<ExerciseSummary>,
    pub resolved_exercises: BTreeMap<String, ExerciseMapping>,
    pub sets: Vec<GarminSet>,
    pub workout_note: Option<String>,
    pub filter: FilterStatus,
    pub synthesis: SynthesisStatus,
    pub validation: ValidationResult,
    pub warnings: Vec<MergeWarning>,
}

#[derive(Debug)]
pub enum MergeOutcome {
    Success { bytes: Vec<u8>, report: MergeReport },
    UserCancelled,
    Failure(MergeError),
}

impl MergeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, MergeOutcome::Success { .. })
    }
}

/// Parsed, filtered and timed; every exercise name has a mapping.
#[derive(Clone, Debug)]
pub struct MergePlan {
    config: MergeConfig,
    input_records: usize,
    cleaned: FitContainer,
    removed: usize,
    filter: FilterStatus,
    span: RecordingSpan,
    sets: Vec<ParsedSet>,
    resolved: BTreeMap<String, ExerciseMapping>,
    warnings: Vec<MergeWarning>,
}

/// A plan waiting on display names for unmapped exercises.
#[derive(Clone, Debug)]
pub struct PendingMerge {
    plan: MergePlan,
    unmapped: BTreeSet<String>,
    available: Vec<String>,
}

#[derive(Clone, Debug)]
pub enum Phase {
    Ready(MergePlan),
    NeedsMappings(PendingMerge),
    Cancelled,
}

impl MergePlan {
    pub fn begin(
        container: FitContainer,
        rows: &[RawRow],
        config: &MergeConfig,
        table: &MappingTable,
    ) -> Phase {
        let parsed = parse(rows, &config.columns);
        let mut warnings = parsed.warnings;
        info!(
            rows = rows.len(),
            sets = parsed.sets.len(),
            "parsed workout rows"
        );

        let header = container.header;
        let input_records = container.len();
        let cleaned = clean(container.records);
        if let FilterStatus::Degraded(reason) = &cleaned.status {
            warnings.push(MergeWarning::FilterDegraded {
                reason: reason.clone(),
            });
        }
        let container = FitContainer::new(header, cleaned.records);
        let span = extract_span(&container.records, &config.settings.timing);
        info!(
            removed = cleaned.removed_count,
            duration = span.duration_seconds,
            source = ?span.source,
            "prepared recording"
        );

        let plan = MergePlan {
            config: config.clone(),
            input_records,
            cleaned: container,
            removed: cleaned.removed_count,
            filter: cleaned.status,
            span,
            sets: parsed.sets,
            resolved: BTreeMap::new(),
            warnings,
        };
        plan.into_phase(table)
    }

    fn into_phase(self, table: &MappingTable) -> Phase {
        let unmapped = find_unmapped(&self.sets, table);
        if unmapped.is_empty() {
            return Phase::Ready(self);
        }
        info!(count = unmapped.len(), "exercises need a mapping");
        let available = self.config.display_names(table);
        Phase::NeedsMappings(PendingMerge {
            plan: self,
            unmapped,
            available,
        })
    }

    pub fn span(&self) -> &RecordingSpan {
        &self.span
    }

    pub fn sets(&self) -> &[ParsedSet] {
        &self.sets
    }

    pub fn warnings(&self) -> &[MergeWarning] {
        &self.warnings
    }

    pub fn schedule(self, table: &MappingTable) -> Result<ScheduledMerge, MergeError> {
        let options = ScheduleOptions::from_config(&self.config);
        let schedule = schedule(&self.sets, &self.span, table, &options)?;
        Ok(ScheduledMerge {
            plan: self,
            schedule,
        })
    }
}

impl PendingMerge {
    pub fn unmapped(&self) -> &BTreeSet<String> {
        &self.unmapped
    }

    pub fn available(&self) -> &[String] {
        &self.available
    }

    /// Best candidate per unmapped name.
    pub fn suggestions(&self) -> BTreeMap<String, Option<String>> {
        self.unmapped
            .iter()
            .map(|name| (name.clone(), suggest(name, &self.available)))
            .collect()
    }

    /// Apply a resolution. Cancelling leaves the table untouched.
    pub fn resume_with_mappings(self, table: &mut MappingTable, resolution: Resolution) -> Phase {
        match resolution {
            Resolution::Cancelled => {
                info!("exercise mapping cancelled");
                Phase::Cancelled
            }
            Resolution::Confirmed(chosen) => {
                let mut plan = self.plan;
                for (name, mapping) in apply_resolution(table, &chosen) {
                    plan.resolved.insert(name, mapping);
                }
                plan.into_phase(table)
            }
        }
    }
}

/// Sets placed on the timeline, open to edits before export.
#[derive(Clone, Debug)]
pub struct ScheduledMerge {
    plan: MergePlan,
    schedule: Schedule,
}

impl ScheduledMerge {
    pub fn span(&self) -> &RecordingSpan {
        &self.plan.span
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn sets(&self) -> &[GarminSet] {
        &self.schedule.sets
    }

    pub fn summary(&self) -> Vec<ExerciseSummary> {
        self.schedule.summary()
    }

    pub fn edit_set(&mut self, index: usize, edit: SetEdit) -> Result<(), MergeError> {
        self.schedule.edit(index, edit)
    }

    pub fn finish(self) -> MergeOutcome {
        match self.export() {
            Ok((bytes, report)) => MergeOutcome::Success { bytes, report },
            Err(err) => {
                warn!(error = %err, "merge failed");
                MergeOutcome::Failure(err)
            }
        }
    }

    fn export(self) -> Result<(Vec<u8>, MergeReport), MergeError> {
        let ScheduledMerge { plan, schedule } = self;
        let mut warnings = plan.warnings;
        let cleaned_len = plan.cleaned.len();

        let merged = synthesize(
            plan.cleaned,
            &plan.span,
            &schedule,
            plan.config.settings.synthesize_set_records,
        )?;
        if let SynthesisStatus::Degraded(reason) = &merged.status {
            warnings.push(MergeWarning::SynthesisDegraded {
                reason: reason.clone(),
            });
        }

        let bytes = fit::encode(&merged.container)?;
        let validation = Validator::new()
            .expect_preserved(cleaned_len + merged.inserted_auxiliary)
            .validate(&bytes);
        if !validation.ok {
            return Err(MergeError::ValidationFailed(
                validation
                    .error
                    .unwrap_or_else(|| "unknown validation error".to_string()),
            ));
        }
        warnings.extend(
            validation
                .warnings
                .iter()
                .map(|message| MergeWarning::Validation {
                    message: message.clone(),
                }),
        );

        let report = MergeReport {
            input_records: plan.input_records,
            removed_set_records: plan.removed,
            output_records: merged.container.len(),
            inserted_sets: merged.inserted_sets,
            span: plan.span,
            start_time: plan.span.start_time(),
            total_reps: schedule.total_reps(),
            exercises: schedule.summary(),
            resolved_exercises: plan.resolved,
            sets: schedule.sets,
            workout_note: merged.workout_note,
            filter: plan.filter,
            synthesis: merged.status,
            validation,
            warnings,
        };
        info!(
            bytes = bytes.len(),
            sets = report.inserted_sets,
            warnings = report.warnings.len(),
            "merge complete"
        );
        Ok((bytes, report))
    }
}

/// Drive `phase` to a ready plan, asking `resolver` for every batch of
/// unmapped names. `Ok(None)` means the resolver cancelled. A round that maps
/// nothing new fails with [`MergeError::Unresolved`].
pub fn resolve_phase(
    mut phase: Phase,
    table: &mut MappingTable,
    resolver: &mut dyn ExerciseResolver,
) -> Result<Option<MergePlan>, MergeError> {
    loop {
        match phase {
            Phase::Ready(plan) => return Ok(Some(plan)),
            Phase::Cancelled => return Ok(None),
            Phase::NeedsMappings(pending) => {
                let before = pending.unmapped().len();
                let resolution = resolver.resolve_unmapped(pending.unmapped(), pending.available());
                phase = pending.resume_with_mappings(table, resolution);
                if let Phase::NeedsMappings(still) = &phase {
                    if still.unmapped().len() >= before {
                        return Err(MergeError::Unresolved(
                            still.unmapped().iter().cloned().collect(),
                        ));
                    }
                }
            }
        }
    }
}

/// Run a whole merge, asking `resolver` for any unmapped exercise names.
/// Confirmed mappings are written into `table`.
pub fn merge(
    recording: &[u8],
    rows: &[RawRow],
    config: &MergeConfig,
    table: &mut MappingTable,
    resolver: &mut dyn ExerciseResolver,
) -> MergeOutcome {
    let container = match fit::decode(recording) {
        Ok(container) => container,
        Err(err) => return MergeOutcome::Failure(err),
    };

    let phase = MergePlan::begin(container, rows, config, table);
    let plan = match resolve_phase(phase, table, resolver) {
        Ok(Some(plan)) => plan,
        Ok(None) => return MergeOutcome::UserCancelled,
        Err(err) => return MergeOutcome::Failure(err),
    };

    match plan.schedule(table) {
        Ok(scheduled) => scheduled.finish(),
        Err(err) => MergeOutcome::Failure(err),
    }
}
