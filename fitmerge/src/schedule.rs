use serde::Serialize;
use tracing::{debug, info};

use crate::classify::{classify, KeywordTable, SetType};
use crate::config::{MergeConfig, WeightUnit};
use crate::exercise::{find_unmapped, title_case, MappingTable};
use crate::sets::ParsedSet;
use crate::timing::RecordingSpan;
use crate::MergeError;

/// A strength set placed on the recording timeline.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GarminSet {
    /// Seconds from the recording start, in `[0, duration)`.
    pub timestamp_offset_seconds: u32,
    pub exercise_category: u16,
    pub exercise_name: u16,
    pub weight: f64,
    pub weight_unit: u16,
    pub reps: u32,
    pub set_number: u32,
    pub set_type: SetType,
    pub duration_seconds: u32,
    pub original_exercise_name: String,
    pub note: String,
}

/// User edit applied before export; `None` leaves the field alone.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SetEdit {
    pub reps: Option<u32>,
    pub weight: Option<f64>,
    pub set_type: Option<SetType>,
}

#[derive(Clone, Debug)]
pub struct ScheduleOptions<'a> {
    pub weight_unit: WeightUnit,
    pub weight_unit_id: u16,
    pub set_duration_seconds: u32,
    pub keywords: &'a KeywordTable,
    pub classify_notes: bool,
    pub collect_notes: bool,
    pub note_template: &'a str,
}

impl<'a> ScheduleOptions<'a> {
    pub fn from_config(config: &'a MergeConfig) -> Self {
        let settings = &config.settings;
        Self {
            weight_unit: settings.weight_unit,
            weight_unit_id: config.weight_unit_id(settings.weight_unit),
            set_duration_seconds: settings.default_set_duration_seconds,
            keywords: &config.set_type_keywords,
            classify_notes: settings.parse_set_type_from_notes,
            collect_notes: settings.append_notes_to_workout_note,
            note_template: &settings.note_template,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExerciseSummary {
    pub exercise: String,
    pub sets: usize,
    pub total_reps: u64,
    pub max_weight: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Schedule {
    pub sets: Vec<GarminSet>,
    /// Formatted set notes in set order.
    pub notes: Vec<String>,
    /// Unit the set weights are expressed in.
    pub weight_unit: WeightUnit,
}

impl Schedule {
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn total_reps(&self) -> u64 {
        self.sets.iter().map(|s| u64::from(s.reps)).sum()
    }

    pub fn exercise_count(&self) -> usize {
        self.summary().len()
    }

    pub fn edit(&mut self, index: usize, edit: SetEdit) -> Result<(), MergeError> {
        let len = self.sets.len();
        let set = self
            .sets
            .get_mut(index)
            .ok_or_else(|| MergeError::InvalidEdit(format!("no set at index {index} (have {len})")))?;
        if let Some(weight) = edit.weight {
            if !weight.is_finite() || weight < 0.0 {
                return Err(MergeError::InvalidEdit(format!(
                    "weight {weight} must be a non-negative number"
                )));
            }
            set.weight = weight;
        }
        if let Some(reps) = edit.reps {
            set.reps = reps;
        }
        if let Some(set_type) = edit.set_type {
            set.set_type = set_type;
        }
        debug!(index, ?edit, "edited set");
        Ok(())
    }

    /// Per-exercise totals in first-seen order.
    pub fn summary(&self) -> Vec<ExerciseSummary> {
        let mut out: Vec<ExerciseSummary> = Vec::new();
        for set in &self.sets {
            let exercise = title_case(&set.original_exercise_name);
            let entry = match out.iter().position(|s| s.exercise == exercise) {
                Some(pos) => &mut out[pos],
                None => {
                    out.push(ExerciseSummary {
                        exercise,
                        sets: 0,
                        total_reps: 0,
                        max_weight: 0.0,
                    });
                    let last = out.len() - 1;
                    &mut out[last]
                }
            };
            entry.sets += 1;
            entry.total_reps += u64::from(set.reps);
            entry.max_weight = entry.max_weight.max(set.weight);
        }
        out
    }
}

fn format_note(template: &str, exercise: &str, set_number: u32, note: &str) -> String {
    template
        .replace("{exercise_name}", &title_case(exercise))
        .replace("{set_number}", &set_number.to_string())
        .replace("{note_text}", note)
}

/// Spread the sets evenly over the span in input order.
pub fn schedule(
    sets: &[ParsedSet],
    span: &RecordingSpan,
    table: &MappingTable,
    options: &ScheduleOptions<'_>,
) -> Result<Schedule, MergeError> {
    let unmapped = find_unmapped(sets, table);
    if !unmapped.is_empty() {
        return Err(MergeError::Unresolved(unmapped.into_iter().collect()));
    }

    let mut out = Schedule {
        sets: Vec::with_capacity(sets.len()),
        notes: Vec::new(),
        weight_unit: options.weight_unit,
    };
    if sets.is_empty() {
        return Ok(out);
    }

    let duration = span.duration_seconds.max(1);
    let last_slot = duration - 1;
    let per_set = f64::from(duration) / sets.len() as f64;
    let mut running = 0.0f64;

    for set in sets {
        let mapping = table
            .lookup(&set.exercise_name)
            .ok_or_else(|| MergeError::Unresolved(vec![set.exercise_name.clone()]))?;
        let offset = (running.floor() as u32).min(last_slot);
        running += per_set;

        let set_type = classify(&set.note, options.keywords, options.classify_notes);
        if options.collect_notes && !set.note.is_empty() {
            out.notes.push(format_note(
                options.note_template,
                &set.exercise_name,
                set.set_number,
                &set.note,
            ));
        }
        out.sets.push(GarminSet {
            timestamp_offset_seconds: offset,
            exercise_category: mapping.category,
            exercise_name: mapping.name,
            weight: set.weight,
            weight_unit: options.weight_unit_id,
            reps: set.reps,
            set_number: set.set_number,
            set_type,
            duration_seconds: options.set_duration_seconds,
            original_exercise_name: set.exercise_name.clone(),
            note: set.note.clone(),
        });
    }

    info!(
        sets = out.sets.len(),
        duration,
        per_set,
        "scheduled sets"
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exercise::ExerciseMapping;
    use crate::timing::SpanSource;

    fn span(duration: u32) -> RecordingSpan {
        RecordingSpan {
            duration_seconds: duration,
            total_record_count: 10,
            start_timestamp: Some(0),
            source: SpanSource::Exact,
        }
    }

    fn parsed(name: &str, set_number: u32, reps: u32, weight: f64, note: &str) -> ParsedSet {
        ParsedSet {
            exercise_name: name.to_string(),
            set_number,
            reps,
            weight,
            note: note.to_string(),
            source_row_index: 0,
        }
    }

    fn table() -> MappingTable {
        let mut table = MappingTable::new();
        table.insert("bench press", ExerciseMapping { category: 0, name: 1 });
        table.insert("squat", ExerciseMapping { category: 28, name: 0 });
        table
    }

    #[test]
    fn offsets_stay_inside_duration() {
        let config = MergeConfig::default();
        let sets: Vec<_> = (1..=7).map(|i| parsed("squat", i, 5, 100.0, "")).collect();
        let out = schedule(&sets, &span(100), &table(), &ScheduleOptions::from_config(&config)).unwrap();
        let offsets: Vec<u32> = out.sets.iter().map(|s| s.timestamp_offset_seconds).collect();
        assert_eq!(offsets, vec![0, 14, 28, 42, 57, 71, 85]);
        assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
        assert!(*offsets.last().unwrap() < 100);
    }

    #[test]
    fn more_sets_than_seconds_clamp() {
        let config = MergeConfig::default();
        let sets: Vec<_> = (1..=5).map(|i| parsed("squat", i, 5, 100.0, "")).collect();
        let out = schedule(&sets, &span(1), &table(), &ScheduleOptions::from_config(&config)).unwrap();
        assert!(out.sets.iter().all(|s| s.timestamp_offset_seconds == 0));
    }

    #[test]
    fn fills_set_fields_and_notes() {
        let config = MergeConfig::default();
        let sets = vec![
            parsed("bench press", 1, 8, 60.0, ""),
            parsed("bench press", 2, 6, 65.0, "went to failure"),
        ];
        let out = schedule(&sets, &span(600), &table(), &ScheduleOptions::from_config(&config)).unwrap();
        let second = &out.sets[1];
        assert_eq!(second.exercise_category, 0);
        assert_eq!(second.exercise_name, 1);
        assert_eq!(second.weight_unit, 1);
        assert_eq!(second.set_type, SetType::Failure);
        assert_eq!(second.duration_seconds, 30);
        assert_eq!(second.timestamp_offset_seconds, 300);
        assert_eq!(out.notes, vec!["\nBench Press - Set 2: went to failure".to_string()]);
    }

    #[test]
    fn note_collection_and_classification_can_be_disabled() {
        let mut config = MergeConfig::default();
        config.settings.append_notes_to_workout_note = false;
        config.settings.parse_set_type_from_notes = false;
        let sets = vec![parsed("squat", 1, 3, 140.0, "warm up")];
        let out = schedule(&sets, &span(60), &table(), &ScheduleOptions::from_config(&config)).unwrap();
        assert!(out.notes.is_empty());
        assert_eq!(out.sets[0].set_type, SetType::Normal);
    }

    #[test]
    fn unmapped_exercise_is_an_error() {
        let config = MergeConfig::default();
        let sets = vec![parsed("cable row", 1, 10, 40.0, "")];
        let err = schedule(&sets, &span(60), &table(), &ScheduleOptions::from_config(&config)).unwrap_err();
        assert!(matches!(err, MergeError::Unresolved(ref names) if names == &["cable row".to_string()]));
    }

    #[test]
    fn empty_input_gives_empty_schedule() {
        let config = MergeConfig::default();
        let out = schedule(&[], &span(60), &table(), &ScheduleOptions::from_config(&config)).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn edits_and_summary() {
        let config = MergeConfig::default();
        let sets = vec![
            parsed("squat", 1, 5, 100.0, ""),
            parsed("bench press", 1, 8, 60.0, ""),
            parsed("squat", 2, 5, 110.0, ""),
        ];
        let mut out = schedule(&sets, &span(60), &table(), &ScheduleOptions::from_config(&config)).unwrap();
        out.edit(
            2,
            SetEdit {
                reps: Some(3),
                weight: Some(120.0),
                set_type: Some(SetType::DropSet),
            },
        )
        .unwrap();
        assert_eq!(out.sets[2].set_type, SetType::DropSet);
        assert!(out.edit(3, SetEdit::default()).is_err());
        assert!(out
            .edit(0, SetEdit { weight: Some(-1.0), ..SetEdit::default() })
            .is_err());

        let summary = out.summary();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].exercise, "Squat");
        assert_eq!(summary[0].sets, 2);
        assert_eq!(summary[0].total_reps, 8);
        assert_eq!(summary[0].max_weight, 120.0);
        assert_eq!(out.total_reps(), 16);
        assert_eq!(out.exercise_count(), 2);
    }
}
