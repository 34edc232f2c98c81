//! Builds FIT `set` messages for the scheduled sets and splices them into
//! the cleaned recording.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::fit::{
    base_type, mesg, Definition, DeveloperFieldDef, FieldDef, FitContainer, Record,
    PROTOCOL_VERSION_2,
};
use crate::schedule::{GarminSet, Schedule};
use crate::timing::RecordingSpan;
use crate::MergeError;

const SET_LOCAL_TYPE: u8 = 15;
const DEVELOPER_LOCAL_TYPE: u8 = 14;

const APPLICATION_ID: &[u8; 16] = b"fitmerge-hevy-v1";
const SET_KIND_FIELD: u8 = 0;
const SET_KIND_NAME: &[u8] = b"set_kind";
const FIELD_NAME_SIZE: u8 = 16;

const SET_TYPE_ACTIVE: u8 = 1;
const WEIGHT_SCALE: f64 = 16.0;

mod set_field {
    pub const DURATION: u8 = 0;
    pub const REPETITIONS: u8 = 3;
    pub const WEIGHT: u8 = 4;
    pub const SET_TYPE: u8 = 5;
    pub const START_TIME: u8 = 6;
    pub const CATEGORY: u8 = 7;
    pub const CATEGORY_SUBTYPE: u8 = 8;
    pub const WEIGHT_DISPLAY_UNIT: u8 = 9;
    pub const MESSAGE_INDEX: u8 = 10;
    /// The `set` message keeps its timestamp in 254, not the usual 253.
    pub const TIMESTAMP: u8 = 254;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum SynthesisStatus {
    Applied,
    /// Sets were not written into the recording.
    Degraded(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct MergedRecording {
    pub container: FitContainer,
    pub inserted_sets: usize,
    /// Developer data id and field description messages.
    pub inserted_auxiliary: usize,
    pub workout_note: Option<String>,
    pub status: SynthesisStatus,
}

/// Aggregated note text, present only when some set carried a note.
pub fn workout_note(schedule: &Schedule) -> Option<String> {
    if schedule.notes.is_empty() {
        return None;
    }
    let mut note = String::from("Hevy Workout Integration:\n");
    note.push_str(&format!("• {} exercises\n", schedule.exercise_count()));
    note.push_str(&format!("• {} total sets\n", schedule.len()));
    note.push_str(&format!("• {} total reps\n", schedule.total_reps()));
    note.push_str("\nSet Notes:");
    for set_note in &schedule.notes {
        note.push_str(set_note);
    }
    Some(note)
}

fn set_definition(developer_index: u8) -> Definition {
    Definition::new(
        mesg::SET,
        vec![
            FieldDef::new(set_field::TIMESTAMP, 4, base_type::UINT32),
            FieldDef::new(set_field::START_TIME, 4, base_type::UINT32),
            FieldDef::new(set_field::DURATION, 4, base_type::UINT32),
            FieldDef::new(set_field::REPETITIONS, 2, base_type::UINT16),
            FieldDef::new(set_field::WEIGHT, 2, base_type::UINT16),
            FieldDef::new(set_field::SET_TYPE, 1, base_type::ENUM),
            FieldDef::new(set_field::CATEGORY, 2, base_type::UINT16),
            FieldDef::new(set_field::CATEGORY_SUBTYPE, 2, base_type::UINT16),
            FieldDef::new(set_field::WEIGHT_DISPLAY_UNIT, 2, base_type::UINT16),
            FieldDef::new(set_field::MESSAGE_INDEX, 2, base_type::UINT16),
        ],
    )
    .with_developer_fields(vec![DeveloperFieldDef {
        number: SET_KIND_FIELD,
        size: 1,
        developer_index,
    }])
}

fn clamp_u16(value: f64) -> u16 {
    if value.is_finite() && value > 0.0 {
        value.round().min(f64::from(u16::MAX - 1)) as u16
    } else {
        0
    }
}

fn set_record(
    definition: &Arc<Definition>,
    set: &GarminSet,
    index: usize,
    start: u32,
    weight_kg: f64,
) -> Result<Record, MergeError> {
    let timestamp = start.saturating_add(set.timestamp_offset_seconds);
    let duration_ms = set.duration_seconds.saturating_mul(1000);
    let reps = u16::try_from(set.reps).unwrap_or(u16::MAX - 1);
    let message_index = u16::try_from(index).unwrap_or(u16::MAX - 1);

    let mut payload = Vec::with_capacity(definition.data_size());
    payload.extend_from_slice(&timestamp.to_le_bytes());
    payload.extend_from_slice(&timestamp.to_le_bytes());
    payload.extend_from_slice(&duration_ms.to_le_bytes());
    payload.extend_from_slice(&reps.to_le_bytes());
    payload.extend_from_slice(&clamp_u16(weight_kg * WEIGHT_SCALE).to_le_bytes());
    payload.push(SET_TYPE_ACTIVE);
    payload.extend_from_slice(&set.exercise_category.to_le_bytes());
    payload.extend_from_slice(&set.exercise_name.to_le_bytes());
    payload.extend_from_slice(&set.weight_unit.to_le_bytes());
    payload.extend_from_slice(&message_index.to_le_bytes());
    payload.push(set.set_type.id());
    Record::new(SET_LOCAL_TYPE, Arc::clone(definition), payload)
}

fn developer_records(developer_index: u8) -> Result<Vec<Record>, MergeError> {
    let id_definition = Arc::new(Definition::new(
        mesg::DEVELOPER_DATA_ID,
        vec![
            FieldDef::new(1, 16, base_type::BYTE),
            FieldDef::new(3, 1, base_type::UINT8),
        ],
    ));
    let mut id_payload = APPLICATION_ID.to_vec();
    id_payload.push(developer_index);

    let description_definition = Arc::new(Definition::new(
        mesg::FIELD_DESCRIPTION,
        vec![
            FieldDef::new(0, 1, base_type::UINT8),
            FieldDef::new(1, 1, base_type::UINT8),
            FieldDef::new(2, 1, base_type::UINT8),
            FieldDef::new(3, FIELD_NAME_SIZE, base_type::STRING),
            FieldDef::new(14, 2, base_type::UINT16),
        ],
    ));
    let mut description_payload = vec![developer_index, SET_KIND_FIELD, base_type::UINT8];
    let mut name = SET_KIND_NAME.to_vec();
    name.resize(usize::from(FIELD_NAME_SIZE), 0);
    description_payload.extend_from_slice(&name);
    description_payload.extend_from_slice(&mesg::SET.to_le_bytes());

    Ok(vec![
        Record::new(DEVELOPER_LOCAL_TYPE, id_definition, id_payload)?,
        Record::new(DEVELOPER_LOCAL_TYPE, description_definition, description_payload)?,
    ])
}

/// Index of a `set_kind` declaration left by an earlier merge, if any.
fn declared_developer_index(records: &[Record]) -> Option<u8> {
    let index = records
        .iter()
        .filter(|r| r.global_number() == mesg::DEVELOPER_DATA_ID)
        .find(|r| r.field_bytes(1) == Some(&APPLICATION_ID[..]))
        .and_then(|r| r.field_u8(3))?;
    records
        .iter()
        .any(|r| {
            r.global_number() == mesg::FIELD_DESCRIPTION
                && r.field_u8(0) == Some(index)
                && r.field_u8(1) == Some(SET_KIND_FIELD)
        })
        .then_some(index)
}

/// Lowest developer data index not already declared in the recording.
fn next_developer_index(records: &[Record]) -> Option<u8> {
    let used = records
        .iter()
        .filter_map(|r| match r.global_number() {
            mesg::DEVELOPER_DATA_ID => r.field_u8(3),
            mesg::FIELD_DESCRIPTION => r.field_u8(0),
            _ => None,
        })
        .max();
    match used {
        None => Some(0),
        Some(index) => index.checked_add(1).filter(|&next| next != u8::MAX),
    }
}

fn insertion_point(records: &[Record]) -> usize {
    records
        .iter()
        .position(|r| r.global_number() == mesg::SESSION)
        .or_else(|| {
            records
                .iter()
                .position(|r| r.global_number() == mesg::ACTIVITY)
        })
        .unwrap_or(records.len())
}

fn degraded(container: FitContainer, note: Option<String>, reason: String) -> MergedRecording {
    warn!(%reason, "set records not written");
    MergedRecording {
        container,
        inserted_sets: 0,
        inserted_auxiliary: 0,
        workout_note: note,
        status: SynthesisStatus::Degraded(reason),
    }
}

/// Splice one `set` message per scheduled set into the cleaned recording,
/// as a block ahead of the session summary.
pub fn synthesize(
    cleaned: FitContainer,
    span: &RecordingSpan,
    schedule: &Schedule,
    enabled: bool,
) -> Result<MergedRecording, MergeError> {
    let note = workout_note(schedule);
    if schedule.is_empty() {
        return Ok(MergedRecording {
            container: cleaned,
            inserted_sets: 0,
            inserted_auxiliary: 0,
            workout_note: note,
            status: SynthesisStatus::Applied,
        });
    }
    if !enabled {
        return Ok(degraded(cleaned, note, "set synthesis disabled".to_string()));
    }
    let Some(start) = span.start_timestamp else {
        return Ok(degraded(
            cleaned,
            note,
            "recording has no timestamp to anchor sets".to_string(),
        ));
    };
    let (developer_index, mut block) = match declared_developer_index(&cleaned.records) {
        Some(index) => {
            debug!(index, "reusing existing set_kind declaration");
            (index, Vec::new())
        }
        None => {
            let Some(index) = next_developer_index(&cleaned.records) else {
                return Ok(degraded(
                    cleaned,
                    note,
                    "no free developer data index".to_string(),
                ));
            };
            (index, developer_records(index)?)
        }
    };

    let definition = Arc::new(set_definition(developer_index));
    let inserted_auxiliary = block.len();
    for (index, set) in schedule.sets.iter().enumerate() {
        let weight_kg = schedule.weight_unit.to_kilograms(set.weight);
        block.push(set_record(&definition, set, index, start, weight_kg)?);
    }

    let mut container = cleaned;
    if container.header.protocol_version < PROTOCOL_VERSION_2 {
        debug!(
            from = container.header.protocol_version,
            "raising protocol version for developer fields"
        );
        container.header.protocol_version = PROTOCOL_VERSION_2;
    }
    let at = insertion_point(&container.records);
    container.records.splice(at..at, block);

    info!(
        sets = schedule.len(),
        developer_index,
        position = at,
        "inserted set records"
    );
    Ok(MergedRecording {
        container,
        inserted_sets: schedule.len(),
        inserted_auxiliary,
        workout_note: note,
        status: SynthesisStatus::Applied,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::SetType;
    use crate::config::WeightUnit;
    use crate::fit;
    use crate::fixtures;
    use crate::timing::SpanSource;

    fn span(start: Option<u32>) -> RecordingSpan {
        RecordingSpan {
            duration_seconds: 100,
            total_record_count: 8,
            start_timestamp: start,
            source: SpanSource::Exact,
        }
    }

    fn garmin_set(offset: u32, reps: u32, weight: f64, set_type: SetType) -> GarminSet {
        GarminSet {
            timestamp_offset_seconds: offset,
            exercise_category: 28,
            exercise_name: 0,
            weight,
            weight_unit: 1,
            reps,
            set_number: 1,
            set_type,
            duration_seconds: 30,
            original_exercise_name: "squat".into(),
            note: String::new(),
        }
    }

    fn schedule_of(sets: Vec<GarminSet>, notes: Vec<String>) -> Schedule {
        Schedule {
            sets,
            notes,
            weight_unit: WeightUnit::Kilograms,
        }
    }

    #[test]
    fn inserts_block_before_session() {
        let cleaned = fixtures::strength_recording(4, 0);
        let categories_before = cleaned.categories();
        let schedule = schedule_of(
            vec![
                garmin_set(0, 5, 100.0, SetType::WarmUp),
                garmin_set(50, 5, 102.5, SetType::Normal),
            ],
            Vec::new(),
        );
        let merged = synthesize(cleaned, &span(Some(fixtures::START)), &schedule, true).unwrap();
        assert_eq!(merged.status, SynthesisStatus::Applied);
        assert_eq!(merged.inserted_sets, 2);
        assert_eq!(merged.inserted_auxiliary, 2);

        let records = &merged.container.records;
        // file_id, 4 samples, lap, then the block, then session and activity.
        assert_eq!(records[6].global_number(), mesg::DEVELOPER_DATA_ID);
        assert_eq!(records[7].global_number(), mesg::FIELD_DESCRIPTION);
        assert_eq!(records[8].global_number(), mesg::SET);
        assert_eq!(records[9].global_number(), mesg::SET);
        assert_eq!(records[10].global_number(), mesg::SESSION);

        let preserved: Vec<_> = records
            .iter()
            .filter(|r| !matches!(r.global_number(), mesg::SET | mesg::DEVELOPER_DATA_ID | mesg::FIELD_DESCRIPTION))
            .map(|r| r.category())
            .collect();
        assert_eq!(preserved, categories_before);

        let second = &records[9];
        assert_eq!(second.field_u32(set_field::TIMESTAMP), Some(fixtures::START + 50));
        assert_eq!(second.field_u32(set_field::START_TIME), Some(fixtures::START + 50));
        assert_eq!(second.field_u16(set_field::WEIGHT), Some(1640));
        assert_eq!(second.field_u16(set_field::REPETITIONS), Some(5));
        assert_eq!(second.field_u32(set_field::DURATION), Some(30_000));
        assert_eq!(second.field_u16(set_field::MESSAGE_INDEX), Some(1));
        assert_eq!(second.payload().last(), Some(&0));
        assert_eq!(records[8].payload().last(), Some(&2));
    }

    #[test]
    fn output_decodes_with_profile_decoder() {
        let cleaned = fixtures::strength_recording(3, 0);
        let schedule = schedule_of(vec![garmin_set(10, 8, 60.0, SetType::Failure)], Vec::new());
        let merged = synthesize(cleaned, &span(Some(fixtures::START)), &schedule, true).unwrap();
        let bytes = fit::encode(&merged.container).unwrap();

        let decoded = fit::decode(&bytes).unwrap();
        assert_eq!(decoded.len(), merged.container.len());
        let messages = fitparser::de::from_bytes(&bytes).unwrap();
        assert!(messages
            .iter()
            .any(|m| m.kind() == fitparser::profile::MesgNum::Set));
    }

    #[test]
    fn set_timestamp_is_the_profile_timestamp_field() {
        let cleaned = fixtures::strength_recording(3, 0);
        let schedule = schedule_of(vec![garmin_set(10, 8, 60.0, SetType::Normal)], Vec::new());
        let merged = synthesize(cleaned, &span(Some(fixtures::START)), &schedule, true).unwrap();
        let bytes = fit::encode(&merged.container).unwrap();

        let messages = fitparser::de::from_bytes(&bytes).unwrap();
        let set = messages
            .iter()
            .find(|m| m.kind() == fitparser::profile::MesgNum::Set)
            .unwrap();
        let timestamp = set
            .fields()
            .iter()
            .find(|f| f.name() == "timestamp")
            .map(|f| f.value().clone());
        match timestamp {
            Some(fitparser::Value::Timestamp(at)) => assert_eq!(
                at.timestamp(),
                fit::FIT_EPOCH_OFFSET + i64::from(fixtures::START + 10)
            ),
            other => panic!("set has no timestamp field: {other:?}"),
        }
        assert!(set.fields().iter().all(|f| !f.name().starts_with("unknown_field")));
    }

    #[test]
    fn pounds_are_converted_to_kilograms() {
        let cleaned = fixtures::strength_recording(2, 0);
        let mut schedule = schedule_of(vec![garmin_set(0, 5, 100.0, SetType::Normal)], Vec::new());
        schedule.weight_unit = WeightUnit::Pounds;
        let merged = synthesize(cleaned, &span(Some(fixtures::START)), &schedule, true).unwrap();
        let set = merged
            .container
            .records
            .iter()
            .find(|r| r.global_number() == mesg::SET)
            .unwrap();
        // 45.359237 kg * 16 = 725.7
        assert_eq!(set.field_u16(set_field::WEIGHT), Some(726));
    }

    #[test]
    fn empty_schedule_leaves_stream_unchanged() {
        let cleaned = fixtures::strength_recording(5, 0);
        let merged = synthesize(cleaned.clone(), &span(Some(fixtures::START)), &Schedule::default(), true).unwrap();
        assert_eq!(merged.container, cleaned);
        assert_eq!(merged.status, SynthesisStatus::Applied);
        assert_eq!(merged.workout_note, None);
    }

    #[test]
    fn missing_anchor_degrades() {
        let cleaned = fixtures::strength_recording(2, 0);
        let schedule = schedule_of(
            vec![garmin_set(0, 5, 100.0, SetType::Normal)],
            vec!["\nSquat - Set 1: easy".into()],
        );
        let merged = synthesize(cleaned.clone(), &span(None), &schedule, true).unwrap();
        assert!(matches!(merged.status, SynthesisStatus::Degraded(_)));
        assert_eq!(merged.container, cleaned);
        assert!(merged.workout_note.is_some());

        let disabled = synthesize(cleaned.clone(), &span(Some(fixtures::START)), &schedule, false).unwrap();
        assert!(matches!(disabled.status, SynthesisStatus::Degraded(_)));
        assert_eq!(disabled.container, cleaned);
    }

    #[test]
    fn falls_back_to_activity_then_end() {
        let records = vec![fixtures::file_id(), fixtures::sample(fixtures::START, 80), fixtures::activity(fixtures::START)];
        assert_eq!(insertion_point(&records), 2);
        assert_eq!(insertion_point(&records[..2]), 2);
    }

    #[test]
    fn developer_index_skips_existing_declarations() {
        let records = developer_records(0).unwrap();
        assert_eq!(next_developer_index(&records), Some(1));
        assert_eq!(next_developer_index(&[]), Some(0));
    }

    #[test]
    fn merging_twice_reuses_developer_declaration() {
        let schedule = schedule_of(vec![garmin_set(10, 8, 60.0, SetType::Normal)], Vec::new());
        let first = synthesize(
            fixtures::strength_recording(3, 0),
            &span(Some(fixtures::START)),
            &schedule,
            true,
        )
        .unwrap();
        let recleaned = crate::clean::clean(first.container.records);
        assert_eq!(recleaned.removed_count, 1);

        let again = synthesize(
            FitContainer::new(first.container.header, recleaned.records),
            &span(Some(fixtures::START)),
            &schedule,
            true,
        )
        .unwrap();
        assert_eq!(again.inserted_sets, 1);
        assert_eq!(again.inserted_auxiliary, 0);
        let count = |number: u16| {
            again
                .container
                .records
                .iter()
                .filter(|r| r.global_number() == number)
                .count()
        };
        assert_eq!(count(mesg::DEVELOPER_DATA_ID), 1);
        assert_eq!(count(mesg::FIELD_DESCRIPTION), 1);
        assert_eq!(count(mesg::SET), 1);
        assert_eq!(declared_developer_index(&again.container.records), Some(0));
    }

    #[test]
    fn workout_note_layout() {
        let mut first = garmin_set(0, 5, 100.0, SetType::Normal);
        first.original_exercise_name = "bench press".into();
        let schedule = schedule_of(
            vec![first, garmin_set(10, 8, 60.0, SetType::Normal)],
            vec!["\nBench Press - Set 1: paused".into()],
        );
        assert_eq!(
            workout_note(&schedule).unwrap(),
            "Hevy Workout Integration:\n• 2 exercises\n• 2 total sets\n• 13 total reps\n\nSet Notes:\nBench Press - Set 1: paused"
        );
    }
}
