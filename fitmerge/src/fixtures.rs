//! Synthetic FIT recordings shared by the unit tests.

use std::sync::Arc;

use crate::fit::{base_type, mesg, Definition, FieldDef, FitContainer, FitHeader, Record, TIMESTAMP_FIELD};

pub const START: u32 = 1_000_000_000;

pub fn definition(global_number: u16, fields: &[(u8, u8, u8)]) -> Arc<Definition> {
    Arc::new(Definition::new(
        global_number,
        fields
            .iter()
            .map(|&(number, size, base)| FieldDef::new(number, size, base))
            .collect(),
    ))
}

fn build(local_type: u8, definition: Arc<Definition>, payload: Vec<u8>) -> Record {
    Record::new(local_type, definition, payload).expect("fixture record is well formed")
}

fn timestamp_only(local_type: u8, global_number: u16, timestamp: u32) -> Record {
    build(
        local_type,
        definition(global_number, &[(TIMESTAMP_FIELD, 4, base_type::UINT32)]),
        timestamp.to_le_bytes().to_vec(),
    )
}

pub fn file_id() -> Record {
    let mut payload = vec![4u8];
    payload.extend_from_slice(&12345u32.to_le_bytes());
    build(
        0,
        definition(mesg::FILE_ID, &[(0, 1, base_type::ENUM), (4, 4, base_type::UINT32)]),
        payload,
    )
}

pub fn sample(timestamp: u32, heart_rate: u8) -> Record {
    let mut payload = timestamp.to_le_bytes().to_vec();
    payload.push(heart_rate);
    build(
        1,
        definition(
            mesg::RECORD,
            &[(TIMESTAMP_FIELD, 4, base_type::UINT32), (3, 1, base_type::UINT8)],
        ),
        payload,
    )
}

pub fn strength_set(timestamp: u32, reps: u16) -> Record {
    let mut payload = timestamp.to_le_bytes().to_vec();
    payload.extend_from_slice(&reps.to_le_bytes());
    build(
        2,
        definition(
            mesg::SET,
            &[(TIMESTAMP_FIELD, 4, base_type::UINT32), (3, 2, base_type::UINT16)],
        ),
        payload,
    )
}

pub fn lap(timestamp: u32) -> Record {
    timestamp_only(3, mesg::LAP, timestamp)
}

pub fn session(start: u32, end: u32) -> Record {
    let mut payload = end.to_le_bytes().to_vec();
    payload.extend_from_slice(&start.to_le_bytes());
    build(
        4,
        definition(
            mesg::SESSION,
            &[(TIMESTAMP_FIELD, 4, base_type::UINT32), (2, 4, base_type::UINT32)],
        ),
        payload,
    )
}

pub fn activity(timestamp: u32) -> Record {
    timestamp_only(5, mesg::ACTIVITY, timestamp)
}

pub fn container(records: Vec<Record>) -> FitContainer {
    FitContainer::new(FitHeader::default(), records)
}

/// file_id, `samples` one-second records, `sets` strength sets, then lap,
/// session and activity: `samples + sets + 4` messages.
pub fn strength_recording(samples: usize, sets: usize) -> FitContainer {
    let mut records = vec![file_id()];
    let mut ts = START;
    for i in 0..samples {
        ts = START + i as u32;
        records.push(sample(ts, 100 + (i % 50) as u8));
    }
    for i in 0..sets {
        records.push(strength_set(ts, 8 + i as u16));
    }
    records.push(lap(ts));
    records.push(session(START, ts));
    records.push(activity(ts));
    container(records)
}
