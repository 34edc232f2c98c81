//! FIT container framing: file header, definition and data messages, CRC.
//!
//! Data message payloads are kept as raw bytes so that records passing
//! through a merge are written back bit-identical. Profile-level decoding of
//! field values is left to `fitparser`; this module only reads the few
//! fields the merge needs (timestamps, developer data indices).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use fitparser::profile::MesgNum;

use crate::MergeError;

/// Seconds between the Unix epoch and the FIT epoch (1989-12-31T00:00:00Z).
pub const FIT_EPOCH_OFFSET: i64 = 631_065_600;
pub const TIMESTAMP_FIELD: u8 = 253;
pub const PROTOCOL_VERSION_2: u8 = 0x20;

const HEADER_SIZE_SHORT: u8 = 12;
const HEADER_SIZE_LONG: u8 = 14;
const SIGNATURE: &[u8; 4] = b".FIT";
const COMPRESSED_HEADER: u8 = 0x80;
const DEFINITION_HEADER: u8 = 0x40;
const DEVELOPER_FLAG: u8 = 0x20;
const LOCAL_TYPE_MASK: u8 = 0x0F;
const COMPRESSED_LOCAL_MAX: u8 = 0x03;
const COMPRESSED_OFFSET_MASK: u8 = 0x1F;
const MFG_RANGE_MIN: u16 = 0xFF00;

/// Global message numbers the merge refers to directly.
pub mod mesg {
    pub const FILE_ID: u16 = 0;
    pub const SESSION: u16 = 18;
    pub const LAP: u16 = 19;
    pub const RECORD: u16 = 20;
    pub const ACTIVITY: u16 = 34;
    pub const FIELD_DESCRIPTION: u16 = 206;
    pub const DEVELOPER_DATA_ID: u16 = 207;
    pub const SET: u16 = 225;
}

/// FIT base type identifiers.
pub mod base_type {
    pub const ENUM: u8 = 0x00;
    pub const UINT8: u8 = 0x02;
    pub const UINT16: u8 = 0x84;
    pub const UINT32: u8 = 0x86;
    pub const STRING: u8 = 0x07;
    pub const BYTE: u8 = 0x0D;
}

const CRC_TABLE: [u16; 16] = [
    0x0000, 0xCC01, 0xD801, 0x1400, 0xF001, 0x3C00, 0x2800, 0xE401, 0xA001, 0x6C00, 0x7800,
    0xB401, 0x5000, 0x9C01, 0x8801, 0x4400,
];

/// FIT CRC-16, processed a nibble at a time.
pub fn crc16(mut crc: u16, bytes: &[u8]) -> u16 {
    for &byte in bytes {
        for nibble in [byte & 0x0F, byte >> 4] {
            let tmp = CRC_TABLE[usize::from(crc & 0x0F)];
            crc = (crc >> 4) & 0x0FFF;
            crc = crc ^ tmp ^ CRC_TABLE[usize::from(nibble)];
        }
    }
    crc
}

/// Convert a FIT timestamp to UTC.
pub fn to_datetime(timestamp: u32) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(FIT_EPOCH_OFFSET + i64::from(timestamp), 0)
}

/// Profile message name for a global message number, if the profile knows it.
pub fn category_label(global_number: u16) -> Option<String> {
    if global_number >= MFG_RANGE_MIN {
        return None;
    }
    match MesgNum::from(global_number) {
        MesgNum::Value(_) => None,
        kind => Some(kind.to_string()),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldDef {
    pub number: u8,
    pub size: u8,
    pub base_type: u8,
}

impl FieldDef {
    pub const fn new(number: u8, size: u8, base_type: u8) -> Self {
        Self {
            number,
            size,
            base_type,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeveloperFieldDef {
    pub number: u8,
    pub size: u8,
    pub developer_index: u8,
}

/// Layout of the data messages bound to one local message type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Definition {
    pub big_endian: bool,
    pub global_number: u16,
    pub fields: Vec<FieldDef>,
    pub developer_fields: Vec<DeveloperFieldDef>,
}

impl Definition {
    pub fn new(global_number: u16, fields: Vec<FieldDef>) -> Self {
        Self {
            big_endian: false,
            global_number,
            fields,
            developer_fields: Vec::new(),
        }
    }

    pub fn with_developer_fields(mut self, developer_fields: Vec<DeveloperFieldDef>) -> Self {
        self.developer_fields = developer_fields;
        self
    }

    pub fn data_size(&self) -> usize {
        let native: usize = self.fields.iter().map(|f| usize::from(f.size)).sum();
        let developer: usize = self
            .developer_fields
            .iter()
            .map(|f| usize::from(f.size))
            .sum();
        native + developer
    }

    fn locate(&self, number: u8) -> Option<(usize, FieldDef)> {
        let mut offset = 0usize;
        for field in &self.fields {
            if field.number == number {
                return Some((offset, *field));
            }
            offset += usize::from(field.size);
        }
        None
    }

    fn write(&self, local_type: u8, out: &mut Vec<u8>) -> Result<(), MergeError> {
        let field_count = u8::try_from(self.fields.len())
            .map_err(|_| MergeError::FitEncode("definition has more than 255 fields".into()))?;
        let developer_count = u8::try_from(self.developer_fields.len()).map_err(|_| {
            MergeError::FitEncode("definition has more than 255 developer fields".into())
        })?;

        let mut header = DEFINITION_HEADER | (local_type & LOCAL_TYPE_MASK);
        if developer_count > 0 {
            header |= DEVELOPER_FLAG;
        }
        out.push(header);
        out.push(0);
        out.push(u8::from(self.big_endian));
        if self.big_endian {
            out.extend_from_slice(&self.global_number.to_be_bytes());
        } else {
            out.extend_from_slice(&self.global_number.to_le_bytes());
        }
        out.push(field_count);
        for field in &self.fields {
            out.extend_from_slice(&[field.number, field.size, field.base_type]);
        }
        if developer_count > 0 {
            out.push(developer_count);
            for field in &self.developer_fields {
                out.extend_from_slice(&[field.number, field.size, field.developer_index]);
            }
        }
        Ok(())
    }
}

/// One FIT data message.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    local_type: u8,
    time_offset: Option<u8>,
    definition: Arc<Definition>,
    payload: Vec<u8>,
    timestamp: Option<u32>,
}

impl Record {
    pub fn new(
        local_type: u8,
        definition: Arc<Definition>,
        payload: Vec<u8>,
    ) -> Result<Self, MergeError> {
        if local_type > LOCAL_TYPE_MASK {
            return Err(MergeError::FitEncode(format!(
                "local message type {local_type} out of range"
            )));
        }
        if payload.len() != definition.data_size() {
            return Err(MergeError::FitEncode(format!(
                "payload of {} bytes does not match definition size {} for message {}",
                payload.len(),
                definition.data_size(),
                definition.global_number
            )));
        }
        let mut record = Self {
            local_type,
            time_offset: None,
            definition,
            payload,
            timestamp: None,
        };
        record.timestamp = record.field_u32(TIMESTAMP_FIELD);
        Ok(record)
    }

    pub fn local_type(&self) -> u8 {
        self.local_type
    }

    pub fn global_number(&self) -> u16 {
        self.definition.global_number
    }

    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Profile message name (`record`, `session`, `set`, ...), if known.
    pub fn category(&self) -> Option<String> {
        category_label(self.global_number())
    }

    /// Absolute FIT timestamp, from field 253 or a compressed header.
    pub fn timestamp(&self) -> Option<u32> {
        self.timestamp
    }

    pub fn has_compressed_timestamp(&self) -> bool {
        self.time_offset.is_some()
    }

    pub fn field_bytes(&self, number: u8) -> Option<&[u8]> {
        let (offset, field) = self.definition.locate(number)?;
        self.payload.get(offset..offset + usize::from(field.size))
    }

    pub fn field_u8(&self, number: u8) -> Option<u8> {
        let bytes = self.field_bytes(number)?;
        match bytes.first() {
            Some(&value) if value != u8::MAX => Some(value),
            _ => None,
        }
    }

    pub fn field_u16(&self, number: u8) -> Option<u16> {
        let bytes = self.field_bytes(number)?;
        let raw = [*bytes.first()?, *bytes.get(1)?];
        let value = if self.definition.big_endian {
            u16::from_be_bytes(raw)
        } else {
            u16::from_le_bytes(raw)
        };
        (value != u16::MAX).then_some(value)
    }

    pub fn field_u32(&self, number: u8) -> Option<u32> {
        let bytes = self.field_bytes(number)?;
        let raw = [
            *bytes.first()?,
            *bytes.get(1)?,
            *bytes.get(2)?,
            *bytes.get(3)?,
        ];
        let value = if self.definition.big_endian {
            u32::from_be_bytes(raw)
        } else {
            u32::from_le_bytes(raw)
        };
        (value != u32::MAX).then_some(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FitHeader {
    pub header_size: u8,
    pub protocol_version: u8,
    pub profile_version: u16,
}

impl Default for FitHeader {
    fn default() -> Self {
        Self {
            header_size: HEADER_SIZE_LONG,
            protocol_version: PROTOCOL_VERSION_2,
            profile_version: 2132,
        }
    }
}

/// A decoded FIT file: its header and the data messages in file order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FitContainer {
    pub header: FitHeader,
    pub records: Vec<Record>,
}

impl FitContainer {
    pub fn new(header: FitHeader, records: Vec<Record>) -> Self {
        Self { header, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn categories(&self) -> Vec<Option<String>> {
        self.records.iter().map(Record::category).collect()
    }
}

fn decode_error(message: impl Into<String>) -> MergeError {
    MergeError::FitDecode(message.into())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], MergeError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| decode_error(format!("truncated message at data offset {}", self.pos)))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn byte(&mut self) -> Result<u8, MergeError> {
        Ok(self.take(1)?[0])
    }
}

/// Decode a single (non-chained) FIT file, verifying header and file CRCs.
pub fn decode(input: &[u8]) -> Result<FitContainer, MergeError> {
    if input.len() < usize::from(HEADER_SIZE_SHORT) {
        return Err(decode_error("file is shorter than a FIT header"));
    }
    let header_size = input[0];
    if header_size != HEADER_SIZE_SHORT && header_size != HEADER_SIZE_LONG {
        return Err(decode_error(format!("unsupported header size {header_size}")));
    }
    let header_len = usize::from(header_size);
    if input.len() < header_len {
        return Err(decode_error("file is shorter than its declared header"));
    }
    if &input[8..12] != SIGNATURE {
        return Err(decode_error("missing .FIT signature"));
    }
    let header = FitHeader {
        header_size,
        protocol_version: input[1],
        profile_version: u16::from_le_bytes([input[2], input[3]]),
    };
    if header_size == HEADER_SIZE_LONG {
        let stored = u16::from_le_bytes([input[12], input[13]]);
        if stored != 0 {
            let computed = crc16(0, &input[..12]);
            if stored != computed {
                return Err(MergeError::Checksum { stored, computed });
            }
        }
    }

    let data_size = u32::from_le_bytes([input[4], input[5], input[6], input[7]]) as usize;
    let data_end = header_len
        .checked_add(data_size)
        .ok_or_else(|| decode_error("declared data size overflows"))?;
    if input.len() < data_end + 2 {
        return Err(decode_error(format!(
            "file truncated: header declares {data_size} data bytes, {} available",
            input.len().saturating_sub(header_len + 2)
        )));
    }
    let stored = u16::from_le_bytes([input[data_end], input[data_end + 1]]);
    let computed = crc16(0, &input[..data_end]);
    if stored != computed {
        return Err(MergeError::Checksum { stored, computed });
    }
    if input.len() > data_end + 2 {
        return Err(decode_error("chained FIT files are not supported"));
    }

    let records = decode_messages(&input[header_len..data_end])?;
    Ok(FitContainer { header, records })
}

fn decode_messages(data: &[u8]) -> Result<Vec<Record>, MergeError> {
    let mut cursor = Cursor::new(data);
    let mut slots: [Option<Arc<Definition>>; 16] = Default::default();
    let mut records = Vec::new();
    let mut last_timestamp: Option<u32> = None;

    while !cursor.is_empty() {
        let offset = cursor.pos;
        let header = cursor.byte()?;
        if header & COMPRESSED_HEADER != 0 {
            let local_type = (header >> 5) & COMPRESSED_LOCAL_MAX;
            let time_offset = header & COMPRESSED_OFFSET_MASK;
            let definition = slot(&slots, local_type, offset)?;
            let payload = cursor.take(definition.data_size())?.to_vec();
            let timestamp = last_timestamp.map(|reference| expand_compressed(reference, time_offset));
            if timestamp.is_some() {
                last_timestamp = timestamp;
            }
            records.push(Record {
                local_type,
                time_offset: Some(time_offset),
                definition,
                payload,
                timestamp,
            });
        } else if header & DEFINITION_HEADER != 0 {
            let local_type = header & LOCAL_TYPE_MASK;
            let definition = read_definition(&mut cursor, header & DEVELOPER_FLAG != 0)?;
            slots[usize::from(local_type)] = Some(Arc::new(definition));
        } else {
            let local_type = header & LOCAL_TYPE_MASK;
            let definition = slot(&slots, local_type, offset)?;
            let payload = cursor.take(definition.data_size())?.to_vec();
            let mut record = Record {
                local_type,
                time_offset: None,
                definition,
                payload,
                timestamp: None,
            };
            record.timestamp = record.field_u32(TIMESTAMP_FIELD);
            if record.timestamp.is_some() {
                last_timestamp = record.timestamp;
            }
            records.push(record);
        }
    }
    Ok(records)
}

fn slot(
    slots: &[Option<Arc<Definition>>; 16],
    local_type: u8,
    offset: usize,
) -> Result<Arc<Definition>, MergeError> {
    slots[usize::from(local_type)].clone().ok_or_else(|| {
        decode_error(format!(
            "data message at offset {offset} uses undefined local type {local_type}"
        ))
    })
}

fn read_definition(cursor: &mut Cursor<'_>, has_developer: bool) -> Result<Definition, MergeError> {
    let _reserved = cursor.byte()?;
    let big_endian = match cursor.byte()? {
        0 => false,
        1 => true,
        other => return Err(decode_error(format!("unknown architecture byte {other}"))),
    };
    let raw = cursor.take(2)?;
    let global_number = if big_endian {
        u16::from_be_bytes([raw[0], raw[1]])
    } else {
        u16::from_le_bytes([raw[0], raw[1]])
    };
    let count = cursor.byte()?;
    let mut fields = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let raw = cursor.take(3)?;
        fields.push(FieldDef::new(raw[0], raw[1], raw[2]));
    }
    let mut developer_fields = Vec::new();
    if has_developer {
        let count = cursor.byte()?;
        for _ in 0..count {
            let raw = cursor.take(3)?;
            developer_fields.push(DeveloperFieldDef {
                number: raw[0],
                size: raw[1],
                developer_index: raw[2],
            });
        }
    }
    Ok(Definition {
        big_endian,
        global_number,
        fields,
        developer_fields,
    })
}

fn expand_compressed(reference: u32, time_offset: u8) -> u32 {
    let offset = u32::from(time_offset);
    let rollover = if offset < (reference & u32::from(COMPRESSED_OFFSET_MASK)) {
        0x20
    } else {
        0
    };
    (reference & !u32::from(COMPRESSED_OFFSET_MASK))
        .wrapping_add(offset)
        .wrapping_add(rollover)
}

/// Encode a container, emitting a definition message whenever the layout
/// bound to a local message type changes.
pub fn encode(container: &FitContainer) -> Result<Vec<u8>, MergeError> {
    let mut data = Vec::new();
    let mut slots: [Option<Arc<Definition>>; 16] = Default::default();

    for record in &container.records {
        let slot = &mut slots[usize::from(record.local_type)];
        if slot.as_deref() != Some(record.definition.as_ref()) {
            record.definition.write(record.local_type, &mut data)?;
            *slot = Some(Arc::clone(&record.definition));
        }
        let header = match record.time_offset {
            Some(offset) => {
                if record.local_type > COMPRESSED_LOCAL_MAX {
                    return Err(MergeError::FitEncode(format!(
                        "compressed timestamp header with local type {}",
                        record.local_type
                    )));
                }
                COMPRESSED_HEADER | (record.local_type << 5) | (offset & COMPRESSED_OFFSET_MASK)
            }
            None => record.local_type,
        };
        data.push(header);
        data.extend_from_slice(&record.payload);
    }

    let data_size = u32::try_from(data.len())
        .map_err(|_| MergeError::FitEncode("data section exceeds 4 GiB".into()))?;
    let header_size = if container.header.header_size == HEADER_SIZE_SHORT {
        HEADER_SIZE_SHORT
    } else {
        HEADER_SIZE_LONG
    };

    let mut out = Vec::with_capacity(usize::from(header_size) + data.len() + 2);
    out.push(header_size);
    out.push(container.header.protocol_version);
    out.extend_from_slice(&container.header.profile_version.to_le_bytes());
    out.extend_from_slice(&data_size.to_le_bytes());
    out.extend_from_slice(SIGNATURE);
    if header_size == HEADER_SIZE_LONG {
        let header_crc = crc16(0, &out);
        out.extend_from_slice(&header_crc.to_le_bytes());
    }
    out.extend_from_slice(&data);
    let file_crc = crc16(0, &out);
    out.extend_from_slice(&file_crc.to_le_bytes());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[test]
    fn crc_matches_reference_check_value() {
        assert_eq!(crc16(0, b"123456789"), 0xBB3D);
        assert_eq!(crc16(0, b""), 0);
    }

    #[test]
    fn round_trip_keeps_category_sequence_and_payloads() {
        let records = vec![
            fixtures::file_id(),
            fixtures::sample(fixtures::START, 90),
            fixtures::lap(fixtures::START + 30),
            fixtures::session(fixtures::START, fixtures::START + 30),
            fixtures::activity(fixtures::START + 30),
        ];
        let container = fixtures::container(records);
        let bytes = encode(&container).unwrap();
        let decoded = decode(&bytes).unwrap();

        assert_eq!(decoded.categories(), container.categories());
        assert_eq!(
            decoded.categories(),
            vec![
                Some("file_id".to_string()),
                Some("record".to_string()),
                Some("lap".to_string()),
                Some("session".to_string()),
                Some("activity".to_string()),
            ]
        );
        for (before, after) in container.records.iter().zip(&decoded.records) {
            assert_eq!(before.payload(), after.payload());
        }
        assert_eq!(encode(&decoded).unwrap(), bytes);
    }

    #[test]
    fn rejects_corrupted_crc() {
        let mut bytes = encode(&fixtures::strength_recording(3, 1)).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(decode(&bytes), Err(MergeError::Checksum { .. })));
    }

    #[test]
    fn rejects_missing_signature() {
        let mut bytes = encode(&fixtures::strength_recording(3, 0)).unwrap();
        bytes[8] = b'X';
        assert!(matches!(decode(&bytes), Err(MergeError::FitDecode(_))));
    }

    #[test]
    fn rejects_trailing_chained_file() {
        let mut bytes = encode(&fixtures::strength_recording(2, 0)).unwrap();
        let again = bytes.clone();
        bytes.extend_from_slice(&again);
        let err = decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("chained"));
    }

    #[test]
    fn rejects_data_for_undefined_local_type() {
        let data = [0x03u8, 0x00];
        let err = decode_messages(&data).unwrap_err();
        assert!(err.to_string().contains("undefined local type 3"));
    }

    #[test]
    fn reads_big_endian_fields() {
        let mut definition = Definition::new(
            mesg::RECORD,
            vec![FieldDef::new(TIMESTAMP_FIELD, 4, base_type::UINT32)],
        );
        definition.big_endian = true;
        let record =
            Record::new(1, Arc::new(definition), 1_000_000u32.to_be_bytes().to_vec()).unwrap();
        assert_eq!(record.timestamp(), Some(1_000_000));

        let container = fixtures::container(vec![record]);
        let decoded = decode(&encode(&container).unwrap()).unwrap();
        assert_eq!(decoded.records[0].timestamp(), Some(1_000_000));
    }

    #[test]
    fn expands_compressed_timestamps() {
        let definition = Arc::new(Definition::new(
            mesg::RECORD,
            vec![FieldDef::new(3, 1, base_type::UINT8)],
        ));
        let full = fixtures::sample(1_000, 80);
        let mut compressed = Record::new(0, Arc::clone(&definition), vec![81]).unwrap();
        // 1000 = 0b1111101000: low five bits are 8, so offset 4 rolls over.
        compressed.time_offset = Some(4);
        let container = fixtures::container(vec![full, compressed]);

        let decoded = decode(&encode(&container).unwrap()).unwrap();
        assert!(decoded.records[1].has_compressed_timestamp());
        assert_eq!(decoded.records[1].timestamp(), Some(1_000 - 8 + 4 + 32));
    }

    #[test]
    fn invalid_field_values_read_as_none() {
        let record = fixtures::sample(u32::MAX, 0xFF);
        assert_eq!(record.timestamp(), None);
        assert_eq!(record.field_u8(3), None);
    }

    #[test]
    fn record_rejects_payload_size_mismatch() {
        let definition = Arc::new(Definition::new(
            mesg::RECORD,
            vec![FieldDef::new(TIMESTAMP_FIELD, 4, base_type::UINT32)],
        ));
        assert!(Record::new(0, definition, vec![0, 1]).is_err());
    }

    #[test]
    fn unknown_global_numbers_have_no_label() {
        assert_eq!(category_label(0xFF10), None);
        assert_eq!(category_label(mesg::SET).as_deref(), Some("set"));
    }

    #[test]
    fn fit_epoch_conversion() {
        let dt = to_datetime(0).unwrap();
        assert_eq!(dt.to_rfc3339(), "1989-12-31T00:00:00+00:00");
    }
}
