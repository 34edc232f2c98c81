use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{MergeError, MergeWarning};

const MISSING_TOKEN: &str = "nan";

/// One CSV row keyed by column header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawRow {
    cells: HashMap<String, String>,
}

impl RawRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &str, value: &str) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: &str, value: &str) {
        self.cells.insert(column.to_string(), value.to_string());
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.cells.get(column).map(String::as_str)
    }

    /// Trimmed cell value; empty cells and `nan` read as missing.
    pub fn cell(&self, column: &str) -> Option<&str> {
        let value = self.get(column)?.trim();
        if value.is_empty() || value.eq_ignore_ascii_case(MISSING_TOKEN) {
            None
        } else {
            Some(value)
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RawRow {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            cells: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Which CSV columns hold each set attribute.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMap {
    pub exercise_name: String,
    pub set_number: String,
    pub reps: String,
    pub weight: String,
    pub set_note: String,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            exercise_name: "Exercise Name".to_string(),
            set_number: "Set Order".to_string(),
            reps: "Reps".to_string(),
            weight: "Weight".to_string(),
            set_note: "Notes".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ParsedSet {
    /// Lowercased and trimmed.
    pub exercise_name: String,
    pub set_number: u32,
    pub reps: u32,
    pub weight: f64,
    pub note: String,
    pub source_row_index: usize,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParseOutcome {
    pub sets: Vec<ParsedSet>,
    pub warnings: Vec<MergeWarning>,
}

/// Read a headed CSV export into rows.
pub fn read_rows<R: Read>(reader: R) -> Result<Vec<RawRow>, MergeError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = csv_reader.headers()?.clone();
    let mut rows: Vec<RawRow> = Vec::new();
    for record in csv_reader.records() {
        let record = record?;
        rows.push(
            headers
                .iter()
                .zip(record.iter())
                .map(|(h, v)| (h.to_string(), v.to_string()))
                .collect(),
        );
    }
    debug!(rows = rows.len(), "read workout CSV");
    Ok(rows)
}

pub fn read_rows_path(path: &Path) -> Result<Vec<RawRow>, MergeError> {
    let file = File::open(path)?;
    read_rows(file)
}

fn parse_count(text: &str) -> Result<u64, String> {
    if let Ok(value) = text.parse::<i64>() {
        return u64::try_from(value).map_err(|_| format!("negative value '{text}'"));
    }
    match text.parse::<f64>() {
        Ok(value) if !value.is_finite() => Err(format!("non-finite value '{text}'")),
        Ok(value) if value < 0.0 => Err(format!("negative value '{text}'")),
        Ok(value) => Ok(value.trunc() as u64),
        Err(_) => Err(format!("not a number: '{text}'")),
    }
}

fn parse_u32(text: &str, column: &str) -> Result<u32, String> {
    let value = parse_count(text).map_err(|e| format!("{column}: {e}"))?;
    u32::try_from(value).map_err(|_| format!("{column}: value '{text}' out of range"))
}

fn parse_weight(text: &str, column: &str) -> Result<f64, String> {
    match text.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => Ok(value),
        Ok(_) => Err(format!("{column}: weight '{text}' must be a non-negative number")),
        Err(_) => Err(format!("{column}: not a number: '{text}'")),
    }
}

fn parse_row(row: &RawRow, name: &str, columns: &ColumnMap, index: usize) -> Result<ParsedSet, String> {
    let set_number = match row.cell(&columns.set_number) {
        Some(text) => parse_u32(text, &columns.set_number)?,
        None => 1,
    };
    if set_number < 1 {
        return Err(format!("{}: set number must be at least 1", columns.set_number));
    }
    let reps = match row.cell(&columns.reps) {
        Some(text) => parse_u32(text, &columns.reps)?,
        None => 0,
    };
    let weight = match row.cell(&columns.weight) {
        Some(text) => parse_weight(text, &columns.weight)?,
        None => 0.0,
    };
    let note = row.cell(&columns.set_note).unwrap_or_default().to_string();
    Ok(ParsedSet {
        exercise_name: name.to_lowercase(),
        set_number,
        reps,
        weight,
        note,
        source_row_index: index,
    })
}

/// Turn raw rows into sets, keeping row order. Rows without an exercise
/// name are skipped silently; rows whose numbers cannot be coerced are
/// skipped with a warning.
pub fn parse(rows: &[RawRow], columns: &ColumnMap) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();
    let mut last_set: HashMap<String, u32> = HashMap::new();

    for (index, row) in rows.iter().enumerate() {
        let Some(name) = row.cell(&columns.exercise_name) else {
            continue;
        };
        match parse_row(row, name, columns, index) {
            Ok(set) => {
                if let Some(&previous) = last_set.get(&set.exercise_name) {
                    if set.set_number <= previous {
                        warn!(
                            exercise = %set.exercise_name,
                            set_number = set.set_number,
                            previous,
                            "set order is not increasing"
                        );
                        outcome.warnings.push(MergeWarning::SetOrder {
                            exercise: set.exercise_name.clone(),
                            set_number: set.set_number,
                            row: index,
                        });
                    }
                }
                last_set.insert(set.exercise_name.clone(), set.set_number);
                outcome.sets.push(set);
            }
            Err(reason) => {
                warn!(row = index, %reason, "skipping workout row");
                outcome.warnings.push(MergeWarning::RowSkipped { row: index, reason });
            }
        }
    }
    outcome
}
