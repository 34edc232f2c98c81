use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::classify::KeywordTable;
use crate::exercise::MappingTable;
use crate::sets::ColumnMap;
use crate::MergeError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WeightUnit {
    #[default]
    #[serde(rename = "kg", alias = "kilograms")]
    Kilograms,
    #[serde(rename = "lbs", alias = "lb", alias = "pounds")]
    Pounds,
}

impl WeightUnit {
    /// Key used in the weight-unit id map.
    pub fn key(self) -> &'static str {
        match self {
            WeightUnit::Kilograms => "kg",
            WeightUnit::Pounds => "lbs",
        }
    }

    pub fn to_kilograms(self, weight: f64) -> f64 {
        match self {
            WeightUnit::Kilograms => weight,
            WeightUnit::Pounds => weight * 0.453_592_37,
        }
    }
}

impl fmt::Display for WeightUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for WeightUnit {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kg" | "kilograms" => Ok(WeightUnit::Kilograms),
            "lb" | "lbs" | "pounds" => Ok(WeightUnit::Pounds),
            other => Err(MergeError::InvalidSetting(format!(
                "unknown weight unit '{other}'"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingMode {
    /// Last timestamp minus first.
    #[default]
    Exact,
    /// Record count times a nominal sample interval, with a floor.
    Estimate,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingOptions {
    pub mode: TimingMode,
    pub fallback_duration_seconds: u32,
    pub estimate_floor_seconds: u32,
    pub seconds_per_record: u32,
}

impl Default for TimingOptions {
    fn default() -> Self {
        Self {
            mode: TimingMode::Exact,
            fallback_duration_seconds: 3600,
            estimate_floor_seconds: 1800,
            seconds_per_record: 10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub weight_unit: WeightUnit,
    pub default_set_duration_seconds: u32,
    pub parse_set_type_from_notes: bool,
    #[serde(alias = "append_set_notes_to_workout_note")]
    pub append_notes_to_workout_note: bool,
    #[serde(alias = "set_note_format_string")]
    pub note_template: String,
    pub synthesize_set_records: bool,
    pub timing: TimingOptions,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            weight_unit: WeightUnit::Kilograms,
            default_set_duration_seconds: 30,
            parse_set_type_from_notes: true,
            append_notes_to_workout_note: true,
            note_template: "\n{exercise_name} - Set {set_number}: {note_text}".to_string(),
            synthesize_set_records: true,
            timing: TimingOptions::default(),
        }
    }
}

fn default_weight_unit_ids() -> BTreeMap<String, u16> {
    BTreeMap::from([("kg".to_string(), 1), ("lbs".to_string(), 2)])
}

/// Everything a merge request is configured with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub settings: Settings,
    pub exercise_mappings: MappingTable,
    #[serde(rename = "hevy_csv_columns")]
    pub columns: ColumnMap,
    #[serde(rename = "set_type_keyword_mapping")]
    pub set_type_keywords: KeywordTable,
    #[serde(rename = "garmin_weight_unit_mapping")]
    pub weight_unit_ids: BTreeMap<String, u16>,
    #[serde(rename = "garmin_exercise_names", skip_serializing_if = "Vec::is_empty")]
    pub exercise_display_names: Vec<String>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            exercise_mappings: MappingTable::default(),
            columns: ColumnMap::default(),
            set_type_keywords: KeywordTable::standard(),
            weight_unit_ids: default_weight_unit_ids(),
            exercise_display_names: Vec::new(),
        }
    }
}

impl MergeConfig {
    pub fn from_json_str(text: &str) -> Result<Self, MergeError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, MergeError> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String, MergeError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Garmin id for the selected unit; 0 when the map has no entry.
    pub fn weight_unit_id(&self, unit: WeightUnit) -> u16 {
        self.weight_unit_ids.get(unit.key()).copied().unwrap_or(0)
    }

    /// Display names offered when resolving unmapped exercises.
    pub fn display_names(&self, table: &MappingTable) -> Vec<String> {
        if self.exercise_display_names.is_empty() {
            table.display_names()
        } else {
            self.exercise_display_names.clone()
        }
    }
}
