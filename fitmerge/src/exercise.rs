//! Exercise name resolution: mapping table, batch lookup of misses, and the
//! collaborator that supplies mappings for names the table does not know.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::sets::ParsedSet;

/// Garmin `(exercise_category, exercise_name)` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExerciseMapping {
    pub category: u16,
    pub name: u16,
}

impl ExerciseMapping {
    /// Unknown-category strength exercise.
    pub const GENERIC: ExerciseMapping = ExerciseMapping {
        category: 65534,
        name: 0,
    };
}

mod category {
    pub const BENCH_PRESS: u16 = 0;
    pub const CORE: u16 = 5;
    pub const CURL: u16 = 7;
    pub const ROW: u16 = 23;
    pub const SHOULDER_PRESS: u16 = 24;
    pub const SQUAT: u16 = 28;
}

const BODY_REGIONS: &[(&str, u16, &[&str])] = &[
    (
        "chest",
        category::BENCH_PRESS,
        &["chest", "bench", "fly", "flye", "pec", "dip", "pushup"],
    ),
    (
        "back",
        category::ROW,
        &["row", "pull", "deadlift", "chin", "back"],
    ),
    (
        "shoulders",
        category::SHOULDER_PRESS,
        &["shoulder", "overhead", "military", "lateral", "delt", "arnold"],
    ),
    (
        "legs",
        category::SQUAT,
        &["squat", "lunge", "leg", "calf", "glute", "hip", "thrust"],
    ),
    (
        "arms",
        category::CURL,
        &["curl", "bicep", "tricep", "skull", "arm"],
    ),
    (
        "core",
        category::CORE,
        &["crunch", "plank", "ab", "core", "sit", "twist"],
    ),
];

pub(crate) fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Capitalize every letter that follows a non-letter and lowercase the rest,
/// so `t-bar row (cable)` reads `T-Bar Row (Cable)`.
pub fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut after_letter = false;
    for c in name.chars() {
        if after_letter {
            out.extend(c.to_lowercase());
        } else {
            out.extend(c.to_uppercase());
        }
        after_letter = c.is_alphabetic();
    }
    out
}

/// Lowercased exercise name → Garmin mapping. Passed explicitly to every
/// stage that needs it; resolutions are written back into it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, ExerciseMapping>", into = "BTreeMap<String, ExerciseMapping>")]
pub struct MappingTable {
    entries: BTreeMap<String, ExerciseMapping>,
}

impl From<BTreeMap<String, ExerciseMapping>> for MappingTable {
    fn from(raw: BTreeMap<String, ExerciseMapping>) -> Self {
        Self {
            entries: raw.into_iter().map(|(k, v)| (normalize(&k), v)).collect(),
        }
    }
}

impl From<MappingTable> for BTreeMap<String, ExerciseMapping> {
    fn from(table: MappingTable) -> Self {
        table.entries
    }
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, name: &str) -> Option<ExerciseMapping> {
        self.entries.get(&normalize(name)).copied()
    }

    pub fn insert(&mut self, name: &str, mapping: ExerciseMapping) {
        self.entries.insert(normalize(name), mapping);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&normalize(name))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ExerciseMapping)> + '_ {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Title-cased keys, for offering as resolution candidates.
    pub fn display_names(&self) -> Vec<String> {
        self.entries.keys().map(|k| title_case(k)).collect()
    }
}

/// Every distinct exercise name in the batch the table cannot resolve.
pub fn find_unmapped(sets: &[ParsedSet], table: &MappingTable) -> BTreeSet<String> {
    sets.iter()
        .filter(|set| !table.contains(&set.exercise_name))
        .map(|set| normalize(&set.exercise_name))
        .collect()
}

/// Answer from a resolution collaborator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Lowercased exercise name → chosen display name.
    Confirmed(BTreeMap<String, String>),
    Cancelled,
}

/// Supplies display names for exercises missing from the mapping table.
pub trait ExerciseResolver {
    fn resolve_unmapped(&mut self, names: &BTreeSet<String>, available: &[String]) -> Resolution;
}

/// Batch resolution from a prepared mapping; cancels when a name is missing.
#[derive(Clone, Debug, Default)]
pub struct FixedResolver {
    choices: BTreeMap<String, String>,
}

impl FixedResolver {
    pub fn new<I, K, V>(choices: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            choices: choices
                .into_iter()
                .map(|(k, v)| (normalize(k.as_ref()), v.into()))
                .collect(),
        }
    }
}

impl ExerciseResolver for FixedResolver {
    fn resolve_unmapped(&mut self, names: &BTreeSet<String>, _available: &[String]) -> Resolution {
        let mut chosen = BTreeMap::new();
        for name in names {
            match self.choices.get(name) {
                Some(display) => {
                    chosen.insert(name.clone(), display.clone());
                }
                None => {
                    info!(exercise = %name, "no prepared mapping, cancelling");
                    return Resolution::Cancelled;
                }
            }
        }
        Resolution::Confirmed(chosen)
    }
}

/// Accepts the best-ranked candidate for every name, or the name itself
/// when there are no candidates.
#[derive(Clone, Copy, Debug, Default)]
pub struct SuggestionResolver;

impl ExerciseResolver for SuggestionResolver {
    fn resolve_unmapped(&mut self, names: &BTreeSet<String>, available: &[String]) -> Resolution {
        Resolution::Confirmed(
            names
                .iter()
                .map(|name| {
                    let display = suggest(name, available).unwrap_or_else(|| title_case(name));
                    (name.clone(), display)
                })
                .collect(),
        )
    }
}

fn tokens(text: &str) -> BTreeSet<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}

/// Candidates ordered by shared-token count, best first; ties keep input
/// order.
pub fn rank_candidates<'a>(name: &str, candidates: &'a [String]) -> Vec<(&'a str, usize)> {
    let wanted = tokens(name);
    let mut ranked: Vec<(&str, usize)> = candidates
        .iter()
        .map(|c| (c.as_str(), tokens(c).intersection(&wanted).count()))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked
}

pub fn suggest(name: &str, candidates: &[String]) -> Option<String> {
    rank_candidates(name, candidates)
        .first()
        .map(|(c, _)| (*c).to_string())
}

/// Generic mapping from body-region keywords in the display name.
pub fn generic_mapping(display_name: &str) -> ExerciseMapping {
    let words: Vec<String> = display_name
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    for (region, category, keywords) in BODY_REGIONS {
        if keywords
            .iter()
            .any(|kw| words.iter().any(|w| w.starts_with(kw)))
        {
            debug!(display = display_name, region, "matched body region");
            return ExerciseMapping {
                category: *category,
                name: 0,
            };
        }
    }
    ExerciseMapping::GENERIC
}

/// Reuse an existing entry named like the display name, else a generic
/// mapping.
pub fn mapping_for_display_name(display_name: &str, table: &MappingTable) -> ExerciseMapping {
    table
        .lookup(display_name)
        .unwrap_or_else(|| generic_mapping(display_name))
}

/// Write every confirmed resolution into the table. Returns the new entries.
pub fn apply_resolution(
    table: &mut MappingTable,
    confirmed: &BTreeMap<String, String>,
) -> Vec<(String, ExerciseMapping)> {
    let mut added = Vec::with_capacity(confirmed.len());
    for (name, chosen_name) in confirmed {
        let mapping = mapping_for_display_name(chosen_name, table);
        info!(
            exercise = %name,
            display = %chosen_name,
            category = mapping.category,
            "mapped exercise"
        );
        table.insert(name, mapping);
        added.push((normalize(name), mapping));
    }
    added
}
