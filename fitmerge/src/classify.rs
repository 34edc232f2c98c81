use std::fmt;

use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Set classification carried alongside each synthesized set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum SetType {
    #[default]
    Normal,
    WarmUp,
    Failure,
    DropSet,
    Other(u8),
}

impl SetType {
    pub fn id(self) -> u8 {
        match self {
            SetType::Normal => 0,
            SetType::WarmUp => 2,
            SetType::Failure => 5,
            SetType::DropSet => 6,
            SetType::Other(id) => id,
        }
    }
}

impl From<u8> for SetType {
    fn from(id: u8) -> Self {
        match id {
            0 => SetType::Normal,
            2 => SetType::WarmUp,
            5 => SetType::Failure,
            6 => SetType::DropSet,
            other => SetType::Other(other),
        }
    }
}

impl From<SetType> for u8 {
    fn from(value: SetType) -> Self {
        value.id()
    }
}

impl fmt::Display for SetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetType::Normal => f.write_str("Normal"),
            SetType::WarmUp => f.write_str("Warm-up"),
            SetType::Failure => f.write_str("Failure"),
            SetType::DropSet => f.write_str("Drop set"),
            SetType::Other(id) => write!(f, "Type {id}"),
        }
    }
}

/// Keyword → set type rules, checked in insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeywordTable {
    entries: Vec<(String, SetType)>,
}

impl KeywordTable {
    pub fn new<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, SetType)>,
        K: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(keyword, kind)| (keyword.into().to_lowercase(), kind))
                .collect(),
        }
    }

    pub fn standard() -> Self {
        Self::new([
            ("drop", SetType::DropSet),
            ("failure", SetType::Failure),
            ("warm", SetType::WarmUp),
        ])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, SetType)> + '_ {
        self.entries.iter().map(|(k, t)| (k.as_str(), *t))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for KeywordTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (keyword, kind) in &self.entries {
            map.serialize_entry(keyword, kind)?;
        }
        map.end()
    }
}

struct KeywordTableVisitor;

impl<'de> Visitor<'de> for KeywordTableVisitor {
    type Value = KeywordTable;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map or a list of [keyword, set type id] pairs")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((keyword, kind)) = access.next_entry::<String, SetType>()? {
            entries.push((keyword, kind));
        }
        Ok(KeywordTable::new(entries))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((keyword, kind)) = access.next_element::<(String, SetType)>()? {
            entries.push((keyword, kind));
        }
        Ok(KeywordTable::new(entries))
    }
}

impl<'de> Deserialize<'de> for KeywordTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(KeywordTableVisitor)
    }
}

/// Classify a free-text set note. The first keyword in table order that
/// occurs in the lowercased note wins.
pub fn classify(note: &str, table: &KeywordTable, enabled: bool) -> SetType {
    let note = note.trim();
    if !enabled || note.is_empty() {
        return SetType::Normal;
    }
    let lowered = note.to_lowercase();
    table
        .iter()
        .find(|(keyword, _)| !keyword.is_empty() && lowered.contains(keyword))
        .map(|(_, kind)| kind)
        .unwrap_or(SetType::Normal)
}
