use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, warn};

use crate::clean::is_set_category;
use crate::fit;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    NotChecked,
    Decoded,
    Inspected,
    Passed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub ok: bool,
    pub state: ValidationState,
    pub size_bytes: u64,
    pub record_count: usize,
    /// Records whose category is not set data.
    pub preserved_count: usize,
    pub has_session_category: bool,
    pub has_timing_category: bool,
    pub categories: BTreeMap<String, usize>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

impl ValidationResult {
    fn new(size_bytes: u64) -> Self {
        Self {
            ok: false,
            state: ValidationState::NotChecked,
            size_bytes,
            record_count: 0,
            preserved_count: 0,
            has_session_category: false,
            has_timing_category: false,
            categories: BTreeMap::new(),
            warnings: Vec::new(),
            error: None,
        }
    }

    fn fail(mut self, error: String) -> Self {
        warn!(%error, "validation failed");
        self.ok = false;
        self.state = ValidationState::Failed;
        self.error = Some(error);
        self
    }
}

/// Re-reads an encoded recording and checks it is a usable activity file.
#[derive(Clone, Debug)]
pub struct Validator {
    expected_preserved: Option<usize>,
    profile_check: bool,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            expected_preserved: None,
            profile_check: true,
        }
    }
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail unless exactly `count` non-set records decode back.
    pub fn expect_preserved(mut self, count: usize) -> Self {
        self.expected_preserved = Some(count);
        self
    }

    /// Skip the secondary decode through `fitparser`.
    pub fn without_profile_check(mut self) -> Self {
        self.profile_check = false;
        self
    }

    pub fn validate(&self, bytes: &[u8]) -> ValidationResult {
        let result = ValidationResult::new(bytes.len() as u64);
        if bytes.is_empty() {
            return result.fail("file is empty".to_string());
        }

        let container = match fit::decode(bytes) {
            Ok(container) => container,
            Err(err) => return result.fail(err.to_string()),
        };
        let mut result = ValidationResult {
            state: ValidationState::Decoded,
            record_count: container.len(),
            ..result
        };

        for record in &container.records {
            let label = record
                .category()
                .unwrap_or_else(|| format!("unknown_{}", record.global_number()));
            if !is_set_category(&label) {
                result.preserved_count += 1;
            }
            *result.categories.entry(label).or_insert(0) += 1;
        }
        result.has_session_category = result.categories.contains_key("session");
        result.has_timing_category =
            result.categories.contains_key("record") || result.categories.contains_key("lap");
        result.state = ValidationState::Inspected;

        if result.record_count == 0 {
            result.warnings.push("file contains no data messages".to_string());
        }
        if !result.has_session_category {
            result.warnings.push("no session message found".to_string());
        }
        if !result.has_timing_category {
            result.warnings.push("no record or lap messages found".to_string());
        }
        if self.profile_check {
            if let Err(err) = fitparser::de::from_bytes(bytes) {
                result
                    .warnings
                    .push(format!("profile decoder rejected the file: {err}"));
            }
        }

        if let Some(expected) = self.expected_preserved {
            if result.preserved_count != expected {
                let found = result.preserved_count;
                return result.fail(format!(
                    "expected {expected} preserved records, found {found}"
                ));
            }
        }

        for warning in &result.warnings {
            warn!(%warning, "validation warning");
        }
        result.ok = true;
        result.state = ValidationState::Passed;
        debug!(
            records = result.record_count,
            size = result.size_bytes,
            "validation passed"
        );
        result
    }

    pub fn validate_path(&self, path: &Path) -> ValidationResult {
        match fs::read(path) {
            Ok(bytes) => self.validate(&bytes),
            Err(err) => ValidationResult::new(0)
                .fail(format!("cannot read {}: {err}", path.display())),
        }
    }
}

pub fn validate(bytes: &[u8]) -> ValidationResult {
    Validator::default().validate(bytes)
}

pub fn validate_path(path: &Path) -> ValidationResult {
    Validator::default().validate_path(path)
}
