//! Year label parsing
//!
//! Labels are parsed eagerly: every distinct label a dataset will stage is
//! converted before any row is written, so a bad label fails the import as
//! a configuration error that names it.

use super::TransformError;
use crate::datasets::YearParser;
use regex::Regex;
use std::collections::BTreeMap;

pub const MIN_YEAR: i64 = 1900;
pub const MAX_YEAR: i64 = 2100;

/// Extracts the year from a label when no pattern is configured
pub const DEFAULT_LABEL_PATTERN: &str = r"(\d{4})";

/// Selects year columns by header; `_N` suffixes come from repeated headers
pub const DEFAULT_COLUMN_PATTERN: &str = r"^\d{4}(?:_\d+)?$";

/// Compiled form of a [`YearParser`]
#[derive(Debug, Clone)]
pub struct YearLabelParser {
    pattern: Regex,
    overrides: BTreeMap<String, i64>,
}

impl YearLabelParser {
    pub fn new(config: Option<&YearParser>) -> Result<Self, TransformError> {
        let pattern = config
            .and_then(|c| c.pattern.as_deref())
            .unwrap_or(DEFAULT_LABEL_PATTERN);
        let overrides = config.map(|c| c.overrides.clone()).unwrap_or_default();

        Ok(Self {
            pattern: compile_regex(pattern)?,
            overrides,
        })
    }

    /// Parse one label and check it is a plausible year
    pub fn parse(&self, label: &str) -> Result<i64, TransformError> {
        let trimmed = label.trim();
        let year = match self.overrides.get(trimmed) {
            Some(year) => *year,
            None => self.extract(trimmed)?,
        };

        if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
            return Err(TransformError::YearOutOfRange {
                label: label.to_string(),
                year,
            });
        }
        Ok(year)
    }

    /// Parse every label, failing on the first bad one
    pub fn parse_all<I, S>(&self, labels: I) -> Result<Vec<(String, i64)>, TransformError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        labels
            .into_iter()
            .map(|label| {
                let label = label.into();
                self.parse(&label).map(|year| (label, year))
            })
            .collect()
    }

    fn extract(&self, label: &str) -> Result<i64, TransformError> {
        let invalid = |reason: &str| TransformError::InvalidYearLabel {
            label: label.to_string(),
            reason: reason.to_string(),
        };

        let captures = self
            .pattern
            .captures(label)
            .ok_or_else(|| invalid(&format!("does not match '{}'", self.pattern.as_str())))?;
        let matched = captures
            .get(1)
            .or_else(|| captures.get(0))
            .map(|m| m.as_str())
            .unwrap_or_default();

        matched
            .trim()
            .parse::<i64>()
            .map_err(|_| invalid(&format!("'{matched}' is not an integer")))
    }
}

pub(crate) fn compile_regex(pattern: &str) -> Result<Regex, TransformError> {
    Regex::new(pattern).map_err(|source| TransformError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}
