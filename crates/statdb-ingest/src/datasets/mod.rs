//! Dataset descriptors
//!
//! A [`DatasetDescriptor`] tells the importer where a CSV comes from, how to
//! read it, and which transform engine turns it into fact rows. Descriptors
//! are declared in the TOML manifest (see [`manifest`]) and are immutable
//! once loaded.

pub mod manifest;

pub use manifest::{Manifest, ManifestError};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything needed to fetch and import one CSV dataset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetDescriptor {
    /// Stable identifier, stamped on every fact row as `source_dataset`
    pub id: String,

    /// Download location used by `fetch`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// File name under the data directory
    pub filename: String,

    /// Area granularity of every row, e.g. `district`
    pub area_type: String,

    /// Column holding the area name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_column: Option<String>,

    /// SQL expression over raw columns yielding the area name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_expression: Option<String>,

    /// Constant area name for single-area files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_name: Option<String>,

    /// Header aliases, raw (trimmed) name to canonical name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub aliases: BTreeMap<String, String>,

    #[serde(default)]
    pub csv: CsvOptions,

    pub format: Format,
}

/// Where the area name of a row comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaSource<'a> {
    Column(&'a str),
    Expression(&'a str),
    Constant(&'a str),
}

impl DatasetDescriptor {
    /// Resolve the area source; the first declared of column, expression
    /// and constant wins.
    pub fn area_source(&self) -> Option<AreaSource<'_>> {
        if let Some(column) = &self.area_column {
            return Some(AreaSource::Column(column));
        }
        if let Some(expression) = &self.area_expression {
            return Some(AreaSource::Expression(expression));
        }
        self.area_name.as_deref().map(AreaSource::Constant)
    }

    /// Every `(indicator, category)` pair this dataset publishes
    pub fn scope(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = match &self.format {
            Format::UnpivotYears(years) => years
                .rows
                .iter()
                .map(|row| (row.indicator.clone(), row.category.clone()))
                .collect(),
            Format::UnpivotCategories(categories) => categories
                .columns
                .iter()
                .filter_map(|column| {
                    column
                        .indicator
                        .as_ref()
                        .or(categories.indicator.as_ref())
                        .map(|indicator| (indicator.clone(), column.category.clone()))
                })
                .collect(),
        };
        pairs.sort();
        pairs.dedup();
        pairs
    }
}

/// CSV dialect of a source file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CsvOptions {
    pub delimiter: char,
    pub quote: char,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escape: Option<char>,
    pub encoding: Encoding,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fallback_encodings: Vec<Encoding>,
    /// `.` or `,`; with `,` a `.` inside numbers is a thousands separator
    pub decimal_separator: char,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: ';',
            quote: '"',
            escape: None,
            encoding: Encoding::Utf8,
            fallback_encodings: Vec::new(),
            decimal_separator: '.',
        }
    }
}

impl CsvOptions {
    /// Primary encoding followed by the fallbacks, without repeats
    pub fn encodings(&self) -> Vec<Encoding> {
        let mut encodings = vec![self.encoding];
        for encoding in &self.fallback_encodings {
            if !encodings.contains(encoding) {
                encodings.push(*encoding);
            }
        }
        encodings
    }

    pub fn decimal_comma(&self) -> bool {
        self.decimal_separator == ','
    }
}

/// Text encodings a source file may use
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Encoding {
    #[serde(rename = "utf-8", alias = "utf8", alias = "UTF-8")]
    Utf8,
    #[serde(rename = "latin-1", alias = "latin1", alias = "iso-8859-1", alias = "ISO-8859-1")]
    Latin1,
    #[serde(rename = "windows-1252", alias = "cp1252")]
    Windows1252,
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Encoding::Utf8 => "utf-8",
            Encoding::Latin1 => "latin-1",
            Encoding::Windows1252 => "windows-1252",
        };
        f.write_str(name)
    }
}

/// Maps a raw year label to a calendar year
///
/// Overrides are consulted first; otherwise the pattern's first capture
/// group (or whole match) is parsed as an integer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct YearParser {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<String, i64>,
}

/// Transform engine selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Format {
    UnpivotYears(UnpivotYears),
    UnpivotCategories(UnpivotCategories),
}

/// One row per indicator, one column per year
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnpivotYears {
    /// Column whose value selects the configured row
    pub indicator_column: String,

    /// Regex selecting year-bearing columns when `year_columns` is absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year_pattern: Option<String>,

    /// Explicit year columns; their order is the declared order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year_columns: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year_parser: Option<YearParser>,

    pub rows: Vec<YearRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct YearRow {
    /// Value of the indicator column selecting this row
    pub filter_value: String,
    pub indicator: String,
    pub unit: String,
    pub category: String,

    /// SQL expression over the numeric cell, referenced as `value`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_expression: Option<String>,
}

/// One row per area and year, one column per category
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnpivotCategories {
    pub year_column: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year_parser: Option<YearParser>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<RowFilter>,

    /// Keep only the last CSV row per `(area, year)`
    #[serde(default)]
    pub dedupe_by_area_year_keep_last: bool,

    /// Indicator for columns that do not name their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indicator: Option<String>,

    /// Unit for columns that do not name their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    pub columns: Vec<CategoryColumn>,
}

/// Keeps rows whose `column` (trimmed) equals one of `values`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RowFilter {
    pub column: String,
    pub values: Vec<String>,
}

/// Value source for one category
///
/// Candidates are tried in order: `value_column`, then the first present
/// of `value_columns`, then `value_expression`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryColumn {
    pub category: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_column: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_columns: Option<Vec<String>>,

    /// SQL expression over the numeric form of every column; a blank or
    /// placeholder operand makes the result NULL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_expression: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indicator: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}
