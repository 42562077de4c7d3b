//! Dataset manifest (datasets.toml)
//!
//! ```toml
//! [[dataset]]
//! id = "population"
//! url = "https://example.org/population.csv"
//! filename = "population.csv"
//! area_type = "district"
//! area_column = "Stadtteil"
//!
//! [dataset.format]
//! kind = "unpivot_years"
//! indicator_column = "Merkmal"
//!
//! [[dataset.format.rows]]
//! filter_value = "Einwohner insgesamt"
//! indicator = "population"
//! unit = "persons"
//! category = "total"
//! ```

use super::{CategoryColumn, DatasetDescriptor, Format, UnpivotCategories, UnpivotYears, YearParser};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// Manifest loading and validation failures
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Manifest not found: {0}")]
    NotFound(String),

    #[error("Failed to read manifest: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse manifest: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Dataset '{dataset}': {message}")]
    Invalid { dataset: String, message: String },

    #[error("Unknown dataset '{0}'")]
    UnknownDataset(String),
}

impl ManifestError {
    fn invalid(dataset: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            dataset: dataset.to_string(),
            message: message.into(),
        }
    }
}

/// All known datasets, in declaration order
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    #[serde(default, rename = "dataset")]
    pub datasets: Vec<DatasetDescriptor>,
}

impl Manifest {
    /// Load and validate a manifest file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ManifestError::NotFound(path.display().to_string()));
            },
            Err(err) => return Err(err.into()),
        };
        let manifest = Self::parse(&content)?;
        tracing::debug!(path = %path.display(), datasets = manifest.datasets.len(), "Manifest loaded");
        Ok(manifest)
    }

    /// Parse and validate manifest text
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest = toml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        let mut seen = HashSet::new();
        for descriptor in &self.datasets {
            if !seen.insert(descriptor.id.as_str()) {
                return Err(ManifestError::invalid(&descriptor.id, "duplicate dataset id"));
            }
            validate_descriptor(descriptor)?;
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<&DatasetDescriptor, ManifestError> {
        self.datasets
            .iter()
            .find(|d| d.id == id)
            .ok_or_else(|| ManifestError::UnknownDataset(id.to_string()))
    }
}

/// Check a single descriptor for configuration errors that do not depend on
/// the CSV contents
pub fn validate_descriptor(descriptor: &DatasetDescriptor) -> Result<(), ManifestError> {
    let id = descriptor.id.as_str();
    let invalid = |message: String| ManifestError::invalid(id, message);

    if id.trim().is_empty() {
        return Err(invalid("id cannot be empty".into()));
    }

    if descriptor.filename.is_empty()
        || descriptor.filename.contains(['/', '\\'])
        || descriptor.filename == ".."
    {
        return Err(invalid(format!(
            "filename '{}' must be a plain file name",
            descriptor.filename
        )));
    }

    if descriptor.area_type.trim().is_empty() {
        return Err(invalid("area_type cannot be empty".into()));
    }

    if descriptor.area_source().is_none() {
        return Err(invalid(
            "one of area_column, area_expression or area_name is required".into(),
        ));
    }

    if let Some(expression) = &descriptor.area_expression {
        check_expression(id, "area_expression", expression)?;
    }

    let csv = &descriptor.csv;
    for (name, value) in [("delimiter", Some(csv.delimiter)), ("quote", Some(csv.quote)), ("escape", csv.escape)] {
        if let Some(c) = value {
            if !c.is_ascii() || c == '\n' || c == '\r' {
                return Err(invalid(format!("{name} '{c}' must be a single-byte character")));
            }
        }
    }
    if csv.delimiter == csv.quote {
        return Err(invalid(format!(
            "delimiter and quote must differ (both '{}')",
            csv.delimiter
        )));
    }
    if csv.decimal_separator != '.' && csv.decimal_separator != ',' {
        return Err(invalid(format!(
            "decimal_separator '{}' must be '.' or ','",
            csv.decimal_separator
        )));
    }

    match &descriptor.format {
        Format::UnpivotYears(years) => validate_years(id, years),
        Format::UnpivotCategories(categories) => validate_categories(id, categories),
    }
}

fn validate_years(id: &str, years: &UnpivotYears) -> Result<(), ManifestError> {
    if let Some(pattern) = &years.year_pattern {
        check_regex(id, "year_pattern", pattern)?;
    }
    if let Some(parser) = &years.year_parser {
        check_year_parser(id, parser)?;
    }
    if let Some(columns) = &years.year_columns {
        if columns.is_empty() {
            return Err(ManifestError::invalid(id, "year_columns cannot be empty"));
        }
    }
    if years.rows.is_empty() {
        return Err(ManifestError::invalid(id, "at least one row is required"));
    }

    for row in &years.rows {
        if row.filter_value.trim().is_empty() {
            return Err(ManifestError::invalid(id, "row filter_value cannot be empty"));
        }
        if row.indicator.is_empty() || row.category.is_empty() || row.unit.is_empty() {
            return Err(ManifestError::invalid(
                id,
                format!("row '{}' needs indicator, unit and category", row.filter_value),
            ));
        }
        if let Some(expression) = &row.value_expression {
            check_expression(id, "value_expression", expression)?;
        }
    }
    Ok(())
}

fn validate_categories(id: &str, categories: &UnpivotCategories) -> Result<(), ManifestError> {
    if let Some(parser) = &categories.year_parser {
        check_year_parser(id, parser)?;
    }
    if let Some(filter) = &categories.filter {
        if filter.values.is_empty() {
            return Err(ManifestError::invalid(
                id,
                format!("filter on '{}' has no values", filter.column),
            ));
        }
    }
    if categories.columns.is_empty() {
        return Err(ManifestError::invalid(id, "at least one category column is required"));
    }

    for column in &categories.columns {
        validate_category_column(id, categories, column)?;
    }
    Ok(())
}

fn validate_category_column(
    id: &str,
    categories: &UnpivotCategories,
    column: &CategoryColumn,
) -> Result<(), ManifestError> {
    let category = &column.category;
    if category.is_empty() {
        return Err(ManifestError::invalid(id, "category cannot be empty"));
    }

    let has_alias = column.value_columns.as_ref().is_some_and(|c| !c.is_empty());
    if column.value_column.is_none() && !has_alias && column.value_expression.is_none() {
        return Err(ManifestError::invalid(
            id,
            format!("category '{category}' declares no value source"),
        ));
    }
    if let Some(expression) = &column.value_expression {
        check_expression(id, "value_expression", expression)?;
    }

    if column.indicator.is_none() && categories.indicator.is_none() {
        return Err(ManifestError::invalid(
            id,
            format!("category '{category}' has no indicator and no default is set"),
        ));
    }
    if column.unit.is_none() && categories.unit.is_none() {
        return Err(ManifestError::invalid(
            id,
            format!("category '{category}' has no unit and no default is set"),
        ));
    }
    Ok(())
}

fn check_regex(id: &str, field: &str, pattern: &str) -> Result<(), ManifestError> {
    Regex::new(pattern)
        .map(drop)
        .map_err(|err| ManifestError::invalid(id, format!("{field} is not a valid regex: {err}")))
}

fn check_year_parser(id: &str, parser: &YearParser) -> Result<(), ManifestError> {
    match &parser.pattern {
        Some(pattern) => check_regex(id, "year_parser.pattern", pattern),
        None => Ok(()),
    }
}

/// Expressions are trusted configuration but must stay a single expression
fn check_expression(id: &str, field: &str, expression: &str) -> Result<(), ManifestError> {
    if expression.trim().is_empty() || expression.contains(';') {
        return Err(ManifestError::invalid(
            id,
            format!("{field} '{expression}' must be a single non-empty SQL expression"),
        ));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const POPULATION: &str = r#"
        [[dataset]]
        id = "population"
        url = "https://example.org/population.csv"
        filename = "population.csv"
        area_type = "district"
        area_column = "Stadtteil"

        [dataset.format]
        kind = "unpivot_years"
        indicator_column = "Merkmal"

        [[dataset.format.rows]]
        filter_value = "Einwohner insgesamt"
        indicator = "population"
        unit = "persons"
        category = "total"
    "#;

    #[test]
    fn test_parse_manifest() {
        let manifest = Manifest::parse(POPULATION).unwrap();
        let descriptor = manifest.get("population").unwrap();
        assert_eq!(descriptor.filename, "population.csv");
        assert!(matches!(descriptor.format, Format::UnpivotYears(_)));
        assert!(matches!(manifest.get("nope"), Err(ManifestError::UnknownDataset(_))));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("datasets.toml");
        tokio::fs::write(&path, POPULATION).await.unwrap();

        let manifest = Manifest::load(&path).await.unwrap();
        assert_eq!(manifest.datasets.len(), 1);

        let err = Manifest::load(dir.path().join("missing.toml")).await.unwrap_err();
        assert!(matches!(err, ManifestError::NotFound(_)));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let doubled = format!("{POPULATION}\n{POPULATION}");
        let err = Manifest::parse(&doubled).unwrap_err();
        assert!(err.to_string().contains("duplicate dataset id"));
    }

    #[test]
    fn test_multibyte_delimiter_rejected() {
        let content = POPULATION.replace(
            "area_column = \"Stadtteil\"",
            "area_column = \"Stadtteil\"\n[dataset.csv]\ndelimiter = \"§\"",
        );
        let err = Manifest::parse(&content).unwrap_err();
        assert!(err.to_string().contains("single-byte"), "{err}");
    }

    #[test]
    fn test_invalid_year_pattern_rejected() {
        let content = POPULATION.replace(
            "indicator_column = \"Merkmal\"",
            "indicator_column = \"Merkmal\"\nyear_pattern = \"(\"",
        );
        let err = Manifest::parse(&content).unwrap_err();
        assert!(err.to_string().contains("year_pattern"));
    }

    #[test]
    fn test_missing_area_source_rejected() {
        let content = POPULATION.replace("area_column = \"Stadtteil\"", "");
        let err = Manifest::parse(&content).unwrap_err();
        assert!(err.to_string().contains("area_column"));
    }

    #[test]
    fn test_category_without_value_source_rejected() {
        let content = r#"
            [[dataset]]
            id = "households"
            filename = "households.csv"
            area_type = "district"
            area_column = "Stadtteil"

            [dataset.format]
            kind = "unpivot_categories"
            year_column = "Jahr"
            indicator = "households"
            unit = "count"

            [[dataset.format.columns]]
            category = "single"
        "#;
        let err = Manifest::parse(content).unwrap_err();
        assert!(err.to_string().contains("no value source"));
    }
}
