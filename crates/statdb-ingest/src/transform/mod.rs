//! Transform engines
//!
//! Both engines compile a [`DatasetDescriptor`] plus the observed
//! (normalized) CSV columns into a [`StagingPlan`]: parameterized
//! `INSERT ... SELECT` statements that read the raw TEMP table and write
//! long-form rows into the staging TEMP table. Compilation is pure; every
//! configuration problem (missing column, bad year label, category without a
//! value source) surfaces here, before any row is staged.
//!
//! Identifiers reach SQL only through [`quote_ident`]; every value is a bound
//! parameter. Free-form SQL expressions from the manifest are trusted
//! configuration and are embedded verbatim in parentheses.

pub mod headers;
pub mod unpivot_categories;
pub mod unpivot_years;
pub mod years;

pub use headers::{dedupe_raw_headers, plan_header_renames, HeaderRename};
pub use years::{YearLabelParser, MAX_YEAR, MIN_YEAR};

use crate::datasets::{AreaSource, DatasetDescriptor, Format};
use sqlx::sqlite::{Sqlite, SqliteArguments};
use thiserror::Error;

/// Raw CSV rows, one TEXT column per header plus [`ROW_COLUMN`]
pub const RAW_TABLE: &str = "raw_csv";

/// Long-form rows of the current run
pub const STAGING_TABLE: &str = "staging_statistics";

/// Parsed year labels for the category engine
pub const YEAR_MAP_TABLE: &str = "year_map";

/// 1-based CSV record number in the raw table
pub const ROW_COLUMN: &str = "__row";

/// Column list shared by the staging and fact tables
pub const FACT_COLUMNS: &str = "indicator, area_type, area_name, year, value, unit, category, \
     source_dataset, import_run_id, loaded_at, data_version";

/// Upsert on the natural key; the latest run wins
pub const UPSERT_ON_KEY: &str = "ON CONFLICT (indicator, area_type, area_name, year, category) \
     DO UPDATE SET value = excluded.value, unit = excluded.unit, \
     source_dataset = excluded.source_dataset, import_run_id = excluded.import_run_id, \
     loaded_at = excluded.loaded_at, data_version = excluded.data_version";

/// Configuration errors found while compiling a dataset
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Dataset '{dataset}': required {role} column '{column}' not found (available: {available})")]
    MissingColumn {
        dataset: String,
        role: &'static str,
        column: String,
        available: String,
    },

    #[error("Dataset '{dataset}': no columns match year pattern '{pattern}'")]
    NoYearColumns { dataset: String, pattern: String },

    #[error("Year label '{label}' could not be parsed: {reason}")]
    InvalidYearLabel { label: String, reason: String },

    #[error("Year label '{label}' parsed to {year}, outside {min}..={max}", min = MIN_YEAR, max = MAX_YEAR)]
    YearOutOfRange { label: String, year: i64 },

    #[error("Dataset '{dataset}': category '{category}' has no usable value source (tried: {tried})")]
    NoValueSource {
        dataset: String,
        category: String,
        tried: String,
    },

    #[error("Invalid regex '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Header collision: '{first}' and '{second}' both normalize to '{name}'")]
    HeaderCollision {
        name: String,
        first: String,
        second: String,
    },

    #[error("Dataset '{dataset}': {message}")]
    Config { dataset: String, message: String },
}

impl TransformError {
    pub fn config(dataset: &str, message: impl Into<String>) -> Self {
        Self::Config {
            dataset: dataset.to_string(),
            message: message.into(),
        }
    }

    fn missing(dataset: &str, role: &'static str, column: &str, observed: &[String]) -> Self {
        Self::MissingColumn {
            dataset: dataset.to_string(),
            role,
            column: column.to_string(),
            available: observed.join(", "),
        }
    }
}

/// Quote an SQL identifier, doubling embedded quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Qualified name of a TEMP table
pub fn temp_table(name: &str) -> String {
    format!("temp.{}", quote_ident(name))
}

/// Numeric coercion of a raw cell or expression
///
/// Integers and reals pass through; text is trimmed and accepted only when
/// it consists of digits, sign, exponent and decimal point. Everything else
/// (empty cells, footnote markers like `-` or `x`) becomes NULL. With a
/// decimal comma, `.` is read as a thousands separator.
pub fn numeric_sql(expr: &str, decimal_comma: bool) -> String {
    let text = if decimal_comma {
        format!("replace(replace(trim({expr}), '.', ''), ',', '.')")
    } else {
        format!("trim({expr})")
    };
    format!(
        "(CASE WHEN typeof({expr}) IN ('integer', 'real') THEN CAST({expr} AS REAL) \
         WHEN typeof({expr}) = 'text' AND {text} <> '' \
         AND {text} NOT GLOB '*[^0-9.eE+-]*' AND {text} GLOB '*[0-9]*' \
         THEN CAST({text} AS REAL) END)"
    )
}

/// The raw table with every observed column passed through [`numeric_sql`]
///
/// Manifest expressions are evaluated against this so their operands are
/// numbers under the original column names; a placeholder cell makes the
/// whole expression NULL.
pub fn numeric_view_sql(observed: &[String], decimal_comma: bool) -> String {
    let mut columns = vec![quote_ident(ROW_COLUMN)];
    columns.extend(observed.iter().map(|column| {
        let column = quote_ident(column);
        format!("{} AS {column}", numeric_sql(&column, decimal_comma))
    }));
    format!("SELECT {} FROM {}", columns.join(", "), temp_table(RAW_TABLE))
}

/// A bound statement parameter
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Integer(i64),
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

/// Bind `params` in order to `sql`
pub fn bind_params<'q>(
    sql: &'q str,
    params: &[SqlParam],
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    params.iter().fold(sqlx::query(sql), |query, param| match param {
        SqlParam::Text(text) => query.bind(text.clone()),
        SqlParam::Integer(value) => query.bind(*value),
    })
}

/// Appends SQL text and positional parameters in lockstep
#[derive(Debug, Default)]
pub(crate) struct SqlBuilder {
    sql: String,
    params: Vec<SqlParam>,
}

impl SqlBuilder {
    pub(crate) fn sql(&mut self, text: &str) -> &mut Self {
        self.sql.push_str(text);
        self
    }

    pub(crate) fn param(&mut self, value: impl Into<SqlParam>) -> &mut Self {
        self.sql.push('?');
        self.params.push(value.into());
        self
    }

    /// `(?, ?, ...)` for an IN list
    pub(crate) fn param_list<I, P>(&mut self, values: I) -> &mut Self
    where
        I: IntoIterator<Item = P>,
        P: Into<SqlParam>,
    {
        self.sql.push('(');
        for (i, value) in values.into_iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.param(value);
        }
        self.sql.push(')');
        self
    }

    /// Area name of the current raw row, NULL when blank
    pub(crate) fn area(&mut self, area: AreaSource<'_>) -> &mut Self {
        match area {
            AreaSource::Column(column) => {
                let column = quote_ident(column);
                self.sql(&format!("NULLIF(trim({column}), '')"))
            },
            AreaSource::Expression(expression) => {
                self.sql(&format!("NULLIF(trim(CAST(({expression}) AS TEXT)), '')"))
            },
            AreaSource::Constant(name) => self.param(name),
        }
    }

    pub(crate) fn finish(self) -> (String, Vec<SqlParam>) {
        (self.sql, self.params)
    }
}

/// Run-wide values stamped on every staged row
#[derive(Debug, Clone, Copy)]
pub struct StagingContext<'a> {
    pub dataset_id: &'a str,
    pub run_id: &'a str,
    pub loaded_at: &'a str,
    pub data_version: &'a str,
}

/// One `INSERT ... SELECT` into the staging table
#[derive(Debug, Clone)]
pub struct StagingStatement {
    pub sql: String,
    pub params: Vec<SqlParam>,
    pub indicator: String,
    pub category: String,
}

/// Distinct raw year labels to parse before staging
#[derive(Debug, Clone)]
pub struct YearLookup {
    pub column: String,
    pub parser: YearLabelParser,
    /// Selects the distinct labels of the rows that will be staged
    pub labels_sql: String,
    pub labels_params: Vec<SqlParam>,
}

/// Compiled staging work for one dataset
#[derive(Debug, Clone)]
pub struct StagingPlan {
    pub statements: Vec<StagingStatement>,
    pub year_lookup: Option<YearLookup>,
    /// Distinct `(indicator, category)` pairs published by this dataset
    pub scope: Vec<(String, String)>,
}

impl StagingPlan {
    fn new(statements: Vec<StagingStatement>, year_lookup: Option<YearLookup>) -> Self {
        let mut scope: Vec<(String, String)> = statements
            .iter()
            .map(|s| (s.indicator.clone(), s.category.clone()))
            .collect();
        scope.sort();
        scope.dedup();
        Self {
            statements,
            year_lookup,
            scope,
        }
    }
}

/// Compile the dataset's format against the observed columns
pub fn compile_plan(
    descriptor: &DatasetDescriptor,
    observed: &[String],
    context: &StagingContext<'_>,
) -> Result<StagingPlan, TransformError> {
    match &descriptor.format {
        Format::UnpivotYears(format) => unpivot_years::compile(descriptor, format, observed, context),
        Format::UnpivotCategories(format) => {
            unpivot_categories::compile(descriptor, format, observed, context)
        },
    }
}

/// Resolve the area source and check its column exists
fn area_source<'d>(
    descriptor: &'d DatasetDescriptor,
    observed: &[String],
) -> Result<AreaSource<'d>, TransformError> {
    let area = descriptor.area_source().ok_or_else(|| {
        TransformError::config(
            &descriptor.id,
            "one of area_column, area_expression or area_name is required",
        )
    })?;
    if let AreaSource::Column(column) = area {
        require_column(&descriptor.id, "area", column, observed)?;
    }
    Ok(area)
}

fn require_column(
    dataset: &str,
    role: &'static str,
    column: &str,
    observed: &[String],
) -> Result<(), TransformError> {
    if observed.iter().any(|c| c == column) {
        Ok(())
    } else {
        Err(TransformError::missing(dataset, role, column, observed))
    }
}

/// `INSERT INTO staging (...) SELECT ?, ?, area_name, year, value, ?, ...`
///
/// The caller continues with ` FROM (...)` producing `area_name`, `year`
/// and `value`.
fn insert_prefix(
    builder: &mut SqlBuilder,
    descriptor: &DatasetDescriptor,
    context: &StagingContext<'_>,
    indicator: &str,
    unit: &str,
    category: &str,
) {
    builder
        .sql(&format!(
            "INSERT INTO {} ({FACT_COLUMNS}) SELECT ",
            temp_table(STAGING_TABLE)
        ))
        .param(indicator)
        .sql(", ")
        .param(descriptor.area_type.as_str())
        .sql(", area_name, year, value, ")
        .param(unit)
        .sql(", ")
        .param(category)
        .sql(", ")
        .param(context.dataset_id)
        .sql(", ")
        .param(context.run_id)
        .sql(", ")
        .param(context.loaded_at)
        .sql(", ")
        .param(context.data_version);
}
