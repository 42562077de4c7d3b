//! Unpivot by category columns
//!
//! Source shape: one row per (area, year), one column per category. Each
//! configured category becomes one staged row per source row. Year labels
//! come from a column, so they are parsed through the year lookup table the
//! importer fills before running the statements.

use super::years::YearLabelParser;
use super::{
    area_source, insert_prefix, numeric_sql, numeric_view_sql, quote_ident, require_column,
    temp_table, SqlBuilder, SqlParam, StagingContext, StagingPlan, StagingStatement,
    TransformError, YearLookup, RAW_TABLE, ROW_COLUMN, UPSERT_ON_KEY, YEAR_MAP_TABLE,
};
use crate::datasets::{AreaSource, CategoryColumn, DatasetDescriptor, RowFilter, UnpivotCategories};

/// Label column of the year lookup table
pub const YEAR_MAP_LABEL: &str = "__label";

/// Parsed year column of the year lookup table
pub const YEAR_MAP_YEAR: &str = "__year";

/// Where a category's value comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueSource {
    /// A raw column, coerced cell by cell
    Column(String),
    /// An SQL expression over the coerced columns
    Expression(String),
}

pub fn compile(
    descriptor: &DatasetDescriptor,
    format: &UnpivotCategories,
    observed: &[String],
    context: &StagingContext<'_>,
) -> Result<StagingPlan, TransformError> {
    let dataset = descriptor.id.as_str();
    require_column(dataset, "year", &format.year_column, observed)?;
    if let Some(filter) = &format.filter {
        require_column(dataset, "filter", &filter.column, observed)?;
    }
    let area = area_source(descriptor, observed)?;
    let parser = YearLabelParser::new(format.year_parser.as_ref())?;

    let mut statements = Vec::with_capacity(format.columns.len());
    for column in &format.columns {
        let source = resolve_value_source(dataset, column, observed)?;
        let indicator = column
            .indicator
            .as_deref()
            .or(format.indicator.as_deref())
            .ok_or_else(|| {
                TransformError::config(dataset, format!("category '{}' has no indicator", column.category))
            })?;
        let unit = column
            .unit
            .as_deref()
            .or(format.unit.as_deref())
            .ok_or_else(|| {
                TransformError::config(dataset, format!("category '{}' has no unit", column.category))
            })?;

        statements.push(compile_column(
            descriptor,
            format,
            observed,
            area,
            &source,
            indicator,
            unit,
            &column.category,
            context,
        ));
    }

    let lookup = year_lookup(format, parser);
    Ok(StagingPlan::new(statements, Some(lookup)))
}

/// First usable value source: `value_column`, then the first present alias
/// of `value_columns`, then `value_expression`.
pub fn resolve_value_source(
    dataset: &str,
    column: &CategoryColumn,
    observed: &[String],
) -> Result<ValueSource, TransformError> {
    let present = |name: &String| observed.iter().any(|c| c == name);
    let mut tried = Vec::new();

    if let Some(name) = &column.value_column {
        if present(name) {
            return Ok(ValueSource::Column(name.clone()));
        }
        tried.push(name.clone());
    }

    if let Some(aliases) = &column.value_columns {
        if let Some(name) = aliases.iter().find(|name| present(name)) {
            return Ok(ValueSource::Column(name.clone()));
        }
        tried.extend(aliases.iter().cloned());
    }

    if let Some(expression) = &column.value_expression {
        return Ok(ValueSource::Expression(expression.clone()));
    }

    Err(TransformError::NoValueSource {
        dataset: dataset.to_string(),
        category: column.category.clone(),
        tried: if tried.is_empty() {
            "nothing declared".to_string()
        } else {
            tried.join(", ")
        },
    })
}

#[allow(clippy::too_many_arguments)]
fn compile_column(
    descriptor: &DatasetDescriptor,
    format: &UnpivotCategories,
    observed: &[String],
    area: AreaSource<'_>,
    source: &ValueSource,
    indicator: &str,
    unit: &str,
    category: &str,
    context: &StagingContext<'_>,
) -> StagingStatement {
    let raw = temp_table(RAW_TABLE);
    let year_map = temp_table(YEAR_MAP_TABLE);
    let label = quote_ident(YEAR_MAP_LABEL);
    let year = quote_ident(YEAR_MAP_YEAR);
    let row_column = quote_ident(ROW_COLUMN);
    let year_column = quote_ident(&format.year_column);
    let decimal_comma = descriptor.csv.decimal_comma();
    let (value, expression_join) = match source {
        ValueSource::Column(name) => {
            let cell = format!("r.{}", quote_ident(name));
            (numeric_sql(&cell, decimal_comma), None)
        },
        ValueSource::Expression(expression) => (
            numeric_sql("ev.\"__value\"", decimal_comma),
            Some(format!(
                " JOIN (SELECT {row_column}, ({expression}) AS \"__value\" FROM ({})) AS ev \
                 ON ev.{row_column} = r.{row_column}",
                numeric_view_sql(observed, decimal_comma)
            )),
        ),
    };

    let mut builder = SqlBuilder::default();
    insert_prefix(&mut builder, descriptor, context, indicator, unit, category);

    builder
        .sql(" FROM (SELECT ")
        .area(area)
        .sql(&format!(" AS area_name, ym.{year} AS year, {value} AS value"));

    if format.dedupe_by_area_year_keep_last {
        builder
            .sql(", ROW_NUMBER() OVER (PARTITION BY ")
            .area(area)
            .sql(&format!(", ym.{year} ORDER BY r.{row_column} DESC) AS rank_in_year"));
    }

    builder
        .sql(&format!(
            " FROM {raw} AS r JOIN {year_map} AS ym ON ym.{label} = r.{year_column}{} WHERE ",
            expression_join.unwrap_or_default()
        ))
        .area(area)
        .sql(" IS NOT NULL");
    push_filter(&mut builder, format.filter.as_ref());

    builder.sql(") WHERE value IS NOT NULL");
    if format.dedupe_by_area_year_keep_last {
        builder.sql(" AND rank_in_year = 1");
    }
    builder.sql(&format!(" {UPSERT_ON_KEY}"));

    let (sql, params) = builder.finish();
    StagingStatement {
        sql,
        params,
        indicator: indicator.to_string(),
        category: category.to_string(),
    }
}

fn push_filter(builder: &mut SqlBuilder, filter: Option<&RowFilter>) {
    if let Some(filter) = filter {
        builder
            .sql(&format!(" AND trim({}) IN ", quote_ident(&filter.column)))
            .param_list(filter.values.iter().map(|v| SqlParam::from(v.trim())));
    }
}

/// Distinct non-blank labels of the rows the filter keeps
fn year_lookup(format: &UnpivotCategories, parser: YearLabelParser) -> YearLookup {
    let column = quote_ident(&format.year_column);
    let mut builder = SqlBuilder::default();
    builder.sql(&format!(
        "SELECT DISTINCT {column} FROM {} WHERE {column} IS NOT NULL AND trim({column}) <> ''",
        temp_table(RAW_TABLE)
    ));
    push_filter(&mut builder, format.filter.as_ref());

    let (labels_sql, labels_params) = builder.finish();
    YearLookup {
        column: format.year_column.clone(),
        parser,
        labels_sql,
        labels_params,
    }
}
