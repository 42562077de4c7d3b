//! Unpivot by year columns
//!
//! Source shape: one row per (indicator, area), one column per year. Each
//! configured row selects the records whose indicator column equals its
//! filter value and unpivots every year column into `(year, value)`.
//! When several columns carry the same year, the one declared last wins.

use super::years::{compile_regex, YearLabelParser, DEFAULT_COLUMN_PATTERN};
use super::{
    area_source, insert_prefix, numeric_sql, quote_ident, require_column, temp_table, SqlBuilder,
    StagingContext, StagingPlan, StagingStatement, TransformError, RAW_TABLE, ROW_COLUMN,
    UPSERT_ON_KEY,
};
use crate::datasets::{AreaSource, DatasetDescriptor, UnpivotYears, YearRow};

/// A year-bearing column and the year it carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YearColumn {
    pub column: String,
    pub year: i64,
}

pub fn compile(
    descriptor: &DatasetDescriptor,
    format: &UnpivotYears,
    observed: &[String],
    context: &StagingContext<'_>,
) -> Result<StagingPlan, TransformError> {
    require_column(&descriptor.id, "indicator", &format.indicator_column, observed)?;
    let area = area_source(descriptor, observed)?;
    let year_columns = resolve_year_columns(descriptor, format, observed)?;

    let statements = format
        .rows
        .iter()
        .map(|row| compile_row(descriptor, format, row, area, &year_columns, context))
        .collect();

    Ok(StagingPlan::new(statements, None))
}

/// Year columns in declared order, each label parsed and range checked
pub fn resolve_year_columns(
    descriptor: &DatasetDescriptor,
    format: &UnpivotYears,
    observed: &[String],
) -> Result<Vec<YearColumn>, TransformError> {
    let columns: Vec<String> = match &format.year_columns {
        Some(declared) => {
            for column in declared {
                require_column(&descriptor.id, "year", column, observed)?;
            }
            declared.clone()
        },
        None => {
            let pattern = format.year_pattern.as_deref().unwrap_or(DEFAULT_COLUMN_PATTERN);
            let regex = compile_regex(pattern)?;
            let matched: Vec<String> = observed.iter().filter(|c| regex.is_match(c)).cloned().collect();
            if matched.is_empty() {
                return Err(TransformError::NoYearColumns {
                    dataset: descriptor.id.clone(),
                    pattern: pattern.to_string(),
                });
            }
            matched
        },
    };

    let parser = YearLabelParser::new(format.year_parser.as_ref())?;
    let parsed = parser.parse_all(columns)?;
    Ok(parsed
        .into_iter()
        .map(|(column, year)| YearColumn { column, year })
        .collect())
}

fn compile_row(
    descriptor: &DatasetDescriptor,
    format: &UnpivotYears,
    row: &YearRow,
    area: AreaSource<'_>,
    year_columns: &[YearColumn],
    context: &StagingContext<'_>,
) -> StagingStatement {
    let decimal_comma = descriptor.csv.decimal_comma();
    let indicator_column = quote_ident(&format.indicator_column);
    let raw = temp_table(RAW_TABLE);
    let row_column = quote_ident(ROW_COLUMN);
    let value = row
        .value_expression
        .as_deref()
        .map(|expression| format!("({expression})"))
        .unwrap_or_else(|| "value".to_string());

    let mut builder = SqlBuilder::default();
    insert_prefix(&mut builder, descriptor, context, &row.indicator, &row.unit, &row.category);

    builder.sql(&format!(
        " FROM (SELECT area_name, year, {value} AS value FROM (\
         SELECT area_name, year, value, ROW_NUMBER() OVER (\
         PARTITION BY area_name, year ORDER BY ordinal DESC, {row_column} DESC) AS rank_in_year \
         FROM ("
    ));

    for (ordinal, year_column) in year_columns.iter().enumerate() {
        if ordinal > 0 {
            builder.sql(" UNION ALL ");
        }
        let cell = numeric_sql(&quote_ident(&year_column.column), decimal_comma);
        builder
            .sql("SELECT ")
            .area(area)
            .sql(" AS area_name, ")
            .param(year_column.year)
            .sql(&format!(
                " AS year, {cell} AS value, {ordinal} AS ordinal, {row_column} FROM {raw} WHERE trim({indicator_column}) = "
            ))
            .param(row.filter_value.trim());
    }

    builder.sql(&format!(
        ") WHERE value IS NOT NULL AND area_name IS NOT NULL\
         ) WHERE rank_in_year = 1\
         ) WHERE value IS NOT NULL {UPSERT_ON_KEY}"
    ));

    let (sql, params) = builder.finish();
    StagingStatement {
        sql,
        params,
        indicator: row.indicator.clone(),
        category: row.category.clone(),
    }
}
