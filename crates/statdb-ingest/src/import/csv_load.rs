//! Raw CSV loading
//!
//! The file is decoded with the declared encoding, falling back to the
//! declared alternatives only when decoding fails. Records land in the raw
//! TEMP table as TEXT (blank cells as NULL) with their 1-based record
//! number in [`ROW_COLUMN`].

use super::ImportError;
use crate::datasets::{CsvOptions, Encoding};
use crate::transform::{
    dedupe_raw_headers, plan_header_renames, quote_ident, temp_table, HeaderRename, RAW_TABLE,
    ROW_COLUMN,
};
use encoding_rs::{UTF_8, WINDOWS_1252};
use sqlx::{Connection, SqliteConnection};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

/// Result of loading one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedCsv {
    /// Raw table columns, excluding the record number
    pub columns: Vec<String>,
    pub rows: u64,
    pub encoding: Encoding,
}

/// Bytes that are invalid in an encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeFailure {
    pub encoding: Encoding,
    /// Length of the valid UTF-8 prefix, when known
    pub valid_up_to: Option<usize>,
}

/// Decode `bytes` strictly; a UTF-8 byte order mark is dropped
///
/// `latin-1` maps every byte to the code point of the same value, while
/// `windows-1252` follows the WHATWG table for 0x80..=0x9F.
pub fn decode(bytes: &[u8], encoding: Encoding) -> Result<String, DecodeFailure> {
    let decoded = match encoding {
        Encoding::Utf8 => {
            let bytes = match encoding_rs::Encoding::for_bom(bytes) {
                Some((codec, bom_length)) if codec == UTF_8 => &bytes[bom_length..],
                _ => bytes,
            };
            UTF_8
                .decode_without_bom_handling_and_without_replacement(bytes)
                .ok_or_else(|| DecodeFailure {
                    encoding,
                    valid_up_to: Some(encoding_rs::Encoding::utf8_valid_up_to(bytes)),
                })?
        },
        Encoding::Latin1 => encoding_rs::mem::decode_latin1(bytes),
        Encoding::Windows1252 => WINDOWS_1252
            .decode_without_bom_handling_and_without_replacement(bytes)
            .ok_or(DecodeFailure {
                encoding,
                valid_up_to: None,
            })?,
    };
    Ok(decoded.into_owned())
}

/// Try the declared encoding, then each fallback, on decode errors only
pub fn decode_with_fallback(bytes: &[u8], options: &CsvOptions) -> Result<(String, Encoding), ImportError> {
    let mut failures = Vec::new();
    for encoding in options.encodings() {
        match decode(bytes, encoding) {
            Ok(text) => {
                if !failures.is_empty() {
                    warn!(%encoding, "Decoded with fallback encoding");
                }
                return Ok((text, encoding));
            },
            Err(failure) => {
                debug!(%encoding, valid_up_to = ?failure.valid_up_to, "Decode failed");
                failures.push(match failure.valid_up_to {
                    Some(offset) => format!("{} (invalid byte at offset {offset})", failure.encoding),
                    None => format!("{} (malformed input)", failure.encoding),
                });
            },
        }
    }
    Err(ImportError::Decode(failures.join(", ")))
}

/// Parse decoded text into a header and records
///
/// Short records are padded; extra trailing fields are accepted only when
/// blank (a trailing delimiter).
pub fn parse_records(text: &str, options: &CsvOptions) -> Result<(Vec<String>, Vec<Vec<Option<String>>>), ImportError> {
    let mut builder = csv::ReaderBuilder::new();
    builder
        .has_headers(true)
        .flexible(true)
        .delimiter(ascii_byte(options.delimiter, "delimiter")?)
        .quote(ascii_byte(options.quote, "quote")?);
    if let Some(escape) = options.escape {
        builder.escape(Some(ascii_byte(escape, "escape")?)).double_quote(false);
    }
    let mut reader = builder.from_reader(text.as_bytes());

    let mut headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    while headers.last().is_some_and(|h| h.trim().is_empty()) && headers.len() > 1 {
        headers.pop();
    }
    if headers.is_empty() || (headers.len() == 1 && headers[0].trim().is_empty()) {
        return Err(ImportError::Csv("file has no header row".into()));
    }

    let width = headers.len();
    let mut records = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        if record.iter().skip(width).any(|field| !field.trim().is_empty()) {
            return Err(ImportError::Csv(format!(
                "record {} has {} fields, header has {}",
                index + 1,
                record.len(),
                width
            )));
        }

        let mut row: Vec<Option<String>> = record
            .iter()
            .take(width)
            .map(|field| (!field.trim().is_empty()).then(|| field.to_string()))
            .collect();
        row.resize(width, None);
        records.push(row);
    }

    Ok((headers, records))
}

fn ascii_byte(c: char, what: &str) -> Result<u8, ImportError> {
    u8::try_from(c)
        .ok()
        .filter(u8::is_ascii)
        .ok_or_else(|| ImportError::Config(format!("{what} '{c}' must be a single-byte character")))
}

/// Load `path` into the raw TEMP table on `conn`, replacing any previous one
pub async fn load_csv_temp_table(
    conn: &mut SqliteConnection,
    path: &Path,
    options: &CsvOptions,
) -> Result<LoadedCsv, ImportError> {
    let bytes = tokio::fs::read(path).await?;
    let (text, encoding) = decode_with_fallback(&bytes, options)?;
    let (headers, records) = parse_records(&text, options)?;

    let columns = dedupe_raw_headers(&headers);
    if columns.iter().any(|c| c == ROW_COLUMN) {
        return Err(ImportError::Csv(format!("column name '{ROW_COLUMN}' is reserved")));
    }

    let table = temp_table(RAW_TABLE);
    let definitions: Vec<String> = columns.iter().map(|c| format!("{} TEXT", quote_ident(c))).collect();
    let row_column = quote_ident(ROW_COLUMN);

    sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
        .execute(&mut *conn)
        .await?;
    sqlx::query(&format!(
        "CREATE TEMP TABLE {} ({}, {row_column} INTEGER PRIMARY KEY)",
        quote_ident(RAW_TABLE),
        definitions.join(", ")
    ))
    .execute(&mut *conn)
    .await?;

    let placeholders = vec!["?"; columns.len() + 1].join(", ");
    let insert = format!("INSERT INTO {table} VALUES ({placeholders})");

    let mut tx = conn.begin().await?;
    for (index, record) in records.iter().enumerate() {
        let mut query = sqlx::query(&insert);
        for cell in record {
            query = query.bind(cell.as_deref());
        }
        let row_number = i64::try_from(index + 1).unwrap_or(i64::MAX);
        query.bind(row_number).execute(&mut *tx).await?;
    }
    tx.commit().await?;

    let rows = records.len() as u64;
    debug!(rows, columns = columns.len(), %encoding, "CSV loaded");
    Ok(LoadedCsv {
        columns,
        rows,
        encoding,
    })
}

/// Trim headers and apply aliases on the raw table
///
/// Returns the normalized column list.
pub async fn normalize_headers(
    conn: &mut SqliteConnection,
    columns: &[String],
    aliases: &BTreeMap<String, String>,
) -> Result<Vec<String>, ImportError> {
    let (normalized, renames) = plan_header_renames(columns, aliases)?;
    if renames.is_empty() {
        return Ok(normalized);
    }

    // Two passes so renames that swap names never collide midway
    let table = temp_table(RAW_TABLE);
    let parked: Vec<(String, &HeaderRename)> = renames
        .iter()
        .enumerate()
        .map(|(i, rename)| (format!("__rename_{i}"), rename))
        .collect();

    for (parking, rename) in &parked {
        rename_column(conn, &table, &rename.from, parking).await?;
    }
    for (parking, rename) in &parked {
        rename_column(conn, &table, parking, &rename.to).await?;
    }

    debug!(renamed = renames.len(), "Headers normalized");
    Ok(normalized)
}

async fn rename_column(conn: &mut SqliteConnection, table: &str, from: &str, to: &str) -> Result<(), ImportError> {
    sqlx::query(&format!(
        "ALTER TABLE {table} RENAME COLUMN {} TO {}",
        quote_ident(from),
        quote_ident(to)
    ))
    .execute(&mut *conn)
    .await?;
    Ok(())
}
