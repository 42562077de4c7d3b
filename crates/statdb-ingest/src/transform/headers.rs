//! Header handling for raw CSV tables
//!
//! Loading keeps headers byte-for-byte except that exact duplicates get a
//! `_1`, `_2`, ... suffix so each becomes its own column. Normalization then
//! trims every name and applies the dataset's aliases; two columns ending up
//! with the same name is a configuration error.

use super::TransformError;
use std::collections::{BTreeMap, HashMap, HashSet};

/// One column rename produced by normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRename {
    pub from: String,
    pub to: String,
}

/// Make raw headers unique; blank headers become `column_N` (1-based)
pub fn dedupe_raw_headers(headers: &[String]) -> Vec<String> {
    let mut taken: HashSet<String> = HashSet::new();
    let mut result = Vec::with_capacity(headers.len());

    for (index, header) in headers.iter().enumerate() {
        let base = if header.trim().is_empty() {
            format!("column_{}", index + 1)
        } else {
            header.clone()
        };

        let mut name = base.clone();
        let mut suffix = 1;
        while taken.contains(&name) {
            name = format!("{base}_{suffix}");
            suffix += 1;
        }
        taken.insert(name.clone());
        result.push(name);
    }
    result
}

/// Compute normalized names and the renames that produce them
///
/// Returns the normalized column list (same order as `raw`) and the renames
/// for columns whose name changes.
pub fn plan_header_renames(
    raw: &[String],
    aliases: &BTreeMap<String, String>,
) -> Result<(Vec<String>, Vec<HeaderRename>), TransformError> {
    let mut claimed: HashMap<String, &str> = HashMap::new();
    let mut normalized = Vec::with_capacity(raw.len());
    let mut renames = Vec::new();

    for original in raw {
        let trimmed = original.trim();
        let name = aliases
            .get(trimmed)
            .map(|alias| alias.trim().to_string())
            .unwrap_or_else(|| trimmed.to_string());

        if let Some(first) = claimed.get(&name) {
            return Err(TransformError::HeaderCollision {
                name,
                first: first.to_string(),
                second: original.clone(),
            });
        }
        claimed.insert(name.clone(), original.as_str());

        if name != *original {
            renames.push(HeaderRename {
                from: original.clone(),
                to: name.clone(),
            });
        }
        normalized.push(name);
    }

    Ok((normalized, renames))
}
