//! Core domain model for RSR: snapshot identities, snapshot metadata, and
//! the ordered-row record exchanged between the diff engine and the
//! consolidator.

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "rsr-core";

/// Columns the diff engine appends to deletion-ledger rows.
pub const COL_SIGNATURE: &str = "rsr_signature";
pub const COL_REMOVED_AT: &str = "rsr_removed_at";
pub const COL_RUN_ID: &str = "rsr_run_id";

/// Provenance columns the consolidator prepends to master rows.
pub const COL_ORIGIN_PERIOD: &str = "ORIGIN_PERIOD";
pub const COL_ORIGIN_REGION: &str = "ORIGIN_REGION";
pub const COL_ORIGIN_SOURCE: &str = "ORIGIN_SOURCE";
pub const COL_ORIGIN_PROCESSED_AT: &str = "ORIGIN_PROCESSED_AT";
pub const COL_ORIGIN_SNAPSHOT: &str = "ORIGIN_SNAPSHOT";

pub const PROVENANCE_COLUMNS: [&str; 5] = [
    COL_ORIGIN_PERIOD,
    COL_ORIGIN_REGION,
    COL_ORIGIN_SOURCE,
    COL_ORIGIN_PROCESSED_AT,
    COL_ORIGIN_SNAPSHOT,
];

/// True for columns owned by the engine rather than the upstream export.
pub fn is_reserved_column(name: &str) -> bool {
    name.starts_with("rsr_") || PROVENANCE_COLUMNS.contains(&name)
}

/// Addressing key for every per-source snapshot file triplet. Two identities
/// are equal only if all three fields match exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotIdentity {
    pub report_type: String,
    pub period: String,
    pub region: String,
}

impl std::fmt::Display for SnapshotIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}_{})", self.report_type, self.period, self.region)
    }
}

/// Structured record written next to every `current` file. Overwritten on
/// each successful reconciliation; its identity feeds the identity gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    pub identity: SnapshotIdentity,
    pub last_updated: DateTime<Utc>,
    pub schema_version: String,
    pub primary_key_used: Vec<String>,
    pub row_count: usize,
    pub checksum: String,
}

/// One parsed row of a tabular export: an ordered column -> value mapping.
/// Duplicate column names are allowed, since upstream exports are not
/// schema-controlled.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Row {
    cols: Vec<(String, String)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        Self { cols: pairs }
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.cols.push((name.into(), value.into()));
    }

    pub fn len(&self) -> usize {
        self.cols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cols.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.cols.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cols
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.cols.get(index).map(|(name, _)| name.as_str())
    }

    pub fn value_at(&self, index: usize) -> Option<&str> {
        self.cols.get(index).map(|(_, value)| value.as_str())
    }

    /// First value under an exactly matching column name.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.cols
            .iter()
            .find(|(col, _)| col == name)
            .map(|(_, value)| value.as_str())
    }

    /// K-th (1-based) value under a repeated column name.
    pub fn nth_value(&self, name: &str, occurrence: usize) -> Option<&str> {
        self.cols
            .iter()
            .filter(|(col, _)| col.trim().eq_ignore_ascii_case(name.trim()))
            .nth(occurrence.checked_sub(1)?)
            .map(|(_, value)| value.as_str())
    }

    pub fn numeric_value(&self, name: &str) -> Option<f64> {
        self.value(name)?.trim().parse().ok()
    }

    pub fn date_value(&self, name: &str) -> Option<NaiveDate> {
        parse_date_like(self.value(name)?)
    }

    /// True when every cell is empty after trimming. Trailing export rows
    /// frequently look like this.
    pub fn is_blank(&self) -> bool {
        self.cols.iter().all(|(_, value)| value.trim().is_empty())
    }
}

impl Extend<(String, String)> for Row {
    fn extend<T: IntoIterator<Item = (String, String)>>(&mut self, iter: T) {
        self.cols.extend(iter);
    }
}

/// Canonicalizes a report type: uppercased, trimmed, then mapped through the
/// configured alias table (typically plural -> singular forms).
pub fn normalize_report_type(raw: &str, aliases: &HashMap<String, String>) -> String {
    let normalized = raw.trim().to_uppercase();
    if normalized.is_empty() {
        return "GENERAL".to_string();
    }
    aliases
        .get(&normalized)
        .map(|canonical| canonical.trim().to_uppercase())
        .unwrap_or(normalized)
}

/// Day 0 of the spreadsheet serial-date encoding.
fn serial_date_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1899, 12, 30).expect("valid epoch date")
}

/// Parses a date-like cell value, tolerating day-first and month-first
/// orderings, ISO dates, an optional time suffix, and spreadsheet serial
/// numbers. Returns `None` for anything that is not recognizably a date.
pub fn parse_date_like(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    // "05/02/2026 14:30:00" and "2026-02-05T14:30:00" both reduce to the
    // leading date token.
    let date_part = trimmed
        .split(|c: char| c == ' ' || c == 'T')
        .next()
        .unwrap_or(trimmed);

    // Serial dates arrive as bare numbers, possibly with a fractional time
    // part. Values below 20000 (~1954) are rejected so that a bare 4-digit
    // year is never misread as a serial.
    if !date_part.contains(['/', '-', ':']) {
        let serial: f64 = date_part.parse().ok()?;
        if (20_000.0..1_000_000.0).contains(&serial) {
            return serial_date_epoch().checked_add_signed(Duration::days(serial as i64));
        }
        return None;
    }

    const FORMATS: [&str; 8] = [
        "%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%d-%m-%Y", "%m-%d-%Y", "%Y/%m/%d", "%d/%m/%y",
        "%m/%d/%y",
    ];
    FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(date_part, format).ok())
}
