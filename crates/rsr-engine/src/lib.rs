//! Snapshot reconciliation core: schema registry, row preprocessing and
//! signatures, the diff engine with its corruption guards and identity gate,
//! and the fleet-wide consolidator.
//!
//! Runs for the *same* identity must be serialized by the caller; a run
//! either completes all of its writes or aborts before any write occurs.
//! Consolidation only reads snapshot files and only writes its own master
//! paths, so it never contends with reconciliation runs.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use rsr_core::{
    is_reserved_column, normalize_report_type, parse_date_like, Row, SnapshotIdentity,
    SnapshotMeta, COL_ORIGIN_PERIOD, COL_ORIGIN_PROCESSED_AT, COL_ORIGIN_REGION,
    COL_ORIGIN_SNAPSHOT, COL_ORIGIN_SOURCE, COL_REMOVED_AT, COL_RUN_ID, COL_SIGNATURE,
};
use rsr_storage::{
    file_checksum, master_file_name, meta_path_for, read_meta, read_rows, rotate_backup,
    scan_snapshots, write_meta, write_rows, SnapshotFileSet, SnapshotMode, SnapshotSource,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rsr-engine";

pub const SCHEMA_VERSION: &str = "1.1";

/// Joins signature components. U+001F cannot appear in spreadsheet-export
/// cell text, so values that merely resemble other signatures never collide.
const SIGNATURE_DELIMITER: &str = "\u{1f}";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no schema configured for report type {0}")]
    UnknownReportType(String),
    #[error("schema for report type {0} has an empty primary key")]
    EmptyPrimaryKey(String),
    #[error("download file not found: {0}")]
    MissingInput(PathBuf),
    #[error("snapshot identity mismatch: existing file belongs to {existing}, new snapshot belongs to {requested}; aborting to avoid corruption")]
    IdentityMismatch {
        existing: SnapshotIdentity,
        requested: SnapshotIdentity,
    },
    #[error("refusing empty download for {identity}: previous snapshot holds {prev_rows} rows")]
    EmptyDownload {
        identity: SnapshotIdentity,
        prev_rows: usize,
    },
    #[error("refusing suspected truncated download for {identity}: {next_rows} new rows against {prev_rows} previous (threshold ratio {ratio})")]
    Truncated {
        identity: SnapshotIdentity,
        prev_rows: usize,
        next_rows: usize,
        ratio: f64,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// Schema registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Equals,
    Contains,
    #[serde(alias = "startsWith")]
    StartsWith,
    #[serde(alias = "endsWith")]
    EndsWith,
    Empty,
    #[serde(alias = "notEmpty")]
    NotEmpty,
}

/// One data-driven row filter. A matching rule marks the row as a non-data
/// row (header garbage, totals, footers) to be dropped before diffing.
/// `field: "*"` tests the rule against every column value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    pub field: String,
    pub op: FilterOp,
    #[serde(default)]
    pub value: String,
}

impl FilterRule {
    pub fn matches(&self, row: &Row) -> bool {
        if self.field == "*" {
            return row.iter().any(|(_, value)| self.value_matches(value));
        }
        let value = resolve_column(row, &self.field)
            .and_then(|index| row.value_at(index))
            .unwrap_or("");
        self.value_matches(value)
    }

    fn value_matches(&self, value: &str) -> bool {
        let value = value.trim();
        let needle = self.value.trim();
        match self.op {
            FilterOp::Equals => value.eq_ignore_ascii_case(needle),
            FilterOp::Contains => value.to_lowercase().contains(&needle.to_lowercase()),
            FilterOp::StartsWith => value.to_lowercase().starts_with(&needle.to_lowercase()),
            FilterOp::EndsWith => value.to_lowercase().ends_with(&needle.to_lowercase()),
            FilterOp::Empty => value.is_empty(),
            FilterOp::NotEmpty => !value.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub filter_rules: Vec<FilterRule>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SchemaFile {
    #[serde(default)]
    aliases: HashMap<String, String>,
    #[serde(default)]
    schemas: HashMap<String, SchemaDefinition>,
}

/// Read-only mapping from normalized report type to its schema, loaded once
/// from YAML and injected into the engine and consolidator.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    aliases: HashMap<String, String>,
    schemas: HashMap<String, SchemaDefinition>,
}

impl SchemaRegistry {
    pub fn new(schemas: HashMap<String, SchemaDefinition>) -> Self {
        Self {
            aliases: HashMap::new(),
            schemas: schemas
                .into_iter()
                .map(|(key, schema)| (key.trim().to_uppercase(), schema))
                .collect(),
        }
    }

    pub fn with_aliases(mut self, aliases: HashMap<String, String>) -> Self {
        self.aliases = aliases
            .into_iter()
            .map(|(from, to)| (from.trim().to_uppercase(), to.trim().to_uppercase()))
            .collect();
        self
    }

    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        let file: SchemaFile = serde_yaml::from_str(text).context("parsing schema registry")?;
        Ok(Self::new(file.schemas).with_aliases(file.aliases))
    }

    pub async fn from_path(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn normalize(&self, raw: &str) -> String {
        normalize_report_type(raw, &self.aliases)
    }

    pub fn lookup(&self, raw: &str) -> Option<&SchemaDefinition> {
        self.schemas.get(&self.normalize(raw))
    }

    /// Fails fast: diffing without a usable primary key is refused.
    pub fn get(&self, raw: &str) -> Result<&SchemaDefinition, EngineError> {
        let report_type = self.normalize(raw);
        let schema = self
            .schemas
            .get(&report_type)
            .ok_or_else(|| EngineError::UnknownReportType(report_type.clone()))?;
        if schema.primary_key.is_empty() {
            return Err(EngineError::EmptyPrimaryKey(report_type));
        }
        Ok(schema)
    }
}

// ---------------------------------------------------------------------------
// Column resolution, preprocessing, signatures
// ---------------------------------------------------------------------------

/// Resolves a column reference against a row, trying in order: exact name,
/// positional `#N` / `Col:N` (1-based), `name.K` for the K-th occurrence of
/// a repeated name, then a case-insensitive trimmed fallback.
pub fn resolve_column(row: &Row, reference: &str) -> Option<usize> {
    if let Some(index) = row.names().position(|name| name == reference) {
        return Some(index);
    }

    if let Some(rest) = reference
        .strip_prefix("Col:")
        .or_else(|| reference.strip_prefix('#'))
    {
        if let Ok(position) = rest.trim().parse::<usize>() {
            if position >= 1 && position <= row.len() {
                return Some(position - 1);
            }
            warn!(reference, columns = row.len(), "positional column reference out of range");
            return None;
        }
    }

    if let Some((base, occurrence)) = reference.rsplit_once('.') {
        if let Ok(nth) = occurrence.parse::<usize>() {
            if nth >= 1 {
                let mut seen = 0usize;
                for (index, name) in row.names().enumerate() {
                    if name.trim().eq_ignore_ascii_case(base.trim()) {
                        seen += 1;
                        if seen == nth {
                            return Some(index);
                        }
                    }
                }
                warn!(reference, found = seen, "column occurrence not found");
                return None;
            }
        }
    }

    row.names()
        .position(|name| name.trim().eq_ignore_ascii_case(reference.trim()))
}

/// Date-indicating column references get their values normalized inside
/// signatures, so formatting drift between exports does not churn the diff.
fn looks_date_like(reference: &str) -> bool {
    let lower = reference.to_lowercase();
    lower.contains("date") || lower.contains("data") || lower.starts_with("dt")
}

fn signature_component(reference: &str, header: &str, value: &str) -> String {
    let value = value.trim();
    if looks_date_like(reference) || looks_date_like(header) {
        if let Some(date) = parse_date_like(value) {
            return date.format("%Y-%m-%d").to_string();
        }
    }
    value.to_string()
}

/// Builds the composite signature identifying one logical record. A missing
/// key column is logged and contributes an empty component rather than
/// failing the run.
pub fn build_signature(row: &Row, primary_keys: &[String]) -> String {
    primary_keys
        .iter()
        .map(|key| match resolve_column(row, key) {
            Some(index) => signature_component(
                key,
                row.name_at(index).unwrap_or(""),
                row.value_at(index).unwrap_or(""),
            ),
            None => {
                warn!(key = key.as_str(), "primary key column not found in row");
                String::new()
            }
        })
        .collect::<Vec<_>>()
        .join(SIGNATURE_DELIMITER)
}

/// Runs the shared preprocessing pass: filter-rule pruning, then dropping
/// rows whose every resolved primary-key column is empty. Both sides of a
/// diff must pass through this identically.
pub fn preprocess_rows(
    rows: Vec<Row>,
    filter_rules: &[FilterRule],
    primary_keys: &[String],
) -> Vec<Row> {
    rows.into_iter()
        .filter(|row| !filter_rules.iter().any(|rule| rule.matches(row)))
        .filter(|row| {
            primary_keys.iter().any(|key| {
                resolve_column(row, key)
                    .and_then(|index| row.value_at(index))
                    .map(|value| !value.trim().is_empty())
                    .unwrap_or(false)
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Identity gate
// ---------------------------------------------------------------------------

/// Refuses to reconcile on top of files that belong to a different logical
/// identity. No-op when no metadata exists yet.
pub fn validate_identity(
    existing: Option<&SnapshotMeta>,
    requested: &SnapshotIdentity,
) -> Result<(), EngineError> {
    let Some(meta) = existing else {
        return Ok(());
    };
    if meta.identity != *requested {
        return Err(EngineError::IdentityMismatch {
            existing: meta.identity.clone(),
            requested: requested.clone(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Diff engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Guard B threshold: abort when the new row count falls below this
    /// fraction of the previous count.
    pub truncation_ratio: f64,
    /// Backups kept per identity before pruning.
    pub backup_retention: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            truncation_ratio: 0.5,
            backup_retention: 3,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            truncation_ratio: std::env::var("RSR_TRUNCATION_RATIO")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.truncation_ratio),
            backup_retention: std::env::var("RSR_BACKUP_RETENTION")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.backup_retention),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiffOutcome {
    pub run_id: Uuid,
    pub added: usize,
    pub removed: usize,
    pub current_rows: usize,
    pub deleted_file: PathBuf,
    pub meta_file: PathBuf,
    pub primary_key_used: Vec<String>,
}

pub struct DiffEngine {
    registry: SchemaRegistry,
    config: EngineConfig,
}

impl DiffEngine {
    pub fn new(registry: SchemaRegistry, config: EngineConfig) -> Self {
        Self { registry, config }
    }

    /// Reconciles one freshly downloaded export against the identity's
    /// stored snapshot. All guards run before any write; a guard failure
    /// leaves the disk untouched.
    pub async fn run(
        &self,
        identity: &SnapshotIdentity,
        new_file: &Path,
        base_dir: &Path,
        pk_override: Option<&[String]>,
    ) -> Result<DiffOutcome, EngineError> {
        let run_id = Uuid::new_v4();
        let identity = SnapshotIdentity {
            report_type: self.registry.normalize(&identity.report_type),
            period: identity.period.clone(),
            region: identity.region.clone(),
        };
        info!(%identity, %run_id, "reconciling snapshot");

        if !fs::try_exists(new_file)
            .await
            .with_context(|| format!("checking {}", new_file.display()))?
        {
            return Err(EngineError::MissingInput(new_file.to_path_buf()));
        }

        // Caller override wins over the configured schema; filter rules
        // always come from the schema when one exists.
        let schema = self.registry.lookup(&identity.report_type);
        let primary_keys: Vec<String> = match pk_override {
            Some(keys) if !keys.is_empty() => {
                info!(keys = ?keys, "using caller-supplied primary keys");
                keys.to_vec()
            }
            _ => self.registry.get(&identity.report_type)?.primary_key.clone(),
        };
        let filter_rules: Vec<FilterRule> = schema
            .map(|s| s.filter_rules.clone())
            .unwrap_or_default();

        let files = SnapshotFileSet::resolve(base_dir, &identity);

        let next_raw = read_rows(new_file).await?;
        let next_rows = preprocess_rows(next_raw, &filter_rules, &primary_keys);

        let mut prev_rows = Vec::new();
        if fs::try_exists(&files.current)
            .await
            .with_context(|| format!("checking {}", files.current.display()))?
        {
            match read_rows(&files.current).await {
                Ok(rows) => prev_rows = preprocess_rows(rows, &filter_rules, &primary_keys),
                Err(err) => warn!(
                    error = %format!("{err:#}"),
                    "previous current file unreadable, treating as first run"
                ),
            }
        }

        // Guard A: an empty export with prior history is a failed fetch,
        // not a mass deletion.
        if next_rows.is_empty() && !prev_rows.is_empty() {
            return Err(EngineError::EmptyDownload {
                identity,
                prev_rows: prev_rows.len(),
            });
        }

        // Guard B: a drastic shrink is a suspected partial download.
        if !prev_rows.is_empty()
            && (next_rows.len() as f64) < self.config.truncation_ratio * prev_rows.len() as f64
        {
            return Err(EngineError::Truncated {
                identity,
                prev_rows: prev_rows.len(),
                next_rows: next_rows.len(),
                ratio: self.config.truncation_ratio,
            });
        }

        // Identity gate, with a period audit line so cross-period removals
        // can be diagnosed from the logs.
        match read_meta(&files.meta).await {
            Ok(Some(meta)) => {
                info!(
                    previous_period = meta.identity.period.as_str(),
                    new_period = identity.period.as_str(),
                    "snapshot period audit"
                );
                validate_identity(Some(&meta), &identity)?;
            }
            Ok(None) => {}
            Err(err) => warn!(
                error = %format!("{err:#}"),
                "snapshot meta unreadable, skipping identity gate"
            ),
        }

        let next_signatures: HashSet<String> = next_rows
            .iter()
            .map(|row| build_signature(row, &primary_keys))
            .collect();
        let mut prev_signatures: HashSet<String> = HashSet::new();
        let mut removed_rows: Vec<(String, Row)> = Vec::new();
        for row in &prev_rows {
            let signature = build_signature(row, &primary_keys);
            if prev_signatures.insert(signature.clone()) && !next_signatures.contains(&signature) {
                removed_rows.push((signature, row.clone()));
            }
        }
        let added = next_signatures.difference(&prev_signatures).count();

        // The ledger only grows. A corrupt ledger blocks the run instead of
        // being overwritten.
        let mut ledger = Vec::new();
        if fs::try_exists(&files.deleted)
            .await
            .with_context(|| format!("checking {}", files.deleted.display()))?
        {
            ledger = read_rows(&files.deleted)
                .await
                .context("reading deletion ledger")?;
        }
        let known_signatures: HashSet<String> = ledger
            .iter()
            .filter_map(|row| row.value(COL_SIGNATURE))
            .map(str::to_string)
            .collect();

        let removed_at = Utc::now().to_rfc3339();
        let mut newly_removed = 0usize;
        for (signature, row) in removed_rows {
            if known_signatures.contains(&signature) {
                continue;
            }
            let mut entry = row;
            entry.push(COL_SIGNATURE, signature);
            entry.push(COL_REMOVED_AT, removed_at.clone());
            entry.push(COL_RUN_ID, run_id.to_string());
            ledger.push(entry);
            newly_removed += 1;
        }

        // Every guard has passed: writes start here. The outgoing current
        // file is backed up first as the last line of defense.
        rotate_backup(&files.current, self.config.backup_retention).await?;
        if !ledger.is_empty() {
            write_rows(&files.deleted, &ledger).await?;
        }
        write_rows(&files.current, &next_rows).await?;

        let checksum = file_checksum(&files.current).await?;
        let meta = SnapshotMeta {
            identity: identity.clone(),
            last_updated: Utc::now(),
            schema_version: SCHEMA_VERSION.to_string(),
            primary_key_used: primary_keys.clone(),
            row_count: next_rows.len(),
            checksum,
        };
        write_meta(&files.meta, &meta).await?;

        info!(
            added,
            removed = newly_removed,
            rows = next_rows.len(),
            "reconciliation complete"
        );
        Ok(DiffOutcome {
            run_id,
            added,
            removed: newly_removed,
            current_rows: next_rows.len(),
            deleted_file: files.deleted,
            meta_file: files.meta,
            primary_key_used: primary_keys,
        })
    }
}

// ---------------------------------------------------------------------------
// Consolidator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ConsolidatorConfig {
    /// The engine's internal snapshot storage root (`root/<source>/<file>`).
    pub snapshots_root: PathBuf,
    /// Externally configured destination directories also scanned for
    /// snapshots (`dir/<subdir>/<file>`).
    pub extra_roots: Vec<PathBuf>,
    /// Optional source id -> display name mapping for provenance columns.
    pub source_names: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct MasterOutcome {
    pub report_type: String,
    pub current_file: Option<PathBuf>,
    pub deleted_file: Option<PathBuf>,
    pub current_rows: usize,
    pub deleted_rows: usize,
}

pub struct Consolidator {
    registry: SchemaRegistry,
    config: ConsolidatorConfig,
}

impl Consolidator {
    pub fn new(registry: SchemaRegistry, config: ConsolidatorConfig) -> Self {
        Self { registry, config }
    }

    /// Rebuilds both master files for a report type from every snapshot on
    /// disk. Pure function of the current snapshot set; nothing incremental.
    pub async fn consolidate(
        &self,
        report_type: &str,
        destination: &Path,
        pk_override: Option<&[String]>,
    ) -> Result<MasterOutcome, EngineError> {
        let report_type = self.registry.normalize(report_type);
        info!(report_type = report_type.as_str(), destination = %destination.display(), "rebuilding master files");
        fs::create_dir_all(destination)
            .await
            .with_context(|| format!("creating {}", destination.display()))?;

        let (current_file, current_rows) = self
            .merge(&report_type, SnapshotMode::Current, destination, pk_override)
            .await?;
        let (deleted_file, deleted_rows) = self
            .merge(&report_type, SnapshotMode::Deleted, destination, pk_override)
            .await?;

        Ok(MasterOutcome {
            report_type,
            current_file,
            deleted_file,
            current_rows,
            deleted_rows,
        })
    }

    async fn merge(
        &self,
        report_type: &str,
        mode: SnapshotMode,
        destination: &Path,
        pk_override: Option<&[String]>,
    ) -> Result<(Option<PathBuf>, usize), EngineError> {
        let mut roots = vec![
            self.config.snapshots_root.clone(),
            destination.to_path_buf(),
        ];
        roots.extend(self.config.extra_roots.iter().cloned());

        let mut sources = scan_snapshots(&roots, report_type, mode).await;
        if sources.is_empty() {
            info!(
                report_type,
                mode = mode.as_str(),
                "no snapshots found to consolidate"
            );
            return Ok((None, 0));
        }
        // Most recently modified first, so the newest source wins dedup.
        sources.sort_by(|a, b| b.modified.cmp(&a.modified));

        let mut join_set = JoinSet::new();
        for (index, source) in sources.into_iter().enumerate() {
            let display_name = self
                .config
                .source_names
                .get(&source.source_id)
                .cloned()
                .unwrap_or_else(|| source.source_id.clone());
            join_set.spawn(async move {
                let loaded = load_tagged_rows(&source, &display_name).await;
                (index, source, loaded)
            });
        }

        let mut loaded: Vec<Option<TaggedSnapshot>> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let (index, source, result) = joined.context("joining snapshot read task")?;
            if loaded.len() <= index {
                loaded.resize_with(index + 1, || None);
            }
            match result {
                Ok(snapshot) => loaded[index] = Some(snapshot),
                Err(err) => warn!(
                    path = %source.path.display(),
                    error = %format!("{err:#}"),
                    "skipping unreadable snapshot"
                ),
            }
        }

        // Newest-first order means the first metadata seen carries the keys
        // of the most recent reconciliation run.
        let mut master: Vec<Row> = Vec::new();
        let mut latest_run_keys: Option<Vec<String>> = None;
        for snapshot in loaded.into_iter().flatten() {
            if latest_run_keys.is_none() {
                latest_run_keys = snapshot.primary_key_used.filter(|keys| !keys.is_empty());
            }
            master.extend(snapshot.rows);
        }
        let initial = master.len();

        let primary_keys: Vec<String> = match pk_override {
            Some(keys) if !keys.is_empty() => keys.to_vec(),
            _ => latest_run_keys.unwrap_or_else(|| {
                self.registry
                    .lookup(report_type)
                    .map(|schema| schema.primary_key.clone())
                    .unwrap_or_default()
            }),
        };
        master = dedup_rows(master, &primary_keys);
        if initial > master.len() {
            info!(
                report_type,
                mode = mode.as_str(),
                duplicates = initial - master.len(),
                "dropped duplicate rows from older snapshots"
            );
        }
        if master.is_empty() {
            return Ok((None, 0));
        }

        let output = destination.join(master_file_name(report_type, mode));
        write_rows(&output, &master).await?;
        info!(
            report_type,
            mode = mode.as_str(),
            rows = master.len(),
            output = %output.display(),
            "master file rebuilt"
        );
        Ok((Some(output), master.len()))
    }
}

struct TaggedSnapshot {
    rows: Vec<Row>,
    primary_key_used: Option<Vec<String>>,
}

/// Reads one snapshot file and tags every row with provenance columns. The
/// processing timestamp and reconciliation keys come from the paired
/// metadata when readable; the timestamp falls back to the file's own
/// modification time.
async fn load_tagged_rows(
    source: &SnapshotSource,
    display_name: &str,
) -> anyhow::Result<TaggedSnapshot> {
    let rows = read_rows(&source.path).await?;
    let (processed_at, primary_key_used) = match read_meta(&meta_path_for(&source.path)).await {
        Ok(Some(meta)) => (meta.last_updated.to_rfc3339(), Some(meta.primary_key_used)),
        _ => (DateTime::<Utc>::from(source.modified).to_rfc3339(), None),
    };

    debug!(path = %source.path.display(), rows = rows.len(), "loaded snapshot for consolidation");
    let rows = rows
        .into_iter()
        .map(|row| {
            let mut tagged = Row::new();
            tagged.push(COL_ORIGIN_PERIOD, source.period.clone());
            tagged.push(COL_ORIGIN_REGION, source.region.clone());
            tagged.push(COL_ORIGIN_SOURCE, display_name.to_string());
            tagged.push(COL_ORIGIN_PROCESSED_AT, processed_at.clone());
            tagged.push(COL_ORIGIN_SNAPSHOT, source.file_name.clone());
            tagged.extend(row.iter().map(|(name, value)| (name.to_string(), value.to_string())));
            tagged
        })
        .collect();
    Ok(TaggedSnapshot {
        rows,
        primary_key_used,
    })
}

/// Keeps the first occurrence per signature; rows arrive newest-first, so
/// the most recently modified source wins. Positional/occurrence column
/// forms are not used here because provenance columns shift positions.
fn dedup_rows(rows: Vec<Row>, primary_keys: &[String]) -> Vec<Row> {
    let mut seen: HashSet<String> = HashSet::new();
    rows.into_iter()
        .filter(|row| {
            let signature = if primary_keys.is_empty() {
                full_row_signature(row)
            } else {
                consolidation_signature(row, primary_keys)
            };
            seen.insert(signature)
        })
        .collect()
}

fn consolidation_signature(row: &Row, primary_keys: &[String]) -> String {
    primary_keys
        .iter()
        .map(|key| {
            let resolved = row
                .iter()
                .find(|(name, _)| *name == key.as_str())
                .or_else(|| {
                    row.iter()
                        .find(|(name, _)| name.trim().eq_ignore_ascii_case(key.trim()))
                });
            match resolved {
                Some((name, value)) => signature_component(key, name, value),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(SIGNATURE_DELIMITER)
}

/// Last-resort identity: every factual (non-reserved) column value.
fn full_row_signature(row: &Row) -> String {
    row.iter()
        .filter(|(name, _)| !is_reserved_column(name))
        .map(|(_, value)| value.trim())
        .collect::<Vec<_>>()
        .join("|")
}
