//! Snapshot file layout and persistence: deterministic path resolution,
//! CSV tabular read/write with atomic renames, content checksums, metadata
//! records, backup rotation, and fleet-wide snapshot discovery.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context;
use chrono::Utc;
use rsr_core::{Row, SnapshotIdentity, SnapshotMeta};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rsr-storage";

pub const DATA_EXT: &str = "csv";
pub const META_EXT: &str = "json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    Current,
    Deleted,
    Meta,
}

impl SnapshotMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Current => "CURRENT",
            Self::Deleted => "DELETED",
            Self::Meta => "META",
        }
    }
}

/// `{TYPE}_{MODE}_{PERIOD}_{REGION}.{ext}`: the one filename pattern every
/// component agrees on.
pub fn snapshot_file_name(
    report_type: &str,
    mode: SnapshotMode,
    period: &str,
    region: &str,
) -> String {
    let extension = match mode {
        SnapshotMode::Meta => META_EXT,
        _ => DATA_EXT,
    };
    format!(
        "{report_type}_{}_{period}_{region}.{extension}",
        mode.as_str()
    )
}

/// Fleet-wide master file name for a report type.
pub fn master_file_name(report_type: &str, mode: SnapshotMode) -> String {
    let suffix = match mode {
        SnapshotMode::Deleted => "_EXCLUIDOS",
        _ => "",
    };
    format!("CONSOLIDADO{suffix}_{report_type}_MASTER.{DATA_EXT}")
}

/// Recovers `(period, region)` from a snapshot filename, or `None` when the
/// name does not belong to the given report type and mode. The period may
/// itself contain underscores; the region is the final segment.
pub fn parse_snapshot_file_name(
    file_name: &str,
    report_type: &str,
    mode: SnapshotMode,
) -> Option<(String, String)> {
    let upper = file_name.to_uppercase();
    let prefix = format!("{}_{}_", report_type.to_uppercase(), mode.as_str());
    let ext_suffix = format!(".{}", DATA_EXT.to_uppercase());
    if !upper.starts_with(&prefix) || !upper.ends_with(&ext_suffix) {
        return None;
    }
    if !file_name.is_char_boundary(prefix.len()) {
        return None;
    }
    let stem = &file_name[prefix.len()..file_name.len() - ext_suffix.len()];
    let (period, region) = stem.rsplit_once('_')?;
    if period.is_empty() || region.is_empty() {
        return None;
    }
    Some((period.to_string(), region.to_string()))
}

/// The three file locations owned by one snapshot identity. Always derived,
/// never persisted: identical identity + base directory yields identical
/// paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFileSet {
    pub current: PathBuf,
    pub deleted: PathBuf,
    pub meta: PathBuf,
}

impl SnapshotFileSet {
    pub fn resolve(base_dir: &Path, identity: &SnapshotIdentity) -> Self {
        let name = |mode| {
            snapshot_file_name(
                &identity.report_type,
                mode,
                &identity.period,
                &identity.region,
            )
        };
        Self {
            current: base_dir.join(name(SnapshotMode::Current)),
            deleted: base_dir.join(name(SnapshotMode::Deleted)),
            meta: base_dir.join(name(SnapshotMode::Meta)),
        }
    }
}

/// Metadata path paired with a CURRENT or DELETED data file.
pub fn meta_path_for(data_path: &Path) -> PathBuf {
    let file_name = data_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let meta_name = file_name
        .replace("_CURRENT_", "_META_")
        .replace("_DELETED_", "_META_");
    let meta_name = match meta_name.rsplit_once('.') {
        Some((stem, _)) => format!("{stem}.{META_EXT}"),
        None => format!("{meta_name}.{META_EXT}"),
    };
    data_path.with_file_name(meta_name)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub async fn file_checksum(path: &Path) -> anyhow::Result<String> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {} for checksum", path.display()))?;
    Ok(sha256_hex(&bytes))
}

/// Writes bytes through a temp file + rename so readers never observe a
/// partially written snapshot.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming temp file {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Reads a tabular CSV file into rows. Fully blank rows are dropped here;
/// everything else is the preprocessor's business.
pub async fn read_rows(path: &Path) -> anyhow::Result<Vec<Row>> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    rows_from_csv(&bytes).with_context(|| format!("parsing {}", path.display()))
}

fn rows_from_csv(bytes: &[u8]) -> anyhow::Result<Vec<Row>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);
    let headers: Vec<String> = reader
        .headers()
        .context("reading header row")?
        .iter()
        .map(|header| header.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("reading data row {}", index + 1))?;
        let mut row = Row::new();
        for (col, field) in record.iter().enumerate() {
            let name = headers
                .get(col)
                .cloned()
                .unwrap_or_else(|| format!("Col{}", col + 1));
            row.push(name, field.to_string());
        }
        if row.is_blank() {
            continue;
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Writes rows as CSV under a header built from the union of all column
/// names in encounter order. Repeated names keep their per-row multiplicity;
/// rows missing a column emit an empty cell.
pub async fn write_rows(path: &Path, rows: &[Row]) -> anyhow::Result<()> {
    let bytes = rows_to_csv(rows).with_context(|| format!("encoding {}", path.display()))?;
    write_atomic(path, &bytes).await
}

fn rows_to_csv(rows: &[Row]) -> anyhow::Result<Vec<u8>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let mut headers: Vec<String> = Vec::new();
    for row in rows {
        let mut counts: Vec<(&str, usize)> = Vec::new();
        for name in row.names() {
            let needed = match counts.iter_mut().find(|(n, _)| *n == name) {
                Some((_, count)) => {
                    *count += 1;
                    *count
                }
                None => {
                    counts.push((name, 1));
                    1
                }
            };
            let have = headers.iter().filter(|h| h.as_str() == name).count();
            if needed > have {
                headers.push(name.to_string());
            }
        }
    }

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&headers).context("writing header")?;
    for row in rows {
        let mut occurrence: Vec<(&str, usize)> = Vec::new();
        let record: Vec<&str> = headers
            .iter()
            .map(|header| {
                let nth = match occurrence.iter_mut().find(|(n, _)| *n == header.as_str()) {
                    Some((_, count)) => {
                        *count += 1;
                        *count
                    }
                    None => {
                        occurrence.push((header.as_str(), 1));
                        1
                    }
                };
                row.iter()
                    .filter(|(name, _)| *name == header.as_str())
                    .nth(nth - 1)
                    .map(|(_, value)| value)
                    .unwrap_or("")
            })
            .collect();
        writer.write_record(&record).context("writing row")?;
    }
    writer.into_inner().context("finishing csv buffer")
}

/// Loads the metadata record for an identity, or `None` when no metadata
/// exists yet. A present-but-corrupt file is an error the caller decides on.
pub async fn read_meta(path: &Path) -> anyhow::Result<Option<SnapshotMeta>> {
    if !fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        return Ok(None);
    }
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let meta = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(meta))
}

pub async fn write_meta(path: &Path, meta: &SnapshotMeta) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(meta).context("serializing snapshot meta")?;
    write_atomic(path, &bytes).await
}

/// Copies the current file into a `backups/` sibling directory before it is
/// overwritten, then prunes to the newest `retain` copies. Returns the
/// backup path, or `None` when there was nothing to back up.
pub async fn rotate_backup(current: &Path, retain: usize) -> anyhow::Result<Option<PathBuf>> {
    if !fs::try_exists(current)
        .await
        .with_context(|| format!("checking {}", current.display()))?
    {
        return Ok(None);
    }
    let file_name = current
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .context("backup target has no file name")?;
    let backup_dir = current
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("backups");
    fs::create_dir_all(&backup_dir)
        .await
        .with_context(|| format!("creating {}", backup_dir.display()))?;

    let stamp = Utc::now().format("%Y%m%d_%H%M%S_%f");
    let backup_path = backup_dir.join(format!("{stamp}_{file_name}"));
    fs::copy(current, &backup_path)
        .await
        .with_context(|| format!("copying backup to {}", backup_path.display()))?;
    debug!(backup = %backup_path.display(), "rotated snapshot backup");

    // Stamps sort lexicographically, so name order is age order.
    let mut siblings: Vec<String> = Vec::new();
    let mut entries = fs::read_dir(&backup_dir)
        .await
        .with_context(|| format!("listing {}", backup_dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(&format!("_{file_name}")) {
            siblings.push(name);
        }
    }
    siblings.sort();
    siblings.reverse();
    for stale in siblings.iter().skip(retain.max(1)) {
        let stale_path = backup_dir.join(stale);
        if let Err(err) = fs::remove_file(&stale_path).await {
            warn!(path = %stale_path.display(), error = %err, "failed to prune stale backup");
        }
    }
    Ok(Some(backup_path))
}

/// One discovered snapshot file, addressed by its owning source directory.
#[derive(Debug, Clone)]
pub struct SnapshotSource {
    pub path: PathBuf,
    pub file_name: String,
    pub source_id: String,
    pub period: String,
    pub region: String,
    pub modified: SystemTime,
}

/// Scans `root/<source>/<file>` under every given root for snapshot files of
/// a report type and mode. Unreadable directories are logged and skipped;
/// the same physical file is never reported twice.
pub async fn scan_snapshots(
    roots: &[PathBuf],
    report_type: &str,
    mode: SnapshotMode,
) -> Vec<SnapshotSource> {
    let mut found = Vec::new();
    let mut seen_paths: HashSet<PathBuf> = HashSet::new();

    for root in roots {
        let mut dirs = match fs::read_dir(root).await {
            Ok(dirs) => dirs,
            Err(_) => continue,
        };
        loop {
            let entry = match dirs.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    warn!(root = %root.display(), error = %err, "failed to enumerate snapshot root");
                    break;
                }
            };
            let source_dir = entry.path();
            match entry.file_type().await {
                Ok(file_type) if file_type.is_dir() => {}
                _ => continue,
            }
            let source_id = entry.file_name().to_string_lossy().to_string();
            let mut files = match fs::read_dir(&source_dir).await {
                Ok(files) => files,
                Err(err) => {
                    warn!(dir = %source_dir.display(), error = %err, "failed to enumerate source directory");
                    continue;
                }
            };
            while let Ok(Some(file_entry)) = files.next_entry().await {
                let file_name = file_entry.file_name().to_string_lossy().to_string();
                let Some((period, region)) =
                    parse_snapshot_file_name(&file_name, report_type, mode)
                else {
                    continue;
                };
                let path = file_entry.path();
                if !seen_paths.insert(path.clone()) {
                    continue;
                }
                let modified = match file_entry.metadata().await.and_then(|m| m.modified()) {
                    Ok(modified) => modified,
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "failed to stat snapshot file");
                        continue;
                    }
                };
                found.push(SnapshotSource {
                    path,
                    file_name,
                    source_id: source_id.clone(),
                    period,
                    region,
                    modified,
                });
            }
        }
    }
    debug!(
        report_type,
        mode = mode.as_str(),
        count = found.len(),
        "scanned snapshot roots"
    );
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn identity() -> SnapshotIdentity {
        SnapshotIdentity {
            report_type: "SALE".into(),
            period: "Q1_2026".into(),
            region: "SC".into(),
        }
    }

    #[test]
    fn file_set_resolution_is_deterministic() {
        let base = Path::new("/data/snapshots/site-a");
        let first = SnapshotFileSet::resolve(base, &identity());
        let second = SnapshotFileSet::resolve(base, &identity());
        assert_eq!(first, second);
        assert_eq!(
            first.current,
            base.join("SALE_CURRENT_Q1_2026_SC.csv")
        );
        assert_eq!(first.deleted, base.join("SALE_DELETED_Q1_2026_SC.csv"));
        assert_eq!(first.meta, base.join("SALE_META_Q1_2026_SC.json"));
    }

    #[test]
    fn filename_parsing_round_trips_underscored_periods() {
        let name = snapshot_file_name("SALE", SnapshotMode::Current, "Q1_2026", "SC");
        let (period, region) =
            parse_snapshot_file_name(&name, "SALE", SnapshotMode::Current).expect("parse");
        assert_eq!(period, "Q1_2026");
        assert_eq!(region, "SC");

        assert!(parse_snapshot_file_name(&name, "ORDER", SnapshotMode::Current).is_none());
        assert!(parse_snapshot_file_name(&name, "SALE", SnapshotMode::Deleted).is_none());
        assert!(parse_snapshot_file_name("SALE_CURRENT_.csv", "SALE", SnapshotMode::Current)
            .is_none());
    }

    #[test]
    fn master_names_follow_the_fixed_convention() {
        assert_eq!(
            master_file_name("SALE", SnapshotMode::Current),
            "CONSOLIDADO_SALE_MASTER.csv"
        );
        assert_eq!(
            master_file_name("SALE", SnapshotMode::Deleted),
            "CONSOLIDADO_EXCLUIDOS_SALE_MASTER.csv"
        );
    }

    #[test]
    fn meta_path_swaps_mode_and_extension() {
        let data = Path::new("/snap/SALE_CURRENT_Q1_2026_SC.csv");
        assert_eq!(
            meta_path_for(data),
            Path::new("/snap/SALE_META_Q1_2026_SC.json")
        );
        let deleted = Path::new("/snap/SALE_DELETED_Q1_2026_SC.csv");
        assert_eq!(
            meta_path_for(deleted),
            Path::new("/snap/SALE_META_Q1_2026_SC.json")
        );
    }

    #[test]
    fn checksums_are_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn csv_round_trip_preserves_ragged_and_duplicate_columns() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("rows.csv");

        let mut first = Row::new();
        first.push("id", "1");
        first.push("id", "alt");
        first.push("amount", "100");
        let mut second = Row::new();
        second.push("id", "2");
        second.push("notes", "late column");

        write_rows(&path, &[first.clone(), second.clone()])
            .await
            .expect("write");
        let rows = read_rows(&path).await.expect("read");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].value("id"), Some("1"));
        assert_eq!(rows[0].nth_value("id", 2), Some("alt"));
        assert_eq!(rows[0].value("amount"), Some("100"));
        assert_eq!(rows[1].value("id"), Some("2"));
        assert_eq!(rows[1].value("amount"), Some(""));
        assert_eq!(rows[1].value("notes"), Some("late column"));
    }

    #[tokio::test]
    async fn blank_rows_are_dropped_at_read_time() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("rows.csv");
        fs::write(&path, "id,amount\n1,100\n,\n2,200\n")
            .await
            .expect("write");
        let rows = read_rows(&path).await.expect("read");
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn atomic_writes_replace_existing_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("file.csv");
        write_atomic(&path, b"first").await.expect("first write");
        write_atomic(&path, b"second").await.expect("second write");
        let bytes = fs::read(&path).await.expect("read");
        assert_eq!(bytes, b"second");
    }

    #[tokio::test]
    async fn backup_rotation_retains_only_the_newest_copies() {
        let dir = tempdir().expect("tempdir");
        let current = dir.path().join("SALE_CURRENT_Q1_2026_SC.csv");

        for generation in 0..4 {
            fs::write(&current, format!("gen-{generation}"))
                .await
                .expect("write current");
            rotate_backup(&current, 2).await.expect("rotate");
        }

        let backup_dir = dir.path().join("backups");
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&backup_dir).await.expect("list backups");
        while let Some(entry) = entries.next_entry().await.expect("entry") {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names.len(), 2);
        names.sort();
        let newest = fs::read(backup_dir.join(&names[1])).await.expect("read");
        assert_eq!(newest, b"gen-3");
    }

    #[tokio::test]
    async fn meta_round_trips_and_missing_meta_is_none() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("SALE_META_Q1_2026_SC.json");
        assert!(read_meta(&path).await.expect("read missing").is_none());

        let meta = SnapshotMeta {
            identity: identity(),
            last_updated: Utc::now(),
            schema_version: "1.1".into(),
            primary_key_used: vec!["id".into()],
            row_count: 7,
            checksum: "abc123".into(),
        };
        write_meta(&path, &meta).await.expect("write meta");
        let loaded = read_meta(&path).await.expect("read").expect("present");
        assert_eq!(loaded, meta);
    }

    #[tokio::test]
    async fn scan_finds_snapshots_across_roots_and_skips_junk() {
        let dir = tempdir().expect("tempdir");
        let root_a = dir.path().join("snapshots");
        let root_b = dir.path().join("destination");
        for (root, source) in [(&root_a, "site-1"), (&root_b, "SC-exports")] {
            let source_dir = root.join(source);
            fs::create_dir_all(&source_dir).await.expect("mkdir");
            fs::write(
                source_dir.join("SALE_CURRENT_Q1_2026_SC.csv"),
                "id\n1\n",
            )
            .await
            .expect("write snapshot");
            fs::write(source_dir.join("notes.txt"), "ignore me")
                .await
                .expect("write junk");
        }

        let found = scan_snapshots(
            &[root_a.clone(), root_b.clone()],
            "SALE",
            SnapshotMode::Current,
        )
        .await;
        assert_eq!(found.len(), 2);
        let mut sources: Vec<_> = found.iter().map(|s| s.source_id.as_str()).collect();
        sources.sort();
        assert_eq!(sources, vec!["SC-exports", "site-1"]);
        assert!(found.iter().all(|s| s.period == "Q1_2026" && s.region == "SC"));

        // Passing the same root twice must not double-count files.
        let doubled = scan_snapshots(
            &[root_a.clone(), root_a],
            "SALE",
            SnapshotMode::Current,
        )
        .await;
        assert_eq!(doubled.len(), 1);
    }
}
