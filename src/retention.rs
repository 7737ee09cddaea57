//! Dataset Retention and Pruning
//!
//! Removes partition files and persistence rows older than a retention
//! expression (`<n>d`, `<n>m`, `<n>y`). Both operations support a dry-run
//! inspection mode, and file deletion never reaches outside the dataset
//! root.

use crate::checkpoint::{CheckpointError, CheckpointStore};
use chrono::{Duration, NaiveDate, Utc};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Parse an `older_than` expression: `d` = 24h, `m` = 30d, `y` = 365d.
pub fn parse_older_than(expr: &str) -> Result<Duration, RetentionError> {
    let expr = expr.trim();
    if expr.len() < 2 {
        return Err(RetentionError::BadExpression(expr.to_string()));
    }
    let (number, unit) = expr.split_at(expr.len() - 1);
    let n: i64 = number
        .parse()
        .map_err(|_| RetentionError::BadExpression(expr.to_string()))?;
    if n < 0 {
        return Err(RetentionError::BadExpression(expr.to_string()));
    }
    match unit {
        "d" => Ok(Duration::days(n)),
        "m" => Ok(Duration::days(30 * n)),
        "y" => Ok(Duration::days(365 * n)),
        _ => Err(RetentionError::BadExpression(expr.to_string())),
    }
}

/// Outcome of a file prune pass.
#[derive(Debug, Default)]
pub struct FilePruneReport {
    /// Files older than the cutoff, whether or not they were deleted.
    pub candidates: Vec<PathBuf>,
    pub deleted: usize,
    pub dry_run: bool,
}

/// Outcome of a database prune pass.
#[derive(Debug, Default)]
pub struct DbPruneReport {
    pub checkpoints: usize,
    pub jobs: usize,
    pub dry_run: bool,
}

/// Walk the partitioned layout and remove files whose `date=` segment is
/// older than `now - older_than`.
pub fn prune_files(
    root: &Path,
    older_than: &str,
    dry_run: bool,
) -> Result<FilePruneReport, RetentionError> {
    let age = parse_older_than(older_than)?;
    let cutoff = (Utc::now() - age).date_naive();
    let root = root
        .canonicalize()
        .map_err(|e| RetentionError::Io(root.to_path_buf(), e))?;

    let mut report = FilePruneReport {
        dry_run,
        ..Default::default()
    };

    for frame_dir in hive_dirs(&root, "frame=")? {
        for symbol_dir in hive_dirs(&frame_dir, "symbol=")? {
            for date_dir in hive_dirs(&symbol_dir, "date=")? {
                let Some(date) = parse_date_segment(&date_dir) else {
                    debug!(dir = %date_dir.display(), "unparseable date partition, skipping");
                    continue;
                };
                if date >= cutoff {
                    continue;
                }
                for entry in fs::read_dir(&date_dir)
                    .map_err(|e| RetentionError::Io(date_dir.clone(), e))?
                {
                    let path = entry
                        .map_err(|e| RetentionError::Io(date_dir.clone(), e))?
                        .path();
                    if !path.is_file() {
                        continue;
                    }
                    // Deletion stays inside the canonicalized root.
                    if !path.starts_with(&root) {
                        return Err(RetentionError::OutsideRoot(path));
                    }
                    if !dry_run {
                        fs::remove_file(&path).map_err(|e| RetentionError::Io(path.clone(), e))?;
                        report.deleted += 1;
                    }
                    report.candidates.push(path);
                }
                if !dry_run {
                    // Drop the now-empty date directory; ignore failures
                    // (a concurrent writer may have re-created it).
                    let _ = fs::remove_dir(&date_dir);
                }
            }
        }
    }

    info!(
        candidates = report.candidates.len(),
        deleted = report.deleted,
        dry_run,
        "file prune pass complete"
    );
    Ok(report)
}

/// Remove checkpoint and job-history rows older than `now - older_than`.
pub fn prune_database(
    store: &CheckpointStore,
    older_than: &str,
    dry_run: bool,
) -> Result<DbPruneReport, RetentionError> {
    let age = parse_older_than(older_than)?;
    let cutoff = Utc::now() - age;

    let (checkpoints, jobs) = if dry_run {
        store.count_older_than(cutoff)?
    } else {
        store.delete_older_than(cutoff)?
    };

    Ok(DbPruneReport {
        checkpoints,
        jobs,
        dry_run,
    })
}

fn hive_dirs(parent: &Path, prefix: &str) -> Result<Vec<PathBuf>, RetentionError> {
    if !parent.exists() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in fs::read_dir(parent).map_err(|e| RetentionError::Io(parent.to_path_buf(), e))? {
        let path = entry
            .map_err(|e| RetentionError::Io(parent.to_path_buf(), e))?
            .path();
        let is_match = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(prefix))
            .unwrap_or(false);
        if path.is_dir() && is_match {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn parse_date_segment(dir: &Path) -> Option<NaiveDate> {
    let name = dir.file_name()?.to_str()?;
    let date = name.strip_prefix("date=")?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

#[derive(Debug)]
pub enum RetentionError {
    BadExpression(String),
    OutsideRoot(PathBuf),
    Io(PathBuf, std::io::Error),
    Checkpoint(CheckpointError),
}

impl fmt::Display for RetentionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadExpression(e) => {
                write!(f, "bad retention expression {:?} (expected <n>d|<n>m|<n>y)", e)
            }
            Self::OutsideRoot(p) => {
                write!(f, "refusing to delete outside the dataset root: {}", p.display())
            }
            Self::Io(p, e) => write!(f, "I/O error at {}: {}", p.display(), e),
            Self::Checkpoint(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RetentionError {}

impl From<CheckpointError> for RetentionError {
    fn from(e: CheckpointError) -> Self {
        Self::Checkpoint(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;
    use crate::domain::symbol::Symbol;
    use tempfile::TempDir;

    fn make_partition(root: &Path, date: &str) -> PathBuf {
        let dir = root
            .join("frame=1m")
            .join("symbol=AAPL")
            .join(format!("date={}", date));
        fs::create_dir_all(&dir).unwrap();
        let file = dir.join("job.parquet");
        fs::write(&file, b"data").unwrap();
        file
    }

    #[test]
    fn test_expression_grammar() {
        assert_eq!(parse_older_than("30d").unwrap(), Duration::days(30));
        assert_eq!(parse_older_than("6m").unwrap(), Duration::days(180));
        assert_eq!(parse_older_than("1y").unwrap(), Duration::days(365));
        assert!(parse_older_than("30").is_err());
        assert!(parse_older_than("d").is_err());
        assert!(parse_older_than("1.5d").is_err());
        assert!(parse_older_than("30w").is_err());
        assert!(parse_older_than("-1d").is_err());
    }

    #[test]
    fn test_dry_run_reports_without_deleting() {
        let tmp = TempDir::new().unwrap();
        let old_date = (Utc::now() - Duration::days(100)).date_naive();
        let old_file = make_partition(tmp.path(), &old_date.format("%Y-%m-%d").to_string());
        let fresh_file = make_partition(tmp.path(), &Utc::now().date_naive().format("%Y-%m-%d").to_string());

        let report = prune_files(tmp.path(), "30d", true).unwrap();
        assert_eq!(report.candidates.len(), 1);
        assert_eq!(report.deleted, 0);
        assert!(old_file.exists());
        assert!(fresh_file.exists());
    }

    #[test]
    fn test_prune_removes_only_stale_partitions() {
        let tmp = TempDir::new().unwrap();
        let old_date = (Utc::now() - Duration::days(100)).date_naive();
        let old_file = make_partition(tmp.path(), &old_date.format("%Y-%m-%d").to_string());
        let fresh_file = make_partition(tmp.path(), &Utc::now().date_naive().format("%Y-%m-%d").to_string());

        let report = prune_files(tmp.path(), "30d", false).unwrap();
        assert_eq!(report.deleted, 1);
        assert!(!old_file.exists());
        assert!(!old_file.parent().unwrap().exists());
        assert!(fresh_file.exists());
    }

    #[test]
    fn test_unparseable_date_dirs_are_left_alone() {
        let tmp = TempDir::new().unwrap();
        let weird = tmp
            .path()
            .join("frame=1m")
            .join("symbol=AAPL")
            .join("date=not-a-date");
        fs::create_dir_all(&weird).unwrap();
        fs::write(weird.join("job.parquet"), b"data").unwrap();

        let report = prune_files(tmp.path(), "1d", false).unwrap();
        assert!(report.candidates.is_empty());
        assert!(weird.join("job.parquet").exists());
    }

    #[test]
    fn test_empty_root_is_fine() {
        let tmp = TempDir::new().unwrap();
        let report = prune_files(tmp.path(), "30d", false).unwrap();
        assert!(report.candidates.is_empty());
    }

    #[test]
    fn test_prune_database_dry_run_and_delete() {
        let store = CheckpointStore::in_memory().unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let mut old = Checkpoint::new(day, 1, None);
        old.updated_at = Utc::now() - Duration::days(400);
        store.save(&Symbol::new("AAPL").unwrap(), &old).unwrap();
        store
            .save(&Symbol::new("MSFT").unwrap(), &Checkpoint::new(day, 2, None))
            .unwrap();

        let dry = prune_database(&store, "1y", true).unwrap();
        assert_eq!(dry.checkpoints, 1);
        assert!(dry.dry_run);
        // Dry run deleted nothing.
        assert!(store.load(&Symbol::new("AAPL").unwrap(), day).unwrap().is_some());

        let real = prune_database(&store, "1y", false).unwrap();
        assert_eq!(real.checkpoints, 1);
        assert!(store.load(&Symbol::new("AAPL").unwrap(), day).unwrap().is_none());
        assert!(store.load(&Symbol::new("MSFT").unwrap(), day).unwrap().is_some());
    }
}
