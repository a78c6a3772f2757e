// dbstream/src/utils/backup_files.rs
use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const BACKUP_EXTENSION: &str = ".sql.gz";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

/// `<databaseName>-<YYYY-MM-DD>.sql.gz`
pub fn backup_file_name(db_name: &str, date: NaiveDate) -> String {
    format!("{}-{}{}", db_name, date.format("%Y-%m-%d"), BACKUP_EXTENSION)
}

/// Expands a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => {
            let home = std::env::var_os("HOME").context("Unable to determine home directory")?;
            Ok(PathBuf::from(home).join(rest))
        }
        Err(_) => Ok(path.to_path_buf()),
    }
}

/// Prepares the backup directory and returns today's artifact path inside it.
pub fn create_backup_path(backup_dir: &Path, db_name: &str) -> Result<PathBuf> {
    let dir = expand_tilde(backup_dir)?;
    ensure_directory(&dir)?;
    Ok(dir.join(backup_file_name(db_name, Local::now().date_naive())))
}

fn ensure_directory(dir: &Path) -> Result<()> {
    if dir.as_os_str().is_empty() {
        anyhow::bail!("Backup directory path is empty");
    }
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory '{}'", dir.display()))?;

    let metadata = fs::metadata(dir)
        .with_context(|| format!("Failed to inspect directory '{}'", dir.display()))?;
    if metadata.permissions().readonly() {
        anyhow::bail!("Directory '{}' is not writable", dir.display());
    }
    Ok(())
}

/// Backups of `db_name` in `backup_dir`, newest first.
pub fn find_backups(backup_dir: &Path, db_name: &str) -> Result<Vec<BackupEntry>> {
    let dir = expand_tilde(backup_dir)?;
    if !dir.is_dir() {
        anyhow::bail!("No backup directory at {}", dir.display());
    }

    let prefix = format!("{}-", db_name);
    let mut entries = Vec::new();
    for entry in fs::read_dir(&dir)
        .with_context(|| format!("Failed to list backup directory {}", dir.display()))?
    {
        let entry = entry.with_context(|| format!("Failed to read entry in {}", dir.display()))?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if !is_backup_of(name, &prefix) {
            continue;
        }

        let metadata = entry
            .metadata()
            .with_context(|| format!("Failed to stat {}", entry.path().display()))?;
        if !metadata.is_file() {
            continue;
        }
        entries.push(BackupEntry {
            path: entry.path(),
            size: metadata.len(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }

    entries.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.path.cmp(&a.path)));
    Ok(entries)
}

/// `<prefix><YYYY-MM-DD>.sql.gz` exactly, so `app-staging-...` is not a backup of `app`.
fn is_backup_of(file_name: &str, prefix: &str) -> bool {
    file_name
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_suffix(BACKUP_EXTENSION))
        .is_some_and(|date| NaiveDate::parse_from_str(date, "%Y-%m-%d").is_ok())
}

pub fn latest_backup(backup_dir: &Path, db_name: &str) -> Result<BackupEntry> {
    find_backups(backup_dir, db_name)?
        .into_iter()
        .next()
        .with_context(|| {
            format!(
                "No {} backup files found for database {} in {}",
                BACKUP_EXTENSION,
                db_name,
                backup_dir.display()
            )
        })
}

pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}
