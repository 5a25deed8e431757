use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use thiserror::Error;

pub const DATABASE_EXTENSION: &str = "krk";

const DAY_SECONDS: u64 = 24 * 60 * 60;
const WEEK_SECONDS: u64 = 7 * DAY_SECONDS;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database file locked by another process")]
    Locked,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub timestamp: u64,
}

/// Advisory exclusive lock on a database path. Serializes writers across
/// processes; the core assumes a single writer per open database and leaves
/// this to the surrounding application.
#[derive(Debug)]
pub struct DatabaseLock {
    database_path: PathBuf,
    _lock_file: File,
}

impl DatabaseLock {
    pub fn path(&self) -> &Path {
        &self.database_path
    }
}

pub fn read_database(path: &Path) -> Result<Vec<u8>, StorageError> {
    Ok(fs::read(path)?)
}

/// Lock, back up the previous file, then replace atomically. A failure at
/// any point leaves the previous database bytes on disk.
pub fn write_database(
    path: &Path,
    bytes: &[u8],
    max_weekly_backups: usize,
) -> Result<(), StorageError> {
    let lock = acquire_database_lock(path)?;
    write_database_with_lock(&lock, bytes, max_weekly_backups)
}

pub fn write_database_with_lock(
    lock: &DatabaseLock,
    bytes: &[u8],
    max_weekly_backups: usize,
) -> Result<(), StorageError> {
    let path = lock.path();
    if path.exists() {
        create_backup(path, max_weekly_backups)?;
    }
    write_atomic(path, bytes)
}

pub fn acquire_database_lock(path: &Path) -> Result<DatabaseLock, StorageError> {
    let lock_path = lock_file_path(path);
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)?;
    match lock_file.try_lock_exclusive() {
        Ok(()) => Ok(DatabaseLock {
            database_path: path.to_path_buf(),
            _lock_file: lock_file,
        }),
        Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => Err(StorageError::Locked),
        Err(error) => Err(StorageError::Io(error)),
    }
}

/// Newest first.
pub fn list_backups(path: &Path) -> Result<Vec<BackupEntry>, StorageError> {
    let backup_dir = backup_directory(path);
    if !backup_dir.exists() {
        return Ok(Vec::new());
    }
    let mut backups = Vec::new();
    for entry in fs::read_dir(backup_dir)? {
        let entry_path = entry?.path();
        if !entry_path.is_file() {
            continue;
        }
        if let Some(timestamp) = parse_backup_timestamp(&entry_path) {
            backups.push(BackupEntry {
                path: entry_path,
                timestamp,
            });
        }
    }
    backups.sort_by(|left, right| right.timestamp.cmp(&left.timestamp));
    Ok(backups)
}

/// Restore a backup over the current database. The displaced file is kept
/// under a `.corrupt` name and returned, so nothing is destroyed.
pub fn recover_from_backup(
    database_path: &Path,
    backup_path: &Path,
) -> Result<Option<PathBuf>, StorageError> {
    let lock = acquire_database_lock(database_path)?;
    let backup_bytes = fs::read(backup_path)?;
    let displaced = preserve_corrupt_database(lock.path())?;
    write_atomic(lock.path(), &backup_bytes)?;
    Ok(displaced)
}

fn lock_file_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("database");
    path.parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!(".{file_name}.lock"))
}

fn backup_directory(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("database");
    path.parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!("{file_name}.backups"))
}

fn create_backup(path: &Path, max_weekly_backups: usize) -> Result<(), StorageError> {
    let backup_dir = backup_directory(path);
    fs::create_dir_all(&backup_dir)?;
    let timestamp = unix_seconds_now();
    let backup_path = backup_dir.join(format!("backup-{timestamp}.{DATABASE_EXTENSION}"));
    fs::copy(path, &backup_path)?;
    set_owner_only_permissions(&backup_path)?;
    compact_backups(&backup_dir, max_weekly_backups, timestamp)?;
    Ok(())
}

fn preserve_corrupt_database(path: &Path) -> Result<Option<PathBuf>, StorageError> {
    if !path.exists() {
        return Ok(None);
    }
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("database");
    let mut corrupt_path = parent.join(format!("{file_name}.corrupt"));
    if corrupt_path.exists() {
        corrupt_path = parent.join(format!("{file_name}.corrupt-{}", unix_seconds_now()));
    }
    fs::rename(path, &corrupt_path)?;
    Ok(Some(corrupt_path))
}

/// Keep every backup from the last day, one per day for the last week, and
/// up to `max_weekly_backups` weekly buckets beyond that.
fn compact_backups(
    backup_dir: &Path,
    max_weekly_backups: usize,
    now_seconds: u64,
) -> Result<(), StorageError> {
    let mut backups = Vec::new();
    for entry in fs::read_dir(backup_dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if let Some(timestamp) = parse_backup_timestamp(&path) {
            backups.push((path, timestamp));
        }
    }
    backups.sort_by(|left, right| right.1.cmp(&left.1));

    let mut keep = HashSet::new();
    let mut day_buckets: HashMap<u64, PathBuf> = HashMap::new();
    let mut week_buckets: HashMap<u64, PathBuf> = HashMap::new();

    for (path, timestamp) in &backups {
        let age = now_seconds.saturating_sub(*timestamp);
        if age <= DAY_SECONDS {
            keep.insert(path.clone());
        } else if age <= 8 * DAY_SECONDS {
            day_buckets
                .entry(age / DAY_SECONDS)
                .or_insert_with(|| path.clone());
        } else {
            week_buckets
                .entry(age / WEEK_SECONDS)
                .or_insert_with(|| path.clone());
        }
    }

    keep.extend(day_buckets.into_values());

    let mut weekly: Vec<PathBuf> = week_buckets.into_values().collect();
    weekly.sort_by_key(|path| std::cmp::Reverse(parse_backup_timestamp(path).unwrap_or(0)));
    keep.extend(weekly.into_iter().take(max_weekly_backups));

    for (path, _) in backups {
        if !keep.contains(&path) {
            fs::remove_file(path)?;
        }
    }
    Ok(())
}

fn parse_backup_timestamp(path: &Path) -> Option<u64> {
    let file_name = path.file_name()?.to_str()?;
    let raw = file_name
        .strip_prefix("backup-")?
        .strip_suffix(&format!(".{DATABASE_EXTENSION}"))?;
    raw.parse::<u64>().ok()
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let parent_dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent_dir)?;

    let temp_path = parent_dir.join(format!(
        ".{}.{}.tmp",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("database"),
        unique_suffix()
    ));

    let mut handle = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)?;
    set_owner_only_permissions(&temp_path)?;
    handle.write_all(bytes)?;
    handle.sync_all()?;
    drop(handle);

    fs::rename(&temp_path, path)?;
    set_owner_only_permissions(path)?;

    if let Ok(directory_handle) = OpenOptions::new().read(true).open(parent_dir) {
        let _ = directory_handle.sync_all();
    }
    Ok(())
}

fn unique_suffix() -> u128 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    (u128::from(std::process::id()) << 64) | nanos
}

fn set_owner_only_permissions(_path: &Path) -> Result<(), StorageError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        fs::set_permissions(_path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::{
        acquire_database_lock, backup_directory, compact_backups, list_backups, lock_file_path,
        parse_backup_timestamp, read_database, recover_from_backup, write_database,
        write_database_with_lock, StorageError,
    };

    fn temp_path(file_name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "keyrack-storage-tests-{}-{file_name}",
            std::process::id()
        ))
    }

    #[test]
    fn writes_and_reads_database_bytes() {
        let path = temp_path("roundtrip.krk");
        write_database(&path, b"encrypted-container", 4).expect("write");
        let loaded = read_database(&path).expect("read");
        fs::remove_file(path).expect("cleanup");
        assert_eq!(loaded, b"encrypted-container");
    }

    #[test]
    fn returns_locked_while_another_lock_is_held() {
        let path = temp_path("locked.krk");
        let _held = acquire_database_lock(&path).expect("first lock");
        let result = write_database(&path, b"payload", 4);
        assert!(matches!(result, Err(StorageError::Locked)));
        let _ = fs::remove_file(lock_file_path(&path));
    }

    #[test]
    fn write_with_held_lock_succeeds() {
        let path = temp_path("write-with-lock.krk");
        let lock = acquire_database_lock(&path).expect("lock");
        write_database_with_lock(&lock, b"payload", 4).expect("write");
        assert_eq!(read_database(&path).expect("read"), b"payload");
        let _ = fs::remove_file(&path);
        let _ = fs::remove_file(lock_file_path(&path));
    }

    #[test]
    fn compaction_keeps_recent_daily_and_bounded_weekly_backups() {
        let database_path = temp_path("compaction.krk");
        fs::write(&database_path, b"seed").expect("seed");
        let backup_dir = backup_directory(&database_path);
        fs::create_dir_all(&backup_dir).expect("backup dir");
        let now = 10_000_000_u64;
        let ages = [
            100,
            1_000,
            2 * 24 * 60 * 60,
            2 * 24 * 60 * 60 + 300,
            10 * 24 * 60 * 60,
            18 * 24 * 60 * 60,
            40 * 24 * 60 * 60,
        ];
        for age in ages {
            fs::write(
                backup_dir.join(format!("backup-{}.krk", now - age)),
                b"b",
            )
            .expect("backup file");
        }

        compact_backups(&backup_dir, 2, now).expect("compact");

        let mut remaining = Vec::new();
        for entry in fs::read_dir(&backup_dir).expect("read dir") {
            if let Some(timestamp) = parse_backup_timestamp(&entry.expect("entry").path()) {
                remaining.push(now - timestamp);
            }
        }
        remaining.sort_unstable();

        assert!(remaining.contains(&100));
        assert!(remaining.contains(&1_000));
        assert!(remaining.contains(&(2 * 24 * 60 * 60)));
        assert!(!remaining.contains(&(2 * 24 * 60 * 60 + 300)));

        let _ = fs::remove_dir_all(backup_dir);
        let _ = fs::remove_file(database_path);
    }

    #[test]
    fn list_backups_returns_newest_first() {
        let database_path = temp_path("list.krk");
        fs::write(&database_path, b"seed").expect("seed");
        let backup_dir = backup_directory(&database_path);
        fs::create_dir_all(&backup_dir).expect("backup dir");
        for timestamp in [100_u64, 300, 200] {
            fs::write(backup_dir.join(format!("backup-{timestamp}.krk")), b"b").expect("backup");
        }

        let backups = list_backups(&database_path).expect("list");
        let timestamps: Vec<u64> = backups.iter().map(|entry| entry.timestamp).collect();
        assert_eq!(timestamps, vec![300, 200, 100]);

        let _ = fs::remove_dir_all(backup_dir);
        let _ = fs::remove_file(database_path);
    }

    #[test]
    fn recovery_restores_backup_and_preserves_the_corrupt_file() {
        let database_path = temp_path("recover.krk");
        fs::write(&database_path, b"corrupt").expect("write corrupt");
        let backup_dir = backup_directory(&database_path);
        fs::create_dir_all(&backup_dir).expect("backup dir");
        let backup_path = backup_dir.join("backup-123.krk");
        fs::write(&backup_path, b"good").expect("write backup");

        let displaced = recover_from_backup(&database_path, &backup_path).expect("recover");

        assert_eq!(fs::read(&database_path).expect("read"), b"good");
        let displaced = displaced.expect("corrupt file preserved");
        assert_eq!(fs::read(&displaced).expect("read displaced"), b"corrupt");

        let _ = fs::remove_dir_all(backup_dir);
        let _ = fs::remove_file(displaced);
        let _ = fs::remove_file(lock_file_path(&database_path));
        let _ = fs::remove_file(database_path);
    }
}
