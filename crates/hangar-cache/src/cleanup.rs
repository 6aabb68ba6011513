use std::fmt;
use std::io;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;

use crate::config::Config;
use crate::fs::{catch_not_found, content_path_of, is_metadata_path, CacheDir};
use crate::Caches;

/// Cleans up all caches under the configured cache root.
///
/// This is intended to run out-of-band, e.g. from a cron job, concurrently
/// with processes actively using the caches. With `dry_run` the sweep only
/// reports what it would remove.
pub fn cleanup(config: Config, dry_run: bool) -> Result<()> {
    let caches = Caches::from_config(&config)?;
    if !dry_run {
        caches.clear_tmp(&config)?;
    }
    caches.cleanup(dry_run)
}

/// Tally of one cleanup sweep.
#[derive(Debug, Default)]
pub struct CleanupStats {
    pub removed_dirs: usize,
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_files: usize,
    pub retained_bytes: u64,
}

impl fmt::Display for CleanupStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "removed {} files ({} bytes) and {} directories, retained {} files ({} bytes)",
            self.removed_files,
            self.removed_bytes,
            self.removed_dirs,
            self.retained_files,
            self.retained_bytes,
        )
    }
}

impl CacheDir {
    /// Cleans up this cache directory, deleting entries whose mtime is older
    /// than the configured retention.
    ///
    /// Since every cache hit bumps the entry's mtime, this implements a
    /// time-to-idle expiry. Caches with no retention configured are skipped.
    pub fn cleanup(&self, dry_run: bool) -> Result<()> {
        let Some(max_unused_for) = self.max_unused_for() else {
            tracing::info!("Not cleaning up cache {}: no retention configured", self.name());
            return Ok(());
        };

        tracing::info!("Cleaning up cache: {}", self.name());
        let mut stats = CleanupStats::default();
        cleanup_directory_recursive(self.path(), max_unused_for, dry_run, &mut stats)?;

        metric!(
            gauge("caches.size") = stats.retained_bytes,
            "cache" => self.name().as_ref(),
        );
        metric!(
            gauge("caches.file.count") = stats.retained_files as u64,
            "cache" => self.name().as_ref(),
        );
        tracing::info!("Cleanup of {} done: {stats}", self.name());

        Ok(())
    }
}

/// Cleans up the directory recursively, returning `true` if the directory is
/// left empty after the sweep.
fn cleanup_directory_recursive(
    directory: &Path,
    max_unused_for: Duration,
    dry_run: bool,
    stats: &mut CleanupStats,
) -> io::Result<bool> {
    // Concurrent processes remove entries and prune directories as well, so a
    // vanished directory is not an error.
    let entries = match catch_not_found(|| std::fs::read_dir(directory))? {
        Some(entries) => entries,
        None => return Ok(true),
    };

    let mut is_empty = true;
    for entry in entries {
        let path = entry?.path();

        if path.is_dir() {
            let mut dir_is_empty =
                cleanup_directory_recursive(&path, max_unused_for, dry_run, stats)?;
            if dir_is_empty && !dry_run {
                match catch_not_found(|| std::fs::remove_dir(&path)) {
                    Ok(_) => stats.removed_dirs += 1,
                    Err(e) => {
                        // A new entry can be persisted into the directory
                        // between our scan and the removal.
                        tracing::debug!(
                            error = &e as &dyn std::error::Error,
                            path = %path.display(),
                            "Could not prune cache directory",
                        );
                        dir_is_empty = false;
                    }
                }
            }
            is_empty &= dir_is_empty;
            continue;
        }

        let size = path.metadata().map(|m| m.len()).unwrap_or_default();
        if expired(&path, max_unused_for)? {
            tracing::trace!("Removing cache entry {}", path.display());
            stats.removed_files += 1;
            stats.removed_bytes += size;
            if dry_run {
                is_empty = false;
            } else {
                catch_not_found(|| std::fs::remove_file(&path))?;
            }
        } else {
            stats.retained_files += 1;
            stats.retained_bytes += size;
            is_empty = false;
        }
    }

    Ok(is_empty)
}

/// Whether the sweep should remove the file at `path`.
///
/// A metadata sidecar whose content file is gone is an orphan and removed
/// regardless of age; everything else expires by mtime.
fn expired(path: &Path, max_unused_for: Duration) -> io::Result<bool> {
    if is_metadata_path(path) {
        if let Some(content) = content_path_of(path) {
            if !content.exists() {
                return Ok(true);
            }
        }
    }

    let metadata = match catch_not_found(|| path.metadata())? {
        Some(metadata) => metadata,
        None => return Ok(false),
    };
    let mtime = metadata.modified()?;
    Ok(mtime.elapsed().unwrap_or_default() > max_unused_for)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::{self, File};
    use std::io::Write;

    use crate::config::CacheName;

    fn config_with_root(root: &Path, max_unused_for: &str) -> Config {
        let yaml = format!(
            "cache_dir: {}\ncaches:\n  objects:\n    max_unused_for: {max_unused_for}\n",
            root.display()
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    fn make_stale(path: &Path) {
        let two_days_ago =
            filetime::FileTime::from_system_time(std::time::SystemTime::now() - Duration::from_secs(3600 * 48));
        filetime::set_file_mtime(path, two_days_ago).unwrap();
    }

    #[test]
    fn test_cleanup_removes_stale_entries() {
        let tempdir = hangar_test::tempdir();
        let config = config_with_root(tempdir.path(), "1h");
        let cache = CacheDir::from_config(CacheName::Objects, &config).unwrap();

        let bucket = cache.path().join("datasets");
        fs::create_dir_all(&bucket).unwrap();
        let stale = bucket.join("old.bin");
        let fresh = bucket.join("new.bin");
        File::create(&stale).unwrap().write_all(b"old").unwrap();
        File::create(&fresh).unwrap().write_all(b"new").unwrap();
        make_stale(&stale);

        cache.cleanup(false).unwrap();

        assert!(!stale.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn test_cleanup_prunes_empty_directories() {
        let tempdir = hangar_test::tempdir();
        let config = config_with_root(tempdir.path(), "1h");
        let cache = CacheDir::from_config(CacheName::Objects, &config).unwrap();

        let nested = cache.path().join("datasets").join("aa");
        fs::create_dir_all(&nested).unwrap();
        let stale = nested.join("entry");
        File::create(&stale).unwrap().write_all(b"x").unwrap();
        make_stale(&stale);

        cache.cleanup(false).unwrap();

        assert!(!nested.exists());
        assert!(!cache.path().join("datasets").exists());
        // the cache root itself survives
        assert!(cache.path().exists());
    }

    #[test]
    fn test_cleanup_removes_orphaned_sidecars() {
        let tempdir = hangar_test::tempdir();
        let config = config_with_root(tempdir.path(), "1h");
        let cache = CacheDir::from_config(CacheName::Objects, &config).unwrap();

        let bucket = cache.path().join("datasets");
        fs::create_dir_all(&bucket).unwrap();
        let orphan = bucket.join("gone.bin.meta.json");
        File::create(&orphan).unwrap().write_all(b"{}").unwrap();

        let content = bucket.join("kept.bin");
        let sidecar = bucket.join("kept.bin.meta.json");
        File::create(&content).unwrap().write_all(b"x").unwrap();
        File::create(&sidecar).unwrap().write_all(b"{}").unwrap();

        cache.cleanup(false).unwrap();

        // fresh sidecar with a live content file stays, orphan goes
        assert!(!orphan.exists());
        assert!(content.exists());
        assert!(sidecar.exists());
    }

    #[test]
    fn test_cleanup_dry_run_keeps_everything() {
        let tempdir = hangar_test::tempdir();
        let config = config_with_root(tempdir.path(), "1h");
        let cache = CacheDir::from_config(CacheName::Objects, &config).unwrap();

        let bucket = cache.path().join("datasets");
        fs::create_dir_all(&bucket).unwrap();
        let stale = bucket.join("old.bin");
        File::create(&stale).unwrap().write_all(b"old").unwrap();
        make_stale(&stale);

        cache.cleanup(true).unwrap();

        assert!(stale.exists());
    }

    #[test]
    fn test_cleanup_disabled_without_retention() {
        let tempdir = hangar_test::tempdir();
        let yaml = format!(
            "cache_dir: {}\ncaches:\n  objects:\n    max_unused_for: null\n",
            tempdir.path().display()
        );
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        let cache = CacheDir::from_config(CacheName::Objects, &config).unwrap();

        let stale = cache.path().join("old.bin");
        File::create(&stale).unwrap().write_all(b"old").unwrap();
        make_stale(&stale);

        cache.cleanup(false).unwrap();

        assert!(stale.exists());
    }
}
