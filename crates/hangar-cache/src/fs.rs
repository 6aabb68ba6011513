use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use filetime::FileTime;
use tempfile::NamedTempFile;

use crate::config::{CacheName, Config};

/// The interval in which cache entries should be touched.
///
/// Entries use a "time to idle" expiry, so we need to regularly "touch" the
/// files to signal that they are still in use. This is debounced to once every
/// hour to not have to touch them on every single use.
pub(crate) const TOUCH_EVERY: Duration = Duration::from_secs(3600);

/// Suffix of the metadata sidecar next to a cache entry's content file.
const METADATA_SUFFIX: &str = ".meta.json";

/// An explicitly owned cache directory.
///
/// All cache operations go through one of these handles instead of touching
/// ambient filesystem paths; path derivation is a pure function of the handle
/// and the entry key. The on-disk state is the only shared resource between
/// processes, so nothing here assumes in-memory coherence: every check
/// re-reads the filesystem.
#[derive(Debug, Clone)]
pub struct CacheDir {
    /// Cache identifier used for metric names and the directory name.
    name: CacheName,

    /// Directory holding this cache's entries. Created on construction.
    cache_dir: PathBuf,

    /// Directory to use for temporary files.
    ///
    /// When writing a new file into the cache it is best to write it to a
    /// temporary file in a sibling directory; once fully written it can then
    /// be atomically moved to its actual location within `cache_dir`.
    tmp_dir: PathBuf,

    /// Time-to-idle used by the cleanup sweep.
    max_unused_for: Option<Duration>,
}

impl CacheDir {
    pub fn from_config(name: CacheName, config: &Config) -> io::Result<Self> {
        let base = config.cache_dir.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no cache directory configured")
        })?;
        let cache_dir = base.join(name.as_ref());
        let tmp_dir = base.join("tmp");
        std::fs::create_dir_all(&cache_dir)?;

        let max_unused_for = match name {
            CacheName::Objects => config.caches.objects.max_unused_for,
            CacheName::Computations => config.caches.computations.max_unused_for,
        };

        Ok(CacheDir {
            name,
            cache_dir,
            tmp_dir,
            max_unused_for,
        })
    }

    pub fn name(&self) -> CacheName {
        self.name
    }

    pub fn path(&self) -> &Path {
        &self.cache_dir
    }

    pub(crate) fn max_unused_for(&self) -> Option<Duration> {
        self.max_unused_for
    }

    /// Resolves the absolute path of a relative cache address.
    pub fn join(&self, relative: &str) -> PathBuf {
        self.cache_dir.join(relative)
    }

    /// Create a new temporary file to use in the cache.
    pub fn tempfile(&self) -> io::Result<NamedTempFile> {
        // The cleanup sweep could potentially remove the directories we are
        // operating in, so retry the fs operations.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = std::fs::create_dir_all(&self.tmp_dir) {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %self.tmp_dir.display(),
                    "Failed to create cache tmp directory",
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new().prefix("tmp").tempfile_in(&self.tmp_dir) {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        path = %self.tmp_dir.display(),
                        "Failed to create cache temp file",
                    );
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                    continue;
                }
            }
        }
    }

    /// Atomically moves a fully written temp file to its final cache location.
    pub fn persist(
        &self,
        mut temp_file: NamedTempFile,
        cache_path: &Path,
    ) -> io::Result<std::fs::File> {
        let parent = cache_path
            .parent()
            .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

        // The cleanup sweep could remove the parent directories we are
        // operating in, so retry the fs operations.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        let file = loop {
            retries += 1;

            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %parent.display(),
                    "Failed to create cache directory",
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match temp_file.persist(cache_path) {
                Ok(file) => break file,
                Err(e) => {
                    temp_file = e.file;
                    let err = e.error;
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        path = %cache_path.display(),
                        "Failed to create cache file",
                    );
                    if retries > MAX_RETRIES {
                        return Err(err);
                    }
                    continue;
                }
            }
        };
        Ok(file)
    }

    /// Writes a byte buffer to a cache path via a temp file.
    pub fn write_atomic(&self, cache_path: &Path, data: &[u8]) -> io::Result<()> {
        let mut temp_file = self.tempfile()?;
        io::Write::write_all(&mut temp_file, data)?;
        self.persist(temp_file, cache_path)?;
        Ok(())
    }
}

/// Returns the path of the metadata sidecar belonging to `path`.
pub fn metadata_path(path: &Path) -> PathBuf {
    let mut path = path.to_path_buf();
    path.as_mut_os_string().push(METADATA_SUFFIX);
    path
}

/// Whether `path` looks like a metadata sidecar.
pub(crate) fn is_metadata_path(path: &Path) -> bool {
    path.to_string_lossy().ends_with(METADATA_SUFFIX)
}

/// Returns the content path belonging to a metadata sidecar.
pub(crate) fn content_path_of(metadata_path: &Path) -> Option<PathBuf> {
    let s = metadata_path.to_string_lossy();
    let content = s.strip_suffix(METADATA_SUFFIX)?;
    Some(PathBuf::from(content))
}

/// Bumps the file's mtime to "now" if it has not been touched for [`TOUCH_EVERY`].
///
/// The mtime is what both the cleanup sweep and other processes sharing the
/// cache root use to decide whether an entry is still in use.
pub(crate) fn touch_debounced(path: &Path) -> io::Result<()> {
    let mtime = path.metadata()?.modified()?;
    if mtime.elapsed().unwrap_or_default() >= TOUCH_EVERY {
        filetime::set_file_mtime(path, FileTime::now())?;
    }
    Ok(())
}

/// Runs `f`, mapping an `io::ErrorKind::NotFound` outcome to `None`.
pub(crate) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
