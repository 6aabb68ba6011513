use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use hangar_storage::{
    validate_bucket_name, validate_object_key, BucketEntry, IncompleteUpload, ObjectEntry,
    ObjectInfo, ObjectStorage, PutOptions, StorageError, StorageInfo,
};

use crate::fs::{catch_not_found, metadata_path, touch_debounced, CacheDir};
use crate::key::object_cache_path;

/// How a best-effort cache interaction turned out.
///
/// This is a pure observability side channel: it feeds logs and metrics but
/// never changes what the caller sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// The request was served from the local cache.
    Hit,
    /// The authoritative store was used and the cache entry was refreshed.
    Refreshed,
    /// The authoritative store was used but refreshing the cache failed.
    RefreshFailed,
    /// The operation does not consult the cache at all.
    Bypass,
}

impl AsRef<str> for CacheOutcome {
    fn as_ref(&self) -> &str {
        match self {
            Self::Hit => "hit",
            Self::Refreshed => "refreshed",
            Self::RefreshFailed => "refresh-failed",
            Self::Bypass => "bypass",
        }
    }
}

/// A read-through/write-through cache in front of an authoritative [`ObjectStorage`].
///
/// This is a drop-in decorator: it implements the same trait as the backend it
/// wraps. The cache is a pure performance accelerant, never a correctness
/// dependency. Every cache-side failure is caught, logged and ignored; the
/// remote store call is always what the caller observes. In particular the
/// cache never compensates for remote outages by serving a local entry as if
/// it were fresh.
///
/// There is no per-key mutual exclusion here: concurrent misses on the same
/// `(bucket, key)` each fetch from the remote store and race a last-writer-wins
/// overwrite of the cache file. Each caller's bytes come from its own remote
/// fetch, so the race costs redundant fetches, never correctness.
pub struct CachedStorage {
    remote: Arc<dyn ObjectStorage>,
    cache: CacheDir,
}

impl CachedStorage {
    /// Creates a caching decorator around `remote`, storing entries in `cache`.
    pub fn new(remote: Arc<dyn ObjectStorage>, cache: CacheDir) -> Self {
        Self { remote, cache }
    }

    /// The authoritative store this cache decorates.
    pub fn remote(&self) -> &Arc<dyn ObjectStorage> {
        &self.remote
    }

    fn content_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.cache.join(&object_cache_path(bucket, key))
    }

    /// Best-effort read of a cached file. Any failure is a miss.
    fn read_cached(&self, path: &Path) -> Option<Vec<u8>> {
        match std::fs::read(path) {
            Ok(data) => {
                if let Err(e) = touch_debounced(path) {
                    tracing::warn!(
                        error = &e as &dyn std::error::Error,
                        path = %path.display(),
                        "Cannot bump mtime of cache entry",
                    );
                }
                Some(data)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Cannot read cached object",
                );
                None
            }
        }
    }

    /// Best-effort write of freshly fetched bytes into the cache.
    fn store_cached(&self, path: &Path, data: &[u8]) -> CacheOutcome {
        match self.cache.write_atomic(path, data) {
            Ok(()) => {
                metric!(
                    time_raw("caches.file.size") = data.len() as u64,
                    "cache" => self.cache.name().as_ref(),
                );
                CacheOutcome::Refreshed
            }
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Cannot write object to cache",
                );
                CacheOutcome::RefreshFailed
            }
        }
    }

    /// Best-effort removal of a cache file. `NotFound` is fine.
    fn evict_cached(&self, path: &Path) {
        if let Err(e) = catch_not_found(|| std::fs::remove_file(path)) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %path.display(),
                "Cannot delete cached file",
            );
        }
    }

    fn record_outcome(&self, outcome: CacheOutcome) {
        let name = self.cache.name();
        metric!(counter("caches.access") += 1, "cache" => name.as_ref());
        match outcome {
            CacheOutcome::Hit => {
                metric!(counter("caches.file.hit") += 1, "cache" => name.as_ref())
            }
            CacheOutcome::Refreshed | CacheOutcome::RefreshFailed => {
                metric!(
                    counter("caches.file.miss") += 1,
                    "cache" => name.as_ref(),
                    "status" => outcome.as_ref(),
                )
            }
            CacheOutcome::Bypass => {}
        }
    }
}

#[async_trait]
impl ObjectStorage for CachedStorage {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError> {
        validate_bucket_name(bucket)?;
        validate_object_key(key)?;

        let path = self.content_path(bucket, key);
        if let Some(data) = self.read_cached(&path) {
            self.record_outcome(CacheOutcome::Hit);
            return Ok(data.into());
        }

        let data = self.remote.get_object(bucket, key).await?;
        let outcome = self.store_cached(&path, &data);
        self.record_outcome(outcome);
        Ok(data)
    }

    async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, StorageError> {
        validate_bucket_name(bucket)?;
        validate_object_key(key)?;

        // Range reconstruction from a possibly-incomplete cached whole object
        // is unsupported; ranges always go straight to the remote store.
        self.record_outcome(CacheOutcome::Bypass);
        self.remote
            .get_object_range(bucket, key, offset, length)
            .await
    }

    async fn get_object_to_path(
        &self,
        bucket: &str,
        key: &str,
        dest: &Path,
    ) -> Result<(), StorageError> {
        validate_bucket_name(bucket)?;
        validate_object_key(key)?;

        let path = self.content_path(bucket, key);
        if path.is_file() {
            match std::fs::copy(&path, dest) {
                Ok(_) => {
                    if let Err(e) = touch_debounced(&path) {
                        tracing::warn!(
                            error = &e as &dyn std::error::Error,
                            path = %path.display(),
                            "Cannot bump mtime of cache entry",
                        );
                    }
                    self.record_outcome(CacheOutcome::Hit);
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        path = %path.display(),
                        "Cannot copy cached object, falling back to remote",
                    );
                }
            }
        }

        self.remote.get_object_to_path(bucket, key, dest).await?;

        let outcome = match std::fs::read(dest) {
            Ok(data) => self.store_cached(&path, &data),
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %dest.display(),
                    "Cannot copy fetched object into cache",
                );
                CacheOutcome::RefreshFailed
            }
        };
        self.record_outcome(outcome);
        Ok(())
    }

    async fn get_object_info(&self, bucket: &str, key: &str) -> Result<ObjectInfo, StorageError> {
        validate_bucket_name(bucket)?;
        validate_object_key(key)?;

        // Metadata is cached independently of content; a missing content file
        // says nothing about the sidecar and vice versa.
        let path = metadata_path(&self.content_path(bucket, key));
        if let Some(buf) = self.read_cached(&path) {
            match serde_json::from_slice(&buf) {
                Ok(info) => {
                    self.record_outcome(CacheOutcome::Hit);
                    return Ok(info);
                }
                Err(e) => {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        path = %path.display(),
                        "Cannot deserialize cached object metadata",
                    );
                }
            }
        }

        let info = self.remote.get_object_info(bucket, key).await?;

        let outcome = match serde_json::to_vec_pretty(&info) {
            Ok(buf) => self.store_cached(&path, &buf),
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    "Cannot serialize object metadata for cache",
                );
                CacheOutcome::RefreshFailed
            }
        };
        self.record_outcome(outcome);
        Ok(info)
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        opts: PutOptions,
    ) -> Result<(), StorageError> {
        validate_bucket_name(bucket)?;
        validate_object_key(key)?;

        // Write-through: the authoritative store goes first. If it fails the
        // local cache is left untouched so it can never get ahead.
        self.remote
            .put_object(bucket, key, data.clone(), opts)
            .await?;

        let path = self.content_path(bucket, key);
        let outcome = self.store_cached(&path, &data);
        // The sidecar is stale now; drop it so the next metadata read refetches.
        self.evict_cached(&metadata_path(&path));
        self.record_outcome(outcome);
        Ok(())
    }

    async fn put_object_from_path(
        &self,
        bucket: &str,
        key: &str,
        file_path: &Path,
        opts: PutOptions,
    ) -> Result<(), StorageError> {
        validate_bucket_name(bucket)?;
        validate_object_key(key)?;

        self.remote
            .put_object_from_path(bucket, key, file_path, opts)
            .await?;

        let path = self.content_path(bucket, key);
        let outcome = match std::fs::read(file_path) {
            Ok(data) => self.store_cached(&path, &data),
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %file_path.display(),
                    "Cannot copy uploaded file into cache",
                );
                CacheOutcome::RefreshFailed
            }
        };
        self.evict_cached(&metadata_path(&path));
        self.record_outcome(outcome);
        Ok(())
    }

    async fn remove_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        validate_bucket_name(bucket)?;
        validate_object_key(key)?;

        // Content and metadata sidecar go together; leaving the sidecar behind
        // would risk a stale metadata read after a delete-then-recreate.
        let path = self.content_path(bucket, key);
        self.evict_cached(&path);
        self.evict_cached(&metadata_path(&path));

        self.remote.remove_object(bucket, key).await
    }

    async fn remove_bucket(&self, bucket: &str, force: bool) -> Result<(), StorageError> {
        validate_bucket_name(bucket)?;

        let bucket_dir = self.cache.join(bucket);
        if let Err(e) = catch_not_found(|| std::fs::remove_dir_all(&bucket_dir)) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %bucket_dir.display(),
                "Cannot delete cached bucket directory",
            );
        }

        self.remote.remove_bucket(bucket, force).await
    }

    async fn copy_object(
        &self,
        bucket: &str,
        key: &str,
        dest_bucket: &str,
        dest_key: Option<&str>,
    ) -> Result<(), StorageError> {
        // The copy's destination is not pre-warmed; its first read is a remote fetch.
        self.remote
            .copy_object(bucket, key, dest_bucket, dest_key)
            .await
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        recursive: bool,
    ) -> Result<Vec<ObjectEntry>, StorageError> {
        self.remote.list_objects(bucket, prefix, recursive).await
    }

    async fn list_incomplete_uploads(
        &self,
        bucket: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<IncompleteUpload>, StorageError> {
        self.remote.list_incomplete_uploads(bucket, prefix).await
    }

    async fn remove_incomplete_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<(), StorageError> {
        self.remote.remove_incomplete_upload(bucket, key).await
    }

    async fn make_bucket(&self, bucket: &str, region: Option<&str>) -> Result<(), StorageError> {
        self.remote.make_bucket(bucket, region).await
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        self.remote.bucket_exists(bucket).await
    }

    async fn list_buckets(&self) -> Result<Vec<BucketEntry>, StorageError> {
        self.remote.list_buckets().await
    }

    async fn get_policy(&self, bucket: &str) -> Result<String, StorageError> {
        self.remote.get_policy(bucket).await
    }

    async fn set_policy(&self, bucket: &str, policy: &str) -> Result<(), StorageError> {
        self.remote.set_policy(bucket, policy).await
    }

    async fn storage_info(&self) -> Result<StorageInfo, StorageError> {
        self.remote.storage_info().await
    }
}
