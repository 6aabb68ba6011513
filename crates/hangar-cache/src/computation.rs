use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::fs::{catch_not_found, metadata_path, touch_debounced, CacheDir};
use crate::key::{escape_path_segment, CacheKey, ParamValue};

/// The future a registered producer returns.
pub type ProducerFuture = BoxFuture<'static, Result<Vec<u8>, CacheError>>;

/// A registered producer: a pure function from parameters to bytes.
///
/// Producers may block on CPU or I/O internally; a `get` under a cold cache
/// takes as long as the producer does.
pub type ProducerFn = dyn Fn(&[ParamValue]) -> ProducerFuture + Send + Sync;

#[derive(Clone)]
struct Registration {
    producer: Arc<ProducerFn>,
    expiration: Option<Duration>,
}

/// Expiry sidecar persisted next to every computed entry.
///
/// The expiration is stamped as an absolute time at creation, so re-registering
/// a seed with a different duration never retroactively changes entries that
/// already exist on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMetadata {
    /// The human-readable key metadata, for operator inspection.
    key: String,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

type SharedComputation = Shared<BoxFuture<'static, Result<PathBuf, CacheError>>>;
type InflightMap = HashMap<CacheKey, SharedComputation>;

/// A generic keyed cache of derived byte artifacts.
///
/// Each artifact is produced by a producer function registered under a *seed*
/// and addressed by `(seed, category, parameters)`. Entries are persisted to
/// disk and served from there until they are removed, cleared, or expire;
/// expiration is checked lazily at [`get`](Self::get) time only.
///
/// Concurrent `get`s for the same fully-resolved key converge on a single
/// producer invocation through a per-key in-flight registry: all racing
/// callers await one shared computation and observe its result. A caller
/// dropping its `get` future does not cancel a computation that other callers
/// still wait on; only when every waiter is gone does the work stop.
///
/// The filesystem is the only source of truth. Every freshness check re-reads
/// the disk, which is what keeps multiple processes sharing one cache root
/// correct; externally deleting any entry is equivalent to a miss.
pub struct ComputationCache {
    cache: CacheDir,
    producers: RwLock<HashMap<String, Registration>>,
    inflight: Arc<Mutex<InflightMap>>,
}

impl std::fmt::Debug for ComputationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let producers = self.producers.try_read().map(|p| p.len()).unwrap_or_default();
        let inflight = self.inflight.try_lock().map(|i| i.len()).unwrap_or_default();
        f.debug_struct("ComputationCache")
            .field("cache", &self.cache)
            .field("producers", &producers)
            .field("in-flight computations", &inflight)
            .finish()
    }
}

impl ComputationCache {
    pub fn new(cache: CacheDir) -> Self {
        Self {
            cache,
            producers: Default::default(),
            inflight: Default::default(),
        }
    }

    /// Associates `seed` with a producer function and an optional expiration.
    ///
    /// Re-registering a seed replaces its producer and expiration for
    /// subsequent misses; entries that are already materialized keep the
    /// expiration they were stamped with.
    pub fn register<F>(&self, seed: impl Into<String>, producer: F, expiration: Option<Duration>)
    where
        F: Fn(&[ParamValue]) -> ProducerFuture + Send + Sync + 'static,
    {
        let registration = Registration {
            producer: Arc::new(producer),
            expiration,
        };
        self.producers
            .write()
            .unwrap()
            .insert(seed.into(), registration);
    }

    /// Removes the producer association for `seed`.
    ///
    /// Already-materialized entries stay readable until they expire or are
    /// removed; registration is required to *compute*, not to *read*. A miss
    /// for an unregistered seed fails with [`CacheError::NoProducer`].
    pub fn unregister(&self, seed: &str) {
        self.producers.write().unwrap().remove(seed);
    }

    /// Returns the path of the cached artifact for `(seed, category, params)`,
    /// computing it first if there is no fresh entry on disk.
    pub async fn get(
        &self,
        seed: &str,
        category: &str,
        params: &[ParamValue],
    ) -> Result<PathBuf, CacheError> {
        let name = self.cache.name();
        metric!(counter("caches.access") += 1, "cache" => name.as_ref());

        let key = CacheKey::for_computation(seed, category, params);
        let path = self.cache.join(&key.cache_path());

        if entry_is_fresh(&path) {
            touch_entry(&path);
            metric!(counter("caches.file.hit") += 1, "cache" => name.as_ref());
            return Ok(path);
        }
        metric!(counter("caches.file.miss") += 1, "cache" => name.as_ref());

        let computation = {
            let mut inflight = self.inflight.lock().unwrap();
            if let Some(existing) = inflight.get(&key) {
                metric!(counter("caches.coalesced") += 1, "cache" => name.as_ref());
                existing.clone()
            } else {
                let registration = self.producers.read().unwrap().get(seed).cloned();
                let Some(registration) = registration else {
                    return Err(CacheError::NoProducer(seed.to_owned()));
                };

                metric!(counter("caches.computation") += 1, "cache" => name.as_ref());
                tracing::trace!("Spawning deduplicated computation for {key}");

                let computation = compute_and_persist(
                    self.cache.clone(),
                    key.clone(),
                    path,
                    registration,
                    params.to_vec(),
                    Arc::clone(&self.inflight),
                );
                let computation = computation.boxed().shared();
                inflight.insert(key, computation.clone());
                computation
            }
        };

        computation.await
    }

    /// Deletes exactly one entry by its derived key. Absent entries are a no-op.
    pub fn remove(
        &self,
        seed: &str,
        category: &str,
        params: &[ParamValue],
    ) -> Result<(), CacheError> {
        let key = CacheKey::for_computation(seed, category, params);
        let path = self.cache.join(&key.cache_path());
        catch_not_found(|| std::fs::remove_file(&path))?;
        catch_not_found(|| std::fs::remove_file(metadata_path(&path)))?;
        Ok(())
    }

    /// Deletes all persisted entries under `seed`, optionally restricted to
    /// one category. Safe to call with no entries present.
    pub fn clear(&self, seed: &str, category: Option<&str>) -> Result<(), CacheError> {
        let mut relative = escape_path_segment(seed);
        if let Some(category) = category {
            relative.push('/');
            relative.push_str(&escape_path_segment(category));
        }
        let dir = self.cache.join(&relative);
        catch_not_found(|| std::fs::remove_dir_all(dir))?;
        Ok(())
    }
}

/// Runs the producer and persists its output, then publishes the path.
///
/// The in-flight registry entry is removed when this future settles, whether
/// by completion or by all waiters dropping it. The content file is persisted
/// before the removal guard fires, so a `get` racing the removal finds the
/// entry on disk instead of starting a redundant computation.
async fn compute_and_persist(
    cache: CacheDir,
    key: CacheKey,
    path: PathBuf,
    registration: Registration,
    params: Vec<ParamValue>,
    inflight: Arc<Mutex<InflightMap>>,
) -> Result<PathBuf, CacheError> {
    let _done_token = {
        let key = key.clone();
        defer(move || {
            inflight.lock().unwrap().remove(&key);
        })
    };

    // Another process sharing the cache root may have materialized the entry
    // while we raced for the in-flight registry.
    if entry_is_fresh(&path) {
        return Ok(path);
    }

    let data = (registration.producer)(&params).await?;

    let mut temp_file = cache.tempfile()?;
    io::Write::write_all(&mut temp_file, &data)?;
    cache.persist(temp_file, &path)?;

    metric!(
        time_raw("caches.file.size") = data.len() as u64,
        "cache" => cache.name().as_ref(),
    );

    let created_at = Utc::now();
    let expires_at = registration
        .expiration
        .and_then(|d| chrono::Duration::from_std(d).ok())
        .map(|d| created_at + d);
    let metadata = EntryMetadata {
        key: key.metadata().to_owned(),
        created_at,
        expires_at,
    };
    cache.write_atomic(&metadata_path(&path), &serde_json::to_vec_pretty(&metadata)?)?;

    Ok(path)
}

/// Checks whether a non-expired entry exists at `path`.
///
/// Unreadable or corrupt sidecars make the entry a miss; recomputation will
/// rewrite both files.
fn entry_is_fresh(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }

    let buf = match std::fs::read(metadata_path(path)) {
        Ok(buf) => buf,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Cannot read cache entry sidecar",
                );
            }
            return false;
        }
    };

    let metadata: EntryMetadata = match serde_json::from_slice(&buf) {
        Ok(metadata) => metadata,
        Err(e) => {
            tracing::warn!(
                error = &e as &dyn std::error::Error,
                path = %path.display(),
                "Cannot deserialize cache entry sidecar",
            );
            return false;
        }
    };

    match metadata.expires_at {
        Some(expires_at) => Utc::now() < expires_at,
        None => true,
    }
}

/// Best-effort mtime bump of an entry and its sidecar on a hit.
fn touch_entry(path: &Path) {
    for path in [path.to_path_buf(), metadata_path(path)] {
        if let Err(e) = touch_debounced(&path) {
            tracing::warn!(
                error = &e as &dyn std::error::Error,
                path = %path.display(),
                "Cannot bump mtime of cache entry",
            );
        }
    }
}

/// Guard that runs a closure when dropped.
struct DeferGuard<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for DeferGuard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f()
        }
    }
}

fn defer<F: FnOnce()>(f: F) -> DeferGuard<F> {
    DeferGuard(Some(f))
}
