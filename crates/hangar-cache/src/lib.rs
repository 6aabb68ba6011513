//! A filesystem-backed caching layer for remote object storage and derived
//! computations.
//!
//! # Layout
//!
//! The cache root contains one directory per cache, plus a shared `tmp`
//! directory for in-progress writes:
//!
//! ```txt
//! <cache_dir>/
//!   tmp/
//!   objects/<bucket>/<escaped object key>
//!   computations/<seed>/<category>/aa/bbcc...
//! ```
//!
//! Entries are always written to a temp file under `tmp` first and then
//! atomically renamed into place, so readers never observe partially written
//! content. Next to some content files lives a `.meta.json` sidecar carrying
//! entry metadata.
//!
//! # Caches
//!
//! [`CachedStorage`] wraps any [`hangar_storage::ObjectStorage`] with a
//! read-through and write-through disk cache. The remote store stays the
//! source of truth and every cache interaction is best effort: local failures
//! degrade to remote access instead of failing the operation.
//!
//! [`ComputationCache`] memoizes registered producer functions keyed by
//! `(seed, category, parameters)`, with single-flight deduplication of
//! concurrent misses and optional per-seed expiration.
//!
//! # Expiration
//!
//! Both caches expire by disuse. Every hit bumps the entry's mtime (debounced
//! to once an hour) and the [`cleanup`] sweep removes entries that have not
//! been used within the configured `max_unused_for`. Multiple processes can
//! share one cache root; all coordination goes through the filesystem.

use std::io;

use anyhow::Result;

#[macro_use]
pub mod metrics;

mod cleanup;
mod computation;
mod config;
mod error;
mod fs;
mod key;
mod logging;
mod object;

#[cfg(test)]
mod tests;

pub use cleanup::{cleanup, CleanupStats};
pub use computation::{ComputationCache, ProducerFn, ProducerFuture};
pub use config::{
    CacheConfigs, CacheName, ComputationCacheConfig, Config, ObjectCacheConfig,
};
pub use error::CacheError;
pub use fs::CacheDir;
pub use key::{escape_path_segment, object_cache_path, CacheKey, CacheKeyBuilder, ParamValue};
pub use logging::init_json_logging;
pub use object::{CacheOutcome, CachedStorage};

/// All of the caches used by the hosting application.
#[derive(Debug, Clone)]
pub struct Caches {
    /// Cached remote objects.
    pub objects: CacheDir,
    /// Memoized computation results.
    pub computations: CacheDir,
}

impl Caches {
    pub fn from_config(config: &Config) -> io::Result<Self> {
        Ok(Self {
            objects: CacheDir::from_config(CacheName::Objects, config)?,
            computations: CacheDir::from_config(CacheName::Computations, config)?,
        })
    }

    /// Clear the temporary files.
    ///
    /// We need to do this on startup of the main process as we may have tmp
    /// files which survived a previous crash.
    pub fn clear_tmp(&self, config: &Config) -> io::Result<()> {
        if let Some(tmp) = config.cache_dir("tmp") {
            if tmp.exists() {
                std::fs::remove_dir_all(&tmp)?;
            }
            std::fs::create_dir_all(&tmp)?;
        }
        Ok(())
    }

    /// Sweeps all caches, removing entries past their retention.
    pub fn cleanup(&self, dry_run: bool) -> Result<()> {
        self.objects.cleanup(dry_run)?;
        self.computations.cleanup(dry_run)?;
        Ok(())
    }
}
