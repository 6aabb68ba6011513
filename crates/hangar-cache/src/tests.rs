use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use hangar_storage::{ObjectStorage, PutOptions, StorageError};
use hangar_test::RecordingStorage;

use crate::config::{CacheName, Config};
use crate::error::CacheError;
use crate::fs::{metadata_path, CacheDir};
use crate::key::{object_cache_path, ParamValue};
use crate::object::CachedStorage;
use crate::{Caches, ComputationCache};

fn test_config(root: &Path) -> Config {
    Config {
        cache_dir: Some(root.to_path_buf()),
        caches: Default::default(),
    }
}

fn object_cache(root: &Path) -> CacheDir {
    CacheDir::from_config(CacheName::Objects, &test_config(root)).unwrap()
}

fn computation_cache(root: &Path) -> ComputationCache {
    ComputationCache::new(
        CacheDir::from_config(CacheName::Computations, &test_config(root)).unwrap(),
    )
}

/// A producer returning `"result"` that counts its invocations.
fn counting_producer(
    counter: Arc<AtomicUsize>,
) -> impl Fn(&[ParamValue]) -> crate::ProducerFuture + Send + Sync + 'static {
    move |_params| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(b"result".to_vec())
        }
        .boxed()
    }
}

#[tokio::test]
async fn test_object_read_through() {
    hangar_test::setup();
    let tmp = hangar_test::tempdir();
    let remote = Arc::new(RecordingStorage::new());
    remote.seed_object("datasets", "survey/ortho.tif", b"pixels");
    let cached = CachedStorage::new(remote.clone(), object_cache(tmp.path()));

    let data = cached.get_object("datasets", "survey/ortho.tif").await.unwrap();
    assert_eq!(&data[..], b"pixels");
    assert_eq!(remote.count("get_object"), 1);

    // the second read is served locally
    let data = cached.get_object("datasets", "survey/ortho.tif").await.unwrap();
    assert_eq!(&data[..], b"pixels");
    assert_eq!(remote.count("get_object"), 1);
}

#[tokio::test]
async fn test_object_cached_read_survives_remote_outage() {
    hangar_test::setup();
    let tmp = hangar_test::tempdir();
    let remote = Arc::new(RecordingStorage::new());
    remote.seed_object("datasets", "ortho.tif", b"pixels");
    let cached = CachedStorage::new(remote.clone(), object_cache(tmp.path()));

    cached.get_object("datasets", "ortho.tif").await.unwrap();

    remote.fail_on("get_object");
    let data = cached.get_object("datasets", "ortho.tif").await.unwrap();
    assert_eq!(&data[..], b"pixels");

    // an uncached key hits the outage directly
    remote.seed_object("datasets", "other.tif", b"x");
    let err = cached.get_object("datasets", "other.tif").await.unwrap_err();
    assert_eq!(err, StorageError::Remote("injected failure".to_owned()));
}

#[cfg(unix)]
#[tokio::test]
async fn test_object_unreadable_cache_entry_falls_through() {
    use std::os::unix::fs::PermissionsExt;

    hangar_test::setup();
    let tmp = hangar_test::tempdir();
    let remote = Arc::new(RecordingStorage::new());
    remote.seed_object("datasets", "ortho.tif", b"pixels");
    let cache = object_cache(tmp.path());
    let entry = cache.join(&object_cache_path("datasets", "ortho.tif"));
    let cached = CachedStorage::new(remote.clone(), cache);

    cached.get_object("datasets", "ortho.tif").await.unwrap();
    std::fs::set_permissions(&entry, std::fs::Permissions::from_mode(0o000)).unwrap();
    if std::fs::read(&entry).is_ok() {
        // privileged user, permission bits have no effect
        return;
    }

    // the unreadable entry degrades to a remote read, not an error
    let data = cached.get_object("datasets", "ortho.tif").await.unwrap();
    assert_eq!(&data[..], b"pixels");
    assert_eq!(remote.count("get_object"), 2);
}

#[cfg(unix)]
#[tokio::test]
async fn test_object_unwritable_cache_is_invisible() {
    use std::os::unix::fs::PermissionsExt;

    hangar_test::setup();
    let tmp = hangar_test::tempdir();
    let remote = Arc::new(RecordingStorage::new());
    remote.seed_object("datasets", "ortho.tif", b"pixels");
    let cache = object_cache(tmp.path());
    let cache_root = cache.path().to_path_buf();
    let cached = CachedStorage::new(remote.clone(), cache);

    std::fs::set_permissions(&cache_root, std::fs::Permissions::from_mode(0o555)).unwrap();
    if std::fs::create_dir(cache_root.join("probe")).is_ok() {
        // privileged user, permission bits have no effect
        std::fs::set_permissions(&cache_root, std::fs::Permissions::from_mode(0o755)).unwrap();
        return;
    }

    // reads keep working, they just never get a cache entry to hit
    for _ in 0..2 {
        let data = cached.get_object("datasets", "ortho.tif").await.unwrap();
        assert_eq!(&data[..], b"pixels");
    }
    assert_eq!(remote.count("get_object"), 2);

    std::fs::set_permissions(&cache_root, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[tokio::test]
async fn test_object_concurrent_misses_converge() {
    hangar_test::setup();
    let tmp = hangar_test::tempdir();
    let remote = Arc::new(RecordingStorage::new());
    remote.seed_object("datasets", "ortho.tif", b"pixels");
    let cached = CachedStorage::new(remote.clone(), object_cache(tmp.path()));

    let gets = (0..8).map(|_| cached.get_object("datasets", "ortho.tif"));
    for data in futures::future::join_all(gets).await {
        assert_eq!(&data.unwrap()[..], b"pixels");
    }

    // racing misses may each fetch, but the cache converges afterwards
    let fetched = remote.count("get_object");
    assert!((1..=8).contains(&fetched));
    cached.get_object("datasets", "ortho.tif").await.unwrap();
    assert_eq!(remote.count("get_object"), fetched);
}

#[tokio::test]
async fn test_object_write_through_ordering() {
    hangar_test::setup();
    let tmp = hangar_test::tempdir();
    let remote = Arc::new(RecordingStorage::new());
    let cache = object_cache(tmp.path());
    let entry = cache.join(&object_cache_path("datasets", "ortho.tif"));
    let cached = CachedStorage::new(remote.clone(), cache);

    remote.fail_on("put_object");
    let err = cached
        .put_object("datasets", "ortho.tif", Bytes::from_static(b"pixels"), PutOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, StorageError::Remote("injected failure".to_owned()));
    // the failed write never reaches the cache
    assert!(!entry.exists());

    remote.recover("put_object");
    cached
        .put_object("datasets", "ortho.tif", Bytes::from_static(b"pixels"), PutOptions::default())
        .await
        .unwrap();
    assert_eq!(remote.object("datasets", "ortho.tif").unwrap(), &b"pixels"[..]);
    assert_eq!(std::fs::read(&entry).unwrap(), b"pixels");
}

#[tokio::test]
async fn test_object_put_evicts_stale_metadata() {
    hangar_test::setup();
    let tmp = hangar_test::tempdir();
    let remote = Arc::new(RecordingStorage::new());
    remote.seed_object("datasets", "ortho.tif", b"old");
    let cache = object_cache(tmp.path());
    let sidecar = metadata_path(&cache.join(&object_cache_path("datasets", "ortho.tif")));
    let cached = CachedStorage::new(remote.clone(), cache);

    let old = cached.get_object_info("datasets", "ortho.tif").await.unwrap();
    assert!(sidecar.exists());

    cached
        .put_object("datasets", "ortho.tif", Bytes::from_static(b"newer data"), PutOptions::default())
        .await
        .unwrap();
    assert!(!sidecar.exists());

    let new = cached.get_object_info("datasets", "ortho.tif").await.unwrap();
    assert_eq!(new.size, 10);
    assert_ne!(old.etag, new.etag);
}

#[tokio::test]
async fn test_object_info_cached_independently() {
    hangar_test::setup();
    let tmp = hangar_test::tempdir();
    let remote = Arc::new(RecordingStorage::new());
    remote.seed_object("datasets", "ortho.tif", b"pixels");
    let cached = CachedStorage::new(remote.clone(), object_cache(tmp.path()));

    // caching the content does not cache the metadata
    cached.get_object("datasets", "ortho.tif").await.unwrap();
    let info = cached.get_object_info("datasets", "ortho.tif").await.unwrap();
    assert_eq!(info.size, 6);
    assert_eq!(remote.count("get_object_info"), 1);

    let again = cached.get_object_info("datasets", "ortho.tif").await.unwrap();
    assert_eq!(info, again);
    assert_eq!(remote.count("get_object_info"), 1);
}

#[tokio::test]
async fn test_object_range_reads_bypass_cache() {
    hangar_test::setup();
    let tmp = hangar_test::tempdir();
    let remote = Arc::new(RecordingStorage::new());
    remote.seed_object("datasets", "ortho.tif", b"0123456789");
    let cache = object_cache(tmp.path());
    let entry = cache.join(&object_cache_path("datasets", "ortho.tif"));
    let cached = CachedStorage::new(remote.clone(), cache);

    let range = cached
        .get_object_range("datasets", "ortho.tif", 2, 3)
        .await
        .unwrap();
    assert_eq!(&range[..], b"234");
    cached
        .get_object_range("datasets", "ortho.tif", 2, 3)
        .await
        .unwrap();
    assert_eq!(remote.count("get_object_range"), 2);
    assert!(!entry.exists());
}

#[tokio::test]
async fn test_object_get_to_path() {
    hangar_test::setup();
    let tmp = hangar_test::tempdir();
    let remote = Arc::new(RecordingStorage::new());
    remote.seed_object("datasets", "ortho.tif", b"pixels");
    let cached = CachedStorage::new(remote.clone(), object_cache(tmp.path()));

    let dest = tmp.path().join("download.tif");
    cached
        .get_object_to_path("datasets", "ortho.tif", &dest)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), b"pixels");

    let dest2 = tmp.path().join("download2.tif");
    cached
        .get_object_to_path("datasets", "ortho.tif", &dest2)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&dest2).unwrap(), b"pixels");
    assert_eq!(remote.count("get_object_to_path"), 1);
}

#[tokio::test]
async fn test_object_put_from_path() {
    hangar_test::setup();
    let tmp = hangar_test::tempdir();
    let remote = Arc::new(RecordingStorage::new());
    let cache = object_cache(tmp.path());
    let entry = cache.join(&object_cache_path("datasets", "ortho.tif"));
    let cached = CachedStorage::new(remote.clone(), cache);

    let source = tmp.path().join("upload.tif");
    std::fs::write(&source, b"pixels").unwrap();
    cached
        .put_object_from_path("datasets", "ortho.tif", &source, PutOptions::default())
        .await
        .unwrap();

    assert_eq!(remote.object("datasets", "ortho.tif").unwrap(), &b"pixels"[..]);
    assert_eq!(std::fs::read(&entry).unwrap(), b"pixels");
}

#[tokio::test]
async fn test_object_remove_evicts_content_and_metadata() {
    hangar_test::setup();
    let tmp = hangar_test::tempdir();
    let remote = Arc::new(RecordingStorage::new());
    remote.seed_object("datasets", "ortho.tif", b"pixels");
    let cache = object_cache(tmp.path());
    let entry = cache.join(&object_cache_path("datasets", "ortho.tif"));
    let sidecar = metadata_path(&entry);
    let cached = CachedStorage::new(remote.clone(), cache);

    cached.get_object("datasets", "ortho.tif").await.unwrap();
    cached.get_object_info("datasets", "ortho.tif").await.unwrap();
    assert!(entry.exists());
    assert!(sidecar.exists());

    cached.remove_object("datasets", "ortho.tif").await.unwrap();
    assert!(!entry.exists());
    assert!(!sidecar.exists());
    assert!(remote.object("datasets", "ortho.tif").is_none());
}

#[tokio::test]
async fn test_object_remove_evicts_even_when_remote_fails() {
    hangar_test::setup();
    let tmp = hangar_test::tempdir();
    let remote = Arc::new(RecordingStorage::new());
    remote.seed_object("datasets", "ortho.tif", b"pixels");
    let cache = object_cache(tmp.path());
    let entry = cache.join(&object_cache_path("datasets", "ortho.tif"));
    let cached = CachedStorage::new(remote.clone(), cache);

    cached.get_object("datasets", "ortho.tif").await.unwrap();
    remote.fail_on("remove_object");

    let err = cached.remove_object("datasets", "ortho.tif").await.unwrap_err();
    assert_eq!(err, StorageError::Remote("injected failure".to_owned()));
    // the local copy is gone regardless, so nothing stale can be served
    assert!(!entry.exists());
}

#[tokio::test]
async fn test_object_remove_bucket_clears_cache_directory() {
    hangar_test::setup();
    let tmp = hangar_test::tempdir();
    let remote = Arc::new(RecordingStorage::new());
    remote.seed_object("datasets", "a.tif", b"a");
    remote.seed_object("datasets", "b.tif", b"b");
    let cache = object_cache(tmp.path());
    let bucket_dir = cache.path().join("datasets");
    let cached = CachedStorage::new(remote.clone(), cache);

    cached.get_object("datasets", "a.tif").await.unwrap();
    cached.get_object("datasets", "b.tif").await.unwrap();
    assert!(bucket_dir.exists());

    cached.remove_bucket("datasets", true).await.unwrap();
    assert!(!bucket_dir.exists());
    assert!(!cached.bucket_exists("datasets").await.unwrap());
}

#[tokio::test]
async fn test_object_invalid_names_never_reach_remote() {
    hangar_test::setup();
    let tmp = hangar_test::tempdir();
    let remote = Arc::new(RecordingStorage::new());
    let cached = CachedStorage::new(remote.clone(), object_cache(tmp.path()));

    let err = cached.get_object("UPPER", "key").await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidName(_)));
    let err = cached.get_object("datasets", "../escape").await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidName(_)));
    let err = cached
        .get_object_range("UPPER", "key", 0, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidName(_)));

    assert!(remote.calls().is_empty());
}

#[tokio::test]
async fn test_computation_memoizes() {
    hangar_test::setup();
    let tmp = hangar_test::tempdir();
    let cache = computation_cache(tmp.path());
    let counter = Arc::new(AtomicUsize::new(0));
    cache.register("thumb", counting_producer(counter.clone()), None);

    let params = [ParamValue::from("a.jpg"), ParamValue::from(256)];
    let path = cache.get("thumb", "img", &params).await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"result");

    let again = cache.get("thumb", "img", &params).await.unwrap();
    assert_eq!(path, again);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_computation_distinct_params_distinct_entries() {
    hangar_test::setup();
    let tmp = hangar_test::tempdir();
    let cache = computation_cache(tmp.path());
    let counter = Arc::new(AtomicUsize::new(0));
    cache.register("thumb", counting_producer(counter.clone()), None);

    let small = cache
        .get("thumb", "img", &["a.jpg".into(), 256.into()])
        .await
        .unwrap();
    let large = cache
        .get("thumb", "img", &["a.jpg".into(), 512.into()])
        .await
        .unwrap();
    assert_ne!(small, large);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_computation_unregistered_seed() {
    hangar_test::setup();
    let tmp = hangar_test::tempdir();
    let cache = computation_cache(tmp.path());

    let err = cache.get("thumb", "img", &["a.jpg".into()]).await.unwrap_err();
    assert!(matches!(err, CacheError::NoProducer(seed) if seed == "thumb"));
}

#[tokio::test]
async fn test_computation_unregister_keeps_serving_cached_entries() {
    hangar_test::setup();
    let tmp = hangar_test::tempdir();
    let cache = computation_cache(tmp.path());
    let counter = Arc::new(AtomicUsize::new(0));
    cache.register("thumb", counting_producer(counter.clone()), None);

    let params = [ParamValue::from("a.jpg")];
    cache.get("thumb", "img", &params).await.unwrap();
    cache.unregister("thumb");

    // reads keep working, only recomputation needs the producer
    cache.get("thumb", "img", &params).await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    cache.remove("thumb", "img", &params).unwrap();
    let err = cache.get("thumb", "img", &params).await.unwrap_err();
    assert!(matches!(err, CacheError::NoProducer(_)));
}

#[tokio::test]
async fn test_computation_single_flight() {
    hangar_test::setup();
    let tmp = hangar_test::tempdir();
    let cache = computation_cache(tmp.path());
    let counter = Arc::new(AtomicUsize::new(0));
    let producer_counter = counter.clone();
    cache.register(
        "thumb",
        move |_params| {
            let counter = Arc::clone(&producer_counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(b"result".to_vec())
            }
            .boxed()
        },
        None,
    );

    let params = [ParamValue::from("a.jpg")];
    let gets = (0..8).map(|_| cache.get("thumb", "img", &params));
    let paths = futures::future::join_all(gets).await;

    let first = paths[0].as_ref().unwrap();
    for path in &paths {
        assert_eq!(path.as_ref().unwrap(), first);
    }
    // all eight concurrent misses share one computation
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_computation_expiration() {
    hangar_test::setup();
    let tmp = hangar_test::tempdir();
    let cache = computation_cache(tmp.path());
    let counter = Arc::new(AtomicUsize::new(0));
    let producer_counter = counter.clone();
    cache.register(
        "thumb",
        move |_params| {
            let attempt = producer_counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(format!("generation-{attempt}").into_bytes()) }.boxed()
        },
        Some(Duration::from_millis(50)),
    );

    let params = [ParamValue::from("a.jpg")];
    let path = cache.get("thumb", "img", &params).await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"generation-0");
    cache.get("thumb", "img", &params).await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;

    // recomputed exactly once, the new result replaces the old at the same path
    let recomputed = cache.get("thumb", "img", &params).await.unwrap();
    assert_eq!(recomputed, path);
    assert_eq!(std::fs::read(&path).unwrap(), b"generation-1");
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_computation_remove_forces_recompute() {
    hangar_test::setup();
    let tmp = hangar_test::tempdir();
    let cache = computation_cache(tmp.path());
    let counter = Arc::new(AtomicUsize::new(0));
    cache.register("thumb", counting_producer(counter.clone()), None);

    let params = [ParamValue::from("a.jpg")];
    let path = cache.get("thumb", "img", &params).await.unwrap();

    cache.remove("thumb", "img", &params).unwrap();
    assert!(!path.exists());
    assert!(!metadata_path(&path).exists());
    // removing again is a no-op
    cache.remove("thumb", "img", &params).unwrap();

    cache.get("thumb", "img", &params).await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_computation_clear_scoping() {
    hangar_test::setup();
    let tmp = hangar_test::tempdir();
    let cache = computation_cache(tmp.path());
    let counter = Arc::new(AtomicUsize::new(0));
    cache.register("thumb", counting_producer(counter.clone()), None);
    cache.register("tiles", counting_producer(counter.clone()), None);

    let params = [ParamValue::from("a.jpg")];
    cache.get("thumb", "img", &params).await.unwrap();
    cache.get("thumb", "map", &params).await.unwrap();
    cache.get("tiles", "img", &params).await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 3);

    // clearing one category leaves the sibling category alone
    cache.clear("thumb", Some("img")).unwrap();
    cache.get("thumb", "img", &params).await.unwrap();
    cache.get("thumb", "map", &params).await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 4);

    // clearing the whole seed leaves other seeds alone
    cache.clear("thumb", None).unwrap();
    cache.get("thumb", "img", &params).await.unwrap();
    cache.get("thumb", "map", &params).await.unwrap();
    cache.get("tiles", "img", &params).await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 6);

    // clearing a seed with no entries is a no-op
    cache.clear("missing", None).unwrap();
}

#[tokio::test]
async fn test_computation_producer_errors_are_not_cached() {
    hangar_test::setup();
    let tmp = hangar_test::tempdir();
    let cache = computation_cache(tmp.path());
    let counter = Arc::new(AtomicUsize::new(0));
    let producer_counter = counter.clone();
    cache.register(
        "thumb",
        move |_params| {
            let attempt = producer_counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(CacheError::Producer("decode failed".to_owned()))
                } else {
                    Ok(b"result".to_vec())
                }
            }
            .boxed()
        },
        None,
    );

    let params = [ParamValue::from("a.jpg")];
    let err = cache.get("thumb", "img", &params).await.unwrap_err();
    assert!(matches!(err, CacheError::Producer(_)));

    // the failure left nothing behind, the retry recomputes and succeeds
    let path = cache.get("thumb", "img", &params).await.unwrap();
    assert_eq!(std::fs::read(path).unwrap(), b"result");
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_computation_entries_survive_restart() {
    hangar_test::setup();
    let tmp = hangar_test::tempdir();
    let counter = Arc::new(AtomicUsize::new(0));
    let params = [ParamValue::from("a.jpg")];

    {
        let cache = computation_cache(tmp.path());
        cache.register("thumb", counting_producer(counter.clone()), None);
        cache.get("thumb", "img", &params).await.unwrap();
    }

    // a fresh instance without any registration serves the persisted entry
    let cache = computation_cache(tmp.path());
    let path = cache.get("thumb", "img", &params).await.unwrap();
    assert_eq!(std::fs::read(path).unwrap(), b"result");
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_clear_tmp() {
    hangar_test::setup();
    let tmp = hangar_test::tempdir();
    let config = test_config(tmp.path());
    let caches = Caches::from_config(&config).unwrap();

    let tmp_dir = tmp.path().join("tmp");
    std::fs::create_dir_all(&tmp_dir).unwrap();
    std::fs::write(tmp_dir.join("leftover"), b"crashed write").unwrap();

    caches.clear_tmp(&config).unwrap();
    assert!(tmp_dir.exists());
    assert!(!tmp_dir.join("leftover").exists());
}
