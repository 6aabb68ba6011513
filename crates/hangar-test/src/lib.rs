//! Helpers for testing the storage and caching crates.
//!
//! The functions in this crate are exclusively used in tests and are not part
//! of any public API.

use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use hangar_storage::{
    BucketEntry, IncompleteUpload, ObjectEntry, ObjectInfo, ObjectStorage, PutOptions,
    StorageError, StorageInfo,
};
use tempfile::TempDir;

/// Setup the test environment.
///
/// Initializes logging to the test writer, so failing tests print captured
/// log output. Safe to call multiple times.
pub fn setup() {
    tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .pretty()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, so it
/// must be bound in the test for the duration of the test.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

#[derive(Debug)]
struct StoredObject {
    data: Bytes,
    info: ObjectInfo,
}

#[derive(Debug, Default)]
struct Bucket {
    objects: BTreeMap<String, StoredObject>,
    incomplete_uploads: Vec<IncompleteUpload>,
    policy: String,
}

#[derive(Debug, Default)]
struct State {
    buckets: BTreeMap<String, Bucket>,
    calls: Vec<String>,
    failing_ops: BTreeSet<String>,
}

/// An in-memory [`ObjectStorage`] that records every call made to it.
///
/// Tests assert cache behavior through the call log: a read served from the
/// cache makes no `get_object` call, a write-through makes exactly one
/// `put_object` call, and so on. Individual operations can be made to fail
/// with [`fail_on`](Self::fail_on) to exercise error paths.
#[derive(Debug, Default)]
pub struct RecordingStorage {
    state: Mutex<State>,
}

impl RecordingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a bucket and an object in it without recording any calls.
    pub fn seed_object(&self, bucket: &str, key: &str, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let bucket = state.buckets.entry(bucket.to_owned()).or_default();
        bucket
            .objects
            .insert(key.to_owned(), stored(key, Bytes::copy_from_slice(data), PutOptions::default()));
    }

    /// Creates an empty bucket without recording any calls.
    pub fn seed_bucket(&self, bucket: &str) {
        let mut state = self.state.lock().unwrap();
        state.buckets.entry(bucket.to_owned()).or_default();
    }

    /// Registers an incomplete upload without recording any calls.
    pub fn seed_incomplete_upload(&self, bucket: &str, upload: IncompleteUpload) {
        let mut state = self.state.lock().unwrap();
        state
            .buckets
            .entry(bucket.to_owned())
            .or_default()
            .incomplete_uploads
            .push(upload);
    }

    /// Makes all future calls of the named operation fail.
    pub fn fail_on(&self, op: &str) {
        self.state.lock().unwrap().failing_ops.insert(op.to_owned());
    }

    /// Lets the named operation succeed again.
    pub fn recover(&self, op: &str) {
        self.state.lock().unwrap().failing_ops.remove(op);
    }

    /// Returns all recorded calls, each as `"<op> <detail>"`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Returns how often the named operation was called.
    pub fn count(&self, op: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|call| call.split(' ').next() == Some(op))
            .count()
    }

    /// Returns the current contents of an object, if it exists.
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        let state = self.state.lock().unwrap();
        let object = state.buckets.get(bucket)?.objects.get(key)?;
        Some(object.data.clone())
    }
}

fn stored(key: &str, data: Bytes, opts: PutOptions) -> StoredObject {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    data.hash(&mut hasher);
    let info = ObjectInfo {
        key: key.to_owned(),
        size: data.len() as u64,
        content_type: opts.content_type,
        etag: Some(format!("{:016x}", hasher.finish())),
        last_modified: Some(Utc::now()),
        user_metadata: opts.user_metadata,
    };
    StoredObject { data, info }
}

impl State {
    fn record(&mut self, op: &str, detail: String) -> Result<(), StorageError> {
        self.calls.push(format!("{op} {detail}"));
        if self.failing_ops.contains(op) {
            return Err(StorageError::Remote("injected failure".to_owned()));
        }
        Ok(())
    }

    fn bucket(&self, bucket: &str) -> Result<&Bucket, StorageError> {
        self.buckets
            .get(bucket)
            .ok_or_else(|| StorageError::BucketNotFound(bucket.to_owned()))
    }

    fn bucket_mut(&mut self, bucket: &str) -> Result<&mut Bucket, StorageError> {
        self.buckets
            .get_mut(bucket)
            .ok_or_else(|| StorageError::BucketNotFound(bucket.to_owned()))
    }

    fn object(&self, bucket: &str, key: &str) -> Result<&StoredObject, StorageError> {
        self.bucket(bucket)?
            .objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
            })
    }
}

#[async_trait]
impl ObjectStorage for RecordingStorage {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError> {
        let mut state = self.state.lock().unwrap();
        state.record("get_object", format!("{bucket}/{key}"))?;
        Ok(state.object(bucket, key)?.data.clone())
    }

    async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, StorageError> {
        let mut state = self.state.lock().unwrap();
        state.record("get_object_range", format!("{bucket}/{key} {offset}+{length}"))?;
        let data = &state.object(bucket, key)?.data;
        let start = (offset as usize).min(data.len());
        let end = (start + length as usize).min(data.len());
        Ok(data.slice(start..end))
    }

    async fn get_object_to_path(
        &self,
        bucket: &str,
        key: &str,
        dest: &Path,
    ) -> Result<(), StorageError> {
        let data = {
            let mut state = self.state.lock().unwrap();
            state.record("get_object_to_path", format!("{bucket}/{key}"))?;
            state.object(bucket, key)?.data.clone()
        };
        std::fs::write(dest, &data).map_err(|_| StorageError::Internal)
    }

    async fn get_object_info(&self, bucket: &str, key: &str) -> Result<ObjectInfo, StorageError> {
        let mut state = self.state.lock().unwrap();
        state.record("get_object_info", format!("{bucket}/{key}"))?;
        Ok(state.object(bucket, key)?.info.clone())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        opts: PutOptions,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        state.record("put_object", format!("{bucket}/{key}"))?;
        // buckets are auto-created to keep test setup short
        state
            .buckets
            .entry(bucket.to_owned())
            .or_default()
            .objects
            .insert(key.to_owned(), stored(key, data, opts));
        Ok(())
    }

    async fn put_object_from_path(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        opts: PutOptions,
    ) -> Result<(), StorageError> {
        let data = std::fs::read(path).map_err(|_| StorageError::Internal)?;
        let mut state = self.state.lock().unwrap();
        state.record("put_object_from_path", format!("{bucket}/{key}"))?;
        state
            .buckets
            .entry(bucket.to_owned())
            .or_default()
            .objects
            .insert(key.to_owned(), stored(key, Bytes::from(data), opts));
        Ok(())
    }

    async fn remove_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        state.record("remove_object", format!("{bucket}/{key}"))?;
        state.bucket_mut(bucket)?.objects.remove(key);
        Ok(())
    }

    async fn remove_bucket(&self, bucket: &str, force: bool) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        state.record("remove_bucket", format!("{bucket} force={force}"))?;
        if !force && !state.bucket(bucket)?.objects.is_empty() {
            return Err(StorageError::Remote("bucket not empty".to_owned()));
        }
        state
            .buckets
            .remove(bucket)
            .map(|_| ())
            .ok_or_else(|| StorageError::BucketNotFound(bucket.to_owned()))
    }

    async fn copy_object(
        &self,
        bucket: &str,
        key: &str,
        dest_bucket: &str,
        dest_key: Option<&str>,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        let dest_key = dest_key.unwrap_or(key).to_owned();
        state.record("copy_object", format!("{bucket}/{key} -> {dest_bucket}/{dest_key}"))?;
        let object = state.object(bucket, key)?;
        let copy = stored(
            &dest_key,
            object.data.clone(),
            PutOptions {
                content_type: object.info.content_type.clone(),
                user_metadata: object.info.user_metadata.clone(),
            },
        );
        state.bucket_mut(dest_bucket)?.objects.insert(dest_key, copy);
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        recursive: bool,
    ) -> Result<Vec<ObjectEntry>, StorageError> {
        let mut state = self.state.lock().unwrap();
        state.record("list_objects", format!("{bucket} prefix={prefix:?}"))?;
        let bucket = state.bucket(bucket)?;
        let prefix = prefix.unwrap_or("");

        let mut entries = Vec::new();
        let mut prefixes = BTreeSet::new();
        for (key, object) in &bucket.objects {
            let Some(rest) = key.strip_prefix(prefix) else {
                continue;
            };
            if !recursive {
                if let Some(slash) = rest.find('/') {
                    prefixes.insert(format!("{prefix}{}", &rest[..slash + 1]));
                    continue;
                }
            }
            entries.push(ObjectEntry {
                key: key.clone(),
                size: object.info.size,
                last_modified: object.info.last_modified,
                is_prefix: false,
            });
        }
        for key in prefixes {
            entries.push(ObjectEntry {
                key,
                size: 0,
                last_modified: None,
                is_prefix: true,
            });
        }
        Ok(entries)
    }

    async fn list_incomplete_uploads(
        &self,
        bucket: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<IncompleteUpload>, StorageError> {
        let mut state = self.state.lock().unwrap();
        state.record("list_incomplete_uploads", format!("{bucket} prefix={prefix:?}"))?;
        let prefix = prefix.unwrap_or("");
        Ok(state
            .bucket(bucket)?
            .incomplete_uploads
            .iter()
            .filter(|upload| upload.key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn remove_incomplete_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        state.record("remove_incomplete_upload", format!("{bucket}/{key}"))?;
        state
            .bucket_mut(bucket)?
            .incomplete_uploads
            .retain(|upload| upload.key != key);
        Ok(())
    }

    async fn make_bucket(&self, bucket: &str, region: Option<&str>) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        state.record("make_bucket", format!("{bucket} region={region:?}"))?;
        state.buckets.entry(bucket.to_owned()).or_default();
        Ok(())
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        let mut state = self.state.lock().unwrap();
        state.record("bucket_exists", bucket.to_owned())?;
        Ok(state.buckets.contains_key(bucket))
    }

    async fn list_buckets(&self) -> Result<Vec<BucketEntry>, StorageError> {
        let mut state = self.state.lock().unwrap();
        state.record("list_buckets", String::new())?;
        Ok(state
            .buckets
            .keys()
            .map(|name| BucketEntry {
                name: name.clone(),
                created: None,
            })
            .collect())
    }

    async fn get_policy(&self, bucket: &str) -> Result<String, StorageError> {
        let mut state = self.state.lock().unwrap();
        state.record("get_policy", bucket.to_owned())?;
        Ok(state.bucket(bucket)?.policy.clone())
    }

    async fn set_policy(&self, bucket: &str, policy: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        state.record("set_policy", bucket.to_owned())?;
        state.bucket_mut(bucket)?.policy = policy.to_owned();
        Ok(())
    }

    async fn storage_info(&self) -> Result<StorageInfo, StorageError> {
        let mut state = self.state.lock().unwrap();
        state.record("storage_info", String::new())?;
        let used_bytes = state
            .buckets
            .values()
            .flat_map(|bucket| bucket.objects.values())
            .map(|object| object.info.size)
            .sum();
        Ok(StorageInfo {
            kind: "recording".to_owned(),
            used_bytes: Some(used_bytes),
        })
    }
}
