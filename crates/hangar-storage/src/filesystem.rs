use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::name::{validate_bucket_name, validate_object_key};
use crate::types::{
    BucketEntry, IncompleteUpload, ObjectEntry, ObjectInfo, PutOptions, StorageInfo,
};
use crate::{ObjectStorage, StorageError};

/// Directory inside each bucket that holds object metadata sidecars.
const META_DIR: &str = ".meta";
/// File inside each bucket that holds the bucket policy document.
const POLICY_FILE: &str = ".policy.json";

/// A directory-backed [`ObjectStorage`].
///
/// Buckets are directories under the root, objects are regular files at their
/// key path. Upload metadata lives in a `.meta` sidecar tree so it never
/// shows up in listings. This backend is the authoritative store for local
/// deployments and for tests; it is *not* the cache.
#[derive(Debug)]
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    /// Creates a storage rooted at the given directory, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.bucket_dir(bucket).join(key)
    }

    fn meta_path(&self, bucket: &str, key: &str) -> PathBuf {
        let mut path = self.bucket_dir(bucket).join(META_DIR).join(key);
        path.as_mut_os_string().push(".json");
        path
    }

    fn check_names(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        validate_bucket_name(bucket)?;
        validate_object_key(key)?;
        if !self.bucket_dir(bucket).is_dir() {
            return Err(StorageError::BucketNotFound(bucket.to_owned()));
        }
        Ok(())
    }

    fn not_found(&self, bucket: &str, key: &str) -> StorageError {
        StorageError::NotFound {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
        }
    }

    /// Atomically writes `data` to `path` via a sibling tempfile.
    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        let parent = path
            .parent()
            .ok_or_else(|| io::Error::other("object path has no parent"))?;
        fs::create_dir_all(parent)?;
        let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
        io::Write::write_all(&mut temp_file, data)?;
        temp_file.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn write_info(
        &self,
        bucket: &str,
        key: &str,
        size: u64,
        opts: PutOptions,
    ) -> Result<(), StorageError> {
        let info = ObjectInfo {
            key: key.to_owned(),
            size,
            content_type: opts.content_type,
            etag: None,
            last_modified: Some(Utc::now()),
            user_metadata: opts.user_metadata,
        };
        let buf = serde_json::to_vec_pretty(&info)?;
        self.write_atomic(&self.meta_path(bucket, key), &buf)
    }

    fn list_dir(
        &self,
        dir: &Path,
        prefix: &Path,
        recursive: bool,
        out: &mut Vec<ObjectEntry>,
    ) -> Result<(), StorageError> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            let rel = prefix.join(&name);
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                if recursive {
                    self.list_dir(&entry.path(), &rel, true, out)?;
                } else {
                    out.push(ObjectEntry {
                        key: format!("{}/", rel.to_string_lossy()),
                        size: 0,
                        last_modified: None,
                        is_prefix: true,
                    });
                }
            } else {
                out.push(ObjectEntry {
                    key: rel.to_string_lossy().into_owned(),
                    size: metadata.len(),
                    last_modified: metadata.modified().ok().map(DateTime::from),
                    is_prefix: false,
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for FilesystemStorage {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError> {
        self.check_names(bucket, key)?;
        match fs::read(self.object_path(bucket, key)) {
            Ok(data) => Ok(data.into()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(self.not_found(bucket, key)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, StorageError> {
        let data = self.get_object(bucket, key).await?;
        let start = (offset as usize).min(data.len());
        let end = (offset.saturating_add(length) as usize).min(data.len());
        Ok(data.slice(start..end))
    }

    async fn get_object_to_path(
        &self,
        bucket: &str,
        key: &str,
        dest: &Path,
    ) -> Result<(), StorageError> {
        let data = self.get_object(bucket, key).await?;
        self.write_atomic(dest, &data)
    }

    async fn get_object_info(&self, bucket: &str, key: &str) -> Result<ObjectInfo, StorageError> {
        self.check_names(bucket, key)?;
        match fs::read(self.meta_path(bucket, key)) {
            Ok(buf) => Ok(serde_json::from_slice(&buf)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // No sidecar; derive what we can from the file itself.
                let metadata = fs::metadata(self.object_path(bucket, key))
                    .map_err(|_| self.not_found(bucket, key))?;
                Ok(ObjectInfo {
                    key: key.to_owned(),
                    size: metadata.len(),
                    content_type: None,
                    etag: None,
                    last_modified: metadata.modified().ok().map(DateTime::from),
                    user_metadata: Default::default(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        opts: PutOptions,
    ) -> Result<(), StorageError> {
        self.check_names(bucket, key)?;
        self.write_atomic(&self.object_path(bucket, key), &data)?;
        self.write_info(bucket, key, data.len() as u64, opts)
    }

    async fn put_object_from_path(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        opts: PutOptions,
    ) -> Result<(), StorageError> {
        let data = fs::read(path)?;
        self.put_object(bucket, key, data.into(), opts).await
    }

    async fn remove_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        self.check_names(bucket, key)?;
        for path in [self.object_path(bucket, key), self.meta_path(bucket, key)] {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    async fn remove_bucket(&self, bucket: &str, force: bool) -> Result<(), StorageError> {
        validate_bucket_name(bucket)?;
        let dir = self.bucket_dir(bucket);
        if !dir.is_dir() {
            return Err(StorageError::BucketNotFound(bucket.to_owned()));
        }
        if !force {
            let has_objects = self
                .list_objects(bucket, None, true)
                .await?
                .iter()
                .any(|e| !e.is_prefix);
            if has_objects {
                return Err(StorageError::Remote(format!("bucket `{bucket}` not empty")));
            }
        }
        fs::remove_dir_all(dir)?;
        Ok(())
    }

    async fn copy_object(
        &self,
        bucket: &str,
        key: &str,
        dest_bucket: &str,
        dest_key: Option<&str>,
    ) -> Result<(), StorageError> {
        let dest_key = dest_key.unwrap_or(key);
        let data = self.get_object(bucket, key).await?;
        self.check_names(dest_bucket, dest_key)?;
        self.write_atomic(&self.object_path(dest_bucket, dest_key), &data)?;
        if let Ok(info) = self.get_object_info(bucket, key).await {
            let opts = PutOptions {
                content_type: info.content_type,
                user_metadata: info.user_metadata,
            };
            self.write_info(dest_bucket, dest_key, data.len() as u64, opts)?;
        }
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        recursive: bool,
    ) -> Result<Vec<ObjectEntry>, StorageError> {
        validate_bucket_name(bucket)?;
        let dir = self.bucket_dir(bucket);
        if !dir.is_dir() {
            return Err(StorageError::BucketNotFound(bucket.to_owned()));
        }

        let (dir, rel) = match prefix {
            Some(prefix) => {
                validate_object_key(prefix.trim_end_matches('/'))?;
                (dir.join(prefix), PathBuf::from(prefix))
            }
            None => (dir, PathBuf::new()),
        };

        let mut entries = Vec::new();
        if dir.is_dir() {
            self.list_dir(&dir, &rel, recursive, &mut entries)?;
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn list_incomplete_uploads(
        &self,
        bucket: &str,
        _prefix: Option<&str>,
    ) -> Result<Vec<IncompleteUpload>, StorageError> {
        validate_bucket_name(bucket)?;
        // Filesystem writes are atomic, there are no partial uploads to report.
        Ok(Vec::new())
    }

    async fn remove_incomplete_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<(), StorageError> {
        validate_bucket_name(bucket)?;
        validate_object_key(key)?;
        Ok(())
    }

    async fn make_bucket(&self, bucket: &str, _region: Option<&str>) -> Result<(), StorageError> {
        validate_bucket_name(bucket)?;
        let dir = self.bucket_dir(bucket);
        if dir.is_dir() {
            return Err(StorageError::Remote(format!(
                "bucket `{bucket}` already exists"
            )));
        }
        fs::create_dir_all(dir)?;
        Ok(())
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        validate_bucket_name(bucket)?;
        Ok(self.bucket_dir(bucket).is_dir())
    }

    async fn list_buckets(&self) -> Result<Vec<BucketEntry>, StorageError> {
        let mut buckets = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.metadata()?.is_dir() {
                continue;
            }
            let created = entry
                .metadata()?
                .created()
                .ok()
                .map(DateTime::from);
            buckets.push(BucketEntry { name, created });
        }
        buckets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(buckets)
    }

    async fn get_policy(&self, bucket: &str) -> Result<String, StorageError> {
        validate_bucket_name(bucket)?;
        if !self.bucket_dir(bucket).is_dir() {
            return Err(StorageError::BucketNotFound(bucket.to_owned()));
        }
        match fs::read_to_string(self.bucket_dir(bucket).join(POLICY_FILE)) {
            Ok(policy) => Ok(policy),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(self.not_found(bucket, POLICY_FILE))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn set_policy(&self, bucket: &str, policy: &str) -> Result<(), StorageError> {
        validate_bucket_name(bucket)?;
        if !self.bucket_dir(bucket).is_dir() {
            return Err(StorageError::BucketNotFound(bucket.to_owned()));
        }
        self.write_atomic(&self.bucket_dir(bucket).join(POLICY_FILE), policy.as_bytes())
    }

    async fn storage_info(&self) -> Result<StorageInfo, StorageError> {
        fn dir_size(dir: &Path) -> io::Result<u64> {
            let mut total = 0;
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                let metadata = entry.metadata()?;
                total += if metadata.is_dir() {
                    dir_size(&entry.path())?
                } else {
                    metadata.len()
                };
            }
            Ok(total)
        }

        Ok(StorageInfo {
            kind: "filesystem".to_owned(),
            used_bytes: Some(dir_size(&self.root)?),
        })
    }
}
