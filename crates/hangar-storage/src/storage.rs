use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;

use crate::types::{
    BucketEntry, IncompleteUpload, ObjectEntry, ObjectInfo, PutOptions, StorageInfo,
};
use crate::StorageError;

/// The object-access surface of an authoritative blob store.
///
/// Implementations are addressed by `(bucket, key)` pairs and are assumed
/// reliable but network-latent. The local cache wraps any implementation of
/// this trait as a drop-in decorator, so the trait deliberately mirrors the
/// full surface the registry needs, including the operations the cache only
/// passes through.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Fetches the full contents of an object.
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError>;

    /// Fetches a byte range of an object.
    async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, StorageError>;

    /// Fetches an object and writes it to the file at `dest`, replacing it.
    async fn get_object_to_path(
        &self,
        bucket: &str,
        key: &str,
        dest: &Path,
    ) -> Result<(), StorageError>;

    /// Fetches metadata of an object without its contents.
    async fn get_object_info(&self, bucket: &str, key: &str) -> Result<ObjectInfo, StorageError>;

    /// Stores an object, replacing any previous contents wholesale.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        opts: PutOptions,
    ) -> Result<(), StorageError>;

    /// Stores an object from a local file.
    async fn put_object_from_path(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        opts: PutOptions,
    ) -> Result<(), StorageError>;

    /// Deletes an object. Deleting a missing object is not an error.
    async fn remove_object(&self, bucket: &str, key: &str) -> Result<(), StorageError>;

    /// Deletes a bucket. With `force`, also deletes all contained objects.
    async fn remove_bucket(&self, bucket: &str, force: bool) -> Result<(), StorageError>;

    /// Server-side copy of an object. `dest_key` defaults to the source key.
    async fn copy_object(
        &self,
        bucket: &str,
        key: &str,
        dest_bucket: &str,
        dest_key: Option<&str>,
    ) -> Result<(), StorageError>;

    /// Lists objects under an optional prefix.
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        recursive: bool,
    ) -> Result<Vec<ObjectEntry>, StorageError>;

    /// Lists multipart uploads that were started but never completed.
    async fn list_incomplete_uploads(
        &self,
        bucket: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<IncompleteUpload>, StorageError>;

    /// Aborts an incomplete multipart upload.
    async fn remove_incomplete_upload(&self, bucket: &str, key: &str)
        -> Result<(), StorageError>;

    /// Creates a bucket in the given region, if the backend has regions.
    async fn make_bucket(&self, bucket: &str, region: Option<&str>) -> Result<(), StorageError>;

    /// Checks whether a bucket exists.
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError>;

    /// Lists all buckets.
    async fn list_buckets(&self) -> Result<Vec<BucketEntry>, StorageError>;

    /// Returns the access policy document of a bucket.
    async fn get_policy(&self, bucket: &str) -> Result<String, StorageError>;

    /// Replaces the access policy document of a bucket.
    async fn set_policy(&self, bucket: &str, policy: &str) -> Result<(), StorageError>;

    /// Returns coarse information about the backing store.
    async fn storage_info(&self) -> Result<StorageInfo, StorageError>;
}
