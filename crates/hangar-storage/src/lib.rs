//! The remote object-store capability consumed by the hangar registry.
//!
//! This crate defines the [`ObjectStorage`] trait, which is the only surface
//! the caching layer depends on. Any backend that can get/put/delete/copy/list
//! blobs addressed by `(bucket, key)` can implement it. The crate also ships
//! [`FilesystemStorage`], a directory-backed implementation used for local
//! deployments and as the authoritative store in tests.

mod error;
mod filesystem;
mod name;
mod storage;
mod types;

pub use error::StorageError;
pub use filesystem::FilesystemStorage;
pub use name::{validate_bucket_name, validate_object_key};
pub use storage::ObjectStorage;
pub use types::{BucketEntry, IncompleteUpload, ObjectEntry, ObjectInfo, PutOptions, StorageInfo};
