use crate::StorageError;

/// Validates a bucket name against S3-style constraints.
///
/// Bucket names are used verbatim as directory names by both the filesystem
/// backend and the local cache, so the rules here are also what keeps those
/// paths safe. Unlike S3 there is no minimum length beyond being non-empty;
/// short names like `b1` are common in local deployments.
pub fn validate_bucket_name(bucket: &str) -> Result<(), StorageError> {
    let valid_len = (1..=63).contains(&bucket.len());
    let valid_chars = bucket
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
    let valid_edges = bucket.starts_with(|c: char| c.is_ascii_alphanumeric())
        && bucket.ends_with(|c: char| c.is_ascii_alphanumeric());

    if valid_len && valid_chars && valid_edges && !bucket.contains("..") {
        Ok(())
    } else {
        Err(StorageError::InvalidName(format!("bucket `{bucket}`")))
    }
}

/// Validates an object key.
///
/// Keys may contain `/` separators but must not be empty, absolute, or able to
/// escape their bucket.
pub fn validate_object_key(key: &str) -> Result<(), StorageError> {
    let escapes = key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..");

    if key.is_empty() || key.len() > 1024 || key.starts_with('/') || escapes {
        Err(StorageError::InvalidName(format!("object key `{key}`")))
    } else {
        Ok(())
    }
}
