use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// A cache parameter, as passed to [`ComputationCache::get`](crate::ComputationCache::get).
///
/// Parameters are opaque to the cache; all that matters is that they render
/// into a stable textual representation for key derivation. The rendering is
/// type-prefixed so that e.g. the string `"256"` and the integer `256` never
/// collide.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Str(s) => write!(f, "str:{s}"),
            ParamValue::Int(i) => write!(f, "int:{i}"),
            ParamValue::Float(x) => write!(f, "float:{x:?}"),
            ParamValue::Bool(b) => write!(f, "bool:{b}"),
            ParamValue::Bytes(b) => {
                f.write_str("bytes:")?;
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for ParamValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for ParamValue {
    fn from(i: i32) -> Self {
        Self::Int(i.into())
    }
}

impl From<u32> for ParamValue {
    fn from(i: u32) -> Self {
        Self::Int(i.into())
    }
}

impl From<f64> for ParamValue {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&[u8]> for ParamValue {
    fn from(b: &[u8]) -> Self {
        Self::Bytes(b.to_vec())
    }
}

/// The key of one memoized computation entry.
///
/// The key is derived from human-readable metadata listing the seed, the
/// category, and every parameter in order. Equality and hashing go through the
/// SHA-256 digest of that metadata, and the digest also forms the entry's
/// on-disk address.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    seed: Arc<str>,
    category: Arc<str>,
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cache_path())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Creates the [`CacheKey`] for a computation under `(seed, category, params)`.
    pub fn for_computation(seed: &str, category: &str, params: &[ParamValue]) -> Self {
        let mut builder = CacheKeyBuilder::new(seed, category);
        for param in params {
            builder.write_param(param).unwrap();
        }
        builder.build()
    }

    /// Returns the human-readable metadata that forms the basis of this key.
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns the relative path for this key inside the computation cache.
    ///
    /// The path is `<seed>/<category>/aa/bbcc...` where `aabbcc...` is the
    /// hex-formatted digest, split after the first byte for directory fan-out.
    pub fn cache_path(&self) -> String {
        let mut path = format!(
            "{}/{}/{:02x}/",
            escape_path_segment(&self.seed),
            escape_path_segment(&self.category),
            self.hash[0],
        );
        for b in &self.hash[1..] {
            path.write_fmt(format_args!("{b:02x}")).unwrap();
        }
        path
    }
}

/// A builder for [`CacheKey`]s.
///
/// The builder implements [`std::fmt::Write`] and accepts human readable, but
/// most importantly **stable**, input. That input is hashed to form the
/// [`CacheKey`] and is serialized alongside the cache file to help debugging.
pub struct CacheKeyBuilder {
    seed: String,
    category: String,
    metadata: String,
}

impl CacheKeyBuilder {
    pub fn new(seed: &str, category: &str) -> Self {
        let metadata = format!("seed: {seed}\ncategory: {category}\n");
        Self {
            seed: seed.into(),
            category: category.into(),
            metadata,
        }
    }

    /// Writes one positional parameter into the key metadata.
    pub fn write_param(&mut self, param: &ParamValue) -> Result<(), fmt::Error> {
        self.metadata.write_fmt(format_args!("param: {param}\n"))
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        let hash = Sha256::digest(&self.metadata);
        let hash = <[u8; 32]>::try_from(hash).expect("sha256 outputs 32 bytes");

        CacheKey {
            seed: self.seed.into(),
            category: self.category.into(),
            metadata: self.metadata.into(),
            hash,
        }
    }
}

impl fmt::Write for CacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}

/// Returns the relative path of an object's cache entry: `<bucket>/<escaped key>`.
///
/// The object key is flattened into a single path segment so that the bucket's
/// cache directory stays flat and externally inspectable.
pub fn object_cache_path(bucket: &str, key: &str) -> String {
    format!("{bucket}/{}", escape_path_segment(key))
}

/// Flattens a string into a single, filesystem-safe path segment.
///
/// Alphanumerics and `-`, `_`, `.` pass through; every other byte is escaped
/// as `%XX`. The escaping is injective (unlike a plain separator replacement)
/// and stable across process restarts, so distinct keys can never collide in
/// the cache and addresses survive restarts.
pub fn escape_path_segment(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => {
                out.push(byte as char)
            }
            _ => out.write_fmt(format_args!("%{byte:02X}")).unwrap(),
        }
    }
    // "." and ".." would escape the cache directory entirely.
    match out.as_str() {
        "." => "%2E".into(),
        ".." => "%2E%2E".into(),
        _ => out,
    }
}
