//! Core types for the module store.

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::StoreError;

/// Content hash (SHA-256) used for both modules and commits.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Compute hash from bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Hash(arr))
    }

    /// Get the first two characters of the hex (for sharding).
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[0..1])
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Hash {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hash::from_hex(s).map_err(|_| StoreError::InvalidHash(s.to_string()))
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::from_hex(&s).map_err(de::Error::custom)
    }
}

/// Hierarchical key a module is stored under, e.g. `["mod", "a"]`.
///
/// The empty path is the root.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ModulePath(Vec<String>);

impl ModulePath {
    /// The root path.
    pub fn root() -> Self {
        ModulePath(Vec::new())
    }

    /// Build a path from segments, validating each one.
    pub fn new<I, S>(segments: I) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        for segment in &segments {
            validate_segment(segment, &segments)?;
        }
        Ok(ModulePath(segments))
    }

    /// Parse the `/`-joined wire form. Leading and trailing slashes are ignored.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        let trimmed = s.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(ModulePath::root());
        }
        let segments: Vec<String> = trimmed.split('/').map(str::to_string).collect();
        for segment in &segments {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(StoreError::InvalidPath(s.to_string()));
            }
        }
        Ok(ModulePath(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `self` equals `prefix` or lies underneath it.
    pub fn starts_with(&self, prefix: &ModulePath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Append one segment.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        ModulePath(segments)
    }

    /// Truncate to the first `len` segments.
    pub fn truncate(&self, len: usize) -> Self {
        ModulePath(self.0.iter().take(len).cloned().collect())
    }
}

fn validate_segment(segment: &str, all: &[String]) -> Result<(), StoreError> {
    if segment.is_empty() || segment == "." || segment == ".." || segment.contains('/') {
        return Err(StoreError::InvalidPath(all.join("/")));
    }
    Ok(())
}

impl fmt::Debug for ModulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModulePath(/{})", self.0.join("/"))
    }
}

impl fmt::Display for ModulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

impl FromStr for ModulePath {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModulePath::parse(s)
    }
}

impl Serialize for ModulePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ModulePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ModulePath::parse(&s).map_err(de::Error::custom)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }

    /// Whole seconds since Unix epoch.
    pub fn as_secs(&self) -> i64 {
        self.0 / 1_000_000
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Commit metadata as reported to clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub hash: Hash,
    pub parents: Vec<Hash>,
    /// Seconds since Unix epoch.
    pub date: i64,
    pub author: String,
    pub message: String,
}

/// Branch metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    /// Current tip commit, `None` until the first snapshot.
    pub tip: Option<Hash>,
    pub created: Timestamp,
}

/// One entry in the history of a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Version {
    pub content: Hash,
    /// Commit that introduced `content`; `None` while it is only staged.
    pub commit: Option<Hash>,
}

/// Result of a merge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A merge commit was created and the target advanced to it.
    Merged(Hash),
    /// The source was already contained in the target.
    UpToDate,
}

/// Result of a garbage collection pass.
#[derive(Clone, Debug, Default)]
pub struct GcStats {
    /// Content entries inspected.
    pub examined: usize,
    /// Content entries deleted.
    pub deleted: usize,
    /// Bytes reclaimed on disk.
    pub bytes_reclaimed: u64,
    pub duration_ms: u64,
}

/// Store statistics.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub module_count: u64,
    pub commit_count: u64,
    pub branch_count: u64,
    pub content_size_bytes: u64,
    pub commit_log_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_roundtrip() {
        let data = b"hello world";
        let hash = Hash::from_bytes(data);
        let hex = hash.to_hex();
        let parsed = Hash::from_hex(&hex).unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn test_hash_shard_prefix() {
        let hash = Hash::from_bytes(b"test");
        let prefix = hash.shard_prefix();
        assert_eq!(prefix.len(), 2);
    }

    #[test]
    fn test_hash_serializes_as_hex() {
        let hash = Hash::from_bytes(b"\0asm");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
        let back: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }

    #[test]
    fn test_invalid_hash_is_malformed() {
        let err = "not-a-hash".parse::<Hash>().unwrap_err();
        assert!(matches!(err, StoreError::InvalidHash(_)));
    }

    #[test]
    fn test_path_parse() {
        let path = ModulePath::parse("/mod/a/").unwrap();
        assert_eq!(path.segments(), &["mod".to_string(), "a".to_string()]);
        assert_eq!(path.to_string(), "mod/a");
        assert!(ModulePath::parse("").unwrap().is_root());
        assert!(ModulePath::parse("/").unwrap().is_root());
    }

    #[test]
    fn test_path_rejects_bad_segments() {
        assert!(ModulePath::parse("a//b").is_err());
        assert!(ModulePath::parse("a/../b").is_err());
        assert!(ModulePath::new(["a", "b/c"]).is_err());
        assert!(ModulePath::new(["", "x"]).is_err());
    }

    #[test]
    fn test_path_prefix() {
        let a = ModulePath::parse("mod/a").unwrap();
        assert!(a.starts_with(&ModulePath::parse("mod").unwrap()));
        assert!(a.starts_with(&ModulePath::root()));
        assert!(!a.starts_with(&ModulePath::parse("mo").unwrap()));
        assert_eq!(a.truncate(1), ModulePath::parse("mod").unwrap());
        assert_eq!(ModulePath::root().child("x").to_string(), "x");
    }
}
