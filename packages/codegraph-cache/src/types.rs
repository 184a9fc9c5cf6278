//! Core types for the artifact cache

use blake3::Hash as Blake3Hash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Content hash (Blake3)
///
/// Blake3 provides:
/// - SIMD acceleration (AVX2/AVX-512 on x86_64)
/// - Cryptographically secure (collision resistance)
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct ContentHash(pub Blake3Hash);

impl ContentHash {
    /// Compute hash from raw content
    pub fn compute(content: &[u8]) -> Self {
        Self(blake3::hash(content))
    }

    pub fn new(hash: Blake3Hash) -> Self {
        Self(hash)
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    pub fn from_hex(hex: &str) -> Result<Self, blake3::HexError> {
        Ok(Self(blake3::Hash::from_hex(hex)?))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_hex())
    }
}

// Blake3Hash doesn't implement serde, store as hex
impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let hex_str = String::deserialize(deserializer)?;
        Self::from_hex(&hex_str).map_err(serde::de::Error::custom)
    }
}

/// Length-prefixed write so that adjacent fields can never run together.
pub(crate) fn update_str(hasher: &mut blake3::Hasher, value: &str) {
    hasher.update(&(value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

/// Canonical, order-independent form of an analysis configuration.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConfigSignature {
    pub language: String,
    /// Sorted, lowercase, without leading dot
    pub extensions: Vec<String>,
    /// Sorted directory names skipped during the walk
    #[serde(default)]
    pub exclude_dirs: Vec<String>,
}

impl ConfigSignature {
    pub(crate) fn hash_into(&self, hasher: &mut blake3::Hasher) {
        update_str(hasher, &self.language);
        hasher.update(&(self.extensions.len() as u64).to_le_bytes());
        for ext in &self.extensions {
            update_str(hasher, ext);
        }
        hasher.update(&(self.exclude_dirs.len() as u64).to_le_bytes());
        for dir in &self.exclude_dirs {
            update_str(hasher, dir);
        }
    }
}

impl fmt::Display for ConfigSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.language, self.extensions.join(","))
    }
}

/// Cache key: "this project under this configuration", independent of content.
///
/// Hex-encoded Blake3 of the normalized project root and the config signature,
/// so it is also a safe file name.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn derive(project_identity: &str, signature: &ConfigSignature) -> Self {
        let mut hasher = blake3::Hasher::new();
        update_str(&mut hasher, project_identity);
        signature.hash_into(&mut hasher);
        Self(hasher.finalize().to_hex().to_string())
    }

    /// Accepts only keys produced by [`CacheKey::derive`] (64 lowercase hex chars).
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = raw.len() == 64
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a project's analyzable state.
///
/// Equality only looks at `combined`, which covers every path, every content
/// hash and the configuration signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Relative path (`/`-separated) → content hash
    pub files: BTreeMap<String, ContentHash>,
    pub config: ConfigSignature,
    pub combined: ContentHash,
}

impl Fingerprint {
    const DOMAIN: &'static str = "codegraph-fingerprint-v1";

    pub fn new(files: BTreeMap<String, ContentHash>, config: ConfigSignature) -> Self {
        let combined = Self::combine(&files, &config);
        Self {
            files,
            config,
            combined,
        }
    }

    fn combine(files: &BTreeMap<String, ContentHash>, config: &ConfigSignature) -> ContentHash {
        let mut hasher = blake3::Hasher::new();
        update_str(&mut hasher, Self::DOMAIN);
        config.hash_into(&mut hasher);
        hasher.update(&(files.len() as u64).to_le_bytes());
        for (path, hash) in files {
            update_str(&mut hasher, path);
            hasher.update(hash.as_bytes());
        }
        ContentHash::new(hasher.finalize())
    }

    /// Recompute `combined` from the parts (detects a tampered or truncated record).
    pub fn verify(&self) -> bool {
        Self::combine(&self.files, &self.config) == self.combined
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// What changed going from `self` (stored) to `newer` (current).
    pub fn diff(&self, newer: &Fingerprint) -> FingerprintDiff {
        let mut diff = FingerprintDiff {
            config_changed: self.config != newer.config,
            ..Default::default()
        };

        for (path, hash) in &newer.files {
            match self.files.get(path) {
                None => diff.added.push(path.clone()),
                Some(old) if old != hash => diff.modified.push(path.clone()),
                Some(_) => {}
            }
        }
        diff.removed = self
            .files
            .keys()
            .filter(|path| !newer.files.contains_key(*path))
            .cloned()
            .collect();

        diff
    }
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.combined == other.combined
    }
}

impl Eq for Fingerprint {}

/// Per-path breakdown of a fingerprint change, used for logging stale reasons.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FingerprintDiff {
    pub config_changed: bool,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

impl FingerprintDiff {
    pub fn is_empty(&self) -> bool {
        !self.config_changed
            && self.added.is_empty()
            && self.removed.is_empty()
            && self.modified.is_empty()
    }

    pub fn summary(&self) -> String {
        if self.config_changed {
            return "analysis configuration changed".to_string();
        }
        let mut parts = Vec::new();
        if !self.added.is_empty() {
            parts.push(format!("{} added", self.added.len()));
        }
        if !self.removed.is_empty() {
            parts.push(format!("{} removed", self.removed.len()));
        }
        if !self.modified.is_empty() {
            parts.push(format!("{} modified", self.modified.len()));
        }
        if parts.is_empty() {
            "unchanged".to_string()
        } else {
            parts.join(", ")
        }
    }
}
