//! Artifact store: persistent storage with atomic publish
//!
//! Layout:
//! - Payloads: `{cache_dir}/data/{key}.json` (one unit per key, embeds its fingerprint)
//! - Manifest: `{cache_dir}/manifest.json` (key → fingerprint, for cheap staleness checks)
//!
//! Both are written to a temp file in the same directory and renamed into
//! place, so a reader sees either the old or the new version, never a partial
//! write.

use crate::types::{CacheKey, Fingerprint};
use crate::{CacheError, CacheResult};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One stored artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<A> {
    pub key: CacheKey,
    /// Normalized project root the artifact was computed from
    pub project: String,
    pub fingerprint: Fingerprint,
    pub artifact: A,
    pub created_at: DateTime<Utc>,
}

impl<A> CacheEntry<A> {
    pub fn new(key: CacheKey, project: String, fingerprint: Fingerprint, artifact: A) -> Self {
        Self {
            key,
            project,
            fingerprint,
            artifact,
            created_at: Utc::now(),
        }
    }
}

/// Manifest record (everything except the artifact itself)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub project: String,
    pub fingerprint: Fingerprint,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    entries: BTreeMap<CacheKey, ManifestRecord>,
}

impl Manifest {
    fn empty() -> Self {
        Self {
            version: ArtifactStore::VERSION,
            entries: BTreeMap::new(),
        }
    }
}

#[derive(Serialize)]
struct PayloadRef<'a, A> {
    version: u32,
    entry: &'a CacheEntry<A>,
}

#[derive(Deserialize)]
struct Payload<A> {
    version: u32,
    entry: CacheEntry<A>,
}

/// Per-key metadata reported by [`ArtifactStore::stats`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryStats {
    pub key: CacheKey,
    pub project: String,
    pub language: String,
    pub file_count: usize,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Read-only snapshot for observability tooling
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entry_count: usize,
    pub total_size_bytes: u64,
    pub cache_dir: PathBuf,
    pub entries: Vec<EntryStats>,
}

impl CacheStats {
    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.iter().map(|e| e.key.clone()).collect()
    }
}

/// Durable key → artifact mapping
///
/// The manifest is the only shared mutable state; it is guarded by a single
/// lock and every publish (rename + manifest update) happens under that lock.
pub struct ArtifactStore {
    root: PathBuf,
    data_dir: PathBuf,
    manifest_path: PathBuf,
    manifest: RwLock<Manifest>,
}

impl ArtifactStore {
    const VERSION: u32 = 1;

    /// Open (or create) a store rooted at `dir` and load its manifest.
    pub fn open(dir: impl Into<PathBuf>) -> CacheResult<Self> {
        let root = dir.into();
        let data_dir = root.join("data");
        fs::create_dir_all(&data_dir).map_err(|e| CacheError::io(&data_dir, e))?;

        let manifest_path = root.join("manifest.json");
        let manifest = Self::load_manifest(&manifest_path)?;
        sweep_temp_files(&root);
        sweep_temp_files(&data_dir);

        info!(
            "Opened artifact store at {} ({} entries)",
            root.display(),
            manifest.entries.len()
        );

        Ok(Self {
            root,
            data_dir,
            manifest_path,
            manifest: RwLock::new(manifest),
        })
    }

    fn load_manifest(path: &Path) -> CacheResult<Manifest> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Manifest::empty()),
            Err(e) => return Err(CacheError::io(path, e)),
        };

        match serde_json::from_slice::<Manifest>(&bytes) {
            Ok(manifest) if manifest.version == Self::VERSION => Ok(manifest),
            Ok(manifest) => {
                warn!(
                    "Manifest version {} (expected {}), starting with an empty cache",
                    manifest.version,
                    Self::VERSION
                );
                Ok(Manifest::empty())
            }
            Err(e) => {
                warn!(
                    "Unreadable manifest {}: {}, starting with an empty cache",
                    path.display(),
                    e
                );
                Ok(Manifest::empty())
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.manifest.read().entries.contains_key(key)
    }

    /// Stored fingerprint for `key`, without reading the payload.
    pub fn fingerprint(&self, key: &CacheKey) -> Option<Fingerprint> {
        self.manifest
            .read()
            .entries
            .get(key)
            .map(|record| record.fingerprint.clone())
    }

    pub fn get<A>(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry<A>>>
    where
        A: DeserializeOwned,
    {
        if !self.contains(key) {
            return Ok(None);
        }

        let path = self.payload_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Payload missing for {}, dropping manifest record", key);
                self.drop_orphan_record(key)?;
                return Ok(None);
            }
            Err(e) => return Err(CacheError::io(&path, e)),
        };

        let payload: Payload<A> = serde_json::from_slice(&bytes)
            .map_err(|e| CacheError::Corrupted(format!("{}: {}", key, e)))?;

        if payload.version != Self::VERSION {
            return Err(CacheError::VersionMismatch {
                found: payload.version,
                expected: Self::VERSION,
            });
        }
        if payload.entry.key != *key {
            return Err(CacheError::Corrupted(format!(
                "{}: payload belongs to {}",
                key, payload.entry.key
            )));
        }
        if !payload.entry.fingerprint.verify() {
            return Err(CacheError::Corrupted(format!(
                "{}: fingerprint does not match its parts",
                key
            )));
        }

        Ok(Some(payload.entry))
    }

    /// Publish `entry` under `entry.key`, replacing any previous entry.
    pub fn put<A>(&self, entry: &CacheEntry<A>) -> CacheResult<()>
    where
        A: Serialize,
    {
        let bytes = serde_json::to_vec(&PayloadRef {
            version: Self::VERSION,
            entry,
        })
        .map_err(|e| CacheError::Serialization(e.to_string()))?;

        // Slow part (write + fsync) happens outside the lock
        let staged = stage(&self.data_dir, &bytes)?;
        let target = self.payload_path(&entry.key);

        let mut manifest = self.manifest.write();
        if let Err(e) = fs::rename(&staged, &target) {
            let _ = fs::remove_file(&staged);
            return Err(CacheError::io(&target, e));
        }

        let record = ManifestRecord {
            project: entry.project.clone(),
            fingerprint: entry.fingerprint.clone(),
            size_bytes: bytes.len() as u64,
            created_at: entry.created_at,
        };
        let previous = manifest.entries.insert(entry.key.clone(), record);
        if let Err(e) = self.persist_manifest(&manifest) {
            match previous {
                Some(record) => manifest.entries.insert(entry.key.clone(), record),
                None => manifest.entries.remove(&entry.key),
            };
            return Err(e);
        }

        debug!("Stored {} ({} bytes)", entry.key, bytes.len());
        Ok(())
    }

    /// Remove manifest record and payload. Unknown keys are a no-op.
    pub fn invalidate(&self, key: &CacheKey) -> CacheResult<bool> {
        let mut manifest = self.manifest.write();
        let Some(record) = manifest.entries.remove(key) else {
            return Ok(false);
        };

        let path = self.payload_path(key);
        if let Err(e) = remove_if_exists(&path) {
            manifest.entries.insert(key.clone(), record);
            return Err(e);
        }
        self.persist_manifest(&manifest)?;

        info!("Invalidated {} ({})", key, record.project);
        Ok(true)
    }

    /// Remove every entry; returns how many were dropped.
    pub fn invalidate_all(&self) -> CacheResult<usize> {
        let mut manifest = self.manifest.write();
        let count = manifest.entries.len();

        if self.data_dir.exists() {
            fs::remove_dir_all(&self.data_dir).map_err(|e| CacheError::io(&self.data_dir, e))?;
        }
        fs::create_dir_all(&self.data_dir).map_err(|e| CacheError::io(&self.data_dir, e))?;

        manifest.entries.clear();
        self.persist_manifest(&manifest)?;

        info!("Cleared artifact store ({} entries)", count);
        Ok(count)
    }

    pub fn stats(&self) -> CacheStats {
        let manifest = self.manifest.read();
        let entries: Vec<EntryStats> = manifest
            .entries
            .iter()
            .map(|(key, record)| EntryStats {
                key: key.clone(),
                project: record.project.clone(),
                language: record.fingerprint.config.language.clone(),
                file_count: record.fingerprint.file_count(),
                size_bytes: record.size_bytes,
                created_at: record.created_at,
            })
            .collect();

        CacheStats {
            entry_count: entries.len(),
            total_size_bytes: entries.iter().map(|e| e.size_bytes).sum(),
            cache_dir: self.root.clone(),
            entries,
        }
    }

    /// Flush the manifest and release the store.
    pub fn close(self) -> CacheResult<()> {
        let manifest = self.manifest.read();
        self.persist_manifest(&manifest)
    }

    fn drop_orphan_record(&self, key: &CacheKey) -> CacheResult<()> {
        let mut manifest = self.manifest.write();
        // A concurrent put may have republished the key meanwhile
        if self.payload_path(key).exists() || manifest.entries.remove(key).is_none() {
            return Ok(());
        }
        self.persist_manifest(&manifest)
    }

    fn persist_manifest(&self, manifest: &Manifest) -> CacheResult<()> {
        let bytes = serde_json::to_vec_pretty(manifest)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        let staged = stage(&self.root, &bytes)?;
        fs::rename(&staged, &self.manifest_path).map_err(|e| {
            let _ = fs::remove_file(&staged);
            CacheError::io(&self.manifest_path, e)
        })
    }

    fn payload_path(&self, key: &CacheKey) -> PathBuf {
        self.data_dir.join(format!("{}.json", key))
    }
}

/// Write `bytes` to a fresh temp file in `dir` and fsync it.
fn stage(dir: &Path, bytes: &[u8]) -> CacheResult<PathBuf> {
    let tmp_path = dir.join(format!(".{}.tmp", Uuid::new_v4().simple()));
    let result = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&tmp_path)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        });

    match result {
        Ok(()) => Ok(tmp_path),
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            Err(CacheError::io(&tmp_path, e))
        }
    }
}

fn remove_if_exists(path: &Path) -> CacheResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CacheError::io(path, e)),
    }
}

/// Leftovers from writes interrupted by a crash.
fn sweep_temp_files(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("tmp") {
            debug!("Removing stale temp file {}", path.display());
            let _ = fs::remove_file(&path);
        }
    }
}
