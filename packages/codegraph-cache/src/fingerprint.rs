//! Project fingerprinting with Blake3 SIMD hashing

use crate::config::AnalysisConfig;
use crate::types::{ContentHash, Fingerprint};
use crate::{CacheError, CacheResult};
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

impl ContentHash {
    /// Compute from file path (read + hash)
    pub fn from_file(path: impl AsRef<Path>) -> CacheResult<Self> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|e| CacheError::io(path, e))?;
        let mut hasher = blake3::Hasher::new();

        // Read file in chunks and update hasher
        let mut buffer = [0u8; 8192];
        loop {
            let n = file.read(&mut buffer).map_err(|e| CacheError::io(path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(Self(hasher.finalize()))
    }
}

/// Walks a project tree and hashes every tracked file.
///
/// Read-only and stateless, so it is safe to run concurrently for the same or
/// different projects. Any unreadable tracked file fails the whole pass: a
/// partial fingerprint could produce a false cache hit.
#[derive(Debug, Clone, Copy)]
pub struct FingerprintComputer {
    /// Skip dot-directories (`.git`, `.vs`, ...)
    pub skip_hidden_dirs: bool,
}

impl Default for FingerprintComputer {
    fn default() -> Self {
        Self {
            skip_hidden_dirs: true,
        }
    }
}

impl FingerprintComputer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical absolute form of a project root, used as its identity.
    pub fn resolve_root(root: &Path) -> CacheResult<PathBuf> {
        match fs::canonicalize(root) {
            Ok(path) => Ok(path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(CacheError::NotFound(root.to_path_buf()))
            }
            Err(e) => Err(CacheError::io(root, e)),
        }
    }

    pub fn compute(&self, root: &Path, config: &AnalysisConfig) -> CacheResult<Fingerprint> {
        let root = Self::resolve_root(root)?;
        let metadata = fs::metadata(&root).map_err(|e| CacheError::io(&root, e))?;
        if !metadata.is_dir() {
            return Err(CacheError::io(
                &root,
                io::Error::new(io::ErrorKind::Other, "project root is not a directory"),
            ));
        }

        let mut files = BTreeMap::new();
        let walker = WalkDir::new(&root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !self.is_skipped_dir(entry, config));

        for entry in walker {
            let entry = entry.map_err(|e| walk_error(&root, e))?;
            if !is_tracked_file(&entry) || !config.tracks(entry.path()) {
                continue;
            }
            let relative = relative_key(&root, entry.path());
            let hash = ContentHash::from_file(entry.path())?;
            files.insert(relative, hash);
        }

        let fingerprint = Fingerprint::new(files, config.signature());
        debug!(
            "Fingerprinted {} ({} files, {}): {}",
            root.display(),
            fingerprint.file_count(),
            fingerprint.config,
            fingerprint.combined
        );
        Ok(fingerprint)
    }

    fn is_skipped_dir(&self, entry: &DirEntry, config: &AnalysisConfig) -> bool {
        if !entry.file_type().is_dir() {
            return false;
        }
        let name = entry.file_name().to_string_lossy();
        (self.skip_hidden_dirs && name.starts_with('.')) || config.excludes_dir(&name)
    }
}

/// Regular files, and symlinks that resolve to one (hashed through the link).
/// Directory symlinks are never descended into.
fn is_tracked_file(entry: &DirEntry) -> bool {
    let file_type = entry.file_type();
    file_type.is_file() || (file_type.is_symlink() && entry.path().is_file())
}

/// `/`-separated path relative to the root, stable across platforms.
///
/// Non-UTF-8 components keep their raw bytes as a `\0`-prefixed hex suffix,
/// so two names that only differ in undecodable bytes stay distinct keys. A
/// real file name can never contain NUL.
fn relative_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| component_key(c.as_os_str()))
        .collect::<Vec<_>>()
        .join("/")
}

fn component_key(name: &OsStr) -> String {
    match name.to_str() {
        Some(name) => name.to_string(),
        None => {
            let raw: String = name
                .as_encoded_bytes()
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect();
            format!("{}\0{}", name.to_string_lossy(), raw)
        }
    }
}

fn walk_error(root: &Path, err: walkdir::Error) -> CacheError {
    let path = err.path().unwrap_or(root).to_path_buf();
    let source = err
        .into_io_error()
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "filesystem loop detected"));
    CacheError::io(path, source)
}
