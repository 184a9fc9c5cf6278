//! Cache manager: fingerprint-validated get-or-compute with per-key single-flight

use crate::config::{AnalysisConfig, CacheConfig, StalePolicy};
use crate::fingerprint::FingerprintComputer;
use crate::metrics::CacheMetrics;
use crate::store::{ArtifactStore, CacheEntry, CacheStats};
use crate::types::{CacheKey, Fingerprint};
use crate::{AnalysisFailure, CacheError, CacheResult};
use dashmap::DashMap;
use parking_lot::Mutex;
use prometheus::Registry;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// External analyzer seam.
///
/// Must be deterministic for a fixed (content, config) pair; the cache is only
/// sound under that assumption.
pub trait Analyzer {
    type Artifact: Serialize + DeserializeOwned;
    type Error: Into<AnalysisFailure>;

    fn analyze(&self, root: &Path, config: &AnalysisConfig)
        -> Result<Self::Artifact, Self::Error>;
}

/// Where a returned artifact came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    /// Stored fingerprint matched, analyzer not invoked
    Hit,
    /// Analyzer ran and the result was published
    Computed,
    /// Analyzer failed, previous artifact served under [`StalePolicy::ServeStale`]
    Stale,
}

#[derive(Debug, Clone)]
pub struct Cached<A> {
    pub value: A,
    pub source: CacheSource,
    /// Fingerprint the value was computed from (older than the tree when `Stale`)
    pub fingerprint: Fingerprint,
}

impl<A> Cached<A> {
    pub fn into_inner(self) -> A {
        self.value
    }

    pub fn is_hit(&self) -> bool {
        self.source == CacheSource::Hit
    }
}

type KeyLocks = DashMap<CacheKey, Arc<Mutex<()>>>;

/// Per-key lock slot, removed from the table by the last holder.
struct InFlight<'a> {
    locks: &'a KeyLocks,
    key: CacheKey,
    lock: Arc<Mutex<()>>,
}

impl<'a> InFlight<'a> {
    fn acquire(locks: &'a KeyLocks, key: &CacheKey) -> Self {
        let lock = locks.entry(key.clone()).or_default().clone();
        Self {
            locks,
            key: key.clone(),
            lock,
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        // table + this slot; anyone else still waiting keeps the entry alive
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 2);
    }
}

/// Decides hit vs. miss and mediates between caller, fingerprints, store and
/// analyzer.
///
/// Concurrent lookups for the same key are serialized: the first caller
/// computes and publishes, the others wake up to a hit. Lookups for different
/// keys never wait on each other.
pub struct CacheManager {
    store: Arc<ArtifactStore>,
    fingerprints: FingerprintComputer,
    policy: StalePolicy,
    inflight: KeyLocks,
    metrics: Option<CacheMetrics>,
}

impl CacheManager {
    pub fn new(store: ArtifactStore) -> Self {
        Self::with_store(Arc::new(store))
    }

    pub fn with_store(store: Arc<ArtifactStore>) -> Self {
        Self {
            store,
            fingerprints: FingerprintComputer::default(),
            policy: StalePolicy::default(),
            inflight: DashMap::new(),
            metrics: None,
        }
    }

    /// Open the configured cache directory and apply its stale policy.
    pub fn from_config(config: &CacheConfig) -> CacheResult<Self> {
        let store = ArtifactStore::open(config.resolve_cache_dir())?;
        Ok(Self::new(store).with_policy(config.stale_policy))
    }

    pub fn with_policy(mut self, policy: StalePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_fingerprint_computer(mut self, fingerprints: FingerprintComputer) -> Self {
        self.fingerprints = fingerprints;
        self
    }

    /// Register cache counters on `registry`.
    pub fn with_registry(mut self, registry: &Registry) -> CacheResult<Self> {
        self.metrics = Some(CacheMetrics::new(registry)?);
        Ok(self)
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub fn metrics(&self) -> Option<&CacheMetrics> {
        self.metrics.as_ref()
    }

    pub fn policy(&self) -> StalePolicy {
        self.policy
    }

    /// Cache key for `root` under `config`; fails if the root does not exist.
    pub fn key_for(&self, root: &Path, config: &AnalysisConfig) -> CacheResult<CacheKey> {
        let project = FingerprintComputer::resolve_root(root)?;
        Ok(CacheKey::derive(
            &project.to_string_lossy(),
            &config.signature(),
        ))
    }

    /// Return the cached artifact for `root` if its fingerprint still matches,
    /// otherwise run `compute` and publish the result.
    ///
    /// A failed `compute` never touches the stored entry.
    pub fn get_or_compute<A, E, F>(
        &self,
        root: &Path,
        config: &AnalysisConfig,
        compute: F,
    ) -> CacheResult<Cached<A>>
    where
        A: Serialize + DeserializeOwned,
        E: Into<AnalysisFailure>,
        F: FnOnce() -> Result<A, E>,
    {
        let project = FingerprintComputer::resolve_root(root)?;
        let identity = project.to_string_lossy().into_owned();
        let key = CacheKey::derive(&identity, &config.signature());

        let slot = InFlight::acquire(&self.inflight, &key);
        let _held = slot.lock.lock();

        // Computed under the lock: a waiter must see the tree as it is now
        let current = self.fingerprints.compute(&project, config)?;

        match self.store.fingerprint(&key) {
            Some(stored) if stored == current => {
                if let Some(entry) = self.load::<A>(&key)? {
                    if entry.fingerprint == current {
                        debug!("Cache hit for {} ({})", identity, key);
                        self.record(|m| m.hits.inc());
                        return Ok(Cached {
                            value: entry.artifact,
                            source: CacheSource::Hit,
                            fingerprint: entry.fingerprint,
                        });
                    }
                }
                info!("Cache miss for {}: stored entry unreadable", identity);
                self.record(|m| m.misses.inc());
            }
            Some(stored) => {
                info!(
                    "Cache stale for {}: {}",
                    identity,
                    stored.diff(&current).summary()
                );
                self.record(|m| m.stale.inc());
            }
            None => {
                info!("Cache miss for {}: no entry", identity);
                self.record(|m| m.misses.inc());
            }
        }

        match compute() {
            Ok(artifact) => {
                let entry = CacheEntry::new(key, identity, current, artifact);
                self.store.put(&entry)?;
                self.record(|m| m.writes.inc());
                Ok(Cached {
                    value: entry.artifact,
                    source: CacheSource::Computed,
                    fingerprint: entry.fingerprint,
                })
            }
            Err(e) => {
                let err = CacheError::analysis(e);
                self.record(|m| m.analyzer_failures.inc());
                if self.policy == StalePolicy::ServeStale {
                    if let Some(entry) = self.load::<A>(&key)? {
                        warn!(
                            "Analysis of {} failed ({}), serving previous artifact",
                            entry.project, err
                        );
                        self.record(|m| m.stale_served.inc());
                        return Ok(Cached {
                            value: entry.artifact,
                            source: CacheSource::Stale,
                            fingerprint: entry.fingerprint,
                        });
                    }
                }
                warn!("Analysis of {} failed: {}", project.display(), err);
                Err(err)
            }
        }
    }

    /// [`get_or_compute`](Self::get_or_compute) driven by an [`Analyzer`].
    pub fn analyze<Z>(
        &self,
        root: &Path,
        config: &AnalysisConfig,
        analyzer: &Z,
    ) -> CacheResult<Cached<Z::Artifact>>
    where
        Z: Analyzer,
    {
        let project = FingerprintComputer::resolve_root(root)?;
        self.get_or_compute(&project, config, || analyzer.analyze(&project, config))
    }

    /// Has the project changed since the last stored analysis?
    ///
    /// Compares against the manifest only, the payload is not read.
    pub fn is_stale(&self, root: &Path, config: &AnalysisConfig) -> CacheResult<bool> {
        let key = self.key_for(root, config)?;
        let current = self.fingerprints.compute(root, config)?;

        match self.store.fingerprint(&key) {
            None => {
                info!("{} is stale: no entry", root.display());
                Ok(true)
            }
            Some(stored) if stored == current => Ok(false),
            Some(stored) => {
                info!(
                    "{} is stale: {}",
                    root.display(),
                    stored.diff(&current).summary()
                );
                Ok(true)
            }
        }
    }

    pub fn invalidate(&self, root: &Path, config: &AnalysisConfig) -> CacheResult<bool> {
        let key = self.key_for(root, config)?;
        self.store.invalidate(&key)
    }

    pub fn invalidate_all(&self) -> CacheResult<usize> {
        self.store.invalidate_all()
    }

    pub fn stats(&self) -> CacheStats {
        self.store.stats()
    }

    /// Unreadable payloads count as a miss; the next publish replaces them.
    fn load<A: DeserializeOwned>(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry<A>>> {
        match self.store.get::<A>(key) {
            Ok(entry) => Ok(entry),
            Err(e @ (CacheError::Corrupted(_) | CacheError::VersionMismatch { .. })) => {
                warn!("Ignoring unreadable cache entry {}: {}", key, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn record(&self, f: impl FnOnce(&CacheMetrics)) {
        if let Some(metrics) = &self.metrics {
            f(metrics);
        }
    }
}
