//! Fingerprint-validated artifact cache for code graph analysis
//!
//! - **FingerprintComputer**: Blake3 digest per tracked file + combined digest
//!   over paths, contents and the analysis configuration
//! - **ArtifactStore**: durable key → artifact mapping (JSON payloads + manifest,
//!   temp-file-then-rename publish)
//! - **CacheManager**: get-or-compute with per-key single-flight, so the
//!   external analyzer runs at most once per key at a time
//!
//! ```no_run
//! use codegraph_cache::{AnalysisConfig, ArtifactStore, CacheManager};
//! use std::path::Path;
//!
//! let cache = CacheManager::new(ArtifactStore::open("/tmp/codegraph")?);
//! let config = AnalysisConfig::for_language("csharp").unwrap();
//! let graph = cache.get_or_compute(Path::new("./MyApp"), &config, || {
//!     Ok::<_, std::io::Error>(vec!["MyApp.Program".to_string()])
//! })?;
//! println!("{} ({:?})", graph.value.len(), graph.source);
//! # Ok::<(), codegraph_cache::CacheError>(())
//! ```

mod error;
mod fingerprint;
mod manager;
mod metrics;
mod store;
mod types;

pub mod config;

pub use error::*;
pub use fingerprint::FingerprintComputer;
pub use manager::{Analyzer, CacheManager, CacheSource, Cached};
pub use metrics::CacheMetrics;
pub use store::{ArtifactStore, CacheEntry, CacheStats, EntryStats, ManifestRecord};
pub use types::*;

pub use config::{default_cache_dir, AnalysisConfig, CacheConfig, StalePolicy, CACHE_DIR_ENV};
