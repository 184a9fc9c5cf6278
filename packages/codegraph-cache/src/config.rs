//! Cache and analysis configuration

use crate::types::ConfigSignature;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Environment override for the cache directory
pub const CACHE_DIR_ENV: &str = "CODEGRAPH_CACHE_DIR";

/// What to analyze: language plus the file set it is fed.
///
/// Extensions are lowercase without the leading dot; both sets are sorted so
/// the resulting [`ConfigSignature`] does not depend on input order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "AnalysisConfigRepr")]
pub struct AnalysisConfig {
    pub language: String,
    pub extensions: BTreeSet<String>,
    pub exclude_dirs: BTreeSet<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AnalysisConfigRepr {
    language: String,
    #[serde(default)]
    extensions: Vec<String>,
    #[serde(default)]
    exclude_dirs: Vec<String>,
}

impl From<AnalysisConfigRepr> for AnalysisConfig {
    fn from(repr: AnalysisConfigRepr) -> Self {
        let config = match Self::for_language(&repr.language) {
            Some(preset) if repr.extensions.is_empty() => preset,
            _ => Self::new(&repr.language, repr.extensions),
        };
        config.with_exclude_dirs(repr.exclude_dirs)
    }
}

impl AnalysisConfig {
    pub fn new<I, S>(language: &str, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            language: language.trim().to_lowercase(),
            extensions: extensions
                .into_iter()
                .map(|ext| normalize_extension(ext.as_ref()))
                .filter(|ext| !ext.is_empty())
                .collect(),
            exclude_dirs: BTreeSet::new(),
        }
    }

    /// Built-in presets; `None` for languages without one.
    pub fn for_language(language: &str) -> Option<Self> {
        let (extensions, excluded): (&[&str], &[&str]) =
            match language.trim().to_lowercase().as_str() {
                "csharp" | "c#" | "cs" => (&["cs"], &["bin", "obj"]),
                "python" => (&["py"], &["__pycache__"]),
                "java" => (&["java"], &["target", "build"]),
                "typescript" => (&["ts", "tsx"], &["node_modules", "dist"]),
                "javascript" => (&["js", "jsx", "mjs"], &["node_modules", "dist"]),
                "rust" => (&["rs"], &["target"]),
                "go" => (&["go"], &["vendor"]),
                _ => return None,
            };
        let canonical = match language.trim().to_lowercase().as_str() {
            "c#" | "cs" => "csharp".to_string(),
            other => other.to_string(),
        };
        Some(
            Self::new(&canonical, extensions.iter().copied())
                .with_exclude_dirs(excluded.iter().copied()),
        )
    }

    pub fn with_exclude_dirs<I, S>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.exclude_dirs.extend(
            dirs.into_iter()
                .map(|dir| dir.as_ref().trim().trim_matches('/').to_string())
                .filter(|dir| !dir.is_empty()),
        );
        self
    }

    pub fn signature(&self) -> ConfigSignature {
        ConfigSignature {
            language: self.language.clone(),
            extensions: self.extensions.iter().cloned().collect(),
            exclude_dirs: self.exclude_dirs.iter().cloned().collect(),
        }
    }

    /// Is this file part of the tracked set (by extension only)?
    pub fn tracks(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extensions.contains(&ext.to_lowercase()))
            .unwrap_or(false)
    }

    pub fn excludes_dir(&self, name: &str) -> bool {
        self.exclude_dirs.contains(name)
    }
}

fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_lowercase()
}

/// What to do when re-analysis fails but an older artifact is still on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalePolicy {
    /// Propagate the analyzer error (default)
    #[default]
    SurfaceError,
    /// Log the failure and return the previous artifact
    ServeStale,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Falls back to [`default_cache_dir`] when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,

    #[serde(default)]
    pub stale_policy: StalePolicy,
}

impl CacheConfig {
    pub fn with_cache_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: Some(dir.into()),
            ..Default::default()
        }
    }

    pub fn resolve_cache_dir(&self) -> PathBuf {
        match &self.cache_dir {
            Some(dir) => dir.clone(),
            None => default_cache_dir(),
        }
    }
}

/// Resolution order:
/// 1) `CODEGRAPH_CACHE_DIR`
/// 2) OS cache dir / codegraph
/// 3) TMPDIR / codegraph-cache
pub fn default_cache_dir() -> PathBuf {
    std::env::var_os(CACHE_DIR_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or_else(|| dirs::cache_dir().map(|dir| dir.join("codegraph")))
        .unwrap_or_else(|| std::env::temp_dir().join("codegraph-cache"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_order_independent() {
        let a = AnalysisConfig::new("csharp", [".CS", "csx"]);
        let b = AnalysisConfig::new("CSharp", ["csx", "cs"]);
        assert_eq!(a.signature(), b.signature());
        assert_eq!(a.signature().to_string(), "csharp[cs,csx]");
    }

    #[test]
    fn test_csharp_preset() {
        let config = AnalysisConfig::for_language("c#").unwrap();
        assert_eq!(config.language, "csharp");
        assert!(config.tracks(Path::new("src/Program.cs")));
        assert!(config.tracks(Path::new("src/LEGACY.CS")));
        assert!(!config.tracks(Path::new("README.md")));
        assert!(config.excludes_dir("obj"));
        assert!(config.excludes_dir("bin"));
    }

    #[test]
    fn test_unknown_language_has_no_preset() {
        assert!(AnalysisConfig::for_language("cobol").is_none());
    }

    #[test]
    fn test_deserialize_uses_preset_when_extensions_missing() {
        let config: AnalysisConfig = serde_json::from_str(r#"{"language": "python"}"#).unwrap();
        assert!(config.extensions.contains("py"));
        assert!(config.excludes_dir("__pycache__"));

        let custom: AnalysisConfig =
            serde_json::from_str(r#"{"language": "python", "extensions": [".pyi"]}"#).unwrap();
        assert_eq!(custom.extensions.len(), 1);
        assert!(custom.extensions.contains("pyi"));
    }

    #[test]
    fn test_cache_config_explicit_dir_wins() {
        let config = CacheConfig::with_cache_dir("/var/cache/codegraph");
        assert_eq!(
            config.resolve_cache_dir(),
            PathBuf::from("/var/cache/codegraph")
        );
        assert_eq!(config.stale_policy, StalePolicy::SurfaceError);
    }

    #[test]
    fn test_stale_policy_serde() {
        let policy: StalePolicy = serde_json::from_str(r#""serve_stale""#).unwrap();
        assert_eq!(policy, StalePolicy::ServeStale);
    }
}
