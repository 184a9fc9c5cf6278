//! Versioned YAML settings file
//!
//! ```yaml
//! version: 1
//! cache:
//!   cache_dir: /var/cache/codegraph
//!   stale_policy: serve_stale
//! analysis:
//!   language: csharp
//! orchestrator:
//!   workspace_root: /srv/workspace
//!   max_concurrent_jobs: 2
//! ```

use codegraph_cache::{AnalysisConfig, CacheConfig};
use codegraph_orchestration::OrchestratorConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const SUPPORTED_VERSIONS: &[u32] = &[1];

/// Language analyzed when neither the settings file nor the command line names one
pub const DEFAULT_LANGUAGE: &str = "csharp";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Missing 'version' field in settings file. Add 'version: 1' to the top of your YAML file.")]
    MissingVersion,

    #[error("Unsupported settings version {found}. Supported versions: {}", SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    UnsupportedVersion { found: u32 },

    #[error("Unknown language '{0}' (no preset; list extensions in the settings file instead)")]
    UnknownLanguage(String),

    #[error("Invalid orchestrator settings: {0}")]
    Orchestrator(#[from] codegraph_orchestration::OrchestratorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type SettingsResult<T> = Result<T, SettingsError>;

/// On-disk schema (v1)
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFileV1 {
    version: Option<u32>,

    #[serde(default)]
    cache: CacheConfig,

    #[serde(default)]
    analysis: Option<AnalysisConfig>,

    #[serde(default)]
    orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Settings {
    pub cache: CacheConfig,
    pub analysis: Option<AnalysisConfig>,
    pub orchestrator: OrchestratorConfig,
}

impl Settings {
    /// Load from `path`, or built-in defaults when no file is given.
    pub fn load(path: Option<&Path>) -> SettingsResult<Self> {
        match path {
            Some(path) => Self::from_yaml_str(&std::fs::read_to_string(path)?),
            None => Ok(Self::default()),
        }
    }

    pub fn from_yaml_str(content: &str) -> SettingsResult<Self> {
        let file: SettingsFileV1 = serde_yaml::from_str(content)?;
        match file.version {
            None => return Err(SettingsError::MissingVersion),
            Some(found) if !SUPPORTED_VERSIONS.contains(&found) => {
                return Err(SettingsError::UnsupportedVersion { found })
            }
            Some(_) => {}
        }
        file.orchestrator.validate()?;

        Ok(Self {
            cache: file.cache,
            analysis: file.analysis,
            orchestrator: file.orchestrator,
        })
    }

    /// Analysis configuration for a command.
    ///
    /// A language given on the command line selects its preset; otherwise the
    /// settings file's `analysis` section, then the default language preset.
    pub fn analysis_for(&self, language: Option<&str>) -> SettingsResult<AnalysisConfig> {
        match (language, &self.analysis) {
            (Some(language), Some(configured)) if configured.language == language => {
                Ok(configured.clone())
            }
            (Some(language), _) => AnalysisConfig::for_language(language)
                .ok_or_else(|| SettingsError::UnknownLanguage(language.to_string())),
            (None, Some(configured)) => Ok(configured.clone()),
            (None, None) => AnalysisConfig::for_language(DEFAULT_LANGUAGE)
                .ok_or_else(|| SettingsError::UnknownLanguage(DEFAULT_LANGUAGE.to_string())),
        }
    }
}
