//! Remote repository addressing and sync requests

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Host assumed for the short `owner/repo` form
pub const DEFAULT_HOST: &str = "gitlab.com";

/// A repository on a remote git host
///
/// `owner` may contain `/` for nested groups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteRepo {
    pub host: String,
    pub owner: String,
    pub name: String,
}

impl RemoteRepo {
    /// Accepts:
    /// - `https://host/owner/repo(.git)`
    /// - `git@host:owner/repo(.git)`
    /// - `owner/repo` (on [`DEFAULT_HOST`])
    pub fn parse(input: &str) -> SyncResult<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(SyncError::invalid_request("repository URL is empty"));
        }

        let (host, path) = if let Some(rest) = input.strip_prefix("git@") {
            let (host, path) = rest.split_once(':').ok_or_else(|| {
                SyncError::invalid_request(format!("invalid SSH repository URL: {}", input))
            })?;
            (host.to_string(), path.to_string())
        } else if input.contains("://") {
            let url = Url::parse(input).map_err(|e| {
                SyncError::invalid_request(format!("invalid repository URL {}: {}", input, e))
            })?;
            let host = url.host_str().ok_or_else(|| {
                SyncError::invalid_request(format!("repository URL has no host: {}", input))
            })?;
            let host = match url.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            };
            (host, url.path().to_string())
        } else {
            (DEFAULT_HOST.to_string(), input.to_string())
        };

        let path = path.trim_matches('/');
        let path = path.strip_suffix(".git").unwrap_or(path);
        let segments: Vec<&str> = path.split('/').collect();
        let valid = !host.is_empty()
            && segments.len() >= 2
            && segments
                .iter()
                .all(|s| !s.is_empty() && *s != "." && *s != ".." && !s.contains(char::is_whitespace));
        if !valid {
            return Err(SyncError::invalid_request(format!(
                "cannot parse repository URL: {}",
                input
            )));
        }

        let (name, owner) = segments
            .split_last()
            .map(|(name, owner)| (name.to_string(), owner.join("/")))
            .ok_or_else(|| SyncError::invalid_request(format!("cannot parse repository URL: {}", input)))?;

        Ok(Self { host, owner, name })
    }

    /// Flat identifier: `host_owner_repo`
    pub fn uri(&self) -> String {
        format!("{}_{}_{}", self.host, self.owner.replace('/', "_"), self.name)
    }

    pub fn clone_url(&self) -> String {
        format!("https://{}/{}/{}.git", self.host, self.owner, self.name)
    }

    /// HTTPS clone URL carrying `oauth2:<token>` userinfo (percent-encoded).
    pub fn authenticated_url(&self, credentials: &Credentials) -> SyncResult<Url> {
        let mut url = Url::parse(&self.clone_url()).map_err(|e| {
            SyncError::invalid_request(format!("invalid clone URL for {}: {}", self, e))
        })?;
        url.set_username("oauth2")
            .and_then(|_| url.set_password(Some(&credentials.token)))
            .map_err(|_| SyncError::invalid_request(format!("cannot embed credentials for {}", self)))?;
        Ok(url)
    }
}

impl fmt::Display for RemoteRepo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.host, self.owner, self.name)
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub token: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            token: token.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("token", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    /// Delete any existing checkout and clone from scratch
    pub force_clean: bool,
    /// Always pull, ignoring the update interval
    pub sync_enabled: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            force_clean: false,
            sync_enabled: true,
        }
    }
}

/// Everything a sync needs: where from, as whom, which branch, how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub remote: RemoteRepo,
    pub credentials: Credentials,
    pub branch: String,
    pub options: SyncOptions,
}

impl SyncRequest {
    pub const DEFAULT_BRANCH: &'static str = "main";

    pub fn new(repo_url: &str, credentials: Credentials) -> SyncResult<Self> {
        Ok(Self {
            remote: RemoteRepo::parse(repo_url)?,
            credentials,
            branch: Self::DEFAULT_BRANCH.to_string(),
            options: SyncOptions::default(),
        })
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    /// Default subject identity: one active sync per user and repository.
    pub fn subject(&self) -> String {
        format!("{}/{}", self.credentials.username, self.remote.uri())
    }

    pub fn validate(&self) -> SyncResult<()> {
        let username = self.credentials.username.trim();
        if username.is_empty() {
            return Err(SyncError::invalid_request("username is empty"));
        }
        if !is_path_component(username) {
            return Err(SyncError::invalid_request(format!(
                "username is not a valid directory name: {}",
                username
            )));
        }
        if self.credentials.token.trim().is_empty() {
            return Err(SyncError::invalid_request("access token is empty"));
        }
        if !is_path_component(&self.remote.name) {
            return Err(SyncError::invalid_request(format!(
                "repository name is not a valid directory name: {}",
                self.remote.name
            )));
        }
        // Branch names reach git's argv
        let branch = self.branch.trim();
        if branch.is_empty() || branch.starts_with('-') || branch.contains(char::is_whitespace) {
            return Err(SyncError::invalid_request(format!(
                "invalid branch name: {:?}",
                self.branch
            )));
        }
        Ok(())
    }
}

fn is_path_component(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\'])
}
