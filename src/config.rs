use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::storage::{FilesystemDriver, InMemoryDriver, StorageDriver, is_valid_segment};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid repository name: {0:?}")]
    InvalidName(String),
    #[error("duplicate repository name: {0}")]
    DuplicateName(String),
    #[error("repository {name}: path must start with '/': {path}")]
    InvalidPath { name: String, path: String },
    #[error("repository {name}: upstream must be an http(s) URL: {upstream}")]
    InvalidUpstream { name: String, upstream: String },
}

/// Addresses of the two listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_http")]
    pub http: String,
    #[serde(default = "default_https")]
    pub https: String,
}

fn default_http() -> String {
    ":8080".to_string()
}

fn default_https() -> String {
    ":8443".to_string()
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            http: default_http(),
            https: default_https(),
        }
    }
}

/// Files holding the root CA. Both may point at the same file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateConfig {
    #[serde(default)]
    pub crt: String,
    #[serde(default)]
    pub key: String,
}

impl CertificateConfig {
    /// Reads the configured files into one PEM blob.
    pub fn read(&self) -> Vec<u8> {
        read_concatenated([self.crt.as_str(), self.key.as_str()])
    }
}

/// Storage backend, keyed by driver name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageConfig {
    Filesystem {
        #[serde(default = "default_root")]
        rootdirectory: PathBuf,
    },
    Inmemory,
}

fn default_root() -> PathBuf {
    PathBuf::from("/var/lib/muzeum")
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Filesystem {
            rootdirectory: default_root(),
        }
    }
}

impl StorageConfig {
    pub fn build(&self) -> Arc<dyn StorageDriver> {
        match self {
            StorageConfig::Filesystem { rootdirectory } => {
                Arc::new(FilesystemDriver::new(rootdirectory))
            }
            StorageConfig::Inmemory => Arc::new(InMemoryDriver::new()),
        }
    }
}

/// One mirrored upstream repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Storage directory for this repository's artifacts.
    pub name: String,
    /// Only requests for this host are routed here. Any host when unset.
    #[serde(default)]
    pub host: Option<String>,
    /// Request path prefix.
    #[serde(default = "default_path")]
    pub path: String,
    /// Base URL the prefix maps to.
    pub upstream: String,
    /// File names that change in place upstream and must be revalidated.
    #[serde(default)]
    pub revalidate: Vec<String>,
}

fn default_path() -> String {
    "/".to_string()
}

/// Gateway configuration file format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub certificate: CertificateConfig,
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub storage: StorageConfig,
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

impl GatewayConfig {
    /// Loads config from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses config from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for repo in &self.repositories {
            if !is_valid_segment(&repo.name) {
                return Err(ConfigError::InvalidName(repo.name.clone()));
            }
            if !names.insert(repo.name.as_str()) {
                return Err(ConfigError::DuplicateName(repo.name.clone()));
            }
            if !repo.path.starts_with('/') {
                return Err(ConfigError::InvalidPath {
                    name: repo.name.clone(),
                    path: repo.path.clone(),
                });
            }
            let upstream = repo.upstream.as_str();
            let scheme_ok = ["http://", "https://"]
                .iter()
                .any(|scheme| upstream.len() > scheme.len() && upstream.starts_with(scheme));
            if !scheme_ok || upstream.parse::<http::Uri>().is_err() {
                return Err(ConfigError::InvalidUpstream {
                    name: repo.name.clone(),
                    upstream: repo.upstream.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Reads and concatenates `paths` after `$VAR`/`${VAR}` expansion. Files
/// that cannot be read are skipped.
pub fn read_concatenated<'a>(paths: impl IntoIterator<Item = &'a str>) -> Vec<u8> {
    let mut buf = Vec::new();
    for path in paths {
        if path.is_empty() {
            continue;
        }
        let expanded = expand_env(path);
        match fs::read(&expanded) {
            Ok(content) => buf.extend_from_slice(&content),
            Err(e) => debug!("skipping {}: {}", expanded, e),
        }
    }
    buf
}

/// Replaces `$VAR` and `${VAR}` with environment values; unset variables
/// expand to nothing.
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(at) = rest.find('$') {
        out.push_str(&rest[..at]);
        rest = &rest[at + 1..];

        let (name, remainder) = if let Some(braced) = rest.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], &braced[end + 1..]),
                None => {
                    out.push_str("${");
                    rest = braced;
                    continue;
                }
            }
        } else {
            let end = rest
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(rest.len());
            (&rest[..end], &rest[end..])
        };

        if name.is_empty() {
            out.push('$');
        } else if let Ok(value) = std::env::var(name) {
            out.push_str(&value);
        }
        rest = remainder;
    }
    out.push_str(rest);
    out
}
