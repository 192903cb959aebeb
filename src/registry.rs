//! Source registry client.
//!
//! The registry is the external store of desired camera sources. It is
//! polled, never pushed, and each fetch returns the full desired set.

use crate::config::RegistryConfig;
use crate::error::RegistryError;
use crate::source::SourceDescriptor;
use std::future::Future;
use std::path::PathBuf;
use tracing::{debug, error, warn};

/// A backing store that can produce the current desired source set.
pub trait SourceRegistry: Send + Sync {
    fn fetch(&self) -> impl Future<Output = Result<Vec<SourceDescriptor>, RegistryError>> + Send;
}

/// Reads a YAML or JSON list of sources from disk on every fetch.
#[derive(Debug, Clone)]
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SourceRegistry for FileRegistry {
    async fn fetch(&self) -> Result<Vec<SourceDescriptor>, RegistryError> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let is_json = self
            .path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        // Only a non-list document fails the fetch. Bad records are skipped.
        if is_json {
            let records: Vec<serde_json::Value> =
                serde_json::from_str(&content).map_err(|e| RegistryError::Parse(e.to_string()))?;
            Ok(keep_valid(
                records,
                |r| r.get("id").map(ToString::to_string),
                |r| serde_json::from_value(r).map_err(|e| e.to_string()),
            ))
        } else {
            let records: Vec<serde_yaml::Value> =
                serde_yaml::from_str(&content).map_err(|e| RegistryError::Parse(e.to_string()))?;
            Ok(keep_valid(
                records,
                |r| {
                    r.get("id")
                        .and_then(|v| serde_yaml::to_string(v).ok())
                        .map(|v| v.trim().to_string())
                },
                |r| serde_yaml::from_value(r).map_err(|e| e.to_string()),
            ))
        }
    }
}

/// Converts records one by one, logging and dropping the ones that fail.
fn keep_valid<V>(
    records: Vec<V>,
    id_of: impl Fn(&V) -> Option<String>,
    convert: impl Fn(V) -> Result<SourceDescriptor, String>,
) -> Vec<SourceDescriptor> {
    let mut sources = Vec::with_capacity(records.len());
    for (index, record) in records.into_iter().enumerate() {
        let id = id_of(&record);
        match convert(record) {
            Ok(source) => sources.push(source),
            Err(e) => match id {
                Some(id) => error!("Skipping registry record with id {}: {}", id, e),
                None => error!("Skipping registry record #{}: {}", index, e),
            },
        }
    }
    sources
}

/// Fixed source list from the service configuration.
#[derive(Debug, Clone)]
pub struct StaticRegistry {
    sources: Vec<SourceDescriptor>,
}

impl StaticRegistry {
    pub fn new(sources: Vec<SourceDescriptor>) -> Self {
        Self { sources }
    }
}

impl SourceRegistry for StaticRegistry {
    async fn fetch(&self) -> Result<Vec<SourceDescriptor>, RegistryError> {
        Ok(self.sources.clone())
    }
}

/// The registry selected by `registry.kind` in the config file.
#[derive(Debug, Clone)]
pub enum ConfiguredRegistry {
    File(FileRegistry),
    Static(StaticRegistry),
}

impl ConfiguredRegistry {
    pub fn from_config(cfg: &RegistryConfig) -> Self {
        match cfg {
            RegistryConfig::File { path } => Self::File(FileRegistry::new(path)),
            RegistryConfig::Static { sources } => Self::Static(StaticRegistry::new(sources.clone())),
        }
    }
}

impl SourceRegistry for ConfiguredRegistry {
    async fn fetch(&self) -> Result<Vec<SourceDescriptor>, RegistryError> {
        match self {
            Self::File(r) => r.fetch().await,
            Self::Static(r) => r.fetch().await,
        }
    }
}

/// Wraps a registry and keeps the last successful snapshot.
///
/// A failed fetch is logged and answered with the previous snapshot, so a
/// registry outage never tears down healthy streams.
pub struct RegistryClient<R> {
    registry: R,
    last_good: Option<Vec<SourceDescriptor>>,
}

impl<R: SourceRegistry> RegistryClient<R> {
    pub fn new(registry: R) -> Self {
        Self {
            registry,
            last_good: None,
        }
    }

    /// Returns `None` only when no fetch has ever succeeded.
    pub async fn list_desired_sources(&mut self) -> Option<Vec<SourceDescriptor>> {
        match self.registry.fetch().await {
            Ok(sources) => {
                debug!("Registry returned {} source(s)", sources.len());
                self.last_good = Some(sources.clone());
                Some(sources)
            }
            Err(e) => {
                match &self.last_good {
                    Some(previous) => warn!(
                        "Registry query failed: {}. Reusing previous snapshot ({} sources).",
                        e,
                        previous.len()
                    ),
                    None => warn!("Registry query failed: {}. No previous snapshot.", e),
                }
                self.last_good.clone()
            }
        }
    }
}
