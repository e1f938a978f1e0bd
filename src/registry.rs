//! Index of update-enabled containers by service name.
//!
//! The index is rebuilt wholesale from a container listing and published by
//! swapping an `Arc`, so a reader holding a snapshot never sees a partially
//! rebuilt mapping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use tokio::sync::RwLock;

use crate::error::RuntimeError;
use crate::runtime::{ContainerRuntime, ContainerSummary};
use crate::types::{labels, ContainerRecord};

fn normalize(name: &str) -> String {
    name.trim().trim_start_matches('/').to_lowercase()
}

/// Immutable name → container mapping.
#[derive(Debug)]
pub struct ServiceRegistry {
    records: Vec<ContainerRecord>,
    by_name: HashMap<String, usize>,
    built_at: SystemTime,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            by_name: HashMap::new(),
            built_at: UNIX_EPOCH,
        }
    }
}

impl ServiceRegistry {
    /// Keeps containers labelled `docker-ci.enable=true` that have an id and
    /// at least one non-empty name.
    ///
    /// A `docker-ci.name` label is indexed ahead of every runtime name.
    pub fn from_containers(containers: Vec<ContainerSummary>) -> Self {
        let built_at = SystemTime::now();
        let mut records = Vec::new();
        let mut by_name = HashMap::new();

        for c in containers {
            let enabled = c.labels.get(labels::ENABLE).map(String::as_str) == Some("true");
            if !enabled || c.id.trim().is_empty() {
                continue;
            }
            let names: Vec<String> = c
                .names
                .into_iter()
                .filter(|n| !normalize(n).is_empty())
                .collect();
            if names.is_empty() {
                continue;
            }

            let hook_name = c
                .labels
                .get(labels::NAME)
                .map(|n| n.trim().trim_start_matches('/').to_string())
                .filter(|n| !n.is_empty());
            records.push(ContainerRecord {
                id: c.id,
                names,
                hook_name,
            });
        }

        for (index, record) in records.iter().enumerate() {
            if let Some(hook_name) = &record.hook_name {
                by_name.entry(normalize(hook_name)).or_insert(index);
            }
        }
        for (index, record) in records.iter().enumerate() {
            for name in &record.names {
                by_name.entry(normalize(name)).or_insert(index);
            }
        }

        Self {
            records,
            by_name,
            built_at,
        }
    }

    /// Case-insensitive lookup; a leading `/` on either side is ignored.
    pub fn lookup(&self, name: &str) -> Option<&ContainerRecord> {
        self.by_name
            .get(&normalize(name))
            .and_then(|&i| self.records.get(i))
    }

    pub fn records(&self) -> &[ContainerRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// When the listing behind this registry was taken.
    pub fn built_at(&self) -> SystemTime {
        self.built_at
    }
}

/// Lists the runtime's containers and builds a fresh registry from them.
pub async fn reload(runtime: &dyn ContainerRuntime) -> Result<ServiceRegistry, RuntimeError> {
    let containers = runtime.list_containers().await?;
    Ok(ServiceRegistry::from_containers(containers))
}

/// Shared, swappable registry snapshot.
pub struct RegistryHandle {
    current: RwLock<Arc<ServiceRegistry>>,
    base_url: String,
}

impl RegistryHandle {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            current: RwLock::new(Arc::new(ServiceRegistry::default())),
            base_url: base_url.into(),
        }
    }

    /// The registry as of now; stays valid across later reloads.
    pub async fn snapshot(&self) -> Arc<ServiceRegistry> {
        Arc::clone(&*self.current.read().await)
    }

    /// Publishes `registry` unless the current one was built later.
    ///
    /// Returns whether the swap happened. Reloads can overlap, and the one
    /// that finishes last is not always the one that listed last.
    pub async fn replace(&self, registry: Arc<ServiceRegistry>) -> bool {
        let mut current = self.current.write().await;
        if registry.built_at < current.built_at {
            return false;
        }
        *current = registry;
        true
    }

    /// Rebuilds the registry off to the side, then swaps it in.
    ///
    /// On error the previous snapshot stays published.
    pub async fn refresh(&self, runtime: &dyn ContainerRuntime) -> Result<usize, RuntimeError> {
        let registry = Arc::new(reload(runtime).await?);
        let count = registry.len();
        let built_at = registry.built_at();

        if !self.replace(Arc::clone(&registry)).await {
            debug!("Discarding registry listed at {:?}, a newer one is published", built_at);
            return Ok(self.snapshot().await.len());
        }

        for record in registry.records() {
            info!(
                "Webhook available at: {}/hooks/{}",
                self.base_url.trim_end_matches('/'),
                record.display_name()
            );
        }
        if registry.is_empty() {
            warn!("No containers labelled {}=true", labels::ENABLE);
        }
        debug!("Published registry listed at {:?}", built_at);
        Ok(count)
    }
}
