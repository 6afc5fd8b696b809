use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use taskloom_core::SemanticVersion;
use taskloom_resolver::{HealthReport, Resolver, ResolverMetadata};

/// A catalog entry: live resolver plus bookkeeping. Identity is
/// `(metadata.name, metadata.version)`.
#[derive(Clone)]
pub struct RegistryEntry {
    pub metadata: ResolverMetadata,
    pub resolver: Arc<dyn Resolver>,
    pub registered_at: DateTime<Utc>,
    pub last_evolved_at: Option<DateTime<Utc>>,
    pub last_health: Option<HealthReport>,
    pub embedding: Option<Vec<f32>>,
    /// Circuit-breaker flag: still callable, deprioritized in discovery.
    pub degraded: bool,
}

impl RegistryEntry {
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self {
            metadata: resolver.metadata(),
            resolver,
            registered_at: Utc::now(),
            last_evolved_at: None,
            last_health: None,
            embedding: None,
            degraded: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn version(&self) -> SemanticVersion {
        self.metadata.version
    }
}

impl std::fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("name", &self.metadata.name)
            .field("version", &self.metadata.version)
            .field("degraded", &self.degraded)
            .finish()
    }
}

/// On-disk form of an entry: everything except the live resolver object,
/// which is re-attached by the embedding process at registration time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedEntry {
    pub metadata: ResolverMetadata,
    pub registered_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_evolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health: Option<HealthReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub degraded: bool,
}

impl From<&RegistryEntry> for PersistedEntry {
    fn from(entry: &RegistryEntry) -> Self {
        Self {
            metadata: entry.metadata.clone(),
            registered_at: entry.registered_at,
            last_evolved_at: entry.last_evolved_at,
            last_health: entry.last_health.clone(),
            embedding: entry.embedding.clone(),
            degraded: entry.degraded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use taskloom_core::{Task, TaskContext};

    struct Noop;

    #[async_trait]
    impl Resolver for Noop {
        fn metadata(&self) -> ResolverMetadata {
            ResolverMetadata::new("noop", SemanticVersion::new(1, 0, 0))
        }

        async fn resolve(&self, _ctx: &TaskContext, task: Task) -> Task {
            task
        }
    }

    #[test]
    fn persisted_entry_round_trip() {
        let mut entry = RegistryEntry::new(Arc::new(Noop));
        entry.degraded = true;
        entry.embedding = Some(vec![0.1, 0.2]);
        let persisted = PersistedEntry::from(&entry);
        let raw = serde_json::to_string_pretty(&persisted).unwrap();
        let back: PersistedEntry = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, persisted);
        assert!(back.degraded);
        assert_eq!(back.metadata.name, "noop");
    }
}
