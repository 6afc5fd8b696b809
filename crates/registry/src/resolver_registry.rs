use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use taskloom_core::{Error, Result, SemanticVersion, TaskContext};
use taskloom_resolver::{HealthReport, Resolver};

use crate::embedding::{cosine_similarity, Embedder};
use crate::entry::{PersistedEntry, RegistryEntry};

/// Version constraint of a selector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VersionConstraint {
    Exact(SemanticVersion),
    /// Highest version sharing the major component.
    Caret(SemanticVersion),
    Latest,
}

/// How a workflow step picks its resolver: by name plus a version
/// constraint, or by capability (latest match wins).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "by")]
pub enum ResolverSelector {
    Name {
        name: String,
        constraint: VersionConstraint,
    },
    Capability {
        capability: String,
    },
}

impl ResolverSelector {
    pub fn latest(name: impl Into<String>) -> Self {
        ResolverSelector::Name {
            name: name.into(),
            constraint: VersionConstraint::Latest,
        }
    }

    pub fn capability(capability: impl Into<String>) -> Self {
        ResolverSelector::Capability {
            capability: capability.into(),
        }
    }
}

/// Aggregated outcome of a health roll-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRollup {
    pub checked: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub reports: Vec<EntryHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryHealth {
    pub name: String,
    pub version: SemanticVersion,
    pub report: HealthReport,
}

#[derive(Default)]
struct Indexes {
    /// tag → entry identities
    tags: HashMap<String, Vec<(String, SemanticVersion)>>,
    /// capability → entry identities
    capabilities: HashMap<String, Vec<(String, SemanticVersion)>>,
}

#[derive(Default)]
struct Inner {
    /// name → versions, ordered; latest is the last key of the map.
    entries: HashMap<String, BTreeMap<SemanticVersion, RegistryEntry>>,
    indexes: Indexes,
}

impl Inner {
    fn get(&self, name: &str, version: &SemanticVersion) -> Option<&RegistryEntry> {
        self.entries.get(name).and_then(|v| v.get(version))
    }

    fn get_mut(&mut self, name: &str, version: &SemanticVersion) -> Option<&mut RegistryEntry> {
        self.entries.get_mut(name).and_then(|v| v.get_mut(version))
    }

    fn latest(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries
            .get(name)
            .and_then(|versions| versions.values().next_back())
    }

    fn insert(&mut self, entry: RegistryEntry) {
        let identity = (entry.name().to_string(), entry.version());
        for tag in &entry.metadata.tags {
            self.indexes
                .tags
                .entry(tag.clone())
                .or_default()
                .push(identity.clone());
        }
        for capability in &entry.metadata.capabilities {
            self.indexes
                .capabilities
                .entry(capability.clone())
                .or_default()
                .push(identity.clone());
        }
        self.entries
            .entry(identity.0)
            .or_default()
            .insert(identity.1, entry);
    }

    fn remove(&mut self, name: &str, version: &SemanticVersion) -> Option<RegistryEntry> {
        let versions = self.entries.get_mut(name)?;
        let removed = versions.remove(version)?;
        if versions.is_empty() {
            self.entries.remove(name);
        }
        let identity = (name.to_string(), *version);
        for bucket in self.indexes.tags.values_mut() {
            bucket.retain(|id| id != &identity);
        }
        for bucket in self.indexes.capabilities.values_mut() {
            bucket.retain(|id| id != &identity);
        }
        self.indexes.tags.retain(|_, b| !b.is_empty());
        self.indexes.capabilities.retain(|_, b| !b.is_empty());
        Some(removed)
    }
}

/// Versioned catalog of resolvers with tag, capability and semantic lookup.
/// Writers serialize behind the lock; readers clone snapshots and never
/// block writes for long.
pub struct TaskResolverRegistry {
    inner: RwLock<Inner>,
    embedder: Option<Arc<dyn Embedder>>,
    persist_dir: Option<PathBuf>,
}

impl TaskResolverRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            embedder: None,
            persist_dir: None,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Persist entry bookkeeping as one JSON file per `(name, version)`
    /// under the given directory.
    pub fn with_persist_dir(mut self, dir: PathBuf) -> Self {
        self.persist_dir = Some(dir);
        self
    }

    /// Register a resolver. Rejects a duplicate `(name, version)`. When an
    /// embedder is configured the description is embedded; when a persisted
    /// file for this identity exists its bookkeeping (degraded flag, last
    /// evolution time) is restored.
    pub async fn register(&self, resolver: Arc<dyn Resolver>) -> Result<()> {
        let mut entry = RegistryEntry::new(resolver);
        let name = entry.name().to_string();
        let version = entry.version();

        {
            let inner = self.inner.read().await;
            if inner.get(&name, &version).is_some() {
                return Err(Error::State(format!(
                    "resolver {}@{} is already registered",
                    name, version
                )));
            }
        }

        if let Some(embedder) = &self.embedder {
            match embedder.embed(&entry.metadata.description).await {
                Ok(vector) => entry.embedding = Some(vector),
                Err(e) => {
                    warn!(resolver = %name, error = %e, "Embedding failed, entry stays searchable by substring");
                }
            }
        }

        if let Some(persisted) = self.read_persisted(&name, &version) {
            entry.registered_at = persisted.registered_at;
            entry.last_evolved_at = persisted.last_evolved_at;
            entry.degraded = persisted.degraded;
            if entry.embedding.is_none() {
                entry.embedding = persisted.embedding;
            }
        }

        let mut inner = self.inner.write().await;
        // Re-check under the write lock; a racing register may have won.
        if inner.get(&name, &version).is_some() {
            return Err(Error::State(format!(
                "resolver {}@{} is already registered",
                name, version
            )));
        }
        self.write_persisted(&entry);
        let is_latest = inner
            .latest(&name)
            .map(|e| version > e.version())
            .unwrap_or(true);
        inner.insert(entry);
        info!(resolver = %name, version = %version, latest = is_latest, "Registered resolver");
        Ok(())
    }

    /// Remove an entry. If it was the latest version for its name, the
    /// next-highest version becomes latest as part of the same write.
    pub async fn unregister(&self, name: &str, version: &SemanticVersion) -> Result<()> {
        let mut inner = self.inner.write().await;
        let removed = inner
            .remove(name, version)
            .ok_or_else(|| Error::NotFound(format!("resolver {}@{}", name, version)))?;
        drop(inner);
        self.remove_persisted(&removed);
        info!(resolver = %name, version = %version, "Unregistered resolver");
        Ok(())
    }

    /// Get the named entry; an absent version means latest.
    pub async fn get(&self, name: &str, version: Option<&SemanticVersion>) -> Result<RegistryEntry> {
        let inner = self.inner.read().await;
        let entry = match version {
            Some(v) => inner.get(name, v),
            None => inner.latest(name),
        };
        entry.cloned().ok_or_else(|| match version {
            Some(v) => Error::NotFound(format!("resolver {}@{}", name, v)),
            None => Error::NotFound(format!("resolver {}", name)),
        })
    }

    /// All versions of a name, ascending.
    pub async fn versions(&self, name: &str) -> Vec<SemanticVersion> {
        let inner = self.inner.read().await;
        inner
            .entries
            .get(name)
            .map(|v| v.keys().copied().collect())
            .unwrap_or_default()
    }

    pub async fn names(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut names: Vec<String> = inner.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn all_entries(&self) -> Vec<RegistryEntry> {
        let inner = self.inner.read().await;
        let mut entries: Vec<RegistryEntry> = inner
            .entries
            .values()
            .flat_map(|v| v.values().cloned())
            .collect();
        entries.sort_by(|a, b| {
            a.name()
                .cmp(b.name())
                .then(b.version().cmp(&a.version()))
        });
        entries
    }

    /// Entries providing a capability, ordered degraded-last, then depth
    /// ascending, then version descending.
    pub async fn find_by_capability(&self, capability: &str) -> Vec<RegistryEntry> {
        let inner = self.inner.read().await;
        let mut hits: Vec<RegistryEntry> = inner
            .indexes
            .capabilities
            .get(capability)
            .map(|ids| {
                ids.iter()
                    .filter_map(|(name, version)| inner.get(name, version).cloned())
                    .collect()
            })
            .unwrap_or_default();
        sort_discovery(&mut hits);
        hits
    }

    pub async fn find_by_tag(&self, tag: &str) -> Vec<RegistryEntry> {
        let inner = self.inner.read().await;
        let mut hits: Vec<RegistryEntry> = inner
            .indexes
            .tags
            .get(tag)
            .map(|ids| {
                ids.iter()
                    .filter_map(|(name, version)| inner.get(name, version).cloned())
                    .collect()
            })
            .unwrap_or_default();
        sort_discovery(&mut hits);
        hits
    }

    /// The k most similar entries to the query. With an embedder: cosine
    /// similarity over stored vectors. Without one: case-insensitive
    /// substring match on descriptions. Degraded entries order after
    /// non-degraded alternatives at equal relevance.
    pub async fn semantic_search(&self, query: &str, k: usize) -> Result<Vec<(RegistryEntry, f32)>> {
        let query_vector = match &self.embedder {
            Some(embedder) => Some(embedder.embed(query).await?),
            None => None,
        };

        let inner = self.inner.read().await;
        let mut scored: Vec<(RegistryEntry, f32)> = Vec::new();
        for versions in inner.entries.values() {
            for entry in versions.values() {
                let score = match (&query_vector, &entry.embedding) {
                    (Some(q), Some(e)) => cosine_similarity(q, e),
                    _ => {
                        // Substring fallback
                        let description = entry.metadata.description.to_lowercase();
                        if description.contains(&query.to_lowercase()) {
                            1.0
                        } else {
                            continue;
                        }
                    }
                };
                scored.push((entry.clone(), score));
            }
        }
        drop(inner);

        scored.sort_by(|(a, sa), (b, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.degraded.cmp(&b.degraded))
                .then(a.name().cmp(b.name()))
                .then(b.version().cmp(&a.version()))
        });
        scored.truncate(k);
        Ok(scored)
    }

    /// Probe every entry concurrently, each under its own timeout. Probe
    /// failures become unhealthy reports; nothing propagates.
    pub async fn health_rollup(&self, ctx: &TaskContext, per_entry_timeout: Duration) -> HealthRollup {
        let entries = self.all_entries().await;
        let probes = entries.iter().map(|entry| {
            let probe_ctx = ctx.child_with_timeout(per_entry_timeout);
            let resolver = entry.resolver.clone();
            let name = entry.name().to_string();
            let version = entry.version();
            async move {
                let report =
                    match tokio::time::timeout(per_entry_timeout, resolver.health_check(&probe_ctx))
                        .await
                    {
                        Ok(report) => report,
                        Err(_) => HealthReport::unhealthy(format!(
                            "health check timed out after {:?}",
                            per_entry_timeout
                        )),
                    };
                EntryHealth {
                    name,
                    version,
                    report,
                }
            }
        });
        let reports: Vec<EntryHealth> = futures::future::join_all(probes).await;

        {
            let mut inner = self.inner.write().await;
            for entry_health in &reports {
                if let Some(entry) = inner.get_mut(&entry_health.name, &entry_health.version) {
                    entry.last_health = Some(entry_health.report.clone());
                }
            }
        }
        self.persist_all().await;

        let healthy = reports.iter().filter(|r| r.report.healthy).count();
        HealthRollup {
            checked: reports.len(),
            healthy,
            unhealthy: reports.len() - healthy,
            reports,
        }
    }

    pub async fn mark_degraded(&self, name: &str, version: &SemanticVersion) -> Result<()> {
        self.set_degraded(name, version, true).await
    }

    pub async fn clear_degraded(&self, name: &str, version: &SemanticVersion) -> Result<()> {
        self.set_degraded(name, version, false).await
    }

    async fn set_degraded(&self, name: &str, version: &SemanticVersion, degraded: bool) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .get_mut(name, version)
            .ok_or_else(|| Error::NotFound(format!("resolver {}@{}", name, version)))?;
        entry.degraded = degraded;
        let snapshot = entry.clone();
        drop(inner);
        self.write_persisted(&snapshot);
        debug!(resolver = %name, version = %version, degraded, "Updated degraded flag");
        Ok(())
    }

    pub async fn set_last_evolved(
        &self,
        name: &str,
        version: &SemanticVersion,
        when: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .get_mut(name, version)
            .ok_or_else(|| Error::NotFound(format!("resolver {}@{}", name, version)))?;
        entry.last_evolved_at = Some(when);
        let snapshot = entry.clone();
        drop(inner);
        self.write_persisted(&snapshot);
        Ok(())
    }

    /// Resolve a selector against the current catalog.
    pub async fn resolve_selector(&self, selector: &ResolverSelector) -> Result<RegistryEntry> {
        match selector {
            ResolverSelector::Name { name, constraint } => match constraint {
                VersionConstraint::Exact(version) => self.get(name, Some(version)).await,
                VersionConstraint::Latest => self.get(name, None).await,
                VersionConstraint::Caret(base) => {
                    let inner = self.inner.read().await;
                    inner
                        .entries
                        .get(name)
                        .and_then(|versions| {
                            versions
                                .iter()
                                .rev()
                                .find(|(v, _)| base.caret_matches(v))
                                .map(|(_, entry)| entry.clone())
                        })
                        .ok_or_else(|| {
                            Error::NotFound(format!("resolver {} matching ^{}", name, base))
                        })
                }
            },
            ResolverSelector::Capability { capability } => self
                .find_by_capability(capability)
                .await
                .into_iter()
                .next()
                .ok_or_else(|| {
                    Error::NotFound(format!("no resolver with capability '{}'", capability))
                }),
        }
    }

    fn read_persisted(&self, name: &str, version: &SemanticVersion) -> Option<PersistedEntry> {
        let dir = self.persist_dir.as_ref()?;
        let path = dir.join(format!("{}@{}.json", name, version));
        let content = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&content) {
            Ok(persisted) => Some(persisted),
            Err(e) => {
                warn!(resolver = %name, version = %version, error = %e, "Discarding unreadable persisted entry");
                None
            }
        }
    }

    fn write_persisted(&self, entry: &RegistryEntry) {
        let Some(dir) = &self.persist_dir else {
            return;
        };
        let persisted = PersistedEntry::from(entry);
        let path = dir.join(format!("{}@{}.json", entry.name(), entry.version()));
        let write = std::fs::create_dir_all(dir).and_then(|_| {
            let content = serde_json::to_string_pretty(&persisted)?;
            std::fs::write(&path, content)
        });
        if let Err(e) = write {
            warn!(resolver = %entry.name(), error = %e, "Failed to persist registry entry");
        }
    }

    fn remove_persisted(&self, entry: &RegistryEntry) {
        if let Some(dir) = &self.persist_dir {
            let path = dir.join(format!("{}@{}.json", entry.name(), entry.version()));
            let _ = std::fs::remove_file(path);
        }
    }

    async fn persist_all(&self) {
        if self.persist_dir.is_none() {
            return;
        }
        for entry in self.all_entries().await {
            self.write_persisted(&entry);
        }
    }
}

impl Default for TaskResolverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Discovery ordering: degraded entries last, then shallower first, then
/// newer first, then name for stability.
fn sort_discovery(entries: &mut [RegistryEntry]) {
    entries.sort_by(|a, b| {
        a.degraded
            .cmp(&b.degraded)
            .then(a.metadata.depth.cmp(&b.metadata.depth))
            .then(b.version().cmp(&a.version()))
            .then(a.name().cmp(b.name()))
    });
}
