use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use taskloom_core::{Error, Result, SemanticVersion};
use taskloom_registry::{cosine_similarity, Embedder};

use crate::plan::MasteryPlan;

/// A stored workflow definition plus bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MasteryEntry {
    pub plan: MasteryPlan,
    pub registered_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// Versioned catalog of workflow plans, same shape as the resolver registry.
/// Plans are validated (DAG structure) at registration time.
pub struct MasteryRegistry {
    inner: RwLock<HashMap<String, BTreeMap<SemanticVersion, MasteryEntry>>>,
    embedder: Option<Arc<dyn Embedder>>,
    persist_dir: Option<PathBuf>,
}

impl MasteryRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            embedder: None,
            persist_dir: None,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_persist_dir(mut self, dir: PathBuf) -> Self {
        self.persist_dir = Some(dir);
        self
    }

    pub async fn register(&self, plan: MasteryPlan) -> Result<()> {
        plan.validate()?;
        let name = plan.name.clone();
        let version = plan.version;

        let embedding = match &self.embedder {
            Some(embedder) => match embedder.embed(&plan.description).await {
                Ok(vector) => Some(vector),
                Err(e) => {
                    warn!(mastery = %name, error = %e, "Embedding failed for plan description");
                    None
                }
            },
            None => None,
        };

        let entry = MasteryEntry {
            plan,
            registered_at: Utc::now(),
            embedding,
        };

        let mut inner = self.inner.write().await;
        let versions = inner.entry(name.clone()).or_default();
        if versions.contains_key(&version) {
            return Err(Error::State(format!(
                "mastery {}@{} is already registered",
                name, version
            )));
        }
        self.write_persisted(&entry);
        versions.insert(version, entry);
        info!(mastery = %name, version = %version, "Registered mastery plan");
        Ok(())
    }

    /// Remove a plan; the next-highest version becomes latest in the same
    /// write.
    pub async fn unregister(&self, name: &str, version: &SemanticVersion) -> Result<()> {
        let mut inner = self.inner.write().await;
        let versions = inner
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("mastery {}", name)))?;
        let removed = versions
            .remove(version)
            .ok_or_else(|| Error::NotFound(format!("mastery {}@{}", name, version)))?;
        if versions.is_empty() {
            inner.remove(name);
        }
        drop(inner);
        self.remove_persisted(&removed);
        info!(mastery = %name, version = %version, "Unregistered mastery plan");
        Ok(())
    }

    pub async fn get(&self, name: &str, version: Option<&SemanticVersion>) -> Result<MasteryEntry> {
        let inner = self.inner.read().await;
        let versions = inner
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("mastery {}", name)))?;
        let entry = match version {
            Some(v) => versions.get(v),
            None => versions.values().next_back(),
        };
        entry
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("mastery {}@{:?}", name, version)))
    }

    pub async fn names(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut names: Vec<String> = inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn versions(&self, name: &str) -> Vec<SemanticVersion> {
        let inner = self.inner.read().await;
        inner
            .get(name)
            .map(|v| v.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Most similar stored plans to a description. Same scoring rules as the
    /// resolver registry: cosine similarity with an embedder, substring
    /// fallback without one.
    pub async fn semantic_search(&self, query: &str, k: usize) -> Result<Vec<(MasteryEntry, f32)>> {
        let query_vector = match &self.embedder {
            Some(embedder) => Some(embedder.embed(query).await?),
            None => None,
        };

        let inner = self.inner.read().await;
        let mut scored: Vec<(MasteryEntry, f32)> = Vec::new();
        for versions in inner.values() {
            for entry in versions.values() {
                let score = match (&query_vector, &entry.embedding) {
                    (Some(q), Some(e)) => cosine_similarity(q, e),
                    _ => {
                        let description = entry.plan.description.to_lowercase();
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
                .then(a.plan.name.cmp(&b.plan.name))
                .then(b.plan.version.cmp(&a.plan.version))
        });
        scored.truncate(k);
        Ok(scored)
    }

    /// Load every persisted plan from the configured directory. Unreadable
    /// files are skipped with a warning.
    pub async fn load_persisted(&self) -> Result<usize> {
        let Some(dir) = &self.persist_dir else {
            return Ok(0);
        };
        if !dir.exists() {
            return Ok(0);
        }
        let mut loaded = 0;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<MasteryEntry>(&content) {
                Ok(stored) => {
                    let name = stored.plan.name.clone();
                    let version = stored.plan.version;
                    let mut inner = self.inner.write().await;
                    inner
                        .entry(name)
                        .or_default()
                        .entry(version)
                        .or_insert(stored);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Skipping unreadable mastery file");
                }
            }
        }
        Ok(loaded)
    }

    fn write_persisted(&self, entry: &MasteryEntry) {
        let Some(dir) = &self.persist_dir else {
            return;
        };
        let path = dir.join(format!("{}@{}.json", entry.plan.name, entry.plan.version));
        let write = std::fs::create_dir_all(dir).and_then(|_| {
            let content = serde_json::to_string_pretty(entry)?;
            std::fs::write(&path, content)
        });
        if let Err(e) = write {
            warn!(mastery = %entry.plan.name, error = %e, "Failed to persist mastery plan");
        }
    }

    fn remove_persisted(&self, entry: &MasteryEntry) {
        if let Some(dir) = &self.persist_dir {
            let path = dir.join(format!("{}@{}.json", entry.plan.name, entry.plan.version));
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Default for MasteryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Step;
    use taskloom_registry::ResolverSelector;

    fn v(s: &str) -> SemanticVersion {
        s.parse().unwrap()
    }

    fn plan(name: &str, version: &str, description: &str) -> MasteryPlan {
        MasteryPlan::new(name, v(version))
            .with_description(description)
            .with_step(Step::new("only", ResolverSelector::capability("noop")))
    }

    #[tokio::test]
    async fn register_get_latest_and_unregister() {
        let registry = MasteryRegistry::new();
        registry.register(plan("etl", "1.0.0", "extract")).await.unwrap();
        registry.register(plan("etl", "2.0.0", "extract v2")).await.unwrap();

        let latest = registry.get("etl", None).await.unwrap();
        assert_eq!(latest.plan.version, v("2.0.0"));

        registry.unregister("etl", &v("2.0.0")).await.unwrap();
        let latest = registry.get("etl", None).await.unwrap();
        assert_eq!(latest.plan.version, v("1.0.0"));
    }

    #[tokio::test]
    async fn duplicate_and_invalid_plans_rejected() {
        let registry = MasteryRegistry::new();
        registry.register(plan("p", "1.0.0", "d")).await.unwrap();
        assert!(matches!(
            registry.register(plan("p", "1.0.0", "d")).await,
            Err(Error::State(_))
        ));

        let cyclic = MasteryPlan::new("bad", v("1.0.0"))
            .with_step(Step::new("a", ResolverSelector::capability("x")).depends("b"))
            .with_step(Step::new("b", ResolverSelector::capability("y")).depends("a"));
        assert!(matches!(
            registry.register(cyclic).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn substring_search_matches_description() {
        let registry = MasteryRegistry::new();
        registry
            .register(plan("report", "1.0.0", "build a weekly sales report"))
            .await
            .unwrap();
        registry
            .register(plan("ingest", "1.0.0", "ingest raw events"))
            .await
            .unwrap();
        let hits = registry.semantic_search("weekly sales", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.plan.name, "report");
    }

    #[tokio::test]
    async fn persistence_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = MasteryRegistry::new().with_persist_dir(dir.path().to_path_buf());
        registry.register(plan("etl", "1.0.0", "extract")).await.unwrap();

        let fresh = MasteryRegistry::new().with_persist_dir(dir.path().to_path_buf());
        let loaded = fresh.load_persisted().await.unwrap();
        assert_eq!(loaded, 1);
        let entry = fresh.get("etl", None).await.unwrap();
        assert_eq!(entry.plan.name, "etl");

        fresh.unregister("etl", &v("1.0.0")).await.unwrap();
        assert!(!dir.path().join("etl@1.0.0.json").exists());
    }
}
