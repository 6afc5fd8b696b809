use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use taskloom_core::config::EvolverConfig;
use taskloom_core::{Result, SemanticVersion, TaskContext};
use taskloom_registry::TaskResolverRegistry;
use taskloom_resolver::{BaselineReport, Resolver, ResolverMetadata};

use crate::window::{FailureRecord, FailureWindow};

/// Capability name a generator resolver is registered under. The in-process
/// generator also implements [`ResolverGenerator`], since a live resolver
/// object has to cross the boundary.
pub const EVOLVE_CAPABILITY: &str = "evolve_resolver";

/// Produces a candidate replacement for a chronically failing resolver.
#[async_trait]
pub trait ResolverGenerator: Send + Sync {
    async fn generate(
        &self,
        ctx: &TaskContext,
        incumbent: &ResolverMetadata,
        failures: &[FailureRecord],
    ) -> Result<Arc<dyn Resolver>>;
}

/// Where evolution lifecycle events land (the monitoring subsystem opens
/// alerts from these).
#[async_trait]
pub trait EvolverSink: Send + Sync {
    async fn evolution_succeeded(
        &self,
        resolver: &str,
        old_version: &SemanticVersion,
        new_version: &SemanticVersion,
    );
    async fn evolution_rejected(&self, resolver: &str, version: &SemanticVersion, reason: &str);
    async fn human_intervention_requested(
        &self,
        resolver: &str,
        version: &SemanticVersion,
        message: &str,
    );
}

/// Outcome of one evolution check.
#[derive(Debug, Clone, PartialEq)]
pub enum EvolutionOutcome {
    /// Conditions not met; the reason says which gate held it back.
    NotEligible(String),
    Evolved {
        old_version: SemanticVersion,
        new_version: SemanticVersion,
    },
    Rejected(String),
    /// Retry budget exhausted; halted until an operator clears the flag.
    Halted,
}

/// Per-resolver bookkeeping, persisted under `evolver/<name>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResolverState {
    window: FailureWindow,
    last_evolved_at: Option<DateTime<Utc>>,
    next_eligible_at: Option<DateTime<Utc>>,
    rejected_since_success: u32,
    halted: bool,
}

impl ResolverState {
    fn new(window_size: usize) -> Self {
        Self {
            window: FailureWindow::new(window_size),
            last_evolved_at: None,
            next_eligible_at: None,
            rejected_since_success: 0,
            halted: false,
        }
    }
}

/// Watches resolver failure rates and replaces chronically failing resolvers
/// with verified candidates. At most one evolution runs per resolver name at
/// any time; verification requires the candidate to pass a superset of the
/// incumbent's passing baseline tests.
pub struct Evolver {
    registry: Arc<TaskResolverRegistry>,
    config: EvolverConfig,
    generator: Option<Arc<dyn ResolverGenerator>>,
    sink: Option<Arc<dyn EvolverSink>>,
    persist_dir: Option<PathBuf>,
    /// name → state behind its own lock; the outer map lock is held only to
    /// look up or create the inner handle.
    states: Mutex<HashMap<String, Arc<Mutex<ResolverState>>>>,
}

impl Evolver {
    pub fn new(registry: Arc<TaskResolverRegistry>, config: EvolverConfig) -> Self {
        Self {
            registry,
            config,
            generator: None,
            sink: None,
            persist_dir: None,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn ResolverGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EvolverSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_persist_dir(mut self, dir: PathBuf) -> Self {
        self.persist_dir = Some(dir);
        self
    }

    /// Record a failed task for a resolver. Records for names no longer in
    /// the registry are discarded.
    pub async fn record_failure(&self, record: FailureRecord) {
        if self.registry.get(&record.resolver_name, None).await.is_err() {
            debug!(resolver = %record.resolver_name, "Discarding orphaned failure record");
            return;
        }
        let handle = self.state_handle(&record.resolver_name).await;
        let mut state = handle.lock().await;
        let name = record.resolver_name.clone();
        state.window.push(record);
        self.persist(&name, &state);
    }

    /// Number of failures currently windowed for a resolver.
    pub async fn failure_count(&self, name: &str) -> usize {
        let handle = self.state_handle(name).await;
        let state = handle.lock().await;
        state.window.len()
    }

    /// Run the evolution flow for a resolver if every eligibility gate
    /// passes. Holding the per-name lock for the whole flow guarantees at
    /// most one concurrent evolution per name.
    pub async fn maybe_evolve(&self, ctx: &TaskContext, name: &str) -> Result<EvolutionOutcome> {
        let handle = self.state_handle(name).await;
        let mut state = match handle.try_lock() {
            Ok(state) => state,
            Err(_) => {
                return Ok(EvolutionOutcome::NotEligible(format!(
                    "evolution of '{}' already in progress",
                    name
                )));
            }
        };

        let entry = match self.registry.get(name, None).await {
            Ok(entry) => entry,
            Err(_) => {
                // Orphaned by unregister: drop the window.
                state.window.clear();
                self.persist(name, &state);
                return Ok(EvolutionOutcome::NotEligible(format!(
                    "resolver '{}' is not registered",
                    name
                )));
            }
        };
        let incumbent = entry.metadata.clone();
        let version = incumbent.version;

        if state.halted {
            return Ok(EvolutionOutcome::NotEligible(format!(
                "evolution of '{}' is halted pending operator intervention",
                name
            )));
        }

        let failures = state.window.count_for(&version) as u32;
        if failures < incumbent.evolution_threshold_failures {
            return Ok(EvolutionOutcome::NotEligible(format!(
                "{} of {} failures",
                failures, incumbent.evolution_threshold_failures
            )));
        }

        let now = Utc::now();
        let min_interval = ChronoDuration::seconds(incumbent.min_evolution_interval_secs as i64);
        let last_evolved = entry.last_evolved_at.or(state.last_evolved_at);
        if let Some(last) = last_evolved {
            if now - last < min_interval {
                return Ok(EvolutionOutcome::NotEligible(format!(
                    "last evolution at {} is within the minimum interval",
                    last
                )));
            }
        }
        if let Some(next) = state.next_eligible_at {
            if now < next {
                return Ok(EvolutionOutcome::NotEligible(format!(
                    "not eligible again until {}",
                    next
                )));
            }
        }

        let Some(generator) = self.generator.clone() else {
            return Ok(EvolutionOutcome::NotEligible(
                "no generator resolver configured".into(),
            ));
        };

        info!(resolver = %name, version = %version, failures, "Starting evolution");

        // Baseline snapshot from the incumbent. No bundle means an empty
        // baseline, which any candidate trivially covers.
        let baseline = entry
            .resolver
            .run_baseline_tests(ctx)
            .await
            .unwrap_or_default();

        let failures_snapshot = state.window.snapshot();
        let candidate = match generator.generate(ctx, &incumbent, &failures_snapshot).await {
            Ok(candidate) => candidate,
            Err(e) => {
                return self
                    .reject(name, &version, &mut state, format!("generator failed: {}", e))
                    .await;
            }
        };

        let candidate_meta = candidate.metadata();
        if candidate_meta.name != incumbent.name {
            return self
                .reject(
                    name,
                    &version,
                    &mut state,
                    format!(
                        "candidate name '{}' does not match '{}'",
                        candidate_meta.name, incumbent.name
                    ),
                )
                .await;
        }
        if candidate_meta.version <= version {
            return self
                .reject(
                    name,
                    &version,
                    &mut state,
                    format!(
                        "candidate version {} is not newer than {}",
                        candidate_meta.version, version
                    ),
                )
                .await;
        }

        let candidate_report: BaselineReport = candidate
            .run_baseline_tests(ctx)
            .await
            .unwrap_or_default();
        if !candidate_report.passes_superset_of(&baseline) {
            let missing: Vec<&String> = baseline
                .passed
                .iter()
                .filter(|t| !candidate_report.passed.contains(t))
                .collect();
            return self
                .reject(
                    name,
                    &version,
                    &mut state,
                    format!("candidate regresses baseline tests: {:?}", missing),
                )
                .await;
        }

        // Verified: register the candidate; the higher version makes it
        // latest in the same write.
        let new_version = candidate_meta.version;
        self.registry.register(candidate).await?;
        self.registry
            .set_last_evolved(name, &new_version, now)
            .await?;
        state.last_evolved_at = Some(now);
        state.next_eligible_at = None;
        state.rejected_since_success = 0;
        state.window.clear();
        self.persist(name, &state);

        info!(resolver = %name, old = %version, new = %new_version, "Evolution accepted");
        if let Some(sink) = &self.sink {
            sink.evolution_succeeded(name, &version, &new_version).await;
        }
        Ok(EvolutionOutcome::Evolved {
            old_version: version,
            new_version,
        })
    }

    /// Clear the halt flag so evolution may run again after operator
    /// intervention.
    pub async fn clear_halt(&self, name: &str) -> Result<()> {
        let handle = self.state_handle(name).await;
        let mut state = handle.lock().await;
        state.halted = false;
        state.rejected_since_success = 0;
        state.next_eligible_at = None;
        self.persist(name, &state);
        info!(resolver = %name, "Evolution halt cleared");
        Ok(())
    }

    pub async fn is_halted(&self, name: &str) -> bool {
        let handle = self.state_handle(name).await;
        let halted = handle.lock().await.halted;
        halted
    }

    /// Drop failure windows for resolvers that are no longer registered.
    pub async fn sweep_orphans(&self) -> usize {
        let names: Vec<String> = {
            let states = self.states.lock().await;
            states.keys().cloned().collect()
        };
        let mut swept = 0;
        for name in names {
            if self.registry.get(&name, None).await.is_err() {
                let handle = self.state_handle(&name).await;
                let mut state = handle.lock().await;
                if !state.window.is_empty() {
                    state.window.clear();
                    self.persist(&name, &state);
                    swept += 1;
                }
            }
        }
        swept
    }

    async fn reject(
        &self,
        name: &str,
        version: &SemanticVersion,
        state: &mut ResolverState,
        reason: String,
    ) -> Result<EvolutionOutcome> {
        warn!(resolver = %name, version = %version, reason = %reason, "Evolution rejected");
        state.rejected_since_success += 1;
        state.next_eligible_at = Some(
            Utc::now() + ChronoDuration::seconds(self.config.min_interval_sec as i64),
        );
        if let Some(sink) = &self.sink {
            sink.evolution_rejected(name, version, &reason).await;
        }

        if state.rejected_since_success >= self.config.retry_budget {
            state.halted = true;
            self.persist(name, state);
            let message = format!(
                "resolver '{}' failed {} evolution attempts; manual intervention required",
                name, state.rejected_since_success
            );
            warn!(resolver = %name, "{}", message);
            if let Err(e) = self.registry.mark_degraded(name, version).await {
                warn!(resolver = %name, error = %e, "Could not mark entry degraded");
            }
            if let Some(sink) = &self.sink {
                sink.human_intervention_requested(name, version, &message).await;
            }
            return Ok(EvolutionOutcome::Halted);
        }

        self.persist(name, state);
        Ok(EvolutionOutcome::Rejected(reason))
    }

    async fn state_handle(&self, name: &str) -> Arc<Mutex<ResolverState>> {
        let mut states = self.states.lock().await;
        if let Some(handle) = states.get(name) {
            return handle.clone();
        }
        let state = self
            .load_persisted(name)
            .unwrap_or_else(|| ResolverState::new(self.config.window_size));
        let handle = Arc::new(Mutex::new(state));
        states.insert(name.to_string(), handle.clone());
        handle
    }

    fn load_persisted(&self, name: &str) -> Option<ResolverState> {
        let dir = self.persist_dir.as_ref()?;
        let safe = name.replace(['/', '\\', ':'], "_");
        let content = std::fs::read_to_string(dir.join(format!("{}.json", safe))).ok()?;
        match serde_json::from_str(&content) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(resolver = %name, error = %e, "Discarding unreadable evolver state");
                None
            }
        }
    }

    fn persist(&self, name: &str, state: &ResolverState) {
        let Some(dir) = &self.persist_dir else {
            return;
        };
        let safe = name.replace(['/', '\\', ':'], "_");
        let path = dir.join(format!("{}.json", safe));
        let write = std::fs::create_dir_all(dir).and_then(|_| {
            let content = serde_json::to_string_pretty(state)?;
            std::fs::write(&path, content)
        });
        if let Err(e) = write {
            warn!(resolver = %name, error = %e, "Failed to persist evolver state");
        }
    }
}
