use std::path::PathBuf;

use crate::semver::SemanticVersion;

/// Layout of the taskloom data directory.
#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".taskloom"))
            .unwrap_or_else(|| PathBuf::from(".taskloom"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    /// Expand a configured data dir, resolving a leading `~`.
    pub fn from_config_dir(data_dir: &str) -> Self {
        let base = if let Some(rest) = data_dir.strip_prefix("~/") {
            dirs::home_dir()
                .map(|h| h.join(rest))
                .unwrap_or_else(|| PathBuf::from(rest))
        } else {
            PathBuf::from(data_dir)
        };
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.base.join("registry")
    }

    pub fn registry_entry_file(&self, name: &str, version: &SemanticVersion) -> PathBuf {
        self.registry_dir().join(format!("{}@{}.json", name, version))
    }

    pub fn masteries_dir(&self) -> PathBuf {
        self.base.join("masteries")
    }

    pub fn mastery_file(&self, name: &str, version: &SemanticVersion) -> PathBuf {
        self.masteries_dir().join(format!("{}@{}.json", name, version))
    }

    pub fn metrics_db(&self) -> PathBuf {
        self.base.join("metrics.db")
    }

    pub fn history_dir(&self) -> PathBuf {
        self.base.join("history")
    }

    pub fn history_file(&self) -> PathBuf {
        self.history_dir().join("executions.jsonl")
    }

    pub fn dashboards_dir(&self) -> PathBuf {
        self.base.join("dashboards")
    }

    pub fn dashboard_file(&self, id: &str) -> PathBuf {
        let safe = id.replace(['/', '\\', ':'], "_");
        self.dashboards_dir().join(format!("{}.html", safe))
    }

    pub fn evolver_dir(&self) -> PathBuf {
        self.base.join("evolver")
    }

    pub fn evolver_state_file(&self, resolver_name: &str) -> PathBuf {
        let safe = resolver_name.replace(['/', '\\', ':'], "_");
        self.evolver_dir().join(format!("{}.json", safe))
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.registry_dir())?;
        std::fs::create_dir_all(self.masteries_dir())?;
        std::fs::create_dir_all(self.history_dir())?;
        std::fs::create_dir_all(self.dashboards_dir())?;
        std::fs::create_dir_all(self.evolver_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_file_names_use_name_at_version() {
        let paths = Paths::with_base(PathBuf::from("/tmp/loom"));
        let v = SemanticVersion::new(1, 2, 3);
        assert_eq!(
            paths.registry_entry_file("echo", &v),
            PathBuf::from("/tmp/loom/registry/echo@1.2.3.json")
        );
    }

    #[test]
    fn dashboard_ids_are_sanitized() {
        let paths = Paths::with_base(PathBuf::from("/tmp/loom"));
        let file = paths.dashboard_file("sys/overview");
        assert_eq!(file.file_name().unwrap(), "sys_overview.html");
    }
}
