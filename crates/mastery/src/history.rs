use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

use crate::executor::Execution;

/// Bounded record of finished executions: an in-memory ring for the API plus
/// an append-only JSON-lines file for the archive.
pub struct ExecutionHistory {
    ring: Mutex<VecDeque<Execution>>,
    capacity: usize,
    file: Option<PathBuf>,
}

impl ExecutionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            file: None,
        }
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file = Some(path);
        self
    }

    pub fn append(&self, execution: Execution) {
        if let Some(path) = &self.file {
            let write = || -> std::io::Result<()> {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let line = serde_json::to_string(&execution)?;
                let mut file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                writeln!(file, "{}", line)?;
                Ok(())
            };
            if let Err(e) = write() {
                warn!(error = %e, "Failed to append execution history");
            }
        }

        let mut ring = self.ring.lock().expect("history lock poisoned");
        ring.push_back(execution);
        while ring.len() > self.capacity {
            ring.pop_front();
        }
    }

    /// Most recent executions, newest first.
    pub fn recent(&self, n: usize) -> Vec<Execution> {
        let ring = self.ring.lock().expect("history lock poisoned");
        ring.iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().expect("history lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
