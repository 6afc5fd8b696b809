use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Cancellable context threaded through every resolve, registry call and
/// store query. Carries a deadline, a cancellation signal and a correlation
/// id. Child contexts inherit cancellation from the parent; cancelling a
/// child never cancels its parent.
#[derive(Debug, Clone)]
pub struct TaskContext {
    correlation_id: String,
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl TaskContext {
    pub fn new() -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Derive a child context: same correlation id, child cancellation
    /// token, deadline clamped to the parent's.
    pub fn child(&self) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derive a child with a tighter deadline. The parent deadline still
    /// applies if it is earlier.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) => Some(parent.min(candidate)),
            None => Some(candidate),
        };
        Self {
            correlation_id: self.correlation_id.clone(),
            token: self.token.child_token(),
            deadline,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline_elapsed()
    }

    pub fn deadline_elapsed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Remaining time before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Resolves when the context is cancelled. Does not observe the
    /// deadline; pair with `remaining()` in timeout-sensitive select loops.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_inherits_parent_cancellation() {
        let parent = TaskContext::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn child_cancel_does_not_cancel_parent() {
        let parent = TaskContext::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn child_deadline_clamps_to_parent() {
        let parent = TaskContext::new().with_timeout(Duration::from_millis(10));
        let child = parent.child_with_timeout(Duration::from_secs(60));
        assert!(child.remaining().unwrap() <= Duration::from_millis(10));
    }

    #[test]
    fn deadline_counts_as_cancelled() {
        let ctx = TaskContext::new().with_timeout(Duration::from_millis(5));
        assert!(!ctx.is_cancelled());
        std::thread::sleep(Duration::from_millis(10));
        assert!(ctx.deadline_elapsed());
        assert!(ctx.is_cancelled());
    }
}
