pub mod config;
pub mod context;
pub mod error;
pub mod paths;
pub mod schema;
pub mod semver;
pub mod task;

pub use config::{Config, EvolverConfig, RetryDefaults};
pub use context::TaskContext;
pub use error::{Error, Result, TaskError, TaskErrorKind};
pub use paths::Paths;
pub use semver::SemanticVersion;
pub use task::{Task, TaskResult, TaskStatus};
