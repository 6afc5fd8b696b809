pub mod embedding;
pub mod entry;
pub mod resolver_registry;

pub use embedding::{cosine_similarity, Embedder};
pub use entry::{PersistedEntry, RegistryEntry};
pub use resolver_registry::{
    EntryHealth, HealthRollup, ResolverSelector, TaskResolverRegistry, VersionConstraint,
};
