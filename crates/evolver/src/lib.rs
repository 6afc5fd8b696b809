pub mod evolver;
pub mod window;

pub use evolver::{
    EvolutionOutcome, Evolver, EvolverSink, ResolverGenerator, EVOLVE_CAPABILITY,
};
pub use window::{FailureRecord, FailureWindow};
