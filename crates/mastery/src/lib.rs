pub mod composer;
pub mod executor;
pub mod history;
pub mod plan;
pub mod registry;

pub use composer::{MasteryComposer, PLAN_CAPABILITY};
pub use executor::{
    Execution, ExecutionState, MasteryExecutor, MetricsSink, StepRecord, StepState,
};
pub use history::ExecutionHistory;
pub use plan::{BindingSource, ErrorPolicy, InputBinding, MasteryPlan, Step};
pub use registry::{MasteryEntry, MasteryRegistry};
