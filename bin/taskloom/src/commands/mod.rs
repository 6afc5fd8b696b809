pub mod alerts_cmd;
pub mod bridge;
pub mod masteries_cmd;
pub mod metrics_cmd;
pub mod onboard;
pub mod registry_cmd;
pub mod serve;
pub mod status;
