pub mod aggregate;
pub mod campaign;
pub mod host;
pub mod rig;
pub mod store;
pub mod telemetry;
pub mod trial;

pub use aggregate::{AggregateOptions, NodeSummary, TupleSummary, aggregate, summarize_results};
pub use campaign::{
    CampaignError, CampaignReport, CampaignRunner, CampaignState, Counters, TupleProgress,
};
pub use host::{HostExec, HostProcess};
pub use rig::{RigController, RigError, RigPhase, RigState, parse_enumeration};
pub use store::{ResultStore, SampleWriter, StoreError};
pub use telemetry::{TelemetryError, parse_latency, parse_power_record, parse_trial_log};
pub use trial::{FailureKind, TrialExecutor, TrialFailure};
