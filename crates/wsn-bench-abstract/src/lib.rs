pub mod config;
pub mod interface;
pub mod plan;
pub mod sample;
pub mod tuple;

pub use interface::{BackgroundProcess, CommandLine, ProcessExec, ProcessOutput};
pub use sample::{NodeId, PowerCounters, SampleLineError, TrialResult};
pub use tuple::{ParameterTuple, RdcDriver, SeparateParams};

pub use config::{
    CampaignFile, CommandTemplate, Escalation, EscalationPolicy, PolicyOverride, RigConfig, RigConfigOverride,
    TrialConfig, TrialConfigOverride,
};
pub use plan::{CampaignPlan, ClientMode, Experiment, ExperimentSpec, PlanError};
