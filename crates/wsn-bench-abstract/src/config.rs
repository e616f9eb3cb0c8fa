use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::interface::CommandLine;
use crate::plan::{CampaignPlan, ExperimentSpec, PlanError};

/// Whitespace-separated command with `{name}` placeholders.
///
/// Tokens are split before substitution, so a substituted value never
/// changes the argument count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandTemplate(pub String);

impl CommandTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    /// Substitute `vars` into the template. `None` for an empty template.
    pub fn render(&self, vars: &[(&str, &str)]) -> Option<CommandLine> {
        let mut tokens = self.0.split_whitespace().map(|token| {
            let mut rendered = token.to_string();
            for (name, value) in vars {
                rendered = rendered.replace(&format!("{{{name}}}"), value);
            }
            rendered
        });
        let program = tokens.next()?;
        Some(CommandLine::new(program, tokens.collect()))
    }
}

impl From<&str> for CommandTemplate {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// How the rig is provisioned and brought up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RigConfig {
    /// Devices on the rig, border router included.
    pub device_count: u32,
    /// Device flashed with the border-router role.
    pub gateway: u32,
    pub clean: CommandTemplate,
    pub build: CommandTemplate,
    pub flash_server: CommandTemplate,
    pub flash_border_router: CommandTemplate,
    pub router_bridge: CommandTemplate,
    pub probe: CommandTemplate,
    /// Probe every server device instead of only the farthest one.
    pub probe_all: bool,
    pub enumerate: CommandTemplate,
    pub reset: CommandTemplate,
    /// Best-effort commands that clear leftovers of earlier runs.
    pub cleanup: Vec<CommandTemplate>,
    /// Upper bound on each cleanup command; these still run during shutdown.
    pub cleanup_timeout_ms: u64,
    pub router_settle_ms: u64,
    pub probe_settle_ms: u64,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            device_count: 5,
            gateway: 1,
            clean: "make clean".into(),
            build: "make RDC={driver}".into(),
            flash_server: "make RDC={driver} rest-server.upload".into(),
            flash_border_router: "make RDC={driver} border-router.upload MOTE={gateway}".into(),
            router_bridge: "make connect-router".into(),
            probe: "ping6 -c1 -w30 sky{target}".into(),
            probe_all: false,
            enumerate: "../../tools/sky/motelist-linux".into(),
            reset: "../../tools/sky/msp430-bsl-linux --telosb -c {tty} -r".into(),
            cleanup: vec![
                "killall -q tunslip6".into(),
                "killall -q serialdump-linux".into(),
            ],
            cleanup_timeout_ms: 10_000,
            router_settle_ms: 3000,
            probe_settle_ms: 3000,
        }
    }
}

impl RigConfig {
    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_timeout_ms)
    }

    pub fn router_settle(&self) -> Duration {
        Duration::from_millis(self.router_settle_ms)
    }

    pub fn probe_settle(&self) -> Duration {
        Duration::from_millis(self.probe_settle_ms)
    }

    /// The server device farthest from the gateway.
    pub fn farthest_device(&self) -> u32 {
        self.device_count
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct RigConfigOverride {
    pub device_count: Option<u32>,
    pub gateway: Option<u32>,
    pub clean: Option<CommandTemplate>,
    pub build: Option<CommandTemplate>,
    pub flash_server: Option<CommandTemplate>,
    pub flash_border_router: Option<CommandTemplate>,
    pub router_bridge: Option<CommandTemplate>,
    pub probe: Option<CommandTemplate>,
    pub probe_all: Option<bool>,
    pub enumerate: Option<CommandTemplate>,
    pub reset: Option<CommandTemplate>,
    pub cleanup: Option<Vec<CommandTemplate>>,
    pub cleanup_timeout_ms: Option<u64>,
    pub router_settle_ms: Option<u64>,
    pub probe_settle_ms: Option<u64>,
}

impl RigConfigOverride {
    pub fn apply_to(&self, config: &mut RigConfig) {
        if let Some(v) = self.device_count {
            config.device_count = v;
        }
        if let Some(v) = self.gateway {
            config.gateway = v;
        }
        if let Some(v) = &self.clean {
            config.clean = v.clone();
        }
        if let Some(v) = &self.build {
            config.build = v.clone();
        }
        if let Some(v) = &self.flash_server {
            config.flash_server = v.clone();
        }
        if let Some(v) = &self.flash_border_router {
            config.flash_border_router = v.clone();
        }
        if let Some(v) = &self.router_bridge {
            config.router_bridge = v.clone();
        }
        if let Some(v) = &self.probe {
            config.probe = v.clone();
        }
        if let Some(v) = self.probe_all {
            config.probe_all = v;
        }
        if let Some(v) = &self.enumerate {
            config.enumerate = v.clone();
        }
        if let Some(v) = &self.reset {
            config.reset = v.clone();
        }
        if let Some(v) = &self.cleanup {
            config.cleanup = v.clone();
        }
        if let Some(v) = self.cleanup_timeout_ms {
            config.cleanup_timeout_ms = v;
        }
        if let Some(v) = self.router_settle_ms {
            config.router_settle_ms = v;
        }
        if let Some(v) = self.probe_settle_ms {
            config.probe_settle_ms = v;
        }
    }
}

/// How a single measurement is taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialConfig {
    pub client_simple: CommandTemplate,
    pub client_separate: CommandTemplate,
    /// Upper bound on the client invocation; the only bounded wait of a trial.
    pub client_timeout_ms: u64,
    pub capture: CommandTemplate,
    pub capture_settle_ms: u64,
    pub drain_settle_ms: u64,
    pub accounting_on: String,
    pub accounting_off: String,
    /// Directory holding the per-hop capture logs (`dump<node>.log`).
    pub capture_dir: PathBuf,
    /// Append-only copy of every client log that reported a negative RTT.
    pub negative_rtt_log: PathBuf,
}

impl Default for TrialConfig {
    fn default() -> Self {
        Self {
            client_simple: "java -cp java_tools/bin COAPClient 6 sky{target} 61616 get hello {payload}"
                .into(),
            client_separate:
                "java -jar java_tools/bin/SampleClient.jar POST coap://sky{target}:61616/separate?sep={ack} {wait}"
                    .into(),
            client_timeout_ms: 120_000,
            capture: "../../tools/sky/serialdump-linux -b115200 {tty}".into(),
            capture_settle_ms: 1000,
            drain_settle_ms: 1000,
            accounting_on: "powertrace on".to_string(),
            accounting_off: "powertrace off".to_string(),
            capture_dir: PathBuf::from("."),
            negative_rtt_log: PathBuf::from("neg.txt"),
        }
    }
}

impl TrialConfig {
    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    pub fn capture_settle(&self) -> Duration {
        Duration::from_millis(self.capture_settle_ms)
    }

    pub fn drain_settle(&self) -> Duration {
        Duration::from_millis(self.drain_settle_ms)
    }

    pub fn capture_log(&self, node: u32) -> PathBuf {
        self.capture_dir.join(format!("dump{node}.log"))
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct TrialConfigOverride {
    pub client_simple: Option<CommandTemplate>,
    pub client_separate: Option<CommandTemplate>,
    pub client_timeout_ms: Option<u64>,
    pub capture: Option<CommandTemplate>,
    pub capture_settle_ms: Option<u64>,
    pub drain_settle_ms: Option<u64>,
    pub accounting_on: Option<String>,
    pub accounting_off: Option<String>,
    pub capture_dir: Option<PathBuf>,
    pub negative_rtt_log: Option<PathBuf>,
}

impl TrialConfigOverride {
    pub fn apply_to(&self, config: &mut TrialConfig) {
        if let Some(v) = &self.client_simple {
            config.client_simple = v.clone();
        }
        if let Some(v) = &self.client_separate {
            config.client_separate = v.clone();
        }
        if let Some(v) = self.client_timeout_ms {
            config.client_timeout_ms = v;
        }
        if let Some(v) = &self.capture {
            config.capture = v.clone();
        }
        if let Some(v) = self.capture_settle_ms {
            config.capture_settle_ms = v;
        }
        if let Some(v) = self.drain_settle_ms {
            config.drain_settle_ms = v;
        }
        if let Some(v) = &self.accounting_on {
            config.accounting_on = v.clone();
        }
        if let Some(v) = &self.accounting_off {
            config.accounting_off = v.clone();
        }
        if let Some(v) = &self.capture_dir {
            config.capture_dir = v.clone();
        }
        if let Some(v) = &self.negative_rtt_log {
            config.negative_rtt_log = v.clone();
        }
    }
}

/// Recovery action chosen for a run of consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Escalation {
    Retry,
    ResetNetwork,
    Rebuild,
}

/// Failure escalation thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    /// Consecutive failures above which devices are reset.
    pub reset_after: u32,
    /// Consecutive failures above which firmware is rebuilt and reflashed.
    pub recompile_after: u32,
    /// Abort the whole campaign when provisioning fails.
    pub provisioning_fatal: bool,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            reset_after: 2,
            recompile_after: 4,
            provisioning_fatal: true,
        }
    }
}

impl EscalationPolicy {
    pub fn escalation(&self, consecutive_failures: u32) -> Escalation {
        if consecutive_failures > self.recompile_after {
            Escalation::Rebuild
        } else if consecutive_failures > self.reset_after {
            Escalation::ResetNetwork
        } else {
            Escalation::Retry
        }
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        if self.recompile_after <= self.reset_after {
            return Err(PlanError::Policy(format!(
                "recompile_after ({}) must be greater than reset_after ({})",
                self.recompile_after, self.reset_after
            )));
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct PolicyOverride {
    pub reset_after: Option<u32>,
    pub recompile_after: Option<u32>,
    pub provisioning_fatal: Option<bool>,
}

impl PolicyOverride {
    pub fn apply_to(&self, policy: &mut EscalationPolicy) {
        if let Some(v) = self.reset_after {
            policy.reset_after = v;
        }
        if let Some(v) = self.recompile_after {
            policy.recompile_after = v;
        }
        if let Some(v) = self.provisioning_fatal {
            policy.provisioning_fatal = v;
        }
    }
}

/// On-disk campaign description (TOML).
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct CampaignFile {
    #[serde(default)]
    pub rig: RigConfigOverride,
    #[serde(default)]
    pub trial: TrialConfigOverride,
    #[serde(default)]
    pub policy: PolicyOverride,
    #[serde(default, rename = "experiment")]
    pub experiments: Vec<ExperimentSpec>,
}

impl CampaignFile {
    pub fn rig_config(&self) -> RigConfig {
        let mut config = RigConfig::default();
        self.rig.apply_to(&mut config);
        config
    }

    pub fn trial_config(&self) -> TrialConfig {
        let mut config = TrialConfig::default();
        self.trial.apply_to(&mut config);
        config
    }

    pub fn policy(&self) -> Result<EscalationPolicy, PlanError> {
        let mut policy = EscalationPolicy::default();
        self.policy.apply_to(&mut policy);
        policy.validate()?;
        Ok(policy)
    }

    pub fn plan(&self) -> Result<CampaignPlan, PlanError> {
        CampaignPlan::from_specs(&self.experiments)
    }
}
