//! Campaign Runner: drives the parameter grid to its targets with retry and
//! escalating recovery.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use wsn_bench_abstract::{
    CampaignPlan, Escalation, EscalationPolicy, ParameterTuple, ProcessExec,
};

use crate::rig::{RigController, RigState};
use crate::store::{ResultStore, StoreError};
use crate::trial::{FailureKind, TrialExecutor, TrialFailure};

/// Conditions that end the whole campaign.
#[derive(Debug, Error)]
pub enum CampaignError {
    #[error("interrupted by operator")]
    Interrupted,

    #[error("rig cannot be provisioned: {0}")]
    Provisioning(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("host I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Running totals over the whole process run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub attempts: u64,
    /// New samples persisted by this run.
    pub successes: u64,
    /// Tuples found already complete, plus samples persisted.
    pub results: u64,
    pub failures: u64,
    pub no_reply: u64,
    pub negative_rtt: u64,
    pub by_kind: BTreeMap<FailureKind, u64>,
}

impl fmt::Display for Counters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "results: {} (new: {}, aborted: {}, no reply: {}, negs: {}, attempts: {})",
            self.results,
            self.successes,
            self.failures,
            self.no_reply,
            self.negative_rtt,
            self.attempts
        )
    }
}

impl Counters {
    fn record_failure(&mut self, kind: FailureKind) {
        self.failures += 1;
        *self.by_kind.entry(kind).or_default() += 1;
        match kind {
            FailureKind::NoReply => self.no_reply += 1,
            FailureKind::NegativeRtt => self.negative_rtt += 1,
            _ => {}
        }
    }
}

/// Everything the campaign mutates between trials.
#[derive(Debug, Clone, Default)]
pub struct CampaignState {
    pub rig: RigState,
    pub counters: Counters,
    /// Failures since the current tuple's last success.
    pub consecutive_failures: u32,
}

impl CampaignState {
    pub fn new(rig: RigState) -> Self {
        Self {
            rig,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TupleProgress {
    pub tuple: ParameterTuple,
    pub samples: usize,
    pub target: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignReport {
    pub counters: Counters,
    pub tuples: Vec<TupleProgress>,
}

pub struct CampaignRunner {
    rig: RigController,
    executor: TrialExecutor,
    store: ResultStore,
    policy: EscalationPolicy,
    shutdown: Arc<AtomicBool>,
}

impl CampaignRunner {
    pub fn new(
        rig: RigController,
        executor: TrialExecutor,
        store: ResultStore,
        policy: EscalationPolicy,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            rig,
            executor,
            store,
            policy,
            shutdown,
        }
    }

    /// Run every experiment of `plan` in order, then tear the rig down
    /// whatever the outcome.
    pub fn run_plan(
        &mut self,
        exec: &mut dyn ProcessExec,
        state: &mut CampaignState,
        plan: &CampaignPlan,
    ) -> Result<CampaignReport, CampaignError> {
        self.rig.teardown(exec);
        let outcome = self.run_experiments(exec, state, plan);
        self.rig.teardown(exec);
        outcome?;

        let mut tuples = Vec::new();
        for experiment in &plan.experiments {
            for tuple in &experiment.tuples {
                tuples.push(TupleProgress {
                    tuple: *tuple,
                    samples: self.store.count(tuple)?,
                    target: experiment.iterations,
                });
            }
        }
        info!("Campaign complete, {}", state.counters);
        Ok(CampaignReport {
            counters: state.counters.clone(),
            tuples,
        })
    }

    fn run_experiments(
        &mut self,
        exec: &mut dyn ProcessExec,
        state: &mut CampaignState,
        plan: &CampaignPlan,
    ) -> Result<(), CampaignError> {
        for experiment in &plan.experiments {
            info!(
                "Experiment '{}': {} tuple(s), {} iteration(s) each",
                experiment.name,
                experiment.tuples.len(),
                experiment.iterations
            );
            for target in experiment.rounds() {
                self.run_campaign(exec, state, &experiment.tuples, target)?;
            }
        }
        Ok(())
    }

    /// Drive every tuple of `grid`, in order, to `target` persisted samples.
    pub fn run_campaign(
        &mut self,
        exec: &mut dyn ProcessExec,
        state: &mut CampaignState,
        grid: &[ParameterTuple],
        target: usize,
    ) -> Result<(), CampaignError> {
        for tuple in grid {
            self.run_tuple(exec, state, tuple, target)?;
        }
        Ok(())
    }

    fn run_tuple(
        &mut self,
        exec: &mut dyn ProcessExec,
        state: &mut CampaignState,
        tuple: &ParameterTuple,
        target: usize,
    ) -> Result<(), CampaignError> {
        let mut writer = self.store.open(tuple)?;
        if writer.count() >= target {
            info!(
                "{} already done ({} results), no need to bench",
                writer.path().display(),
                writer.count()
            );
            state.counters.results += 1;
            return Ok(());
        }
        info!(
            "{} needs {} more result(s)",
            writer.path().display(),
            target - writer.count()
        );

        state.consecutive_failures = 0;
        while writer.count() < target {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(CampaignError::Interrupted);
            }
            state.counters.attempts += 1;
            info!(
                "{} Iteration #{}, {}",
                tuple,
                writer.count() + 1,
                state.counters
            );

            match self
                .executor
                .run_trial(exec, &mut self.rig, &mut state.rig, tuple)
            {
                Ok(result) => {
                    writer.append(tuple, &result)?;
                    state.counters.successes += 1;
                    state.counters.results += 1;
                    state.consecutive_failures = 0;
                    info!("Result: {} ms over {} node(s)", result.latency_ms, result.power.len());
                }
                Err(failure) => self.on_failure(state, tuple, failure)?,
            }
        }
        Ok(())
    }

    fn on_failure(
        &mut self,
        state: &mut CampaignState,
        tuple: &ParameterTuple,
        failure: TrialFailure,
    ) -> Result<(), CampaignError> {
        let kind = failure.kind();
        let failure = match failure {
            TrialFailure::Interrupted => return Err(CampaignError::Interrupted),
            TrialFailure::Io(e) => return Err(CampaignError::Io(e)),
            other => other,
        };
        if kind == FailureKind::Provisioning && self.policy.provisioning_fatal {
            error!("{}: {}", tuple, failure);
            return Err(CampaignError::Provisioning(failure.to_string()));
        }

        state.counters.record_failure(kind);
        state.consecutive_failures += 1;
        warn!(
            "{} cancelled ({}): {} [consecutive: {}, {}]",
            tuple, kind, failure, state.consecutive_failures, state.counters
        );

        match self.policy.escalation(state.consecutive_failures) {
            Escalation::Retry => {}
            Escalation::ResetNetwork => {
                warn!("Escalating: device reset before the next attempt");
                state.rig.force_network_reset();
            }
            Escalation::Rebuild => {
                warn!("Escalating: full rebuild before the next attempt");
                state.rig.force_network_reset();
                state.rig.force_rebuild();
            }
        }
        Ok(())
    }
}
