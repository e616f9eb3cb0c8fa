use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::tuple::{ParameterTuple, RdcDriver};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("experiment '{name}': {reason}")]
    Experiment { name: String, reason: String },

    #[error("invalid escalation policy: {0}")]
    Policy(String),

    #[error("campaign declares no experiments")]
    Empty,
}

/// Protocol client variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMode {
    /// Piggybacked response; RTT on the last client line.
    #[default]
    Simple,
    /// Separate response; RTT on the second-to-last client line.
    Separate,
}

/// One `[[experiment]]` block as written in the campaign file.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ExperimentSpec {
    pub name: String,
    #[serde(default)]
    pub mode: ClientMode,
    pub rdc: Vec<RdcDriver>,
    pub hops: Vec<u32>,
    #[serde(default)]
    pub payloads: Vec<u32>,
    /// Extra payload sizes as `[start, end_exclusive, step]`.
    #[serde(default)]
    pub payload_ranges: Vec<[u32; 3]>,
    #[serde(default)]
    pub acks: Vec<u32>,
    #[serde(default)]
    pub waits: Vec<u32>,
    pub iterations: usize,
    /// Spread iterations over repeated passes across the grid.
    #[serde(default)]
    pub interleave: bool,
}

/// An expanded experiment: ordered tuples plus the per-tuple target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Experiment {
    pub name: String,
    pub tuples: Vec<ParameterTuple>,
    pub iterations: usize,
    pub interleave: bool,
}

impl Experiment {
    /// Successive per-tuple targets the runner drives the grid to.
    ///
    /// A plain experiment has a single pass at the full target; an interleaved
    /// one raises every tuple's target by one per pass.
    pub fn rounds(&self) -> Vec<usize> {
        if self.interleave {
            (1..=self.iterations).collect()
        } else {
            vec![self.iterations]
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CampaignPlan {
    pub experiments: Vec<Experiment>,
}

impl CampaignPlan {
    pub fn from_specs(specs: &[ExperimentSpec]) -> Result<Self, PlanError> {
        if specs.is_empty() {
            return Err(PlanError::Empty);
        }
        let experiments = specs
            .iter()
            .map(ExperimentSpec::expand)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { experiments })
    }

    /// Largest hop count used anywhere in the plan.
    pub fn max_hops(&self) -> u32 {
        self.experiments
            .iter()
            .flat_map(|e| e.tuples.iter().map(|t| t.hops))
            .max()
            .unwrap_or(0)
    }

    pub fn first_rdc(&self) -> Option<RdcDriver> {
        self.experiments
            .iter()
            .find_map(|e| e.tuples.first().map(|t| t.rdc))
    }
}

impl ExperimentSpec {
    fn fail(&self, reason: impl Into<String>) -> PlanError {
        PlanError::Experiment {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn payload_sizes(&self) -> Result<Vec<u32>, PlanError> {
        let mut sizes = self.payloads.clone();
        for [start, end, step] in &self.payload_ranges {
            if *step == 0 {
                return Err(self.fail("payload range step must be positive"));
            }
            sizes.extend((*start..*end).step_by(*step as usize));
        }
        sizes.sort_unstable();
        sizes.dedup();
        Ok(sizes)
    }

    /// Expand into tuples, ordered RDC, hops, payload, wait, ack (outer to inner).
    pub fn expand(&self) -> Result<Experiment, PlanError> {
        if self.rdc.is_empty() {
            return Err(self.fail("no RDC drivers listed"));
        }
        if self.hops.is_empty() || self.hops.contains(&0) {
            return Err(self.fail("hop counts must be a non-empty list of positive integers"));
        }
        if self.iterations == 0 {
            return Err(self.fail("iterations must be positive"));
        }

        let mut payloads = self.payload_sizes()?;
        let mut tuples = Vec::new();
        match self.mode {
            ClientMode::Simple => {
                if !self.acks.is_empty() || !self.waits.is_empty() {
                    return Err(self.fail("acks/waits only apply to the separate mode"));
                }
                if payloads.is_empty() {
                    return Err(self.fail("no payload sizes listed"));
                }
                for &rdc in &self.rdc {
                    for &hops in &self.hops {
                        for &payload in &payloads {
                            tuples.push(ParameterTuple::simple(hops, payload, rdc));
                        }
                    }
                }
            }
            ClientMode::Separate => {
                if self.acks.is_empty() || self.waits.is_empty() {
                    return Err(self.fail("separate mode needs both acks and waits"));
                }
                if payloads.is_empty() {
                    payloads.push(0);
                }
                for &rdc in &self.rdc {
                    for &hops in &self.hops {
                        for &payload in &payloads {
                            for &wait in &self.waits {
                                for &ack in &self.acks {
                                    tuples.push(ParameterTuple::separate(
                                        hops, payload, rdc, ack, wait,
                                    ));
                                }
                            }
                        }
                    }
                }
            }
        }

        let mut seen = HashSet::new();
        tuples.retain(|t| seen.insert(*t));

        Ok(Experiment {
            name: self.name.clone(),
            tuples,
            iterations: self.iterations,
            interleave: self.interleave,
        })
    }
}
