//! Summary Statistics
//!
//! Population mean and standard deviation over one sample set, with a
//! high-dispersion flag used to spot campaigns polluted by outliers.

use serde::ser::{Serialize, SerializeStruct, Serializer};
use thiserror::Error;
use tracing::warn;

/// Stdev above this fraction of the mean marks a sample set as high-dispersion.
pub const DISPERSION_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot summarize an empty sample set")]
pub struct EmptyInputError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SummaryStat {
    pub mean: f64,
    pub stdev: f64,
}

impl SummaryStat {
    pub fn high_dispersion(&self) -> bool {
        self.stdev > self.mean * DISPERSION_RATIO
    }
}

/// Exported as `{mean, stdev, high_dispersion}`; the flag is derived on output.
impl Serialize for SummaryStat {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("SummaryStat", 3)?;
        state.serialize_field("mean", &self.mean)?;
        state.serialize_field("stdev", &self.stdev)?;
        state.serialize_field("high_dispersion", &self.high_dispersion())?;
        state.end()
    }
}

/// Population mean and stdev (divides by N). Empty input means "no data yet".
///
/// A high-dispersion set is reported through the log with every sample value;
/// the returned statistic is the same either way.
pub fn summarize(samples: &[f64]) -> Result<SummaryStat, EmptyInputError> {
    if samples.is_empty() {
        return Err(EmptyInputError);
    }

    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let stat = SummaryStat {
        mean,
        stdev: variance.sqrt(),
    };

    if stat.high_dispersion() {
        let values: Vec<String> = samples.iter().map(|v| format!("{v:.2}")).collect();
        warn!(
            "Very high stdev ({:.2} for mean {:.2}): {}",
            stat.stdev,
            stat.mean,
            values.join(" ")
        );
    }

    Ok(stat)
}
