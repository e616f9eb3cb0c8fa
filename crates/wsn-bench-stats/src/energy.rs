use serde::{Deserialize, Serialize};
use wsn_bench_abstract::PowerCounters;

/// Calibration for turning energy-accounting ticks into energy.
///
/// Currents are in mA at `voltage`; per-state power is `0.001 * mA * voltage`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyModel {
    pub voltage: f64,
    pub transmit_ma: f64,
    pub listen_ma: f64,
    pub cpu_ma: f64,
    pub lpm_ma: f64,
    pub flash_read_ma: f64,
    pub flash_write_ma: f64,
    /// Divide raw ticks by this rate to get seconds. `None` keeps tick units.
    pub ticks_per_second: Option<f64>,
}

impl Default for EnergyModel {
    fn default() -> Self {
        Self {
            voltage: 3.0,
            transmit_ma: 17.4,
            listen_ma: 19.7,
            cpu_ma: 1.8,
            lpm_ma: 0.0545,
            flash_read_ma: 4.0,
            flash_write_ma: 20.0,
            ticks_per_second: None,
        }
    }
}

impl EnergyModel {
    fn power(&self, milliamps: f64) -> f64 {
        0.001 * milliamps * self.voltage
    }

    fn scale(&self) -> f64 {
        self.ticks_per_second.map_or(1.0, |rate| 1.0 / rate)
    }

    /// Energy of one trial interval including external-flash activity.
    pub fn energy_with_flash(&self, counters: &PowerCounters, fread: u64, fwrite: u64) -> f64 {
        let raw = counters.transmit as f64 * self.power(self.transmit_ma)
            + counters.listen as f64 * self.power(self.listen_ma)
            + counters.cpu as f64 * self.power(self.cpu_ma)
            + counters.lpm as f64 * self.power(self.lpm_ma)
            + fread as f64 * self.power(self.flash_read_ma)
            + fwrite as f64 * self.power(self.flash_write_ma);
        raw * self.scale()
    }

    /// Energy of one trial interval. Flash counters are not captured, so they count as zero.
    pub fn energy(&self, counters: &PowerCounters) -> f64 {
        self.energy_with_flash(counters, 0, 0)
    }

    /// Mean power over the interval; `None` when the node reported no on-time.
    pub fn average_power(&self, counters: &PowerCounters) -> Option<f64> {
        let on_time = counters.on_time();
        if on_time == 0 {
            return None;
        }
        Some(self.energy(counters) / (on_time as f64 * self.scale()))
    }
}

/// Radio duty cycle in percent; `None` when the node reported no on-time.
pub fn duty_cycle(counters: &PowerCounters) -> Option<f64> {
    let on_time = counters.on_time();
    if on_time == 0 {
        return None;
    }
    Some(100.0 * (counters.transmit + counters.listen) as f64 / on_time as f64)
}
