//! Device Rig Controller: firmware, device resets and network bring-up.
//!
//! The controller issues commands; all readiness knowledge lives in
//! [`RigState`], which the campaign threads through every call.

use std::io;

use thiserror::Error;
use tracing::{debug, info, warn};
use wsn_bench_abstract::{
    BackgroundProcess, CommandTemplate, ParameterTuple, ProcessExec, RdcDriver, RigConfig,
};

/// Coarse readiness of the rig for a requested driver variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RigPhase {
    CompileDirty,
    NetworkDown,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RigState {
    /// Variant currently on the devices, if known.
    pub flashed: Option<RdcDriver>,
    pub firmware_stale: bool,
    pub reset_pending: bool,
    pub network_down: bool,
}

impl Default for RigState {
    fn default() -> Self {
        Self::needs_everything()
    }
}

impl RigState {
    pub fn needs_everything() -> Self {
        Self {
            flashed: None,
            firmware_stale: true,
            reset_pending: false,
            network_down: true,
        }
    }

    /// Operator asserts the devices already run `variant`.
    pub fn assume_programmed(variant: RdcDriver) -> Self {
        Self {
            flashed: Some(variant),
            firmware_stale: false,
            reset_pending: false,
            network_down: true,
        }
    }

    pub fn firmware_current(&self, variant: RdcDriver) -> bool {
        !self.firmware_stale && self.flashed == Some(variant)
    }

    pub fn phase(&self, variant: RdcDriver) -> RigPhase {
        if !self.firmware_current(variant) {
            RigPhase::CompileDirty
        } else if self.network_down || self.reset_pending {
            RigPhase::NetworkDown
        } else {
            RigPhase::Ready
        }
    }

    /// Escalation: reset devices and re-verify reachability before the next trial.
    pub fn force_network_reset(&mut self) {
        self.reset_pending = true;
        self.network_down = true;
    }

    /// Escalation: rebuild and reflash before the next trial.
    pub fn force_rebuild(&mut self) {
        self.firmware_stale = true;
        self.network_down = true;
    }
}

#[derive(Debug, Error)]
pub enum RigError {
    #[error("provisioning failed: `{command}` {detail}")]
    Provisioning { command: String, detail: String },

    #[error("network unreachable: {detail}")]
    NetworkUnreachable { detail: String },

    #[error("interrupted by operator")]
    Interrupted,
}

fn is_interrupted(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::Interrupted
}

/// Second whitespace field of line `device + 1` of the enumeration output.
///
/// The first two lines are the tool's header, so device 1 is on line 2.
pub fn parse_enumeration(lines: &[String], device: u32) -> Option<String> {
    lines
        .get(device as usize + 1)?
        .split_whitespace()
        .nth(1)
        .map(str::to_string)
}

pub struct RigController {
    config: RigConfig,
    router: Option<Box<dyn BackgroundProcess>>,
}

impl RigController {
    pub fn new(config: RigConfig) -> Self {
        Self {
            config,
            router: None,
        }
    }

    fn render(
        template: &CommandTemplate,
        vars: &[(&str, &str)],
    ) -> Result<wsn_bench_abstract::CommandLine, RigError> {
        template.render(vars).ok_or_else(|| RigError::Provisioning {
            command: template.0.clone(),
            detail: "empty command template".to_string(),
        })
    }

    fn provision_step(
        exec: &mut dyn ProcessExec,
        template: &CommandTemplate,
        vars: &[(&str, &str)],
    ) -> Result<(), RigError> {
        let command = Self::render(template, vars)?;
        let output = exec.run(&command, None).map_err(|e| {
            if is_interrupted(&e) {
                RigError::Interrupted
            } else {
                RigError::Provisioning {
                    command: command.to_string(),
                    detail: e.to_string(),
                }
            }
        })?;
        if !output.success() {
            for line in output.lines.iter().rev().take(10).rev() {
                debug!("  | {}", line);
            }
            return Err(RigError::Provisioning {
                command: command.to_string(),
                detail: format!("exited with {:?}", output.status),
            });
        }
        Ok(())
    }

    fn stop_router(&mut self) {
        if let Some(mut router) = self.router.take() {
            if let Err(e) = router.stop() {
                warn!("Failed to stop router bridge: {}", e);
            }
        }
    }

    /// Stop everything the rig started and clear leftovers of earlier runs.
    ///
    /// Runs even after an operator interrupt: the cleanup commands are what
    /// reach helpers the bridge process forked.
    pub fn teardown(&mut self, exec: &mut dyn ProcessExec) {
        self.stop_router();
        for template in &self.config.cleanup {
            if let Some(command) = template.render(&[]) {
                match exec.run_cleanup(&command, self.config.cleanup_timeout()) {
                    Ok(out) if !out.success() => debug!("`{}` exited with {:?}", command, out.status),
                    Ok(_) => {}
                    Err(e) => debug!("`{}` failed: {}", command, e),
                }
            }
        }
    }

    /// Clean-build and flash `variant` unless it is already current.
    ///
    /// Any failing build or flash step leaves `state` untouched.
    pub fn ensure_firmware(
        &mut self,
        exec: &mut dyn ProcessExec,
        state: &mut RigState,
        variant: RdcDriver,
    ) -> Result<(), RigError> {
        if state.firmware_current(variant) {
            return Ok(());
        }

        info!("-- Compiling ({})", variant);
        self.teardown(exec);

        let driver = variant.driver_symbol();
        let gateway = self.config.gateway.to_string();
        let vars = [
            ("rdc", variant.as_str()),
            ("driver", driver.as_str()),
            ("gateway", gateway.as_str()),
        ];

        let clean = Self::render(&self.config.clean, &vars)?;
        match exec.run(&clean, None) {
            Ok(out) if !out.success() => warn!("`{}` exited with {:?}", clean, out.status),
            Ok(_) => {}
            Err(e) if is_interrupted(&e) => return Err(RigError::Interrupted),
            Err(e) => warn!("`{}` failed: {}", clean, e),
        }
        Self::provision_step(exec, &self.config.build, &vars)?;
        info!("-- Programming servers");
        Self::provision_step(exec, &self.config.flash_server, &vars)?;
        info!("-- Programming border router");
        Self::provision_step(exec, &self.config.flash_border_router, &vars)?;

        state.flashed = Some(variant);
        state.firmware_stale = false;
        state.reset_pending = false;
        state.network_down = true;
        Ok(())
    }

    /// Start the router bridge and probe reachability if the network is down.
    pub fn ensure_network_up(
        &mut self,
        exec: &mut dyn ProcessExec,
        state: &mut RigState,
    ) -> Result<(), RigError> {
        if !state.network_down {
            return Ok(());
        }

        info!("Preparing network");
        self.teardown(exec);

        let bridge = Self::render(&self.config.router_bridge, &[])?;
        let router = exec.spawn(&bridge, None).map_err(|e| RigError::NetworkUnreachable {
            detail: format!("cannot start `{bridge}`: {e}"),
        })?;
        self.router = Some(router);
        exec.sleep(self.config.router_settle());

        let targets: Vec<u32> = if self.config.probe_all {
            (self.config.gateway + 1..=self.config.device_count).collect()
        } else {
            vec![self.config.farthest_device()]
        };
        for target in targets {
            let target = target.to_string();
            let probe = Self::render(&self.config.probe, &[("target", target.as_str())])?;
            debug!("-- Probing device {}", target);
            let output = exec.run(&probe, None).map_err(|e| {
                if is_interrupted(&e) {
                    RigError::Interrupted
                } else {
                    RigError::NetworkUnreachable {
                        detail: format!("`{probe}` failed: {e}"),
                    }
                }
            })?;
            if !output.success() {
                return Err(RigError::NetworkUnreachable {
                    detail: format!("`{probe}` exited with {:?}", output.status),
                });
            }
        }
        exec.sleep(self.config.probe_settle());

        state.network_down = false;
        Ok(())
    }

    /// Power-cycle the gateway and every hop device of a `hops`-hop path.
    ///
    /// Only used as an escalation step. Always leaves the network marked down.
    pub fn reset_devices(
        &mut self,
        exec: &mut dyn ProcessExec,
        state: &mut RigState,
        hops: u32,
    ) -> Result<(), RigError> {
        info!("-- Resetting devices");
        self.teardown(exec);

        for device in self.config.gateway..=hops + 1 {
            let Some(tty) = self.resolve_serial_port(exec, device) else {
                warn!("Device {} is not enumerated, skipping its reset", device);
                continue;
            };
            let Some(command) = self.config.reset.render(&[("tty", tty.as_str())]) else {
                continue;
            };
            match exec.run(&command, None) {
                Ok(out) if !out.success() => {
                    warn!("Reset of device {} exited with {:?}", device, out.status)
                }
                Ok(_) => {}
                Err(e) if is_interrupted(&e) => return Err(RigError::Interrupted),
                Err(e) => warn!("Reset of device {} failed: {}", device, e),
            }
        }

        state.reset_pending = false;
        state.network_down = true;
        Ok(())
    }

    /// Current serial device path of `device`, or `None` when it is not
    /// enumerated right now (transient; retry later).
    pub fn resolve_serial_port(&self, exec: &mut dyn ProcessExec, device: u32) -> Option<String> {
        let command = self.config.enumerate.render(&[])?;
        let output = match exec.run(&command, None) {
            Ok(out) if out.success() => out,
            Ok(out) => {
                debug!("`{}` exited with {:?}", command, out.status);
                return None;
            }
            Err(e) => {
                debug!("`{}` failed: {}", command, e);
                return None;
            }
        };
        let port = parse_enumeration(&output.lines, device);
        debug!("Device {} is on {:?}", device, port);
        port
    }

    /// Walk the rig to [`RigPhase::Ready`] for `tuple`: firmware, pending
    /// reset, then network, in that order.
    ///
    /// Every step either advances the phase or fails, so the walk is bounded.
    pub fn prepare(
        &mut self,
        exec: &mut dyn ProcessExec,
        state: &mut RigState,
        tuple: &ParameterTuple,
    ) -> Result<(), RigError> {
        loop {
            match state.phase(tuple.rdc) {
                RigPhase::CompileDirty => self.ensure_firmware(exec, state, tuple.rdc)?,
                RigPhase::NetworkDown if state.reset_pending => {
                    self.reset_devices(exec, state, tuple.hops)?
                }
                RigPhase::NetworkDown => self.ensure_network_up(exec, state)?,
                RigPhase::Ready => return Ok(()),
            }
        }
    }
}

impl Drop for RigController {
    fn drop(&mut self) {
        self.stop_router();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn motelist() -> Vec<String> {
        [
            "Reference  Device           Description",
            "---------- ---------------- ---------------------------------------------",
            "M4AOQGBQ   /dev/ttyUSB0     Moteiv tmote sky",
            "M4AOQGA1   /dev/ttyUSB1     Moteiv tmote sky",
            "M4AOQG9Z   /dev/ttyUSB2     Moteiv tmote sky",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    #[test]
    fn enumeration_skips_the_header() {
        assert_eq!(parse_enumeration(&motelist(), 1).as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(parse_enumeration(&motelist(), 3).as_deref(), Some("/dev/ttyUSB2"));
        assert_eq!(parse_enumeration(&motelist(), 4), None);
    }

    #[test]
    fn fresh_state_needs_everything() {
        let state = RigState::default();
        assert_eq!(state.phase(RdcDriver::ContikiMac), RigPhase::CompileDirty);
    }

    #[test]
    fn switching_variant_makes_firmware_dirty() {
        let mut state = RigState::assume_programmed(RdcDriver::ContikiMac);
        assert_eq!(state.phase(RdcDriver::ContikiMac), RigPhase::NetworkDown);
        assert_eq!(state.phase(RdcDriver::NullRdc), RigPhase::CompileDirty);
        state.network_down = false;
        assert_eq!(state.phase(RdcDriver::ContikiMac), RigPhase::Ready);
    }

    #[test]
    fn escalations_only_raise_requirements() {
        let mut state = RigState::assume_programmed(RdcDriver::ContikiMac);
        state.network_down = false;
        state.force_network_reset();
        assert_eq!(state.phase(RdcDriver::ContikiMac), RigPhase::NetworkDown);
        state.force_rebuild();
        assert_eq!(state.phase(RdcDriver::ContikiMac), RigPhase::CompileDirty);
        assert!(state.reset_pending);
    }
}
