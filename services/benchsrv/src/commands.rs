//! SCPI command layer
//!
//! Each logical operation opens one connection, sends its command list in
//! order (each awaited before the next) and closes the connection on every
//! exit path. Failures propagate unchanged; nothing is retried.

use std::fmt;

use bench_protocols::{DeviceEndpoint, ScpiClient, ScpiOptions, ScpiReply};
use tracing::{debug, info};

use crate::cache::SinkPowerReading;
use crate::error::{BenchError, Result};

/// Active power query of the current sink
pub const MEASURE_POWER: &str = "MEAS:POW?";

/// Parallel operation role of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupMode {
    Master,
    Slave,
    None,
}

impl GroupMode {
    pub fn as_scpi(&self) -> &'static str {
        match self {
            GroupMode::Master => "MAST",
            GroupMode::Slave => "SLAV",
            GroupMode::None => "NONE",
        }
    }
}

impl fmt::Display for GroupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_scpi())
    }
}

fn check_value(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(BenchError::invalid_parameter(format!(
            "{} must be a finite, non-negative number, got {}",
            name, value
        )));
    }
    Ok(())
}

/// Voltage priority: regulate voltage, limit current symmetrically
pub fn voltage_priority_commands(voltage_limit: f64, current_limit: f64) -> Result<Vec<String>> {
    check_value("voltage limit", voltage_limit)?;
    check_value("current limit", current_limit)?;
    Ok(vec![
        "SOUR:FUNC VOLT".to_string(),
        format!("SOUR:CURR:LIM:POS:IMM:AMPL {}", current_limit),
        format!("SOUR:CURR:LIM:NEG:IMM:AMPL {}", -current_limit),
        format!("SOUR:VOLT:LEV:IMM:AMPL {}", voltage_limit),
    ])
}

/// Current priority: regulate current, limit voltage
pub fn current_priority_commands(current_limit: f64, voltage_limit: f64) -> Result<Vec<String>> {
    check_value("current limit", current_limit)?;
    check_value("voltage limit", voltage_limit)?;
    Ok(vec![
        "SOUR:FUNC CURR".to_string(),
        format!("SOUR:CURR {}", current_limit),
        format!("SOUR:VOLT:LIM:POS:IMM:AMPL {}", voltage_limit),
    ])
}

pub fn output_command(on: bool) -> String {
    if on {
        "OUTP ON".to_string()
    } else {
        "OUTP OFF".to_string()
    }
}

pub fn current_setpoint_command(amps: f64) -> Result<String> {
    check_value("current setpoint", amps)?;
    Ok(format!("SOUR:CURR {}", amps))
}

pub fn group_mode_command(mode: GroupMode) -> String {
    format!("INST:GRO:FUNC {}", mode.as_scpi())
}

/// Sink current (A) needed to draw `power_kw` at `voltage`, compensating the
/// sink's measured loss curve.
///
/// `adjusted = 2p - (0.0035p² + 0.9858p + 0.5878)`, `I = adjusted * 1000 / V`,
/// rounded to two decimals. Non-positive power yields 0 A and small negative
/// results are clamped to 0 A, so the result is monotonic non-decreasing in
/// power up to about 144.9 kW.
pub fn compute_current_for_power(power_kw: f64, voltage: f64) -> Result<f64> {
    if !power_kw.is_finite() {
        return Err(BenchError::invalid_parameter(format!(
            "power must be finite, got {}",
            power_kw
        )));
    }
    if !voltage.is_finite() || voltage <= 0.0 {
        return Err(BenchError::invalid_parameter(format!(
            "voltage must be a positive number, got {}",
            voltage
        )));
    }
    if power_kw <= 0.0 {
        return Ok(0.0);
    }

    let loss = 0.0035 * power_kw * power_kw + 0.9858 * power_kw + 0.5878;
    let adjusted = 2.0 * power_kw - loss;
    let current = adjusted * 1000.0 / voltage;
    let rounded = (current * 100.0).round() / 100.0;
    Ok(rounded.max(0.0))
}

/// Runs command lists against SCPI devices, one connection per operation
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    options: ScpiOptions,
}

impl CommandExecutor {
    pub fn new(options: ScpiOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ScpiOptions {
        &self.options
    }

    /// Connect, send `commands` in order, close. Stops at the first failure.
    pub async fn run(&self, endpoint: &DeviceEndpoint, commands: &[String]) -> Result<Vec<ScpiReply>> {
        let mut client = ScpiClient::connect(endpoint, self.options.clone()).await?;

        let mut replies = Vec::with_capacity(commands.len());
        let mut outcome = Ok(());
        for command in commands {
            match client.send_command(command).await {
                Ok(reply) => replies.push(reply),
                Err(e) => {
                    outcome = Err(e);
                    break;
                },
            }
        }

        if let Err(e) = client.close().await {
            debug!("SCPI close {}: {}", endpoint, e);
        }

        outcome?;
        Ok(replies)
    }

    pub async fn set_voltage_priority_mode(
        &self,
        endpoint: &DeviceEndpoint,
        voltage_limit: f64,
        current_limit: f64,
    ) -> Result<()> {
        let commands = voltage_priority_commands(voltage_limit, current_limit)?;
        self.run(endpoint, &commands).await?;
        info!(
            "Voltage priority mode: {} V, ±{} A @ {}",
            voltage_limit, current_limit, endpoint
        );
        Ok(())
    }

    pub async fn set_current_priority_mode(
        &self,
        endpoint: &DeviceEndpoint,
        current_limit: f64,
        voltage_limit: f64,
    ) -> Result<()> {
        let commands = current_priority_commands(current_limit, voltage_limit)?;
        self.run(endpoint, &commands).await?;
        info!(
            "Current priority mode: {} A, {} V limit @ {}",
            current_limit, voltage_limit, endpoint
        );
        Ok(())
    }

    pub async fn set_output(&self, endpoint: &DeviceEndpoint, on: bool) -> Result<()> {
        self.run(endpoint, &[output_command(on)]).await?;
        info!("Output {} @ {}", if on { "ON" } else { "OFF" }, endpoint);
        Ok(())
    }

    pub async fn set_current_setpoint(&self, endpoint: &DeviceEndpoint, amps: f64) -> Result<()> {
        let command = current_setpoint_command(amps)?;
        self.run(endpoint, &[command]).await?;
        info!("Current setpoint {} A @ {}", amps, endpoint);
        Ok(())
    }

    pub async fn set_group_mode(&self, endpoint: &DeviceEndpoint, mode: GroupMode) -> Result<()> {
        self.run(endpoint, &[group_mode_command(mode)]).await?;
        info!("Group mode {} @ {}", mode, endpoint);
        Ok(())
    }

    /// `MEAS:POW?` on the current sink
    pub async fn read_sink_power(&self, endpoint: &DeviceEndpoint) -> Result<SinkPowerReading> {
        let mut replies = self.run(endpoint, &[MEASURE_POWER.to_string()]).await?;
        let reply = replies
            .pop()
            .ok_or_else(|| BenchError::internal("no reply recorded for MEAS:POW?"))?;
        let reading = SinkPowerReading::from_reply(reply);
        debug!("Sink power @ {}: {}", endpoint, reading.message);
        Ok(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voltage_priority_sequence() {
        assert_eq!(
            voltage_priority_commands(400.0, 32.0).unwrap(),
            vec![
                "SOUR:FUNC VOLT",
                "SOUR:CURR:LIM:POS:IMM:AMPL 32",
                "SOUR:CURR:LIM:NEG:IMM:AMPL -32",
                "SOUR:VOLT:LEV:IMM:AMPL 400",
            ]
        );
    }

    #[test]
    fn test_current_priority_sequence() {
        assert_eq!(
            current_priority_commands(12.5, 400.0).unwrap(),
            vec![
                "SOUR:FUNC CURR",
                "SOUR:CURR 12.5",
                "SOUR:VOLT:LIM:POS:IMM:AMPL 400"
            ]
        );
    }

    #[test]
    fn test_single_commands() {
        assert_eq!(output_command(true), "OUTP ON");
        assert_eq!(output_command(false), "OUTP OFF");
        assert_eq!(current_setpoint_command(0.0).unwrap(), "SOUR:CURR 0");
        assert_eq!(group_mode_command(GroupMode::Slave), "INST:GRO:FUNC SLAV");
        assert!(current_setpoint_command(f64::NAN).is_err());
        assert!(current_setpoint_command(-1.0).is_err());
    }

    #[test]
    fn test_group_mode_display() {
        assert_eq!(GroupMode::Master.to_string(), "MAST");
        assert_eq!(GroupMode::Slave.to_string(), "SLAV");
        assert_eq!(GroupMode::None.as_scpi(), "NONE");
    }

    #[test]
    fn test_current_for_power_zero() {
        assert_eq!(compute_current_for_power(0.0, 230.0).unwrap(), 0.0);
        assert_eq!(compute_current_for_power(-3.0, 230.0).unwrap(), 0.0);
        // Loss exceeds the doubled power just above zero
        assert_eq!(compute_current_for_power(0.5, 230.0).unwrap(), 0.0);
    }

    #[test]
    fn test_current_for_power_value() {
        // adjusted = 22 - (0.4235 + 10.8438 + 0.5878) = 10.1449 kW
        assert_eq!(compute_current_for_power(11.0, 230.0).unwrap(), 44.11);
    }

    #[test]
    fn test_current_for_power_monotonic() {
        let mut previous = 0.0;
        for step in 0..=280 {
            let power = step as f64 * 0.5;
            let current = compute_current_for_power(power, 230.0).unwrap();
            assert!(
                current >= previous,
                "{} kW gave {} A after {} A",
                power,
                current,
                previous
            );
            previous = current;
        }
    }

    #[test]
    fn test_current_for_power_rejects_bad_input() {
        assert!(matches!(
            compute_current_for_power(11.0, 0.0),
            Err(BenchError::InvalidParameter(_))
        ));
        assert!(compute_current_for_power(f64::INFINITY, 230.0).is_err());
        assert!(compute_current_for_power(11.0, f64::NAN).is_err());
    }
}
