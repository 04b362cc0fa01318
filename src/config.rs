//! Channel descriptors and harness configuration.
//!
//! Layouts are fixed per deployment. They are loaded once at startup, validated,
//! and never renegotiated at runtime.

use crate::bus::BusConfig;
use crate::controller::ControllerConfig;
use crate::error::{ConfigError, LoadError};
use crate::fault_injection::FaultInjectionConfig;
use crate::protocol::{FieldKind, FieldSpec, FrameLayout};
use crate::sequencer::SequencerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "172.24.4.3";

pub const PCC_CHANNEL: &str = "CH1";
pub const STORAGE_CHANNEL: &str = "CH2";
pub const GENERATOR_CHANNEL: &str = "CH3";
pub const LOAD_CHANNEL: &str = "CH4";

const PCC_PORT: u16 = 7000;
const STORAGE_PORT: u16 = 7001;
const GENERATOR_PORT: u16 = 7002;
const LOAD_PORT: u16 = 7003;

fn default_true() -> bool {
    true
}

fn default_connect_timeout_s() -> f64 {
    5.0
}

fn default_initial_backoff_s() -> f64 {
    0.5
}

fn default_max_backoff_s() -> f64 {
    5.0
}

fn default_tx_period_s() -> f64 {
    0.05
}

/// Immutable description of one channel. Built once, shared by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub telemetry: FrameLayout,
    pub command: FrameLayout,

    /// Integer telemetry field that must read 1 before a command frame may go out.
    #[serde(default)]
    pub ready_to_send: Option<String>,
    #[serde(default = "default_true")]
    pub require_ready_to_send: bool,

    #[serde(default = "default_connect_timeout_s")]
    pub connect_timeout_s: f64,
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,

    #[serde(default = "default_true")]
    pub reconnect: bool,
    #[serde(default = "default_initial_backoff_s")]
    pub reconnect_initial_backoff_s: f64,
    #[serde(default = "default_max_backoff_s")]
    pub reconnect_max_backoff_s: f64,

    #[serde(default = "default_true")]
    pub enable_tx: bool,
    #[serde(default = "default_tx_period_s")]
    pub tx_period_s: f64,
    /// Resend the held command at this interval even when nothing changed.
    #[serde(default)]
    pub tx_keepalive_s: Option<f64>,
}

impl ChannelConfig {
    pub fn new(name: &str, host: &str, port: u16, telemetry: FrameLayout, command: FrameLayout) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            telemetry,
            command,
            ready_to_send: None,
            require_ready_to_send: true,
            connect_timeout_s: default_connect_timeout_s(),
            tcp_nodelay: true,
            reconnect: true,
            reconnect_initial_backoff_s: default_initial_backoff_s(),
            reconnect_max_backoff_s: default_max_backoff_s(),
            enable_tx: true,
            tx_period_s: default_tx_period_s(),
            tx_keepalive_s: None,
        }
    }

    pub fn with_ready_to_send(mut self, field: &str) -> Self {
        self.ready_to_send = Some(field.to_string());
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The gating field, if gating is configured and switched on.
    pub fn send_gate(&self) -> Option<&str> {
        match (&self.ready_to_send, self.require_ready_to_send) {
            (Some(field), true) => Some(field.as_str()),
            _ => None,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout_s)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.reconnect_initial_backoff_s)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.reconnect_max_backoff_s)
    }

    pub fn tx_period(&self) -> Duration {
        Duration::from_secs_f64(self.tx_period_s)
    }

    pub fn tx_keepalive(&self) -> Option<Duration> {
        self.tx_keepalive_s.map(Duration::from_secs_f64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |reason: String| ConfigError::Channel {
            channel: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("channel with empty name".into()));
        }
        if self.host.trim().is_empty() {
            return Err(fail("empty host".into()));
        }
        if let Some(ready) = &self.ready_to_send {
            match self.telemetry.kind_of(ready) {
                Some(FieldKind::Int) => {}
                Some(FieldKind::Float) => {
                    return Err(fail(format!("ready-to-send field `{ready}` must be an integer")))
                }
                None => {
                    return Err(fail(format!(
                        "ready-to-send field `{ready}` is not in the telemetry layout"
                    )))
                }
            }
        }
        if !(self.connect_timeout_s.is_finite() && self.connect_timeout_s > 0.0) {
            return Err(fail("connect timeout must be positive".into()));
        }
        if !(self.reconnect_initial_backoff_s.is_finite() && self.reconnect_initial_backoff_s > 0.0) {
            return Err(fail("initial reconnect backoff must be positive".into()));
        }
        if !(self.reconnect_max_backoff_s.is_finite()
            && self.reconnect_max_backoff_s >= self.reconnect_initial_backoff_s)
        {
            return Err(fail("maximum reconnect backoff must be at least the initial backoff".into()));
        }
        if !(self.tx_period_s.is_finite() && self.tx_period_s > 0.0) {
            return Err(fail("TX period must be positive".into()));
        }
        if let Some(keepalive) = self.tx_keepalive_s {
            if !(keepalive.is_finite() && keepalive > 0.0) {
                return Err(fail("TX keepalive must be positive".into()));
            }
        }
        Ok(())
    }
}

/// Unit the simulator expects for a fault-duration word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationUnit {
    Seconds,
    Cycles,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultTiming {
    pub nominal_frequency_hz: f64,
    pub wire_unit: DurationUnit,
}

impl Default for FaultTiming {
    fn default() -> Self {
        Self {
            nominal_frequency_hz: 60.0,
            wire_unit: DurationUnit::Seconds,
        }
    }
}

impl FaultTiming {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nominal_frequency_hz.is_finite() && self.nominal_frequency_hz > 0.0 {
            Ok(())
        } else {
            Err(ConfigError::Invalid(format!(
                "fault timing: nominal frequency must be positive, got {}",
                self.nominal_frequency_hz
            )))
        }
    }

    /// Converts a duration given in cycles into the value written on the wire.
    pub fn cycles_to_wire(&self, cycles: f64) -> f64 {
        match self.wire_unit {
            DurationUnit::Cycles => cycles,
            DurationUnit::Seconds => cycles / self.nominal_frequency_hz,
        }
    }
}

/// Everything the harness needs, loadable from one JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub fault_injection: FaultInjectionConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub scenario: SequencerConfig,
    #[serde(default)]
    pub fault_timing: FaultTiming,
}

impl HarnessConfig {
    /// Presets for the four deployment channels plus default tunables.
    pub fn microgrid(host: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            channels: microgrid_channels(host)?,
            bus: BusConfig::default(),
            fault_injection: FaultInjectionConfig::default(),
            controller: ControllerConfig::default(),
            scenario: SequencerConfig::default(),
            fault_timing: FaultTiming::default(),
        })
    }

    pub fn from_json_str(json: &str) -> Result<Self, LoadError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.name == name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for channel in &self.channels {
            channel.validate()?;
            if !names.insert(channel.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate channel name `{}`",
                    channel.name
                )));
            }
        }

        if self.bus.event_log_capacity == 0 {
            return Err(ConfigError::Invalid("bus: event log capacity must be at least 1".into()));
        }
        self.fault_timing.validate()?;
        self.controller.validate()?;
        self.scenario.validate()?;

        for signal in self.scenario.signal_refs() {
            let channel = self.channel(&signal.channel).ok_or_else(|| {
                ConfigError::Invalid(format!("scenario signal {signal} names an unknown channel"))
            })?;
            if channel.telemetry.slot(&signal.field).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "scenario signal {signal} is not in the telemetry layout"
                )));
            }
        }
        for command in self.scenario.command_refs() {
            let channel = self.channel(&command.channel).ok_or_else(|| {
                ConfigError::Invalid(format!("scenario command {command} names an unknown channel"))
            })?;
            if channel.command.slot(&command.field).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "scenario command {command} is not in the command layout"
                )));
            }
        }
        Ok(())
    }
}

fn header(index: u8) -> Vec<FieldSpec> {
    ["NewDataFlag", "NewDataSeq", "ReadyToSend", "SocketOverflow", "InvalidMsg"]
        .iter()
        .map(|prefix| FieldSpec::int(&format!("{prefix}_{index}_")))
        .collect()
}

fn ready_field(index: u8) -> String {
    format!("ReadyToSend_{index}_")
}

fn layout_with_header(index: u8, body: Vec<FieldSpec>) -> Result<FrameLayout, ConfigError> {
    let mut fields = header(index);
    fields.extend(body);
    FrameLayout::new(fields)
}

/// Point of common coupling: grid tie, mode, fault injection words.
pub fn pcc_channel(host: &str) -> Result<ChannelConfig, ConfigError> {
    let telemetry = layout_with_header(
        1,
        vec![
            FieldSpec::int("MODE"),
            FieldSpec::float("PGRID"),
            FieldSpec::float("QGRID"),
            FieldSpec::float("N650RMSPU"),
            FieldSpec::float("IGRIDA"),
            FieldSpec::float("IGRIDB"),
            FieldSpec::float("IGRIDC"),
            FieldSpec::int("GRID"),
        ],
    )?;
    let command = FrameLayout::new(vec![
        FieldSpec::int("REM_GRID"),
        FieldSpec::int("REM_LGFLTx"),
        FieldSpec::float("REM_LGFTIMEx"),
        FieldSpec::int("REM_LGFLTxType"),
    ])?;
    Ok(ChannelConfig::new(PCC_CHANNEL, host, PCC_PORT, telemetry, command)
        .with_ready_to_send(&ready_field(1)))
}

/// Battery storage converter.
pub fn storage_channel(host: &str) -> Result<ChannelConfig, ConfigError> {
    let mut body = vec![
        FieldSpec::int("BRK1island"),
        FieldSpec::float("OMEGA"),
        FieldSpec::float("THETA"),
        FieldSpec::float("ERR_5"),
        FieldSpec::int("V_DETECT"),
        FieldSpec::int("F_DETECT"),
        FieldSpec::int("LOCKSIG"),
        FieldSpec::int("INITx"),
        FieldSpec::float("block"),
        FieldSpec::float("Pmeas"),
        FieldSpec::float("Qmeas"),
        FieldSpec::int("BRK1"),
    ];
    body.extend(
        [
            "SOC1", "VLOADRMS", "Isqref_V3", "Isdref_V3", "Perr", "Qerr", "VAave", "VBave",
            "VCave", "IDCave",
        ]
        .iter()
        .map(|name| FieldSpec::float(name)),
    );
    let telemetry = layout_with_header(2, body)?;
    let command = FrameLayout::new(vec![
        FieldSpec::float("REM_Preftest"),
        FieldSpec::float("REM_Qreftest"),
        FieldSpec::int("REM_BLOCK"),
        FieldSpec::int("REM_CHKRESET"),
        FieldSpec::int("REM_BESSBRK"),
    ])?;
    Ok(ChannelConfig::new(STORAGE_CHANNEL, host, STORAGE_PORT, telemetry, command)
        .with_ready_to_send(&ready_field(2)))
}

/// Diesel generator.
pub fn generator_channel(host: &str) -> Result<ChannelConfig, ConfigError> {
    let telemetry = layout_with_header(
        3,
        vec![
            FieldSpec::float("PGEN"),
            FieldSpec::float("QGEN"),
            FieldSpec::int("BRKGEN"),
            FieldSpec::float("PMACH"),
            FieldSpec::float("QMACH"),
            FieldSpec::float("SMACH"),
            FieldSpec::float("GENRMSPU"),
            FieldSpec::int("OVERLOADED"),
            FieldSpec::float("WPU"),
            FieldSpec::int("W_DETECTED"),
        ],
    )?;
    let command = FrameLayout::new(vec![
        FieldSpec::int("REM_BLOCKGEN"),
        FieldSpec::float("REM_Wref"),
        FieldSpec::float("REM_PREF"),
        FieldSpec::int("REM_RESETGEN"),
    ])?;
    Ok(ChannelConfig::new(GENERATOR_CHANNEL, host, GENERATOR_PORT, telemetry, command)
        .with_ready_to_send(&ready_field(3)))
}

/// Controllable load.
pub fn load_channel(host: &str) -> Result<ChannelConfig, ConfigError> {
    let telemetry = layout_with_header(
        4,
        vec![
            FieldSpec::float("PLOAD680"),
            FieldSpec::float("QLOAD680"),
            FieldSpec::float("N680RMSPU"),
        ],
    )?;
    let command = FrameLayout::new(vec![FieldSpec::float("REM_PLOAD"), FieldSpec::float("REM_QLOAD")])?;
    Ok(ChannelConfig::new(LOAD_CHANNEL, host, LOAD_PORT, telemetry, command)
        .with_ready_to_send(&ready_field(4)))
}

pub fn microgrid_channels(host: &str) -> Result<Vec<ChannelConfig>, ConfigError> {
    Ok(vec![
        pcc_channel(host)?,
        storage_channel(host)?,
        generator_channel(host)?,
        load_channel(host)?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_layout_sizes() {
        let channels = microgrid_channels("127.0.0.1").unwrap();
        let sizes: Vec<(usize, usize)> = channels
            .iter()
            .map(|c| (c.telemetry.len(), c.command.len()))
            .collect();
        assert_eq!(sizes, vec![(13, 4), (27, 5), (15, 4), (8, 2)]);
        assert_eq!(channels[0].telemetry.signature(), "iiiiiiffffffi");
        assert_eq!(channels[1].telemetry.signature(), "iiiiiifffiiiifffiffffffffff");
        assert_eq!(channels[2].telemetry.signature(), "iiiiiffiffffifi");
        assert_eq!(channels[2].command.signature(), "iffi");
        for channel in &channels {
            channel.validate().unwrap();
        }
    }

    #[test]
    fn test_ready_field_must_be_integer_telemetry() {
        let mut channel = load_channel("127.0.0.1").unwrap();
        channel.ready_to_send = Some("PLOAD680".into());
        assert!(channel.validate().is_err());

        channel.ready_to_send = Some("NOPE".into());
        assert!(channel.validate().is_err());
    }

    #[test]
    fn test_backoff_bounds_validated() {
        let mut channel = load_channel("127.0.0.1").unwrap();
        channel.reconnect_max_backoff_s = 0.1;
        assert!(channel.validate().is_err());
    }

    #[test]
    fn test_cycles_conversion() {
        let seconds = FaultTiming::default();
        assert!((seconds.cycles_to_wire(6.0) - 0.1).abs() < 1e-12);

        let cycles = FaultTiming {
            nominal_frequency_hz: 50.0,
            wire_unit: DurationUnit::Cycles,
        };
        assert_eq!(cycles.cycles_to_wire(6.0), 6.0);
    }

    #[test]
    fn test_non_positive_frequency_rejected() {
        let mut config = HarnessConfig::microgrid("127.0.0.1").unwrap();
        config.fault_timing.nominal_frequency_hz = 0.0;
        assert!(config.validate().is_err());
        config.fault_timing.nominal_frequency_hz = f64::NAN;
        assert!(config.validate().is_err());
        config.fault_timing.nominal_frequency_hz = 50.0;
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_event_log_capacity_rejected() {
        let mut config = HarnessConfig::microgrid("127.0.0.1").unwrap();
        config.bus.event_log_capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(&err, ConfigError::Invalid(m) if m.contains("event log")), "{err}");
    }

    #[test]
    fn test_microgrid_config_round_trips_through_json() {
        let config = HarnessConfig::microgrid("127.0.0.1").unwrap();
        config.validate().unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let parsed = HarnessConfig::from_json_str(&json).unwrap();
        assert_eq!(parsed.channels, config.channels);
    }

    #[test]
    fn test_minimal_json_fills_defaults() {
        let json = r#"{
            "channels": [{
                "name": "CH4", "host": "127.0.0.1", "port": 7003,
                "telemetry": [{"name": "ReadyToSend_4_", "kind": "int"}, {"name": "PLOAD680", "kind": "float"}],
                "command": [{"name": "REM_PLOAD", "kind": "float"}],
                "ready_to_send": "ReadyToSend_4_"
            }]
        }"#;
        let config: HarnessConfig = serde_json::from_str(json).unwrap();
        let channel = &config.channels[0];
        assert!(channel.require_ready_to_send);
        assert_eq!(channel.tx_period(), Duration::from_millis(50));
        assert_eq!(channel.send_gate(), Some("ReadyToSend_4_"));
        channel.validate().unwrap();
    }
}
