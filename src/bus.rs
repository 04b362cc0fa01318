//! Process-wide store of the latest telemetry per channel and the command audit log.
//!
//! Every command in the harness goes through a [`CommandRoute`]. The bus is the
//! direct route; the fault injector is the disrupted one. Both end in
//! [`CommandTarget::set_cmd`].

use crate::channel::CommandTarget;
use crate::error::ConfigError;
use crate::logging::{wall_stamp, LogSink};
use crate::protocol::TelemetryFrame;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::SystemTime;

pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 500;

/// Receives decoded telemetry for a named channel.
pub type MeasSink = Arc<dyn Fn(&str, TelemetryFrame) + Send + Sync>;

/// Final hop of the command path.
pub type CommandSink =
    Arc<dyn Fn(&Arc<dyn CommandTarget>, &[(&str, f64)], &str) -> Result<(), ConfigError> + Send + Sync>;

/// The one authorised way to issue a command.
pub trait CommandRoute: Send + Sync {
    fn emit_cmd(
        &self,
        target: &Arc<dyn CommandTarget>,
        updates: &[(&str, f64)],
        note: &str,
    ) -> Result<(), ConfigError>;
}

fn default_capacity() -> usize {
    DEFAULT_EVENT_LOG_CAPACITY
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub event_log_capacity: usize,
    /// Channels whose telemetry gets an audit line on every frame. `None` logs nothing.
    pub rx_log_channels: Option<HashSet<String>>,
    /// Per-channel subset of fields shown on those lines.
    pub rx_log_fields: HashMap<String, Vec<String>>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            event_log_capacity: default_capacity(),
            rx_log_channels: None,
            rx_log_fields: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimedFrame {
    pub at: SystemTime,
    pub frame: TelemetryFrame,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandEvent {
    pub at: SystemTime,
    pub channel: String,
    pub updates: Vec<(String, f64)>,
    pub note: String,
}

pub fn owned_updates(updates: &[(&str, f64)]) -> Vec<(String, f64)> {
    updates.iter().map(|&(k, v)| (k.to_string(), v)).collect()
}

pub fn format_updates(updates: &[(&str, f64)]) -> String {
    let parts: Vec<String> = updates.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{{{}}}", parts.join(", "))
}

#[derive(Default)]
struct BusState {
    meas: HashMap<String, TimedFrame>,
    events: VecDeque<CommandEvent>,
}

pub struct Bus {
    config: BusConfig,
    log: LogSink,
    state: Mutex<BusState>,
}

impl Bus {
    pub fn new(config: BusConfig, log: LogSink) -> Self {
        Self {
            config,
            log,
            state: Mutex::new(BusState::default()),
        }
    }

    pub fn update_meas(&self, channel: &str, frame: TelemetryFrame) {
        let at = SystemTime::now();
        let audit = self.rx_audit_line(channel, &frame, at);

        self.state.lock().meas.insert(
            channel.to_string(),
            TimedFrame { at, frame },
        );

        if let Some(line) = audit {
            (self.log)(&line);
        }
    }

    fn rx_audit_line(&self, channel: &str, frame: &TelemetryFrame, at: SystemTime) -> Option<String> {
        let armed = self
            .config
            .rx_log_channels
            .as_ref()
            .map_or(false, |set| set.contains(channel));
        if !armed {
            return None;
        }
        let body = match self.config.rx_log_fields.get(channel) {
            Some(fields) => frame.format_fields(fields),
            None => frame.to_string(),
        };
        Some(format!("[{}][RX][{channel}] {body}", wall_stamp(at)))
    }

    pub fn get_meas(&self, channel: &str) -> Option<TimedFrame> {
        self.state.lock().meas.get(channel).cloned()
    }

    /// Latest value of one field, widened to f64.
    pub fn value(&self, channel: &str, field: &str) -> Option<f64> {
        self.state
            .lock()
            .meas
            .get(channel)
            .and_then(|t| t.frame.get_f64(field))
    }

    pub fn snapshot_all(&self) -> HashMap<String, TimedFrame> {
        self.state.lock().meas.clone()
    }

    pub fn get_cmd_log(&self) -> Vec<CommandEvent> {
        self.state.lock().events.iter().cloned().collect()
    }

    fn record(&self, channel: &str, updates: &[(&str, f64)], note: &str) {
        let event = CommandEvent {
            at: SystemTime::now(),
            channel: channel.to_string(),
            updates: owned_updates(updates),
            note: note.to_string(),
        };
        let line = format!(
            "[{}][TX][{channel}] {}{}",
            wall_stamp(event.at),
            format_updates(updates),
            if note.is_empty() {
                String::new()
            } else {
                format!("  ({note})")
            }
        );

        {
            let mut state = self.state.lock();
            state.events.push_back(event);
            while state.events.len() > self.config.event_log_capacity {
                state.events.pop_front();
            }
        }
        (self.log)(&line);
    }

    /// Adapter handing telemetry to this bus; used as the injector's output.
    pub fn meas_sink(self: &Arc<Self>) -> MeasSink {
        let bus = Arc::clone(self);
        Arc::new(move |channel: &str, frame: TelemetryFrame| bus.update_meas(channel, frame))
    }

    /// Adapter writing commands through this bus; used as the injector's output.
    pub fn command_sink(self: &Arc<Self>) -> CommandSink {
        let bus = Arc::clone(self);
        Arc::new(
            move |target: &Arc<dyn CommandTarget>, updates: &[(&str, f64)], note: &str| {
                bus.emit_cmd(target, updates, note)
            },
        )
    }
}

impl CommandRoute for Bus {
    /// Applies the write, then records it. A rejected write is not recorded.
    fn emit_cmd(
        &self,
        target: &Arc<dyn CommandTarget>,
        updates: &[(&str, f64)],
        note: &str,
    ) -> Result<(), ConfigError> {
        target.set_cmd(updates)?;
        self.record(target.name(), updates, note);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::logging::null_sink;
    use crate::protocol::{FieldSpec, FrameLayout, Value};

    /// In-memory command target that accepts a fixed set of field names.
    pub(crate) struct RecordingTarget {
        pub name: String,
        pub fields: Vec<String>,
        pub writes: Mutex<Vec<Vec<(String, f64)>>>,
    }

    impl RecordingTarget {
        pub(crate) fn new(name: &str, fields: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                fields: fields.iter().map(|f| f.to_string()).collect(),
                writes: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn write_count(&self) -> usize {
            self.writes.lock().len()
        }
    }

    impl CommandTarget for RecordingTarget {
        fn name(&self) -> &str {
            &self.name
        }

        fn validate(&self, updates: &[(&str, f64)]) -> Result<(), ConfigError> {
            for (field, _) in updates {
                if !self.fields.iter().any(|f| f == field) {
                    return Err(ConfigError::UnknownField {
                        channel: self.name.clone(),
                        field: field.to_string(),
                    });
                }
            }
            Ok(())
        }

        fn set_cmd(&self, updates: &[(&str, f64)]) -> Result<bool, ConfigError> {
            self.validate(updates)?;
            self.writes.lock().push(owned_updates(updates));
            Ok(true)
        }
    }

    pub(crate) fn frame(p: f32) -> TelemetryFrame {
        let layout = Arc::new(
            FrameLayout::new(vec![FieldSpec::int("BRK"), FieldSpec::float("P")]).unwrap(),
        );
        TelemetryFrame::new(layout, &[Value::Int(1), Value::Float(p)]).unwrap()
    }

    #[test]
    fn test_event_log_evicts_oldest() {
        let bus = Bus::new(
            BusConfig {
                event_log_capacity: 3,
                ..BusConfig::default()
            },
            null_sink(),
        );
        let target: Arc<dyn CommandTarget> = RecordingTarget::new("CH1", &["A"]);
        for i in 0..5 {
            bus.emit_cmd(&target, &[("A", f64::from(i))], "").unwrap();
        }
        let log = bus.get_cmd_log();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].updates, vec![("A".to_string(), 2.0)]);
        assert_eq!(log[2].updates, vec![("A".to_string(), 4.0)]);
    }

    #[test]
    fn test_rejected_command_is_not_recorded() {
        let bus = Bus::new(BusConfig::default(), null_sink());
        let recorder = RecordingTarget::new("CH1", &["A"]);
        let target: Arc<dyn CommandTarget> = recorder.clone();
        assert!(bus.emit_cmd(&target, &[("B", 1.0)], "bad").is_err());
        assert!(bus.get_cmd_log().is_empty());
        assert_eq!(recorder.write_count(), 0);
    }

    #[test]
    fn test_latest_frame_replaces_prior() {
        let bus = Bus::new(BusConfig::default(), null_sink());
        bus.update_meas("CH3", frame(0.1));
        bus.update_meas("CH3", frame(0.2));
        assert_eq!(bus.value("CH3", "P"), Some(f64::from(0.2f32)));
        assert_eq!(bus.snapshot_all().len(), 1);
        assert!(bus.get_meas("CH1").is_none());
    }

    #[test]
    fn test_rx_audit_respects_filters() {
        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink_lines = Arc::clone(&lines);
        let sink: LogSink = Arc::new(move |l: &str| sink_lines.lock().push(l.to_string()));

        let mut fields = HashMap::new();
        fields.insert("CH3".to_string(), vec!["BRK".to_string()]);
        let bus = Bus::new(
            BusConfig {
                rx_log_channels: Some(["CH3".to_string()].into_iter().collect()),
                rx_log_fields: fields,
                ..BusConfig::default()
            },
            sink,
        );

        bus.update_meas("CH1", frame(0.5));
        bus.update_meas("CH3", frame(0.5));

        let lines = lines.lock();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("[RX][CH3] {BRK=1}"));
    }
}
