//! Per-channel disruption layer between the channels and the bus.
//!
//! Telemetry and commands each get their own degradation settings per channel.
//! Anything not configured passes straight through. All random decisions come
//! from one seedable generator so a run can be replayed exactly.
//!
//! Independently delayed deliveries are not re-sequenced: a frame with a short
//! jittered delay may overtake an earlier one with a longer delay.

use crate::bus::{format_updates, owned_updates, CommandRoute, CommandSink, MeasSink};
use crate::channel::CommandTarget;
use crate::error::ConfigError;
use crate::logging::LogSink;
use crate::protocol::{TelemetryFrame, Value};
use crate::scheduler::{DelayScheduler, SchedulerStats};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;

fn clamp_unit(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}

fn non_negative(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x.max(0.0)
    }
}

/// Telemetry-path disruption for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DataDegradation {
    pub enabled: bool,
    pub drop_prob: f64,
    /// Replay the last delivered frame and ignore new data.
    pub freeze: bool,
    pub fixed_delay_s: f64,
    pub jitter_s: f64,
    pub add_noise: bool,
    pub noise_std: f64,
    /// Fields that receive noise. `None` means every field; integers are rounded.
    pub fields: Option<Vec<String>>,
}

impl DataDegradation {
    fn sanitized(mut self) -> Self {
        self.drop_prob = clamp_unit(self.drop_prob);
        self.fixed_delay_s = non_negative(self.fixed_delay_s);
        self.jitter_s = non_negative(self.jitter_s);
        self.noise_std = non_negative(self.noise_std);
        self
    }
}

/// Command-path disruption for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CommandDegradation {
    pub enabled: bool,
    pub block_all: bool,
    pub drop_prob: f64,
    pub fixed_delay_s: f64,
    pub jitter_s: f64,
}

impl CommandDegradation {
    fn sanitized(mut self) -> Self {
        self.drop_prob = clamp_unit(self.drop_prob);
        self.fixed_delay_s = non_negative(self.fixed_delay_s);
        self.jitter_s = non_negative(self.jitter_s);
        self
    }
}

/// Initial injector state as loaded from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FaultInjectionConfig {
    /// Route the harness through the injector at all.
    pub enabled: bool,
    pub seed: Option<u64>,
    pub data: HashMap<String, DataDegradation>,
    pub command: HashMap<String, CommandDegradation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct InjectionStats {
    pub frames_passed: u64,
    pub frames_dropped: u64,
    pub frames_frozen: u64,
    pub frames_noised: u64,
    pub frames_delayed: u64,
    pub commands_passed: u64,
    pub commands_blocked: u64,
    pub commands_dropped: u64,
    pub commands_delayed: u64,
    pub commands_rejected: u64,
}

enum Delivery {
    Now(TelemetryFrame),
    Later(TelemetryFrame, Duration),
    Discard,
}

enum CommandDecision {
    Pass,
    Later(Duration),
    Suppress(&'static str),
}

struct InjectorState {
    data: HashMap<String, DataDegradation>,
    command: HashMap<String, CommandDegradation>,
    last_delivered: HashMap<String, TelemetryFrame>,
    frozen: HashMap<String, TelemetryFrame>,
    rng: StdRng,
    stats: InjectionStats,
}

impl InjectorState {
    fn delay(&mut self, fixed_s: f64, jitter_s: f64) -> Duration {
        let mut delay = fixed_s;
        if jitter_s > 0.0 {
            delay += self.rng.gen_range(-jitter_s..=jitter_s);
        }
        Duration::from_secs_f64(delay.max(0.0))
    }

    /// Box-Muller: one standard-normal draw scaled by `std`.
    fn gaussian(&mut self, std: f64) -> f64 {
        let u1 = self.rng.gen::<f64>().max(f64::MIN_POSITIVE);
        let u2 = self.rng.gen::<f64>();
        std * (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
    }

    fn add_noise(&mut self, frame: &mut TelemetryFrame, std: f64, fields: Option<&[String]>) {
        let layout = Arc::clone(frame.layout());
        for (slot, spec) in layout.fields().iter().enumerate() {
            if fields.map_or(false, |names| !names.iter().any(|n| *n == spec.name)) {
                continue;
            }
            let noisy = match frame.values()[slot] {
                Value::Float(v) => Value::Float((f64::from(v) + self.gaussian(std)) as f32),
                Value::Int(v) => Value::Int((f64::from(v) + self.gaussian(std)).round() as i32),
            };
            frame.set_slot(slot, noisy);
        }
    }

    fn route_meas(&mut self, channel: &str, frame: TelemetryFrame) -> Delivery {
        let cfg = match self.data.get(channel) {
            Some(cfg) if cfg.enabled => cfg.clone(),
            _ => {
                self.stats.frames_passed += 1;
                self.last_delivered.insert(channel.to_string(), frame.clone());
                return Delivery::Now(frame);
            }
        };

        if cfg.freeze {
            let held = self
                .frozen
                .entry(channel.to_string())
                .or_insert(frame)
                .clone();
            self.stats.frames_frozen += 1;
            return Delivery::Now(held);
        }

        if cfg.drop_prob > 0.0 && self.rng.gen::<f64>() < cfg.drop_prob {
            self.stats.frames_dropped += 1;
            return Delivery::Discard;
        }

        let mut out = frame;
        if cfg.add_noise && cfg.noise_std > 0.0 {
            self.add_noise(&mut out, cfg.noise_std, cfg.fields.as_deref());
            self.stats.frames_noised += 1;
        }

        self.last_delivered.insert(channel.to_string(), out.clone());
        let delay = self.delay(cfg.fixed_delay_s, cfg.jitter_s);
        if delay.is_zero() {
            self.stats.frames_passed += 1;
            Delivery::Now(out)
        } else {
            self.stats.frames_delayed += 1;
            Delivery::Later(out, delay)
        }
    }

    fn route_cmd(&mut self, channel: &str) -> CommandDecision {
        let cfg = match self.command.get(channel) {
            Some(cfg) if cfg.enabled => cfg.clone(),
            _ => {
                self.stats.commands_passed += 1;
                return CommandDecision::Pass;
            }
        };

        if cfg.block_all {
            self.stats.commands_blocked += 1;
            return CommandDecision::Suppress("BLOCKED");
        }
        if cfg.drop_prob > 0.0 && self.rng.gen::<f64>() < cfg.drop_prob {
            self.stats.commands_dropped += 1;
            return CommandDecision::Suppress("DROPPED");
        }

        let delay = self.delay(cfg.fixed_delay_s, cfg.jitter_s);
        if delay.is_zero() {
            self.stats.commands_passed += 1;
            CommandDecision::Pass
        } else {
            self.stats.commands_delayed += 1;
            CommandDecision::Later(delay)
        }
    }
}

pub struct FaultInjector {
    meas_sink: MeasSink,
    cmd_sink: CommandSink,
    log: LogSink,
    state: Mutex<InjectorState>,
    scheduler: DelayScheduler,
}

impl FaultInjector {
    pub fn new(meas_sink: MeasSink, cmd_sink: CommandSink, log: LogSink, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            meas_sink,
            cmd_sink,
            log,
            state: Mutex::new(InjectorState {
                data: HashMap::new(),
                command: HashMap::new(),
                last_delivered: HashMap::new(),
                frozen: HashMap::new(),
                rng,
                stats: InjectionStats::default(),
            }),
            scheduler: DelayScheduler::new("disrupt"),
        }
    }

    /// Builds an injector and applies every per-channel setting in `config`.
    pub fn from_config(
        config: &FaultInjectionConfig,
        meas_sink: MeasSink,
        cmd_sink: CommandSink,
        log: LogSink,
    ) -> Self {
        let injector = Self::new(meas_sink, cmd_sink, log, config.seed);
        for (channel, cfg) in &config.data {
            injector.set_data_degraded(channel, cfg.clone());
        }
        for (channel, cfg) in &config.command {
            injector.set_command_degraded(channel, cfg.clone());
        }
        injector
    }

    pub fn set_data_degraded(&self, channel: &str, cfg: DataDegradation) {
        let cfg = cfg.sanitized();
        let line = format!("[DISRUPT][DATA][{channel}] {cfg:?}");
        {
            let mut state = self.state.lock();
            if cfg.enabled && cfg.freeze {
                match state.last_delivered.get(channel).cloned() {
                    Some(frame) => {
                        state.frozen.insert(channel.to_string(), frame);
                    }
                    None => {
                        state.frozen.remove(channel);
                    }
                }
            } else {
                state.frozen.remove(channel);
            }
            state.data.insert(channel.to_string(), cfg);
        }
        (self.log)(&line);
    }

    pub fn set_command_degraded(&self, channel: &str, cfg: CommandDegradation) {
        let cfg = cfg.sanitized();
        let line = format!("[DISRUPT][CMD][{channel}] {cfg:?}");
        self.state.lock().command.insert(channel.to_string(), cfg);
        (self.log)(&line);
    }

    pub fn data_degradation(&self, channel: &str) -> Option<DataDegradation> {
        self.state.lock().data.get(channel).cloned()
    }

    pub fn command_degradation(&self, channel: &str) -> Option<CommandDegradation> {
        self.state.lock().command.get(channel).cloned()
    }

    pub fn clear_channel(&self, channel: &str) {
        {
            let mut state = self.state.lock();
            state.data.remove(channel);
            state.command.remove(channel);
            state.frozen.remove(channel);
        }
        (self.log)(&format!("[DISRUPT] cleared channel {channel}"));
    }

    pub fn clear_all(&self) {
        {
            let mut state = self.state.lock();
            state.data.clear();
            state.command.clear();
            state.frozen.clear();
        }
        (self.log)("[DISRUPT] cleared all channels");
    }

    /// Telemetry entry point, called from a channel's RX listener.
    pub fn on_meas(&self, channel: &str, frame: TelemetryFrame) {
        let delivery = self.state.lock().route_meas(channel, frame);
        match delivery {
            Delivery::Now(frame) => (self.meas_sink)(channel, frame),
            Delivery::Later(frame, delay) => {
                let sink = Arc::clone(&self.meas_sink);
                let name = channel.to_string();
                let scheduled = self
                    .scheduler
                    .schedule(delay, Box::new(move || sink(&name, frame)));
                if let Err(e) = scheduled {
                    (self.log)(&format!("[DISRUPT][DATA][{channel}] delayed frame lost: {e}"));
                }
            }
            Delivery::Discard => {
                (self.log)(&format!("[DISRUPT][DATA][{channel}] dropped telemetry frame"));
            }
        }
    }

    pub fn stats(&self) -> InjectionStats {
        self.state.lock().stats.clone()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Cancels every deferred delivery still pending.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

impl CommandRoute for FaultInjector {
    /// Rejects invalid writes up front, then applies the channel's command disruption.
    fn emit_cmd(
        &self,
        target: &Arc<dyn CommandTarget>,
        updates: &[(&str, f64)],
        note: &str,
    ) -> Result<(), ConfigError> {
        if let Err(e) = target.validate(updates) {
            self.state.lock().stats.commands_rejected += 1;
            return Err(e);
        }

        let channel = target.name();
        let decision = self.state.lock().route_cmd(channel);
        match decision {
            CommandDecision::Pass => (self.cmd_sink)(target, updates, note),
            CommandDecision::Later(delay) => {
                let sink = Arc::clone(&self.cmd_sink);
                let log = Arc::clone(&self.log);
                let target = Arc::clone(target);
                let owned = owned_updates(updates);
                let note = note.to_string();
                let task = Box::new(move || {
                    let borrowed: Vec<(&str, f64)> = owned.iter().map(|(k, v)| (k.as_str(), *v)).collect();
                    if let Err(e) = sink(&target, &borrowed, &note) {
                        log(&format!("[DISRUPT][CMD][{}] delayed command rejected: {e}", target.name()));
                    }
                });
                if let Err(e) = self.scheduler.schedule(delay, task) {
                    (self.log)(&format!("[DISRUPT][CMD][{channel}] delayed command lost: {e}"));
                }
                Ok(())
            }
            CommandDecision::Suppress(action) => {
                let suffix = if note.is_empty() {
                    String::new()
                } else {
                    format!(" ({note})")
                };
                (self.log)(&format!(
                    "[DISRUPT][CMD][{channel}] {action} cmd {}{suffix}",
                    format_updates(updates)
                ));
                Ok(())
            }
        }
    }
}

impl Drop for FaultInjector {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::tests::{frame, RecordingTarget};
    use crate::logging::null_sink;
    use std::thread;

    type Delivered = Arc<Mutex<Vec<(String, TelemetryFrame)>>>;

    fn injector(seed: u64) -> (FaultInjector, Delivered) {
        let delivered: Delivered = Arc::new(Mutex::new(Vec::new()));
        let sink_store = Arc::clone(&delivered);
        let meas_sink: MeasSink = Arc::new(move |channel: &str, frame: TelemetryFrame| {
            sink_store.lock().push((channel.to_string(), frame));
        });
        let cmd_sink: CommandSink = Arc::new(
            |target: &Arc<dyn CommandTarget>, updates: &[(&str, f64)], _note: &str| {
                target.set_cmd(updates).map(|_| ())
            },
        );
        (FaultInjector::new(meas_sink, cmd_sink, null_sink(), Some(seed)), delivered)
    }

    #[test]
    fn test_unconfigured_channel_passes_through() {
        let (inj, delivered) = injector(1);
        inj.on_meas("CH1", frame(0.5));
        assert_eq!(delivered.lock().len(), 1);
        assert_eq!(inj.stats().frames_passed, 1);
    }

    #[test]
    fn test_drop_prob_one_drops_every_frame() {
        let (inj, delivered) = injector(2);
        inj.set_data_degraded(
            "CH1",
            DataDegradation {
                enabled: true,
                drop_prob: 1.0,
                ..DataDegradation::default()
            },
        );
        for i in 0..50 {
            inj.on_meas("CH1", frame(i as f32));
        }
        assert!(delivered.lock().is_empty());
        assert_eq!(inj.stats().frames_dropped, 50);
    }

    #[test]
    fn test_freeze_replays_frame_captured_when_enabled() {
        let (inj, delivered) = injector(3);
        inj.on_meas("CH1", frame(1.0));
        inj.set_data_degraded(
            "CH1",
            DataDegradation {
                enabled: true,
                freeze: true,
                ..DataDegradation::default()
            },
        );
        inj.on_meas("CH1", frame(2.0));
        inj.on_meas("CH1", frame(3.0));

        let delivered = delivered.lock();
        assert_eq!(delivered.len(), 3);
        assert!(delivered[1..].iter().all(|(_, f)| *f == frame(1.0)));
    }

    #[test]
    fn test_freeze_without_history_captures_first_frame() {
        let (inj, delivered) = injector(4);
        inj.set_data_degraded(
            "CH1",
            DataDegradation {
                enabled: true,
                freeze: true,
                ..DataDegradation::default()
            },
        );
        inj.on_meas("CH1", frame(7.0));
        inj.on_meas("CH1", frame(8.0));
        let delivered = delivered.lock();
        assert_eq!(delivered[0].1, frame(7.0));
        assert_eq!(delivered[1].1, frame(7.0));
    }

    #[test]
    fn test_noise_without_selection_perturbs_integer_fields() {
        let (inj, delivered) = injector(5);
        inj.set_data_degraded(
            "CH1",
            DataDegradation {
                enabled: true,
                add_noise: true,
                noise_std: 50.0,
                ..DataDegradation::default()
            },
        );
        for _ in 0..100 {
            inj.on_meas("CH1", frame(1.0));
        }
        let delivered = delivered.lock();
        assert_eq!(delivered.len(), 100);
        let moved = delivered
            .iter()
            .filter(|(_, f)| f.get("BRK") != Some(Value::Int(1)))
            .count();
        assert!(moved > 80, "integer field moved in {moved} of 100 frames");
        assert!(delivered.iter().all(|(_, f)| matches!(f.get("BRK"), Some(Value::Int(_)))));
    }

    #[test]
    fn test_noise_selection_limits_perturbed_fields() {
        let (inj, delivered) = injector(11);
        inj.set_data_degraded(
            "CH1",
            DataDegradation {
                enabled: true,
                add_noise: true,
                noise_std: 50.0,
                fields: Some(vec!["P".to_string()]),
                ..DataDegradation::default()
            },
        );
        inj.on_meas("CH1", frame(1.0));
        let delivered = delivered.lock();
        let out = &delivered[0].1;
        assert_eq!(out.get("BRK"), Some(Value::Int(1)));
        assert_ne!(out.get("P"), Some(Value::Float(1.0)));
    }

    #[test]
    fn test_settings_are_clamped() {
        let (inj, _) = injector(6);
        inj.set_data_degraded(
            "CH1",
            DataDegradation {
                drop_prob: 3.0,
                fixed_delay_s: -1.0,
                noise_std: -0.2,
                ..DataDegradation::default()
            },
        );
        let cfg = inj.data_degradation("CH1").unwrap();
        assert_eq!(cfg.drop_prob, 1.0);
        assert_eq!(cfg.fixed_delay_s, 0.0);
        assert_eq!(cfg.noise_std, 0.0);
    }

    #[test]
    fn test_block_all_stops_every_command() {
        let (inj, _) = injector(7);
        let recorder = RecordingTarget::new("CH3", &["REM_BLOCKGEN"]);
        let target: Arc<dyn CommandTarget> = recorder.clone();
        inj.set_command_degraded(
            "CH3",
            CommandDegradation {
                enabled: true,
                block_all: true,
                ..CommandDegradation::default()
            },
        );
        for _ in 0..25 {
            inj.emit_cmd(&target, &[("REM_BLOCKGEN", 1.0)], "test").unwrap();
        }
        assert_eq!(recorder.write_count(), 0);
        assert_eq!(inj.stats().commands_blocked, 25);

        // invalid writes are still reported to the caller
        assert!(inj.emit_cmd(&target, &[("NOPE", 1.0)], "").is_err());
    }

    #[test]
    fn test_delayed_command_arrives_later() {
        let (inj, _) = injector(8);
        let recorder = RecordingTarget::new("CH3", &["REM_PREF"]);
        let target: Arc<dyn CommandTarget> = recorder.clone();
        inj.set_command_degraded(
            "CH3",
            CommandDegradation {
                enabled: true,
                fixed_delay_s: 0.05,
                ..CommandDegradation::default()
            },
        );
        inj.emit_cmd(&target, &[("REM_PREF", 0.4)], "").unwrap();
        assert_eq!(recorder.write_count(), 0);
        thread::sleep(Duration::from_millis(300));
        assert_eq!(recorder.write_count(), 1);
    }

    #[test]
    fn test_shutdown_cancels_pending_deliveries() {
        let (inj, delivered) = injector(9);
        inj.set_data_degraded(
            "CH1",
            DataDegradation {
                enabled: true,
                fixed_delay_s: 5.0,
                ..DataDegradation::default()
            },
        );
        inj.on_meas("CH1", frame(1.0));
        assert_eq!(inj.scheduler_stats().currently_scheduled, 1);
        inj.shutdown();
        assert_eq!(inj.scheduler_stats().total_cancelled, 1);
        assert!(delivered.lock().is_empty());
    }

    #[test]
    fn test_clear_channel_restores_pass_through() {
        let (inj, delivered) = injector(10);
        inj.set_data_degraded(
            "CH1",
            DataDegradation {
                enabled: true,
                drop_prob: 1.0,
                ..DataDegradation::default()
            },
        );
        inj.clear_channel("CH1");
        inj.on_meas("CH1", frame(1.0));
        assert_eq!(delivered.lock().len(), 1);
    }
}
