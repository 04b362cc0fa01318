//! Islanding and load-ramp scenario.
//!
//! The sequence is linear. Every stage waits on an explicit condition with a
//! wall-clock deadline polled at the tick period, and any unmet condition
//! aborts the whole run with a diagnostic and a final signal snapshot. All
//! channels are disconnected on every exit path.

use crate::bus::{Bus, CommandRoute};
use crate::channel::CommandTarget;
use crate::commands;
use crate::config::{GENERATOR_CHANNEL, LOAD_CHANNEL, PCC_CHANNEL, STORAGE_CHANNEL};
use crate::controller::{
    ControllerInputs, GeneratorCommandNames, GeneratorSignalNames, SupervisoryController,
};
use crate::error::ConfigError;
use crate::logging::{wall_stamp, LogSink};
use crate::stability::{Sample, SignalRef, StabilityLimits, StabilityWindow};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Settle,
    WaitRemoteMode,
    ArmDefaults,
    CloseGridTie,
    StabilizeTied,
    ProtectionClear,
    EnableGenerator,
    EnsureGeneratorClosed,
    EnableStorage,
    StabilizeEnabled,
    VerifyGeneratorReady,
    Island,
    StabilizeIslanded,
    IslandPrecondition,
    Ramp,
    Hold,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Settle => "settle",
            Stage::WaitRemoteMode => "wait-remote-mode",
            Stage::ArmDefaults => "arm-defaults",
            Stage::CloseGridTie => "close-grid-tie",
            Stage::StabilizeTied => "stabilize-tied",
            Stage::ProtectionClear => "protection-clear",
            Stage::EnableGenerator => "enable-generator",
            Stage::EnsureGeneratorClosed => "ensure-generator-closed",
            Stage::EnableStorage => "enable-storage",
            Stage::StabilizeEnabled => "stabilize-enabled",
            Stage::VerifyGeneratorReady => "verify-generator-ready",
            Stage::Island => "island",
            Stage::StabilizeIslanded => "stabilize-islanded",
            Stage::IslandPrecondition => "island-precondition",
            Stage::Ramp => "ramp",
            Stage::Hold => "hold",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AbortCause {
    /// A wait-with-timeout expired before its condition held.
    ConditionTimeout,
    NotStable,
    InterlockUnmet,
    GeneratorDidNotEngage,
    /// Generator breaker opened after a sustained overload.
    ProtectionTrip,
    /// Generator breaker opened without a sustained overload.
    UnexplainedDisconnect,
    BothDisconnected,
    DetectionSustained,
    Command(ConfigError),
}

/// Key generator signals captured when a scenario stops.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FinalSnapshot {
    pub channel: String,
    pub values: Vec<(String, Option<f64>)>,
}

impl fmt::Display for FinalSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .values
            .iter()
            .map(|(name, v)| match v {
                Some(v) => format!("{name}={v}"),
                None => format!("{name}=-"),
            })
            .collect();
        write!(f, "[{}] {{{}}}", self.channel, parts.join(", "))
    }
}

#[derive(Debug, Clone, Error)]
#[error("[{stage}] {message}")]
pub struct ScenarioError {
    pub stage: Stage,
    pub cause: AbortCause,
    pub message: String,
    pub elapsed_since_ramp: Option<Duration>,
    pub snapshot: FinalSnapshot,
}

#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub stages: Vec<Stage>,
    pub generator_close_attempts: u32,
    pub ramp_ticks: usize,
    pub final_load: f64,
    pub endurance: Duration,
    pub snapshot: FinalSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioChannels {
    pub grid: String,
    pub storage: String,
    pub generator: String,
    pub load: String,
}

impl Default for ScenarioChannels {
    fn default() -> Self {
        Self {
            grid: PCC_CHANNEL.into(),
            storage: STORAGE_CHANNEL.into(),
            generator: GENERATOR_CHANNEL.into(),
            load: LOAD_CHANNEL.into(),
        }
    }
}

/// Telemetry field names. Mode and tie breaker live on the grid channel, the
/// rest on the generator channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioSignals {
    pub mode: String,
    pub grid_breaker: String,
    pub generator_breaker: String,
    pub overloaded: String,
    pub detection: String,
    pub generator: GeneratorSignalNames,
}

impl Default for ScenarioSignals {
    fn default() -> Self {
        Self {
            mode: "MODE".into(),
            grid_breaker: "GRID".into(),
            generator_breaker: "BRKGEN".into(),
            overloaded: "OVERLOADED".into(),
            detection: "W_DETECTED".into(),
            generator: GeneratorSignalNames::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioCommands {
    pub grid_breaker: String,
    pub load_active: String,
    pub load_reactive: String,
    pub storage_breaker: String,
    pub storage_enable: String,
    pub storage_check_reset: String,
    pub storage_active: String,
    pub storage_reactive: String,
    pub generator: GeneratorCommandNames,
}

impl Default for ScenarioCommands {
    fn default() -> Self {
        Self {
            grid_breaker: "REM_GRID".into(),
            load_active: "REM_PLOAD".into(),
            load_reactive: "REM_QLOAD".into(),
            storage_breaker: "REM_BESSBRK".into(),
            storage_enable: "REM_BLOCK".into(),
            storage_check_reset: "REM_CHKRESET".into(),
            storage_active: "REM_Preftest".into(),
            storage_reactive: "REM_Qreftest".into(),
            generator: GeneratorCommandNames::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RampProfile {
    pub start: f64,
    pub end: f64,
    pub reactive: f64,
    pub duration_s: f64,
    pub perturbation: bool,
    pub perturbation_amplitude: f64,
    pub perturbation_hz: f64,
}

impl Default for RampProfile {
    fn default() -> Self {
        Self {
            start: 0.8,
            end: 2.0,
            reactive: 0.003,
            duration_s: 20.0,
            perturbation: false,
            perturbation_amplitude: 0.02,
            perturbation_hz: 0.5,
        }
    }
}

/// Retry policy for getting the generator breaker closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorEngagement {
    pub max_tries: u32,
    pub reset_pulse_s: f64,
    pub wait_after_try_s: f64,
    pub breaker_timeout_s: f64,
    pub detection_clear_timeout_s: f64,
}

impl Default for GeneratorEngagement {
    fn default() -> Self {
        Self {
            max_tries: 5,
            reset_pulse_s: 0.1,
            wait_after_try_s: 0.3,
            breaker_timeout_s: 3.0,
            detection_clear_timeout_s: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    pub tick_s: f64,
    pub comms_settle_s: f64,
    pub remote_mode_timeout_s: f64,
    pub grid_close_timeout_s: f64,
    pub grid_open_timeout_s: f64,
    pub stable_timeout_s: f64,
    pub protection_clear_timeout_s: f64,
    pub pre_island_timeout_s: f64,
    pub hold_s: f64,

    pub storage_active_ref: f64,
    pub storage_reactive_ref: f64,
    pub storage_check_reset_pulse_s: f64,

    /// Generator setpoints used when no controller is attached.
    pub generator_speed_ref: f64,
    pub generator_power_ref: f64,

    pub overload_sustain_samples: u32,
    pub detection_sustain_samples: u32,
    pub final_snapshot_fields: Vec<String>,

    pub channels: ScenarioChannels,
    pub signals: ScenarioSignals,
    pub commands: ScenarioCommands,
    pub ramp: RampProfile,
    pub engagement: GeneratorEngagement,
    pub stability: StabilityLimits,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            tick_s: 0.05,
            comms_settle_s: 5.0,
            remote_mode_timeout_s: 10.0,
            grid_close_timeout_s: 5.0,
            grid_open_timeout_s: 5.0,
            stable_timeout_s: 40.0,
            protection_clear_timeout_s: 10.0,
            pre_island_timeout_s: 1.0,
            hold_s: 5.0,
            storage_active_ref: 0.3,
            storage_reactive_ref: 0.0,
            storage_check_reset_pulse_s: 0.1,
            generator_speed_ref: 1.0,
            generator_power_ref: 0.0035,
            overload_sustain_samples: 3,
            detection_sustain_samples: 3,
            final_snapshot_fields: ["BRKGEN", "SMACH", "OVERLOADED", "WPU", "W_DETECTED"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            channels: ScenarioChannels::default(),
            signals: ScenarioSignals::default(),
            commands: ScenarioCommands::default(),
            ramp: RampProfile::default(),
            engagement: GeneratorEngagement::default(),
            stability: StabilityLimits::default(),
        }
    }
}

impl SequencerConfig {
    pub fn tick(&self) -> Duration {
        secs(self.tick_s)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let check = |ok: bool, what: &str| {
            if ok {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("scenario: {what}")))
            }
        };

        check(self.tick_s.is_finite() && self.tick_s > 0.0, "tick must be positive")?;
        let waits = [
            self.comms_settle_s,
            self.remote_mode_timeout_s,
            self.grid_close_timeout_s,
            self.grid_open_timeout_s,
            self.stable_timeout_s,
            self.protection_clear_timeout_s,
            self.pre_island_timeout_s,
            self.hold_s,
            self.engagement.wait_after_try_s,
            self.engagement.breaker_timeout_s,
            self.engagement.detection_clear_timeout_s,
        ];
        check(
            waits.iter().all(|w| w.is_finite() && *w >= 0.0),
            "timeouts must be non-negative",
        )?;
        check(
            self.storage_check_reset_pulse_s > 0.0 && self.engagement.reset_pulse_s > 0.0,
            "pulse widths must be positive",
        )?;
        check(self.ramp.duration_s > 0.0, "ramp duration must be positive")?;
        check(self.engagement.max_tries >= 1, "generator engagement needs at least one try")?;
        check(
            self.overload_sustain_samples >= 1 && self.detection_sustain_samples >= 1,
            "sustain counts must be at least 1",
        )?;
        check(self.stability.min_samples >= 1, "stability window needs at least one sample")?;
        check(
            (0.0..=1.0).contains(&self.stability.required_fraction),
            "required fraction must be within [0, 1]",
        )
    }

    /// Every telemetry field the scenario reads.
    pub fn signal_refs(&self) -> Vec<SignalRef> {
        let grid = &self.channels.grid;
        let generator = &self.channels.generator;
        let s = &self.signals;

        let mut refs = vec![
            SignalRef::new(grid, &s.mode),
            SignalRef::new(grid, &s.grid_breaker),
            SignalRef::new(generator, &s.generator_breaker),
            SignalRef::new(generator, &s.overloaded),
            SignalRef::new(generator, &s.detection),
            SignalRef::new(generator, &s.generator.loading),
            SignalRef::new(generator, &s.generator.voltage),
            SignalRef::new(generator, &s.generator.speed),
            SignalRef::new(generator, &s.generator.overloaded),
        ];
        refs.extend(self.stability.signals.iter().map(|m| m.signal.clone()));
        refs.extend(self.stability.protection_flags.iter().cloned());
        refs.extend(
            self.final_snapshot_fields
                .iter()
                .map(|f| SignalRef::new(generator, f)),
        );
        refs
    }

    /// Every command field the scenario writes.
    pub fn command_refs(&self) -> Vec<SignalRef> {
        let ch = &self.channels;
        let c = &self.commands;
        vec![
            SignalRef::new(&ch.grid, &c.grid_breaker),
            SignalRef::new(&ch.load, &c.load_active),
            SignalRef::new(&ch.load, &c.load_reactive),
            SignalRef::new(&ch.storage, &c.storage_breaker),
            SignalRef::new(&ch.storage, &c.storage_enable),
            SignalRef::new(&ch.storage, &c.storage_check_reset),
            SignalRef::new(&ch.storage, &c.storage_active),
            SignalRef::new(&ch.storage, &c.storage_reactive),
            SignalRef::new(&ch.generator, &c.generator.enable),
            SignalRef::new(&ch.generator, &c.generator.speed_ref),
            SignalRef::new(&ch.generator, &c.generator.power_ref),
            SignalRef::new(&ch.generator, &c.generator.reset),
        ]
    }
}

fn secs(s: f64) -> Duration {
    Duration::from_secs_f64(if s.is_finite() { s.max(0.0) } else { 0.0 })
}

fn show(v: Option<i64>) -> String {
    v.map_or_else(|| "-".to_string(), |v| v.to_string())
}

/// Collaborators the sequencer drives. Commands go through `route`, which is
/// either the bus itself or the fault injector in front of it.
#[derive(Clone)]
pub struct ScenarioContext {
    pub bus: Arc<Bus>,
    pub route: Arc<dyn CommandRoute>,
    pub grid: Arc<dyn CommandTarget>,
    pub storage: Arc<dyn CommandTarget>,
    pub generator: Arc<dyn CommandTarget>,
    pub load: Arc<dyn CommandTarget>,
    pub log: LogSink,
}

/// Disconnects every target when dropped, so teardown also runs on unwind.
struct Teardown {
    targets: [Arc<dyn CommandTarget>; 4],
    log: LogSink,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        for target in &self.targets {
            target.disconnect();
        }
        let names: Vec<&str> = self.targets.iter().map(|t| t.name()).collect();
        (self.log)(&format!(
            "[{}] Stopped {}.",
            wall_stamp(SystemTime::now()),
            names.join(", ")
        ));
    }
}

/// Consecutive-sample trip detection shared by the ramp and the hold.
struct TripMonitor {
    prev_breaker: Option<i64>,
    overload_run: u32,
    detection_run: u32,
}

pub struct TestSequencer {
    config: SequencerConfig,
    ctx: ScenarioContext,
    controller: Option<SupervisoryController>,

    stage: Stage,
    stages: Vec<Stage>,
    ramp_start: Option<Instant>,
    ramp_ticks: usize,
    final_load: f64,
    endurance: Duration,
    close_attempts: u32,
}

impl TestSequencer {
    /// Without a controller the generator holds its configured setpoints and
    /// the ramp only drives the load.
    pub fn new(
        config: SequencerConfig,
        ctx: ScenarioContext,
        controller: Option<SupervisoryController>,
    ) -> Self {
        let final_load = config.ramp.start;
        Self {
            config,
            ctx,
            controller,
            stage: Stage::Settle,
            stages: Vec::new(),
            ramp_start: None,
            ramp_ticks: 0,
            final_load,
            endurance: Duration::ZERO,
            close_attempts: 0,
        }
    }

    pub fn run(mut self) -> Result<ScenarioReport, ScenarioError> {
        let teardown = Teardown {
            targets: [
                Arc::clone(&self.ctx.grid),
                Arc::clone(&self.ctx.storage),
                Arc::clone(&self.ctx.generator),
                Arc::clone(&self.ctx.load),
            ],
            log: Arc::clone(&self.ctx.log),
        };

        let outcome = self.execute();
        if let Err(e) = &outcome {
            self.log(&format!("TEST STOP: {e}"));
            self.log(&format!("FINAL {}", e.snapshot));
        }
        drop(teardown);

        outcome.map(|()| ScenarioReport {
            stages: self.stages.clone(),
            generator_close_attempts: self.close_attempts,
            ramp_ticks: self.ramp_ticks,
            final_load: self.final_load,
            endurance: self.endurance,
            snapshot: self.snapshot(),
        })
    }

    fn execute(&mut self) -> Result<(), ScenarioError> {
        let grid_ch = self.config.channels.grid.clone();
        let gen_ch = self.config.channels.generator.clone();
        let signals = self.config.signals.clone();
        let cmds = self.config.commands.clone();
        let (speed_ref, power_ref) = match &self.controller {
            Some(c) => (c.config().speed_ref_base, c.config().power_ref_base),
            None => (self.config.generator_speed_ref, self.config.generator_power_ref),
        };

        self.enter(Stage::Settle);
        thread::sleep(secs(self.config.comms_settle_s));

        self.enter(Stage::WaitRemoteMode);
        let timeout = self.config.remote_mode_timeout_s;
        if !self.wait_value(&grid_ch, &signals.mode, 1, secs(timeout)) {
            return Err(self.abort(
                AbortCause::ConditionTimeout,
                format!(
                    "remote mode not asserted: {grid_ch}.{} != 1 after {timeout:.1}s (last {})",
                    signals.mode,
                    show(self.read_int(&grid_ch, &signals.mode))
                ),
            ));
        }

        self.enter(Stage::ArmDefaults);
        let ramp = self.config.ramp.clone();
        self.emit(
            &self.ctx.load,
            &[(cmds.load_active.as_str(), ramp.start), (cmds.load_reactive.as_str(), ramp.reactive)],
            "defaults: load",
        )?;
        self.emit(
            &self.ctx.storage,
            &[
                (cmds.storage_breaker.as_str(), 1.0),
                (cmds.storage_active.as_str(), self.config.storage_active_ref),
                (cmds.storage_reactive.as_str(), self.config.storage_reactive_ref),
                (cmds.storage_check_reset.as_str(), 0.0),
            ],
            "defaults: storage breaker",
        )?;
        self.pulse(
            &self.ctx.storage,
            &cmds.storage_check_reset,
            secs(self.config.storage_check_reset_pulse_s),
        )?;
        self.emit(
            &self.ctx.generator,
            &[
                (cmds.generator.speed_ref.as_str(), speed_ref),
                (cmds.generator.power_ref.as_str(), power_ref),
                (cmds.generator.reset.as_str(), 0.0),
            ],
            "defaults: generator setpoints",
        )?;

        self.enter(Stage::CloseGridTie);
        self.emit(&self.ctx.grid, &[(cmds.grid_breaker.as_str(), 1.0)], "close grid tie")?;
        let timeout = self.config.grid_close_timeout_s;
        if !self.wait_value(&grid_ch, &signals.grid_breaker, 1, secs(timeout)) {
            return Err(self.abort(
                AbortCause::ConditionTimeout,
                format!(
                    "grid tie breaker did not close: {grid_ch}.{gb} != 1 within {timeout:.1}s ({gb}={})",
                    show(self.read_int(&grid_ch, &signals.grid_breaker)),
                    gb = signals.grid_breaker
                ),
            ));
        }

        self.enter(Stage::StabilizeTied);
        self.require_stable("while grid-connected")?;

        self.enter(Stage::ProtectionClear);
        let timeout = self.config.protection_clear_timeout_s;
        if !self.wait_value(&gen_ch, &signals.detection, 0, secs(timeout)) {
            return Err(self.abort(
                AbortCause::InterlockUnmet,
                format!(
                    "{gen_ch}.{d} did not clear before enabling the generator within {timeout:.1}s ({d}={})",
                    show(self.read_int(&gen_ch, &signals.detection)),
                    d = signals.detection
                ),
            ));
        }

        self.enter(Stage::EnableGenerator);
        self.emit(
            &self.ctx.generator,
            &[
                (cmds.generator.enable.as_str(), 1.0),
                (cmds.generator.speed_ref.as_str(), speed_ref),
                (cmds.generator.power_ref.as_str(), power_ref),
                (cmds.generator.reset.as_str(), 0.0),
            ],
            "enable generator",
        )?;

        self.enter(Stage::EnsureGeneratorClosed);
        self.ensure_generator_closed()?;

        self.enter(Stage::EnableStorage);
        self.emit(
            &self.ctx.storage,
            &[
                (cmds.storage_enable.as_str(), 1.0),
                (cmds.storage_breaker.as_str(), 1.0),
                (cmds.storage_active.as_str(), self.config.storage_active_ref),
                (cmds.storage_reactive.as_str(), self.config.storage_reactive_ref),
                (cmds.storage_check_reset.as_str(), 0.0),
            ],
            "enable storage",
        )?;
        self.pulse(
            &self.ctx.storage,
            &cmds.storage_check_reset,
            secs(self.config.storage_check_reset_pulse_s),
        )?;

        self.enter(Stage::StabilizeEnabled);
        self.require_stable("after enabling generator and storage")?;

        self.enter(Stage::VerifyGeneratorReady);
        let timeout = self.config.pre_island_timeout_s;
        if !self.wait_value(&gen_ch, &signals.generator_breaker, 1, secs(timeout)) {
            return Err(self.abort(
                AbortCause::InterlockUnmet,
                format!(
                    "generator breaker not closed right before islanding: {gen_ch}.{b} != 1 ({b}={})",
                    show(self.read_int(&gen_ch, &signals.generator_breaker)),
                    b = signals.generator_breaker
                ),
            ));
        }

        self.enter(Stage::Island);
        self.emit(&self.ctx.grid, &[(cmds.grid_breaker.as_str(), 0.0)], "island: open grid tie")?;
        let timeout = self.config.grid_open_timeout_s;
        if !self.wait_value(&grid_ch, &signals.grid_breaker, 0, secs(timeout)) {
            return Err(self.abort(
                AbortCause::ConditionTimeout,
                format!(
                    "grid tie breaker did not open: {grid_ch}.{gb} != 0 within {timeout:.1}s ({gb}={})",
                    show(self.read_int(&grid_ch, &signals.grid_breaker)),
                    gb = signals.grid_breaker
                ),
            ));
        }

        self.enter(Stage::StabilizeIslanded);
        self.require_stable("after islanding")?;

        self.enter(Stage::IslandPrecondition);
        let grid = self.read_int(&grid_ch, &signals.grid_breaker);
        let breaker = self.read_int(&gen_ch, &signals.generator_breaker);
        if grid != Some(1) && breaker != Some(1) {
            return Err(self.abort(
                AbortCause::BothDisconnected,
                format!(
                    "load ramp forbidden: generator and grid both disconnected ({}={}, {}={})",
                    signals.grid_breaker,
                    show(grid),
                    signals.generator_breaker,
                    show(breaker)
                ),
            ));
        }

        self.enter(Stage::Ramp);
        let mut monitor = self.ramp()?;

        self.enter(Stage::Hold);
        self.hold(&mut monitor)?;

        self.enter(Stage::Done);
        Ok(())
    }

    fn ensure_generator_closed(&mut self) -> Result<(), ScenarioError> {
        let gen_ch = self.config.channels.generator.clone();
        let signals = self.config.signals.clone();
        let names = self.config.commands.generator.clone();
        let policy = self.config.engagement.clone();

        for attempt in 1..=policy.max_tries {
            self.close_attempts = attempt;
            self.emit(
                &self.ctx.generator,
                &[(names.enable.as_str(), 1.0), (names.reset.as_str(), 0.0)],
                &format!("generator engage: arm try {attempt}"),
            )?;

            if !self.wait_value(&gen_ch, &signals.detection, 0, secs(policy.detection_clear_timeout_s)) {
                self.log(&format!(
                    "generator engage try {attempt}: {} did not clear ({}={}), skipping reset pulse",
                    signals.detection,
                    signals.detection,
                    show(self.read_int(&gen_ch, &signals.detection))
                ));
                thread::sleep(secs(policy.wait_after_try_s));
                continue;
            }

            self.pulse(&self.ctx.generator, &names.reset, secs(policy.reset_pulse_s))?;
            thread::sleep(secs(policy.wait_after_try_s));

            if self.wait_value(&gen_ch, &signals.generator_breaker, 1, secs(policy.breaker_timeout_s)) {
                self.log(&format!("generator engaged on try {attempt}"));
                return Ok(());
            }
        }

        Err(self.abort(
            AbortCause::GeneratorDidNotEngage,
            format!(
                "generator did not engage: {gen_ch}.{} never reached 1 after {} tries",
                signals.generator_breaker, policy.max_tries
            ),
        ))
    }

    fn ramp(&mut self) -> Result<TripMonitor, ScenarioError> {
        let tick = self.config.tick();
        let tick_s = tick.as_secs_f64();
        let ramp = self.config.ramp.clone();
        let load_active = self.config.commands.load_active.clone();
        let load_reactive = self.config.commands.load_reactive.clone();

        let steps = ((ramp.duration_s / tick_s) as usize).max(1);
        let rate = (ramp.end - ramp.start) / ramp.duration_s.max(0.001);

        let mut monitor = TripMonitor {
            prev_breaker: self.read_int(&self.config.channels.generator, &self.config.signals.generator_breaker),
            overload_run: 0,
            detection_run: 0,
        };

        let start = Instant::now();
        self.ramp_start = Some(start);
        self.log(&format!(
            "starting load ramp {:.3} -> {:.3} over {:.1}s ({})",
            ramp.start,
            ramp.end,
            ramp.duration_s,
            if self.controller.is_some() { "closed loop" } else { "open loop" }
        ));

        for k in 0..=steps {
            self.check_trips(&mut monitor)?;

            let mut p = ramp.start + k as f64 * rate * tick_s;
            p = if rate >= 0.0 { p.min(ramp.end) } else { p.max(ramp.end) };
            if ramp.perturbation {
                let t = start.elapsed().as_secs_f64();
                p += ramp.perturbation_amplitude * (2.0 * PI * ramp.perturbation_hz * t).sin();
                p = p.max(0.0);
            }

            self.emit(
                &self.ctx.load,
                &[(load_active.as_str(), p), (load_reactive.as_str(), ramp.reactive)],
                "ramp load",
            )?;
            self.final_load = p;
            self.ramp_ticks += 1;

            self.step_controller(tick)?;
            thread::sleep(tick);
        }

        self.endurance = start.elapsed();
        self.log(&format!(
            "ramp finished without collapse, endurance {:.3}s since ramp start",
            self.endurance.as_secs_f64()
        ));
        Ok(monitor)
    }

    fn hold(&mut self, monitor: &mut TripMonitor) -> Result<(), ScenarioError> {
        let tick = self.config.tick();
        let deadline = Instant::now() + secs(self.config.hold_s);
        self.log(&format!("holding last load for {:.1}s", self.config.hold_s));
        while Instant::now() < deadline {
            self.check_trips(monitor)?;
            self.step_controller(tick)?;
            thread::sleep(tick);
        }
        Ok(())
    }

    fn step_controller(&mut self, tick: Duration) -> Result<(), ScenarioError> {
        let Some(controller) = self.controller.as_mut() else {
            return Ok(());
        };
        let now = Instant::now();
        let max_stale = secs(controller.config().max_stale_s);
        let (inputs, measured_at) = match self.ctx.bus.get_meas(&self.config.channels.generator) {
            Some(timed) => {
                let age = SystemTime::now().duration_since(timed.at).unwrap_or_default();
                if age > max_stale {
                    (ControllerInputs::default(), None)
                } else {
                    let inputs = ControllerInputs::from_frame(&timed.frame, &self.config.signals.generator);
                    (inputs, Some(now.checked_sub(age).unwrap_or(now)))
                }
            }
            None => (ControllerInputs::default(), None),
        };
        let command = controller.update_measured(&inputs, measured_at, tick, now);

        let updates = command.to_updates(&self.config.commands.generator);
        self.emit(&self.ctx.generator, &updates, "generator controller")
    }

    fn check_trips(&self, monitor: &mut TripMonitor) -> Result<(), ScenarioError> {
        let grid_ch = &self.config.channels.grid;
        let gen_ch = &self.config.channels.generator;
        let s = &self.config.signals;

        let grid = self.read_int(grid_ch, &s.grid_breaker);
        let breaker = self.read_int(gen_ch, &s.generator_breaker);
        let overloaded = self.read_int(gen_ch, &s.overloaded);
        let detection = self.read_int(gen_ch, &s.detection);

        monitor.overload_run = if overloaded == Some(1) { monitor.overload_run + 1 } else { 0 };
        monitor.detection_run = if detection == Some(1) { monitor.detection_run + 1 } else { 0 };

        let opened = monitor.prev_breaker == Some(1) && breaker == Some(0);
        monitor.prev_breaker = breaker;
        if opened {
            let sustain = self.config.overload_sustain_samples;
            return Err(if monitor.overload_run >= sustain {
                self.abort(
                    AbortCause::ProtectionTrip,
                    format!(
                        "protection trip: generator disconnected after {} held for {} samples",
                        s.overloaded, monitor.overload_run
                    ),
                )
            } else {
                self.abort(
                    AbortCause::UnexplainedDisconnect,
                    format!(
                        "generator disconnected without sustained {} ({}={}, {}=0, {}={})",
                        s.overloaded,
                        s.grid_breaker,
                        show(grid),
                        s.generator_breaker,
                        s.overloaded,
                        show(overloaded)
                    ),
                )
            });
        }

        if grid != Some(1) && breaker != Some(1) {
            return Err(self.abort(
                AbortCause::BothDisconnected,
                format!(
                    "generator and grid both disconnected ({}={}, {}={}, {}={})",
                    s.grid_breaker,
                    show(grid),
                    s.generator_breaker,
                    show(breaker),
                    s.overloaded,
                    show(overloaded)
                ),
            ));
        }

        if monitor.detection_run >= self.config.detection_sustain_samples {
            return Err(self.abort(
                AbortCause::DetectionSustained,
                format!("{} asserted for {} consecutive samples", s.detection, monitor.detection_run),
            ));
        }
        Ok(())
    }

    fn enter(&mut self, stage: Stage) {
        self.stage = stage;
        self.stages.push(stage);
        self.log(&format!("stage {stage}"));
    }

    fn log(&self, msg: &str) {
        (self.ctx.log)(&format!("[{}] {msg}", wall_stamp(SystemTime::now())));
    }

    fn read_int(&self, channel: &str, field: &str) -> Option<i64> {
        self.ctx.bus.value(channel, field).map(|v| v as i64)
    }

    fn snapshot(&self) -> FinalSnapshot {
        let channel = &self.config.channels.generator;
        FinalSnapshot {
            channel: channel.clone(),
            values: self
                .config
                .final_snapshot_fields
                .iter()
                .map(|f| (f.clone(), self.ctx.bus.value(channel, f)))
                .collect(),
        }
    }

    fn abort(&self, cause: AbortCause, message: String) -> ScenarioError {
        let elapsed = self.ramp_start.map(|t| t.elapsed());
        let message = match elapsed {
            Some(e) => format!("{message}; endurance {:.3}s since ramp start", e.as_secs_f64()),
            None => message,
        };
        ScenarioError {
            stage: self.stage,
            cause,
            message,
            elapsed_since_ramp: elapsed,
            snapshot: self.snapshot(),
        }
    }

    fn emit(
        &self,
        target: &Arc<dyn CommandTarget>,
        updates: &[(&str, f64)],
        note: &str,
    ) -> Result<(), ScenarioError> {
        self.ctx
            .route
            .emit_cmd(target, updates, note)
            .map_err(|e| self.abort(AbortCause::Command(e.clone()), format!("command rejected: {e}")))
    }

    fn pulse(&self, target: &Arc<dyn CommandTarget>, field: &str, width: Duration) -> Result<(), ScenarioError> {
        commands::pulse(self.ctx.route.as_ref(), target, field, width)
            .map_err(|e| self.abort(AbortCause::Command(e.clone()), format!("command rejected: {e}")))
    }

    /// Polls until `channel.field == expected` or the deadline passes. A
    /// missing value never satisfies the wait.
    fn wait_value(&self, channel: &str, field: &str, expected: i64, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.read_int(channel, field) == Some(expected))
    }

    fn wait_until(&self, timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let tick = self.config.tick();
        let deadline = Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(tick.min(deadline - now));
        }
    }

    fn require_stable(&self, context: &str) -> Result<(), ScenarioError> {
        let limits = &self.config.stability;
        let mut window = StabilityWindow::new(limits.window_len(self.config.tick()));
        let timeout = self.config.stable_timeout_s;
        let stable = self.wait_until(secs(timeout), || {
            window.push(Sample::capture(&self.ctx.bus, limits));
            window.is_stable(limits)
        });
        if stable {
            Ok(())
        } else {
            Err(self.abort(
                AbortCause::NotStable,
                format!("did not reach stable condition {context} within {timeout:.1}s"),
            ))
        }
    }
}
