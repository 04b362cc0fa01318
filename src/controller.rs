//! Supervisory setpoint controller for the generator.
//!
//! The controller never retunes the plant. It only nudges the speed and power
//! references and manages the enable and reset bits, always through clamps
//! and rate limiters so a degraded measurement cannot make the output jump.

use crate::error::ConfigError;
use crate::protocol::TelemetryFrame;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// First-order low-pass. The first sample passes through unfiltered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LowPass {
    tau: f64,
    y: Option<f64>,
}

impl LowPass {
    pub fn new(tau: f64) -> Self {
        Self { tau, y: None }
    }

    pub fn step(&mut self, x: f64, dt: f64) -> f64 {
        let y = match self.y {
            Some(prev) if self.tau > 0.0 => {
                let a = dt / (self.tau + dt);
                (1.0 - a) * prev + a * x
            }
            _ => x,
        };
        self.y = Some(y);
        y
    }

    pub fn value(&self) -> Option<f64> {
        self.y
    }
}

/// Asymmetric slew limiter: `up` and `down` are in units per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiter {
    up: f64,
    down: f64,
    y: f64,
}

impl RateLimiter {
    pub fn new(up: f64, down: f64, initial: f64) -> Self {
        Self { up, down, y: initial }
    }

    pub fn step(&mut self, target: f64, dt: f64) -> f64 {
        let dy = (target - self.y).clamp(-self.down * dt, self.up * dt);
        self.y += dy;
        self.y
    }

    /// Forces the internal state, e.g. to the value being held.
    pub fn reset_to(&mut self, y: f64) {
        self.y = y;
    }

    pub fn value(&self) -> f64 {
        self.y
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverloadState {
    Normal,
    SoftRideThrough,
    TripPendingReset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub speed_ref_base: f64,
    pub power_ref_base: f64,
    pub speed_ref_min: f64,
    pub speed_ref_max: f64,
    pub power_ref_min: f64,
    pub power_ref_max: f64,

    pub speed_target: f64,
    pub speed_deadband: f64,

    /// Hard loading limit (apparent power, pu).
    pub loading_limit: f64,
    /// Protection starts this far below the hard limit.
    pub loading_margin: f64,

    pub voltage_min: f64,
    pub voltage_soft: f64,

    pub k_power_from_speed: f64,
    pub k_speed_ref_from_speed: f64,

    pub filter_tau_s: f64,
    pub speed_ref_rate_up: f64,
    pub speed_ref_rate_down: f64,
    pub power_ref_rate_up: f64,
    pub power_ref_rate_down: f64,

    pub max_stale_s: f64,

    pub overload_soft_drop: f64,
    pub overload_hard_after_s: f64,
    pub reset_pulse_s: f64,

    /// When false the controller slews back to base setpoints with enable asserted.
    pub enabled: bool,
    /// Forces the enable bit regardless of the overload logic.
    pub enable_override: Option<bool>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            speed_ref_base: 1.0,
            power_ref_base: 0.0,
            speed_ref_min: 0.98,
            speed_ref_max: 1.02,
            power_ref_min: -1.0,
            power_ref_max: 1.0,
            speed_target: 1.0,
            speed_deadband: 0.0015,
            loading_limit: 1.5,
            loading_margin: 0.05,
            voltage_min: 0.92,
            voltage_soft: 0.96,
            k_power_from_speed: 2.0,
            k_speed_ref_from_speed: 0.2,
            filter_tau_s: 0.15,
            speed_ref_rate_up: 0.01,
            speed_ref_rate_down: 0.02,
            power_ref_rate_up: 0.2,
            power_ref_rate_down: 0.3,
            max_stale_s: 0.5,
            overload_soft_drop: 0.3,
            overload_hard_after_s: 1.0,
            reset_pulse_s: 0.1,
            enabled: true,
            enable_override: None,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let check = |ok: bool, what: &str| {
            if ok {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("controller: {what}")))
            }
        };

        check(
            self.speed_ref_min <= self.speed_ref_base && self.speed_ref_base <= self.speed_ref_max,
            "speed reference base must lie within its limits",
        )?;
        check(
            self.power_ref_min <= self.power_ref_base && self.power_ref_base <= self.power_ref_max,
            "power reference base must lie within its limits",
        )?;
        check(self.loading_margin > 0.0, "loading margin must be positive")?;
        check(self.voltage_min < self.voltage_soft, "voltage_min must be below voltage_soft")?;
        check(self.speed_deadband >= 0.0, "speed deadband must be non-negative")?;
        check(self.filter_tau_s >= 0.0, "filter time constant must be non-negative")?;
        check(
            [
                self.speed_ref_rate_up,
                self.speed_ref_rate_down,
                self.power_ref_rate_up,
                self.power_ref_rate_down,
            ]
            .iter()
            .all(|r| r.is_finite() && *r > 0.0),
            "rate limits must be positive",
        )?;
        check(self.max_stale_s > 0.0, "staleness window must be positive")?;
        check(self.overload_hard_after_s >= 0.0, "overload hard-trip delay must be non-negative")?;
        check(self.reset_pulse_s > 0.0, "reset pulse must be positive")
    }
}

/// Generator telemetry field names the controller reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorSignalNames {
    pub loading: String,
    pub voltage: String,
    pub speed: String,
    pub overloaded: String,
}

impl Default for GeneratorSignalNames {
    fn default() -> Self {
        Self {
            loading: "SMACH".into(),
            voltage: "GENRMSPU".into(),
            speed: "WPU".into(),
            overloaded: "OVERLOADED".into(),
        }
    }
}

/// Generator command field names the controller writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorCommandNames {
    pub enable: String,
    pub speed_ref: String,
    pub power_ref: String,
    pub reset: String,
}

impl Default for GeneratorCommandNames {
    fn default() -> Self {
        Self {
            enable: "REM_BLOCKGEN".into(),
            speed_ref: "REM_Wref".into(),
            power_ref: "REM_PREF".into(),
            reset: "REM_RESETGEN".into(),
        }
    }
}

/// One step's measurements. `None` (or a non-finite value) means unavailable.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ControllerInputs {
    pub loading: Option<f64>,
    pub voltage: Option<f64>,
    pub speed: Option<f64>,
    pub overloaded: Option<bool>,
}

impl ControllerInputs {
    pub fn from_frame(frame: &TelemetryFrame, names: &GeneratorSignalNames) -> Self {
        Self {
            loading: frame.get_f64(&names.loading),
            voltage: frame.get_f64(&names.voltage),
            speed: frame.get_f64(&names.speed),
            overloaded: frame.get_f64(&names.overloaded).map(|v| v != 0.0),
        }
    }

    fn usable(&self) -> bool {
        finite(self.loading).is_some() || finite(self.speed).is_some() || self.overloaded.is_some()
    }
}

fn finite(x: Option<f64>) -> Option<f64> {
    x.filter(|v| v.is_finite())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SetpointCommand {
    pub enable: bool,
    pub speed_ref: f64,
    pub power_ref: f64,
    pub reset: bool,
}

impl SetpointCommand {
    pub fn to_updates<'a>(&self, names: &'a GeneratorCommandNames) -> [(&'a str, f64); 4] {
        [
            (names.enable.as_str(), if self.enable { 1.0 } else { 0.0 }),
            (names.speed_ref.as_str(), self.speed_ref),
            (names.power_ref.as_str(), self.power_ref),
            (names.reset.as_str(), if self.reset { 1.0 } else { 0.0 }),
        ]
    }
}

pub struct SupervisoryController {
    config: ControllerConfig,

    loading_filter: LowPass,
    voltage_filter: LowPass,
    speed_filter: LowPass,

    speed_ref_limiter: RateLimiter,
    power_ref_limiter: RateLimiter,

    state: OverloadState,
    overload_since: Option<Instant>,
    reset_until: Option<Instant>,
    last_meas: Option<Instant>,
    last_command: SetpointCommand,
}

impl SupervisoryController {
    pub fn new(config: ControllerConfig) -> Self {
        let tau = config.filter_tau_s;
        Self {
            loading_filter: LowPass::new(tau),
            voltage_filter: LowPass::new(tau),
            speed_filter: LowPass::new(tau),
            speed_ref_limiter: RateLimiter::new(
                config.speed_ref_rate_up,
                config.speed_ref_rate_down,
                config.speed_ref_base,
            ),
            power_ref_limiter: RateLimiter::new(
                config.power_ref_rate_up,
                config.power_ref_rate_down,
                config.power_ref_base,
            ),
            state: OverloadState::Normal,
            overload_since: None,
            reset_until: None,
            last_meas: None,
            last_command: SetpointCommand {
                enable: true,
                speed_ref: config.speed_ref_base,
                power_ref: config.power_ref_base,
                reset: false,
            },
            config,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn state(&self) -> OverloadState {
        self.state
    }

    pub fn last_command(&self) -> SetpointCommand {
        self.last_command
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    pub fn set_enable_override(&mut self, value: Option<bool>) {
        self.config.enable_override = value;
    }

    /// Arms a reset pulse of the configured width starting at `now`.
    pub fn request_reset(&mut self, now: Instant) {
        let until = now + Duration::from_secs_f64(self.config.reset_pulse_s);
        self.reset_until = Some(self.reset_until.map_or(until, |u| u.max(until)));
    }

    fn reset_active(&self, now: Instant) -> bool {
        self.reset_until.map_or(false, |until| now < until)
    }

    pub fn update(&mut self, inputs: &ControllerInputs, dt: Duration, now: Instant) -> SetpointCommand {
        self.update_measured(inputs, Some(now), dt, now)
    }

    /// Like [`update`](Self::update), with `measured_at` the instant the inputs
    /// were sampled. Usable inputs older than the staleness window hold output.
    pub fn update_measured(
        &mut self,
        inputs: &ControllerInputs,
        measured_at: Option<Instant>,
        dt: Duration,
        now: Instant,
    ) -> SetpointCommand {
        let dt = dt.as_secs_f64();

        if !self.config.enabled {
            return self.slew_to_base(dt, now);
        }

        if let (true, Some(at)) = (inputs.usable(), measured_at) {
            self.last_meas = Some(self.last_meas.map_or(at, |prev| prev.max(at)));
        }
        if self.is_stale(now) {
            return self.hold_last(now);
        }

        let loading = finite(inputs.loading).map(|x| self.loading_filter.step(x, dt));
        let speed = finite(inputs.speed).map(|x| self.speed_filter.step(x, dt));
        let voltage = finite(inputs.voltage).map(|x| self.voltage_filter.step(x, dt));

        let mut speed_ref = self.config.speed_ref_base;
        let mut power_ref = self.config.power_ref_base;

        if let Some(loading) = loading {
            power_ref += self.loading_term(loading);
        }
        if let Some(speed) = speed {
            let error = self.config.speed_target - speed;
            if error.abs() >= self.config.speed_deadband {
                power_ref += self.config.k_power_from_speed * error;
                speed_ref += self.config.k_speed_ref_from_speed * error;
            }
        }
        if let Some(voltage) = voltage {
            power_ref = self.voltage_guard(power_ref, voltage);
        }

        let (mut enable, power_ref) = self.overload_step(inputs.overloaded, power_ref, now);
        if let Some(forced) = self.config.enable_override {
            enable = forced;
        }

        let speed_ref = speed_ref.clamp(self.config.speed_ref_min, self.config.speed_ref_max);
        let power_ref = power_ref.clamp(self.config.power_ref_min, self.config.power_ref_max);

        let command = SetpointCommand {
            enable,
            speed_ref: self.speed_ref_limiter.step(speed_ref, dt),
            power_ref: self.power_ref_limiter.step(power_ref, dt),
            reset: self.reset_active(now),
        };
        self.last_command = command;
        command
    }

    fn is_stale(&self, now: Instant) -> bool {
        match self.last_meas {
            Some(at) => now.saturating_duration_since(at).as_secs_f64() > self.config.max_stale_s,
            // nothing seen yet: not stale on the very first steps
            None => false,
        }
    }

    /// Zero below the soft threshold, a gentle linear pull-down inside the
    /// margin, a steep one past the hard limit.
    fn loading_term(&self, loading: f64) -> f64 {
        let limit = self.config.loading_limit;
        let margin = self.config.loading_margin;
        let soft = limit - margin;

        if loading >= limit {
            -0.5 - 2.0 * (loading - limit)
        } else if loading >= soft {
            -0.2 * (loading - soft) / margin.max(1e-6)
        } else {
            0.0
        }
    }

    /// Never lets the power reference rise above base while voltage is sagging.
    fn voltage_guard(&self, power_ref: f64, voltage: f64) -> f64 {
        let base = self.config.power_ref_base;
        let (vmin, vsoft) = (self.config.voltage_min, self.config.voltage_soft);

        if voltage < vmin {
            power_ref.min(base)
        } else if voltage < vsoft && power_ref > base {
            let scale = ((voltage - vmin) / (vsoft - vmin)).clamp(0.0, 1.0);
            base + (power_ref - base) * scale
        } else {
            power_ref
        }
    }

    fn overload_step(&mut self, overloaded: Option<bool>, power_ref: f64, now: Instant) -> (bool, f64) {
        match overloaded {
            None => (true, power_ref),
            Some(false) => {
                self.state = OverloadState::Normal;
                self.overload_since = None;
                (true, power_ref)
            }
            Some(true) => {
                let since = *self.overload_since.get_or_insert(now);
                let power_ref = power_ref - self.config.overload_soft_drop.abs();

                let sustained = now.saturating_duration_since(since).as_secs_f64()
                    >= self.config.overload_hard_after_s;
                if sustained {
                    if self.state != OverloadState::TripPendingReset {
                        self.state = OverloadState::TripPendingReset;
                        self.request_reset(now);
                    }
                    (false, power_ref)
                } else {
                    self.state = OverloadState::SoftRideThrough;
                    (true, power_ref)
                }
            }
        }
    }

    /// Fail-soft hold: repeat the last command and pin the limiters to it.
    fn hold_last(&mut self, now: Instant) -> SetpointCommand {
        self.speed_ref_limiter.reset_to(self.last_command.speed_ref);
        self.power_ref_limiter.reset_to(self.last_command.power_ref);
        self.last_command.reset = self.reset_active(now);
        self.last_command
    }

    fn slew_to_base(&mut self, dt: f64, now: Instant) -> SetpointCommand {
        let command = SetpointCommand {
            enable: true,
            speed_ref: self.speed_ref_limiter.step(self.config.speed_ref_base, dt),
            power_ref: self.power_ref_limiter.step(self.config.power_ref_base, dt),
            reset: self.reset_active(now),
        };
        self.last_command = command;
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const DT: Duration = Duration::from_millis(50);

    fn inputs(loading: f64) -> ControllerInputs {
        ControllerInputs {
            loading: Some(loading),
            voltage: Some(1.0),
            speed: Some(1.0),
            overloaded: Some(false),
        }
    }

    #[test]
    fn test_low_pass_first_sample_passes_through() {
        let mut f = LowPass::new(0.15);
        assert_eq!(f.step(2.0, 0.05), 2.0);
        let y = f.step(0.0, 0.05);
        assert!((y - 2.0 * (1.0 - 0.05 / 0.2)).abs() < 1e-12);
    }

    #[test]
    fn test_rate_limiter_bounds_random_sequence() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut limiter = RateLimiter::new(0.2, 0.3, 0.0);
        let mut prev = limiter.value();
        for _ in 0..2000 {
            let dt = rng.gen_range(0.001..0.2);
            let target = rng.gen_range(-5.0..5.0);
            let y = limiter.step(target, dt);
            assert!(y - prev <= 0.2 * dt + 1e-12);
            assert!(prev - y <= 0.3 * dt + 1e-12);
            prev = y;
        }
    }

    #[test]
    fn test_controller_output_respects_rates_under_random_inputs() {
        let config = ControllerConfig::default();
        let mut ctrl = SupervisoryController::new(config.clone());
        let mut rng = StdRng::seed_from_u64(7);
        let mut now = Instant::now();
        let mut prev = ctrl.last_command();
        let dt_s = DT.as_secs_f64();

        for _ in 0..1000 {
            now += DT;
            let sample = ControllerInputs {
                loading: rng.gen_bool(0.9).then(|| rng.gen_range(0.0..3.0)),
                voltage: Some(rng.gen_range(0.8..1.1)),
                speed: Some(rng.gen_range(0.9..1.1)),
                overloaded: Some(rng.gen_bool(0.2)),
            };
            let cmd = ctrl.update(&sample, DT, now);
            assert!(cmd.power_ref - prev.power_ref <= config.power_ref_rate_up * dt_s + 1e-9);
            assert!(prev.power_ref - cmd.power_ref <= config.power_ref_rate_down * dt_s + 1e-9);
            assert!(cmd.speed_ref - prev.speed_ref <= config.speed_ref_rate_up * dt_s + 1e-9);
            assert!(prev.speed_ref - cmd.speed_ref <= config.speed_ref_rate_down * dt_s + 1e-9);
            prev = cmd;
        }
    }

    #[test]
    fn test_loading_above_limit_pulls_below_base() {
        let config = ControllerConfig::default();
        let mut ctrl = SupervisoryController::new(config.clone());
        let mut now = Instant::now();
        for _ in 0..20 {
            now += DT;
            let cmd = ctrl.update(&inputs(1.8), DT, now);
            assert!(cmd.power_ref < config.power_ref_base);
        }
    }

    #[test]
    fn test_loading_below_soft_threshold_holds_base() {
        let mut ctrl = SupervisoryController::new(ControllerConfig::default());
        let now = Instant::now();
        let cmd = ctrl.update(&inputs(1.0), DT, now + DT);
        assert_eq!(cmd.power_ref, 0.0);
        assert_eq!(cmd.speed_ref, 1.0);
        assert!(cmd.enable);
    }

    #[test]
    fn test_sustained_overload_trips_and_pulses_reset_once() {
        let config = ControllerConfig::default();
        let mut ctrl = SupervisoryController::new(config);
        let start = Instant::now();
        let overloaded = ControllerInputs {
            overloaded: Some(true),
            ..inputs(1.0)
        };

        let cmd = ctrl.update(&overloaded, DT, start);
        assert_eq!(ctrl.state(), OverloadState::SoftRideThrough);
        assert!(cmd.enable);
        assert!(!cmd.reset);

        let tripped_at = start + Duration::from_millis(1000);
        let cmd = ctrl.update(&overloaded, DT, tripped_at);
        assert_eq!(ctrl.state(), OverloadState::TripPendingReset);
        assert!(!cmd.enable);
        assert!(cmd.reset);

        // the pulse ends after its width and is not re-armed while the trip persists
        let cmd = ctrl.update(&overloaded, DT, tripped_at + Duration::from_millis(150));
        assert!(!cmd.enable);
        assert!(!cmd.reset);

        let cmd = ctrl.update(&inputs(1.0), DT, tripped_at + Duration::from_millis(200));
        assert_eq!(ctrl.state(), OverloadState::Normal);
        assert!(cmd.enable);
    }

    #[test]
    fn test_stale_measurements_hold_last_command() {
        let mut ctrl = SupervisoryController::new(ControllerConfig::default());
        let start = Instant::now();
        let first = ctrl.update(&inputs(1.8), DT, start);

        let missing = ControllerInputs::default();
        let held = ctrl.update(&missing, DT, start + Duration::from_secs(2));
        assert_eq!(held, first);
    }

    #[test]
    fn test_aged_usable_measurements_hold_last_command() {
        let mut ctrl = SupervisoryController::new(ControllerConfig::default());
        let start = Instant::now();
        let first = ctrl.update(&inputs(1.8), DT, start);

        let later = start + Duration::from_secs(2);
        let held = ctrl.update_measured(&inputs(1.8), Some(start), DT, later);
        assert_eq!(held, first);

        let resumed = ctrl.update_measured(&inputs(1.8), Some(later), DT, later);
        assert!(resumed.power_ref < first.power_ref);
    }

    #[test]
    fn test_non_finite_inputs_are_skipped() {
        let mut ctrl = SupervisoryController::new(ControllerConfig::default());
        let sample = ControllerInputs {
            loading: Some(f64::NAN),
            voltage: Some(f64::INFINITY),
            speed: Some(1.0),
            overloaded: None,
        };
        let cmd = ctrl.update(&sample, DT, Instant::now());
        assert!(cmd.power_ref.is_finite());
        assert!(cmd.speed_ref.is_finite());
    }

    #[test]
    fn test_low_voltage_never_raises_power_ref() {
        let mut ctrl = SupervisoryController::new(ControllerConfig::default());
        let mut now = Instant::now();
        // slow speed would normally raise the power reference
        let sample = ControllerInputs {
            loading: Some(1.0),
            voltage: Some(0.90),
            speed: Some(0.95),
            overloaded: Some(false),
        };
        for _ in 0..40 {
            now += DT;
            let cmd = ctrl.update(&sample, DT, now);
            assert!(cmd.power_ref <= 0.0);
        }
    }

    #[test]
    fn test_disabled_slews_back_to_base() {
        let mut ctrl = SupervisoryController::new(ControllerConfig::default());
        let mut now = Instant::now();
        for _ in 0..20 {
            now += DT;
            ctrl.update(&inputs(1.8), DT, now);
        }
        assert!(ctrl.last_command().power_ref < 0.0);

        ctrl.set_enabled(false);
        for _ in 0..200 {
            now += DT;
            ctrl.update(&ControllerInputs::default(), DT, now);
        }
        let cmd = ctrl.last_command();
        assert!(cmd.enable);
        assert!(cmd.power_ref.abs() < 1e-9);
    }

    #[test]
    fn test_to_updates_uses_configured_names() {
        let names = GeneratorCommandNames::default();
        let cmd = SetpointCommand {
            enable: false,
            speed_ref: 1.01,
            power_ref: -0.2,
            reset: true,
        };
        assert_eq!(
            cmd.to_updates(&names),
            [("REM_BLOCKGEN", 0.0), ("REM_Wref", 1.01), ("REM_PREF", -0.2), ("REM_RESETGEN", 1.0)]
        );
    }
}
