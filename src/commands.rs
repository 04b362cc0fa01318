//! Validated command helpers.
//!
//! Each helper checks the value against the control's range before anything
//! reaches a channel, then routes the write so it is audited (and possibly
//! disrupted) like any other command.

use crate::bus::CommandRoute;
use crate::channel::CommandTarget;
use crate::config::FaultTiming;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub lo: f64,
    pub hi: f64,
}

impl Range {
    pub fn new(lo: f64, hi: f64) -> Self {
        Self { lo, hi }
    }

    pub fn clamp(&self, x: f64) -> f64 {
        x.max(self.lo).min(self.hi)
    }

    pub fn contains(&self, x: f64) -> bool {
        self.lo <= x && x <= self.hi
    }
}

/// Two-position switch: 0 or 1.
pub fn set_selector(
    route: &dyn CommandRoute,
    target: &Arc<dyn CommandTarget>,
    name: &str,
    value: i64,
) -> Result<(), ConfigError> {
    if value != 0 && value != 1 {
        return Err(ConfigError::SelectorOutOfRange {
            field: name.to_string(),
            value,
        });
    }
    route.emit_cmd(target, &[(name, value as f64)], "selector")
}

/// Integer dial within `[lo, hi]`.
pub fn set_dial(
    route: &dyn CommandRoute,
    target: &Arc<dyn CommandTarget>,
    name: &str,
    value: i64,
    lo: i64,
    hi: i64,
) -> Result<(), ConfigError> {
    if !(lo..=hi).contains(&value) {
        return Err(ConfigError::DialOutOfRange {
            field: name.to_string(),
            value,
            lo,
            hi,
        });
    }
    route.emit_cmd(target, &[(name, value as f64)], "dial")
}

/// Float slider. With `clamp` the value is pulled into range, otherwise an
/// out-of-range value is rejected. Returns what was written.
pub fn set_slider(
    route: &dyn CommandRoute,
    target: &Arc<dyn CommandTarget>,
    name: &str,
    value: f64,
    range: Range,
    clamp: bool,
) -> Result<f64, ConfigError> {
    if !(range.lo < range.hi) {
        return Err(ConfigError::InvalidRange {
            field: name.to_string(),
            lo: range.lo,
            hi: range.hi,
        });
    }
    let v = if clamp {
        range.clamp(value)
    } else if range.contains(value) {
        value
    } else {
        return Err(ConfigError::SliderOutOfRange {
            field: name.to_string(),
            value,
            lo: range.lo,
            hi: range.hi,
        });
    };
    route.emit_cmd(target, &[(name, v)], "slider")?;
    Ok(v)
}

/// Pushbutton: writes 1, waits `width`, writes 0. Blocks the caller for `width`.
pub fn pulse(
    route: &dyn CommandRoute,
    target: &Arc<dyn CommandTarget>,
    name: &str,
    width: Duration,
) -> Result<(), ConfigError> {
    if width.is_zero() {
        return Err(ConfigError::InvalidPulseWidth {
            field: name.to_string(),
        });
    }
    route.emit_cmd(target, &[(name, 1.0)], "pulse on")?;
    thread::sleep(width);
    route.emit_cmd(target, &[(name, 0.0)], "pulse off")
}

/// Writes a fault duration given in cycles, converted to whatever unit the simulator expects.
pub fn set_fault_duration_cycles(
    route: &dyn CommandRoute,
    target: &Arc<dyn CommandTarget>,
    name: &str,
    cycles: f64,
    range: Range,
    timing: &FaultTiming,
) -> Result<f64, ConfigError> {
    if !(cycles.is_finite() && range.contains(cycles)) {
        return Err(ConfigError::SliderOutOfRange {
            field: name.to_string(),
            value: cycles,
            lo: range.lo,
            hi: range.hi,
        });
    }
    let wire = timing.cycles_to_wire(cycles);
    route.emit_cmd(target, &[(name, wire)], "fault duration")?;
    Ok(wire)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::tests::RecordingTarget;
    use crate::bus::{Bus, BusConfig};
    use crate::config::DurationUnit;
    use crate::logging::null_sink;

    fn setup() -> (Bus, Arc<RecordingTarget>, Arc<dyn CommandTarget>) {
        let bus = Bus::new(BusConfig::default(), null_sink());
        let recorder = RecordingTarget::new("CH1", &["SEL", "DIAL", "SLIDE", "PB", "DUR"]);
        let target: Arc<dyn CommandTarget> = recorder.clone();
        (bus, recorder, target)
    }

    #[test]
    fn test_selector_rejects_non_binary() {
        let (bus, recorder, target) = setup();
        assert!(matches!(
            set_selector(&bus, &target, "SEL", 2),
            Err(ConfigError::SelectorOutOfRange { value: 2, .. })
        ));
        set_selector(&bus, &target, "SEL", 1).unwrap();
        assert_eq!(recorder.write_count(), 1);
    }

    #[test]
    fn test_dial_bounds_inclusive() {
        let (bus, recorder, target) = setup();
        set_dial(&bus, &target, "DIAL", 0, 0, 7).unwrap();
        set_dial(&bus, &target, "DIAL", 7, 0, 7).unwrap();
        assert!(set_dial(&bus, &target, "DIAL", 8, 0, 7).is_err());
        assert_eq!(recorder.write_count(), 2);
    }

    #[test]
    fn test_slider_clamps_or_rejects() {
        let (bus, _, target) = setup();
        let range = Range::new(0.0, 50.0);
        assert_eq!(set_slider(&bus, &target, "SLIDE", 75.0, range, true).unwrap(), 50.0);
        assert!(matches!(
            set_slider(&bus, &target, "SLIDE", 75.0, range, false),
            Err(ConfigError::SliderOutOfRange { .. })
        ));
        assert!(matches!(
            set_slider(&bus, &target, "SLIDE", 1.0, Range::new(5.0, 5.0), true),
            Err(ConfigError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_pulse_writes_one_then_zero() {
        let (bus, recorder, target) = setup();
        pulse(&bus, &target, "PB", Duration::from_millis(5)).unwrap();
        let writes = recorder.writes.lock().clone();
        assert_eq!(
            writes,
            vec![vec![("PB".to_string(), 1.0)], vec![("PB".to_string(), 0.0)]]
        );
        assert!(pulse(&bus, &target, "PB", Duration::ZERO).is_err());
    }

    #[test]
    fn test_fault_duration_follows_wire_unit() {
        let (bus, _, target) = setup();
        let range = Range::new(0.0, 50.0);
        let seconds = FaultTiming::default();
        let wire = set_fault_duration_cycles(&bus, &target, "DUR", 30.0, range, &seconds).unwrap();
        assert!((wire - 0.5).abs() < 1e-12);

        let cycles = FaultTiming {
            wire_unit: DurationUnit::Cycles,
            ..FaultTiming::default()
        };
        let wire = set_fault_duration_cycles(&bus, &target, "DUR", 30.0, range, &cycles).unwrap();
        assert_eq!(wire, 30.0);
    }
}
