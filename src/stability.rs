//! Sliding-window stability predicate.

use crate::bus::Bus;
use crate::config::{GENERATOR_CHANNEL, LOAD_CHANNEL, PCC_CHANNEL, STORAGE_CHANNEL};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// A telemetry field addressed by channel name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalRef {
    pub channel: String,
    pub field: String,
}

impl SignalRef {
    pub fn new(channel: &str, field: &str) -> Self {
        Self {
            channel: channel.to_string(),
            field: field.to_string(),
        }
    }

    pub fn read(&self, bus: &Bus) -> Option<f64> {
        bus.value(&self.channel, &self.field)
    }
}

impl fmt::Display for SignalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.channel, self.field)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredSignal {
    pub signal: SignalRef,
    /// Maximum peak-to-peak over the window.
    #[serde(default)]
    pub span: Option<f64>,
    /// Maximum change between consecutive samples.
    #[serde(default)]
    pub step: Option<f64>,
    #[serde(default)]
    pub required: bool,
}

impl MonitoredSignal {
    pub fn new(channel: &str, field: &str, span: Option<f64>, step: Option<f64>, required: bool) -> Self {
        Self {
            signal: SignalRef::new(channel, field),
            span,
            step,
            required,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityLimits {
    pub signals: Vec<MonitoredSignal>,
    /// Any non-zero sample of these anywhere in the window means unstable.
    pub protection_flags: Vec<SignalRef>,
    pub window_s: f64,
    pub min_samples: usize,
    pub required_fraction: f64,
    pub min_required_samples: usize,
}

impl Default for StabilityLimits {
    fn default() -> Self {
        let float = |ch: &str, name: &str, span: f64, step: f64| {
            MonitoredSignal::new(ch, name, Some(span), Some(step), true)
        };
        Self {
            signals: vec![
                float(PCC_CHANNEL, "PGRID", 0.02, 0.01),
                float(PCC_CHANNEL, "QGRID", 0.02, 0.01),
                float(LOAD_CHANNEL, "N680RMSPU", 0.01, 0.005),
                float(STORAGE_CHANNEL, "Pmeas", 0.03, 0.015),
                float(GENERATOR_CHANNEL, "PGEN", 0.03, 0.015),
                float(GENERATOR_CHANNEL, "QGEN", 0.03, 0.015),
                float(GENERATOR_CHANNEL, "PMACH", 0.03, 0.015),
                float(GENERATOR_CHANNEL, "QMACH", 0.03, 0.015),
                float(GENERATOR_CHANNEL, "SMACH", 0.03, 0.015),
                float(GENERATOR_CHANNEL, "GENRMSPU", 0.01, 0.005),
                float(GENERATOR_CHANNEL, "WPU", 0.002, 0.001),
                MonitoredSignal::new(GENERATOR_CHANNEL, "W_DETECTED", None, Some(0.5), false),
                MonitoredSignal::new(GENERATOR_CHANNEL, "BRKGEN", None, Some(0.5), false),
            ],
            protection_flags: vec![
                SignalRef::new(GENERATOR_CHANNEL, "OVERLOADED"),
                SignalRef::new(GENERATOR_CHANNEL, "W_DETECTED"),
            ],
            window_s: 2.0,
            min_samples: 10,
            required_fraction: 0.5,
            min_required_samples: 5,
        }
    }
}

impl StabilityLimits {
    /// Window length for a given sampling period, never below `min_samples`.
    pub fn window_len(&self, tick: Duration) -> usize {
        let tick = tick.as_secs_f64();
        let n = if tick > 0.0 {
            (self.window_s / tick).round() as usize
        } else {
            0
        };
        n.max(self.min_samples)
    }
}

/// One point-in-time read of every monitored signal and flag, in limit order.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub values: Vec<Option<f64>>,
    pub flags: Vec<Option<f64>>,
}

impl Sample {
    pub fn capture(bus: &Bus, limits: &StabilityLimits) -> Self {
        Self {
            values: limits.signals.iter().map(|s| s.signal.read(bus)).collect(),
            flags: limits.protection_flags.iter().map(|f| f.read(bus)).collect(),
        }
    }
}

pub struct StabilityWindow {
    capacity: usize,
    samples: VecDeque<Sample>,
}

impl StabilityWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, sample: Sample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn is_stable(&self, limits: &StabilityLimits) -> bool {
        let n = self.samples.len();
        if n < limits.min_samples {
            return false;
        }

        let needed = limits
            .min_required_samples
            .max((n as f64 * limits.required_fraction) as usize);

        for (i, signal) in limits.signals.iter().enumerate() {
            if signal.required && self.present(i).count() < needed {
                return false;
            }
        }

        let flagged = self
            .samples
            .iter()
            .flat_map(|s| s.flags.iter())
            .any(|f| matches!(f, Some(v) if *v != 0.0));
        if flagged {
            return false;
        }

        for (i, signal) in limits.signals.iter().enumerate() {
            let values: Vec<f64> = self.present(i).collect();
            if values.is_empty() {
                continue;
            }
            if let Some(span) = signal.span {
                let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
                let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                if hi - lo > span {
                    return false;
                }
            }
            if let Some(step) = signal.step {
                if max_step(&values) > step {
                    return false;
                }
            }
        }
        true
    }

    fn present(&self, index: usize) -> impl Iterator<Item = f64> + '_ {
        self.samples
            .iter()
            .filter_map(move |s| s.values.get(index).copied().flatten())
    }
}

fn max_step(values: &[f64]) -> f64 {
    values
        .windows(2)
        .map(|w| (w[1] - w[0]).abs())
        .fold(0.0, f64::max)
}
