use hilbus::bus::{Bus, BusConfig, CommandRoute};
use hilbus::channel::CommandTarget;
use hilbus::controller::{ControllerConfig, SupervisoryController};
use hilbus::error::ConfigError;
use hilbus::logging::null_sink;
use hilbus::protocol::{FieldSpec, FrameLayout, TelemetryFrame, Value};
use hilbus::sequencer::{
    AbortCause, GeneratorEngagement, RampProfile, ScenarioContext, SequencerConfig, Stage,
    TestSequencer,
};
use hilbus::stability::{MonitoredSignal, SignalRef, StabilityLimits};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const TICK_S: f64 = 0.0625;

#[derive(Clone, Copy)]
struct Behavior {
    grid_follows_command: bool,
    reset_closes_breaker: bool,
    detection_stuck: bool,
    overload_above: f64,
    trip_after: u32,
    silent_open_at: Option<f64>,
    /// Generator breaker status reads -1 once the load reaches this level.
    breaker_lost_at: Option<f64>,
    detection_from_load: Option<f64>,
    detection_when_enabled: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            grid_follows_command: true,
            reset_closes_breaker: true,
            detection_stuck: false,
            overload_above: 10.0,
            trip_after: u32::MAX,
            silent_open_at: None,
            breaker_lost_at: None,
            detection_from_load: None,
            detection_when_enabled: false,
        }
    }
}

#[derive(Default)]
struct PlantState {
    grid: bool,
    gen_enabled: bool,
    gen_breaker: bool,
    load: f64,
    overload_count: u32,
    breaker_lost: bool,
}

/// Minimal plant: command writes update state and immediately republish
/// grid and generator telemetry onto the bus.
struct Plant {
    bus: Arc<Bus>,
    behavior: Behavior,
    state: Mutex<PlantState>,
    grid_layout: Arc<FrameLayout>,
    gen_layout: Arc<FrameLayout>,
}

impl Plant {
    fn new(bus: Arc<Bus>, behavior: Behavior) -> Arc<Self> {
        let grid_layout = FrameLayout::new(vec![FieldSpec::int("MODE"), FieldSpec::int("GRID")]).unwrap();
        let gen_layout = FrameLayout::new(vec![
            FieldSpec::int("BRKGEN"),
            FieldSpec::int("OVERLOADED"),
            FieldSpec::int("W_DETECTED"),
            FieldSpec::float("SMACH"),
            FieldSpec::float("GENRMSPU"),
            FieldSpec::float("WPU"),
        ])
        .unwrap();
        let plant = Arc::new(Self {
            bus,
            behavior,
            state: Mutex::new(PlantState::default()),
            grid_layout: Arc::new(grid_layout),
            gen_layout: Arc::new(gen_layout),
        });
        plant.publish();
        plant
    }

    fn apply(&self, field: &str, value: f64) {
        let b = self.behavior;
        let mut s = self.state.lock();
        match field {
            "REM_GRID" if b.grid_follows_command => s.grid = value >= 0.5,
            "REM_BLOCKGEN" => s.gen_enabled = value >= 0.5,
            "REM_RESETGEN" if value >= 0.5 && s.gen_enabled && b.reset_closes_breaker => {
                s.gen_breaker = true;
            }
            "REM_PLOAD" => {
                s.load = value;
                if s.gen_breaker && value > b.overload_above {
                    s.overload_count += 1;
                    if s.overload_count >= b.trip_after {
                        s.gen_breaker = false;
                    }
                }
                if b.silent_open_at.map_or(false, |at| value >= at) {
                    s.gen_breaker = false;
                }
                if b.breaker_lost_at.map_or(false, |at| value >= at) {
                    s.breaker_lost = true;
                }
            }
            _ => {}
        }
    }

    fn publish(&self) {
        let (grid, gen) = {
            let s = self.state.lock();
            let b = self.behavior;
            let flag = |on: bool| Value::Int(i32::from(on));
            let grid = vec![Value::Int(1), flag(s.grid)];
            let breaker = if s.breaker_lost { Value::Int(-1) } else { flag(s.gen_breaker) };
            let detected = b.detection_stuck
                || (b.detection_when_enabled && s.gen_enabled)
                || b.detection_from_load.map_or(false, |at| s.load >= at);
            let gen = vec![
                breaker,
                flag(s.load > b.overload_above),
                flag(detected),
                Value::Float(s.load as f32),
                Value::Float(1.0),
                Value::Float(1.0),
            ];
            (grid, gen)
        };
        self.bus
            .update_meas("CH1", TelemetryFrame::new(Arc::clone(&self.grid_layout), &grid).unwrap());
        self.bus
            .update_meas("CH3", TelemetryFrame::new(Arc::clone(&self.gen_layout), &gen).unwrap());
    }
}

struct StubTarget {
    name: String,
    plant: Arc<Plant>,
    disconnects: AtomicUsize,
}

impl CommandTarget for StubTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_cmd(&self, updates: &[(&str, f64)]) -> Result<bool, ConfigError> {
        for &(field, value) in updates {
            self.plant.apply(field, value);
        }
        self.plant.publish();
        Ok(true)
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

struct Rig {
    bus: Arc<Bus>,
    targets: Vec<Arc<StubTarget>>,
    ctx: ScenarioContext,
}

fn rig(behavior: Behavior) -> Rig {
    let bus = Arc::new(Bus::new(BusConfig::default(), null_sink()));
    let plant = Plant::new(Arc::clone(&bus), behavior);
    let targets: Vec<Arc<StubTarget>> = ["CH1", "CH2", "CH3", "CH4"]
        .iter()
        .map(|name| {
            Arc::new(StubTarget {
                name: name.to_string(),
                plant: Arc::clone(&plant),
                disconnects: AtomicUsize::new(0),
            })
        })
        .collect();
    let dyn_target = |i: usize| Arc::clone(&targets[i]) as Arc<dyn CommandTarget>;
    let ctx = ScenarioContext {
        bus: Arc::clone(&bus),
        route: Arc::clone(&bus) as Arc<dyn CommandRoute>,
        grid: dyn_target(0),
        storage: dyn_target(1),
        generator: dyn_target(2),
        load: dyn_target(3),
        log: null_sink(),
    };
    Rig { bus, targets, ctx }
}

fn fast_config() -> SequencerConfig {
    SequencerConfig {
        tick_s: TICK_S,
        comms_settle_s: 0.0,
        remote_mode_timeout_s: 0.5,
        grid_close_timeout_s: 0.5,
        grid_open_timeout_s: 0.5,
        stable_timeout_s: 2.0,
        protection_clear_timeout_s: 0.3,
        pre_island_timeout_s: 0.3,
        hold_s: 0.125,
        storage_check_reset_pulse_s: 0.01,
        ramp: RampProfile {
            start: 0.5,
            end: 1.0,
            reactive: 0.0,
            duration_s: 0.5,
            ..RampProfile::default()
        },
        engagement: GeneratorEngagement {
            max_tries: 2,
            reset_pulse_s: 0.01,
            wait_after_try_s: 0.01,
            breaker_timeout_s: 0.2,
            detection_clear_timeout_s: 0.2,
        },
        stability: StabilityLimits {
            signals: vec![MonitoredSignal::new("CH3", "SMACH", Some(0.05), Some(0.05), true)],
            protection_flags: vec![SignalRef::new("CH3", "OVERLOADED")],
            window_s: 0.25,
            min_samples: 3,
            required_fraction: 0.5,
            min_required_samples: 2,
        },
        ..SequencerConfig::default()
    }
}

fn assert_torn_down(rig: &Rig) {
    for target in &rig.targets {
        assert_eq!(target.disconnects.load(Ordering::SeqCst), 1, "{} not disconnected", target.name);
    }
}

#[test]
fn test_breaker_timeout_aborts_on_time_and_names_condition() {
    let rig = rig(Behavior {
        grid_follows_command: false,
        ..Behavior::default()
    });
    let config = fast_config();
    let timeout = Duration::from_secs_f64(config.grid_close_timeout_s);

    let err = TestSequencer::new(config, rig.ctx.clone(), None).run().unwrap_err();
    let finished = SystemTime::now();

    assert_eq!(err.stage, Stage::CloseGridTie);
    assert_eq!(err.cause, AbortCause::ConditionTimeout);
    assert!(err.message.contains("CH1.GRID"), "{}", err.message);
    assert!(err.elapsed_since_ramp.is_none());

    let close = rig
        .bus
        .get_cmd_log()
        .into_iter()
        .rev()
        .find(|e| e.channel == "CH1")
        .unwrap();
    let waited = finished.duration_since(close.at).unwrap();
    assert!(waited >= timeout, "gave up after {waited:?}");
    assert!(
        waited <= timeout + Duration::from_secs_f64(TICK_S) + Duration::from_millis(100),
        "gave up after {waited:?}"
    );
    assert_torn_down(&rig);
}

#[test]
fn test_closed_loop_run_completes() {
    let rig = rig(Behavior::default());
    let controller = SupervisoryController::new(ControllerConfig::default());

    let report = TestSequencer::new(fast_config(), rig.ctx.clone(), Some(controller))
        .run()
        .unwrap();

    assert_eq!(report.stages.first(), Some(&Stage::Settle));
    assert_eq!(report.stages.last(), Some(&Stage::Done));
    assert_eq!(report.generator_close_attempts, 1);
    assert_eq!(report.ramp_ticks, 9);
    assert!((report.final_load - 1.0).abs() < 1e-9);
    assert!(rig
        .bus
        .get_cmd_log()
        .iter()
        .any(|e| e.channel == "CH3" && e.note == "generator controller"));
    assert_torn_down(&rig);
}

#[test]
fn test_sustained_overload_is_classified_as_protection_trip() {
    let rig = rig(Behavior {
        overload_above: 0.6,
        trip_after: 5,
        ..Behavior::default()
    });

    let err = TestSequencer::new(fast_config(), rig.ctx.clone(), None).run().unwrap_err();

    assert_eq!(err.stage, Stage::Ramp);
    assert_eq!(err.cause, AbortCause::ProtectionTrip);
    assert!(err.elapsed_since_ramp.is_some());
    assert!(err.message.contains("since ramp start"));
    assert!(err
        .snapshot
        .values
        .iter()
        .any(|(name, v)| name == "BRKGEN" && *v == Some(0.0)));
    assert_torn_down(&rig);
}

#[test]
fn test_breaker_opening_without_overload_is_unexplained() {
    let rig = rig(Behavior {
        silent_open_at: Some(0.75),
        ..Behavior::default()
    });

    let err = TestSequencer::new(fast_config(), rig.ctx.clone(), None).run().unwrap_err();

    assert_eq!(err.stage, Stage::Ramp);
    assert_eq!(err.cause, AbortCause::UnexplainedDisconnect);
    assert_torn_down(&rig);
}

#[test]
fn test_stuck_detection_blocks_generator_enable() {
    let rig = rig(Behavior {
        detection_stuck: true,
        ..Behavior::default()
    });

    let err = TestSequencer::new(fast_config(), rig.ctx.clone(), None).run().unwrap_err();

    assert_eq!(err.stage, Stage::ProtectionClear);
    assert_eq!(err.cause, AbortCause::InterlockUnmet);
    assert!(err.message.contains("W_DETECTED"));
    assert!(!rig
        .bus
        .get_cmd_log()
        .iter()
        .any(|e| e.note == "enable generator"));
    assert_torn_down(&rig);
}

#[test]
fn test_generator_retries_are_bounded() {
    let rig = rig(Behavior {
        reset_closes_breaker: false,
        ..Behavior::default()
    });

    let err = TestSequencer::new(fast_config(), rig.ctx.clone(), None).run().unwrap_err();

    assert_eq!(err.stage, Stage::EnsureGeneratorClosed);
    assert_eq!(err.cause, AbortCause::GeneratorDidNotEngage);
    let resets = rig
        .bus
        .get_cmd_log()
        .iter()
        .filter(|e| e.note == "pulse on" && e.updates.iter().any(|(f, _)| f == "REM_RESETGEN"))
        .count();
    assert_eq!(resets, 2);
    assert_torn_down(&rig);
}

#[test]
fn test_sustained_detection_during_ramp_aborts() {
    let rig = rig(Behavior {
        detection_from_load: Some(0.6),
        ..Behavior::default()
    });

    let err = TestSequencer::new(fast_config(), rig.ctx.clone(), None).run().unwrap_err();

    assert_eq!(err.stage, Stage::Ramp);
    assert_eq!(err.cause, AbortCause::DetectionSustained);
    assert!(err.elapsed_since_ramp.is_some());
    assert!(err.message.contains("W_DETECTED"), "{}", err.message);
    assert!(err.message.contains("since ramp start"));
    assert!(err
        .snapshot
        .values
        .iter()
        .any(|(name, v)| name == "W_DETECTED" && *v == Some(1.0)));
    assert!(err
        .snapshot
        .values
        .iter()
        .any(|(name, v)| name == "BRKGEN" && *v == Some(1.0)));
    assert_torn_down(&rig);
}

#[test]
fn test_lost_generator_status_while_islanded_aborts() {
    let rig = rig(Behavior {
        breaker_lost_at: Some(0.75),
        ..Behavior::default()
    });

    let err = TestSequencer::new(fast_config(), rig.ctx.clone(), None).run().unwrap_err();

    assert_eq!(err.stage, Stage::Ramp);
    assert_eq!(err.cause, AbortCause::BothDisconnected);
    assert!(err.elapsed_since_ramp.is_some());
    assert!(err.message.contains("GRID=0"), "{}", err.message);
    assert!(err
        .snapshot
        .values
        .iter()
        .any(|(name, v)| name == "BRKGEN" && *v == Some(-1.0)));
    assert_torn_down(&rig);
}

#[test]
fn test_retries_skip_reset_pulse_while_detection_is_set() {
    let rig = rig(Behavior {
        detection_when_enabled: true,
        ..Behavior::default()
    });

    let err = TestSequencer::new(fast_config(), rig.ctx.clone(), None).run().unwrap_err();

    assert_eq!(err.stage, Stage::EnsureGeneratorClosed);
    assert_eq!(err.cause, AbortCause::GeneratorDidNotEngage);
    let log = rig.bus.get_cmd_log();
    let tries = log
        .iter()
        .filter(|e| e.note.starts_with("generator engage: arm try"))
        .count();
    assert_eq!(tries, 2);
    assert!(!log
        .iter()
        .any(|e| e.note == "pulse on" && e.updates.iter().any(|(f, _)| f == "REM_RESETGEN")));
    assert_torn_down(&rig);
}
