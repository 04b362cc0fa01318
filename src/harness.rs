//! Wires channels, bus and the optional disruption layer together.

use crate::bus::{Bus, CommandRoute, MeasSink};
use crate::channel::{ChannelOptions, CommandTarget, ProtocolChannel, TelemetryListener};
use crate::commands::{self, Range};
use crate::config::HarnessConfig;
use crate::controller::SupervisoryController;
use crate::error::ConfigError;
use crate::fault_injection::FaultInjector;
use crate::logging::LogSink;
use crate::protocol::TelemetryFrame;
use crate::sequencer::{ScenarioContext, TestSequencer};
use std::sync::Arc;

/// Adapts a name-keyed measurement sink into a per-channel listener.
pub fn listener(sink: MeasSink, channel: &str) -> TelemetryListener {
    let channel = channel.to_string();
    Arc::new(move |frame: &TelemetryFrame| sink(&channel, frame.clone()))
}

pub struct Harness {
    config: HarnessConfig,
    bus: Arc<Bus>,
    injector: Option<Arc<FaultInjector>>,
    channels: Vec<Arc<ProtocolChannel>>,
    log: LogSink,
}

impl Harness {
    /// Telemetry flows channel -> bus, or channel -> injector -> bus when
    /// fault injection is enabled. Nothing connects until `start_all`.
    pub fn new(config: HarnessConfig, log: LogSink) -> Result<Self, ConfigError> {
        config.validate()?;

        let bus = Arc::new(Bus::new(config.bus.clone(), Arc::clone(&log)));
        let injector = if config.fault_injection.enabled {
            Some(Arc::new(FaultInjector::from_config(
                &config.fault_injection,
                bus.meas_sink(),
                bus.command_sink(),
                Arc::clone(&log),
            )))
        } else {
            None
        };

        let sink: MeasSink = match &injector {
            Some(injector) => {
                let injector = Arc::clone(injector);
                Arc::new(move |channel: &str, frame: TelemetryFrame| injector.on_meas(channel, frame))
            }
            None => bus.meas_sink(),
        };

        let channels = config
            .channels
            .iter()
            .map(|c| {
                Arc::new(ProtocolChannel::new(
                    c.clone(),
                    ChannelOptions {
                        listener: Some(listener(Arc::clone(&sink), &c.name)),
                        log: Arc::clone(&log),
                        ..ChannelOptions::default()
                    },
                ))
            })
            .collect();

        Ok(Self {
            config,
            bus,
            injector,
            channels,
            log,
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn injector(&self) -> Option<&Arc<FaultInjector>> {
        self.injector.as_ref()
    }

    pub fn channels(&self) -> &[Arc<ProtocolChannel>] {
        &self.channels
    }

    pub fn channel(&self, name: &str) -> Option<&Arc<ProtocolChannel>> {
        self.channels.iter().find(|c| c.config().name == name)
    }

    pub fn target(&self, name: &str) -> Result<Arc<dyn CommandTarget>, ConfigError> {
        self.channel(name)
            .map(|c| Arc::clone(c) as Arc<dyn CommandTarget>)
            .ok_or_else(|| ConfigError::Channel {
                channel: name.to_string(),
                reason: "not configured".into(),
            })
    }

    /// Where commands go: the injector when present, the bus otherwise.
    pub fn route(&self) -> Arc<dyn CommandRoute> {
        match &self.injector {
            Some(injector) => Arc::clone(injector) as Arc<dyn CommandRoute>,
            None => Arc::clone(&self.bus) as Arc<dyn CommandRoute>,
        }
    }

    /// Writes a fault duration given in cycles, converted to the configured wire unit.
    pub fn set_fault_duration(
        &self,
        channel: &str,
        field: &str,
        cycles: f64,
        range: Range,
    ) -> Result<f64, ConfigError> {
        let target = self.target(channel)?;
        commands::set_fault_duration_cycles(
            self.route().as_ref(),
            &target,
            field,
            cycles,
            range,
            &self.config.fault_timing,
        )
    }

    pub fn start_all(&self) {
        for channel in &self.channels {
            channel.start();
        }
    }

    pub fn stop_all(&self) {
        for channel in &self.channels {
            channel.stop();
        }
        if let Some(injector) = &self.injector {
            injector.shutdown();
        }
    }

    pub fn scenario_context(&self) -> Result<ScenarioContext, ConfigError> {
        let names = &self.config.scenario.channels;
        Ok(ScenarioContext {
            bus: Arc::clone(&self.bus),
            route: self.route(),
            grid: self.target(&names.grid)?,
            storage: self.target(&names.storage)?,
            generator: self.target(&names.generator)?,
            load: self.target(&names.load)?,
            log: Arc::clone(&self.log),
        })
    }

    /// A sequencer over this harness, closed loop when `closed_loop` is set.
    pub fn sequencer(&self, closed_loop: bool) -> Result<TestSequencer, ConfigError> {
        let controller = closed_loop.then(|| SupervisoryController::new(self.config.controller.clone()));
        Ok(TestSequencer::new(
            self.config.scenario.clone(),
            self.scenario_context()?,
            controller,
        ))
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.stop_all();
    }
}
