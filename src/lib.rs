//! # Hardware-in-the-loop microgrid harness
//!
//! Drives a real-time power-system simulator over persistent TCP links that
//! carry fixed-layout, big-endian binary frames, and runs an automated
//! islanding and load-ramp scenario against it.
//!
//! ## Features
//!
//! - **Fixed-frame channels**: one link per channel, RX/TX workers, reconnect with backoff
//! - **Telemetry bus**: latest frame per channel plus a bounded command audit log
//! - **Fault injection**: seedable drop, freeze, delay, jitter and noise per channel
//! - **Supervisory control**: filtered, rate-limited generator setpoints with overload ride-through
//! - **Scenario sequencing**: interlocked stages, stability windows, trip classification
//!
//! ## Quick Start
//!
//! ```no_run
//! use hilbus::config::HarnessConfig;
//! use hilbus::harness::Harness;
//! use hilbus::logging::tracing_sink;
//!
//! let config = HarnessConfig::microgrid("127.0.0.1").unwrap();
//! let harness = Harness::new(config, tracing_sink()).unwrap();
//! harness.start_all();
//! match harness.sequencer(true).unwrap().run() {
//!     Ok(report) => println!("completed {} stages", report.stages.len()),
//!     Err(e) => println!("aborted: {e}"),
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`protocol`] - wire codec and telemetry frames
//! - [`channel`] - one simulator link and the `CommandTarget` capability
//! - [`bus`] - shared telemetry snapshot and command audit
//! - [`fault_injection`] - disruption layer between channels and bus
//! - [`controller`] - supervisory generator controller
//! - [`sequencer`] - the test scenario
//! - [`harness`] - wiring for all of the above

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod bus;
pub mod channel;
pub mod commands;
pub mod config;
pub mod controller;
pub mod error;
pub mod fault_injection;
pub mod harness;
pub mod logging;
pub mod protocol;
pub mod scheduler;
pub mod sequencer;
pub mod stability;

pub use bus::{Bus, CommandRoute};
pub use channel::{CommandTarget, ProtocolChannel};
pub use config::{ChannelConfig, HarnessConfig};
pub use error::{ConfigError, LoadError, ProtocolError};
pub use harness::Harness;
pub use sequencer::{ScenarioError, ScenarioReport, TestSequencer};
