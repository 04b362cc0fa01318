//! One persistent TCP link to the simulator.
//!
//! Each channel runs two workers:
//! - RX reads exactly one telemetry frame at a time, decodes it, replaces the
//!   latest snapshot and notifies the listener.
//! - TX ticks at a fixed period and sends the held command frame when it is
//!   dirty or a keepalive is due, but only while the simulator reports ready.
//!
//! Any socket error drops the link. Whichever worker needs it next redials
//! with exponential backoff, and the first frame after a reconnect always
//! carries the last locally held command.

use crate::config::ChannelConfig;
use crate::error::ConfigError;
use crate::logging::{tracing_sink, LogSink};
use crate::protocol::{FrameBuffer, FrameLayout, TelemetryFrame, Value, MAX_FRAME_BYTES};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const PAUSE_SLICE: Duration = Duration::from_millis(10);
const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Anything that accepts validated command writes.
pub trait CommandTarget: Send + Sync {
    fn name(&self) -> &str;

    /// Checks updates without applying them.
    fn validate(&self, _updates: &[(&str, f64)]) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Applies updates atomically. Returns whether any held value changed.
    fn set_cmd(&self, updates: &[(&str, f64)]) -> Result<bool, ConfigError>;

    /// Releases the underlying link. Called during scenario teardown.
    fn disconnect(&self) {}
}

pub type TelemetryListener = Arc<dyn Fn(&TelemetryFrame) + Send + Sync>;

pub struct ChannelOptions {
    pub listener: Option<TelemetryListener>,
    pub log: LogSink,
    pub join_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            listener: None,
            log: tracing_sink(),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub connected: bool,
    pub connects: u64,
    pub reconnects: u64,
    pub rx_frames: u64,
    pub tx_frames: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub last_connect: Option<Instant>,
    pub last_disconnect: Option<Instant>,
    pub last_rx: Option<Instant>,
    pub last_tx: Option<Instant>,
}

struct CommandState {
    values: Vec<Value>,
    dirty: bool,
}

struct Link {
    stream: Option<Arc<TcpStream>>,
    generation: u64,
}

type Connection = (Arc<TcpStream>, u64);

struct Shared {
    config: ChannelConfig,
    telemetry: Arc<FrameLayout>,
    listener: Option<TelemetryListener>,
    log: LogSink,

    stopping: AtomicBool,
    connecting: AtomicBool,

    latest: Mutex<Option<TelemetryFrame>>,
    command: Mutex<CommandState>,
    link: Mutex<Link>,
    stats: Mutex<ChannelStats>,
}

pub struct ProtocolChannel {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    join_timeout: Duration,
}

impl ProtocolChannel {
    pub fn new(config: ChannelConfig, options: ChannelOptions) -> Self {
        let telemetry = Arc::new(config.telemetry.clone());
        let values = config.command.zero_values();

        Self {
            shared: Arc::new(Shared {
                config,
                telemetry,
                listener: options.listener,
                log: options.log,
                stopping: AtomicBool::new(false),
                connecting: AtomicBool::new(false),
                latest: Mutex::new(None),
                // nothing goes out until the first real write
                command: Mutex::new(CommandState {
                    values,
                    dirty: false,
                }),
                link: Mutex::new(Link {
                    stream: None,
                    generation: 0,
                }),
                stats: Mutex::new(ChannelStats::default()),
            }),
            workers: Mutex::new(Vec::new()),
            join_timeout: options.join_timeout,
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    /// Spawns the RX (and, if enabled, TX) workers. No-op while already running.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if workers.iter().any(|w| !w.is_finished()) {
            return;
        }
        workers.clear();
        self.shared.stopping.store(false, Ordering::SeqCst);

        let name = &self.shared.config.name;
        let rx = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name(format!("{name}-RX"))
            .spawn(move || rx.rx_loop())
        {
            Ok(handle) => workers.push(handle),
            Err(e) => self.shared.log(&format!("[{name}] failed to spawn RX worker: {e}")),
        }

        if self.shared.config.enable_tx {
            let tx = Arc::clone(&self.shared);
            match thread::Builder::new()
                .name(format!("{name}-TX"))
                .spawn(move || tx.tx_loop())
            {
                Ok(handle) => workers.push(handle),
                Err(e) => self.shared.log(&format!("[{name}] failed to spawn TX worker: {e}")),
            }
        }
    }

    /// Signals the workers, closes the socket, and waits a bounded time for
    /// each worker. A worker that does not exit in time is left behind.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.close_link();

        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let deadline = Instant::now() + self.join_timeout;
            while !worker.is_finished() && Instant::now() < deadline {
                thread::sleep(PAUSE_SLICE);
            }
            if worker.is_finished() {
                let _ = worker.join();
            } else {
                let label = worker.thread().name().unwrap_or("worker").to_string();
                warn!(worker = %label, "worker did not exit in time; abandoning it");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.workers.lock().iter().any(|w| !w.is_finished())
    }

    pub fn get_latest_meas(&self) -> Option<TelemetryFrame> {
        self.shared.latest.lock().clone()
    }

    pub fn get_cmd_state(&self) -> Vec<(String, Value)> {
        let values = self.shared.command.lock().values.clone();
        self.shared
            .config
            .command
            .fields()
            .iter()
            .zip(values)
            .map(|(f, v)| (f.name.clone(), v))
            .collect()
    }

    pub fn is_dirty(&self) -> bool {
        self.shared.command.lock().dirty
    }

    pub fn stats(&self) -> ChannelStats {
        self.shared.stats.lock().clone()
    }

    pub fn set_cmd_word(&self, name: &str, value: f64) -> Result<bool, ConfigError> {
        self.set_cmd(&[(name, value)])
    }
}

impl CommandTarget for ProtocolChannel {
    fn name(&self) -> &str {
        &self.shared.config.name
    }

    fn validate(&self, updates: &[(&str, f64)]) -> Result<(), ConfigError> {
        self.shared.coerce_all(updates).map(|_| ())
    }

    fn set_cmd(&self, updates: &[(&str, f64)]) -> Result<bool, ConfigError> {
        let coerced = self.shared.coerce_all(updates)?;

        let mut state = self.shared.command.lock();
        let mut changed = false;
        for (slot, value) in coerced {
            if state.values[slot] != value {
                state.values[slot] = value;
                changed = true;
            }
        }
        if changed {
            state.dirty = true;
        }
        Ok(changed)
    }

    fn disconnect(&self) {
        self.stop();
    }
}

impl Drop for ProtocolChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn log(&self, line: &str) {
        (self.log)(line);
    }

    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Sleeps up to `total`, waking early once a stop is requested.
    fn pause(&self, total: Duration) {
        let deadline = Instant::now() + total;
        loop {
            if self.stopping() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep(PAUSE_SLICE.min(deadline - now));
        }
    }

    fn coerce_all(&self, updates: &[(&str, f64)]) -> Result<Vec<(usize, Value)>, ConfigError> {
        let layout = &self.config.command;
        updates
            .iter()
            .map(|&(field, raw)| {
                let slot = layout.slot(field).ok_or_else(|| ConfigError::UnknownField {
                    channel: self.config.name.clone(),
                    field: field.to_string(),
                })?;
                let value = layout.fields()[slot].kind.coerce(raw).ok_or_else(|| {
                    ConfigError::NonFiniteInteger {
                        channel: self.config.name.clone(),
                        field: field.to_string(),
                        value: raw,
                    }
                })?;
                Ok((slot, value))
            })
            .collect()
    }

    fn current(&self) -> Option<Connection> {
        let link = self.link.lock();
        link.stream.as_ref().map(|s| (Arc::clone(s), link.generation))
    }

    fn dial(&self) -> io::Result<TcpStream> {
        let timeout = self.config.connect_timeout();
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "endpoint resolved to no address");
        for addr in (self.config.host.as_str(), self.config.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    if self.config.tcp_nodelay {
                        let _ = stream.set_nodelay(true);
                    }
                    stream.set_read_timeout(None)?;
                    return Ok(stream);
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// Returns the live connection, dialing with backoff if there is none.
    /// Only one worker dials at a time; the other waits for the result.
    fn ensure_connected(&self) -> Option<Connection> {
        let mut backoff = self.config.initial_backoff();
        loop {
            if self.stopping() {
                return None;
            }
            if let Some(conn) = self.current() {
                return Some(conn);
            }
            if self
                .connecting
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                self.pause(PAUSE_SLICE);
                continue;
            }

            debug!(channel = %self.config.name, endpoint = %self.config.endpoint(), "dialing");
            let dialed = self.dial();
            let outcome = match dialed {
                Ok(stream) => Some(self.install(stream)),
                Err(e) => {
                    self.log(&format!("[{}] Connect failed: {e}", self.config.name));
                    None
                }
            };
            self.connecting.store(false, Ordering::Release);

            match outcome {
                Some(Some(conn)) => return Some(conn),
                Some(None) => return None,
                None if !self.config.reconnect => return None,
                None => {
                    self.pause(backoff);
                    backoff = (backoff * 2).min(self.config.max_backoff());
                }
            }
        }
    }

    fn install(&self, stream: TcpStream) -> Option<Connection> {
        if self.stopping() {
            let _ = stream.shutdown(Shutdown::Both);
            return None;
        }

        let stream = Arc::new(stream);
        let generation = {
            let mut link = self.link.lock();
            link.generation += 1;
            link.stream = Some(Arc::clone(&stream));
            link.generation
        };

        let reconnected = {
            let mut stats = self.stats.lock();
            stats.connected = true;
            stats.connects += 1;
            stats.last_connect = Some(Instant::now());
            if stats.connects > 1 {
                stats.reconnects += 1;
            }
            stats.connects > 1
        };

        if reconnected {
            // resynchronise: the peer may have missed writes while the link was down
            self.command.lock().dirty = true;
        }

        self.log(&format!("[{}] Connected to {}", self.config.name, self.config.endpoint()));
        Some((stream, generation))
    }

    /// Drops the link if it is still the one the caller was using.
    fn drop_link(&self, generation: u64, reason: &str) {
        let taken = {
            let mut link = self.link.lock();
            if link.generation == generation {
                link.stream.take()
            } else {
                None
            }
        };
        if let Some(stream) = taken {
            let _ = stream.shutdown(Shutdown::Both);
            {
                let mut stats = self.stats.lock();
                stats.connected = false;
                stats.last_disconnect = Some(Instant::now());
            }
            self.log(&format!("[{}] Disconnected ({reason})", self.config.name));
        }
    }

    fn close_link(&self) {
        let taken = self.link.lock().stream.take();
        if let Some(stream) = taken {
            let _ = stream.shutdown(Shutdown::Both);
            let mut stats = self.stats.lock();
            stats.connected = false;
            stats.last_disconnect = Some(Instant::now());
        }
    }

    fn rx_loop(&self) {
        let frame_len = self.telemetry.frame_len();
        let mut buf = [0u8; MAX_FRAME_BYTES];

        while !self.stopping() {
            let Some((stream, generation)) = self.ensure_connected() else {
                break;
            };

            match read_frame(&stream, &mut buf[..frame_len]) {
                Ok(()) => match self.telemetry.decode(&buf[..frame_len]) {
                    Ok(frame) => self.publish(frame),
                    Err(e) => {
                        self.stats.lock().rx_errors += 1;
                        self.log(&format!("[{}] decode error: {e}", self.config.name));
                    }
                },
                Err(e) => {
                    if self.stopping() {
                        break;
                    }
                    self.stats.lock().rx_errors += 1;
                    self.drop_link(generation, &format!("RX error: {e}"));
                }
            }
        }
        debug!(channel = %self.config.name, "RX worker exiting");
    }

    fn publish(&self, frame: TelemetryFrame) {
        *self.latest.lock() = Some(frame.clone());
        {
            let mut stats = self.stats.lock();
            stats.rx_frames += 1;
            stats.last_rx = Some(Instant::now());
        }

        if let Some(listener) = &self.listener {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener(&frame))) {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                self.log(&format!("[{}] on_meas error: {msg}", self.config.name));
            }
        }
    }

    fn tx_loop(&self) {
        let period = self.config.tx_period();
        let keepalive = self.config.tx_keepalive();
        let mut last_tx: Option<Instant> = None;

        while !self.stopping() {
            let Some((stream, generation)) = self.ensure_connected() else {
                break;
            };

            let now = Instant::now();
            let keepalive_due = keepalive
                .map_or(false, |every| last_tx.map_or(true, |t| now.duration_since(t) >= every));
            let dirty = self.command.lock().dirty;

            if (dirty || keepalive_due) && self.ok_to_send() {
                if let Some(payload) = self.take_payload(keepalive_due) {
                    match (&*stream).write_all(&payload) {
                        Ok(()) => {
                            last_tx = Some(now);
                            let mut stats = self.stats.lock();
                            stats.tx_frames += 1;
                            stats.last_tx = Some(now);
                        }
                        Err(e) => {
                            self.command.lock().dirty = true;
                            self.stats.lock().tx_errors += 1;
                            self.drop_link(generation, &format!("TX error: {e}"));
                        }
                    }
                }
            }

            self.pause(period);
        }
        debug!(channel = %self.config.name, "TX worker exiting");
    }

    /// The simulator paces us: with a gate configured, only send after it last reported 1.
    fn ok_to_send(&self) -> bool {
        let Some(field) = self.config.send_gate() else {
            return true;
        };
        let latest = self.latest.lock();
        matches!(latest.as_ref().and_then(|f| f.get(field)), Some(Value::Int(1)))
    }

    /// Copies the held command and clears the dirty flag in one step.
    fn take_payload(&self, force: bool) -> Option<FrameBuffer> {
        let encoded = {
            let mut state = self.command.lock();
            if !(state.dirty || force) {
                return None;
            }
            state.dirty = false;
            self.config.command.encode(&state.values)
        };
        match encoded {
            Ok(buf) => Some(buf),
            Err(e) => {
                self.log(&format!("[{}] encode error: {e}", self.config.name));
                None
            }
        }
    }
}

/// Fills `buf` completely, accumulating partial reads.
fn read_frame(stream: &TcpStream, buf: &mut [u8]) -> io::Result<()> {
    let mut reader = stream;
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "socket closed by peer",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::null_sink;
    use crate::protocol::FieldSpec;

    fn channel() -> ProtocolChannel {
        let config = ChannelConfig::new(
            "T1",
            "127.0.0.1",
            1,
            FrameLayout::new(vec![FieldSpec::int("READY"), FieldSpec::float("P")]).unwrap(),
            FrameLayout::new(vec![FieldSpec::int("BRK"), FieldSpec::float("SET")]).unwrap(),
        );
        ProtocolChannel::new(
            config,
            ChannelOptions {
                log: null_sink(),
                ..ChannelOptions::default()
            },
        )
    }

    #[test]
    fn test_initial_state_is_zero_and_clean() {
        let ch = channel();
        assert!(!ch.is_dirty());
        assert_eq!(
            ch.get_cmd_state(),
            vec![("BRK".to_string(), Value::Int(0)), ("SET".to_string(), Value::Float(0.0))]
        );
        assert!(ch.get_latest_meas().is_none());
    }

    #[test]
    fn test_unknown_field_leaves_state_untouched() {
        let ch = channel();
        let err = ch.set_cmd(&[("BRK", 1.0), ("NOPE", 2.0)]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownField { ref field, .. } if field == "NOPE"));
        assert_eq!(ch.get_cmd_state()[0].1, Value::Int(0));
        assert!(!ch.is_dirty());
    }

    #[test]
    fn test_identical_writes_mark_dirty_once() {
        let ch = channel();
        assert!(ch.set_cmd(&[("BRK", 1.0)]).unwrap());
        assert!(ch.is_dirty());

        // simulate a send clearing the flag
        assert!(ch.shared.take_payload(false).is_some());
        assert!(!ch.is_dirty());

        assert!(!ch.set_cmd(&[("BRK", 1.0)]).unwrap());
        assert!(!ch.is_dirty());
        assert!(ch.shared.take_payload(false).is_none());
    }

    #[test]
    fn test_values_coerced_to_declared_kind() {
        let ch = channel();
        ch.set_cmd(&[("BRK", 1.7), ("SET", 3.0)]).unwrap();
        let state = ch.get_cmd_state();
        assert_eq!(state[0].1, Value::Int(1));
        assert_eq!(state[1].1, Value::Float(3.0));

        assert!(matches!(
            ch.set_cmd(&[("BRK", f64::INFINITY)]),
            Err(ConfigError::NonFiniteInteger { .. })
        ));
    }

    #[test]
    fn test_gate_requires_ready_telemetry() {
        let mut config = channel().config().clone();
        config.ready_to_send = Some("READY".into());
        let ch = ProtocolChannel::new(
            config,
            ChannelOptions {
                log: null_sink(),
                ..ChannelOptions::default()
            },
        );
        assert!(!ch.shared.ok_to_send());

        let layout = Arc::clone(&ch.shared.telemetry);
        let frame = TelemetryFrame::new(Arc::clone(&layout), &[Value::Int(0), Value::Float(0.0)]).unwrap();
        ch.shared.publish(frame);
        assert!(!ch.shared.ok_to_send());

        let frame = TelemetryFrame::new(layout, &[Value::Int(1), Value::Float(0.0)]).unwrap();
        ch.shared.publish(frame);
        assert!(ch.shared.ok_to_send());
    }

    #[test]
    fn test_stop_without_start_is_harmless() {
        let ch = channel();
        ch.stop();
        ch.stop();
        assert!(!ch.is_running());
    }
}
