use hilbus::config::{microgrid_channels, ChannelConfig};
use hilbus::logging::init_tracing;
use hilbus::protocol::{FrameLayout, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time;
use tracing::{error, info, warn};

const BIND_HOST: &str = "127.0.0.1";
const PLANT_STEP: Duration = Duration::from_millis(10);
const TELEMETRY_PERIOD: Duration = Duration::from_millis(20);

const GENERATOR_RATING: f64 = 1.0;
const OVERLOAD_LIMIT: f64 = 1.5;
const OVERLOAD_TRIP_S: f64 = 1.0;
const DROOP: f64 = 0.02;
const SPEED_TAU_S: f64 = 0.2;
const DETECTION_BAND: f64 = 0.03;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Just enough microgrid to walk the scenario: a tie breaker, a generator
/// with a reset-latched breaker and overload trip, a storage unit and a load.
#[derive(Debug)]
struct Plant {
    grid_cmd: bool,
    grid_closed: bool,

    storage_enabled: bool,
    storage_breaker: bool,
    storage_pref: f64,
    storage_qref: f64,

    gen_enabled: bool,
    gen_breaker: bool,
    gen_wref: f64,
    gen_pref: f64,
    reset_cmd: bool,
    reset_edge: bool,

    load_p: f64,
    load_q: f64,

    fault_cmd: bool,
    fault_time_s: f64,
    fault_remaining_s: f64,

    gen_p: f64,
    loading: f64,
    speed: f64,
    voltage: f64,
    overloaded: bool,
    overload_s: f64,
    detection: bool,
}

impl Default for Plant {
    fn default() -> Self {
        Self {
            grid_cmd: false,
            grid_closed: false,
            storage_enabled: false,
            storage_breaker: false,
            storage_pref: 0.0,
            storage_qref: 0.0,
            gen_enabled: false,
            gen_breaker: false,
            gen_wref: 1.0,
            gen_pref: 0.0,
            reset_cmd: false,
            reset_edge: false,
            load_p: 0.0,
            load_q: 0.0,
            fault_cmd: false,
            fault_time_s: 0.0,
            fault_remaining_s: 0.0,
            gen_p: 0.0,
            loading: 0.0,
            speed: 1.0,
            voltage: 1.0,
            overloaded: false,
            overload_s: 0.0,
            detection: false,
        }
    }
}

impl Plant {
    fn storage_p(&self) -> f64 {
        if self.storage_enabled && self.storage_breaker {
            self.storage_pref
        } else {
            0.0
        }
    }

    fn write(&mut self, field: &str, value: f64) {
        let on = value >= 0.5;
        match field {
            "REM_GRID" => self.grid_cmd = on,
            "REM_LGFLTx" => {
                if on && !self.fault_cmd {
                    self.fault_remaining_s = self.fault_time_s;
                }
                self.fault_cmd = on;
            }
            "REM_LGFTIMEx" => self.fault_time_s = value.max(0.0),
            "REM_Preftest" => self.storage_pref = value,
            "REM_Qreftest" => self.storage_qref = value,
            "REM_BLOCK" => self.storage_enabled = on,
            "REM_BESSBRK" => self.storage_breaker = on,
            "REM_BLOCKGEN" => self.gen_enabled = on,
            "REM_Wref" => self.gen_wref = value,
            "REM_PREF" => self.gen_pref = value,
            "REM_RESETGEN" => {
                if on && !self.reset_cmd {
                    self.reset_edge = true;
                }
                self.reset_cmd = on;
            }
            "REM_PLOAD" => self.load_p = value.max(0.0),
            "REM_QLOAD" => self.load_q = value,
            _ => {}
        }
    }

    fn step(&mut self, dt: f64) {
        self.grid_closed = self.grid_cmd;

        if !self.gen_enabled {
            self.gen_breaker = false;
        }
        if self.reset_edge {
            self.reset_edge = false;
            if self.gen_enabled && !self.detection {
                self.gen_breaker = true;
                self.overload_s = 0.0;
            }
        }

        self.gen_p = match (self.gen_breaker, self.grid_closed) {
            (false, _) => 0.0,
            (true, true) => self.gen_pref.max(0.0),
            (true, false) => (self.load_p - self.storage_p()).max(0.0),
        };
        self.loading = self.gen_p / GENERATOR_RATING;
        self.overloaded = self.gen_breaker && self.loading > OVERLOAD_LIMIT;
        self.overload_s = if self.overloaded { self.overload_s + dt } else { 0.0 };
        if self.overload_s > OVERLOAD_TRIP_S {
            warn!(loading = self.loading, "generator overload trip");
            self.gen_breaker = false;
            self.overloaded = false;
            self.overload_s = 0.0;
        }

        let speed_target = if self.grid_closed {
            1.0
        } else if self.gen_breaker {
            self.gen_wref - DROOP * (self.loading - self.gen_pref)
        } else {
            0.9
        };
        self.speed += (speed_target - self.speed) * (dt / SPEED_TAU_S).min(1.0);
        self.detection = !self.grid_closed && (self.speed - 1.0).abs() > DETECTION_BAND;

        if self.fault_remaining_s > 0.0 {
            self.fault_remaining_s = (self.fault_remaining_s - dt).max(0.0);
        }
        let sag = if self.fault_remaining_s > 0.0 { 0.3 } else { 0.0 };
        self.voltage = if self.grid_closed || self.gen_breaker {
            1.0 - 0.05 * (self.loading - 1.0).max(0.0) - sag
        } else {
            0.0
        };
    }

    fn read(&self, field: &str, seq: i32) -> f64 {
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        let grid_p = if self.grid_closed {
            self.load_p - self.gen_p - self.storage_p()
        } else {
            0.0
        };

        if field.starts_with("NewDataFlag") || field.starts_with("ReadyToSend") {
            return 1.0;
        }
        if field.starts_with("NewDataSeq") {
            return f64::from(seq);
        }

        match field {
            "MODE" => 1.0,
            "GRID" => flag(self.grid_closed),
            "PGRID" => grid_p,
            "QGRID" => if self.grid_closed { self.load_q - self.storage_qref } else { 0.0 },
            "N650RMSPU" => if self.grid_closed { 1.0 } else { self.voltage },
            "IGRIDA" | "IGRIDB" | "IGRIDC" => grid_p.abs(),

            "BRK1" | "BRK1island" => flag(self.storage_breaker),
            "block" => flag(self.storage_enabled),
            "Pmeas" => self.storage_p(),
            "Qmeas" => if self.storage_p() != 0.0 { self.storage_qref } else { 0.0 },
            "OMEGA" => self.speed,
            "SOC1" => 0.8,
            "VLOADRMS" => self.voltage,

            "PGEN" | "PMACH" => self.gen_p,
            "QGEN" | "QMACH" => if self.gen_breaker && !self.grid_closed { self.load_q } else { 0.0 },
            "BRKGEN" => flag(self.gen_breaker),
            "SMACH" => self.loading,
            "GENRMSPU" => if self.gen_breaker { self.voltage } else { 0.0 },
            "OVERLOADED" => flag(self.overloaded),
            "WPU" => self.speed,
            "W_DETECTED" => flag(self.detection),

            "PLOAD680" => if self.voltage > 0.0 { self.load_p } else { 0.0 },
            "QLOAD680" => if self.voltage > 0.0 { self.load_q } else { 0.0 },
            "N680RMSPU" => self.voltage,
            _ => 0.0,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(false);

    println!("Loopback microgrid simulator");
    println!("============================");

    let plant = Arc::new(Mutex::new(Plant::default()));
    for channel in microgrid_channels(BIND_HOST)? {
        let plant = Arc::clone(&plant);
        tokio::spawn(async move {
            let name = channel.name.clone();
            if let Err(e) = serve(channel, plant).await {
                error!(channel = %name, "server error: {}", e);
            }
        });
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut interval = time::interval(PLANT_STEP);
    loop {
        tokio::select! {
            _ = interval.tick() => plant.lock().await.step(PLANT_STEP.as_secs_f64()),
            _ = &mut shutdown => break,
        }
    }

    println!("Simulator stopped");
    Ok(())
}

async fn serve(channel: ChannelConfig, plant: Arc<Mutex<Plant>>) -> Result<(), BoxError> {
    let listener = TcpListener::bind(channel.endpoint()).await?;
    info!(
        channel = %channel.name,
        telemetry = %channel.telemetry.signature(),
        command = %channel.command.signature(),
        "listening on {}",
        channel.endpoint()
    );

    let channel = Arc::new(channel);
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!(channel = %channel.name, "client connected: {}", addr);
                let channel = Arc::clone(&channel);
                let plant = Arc::clone(&plant);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, Arc::clone(&channel), plant).await {
                        warn!(channel = %channel.name, "client {} error: {}", addr, e);
                    }
                    info!(channel = %channel.name, "client {} disconnected", addr);
                });
            }
            Err(e) => error!(channel = %channel.name, "accept failed: {}", e),
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    channel: Arc<ChannelConfig>,
    plant: Arc<Mutex<Plant>>,
) -> Result<(), BoxError> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    let command = Arc::new(channel.command.clone());
    let command_plant = Arc::clone(&plant);
    let name = channel.name.clone();
    let command_task = tokio::spawn(async move {
        let mut buf = vec![0u8; command.frame_len()];
        while reader.read_exact(&mut buf).await.is_ok() {
            match command.decode(&buf) {
                Ok(frame) => {
                    let mut plant = command_plant.lock().await;
                    for (field, value) in frame.iter() {
                        plant.write(field, value.as_f64());
                    }
                }
                Err(e) => warn!(channel = %name, "bad command frame: {}", e),
            }
        }
    });

    let telemetry: &FrameLayout = &channel.telemetry;
    let mut interval = time::interval(TELEMETRY_PERIOD);
    let mut seq: i32 = 0;
    loop {
        interval.tick().await;
        seq = seq.wrapping_add(1);
        let values: Vec<Value> = {
            let plant = plant.lock().await;
            telemetry
                .fields()
                .iter()
                .map(|f| f.kind.coerce(plant.read(&f.name, seq)).unwrap_or(f.kind.zero()))
                .collect()
        };
        let bytes = telemetry.encode(&values)?;
        if let Err(e) = writer.write_all(&bytes).await {
            warn!(channel = %channel.name, "telemetry write failed: {}", e);
            break;
        }
    }

    command_task.abort();
    Ok(())
}
