use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use hilbus::commands::Range;
use hilbus::config::{HarnessConfig, DEFAULT_HOST, PCC_CHANNEL};
use hilbus::harness::Harness;
use hilbus::logging::{init_tracing, tracing_sink};
use hilbus::protocol::FrameLayout;
use hilbus::sequencer::AbortCause;
use std::process;

const FAULT_DURATION_FIELD: &str = "REM_LGFTIMEx";
const FAULT_DURATION_CYCLES: Range = Range { lo: 0.0, hi: 600.0 };

fn main() {
    let matches = App::new("hilbus")
        .version("0.1.0")
        .author("Microgrid Test Engineering Team")
        .about("Hardware-in-the-loop islanding and load-ramp harness")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON harness configuration (defaults to the microgrid presets)")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Simulator host used by the presets")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("Run the islanding and load-ramp scenario")
                .arg(
                    Arg::with_name("open-loop")
                        .long("open-loop")
                        .help("Ramp the load without the supervisory controller"),
                )
                .arg(
                    Arg::with_name("inject")
                        .long("inject")
                        .help("Route telemetry and commands through the fault injector"),
                )
                .arg(
                    Arg::with_name("seed")
                        .long("seed")
                        .value_name("SEED")
                        .help("Seed for the fault injector's random decisions")
                        .takes_value(true)
                        .validator(|v| match v.parse::<u64>() {
                            Ok(_) => Ok(()),
                            Err(_) => Err("Seed must be an unsigned integer".into()),
                        }),
                )
                .arg(
                    Arg::with_name("fault-cycles")
                        .long("fault-cycles")
                        .value_name("CYCLES")
                        .help("Line-to-ground fault duration on the PCC channel, in cycles")
                        .takes_value(true)
                        .validator(|v| match v.parse::<f64>() {
                            Ok(_) => Ok(()),
                            Err(_) => Err("Fault duration must be a number of cycles".into()),
                        }),
                ),
        )
        .subcommand(SubCommand::with_name("check-config").about("Validate the configuration and exit"))
        .subcommand(
            SubCommand::with_name("layouts")
                .about("Print every channel's frame layouts")
                .arg(
                    Arg::with_name("format")
                        .short("f")
                        .long("format")
                        .value_name("FORMAT")
                        .takes_value(true)
                        .possible_values(&["table", "json"])
                        .default_value("table"),
                ),
        )
        .get_matches();

    init_tracing(matches.is_present("verbose"));

    let config = match load_config(&matches) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {}", "Configuration error:".bright_red().bold(), e);
            process::exit(2);
        }
    };

    let code = match matches.subcommand() {
        ("run", Some(sub)) => handle_run(config, sub),
        ("check-config", Some(_)) => handle_check(&config),
        ("layouts", Some(sub)) => handle_layouts(&config, sub.value_of("format").unwrap_or("table")),
        _ => 2,
    };
    process::exit(code);
}

fn load_config(matches: &ArgMatches<'_>) -> Result<HarnessConfig, Box<dyn std::error::Error>> {
    match matches.value_of("config") {
        Some(path) => Ok(HarnessConfig::from_file(path)?),
        None => {
            let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
            Ok(HarnessConfig::microgrid(host)?)
        }
    }
}

fn handle_run(mut config: HarnessConfig, matches: &ArgMatches<'_>) -> i32 {
    if matches.is_present("inject") {
        config.fault_injection.enabled = true;
    }
    if let Some(seed) = matches.value_of("seed").and_then(|s| s.parse().ok()) {
        config.fault_injection.seed = Some(seed);
    }
    let closed_loop = !matches.is_present("open-loop");

    println!("{}", "hilbus - islanding and load-ramp scenario".bright_blue().bold());
    for channel in &config.channels {
        println!("  {} {}", channel.name.bright_white(), channel.endpoint().dimmed());
    }
    println!(
        "  {} {}",
        "mode:".bright_white(),
        if closed_loop { "closed loop".bright_green() } else { "open loop".yellow() }
    );

    let harness = match Harness::new(config, tracing_sink()) {
        Ok(h) => h,
        Err(e) => {
            eprintln!("{} {}", "Configuration error:".bright_red().bold(), e);
            return 2;
        }
    };
    let sequencer = match harness.sequencer(closed_loop) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{} {}", "Configuration error:".bright_red().bold(), e);
            return 2;
        }
    };

    if let Some(cycles) = matches.value_of("fault-cycles").and_then(|s| s.parse().ok()) {
        match harness.set_fault_duration(PCC_CHANNEL, FAULT_DURATION_FIELD, cycles, FAULT_DURATION_CYCLES) {
            Ok(wire) => println!("  {} {cycles} cycles (wire value {wire})", "fault duration:".bright_white()),
            Err(e) => {
                eprintln!("{} {}", "Configuration error:".bright_red().bold(), e);
                return 2;
            }
        }
    }

    harness.start_all();
    let outcome = sequencer.run();
    harness.stop_all();

    let code = match &outcome {
        Ok(report) => {
            println!("\n{} {}", "PASS".bright_green().bold(), "scenario completed".bright_green());
            println!("  {} {}", "stages:".bright_white(), report.stages.len());
            println!("  {} {}", "generator close attempts:".bright_white(), report.generator_close_attempts);
            println!(
                "  {} {:.3} after {} ticks",
                "final load:".bright_white(),
                report.final_load,
                report.ramp_ticks
            );
            println!("  {} {:.3}s", "endurance:".bright_white(), report.endurance.as_secs_f64());
            println!("  {} {}", "final:".bright_white(), report.snapshot);
            0
        }
        Err(e) => {
            let label = match e.cause {
                AbortCause::ProtectionTrip => "TRIP".bright_yellow().bold(),
                _ => "ABORT".bright_red().bold(),
            };
            println!("\n{} {}", label, e.to_string().bright_red());
            if let Some(elapsed) = e.elapsed_since_ramp {
                println!("  {} {:.3}s", "since ramp start:".bright_white(), elapsed.as_secs_f64());
            }
            println!("  {} {}", "final:".bright_white(), e.snapshot);
            1
        }
    };

    println!("\n{}", "Channel statistics".bright_blue().bold());
    for channel in harness.channels() {
        let stats = channel.stats();
        println!(
            "  {} rx={} tx={} rx_err={} tx_err={} connects={} reconnects={}",
            channel.config().name.bright_white(),
            stats.rx_frames,
            stats.tx_frames,
            stats.rx_errors,
            stats.tx_errors,
            stats.connects,
            stats.reconnects
        );
    }
    if let Some(injector) = harness.injector() {
        println!("  {} {:?}", "injector:".bright_white(), injector.stats());
    }
    code
}

fn handle_check(config: &HarnessConfig) -> i32 {
    match config.validate() {
        Ok(()) => {
            println!("{} {}", "OK".bright_green().bold(), "configuration is valid".bright_green());
            for channel in &config.channels {
                println!(
                    "  {} {} telemetry={} command={} gate={}",
                    channel.name.bright_white(),
                    channel.endpoint(),
                    channel.telemetry.len(),
                    channel.command.len(),
                    channel.send_gate().unwrap_or("-")
                );
            }
            0
        }
        Err(e) => {
            println!("{} {}", "INVALID".bright_red().bold(), e);
            1
        }
    }
}

fn handle_layouts(config: &HarnessConfig, format: &str) -> i32 {
    if format == "json" {
        return match serde_json::to_string_pretty(&config.channels) {
            Ok(json) => {
                println!("{json}");
                0
            }
            Err(e) => {
                eprintln!("{} {}", "Serialization error:".bright_red(), e);
                1
            }
        };
    }

    for channel in &config.channels {
        println!("\n{} {}", channel.name.bright_blue().bold(), channel.endpoint().dimmed());
        print_layout("telemetry", &channel.telemetry);
        print_layout("command", &channel.command);
    }
    0
}

fn print_layout(direction: &str, layout: &FrameLayout) {
    println!(
        "  {} {} fields, {} bytes, signature {}",
        direction.bright_white(),
        layout.len(),
        layout.frame_len(),
        layout.signature().bright_cyan()
    );
    for (slot, field) in layout.fields().iter().enumerate() {
        println!("    {slot:>2} {:<16} {:?}", field.name, field.kind);
    }
}
