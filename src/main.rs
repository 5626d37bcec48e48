//! ADAM-5000/TCP rack CLI
//!
//! A command-line interface for ADAM-5000/TCP I/O racks.
//!
//! This tool allows users to:
//! - Read and write single analog or digital channels.
//! - Overwrite all channels of a slot with one bulk command.
//! - Write named, calibrated channels with range checking.
//! - Print a snapshot of every channel of the rack.
//! - Run a continuous monitor printing averaged engineering values.
//!
//! The CLI leverages the `adam5k_lib` crate for the protocol, the polling
//! client and the calibration table.

use adam5k_lib::{
    calibration::CalibrationTable,
    client::{Adam5K, Tick},
    config::{Config, DEFAULT_CONFIG_FILE},
    monitor::{Averages, ChannelMonitor},
    protocol as proto,
    snapshot::DeviceSnapshot,
};
use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::Confirm;
use directories_next::ProjectDirs;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::{panic, time::Duration};

mod commandline;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

fn user_config_file() -> Option<PathBuf> {
    ProjectDirs::from("me", "adam5k", "adamctl")
        .map(|project_dirs| project_dirs.config_dir().join(DEFAULT_CONFIG_FILE))
}

/// Loads the configuration: an explicit file must exist, otherwise the
/// working directory and the user configuration directory are searched.
fn load_config(explicit: Option<&PathBuf>) -> Result<Config> {
    if let Some(path) = explicit {
        return Config::load(path).with_context(|| format!("Cannot load config file {path:?}"));
    }
    let candidates = std::iter::once(PathBuf::from(DEFAULT_CONFIG_FILE)).chain(user_config_file());
    for path in candidates {
        if path.is_file() {
            info!("Using config file {path:?}");
            return Config::load(&path)
                .with_context(|| format!("Cannot load config file {path:?}"));
        }
    }
    debug!("No config file found, using defaults");
    Ok(Config::default())
}

fn apply_overrides(config: &mut Config, args: &commandline::CliArgs) {
    if let Some(host) = &args.host {
        config.device.host = host.clone();
    }
    if let Some(port) = args.port {
        config.device.port = port;
    }
    if let Some(rack) = args.rack {
        config.device.rack = rack;
    }
    if args.timeout.is_some() {
        config.device.io_timeout = args.timeout;
    }
}

fn connect(config: &Config) -> Result<Adam5K> {
    let device = &config.device;
    info!(
        "Attempting to connect to {}:{} (Rack: {})...",
        device.host, device.port, device.rack
    );
    let client = Adam5K::with_options(device.client_options());
    client
        .connect(&device.host, device.port, device.rack)
        .with_context(|| format!("Cannot connect to rack at {}:{}", device.host, device.port))?;
    Ok(client)
}

fn print_snapshot(snapshot: &DeviceSnapshot) {
    let per_slot = proto::SlotGroup::Analog.channels_per_slot() as usize;
    for (slot, counts) in snapshot.analog().chunks(per_slot).enumerate() {
        let counts: Vec<String> = counts.iter().map(|count| format!("{count:5}")).collect();
        println!("Analog slot {slot}:  {}", counts.join(" "));
    }
    for (slot, word) in snapshot.digital().iter().enumerate() {
        let bits: String = proto::decode_coil_word(*word, 16)
            .into_iter()
            .map(|state| if state { '1' } else { '0' })
            .collect();
        println!("Digital slot {slot}: {bits} (0x{word:04X})");
    }
}

fn print_averages(averages: &Averages) {
    let line: Vec<String> = averages
        .iter()
        .map(|(name, value)| format!("{name}={value:.2}"))
        .collect();
    println!("{}", line.join(" "));
}

fn confirm_write_slot(group: proto::SlotGroup, slot: u8) -> Result<bool> {
    println!("WARNING: This overwrites every output channel of {group} slot {slot}.");
    Confirm::new()
        .with_prompt("Do you want to continue?")
        .default(false)
        .show_default(true)
        .interact()
        .context("Failed to get user confirmation.")
}

fn slot_pattern(group: proto::SlotGroup, pattern: &str) -> Result<proto::SlotPattern> {
    let pattern = match group {
        proto::SlotGroup::Digital => proto::SlotPattern::Coils(
            commandline::parse_bits(pattern).map_err(anyhow::Error::msg)?,
        ),
        proto::SlotGroup::Analog => proto::SlotPattern::Raw(
            commandline::parse_hex_bytes(pattern).map_err(anyhow::Error::msg)?,
        ),
    };
    Ok(pattern)
}

/// Polls until Ctrl-C and prints the averages of every tick.
fn run_monitor(client: &Adam5K, config: &Config, table: CalibrationTable) -> Result<()> {
    let monitor = ChannelMonitor::new(Arc::new(table), config.monitor.iter().cloned())
        .context("Invalid monitor channel list")?;
    let monitor = Arc::new(Mutex::new(monitor));

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        handler_flag.store(false, Ordering::SeqCst);
    })
    .context("Cannot install Ctrl-C handler")?;

    let (tx, rx) = mpsc::channel::<Averages>();
    let sink = Arc::clone(&monitor);
    client.set_tick_callback(move |tick: &Tick| {
        if let Err(err) = &tick.outcome {
            warn!("Polling tick failed: {err}");
        }
        let averages = match sink.lock() {
            Ok(mut monitor) => monitor.on_tick(tick),
            Err(poisoned) => poisoned.into_inner().on_tick(tick),
        };
        // The receiver is gone once the monitor loop has ended.
        let _ = tx.send(averages);
    });
    client
        .start_polling(config.poll_interval)
        .context("Cannot start polling")?;
    info!("Monitoring {:?} every {:?}", config.monitor, config.poll_interval);

    while running.load(Ordering::SeqCst) {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(averages) => print_averages(&averages),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("Stopping monitor...");
    client.clear_tick_callback();
    client.stop_polling().context("Cannot stop polling")?;
    Ok(())
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "adamctl started. Log level: {}",
        args.verbose.log_level_filter()
    );

    let mut config = load_config(args.config.as_ref())?;
    apply_overrides(&mut config, &args);
    let table = config
        .calibration_table()
        .context("Invalid calibration table")?;

    if args.command == commandline::CliCommands::Channels {
        for entry in table.iter() {
            println!(
                "{:10} {} range={} offset={} max_raw={}",
                entry.name(),
                entry.address(),
                entry.range(),
                entry.offset(),
                entry.max_raw()
            );
        }
        return Ok(());
    }

    let client = connect(&config)?;

    match &args.command {
        commandline::CliCommands::Read {
            group,
            slot,
            channel,
        } => {
            info!("Executing: Read channel");
            let address = proto::ChannelAddress::new(*group, *slot, *channel)?;
            let value = client
                .read_channel(address)
                .with_context(|| format!("Cannot read {address}"))?;
            println!("{address}: {value}");
        }
        commandline::CliCommands::Write {
            group,
            slot,
            channel,
            value,
        } => {
            info!("Executing: Write channel");
            let address = proto::ChannelAddress::new(*group, *slot, *channel)?;
            let value =
                commandline::parse_channel_value(*group, value).map_err(anyhow::Error::msg)?;
            client
                .write_channel(address, value)
                .with_context(|| format!("Cannot write {value} to {address}"))?;
            println!("{address} set to {value}");
        }
        commandline::CliCommands::WriteSlot {
            group,
            slot,
            pattern,
            yes,
        } => {
            info!("Executing: Write slot");
            let pattern = slot_pattern(*group, pattern)?;
            if !*yes && !confirm_write_slot(*group, *slot)? {
                info!("Write slot aborted by user.");
                return Ok(());
            }
            client
                .write_slot(*slot, &pattern)
                .with_context(|| format!("Cannot write {group} slot {slot}"))?;
            println!("{group} slot {slot} written");
        }
        commandline::CliCommands::Set { name, value } => {
            info!("Executing: Set named channel");
            let entry = table.get(name)?;
            let write = entry.write_value(*value)?;
            client
                .write_channel(entry.address(), write)
                .with_context(|| format!("Cannot write '{name}'"))?;
            println!(
                "{name} ({}) set to raw {value} = {:.2}",
                entry.address(),
                entry.to_engineering(*value)
            );
        }
        commandline::CliCommands::Snapshot => {
            info!("Executing: Snapshot");
            let snapshot = client.refresh().context("Cannot read rack snapshot")?;
            print_snapshot(&snapshot);
        }
        commandline::CliCommands::Monitor { interval } => {
            if let Some(interval) = interval {
                config.poll_interval = *interval;
            }
            info!("Starting monitor mode: interval={:?}", config.poll_interval);
            run_monitor(&client, &config, table)?;
        }
        commandline::CliCommands::Channels => unreachable!("Channels is handled before connecting."),
    }

    client.disconnect();
    Ok(())
}
