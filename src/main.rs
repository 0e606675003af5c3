//! TF-Luna PLC CLI
//!
//! A command-line interface (CLI) application for a small PLC built from a
//! TF-Luna distance sensor (serial) and a red/yellow/green indicator light
//! (GPIO).
//!
//! This tool allows users to:
//! - Run the PLC in daemon mode: initialize lamps and sensor from a YAML
//!   configuration file and control them interactively from the console.
//! - Read the sensor firmware version.
//! - Trigger a single distance measurement.
//! - Set the sensor frame rate and persist the settings.
//! - Restore the sensor's factory defaults.
//! - Decode captured sensor traffic offline.
//!
//! The CLI leverages the `tfluna_plc_lib` crate for protocol definitions and device control.

use anyhow::{Context, Result, bail};
use clap::Parser;
use dialoguer::Confirm;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::path::Path;
use std::sync::Arc;
use std::{panic, time::Duration};
use tfluna_plc_lib::{
    config::{GpioBackend, PlcConfig},
    controller::DeviceController,
    gpio::{GpioChip, SimulatedGpio},
    protocol::{self as proto, DecodedFrame, FrameDecoder},
    registers::RegisterValue,
    service::{
        AddressBindings, ControlRequest, ControlResponse, IndicatorLightAction,
        IndicatorModeAction, MeasurementRequest, ObserveRequest, PlcService,
    },
    tokio_async::{ObserveTargets, TfLuna, TfLunaOptions},
    tokio_common,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

mod commandline;

use commandline::{CliCommands, ConsoleCommand, ConsoleLine, SerialArgs};

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

/// Opens the serial port and attaches a sensor link to it.
fn open_sensor(serial: &SerialArgs, timeout: Option<Duration>) -> Result<TfLuna> {
    info!(
        "Attempting to open {} at {} baud...",
        serial.device, serial.baud_rate
    );
    let port = tokio_common::open_serial(&serial.device, &serial.baud_rate)
        .with_context(|| format!("Cannot open serial port {}", serial.device))?;
    let mut options = TfLunaOptions::default();
    if let Some(timeout) = timeout {
        options.command_timeout = timeout;
    }
    Ok(TfLuna::attach(port, options))
}

/// Handles the restore defaults command.
///
/// This function prompts the user for confirmation before anything is sent.
async fn handle_restore_defaults(serial: &SerialArgs, timeout: Option<Duration>) -> Result<()> {
    info!("Executing: Restore Defaults");
    println!(
        "WARNING: This will reset the TF-Luna sensor to its factory default settings:\n\
         - Baud Rate: {}\n\
         - Frame Rate: 100 Hz\n",
        proto::BaudRate::default()
    );

    if !Confirm::new()
        .with_prompt("Are you sure you want to restore the default settings?")
        .default(false)
        .show_default(true)
        .interact()
        .context("Failed to get user confirmation.")?
    {
        info!("Restore defaults aborted by user.");
        return Ok(());
    }

    let sensor = open_sensor(serial, timeout)?;
    let status = sensor
        .restore_defaults()
        .await
        .context("Cannot restore default settings")?;
    if status != 0 {
        bail!("Sensor reported failure status {status} for restore defaults");
    }
    println!("Default settings restored.");
    Ok(())
}

fn handle_decode(bytes: &[u8], verify_checksum: bool) -> Result<()> {
    let mut decoder = FrameDecoder::new().with_checksum_verification(verify_checksum);
    decoder.set_trace(log_enabled!(target: proto::PARSER_LOG_TARGET, Level::Debug));

    let frames = decoder.decode(bytes);
    for frame in &frames {
        match frame {
            DecodedFrame::Measurement(m) => println!(
                "Measurement #{}: {} cm, amplitude {}, {:.1} °C{}",
                m.sequence,
                m.dist_cm,
                m.amplitude,
                m.temp_c,
                if m.is_valid() { "" } else { " (invalid)" }
            ),
            other => println!("{other}"),
        }
    }
    if decoder.buffered() > 0 {
        println!("{} trailing bytes form no complete frame", decoder.buffered());
    }
    if frames.is_empty() {
        bail!("No complete frame found in {} bytes", bytes.len());
    }
    Ok(())
}

fn print_response(response: ControlResponse) {
    if response.succeeded {
        println!("OK: {}", response.message);
    } else {
        println!("FAILED: {}", response.message);
    }
}

/// Executes one console line. Returns `false` when the daemon should stop.
async fn handle_console_line(service: &PlcService, line: &str) -> bool {
    if line.trim().is_empty() {
        return true;
    }
    let command = match ConsoleLine::try_parse_from(line.split_whitespace()) {
        Ok(parsed) => parsed.command,
        Err(err) => {
            let _ = err.print();
            return true;
        }
    };
    debug!("Console command: {command:?}");

    let controller = service.controller();
    match command {
        ConsoleCommand::Lamps { red, yellow, green } => {
            let request = ControlRequest::IndicatorLight(IndicatorLightAction { red, yellow, green });
            print_response(service.control(request).await);
        }
        ConsoleCommand::Mode { mode } => {
            let request = ControlRequest::IndicatorMode(IndicatorModeAction { mode });
            print_response(service.control(request).await);
        }
        ConsoleCommand::Measure { action } => {
            let request = ControlRequest::Measurement(MeasurementRequest { action });
            print_response(service.control(request).await);
        }
        ConsoleCommand::Observe {
            measurements,
            parser,
        } => {
            print_response(service.observe(ObserveRequest {
                observe_targets: ObserveTargets {
                    measurements,
                    parser_command_response: parser,
                },
            }));
        }
        ConsoleCommand::Status => {
            let status = controller.status();
            println!("Initialized: {}", service.is_ready());
            println!("Indicator mode: {}", controller.indicator_mode());
            println!("GPIO available: {}", controller.is_gpio_available());
            println!("Firmware version: {}", status.version);
            println!("Baud rate: {}", status.baud_rate);
            println!("Sample rate: {} Hz", status.sample_rate);
            println!("Distance: {} cm", status.measurement_cm);
            println!(
                "Last status: reset={} save={} restore={}",
                status.soft_reset_status, status.save_settings_status, status.restore_defaults_status
            );
        }
        ConsoleCommand::Get { id } => match controller.get(id) {
            Ok(value) => println!("{id}: {value}"),
            Err(err) => println!("FAILED: {err}"),
        },
        ConsoleCommand::Set { id, value } => match controller.set(id, RegisterValue::Level(value)) {
            Ok(()) => println!("OK: {id} set to {value}"),
            Err(err) => println!("FAILED: {err}"),
        },
        ConsoleCommand::Quit => return false,
    }
    true
}

async fn run_daemon(config_file: &Path, timeout: Option<Duration>) -> Result<()> {
    let mut config = PlcConfig::load(config_file)
        .with_context(|| format!("Cannot load configuration {}", config_file.display()))?;
    if let Some(timeout) = timeout {
        config.plc_device.tf_luna.command_timeout = timeout;
    }
    debug!("Plc controller configuration: {:?}", config.plc_device);

    let device = config.plc_device;
    let gpio: Arc<dyn GpioChip> = match device.gpio.backend {
        #[cfg(target_os = "linux")]
        GpioBackend::Chardev => Arc::new(tfluna_plc_lib::gpio::CdevGpio::new(&device.gpio.chip)),
        #[cfg(not(target_os = "linux"))]
        GpioBackend::Chardev => bail!("The chardev GPIO backend is only available on Linux"),
        GpioBackend::Simulated => {
            warn!("Using simulated GPIO, lamps are not connected");
            Arc::new(SimulatedGpio::new())
        }
    };
    let controller = DeviceController::new(Arc::new(device), gpio);
    let service = PlcService::new(controller, AddressBindings::from_config(&config.asset_root));

    let mut events = service.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("Event: {event}"),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {skipped} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let initialization = {
        let service = service.clone();
        // failures are logged by the controller, the console stays usable
        tokio::spawn(async move { service.start_serial().await })
    };

    println!("PLC daemon running. Type \"help\" for commands, \"quit\" to exit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("Cannot read from stdin")? {
                    Some(line) => {
                        if !handle_console_line(&service, &line).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    initialization.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    // 1. Initialize logging as early as possible
    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "TF-Luna PLC CLI started. Log level: {}",
        args.verbose.log_level_filter()
    );

    // 2. Execute the command
    match &args.command {
        CliCommands::Daemon { config } => run_daemon(config, args.timeout).await?,
        CliCommands::Version { serial } => {
            let sensor = open_sensor(serial, args.timeout)?;
            let version = sensor
                .get_version()
                .await
                .context("Cannot read firmware version")?;
            println!("Firmware version: {version}");
        }
        CliCommands::Single { serial } => {
            let sensor = open_sensor(serial, args.timeout)?;
            match sensor
                .measure_once()
                .await
                .context("Cannot read measurement")?
            {
                Some(m) => println!(
                    "Distance: {} cm, amplitude: {}, temperature: {:.1} °C",
                    m.dist_cm, m.amplitude, m.temp_c
                ),
                None => bail!("Continuous sampling is active, set the sample rate to 0 first"),
            }
        }
        CliCommands::SampleRate { serial, rate } => {
            let sensor = open_sensor(serial, args.timeout)?;
            let acknowledged = sensor
                .set_sample_rate(*rate)
                .await
                .context("Cannot set sample rate")?;
            println!("Sample rate: {acknowledged} Hz");
        }
        CliCommands::Save { serial } => {
            let sensor = open_sensor(serial, args.timeout)?;
            let status = sensor
                .save_settings()
                .await
                .context("Cannot save settings")?;
            if status != 0 {
                bail!("Sensor reported failure status {status} for save settings");
            }
            println!("Settings saved.");
        }
        CliCommands::RestoreDefaults { serial } => {
            handle_restore_defaults(serial, args.timeout).await?;
        }
        CliCommands::Decode {
            verify_checksum,
            bytes,
        } => handle_decode(bytes, *verify_checksum)?,
    }
    Ok(())
}
