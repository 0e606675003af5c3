use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use std::path::PathBuf;
use std::time::Duration;
use tfluna_plc_lib::{
    config::DEFAULT_CONFIG_FILE, controller::MeasurementAction, gpio::Level,
    indicator::IndicatorMode, protocol as proto, registers::DeviceId,
};

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/serial0") // Raspberry Pi primary UART.
    }
}

fn parse_baud_rate(s: &str) -> Result<proto::BaudRate, String> {
    let rate_val = s
        .parse::<u32>()
        .map_err(|e| format!("Invalid baud rate number format: {e}"))?;
    proto::BaudRate::try_from(rate_val).map_err(|e| e.to_string())
}

fn parse_sample_rate(s: &str) -> Result<proto::SampleRate, String> {
    let rate_val = clap_num::number_range(s, 0, proto::SampleRate::MAX)?;
    proto::SampleRate::try_from(rate_val).map_err(|e| e.to_string())
}

fn parse_hex_byte(s: &str) -> Result<u8, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u8::from_str_radix(digits, 16).map_err(|e| format!("Invalid hex byte '{s}': {e}"))
}

/// Serial connection to the sensor for one-shot commands.
#[derive(clap::Args, Debug, Clone, PartialEq)]
pub struct SerialArgs {
    /// Serial port device name.
    /// Examples: "/dev/serial0", "/dev/ttyUSB0" (Linux), "COM3" (Windows).
    #[arg(short, long, default_value_t = default_device_name(), verbatim_doc_comment)]
    pub device: String,

    /// Baud rate the sensor is currently configured for.
    #[arg(long, default_value_t = proto::BaudRate::default(), value_parser = parse_baud_rate)]
    pub baud_rate: proto::BaudRate,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run the PLC: initialize lamps and sensor from the configuration file,
    /// then accept control commands on the standard input.
    /// Type "help" at the prompt for the list of commands.
    #[clap(verbatim_doc_comment)]
    Daemon {
        /// The PLC configuration file.
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },

    /// Read and display the sensor firmware version.
    Version {
        #[command(flatten)]
        serial: SerialArgs,
    },

    /// Trigger a single measurement and display it.
    /// Only works while continuous sampling is stopped (sample rate 0).
    #[clap(verbatim_doc_comment)]
    Single {
        #[command(flatten)]
        serial: SerialArgs,
    },

    /// Set the frame rate of the sensor.
    /// `0` stops continuous sampling, `1` to `250` sets the rate in Hz.
    #[clap(verbatim_doc_comment)]
    SampleRate {
        #[command(flatten)]
        serial: SerialArgs,

        #[arg(value_parser = parse_sample_rate)]
        rate: proto::SampleRate,
    },

    /// Persist the current sensor settings.
    Save {
        #[command(flatten)]
        serial: SerialArgs,
    },

    /// Restore the sensor to its factory default settings.
    /// **Warning:** This resets baud rate and frame rate of the sensor.
    #[clap(verbatim_doc_comment)]
    RestoreDefaults {
        #[command(flatten)]
        serial: SerialArgs,
    },

    /// Decode captured sensor bytes offline and print every frame found.
    /// Example: plcctl decode 59 59 64 00 96 00 C8 03 00
    #[clap(verbatim_doc_comment)]
    Decode {
        /// Drop frames with a wrong checksum.
        #[arg(long)]
        verify_checksum: bool,

        /// Bytes in hexadecimal, with or without "0x" prefix.
        #[arg(required = true, value_parser = parse_hex_byte)]
        bytes: Vec<u8>,
    },
}

const fn about_text() -> &'static str {
    "TF-Luna PLC CLI - Control indicator lights and the TF-Luna distance sensor."
}

#[derive(Parser, Debug)]
#[command(name="plcctl", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warn.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Maximum time to wait for a sensor reply.
    /// Examples: "2s", "500ms".
    #[arg(global = true, long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Option<Duration>,
}

/// One line typed at the daemon prompt.
#[derive(Parser, Debug)]
#[command(no_binary_name = true, disable_version_flag = true, name = "")]
pub struct ConsoleLine {
    #[command(subcommand)]
    pub command: ConsoleCommand,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    /// Set all three lamps (0 or 1) and switch to MANUAL mode.
    Lamps {
        red: Level,
        yellow: Level,
        green: Level,
    },
    /// Set the indicator mode: AUTO, GREEN, YELLOWFLASHING, REDFLASHING or MANUAL.
    Mode { mode: IndicatorMode },
    /// Control the distance measurement: start, stop or single.
    Measure { action: MeasurementAction },
    /// Select the log streams; flags not given are switched off.
    Observe {
        #[arg(long)]
        measurements: bool,
        #[arg(long)]
        parser: bool,
    },
    /// Show mode and sensor status.
    Status,
    /// Read a register, e.g. "get tfLunaDevice".
    Get { id: DeviceId },
    /// Write a lamp register, e.g. "set indicatorLightDeviceRed 1".
    Set { id: DeviceId, value: Level },
    /// Leave the daemon.
    #[command(alias = "exit")]
    Quit,
}
