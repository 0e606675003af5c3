//! Static configuration of the PLC: the device wiring and the address-space
//! declarations.
//!
//! With the `serde` feature the configuration is read from YAML with
//! [`PlcConfig::load`]. Durations are written in humantime notation
//! (`2s`, `500ms`).

use std::collections::HashSet;
use std::time::Duration;

use crate::gpio::Direction;
use crate::indicator::{Lamp, Thresholds};
use crate::protocol::{BaudRate, SampleRate};
use crate::tokio_async::TfLunaOptions;
use crate::tokio_common::{Error, Result};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "plc-config.yml";

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct PinConfig {
    pub pin: u32,
    #[cfg_attr(feature = "serde", serde(default))]
    pub mode: Direction,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct TfLunaConfig {
    #[cfg_attr(feature = "serde", serde(default = "default_device_id"))]
    pub device_id: String,
    #[cfg_attr(feature = "serde", serde(default = "default_serial_port"))]
    pub serial_port: String,
    /// Rate the port is opened with and the sensor is set to during initialization.
    #[cfg_attr(feature = "serde", serde(default))]
    pub baud_rate: BaudRate,
    /// Frame rate in Hz used while measuring.
    #[cfg_attr(feature = "serde", serde(default = "default_sample_rate"))]
    pub sample_rate: u16,
    /// Distances up to this many cm show yellow in `AUTO` mode.
    #[cfg_attr(feature = "serde", serde(default = "default_warning_distance"))]
    pub warning_distance: u16,
    /// Distances below this many cm show red in `AUTO` mode.
    #[cfg_attr(feature = "serde", serde(default = "default_danger_distance"))]
    pub danger_distance: u16,
    #[cfg_attr(feature = "serde", serde(default))]
    pub auto_start: bool,
    #[cfg_attr(
        feature = "serde",
        serde(default = "default_command_timeout", with = "humantime_serde")
    )]
    pub command_timeout: Duration,
    #[cfg_attr(feature = "serde", serde(default))]
    pub verify_checksum: bool,
}

fn default_device_id() -> String {
    String::from("tfLunaDevice")
}

fn default_serial_port() -> String {
    String::from("/dev/serial0")
}

fn default_sample_rate() -> u16 {
    10
}

fn default_warning_distance() -> u16 {
    100
}

fn default_danger_distance() -> u16 {
    30
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(2)
}

impl Default for TfLunaConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            serial_port: default_serial_port(),
            baud_rate: BaudRate::default(),
            sample_rate: default_sample_rate(),
            warning_distance: default_warning_distance(),
            danger_distance: default_danger_distance(),
            auto_start: false,
            command_timeout: default_command_timeout(),
            verify_checksum: false,
        }
    }
}

impl TfLunaConfig {
    pub fn link_options(&self) -> TfLunaOptions {
        TfLunaOptions {
            command_timeout: self.command_timeout,
            verify_checksum: self.verify_checksum,
        }
    }

    pub fn sample_rate(&self) -> Result<SampleRate> {
        Ok(SampleRate::try_from(self.sample_rate)?)
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            warning_cm: self.warning_distance,
            danger_cm: self.danger_distance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum GpioBackend {
    /// Linux GPIO character device.
    #[default]
    Chardev,
    Simulated,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct GpioConfig {
    #[cfg_attr(feature = "serde", serde(default))]
    pub backend: GpioBackend,
    /// Character device of the chip the lamps are wired to.
    #[cfg_attr(feature = "serde", serde(default = "default_chip"))]
    pub chip: String,
    /// How often availability is checked before initialization gives up.
    #[cfg_attr(feature = "serde", serde(default = "default_availability_attempts"))]
    pub availability_attempts: u32,
    #[cfg_attr(
        feature = "serde",
        serde(default = "default_availability_interval", with = "humantime_serde")
    )]
    pub availability_interval: Duration,
}

fn default_chip() -> String {
    String::from("/dev/gpiochip0")
}

fn default_availability_attempts() -> u32 {
    5
}

fn default_availability_interval() -> Duration {
    Duration::from_secs(3)
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            backend: GpioBackend::default(),
            chip: default_chip(),
            availability_attempts: default_availability_attempts(),
            availability_interval: default_availability_interval(),
        }
    }
}

/// Wiring and tuning of the devices attached to the PLC.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct DeviceConfig {
    pub indicator_light_red: PinConfig,
    pub indicator_light_yellow: PinConfig,
    pub indicator_light_green: PinConfig,
    #[cfg_attr(feature = "serde", serde(default))]
    pub tf_luna: TfLunaConfig,
    #[cfg_attr(feature = "serde", serde(default))]
    pub gpio: GpioConfig,
    /// Pause after the soft reset before the next command.
    #[cfg_attr(
        feature = "serde",
        serde(default = "default_reset_settle_time", with = "humantime_serde")
    )]
    pub reset_settle_time: Duration,
}

fn default_reset_settle_time() -> Duration {
    Duration::from_secs(5)
}

impl DeviceConfig {
    /// Configuration with the given lamp pins and defaults everywhere else.
    pub fn with_pins(red: u32, yellow: u32, green: u32) -> Self {
        let output = |pin| PinConfig {
            pin,
            mode: Direction::Output,
        };
        Self {
            indicator_light_red: output(red),
            indicator_light_yellow: output(yellow),
            indicator_light_green: output(green),
            tf_luna: TfLunaConfig::default(),
            gpio: GpioConfig::default(),
            reset_settle_time: default_reset_settle_time(),
        }
    }

    pub fn lamp(&self, lamp: Lamp) -> &PinConfig {
        match lamp {
            Lamp::Red => &self.indicator_light_red,
            Lamp::Yellow => &self.indicator_light_yellow,
            Lamp::Green => &self.indicator_light_green,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let tf_luna = &self.tf_luna;
        if tf_luna.danger_distance >= tf_luna.warning_distance {
            return Err(Error::Config(format!(
                "danger_distance ({}) must be below warning_distance ({})",
                tf_luna.danger_distance, tf_luna.warning_distance
            )));
        }
        if tf_luna.sample_rate == 0 || tf_luna.sample_rate > SampleRate::MAX {
            return Err(Error::Config(format!(
                "sample_rate must be within 1..={} Hz, got {}",
                SampleRate::MAX,
                tf_luna.sample_rate
            )));
        }
        let mut pins = HashSet::new();
        for lamp in Lamp::ALL {
            let pin = self.lamp(lamp).pin;
            if !pins.insert(pin) {
                return Err(Error::Config(format!(
                    "GPIO {pin} is assigned to more than one indicator light"
                )));
            }
        }
        if self.gpio.availability_attempts == 0 {
            return Err(Error::Config(
                "gpio.availability_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Initial value of an address-space variable.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum InitialValue {
    Boolean(bool),
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct NodeConfig {
    pub browse_name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub display_name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub description: String,
    #[cfg_attr(
        feature = "serde",
        serde(default, with = "humantime_serde::option")
    )]
    pub sample_interval: Option<Duration>,
    pub data_type_name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub value: Option<InitialValue>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub writeable: bool,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct AssetConfig {
    pub name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct ArgumentConfig {
    pub name: String,
    pub data_type_name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct MethodConfig {
    pub browse_name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub display_name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub description: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub input_arguments: Vec<ArgumentConfig>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub output_arguments: Vec<ArgumentConfig>,
}

/// Variables and methods the address-space bridge publishes.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct AssetRootConfig {
    #[cfg_attr(feature = "serde", serde(default))]
    pub root_folder_name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub assets: Vec<AssetConfig>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub methods: Vec<MethodConfig>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct PlcConfig {
    pub plc_device: DeviceConfig,
    #[cfg_attr(feature = "serde", serde(default))]
    pub asset_root: AssetRootConfig,
}

#[cfg(feature = "serde")]
impl PlcConfig {
    /// Parses and validates a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PlcConfig =
            serde_yaml::from_str(yaml).map_err(|err| Error::Config(err.to_string()))?;
        config.plc_device.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates the YAML file at `path`.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        log::debug!("Loading config file from {path:?}");
        let yaml = std::fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("Cannot read {}: {err}", path.display())))?;
        Self::from_yaml(&yaml)
    }
}
