//! Line-addressable digital I/O used for the indicator lamps.
//!
//! The controller only needs three things from the GPIO subsystem: to ask
//! whether it is available, to claim a line in a given direction, and to
//! read or write a line level. [`GpioChip`] and [`GpioLine`] capture exactly
//! that. Two backends are provided:
//!
//! * `CdevGpio` drives a Linux GPIO character device (`/dev/gpiochipN`),
//!   addressing lines by chip offset. Needs the `gpio-cdev` feature.
//! * [`SimulatedGpio`] keeps line levels in memory, for hosts without GPIO
//!   and for tests.

use std::collections::HashMap;
use std::fmt;
use std::io;
#[cfg(all(target_os = "linux", feature = "gpio-cdev"))]
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::protocol::Error;
use crate::tokio_common::lock;

/// Logic level of a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "u8", into = "u8"))]
pub enum Level {
    #[default]
    Low,
    High,
}

impl Level {
    pub fn is_high(&self) -> bool {
        *self == Level::High
    }

    pub fn toggled(&self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high {
            Level::High
        } else {
            Level::Low
        }
    }
}

impl From<Level> for u8 {
    fn from(level: Level) -> u8 {
        match level {
            Level::Low => 0,
            Level::High => 1,
        }
    }
}

impl TryFrom<u8> for Level {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Level::Low),
            1 => Ok(Level::High),
            other => Err(Error::InvalidLevel(other.to_string())),
        }
    }
}

impl FromStr for Level {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "0" | "low" | "off" | "false" => Ok(Level::Low),
            "1" | "high" | "on" | "true" => Ok(Level::High),
            _ => Err(Error::InvalidLevel(s.to_string())),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// Direction a line is claimed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Direction {
    Input,
    #[default]
    Output,
}

/// A claimed GPIO line.
pub trait GpioLine: Send + fmt::Debug {
    /// Line offset on the chip.
    fn pin(&self) -> u32;
    fn direction(&self) -> Direction;
    fn get(&self) -> io::Result<Level>;
    fn set(&mut self, level: Level) -> io::Result<()>;
}

/// A GPIO controller that can be queried for availability and hands out lines.
pub trait GpioChip: Send + Sync {
    fn is_available(&self) -> bool;
    fn request_line(&self, pin: u32, direction: Direction) -> io::Result<Box<dyn GpioLine>>;
}

/// GPIO through the Linux character device (`/dev/gpiochipN`).
///
/// Lines are addressed by their offset on the chip, not by a global number.
#[cfg(all(target_os = "linux", feature = "gpio-cdev"))]
#[derive(Debug, Clone)]
pub struct CdevGpio {
    chip: PathBuf,
}

#[cfg(all(target_os = "linux", feature = "gpio-cdev"))]
impl CdevGpio {
    pub const DEFAULT_CHIP: &'static str = "/dev/gpiochip0";
    /// Consumer label shown by `gpioinfo` for claimed lines.
    pub const CONSUMER: &'static str = "tfluna-plc";

    pub fn new(chip: impl Into<PathBuf>) -> Self {
        Self { chip: chip.into() }
    }

    pub fn chip_path(&self) -> &Path {
        &self.chip
    }

    fn open(&self) -> io::Result<gpio_cdev::Chip> {
        gpio_cdev::Chip::new(&self.chip).map_err(cdev_error)
    }
}

#[cfg(all(target_os = "linux", feature = "gpio-cdev"))]
impl Default for CdevGpio {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHIP)
    }
}

#[cfg(all(target_os = "linux", feature = "gpio-cdev"))]
fn cdev_error(err: gpio_cdev::Error) -> io::Error {
    io::Error::other(err)
}

#[cfg(all(target_os = "linux", feature = "gpio-cdev"))]
impl GpioChip for CdevGpio {
    fn is_available(&self) -> bool {
        self.open().is_ok()
    }

    fn request_line(&self, pin: u32, direction: Direction) -> io::Result<Box<dyn GpioLine>> {
        use gpio_cdev::LineRequestFlags;

        let mut chip = self.open()?;
        let flags = match direction {
            Direction::Input => LineRequestFlags::INPUT,
            Direction::Output => LineRequestFlags::OUTPUT,
        };
        let handle = chip
            .get_line(pin)
            .and_then(|line| line.request(flags, Level::Low.into(), Self::CONSUMER))
            .map_err(cdev_error)?;
        Ok(Box::new(CdevLine {
            pin,
            direction,
            handle,
        }))
    }
}

#[cfg(all(target_os = "linux", feature = "gpio-cdev"))]
#[derive(Debug)]
struct CdevLine {
    pin: u32,
    direction: Direction,
    handle: gpio_cdev::LineHandle,
}

#[cfg(all(target_os = "linux", feature = "gpio-cdev"))]
impl GpioLine for CdevLine {
    fn pin(&self) -> u32 {
        self.pin
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn get(&self) -> io::Result<Level> {
        let raw = self.handle.get_value().map_err(cdev_error)?;
        Ok(Level::from(raw != 0))
    }

    fn set(&mut self, level: Level) -> io::Result<()> {
        if self.direction == Direction::Input {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("GPIO line {} is configured as input", self.pin),
            ));
        }
        self.handle.set_value(level.into()).map_err(cdev_error)
    }
}

#[derive(Debug, Default)]
struct SimState {
    available: bool,
    lines: HashMap<u32, (Direction, Level)>,
    writes: u64,
}

/// In-memory GPIO. Clones share the same lines.
#[derive(Debug, Clone)]
pub struct SimulatedGpio {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedGpio {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                available: true,
                ..Default::default()
            })),
        }
    }

    pub fn set_available(&self, available: bool) {
        lock(&self.state).available = available;
    }

    /// Current level of `pin`, `None` if the line was never requested.
    pub fn level(&self, pin: u32) -> Option<Level> {
        lock(&self.state).lines.get(&pin).map(|(_, level)| *level)
    }

    /// Drives an input line from outside, as the connected hardware would.
    pub fn drive(&self, pin: u32, level: Level) {
        if let Some(line) = lock(&self.state).lines.get_mut(&pin) {
            line.1 = level;
        }
    }

    /// Number of successful line writes so far.
    pub fn write_count(&self) -> u64 {
        lock(&self.state).writes
    }
}

impl Default for SimulatedGpio {
    fn default() -> Self {
        Self::new()
    }
}

impl GpioChip for SimulatedGpio {
    fn is_available(&self) -> bool {
        lock(&self.state).available
    }

    fn request_line(&self, pin: u32, direction: Direction) -> io::Result<Box<dyn GpioLine>> {
        let mut state = lock(&self.state);
        if !state.available {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "simulated GPIO chip is not available",
            ));
        }
        state.lines.insert(pin, (direction, Level::Low));
        Ok(Box::new(SimulatedLine {
            pin,
            direction,
            state: self.state.clone(),
        }))
    }
}

#[derive(Debug)]
struct SimulatedLine {
    pin: u32,
    direction: Direction,
    state: Arc<Mutex<SimState>>,
}

impl GpioLine for SimulatedLine {
    fn pin(&self) -> u32 {
        self.pin
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn get(&self) -> io::Result<Level> {
        lock(&self.state)
            .lines
            .get(&self.pin)
            .map(|(_, level)| *level)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "line released"))
    }

    fn set(&mut self, level: Level) -> io::Result<()> {
        if self.direction == Direction::Input {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("GPIO {} is configured as input", self.pin),
            ));
        }
        let mut state = lock(&self.state);
        let line = state
            .lines
            .get_mut(&self.pin)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "line released"))?;
        line.1 = level;
        state.writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parsing() {
        assert_eq!("1".parse::<Level>(), Ok(Level::High));
        assert_eq!("off".parse::<Level>(), Ok(Level::Low));
        assert!(matches!("2".parse::<Level>(), Err(Error::InvalidLevel(..))));
        assert!(matches!(Level::try_from(3u8), Err(Error::InvalidLevel(..))));
        assert_eq!(Level::from(true), Level::High);
        assert_eq!(Level::High.toggled(), Level::Low);
    }

    #[test]
    fn simulated_lines() {
        let gpio = SimulatedGpio::new();
        let mut out = gpio.request_line(17, Direction::Output).unwrap();
        let mut input = gpio.request_line(27, Direction::Input).unwrap();

        out.set(Level::High).unwrap();
        assert_eq!(gpio.level(17), Some(Level::High));
        assert_eq!(out.get().unwrap(), Level::High);
        assert!(input.set(Level::High).is_err());

        gpio.drive(27, Level::High);
        assert_eq!(input.get().unwrap(), Level::High);
        assert_eq!(gpio.write_count(), 1);

        gpio.set_available(false);
        assert!(!gpio.is_available());
        assert!(gpio.request_line(22, Direction::Output).is_err());
    }

    #[cfg(all(target_os = "linux", feature = "gpio-cdev"))]
    #[test]
    fn missing_chardev_is_unavailable() {
        let gpio = CdevGpio::new("/dev/gpiochip-tfluna-missing");
        assert_eq!(gpio.chip_path(), Path::new("/dev/gpiochip-tfluna-missing"));
        assert!(!gpio.is_available());
        assert!(gpio.request_line(17, Direction::Output).is_err());
        assert_eq!(
            CdevGpio::default().chip_path(),
            Path::new(CdevGpio::DEFAULT_CHIP)
        );
    }
}
