//! Indicator lamp modes and the periodic mode engine.
//!
//! Every [`IndicatorModeEngine::PERIOD`] the controller feeds the current mode
//! and the latest distance into [`IndicatorModeEngine::tick`], which flips the
//! blink phase and returns the lamp levels to apply. In [`IndicatorMode::Manual`]
//! the engine returns `None` and the lamps keep whatever was last written.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::gpio::Level;
use crate::protocol::Error;

/// The three indicator lamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lamp {
    Red,
    Yellow,
    Green,
}

impl Lamp {
    pub const ALL: [Lamp; 3] = [Lamp::Red, Lamp::Yellow, Lamp::Green];
}

impl fmt::Display for Lamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Lamp::Red => "red",
            Lamp::Yellow => "yellow",
            Lamp::Green => "green",
        })
    }
}

/// Operating mode of the indicator lamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub enum IndicatorMode {
    /// Lamps follow the measured distance.
    Auto,
    #[default]
    Green,
    YellowFlashing,
    RedFlashing,
    /// Lamps are only changed by explicit writes.
    Manual,
}

impl IndicatorMode {
    pub const ALL: [IndicatorMode; 5] = [
        IndicatorMode::Auto,
        IndicatorMode::Green,
        IndicatorMode::YellowFlashing,
        IndicatorMode::RedFlashing,
        IndicatorMode::Manual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndicatorMode::Auto => "AUTO",
            IndicatorMode::Green => "GREEN",
            IndicatorMode::YellowFlashing => "YELLOWFLASHING",
            IndicatorMode::RedFlashing => "REDFLASHING",
            IndicatorMode::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for IndicatorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndicatorMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace(['_', '-'], "");
        IndicatorMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == normalized)
            .ok_or_else(|| Error::UnknownIndicatorMode(s.to_string()))
    }
}

impl TryFrom<String> for IndicatorMode {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IndicatorMode> for String {
    fn from(mode: IndicatorMode) -> String {
        mode.as_str().to_string()
    }
}

/// Levels for all three lamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LampOutputs {
    pub red: Level,
    pub yellow: Level,
    pub green: Level,
}

impl LampOutputs {
    pub const OFF: LampOutputs = LampOutputs {
        red: Level::Low,
        yellow: Level::Low,
        green: Level::Low,
    };

    pub fn new(red: Level, yellow: Level, green: Level) -> Self {
        Self { red, yellow, green }
    }

    /// Only `lamp` lit at `level`, the others off.
    pub fn only(lamp: Lamp, level: Level) -> Self {
        let mut outputs = Self::OFF;
        *outputs.get_mut(lamp) = level;
        outputs
    }

    pub fn get(&self, lamp: Lamp) -> Level {
        match lamp {
            Lamp::Red => self.red,
            Lamp::Yellow => self.yellow,
            Lamp::Green => self.green,
        }
    }

    fn get_mut(&mut self, lamp: Lamp) -> &mut Level {
        match lamp {
            Lamp::Red => &mut self.red,
            Lamp::Yellow => &mut self.yellow,
            Lamp::Green => &mut self.green,
        }
    }
}

impl fmt::Display for LampOutputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "red={} yellow={} green={}", self.red, self.yellow, self.green)
    }
}

/// Distance thresholds in centimeters for [`IndicatorMode::Auto`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub warning_cm: u16,
    pub danger_cm: u16,
}

/// Lamp levels for `mode` at blink phase `blink`.
///
/// In `Auto` mode a distance below `danger_cm` lights red, one above
/// `warning_cm` lights green and anything in between lights yellow. A distance
/// of zero (no valid reading) therefore shows red.
pub fn evaluate(
    mode: IndicatorMode,
    blink: bool,
    distance_cm: u16,
    thresholds: Thresholds,
) -> Option<LampOutputs> {
    match mode {
        IndicatorMode::Manual => None,
        IndicatorMode::Green => Some(LampOutputs::only(Lamp::Green, Level::High)),
        IndicatorMode::YellowFlashing => Some(LampOutputs::only(Lamp::Yellow, blink.into())),
        IndicatorMode::RedFlashing => Some(LampOutputs::only(Lamp::Red, blink.into())),
        IndicatorMode::Auto => {
            let lamp = if distance_cm < thresholds.danger_cm {
                Lamp::Red
            } else if distance_cm > thresholds.warning_cm {
                Lamp::Green
            } else {
                Lamp::Yellow
            };
            Some(LampOutputs::only(lamp, Level::High))
        }
    }
}

/// Holds the blink phase between ticks.
#[derive(Debug, Clone, Default)]
pub struct IndicatorModeEngine {
    blink: bool,
}

impl IndicatorModeEngine {
    /// Interval between two ticks.
    pub const PERIOD: Duration = Duration::from_millis(500);

    pub fn new() -> Self {
        Self::default()
    }

    pub fn blink_phase(&self) -> bool {
        self.blink
    }

    /// Advances the blink phase and evaluates `mode`.
    ///
    /// The phase advances in every mode, including `Manual`.
    pub fn tick(
        &mut self,
        mode: IndicatorMode,
        distance_cm: u16,
        thresholds: Thresholds,
    ) -> Option<LampOutputs> {
        self.blink = !self.blink;
        evaluate(mode, self.blink, distance_cm, thresholds)
    }
}
