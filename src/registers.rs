//! Uniform get/set access to the lamp lines and the distance value.
//!
//! Each [`DeviceId`] maps to a getter and an optional setter in a small
//! dispatch table. Lamp writes go straight to the line; the distance value is
//! the latest cached measurement and is read-only.

use std::fmt;
use std::str::FromStr;

use crate::gpio::Level;
use crate::indicator::Lamp;
use crate::protocol::Error as ProtocolError;
use crate::tokio_common::{Error, Result};

/// Logical device addressed through the register map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String"))]
pub enum DeviceId {
    IndicatorLightRed,
    IndicatorLightYellow,
    IndicatorLightGreen,
    DistanceSensor,
}

impl DeviceId {
    pub const ALL: [DeviceId; 4] = [
        DeviceId::IndicatorLightRed,
        DeviceId::IndicatorLightYellow,
        DeviceId::IndicatorLightGreen,
        DeviceId::DistanceSensor,
    ];

    /// Name used in the address-space configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceId::IndicatorLightRed => "indicatorLightDeviceRed",
            DeviceId::IndicatorLightYellow => "indicatorLightDeviceYellow",
            DeviceId::IndicatorLightGreen => "indicatorLightDeviceGreen",
            DeviceId::DistanceSensor => "tfLunaDevice",
        }
    }

    fn short_name(&self) -> &'static str {
        match self {
            DeviceId::IndicatorLightRed => "red",
            DeviceId::IndicatorLightYellow => "yellow",
            DeviceId::IndicatorLightGreen => "green",
            DeviceId::DistanceSensor => "distance",
        }
    }

    /// The lamp behind this id, `None` for the distance sensor.
    pub fn lamp(&self) -> Option<Lamp> {
        match self {
            DeviceId::IndicatorLightRed => Some(Lamp::Red),
            DeviceId::IndicatorLightYellow => Some(Lamp::Yellow),
            DeviceId::IndicatorLightGreen => Some(Lamp::Green),
            DeviceId::DistanceSensor => None,
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        DeviceId::ALL
            .into_iter()
            .find(|id| id.as_str().eq_ignore_ascii_case(s) || id.short_name() == s)
            .ok_or_else(|| ProtocolError::UnknownDeviceId(s.to_string()))
    }
}

impl TryFrom<String> for DeviceId {
    type Error = ProtocolError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

/// A value read from or written to the register map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterValue {
    Level(Level),
    DistanceCm(u16),
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterValue::Level(level) => write!(f, "{level}"),
            RegisterValue::DistanceCm(cm) => write!(f, "{cm} cm"),
        }
    }
}

/// Backing store the register map reads from and writes to.
pub trait RegisterBank {
    fn read_lamp(&self, lamp: Lamp) -> Result<Level>;
    fn write_lamp(&mut self, lamp: Lamp, level: Level) -> Result<()>;
    fn distance_cm(&self) -> Result<u16>;
}

type Getter<B> = fn(&B) -> Result<RegisterValue>;
type Setter<B> = fn(&mut B, Level) -> Result<()>;

struct Binding<B> {
    id: DeviceId,
    get: Getter<B>,
    set: Option<Setter<B>>,
}

fn bindings<B: RegisterBank>() -> [Binding<B>; 4] {
    [
        Binding {
            id: DeviceId::IndicatorLightRed,
            get: |bank| bank.read_lamp(Lamp::Red).map(RegisterValue::Level),
            set: Some(|bank, level| bank.write_lamp(Lamp::Red, level)),
        },
        Binding {
            id: DeviceId::IndicatorLightYellow,
            get: |bank| bank.read_lamp(Lamp::Yellow).map(RegisterValue::Level),
            set: Some(|bank, level| bank.write_lamp(Lamp::Yellow, level)),
        },
        Binding {
            id: DeviceId::IndicatorLightGreen,
            get: |bank| bank.read_lamp(Lamp::Green).map(RegisterValue::Level),
            set: Some(|bank, level| bank.write_lamp(Lamp::Green, level)),
        },
        Binding {
            id: DeviceId::DistanceSensor,
            get: |bank| bank.distance_cm().map(RegisterValue::DistanceCm),
            set: None,
        },
    ]
}

fn binding<B: RegisterBank>(id: DeviceId) -> Binding<B> {
    let [red, yellow, green, distance] = bindings::<B>();
    match id {
        DeviceId::IndicatorLightRed => red,
        DeviceId::IndicatorLightYellow => yellow,
        DeviceId::IndicatorLightGreen => green,
        DeviceId::DistanceSensor => distance,
    }
}

/// Reads the register `id` from `bank`.
pub fn read<B: RegisterBank>(bank: &B, id: DeviceId) -> Result<RegisterValue> {
    let binding = binding::<B>(id);
    (binding.get)(bank)
}

/// Writes `value` to the register `id` in `bank`.
pub fn write<B: RegisterBank>(bank: &mut B, id: DeviceId, value: RegisterValue) -> Result<()> {
    let binding = binding::<B>(id);
    let set = binding.set.ok_or(Error::ReadOnly(binding.id))?;
    match value {
        RegisterValue::Level(level) => set(bank, level),
        other => Err(Error::TypeMismatch(binding.id, other)),
    }
}

/// Whether `id` accepts writes.
pub fn is_writeable(id: DeviceId) -> bool {
    id.lamp().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[derive(Default)]
    struct Bank {
        lamps: [Level; 3],
        distance: u16,
    }

    fn index(lamp: Lamp) -> usize {
        match lamp {
            Lamp::Red => 0,
            Lamp::Yellow => 1,
            Lamp::Green => 2,
        }
    }

    impl RegisterBank for Bank {
        fn read_lamp(&self, lamp: Lamp) -> Result<Level> {
            Ok(self.lamps[index(lamp)])
        }

        fn write_lamp(&mut self, lamp: Lamp, level: Level) -> Result<()> {
            self.lamps[index(lamp)] = level;
            Ok(())
        }

        fn distance_cm(&self) -> Result<u16> {
            Ok(self.distance)
        }
    }

    #[test]
    fn device_names() {
        assert_eq!(
            "indicatorLightDeviceYellow".parse::<DeviceId>(),
            Ok(DeviceId::IndicatorLightYellow)
        );
        assert_eq!("tfLunaDevice".parse::<DeviceId>(), Ok(DeviceId::DistanceSensor));
        assert_eq!("red".parse::<DeviceId>(), Ok(DeviceId::IndicatorLightRed));
        assert_matches!(
            "blue".parse::<DeviceId>(),
            Err(ProtocolError::UnknownDeviceId(_))
        );
    }

    #[test]
    fn lamp_registers() {
        let mut bank = Bank::default();
        write(
            &mut bank,
            DeviceId::IndicatorLightGreen,
            RegisterValue::Level(Level::High),
        )
        .unwrap();
        assert_eq!(bank.lamps, [Level::Low, Level::Low, Level::High]);
        assert_eq!(
            read(&bank, DeviceId::IndicatorLightGreen).unwrap(),
            RegisterValue::Level(Level::High)
        );
        assert_matches!(
            write(&mut bank, DeviceId::IndicatorLightRed, RegisterValue::DistanceCm(1)),
            Err(Error::TypeMismatch(DeviceId::IndicatorLightRed, _))
        );
    }

    #[test]
    fn distance_is_read_only() {
        let mut bank = Bank {
            distance: 123,
            ..Default::default()
        };
        assert_eq!(
            read(&bank, DeviceId::DistanceSensor).unwrap(),
            RegisterValue::DistanceCm(123)
        );
        assert_matches!(
            write(&mut bank, DeviceId::DistanceSensor, RegisterValue::DistanceCm(5)),
            Err(Error::ReadOnly(DeviceId::DistanceSensor))
        );
        assert!(!is_writeable(DeviceId::DistanceSensor));
        assert!(is_writeable(DeviceId::IndicatorLightRed));
    }
}
