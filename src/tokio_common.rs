//! This module provides common data structures and error types for the `tokio`
//! based sensor link and the device controller.
//!
//! It defines the `Error` enum, which encapsulates all possible failures of
//! serial communication, GPIO access and device control.
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::correlator::CommandKind;
use crate::protocol as proto;
use crate::registers::{DeviceId, RegisterValue};

/// Represents all possible errors that can occur while talking to the devices.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wraps `proto::Error`.
    #[error(transparent)]
    ProtocolError(#[from] proto::Error),

    /// Serial or GPIO I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wraps `tokio_serial::Error`.
    #[cfg(feature = "tokio-serial")]
    #[error(transparent)]
    SerialError(#[from] tokio_serial::Error),

    #[error("GPIO is not available")]
    GpioUnavailable,

    #[error("No reply to {0} within {1:?}")]
    Timeout(CommandKind, Duration),

    #[error("No measurement within {0:?}")]
    MeasurementTimeout(Duration),

    #[error("{0} request was superseded by a newer one")]
    Superseded(CommandKind),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(proto::DecodedFrame),

    #[error("The serial link to the sensor is closed")]
    LinkClosed,

    #[error("The device controller is not initialized")]
    NotInitialized,

    #[error("Device {0} is read-only")]
    ReadOnly(DeviceId),

    #[error("Value {1} cannot be written to {0}")]
    TypeMismatch(DeviceId, RegisterValue),

    #[error("Unknown node {0}")]
    UnknownNode(String),

    #[error("Node {0} is not writeable")]
    NotWriteable(String),

    #[error("Node {node} expects {expected}, got {actual}")]
    DataTypeMismatch {
        node: String,
        expected: String,
        actual: &'static str,
    },

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// The result type for tokio operations.
pub type Result<T> = std::result::Result<T, crate::tokio_common::Error>;

/// Locks `mutex`, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The parity used for serial communication.
#[cfg(feature = "tokio-serial")]
pub const PARITY: &tokio_serial::Parity = &tokio_serial::Parity::None;
/// The number of stop bits used for serial communication.
#[cfg(feature = "tokio-serial")]
pub const STOP_BITS: &tokio_serial::StopBits = &tokio_serial::StopBits::One;
/// The number of data bits used for serial communication.
#[cfg(feature = "tokio-serial")]
pub const DATA_BITS: &tokio_serial::DataBits = &tokio_serial::DataBits::Eight;

/// Creates a `tokio_serial::SerialPortBuilder` with the specified settings.
///
/// # Arguments
///
/// * `device` - The path to the serial port device (e.g., `/dev/serial0`).
/// * `baud_rate` - The baud rate for the serial communication.
#[cfg(feature = "tokio-serial")]
pub fn serial_port_builder(
    device: &str,
    baud_rate: &proto::BaudRate,
) -> tokio_serial::SerialPortBuilder {
    tokio_serial::new(device, **baud_rate)
        .parity(*PARITY)
        .stop_bits(*STOP_BITS)
        .data_bits(*DATA_BITS)
        .flow_control(tokio_serial::FlowControl::None)
}

/// Opens the serial port `device` as an async stream.
#[cfg(feature = "tokio-serial")]
pub fn open_serial(device: &str, baud_rate: &proto::BaudRate) -> Result<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;

    Ok(serial_port_builder(device, baud_rate).open_native_async()?)
}
