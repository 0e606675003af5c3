//! A library for the TF-Luna distance sensor and a three-lamp indicator
//! light, as driven by a small Raspberry Pi based PLC.
//!
//! The crate is layered bottom-up:
//!
//! 1.  **Protocol**: the sensor's binary serial protocol, a stateful
//!     [`protocol::FrameDecoder`] and command encoding. Pure and synchronous.
//! 2.  **Sensor link**: [`tokio_async::TfLuna`] owns the serial stream, decodes
//!     replies in a background task and correlates them with the pending
//!     request (see [`correlator`]).
//! 3.  **Controller**: [`controller::DeviceController`] owns the lamps (see
//!     [`gpio`]) and the sensor link, runs the start-up sequence and the
//!     periodic [`indicator`] engine, and exposes a uniform register map
//!     ([`registers`]).
//! 4.  **Service**: [`service::PlcService`] turns control requests, observe
//!     requests and address-space method calls into controller operations.
//!
//! ## Features
//!
//! - **Protocol Implementation**: Command encoding with checksum and a
//!   resynchronizing decoder for command replies and measurement frames.
//! - **Bounded Requests**: Every command waits at most a configurable timeout.
//! - **Pluggable GPIO**: the Linux GPIO character device or an in-memory
//!   simulation.
//! - **Strongly-Typed API**: `BaudRate`, `SampleRate`, `IndicatorMode`,
//!   `DeviceId` and friends reject invalid values at the boundary.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tfluna_plc_lib::{
//!     config::DeviceConfig,
//!     controller::{DeviceController, MeasurementAction},
//!     gpio::CdevGpio,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(DeviceConfig::with_pins(17, 27, 22));
//!     let controller = DeviceController::new(config, Arc::new(CdevGpio::default()));
//!
//!     controller.initialize_serial().await?;
//!     controller.measurement_control(MeasurementAction::Start).await?;
//!
//!     println!("Distance: {} cm", controller.status().measurement_cm);
//!     Ok(())
//! }
//! ```

pub mod protocol;

pub mod config;
pub mod controller;
pub mod correlator;
pub mod gpio;
pub mod indicator;
pub mod registers;
pub mod service;
pub mod tokio_async;
pub mod tokio_common;
