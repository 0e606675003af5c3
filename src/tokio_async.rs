//! Asynchronous serial link to the TF-Luna distance sensor.
//!
//! [`TfLuna`] owns both halves of a byte stream (usually a
//! `tokio_serial::SerialStream`). A background reader task feeds incoming
//! bytes through a [`FrameDecoder`], keeps the [`DeviceStatus`] up to date and
//! hands command replies to the waiting caller through a
//! [`CommandCorrelator`]. Commands are serialized: only one request is on the
//! wire at a time, and every wait is bounded by
//! [`TfLunaOptions::command_timeout`].
//!
//! All methods that talk to the sensor are `async` and must be `.await`ed.
//!
//! # Examples
//!
//! ```no_run
//! use tfluna_plc_lib::protocol::{BaudRate, SampleRate};
//! use tfluna_plc_lib::tokio_async::{TfLuna, TfLunaOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let port = tfluna_plc_lib::tokio_common::open_serial("/dev/serial0", &BaudRate::default())?;
//!     let sensor = TfLuna::attach(port, TfLunaOptions::default());
//!
//!     println!("Firmware: {}", sensor.get_version().await?);
//!     sensor.set_sample_rate(SampleRate::try_from(10)?).await?;
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::*;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::correlator::{CommandCorrelator, CommandKind, Completion};
use crate::protocol::{
    self as proto, BaudRate, Command, DecodedFrame, FirmwareVersion, FrameDecoder, Measurement,
    SampleRate,
};
use crate::tokio_common::{lock, Error, Result};

/// Log target of the measurement stream.
pub const MEASUREMENT_LOG_TARGET: &str = "tfluna::measurement";

const READ_BUFFER_SIZE: usize = 256;

/// Tuning of the sensor link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TfLunaOptions {
    /// Upper bound for waiting on a command reply.
    pub command_timeout: Duration,
    /// Drop incoming frames with a wrong checksum.
    pub verify_checksum: bool,
}

impl Default for TfLunaOptions {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(2),
            verify_checksum: false,
        }
    }
}

/// Last values reported by the sensor.
///
/// Every field is only written by the link's reader task.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceStatus {
    pub restore_defaults_status: u8,
    pub save_settings_status: u8,
    pub soft_reset_status: u8,
    pub baud_rate: u32,
    /// Zero means continuous sampling is stopped.
    pub sample_rate: u16,
    pub version: FirmwareVersion,
    /// Latest distance in cm, zero for an invalid reading.
    pub measurement_cm: u16,
}

/// Which optional log streams are enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase", default))]
pub struct ObserveTargets {
    /// Log every measurement on [`MEASUREMENT_LOG_TARGET`].
    pub measurements: bool,
    /// Log parser internals and command replies on [`proto::PARSER_LOG_TARGET`].
    pub parser_command_response: bool,
}

struct Shared {
    status: Mutex<DeviceStatus>,
    correlator: Mutex<CommandCorrelator>,
    measurements: watch::Sender<Option<Measurement>>,
    observe_measurements: AtomicBool,
    observe_parser: AtomicBool,
    closed: AtomicBool,
}

impl Shared {
    fn handle_frame(&self, frame: DecodedFrame) {
        {
            let mut status = lock(&self.status);
            match frame {
                DecodedFrame::RestoreDefaults { status: s } => status.restore_defaults_status = s,
                DecodedFrame::SaveSettings { status: s } => status.save_settings_status = s,
                DecodedFrame::SoftReset { status: s } => status.soft_reset_status = s,
                DecodedFrame::SetBaudRate { baud_rate } => status.baud_rate = baud_rate,
                DecodedFrame::SetSampleRate { sample_rate } => status.sample_rate = sample_rate,
                DecodedFrame::GetVersion { version } => status.version = version,
                DecodedFrame::Measurement(measurement) => {
                    status.measurement_cm = measurement.dist_cm;
                }
            }
        }

        if let DecodedFrame::Measurement(measurement) = frame {
            if self.observe_measurements.load(Ordering::Relaxed) {
                info!(target: MEASUREMENT_LOG_TARGET, "{frame}");
            }
            self.measurements.send_replace(Some(measurement));
            return;
        }

        if self.observe_parser.load(Ordering::Relaxed) {
            info!(target: proto::PARSER_LOG_TARGET, "{frame}");
        }
        if let Some(kind) = CommandKind::from_command(frame.command_id()) {
            if !lock(&self.correlator).resolve(kind, frame) {
                debug!("Unsolicited reply: {frame}");
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.correlator).cancel_all();
    }
}

async fn read_loop<R>(mut reader: R, shared: Arc<Shared>, mut decoder: FrameDecoder)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => {
                info!("Sensor link closed");
                break;
            }
            Ok(n) => {
                decoder.set_trace(shared.observe_parser.load(Ordering::Relaxed));
                for frame in decoder.push(&buffer[..n]) {
                    shared.handle_frame(frame);
                }
            }
            Err(err) => {
                error!("Sensor link read failed: {err}");
                break;
            }
        }
    }
    decoder.reset();
    shared.close();
}

/// Handle to a TF-Luna sensor on an async byte stream.
pub struct TfLuna {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    shared: Arc<Shared>,
    options: TfLunaOptions,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for TfLuna {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TfLuna")
            .field("options", &self.options)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl TfLuna {
    /// Takes over `io` and starts the reader task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach<T>(io: T, options: TfLunaOptions) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let shared = Arc::new(Shared {
            status: Mutex::new(DeviceStatus::default()),
            correlator: Mutex::new(CommandCorrelator::new()),
            measurements: watch::Sender::new(None),
            observe_measurements: AtomicBool::new(false),
            observe_parser: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let decoder = FrameDecoder::new().with_checksum_verification(options.verify_checksum);
        let reader = tokio::spawn(read_loop(reader, shared.clone(), decoder));
        Self {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            shared,
            options,
            reader,
        }
    }

    pub fn options(&self) -> &TfLunaOptions {
        &self.options
    }

    /// Whether the reader task saw end of stream or a read error.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Snapshot of the last reported values.
    pub fn status(&self) -> DeviceStatus {
        *lock(&self.shared.status)
    }

    /// Latest distance in cm. Never polls the sensor.
    pub fn measurement_cm(&self) -> u16 {
        lock(&self.shared.status).measurement_cm
    }

    /// Whether continuous sampling is stopped.
    pub fn is_idle(&self) -> bool {
        lock(&self.shared.status).sample_rate == 0
    }

    /// Receiver for the latest decoded measurement.
    pub fn subscribe_measurements(&self) -> watch::Receiver<Option<Measurement>> {
        self.shared.measurements.subscribe()
    }

    /// Switches the optional log streams.
    pub fn observe(&self, targets: ObserveTargets) {
        self.shared
            .observe_measurements
            .store(targets.measurements, Ordering::Relaxed);
        self.shared
            .observe_parser
            .store(targets.parser_command_response, Ordering::Relaxed);
    }

    pub fn observe_targets(&self) -> ObserveTargets {
        ObserveTargets {
            measurements: self.shared.observe_measurements.load(Ordering::Relaxed),
            parser_command_response: self.shared.observe_parser.load(Ordering::Relaxed),
        }
    }

    async fn write_frame(
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        bytes: &[u8],
    ) -> std::io::Result<()> {
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    async fn execute(&self, command: Command, kind: CommandKind) -> Result<DecodedFrame> {
        let mut writer = self.writer.lock().await;

        let waiter = lock(&self.shared.correlator).register(kind);
        let generation = waiter.generation();
        if self.is_closed() {
            lock(&self.shared.correlator).cancel(kind);
            return Err(Error::LinkClosed);
        }

        let bytes = command.encode();
        debug!("Sending {kind}: {bytes:02X?}");
        if let Err(err) = Self::write_frame(&mut **writer, &bytes).await {
            lock(&self.shared.correlator).cancel(kind);
            return Err(err.into());
        }

        match tokio::time::timeout(self.options.command_timeout, waiter.wait()).await {
            Ok(Completion::Resolved(frame)) => Ok(frame),
            Ok(Completion::Superseded) => Err(Error::Superseded(kind)),
            Ok(Completion::Cancelled) => Err(Error::LinkClosed),
            Err(_) => {
                // a reply still on its way belongs to this request
                let late_reply_deadline = Instant::now() + self.options.command_timeout;
                lock(&self.shared.correlator).abandon(kind, generation, late_reply_deadline);
                warn!("No reply to {kind} within {:?}", self.options.command_timeout);
                Err(Error::Timeout(kind, self.options.command_timeout))
            }
        }
    }

    /// Restarts the sensor firmware. Returns the reported status byte.
    pub async fn soft_reset(&self) -> Result<u8> {
        match self.execute(Command::SoftReset, CommandKind::SoftReset).await? {
            DecodedFrame::SoftReset { status } => Ok(status),
            other => Err(Error::UnexpectedReply(other)),
        }
    }

    /// Restores the factory settings. Returns the reported status byte.
    pub async fn restore_defaults(&self) -> Result<u8> {
        match self
            .execute(Command::RestoreDefaults, CommandKind::RestoreDefaults)
            .await?
        {
            DecodedFrame::RestoreDefaults { status } => Ok(status),
            other => Err(Error::UnexpectedReply(other)),
        }
    }

    /// Persists the current settings. Returns the reported status byte.
    pub async fn save_settings(&self) -> Result<u8> {
        match self
            .execute(Command::SaveSettings, CommandKind::SaveSettings)
            .await?
        {
            DecodedFrame::SaveSettings { status } => Ok(status),
            other => Err(Error::UnexpectedReply(other)),
        }
    }

    /// Sets the sensor's baud rate. Returns the rate the sensor acknowledged.
    pub async fn set_baud_rate(&self, baud_rate: BaudRate) -> Result<u32> {
        match self
            .execute(Command::SetBaudRate(baud_rate), CommandKind::SetBaudRate)
            .await?
        {
            DecodedFrame::SetBaudRate { baud_rate } => Ok(baud_rate),
            other => Err(Error::UnexpectedReply(other)),
        }
    }

    /// Sets the frame rate, zero stops continuous sampling.
    ///
    /// Returns the rate the sensor acknowledged.
    pub async fn set_sample_rate(&self, sample_rate: SampleRate) -> Result<u16> {
        match self
            .execute(Command::SetSampleRate(sample_rate), CommandKind::SetSampleRate)
            .await?
        {
            DecodedFrame::SetSampleRate { sample_rate } => Ok(sample_rate),
            other => Err(Error::UnexpectedReply(other)),
        }
    }

    pub async fn get_version(&self) -> Result<FirmwareVersion> {
        match self
            .execute(Command::GetVersion, CommandKind::GetVersion)
            .await?
        {
            DecodedFrame::GetVersion { version } => Ok(version),
            other => Err(Error::UnexpectedReply(other)),
        }
    }

    /// Requests a single measurement.
    ///
    /// Only written while continuous sampling is stopped; returns `false` and
    /// sends nothing otherwise. The measurement arrives through
    /// [`TfLuna::subscribe_measurements`].
    pub async fn trigger_measurement(&self) -> Result<bool> {
        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(Error::LinkClosed);
        }
        if !self.is_idle() {
            debug!("Continuous sampling active, single measurement skipped");
            return Ok(false);
        }
        Self::write_frame(&mut **writer, &Command::TriggerMeasurement.encode()).await?;
        Ok(true)
    }

    /// Triggers a single measurement and waits for it.
    pub async fn measure_once(&self) -> Result<Option<Measurement>> {
        let mut rx = self.subscribe_measurements();
        if !self.trigger_measurement().await? {
            return Ok(None);
        }
        match tokio::time::timeout(self.options.command_timeout, rx.changed()).await {
            Ok(Ok(())) => Ok(*rx.borrow()),
            Ok(Err(_)) => Err(Error::LinkClosed),
            Err(_) => Err(Error::MeasurementTimeout(self.options.command_timeout)),
        }
    }
}

impl Drop for TfLuna {
    fn drop(&mut self) {
        self.reader.abort();
        self.shared.close();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::io::DuplexStream;

    /// Builds a command frame with length and checksum around `body`.
    pub(crate) fn reply(body: &[u8]) -> Vec<u8> {
        let mut frame = vec![proto::COMMAND_HEADER, (body.len() + 3) as u8];
        frame.extend_from_slice(body);
        frame.push(proto::checksum(&frame));
        frame
    }

    pub(crate) fn measurement_frame(dist: u16, amplitude: u16) -> Vec<u8> {
        let mut frame = vec![0x59, 0x59];
        frame.extend_from_slice(&dist.to_le_bytes());
        frame.extend_from_slice(&amplitude.to_le_bytes());
        frame.extend_from_slice(&[0xC8, 0x03]);
        frame.push(proto::checksum(&frame));
        frame
    }

    /// Answers like a TF-Luna: echoes settings, status zero, version 1.3.6.
    pub(crate) fn sensor_reply(command: &[u8]) -> Vec<u8> {
        match command[2] {
            0x01 => reply(&[0x01, 1, 3, 6]),
            0x02 => reply(&[0x02, 0]),
            0x03 => reply(&[0x03, command[3], command[4]]),
            0x04 => measurement_frame(150, 1000),
            0x06 => reply(&[0x06, command[3], command[4], command[5], command[6]]),
            0x10 => reply(&[0x10, 0]),
            0x11 => reply(&[0x11, 0]),
            _ => Vec::new(),
        }
    }

    /// Runs a fake sensor on `device`, returning every command it received.
    pub(crate) fn spawn_sensor(
        mut device: DuplexStream,
        respond: fn(&[u8]) -> Vec<u8>,
    ) -> JoinHandle<Vec<Vec<u8>>> {
        tokio::spawn(async move {
            let mut received = Vec::new();
            let mut pending = Vec::new();
            let mut buffer = [0u8; 64];
            loop {
                let n = match device.read(&mut buffer).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                pending.extend_from_slice(&buffer[..n]);
                while pending.len() >= 2 && pending.len() >= pending[1] as usize {
                    let command: Vec<u8> = pending.drain(..pending[1] as usize).collect();
                    let answer = respond(&command);
                    received.push(command);
                    if !answer.is_empty() && device.write_all(&answer).await.is_err() {
                        return received;
                    }
                }
            }
            received
        })
    }

    fn silent(_: &[u8]) -> Vec<u8> {
        Vec::new()
    }

    #[tokio::test]
    async fn commands_resolve_and_update_status() {
        let (client, device) = tokio::io::duplex(256);
        let sensor_task = spawn_sensor(device, sensor_reply);
        let sensor = TfLuna::attach(client, TfLunaOptions::default());

        assert_eq!(sensor.soft_reset().await.unwrap(), 0);
        assert_eq!(sensor.set_baud_rate(BaudRate::default()).await.unwrap(), 115_200);
        assert_eq!(
            sensor
                .set_sample_rate(SampleRate::try_from(10).unwrap())
                .await
                .unwrap(),
            10
        );
        assert_eq!(sensor.save_settings().await.unwrap(), 0);
        assert_eq!(sensor.get_version().await.unwrap().to_string(), "1.3.6");
        assert_eq!(sensor.restore_defaults().await.unwrap(), 0);

        let status = sensor.status();
        assert_eq!(status.baud_rate, 115_200);
        assert_eq!(status.sample_rate, 10);
        assert_eq!(status.version.to_string(), "1.3.6");
        assert!(!sensor.is_idle());

        drop(sensor);
        let received = sensor_task.await.unwrap();
        assert_eq!(received[0], vec![0x5A, 0x04, 0x02, 0x60]);
        assert_eq!(received.len(), 6);
        assert_eq!(received[5][2], 0x10);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_sensor_times_out() {
        let (client, device) = tokio::io::duplex(256);
        let _sensor_task = spawn_sensor(device, silent);
        let sensor = TfLuna::attach(
            client,
            TfLunaOptions {
                command_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        );

        assert_matches!(
            sensor.get_version().await,
            Err(Error::Timeout(CommandKind::GetVersion, _))
        );
        assert!(!lock(&sensor.shared.correlator).is_pending(CommandKind::GetVersion));
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_does_not_answer_next_request() {
        let (client, mut device) = tokio::io::duplex(256);
        let sensor_task = tokio::spawn(async move {
            let mut command = [0u8; 6];
            device.read_exact(&mut command).await.unwrap();
            // answers only after the client gave up
            tokio::time::sleep(Duration::from_secs(3)).await;
            device.write_all(&reply(&[0x03, 5, 0])).await.unwrap();

            device.read_exact(&mut command).await.unwrap();
            device.write_all(&reply(&[0x03, 10, 0])).await.unwrap();
            device
        });
        let sensor = TfLuna::attach(client, TfLunaOptions::default());

        assert_matches!(
            sensor.set_sample_rate(SampleRate::try_from(5).unwrap()).await,
            Err(Error::Timeout(CommandKind::SetSampleRate, _))
        );
        assert_eq!(
            sensor
                .set_sample_rate(SampleRate::try_from(10).unwrap())
                .await
                .unwrap(),
            10
        );
        let _device = sensor_task.await.unwrap();
    }

    #[tokio::test]
    async fn closed_link_fails_pending_and_new_commands() {
        let (client, device) = tokio::io::duplex(256);
        let sensor = TfLuna::attach(client, TfLunaOptions::default());
        drop(device);

        assert_matches!(sensor.soft_reset().await, Err(Error::LinkClosed) | Err(Error::Io(_)));
        while !sensor.is_closed() {
            tokio::task::yield_now().await;
        }
        assert_matches!(sensor.save_settings().await, Err(Error::LinkClosed));
    }

    #[tokio::test]
    async fn single_measurement() {
        let (client, device) = tokio::io::duplex(256);
        let _sensor_task = spawn_sensor(device, sensor_reply);
        let sensor = TfLuna::attach(client, TfLunaOptions::default());
        sensor.observe(ObserveTargets {
            measurements: true,
            parser_command_response: true,
        });

        let measurement = sensor.measure_once().await.unwrap().unwrap();
        assert_eq!(measurement.dist_cm, 150);
        assert_eq!(sensor.measurement_cm(), 150);
        assert!(sensor.observe_targets().measurements);
    }

    #[tokio::test]
    async fn single_measurement_skipped_while_sampling() {
        let (client, device) = tokio::io::duplex(256);
        let sensor_task = spawn_sensor(device, sensor_reply);
        let sensor = TfLuna::attach(client, TfLunaOptions::default());

        sensor
            .set_sample_rate(SampleRate::try_from(5).unwrap())
            .await
            .unwrap();
        assert!(!sensor.trigger_measurement().await.unwrap());
        assert_eq!(sensor.measure_once().await.unwrap(), None);

        drop(sensor);
        let received = sensor_task.await.unwrap();
        assert!(received.iter().all(|command| command[2] != 0x04));
    }

    #[tokio::test]
    async fn unsolicited_measurements_update_status() {
        let (client, mut device) = tokio::io::duplex(256);
        let sensor = TfLuna::attach(client, TfLunaOptions::default());
        let mut rx = sensor.subscribe_measurements();

        let mut stream = measurement_frame(42, 500);
        stream.extend(measurement_frame(43, 50));
        device.write_all(&stream[..5]).await.unwrap();
        device.write_all(&stream[5..]).await.unwrap();

        rx.changed().await.unwrap();
        while rx.borrow_and_update().map(|m| m.sequence) != Some(1) {
            rx.changed().await.unwrap();
        }
        // low amplitude reading
        assert_eq!(sensor.measurement_cm(), 0);
    }
}
