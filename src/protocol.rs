//! Wire format of the TF-Luna distance sensor serial protocol.
//!
//! The sensor speaks two frame shapes on the same byte stream:
//!
//! * **Command frames** `[0x5A, len, cmd, payload.., checksum]`, used for every
//!   request written to the sensor and every reply to a configuration command.
//!   `len` covers the whole frame from header to checksum.
//! * **Measurement frames** `[0x59, 0x59, dist_lo, dist_hi, amp_lo, amp_hi,
//!   temp_lo, temp_hi, checksum]`, emitted continuously while sampling is
//!   active or once per [`Command::TriggerMeasurement`].
//!
//! This module is pure: it encodes outbound commands and turns an unaligned
//! byte stream into [`DecodedFrame`] values through [`FrameDecoder`]. It never
//! touches I/O.

use std::fmt;

/// First byte of every command frame.
pub const COMMAND_HEADER: u8 = 0x5A;
/// First two bytes of every measurement frame.
pub const MEASUREMENT_HEADER: [u8; 2] = [0x59, 0x59];
/// Measurement frames have a fixed size.
pub const MEASUREMENT_FRAME_LEN: usize = 9;
/// Shortest possible command frame: header, length, command id, checksum.
pub const MIN_COMMAND_FRAME_LEN: usize = 4;
/// Longest command frame the decoder accepts before treating the length byte as noise.
pub const MAX_COMMAND_FRAME_LEN: usize = 32;

/// Readings with an amplitude at or below this value are unreliable.
pub const AMPLITUDE_MIN_VALID: u16 = 100;
/// The sensor reports this amplitude when the receiver is saturated.
pub const AMPLITUDE_OVEREXPOSED: u16 = 0xFFFF;

/// Log target of the parser debug stream.
pub const PARSER_LOG_TARGET: &str = "tfluna::parser";

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("The sample rate {0} Hz is outside of the supported range 0..={max}", max = SampleRate::MAX)]
    SampleRateOutOfRange(u16),
    #[error("The baud rate {0} is not supported by the sensor")]
    UnsupportedBaudRate(u32),
    #[error("Unknown command identifier 0x{0:02X}")]
    UnknownCommand(u8),
    #[error("Unknown indicator light mode '{0}'")]
    UnknownIndicatorMode(String),
    #[error("Unknown device id '{0}'")]
    UnknownDeviceId(String),
    #[error("Invalid GPIO level '{0}', expected 0 or 1")]
    InvalidLevel(String),
    #[error("Unknown measurement action '{0}'")]
    UnknownMeasurementAction(String),
}

/// Computes the frame checksum: the low byte of the sum of all preceding bytes.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Command identifiers understood by the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandId {
    GetVersion = 0x01,
    SoftReset = 0x02,
    SetSampleRate = 0x03,
    TriggerMeasurement = 0x04,
    SetBaudRate = 0x06,
    RestoreDefaults = 0x10,
    SaveSettings = 0x11,
}

impl TryFrom<u8> for CommandId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::GetVersion),
            0x02 => Ok(Self::SoftReset),
            0x03 => Ok(Self::SetSampleRate),
            0x04 => Ok(Self::TriggerMeasurement),
            0x06 => Ok(Self::SetBaudRate),
            0x10 => Ok(Self::RestoreDefaults),
            0x11 => Ok(Self::SaveSettings),
            other => Err(Error::UnknownCommand(other)),
        }
    }
}

impl From<CommandId> for u8 {
    fn from(id: CommandId) -> u8 {
        id as u8
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::GetVersion => "get version",
            Self::SoftReset => "soft reset",
            Self::SetSampleRate => "set sample rate",
            Self::TriggerMeasurement => "trigger measurement",
            Self::SetBaudRate => "set baud rate",
            Self::RestoreDefaults => "restore default settings",
            Self::SaveSettings => "save current settings",
        };
        write!(f, "{name} (0x{:02X})", *self as u8)
    }
}

/// The serial baud rate of the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "u32", into = "u32"))]
pub struct BaudRate(u32);

impl BaudRate {
    /// Baud rates the sensor firmware accepts for the set-baud-rate command.
    pub const SUPPORTED: [u32; 14] = [
        9_600, 14_400, 19_200, 38_400, 56_000, 57_600, 115_200, 128_000, 230_400, 256_000,
        460_800, 512_000, 750_000, 921_600,
    ];
}

impl Default for BaudRate {
    fn default() -> Self {
        Self(115_200)
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if Self::SUPPORTED.contains(&value) {
            Ok(Self(value))
        } else {
            Err(Error::UnsupportedBaudRate(value))
        }
    }
}

impl From<BaudRate> for u32 {
    fn from(baud_rate: BaudRate) -> u32 {
        baud_rate.0
    }
}

impl std::ops::Deref for BaudRate {
    type Target = u32;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Frame output rate of the sensor in Hz. Zero stops continuous sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "u16", into = "u16"))]
pub struct SampleRate(u16);

impl SampleRate {
    pub const IDLE: SampleRate = SampleRate(0);
    pub const MAX: u16 = 250;

    pub fn is_idle(&self) -> bool {
        self.0 == 0
    }
}

impl TryFrom<u16> for SampleRate {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        if value <= Self::MAX {
            Ok(Self(value))
        } else {
            Err(Error::SampleRateOutOfRange(value))
        }
    }
}

impl From<SampleRate> for u16 {
    fn from(rate: SampleRate) -> u16 {
        rate.0
    }
}

impl std::ops::Deref for SampleRate {
    type Target = u16;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for SampleRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz", self.0)
    }
}

/// A request written to the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    GetVersion,
    SoftReset,
    SetSampleRate(SampleRate),
    TriggerMeasurement,
    SetBaudRate(BaudRate),
    RestoreDefaults,
    SaveSettings,
}

impl Command {
    pub fn id(&self) -> CommandId {
        match self {
            Self::GetVersion => CommandId::GetVersion,
            Self::SoftReset => CommandId::SoftReset,
            Self::SetSampleRate(_) => CommandId::SetSampleRate,
            Self::TriggerMeasurement => CommandId::TriggerMeasurement,
            Self::SetBaudRate(_) => CommandId::SetBaudRate,
            Self::RestoreDefaults => CommandId::RestoreDefaults,
            Self::SaveSettings => CommandId::SaveSettings,
        }
    }

    /// Serializes the command into a complete frame including the checksum.
    pub fn encode(&self) -> Vec<u8> {
        let payload: Vec<u8> = match self {
            Self::SetSampleRate(rate) => u16::from(*rate).to_le_bytes().to_vec(),
            Self::SetBaudRate(baud_rate) => u32::from(*baud_rate).to_le_bytes().to_vec(),
            _ => Vec::new(),
        };
        let len = MIN_COMMAND_FRAME_LEN + payload.len();
        let mut frame = Vec::with_capacity(len);
        frame.push(COMMAND_HEADER);
        frame.push(len as u8);
        frame.push(self.id().into());
        frame.extend_from_slice(&payload);
        frame.push(checksum(&frame));
        frame
    }
}

/// Firmware version reported by the get-version command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u8,
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}

/// One distance reading.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Measurement {
    /// Distance in cm, zero when the amplitude marks the reading as invalid.
    pub dist_cm: u16,
    pub amplitude: u16,
    /// Chip temperature in °C.
    pub temp_c: f32,
    /// Per-decoder counter, increases by one for every measurement frame.
    pub sequence: u32,
}

impl Measurement {
    pub fn is_valid(&self) -> bool {
        amplitude_is_valid(self.amplitude)
    }
}

fn amplitude_is_valid(amplitude: u16) -> bool {
    amplitude > AMPLITUDE_MIN_VALID && amplitude != AMPLITUDE_OVEREXPOSED
}

fn decode_temperature(raw: u16) -> f32 {
    if raw == 0 {
        0.0
    } else {
        raw as f32 / 8.0 - 256.0
    }
}

/// A complete frame received from the sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodedFrame {
    RestoreDefaults { status: u8 },
    SaveSettings { status: u8 },
    SoftReset { status: u8 },
    SetBaudRate { baud_rate: u32 },
    SetSampleRate { sample_rate: u16 },
    GetVersion { version: FirmwareVersion },
    Measurement(Measurement),
}

impl DecodedFrame {
    /// The command this frame answers.
    pub fn command_id(&self) -> CommandId {
        match self {
            Self::RestoreDefaults { .. } => CommandId::RestoreDefaults,
            Self::SaveSettings { .. } => CommandId::SaveSettings,
            Self::SoftReset { .. } => CommandId::SoftReset,
            Self::SetBaudRate { .. } => CommandId::SetBaudRate,
            Self::SetSampleRate { .. } => CommandId::SetSampleRate,
            Self::GetVersion { .. } => CommandId::GetVersion,
            Self::Measurement(_) => CommandId::TriggerMeasurement,
        }
    }
}

impl fmt::Display for DecodedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RestoreDefaults { status } => write!(f, "Restore default settings: {status}"),
            Self::SaveSettings { status } => write!(f, "Save current settings: {status}"),
            Self::SoftReset { status } => write!(f, "Soft reset: {status}"),
            Self::SetBaudRate { baud_rate } => write!(f, "Current baud rate: {baud_rate}"),
            Self::SetSampleRate { sample_rate } => write!(f, "Set sample rate: {sample_rate}"),
            Self::GetVersion { version } => write!(f, "Firmware version: {version}"),
            Self::Measurement(m) => write!(
                f,
                "Measurement #{}: {} cm, amplitude {}, {:.3} °C",
                m.sequence, m.dist_cm, m.amplitude, m.temp_c
            ),
        }
    }
}

enum Step {
    Frame(DecodedFrame, usize),
    Skip(usize),
    Incomplete,
}

/// Reads a little-endian `u16` at `offset`, if the frame is long enough.
fn read_u16(frame: &[u8], offset: usize) -> Option<u16> {
    frame
        .get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(frame: &[u8], offset: usize) -> Option<u32> {
    frame
        .get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Stateful transducer from an unaligned byte stream to [`DecodedFrame`]s.
///
/// Bytes are appended with [`FrameDecoder::push`]; the returned iterator
/// extracts frames lazily. Incomplete trailing bytes stay buffered until the
/// next chunk arrives. Bytes that cannot start a frame are dropped one at a
/// time, so the decoder always resynchronizes on the next valid header.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    sequence: u32,
    verify_checksum: bool,
    trace: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops frames whose trailing checksum does not match instead of decoding them.
    pub fn with_checksum_verification(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    /// Enables the parser debug stream on [`PARSER_LOG_TARGET`].
    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Discards any partial frame, e.g. at end of stream.
    pub fn reset(&mut self) {
        if self.trace && !self.buffer.is_empty() {
            log::debug!(
                target: PARSER_LOG_TARGET,
                "Discarding {} buffered bytes: {:02X?}",
                self.buffer.len(),
                self.buffer
            );
        }
        self.buffer.clear();
    }

    /// Appends a chunk and returns an iterator over the frames it completes.
    ///
    /// Frames not consumed from the iterator remain available on the next call.
    pub fn push(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.buffer.extend_from_slice(chunk);
        if self.trace {
            log::debug!(
                target: PARSER_LOG_TARGET,
                "Received {} bytes, buffer: {:02X?}",
                chunk.len(),
                self.buffer
            );
        }
        Frames { decoder: self }
    }

    /// Convenience wrapper collecting every frame completed by `chunk`.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<DecodedFrame> {
        self.push(chunk).collect()
    }

    /// Extracts the next complete frame from the buffer, if any.
    pub fn next_frame(&mut self) -> Option<DecodedFrame> {
        while self.buffer.len() >= 2 {
            match self.step() {
                Step::Frame(frame, len) => {
                    self.buffer.drain(..len);
                    if self.trace {
                        log::debug!(target: PARSER_LOG_TARGET, "Decoded {frame}");
                    }
                    return Some(frame);
                }
                Step::Skip(len) => {
                    self.buffer.drain(..len);
                }
                Step::Incomplete => return None,
            }
        }
        None
    }

    fn step(&mut self) -> Step {
        if self.buffer[0] == COMMAND_HEADER {
            self.step_command()
        } else if self.buffer[..2] == MEASUREMENT_HEADER {
            self.step_measurement()
        } else {
            if self.trace {
                log::debug!(
                    target: PARSER_LOG_TARGET,
                    "Dropping unexpected byte 0x{:02X}",
                    self.buffer[0]
                );
            }
            Step::Skip(1)
        }
    }

    fn checksum_matches(&self, len: usize) -> bool {
        if !self.verify_checksum {
            return true;
        }
        let expected = checksum(&self.buffer[..len - 1]);
        let actual = self.buffer[len - 1];
        if expected != actual {
            log::warn!(
                target: PARSER_LOG_TARGET,
                "Checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}"
            );
        }
        expected == actual
    }

    fn step_command(&mut self) -> Step {
        let len = self.buffer[1] as usize;
        if !(MIN_COMMAND_FRAME_LEN..=MAX_COMMAND_FRAME_LEN).contains(&len) {
            if self.trace {
                log::debug!(target: PARSER_LOG_TARGET, "Invalid command frame length {len}");
            }
            return Step::Skip(1);
        }
        if self.buffer.len() < 3 {
            return Step::Incomplete;
        }
        // A real reply may start inside the span an unknown id claims.
        let id = match CommandId::try_from(self.buffer[2]) {
            Ok(CommandId::TriggerMeasurement) | Err(_) => {
                if self.trace {
                    log::debug!(
                        target: PARSER_LOG_TARGET,
                        "Unknown response data returned: 0x{:02X}",
                        self.buffer[2]
                    );
                }
                return Step::Skip(1);
            }
            Ok(id) => id,
        };
        if self.buffer.len() < len {
            return Step::Incomplete;
        }
        if !self.checksum_matches(len) {
            return Step::Skip(1);
        }

        let frame = &self.buffer[..len];
        if self.trace {
            log::debug!(
                target: PARSER_LOG_TARGET,
                "hdr: 0x{:02X}, len: {len}, cmd: 0x{:02X}, chk: 0x{:02X}",
                frame[0],
                frame[2],
                frame[len - 1]
            );
        }

        let decoded = match id {
            CommandId::RestoreDefaults => frame
                .get(3)
                .map(|&status| DecodedFrame::RestoreDefaults { status }),
            CommandId::SaveSettings => frame
                .get(3)
                .map(|&status| DecodedFrame::SaveSettings { status }),
            CommandId::SoftReset => frame
                .get(3)
                .map(|&status| DecodedFrame::SoftReset { status }),
            CommandId::SetBaudRate => {
                read_u32(frame, 3).map(|baud_rate| DecodedFrame::SetBaudRate { baud_rate })
            }
            CommandId::SetSampleRate => {
                read_u16(frame, 3).map(|sample_rate| DecodedFrame::SetSampleRate { sample_rate })
            }
            CommandId::GetVersion => frame.get(3..6).map(|v| DecodedFrame::GetVersion {
                version: FirmwareVersion {
                    major: v[0],
                    minor: v[1],
                    revision: v[2],
                },
            }),
            CommandId::TriggerMeasurement => None,
        };

        match decoded {
            Some(frame) => Step::Frame(frame, len),
            None => {
                if self.trace {
                    log::debug!(
                        target: PARSER_LOG_TARGET,
                        "Frame length {len} too short for {id}"
                    );
                }
                Step::Skip(1)
            }
        }
    }

    fn step_measurement(&mut self) -> Step {
        if self.buffer.len() < MEASUREMENT_FRAME_LEN {
            return Step::Incomplete;
        }
        if !self.checksum_matches(MEASUREMENT_FRAME_LEN) {
            return Step::Skip(1);
        }

        let frame = &self.buffer[..MEASUREMENT_FRAME_LEN];
        let amplitude = read_u16(frame, 4).unwrap_or_default();
        let dist_cm = if amplitude_is_valid(amplitude) {
            read_u16(frame, 2).unwrap_or_default()
        } else {
            0
        };
        let temp_c = decode_temperature(read_u16(frame, 6).unwrap_or_default());

        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);

        Step::Frame(
            DecodedFrame::Measurement(Measurement {
                dist_cm,
                amplitude,
                temp_c,
                sequence,
            }),
            MEASUREMENT_FRAME_LEN,
        )
    }
}

/// Lazy iterator returned by [`FrameDecoder::push`].
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
}

impl Iterator for Frames<'_> {
    type Item = DecodedFrame;

    fn next(&mut self) -> Option<Self::Item> {
        self.decoder.next_frame()
    }
}
