//! Matches replies from the sensor to the command that requested them.
//!
//! The serial link is half-duplex and replies carry no request id, only the
//! command identifier. [`CommandCorrelator`] therefore keeps at most one
//! pending [`Waiter`] per [`CommandKind`]. Registering a kind that is already
//! pending replaces the earlier waiter, which then completes with
//! [`Completion::Superseded`]; callers are expected to serialize commands of
//! the same kind.
//!
//! Every registration carries a generation number. When a caller gives up on
//! a request ([`CommandCorrelator::abandon`]), the next reply of that kind
//! still belongs to the abandoned request, because the sensor answers in
//! order. Such a late reply is discarded instead of completing a newer waiter,
//! as long as it arrives before the given deadline.

use crate::protocol::{CommandId, DecodedFrame};
use std::fmt;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Command kinds whose reply can be awaited.
///
/// Measurements are not correlated: they arrive unsolicited while sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    RestoreDefaults,
    SaveSettings,
    SoftReset,
    SetBaudRate,
    SetSampleRate,
    GetVersion,
}

impl CommandKind {
    pub const ALL: [CommandKind; 6] = [
        CommandKind::RestoreDefaults,
        CommandKind::SaveSettings,
        CommandKind::SoftReset,
        CommandKind::SetBaudRate,
        CommandKind::SetSampleRate,
        CommandKind::GetVersion,
    ];

    fn slot(self) -> usize {
        self as usize
    }

    /// Maps a command identifier to its kind, `None` for uncorrelated commands.
    pub fn from_command(id: CommandId) -> Option<Self> {
        match id {
            CommandId::RestoreDefaults => Some(Self::RestoreDefaults),
            CommandId::SaveSettings => Some(Self::SaveSettings),
            CommandId::SoftReset => Some(Self::SoftReset),
            CommandId::SetBaudRate => Some(Self::SetBaudRate),
            CommandId::SetSampleRate => Some(Self::SetSampleRate),
            CommandId::GetVersion => Some(Self::GetVersion),
            CommandId::TriggerMeasurement => None,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RestoreDefaults => "RestoreDefaults",
            Self::SaveSettings => "SaveSettings",
            Self::SoftReset => "SoftReset",
            Self::SetBaudRate => "SetBaudRate",
            Self::SetSampleRate => "SetSampleRate",
            Self::GetVersion => "GetVersion",
        };
        f.write_str(name)
    }
}

/// Outcome delivered to a [`Waiter`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Completion {
    /// The matching reply arrived.
    Resolved(DecodedFrame),
    /// A newer registration of the same kind replaced this one.
    Superseded,
    /// The slot was cancelled, e.g. on timeout or because the link closed.
    Cancelled,
}

/// Awaitable end of a correlation slot.
#[derive(Debug)]
pub struct Waiter {
    kind: CommandKind,
    generation: u64,
    rx: oneshot::Receiver<Completion>,
}

impl Waiter {
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Identifies this registration, see [`CommandCorrelator::abandon`].
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Waits for the slot to complete.
    pub async fn wait(self) -> Completion {
        // A dropped sender without an explicit completion counts as cancelled.
        self.rx.await.unwrap_or(Completion::Cancelled)
    }
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    tx: oneshot::Sender<Completion>,
}

/// Fixed table of single-completion slots, one per [`CommandKind`].
#[derive(Debug, Default)]
pub struct CommandCorrelator {
    slots: [Option<Slot>; 6],
    /// Deadline for the late reply of an abandoned request, per kind.
    late_replies: [Option<Instant>; 6],
    next_generation: u64,
}

impl CommandCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the slot for `kind`, superseding any waiter still pending there.
    pub fn register(&mut self, kind: CommandKind) -> Waiter {
        let (tx, rx) = oneshot::channel();
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        if let Some(previous) = self.slots[kind.slot()].replace(Slot { generation, tx }) {
            if !previous.tx.is_closed() {
                log::warn!("Pending {kind} waiter superseded by a new request");
            }
            let _ = previous.tx.send(Completion::Superseded);
        }
        Waiter {
            kind,
            generation,
            rx,
        }
    }

    /// Completes the slot for `kind` with `frame`.
    ///
    /// Returns `false` if nobody was waiting for this kind, or if the frame
    /// was taken as the late reply of an abandoned request.
    pub fn resolve(&mut self, kind: CommandKind, frame: DecodedFrame) -> bool {
        if let Some(deadline) = self.late_replies[kind.slot()].take() {
            if Instant::now() <= deadline {
                log::warn!("Discarding late reply to an abandoned {kind} request: {frame}");
                return false;
            }
        }
        match self.slots[kind.slot()].take() {
            Some(slot) => slot.tx.send(Completion::Resolved(frame)).is_ok(),
            None => false,
        }
    }

    /// Cancels the slot for `kind`. Returns `true` if a waiter was pending.
    pub fn cancel(&mut self, kind: CommandKind) -> bool {
        match self.slots[kind.slot()].take() {
            Some(slot) => slot.tx.send(Completion::Cancelled).is_ok(),
            None => false,
        }
    }

    /// Gives up on the registration `generation` of `kind`.
    ///
    /// The slot is cancelled if it still belongs to that registration. A reply
    /// of this kind arriving until `late_reply_deadline` is then discarded.
    pub fn abandon(&mut self, kind: CommandKind, generation: u64, late_reply_deadline: Instant) {
        let index = kind.slot();
        if self.slots[index]
            .as_ref()
            .is_some_and(|slot| slot.generation == generation)
        {
            self.cancel(kind);
            self.late_replies[index] = Some(late_reply_deadline);
        }
    }

    /// Cancels every pending slot.
    pub fn cancel_all(&mut self) {
        for kind in CommandKind::ALL {
            self.cancel(kind);
        }
    }

    pub fn is_pending(&self, kind: CommandKind) -> bool {
        self.slots[kind.slot()]
            .as_ref()
            .is_some_and(|slot| !slot.tx.is_closed())
    }
}
