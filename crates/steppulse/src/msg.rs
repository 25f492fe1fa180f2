//! Outbound message bookkeeping for one stepper.

use bytes::Bytes;
use std::collections::VecDeque;

/// The two lives of a message's secondary clock field.
///
/// A freshly compressed step command knows when the MCU move-queue slot it
/// will occupy frees up again (the MCU pops a command off the queue to
/// begin executing it). Once the synchroniser claims a slot for the
/// command, the field flips to its transmit-scheduling meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClock {
    /// Fresh from the compressor. `slot_free_at` is `None` for commands
    /// that bypass the MCU move queue (direction changes, passthroughs).
    Unscheduled { slot_free_at: Option<u64> },
    /// Claimed a move-queue slot; `min_clock` is the earliest clock the
    /// bytes may be handed to the wire.
    Scheduled { min_clock: u64 },
}

/// An encoded command awaiting synchronisation and transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Opaque encoded command words.
    pub payload: Bytes,
    /// Clock at which the MCU is meant to act on the command.
    pub req_clock: u64,
    pub clock: MessageClock,
}

impl QueueMessage {
    /// Whether transmitting this command consumes an MCU move-queue slot.
    pub fn uses_move_slot(&self) -> bool {
        matches!(
            self.clock,
            MessageClock::Unscheduled {
                slot_free_at: Some(_)
            }
        )
    }
}

/// Per-stepper ordered list of encoded outbound messages.
pub type MessageQueue = VecDeque<QueueMessage>;
