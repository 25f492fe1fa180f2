//! # Step Pulse Schedule Compression
//!
//! Takes a series of scheduled stepper pulse times and compresses them
//! into a handful of commands that can be efficiently transmitted to and
//! executed on a microcontroller. The MCU step command takes `interval`,
//! `count`, and `add` parameters such that `count` pulses occur, with each
//! pulse calculating the next pulse time using:
//!
//! ```text
//! next_wake_time = last_wake_time + interval; interval += add
//! ```
//!
//! ## Key Components
//!
//! - **[`StepCompress`]**: per-stepper front end — append requested step
//!   times, flush compressed commands.
//! - **[`StepperSync`]**: merges the command streams of several steppers
//!   in clock order while modelling the MCU's fixed-depth move queue.
//! - **[`Transport`]**: the seam to whatever owns the wire; batches of
//!   scheduled [`QueueMessage`]s are handed over whole.
//!
//! The compression core is single-threaded and synchronous; every handle
//! owns its buffers and nothing here blocks.

pub mod compress;
pub mod error;
pub mod history;
pub mod msg;
mod queue;
pub mod stepcompress;
pub mod sync;

pub use compress::StepMove;
pub use error::{Error, Result};
pub use history::HistoryEntry;
pub use msg::{MessageClock, MessageQueue, QueueMessage};
pub use stepcompress::{StepCompress, CLOCK_DIFF_MAX, HISTORY_EXPIRE, SDS_FILTER_TIME};
pub use sync::{StepperSync, Transport};
