//! Interleaving of per-stepper command streams.
//!
//! The MCU can only queue a limited number of step commands. The
//! synchroniser tracks when slots in that queue free up so commands can be
//! transmitted as early as possible, and merges the per-stepper message
//! queues in clock order so no stepper starves the others of queue space.

use crate::error::{Error, Result};
use crate::msg::{MessageClock, QueueMessage};
use crate::stepcompress::StepCompress;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

/// Sink for batches of scheduled commands.
///
/// Ownership of every message transfers to the transport on call; a
/// returned error aborts the flush and is propagated unchanged.
pub trait Transport {
    fn send_batch(&mut self, batch: Vec<QueueMessage>) -> anyhow::Result<()>;
}

/// Merges the message queues of several steppers in clock order while
/// modelling the MCU's fixed-depth move queue.
pub struct StepperSync<T: Transport> {
    transport: T,
    steppers: Vec<Rc<RefCell<StepCompress>>>,
    /// Min-heap of the clocks at which each MCU move-queue slot frees.
    move_clocks: Vec<u64>,
}

impl<T: Transport> StepperSync<T> {
    /// `move_num` is the depth of the MCU command queue being modelled and
    /// must be at least 1.
    pub fn new(
        transport: T,
        steppers: Vec<Rc<RefCell<StepCompress>>>,
        move_num: usize,
    ) -> Self {
        Self {
            transport,
            steppers,
            move_clocks: vec![0; move_num],
        }
    }

    /// Set the conversion rate of print time to MCU clock on every
    /// stepper.
    pub fn set_time(&self, time_offset: f64, mcu_freq: f64) {
        for sc in &self.steppers {
            sc.borrow_mut().set_time(time_offset, mcu_freq);
        }
    }

    pub fn move_clocks(&self) -> &[u64] {
        &self.move_clocks
    }

    /// Replace the heap root with `req_clock` and restore the heap
    /// property by sifting down.
    fn heap_replace(&mut self, req_clock: u64) {
        let mc = &mut self.move_clocks;
        let nmc = mc.len();
        let mut pos = 0;
        loop {
            let child1_pos = 2 * pos + 1;
            let child2_pos = 2 * pos + 2;
            let child1_clock = if child1_pos < nmc { mc[child1_pos] } else { u64::MAX };
            let child2_clock = if child2_pos < nmc { mc[child2_pos] } else { u64::MAX };
            if req_clock <= child1_clock && req_clock <= child2_clock {
                mc[pos] = req_clock;
                break;
            }
            if child1_clock < child2_clock {
                mc[pos] = child1_clock;
                pos = child1_pos;
            } else {
                mc[pos] = child2_clock;
                pos = child2_pos;
            }
        }
    }

    /// Find and transmit any scheduled steps prior to `move_clock`.
    pub fn flush(&mut self, move_clock: u64) -> Result<()> {
        // Flush each stepper to the specified clock
        for sc in &self.steppers {
            sc.borrow_mut().flush(move_clock)?;
        }

        // Order commands by the req_clock of each pending command
        let mut batch: Vec<QueueMessage> = Vec::new();
        loop {
            // Next message: lowest req_clock, ties to the earliest stepper
            let mut choice: Option<(usize, u64, bool)> = None;
            for (idx, sc) in self.steppers.iter().enumerate() {
                let sc = sc.borrow();
                if let Some(msg) = sc.message_queue().front() {
                    let better = match choice {
                        Some((_, best, _)) => msg.req_clock < best,
                        None => true,
                    };
                    if better {
                        choice = Some((idx, msg.req_clock, msg.uses_move_slot()));
                    }
                }
            }
            let Some((idx, req_clock, uses_slot)) = choice else {
                break;
            };
            if uses_slot && req_clock > move_clock {
                // Slot-consuming commands must not run past the horizon
                break;
            }
            let Some(mut msg) = self.steppers[idx].borrow_mut().pop_message() else {
                break;
            };

            let next_avail = self.move_clocks[0];
            if let MessageClock::Unscheduled {
                slot_free_at: Some(free_at),
            } = msg.clock
            {
                // The command occupies the slot that frees up earliest;
                // record when this command's own slot becomes available.
                self.heap_replace(free_at);
            }
            // The clock field now takes its transmit-scheduling meaning
            msg.clock = MessageClock::Scheduled {
                min_clock: next_avail,
            };
            batch.push(msg);
        }

        // Transmit commands
        if !batch.is_empty() {
            debug!(count = batch.len(), move_clock, "sending command batch");
            self.transport.send_batch(batch).map_err(Error::Transport)?;
        }
        Ok(())
    }
}
