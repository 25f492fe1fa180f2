//! Per-stepper orchestration: queueing requested step times, driving the
//! compressor, and generating ordered MCU commands.

use crate::compress::{
    self, extend_clock, QueueSnapshot, StepMove, SNAPSHOT_COMPRESS, SNAPSHOT_VERIFY,
};
use crate::error::Result;
use crate::history::{HistoryEntry, HistoryLog};
use crate::msg::{MessageClock, MessageQueue, QueueMessage};
use crate::queue::{StepQueue, QUEUE_FLUSH_THRESHOLD};
use steppulse_proto::encode_words;
use tracing::debug;

/// Maximum clock delta covered by one command; steps further out are
/// emitted as singletons scheduled near their fire time.
pub const CLOCK_DIFF_MAX: u64 = 3 << 28;

/// A step reversed again within this many seconds is treated as chatter
/// and dropped together with its partner.
pub const SDS_FILTER_TIME: f64 = 0.000_750;

/// Seconds of emitted-command history kept for past-position queries.
pub const HISTORY_EXPIRE: f64 = 30.0;

/// Schedule compressor for a single stepper.
///
/// Requested absolute step times arrive via [`append`](Self::append);
/// compressed `(interval, count, add)` commands accumulate in the message
/// queue until a synchroniser drains them.
pub struct StepCompress {
    // Buffer management
    step_queue: StepQueue,
    // Internal tracking
    max_error: u32,
    mcu_time_offset: f64,
    mcu_freq: f64,
    last_step_print_time: f64,
    last_interval: u32,
    last_ideal_step_clock: u64,
    // Message generation
    last_step_clock: u64,
    msg_queue: MessageQueue,
    oid: u32,
    queue_step_msgtag: i32,
    set_next_step_dir_msgtag: i32,
    /// Direction currently configured on the MCU; `None` until known.
    sdir: Option<bool>,
    invert_sdir: bool,
    // Step+dir+step filter
    next_step_clock: u64,
    next_step_dir: bool,
    // History tracking
    last_position: i64,
    history: HistoryLog,
}

impl StepCompress {
    pub fn new(oid: u32) -> Self {
        Self {
            step_queue: StepQueue::new(),
            max_error: 0,
            mcu_time_offset: 0.0,
            mcu_freq: 0.0,
            last_step_print_time: 0.0,
            last_interval: 0,
            last_ideal_step_clock: 0,
            last_step_clock: 0,
            msg_queue: MessageQueue::new(),
            oid,
            queue_step_msgtag: 0,
            set_next_step_dir_msgtag: 0,
            sdir: None,
            invert_sdir: false,
            next_step_clock: 0,
            next_step_dir: false,
            last_position: 0,
            history: HistoryLog::new(),
        }
    }

    /// Fill in the per-step tolerance and the command tags negotiated with
    /// the MCU.
    pub fn fill(&mut self, max_error: u32, queue_step_msgtag: i32, set_next_step_dir_msgtag: i32) {
        self.max_error = max_error;
        self.queue_step_msgtag = queue_step_msgtag;
        self.set_next_step_dir_msgtag = set_next_step_dir_msgtag;
    }

    /// Set the inverted direction-pin flag. Flipping it while a direction
    /// is configured flips the effective direction immediately.
    pub fn set_invert_sdir(&mut self, invert_sdir: bool) {
        if invert_sdir != self.invert_sdir {
            self.invert_sdir = invert_sdir;
            if let Some(dir) = self.sdir {
                self.sdir = Some(!dir);
            }
        }
    }

    /// Set the conversion rate of print time to MCU clock.
    pub fn set_time(&mut self, time_offset: f64, mcu_freq: f64) {
        self.mcu_time_offset = time_offset;
        self.mcu_freq = mcu_freq;
        self.calc_last_step_print_time();
    }

    pub fn oid(&self) -> u32 {
        self.oid
    }

    /// Direction of the most recently appended step.
    pub fn step_dir(&self) -> bool {
        self.next_step_dir
    }

    /// Messages awaiting synchronisation, oldest first.
    pub fn message_queue(&self) -> &MessageQueue {
        &self.msg_queue
    }

    pub(crate) fn pop_message(&mut self) -> Option<QueueMessage> {
        self.msg_queue.pop_front()
    }

    /// Determine the print time of `last_step_clock`. The half-tick bias
    /// keeps repeated appends from accumulating rounding drift.
    fn calc_last_step_print_time(&mut self) {
        let lsc = self.last_step_clock as f64;
        self.last_step_print_time = self.mcu_time_offset + (lsc - 0.5) / self.mcu_freq;

        if lsc > self.mcu_freq * HISTORY_EXPIRE {
            self.history
                .expire((lsc - self.mcu_freq * HISTORY_EXPIRE) as u64);
        }
    }

    fn snapshot(&self, max_count: usize) -> QueueSnapshot<'_> {
        QueueSnapshot::new(
            self.step_queue.pending(),
            max_count,
            self.max_error,
            self.last_step_clock,
            self.last_ideal_step_clock,
            self.last_interval,
        )
    }

    /// Record a `queue_step` command for `mv`, whose first pulse fires at
    /// `first_clock`.
    fn add_move(&mut self, first_clock: u64, mv: StepMove) {
        let count = mv.count as i32;
        let addfactor = count * (count - 1) / 2;
        let ticks = ((mv.add as i32).wrapping_mul(addfactor) as u32)
            .wrapping_add(mv.interval.wrapping_mul(count as u32 - 1));
        let last_clock = first_clock.wrapping_add(ticks as u64);
        self.last_interval = mv
            .interval
            .wrapping_add((mv.add as i32).wrapping_mul(count - 1) as u32);

        // Create and queue the encoded command. The slot-free clock is the
        // moment the MCU starts executing this command: everything before
        // it is already scheduled.
        let words = [
            self.queue_step_msgtag as u32,
            self.oid,
            mv.interval,
            mv.count as u32,
            mv.add as i32 as u32,
        ];
        let mut req_clock = self.last_step_clock;
        if mv.count == 1 && first_clock >= self.last_step_clock + CLOCK_DIFF_MAX {
            // Lone far-future step: schedule transmission near its fire time
            req_clock = first_clock;
        }
        let slot_free_at = (self.last_step_clock != 0).then_some(self.last_step_clock);
        self.msg_queue.push_back(QueueMessage {
            payload: encode_words(&words),
            req_clock,
            clock: MessageClock::Unscheduled { slot_free_at },
        });
        self.last_step_clock = last_clock;

        // Record the command for past-position queries
        let step_count = if self.sdir == Some(false) {
            -count
        } else {
            count
        };
        self.history.record(HistoryEntry {
            first_clock,
            last_clock,
            start_position: self.last_position,
            step_count,
            interval: mv.interval as i32,
            add: mv.add as i32,
        });
        self.last_position += step_count as i64;
    }

    /// Convert queued steps into commands until `last_step_clock` passes
    /// `move_clock` or the queue drains.
    fn queue_flush(&mut self, move_clock: u64) -> Result<()> {
        if self.step_queue.is_empty() {
            return Ok(());
        }
        while self.last_step_clock < move_clock {
            let mv = compress::next_step_move(&self.snapshot(SNAPSHOT_COMPRESS));
            compress::verify_step_move(&self.snapshot(SNAPSHOT_VERIFY), mv, self.oid)?;

            let covered = self.step_queue.pending()[mv.count as usize - 1];
            self.last_ideal_step_clock = extend_clock(self.last_step_clock, covered);
            let first_clock = self.last_step_clock.wrapping_add(mv.interval as u64);
            self.add_move(first_clock, mv);

            if mv.count as usize >= self.step_queue.len() {
                self.step_queue.clear();
                break;
            }
            self.step_queue.consume(mv.count as usize);
        }
        self.calc_last_step_print_time();
        Ok(())
    }

    /// Generate a command for a step far in the future from the last step.
    fn flush_far(&mut self, abs_step_clock: u64) -> Result<()> {
        let mv = StepMove {
            interval: abs_step_clock.wrapping_sub(self.last_step_clock) as u32,
            count: 1,
            add: 0,
        };
        self.last_ideal_step_clock = abs_step_clock;
        self.add_move(abs_step_clock, mv);
        self.calc_last_step_print_time();
        Ok(())
    }

    /// Emit the direction command, flushing everything scheduled so far.
    fn set_next_step_dir(&mut self, sdir: bool) -> Result<()> {
        if self.sdir == Some(sdir) {
            return Ok(());
        }
        self.queue_flush(u64::MAX)?;
        self.sdir = Some(sdir);
        let words = [
            self.set_next_step_dir_msgtag as u32,
            self.oid,
            (sdir ^ self.invert_sdir) as u32,
        ];
        self.msg_queue.push_back(QueueMessage {
            payload: encode_words(&words),
            req_clock: self.last_step_clock,
            clock: MessageClock::Unscheduled { slot_free_at: None },
        });
        Ok(())
    }

    /// Slow path for a pending step beyond `CLOCK_DIFF_MAX`.
    fn queue_append_far(&mut self) -> Result<()> {
        let step_clock = self.next_step_clock;
        self.next_step_clock = 0;
        self.queue_flush(step_clock - CLOCK_DIFF_MAX + 1)?;
        if step_clock >= self.last_step_clock + CLOCK_DIFF_MAX {
            return self.flush_far(step_clock);
        }
        self.step_queue.push_with_room(step_clock as u32);
        Ok(())
    }

    /// Slow path when the queue storage is exhausted.
    fn queue_append_extend(&mut self) -> Result<()> {
        if self.step_queue.len() > QUEUE_FLUSH_THRESHOLD {
            // The command format cannot address more than 64K steps; force
            // out everything older before growing the buffer again.
            let pending = self.step_queue.pending();
            let flush_rel =
                pending[pending.len() - 65535].wrapping_sub(self.last_step_clock as u32);
            self.queue_flush(self.last_step_clock.wrapping_add(flush_rel as u64))?;
        }
        self.step_queue.push_with_room(self.next_step_clock as u32);
        self.next_step_clock = 0;
        Ok(())
    }

    /// Move the pending step into the queue, handling direction changes,
    /// far-future steps, and storage growth.
    fn queue_append(&mut self) -> Result<()> {
        if Some(self.next_step_dir) != self.sdir {
            self.set_next_step_dir(self.next_step_dir)?;
        }
        if self.next_step_clock >= self.last_step_clock + CLOCK_DIFF_MAX {
            return self.queue_append_far();
        }
        if self.step_queue.at_capacity() {
            return self.queue_append_extend();
        }
        self.step_queue.push(self.next_step_clock as u32);
        self.next_step_clock = 0;
        Ok(())
    }

    /// Add the next requested step time.
    ///
    /// `step_time` is in seconds relative to `print_time`, which is in the
    /// host's print-time coordinates established by
    /// [`set_time`](Self::set_time).
    pub fn append(&mut self, sdir: bool, print_time: f64, step_time: f64) -> Result<()> {
        // Calculate step clock
        let offset = print_time - self.last_step_print_time;
        let rel_sc = (step_time + offset) * self.mcu_freq;
        let step_clock = self.last_step_clock.wrapping_add(rel_sc as u64);
        // Flush previous pending step (if any)
        if self.next_step_clock != 0 {
            if sdir != self.next_step_dir {
                let diff = step_clock.wrapping_sub(self.next_step_clock) as i64 as f64;
                if diff < SDS_FILTER_TIME * self.mcu_freq {
                    // Chatter: drop the pending step along with this one
                    self.next_step_clock = 0;
                    self.next_step_dir = sdir;
                    return Ok(());
                }
            }
            self.queue_append()?;
        }
        // Store this step as the next pending step
        self.next_step_clock = step_clock;
        self.next_step_dir = sdir;
        Ok(())
    }

    /// Commit the pending step (that is, do not allow a rollback).
    pub fn commit(&mut self) -> Result<()> {
        if self.next_step_clock != 0 {
            return self.queue_append();
        }
        Ok(())
    }

    /// Flush steps scheduled up to `move_clock` into MCU commands.
    pub fn flush(&mut self, move_clock: u64) -> Result<()> {
        if self.next_step_clock != 0 && move_clock >= self.next_step_clock {
            self.queue_append()?;
        }
        self.queue_flush(move_clock)
    }

    /// Flush everything, then restart scheduling from `last_step_clock`
    /// with direction and interval state cleared.
    pub fn reset(&mut self, last_step_clock: u64) -> Result<()> {
        self.flush(u64::MAX)?;
        self.last_step_clock = last_step_clock;
        self.last_interval = 0;
        self.sdir = None;
        self.calc_last_step_print_time();
        Ok(())
    }

    /// Flush, then declare the stepper position at `clock`.
    pub fn set_last_position(&mut self, clock: u64, last_position: i64) -> Result<()> {
        self.flush(u64::MAX)?;
        self.last_position = last_position;

        // Add a marker to the history list
        self.history.record(HistoryEntry {
            first_clock: clock,
            last_clock: clock,
            start_position: last_position,
            step_count: 0,
            interval: 0,
            add: 0,
        });
        Ok(())
    }

    /// Stepper position at a clock in the past.
    pub fn find_past_position(&self, clock: u64) -> i64 {
        self.history.find_past_position(self.last_position, clock)
    }

    /// Flush, then queue a caller-encoded command to go out in order with
    /// the stepper commands.
    pub fn queue_msg(&mut self, words: &[u32]) -> Result<()> {
        self.flush(u64::MAX)?;
        debug!(oid = self.oid, words = words.len(), "queueing raw command");
        self.msg_queue.push_back(QueueMessage {
            payload: encode_words(words),
            req_clock: self.last_step_clock,
            clock: MessageClock::Unscheduled { slot_free_at: None },
        });
        Ok(())
    }

    /// History of emitted commands overlapping `[start_clock, end_clock)`,
    /// newest first.
    pub fn extract_old(
        &self,
        max: usize,
        start_clock: u64,
        end_clock: u64,
    ) -> Vec<HistoryEntry> {
        self.history.extract_old(max, start_clock, end_clock)
    }
}
