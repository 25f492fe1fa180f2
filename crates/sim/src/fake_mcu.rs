//! Simulated MCU Behavior
//!
//! Implements the MCU side of the step command set: `queue_step` ramps and
//! `set_next_step_dir`, reproducing the firmware's pulse scheduling
//! recurrence `next_wake = last_wake + interval; interval += add` so host
//! tests can compare emitted pulses against requested times.

use anyhow::{bail, ensure, Result};
use std::collections::HashMap;
use steppulse_proto::decode_words;
use tracing::trace;

/// One pulse the simulated MCU fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseEvent {
    pub clock: u64,
    pub oid: u32,
    pub dir: bool,
    /// Stepper position after this pulse.
    pub position: i64,
}

#[derive(Debug, Default)]
struct StepperState {
    last_clock: u64,
    dir: bool,
    position: i64,
}

/// Executes compressed step command payloads for any number of steppers.
pub struct FakeMcu {
    queue_step_msgtag: u32,
    set_next_step_dir_msgtag: u32,
    steppers: HashMap<u32, StepperState>,
    pulses: Vec<PulseEvent>,
}

impl FakeMcu {
    /// The tags must match the ones the host side was filled with.
    pub fn new(queue_step_msgtag: i32, set_next_step_dir_msgtag: i32) -> Self {
        FakeMcu {
            queue_step_msgtag: queue_step_msgtag as u32,
            set_next_step_dir_msgtag: set_next_step_dir_msgtag as u32,
            steppers: HashMap::new(),
            pulses: Vec::new(),
        }
    }

    /// Decode and execute one command payload.
    pub fn execute(&mut self, payload: &[u8]) -> Result<()> {
        let words = decode_words(payload)?;
        match words.first() {
            Some(&tag) if tag == self.queue_step_msgtag => self.queue_step(&words),
            Some(&tag) if tag == self.set_next_step_dir_msgtag => self.set_next_step_dir(&words),
            Some(&tag) => bail!("unknown message tag {tag}"),
            None => bail!("empty command payload"),
        }
    }

    fn queue_step(&mut self, words: &[u32]) -> Result<()> {
        ensure!(
            words.len() == 5,
            "queue_step expects 5 words, got {}",
            words.len()
        );
        let oid = words[1];
        let mut interval = words[2];
        let count = words[3];
        let add = words[4] as i32;
        ensure!(count >= 1, "queue_step with zero count");
        trace!(oid, interval, count, add, "executing queue_step");

        let stepper = self.steppers.entry(oid).or_default();
        for _ in 0..count {
            stepper.last_clock = stepper.last_clock.wrapping_add(interval as u64);
            stepper.position += if stepper.dir { 1 } else { -1 };
            self.pulses.push(PulseEvent {
                clock: stepper.last_clock,
                oid,
                dir: stepper.dir,
                position: stepper.position,
            });
            interval = interval.wrapping_add_signed(add);
        }
        Ok(())
    }

    fn set_next_step_dir(&mut self, words: &[u32]) -> Result<()> {
        ensure!(
            words.len() == 3,
            "set_next_step_dir expects 3 words, got {}",
            words.len()
        );
        let oid = words[1];
        let dir = words[2] != 0;
        trace!(oid, dir, "executing set_next_step_dir");
        self.steppers.entry(oid).or_default().dir = dir;
        Ok(())
    }

    /// Every pulse fired so far, in execution order.
    pub fn pulses(&self) -> &[PulseEvent] {
        &self.pulses
    }

    pub fn position(&self, oid: u32) -> i64 {
        self.steppers.get(&oid).map_or(0, |s| s.position)
    }

    pub fn last_clock(&self, oid: u32) -> u64 {
        self.steppers.get(&oid).map_or(0, |s| s.last_clock)
    }
}
