//! Least-squares step schedule compression.
//!
//! The MCU accepts step commands of the form `(interval, count, add)`:
//! `count` pulses fire, each one scheduling the next via
//! `next_wake = last_wake + interval; interval += add`. This module fits
//! such arithmetic-progression commands to a queue of requested step
//! clocks, maximising the number of steps covered per command while
//! keeping every pulse inside its tolerance window.
//!
//! The search works on a [`QueueSnapshot`] — a by-value view of the
//! pending queue and the scheduling state, so candidate moves can be
//! applied speculatively without touching the owning stepper.

use crate::error::Error;
use tracing::error;

/// An emitted MCU step command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepMove {
    pub interval: u32,
    pub count: u16,
    pub add: i16,
}

/// A candidate schedule expressed as just `add` and `count`; the interval
/// is implied by the snapshot's `last_interval`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AddMove {
    pub(crate) add: i32,
    pub(crate) count: i32,
}

/// Extend a truncated 32-bit clock back to 64 bits near `base`.
pub(crate) fn extend_clock(base: u64, clock32: u32) -> u64 {
    base.wrapping_add(clock32.wrapping_sub(base as u32) as u64)
}

// Division helpers rounding toward +/- infinity; the default Rust `/`
// rounds toward zero, which is wrong for negative numerators here.
fn idiv_up(n: i32, d: i32) -> i32 {
    if n >= 0 {
        (n + d - 1) / d
    } else {
        n / d
    }
}

fn idiv_down(n: i32, d: i32) -> i32 {
    if n >= 0 {
        n / d
    } else {
        (n - d + 1) / d
    }
}

fn div_round_up(n: i32, d: i32) -> i32 {
    (n + d - 1) / d
}

/// Allowed scheduling window for one step, relative to `last_step_clock`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Window {
    pub(crate) min: i32,
    pub(crate) max: i32,
}

/// By-value view of a stepper's pending queue and scheduling state.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QueueSnapshot<'q> {
    steps: &'q [u32],
    max_error: u32,
    last_step_clock: u64,
    last_ideal_step_clock: u64,
    last_interval: u32,
}

impl<'q> QueueSnapshot<'q> {
    pub(crate) fn new(
        steps: &'q [u32],
        max_count: usize,
        max_error: u32,
        last_step_clock: u64,
        last_ideal_step_clock: u64,
        last_interval: u32,
    ) -> Self {
        let bound = steps.len().min(max_count);
        Self {
            steps: &steps[..bound],
            max_error,
            last_step_clock,
            last_ideal_step_clock,
            last_interval,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.steps.len()
    }

    /// Window for the queued step at `idx`. A step may fire early by up to
    /// `max_error` ticks, capped at half the gap to its predecessor so a
    /// shifted step cannot collide with the one before it. Late is never
    /// allowed.
    pub(crate) fn window(&self, idx: usize) -> Window {
        let lsc = self.last_step_clock as u32;
        let point = self.steps[idx].wrapping_sub(lsc);
        let prev = if idx > 0 {
            self.steps[idx - 1].wrapping_sub(lsc)
        } else {
            0
        };
        let mut max_error = point.wrapping_sub(prev) / 2;
        if max_error > self.max_error {
            max_error = self.max_error;
        }
        Window {
            min: point.wrapping_sub(max_error) as i32,
            max: point as i32,
        }
    }

    /// Ticks between the requested step at `idx` and its predecessor's
    /// ideal (pre-rounding) time.
    fn ideal_interval(&self, idx: usize) -> i32 {
        if idx > 0 {
            self.steps[idx].wrapping_sub(self.steps[idx - 1]) as i32
        } else {
            self.steps[0].wrapping_sub(self.last_ideal_step_clock as u32) as i32
        }
    }

    /// Snapshot state after speculatively scheduling `am`.
    fn after_move(&self, am: AddMove) -> QueueSnapshot<'q> {
        let mut next = *self;
        if am.count <= 0 {
            return next;
        }
        let count = am.count as usize;
        let addfactor = am.count * (am.count + 1) / 2;
        next.last_ideal_step_clock = extend_clock(self.last_step_clock, self.steps[count - 1]);
        next.steps = &self.steps[count..];
        let ticks = self
            .last_interval
            .wrapping_mul(am.count as u32)
            .wrapping_add(addfactor.wrapping_mul(am.add) as u32);
        next.last_step_clock = self.last_step_clock.wrapping_add(ticks as u64);
        next.last_interval = self
            .last_interval
            .wrapping_add(am.count.wrapping_mul(am.add) as u32);
        next
    }

    /// Relative clock of the last step of an `(add1, count1)` then
    /// `(add2, count2 = totalcount - count1)` schedule.
    fn ramp_end(&self, add1: i32, add2: i32, count1: i32, totalcount: i32) -> i32 {
        let ad = add1.wrapping_sub(add2);
        let addfactor = totalcount * (totalcount + 1) / 2;
        let paddfactor = count1 * (count1 - 1) / 2;
        (self.last_interval as i32)
            .wrapping_mul(totalcount)
            .wrapping_add(add2.wrapping_mul(addfactor))
            .wrapping_add(ad.wrapping_mul(count1.wrapping_mul(totalcount).wrapping_sub(paddfactor)))
    }
}

/// Running bounds on the `add` values able to schedule a queue prefix.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AddRange {
    pub(crate) minadd: i32,
    pub(crate) maxadd: i32,
    pub(crate) count: i32,
}

impl AddRange {
    fn new() -> Self {
        Self {
            minadd: -0x8000,
            maxadd: 0x7fff,
            count: 0,
        }
    }

    /// Try to extend the prefix by one step; returns false (leaving the
    /// range untouched) when the feasible interval would become empty.
    fn update(&mut self, qs: &QueueSnapshot) -> bool {
        if self.count as usize >= qs.len() {
            return false;
        }
        let next = qs.window(self.count as usize);

        let nextcount = self.count + 1;
        let nextaddfactor = nextcount * (nextcount + 1) / 2;
        let interval = qs.last_interval as i32;
        let mut nextminadd = self.minadd;
        let mut nextmaxadd = self.maxadd;
        if interval
            .wrapping_mul(nextcount)
            .wrapping_add(self.minadd.wrapping_mul(nextaddfactor))
            < next.min
        {
            nextminadd = idiv_up(
                next.min.wrapping_sub(interval.wrapping_mul(nextcount)),
                nextaddfactor,
            );
        }
        if interval
            .wrapping_mul(nextcount)
            .wrapping_add(self.maxadd.wrapping_mul(nextaddfactor))
            > next.max
        {
            nextmaxadd = idiv_down(
                next.max.wrapping_sub(interval.wrapping_mul(nextcount)),
                nextaddfactor,
            );
        }
        if nextminadd > nextmaxadd {
            return false;
        }
        self.minadd = nextminadd;
        self.maxadd = nextmaxadd;
        self.count = nextcount;
        true
    }

    /// Longest feasible prefix from the snapshot's current state.
    pub(crate) fn scan(qs: &QueueSnapshot) -> AddRange {
        let mut ar = AddRange::new();
        while ar.update(qs) {}
        ar
    }
}

// The least-squares search fits the next `totalcount` steps with a first
// segment `(add1, count1)` and an implicit second segment covering the
// remainder, solving per candidate count1:
//   add1*ac1_k + add2*ac2_k = adjusted_ideal_interval_k    for each step k
// The sums involved are updated incrementally as count1 grows, so the
// whole scan is O(c_max).

/// Best `(add1, count1)` over all candidate split points, by relative
/// squared error.
fn least_squares_fit(qs: &QueueSnapshot, totalcount: i32) -> AddMove {
    let mut var_ac1 = 0.0f64;
    let mut var_ac2 = 0.0f64;
    let mut cov_ac1_ac2 = 0.0f64;
    let mut cov_ac1_aii = 0.0f64;
    let mut cov_ac2_aii = 0.0f64;
    let mut sum_aii = 0.0f64;
    for step in 1..=totalcount {
        let want_interval = qs.ideal_interval(step as usize - 1);
        let aii = want_interval.wrapping_sub(qs.last_interval as i32);
        let dac2 = step as f64;
        let daii = aii as f64;
        cov_ac2_aii += dac2 * daii;
        var_ac2 += dac2 * dac2;
        sum_aii += daii;
    }
    let mut condsum_aii = sum_aii;

    let mut ar = AddRange::new();
    let mut best_e2 = f64::MAX;
    let mut best = AddMove { add: 0, count: 0 };
    loop {
        if !ar.update(qs) {
            // count1 cannot grow any further
            return best;
        }
        let count1 = ar.count;

        // Shift this step's contribution from the second segment's sums to
        // the first segment's.
        let want_interval = qs.ideal_interval(count1 as usize - 1);
        let aii = want_interval.wrapping_sub(qs.last_interval as i32);
        cov_ac2_aii -= condsum_aii;
        cov_ac1_aii += condsum_aii;
        condsum_aii -= aii as f64;
        let pc2 = totalcount - count1 + 1;
        let paf = pc2 * (pc2 + 1) / 2;
        let va_diff = pc2 * pc2;
        let caa_diff = paf - count1 * pc2;
        cov_ac1_ac2 += caa_diff as f64;
        var_ac2 -= va_diff as f64;
        var_ac1 += (va_diff - 2 * caa_diff) as f64;

        // Solve the 2x2 system for add1 and constrain to the valid range
        let mut dadd2 = 0.0f64;
        if count1 < totalcount {
            let determinant = var_ac1 * var_ac2 - cov_ac1_ac2 * cov_ac1_ac2;
            let v = var_ac1 * cov_ac2_aii - cov_ac1_ac2 * cov_ac1_aii;
            dadd2 = (v / determinant).round();
        }
        let dadd1 = ((cov_ac1_aii - dadd2 * cov_ac1_ac2) / var_ac1).round();
        let add1 = (dadd1 as i32).clamp(ar.minadd, ar.maxadd);
        let dadd1 = add1 as f64;

        // Recalculate add2 and nudge it until the last step lands in its
        // window; skip the candidate if no integer add2 suffices.
        if count1 < totalcount {
            dadd2 = ((cov_ac2_aii - dadd1 * cov_ac1_ac2) / var_ac2).round();
        }
        let mut add2 = dadd2 as i32;
        let lastr = qs.window(totalcount as usize - 1);
        let lastp = qs.ramp_end(add1, add2, count1, totalcount);
        let count2 = totalcount - count1;
        let af = count2 * (count2 + 1) / 2;
        if lastp < lastr.min {
            if lastp.wrapping_add(af) > lastr.max {
                continue;
            }
            add2 += div_round_up(lastr.min - lastp, af);
        } else if lastp > lastr.max {
            if lastp.wrapping_sub(af) < lastr.min {
                continue;
            }
            add2 -= div_round_up(lastp - lastr.max, af);
        }
        let dadd2 = add2 as f64;

        // Relative squared error (add the aii variance for absolute error)
        let rel_error2 = dadd1 * dadd1 * var_ac1 + dadd2 * dadd2 * var_ac2
            + 2.0 * dadd1 * dadd2 * cov_ac1_ac2
            - 2.0 * dadd1 * cov_ac1_aii
            - 2.0 * dadd2 * cov_ac2_aii;
        if rel_error2 <= best_e2 {
            best = AddMove {
                add: add1,
                count: count1,
            };
            best_e2 = rel_error2;
        }
    }
}

/// Find the first-segment schedule that maximises the total reach of a
/// follow-up segment.
fn compress_prefix(qs: &QueueSnapshot) -> AddMove {
    let outer = AddRange::scan(qs);
    if outer.count == 0 {
        // The first step cannot be reached by any in-range add; emit it
        // alone, biased into the middle of its error window.
        let interval = qs.steps[0].wrapping_sub(qs.last_step_clock as u32);
        let st = interval
            .wrapping_sub(qs.last_interval)
            .wrapping_sub(qs.max_error / 2);
        return AddMove {
            add: st as i32,
            count: 1,
        };
    }

    // Repeatedly run the fit, growing totalcount to whatever the candidate
    // schedule can reach, until the reach stops improving.
    let outer_add1 = (outer.minadd + outer.maxadd) / 2;
    let mut prev = AddMove {
        add: outer_add1,
        count: outer.count,
    };
    let mut next = prev;
    let mut prev_totalcount = 0;
    loop {
        let qs2 = qs.after_move(next);
        let ar = AddRange::scan(&qs2);
        let totalcount = next.count + ar.count;
        if prev_totalcount >= totalcount {
            return prev;
        }
        prev = next;
        prev_totalcount = totalcount;
        next = least_squares_fit(qs, totalcount);
    }
}

/// Maximum number of queued steps considered by one compression pass.
pub(crate) const SNAPSHOT_COMPRESS: usize = 46000;
/// Steps re-simulated when verifying an emitted move.
pub(crate) const SNAPSHOT_VERIFY: usize = 65535;

/// Produce the next MCU step command for the snapshot's queue prefix.
pub(crate) fn next_step_move(qs: &QueueSnapshot) -> StepMove {
    let am1 = compress_prefix(qs);
    if am1.count == 1 && qs.len() > 1 {
        // A lone leading step often precedes a long ramp; see if the ramp
        // after it fits so both can ship in one command.
        let qs2 = qs.after_move(am1);
        let am2 = compress_prefix(&qs2);
        if (-0x8000..=0x7fff).contains(&am2.add) {
            return StepMove {
                interval: qs.last_interval.wrapping_add_signed(am1.add),
                count: am2.count as u16 + 1,
                add: am2.add as i16,
            };
        }
    }

    StepMove {
        interval: qs.last_interval.wrapping_add_signed(am1.add),
        count: am1.count as u16,
        add: if am1.count > 1 { am1.add as i16 } else { 0 },
    }
}

/// Re-simulate an emitted move against the point windows. Any failure is a
/// compressor bug and is fatal.
pub(crate) fn verify_step_move(qs: &QueueSnapshot, mv: StepMove, oid: u32) -> Result<(), Error> {
    let fail = |e: Error| {
        error!("{e}");
        Err(e)
    };
    if mv.count == 0
        || (mv.interval == 0 && mv.add == 0 && mv.count > 1)
        || mv.interval >= 0x8000_0000
        || mv.count as usize > qs.len()
    {
        return fail(Error::InvalidSequence {
            oid,
            interval: mv.interval,
            count: mv.count,
            add: mv.add,
        });
    }
    let mut interval = mv.interval;
    let mut p = 0u32;
    for i in 0..mv.count {
        let w = qs.window(i as usize);
        p = p.wrapping_add(interval);
        if p < w.min as u32 || p > w.max as u32 {
            return fail(Error::PointOutOfWindow {
                oid,
                interval: mv.interval,
                count: mv.count,
                add: mv.add,
                index: i as u32 + 1,
                clock: p,
                min: w.min,
                max: w.max,
            });
        }
        if interval >= 0x8000_0000 {
            return fail(Error::IntervalOverflow {
                oid,
                interval: mv.interval,
                count: mv.count,
                add: mv.add,
                index: i as u32 + 1,
                value: interval,
            });
        }
        interval = interval.wrapping_add_signed(mv.add as i32);
    }
    Ok(())
}
