//! Time-ordered log of emitted step commands for past-position queries.

/// One emitted command, as needed to reconstruct the stepper position at
/// any clock it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Clock of the command's first pulse.
    pub first_clock: u64,
    /// Clock of the command's last pulse.
    pub last_clock: u64,
    /// Stepper position just before the command ran.
    pub start_position: i64,
    /// Pulses in the command, negative when stepping backwards.
    pub step_count: i32,
    pub interval: i32,
    pub add: i32,
}

/// Newest-first log of [`HistoryEntry`] values.
#[derive(Debug, Default)]
pub(crate) struct HistoryLog {
    entries: std::collections::VecDeque<HistoryEntry>,
}

impl HistoryLog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&mut self, entry: HistoryEntry) {
        self.entries.push_front(entry);
    }

    /// Drop entries whose last pulse is at or before `end_clock`.
    pub(crate) fn expire(&mut self, end_clock: u64) {
        while let Some(oldest) = self.entries.back() {
            if oldest.last_clock > end_clock {
                break;
            }
            self.entries.pop_back();
        }
    }

    /// Position of the stepper at `clock`. `current_position` is returned
    /// when `clock` predates everything in the log.
    pub(crate) fn find_past_position(&self, current_position: i64, clock: u64) -> i64 {
        let mut last_position = current_position;
        for hs in &self.entries {
            if clock < hs.first_clock {
                last_position = hs.start_position;
                continue;
            }
            if clock >= hs.last_clock {
                return hs.start_position + hs.step_count as i64;
            }
            // Mid-command: solve for the number of pulses fired by `clock`
            let interval = hs.interval;
            let add = hs.add;
            let ticks = (clock.wrapping_sub(hs.first_clock) as i32).wrapping_add(interval);
            let offset = if add == 0 {
                ticks / interval
            } else {
                // Quadratic formula on the ramp's cumulative tick count
                let a = 0.5 * add as f64;
                let b = interval as f64 - 0.5 * add as f64;
                let c = -(ticks as f64);
                (((b * b - 4.0 * a * c).sqrt() - b) / (2.0 * a)) as i32
            };
            if hs.step_count < 0 {
                return hs.start_position - offset as i64;
            }
            return hs.start_position + offset as i64;
        }
        last_position
    }

    /// Entries overlapping `[start_clock, end_clock)`, newest first, at
    /// most `max` of them.
    pub(crate) fn extract_old(
        &self,
        max: usize,
        start_clock: u64,
        end_clock: u64,
    ) -> Vec<HistoryEntry> {
        let mut out = Vec::new();
        for hs in &self.entries {
            if start_clock >= hs.last_clock || out.len() >= max {
                break;
            }
            if end_clock <= hs.first_clock {
                continue;
            }
            out.push(*hs);
        }
        out
    }
}
