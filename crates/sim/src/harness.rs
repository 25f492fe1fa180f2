//! Simulation Harness Utilities
//!
//! Provides a trace-recording [`Transport`] implementation so simulation
//! runs and CI tests can capture exactly what the synchroniser would put
//! on the wire, and dump it for analysis.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::rc::Rc;
use steppulse::{MessageClock, QueueMessage, Transport};
use tracing::info;

/// One transmitted message, flattened for serialisation.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TraceEntry {
    /// Index of the `send_batch` call that carried this message.
    pub batch: usize,
    /// Clock at which the MCU is meant to act on the command.
    pub req_clock: u64,
    /// Earliest clock the bytes may be transmitted.
    pub min_clock: u64,
    /// Encoded command words.
    pub payload: Vec<u8>,
}

/// A [`Transport`] that records every scheduled message.
///
/// Clones share the same trace, so a copy can be handed to the
/// synchroniser while the test keeps its own handle for inspection.
#[derive(Debug, Default, Clone)]
pub struct RecordingTransport {
    entries: Rc<RefCell<Vec<TraceEntry>>>,
    batches: Rc<Cell<usize>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded trace so far.
    pub fn entries(&self) -> Vec<TraceEntry> {
        self.entries.borrow().clone()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.get()
    }

    /// Dumps the recorded trace to a file as pretty-printed JSON.
    pub fn dump_trace(&self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "Dumping trace file");
        let mut file = File::create(path)?;
        let json = serde_json::to_string_pretty(&*self.entries.borrow())?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

impl Transport for RecordingTransport {
    fn send_batch(&mut self, batch: Vec<QueueMessage>) -> Result<()> {
        let batch_idx = self.batches.get();
        self.batches.set(batch_idx + 1);
        let mut entries = self.entries.borrow_mut();
        for msg in batch {
            let min_clock = match msg.clock {
                MessageClock::Scheduled { min_clock } => min_clock,
                // The synchroniser schedules everything it hands over
                MessageClock::Unscheduled { .. } => 0,
            };
            entries.push(TraceEntry {
                batch: batch_idx,
                req_clock: msg.req_clock,
                min_clock,
                payload: msg.payload.to_vec(),
            });
        }
        Ok(())
    }
}
