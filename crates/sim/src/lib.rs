//! # In-Process Simulation Harness
//!
//! A deterministic simulation environment for the step compression core,
//! designed for CI validation without physical hardware.
//!
//! The two primary components are [`FakeMcu`] and [`RecordingTransport`].
//! `FakeMcu` executes compressed step commands exactly the way the real
//! firmware schedules pulses, while `RecordingTransport` plugs into the
//! core's `Transport` seam and captures every transmitted batch as a
//! serialisable trace.

pub mod fake_mcu;
pub mod harness;

pub use fake_mcu::{FakeMcu, PulseEvent};
pub use harness::{RecordingTransport, TraceEntry};
