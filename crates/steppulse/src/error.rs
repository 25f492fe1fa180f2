//! Error types for the step compression core.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by compression, verification, and synchronisation.
///
/// Verification failures indicate a bug in the compressor itself; callers
/// are expected to abort the motion rather than retry.
#[derive(Debug, Error)]
pub enum Error {
    /// An emitted move had an impossible shape (zero count, a multi-step
    /// move with no interval and no add, or an interval at or above 2^31).
    #[error("stepcompress o={oid} i={interval} c={count} a={add}: invalid sequence")]
    InvalidSequence {
        oid: u32,
        interval: u32,
        count: u16,
        add: i16,
    },
    /// A simulated step of an emitted move landed outside its tolerance
    /// window. `index` is 1-based.
    #[error(
        "stepcompress o={oid} i={interval} c={count} a={add}: \
         point {index}: {clock} not in {min}:{max}"
    )]
    PointOutOfWindow {
        oid: u32,
        interval: u32,
        count: u16,
        add: i16,
        index: u32,
        clock: u32,
        min: i32,
        max: i32,
    },
    /// An intermediate interval of an emitted move reached 2^31.
    #[error(
        "stepcompress o={oid} i={interval} c={count} a={add}: \
         point {index}: interval overflow {value}"
    )]
    IntervalOverflow {
        oid: u32,
        interval: u32,
        count: u16,
        add: i16,
        index: u32,
        value: u32,
    },
    /// The transport rejected a batch; propagated unchanged.
    #[error("transport failure")]
    Transport(#[source] anyhow::Error),
}
