//! Compress a synthetic trapezoidal move and report what would go over
//! the wire, optionally dumping the full message trace as JSON.
//!
//! ```text
//! cargo run -p sim --example compress_trace -- --steps 5000 --trace out.json
//! ```

use anyhow::Result;
use clap::Parser;
use sim::{FakeMcu, RecordingTransport};
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use steppulse::{StepCompress, StepperSync};
use tracing::info;

const QS_TAG: i32 = 11;
const DIR_TAG: i32 = 12;

/// Arguments for the compression demo.
#[derive(Parser, Debug)]
#[command(about = "Compress a synthetic trapezoidal move and print statistics")]
struct Args {
    /// MCU clock frequency in Hz.
    #[arg(long, default_value_t = 16_000_000.0)]
    mcu_freq: f64,

    /// Per-step tolerance in clock ticks.
    #[arg(long, default_value_t = 25)]
    max_error: u32,

    /// Number of steps in the move.
    #[arg(long, default_value_t = 2000)]
    steps: usize,

    /// Cruise velocity in steps per second.
    #[arg(long, default_value_t = 10_000.0)]
    velocity: f64,

    /// Acceleration in steps per second^2.
    #[arg(long, default_value_t = 20_000.0)]
    accel: f64,

    /// Optional path for a JSON dump of the message trace.
    #[arg(long)]
    trace: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut sc = StepCompress::new(0);
    sc.fill(args.max_error, QS_TAG, DIR_TAG);
    sc.set_time(0.0, args.mcu_freq);
    let sc = Rc::new(RefCell::new(sc));

    // Accelerate to the cruise velocity, cruise, decelerate symmetrically.
    let accel_steps = (args.steps / 4).max(1);
    let mut time = 0.0f64;
    let mut velocity = args.velocity / 10.0;
    for i in 0..args.steps {
        time += 1.0 / velocity;
        if i < accel_steps && velocity < args.velocity {
            velocity += args.accel / velocity;
        } else if i >= args.steps - accel_steps {
            velocity = (velocity - args.accel / velocity).max(args.velocity / 10.0);
        }
        sc.borrow_mut().append(true, 0.0, time)?;
    }

    let transport = RecordingTransport::new();
    let mut sync = StepperSync::new(transport.clone(), vec![sc.clone()], 64);
    sync.flush(u64::MAX)?;

    let entries = transport.entries();
    let payload_bytes: usize = entries.iter().map(|e| e.payload.len()).sum();
    info!(
        commands = entries.len(),
        batches = transport.batch_count(),
        "synchroniser flush complete"
    );

    // Execute the trace on the simulated MCU to confirm the schedule
    let mut mcu = FakeMcu::new(QS_TAG, DIR_TAG);
    for entry in &entries {
        mcu.execute(&entry.payload)?;
    }

    println!("steps requested:   {}", args.steps);
    println!("commands emitted:  {}", entries.len());
    println!("payload bytes:     {payload_bytes}");
    println!(
        "compression ratio: {:.1} steps/command",
        args.steps as f64 / entries.len().max(1) as f64
    );
    println!("pulses executed:   {}", mcu.pulses().len());
    println!("final position:    {}", mcu.position(0));

    if let Some(path) = &args.trace {
        transport.dump_trace(path)?;
        println!("trace written to:  {}", path.display());
    }
    Ok(())
}
