//! Full-loop simulation: plan step times, compress, synchronise, execute
//! on the simulated MCU, and check every pulse against its request.

use sim::{FakeMcu, RecordingTransport};
use std::cell::RefCell;
use std::rc::Rc;
use steppulse::{StepCompress, StepperSync};

const QS_TAG: i32 = 7;
const DIR_TAG: i32 = 8;
const MCU_FREQ: f64 = 1_000_000.0;
const MAX_ERROR: u32 = 25;

fn stepper(oid: u32) -> Rc<RefCell<StepCompress>> {
    let mut sc = StepCompress::new(oid);
    sc.fill(MAX_ERROR, QS_TAG, DIR_TAG);
    sc.set_time(0.0, MCU_FREQ);
    Rc::new(RefCell::new(sc))
}

fn at(clock: u64) -> f64 {
    clock as f64 / MCU_FREQ
}

/// Trapezoidal velocity profile as integer step clocks.
fn trapezoid() -> Vec<u64> {
    let mut requested = Vec::new();
    let mut clock = 0u64;
    let mut velocity = 500.0f64;
    for phase in 0..3 {
        for _ in 0..150 {
            clock += (MCU_FREQ / velocity) as u64;
            requested.push(clock);
            match phase {
                0 if velocity < 2000.0 => velocity += 10.0,
                2 if velocity > 500.0 => velocity -= 10.0,
                _ => {}
            }
        }
    }
    requested
}

#[test]
fn trapezoid_roundtrip_within_tolerance() {
    let sc = stepper(0);
    let requested = trapezoid();
    for &clk in &requested {
        sc.borrow_mut().append(true, 0.0, at(clk)).unwrap();
    }

    let transport = RecordingTransport::new();
    let mut sync = StepperSync::new(transport.clone(), vec![sc.clone()], 64);
    sync.flush(u64::MAX).unwrap();

    let mut mcu = FakeMcu::new(QS_TAG, DIR_TAG);
    for entry in transport.entries() {
        mcu.execute(&entry.payload).unwrap();
    }

    let pulses = mcu.pulses();
    assert_eq!(pulses.len(), requested.len());
    for (req, pulse) in requested.iter().zip(pulses) {
        assert!(
            pulse.clock <= *req && req - pulse.clock <= MAX_ERROR as u64,
            "pulse at {} outside window for requested {req}",
            pulse.clock
        );
    }
    assert_eq!(mcu.position(0), requested.len() as i64);
    // Meaningful compression actually happened
    assert!(transport.entries().len() < requested.len() / 4);
}

#[test]
fn direction_reversal_returns_to_start() {
    let sc = stepper(3);
    // 10 steps out, 10 steps back, 1 ms apart
    for i in 1..=10u64 {
        sc.borrow_mut().append(true, 0.0, at(i * 1000)).unwrap();
    }
    for i in 11..=20u64 {
        sc.borrow_mut().append(false, 0.0, at(i * 1000)).unwrap();
    }

    let transport = RecordingTransport::new();
    let mut sync = StepperSync::new(transport.clone(), vec![sc.clone()], 16);
    sync.flush(u64::MAX).unwrap();

    let mut mcu = FakeMcu::new(QS_TAG, DIR_TAG);
    for entry in transport.entries() {
        mcu.execute(&entry.payload).unwrap();
    }

    assert_eq!(mcu.pulses().len(), 20);
    let peak = mcu.pulses().iter().map(|p| p.position).max().unwrap();
    assert_eq!(peak, 10);
    assert_eq!(mcu.position(3), 0);
    // The host-side history agrees with the executed outcome
    assert_eq!(sc.borrow().find_past_position(u64::MAX), 0);
}

#[test]
fn two_steppers_share_the_wire_in_clock_order() {
    let a = stepper(0);
    let b = stepper(1);
    for i in 1..=30u64 {
        a.borrow_mut().append(true, 0.0, at(i * 700)).unwrap();
        b.borrow_mut().append(true, 0.0, at(i * 1100)).unwrap();
    }

    let transport = RecordingTransport::new();
    let mut sync = StepperSync::new(transport.clone(), vec![a.clone(), b.clone()], 8);
    sync.flush(u64::MAX).unwrap();

    let entries = transport.entries();
    assert!(!entries.is_empty());
    for pair in entries.windows(2) {
        assert!(pair[0].req_clock <= pair[1].req_clock);
    }

    let mut mcu = FakeMcu::new(QS_TAG, DIR_TAG);
    for entry in &entries {
        mcu.execute(&entry.payload).unwrap();
    }
    assert_eq!(mcu.position(0), 30);
    assert_eq!(mcu.position(1), 30);
}
