//! End-to-end scenarios for the compression core: known step patterns in,
//! verified command streams out.

use std::cell::RefCell;
use std::rc::Rc;
use steppulse::{QueueMessage, StepCompress, StepperSync, Transport, CLOCK_DIFF_MAX};
use steppulse_proto::decode_words;

const QS_TAG: u32 = 11;
const DIR_TAG: u32 = 12;
const MCU_FREQ: f64 = 1_000_000.0;
const MAX_ERROR: u32 = 25;

fn stepper(oid: u32) -> StepCompress {
    let mut sc = StepCompress::new(oid);
    sc.fill(MAX_ERROR, QS_TAG as i32, DIR_TAG as i32);
    sc.set_time(0.0, MCU_FREQ);
    sc
}

/// Print time at which the requested step clock is exactly `clock`.
fn at(clock: u64) -> f64 {
    clock as f64 / MCU_FREQ
}

#[derive(Debug, Clone, Copy)]
struct Step {
    oid: u32,
    interval: u32,
    count: u32,
    add: i32,
}

fn decode_steps(sc: &StepCompress) -> Vec<Step> {
    sc.message_queue()
        .iter()
        .filter_map(|m| {
            let w = decode_words(&m.payload).unwrap();
            (w[0] == QS_TAG).then(|| Step {
                oid: w[1],
                interval: w[2],
                count: w[3],
                add: w[4] as i32,
            })
        })
        .collect()
}

/// Reproduce the absolute pulse clocks the MCU would generate.
fn simulate(start_clock: u64, steps: &[Step]) -> Vec<u64> {
    let mut clock = start_clock;
    let mut pulses = Vec::new();
    for s in steps {
        let mut interval = s.interval;
        for _ in 0..s.count {
            clock += interval as u64;
            pulses.push(clock);
            interval = interval.wrapping_add_signed(s.add);
        }
    }
    pulses
}

fn assert_within_window(requested: &[u64], pulses: &[u64]) {
    assert_eq!(requested.len(), pulses.len(), "pulse count mismatch");
    for (req, got) in requested.iter().zip(pulses) {
        assert!(
            got <= req && req - got <= MAX_ERROR as u64,
            "pulse at {got} outside window for requested {req}"
        );
    }
}

// S1: a uniform ramp compresses into a single command.
#[test]
fn uniform_ramp_single_command() {
    let mut sc = stepper(0);
    let requested: Vec<u64> = (1..=5).map(|i| i * 100).collect();
    for &clk in &requested {
        sc.append(true, 0.0, at(clk)).unwrap();
    }
    sc.flush(u64::MAX).unwrap();

    let steps = decode_steps(&sc);
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].count, 5);
    assert_within_window(&requested, &simulate(0, &steps));
}

// S2: linear acceleration; every pulse of the emitted commands must land
// inside its tolerance window.
#[test]
fn linear_acceleration_within_tolerance() {
    let mut sc = stepper(0);
    let requested = [100u64, 210, 330, 460, 600, 750];
    for &clk in &requested {
        sc.append(true, 0.0, at(clk)).unwrap();
    }
    sc.flush(u64::MAX).unwrap();

    let steps = decode_steps(&sc);
    let total: u32 = steps.iter().map(|s| s.count).sum();
    assert_eq!(total, 6);
    assert_within_window(&requested, &simulate(0, &steps));
}

// S3: a direction reversal inside the chatter window cancels both steps.
#[test]
fn sds_filter_cancels_rapid_reversal() {
    let mut sc = stepper(0);
    sc.append(true, 0.0, at(1000)).unwrap();
    sc.append(false, 0.0, at(1500)).unwrap();
    sc.flush(u64::MAX).unwrap();

    assert!(sc.message_queue().is_empty());
    assert!(!sc.step_dir());
}

// S4: a step beyond CLOCK_DIFF_MAX ships as a singleton scheduled near its
// fire time.
#[test]
fn far_future_step_is_a_scheduled_singleton() {
    let mut sc = stepper(0);
    let clk = 2 * CLOCK_DIFF_MAX;
    sc.append(true, 0.0, at(clk)).unwrap();
    sc.commit().unwrap();

    let steps = decode_steps(&sc);
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].interval, clk as u32);
    assert_eq!(steps[0].count, 1);
    assert_eq!(steps[0].add, 0);

    let step_msg = sc
        .message_queue()
        .iter()
        .find(|m| decode_words(&m.payload).unwrap()[0] == QS_TAG)
        .unwrap();
    assert_eq!(step_msg.req_clock, clk);
}

#[derive(Clone, Default)]
struct Collector {
    sent: Rc<RefCell<Vec<QueueMessage>>>,
}

impl Transport for Collector {
    fn send_batch(&mut self, batch: Vec<QueueMessage>) -> anyhow::Result<()> {
        self.sent.borrow_mut().extend(batch);
        Ok(())
    }
}

fn heap_ok(mc: &[u64]) -> bool {
    (1..mc.len()).all(|i| mc[(i - 1) / 2] <= mc[i])
}

// S5: the synchroniser interleaves steppers in req_clock order, stable by
// stepper index, and keeps the slot heap intact.
#[test]
fn synchroniser_orders_across_steppers() {
    let a = Rc::new(RefCell::new(stepper(0)));
    let b = Rc::new(RefCell::new(stepper(1)));
    a.borrow_mut().reset(500).unwrap();
    b.borrow_mut().reset(400).unwrap();
    a.borrow_mut().append(true, 0.0, at(1000)).unwrap();
    b.borrow_mut().append(true, 0.0, at(900)).unwrap();

    let collector = Collector::default();
    let sent = collector.sent.clone();
    let mut sync = StepperSync::new(collector, vec![a.clone(), b.clone()], 16);
    sync.flush(2000).unwrap();

    let sent = sent.borrow();
    assert!(!sent.is_empty());

    // Global order is non-decreasing in req_clock
    for pair in sent.windows(2) {
        assert!(pair[0].req_clock <= pair[1].req_clock);
    }

    // B's step command (oid 1) must come out before A's
    let oid_of = |m: &QueueMessage| decode_words(&m.payload).unwrap()[1];
    let step_oids: Vec<u32> = sent
        .iter()
        .filter(|m| decode_words(&m.payload).unwrap()[0] == QS_TAG)
        .map(oid_of)
        .collect();
    assert_eq!(step_oids, vec![1, 0]);

    // Per-stepper enqueue order survives: each stepper's direction command
    // precedes its step command
    for oid in [0u32, 1] {
        let kinds: Vec<u32> = sent
            .iter()
            .map(|m| decode_words(&m.payload).unwrap())
            .filter(|w| w[1] == oid)
            .map(|w| w[0])
            .collect();
        assert_eq!(kinds, vec![DIR_TAG, QS_TAG]);
    }

    assert!(heap_ok(sync.move_clocks()));
}

// A slot-consuming command whose req_clock lies past the flush horizon
// must stay queued; passthrough commands go out regardless.
#[test]
fn synchroniser_gates_slot_commands_on_horizon() {
    let a = Rc::new(RefCell::new(stepper(0)));
    a.borrow_mut().reset(100).unwrap();
    let clk = 100 + 2 * CLOCK_DIFF_MAX;
    a.borrow_mut().append(true, 0.0, at(clk)).unwrap();
    a.borrow_mut().commit().unwrap();

    let collector = Collector::default();
    let sent = collector.sent.clone();
    let mut sync = StepperSync::new(collector, vec![a.clone()], 4);

    sync.flush(1000).unwrap();
    // Only the direction command (no move slot) went out
    assert_eq!(sent.borrow().len(), 1);
    assert_eq!(a.borrow().message_queue().len(), 1);

    sync.flush(clk + 1).unwrap();
    assert_eq!(sent.borrow().len(), 2);
    assert!(a.borrow().message_queue().is_empty());
    assert!(heap_ok(sync.move_clocks()));
}

// Property 3: compressing any monotone sequence with healthy spacing and
// replaying the commands reproduces each step within max_error, never late.
#[test]
fn roundtrip_reproduces_requested_steps() {
    let mut sc = stepper(0);
    let mut requested = Vec::new();
    let mut clock = 0u64;
    for i in 0u64..400 {
        // Deterministic irregular spacing, always >= 2 * MAX_ERROR
        clock += 60 + (i * 37) % 240;
        requested.push(clock);
    }
    for &clk in &requested {
        sc.append(true, 0.0, at(clk)).unwrap();
    }
    sc.flush(u64::MAX).unwrap();

    let steps = decode_steps(&sc);
    assert!(steps.len() < requested.len(), "no compression achieved");
    assert_within_window(&requested, &simulate(0, &steps));
}

// Property 5: past positions never regress for a forward-only sequence.
#[test]
fn past_position_is_monotone() {
    let mut sc = stepper(0);
    let requested: Vec<u64> = (1..=50).map(|i| i * 200).collect();
    for &clk in &requested {
        sc.append(true, 0.0, at(clk)).unwrap();
    }
    sc.flush(u64::MAX).unwrap();

    let mut prev = i64::MIN;
    for clock in (0..=10_200).step_by(10) {
        let pos = sc.find_past_position(clock);
        assert!(pos >= prev, "position regressed at clock {clock}");
        prev = pos;
    }
    assert_eq!(sc.find_past_position(u64::MAX), 50);
}

// Ordered history extraction for host queries.
#[test]
fn extract_old_returns_recent_commands() {
    let mut sc = stepper(0);
    for &clk in &[100u64, 200, 300, 400, 500] {
        sc.append(true, 0.0, at(clk)).unwrap();
    }
    sc.flush(u64::MAX).unwrap();

    let entries = sc.extract_old(16, 0, u64::MAX);
    assert!(!entries.is_empty());
    let total: i32 = entries.iter().map(|e| e.step_count).sum();
    assert_eq!(total, 5);
    // Newest first
    for pair in entries.windows(2) {
        assert!(pair[0].first_clock >= pair[1].first_clock);
    }
}
