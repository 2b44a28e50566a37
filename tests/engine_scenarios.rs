//! End-to-end engine scenarios against the simulated diversion handle.
//!
//! Timing assertions use wide windows so the suite stays green on loaded CI
//! machines; ordering assertions are exact.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use packetlag_sdk::divert::sim::SimHarness;
use packetlag_sdk::timing;
use packetlag_sdk::{DelayEngine, EngineEvents};

#[derive(Default)]
struct RecordingEvents {
    status: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
}

impl EngineEvents for RecordingEvents {
    fn on_status(&self, message: &str) {
        self.status.lock().unwrap().push(message.to_string());
    }
    fn on_error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }
}

fn engine_over(harness: &SimHarness) -> (DelayEngine, Arc<RecordingEvents>) {
    let sink = Arc::new(RecordingEvents::default());
    let engine = DelayEngine::with_opener(sink.clone(), harness.opener());
    (engine, sink)
}

fn wait_until(cond: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

fn elapsed_ms(since: timing::Tick, until: timing::Tick) -> f64 {
    timing::ticks_to_ms(until - since)
}

#[test]
fn quiet_start_stop() {
    let harness = SimHarness::new();
    let (engine, sink) = engine_over(&harness);

    engine.start(100).unwrap();
    assert!(engine.is_running());
    assert_eq!(engine.queued_packets(), 0);

    engine.stop();
    assert!(!engine.is_running());
    assert_eq!(engine.queued_packets(), 0);

    assert_eq!(
        *sink.status.lock().unwrap(),
        vec!["Engine started with 100ms delay.", "Engine stopped."]
    );
    assert!(sink.errors.lock().unwrap().is_empty());
}

#[test]
fn single_packet_is_delayed() {
    let harness = SimHarness::new();
    let (engine, sink) = engine_over(&harness);

    engine.start(100).unwrap();
    let injected_at = timing::now();
    harness.inject(b"single-packet-payload", true);

    // Queue depth peaks at one while the packet waits out its delay.
    assert!(wait_until(|| engine.queued_packets() == 1, Duration::from_millis(80)));

    let sent = harness
        .recv_sent(Duration::from_secs(2))
        .expect("packet released");
    let held_for = elapsed_ms(injected_at, sent.at);

    assert_eq!(sent.data, b"single-packet-payload");
    assert!(sent.outbound);
    assert!(held_for >= 99.0, "held only {:.2} ms", held_for);
    assert!(held_for < 300.0, "held {:.2} ms", held_for);

    assert!(wait_until(|| engine.queued_packets() == 0, Duration::from_millis(200)));
    engine.stop();
    assert!(sink.errors.lock().unwrap().is_empty());
}

#[test]
fn fifo_order_is_preserved() {
    let harness = SimHarness::new();
    let (engine, _sink) = engine_over(&harness);

    engine.start(100).unwrap();
    for payload in [b"packet-a", b"packet-b", b"packet-c"] {
        harness.inject(payload, true);
        thread::sleep(Duration::from_millis(2));
    }

    let mut sent_at = Vec::new();
    for expected in [b"packet-a", b"packet-b", b"packet-c"] {
        let sent = harness
            .recv_sent(Duration::from_secs(2))
            .expect("packet released");
        assert_eq!(sent.data, expected);
        sent_at.push(sent.at);
    }
    assert!(sent_at.windows(2).all(|w| w[0] <= w[1]));

    engine.stop();
}

#[test]
fn delay_update_applies_to_new_captures_only() {
    let harness = SimHarness::new();
    let (engine, _sink) = engine_over(&harness);

    engine.start(200).unwrap();
    let t0 = timing::now();
    harness.inject(b"slow-lane", true);

    thread::sleep(Duration::from_millis(50));
    engine.update_delay(10);
    thread::sleep(Duration::from_millis(10));
    let b_injected_at = timing::now();
    harness.inject(b"fast-lane", true);

    // The shorter delay overtakes: B releases around 70 ms, A keeps its
    // original 200 ms deadline.
    let first = harness
        .recv_sent(Duration::from_secs(2))
        .expect("first packet released");
    assert_eq!(first.data, b"fast-lane");
    let b_held = elapsed_ms(b_injected_at, first.at);
    assert!(b_held >= 9.0, "B held only {:.2} ms", b_held);
    assert!(b_held < 120.0, "B held {:.2} ms", b_held);

    let second = harness
        .recv_sent(Duration::from_secs(2))
        .expect("second packet released");
    assert_eq!(second.data, b"slow-lane");
    let a_held = elapsed_ms(t0, second.at);
    assert!(a_held >= 195.0, "A held only {:.2} ms", a_held);
    assert!(a_held < 500.0, "A held {:.2} ms", a_held);

    engine.stop();
}

#[test]
fn zero_delay_fast_path_bypasses_the_buffer() {
    let harness = SimHarness::new();
    let (engine, sink) = engine_over(&harness);

    engine.start(0).unwrap();
    for i in 0..100u8 {
        harness.inject(&[i], true);
    }

    for i in 0..100u8 {
        let sent = harness
            .recv_sent(Duration::from_secs(1))
            .expect("fast-path packet");
        assert_eq!(sent.data, vec![i]);
        // The fast path never touches the buffer.
        assert_eq!(engine.queued_packets(), 0);
    }

    assert!(wait_until(|| engine.packets_sent() == 100, Duration::from_millis(200)));
    engine.stop();
    assert!(sink.errors.lock().unwrap().is_empty());
}

#[test]
fn stop_with_backlog_releases_every_packet() {
    let harness = SimHarness::new();
    let (engine, _sink) = engine_over(&harness);

    engine.start(1_000).unwrap();
    for i in 0..300u16 {
        harness.inject(&i.to_be_bytes(), i % 2 == 0);
    }
    assert!(wait_until(
        || engine.queued_packets() == 300,
        Duration::from_secs(2)
    ));

    let stopping = Instant::now();
    engine.stop();
    let stop_took = stopping.elapsed();

    assert!(stop_took < Duration::from_secs(3), "stop took {:?}", stop_took);
    assert!(!engine.is_running());
    assert_eq!(engine.queued_packets(), 0);
    // Nothing reached its deadline, so nothing was re-injected.
    assert!(harness.recv_sent(Duration::from_millis(50)).is_none());
}

#[test]
fn capture_failure_reports_once_and_queue_drains() {
    let harness = SimHarness::new();
    let (engine, sink) = engine_over(&harness);

    engine.start(100).unwrap();

    harness.inject(b"queued-before-fault", true);
    assert!(wait_until(|| engine.queued_packets() == 1, Duration::from_secs(1)));

    // Arm a receive fault; the wake packet makes the blocked receive return
    // so a following call observes it. Depending on timing the wake may or
    // may not itself be captured before the fault fires.
    harness.fail_next_recvs(1);
    harness.inject(b"wake", true);

    assert!(wait_until(
        || sink.errors.lock().unwrap().len() == 1,
        Duration::from_secs(2)
    ));
    assert!(sink.errors.lock().unwrap()[0].contains("capture failed"));

    // The release worker keeps draining what capture already queued.
    let sent = harness
        .recv_sent(Duration::from_secs(2))
        .expect("queued packet still released");
    assert_eq!(sent.data, b"queued-before-fault");

    // The controller does not self-stop on a capture fault.
    assert!(engine.is_running());
    engine.stop();
    assert_eq!(sink.errors.lock().unwrap().len(), 1);
}

#[test]
fn send_failures_report_up_to_the_limit() {
    let harness = SimHarness::new();
    let (engine, sink) = engine_over(&harness);

    engine.start(20).unwrap();
    harness.fail_next_sends(5);
    for i in 0..6u8 {
        harness.inject(&[i], false);
    }

    // Five failures (three reported, counter kept), then one success.
    let sent = harness
        .recv_sent(Duration::from_secs(2))
        .expect("sixth packet released");
    assert_eq!(sent.data, vec![5]);

    assert!(wait_until(
        || sink.errors.lock().unwrap().len() == 3,
        Duration::from_secs(1)
    ));
    let errors = sink.errors.lock().unwrap();
    assert_eq!(errors.len(), 3);
    assert!(errors.iter().all(|e| e.contains("re-injection failed")));
    drop(errors);

    assert!(wait_until(|| engine.packets_sent() == 1, Duration::from_millis(200)));
    engine.stop();
}
