//! End-to-end receiver tests over the loopback device.
//!
//! A [`Coprocessor`] handle fills and signals slots while a real receiver
//! thread waits on them, so these tests exercise the whole path: pool,
//! notification wait, filled-size query, estimate, handler, cursor.
//!
//! # Running with tracing
//!
//! ```bash
//! cargo test -p sdb --features tracing --test receiver_lifecycle -- --nocapture
//! RUST_LOG=sdb=trace cargo test -p sdb --features tracing --test receiver_lifecycle -- --nocapture
//! ```

use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use sdb::device::ControlCommand;
use sdb::device::loopback::{Coprocessor, FaultPlan, LoopbackDevice};
use sdb::{
    BufferReady, CounterPolicy, DeviceError, Receiver, ReceiverConfig,
    ReceiverError, ReceiverState, RegistryError, SlotIndex,
};

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        sdb::init_tracing();
    });
}

/// Records every buffer it is handed.
#[derive(Default)]
struct Recorder {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl Recorder {
    fn buffers(&self) -> Vec<Vec<u8>> {
        self.buffers.lock().unwrap().clone()
    }

    fn calls(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}

impl BufferReady for Recorder {
    fn on_buffer_ready(&self, buffer: &[u8]) -> u32 {
        self.buffers.lock().unwrap().push(buffer.to_vec());
        buffer.len() as u32
    }
}

fn test_config() -> ReceiverConfig {
    ReceiverConfig {
        idle_poll: Duration::from_millis(10),
        wait_slice: Duration::from_millis(5),
        ..ReceiverConfig::default()
    }
}

fn slot(i: u32) -> SlotIndex {
    SlotIndex::new(i)
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

fn deliver(copro: &Coprocessor, index: u32, bytes: &[u8]) {
    // SAFETY: every test waits for the previous cycle on a slot to be
    // delivered before filling it again.
    assert!(unsafe { copro.deliver(slot(index), bytes) });
}

struct Harness {
    rx: Receiver<LoopbackDevice>,
    copro: Coprocessor,
    recorder: Arc<Recorder>,
    handler: Arc<dyn BufferReady>,
}

/// Init → register → InitReceiver, with `count` regions of `region_size`.
fn harness(config: ReceiverConfig, device: LoopbackDevice, region_size: usize, count: u32) -> Harness {
    init_test_tracing();
    let copro = device.coprocessor();
    let mut rx = Receiver::new(config);
    rx.init(device, region_size, count).unwrap();

    let recorder = Arc::new(Recorder::default());
    let handler: Arc<dyn BufferReady> = recorder.clone();
    rx.register_callback(Arc::clone(&handler)).unwrap();
    rx.init_receiver().unwrap();

    Harness {
        rx,
        copro,
        recorder,
        handler,
    }
}

#[test]
fn init_start_deliver_stop_deinit() {
    let mut h = harness(test_config(), LoopbackDevice::new(), 4096, 3);
    assert_eq!(h.rx.state(), ReceiverState::Ready);
    assert_eq!(h.copro.live_events(), 3);
    assert_eq!(h.copro.live_regions(), 3);

    h.rx.start();
    assert_eq!(h.rx.state(), ReceiverState::Sampling);

    let payload: Vec<u8> = (0..10).collect();
    deliver(&h.copro, 0, &payload);
    wait_until("first delivery", || h.rx.stats().cursor == 1);

    assert_eq!(h.recorder.buffers(), vec![payload]);
    assert_eq!(h.rx.stats().compressed_bytes, 10);

    h.rx.stop();
    assert_eq!(h.rx.state(), ReceiverState::Ready);

    // Nothing is delivered while stopped.
    deliver(&h.copro, 1, &[0xFF; 4]);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(h.recorder.calls(), 1);

    h.rx.deinit_receiver().unwrap();
    assert_eq!(h.rx.state(), ReceiverState::Exiting);
    assert_eq!(h.recorder.calls(), 1);

    assert_eq!(h.copro.live_events(), 0);
    assert_eq!(h.copro.live_regions(), 0);
    assert_eq!(h.copro.registered(), 0);
    assert_eq!(h.rx.stats(), sdb::Stats::default());

    h.rx.unregister_callback(&h.handler).unwrap();
}

#[test]
fn cursor_follows_delivered_cycles() {
    let mut h = harness(test_config(), LoopbackDevice::new(), 64, 3);
    h.rx.start();

    for k in 0..7u32 {
        deliver(&h.copro, k % 3, &[k as u8]);
        wait_until("cycle", || {
            let s = h.rx.stats();
            s.cycles_delivered == u64::from(k + 1) && s.cursor == (k + 1) % 3
        });
    }

    let firsts: Vec<u8> = h.recorder.buffers().iter().map(|b| b[0]).collect();
    assert_eq!(firsts, vec![0, 1, 2, 3, 4, 5, 6]);
    h.rx.deinit_receiver().unwrap();
}

#[test]
fn decoded_size_estimate_accumulates() {
    let mut h = harness(test_config(), LoopbackDevice::new(), 64, 2);
    h.rx.start();

    deliver(&h.copro, 0, &[0x00, 0x20, 0xA0]);
    wait_until("delivery", || h.rx.stats().cursor == 1);
    let s = h.rx.stats();
    assert_eq!(s.compressed_bytes, 3);
    assert_eq!(s.estimated_decoded_bytes, 9);

    deliver(&h.copro, 1, &[0xE0]);
    wait_until("second delivery", || h.rx.stats().cycles_delivered == 2);
    assert_eq!(h.rx.stats().estimated_decoded_bytes, 17);

    h.rx.deinit_receiver().unwrap();
}

#[test]
fn stop_is_idempotent_and_start_resets_cursor() {
    let mut h = harness(test_config(), LoopbackDevice::new(), 64, 3);
    h.rx.start();

    deliver(&h.copro, 0, &[1]);
    wait_until("delivery", || h.rx.stats().cursor == 1);

    h.rx.stop();
    h.rx.stop();
    assert_eq!(h.rx.state(), ReceiverState::Ready);

    h.rx.start();
    assert_eq!(h.rx.stats().cursor, 0);

    // The receiver waits on slot 0 again, not slot 1.
    deliver(&h.copro, 0, &[2]);
    wait_until("delivery after restart", || h.rx.stats().cycles_delivered == 2);
    assert_eq!(h.recorder.buffers(), vec![vec![1], vec![2]]);

    h.rx.deinit_receiver().unwrap();
}

#[test]
fn registry_preconditions() {
    let mut h = harness(test_config(), LoopbackDevice::new(), 64, 1);

    let other: Arc<dyn BufferReady> = Arc::new(|_: &[u8]| 0u32);
    assert!(matches!(
        h.rx.register_callback(Arc::clone(&other)),
        Err(ReceiverError::Registry(RegistryError::AlreadyRegistered))
    ));
    assert!(matches!(
        h.rx.unregister_callback(&other),
        Err(ReceiverError::Registry(RegistryError::NotRegistered))
    ));

    h.rx.start();
    assert!(matches!(
        h.rx.unregister_callback(&h.handler),
        Err(ReceiverError::Registry(RegistryError::BusyWhileSampling))
    ));

    h.rx.stop();
    h.rx.unregister_callback(&h.handler).unwrap();
    h.rx.register_callback(other).unwrap();
    h.rx.deinit_receiver().unwrap();
}

#[test]
fn out_of_order_signal_waits_for_the_cursor() {
    let mut h = harness(test_config(), LoopbackDevice::new(), 64, 3);
    h.rx.start();

    deliver(&h.copro, 1, &[0xB1]);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(h.recorder.calls(), 0);
    assert_eq!(h.rx.stats().cursor, 0);

    deliver(&h.copro, 0, &[0xB0]);
    wait_until("both slots", || h.rx.stats().cycles_delivered == 2);
    assert_eq!(h.recorder.buffers(), vec![vec![0xB0], vec![0xB1]]);
    wait_until("cursor", || h.rx.stats().cursor == 2);

    h.rx.deinit_receiver().unwrap();
}

#[test]
fn cycle_without_handler_is_dropped() {
    let mut h = harness(test_config(), LoopbackDevice::new(), 64, 2);
    h.rx.unregister_callback(&h.handler).unwrap();
    h.rx.start();

    deliver(&h.copro, 0, &[9, 9]);
    wait_until("dropped cycle", || h.rx.stats().cursor == 1);
    let s = h.rx.stats();
    assert_eq!(s.cycles_dropped, 1);
    assert_eq!(s.cycles_delivered, 0);
    assert_eq!(s.compressed_bytes, 2);

    // The loop keeps going once a handler is back.
    h.rx.stop();
    h.rx.register_callback(Arc::clone(&h.handler)).unwrap();
    h.rx.start();
    deliver(&h.copro, 0, &[7]);
    wait_until("delivery", || h.rx.stats().cycles_delivered == 1);
    assert_eq!(h.recorder.buffers(), vec![vec![7]]);

    h.rx.deinit_receiver().unwrap();
}

#[test]
fn empty_cycle_advances_without_callback() {
    let mut h = harness(test_config(), LoopbackDevice::new(), 64, 2);
    h.rx.start();

    h.copro.set_filled(slot(0), 0);
    assert!(h.copro.signal(slot(0)));
    wait_until("empty cycle", || h.rx.stats().cursor == 1);

    let s = h.rx.stats();
    assert_eq!(s.cycles_empty, 1);
    assert_eq!(s.cycles_delivered, 0);
    assert_eq!(h.recorder.calls(), 0);

    h.rx.deinit_receiver().unwrap();
}

#[test]
fn oversized_fill_is_clamped_to_region() {
    let mut h = harness(test_config(), LoopbackDevice::new(), 64, 1);
    h.rx.start();

    h.copro.set_filled(slot(0), 10_000);
    assert!(h.copro.signal(slot(0)));
    wait_until("delivery", || h.rx.stats().cycles_delivered == 1);

    assert_eq!(h.recorder.buffers()[0].len(), 64);
    assert_eq!(h.rx.stats().compressed_bytes, 64);
    h.rx.deinit_receiver().unwrap();
}

#[test]
fn closed_channel_is_terminal_and_surfaces_at_deinit() {
    let mut h = harness(test_config(), LoopbackDevice::new(), 64, 3);
    h.rx.start();

    assert!(h.copro.close_event(slot(0)));
    wait_until("exiting", || h.rx.state() == ReceiverState::Exiting);

    // No way back to sampling.
    h.rx.start();
    assert_eq!(h.rx.state(), ReceiverState::Exiting);

    match h.rx.deinit_receiver() {
        Err(ReceiverError::ChannelClosedUnexpectedly { slot: s }) => assert_eq!(s, slot(0)),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(h.copro.live_events(), 0);
    assert_eq!(h.copro.live_regions(), 0);
}

#[test]
fn failed_size_query_is_terminal() {
    let device = LoopbackDevice::with_faults(FaultPlan::filled_size_at(slot(0)));
    let mut h = harness(test_config(), device, 64, 2);
    h.rx.start();

    deliver(&h.copro, 0, &[1, 2, 3]);
    wait_until("exiting", || h.rx.state() == ReceiverState::Exiting);

    assert!(matches!(
        h.rx.deinit_receiver(),
        Err(ReceiverError::Device(DeviceError::ControlRequestFailed {
            command: ControlCommand::GetDataSize,
            ..
        }))
    ));
    assert_eq!(h.recorder.calls(), 0);
    assert_eq!(h.copro.live_regions(), 0);
}

#[test]
fn panicking_handler_stops_the_thread() {
    init_test_tracing();
    let device = LoopbackDevice::new();
    let copro = device.coprocessor();
    let mut rx = Receiver::new(test_config());
    rx.init(device, 64, 1).unwrap();
    rx.register_callback(Arc::new(|_: &[u8]| -> u32 { panic!("handler failure") }))
        .unwrap();
    rx.init_receiver().unwrap();
    rx.start();

    deliver(&copro, 0, &[1]);
    wait_until("exiting", || rx.state() == ReceiverState::Exiting);

    assert!(matches!(rx.deinit_receiver(), Err(ReceiverError::TaskPanicked)));
    assert_eq!(copro.live_regions(), 0);
}

#[test]
fn counter_policies() {
    for (policy, expected_after_restart) in [
        (CounterPolicy::Cumulative, 3),
        (CounterPolicy::ResetOnStart, 1),
    ] {
        let config = ReceiverConfig {
            counters: policy,
            ..test_config()
        };
        let mut h = harness(config, LoopbackDevice::new(), 64, 2);

        h.rx.start();
        deliver(&h.copro, 0, &[1, 1]);
        wait_until("delivery", || h.rx.stats().cursor == 1);
        h.rx.stop();

        h.rx.start();
        deliver(&h.copro, 0, &[1]);
        wait_until("delivery after restart", || h.rx.stats().cycles_delivered == 2);
        assert_eq!(h.rx.stats().compressed_bytes, expected_after_restart, "{policy:?}");

        // Teardown always returns to the baseline.
        h.rx.deinit_receiver().unwrap();
        assert_eq!(h.rx.stats().compressed_bytes, 0);
    }
}

#[test]
fn receiver_can_be_reinitialized() {
    let mut h = harness(test_config(), LoopbackDevice::new(), 64, 2);
    h.rx.start();
    deliver(&h.copro, 0, &[5]);
    wait_until("delivery", || h.rx.stats().cycles_delivered == 1);
    h.rx.deinit_receiver().unwrap();

    let device = LoopbackDevice::new();
    let copro = device.coprocessor();
    h.rx.init(device, 128, 4).unwrap();
    h.rx.init_receiver().unwrap();
    assert_eq!(h.rx.state(), ReceiverState::Ready);
    h.rx.start();

    deliver(&copro, 0, &[6]);
    wait_until("delivery on new pool", || h.rx.stats().cycles_delivered == 1);
    assert_eq!(h.recorder.buffers(), vec![vec![5], vec![6]]);
    h.rx.deinit_receiver().unwrap();
    assert_eq!(copro.live_regions(), 0);
}

#[test]
fn slow_handler_does_not_lose_cycles() {
    let config = ReceiverConfig {
        callback_budget: Some(Duration::from_millis(1)),
        ..test_config()
    };
    init_test_tracing();
    let device = LoopbackDevice::new();
    let copro = device.coprocessor();
    let mut rx = Receiver::new(config);
    rx.init(device, 64, 2).unwrap();

    let seen = Arc::new(Mutex::new(0u32));
    let counter = Arc::clone(&seen);
    rx.register_callback(Arc::new(move |buf: &[u8]| {
        thread::sleep(Duration::from_millis(20));
        *counter.lock().unwrap() += 1;
        buf.len() as u32
    }))
    .unwrap();
    rx.init_receiver().unwrap();
    rx.start();

    deliver(&copro, 0, &[1]);
    wait_until("first cycle", || rx.stats().cursor == 1);
    deliver(&copro, 1, &[2]);
    wait_until("second cycle", || rx.stats().cycles_delivered == 2);
    assert_eq!(*seen.lock().unwrap(), 2);

    rx.deinit_receiver().unwrap();
}
