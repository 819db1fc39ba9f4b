//! End-to-end scenarios driving the engine thread through the public API.

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cadenza_engine::{
    AudioEngine, ChangeMask, EngineObserver, ProcessorId, Sample, UserNote, BLOCK_SIZE,
};
use support::*;

const TIMEOUT: Duration = Duration::from_secs(5);

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Default)]
struct NoteCollector {
    notes: Vec<UserNote>,
}

impl EngineObserver for NoteCollector {
    fn user_note(&mut self, note: UserNote) {
        self.notes.push(note);
    }

    fn processor_changed(&mut self, _proc: ProcessorId, _mask: ChangeMask) {}
}

/// S1: an engine with no outputs delivers exact-zero blocks.
#[test]
fn silence_to_driver() {
    init_logs();
    let (driver, sink) = SinkDriver::new(10);
    let mut engine = AudioEngine::new();
    engine.set_pcm_driver(driver);
    engine.start_threads(|| {});

    assert!(wait_until(TIMEOUT, || sink.n_blocks() >= 10));
    engine.stop_threads();

    assert_eq!(sink.n_blocks(), 10);
    for idx in 0..10 {
        assert!(
            sink.block(idx).iter().all(|&s| s == 0.0),
            "block {idx} not silent"
        );
    }
    // Ten blocks delivered; rendering stays at most one block ahead.
    let rendered = engine.frame_counter();
    assert!(rendered >= 10 * BLOCK_SIZE as u64);
    assert!(rendered <= 11 * BLOCK_SIZE as u64);
}

/// S2: a 1 kHz sine at amplitude 0.5 arrives phase-exact, block after block.
#[test]
fn sine_passthrough() {
    let (driver, sink) = SinkDriver::new(110);
    let mut engine = AudioEngine::new();
    engine.set_pcm_driver(driver);
    let sine = engine.add_processor(SineProc::boxed(1000.0, 0.5));
    engine.enable_output(sine, true);
    engine.start_threads(|| {});

    assert!(wait_until(TIMEOUT, || sink.n_blocks() >= 102));
    engine.stop_threads();

    // Block 0 is the engine's preroll silence; sine blocks follow.
    assert!(sink.block(0).iter().all(|&s| s == 0.0));
    assert!(sink.block(1)[0].abs() < 1e-6, "sine must start at phase 0");
    let expected = sine_sample(1000.0, 0.5, BLOCK_SIZE as u64);
    assert!((sink.block(2)[0] - expected).abs() < 1e-6);

    for k in 0..100u64 {
        let block = sink.block(k as usize + 1);
        let want = sine_sample(1000.0, 0.5, k * BLOCK_SIZE as u64);
        assert!(
            (block[0] - want).abs() < 1e-6,
            "block {k} first sample {} != {want}",
            block[0]
        );
        // Stereo lanes carry the same signal.
        assert_eq!(block[0], block[1]);
    }
}

/// S3: two identical outputs sum to exactly twice the signal.
#[test]
fn summed_outputs() {
    let (driver, sink) = SinkDriver::new(20);
    let mut engine = AudioEngine::new();
    engine.set_pcm_driver(driver);
    let a = engine.add_processor(SineProc::boxed(440.0, 0.25));
    let b = engine.add_processor(SineProc::boxed(440.0, 0.25));
    engine.enable_output(a, true);
    engine.enable_output(b, true);
    engine.start_threads(|| {});

    assert!(wait_until(TIMEOUT, || sink.n_blocks() >= 10));
    engine.stop_threads();

    for k in 0..8u64 {
        let block = sink.block(k as usize + 1);
        for i in 0..BLOCK_SIZE as u64 {
            let single = sine_sample(440.0, 0.25, k * BLOCK_SIZE as u64 + i);
            let want = single + single;
            assert_eq!(block[2 * i as usize], want, "block {k} frame {i}");
        }
    }
}

/// A mono output is duplicated across both stereo lanes.
#[test]
fn mono_output_duplicated() {
    let (driver, sink) = SinkDriver::new(5);
    let mut engine = AudioEngine::new();
    engine.set_pcm_driver(driver);
    let mono = engine.add_processor(MonoConst::boxed(0.7));
    engine.enable_output(mono, true);
    engine.start_threads(|| {});

    assert!(wait_until(TIMEOUT, || sink.n_blocks() >= 3));
    engine.stop_threads();

    let block = sink.block(1);
    for frame in block.chunks_exact(2) {
        assert_eq!(frame[0], 0.7);
        assert_eq!(frame[1], 0.7);
    }
}

/// S4: async jobs submitted from one thread run in submission order; a
/// const job observes all of them.
#[test]
fn job_ordering() {
    let (driver, _sink) = SinkDriver::new(20);
    let mut engine = AudioEngine::new();
    engine.set_pcm_driver(driver);
    engine.start_threads(|| {});

    let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    for i in 0..1000 {
        let seen = seen.clone();
        engine.async_jobs().add(move |_core| {
            seen.lock().unwrap().push(i);
        });
    }
    // Const jobs run after all pending async jobs have been applied.
    let seen_by_const: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
    let probe = seen_by_const.clone();
    let seen_inner = seen.clone();
    engine.const_jobs().add(move |_core| {
        *probe.lock().unwrap() = seen_inner.lock().unwrap().len();
    });

    assert_eq!(*seen_by_const.lock().unwrap(), 1000);
    assert_eq!(*seen.lock().unwrap(), (0..1000).collect::<Vec<_>>());
    engine.stop_threads();
}

/// S5: a synchronized driver install redirects the very next block; the
/// old driver is never polled again.
#[test]
fn driver_hot_swap() {
    let (driver_a, sink_a) = SinkDriver::new(u64::MAX);
    let mut engine = AudioEngine::new();
    engine.set_pcm_driver(driver_a);
    engine.start_threads(|| {});
    assert!(wait_until(TIMEOUT, || sink_a.n_blocks() >= 3));

    let (driver_b, sink_b) = SinkDriver::new(u64::MAX);
    engine.set_pcm_driver(driver_b);
    // The synchronized job has run by the time set_pcm_driver returns, so
    // the replaced driver sees no further traffic.
    let calls_after_swap = sink_a.check_calls.load(std::sync::atomic::Ordering::Relaxed);
    let blocks_after_swap = sink_a.n_blocks();

    assert!(wait_until(TIMEOUT, || sink_b.n_blocks() >= 5));
    engine.stop_threads();

    assert_eq!(
        sink_a.check_calls.load(std::sync::atomic::Ordering::Relaxed),
        calls_after_swap
    );
    assert_eq!(sink_a.n_blocks(), blocks_after_swap);
}

/// S6: a stalled consumer underruns, the callback plays silence, the xrun
/// is counted and noted, and delivery recovers.
#[test]
fn xrun_recovery() {
    init_logs();
    let (driver, mut harness) = RingDriver::with_capacity(3);
    let state = harness.state.clone();
    let mut engine = AudioEngine::new();
    engine.set_pcm_driver(driver);
    let sine = engine.add_processor(SineProc::boxed(1000.0, 0.5));
    engine.enable_output(sine, true);
    engine.start_threads(|| {});

    // Engine fills the ring, then stalls against the unconsumed buffer.
    assert!(wait_until(TIMEOUT, || harness.buffered_frames() == 3 * BLOCK_SIZE));
    let stamp_full = engine.frame_counter();

    // Simulate callbacks draining faster than the engine may refill.
    state.paused.store(true, std::sync::atomic::Ordering::Release);
    for _ in 0..3 {
        let (_, underrun) = harness.consume_block();
        assert!(!underrun);
    }
    let (zeros, underrun) = harness.consume_block();
    assert!(underrun, "empty ring must underrun");
    assert!(zeros.iter().all(|&s| s == 0.0), "underrun must deliver silence");
    assert_eq!(engine.xrun_count(), 1);

    // Resume: the engine catches back up and notes the dropout.
    state.paused.store(false, std::sync::atomic::Ordering::Release);
    engine.wakeup_thread_mt();
    assert!(wait_until(TIMEOUT, || harness.buffered_frames() == 3 * BLOCK_SIZE));
    assert!(engine.frame_counter() >= stamp_full + 3 * BLOCK_SIZE as u64);

    let mut collector = NoteCollector::default();
    assert!(wait_until(TIMEOUT, || {
        engine.ipc_dispatch(&mut collector);
        collector
            .notes
            .iter()
            .any(|n| n.channel == "pcm-driver" && n.text.contains("dropouts"))
    }));

    // Post-recovery delivery carries signal again.
    let (data, underrun) = harness.consume_block();
    assert!(!underrun);
    assert!(data.iter().any(|&s| s != 0.0));
    engine.stop_threads();
}

/// S12 + capture: autostop fires exactly at the frame limit and the
/// capture file does not overshoot it.
#[test]
fn capture_with_autostop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("autostop.wav");

    let (driver, sink) = SinkDriver::new(u64::MAX);
    let mut engine = AudioEngine::new();
    engine.set_pcm_driver(driver);
    let sine = engine.add_processor(SineProc::boxed(1000.0, 0.5));
    engine.enable_output(sine, true);
    engine.queue_capture_start(&path, false).unwrap();
    engine.set_autostop(10 * BLOCK_SIZE as u64);
    engine.start_threads(|| {});

    assert!(wait_until(TIMEOUT, || engine.take_autostop()));
    // Let the engine run on past the limit to prove capture stopped.
    assert!(wait_until(TIMEOUT, || sink.n_blocks() >= 14));
    engine.queue_capture_stop();
    engine.stop_threads();

    let mut reader = hound::WavReader::open(&path).unwrap();
    let samples: Vec<Sample> = reader.samples::<f32>().map(Result::unwrap).collect();
    // Exactly ten blocks: the preroll silence block plus nine sine blocks.
    assert_eq!(samples.len(), 10 * BLOCK_SIZE * 2);
    assert!(samples[..2 * BLOCK_SIZE].iter().all(|&s| s == 0.0));
    let expected = sine_sample(1000.0, 0.5, BLOCK_SIZE as u64);
    assert!((samples[2 * 2 * BLOCK_SIZE] - expected).abs() < 1e-6);
}

/// Capture to an unsupported extension fails up front and surfaces a note.
#[test]
fn capture_rejects_opus() {
    let mut engine = AudioEngine::new();
    let result = engine.queue_capture_start("session.opus", false);
    assert!(result.is_err());

    let mut collector = NoteCollector::default();
    engine.ipc_dispatch(&mut collector);
    assert!(collector.notes.iter().any(|n| n.channel == "capture"));
}

/// MIDI events flow from a driver through the built-in input processor to
/// a downstream consumer, and a driver swap retires the old driver.
#[test]
fn midi_events_reach_consumers() {
    use cadenza_engine::driver::MidiDriver;
    use cadenza_engine::midi::{MidiEventKind, MidiEventStream};
    use std::any::Any;
    use std::collections::VecDeque;

    struct FakeMidi {
        devid: String,
        queue: Arc<Mutex<VecDeque<[u8; 3]>>>,
    }

    impl MidiDriver for FakeMidi {
        fn devid(&self) -> &str {
            &self.devid
        }

        fn fetch_events(&mut self, stream: &mut MidiEventStream, _sample_rate: u32) {
            while let Some(bytes) = self.queue.lock().unwrap().pop_front() {
                if let Some(kind) = MidiEventKind::parse(&bytes) {
                    stream.push(cadenza_engine::midi::MidiEvent::at_block_start(kind));
                }
            }
        }
    }

    /// Event-only processor that records everything it receives.
    struct EventSink {
        seen: Arc<Mutex<Vec<MidiEventKind>>>,
    }

    impl cadenza_engine::AudioProcessor for EventSink {
        fn render(&mut self, ctx: &cadenza_engine::RenderContext<'_>, _n_frames: usize) {
            let mut seen = self.seen.lock().unwrap();
            for event in ctx.events() {
                seen.push(event.kind);
            }
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    let queue: Arc<Mutex<VecDeque<[u8; 3]>>> = Arc::new(Mutex::new(VecDeque::new()));
    let seen: Arc<Mutex<Vec<MidiEventKind>>> = Arc::new(Mutex::new(Vec::new()));

    let (driver, sink) = SinkDriver::new(u64::MAX);
    let mut engine = AudioEngine::new();
    engine.set_pcm_driver(driver);
    engine.set_midi_drivers(vec![Box::new(FakeMidi {
        devid: "fake=0".into(),
        queue: queue.clone(),
    })]);
    assert_eq!(engine.midi_devids().to_vec(), vec!["fake=0".to_string()]);

    let consumer = engine.add_processor(Box::new(EventSink { seen: seen.clone() }));
    engine.connect_events(consumer, engine.event_source());
    engine.enable_output(consumer, true);
    engine.start_threads(|| {});

    queue.lock().unwrap().push_back([0x90, 60, 100]);
    queue.lock().unwrap().push_back([0x80, 60, 0]);

    assert!(wait_until(TIMEOUT, || seen.lock().unwrap().len() >= 2));
    assert!(sink.n_blocks() > 0);

    // Swapping in an empty list retires the driver; no further events flow.
    engine.set_midi_drivers(Vec::new());
    assert!(engine.midi_devids().is_empty());
    queue.lock().unwrap().push_back([0x90, 64, 80]);
    std::thread::sleep(Duration::from_millis(20));
    engine.stop_threads();

    let seen = seen.lock().unwrap();
    assert_eq!(
        seen[0],
        MidiEventKind::NoteOn { channel: 0, note: 60, velocity: 100 }
    );
    assert_eq!(
        seen[1],
        MidiEventKind::NoteOff { channel: 0, note: 60, velocity: 0 }
    );
    assert!(!seen
        .iter()
        .any(|k| matches!(k, MidiEventKind::NoteOn { note: 64, .. })));
}

/// Driver preference updates fall back gracefully: unknown devices leave
/// the null driver installed and surface user notes.
#[test]
fn update_drivers_notes_failures() {
    use cadenza_engine::driver::DriverPrefs;

    let mut engine = AudioEngine::new();
    let prefs = DriverPrefs {
        pcm_driver: "bogus=card0".into(),
        midi_drivers: [
            "bogus=keys".into(),
            "null".into(),
            "null".into(),
            "null".into(),
        ],
    };

    // fullio=false only ensures the fallback state.
    engine.update_drivers(&prefs, false);
    assert_eq!(engine.pcm_devid(), "null");

    engine.update_drivers(&prefs, true);
    assert_eq!(engine.pcm_devid(), "null");
    assert!(engine.midi_devids().is_empty());

    let mut collector = NoteCollector::default();
    engine.ipc_dispatch(&mut collector);
    assert!(collector.notes.iter().any(|n| n.channel == "pcm-driver"));
    assert!(collector.notes.iter().any(|n| n.channel == "midi-driver"));
}

/// Stopping and restarting the engine thread preserves the frame counter.
#[test]
fn restart_keeps_counting() {
    let (driver, sink) = SinkDriver::new(5);
    let mut engine = AudioEngine::new();
    engine.set_pcm_driver(driver);
    engine.start_threads(|| {});
    assert!(wait_until(TIMEOUT, || sink.n_blocks() >= 5));
    engine.stop_threads();
    let frames = engine.frame_counter();
    assert!(frames >= 5 * BLOCK_SIZE as u64);

    sink.budget.store(10, std::sync::atomic::Ordering::Relaxed);
    engine.start_threads(|| {});
    assert!(wait_until(TIMEOUT, || sink.n_blocks() >= 10));
    engine.stop_threads();
    assert!(engine.frame_counter() > frames);
}
