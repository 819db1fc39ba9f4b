//! Test fixtures: instrumented PCM drivers and simple processors.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use cadenza_engine::driver::{PcmDriver, PcmLatency};
use cadenza_engine::ring::{Consumer, Producer, RingBuffer};
use cadenza_engine::{
    AudioProcessor, LoopWaker, OBusId, OutputBuffers, RenderContext, Sample, BLOCK_SIZE, MAIN_OBUS,
    N_CHANNELS, SAMPLE_RATE,
};

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

// == Recording sink driver ==

/// Observable state of a [`SinkDriver`], shared with the test.
pub struct SinkState {
    /// Interleaved blocks in delivery order.
    pub blocks: Mutex<Vec<Vec<Sample>>>,
    /// `check_io` invocations.
    pub check_calls: AtomicU64,
    /// Blocks the driver will accept before reporting unready.
    pub budget: AtomicU64,
}

impl SinkState {
    pub fn n_blocks(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    pub fn block(&self, idx: usize) -> Vec<Sample> {
        self.blocks.lock().unwrap()[idx].clone()
    }
}

/// PCM driver that records every delivered block; readiness is bounded by
/// a block budget so tests can stop the engine free-running.
pub struct SinkDriver {
    state: Arc<SinkState>,
    written: u64,
}

impl SinkDriver {
    pub fn new(budget: u64) -> (Box<Self>, Arc<SinkState>) {
        let state = Arc::new(SinkState {
            blocks: Mutex::new(Vec::new()),
            check_calls: AtomicU64::new(0),
            budget: AtomicU64::new(budget),
        });
        (Box::new(Self { state: state.clone(), written: 0 }), state)
    }
}

impl PcmDriver for SinkDriver {
    fn devid(&self) -> &str {
        "test=sink"
    }

    fn check_io(&mut self, timeout_usecs: &mut i64) -> bool {
        self.state.check_calls.fetch_add(1, Ordering::Relaxed);
        if self.written < self.state.budget.load(Ordering::Relaxed) {
            true
        } else {
            *timeout_usecs = 1000;
            false
        }
    }

    fn write(&mut self, interleaved: &[Sample]) {
        self.state.blocks.lock().unwrap().push(interleaved.to_vec());
        self.written += 1;
    }

    fn block_length(&self) -> usize {
        BLOCK_SIZE
    }

    fn frequency(&self) -> u32 {
        SAMPLE_RATE
    }
}

// == Ring-backed driver with a test-driven consumer ==

pub struct RingState {
    pub waker: OnceLock<Arc<LoopWaker>>,
    pub xruns: OnceLock<Arc<AtomicU64>>,
    /// While set, the driver reports unready so the test controls drain.
    pub paused: AtomicBool,
}

/// Driver whose device side is the test itself: the engine writes into a
/// real SPSC ring and the test consumes blocks like a callback would.
pub struct RingDriver {
    producer: Producer<Sample>,
    state: Arc<RingState>,
    scratch: [Vec<Sample>; N_CHANNELS],
}

/// Test-side consumer standing in for the device callback.
pub struct RingHarness {
    consumer: Consumer<Sample>,
    pub state: Arc<RingState>,
}

impl RingDriver {
    pub fn with_capacity(n_blocks: usize) -> (Box<Self>, RingHarness) {
        let ring = RingBuffer::<Sample>::new(n_blocks * BLOCK_SIZE, N_CHANNELS);
        let (producer, consumer) = ring.split();
        let state = Arc::new(RingState {
            waker: OnceLock::new(),
            xruns: OnceLock::new(),
            paused: AtomicBool::new(false),
        });
        (
            Box::new(Self {
                producer,
                state: state.clone(),
                scratch: std::array::from_fn(|_| vec![0.0; BLOCK_SIZE]),
            }),
            RingHarness { consumer, state },
        )
    }
}

impl PcmDriver for RingDriver {
    fn devid(&self) -> &str {
        "test=ring"
    }

    fn check_io(&mut self, timeout_usecs: &mut i64) -> bool {
        if self.state.paused.load(Ordering::Acquire)
            || self.producer.writable_frames() < BLOCK_SIZE
        {
            *timeout_usecs = 500;
            false
        } else {
            true
        }
    }

    fn write(&mut self, interleaved: &[Sample]) {
        for (ch, lane) in self.scratch.iter_mut().enumerate() {
            for (i, frame) in interleaved.chunks_exact(N_CHANNELS).enumerate() {
                lane[i] = frame[ch];
            }
        }
        let lanes: [&[Sample]; N_CHANNELS] =
            std::array::from_fn(|ch| &self.scratch[ch][..BLOCK_SIZE]);
        let wrote = self.producer.write(BLOCK_SIZE, &lanes);
        assert_eq!(wrote, BLOCK_SIZE, "ring dropped frames declared writable");
    }

    fn block_length(&self) -> usize {
        BLOCK_SIZE
    }

    fn frequency(&self) -> u32 {
        SAMPLE_RATE
    }

    fn latency(&self) -> PcmLatency {
        PcmLatency { read_frames: 0, write_frames: 0 }
    }

    fn set_waker(&mut self, waker: Arc<LoopWaker>) {
        let _ = self.state.waker.set(waker);
    }

    fn set_xrun_counter(&mut self, counter: Arc<AtomicU64>) {
        let _ = self.state.xruns.set(counter);
    }
}

impl RingHarness {
    /// Consume one block like a device callback: short reads play silence
    /// and count an xrun.
    pub fn consume_block(&mut self) -> (Vec<Sample>, bool) {
        let mut left = vec![0.0; BLOCK_SIZE];
        let mut right = vec![0.0; BLOCK_SIZE];
        let got = self.consumer.read(BLOCK_SIZE, &mut [&mut left[..], &mut right[..]]);
        let underrun = got < BLOCK_SIZE;
        if underrun {
            for lane in [&mut left, &mut right] {
                lane[got..].fill(0.0);
            }
            if let Some(xruns) = self.state.xruns.get() {
                xruns.fetch_add(1, Ordering::Relaxed);
            }
        }
        if let Some(waker) = self.state.waker.get() {
            waker.notify();
        }
        let mut interleaved = vec![0.0; BLOCK_SIZE * N_CHANNELS];
        for i in 0..BLOCK_SIZE {
            interleaved[2 * i] = left[i];
            interleaved[2 * i + 1] = right[i];
        }
        (interleaved, underrun)
    }

    pub fn buffered_frames(&self) -> usize {
        self.consumer.readable_frames()
    }
}

// == Processors ==

/// Expected sine sample, same arithmetic as [`SineProc`].
pub fn sine_sample(freq: f64, amplitude: f64, frame: u64) -> Sample {
    ((2.0 * std::f64::consts::PI * freq * frame as f64 / SAMPLE_RATE as f64).sin() * amplitude)
        as Sample
}

/// Stereo sine source; phase restarts at every reset.
pub struct SineProc {
    freq: f64,
    amplitude: f64,
    frames_rendered: u64,
    out: OutputBuffers,
}

impl SineProc {
    pub fn boxed(freq: f64, amplitude: f64) -> Box<Self> {
        Box::new(Self {
            freq,
            amplitude,
            frames_rendered: 0,
            out: OutputBuffers::single(2),
        })
    }
}

impl AudioProcessor for SineProc {
    fn reset(&mut self, _target_stamp: u64) {
        self.frames_rendered = 0;
    }

    fn render(&mut self, _ctx: &RenderContext<'_>, n_frames: usize) {
        for i in 0..n_frames {
            let sample = sine_sample(self.freq, self.amplitude, self.frames_rendered + i as u64);
            self.out.channel_mut(MAIN_OBUS, 0)[i] = sample;
            self.out.channel_mut(MAIN_OBUS, 1)[i] = sample;
        }
        self.frames_rendered += n_frames as u64;
    }

    fn n_obuses(&self) -> usize {
        1
    }

    fn n_ochannels(&self, obus: OBusId) -> usize {
        self.out.n_ochannels(obus)
    }

    fn ofloats(&self, obus: OBusId, channel: usize) -> &[Sample] {
        self.out.channel(obus, channel)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Mono constant source; checks mono-to-stereo duplication.
pub struct MonoConst {
    value: Sample,
    out: OutputBuffers,
}

impl MonoConst {
    pub fn boxed(value: Sample) -> Box<Self> {
        Box::new(Self { value, out: OutputBuffers::single(1) })
    }
}

impl AudioProcessor for MonoConst {
    fn render(&mut self, _ctx: &RenderContext<'_>, n_frames: usize) {
        self.out.channel_mut(MAIN_OBUS, 0)[..n_frames].fill(self.value);
    }

    fn n_obuses(&self) -> usize {
        1
    }

    fn n_ochannels(&self, obus: OBusId) -> usize {
        self.out.n_ochannels(obus)
    }

    fn ofloats(&self, obus: OBusId, channel: usize) -> &[Sample] {
        self.out.channel(obus, channel)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
