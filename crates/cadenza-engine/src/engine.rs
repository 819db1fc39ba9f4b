//! The audio engine: owner-facing handle plus the real-time render loop.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   async/const/sync    ┌─────────────────────┐
//! │   Owner thread   │───jobs (lock-free)───►│    Engine thread    │
//! │  (control / UI)  │                       │  (owns EngineCore)  │
//! │                  │◄──trash + user notes──│                     │
//! └──────────────────┘    + change masks     └──────────┬──────────┘
//!         ▲                                             │ ring buffer
//!         │ wakeup callback                             ▼
//!         │                                  ┌─────────────────────┐
//!         └──────────────────────────────────│   Driver callback   │
//!                              (ipc pending) │      threads        │
//!                                            └─────────────────────┘
//! ```
//!
//! The engine thread runs a cooperative PREPARE/CHECK → DISPATCH loop: it
//! sleeps until the PCM driver predicts writability or a job push wakes it,
//! then writes the pending block, applies jobs, rebuilds the schedule if
//! needed, renders the next block, and hands finished job nodes to the
//! owner for deallocation. Nothing on the render path allocates, blocks, or
//! takes a lock.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::capture::{start_capture, CaptureBlock, CaptureTap, CaptureWriter};
use crate::driver::{open_pcm, DriverDir, DriverPrefs, MidiDriver, PcmDriver, PcmDriverConfig};
use crate::error::CaptureResult;
use crate::graph::{flags, NodeTable, ProcessorId};
use crate::jobs::{AtomicStack, Job, JobFlavor, JobFn};
use crate::midi::EngineMidiInput;
use crate::notes::{ChangeMask, ChangeNode, EngineObserver, NoteFlags, NoteNode, UserNote};
use crate::processor::{AudioProcessor, OBusId, SpeakerArrangement, MAIN_OBUS};
use crate::schedule::Schedule;
use crate::transport::{TimeSignature, Transport};
use crate::types::{BlockBuffer, BLOCK_SIZE, INTERLEAVED_BLOCK, SAMPLE_RATE};

/// Condvar-backed wakeup for the engine loop.
///
/// The loop's only suspension point sleeps here, bounded by the PCM
/// driver's predicted deadline. Job pushes that turn a queue non-empty,
/// driver callbacks after consuming frames, and `wakeup_thread_mt` all
/// notify it.
pub struct LoopWaker {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl LoopWaker {
    fn new() -> Self {
        Self { pending: Mutex::new(false), cond: Condvar::new() }
    }

    /// Wake the engine loop (callable from any thread).
    pub fn notify(&self) {
        let mut pending = self.pending.lock().unwrap();
        *pending = true;
        self.cond.notify_one();
    }

    /// Sleep until notified or `timeout` elapses; consumes the pending flag.
    fn wait(&self, timeout: Option<Duration>) {
        let mut pending = self.pending.lock().unwrap();
        if !*pending {
            pending = match timeout {
                Some(t) => self.cond.wait_timeout(pending, t).unwrap().0,
                None => self.cond.wait(pending).unwrap(),
            };
        }
        *pending = false;
    }
}

/// State shared between the owner, the engine thread, and driver callbacks.
pub(crate) struct EngineShared {
    pub async_jobs: AtomicStack<Job>,
    pub const_jobs: AtomicStack<Job>,
    pub trash: AtomicStack<Job>,
    pub user_notes: AtomicStack<NoteNode>,
    pub changes: AtomicStack<ChangeNode>,
    pub waker: Arc<LoopWaker>,
    pub running: AtomicBool,
    pub quit: AtomicBool,
    /// Mirror of the engine's render stamp, readable from any thread.
    pub frame_counter: AtomicU64,
    pub autostop: AtomicU64,
    pub autostop_hit: AtomicBool,
    /// Underruns counted by driver callbacks; sampled each dispatch.
    pub xruns: Arc<AtomicU64>,
    pub next_id: AtomicU32,
    /// Holds the core while the engine thread is not running, so jobs can
    /// execute inline.
    pub parked_core: Mutex<Option<Box<EngineCore>>>,
    /// Owner wakeup, installed by `start_threads` (cold-path use only).
    pub wakeup_cb: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl EngineShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            async_jobs: AtomicStack::new(),
            const_jobs: AtomicStack::new(),
            trash: AtomicStack::new(),
            user_notes: AtomicStack::new(),
            changes: AtomicStack::new(),
            waker: Arc::new(LoopWaker::new()),
            running: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            frame_counter: AtomicU64::new(BLOCK_SIZE as u64),
            autostop: AtomicU64::new(u64::MAX),
            autostop_hit: AtomicBool::new(false),
            xruns: Arc::new(AtomicU64::new(0)),
            next_id: AtomicU32::new(0),
            parked_core: Mutex::new(None),
            wakeup_cb: Mutex::new(None),
        })
    }

    pub fn ipc_pending(&self) -> bool {
        !self.trash.is_empty() || !self.user_notes.is_empty() || !self.changes.is_empty()
    }

    /// Queue a note from a non-engine thread and wake the owner.
    pub fn queue_user_note_mt(&self, note: UserNote) {
        self.user_notes.push(NoteNode::new(note));
        if let Some(cb) = self.wakeup_cb.lock().unwrap().clone() {
            cb();
        }
    }
}

/// Handle to one of the engine's three logical job queues.
///
/// Cloneable and sendable; submissions are lock-free. When the engine
/// thread is not running the callable executes inline on the caller.
#[derive(Clone)]
pub struct JobQueue {
    shared: Arc<EngineShared>,
    flavor: JobFlavor,
}

impl JobQueue {
    /// Submit a job. Blocking flavors return after the callable has run on
    /// the engine thread.
    pub fn add(&self, f: impl FnMut(&mut EngineCore) + Send + 'static) {
        self.add_boxed(Box::new(f));
    }

    pub fn add_boxed(&self, func: JobFn) {
        let mut func = func;
        if !self.shared.running.load(Ordering::Acquire) {
            // Engine thread not running: execute inline. The core is moved
            // out of the mutex for the call so jobs submitting further jobs
            // cannot deadlock on it.
            let taken = self.shared.parked_core.lock().unwrap().take();
            if let Some(mut core) = taken {
                func(&mut core);
                self.shared.parked_core.lock().unwrap().replace(core);
                return;
            }
            // Thread is mid-start; fall through and enqueue.
        }

        match self.flavor {
            JobFlavor::Async => {
                if self.shared.async_jobs.push(Job::new(func, None)) {
                    self.shared.waker.notify();
                }
            }
            JobFlavor::Const => self.add_blocking(&self.shared.const_jobs, func),
            // Synchronized jobs ride the async stack so they run in the
            // pre-render phase; only the completion handshake differs.
            JobFlavor::Synchronized => self.add_blocking(&self.shared.async_jobs, func),
        }
    }

    fn add_blocking(&self, stack: &AtomicStack<Job>, func: JobFn) {
        let (done_tx, done_rx) = mpsc::sync_channel::<()>(1);
        if stack.push(Job::new(func, Some(done_tx))) {
            self.shared.waker.notify();
        }
        // If the job is ever freed unexecuted the sender drops and this
        // unblocks with an error instead of hanging.
        let _ = done_rx.recv();
    }
}

/// Engine-thread state: the node table, schedule, transport, interleave
/// buffer, and the PCM driver.
///
/// Owned exclusively by the engine thread while it runs; jobs receive
/// `&mut EngineCore` and are the only sanctioned mutation point.
pub struct EngineCore {
    shared: Arc<EngineShared>,
    pub(crate) nodes: NodeTable,
    oprocs: Vec<ProcessorId>,
    schedule: Schedule,
    transport: Transport,
    out_buffer: BlockBuffer,
    /// Frames rendered so far; always `write_stamp` or one block ahead.
    render_stamp: u64,
    /// Frames handed to the PCM driver.
    write_stamp: u64,
    pcm: Box<dyn PcmDriver>,
    midi_input: ProcessorId,
    pub(crate) capture: Option<CaptureTap>,
    owner_wakeup: Arc<dyn Fn() + Send + Sync>,
    last_xruns: u64,
}

impl EngineCore {
    fn new(shared: Arc<EngineShared>) -> Box<Self> {
        let pcm = open_pcm("null", DriverDir::WriteOnly, &PcmDriverConfig::default())
            .expect("null PCM driver must always open");

        let mut core = Box::new(Self {
            shared: shared.clone(),
            nodes: NodeTable::new(),
            oprocs: Vec::with_capacity(16),
            schedule: Schedule::new(),
            transport: Transport::new(SAMPLE_RATE),
            out_buffer: BlockBuffer::new(),
            render_stamp: BLOCK_SIZE as u64,
            write_stamp: 0,
            pcm,
            midi_input: ProcessorId(0),
            capture: None,
            owner_wakeup: Arc::new(|| {}),
            last_xruns: 0,
        });

        // The MIDI input processor is built in: it must render every block
        // to drain driver queues, so it joins the output list even though it
        // has no audio buses.
        let midi_id = ProcessorId(shared.next_id.fetch_add(1, Ordering::Relaxed));
        core.midi_input = midi_id;
        core.add_processor_boxed(midi_id, Box::new(EngineMidiInput::new()));
        core.enable_output(midi_id, true);
        core
    }

    // == accessors usable from jobs ==

    #[inline]
    pub fn frame_counter(&self) -> u64 {
        self.render_stamp
    }

    #[inline]
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// The built-in MIDI input processor.
    #[inline]
    pub fn midi_input(&self) -> ProcessorId {
        self.midi_input
    }

    /// Mutable access to a processor, for parameter jobs.
    pub fn processor_mut(&mut self, id: ProcessorId) -> Option<&mut dyn AudioProcessor> {
        self.nodes.get_mut(id)?.proc.as_deref_mut()
    }

    pub fn set_transport_running(&mut self, running: bool) {
        self.transport.set_running(running);
    }

    pub fn set_tempo(&mut self, bpm: f64, signature: TimeSignature) {
        self.transport.set_tempo(bpm, signature);
    }

    /// Mark the schedule for a rebuild before the next rendered block.
    pub fn schedule_queue_update(&mut self) {
        self.schedule.invalidate();
    }

    // == graph mutation (jobs only) ==

    pub fn add_processor_boxed(&mut self, id: ProcessorId, mut proc: Box<dyn AudioProcessor>) {
        proc.initialize(SpeakerArrangement::Stereo);
        self.nodes.insert(id, proc);
        if let Some(node) = self.nodes.get_mut(id) {
            node.flags |= flags::INITIALIZED;
        }
        self.notify_change(id, ChangeMask::INSERTION);
    }

    /// Drop a processor on the engine thread. Output membership and inbound
    /// links are cleaned up first.
    pub fn remove_processor(&mut self, id: ProcessorId) {
        self.enable_output(id, false);
        self.nodes.purge_links(id);
        self.nodes.remove(id);
        self.schedule.invalidate();
        self.notify_change(id, ChangeMask::REMOVAL);
    }

    pub fn connect(&mut self, dst: ProcessorId, islot: usize, src: ProcessorId, obus: OBusId) {
        self.nodes.connect(dst, islot, src, obus);
        self.schedule.invalidate();
        self.notify_change(dst, ChangeMask::BUSES);
    }

    pub fn connect_events(&mut self, dst: ProcessorId, src: ProcessorId) {
        self.nodes.connect_events(dst, src);
        self.schedule.invalidate();
        self.notify_change(dst, ChangeMask::BUSES);
    }

    /// Add or remove a processor from the engine's output mix.
    pub fn enable_output(&mut self, id: ProcessorId, onoff: bool) {
        let Some(node) = self.nodes.get_mut(id) else { return };
        if onoff && node.flags & flags::ENGINE_OUTPUT == 0 {
            node.flags |= flags::ENGINE_OUTPUT;
            self.oprocs.push(id);
            self.schedule.invalidate();
        } else if !onoff && node.flags & flags::ENGINE_OUTPUT != 0 {
            node.flags &= !flags::ENGINE_OUTPUT;
            self.oprocs.retain(|&p| p != id);
            self.schedule.invalidate();
        }
    }

    /// Install a PCM driver, returning the replaced one. The caller (a
    /// synchronized job) parks the old driver so it drops on the owner.
    pub fn install_pcm_driver(&mut self, mut driver: Box<dyn PcmDriver>) -> Box<dyn PcmDriver> {
        driver.set_waker(self.shared.waker.clone());
        driver.set_xrun_counter(self.shared.xruns.clone());
        log::info!("PCM driver installed: {}", driver.devid());
        std::mem::replace(&mut self.pcm, driver)
    }

    // == engine -> owner notifications ==

    pub fn queue_user_note(&mut self, note: UserNote) {
        if self.shared.user_notes.push(NoteNode::new(note)) {
            (self.owner_wakeup)();
        }
    }

    pub fn notify_change(&mut self, id: ProcessorId, mask: ChangeMask) {
        self.shared.changes.push(ChangeNode::new(id, mask));
    }

    // == dispatcher ==

    /// PREPARE/CHECK: true when DISPATCH has work; otherwise
    /// `timeout_usecs` holds the predicted sleep.
    fn check_ready(&mut self, timeout_usecs: &mut i64) -> bool {
        if !self.shared.const_jobs.is_empty() || !self.shared.async_jobs.is_empty() {
            return true;
        }
        if self.render_stamp <= self.write_stamp {
            return true;
        }
        self.pcm.check_io(timeout_usecs) || *timeout_usecs == 0
    }

    /// One DISPATCH pass; see the module docs for the phase order.
    pub(crate) fn dispatch(&mut self) {
        self.sample_xruns();
        self.check_driver_shutdown();

        self.pcm_try_write();
        if self.render_stamp <= self.write_stamp {
            // Pre-render phase: async and synchronized jobs become visible
            // to the block about to render.
            self.process_jobs(JobFlavor::Async);
            if self.schedule.is_invalid() {
                self.schedule.rebuild(&mut self.nodes, &self.oprocs, self.render_stamp);
            }
            self.render_block();
            self.pcm_try_write();
        } else if !self.shared.async_jobs.is_empty() {
            self.process_jobs(JobFlavor::Async);
        }

        if !self.shared.const_jobs.is_empty() {
            // Const callers must observe a settled graph: drain async first.
            self.process_jobs(JobFlavor::Async);
            self.process_jobs(JobFlavor::Const);
        }

        if self.shared.ipc_pending() {
            (self.owner_wakeup)();
        }
    }

    /// Execute one queue in submission order and route the spent nodes to
    /// the trash stack for owner-side deallocation.
    pub(crate) fn process_jobs(&mut self, flavor: JobFlavor) -> bool {
        let mut chain = match flavor {
            JobFlavor::Const => self.shared.const_jobs.pop_reversed(),
            _ => self.shared.async_jobs.pop_reversed(),
        };
        if chain.is_empty() {
            return false;
        }
        chain.for_each_mut(|job| job.execute(self));
        if self.shared.trash.push_chain(chain) {
            (self.owner_wakeup)();
        }
        true
    }

    /// Push the current interleave buffer to the PCM driver if a block is
    /// owed and the driver can take it.
    fn pcm_try_write(&mut self) {
        let mut timeout_usecs = i64::MAX;
        let can_write = self.pcm.check_io(&mut timeout_usecs) || timeout_usecs == 0;
        if !can_write || self.write_stamp >= self.render_stamp {
            return;
        }

        self.pcm.write(self.out_buffer.as_interleaved());

        let autostop = self.shared.autostop.load(Ordering::Relaxed);
        if let Some(tap) = self.capture.as_mut() {
            if (!tap.needs_running || self.transport.running()) && self.write_stamp < autostop {
                let mut block = CaptureBlock([0.0; INTERLEAVED_BLOCK]);
                block.0.copy_from_slice(self.out_buffer.as_interleaved());
                tap.feed(&block);
            }
        }

        self.write_stamp += BLOCK_SIZE as u64;
        debug_assert_eq!(self.write_stamp, self.render_stamp);

        if self.write_stamp >= autostop && !self.shared.autostop_hit.swap(true, Ordering::AcqRel) {
            (self.owner_wakeup)();
        }
    }

    /// Render one block: every schedule layer in order, then the output mix.
    fn render_block(&mut self) {
        let target = self.render_stamp + BLOCK_SIZE as u64;

        for layer in 0..self.schedule.n_layers() {
            let mut cur = self.schedule.layer_head(layer);
            while let Some(id) = cur {
                cur = self.nodes.get(id).and_then(|n| n.sched_next);
                self.nodes.render_node(id, target, &self.transport);
            }
        }

        // Interleave output processors: first one stores, the rest sum.
        let mut n_mixed = 0;
        for idx in 0..self.oprocs.len() {
            let id = self.oprocs[idx];
            let Some(proc) = self.nodes.get(id).and_then(|n| n.proc.as_deref()) else {
                continue;
            };
            if proc.n_obuses() == 0 {
                continue;
            }
            let n_channels = proc.n_ochannels(MAIN_OBUS);
            if n_channels == 0 {
                continue;
            }
            let left = proc.ofloats(MAIN_OBUS, 0);
            let right = (n_channels >= 2).then(|| proc.ofloats(MAIN_OBUS, 1));
            if n_mixed == 0 {
                self.out_buffer.store(left, right);
            } else {
                self.out_buffer.sum(left, right);
            }
            n_mixed += 1;
        }
        if n_mixed == 0 {
            self.out_buffer.fill_silence();
        }

        self.render_stamp = target;
        self.shared.frame_counter.store(target, Ordering::Release);
        self.transport.advance(BLOCK_SIZE as u64);
    }

    /// Emit a note when driver callbacks reported new underruns.
    fn sample_xruns(&mut self) {
        let total = self.shared.xruns.load(Ordering::Relaxed);
        if total != self.last_xruns {
            let new = total - self.last_xruns;
            self.last_xruns = total;
            log::warn!("audio xruns: {new} new, {total} total");
            self.queue_user_note(UserNote::new(
                "pcm-driver",
                NoteFlags::Clear,
                format!("Audio dropouts detected: {total} total ({new} new)"),
            ));
        }
    }

    /// A backend that dropped its connection gets replaced by the null
    /// driver; the engine keeps running.
    fn check_driver_shutdown(&mut self) {
        if !self.pcm.take_shutdown() {
            return;
        }
        let devid = self.pcm.devid().to_string();
        log::error!("PCM driver shut down: {devid}");
        self.queue_user_note(UserNote::new(
            "pcm-driver",
            NoteFlags::Clear,
            format!("# Audio I/O Error\nAudio device disconnected:\n{devid}"),
        ));
        let null = open_pcm("null", DriverDir::WriteOnly, &PcmDriverConfig::default())
            .expect("null PCM driver must always open");
        let old = self.install_pcm_driver(null);
        // Park the dead driver in an unexecuted job node pushed straight to
        // trash: the owner frees it, so its teardown never runs here.
        let parked = Some(old);
        let node = Job::new(
            Box::new(move |_core: &mut EngineCore| {
                let _ = &parked;
            }),
            None,
        );
        if self.shared.trash.push(node) {
            (self.owner_wakeup)();
        }
    }

    /// Run queued jobs to completion during shutdown so blocking
    /// submitters are released.
    fn drain_remaining_jobs(&mut self) {
        loop {
            let ran_async = self.process_jobs(JobFlavor::Async);
            let ran_const = self.process_jobs(JobFlavor::Const);
            if !ran_async && !ran_const {
                break;
            }
        }
    }
}

/// Engine thread entry: the cooperative event loop.
fn run(mut core: Box<EngineCore>) -> Box<EngineCore> {
    log::info!("engine thread running ({} Hz, {}-frame blocks)", SAMPLE_RATE, BLOCK_SIZE);
    let waker = core.shared.waker.clone();
    loop {
        if core.shared.quit.load(Ordering::Acquire) {
            core.drain_remaining_jobs();
            break;
        }
        let mut timeout_usecs = i64::MAX;
        if core.check_ready(&mut timeout_usecs) {
            core.dispatch();
        } else {
            let timeout = (timeout_usecs != i64::MAX)
                .then(|| Duration::from_micros(timeout_usecs.max(0) as u64));
            waker.wait(timeout);
        }
    }
    log::info!("engine thread stopped at frame {}", core.render_stamp);
    core
}

/// Owner-side handle to the engine.
///
/// Construction opens the null PCM driver and creates the built-in MIDI
/// input processor; `start_threads` brings up the render loop.
pub struct AudioEngine {
    shared: Arc<EngineShared>,
    thread: Option<JoinHandle<Box<EngineCore>>>,
    capture_writer: Option<CaptureWriter>,
    /// Device ids of the MIDI drivers currently staged in the engine.
    midi_devids: Vec<String>,
    /// Device id of the installed PCM driver ("null" for the fallback).
    pcm_devid: String,
    /// The built-in MIDI input processor.
    event_source: ProcessorId,
}

impl AudioEngine {
    pub fn new() -> Self {
        let shared = EngineShared::new();
        let core = EngineCore::new(shared.clone());
        let event_source = core.midi_input();
        *shared.parked_core.lock().unwrap() = Some(core);
        Self {
            shared,
            thread: None,
            capture_writer: None,
            midi_devids: Vec::new(),
            pcm_devid: "null".into(),
            event_source,
        }
    }

    /// The processor providing MIDI device events; connect other
    /// processors' event inputs to it.
    pub fn event_source(&self) -> ProcessorId {
        self.event_source
    }

    // == job queues ==

    pub fn async_jobs(&self) -> JobQueue {
        JobQueue { shared: self.shared.clone(), flavor: JobFlavor::Async }
    }

    pub fn const_jobs(&self) -> JobQueue {
        JobQueue { shared: self.shared.clone(), flavor: JobFlavor::Const }
    }

    pub fn synchronized_jobs(&self) -> JobQueue {
        JobQueue { shared: self.shared.clone(), flavor: JobFlavor::Synchronized }
    }

    // == execution ==

    /// Start the engine thread. `wakeup` is invoked (from the engine) when
    /// IPC is pending; the owner must then call `ipc_dispatch` on its own
    /// thread.
    pub fn start_threads(&mut self, wakeup: impl Fn() + Send + Sync + 'static) {
        assert!(self.thread.is_none(), "engine thread already running");
        let wakeup: Arc<dyn Fn() + Send + Sync> = Arc::new(wakeup);
        *self.shared.wakeup_cb.lock().unwrap() = Some(wakeup.clone());

        let mut core = self
            .shared
            .parked_core
            .lock()
            .unwrap()
            .take()
            .expect("engine core missing");
        core.owner_wakeup = wakeup;
        core.schedule.reserve();
        core.schedule_queue_update();

        self.shared.quit.store(false, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);

        let (ready_tx, ready_rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("cadenza-engine".into())
            .spawn(move || {
                ready_tx.send(()).expect("engine start handshake failed");
                run(core)
            })
            .expect("failed to spawn engine thread");
        ready_rx.recv().expect("engine thread died during startup");
        self.thread = Some(handle);
    }

    /// Stop the engine thread cooperatively; pending jobs run to completion.
    pub fn stop_threads(&mut self) {
        let Some(handle) = self.thread.take() else { return };
        self.shared.quit.store(true, Ordering::Release);
        self.shared.waker.notify();
        let mut core = handle.join().expect("engine thread panicked");
        self.shared.running.store(false, Ordering::Release);

        // Jobs that raced past the engine's shutdown drain run here.
        loop {
            let ran_async = core.process_jobs(JobFlavor::Async);
            let ran_const = core.process_jobs(JobFlavor::Const);
            if !ran_async && !ran_const {
                break;
            }
        }
        core.owner_wakeup = Arc::new(|| {});
        *self.shared.parked_core.lock().unwrap() = Some(core);
        *self.shared.wakeup_cb.lock().unwrap() = None;
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Wake the engine loop from any thread.
    pub fn wakeup_thread_mt(&self) {
        self.shared.waker.notify();
    }

    // == graph ==

    /// Hand a processor to the engine; it is initialized and inserted
    /// before the next rendered block.
    pub fn add_processor(&self, proc: Box<dyn AudioProcessor>) -> ProcessorId {
        let id = ProcessorId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let mut slot = Some(proc);
        self.async_jobs().add(move |core| {
            if let Some(proc) = slot.take() {
                core.add_processor_boxed(id, proc);
            }
        });
        id
    }

    /// Remove and drop a processor (on the engine thread).
    pub fn remove_processor(&self, id: ProcessorId) {
        self.async_jobs().add(move |core| core.remove_processor(id));
    }

    pub fn connect(&self, dst: ProcessorId, islot: usize, src: ProcessorId, obus: OBusId) {
        self.async_jobs().add(move |core| core.connect(dst, islot, src, obus));
    }

    pub fn connect_events(&self, dst: ProcessorId, src: ProcessorId) {
        self.async_jobs().add(move |core| core.connect_events(dst, src));
    }

    pub fn enable_output(&self, id: ProcessorId, onoff: bool) {
        self.async_jobs().add(move |core| core.enable_output(id, onoff));
    }

    pub fn schedule_queue_update(&self) {
        self.async_jobs().add(|core| core.schedule_queue_update());
    }

    // == transport / state ==

    /// Frames rendered so far (atomic mirror of the engine's stamp).
    pub fn frame_counter(&self) -> u64 {
        self.shared.frame_counter.load(Ordering::Acquire)
    }

    pub fn set_transport_running(&self, running: bool) {
        self.async_jobs().add(move |core| core.set_transport_running(running));
    }

    pub fn set_tempo(&self, bpm: f64, signature: TimeSignature) {
        self.async_jobs().add(move |core| core.set_tempo(bpm, signature));
    }

    /// Stop feeding capture and raise the autostop event once `frames`
    /// frames have been delivered. `u64::MAX` disables.
    pub fn set_autostop(&self, frames: u64) {
        self.shared.autostop.store(frames, Ordering::Relaxed);
        self.shared.autostop_hit.store(false, Ordering::Release);
    }

    /// True once after the autostop mark was reached.
    pub fn take_autostop(&self) -> bool {
        self.shared.autostop_hit.swap(false, Ordering::AcqRel)
    }

    /// Total xruns counted by driver callbacks.
    pub fn xrun_count(&self) -> u64 {
        self.shared.xruns.load(Ordering::Relaxed)
    }

    // == capture ==

    /// Start capturing delivered blocks to `path` (`.wav` or `.flac`).
    ///
    /// With `needs_running`, blocks are only written while the transport
    /// runs. Errors are returned and also surfaced as a `capture` note.
    pub fn queue_capture_start(
        &mut self,
        path: impl AsRef<std::path::Path>,
        needs_running: bool,
    ) -> CaptureResult<()> {
        let path = path.as_ref();
        self.queue_capture_stop();

        let shared = self.shared.clone();
        let notify = Box::new(move |note: UserNote| shared.queue_user_note_mt(note));
        match start_capture(path, needs_running, notify) {
            Ok((tap, writer)) => {
                self.capture_writer = Some(writer);
                let mut slot = Some(tap);
                self.async_jobs().add(move |core| {
                    core.capture = slot.take();
                });
                Ok(())
            }
            Err(e) => {
                self.shared.queue_user_note_mt(UserNote::new(
                    "capture",
                    NoteFlags::Clear,
                    format!("# Capture Error\nCannot capture to:\n{}:\n{}", path.display(), e),
                ));
                Err(e)
            }
        }
    }

    /// Detach the capture tap, close the sink, and wait for the file to be
    /// finalized.
    pub fn queue_capture_stop(&mut self) {
        // A const job hands the tap back; dropping it here (owner thread)
        // closes the channel so the writer can finalize.
        let parked: Arc<Mutex<Option<CaptureTap>>> = Arc::new(Mutex::new(None));
        let parked_in_job = parked.clone();
        self.const_jobs().add(move |core| {
            *parked_in_job.lock().unwrap() = core.capture.take();
        });
        if let Some(tap) = parked.lock().unwrap().take() {
            if tap.dropped > 0 {
                log::warn!("capture dropped {} blocks (writer too slow)", tap.dropped);
            }
        }
        if let Some(writer) = self.capture_writer.take() {
            let path = writer.path.clone();
            if writer.thread.join().is_err() {
                log::error!("capture writer panicked for {}", path.display());
            }
        }
    }

    // == drivers ==

    /// Install a PCM driver via a synchronized job. The replaced driver is
    /// parked in the job node and dropped on the owner in `ipc_dispatch`.
    pub fn set_pcm_driver(&mut self, driver: Box<dyn PcmDriver>) {
        self.pcm_devid = driver.devid().to_string();
        let mut slot = Some(driver);
        let mut parked: Option<Box<dyn PcmDriver>> = None;
        self.synchronized_jobs().add(move |core| {
            if let Some(new) = slot.take() {
                parked = Some(core.install_pcm_driver(new));
            }
        });
    }

    /// Reconcile the installed drivers with `prefs`.
    ///
    /// With `fullio` false only the fallback state is ensured. Otherwise
    /// the preferred PCM device is opened (falling back to null with a user
    /// note on failure) and the MIDI driver set is diffed: matching devices
    /// are reused, new ones opened, and the new vector installed inside a
    /// synchronized job so the old drivers close on this thread.
    pub fn update_drivers(&mut self, prefs: &DriverPrefs, fullio: bool) {
        if !fullio {
            return;
        }
        let config = PcmDriverConfig::default();

        // PCM output: only ever upgrade away from the null fallback.
        if self.pcm_devid == "null" && prefs.pcm_driver != "null" {
            match open_pcm(&prefs.pcm_driver, DriverDir::WriteOnly, &config) {
                Ok(driver) => self.set_pcm_driver(driver),
                Err(e) => {
                    log::warn!("failed to open PCM driver {}: {}", prefs.pcm_driver, e);
                    self.shared.queue_user_note_mt(UserNote::new(
                        "pcm-driver",
                        NoteFlags::Clear,
                        format!(
                            "# Audio I/O Error\nFailed to open audio device:\n{}:\n{}",
                            prefs.pcm_driver, e
                        ),
                    ));
                }
            }
        }

        // MIDI inputs: reuse running drivers, open the rest.
        let mut midi_errors = 0;
        let mut note_midi_error = |devid: &str, nth: usize, err: String| {
            let flags = if midi_errors == 0 { NoteFlags::Clear } else { NoteFlags::Append };
            midi_errors += 1;
            log::warn!("failed to open MIDI device #{nth} {devid}: {err}");
            self.shared.queue_user_note_mt(UserNote::new(
                "midi-driver",
                flags,
                format!("## MIDI I/O Failure\nFailed to open MIDI device #{nth}:\n{devid}:\n{err}"),
            ));
        };

        let mut new_devids: Vec<String> = Vec::new();
        let mut fresh: Vec<(String, Box<dyn MidiDriver>)> = Vec::new();
        for (nth, devid) in prefs.midi_drivers.iter().enumerate() {
            if devid == "null" {
                continue;
            }
            if new_devids.iter().any(|d| d == devid) {
                note_midi_error(devid, nth + 1, "device busy".into());
                continue;
            }
            if self.midi_devids.iter().any(|d| d == devid) {
                new_devids.push(devid.clone());
                continue;
            }
            match crate::driver::open_midi(devid) {
                Ok(driver) => {
                    fresh.push((devid.clone(), driver));
                    new_devids.push(devid.clone());
                }
                Err(e) => note_midi_error(devid, nth + 1, e.to_string()),
            }
        }

        if new_devids != self.midi_devids || !fresh.is_empty() {
            self.swap_midi_drivers_sync(new_devids.clone(), fresh);
            self.midi_devids = new_devids;
        }
    }

    /// Stage a MIDI driver list and swap it into the built-in MIDI input
    /// processor inside a synchronized job. Drivers removed from the list
    /// stay captured by the job closure and close here, on the owner, when
    /// the trash drains.
    fn swap_midi_drivers_sync(
        &self,
        order: Vec<String>,
        mut fresh: Vec<(String, Box<dyn MidiDriver>)>,
    ) {
        let mut parked: Vec<Box<dyn MidiDriver>> = Vec::new();
        self.synchronized_jobs().add(move |core| {
            let midi_id = core.midi_input();
            let Some(input) = core
                .processor_mut(midi_id)
                .and_then(|p| p.as_any_mut().downcast_mut::<EngineMidiInput>())
            else {
                return;
            };

            let mut old: Vec<Box<dyn MidiDriver>> = Vec::new();
            input.swap_drivers(&mut old);
            let mut staged: Vec<Box<dyn MidiDriver>> = Vec::with_capacity(order.len());
            for devid in &order {
                if let Some(pos) = old.iter().position(|d| d.devid() == devid.as_str()) {
                    staged.push(old.remove(pos));
                } else if let Some(pos) = fresh.iter().position(|(id, _)| id == devid) {
                    staged.push(fresh.remove(pos).1);
                }
            }
            input.swap_drivers(&mut staged);
            // `staged` is now the empty previous vector; dropped drivers
            // wait in `parked` until the owner frees this job node.
            parked.append(&mut old);
        });
    }

    /// Install an explicit MIDI driver list, bypassing the registry. Uses
    /// the same synchronized swap as `update_drivers`.
    pub fn set_midi_drivers(&mut self, drivers: Vec<Box<dyn MidiDriver>>) {
        let pairs: Vec<(String, Box<dyn MidiDriver>)> = drivers
            .into_iter()
            .map(|d| (d.devid().to_string(), d))
            .collect();
        let order: Vec<String> = pairs.iter().map(|(id, _)| id.clone()).collect();
        self.swap_midi_drivers_sync(order.clone(), pairs);
        self.midi_devids = order;
    }

    /// Device ids of the currently installed MIDI drivers.
    pub fn midi_devids(&self) -> &[String] {
        &self.midi_devids
    }

    /// Device id of the installed PCM driver.
    pub fn pcm_devid(&self) -> &str {
        &self.pcm_devid
    }

    // == IPC ==

    /// True when user notes, trash, or change notifications are queued.
    pub fn ipc_pending(&self) -> bool {
        self.shared.ipc_pending()
    }

    /// Drain engine-to-owner traffic: user notes, then trash, then change
    /// notifications (folded per processor).
    pub fn ipc_dispatch(&mut self, observer: &mut dyn EngineObserver) {
        let mut notes = self.shared.user_notes.pop_reversed();
        while let Some(node) = notes.pop() {
            observer.user_note(node.note.clone());
        }

        // Freeing trash here is the whole point: captured state (processor
        // boxes, driver vectors, capture senders) drops on this thread.
        drop(self.shared.trash.pop_all());

        let mut changes = self.shared.changes.pop_reversed();
        let mut folded: Vec<(ProcessorId, ChangeMask)> = Vec::new();
        while let Some(node) = changes.pop() {
            match folded.iter_mut().find(|(id, _)| *id == node.proc) {
                Some((_, mask)) => *mask = mask.union(node.mask),
                None => folded.push((node.proc, node.mask)),
            }
        }
        for (id, mask) in folded {
            observer.processor_changed(id, mask);
        }
    }
}

impl Default for AudioEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop_threads();
        }
        // Release the capture tap (held inside the parked core) before
        // joining the writer, or the join would wait forever.
        if let Some(core) = self.shared.parked_core.lock().unwrap().as_mut() {
            core.capture = None;
        }
        if let Some(writer) = self.capture_writer.take() {
            let _ = writer.thread.join();
        }
    }
}
