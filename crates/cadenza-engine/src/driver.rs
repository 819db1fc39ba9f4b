//! Audio and MIDI driver capability interfaces plus the driver registry.
//!
//! A driver is an opaque handle to a backend device. The engine owns at most
//! one PCM driver (falling back to the always-available null driver) and a
//! list of MIDI drivers. Backends register a kind in the process-global
//! registry; devices are addressed as `"kind"` or `"kind=device"`.

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crate::engine::LoopWaker;
use crate::error::{DriverError, DriverResult};
use crate::midi::MidiEventStream;
use crate::types::{Sample, BLOCK_SIZE, SAMPLE_RATE};

/// Transfer direction requested at PCM open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverDir {
    ReadOnly,
    WriteOnly,
    Duplex,
}

/// Configuration handed to a PCM backend at open.
#[derive(Debug, Clone)]
pub struct PcmDriverConfig {
    pub n_channels: usize,
    /// Mixing frequency in Hz; the engine always asks for 48 kHz.
    pub mix_freq: u32,
    /// Desired total buffering in milliseconds.
    pub latency_ms: u32,
    /// Engine block length in frames.
    pub block_length: usize,
}

impl Default for PcmDriverConfig {
    fn default() -> Self {
        Self {
            n_channels: crate::types::N_CHANNELS,
            mix_freq: SAMPLE_RATE,
            latency_ms: 8,
            block_length: BLOCK_SIZE,
        }
    }
}

/// Buffered frame counts on either side of a PCM driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct PcmLatency {
    pub read_frames: usize,
    pub write_frames: usize,
}

/// Engine-side handle to a PCM output backend.
///
/// `check_io` and `write` are called from the engine thread only; the
/// backend's own callback threads communicate through the driver's internal
/// ring buffer.
pub trait PcmDriver: Send {
    /// Device id this driver was opened with.
    fn devid(&self) -> &str;

    /// True when a full engine block can be transferred right now.
    /// Otherwise `timeout_usecs` is set to the predicted wait.
    fn check_io(&mut self, timeout_usecs: &mut i64) -> bool;

    /// Hand one engine block of interleaved samples to the device.
    fn write(&mut self, interleaved: &[Sample]);

    /// Pull captured input frames; backends without capture leave silence.
    fn read(&mut self, interleaved: &mut [Sample]) -> usize {
        interleaved.fill(0.0);
        0
    }

    /// Frames per device period.
    fn block_length(&self) -> usize;

    /// Device rate in Hz.
    fn frequency(&self) -> u32;

    fn latency(&self) -> PcmLatency {
        PcmLatency::default()
    }

    /// Install the engine waker so device callbacks can re-arm the loop.
    fn set_waker(&mut self, waker: Arc<LoopWaker>) {
        let _ = waker;
    }

    /// Share the engine's xrun counter with the backend callback.
    fn set_xrun_counter(&mut self, counter: Arc<AtomicU64>) {
        let _ = counter;
    }

    /// True once if the backend dropped the connection; the engine then
    /// falls back to the null driver.
    fn take_shutdown(&mut self) -> bool {
        false
    }

    /// True for the discard-everything fallback driver.
    fn is_null(&self) -> bool {
        false
    }
}

/// Engine-side handle to a MIDI input backend.
pub trait MidiDriver: Send {
    fn devid(&self) -> &str;

    /// Drain pending device events into `stream`, stamped within the
    /// upcoming block. Called once per block on the engine thread.
    fn fetch_events(&mut self, stream: &mut MidiEventStream, sample_rate: u32);
}

/// Ring-buffer frame count for a PCM driver: enough for two device periods
/// plus one engine block, or the user's requested latency, whichever is
/// larger.
pub fn pcm_ring_frames(pcm_block: usize, latency_ms: u32) -> usize {
    let by_blocks = 2 * pcm_block + BLOCK_SIZE;
    let by_latency = (latency_ms as usize * SAMPLE_RATE as usize) / 1000;
    by_blocks.max(by_latency)
}

// == Registry ==

/// User-visible device entry returned by enumeration.
#[derive(Debug, Clone)]
pub struct DriverEntry {
    /// Id accepted by `open_pcm` / `open_midi`.
    pub devid: String,
    pub device_name: String,
    /// Short capability blurb, e.g. "2 channel output".
    pub capabilities: String,
    pub device_info: String,
    /// Extra caveat shown to the user, usually empty.
    pub notice: String,
    /// Sort weight; lower is preferred. The null driver sorts last.
    pub priority: u32,
}

pub const PRIORITY_PREFERRED: u32 = 100;
pub const PRIORITY_FALLBACK: u32 = 1000;
pub const PRIORITY_NULL: u32 = u32::MAX;

// Factories receive the full devid (including the kind prefix) so drivers
// can report the exact id they were opened with.
type PcmFactory = fn(&str, DriverDir, &PcmDriverConfig) -> DriverResult<Box<dyn PcmDriver>>;
type MidiFactory = fn(&str) -> DriverResult<Box<dyn MidiDriver>>;

struct DriverKind {
    name: &'static str,
    pcm: Option<PcmFactory>,
    midi: Option<MidiFactory>,
    enumerate: fn() -> Vec<DriverEntry>,
}

fn builtin_kinds() -> &'static [DriverKind] {
    static KINDS: OnceLock<Vec<DriverKind>> = OnceLock::new();
    KINDS.get_or_init(|| {
        #[allow(unused_mut)]
        let mut kinds = vec![DriverKind {
            name: "null",
            pcm: Some(|_, _, config| Ok(Box::new(NullPcmDriver::new(config)) as Box<dyn PcmDriver>)),
            midi: None,
            enumerate: || {
                vec![DriverEntry {
                    devid: "null".into(),
                    device_name: "Null output".into(),
                    capabilities: "2 channel output, discarded".into(),
                    device_info: "Always available fallback".into(),
                    notice: String::new(),
                    priority: PRIORITY_NULL,
                }]
            },
        }];
        #[cfg(feature = "cpal-driver")]
        kinds.push(DriverKind {
            name: "cpal",
            pcm: Some(crate::drivers::cpal_pcm::open),
            midi: None,
            enumerate: crate::drivers::cpal_pcm::enumerate,
        });
        #[cfg(feature = "midir-driver")]
        kinds.push(DriverKind {
            name: "midir",
            pcm: None,
            midi: Some(crate::drivers::midir_input::open),
            enumerate: crate::drivers::midir_input::enumerate,
        });
        kinds
    })
}

fn split_devid(devid: &str) -> (&str, &str) {
    match devid.split_once('=') {
        Some((kind, rest)) => (kind, rest),
        None => (devid, ""),
    }
}

fn find_kind(name: &str) -> DriverResult<&'static DriverKind> {
    builtin_kinds()
        .iter()
        .find(|k| k.name == name)
        .ok_or_else(|| DriverError::UnknownKind(name.to_string()))
}

/// Open a PCM driver by device id (`"kind"` or `"kind=device"`).
pub fn open_pcm(
    devid: &str,
    dir: DriverDir,
    config: &PcmDriverConfig,
) -> DriverResult<Box<dyn PcmDriver>> {
    let (kind_name, _rest) = split_devid(devid);
    let kind = find_kind(kind_name)?;
    let factory = kind
        .pcm
        .ok_or_else(|| DriverError::Unsupported(format!("{kind_name} has no PCM support")))?;
    factory(devid, dir, config)
}

/// Open a MIDI input driver by device id.
pub fn open_midi(devid: &str) -> DriverResult<Box<dyn MidiDriver>> {
    let (kind_name, _rest) = split_devid(devid);
    let kind = find_kind(kind_name)?;
    let factory = kind
        .midi
        .ok_or_else(|| DriverError::Unsupported(format!("{kind_name} has no MIDI support")))?;
    factory(devid)
}

/// Split a devid into its kind and the backend-specific remainder.
#[cfg_attr(
    not(any(feature = "cpal-driver", feature = "midir-driver")),
    allow(dead_code)
)]
pub(crate) fn devid_rest(devid: &str) -> &str {
    split_devid(devid).1
}

/// Enumerate devices across every registered kind, best first.
pub fn enumerate_drivers() -> Vec<DriverEntry> {
    let mut entries: Vec<DriverEntry> =
        builtin_kinds().iter().flat_map(|k| (k.enumerate)()).collect();
    entries.sort_by_key(|e| e.priority);
    entries
}

/// Driver preferences consumed by `AudioEngine::update_drivers`.
#[derive(Debug, Clone)]
pub struct DriverPrefs {
    /// Preferred PCM device id; `"null"` keeps the fallback.
    pub pcm_driver: String,
    /// Up to four MIDI device ids; `"null"` entries are skipped.
    pub midi_drivers: [String; 4],
}

impl Default for DriverPrefs {
    fn default() -> Self {
        Self {
            pcm_driver: "null".into(),
            midi_drivers: std::array::from_fn(|_| "null".into()),
        }
    }
}

// == Null driver ==

/// Period of one engine block of wall time.
fn block_period() -> Duration {
    Duration::from_nanos(BLOCK_SIZE as u64 * 1_000_000_000 / SAMPLE_RATE as u64)
}

/// Fallback PCM driver: paces itself against the wall clock at 48 kHz and
/// discards every sample. Opening it never fails, so the engine always has
/// an output to run against.
pub struct NullPcmDriver {
    next_due: Instant,
    block_length: usize,
}

impl NullPcmDriver {
    pub fn new(config: &PcmDriverConfig) -> Self {
        Self { next_due: Instant::now(), block_length: config.block_length }
    }
}

impl PcmDriver for NullPcmDriver {
    fn devid(&self) -> &str {
        "null"
    }

    fn check_io(&mut self, timeout_usecs: &mut i64) -> bool {
        let now = Instant::now();
        if now >= self.next_due {
            true
        } else {
            *timeout_usecs = (self.next_due - now).as_micros() as i64;
            false
        }
    }

    fn write(&mut self, _interleaved: &[Sample]) {
        let now = Instant::now();
        self.next_due += block_period();
        // After a long stall (suspend, debugger) don't burst to catch up.
        if self.next_due + 4 * block_period() < now {
            self.next_due = now;
        }
    }

    fn block_length(&self) -> usize {
        self.block_length
    }

    fn frequency(&self) -> u32 {
        SAMPLE_RATE
    }

    fn is_null(&self) -> bool {
        true
    }
}
