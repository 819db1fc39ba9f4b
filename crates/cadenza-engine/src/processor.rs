//! The audio processor contract.
//!
//! A processor is one node of the render graph: it owns its output buffers,
//! renders exactly one block at a time, and reads its inputs through the
//! [`RenderContext`], which only ever exposes processors from earlier
//! scheduler layers, so inputs are always complete.
//!
//! Implementations must never allocate, block, or take locks inside
//! [`render`](AudioProcessor::render); that path runs on the real-time
//! engine thread.

use std::any::Any;

use crate::graph::RenderContext;
use crate::midi::MidiEventStream;
use crate::types::{Sample, BLOCK_SIZE};

/// Output bus index on a processor. [`MAIN_OBUS`] carries the mix signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OBusId(pub u16);

/// The bus interleaved into the engine output for output processors.
pub const MAIN_OBUS: OBusId = OBusId(0);

/// Channel layout negotiated at processor initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakerArrangement {
    Mono,
    Stereo,
}

impl SpeakerArrangement {
    #[inline]
    pub fn n_channels(&self) -> usize {
        match self {
            SpeakerArrangement::Mono => 1,
            SpeakerArrangement::Stereo => 2,
        }
    }
}

/// A node in the audio-processing graph.
///
/// Lifecycle: [`initialize`](Self::initialize) once at insertion,
/// [`reset`](Self::reset) whenever the processor joins a new schedule or the
/// engine stamp jumps, then [`render`](Self::render) at most once per block,
/// strictly after every processor it reads from.
pub trait AudioProcessor: Send + 'static {
    /// Configure buses for the given arrangement. Called once, off the
    /// render path, before the processor is first scheduled.
    fn initialize(&mut self, arrangement: SpeakerArrangement) {
        let _ = arrangement;
    }

    /// Drop voices, tails and other internal state; the next render starts
    /// from `target_stamp`.
    fn reset(&mut self, target_stamp: u64) {
        let _ = target_stamp;
    }

    /// Produce `n_frames` of output. Input buses and upstream event streams
    /// are available through `ctx` and are already up to date.
    fn render(&mut self, ctx: &RenderContext<'_>, n_frames: usize);

    /// Number of output buses.
    fn n_obuses(&self) -> usize {
        0
    }

    /// Channels on output bus `obus`.
    fn n_ochannels(&self, obus: OBusId) -> usize {
        let _ = obus;
        0
    }

    /// Read-only view of the last rendered block for one output channel.
    /// The slice is [`BLOCK_SIZE`] long.
    fn ofloats(&self, obus: OBusId, channel: usize) -> &[Sample] {
        let _ = (obus, channel);
        &[]
    }

    /// Event output stream, for processors that produce MIDI.
    fn event_output(&self) -> Option<&MidiEventStream> {
        None
    }

    fn event_output_mut(&mut self) -> Option<&mut MidiEventStream> {
        None
    }

    /// Downcast access for engine-internal processors. Implement as
    /// `fn as_any_mut(&mut self) -> &mut dyn Any { self }`.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Output-bus storage for processor implementations.
///
/// Owns one [`BLOCK_SIZE`] buffer per channel per bus, allocated up front so
/// rendering never touches the allocator.
#[derive(Debug)]
pub struct OutputBuffers {
    buses: Vec<Vec<Vec<Sample>>>,
}

impl OutputBuffers {
    /// No buses (event-only processors).
    pub fn none() -> Self {
        Self { buses: Vec::new() }
    }

    /// One bus with the given channel count.
    pub fn single(n_channels: usize) -> Self {
        Self::with_layout(&[n_channels])
    }

    /// Arbitrary bus layout, `channels_per_bus[i]` channels on bus `i`.
    pub fn with_layout(channels_per_bus: &[usize]) -> Self {
        let buses = channels_per_bus
            .iter()
            .map(|&n| (0..n).map(|_| vec![0.0; BLOCK_SIZE]).collect())
            .collect();
        Self { buses }
    }

    #[inline]
    pub fn n_obuses(&self) -> usize {
        self.buses.len()
    }

    #[inline]
    pub fn n_ochannels(&self, obus: OBusId) -> usize {
        self.buses.get(obus.0 as usize).map_or(0, Vec::len)
    }

    #[inline]
    pub fn channel(&self, obus: OBusId, channel: usize) -> &[Sample] {
        &self.buses[obus.0 as usize][channel]
    }

    #[inline]
    pub fn channel_mut(&mut self, obus: OBusId, channel: usize) -> &mut [Sample] {
        &mut self.buses[obus.0 as usize][channel]
    }

    /// Zero every channel of every bus.
    pub fn fill_silence(&mut self) {
        for bus in &mut self.buses {
            for ch in bus {
                ch.fill(0.0);
            }
        }
    }
}
