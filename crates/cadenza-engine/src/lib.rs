//! Cadenza Engine - real-time audio core for a digital audio workstation.
//!
//! A processor graph scheduled in topological layers, rendered block by
//! block on a dedicated engine thread, bridged to PCM/MIDI backends through
//! lock-free SPSC ring buffers, and controlled from a non-real-time owner
//! thread through lock-free job queues.

pub mod capture;
pub mod driver;
pub mod drivers;
pub mod engine;
pub mod error;
pub mod graph;
pub mod midi;
pub mod notes;
pub mod processor;
pub mod ring;
pub mod transport;
pub mod types;

mod jobs;
mod schedule;

pub use engine::{AudioEngine, EngineCore, JobQueue, LoopWaker};
pub use error::{CaptureError, CaptureResult, DriverError, DriverResult};
pub use graph::{ProcessorId, RenderContext};
pub use jobs::{JobFlavor, JobFn};
pub use notes::{ChangeMask, EngineObserver, NoteFlags, UserNote};
pub use processor::{AudioProcessor, OBusId, OutputBuffers, SpeakerArrangement, MAIN_OBUS};
pub use types::*;
