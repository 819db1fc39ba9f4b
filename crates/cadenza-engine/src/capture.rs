//! Capture-to-file: an opt-in tap on the engine's rendered output.
//!
//! The engine thread copies each block it delivers to the PCM driver into a
//! bounded channel; a dedicated writer thread encodes and writes. A full
//! channel drops the block and counts it; the render loop never waits for
//! the disk.
//!
//! Supported sinks: `.wav` (streaming 32-bit float) and `.flac` (16-bit,
//! encoded at finalize). `.opus` is recognized but reported unavailable.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use crate::error::{CaptureError, CaptureResult};
use crate::notes::{NoteFlags, UserNote};
use crate::types::{Sample, INTERLEAVED_BLOCK, N_CHANNELS, SAMPLE_RATE};

/// One engine block of interleaved output, shipped by value.
#[derive(Clone, Copy)]
pub(crate) struct CaptureBlock(pub [Sample; INTERLEAVED_BLOCK]);

/// Blocks buffered between the engine and the writer thread (~340 ms).
const CHANNEL_BLOCKS: usize = 64;

/// Capture format selected by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFormat {
    Wav,
    Flac,
}

impl CaptureFormat {
    /// Map a path's extension to a format.
    pub fn from_path(path: &Path) -> CaptureResult<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "wav" => Ok(Self::Wav),
            "flac" => Ok(Self::Flac),
            "opus" => Err(CaptureError::UnsupportedFormat(
                "opus encoding is not built into this engine".into(),
            )),
            other => Err(CaptureError::UnsupportedFormat(format!(".{other}"))),
        }
    }
}

/// A file encoder consuming interleaved stereo blocks.
trait CaptureSink: Send {
    fn write_block(&mut self, interleaved: &[Sample]) -> CaptureResult<()>;
    fn finalize(self: Box<Self>) -> CaptureResult<()>;
}

/// Streaming 32-bit float WAV writer.
struct WavSink {
    writer: hound::WavWriter<BufWriter<File>>,
}

impl WavSink {
    fn create(path: &Path) -> CaptureResult<Self> {
        let spec = hound::WavSpec {
            channels: N_CHANNELS as u16,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let writer = hound::WavWriter::create(path, spec)
            .map_err(|e| CaptureError::Encoding(e.to_string()))?;
        Ok(Self { writer })
    }
}

impl CaptureSink for WavSink {
    fn write_block(&mut self, interleaved: &[Sample]) -> CaptureResult<()> {
        for &sample in interleaved {
            self.writer
                .write_sample(sample)
                .map_err(|e| CaptureError::Encoding(e.to_string()))?;
        }
        Ok(())
    }

    fn finalize(self: Box<Self>) -> CaptureResult<()> {
        self.writer
            .finalize()
            .map_err(|e| CaptureError::Encoding(e.to_string()))
    }
}

/// FLAC writer: accumulates 16-bit samples and encodes at finalize.
struct FlacSink {
    path: PathBuf,
    samples: Vec<i32>,
}

impl FlacSink {
    fn create(path: &Path) -> CaptureResult<Self> {
        // Fail early if the location is not writable.
        File::create(path)?;
        Ok(Self { path: path.to_path_buf(), samples: Vec::new() })
    }
}

impl CaptureSink for FlacSink {
    fn write_block(&mut self, interleaved: &[Sample]) -> CaptureResult<()> {
        self.samples.extend(
            interleaved
                .iter()
                .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as Sample) as i32),
        );
        Ok(())
    }

    fn finalize(self: Box<Self>) -> CaptureResult<()> {
        use flacenc::bitsink::ByteSink;
        use flacenc::component::BitRepr;
        use flacenc::error::Verify;

        let config = flacenc::config::Encoder::default()
            .into_verified()
            .map_err(|e| CaptureError::Encoding(format!("invalid FLAC config: {e:?}")))?;
        let source = flacenc::source::MemSource::from_samples(
            &self.samples,
            N_CHANNELS,
            16,
            SAMPLE_RATE as usize,
        );
        let stream = flacenc::encode_with_fixed_block_size(&config, source, 4096)
            .map_err(|e| CaptureError::Encoding(format!("FLAC encoding failed: {e:?}")))?;

        let mut sink = ByteSink::new();
        stream
            .write(&mut sink)
            .map_err(|e| CaptureError::Encoding(format!("FLAC stream write failed: {e:?}")))?;

        let mut file = File::create(&self.path)?;
        file.write_all(&sink.into_inner())?;
        Ok(())
    }
}

/// Engine-thread side of an active capture.
pub(crate) struct CaptureTap {
    pub tx: flume::Sender<CaptureBlock>,
    pub needs_running: bool,
    pub dropped: u64,
}

impl CaptureTap {
    /// Queue one block; full channel drops it.
    pub fn feed(&mut self, block: &CaptureBlock) {
        if self.tx.try_send(*block).is_err() {
            self.dropped += 1;
        }
    }
}

/// Owner-side handle to the capture writer thread.
pub(crate) struct CaptureWriter {
    pub thread: JoinHandle<()>,
    pub path: PathBuf,
}

/// Create the sink for `path`, spawn the writer thread, and return the
/// engine tap plus the owner handle.
///
/// `notify` is called off the engine thread when the writer hits an error.
pub(crate) fn start_capture(
    path: &Path,
    needs_running: bool,
    notify: Box<dyn Fn(UserNote) + Send>,
) -> CaptureResult<(CaptureTap, CaptureWriter)> {
    let sink: Box<dyn CaptureSink> = match CaptureFormat::from_path(path)? {
        CaptureFormat::Wav => Box::new(WavSink::create(path)?),
        CaptureFormat::Flac => Box::new(FlacSink::create(path)?),
    };

    let (tx, rx) = flume::bounded::<CaptureBlock>(CHANNEL_BLOCKS);
    let path_buf = path.to_path_buf();
    let thread_path = path_buf.clone();
    let thread = std::thread::Builder::new()
        .name("cadenza-capture".into())
        .spawn(move || run_writer(sink, rx, thread_path, notify))
        .expect("failed to spawn capture writer thread");

    log::info!("capture started: {}", path_buf.display());
    Ok((
        CaptureTap { tx, needs_running, dropped: 0 },
        CaptureWriter { thread, path: path_buf },
    ))
}

fn run_writer(
    mut sink: Box<dyn CaptureSink>,
    rx: flume::Receiver<CaptureBlock>,
    path: PathBuf,
    notify: Box<dyn Fn(UserNote) + Send>,
) {
    let mut failed = false;
    while let Ok(block) = rx.recv() {
        if failed {
            continue; // drain so the engine side never backs up
        }
        if let Err(e) = sink.write_block(&block.0) {
            log::error!("capture write failed for {}: {}", path.display(), e);
            notify(UserNote::new(
                "capture",
                NoteFlags::Clear,
                format!("Capture failed:\n{}:\n{}", path.display(), e),
            ));
            failed = true;
        }
    }
    if failed {
        return;
    }
    match sink.finalize() {
        Ok(()) => log::info!("capture finished: {}", path.display()),
        Err(e) => {
            log::error!("capture finalize failed for {}: {}", path.display(), e);
            notify(UserNote::new(
                "capture",
                NoteFlags::Clear,
                format!("Capture failed:\n{}:\n{}", path.display(), e),
            ));
        }
    }
}
