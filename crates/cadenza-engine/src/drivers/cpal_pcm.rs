//! CPAL-backed PCM output driver.
//!
//! The engine writes deinterleaved blocks into a frame ring buffer; the
//! CPAL callback drains it and re-interleaves into the device buffer. When
//! the callback finds too few frames it plays silence for the remainder and
//! counts an xrun.
//!
//! CPAL stream handles are not `Send`, so the stream lives on a dedicated
//! host thread for the lifetime of the driver; the engine-facing driver
//! object only holds the ring producer and shared flags and can therefore
//! move onto the engine thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize as CpalBufferSize, SampleFormat, StreamConfig};

use crate::driver::{
    devid_rest, pcm_ring_frames, DriverDir, DriverEntry, PcmDriver, PcmDriverConfig, PcmLatency,
    PRIORITY_FALLBACK, PRIORITY_PREFERRED,
};
use crate::engine::LoopWaker;
use crate::error::{DriverError, DriverResult};
use crate::ring::{Consumer, Producer, RingBuffer};
use crate::types::{Sample, BLOCK_SIZE, MAX_BLOCK_SIZE, N_CHANNELS, SAMPLE_RATE};

/// State shared with the device callback. Waker and xrun counter are
/// installed when the engine adopts the driver; until then the callback
/// runs without them.
struct CallbackShared {
    waker: OnceLock<Arc<LoopWaker>>,
    xruns: OnceLock<Arc<AtomicU64>>,
    shutdown: AtomicBool,
}

pub(crate) fn open(
    devid: &str,
    dir: DriverDir,
    config: &PcmDriverConfig,
) -> DriverResult<Box<dyn PcmDriver>> {
    if dir == DriverDir::ReadOnly {
        return Err(DriverError::Unsupported("cpal driver is output-only".into()));
    }

    let ring_frames = pcm_ring_frames(config.block_length, config.latency_ms);
    let ring = RingBuffer::<Sample>::new(ring_frames, N_CHANNELS);
    let (mut producer, consumer) = ring.split();

    // Prime the output with silence so the first callbacks never underrun.
    let silence = vec![0.0; ring_frames];
    let lanes: Vec<&[Sample]> = (0..N_CHANNELS).map(|_| silence.as_slice()).collect();
    producer.write(ring_frames, &lanes);

    let shared = Arc::new(CallbackShared {
        waker: OnceLock::new(),
        xruns: OnceLock::new(),
        shutdown: AtomicBool::new(false),
    });
    let stop = Arc::new(AtomicBool::new(false));

    // All CPAL objects live on the host thread; errors come back through
    // the handshake channel.
    let device_name = devid_rest(devid).to_string();
    let requested_block = config.block_length;
    let (result_tx, result_rx) = mpsc::channel::<DriverResult<(u32, usize)>>();
    let host_shared = shared.clone();
    let host_stop = stop.clone();
    let host_thread = std::thread::Builder::new()
        .name("cadenza-cpal".into())
        .spawn(move || {
            host_stream_thread(device_name, requested_block, consumer, host_shared, host_stop, result_tx)
        })
        .map_err(|e| DriverError::Backend(e.to_string()))?;

    let (sample_rate, block_length) = match result_rx.recv() {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            let _ = host_thread.join();
            return Err(e);
        }
        Err(_) => {
            let _ = host_thread.join();
            return Err(DriverError::Backend("cpal host thread died".into()));
        }
    };

    log::info!(
        "cpal PCM driver open: {} ({} Hz, {} frame periods, {} frame ring)",
        devid,
        sample_rate,
        block_length,
        ring_frames
    );

    Ok(Box::new(CpalPcmDriver {
        devid: devid.to_string(),
        producer,
        scratch: std::array::from_fn(|_| vec![0.0; BLOCK_SIZE]),
        ring_frames,
        block_length,
        sample_rate,
        shared,
        stop,
        host_thread: Some(host_thread),
    }))
}

/// Host thread body: resolve the device, negotiate a config, run the
/// stream until told to stop.
fn host_stream_thread(
    device_name: String,
    requested_block: usize,
    consumer: Consumer<Sample>,
    shared: Arc<CallbackShared>,
    stop: Arc<AtomicBool>,
    result_tx: mpsc::Sender<DriverResult<(u32, usize)>>,
) {
    let opened = (|| -> DriverResult<(cpal::Device, cpal::SupportedStreamConfig)> {
        let device = find_output_device(&device_name)?;
        let supported = negotiate_config(&device)?;
        Ok((device, supported))
    })();

    let (device, supported) = match opened {
        Ok(pair) => pair,
        Err(e) => {
            let _ = result_tx.send(Err(e));
            return;
        }
    };

    let channels = supported.channels() as usize;
    let sample_rate = supported.sample_rate().0;
    let block_length = requested_block.clamp(64, MAX_BLOCK_SIZE);

    let stream_config = StreamConfig {
        channels: supported.channels(),
        sample_rate: supported.sample_rate(),
        buffer_size: CpalBufferSize::Fixed(block_length as u32),
    };

    let stream = match build_stream(&device, &stream_config, channels, consumer, shared) {
        Ok(s) => s,
        Err(e) => {
            let _ = result_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = result_tx.send(Err(DriverError::StreamPlay(e.to_string())));
        return;
    }
    let _ = result_tx.send(Ok((sample_rate, block_length)));

    while !stop.load(Ordering::Acquire) {
        std::thread::park_timeout(Duration::from_millis(100));
    }
    drop(stream);
}

fn build_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    channels: usize,
    mut consumer: Consumer<Sample>,
    shared: Arc<CallbackShared>,
) -> DriverResult<cpal::Stream> {
    let err_shared = shared.clone();
    let mut lane_scratch: Vec<Vec<Sample>> =
        (0..N_CHANNELS).map(|_| vec![0.0; MAX_BLOCK_SIZE]).collect();

    let result = device.build_output_stream(
        config,
        move |data: &mut [Sample], _info: &cpal::OutputCallbackInfo| {
            let n_frames = (data.len() / channels).min(MAX_BLOCK_SIZE);

            // Split the scratch without allocating; this closure is the
            // real-time device callback.
            let mut scratch = lane_scratch.iter_mut();
            let left = scratch.next().expect("stereo scratch");
            let right = scratch.next().expect("stereo scratch");
            let mut lanes = [&mut left[..n_frames], &mut right[..n_frames]];
            let got = consumer.read(n_frames, &mut lanes);

            for (i, frame) in data.chunks_mut(channels).enumerate().take(n_frames) {
                if i < got {
                    frame[0] = lanes[0][i];
                    if channels > 1 {
                        frame[1] = lanes[1][i];
                    }
                    for ch in frame.iter_mut().skip(2) {
                        *ch = 0.0;
                    }
                } else {
                    for ch in frame.iter_mut() {
                        *ch = 0.0;
                    }
                }
            }

            if got < n_frames {
                if let Some(xruns) = shared.xruns.get() {
                    xruns.fetch_add(1, Ordering::Relaxed);
                }
            }
            // Space freed; let the engine refill.
            if let Some(waker) = shared.waker.get() {
                waker.notify();
            }
        },
        move |err| {
            log::error!("cpal stream error: {err}");
            err_shared.shutdown.store(true, Ordering::Release);
        },
        None,
    );

    result.map_err(|e| DriverError::StreamBuild(e.to_string()))
}

fn find_output_device(name: &str) -> DriverResult<cpal::Device> {
    if name.is_empty() {
        return cpal::default_host()
            .default_output_device()
            .ok_or_else(|| DriverError::DeviceNotFound("default output".into()));
    }
    for host_id in cpal::available_hosts() {
        let Ok(host) = cpal::host_from_id(host_id) else { continue };
        let Ok(mut devices) = host.output_devices() else { continue };
        if let Some(device) = devices.find(|d| d.name().ok().as_deref() == Some(name)) {
            return Ok(device);
        }
    }
    Err(DriverError::DeviceNotFound(name.to_string()))
}

/// Pick an output config: f32 samples, stereo or wider, fixed 48 kHz.
fn negotiate_config(device: &cpal::Device) -> DriverResult<cpal::SupportedStreamConfig> {
    let configs: Vec<_> = device
        .supported_output_configs()
        .map_err(|e| DriverError::Backend(e.to_string()))?
        .collect();
    if configs.is_empty() {
        return Err(DriverError::Unsupported("no output configurations".into()));
    }

    let best = configs
        .iter()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .filter(|c| c.channels() >= 2)
        .find(|c| SAMPLE_RATE >= c.min_sample_rate().0 && SAMPLE_RATE <= c.max_sample_rate().0)
        .or_else(|| {
            configs
                .iter()
                .filter(|c| c.channels() >= 2)
                .find(|c| SAMPLE_RATE >= c.min_sample_rate().0 && SAMPLE_RATE <= c.max_sample_rate().0)
        })
        .ok_or_else(|| {
            DriverError::Unsupported(format!("device does not support {SAMPLE_RATE} Hz"))
        })?;

    Ok(best.clone().with_sample_rate(cpal::SampleRate(SAMPLE_RATE)))
}

/// Engine-facing driver object; `Send`, unlike the stream it fronts.
pub struct CpalPcmDriver {
    devid: String,
    producer: Producer<Sample>,
    /// Deinterleave scratch, one lane per channel.
    scratch: [Vec<Sample>; N_CHANNELS],
    ring_frames: usize,
    block_length: usize,
    sample_rate: u32,
    shared: Arc<CallbackShared>,
    stop: Arc<AtomicBool>,
    host_thread: Option<JoinHandle<()>>,
}

impl PcmDriver for CpalPcmDriver {
    fn devid(&self) -> &str {
        &self.devid
    }

    fn check_io(&mut self, timeout_usecs: &mut i64) -> bool {
        let writable = self.producer.writable_frames();
        if writable >= BLOCK_SIZE {
            true
        } else {
            let missing = (BLOCK_SIZE - writable) as u64;
            *timeout_usecs = (missing * 1_000_000 / self.sample_rate as u64) as i64;
            false
        }
    }

    fn write(&mut self, interleaved: &[Sample]) {
        let n_frames = interleaved.len() / N_CHANNELS;
        for (ch, lane) in self.scratch.iter_mut().enumerate() {
            for (i, frame) in interleaved.chunks_exact(N_CHANNELS).enumerate() {
                lane[i] = frame[ch];
            }
        }
        let lanes: [&[Sample]; N_CHANNELS] =
            std::array::from_fn(|ch| &self.scratch[ch][..n_frames]);
        let wrote = self.producer.write(n_frames, &lanes);
        // check_io declared this block writable; a short write means the
        // SPSC discipline was violated somewhere.
        assert_eq!(wrote, n_frames, "PCM ring dropped frames declared writable");
    }

    fn block_length(&self) -> usize {
        self.block_length
    }

    fn frequency(&self) -> u32 {
        self.sample_rate
    }

    fn latency(&self) -> PcmLatency {
        PcmLatency {
            read_frames: 0,
            write_frames: self.ring_frames - self.producer.writable_frames(),
        }
    }

    fn set_waker(&mut self, waker: Arc<LoopWaker>) {
        let _ = self.shared.waker.set(waker);
    }

    fn set_xrun_counter(&mut self, counter: Arc<AtomicU64>) {
        let _ = self.shared.xruns.set(counter);
    }

    fn take_shutdown(&mut self) -> bool {
        self.shared.shutdown.swap(false, Ordering::AcqRel)
    }
}

impl Drop for CpalPcmDriver {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.host_thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
    }
}

/// Enumerate output devices across every available host.
pub(crate) fn enumerate() -> Vec<DriverEntry> {
    let mut entries = Vec::new();
    for host_id in cpal::available_hosts() {
        let Ok(host) = cpal::host_from_id(host_id) else { continue };
        let default_name = host.default_output_device().and_then(|d| d.name().ok());
        let Ok(devices) = host.output_devices() else { continue };
        for device in devices {
            let Ok(name) = device.name() else { continue };
            let Ok(configs) = device.supported_output_configs() else { continue };
            let configs: Vec<_> = configs.collect();
            if configs.is_empty() {
                continue;
            }
            let max_channels = configs.iter().map(|c| c.channels()).max().unwrap_or(0);
            let supports_rate = configs
                .iter()
                .any(|c| SAMPLE_RATE >= c.min_sample_rate().0 && SAMPLE_RATE <= c.max_sample_rate().0);
            let is_default = default_name.as_deref() == Some(name.as_str());
            entries.push(DriverEntry {
                devid: format!("cpal={name}"),
                device_name: name.clone(),
                capabilities: format!("{max_channels} channel output"),
                device_info: format!("{host_id:?} host"),
                notice: if supports_rate {
                    String::new()
                } else {
                    format!("no {SAMPLE_RATE} Hz support")
                },
                priority: if is_default { PRIORITY_PREFERRED } else { PRIORITY_FALLBACK },
            });
        }
    }
    entries
}
