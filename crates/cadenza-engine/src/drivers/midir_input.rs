//! midir-backed MIDI input driver (ALSA on Linux, CoreMIDI on macOS,
//! WinMM on Windows).
//!
//! The midir callback runs on a backend thread; it copies raw message
//! bytes into a single-lane ring buffer. `fetch_events` drains and parses
//! them on the engine thread once per block.

use midir::{MidiInput, MidiInputConnection};

use crate::driver::{devid_rest, DriverEntry, MidiDriver, PRIORITY_PREFERRED};
use crate::error::{DriverError, DriverResult};
use crate::midi::{MidiEvent, MidiEventKind, MidiEventStream};
use crate::ring::{Consumer, RingBuffer};

const CLIENT_NAME: &str = "cadenza-midi";

/// Raw messages buffered between the midir callback and the engine.
/// Channel-voice messages are at most three bytes; anything longer
/// (system exclusive) is dropped at the callback.
#[derive(Debug, Clone, Copy, Default)]
struct RawMessage {
    len: u8,
    bytes: [u8; 3],
}

/// Messages buffered between callback and engine (~1000 is far beyond any
/// realistic per-block burst).
const QUEUE_FRAMES: usize = 1024;

pub(crate) fn open(devid: &str) -> DriverResult<Box<dyn MidiDriver>> {
    let pattern = devid_rest(devid).to_lowercase();

    let midi_in = MidiInput::new(CLIENT_NAME)
        .map_err(|e| DriverError::Backend(e.to_string()))?;

    let ports = midi_in.ports();
    if ports.is_empty() {
        return Err(DriverError::DeviceNotFound("no MIDI input ports".into()));
    }

    // Empty pattern takes the first port; otherwise match the port name
    // case-insensitively as a substring.
    let port = ports
        .into_iter()
        .find(|port| {
            pattern.is_empty()
                || midi_in
                    .port_name(port)
                    .map(|name| name.to_lowercase().contains(&pattern))
                    .unwrap_or(false)
        })
        .ok_or_else(|| DriverError::DeviceNotFound(devid_rest(devid).to_string()))?;

    let port_name = midi_in
        .port_name(&port)
        .map_err(|e| DriverError::Backend(e.to_string()))?;
    log::info!("MIDI input open: {port_name}");

    let ring = RingBuffer::<RawMessage>::new(QUEUE_FRAMES, 1);
    let (mut producer, consumer) = ring.split();

    let connection = midi_in
        .connect(
            &port,
            "cadenza-midi-input",
            move |_timestamp, message, _| {
                if message.is_empty() || message.len() > 3 {
                    return;
                }
                let mut raw = RawMessage { len: message.len() as u8, bytes: [0; 3] };
                raw.bytes[..message.len()].copy_from_slice(message);
                // A full queue drops the message; the engine drains every
                // block, so this only happens under pathological bursts.
                producer.write(1, &[&[raw]]);
            },
            (),
        )
        .map_err(|e| DriverError::Backend(e.to_string()))?;

    Ok(Box::new(MidirInputDriver {
        devid: devid.to_string(),
        consumer,
        _connection: connection,
    }))
}

struct MidirInputDriver {
    devid: String,
    consumer: Consumer<RawMessage>,
    /// Dropping the connection closes the port.
    _connection: MidiInputConnection<()>,
}

impl MidiDriver for MidirInputDriver {
    fn devid(&self) -> &str {
        &self.devid
    }

    fn fetch_events(&mut self, stream: &mut MidiEventStream, _sample_rate: u32) {
        let mut buf = [RawMessage::default(); 32];
        loop {
            let got = self.consumer.read(buf.len(), &mut [&mut buf[..]]);
            for raw in &buf[..got] {
                if let Some(kind) = MidiEventKind::parse(&raw.bytes[..raw.len as usize]) {
                    stream.push(MidiEvent::at_block_start(kind));
                }
            }
            if got < buf.len() {
                break;
            }
        }
    }
}

/// Enumerate MIDI input ports.
pub(crate) fn enumerate() -> Vec<DriverEntry> {
    let Ok(midi_in) = MidiInput::new(CLIENT_NAME) else {
        return Vec::new();
    };
    midi_in
        .ports()
        .iter()
        .filter_map(|port| midi_in.port_name(port).ok())
        .map(|name| DriverEntry {
            devid: format!("midir={name}"),
            device_name: name,
            capabilities: "MIDI input".into(),
            device_info: "midir port".into(),
            notice: String::new(),
            priority: PRIORITY_PREFERRED,
        })
        .collect()
}
