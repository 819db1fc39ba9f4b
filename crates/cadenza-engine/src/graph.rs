//! The engine-owned processor graph.
//!
//! Processors live in a node table owned exclusively by the engine thread;
//! the owner refers to them by [`ProcessorId`] and mutates the graph through
//! jobs. Beside each boxed processor the table keeps the scheduling
//! bookkeeping: flag bits, the render stamp, the intrusive layer link, and
//! the audio/event input connections that define the dependency DAG.

use crate::midi::MidiEvent;
use crate::processor::{AudioProcessor, OBusId};
use crate::transport::Transport;
use crate::types::{Sample, BLOCK_SIZE};

/// Handle to a processor in the engine's node table.
///
/// Allocated by the owner from an atomic counter; stays valid until the
/// processor is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessorId(pub u32);

/// Node flag bits.
pub(crate) mod flags {
    /// Set once `initialize` ran and buses are configured.
    pub const INITIALIZED: u32 = 1 << 0;
    /// Node is linked into the current schedule.
    pub const SCHEDULED: u32 = 1 << 2;
    /// Node's MAIN_OBUS is mixed into the engine output.
    pub const ENGINE_OUTPUT: u32 = 1 << 8;
}

/// One audio input connection: which bus of which upstream node feeds this
/// input slot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct InputLink {
    pub source: ProcessorId,
    pub obus: OBusId,
}

pub(crate) struct Node {
    /// Taken out temporarily while the processor renders.
    pub proc: Option<Box<dyn AudioProcessor>>,
    pub flags: u32,
    /// Frame number this node has rendered up to.
    pub render_stamp: u64,
    /// Next node in the same scheduler layer (intrusive chain).
    pub sched_next: Option<ProcessorId>,
    /// Audio input slots; `None` entries are unconnected.
    pub inputs: Vec<Option<InputLink>>,
    /// Upstream event source, if any.
    pub event_input: Option<ProcessorId>,
}

impl Node {
    fn new(proc: Box<dyn AudioProcessor>) -> Self {
        Self {
            proc: Some(proc),
            flags: 0,
            render_stamp: 0,
            sched_next: None,
            inputs: Vec::new(),
            event_input: None,
        }
    }
}

static ZERO_BLOCK: [Sample; BLOCK_SIZE] = [0.0; BLOCK_SIZE];

/// Slab of graph nodes, indexed by [`ProcessorId`].
#[derive(Default)]
pub(crate) struct NodeTable {
    slots: Vec<Option<Node>>,
}

impl NodeTable {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub fn insert(&mut self, id: ProcessorId, proc: Box<dyn AudioProcessor>) {
        let idx = id.0 as usize;
        if self.slots.len() <= idx {
            self.slots.resize_with(idx + 1, || None);
        }
        debug_assert!(self.slots[idx].is_none(), "processor id reused");
        self.slots[idx] = Some(Node::new(proc));
    }

    pub fn remove(&mut self, id: ProcessorId) -> Option<Node> {
        self.slots.get_mut(id.0 as usize)?.take()
    }

    #[inline]
    pub fn get(&self, id: ProcessorId) -> Option<&Node> {
        self.slots.get(id.0 as usize)?.as_ref()
    }

    #[inline]
    pub fn get_mut(&mut self, id: ProcessorId) -> Option<&mut Node> {
        self.slots.get_mut(id.0 as usize)?.as_mut()
    }

    /// Connect `src`'s output bus `obus` to input slot `islot` of `dst`.
    pub fn connect(&mut self, dst: ProcessorId, islot: usize, src: ProcessorId, obus: OBusId) {
        if let Some(node) = self.get_mut(dst) {
            if node.inputs.len() <= islot {
                node.inputs.resize(islot + 1, None);
            }
            node.inputs[islot] = Some(InputLink { source: src, obus });
        }
    }

    /// Route `src`'s event stream into `dst`.
    pub fn connect_events(&mut self, dst: ProcessorId, src: ProcessorId) {
        if let Some(node) = self.get_mut(dst) {
            node.event_input = Some(src);
        }
    }

    /// Bring the node's stamp to `target_stamp` without rendering, resetting
    /// processor state. Used when a node joins a schedule mid-stream.
    pub fn reset_node(&mut self, id: ProcessorId, target_stamp: u64) {
        if let Some(node) = self.get_mut(id) {
            if node.render_stamp != target_stamp {
                if let Some(proc) = node.proc.as_mut() {
                    if let Some(stream) = proc.event_output_mut() {
                        stream.clear();
                    }
                    proc.reset(target_stamp);
                }
                node.render_stamp = target_stamp;
            }
        }
    }

    /// Remove every connection that reads from `target`. Called when a
    /// processor is removed so stale links cannot resolve to a reused id.
    pub fn purge_links(&mut self, target: ProcessorId) {
        for slot in self.slots.iter_mut().flatten() {
            for input in slot.inputs.iter_mut() {
                if input.map_or(false, |link| link.source == target) {
                    *input = None;
                }
            }
            if slot.event_input == Some(target) {
                slot.event_input = None;
            }
        }
    }

    /// Render one node up to `target_stamp` (at most one block). The boxed
    /// processor is moved out for the duration so the node table can be
    /// borrowed read-only as the processor's input context.
    pub fn render_node(&mut self, id: ProcessorId, target_stamp: u64, transport: &Transport) {
        let Some(node) = self.get_mut(id) else { return };
        let stamp = node.render_stamp;
        if stamp >= target_stamp || target_stamp - stamp > BLOCK_SIZE as u64 {
            return;
        }
        let Some(mut proc) = node.proc.take() else { return };

        if let Some(stream) = proc.event_output_mut() {
            stream.clear();
        }
        let n_frames = (target_stamp - stamp) as usize;
        {
            let ctx = RenderContext { table: self, node: id, transport };
            proc.render(&ctx, n_frames);
        }

        let node = self.get_mut(id).expect("node vanished during render");
        node.proc = Some(proc);
        node.render_stamp = target_stamp;
    }
}

/// Per-block view handed to [`AudioProcessor::render`].
///
/// Grants read access to the rendering node's input buses, its upstream
/// event stream, and the transport. All upstream processors live in earlier
/// scheduler layers and have already rendered the current block.
pub struct RenderContext<'a> {
    pub(crate) table: &'a NodeTable,
    pub(crate) node: ProcessorId,
    pub(crate) transport: &'a Transport,
}

impl<'a> RenderContext<'a> {
    #[inline]
    pub fn transport(&self) -> &'a Transport {
        self.transport
    }

    /// Number of channels delivered on input slot `islot` (0 when
    /// unconnected).
    pub fn n_ichannels(&self, islot: usize) -> usize {
        self.input_link(islot)
            .and_then(|link| {
                let proc = self.table.get(link.source)?.proc.as_ref()?;
                Some(proc.n_ochannels(link.obus))
            })
            .unwrap_or(0)
    }

    /// Input samples for `islot`/`channel`; silence when unconnected.
    pub fn ifloats(&self, islot: usize, channel: usize) -> &'a [Sample] {
        self.input_link(islot)
            .and_then(|link| {
                let proc = self.table.get(link.source)?.proc.as_ref()?;
                if channel < proc.n_ochannels(link.obus) {
                    Some(proc.ofloats(link.obus, channel))
                } else {
                    None
                }
            })
            .unwrap_or(&ZERO_BLOCK)
    }

    /// Events produced upstream for this block; empty without a source.
    pub fn events(&self) -> &'a [MidiEvent] {
        self.table
            .get(self.node)
            .and_then(|node| node.event_input)
            .and_then(|src| self.table.get(src)?.proc.as_ref()?.event_output())
            .map(|stream| stream.as_slice())
            .unwrap_or(&[])
    }

    fn input_link(&self, islot: usize) -> Option<InputLink> {
        self.table.get(self.node)?.inputs.get(islot).copied().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{OutputBuffers, MAIN_OBUS};
    use std::any::Any;

    /// Emits a constant; doubles as an input-echo check for the context.
    struct ConstSource {
        value: Sample,
        out: OutputBuffers,
    }

    impl ConstSource {
        fn new(value: Sample) -> Self {
            Self { value, out: OutputBuffers::single(2) }
        }
    }

    impl AudioProcessor for ConstSource {
        fn render(&mut self, _ctx: &RenderContext<'_>, n_frames: usize) {
            for ch in 0..2 {
                self.out.channel_mut(MAIN_OBUS, ch)[..n_frames].fill(self.value);
            }
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

    /// Copies its input, scaled by 2.
    struct Doubler {
        out: OutputBuffers,
    }

    impl AudioProcessor for Doubler {
        fn render(&mut self, ctx: &RenderContext<'_>, n_frames: usize) {
            for ch in 0..2 {
                let input = ctx.ifloats(0, ch);
                let out = self.out.channel_mut(MAIN_OBUS, ch);
                for i in 0..n_frames {
                    out[i] = input[i] * 2.0;
                }
            }
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

    #[test]
    fn test_render_pulls_inputs_through_context() {
        let mut table = NodeTable::new();
        let transport = Transport::new(48_000);
        let src = ProcessorId(0);
        let fx = ProcessorId(1);

        table.insert(src, Box::new(ConstSource::new(0.25)));
        table.insert(fx, Box::new(Doubler { out: OutputBuffers::single(2) }));
        table.connect(fx, 0, src, MAIN_OBUS);

        table.render_node(src, BLOCK_SIZE as u64, &transport);
        table.render_node(fx, BLOCK_SIZE as u64, &transport);

        let proc = table.get(fx).unwrap().proc.as_ref().unwrap();
        assert_eq!(proc.ofloats(MAIN_OBUS, 0)[0], 0.5);
        assert_eq!(proc.ofloats(MAIN_OBUS, 1)[BLOCK_SIZE - 1], 0.5);
    }

    #[test]
    fn test_render_is_idempotent_per_stamp() {
        let mut table = NodeTable::new();
        let transport = Transport::new(48_000);
        let id = ProcessorId(0);
        table.insert(id, Box::new(ConstSource::new(1.0)));

        table.render_node(id, BLOCK_SIZE as u64, &transport);
        let stamp = table.get(id).unwrap().render_stamp;
        // Same target again: no-op, stamp unchanged.
        table.render_node(id, BLOCK_SIZE as u64, &transport);
        assert_eq!(table.get(id).unwrap().render_stamp, stamp);
    }

    #[test]
    fn test_unconnected_input_reads_silence() {
        let mut table = NodeTable::new();
        let transport = Transport::new(48_000);
        let fx = ProcessorId(3);
        table.insert(fx, Box::new(Doubler { out: OutputBuffers::single(2) }));

        table.render_node(fx, BLOCK_SIZE as u64, &transport);
        let proc = table.get(fx).unwrap().proc.as_ref().unwrap();
        assert!(proc.ofloats(MAIN_OBUS, 0).iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_reset_node_jumps_stamp() {
        let mut table = NodeTable::new();
        let id = ProcessorId(0);
        table.insert(id, Box::new(ConstSource::new(1.0)));

        table.reset_node(id, 4096);
        assert_eq!(table.get(id).unwrap().render_stamp, 4096);
    }
}
