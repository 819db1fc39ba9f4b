//! Topological scheduling of the processor graph.
//!
//! The schedule is an ordered list of layers; each layer is a singly-linked
//! chain of nodes threaded through their `sched_next` link. A node's layer
//! index equals its maximum input-path depth, so layer `k` only ever reads
//! from layers `< k`. Insertion is LIFO per layer; order within a layer
//! carries no meaning.
//!
//! Any graph mutation marks the schedule invalid; the dispatcher rebuilds it
//! at most once per block, right before rendering.

use crate::graph::{flags, NodeTable, ProcessorId};

/// Upper bound reserved for schedule storage at engine start.
pub(crate) const SCHEDULE_RESERVE: usize = 8192;

pub(crate) struct Schedule {
    /// Chain head per layer.
    layers: Vec<Option<ProcessorId>>,
    invalid: bool,
}

impl Schedule {
    pub fn new() -> Self {
        Self { layers: Vec::new(), invalid: true }
    }

    /// Pre-size layer storage so rebuilds never allocate mid-stream.
    pub fn reserve(&mut self) {
        self.layers.reserve(SCHEDULE_RESERVE);
    }

    #[inline]
    pub fn invalidate(&mut self) {
        self.invalid = true;
    }

    #[inline]
    pub fn is_invalid(&self) -> bool {
        self.invalid
    }

    #[inline]
    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    #[inline]
    pub fn layer_head(&self, layer: usize) -> Option<ProcessorId> {
        self.layers.get(layer).copied().flatten()
    }

    /// Unlink every chained node and drop all layers.
    pub fn clear(&mut self, table: &mut NodeTable) {
        for layer in 0..self.layers.len() {
            let mut cur = self.layers[layer].take();
            while let Some(id) = cur {
                if let Some(node) = table.get_mut(id) {
                    cur = node.sched_next.take();
                    node.flags &= !flags::SCHEDULED;
                } else {
                    cur = None;
                }
            }
        }
        self.layers.clear();
        self.invalid = true;
    }

    /// Rebuild from the output processors' transitive dependencies.
    ///
    /// Nodes whose stamp lags the engine stamp are reset so they start
    /// cleanly at the next rendered block.
    pub fn rebuild(&mut self, table: &mut NodeTable, oprocs: &[ProcessorId], engine_stamp: u64) {
        self.clear(table);
        for &id in oprocs {
            self.schedule_processor(table, id, engine_stamp);
        }
        self.invalid = false;
    }

    /// Schedule `id` and everything it depends on; returns `level + 1`.
    fn schedule_processor(
        &mut self,
        table: &mut NodeTable,
        id: ProcessorId,
        engine_stamp: u64,
    ) -> u32 {
        let mut level = 0;
        if let Some(src) = table.get(id).and_then(|n| n.event_input) {
            level = level.max(self.schedule_processor(table, src, engine_stamp));
        }
        let n_inputs = table.get(id).map_or(0, |n| n.inputs.len());
        for islot in 0..n_inputs {
            let link = table.get(id).and_then(|n| n.inputs.get(islot).copied().flatten());
            if let Some(link) = link {
                level = level.max(self.schedule_processor(table, link.source, engine_stamp));
            }
        }
        self.schedule_add(table, id, level, engine_stamp);
        level + 1
    }

    /// Insert `id` at `level` unless it is already scheduled.
    fn schedule_add(&mut self, table: &mut NodeTable, id: ProcessorId, level: u32, engine_stamp: u64) {
        let level = level as usize;
        {
            let Some(node) = table.get_mut(id) else { return };
            if node.flags & flags::SCHEDULED != 0 {
                return;
            }
            debug_assert!(node.sched_next.is_none());
            if self.layers.len() <= level {
                self.layers.resize(level + 1, None);
            }
            node.sched_next = self.layers[level];
            self.layers[level] = Some(id);
            node.flags |= flags::SCHEDULED;
        }
        let needs_reset = table.get(id).map_or(false, |n| n.render_stamp != engine_stamp);
        if needs_reset {
            table.reset_node(id, engine_stamp);
        }
    }
}
