// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Device Topology
//!
//! A module that models a device pool's fixed interconnect topology as a
//! complete binary tree over the slot range `[0, M)`, in service of
//! topology-aware allocation.
//!
//! Devices cluster into tightly-coupled pairs, pairs into quads, and so on up
//! to the whole pool, so every tree node owns a half-open span of slots whose
//! size is a power of two:
//!
//!```text
//!                      [0, 8)
//!                     /      \
//!               [0, 4)        [4, 8)
//!              /      \      /      \
//!          [0, 2)  [2, 4)  [4, 6)  [6, 8)
//!          /   \    /   \   /   \    /   \
//!         [0] [1] [2] [3] [4] [5] [6] [7]
//!```
//!
//! Nodes live in a contiguous arena indexed by [`NodeId`], with the usual
//! heap-shaped arithmetic: `parent(i) = (i - 1) / 2`, `left(i) = 2i + 1`,
//! `right(i) = 2i + 2`. The tree carries no bitmap state of its own and is
//! entirely read-only once built; callers supply availability and usage
//! masks per allocation request.

use anyhow::bail;
use anyhow::Result;
use std::ops::Range;

/// Index of a node in the tree arena, `0..2M-1`. The root is always 0.
pub type NodeId = usize;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Span {
    start: usize,
    end: usize,
}

#[derive(Clone, Debug)]
pub struct DeviceTree {
    spans: Vec<Span>,
    nr_slots: usize,
}

impl DeviceTree {
    /// Build the tree over `[0, nr_slots)` by recursive subdivision.
    /// `nr_slots` must be a power of two >= 1.
    pub fn new(nr_slots: usize) -> Result<DeviceTree> {
        if nr_slots == 0 || !nr_slots.is_power_of_two() {
            bail!("Pool size {} is not a power of two >= 1", nr_slots);
        }

        let mut spans = vec![Span { start: 0, end: 0 }; 2 * nr_slots - 1];
        Self::subdivide(&mut spans, 0, 0, nr_slots);

        Ok(DeviceTree { spans, nr_slots })
    }

    fn subdivide(spans: &mut [Span], id: NodeId, start: usize, end: usize) {
        spans[id] = Span { start, end };
        if end > start + 1 {
            let mid = (start + end) / 2;
            Self::subdivide(spans, 2 * id + 1, start, mid);
            Self::subdivide(spans, 2 * id + 2, mid, end);
        }
    }

    /// The root node, spanning the whole pool.
    pub fn root(&self) -> NodeId {
        0
    }

    /// The parent of `id`, or None at the root.
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        if id == 0 {
            None
        } else {
            Some((id - 1) / 2)
        }
    }

    /// The left child of `id`, or None at a leaf.
    pub fn left(&self, id: NodeId) -> Option<NodeId> {
        if self.span_len(id) > 1 {
            Some(2 * id + 1)
        } else {
            None
        }
    }

    /// The right child of `id`, or None at a leaf.
    pub fn right(&self, id: NodeId) -> Option<NodeId> {
        if self.span_len(id) > 1 {
            Some(2 * id + 2)
        } else {
            None
        }
    }

    /// The half-open slot range owned by `id`.
    pub fn span(&self, id: NodeId) -> Range<usize> {
        let span = &self.spans[id];
        span.start..span.end
    }

    /// The number of slots in the span of `id`.
    pub fn span_len(&self, id: NodeId) -> usize {
        let span = &self.spans[id];
        span.end - span.start
    }

    /// The total number of nodes in the arena.
    pub fn nr_nodes(&self) -> usize {
        self.spans.len()
    }

    /// The number of slots in the pool.
    pub fn nr_slots(&self) -> usize {
        self.nr_slots
    }
}
