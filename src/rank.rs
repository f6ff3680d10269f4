// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Ranking Kernel
//!
//! The recursive subset selector at the heart of topology-aware allocation.
//!
//! Given a request for `needed` devices, the decomposer splits the request
//! into descending power-of-two chunks and asks the ranking kernel to place
//! each chunk at the cheapest subtree that can hold it. The kernel prefers
//! the tightest exact fit: a subtree whose span is entirely free and exactly
//! the chunk size. When the two halves of a node report equal cost, the tie
//! is broken by walking both winners toward their ancestors and comparing
//! the cost of the progressively wider neighbourhoods, preferring the left
//! side once the walk converges or runs out of tree.
//!
//! Chunk costs are augmented: they are computed over the union of the slots
//! already in use on the node and the free slots the candidate subtree would
//! contribute, so a chunk lands as close as possible to what the tenant
//! already owns.

use anyhow::bail;
use anyhow::Result;
use log::debug;
use log::error;
use log::trace;

use crate::cost::CostMatrix;
use crate::devmask::Devmask;
use crate::topology::DeviceTree;
use crate::topology::NodeId;

/// The largest power of two <= `span` that fits within `need`, or `span`
/// itself when `need` covers it. This is the next chunk size for a request
/// of `need` slots over a (sub)pool of `span` slots.
pub fn align2(need: usize, mut span: usize) -> usize {
    while need < span {
        span /= 2;
    }
    span
}

/// A chunk placement reported by the ranking kernel: the subtree the slots
/// were drawn from, the slots themselves, and the augmented cost at that
/// subtree. After a tie-break walk, `node` is the ancestor whose wider
/// neighbourhood decided the tie and `cost` its augmented cost, while
/// `slots` always remain the original winner's contribution.
#[derive(Clone, Debug)]
pub struct Placement {
    pub cost: u64,
    pub slots: Vec<usize>,
    pub node: NodeId,
}

/// One allocation pass over a device pool. Borrows the tree and the cost
/// matrix read-only and the two bitmaps mutably; commits chunks into the
/// bitmaps as it goes.
pub struct Ranker<'a> {
    tree: &'a DeviceTree,
    costs: &'a CostMatrix,
    avail: &'a mut Devmask,
    used: &'a mut Devmask,
}

impl<'a> Ranker<'a> {
    pub fn new(
        tree: &'a DeviceTree,
        costs: &'a CostMatrix,
        avail: &'a mut Devmask,
        used: &'a mut Devmask,
    ) -> Result<Ranker<'a>> {
        let nr_slots = tree.nr_slots();
        if costs.nr_slots() != nr_slots {
            bail!(
                "Cost matrix covers {} slots, pool has {}",
                costs.nr_slots(),
                nr_slots
            );
        }
        if avail.len() != nr_slots || used.len() != nr_slots {
            bail!(
                "Bitmap widths {}/{} do not match pool size {}",
                avail.len(),
                used.len(),
                nr_slots
            );
        }
        if !avail.and(used)?.is_empty() {
            bail!("A slot is both available and in use");
        }

        Ok(Ranker {
            tree,
            costs,
            avail,
            used,
        })
    }

    /// Number of free slots in the span of `node`.
    pub fn available(&self, node: NodeId) -> usize {
        self.tree
            .span(node)
            .filter(|&slot| self.avail.test_slot(slot))
            .count()
    }

    /// Augmented cost at `node`: the sum of pairwise costs over every slot
    /// the tenant would own if this node's free slots were added to what is
    /// already in use. Also reports the slots of the node's span that enter
    /// the union.
    pub fn node_cost(&self, node: NodeId) -> (u64, Vec<usize>) {
        let span = self.tree.span(node);
        let nr_slots = self.tree.nr_slots();

        let mut joint = vec![false; nr_slots];
        for (slot, bit) in joint.iter_mut().enumerate() {
            *bit = self.used.test_slot(slot)
                || (span.contains(&slot) && self.avail.test_slot(slot));
        }

        let mut cost = 0;
        let mut slots = Vec::new();
        for i in 0..nr_slots {
            if !joint[i] {
                continue;
            }
            for j in (i + 1)..nr_slots {
                if joint[j] {
                    cost += self.costs.between(i, j);
                }
            }
            if span.contains(&i) {
                slots.push(i);
            }
        }

        (cost, slots)
    }

    /// Select a subtree under `node` covering exactly `num` free slots with
    /// minimum augmented cost. `num` must be a power of two >= 1. Returns
    /// None when no such subtree exists.
    pub fn do_ranking(&self, node: Option<NodeId>, num: usize) -> Option<Placement> {
        let n = node?;
        if self.available(n) < num {
            return None;
        }

        // The whole span is free and exactly the chunk size. This is the
        // tightest possible grouping, preferred over any finer split.
        if self.available(n) == num && self.tree.span_len(n) == num {
            let (cost, slots) = self.node_cost(n);
            return Some(Placement {
                cost,
                slots,
                node: n,
            });
        }

        let left = self.do_ranking(self.tree.left(n), num);
        let right = self.do_ranking(self.tree.right(n), num);
        trace!(
            "ranking num={} left={} right={}",
            num,
            left.as_ref()
                .map_or(self.costs.unreachable(), |p| p.cost),
            right
                .as_ref()
                .map_or(self.costs.unreachable(), |p| p.cost),
        );

        match (left, right) {
            (None, None) => None,
            (Some(l), None) => Some(l),
            (None, Some(r)) => Some(r),
            (Some(l), Some(r)) => {
                if l.cost < r.cost {
                    Some(l)
                } else if r.cost < l.cost {
                    Some(r)
                } else {
                    Some(self.break_tie(l, r))
                }
            }
        }
    }

    /// Both halves reported equal cost: climb both winners toward their
    /// ancestors in lockstep, recomputing the augmented cost of each
    /// progressively wider span until the costs diverge or the walk
    /// converges on a common ancestor. The decided side carries its original
    /// slots; the reported node and cost are the deciding ancestor's.
    fn break_tie(&self, l: Placement, r: Placement) -> Placement {
        let mut lcost = l.cost;
        let mut rcost = r.cost;
        let mut ln = self.tree.parent(l.node);
        let mut rn = self.tree.parent(r.node);

        loop {
            match (ln, rn) {
                (Some(lid), Some(rid)) if lid != rid => {
                    lcost = self.node_cost(lid).0;
                    rcost = self.node_cost(rid).0;
                    trace!("ranking up lcost={} rcost={}", lcost, rcost);
                    if lcost < rcost {
                        return Placement {
                            cost: lcost,
                            slots: l.slots,
                            node: lid,
                        };
                    } else if rcost < lcost {
                        return Placement {
                            cost: rcost,
                            slots: r.slots,
                            node: rid,
                        };
                    }
                    ln = self.tree.parent(lid);
                    rn = self.tree.parent(rid);
                }
                // Converged on a common ancestor, or only the left side
                // still has one: prefer left.
                (Some(lid), _) => {
                    return Placement {
                        cost: lcost,
                        slots: l.slots,
                        node: lid,
                    }
                }
                (None, Some(rid)) => {
                    return Placement {
                        cost: rcost,
                        slots: r.slots,
                        node: rid,
                    }
                }
                // Both walks ran out simultaneously. Unreachable on a
                // complete tree, where the walks meet at the root first.
                (None, None) => {
                    return Placement {
                        cost: lcost,
                        slots: l.slots,
                        node: l.node,
                    }
                }
            }
        }
    }

    /// Cover `needed` slots by decomposing the request into power-of-two
    /// chunks, ranking each, and committing the winners into the bitmaps.
    /// A chunk that fits in no subtree is halved rather than skipped, so the
    /// allocator packs into tight clusters first and falls back to smaller
    /// pieces only under fragmentation.
    pub fn rank(&mut self, mut needed: usize) -> bool {
        let root = self.tree.root();
        if self.available(root) < needed {
            error!(
                "ranking wants {} slots, pool has {} available",
                needed,
                self.available(root)
            );
            return false;
        }

        let mut num = align2(needed, self.tree.nr_slots());
        while needed > 0 {
            if num < 1 {
                error!("chunk size exhausted with {} slots still needed", needed);
                return false;
            }
            let placement = match self.do_ranking(Some(root), num) {
                Some(placement) => placement,
                None => {
                    debug!("no subtree holds a chunk of {}, halving", num);
                    num /= 2;
                    continue;
                }
            };
            for &slot in &placement.slots {
                let _ = self.avail.clear_slot(slot);
                let _ = self.used.set_slot(slot);
            }
            debug!(
                "chunk of {} satisfied: cost {} slots {:?} node {}",
                num, placement.cost, placement.slots, placement.node
            );
            needed -= num;
            num = align2(needed, self.tree.nr_slots());
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_of(slots: &[usize]) -> Devmask {
        let mut mask = Devmask::new(8).unwrap();
        for &slot in slots {
            mask.set_slot(slot).unwrap();
        }
        mask
    }

    fn masks(avail: &[usize], used: &[usize]) -> (Devmask, Devmask) {
        (mask_of(avail), mask_of(used))
    }

    #[test]
    fn test_align2() {
        assert_eq!(align2(1, 8), 1);
        assert_eq!(align2(2, 8), 2);
        assert_eq!(align2(3, 8), 2);
        assert_eq!(align2(4, 8), 4);
        assert_eq!(align2(5, 8), 4);
        assert_eq!(align2(7, 8), 4);
        assert_eq!(align2(8, 8), 8);
        assert_eq!(align2(9, 8), 8);
        assert_eq!(align2(1, 1), 1);
    }

    #[test]
    fn test_cost_of_empty_pool() {
        let tree = DeviceTree::new(8).unwrap();
        let costs = CostMatrix::reference();
        let (mut avail, mut used) = masks(&[], &[]);
        let ranker = Ranker::new(&tree, &costs, &mut avail, &mut used).unwrap();

        let (cost, slots) = ranker.node_cost(tree.root());
        assert_eq!(cost, 0);
        assert!(slots.is_empty());
    }

    #[test]
    fn test_cost_includes_in_use() {
        let tree = DeviceTree::new(8).unwrap();
        let costs = CostMatrix::reference();
        // Slots 2,3 free inside the probed span, slot 0 owned elsewhere.
        let (mut avail, mut used) = masks(&[2, 3], &[0]);
        let ranker = Ranker::new(&tree, &costs, &mut avail, &mut used).unwrap();

        let node = (0..tree.nr_nodes())
            .find(|&id| tree.span(id) == (2..4))
            .unwrap();
        let (cost, slots) = ranker.node_cost(node);
        // Pairs (0,2), (0,3) at 10 each plus (2,3) at 1.
        assert_eq!(cost, 21);
        assert_eq!(slots, vec![2, 3]);
    }

    #[test]
    fn test_exact_fit_wins() {
        let tree = DeviceTree::new(8).unwrap();
        let costs = CostMatrix::reference();
        let (mut avail, mut used) = masks(&[4, 5, 6, 7], &[]);
        let ranker = Ranker::new(&tree, &costs, &mut avail, &mut used).unwrap();

        let placement = ranker.do_ranking(Some(tree.root()), 4).unwrap();
        assert_eq!(placement.slots, vec![4, 5, 6, 7]);
        assert_eq!(tree.span(placement.node), 4..8);
    }

    #[test]
    fn test_fragmented_chunk_infeasible() {
        let tree = DeviceTree::new(8).unwrap();
        let costs = CostMatrix::reference();
        // Two free slots, but in different pairs: no 2-wide span is free.
        let (mut avail, mut used) = masks(&[0, 2], &[]);
        let ranker = Ranker::new(&tree, &costs, &mut avail, &mut used).unwrap();

        assert!(ranker.do_ranking(Some(tree.root()), 2).is_none());
        assert!(ranker.do_ranking(Some(tree.root()), 1).is_some());
    }

    #[test]
    fn test_in_use_pulls_chunk_near() {
        let tree = DeviceTree::new(8).unwrap();
        let costs = CostMatrix::reference();
        // Tenant already owns slot 4; the cheapest single slot is its pair
        // sibling 5, not the lexically first free slot.
        let (mut avail, mut used) = masks(&[0, 1, 5, 7], &[4]);
        let ranker = Ranker::new(&tree, &costs, &mut avail, &mut used).unwrap();

        let placement = ranker.do_ranking(Some(tree.root()), 1).unwrap();
        assert_eq!(placement.slots, vec![5]);
    }

    #[test]
    fn test_rank_commits_chunks() {
        let tree = DeviceTree::new(8).unwrap();
        let costs = CostMatrix::reference();
        let (mut avail, mut used) = masks(&[0, 1, 2, 3, 4, 5, 6, 7], &[]);

        let mut ranker = Ranker::new(&tree, &costs, &mut avail, &mut used).unwrap();
        assert!(ranker.rank(5));

        // 5 = 4 + 1 committed, masks stay disjoint.
        assert_eq!(avail.weight(), 3);
        assert_eq!(used.weight(), 5);
        assert_eq!(used.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert!(avail.and(&used).unwrap().is_empty());
    }

    #[test]
    fn test_rank_halves_under_fragmentation() {
        let tree = DeviceTree::new(8).unwrap();
        let costs = CostMatrix::reference();
        let (mut avail, mut used) = masks(&[0, 2], &[]);

        let mut ranker = Ranker::new(&tree, &costs, &mut avail, &mut used).unwrap();
        assert!(ranker.rank(2));
        assert_eq!(used.iter().collect::<Vec<_>>(), vec![0, 2]);
        assert!(avail.is_empty());
    }

    #[test]
    fn test_rank_insufficient() {
        let tree = DeviceTree::new(8).unwrap();
        let costs = CostMatrix::reference();
        let (mut avail, mut used) = masks(&[0, 4], &[]);

        let mut ranker = Ranker::new(&tree, &costs, &mut avail, &mut used).unwrap();
        assert!(!ranker.rank(3));
    }

    #[test]
    fn test_ranker_rejects_overlap() {
        let tree = DeviceTree::new(8).unwrap();
        let costs = CostMatrix::reference();
        let (mut avail, mut used) = masks(&[0, 1, 2, 3], &[3, 4, 5]);
        assert!(Ranker::new(&tree, &costs, &mut avail, &mut used).is_err());
    }

    #[test]
    fn test_ranker_rejects_width_mismatch() {
        let tree = DeviceTree::new(8).unwrap();
        let costs = CostMatrix::reference();
        let mut avail = Devmask::new(4).unwrap();
        let mut used = Devmask::new(8).unwrap();
        assert!(Ranker::new(&tree, &costs, &mut avail, &mut used).is_err());

        let narrow = CostMatrix::new(vec![vec![0, 1], vec![1, 0]]).unwrap();
        let mut avail = Devmask::new(8).unwrap();
        assert!(Ranker::new(&tree, &narrow, &mut avail, &mut used).is_err());
    }
}
