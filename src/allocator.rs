// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Device Allocator
//!
//! The façade a device manager calls to pick devices for a tenant. It
//! translates opaque device identifiers into bitmap slots through the pool's
//! id-to-slot dictionary, drives the ranking decomposer over the topology
//! tree, and translates the committed slots back into identifiers.
//!
//! Only the topology-governed resource gets topology-aware placement. For
//! any other resource, or whenever the inputs cannot be mapped onto the
//! bitmap, the allocator degrades to handing out the first N available
//! identifiers; a request that cannot be satisfied at all yields None and
//! the caller is expected to reject admission rather than retry.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use anyhow::bail;
use anyhow::Result;
use log::debug;
use log::error;

use crate::cost::CostMatrix;
use crate::devmask::Devmask;
use crate::rank::Ranker;
use crate::topology::DeviceTree;

pub struct DeviceAllocator {
    resource: String,
    slot_index: BTreeMap<String, usize>,
    costs: CostMatrix,
}

impl DeviceAllocator {
    /// Build an allocator for `resource` over the pool described by
    /// `slot_index`, which maps each device identifier to its bitmap slot.
    /// The dictionary must assign every slot of `[0, M)` exactly once, M
    /// must be a power of two matching the cost matrix width.
    pub fn new(
        resource: impl Into<String>,
        slot_index: BTreeMap<String, usize>,
        costs: CostMatrix,
    ) -> Result<DeviceAllocator> {
        let nr_slots = slot_index.len();
        if nr_slots == 0 || !nr_slots.is_power_of_two() {
            bail!("Pool size {} is not a power of two >= 1", nr_slots);
        }
        if costs.nr_slots() != nr_slots {
            bail!(
                "Cost matrix covers {} slots, pool has {}",
                costs.nr_slots(),
                nr_slots
            );
        }
        let mut seen = vec![false; nr_slots];
        for (id, &slot) in slot_index.iter() {
            if slot >= nr_slots {
                bail!("Device {} maps to slot {} beyond the pool", id, slot);
            }
            if seen[slot] {
                bail!("Slot {} is mapped by more than one device", slot);
            }
            seen[slot] = true;
        }

        Ok(DeviceAllocator {
            resource: resource.into(),
            slot_index,
            costs,
        })
    }

    /// The resource name this allocator places topologically.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The number of slots in the pool.
    pub fn nr_slots(&self) -> usize {
        self.slot_index.len()
    }

    /// Pick `needed` devices out of `available` for a tenant that already
    /// owns `in_use`, minimizing the pairwise communication cost of the
    /// tenant's joint device set. Returns the picked identifiers, or None
    /// when the request cannot be satisfied.
    pub fn calc_allocated(
        &self,
        resource: &str,
        needed: usize,
        in_use: &BTreeSet<String>,
        available: &BTreeSet<String>,
    ) -> Option<Vec<String>> {
        if resource != self.resource || self.slot_index.is_empty() {
            return first_n(available, needed);
        }

        let nr_slots = self.slot_index.len();

        let mut avail = match self.to_mask(resource, available, nr_slots) {
            Some(mask) => mask,
            None => return first_n(available, needed),
        };
        let mut used = match self.to_mask(resource, in_use, nr_slots) {
            Some(mask) => mask,
            None => return first_n(available, needed),
        };
        debug!("allocating {} of {}: avail {} used {}", needed, resource, avail, used);

        if avail.weight() < needed {
            error!(
                "request for {} {} devices with only {} available",
                needed,
                resource,
                avail.weight()
            );
            return None;
        }

        let tree = match DeviceTree::new(nr_slots) {
            Ok(tree) => tree,
            Err(err) => {
                error!("device topology unavailable: {}", err);
                return first_n(available, needed);
            }
        };

        // Snapshot the availability so the committed slots can be recovered
        // as a diff after ranking.
        let snapshot = avail.clone();

        let mut ranker = match Ranker::new(&tree, &self.costs, &mut avail, &mut used) {
            Ok(ranker) => ranker,
            Err(err) => {
                error!("cannot rank {}: {}", resource, err);
                return first_n(available, needed);
            }
        };
        if !ranker.rank(needed) {
            return first_n(available, needed);
        }

        let mut ret = Vec::new();
        for (id, &slot) in self.slot_index.iter() {
            if snapshot.test_slot(slot) && !avail.test_slot(slot) {
                debug!("allocated {} slot {}", id, slot);
                ret.push(id.clone());
            }
        }
        Some(ret)
    }

    fn to_mask(
        &self,
        resource: &str,
        ids: &BTreeSet<String>,
        nr_slots: usize,
    ) -> Option<Devmask> {
        let mut mask = Devmask::new(nr_slots).ok()?;
        for id in ids {
            match self.slot_index.get(id) {
                Some(&slot) => {
                    let _ = mask.set_slot(slot);
                }
                None => {
                    error!("no bitmap slot for {} device {}", resource, id);
                    return None;
                }
            }
        }
        Some(mask)
    }
}

/// The degraded pick: the first `needed` identifiers in lexicographic
/// order, topology ignored.
fn first_n(available: &BTreeSet<String>, needed: usize) -> Option<Vec<String>> {
    if available.len() < needed {
        return None;
    }
    Some(available.iter().take(needed).cloned().collect())
}
