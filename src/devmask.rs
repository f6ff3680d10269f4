// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Device Mask
//!
//! Fixed-width bitmaps over the slots of a device pool. One allocation pass
//! works with two of these: the slots still free for the request and the
//! slots the tenant already owns. Mask state only ever comes from the
//! allocator's id-to-slot dictionary, so there are no string mask formats
//! here; a mask displays as its set slots purely for diagnostics.
//!
//! Unlike a host cpumask, the width is not a global property: every pool
//! carries its own slot count, fixed per mask at creation, and operations
//! that mix two masks insist on equal widths instead of truncating.
//!
//!```
//!     use gpu_affinity::Devmask;
//!     let mut mask = Devmask::new(8).unwrap();
//!     assert!(!mask.test_slot(3));
//!     mask.set_slot(3).unwrap();
//!     assert!(mask.test_slot(3));
//!     assert_eq!(mask.weight(), 1);
//!```

use anyhow::bail;
use anyhow::Result;
use bitvec::prelude::*;
use std::fmt;

#[derive(Debug, Eq, Clone, Hash, Ord, PartialEq, PartialOrd)]
pub struct Devmask {
    mask: BitVec<u64, Lsb0>,
}

impl Devmask {
    /// Build a new empty Devmask over `nr_slots` slots.
    pub fn new(nr_slots: usize) -> Result<Devmask> {
        if nr_slots == 0 {
            bail!("Devmask must span at least one slot");
        }
        Ok(Devmask {
            mask: bitvec![u64, Lsb0; 0; nr_slots],
        })
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        if slot >= self.mask.len() {
            bail!("Slot {} outside pool of {} slots", slot, self.mask.len());
        }

        Ok(())
    }

    /// Set a bit in the Devmask. Errors when `slot` lies outside the pool.
    pub fn set_slot(&mut self, slot: usize) -> Result<()> {
        self.check_slot(slot)?;
        self.mask.set(slot, true);
        Ok(())
    }

    /// Clear a bit from the Devmask. Errors when `slot` lies outside the
    /// pool.
    pub fn clear_slot(&mut self, slot: usize) -> Result<()> {
        self.check_slot(slot)?;
        self.mask.set(slot, false);
        Ok(())
    }

    /// Whether `slot` is set. Slots outside the pool read as unset.
    pub fn test_slot(&self, slot: usize) -> bool {
        self.mask.get(slot).is_some_and(|bit| *bit)
    }

    /// Count the number of bits set in the Devmask.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    /// Return true if the Devmask has no bit set, false otherwise.
    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    /// The total width of the Devmask.
    pub fn len(&self) -> usize {
        self.mask.len()
    }

    /// The intersection of two masks. The masks must have equal widths.
    pub fn and(&self, other: &Devmask) -> Result<Devmask> {
        if self.mask.len() != other.mask.len() {
            bail!(
                "Devmask width mismatch: {} vs {}",
                self.mask.len(),
                other.mask.len()
            );
        }
        let mut new = self.clone();
        new.mask &= other.mask.clone();
        Ok(new)
    }

    /// The indices of the set slots, ascending.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.mask.iter_ones()
    }
}

impl fmt::Display for Devmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        for (i, slot) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", slot)?;
        }
        Ok(())
    }
}
