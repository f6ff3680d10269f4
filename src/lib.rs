// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Topology-aware GPU allocation
//!
//! This crate is the allocation core of a node-level device manager for
//! hosts with a fixed accelerator interconnect topology (NVLink pairs inside
//! PCIe quads and so on). Given a request for N devices out of a pool of M
//! identical devices, it picks the N free devices that minimize the total
//! pairwise communication cost of the tenant's device set, counting devices
//! the tenant already owns.
//!
//! The pool is modeled as a complete binary tree over the slot range
//! `[0, M)` ([`DeviceTree`]), with a symmetric M x M cost table
//! ([`CostMatrix`]) and two per-request bitmaps ([`Devmask`]) tracking free
//! and in-use slots. The request is decomposed into power-of-two chunks and
//! each chunk is placed by a recursive ranking kernel ([`Ranker`]) that
//! prefers the tightest fully-free subtree and breaks cost ties by
//! comparing progressively wider neighbourhoods.
//!
//! The device manager talks to the [`DeviceAllocator`] façade, which maps
//! opaque device identifiers onto bitmap slots and back:
//!
//!```
//!     use gpu_affinity::{CostMatrix, DeviceAllocator};
//!     use std::collections::{BTreeMap, BTreeSet};
//!
//!     let slot_index: BTreeMap<String, usize> =
//!         (0..8).map(|slot| (format!("gpu-{slot}"), slot)).collect();
//!     let allocator =
//!         DeviceAllocator::new("nvidia.com/gpu", slot_index, CostMatrix::reference()).unwrap();
//!
//!     let available: BTreeSet<String> = (0..8).map(|slot| format!("gpu-{slot}")).collect();
//!     let picked = allocator
//!         .calc_allocated("nvidia.com/gpu", 2, &BTreeSet::new(), &available)
//!         .unwrap();
//!     assert_eq!(picked, vec!["gpu-0", "gpu-1"]);
//!```
//!
//! The [`score`] module carries the scheduler-side companion arithmetic
//! that ranks whole machines by how few GPUs they would have left; it is
//! independent of the per-device allocation path.

mod devmask;
pub use devmask::Devmask;

mod cost;
pub use cost::CostMatrix;

mod topology;
pub use topology::DeviceTree;
pub use topology::NodeId;

mod rank;
pub use rank::align2;
pub use rank::Placement;
pub use rank::Ranker;

mod allocator;
pub use allocator::DeviceAllocator;

pub mod score;
