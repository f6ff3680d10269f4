// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Communication Cost Matrix
//!
//! A read-only M x M table giving the pairwise communication cost between any
//! two device slots of a pool. Entries encode interconnect tiers: slots on
//! the same tight link are cheapest, slots that only reach each other across
//! the top-level interconnect are the most expensive.
//!
//! The matrix is symmetric with a zero diagonal. The width does not have to
//! be a power of two; the topology tree enforces that constraint separately
//! on the pool.

use anyhow::bail;
use anyhow::Result;

lazy_static::lazy_static! {
    /// Pairwise costs of the reference 8-slot topology: two quads of two
    /// tight pairs each. 1 = same pair, 10 = same quad, 100 = cross-quad.
    static ref REFERENCE_COSTS: CostMatrix = CostMatrix::new(vec![
        vec![0, 1, 10, 10, 100, 100, 100, 100],
        vec![1, 0, 10, 10, 100, 100, 100, 100],
        vec![10, 10, 0, 1, 100, 100, 100, 100],
        vec![10, 10, 1, 0, 100, 100, 100, 100],
        vec![100, 100, 100, 100, 0, 1, 10, 10],
        vec![100, 100, 100, 100, 1, 0, 10, 10],
        vec![100, 100, 100, 100, 10, 10, 0, 1],
        vec![100, 100, 100, 100, 10, 10, 1, 0],
    ]).unwrap();
}

#[derive(Clone, Debug)]
pub struct CostMatrix {
    rows: Vec<Vec<u64>>,
    max_cost: u64,
}

impl CostMatrix {
    /// Build a cost matrix from its rows. The rows must form a square,
    /// symmetric matrix with a zero diagonal.
    pub fn new(rows: Vec<Vec<u64>>) -> Result<CostMatrix> {
        let nr_slots = rows.len();
        if nr_slots == 0 {
            bail!("Cost matrix must span at least one slot");
        }
        for (i, row) in rows.iter().enumerate() {
            if row.len() != nr_slots {
                bail!(
                    "Cost matrix row {} has {} entries, expected {}",
                    i,
                    row.len(),
                    nr_slots
                );
            }
            if row[i] != 0 {
                bail!("Cost matrix diagonal entry [{}][{}] is {}", i, i, row[i]);
            }
        }
        for i in 0..nr_slots {
            for j in (i + 1)..nr_slots {
                if rows[i][j] != rows[j][i] {
                    bail!(
                        "Cost matrix is not symmetric: [{}][{}]={} vs [{}][{}]={}",
                        i,
                        j,
                        rows[i][j],
                        j,
                        i,
                        rows[j][i]
                    );
                }
            }
        }

        let max_cost = rows
            .iter()
            .flat_map(|row| row.iter().copied())
            .max()
            .unwrap_or(0);

        Ok(CostMatrix { rows, max_cost })
    }

    /// The matrix of the reference 8-slot topology.
    pub fn reference() -> CostMatrix {
        REFERENCE_COSTS.clone()
    }

    /// The number of slots the matrix covers.
    pub fn nr_slots(&self) -> usize {
        self.rows.len()
    }

    /// Communication cost between two slots.
    pub fn between(&self, i: usize, j: usize) -> u64 {
        self.rows[i][j]
    }

    /// The largest single entry in the matrix.
    pub fn max_cost(&self) -> u64 {
        self.max_cost
    }

    /// A cost strictly larger than any reachable sum of pairwise costs,
    /// usable as an infeasibility marker in diagnostics.
    pub fn unreachable(&self) -> u64 {
        let m = self.rows.len() as u64;
        m * (m - 1) / 2 * self.max_cost + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_shape() {
        let costs = CostMatrix::reference();
        assert_eq!(costs.nr_slots(), 8);
        for i in 0..8 {
            assert_eq!(costs.between(i, i), 0);
            for j in 0..8 {
                assert_eq!(costs.between(i, j), costs.between(j, i));
            }
        }
        assert_eq!(costs.between(0, 1), 1);
        assert_eq!(costs.between(0, 2), 10);
        assert_eq!(costs.between(0, 4), 100);
        assert_eq!(costs.max_cost(), 100);
    }

    #[test]
    fn test_unreachable_dominates() {
        let costs = CostMatrix::reference();
        // Sum over all 28 pairs of the full reference pool, the largest
        // reachable augmented cost.
        let mut total = 0;
        for i in 0..8 {
            for j in (i + 1)..8 {
                total += costs.between(i, j);
            }
        }
        assert!(costs.unreachable() > total);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(CostMatrix::new(vec![]).is_err());
        // Ragged.
        assert!(CostMatrix::new(vec![vec![0, 1], vec![1, 0, 2]]).is_err());
        // Nonzero diagonal.
        assert!(CostMatrix::new(vec![vec![1, 1], vec![1, 0]]).is_err());
        // Asymmetric.
        assert!(CostMatrix::new(vec![vec![0, 1], vec![2, 0]]).is_err());
    }

    #[test]
    fn test_single_slot() {
        let costs = CostMatrix::new(vec![vec![0]]).unwrap();
        assert_eq!(costs.nr_slots(), 1);
        assert_eq!(costs.max_cost(), 0);
        assert_eq!(costs.unreachable(), 1);
    }
}
