// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Helios-Proprietary
// See LICENSE in the repository root for full license terms.

//! Process-group context
//!
//! The reconstruction runs single-program-multiple-data across a fixed
//! group of worker processes. Components that partition work (the
//! file-backed optimizer, shard readers) receive the group explicitly —
//! there is no ambient rank/size state to read. Slice ownership is
//! round-robin by leading-axis index; every process must be constructed
//! with the same `size` or the disjointness guarantee breaks, which is
//! the driver's invariant to uphold, not checkable here.

use serde::{Deserialize, Serialize};

/// Rank and size of the cooperating process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessGroup {
    pub rank: usize,
    pub size: usize,
}

impl ProcessGroup {
    pub fn new(rank: usize, size: usize) -> Self {
        assert!(size > 0, "process group cannot be empty");
        assert!(rank < size, "rank {} out of range for size {}", rank, size);
        Self { rank, size }
    }

    /// A lone process (rank 0 of 1).
    pub fn single() -> Self {
        Self { rank: 0, size: 1 }
    }

    /// Round-robin slice ownership: this process owns leading-axis index
    /// `i` iff `i mod size == rank`.
    #[inline]
    pub fn owns_slice(&self, index: usize) -> bool {
        index % self.size == self.rank
    }

    /// Indices of the slices this process owns, in ascending order.
    pub fn owned_slices(&self, n_slices: usize) -> impl Iterator<Item = usize> {
        (self.rank..n_slices).step_by(self.size)
    }
}
