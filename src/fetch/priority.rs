// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Priority ordering used to pick the active entry of a category.

use std::cmp::Ordering;

use serde::Serialize;

use super::types::LocationKey;

/// Scheduling priority of an entry.
///
/// `a > b` means `a` is more eligible to hold the active fetch. Precedence:
///
/// 1. a user-initiated request outranks none,
/// 2. between two user-initiated requests the most recent (larger index) wins,
/// 3. elevated outranks normal,
/// 4. the larger location key wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PriorityKey {
    pub location_key: LocationKey,
    pub has_elevated_priority: bool,
    pub user_initiated_priority: Option<u64>,
}

impl PriorityKey {
    pub fn new(
        location_key: LocationKey,
        has_elevated_priority: bool,
        user_initiated_priority: Option<u64>,
    ) -> Self {
        Self {
            location_key,
            has_elevated_priority,
            user_initiated_priority,
        }
    }

    /// Returns true if `self` should replace `other` as the active entry.
    pub fn outranks(&self, other: &PriorityKey) -> bool {
        self > other
    }
}

impl Ord for PriorityKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // Option<u64> orders None below any Some, and larger indices above smaller.
        self.user_initiated_priority
            .cmp(&other.user_initiated_priority)
            .then_with(|| self.has_elevated_priority.cmp(&other.has_elevated_priority))
            .then_with(|| self.location_key.cmp(&other.location_key))
    }
}

impl PartialOrd for PriorityKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A [`PriorityKey`] plus the recency of the entry holding it.
///
/// Among equal keys the entry created or retained most recently ranks higher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Rank {
    pub key: PriorityKey,
    pub recency: u64,
}

impl Rank {
    pub fn new(key: PriorityKey, recency: u64) -> Self {
        Self { key, recency }
    }
}
