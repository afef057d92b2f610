// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-resource interest bookkeeping.

use chrono::{DateTime, Utc};

use super::priority::{PriorityKey, Rank};
use super::types::{EntryId, FetchTag, MediaResource};

/// Monotonic id distinguishing successive entries created under one identity.
pub type Episode = u64;

/// Interest in one resource within one category.
///
/// Entries are owned by their [`CategoryContext`](super::CategoryContext) and
/// only reachable through it by [`EntryId`].
#[derive(Debug, Clone)]
pub struct Entry {
    pub id: EntryId,
    pub episode: Episode,
    pub resource: MediaResource,
    pub fetch_tag: Option<FetchTag>,
    pub created_at: DateTime<Utc>,
    reference_count: i32,
    elevated_reference_count: i32,
    user_initiated_indices: Vec<u64>,
    recency: u64,
}

impl Entry {
    pub fn new(
        id: EntryId,
        episode: Episode,
        resource: MediaResource,
        fetch_tag: Option<FetchTag>,
    ) -> Self {
        Self {
            id,
            episode,
            resource,
            fetch_tag,
            created_at: Utc::now(),
            reference_count: 0,
            elevated_reference_count: 0,
            user_initiated_indices: Vec::new(),
            recency: 0,
        }
    }

    pub fn reference_count(&self) -> i32 {
        self.reference_count
    }

    pub fn elevated_reference_count(&self) -> i32 {
        self.elevated_reference_count
    }

    /// User-initiated indices, ascending; the last one is the most recent.
    pub fn user_initiated_indices(&self) -> &[u64] {
        &self.user_initiated_indices
    }

    /// Current scheduling priority, or `None` once nobody wants the entry.
    pub fn priority_key(&self) -> Option<PriorityKey> {
        if self.is_wanted() {
            Some(PriorityKey::new(
                self.id.location_key,
                self.elevated_reference_count > 0,
                self.user_initiated_indices.last().copied(),
            ))
        } else {
            None
        }
    }

    /// Priority key with recency, or `None` once nobody wants the entry.
    pub fn rank(&self) -> Option<Rank> {
        self.priority_key().map(|key| Rank::new(key, self.recency))
    }

    /// Position of the last creation or retain in the owning category.
    pub fn recency(&self) -> u64 {
        self.recency
    }

    pub(crate) fn touch(&mut self, recency: u64) {
        self.recency = recency;
    }

    fn is_wanted(&self) -> bool {
        self.reference_count > 0
            || (self.reference_count == 0 && !self.user_initiated_indices.is_empty())
    }

    /// Register one more interested subscriber.
    pub fn retain(&mut self, elevated: bool, user_initiated_index: Option<u64>) {
        debug_assert!(self.reference_count >= 0, "retain on an entry being removed");
        self.reference_count += 1;
        if elevated {
            self.elevated_reference_count += 1;
        }
        if let Some(index) = user_initiated_index {
            let position = self
                .user_initiated_indices
                .binary_search(&index)
                .unwrap_or_else(|position| position);
            self.user_initiated_indices.insert(position, index);
        }
    }

    /// Undo exactly what a matching [`retain`](Self::retain) did.
    pub fn release(&mut self, elevated: bool, user_initiated_index: Option<u64>) {
        self.reference_count -= 1;
        debug_assert!(self.reference_count >= 0, "reference count dropped below zero");
        if elevated {
            self.elevated_reference_count -= 1;
            debug_assert!(
                self.elevated_reference_count >= 0,
                "elevated reference count dropped below zero"
            );
        }
        if let Some(index) = user_initiated_index {
            match self.user_initiated_indices.binary_search(&index) {
                Ok(position) => {
                    self.user_initiated_indices.remove(position);
                }
                Err(_) => debug_assert!(false, "unknown user-initiated index {index}"),
            }
        }
    }

    /// Mark the entry as being torn down regardless of its counts.
    pub fn mark_removed(&mut self) {
        self.reference_count = -1;
        self.user_initiated_indices.clear();
    }
}
