// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Point-in-time views of the scheduler, for diagnostics and tests.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::category::{ActivationPolicy, CategoryContext};
use super::entry::{Entry, Episode};
use super::priority::PriorityKey;
use super::types::{EntryId, FetchCategory, ResourceStatus};

/// State of one entry.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySnapshot {
    pub id: EntryId,
    pub episode: Episode,
    pub reference_count: i32,
    pub elevated_reference_count: i32,
    pub user_initiated_indices: Vec<u64>,
    pub priority: Option<PriorityKey>,
    /// Tie-break among equal priorities; larger is more recent
    pub recency: u64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// State of one status context.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub id: EntryId,
    pub has_entry: bool,
    pub subscribers: usize,
    pub combined_status: Option<ResourceStatus>,
    pub is_polling: bool,
}

/// State of one category.
#[derive(Debug, Clone, Serialize)]
pub struct CategorySnapshot {
    pub category: FetchCategory,
    pub policy: ActivationPolicy,
    /// Sorted by descending priority.
    pub entries: Vec<EntrySnapshot>,
    pub top: Option<EntryId>,
    pub active: Vec<EntryId>,
    pub status: Vec<StatusSnapshot>,
}

impl CategorySnapshot {
    pub(crate) fn capture(category: FetchCategory, context: &CategoryContext) -> Self {
        let mut entries: Vec<EntrySnapshot> = context
            .entries()
            .map(|entry| EntrySnapshot::capture(entry, context.is_active(&entry.id)))
            .collect();
        entries.sort_by(|lhs, rhs| {
            (rhs.priority, rhs.recency).cmp(&(lhs.priority, lhs.recency))
        });

        let mut active: Vec<EntryId> = context.active_ids().cloned().collect();
        active.sort_by(|lhs, rhs| lhs.resource_id.cmp(&rhs.resource_id));

        let mut status: Vec<StatusSnapshot> = context
            .status_contexts()
            .map(|(id, status)| StatusSnapshot {
                id: id.clone(),
                has_entry: status.has_entry(),
                subscribers: status.subscriber_count(),
                combined_status: status.combined_status(),
                is_polling: status.is_polling(),
            })
            .collect();
        status.sort_by(|lhs, rhs| lhs.id.resource_id.cmp(&rhs.id.resource_id));

        Self {
            category,
            policy: context.policy(),
            entries,
            top: context.top().map(|(id, _)| id.clone()),
            active,
            status,
        }
    }

    pub fn entry(&self, id: &EntryId) -> Option<&EntrySnapshot> {
        self.entries.iter().find(|entry| &entry.id == id)
    }

    pub fn is_active(&self, id: &EntryId) -> bool {
        self.active.contains(id)
    }
}

impl EntrySnapshot {
    fn capture(entry: &Entry, is_active: bool) -> Self {
        Self {
            id: entry.id.clone(),
            episode: entry.episode,
            reference_count: entry.reference_count(),
            elevated_reference_count: entry.elevated_reference_count(),
            user_initiated_indices: entry.user_initiated_indices().to_vec(),
            priority: entry.priority_key(),
            recency: entry.recency(),
            is_active,
            created_at: entry.created_at,
        }
    }
}

/// State of the whole manager.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerSnapshot {
    /// Non-empty categories, in category order.
    pub categories: Vec<CategorySnapshot>,
    /// Interactive fetches that have not been released yet.
    pub open_tickets: usize,
    pub next_episode: Episode,
    pub taken_at: DateTime<Utc>,
}

impl ManagerSnapshot {
    pub fn category(&self, category: FetchCategory) -> Option<&CategorySnapshot> {
        self.categories.iter().find(|c| c.category == category)
    }

    pub fn entry(&self, category: FetchCategory, id: &EntryId) -> Option<&EntrySnapshot> {
        self.category(category)?.entry(id)
    }

    pub fn is_active(&self, category: FetchCategory, id: &EntryId) -> bool {
        self.category(category)
            .map(|c| c.is_active(id))
            .unwrap_or(false)
    }

    pub fn active_count(&self) -> usize {
        self.categories.iter().map(|c| c.active.len()).sum()
    }

    /// True when no category holds any state.
    pub fn is_idle(&self) -> bool {
        self.categories.is_empty()
    }
}
