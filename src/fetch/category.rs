// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-category scheduler.
//!
//! A [`CategoryContext`] owns every [`Entry`], active fetch and
//! [`StatusContext`] of one category. It is only ever touched from the fetch
//! manager's worker task, so nothing here is synchronised.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::backend::TaskHandle;
use super::entry::{Entry, Episode};
use super::priority::Rank;
use super::status::StatusContext;
use super::types::EntryId;

/// Which wanted entries get a running backend fetch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActivationPolicy {
    /// Every wanted entry is fetched; the top entry is only tracked.
    #[default]
    AllPending,
    /// Only the top entry of a category is fetched. Others are demoted.
    TopPriorityOnly,
}

impl FromStr for ActivationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "all_pending" | "all" => Ok(ActivationPolicy::AllPending),
            "top_priority_only" | "top" => Ok(ActivationPolicy::TopPriorityOnly),
            other => Err(format!(
                "unknown activation policy '{}' (expected all-pending or top-priority-only)",
                other
            )),
        }
    }
}

impl fmt::Display for ActivationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivationPolicy::AllPending => f.write_str("all-pending"),
            ActivationPolicy::TopPriorityOnly => f.write_str("top-priority-only"),
        }
    }
}

/// Starts backend fetches on behalf of a [`CategoryContext`].
pub trait FetchLauncher {
    fn launch(&self, id: &EntryId, entry: &Entry) -> TaskHandle;
}

/// Scheduling state of one fetch category.
#[derive(Debug)]
pub struct CategoryContext {
    policy: ActivationPolicy,
    top: Option<(EntryId, Rank)>,
    next_recency: u64,
    entries: HashMap<EntryId, Entry>,
    active: HashMap<EntryId, TaskHandle>,
    status: HashMap<EntryId, StatusContext>,
}

impl CategoryContext {
    pub fn new(policy: ActivationPolicy) -> Self {
        Self {
            policy,
            top: None,
            next_recency: 0,
            entries: HashMap::new(),
            active: HashMap::new(),
            status: HashMap::new(),
        }
    }

    /// Look up (or create via `factory`) the entry for `id`, apply `mutator`,
    /// then reschedule.
    ///
    /// Creating the entry or raising its reference count makes it the most
    /// recent entry of the category, which wins ties between equal keys.
    ///
    /// Returns `None` without calling `mutator` when there is no entry and no
    /// factory.
    pub fn with_entry<R>(
        &mut self,
        id: &EntryId,
        factory: Option<&mut dyn FnMut() -> Entry>,
        launcher: &dyn FetchLauncher,
        mutator: impl FnOnce(&mut Entry) -> R,
    ) -> Option<R> {
        let (previous_rank, previous_count) = if let Some(entry) = self.entries.get(id) {
            (entry.rank(), Some(entry.reference_count()))
        } else if let Some(factory) = factory {
            let entry = factory();
            debug_assert_eq!(&entry.id, id, "factory built an entry for another identity");
            tracing::debug!(entry = %id, episode = entry.episode, "Created fetch entry");
            self.entries.insert(id.clone(), entry);
            (None, None)
        } else {
            return None;
        };

        let entry = self.entries.get_mut(id)?;
        let result = mutator(entry);
        if previous_count.map_or(true, |count| entry.reference_count() > count) {
            entry.touch(self.next_recency);
            self.next_recency += 1;
        }
        let updated_rank = entry.rank();

        let mut removed_entries = false;
        match updated_rank {
            Some(rank) => {
                if previous_rank != updated_rank {
                    self.update_top(id, rank);
                }
            }
            None => {
                self.entries.remove(id);
                if self.top_is(id) {
                    self.top = None;
                }
                removed_entries = true;
                tracing::debug!(entry = %id, "Removed fetch entry");
            }
        }
        if self.top.is_none() {
            self.refresh_top();
        }

        self.activate(launcher);

        if removed_entries {
            self.stop_orphaned_fetches();
        }

        if previous_rank.is_some() != updated_rank.is_some() {
            self.sync_status_entry(id, updated_rank.is_some());
        }

        Some(result)
    }

    /// Drop all interest in `id` regardless of reference counts.
    ///
    /// When no entry matches `id` exactly, the first entry with the same
    /// resource id is cancelled instead. Returns the identity that was
    /// removed, if any.
    pub fn cancel_entry(&mut self, id: &EntryId, launcher: &dyn FetchLauncher) -> Option<EntryId> {
        let target = if self.entries.contains_key(id) {
            id.clone()
        } else {
            self.entries
                .keys()
                .find(|key| key.resource_id == id.resource_id)
                .cloned()
                .unwrap_or_else(|| id.clone())
        };

        let removed = match self.entries.remove(&target) {
            Some(mut entry) => {
                entry.mark_removed();
                tracing::debug!(entry = %target, episode = entry.episode, "Cancelled fetch entry");
                self.sync_status_entry(&target, false);
                Some(target.clone())
            }
            None => None,
        };

        self.stop_fetch(&target);

        if self.top_is(&target) {
            self.top = None;
            self.refresh_top();
        }

        self.activate(launcher);
        removed
    }

    /// Run `mutator` on the status context of `id`, creating it if needed and
    /// dropping it afterwards if it is empty.
    pub fn with_status_context<R>(
        &mut self,
        id: &EntryId,
        mutator: impl FnOnce(&mut StatusContext) -> R,
    ) -> R {
        let has_entry = self.entries.contains_key(id);
        let context = self
            .status
            .entry(id.clone())
            .or_insert_with(|| StatusContext::new(has_entry));

        let result = mutator(context);

        if context.is_empty() {
            context.cancel_poll();
            self.status.remove(id);
        }
        result
    }

    /// True once the category holds no entries, fetches or status contexts.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.active.is_empty() && self.status.is_empty()
    }

    pub fn policy(&self) -> ActivationPolicy {
        self.policy
    }

    pub fn entry(&self, id: &EntryId) -> Option<&Entry> {
        self.entries.get(id)
    }

    /// Episode of the live entry at exactly `id`.
    pub fn episode_of(&self, id: &EntryId) -> Option<Episode> {
        self.entries.get(id).map(|entry| entry.episode)
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    pub fn top(&self) -> Option<&(EntryId, Rank)> {
        self.top.as_ref()
    }

    pub fn is_active(&self, id: &EntryId) -> bool {
        self.active.contains_key(id)
    }

    pub fn active_ids(&self) -> impl Iterator<Item = &EntryId> {
        self.active.keys()
    }

    pub fn status_context(&self, id: &EntryId) -> Option<&StatusContext> {
        self.status.get(id)
    }

    pub fn status_context_count(&self) -> usize {
        self.status.len()
    }

    pub fn status_contexts(&self) -> impl Iterator<Item = (&EntryId, &StatusContext)> {
        self.status.iter()
    }

    fn top_is(&self, id: &EntryId) -> bool {
        matches!(&self.top, Some((top_id, _)) if top_id == id)
    }

    fn update_top(&mut self, id: &EntryId, rank: Rank) {
        match &self.top {
            None => self.top = Some((id.clone(), rank)),
            Some((top_id, top_rank)) => {
                if top_id == id {
                    if rank < *top_rank {
                        // Got worse: someone else may be on top now.
                        self.top = None;
                    } else {
                        self.top = Some((id.clone(), rank));
                    }
                } else if rank > *top_rank {
                    self.top = Some((id.clone(), rank));
                }
            }
        }
    }

    fn refresh_top(&mut self) {
        // Recency is unique per category, so the maximum is unambiguous.
        self.top = self
            .entries
            .iter()
            .filter_map(|(id, entry)| entry.rank().map(|rank| (id, rank)))
            .max_by_key(|(_, rank)| *rank)
            .map(|(id, rank)| (id.clone(), rank));
    }

    fn activate(&mut self, launcher: &dyn FetchLauncher) {
        match self.policy {
            ActivationPolicy::AllPending => {
                for (id, entry) in &self.entries {
                    if !self.active.contains_key(id) {
                        tracing::debug!(entry = %id, "Starting fetch");
                        self.active.insert(id.clone(), launcher.launch(id, entry));
                    }
                }
            }
            ActivationPolicy::TopPriorityOnly => {
                let top_id = self.top.as_ref().map(|(id, _)| id.clone());
                let demoted: Vec<EntryId> = self
                    .active
                    .keys()
                    .filter(|id| Some(*id) != top_id.as_ref())
                    .cloned()
                    .collect();
                for id in demoted {
                    tracing::debug!(entry = %id, "Demoting fetch");
                    self.stop_fetch(&id);
                }

                if let Some(top_id) = top_id {
                    if !self.active.contains_key(&top_id) {
                        if let Some(entry) = self.entries.get(&top_id) {
                            tracing::debug!(entry = %top_id, "Starting fetch");
                            let handle = launcher.launch(&top_id, entry);
                            self.active.insert(top_id, handle);
                        }
                    }
                }
            }
        }
    }

    fn stop_fetch(&mut self, id: &EntryId) {
        if let Some(handle) = self.active.get_mut(id) {
            handle.cancel();
        }
        self.active.remove(id);
    }

    fn stop_orphaned_fetches(&mut self) {
        let orphaned: Vec<EntryId> = self
            .active
            .keys()
            .filter(|id| !self.entries.contains_key(*id))
            .cloned()
            .collect();
        for id in orphaned {
            tracing::debug!(entry = %id, "Stopping fetch without entry");
            self.stop_fetch(&id);
        }
    }

    fn sync_status_entry(&mut self, id: &EntryId, has_entry: bool) {
        let Some(context) = self.status.get_mut(id) else {
            return;
        };
        context.set_has_entry(has_entry);
        if context.is_empty() {
            context.cancel_poll();
            self.status.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::types::{
        FetchLocation, LocationKey, MediaResource, MessageId, PeerId, ResourceId, ResourceKind,
        ResourceStatus,
    };
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    /// Launcher that records starts and counts cancellations.
    #[derive(Default)]
    struct RecordingLauncher {
        started: RefCell<Vec<EntryId>>,
        cancelled: Arc<AtomicUsize>,
    }

    impl FetchLauncher for RecordingLauncher {
        fn launch(&self, id: &EntryId, _entry: &Entry) -> TaskHandle {
            self.started.borrow_mut().push(id.clone());
            let cancelled = self.cancelled.clone();
            TaskHandle::from_fn(move || {
                cancelled.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    fn id(resource: &str, message: i32) -> EntryId {
        let peer = PeerId(1);
        EntryId::new(
            FetchLocation::Chat(peer),
            ResourceId::new(resource),
            LocationKey::Message(MessageId::new(peer, message)),
        )
    }

    struct Harness {
        context: CategoryContext,
        launcher: RecordingLauncher,
        next_episode: Rc<RefCell<Episode>>,
    }

    impl Harness {
        fn new(policy: ActivationPolicy) -> Self {
            Self {
                context: CategoryContext::new(policy),
                launcher: RecordingLauncher::default(),
                next_episode: Rc::new(RefCell::new(0)),
            }
        }

        fn retain(&mut self, id: &EntryId, elevated: bool, index: Option<u64>) -> Episode {
            let next_episode = self.next_episode.clone();
            let entry_id = id.clone();
            let mut factory = move || {
                let mut next = next_episode.borrow_mut();
                let episode = *next;
                *next += 1;
                Entry::new(
                    entry_id.clone(),
                    episode,
                    MediaResource::new(entry_id.resource_id.as_str(), ResourceKind::Document),
                    None,
                )
            };
            self.context
                .with_entry(id, Some(&mut factory), &self.launcher, |entry| {
                    entry.retain(elevated, index);
                    entry.episode
                })
                .expect("entry created")
        }

        fn release(&mut self, id: &EntryId, elevated: bool, index: Option<u64>) {
            self.context
                .with_entry(id, None, &self.launcher, |entry| entry.release(elevated, index));
        }

        fn assert_top_is_live(&self) {
            if let Some((top_id, rank)) = self.context.top() {
                let entry = self.context.entry(top_id).expect("top names a live entry");
                assert_eq!(entry.rank(), Some(*rank));
            }
        }
    }

    #[test]
    fn test_entry_lifecycle_and_fetch_start() {
        let mut h = Harness::new(ActivationPolicy::AllPending);
        let a = id("a", 1);

        h.retain(&a, false, None);
        h.retain(&a, false, None);
        assert_eq!(h.context.entry(&a).map(Entry::reference_count), Some(2));
        assert_eq!(h.launcher.started.borrow().len(), 1, "one fetch per identity");
        assert!(h.context.is_active(&a));

        h.release(&a, false, None);
        assert!(h.context.entry(&a).is_some());
        h.release(&a, false, None);

        assert!(h.context.entry(&a).is_none());
        assert!(!h.context.is_active(&a));
        assert_eq!(h.launcher.cancelled.load(Ordering::SeqCst), 1);
        assert!(h.context.top().is_none());
        assert!(h.context.is_empty());
    }

    #[test]
    fn test_release_without_entry_is_noop() {
        let mut h = Harness::new(ActivationPolicy::AllPending);
        let a = id("a", 1);
        let called = h
            .context
            .with_entry(&a, None, &h.launcher, |_| unreachable!("no entry"));
        assert!(called.is_none());
        assert!(h.context.is_empty());
    }

    #[test]
    fn test_all_pending_activates_everything() {
        let mut h = Harness::new(ActivationPolicy::AllPending);
        h.retain(&id("a", 1), false, None);
        h.retain(&id("b", 2), true, None);
        h.retain(&id("c", 3), false, Some(0));

        assert_eq!(h.context.active_ids().count(), 3);
        assert_eq!(h.context.top().map(|(id, _)| id.clone()), Some(id("c", 3)));
        h.assert_top_is_live();
    }

    #[test]
    fn test_top_priority_only_promotes_and_demotes() {
        let mut h = Harness::new(ActivationPolicy::TopPriorityOnly);
        let a = id("a", 1);
        let b = id("b", 2);

        h.retain(&a, false, None);
        assert!(h.context.is_active(&a));

        // Newer message wins the tie-break.
        h.retain(&b, false, None);
        assert!(h.context.is_active(&b));
        assert!(!h.context.is_active(&a));
        assert_eq!(h.launcher.cancelled.load(Ordering::SeqCst), 1);

        // A user-initiated request on the older entry promotes it.
        h.retain(&a, false, Some(10));
        assert!(h.context.is_active(&a));
        assert!(!h.context.is_active(&b));
        assert_eq!(h.context.active_ids().count(), 1);

        // Dropping that request demotes it again.
        h.release(&a, false, Some(10));
        assert!(h.context.is_active(&b));
        assert_eq!(h.context.active_ids().count(), 1);
        h.assert_top_is_live();
    }

    #[test]
    fn test_top_refilled_when_top_entry_removed() {
        let mut h = Harness::new(ActivationPolicy::AllPending);
        let a = id("a", 1);
        let b = id("b", 2);
        h.retain(&a, true, None);
        h.retain(&b, false, None);
        assert_eq!(h.context.top().map(|(id, _)| id), Some(&a));

        h.release(&a, true, None);
        assert_eq!(h.context.top().map(|(id, _)| id), Some(&b));
        h.assert_top_is_live();
    }

    fn free_id(resource: &str) -> EntryId {
        EntryId::new(FetchLocation::Standalone, ResourceId::new(resource), LocationKey::Free(0))
    }

    #[test]
    fn test_equal_keys_prefer_most_recent_entry() {
        let mut h = Harness::new(ActivationPolicy::TopPriorityOnly);
        // Created in reverse alphabetical order so resource ids cannot decide.
        let z = free_id("z");
        let a = free_id("a");

        h.retain(&z, false, None);
        h.retain(&a, false, None);
        assert_eq!(h.context.top().map(|(id, _)| id), Some(&a));
        assert!(h.context.is_active(&a));
        assert!(!h.context.is_active(&z));

        // Retaining z again makes it the most recently incremented.
        h.retain(&z, false, None);
        assert_eq!(h.context.top().map(|(id, _)| id), Some(&z));
        assert!(h.context.is_active(&z));
        assert!(!h.context.is_active(&a));

        // A release does not change recency.
        h.release(&z, false, None);
        assert_eq!(h.context.top().map(|(id, _)| id), Some(&z));

        // Rescanning after the top goes away picks the newest survivor.
        let m = free_id("m");
        h.retain(&m, false, None);
        h.context.cancel_entry(&m, &h.launcher);
        assert_eq!(h.context.top().map(|(id, _)| id), Some(&z));
        h.context.cancel_entry(&z, &h.launcher);
        assert_eq!(h.context.top().map(|(id, _)| id), Some(&a));
        assert!(h.context.is_active(&a));
        h.assert_top_is_live();
    }

    #[test]
    fn test_top_cleared_when_top_gets_worse() {
        let mut h = Harness::new(ActivationPolicy::AllPending);
        let a = id("a", 1);
        let b = id("b", 2);
        h.retain(&a, false, None);
        h.retain(&a, true, None);
        h.retain(&b, false, None);
        assert_eq!(h.context.top().map(|(id, _)| id), Some(&a));

        // a loses its elevation and is now outranked by the newer b.
        h.release(&a, true, None);
        assert_eq!(h.context.top().map(|(id, _)| id), Some(&b));
        h.assert_top_is_live();
    }

    #[test]
    fn test_cancel_entry_falls_back_to_resource_id() {
        let mut h = Harness::new(ActivationPolicy::AllPending);
        let stored = id("doc", 5);
        h.retain(&stored, false, None);

        let other_key = id("doc", 99);
        let removed = h.context.cancel_entry(&other_key, &h.launcher);
        assert_eq!(removed, Some(stored.clone()));
        assert!(h.context.entry(&stored).is_none());
        assert!(!h.context.is_active(&stored));
        assert!(h.context.is_empty());
    }

    #[test]
    fn test_cancel_unknown_entry_is_noop() {
        let mut h = Harness::new(ActivationPolicy::AllPending);
        h.retain(&id("a", 1), false, None);
        assert_eq!(h.context.cancel_entry(&id("zzz", 1), &h.launcher), None);
        assert!(h.context.entry(&id("a", 1)).is_some());
    }

    #[test]
    fn test_cancel_then_recreate_gets_new_episode() {
        let mut h = Harness::new(ActivationPolicy::AllPending);
        let a = id("a", 1);
        let first = h.retain(&a, false, None);
        h.context.cancel_entry(&a, &h.launcher);
        let second = h.retain(&a, false, None);
        assert_ne!(first, second);
        assert_eq!(h.context.episode_of(&a), Some(second));
        assert_eq!(h.launcher.started.borrow().len(), 2);
    }

    #[test]
    fn test_status_context_tracks_entry() {
        let mut h = Harness::new(ActivationPolicy::AllPending);
        let a = id("a", 1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        h.context.with_status_context(&a, |status| {
            status.subscribe(1, tx);
            status.set_raw_status(ResourceStatus::Remote);
        });
        assert_eq!(rx.try_recv(), Ok(ResourceStatus::Remote));

        h.retain(&a, false, None);
        assert_eq!(
            rx.try_recv(),
            Ok(ResourceStatus::Fetching { is_active: false, progress: 0.0 })
        );
        assert!(h.context.status_context(&a).map(StatusContext::has_entry).unwrap_or(false));

        h.release(&a, false, None);
        assert_eq!(rx.try_recv(), Ok(ResourceStatus::Remote));
    }

    #[test]
    fn test_status_context_seeded_from_entries() {
        let mut h = Harness::new(ActivationPolicy::AllPending);
        let a = id("a", 1);
        h.retain(&a, false, None);
        let has_entry = h.context.with_status_context(&a, |status| status.has_entry());
        assert!(has_entry);
        // Kept alive by the entry even without subscribers.
        assert_eq!(h.context.status_context_count(), 1);

        h.release(&a, false, None);
        assert_eq!(h.context.status_context_count(), 0);
        assert!(h.context.is_empty());
    }

    #[test]
    fn test_empty_status_context_is_collected() {
        let mut h = Harness::new(ActivationPolicy::AllPending);
        let a = id("a", 1);
        let (tx, _rx) = mpsc::unbounded_channel();
        h.context.with_status_context(&a, |status| status.subscribe(7, tx));
        assert_eq!(h.context.status_context_count(), 1);

        h.context.with_status_context(&a, |status| status.unsubscribe(7));
        assert_eq!(h.context.status_context_count(), 0);
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("all-pending".parse(), Ok(ActivationPolicy::AllPending));
        assert_eq!("TOP_PRIORITY_ONLY".parse(), Ok(ActivationPolicy::TopPriorityOnly));
        assert!("fastest".parse::<ActivationPolicy>().is_err());
    }
}
