// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Status fan-out for a single resource identity.

use std::collections::BTreeMap;

use tokio::sync::mpsc;

use super::backend::TaskHandle;
use super::types::ResourceStatus;

/// Stable handle of a status subscriber.
pub type SubscriberKey = u64;

/// Sending half of a status subscription.
pub type StatusSender = mpsc::UnboundedSender<ResourceStatus>;

/// Subscribers of one resource identity plus the last raw status seen from
/// the backend.
#[derive(Debug, Default)]
pub struct StatusContext {
    raw_status: Option<ResourceStatus>,
    subscribers: BTreeMap<SubscriberKey, StatusSender>,
    has_entry: bool,
    poll: Option<(u64, TaskHandle)>,
}

impl StatusContext {
    pub fn new(has_entry: bool) -> Self {
        Self {
            has_entry,
            ..Self::default()
        }
    }

    pub fn raw_status(&self) -> Option<ResourceStatus> {
        self.raw_status
    }

    pub fn has_entry(&self) -> bool {
        self.has_entry
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// True when nothing keeps this context alive.
    pub fn is_empty(&self) -> bool {
        !self.has_entry && self.subscribers.is_empty()
    }

    /// Status visible to subscribers.
    ///
    /// A remote resource that somebody asked for is reported as queued.
    pub fn combined_status(&self) -> Option<ResourceStatus> {
        match self.raw_status? {
            ResourceStatus::Remote if self.has_entry => Some(ResourceStatus::Fetching {
                is_active: false,
                progress: 0.0,
            }),
            status => Some(status),
        }
    }

    /// Register a subscriber and replay the current status to it.
    ///
    /// A subscriber that is already satisfied (the resource is local) is not
    /// kept.
    pub fn subscribe(&mut self, key: SubscriberKey, sender: StatusSender) {
        if let Some(status) = self.combined_status() {
            if sender.send(status).is_err() || status.is_terminal() {
                return;
            }
        }
        self.subscribers.insert(key, sender);
    }

    pub fn unsubscribe(&mut self, key: SubscriberKey) -> bool {
        self.subscribers.remove(&key).is_some()
    }

    /// Record a status from the backend and publish the combined value.
    ///
    /// Every backend update is fanned out, even when it repeats the last one.
    pub fn set_raw_status(&mut self, status: ResourceStatus) {
        self.raw_status = Some(status);
        if let Some(combined) = self.combined_status() {
            self.publish(combined);
        }
    }

    /// Flip `has_entry`, publishing the combined value if it changed.
    pub fn set_has_entry(&mut self, has_entry: bool) {
        debug_assert_ne!(self.has_entry, has_entry, "has_entry already {has_entry}");
        let previous = self.combined_status();
        self.has_entry = has_entry;
        self.publish_if_changed(previous);
    }

    fn publish_if_changed(&mut self, previous: Option<ResourceStatus>) {
        match self.combined_status() {
            Some(status) if Some(status) != previous => self.publish(status),
            _ => {}
        }
    }

    fn publish(&mut self, status: ResourceStatus) {
        tracing::trace!(subscribers = self.subscribers.len(), %status, "Publishing status");
        // Terminal status closes every stream; closed receivers are pruned.
        self.subscribers
            .retain(|_, sender| sender.send(status).is_ok() && !status.is_terminal());
    }

    pub fn is_polling(&self) -> bool {
        self.poll.is_some()
    }

    /// Id of the running status poll. Updates from any other poll are stale.
    pub fn poll_id(&self) -> Option<u64> {
        self.poll.as_ref().map(|(id, _)| *id)
    }

    pub fn set_poll(&mut self, id: u64, poll: TaskHandle) {
        debug_assert!(self.poll.is_none(), "status poll already running");
        self.poll = Some((id, poll));
    }

    /// Stop the backend status poll, if any.
    pub fn cancel_poll(&mut self) {
        if let Some((_, mut poll)) = self.poll.take() {
            poll.cancel();
        }
    }
}
