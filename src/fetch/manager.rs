// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Fetch manager: the queue-serialized façade over the category schedulers.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use anyhow::{Context, Result};
use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};

use super::backend::{FetchCompletion, NoopHook, SharedBackend, SharedHook, TaskHandle};
use super::category::{ActivationPolicy, CategoryContext, FetchLauncher};
use super::entry::{Entry, Episode};
use super::snapshot::{CategorySnapshot, ManagerSnapshot};
use super::status::{StatusContext, StatusSender, SubscriberKey};
use super::types::{
    EntryId, FetchCategory, FetchLocation, FetchSource, FetchTag, LocationKey, MediaResource,
    ResourceStatus,
};
use crate::config::FetchConfig;

/// Id of an interactive fetch subscription.
type TicketId = u64;

/// Id of one status poll of one status context.
type PollId = u64;

/// A request to keep a resource fetched.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub category: FetchCategory,
    pub location: FetchLocation,
    pub location_key: LocationKey,
    pub resource: MediaResource,
    pub fetch_tag: Option<FetchTag>,
    pub elevated_priority: bool,
    pub user_initiated: bool,
}

impl FetchRequest {
    /// Create a normal-priority background request.
    pub fn new(
        category: FetchCategory,
        location: FetchLocation,
        location_key: LocationKey,
        resource: MediaResource,
    ) -> Self {
        Self {
            category,
            location,
            location_key,
            resource,
            fetch_tag: None,
            elevated_priority: false,
            user_initiated: false,
        }
    }

    pub fn with_tag(mut self, tag: FetchTag) -> Self {
        self.fetch_tag = Some(tag);
        self
    }

    /// Boost the request above normal-priority peers.
    pub fn elevated(mut self) -> Self {
        self.elevated_priority = true;
        self
    }

    /// Mark the request as a direct user action.
    pub fn user_initiated(mut self) -> Self {
        self.user_initiated = true;
        self
    }

    pub fn entry_id(&self) -> EntryId {
        EntryId::new(self.location, self.resource.id.clone(), self.location_key)
    }
}

/// Commands processed by the manager's worker task, in FIFO order.
enum Command {
    Fetch {
        ticket: TicketId,
        request: FetchRequest,
    },
    Release {
        ticket: TicketId,
    },
    Cancel {
        category: FetchCategory,
        id: EntryId,
    },
    SubscribeStatus {
        category: FetchCategory,
        id: EntryId,
        resource: MediaResource,
        key: SubscriberKey,
        sender: StatusSender,
    },
    UnsubscribeStatus {
        category: FetchCategory,
        id: EntryId,
        key: SubscriberKey,
    },
    StatusChanged {
        category: FetchCategory,
        id: EntryId,
        poll: PollId,
        status: ResourceStatus,
    },
    Completed {
        category: FetchCategory,
        id: EntryId,
        episode: Episode,
        source: FetchSource,
    },
    Snapshot {
        reply: oneshot::Sender<ManagerSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Keeps a resource fetched until cancelled or dropped.
///
/// Releasing only undoes this request's own contribution, and only while the
/// entry it contributed to is still alive.
#[must_use = "dropping an InteractiveFetch releases the request immediately"]
#[derive(Debug)]
pub struct InteractiveFetch {
    ticket: TicketId,
    command_tx: mpsc::UnboundedSender<Command>,
    released: bool,
}

impl InteractiveFetch {
    /// Release the request now.
    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self
            .command_tx
            .send(Command::Release {
                ticket: self.ticket,
            })
            .is_err()
        {
            tracing::debug!(ticket = self.ticket, "Fetch manager gone before release");
        }
    }
}

impl Drop for InteractiveFetch {
    fn drop(&mut self) {
        self.release();
    }
}

/// Live status of one resource identity.
///
/// Yields the current status first (if known), then every change, and ends
/// right after yielding [`ResourceStatus::Local`].
#[derive(Debug)]
pub struct StatusStream {
    receiver: mpsc::UnboundedReceiver<ResourceStatus>,
    category: FetchCategory,
    id: EntryId,
    key: SubscriberKey,
    command_tx: mpsc::UnboundedSender<Command>,
}

impl Stream for StatusStream {
    type Item = ResourceStatus;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for StatusStream {
    fn drop(&mut self) {
        if self
            .command_tx
            .send(Command::UnsubscribeStatus {
                category: self.category,
                id: self.id.clone(),
                key: self.key,
            })
            .is_err()
        {
            tracing::debug!(subscriber = self.key, "Fetch manager gone before unsubscribe");
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Fetch { .. } => "Fetch",
            Command::Release { .. } => "Release",
            Command::Cancel { .. } => "Cancel",
            Command::SubscribeStatus { .. } => "SubscribeStatus",
            Command::UnsubscribeStatus { .. } => "UnsubscribeStatus",
            Command::StatusChanged { .. } => "StatusChanged",
            Command::Completed { .. } => "Completed",
            Command::Snapshot { .. } => "Snapshot",
            Command::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

/// Coordinates fetches of media resources.
///
/// All state lives in a single worker task; every method only enqueues a
/// command, so calls from any thread are applied in the order they were made.
/// Cloning the manager is cheap and shares the worker.
#[derive(Debug, Clone)]
pub struct FetchManager {
    command_tx: mpsc::UnboundedSender<Command>,
    next_handle: Arc<AtomicU64>,
}

impl FetchManager {
    /// Create a manager with the default configuration.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(backend: SharedBackend) -> Self {
        Self::with_hook(backend, ActivationPolicy::default(), Arc::new(NoopHook))
    }

    /// Create a manager from a loaded configuration.
    pub fn with_config(backend: SharedBackend, config: &FetchConfig) -> Self {
        Self::with_hook(backend, config.activation_policy, config.completion_hook())
    }

    /// Create a manager with an explicit activation policy and completion hook.
    pub fn with_hook(backend: SharedBackend, policy: ActivationPolicy, hook: SharedHook) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            backend,
            hook,
            policy,
            categories: HashMap::new(),
            tickets: HashMap::new(),
            sequencer: Sequencer::default(),
            command_tx: command_tx.downgrade(),
        };
        tokio::spawn(worker.run(command_rx));

        Self {
            command_tx,
            next_handle: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register interest in fetching `request.resource`.
    ///
    /// The resource stays wanted until the returned guard is cancelled or
    /// dropped, or until [`cancel_interactive_fetches`](Self::cancel_interactive_fetches)
    /// or a completed fetch removes the entry.
    pub fn interactively_fetched(&self, request: FetchRequest) -> InteractiveFetch {
        let ticket = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.send(Command::Fetch { ticket, request });
        InteractiveFetch {
            ticket,
            command_tx: self.command_tx.clone(),
            released: false,
        }
    }

    /// Drop every request for a resource regardless of how many are held.
    ///
    /// If nothing is registered under this exact location key, an entry for
    /// the same resource under any other key is cancelled instead.
    pub fn cancel_interactive_fetches(
        &self,
        category: FetchCategory,
        location: FetchLocation,
        location_key: LocationKey,
        resource: &MediaResource,
    ) {
        let id = EntryId::new(location, resource.id.clone(), location_key);
        self.send(Command::Cancel { category, id });
    }

    /// Observe the combined status of a resource identity.
    pub fn fetch_status(
        &self,
        category: FetchCategory,
        location: FetchLocation,
        location_key: LocationKey,
        resource: &MediaResource,
    ) -> StatusStream {
        let key = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let id = EntryId::new(location, resource.id.clone(), location_key);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.send(Command::SubscribeStatus {
            category,
            id: id.clone(),
            resource: resource.clone(),
            key,
            sender,
        });
        StatusStream {
            receiver,
            category,
            id,
            key,
            command_tx: self.command_tx.clone(),
        }
    }

    /// Capture the scheduler state once every previously enqueued command
    /// has been applied.
    pub async fn snapshot(&self) -> Result<ManagerSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(Command::Snapshot { reply })
            .map_err(|_| anyhow::anyhow!("Fetch manager worker is not running"))?;
        rx.await.context("Fetch manager worker stopped before replying")
    }

    /// Stop the worker, cancelling every running fetch and status poll.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(Command::Shutdown { reply })
            .map_err(|_| anyhow::anyhow!("Fetch manager worker is not running"))?;
        rx.await.context("Fetch manager worker stopped before replying")
    }

    fn send(&self, command: Command) {
        if let Err(e) = self.command_tx.send(command) {
            tracing::warn!(command = ?e.0, "Fetch manager worker is not running; command dropped");
        }
    }
}

/// What an interactive fetch contributed, so it can be undone.
#[derive(Debug)]
struct Ticket {
    category: FetchCategory,
    id: EntryId,
    episode: Episode,
    elevated: bool,
    user_initiated_index: Option<u64>,
}

/// Monotonic counters owned by the worker.
#[derive(Debug, Default)]
struct Sequencer {
    next_episode: Episode,
    next_user_initiated_index: u64,
    next_poll: PollId,
}

impl Sequencer {
    fn take_episode(&mut self) -> Episode {
        let value = self.next_episode;
        self.next_episode += 1;
        value
    }

    fn take_user_initiated_index(&mut self) -> u64 {
        let value = self.next_user_initiated_index;
        self.next_user_initiated_index += 1;
        value
    }

    fn take_poll(&mut self) -> PollId {
        let value = self.next_poll;
        self.next_poll += 1;
        value
    }
}

/// Spawns backend fetches and status polls for one category, routing their
/// output back to the worker queue.
struct Spawner {
    category: FetchCategory,
    backend: SharedBackend,
    command_tx: mpsc::WeakUnboundedSender<Command>,
}

impl Spawner {
    fn poll_status(&self, id: &EntryId, poll: PollId, resource: &MediaResource) -> TaskHandle {
        let mut statuses = self.backend.resource_status(resource);
        let command_tx = self.command_tx.clone();
        let category = self.category;
        let id = id.clone();

        TaskHandle::from_join_handle(tokio::spawn(async move {
            while let Some(status) = statuses.next().await {
                let Some(tx) = command_tx.upgrade() else {
                    break;
                };
                let command = Command::StatusChanged {
                    category,
                    id: id.clone(),
                    poll,
                    status,
                };
                if tx.send(command).is_err() {
                    break;
                }
            }
        }))
    }
}

impl FetchLauncher for Spawner {
    fn launch(&self, id: &EntryId, entry: &Entry) -> TaskHandle {
        let mut events = self.backend.fetch_resource(&entry.resource, entry.fetch_tag);
        let command_tx = self.command_tx.clone();
        let category = self.category;
        let episode = entry.episode;
        let id = id.clone();

        TaskHandle::from_join_handle(tokio::spawn(async move {
            while let Some(source) = events.next().await {
                let Some(tx) = command_tx.upgrade() else {
                    break;
                };
                let command = Command::Completed {
                    category,
                    id: id.clone(),
                    episode,
                    source,
                };
                if tx.send(command).is_err() {
                    break;
                }
            }
        }))
    }
}

/// Owner of all scheduling state. Runs as a single tokio task.
struct Worker {
    backend: SharedBackend,
    hook: SharedHook,
    policy: ActivationPolicy,
    categories: HashMap<FetchCategory, CategoryContext>,
    tickets: HashMap<TicketId, Ticket>,
    sequencer: Sequencer,
    command_tx: mpsc::WeakUnboundedSender<Command>,
}

impl Worker {
    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<Command>) {
        tracing::debug!(policy = %self.policy, "Fetch manager worker started");

        while let Some(command) = command_rx.recv().await {
            match command {
                Command::Fetch { ticket, request } => self.fetch(ticket, request),
                Command::Release { ticket } => self.release(ticket),
                Command::Cancel { category, id } => self.cancel(category, &id),
                Command::SubscribeStatus {
                    category,
                    id,
                    resource,
                    key,
                    sender,
                } => self.subscribe_status(category, id, resource, key, sender),
                Command::UnsubscribeStatus { category, id, key } => {
                    self.with_category_context(category, |context, _, _| {
                        context.with_status_context(&id, |status| status.unsubscribe(key));
                    });
                }
                Command::StatusChanged {
                    category,
                    id,
                    poll,
                    status,
                } => self.status_changed(category, &id, poll, status),
                Command::Completed {
                    category,
                    id,
                    episode,
                    source,
                } => self.completed(category, &id, episode, source),
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                Command::Shutdown { reply } => {
                    // Dropping the contexts cancels every fetch and poll.
                    self.categories.clear();
                    self.tickets.clear();
                    let _ = reply.send(());
                    break;
                }
            }
        }

        tracing::debug!("Fetch manager worker stopped");
    }

    /// Run `f` on the context of `category`, creating it on first use and
    /// dropping it again as soon as it is empty.
    fn with_category_context<R>(
        &mut self,
        category: FetchCategory,
        f: impl FnOnce(&mut CategoryContext, &mut Sequencer, &Spawner) -> R,
    ) -> R {
        let spawner = Spawner {
            category,
            backend: self.backend.clone(),
            command_tx: self.command_tx.clone(),
        };
        let policy = self.policy;
        let context = self
            .categories
            .entry(category)
            .or_insert_with(|| CategoryContext::new(policy));

        let result = f(context, &mut self.sequencer, &spawner);

        if context.is_empty() {
            self.categories.remove(&category);
        }
        result
    }

    fn fetch(&mut self, ticket: TicketId, request: FetchRequest) {
        let id = request.entry_id();
        let elevated = request.elevated_priority;
        let user_initiated_index = request
            .user_initiated
            .then(|| self.sequencer.take_user_initiated_index());

        let FetchRequest {
            category,
            resource,
            fetch_tag,
            ..
        } = request;

        let episode = self.with_category_context(category, |context, sequencer, spawner| {
            let mut factory = || {
                Entry::new(id.clone(), sequencer.take_episode(), resource.clone(), fetch_tag)
            };
            context.with_entry(&id, Some(&mut factory), spawner, |entry| {
                entry.retain(elevated, user_initiated_index);
                entry.episode
            })
        });

        match episode {
            Some(episode) => {
                tracing::debug!(
                    entry = %id,
                    episode,
                    elevated,
                    user_initiated = ?user_initiated_index,
                    "Fetch requested"
                );
                self.tickets.insert(
                    ticket,
                    Ticket {
                        category,
                        id,
                        episode,
                        elevated,
                        user_initiated_index,
                    },
                );
            }
            None => debug_assert!(false, "entry factory was not used"),
        }
    }

    fn release(&mut self, ticket: TicketId) {
        let Some(ticket) = self.tickets.remove(&ticket) else {
            return;
        };

        let released = self.with_category_context(ticket.category, |context, _, spawner| {
            context.with_entry(&ticket.id, None, spawner, |entry| {
                if entry.episode == ticket.episode {
                    entry.release(ticket.elevated, ticket.user_initiated_index);
                    true
                } else {
                    false
                }
            })
        });

        if released != Some(true) {
            tracing::debug!(entry = %ticket.id, episode = ticket.episode, "Ignoring stale release");
        }
    }

    fn cancel(&mut self, category: FetchCategory, id: &EntryId) {
        let removed = self.with_category_context(category, |context, _, spawner| {
            context.cancel_entry(id, spawner)
        });
        tracing::debug!(entry = %id, removed = ?removed.as_ref().map(ToString::to_string), "Cancel requested");
    }

    fn subscribe_status(
        &mut self,
        category: FetchCategory,
        id: EntryId,
        resource: MediaResource,
        key: SubscriberKey,
        sender: StatusSender,
    ) {
        self.with_category_context(category, |context, sequencer, spawner| {
            context.with_status_context(&id, |status| {
                status.subscribe(key, sender);
                if !status.is_polling() && !status.is_empty() {
                    let poll = sequencer.take_poll();
                    status.set_poll(poll, spawner.poll_status(&id, poll, &resource));
                }
            });
        });
    }

    fn status_changed(
        &mut self,
        category: FetchCategory,
        id: &EntryId,
        poll: PollId,
        status: ResourceStatus,
    ) {
        self.with_category_context(category, |context, _, _| {
            let current = context.status_context(id).and_then(StatusContext::poll_id);
            if current == Some(poll) {
                context.with_status_context(id, |status_context| status_context.set_raw_status(status));
            } else {
                tracing::trace!(entry = %id, poll, "Ignoring status from a stopped poll");
            }
        });
    }

    fn completed(
        &mut self,
        category: FetchCategory,
        id: &EntryId,
        episode: Episode,
        source: FetchSource,
    ) {
        let resource = self.with_category_context(category, |context, _, spawner| {
            let resource = match context.entry(id) {
                Some(entry) if entry.episode == episode => entry.resource.clone(),
                _ => return None,
            };
            context.cancel_entry(id, spawner);
            Some(resource)
        });

        let Some(resource) = resource else {
            tracing::debug!(entry = %id, episode, "Ignoring stale completion");
            return;
        };

        tracing::debug!(entry = %id, episode, ?source, "Fetch completed");
        if source == FetchSource::Remote {
            let completion = FetchCompletion {
                category,
                id: id.clone(),
                resource,
                source,
            };
            tokio::spawn(self.hook.on_completed(completion));
        }
    }

    fn snapshot(&self) -> ManagerSnapshot {
        let mut categories: Vec<CategorySnapshot> = self
            .categories
            .iter()
            .map(|(category, context)| CategorySnapshot::capture(*category, context))
            .collect();
        categories.sort_by_key(|snapshot| snapshot.category);

        ManagerSnapshot {
            categories,
            open_tickets: self.tickets.len(),
            next_episode: self.sequencer.next_episode,
            taken_at: chrono::Utc::now(),
        }
    }
}
