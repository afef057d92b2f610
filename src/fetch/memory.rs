// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process [`MediaBackend`] for demos and tests.
//!
//! Every resource gets a `watch` channel holding its [`ResourceStatus`].
//! Fetches either advance in timed steps or, in manual mode, wait until the
//! resource is completed from outside with [`InMemoryBackend::complete`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use super::backend::MediaBackend;
use super::types::{FetchSource, FetchTag, MediaResource, ResourceId, ResourceStatus};

/// How simulated transfers advance.
#[derive(Debug, Clone, Copy)]
enum Transfer {
    /// Wait for [`InMemoryBackend::complete`].
    Manual,
    /// Advance `steps` times, sleeping `step_delay` before each step.
    Simulated { steps: u32, step_delay: Duration },
}

#[derive(Debug)]
struct Inner {
    transfer: Transfer,
    resources: Mutex<HashMap<ResourceId, Arc<watch::Sender<ResourceStatus>>>>,
    starts: Mutex<HashMap<ResourceId, usize>>,
    /// Fetches transferring right now, per resource.
    running_for: Mutex<HashMap<ResourceId, usize>>,
    started: AtomicUsize,
    running: AtomicUsize,
    peak_running: AtomicUsize,
    completed: AtomicUsize,
}

/// Lock a mutex, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn channel(&self, id: &ResourceId) -> Arc<watch::Sender<ResourceStatus>> {
        lock(&self.resources)
            .entry(id.clone())
            .or_insert_with(|| Arc::new(watch::channel(ResourceStatus::Remote).0))
            .clone()
    }
}

/// Counts a fetch as running for as long as it lives.
///
/// When the last unfinished fetch of a resource is dropped, the resource goes
/// back to `Remote`.
struct RunningFetch {
    inner: Arc<Inner>,
    resource_id: ResourceId,
    channel: Arc<watch::Sender<ResourceStatus>>,
}

impl RunningFetch {
    fn enter(
        inner: Arc<Inner>,
        resource_id: ResourceId,
        channel: Arc<watch::Sender<ResourceStatus>>,
    ) -> Self {
        *lock(&inner.running_for).entry(resource_id.clone()).or_insert(0) += 1;
        let running = inner.running.fetch_add(1, Ordering::SeqCst) + 1;
        inner.peak_running.fetch_max(running, Ordering::SeqCst);
        Self {
            inner,
            resource_id,
            channel,
        }
    }
}

impl Drop for RunningFetch {
    fn drop(&mut self) {
        self.inner.running.fetch_sub(1, Ordering::SeqCst);
        let mut running_for = lock(&self.inner.running_for);
        let Some(count) = running_for.get_mut(&self.resource_id) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        running_for.remove(&self.resource_id);
        if !self.channel.borrow().is_terminal() {
            self.channel.send_replace(ResourceStatus::Remote);
        }
    }
}

/// Backend keeping all resources in memory.
#[derive(Debug, Clone)]
pub struct InMemoryBackend {
    inner: Arc<Inner>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    /// Backend whose fetches only finish through [`complete`](Self::complete).
    pub fn new() -> Self {
        Self::with_transfer(Transfer::Manual)
    }

    /// Backend whose fetches finish on their own after `steps` progress
    /// updates spaced `step_delay` apart.
    pub fn simulated(steps: u32, step_delay: Duration) -> Self {
        Self::with_transfer(Transfer::Simulated {
            steps: steps.max(1),
            step_delay,
        })
    }

    fn with_transfer(transfer: Transfer) -> Self {
        Self {
            inner: Arc::new(Inner {
                transfer,
                resources: Mutex::new(HashMap::new()),
                starts: Mutex::new(HashMap::new()),
                running_for: Mutex::new(HashMap::new()),
                started: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                peak_running: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
            }),
        }
    }

    /// Current status of a resource. Unknown resources are remote.
    pub fn status(&self, id: &ResourceId) -> ResourceStatus {
        *self.inner.channel(id).borrow()
    }

    /// Overwrite the status of a resource.
    pub fn set_status(&self, id: &ResourceId, status: ResourceStatus) {
        self.inner.channel(id).send_replace(status);
    }

    /// Mark a resource as fully downloaded, finishing any fetch waiting on it.
    pub fn complete(&self, id: &ResourceId) {
        self.set_status(id, ResourceStatus::Local);
    }

    /// Total fetches started.
    pub fn started(&self) -> usize {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Fetches started for one resource.
    pub fn started_for(&self, id: &ResourceId) -> usize {
        lock(&self.inner.starts).get(id).copied().unwrap_or(0)
    }

    /// Fetches currently transferring.
    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Highest number of fetches that were transferring at once.
    pub fn peak_running(&self) -> usize {
        self.inner.peak_running.load(Ordering::SeqCst)
    }

    /// Fetches that finished a remote transfer.
    pub fn completed(&self) -> usize {
        self.inner.completed.load(Ordering::SeqCst)
    }
}

async fn transfer(inner: Arc<Inner>, resource: MediaResource) -> FetchSource {
    let channel = inner.channel(&resource.id);
    if channel.borrow().is_terminal() {
        return FetchSource::Local;
    }

    let _running = RunningFetch::enter(inner.clone(), resource.id.clone(), channel.clone());

    match inner.transfer {
        Transfer::Manual => {
            channel.send_replace(ResourceStatus::Fetching {
                is_active: true,
                progress: 0.0,
            });
            let mut rx = channel.subscribe();
            // The sender lives in `channel`, so this only returns once local.
            let _ = rx.wait_for(ResourceStatus::is_terminal).await;
        }
        Transfer::Simulated { steps, step_delay } => {
            for step in 0..steps {
                channel.send_replace(ResourceStatus::Fetching {
                    is_active: true,
                    progress: step as f32 / steps as f32,
                });
                tokio::time::sleep(step_delay).await;
            }
            channel.send_replace(ResourceStatus::Local);
        }
    }

    inner.completed.fetch_add(1, Ordering::SeqCst);
    tracing::trace!(resource = %resource.id, "Simulated transfer finished");
    FetchSource::Remote
}

impl MediaBackend for InMemoryBackend {
    fn fetch_resource(
        &self,
        resource: &MediaResource,
        tag: Option<FetchTag>,
    ) -> BoxStream<'static, FetchSource> {
        self.inner.started.fetch_add(1, Ordering::SeqCst);
        *lock(&self.inner.starts).entry(resource.id.clone()).or_insert(0) += 1;
        tracing::trace!(resource = %resource.id, ?tag, "Simulated transfer requested");

        stream::once(transfer(self.inner.clone(), resource.clone())).boxed()
    }

    fn resource_status(&self, resource: &MediaResource) -> BoxStream<'static, ResourceStatus> {
        WatchStream::new(self.inner.channel(&resource.id).subscribe()).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::types::ResourceKind;

    #[tokio::test]
    async fn test_local_resource_completes_immediately() {
        let backend = InMemoryBackend::new();
        let resource = MediaResource::new("cached", ResourceKind::Photo);
        backend.complete(&resource.id);

        let events: Vec<FetchSource> = backend.fetch_resource(&resource, None).collect().await;
        assert_eq!(events, vec![FetchSource::Local]);
        assert_eq!(backend.running(), 0);
        assert_eq!(backend.completed(), 0);
    }

    #[tokio::test]
    async fn test_simulated_transfer_reports_progress() {
        let backend = InMemoryBackend::simulated(4, Duration::from_millis(1));
        let resource = MediaResource::new("doc", ResourceKind::Document);

        let mut statuses = backend.resource_status(&resource);
        assert_eq!(statuses.next().await, Some(ResourceStatus::Remote));

        let events: Vec<FetchSource> = backend.fetch_resource(&resource, None).collect().await;
        assert_eq!(events, vec![FetchSource::Remote]);
        assert_eq!(backend.status(&resource.id), ResourceStatus::Local);
        assert_eq!(backend.completed(), 1);
        assert_eq!(backend.started_for(&resource.id), 1);
        assert_eq!(backend.peak_running(), 1);
    }

    #[tokio::test]
    async fn test_manual_transfer_waits_for_completion() {
        let backend = InMemoryBackend::new();
        let resource = MediaResource::new("video", ResourceKind::Video);

        let mut fetch = backend.fetch_resource(&resource, Some(FetchTag::Video));
        let pending = tokio::time::timeout(Duration::from_millis(20), fetch.next()).await;
        assert!(pending.is_err(), "manual fetch must not finish by itself");
        assert_eq!(backend.running(), 1);

        backend.complete(&resource.id);
        assert_eq!(fetch.next().await, Some(FetchSource::Remote));
        assert_eq!(fetch.next().await, None);
    }

    #[tokio::test]
    async fn test_dropped_fetch_reverts_to_remote() {
        let backend = InMemoryBackend::new();
        let resource = MediaResource::new("voice", ResourceKind::Voice);

        let mut fetch = backend.fetch_resource(&resource, None);
        let _ = tokio::time::timeout(Duration::from_millis(10), fetch.next()).await;
        assert!(matches!(
            backend.status(&resource.id),
            ResourceStatus::Fetching { is_active: true, .. }
        ));

        drop(fetch);
        assert_eq!(backend.running(), 0);
        assert_eq!(backend.status(&resource.id), ResourceStatus::Remote);
    }

    #[tokio::test]
    async fn test_resource_stays_fetching_while_another_fetch_runs() {
        let backend = InMemoryBackend::new();
        let resource = MediaResource::new("doc", ResourceKind::Document);

        let mut first = backend.fetch_resource(&resource, None);
        let mut second = backend.fetch_resource(&resource, None);
        let _ = tokio::time::timeout(Duration::from_millis(10), first.next()).await;
        let _ = tokio::time::timeout(Duration::from_millis(10), second.next()).await;
        assert_eq!(backend.running(), 2);

        drop(first);
        assert_eq!(backend.running(), 1);
        assert!(matches!(
            backend.status(&resource.id),
            ResourceStatus::Fetching { is_active: true, .. }
        ));

        drop(second);
        assert_eq!(backend.running(), 0);
        assert_eq!(backend.status(&resource.id), ResourceStatus::Remote);
    }
}
