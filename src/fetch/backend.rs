// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Collaborator contracts consumed by the fetch manager.
//!
//! The manager never transfers bytes itself. It asks a [`MediaBackend`] to
//! fetch a resource or to report its status, and hands finished remote
//! fetches to a [`CompletionHook`] for post-processing.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::FutureExt;
use tokio::task::JoinHandle;

use super::types::{
    EntryId, FetchCategory, FetchSource, FetchTag, LocationKey, MediaResource, ResourceKind,
    ResourceStatus,
};

/// Storage/transfer backend.
pub trait MediaBackend: Send + Sync + 'static {
    /// Start transferring `resource`. The stream yields one event per
    /// completion; dropping it must stop the transfer promptly.
    fn fetch_resource(
        &self,
        resource: &MediaResource,
        tag: Option<FetchTag>,
    ) -> BoxStream<'static, FetchSource>;

    /// Observe the locality of `resource`. Yields the current value first.
    fn resource_status(&self, resource: &MediaResource) -> BoxStream<'static, ResourceStatus>;
}

/// A finished fetch, handed to a [`CompletionHook`].
#[derive(Debug, Clone)]
pub struct FetchCompletion {
    pub category: FetchCategory,
    pub id: EntryId,
    pub resource: MediaResource,
    pub source: FetchSource,
}

/// Post-processing run off the scheduler queue after a remote fetch completes.
pub trait CompletionHook: Send + Sync + 'static {
    fn on_completed(&self, completion: FetchCompletion) -> BoxFuture<'static, ()>;
}

/// Hook that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

impl CompletionHook for NoopHook {
    fn on_completed(&self, _completion: FetchCompletion) -> BoxFuture<'static, ()> {
        async {}.boxed()
    }
}

/// Copies finished message attachments into a user-visible directory.
///
/// Photos and playable media (music, voice, video, animations) stay in the
/// cache, as does anything not fetched on behalf of a message.
#[derive(Debug, Clone)]
pub struct CopyToDownloads {
    cache_dir: PathBuf,
    downloads_dir: PathBuf,
}

impl CopyToDownloads {
    /// `cache_dir/<resource id>` is copied to `downloads_dir/<file name>`.
    pub fn new(cache_dir: impl Into<PathBuf>, downloads_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            downloads_dir: downloads_dir.into(),
        }
    }

    /// Returns true if this completion should be copied.
    pub fn should_copy(completion: &FetchCompletion) -> bool {
        let kind = completion.resource.kind;
        completion.source == FetchSource::Remote
            && matches!(completion.id.location_key, LocationKey::Message(_))
            && kind != ResourceKind::Photo
            && !kind.is_playable_media()
    }

    /// Copy the cached file for `resource`, returning the destination path.
    pub async fn copy(&self, resource: &MediaResource) -> Result<PathBuf> {
        let source = self.cache_dir.join(resource.id.as_str());
        let file_name = resource
            .file_name
            .clone()
            .unwrap_or_else(|| resource.id.to_string());

        tokio::fs::create_dir_all(&self.downloads_dir)
            .await
            .with_context(|| format!("Failed to create downloads directory: {:?}", self.downloads_dir))?;

        let destination = unique_destination(&self.downloads_dir, &file_name).await;
        tokio::fs::copy(&source, &destination)
            .await
            .with_context(|| format!("Failed to copy {:?} -> {:?}", source, destination))?;
        Ok(destination)
    }
}

impl CompletionHook for CopyToDownloads {
    fn on_completed(&self, completion: FetchCompletion) -> BoxFuture<'static, ()> {
        if !Self::should_copy(&completion) {
            return async {}.boxed();
        }
        let this = self.clone();
        async move {
            match this.copy(&completion.resource).await {
                Ok(path) => tracing::info!(resource = %completion.resource.id, "Saved to {}", path.display()),
                Err(e) => tracing::warn!(resource = %completion.resource.id, "Failed to save download: {:#}", e),
            }
        }
        .boxed()
    }
}

/// Pick `dir/name`, or `dir/stem (n).ext` if that already exists.
async fn unique_destination(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }

    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());

    let mut n = 1;
    loop {
        let name = match &extension {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        let candidate = dir.join(name);
        if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        n += 1;
    }
}

/// Cancellation handle for a running fetch or status poll.
///
/// Cancelling is idempotent and also happens on drop.
pub struct TaskHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TaskHandle {
    /// Wrap an arbitrary cancel action.
    pub fn from_fn(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Cancel a spawned tokio task by aborting it.
    pub fn from_join_handle(handle: JoinHandle<()>) -> Self {
        let abort = handle.abort_handle();
        Self::from_fn(move || abort.abort())
    }

    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_none()
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Shared backend handle.
pub type SharedBackend = Arc<dyn MediaBackend>;

/// Shared completion hook handle.
pub type SharedHook = Arc<dyn CompletionHook>;
