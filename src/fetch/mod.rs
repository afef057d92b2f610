// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Media fetch coordination for mediafetch
//!
//! This module decides which media resources should be transferring and
//! publishes their status:
//! - Reference-counted interest per (location, resource, location key)
//! - Priority ordering with user-initiated and elevated requests
//! - Status fan-out with a "queued" view of remote resources somebody wants
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐ commands ┌─────────────────┐
//! │ FetchManager    │─────────▶│ Worker (tokio)  │
//! │ (cloneable)     │          │ CategoryContext │
//! └─────────────────┘          └────────┬────────┘
//!          ▲  status                    │ spawn
//!          │                            ▼
//! ┌─────────────────┐ events   ┌─────────────────┐
//! │ StatusStream    │◀─────────│ MediaBackend    │
//! └─────────────────┘          └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use futures_util::StreamExt;
//! use mediafetch::fetch::{
//!     FetchCategory, FetchLocation, FetchManager, FetchRequest, InMemoryBackend, LocationKey,
//!     MediaResource, ResourceKind,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let backend = Arc::new(InMemoryBackend::new());
//! let manager = FetchManager::new(backend.clone());
//!
//! let resource = MediaResource::new("doc-42", ResourceKind::Document);
//! let mut status = manager.fetch_status(
//!     FetchCategory::File,
//!     FetchLocation::Standalone,
//!     LocationKey::Free(0),
//!     &resource,
//! );
//!
//! // Keep the resource wanted until `fetch` is dropped
//! let fetch = manager.interactively_fetched(
//!     FetchRequest::new(
//!         FetchCategory::File,
//!         FetchLocation::Standalone,
//!         LocationKey::Free(0),
//!         resource.clone(),
//!     )
//!     .user_initiated(),
//! );
//!
//! while let Some(update) = status.next().await {
//!     println!("{}", update);
//! }
//! drop(fetch);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod category;
pub mod entry;
pub mod manager;
pub mod memory;
pub mod priority;
pub mod snapshot;
pub mod status;
pub mod types;

// Re-export commonly used items
pub use backend::{
    CompletionHook, CopyToDownloads, FetchCompletion, MediaBackend, NoopHook, SharedBackend,
    SharedHook, TaskHandle,
};
pub use category::{ActivationPolicy, CategoryContext, FetchLauncher};
pub use entry::{Entry, Episode};
pub use manager::{FetchManager, FetchRequest, InteractiveFetch, StatusStream};
pub use memory::InMemoryBackend;
pub use priority::{PriorityKey, Rank};
pub use snapshot::{CategorySnapshot, EntrySnapshot, ManagerSnapshot, StatusSnapshot};
pub use status::{StatusContext, SubscriberKey};
pub use types::{
    EntryId, FetchCategory, FetchLocation, FetchSource, FetchTag, LocationKey, MediaResource,
    MessageId, PeerId, ResourceId, ResourceKind, ResourceStatus,
};
