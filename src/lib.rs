// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! mediafetch - media fetch coordination library
//!
//! Decides which remote media resources should be transferring right now and
//! tells observers where each one stands.
//!
//! # Core Modules
//!
//! - [`fetch`] - Fetch manager, per-category scheduling and status fan-out
//! - [`config`] - User configuration (`~/.mediafetch/config.json`)

pub mod config;
pub mod fetch;

pub use config::FetchConfig;

pub use fetch::{
    ActivationPolicy, CompletionHook, CopyToDownloads, EntryId, FetchCategory, FetchLocation,
    FetchManager, FetchRequest, FetchSource, FetchTag, InMemoryBackend, InteractiveFetch,
    LocationKey, ManagerSnapshot, MediaBackend, MediaResource, MessageId, PeerId, ResourceId,
    ResourceKind, ResourceStatus, StatusStream,
};
