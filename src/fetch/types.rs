// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Identity and status types shared by the fetch scheduler.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Partition of fetch traffic. Each category is scheduled independently.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FetchCategory {
    /// Photos and thumbnails
    Image,
    /// Documents and generic files
    File,
    /// Voice notes
    Voice,
    /// Video files
    Video,
    /// Profile photos
    ProfilePhoto,
}

/// Identifier of a peer (chat, user or channel).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub i64);

/// Identifier of a message inside a peer's history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub peer_id: PeerId,
    pub id: i32,
}

impl MessageId {
    pub fn new(peer_id: PeerId, id: i32) -> Self {
        Self { peer_id, id }
    }
}

impl Ord for MessageId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id
            .cmp(&other.id)
            .then_with(|| self.peer_id.cmp(&other.peer_id))
    }
}

impl PartialOrd for MessageId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Scope a fetch was requested from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FetchLocation {
    /// Media shown inside a chat
    Chat(PeerId),
    /// Media not bound to any chat (profile photos, instant pages, ...)
    Standalone,
}

/// Sub-scope of a location, e.g. the exact message a media belongs to.
///
/// Also the last tie-break of [`PriorityKey`](super::PriorityKey): message
/// keys outrank free keys and, within a kind, the larger (newer) value wins.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LocationKey {
    Message(MessageId),
    Free(i32),
}

impl Ord for LocationKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (LocationKey::Message(lhs), LocationKey::Message(rhs)) => lhs.cmp(rhs),
            (LocationKey::Free(lhs), LocationKey::Free(rhs)) => lhs.cmp(rhs),
            (LocationKey::Message(_), LocationKey::Free(_)) => Ordering::Greater,
            (LocationKey::Free(_), LocationKey::Message(_)) => Ordering::Less,
        }
    }
}

impl PartialOrd for LocationKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Stable identifier of a remote resource, compared by value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// What kind of media a resource backs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Photo,
    #[default]
    Document,
    Music,
    Voice,
    Video,
    Animation,
    /// Round video message
    RoundVideo,
}

impl ResourceKind {
    /// Returns true for kinds that are played inline rather than saved as files.
    pub fn is_playable_media(&self) -> bool {
        matches!(
            self,
            ResourceKind::Music
                | ResourceKind::Voice
                | ResourceKind::Video
                | ResourceKind::Animation
                | ResourceKind::RoundVideo
        )
    }
}

/// Descriptor of a remote resource handed to the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaResource {
    pub id: ResourceId,
    /// Expected size in bytes, if known
    pub size: Option<u64>,
    pub kind: ResourceKind,
    /// Suggested file name when the resource is saved for the user
    pub file_name: Option<String>,
}

impl MediaResource {
    /// Create a resource descriptor with no size or file name.
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: ResourceId::new(id),
            size: None,
            kind,
            file_name: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }
}

/// Opaque tag passed to the backend for storage accounting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FetchTag {
    Photo,
    File,
    Voice,
    Video,
}

/// Identity of a fetch entry: (location, resource id, location key).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EntryId {
    pub location: FetchLocation,
    pub resource_id: ResourceId,
    pub location_key: LocationKey,
}

impl EntryId {
    pub fn new(location: FetchLocation, resource_id: ResourceId, location_key: LocationKey) -> Self {
        Self {
            location,
            resource_id,
            location_key,
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:?}/{:?}", self.resource_id, self.location, self.location_key)
    }
}

/// Locality of a resource as reported by the status service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum ResourceStatus {
    /// Fully available on disk
    Local,
    /// Not present locally and nothing is transferring it
    Remote,
    /// Being transferred; `is_active` is false while queued
    Fetching { is_active: bool, progress: f32 },
}

impl ResourceStatus {
    /// Returns true once no further status change is expected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResourceStatus::Local)
    }

    /// Get progress percentage (0-100) if the resource is transferring.
    pub fn progress_percent(&self) -> Option<f64> {
        match self {
            ResourceStatus::Local => Some(100.0),
            ResourceStatus::Remote => None,
            ResourceStatus::Fetching { progress, .. } => {
                Some((f64::from(*progress) * 100.0).clamp(0.0, 100.0))
            }
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceStatus::Local => f.write_str("local"),
            ResourceStatus::Remote => f.write_str("remote"),
            ResourceStatus::Fetching { is_active: false, .. } => f.write_str("queued"),
            ResourceStatus::Fetching { is_active: true, progress } => {
                write!(f, "fetching {:.0}%", progress * 100.0)
            }
        }
    }
}

/// Origin of a fetch completion event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FetchSource {
    /// The data was already on disk
    Local,
    /// The data came over the network
    Remote,
}
