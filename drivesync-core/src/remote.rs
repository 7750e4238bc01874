use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by a [`RemoteClient`] implementation.
///
/// Transport adapters are expected to map provider responses onto these
/// variants; the engine only ever branches on [`RemoteError::classification`].
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("authentication rejected: {reason}")]
    Auth { reason: String },
    #[error("remote item not found: {id}")]
    NotFound { id: String },
    #[error("rate limited by the remote store")]
    RateLimit { retry_after_secs: Option<u64> },
    #[error("transient remote failure: {reason}")]
    Transient { reason: String },
    #[error("remote request rejected: {reason}")]
    Permanent { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    NotFound,
    RateLimit,
    Transient,
    Permanent,
}

impl RemoteError {
    pub fn classification(&self) -> ApiErrorClass {
        match self {
            RemoteError::Auth { .. } => ApiErrorClass::Auth,
            RemoteError::NotFound { .. } => ApiErrorClass::NotFound,
            RemoteError::RateLimit { .. } => ApiErrorClass::RateLimit,
            RemoteError::Transient { .. } => ApiErrorClass::Transient,
            RemoteError::Permanent { .. } => ApiErrorClass::Permanent,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self.classification(), ApiErrorClass::Auth)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.classification(), ApiErrorClass::NotFound)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            ApiErrorClass::RateLimit | ApiErrorClass::Transient
        )
    }
}

/// A single entry in a remote folder listing.
///
/// `modified` is an RFC 3339 timestamp as reported by the store; `checksum`
/// is a lowercase hex md5 digest when the store provides one. Virtual items
/// (native document formats with no binary representation) carry neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RemoteItemKind,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub parents: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteItemKind {
    File,
    Folder,
    Virtual,
}

/// The observable contract of the remote store.
///
/// Authentication and token refresh happen behind the implementation; the
/// engine sees auth failures only as [`RemoteError::Auth`]. All methods are
/// expected to be safe to call concurrently.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Lists the direct children of a folder. `None` lists the drive root.
    async fn list(&self, parent_id: Option<&str>) -> Result<Vec<RemoteItem>, RemoteError>;

    /// Fetches the full content of a file item.
    async fn download(&self, id: &str) -> Result<Vec<u8>, RemoteError>;

    /// Creates a new file under `parent_id` and returns its id.
    async fn create_file(
        &self,
        name: &str,
        parent_id: Option<&str>,
        bytes: &[u8],
    ) -> Result<String, RemoteError>;

    /// Creates a folder under `parent_id` and returns its id.
    async fn create_folder(&self, name: &str, parent_id: Option<&str>)
    -> Result<String, RemoteError>;

    /// Replaces the content of an existing file in place.
    async fn update(&self, id: &str, bytes: &[u8]) -> Result<(), RemoteError>;

    /// Deletes an item. Deleting an already-deleted item yields
    /// [`RemoteError::NotFound`], which callers treat as success.
    async fn delete(&self, id: &str) -> Result<(), RemoteError>;
}
