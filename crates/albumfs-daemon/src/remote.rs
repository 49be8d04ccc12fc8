//! Remote object model boundary
//!
//! The engine never talks HTTP itself; it drives a [`RemoteService`] that
//! pulls, pushes and deletes typed remote entries. The concrete protocol
//! client (authentication, feed parsing, pagination) lives outside this
//! crate and plugs in through the trait.
//!
//! Album and photo handles are one tagged variant, [`RemoteEntry`], so the
//! reconciler dispatches on the tag instead of a class hierarchy. The wire
//! form stored inside a cache element is the JSON encoding of the variant;
//! handles are rebuilt from it on demand and never persisted themselves.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Typed failure conditions of the remote service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("no network connection")]
    NoNetwork,

    #[error("authentication failed")]
    AuthFailed,

    #[error("remote object not found")]
    NotFound,

    #[error("remote call rejected: {0}")]
    Rejected(String),
}

/// Album visibility on the remote service
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    Public,
    Unlisted,
    Protected,
}

/// Remote album handle
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlbumEntry {
    /// Remote identifier; empty for drafts not yet pushed
    pub id: String,
    pub title: String,
    pub author: String,
    pub summary: String,
    pub access: Access,
    /// Capability token for unlisted albums
    pub auth_key: Option<String>,
    /// Optimistic-concurrency version tag (ETag)
    pub version: String,
}

/// Remote photo handle
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhotoEntry {
    pub id: String,
    pub album_id: String,
    pub title: String,
    pub summary: String,
    pub size: u64,
    /// Content version tag; changes whenever the image bytes change
    pub version: String,
    pub content_url: String,
}

/// Kind-discriminated remote handle
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteEntry {
    Album(AlbumEntry),
    Photo(PhotoEntry),
}

impl RemoteEntry {
    pub fn title(&self) -> &str {
        match self {
            RemoteEntry::Album(a) => &a.title,
            RemoteEntry::Photo(p) => &p.title,
        }
    }

    pub fn as_album(&self) -> Option<&AlbumEntry> {
        match self {
            RemoteEntry::Album(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_photo(&self) -> Option<&PhotoEntry> {
        match self {
            RemoteEntry::Photo(p) => Some(p),
            _ => None,
        }
    }

    /// Wire form stored inside cache elements
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Rebuild a handle from its stored wire form
    pub fn decode(raw: &str) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        serde_json::from_str(raw).ok()
    }

    /// Attribute names exposed through `listxattr`
    pub fn attr_names(&self) -> Vec<&'static str> {
        match self {
            RemoteEntry::Album(_) => vec!["Id", "Title", "Author", "Summary", "Version"],
            RemoteEntry::Photo(_) => vec!["Id", "Title", "Summary", "Version", "ContentUrl"],
        }
    }

    /// Look up a single attribute by name
    pub fn attr(&self, name: &str) -> Option<String> {
        match self {
            RemoteEntry::Album(a) => match name {
                "Id" => Some(a.id.clone()),
                "Title" => Some(a.title.clone()),
                "Author" => Some(a.author.clone()),
                "Summary" => Some(a.summary.clone()),
                "Version" => Some(a.version.clone()),
                _ => None,
            },
            RemoteEntry::Photo(p) => match name {
                "Id" => Some(p.id.clone()),
                "Title" => Some(p.title.clone()),
                "Summary" => Some(p.summary.clone()),
                "Version" => Some(p.version.clone()),
                "ContentUrl" => Some(p.content_url.clone()),
                _ => None,
            },
        }
    }
}

/// The call surface the engine consumes.
///
/// `pull` and `push` return `Ok(false)` when the remote side reports the
/// object gone (pull) or rejects the change (push); transport-level
/// problems surface as [`RemoteError`].
pub trait RemoteService: Send + Sync {
    /// Name of the authenticated account; empty when browsing anonymously
    fn current_user(&self) -> String;

    fn check_connectivity(&self) -> bool;

    fn login(&self, password: &str) -> Result<bool, RemoteError>;

    /// Refresh the entry from the remote service; `Ok(false)` means gone
    fn pull(&self, entry: &mut RemoteEntry) -> Result<bool, RemoteError>;

    /// Push local entry state; creates the object remotely when it has no
    /// id yet. `Ok(false)` means the service rejected the change.
    fn push(&self, entry: &mut RemoteEntry) -> Result<bool, RemoteError>;

    fn delete(&self, entry: &RemoteEntry) -> Result<bool, RemoteError>;

    fn fetch_album_list(&self, user: &str) -> Result<Vec<AlbumEntry>, RemoteError>;

    fn fetch_album_by_name(
        &self,
        title: &str,
        user: &str,
        auth_key: &str,
    ) -> Result<AlbumEntry, RemoteError>;

    fn fetch_photos(&self, album: &AlbumEntry) -> Result<Vec<PhotoEntry>, RemoteError>;

    /// Upload a new photo file into `album`
    fn upload(&self, album: &AlbumEntry, file: &Path, caption: &str)
        -> Result<PhotoEntry, RemoteError>;

    /// Replace the content of an existing photo; `Ok(false)` means rejected
    fn upload_content(&self, photo: &mut PhotoEntry, file: &Path) -> Result<bool, RemoteError>;

    /// Download photo content to `dest`
    fn download(&self, photo: &PhotoEntry, dest: &Path) -> Result<(), RemoteError>;

    /// Construct a local draft album; pushed to the service later
    fn draft_album(&self, title: &str) -> AlbumEntry;
}

/// Stand-in service used when no protocol client is wired up; reports the
/// network as unreachable so the engine runs as a pure offline cache.
pub struct Disconnected {
    user: String,
}

impl Disconnected {
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }
}

impl RemoteService for Disconnected {
    fn current_user(&self) -> String {
        self.user.clone()
    }

    fn check_connectivity(&self) -> bool {
        false
    }

    fn login(&self, _password: &str) -> Result<bool, RemoteError> {
        Err(RemoteError::NoNetwork)
    }

    fn pull(&self, _entry: &mut RemoteEntry) -> Result<bool, RemoteError> {
        Err(RemoteError::NoNetwork)
    }

    fn push(&self, _entry: &mut RemoteEntry) -> Result<bool, RemoteError> {
        Err(RemoteError::NoNetwork)
    }

    fn delete(&self, _entry: &RemoteEntry) -> Result<bool, RemoteError> {
        Err(RemoteError::NoNetwork)
    }

    fn fetch_album_list(&self, _user: &str) -> Result<Vec<AlbumEntry>, RemoteError> {
        Err(RemoteError::NoNetwork)
    }

    fn fetch_album_by_name(
        &self,
        _title: &str,
        _user: &str,
        _auth_key: &str,
    ) -> Result<AlbumEntry, RemoteError> {
        Err(RemoteError::NoNetwork)
    }

    fn fetch_photos(&self, _album: &AlbumEntry) -> Result<Vec<PhotoEntry>, RemoteError> {
        Err(RemoteError::NoNetwork)
    }

    fn upload(
        &self,
        _album: &AlbumEntry,
        _file: &Path,
        _caption: &str,
    ) -> Result<PhotoEntry, RemoteError> {
        Err(RemoteError::NoNetwork)
    }

    fn upload_content(&self, _photo: &mut PhotoEntry, _file: &Path) -> Result<bool, RemoteError> {
        Err(RemoteError::NoNetwork)
    }

    fn download(&self, _photo: &PhotoEntry, _dest: &Path) -> Result<(), RemoteError> {
        Err(RemoteError::NoNetwork)
    }

    fn draft_album(&self, title: &str) -> AlbumEntry {
        AlbumEntry {
            id: String::new(),
            title: title.to_string(),
            author: self.user.clone(),
            summary: String::new(),
            access: Access::Public,
            auth_key: None,
            version: String::new(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trips_through_wire_form() {
        let entry = RemoteEntry::Album(AlbumEntry {
            id: "album-1".into(),
            title: "Trip".into(),
            author: "alice".into(),
            summary: String::new(),
            access: Access::Public,
            auth_key: None,
            version: "v3".into(),
        });
        let decoded = RemoteEntry::decode(&entry.encode()).unwrap();
        assert_eq!(decoded, entry);
        assert!(RemoteEntry::decode("").is_none());
        assert!(RemoteEntry::decode("{bad json").is_none());
    }

    #[test]
    fn entry_attrs() {
        let entry = RemoteEntry::Photo(PhotoEntry {
            id: "photo-1".into(),
            album_id: "album-1".into(),
            title: "a.jpg".into(),
            summary: "sunset".into(),
            size: 10,
            version: "v1".into(),
            content_url: "fake://photo-1".into(),
        });
        assert_eq!(entry.attr("Summary").as_deref(), Some("sunset"));
        assert_eq!(entry.attr("Nope"), None);
        assert!(entry.attr_names().contains(&"ContentUrl"));
    }
}
