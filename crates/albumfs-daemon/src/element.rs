//! Cache elements
//!
//! One [`CacheElement`] mirrors one remote (or locally created) filesystem
//! entry. The serialized remote representation travels with the element;
//! the typed handle is rebuilt from it on access and never persisted.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::remote::{Access, AlbumEntry, PhotoEntry, RemoteEntry};

/// Nominal size reported for directories
pub const DIR_SIZE: u64 = 1024;

/// Kind-specific payload of a cache element
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ElementKind {
    Directory {
        /// Capability token for unlisted albums, empty otherwise
        auth_key: String,
        /// Names of the children currently materialized in the store
        contents: BTreeSet<String>,
    },
    File {
        /// Content is computed on read instead of backed by a local file
        generated: bool,
        /// Relative path of the backing file, or the literal content for
        /// generated files
        backing: String,
    },
}

/// Cached representation of one locator
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheElement {
    pub name: String,
    pub size: u64,
    pub world_readable: bool,
    pub writeable: bool,
    /// Epoch seconds of the last successful reconciliation; 0 forces the
    /// next pull through the staleness gate
    pub last_updated: u64,
    /// Local mutation not yet pushed to the remote service
    pub local_changes: bool,
    /// False while the file is being actively written; such files are
    /// never uploaded
    pub finalized: bool,
    /// Serialized remote representation ("" = no remote counterpart yet)
    pub entry: String,
    /// Content version tag of the locally cached bytes
    pub remote_version: String,
    /// Concurrent-opener reference count; runtime state, not persisted
    #[serde(skip)]
    pub open_count: u32,
    pub kind: ElementKind,
}

impl CacheElement {
    pub fn directory(name: &str) -> Self {
        Self {
            name: name.to_string(),
            size: DIR_SIZE,
            world_readable: false,
            writeable: false,
            last_updated: 0,
            local_changes: false,
            finalized: true,
            entry: String::new(),
            remote_version: String::new(),
            open_count: 0,
            kind: ElementKind::Directory {
                auth_key: String::new(),
                contents: BTreeSet::new(),
            },
        }
    }

    pub fn file(name: &str) -> Self {
        Self {
            name: name.to_string(),
            size: 0,
            world_readable: false,
            writeable: false,
            last_updated: 0,
            local_changes: false,
            finalized: true,
            entry: String::new(),
            remote_version: String::new(),
            open_count: 0,
            kind: ElementKind::File {
                generated: false,
                backing: String::new(),
            },
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, ElementKind::Directory { .. })
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, ElementKind::File { .. })
    }

    pub fn is_generated(&self) -> bool {
        matches!(self.kind, ElementKind::File { generated: true, .. })
    }

    pub fn contents(&self) -> Option<&BTreeSet<String>> {
        match &self.kind {
            ElementKind::Directory { contents, .. } => Some(contents),
            _ => None,
        }
    }

    pub fn contents_mut(&mut self) -> Option<&mut BTreeSet<String>> {
        match &mut self.kind {
            ElementKind::Directory { contents, .. } => Some(contents),
            _ => None,
        }
    }

    pub fn auth_key(&self) -> &str {
        match &self.kind {
            ElementKind::Directory { auth_key, .. } => auth_key,
            _ => "",
        }
    }

    pub fn backing(&self) -> &str {
        match &self.kind {
            ElementKind::File { backing, .. } => backing,
            _ => "",
        }
    }

    pub fn set_backing(&mut self, value: impl Into<String>) {
        if let ElementKind::File { backing, .. } = &mut self.kind {
            *backing = value.into();
        }
    }

    /// Rebuild the remote handle from the stored wire form
    pub fn remote_entry(&self) -> Option<RemoteEntry> {
        RemoteEntry::decode(&self.entry)
    }

    pub fn set_remote_entry(&mut self, entry: &RemoteEntry) {
        self.entry = entry.encode();
    }

    /// Refresh this element from a pulled album handle. Existing directory
    /// contents and `remote_version` are preserved; `last_updated` is reset
    /// so the caller decides the new staleness stamp.
    pub fn apply_album(&mut self, album: &AlbumEntry) {
        let contents = match std::mem::replace(
            &mut self.kind,
            ElementKind::Directory {
                auth_key: String::new(),
                contents: BTreeSet::new(),
            },
        ) {
            ElementKind::Directory { contents, .. } => contents,
            ElementKind::File { .. } => BTreeSet::new(),
        };
        self.kind = ElementKind::Directory {
            auth_key: album.auth_key.clone().unwrap_or_default(),
            contents,
        };
        self.name = album.title.clone();
        self.size = DIR_SIZE;
        self.world_readable = album.access == Access::Public;
        self.writeable = false;
        self.last_updated = 0;
        self.local_changes = false;
        self.entry = RemoteEntry::Album(album.clone()).encode();
    }

    /// Refresh this element from a pulled photo handle. The backing path
    /// and `remote_version` are preserved (the version tag only moves when
    /// content is actually downloaded or uploaded).
    pub fn apply_photo(&mut self, photo: &PhotoEntry) {
        let backing = match std::mem::replace(
            &mut self.kind,
            ElementKind::File {
                generated: false,
                backing: String::new(),
            },
        ) {
            ElementKind::File { backing, .. } => backing,
            ElementKind::Directory { .. } => String::new(),
        };
        self.kind = ElementKind::File {
            generated: false,
            backing,
        };
        self.name = photo.title.clone();
        self.size = photo.size;
        self.world_readable = true;
        self.writeable = false;
        self.last_updated = 0;
        self.local_changes = false;
        self.finalized = true;
        self.entry = RemoteEntry::Photo(photo.clone()).encode();
    }

    /// Human-readable dump served through the `CacheElement` xattr
    pub fn describe(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Name: {}\n", self.name));
        out.push_str(&format!("Size: {}\n", self.size));
        out.push_str(&format!("Last Updated: {}\n", self.last_updated));
        out.push_str(&format!("Cached Version: {}\n", self.remote_version));
        out.push_str(&format!("Local Changes: {}\n", self.local_changes));
        out.push_str(&format!("Open Count: {}\n", self.open_count));
        match &self.kind {
            ElementKind::Directory { auth_key, contents } => {
                out.push_str("Type: Directory\n");
                out.push_str(&format!("AuthKey: {}\n", auth_key));
                out.push_str(&format!("Contents Size: {}\n", contents.len()));
            }
            ElementKind::File { generated, backing } => {
                out.push_str("Type: File\n");
                out.push_str(&format!("Generated: {}\n", generated));
                out.push_str(&format!("Backing: {}\n", backing));
            }
        }
        out.push_str(" ---------- Entry ----------\n");
        out.push_str(&self.entry);
        out.push('\n');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn album() -> AlbumEntry {
        AlbumEntry {
            id: "album-1".into(),
            title: "Trip".into(),
            author: "alice".into(),
            summary: String::new(),
            access: Access::Public,
            auth_key: None,
            version: "v2".into(),
        }
    }

    fn photo() -> PhotoEntry {
        PhotoEntry {
            id: "photo-1".into(),
            album_id: "album-1".into(),
            title: "a.jpg".into(),
            summary: String::new(),
            size: 42,
            version: "v5".into(),
            content_url: "fake://photo-1".into(),
        }
    }

    #[test]
    fn apply_album_preserves_contents() {
        let mut e = CacheElement::directory("Trip");
        e.contents_mut().unwrap().insert("a.jpg".into());
        e.local_changes = false;
        e.apply_album(&album());
        assert!(e.contents().unwrap().contains("a.jpg"));
        assert_eq!(e.name, "Trip");
        assert!(e.world_readable);
        assert!(!e.local_changes);
        assert_eq!(e.last_updated, 0);
        assert!(e.remote_entry().unwrap().as_album().is_some());
    }

    #[test]
    fn apply_photo_preserves_backing_and_version() {
        let mut e = CacheElement::file("a.jpg");
        e.set_backing("alice/Trip/a.jpg");
        e.remote_version = "v4".into();
        e.local_changes = true;
        e.apply_photo(&photo());
        assert_eq!(e.backing(), "alice/Trip/a.jpg");
        assert_eq!(e.remote_version, "v4");
        assert_eq!(e.size, 42);
        assert!(e.finalized);
        assert!(!e.local_changes);
    }

    #[test]
    fn open_count_not_persisted() {
        let mut e = CacheElement::file("a.jpg");
        e.open_count = 3;
        let bytes = bincode::serialize(&e).unwrap();
        let back: CacheElement = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.open_count, 0);
        assert_eq!(back.name, "a.jpg");
    }

    #[test]
    fn rebuilt_handle_matches_stored_entry() {
        let mut e = CacheElement::directory("Trip");
        e.apply_album(&album());
        let entry = e.remote_entry().unwrap();
        assert_eq!(entry.as_album().unwrap().id, "album-1");
        assert_eq!(entry.title(), "Trip");
    }
}
