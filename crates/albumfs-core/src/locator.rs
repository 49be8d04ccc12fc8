//! Typed path identity
//!
//! A [`Locator`] is the normalized identity of one filesystem entry in the
//! three-level user/album/image hierarchy (plus the virtual control
//! directory). It derives a stable cache key from the normalized path and
//! knows how to chop down to its parent.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{AUTH_KEY_MARKER, CONTROL_DIR, MAX_DEPTH};

/// What a locator points at
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Root,
    User,
    Album,
    Image,
    /// Anything under the virtual `.control` directory (the directory itself
    /// included)
    Control,
}

/// Normalized identity of a filesystem entry.
///
/// Equal paths always yield equal locators and equal cache keys; the key is
/// a pure function of the normalized path (hex SHA-256), so it is stable
/// across restarts and collision-resistant enough to serve as the store's
/// map key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator {
    components: Vec<String>,
}

impl Locator {
    /// The filesystem root
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Parse an absolute filesystem path into a locator.
    ///
    /// Returns `None` for paths deeper than user/album/image or containing
    /// empty or `.`/`..` components.
    pub fn parse(path: &str) -> Option<Self> {
        let mut components = Vec::new();
        for part in path.split('/') {
            match part {
                "" => continue,
                "." | ".." => return None,
                _ => components.push(part.to_string()),
            }
        }
        if components.len() > MAX_DEPTH {
            return None;
        }
        Some(Self { components })
    }

    /// Build a locator from up to three raw components (used by tests and
    /// the reconciler when descending into children).
    pub fn from_components<I, S>(parts: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let components: Vec<String> = parts.into_iter().map(Into::into).collect();
        if components.len() > MAX_DEPTH || components.iter().any(|c| c.is_empty()) {
            return None;
        }
        Some(Self { components })
    }

    pub fn kind(&self) -> Kind {
        if self
            .components
            .first()
            .is_some_and(|c| c == CONTROL_DIR)
        {
            return Kind::Control;
        }
        match self.components.len() {
            0 => Kind::Root,
            1 => Kind::User,
            2 => Kind::Album,
            _ => Kind::Image,
        }
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    pub fn is_control(&self) -> bool {
        self.kind() == Kind::Control
    }

    /// True when the locator names anything at or below a user directory
    pub fn has_user(&self) -> bool {
        !self.components.is_empty()
    }

    pub fn user(&self) -> Option<&str> {
        self.components.first().map(String::as_str)
    }

    /// The album component, exactly as it appears in the path (an unlisted
    /// album may still carry its `?authkey=` suffix here)
    pub fn album(&self) -> Option<&str> {
        self.components.get(1).map(String::as_str)
    }

    pub fn image(&self) -> Option<&str> {
        self.components.get(2).map(String::as_str)
    }

    /// Album title with any `?authkey=` suffix stripped
    pub fn album_title(&self) -> Option<&str> {
        self.album()
            .map(|a| a.find(AUTH_KEY_MARKER).map_or(a, |pos| &a[..pos]))
    }

    /// Capability token embedded in the album component, if any
    pub fn auth_key(&self) -> Option<&str> {
        self.album()
            .and_then(|a| a.find(AUTH_KEY_MARKER).map(|pos| &a[pos + AUTH_KEY_MARKER.len()..]))
    }

    pub fn last_component(&self) -> Option<&str> {
        self.components.last().map(String::as_str)
    }

    /// Parent locator ("chop" derivation); the root is its own parent.
    pub fn parent(&self) -> Self {
        let mut components = self.components.clone();
        components.pop();
        Self { components }
    }

    /// Descend into a named child. Children of image locators do not exist;
    /// the caller gets the locator back unchanged in that case.
    pub fn join(&self, child: &str) -> Self {
        if self.components.len() >= MAX_DEPTH {
            return self.clone();
        }
        let mut components = self.components.clone();
        components.push(child.to_string());
        Self { components }
    }

    /// The normalized full path, always starting with `/`
    pub fn full_name(&self) -> String {
        if self.components.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", self.components.join("/"))
        }
    }

    /// Relative path below the cache root hosting this entry's backing file
    pub fn backing_rel_path(&self) -> String {
        self.components.join("/")
    }

    /// Stable cache key: hex SHA-256 of the normalized path
    pub fn key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.full_name().as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_kinds() {
        assert_eq!(Locator::parse("/").unwrap().kind(), Kind::Root);
        assert_eq!(Locator::parse("/alice").unwrap().kind(), Kind::User);
        assert_eq!(Locator::parse("/alice/Trip").unwrap().kind(), Kind::Album);
        assert_eq!(
            Locator::parse("/alice/Trip/a.jpg").unwrap().kind(),
            Kind::Image
        );
        assert_eq!(Locator::parse("/.control").unwrap().kind(), Kind::Control);
        assert_eq!(
            Locator::parse("/.control/log").unwrap().kind(),
            Kind::Control
        );
        assert!(Locator::parse("/a/b/c/d").is_none());
        assert!(Locator::parse("/a/../b").is_none());
    }

    #[test]
    fn equal_paths_equal_keys() {
        let a = Locator::parse("/alice/Trip").unwrap();
        let b = Locator::parse("//alice//Trip/").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.key(), b.key());
        let c = Locator::parse("/alice/Trips").unwrap();
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn parent_chops_one_component() {
        let img = Locator::parse("/alice/Trip/a.jpg").unwrap();
        assert_eq!(img.parent(), Locator::parse("/alice/Trip").unwrap());
        assert_eq!(img.parent().parent(), Locator::parse("/alice").unwrap());
        assert!(img.parent().parent().parent().is_root());
        assert!(Locator::root().parent().is_root());
    }

    #[test]
    fn auth_key_suffix() {
        let l = Locator::parse("/alice/Hidden?authkey=Gv1ABC").unwrap();
        assert_eq!(l.album(), Some("Hidden?authkey=Gv1ABC"));
        assert_eq!(l.album_title(), Some("Hidden"));
        assert_eq!(l.auth_key(), Some("Gv1ABC"));
        let plain = Locator::parse("/alice/Trip").unwrap();
        assert_eq!(plain.auth_key(), None);
        assert_eq!(plain.album_title(), Some("Trip"));
    }

    #[test]
    fn join_stops_at_image_depth() {
        let album = Locator::parse("/alice/Trip").unwrap();
        let img = album.join("a.jpg");
        assert_eq!(img.kind(), Kind::Image);
        assert_eq!(img.join("deeper"), img);
    }
}
