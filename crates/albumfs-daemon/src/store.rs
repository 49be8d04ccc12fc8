//! Cache store
//!
//! The authoritative in-memory map from locator key to cache element, its
//! on-disk backing layout under the cache root, and wholesale
//! snapshot/restore. All operations are safe for concurrent callers; the
//! single map lock is never held across disk or network I/O beyond what a
//! local file delete costs.
//!
//! # Disk layout
//! ```text
//! <cache_root>/
//! ├── cache.bin           # bincode snapshot of the whole element map
//! ├── lost+found/         # backing bytes of elements that diverged
//! └── <user>/<album>/<image>   # backing files, mirroring the hierarchy
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

use albumfs_core::{CacheError, CacheResult, Kind, Locator};

use crate::element::{CacheElement, ElementKind};

/// Snapshot file name under the cache root
const SNAPSHOT_FILE: &str = "cache.bin";

/// Retention area for elements whose remote counterpart disappeared
const LOST_AND_FOUND: &str = "lost+found";

pub struct CacheStore {
    root: PathBuf,
    elements: Mutex<HashMap<String, CacheElement>>,
}

impl CacheStore {
    pub fn new(root: &Path) -> CacheResult<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            elements: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a backing file given its stored relative path
    pub fn backing_abs(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn len(&self) -> usize {
        self.elements.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.lock().is_empty()
    }

    pub fn exists(&self, locator: &Locator) -> bool {
        self.elements.lock().contains_key(&locator.key())
    }

    pub fn get(&self, locator: &Locator) -> Option<CacheElement> {
        self.elements.lock().get(&locator.key()).cloned()
    }

    /// Insert or replace the element for `locator`, materializing the
    /// on-disk directories that will host its backing file. Control paths
    /// are purely virtual and get no disk presence.
    pub fn put(&self, locator: &Locator, element: CacheElement) {
        if !locator.is_control() && !locator.is_root() {
            let host = match locator.kind() {
                Kind::Image => locator.parent().backing_rel_path(),
                _ => locator.backing_rel_path(),
            };
            if !host.is_empty() {
                if let Err(e) = fs::create_dir_all(self.root.join(&host)) {
                    warn!("could not materialize cache dir {}: {}", host, e);
                }
            }
        }
        self.elements.lock().insert(locator.key(), element);
    }

    /// Remove `locator` and, for directories, all its children. Backing
    /// files are deleted and the element is unlinked from its parent's
    /// `contents`. Removing the root is refused.
    pub fn remove(&self, locator: &Locator) {
        if locator.is_root() {
            return;
        }
        let mut doomed_files = Vec::new();
        {
            let mut elements = self.elements.lock();
            Self::remove_locked(&mut elements, locator, &mut doomed_files);
            let parent_key = locator.parent().key();
            if let Some(parent) = elements.get_mut(&parent_key) {
                if let ElementKind::Directory { contents, .. } = &mut parent.kind {
                    if let Some(name) = locator.last_component() {
                        contents.remove(name);
                    }
                }
            }
        }
        for rel in doomed_files {
            let _ = fs::remove_file(self.root.join(rel));
        }
    }

    fn remove_locked(
        elements: &mut HashMap<String, CacheElement>,
        locator: &Locator,
        doomed_files: &mut Vec<String>,
    ) {
        let Some(element) = elements.remove(&locator.key()) else {
            return;
        };
        match element.kind {
            ElementKind::File { generated, backing } => {
                if !generated && !backing.is_empty() {
                    doomed_files.push(backing);
                }
            }
            ElementKind::Directory { contents, .. } => {
                for child in contents {
                    Self::remove_locked(elements, &locator.join(&child), doomed_files);
                }
            }
        }
    }

    /// Move an element under a new locator without touching backing files.
    /// Used by best-effort rename handling; the old parent link is swapped
    /// for the new name.
    pub fn rekey(&self, from: &Locator, to: &Locator) {
        if from == to || from.is_root() {
            return;
        }
        let mut elements = self.elements.lock();
        let Some(element) = elements.remove(&from.key()) else {
            return;
        };
        let parent_key = from.parent().key();
        if let Some(parent) = elements.get_mut(&parent_key) {
            if let ElementKind::Directory { contents, .. } = &mut parent.kind {
                if let Some(old) = from.last_component() {
                    contents.remove(old);
                }
                if let Some(new) = to.last_component() {
                    contents.insert(new.to_string());
                }
            }
        }
        elements.insert(to.key(), element);
    }

    /// Retire a diverged element: its backing bytes move to the lost+found
    /// area before the element (and any children) leave the store. Refused
    /// while the element carries unpushed local changes.
    pub fn lost_and_found(&self, locator: &Locator) -> CacheResult<()> {
        let element = self.get(locator).ok_or(CacheError::NotFound)?;
        if element.local_changes {
            return Err(CacheError::failed(
                "element has unpushed local changes; refusing to retire it",
            ));
        }
        let area = self.root.join(LOST_AND_FOUND);
        fs::create_dir_all(&area)?;

        let mut rescued = Vec::new();
        match &element.kind {
            ElementKind::File { generated, backing } => {
                if !generated && !backing.is_empty() {
                    rescued.push(backing.clone());
                }
            }
            ElementKind::Directory { contents, .. } => {
                for child in contents {
                    if let Some(c) = self.get(&locator.join(child)) {
                        if c.local_changes {
                            return Err(CacheError::failed(
                                "child has unpushed local changes; refusing to retire it",
                            ));
                        }
                        if let ElementKind::File {
                            generated: false,
                            backing,
                        } = &c.kind
                        {
                            if !backing.is_empty() {
                                rescued.push(backing.clone());
                            }
                        }
                    }
                }
            }
        }
        for rel in rescued {
            let src = self.root.join(&rel);
            if !src.exists() {
                continue;
            }
            let base = Path::new(&rel)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unnamed".to_string());
            let mut dest = area.join(&base);
            if dest.exists() {
                dest = area.join(format!("{}.{}", base, &locator.key()[..8]));
            }
            if let Err(e) = fs::rename(&src, &dest) {
                warn!("could not move {:?} to lost+found: {}", src, e);
            }
        }
        self.remove(locator);
        debug!("retired {} to lost+found", locator);
        Ok(())
    }

    /// Every (directory name, auth key) pair materialized in the store
    pub fn auth_keys(&self) -> Vec<(String, String)> {
        let elements = self.elements.lock();
        let mut keys: Vec<(String, String)> = elements
            .values()
            .filter_map(|e| match &e.kind {
                ElementKind::Directory { auth_key, .. } if !auth_key.is_empty() => {
                    Some((e.name.clone(), auth_key.clone()))
                }
                _ => None,
            })
            .collect();
        keys.sort();
        keys
    }

    /// Write the whole map to the snapshot file (write-then-rename)
    pub fn snapshot(&self) -> CacheResult<()> {
        let bytes = {
            let elements = self.elements.lock();
            bincode::serialize(&*elements)
                .map_err(|e| CacheError::failed(format!("snapshot encode: {e}")))?
        };
        let tmp = self.root.join(format!("{SNAPSHOT_FILE}.tmp"));
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, self.root.join(SNAPSHOT_FILE))?;
        debug!("cache snapshot written ({} bytes)", bytes.len());
        Ok(())
    }

    /// Restore the map from the snapshot file. A missing or corrupt
    /// snapshot leaves the store empty and returns `false`.
    pub fn restore(&self) -> bool {
        let path = self.root.join(SNAPSHOT_FILE);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(_) => return false,
        };
        match bincode::deserialize::<HashMap<String, CacheElement>>(&bytes) {
            Ok(map) => {
                let count = map.len();
                *self.elements.lock() = map;
                debug!("cache snapshot restored ({count} elements)");
                true
            }
            Err(e) => {
                warn!("corrupt cache snapshot, starting fresh: {e}");
                self.elements.lock().clear();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, CacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn dir_with(children: &[&str]) -> CacheElement {
        let mut e = CacheElement::directory("d");
        for c in children {
            e.contents_mut().unwrap().insert(c.to_string());
        }
        e
    }

    #[test]
    fn put_get_roundtrip() {
        let (_tmp, store) = store();
        let l = Locator::parse("/alice/Trip").unwrap();
        store.put(&l, CacheElement::directory("Trip"));
        assert!(store.exists(&l));
        assert_eq!(store.get(&l).unwrap().name, "Trip");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn put_materializes_host_dirs() {
        let (tmp, store) = store();
        let img = Locator::parse("/alice/Trip/a.jpg").unwrap();
        store.put(&img, CacheElement::file("a.jpg"));
        assert!(tmp.path().join("alice/Trip").is_dir());
        // control paths stay virtual
        let ctl = Locator::parse("/.control/log").unwrap();
        store.put(&ctl, CacheElement::file("log"));
        assert!(!tmp.path().join(".control").exists());
    }

    #[test]
    fn remove_recurses_and_unlinks_parent() {
        let (tmp, store) = store();
        let user = Locator::parse("/alice").unwrap();
        let album = Locator::parse("/alice/Trip").unwrap();
        let img = Locator::parse("/alice/Trip/a.jpg").unwrap();

        store.put(&user, dir_with(&["Trip"]));
        store.put(&album, dir_with(&["a.jpg"]));
        let mut photo = CacheElement::file("a.jpg");
        photo.set_backing("alice/Trip/a.jpg");
        store.put(&img, photo);
        fs::write(tmp.path().join("alice/Trip/a.jpg"), b"bytes").unwrap();

        store.remove(&album);
        assert!(!store.exists(&album));
        assert!(!store.exists(&img));
        assert!(!tmp.path().join("alice/Trip/a.jpg").exists());
        assert!(!store.get(&user).unwrap().contents().unwrap().contains("Trip"));
    }

    #[test]
    fn remove_root_is_refused() {
        let (_tmp, store) = store();
        store.put(&Locator::root(), CacheElement::directory(""));
        store.remove(&Locator::root());
        assert!(store.exists(&Locator::root()));
    }

    #[test]
    fn snapshot_restore_roundtrip() {
        let (tmp, store) = store();
        let l = Locator::parse("/alice/Trip").unwrap();
        let mut e = CacheElement::directory("Trip");
        e.last_updated = 99;
        e.remote_version = "v7".into();
        e.open_count = 5; // runtime state, must not survive
        store.put(&l, e.clone());
        store.snapshot().unwrap();

        let fresh = CacheStore::new(tmp.path()).unwrap();
        assert!(fresh.restore());
        let back = fresh.get(&l).unwrap();
        assert_eq!(back.name, "Trip");
        assert_eq!(back.last_updated, 99);
        assert_eq!(back.remote_version, "v7");
        assert_eq!(back.open_count, 0);
    }

    #[test]
    fn corrupt_snapshot_starts_fresh() {
        let (tmp, store) = store();
        fs::write(tmp.path().join("cache.bin"), b"definitely not bincode").unwrap();
        assert!(!store.restore());
        assert!(store.is_empty());
    }

    #[test]
    fn missing_snapshot_starts_fresh() {
        let (_tmp, store) = store();
        assert!(!store.restore());
    }

    #[test]
    fn lost_and_found_moves_backing_bytes() {
        let (tmp, store) = store();
        let img = Locator::parse("/alice/Trip/a.jpg").unwrap();
        let mut photo = CacheElement::file("a.jpg");
        photo.set_backing("alice/Trip/a.jpg");
        store.put(&img, photo);
        fs::write(tmp.path().join("alice/Trip/a.jpg"), b"bytes").unwrap();

        store.lost_and_found(&img).unwrap();
        assert!(!store.exists(&img));
        assert!(!tmp.path().join("alice/Trip/a.jpg").exists());
        assert_eq!(
            fs::read(tmp.path().join("lost+found/a.jpg")).unwrap(),
            b"bytes"
        );
    }

    #[test]
    fn lost_and_found_refuses_local_changes() {
        let (_tmp, store) = store();
        let img = Locator::parse("/alice/Trip/a.jpg").unwrap();
        let mut photo = CacheElement::file("a.jpg");
        photo.local_changes = true;
        store.put(&img, photo);
        assert!(store.lost_and_found(&img).is_err());
        assert!(store.exists(&img));
    }

    #[test]
    fn rekey_swaps_parent_link() {
        let (_tmp, store) = store();
        let album = Locator::parse("/alice/Trip").unwrap();
        store.put(&album, dir_with(&["old.jpg"]));
        let old = Locator::parse("/alice/Trip/old.jpg").unwrap();
        let new = Locator::parse("/alice/Trip/new.jpg").unwrap();
        store.put(&old, CacheElement::file("old.jpg"));

        store.rekey(&old, &new);
        assert!(!store.exists(&old));
        assert!(store.exists(&new));
        let contents = store.get(&album).unwrap().contents().unwrap().clone();
        assert!(contents.contains("new.jpg"));
        assert!(!contents.contains("old.jpg"));
    }

    #[test]
    fn auth_keys_lists_unlisted_dirs() {
        let (_tmp, store) = store();
        let l = Locator::parse("/alice/Hidden").unwrap();
        let mut e = CacheElement::directory("Hidden");
        if let ElementKind::Directory { auth_key, .. } = &mut e.kind {
            *auth_key = "Gv1ABC".to_string();
        }
        store.put(&l, e);
        store.put(
            &Locator::parse("/alice/Trip").unwrap(),
            CacheElement::directory("Trip"),
        );
        assert_eq!(
            store.auth_keys(),
            vec![("Hidden".to_string(), "Gv1ABC".to_string())]
        );
    }
}
