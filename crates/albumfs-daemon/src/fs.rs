//! Filesystem operation facade
//!
//! The public surface the FUSE shim calls into: attribute lookup,
//! directory listing, read/write, descriptor lifecycle and the mutating
//! directory operations. Everything is built on the cache store and the
//! scheduler; calls serve cached data wherever possible and fall back to a
//! synchronous reconciliation only where an authoritative answer is
//! required (attributes and listings of not-yet-cached users/albums).
//!
//! Read paths prefer placeholder content over hard failure so casual
//! directory browsing stays resilient even while content is still being
//! fetched.

use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use albumfs_core::{CacheError, CacheResult, Kind, Locator};

use crate::control;
use crate::element::{CacheElement, ElementKind};
use crate::media::MediaProcessor;
use crate::observe::Observer;
use crate::queue::Queues;
use crate::reconcile::Reconciler;
use crate::remote::{RemoteEntry, RemoteService};
use crate::store::CacheStore;
use crate::worker::Scheduler;

/// Served for generated files whose content has not been rendered yet
const PENDING_CONTENT: &str = "Data not yet available...\n";

/// Attributes of one filesystem entry, as the FUSE shim needs them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attributes {
    pub directory: bool,
    pub size: u64,
    pub world_readable: bool,
    pub writeable: bool,
    /// Epoch seconds of the last reconciliation
    pub modified: u64,
}

/// Lazily-opened read/write handles of one file element. Dropped as a
/// whole when the last concurrent opener leaves.
#[derive(Default)]
struct Descriptors {
    reader: Option<File>,
    writer: Option<File>,
}

pub struct AlbumFs {
    store: Arc<CacheStore>,
    queues: Arc<Queues>,
    reconciler: Arc<Reconciler>,
    scheduler: Arc<Scheduler>,
    observer: Arc<Observer>,
    remote: Arc<dyn RemoteService>,
    media: Arc<dyn MediaProcessor>,
    max_pixels: u64,
    descriptors: Mutex<HashMap<String, Arc<Mutex<Descriptors>>>>,
}

impl AlbumFs {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<CacheStore>,
        queues: Arc<Queues>,
        reconciler: Arc<Reconciler>,
        scheduler: Arc<Scheduler>,
        observer: Arc<Observer>,
        remote: Arc<dyn RemoteService>,
        media: Arc<dyn MediaProcessor>,
        max_pixels: u64,
    ) -> Self {
        Self {
            store,
            queues,
            reconciler,
            scheduler,
            observer,
            remote,
            media,
            max_pixels,
            descriptors: Mutex::new(HashMap::new()),
        }
    }

    fn descriptors_for(&self, locator: &Locator) -> Arc<Mutex<Descriptors>> {
        self.descriptors
            .lock()
            .entry(locator.key())
            .or_default()
            .clone()
    }

    fn owns(&self, locator: &Locator) -> bool {
        locator.user().is_some_and(|u| u == self.remote.current_user())
    }

    /// Serve attributes from the cache; a not-yet-cached user or album is
    /// reconciled synchronously and retried once. Anything else uncached
    /// does not exist (yet - it may appear when the parent refreshes).
    pub fn attributes(&self, locator: &Locator) -> CacheResult<Attributes> {
        let element = match self.store.get(locator) {
            Some(e) => e,
            None => {
                match locator.kind() {
                    Kind::User => {}
                    // desktop environments probe this name in every folder
                    Kind::Album if locator.album_title() != Some(".directory") => {}
                    _ => return Err(CacheError::NotFound),
                }
                self.reconciler
                    .reconcile(locator, false)
                    .map_err(|_| CacheError::NotFound)?;
                self.store.get(locator).ok_or(CacheError::NotFound)?
            }
        };
        let mut size = element.size;
        if let ElementKind::File {
            generated: false,
            backing,
        } = &element.kind
        {
            if let Ok(meta) = std::fs::metadata(self.store.backing_abs(backing)) {
                size = meta.len();
            }
        }
        Ok(Attributes {
            directory: element.is_dir(),
            size,
            world_readable: element.world_readable,
            writeable: element.writeable,
            modified: element.last_updated,
        })
    }

    /// List a directory. Cached listings are returned immediately with a
    /// background freshness refresh; uncached users/albums are reconciled
    /// synchronously first.
    pub fn list(&self, locator: &Locator) -> CacheResult<BTreeSet<String>> {
        if let Some(element) = self.store.get(locator) {
            let contents = element.contents().ok_or(CacheError::NotSupported)?;
            self.reconciler.please_update(locator);
            return Ok(contents.clone());
        }
        if !matches!(locator.kind(), Kind::User | Kind::Album) {
            return Err(CacheError::NotSupported);
        }
        self.reconciler.reconcile(locator, false)?;
        let element = self.store.get(locator).ok_or(CacheError::NotFound)?;
        element
            .contents()
            .cloned()
            .ok_or(CacheError::NotSupported)
    }

    /// Read up to `size` bytes at `offset`. Generated files regenerate
    /// synchronously; ordinary files read through a lazily-opened
    /// descriptor. A missing backing file schedules a priority re-pull and
    /// yields a descriptive message instead of an error.
    pub fn read(&self, locator: &Locator, offset: u64, size: u32) -> CacheResult<Vec<u8>> {
        let Some(element) = self.store.get(locator) else {
            return Ok(Vec::new());
        };
        let backing = match &element.kind {
            ElementKind::Directory { .. } => return Ok(Vec::new()),
            ElementKind::File { generated, backing } => {
                if *generated {
                    self.reconciler.refresh_control(locator);
                    let content = self
                        .store
                        .get(locator)
                        .map(|e| e.backing().to_string())
                        .filter(|c| !c.is_empty())
                        .unwrap_or_else(|| PENDING_CONTENT.to_string());
                    return Ok(slice_text(&content, offset, size));
                }
                backing.clone()
            }
        };

        let handle = self.descriptors_for(locator);
        let mut descriptors = handle.lock();
        if descriptors.reader.is_none() {
            let abs = self.store.backing_abs(&backing);
            match File::open(&abs) {
                Ok(file) => {
                    descriptors.reader = Some(file);
                    self.observer
                        .counters
                        .open_files
                        .fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!("no backing store for {locator}: {e}");
                    self.scheduler.request_priority(locator);
                    let msg = format!(
                        "Error opening {backing} ({e})\nA download has been scheduled, please retry shortly.\n"
                    );
                    return Ok(slice_text(&msg, offset, size));
                }
            }
        }
        let file = descriptors.reader.as_mut().expect("reader just opened");
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        loop {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
            if filled == buf.len() {
                break;
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Write through an on-demand descriptor, marking the element dirty
    /// and mid-write. The upload happens when the last opener closes.
    pub fn write(&self, locator: &Locator, data: &[u8], offset: u64) -> CacheResult<u32> {
        let Some(mut element) = self.store.get(locator) else {
            return Err(CacheError::NotFound);
        };
        if element.is_generated() || element.is_dir() {
            return Err(CacheError::AccessDenied);
        }
        let handle = self.descriptors_for(locator);
        let mut descriptors = handle.lock();
        if descriptors.writer.is_none() {
            let abs = self.store.backing_abs(element.backing());
            match OpenOptions::new().write(true).create(true).open(&abs) {
                Ok(file) => {
                    descriptors.writer = Some(file);
                    self.observer
                        .counters
                        .open_files
                        .fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!("cannot open backing store of {locator} for writing: {e}");
                    return Err(CacheError::NotFound);
                }
            }
        }
        element.local_changes = true;
        element.finalized = false;
        self.store.put(locator, element);

        let file = descriptors.writer.as_mut().expect("writer just opened");
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(data.len() as u32)
    }

    /// Resize the backing file (truncate-on-open and explicit truncate)
    pub fn truncate(&self, locator: &Locator, size: u64) -> CacheResult<()> {
        let Some(mut element) = self.store.get(locator) else {
            return Err(CacheError::NotFound);
        };
        if element.is_dir() || element.is_generated() {
            return Err(CacheError::AccessDenied);
        }
        let abs = self.store.backing_abs(element.backing());
        let file = OpenOptions::new().write(true).open(&abs)?;
        file.set_len(size)?;
        element.size = size;
        element.local_changes = true;
        element.finalized = false;
        self.store.put(locator, element);
        Ok(())
    }

    /// Count one more concurrent opener. Write opens are only honored on
    /// the authenticated user's own images.
    pub fn open(&self, locator: &Locator, write: bool) -> CacheResult<()> {
        let Some(mut element) = self.store.get(locator) else {
            return Err(CacheError::NotFound);
        };
        if element.is_generated() {
            if write {
                return Err(CacheError::Unimplemented);
            }
            element.open_count += 1;
            self.store.put(locator, element);
            self.reconciler.refresh_control(locator);
            return Ok(());
        }
        if write && (locator.kind() != Kind::Image || !self.owns(locator)) {
            debug!("access denied for writing into {locator}");
            return Err(CacheError::AccessDenied);
        }
        element.open_count += 1;
        self.store.put(locator, element);
        Ok(())
    }

    /// Drop one opener reference. The last closer releases both
    /// descriptors; when the file carries local changes it is also
    /// finalized (resized to the pixel budget, forced stale) and queued
    /// for upload.
    pub fn close(&self, locator: &Locator) -> CacheResult<()> {
        let Some(mut element) = self.store.get(locator) else {
            return Err(CacheError::NotFound);
        };
        element.open_count = element.open_count.saturating_sub(1);
        if element.open_count > 0 {
            self.store.put(locator, element);
            return Ok(());
        }

        if let Some(handle) = self.descriptors.lock().remove(&locator.key()) {
            let descriptors = handle.lock();
            let released =
                descriptors.reader.is_some() as u64 + descriptors.writer.is_some() as u64;
            if released > 0 {
                self.observer
                    .counters
                    .open_files
                    .fetch_sub(released, Ordering::Relaxed);
            }
        }

        if element.local_changes && element.is_file() && !element.is_generated() {
            let abs = self.store.backing_abs(element.backing());
            if self.max_pixels > 0 {
                if let Err(e) = self.media.resize_to_pixel_budget(&abs, self.max_pixels) {
                    warn!("resizing {locator} failed: {e}");
                }
            }
            if let Ok(meta) = std::fs::metadata(&abs) {
                element.size = meta.len();
            }
            element.finalized = true;
            element.last_updated = 0;
            self.store.put(locator, element);
            self.reconciler.local_change(locator);
        } else {
            self.store.put(locator, element);
        }
        Ok(())
    }

    /// Create a new (empty) image file in one of the authenticated user's
    /// albums. Touching a control action file triggers the corresponding
    /// engine action instead; the touch itself never materializes a file.
    pub fn create(&self, locator: &Locator) -> CacheResult<()> {
        if locator.kind() != Kind::Image {
            if *locator == control::sync_path() {
                self.scheduler.sync();
            } else if *locator == control::offline_path() {
                self.reconciler.go_offline();
            } else if *locator == control::online_path() {
                self.reconciler.go_online();
            }
            return Err(CacheError::Unimplemented);
        }
        if !self.owns(locator) {
            return Err(CacheError::AccessDenied);
        }
        let parent_cached = self
            .store
            .get(&locator.parent())
            .is_some_and(|e| e.is_dir());
        if !parent_cached
            || !self.store.exists(&locator.parent().parent())
            || self.store.exists(locator)
        {
            return Err(CacheError::failed("create preconditions not met"));
        }
        let name = locator.image().unwrap_or_default();
        if name.contains(".directory.lock") {
            debug!("refusing to create a .directory.lock file ({locator})");
            return Err(CacheError::failed(".directory.lock files are not supported"));
        }

        let mut element = CacheElement::file(name);
        element.writeable = true;
        element.local_changes = true;
        element.finalized = false;
        element.set_backing(locator.backing_rel_path());
        self.store.put(locator, element);
        if let Err(e) = File::create(self.store.backing_abs(&locator.backing_rel_path())) {
            warn!("error creating backing file for {locator}: {e}");
            self.store.remove(locator);
            return Err(CacheError::failed("could not create the backing file"));
        }

        if let Some(mut parent) = self.store.get(&locator.parent()) {
            if let Some(contents) = parent.contents_mut() {
                contents.insert(name.to_string());
            }
            self.store.put(&locator.parent(), parent);
        }
        debug!("created {locator}");
        Ok(())
    }

    /// `mkdir` only means something at album depth: create the album
    /// locally and push it. User directories appear by browsing them, not
    /// by mkdir.
    pub fn mkdir(&self, locator: &Locator) -> CacheResult<()> {
        match locator.kind() {
            Kind::Album => {
                if !self.owns(locator) {
                    return Err(CacheError::AccessDenied);
                }
                if self.store.exists(locator) {
                    return Err(CacheError::failed("album already cached"));
                }
                self.reconciler.new_album(locator)
            }
            Kind::User => Err(CacheError::Unimplemented),
            _ => Err(CacheError::NotSupported),
        }
    }

    /// Delete a photo, remotely and from the cache. On the control
    /// surface, `rm` clears the log or a queue instead.
    pub fn unlink(&self, locator: &Locator) -> CacheResult<()> {
        if *locator == control::log_path() {
            self.observer.record("clear log file");
            self.observer.clear();
            return Ok(());
        } else if *locator == control::update_queue_path() {
            self.observer.record("clear update queue");
            self.queues.pull.clear();
            return Ok(());
        } else if *locator == control::priority_queue_path() {
            self.observer.record("clear priority update queue");
            self.queues.priority.clear();
            return Ok(());
        } else if *locator == control::local_changes_queue_path() {
            // pending pushes are abandoned, not retried later
            self.observer.record("clear local changes queue");
            self.queues.local.clear();
            return Ok(());
        }

        if locator.kind() != Kind::Image {
            return Err(CacheError::NotSupported);
        }
        if !self.owns(locator) {
            return Err(CacheError::AccessDenied);
        }
        let element = self.store.get(locator).ok_or(CacheError::NotFound)?;
        match element.remote_entry() {
            Some(entry @ RemoteEntry::Photo(_)) => {
                if !self.reconciler.is_online() {
                    return Err(CacheError::NoNetworkConnection);
                }
                match self.remote.delete(&entry) {
                    Ok(true) => {}
                    Ok(false) => return Err(CacheError::failed("remote delete was rejected")),
                    Err(e) => return Err(self.reconciler.classify_remote(e)),
                }
            }
            // never remotely created; only a pending local change to drop
            _ if element.local_changes => {
                self.queues.local.remove(locator);
            }
            _ => return Err(CacheError::failed("cached photo has no remote handle")),
        }
        self.store.remove(locator);
        self.reconciler.please_update(&locator.parent());
        Ok(())
    }

    /// Remove an album (remotely, when it exists there) or stop caching a
    /// user. A non-empty album always fails synchronously.
    pub fn rmdir(&self, locator: &Locator) -> CacheResult<()> {
        match locator.kind() {
            Kind::User => {
                self.store.remove(locator);
                Ok(())
            }
            Kind::Album => {
                if !self.owns(locator) {
                    return Err(CacheError::AccessDenied);
                }
                let element = self.store.get(locator).ok_or(CacheError::NotFound)?;
                if element.contents().is_some_and(|c| !c.is_empty()) {
                    return Err(CacheError::failed("album is not empty"));
                }
                match element.remote_entry() {
                    Some(entry @ RemoteEntry::Album(_)) => {
                        if !self.reconciler.is_online() {
                            return Err(CacheError::NoNetworkConnection);
                        }
                        match self.remote.delete(&entry) {
                            Ok(true) => {}
                            Ok(false) => {
                                return Err(CacheError::failed("remote delete was rejected"))
                            }
                            Err(e) => return Err(self.reconciler.classify_remote(e)),
                        }
                    }
                    _ if element.local_changes => {
                        self.queues.local.remove(locator);
                    }
                    _ => return Err(CacheError::failed("cached album has no remote handle")),
                }
                self.store.remove(locator);
                self.reconciler.please_update(&locator.parent());
                Ok(())
            }
            _ => Err(CacheError::NotSupported),
        }
    }

    /// Extended attributes: a debug dump of the cache element, the
    /// capability token of unlisted albums, and the remote entry's fields.
    pub fn get_xattr(&self, locator: &Locator, name: &str) -> CacheResult<String> {
        let element = self.store.get(locator).ok_or(CacheError::NotFound)?;
        if name == "CacheElement" {
            return Ok(element.describe());
        }
        if locator.is_control() {
            return Err(CacheError::NotFound);
        }
        if name == "AuthKey" && locator.kind() == Kind::Album {
            return Ok(element.auth_key().to_string());
        }
        let entry = element
            .remote_entry()
            .ok_or_else(|| CacheError::unexpected("stored entry no longer reconstructs"))?;
        entry.attr(name).ok_or(CacheError::NotFound)
    }

    pub fn list_xattr(&self, locator: &Locator) -> CacheResult<Vec<String>> {
        let element = self.store.get(locator).ok_or(CacheError::NotFound)?;
        let mut names = vec!["CacheElement".to_string()];
        if locator.is_control() {
            return Ok(names);
        }
        let entry = element
            .remote_entry()
            .ok_or_else(|| CacheError::unexpected("stored entry no longer reconstructs"))?;
        names.extend(entry.attr_names().iter().map(|n| n.to_string()));
        if locator.kind() == Kind::Album {
            names.push("AuthKey".to_string());
        }
        Ok(names)
    }
}

/// Byte-range slice of in-memory text content, FUSE read semantics
fn slice_text(data: &str, offset: u64, size: u32) -> Vec<u8> {
    let bytes = data.as_bytes();
    let start = offset.min(bytes.len() as u64) as usize;
    let end = (start + size as usize).min(bytes.len());
    bytes[start..end].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::PassthroughMedia;
    use crate::remote::fake::FakeRemote;
    use crate::remote::Access;

    struct Rig {
        _tmp: tempfile::TempDir,
        store: Arc<CacheStore>,
        queues: Arc<Queues>,
        remote: Arc<FakeRemote>,
        reconciler: Arc<Reconciler>,
        fs: AlbumFs,
    }

    fn rig() -> Rig {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(CacheStore::new(tmp.path()).unwrap());
        store.put(&Locator::root(), {
            let mut root = CacheElement::directory("");
            root.world_readable = true;
            root
        });
        control::install(&store);
        let queues = Arc::new(Queues::new());
        let observer = Arc::new(Observer::new(100));
        let remote = FakeRemote::new("alice");
        let media: Arc<dyn MediaProcessor> = Arc::new(PassthroughMedia);
        let reconciler = Reconciler::new(
            store.clone(),
            queues.clone(),
            remote.clone(),
            media.clone(),
            observer.clone(),
            600,
            0,
            None,
        );
        assert!(reconciler.go_online());
        let scheduler = Scheduler::new(
            store.clone(),
            queues.clone(),
            reconciler.clone(),
            observer.clone(),
            300,
        );
        let fs = AlbumFs::new(
            store.clone(),
            queues.clone(),
            reconciler.clone(),
            scheduler,
            observer,
            remote.clone(),
            media,
            0,
        );
        Rig {
            _tmp: tmp,
            store,
            queues,
            remote,
            reconciler,
            fs,
        }
    }

    fn loc(path: &str) -> Locator {
        Locator::parse(path).unwrap()
    }

    #[test]
    fn attributes_reconcile_uncached_users_synchronously() {
        let r = rig();
        r.remote.add_album("Trip", Access::Public, None);

        let attr = r.fs.attributes(&loc("/alice")).unwrap();
        assert!(attr.directory);
        assert!(attr.writeable);
        assert!(r.store.exists(&loc("/alice/Trip")));

        assert_eq!(
            r.fs.attributes(&loc("/nobody/Trip/a.jpg")).unwrap_err(),
            CacheError::NotFound
        );
    }

    #[test]
    fn attributes_skip_dot_directory_probes() {
        let r = rig();
        r.remote.add_album("Trip", Access::Public, None);
        r.fs.attributes(&loc("/alice")).unwrap();
        let calls = r.remote.remote_calls();
        assert_eq!(
            r.fs.attributes(&loc("/alice/.directory")).unwrap_err(),
            CacheError::NotFound
        );
        assert_eq!(r.remote.remote_calls(), calls);
    }

    #[test]
    fn attributes_report_backing_file_size() {
        let r = rig();
        let album = r.remote.add_album("Trip", Access::Public, None);
        r.remote.add_photo(&album.id, "a.jpg", b"0123456789");
        r.reconciler.reconcile(&loc("/alice/Trip"), false).unwrap();
        r.reconciler
            .update_image(&loc("/alice/Trip/a.jpg"))
            .unwrap();

        let attr = r.fs.attributes(&loc("/alice/Trip/a.jpg")).unwrap();
        assert!(!attr.directory);
        assert_eq!(attr.size, 10);
    }

    #[test]
    fn list_serves_cached_content_and_queues_refresh() {
        let r = rig();
        r.remote.add_album("Trip", Access::Public, None);
        r.reconciler.update_user(&loc("/alice")).unwrap();
        let mut user = r.store.get(&loc("/alice")).unwrap();
        user.last_updated = 1; // stale but cached
        r.store.put(&loc("/alice"), user);
        r.queues.pull.clear();

        let names = r.fs.list(&loc("/alice")).unwrap();
        assert!(names.contains("Trip"));
        assert_eq!(r.queues.pull.len(), 1);

        let ctl = r.fs.list(&control::dir_path()).unwrap();
        assert!(ctl.contains("help"));
        // files are not listable, unknown users do not resolve
        assert_eq!(
            r.fs.list(&loc("/.control/log")).unwrap_err(),
            CacheError::NotSupported
        );
        assert_eq!(r.fs.list(&loc("/bob")).unwrap_err(), CacheError::NotFound);
    }

    #[test]
    fn read_generated_control_files() {
        let r = rig();
        let help = r.fs.read(&control::help_path(), 0, 65536).unwrap();
        assert_eq!(help, control::HELP_TEXT.as_bytes());

        let stats = r.fs.read(&control::stats_path(), 0, 65536).unwrap();
        let text = String::from_utf8(stats).unwrap();
        assert!(text.contains("User: alice"));
        assert!(text.contains("Network connection: online"));

        // offsets slice into the rendered text
        let tail = r.fs.read(&control::help_path(), 9, 4).unwrap();
        assert_eq!(tail, &control::HELP_TEXT.as_bytes()[9..13]);
    }

    #[test]
    fn read_serves_downloaded_content() {
        let r = rig();
        let album = r.remote.add_album("Trip", Access::Public, None);
        r.remote.add_photo(&album.id, "a.jpg", b"pixels here");
        r.reconciler.reconcile(&loc("/alice/Trip"), false).unwrap();
        r.reconciler
            .update_image(&loc("/alice/Trip/a.jpg"))
            .unwrap();

        let img = loc("/alice/Trip/a.jpg");
        r.fs.open(&img, false).unwrap();
        assert_eq!(r.fs.read(&img, 0, 6).unwrap(), b"pixels");
        assert_eq!(r.fs.read(&img, 7, 64).unwrap(), b"here");
        r.fs.close(&img).unwrap();
    }

    #[test]
    fn read_missing_backing_yields_placeholder_and_priority_pull() {
        let r = rig();
        let album = r.remote.add_album("Trip", Access::Public, None);
        r.remote.add_photo(&album.id, "a.jpg", b"bytes");
        // metadata is cached, content never downloaded
        r.reconciler.reconcile(&loc("/alice/Trip"), false).unwrap();
        r.queues.pull.clear();

        let img = loc("/alice/Trip/a.jpg");
        let out = r.fs.read(&img, 0, 4096).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Error opening"), "placeholder text: {text}");
        assert!(
            r.queues.priority.len() <= 1,
            "download got scheduled at most once"
        );
        r.fs
            .scheduler
            .shutdown();
    }

    #[test]
    fn write_marks_dirty_and_midwrite() {
        let r = rig();
        let album = r.remote.add_album("Trip", Access::Public, None);
        r.reconciler.reconcile(&loc("/alice/Trip"), false).unwrap();
        let img = loc("/alice/Trip/new.jpg");
        r.fs.create(&img).unwrap();

        let written = r.fs.write(&img, b"fresh pixels", 0).unwrap();
        assert_eq!(written, 12);
        let e = r.store.get(&img).unwrap();
        assert!(e.local_changes);
        assert!(!e.finalized);
        let _ = album;
    }

    #[test]
    fn truncate_shrinks_backing_and_marks_dirty() {
        let r = rig();
        r.remote.add_album("Trip", Access::Public, None);
        r.reconciler.reconcile(&loc("/alice/Trip"), false).unwrap();
        let img = loc("/alice/Trip/new.jpg");
        r.fs.create(&img).unwrap();
        r.fs.write(&img, b"0123456789", 0).unwrap();

        r.fs.truncate(&img, 4).unwrap();
        let e = r.store.get(&img).unwrap();
        assert_eq!(e.size, 4);
        assert!(e.local_changes);
        assert!(!e.finalized);
        assert_eq!(
            std::fs::metadata(r.store.backing_abs("alice/Trip/new.jpg"))
                .unwrap()
                .len(),
            4
        );
        assert_eq!(
            r.fs.truncate(&control::log_path(), 0).unwrap_err(),
            CacheError::AccessDenied
        );
    }

    #[test]
    fn generated_files_reject_writes() {
        let r = rig();
        assert_eq!(
            r.fs.write(&control::log_path(), b"x", 0).unwrap_err(),
            CacheError::AccessDenied
        );
        assert_eq!(
            r.fs.open(&control::log_path(), true).unwrap_err(),
            CacheError::Unimplemented
        );
    }

    #[test]
    fn close_of_last_opener_finalizes_and_queues_upload() {
        let r = rig();
        r.remote.add_album("Trip", Access::Public, None);
        r.reconciler.reconcile(&loc("/alice/Trip"), false).unwrap();
        let img = loc("/alice/Trip/new.jpg");
        r.fs.create(&img).unwrap();

        r.fs.open(&img, true).unwrap();
        r.fs.open(&img, false).unwrap();
        r.fs.write(&img, b"data", 0).unwrap();

        r.fs.close(&img).unwrap();
        // one opener remains: nothing finalized yet
        assert!(!r.store.get(&img).unwrap().finalized);
        assert!(r.queues.local.is_empty());

        r.fs.close(&img).unwrap();
        let e = r.store.get(&img).unwrap();
        assert!(e.finalized);
        assert_eq!(e.last_updated, 0);
        assert_eq!(e.size, 4);
        assert_eq!(r.queues.local.len(), 1);
    }

    #[test]
    fn offline_write_close_sync_round_trip() {
        // the offline fallback: edits made while offline are queued, never
        // lost, and pushed by sync() once connectivity returns
        let r = rig();
        r.remote.add_album("Trip", Access::Public, None);
        r.reconciler.reconcile(&loc("/alice/Trip"), false).unwrap();

        r.remote.set_online(false);
        r.reconciler.go_offline();
        let uploads_before = r.remote.uploads.load(Ordering::SeqCst);

        let img = loc("/alice/Trip/offline.jpg");
        r.fs.create(&img).unwrap();
        r.fs.open(&img, true).unwrap();
        r.fs.write(&img, b"offline pixels", 0).unwrap();
        r.fs.close(&img).unwrap();

        let e = r.store.get(&img).unwrap();
        assert!(e.local_changes);
        assert_eq!(r.remote.uploads.load(Ordering::SeqCst), uploads_before);
        assert_eq!(r.queues.local.len(), 1);

        r.remote.set_online(true);
        assert!(r.reconciler.go_online());
        r.reconciler.sync();
        assert!(r.queues.local.is_empty());
        assert!(!r.store.get(&img).unwrap().local_changes);
        assert!(r.remote.uploads.load(Ordering::SeqCst) > uploads_before);
    }

    #[test]
    fn create_validates_ownership_and_preconditions() {
        let r = rig();
        r.remote.add_album("Trip", Access::Public, None);
        r.reconciler.reconcile(&loc("/alice/Trip"), false).unwrap();

        assert_eq!(
            r.fs.create(&loc("/bob/Trip/a.jpg")).unwrap_err(),
            CacheError::AccessDenied
        );
        assert!(matches!(
            r.fs.create(&loc("/alice/Nowhere/a.jpg")).unwrap_err(),
            CacheError::OperationFailed(_)
        ));
        assert!(matches!(
            r.fs.create(&loc("/alice/Trip/.directory.lock")).unwrap_err(),
            CacheError::OperationFailed(_)
        ));

        r.fs.create(&loc("/alice/Trip/a.jpg")).unwrap();
        assert!(matches!(
            r.fs.create(&loc("/alice/Trip/a.jpg")).unwrap_err(),
            CacheError::OperationFailed(_)
        ));
        assert!(r
            .store
            .backing_abs("alice/Trip/a.jpg")
            .exists());
        assert!(r
            .store
            .get(&loc("/alice/Trip"))
            .unwrap()
            .contents()
            .unwrap()
            .contains("a.jpg"));
    }

    #[test]
    fn create_on_control_actions_triggers_engine() {
        let r = rig();
        assert!(r.reconciler.is_online());
        assert_eq!(
            r.fs.create(&control::offline_path()).unwrap_err(),
            CacheError::Unimplemented
        );
        assert!(!r.reconciler.is_online());
        assert_eq!(
            r.fs.create(&control::online_path()).unwrap_err(),
            CacheError::Unimplemented
        );
        assert!(r.reconciler.is_online());
    }

    #[test]
    fn mkdir_creates_albums_only() {
        let r = rig();
        r.fs.mkdir(&loc("/alice/Fresh")).unwrap();
        assert!(r.store.exists(&loc("/alice/Fresh")));

        assert_eq!(
            r.fs.mkdir(&loc("/bob/Theirs")).unwrap_err(),
            CacheError::AccessDenied
        );
        assert_eq!(
            r.fs.mkdir(&loc("/bob")).unwrap_err(),
            CacheError::Unimplemented
        );
        assert_eq!(
            r.fs.mkdir(&loc("/alice/Fresh/deep.jpg")).unwrap_err(),
            CacheError::NotSupported
        );
    }

    #[test]
    fn unlink_deletes_photo_remotely() {
        let r = rig();
        let album = r.remote.add_album("Trip", Access::Public, None);
        r.remote.add_photo(&album.id, "a.jpg", b"bytes");
        r.reconciler.reconcile(&loc("/alice/Trip"), false).unwrap();

        r.fs.unlink(&loc("/alice/Trip/a.jpg")).unwrap();
        assert!(!r.store.exists(&loc("/alice/Trip/a.jpg")));
        assert!(r.remote.photo_titles(&album.id).is_empty());
        assert!(!r
            .store
            .get(&loc("/alice/Trip"))
            .unwrap()
            .contents()
            .unwrap()
            .contains("a.jpg"));
    }

    #[test]
    fn unlink_refuses_foreign_and_offline() {
        let r = rig();
        let album = r.remote.add_album("Trip", Access::Public, None);
        r.remote.add_photo(&album.id, "a.jpg", b"bytes");
        r.reconciler.reconcile(&loc("/alice/Trip"), false).unwrap();

        assert_eq!(
            r.fs.unlink(&loc("/bob/Trip/a.jpg")).unwrap_err(),
            CacheError::AccessDenied
        );
        assert_eq!(
            r.fs.unlink(&loc("/alice/Trip")).unwrap_err(),
            CacheError::NotSupported
        );

        r.reconciler.go_offline();
        assert_eq!(
            r.fs.unlink(&loc("/alice/Trip/a.jpg")).unwrap_err(),
            CacheError::NoNetworkConnection
        );
        assert!(r.store.exists(&loc("/alice/Trip/a.jpg")));
    }

    #[test]
    fn unlink_on_control_files_clears_state() {
        let r = rig();
        r.fs.reconciler.local_change(&loc("/alice/Trip"));
        r.queues.pull.push(loc("/alice"));
        r.fs.observer.record("something happened");

        r.fs.unlink(&control::update_queue_path()).unwrap();
        assert!(r.queues.pull.is_empty());
        r.fs.unlink(&control::local_changes_queue_path()).unwrap();
        assert!(r.queues.local.is_empty());
        r.fs.unlink(&control::log_path()).unwrap();
        // the clear itself is logged afresh, the old line is gone
        assert!(!r.fs.observer.render().contains("something happened"));
        assert_eq!(
            r.fs.unlink(&control::help_path()).unwrap_err(),
            CacheError::NotSupported
        );
    }

    #[test]
    fn rmdir_album_requires_empty_then_deletes_remotely() {
        let r = rig();
        let album = r.remote.add_album("Trip", Access::Public, None);
        r.remote.add_photo(&album.id, "a.jpg", b"bytes");
        r.reconciler.reconcile(&loc("/alice/Trip"), false).unwrap();

        assert!(matches!(
            r.fs.rmdir(&loc("/alice/Trip")).unwrap_err(),
            CacheError::OperationFailed(_)
        ));

        r.fs.unlink(&loc("/alice/Trip/a.jpg")).unwrap();
        r.fs.rmdir(&loc("/alice/Trip")).unwrap();
        assert!(!r.store.exists(&loc("/alice/Trip")));
        assert!(!r
            .store
            .get(&loc("/alice"))
            .unwrap()
            .contents()
            .unwrap()
            .contains("Trip"));
        assert!(r.remote.fetch_album_list("alice").unwrap().is_empty());
    }

    #[test]
    fn rmdir_user_stops_caching_locally() {
        let r = rig();
        r.remote.add_album("Trip", Access::Public, None);
        r.reconciler.update_user(&loc("/alice")).unwrap();
        let calls = r.remote.remote_calls();

        r.fs.rmdir(&loc("/alice")).unwrap();
        assert!(!r.store.exists(&loc("/alice")));
        assert!(!r.store.exists(&loc("/alice/Trip")));
        // purely local: no remote traffic
        assert_eq!(r.remote.remote_calls(), calls);

        assert_eq!(
            r.fs.rmdir(&control::dir_path()).unwrap_err(),
            CacheError::NotSupported
        );
    }

    #[test]
    fn xattrs_expose_element_and_entry() {
        let r = rig();
        r.remote
            .add_album("Hidden", Access::Unlisted, Some("Gv1ABC"));
        r.reconciler
            .update_album(&loc("/alice/Hidden?authkey=Gv1ABC"))
            .unwrap();
        let album = loc("/alice/Hidden");

        let dump = r.fs.get_xattr(&album, "CacheElement").unwrap();
        assert!(dump.contains("Type: Directory"));
        assert_eq!(r.fs.get_xattr(&album, "AuthKey").unwrap(), "Gv1ABC");
        assert_eq!(r.fs.get_xattr(&album, "Title").unwrap(), "Hidden");
        assert_eq!(
            r.fs.get_xattr(&album, "Bogus").unwrap_err(),
            CacheError::NotFound
        );

        let names = r.fs.list_xattr(&album).unwrap();
        assert!(names.contains(&"CacheElement".to_string()));
        assert!(names.contains(&"AuthKey".to_string()));

        // control files only expose the element dump
        assert_eq!(
            r.fs.list_xattr(&control::log_path()).unwrap(),
            vec!["CacheElement".to_string()]
        );
    }
}
