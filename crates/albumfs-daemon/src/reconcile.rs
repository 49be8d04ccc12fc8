//! Reconciliation engine
//!
//! Keeps cache elements consistent with their remote counterparts, in
//! either direction. Pulls refresh users, albums and images from the
//! service; pushes upload local changes. Two rules hold everywhere:
//! unpushed local changes are never overwritten by a pull (push-before-pull
//! ordering), and no remote call is ever made while a lock is held — the
//! store hands out copies, mutations are committed afterwards.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use albumfs_core::{CacheError, CacheResult, Kind, Locator};

use crate::control;
use crate::element::CacheElement;
use crate::media::MediaProcessor;
use crate::observe::Observer;
use crate::queue::Queues;
use crate::remote::{Access, RemoteEntry, RemoteError, RemoteService};
use crate::store::CacheStore;

pub struct Reconciler {
    store: Arc<CacheStore>,
    queues: Arc<Queues>,
    remote: Arc<dyn RemoteService>,
    media: Arc<dyn MediaProcessor>,
    observer: Arc<Observer>,
    online: AtomicBool,
    /// Staleness window in seconds
    update_interval: u64,
    /// Pixel budget applied before uploads (0 = leave images alone)
    max_pixels: u64,
    password: Option<String>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<CacheStore>,
        queues: Arc<Queues>,
        remote: Arc<dyn RemoteService>,
        media: Arc<dyn MediaProcessor>,
        observer: Arc<Observer>,
        update_interval: u64,
        max_pixels: u64,
        password: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            queues,
            remote,
            media,
            observer,
            online: AtomicBool::new(false),
            update_interval,
            max_pixels,
            password,
        })
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn go_offline(&self) {
        self.observer.record("suspending network operations");
        self.online.store(false, Ordering::SeqCst);
    }

    /// Re-probe connectivity and re-authenticate before flipping the flag.
    /// A rejected login leaves the engine online for anonymous browsing.
    pub fn go_online(&self) -> bool {
        self.observer.record("trying to resume network operations");
        let mut online = self.remote.check_connectivity();
        if !online {
            self.observer.record("network seems to be down");
        } else if let Some(password) = &self.password {
            match self.remote.login(password) {
                Ok(true) => {}
                Ok(false) => self.observer.record("remote service rejected the login"),
                Err(e) => {
                    self.observer.record("could not log in to the remote service");
                    if e == RemoteError::NoNetwork {
                        online = false;
                    }
                }
            }
        }
        self.online.store(online, Ordering::SeqCst);
        if online {
            self.queues.pull_wake.notify();
            self.queues.priority_wake.notify();
        }
        online
    }

    /// Classify a remote failure into the engine taxonomy; network-down
    /// flips the process-wide offline flag so later calls short-circuit.
    pub fn classify_remote(&self, e: RemoteError) -> CacheError {
        match e {
            RemoteError::NoNetwork => {
                self.go_offline();
                CacheError::NoNetworkConnection
            }
            RemoteError::AuthFailed => CacheError::AccessDenied,
            RemoteError::NotFound => CacheError::NotFound,
            RemoteError::Rejected(msg) => CacheError::OperationFailed(msg),
        }
    }

    /// Request a background (non-priority) refresh. Fresh entries are
    /// gated out here already so the queue stays short; control files skip
    /// the gate since their content is always live.
    pub fn please_update(&self, locator: &Locator) {
        if !locator.has_user() {
            return;
        }
        if !locator.is_control() {
            if let Some(e) = self.store.get(locator) {
                if e.last_updated > 0
                    && Self::now().saturating_sub(e.last_updated) < self.update_interval
                {
                    return;
                }
            }
        }
        if self.is_online() && self.queues.pull.push(locator.clone()) {
            self.queues.pull_wake.notify();
        }
    }

    /// Record an unpushed local mutation for the push worker
    pub fn local_change(&self, locator: &Locator) {
        self.queues.local.push(locator.clone());
        if self.is_online() {
            self.queues.pull_wake.notify();
        }
    }

    /// Reconcile one locator with the remote service. `priority` bypasses
    /// the staleness gate.
    pub fn reconcile(&self, locator: &Locator, priority: bool) -> CacheResult<()> {
        if !locator.has_user() {
            return Ok(());
        }
        if locator.is_control() {
            self.refresh_control(locator);
            return Ok(());
        }
        if !self.is_online() {
            return Err(CacheError::NoNetworkConnection);
        }
        if let Some(element) = self.store.get(locator) {
            if !priority
                && element.last_updated > 0
                && Self::now().saturating_sub(element.last_updated) < self.update_interval
            {
                debug!("not updating {locator}: still within the staleness window");
                return Ok(());
            }
            match locator.kind() {
                Kind::Image => self.update_image(locator),
                Kind::Album => self.update_album(locator),
                Kind::User => self.update_user(locator),
                _ => Ok(()),
            }
        } else {
            match locator.kind() {
                Kind::Image => {
                    self.reconcile(&locator.parent(), false)?;
                    self.update_image(locator)
                }
                Kind::Album => {
                    self.reconcile(&locator.parent(), false)?;
                    self.update_album(locator)
                }
                Kind::User => self.update_user(locator),
                _ => Ok(()),
            }
        }
    }

    /// Regenerate the content of a virtual control file
    pub fn refresh_control(&self, locator: &Locator) {
        let content = if *locator == control::stats_path() {
            Some(control::render_stats(
                &self.store,
                &self.queues,
                &self.observer,
                self.is_online(),
                &self.remote.current_user(),
            ))
        } else if *locator == control::log_path() {
            Some(self.observer.render())
        } else if *locator == control::update_queue_path() {
            Some(self.queues.pull.render())
        } else if *locator == control::priority_queue_path() {
            Some(self.queues.priority.render())
        } else if *locator == control::local_changes_queue_path() {
            Some(self.queues.local.render())
        } else if *locator == control::auth_keys_path() {
            Some(control::render_auth_keys(&self.store))
        } else {
            None
        };
        if let Some(content) = content {
            if let Some(mut element) = self.store.get(locator) {
                element.size = content.len() as u64;
                element.set_backing(content);
                self.store.put(locator, element);
            }
        }
    }

    /// Pull a user's album list and make the cached user directory mirror
    /// it. Unlisted albums (invisible to enumeration) and albums with
    /// unpushed local changes survive; everything else not listed remotely
    /// is dropped. A user the service does not know is removed outright —
    /// users are never created locally, so there is nothing to preserve.
    pub fn update_user(&self, locator: &Locator) -> CacheResult<()> {
        let Some(user) = locator.user().map(str::to_string) else {
            return Err(CacheError::NotFound);
        };
        if !self.is_online() {
            return Err(CacheError::NoNetworkConnection);
        }
        let albums = match self.remote.fetch_album_list(&user) {
            Ok(albums) => albums,
            Err(RemoteError::NotFound) => {
                warn!("user {user} is not a valid account; dropping it from the cache");
                self.store.remove(locator);
                return Err(CacheError::NotFound);
            }
            Err(e) => return Err(self.classify_remote(e)),
        };
        self.observer.counters.pulls.fetch_add(1, Ordering::Relaxed);

        if let Some(mut root) = self.store.get(&Locator::root()) {
            if let Some(contents) = root.contents_mut() {
                contents.insert(user.clone());
            }
            self.store.put(&Locator::root(), root);
        }

        let mut expected: BTreeSet<String> = albums.iter().map(|a| a.title.clone()).collect();
        let existing = self.store.get(locator);
        if let Some(element) = &existing {
            for child in element.contents().cloned().unwrap_or_default() {
                if expected.contains(&child) {
                    continue;
                }
                let child_loc = locator.join(&child);
                let Some(cached) = self.store.get(&child_loc) else {
                    continue;
                };
                let unlisted = matches!(
                    cached.remote_entry(),
                    Some(RemoteEntry::Album(a)) if a.access == Access::Unlisted
                );
                if unlisted || cached.local_changes {
                    // invisible to enumeration, or deletion deferred until pushed
                    expected.insert(child);
                } else {
                    if !cached.entry.is_empty() && cached.remote_entry().is_none() {
                        warn!("cache element {child_loc} could not be reconstructed");
                    }
                    self.store.remove(&child_loc);
                }
            }
        }

        let mut user_elem =
            existing.unwrap_or_else(|| CacheElement::directory(&user));
        if let Some(contents) = user_elem.contents_mut() {
            *contents = expected;
        }
        user_elem.world_readable = true;
        user_elem.writeable = user == self.remote.current_user();
        user_elem.last_updated = Self::now();
        self.store.put(locator, user_elem);

        for album in &albums {
            let album_loc = locator.join(&album.title);
            match self.store.get(&album_loc) {
                Some(mut element) => {
                    if element.local_changes {
                        continue;
                    }
                    // keep the existing staleness stamp so a just-synced
                    // album is not forced straight back through a pull
                    let stamp = element.last_updated;
                    element.apply_album(album);
                    element.last_updated = stamp;
                    self.store.put(&album_loc, element);
                }
                None => {
                    let mut element = CacheElement::directory(&album.title);
                    element.apply_album(album);
                    self.store.put(&album_loc, element);
                }
            }
        }
        Ok(())
    }

    /// Pull one album and reconcile its photo set. An uncached
    /// `?authkey=`-suffixed name is resolved remotely as a possibly
    /// unlisted album and inserted under its real title first.
    pub fn update_album(&self, locator: &Locator) -> CacheResult<()> {
        let Some(mut element) = self.store.get(locator) else {
            if let Some(auth_key) = locator.auth_key() {
                let title = locator.album_title().unwrap_or_default().to_string();
                let user = locator.user().unwrap_or_default().to_string();
                if !self.is_online() {
                    return Err(CacheError::NoNetworkConnection);
                }
                let album = self
                    .remote
                    .fetch_album_by_name(&title, &user, auth_key)
                    .map_err(|e| self.classify_remote(e))?;
                if album.access != Access::Unlisted {
                    warn!("album {} is not unlisted", album.title);
                }
                let real = locator.parent().join(&album.title);
                let mut resolved = CacheElement::directory(&album.title);
                resolved.apply_album(&album);
                self.store.put(&real, resolved);
                if let Some(mut parent) = self.store.get(&locator.parent()) {
                    if let Some(contents) = parent.contents_mut() {
                        contents.insert(album.title.clone());
                    }
                    self.store.put(&locator.parent(), parent);
                }
                return self.update_album(&real);
            }
            return Err(CacheError::NotFound);
        };

        // never overwrite unpushed edits with a pull
        if element.local_changes {
            return self.push_album(locator);
        }

        let Some(mut entry) = element.remote_entry() else {
            self.observer.record(format!(
                "album {locator} could not be reconstructed from its stored entry; dropping it"
            ));
            self.store.remove(locator);
            return Err(CacheError::unexpected("album entry no longer reconstructs"));
        };
        if entry.as_album().is_none() {
            self.observer
                .record(format!("cached directory {locator} is not an album; dropping it"));
            self.store.remove(locator);
            return Err(CacheError::unexpected("cached directory is not an album"));
        }
        if !self.is_online() {
            return Err(CacheError::NoNetworkConnection);
        }
        match self.remote.pull(&mut entry) {
            Ok(true) => {}
            Ok(false) => {
                self.observer.record(format!(
                    "album {locator} is gone on the remote side; moving it to lost+found"
                ));
                let _ = self.store.lost_and_found(locator);
                return Err(CacheError::NotFound);
            }
            Err(e) => return Err(self.classify_remote(e)),
        }
        self.observer.counters.pulls.fetch_add(1, Ordering::Relaxed);

        let album = entry.as_album().expect("pulled an album").clone();
        element.apply_album(&album);

        // best-effort rename: the folder follows the remote title; a title
        // colliding with a sibling collapses onto it, a title containing a
        // path separator produces an unreachable child
        let mut target = locator.clone();
        if locator.album() != Some(album.title.as_str()) {
            target = locator.parent().join(&album.title);
            self.store.rekey(locator, &target);
        }

        let photos = self
            .remote
            .fetch_photos(&album)
            .map_err(|e| self.classify_remote(e))?;
        let remote_titles: BTreeSet<String> = photos.iter().map(|p| p.title.clone()).collect();

        // drop cached photos the service no longer lists, unless they
        // carry unpushed local changes
        for child in element.contents().cloned().unwrap_or_default() {
            if remote_titles.contains(&child) {
                continue;
            }
            let child_loc = target.join(&child);
            match self.store.get(&child_loc) {
                Some(cached) if cached.local_changes => {}
                _ => {
                    self.store.remove(&child_loc);
                    if let Some(contents) = element.contents_mut() {
                        contents.remove(&child);
                    }
                }
            }
        }

        for photo in &photos {
            let photo_loc = target.join(&photo.title);
            let known = element
                .contents()
                .map(|c| c.contains(&photo.title))
                .unwrap_or(false);
            if !known {
                let mut file = CacheElement::file(&photo.title);
                file.apply_photo(photo);
                file.set_backing(photo_loc.backing_rel_path());
                if let Some(contents) = element.contents_mut() {
                    contents.insert(photo.title.clone());
                }
                self.store.put(&photo_loc, file);
                // content download is deferred to the pull queue
                self.please_update(&photo_loc);
            } else if let Some(mut cached) = self.store.get(&photo_loc) {
                if !cached.local_changes {
                    cached.apply_photo(photo);
                    self.store.put(&photo_loc, cached);
                }
            }
        }

        element.last_updated = Self::now();
        self.store.put(&target, element);
        Ok(())
    }

    /// Pull one image's metadata and, when the content version tag moved,
    /// its bytes.
    pub fn update_image(&self, locator: &Locator) -> CacheResult<()> {
        let Some(mut element) = self.store.get(locator) else {
            return Err(CacheError::NotFound);
        };
        if element.local_changes {
            // push-pending; the local-change queue owns this one
            self.local_change(locator);
            return Ok(());
        }
        let Some(mut entry) = element.remote_entry() else {
            self.observer.record(format!(
                "photo {locator} could not be reconstructed from its stored entry"
            ));
            return Err(CacheError::unexpected("photo entry no longer reconstructs"));
        };
        if entry.as_photo().is_none() {
            return Err(CacheError::unexpected("cached file is not a photo"));
        }
        if !self.is_online() {
            return Err(CacheError::NoNetworkConnection);
        }
        match self.remote.pull(&mut entry) {
            Ok(true) => {}
            Ok(false) => {
                self.observer.record(format!(
                    "photo {locator} is gone on the remote side; moving it to lost+found"
                ));
                let _ = self.store.lost_and_found(locator);
                return Err(CacheError::NotFound);
            }
            Err(e) => return Err(self.classify_remote(e)),
        }
        self.observer.counters.pulls.fetch_add(1, Ordering::Relaxed);

        let photo = entry.as_photo().expect("pulled a photo").clone();
        if element.remote_version != photo.version {
            let dest = self.store.backing_abs(element.backing());
            self.observer
                .record(format!("downloading {} to {}", photo.content_url, element.backing()));
            // lands directly on the backing path; a concurrent reader can
            // observe a partial file until the download finishes
            self.remote
                .download(&photo, &dest)
                .map_err(|e| self.classify_remote(e))?;
            element.remote_version = photo.version.clone();
            self.observer
                .counters
                .downloads
                .fetch_add(1, Ordering::Relaxed);
            self.observer
                .record(format!("downloaded {}", photo.content_url));
        }
        element.apply_photo(&photo);

        let mut target = locator.clone();
        if locator.image() != Some(photo.title.as_str()) {
            target = locator.parent().join(&photo.title);
            self.store.rekey(locator, &target);
        }
        element.last_updated = Self::now();
        self.store.put(&target, element);
        Ok(())
    }

    /// Push one pending local change (dispatched by kind)
    pub fn push_change(&self, locator: &Locator) -> CacheResult<()> {
        let Some(element) = self.store.get(locator) else {
            return Err(CacheError::NotFound);
        };
        if !element.local_changes {
            return Ok(());
        }
        if !self.is_online() {
            return Err(CacheError::NoNetworkConnection);
        }
        match locator.kind() {
            Kind::Image => self.push_image(locator),
            Kind::Album => self.update_album(locator),
            _ => Ok(()),
        }
    }

    /// Push a modified (or not yet created) album
    pub fn push_album(&self, locator: &Locator) -> CacheResult<()> {
        let Some(mut element) = self.store.get(locator) else {
            return Err(CacheError::NotFound);
        };
        if !element.local_changes {
            return Ok(());
        }
        let Some(mut entry) = element.remote_entry() else {
            self.observer.record(format!(
                "album {locator} could not be reconstructed from its stored entry; dropping it"
            ));
            self.store.remove(locator);
            return Err(CacheError::unexpected("album entry no longer reconstructs"));
        };
        if !self.is_online() {
            return Err(CacheError::NoNetworkConnection);
        }
        match self.remote.push(&mut entry) {
            Ok(true) => {}
            Ok(false) => {
                return Err(CacheError::failed(format!(
                    "remote service rejected album {locator}"
                )))
            }
            Err(e) => {
                self.observer
                    .record(format!("error pushing album {locator}"));
                return Err(self.classify_remote(e));
            }
        }
        self.observer.counters.pushes.fetch_add(1, Ordering::Relaxed);
        let album = entry.as_album().cloned().ok_or_else(|| {
            CacheError::unexpected("pushed album came back as something else")
        })?;
        element.apply_album(&album);
        self.store.put(locator, element);
        Ok(())
    }

    /// Create a new album locally and try to push it right away; any
    /// failure parks the locator on the local-change queue instead of
    /// losing the change.
    pub fn new_album(&self, locator: &Locator) -> CacheResult<()> {
        let title = locator.album_title().unwrap_or_default().to_string();
        let album = self.remote.draft_album(&title);

        let parent = locator.parent();
        if self.store.get(&parent).is_none() {
            // materialize the user directory on demand
            let mut user = CacheElement::directory(parent.user().unwrap_or_default());
            user.world_readable = true;
            user.writeable = true;
            self.store.put(&parent, user);
            if let Some(mut root) = self.store.get(&Locator::root()) {
                if let Some(contents) = root.contents_mut() {
                    contents.insert(parent.user().unwrap_or_default().to_string());
                }
                self.store.put(&Locator::root(), root);
            }
        }

        let mut element = CacheElement::directory(&title);
        element.apply_album(&album);
        element.local_changes = true;
        element.last_updated = 0;
        self.store.put(locator, element);
        if let Some(mut parent_elem) = self.store.get(&parent) {
            if let Some(contents) = parent_elem.contents_mut() {
                contents.insert(title.clone());
            }
            self.store.put(&parent, parent_elem);
        }

        if self.is_online() {
            if let Err(e) = self.reconcile(locator, true) {
                self.observer.record(format!(
                    "could not create album {locator} on the remote service: {e}"
                ));
                self.local_change(locator);
            }
        } else {
            self.local_change(locator);
        }
        Ok(())
    }

    /// Push a photo: upload a brand-new one (with media processing and
    /// caption extraction) or re-upload changed content of an existing
    /// one. Files still being written are left alone.
    pub fn push_image(&self, locator: &Locator) -> CacheResult<()> {
        let Some(mut element) = self.store.get(locator) else {
            warn!("image {locator} not present in cache");
            return Err(CacheError::NotFound);
        };
        if !element.local_changes || !element.finalized {
            return Ok(());
        }
        let abs = self.store.backing_abs(element.backing());
        if self.max_pixels > 0 {
            self.media.resize_to_pixel_budget(&abs, self.max_pixels)?;
        }
        let caption = self
            .media
            .extract_embedded_caption(&abs)
            .unwrap_or_default();

        match element.remote_entry() {
            Some(RemoteEntry::Photo(mut photo)) => {
                if !self.is_online() {
                    return Err(CacheError::NoNetworkConnection);
                }
                match self.remote.upload_content(&mut photo, &abs) {
                    Ok(true) => {}
                    Ok(false) => {
                        self.observer
                            .record(format!("failed uploading {locator} to the remote service"));
                        return Err(CacheError::failed("remote service rejected the upload"));
                    }
                    Err(e) => return Err(self.classify_remote(e)),
                }
                self.observer.counters.uploads.fetch_add(1, Ordering::Relaxed);
                self.observer.record(format!("uploaded {locator}"));
                element.local_changes = false;
                // we just uploaded these exact bytes
                element.remote_version = photo.version.clone();
                if !caption.is_empty() && photo.summary != caption {
                    photo.summary = caption;
                    let mut pushed = RemoteEntry::Photo(photo.clone());
                    match self.remote.push(&mut pushed) {
                        Ok(true) => {
                            if let RemoteEntry::Photo(p) = pushed {
                                photo = p;
                            }
                        }
                        _ => {
                            // retried on the next push round
                            element.local_changes = true;
                            self.observer
                                .record(format!("failed updating the caption on {locator}"));
                        }
                    }
                }
                element.size = photo.size;
                element.set_remote_entry(&RemoteEntry::Photo(photo));
                self.store.put(locator, element);
                Ok(())
            }
            _ => {
                let Some(parent) = self.store.get(&locator.parent()) else {
                    self.observer.record(format!(
                        "parent of photo {locator} is not cached; cannot upload"
                    ));
                    return Err(CacheError::failed("parent album not cached"));
                };
                let Some(RemoteEntry::Album(album)) = parent.remote_entry() else {
                    self.observer.record(format!(
                        "parent of photo {locator} is not an album or no longer reconstructs"
                    ));
                    return Err(CacheError::failed("parent album handle unavailable"));
                };
                if !self.is_online() {
                    return Err(CacheError::NoNetworkConnection);
                }
                let photo = match self.remote.upload(&album, &abs, &caption) {
                    Ok(p) => p,
                    Err(e) => {
                        self.observer.record(format!(
                            "failed uploading new photo {locator} to the remote service"
                        ));
                        return Err(self.classify_remote(e));
                    }
                };
                self.observer.counters.uploads.fetch_add(1, Ordering::Relaxed);
                self.observer.record(format!("uploaded {locator}"));
                element.apply_photo(&photo);
                element.remote_version = photo.version.clone();
                element.last_updated = Self::now();
                self.store.put(locator, element);
                // the album's photo list changed under it
                self.please_update(&locator.parent());
                Ok(())
            }
        }
    }

    /// Drain the whole local-change queue right now, re-queuing only
    /// entries that still fail.
    pub fn sync(&self) {
        let pending = self.queues.local.drain();
        let mut failed = Vec::new();
        for locator in pending {
            if let Err(e) = self.push_change(&locator) {
                self.observer
                    .record(format!("sync: pushing {locator} failed: {e}"));
                failed.push(locator);
            }
        }
        for locator in failed {
            self.queues.local.push(locator);
        }
    }
}
