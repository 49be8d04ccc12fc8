//! Virtual control surface
//!
//! A fixed set of generated files under `/.control` exposes the engine to
//! shell tools: help text, the rolling log, live statistics, the auth-key
//! export and the three work queues rendered as path lists. Their content
//! regenerates synchronously on each read; `rm` on the log or a queue file
//! clears it instead of deleting anything.

use albumfs_core::{Locator, CONTROL_DIR};

use crate::element::CacheElement;
use crate::observe::Observer;
use crate::queue::Queues;
use crate::store::CacheStore;

pub const HELP: &str = "help";
pub const LOG: &str = "log";
pub const STATS: &str = "stats";
pub const AUTH_KEYS: &str = "auth_keys";
pub const UPDATE_QUEUE: &str = "update_queue";
pub const PRIORITY_QUEUE: &str = "priority_queue";
pub const LOCAL_CHANGES_QUEUE: &str = "local_changes_queue";
pub const SYNC: &str = "sync";
pub const OFFLINE: &str = "offline";
pub const ONLINE: &str = "online";

pub const HELP_TEXT: &str = "\
albumfs help

 The .control directory
   help                 ... this file
   log                  ... the rolling log
   stats                ... live statistics about the filesystem
   auth_keys            ... album name = authkey pairs (for backup purposes)
   update_queue         ... entries waiting to be refreshed
   priority_queue       ... entries refreshed with precedence (usually photos
                            an application tried to read before download)
   local_changes_queue  ... albums/photos with local changes waiting to be
                            pushed to the remote service

 How to achieve ...
   Q: How to cache some user's albums?
   A: mkdir their username in the base directory of the mounted filesystem

   Q: How to stop caching some user's albums?
   A: rmdir their username in the base directory of the mounted filesystem

   Q: How to cache an unlisted album of some user?
   A: cd 'album_name?authkey=KEY' in the user subdirectory, replacing KEY by
      the album's capability token (taken from the album link)

   Q: How to create a new album?
   A: Go to the directory corresponding to your username and mkdir 'Album name'
      (the filesystem must have been mounted with an account)

   Q: How to upload a photo to an album?
   A: Simply copy it into the respective directory

   Q: How to delete a photo/album?
   A: Simply rm/rmdir it

   Q: How to disable networking?
   A: touch .control/offline
      The filesystem then acts as a local cache and disallows some
      operations (deleting photos/albums)

   Q: How to enable networking?
   A: touch .control/online

   Q: How to push all pending local changes right now?
   A: touch .control/sync

   Advanced operations...

      rm .control/log             ... clears the log
      rm .control/update_queue    ... clears the update queue
      rm .control/priority_queue  ... clears the priority update queue
";

pub fn dir_path() -> Locator {
    Locator::from_components([CONTROL_DIR]).expect("control dir locator")
}

pub fn file_path(name: &str) -> Locator {
    Locator::from_components([CONTROL_DIR, name]).expect("control file locator")
}

pub fn help_path() -> Locator {
    file_path(HELP)
}

pub fn log_path() -> Locator {
    file_path(LOG)
}

pub fn stats_path() -> Locator {
    file_path(STATS)
}

pub fn auth_keys_path() -> Locator {
    file_path(AUTH_KEYS)
}

pub fn update_queue_path() -> Locator {
    file_path(UPDATE_QUEUE)
}

pub fn priority_queue_path() -> Locator {
    file_path(PRIORITY_QUEUE)
}

pub fn local_changes_queue_path() -> Locator {
    file_path(LOCAL_CHANGES_QUEUE)
}

pub fn sync_path() -> Locator {
    file_path(SYNC)
}

pub fn offline_path() -> Locator {
    file_path(OFFLINE)
}

pub fn online_path() -> Locator {
    file_path(ONLINE)
}

fn generated_file(name: &str, content: &str) -> CacheElement {
    let mut e = CacheElement::file(name);
    if let crate::element::ElementKind::File { generated, backing } = &mut e.kind {
        *generated = true;
        *backing = content.to_string();
    }
    e.size = content.len() as u64;
    e.world_readable = true;
    e
}

/// Insert the control directory and its files into the store. Idempotent;
/// called at startup after a snapshot restore as well, so new control
/// files appear on upgrades.
pub fn install(store: &CacheStore) {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    if !store.exists(&dir_path()) {
        let mut dir = CacheElement::directory(CONTROL_DIR);
        dir.world_readable = true;
        dir.last_updated = now;
        store.put(&dir_path(), dir);
    }
    if let Some(mut root) = store.get(&Locator::root()) {
        if let Some(contents) = root.contents_mut() {
            contents.insert(CONTROL_DIR.to_string());
        }
        store.put(&Locator::root(), root);
    }

    for name in [
        HELP,
        LOG,
        STATS,
        AUTH_KEYS,
        UPDATE_QUEUE,
        PRIORITY_QUEUE,
        LOCAL_CHANGES_QUEUE,
    ] {
        let content = if name == HELP { HELP_TEXT } else { "" };
        let mut file = generated_file(name, content);
        file.last_updated = now;
        store.put(&file_path(name), file);
        if let Some(mut dir) = store.get(&dir_path()) {
            if let Some(contents) = dir.contents_mut() {
                contents.insert(name.to_string());
            }
            store.put(&dir_path(), dir);
        }
    }
}

/// Live statistics rendering for `.control/stats`
pub fn render_stats(
    store: &CacheStore,
    queues: &Queues,
    observer: &Observer,
    online: bool,
    user: &str,
) -> String {
    let counters = observer.counters.snapshot();
    let mut out = String::new();
    out.push_str(&format!("User: {}\n", user));
    out.push_str(&format!("Cache elements: {}\n", store.len()));
    out.push_str(&format!("Update queue size: {}\n", queues.pull.len()));
    out.push_str(&format!("Priority queue size: {}\n", queues.priority.len()));
    out.push_str(&format!(
        "Local changes queue size: {}\n",
        queues.local.len()
    ));
    out.push_str(&format!(
        "Network connection: {}\n",
        if online { "online" } else { "offline" }
    ));
    out.push_str(&format!("Open file descriptors: {}\n", counters.open_files));
    out.push_str(&format!("Pulls: {}\n", counters.pulls));
    out.push_str(&format!("Pushes: {}\n", counters.pushes));
    out.push_str(&format!("Downloads: {}\n", counters.downloads));
    out.push_str(&format!("Uploads: {}\n", counters.uploads));
    out
}

/// `name = key` lines for every cached element carrying a capability token
pub fn render_auth_keys(store: &CacheStore) -> String {
    let mut out = String::new();
    for (name, key) in store.auth_keys() {
        out.push_str(&format!("{} = {}\n", name, key));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path()).unwrap();
        store.put(&Locator::root(), CacheElement::directory(""));
        install(&store);
        let first = store.len();
        install(&store);
        assert_eq!(store.len(), first);

        let help = store.get(&help_path()).unwrap();
        assert!(help.is_generated());
        assert_eq!(help.backing(), HELP_TEXT);
        assert_eq!(help.size, HELP_TEXT.len() as u64);

        let ctl = store.get(&dir_path()).unwrap();
        assert!(ctl.contents().unwrap().contains(LOG));
        assert!(ctl.contents().unwrap().contains(STATS));

        let root = store.get(&Locator::root()).unwrap();
        assert!(root.contents().unwrap().contains(CONTROL_DIR));
    }

    #[test]
    fn stats_render_mentions_connection_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path()).unwrap();
        let queues = Queues::new();
        let observer = Observer::new(10);
        let text = render_stats(&store, &queues, &observer, false, "alice");
        assert!(text.contains("Network connection: offline"));
        assert!(text.contains("User: alice"));
    }
}
