//! albumfs daemon - caching and synchronization engine
//!
//! Exposes a remote photo-album service as a POSIX filesystem. The pieces:
//!
//! - [`store::CacheStore`] - the authoritative locator→element map and its
//!   on-disk snapshot/backing layout
//! - [`reconcile::Reconciler`] - pull/push algorithms keeping cache
//!   elements consistent with the remote service
//! - [`queue`]/[`worker`] - the three work queues and the two background
//!   worker loops draining them
//! - [`fs::AlbumFs`] - the synchronous operation facade the FUSE shim
//!   calls into
//! - [`remote::RemoteService`] / [`media::MediaProcessor`] - the seams
//!   where the protocol client and the image post-processor plug in
//!
//! Filesystem calls are served from the cache wherever possible; misses
//! and staleness turn into queued work for the background workers, so the
//! kernel-facing surface stays non-blocking except where an authoritative
//! answer is unavoidable.

pub mod control;
pub mod element;
pub mod fs;
pub mod media;
pub mod observe;
pub mod queue;
pub mod reconcile;
pub mod remote;
pub mod store;
pub mod worker;

#[cfg(unix)]
pub mod fuse;

pub use element::{CacheElement, ElementKind};
pub use fs::{AlbumFs, Attributes};
pub use media::{MediaProcessor, PassthroughMedia};
pub use observe::Observer;
pub use queue::{Queues, WorkQueue};
pub use reconcile::Reconciler;
pub use remote::{AlbumEntry, PhotoEntry, RemoteEntry, RemoteError, RemoteService};
pub use store::CacheStore;
pub use worker::Scheduler;

#[cfg(unix)]
pub use fuse::AlbumFuse;
