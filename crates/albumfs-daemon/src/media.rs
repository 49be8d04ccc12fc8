//! Image post-processing boundary
//!
//! Uploads run through a [`MediaProcessor`] first: resize to the configured
//! pixel budget and pull the embedded caption out of the file. The actual
//! image codec lives outside this crate; [`PassthroughMedia`] is the
//! default when none is wired up.

use std::path::Path;

use albumfs_core::CacheResult;

pub trait MediaProcessor: Send + Sync {
    /// Shrink the image in place so it holds at most `max_pixels` pixels.
    /// A no-op when the image is already small enough.
    fn resize_to_pixel_budget(&self, path: &Path, max_pixels: u64) -> CacheResult<()>;

    /// Caption embedded in the image metadata, empty when there is none
    fn extract_embedded_caption(&self, path: &Path) -> CacheResult<String>;
}

/// Leaves files untouched and reports no captions
pub struct PassthroughMedia;

impl MediaProcessor for PassthroughMedia {
    fn resize_to_pixel_budget(&self, _path: &Path, _max_pixels: u64) -> CacheResult<()> {
        Ok(())
    }

    fn extract_embedded_caption(&self, _path: &Path) -> CacheResult<String> {
        Ok(String::new())
    }
}
