//! The request loop (§4.5): a thin wrapper over `fuser::mount2`/
//! `fuser::spawn_mount2`. Frame decoding, the INIT handshake, EINTR/ENOENT
//! retry against the device, and silent exit on ENODEV are all handled
//! inside `fuser` itself; this module only adds the pieces a long-running
//! daemon needs on top of that: an observable exited flag and a background
//! handle a caller can use to unmount from another thread.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fuser::{BackgroundSession, MountOption};

use crate::callbacks::PathnameFilesystem;
use crate::config::Config;
use crate::dispatcher::Router;

/// Blocks the calling thread serving requests until the filesystem is
/// unmounted, then returns. Mirrors `fuser::mount2`; the only addition is
/// flipping `exited` to `true` before returning, so a supervising thread
/// doesn't need to guess at `mount2`'s return to know the session ended.
pub fn serve<F: PathnameFilesystem>(
    fs: F,
    config: Config,
    mountpoint: impl AsRef<Path>,
    options: &[MountOption],
    exited: Arc<AtomicBool>,
) -> std::io::Result<()> {
    let router = Router::new(fs, config);
    let result = fuser::mount2(router, mountpoint, options);
    exited.store(true, Ordering::SeqCst);
    result
}

/// Mounts in the background and returns a handle that unmounts on drop, for
/// callers (tests, or a supervising process) that need the mount to run
/// alongside other work rather than occupying the calling thread.
pub fn spawn<F: PathnameFilesystem>(
    fs: F,
    config: Config,
    mountpoint: impl AsRef<Path>,
    options: &[MountOption],
) -> std::io::Result<BackgroundSession> {
    let router = Router::new(fs, config);
    fuser::spawn_mount2(router, mountpoint, options)
}
