//! Library-internal error type.
//!
//! This is distinct from the wire-level errno values (`libc::c_int`) that
//! dispatcher handlers hand back to the kernel. `CoreError` covers states
//! that are expected and recoverable within the node table / hidden-rename
//! machinery; see [`CoreError::into_errno`] for how each variant is clamped
//! onto the wire.

use thiserror::Error;

/// Errors produced by the node table, tree, and hidden-rename policy.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    /// The requested node, or a component of the path leading to it, is not
    /// bound in the table (already unlinked, or never existed).
    #[error("node not found")]
    NotFound,

    /// Path reconstruction would exceed the maximum path length.
    #[error("path too long")]
    NameTooLong,

    /// The hidden-rename policy exhausted its retry budget, or the user
    /// filesystem doesn't implement `rename`/`unlink`.
    #[error("resource busy")]
    Busy,

    /// Node table allocation failure (never returned by the in-memory
    /// `HashMap`-backed table today, kept as a variant because the wire
    /// protocol has a slot for it and a future bounded-capacity table would
    /// want to report it).
    #[error("out of memory")]
    NoMemory,
}

impl CoreError {
    /// Maps this error onto the negative-errno value the dispatcher writes
    /// back to the kernel.
    pub fn into_errno(self) -> libc::c_int {
        match self {
            CoreError::NotFound => libc::ENOENT,
            CoreError::NameTooLong => libc::ENAMETOOLONG,
            CoreError::Busy => libc::EBUSY,
            CoreError::NoMemory => libc::ENOMEM,
        }
    }
}

/// Clamps a value returned by a user callback onto the legal errno range
/// `fuser::Reply::error` expects: a positive errno (e.g. `libc::ENOENT`),
/// matching the convention the whole dispatcher and `PathnameFilesystem`
/// use (`fuser` negates it onto the wire itself). Values outside
/// `1..=4095` — zero, a negative number, or an absurdly large one — where
/// an error was expected indicate a broken callback rather than a
/// meaningful errno, and are replaced by `ERANGE`.
pub fn clamp_errno(raw: libc::c_int) -> libc::c_int {
    const MAX_ERRNO: libc::c_int = 4095;
    if raw > 0 && raw <= MAX_ERRNO {
        raw
    } else {
        libc::ERANGE
    }
}

/// Aborts the process. Used for invariants whose violation means the node
/// table has already been corrupted: the kernel handed us an identifier we
/// never issued, or issued one we've since lost track of. Continuing to
/// serve requests past that point would let the corruption spread into the
/// mounted filesystem, so this is not a recoverable error.
#[cold]
#[track_caller]
pub fn abort_corrupted(context: &str) -> ! {
    log::error!("node table invariant violated: {context}");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_passes_through_legal_errno() {
        assert_eq!(clamp_errno(libc::ENOENT), libc::ENOENT);
    }

    #[test]
    fn clamp_replaces_negative_values() {
        assert_eq!(clamp_errno(-libc::ENOENT), libc::ERANGE);
    }

    #[test]
    fn clamp_replaces_zero() {
        assert_eq!(clamp_errno(0), libc::ERANGE);
    }

    #[test]
    fn clamp_replaces_out_of_range_positive() {
        assert_eq!(clamp_errno(100_000), libc::ERANGE);
    }

    #[test]
    fn into_errno_maps_each_variant() {
        assert_eq!(CoreError::NotFound.into_errno(), libc::ENOENT);
        assert_eq!(CoreError::NameTooLong.into_errno(), libc::ENAMETOOLONG);
        assert_eq!(CoreError::Busy.into_errno(), libc::EBUSY);
        assert_eq!(CoreError::NoMemory.into_errno(), libc::ENOMEM);
    }
}
