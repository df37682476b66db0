//! Inode-table and pathname-dispatch core for building FUSE filesystems on
//! top of [`fuser`].
//!
//! A filesystem author implements [`PathnameFilesystem`] against plain
//! absolute paths and hands it to [`Router`] (or the [`request_loop::serve`]
//! / [`request_loop::spawn`] helpers), instead of implementing
//! `fuser::Filesystem` directly against raw kernel node ids. This crate
//! owns everything in between: the node-id table, the two-lock concurrency
//! model around path reconstruction, the directory-listing buffer, and the
//! "unlink while open" hidden-rename dance.

mod callbacks;
mod config;
mod context;
mod dir_buffer;
mod dispatcher;
mod error;
mod hidden_rename;
mod node_table;
mod request_loop;
mod tree;

pub use callbacks::{Attr, DirEntry, DirEntrySink, Entry, PathnameFilesystem, Statfs};
pub use config::Config;
pub use context::RequestInfo;
pub use dispatcher::Router;
pub use error::{clamp_errno, CoreError};
pub use node_table::{MAX_PATH_LEN, ROOT_ID};
pub use request_loop::{serve, spawn};
