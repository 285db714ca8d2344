//! duofs: a transactional, power-fail-safe embedded filesystem core.
//!
//! The core is layered; each layer uses only the one beneath it:
//!   + Buffer cache: pinned, LRU-replaced block buffers shared across
//!     volumes; the sole path by which metadata is read and dirtied.
//!   + Imap: the allocation bitmap, kept in both a committed and a working
//!     state, with two on-disk copies per node.
//!   + Volume: mount, transaction points, rollback; owner of the dual
//!     metaroots.
//!   + Inode and inode data: the per-file block tree (direct, indirect,
//!     double indirect), branched copy-on-write.
//!   + Directory entries and the dispatching [`Core`] API on top.
//!
//! Every mutation is copy-on-write against the committed state, and a
//! transaction point promotes the working state atomically: after a crash,
//! mounting yields exactly the last committed state — never a blend.
//!
//! The crate is `no_std`; all state lives in a [`Core`] value parameterized
//! by a caller-supplied [`BlockDev`].  Wrap it in [`SyncCore`] to serialize
//! multi-task access behind a single mutex.

#![cfg_attr(not(test), no_std)]

pub mod bdev;
mod buf;
pub mod config;
mod crc;
mod data;
mod dir;
pub mod error;
mod format;
mod fs;
mod imap;
mod inode;
mod layout;
mod volume;

pub use bdev::{BlockDev, Geometry, OpenMode};
pub use dir::DirName;
pub use error::{Error, Result};
pub use format::FormatOpts;
pub use fs::{Core, SyncCore};
pub use inode::InodeStat;
pub use layout::{mode, INODE_INVALID, INODE_ROOT};
pub use volume::{MountFlags, TransactMask, VolConfig, VolStat};
