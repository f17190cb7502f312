//! Error kinds shared by every crate in the disk-structure decoder.
//!
//! The shape mirrors a single top-level [`Error`] wrapping narrower,
//! component-scoped error enums (`IoError`, `FsError`) rather than one flat
//! enum, so that a caller matching on `Error::Io(_)` doesn't need to also
//! enumerate every file-system-level failure mode.

use std::fmt;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] IoError),
    #[error("fs: {0}")]
    Fs(#[from] FsError),
    #[error("cancelled")]
    Cancelled,
}

#[derive(thiserror::Error, Debug)]
pub enum IoError {
    #[error("truncated read at {offset:#018x}: expected {expected} bytes, got {actual}")]
    Truncated {
        offset: u64,
        expected: usize,
        actual: usize,
    },
    #[error("read-only")]
    ReadOnly,
    #[error(transparent)]
    Std(#[from] std::io::Error),
}

/// The on-disk component that raised an [`FsError`], used to render
/// diagnostics of the form `<component>@<offset in hex>` per the error
/// handling design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Mbr,
    Ext2,
    Fat32,
    Ntfs,
    Doc,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Component::Mbr => "mbr",
            Component::Ext2 => "ext2",
            Component::Fat32 => "fat32",
            Component::Ntfs => "ntfs",
            Component::Doc => "doc",
        })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("{component}: bad magic at {offset:#018x}")]
    BadMagic { component: Component, offset: u64 },
    #[error("{component}: invariant violated at {offset:#018x}: {detail}")]
    Invariant {
        component: Component,
        offset: u64,
        detail: String,
    },
    #[error("{component}: unsupported")]
    Unsupported { component: Component },
    #[error("index out of range")]
    Index,
}

pub type Result<T> = std::result::Result<T, Error>;
