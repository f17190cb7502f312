// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! File-system driver capability shared by the `ext2`, `fat` and `ntfs`
//! crates, plus the walker state and document-entry model those drivers
//! produce.
//!
//! The online `FileSystem` trait (`stat`/`read`/`write`) is replaced with
//! the offline, document-producing capability this workspace needs:
//! `probe`, `serialize_fs`, `walk_and_serialize_tree`, `cleanup`. Dispatch
//! across drivers stays a `match` over a tagged enum built by the
//! `pipeline` crate, rather than trait objects, since the set of drivers
//! is fixed at three.

use diskscribe_ds::DataStorage;
use diskscribe_doc::Writer;
use diskscribe_err::Result;
use std::collections::HashSet;

/// Tag identifying which driver produced a `fs` document record, used
/// only for that record's `kind` field and for diagnostics. Which driver
/// actually ran is decided by which `probe` succeeded, not by this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSystemKind {
    Ext2,
    Fat32,
    Ntfs,
    Unknown,
}

impl FileSystemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileSystemKind::Ext2 => "ext2",
            FileSystemKind::Fat32 => "fat32",
            FileSystemKind::Ntfs => "ntfs",
            FileSystemKind::Unknown => "unknown",
        }
    }
}

/// The capability every file-system driver implements. Generic over the
/// backing [`DataStorage`] so a driver can run against a real file-backed
/// image or an in-memory test fixture without trait-object indirection.
pub trait FsDriver<DS: DataStorage>: Sized {
    /// Reads a small, fixed prefix at `partition_offset` and validates its
    /// magic number. A [`diskscribe_err::FsError::BadMagic`] means "not
    /// this file system" and is expected to make the caller try the next
    /// driver; any other error is a hard I/O failure on the partition.
    ///
    /// Takes `storage` by value rather than by reference so the driver can
    /// hold onto it for the rest of its lifetime the way the fat driver's
    /// `FileSystemServer` does. Callers that need to retry a failed probe
    /// with a different driver pass `&storage` as `DS`: references are
    /// themselves a [`DataStorage`] (see the blanket impl in `diskscribe_ds`)
    /// and are cheap to copy, so nothing is consumed on a failed attempt.
    fn probe(storage: DS, partition_offset: u64) -> Result<Self>;

    /// Emits the top-level document record describing this file system:
    /// kind, partition index, block/cluster size, and any summary counts.
    fn serialize_fs(&self, partition_index: usize, writer: &mut Writer);

    /// Depth-first walk of the directory tree from the root, emitting one
    /// document record per file and directory encountered.
    fn walk_and_serialize_tree(&self, writer: &mut Writer, state: &mut WalkerState) -> Result<()>;

    /// Releases driver-owned resources. A no-op for drivers that own
    /// nothing beyond a superblock copy and the storage handle.
    fn cleanup(self) {}
}

/// Explicit walker state threaded through directory recursion: an
/// identifier counter, recursion depth against a configurable limit, and
/// the set of directory starting blocks already visited, so a corrupt
/// image with a cyclic directory tree terminates instead of looping.
pub struct WalkerState {
    next_id: u64,
    depth: u32,
    max_depth: u32,
    visited: HashSet<u64>,
    cancel: Option<Box<dyn Fn() -> bool>>,
}

impl WalkerState {
    pub const DEFAULT_MAX_DEPTH: u32 = 256;

    pub fn new(max_depth: u32) -> Self {
        Self {
            next_id: 0,
            depth: 0,
            max_depth,
            visited: HashSet::new(),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: impl Fn() -> bool + 'static) -> Self {
        self.cancel = Some(Box::new(cancel));
        self
    }

    /// Allocates the next identifier. The root directory is guaranteed to
    /// receive id 0 by being the first caller.
    pub fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Marks `start` (a directory's starting block or cluster) as visited
    /// and descends one level; returns `false` without descending if
    /// `start` was already visited or the depth limit is reached.
    pub fn enter_directory(&mut self, start: u64) -> bool {
        if self.depth >= self.max_depth {
            return false;
        }
        if !self.visited.insert(start) {
            return false;
        }
        self.depth += 1;
        true
    }

    pub fn exit_directory(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c())
    }
}

/// One file or directory encountered while walking a file system's tree,
/// ready to be handed to the document writer.
#[derive(Debug, Clone)]
pub struct Entry {
    pub id: u64,
    pub parent_id: u64,
    pub path: String,
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    /// Absolute sector numbers (partition offset already folded in)
    /// covering the file's data, in order.
    pub sectors: Vec<u64>,
}

impl Entry {
    pub fn serialize(&self, writer: &mut Writer) {
        writer.emit("id", self.id as i64);
        writer.emit("parent_id", self.parent_id as i64);
        writer.emit("path", self.path.as_str());
        writer.emit("name", self.name.as_str());
        writer.emit("is_dir", self.is_dir);
        writer.emit("size", self.size as i64);
        writer.emit("atime", self.atime as i64);
        writer.emit("mtime", self.mtime as i64);
        writer.emit("ctime", self.ctime as i64);
        writer.begin_array("sectors");
        for sector in &self.sectors {
            writer.emit("_", *sector as i64);
        }
        writer.end_array();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_gets_id_zero() {
        let mut state = WalkerState::new(WalkerState::DEFAULT_MAX_DEPTH);
        assert_eq!(state.next_id(), 0);
        assert_eq!(state.next_id(), 1);
    }

    #[test]
    fn revisiting_a_directory_start_is_rejected() {
        let mut state = WalkerState::new(WalkerState::DEFAULT_MAX_DEPTH);
        assert!(state.enter_directory(10));
        assert!(!state.enter_directory(10));
    }

    #[test]
    fn depth_limit_is_enforced() {
        let mut state = WalkerState::new(1);
        assert!(state.enter_directory(1));
        assert!(!state.enter_directory(2));
    }

    #[test]
    fn entry_serializes_without_panicking() {
        let entry = Entry {
            id: 1,
            parent_id: 0,
            path: "/boot".into(),
            name: "boot".into(),
            is_dir: true,
            size: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            sectors: vec![2048, 2056],
        };
        let mut writer = Writer::new();
        writer.begin_doc();
        entry.serialize(&mut writer);
        writer.end_doc();
        let mut out = Vec::new();
        writer.flush_to(&mut out).unwrap();
        assert!(!out.is_empty());
    }
}
