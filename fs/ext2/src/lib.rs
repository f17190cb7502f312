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

//! ext2 superblock, block-group descriptor table and directory-tree driver.
//!
//! The on-disk layout below follows the classic (non-journaled) ext2
//! revision: a 1024-byte superblock at a fixed offset, a block-group
//! descriptor table immediately following it, and 128-byte inodes reached
//! through direct, singly, doubly and triply indirect block pointers.

use bitflags::bitflags;
use diskscribe_ds::DataStorage;
use diskscribe_doc::Writer;
use diskscribe_err::{Component, Error, FsError, Result};
use diskscribe_fs::{Entry, FileSystemKind, FsDriver, WalkerState};
use log::warn;
use std::mem::size_of;
use zerocopy::{little_endian::U16, little_endian::U32, FromBytes, Immutable, IntoBytes, KnownLayout};

const SUPERBLOCK_OFFSET: u64 = 1024;
const EXT2_MAGIC: u16 = 0xef53;
const BLOCK_GROUP_DESCRIPTOR_SIZE: usize = 32;
const ROOT_INODE: u32 = 2;

const S_IFMT: u16 = 0xf000;
const S_IFDIR: u16 = 0x4000;
const S_IFLNK: u16 = 0xa000;

const DIRECT_BLOCK_COUNT: usize = 12;

bitflags! {
    /// Incompatible features: a driver that doesn't understand one of
    /// these cannot safely read the file system at all. This decoder logs
    /// and continues rather than refusing outright, since the worst
    /// outcome of misreading an incompatible layout is a truncated or
    /// malformed walk, not data corruption — there is nothing to write.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IncompatFeatures: u32 {
        const COMPRESSION = 0x0001;
        const FILETYPE = 0x0002;
        const RECOVER = 0x0004;
        const JOURNAL_DEV = 0x0008;
        const META_BG = 0x0010;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RoCompatFeatures: u32 {
        const SPARSE_SUPER = 0x0001;
        const LARGE_FILE = 0x0002;
        const BTREE_DIR = 0x0004;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct RawSuperblock {
    inodes_count: U32,
    blocks_count: U32,
    r_blocks_count: U32,
    free_blocks_count: U32,
    free_inodes_count: U32,
    first_data_block: U32,
    log_block_size: U32,
    log_frag_size: U32,
    blocks_per_group: U32,
    frags_per_group: U32,
    inodes_per_group: U32,
    mtime: U32,
    wtime: U32,
    mnt_count: U16,
    max_mnt_count: U16,
    magic: U16,
    state: U16,
    errors: U16,
    minor_rev_level: U16,
    lastcheck: U32,
    checkinterval: U32,
    creator_os: U32,
    rev_level: U32,
    def_resuid: U16,
    def_resgid: U16,
    first_ino: U32,
    inode_size: U16,
    block_group_nr: U16,
    feature_compat: U32,
    feature_incompat: U32,
    feature_ro_compat: U32,
    uuid: [u8; 16],
    volume_name: [u8; 16],
    last_mounted: [u8; 64],
    algo_bitmap: U32,
    prealloc_blocks: u8,
    prealloc_dir_blocks: u8,
    _padding: U16,
    journal_uuid: [u8; 16],
    journal_inum: U32,
    journal_dev: U32,
    last_orphan: U32,
    _reserved: [u8; 788],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct RawBlockGroupDescriptor {
    block_bitmap: U32,
    inode_bitmap: U32,
    inode_table: U32,
    free_blocks_count: U16,
    free_inodes_count: U16,
    used_dirs_count: U16,
    _padding: U16,
    _reserved: [u8; 12],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct RawInode {
    mode: U16,
    uid: U16,
    size_lo: U32,
    atime: U32,
    ctime: U32,
    mtime: U32,
    dtime: U32,
    gid: U16,
    links_count: U16,
    blocks: U32,
    flags: U32,
    _osd1: U32,
    block: [U32; 15],
    generation: U32,
    file_acl: U32,
    size_hi: U32,
    faddr: U32,
    _osd2: [u8; 12],
}

#[derive(Debug, Clone, Copy)]
struct Superblock {
    block_size: u32,
    inodes_per_group: u32,
    blocks_per_group: u32,
    blocks_count: u32,
    inodes_count: u32,
    inode_size: u16,
    feature_incompat: IncompatFeatures,
    feature_ro_compat: RoCompatFeatures,
}

impl Superblock {
    fn block_group_count(&self) -> u32 {
        self.blocks_count.div_ceil(self.blocks_per_group)
    }

    fn uses_64_bit_size(&self) -> bool {
        self.feature_ro_compat.contains(RoCompatFeatures::LARGE_FILE)
    }
}

/// Driver over a single ext2 partition, positioned at `partition_offset`
/// bytes from the start of the backing image.
pub struct FileSystemServer<DS: DataStorage> {
    storage: DS,
    partition_offset: u64,
    superblock: Superblock,
}

fn read_at<DS: DataStorage, T: FromBytes + IntoBytes + Immutable + KnownLayout>(
    storage: &DS,
    offset: u64,
) -> Result<T> {
    let mut bytes = vec![0u8; size_of::<T>()];
    storage.read(offset, &mut bytes)?;
    T::read_from_bytes(&bytes).map_err(|_| {
        Error::Fs(FsError::Invariant {
            component: Component::Ext2,
            offset,
            detail: "short read while decoding fixed-size record".into(),
        })
    })
}

impl<DS: DataStorage> FsDriver<DS> for FileSystemServer<DS> {
    fn probe(storage: DS, partition_offset: u64) -> Result<Self> {
        let raw: RawSuperblock = read_at(&storage, partition_offset + SUPERBLOCK_OFFSET)?;
        if raw.magic.get() != EXT2_MAGIC {
            return Err(Error::Fs(FsError::BadMagic {
                component: Component::Ext2,
                offset: partition_offset + SUPERBLOCK_OFFSET,
            }));
        }

        let invariant = |detail: String| {
            Error::Fs(FsError::Invariant {
                component: Component::Ext2,
                offset: partition_offset + SUPERBLOCK_OFFSET,
                detail,
            })
        };

        let log_block_size = raw.log_block_size.get();
        let block_size = 1024u32
            .checked_shl(log_block_size)
            .filter(|bs| (1024..=65536).contains(bs) && bs.is_power_of_two())
            .ok_or_else(|| {
                invariant(format!(
                    "block size derived from log_block_size={log_block_size} is not a power of two in [1024, 65536]"
                ))
            })?;

        let blocks_per_group = raw.blocks_per_group.get();
        if blocks_per_group == 0 {
            return Err(invariant("blocks_per_group is zero".into()));
        }
        let inodes_per_group = raw.inodes_per_group.get();
        if inodes_per_group == 0 {
            return Err(invariant("inodes_per_group is zero".into()));
        }

        let feature_incompat = IncompatFeatures::from_bits_retain(raw.feature_incompat.get());
        let feature_ro_compat = RoCompatFeatures::from_bits_retain(raw.feature_ro_compat.get());
        let unknown_incompat = feature_incompat.bits() & !IncompatFeatures::all().bits();
        if unknown_incompat != 0 {
            warn!(
                "ext2: superblock at {:#018x} declares unrecognized incompatible features {:#x}; walk may be incomplete",
                partition_offset, unknown_incompat
            );
        }

        let superblock = Superblock {
            block_size,
            inodes_per_group,
            blocks_per_group,
            blocks_count: raw.blocks_count.get(),
            inodes_count: raw.inodes_count.get(),
            inode_size: if raw.inode_size.get() == 0 {
                128
            } else {
                raw.inode_size.get()
            },
            feature_incompat,
            feature_ro_compat,
        };

        Ok(Self {
            storage,
            partition_offset,
            superblock,
        })
    }

    fn serialize_fs(&self, partition_index: usize, writer: &mut Writer) {
        writer.begin_doc_at("fs");
        writer.emit("kind", FileSystemKind::Ext2.as_str());
        writer.emit("partition_index", partition_index as i32);
        writer.emit("block_size", self.superblock.block_size as i32);
        writer.emit("blocks_count", self.superblock.blocks_count as i64);
        writer.emit("inodes_count", self.superblock.inodes_count as i64);
        writer.emit(
            "block_group_count",
            self.superblock.block_group_count() as i32,
        );
        writer.emit("uses_64_bit_size", self.superblock.uses_64_bit_size());
        writer.end_doc();
    }

    fn walk_and_serialize_tree(&self, writer: &mut Writer, state: &mut WalkerState) -> Result<()> {
        self.walk_inode(writer, state, ROOT_INODE, 0, "", "/")
    }

    fn cleanup(self) {}
}

impl<DS: DataStorage> FileSystemServer<DS> {
    fn block_group_descriptor(&self, group: u32) -> Result<RawBlockGroupDescriptor> {
        let table_offset = self.partition_offset
            + (SUPERBLOCK_OFFSET / self.superblock.block_size as u64 + 1)
                * self.superblock.block_size as u64;
        let offset = table_offset + group as u64 * BLOCK_GROUP_DESCRIPTOR_SIZE as u64;
        read_at(&self.storage, offset)
    }

    fn inode(&self, inode_number: u32) -> Result<RawInode> {
        if inode_number == 0 {
            return Err(Error::Fs(FsError::Invariant {
                component: Component::Ext2,
                offset: 0,
                detail: "inode 0 does not exist".into(),
            }));
        }
        let group = (inode_number - 1) / self.superblock.inodes_per_group;
        let index_in_group = (inode_number - 1) % self.superblock.inodes_per_group;
        let descriptor = self.block_group_descriptor(group)?;
        let table_offset = self.block_byte_offset(descriptor.inode_table.get() as u64);
        let offset = table_offset + index_in_group as u64 * self.superblock.inode_size as u64;
        read_at(&self.storage, offset)
    }

    fn block_byte_offset(&self, block: u64) -> u64 {
        self.partition_offset + block * self.superblock.block_size as u64
    }

    fn inode_size(&self, inode: &RawInode) -> u64 {
        let lo = inode.size_lo.get() as u64;
        if self.superblock.uses_64_bit_size() {
            lo | ((inode.size_hi.get() as u64) << 32)
        } else {
            lo
        }
    }

    /// Resolves the logical blocks backing an inode's data, in order, up to
    /// the number of blocks implied by its size. Indirect blocks are read
    /// lazily, one at a time, as the iterator is driven.
    fn data_blocks(&self, inode: &RawInode) -> Result<Vec<u64>> {
        let block_size = self.superblock.block_size as u64;
        let needed = self.inode_size(inode).div_ceil(block_size.max(1)) as usize;
        let mut blocks = Vec::with_capacity(needed.min(4096));

        for &direct in inode.block.iter().take(DIRECT_BLOCK_COUNT) {
            if blocks.len() >= needed {
                return Ok(blocks);
            }
            if direct.get() == 0 {
                continue;
            }
            blocks.push(direct.get() as u64);
        }

        let pointers_per_block = (block_size / 4) as usize;
        let singly = inode.block[12].get() as u64;
        if blocks.len() < needed && singly != 0 {
            self.read_indirect(singly, 1, pointers_per_block, needed, &mut blocks)?;
        }
        let doubly = inode.block[13].get() as u64;
        if blocks.len() < needed && doubly != 0 {
            self.read_indirect(doubly, 2, pointers_per_block, needed, &mut blocks)?;
        }
        let triply = inode.block[14].get() as u64;
        if blocks.len() < needed && triply != 0 {
            self.read_indirect(triply, 3, pointers_per_block, needed, &mut blocks)?;
        }
        Ok(blocks)
    }

    /// Reads the block pointer table at `block`, descending `depth` levels
    /// of indirection (1 = singly, 2 = doubly, 3 = triply), appending
    /// leaf data-block numbers to `out` until `needed` is reached.
    fn read_indirect(
        &self,
        block: u64,
        depth: u8,
        pointers_per_block: usize,
        needed: usize,
        out: &mut Vec<u64>,
    ) -> Result<()> {
        if out.len() >= needed {
            return Ok(());
        }
        let mut table = vec![0u8; pointers_per_block * 4];
        self.storage.read(self.block_byte_offset(block), &mut table)?;
        for chunk in table.chunks_exact(4) {
            if out.len() >= needed {
                return Ok(());
            }
            let pointer = u32::from_le_bytes(chunk.try_into().unwrap());
            if pointer == 0 {
                continue;
            }
            if depth == 1 {
                out.push(pointer as u64);
            } else {
                self.read_indirect(pointer as u64, depth - 1, pointers_per_block, needed, out)?;
            }
        }
        Ok(())
    }

    fn walk_inode(
        &self,
        writer: &mut Writer,
        state: &mut WalkerState,
        inode_number: u32,
        parent_id: u64,
        name: &str,
        path: &str,
    ) -> Result<()> {
        if state.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let inode = self.inode(inode_number)?;
        let is_dir = inode.mode.get() & S_IFMT == S_IFDIR;
        let is_symlink = inode.mode.get() & S_IFMT == S_IFLNK;
        let size = self.inode_size(&inode);
        let id = state.next_id();

        let blocks = self.data_blocks(&inode).unwrap_or_else(|err| {
            warn!("ext2: inode {inode_number} at {path:?}: {err}");
            Vec::new()
        });
        let sectors: Vec<u64> = blocks
            .iter()
            .map(|b| self.block_byte_offset(*b) / 512)
            .collect();

        let entry = Entry {
            id,
            parent_id,
            path: path.to_owned(),
            name: name.to_owned(),
            is_dir,
            size,
            atime: inode.atime.get() as u64,
            mtime: inode.mtime.get() as u64,
            ctime: inode.ctime.get() as u64,
            sectors,
        };
        // The caller has an "entries" array open; the key is ignored in
        // favor of an auto-assigned index (see `Writer::resolve_key`).
        writer.begin_doc_at("_");
        entry.serialize(writer);
        writer.end_doc();

        if !is_dir || is_symlink {
            return Ok(());
        }

        if !state.enter_directory(inode_number as u64) {
            return Ok(());
        }

        match self.read_directory(&inode) {
            Ok(children) => {
                for (child_inode, child_name) in children {
                    if child_name == "." || child_name == ".." {
                        continue;
                    }
                    let child_path = if path == "/" {
                        format!("/{child_name}")
                    } else {
                        format!("{path}/{child_name}")
                    };
                    if let Err(err) =
                        self.walk_inode(writer, state, child_inode, id, &child_name, &child_path)
                    {
                        warn!("ext2: failed to walk {child_path:?}: {err}");
                    }
                }
            }
            Err(err) => warn!("ext2: failed to read directory {path:?}: {err}"),
        }

        state.exit_directory();
        Ok(())
    }

    /// Parses every directory entry across an inode's data blocks. A
    /// directory entry whose `rec_len` or `name_len` would run past the
    /// end of its containing block is treated as corruption local to that
    /// block: parsing of the block stops there and moves on to the next.
    fn read_directory(&self, inode: &RawInode) -> Result<Vec<(u32, String)>> {
        let block_size = self.superblock.block_size as usize;
        let mut entries = Vec::new();

        for block in self.data_blocks(inode)? {
            let mut buffer = vec![0u8; block_size];
            self.storage.read(self.block_byte_offset(block), &mut buffer)?;

            let mut cursor = 0usize;
            while cursor + 8 <= block_size {
                let inode_number = u32::from_le_bytes(buffer[cursor..cursor + 4].try_into().unwrap());
                let rec_len = u16::from_le_bytes(buffer[cursor + 4..cursor + 6].try_into().unwrap()) as usize;
                let name_len = buffer[cursor + 6] as usize;

                if rec_len < 8 || cursor + rec_len > block_size || cursor + 8 + name_len > block_size {
                    warn!(
                        "ext2: directory entry at block {block} offset {cursor} violates rec_len invariant; skipping rest of block"
                    );
                    break;
                }

                if inode_number != 0 {
                    let name = String::from_utf8_lossy(&buffer[cursor + 8..cursor + 8 + name_len]).into_owned();
                    entries.push((inode_number, name));
                }

                cursor += rec_len;
            }
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diskscribe_ds::MemoryStorage;

    fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
        buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
        buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn minimal_image() -> Vec<u8> {
        let block_size = 1024u32;
        let mut image = vec![0u8; block_size as usize * 8];

        let sb = 1024usize;
        put_u32(&mut image, sb + 0, 16); // inodes_count
        put_u32(&mut image, sb + 4, 64); // blocks_count
        put_u32(&mut image, sb + 24, 0); // log_block_size -> 1024
        put_u32(&mut image, sb + 32, 64); // blocks_per_group
        put_u32(&mut image, sb + 40, 16); // inodes_per_group
        put_u16(&mut image, sb + 56, EXT2_MAGIC); // magic
        put_u16(&mut image, sb + 88, 128); // inode_size

        image
    }

    #[test]
    fn probe_rejects_bad_magic() {
        let image = vec![0u8; 4096];
        let storage = MemoryStorage(&image);
        assert!(FileSystemServer::probe(&storage, 0).is_err());
    }

    #[test]
    fn probe_accepts_valid_superblock() {
        let image = minimal_image();
        let storage = MemoryStorage(&image);
        let fs = FileSystemServer::probe(&storage, 0).unwrap();
        assert_eq!(fs.superblock.block_size, 1024);
        assert_eq!(fs.superblock.block_group_count(), 1);
    }

    #[test]
    fn probe_rejects_log_block_size_that_overflows_the_shift() {
        let mut image = minimal_image();
        put_u32(&mut image, 1024 + 24, 32); // log_block_size: 1024 << 32 overflows
        let storage = MemoryStorage(&image);
        assert!(FileSystemServer::probe(&storage, 0).is_err());
    }

    #[test]
    fn probe_rejects_log_block_size_past_the_valid_range() {
        let mut image = minimal_image();
        put_u32(&mut image, 1024 + 24, 7); // 1024 << 7 == 131072 > 65536
        let storage = MemoryStorage(&image);
        assert!(FileSystemServer::probe(&storage, 0).is_err());
    }

    #[test]
    fn probe_rejects_zero_blocks_per_group() {
        let mut image = minimal_image();
        put_u32(&mut image, 1024 + 32, 0);
        let storage = MemoryStorage(&image);
        assert!(FileSystemServer::probe(&storage, 0).is_err());
    }

    #[test]
    fn probe_rejects_zero_inodes_per_group() {
        let mut image = minimal_image();
        put_u32(&mut image, 1024 + 40, 0);
        let storage = MemoryStorage(&image);
        assert!(FileSystemServer::probe(&storage, 0).is_err());
    }

    /// Extends `minimal_image()` with a single block-group descriptor (its
    /// inode table at block 4, two blocks long for 16 128-byte inodes) so
    /// tests can plant an inode and drive `inode()`/`data_blocks()`/
    /// `read_directory()` directly.
    fn image_with_block_group() -> Vec<u8> {
        let mut image = minimal_image();
        image.resize(1024 * 16, 0);
        let bgdt = 2048;
        put_u32(&mut image, bgdt + 8, 4); // inode_table -> block 4
        image
    }

    fn inode_offset(inode_number: u32) -> usize {
        let index_in_group = (inode_number - 1) as usize % 16;
        4096 + index_in_group * 128
    }

    fn put_dir_entry(buf: &mut [u8], offset: usize, inode: u32, rec_len: u16, name: &str) {
        put_u32(buf, offset, inode);
        put_u16(buf, offset + 4, rec_len);
        buf[offset + 6] = name.len() as u8;
        buf[offset + 7] = 0;
        buf[offset + 8..offset + 8 + name.len()].copy_from_slice(name.as_bytes());
    }

    #[test]
    fn rec_len_entries_sum_to_exactly_one_block() {
        let mut image = image_with_block_group();
        let inode_off = inode_offset(11);
        put_u32(&mut image, inode_off + 4, 1024); // size_lo: one block
        put_u32(&mut image, inode_off + 40, 6); // block[0] -> data block 6

        let dir_block = 6 * 1024;
        put_dir_entry(&mut image, dir_block, 12, 12, "one");
        put_dir_entry(&mut image, dir_block + 12, 13, 12, "two");
        put_dir_entry(&mut image, dir_block + 24, 14, 1000, "three");

        let storage = MemoryStorage(&image);
        let fs = FileSystemServer::probe(&storage, 0).unwrap();
        let inode = fs.inode(11).unwrap();
        let entries = fs.read_directory(&inode).unwrap();
        assert_eq!(
            entries,
            vec![
                (12, "one".to_owned()),
                (13, "two".to_owned()),
                (14, "three".to_owned()),
            ]
        );
    }

    #[test]
    fn data_blocks_skips_holes_without_padding() {
        let mut image = image_with_block_group();
        let inode_off = inode_offset(11);
        put_u32(&mut image, inode_off + 4, 3 * 1024); // size_lo: three blocks
        put_u32(&mut image, inode_off + 40, 6); // block[0] -> 6
        put_u32(&mut image, inode_off + 44, 0); // block[1] -> hole
        put_u32(&mut image, inode_off + 48, 7); // block[2] -> 7

        let storage = MemoryStorage(&image);
        let fs = FileSystemServer::probe(&storage, 0).unwrap();
        let inode = fs.inode(11).unwrap();
        let blocks = fs.data_blocks(&inode).unwrap();
        assert_eq!(blocks, vec![6, 7]);
    }

    #[test]
    fn corrupt_rec_len_stops_the_block_without_erroring() {
        let mut image = image_with_block_group();
        let inode_off = inode_offset(11);
        put_u32(&mut image, inode_off + 4, 1024);
        put_u32(&mut image, inode_off + 40, 6);

        let dir_block = 6 * 1024;
        put_dir_entry(&mut image, dir_block, 20, 10, "ok");
        // rec_len pushes past the end of the block: corruption, not a hard error.
        put_dir_entry(&mut image, dir_block + 10, 21, 2000, "bad");

        let storage = MemoryStorage(&image);
        let fs = FileSystemServer::probe(&storage, 0).unwrap();
        let inode = fs.inode(11).unwrap();
        let entries = fs.read_directory(&inode).unwrap();
        assert_eq!(entries, vec![(20, "ok".to_owned())]);
    }
}
