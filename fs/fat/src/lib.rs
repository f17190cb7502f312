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

//! FAT32 boot-sector, cluster-chain and directory-tree driver.
//!
//! The boot-sector validation and [`ClusterChain`] cluster-following
//! iterator are carried over largely unchanged; what changes is what's
//! done with a directory's entries once decoded. The online server this
//! is adapted from filled a caller-supplied wire buffer one `stat()` call
//! at a time; this driver instead walks the whole tree up front and
//! writes one document record per entry, so names are built into owned
//! `String`s instead of packed backwards into a fixed byte buffer.

use std::mem::{size_of, MaybeUninit};

use diskscribe_ds::DataStorage;
use diskscribe_doc::Writer;
use diskscribe_err::{Component, Error, FsError, Result};
use diskscribe_fs::{Entry, FileSystemKind, FsDriver, WalkerState};
use log::{error, warn};
use zerocopy::{
    little_endian::{U16, U32},
    transmute_mut, FromBytes, IntoBytes, KnownLayout,
};

const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_LONG_NAME: u8 = 0x0F;
const LAST_LONG_ENTRY: u8 = 0x40;
const SIGNATURE_OFFSET: usize = 510;

pub struct FileSystemServer<DS: DataStorage> {
    storage: DS,
    partition_offset: u64,

    bytes_per_cluster_log2: u8,
    fat_offset: u64,
    cluster_heap_offset: u64,
    first_cluster_of_root_directory: u32,

    sectors_count: u32,
    bytes_per_sector: u32,
}

impl<DS: DataStorage> FsDriver<DS> for FileSystemServer<DS> {
    fn probe(storage: DS, partition_offset: u64) -> Result<Self> {
        // No file system can live at the MBR itself.
        if partition_offset == 0 {
            return Err(Error::Fs(FsError::BadMagic {
                component: Component::Fat32,
                offset: 0,
            }));
        }

        let mut boot_sector: BootSector = unsafe { MaybeUninit::uninit().assume_init() };
        storage.read(partition_offset, boot_sector.as_mut_bytes())?;

        if boot_sector.signature_word != [0x55, 0xAA] {
            return Err(Error::Fs(FsError::BadMagic {
                component: Component::Fat32,
                offset: partition_offset + SIGNATURE_OFFSET as u64,
            }));
        }
        // FAT32 sets BPB_RootEntCnt and BPB_FATSz16 to 0; volumes that don't
        // aren't the 32-bit variant this driver understands.
        if boot_sector.bpb_rootentcnt.get() != 0 || boot_sector.bpb_fatsz16.get() != 0 {
            return Err(Error::Fs(FsError::BadMagic {
                component: Component::Fat32,
                offset: partition_offset,
            }));
        }

        let inconsistent = |detail: &str| {
            Error::Fs(FsError::Invariant {
                component: Component::Fat32,
                offset: partition_offset,
                detail: detail.to_owned(),
            })
        };

        let bytes_per_sector = boot_sector.bpb_bytspersec.get() as u32;
        if !is_power_of_two(bytes_per_sector) {
            error!("fat32: bytes per sector ({bytes_per_sector}) is not a power of 2");
            return Err(inconsistent("bytes per sector not a power of 2"));
        }
        let bytes_per_sector_log2 = bytes_per_sector.ilog2() as u8;
        if !(9..=12).contains(&bytes_per_sector_log2) {
            return Err(inconsistent("bytes per sector out of range [512, 4096]"));
        }
        let sectors_per_cluster = boot_sector.bpb_secperclus as u32;
        if !is_power_of_two(sectors_per_cluster) {
            return Err(inconsistent("sectors per cluster not a power of 2"));
        }
        let sectors_per_cluster_log2 = sectors_per_cluster.ilog2() as u8;
        if sectors_per_cluster_log2 > 7 {
            return Err(inconsistent("sectors per cluster out of range [1, 128]"));
        }
        let bytes_per_cluster_log2 = bytes_per_sector_log2 + sectors_per_cluster_log2;

        let fat_offset = boot_sector.bpb_rsvdseccnt.get() as u32;
        let number_of_fats = boot_sector.bpb_numfats as u32;
        if number_of_fats != 1 && number_of_fats != 2 {
            return Err(inconsistent("number of FATs is neither 1 nor 2"));
        }
        let fat_length = boot_sector.bpb_fatsz32.get();

        let root_directory_offset = fat_offset + fat_length * number_of_fats;
        let cluster_heap_offset = root_directory_offset;
        let first_cluster_of_root_directory = boot_sector.bpb_rootclus.get();

        let sectors_count = if boot_sector.bpb_totsec16.get() != 0 {
            boot_sector.bpb_totsec16.get() as u32
        } else {
            boot_sector.bpb_totsec32.get()
        };

        Ok(Self {
            storage,
            partition_offset,
            bytes_per_cluster_log2,
            fat_offset: (fat_offset as u64) << bytes_per_sector_log2,
            cluster_heap_offset: (cluster_heap_offset as u64) << bytes_per_sector_log2,
            first_cluster_of_root_directory,
            sectors_count,
            bytes_per_sector,
        })
    }

    fn serialize_fs(&self, partition_index: usize, writer: &mut Writer) {
        writer.begin_doc_at("fs");
        writer.emit("kind", FileSystemKind::Fat32.as_str());
        writer.emit("partition_index", partition_index as i32);
        writer.emit("bytes_per_sector", self.bytes_per_sector as i32);
        writer.emit(
            "bytes_per_cluster",
            1i64 << self.bytes_per_cluster_log2 as i64,
        );
        writer.emit("sectors_count", self.sectors_count as i64);
        writer.end_doc();
    }

    fn walk_and_serialize_tree(&self, writer: &mut Writer, state: &mut WalkerState) -> Result<()> {
        let id = state.next_id();
        let entry = Entry {
            id,
            parent_id: 0,
            path: "/".to_owned(),
            name: String::new(),
            is_dir: true,
            size: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            sectors: self.cluster_chain_sectors(self.first_cluster_of_root_directory),
        };
        writer.begin_doc_at("_");
        entry.serialize(writer);
        writer.end_doc();

        if state.enter_directory(self.first_cluster_of_root_directory as u64) {
            self.walk_directory(
                writer,
                state,
                self.first_cluster_of_root_directory,
                id,
                "/",
            )?;
            state.exit_directory();
        }
        Ok(())
    }

    fn cleanup(self) {}
}

impl<DS: DataStorage> FileSystemServer<DS> {
    /// Absolute byte offset (partition offset folded in) of `cluster`'s
    /// first byte in the data area.
    fn cluster_byte_offset(&self, cluster: u32) -> u64 {
        self.partition_offset + self.cluster_heap_offset + ((cluster as u64 - 2) << self.bytes_per_cluster_log2)
    }

    fn cluster_chain_sectors(&self, first_cluster: u32) -> Vec<u64> {
        let clusters_per_sector_shift = self.bytes_per_cluster_log2;
        ClusterChain::new(self, first_cluster)
            .filter_map(|c| c.ok())
            .flat_map(|cluster| {
                let start = self.cluster_byte_offset(cluster) / 512;
                let sectors = 1u64 << clusters_per_sector_shift.saturating_sub(9);
                start..start + sectors.max(1)
            })
            .collect()
    }

    /// Walks one directory's entries, reconstructing long names where
    /// present, emitting one record per entry and recursing into
    /// subdirectories (other than `.`/`..`).
    fn walk_directory(
        &self,
        writer: &mut Writer,
        state: &mut WalkerState,
        first_cluster: u32,
        parent_id: u64,
        parent_path: &str,
    ) -> Result<()> {
        if state.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let bytes_per_cluster = 1u64 << self.bytes_per_cluster_log2;
        // Materialize the chain up front: a read failure following the FAT
        // is a hard I/O error (propagates and aborts this partition), which
        // is distinct from the chain legitimately ending on a sentinel.
        let mut clusters = Vec::new();
        for cluster in ClusterChain::new(self, first_cluster) {
            clusters.push(cluster?);
        }
        let mut offsets = clusters.into_iter().flat_map(|cluster| {
            let base = self.cluster_byte_offset(cluster);
            (base..base + bytes_per_cluster).step_by(size_of::<DirEntry>())
        });

        let mut pending_name_units: Vec<u16> = Vec::new();
        let mut children = Vec::new();

        while let Some(offset) = offsets.next() {
            let mut dir_entry: DirEntry = unsafe { MaybeUninit::uninit().assume_init() };
            self.storage.read(offset, dir_entry.as_mut_bytes())?;

            if dir_entry.dir_name[0] == 0x00 {
                break;
            }
            if dir_entry.dir_name[0] == 0xE5 {
                pending_name_units.clear();
                continue;
            }

            if dir_entry.dir_attr == ATTR_LONG_NAME {
                let ldir_entry: &mut LongNameDirEntry = transmute_mut!(&mut dir_entry);
                if ldir_entry.ldir_ord & LAST_LONG_ENTRY != 0 {
                    pending_name_units.clear();
                }
                let mut fragment: Vec<u16> = ldir_entry
                    .ldir_name1
                    .iter()
                    .chain(ldir_entry.ldir_name2.iter())
                    .chain(ldir_entry.ldir_name3.iter())
                    .map(|c| c.get())
                    .collect();
                fragment.extend(pending_name_units.drain(..));
                pending_name_units = fragment;
                continue;
            }

            let name = if !pending_name_units.is_empty() {
                let units: Vec<u16> = pending_name_units
                    .drain(..)
                    .take_while(|&c| c != 0x0000 && c != 0xFFFF)
                    .collect();
                String::from_utf16_lossy(&units)
            } else {
                short_name(&dir_entry.dir_name)
            };

            if name == "." || name == ".." {
                continue;
            }

            let first_cluster =
                (dir_entry.dir_fstcluslo.get() as u32) | ((dir_entry.dir_fstclushi.get() as u32) << 16);
            let is_dir = dir_entry.dir_attr & ATTR_DIRECTORY != 0;
            children.push((name, first_cluster, is_dir, dir_entry.dir_filesize.get()));
        }

        for (name, first_cluster, is_dir, file_size) in children {
            let child_path = if parent_path == "/" {
                format!("/{name}")
            } else {
                format!("{parent_path}/{name}")
            };
            let id = state.next_id();
            let entry = Entry {
                id,
                parent_id,
                path: child_path.clone(),
                name,
                is_dir,
                size: file_size as u64,
                atime: 0,
                mtime: 0,
                ctime: 0,
                sectors: self.cluster_chain_sectors(first_cluster),
            };
            writer.begin_doc_at("_");
            entry.serialize(writer);
            writer.end_doc();

            if is_dir && state.enter_directory(first_cluster as u64) {
                if let Err(err) = self.walk_directory(writer, state, first_cluster, id, &child_path) {
                    warn!("fat32: failed to walk {child_path:?}: {err}");
                }
                state.exit_directory();
            }
        }

        Ok(())
    }
}

fn short_name(dir_name: &[u8; 11]) -> String {
    let (name, ext) = dir_name.split_at(8);
    let name = trim_trailing_spaces(name);
    let ext = trim_trailing_spaces(ext);
    if ext.is_empty() {
        name
    } else {
        format!("{name}.{ext}")
    }
}

fn trim_trailing_spaces(bytes: &[u8]) -> String {
    let end = bytes.iter().rposition(|&c| c != 0x20).map(|i| i + 1).unwrap_or(0);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// A FAT32 table entry's 28 meaningful bits, classified per the sentinel
/// ranges a cluster chain can terminate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fat32Entry {
    Free,
    Reserved,
    InUse(u32),
    Bad,
    EndOfChain,
}

impl Fat32Entry {
    fn classify(raw: u32) -> Self {
        match raw & 0x0FFF_FFFF {
            0x0000000 => Fat32Entry::Free,
            0x0000001 => Fat32Entry::Reserved,
            0x0FFFFFF7 => Fat32Entry::Bad,
            v if v >= 0x0FFFFFF8 => Fat32Entry::EndOfChain,
            v => Fat32Entry::InUse(v),
        }
    }
}

struct ClusterChain<'fs, DS: DataStorage> {
    fs: &'fs FileSystemServer<DS>,
    entry: Fat32Entry,
    yielded_any: bool,
}

impl<'fs, DS: DataStorage> ClusterChain<'fs, DS> {
    fn new(fs: &'fs FileSystemServer<DS>, first_cluster: u32) -> Self {
        Self {
            fs,
            entry: Fat32Entry::classify(first_cluster),
            yielded_any: false,
        }
    }
}

impl<'fs, DS: DataStorage> Iterator for ClusterChain<'fs, DS> {
    type Item = Result<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        let cluster = match self.entry {
            Fat32Entry::InUse(cluster) => cluster,
            Fat32Entry::EndOfChain => return None,
            other => {
                if self.yielded_any {
                    warn!("fat32: cluster chain terminated mid-chain on {other:?} instead of an end-of-chain sentinel");
                }
                return None;
            }
        };

        let mut next_entry: U32 = unsafe { MaybeUninit::uninit().assume_init() };
        if let Err(error) = self.fs.storage.read(
            self.fs.fat_offset + self.fs.partition_offset + cluster as u64 * 4,
            next_entry.as_mut_bytes(),
        ) {
            return Some(Err(error));
        }
        self.entry = Fat32Entry::classify(next_entry.get());
        self.yielded_any = true;

        Some(Ok(cluster))
    }
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout)]
struct BootSector {
    bs_jmpboot: [u8; 3],
    bs_oemname: [u8; 8],

    bpb_bytspersec: U16,
    bpb_secperclus: u8,
    bpb_rsvdseccnt: U16,
    bpb_numfats: u8,
    bpb_rootentcnt: U16,
    bpb_totsec16: U16,
    bpb_media: u8,
    bpb_fatsz16: U16,

    bpb_secpertrk: U16,
    bpb_numheads: U16,
    bpb_hiddsec: U32,

    bpb_totsec32: U32,

    bpb_fatsz32: U32,
    bpb_extflags: U16,
    bpb_fsver: U16,
    bpb_rootclus: U32,
    bpb_fsinfo: U16,
    bpb_bkbootsec: U16,
    bpb_reserved: [u8; 12],

    bs_drvnum: u8,
    bs_reserved1: u8,
    bs_bootsig: u8,
    bs_volid: U32,
    bs_vollab: [u8; 11],
    bs_filsystype: [u8; 8],

    bs_boot: [u8; 420],
    signature_word: [u8; 2],
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout)]
struct DirEntry {
    dir_name: [u8; 11],
    dir_attr: u8,
    dir_ntres: u8,
    dir_crttimetenth: u8,
    dir_crttime: U16,
    dir_crtdate: U16,
    dir_lstaccdate: U16,
    dir_fstclushi: U16,
    dir_wrttime: U16,
    dir_wrtdate: U16,
    dir_fstcluslo: U16,
    dir_filesize: U32,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout)]
struct LongNameDirEntry {
    ldir_ord: u8,
    ldir_name1: [U16; 5],
    ldir_attr: u8,
    ldir_type: u8,
    ldir_chksum: u8,
    ldir_name2: [U16; 6],
    ldir_fstcluslo: U16,
    ldir_name3: [U16; 2],
}

fn is_power_of_two(value: u32) -> bool {
    value != 0 && value & (value - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_name_joins_base_and_extension() {
        assert_eq!(short_name(b"README  TXT"), "README.TXT");
    }

    #[test]
    fn short_name_without_extension_omits_dot() {
        assert_eq!(short_name(b"BOOT       "), "BOOT");
    }

    #[test]
    fn detects_non_power_of_two() {
        assert!(!is_power_of_two(0));
        assert!(!is_power_of_two(3));
        assert!(is_power_of_two(512));
    }

    #[test]
    fn classifies_sentinel_ranges() {
        assert_eq!(Fat32Entry::classify(0), Fat32Entry::Free);
        assert_eq!(Fat32Entry::classify(1), Fat32Entry::Reserved);
        assert_eq!(Fat32Entry::classify(2), Fat32Entry::InUse(2));
        assert_eq!(Fat32Entry::classify(0x0FFFFFF7), Fat32Entry::Bad);
        assert_eq!(Fat32Entry::classify(0x0FFFFFF8), Fat32Entry::EndOfChain);
        assert_eq!(Fat32Entry::classify(0xFFFFFFFF), Fat32Entry::EndOfChain);
    }

    use diskscribe_doc::{parse_document, Value};
    use diskscribe_ds::MemoryStorage;
    use diskscribe_fs::WalkerState;

    const PARTITION_OFFSET: u64 = 512;

    fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
        buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
        buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Builds a 32-byte short directory entry.
    fn short_dir_entry(name: &[u8; 11], attr: u8, first_cluster: u32, size: u32) -> [u8; 32] {
        let mut buf = [0u8; 32];
        buf[0..11].copy_from_slice(name);
        buf[11] = attr;
        put_u16(&mut buf, 20, (first_cluster >> 16) as u16);
        put_u16(&mut buf, 26, first_cluster as u16);
        put_u32(&mut buf, 28, size);
        buf
    }

    /// Builds a 32-byte long-name directory entry carrying up to 13 UTF-16
    /// code units of `chars`, null-terminated and padded with `0xFFFF`.
    fn long_name_entry(ord: u8, chars: &[u16]) -> [u8; 32] {
        assert!(chars.len() <= 13);
        let mut units = [0xFFFFu16; 13];
        units[..chars.len()].copy_from_slice(chars);
        if chars.len() < 13 {
            units[chars.len()] = 0x0000;
        }
        let mut buf = [0u8; 32];
        buf[0] = ord;
        for (i, u) in units[0..5].iter().enumerate() {
            put_u16(&mut buf, 1 + i * 2, *u);
        }
        buf[11] = ATTR_LONG_NAME;
        for (i, u) in units[5..11].iter().enumerate() {
            put_u16(&mut buf, 14 + i * 2, *u);
        }
        for (i, u) in units[11..13].iter().enumerate() {
            put_u16(&mut buf, 28 + i * 2, *u);
        }
        buf
    }

    /// A minimal FAT32 volume: 512-byte sectors, 1 sector per cluster, one
    /// FAT, root directory at cluster 2 containing a long-named file
    /// spanning clusters 3-4 and a zero-length file with no allocation.
    fn fat32_fixture() -> Vec<u8> {
        let mut image = vec![0u8; (PARTITION_OFFSET + 5 * 512) as usize];
        let p = PARTITION_OFFSET as usize;

        put_u16(&mut image, p + 11, 512); // bytes per sector
        image[p + 13] = 1; // sectors per cluster
        put_u16(&mut image, p + 14, 1); // reserved sectors
        image[p + 16] = 1; // number of FATs
        put_u16(&mut image, p + 17, 0); // root entry count (0 => FAT32)
        put_u16(&mut image, p + 19, 0); // total sectors 16 (0 => use 32-bit field)
        put_u16(&mut image, p + 22, 0); // FAT size 16 (0 => FAT32)
        put_u32(&mut image, p + 32, 5); // total sectors 32
        put_u32(&mut image, p + 36, 1); // FAT size 32 (sectors)
        put_u32(&mut image, p + 44, 2); // root cluster
        image[p + 510] = 0x55;
        image[p + 511] = 0xAA;

        // FAT table at sector 1 (byte p + 512).
        let fat = p + 512;
        put_u32(&mut image, fat + 2 * 4, 0x0FFFFFFF); // cluster 2 (root dir): EOC
        put_u32(&mut image, fat + 3 * 4, 4); // cluster 3 -> cluster 4
        put_u32(&mut image, fat + 4 * 4, 0x0FFFFFFF); // cluster 4: EOC

        // Root directory at cluster 2 (byte p + 1024).
        let root = p + 1024;
        // "Résumé final.txt" across two long entries plus a short alias.
        let name: Vec<u16> = "Résumé final.txt".encode_utf16().collect();
        assert_eq!(name.len(), 16);
        image[root..root + 32].copy_from_slice(&long_name_entry(0x40 | 2, &name[13..16]));
        image[root + 32..root + 64].copy_from_slice(&long_name_entry(1, &name[0..13]));
        image[root + 64..root + 96]
            .copy_from_slice(&short_dir_entry(b"RESUME~1TXT", 0x20, 3, 9));
        image[root + 96..root + 128]
            .copy_from_slice(&short_dir_entry(b"EMPTY   TXT", 0x20, 0, 0));
        // terminator is the zeroed remainder of the cluster.

        image
    }

    #[test]
    fn cluster_chain_reproduces_sector_list() {
        let image = fat32_fixture();
        let storage = MemoryStorage(&image);
        let fs = FileSystemServer::probe(&storage, PARTITION_OFFSET).unwrap();
        assert_eq!(fs.cluster_chain_sectors(3), vec![4, 5]);
    }

    #[test]
    fn probe_rejects_partition_offset_zero() {
        let image = fat32_fixture();
        let storage = MemoryStorage(&image);
        assert!(FileSystemServer::probe(&storage, 0).is_err());
    }

    #[test]
    fn walk_reconstructs_long_name_and_empty_file() {
        let image = fat32_fixture();
        let storage = MemoryStorage(&image);
        let fs = FileSystemServer::probe(&storage, PARTITION_OFFSET).unwrap();

        let mut writer = Writer::new();
        writer.begin_doc();
        writer.begin_array("entries");
        let mut state = WalkerState::new(WalkerState::DEFAULT_MAX_DEPTH);
        fs.walk_and_serialize_tree(&mut writer, &mut state).unwrap();
        writer.end_array();
        writer.end_doc();

        let mut out = Vec::new();
        writer.flush_to(&mut out).unwrap();
        let Value::Document(fields) = parse_document(&out).unwrap() else {
            panic!("expected document");
        };
        let Value::Array(entries) = &fields[0].1 else {
            panic!("expected entries array");
        };
        // entries[0] is the synthesized root; the two directory children follow.
        assert_eq!(entries.len(), 3);

        let names: Vec<&str> = entries[1..]
            .iter()
            .map(|e| {
                let Value::Document(fs_fields) = e else {
                    panic!("expected entry document");
                };
                let (_, Value::Str(name)) = fs_fields
                    .iter()
                    .find(|(k, _)| k == "name")
                    .expect("entry has a name field")
                else {
                    panic!("name field is not a string");
                };
                name.as_str()
            })
            .collect();
        assert_eq!(names, vec!["Résumé final.txt", "EMPTY.TXT"]);

        let Value::Document(long_name_fields) = &entries[1] else {
            panic!("expected entry document");
        };
        let (_, Value::Array(sectors)) = long_name_fields
            .iter()
            .find(|(k, _)| k == "sectors")
            .unwrap()
        else {
            panic!("sectors field is not an array");
        };
        assert_eq!(sectors, &vec![Value::I64(4), Value::I64(5)]);

        let Value::Document(empty_fields) = &entries[2] else {
            panic!("expected entry document");
        };
        let (_, Value::Array(empty_sectors)) = empty_fields
            .iter()
            .find(|(k, _)| k == "sectors")
            .unwrap()
        else {
            panic!("sectors field is not an array");
        };
        assert!(empty_sectors.is_empty());
    }
}
