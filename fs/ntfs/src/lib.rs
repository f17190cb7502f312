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

//! NTFS recognition driver.
//!
//! NTFS partitions are identified by their boot-sector OEM ID so that a
//! partition table entry pointing at one is reported accurately instead of
//! as `unknown`, but the MFT is never walked: reconstructing a tree from
//! resident and nonresident attribute runs is a different project from
//! what a driver here is worth to maintain for a file system this crate
//! can only ever report on, never produce entries for.

use std::mem::size_of;

use diskscribe_ds::DataStorage;
use diskscribe_doc::Writer;
use diskscribe_err::{Component, Error, FsError, Result};
use diskscribe_fs::{FsDriver, WalkerState};
use zerocopy::{
    little_endian::{U16, U32, U64},
    FromBytes, IntoBytes, KnownLayout,
};

const OEM_ID: &[u8; 8] = b"NTFS    ";
const SIGNATURE_OFFSET: usize = 510;

pub struct FileSystemServer<DS: DataStorage> {
    storage: DS,
    partition_offset: u64,
    bytes_per_sector: u32,
    sectors_per_cluster: u32,
}

impl<DS: DataStorage> FsDriver<DS> for FileSystemServer<DS> {
    fn probe(storage: DS, partition_offset: u64) -> Result<Self> {
        let boot_sector: BootSector = {
            let mut bytes = [0u8; size_of::<BootSector>()];
            storage.read(partition_offset, &mut bytes)?;
            BootSector::read_from_bytes(&bytes).map_err(|_| {
                Error::Fs(FsError::Invariant {
                    component: Component::Ntfs,
                    offset: partition_offset,
                    detail: "boot sector truncated".to_owned(),
                })
            })?
        };

        if &boot_sector.oem_id != OEM_ID {
            return Err(Error::Fs(FsError::BadMagic {
                component: Component::Ntfs,
                offset: partition_offset,
            }));
        }
        if boot_sector.signature_word != [0x55, 0xAA] {
            return Err(Error::Fs(FsError::BadMagic {
                component: Component::Ntfs,
                offset: partition_offset + SIGNATURE_OFFSET as u64,
            }));
        }

        Ok(Self {
            storage,
            partition_offset,
            bytes_per_sector: boot_sector.bytes_per_sector.get() as u32,
            sectors_per_cluster: boot_sector.sectors_per_cluster as u32,
        })
    }

    fn serialize_fs(&self, partition_index: usize, writer: &mut Writer) {
        writer.begin_doc_at("fs");
        writer.emit("kind", "ntfs");
        writer.emit("partition_index", partition_index as i32);
        writer.emit("bytes_per_sector", self.bytes_per_sector as i32);
        writer.emit("sectors_per_cluster", self.sectors_per_cluster as i32);
        writer.end_doc();
    }

    fn walk_and_serialize_tree(&self, _writer: &mut Writer, _state: &mut WalkerState) -> Result<()> {
        Err(Error::Fs(FsError::Unsupported {
            component: Component::Ntfs,
        }))
    }

    fn cleanup(self) {}
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout)]
struct BootSector {
    jump: [u8; 3],
    oem_id: [u8; 8],
    bytes_per_sector: U16,
    sectors_per_cluster: u8,
    reserved: [u8; 496],
    signature_word: [u8; 2],
}

/// Kept for the day this driver grows a walker: the fixed-size prefix of
/// every MFT file record. Unused while [`FsDriver::walk_and_serialize_tree`]
/// returns [`FsError::Unsupported`].
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout)]
#[allow(dead_code)]
struct FileRecordSegmentHeader {
    /// Always "FILE"; see [`MultiSectorHeader`].
    multi_sector_header: MultiSectorHeader,
    reserved1: U64,
    sequence_number: U16,
    reserved2: U16,
    first_attribute_offset: U16,
    flags: U16,
    reserved3: [U32; 2],
    base_file_record_segment: MftSegmentReference,
    reserved4: U16,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout)]
#[allow(dead_code)]
struct MultiSectorHeader {
    signature: [u8; 4],
    update_sequence_array_offset: U16,
    update_sequence_array_size: U16,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout)]
#[allow(dead_code)]
struct MftSegmentReference {
    segment_number_low_part: U32,
    segment_number_high_part: U16,
    sequence_number: U16,
}
