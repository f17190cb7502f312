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

//! Disk-structure decoder CLI: reads a raw disk image, decodes its MBR,
//! dispatches a file-system driver per partition, and streams a
//! self-describing document of the result to an output file.
//!
//! Two positional arguments, no flags: `diskscribe <image> <output>`. Exit
//! code 0 on success, non-zero on any error that prevents the document
//! from being written at all; a partition that no driver recognizes, or
//! whose walk fails partway, is a logged diagnostic, not a process
//! failure — the document still closes with whatever was collected.

use std::{env, fs::File, mem::size_of, process::ExitCode};

use diskscribe_ds_std::DataStorageServer;
use diskscribe_doc::Writer;
use diskscribe_err::{Component, Error, FsError, Result};
use diskscribe_fs::{FileSystemKind, FsDriver, WalkerState};
use log::{error, info, warn};

/// Boundary layout for the block-write event stream a downstream process
/// frames against this document. Not read or written by this crate —
/// `header_size()` is the one fact a framer needs from here.
#[repr(C)]
pub struct WriteHeader {
    pub sector_offset: u64,
    pub nb_sectors: u32,
    pub reserved: u32,
}

impl WriteHeader {
    pub const fn header_size() -> usize {
        size_of::<WriteHeader>()
    }
}

/// The driver that claimed a partition, held as a tagged variant rather
/// than a trait object since the set of drivers is fixed at three.
enum Driver<'a> {
    Ext2(diskscribe_ext2::FileSystemServer<&'a DataStorageServer>),
    Fat32(diskscribe_fat::FileSystemServer<&'a DataStorageServer>),
    Ntfs(diskscribe_ntfs::FileSystemServer<&'a DataStorageServer>),
}

impl<'a> Driver<'a> {
    fn kind(&self) -> FileSystemKind {
        match self {
            Driver::Ext2(_) => FileSystemKind::Ext2,
            Driver::Fat32(_) => FileSystemKind::Fat32,
            Driver::Ntfs(_) => FileSystemKind::Ntfs,
        }
    }

    fn serialize_fs(&self, partition_index: usize, writer: &mut Writer) {
        match self {
            Driver::Ext2(fs) => fs.serialize_fs(partition_index, writer),
            Driver::Fat32(fs) => fs.serialize_fs(partition_index, writer),
            Driver::Ntfs(fs) => fs.serialize_fs(partition_index, writer),
        }
    }

    fn walk_and_serialize_tree(&self, writer: &mut Writer, state: &mut WalkerState) -> Result<()> {
        match self {
            Driver::Ext2(fs) => fs.walk_and_serialize_tree(writer, state),
            Driver::Fat32(fs) => fs.walk_and_serialize_tree(writer, state),
            Driver::Ntfs(fs) => fs.walk_and_serialize_tree(writer, state),
        }
    }

    fn cleanup(self) {
        match self {
            Driver::Ext2(fs) => fs.cleanup(),
            Driver::Fat32(fs) => fs.cleanup(),
            Driver::Ntfs(fs) => fs.cleanup(),
        }
    }
}

/// Tries each driver in turn. `Ok(None)` means no driver claimed the
/// partition (logged by the caller, not an error); `Err` means a driver
/// matched its magic but then hit a hard I/O failure, which aborts this
/// partition per the `BadMagic`-is-local / `Io`-propagates policy.
fn probe_driver(storage: &DataStorageServer, partition_offset: u64) -> Result<Option<Driver<'_>>> {
    match diskscribe_ext2::FileSystemServer::probe(storage, partition_offset) {
        Ok(fs) => return Ok(Some(Driver::Ext2(fs))),
        Err(Error::Fs(FsError::BadMagic { .. })) => {}
        Err(err) => return Err(err),
    }
    match diskscribe_fat::FileSystemServer::probe(storage, partition_offset) {
        Ok(fs) => return Ok(Some(Driver::Fat32(fs))),
        Err(Error::Fs(FsError::BadMagic { .. })) => {}
        Err(err) => return Err(err),
    }
    match diskscribe_ntfs::FileSystemServer::probe(storage, partition_offset) {
        Ok(fs) => return Ok(Some(Driver::Ntfs(fs))),
        Err(Error::Fs(FsError::BadMagic { .. })) => {}
        Err(err) => return Err(err),
    }
    Ok(None)
}

/// Runs the full pipeline against an already-open image, writing the
/// finished document to `sink`. Kept free of `std::env`/`std::process` so
/// it can be driven directly from a fixture image in tests.
fn run(storage: &DataStorageServer, sink: impl std::io::Write) -> Result<()> {
    let partition_table = diskscribe_mbr::parse_mbr(&storage)?;

    let fs_count = partition_table
        .present_offsets()
        .filter(|(_, offset)| matches!(probe_driver(storage, *offset), Ok(Some(_))))
        .count();

    let mut writer = Writer::new();
    writer.begin_doc();

    writer.begin_doc_at("mbr");
    writer.emit("partition_count", partition_table.present_count() as i32);
    writer.emit("fs_count", fs_count as i32);
    writer.end_doc();

    writer.begin_array("partitions");
    for (index, offset) in partition_table.present_offsets() {
        // A fresh state per partition: `visited` holds raw inode numbers
        // (ext2) or cluster numbers (FAT32), both small values in a
        // per-partition namespace, and each file system's root must get id
        // 0 (spec §3/§4.6) — sharing one `WalkerState` across partitions
        // would make the second partition's root collide with the first's
        // already-visited set and never walk past its synthesized root.
        let mut state = WalkerState::new(WalkerState::DEFAULT_MAX_DEPTH);
        if state.is_cancelled() {
            break;
        }

        let entry = &partition_table.entries[index];
        writer.begin_doc_at("_");
        writer.emit("index", index as i32);
        writer.emit("active", entry.active);
        writer.emit("type_code", entry.type_code as i32);
        writer.emit("lba_first_sector", entry.lba_first_sector as i64);
        writer.emit("sector_count", entry.sector_count as i64);

        match probe_driver(storage, offset) {
            Ok(Some(driver)) => {
                info!(
                    "partition {index}: {} at {offset:#018x}",
                    driver.kind().as_str()
                );
                driver.serialize_fs(index, &mut writer);

                writer.begin_array("entries");
                match driver.walk_and_serialize_tree(&mut writer, &mut state) {
                    Ok(()) => {}
                    Err(Error::Fs(FsError::Unsupported { component })) => {
                        info!("partition {index}: {component} recognized but not walked");
                    }
                    Err(err) => {
                        error!("partition {index}: aborting walk: {err}");
                    }
                }
                writer.end_array();

                driver.cleanup();
            }
            Ok(None) => {
                warn!("partition {index}: no driver recognized a file system at {offset:#018x}");
            }
            Err(err) => {
                error!("partition {index}: probe failed: {err}");
            }
        }

        writer.end_doc();
    }
    writer.end_array();

    writer.end_doc();
    writer.flush_to(sink).map_err(|err| Error::Io(diskscribe_err::IoError::Std(err)))
}

fn main() -> ExitCode {
    env_logger::init();

    let mut args = env::args();
    let program = args.next().unwrap_or_else(|| "diskscribe".to_owned());
    let (image_path, output_path) = match (args.next(), args.next()) {
        (Some(image), Some(output)) => (image, output),
        _ => {
            eprintln!("Usage: {program} <raw disk image> <output>");
            return ExitCode::FAILURE;
        }
    };

    info!("analyzing disk: {image_path}");

    let storage = match DataStorageServer::open(&image_path) {
        Ok(storage) => storage,
        Err(err) => {
            error!("error opening raw disk file {image_path:?}: {err}");
            return ExitCode::FAILURE;
        }
    };

    let output = match File::create(&output_path) {
        Ok(file) => file,
        Err(err) => {
            error!("error opening output file {output_path:?}: {err}");
            return ExitCode::FAILURE;
        }
    };

    match run(&storage, output) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("error reading MBR from disk, aborting: {err}");
            ExitCode::FAILURE
        }
    }
}
