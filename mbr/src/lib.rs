//! Master Boot Record partition-table decoder.
//!
//! Grounded on the `MbrPartitionTable`/`MbrPartition` layout in
//! `hadris-common`'s MBR module, adapted from that crate's `bytemuck`-based
//! `#[repr(C)]` structs to the `zerocopy` little-endian field style this
//! workspace's teacher (`hyrax_fs_fat`) uses throughout.

use diskscribe_ds::DataStorage;
use diskscribe_err::{Component, Error, FsError, Result};
use log::warn;
use zerocopy::{little_endian::U32, FromBytes, Immutable, IntoBytes, KnownLayout};

pub const SECTOR_SIZE: u64 = 512;
const SIGNATURE_OFFSET: usize = 510;
const SIGNATURE: [u8; 2] = [0x55, 0xAA];
const PARTITION_TABLE_OFFSET: usize = 446;
const PARTITION_ENTRY_SIZE: usize = 16;
const PARTITION_ENTRY_COUNT: usize = 4;

/// A 3-byte CHS (cylinder/head/sector) address. Informational only — this
/// workspace never derives an offset from it.
#[repr(transparent)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Chs(pub [u8; 3]);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct RawPartitionEntry {
    boot_indicator: u8,
    chs_first: Chs,
    partition_type: u8,
    chs_last: Chs,
    lba_first_sector: U32,
    sector_count: U32,
}

/// A hint derived from the partition type byte. Probing remains the
/// authoritative source of truth for dispatch; this is only used for
/// diagnostics on partitions no driver claims.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PartitionTypeHint {
    #[default]
    Empty,
    Fat32,
    Fat32Lba,
    LinuxNative,
    Ntfs,
    Extended,
    Unknown(u8),
}

impl PartitionTypeHint {
    fn from_byte(b: u8) -> Self {
        match b {
            0x00 => PartitionTypeHint::Empty,
            0x05 | 0x0f => PartitionTypeHint::Extended,
            0x07 => PartitionTypeHint::Ntfs,
            0x0b => PartitionTypeHint::Fat32,
            0x0c => PartitionTypeHint::Fat32Lba,
            0x83 => PartitionTypeHint::LinuxNative,
            other => PartitionTypeHint::Unknown(other),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PartitionEntry {
    pub active: bool,
    pub chs_first: Chs,
    pub chs_last: Chs,
    pub type_code: u8,
    pub type_hint: PartitionTypeHint,
    pub lba_first_sector: u32,
    pub sector_count: u32,
}

impl PartitionEntry {
    /// Entries with type code 0 or LBA 0 are treated as absent.
    pub fn is_present(&self) -> bool {
        self.type_code != 0 && self.lba_first_sector != 0
    }

    pub fn byte_offset(&self) -> u64 {
        self.lba_first_sector as u64 * SECTOR_SIZE
    }

    pub fn byte_len(&self) -> u64 {
        self.sector_count as u64 * SECTOR_SIZE
    }
}

impl From<RawPartitionEntry> for PartitionEntry {
    fn from(raw: RawPartitionEntry) -> Self {
        Self {
            active: raw.boot_indicator & 0x80 != 0,
            chs_first: raw.chs_first,
            chs_last: raw.chs_last,
            type_code: raw.partition_type,
            type_hint: PartitionTypeHint::from_byte(raw.partition_type),
            lba_first_sector: raw.lba_first_sector.get(),
            sector_count: raw.sector_count.get(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PartitionTable {
    pub entries: [PartitionEntry; PARTITION_ENTRY_COUNT],
}

impl PartitionTable {
    /// Iterates the byte offsets of present partitions, in table order.
    pub fn present_offsets(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_present())
            .map(|(i, e)| (i, e.byte_offset()))
    }

    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_present()).count()
    }
}

/// Reads offsets 0..511 of `storage` and decodes up to four primary
/// partition entries. Requires the `0x55AA` signature at offset 510.
pub fn parse_mbr(storage: &impl DataStorage) -> Result<PartitionTable> {
    let mut sector = [0u8; SECTOR_SIZE as usize];
    storage.read(0, &mut sector)?;

    if sector[SIGNATURE_OFFSET..SIGNATURE_OFFSET + 2] != SIGNATURE {
        return Err(Error::Fs(FsError::BadMagic {
            component: Component::Mbr,
            offset: SIGNATURE_OFFSET as u64,
        }));
    }

    let mut entries = [PartitionEntry::default(); PARTITION_ENTRY_COUNT];
    for (i, entry) in entries.iter_mut().enumerate() {
        let start = PARTITION_TABLE_OFFSET + i * PARTITION_ENTRY_SIZE;
        let raw = RawPartitionEntry::read_from_bytes(&sector[start..start + PARTITION_ENTRY_SIZE])
            .expect("fixed-size slice matches RawPartitionEntry layout");
        *entry = raw.into();
        if entry.is_present() && entry.byte_offset() / SECTOR_SIZE + entry.sector_count as u64 > storage.len() / SECTOR_SIZE
        {
            warn!(
                "mbr: partition {i} extends past end of image (offset {:#018x}, {} sectors)",
                entry.byte_offset(),
                entry.sector_count
            );
        }
    }

    Ok(PartitionTable { entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use diskscribe_ds::MemoryStorage;

    fn empty_mbr() -> Vec<u8> {
        let mut sector = vec![0u8; 512];
        sector[510] = 0x55;
        sector[511] = 0xAA;
        sector
    }

    #[test]
    fn empty_mbr_has_no_present_partitions() {
        let image = empty_mbr();
        let table = parse_mbr(&MemoryStorage(&image)).unwrap();
        assert_eq!(table.present_count(), 0);
    }

    #[test]
    fn missing_signature_is_hard_error() {
        let image = vec![0u8; 512];
        assert!(parse_mbr(&MemoryStorage(&image)).is_err());
    }

    #[test]
    fn decodes_partition_offset_from_lba() {
        let mut image = empty_mbr();
        let entry_off = 446;
        image[entry_off] = 0x80; // active
        image[entry_off + 4] = 0x0b; // fat32
        image[entry_off + 8..entry_off + 12].copy_from_slice(&2048u32.to_le_bytes());
        image[entry_off + 12..entry_off + 16].copy_from_slice(&1000u32.to_le_bytes());
        // pad image so the "extends past end" bounds check doesn't warn.
        image.resize(4096, 0);

        let table = parse_mbr(&MemoryStorage(&image)).unwrap();
        assert_eq!(table.present_count(), 1);
        let (index, offset) = table.present_offsets().next().unwrap();
        assert_eq!(index, 0);
        assert_eq!(offset, 2048 * 512);
        assert!(table.entries[0].active);
    }
}
