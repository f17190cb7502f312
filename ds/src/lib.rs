//! Random-access, 64-bit-offset read surface over a block image.
//!
//! Implementations are not required to buffer beyond what callers do
//! themselves, but every `read` must be read-through: offsets are never
//! reordered or cached across calls in a way that would let a caller
//! observe stale data after a write made through some other handle. Since
//! this workspace never writes to an image, that requirement is vacuous in
//! practice, but it's part of why `DataStorage` has no `write` method —
//! see `FileSystem` in `diskscribe_fs` for the analogous read-only
//! contract on the file-system side.

pub use diskscribe_err::{Error, IoError, Result};

/// A block image addressable by 64-bit byte offset.
///
/// A short read is always a hard error (`IoError::Truncated`); there is no
/// partial-read API because every on-disk structure this workspace decodes
/// is a fixed- or computably-variable-length record that a caller reads in
/// full or not at all.
pub trait DataStorage {
    /// Reads exactly `buffer.len()` bytes starting at `offset`.
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()>;

    /// Total addressable size of the underlying image, in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<DS: DataStorage + ?Sized> DataStorage for &DS {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        (**self).read(offset, buffer)
    }

    fn len(&self) -> u64 {
        (**self).len()
    }
}

/// An in-memory [`DataStorage`] backed by a byte slice, used by this
/// workspace's test fixtures to exercise the drivers without a real disk
/// image.
pub struct MemoryStorage<'a>(pub &'a [u8]);

impl<'a> DataStorage for MemoryStorage<'a> {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start
            .checked_add(buffer.len())
            .filter(|&end| end <= self.0.len())
            .ok_or(Error::Io(IoError::Truncated {
                offset,
                expected: buffer.len(),
                actual: self.0.len().saturating_sub(start),
            }))?;
        buffer.copy_from_slice(&self.0[start..end]);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.0.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_in_bounds() {
        let data = [1u8, 2, 3, 4, 5];
        let storage = MemoryStorage(&data);
        let mut buf = [0u8; 2];
        storage.read(1, &mut buf).unwrap();
        assert_eq!(buf, [2, 3]);
    }

    #[test]
    fn rejects_short_read() {
        let data = [1u8, 2, 3];
        let storage = MemoryStorage(&data);
        let mut buf = [0u8; 4];
        assert!(storage.read(1, &mut buf).is_err());
    }
}
