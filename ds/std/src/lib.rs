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

use std::{fs::File, os::unix::fs::FileExt, path::Path};

use diskscribe_ds::DataStorage;
use diskscribe_err::{Error, IoError, Result};

/// A [`DataStorage`] backed by a regular file opened read-only.
///
/// Unlike the in-process file-server this is adapted from, a short or
/// failed read here always propagates as [`IoError::Truncated`] /
/// [`IoError::Std`] rather than panicking: spec section 7 treats a
/// truncated image as a hard error that the pipeline must still be able to
/// recover from (by aborting only the current partition), so this type
/// cannot afford to unwind past `DataStorage::read`.
pub struct DataStorageServer {
    file: File,
    len: u64,
}

impl DataStorageServer {
    pub fn open(file_path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(file_path).map_err(IoError::Std)?;
        let len = file.metadata().map_err(IoError::Std)?.len();
        Ok(Self { file, len })
    }
}

impl DataStorage for DataStorageServer {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        match self.file.read_exact_at(buffer, offset) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(Error::Io(IoError::Truncated {
                    offset,
                    expected: buffer.len(),
                    actual: self.len.saturating_sub(offset) as usize,
                }))
            }
            Err(err) => Err(Error::Io(IoError::Std(err))),
        }
    }

    fn len(&self) -> u64 {
        self.len
    }
}
