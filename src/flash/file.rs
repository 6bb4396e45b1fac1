//! File-backed flash device.
//!
//! Emulates a block-erasable medium on top of one preallocated file. A
//! fresh file reads back as fully erased; programs and erases are written
//! through immediately so a reopened device sees the same state.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::Result;
use crate::flash::Flash;

const ERASE_VALUE: u8 = 0xFF;

pub struct FileFlash {
    file: File,
    size: u64,
    alignment: u32,
}

impl FileFlash {
    /// Opens or creates the backing file, extending it to `size` bytes of
    /// erase value when it is new or short.
    pub fn open(path: &Path, size: u64, alignment: u32) -> Result<Self> {
        let mut file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        let current = file.metadata()?.len();
        if current < size {
            file.seek(SeekFrom::Start(current))?;
            let blank = vec![ERASE_VALUE; 4096];
            let mut remaining = size - current;
            while remaining > 0 {
                let n = remaining.min(blank.len() as u64) as usize;
                file.write_all(&blank[..n])?;
                remaining -= n as u64;
            }
            file.sync_all()?;
        }

        Ok(FileFlash {
            file,
            size,
            alignment,
        })
    }
}

impl Flash for FileFlash {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn erase(&mut self, offset: u64, len: u32) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        let blank = vec![ERASE_VALUE; len.min(4096) as usize];
        let mut remaining = len as usize;
        while remaining > 0 {
            let n = remaining.min(blank.len());
            self.file.write_all(&blank[..n])?;
            remaining -= n;
        }
        self.file.sync_data()?;
        Ok(())
    }

    fn write_alignment(&self) -> u32 {
        self.alignment
    }

    fn erase_value(&self) -> u8 {
        ERASE_VALUE
    }
}

impl std::fmt::Debug for FileFlash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileFlash")
            .field("size", &self.size)
            .field("alignment", &self.alignment)
            .finish()
    }
}
