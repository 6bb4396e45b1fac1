//! Block-storage adapters consumed by the store.
//!
//! The engine talks to the medium through the [`Flash`] trait and never
//! assumes anything beyond this contract: reads may be unaligned, programs
//! must be aligned to [`Flash::write_alignment`], and erase resets whole
//! sectors to [`Flash::erase_value`].

mod file;
mod mem;

pub use file::FileFlash;
pub use mem::MemFlash;

use crate::error::Result;

pub trait Flash {
    /// Reads `buf.len()` bytes starting at `offset`. Unaligned lengths are
    /// permitted.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Programs `data` at `offset`. Both `offset` and `data.len()` must be
    /// multiples of [`Flash::write_alignment`]; callers pad shorter
    /// payloads with the erase value.
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Resets `len` bytes starting at `offset` to the erase value. The
    /// range must cover whole sectors of the device.
    fn erase(&mut self, offset: u64, len: u32) -> Result<()>;

    /// Minimum program granularity in bytes, at least 1.
    fn write_alignment(&self) -> u32;

    /// Byte pattern left behind by an erase, typically all ones.
    fn erase_value(&self) -> u8;
}
