//! On-media log mechanics.
//!
//! Everything here operates on the raw entry chain: aligned programs with
//! erase-value padding, chunked block moves and comparisons, the backward
//! walker that crosses sector boundaries through close markers, and the
//! recovery scan that re-finds a sector's last valid entry when its close
//! marker cannot be trusted.

use crate::addr::{align_up, Addr};
use crate::cache::LookupCache;
use crate::config::StoreConfig;
use crate::entry::{Ate, WireFormat, MARKER_KEY};
use crate::error::{Error, Result};
use crate::flash::Flash;
use crate::store::Core;

/// Chunk buffer for block copies and comparisons. Also bounds the padded
/// entry size, so the largest supported write alignment divides it.
pub(crate) const BLOCK_BUF: usize = 32;

impl<F: Flash> Core<F> {
    pub(crate) fn new(flash: F, config: StoreConfig) -> Result<Self> {
        let write_alignment = flash.write_alignment();
        config.validate(write_alignment)?;

        let fmt = WireFormat::for_sector_size(config.sector_size);
        let ate_size = align_up(fmt.size(), write_alignment);
        if config.sector_size < 8 * ate_size {
            return Err(Error::InvalidArgument(
                "sector too small for the entry layout",
            ));
        }

        let erase_value = flash.erase_value();
        let cache = match config.lookup_cache_size {
            0 => None,
            n => Some(LookupCache::new(n)),
        };

        Ok(Core {
            flash,
            config,
            fmt,
            ate_size,
            write_alignment,
            erase_value,
            ate_wra: Addr::new(0, 0),
            data_wra: Addr::new(0, 0),
            cache,
            ready: false,
        })
    }

    fn device_offset(&self, addr: Addr) -> u64 {
        self.config.base_offset + addr.device_offset(self.config.sector_size)
    }

    pub(crate) fn flash_rd(&mut self, addr: Addr, buf: &mut [u8]) -> Result<()> {
        let offset = self.device_offset(addr);
        self.flash.read(offset, buf)
    }

    /// Programs `data` at `addr`, padding the unaligned tail with the
    /// erase value. `addr` itself must be aligned.
    fn flash_al_wrt(&mut self, addr: Addr, data: &[u8]) -> Result<()> {
        let align = self.write_alignment as usize;
        let aligned = data.len() / align * align;
        let mut offset = self.device_offset(addr);

        if aligned > 0 {
            self.flash.write(offset, &data[..aligned])?;
            offset += aligned as u64;
        }

        let rest = data.len() - aligned;
        if rest > 0 {
            let mut buf = [0u8; BLOCK_BUF];
            buf[..align].fill(self.erase_value);
            buf[..rest].copy_from_slice(&data[aligned..]);
            self.flash.write(offset, &buf[..align])?;
        }
        Ok(())
    }

    /// Appends value bytes at the data cursor and advances it by the
    /// padded length.
    pub(crate) fn data_wrt(&mut self, data: &[u8]) -> Result<()> {
        let addr = self.data_wra;
        self.flash_al_wrt(addr, data)?;
        self.data_wra = self
            .data_wra
            .add(align_up(data.len() as u32, self.write_alignment));
        Ok(())
    }

    /// Programs an entry record at the entry cursor, moves the cursor one
    /// slot down and returns the address the record landed on.
    pub(crate) fn ate_wrt(&mut self, ate: &Ate) -> Result<Addr> {
        let mut buf = [0u8; BLOCK_BUF];
        let wire = self.fmt.size() as usize;
        buf[..self.ate_size as usize].fill(self.erase_value);
        ate.encode_into(self.fmt, &mut buf[..wire]);

        let slot = self.ate_wra;
        let offset = self.device_offset(slot);
        self.flash.write(offset, &buf[..self.ate_size as usize])?;
        self.ate_wra = self.ate_wra.sub(self.ate_size);
        Ok(slot)
    }

    /// Reads the record at `addr` along with whether its cells were ever
    /// programmed. An all-erase-value slot means "never written", which is
    /// distinct from a written-but-invalid record.
    pub(crate) fn read_slot(&mut self, addr: Addr) -> Result<(Ate, bool)> {
        let mut buf = [0u8; 12];
        let wire = self.fmt.size() as usize;
        self.flash_rd(addr, &mut buf[..wire])?;
        let erased = buf[..wire].iter().all(|&b| b == self.erase_value);
        Ok((Ate::decode(self.fmt, &buf[..wire]), erased))
    }

    pub(crate) fn ate_valid(&self, ate: &Ate) -> bool {
        ate.is_valid(self.fmt, self.config.sector_size, self.ate_size)
    }

    /// True when `len` bytes starting at `addr` all read back as the
    /// erase value.
    pub(crate) fn cmp_erased(&mut self, addr: Addr, len: u32) -> Result<bool> {
        let mut buf = [0u8; BLOCK_BUF];
        let mut pos = addr;
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(BLOCK_BUF as u32);
            self.flash_rd(pos, &mut buf[..n as usize])?;
            if buf[..n as usize].iter().any(|&b| b != self.erase_value) {
                return Ok(false);
            }
            pos = pos.add(n);
            remaining -= n;
        }
        Ok(true)
    }

    /// Compares stored bytes at `addr` against `data`.
    pub(crate) fn block_cmp(&mut self, addr: Addr, data: &[u8]) -> Result<bool> {
        let mut buf = [0u8; BLOCK_BUF];
        let mut pos = addr;
        let mut done = 0usize;
        while done < data.len() {
            let n = (data.len() - done).min(BLOCK_BUF);
            self.flash_rd(pos, &mut buf[..n])?;
            if buf[..n] != data[done..done + n] {
                return Ok(false);
            }
            pos = pos.add(n as u32);
            done += n;
        }
        Ok(true)
    }

    /// Copies `len` value bytes from `from` to the data cursor in chunks.
    /// Intermediate chunks are alignment-multiples, so only the final one
    /// picks up pad bytes.
    pub(crate) fn block_move(&mut self, from: Addr, len: u32) -> Result<()> {
        let mut buf = [0u8; BLOCK_BUF];
        let mut pos = from;
        let mut remaining = len as usize;
        while remaining > 0 {
            let n = remaining.min(BLOCK_BUF);
            self.flash_rd(pos, &mut buf[..n])?;
            self.data_wrt(&buf[..n])?;
            pos = pos.add(n as u32);
            remaining -= n;
        }
        Ok(())
    }

    /// Returns the entry at `*addr` and steps `*addr` to the
    /// chronologically previous entry, crossing into the preceding sector
    /// through its close marker when the current sector's chain is
    /// exhausted. At the live-sector boundary `*addr` is left equal to the
    /// entry cursor, which callers use as the walk termination mark.
    pub(crate) fn prev_ate(&mut self, addr: &mut Addr) -> Result<Ate> {
        let sector_size = self.config.sector_size;
        let (ate, _) = self.read_slot(*addr)?;

        *addr = addr.add(self.ate_size);
        if addr.offset() != sector_size - self.ate_size {
            return Ok(ate);
        }

        // Landed on the close slot: the older part of the chain lives in
        // the previous sector.
        let prev_sector = match addr.sector() {
            0 => self.config.sector_count - 1,
            s => s - 1,
        };
        *addr = Addr::new(prev_sector, addr.offset());

        let (close, erased) = self.read_slot(*addr)?;
        if erased {
            // Previous sector never closed: the walk wrapped around the
            // whole log and terminates at the write pointer.
            *addr = self.ate_wra;
            return Ok(ate);
        }

        if close.is_close_marker(self.fmt, sector_size, self.ate_size) {
            *addr = addr.with_offset(close.offset);
            return Ok(ate);
        }

        // Interrupted close write: locate the last valid entry by hand.
        self.recover_last_ate(addr)?;
        Ok(ate)
    }

    /// Finds the newest valid entry of the sector whose close slot `*addr`
    /// points at, scanning one slot at a time from the high end toward the
    /// sector start. If nothing in the sector validates, `*addr` stays two
    /// slots before the sector end so the caller's next step observes the
    /// erased boundary and terminates the walk.
    pub(crate) fn recover_last_ate(&mut self, addr: &mut Addr) -> Result<()> {
        tracing::debug!(sector = addr.sector(), "recovering last entry");

        *addr = addr.sub(self.ate_size);
        let mut slot = *addr;
        let mut data_end = addr.sector_start();

        while slot > data_end {
            let (ate, _) = self.read_slot(slot)?;
            if self.ate_valid(&ate) {
                data_end = slot
                    .sector_start()
                    .add(ate.offset + align_up(ate.len as u32, self.write_alignment));
                *addr = slot;
            }
            slot = slot.sub(self.ate_size);
        }
        Ok(())
    }

    /// Writes the close marker into the open sector's last slot and makes
    /// the following sector the active write target.
    pub(crate) fn sector_close(&mut self) -> Result<()> {
        let sector_size = self.config.sector_size;
        let boundary = self.ate_wra.offset() + self.ate_size;
        let close = Ate::new(self.fmt, MARKER_KEY, boundary, 0);

        tracing::debug!(
            sector = self.ate_wra.sector(),
            boundary,
            "closing sector"
        );

        self.ate_wra = self.ate_wra.with_offset(sector_size - self.ate_size);
        self.ate_wrt(&close)?;

        self.ate_wra = self.ate_wra.next_sector(self.config.sector_count);
        self.data_wra = self.ate_wra.sector_start();
        Ok(())
    }

    /// Marks a completed collection pass: a reserved-key entry recording
    /// the data cursor at the moment the following sector became
    /// reclaimable.
    pub(crate) fn add_gc_done_ate(&mut self) -> Result<()> {
        let ate = Ate::new(self.fmt, MARKER_KEY, self.data_wra.offset(), 0);
        self.ate_wrt(&ate)?;
        Ok(())
    }

    /// Erases one sector and drops any cache entries pointing into it.
    pub(crate) fn erase_sector(&mut self, sector: u32) -> Result<()> {
        let offset = self.device_offset(Addr::new(sector, 0));
        self.flash.erase(offset, self.config.sector_size)?;
        if let Some(cache) = &mut self.cache {
            cache.invalidate_sector(sector);
        }
        Ok(())
    }
}
