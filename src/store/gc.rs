//! Space reclamation.
//!
//! The collector always targets the sector immediately after the freshly
//! opened one. Entries are copied forward only when a walk over the whole
//! log proves they are still the newest version of their key; shadowed
//! copies and tombstones stay behind and vanish with the erase. The pass
//! never recurses into itself: the append limit reserves room for one full
//! sector's worth of live data.

use crate::entry::{Ate, MARKER_KEY};
use crate::error::Result;
use crate::flash::Flash;
use crate::store::Core;

impl<F: Flash> Core<F> {
    /// Runs one collection pass over the next reclaim target. Invoked once
    /// per failed append attempt and while resuming an interrupted pass at
    /// mount.
    pub(crate) fn gc(&mut self) -> Result<()> {
        let sector_size = self.config.sector_size;
        let ate_size = self.ate_size;

        let target = self
            .ate_wra
            .sector_start()
            .next_sector(self.config.sector_count);
        let close_slot = target.with_offset(sector_size - ate_size);

        tracing::debug!(sector = target.sector(), "collecting sector");

        let (close, erased) = self.read_slot(close_slot)?;
        if erased {
            // Target was never closed; nothing can be live in it.
            return self.gc_finish(target.sector());
        }

        let stop_addr = close_slot.sub(ate_size);
        let mut gc_addr = close_slot;
        if close.is_close_marker(self.fmt, sector_size, ate_size) {
            gc_addr = gc_addr.with_offset(close.offset);
        } else {
            // Close write was interrupted; find the true last entry.
            self.recover_last_ate(&mut gc_addr)?;
        }

        loop {
            let gc_prev_addr = gc_addr;
            let gc_ate = self.prev_ate(&mut gc_addr)?;

            if self.ate_valid(&gc_ate) && gc_ate.key != MARKER_KEY {
                // Locate the newest entry for this key anywhere in the log.
                let mut wlk_addr = self.ate_wra;
                let mut wlk_prev_addr;
                loop {
                    wlk_prev_addr = wlk_addr;
                    let wlk_ate = self.prev_ate(&mut wlk_addr)?;
                    // A torn record with a matching key must not count as
                    // the newest copy.
                    if wlk_ate.key == gc_ate.key && self.ate_valid(&wlk_ate) {
                        break;
                    }
                    if wlk_addr == self.ate_wra {
                        break;
                    }
                }

                // Copy only when this very entry is the newest of its key
                // and is not a tombstone.
                if wlk_prev_addr == gc_prev_addr && gc_ate.len > 0 {
                    tracing::debug!(key = gc_ate.key, len = gc_ate.len, "moving live entry");

                    let data_addr = gc_prev_addr.with_offset(gc_ate.offset);
                    let moved =
                        Ate::new(self.fmt, gc_ate.key, self.data_wra.offset(), gc_ate.len);
                    self.block_move(data_addr, gc_ate.len as u32)?;
                    let slot = self.ate_wrt(&moved)?;
                    if let Some(cache) = &mut self.cache {
                        cache.insert(moved.key, slot);
                    }
                }
            }

            if gc_prev_addr == stop_addr {
                break;
            }
        }

        self.gc_finish(target.sector())
    }

    /// Records completion with a gc-done marker when a slot is free, then
    /// erases the reclaimed sector. Skipping the marker is safe: mount
    /// will simply redo the pass, and re-copying newest entries is a
    /// no-op.
    fn gc_finish(&mut self, sector: u32) -> Result<()> {
        if self.ate_wra >= self.data_wra.add(self.ate_size) {
            self.add_gc_done_ate()?;
        }
        self.erase_sector(sector)
    }
}
