//! Public store surface.
//!
//! One mounted instance owns its cursors, cache and device exclusively;
//! a single mutex serializes every operation for its full duration,
//! including all device I/O. Instances are independent: two stores over
//! different regions of the same medium do not share any state.

use std::sync::{Mutex, MutexGuard};

use crate::addr::{align_up, Addr};
use crate::config::StoreConfig;
use crate::entry::{Ate, MARKER_KEY};
use crate::error::{Error, Result};
use crate::flash::Flash;
use crate::store::Core;

impl<F: Flash> Core<F> {
    /// Appends one value. Returns the number of bytes written: the value
    /// length on a real append, 0 when the write collapses to a no-op.
    pub(crate) fn write_inner(&mut self, key: u16, data: &[u8]) -> Result<usize> {
        if key == MARKER_KEY {
            return Err(Error::InvalidArgument("key is reserved"));
        }
        let len = data.len();
        let max = (self.config.sector_size - 4 * self.ate_size) as usize;
        if len > max.min(u16::MAX as usize) {
            return Err(Error::InvalidArgument(
                "value too large for the sector geometry",
            ));
        }

        // Find the newest existing entry for this key.
        let mut wlk_addr = self
            .cache
            .as_ref()
            .and_then(|c| c.get(key))
            .unwrap_or(self.ate_wra);
        let mut found: Option<(Ate, Addr)> = None;
        loop {
            let at = wlk_addr;
            let ate = self.prev_ate(&mut wlk_addr)?;
            if ate.key == key && self.ate_valid(&ate) {
                found = Some((ate, at));
                break;
            }
            if wlk_addr == self.ate_wra {
                break;
            }
        }

        match &found {
            Some((prev, at)) => {
                if len == 0 && prev.len == 0 {
                    // Key already carries a tombstone.
                    return Ok(0);
                }
                if len > 0 && prev.len as usize == len {
                    let stored = at.with_offset(prev.offset);
                    if self.block_cmp(stored, data)? {
                        // Identical rewrite consumes no space.
                        return Ok(0);
                    }
                }
            }
            None => {
                if len == 0 {
                    // Deleting what does not exist succeeds untouched.
                    return Ok(0);
                }
            }
        }

        let data_size = align_up(len as u32, self.write_alignment);
        let required = if len > 0 {
            data_size + self.ate_size
        } else {
            self.ate_size
        };

        // Offer every sector to the collector at most once before giving
        // up.
        let mut gc_count = 0;
        loop {
            if gc_count == self.config.sector_count {
                return Err(Error::NoSpace);
            }
            if self.ate_wra >= self.data_wra.add(required) {
                self.wrt_entry(key, data)?;
                break;
            }
            self.sector_close()?;
            self.gc()?;
            gc_count += 1;
        }
        Ok(len)
    }

    /// Programs the value bytes, then the entry that commits them.
    fn wrt_entry(&mut self, key: u16, data: &[u8]) -> Result<()> {
        let ate = Ate::new(self.fmt, key, self.data_wra.offset(), data.len() as u16);
        if !data.is_empty() {
            self.data_wrt(data)?;
        }
        let slot = self.ate_wrt(&ate)?;
        if let Some(cache) = &mut self.cache {
            cache.insert(key, slot);
        }
        Ok(())
    }

    /// Locates the `index`-th newest entry for `key` (0 = newest), copies
    /// as much of its value as fits and returns the stored length.
    pub(crate) fn read_hist_inner(
        &mut self,
        key: u16,
        buf: &mut [u8],
        index: u16,
    ) -> Result<usize> {
        if key == MARKER_KEY {
            return Err(Error::InvalidArgument("key is reserved"));
        }

        // The cache only ever knows the newest address; deeper history
        // always walks from the write pointer.
        let mut wlk_addr = if index == 0 {
            self.cache
                .as_ref()
                .and_then(|c| c.get(key))
                .unwrap_or(self.ate_wra)
        } else {
            self.ate_wra
        };

        let mut matches = 0u32;
        let mut found: Option<(Ate, Addr)> = None;
        loop {
            let at = wlk_addr;
            let ate = self.prev_ate(&mut wlk_addr)?;
            if ate.key == key && self.ate_valid(&ate) {
                if matches == index as u32 {
                    found = Some((ate, at));
                    break;
                }
                matches += 1;
            }
            if wlk_addr == self.ate_wra {
                break;
            }
        }

        let (ate, at) = found.ok_or(Error::NotFound)?;
        if ate.len == 0 {
            // Tombstone: the key is deleted at this point of history.
            return Err(Error::NotFound);
        }

        let n = (ate.len as usize).min(buf.len());
        let value_addr = at.with_offset(ate.offset);
        self.flash_rd(value_addr, &mut buf[..n])?;
        Ok(ate.len as usize)
    }

    /// Reclaimable capacity: every non-active sector minus the footprint
    /// of each entry that is still the newest, live version of its key.
    /// Space held by shadowed or tombstoned history counts as free.
    pub(crate) fn free_space_inner(&mut self) -> Result<usize> {
        let per_sector = (self.config.sector_size - self.ate_size) as u64;
        let mut free = (self.config.sector_count as u64 - 1) * per_sector;

        let mut step_addr = self.ate_wra;
        loop {
            let step_prev = step_addr;
            let step_ate = self.prev_ate(&mut step_addr)?;

            if self.ate_valid(&step_ate) && step_ate.key != MARKER_KEY && step_ate.len > 0 {
                // Charge the entry only when no newer copy exists.
                let mut wlk_addr = self.ate_wra;
                let mut wlk_prev;
                loop {
                    wlk_prev = wlk_addr;
                    let wlk_ate = self.prev_ate(&mut wlk_addr)?;
                    if wlk_ate.key == step_ate.key && self.ate_valid(&wlk_ate) {
                        break;
                    }
                    if wlk_addr == self.ate_wra {
                        break;
                    }
                }
                if wlk_prev == step_prev {
                    let footprint = (align_up(step_ate.len as u32, self.write_alignment)
                        + self.ate_size) as u64;
                    free = free.saturating_sub(footprint);
                }
            }

            if step_addr == self.ate_wra {
                break;
            }
        }
        Ok(free as usize)
    }
}

/// A mounted key/value store over one flash region.
pub struct Store<F: Flash> {
    inner: Mutex<Core<F>>,
}

impl<F: Flash> Store<F> {
    /// Validates the geometry, recovers the log state from the medium and
    /// returns a ready store.
    pub fn mount(flash: F, config: StoreConfig) -> Result<Self> {
        let mut core = Core::new(flash, config)?;
        core.startup()?;
        core.ready = true;

        tracing::info!(
            sector_size = core.config.sector_size,
            sector_count = core.config.sector_count,
            "store mounted"
        );
        Ok(Store {
            inner: Mutex::new(core),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Core<F>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Writes `data` under `key`. Returns the byte count written; a
    /// duplicate of the stored value writes nothing and returns 0.
    pub fn write(&self, key: u16, data: &[u8]) -> Result<usize> {
        let mut core = self.lock();
        if !core.ready {
            return Err(Error::NotReady);
        }
        core.write_inner(key, data)
    }

    /// Reads the newest value of `key` into `buf`, copying at most
    /// `buf.len()` bytes. Returns the stored length, which may exceed the
    /// copied amount.
    pub fn read(&self, key: u16, buf: &mut [u8]) -> Result<usize> {
        self.read_history(key, buf, 0)
    }

    /// Reads the `index`-th newest value of `key` (0 = newest). Historic
    /// copies survive until the collector reclaims their sector.
    pub fn read_history(&self, key: u16, buf: &mut [u8], index: u16) -> Result<usize> {
        let mut core = self.lock();
        if !core.ready {
            return Err(Error::NotReady);
        }
        core.read_hist_inner(key, buf, index)
    }

    /// Removes `key` by appending a tombstone. Deleting an absent or
    /// already-deleted key succeeds without writing.
    pub fn delete(&self, key: u16) -> Result<()> {
        let mut core = self.lock();
        if !core.ready {
            return Err(Error::NotReady);
        }
        core.write_inner(key, &[]).map(|_| ())
    }

    /// Bytes available for new live data after full reclamation.
    pub fn free_space(&self) -> Result<usize> {
        let mut core = self.lock();
        if !core.ready {
            return Err(Error::NotReady);
        }
        core.free_space_inner()
    }

    /// Erases every sector. The store refuses further operations until
    /// [`Store::remount`] runs.
    pub fn clear(&self) -> Result<()> {
        let mut core = self.lock();
        if !core.ready {
            return Err(Error::NotReady);
        }
        core.clear_all()
    }

    /// Re-runs the mount-time recovery, e.g. after [`Store::clear`].
    pub fn remount(&self) -> Result<()> {
        let mut core = self.lock();
        core.startup()?;
        core.ready = true;
        Ok(())
    }

    /// Consumes the store and hands the device back.
    pub fn into_flash(self) -> F {
        self.inner
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
            .flash
    }
}
