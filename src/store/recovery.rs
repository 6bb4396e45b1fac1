//! Mount-time recovery.
//!
//! Re-derives every cursor and the lookup cache purely from log content:
//! finds the active sector by the unique closed-to-open transition, scans
//! out the true write positions, resumes an interrupted collection pass,
//! and discards torn trailing writes. Per-entry damage is repaired locally
//! by dropping the unreadable suffix of a chain; only a log with no
//! consistent sector boundary at all is reported as corruption.

use crate::addr::{align_up, Addr};
use crate::entry::MARKER_KEY;
use crate::error::{Error, Result};
use crate::flash::Flash;
use crate::store::Core;

impl<F: Flash> Core<F> {
    /// Rebuilds the in-memory state from the medium. Runs before any other
    /// operation and after [`clear_all`](Core::clear_all); idempotent with
    /// respect to what is on the medium.
    pub(crate) fn startup(&mut self) -> Result<()> {
        let sector_size = self.config.sector_size;
        let sector_count = self.config.sector_count;
        let ate_size = self.ate_size;
        let wire = self.fmt.size();

        // Step through the sectors looking for an open sector that follows
        // a closed one; that is where writing can resume.
        let mut addr = Addr::new(0, sector_size - ate_size);
        let mut closed_sectors = 0;
        let mut found_open = false;
        for i in 0..sector_count {
            addr = Addr::new(i, sector_size - ate_size);
            if !self.cmp_erased(addr, wire)? {
                // Closed sector.
                closed_sectors += 1;
                addr = addr.next_sector(sector_count);
                if self.cmp_erased(addr, wire)? {
                    found_open = true;
                    break;
                }
            }
        }

        if closed_sectors == sector_count {
            return Err(Error::Corrupt(
                "every sector carries a close marker".to_string(),
            ));
        }

        if !found_open {
            // No sector was ever closed. Writing resumes in the first
            // sector unless the last one already holds entries, which
            // happens when only two sectors exist.
            if self.cmp_erased(addr.sub(ate_size), wire)? {
                addr = addr.next_sector(sector_count);
            }
        }

        // `addr` points at the active sector's close slot; find its last
        // valid entry, then step downward to the first never-programmed
        // slot, deriving the data cursor from the entries passed on the
        // way.
        self.recover_last_ate(&mut addr)?;

        self.ate_wra = addr;
        self.data_wra = addr.sector_start();

        while self.ate_wra >= self.data_wra {
            let (last_ate, erased) = self.read_slot(self.ate_wra)?;
            if erased {
                break;
            }
            if self.ate_valid(&last_ate) {
                let extent = align_up(
                    last_ate.offset + last_ate.len as u32,
                    self.write_alignment,
                );
                let data_wra = self.ate_wra.sector_start().add(extent);
                if self.ate_wra == data_wra && last_ate.len > 0 {
                    // The value bytes run right up against their own
                    // record: a torn write. Drop the entry's claim instead
                    // of trusting it.
                    tracing::warn!(
                        key = last_ate.key,
                        "discarding inconsistent trailing entry"
                    );
                } else {
                    self.data_wra = data_wra;
                }
            }
            if self.ate_wra.offset() == 0 {
                return Err(Error::Corrupt(
                    "no free entry slot in the active sector".to_string(),
                ));
            }
            self.ate_wra = self.ate_wra.sub(ate_size);
        }

        // A non-erased sector right after the active one means a
        // collection pass was cut short somewhere between copying and
        // erasing.
        let next = self.ate_wra.sector_start().next_sector(sector_count);
        if !self.cmp_erased(next, sector_size)? {
            if self.find_gc_done_marker()? {
                tracing::info!(
                    sector = next.sector(),
                    "collection finished before power loss, erasing target"
                );
                self.erase_sector(next.sector())?;
            } else {
                // The copies in the active sector may be incomplete, but
                // the source entries still exist in the target: discard
                // the output and redo the pass.
                tracing::info!(
                    sector = self.ate_wra.sector(),
                    "collection interrupted, restarting"
                );
                self.erase_sector(self.ate_wra.sector())?;
                self.ate_wra = self
                    .ate_wra
                    .with_offset(sector_size - 2 * ate_size);
                self.data_wra = self.ate_wra.sector_start();
                self.gc()?;
            }
        } else {
            // A write may have finished its value bytes without its entry:
            // skip the data cursor past anything already programmed.
            while self.ate_wra > self.data_wra {
                let gap = self.ate_wra.offset() - self.data_wra.offset();
                if self.cmp_erased(self.data_wra, gap)? {
                    break;
                }
                self.data_wra = self.data_wra.add(self.write_alignment);
            }

            // A sector holding value bytes but not a single entry has
            // nothing recoverable in it; erasing also avoids ever closing
            // a sector without entries.
            if self.ate_wra.offset() + 2 * ate_size == sector_size
                && self.data_wra != self.ate_wra.sector_start()
            {
                self.erase_sector(self.ate_wra.sector())?;
                self.data_wra = self.ate_wra.sector_start();
            }
        }

        self.rebuild_cache()?;

        // Stamp a fresh active sector with a gc-done marker up front so a
        // later pass always has the slot it needs.
        if self.ate_wra.offset() == sector_size - 2 * ate_size {
            self.add_gc_done_ate()?;
        }

        tracing::info!(
            sector = self.ate_wra.sector(),
            entry_cursor = self.ate_wra.offset(),
            data_cursor = self.data_wra.offset(),
            "recovery complete"
        );
        Ok(())
    }

    /// Scans the active sector's already-written slots for a gc-done
    /// marker: a valid reserved-key, zero-length entry anywhere other than
    /// the close slot.
    fn find_gc_done_marker(&mut self) -> Result<bool> {
        let sector_size = self.config.sector_size;
        let mut addr = self.ate_wra.add(self.ate_size);
        while addr.offset() < sector_size - self.ate_size {
            let (ate, _) = self.read_slot(addr)?;
            if self.ate_valid(&ate) && ate.key == MARKER_KEY && ate.len == 0 {
                return Ok(true);
            }
            addr = addr.add(self.ate_size);
        }
        Ok(false)
    }

    /// Walks the whole log once from the write pointer back to itself,
    /// recording the first (newest) valid entry seen for each bucket.
    fn rebuild_cache(&mut self) -> Result<()> {
        if self.cache.is_none() {
            return Ok(());
        }
        if let Some(cache) = &mut self.cache {
            cache.clear();
        }

        let mut wlk_addr = self.ate_wra;
        loop {
            let at = wlk_addr;
            let ate = self.prev_ate(&mut wlk_addr)?;
            if ate.key != MARKER_KEY && self.ate_valid(&ate) {
                if let Some(cache) = &mut self.cache {
                    cache.fill(ate.key, at);
                }
            }
            if wlk_addr == self.ate_wra {
                break;
            }
        }
        Ok(())
    }

    /// Erases every sector. The store is unusable afterwards until it is
    /// mounted again.
    pub(crate) fn clear_all(&mut self) -> Result<()> {
        for sector in 0..self.config.sector_count {
            self.erase_sector(sector)?;
        }
        if let Some(cache) = &mut self.cache {
            cache.clear();
        }
        self.ready = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::config::StoreConfig;
    use crate::error::Error;
    use crate::flash::MemFlash;
    use crate::store::Store;

    fn value(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    fn read_vec(store: &Store<MemFlash>, key: u16) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; 4096];
        match store.read(key, &mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Some(buf)
            }
            Err(Error::NotFound) => None,
            Err(e) => panic!("read failed: {e}"),
        }
    }

    #[test]
    fn test_mount_fresh_store() {
        let flash = MemFlash::new(3 * 1024, 1);
        let store = Store::mount(flash, StoreConfig::new(1024, 3)).expect("mount failed");

        assert_eq!(read_vec(&store, 1), None);
        assert_eq!(store.free_space().unwrap(), 2 * (1024 - 8));
    }

    #[test]
    fn test_remount_preserves_entries() {
        let config = StoreConfig::new(1024, 3);
        let flash = MemFlash::new(3 * 1024, 1);
        let store = Store::mount(flash, config.clone()).unwrap();

        store.write(1, &value(1, 60)).unwrap();
        store.write(2, &value(2, 90)).unwrap();
        store.delete(1).unwrap();

        let store = Store::mount(store.into_flash(), config).unwrap();
        assert_eq!(read_vec(&store, 1), None);
        assert_eq!(read_vec(&store, 2), Some(value(2, 90)));
    }

    #[test]
    fn test_mount_after_rotation_into_last_sector() {
        // Two sectors: one close + collect cycle leaves sector 0 erased
        // and all data in the never-closed sector 1, which mount must
        // recognize as the active sector.
        let config = StoreConfig::new(1024, 2);
        let flash = MemFlash::new(2 * 1024, 1);
        let store = Store::mount(flash, config.clone()).unwrap();

        let mut expected: HashMap<u16, Vec<u8>> = HashMap::new();
        for i in 0..8u32 {
            let key = (i % 5) as u16;
            let v = value(i as u8, 120);
            store.write(key, &v).unwrap();
            expected.insert(key, v);
        }

        let store = Store::mount(store.into_flash(), config).unwrap();
        for (key, v) in &expected {
            assert_eq!(read_vec(&store, *key).as_ref(), Some(v));
        }
    }

    #[test]
    fn test_torn_close_marker_is_recovered() {
        let config = StoreConfig::new(1024, 3);
        let flash = MemFlash::new(3 * 1024, 1);
        let store = Store::mount(flash, config.clone()).unwrap();

        // Thirteen distinct keys fill sector 0; the fourteenth write
        // rotates into sector 1 and leaves sector 0 closed.
        let mut expected: HashMap<u16, Vec<u8>> = HashMap::new();
        for key in 0..14u16 {
            let v = value(key as u8, 64);
            store.write(key, &v).unwrap();
            expected.insert(key, v);
        }

        // Garble sector 0's close marker as an interrupted close would.
        let mut flash = store.into_flash();
        flash.raw_mut()[1016] = 0x00;
        flash.raw_mut()[1019] = 0x13;

        let store = Store::mount(flash, config).unwrap();
        for (key, v) in &expected {
            assert_eq!(read_vec(&store, *key).as_ref(), Some(v));
        }
    }

    #[test]
    fn test_all_sectors_closed_reports_corruption() {
        let mut flash = MemFlash::new(4 * 1024, 1);
        // A non-erased close slot in every sector leaves no place to
        // write; this is not a recoverable log.
        for sector in 0..4usize {
            flash.raw_mut()[sector * 1024 + 1016..sector * 1024 + 1024].fill(0x00);
        }

        match Store::mount(flash, StoreConfig::new(1024, 4)) {
            Err(Error::Corrupt(_)) => {}
            Err(e) => panic!("expected corruption, got: {e}"),
            Ok(_) => panic!("mount accepted a fully closed log"),
        }
    }

    #[test]
    fn test_torn_value_without_entry_is_discarded() {
        let config = StoreConfig::new(1024, 3);
        let flash = MemFlash::new(3 * 1024, 1);
        let store = Store::mount(flash, config.clone()).unwrap();
        store.write(1, &value(1, 20)).unwrap();

        // Cut power after half the value bytes: no entry ever commits
        // them.
        let mut flash = store.into_flash();
        flash.cut_power_after(10);
        let store = Store::mount(flash, config.clone()).unwrap();
        assert!(store.write(17, &value(9, 20)).is_err());

        let mut flash = store.into_flash();
        flash.restore_power();
        let store = Store::mount(flash, config).unwrap();

        assert_eq!(read_vec(&store, 1), Some(value(1, 20)));
        assert_eq!(read_vec(&store, 17), None);

        // The data cursor must have skipped the orphaned bytes.
        store.write(17, &value(9, 20)).unwrap();
        assert_eq!(read_vec(&store, 17), Some(value(9, 20)));
    }

    #[test]
    fn test_crash_during_append_is_atomic() {
        // Truncate the byte stream of one append at every boundary: the
        // entry must be fully visible or fully absent after remount,
        // never partial. 20 value bytes plus an 8-byte record.
        let config = StoreConfig::new(1024, 3);
        for cut in 0..=28usize {
            let flash = MemFlash::new(3 * 1024, 1);
            let store = Store::mount(flash, config.clone()).unwrap();
            store.write(1, &value(1, 20)).unwrap();

            let mut flash = store.into_flash();
            flash.cut_power_after(cut);
            let store = Store::mount(flash, config.clone()).unwrap();
            let write_result = store.write(17, &value(9, 20));
            assert_eq!(write_result.is_ok(), cut >= 28, "cut at {cut}");

            let mut flash = store.into_flash();
            flash.restore_power();
            let store = Store::mount(flash, config.clone()).unwrap();

            // Entries committed before the crash always survive.
            assert_eq!(read_vec(&store, 1), Some(value(1, 20)), "cut at {cut}");

            match read_vec(&store, 17) {
                Some(v) => {
                    assert!(cut >= 28, "partial write visible at cut {cut}");
                    assert_eq!(v, value(9, 20), "cut at {cut}");
                }
                None => assert!(cut < 28, "complete write lost at cut {cut}"),
            }
        }
    }

    #[test]
    fn test_crash_during_collection() {
        // Two sectors, five keys, sector 0 filled right up to the point
        // where the next write forces close + collect. Cut power at every
        // byte of that write: the close marker, the copied entries, the
        // gc-done marker, the erase and the entry itself all get hit.
        let config = StoreConfig::new(1024, 2);

        for cut in 0..=790usize {
            let flash = MemFlash::new(2 * 1024, 1);
            let store = Store::mount(flash, config.clone()).unwrap();

            let mut committed: HashMap<u16, Vec<u8>> = HashMap::new();
            for i in 0..7u32 {
                let key = (i % 5) as u16;
                let v = value(i as u8, 120);
                store.write(key, &v).unwrap();
                committed.insert(key, v);
            }

            let mut flash = store.into_flash();
            flash.cut_power_after(cut);
            let store = Store::mount(flash, config.clone()).unwrap();
            let triggering = value(7, 120);
            let wrote = store.write(2, &triggering).is_ok();

            let mut flash = store.into_flash();
            flash.restore_power();
            let store = Store::mount(flash, config.clone()).unwrap();

            // Every key reads its newest committed value; the triggering
            // write is visible exactly when it reported success.
            for (key, v) in &committed {
                let expect = if *key == 2 && wrote { &triggering } else { v };
                assert_eq!(
                    read_vec(&store, *key).as_ref(),
                    Some(expect),
                    "key {key} at cut {cut}"
                );
            }

            // The recovered store keeps working.
            store.write(9, &value(42, 16)).unwrap();
            assert_eq!(read_vec(&store, 9), Some(value(42, 16)));
        }
    }
}
