//! Key lookup cache.
//!
//! A fixed-capacity, direct-mapped map from key to the address of its most
//! recently written entry. One slot per bucket, newest write wins on
//! collision. The cache is a best-effort accelerator and never
//! authoritative: a miss only means the reader falls back to walking the
//! log, and the whole table can be rebuilt from the log at any time.

use crate::addr::Addr;

pub struct LookupCache {
    slots: Vec<Option<Addr>>,
}

impl LookupCache {
    pub fn new(size: usize) -> Self {
        LookupCache {
            slots: vec![None; size],
        }
    }

    fn position(&self, key: u16) -> usize {
        // Fibonacci multiplicative hash; keys are small integers and tend
        // to be consecutive, which plain modulo would map to clustered
        // buckets.
        let h = (key as u32).wrapping_mul(0x9E37_79B9);
        (h >> 16) as usize % self.slots.len()
    }

    pub fn get(&self, key: u16) -> Option<Addr> {
        self.slots[self.position(key)]
    }

    pub fn insert(&mut self, key: u16, addr: Addr) {
        let pos = self.position(key);
        self.slots[pos] = Some(addr);
    }

    /// Sets a slot only when it is still vacant. The mount-time rebuild
    /// walks the log newest-first, so the first address seen per bucket is
    /// the one to keep.
    pub fn fill(&mut self, key: u16, addr: Addr) {
        let pos = self.position(key);
        if self.slots[pos].is_none() {
            self.slots[pos] = Some(addr);
        }
    }

    /// Drops every slot whose address points into the given sector. Called
    /// when that sector is erased.
    pub fn invalidate_sector(&mut self, sector: u32) {
        for slot in &mut self.slots {
            if slot.map(|a| a.sector()) == Some(sector) {
                *slot = None;
            }
        }
    }

    pub fn clear(&mut self) {
        self.slots.fill(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut cache = LookupCache::new(16);
        cache.insert(1, Addr::new(0, 64));
        cache.insert(2, Addr::new(1, 128));

        assert_eq!(cache.get(1), Some(Addr::new(0, 64)));
        assert_eq!(cache.get(2), Some(Addr::new(1, 128)));
        assert_eq!(cache.get(3), None);
    }

    #[test]
    fn test_newest_write_wins() {
        let mut cache = LookupCache::new(16);
        cache.insert(1, Addr::new(0, 64));
        cache.insert(1, Addr::new(2, 8));
        assert_eq!(cache.get(1), Some(Addr::new(2, 8)));
    }

    #[test]
    fn test_collision_overwrites() {
        // With a single slot every key collides; the last writer owns it.
        let mut cache = LookupCache::new(1);
        cache.insert(1, Addr::new(0, 64));
        cache.insert(9, Addr::new(1, 32));
        assert_eq!(cache.get(9), Some(Addr::new(1, 32)));
        // Key 1 now resolves to key 9's entry; readers verify against the
        // log, so a wrong hint is only a wasted walk start.
        assert_eq!(cache.get(1), Some(Addr::new(1, 32)));
    }

    #[test]
    fn test_invalidate_sector() {
        let mut cache = LookupCache::new(16);
        cache.insert(1, Addr::new(0, 64));
        cache.insert(2, Addr::new(1, 128));

        cache.invalidate_sector(0);
        assert_eq!(cache.get(1), None);
        assert_eq!(cache.get(2), Some(Addr::new(1, 128)));
    }

    #[test]
    fn test_fill_keeps_first_seen() {
        let mut cache = LookupCache::new(16);
        cache.fill(1, Addr::new(2, 8));
        cache.fill(1, Addr::new(0, 64));
        assert_eq!(cache.get(1), Some(Addr::new(2, 8)));
    }

    #[test]
    fn test_clear() {
        let mut cache = LookupCache::new(4);
        cache.insert(1, Addr::new(0, 64));
        cache.clear();
        assert_eq!(cache.get(1), None);
    }
}
