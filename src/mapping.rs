//! Logical-to-physical mapping table, with an optional shadow table for
//! latency-mode placement.

use parking_lot::{Mutex, RwLock};

use crate::error::Result;
use crate::integrity_violation;
use crate::pool::PoolStore;
use crate::types::{LogAddr, PhysAddr, ADDR_EMPTY, ADDR_POISON};

/// A flat reference to a block: which pool, and which local block id
/// within that pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub pool: usize,
    pub local: usize,
}

/// A primary/shadow L->P entry. `block = None` means the logical address
/// has never been written.
#[derive(Debug, Clone, Copy)]
pub struct MapEntry {
    pub addr: PhysAddr,
    pub block: Option<BlockRef>,
}

impl MapEntry {
    pub const EMPTY: MapEntry = MapEntry {
        addr: ADDR_EMPTY,
        block: None,
    };

    pub fn is_empty(&self) -> bool {
        self.block.is_none()
    }
}

/// Which table an update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapTarget {
    Primary,
    Shadow,
    /// Invalidate and clear the shadow entry without writing a new page.
    TrimShadow,
}

pub struct MappingTable {
    primary: Vec<RwLock<MapEntry>>,
    reverse: Vec<RwLock<LogAddr>>,
    shadow: Option<Vec<RwLock<MapEntry>>>,
    /// Serializes multi-slot updates (locking order item 2: the global
    /// mapping/reverse lock).
    global_lock: Mutex<()>,
}

impl MappingTable {
    pub fn new(n: usize, with_shadow: bool) -> Self {
        Self {
            primary: (0..n).map(|_| RwLock::new(MapEntry::EMPTY)).collect(),
            reverse: (0..n).map(|_| RwLock::new(ADDR_POISON)).collect(),
            shadow: if with_shadow {
                Some((0..n).map(|_| RwLock::new(MapEntry::EMPTY)).collect())
            } else {
                None
            },
            global_lock: Mutex::new(()),
        }
    }

    fn slots(&self, target: MapTarget) -> &Vec<RwLock<MapEntry>> {
        match target {
            MapTarget::Primary => &self.primary,
            MapTarget::Shadow | MapTarget::TrimShadow => {
                self.shadow.as_ref().expect("shadow map not enabled")
            }
        }
    }

    /// Invalidates the previous page occupying `l`'s old mapping (if any),
    /// poisons its reverse entry, then installs the new mapping.
    pub fn update_map(&self, store: &PoolStore, l: LogAddr, p: PhysAddr, block: BlockRef, target: MapTarget) -> Result<()> {
        let _guard = self.global_lock.lock();
        let slots = self.slots(target);
        let entry_lock = &slots[l as usize];
        let mut entry = entry_lock.write();

        if let Some(old_block) = entry.block {
            self.invalidate_old(store, old_block, entry.addr)?;
        }

        if target == MapTarget::TrimShadow {
            *entry = MapEntry::EMPTY;
            return Ok(());
        }

        *entry = MapEntry {
            addr: p,
            block: Some(block),
        };
        drop(entry);
        *self.reverse[p as usize].write() = l;
        Ok(())
    }

    fn invalidate_old(&self, store: &PoolStore, old_block: BlockRef, old_addr: PhysAddr) -> Result<()> {
        let pool_ref = &store.pools[old_block.pool];
        let slot = {
            let base = store.block_to_addr(old_block.pool, old_block.local);
            (old_addr - base) as usize
        };
        {
            let mut block = pool_ref.block(old_block.local).lock();
            if block.invalid_pages.set(slot) {
                integrity_violation!(
                    "double invalidation: pool={} block={} slot={}",
                    old_block.pool,
                    old_block.local,
                    slot
                );
            }
        }
        *self.reverse[old_addr as usize].write() = ADDR_POISON;
        Ok(())
    }

    /// Spin-waits until the entry's block is not under active GC
    /// relocation, then takes a block reference. Returns the empty entry
    /// directly, without a reference, when unmapped.
    pub async fn lookup_ltop(&self, store: &PoolStore, l: LogAddr, target: MapTarget) -> MapEntry {
        loop {
            let entry = *self.slots(target)[l as usize].read();
            let Some(block_ref) = entry.block else {
                return entry;
            };
            let mut block = store.pools[block_ref.pool].block(block_ref.local).lock();
            if block.gc_running {
                drop(block);
                tokio::task::yield_now().await;
                continue;
            }
            block.ref_count += 1;
            return entry;
        }
    }

    /// Plain read; returns `ADDR_POISON` for stale physical pages.
    pub fn lookup_ptol(&self, p: PhysAddr) -> LogAddr {
        *self.reverse[p as usize].read()
    }

    pub fn primary_entry(&self, l: LogAddr) -> MapEntry {
        *self.primary[l as usize].read()
    }

    pub fn shadow_entry(&self, l: LogAddr) -> Option<MapEntry> {
        self.shadow.as_ref().map(|s| *s[l as usize].read())
    }

    pub fn has_shadow(&self) -> bool {
        self.shadow.is_some()
    }
}
