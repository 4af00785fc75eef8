//! Tracks each writer's current block and hands out the next physical
//! address within it, rolling over to a fresh block on exhaustion.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::trace;

use crate::error::{FtlError, Result};
use crate::pool::PoolStore;
use crate::types::{BlockId, PhysAddr};

/// A logical writer owning a current block. `cur` is always `Some` once
/// the AP has written its first page; `None` only in the brief window
/// before the first allocation.
pub struct AppendPoint {
    pub pool: usize,
    pub local_index: usize,
    cur: parking_lot::Mutex<Option<BlockId>>,
    /// Reserved emergency block for GC, acquired ahead of time so a GC
    /// relocation write never itself triggers GC.
    emergency: parking_lot::Mutex<Option<BlockId>>,
}

impl AppendPoint {
    pub fn new(pool: usize, local_index: usize) -> Self {
        Self {
            pool,
            local_index,
            cur: parking_lot::Mutex::new(None),
            emergency: parking_lot::Mutex::new(None),
        }
    }

    pub fn current_block(&self) -> Option<BlockId> {
        *self.cur.lock()
    }

    /// Allocates the next page within `block`, subdividing flash pages
    /// into `H` host-page offsets.
    pub fn alloc_phys_addr(store: &PoolStore, pool: usize, block_id: BlockId) -> Option<PhysAddr> {
        let pool_ref = &store.pools[pool];
        let mut block = pool_ref.block(block_id).lock();
        if block.is_full() {
            return None;
        }
        let base = store.block_to_addr(pool, block_id);
        let h = store.host_pages_per_flash_page;
        let addr = base + (block.next_page * h + block.next_offset) as PhysAddr;
        block.next_offset += 1;
        if block.next_offset == h {
            block.next_offset = 0;
            block.next_page += 1;
        }
        Some(addr)
    }

    /// Tries the current block first; on exhaustion, acquires a fresh
    /// block from the pool and retries.
    pub fn alloc(&self, store: &PoolStore, is_gc: bool) -> Result<(PhysAddr, BlockId)> {
        loop {
            let cur = *self.cur.lock();
            if let Some(block_id) = cur {
                if let Some(addr) = Self::alloc_phys_addr(store, self.pool, block_id) {
                    return Ok((addr, block_id));
                }
                // Current block retired: release the back-reference
                // before installing a new one.
                store.pools[self.pool].block(block_id).lock().ap = None;
                *self.cur.lock() = None;
            }
            let fresh = if is_gc {
                self.take_emergency()
                    .or_else(|| store.pools[self.pool].get_block(true))
            } else {
                store.pools[self.pool].get_block(false)
            };
            let fresh = fresh.ok_or(FtlError::OutOfSpace)?;
            store.pools[self.pool].block(fresh).lock().ap = Some(self.local_index);
            *self.cur.lock() = Some(fresh);
            trace!(pool = self.pool, ap = self.local_index, block = fresh, "installed new current block");
        }
    }

    fn take_emergency(&self) -> Option<BlockId> {
        self.emergency.lock().take()
    }

    /// Reserves (or replenishes) this AP's emergency GC block ahead of
    /// relocation work, so a GC write never itself needs to run GC.
    pub fn ensure_emergency_block(&self, store: &PoolStore) -> Result<()> {
        let mut slot = self.emergency.lock();
        if slot.is_none() {
            *slot = Some(store.pools[self.pool].get_block(true).ok_or(FtlError::OutOfSpace)?);
        }
        Ok(())
    }
}

/// Round-robin AP selector shared across concurrent writers, kept on the
/// store instance rather than as module-level state.
pub struct ApRing {
    aps: Vec<AppendPoint>,
    next: AtomicUsize,
    aps_per_pool: usize,
}

impl ApRing {
    pub fn new(nr_pools: usize, aps_per_pool: usize) -> Self {
        let mut aps = Vec::with_capacity(nr_pools * aps_per_pool);
        for pool in 0..nr_pools {
            for local in 0..aps_per_pool {
                aps.push(AppendPoint::new(pool, local));
            }
        }
        Self {
            aps,
            next: AtomicUsize::new(0),
            aps_per_pool,
        }
    }

    pub fn len(&self) -> usize {
        self.aps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aps.is_empty()
    }

    pub fn aps_per_pool(&self) -> usize {
        self.aps_per_pool
    }

    pub fn get(&self, index: usize) -> &AppendPoint {
        &self.aps[index]
    }

    /// True when `local_index` is the last AP of its pool, the one
    /// reserved for pack-hinted writes.
    pub fn is_pack_ap_local(&self, local_index: usize, aps_per_pool: usize) -> bool {
        local_index == aps_per_pool - 1
    }

    /// Next AP in round-robin order, shared across concurrent writers.
    pub fn next_ap(&self) -> &AppendPoint {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.aps.len();
        &self.aps[idx]
    }

    /// Round-robin, but skipping every pool's reserved pack AP: non-pack
    /// allocations never land on it.
    pub fn next_ap_skipping_pack(&self, aps_per_pool: usize) -> &AppendPoint {
        loop {
            let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.aps.len();
            if !self.is_pack_ap_local(self.aps[idx].local_index, aps_per_pool) || aps_per_pool == 1 {
                return &self.aps[idx];
            }
        }
    }

    /// Round-robin, restricted to APs outside `exclude_pool`, so a shadow
    /// copy always lands in a distinct pool from its primary.
    pub fn next_ap_excluding_pool(&self, exclude_pool: usize) -> Option<&AppendPoint> {
        for offset in 0..self.aps.len() {
            let idx = (self.next.fetch_add(1, Ordering::Relaxed) + offset) % self.aps.len();
            if self.aps[idx].pool != exclude_pool {
                return Some(&self.aps[idx]);
            }
        }
        None
    }

    /// Scans APs round-robin for one whose current page satisfies
    /// `predicate`, returning `None` so the caller can fall back to the
    /// default allocator.
    pub fn alloc_fastest(
        &self,
        store: &PoolStore,
        is_gc: bool,
        predicate: impl Fn(usize, usize) -> bool,
    ) -> Option<(PhysAddr, BlockId, usize)> {
        let start = self.next.fetch_add(1, Ordering::Relaxed) % self.aps.len();
        for offset in 0..self.aps.len() {
            let idx = (start + offset) % self.aps.len();
            let ap = &self.aps[idx];
            let Some(cur) = ap.current_block() else {
                continue;
            };
            let pool_ref = &store.pools[ap.pool];
            let next_page = pool_ref.block(cur).lock().next_page;
            if predicate(next_page, store.pages_per_block) {
                if let Ok((addr, block)) = ap.alloc(store, is_gc) {
                    return Some((addr, block, idx));
                }
            }
        }
        None
    }
}
