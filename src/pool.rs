//! Blocks grouped into pools, each pool owning its free/used/priority/
//! quarantine lists exclusively.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::block::{Block, ListMembership};
use crate::error::{FtlError, Result};
use crate::types::BlockId;

/// One channel's worth of blocks. Owns every block in its range
/// exclusively; nothing outside this module mutates list membership.
pub struct Pool {
    pub index: usize,
    pub blocks_per_pool: usize,
    blocks: Vec<Mutex<Block>>,
    lists: Mutex<PoolLists>,
    nr_free_blocks: AtomicUsize,
    /// Gate serializing device-visible I/O to this pool.
    pub is_active: AtomicBool,
    pub waiting_bios: Mutex<VecDeque<crate::pipeline::QueuedRequest>>,
    /// Serializes GC victim selection within this pool; held only on the
    /// GC path, outermost of this pool's locks.
    pub gc_lock: tokio::sync::Mutex<()>,
}

struct PoolLists {
    free: VecDeque<BlockId>,
    used: VecDeque<BlockId>,
    /// Max-heap by `nr_invalid_pages`, ties broken by lower id; rebuilt
    /// lazily on GC cycle start rather than kept as a live heap, since
    /// mutation (pushing newly-full blocks) is far more frequent than
    /// victim selection.
    priority: Vec<BlockId>,
    quarantine: Vec<BlockId>,
}

impl Pool {
    pub fn new(index: usize, blocks_per_pool: usize, pages_per_block: usize, host_pages_per_flash_page: usize) -> Self {
        let blocks = (0..blocks_per_pool)
            .map(|local| Mutex::new(Block::new(local, index, pages_per_block, host_pages_per_flash_page)))
            .collect::<Vec<_>>();
        let free: VecDeque<BlockId> = (0..blocks_per_pool).collect();
        Self {
            index,
            blocks_per_pool,
            blocks,
            lists: Mutex::new(PoolLists {
                free,
                used: VecDeque::new(),
                priority: Vec::new(),
                quarantine: Vec::new(),
            }),
            nr_free_blocks: AtomicUsize::new(blocks_per_pool),
            is_active: AtomicBool::new(false),
            waiting_bios: Mutex::new(VecDeque::new()),
            gc_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn block(&self, local_id: BlockId) -> &Mutex<Block> {
        &self.blocks[local_id]
    }

    pub fn nr_free_blocks(&self) -> usize {
        self.nr_free_blocks.load(Ordering::Acquire)
    }

    pub fn nr_quarantined(&self) -> usize {
        self.lists.lock().quarantine.len()
    }

    /// Pops the head of `free`, appends to `used` and `priority`. `is_gc`
    /// does not change behavior here: GC is expected to have reserved its
    /// emergency block ahead of time, and this call is still allowed to
    /// fail for it.
    pub fn get_block(&self, is_gc: bool) -> Option<BlockId> {
        let id = {
            let mut lists = self.lists.lock();
            let id = lists.free.pop_front()?;
            lists.used.push_back(id);
            lists.priority.push(id);
            id
        };
        self.nr_free_blocks.fetch_sub(1, Ordering::AcqRel);
        {
            let mut block = self.blocks[id].lock();
            block.reset();
        }
        trace!(pool = self.index, block = id, is_gc, "pool_get_block");
        Some(id)
    }

    /// Requires the caller to have already erased the block and driven
    /// `ref_count` to zero.
    pub fn put_block(&self, id: BlockId) -> Result<()> {
        {
            let block = self.blocks[id].lock();
            if block.ref_count != 0 {
                return Err(FtlError::Integrity(format!(
                    "put_block: block {id} has outstanding ref_count {}",
                    block.ref_count
                )));
            }
            if block.gc_running {
                return Err(FtlError::Integrity(format!(
                    "put_block: block {id} still marked gc_running"
                )));
            }
            if !block.invalid_pages.all_set() {
                return Err(FtlError::Integrity(format!(
                    "put_block: block {id} has live pages remaining"
                )));
            }
        }
        {
            let mut lists = self.lists.lock();
            lists.used.retain(|&b| b != id);
            lists.priority.retain(|&b| b != id);
            // Tail insertion: naive round-robin wear leveling.
            lists.free.push_back(id);
        }
        self.nr_free_blocks.fetch_add(1, Ordering::AcqRel);
        {
            let mut block = self.blocks[id].lock();
            block.reset();
        }
        debug!(pool = self.index, block = id, "pool_put_block");
        Ok(())
    }

    /// Puts a victim back up for selection after a relocation read failure
    /// left it still full and partially invalid: retried on a later pass
    /// rather than lost.
    pub fn requeue_priority(&self, id: BlockId) {
        let mut lists = self.lists.lock();
        if !lists.priority.contains(&id) {
            lists.priority.push(id);
        }
    }

    /// Retires a block after an erase failure: removed from the
    /// allocatable population permanently.
    pub fn quarantine_block(&self, id: BlockId) {
        let mut lists = self.lists.lock();
        lists.used.retain(|&b| b != id);
        lists.priority.retain(|&b| b != id);
        lists.quarantine.push(id);
        tracing::warn!(pool = self.index, block = id, "block quarantined after erase failure");
    }

    /// Highest `nr_invalid_pages` first, ties broken by lower id. Blocks
    /// with zero invalid pages are never returned.
    pub fn select_victim(&self) -> Option<BlockId> {
        let candidates: Vec<BlockId> = {
            let lists = self.lists.lock();
            lists.priority.clone()
        };
        let mut best: Option<(usize, BlockId)> = None;
        for id in candidates {
            let nr_invalid = self.blocks[id].lock().nr_invalid_pages();
            if nr_invalid == 0 {
                continue;
            }
            best = match best {
                None => Some((nr_invalid, id)),
                Some((best_nr, best_id)) => {
                    if nr_invalid > best_nr || (nr_invalid == best_nr && id < best_id) {
                        Some((nr_invalid, id))
                    } else {
                        Some((best_nr, best_id))
                    }
                }
            };
        }
        if let Some((_, id)) = best {
            self.lists.lock().priority.retain(|&b| b != id);
        }
        best.map(|(_, id)| id)
    }

    pub fn membership(&self, id: BlockId) -> ListMembership {
        let lists = self.lists.lock();
        if lists.quarantine.contains(&id) {
            ListMembership::Quarantine
        } else if lists.free.contains(&id) {
            ListMembership::Free
        } else if lists.priority.contains(&id) {
            ListMembership::UsedPriority
        } else {
            ListMembership::Used
        }
    }
}

/// The static array of pools, immutable after construction.
pub struct PoolStore {
    pub pools: Vec<Pool>,
    pub blocks_per_pool: usize,
    pub pages_per_block: usize,
    pub host_pages_per_flash_page: usize,
}

impl PoolStore {
    pub fn new(nr_pools: usize, blocks_per_pool: usize, pages_per_block: usize, host_pages_per_flash_page: usize) -> Self {
        let pools = (0..nr_pools)
            .map(|i| Pool::new(i, blocks_per_pool, pages_per_block, host_pages_per_flash_page))
            .collect();
        Self {
            pools,
            blocks_per_pool,
            pages_per_block,
            host_pages_per_flash_page,
        }
    }

    pub fn nr_pools(&self) -> usize {
        self.pools.len()
    }

    /// Flat physical address of a block's first page.
    pub fn block_to_addr(&self, pool: usize, local_id: BlockId) -> u64 {
        let blocks_before = pool * self.blocks_per_pool + local_id;
        (blocks_before * self.pages_per_block * self.host_pages_per_flash_page) as u64
    }

    /// Decomposes a flat physical address into `(pool, local_block_id, slot)`.
    pub fn addr_to_block(&self, addr: u64) -> (usize, BlockId, usize) {
        let pages_per_block = (self.pages_per_block * self.host_pages_per_flash_page) as u64;
        let block_flat = addr / pages_per_block;
        let slot = (addr % pages_per_block) as usize;
        let pool = (block_flat as usize) / self.blocks_per_pool;
        let local = (block_flat as usize) % self.blocks_per_pool;
        (pool, local, slot)
    }
}
