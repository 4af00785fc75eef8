//! Pluggable placement strategies, modeled as a tagged variant rather
//! than a heap-allocated trait object: the hook set is a closed set of
//! four variants and the dispatch is a single match in the write path.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::Flags;
use crate::mapping::MapTarget;

/// How long a pack AP's inode association survives without a matching
/// write before it is eligible for reuse by another inode.
pub const AP_DISASSOCIATE_TIME: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Default,
    Swap,
    Latency,
    Pack,
}

impl StrategyKind {
    pub fn engine_flag(self) -> u32 {
        match self {
            StrategyKind::Default => Flags::ENGINE_NONE,
            StrategyKind::Swap => Flags::ENGINE_SWAP,
            StrategyKind::Latency => Flags::ENGINE_LATENCY,
            StrategyKind::Pack => Flags::ENGINE_PACK,
        }
    }
}

/// Per-pack-AP association state.
pub struct PackAssoc {
    state: Mutex<Option<(u64, Instant)>>,
}

impl PackAssoc {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }

    /// True if this AP is free to take a new inode: unassociated, or its
    /// last use is older than `AP_DISASSOCIATE_TIME`.
    pub fn is_available_for(&self, inode: u64) -> bool {
        match *self.state.lock() {
            None => true,
            Some((assoc_inode, last_use)) => {
                assoc_inode == inode || last_use.elapsed() >= AP_DISASSOCIATE_TIME
            }
        }
    }

    pub fn associated_inode(&self) -> Option<u64> {
        self.state.lock().map(|(inode, _)| inode)
    }

    pub fn touch(&self, inode: u64) {
        *self.state.lock() = Some((inode, Instant::now()));
    }

    /// Re-initializes the association to empty when the pack AP's current
    /// block fills.
    pub fn clear(&self) {
        *self.state.lock() = None;
    }
}

impl Default for PackAssoc {
    fn default() -> Self {
        Self::new()
    }
}

/// Strategy-specific state beyond what the engine already holds. The
/// default and swap variants need none; latency needs only the shadow
/// map the engine already constructs; pack needs one association slot per
/// pool (the pool's last AP).
pub enum StrategyState {
    Default,
    Swap,
    Latency,
    Pack { assoc_by_pool: Vec<PackAssoc> },
}

impl StrategyState {
    pub fn new(kind: StrategyKind, nr_pools: usize) -> Self {
        match kind {
            StrategyKind::Default => StrategyState::Default,
            StrategyKind::Swap => StrategyState::Swap,
            StrategyKind::Latency => StrategyState::Latency,
            StrategyKind::Pack => StrategyState::Pack {
                assoc_by_pool: (0..nr_pools).map(|_| PackAssoc::new()).collect(),
            },
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            StrategyState::Default => StrategyKind::Default,
            StrategyState::Swap => StrategyKind::Swap,
            StrategyState::Latency => StrategyKind::Latency,
            StrategyState::Pack { .. } => StrategyKind::Pack,
        }
    }

    pub fn pack_assoc(&self, pool: usize) -> Option<&PackAssoc> {
        match self {
            StrategyState::Pack { assoc_by_pool } => assoc_by_pool.get(pool),
            _ => None,
        }
    }
}

/// Pages `{0..3}` are fast, the last 4 are slow, and within each group of
/// 4 in between, offsets 2 and 3 are fast, 0 and 1 are slow.
pub fn page_is_fast(pagenr: usize, pages_per_block: usize) -> bool {
    if pagenr < 4 {
        return true;
    }
    if pagenr >= pages_per_block.saturating_sub(4) {
        return false;
    }
    let rel = pagenr - 4;
    matches!(rel % 4, 2 | 3)
}

/// Which mapping target(s) a GC relocation of a latency-mode page should
/// update, determined by comparing the victim's physical address against
/// both the primary and shadow maps for its logical owner.
pub fn latency_gc_target(primary_addr: u64, shadow_addr: Option<u64>, old_addr: u64) -> MapTarget {
    if shadow_addr == Some(old_addr) {
        MapTarget::Shadow
    } else if primary_addr == old_addr {
        MapTarget::Primary
    } else {
        // Stale copy with no current owner in either table: treat as a
        // shadow trim so relocation does not resurrect a dead mapping.
        MapTarget::TrimShadow
    }
}
