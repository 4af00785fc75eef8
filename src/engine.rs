//! Glues the pool store, mapping table, append points, hints and the
//! active placement strategy into the host-facing read/write surface.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock as SyncRwLock;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::append_point::ApRing;
use crate::config::{EngineConfig, TargetType};
use crate::device::{DeviceDriver, DeviceOp, DeviceRequest};
use crate::error::{FtlError, Result};
use crate::hints::{HintClass, HintIngestion, HintPayload, HintSource};
use crate::inflight::InflightRangeLock;
use crate::mapping::{BlockRef, MapTarget, MappingTable};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::pipeline::{enforce_timing, validate_request, PoolGateGuard, HOST_PAGE_SIZE};
use crate::pool::PoolStore;
use crate::strategy::{page_is_fast, StrategyKind, StrategyState};
use crate::types::{LogAddr, PhysAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteClass {
    Normal,
    Fast,
    Slow,
}

pub struct Engine {
    pub config: EngineConfig,
    pub store: PoolStore,
    pub mapping: MappingTable,
    pub aps: ApRing,
    pub hints: HintIngestion,
    pub device: Arc<dyn DeviceDriver>,
    pub inflight: InflightRangeLock,
    pub metrics: Metrics,
    strategy: StrategyState,
    gc_kick_tx: SyncRwLock<Option<UnboundedSender<usize>>>,
}

impl Engine {
    pub fn new(config: EngineConfig, device: Arc<dyn DeviceDriver>) -> Result<Arc<Self>> {
        config.validate()?;
        let store = PoolStore::new(
            config.nr_pools,
            config.nr_blks_per_pool,
            config.nr_pages_per_blk,
            config.host_pages_per_flash_page,
        );
        let n = config.total_logical_pages();
        let with_shadow = config.target_type == TargetType::Latency;
        let mapping = MappingTable::new(n, with_shadow);
        let aps = ApRing::new(config.nr_pools, config.nr_aps_per_pool);
        let kind = match config.target_type {
            TargetType::Default => StrategyKind::Default,
            TargetType::Swap => StrategyKind::Swap,
            TargetType::Latency => StrategyKind::Latency,
            TargetType::Pack => StrategyKind::Pack,
        };
        let strategy = StrategyState::new(kind, config.nr_pools);
        info!(
            ?kind,
            n,
            total_aps = config.total_aps(),
            has_shadow = mapping.has_shadow(),
            "engine constructed"
        );
        Ok(Arc::new(Self {
            config,
            store,
            mapping,
            aps,
            hints: HintIngestion::new(),
            device,
            inflight: InflightRangeLock::new(),
            metrics: Metrics::new(),
            strategy,
            gc_kick_tx: SyncRwLock::new(None),
        }))
    }

    pub fn strategy_kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn set_gc_kick(&self, tx: UnboundedSender<usize>) {
        *self.gc_kick_tx.write() = Some(tx);
    }

    fn gc_kick(&self, pool: usize) {
        if let Some(tx) = self.gc_kick_tx.read().as_ref() {
            let _ = tx.send(pool);
        }
    }

    pub fn submit_hint(&self, source: HintSource, payload: HintPayload) -> Result<()> {
        self.hints.submit(source, payload)
    }

    // ---------------------------------------------------------------
    // Host-facing entry points
    // ---------------------------------------------------------------

    /// Entry point for a host write request.
    pub async fn write(&self, sector: u64, data: &[u8]) -> Result<()> {
        let l = validate_request(sector, data.len(), self.store_n())?;
        let _range = self.inflight.lock(l, 1).await;
        self.place_and_write(l, data, false, None).await
    }

    /// Entry point for a host read request.
    pub async fn read(&self, sector: u64) -> Result<Bytes> {
        let l = validate_request(sector, HOST_PAGE_SIZE, self.store_n())?;
        let _range = self.inflight.lock(l, 1).await;
        self.read_rq(l).await
    }

    fn store_n(&self) -> u64 {
        self.config.total_logical_pages() as u64
    }

    // ---------------------------------------------------------------
    // Read path
    // ---------------------------------------------------------------

    async fn read_rq(&self, l: LogAddr) -> Result<Bytes> {
        let target = match self.strategy.kind() {
            StrategyKind::Latency => self.read_target_latency(l),
            _ => MapTarget::Primary,
        };
        let entry = self.mapping.lookup_ltop(&self.store, l, target).await;
        self.metrics.record_read();
        let Some(block_ref) = entry.block else {
            return Ok(Bytes::from(vec![0u8; HOST_PAGE_SIZE]));
        };
        let result = self.read_physical(block_ref.pool, entry.addr).await;
        {
            let mut block = self.store.pools[block_ref.pool].block(block_ref.local).lock();
            block.ref_count = block.ref_count.saturating_sub(1);
        }
        Ok(Bytes::from(result?))
    }

    /// Reads the shadow copy when the primary's pool is busy and a shadow
    /// entry exists, otherwise the primary.
    fn read_target_latency(&self, l: LogAddr) -> MapTarget {
        let primary = self.mapping.primary_entry(l);
        if let Some(block_ref) = primary.block {
            let busy = self.store.pools[block_ref.pool].is_active.load(Ordering::Acquire);
            if busy {
                if let Some(shadow) = self.mapping.shadow_entry(l) {
                    if !shadow.is_empty() {
                        return MapTarget::Shadow;
                    }
                }
            }
        }
        MapTarget::Primary
    }

    async fn read_physical(&self, pool: usize, addr: PhysAddr) -> Result<Vec<u8>> {
        let _gate = PoolGateGuard::acquire(&self.store.pools[pool], self.config.serialize_pool()).await;
        let start = Instant::now();
        let mut buf = vec![0u8; HOST_PAGE_SIZE];
        self.device
            .submit(DeviceRequest {
                op: DeviceOp::Read,
                addr,
                buf: &mut buf,
            })
            .await?;
        enforce_timing(Duration::from_micros(self.config.t_read_us), start.elapsed()).await;
        Ok(buf)
    }

    // ---------------------------------------------------------------
    // Write path / placement dispatch
    // ---------------------------------------------------------------

    /// Places and writes `data` for logical address `l`. `gc_target`, when
    /// `Some`, pins the mapping table this write should update (used by GC
    /// relocation so a latency-mode relocation updates only the table the
    /// victim page served); `None` means "host write default behavior".
    pub async fn place_and_write(
        &self,
        l: LogAddr,
        data: &[u8],
        is_gc: bool,
        gc_target: Option<MapTarget>,
    ) -> Result<()> {
        match self.strategy.kind() {
            StrategyKind::Default => self.write_default(l, data, is_gc, gc_target).await,
            StrategyKind::Swap => self.write_swap(l, data, is_gc, gc_target).await,
            StrategyKind::Latency => self.write_latency(l, data, is_gc, gc_target).await,
            StrategyKind::Pack => self.write_pack(l, data, is_gc, gc_target).await,
        }
    }

    async fn write_default(&self, l: LogAddr, data: &[u8], is_gc: bool, gc_target: Option<MapTarget>) -> Result<()> {
        let ap = self.aps.next_ap();
        let (addr, block_local) = ap.alloc(&self.store, is_gc)?;
        let block_ref = self.commit_write(ap.pool, addr, block_local, data, WriteClass::Normal).await?;
        self.mapping
            .update_map(&self.store, l, addr, block_ref, gc_target.unwrap_or(MapTarget::Primary))
    }

    /// Prefers a fast page when a swap hint covers `l` and the hinted
    /// inode's access class is not already sequential (video/image writes
    /// gain nothing from a fast page), or (during GC) the victim page
    /// itself was a fast slot.
    async fn write_swap(&self, l: LogAddr, data: &[u8], is_gc: bool, gc_target: Option<MapTarget>) -> Result<()> {
        let wants_fast = if is_gc {
            false // caller passes the old addr check via write_swap_gc
        } else if let Some(hint) = self.hints.find_hint(l, true, self.strategy_kind().engine_flag()) {
            !matches!(
                self.hints.class_for_inode(hint.inode),
                HintClass::VideoSlow | HintClass::ImageSlow
            )
        } else {
            false
        };
        if wants_fast {
            if let Some((addr, block_local, ap_idx)) =
                self.aps.alloc_fastest(&self.store, is_gc, |p, k| page_is_fast(p, k))
            {
                let pool = self.aps.get(ap_idx).pool;
                let block_ref = self.commit_write(pool, addr, block_local, data, WriteClass::Fast).await?;
                return self
                    .mapping
                    .update_map(&self.store, l, addr, block_ref, gc_target.unwrap_or(MapTarget::Primary));
            }
        }
        self.write_default(l, data, is_gc, gc_target).await
    }

    /// Swap-mode GC relocation entry: tries the fast allocator when the
    /// victim page itself occupied a fast slot, else falls back to the
    /// slow-write timing class via the default path.
    pub async fn write_swap_gc(&self, l: LogAddr, data: &[u8], old_addr: PhysAddr, gc_target: MapTarget) -> Result<()> {
        let pagenr = self.pagenr_of(old_addr);
        if page_is_fast(pagenr, self.store.pages_per_block) {
            if let Some((addr, block_local, ap_idx)) =
                self.aps.alloc_fastest(&self.store, true, |p, k| page_is_fast(p, k))
            {
                let pool = self.aps.get(ap_idx).pool;
                let block_ref = self.commit_write(pool, addr, block_local, data, WriteClass::Fast).await?;
                return self.mapping.update_map(&self.store, l, addr, block_ref, gc_target);
            }
        }
        let ap = self.aps.next_ap();
        let (addr, block_local) = ap.alloc(&self.store, true)?;
        let block_ref = self.commit_write(ap.pool, addr, block_local, data, WriteClass::Slow).await?;
        self.mapping.update_map(&self.store, l, addr, block_ref, gc_target)
    }

    fn pagenr_of(&self, addr: PhysAddr) -> usize {
        let (_, _, slot) = self.store.addr_to_block(addr);
        slot / self.store.host_pages_per_flash_page
    }

    /// Always places the primary copy; when a latency hint covers `l` and
    /// this is a host write (not a GC relocation), also places an
    /// independent shadow copy in a different pool.
    async fn write_latency(&self, l: LogAddr, data: &[u8], is_gc: bool, gc_target: Option<MapTarget>) -> Result<()> {
        let target = gc_target.unwrap_or(MapTarget::Primary);
        let ap = self.aps.next_ap();
        let (addr, block_local) = ap.alloc(&self.store, is_gc)?;
        let block_ref = self.commit_write(ap.pool, addr, block_local, data, WriteClass::Normal).await?;
        self.mapping.update_map(&self.store, l, addr, block_ref, target)?;

        if !is_gc && target == MapTarget::Primary {
            if self.hints.find_hint(l, true, self.strategy_kind().engine_flag()).is_some() {
                if let Some(shadow_ap) = self.aps.next_ap_excluding_pool(ap.pool) {
                    let (saddr, sblock_local) = shadow_ap.alloc(&self.store, false)?;
                    let sblock_ref = self
                        .commit_write(shadow_ap.pool, saddr, sblock_local, data, WriteClass::Normal)
                        .await?;
                    self.mapping
                        .update_map(&self.store, l, saddr, sblock_ref, MapTarget::Shadow)?;
                } else {
                    warn!("latency hint dropped: no alternate pool available for shadow write");
                }
            }
        }
        Ok(())
    }

    /// Finds (or claims) the hinted inode's pack AP; falls back to a
    /// non-pack AP when there is no pack hint or no pack AP available.
    async fn write_pack(&self, l: LogAddr, data: &[u8], is_gc: bool, gc_target: Option<MapTarget>) -> Result<()> {
        let pack_ap = if is_gc {
            None
        } else {
            self.hints
                .find_hint(l, true, self.strategy_kind().engine_flag())
                .and_then(|h| self.select_pack_ap(h.inode))
        };
        let ap = pack_ap.unwrap_or_else(|| self.aps.next_ap_skipping_pack(self.aps.aps_per_pool()));
        let (addr, block_local) = ap.alloc(&self.store, is_gc)?;
        let block_ref = self.commit_write(ap.pool, addr, block_local, data, WriteClass::Normal).await?;
        self.mapping
            .update_map(&self.store, l, addr, block_ref, gc_target.unwrap_or(MapTarget::Primary))
    }

    fn select_pack_ap(&self, inode: u64) -> Option<&crate::append_point::AppendPoint> {
        let aps_per_pool = self.aps.aps_per_pool();
        let nr_pools = self.store.nr_pools();
        let pack_index = |pool: usize| pool * aps_per_pool + aps_per_pool - 1;
        for pool in 0..nr_pools {
            if self.strategy.pack_assoc(pool)?.associated_inode() == Some(inode) {
                return Some(self.aps.get(pack_index(pool)));
            }
        }
        for pool in 0..nr_pools {
            let assoc = self.strategy.pack_assoc(pool)?;
            if assoc.is_available_for(inode) {
                assoc.touch(inode);
                return Some(self.aps.get(pack_index(pool)));
            }
        }
        None
    }

    // ---------------------------------------------------------------
    // Shared write plumbing
    // ---------------------------------------------------------------

    async fn commit_write(
        &self,
        pool: usize,
        addr: PhysAddr,
        block_local: usize,
        data: &[u8],
        class: WriteClass,
    ) -> Result<BlockRef> {
        let _gate = PoolGateGuard::acquire(&self.store.pools[pool], self.config.serialize_pool()).await;
        let start = Instant::now();
        let mut buf = data.to_vec();
        buf.resize(HOST_PAGE_SIZE, 0);
        self.device
            .submit(DeviceRequest {
                op: DeviceOp::Write,
                addr,
                buf: &mut buf,
            })
            .await?;
        let target = match class {
            WriteClass::Normal => Duration::from_micros(self.config.t_write_us),
            WriteClass::Fast => Duration::from_micros(self.config.t_write_us) / 2,
            WriteClass::Slow => Duration::from_micros(self.config.t_write_us) * 2,
        };
        enforce_timing(target, start.elapsed()).await;
        self.metrics.record_write();
        self.on_write_complete(pool, block_local);
        Ok(BlockRef { pool, local: block_local })
    }

    /// Counts this page against the block's completed-write total, and
    /// when the block is now fully written, kicks GC for its pool and,
    /// for pack mode, re-initializes the block's owning AP's association
    /// to empty.
    fn on_write_complete(&self, pool: usize, block_local: usize) {
        let (became_full, ap_local) = {
            let mut block = self.store.pools[pool].block(block_local).lock();
            block.data_cmnt_size += 1;
            let full = block.data_cmnt_size == block.invalid_pages.len();
            (full, block.ap)
        };
        if became_full {
            if let (Some(ap_local), StrategyKind::Pack) = (ap_local, self.strategy.kind()) {
                if self.aps.is_pack_ap_local(ap_local, self.aps.aps_per_pool()) {
                    if let Some(assoc) = self.strategy.pack_assoc(pool) {
                        assoc.clear();
                    }
                }
            }
            self.gc_kick(pool);
        }
    }

    // ---------------------------------------------------------------
    // GC relocation support (called from gc.rs)
    // ---------------------------------------------------------------

    /// Synchronous physical read used by GC to pull a victim page's data
    /// before relocating it: reads by address directly, not through the
    /// logical lookup/ref-counting path.
    pub async fn gc_read_physical(&self, pool: usize, addr: PhysAddr) -> Result<Vec<u8>> {
        self.read_physical(pool, addr).await
    }

    pub fn erase_block(&self, pool: usize, local: usize) -> PhysAddr {
        self.store.block_to_addr(pool, local)
    }
}
