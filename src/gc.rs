//! Background and on-demand garbage collection: victim selection,
//! relocation and block reclamation.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::{FtlError, Result};
use crate::mapping::MapTarget;
use crate::strategy::{latency_gc_target, StrategyKind};
use crate::types::ADDR_POISON;

/// Owns the background GC task: a periodic timer plus an on-demand kick
/// channel, cancelled cleanly at shutdown.
pub struct GcController {
    handle: tokio::task::JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl GcController {
    pub fn spawn(engine: Arc<Engine>) -> Self {
        let (kick_tx, mut kick_rx) = mpsc::unbounded_channel::<usize>();
        engine.set_gc_kick(kick_tx);
        let shutdown = Arc::new(Notify::new());
        let shutdown_wait = shutdown.clone();
        let gc_time = Duration::from_millis(engine.config.gc_time_ms.max(1));

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(gc_time);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        for pool in 0..engine.store.nr_pools() {
                            if let Err(e) = run_gc_cycle(&engine, pool).await {
                                warn!(pool, error = %e, "gc cycle failed");
                            }
                        }
                    }
                    kicked = kick_rx.recv() => {
                        if let Some(pool) = kicked {
                            if let Err(e) = run_gc_cycle(&engine, pool).await {
                                warn!(pool, error = %e, "gc cycle failed");
                            }
                        }
                    }
                    _ = shutdown_wait.notified() => break,
                }
            }
            info!("gc worker stopped");
        });

        Self { handle, shutdown }
    }

    /// Stops the timer and waits for the in-flight cycle (and every
    /// per-block relocation job it queued) to drain.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        let _ = self.handle.await;
    }
}

/// One GC cycle for a single pool: selects victims while the pool is
/// below its free-block watermark, relocating each in turn. Returns the
/// number of blocks actually reclaimed.
pub async fn run_gc_cycle(engine: &Engine, pool_idx: usize) -> Result<usize> {
    let pool = &engine.store.pools[pool_idx];
    let _gc_guard = pool.gc_lock.lock().await;

    for local in 0..engine.config.nr_aps_per_pool {
        let idx = pool_idx * engine.config.nr_aps_per_pool + local;
        if let Err(e) = engine.aps.get(idx).ensure_emergency_block(&engine.store) {
            warn!(pool = pool_idx, ap = idx, error = %e, "failed to reserve gc emergency block");
        }
    }

    let need = pool.blocks_per_pool / engine.config.gc_limit_inverse.max(1);
    let mut reclaimed = 0usize;
    while need > pool.nr_free_blocks() {
        let Some(victim) = pool.select_victim() else {
            break;
        };
        reclaimed += relocate_and_reclaim(engine, pool_idx, victim).await?;
    }
    if reclaimed > 0 {
        engine.metrics.gc_cycles.fetch_add(1, Ordering::Relaxed);
        info!(pool = pool_idx, reclaimed, quarantined = pool.nr_quarantined(), "gc cycle reclaimed blocks");
    }
    Ok(reclaimed)
}

async fn relocate_and_reclaim(engine: &Engine, pool_idx: usize, victim_local: usize) -> Result<usize> {
    {
        let mut block = engine.store.pools[pool_idx].block(victim_local).lock();
        if !block.is_full() {
            return Err(FtlError::Integrity(format!(
                "gc victim pool={pool_idx} block={victim_local} is not full"
            )));
        }
        block.gc_running = true;
    }

    // Relocation runs once outstanding ref_count reaches zero.
    loop {
        let rc = engine.store.pools[pool_idx].block(victim_local).lock().ref_count;
        if rc == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }

    let base = engine.store.block_to_addr(pool_idx, victim_local);
    let slots = engine.store.pages_per_block * engine.store.host_pages_per_flash_page;
    let mut any_failure = false;

    for slot in 0..slots {
        let already_invalid = engine.store.pools[pool_idx].block(victim_local).lock().invalid_pages.get(slot);
        if already_invalid {
            continue;
        }
        let old_addr = base + slot as u64;
        let l = engine.mapping.lookup_ptol(old_addr);
        if l == ADDR_POISON {
            continue;
        }

        let _range = engine.inflight.lock(l, 1).await;
        // A concurrent write may have invalidated this slot between our
        // first check and taking the range lock; re-check before reading.
        let still_live = !engine.store.pools[pool_idx].block(victim_local).lock().invalid_pages.get(slot);
        if !still_live {
            continue;
        }

        let data = match engine.gc_read_physical(pool_idx, old_addr).await {
            Ok(data) => data,
            Err(e) => {
                engine.metrics.relocation_read_failures.fetch_add(1, Ordering::Relaxed);
                warn!(pool = pool_idx, block = victim_local, slot, error = %e, "relocation read failed, retrying next pass");
                any_failure = true;
                continue;
            }
        };

        let gc_target = if engine.strategy_kind() == StrategyKind::Latency {
            let primary = engine.mapping.primary_entry(l);
            let shadow = engine.mapping.shadow_entry(l);
            latency_gc_target(primary.addr, shadow.map(|s| s.addr), old_addr)
        } else {
            MapTarget::Primary
        };

        let write_result = if engine.strategy_kind() == StrategyKind::Swap {
            engine.write_swap_gc(l, &data, old_addr, gc_target).await
        } else {
            engine.place_and_write(l, &data, true, Some(gc_target)).await
        };
        if let Err(e) = write_result {
            warn!(pool = pool_idx, block = victim_local, slot, error = %e, "gc relocation write failed");
            return Err(e);
        }
        engine.metrics.pages_relocated.fetch_add(1, Ordering::Relaxed);
    }

    if any_failure {
        engine.store.pools[pool_idx].block(victim_local).lock().gc_running = false;
        engine.store.pools[pool_idx].requeue_priority(victim_local);
        return Ok(0);
    }

    let erase_addr = engine.erase_block(pool_idx, victim_local);
    match engine.device.erase_block(erase_addr).await {
        Ok(()) => {
            engine.store.pools[pool_idx].block(victim_local).lock().gc_running = false;
            engine.store.pools[pool_idx].put_block(victim_local)?;
            engine.metrics.blocks_reclaimed.fetch_add(1, Ordering::Relaxed);
            Ok(1)
        }
        Err(e) => {
            engine.metrics.erase_failures.fetch_add(1, Ordering::Relaxed);
            warn!(pool = pool_idx, block = victim_local, error = %e, "erase failed, quarantining block");
            engine.store.pools[pool_idx].block(victim_local).lock().gc_running = false;
            engine.store.pools[pool_idx].quarantine_block(victim_local);
            Ok(0)
        }
    }
}
