//! Submission-gate and timing-simulation machinery the engine drives.
//!
//! The actual read/write orchestration (which needs the mapping table,
//! append points and the active placement strategy together) lives on
//! `Engine` in `engine.rs`; this module only owns the per-pool gate and
//! the host-facing request validation ahead of it.

use std::time::Duration;

use tokio::sync::oneshot;
use tracing::trace;

use crate::pool::Pool;

/// `NR_PHY_IN_LOG`: host sectors per logical page. A 4096-byte host page
/// over 512-byte sectors is 8 sectors per page.
pub const NR_PHY_IN_LOG: u64 = 8;

/// Host page size in bytes.
pub const HOST_PAGE_SIZE: usize = 4096;

/// Below this remaining budget, skipping the delay is cheaper than
/// sleeping it off.
const MIN_DELAY: Duration = Duration::from_micros(50);

/// One request parked on a pool's `waiting_bios` queue. Woken by sending
/// through the channel once the gate transfers to it.
pub type QueuedRequest = oneshot::Sender<()>;

/// RAII guard for a pool's single-in-flight gate. Claims `is_active` on
/// construction (possibly after queuing behind other requests) and
/// transfers it to the next waiter, or releases it, on drop.
pub struct PoolGateGuard<'a> {
    pool: &'a Pool,
}

impl<'a> PoolGateGuard<'a> {
    /// Atomically claims the gate, or parks on `waiting_bios` until it is
    /// transferred to this caller. When `serialize` is false (POOL_SERIALIZE
    /// off), the gate is bypassed entirely and pool access is unserialized.
    pub async fn acquire(pool: &'a Pool, serialize: bool) -> Self {
        if !serialize {
            return Self { pool };
        }
        let claimed = pool
            .is_active
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::AcqRel,
                std::sync::atomic::Ordering::Acquire,
            )
            .is_ok();
        if !claimed {
            let (tx, rx) = oneshot::channel();
            pool.waiting_bios.lock().push_back(tx);
            trace!(pool = pool.index, "queued behind pool gate");
            let _ = rx.await;
        }
        Self { pool }
    }
}

impl Drop for PoolGateGuard<'_> {
    fn drop(&mut self) {
        let mut waiting = self.pool.waiting_bios.lock();
        if let Some(next) = waiting.pop_front() {
            let _ = next.send(());
        } else {
            self.pool.is_active.store(false, std::sync::atomic::Ordering::Release);
        }
    }
}

/// Busy-delays for the remainder of `target` beyond `elapsed`, skipping
/// the delay entirely when the remaining budget is below `MIN_DELAY`.
pub async fn enforce_timing(target: Duration, elapsed: Duration) {
    if let Some(remaining) = target.checked_sub(elapsed) {
        if remaining > MIN_DELAY {
            tokio::time::sleep(remaining).await;
        }
    }
}

/// Validates a request's sector against the logical address space
/// (`L = sector / NR_PHY_IN_LOG < N`), and that the transfer size is
/// exactly one host page.
pub fn validate_request(sector: u64, nr_bytes: usize, n: u64) -> crate::error::Result<u64> {
    if nr_bytes != HOST_PAGE_SIZE {
        return Err(crate::error::FtlError::Transient(format!(
            "request size {nr_bytes} is not one host page ({HOST_PAGE_SIZE} bytes)"
        )));
    }
    if sector % NR_PHY_IN_LOG != 0 {
        return Err(crate::error::FtlError::BadAddress { sector });
    }
    let l = sector / NR_PHY_IN_LOG;
    if l >= n {
        return Err(crate::error::FtlError::BadAddress { sector });
    }
    Ok(l)
}
