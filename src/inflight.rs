//! A sharded set of in-flight `(start, count)` logical ranges. Hosts lock
//! their single-page range; GC locks one page at a time around each
//! relocation, preventing a relocation from racing a concurrent host
//! write to the same L.

use std::collections::BTreeSet;

use parking_lot::Mutex;

const SHARDS: usize = 16;

struct Shard {
    ranges: Mutex<BTreeSet<(u64, u64)>>,
}

pub struct InflightRangeLock {
    shards: Vec<Shard>,
}

/// RAII guard releasing the range on drop.
pub struct RangeGuard<'a> {
    lock: &'a InflightRangeLock,
    start: u64,
    count: u64,
}

impl Drop for RangeGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock(self.start, self.count);
    }
}

impl InflightRangeLock {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Shard { ranges: Mutex::new(BTreeSet::new()) }).collect(),
        }
    }

    fn shard_for(&self, start: u64) -> &Shard {
        &self.shards[(start as usize) % SHARDS]
    }

    fn overlaps(existing: &BTreeSet<(u64, u64)>, start: u64, count: u64) -> bool {
        let end = start + count;
        existing.iter().any(|&(s, c)| s < end && start < s + c)
    }

    /// Inserts `(start, count)` after verifying no overlap, yielding to the
    /// cooperative scheduler while blocked rather than busy-spinning.
    pub async fn lock(&self, start: u64, count: u64) -> RangeGuard<'_> {
        let shard = self.shard_for(start);
        loop {
            {
                let mut ranges = shard.ranges.lock();
                if !Self::overlaps(&ranges, start, count) {
                    ranges.insert((start, count));
                    return RangeGuard {
                        lock: self,
                        start,
                        count,
                    };
                }
            }
            tokio::task::yield_now().await;
        }
    }

    fn unlock(&self, start: u64, count: u64) {
        self.shard_for(start).ranges.lock().remove(&(start, count));
    }
}

impl Default for InflightRangeLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn non_overlapping_ranges_both_succeed() {
        let lock = InflightRangeLock::new();
        let _a = lock.lock(0, 1).await;
        let _b = lock.lock(5, 1).await;
    }

    #[tokio::test]
    async fn overlapping_range_blocks_until_release() {
        let lock = InflightRangeLock::new();
        let guard = lock.lock(10, 2).await;
        drop(guard);
        // After drop, the same range can be reacquired immediately.
        let _again = lock.lock(10, 2).await;
    }
}
