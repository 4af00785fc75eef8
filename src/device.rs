//! The device driver interface this engine consumes.
//!
//! Only `identify`, `submit` and `erase_block` are consumed; everything
//! else about the underlying device (bad-block tables, wear counters,
//! physical timing beyond the three class constants) is out of scope.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::trace;

use crate::error::{FtlError, Result};
use crate::types::PhysAddr;

#[derive(Debug, Clone, Copy)]
pub struct ChannelGeometry {
    pub laddr_begin: PhysAddr,
    pub laddr_end: PhysAddr,
    pub gran_erase: usize,
    pub gran_read: usize,
    pub gran_write: usize,
    pub t_r: Duration,
    pub t_w: Duration,
    pub t_e: Duration,
}

#[derive(Debug, Clone)]
pub struct DeviceGeometry {
    pub channels: Vec<ChannelGeometry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOp {
    Read,
    Write,
    Erase,
}

pub struct DeviceRequest<'a> {
    pub op: DeviceOp,
    pub addr: PhysAddr,
    /// Write payload, or a destination buffer for reads.
    pub buf: &'a mut [u8],
}

#[derive(Debug, Clone, Copy)]
pub struct DeviceCompletion {
    pub elapsed: Duration,
}

/// The consumed driver surface. A production FTL would talk to a real NAND
/// controller here; the engine only ever calls through this trait.
#[async_trait::async_trait]
pub trait DeviceDriver: Send + Sync {
    fn identify(&self) -> DeviceGeometry;
    async fn submit(&self, req: DeviceRequest<'_>) -> Result<DeviceCompletion>;
    async fn erase_block(&self, block_addr: PhysAddr) -> Result<()>;
}

/// In-memory device used by the demo binary and the test suite. Backs
/// every physical page with a byte buffer and honors the configured
/// per-class timing so the pipeline's delay-to-target logic has
/// something real to measure against.
pub struct SimDevice {
    page_size: usize,
    pages: RwLock<Vec<Vec<u8>>>,
    geometry: DeviceGeometry,
    reads: AtomicU64,
    writes: AtomicU64,
    erases: AtomicU64,
}

impl SimDevice {
    pub fn new(nr_pages: usize, page_size: usize, geometry: DeviceGeometry) -> Self {
        Self {
            page_size,
            pages: RwLock::new(vec![vec![0u8; page_size]; nr_pages]),
            geometry,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            erases: AtomicU64::new(0),
        }
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn erases(&self) -> u64 {
        self.erases.load(Ordering::Relaxed)
    }

    fn channel(&self) -> &ChannelGeometry {
        // Single simulated channel; per-channel timing split across real
        // pools is modeled at the pool layer, not here.
        &self.geometry.channels[0]
    }
}

#[async_trait::async_trait]
impl DeviceDriver for SimDevice {
    fn identify(&self) -> DeviceGeometry {
        self.geometry.clone()
    }

    async fn submit(&self, req: DeviceRequest<'_>) -> Result<DeviceCompletion> {
        let start = std::time::Instant::now();
        let chan = *self.channel();
        let idx = req.addr as usize;
        match req.op {
            DeviceOp::Read => {
                {
                    let pages = self.pages.read();
                    let page = pages.get(idx).ok_or_else(|| {
                        FtlError::Device(format!("read out of range: addr={}", req.addr))
                    })?;
                    let n = req.buf.len().min(self.page_size);
                    req.buf[..n].copy_from_slice(&page[..n]);
                }
                self.reads.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(chan.t_r).await;
            }
            DeviceOp::Write => {
                {
                    let mut pages = self.pages.write();
                    let page = pages.get_mut(idx).ok_or_else(|| {
                        FtlError::Device(format!("write out of range: addr={}", req.addr))
                    })?;
                    let n = req.buf.len().min(self.page_size);
                    page[..n].copy_from_slice(&req.buf[..n]);
                }
                self.writes.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(chan.t_w).await;
            }
            DeviceOp::Erase => {
                unreachable!("erase goes through erase_block");
            }
        }
        trace!(addr = req.addr, op = ?req.op, "device submit complete");
        Ok(DeviceCompletion {
            elapsed: start.elapsed(),
        })
    }

    async fn erase_block(&self, block_addr: PhysAddr) -> Result<()> {
        let chan = *self.channel();
        let gran = chan.gran_erase as PhysAddr;
        let start = block_addr;
        let end = (start + gran).min(self.pages.read().len() as PhysAddr);
        {
            let mut pages = self.pages.write();
            for p in &mut pages[start as usize..end as usize] {
                p.fill(0);
            }
        }
        self.erases.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(chan.t_e).await;
        Ok(())
    }
}
