//! BAR1 staging pipeline
//!
//! GPUs with a small BAR1 aperture cannot take peer DMA straight into device
//! memory, so staged transfers bounce through a pinned host ring instead. The
//! ring is one RDMA-registered allocation partitioned into fixed windows; a
//! window is granted to one in-flight chunk at a time and returns to the free
//! list only after that chunk's device copy and network transfer have both
//! completed. `acquire` suspends when every window is in flight, which is the
//! protocol's only source of back-pressure.

use crate::error::{Error, Result};
use crate::gpu::GpuDriver;
use crate::transport::{RdmaRegion, RdmaTransport};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Clone, Debug)]
pub struct StagingConfig {
    /// Total pinned ring size.
    pub ring_bytes: usize,
    /// Bytes per window; one chunk occupies one window.
    pub window_bytes: usize,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self { ring_bytes: 32 * 1024 * 1024, window_bytes: 4 * 1024 * 1024 }
    }
}

/// A granted ring window.
#[derive(Debug)]
pub struct Window {
    pub index: usize,
    pub addr: u64,
}

pub struct StagingRing {
    driver: Arc<dyn GpuDriver>,
    transport: Arc<dyn RdmaTransport>,
    base: u64,
    window_bytes: usize,
    region: RdmaRegion,
    permits: Semaphore,
    free: Mutex<VecDeque<usize>>,
}

impl StagingRing {
    pub fn new(
        driver: Arc<dyn GpuDriver>,
        transport: Arc<dyn RdmaTransport>,
        config: &StagingConfig,
    ) -> Result<Self> {
        if config.window_bytes == 0 || config.ring_bytes < config.window_bytes {
            return Err(Error::InvalidRange(format!(
                "staging ring {}B cannot hold a {}B window",
                config.ring_bytes, config.window_bytes
            )));
        }
        let count = config.ring_bytes / config.window_bytes;
        let len = count * config.window_bytes;
        let base = driver.alloc_pinned(len)?;
        let region = transport.register(base, len)?;
        tracing::info!(windows = count, window_bytes = config.window_bytes, "pinned staging ring ready");
        Ok(Self {
            driver,
            transport,
            base,
            window_bytes: config.window_bytes,
            region,
            permits: Semaphore::new(count),
            free: Mutex::new((0..count).collect()),
        })
    }

    pub fn window_bytes(&self) -> usize {
        self.window_bytes
    }

    pub fn rkey(&self) -> u32 {
        self.region.rkey
    }

    /// Take a free window, suspending while the ring is full.
    pub async fn acquire(&self) -> Window {
        let permit = self.permits.acquire().await.expect("ring semaphore never closes");
        permit.forget();
        let index = self.free.lock().pop_front().expect("permit guarantees a free window");
        Window { index, addr: self.base + (index * self.window_bytes) as u64 }
    }

    /// Return a window after its chunk fully completed.
    pub fn release(&self, window: Window) {
        self.free.lock().push_back(window.index);
        self.permits.add_permits(1);
    }
}

impl Drop for StagingRing {
    fn drop(&mut self) {
        self.transport.deregister(&self.region);
        self.driver.free_pinned(self.base);
    }
}

/// One staged chunk: up to `window_bytes` of a block's logical range, mapped
/// onto the device segments backing it. A chunk crosses extent boundaries
/// when a block spans extents, hence the segment list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagedChunk {
    pub segments: SmallVec<[(u64, u32); 2]>,
    pub len: u32,
}

/// Split each block's device segments into window-sized chunks, preserving
/// the order of the extent list. The client derives the identical split from
/// `(block_size, window_bytes)` alone, so both sides walk the same plan.
pub fn plan_chunks(entries: &[Vec<(u64, u32)>], window_bytes: u32) -> Vec<StagedChunk> {
    let mut plan = Vec::new();
    for segments in entries {
        let mut current = StagedChunk { segments: SmallVec::new(), len: 0 };
        for &(mut addr, mut len) in segments {
            while len > 0 {
                let take = len.min(window_bytes - current.len);
                current.segments.push((addr, take));
                current.len += take;
                addr += take as u64;
                len -= take;
                if current.len == window_bytes {
                    plan.push(std::mem::replace(
                        &mut current,
                        StagedChunk { segments: SmallVec::new(), len: 0 },
                    ));
                }
            }
        }
        if current.len > 0 {
            plan.push(current);
        }
    }
    plan
}

/// Client-side view of the same split: `(offset within block, len)` spans.
pub fn chunk_spans(block_size: u32, window_bytes: u32) -> impl Iterator<Item = (u32, u32)> {
    (0..block_size).step_by(window_bytes.max(1) as usize).map(move |off| {
        (off, window_bytes.min(block_size - off))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::open_driver;
    use crate::transport::{open_transport, TransportConfig};
    use std::time::Duration;

    #[test]
    fn chunk_plans_agree_across_sides() {
        // One 1024-byte block backed by two 512-byte segments, 256-byte
        // windows: four chunks, the middle ones crossing no boundary.
        let entries = vec![vec![(0x1000, 512u32), (0x9000, 512u32)]];
        let plan = plan_chunks(&entries, 256);
        assert_eq!(plan.len(), 4);
        assert_eq!(plan[0].segments.as_slice(), &[(0x1000u64, 256u32)]);
        assert_eq!(plan[1].segments[0], (0x1100, 256));
        assert_eq!(plan[2].segments[0], (0x9000, 256));
        assert!(plan.iter().all(|c| c.len == 256));

        let spans: Vec<_> = chunk_spans(1024, 256).collect();
        assert_eq!(spans, vec![(0, 256), (256, 256), (512, 256), (768, 256)]);
        assert_eq!(spans.len(), plan.len());
    }

    #[test]
    fn chunk_crossing_segment_boundary() {
        let entries = vec![vec![(0x1000, 300u32), (0x9000, 212u32)]];
        let plan = plan_chunks(&entries, 512);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].len, 512);
        assert_eq!(plan[0].segments.as_slice(), &[(0x1000u64, 300u32), (0x9000u64, 212u32)]);
    }

    #[tokio::test]
    async fn ring_applies_back_pressure() {
        let driver = open_driver(true);
        let transport = open_transport(&TransportConfig::default()).unwrap();
        let config = StagingConfig { ring_bytes: 512, window_bytes: 256 };
        let ring = Arc::new(StagingRing::new(driver, transport, &config).unwrap());

        let w0 = ring.acquire().await;
        let w1 = ring.acquire().await;
        assert_ne!(w0.index, w1.index);

        // Third acquire must block until a window is released.
        let pending = tokio::spawn({
            let ring = ring.clone();
            async move { ring.acquire().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        let freed = w0.index;
        ring.release(w0);
        let w2 = pending.await.unwrap();
        assert_eq!(w2.index, freed);
        ring.release(w1);
        ring.release(w2);
    }
}
