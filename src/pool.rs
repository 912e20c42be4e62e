//! Device memory pool
//!
//! The server owns all cached bytes: large device slabs are allocated through
//! the driver and carved into fixed-size blocks. Keys bind to extents inside
//! those blocks; releases return blocks to a per-slab free list.

use crate::error::{Error, Result};
use crate::gpu::GpuDriver;
use std::collections::BTreeSet;
use std::sync::Arc;

/// A region within a slab. `length` never exceeds the pool's block size and
/// the region lies wholly inside one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    pub slab: u32,
    pub offset: u64,
    pub length: u32,
}

/// Immutable description of a slab, shared with the handle cache and the RDMA
/// registrar.
#[derive(Clone, Copy, Debug)]
pub struct SlabInfo {
    pub id: u32,
    pub device: u32,
    pub base: u64,
    pub len: usize,
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// CUDA device the slabs live on.
    pub device: u32,
    /// Bytes per slab; rounded down to a multiple of `block_bytes`.
    pub slab_bytes: usize,
    /// Fixed block size, uniform across the pool.
    pub block_bytes: usize,
    /// Upper bound on total slab bytes.
    pub max_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            device: 0,
            slab_bytes: 64 * 1024 * 1024,
            block_bytes: 256 * 1024,
            max_bytes: 1024 * 1024 * 1024,
        }
    }
}

struct Slab {
    base: u64,
    len: usize,
    /// Free block indices, ordered so first-fit picks the lowest offset.
    free: BTreeSet<u32>,
}

/// Slab-backed block allocator. Callers serialize access behind the engine's
/// pool lock.
pub struct DevicePool {
    driver: Arc<dyn GpuDriver>,
    config: PoolConfig,
    /// Creation order; slab id is the index.
    slabs: Vec<Slab>,
}

impl DevicePool {
    pub fn new(driver: Arc<dyn GpuDriver>, config: PoolConfig) -> Result<Self> {
        if config.block_bytes == 0 {
            return Err(Error::InvalidRange("block size must be non-zero".into()));
        }
        let slab_bytes = config.slab_bytes - config.slab_bytes % config.block_bytes;
        if slab_bytes == 0 {
            return Err(Error::InvalidRange(format!(
                "slab size {} below block size {}",
                config.slab_bytes, config.block_bytes
            )));
        }
        let config = PoolConfig { slab_bytes, ..config };
        Ok(Self { driver, config, slabs: Vec::new() })
    }

    pub fn block_bytes(&self) -> usize {
        self.config.block_bytes
    }

    /// Allocate `n` blocks, each carrying an extent of `length` bytes.
    ///
    /// First-fit: earliest slab, lowest offset. Grows by whole slabs up to the
    /// configured maximum; on failure the free lists are left untouched.
    pub fn alloc_blocks(&mut self, n: usize, length: u32) -> Result<Vec<Extent>> {
        if n == 0 {
            return Err(Error::InvalidRange("empty block request".into()));
        }
        if length == 0 || length as usize > self.config.block_bytes {
            return Err(Error::InvalidRange(format!(
                "extent length {} outside (0, {}]",
                length, self.config.block_bytes
            )));
        }

        loop {
            let free: usize = self.slabs.iter().map(|s| s.free.len()).sum();
            if free >= n {
                break;
            }
            self.grow()?;
        }

        let mut extents = Vec::with_capacity(n);
        let mut remaining = n;
        for (slab_id, slab) in self.slabs.iter_mut().enumerate() {
            while remaining > 0 {
                let Some(&block) = slab.free.iter().next() else { break };
                slab.free.remove(&block);
                extents.push(Extent {
                    slab: slab_id as u32,
                    offset: block as u64 * self.config.block_bytes as u64,
                    length,
                });
                remaining -= 1;
            }
            if remaining == 0 {
                break;
            }
        }
        debug_assert_eq!(remaining, 0);
        Ok(extents)
    }

    /// Return blocks to the free list. Double-free is the caller's contract to
    /// avoid; it is not detected here.
    pub fn free_blocks(&mut self, extents: &[Extent]) {
        for extent in extents {
            let Some(slab) = self.slabs.get_mut(extent.slab as usize) else {
                continue;
            };
            slab.free.insert((extent.offset / self.config.block_bytes as u64) as u32);
        }
    }

    /// Device address of an extent's first byte.
    pub fn extent_addr(&self, extent: &Extent) -> Option<u64> {
        self.slabs.get(extent.slab as usize).map(|s| s.base + extent.offset)
    }

    pub fn slabs(&self) -> Vec<SlabInfo> {
        self.slabs
            .iter()
            .enumerate()
            .map(|(id, s)| SlabInfo {
                id: id as u32,
                device: self.config.device,
                base: s.base,
                len: s.len,
            })
            .collect()
    }

    pub fn free_block_count(&self) -> usize {
        self.slabs.iter().map(|s| s.free.len()).sum()
    }

    pub fn reserved_bytes(&self) -> usize {
        self.slabs.len() * self.config.slab_bytes
    }

    fn grow(&mut self) -> Result<()> {
        let reserved = self.reserved_bytes();
        if reserved + self.config.slab_bytes > self.config.max_bytes {
            return Err(Error::PoolExhausted);
        }
        let base = self
            .driver
            .alloc_device(self.config.device, self.config.slab_bytes)
            .map_err(|_| Error::PoolExhausted)?;
        let blocks = (self.config.slab_bytes / self.config.block_bytes) as u32;
        self.slabs.push(Slab {
            base,
            len: self.config.slab_bytes,
            free: (0..blocks).collect(),
        });
        tracing::info!(
            slab = self.slabs.len() - 1,
            bytes = self.config.slab_bytes,
            blocks,
            "created device slab"
        );
        Ok(())
    }
}

impl Drop for DevicePool {
    fn drop(&mut self) {
        for slab in &self.slabs {
            self.driver.free_device(slab.base);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::open_driver;

    fn pool(slab_bytes: usize, block_bytes: usize, max_bytes: usize) -> DevicePool {
        let config = PoolConfig { device: 0, slab_bytes, block_bytes, max_bytes };
        DevicePool::new(open_driver(true), config).unwrap()
    }

    #[test]
    fn first_fit_lowest_offset() {
        let mut p = pool(4096, 1024, 8192);
        let a = p.alloc_blocks(3, 1024).unwrap();
        assert_eq!(a[0], Extent { slab: 0, offset: 0, length: 1024 });
        assert_eq!(a[1].offset, 1024);
        assert_eq!(a[2].offset, 2048);

        // Freeing the middle block makes it the next pick.
        p.free_blocks(&a[1..2]);
        let b = p.alloc_blocks(1, 512).unwrap();
        assert_eq!(b[0].slab, 0);
        assert_eq!(b[0].offset, 1024);
        assert_eq!(b[0].length, 512);
    }

    #[test]
    fn grows_across_slabs_in_creation_order() {
        let mut p = pool(2048, 1024, 8192);
        let a = p.alloc_blocks(3, 1024).unwrap();
        assert_eq!(a.iter().map(|e| e.slab).collect::<Vec<_>>(), vec![0, 0, 1]);
        assert_eq!(p.reserved_bytes(), 4096);
    }

    #[test]
    fn exhaustion_leaves_free_lists_untouched() {
        let mut p = pool(2048, 1024, 2048);
        p.alloc_blocks(1, 1024).unwrap();
        assert_eq!(p.free_block_count(), 1);
        assert!(matches!(p.alloc_blocks(2, 1024), Err(Error::PoolExhausted)));
        assert_eq!(p.free_block_count(), 1);
    }

    #[test]
    fn rejects_oversized_extents() {
        let mut p = pool(4096, 1024, 4096);
        assert!(matches!(p.alloc_blocks(1, 1025), Err(Error::InvalidRange(_))));
        assert!(matches!(p.alloc_blocks(0, 512), Err(Error::InvalidRange(_))));
    }
}
