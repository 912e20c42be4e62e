//! RDMA transport abstraction
//!
//! The server registers its slabs and the staging ring as RDMA memory
//! regions; clients post one-sided READ/WRITE verbs against `{rkey, raddr}`
//! targets handed out in ACK frames. The trait has a mock implementation that
//! runs without RDMA hardware; a verbs-based backend plugs in behind the same
//! trait.
//!
//! Device contexts are process-wide, so the mock keeps its region registry in
//! a process-global singleton: regions registered by an in-process server are
//! visible to in-process clients the way a fabric is to its endpoints.

use crate::error::{Error, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// RDMA device identifier, e.g. `mlx5_0`.
    pub dev_name: Option<String>,
    /// Use the mock transport (no RDMA hardware required).
    pub use_mock: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { dev_name: None, use_mock: true }
    }
}

/// A pinned, DMA-registered memory region.
#[derive(Clone, Copy, Debug)]
pub struct RdmaRegion {
    pub addr: u64,
    pub len: u64,
    pub lkey: u32,
    pub rkey: u32,
}

/// One-sided RDMA operations.
pub trait RdmaTransport: Send + Sync {
    /// Pin and register `[addr, addr + len)` for remote access.
    fn register(&self, addr: u64, len: usize) -> Result<RdmaRegion>;

    fn deregister(&self, region: &RdmaRegion);

    /// RDMA WRITE: push `len` local bytes to `raddr` in the remote region
    /// named by `rkey`.
    fn post_write(&self, local: u64, len: usize, raddr: u64, rkey: u32) -> Result<()>;

    /// RDMA READ: pull `len` bytes from `raddr` into local memory.
    fn post_read(&self, local: u64, len: usize, raddr: u64, rkey: u32) -> Result<()>;
}

/// Open the configured transport.
pub fn open_transport(config: &TransportConfig) -> Result<Arc<dyn RdmaTransport>> {
    if !config.use_mock {
        tracing::warn!(
            dev = config.dev_name.as_deref().unwrap_or("<none>"),
            "verbs transport not available in this build, using mock"
        );
    }
    Ok(Arc::new(MockRdma::new()))
}

struct MockRegions {
    next_rkey: AtomicU32,
    regions: DashMap<u32, (u64, u64)>,
}

fn mock_regions() -> &'static MockRegions {
    static REGIONS: OnceLock<MockRegions> = OnceLock::new();
    REGIONS.get_or_init(|| MockRegions { next_rkey: AtomicU32::new(1), regions: DashMap::new() })
}

/// Loopback transport: verbs become bounds-checked memcpys against the
/// process-global region registry.
pub struct MockRdma;

impl MockRdma {
    fn new() -> Self {
        Self
    }

    fn target(&self, raddr: u64, len: usize, rkey: u32) -> Result<()> {
        let regions = mock_regions();
        let region = regions
            .regions
            .get(&rkey)
            .ok_or_else(|| Error::Transport(format!("unknown rkey {rkey}")))?;
        let (base, region_len) = *region;
        let end = raddr
            .checked_add(len as u64)
            .ok_or_else(|| Error::Transport("remote address overflow".into()))?;
        if raddr < base || end > base + region_len {
            return Err(Error::Transport(format!(
                "remote access [{raddr:#x}, {end:#x}) outside region rkey={rkey}"
            )));
        }
        Ok(())
    }
}

impl RdmaTransport for MockRdma {
    fn register(&self, addr: u64, len: usize) -> Result<RdmaRegion> {
        let regions = mock_regions();
        let key = regions.next_rkey.fetch_add(1, Ordering::Relaxed);
        regions.regions.insert(key, (addr, len as u64));
        tracing::debug!(rkey = key, addr, len, "registered mock memory region");
        Ok(RdmaRegion { addr, len: len as u64, lkey: key, rkey: key })
    }

    fn deregister(&self, region: &RdmaRegion) {
        mock_regions().regions.remove(&region.rkey);
    }

    fn post_write(&self, local: u64, len: usize, raddr: u64, rkey: u32) -> Result<()> {
        self.target(raddr, len, rkey)?;
        unsafe {
            std::ptr::copy(local as *const u8, raddr as *mut u8, len);
        }
        Ok(())
    }

    fn post_read(&self, local: u64, len: usize, raddr: u64, rkey: u32) -> Result<()> {
        self.target(raddr, len, rkey)?;
        unsafe {
            std::ptr::copy(raddr as *const u8, local as *mut u8, len);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_reach_registered_regions_only() {
        let transport = open_transport(&TransportConfig::default()).unwrap();

        let mut remote = vec![0u8; 64];
        let region = transport.register(remote.as_mut_ptr() as u64, remote.len()).unwrap();

        let payload = [5u8; 16];
        transport
            .post_write(payload.as_ptr() as u64, payload.len(), region.addr + 8, region.rkey)
            .unwrap();
        assert_eq!(&remote[8..24], &payload);

        let mut readback = [0u8; 16];
        transport
            .post_read(readback.as_mut_ptr() as u64, readback.len(), region.addr + 8, region.rkey)
            .unwrap();
        assert_eq!(readback, payload);

        // Out of bounds and unknown rkeys are verb failures.
        assert!(transport
            .post_write(payload.as_ptr() as u64, payload.len(), region.addr + 56, region.rkey)
            .is_err());
        assert!(transport.post_read(readback.as_mut_ptr() as u64, 1, region.addr, 0xdead).is_err());

        transport.deregister(&region);
        assert!(transport
            .post_write(payload.as_ptr() as u64, 1, region.addr, region.rkey)
            .is_err());
    }
}
