//! GPU driver abstraction
//!
//! The cache engine treats device memory through a small driver trait: slab
//! allocation, pinned host allocation, IPC handle export/import and raw
//! copies. A mock implementation backs the trait with host memory so the whole
//! stack runs without CUDA hardware; a real driver backend plugs in behind the
//! same trait.
//!
//! Driver state (live allocations, IPC namespace) is process-wide, so the mock
//! keeps it in a process-global singleton.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Size of an exported IPC handle in bytes (driver-defined, fixed).
pub const IPC_HANDLE_BYTES: usize = 64;

/// Opaque handle identifying a device allocation across processes on one
/// host. Distinct live allocations on the same device yield distinct handles;
/// querying one allocation twice yields bytewise-equal handles.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpcHandle(pub [u8; IPC_HANDLE_BYTES]);

// serde's derive macro only implements `Serialize`/`Deserialize` for arrays up
// to length 32, so a 64-byte array needs a manual impl that serializes the
// same way the derive would (tuple of bytes).
impl Serialize for IpcHandle {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeTuple;
        let mut seq = serializer.serialize_tuple(IPC_HANDLE_BYTES)?;
        for byte in &self.0 {
            seq.serialize_element(byte)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for IpcHandle {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct ArrayVisitor;

        impl<'de> serde::de::Visitor<'de> for ArrayVisitor {
            type Value = [u8; IPC_HANDLE_BYTES];

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "an array of {} bytes", IPC_HANDLE_BYTES)
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut arr = [0u8; IPC_HANDLE_BYTES];
                for (i, slot) in arr.iter_mut().enumerate() {
                    *slot = seq
                        .next_element()?
                        .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
                }
                Ok(arr)
            }
        }

        let arr = deserializer.deserialize_tuple(IPC_HANDLE_BYTES, ArrayVisitor)?;
        Ok(IpcHandle(arr))
    }
}

impl std::fmt::Debug for IpcHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IpcHandle({:02x}{:02x}{:02x}{:02x}..)", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// Where a tensor lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    Host,
    Cuda(u32),
}

/// A client tensor, viewed opaquely as a device byte range.
#[derive(Clone, Copy, Debug)]
pub struct TensorRef {
    pub addr: u64,
    pub len: u64,
    pub placement: Placement,
    pub contiguous: bool,
}

impl TensorRef {
    pub fn cuda(addr: u64, len: u64, device: u32) -> Self {
        Self { addr, len, placement: Placement::Cuda(device), contiguous: true }
    }

    pub fn host(addr: u64, len: u64) -> Self {
        Self { addr, len, placement: Placement::Host, contiguous: true }
    }
}

/// Driver operations the cache engine and client library need.
pub trait GpuDriver: Send + Sync {
    /// Allocate `len` bytes of device memory, returning the base address.
    fn alloc_device(&self, device: u32, len: usize) -> Result<u64>;

    /// Release a device allocation by its base address.
    fn free_device(&self, base: u64);

    /// Allocate pinned (page-locked) host memory for staging.
    fn alloc_pinned(&self, len: usize) -> Result<u64>;

    fn free_pinned(&self, base: u64);

    /// Export an IPC handle for the allocation starting at `base`.
    fn ipc_handle(&self, base: u64) -> Result<IpcHandle>;

    /// Map another process' allocation, returning its base address in this
    /// process.
    fn open_ipc(&self, handle: &IpcHandle) -> Result<u64>;

    /// Copy `len` bytes between device/pinned/host addresses.
    fn copy(&self, dst: u64, src: u64, len: usize) -> Result<()>;
}

/// Open the configured driver. Only the mock backend is compiled in here; a
/// CUDA build would return the real driver instead.
pub fn open_driver(use_mock: bool) -> Arc<dyn GpuDriver> {
    if !use_mock {
        tracing::warn!("real GPU driver not available in this build, using mock");
    }
    Arc::new(MockGpu)
}

/// Scoped opt-out of framework-pooled device allocations.
///
/// Frameworks with a caching device allocator hand back recycled base
/// addresses, and IPC handles are derived from the base address, so two
/// logically distinct tensors can export identical handles. Client code holds
/// this guard around allocations that will be shared over IPC; the previous
/// allocator mode is restored on drop, on every exit path.
pub struct DisablePooledAllocations {
    prev: bool,
}

impl DisablePooledAllocations {
    pub fn new() -> Self {
        let mut state = mock_state().lock();
        let prev = state.pooling;
        state.pooling = false;
        Self { prev }
    }
}

impl Default for DisablePooledAllocations {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DisablePooledAllocations {
    fn drop(&mut self) {
        mock_state().lock().pooling = self.prev;
    }
}

const MOCK_HANDLE_MAGIC: &[u8; 8] = b"IFSMOCK\0";

struct MockAllocation {
    buf: Box<[u8]>,
    device: u32,
    pinned: bool,
}

struct MockState {
    /// Live allocations keyed by base address.
    live: HashMap<u64, MockAllocation>,
    /// Freed device allocations retained for reuse while pooling is enabled,
    /// keyed by (device, len).
    pooled: HashMap<(u32, usize), Vec<u64>>,
    /// Whether freed allocations are recycled. Mirrors a framework caching
    /// allocator, including its IPC-handle collision hazard.
    pooling: bool,
}

fn mock_state() -> &'static Mutex<MockState> {
    static STATE: OnceLock<Mutex<MockState>> = OnceLock::new();
    STATE.get_or_init(|| {
        Mutex::new(MockState { live: HashMap::new(), pooled: HashMap::new(), pooling: true })
    })
}

/// Host-memory mock of the GPU driver.
///
/// All instances share one process-global allocation table, so a "server"
/// driver and a "client" driver in the same test process see each other's
/// allocations exactly the way two processes on one host share a device.
pub struct MockGpu;

impl MockGpu {
    fn derive_handle(base: u64, device: u32) -> IpcHandle {
        let mut bytes = [0u8; IPC_HANDLE_BYTES];
        bytes[..8].copy_from_slice(MOCK_HANDLE_MAGIC);
        bytes[8..12].copy_from_slice(&device.to_le_bytes());
        bytes[12..20].copy_from_slice(&base.to_le_bytes());
        bytes[20..28].copy_from_slice(&(base.rotate_left(17) ^ 0x9e37_79b9_7f4a_7c15).to_le_bytes());
        IpcHandle(bytes)
    }
}

impl GpuDriver for MockGpu {
    fn alloc_device(&self, device: u32, len: usize) -> Result<u64> {
        if len == 0 {
            return Err(Error::InvalidRange("zero-length device allocation".into()));
        }
        let mut state = mock_state().lock();
        if state.pooling {
            if let Some(base) = state.pooled.get_mut(&(device, len)).and_then(|bases| bases.pop()) {
                let alloc = state.live.get_mut(&base).expect("pooled base is live");
                alloc.buf.fill(0);
                return Ok(base);
            }
        }
        let buf = vec![0u8; len].into_boxed_slice();
        let base = buf.as_ptr() as u64;
        state.live.insert(base, MockAllocation { buf, device, pinned: false });
        Ok(base)
    }

    fn free_device(&self, base: u64) {
        let mut state = mock_state().lock();
        if state.pooling {
            if let Some(alloc) = state.live.get(&base) {
                let key = (alloc.device, alloc.buf.len());
                state.pooled.entry(key).or_default().push(base);
            }
            return;
        }
        state.live.remove(&base);
    }

    fn alloc_pinned(&self, len: usize) -> Result<u64> {
        if len == 0 {
            return Err(Error::InvalidRange("zero-length pinned allocation".into()));
        }
        let buf = vec![0u8; len].into_boxed_slice();
        let base = buf.as_ptr() as u64;
        mock_state().lock().live.insert(base, MockAllocation { buf, device: 0, pinned: true });
        Ok(base)
    }

    fn free_pinned(&self, base: u64) {
        mock_state().lock().live.remove(&base);
    }

    fn ipc_handle(&self, base: u64) -> Result<IpcHandle> {
        let state = mock_state().lock();
        let alloc = state
            .live
            .get(&base)
            .ok_or_else(|| Error::DeviceMismatch(format!("{base:#x} is not an allocation base")))?;
        if alloc.pinned {
            return Err(Error::DeviceMismatch("cannot export IPC handle for pinned memory".into()));
        }
        Ok(Self::derive_handle(base, alloc.device))
    }

    fn open_ipc(&self, handle: &IpcHandle) -> Result<u64> {
        if &handle.0[..8] != MOCK_HANDLE_MAGIC {
            return Err(Error::Transport("unrecognized IPC handle".into()));
        }
        let base = u64::from_le_bytes(handle.0[12..20].try_into().expect("fixed slice"));
        let state = mock_state().lock();
        if !state.live.contains_key(&base) {
            return Err(Error::Transport(format!("IPC handle maps no live allocation ({base:#x})")));
        }
        Ok(base)
    }

    fn copy(&self, dst: u64, src: u64, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        // The mock stands in for the copy engine; callers pass addresses they
        // obtained from this driver or from their own buffers.
        unsafe {
            std::ptr::copy(src as *const u8, dst as *mut u8, len);
        }
        Ok(())
    }
}

/// An owned device allocation, used by tests and the client CLI to stand in
/// for a framework tensor.
pub struct DeviceBuffer {
    driver: Arc<dyn GpuDriver>,
    base: u64,
    len: usize,
    device: u32,
}

impl DeviceBuffer {
    pub fn new(driver: Arc<dyn GpuDriver>, device: u32, len: usize) -> Result<Self> {
        let base = driver.alloc_device(device, len)?;
        Ok(Self { driver, base, len, device })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn tensor(&self) -> TensorRef {
        TensorRef::cuda(self.base, self.len as u64, self.device)
    }

    /// Upload host bytes into the buffer.
    pub fn fill_from(&self, data: &[u8]) -> Result<()> {
        if data.len() > self.len {
            return Err(Error::InvalidRange("fill exceeds buffer".into()));
        }
        self.driver.copy(self.base, data.as_ptr() as u64, data.len())
    }

    /// Download the buffer into host memory.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.len];
        self.driver.copy(out.as_mut_ptr() as u64, self.base, self.len)?;
        Ok(out)
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.driver.free_device(self.base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The pooling flag is process-global; tests that toggle or depend on it
    // take this lock so they do not interleave.
    fn pooling_lock() -> parking_lot::MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(())).lock()
    }

    #[test]
    fn distinct_allocations_have_distinct_handles() {
        let driver = open_driver(true);
        let a = driver.alloc_device(0, 4096).unwrap();
        let b = driver.alloc_device(0, 4096).unwrap();
        let ha = driver.ipc_handle(a).unwrap();
        let hb = driver.ipc_handle(b).unwrap();
        assert_ne!(ha, hb);
        // Repeated queries on one allocation agree bytewise.
        assert_eq!(ha, driver.ipc_handle(a).unwrap());
        driver.free_device(a);
        driver.free_device(b);
    }

    #[test]
    fn pooled_reuse_collides_and_guard_prevents_it() {
        let _serial = pooling_lock();
        let driver = open_driver(true);

        // With pooling on, a freed allocation is recycled at the same base, so
        // the next tensor of the same size exports the same handle bytes.
        let a = driver.alloc_device(7, 8192).unwrap();
        let ha = driver.ipc_handle(a).unwrap();
        driver.free_device(a);
        let b = driver.alloc_device(7, 8192).unwrap();
        assert_eq!(a, b);
        assert_eq!(ha, driver.ipc_handle(b).unwrap());
        driver.free_device(b);

        // Under the guard, allocations bypass the pool and handles stay
        // unique.
        let guard = DisablePooledAllocations::new();
        let c = driver.alloc_device(7, 8192).unwrap();
        let d = driver.alloc_device(7, 8192).unwrap();
        assert_ne!(driver.ipc_handle(c).unwrap(), driver.ipc_handle(d).unwrap());
        driver.free_device(c);
        driver.free_device(d);
        drop(guard);
    }

    #[test]
    fn open_ipc_round_trip() {
        let _serial = pooling_lock();
        let driver = open_driver(true);
        let _guard = DisablePooledAllocations::new();
        let base = driver.alloc_device(0, 256).unwrap();
        let handle = driver.ipc_handle(base).unwrap();
        assert_eq!(driver.open_ipc(&handle).unwrap(), base);
        driver.free_device(base);

        let bogus = IpcHandle([0u8; IPC_HANDLE_BYTES]);
        assert!(driver.open_ipc(&bogus).is_err());
    }

    #[test]
    fn device_buffer_round_trip() {
        let driver = open_driver(true);
        let buf = DeviceBuffer::new(driver, 0, 16).unwrap();
        buf.fill_from(&[9u8; 16]).unwrap();
        assert_eq!(buf.to_vec().unwrap(), vec![9u8; 16]);
    }
}
