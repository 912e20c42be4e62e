//! Cache server
//!
//! The engine owns the device pool, the key index and the per-slab IPC/RDMA
//! metadata. The event loop accepts framed connections and runs one
//! cooperative task per connection; all data movement happens on the client
//! side (IPC copies or one-sided verbs) or on the copy engine (staged
//! window transfers), so command handling stays cheap.

use crate::error::{Error, Result};
use crate::gpu::{open_driver, GpuDriver, IpcHandle};
use crate::index::{ExtentList, KeyIndex};
use crate::pool::{DevicePool, Extent, PoolConfig, SlabInfo};
use crate::protocol::{
    read_frame, write_frame, Ack, AckData, BatchRequest, Command, IpcTarget, OpCode, RdmaTarget,
    TransferMode, MAX_KEY_BYTES,
};
use crate::staging::{plan_chunks, StagedChunk, StagingConfig, StagingRing, Window};
use crate::transport::{open_transport, RdmaRegion, RdmaTransport, TransportConfig};
use dashmap::DashMap;
use parking_lot::Mutex;
use smallvec::smallvec;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// TCP listen address for the command channel.
    pub listen_addr: String,
    /// CUDA device backing the pool.
    pub device_index: u32,
    /// RDMA device identifier; `None` disables the RDMA data path.
    pub dev_name: Option<String>,
    /// Upper bound on total slab bytes.
    pub pool_max_bytes: usize,
    /// Bytes per slab.
    pub slab_bytes: usize,
    /// Fixed block size; also the cap on a request's `block_size`.
    pub block_bytes: usize,
    /// Batches larger than this are forced onto the staged path.
    pub bar1_budget_bytes: usize,
    pub staging: StagingConfig,
    /// Mock driver/transport backends (no hardware required).
    pub use_mock: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:22345".to_string(),
            device_index: 0,
            dev_name: None,
            pool_max_bytes: 1024 * 1024 * 1024,
            slab_bytes: 64 * 1024 * 1024,
            block_bytes: 256 * 1024,
            bar1_budget_bytes: 64 * 1024 * 1024,
            staging: StagingConfig::default(),
            use_mock: true,
        }
    }
}

/// Shared server state: pool, index and per-slab transfer metadata.
pub struct CacheEngine {
    config: ServerConfig,
    driver: Arc<dyn GpuDriver>,
    transport: Option<Arc<dyn RdmaTransport>>,
    /// Acquired strictly after the index lock when both are needed.
    pool: Mutex<DevicePool>,
    index: KeyIndex,
    /// Memoised IPC handle per slab, queried on first LOCAL_GPU use.
    handles: DashMap<u32, IpcHandle>,
    /// RDMA registration per slab, created when the slab is first observed.
    regions: DashMap<u32, RdmaRegion>,
    /// Immutable slab descriptions.
    slabs: DashMap<u32, SlabInfo>,
    staging: Option<StagingRing>,
}

impl CacheEngine {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let driver = open_driver(config.use_mock);
        let transport = config
            .dev_name
            .as_ref()
            .map(|_| {
                open_transport(&TransportConfig {
                    dev_name: config.dev_name.clone(),
                    use_mock: config.use_mock,
                })
            })
            .transpose()?;
        let pool = DevicePool::new(
            driver.clone(),
            PoolConfig {
                device: config.device_index,
                slab_bytes: config.slab_bytes,
                block_bytes: config.block_bytes,
                max_bytes: config.pool_max_bytes,
            },
        )?;
        let staging = transport
            .as_ref()
            .map(|t| StagingRing::new(driver.clone(), t.clone(), &config.staging))
            .transpose()?;
        Ok(Self {
            config,
            driver,
            transport,
            pool: Mutex::new(pool),
            index: KeyIndex::new(),
            handles: DashMap::new(),
            regions: DashMap::new(),
            slabs: DashMap::new(),
            staging,
        })
    }

    pub fn index(&self) -> &KeyIndex {
        &self.index
    }

    /// Allocate one block per key and pick up any slab the pool created.
    fn alloc_extents(&self, n: usize, length: u32) -> Result<Vec<Extent>> {
        let extents = self.pool.lock().alloc_blocks(n, length)?;
        self.adopt_new_slabs()?;
        Ok(extents)
    }

    fn release_extents(&self, extents: &[Extent]) {
        if !extents.is_empty() {
            self.pool.lock().free_blocks(extents);
        }
    }

    /// Install every `(key, extents)` pair atomically, then return the
    /// displaced blocks to the pool (index lock first, pool lock after).
    fn bind_keys(&self, entries: Vec<(String, ExtentList)>) {
        let displaced = self.index.bind(entries);
        self.release_extents(&displaced);
    }

    fn adopt_new_slabs(&self) -> Result<()> {
        for info in self.pool.lock().slabs() {
            if self.slabs.contains_key(&info.id) {
                continue;
            }
            if let Some(transport) = &self.transport {
                let region = transport.register(info.base, info.len)?;
                self.regions.insert(info.id, region);
            }
            self.slabs.insert(info.id, info);
        }
        Ok(())
    }

    fn slab_handle(&self, slab: u32) -> Result<IpcHandle> {
        if let Some(handle) = self.handles.get(&slab) {
            return Ok(*handle);
        }
        let info = self
            .slabs
            .get(&slab)
            .ok_or_else(|| Error::Protocol(format!("extent names unknown slab {slab}")))?;
        let handle = self.driver.ipc_handle(info.base)?;
        self.handles.insert(slab, handle);
        Ok(handle)
    }

    fn extent_segment(&self, extent: &Extent) -> Result<(u64, u32)> {
        let info = self
            .slabs
            .get(&extent.slab)
            .ok_or_else(|| Error::Protocol(format!("extent names unknown slab {}", extent.slab)))?;
        Ok((info.base + extent.offset, extent.length))
    }

    fn ipc_targets(&self, extents: &[Extent]) -> Result<Vec<IpcTarget>> {
        extents
            .iter()
            .map(|e| {
                Ok(IpcTarget { handle: self.slab_handle(e.slab)?, offset: e.offset, len: e.length })
            })
            .collect()
    }

    fn rdma_targets(&self, extents: &[Extent]) -> Result<Vec<RdmaTarget>> {
        extents
            .iter()
            .map(|e| {
                let region = self.regions.get(&e.slab).ok_or_else(|| {
                    Error::Transport(format!("slab {} is not RDMA-registered", e.slab))
                })?;
                Ok(RdmaTarget { raddr: region.addr + e.offset, rkey: region.rkey, len: e.length })
            })
            .collect()
    }

    /// The extents serving the first `block_size` bytes of a bound key.
    fn lookup_read(&self, key: &str, block_size: u32) -> Result<ExtentList> {
        let bound = self.index.lookup(key).ok_or_else(|| Error::NotFound(key.to_string()))?;
        let mut remaining = block_size;
        let mut out: ExtentList = smallvec![];
        for extent in bound {
            if remaining == 0 {
                break;
            }
            let take = extent.length.min(remaining);
            out.push(Extent { length: take, ..extent });
            remaining -= take;
        }
        if remaining > 0 {
            return Err(Error::InvalidRange(format!(
                "key {key} holds {} bytes fewer than requested",
                remaining
            )));
        }
        Ok(out)
    }

    /// Resolve the data path for a batch, upgrading plain RDMA to the staged
    /// path when the batch exceeds the BAR1 budget.
    fn effective_mode(&self, requested: TransferMode, total_bytes: u64) -> Result<TransferMode> {
        match requested {
            TransferMode::LocalGpu => Ok(TransferMode::LocalGpu),
            TransferMode::Rdma | TransferMode::RdmaStaged => {
                if self.transport.is_none() {
                    return Err(Error::Transport(
                        "server started without an RDMA device".into(),
                    ));
                }
                if requested == TransferMode::RdmaStaged
                    || total_bytes > self.config.bar1_budget_bytes as u64
                {
                    Ok(TransferMode::RdmaStaged)
                } else {
                    Ok(TransferMode::Rdma)
                }
            }
        }
    }

    fn validate_batch(&self, batch: &BatchRequest) -> Result<()> {
        if batch.blocks.is_empty() {
            return Err(Error::InvalidRange("empty batch".into()));
        }
        if batch.block_size == 0 || batch.block_size as usize > self.config.block_bytes {
            return Err(Error::InvalidRange(format!(
                "block_size {} outside (0, {}]",
                batch.block_size, self.config.block_bytes
            )));
        }
        for block in &batch.blocks {
            if block.key.is_empty() || block.key.len() > MAX_KEY_BYTES {
                return Err(Error::InvalidRange(format!(
                    "key length {} outside (0, {MAX_KEY_BYTES}]",
                    block.key.len()
                )));
            }
        }
        Ok(())
    }
}

impl Drop for CacheEngine {
    fn drop(&mut self) {
        if let Some(transport) = &self.transport {
            for entry in self.regions.iter() {
                transport.deregister(entry.value());
            }
        }
    }
}

enum PendingKind {
    Write { bindings: Vec<(String, ExtentList)> },
    Read,
}

impl PendingKind {
    fn write_extents(&self) -> Vec<Extent> {
        match self {
            PendingKind::Write { bindings } => {
                bindings.iter().flat_map(|(_, list)| list.iter().copied()).collect()
            }
            PendingKind::Read => Vec::new(),
        }
    }
}

/// Per-connection in-flight op, between its request frame and final COMMIT.
enum Pending {
    /// Targets handed out; awaiting one COMMIT.
    Direct { kind: PendingKind },
    /// Window-by-window staged transfer.
    Staged { kind: PendingKind, plan: Vec<StagedChunk>, cursor: usize, window: Option<Window> },
}

struct Connection {
    engine: Arc<CacheEngine>,
    stream: TcpStream,
    peer: SocketAddr,
    pending: Option<Pending>,
}

impl Connection {
    async fn run(&mut self) -> Result<()> {
        while let Some((op, payload)) = read_frame(&mut self.stream).await? {
            let command = Command::decode(op, payload)?;
            self.dispatch(command).await?;
        }
        Ok(())
    }

    async fn dispatch(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Write(batch) => self.start_batch(batch, true).await,
            Command::Read(batch) => self.start_batch(batch, false).await,
            Command::Check(key) => {
                let exists = self.engine.index.check_exist(&key);
                tracing::debug!(peer = %self.peer, key = %key, exists, "CHECK");
                self.ack(Ack::ok(AckData::Exists(exists))).await
            }
            Command::Match(keys) => {
                let last = self.engine.index.match_last_index(&keys);
                tracing::debug!(peer = %self.peer, probes = keys.len(), last, "MATCH");
                self.ack(Ack::ok(AckData::MatchIndex(last))).await
            }
            Command::Stage => self.stage().await,
            Command::Commit => self.commit().await,
        }
    }

    async fn start_batch(&mut self, batch: BatchRequest, is_write: bool) -> Result<()> {
        if self.pending.is_some() {
            return Err(Error::Protocol("batch while another op is in flight".into()));
        }
        match self.plan_batch(batch, is_write) {
            Ok((pending, ack)) => {
                self.pending = Some(pending);
                self.ack(ack).await
            }
            Err(e) if !e.is_fatal() => {
                tracing::debug!(peer = %self.peer, error = %e, "batch rejected");
                self.ack(Ack::failure(&e)).await
            }
            Err(e) => Err(e),
        }
    }

    fn plan_batch(&self, batch: BatchRequest, is_write: bool) -> Result<(Pending, Ack)> {
        let engine = &self.engine;
        engine.validate_batch(&batch)?;
        let total = batch.blocks.len() as u64 * batch.block_size as u64;
        let mode = engine.effective_mode(batch.mode, total)?;

        // Writes bind fresh blocks at COMMIT; reads serve the bound extents.
        let (kind, per_key): (PendingKind, Vec<ExtentList>) = if is_write {
            let extents = engine.alloc_extents(batch.blocks.len(), batch.block_size)?;
            let per_key: Vec<ExtentList> = extents.iter().map(|e| smallvec![*e]).collect();
            let bindings = batch
                .blocks
                .iter()
                .map(|b| b.key.clone())
                .zip(per_key.iter().cloned())
                .collect();
            (PendingKind::Write { bindings }, per_key)
        } else {
            let per_key = batch
                .blocks
                .iter()
                .map(|b| engine.lookup_read(&b.key, batch.block_size))
                .collect::<Result<Vec<_>>>()?;
            (PendingKind::Read, per_key)
        };

        let flat: Vec<Extent> = per_key.iter().flat_map(|l| l.iter().copied()).collect();
        let undo = |err: Error| {
            if is_write {
                engine.release_extents(&flat);
            }
            err
        };

        let result = match mode {
            TransferMode::LocalGpu => engine
                .ipc_targets(&flat)
                .map(|targets| (Pending::Direct { kind }, Ack::ok(AckData::LocalGpu(targets)))),
            TransferMode::Rdma => engine
                .rdma_targets(&flat)
                .map(|targets| (Pending::Direct { kind }, Ack::ok(AckData::Rdma(targets)))),
            TransferMode::RdmaStaged => engine
                .staging
                .as_ref()
                .ok_or_else(|| Error::Transport("staging ring unavailable".into()))
                .and_then(|ring| {
                    let entries = per_key
                        .iter()
                        .map(|list| {
                            list.iter()
                                .map(|e| engine.extent_segment(e))
                                .collect::<Result<Vec<_>>>()
                        })
                        .collect::<Result<Vec<_>>>()?;
                    let plan = plan_chunks(&entries, ring.window_bytes() as u32);
                    tracing::debug!(
                        peer = %self.peer,
                        chunks = plan.len(),
                        window_bytes = ring.window_bytes(),
                        "staged batch planned"
                    );
                    Ok((
                        Pending::Staged { kind, plan, cursor: 0, window: None },
                        Ack::ok(AckData::Staged { window_bytes: ring.window_bytes() as u32 }),
                    ))
                }),
        };
        result.map_err(undo)
    }

    async fn stage(&mut self) -> Result<()> {
        let engine = self.engine.clone();
        let ring = engine
            .staging
            .as_ref()
            .ok_or_else(|| Error::Protocol("STAGE without a staging ring".into()))?;

        let (is_read, chunk) = match &self.pending {
            Some(Pending::Staged { kind, plan, cursor, window }) => {
                if window.is_some() {
                    return Err(Error::Protocol("STAGE before COMMIT of granted window".into()));
                }
                let Some(chunk) = plan.get(*cursor) else {
                    return Err(Error::Protocol("STAGE past end of chunk plan".into()));
                };
                (matches!(kind, PendingKind::Read), chunk.clone())
            }
            _ => return Err(Error::Protocol("STAGE without a staged op".into())),
        };

        // Back-pressure: suspends until a window frees up.
        let window = ring.acquire().await;

        if is_read {
            // Fill the window from the device before the client pulls it.
            let mut dst = window.addr;
            for (addr, len) in &chunk.segments {
                if let Err(e) = engine.driver.copy(dst, *addr, *len as usize) {
                    ring.release(window);
                    return Err(e);
                }
                dst += *len as u64;
            }
        }

        let ack =
            Ack::ok(AckData::WindowReady { raddr: window.addr, rkey: ring.rkey(), len: chunk.len });
        if let Some(Pending::Staged { window: slot, .. }) = &mut self.pending {
            *slot = Some(window);
        }
        self.ack(ack).await
    }

    async fn commit(&mut self) -> Result<()> {
        let engine = self.engine.clone();
        match self.pending.take() {
            None => Err(Error::Protocol("COMMIT without an op in flight".into())),
            Some(Pending::Direct { kind }) => {
                if let PendingKind::Write { bindings } = kind {
                    engine.bind_keys(bindings);
                }
                self.ack(Ack::ok(AckData::None)).await
            }
            Some(Pending::Staged { kind, plan, cursor, window }) => {
                let ring = engine
                    .staging
                    .as_ref()
                    .ok_or_else(|| Error::Protocol("COMMIT without a staging ring".into()))?;
                let Some(window) = window else {
                    engine.release_extents(&kind.write_extents());
                    return Err(Error::Protocol("COMMIT without a granted window".into()));
                };
                let Some(chunk) = plan.get(cursor) else {
                    ring.release(window);
                    engine.release_extents(&kind.write_extents());
                    return Err(Error::Protocol("COMMIT past end of chunk plan".into()));
                };

                if matches!(kind, PendingKind::Write { .. }) {
                    // Drain the window into the device extents it maps.
                    let mut src = window.addr;
                    for (addr, len) in &chunk.segments {
                        if let Err(e) = engine.driver.copy(*addr, src, *len as usize) {
                            ring.release(window);
                            engine.release_extents(&kind.write_extents());
                            return Err(e);
                        }
                        src += *len as u64;
                    }
                }
                // Device copy and network transfer are both done; only now may
                // the window be reused.
                ring.release(window);

                let next = cursor + 1;
                if next == plan.len() {
                    if let PendingKind::Write { bindings } = kind {
                        engine.bind_keys(bindings);
                    }
                } else {
                    self.pending = Some(Pending::Staged { kind, plan, cursor: next, window: None });
                }
                self.ack(Ack::ok(AckData::None)).await
            }
        }
    }

    async fn ack(&mut self, ack: Ack) -> Result<()> {
        let payload = ack.encode()?;
        write_frame(&mut self.stream, OpCode::Ack, &payload).await
    }

    /// Cancel whatever the connection had in flight: unbound blocks go back
    /// to the pool, a granted window back to the ring. Bound keys stay bound.
    fn rollback(&mut self) {
        let Some(pending) = self.pending.take() else { return };
        let (kind, window) = match pending {
            Pending::Direct { kind } => (kind, None),
            Pending::Staged { kind, window, .. } => (kind, window),
        };
        if let (Some(window), Some(ring)) = (window, self.engine.staging.as_ref()) {
            ring.release(window);
        }
        let extents = kind.write_extents();
        if !extents.is_empty() {
            tracing::debug!(peer = %self.peer, blocks = extents.len(), "rolled back partial write");
            self.engine.release_extents(&extents);
        }
    }
}

async fn handle_connection(engine: Arc<CacheEngine>, stream: TcpStream, peer: SocketAddr) {
    tracing::debug!(%peer, "connection opened");
    let mut connection = Connection { engine, stream, peer, pending: None };
    if let Err(e) = connection.run().await {
        tracing::warn!(%peer, error = %e, "connection failed");
    }
    connection.rollback();
    tracing::debug!(%peer, "connection closed");
}

/// A bound server, ready to serve. Splitting bind from serve lets callers
/// learn the ephemeral port before driving the loop.
pub struct InfiniServer {
    engine: Arc<CacheEngine>,
    listener: TcpListener,
}

impl InfiniServer {
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        let engine = Arc::new(CacheEngine::new(config)?);
        Ok(Self { engine, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Error::from)
    }

    pub fn engine(&self) -> Arc<CacheEngine> {
        self.engine.clone()
    }

    /// Serve until SIGINT, then drain live connections and release the pool.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
    }

    pub async fn serve_with_shutdown(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        let mut tasks = JoinSet::new();
        tracing::info!(addr = %self.local_addr()?, "cache server listening");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        tasks.spawn(handle_connection(self.engine.clone(), stream, peer));
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
            }
        }
        drop(self.listener);
        if !tasks.is_empty() {
            tracing::info!(connections = tasks.len(), "draining active connections");
        }
        while tasks.join_next().await.is_some() {}
        tracing::info!("pool released, shutting down");
        Ok(())
    }
}

/// Bind and serve with SIGINT shutdown.
pub async fn run_server(config: ServerConfig) -> Result<()> {
    InfiniServer::bind(config).await?.serve().await
}
