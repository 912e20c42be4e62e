//! Cache client
//!
//! `write_cache`/`read_cache` validate up front, then hand the batch to a
//! single connection task that drives the framed dialogue and the data path
//! (IPC copies or one-sided verbs). Accepted batches are deferred: they
//! complete asynchronously and `sync()` drains the outstanding-op counter,
//! surfacing the first failure observed on the connection.

use crate::error::{Error, Result};
use crate::gpu::{open_driver, GpuDriver, IpcHandle, Placement, TensorRef};
use crate::protocol::{
    read_frame, write_frame, Ack, AckData, BatchRequest, BlockRef, Command, IpcTarget, OpCode,
    RdmaTarget, TransferMode, MAX_KEY_BYTES,
};
use crate::staging::chunk_spans;
use crate::transport::{open_transport, RdmaTransport, TransportConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionType {
    /// Intra-host: map server slabs over IPC and copy device-to-device.
    LocalGpu,
    /// Cross-host: one-sided verbs against the server's registered slabs.
    Rdma,
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Server IP.
    pub host_addr: String,
    /// Server TCP port.
    pub service_port: u16,
    /// RDMA device identifier (e.g. `mlx5_0`); required for RDMA.
    pub dev_name: Option<String>,
    pub connection_type: ConnectionType,
    /// Force staged transfers through the server's pinned ring.
    pub limited_bar1: bool,
    /// Mock driver/transport backends.
    pub use_mock: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host_addr: "127.0.0.1".to_string(),
            service_port: 22345,
            dev_name: None,
            connection_type: ConnectionType::LocalGpu,
            limited_bar1: false,
            use_mock: true,
        }
    }
}

/// Counts deferred batches; `drain` is the `sync()` barrier.
struct OpTracker {
    outstanding: watch::Sender<usize>,
    first_error: Mutex<Option<Error>>,
}

impl OpTracker {
    fn new() -> Self {
        Self { outstanding: watch::Sender::new(0), first_error: Mutex::new(None) }
    }

    fn enqueue(&self) {
        self.outstanding.send_modify(|count| *count += 1);
    }

    /// Undo an `enqueue` whose batch never reached the connection task.
    fn cancel(&self) {
        self.outstanding.send_modify(|count| *count -= 1);
    }

    fn complete(&self, result: Result<()>) {
        if let Err(e) = result {
            let mut first = self.first_error.lock();
            if first.is_none() {
                *first = Some(e);
            }
        }
        self.outstanding.send_modify(|count| *count -= 1);
    }

    async fn drain(&self) -> Result<()> {
        let mut rx = self.outstanding.subscribe();
        // The sender lives as long as the tracker, so this cannot fail.
        let _ = rx.wait_for(|count| *count == 0).await;
        match self.first_error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

enum Job {
    Batch { write: bool, tensor: TensorRef, blocks: Vec<BlockRef>, block_size: u32 },
    Check { key: String, reply: oneshot::Sender<Result<bool>> },
    Match { keys: Vec<String>, reply: oneshot::Sender<Result<i32>> },
}

/// A connection to the cache server.
pub struct InfinityClient {
    config: ClientConfig,
    driver: Arc<dyn GpuDriver>,
    jobs: mpsc::UnboundedSender<Job>,
    ops: Arc<OpTracker>,
}

impl InfinityClient {
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let driver = open_driver(config.use_mock);
        let transport = match config.connection_type {
            ConnectionType::Rdma => {
                if config.dev_name.is_none() {
                    return Err(Error::Transport("dev_name is required for RDMA".into()));
                }
                Some(open_transport(&TransportConfig {
                    dev_name: config.dev_name.clone(),
                    use_mock: config.use_mock,
                })?)
            }
            ConnectionType::LocalGpu => None,
        };

        let stream =
            TcpStream::connect((config.host_addr.as_str(), config.service_port)).await?;
        let _ = stream.set_nodelay(true);
        tracing::info!(
            host = %config.host_addr,
            port = config.service_port,
            kind = ?config.connection_type,
            "connected to cache server"
        );

        let ops = Arc::new(OpTracker::new());
        let (jobs, job_rx) = mpsc::unbounded_channel();
        let actor = ConnectionActor {
            config: config.clone(),
            driver: driver.clone(),
            transport,
            stream,
            opened: HashMap::new(),
            ops: ops.clone(),
            dead: None,
        };
        tokio::spawn(actor.run(job_rx));

        Ok(Self { config, driver, jobs, ops })
    }

    /// The driver this client copies with; useful for allocating tensors that
    /// live on the same device namespace.
    pub fn driver(&self) -> Arc<dyn GpuDriver> {
        self.driver.clone()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Bind each `(key, tensor_offset)` to `block_size` bytes copied out of
    /// `tensor`. Deferred; completes on `sync()`.
    pub fn write_cache(
        &self,
        tensor: TensorRef,
        blocks: Vec<(String, u64)>,
        block_size: u32,
    ) -> Result<()> {
        self.submit(true, tensor, blocks, block_size)
    }

    /// Copy the first `block_size` bytes bound to each key into `tensor` at
    /// the paired offset. Deferred; completes on `sync()`.
    pub fn read_cache(
        &self,
        tensor: TensorRef,
        blocks: Vec<(String, u64)>,
        block_size: u32,
    ) -> Result<()> {
        self.submit(false, tensor, blocks, block_size)
    }

    /// Barrier: waits until every deferred op on this connection finished and
    /// returns the first asynchronous failure, if any.
    pub async fn sync(&self) -> Result<()> {
        self.ops.drain().await
    }

    pub async fn check_exist(&self, key: &str) -> Result<bool> {
        let (reply, response) = oneshot::channel();
        self.jobs
            .send(Job::Check { key: key.to_string(), reply })
            .map_err(|_| Error::Transport("connection closed".into()))?;
        response.await.map_err(|_| Error::Transport("connection closed".into()))?
    }

    pub async fn get_match_last_index(&self, keys: Vec<String>) -> Result<i32> {
        let (reply, response) = oneshot::channel();
        self.jobs
            .send(Job::Match { keys, reply })
            .map_err(|_| Error::Transport("connection closed".into()))?;
        response.await.map_err(|_| Error::Transport("connection closed".into()))?
    }

    /// Drain outstanding ops and shut the connection down.
    pub async fn close(self) -> Result<()> {
        let result = self.sync().await;
        drop(self.jobs);
        result
    }

    fn submit(
        &self,
        write: bool,
        tensor: TensorRef,
        blocks: Vec<(String, u64)>,
        block_size: u32,
    ) -> Result<()> {
        validate_batch(&tensor, &blocks, block_size)?;
        let blocks = blocks
            .into_iter()
            .map(|(key, tensor_off)| BlockRef { key, tensor_off })
            .collect();
        self.ops.enqueue();
        if self.jobs.send(Job::Batch { write, tensor, blocks, block_size }).is_err() {
            self.ops.cancel();
            return Err(Error::Transport("connection closed".into()));
        }
        Ok(())
    }
}

/// Pre-flight checks; failures here are synchronous and nothing is enqueued.
fn validate_batch(tensor: &TensorRef, blocks: &[(String, u64)], block_size: u32) -> Result<()> {
    match tensor.placement {
        Placement::Cuda(_) => {}
        Placement::Host => {
            return Err(Error::DeviceMismatch("tensor is not on a CUDA device".into()))
        }
    }
    if !tensor.contiguous {
        return Err(Error::DeviceMismatch("tensor is not contiguous".into()));
    }
    if blocks.is_empty() {
        return Err(Error::InvalidRange("empty block list".into()));
    }
    if block_size == 0 {
        return Err(Error::InvalidRange("block_size must be non-zero".into()));
    }
    for (key, tensor_off) in blocks {
        if key.is_empty() || key.len() > MAX_KEY_BYTES {
            return Err(Error::InvalidRange(format!(
                "key length {} outside (0, {MAX_KEY_BYTES}]",
                key.len()
            )));
        }
        let end = tensor_off
            .checked_add(block_size as u64)
            .ok_or_else(|| Error::InvalidRange("tensor offset overflows".into()))?;
        if end > tensor.len {
            return Err(Error::InvalidRange(format!(
                "range [{tensor_off}, {end}) outside tensor of {} bytes",
                tensor.len
            )));
        }
    }
    Ok(())
}

/// Owns the socket; executes jobs strictly in submission order so writes bind
/// in command order and later reads on this connection see them.
struct ConnectionActor {
    config: ClientConfig,
    driver: Arc<dyn GpuDriver>,
    transport: Option<Arc<dyn RdmaTransport>>,
    stream: TcpStream,
    /// IPC handles already mapped into this process.
    opened: HashMap<IpcHandle, u64>,
    ops: Arc<OpTracker>,
    /// Set once a fatal error poisons the connection.
    dead: Option<String>,
}

impl ConnectionActor {
    async fn run(mut self, mut jobs: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = jobs.recv().await {
            match job {
                Job::Batch { write, tensor, blocks, block_size } => {
                    let result = match self.poisoned() {
                        Some(err) => Err(err),
                        None => {
                            let r = self.batch(write, tensor, blocks, block_size).await;
                            self.note_fatal(r)
                        }
                    };
                    self.ops.complete(result);
                }
                Job::Check { key, reply } => {
                    let result = match self.poisoned() {
                        Some(err) => Err(err),
                        None => {
                            let r = self.check(key).await;
                            self.note_fatal(r)
                        }
                    };
                    let _ = reply.send(result);
                }
                Job::Match { keys, reply } => {
                    let result = match self.poisoned() {
                        Some(err) => Err(err),
                        None => {
                            let r = self.match_last(keys).await;
                            self.note_fatal(r)
                        }
                    };
                    let _ = reply.send(result);
                }
            }
        }
        tracing::debug!("connection task finished");
    }

    fn poisoned(&self) -> Option<Error> {
        self.dead.as_ref().map(|reason| Error::Transport(reason.clone()))
    }

    /// A fatal failure poisons the connection; later ops fail fast.
    fn note_fatal<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() && self.dead.is_none() {
                tracing::warn!(error = %e, "connection poisoned");
                self.dead = Some(e.to_string());
            }
        }
        result
    }

    async fn batch(
        &mut self,
        write: bool,
        tensor: TensorRef,
        blocks: Vec<BlockRef>,
        block_size: u32,
    ) -> Result<()> {
        let mode = match self.config.connection_type {
            ConnectionType::LocalGpu => TransferMode::LocalGpu,
            ConnectionType::Rdma if self.config.limited_bar1 => TransferMode::RdmaStaged,
            ConnectionType::Rdma => TransferMode::Rdma,
        };
        let request = BatchRequest { block_size, blocks: blocks.clone(), mode };
        let command = if write { Command::Write(request) } else { Command::Read(request) };
        self.send(command).await?;

        let ack = self.recv_ack().await?;
        if let Some(err) = Error::from_status(ack.status, "batch rejected") {
            return Err(err);
        }
        match ack.data {
            AckData::LocalGpu(targets) => {
                self.local_copy(write, tensor, &blocks, block_size, targets)?;
                self.commit().await
            }
            AckData::Rdma(targets) => {
                self.post_verbs(write, tensor, &blocks, block_size, targets)?;
                self.commit().await
            }
            AckData::Staged { window_bytes } => {
                self.staged(write, tensor, &blocks, block_size, window_bytes).await
            }
            other => Err(Error::Protocol(format!("unexpected batch ack: {other:?}"))),
        }
    }

    /// LOCAL_GPU data path: map each slab once, then device-to-device copies.
    fn local_copy(
        &mut self,
        write: bool,
        tensor: TensorRef,
        blocks: &[BlockRef],
        block_size: u32,
        targets: Vec<IpcTarget>,
    ) -> Result<()> {
        let mut targets = targets.into_iter();
        for block in blocks {
            let mut done = 0u32;
            while done < block_size {
                let target = targets
                    .next()
                    .ok_or_else(|| Error::Protocol("target list shorter than batch".into()))?;
                if target.len == 0 || done + target.len > block_size {
                    return Err(Error::Protocol("target lengths disagree with batch".into()));
                }
                let remote = self.open(&target.handle)? + target.offset;
                let local = tensor.addr + block.tensor_off + done as u64;
                if write {
                    self.driver.copy(remote, local, target.len as usize)?;
                } else {
                    self.driver.copy(local, remote, target.len as usize)?;
                }
                done += target.len;
            }
        }
        if targets.next().is_some() {
            return Err(Error::Protocol("target list longer than batch".into()));
        }
        Ok(())
    }

    /// RDMA data path: one verb per extent target.
    fn post_verbs(
        &mut self,
        write: bool,
        tensor: TensorRef,
        blocks: &[BlockRef],
        block_size: u32,
        targets: Vec<RdmaTarget>,
    ) -> Result<()> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| Error::Transport("client has no RDMA transport".into()))?;
        let mut targets = targets.into_iter();
        for block in blocks {
            let mut done = 0u32;
            while done < block_size {
                let target = targets
                    .next()
                    .ok_or_else(|| Error::Protocol("target list shorter than batch".into()))?;
                if target.len == 0 || done + target.len > block_size {
                    return Err(Error::Protocol("target lengths disagree with batch".into()));
                }
                let local = tensor.addr + block.tensor_off + done as u64;
                if write {
                    transport.post_write(local, target.len as usize, target.raddr, target.rkey)?;
                } else {
                    transport.post_read(local, target.len as usize, target.raddr, target.rkey)?;
                }
                done += target.len;
            }
        }
        if targets.next().is_some() {
            return Err(Error::Protocol("target list longer than batch".into()));
        }
        Ok(())
    }

    /// Staged data path: drive STAGE/COMMIT per chunk; verbs target the ring.
    async fn staged(
        &mut self,
        write: bool,
        tensor: TensorRef,
        blocks: &[BlockRef],
        block_size: u32,
        window_bytes: u32,
    ) -> Result<()> {
        let transport = self
            .transport
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::Transport("client has no RDMA transport".into()))?;
        if window_bytes == 0 {
            return Err(Error::Protocol("zero staging window".into()));
        }
        for block in blocks {
            for (chunk_off, chunk_len) in chunk_spans(block_size, window_bytes) {
                self.send(Command::Stage).await?;
                let ack = self.recv_ack().await?;
                if let Some(err) = Error::from_status(ack.status, "stage rejected") {
                    return Err(err);
                }
                let AckData::WindowReady { raddr, rkey, len } = ack.data else {
                    return Err(Error::Protocol("expected a window grant".into()));
                };
                if len != chunk_len {
                    return Err(Error::Protocol(format!(
                        "window grant of {len} bytes, expected {chunk_len}"
                    )));
                }
                let local = tensor.addr + block.tensor_off + chunk_off as u64;
                if write {
                    transport.post_write(local, len as usize, raddr, rkey)?;
                } else {
                    transport.post_read(local, len as usize, raddr, rkey)?;
                }
                self.commit().await?;
            }
        }
        Ok(())
    }

    async fn check(&mut self, key: String) -> Result<bool> {
        self.send(Command::Check(key)).await?;
        let ack = self.recv_ack().await?;
        if let Some(err) = Error::from_status(ack.status, "check failed") {
            return Err(err);
        }
        match ack.data {
            AckData::Exists(exists) => Ok(exists),
            other => Err(Error::Protocol(format!("unexpected check ack: {other:?}"))),
        }
    }

    async fn match_last(&mut self, keys: Vec<String>) -> Result<i32> {
        self.send(Command::Match(keys)).await?;
        let ack = self.recv_ack().await?;
        if let Some(err) = Error::from_status(ack.status, "match failed") {
            return Err(err);
        }
        match ack.data {
            AckData::MatchIndex(index) => Ok(index),
            other => Err(Error::Protocol(format!("unexpected match ack: {other:?}"))),
        }
    }

    async fn commit(&mut self) -> Result<()> {
        self.send(Command::Commit).await?;
        let ack = self.recv_ack().await?;
        match Error::from_status(ack.status, "commit failed") {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn open(&mut self, handle: &IpcHandle) -> Result<u64> {
        if let Some(base) = self.opened.get(handle) {
            return Ok(*base);
        }
        let base = self.driver.open_ipc(handle)?;
        self.opened.insert(*handle, base);
        Ok(base)
    }

    async fn send(&mut self, command: Command) -> Result<()> {
        write_frame(&mut self.stream, command.op(), &command.encode()).await
    }

    async fn recv_ack(&mut self) -> Result<Ack> {
        match read_frame(&mut self.stream).await? {
            Some((OpCode::Ack, payload)) => Ack::decode(payload),
            Some((op, _)) => Err(Error::Protocol(format!("expected ACK, got {op:?}"))),
            None => Err(Error::Transport("connection closed by server".into())),
        }
    }
}
