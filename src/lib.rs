//! InfiniStore: a server-side GPU key-value cache for LLM KV-cache reuse.
//!
//! Inference workers write and read named byte ranges of device memory
//! into/out of a server-owned device pool. On one host the client maps the
//! server's slabs over GPU IPC and copies directly; across hosts it posts
//! one-sided RDMA verbs against the server's registered slabs, falling back
//! to a pinned staging ring when the BAR1 aperture is too small for direct
//! peer DMA.

pub mod client;
pub mod error;
pub mod gpu;
pub mod index;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod staging;
pub mod transport;

pub use client::{ClientConfig, ConnectionType, InfinityClient};
pub use error::{Error, Result};
pub use gpu::{DeviceBuffer, DisablePooledAllocations, TensorRef};
pub use server::{run_server, CacheEngine, InfiniServer, ServerConfig};
pub use staging::StagingConfig;
