//! Cache server binary
//!
//! Run with: cargo run --bin infinistore-server -- --help

use anyhow::Result;
use clap::Parser;
use infinistore::server::{run_server, ServerConfig};
use infinistore::StagingConfig;

#[derive(Parser, Debug)]
#[command(name = "infinistore-server")]
#[command(about = "GPU KV cache server with IPC and RDMA data paths")]
struct Args {
    /// TCP listen address
    #[arg(long, default_value = "127.0.0.1:22345")]
    listen_addr: String,

    /// CUDA device backing the pool
    #[arg(long, default_value = "0")]
    device: u32,

    /// RDMA device name (e.g. mlx5_0); omit to serve LOCAL_GPU only
    #[arg(long)]
    dev_name: Option<String>,

    /// Maximum pool size in MB
    #[arg(long, default_value = "1024")]
    pool_mb: usize,

    /// Slab size in MB
    #[arg(long, default_value = "64")]
    slab_mb: usize,

    /// Block size in KB
    #[arg(long, default_value = "256")]
    block_kb: usize,

    /// BAR1 budget in MB; larger batches go through the staging ring
    #[arg(long, default_value = "64")]
    bar1_budget_mb: usize,

    /// Pinned staging ring size in MB
    #[arg(long, default_value = "32")]
    ring_mb: usize,

    /// Staging window size in KB
    #[arg(long, default_value = "4096")]
    window_kb: usize,

    /// Use mock driver/transport (for running without GPU/RDMA hardware)
    #[arg(long, default_value_t = true)]
    mock: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = ServerConfig {
        listen_addr: args.listen_addr,
        device_index: args.device,
        dev_name: args.dev_name,
        pool_max_bytes: args.pool_mb * 1024 * 1024,
        slab_bytes: args.slab_mb * 1024 * 1024,
        block_bytes: args.block_kb * 1024,
        bar1_budget_bytes: args.bar1_budget_mb * 1024 * 1024,
        staging: StagingConfig {
            ring_bytes: args.ring_mb * 1024 * 1024,
            window_bytes: args.window_kb * 1024,
        },
        use_mock: args.mock,
    };

    tracing::info!("starting cache server with config: {:?}", config);

    run_server(config).await?;
    Ok(())
}
