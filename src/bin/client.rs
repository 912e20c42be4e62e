//! Cache client binary
//!
//! Run with: cargo run --bin infinistore-client -- --help

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use infinistore::client::{ClientConfig, ConnectionType, InfinityClient};
use infinistore::server::{InfiniServer, ServerConfig};
use infinistore::{DeviceBuffer, DisablePooledAllocations, StagingConfig};

#[derive(Parser, Debug)]
#[command(name = "infinistore-client")]
#[command(about = "GPU KV cache client")]
struct Args {
    /// Server IP
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server TCP port
    #[arg(long, default_value = "22345")]
    port: u16,

    /// RDMA device name; switches the data path to RDMA
    #[arg(long)]
    dev_name: Option<String>,

    /// Force staged transfers through the server's pinned ring
    #[arg(long, default_value_t = false)]
    limited_bar1: bool,

    /// Use mock driver/transport
    #[arg(long, default_value_t = true)]
    mock: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check whether a key is bound
    Check {
        key: String,
    },
    /// Print the last bound index of a key sequence
    Match {
        keys: Vec<String>,
    },
    /// Write/read a batch of blocks and report throughput
    Bench {
        /// Number of blocks
        #[arg(long, default_value = "64")]
        blocks: usize,
        /// Block size in bytes
        #[arg(long, default_value = "16384")]
        block_size: u32,
        /// Start an in-process server instead of connecting out
        #[arg(long, default_value_t = false)]
        embedded: bool,
    },
}

fn client_config(args: &Args, port: u16) -> ClientConfig {
    ClientConfig {
        host_addr: args.host.clone(),
        service_port: port,
        dev_name: args.dev_name.clone(),
        connection_type: if args.dev_name.is_some() {
            ConnectionType::Rdma
        } else {
            ConnectionType::LocalGpu
        },
        limited_bar1: args.limited_bar1,
        use_mock: args.mock,
    }
}

async fn cmd_check(client: &InfinityClient, key: &str) -> Result<()> {
    let exists = client.check_exist(key).await?;
    println!("{}", if exists { "bound" } else { "unbound" });
    Ok(())
}

async fn cmd_match(client: &InfinityClient, keys: Vec<String>) -> Result<()> {
    if keys.is_empty() {
        return Err(anyhow!("match needs at least one key"));
    }
    let last = client.get_match_last_index(keys).await?;
    println!("{last}");
    Ok(())
}

async fn cmd_bench(client: &InfinityClient, blocks: usize, block_size: u32) -> Result<()> {
    use std::time::Instant;

    let total = blocks * block_size as usize;
    let local = client.config().connection_type == ConnectionType::LocalGpu;

    // Allocations shared over IPC must bypass any pooled allocator.
    let _guard = local.then(DisablePooledAllocations::new);
    let src = DeviceBuffer::new(client.driver(), 0, total)?;
    let dst = DeviceBuffer::new(client.driver(), 0, total)?;

    let pattern: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
    src.fill_from(&pattern)?;

    let batch: Vec<(String, u64)> = (0..blocks)
        .map(|i| (format!("bench_key_{i}"), i as u64 * block_size as u64))
        .collect();

    println!("benchmark: {blocks} blocks x {block_size} bytes");

    let start = Instant::now();
    client.write_cache(src.tensor(), batch.clone(), block_size)?;
    client.sync().await?;
    let write = start.elapsed();
    println!(
        "WRITE: {:.2} MB in {:.3}s = {:.0} blocks/sec",
        total as f64 / 1e6,
        write.as_secs_f64(),
        blocks as f64 / write.as_secs_f64()
    );

    let start = Instant::now();
    client.read_cache(dst.tensor(), batch, block_size)?;
    client.sync().await?;
    let read = start.elapsed();
    println!(
        "READ:  {:.2} MB in {:.3}s = {:.0} blocks/sec",
        total as f64 / 1e6,
        read.as_secs_f64(),
        blocks as f64 / read.as_secs_f64()
    );

    if src.to_vec()? != dst.to_vec()? {
        return Err(anyhow!("read-back mismatch"));
    }
    println!("verified: read-back matches");
    Ok(())
}

/// Spin up a server in this process for a self-contained bench run.
async fn spawn_embedded(args: &Args) -> Result<u16> {
    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        dev_name: args.dev_name.clone(),
        staging: StagingConfig::default(),
        use_mock: args.mock,
        ..Default::default()
    };
    let server = InfiniServer::bind(config).await?;
    let port = server.local_addr()?.port();
    tokio::spawn(server.serve_with_shutdown(std::future::pending()));
    Ok(port)
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

    let port = match &args.command {
        Commands::Bench { embedded: true, .. } => spawn_embedded(&args).await?,
        _ => args.port,
    };

    let client = InfinityClient::connect(client_config(&args, port)).await?;

    match args.command {
        Commands::Check { ref key } => cmd_check(&client, key).await?,
        Commands::Match { ref keys } => cmd_match(&client, keys.clone()).await?,
        Commands::Bench { blocks, block_size, .. } => {
            cmd_bench(&client, blocks, block_size).await?
        }
    }

    client.close().await?;
    Ok(())
}
