//! End-to-end tests: in-process server, mock driver and transport.

use infinistore::client::{ClientConfig, ConnectionType, InfinityClient};
use infinistore::server::{InfiniServer, ServerConfig};
use infinistore::{DeviceBuffer, DisablePooledAllocations, Error, StagingConfig};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

fn test_server_config() -> ServerConfig {
    ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        dev_name: Some("mlx5_0".to_string()),
        pool_max_bytes: 8 * 1024 * 1024,
        slab_bytes: 1024 * 1024,
        block_bytes: 64 * 1024,
        bar1_budget_bytes: 1024 * 1024,
        staging: StagingConfig { ring_bytes: 64 * 1024, window_bytes: 16 * 1024 },
        ..Default::default()
    }
}

async fn start_server(config: ServerConfig) -> (u16, oneshot::Sender<()>, JoinHandle<()>) {
    let server = InfiniServer::bind(config).await.unwrap();
    let port = server.local_addr().unwrap().port();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        server
            .serve_with_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .unwrap();
    });
    (port, shutdown_tx, handle)
}

fn client_config(port: u16, kind: ConnectionType) -> ClientConfig {
    ClientConfig {
        host_addr: "127.0.0.1".to_string(),
        service_port: port,
        dev_name: Some("mlx5_0".to_string()),
        connection_type: kind,
        limited_bar1: false,
        use_mock: true,
    }
}

async fn connect(port: u16, kind: ConnectionType) -> InfinityClient {
    InfinityClient::connect(client_config(port, kind)).await.unwrap()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + 7) % 256) as u8).collect()
}

async fn round_trip_on(kind: ConnectionType) {
    init_tracing();
    let (port, _shutdown, _server) = start_server(test_server_config()).await;

    let conn = connect(port, kind).await;
    let local = kind == ConnectionType::LocalGpu;

    // T = [7.0, 9.0, 8.0] under "example_key".
    let src_bytes: Vec<u8> =
        [7.0f32, 9.0, 8.0].iter().flat_map(|v| v.to_le_bytes()).collect();
    let guard = local.then(DisablePooledAllocations::new);
    let src = DeviceBuffer::new(conn.driver(), 0, src_bytes.len()).unwrap();
    drop(guard);
    src.fill_from(&src_bytes).unwrap();

    conn.write_cache(src.tensor(), vec![("example_key".into(), 0)], src_bytes.len() as u32)
        .unwrap();
    conn.sync().await.unwrap();

    // A second connection opened after sync() sees the write.
    let conn2 = connect(port, kind).await;
    let guard = local.then(DisablePooledAllocations::new);
    let dst = DeviceBuffer::new(conn2.driver(), 0, src_bytes.len()).unwrap();
    drop(guard);

    conn2
        .read_cache(dst.tensor(), vec![("example_key".into(), 0)], src_bytes.len() as u32)
        .unwrap();
    conn2.sync().await.unwrap();

    assert_eq!(dst.to_vec().unwrap(), src_bytes);
    conn.close().await.unwrap();
    conn2.close().await.unwrap();
}

#[tokio::test]
async fn basic_round_trip_local_gpu() {
    round_trip_on(ConnectionType::LocalGpu).await;
}

#[tokio::test]
async fn basic_round_trip_rdma() {
    round_trip_on(ConnectionType::Rdma).await;
}

#[tokio::test]
async fn batched_write_then_batched_read() {
    init_tracing();
    let (port, _shutdown, _server) = start_server(test_server_config()).await;
    let conn = connect(port, ConnectionType::Rdma).await;

    let num_blocks = 10usize;
    let block_size = 4096u32;
    let data = pattern(num_blocks * block_size as usize);

    let src = DeviceBuffer::new(conn.driver(), 0, data.len()).unwrap();
    src.fill_from(&data).unwrap();
    let dst = DeviceBuffer::new(conn.driver(), 0, data.len()).unwrap();

    let blocks: Vec<(String, u64)> = (0..num_blocks)
        .map(|i| (format!("batch_key_{i}"), i as u64 * block_size as u64))
        .collect();

    conn.write_cache(src.tensor(), blocks.clone(), block_size).unwrap();
    conn.sync().await.unwrap();

    conn.read_cache(dst.tensor(), blocks, block_size).unwrap();
    conn.sync().await.unwrap();

    assert_eq!(dst.to_vec().unwrap(), data);
    conn.close().await.unwrap();
}

#[tokio::test]
async fn suffix_write_prefix_read_over_staged_path() {
    init_tracing();
    let (port, _shutdown, _server) = start_server(test_server_config()).await;

    let mut config = client_config(port, ConnectionType::Rdma);
    config.limited_bar1 = true;
    let conn = InfinityClient::connect(config).await.unwrap();

    let size = 1024 * 1024usize;
    let data = pattern(size);
    let src = DeviceBuffer::new(conn.driver(), 0, size).unwrap();
    src.fill_from(&data).unwrap();

    // Write the bottom 512 bytes, read them back as the key's prefix.
    conn.write_cache(src.tensor(), vec![("bottom".into(), size as u64 - 512)], 512).unwrap();
    conn.sync().await.unwrap();

    let dst = DeviceBuffer::new(conn.driver(), 0, 512).unwrap();
    conn.read_cache(dst.tensor(), vec![("bottom".into(), 0)], 512).unwrap();
    conn.sync().await.unwrap();

    assert_eq!(dst.to_vec().unwrap(), data[size - 512..]);
    conn.close().await.unwrap();
}

#[tokio::test]
async fn staged_path_chunks_through_the_ring() {
    init_tracing();
    // 16 KB windows against 64 KB blocks: four chunks per block, ring reuse
    // across the batch.
    let (port, _shutdown, _server) = start_server(test_server_config()).await;

    let mut config = client_config(port, ConnectionType::Rdma);
    config.limited_bar1 = true;
    let conn = InfinityClient::connect(config).await.unwrap();

    let block_size = 64 * 1024u32;
    let data = pattern(2 * block_size as usize);
    let src = DeviceBuffer::new(conn.driver(), 0, data.len()).unwrap();
    src.fill_from(&data).unwrap();

    let blocks =
        vec![("chunked_a".to_string(), 0u64), ("chunked_b".to_string(), block_size as u64)];
    conn.write_cache(src.tensor(), blocks.clone(), block_size).unwrap();
    conn.sync().await.unwrap();

    let dst = DeviceBuffer::new(conn.driver(), 0, data.len()).unwrap();
    conn.read_cache(dst.tensor(), blocks, block_size).unwrap();
    conn.sync().await.unwrap();

    assert_eq!(dst.to_vec().unwrap(), data);
    conn.close().await.unwrap();
}

#[tokio::test]
async fn interleaved_keys_read_independently() {
    init_tracing();
    let (port, _shutdown, _server) = start_server(test_server_config()).await;

    let mut config = client_config(port, ConnectionType::Rdma);
    config.limited_bar1 = true;
    let conn = InfinityClient::connect(config).await.unwrap();

    let size = 512 * 1024usize;
    let data = pattern(size);
    let src = DeviceBuffer::new(conn.driver(), 0, size).unwrap();
    src.fill_from(&data).unwrap();

    conn.write_cache(
        src.tensor(),
        vec![("head".into(), 0), ("tail".into(), size as u64 - 1024)],
        1024,
    )
    .unwrap();
    conn.sync().await.unwrap();

    let dst = DeviceBuffer::new(conn.driver(), 0, 1024).unwrap();
    conn.read_cache(dst.tensor(), vec![("head".into(), 0)], 1024).unwrap();
    conn.sync().await.unwrap();
    assert_eq!(dst.to_vec().unwrap(), data[..1024]);

    conn.read_cache(dst.tensor(), vec![("tail".into(), 0)], 1024).unwrap();
    conn.sync().await.unwrap();
    assert_eq!(dst.to_vec().unwrap(), data[size - 1024..]);
    conn.close().await.unwrap();
}

#[tokio::test]
async fn check_exist_after_sync() {
    init_tracing();
    let (port, _shutdown, _server) = start_server(test_server_config()).await;
    let conn = connect(port, ConnectionType::Rdma).await;

    let data = pattern(4096);
    let src = DeviceBuffer::new(conn.driver(), 0, data.len()).unwrap();
    src.fill_from(&data).unwrap();

    conn.write_cache(src.tensor(), vec![("present".into(), 0)], 4096).unwrap();
    conn.sync().await.unwrap();

    assert!(conn.check_exist("present").await.unwrap());
    assert!(!conn.check_exist("absent").await.unwrap());

    // Visible from a fresh connection too.
    let conn2 = connect(port, ConnectionType::Rdma).await;
    assert!(conn2.check_exist("present").await.unwrap());
    conn.close().await.unwrap();
    conn2.close().await.unwrap();
}

#[tokio::test]
async fn match_last_index_semantics() {
    init_tracing();
    let (port, _shutdown, _server) = start_server(test_server_config()).await;
    let conn = connect(port, ConnectionType::Rdma).await;

    let data = pattern(3072);
    let src = DeviceBuffer::new(conn.driver(), 0, data.len()).unwrap();
    src.fill_from(&data).unwrap();

    conn.write_cache(
        src.tensor(),
        vec![("key1".into(), 0), ("key2".into(), 1024), ("key3".into(), 2048)],
        1024,
    )
    .unwrap();

    let probe: Vec<String> =
        ["A", "B", "C", "key1", "D", "E"].iter().map(|s| s.to_string()).collect();
    assert_eq!(conn.get_match_last_index(probe).await.unwrap(), 3);

    let probe: Vec<String> =
        ["key1", "key2", "key3", "x"].iter().map(|s| s.to_string()).collect();
    assert_eq!(conn.get_match_last_index(probe).await.unwrap(), 2);

    assert_eq!(conn.get_match_last_index(vec!["A".to_string()]).await.unwrap(), -1);
    conn.close().await.unwrap();
}

#[tokio::test]
async fn read_of_unbound_key_fails_at_sync() {
    init_tracing();
    let (port, _shutdown, _server) = start_server(test_server_config()).await;
    let conn = connect(port, ConnectionType::Rdma).await;

    let dst = DeviceBuffer::new(conn.driver(), 0, 4096).unwrap();
    conn.read_cache(dst.tensor(), vec![("missing".into(), 0)], 4096).unwrap();
    assert!(matches!(conn.sync().await, Err(Error::NotFound(_))));

    // The connection stays healthy after an op-level failure.
    assert!(!conn.check_exist("missing").await.unwrap());
    conn.close().await.unwrap();
}

#[tokio::test]
async fn short_key_read_fails_with_invalid_range() {
    init_tracing();
    let (port, _shutdown, _server) = start_server(test_server_config()).await;
    let conn = connect(port, ConnectionType::Rdma).await;

    let data = pattern(512);
    let src = DeviceBuffer::new(conn.driver(), 0, data.len()).unwrap();
    src.fill_from(&data).unwrap();
    conn.write_cache(src.tensor(), vec![("short".into(), 0)], 512).unwrap();
    conn.sync().await.unwrap();

    let dst = DeviceBuffer::new(conn.driver(), 0, 1024).unwrap();
    conn.read_cache(dst.tensor(), vec![("short".into(), 0)], 1024).unwrap();
    assert!(matches!(conn.sync().await, Err(Error::InvalidRange(_))));
    conn.close().await.unwrap();
}

#[tokio::test]
async fn preflight_failures_are_synchronous() {
    init_tracing();
    let (port, _shutdown, _server) = start_server(test_server_config()).await;
    let conn = connect(port, ConnectionType::Rdma).await;

    let src = DeviceBuffer::new(conn.driver(), 0, 1024).unwrap();

    // Offset runs past the tensor.
    assert!(matches!(
        conn.write_cache(src.tensor(), vec![("k".into(), 1024)], 512),
        Err(Error::InvalidRange(_))
    ));

    // Host tensors are rejected before anything is enqueued.
    let host = infinistore::TensorRef::host(src.base(), 1024);
    assert!(matches!(
        conn.write_cache(host, vec![("k".into(), 0)], 512),
        Err(Error::DeviceMismatch(_))
    ));

    // Nothing was deferred, so sync is a no-op barrier.
    conn.sync().await.unwrap();
    conn.close().await.unwrap();
}

#[tokio::test]
async fn pool_exhaustion_rolls_back_whole_batch() {
    init_tracing();
    // Two 64 KB blocks total.
    let config = ServerConfig {
        pool_max_bytes: 128 * 1024,
        slab_bytes: 128 * 1024,
        ..test_server_config()
    };
    let (port, _shutdown, _server) = start_server(config).await;
    let conn = connect(port, ConnectionType::LocalGpu).await;

    let block_size = 64 * 1024u32;
    let data = pattern(3 * block_size as usize);
    let src = DeviceBuffer::new(conn.driver(), 0, data.len()).unwrap();
    src.fill_from(&data).unwrap();

    let blocks: Vec<(String, u64)> = (0..3)
        .map(|i| (format!("over_{i}"), i as u64 * block_size as u64))
        .collect();
    conn.write_cache(src.tensor(), blocks, block_size).unwrap();
    assert!(matches!(conn.sync().await, Err(Error::PoolExhausted)));

    // All-or-nothing: no key of the failed batch is bound.
    for i in 0..3 {
        assert!(!conn.check_exist(&format!("over_{i}")).await.unwrap());
    }

    // The rolled-back blocks are usable again.
    let blocks: Vec<(String, u64)> = (0..2)
        .map(|i| (format!("fits_{i}"), i as u64 * block_size as u64))
        .collect();
    conn.write_cache(src.tensor(), blocks, block_size).unwrap();
    conn.sync().await.unwrap();
    assert!(conn.check_exist("fits_0").await.unwrap());
    assert!(conn.check_exist("fits_1").await.unwrap());
    conn.close().await.unwrap();
}

#[tokio::test]
async fn rebinding_a_key_replaces_and_releases() {
    init_tracing();
    // One slab of two blocks; repeated rebinds only work if prior blocks are
    // released.
    let config = ServerConfig {
        pool_max_bytes: 128 * 1024,
        slab_bytes: 128 * 1024,
        ..test_server_config()
    };
    let (port, _shutdown, _server) = start_server(config).await;
    let conn = connect(port, ConnectionType::Rdma).await;

    let block_size = 64 * 1024u32;
    let dst = DeviceBuffer::new(conn.driver(), 0, block_size as usize).unwrap();

    for round in 0..4u8 {
        let data: Vec<u8> = (0..block_size as usize).map(|i| (i as u8).wrapping_add(round)).collect();
        let src = DeviceBuffer::new(conn.driver(), 0, data.len()).unwrap();
        src.fill_from(&data).unwrap();
        conn.write_cache(src.tensor(), vec![("rebound".into(), 0)], block_size).unwrap();
        conn.sync().await.unwrap();

        conn.read_cache(dst.tensor(), vec![("rebound".into(), 0)], block_size).unwrap();
        conn.sync().await.unwrap();
        assert_eq!(dst.to_vec().unwrap(), data);
    }
    conn.close().await.unwrap();
}
