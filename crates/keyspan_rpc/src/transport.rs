//! Framed-TCP transport for the storage plane.
//!
//! Frames are `u32` big-endian payload length, `u32` big-endian crc32 of the
//! payload, then a JSON payload. One connection serves one request: the
//! client dials per call, mirroring a channel-per-request RPC stack. Connect
//! is bounded (default 3000 ms); the call itself is not, since the proxy must
//! outlive slow stores. Retry policy lives above this layer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::message::{StoreReq, StoreRes};
use crate::service::{RpcError, StoreHandler, StoreService};

/// Default connect timeout for store channels.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Upper bound on a single frame; anything larger is treated as corruption.
const MAX_FRAME_LEN: usize = 256 << 20;

/// Storage-plane client that dials the target per call.
#[derive(Debug, Clone)]
pub struct TcpStoreClient {
    connect_timeout: Duration,
}

impl TcpStoreClient {
    pub fn new() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout: connect_timeout.max(Duration::from_millis(1)),
        }
    }
}

impl Default for TcpStoreClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreService for TcpStoreClient {
    async fn query(&self, addr: SocketAddr, req: StoreReq) -> Result<StoreRes, RpcError> {
        let connect = TcpStream::connect(addr);
        let mut stream = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(RpcError::Connect { addr, source }),
            Err(_) => {
                return Err(RpcError::ConnectTimeout {
                    addr,
                    timeout_ms: self.connect_timeout.as_millis() as u64,
                })
            }
        };

        write_frame(&mut stream, addr, &req).await?;
        read_frame(&mut stream, addr).await
    }
}

/// Hosts a [`StoreHandler`] on an accepted listener until the listener fails.
/// Each connection is served on its own task.
pub async fn serve_store(listener: TcpListener, handler: Arc<dyn StoreHandler>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(error = ?err, "store listener accept failed");
                continue;
            }
        };
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_connection(stream, peer, handler).await {
                tracing::debug!(%peer, error = %err, "store connection closed with error");
            }
        });
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn StoreHandler>,
) -> Result<(), RpcError> {
    let req: StoreReq = read_frame(&mut stream, peer).await?;
    let res = handler.query(req).await;
    write_frame(&mut stream, peer, &res).await
}

async fn write_frame<T: Serialize>(
    stream: &mut TcpStream,
    addr: SocketAddr,
    value: &T,
) -> Result<(), RpcError> {
    let payload = serde_json::to_vec(value).map_err(|err| RpcError::Frame {
        addr,
        reason: format!("encode: {err}"),
    })?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&payload);
    let checksum = hasher.finalize();

    let io = |source| RpcError::Io { addr, source };
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .map_err(io)?;
    stream.write_all(&checksum.to_be_bytes()).await.map_err(io)?;
    stream.write_all(&payload).await.map_err(io)?;
    stream.flush().await.map_err(io)?;
    Ok(())
}

async fn read_frame<T: DeserializeOwned>(
    stream: &mut TcpStream,
    addr: SocketAddr,
) -> Result<T, RpcError> {
    let mut header = [0u8; 8];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|source| RpcError::Io { addr, source })?;
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let expected_crc = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_FRAME_LEN {
        return Err(RpcError::Frame {
            addr,
            reason: format!("frame length {len} exceeds limit"),
        });
    }

    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|source| RpcError::Io { addr, source })?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&payload);
    if hasher.finalize() != expected_crc {
        return Err(RpcError::Frame {
            addr,
            reason: "checksum mismatch".to_string(),
        });
    }

    serde_json::from_slice(&payload).map_err(|err| RpcError::Frame {
        addr,
        reason: format!("decode: {err}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ErrCode, OpType, PlanNode, PlanNodeKind, TransactionInfo};

    struct EchoStore;

    #[async_trait]
    impl StoreHandler for EchoStore {
        async fn query(&self, req: StoreReq) -> StoreRes {
            let mut res = StoreRes::success();
            res.affected_rows = req.region_id as i64;
            res
        }
    }

    fn request(region_id: u64) -> StoreReq {
        StoreReq {
            op_type: OpType::Select,
            region_id,
            region_version: 1,
            log_id: 42,
            tuples: Vec::new(),
            txn_info: TransactionInfo::default(),
            plan: PlanNode::leaf(PlanNodeKind::TableScan, 1),
            select_without_leader: true,
        }
    }

    #[tokio::test]
    async fn query_round_trips_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(serve_store(listener, Arc::new(EchoStore)));

        let client = TcpStoreClient::new();
        let res = client.query(addr, request(9)).await.expect("query");
        assert_eq!(res.errcode, ErrCode::Success);
        assert_eq!(res.affected_rows, 9);
    }

    #[tokio::test]
    async fn connect_failure_is_a_transport_error() {
        // Port 1 on loopback is almost certainly closed.
        let addr: SocketAddr = "127.0.0.1:1".parse().expect("addr");
        let client = TcpStoreClient::with_connect_timeout(Duration::from_millis(200));
        let err = client.query(addr, request(1)).await.expect_err("must fail");
        match err {
            RpcError::Connect { .. } | RpcError::ConnectTimeout { .. } => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
