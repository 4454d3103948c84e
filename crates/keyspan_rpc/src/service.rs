//! Client/server trait seams for the storage and meta planes.

use std::net::SocketAddr;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::{
    ProxyHeartBeatRequest, ProxyHeartBeatResponse, StoreHeartBeatRequest, StoreHeartBeatResponse,
    StoreReq, StoreRes,
};

/// Transport-level failure talking to a store. Protocol-level failures travel
/// inside [`StoreRes::errcode`]; an `RpcError` means the response never
/// arrived at all.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("connect to {addr} timed out after {timeout_ms}ms")]
    ConnectTimeout { addr: SocketAddr, timeout_ms: u64 },
    #[error("io error talking to {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("frame decode failed from {addr}: {reason}")]
    Frame { addr: SocketAddr, reason: String },
}

/// Storage-plane client seam. The fan-out executor is written against this
/// trait; production uses the framed-TCP client, tests use scripted mocks.
#[async_trait]
pub trait StoreService: Send + Sync {
    async fn query(&self, addr: SocketAddr, req: StoreReq) -> Result<StoreRes, RpcError>;
}

/// Server-side handler for one hosted store endpoint.
#[async_trait]
pub trait StoreHandler: Send + Sync {
    async fn query(&self, req: StoreReq) -> StoreRes;
}

/// Meta-plane heartbeat handlers, implemented by the meta state machine.
#[async_trait]
pub trait MetaService: Send + Sync {
    async fn store_heartbeat(&self, req: StoreHeartBeatRequest) -> StoreHeartBeatResponse;
    async fn proxy_heartbeat(&self, req: ProxyHeartBeatRequest) -> ProxyHeartBeatResponse;
}
