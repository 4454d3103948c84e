//! Seams between the state machine and the replicated log driving it.
//!
//! The log itself (election, replication, entry commit) is an external
//! collaborator. These types are the contract it drives the state machine
//! through: committed entries with optional closures, snapshot writer/reader
//! handles, and a leadership probe used to gate heartbeats and sweeps.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use keyspan_rpc::MetaResponse;
use tokio::sync::oneshot;

/// One committed log entry handed to `on_apply`.
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    /// Serialized `MetaRequest`.
    pub data: Bytes,
    /// Present when this node proposed the entry and a caller is waiting.
    pub done: Option<ApplyClosure>,
}

/// Completion handle for a proposed entry. Completing it wakes the proposing
/// task on its own scheduler thread; the apply loop never runs continuations.
pub struct ApplyClosure {
    response_tx: oneshot::Sender<MetaResponse>,
    proposed_at: Instant,
}

impl ApplyClosure {
    pub fn new() -> (Self, oneshot::Receiver<MetaResponse>) {
        let (response_tx, response_rx) = oneshot::channel();
        (
            Self {
                response_tx,
                proposed_at: Instant::now(),
            },
            response_rx,
        )
    }

    /// Time between propose and apply, recorded as raft-apply latency.
    pub fn elapsed(&self) -> Duration {
        self.proposed_at.elapsed()
    }

    pub fn complete(self, response: MetaResponse) {
        // The proposer may have given up waiting; that is not an error.
        let _ = self.response_tx.send(response);
    }
}

/// Leadership probe backed by the consensus node.
pub trait LeaderStatus: Send + Sync {
    fn is_leader(&self) -> bool;
    fn leader_endpoint(&self) -> Option<SocketAddr>;
}

/// Snapshot output handle: a directory plus a file registry.
pub trait SnapshotWriter: Send + Sync {
    fn path(&self) -> &Path;
    fn add_file(&self, name: &str) -> anyhow::Result<()>;
}

/// Snapshot input handle for installation.
pub trait SnapshotReader: Send + Sync {
    fn path(&self) -> &Path;
    fn list_files(&self) -> Vec<String>;
}

/// Directory-backed snapshot writer.
pub struct DirSnapshotWriter {
    dir: PathBuf,
    files: Mutex<Vec<String>>,
}

impl DirSnapshotWriter {
    pub fn create(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).context("create snapshot dir")?;
        Ok(Self {
            dir,
            files: Mutex::new(Vec::new()),
        })
    }

    pub fn registered_files(&self) -> Vec<String> {
        self.files.lock().unwrap().clone()
    }
}

impl SnapshotWriter for DirSnapshotWriter {
    fn path(&self) -> &Path {
        &self.dir
    }

    fn add_file(&self, name: &str) -> anyhow::Result<()> {
        if !self.dir.join(name).is_file() {
            anyhow::bail!("snapshot file {name} was not written");
        }
        self.files.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

/// Directory-backed snapshot reader.
pub struct DirSnapshotReader {
    dir: PathBuf,
}

impl DirSnapshotReader {
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl SnapshotReader for DirSnapshotReader {
    fn path(&self) -> &Path {
        &self.dir
    }

    fn list_files(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut files: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        files.sort();
        files
    }
}

/// Test/bench leadership toggle; production wires the consensus node instead.
pub struct StaticLeaderStatus {
    leader: AtomicBool,
    leader_endpoint: Mutex<Option<SocketAddr>>,
}

impl StaticLeaderStatus {
    pub fn new(leader: bool) -> Arc<Self> {
        Arc::new(Self {
            leader: AtomicBool::new(leader),
            leader_endpoint: Mutex::new(None),
        })
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::Release);
    }

    pub fn set_leader_endpoint(&self, endpoint: Option<SocketAddr>) {
        *self.leader_endpoint.lock().unwrap() = endpoint;
    }
}

impl LeaderStatus for StaticLeaderStatus {
    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    fn leader_endpoint(&self) -> Option<SocketAddr> {
        *self.leader_endpoint.lock().unwrap()
    }
}
