//! Error kinds surfaced by the fan-out executor.

use keyspan_rpc::RpcError;
use thiserror::Error;

/// Per-region and per-call failures. Retriable conditions (leader changes,
/// replays, splits, transient transport errors) are absorbed inside the
/// executor up to the retry budget; what escapes here is final for this call.
/// COMMIT is the exception: the session layer above re-drives it.
#[derive(Debug, Error)]
pub enum FanoutError {
    /// Transport failure that survived the retry budget.
    #[error("rpc to region {region_id} failed: {source}")]
    RpcFailure {
        region_id: u64,
        #[source]
        source: RpcError,
    },

    /// Region has no known leader and no peers to probe.
    #[error("region {region_id} has no known leader or peers")]
    LeaderUnknown { region_id: u64 },

    /// `VersionOld` without a usable region set; topology must be refreshed
    /// out of band.
    #[error("unrecoverable version conflict on region {region_id}")]
    VersionConflict { region_id: u64 },

    /// Store reports the region is gone.
    #[error("region {region_id} no longer exists")]
    RegionGone { region_id: u64 },

    /// Store-side internal failure.
    #[error("store internal error on region {region_id}: {msg}")]
    StoreInternal { region_id: u64, msg: String },

    /// A COMMIT was answered with a replay request; replaying a commit is
    /// never safe, the layer above must re-issue it.
    #[error("commit answered with follow-up on region {region_id}")]
    BadOpForFollowUp { region_id: u64 },

    /// MySQL-level error reported by the store, passed through to the client.
    #[error("mysql error {code}: {msg}")]
    MysqlLevel { code: u16, msg: String },

    /// Retry budget exhausted for one region.
    #[error("region {region_id} exhausted its retry budget")]
    RetryExhausted { region_id: u64 },

    /// Insert dispatch requires an insert node in the plan tree.
    #[error("plan has no insert node")]
    MissingInsertNode,

    /// Row payload from a store could not be decoded.
    #[error("malformed row payload from region {region_id}: {msg}")]
    RowDecode { region_id: u64, msg: String },

    /// Another region of the same call already failed; this dispatch was
    /// short-circuited.
    #[error("dispatch aborted after a peer region failed")]
    Aborted,
}
