//! Transactional query fan-out core for the keyspan SQL middleware.
//!
//! A planned fragment comes in with the set of regions it touches; the
//! executor locates each region's leader through the [`directory`], issues
//! bounded-concurrency RPCs through a [`keyspan_rpc::StoreService`], absorbs
//! leader changes, replays, and splits per region, and feeds row batches into
//! the [`merger`] which re-imposes a single ordered output stream.

pub mod config;
pub mod directory;
pub mod error;
pub mod executor;
pub mod fragment;
pub mod merger;
pub mod session;

pub use config::ProxyConfig;
pub use directory::RegionDirectory;
pub use error::FanoutError;
pub use executor::{FanoutExecutor, QueryContext};
pub use fragment::{Fragment, MemRow, OrderByKey, RowBatch};
pub use merger::Sorter;
pub use session::SessionState;
