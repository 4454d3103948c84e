//! Manager-level error carrying the wire error code for the closure response.

use keyspan_rpc::ErrCode;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{msg}")]
pub struct MetaError {
    pub errcode: ErrCode,
    pub msg: String,
}

impl MetaError {
    pub fn input(msg: impl Into<String>) -> Self {
        Self {
            errcode: ErrCode::InputParamError,
            msg: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            errcode: ErrCode::InternalError,
            msg: msg.into(),
        }
    }
}

impl From<anyhow::Error> for MetaError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{err:#}"))
    }
}
