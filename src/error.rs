use thiserror::Error;

use crate::data::SubKey;

/// Errors surfaced to an RPC caller from the core. These are error *kinds*,
/// not transport codes; the RPC layer is responsible for mapping them.
#[derive(Error, Debug)]
pub enum TqError {
    #[error("subscription {0:?} not found")]
    NotFound(SubKey),

    #[error("stream task {0} not found")]
    TaskNotFound(u32),

    #[error("consumer mismatch for subscription {sub:?}: handle owned by {owner}, request from {requester}")]
    ConsumerMismatch {
        sub: SubKey,
        owner: i64,
        requester: i64,
    },

    #[error("no committed offset for subscription {0:?} and reset policy is NONE")]
    NoCommittedOffset(SubKey),

    #[error("downstream task {0} is not ready (status != NORMAL)")]
    DownstreamEjected(u32),

    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    #[error("failed to decode request: {0}")]
    Decode(String),

    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

pub type TqResult<T> = Result<T, TqError>;
