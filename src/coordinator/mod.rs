//! The coordinator: it owns the connected clients and drives the training rounds.
//!
//! - [`registry`] keeps track of the connected clients and owns their transports.
//! - [`aggregation`] accumulates the updates of a round and computes the weighted average.
//! - [`protocol`] is the round state machine. It does no I/O.
//! - [`CoordinatorService`] multiplexes the listener and the client connections on a single task
//!   and feeds the state machine.

pub mod aggregation;
pub mod protocol;
pub mod registry;
mod service;

use thiserror::Error;

pub use self::{
    aggregation::{AggregationEngine, DivisionError, ProtocolViolation},
    protocol::{GlobalModel, Phase, RoundCoordinator, ServerRunState},
    registry::{ClientRegistry, ClientSession},
    service::{Acceptor, CoordinatorService},
};
use crate::{
    message::{DecodeError, EncodeError, FrameError, FramingError, TransportError},
    storage::StorageError,
};

#[derive(Debug, Error)]
/// A failure confined to one client. The client is dropped, the other clients are not affected.
pub enum ClientError {
    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
}

impl From<FrameError> for ClientError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Framing(err) => ClientError::Framing(err),
            FrameError::Transport(err) => ClientError::Transport(err),
        }
    }
}

#[derive(Debug, Error)]
/// A failure that ends the whole run.
pub enum ServiceError {
    #[error("failed to persist the global model: {0:#}")]
    Storage(StorageError),

    #[error("training aborted: {0}")]
    Division(#[from] DivisionError),

    #[error("failed to encode the global model: {0}")]
    Encode(#[from] EncodeError),
}
