//! Messages exchanged between the coordinator and the participants.
//!
//! # Wire format
//!
//! Every message travels as one frame:
//!
//! ```text
//! +---------------------------+--------------------------------+
//! | header (`width` bytes)    | body (`length` bytes)          |
//! | ASCII decimal `length`,   | bincode encoded payload        |
//! | left justified, padded    |                                |
//! | with spaces               |                                |
//! +---------------------------+--------------------------------+
//! ```
//!
//! The header width is a deployment setting (10 bytes by default) and must be the same on both
//! ends. See [`MessageCodec`] for encoding and decoding, and [`FrameReader`] for reading frames
//! incrementally from a non-blocking transport.
//!
//! # Payloads
//!
//! There is one fixed payload type per direction:
//!
//! - participant to coordinator: [`ClientUpdate`]
//! - coordinator to participant: [`GlobalModelMessage`]

mod codec;

pub use self::codec::{
    FrameError,
    FrameReader,
    MessageCodec,
    TransportError,
    DEFAULT_HEADER_WIDTH,
    DEFAULT_MAX_MESSAGE_SIZE,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{common::ClientIdentity, model::Model};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The local result of a participant for the current round.
///
/// A participant that holds several partitions of the training data sends one model per
/// partition: `weights[i]` was trained on a partition of `partition_sizes[i]` samples.
pub struct ClientUpdate {
    /// The identity of the participant.
    pub client_id: ClientIdentity,
    /// The locally trained models, one per partition.
    pub weights: Vec<Model>,
    /// The partition sizes the models are weighted with.
    pub partition_sizes: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The global model as broadcast by the coordinator.
pub struct GlobalModelMessage {
    /// Whether training is over. Participants must disconnect once they receive a message with
    /// this flag set.
    pub stop: bool,
    /// The weights of the global model.
    pub weights: Model,
}

#[derive(Debug, Error, PartialEq, Eq)]
/// An invalid frame header.
pub enum FramingError {
    #[error("invalid frame header {0:?}: not an unsigned decimal number")]
    NotNumeric(String),

    #[error("invalid frame header: expected {expected} bytes, got {actual}")]
    InvalidHeaderLength { expected: usize, actual: usize },

    #[error("frame body of {length} bytes exceeds the maximum of {max} bytes")]
    TooLarge { length: usize, max: usize },

    #[error("frame body of {length} bytes does not fit into a {width} bytes header")]
    HeaderOverflow { length: usize, width: usize },
}

#[derive(Debug, Error)]
#[error("failed to decode message body: {0}")]
/// A frame body that could not be deserialized into the expected payload.
pub struct DecodeError(#[from] bincode::Error);

#[derive(Debug, Error)]
/// A payload that could not be encoded into a frame.
pub enum EncodeError {
    #[error("failed to serialize message body: {0}")]
    Serialization(#[from] bincode::Error),

    #[error(transparent)]
    Framing(#[from] FramingError),
}
