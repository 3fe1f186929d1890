//! # fedavg-server: round based federated averaging
//!
//! A single coordinator accepts TCP connections from a fixed number of participants. In every
//! round it collects exactly one weighted model update from each participant, averages the
//! updates weighted by their partition sizes and broadcasts the new global model back to all
//! participants, until the configured number of rounds is done.
//!
//! The crate is split along the data flow of a round:
//!
//! - [`message`]: the length-prefixed wire format and the payloads exchanged with participants.
//! - [`coordinator`]: the client registry, the aggregation engine, the round state machine and
//!   the connection multiplexer driving them.
//! - [`storage`]: persistence of the global model snapshot of every completed round.
//! - [`settings`]: loading and validation of the configuration.
//! - [`client`]: a participant speaking the same wire protocol.

#[macro_use]
extern crate tracing;

pub mod client;
pub mod common;
pub mod coordinator;
pub mod message;
pub mod model;
pub mod settings;
pub mod storage;
