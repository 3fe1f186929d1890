//! Weighted averaging of the updates of a round.

use std::{collections::HashSet, mem};

use thiserror::Error;

use crate::{
    common::SessionId,
    model::{Model, ModelLengthError},
};

/// The result of submitting an update.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutcome {
    /// More updates are needed to complete the round.
    Pending,
    /// The round is complete. Contains the new global model.
    Complete(Model),
}

#[derive(Debug, Error, PartialEq, Eq)]
/// An update that breaks the protocol.
pub enum ProtocolViolation {
    #[error("the client already reported in this round")]
    DuplicateReport,

    #[error("the update does not contain any partition")]
    NoPartitions,

    #[error("the update contains {weights} models for {sizes} partition sizes")]
    PartitionMismatch { sizes: usize, weights: usize },

    #[error(transparent)]
    ModelLength(#[from] ModelLengthError),

    #[error("the partition sizes of the round do not fit into 64 bits")]
    PartitionSizeOverflow,
}

impl ProtocolViolation {
    /// Whether the client must be dropped.
    ///
    /// A duplicate report is only discarded: the first report of the round stands and the
    /// client stays connected.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtocolViolation::DuplicateReport)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot average the round: the partition sizes sum up to zero")]
/// The partition sizes of a complete round sum up to zero.
pub struct DivisionError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregationError {
    #[error("rejected update: {0}")]
    Violation(#[from] ProtocolViolation),

    #[error(transparent)]
    Division(#[from] DivisionError),
}

#[derive(Debug, Default)]
/// The updates received so far in the current round.
struct RoundAccumulator {
    /// `(partition size, partition size * weights)` for every partition received, in order.
    contributions: Vec<(u64, Model)>,
    /// The sum of the partition sizes received.
    total_partition_size: u64,
    /// The sessions that reported in this round.
    reported: HashSet<SessionId>,
}

impl RoundAccumulator {
    /// Divides the sum of the weighted models by the sum of the partition sizes.
    fn average(self, model_length: usize) -> Result<Model, DivisionError> {
        if self.total_partition_size == 0 {
            return Err(DivisionError);
        }
        let mut sum = Model::zeros(model_length);
        for (_, weighted) in &self.contributions {
            sum += weighted;
        }
        Ok(sum.divided(self.total_partition_size as f64))
    }
}

#[derive(Debug)]
/// Accumulates the weighted updates of the round in progress and computes the new global model
/// once every expected client reported.
///
/// For partition sizes `s_i` and models `w_i` the new global model is
/// `sum(s_i * w_i) / sum(s_i)`. The division happens once, when the round is complete.
pub struct AggregationEngine {
    model_length: usize,
    round: RoundAccumulator,
}

impl AggregationEngine {
    /// Creates an engine for models of `model_length` weights.
    pub fn new(model_length: usize) -> Self {
        Self {
            model_length,
            round: RoundAccumulator::default(),
        }
    }

    /// The number of clients that reported in the current round.
    pub fn reported_count(&self) -> usize {
        self.round.reported.len()
    }

    /// Whether the given session reported in the current round.
    pub fn has_reported(&self, session: SessionId) -> bool {
        self.round.reported.contains(&session)
    }

    /// Adds the update of `session` to the current round. The round completes when `expected`
    /// clients have reported.
    ///
    /// The update is validated as a whole before anything is absorbed: a rejected update leaves
    /// the round untouched.
    ///
    /// # Errors
    /// - [`ProtocolViolation`] if the session already reported in this round or if the update is
    ///   malformed.
    /// - [`DivisionError`] if the round completes with partition sizes summing up to zero. The
    ///   round is discarded in that case.
    pub fn submit(
        &mut self,
        session: SessionId,
        partition_sizes: &[u64],
        weights: &[Model],
        expected: usize,
    ) -> Result<RoundOutcome, AggregationError> {
        self.validate(session, partition_sizes, weights)?;

        for (size, model) in partition_sizes.iter().zip(weights) {
            self.round
                .contributions
                .push((*size, model.scaled(*size as f64)));
            self.round.total_partition_size += size;
        }
        self.round.reported.insert(session);

        self.try_complete(expected)
    }

    /// Completes the current round if at least `expected` clients reported.
    ///
    /// A round without any report never completes.
    pub fn try_complete(&mut self, expected: usize) -> Result<RoundOutcome, AggregationError> {
        let reported = self.reported_count();
        if reported == 0 || reported < expected {
            return Ok(RoundOutcome::Pending);
        }
        let round = mem::take(&mut self.round);
        let model = round.average(self.model_length)?;
        Ok(RoundOutcome::Complete(model))
    }

    fn validate(
        &self,
        session: SessionId,
        partition_sizes: &[u64],
        weights: &[Model],
    ) -> Result<(), ProtocolViolation> {
        if self.has_reported(session) {
            return Err(ProtocolViolation::DuplicateReport);
        }
        if partition_sizes.is_empty() {
            return Err(ProtocolViolation::NoPartitions);
        }
        if partition_sizes.len() != weights.len() {
            return Err(ProtocolViolation::PartitionMismatch {
                sizes: partition_sizes.len(),
                weights: weights.len(),
            });
        }
        for model in weights {
            model.check_len(self.model_length)?;
        }
        partition_sizes
            .iter()
            .try_fold(self.round.total_partition_size, |total, size| {
                total.checked_add(*size)
            })
            .ok_or(ProtocolViolation::PartitionSizeOverflow)?;
        Ok(())
    }
}
