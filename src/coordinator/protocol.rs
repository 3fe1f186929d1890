//! The round state machine.
//!
//! [`RoundCoordinator`] does no I/O. The connection multiplexer reports what happens on the
//! network (a client connected, sent an update or went away) and the coordinator answers with
//! [`Event`]s describing what must be sent or persisted, in order.
//!
//! ```text
//! AwaitingClients --(first connection)--> Collecting
//! Collecting --(round complete)--> Broadcasting
//! Broadcasting --(broadcast done, rounds left)--> Collecting
//! Broadcasting --(broadcast done, last round)--> Terminated
//! ```

use std::{cmp, collections::VecDeque};

use derive_more::Display;
use thiserror::Error;

use super::aggregation::{
    AggregationEngine,
    AggregationError,
    DivisionError,
    ProtocolViolation,
    RoundOutcome,
};
use crate::{
    common::SessionId,
    message::{ClientUpdate, GlobalModelMessage},
    model::Model,
    settings::{ClientLossPolicy, EmptyRoundPolicy, RoundSettings},
};

/// The phases of the coordinator.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No client connected yet.
    AwaitingClients,
    /// Updates are being collected for the current round.
    Collecting,
    /// The new global model is being sent to every client.
    Broadcasting,
    /// All rounds are done.
    Terminated,
}

/// Progress of the training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerRunState {
    pub rounds_configured: u64,
    pub rounds_completed: u64,
    /// Set once `rounds_completed == rounds_configured`. Every model sent afterwards tells the
    /// clients to stop.
    pub stop_requested: bool,
}

/// The current global model.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalModel {
    pub weights: Model,
    /// The number of the round that produced the weights, `0` for the initial model.
    pub version: u64,
}

/// Actions requested by the [`RoundCoordinator`]. They must be carried out in the order in
/// which they are emitted.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Send the global model to one client.
    Send(SessionId, GlobalModelMessage),
    /// Persist the global model of a completed round. The broadcast that follows must wait
    /// until the snapshot is durable.
    Persist { round: u64, model: Model },
    /// Send the global model to every connected client, then call
    /// [`RoundCoordinator::end_broadcast`].
    Broadcast(GlobalModelMessage),
}

/// An update or a disconnection the coordinator could not process.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoundError {
    #[error(transparent)]
    Violation(#[from] ProtocolViolation),

    /// The round could not be averaged. The run is over.
    #[error(transparent)]
    Division(#[from] DivisionError),

    #[error("no update expected in phase {0}")]
    UnexpectedUpdate(Phase),
}

/// The state owned by the coordinator.
#[derive(Debug)]
pub struct ServerState {
    pub phase: Phase,
    pub run: ServerRunState,
    pub global: GlobalModel,
    engine: AggregationEngine,
    /// The number of connected sessions.
    connected: usize,
    /// Whether the configured number of clients has been connected at once.
    membership_filled: bool,
    /// Sessions that reported in the current round and disconnected since.
    departed_reports: usize,
}

/// The round state machine.
pub struct RoundCoordinator {
    settings: RoundSettings,
    state: ServerState,
    events: VecDeque<Event>,
}

impl RoundCoordinator {
    /// Creates a coordinator that starts from the `initial` global model.
    pub fn new(settings: RoundSettings, initial: Model) -> Self {
        let state = ServerState {
            phase: Phase::AwaitingClients,
            run: ServerRunState {
                rounds_configured: settings.rounds,
                rounds_completed: 0,
                stop_requested: false,
            },
            engine: AggregationEngine::new(initial.len()),
            global: GlobalModel {
                weights: initial,
                version: 0,
            },
            connected: 0,
            membership_filled: false,
            departed_reports: 0,
        };
        Self {
            settings,
            state,
            events: VecDeque::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn run_state(&self) -> ServerRunState {
        self.state.run
    }

    pub fn global_model(&self) -> &GlobalModel {
        &self.state.global
    }

    pub fn is_terminated(&self) -> bool {
        self.state.phase == Phase::Terminated
    }

    /// The number of sessions the coordinator believes to be connected.
    pub fn connected(&self) -> usize {
        self.state.connected
    }

    /// The number of reports the current round waits for.
    pub fn expected_reports(&self) -> usize {
        let clients = self.settings.clients;
        match self.settings.on_client_loss {
            ClientLossPolicy::Wait => clients,
            ClientLossPolicy::Shrink if self.state.membership_filled => cmp::min(
                clients,
                self.state.connected + self.state.departed_reports,
            ),
            ClientLossPolicy::Shrink => clients,
        }
    }

    /// Retrieves the next event.
    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    fn emit_event(&mut self, event: Event) {
        self.events.push_back(event);
    }

    fn snapshot(&self) -> GlobalModelMessage {
        GlobalModelMessage {
            stop: self.state.run.stop_requested,
            weights: self.state.global.weights.clone(),
        }
    }

    /// Handles a new connection: the client immediately gets the current global model.
    pub fn on_connect(&mut self, session: SessionId) {
        if self.is_terminated() {
            return;
        }
        self.state.connected += 1;
        if self.state.connected >= self.settings.clients {
            self.state.membership_filled = true;
        }
        if self.state.phase == Phase::AwaitingClients {
            debug!("first client connected, collecting updates");
            self.state.phase = Phase::Collecting;
        }
        let snapshot = self.snapshot();
        self.emit_event(Event::Send(session, snapshot));
    }

    /// Handles an update.
    ///
    /// # Errors
    /// - [`RoundError::Violation`] if the update was rejected. See
    ///   [`ProtocolViolation::is_fatal`] to decide whether to drop the client.
    /// - [`RoundError::Division`] if the round completed with partition sizes summing up to zero
    ///   and the run must be aborted.
    pub fn on_update(
        &mut self,
        session: SessionId,
        update: &ClientUpdate,
    ) -> Result<(), RoundError> {
        if self.state.phase != Phase::Collecting {
            return Err(RoundError::UnexpectedUpdate(self.state.phase));
        }
        let expected = self.expected_reports();
        let outcome = self.state.engine.submit(
            session,
            &update.partition_sizes,
            &update.weights,
            expected,
        );
        debug!(
            "{} of {} clients reported in round {}",
            self.state.engine.reported_count(),
            expected,
            self.state.run.rounds_completed + 1
        );
        self.handle_outcome(outcome)
    }

    /// Handles the loss of a session.
    ///
    /// Updates already absorbed in the current round are kept. If clients are allowed to leave
    /// the round, this may complete it.
    pub fn on_disconnect(&mut self, session: SessionId) -> Result<(), RoundError> {
        self.state.connected = self.state.connected.saturating_sub(1);
        if self.state.engine.has_reported(session) {
            self.state.departed_reports += 1;
        }
        if self.settings.on_client_loss == ClientLossPolicy::Shrink
            && self.state.phase == Phase::Collecting
        {
            let expected = self.expected_reports();
            info!(
                "client left, round {} now waits for {} clients",
                self.state.run.rounds_completed + 1,
                expected
            );
            let outcome = self.state.engine.try_complete(expected);
            return self.handle_outcome(outcome);
        }
        Ok(())
    }

    /// Marks the broadcast requested by the last [`Event::Broadcast`] as done.
    pub fn end_broadcast(&mut self) {
        if self.state.phase != Phase::Broadcasting {
            error!("not broadcasting");
            return;
        }
        if self.state.run.stop_requested {
            info!("training complete");
            self.state.phase = Phase::Terminated;
        } else {
            self.state.phase = Phase::Collecting;
        }
    }

    fn handle_outcome(
        &mut self,
        outcome: Result<RoundOutcome, AggregationError>,
    ) -> Result<(), RoundError> {
        match outcome {
            Ok(RoundOutcome::Pending) => Ok(()),
            Ok(RoundOutcome::Complete(model)) => {
                self.complete_round(model);
                Ok(())
            }
            Err(AggregationError::Violation(violation)) => Err(violation.into()),
            Err(AggregationError::Division(err)) => self.handle_empty_round(err),
        }
    }

    fn complete_round(&mut self, model: Model) {
        let run = &mut self.state.run;
        run.rounds_completed += 1;
        run.stop_requested = run.rounds_completed >= run.rounds_configured;
        let round = run.rounds_completed;
        info!(
            "round {} of {} done (stop: {})",
            round, run.rounds_configured, run.stop_requested
        );

        self.state.global = GlobalModel {
            weights: model.clone(),
            version: round,
        };
        self.state.departed_reports = 0;
        self.state.phase = Phase::Broadcasting;

        self.emit_event(Event::Persist { round, model });
        let snapshot = self.snapshot();
        self.emit_event(Event::Broadcast(snapshot));
    }

    fn handle_empty_round(&mut self, err: DivisionError) -> Result<(), RoundError> {
        self.state.departed_reports = 0;
        match self.settings.on_empty_round {
            EmptyRoundPolicy::Abort => {
                error!("{}, aborting", err);
                self.state.phase = Phase::Terminated;
                Err(err.into())
            }
            EmptyRoundPolicy::Retry => {
                warn!(
                    "{}, discarding round {} and resending the current model",
                    err,
                    self.state.run.rounds_completed + 1
                );
                self.state.phase = Phase::Broadcasting;
                let snapshot = self.snapshot();
                self.emit_event(Event::Broadcast(snapshot));
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(clients: usize, rounds: u64) -> RoundSettings {
        RoundSettings {
            clients,
            rounds,
            on_client_loss: ClientLossPolicy::Wait,
            on_empty_round: EmptyRoundPolicy::Abort,
        }
    }

    fn update(size: u64, weight: f64) -> ClientUpdate {
        ClientUpdate {
            client_id: format!("client-{}", size).into(),
            weights: vec![Model::from(vec![weight])],
            partition_sizes: vec![size],
        }
    }

    fn events(coordinator: &mut RoundCoordinator) -> Vec<Event> {
        std::iter::from_fn(|| coordinator.next_event()).collect()
    }

    fn connect(coordinator: &mut RoundCoordinator, id: u64) -> SessionId {
        let session = SessionId(id);
        coordinator.on_connect(session);
        session
    }

    #[test]
    fn test_new_clients_receive_current_model() {
        let mut coordinator = RoundCoordinator::new(settings(2, 1), Model::from(vec![0.5]));
        assert_eq!(coordinator.phase(), Phase::AwaitingClients);

        let a = connect(&mut coordinator, 0);
        assert_eq!(coordinator.phase(), Phase::Collecting);
        assert_eq!(
            events(&mut coordinator),
            vec![Event::Send(
                a,
                GlobalModelMessage {
                    stop: false,
                    weights: Model::from(vec![0.5])
                }
            )]
        );
    }

    #[test]
    fn test_single_round() {
        let mut coordinator = RoundCoordinator::new(settings(2, 1), Model::zeros(1));
        let a = connect(&mut coordinator, 0);
        let b = connect(&mut coordinator, 1);
        events(&mut coordinator);

        coordinator.on_update(a, &update(10, 1.)).unwrap();
        assert!(events(&mut coordinator).is_empty());
        assert_eq!(coordinator.phase(), Phase::Collecting);

        coordinator.on_update(b, &update(30, 3.)).unwrap();
        assert_eq!(coordinator.phase(), Phase::Broadcasting);
        let expected = Model::from(vec![2.5]);
        assert_eq!(
            events(&mut coordinator),
            vec![
                Event::Persist {
                    round: 1,
                    model: expected.clone()
                },
                Event::Broadcast(GlobalModelMessage {
                    stop: true,
                    weights: expected.clone()
                }),
            ]
        );
        assert_eq!(
            coordinator.global_model(),
            &GlobalModel {
                weights: expected,
                version: 1
            }
        );

        coordinator.end_broadcast();
        assert!(coordinator.is_terminated());
        assert_eq!(
            coordinator.run_state(),
            ServerRunState {
                rounds_configured: 1,
                rounds_completed: 1,
                stop_requested: true
            }
        );
    }

    #[test]
    fn test_stop_flag_is_only_set_after_last_round() {
        let mut coordinator = RoundCoordinator::new(settings(2, 2), Model::zeros(1));
        let a = connect(&mut coordinator, 0);
        let b = connect(&mut coordinator, 1);
        events(&mut coordinator);

        for round in 1..=2 {
            coordinator.on_update(a, &update(1, 1.)).unwrap();
            coordinator.on_update(b, &update(1, 3.)).unwrap();
            let stop = round == 2;
            match events(&mut coordinator).as_slice() {
                [Event::Persist { round: r, .. }, Event::Broadcast(message)] => {
                    assert_eq!(*r, round);
                    assert_eq!(message.stop, stop);
                }
                other => panic!("unexpected events: {:?}", other),
            }
            coordinator.end_broadcast();
            assert_eq!(coordinator.is_terminated(), stop);
        }
        assert_eq!(coordinator.run_state().rounds_completed, 2);

        // nothing is accepted after termination
        assert_eq!(
            coordinator.on_update(a, &update(1, 1.)),
            Err(RoundError::UnexpectedUpdate(Phase::Terminated))
        );
        coordinator.on_connect(SessionId(5));
        assert!(events(&mut coordinator).is_empty());
    }

    #[test]
    fn test_duplicate_update() {
        let mut coordinator = RoundCoordinator::new(settings(2, 1), Model::zeros(1));
        let a = connect(&mut coordinator, 0);
        connect(&mut coordinator, 1);
        coordinator.on_update(a, &update(1, 1.)).unwrap();
        assert_eq!(
            coordinator.on_update(a, &update(1, 1.)),
            Err(ProtocolViolation::DuplicateReport.into())
        );
        assert_eq!(coordinator.phase(), Phase::Collecting);
    }

    #[test]
    fn test_empty_round_aborts() {
        let mut coordinator = RoundCoordinator::new(settings(1, 3), Model::from(vec![9.]));
        let a = connect(&mut coordinator, 0);
        events(&mut coordinator);

        assert_eq!(
            coordinator.on_update(a, &update(0, 1.)),
            Err(DivisionError.into())
        );
        assert!(coordinator.is_terminated());
        assert!(events(&mut coordinator).is_empty());
        // the global model is untouched
        assert_eq!(
            coordinator.global_model(),
            &GlobalModel {
                weights: Model::from(vec![9.]),
                version: 0
            }
        );
    }

    #[test]
    fn test_empty_round_retries() {
        let mut settings = settings(1, 1);
        settings.on_empty_round = EmptyRoundPolicy::Retry;
        let mut coordinator = RoundCoordinator::new(settings, Model::from(vec![9.]));
        let a = connect(&mut coordinator, 0);
        events(&mut coordinator);

        coordinator.on_update(a, &update(0, 1.)).unwrap();
        assert_eq!(
            events(&mut coordinator),
            vec![Event::Broadcast(GlobalModelMessage {
                stop: false,
                weights: Model::from(vec![9.])
            })]
        );
        coordinator.end_broadcast();
        assert_eq!(coordinator.phase(), Phase::Collecting);
        assert_eq!(coordinator.run_state().rounds_completed, 0);

        // the client can submit again
        coordinator.on_update(a, &update(2, 4.)).unwrap();
        assert_eq!(coordinator.global_model().weights, Model::from(vec![4.]));
    }

    #[test]
    fn test_client_loss_blocks_round_when_waiting() {
        let mut coordinator = RoundCoordinator::new(settings(2, 1), Model::zeros(1));
        let a = connect(&mut coordinator, 0);
        let b = connect(&mut coordinator, 1);
        coordinator.on_update(a, &update(1, 1.)).unwrap();
        coordinator.on_disconnect(b).unwrap();
        events(&mut coordinator);

        assert_eq!(coordinator.expected_reports(), 2);
        assert_eq!(coordinator.phase(), Phase::Collecting);
        assert_eq!(coordinator.connected(), 1);
    }

    #[test]
    fn test_client_loss_shrinks_round() {
        let mut settings = settings(3, 2);
        settings.on_client_loss = ClientLossPolicy::Shrink;
        let mut coordinator = RoundCoordinator::new(settings, Model::zeros(1));
        let a = connect(&mut coordinator, 0);
        let b = connect(&mut coordinator, 1);

        // the membership is not complete yet, so losing a client does not lower the target
        coordinator.on_disconnect(b).unwrap();
        assert_eq!(coordinator.expected_reports(), 3);
        let b = connect(&mut coordinator, 2);
        let c = connect(&mut coordinator, 3);
        events(&mut coordinator);

        // a reports then leaves: its update still counts
        coordinator.on_update(a, &update(1, 1.)).unwrap();
        coordinator.on_disconnect(a).unwrap();
        assert_eq!(coordinator.expected_reports(), 3);
        coordinator.on_update(b, &update(1, 3.)).unwrap();
        assert!(events(&mut coordinator).is_empty());

        // c leaves without reporting: the round completes with a and b
        coordinator.on_disconnect(c).unwrap();
        assert_eq!(coordinator.phase(), Phase::Broadcasting);
        assert_eq!(coordinator.global_model().weights, Model::from(vec![2.]));
        coordinator.end_broadcast();

        // only b is left for the second round
        assert_eq!(coordinator.expected_reports(), 1);
        coordinator.on_update(b, &update(1, 5.)).unwrap();
        assert_eq!(coordinator.global_model().weights, Model::from(vec![5.]));
    }
}
