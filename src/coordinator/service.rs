use std::{
    fmt::Display,
    io,
    net::SocketAddr,
    task::{Context, Poll},
};

use futures::future::poll_fn;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
};

use super::{
    protocol::{Event, RoundCoordinator, RoundError, ServerRunState},
    registry::ClientRegistry,
    ClientError,
    ServiceError,
};
use crate::{
    common::SessionId,
    message::{ClientUpdate, GlobalModelMessage, MessageCodec},
    model::Model,
    storage::ModelStorage,
};

/// A source of client connections.
pub trait Acceptor {
    type Io: AsyncRead + AsyncWrite + Unpin;

    /// Polls for a new connection.
    fn poll_accept(&mut self, cx: &mut Context) -> Poll<io::Result<(Self::Io, SocketAddr)>>;
}

impl Acceptor for TcpListener {
    type Io = TcpStream;

    fn poll_accept(&mut self, cx: &mut Context) -> Poll<io::Result<(Self::Io, SocketAddr)>> {
        TcpListener::poll_accept(self, cx)
    }
}

/// Something that happened on the listener or on a client connection.
enum Readiness<T> {
    Accepted(io::Result<(T, SocketAddr)>),
    Update(SessionId, Result<ClientUpdate, ClientError>),
    Closed(SessionId),
}

/// The connection multiplexer.
///
/// Waits until the listener or any client connection is ready, handles everything that is ready
/// and feeds the [`RoundCoordinator`], until all the rounds are done. Everything runs on the task
/// awaiting [`CoordinatorService::run`].
pub struct CoordinatorService<A, S>
where
    A: Acceptor,
{
    acceptor: A,
    registry: ClientRegistry<A::Io>,
    coordinator: RoundCoordinator,
    storage: S,
    codec: MessageCodec,
    run_id: String,
}

impl<A, S> CoordinatorService<A, S>
where
    A: Acceptor,
    S: ModelStorage,
{
    pub fn new(
        acceptor: A,
        storage: S,
        coordinator: RoundCoordinator,
        codec: MessageCodec,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            acceptor,
            registry: ClientRegistry::new(),
            coordinator,
            storage,
            codec,
            run_id: run_id.into(),
        }
    }

    /// The current global model.
    pub fn global_model(&self) -> &Model {
        &self.coordinator.global_model().weights
    }

    /// Runs the training until all the rounds are done.
    ///
    /// # Errors
    /// Fails if a global model could not be persisted or encoded, or if a round could not be
    /// averaged and the run must be aborted. Failures of single clients only drop these clients.
    pub async fn run(mut self) -> Result<ServerRunState, ServiceError> {
        info!(
            "waiting for {} clients to train {} rounds",
            self.coordinator.expected_reports(),
            self.coordinator.run_state().rounds_configured
        );
        while !self.coordinator.is_terminated() {
            let ready = poll_fn(|cx| self.poll_ready(cx)).await;
            for readiness in ready {
                self.dispatch(readiness).await?;
                if self.coordinator.is_terminated() {
                    break;
                }
            }
        }
        let run = self.coordinator.run_state();
        info!(
            "stopping after {} rounds, closing {} connections",
            run.rounds_completed,
            self.registry.len()
        );
        Ok(run)
    }

    /// Polls the listener and every client connection once. Returns everything that is ready,
    /// the listener first and then the clients in registration order.
    fn poll_ready(&mut self, cx: &mut Context) -> Poll<Vec<Readiness<A::Io>>> {
        trace!("polling CoordinatorService");
        let mut ready = Vec::new();

        if let Poll::Ready(accepted) = self.acceptor.poll_accept(cx) {
            ready.push(Readiness::Accepted(accepted));
        }

        let codec = self.codec;
        for (id, session) in self.registry.iter_mut() {
            match session.poll_update(cx, &codec) {
                Poll::Ready(Some(update)) => ready.push(Readiness::Update(id, update)),
                Poll::Ready(None) => ready.push(Readiness::Closed(id)),
                Poll::Pending => {}
            }
        }

        if ready.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(ready)
        }
    }

    async fn dispatch(&mut self, readiness: Readiness<A::Io>) -> Result<(), ServiceError> {
        match readiness {
            Readiness::Accepted(Ok((io, address))) => {
                let id = self.registry.register(io, address);
                info!("accepted {} from {}", id, address);
                self.coordinator.on_connect(id);
            }
            Readiness::Accepted(Err(err)) => {
                warn!("failed to accept a connection: {}", err);
            }
            // the session may have been dropped while handling an earlier readiness
            Readiness::Update(id, _) | Readiness::Closed(id) if !self.registry.contains(id) => {}
            Readiness::Update(id, Ok(update)) => self.handle_update(id, update)?,
            Readiness::Update(id, Err(err)) => self.drop_client(id, err)?,
            Readiness::Closed(id) => {
                self.disconnect(id, "connection closed by the client", false)?;
            }
        }
        self.handle_protocol_events().await
    }

    fn handle_update(&mut self, id: SessionId, update: ClientUpdate) -> Result<(), ServiceError> {
        if let Some(previous) = self.registry.bind_identity(id, update.client_id.clone()) {
            if previous != update.client_id {
                debug!("{} renamed from {} to {}", id, previous, update.client_id);
            }
        }
        if let Some(session) = self.registry.get(id) {
            info!(
                client = %session.name(),
                address = %session.address(),
                partitions = update.partition_sizes.len(),
                "received update"
            );
        }

        match self.coordinator.on_update(id, &update) {
            Ok(()) => Ok(()),
            Err(RoundError::Violation(violation)) if violation.is_fatal() => {
                self.drop_client(id, ClientError::Protocol(violation))
            }
            Err(RoundError::Violation(violation)) => {
                warn!(client = %update.client_id, "update discarded: {}", violation);
                Ok(())
            }
            Err(RoundError::UnexpectedUpdate(phase)) => {
                warn!(client = %update.client_id, "update discarded in phase {}", phase);
                Ok(())
            }
            Err(RoundError::Division(err)) => Err(err.into()),
        }
    }

    /// Drops a client after an error.
    fn drop_client(&mut self, id: SessionId, reason: ClientError) -> Result<(), ServiceError> {
        self.disconnect(id, reason, true)
    }

    /// Removes a session from the registry, which closes its transport, and tells the
    /// coordinator.
    fn disconnect(
        &mut self,
        id: SessionId,
        reason: impl Display,
        failure: bool,
    ) -> Result<(), ServiceError> {
        let session = match self.registry.remove(id) {
            Some(session) => session,
            None => return Ok(()),
        };
        if failure {
            warn!(
                client = %session.name(),
                address = %session.address(),
                reason = %reason,
                "dropping client"
            );
        } else {
            info!(
                client = %session.name(),
                address = %session.address(),
                reason = %reason,
                "dropping client"
            );
        }
        drop(session);

        match self.coordinator.on_disconnect(id) {
            Ok(()) => Ok(()),
            Err(RoundError::Division(err)) => Err(err.into()),
            Err(err) => {
                error!("unexpected error after dropping {}: {}", id, err);
                Ok(())
            }
        }
    }

    /// Handles the pending state machine events.
    async fn handle_protocol_events(&mut self) -> Result<(), ServiceError> {
        while let Some(event) = self.coordinator.next_event() {
            match event {
                Event::Send(id, message) => self.send(id, &message).await?,
                Event::Persist { round, model } => self.persist(round, &model).await?,
                Event::Broadcast(message) => {
                    self.broadcast(&message).await?;
                    self.coordinator.end_broadcast();
                }
            }
        }
        self.sanity_checks();
        Ok(())
    }

    /// Handles an [`Event::Send`] event.
    async fn send(
        &mut self,
        id: SessionId,
        message: &GlobalModelMessage,
    ) -> Result<(), ServiceError> {
        let frame = self.codec.encode(message)?;
        let sent = match self.registry.get_mut(id) {
            Some(session) => session.send_frame(&frame).await,
            None => return Ok(()),
        };
        if let Err(err) = sent {
            self.drop_client(id, err.into())?;
        }
        Ok(())
    }

    /// Handles an [`Event::Persist`] event.
    async fn persist(&mut self, round: u64, model: &Model) -> Result<(), ServiceError> {
        let id = self
            .storage
            .set_global_model(&self.run_id, round, model)
            .await
            .map_err(ServiceError::Storage)?;
        info!(run_id = %self.run_id, round, "global model persisted as {}", id);
        Ok(())
    }

    /// Handles an [`Event::Broadcast`] event. Clients that cannot be reached are dropped once the
    /// message has been sent to everyone else.
    async fn broadcast(&mut self, message: &GlobalModelMessage) -> Result<(), ServiceError> {
        let frame = self.codec.encode(message)?;
        let mut failed = Vec::new();
        for (id, session) in self.registry.iter_mut() {
            if let Err(err) = session.send_frame(&frame).await {
                failed.push((id, err));
            }
        }
        info!(
            "global model sent to {} clients (stop: {})",
            self.registry.len() - failed.len(),
            message.stop
        );
        for (id, err) in failed {
            self.drop_client(id, err.into())?;
        }
        Ok(())
    }

    fn sanity_checks(&self) {
        if !self.coordinator.is_terminated() {
            debug_assert_eq!(self.registry.len(), self.coordinator.connected());
        }
    }
}
