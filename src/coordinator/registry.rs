use std::{
    collections::BTreeMap,
    net::SocketAddr,
    task::{Context, Poll},
};

use futures::ready;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::ClientError;
use crate::{
    common::{ClientIdentity, SessionId},
    message::{ClientUpdate, FrameReader, MessageCodec, TransportError},
};

/// Name used in logs for a client that did not announce its identity yet.
const UNASSIGNED: &str = "new";

/// A connected client.
pub struct ClientSession<T> {
    /// The identity announced by the client, unknown until its first message.
    identity: Option<ClientIdentity>,
    address: SocketAddr,
    io: T,
    reader: FrameReader,
}

impl<T> ClientSession<T> {
    fn new(io: T, address: SocketAddr) -> Self {
        Self {
            identity: None,
            address,
            io,
            reader: FrameReader::new(),
        }
    }

    pub fn identity(&self) -> Option<&ClientIdentity> {
        self.identity.as_ref()
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// The identity of the client for diagnostics, `new` if it is not known yet.
    pub fn name(&self) -> String {
        self.identity
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| UNASSIGNED.to_string())
    }
}

impl<T> ClientSession<T>
where
    T: AsyncRead + Unpin,
{
    /// Polls the connection for the next complete update.
    ///
    /// Returns `Ready(None)` if the client closed the connection between two messages.
    pub fn poll_update(
        &mut self,
        cx: &mut Context,
        codec: &MessageCodec,
    ) -> Poll<Option<Result<ClientUpdate, ClientError>>> {
        let Self { reader, io, .. } = self;
        match ready!(reader.poll_frame(cx, io, codec)) {
            Ok(Some(body)) => {
                Poll::Ready(Some(codec.decode_body(&body).map_err(ClientError::from)))
            }
            Ok(None) => Poll::Ready(None),
            Err(err) => Poll::Ready(Some(Err(err.into()))),
        }
    }
}

impl<T> ClientSession<T>
where
    T: AsyncWrite + Unpin,
{
    /// Writes an encoded frame to the client.
    pub async fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.io.write_all(frame).await?;
        self.io.flush().await?;
        Ok(())
    }
}

/// The store of all connected clients.
///
/// The registry owns the transports of the clients. Sessions are iterated in the order in which
/// they were registered.
pub struct ClientRegistry<T> {
    sessions: BTreeMap<SessionId, ClientSession<T>>,
    next_id: u64,
}

impl<T> Default for ClientRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ClientRegistry<T> {
    pub fn new() -> Self {
        Self {
            sessions: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Registers a freshly accepted connection. Its identity is unassigned until
    /// [`ClientRegistry::bind_identity`] is called.
    pub fn register(&mut self, io: T, address: SocketAddr) -> SessionId {
        let id = SessionId(self.next_id);
        self.next_id += 1;
        self.sessions.insert(id, ClientSession::new(io, address));
        id
    }

    /// Sets the identity of the given session and returns the previous one, if any.
    ///
    /// A client may announce a different identity in a later message. The session is renamed,
    /// no second session is created.
    pub fn bind_identity(
        &mut self,
        id: SessionId,
        identity: ClientIdentity,
    ) -> Option<ClientIdentity> {
        self.sessions
            .get_mut(&id)
            .and_then(|session| session.identity.replace(identity))
    }

    /// Removes the given session. Dropping the returned session closes its transport.
    pub fn remove(&mut self, id: SessionId) -> Option<ClientSession<T>> {
        self.sessions.remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<&ClientSession<T>> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut ClientSession<T>> {
        self.sessions.get_mut(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// The ids of all sessions, in registration order.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    /// Iterates over all sessions, in registration order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SessionId, &mut ClientSession<T>)> {
        self.sessions.iter_mut().map(|(id, session)| (*id, session))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
