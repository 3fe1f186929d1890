//! A participant speaking the coordinator's wire protocol.

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, ToSocketAddrs},
};

use crate::{
    common::ClientIdentity,
    message::{
        ClientUpdate,
        DecodeError,
        EncodeError,
        FrameError,
        FrameReader,
        GlobalModelMessage,
        MessageCodec,
    },
    model::Model,
};

#[derive(Debug, Error)]
pub enum ParticipantError {
    #[error("failed to connect: {0}")]
    Connect(#[source] std::io::Error),

    #[error("failed to send update: {0}")]
    Send(#[source] std::io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("the coordinator closed the connection before training was over")]
    Closed,
}

/// A participant connected to the coordinator.
pub struct Participant<T> {
    id: ClientIdentity,
    io: T,
    reader: FrameReader,
    codec: MessageCodec,
}

impl Participant<TcpStream> {
    /// Connects to the coordinator listening on `address`.
    pub async fn connect(
        address: impl ToSocketAddrs,
        id: impl Into<ClientIdentity>,
        codec: MessageCodec,
    ) -> Result<Self, ParticipantError> {
        let io = TcpStream::connect(address)
            .await
            .map_err(ParticipantError::Connect)?;
        Ok(Self::new(io, id, codec))
    }
}

impl<T> Participant<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a participant on an established connection.
    pub fn new(io: T, id: impl Into<ClientIdentity>, codec: MessageCodec) -> Self {
        Self {
            id: id.into(),
            io,
            reader: FrameReader::new(),
            codec,
        }
    }

    pub fn id(&self) -> &ClientIdentity {
        &self.id
    }

    /// Waits for the next global model. Returns `None` if the coordinator closed the connection.
    pub async fn next_model(&mut self) -> Result<Option<GlobalModelMessage>, ParticipantError> {
        match self.reader.read_frame(&mut self.io, &self.codec).await? {
            Some(body) => Ok(Some(self.codec.decode_body(&body)?)),
            None => Ok(None),
        }
    }

    /// Sends the local models of this round, `weights[i]` being trained on `partition_sizes[i]`
    /// samples.
    pub async fn send_update(
        &mut self,
        weights: Vec<Model>,
        partition_sizes: Vec<u64>,
    ) -> Result<(), ParticipantError> {
        let update = ClientUpdate {
            client_id: self.id.clone(),
            weights,
            partition_sizes,
        };
        let frame = self.codec.encode(&update)?;
        self.io
            .write_all(&frame)
            .await
            .map_err(ParticipantError::Send)?;
        self.io.flush().await.map_err(ParticipantError::Send)
    }

    /// Takes part in every round until the coordinator asks to stop, and returns the last global
    /// model.
    ///
    /// `train` is called with the current global model and returns the local models along with
    /// their partition sizes.
    pub async fn train<F>(mut self, mut train: F) -> Result<Model, ParticipantError>
    where
        F: FnMut(&Model) -> (Vec<Model>, Vec<u64>),
    {
        loop {
            let message = self.next_model().await?.ok_or(ParticipantError::Closed)?;
            if message.stop {
                info!("{}: training over", self.id);
                return Ok(message.weights);
            }
            let (weights, partition_sizes) = train(&message.weights);
            debug!("{}: sending {} local models", self.id, weights.len());
            self.send_update(weights, partition_sizes).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn test_train_until_stop() {
        let codec = MessageCodec::default();
        let (client_io, mut server_io) = duplex(1024);
        let participant = Participant::new(client_io, "alice", codec);

        let server = async move {
            let mut reader = FrameReader::new();
            for (round, stop) in [(1., false), (2., false), (3., true)].iter() {
                let message = GlobalModelMessage {
                    stop: *stop,
                    weights: Model::from(vec![*round]),
                };
                server_io
                    .write_all(&codec.encode(&message).unwrap())
                    .await
                    .unwrap();
                if *stop {
                    break;
                }
                let body = reader
                    .read_frame(&mut server_io, &codec)
                    .await
                    .unwrap()
                    .unwrap();
                let update: ClientUpdate = codec.decode_body(&body).unwrap();
                assert_eq!(update.client_id, ClientIdentity::from("alice"));
                assert_eq!(update.partition_sizes, vec![5]);
                assert_eq!(update.weights, vec![Model::from(vec![round + 0.5])]);
            }
        };
        let client =
            participant.train(|global| (vec![global.iter().map(|w| w + 0.5).collect()], vec![5]));

        let (_, last) = tokio::join!(server, client);
        assert_eq!(last.unwrap(), Model::from(vec![3.]));
    }

    #[tokio::test]
    async fn test_coordinator_closes_connection() {
        let (client_io, server_io) = duplex(64);
        let mut participant = Participant::new(client_io, "bob", MessageCodec::default());
        drop(server_io);
        assert!(participant.next_model().await.unwrap().is_none());
    }
}
