//! Frame encoding and decoding.
//!
//! See the [message module] documentation since this is a private module anyways.
//!
//! [message module]: ../index.html

use std::{
    cmp,
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bincode::Options;
use bytes::{BufMut, Bytes, BytesMut};
use futures::{future::poll_fn, ready};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, ReadBuf};

use super::{DecodeError, EncodeError, FramingError};

/// The header width used when none is configured.
pub const DEFAULT_HEADER_WIDTH: usize = 10;

/// The largest body accepted when no limit is configured (100 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

// How much is read from a transport at once.
const READ_CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Encodes payloads into frames and decodes frames into payloads.
///
/// The codec is stateless, the same instance is shared by all connections. Incremental reading
/// of frames is done by [`FrameReader`].
pub struct MessageCodec {
    header_width: usize,
    max_message_size: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_HEADER_WIDTH, DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl MessageCodec {
    /// Creates a codec for headers of `header_width` bytes and bodies of at most
    /// `max_message_size` bytes.
    pub fn new(header_width: usize, max_message_size: usize) -> Self {
        Self {
            header_width,
            max_message_size,
        }
    }

    pub fn header_width(&self) -> usize {
        self.header_width
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn bincode_options(&self) -> impl Options {
        bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .with_limit(self.max_message_size as u64)
            .reject_trailing_bytes()
    }

    /// Serializes `payload` and prefixes it with its length header.
    ///
    /// # Errors
    /// Fails if the payload cannot be serialized, if it is larger than the maximum message size
    /// or if its length does not fit into the header.
    pub fn encode<T: Serialize>(&self, payload: &T) -> Result<Bytes, EncodeError> {
        let body = self.bincode_options().serialize(payload)?;
        let header = self.encode_header(body.len())?;

        let mut frame = BytesMut::with_capacity(header.len() + body.len());
        frame.put_slice(header.as_bytes());
        frame.put_slice(&body);
        Ok(frame.freeze())
    }

    fn encode_header(&self, length: usize) -> Result<String, FramingError> {
        if length > self.max_message_size {
            return Err(FramingError::TooLarge {
                length,
                max: self.max_message_size,
            });
        }
        let header = format!("{:<width$}", length, width = self.header_width);
        if header.len() > self.header_width {
            return Err(FramingError::HeaderOverflow {
                length,
                width: self.header_width,
            });
        }
        Ok(header)
    }

    /// Parses a frame header into the length of the body that follows it.
    ///
    /// # Errors
    /// Fails if `header` does not have the configured width, if it is not an unsigned decimal
    /// number (surrounding spaces aside) or if the announced length exceeds the maximum message
    /// size.
    pub fn decode_header(&self, header: &[u8]) -> Result<usize, FramingError> {
        if header.len() != self.header_width {
            return Err(FramingError::InvalidHeaderLength {
                expected: self.header_width,
                actual: header.len(),
            });
        }
        let not_numeric = || FramingError::NotNumeric(String::from_utf8_lossy(header).into_owned());

        let digits = std::str::from_utf8(header)
            .map_err(|_| not_numeric())?
            .trim_matches(|c: char| c.is_ascii_whitespace());
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(not_numeric());
        }
        let length = digits.parse::<usize>().map_err(|_| not_numeric())?;

        if length > self.max_message_size {
            return Err(FramingError::TooLarge {
                length,
                max: self.max_message_size,
            });
        }
        Ok(length)
    }

    /// Deserializes a frame body.
    ///
    /// # Errors
    /// Fails if `body` is not exactly one serialized `T`.
    pub fn decode_body<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, DecodeError> {
        Ok(self.bincode_options().deserialize(body)?)
    }
}

#[derive(Debug, Error)]
/// The transport failed while a frame was being read or written.
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed in the middle of a frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },
}

#[derive(Debug, Error)]
/// An error that occurred while reading a frame.
pub enum FrameError {
    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    /// Waiting for a complete header.
    Header,
    /// The header announced a body of this many bytes.
    Body(usize),
}

#[derive(Debug)]
/// Reassembles frames from the bytes of one connection.
///
/// Bytes are buffered until a complete frame is available, so reading never blocks on a
/// participant that sends a frame in several pieces.
pub struct FrameReader {
    buffer: BytesMut,
    state: ReadState,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            state: ReadState::Header,
        }
    }

    /// Appends received bytes to the buffer.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Whether the reader is between two frames, with nothing buffered.
    pub fn is_idle(&self) -> bool {
        self.state == ReadState::Header && self.buffer.is_empty()
    }

    /// Takes the next complete frame body out of the buffer, if there is one.
    ///
    /// # Errors
    /// Fails if a buffered header is invalid. The reader must not be used after that.
    pub fn next_frame(&mut self, codec: &MessageCodec) -> Result<Option<Bytes>, FramingError> {
        loop {
            match self.state {
                ReadState::Header => {
                    if self.buffer.len() < codec.header_width() {
                        return Ok(None);
                    }
                    let header = self.buffer.split_to(codec.header_width());
                    let length = codec.decode_header(&header)?;
                    // the body grows with the bytes actually received
                    self.buffer.reserve(cmp::min(length, READ_CHUNK_SIZE));
                    self.state = ReadState::Body(length);
                }
                ReadState::Body(length) => {
                    if self.buffer.len() < length {
                        return Ok(None);
                    }
                    let body = self.buffer.split_to(length).freeze();
                    self.state = ReadState::Header;
                    return Ok(Some(body));
                }
            }
        }
    }

    /// Reads from `io` until a complete frame body is available.
    ///
    /// Returns `Ready(Ok(None))` if the peer closed the connection between two frames.
    pub fn poll_frame<R>(
        &mut self,
        cx: &mut Context,
        io: &mut R,
        codec: &MessageCodec,
    ) -> Poll<Result<Option<Bytes>, FrameError>>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(body) = self.next_frame(codec)? {
                return Poll::Ready(Ok(Some(body)));
            }

            let mut chunk = [0_u8; READ_CHUNK_SIZE];
            let mut read_buf = ReadBuf::new(&mut chunk);
            if let Err(err) = ready!(Pin::new(&mut *io).poll_read(cx, &mut read_buf)) {
                return Poll::Ready(Err(TransportError::Io(err).into()));
            }

            let received = read_buf.filled();
            if received.is_empty() {
                return Poll::Ready(if self.is_idle() {
                    Ok(None)
                } else {
                    Err(TransportError::Truncated {
                        buffered: self.buffer.len(),
                    }
                    .into())
                });
            }
            self.buffer.extend_from_slice(received);
        }
    }

    /// Reads the next frame body from `io`, see [`FrameReader::poll_frame`].
    pub async fn read_frame<R>(
        &mut self,
        io: &mut R,
        codec: &MessageCodec,
    ) -> Result<Option<Bytes>, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        poll_fn(|cx| self.poll_frame(cx, io, codec)).await
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::{
        message::{ClientUpdate, GlobalModelMessage},
        model::Model,
    };

    fn update() -> ClientUpdate {
        ClientUpdate {
            client_id: "client-1".into(),
            weights: vec![Model::from(vec![1., 2.]), Model::from(vec![3., 4.])],
            partition_sizes: vec![10, 30],
        }
    }

    #[test]
    fn test_header_is_left_justified() {
        let codec = MessageCodec::default();
        let message = GlobalModelMessage {
            stop: false,
            weights: Model::from(vec![2.5]),
        };
        let frame = codec.encode(&message).unwrap();
        let body_len = frame.len() - DEFAULT_HEADER_WIDTH;

        let expected = format!("{:<10}", body_len);
        assert_eq!(&frame[..DEFAULT_HEADER_WIDTH], expected.as_bytes());
        assert_eq!(codec.decode_header(&frame[..DEFAULT_HEADER_WIDTH]), Ok(body_len));
    }

    #[test]
    fn test_round_trip() {
        let codec = MessageCodec::new(8, 1024);
        let frame = codec.encode(&update()).unwrap();
        let length = codec.decode_header(&frame[..8]).unwrap();
        assert_eq!(length, frame.len() - 8);

        let decoded: ClientUpdate = codec.decode_body(&frame[8..]).unwrap();
        assert_eq!(decoded, update());
    }

    #[test]
    fn test_decode_header_accepts_padding() {
        let codec = MessageCodec::new(6, 1000);
        assert_eq!(codec.decode_header(b"42    "), Ok(42));
        assert_eq!(codec.decode_header(b"  42  "), Ok(42));
        assert_eq!(codec.decode_header(b"0     "), Ok(0));
    }

    #[test]
    fn test_decode_header_rejects_garbage() {
        let codec = MessageCodec::new(6, 1000);
        assert_eq!(
            codec.decode_header(b"abc   "),
            Err(FramingError::NotNumeric("abc   ".to_string()))
        );
        assert!(matches!(
            codec.decode_header(b"      "),
            Err(FramingError::NotNumeric(_))
        ));
        assert!(matches!(
            codec.decode_header(b"-12   "),
            Err(FramingError::NotNumeric(_))
        ));
        assert!(matches!(
            codec.decode_header(b"1 2   "),
            Err(FramingError::NotNumeric(_))
        ));
        assert_eq!(
            codec.decode_header(b"42"),
            Err(FramingError::InvalidHeaderLength {
                expected: 6,
                actual: 2
            })
        );
    }

    #[test]
    fn test_decode_header_rejects_oversized_bodies() {
        let codec = MessageCodec::new(6, 1000);
        assert_eq!(
            codec.decode_header(b"1001  "),
            Err(FramingError::TooLarge {
                length: 1001,
                max: 1000
            })
        );
    }

    #[test]
    fn test_encode_rejects_header_overflow() {
        // a single digit header cannot announce the length of this body
        let codec = MessageCodec::new(1, 1000);
        assert!(matches!(
            codec.encode(&update()),
            Err(EncodeError::Framing(FramingError::HeaderOverflow { width: 1, .. }))
        ));
    }

    #[test]
    fn test_decode_body_rejects_garbage() {
        let codec = MessageCodec::default();
        assert!(codec.decode_body::<ClientUpdate>(&[0xff; 3]).is_err());

        // trailing bytes after a valid payload
        let frame = codec.encode(&update()).unwrap();
        let mut body = frame[DEFAULT_HEADER_WIDTH..].to_vec();
        body.push(0);
        assert!(codec.decode_body::<ClientUpdate>(&body).is_err());
    }

    #[test]
    fn test_frame_reader_reassembles_pieces() {
        let codec = MessageCodec::default();
        let frame = codec.encode(&update()).unwrap();
        let mut reader = FrameReader::new();

        // header split in two, then the body byte by byte
        reader.extend_from_slice(&frame[..4]);
        assert_eq!(reader.next_frame(&codec), Ok(None));
        reader.extend_from_slice(&frame[4..DEFAULT_HEADER_WIDTH]);
        assert_eq!(reader.next_frame(&codec), Ok(None));
        for byte in &frame[DEFAULT_HEADER_WIDTH..frame.len() - 1] {
            reader.extend_from_slice(&[*byte]);
            assert_eq!(reader.next_frame(&codec), Ok(None));
        }
        assert!(!reader.is_idle());
        reader.extend_from_slice(&frame[frame.len() - 1..]);

        let body = reader.next_frame(&codec).unwrap().unwrap();
        assert_eq!(codec.decode_body::<ClientUpdate>(&body).unwrap(), update());
        assert!(reader.is_idle());
    }

    #[test]
    fn test_frame_reader_splits_consecutive_frames() {
        let codec = MessageCodec::default();
        let first = codec.encode(&update()).unwrap();
        let second = codec
            .encode(&GlobalModelMessage {
                stop: true,
                weights: Model::zeros(1),
            })
            .unwrap();
        let mut reader = FrameReader::new();
        reader.extend_from_slice(&[first.as_ref(), second.as_ref()].concat());

        let body = reader.next_frame(&codec).unwrap().unwrap();
        assert_eq!(body.as_ref(), &first[DEFAULT_HEADER_WIDTH..]);
        let body = reader.next_frame(&codec).unwrap().unwrap();
        assert_eq!(body.as_ref(), &second[DEFAULT_HEADER_WIDTH..]);
        assert_eq!(reader.next_frame(&codec), Ok(None));
    }

    #[test]
    fn test_frame_reader_does_not_preallocate_announced_body() {
        let codec = MessageCodec::default();
        let mut reader = FrameReader::new();
        reader.extend_from_slice(format!("{:<10}", DEFAULT_MAX_MESSAGE_SIZE).as_bytes());

        assert_eq!(reader.next_frame(&codec), Ok(None));
        assert_eq!(reader.state, ReadState::Body(DEFAULT_MAX_MESSAGE_SIZE));
        assert!(reader.buffer.capacity() < 1024 * 1024);

        reader.extend_from_slice(&[0; 100]);
        assert_eq!(reader.next_frame(&codec), Ok(None));
        assert_eq!(reader.buffer.len(), 100);
    }

    #[test]
    fn test_frame_reader_rejects_invalid_header() {
        let codec = MessageCodec::default();
        let mut reader = FrameReader::new();
        reader.extend_from_slice(b"not a len!rest");
        assert!(matches!(
            reader.next_frame(&codec),
            Err(FramingError::NotNumeric(_))
        ));
    }

    #[tokio::test]
    async fn test_read_frame_from_transport() {
        let codec = MessageCodec::default();
        let frame = codec.encode(&update()).unwrap();
        let (mut tx, mut rx) = tokio::io::duplex(64);

        let writer = tokio::spawn(async move {
            tx.write_all(&frame).await.unwrap();
            // closing between two frames is an orderly shutdown
        });

        let mut reader = FrameReader::new();
        let body = reader.read_frame(&mut rx, &codec).await.unwrap().unwrap();
        assert_eq!(codec.decode_body::<ClientUpdate>(&body).unwrap(), update());
        writer.await.unwrap();
        assert!(reader.read_frame(&mut rx, &codec).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_frame_truncated() {
        let codec = MessageCodec::default();
        let frame = codec.encode(&update()).unwrap();
        let (mut tx, mut rx) = tokio::io::duplex(1024);
        tx.write_all(&frame[..frame.len() - 3]).await.unwrap();
        drop(tx);

        let mut reader = FrameReader::new();
        assert!(matches!(
            reader.read_frame(&mut rx, &codec).await,
            Err(FrameError::Transport(TransportError::Truncated { .. }))
        ));
    }
}
