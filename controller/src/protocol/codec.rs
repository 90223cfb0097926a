//! JSON codec and length-prefixed framing.
//!
//! A frame on a byte stream is `len: u32 (little endian) | payload`. The
//! codec refuses payloads over `max_message_size` in both directions
//! instead of truncating them.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{CallFailure, FailureKind};

/// Default upper bound on an encoded message, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Errors raised while encoding, decoding or framing messages.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The value could not be encoded.
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    /// The payload could not be decoded.
    #[error("decode failed: {0}")]
    Decode(#[source] serde_json::Error),
    /// The payload exceeds the configured size limit.
    #[error("message of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge {
        /// Size of the offending message.
        size: usize,
        /// Configured limit.
        limit: usize,
    },
    /// The underlying stream failed.
    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CodecError> for CallFailure {
    fn from(err: CodecError) -> Self {
        let kind = match err {
            CodecError::Io(_) => FailureKind::EngineLost,
            _ => FailureKind::SerializationError,
        };
        CallFailure::new(kind, err.to_string())
    }
}

/// Encodes and decodes wire messages with a size limit.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    max_message_size: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl Codec {
    /// Creates a codec enforcing `max_message_size`.
    #[must_use]
    pub const fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    /// Returns the configured size limit.
    #[must_use]
    pub const fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Encodes `message` as JSON.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails and
    /// `CodecError::TooLarge` if the result exceeds the size limit.
    pub fn encode<T: Serialize>(&self, message: &T) -> Result<Bytes, CodecError> {
        let buf = serde_json::to_vec(message).map_err(CodecError::Encode)?;
        self.check_size(buf.len())?;
        Ok(Bytes::from(buf))
    }

    /// Decodes a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::TooLarge` for oversize input and
    /// `CodecError::Decode` for malformed input.
    pub fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        self.check_size(buf.len())?;
        serde_json::from_slice(buf).map_err(CodecError::Decode)
    }

    fn check_size(&self, size: usize) -> Result<(), CodecError> {
        if size > self.max_message_size {
            return Err(CodecError::TooLarge {
                size,
                limit: self.max_message_size,
            });
        }
        Ok(())
    }

    /// Writes one length-prefixed frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is too large or the write fails.
    pub async fn write_frame<W>(&self, writer: &mut W, payload: &[u8]) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin,
    {
        self.check_size(payload.len())?;
        let len = u32::try_from(payload.len()).map_err(|_| CodecError::TooLarge {
            size: payload.len(),
            limit: self.max_message_size,
        })?;
        let mut buf = Vec::with_capacity(LEN_PREFIX + payload.len());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(payload);
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads one length-prefixed frame. Returns `None` on a clean end of
    /// stream before a new frame starts.
    ///
    /// # Errors
    ///
    /// Returns an error if the announced length exceeds the limit or the
    /// stream ends mid-frame.
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Option<Vec<u8>>, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; LEN_PREFIX];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        self.check_size(len)?;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok(Some(payload))
    }
}
