//! Instance-side end of the protocol.
//!
//! Programs under test normally use a small C library for this; the Rust
//! version here lets instances (and tests) be written directly in Rust.

use super::codec::read_fixed;
use super::types::{InstanceId, SessionHeader};
use crate::config::ProtocolConfig;
use crate::error::{ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Encode a send request.
pub fn encode_send(target: InstanceId, time_ms: i32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + ProtocolConfig::SEND_HEADER_SIZE + payload.len());
    buf.put_u8(ProtocolConfig::SEND_OPCODE);
    buf.put_i32_le(target as i32);
    buf.put_i32_le(time_ms);
    buf.put_i32_le(payload.len() as i32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Encode a receive request; `None` receives from any instance.
pub fn encode_receive(source: Option<InstanceId>, time_ms: i32) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + ProtocolConfig::RECEIVE_HEADER_SIZE);
    buf.put_u8(ProtocolConfig::RECEIVE_OPCODE);
    buf.put_i32_le(source.map_or(ProtocolConfig::ANY_SOURCE, |id| id as i32));
    buf.put_i32_le(time_ms);
    buf.freeze()
}

/// Decode the session header.
pub fn decode_header(bytes: &[u8; ProtocolConfig::HEADER_SIZE]) -> Result<SessionHeader> {
    let mut buf = &bytes[..];
    let magic = buf.get_u32_le();
    if magic != ProtocolConfig::MAGIC {
        return Err(ProtocolError::BadMagic {
            expected: ProtocolConfig::MAGIC,
            found: magic,
        }
        .into());
    }
    let node_count = buf.get_i32_le();
    let node_id = buf.get_i32_le();
    if node_count < 1 || node_id < 0 || node_id >= node_count {
        return Err(ProtocolError::InvalidHeader {
            node_count,
            node_id,
        }
        .into());
    }
    Ok(SessionHeader {
        node_count: node_count as usize,
        node_id: node_id as InstanceId,
    })
}

/// Read one receive response, returning the sender and the payload.
pub async fn read_response<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(InstanceId, Bytes)> {
    let mut header = [0u8; ProtocolConfig::RESPONSE_HEADER_SIZE];
    read_fixed(reader, &mut header, "a response header").await?;
    let mut buf = &header[..];
    let magic = buf.get_u32_le();
    if magic != ProtocolConfig::RESPONSE_MAGIC {
        return Err(ProtocolError::BadMagic {
            expected: ProtocolConfig::RESPONSE_MAGIC,
            found: magic,
        }
        .into());
    }
    let source = buf.get_i32_le();
    let length = buf.get_i32_le();
    if length < 0 || length as usize > ProtocolConfig::MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::InvalidSize(length).into());
    }
    let source = usize::try_from(source).map_err(|_| ProtocolError::InvalidSource(source))?;

    let mut payload = vec![0u8; length as usize];
    read_fixed(reader, &mut payload, "a response payload").await?;
    Ok((source, Bytes::from(payload)))
}

/// An instance's connection to the coordinator.
pub struct NodeClient<R, W> {
    reader: R,
    writer: W,
    header: SessionHeader,
}

impl<R, W> NodeClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Read the session header and return a ready client.
    pub async fn connect(mut reader: R, writer: W) -> Result<Self> {
        let mut header = [0u8; ProtocolConfig::HEADER_SIZE];
        read_fixed(&mut reader, &mut header, "the session header").await?;
        let header = decode_header(&header)?;
        Ok(Self {
            reader,
            writer,
            header,
        })
    }

    pub fn node_count(&self) -> usize {
        self.header.node_count
    }

    pub fn node_id(&self) -> InstanceId {
        self.header.node_id
    }

    /// Send `payload` to `target`, reporting the instance clock `time_ms`.
    pub async fn send(&mut self, target: InstanceId, time_ms: i32, payload: &[u8]) -> Result<()> {
        self.writer
            .write_all(&encode_send(target, time_ms, payload))
            .await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Receive the next message from `source`.
    pub async fn receive(&mut self, source: InstanceId, time_ms: i32) -> Result<(InstanceId, Bytes)> {
        self.request_receive(Some(source), time_ms).await
    }

    /// Receive the next message from whichever instance.
    pub async fn receive_any(&mut self, time_ms: i32) -> Result<(InstanceId, Bytes)> {
        self.request_receive(None, time_ms).await
    }

    async fn request_receive(
        &mut self,
        source: Option<InstanceId>,
        time_ms: i32,
    ) -> Result<(InstanceId, Bytes)> {
        self.writer
            .write_all(&encode_receive(source, time_ms))
            .await?;
        self.writer.flush().await?;
        read_response(&mut self.reader).await
    }

    /// Close the request stream, signalling that the instance is done.
    pub async fn finish(mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
