//! Coordinator-side framing.
//!
//! Decoding validates everything an instance controls: opcodes, ids against
//! the size of the run, and payload lengths. A stream that ends exactly at an
//! opcode boundary is a normal end of the instance's requests; ending anywhere
//! else is [`ProtocolError::Truncated`].

use super::types::{InstanceId, Message, Request};
use crate::config::ProtocolConfig;
use crate::error::{ParleyError, ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Encode the session header sent to instance `node_id` of `node_count`.
pub fn encode_header(node_count: usize, node_id: InstanceId) -> [u8; ProtocolConfig::HEADER_SIZE] {
    let mut out = [0u8; ProtocolConfig::HEADER_SIZE];
    let mut buf = &mut out[..];
    buf.put_u32_le(ProtocolConfig::MAGIC);
    buf.put_i32_le(node_count as i32);
    buf.put_i32_le(node_id as i32);
    out
}

/// Write the session header.
pub async fn write_header<W: AsyncWrite + Unpin>(
    writer: &mut W,
    node_count: usize,
    node_id: InstanceId,
) -> Result<()> {
    writer
        .write_all(&encode_header(node_count, node_id))
        .await?;
    writer.flush().await?;
    Ok(())
}

/// Encode a receive response carrying `message`.
pub fn encode_response(message: &Message) -> Bytes {
    let mut buf =
        BytesMut::with_capacity(ProtocolConfig::RESPONSE_HEADER_SIZE + message.payload.len());
    buf.put_u32_le(ProtocolConfig::RESPONSE_MAGIC);
    buf.put_i32_le(message.source as i32);
    buf.put_i32_le(message.payload.len() as i32);
    buf.put_slice(&message.payload);
    buf.freeze()
}

/// Write a receive response carrying `message`.
pub async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    writer.write_all(&encode_response(message)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one request from an instance of a run with `node_count` instances.
///
/// Returns `None` on clean EOF (the instance closed its end between requests).
pub async fn read_request<R: AsyncRead + Unpin>(
    reader: &mut R,
    node_count: usize,
) -> Result<Option<Request>> {
    let mut opcode = [0u8; 1];
    if reader.read(&mut opcode).await? == 0 {
        return Ok(None);
    }

    match opcode[0] {
        ProtocolConfig::SEND_OPCODE => {
            let mut header = [0u8; ProtocolConfig::SEND_HEADER_SIZE];
            read_fixed(reader, &mut header, "a send header").await?;
            let mut buf = &header[..];
            let target = buf.get_i32_le();
            let time_ms = buf.get_i32_le();
            let length = buf.get_i32_le();

            if length < 0 || length as usize > ProtocolConfig::MAX_PAYLOAD_SIZE {
                return Err(ProtocolError::InvalidSize(length).into());
            }
            let target = instance_id(target, node_count)
                .ok_or(ProtocolError::InvalidTarget(target))?;

            let mut payload = vec![0u8; length as usize];
            read_fixed(reader, &mut payload, "a message payload").await?;

            Ok(Some(Request::Send {
                target,
                payload: Bytes::from(payload),
                time: millis(time_ms),
            }))
        }
        ProtocolConfig::RECEIVE_OPCODE => {
            let mut header = [0u8; ProtocolConfig::RECEIVE_HEADER_SIZE];
            read_fixed(reader, &mut header, "a receive header").await?;
            let mut buf = &header[..];
            let source = buf.get_i32_le();
            let time = millis(buf.get_i32_le());

            if source == ProtocolConfig::ANY_SOURCE {
                return Ok(Some(Request::ReceiveAny { time }));
            }
            let source = instance_id(source, node_count)
                .ok_or(ProtocolError::InvalidSource(source))?;
            Ok(Some(Request::Receive { source, time }))
        }
        other => Err(ProtocolError::InvalidOpcode(other).into()),
    }
}

/// Fill `buf` completely, mapping a premature EOF to a truncation error.
pub(crate) async fn read_fixed<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    what: &'static str,
) -> Result<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(ProtocolError::Truncated(what).into())
        }
        Err(e) => Err(ParleyError::from(e)),
    }
}

fn instance_id(raw: i32, node_count: usize) -> Option<InstanceId> {
    usize::try_from(raw).ok().filter(|&id| id < node_count)
}

/// Instance clocks are reported in milliseconds; negative values count as zero.
fn millis(time_ms: i32) -> Duration {
    Duration::from_millis(time_ms.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::client::{encode_receive, encode_send};
    use std::io::Cursor;

    async fn decode(bytes: &[u8], node_count: usize) -> Result<Option<Request>> {
        let mut cursor = Cursor::new(bytes.to_vec());
        read_request(&mut cursor, node_count).await
    }

    #[test]
    fn test_header_layout() {
        let header = encode_header(20, 5);
        assert_eq!(&header[0..4], &ProtocolConfig::MAGIC.to_le_bytes());
        assert_eq!(&header[4..8], &20i32.to_le_bytes());
        assert_eq!(&header[8..12], &5i32.to_le_bytes());
    }

    #[test]
    fn test_response_layout() {
        let message = Message {
            source: 3,
            target: 5,
            send_time: Duration::from_millis(10),
            payload: Bytes::from_static(b"foobaz"),
        };
        let encoded = encode_response(&message);
        assert_eq!(encoded.len(), 12 + 6);
        assert_eq!(&encoded[0..4], &ProtocolConfig::RESPONSE_MAGIC.to_le_bytes());
        assert_eq!(&encoded[4..8], &3i32.to_le_bytes());
        assert_eq!(&encoded[8..12], &6i32.to_le_bytes());
        assert_eq!(&encoded[12..], b"foobaz");
    }

    #[tokio::test]
    async fn test_read_send_request() {
        let bytes = encode_send(2, 17, b"foobar");
        let request = decode(&bytes, 20).await.unwrap().unwrap();
        assert_eq!(
            request,
            Request::Send {
                target: 2,
                payload: Bytes::from_static(b"foobar"),
                time: Duration::from_millis(17),
            }
        );
    }

    #[tokio::test]
    async fn test_read_receive_requests() {
        let request = decode(&encode_receive(Some(3), 4), 20).await.unwrap().unwrap();
        assert_eq!(
            request,
            Request::Receive {
                source: 3,
                time: Duration::from_millis(4)
            }
        );

        let request = decode(&encode_receive(None, 0), 20).await.unwrap().unwrap();
        assert_eq!(
            request,
            Request::ReceiveAny {
                time: Duration::ZERO
            }
        );
    }

    #[tokio::test]
    async fn test_empty_stream_is_clean_end() {
        assert!(decode(&[], 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_consecutive_requests() {
        let mut bytes = encode_send(1, 0, b"a").to_vec();
        bytes.extend_from_slice(&encode_receive(None, 1));
        let mut cursor = Cursor::new(bytes);

        assert!(matches!(
            read_request(&mut cursor, 2).await.unwrap(),
            Some(Request::Send { .. })
        ));
        assert!(matches!(
            read_request(&mut cursor, 2).await.unwrap(),
            Some(Request::ReceiveAny { .. })
        ));
        assert!(read_request(&mut cursor, 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_opcode() {
        let err = decode(&[0x07], 2).await.unwrap_err();
        assert!(matches!(
            err,
            ParleyError::Protocol(ProtocolError::InvalidOpcode(0x07))
        ));
    }

    #[tokio::test]
    async fn test_invalid_size() {
        let mut bytes = vec![ProtocolConfig::SEND_OPCODE];
        bytes.extend_from_slice(&0i32.to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes());
        bytes.extend_from_slice(&(-1i32).to_le_bytes());
        let err = decode(&bytes, 2).await.unwrap_err();
        assert!(matches!(
            err,
            ParleyError::Protocol(ProtocolError::InvalidSize(-1))
        ));

        let too_big = (ProtocolConfig::MAX_PAYLOAD_SIZE + 1) as i32;
        let mut bytes = vec![ProtocolConfig::SEND_OPCODE];
        bytes.extend_from_slice(&0i32.to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes());
        bytes.extend_from_slice(&too_big.to_le_bytes());
        let err = decode(&bytes, 2).await.unwrap_err();
        assert!(matches!(
            err,
            ParleyError::Protocol(ProtocolError::InvalidSize(n)) if n == too_big
        ));
    }

    #[tokio::test]
    async fn test_invalid_ids() {
        let err = decode(&encode_send(2, 0, b""), 2).await.unwrap_err();
        assert!(matches!(
            err,
            ParleyError::Protocol(ProtocolError::InvalidTarget(2))
        ));

        let mut bytes = vec![ProtocolConfig::RECEIVE_OPCODE];
        bytes.extend_from_slice(&(-2i32).to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes());
        let err = decode(&bytes, 2).await.unwrap_err();
        assert!(matches!(
            err,
            ParleyError::Protocol(ProtocolError::InvalidSource(-2))
        ));

        let err = decode(&encode_receive(Some(5), 0), 5).await.unwrap_err();
        assert!(matches!(
            err,
            ParleyError::Protocol(ProtocolError::InvalidSource(5))
        ));
    }

    #[tokio::test]
    async fn test_truncated_frames() {
        let bytes = encode_send(1, 0, b"foobar");
        let err = decode(&bytes[..5], 2).await.unwrap_err();
        assert!(matches!(
            err,
            ParleyError::Protocol(ProtocolError::Truncated("a send header"))
        ));

        let err = decode(&bytes[..bytes.len() - 1], 2).await.unwrap_err();
        assert!(matches!(
            err,
            ParleyError::Protocol(ProtocolError::Truncated("a message payload"))
        ));

        let bytes = encode_receive(Some(1), 0);
        let err = decode(&bytes[..3], 2).await.unwrap_err();
        assert!(matches!(
            err,
            ParleyError::Protocol(ProtocolError::Truncated("a receive header"))
        ));
    }

    #[tokio::test]
    async fn test_negative_clock_counts_as_zero() {
        let request = decode(&encode_receive(None, -40), 1).await.unwrap().unwrap();
        assert_eq!(request.time(), Duration::ZERO);
    }
}
