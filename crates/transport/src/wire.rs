//! Wire framing
//!
//! Every message starts with a one-byte tag and a big-endian u32 length,
//! followed by a JSON body. Frames carry a second length-prefixed part
//! with the raw image bytes so pixels never pass through JSON:
//!
//! ```text
//! control: [0x01][len u32][control JSON]
//! frame:   [0x02][len u32][header JSON][len u32][image bytes]
//! ```
//!
//! The image length is written even when zero, so the reader never has to
//! peek into the header to know whether a second part follows.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use openfilter_core::frame::codec::{EncodedFrame, MAX_HEADER_BYTES};
use openfilter_core::{Error, Result};

const TAG_CONTROL: u8 = 0x01;
const TAG_FRAME: u8 = 0x02;

/// Control messages are tiny; anything bigger is a framing bug
const MAX_CONTROL_BYTES: usize = 64 * 1024;

/// Hard cap on a single image payload (64 MiB covers 4K BGR with room)
const MAX_IMAGE_BYTES: usize = 64 * 1024 * 1024;

/// Handshake, heartbeat and stream-control messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Producer greeting sent to every new connection
    Hello {
        /// Producing filter id
        producer_id: String,
        /// Run the producer belongs to
        run_id: String,
        /// Topics published so far
        topics_available: Vec<String>,
    },
    /// Consumer reply declaring its subscription
    Subscribe {
        /// Subscribed topics; `*` means all
        topics: Vec<String>,
        /// Whether this consumer is exempt from backpressure
        ephemeral: bool,
    },
    /// Producer heartbeat
    Ping {
        /// Sender wall time, milliseconds
        ts: u64,
    },
    /// Consumer heartbeat reply
    Pong {
        /// Echoed wall time, milliseconds
        ts: u64,
    },
    /// The topic will not receive further frames
    Eos {
        /// Ended topic
        topic: String,
    },
}

/// One decoded wire message
#[derive(Debug)]
pub enum WireMessage {
    /// Control plane
    Control(ControlMessage),
    /// Data plane
    Frame(EncodedFrame),
}

/// Write a control message as one buffered write
pub async fn write_control<W>(writer: &mut W, msg: &ControlMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(msg)?;
    let mut buf = BytesMut::with_capacity(5 + body.len());
    buf.put_u8(TAG_CONTROL);
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Write an encoded frame as one buffered write.
///
/// Header and image lengths are both prefixed; a missing image writes a
/// zero length.
pub async fn write_frame<W>(writer: &mut W, frame: &EncodedFrame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let image_len = frame.image.as_ref().map_or(0, Bytes::len);
    let mut buf = BytesMut::with_capacity(9 + frame.header.len() + image_len);
    buf.put_u8(TAG_FRAME);
    buf.put_u32(frame.header.len() as u32);
    buf.put_slice(&frame.header);
    buf.put_u32(image_len as u32);
    if let Some(image) = &frame.image {
        buf.put_slice(image);
    }
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next message.
///
/// I/O errors surface as [`Error::Io`] (the peer is gone); malformed
/// framing surfaces as `TransportError{kind:"wire-decode"}` and oversized
/// parts as `TransportError{kind:"header-too-large"}`.
pub async fn read_message<R>(reader: &mut R) -> Result<WireMessage>
where
    R: AsyncRead + Unpin,
{
    let tag = reader.read_u8().await?;
    let len = reader.read_u32().await? as usize;
    match tag {
        TAG_CONTROL => {
            if len > MAX_CONTROL_BYTES {
                return Err(Error::transport(
                    "header-too-large",
                    format!("{len} byte control message"),
                ));
            }
            let body = read_bytes(reader, len).await?;
            let msg = serde_json::from_slice(&body)
                .map_err(|e| Error::transport("wire-decode", e.to_string()))?;
            Ok(WireMessage::Control(msg))
        }
        TAG_FRAME => {
            if len > MAX_HEADER_BYTES {
                return Err(Error::transport(
                    "header-too-large",
                    format!("{len} byte frame header"),
                ));
            }
            let header = read_bytes(reader, len).await?;
            let image_len = reader.read_u32().await? as usize;
            if image_len > MAX_IMAGE_BYTES {
                return Err(Error::transport(
                    "header-too-large",
                    format!("{image_len} byte image payload"),
                ));
            }
            let image = if image_len > 0 {
                Some(read_bytes(reader, image_len).await?)
            } else {
                None
            };
            Ok(WireMessage::Frame(EncodedFrame { header, image }))
        }
        other => Err(Error::transport(
            "wire-decode",
            format!("unknown message tag {other:#04x}"),
        )),
    }
}

async fn read_bytes<R>(reader: &mut R, len: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::zeroed(len);
    reader.read_exact(&mut buf).await?;
    Ok(buf.freeze())
}

/// Milliseconds since epoch, for heartbeat timestamps
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use openfilter_core::frame::codec;
    use openfilter_core::frame::{Frame, Image, PixelFormat};

    async fn round_trip(msg: &ControlMessage) -> ControlMessage {
        let mut buf = Vec::new();
        write_control(&mut buf, msg).await.unwrap();
        match read_message(&mut buf.as_slice()).await.unwrap() {
            WireMessage::Control(m) => m,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_control_round_trip() {
        let hello = ControlMessage::Hello {
            producer_id: "Src[1]".into(),
            run_id: "run-1".into(),
            topics_available: vec!["main".into()],
        };
        assert_eq!(round_trip(&hello).await, hello);
        let sub = ControlMessage::Subscribe {
            topics: vec!["*".into()],
            ephemeral: true,
        };
        assert_eq!(round_trip(&sub).await, sub);
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let image = Image::new(2, 2, PixelFormat::Gray, vec![1, 2, 3, 4]).unwrap();
        let mut frame = Frame::new("main").with_image(image);
        frame.id = 7;
        let encoded = codec::encode(frame.clone()).unwrap();

        let mut buf = Vec::new();
        write_frame(&mut buf, &encoded).await.unwrap();
        let decoded = match read_message(&mut buf.as_slice()).await.unwrap() {
            WireMessage::Frame(f) => codec::decode(&f.header, f.image).unwrap(),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn test_frame_without_image() {
        let encoded = codec::encode(Frame::new("main")).unwrap();
        let mut buf = Vec::new();
        write_frame(&mut buf, &encoded).await.unwrap();
        match read_message(&mut buf.as_slice()).await.unwrap() {
            WireMessage::Frame(f) => assert!(f.image.is_none()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_tag_is_decode_error() {
        let buf = [0x7Fu8, 0, 0, 0, 0];
        let err = read_message(&mut buf.as_slice()).await.unwrap_err();
        assert_eq!(err.kind(), Some("wire-decode"));
    }

    #[tokio::test]
    async fn test_oversized_header_rejected() {
        let mut buf = Vec::new();
        buf.push(TAG_FRAME);
        buf.extend_from_slice(&(MAX_HEADER_BYTES as u32 + 1).to_be_bytes());
        let err = read_message(&mut buf.as_slice()).await.unwrap_err();
        assert_eq!(err.kind(), Some("header-too-large"));
    }

    #[tokio::test]
    async fn test_truncated_stream_is_io_error() {
        let buf = [TAG_CONTROL, 0, 0, 0, 10, b'{'];
        let err = read_message(&mut buf.as_slice()).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
