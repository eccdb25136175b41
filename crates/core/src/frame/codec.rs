//! Wire codec for frames
//!
//! A frame travels as a two-part logical message: a UTF-8 JSON header and
//! the raw row-major image bytes. The split exists so image payloads are
//! never copied into (or escaped inside) JSON. Decoding constructs the
//! frame over the received buffer without copying it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Frame, Image, PixelFormat};
use crate::{Error, Result};

/// Wire format version stamped into every header
pub const WIRE_VERSION: u32 = 1;

/// Maximum accepted header size
pub const MAX_HEADER_BYTES: usize = 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct ImgHeader {
    h: u32,
    w: u32,
    c: u32,
    fmt: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireHeader {
    v: u32,
    topic: String,
    id: u64,
    ts: u64,
    src: String,
    img: Option<ImgHeader>,
    meta: Map<String, Value>,
}

/// A frame serialized for the wire: JSON header plus optional raw bytes
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// UTF-8 JSON header, ≤ [`MAX_HEADER_BYTES`]
    pub header: Bytes,
    /// Row-major image bytes; absent when the header's `img` is null
    pub image: Option<Bytes>,
}

/// Serialize a frame, consuming it.
///
/// Metadata key order is preserved. Fails with
/// `FrameError{kind:"header-too-large"}` when the serialized header
/// exceeds 1 MiB.
pub fn encode(frame: Frame) -> Result<EncodedFrame> {
    let img = frame.image.as_ref().map(|image| {
        let shape = image.shape();
        ImgHeader {
            h: shape.height,
            w: shape.width,
            c: shape.channels,
            fmt: image.format().as_str().to_string(),
        }
    });
    let header = WireHeader {
        v: WIRE_VERSION,
        topic: frame.topic,
        id: frame.id,
        ts: frame.ts,
        src: frame.src,
        img,
        meta: frame.meta,
    };
    let header = serde_json::to_vec(&header)?;
    if header.len() > MAX_HEADER_BYTES {
        return Err(Error::frame(
            "header-too-large",
            format!("{} bytes exceeds {} byte cap", header.len(), MAX_HEADER_BYTES),
        ));
    }
    Ok(EncodedFrame {
        header: Bytes::from(header),
        image: frame.image.map(Image::into_bytes),
    })
}

/// Parse a two-part wire message back into a frame.
///
/// The image buffer is adopted without copying. Fails with
/// `FrameError{kind:"shape-mismatch"}` when `img.h*img.w*img.c` does not
/// equal the byte count, and `FrameError{kind:"header-too-large"}` when
/// the header exceeds the cap.
pub fn decode(header: &[u8], image: Option<Bytes>) -> Result<Frame> {
    if header.len() > MAX_HEADER_BYTES {
        return Err(Error::frame(
            "header-too-large",
            format!("{} bytes exceeds {} byte cap", header.len(), MAX_HEADER_BYTES),
        ));
    }
    let header: WireHeader = serde_json::from_slice(header)?;
    if header.v != WIRE_VERSION {
        return Err(Error::frame(
            "bad-version",
            format!("unsupported wire version {}", header.v),
        ));
    }

    let image = match (header.img, image) {
        (None, _) => None,
        (Some(img), Some(bytes)) => {
            let format = PixelFormat::parse(&img.fmt)?;
            if format.channels() != img.c {
                return Err(Error::frame(
                    "shape-mismatch",
                    format!("format {} declares {} channels", img.fmt, img.c),
                ));
            }
            Some(Image::new(img.h, img.w, format, bytes)?)
        }
        (Some(_), None) => {
            return Err(Error::frame(
                "shape-mismatch",
                "header declares an image but no bytes followed",
            ));
        }
    };

    Ok(Frame {
        topic: header.topic,
        id: header.id,
        ts: header.ts,
        src: header.src,
        image,
        meta: header.meta,
    })
}
