//! Frame data model
//!
//! A [`Frame`] is the atom of dataflow: an optional image payload plus a
//! JSON-shaped metadata object. Image bytes live in [`bytes::Bytes`] so
//! cloning a frame never copies pixels; mutation goes through
//! [`Image::make_mut`], which materializes an owned buffer on first write.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

pub mod codec;

/// Reserved metadata key holding runtime-inserted fields
/// (`id`, `ts`, `src`, `topic`, `fps`, `lat_in`, `lat_out`, ...).
pub const META_KEY: &str = "meta";

/// Pixel channel ordering of an image payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// Blue, green, red interleaved (the pipeline default)
    Bgr,
    /// Red, green, blue interleaved
    Rgb,
    /// Single-channel luminance
    Gray,
}

impl PixelFormat {
    /// Number of interleaved channels
    pub fn channels(&self) -> u32 {
        match self {
            PixelFormat::Bgr | PixelFormat::Rgb => 3,
            PixelFormat::Gray => 1,
        }
    }

    /// Wire tag for the `img.fmt` header field
    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::Bgr => "BGR",
            PixelFormat::Rgb => "RGB",
            PixelFormat::Gray => "GRAY",
        }
    }

    /// Parse a wire tag, case-insensitive
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BGR" => Ok(PixelFormat::Bgr),
            "RGB" => Ok(PixelFormat::Rgb),
            "GRAY" => Ok(PixelFormat::Gray),
            other => Err(Error::frame(
                "bad-format",
                format!("unknown pixel format {other:?}"),
            )),
        }
    }
}

/// Image dimensions; element type is always 8-bit unsigned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageShape {
    /// Rows
    pub height: u32,
    /// Columns
    pub width: u32,
    /// Interleaved channels, 1 or 3
    pub channels: u32,
}

impl ImageShape {
    /// Required buffer length in bytes
    pub fn byte_len(&self) -> usize {
        self.height as usize * self.width as usize * self.channels as usize
    }
}

/// Pixel storage: shared until first mutation
#[derive(Debug, Clone)]
enum PixelBuf {
    Shared(Bytes),
    Owned(Vec<u8>),
}

/// A 2D pixel grid with a contiguous row-major byte buffer.
///
/// Constructed images are validated: the buffer length must equal
/// `height * width * channels`.
#[derive(Debug, Clone)]
pub struct Image {
    shape: ImageShape,
    format: PixelFormat,
    buf: PixelBuf,
}

impl Image {
    /// Build an image over a (possibly shared) byte buffer.
    ///
    /// Fails with `FrameError{kind:"shape-mismatch"}` when the buffer
    /// length does not match the shape.
    pub fn new(
        height: u32,
        width: u32,
        format: PixelFormat,
        data: impl Into<Bytes>,
    ) -> Result<Self> {
        let shape = ImageShape {
            height,
            width,
            channels: format.channels(),
        };
        let data = data.into();
        if data.len() != shape.byte_len() {
            return Err(Error::frame(
                "shape-mismatch",
                format!(
                    "{}x{}x{} requires {} bytes, got {}",
                    shape.height,
                    shape.width,
                    shape.channels,
                    shape.byte_len(),
                    data.len()
                ),
            ));
        }
        Ok(Image {
            shape,
            format,
            buf: PixelBuf::Shared(data),
        })
    }

    /// Image dimensions
    pub fn shape(&self) -> ImageShape {
        self.shape
    }

    /// Pixel channel ordering
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Row-major pixel bytes
    pub fn bytes(&self) -> &[u8] {
        match &self.buf {
            PixelBuf::Shared(b) => b,
            PixelBuf::Owned(v) => v,
        }
    }

    /// Mutable pixel bytes, copying shared storage on first call.
    ///
    /// Untouched frames forward their image without any pixel copy; this
    /// is the single place a copy happens.
    pub fn make_mut(&mut self) -> &mut Vec<u8> {
        if let PixelBuf::Shared(b) = &self.buf {
            self.buf = PixelBuf::Owned(b.to_vec());
        }
        match &mut self.buf {
            PixelBuf::Owned(v) => v,
            PixelBuf::Shared(_) => unreachable!(),
        }
    }

    /// Consume into a cheaply cloneable buffer
    pub fn into_bytes(self) -> Bytes {
        match self.buf {
            PixelBuf::Shared(b) => b,
            PixelBuf::Owned(v) => Bytes::from(v),
        }
    }

    /// Whether the pixel storage is still shared (no copy has happened)
    pub fn is_shared(&self) -> bool {
        matches!(self.buf, PixelBuf::Shared(_))
    }

    /// Retag the channel ordering without touching bytes.
    ///
    /// Only valid between formats with the same channel count.
    pub(crate) fn retag(&mut self, format: PixelFormat) {
        debug_assert_eq!(self.shape.channels, format.channels());
        self.format = format;
    }
}

impl PartialEq for Image {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape
            && self.format == other.format
            && self.bytes() == other.bytes()
    }
}

/// One unit of dataflow: optional image plus JSON-shaped metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Topic this frame rides on
    pub topic: String,
    /// Monotonically increasing id per `(src, topic)`; gaps allowed
    pub id: u64,
    /// Wall time in nanoseconds since epoch, UTC
    pub ts: u64,
    /// Producing filter id
    pub src: String,
    /// Optional image payload
    pub image: Option<Image>,
    /// User metadata; the reserved `meta` sub-mapping is runtime-owned
    pub meta: Map<String, Value>,
}

impl Frame {
    /// Empty frame on a topic
    pub fn new(topic: impl Into<String>) -> Self {
        Frame {
            topic: topic.into(),
            id: 0,
            ts: 0,
            src: String::new(),
            image: None,
            meta: Map::new(),
        }
    }

    /// Attach an image payload
    pub fn with_image(mut self, image: Image) -> Self {
        self.image = Some(image);
        self
    }

    /// Attach metadata
    pub fn with_meta(mut self, meta: Map<String, Value>) -> Self {
        self.meta = meta;
        self
    }

    /// Whether an image payload is present
    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }

    /// Look up a dot-separated path in the metadata.
    ///
    /// The trailing segment `length` resolves to the element count of an
    /// array, object or string, which is what declarative metric
    /// extractors like `plates.length` rely on.
    pub fn meta_path(&self, path: &str) -> Option<Value> {
        lookup_path(&self.meta, path)
    }

    /// The runtime-owned `meta` sub-mapping, created on first access
    pub fn runtime_meta_mut(&mut self) -> &mut Map<String, Value> {
        let entry = self
            .meta
            .entry(META_KEY.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        entry.as_object_mut().expect("meta entry is an object")
    }

    /// The runtime-owned `meta` sub-mapping, if present
    pub fn runtime_meta(&self) -> Option<&Map<String, Value>> {
        self.meta.get(META_KEY).and_then(Value::as_object)
    }

    /// Mirror `id`/`ts`/`src`/`topic` into the reserved `meta` sub-mapping
    pub fn sync_runtime_meta(&mut self) {
        let id = self.id;
        let ts = self.ts;
        let src = self.src.clone();
        let topic = self.topic.clone();
        let meta = self.runtime_meta_mut();
        meta.insert("id".into(), Value::from(id));
        meta.insert("ts".into(), Value::from(ts));
        meta.insert("src".into(), Value::from(src));
        meta.insert("topic".into(), Value::from(topic));
    }

    /// Set a runtime metadata field (`fps`, `lat_in`, custom keys)
    pub fn set_runtime_field(&mut self, key: &str, value: impl Into<Value>) {
        self.runtime_meta_mut().insert(key.to_string(), value.into());
    }
}

/// Dot-path lookup over a metadata mapping.
///
/// Returns owned values so the synthetic `length` segment can produce a
/// number that exists nowhere in the document.
pub fn lookup_path(meta: &Map<String, Value>, path: &str) -> Option<Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = match meta.get(first) {
        Some(v) => v.clone(),
        None if first == "length" => Value::from(meta.len() as u64),
        None => return None,
    };
    for segment in segments {
        current = match &current {
            Value::Object(map) => match map.get(segment) {
                Some(v) => v.clone(),
                None if segment == "length" => Value::from(map.len() as u64),
                None => return None,
            },
            Value::Array(items) => {
                if segment == "length" {
                    Value::from(items.len() as u64)
                } else {
                    let idx: usize = segment.parse().ok()?;
                    items.get(idx)?.clone()
                }
            }
            Value::String(s) if segment == "length" => Value::from(s.chars().count() as u64),
            _ => return None,
        };
    }
    Some(current)
}
