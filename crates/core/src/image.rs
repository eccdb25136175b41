//! Pure image transforms
//!
//! Helpers shared by many filters: flips, 90° rotations, SIMD resize,
//! format conversion and box drawing. Nothing here touches the transport
//! or the runtime; every transform is a pure function from image to
//! image. [`FrameTransform`] adds the per-topic predicate so pipelines
//! rewrite only selected frames.

use fast_image_resize as fir;
use fir::images::{TypedImage, TypedImageRef};
use fir::pixels::{U8, U8x3};
use fir::{ResizeAlg, ResizeOptions, Resizer};

use crate::frame::{Frame, Image, PixelFormat};
use crate::{Error, Result};

/// Interpolation kernel for [`resize`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResizeFilter {
    /// Nearest neighbour
    Nearest,
    /// Bilinear convolution (the default)
    #[default]
    Bilinear,
    /// Catmull-Rom cubic convolution
    Cubic,
}

impl ResizeFilter {
    fn algorithm(&self) -> ResizeAlg {
        match self {
            ResizeFilter::Nearest => ResizeAlg::Nearest,
            ResizeFilter::Bilinear => ResizeAlg::Convolution(fir::FilterType::Bilinear),
            ResizeFilter::Cubic => ResizeAlg::Convolution(fir::FilterType::CatmullRom),
        }
    }

    /// Case-insensitive parse
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nearest" => Ok(ResizeFilter::Nearest),
            "bilinear" => Ok(ResizeFilter::Bilinear),
            "cubic" => Ok(ResizeFilter::Cubic),
            other => Err(Error::config_field(
                "resize",
                format!("unknown filter {other:?}"),
            )),
        }
    }
}

/// Aspect handling for [`resize`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResizeMode {
    /// Exact target dimensions, aspect not preserved
    #[default]
    Stretch,
    /// Largest aspect-preserving size fitting inside the target box
    Contain,
}

impl ResizeMode {
    /// Case-insensitive parse
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "stretch" => Ok(ResizeMode::Stretch),
            "contain" => Ok(ResizeMode::Contain),
            other => Err(Error::config_field(
                "resize",
                format!("unknown mode {other:?}"),
            )),
        }
    }
}

/// Columns reversed
pub fn flip_x(img: &Image) -> Image {
    let shape = img.shape();
    let (h, w, c) = (shape.height as usize, shape.width as usize, shape.channels as usize);
    let src = img.bytes();
    let mut out = vec![0u8; src.len()];
    for row in 0..h {
        let base = row * w * c;
        for col in 0..w {
            let s = base + col * c;
            let d = base + (w - 1 - col) * c;
            out[d..d + c].copy_from_slice(&src[s..s + c]);
        }
    }
    rebuild(img, shape.height, shape.width, out)
}

/// Rows reversed
pub fn flip_y(img: &Image) -> Image {
    let shape = img.shape();
    let (h, w, c) = (shape.height as usize, shape.width as usize, shape.channels as usize);
    let src = img.bytes();
    let row_bytes = w * c;
    let mut out = vec![0u8; src.len()];
    for row in 0..h {
        let s = row * row_bytes;
        let d = (h - 1 - row) * row_bytes;
        out[d..d + row_bytes].copy_from_slice(&src[s..s + row_bytes]);
    }
    rebuild(img, shape.height, shape.width, out)
}

/// 180° rotation
pub fn flip_both(img: &Image) -> Image {
    flip_y(&flip_x(img))
}

/// 90° clockwise rotation; output dimensions are swapped
pub fn rot_cw(img: &Image) -> Image {
    let shape = img.shape();
    let (h, w, c) = (shape.height as usize, shape.width as usize, shape.channels as usize);
    let src = img.bytes();
    let mut out = vec![0u8; src.len()];
    // out(y, x) = in(h-1-x, y), out is w rows by h columns
    for y in 0..w {
        for x in 0..h {
            let s = ((h - 1 - x) * w + y) * c;
            let d = (y * h + x) * c;
            out[d..d + c].copy_from_slice(&src[s..s + c]);
        }
    }
    rebuild(img, shape.width, shape.height, out)
}

/// 90° counter-clockwise rotation; output dimensions are swapped
pub fn rot_ccw(img: &Image) -> Image {
    let shape = img.shape();
    let (h, w, c) = (shape.height as usize, shape.width as usize, shape.channels as usize);
    let src = img.bytes();
    let mut out = vec![0u8; src.len()];
    // out(y, x) = in(x, w-1-y), out is w rows by h columns
    for y in 0..w {
        for x in 0..h {
            let s = (x * w + (w - 1 - y)) * c;
            let d = (y * h + x) * c;
            out[d..d + c].copy_from_slice(&src[s..s + c]);
        }
    }
    rebuild(img, shape.width, shape.height, out)
}

/// Scale to `width`×`height`.
///
/// `Contain` picks the largest aspect-preserving size that fits inside
/// the target box; `Stretch` hits it exactly. Resizing to the current
/// dimensions returns the image unchanged, which makes same-size resize
/// idempotent.
pub fn resize(
    img: &Image,
    width: u32,
    height: u32,
    filter: ResizeFilter,
    mode: ResizeMode,
) -> Result<Image> {
    if width == 0 || height == 0 {
        return Err(Error::config_field("resize", "target dimensions must be non-zero"));
    }
    let shape = img.shape();
    let (tw, th) = match mode {
        ResizeMode::Stretch => (width, height),
        ResizeMode::Contain => contain_dims(shape.width, shape.height, width, height),
    };
    if tw == shape.width && th == shape.height {
        return Ok(img.clone());
    }

    let mut out = vec![0u8; th as usize * tw as usize * shape.channels as usize];
    let opts = ResizeOptions::new().resize_alg(filter.algorithm());
    let mut resizer = Resizer::new();
    let map_err =
        |e: fir::ResizeError| Error::frame("resize-failed", e.to_string());
    match shape.channels {
        3 => {
            let src = TypedImageRef::<U8x3>::from_buffer(shape.width, shape.height, img.bytes())
                .map_err(|e| Error::frame("resize-failed", e.to_string()))?;
            let mut dst = TypedImage::<U8x3>::from_buffer(tw, th, &mut out)
                .map_err(|e| Error::frame("resize-failed", e.to_string()))?;
            resizer
                .resize_typed::<U8x3>(&src, &mut dst, &opts)
                .map_err(map_err)?;
        }
        _ => {
            let src = TypedImageRef::<U8>::from_buffer(shape.width, shape.height, img.bytes())
                .map_err(|e| Error::frame("resize-failed", e.to_string()))?;
            let mut dst = TypedImage::<U8>::from_buffer(tw, th, &mut out)
                .map_err(|e| Error::frame("resize-failed", e.to_string()))?;
            resizer
                .resize_typed::<U8>(&src, &mut dst, &opts)
                .map_err(map_err)?;
        }
    }
    Image::new(th, tw, img.format(), out)
}

/// Scale down to fit within `width`×`height` if larger; otherwise identity
pub fn maxsize(img: &Image, width: u32, height: u32, filter: ResizeFilter) -> Result<Image> {
    let shape = img.shape();
    if shape.width <= width && shape.height <= height {
        return Ok(img.clone());
    }
    resize(img, width, height, filter, ResizeMode::Contain)
}

/// Scale up until both dimensions reach `width`×`height` if smaller
pub fn minsize(img: &Image, width: u32, height: u32, filter: ResizeFilter) -> Result<Image> {
    let shape = img.shape();
    if shape.width >= width && shape.height >= height {
        return Ok(img.clone());
    }
    let sx = width as f64 / shape.width as f64;
    let sy = height as f64 / shape.height as f64;
    let scale = sx.max(sy);
    let tw = (shape.width as f64 * scale).round().max(1.0) as u32;
    let th = (shape.height as f64 * scale).round().max(1.0) as u32;
    resize(img, tw, th, filter, ResizeMode::Stretch)
}

fn contain_dims(w: u32, h: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    let sx = max_w as f64 / w as f64;
    let sy = max_h as f64 / h as f64;
    let scale = sx.min(sy);
    let tw = (w as f64 * scale).round().max(1.0) as u32;
    let th = (h as f64 * scale).round().max(1.0) as u32;
    (tw.min(max_w), th.min(max_h))
}

/// Convert channel ordering, going through luminance for grayscale.
///
/// BGR↔RGB is a channel swap; conversion to `Gray` uses BT.601 weights;
/// conversion from `Gray` replicates the single channel.
pub fn convert_fmt(img: &Image, to: PixelFormat) -> Result<Image> {
    let from = img.format();
    if from == to {
        return Ok(img.clone());
    }
    let shape = img.shape();
    let src = img.bytes();
    match (from, to) {
        (PixelFormat::Bgr, PixelFormat::Rgb) | (PixelFormat::Rgb, PixelFormat::Bgr) => {
            let mut out = src.to_vec();
            for px in out.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            let mut image = Image::new(shape.height, shape.width, from, out)?;
            image.retag(to);
            Ok(image)
        }
        (PixelFormat::Bgr, PixelFormat::Gray) | (PixelFormat::Rgb, PixelFormat::Gray) => {
            let (ri, gi, bi) = if from == PixelFormat::Bgr { (2, 1, 0) } else { (0, 1, 2) };
            let out: Vec<u8> = src
                .chunks_exact(3)
                .map(|px| luminance(px[ri], px[gi], px[bi]))
                .collect();
            Image::new(shape.height, shape.width, PixelFormat::Gray, out)
        }
        (PixelFormat::Gray, PixelFormat::Bgr) | (PixelFormat::Gray, PixelFormat::Rgb) => {
            let mut out = Vec::with_capacity(src.len() * 3);
            for &v in src {
                out.extend_from_slice(&[v, v, v]);
            }
            Image::new(shape.height, shape.width, to, out)
        }
        _ => unreachable!("identity handled above"),
    }
}

fn luminance(r: u8, g: u8, b: u8) -> u8 {
    (0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64).round() as u8
}

/// RGB color for [`draw_box`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    /// Parse `#rrggbb`
    pub fn parse(s: &str) -> Result<Self> {
        let hex = s.strip_prefix('#').unwrap_or(s);
        if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::config_field(
                "color",
                format!("expected #rrggbb, got {s:?}"),
            ));
        }
        let byte = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).unwrap();
        Ok(Rgb(byte(0), byte(2), byte(4)))
    }

    fn pixel(&self, format: PixelFormat) -> [u8; 3] {
        match format {
            PixelFormat::Rgb => [self.0, self.1, self.2],
            PixelFormat::Bgr => [self.2, self.1, self.0],
            PixelFormat::Gray => {
                let v = luminance(self.0, self.1, self.2);
                [v, v, v]
            }
        }
    }
}

/// Axis-aligned rectangle in relative coordinates, each component 0..1
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelRect {
    /// Left edge
    pub x: f64,
    /// Top edge
    pub y: f64,
    /// Width
    pub w: f64,
    /// Height
    pub h: f64,
}

/// Draw a solid-color box outline.
///
/// Coordinates are relative (0..1) to the image dimensions; `thickness`
/// is in pixels, with 0 meaning a filled rectangle. Out-of-range parts
/// are clipped.
pub fn draw_box(img: &Image, rect: RelRect, color: Rgb, thickness: u32) -> Image {
    let shape = img.shape();
    let (h, w, c) = (shape.height as usize, shape.width as usize, shape.channels as usize);
    let mut out = img.bytes().to_vec();

    let x0 = ((rect.x * w as f64).round().max(0.0) as usize).min(w);
    let y0 = ((rect.y * h as f64).round().max(0.0) as usize).min(h);
    let x1 = (((rect.x + rect.w) * w as f64).round().max(0.0) as usize).min(w);
    let y1 = (((rect.y + rect.h) * h as f64).round().max(0.0) as usize).min(h);
    let px = color.pixel(img.format());
    let t = thickness as usize;

    for row in y0..y1 {
        for col in x0..x1 {
            let on_edge = t == 0
                || row < y0 + t
                || row >= y1.saturating_sub(t)
                || col < x0 + t
                || col >= x1.saturating_sub(t);
            if on_edge {
                let base = (row * w + col) * c;
                out[base..base + c].copy_from_slice(&px[..c]);
            }
        }
    }
    rebuild(img, shape.height, shape.width, out)
}

fn rebuild(img: &Image, height: u32, width: u32, data: Vec<u8>) -> Image {
    Image::new(height, width, img.format(), data).expect("transform preserves byte count")
}

/// One declarative transform step
#[derive(Debug, Clone)]
pub enum ImageOp {
    /// Columns reversed
    FlipX,
    /// Rows reversed
    FlipY,
    /// 180° rotation
    FlipBoth,
    /// 90° clockwise
    RotCw,
    /// 90° counter-clockwise
    RotCcw,
    /// Scale to target
    Resize {
        /// Target width
        width: u32,
        /// Target height
        height: u32,
        /// Interpolation kernel
        filter: ResizeFilter,
        /// Aspect handling
        mode: ResizeMode,
    },
    /// Scale down to fit if larger
    MaxSize {
        /// Maximum width
        width: u32,
        /// Maximum height
        height: u32,
    },
    /// Scale up to cover if smaller
    MinSize {
        /// Minimum width
        width: u32,
        /// Minimum height
        height: u32,
    },
    /// Retag/convert channel ordering
    Convert(PixelFormat),
    /// Solid-color rectangle
    DrawBox {
        /// Relative rectangle
        rect: RelRect,
        /// Color
        color: Rgb,
        /// Outline thickness in pixels, 0 = filled
        thickness: u32,
    },
}

impl ImageOp {
    /// Parse a transform description, e.g. `resize 640x480 bilinear contain`,
    /// `maxsize 1280x720`, `convert_fmt rgb`, `draw_box 0.1+0.1 0.5x0.5 #ff0000`.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut words = spec.split_whitespace();
        let op = words.next().unwrap_or_default().to_ascii_lowercase();
        let rest: Vec<&str> = words.collect();
        let bad = || Error::config_field("transform", format!("malformed transform {spec:?}"));
        match op.as_str() {
            "flip_x" => Ok(ImageOp::FlipX),
            "flip_y" => Ok(ImageOp::FlipY),
            "flip_both" => Ok(ImageOp::FlipBoth),
            "rot_cw" => Ok(ImageOp::RotCw),
            "rot_ccw" => Ok(ImageOp::RotCcw),
            "resize" => {
                let (width, height) = parse_dims(rest.first().ok_or_else(bad)?)?;
                let filter = rest
                    .get(1)
                    .map(|s| ResizeFilter::parse(s))
                    .transpose()?
                    .unwrap_or_default();
                let mode = rest
                    .get(2)
                    .map(|s| ResizeMode::parse(s))
                    .transpose()?
                    .unwrap_or_default();
                Ok(ImageOp::Resize {
                    width,
                    height,
                    filter,
                    mode,
                })
            }
            "maxsize" => {
                let (width, height) = parse_dims(rest.first().ok_or_else(bad)?)?;
                Ok(ImageOp::MaxSize { width, height })
            }
            "minsize" => {
                let (width, height) = parse_dims(rest.first().ok_or_else(bad)?)?;
                Ok(ImageOp::MinSize { width, height })
            }
            "convert_fmt" => {
                let fmt = PixelFormat::parse(rest.first().ok_or_else(bad)?)?;
                Ok(ImageOp::Convert(fmt))
            }
            "draw_box" => {
                let origin = rest.first().ok_or_else(bad)?;
                let dims = rest.get(1).ok_or_else(bad)?;
                let color = Rgb::parse(rest.get(2).ok_or_else(bad)?)?;
                let (x, y) = origin.split_once('+').ok_or_else(bad)?;
                let (w, h) = dims.split_once('x').ok_or_else(bad)?;
                let f = |s: &str| s.parse::<f64>().map_err(|_| bad());
                Ok(ImageOp::DrawBox {
                    rect: RelRect {
                        x: f(x)?,
                        y: f(y)?,
                        w: f(w)?,
                        h: f(h)?,
                    },
                    color,
                    thickness: 2,
                })
            }
            _ => Err(bad()),
        }
    }

    /// Apply to an image
    pub fn apply(&self, img: &Image) -> Result<Image> {
        match self {
            ImageOp::FlipX => Ok(flip_x(img)),
            ImageOp::FlipY => Ok(flip_y(img)),
            ImageOp::FlipBoth => Ok(flip_both(img)),
            ImageOp::RotCw => Ok(rot_cw(img)),
            ImageOp::RotCcw => Ok(rot_ccw(img)),
            ImageOp::Resize {
                width,
                height,
                filter,
                mode,
            } => resize(img, *width, *height, *filter, *mode),
            ImageOp::MaxSize { width, height } => {
                maxsize(img, *width, *height, ResizeFilter::default())
            }
            ImageOp::MinSize { width, height } => {
                minsize(img, *width, *height, ResizeFilter::default())
            }
            ImageOp::Convert(fmt) => convert_fmt(img, *fmt),
            ImageOp::DrawBox {
                rect,
                color,
                thickness,
            } => Ok(draw_box(img, *rect, *color, *thickness)),
        }
    }
}

/// Parse a comma-separated transform chain, e.g.
/// `flip_x, resize 640x480 bilinear, convert_fmt rgb`
pub fn parse_ops(spec: &str) -> Result<Vec<ImageOp>> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ImageOp::parse)
        .collect()
}

/// Apply a transform chain left to right
pub fn apply_ops(img: &Image, ops: &[ImageOp]) -> Result<Image> {
    let mut current = img.clone();
    for op in ops {
        current = op.apply(&current)?;
    }
    Ok(current)
}

fn parse_dims(s: &str) -> Result<(u32, u32)> {
    let (w, h) = s
        .split_once('x')
        .ok_or_else(|| Error::config_field("transform", format!("expected WxH, got {s:?}")))?;
    let parse = |v: &str| {
        v.parse::<u32>()
            .map_err(|_| Error::config_field("transform", format!("bad dimension {v:?}")))
    };
    Ok((parse(w)?, parse(h)?))
}

/// Topic predicate selecting which frames a transform rewrites
#[derive(Debug, Clone, Default)]
pub struct TopicFilter {
    topics: Option<Vec<String>>,
}

impl TopicFilter {
    /// Match every topic
    pub fn all() -> Self {
        TopicFilter { topics: None }
    }

    /// Match only the listed topics
    pub fn only<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TopicFilter {
            topics: Some(topics.into_iter().map(Into::into).collect()),
        }
    }

    /// Whether a topic is selected
    pub fn matches(&self, topic: &str) -> bool {
        match &self.topics {
            None => true,
            Some(list) => list.iter().any(|t| t == topic),
        }
    }
}

/// A transform bound to a topic predicate
#[derive(Debug, Clone)]
pub struct FrameTransform {
    /// The operation
    pub op: ImageOp,
    /// Which topics to rewrite
    pub topics: TopicFilter,
}

impl FrameTransform {
    /// Transform applied to every topic
    pub fn new(op: ImageOp) -> Self {
        FrameTransform {
            op,
            topics: TopicFilter::all(),
        }
    }

    /// Restrict to selected topics
    pub fn on_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = TopicFilter::only(topics);
        self
    }

    /// Rewrite the frame's image in place when the predicate selects it.
    ///
    /// Frames without an image, or on unselected topics, pass untouched.
    pub fn apply(&self, frame: &mut Frame) -> Result<()> {
        if !self.topics.matches(&frame.topic) {
            return Ok(());
        }
        if let Some(img) = &frame.image {
            frame.image = Some(self.op.apply(img)?);
        }
        Ok(())
    }
}
