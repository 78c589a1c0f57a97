//! Image ingestion: fetching, decoding, and normalizing the two source photos.
//!
//! A locator is a file path, an `http(s)` URL, or an in-memory encoded buffer.
//! Every loaded image is scaled down so its longer side is at most
//! `max_dimension` and then round-tripped through JPEG at `reencode_quality`,
//! trading a little fidelity for a bounded working size.

use crate::core_modules::frame::Frame;
use crate::error::LoadError;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageEncoder, imageops};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_MAX_DIMENSION: u32 = 1200;
pub const DEFAULT_REENCODE_QUALITY: u8 = 90;

/// Where a source image comes from.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum ImageLocator {
    Path(PathBuf),
    Url(String),
    /// An encoded image (PNG, JPEG, ...) already in memory.
    Bytes(Arc<[u8]>),
}

impl ImageLocator {
    pub fn is_empty(&self) -> bool {
        match self {
            ImageLocator::Path(p) => p.as_os_str().is_empty(),
            ImageLocator::Url(u) => u.trim().is_empty(),
            ImageLocator::Bytes(b) => b.is_empty(),
        }
    }
}

impl fmt::Display for ImageLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageLocator::Path(p) => write!(f, "{}", p.display()),
            ImageLocator::Url(u) => write!(f, "{u}"),
            ImageLocator::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl fmt::Debug for ImageLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageLocator({self})")
    }
}

impl From<&str> for ImageLocator {
    fn from(s: &str) -> Self {
        if s.starts_with("http://") || s.starts_with("https://") {
            ImageLocator::Url(s.to_string())
        } else {
            ImageLocator::Path(PathBuf::from(s))
        }
    }
}

impl From<String> for ImageLocator {
    fn from(s: String) -> Self {
        ImageLocator::from(s.as_str())
    }
}

impl From<PathBuf> for ImageLocator {
    fn from(p: PathBuf) -> Self {
        ImageLocator::Path(p)
    }
}

impl From<&Path> for ImageLocator {
    fn from(p: &Path) -> Self {
        ImageLocator::Path(p.to_path_buf())
    }
}

impl From<Vec<u8>> for ImageLocator {
    fn from(bytes: Vec<u8>) -> Self {
        ImageLocator::Bytes(bytes.into())
    }
}

/// How loaded images are brought to working resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOptions {
    pub max_dimension: u32,
    /// JPEG quality of the intermediate working copy; `None` keeps pixels as decoded.
    pub reencode_quality: Option<u8>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            max_dimension: DEFAULT_MAX_DIMENSION,
            reencode_quality: Some(DEFAULT_REENCODE_QUALITY),
        }
    }
}

/// Loads both images concurrently and normalizes them.
pub async fn load_pair(
    reference: &ImageLocator,
    current: &ImageLocator,
    options: IngestOptions,
) -> Result<(Frame, Frame), LoadError> {
    futures::try_join!(prepare(reference, options), prepare(current, options))
}

/// Loads one image and brings it to working resolution.
pub async fn prepare(locator: &ImageLocator, options: IngestOptions) -> Result<Frame, LoadError> {
    let bytes = fetch_bytes(locator).await?;
    let label = locator.to_string();
    tokio::task::spawn_blocking(move || {
        let frame = decode(&bytes, &label)?;
        drop(bytes);
        let (w, h) = frame.dimensions();
        let frame = normalize(frame, options.max_dimension);
        debug!(source = %label, from = ?(w, h), to = ?frame.dimensions(), "normalized image");
        match options.reencode_quality {
            Some(quality) => reencode(frame, quality),
            None => Ok(frame),
        }
    })
    .await
    .map_err(|e| LoadError::Worker(e.to_string()))?
}

/// Fetches and decodes without any normalization.
pub async fn load(locator: &ImageLocator) -> Result<Frame, LoadError> {
    let bytes = fetch_bytes(locator).await?;
    decode(&bytes, &locator.to_string())
}

async fn fetch_bytes(locator: &ImageLocator) -> Result<Arc<[u8]>, LoadError> {
    if locator.is_empty() {
        return Err(LoadError::Empty);
    }
    match locator {
        ImageLocator::Path(path) => tokio::fs::read(path)
            .await
            .map(Arc::from)
            .map_err(|source| LoadError::Read {
                locator: locator.to_string(),
                source,
            }),
        ImageLocator::Url(url) => fetch_url(url).await.map(Arc::from),
        ImageLocator::Bytes(bytes) => Ok(bytes.clone()),
    }
}

async fn fetch_url(url: &str) -> Result<Vec<u8>, LoadError> {
    let fetch_error = |e: reqwest::Error| LoadError::Fetch {
        locator: url.to_string(),
        message: e.to_string(),
    };
    let response = reqwest::get(url).await.map_err(fetch_error)?;
    let response = response.error_for_status().map_err(fetch_error)?;
    let body = response.bytes().await.map_err(fetch_error)?;
    Ok(body.to_vec())
}

pub fn decode(bytes: &[u8], label: &str) -> Result<Frame, LoadError> {
    image::load_from_memory(bytes)
        .map(|img| Frame::from(img.to_rgba8()))
        .map_err(|source| LoadError::Decode {
            locator: label.to_string(),
            source,
        })
}

/// Scales `frame` down so its larger side equals `max_dimension`, keeping the
/// aspect ratio. Frames already within bounds pass through unchanged.
pub fn normalize(frame: Frame, max_dimension: u32) -> Frame {
    let (width, height) = frame.dimensions();
    if width <= max_dimension && height <= max_dimension {
        return frame;
    }
    let (new_width, new_height) = if width > height {
        let h = (height as f64 * max_dimension as f64 / width as f64).round() as u32;
        (max_dimension, h.max(1))
    } else {
        let w = (width as f64 * max_dimension as f64 / height as f64).round() as u32;
        (w.max(1), max_dimension)
    };
    let resized = imageops::resize(frame.as_image(), new_width, new_height, imageops::FilterType::Triangle);
    Frame::from(resized)
}

/// Round-trips the frame through JPEG at `quality` (1-100). Alpha comes back opaque.
pub fn reencode(frame: Frame, quality: u8) -> Result<Frame, LoadError> {
    let rgb = DynamicImage::ImageRgba8(frame.into_image()).to_rgb8();
    let mut encoded = Vec::new();
    JpegEncoder::new_with_quality(&mut encoded, quality.clamp(1, 100))
        .write_image(rgb.as_raw(), rgb.width(), rgb.height(), image::ExtendedColorType::Rgb8)
        .map_err(LoadError::Encode)?;
    drop(rgb);
    decode(&encoded, "working copy")
}

/// Writes `frame` as a PNG file.
pub fn save_png(frame: &Frame, path: impl AsRef<Path>) -> Result<(), image::ImageError> {
    let output = std::fs::File::create(path)?;
    let encoder = image::codecs::png::PngEncoder::new(std::io::BufWriter::new(output));
    encoder.write_image(
        frame.pixels(),
        frame.width(),
        frame.height(),
        image::ExtendedColorType::Rgba8,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded_png(width: u32, height: u32) -> Vec<u8> {
        let frame = Frame::filled(width, height, [10, 200, 30, 255]);
        let mut bytes = Vec::new();
        image::codecs::png::PngEncoder::new(&mut bytes)
            .write_image(frame.pixels(), width, height, image::ExtendedColorType::Rgba8)
            .expect("encode png");
        bytes
    }

    #[test]
    fn wide_image_is_clamped_to_max_dimension() {
        let out = normalize(Frame::filled(2000, 1000, [1, 2, 3, 255]), 1200);
        assert_eq!(out.dimensions(), (1200, 600));
    }

    #[test]
    fn tall_image_is_clamped_to_max_dimension() {
        let out = normalize(Frame::filled(1000, 2000, [1, 2, 3, 255]), 1200);
        assert_eq!(out.dimensions(), (600, 1200));
    }

    #[test]
    fn small_image_passes_through() {
        let frame = Frame::filled(800, 600, [9, 8, 7, 255]);
        let out = normalize(frame.clone(), 1200);
        assert_eq!(out, frame);
    }

    #[test]
    fn locator_classification() {
        assert_eq!(
            ImageLocator::from("https://example.com/a.jpg"),
            ImageLocator::Url("https://example.com/a.jpg".to_string())
        );
        assert_eq!(ImageLocator::from("photos/a.jpg"), ImageLocator::Path(PathBuf::from("photos/a.jpg")));
        assert!(ImageLocator::from("").is_empty());
        assert!(ImageLocator::from(Vec::<u8>::new()).is_empty());
    }

    #[test]
    fn reencode_keeps_dimensions_and_is_close() {
        let frame = Frame::filled(40, 30, [120, 60, 200, 255]);
        let out = reencode(frame, 90).expect("reencode");
        assert_eq!(out.dimensions(), (40, 30));
        let [r, g, b, a] = out.pixel(20, 15);
        assert!(r.abs_diff(120) <= 4 && g.abs_diff(60) <= 4 && b.abs_diff(200) <= 4);
        assert_eq!(a, 255);
    }

    #[tokio::test]
    async fn prepare_from_bytes() {
        let locator = ImageLocator::from(encoded_png(64, 48));
        let frame = prepare(&locator, IngestOptions::default()).await.expect("prepare");
        assert_eq!(frame.dimensions(), (64, 48));
    }

    #[tokio::test]
    async fn missing_file_is_read_error() {
        let locator = ImageLocator::from("/definitely/not/here.png");
        let err = load(&locator).await.unwrap_err();
        assert!(matches!(err, LoadError::Read { .. }));
    }

    #[tokio::test]
    async fn garbage_bytes_are_decode_error() {
        let locator = ImageLocator::from(vec![1u8, 2, 3, 4, 5]);
        let err = prepare(&locator, IngestOptions::default()).await.unwrap_err();
        assert!(matches!(err, LoadError::Decode { .. }));
    }

    #[tokio::test]
    async fn empty_locator_is_rejected() {
        let err = load(&ImageLocator::Url(String::new())).await.unwrap_err();
        assert!(matches!(err, LoadError::Empty));
    }

    #[test]
    fn png_round_trip_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.png");
        let frame = Frame::filled(5, 4, [1, 2, 3, 4]);
        save_png(&frame, &path).expect("save");
        let bytes = std::fs::read(&path).expect("read back");
        assert_eq!(decode(&bytes, "out.png").expect("decode"), frame);
    }
}
