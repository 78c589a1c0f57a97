// THEORY:
// The `Frame` is the most fundamental unit handed between stages. It is a "dumb",
// immutable container for one decoded photograph: a width, a height, and an
// interleaved RGBA buffer with 8 bits per channel.
//
// Key architectural principles:
// 1.  **Immutability**: Once a stage has produced a `Frame`, nobody mutates it.
//     There is no `&mut` access to the pixels; a stage that wants different pixels
//     builds a new `Frame`.
// 2.  **Ownership Hand-off**: Frames move from stage to stage (ingestion ->
//     execution context -> consumer). Moving a `Frame` into the execution context
//     is the transfer of its buffer; nothing is shared with the caller.
// 3.  **Single-Pixel Scope**: The only analysis a `Frame` knows how to do on its own
//     is the per-pixel grayscale transform in `luma`. Everything that compares
//     pixels lives in higher modules.

use image::{GrayImage, RgbaImage};

pub const CHANNELS: usize = 4;

/// An immutable RGBA image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    image: RgbaImage,
}

impl Frame {
    /// Builds a frame from a raw RGBA buffer. Returns `None` when the buffer
    /// length does not equal `width * height * 4`.
    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        RgbaImage::from_raw(width, height, pixels).map(|image| Self { image })
    }

    /// A frame where every pixel has the same value.
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        Self {
            image: RgbaImage::from_pixel(width, height, image::Rgba(rgba)),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// The interleaved RGBA bytes, row-major.
    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    /// The four channel values at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        self.image.get_pixel(x, y).0
    }

    pub fn as_image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }

    /// Converts to single-channel luma using Rec. 601 weights.
    pub fn to_gray(&self) -> GrayImage {
        let (width, height) = self.dimensions();
        let luma: Vec<u8> = self
            .pixels()
            .chunks_exact(CHANNELS)
            .map(|p| super::luma::luma::rec601(p[0], p[1], p[2]))
            .collect();
        // Same dimensions, one byte per pixel.
        GrayImage::from_raw(width, height, luma).unwrap_or_else(|| GrayImage::new(width, height))
    }
}

impl From<RgbaImage> for Frame {
    fn from(image: RgbaImage) -> Self {
        Self { image }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_buffer() {
        assert!(Frame::from_rgba(2, 2, vec![0u8; 15]).is_none());
        assert!(Frame::from_rgba(2, 2, vec![0u8; 16]).is_some());
    }

    #[test]
    fn gray_of_neutral_pixels_is_identity() {
        let frame = Frame::filled(3, 2, [77, 77, 77, 255]);
        let gray = frame.to_gray();
        assert_eq!(gray.dimensions(), (3, 2));
        assert!(gray.as_raw().iter().all(|&v| v == 77));
    }
}
