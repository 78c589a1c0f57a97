// THEORY:
// The `difference` module is where "change" is decided. Once the current photo
// has been warped onto the reference grid, the same wall location sits at the same
// pixel in both images, and a simple per-pixel comparison is meaningful.
//
// Key architectural principles:
// 1.  **Luma Only**: Both images are compared on their grayscale plane. Color casts
//     between the two shots matter far less than the bright/dark edges of a crack.
// 2.  **Hard Threshold**: A pixel is "changed" when the absolute luma difference is
//     strictly greater than the threshold. The result is a binary `DiffMask`.
// 3.  **Additive Highlight**: The overlay adds `weight * highlight` to every changed
//     pixel of the reference color image and leaves every other pixel untouched.
//     Channels saturate at 255; there is no normalization.

use crate::core_modules::frame::{CHANNELS, Frame};
use image::GrayImage;

/// Binary change mask with the reference image's dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffMask {
    width: u32,
    height: u32,
    /// One entry per pixel, 1 where changed.
    bits: Vec<u8>,
}

impl DiffMask {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_set(&self, x: u32, y: u32) -> bool {
        self.bits[(y * self.width + x) as usize] != 0
    }

    /// Number of changed pixels.
    pub fn count(&self) -> usize {
        self.bits.iter().filter(|&&b| b != 0).count()
    }
}

/// How changed pixels are painted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayStyle {
    pub highlight: [u8; CHANNELS],
    pub weight: f32,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            highlight: [0, 0, 255, 255],
            weight: 0.5,
        }
    }
}

/// The reference image with changed regions highlighted.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayResult {
    pub frame: Frame,
    pub changed_pixels: usize,
}

/// Marks pixels whose luma differs by more than `threshold`.
///
/// The mask always has the reference's dimensions. Where `warped` is smaller
/// (it never is when produced by the warp stage) its missing pixels read as 0.
pub fn diff_mask(reference: &GrayImage, warped: &GrayImage, threshold: u8) -> DiffMask {
    let (width, height) = reference.dimensions();
    let mut bits = vec![0u8; (width * height) as usize];
    for (x, y, r) in reference.enumerate_pixels() {
        let w = if x < warped.width() && y < warped.height() {
            warped.get_pixel(x, y)[0]
        } else {
            0
        };
        if r[0].abs_diff(w) > threshold {
            bits[(y * width + x) as usize] = 1;
        }
    }
    DiffMask { width, height, bits }
}

/// Blends the highlight over the reference wherever the mask is set.
pub fn composite(reference: &Frame, mask: &DiffMask, style: &OverlayStyle) -> OverlayResult {
    let overlay: [f32; CHANNELS] = style.highlight.map(|c| c as f32 * style.weight);
    let mut pixels = reference.pixels().to_vec();
    let mut changed_pixels = 0;

    for (i, px) in pixels.chunks_exact_mut(CHANNELS).enumerate() {
        if mask.bits.get(i).copied().unwrap_or(0) == 0 {
            continue;
        }
        changed_pixels += 1;
        for c in 0..CHANNELS {
            px[c] = (px[c] as f32 + overlay[c]).round().clamp(0.0, 255.0) as u8;
        }
    }

    let (width, height) = reference.dimensions();
    let frame = Frame::from_rgba(width, height, pixels).unwrap_or_else(|| reference.clone());
    OverlayResult { frame, changed_pixels }
}
