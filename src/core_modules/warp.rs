//! Perspective warp of an RGBA frame into another frame's pixel grid.

use crate::core_modules::frame::{CHANNELS, Frame};
use crate::core_modules::homography::Homography;
use crate::error::AlignmentError;
use rayon::prelude::*;

const TRANSPARENT: [f32; CHANNELS] = [0.0; CHANNELS];

/// Resamples `source` so that it lines up with a `width` x `height` target grid.
///
/// `homography` maps source coordinates to target coordinates. Every target pixel
/// is pulled from the source through the inverse transform with bilinear
/// interpolation; taps outside the source read as transparent black.
pub fn warp_perspective(
    source: &Frame,
    homography: &Homography,
    width: u32,
    height: u32,
) -> Result<Frame, AlignmentError> {
    let inverse = homography.inverse().ok_or(AlignmentError::DegenerateHomography)?;
    let row_bytes = width as usize * CHANNELS;
    let mut out = vec![0u8; row_bytes * height as usize];

    if row_bytes > 0 {
        out.par_chunks_mut(row_bytes).enumerate().for_each(|(y, row)| {
            for x in 0..width as usize {
                let px = match inverse.project((x as f64, y as f64)) {
                    Some((sx, sy)) => bilinear(source, sx, sy),
                    None => [0; CHANNELS],
                };
                row[x * CHANNELS..(x + 1) * CHANNELS].copy_from_slice(&px);
            }
        });
    }

    Frame::from_rgba(width, height, out).ok_or(AlignmentError::DegenerateHomography)
}

fn bilinear(source: &Frame, sx: f64, sy: f64) -> [u8; CHANNELS] {
    let (w, h) = (source.width() as i64, source.height() as i64);
    if sx <= -1.0 || sy <= -1.0 || sx >= w as f64 || sy >= h as f64 {
        return [0; CHANNELS];
    }
    let x0 = sx.floor() as i64;
    let y0 = sy.floor() as i64;
    let fx = (sx - x0 as f64) as f32;
    let fy = (sy - y0 as f64) as f32;

    let tap = |x: i64, y: i64| -> [f32; CHANNELS] {
        if x < 0 || y < 0 || x >= w || y >= h {
            return TRANSPARENT;
        }
        source.pixel(x as u32, y as u32).map(f32::from)
    };
    let (p00, p10, p01, p11) = (tap(x0, y0), tap(x0 + 1, y0), tap(x0, y0 + 1), tap(x0 + 1, y0 + 1));

    let mut px = [0u8; CHANNELS];
    for c in 0..CHANNELS {
        let top = p00[c] + (p10[c] - p00[c]) * fx;
        let bottom = p01[c] + (p11[c] - p01[c]) * fx;
        px[c] = (top + (bottom - top) * fy).round().clamp(0.0, 255.0) as u8;
    }
    px
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix3;

    fn gradient(width: u32, height: u32) -> Frame {
        let mut pixels = Vec::with_capacity((width * height) as usize * CHANNELS);
        for y in 0..height {
            for x in 0..width {
                pixels.extend_from_slice(&[(x * 10) as u8, (y * 10) as u8, 50, 255]);
            }
        }
        Frame::from_rgba(width, height, pixels).expect("buffer matches")
    }

    #[test]
    fn identity_warp_is_lossless() {
        let src = gradient(12, 9);
        let out = warp_perspective(&src, &Homography::identity(), 12, 9).expect("warp");
        assert_eq!(out, src);
    }

    #[test]
    fn translation_shifts_and_fills_transparent() {
        let src = gradient(10, 10);
        let shift = Homography::from_matrix(Matrix3::new(1.0, 0.0, 3.0, 0.0, 1.0, 2.0, 0.0, 0.0, 1.0))
            .expect("valid");
        let out = warp_perspective(&src, &shift, 10, 10).expect("warp");
        assert_eq!(out.pixel(5, 4), src.pixel(2, 2));
        assert_eq!(out.pixel(0, 0), [0, 0, 0, 0]);
        assert_eq!(out.pixel(2, 9), [0, 0, 0, 0]);
    }

    #[test]
    fn output_takes_target_dimensions() {
        let src = gradient(8, 6);
        let out = warp_perspective(&src, &Homography::identity(), 20, 3).expect("warp");
        assert_eq!(out.dimensions(), (20, 3));
        assert_eq!(out.pixel(19, 0), [0, 0, 0, 0]);
    }
}
