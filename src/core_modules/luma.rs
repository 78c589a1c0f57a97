// THEORY (single-pixel luma):
// Grayscale conversion is the only heuristic computed from one pixel alone. Every
// later stage (feature detection, differencing) works on the luma plane, so the
// weights used here decide what "the same brightness" means across the engine.
//
// We use the Rec. 601 luma approximation (0.299 R + 0.587 G + 0.114 B). The
// weights sum to exactly 1.0, so neutral grays map to themselves, and alpha is
// ignored. The weighted sum is rounded, not truncated.

pub mod luma {
    pub type Byte = u8;

    const RED_WEIGHT: f32 = 0.299;
    const GREEN_WEIGHT: f32 = 0.587;
    const BLUE_WEIGHT: f32 = 0.114;

    /// Rec. 601 luma of an sRGB triple.
    pub fn rec601(red: Byte, green: Byte, blue: Byte) -> Byte {
        let y = RED_WEIGHT * red as f32 + GREEN_WEIGHT * green as f32 + BLUE_WEIGHT * blue as f32;
        y.round().clamp(0.0, 255.0) as Byte
    }
}
