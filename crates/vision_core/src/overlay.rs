use image::{Rgb, RgbImage, Rgba, RgbaImage};

/// Half-transparent green used to tint predicted road pixels.
pub const ROAD_TINT: Rgba<u8> = Rgba([0, 255, 0, 127]);

/// Render a row-major boolean mask as an RGBA layer: `color` where set, fully
/// transparent elsewhere. Returns `None` when `mask` does not hold `width * height` entries.
pub fn mask_layer(mask: &[bool], dims: (u32, u32), color: Rgba<u8>) -> Option<RgbaImage> {
    let (w, h) = dims;
    if mask.len() != (w as usize) * (h as usize) {
        return None;
    }
    Some(RgbaImage::from_fn(w, h, |x, y| {
        if mask[(y * w + x) as usize] {
            color
        } else {
            Rgba([0, 0, 0, 0])
        }
    }))
}

/// Paste `layer` onto `base`, weighting each layer pixel by its own alpha.
pub fn blend_mask(base: &RgbImage, layer: &RgbaImage) -> Option<RgbImage> {
    if base.dimensions() != layer.dimensions() {
        return None;
    }
    let mut out = base.clone();
    for (px, over) in out.pixels_mut().zip(layer.pixels()) {
        let alpha = over[3] as u32;
        if alpha == 0 {
            continue;
        }
        let mix = |b: u8, o: u8| -> u8 {
            ((o as u32 * alpha + b as u32 * (255 - alpha) + 127) / 255) as u8
        };
        *px = Rgb([mix(px[0], over[0]), mix(px[1], over[1]), mix(px[2], over[2])]);
    }
    Some(out)
}
