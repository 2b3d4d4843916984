use serde::{Deserialize, Serialize};

/// Placement of a source rectangle inside a destination frame: scaled to fit
/// without cropping, then centered. The render path and the preview
/// positioning both use this exact math, so it must not drift.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Letterbox {
    pub width: u32,
    pub height: u32,
    pub left: u32,
    pub top: u32,
}

pub fn letterbox(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Letterbox {
    if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
        return Letterbox { width: dst_w, height: dst_h, left: 0, top: 0 };
    }

    let src_aspect = src_w as f64 / src_h as f64;
    let dst_aspect = dst_w as f64 / dst_h as f64;

    let (width, height) = if src_aspect > dst_aspect {
        (dst_w, (dst_w as f64 / src_aspect).round() as u32)
    } else {
        ((dst_h as f64 * src_aspect).round() as u32, dst_h)
    };
    // a sliver source must still produce at least one pixel row/column
    let (width, height) = (width.clamp(1, dst_w), height.clamp(1, dst_h));

    Letterbox {
        width,
        height,
        left: (dst_w - width) / 2,
        top: (dst_h - height) / 2,
    }
}

impl Letterbox {
    /// ffmpeg filter chain that reproduces this placement on a `dst_w`x`dst_h`
    /// canvas. Sizes are spelled out so ffmpeg never applies its own rounding.
    pub fn filter(&self, dst_w: u32, dst_h: u32, pad_color: &str) -> String {
        format!(
            "scale={}:{}:flags=lanczos,pad={}:{}:{}:{}:color={},setsar=1",
            self.width, self.height, dst_w, dst_h, self.left, self.top, pad_color
        )
    }
}

/// Map a point inside a preview box (where the output frame is shown
/// letterboxed) to pixel coordinates of the output frame.
pub fn map_preview_point(
    preview_w: u32,
    preview_h: u32,
    x: f64,
    y: f64,
    dst_w: u32,
    dst_h: u32,
) -> (i32, i32) {
    let lb = letterbox(dst_w, dst_h, preview_w, preview_h);
    if lb.width == 0 || lb.height == 0 {
        return (0, 0);
    }
    let fx = (x - lb.left as f64) * dst_w as f64 / lb.width as f64;
    let fy = (y - lb.top as f64) * dst_h as f64 / lb.height as f64;
    (fx.round() as i32, fy.round() as i32)
}
