use crate::frame::{FrameGeometry, PixelFormat};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const BLACK: Color = Color::rgb(0, 0, 0);
    pub const WHITE: Color = Color::rgb(255, 255, 255);
    pub const GREEN: Color = Color::rgb(0, 200, 80);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// BT.601 full range.
    pub fn to_yuv(self) -> (u8, u8, u8) {
        let r = self.r as f32;
        let g = self.g as f32;
        let b = self.b as f32;
        let y = 0.299 * r + 0.587 * g + 0.114 * b;
        let u = -0.169 * r - 0.331 * g + 0.5 * b + 128.0;
        let v = 0.5 * r - 0.419 * g - 0.081 * b + 128.0;
        (clamp(y), clamp(u), clamp(v))
    }
}

fn clamp(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Intersection with the picture, `None` when nothing is left.
    fn clip(self, width: u32, height: u32) -> Option<(usize, usize, usize, usize)> {
        let x0 = self.x.max(0) as i64;
        let y0 = self.y.max(0) as i64;
        let x1 = (self.x as i64 + self.width as i64).min(width as i64);
        let y1 = (self.y as i64 + self.height as i64).min(height as i64);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0 as usize, y0 as usize, x1 as usize, y1 as usize))
    }
}

#[inline]
fn blend(dst: &mut u8, value: u8, alpha: u8) {
    let a = alpha as u32;
    *dst = ((*dst as u32 * (255 - a) + value as u32 * a) / 255) as u8;
}

/// Fills `rect` with `color`, blended by `alpha` (255 = opaque). The rect is
/// clipped to the picture; chroma is written for every 2x2 block it touches.
pub fn fill_rect(data: &mut [u8], geo: &FrameGeometry, rect: Rect, color: Color, alpha: u8) {
    let Some((x0, y0, x1, y1)) = rect.clip(geo.width, geo.height) else {
        return;
    };
    if data.len() < geo.size() {
        log::warn!("fill_rect: buffer smaller than {}", geo);
        return;
    }
    let planes = geo.planes();

    match geo.format {
        PixelFormat::Rgb24 | PixelFormat::Rgba => {
            let bpp = geo.format.bytes_per_pixel();
            let plane = planes[0];
            for row in y0..y1 {
                let line = plane.offset + row * plane.stride;
                for col in x0..x1 {
                    let px = line + col * bpp;
                    blend(&mut data[px], color.r, alpha);
                    blend(&mut data[px + 1], color.g, alpha);
                    blend(&mut data[px + 2], color.b, alpha);
                }
            }
        }
        PixelFormat::Nv12 | PixelFormat::Nv21 | PixelFormat::Yuv420p => {
            let (y, u, v) = color.to_yuv();
            let luma = planes[0];
            for row in y0..y1 {
                let line = luma.offset + row * luma.stride;
                for px in &mut data[line + x0..line + x1] {
                    blend(px, y, alpha);
                }
            }

            let (cx0, cy0) = (x0 / 2, y0 / 2);
            let (cx1, cy1) = (x1.div_ceil(2), y1.div_ceil(2));
            match geo.format {
                PixelFormat::Yuv420p => {
                    for (plane, value) in [(planes[1], u), (planes[2], v)] {
                        for row in cy0..cy1 {
                            let line = plane.offset + row * plane.stride;
                            for px in &mut data[line + cx0..line + cx1] {
                                blend(px, value, alpha);
                            }
                        }
                    }
                }
                _ => {
                    let (first, second) = if geo.format == PixelFormat::Nv12 {
                        (u, v)
                    } else {
                        (v, u)
                    };
                    let plane = planes[1];
                    for row in cy0..cy1 {
                        let line = plane.offset + row * plane.stride;
                        for col in cx0..cx1 {
                            blend(&mut data[line + col * 2], first, alpha);
                            blend(&mut data[line + col * 2 + 1], second, alpha);
                        }
                    }
                }
            }
        }
    }
}

/// Draws a rectangle outline of the given thickness, growing inwards.
pub fn stroke_rect(
    data: &mut [u8],
    geo: &FrameGeometry,
    rect: Rect,
    color: Color,
    thickness: i32,
) {
    let t = thickness.max(1).min(rect.width.min(rect.height).max(1));
    let Rect {
        x,
        y,
        width,
        height,
    } = rect;
    fill_rect(data, geo, Rect::new(x, y, width, t), color, 255);
    fill_rect(data, geo, Rect::new(x, y + height - t, width, t), color, 255);
    fill_rect(data, geo, Rect::new(x, y, t, height), color, 255);
    fill_rect(data, geo, Rect::new(x + width - t, y, t, height), color, 255);
}
