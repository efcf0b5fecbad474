use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::Context;

use crate::buffer::{DeviceAllocator, FrameBuffer};

/// Row/column alignment, in pixels, of buffers allocated by a `BufferPool`.
pub const STRIDE_ALIGN: u32 = 16;

/// `None` when the rounded value does not fit in a `u32`.
pub fn align_up(value: u32, align: u32) -> Option<u32> {
    value.checked_next_multiple_of(align)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// YUV420SP, UV interleaved
    Nv12,
    /// YUV420SP, VU interleaved
    Nv21,
    /// I420, three planes
    Yuv420p,
    Rgb24,
    Rgba,
}

impl PixelFormat {
    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Nv12 => "nv12",
            PixelFormat::Nv21 => "nv21",
            PixelFormat::Yuv420p => "yuv420p",
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Rgba => "rgba",
        }
    }

    pub fn is_yuv420(self) -> bool {
        matches!(
            self,
            PixelFormat::Nv12 | PixelFormat::Nv21 | PixelFormat::Yuv420p
        )
    }

    /// Bytes per pixel of the first (or only) plane.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb24 => 3,
            PixelFormat::Rgba => 4,
            _ => 1,
        }
    }
}

impl FromStr for PixelFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nv12" | "yuv420sp" => Ok(PixelFormat::Nv12),
            "nv21" => Ok(PixelFormat::Nv21),
            "yuv420p" | "i420" => Ok(PixelFormat::Yuv420p),
            "rgb24" | "rgb" => Ok(PixelFormat::Rgb24),
            "rgba" => Ok(PixelFormat::Rgba),
            other => Err(anyhow::anyhow!("unsupported pixel format: {}", other)),
        }
    }
}

impl Display for PixelFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.write_str(self.name())
    }
}

/// Byte layout of one plane inside a frame buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Plane {
    pub offset: usize,
    pub stride: usize,
    pub row_bytes: usize,
    pub rows: usize,
}

/// Picture size plus the strides of the memory holding it. Strides are in
/// pixels, `height_stride` is the number of rows reserved for the luma plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub width_stride: u32,
    pub height_stride: u32,
    pub format: PixelFormat,
}

impl FrameGeometry {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            width_stride: width,
            height_stride: height,
            format,
        }
    }

    /// Geometry with strides rounded up to `STRIDE_ALIGN`. This is the layout
    /// of every frame handed to the sink, whichever path it took.
    pub fn aligned(width: u32, height: u32, format: PixelFormat) -> anyhow::Result<Self> {
        let (Some(width_stride), Some(height_stride)) = (
            align_up(width, STRIDE_ALIGN),
            align_up(height, STRIDE_ALIGN),
        ) else {
            anyhow::bail!("video size {}x{} too large to align", width, height);
        };
        Ok(Self {
            width,
            height,
            width_stride,
            height_stride,
            format,
        })
    }

    pub fn with_strides(mut self, width_stride: u32, height_stride: u32) -> Self {
        self.width_stride = width_stride;
        self.height_stride = height_stride;
        self
    }

    /// Same picture (width, height, format), strides ignored.
    pub fn same_picture(&self, width: u32, height: u32, format: PixelFormat) -> bool {
        self.width == width && self.height == height && self.format == format
    }

    /// Buffer size in bytes. Saturates for geometry that `validate` rejects.
    pub fn size(&self) -> usize {
        self.checked_size().unwrap_or(usize::MAX)
    }

    pub fn checked_size(&self) -> Option<usize> {
        let pixels = (self.width_stride as usize).checked_mul(self.height_stride as usize)?;
        match self.format {
            PixelFormat::Nv12 | PixelFormat::Nv21 | PixelFormat::Yuv420p => {
                pixels.checked_mul(3).map(|n| n / 2)
            }
            PixelFormat::Rgb24 => pixels.checked_mul(3),
            PixelFormat::Rgba => pixels.checked_mul(4),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.width == 0 || self.height == 0 {
            anyhow::bail!("invalid video size {}x{}", self.width, self.height);
        }
        if self.width_stride < self.width || self.height_stride < self.height {
            anyhow::bail!(
                "stride {}x{} smaller than picture {}x{}",
                self.width_stride,
                self.height_stride,
                self.width,
                self.height
            );
        }
        if self.format.is_yuv420() && (self.width_stride % 2 != 0 || self.height_stride % 2 != 0)
        {
            anyhow::bail!(
                "{} needs even strides, got {}x{}",
                self.format,
                self.width_stride,
                self.height_stride
            );
        }
        if self.checked_size().is_none() {
            anyhow::bail!("{} does not fit in memory", self);
        }
        // frames are re-laid onto aligned strides before they reach the sink
        let aligned = Self::aligned(self.width, self.height, self.format)?;
        if aligned.checked_size().is_none() {
            anyhow::bail!("{} does not fit in memory once aligned", self);
        }
        Ok(())
    }

    pub fn planes(&self) -> Vec<Plane> {
        let ws = self.width_stride as usize;
        let hs = self.height_stride as usize;
        let width = self.width as usize;
        let height = self.height as usize;
        let chroma_rows = height.div_ceil(2);
        match self.format {
            PixelFormat::Nv12 | PixelFormat::Nv21 => vec![
                Plane {
                    offset: 0,
                    stride: ws,
                    row_bytes: width,
                    rows: height,
                },
                Plane {
                    offset: ws * hs,
                    stride: ws,
                    row_bytes: width.div_ceil(2) * 2,
                    rows: chroma_rows,
                },
            ],
            PixelFormat::Yuv420p => {
                let chroma_stride = ws / 2;
                let chroma_size = chroma_stride * (hs / 2);
                let chroma = Plane {
                    offset: ws * hs,
                    stride: chroma_stride,
                    row_bytes: width.div_ceil(2),
                    rows: chroma_rows,
                };
                vec![
                    Plane {
                        offset: 0,
                        stride: ws,
                        row_bytes: width,
                        rows: height,
                    },
                    chroma,
                    Plane {
                        offset: ws * hs + chroma_size,
                        ..chroma
                    },
                ]
            }
            PixelFormat::Rgb24 | PixelFormat::Rgba => {
                let bpp = self.format.bytes_per_pixel();
                vec![Plane {
                    offset: 0,
                    stride: ws * bpp,
                    row_bytes: width * bpp,
                    rows: height,
                }]
            }
        }
    }
}

impl Display for FrameGeometry {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "{}x{} {} (stride {}x{})",
            self.width, self.height, self.format, self.width_stride, self.height_stride
        )
    }
}

/// Copies the visible rows of every plane from one layout into another. Both
/// geometries must describe the same picture and both slices must hold at
/// least `size()` bytes of their geometry.
pub fn copy_planes(src: &[u8], src_geo: &FrameGeometry, dst: &mut [u8], dst_geo: &FrameGeometry) {
    debug_assert!(dst_geo.same_picture(src_geo.width, src_geo.height, src_geo.format));
    if src_geo.width_stride == dst_geo.width_stride && src_geo.height_stride == dst_geo.height_stride
    {
        let size = src_geo.size();
        dst[..size].copy_from_slice(&src[..size]);
        return;
    }
    for (s, d) in src_geo.planes().iter().zip(dst_geo.planes().iter()) {
        for row in 0..s.rows {
            let from = s.offset + row * s.stride;
            let to = d.offset + row * d.stride;
            dst[to..to + d.row_bytes].copy_from_slice(&src[from..from + s.row_bytes]);
        }
    }
}

/// A decoded frame as handed over by the decoder. Borrowed: the pipeline
/// copies it before `submit` returns.
#[derive(Clone, Copy, Debug)]
pub struct FrameRef<'a> {
    pub data: &'a [u8],
    pub geometry: FrameGeometry,
    pub pts: i64,
}

impl<'a> FrameRef<'a> {
    pub fn new(data: &'a [u8], width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data,
            geometry: FrameGeometry::new(width, height, format),
            pts: 0,
        }
    }

    pub fn with_strides(mut self, width_stride: u32, height_stride: u32) -> Self {
        self.geometry = self.geometry.with_strides(width_stride, height_stride);
        self
    }

    pub fn with_pts(mut self, pts: i64) -> Self {
        self.pts = pts;
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.geometry.validate()?;
        let size = self.geometry.size();
        if self.data.len() < size {
            anyhow::bail!(
                "short frame data: {} bytes, {} needs {}",
                self.data.len(),
                self.geometry,
                size
            );
        }
        Ok(())
    }
}

/// An owned, sequenced frame travelling from the reorder buffer to the sink.
#[derive(Clone, Debug)]
pub struct Frame {
    pub seq: u64,
    pub geometry: FrameGeometry,
    pub pts: i64,
    /// false when the frame bypassed analysis (fallback) or analysis failed
    pub analyzed: bool,
    pub data: Vec<u8>,
}

impl Frame {
    /// Independent copy of a decoder frame for the fallback path, laid out on
    /// the same aligned strides as worker buffers and held in memory from
    /// `allocator`.
    pub fn copy_from_ref(
        seq: u64,
        frame: &FrameRef<'_>,
        allocator: &dyn DeviceAllocator,
    ) -> anyhow::Result<Self> {
        let src = frame.geometry;
        let geometry = FrameGeometry::aligned(src.width, src.height, src.format)?;
        let size = geometry.size();
        let mut data = allocator
            .allocate(size)
            .with_context(|| format!("fallback copy of frame {} ({})", seq, geometry))?;
        if data.len() < size {
            allocator.free(data);
            anyhow::bail!("allocator returned a short buffer for {}", geometry);
        }
        data.truncate(size);
        copy_planes(frame.data, &src, &mut data, &geometry);
        Ok(Self {
            seq,
            geometry,
            pts: frame.pts,
            analyzed: false,
            data,
        })
    }

    /// Copy of a worker buffer, taken inside the completion callback before
    /// the buffer goes back to its worker.
    pub fn copy_from_buffer(
        seq: u64,
        pts: i64,
        buffer: &FrameBuffer,
        analyzed: bool,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            seq,
            geometry: *buffer.geometry(),
            pts,
            analyzed,
            data: try_copy(buffer.data())?,
        })
    }

    pub fn width(&self) -> u32 {
        self.geometry.width
    }

    pub fn height(&self) -> u32 {
        self.geometry.height
    }

    pub fn format(&self) -> PixelFormat {
        self.geometry.format
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "Frame seq: {}, {}, pts: {}, analyzed: {}, data_len: {}",
            self.seq,
            self.geometry,
            self.pts,
            self.analyzed,
            self.data.len()
        )
    }
}

fn try_copy(src: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut data = Vec::new();
    data.try_reserve_exact(src.len())
        .map_err(|e| anyhow::anyhow!("frame copy of {} bytes: {}", src.len(), e))?;
    data.extend_from_slice(src);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nv12_size_and_planes() {
        let geo = FrameGeometry::new(1920, 1080, PixelFormat::Nv12).with_strides(1920, 1088);
        assert_eq!(geo.size(), 1920 * 1088 * 3 / 2);
        let planes = geo.planes();
        assert_eq!(planes.len(), 2);
        assert_eq!(planes[1].offset, 1920 * 1088);
        assert_eq!(planes[1].rows, 540);
    }

    #[test]
    fn test_aligned_strides() {
        let geo = FrameGeometry::aligned(1918, 1080, PixelFormat::Nv12).unwrap();
        assert_eq!(geo.width_stride, 1920);
        assert_eq!(geo.height_stride, 1088);
        assert!(geo.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_geometry() {
        assert!(FrameGeometry::new(0, 10, PixelFormat::Rgb24).validate().is_err());
        assert!(
            FrameGeometry::new(16, 16, PixelFormat::Rgba)
                .with_strides(8, 16)
                .validate()
                .is_err()
        );
        assert!(FrameGeometry::new(15, 16, PixelFormat::Nv12).validate().is_err());

        let data = vec![0u8; 10];
        let frame = FrameRef::new(&data, 4, 4, PixelFormat::Nv12);
        assert!(frame.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_overflowing_geometry() {
        // strides cannot be rounded up to 16
        let wide = FrameGeometry::new(u32::MAX - 1, 2, PixelFormat::Nv12);
        assert!(align_up(wide.width, STRIDE_ALIGN).is_none());
        assert!(FrameGeometry::aligned(wide.width, 2, PixelFormat::Nv12).is_err());
        assert!(wide.validate().is_err());

        // aligned already, but the byte size overflows usize
        let huge = FrameGeometry::new(u32::MAX - 15, u32::MAX - 15, PixelFormat::Rgba);
        assert!(huge.checked_size().is_none());
        assert_eq!(huge.size(), usize::MAX);
        assert!(huge.validate().is_err());

        let data = [0u8; 4];
        let frame = FrameRef::new(&data, u32::MAX - 1, 2, PixelFormat::Nv12);
        assert!(frame.validate().is_err());
    }

    #[test]
    fn test_fallback_copy_uses_aligned_layout() {
        // 20x10 nv12 packed tightly: 200 luma bytes, 100 chroma bytes
        let src: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        let frame = FrameRef::new(&src, 20, 10, PixelFormat::Nv12);

        let copy = Frame::copy_from_ref(4, &frame, &crate::buffer::HeapAllocator).unwrap();

        assert_eq!(copy.geometry, FrameGeometry::aligned(20, 10, PixelFormat::Nv12).unwrap());
        assert_eq!((copy.geometry.width_stride, copy.geometry.height_stride), (32, 16));
        assert_eq!(copy.size(), 32 * 16 * 3 / 2);
        assert_eq!(&copy.data[32..52], &src[20..40]);
        let uv = 32 * 16;
        assert_eq!(&copy.data[uv..uv + 20], &src[200..220]);
        assert!(!copy.analyzed);
    }

    #[test]
    fn test_copy_planes_across_strides() {
        // 4x2 nv12 packed tightly, copied into a 16x16 aligned layout
        let src_geo = FrameGeometry::new(4, 2, PixelFormat::Nv12);
        let src: Vec<u8> = (0..src_geo.size() as u8).collect();
        let dst_geo = FrameGeometry::aligned(4, 2, PixelFormat::Nv12).unwrap();
        let mut dst = vec![0xAAu8; dst_geo.size()];

        copy_planes(&src, &src_geo, &mut dst, &dst_geo);

        assert_eq!(&dst[0..4], &src[0..4]);
        assert_eq!(&dst[16..20], &src[4..8]);
        assert_eq!(dst[4], 0xAA);
        let uv = 16 * 16;
        assert_eq!(&dst[uv..uv + 4], &src[8..12]);
    }

    #[test]
    fn test_pixel_format_from_str() {
        assert_eq!("NV12".parse::<PixelFormat>().unwrap(), PixelFormat::Nv12);
        assert_eq!("i420".parse::<PixelFormat>().unwrap(), PixelFormat::Yuv420p);
        assert!("p010".parse::<PixelFormat>().is_err());
    }
}
