use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};

use anyhow::Context;
use frame_bus::{FrameGeometry, FrameRef};

use crate::media::types::InputConfig;

/// One decoded picture owned by the source until it is submitted.
pub struct SourceFrame {
    pub data: Vec<u8>,
    pub geometry: FrameGeometry,
    pub pts: i64,
}

impl SourceFrame {
    pub fn as_frame_ref(&self) -> FrameRef<'_> {
        FrameRef {
            data: &self.data,
            geometry: self.geometry,
            pts: self.pts,
        }
    }
}

/// Stands in for the decoder: yields frames until the input ends.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> anyhow::Result<Option<SourceFrame>>;
}

pub fn open_source(input: &InputConfig) -> anyhow::Result<Box<dyn FrameSource>> {
    match input {
        InputConfig::File {
            path,
            width,
            height,
            format,
        } => {
            let geometry = FrameGeometry::new(*width, *height, *format);
            Ok(Box::new(RawFileSource::open(path, geometry)?))
        }
        InputConfig::TestPattern {
            width,
            height,
            format,
            frames,
        } => {
            let geometry = FrameGeometry::new(*width, *height, *format);
            Ok(Box::new(TestPatternSource::new(geometry, *frames)?))
        }
    }
}

pub struct RawFileSource {
    path: String,
    reader: BufReader<File>,
    geometry: FrameGeometry,
    index: u64,
}

impl RawFileSource {
    pub fn open(path: &str, geometry: FrameGeometry) -> anyhow::Result<Self> {
        geometry.validate()?;
        let file = File::open(path).with_context(|| format!("open input {}", path))?;
        Ok(Self {
            path: path.to_string(),
            reader: BufReader::new(file),
            geometry,
            index: 0,
        })
    }
}

impl FrameSource for RawFileSource {
    fn next_frame(&mut self) -> anyhow::Result<Option<SourceFrame>> {
        let size = self.geometry.size();
        let mut data = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            match self.reader.read(&mut data[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).with_context(|| format!("read {}", self.path)),
            }
        }
        if filled < size {
            if filled > 0 {
                log::warn!(
                    "Source: {} ends with a partial frame ({} of {} bytes)",
                    self.path,
                    filled,
                    size
                );
            }
            return Ok(None);
        }

        let pts = self.index as i64;
        self.index += 1;
        Ok(Some(SourceFrame {
            data,
            geometry: self.geometry,
            pts,
        }))
    }
}

/// Diagonal gradient that shifts by a few pixels every frame.
pub struct TestPatternSource {
    geometry: FrameGeometry,
    frames: u64,
    index: u64,
}

impl TestPatternSource {
    pub fn new(geometry: FrameGeometry, frames: u64) -> anyhow::Result<Self> {
        geometry.validate()?;
        Ok(Self {
            geometry,
            frames,
            index: 0,
        })
    }

    fn render(&self) -> Vec<u8> {
        let mut data = vec![128u8; self.geometry.size()];
        let planes = self.geometry.planes();
        let luma = planes[0];
        let bpp = self.geometry.format.bytes_per_pixel();
        let shift = (self.index * 4) as usize;
        for row in 0..luma.rows {
            let line = luma.offset + row * luma.stride;
            for col in 0..luma.row_bytes {
                let x = col / bpp;
                data[line + col] = ((x + row + shift) & 0xff) as u8;
            }
        }
        data
    }
}

impl FrameSource for TestPatternSource {
    fn next_frame(&mut self) -> anyhow::Result<Option<SourceFrame>> {
        if self.frames > 0 && self.index >= self.frames {
            return Ok(None);
        }
        let frame = SourceFrame {
            data: self.render(),
            geometry: self.geometry,
            pts: self.index as i64,
        };
        self.index += 1;
        Ok(Some(frame))
    }
}
