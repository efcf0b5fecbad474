use std::sync::Arc;

use anyhow::Context;

use crate::frame::{FrameGeometry, FrameRef, PixelFormat, copy_planes};

/// Source of frame memory. The default is plain heap memory; hardware
/// backends hand out DMA-capable blocks through the same interface.
pub trait DeviceAllocator: Send + Sync {
    fn allocate(&self, size: usize) -> anyhow::Result<Vec<u8>>;

    fn free(&self, _memory: Vec<u8>) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HeapAllocator;

impl DeviceAllocator for HeapAllocator {
    fn allocate(&self, size: usize) -> anyhow::Result<Vec<u8>> {
        let mut memory = Vec::new();
        memory
            .try_reserve_exact(size)
            .map_err(|e| anyhow::anyhow!("allocate {} bytes: {}", size, e))?;
        memory.resize(size, 0);
        Ok(memory)
    }
}

#[derive(Debug)]
pub struct FrameBuffer {
    memory: Vec<u8>,
    geometry: FrameGeometry,
}

impl FrameBuffer {
    pub fn geometry(&self) -> &FrameGeometry {
        &self.geometry
    }

    pub fn data(&self) -> &[u8] {
        &self.memory[..self.geometry.size()]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let size = self.geometry.size();
        &mut self.memory[..size]
    }

    /// Copies a decoder frame into this buffer, re-laying rows onto the
    /// buffer's own strides.
    pub fn copy_from(&mut self, frame: &FrameRef<'_>) {
        let geometry = self.geometry;
        copy_planes(frame.data, &frame.geometry, self.data_mut(), &geometry);
    }
}

/// The single reusable buffer owned by one worker. It is reallocated only
/// when the incoming picture size or format changes.
pub struct BufferPool {
    label: String,
    allocator: Arc<dyn DeviceAllocator>,
    buffer: Option<FrameBuffer>,
    allocations: u64,
}

impl BufferPool {
    pub fn new(label: impl Into<String>, allocator: Arc<dyn DeviceAllocator>) -> Self {
        Self {
            label: label.into(),
            allocator,
            buffer: None,
            allocations: 0,
        }
    }

    pub fn ensure_capacity(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> anyhow::Result<&mut FrameBuffer> {
        let reusable = self
            .buffer
            .as_ref()
            .map(|b| b.geometry.same_picture(width, height, format))
            .unwrap_or(false);

        if !reusable {
            self.release();
            let geometry = FrameGeometry::aligned(width, height, format)
                .with_context(|| format!("{}: buffer geometry", self.label))?;
            let memory = self
                .allocator
                .allocate(geometry.size())
                .with_context(|| format!("{}: buffer for {}", self.label, geometry))?;
            if memory.len() < geometry.size() {
                self.allocator.free(memory);
                anyhow::bail!("{}: allocator returned a short buffer for {}", self.label, geometry);
            }
            self.allocations += 1;
            log::debug!(
                "{}: allocated {} bytes for {}",
                self.label,
                geometry.size(),
                geometry
            );
            self.buffer = Some(FrameBuffer { memory, geometry });
        }

        self.buffer
            .as_mut()
            .context("buffer pool holds no buffer after allocation")
    }

    pub fn buffer(&self) -> Option<&FrameBuffer> {
        self.buffer.as_ref()
    }

    pub fn buffer_mut(&mut self) -> Option<&mut FrameBuffer> {
        self.buffer.as_mut()
    }

    pub fn release(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.allocator.free(buffer.memory);
        }
    }

    /// Number of allocations performed over the pool's lifetime.
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.release();
    }
}
