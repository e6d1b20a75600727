// Command pools, command buffers and the recording encoder
//
// A `CommandBuffer` borrows nothing: it keeps the backend alive through an
// Arc and frees itself on drop. Its pool must outlive it, which owners
// guarantee by declaring the buffer field before the pool field.

use super::{BufferImageCopy, DeviceBackend, ImageBarrier, MemoryBarrier, RenderingInfo};
use crate::error::Result;
use ash::vk;
use std::sync::Arc;

pub struct CommandPool {
    backend: Arc<dyn DeviceBackend>,
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    pub fn new(backend: Arc<dyn DeviceBackend>, queue_family: u32) -> Result<Self> {
        let pool = backend.create_command_pool(queue_family)?;
        Ok(Self {
            backend,
            pool,
            queue_family,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    #[inline]
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate one primary command buffer from this pool.
    pub fn make_buffer(&self) -> Result<CommandBuffer> {
        let buffer = self.backend.allocate_command_buffer(self.pool)?;
        Ok(CommandBuffer {
            backend: self.backend.clone(),
            pool: self.pool,
            buffer,
        })
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        self.backend.destroy_command_pool(self.pool);
    }
}

pub struct CommandBuffer {
    backend: Arc<dyn DeviceBackend>,
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
}

impl CommandBuffer {
    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    /// Reset and start recording. Ends with `end`.
    pub fn begin(&mut self, usage: vk::CommandBufferUsageFlags) -> Result<Recording<'_>> {
        self.backend.reset_command_buffer(self.buffer)?;
        self.backend.begin_command_buffer(self.buffer, usage)?;
        Ok(self.recording())
    }

    /// Encoder over a buffer that is already recording.
    pub fn recording(&self) -> Recording<'_> {
        Recording {
            backend: self.backend.as_ref(),
            buffer: self.buffer,
        }
    }

    pub fn end(&mut self) -> Result<()> {
        self.backend.end_command_buffer(self.buffer)
    }

    pub fn reset(&mut self) -> Result<()> {
        self.backend.reset_command_buffer(self.buffer)
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        self.backend.free_command_buffer(self.pool, self.buffer);
    }
}

/// Command encoder for a buffer in the recording state.
#[derive(Clone, Copy)]
pub struct Recording<'a> {
    backend: &'a dyn DeviceBackend,
    buffer: vk::CommandBuffer,
}

impl<'a> Recording<'a> {
    /// Raw handle for commands this encoder does not wrap (pipelines,
    /// descriptor sets, draws).
    #[inline]
    pub fn raw(&self) -> vk::CommandBuffer {
        self.buffer
    }

    pub fn image_barrier(&self, barrier: &ImageBarrier) {
        self.backend.cmd_image_barrier(self.buffer, barrier);
    }

    pub fn transition(
        &self,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        self.image_barrier(&ImageBarrier::color(image, old_layout, new_layout));
    }

    pub fn memory_barrier(&self, barrier: &MemoryBarrier) {
        self.backend.cmd_memory_barrier(self.buffer, barrier);
    }

    pub fn copy_image_to_buffer(&self, copy: &BufferImageCopy) {
        self.backend.cmd_copy_image_to_buffer(self.buffer, copy);
    }

    pub fn copy_buffer_to_image(&self, copy: &BufferImageCopy) {
        self.backend.cmd_copy_buffer_to_image(self.buffer, copy);
    }

    /// `layout` must be GENERAL or TRANSFER_DST_OPTIMAL.
    pub fn clear_color_image(&self, image: vk::Image, layout: vk::ImageLayout, color: [f32; 4]) {
        self.backend.cmd_clear_color_image(self.buffer, image, layout, color);
    }

    pub fn begin_rendering(&self, info: &RenderingInfo) {
        self.backend.cmd_begin_rendering(self.buffer, info);
    }

    pub fn end_rendering(&self) {
        self.backend.cmd_end_rendering(self.buffer);
    }
}
