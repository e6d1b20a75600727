// Backend module - capability seams around the native API
//
// The ring and the presentation adapter never call ash directly. They talk to
// two capabilities resolved once at device construction:
// - DeviceBackend: command buffers, fences, semaphores, submit/acquire/present
// - ResourceAllocator: memory-backed images and host-visible buffers
//
// `device`, `buffer` and `swapchain` implement them on top of ash and
// gpu-allocator. Tests implement them with `fake::FakeDevice`.

pub mod buffer;
pub mod command;
pub mod device;
pub mod queue;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
pub(crate) mod fake;

pub use buffer::VulkanAllocator;
pub use command::{CommandBuffer, CommandPool, Recording};
pub use device::{DeviceDesc, VulkanDevice};
pub use queue::QueueRef;
pub use swapchain::{Swapchain, SwapchainTargets};
pub use sync::{Fence, Semaphore, SyncPoints, WaitSemaphore};

use crate::error::{AcquisitionFailure, FrameError, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// Timeout value meaning "wait until it happens".
pub const WAIT_FOREVER: u64 = u64::MAX;

/// Outcome of a bounded fence wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceWait {
    Signaled,
    TimedOut,
}

/// Kinds of OS handle a semaphore or memory object can be exported as.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExternalHandleType {
    OpaqueFd,
    SyncFd,
}

impl ExternalHandleType {
    pub fn semaphore_flags(self) -> vk::ExternalSemaphoreHandleTypeFlags {
        match self {
            Self::OpaqueFd => vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD,
            Self::SyncFd => vk::ExternalSemaphoreHandleTypeFlags::SYNC_FD,
        }
    }
}

/// Stage and access scope implied by an image layout, used to build barriers.
pub fn layout_scope(layout: vk::ImageLayout) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    match layout {
        vk::ImageLayout::UNDEFINED => {
            (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty())
        }
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL
        | vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
            (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_READ)
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE)
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => {
            (vk::PipelineStageFlags::FRAGMENT_SHADER, vk::AccessFlags::SHADER_READ)
        }
        vk::ImageLayout::PRESENT_SRC_KHR => {
            (vk::PipelineStageFlags::BOTTOM_OF_PIPE, vk::AccessFlags::empty())
        }
        _ => (
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
        ),
    }
}

/// Single-image layout transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

impl ImageBarrier {
    /// Transition with stage/access masks derived from the two layouts.
    pub fn transition(
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Self {
        let (src_stage, src_access) = layout_scope(old_layout);
        let (dst_stage, dst_access) = layout_scope(new_layout);
        Self {
            image,
            aspect,
            old_layout,
            new_layout,
            src_stage,
            dst_stage,
            src_access,
            dst_access,
        }
    }

    pub fn color(
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Self {
        Self::transition(image, vk::ImageAspectFlags::COLOR, old_layout, new_layout)
    }
}

/// Global memory dependency (e.g. transfer writes made visible to the host).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryBarrier {
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

impl MemoryBarrier {
    pub fn transfer_to_host() -> Self {
        Self {
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::HOST,
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::HOST_READ,
        }
    }
}

/// Whole-image copy between a color image and a linear buffer.
///
/// `row_length` is in texels; 0 means tightly packed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferImageCopy {
    pub buffer: vk::Buffer,
    pub buffer_offset: vk::DeviceSize,
    pub row_length: u32,
    pub image: vk::Image,
    pub image_layout: vk::ImageLayout,
    pub extent: vk::Extent2D,
}

/// Dynamic rendering scope over one color view and an optional depth view.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderingInfo {
    pub color_view: vk::ImageView,
    pub depth_view: Option<vk::ImageView>,
    pub area: vk::Rect2D,
    /// `None` loads existing contents instead of clearing.
    pub clear_color: Option<[f32; 4]>,
    pub clear_depth: Option<f32>,
}

/// One batch for `DeviceBackend::queue_submit`.
#[derive(Clone, Copy, Debug)]
pub struct Submission<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub waits: &'a [WaitSemaphore],
    pub signals: &'a [vk::Semaphore],
}

/// Result of asking the presentation engine for an image.
///
/// `Suboptimal` carries an index; the other failures do not.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcquireResult {
    pub image_index: Option<u32>,
    pub failure: Option<AcquisitionFailure>,
}

impl AcquireResult {
    pub fn acquired(image_index: u32) -> Self {
        Self {
            image_index: Some(image_index),
            failure: None,
        }
    }

    pub fn failed(failure: AcquisitionFailure) -> Self {
        Self {
            image_index: None,
            failure: Some(failure),
        }
    }
}

/// Device-level capability consumed by the frame pipelining core.
///
/// Handles are raw ash handles; ownership is tracked by the RAII wrappers in
/// `command` and `sync`, never by the backend itself. `cmd_*` methods only
/// record and cannot fail, like their native counterparts.
pub trait DeviceBackend: Send + Sync {
    fn create_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer>;
    fn free_command_buffer(&self, pool: vk::CommandPool, buffer: vk::CommandBuffer);
    fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
    ) -> Result<()>;
    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> Result<()>;
    fn reset_command_buffer(&self, buffer: vk::CommandBuffer) -> Result<()>;

    fn cmd_image_barrier(&self, buffer: vk::CommandBuffer, barrier: &ImageBarrier);
    fn cmd_memory_barrier(&self, buffer: vk::CommandBuffer, barrier: &MemoryBarrier);
    fn cmd_copy_image_to_buffer(&self, buffer: vk::CommandBuffer, copy: &BufferImageCopy);
    fn cmd_copy_buffer_to_image(&self, buffer: vk::CommandBuffer, copy: &BufferImageCopy);
    fn cmd_clear_color_image(
        &self,
        buffer: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: [f32; 4],
    );
    fn cmd_begin_rendering(&self, buffer: vk::CommandBuffer, info: &RenderingInfo);
    fn cmd_end_rendering(&self, buffer: vk::CommandBuffer);

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;
    fn wait_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<FenceWait>;
    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool>;
    fn destroy_fence(&self, fence: vk::Fence);

    fn create_semaphore(&self, export: &[ExternalHandleType]) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// Export a semaphore created with `handle_type` in its export list.
    /// The returned fd is owned by the caller.
    fn export_semaphore_fd(
        &self,
        semaphore: vk::Semaphore,
        handle_type: ExternalHandleType,
    ) -> Result<i32> {
        let _ = (semaphore, handle_type);
        Err(FrameError::Unsupported("external semaphore export"))
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submission: &Submission<'_>,
        fence: vk::Fence,
    ) -> Result<()>;
    fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()>;

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<AcquireResult>;

    /// `Ok(Some(_))` only for `Suboptimal` or `OutOfDate`.
    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        waits: &[vk::Semaphore],
    ) -> Result<Option<AcquisitionFailure>>;
}

/// Request for a memory-backed 2D image with a single-mip view.
#[derive(Clone, Copy, Debug)]
pub struct ImageDesc {
    pub name: &'static str,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
    pub location: MemoryLocation,
}

/// An allocated image and its view. Dropping it releases both.
pub trait DeviceImage: Send + Sync {
    fn image(&self) -> vk::Image;
    fn view(&self) -> vk::ImageView;
    fn extent(&self) -> vk::Extent2D;
    fn format(&self) -> vk::Format;
}

/// A persistently mapped host-visible buffer. Dropping it releases it.
pub trait HostBuffer: Send + Sync {
    fn buffer(&self) -> vk::Buffer;
    fn size(&self) -> vk::DeviceSize;
    fn is_coherent(&self) -> bool;
    /// Make device writes visible to `bytes()`. No-op on coherent memory.
    fn invalidate(&mut self) -> Result<()>;
    /// Make host writes through `bytes_mut()` visible to the device.
    fn flush(&mut self) -> Result<()>;
    fn bytes(&self) -> &[u8];
    fn bytes_mut(&mut self) -> &mut [u8];
}

/// Memory capability consumed by the ring.
pub trait ResourceAllocator: Send + Sync {
    fn create_image(&self, desc: &ImageDesc) -> Result<Box<dyn DeviceImage>>;
    fn create_host_buffer(
        &self,
        name: &'static str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Box<dyn HostBuffer>>;
}

/// Capabilities resolved once per device and handed to every consumer.
#[derive(Clone)]
pub struct DeviceContext {
    pub backend: Arc<dyn DeviceBackend>,
    pub allocator: Arc<dyn ResourceAllocator>,
    pub graphics_queue: Arc<QueueRef>,
    pub present_queue: Arc<QueueRef>,
}
