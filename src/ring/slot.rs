// Render slot - one frame's worth of recyclable GPU state
//
// Owns a command pool + buffer, a completion fence, an optional depth image
// and an optional readback buffer. The color target is either owned or
// borrowed from a swapchain.
//
// State machine:
//   Idle --begin--> Recording --finish--> InFlight --fence wait--> Idle
//
// `begin` only waits on the fence when the slot is InFlight. A failed
// submission leaves the slot Idle, so nothing ever waits on a fence that no
// pending submission will signal.

use super::pixels::{align_up, PixelView, BYTES_PER_TEXEL};
use crate::backend::{
    BufferImageCopy, CommandBuffer, CommandPool, DeviceContext, DeviceImage, Fence, HostBuffer,
    ImageBarrier, ImageDesc, MemoryBarrier, QueueRef, Recording, SyncPoints, WAIT_FOREVER,
};
use crate::error::{FrameError, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// Fixed work recorded around the caller's commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotHooks {
    /// Record nothing; the caller manages layouts.
    None,
    /// Transition the target into COLOR_ATTACHMENT_OPTIMAL at begin (depth
    /// into DEPTH_ATTACHMENT_OPTIMAL) and into `final_layout` at finish.
    TransitionOnly { final_layout: vk::ImageLayout },
    /// Like `TransitionOnly`, but finish moves the target to
    /// TRANSFER_SRC_OPTIMAL and copies it into the readback buffer.
    TransitionAndReadback,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Recording,
    InFlight,
}

/// Color target of a slot.
pub enum TargetImage {
    Owned(Box<dyn DeviceImage>),
    /// Owned elsewhere (swapchain images); must outlive the slot.
    Borrowed { image: vk::Image, view: vk::ImageView },
}

impl TargetImage {
    pub fn image(&self) -> vk::Image {
        match self {
            Self::Owned(image) => image.image(),
            Self::Borrowed { image, .. } => *image,
        }
    }

    pub fn view(&self) -> vk::ImageView {
        match self {
            Self::Owned(image) => image.view(),
            Self::Borrowed { view, .. } => *view,
        }
    }
}

/// Per-slot construction parameters.
#[derive(Clone, Debug)]
pub struct SlotDesc {
    pub extent: vk::Extent2D,
    pub depth_format: Option<vk::Format>,
    pub hooks: SlotHooks,
    /// Readback row pitch alignment in bytes; a multiple of 4.
    pub row_alignment: u32,
    /// Merged into every submission of this slot.
    pub extra_sync: SyncPoints,
}

/// What a producer records into during one phase.
pub struct PhaseContext<'a> {
    pub index: usize,
    pub rect: vk::Rect2D,
    pub extent: vk::Extent2D,
    pub target_image: vk::Image,
    pub target_view: vk::ImageView,
    pub depth_view: Option<vk::ImageView>,
    pub commands: Recording<'a>,
}

struct Readback {
    buffer: Box<dyn HostBuffer>,
    row_pitch: usize,
}

pub struct RenderSlot {
    index: usize,
    extent: vk::Extent2D,
    hooks: SlotHooks,
    state: SlotState,
    extra_sync: SyncPoints,
    queue: Arc<QueueRef>,
    readback: Option<Readback>,
    depth: Option<Box<dyn DeviceImage>>,
    target: TargetImage,
    // `commands` must drop before `_pool`
    commands: CommandBuffer,
    _pool: CommandPool,
    fence: Fence,
}

impl RenderSlot {
    pub fn new(
        ctx: &DeviceContext,
        index: usize,
        target: TargetImage,
        desc: &SlotDesc,
    ) -> Result<Self> {
        if desc.row_alignment == 0 || desc.row_alignment as usize % BYTES_PER_TEXEL != 0 {
            return Err(FrameError::InvalidConfig(format!(
                "row alignment {} is not a non-zero multiple of {}",
                desc.row_alignment, BYTES_PER_TEXEL
            )));
        }

        let fence = Fence::new(ctx.backend.clone(), true)?;
        let pool = CommandPool::new(ctx.backend.clone(), ctx.graphics_queue.family_index())?;
        let commands = pool.make_buffer()?;

        let depth = match desc.depth_format {
            Some(format) => Some(ctx.allocator.create_image(&ImageDesc {
                name: "slot depth",
                extent: desc.extent,
                format,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                aspect: depth_aspect(format),
                location: MemoryLocation::GpuOnly,
            })?),
            None => None,
        };

        let readback = if desc.hooks == SlotHooks::TransitionAndReadback {
            let row_pitch = align_up(
                desc.extent.width as usize * BYTES_PER_TEXEL,
                desc.row_alignment as usize,
            );
            let size = (row_pitch * desc.extent.height as usize) as vk::DeviceSize;
            let buffer = ctx.allocator.create_host_buffer(
                "slot readback",
                size,
                vk::BufferUsageFlags::TRANSFER_DST,
                MemoryLocation::GpuToCpu,
            )?;
            Some(Readback { buffer, row_pitch })
        } else {
            None
        };

        log::debug!(
            "Created render slot {} ({}x{}, {:?}, readback: {})",
            index,
            desc.extent.width,
            desc.extent.height,
            desc.hooks,
            readback.is_some()
        );

        Ok(Self {
            index,
            extent: desc.extent,
            hooks: desc.hooks,
            state: SlotState::Idle,
            extra_sync: desc.extra_sync.clone(),
            queue: ctx.graphics_queue.clone(),
            readback,
            depth,
            target,
            commands,
            _pool: pool,
            fence,
        })
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn state(&self) -> SlotState {
        self.state
    }

    #[inline]
    pub fn hooks(&self) -> SlotHooks {
        self.hooks
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn target_view(&self) -> vk::ImageView {
        self.target.view()
    }

    pub fn target_image(&self) -> vk::Image {
        self.target.image()
    }

    pub fn depth_view(&self) -> Option<vk::ImageView> {
        self.depth.as_ref().map(|depth| depth.view())
    }

    pub fn has_readback(&self) -> bool {
        self.readback.is_some()
    }

    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    pub fn full_rect(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: self.extent,
        }
    }

    /// Start recording. Waits (up to `timeout_ns`) for the previous
    /// submission of this slot, resets the fence, begins the command buffer
    /// and records the begin hook.
    pub fn begin(
        &mut self,
        rect: Option<vk::Rect2D>,
        usage: vk::CommandBufferUsageFlags,
        timeout_ns: u64,
    ) -> Result<PhaseContext<'_>> {
        match self.state {
            SlotState::Recording => return Err(FrameError::DoubleBegin { slot: self.index }),
            SlotState::InFlight => {
                self.fence.wait_signaled(timeout_ns)?;
                self.state = SlotState::Idle;
            }
            SlotState::Idle => {}
        }

        self.fence.reset()?;
        self.commands.begin(usage)?;
        self.state = SlotState::Recording;
        self.record_begin_hook(self.commands.recording());

        log::trace!("Slot {} recording", self.index);
        Ok(self.context(rect.unwrap_or_else(|| self.full_rect())))
    }

    /// Recording context of a slot that is currently recording.
    pub fn current(&self, rect: Option<vk::Rect2D>) -> Option<PhaseContext<'_>> {
        (self.state == SlotState::Recording)
            .then(|| self.context(rect.unwrap_or_else(|| self.full_rect())))
    }

    // Caller guarantees the slot is recording
    pub(crate) fn context(&self, rect: vk::Rect2D) -> PhaseContext<'_> {
        PhaseContext {
            index: self.index,
            rect,
            extent: self.extent,
            target_image: self.target.image(),
            target_view: self.target.view(),
            depth_view: self.depth_view(),
            commands: self.commands.recording(),
        }
    }

    /// Record the end hook, end recording and submit with `sync` plus the
    /// slot's extra sync points, signaling the slot fence.
    pub fn finish(&mut self, sync: &SyncPoints) -> Result<()> {
        if self.state != SlotState::Recording {
            return Err(FrameError::FinishWithoutBegin { slot: self.index });
        }

        self.record_end_hook(self.commands.recording());

        // Any failure from here on leaves nothing pending on the fence
        self.state = SlotState::Idle;
        self.commands.end()?;

        let merged = sync.merged(&self.extra_sync);
        self.queue
            .submit_with(self.commands.handle(), &merged, self.fence.handle())?;
        self.state = SlotState::InFlight;

        log::trace!("Slot {} submitted ({})", self.index, merged);
        Ok(())
    }

    /// Block until the last submission of this slot completed.
    pub fn wait_idle(&mut self, timeout_ns: u64) -> Result<()> {
        if self.state == SlotState::InFlight {
            self.fence.wait_signaled(timeout_ns)?;
            self.state = SlotState::Idle;
        }
        Ok(())
    }

    /// Wait for the slot's work, make the readback visible to the host and
    /// return it as a pixel view. Texels keep the target's color format.
    pub fn read_result(&mut self, timeout_ns: u64) -> Result<PixelView<'_>> {
        if self.readback.is_none() {
            return Err(FrameError::ReadbackNotConfigured { slot: self.index });
        }
        self.wait_idle(timeout_ns)?;

        let extent = self.extent;
        let readback = self
            .readback
            .as_mut()
            .ok_or(FrameError::ReadbackNotConfigured { slot: self.index })?;
        readback.buffer.invalidate()?;
        Ok(PixelView::new(
            readback.buffer.bytes(),
            extent.width,
            extent.height,
            readback.row_pitch,
        ))
    }

    fn record_begin_hook(&self, commands: Recording<'_>) {
        if self.hooks == SlotHooks::None {
            return;
        }
        let mut color = ImageBarrier::color(
            self.target.image(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        // Swapchain images become writable at the stage the acquire
        // semaphore is waited on; the transition must come after that wait.
        color.src_stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        commands.image_barrier(&color);
        if let Some(depth) = &self.depth {
            commands.image_barrier(&ImageBarrier::transition(
                depth.image(),
                depth_aspect(depth.format()),
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            ));
        }
    }

    fn record_end_hook(&self, commands: Recording<'_>) {
        match self.hooks {
            SlotHooks::None => {}
            SlotHooks::TransitionOnly { final_layout } => {
                commands.transition(
                    self.target.image(),
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    final_layout,
                );
            }
            SlotHooks::TransitionAndReadback => {
                commands.transition(
                    self.target.image(),
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                );
                if let Some(readback) = &self.readback {
                    commands.copy_image_to_buffer(&BufferImageCopy {
                        buffer: readback.buffer.buffer(),
                        buffer_offset: 0,
                        row_length: (readback.row_pitch / BYTES_PER_TEXEL) as u32,
                        image: self.target.image(),
                        image_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        extent: self.extent,
                    });
                    commands.memory_barrier(&MemoryBarrier::transfer_to_host());
                }
            }
        }
    }
}

impl Drop for RenderSlot {
    fn drop(&mut self) {
        if self.state == SlotState::InFlight {
            if let Err(e) = self.fence.wait_signaled(WAIT_FOREVER) {
                log::error!(
                    "Render slot {} dropped while its work may still run: {}",
                    self.index,
                    e
                );
            }
        }
    }
}

impl std::fmt::Debug for RenderSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderSlot")
            .field("index", &self.index)
            .field("state", &self.state)
            .field("hooks", &self.hooks)
            .finish()
    }
}

pub(crate) fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::DEPTH,
    }
}
