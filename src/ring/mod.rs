// Render target ring - N-buffered producer/consumer over render slots
//
// The producer cycles begin_phase/end_phase over the slots in order. The
// consumer takes finished frames back out in the same order with
// consume_read_slot/read. Two counters carry all the state:
// - write_cursor: slot the next begin_phase uses, advanced by end_phase
// - filled: produced but not yet consumed frames, 0..=depth
//
// The oldest unconsumed frame lives at (write_cursor + depth - filled) % depth.
//
// The ring is single producer/single consumer: everything takes &mut self
// and concurrent use needs an outer lock.

pub mod pixels;
pub mod slot;

pub use pixels::PixelView;
pub use slot::{PhaseContext, RenderSlot, SlotDesc, SlotHooks, SlotState, TargetImage};

use crate::backend::{DeviceContext, ImageDesc, SyncPoints, WAIT_FOREVER};
use crate::error::{FrameError, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;

/// Shape of an offscreen ring.
#[derive(Clone, Debug)]
pub struct RingDesc {
    pub depth: usize,
    pub extent: vk::Extent2D,
    pub color_format: vk::Format,
    pub depth_format: Option<vk::Format>,
    /// Copy every frame into a host-visible buffer at end_phase.
    pub readback: bool,
    /// Readback row pitch alignment in bytes.
    pub row_alignment: u32,
    /// Layout the color target is left in when readback is off.
    pub final_layout: vk::ImageLayout,
    /// Bound on every fence wait; `WAIT_FOREVER` for none.
    pub fence_timeout_ns: u64,
    /// Merged into every submission.
    pub extra_sync: SyncPoints,
}

impl Default for RingDesc {
    fn default() -> Self {
        Self {
            depth: 2,
            extent: vk::Extent2D {
                width: 640,
                height: 480,
            },
            color_format: vk::Format::B8G8R8A8_UNORM,
            depth_format: None,
            readback: false,
            row_alignment: 4,
            final_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            fence_timeout_ns: WAIT_FOREVER,
            extra_sync: SyncPoints::default(),
        }
    }
}

/// Formats whose texels are 4 bytes and can be read back as pixel views.
pub fn is_readback_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::B8G8R8A8_UNORM
            | vk::Format::B8G8R8A8_SRGB
            | vk::Format::R8G8B8A8_UNORM
            | vk::Format::R8G8B8A8_SRGB
    )
}

pub struct RenderTargetRing {
    slots: Vec<RenderSlot>,
    write_cursor: usize,
    filled: usize,
    extent: vk::Extent2D,
    color_format: vk::Format,
    fence_timeout_ns: u64,
}

impl RenderTargetRing {
    /// Ring of `desc.depth` slots, each owning its color target.
    pub fn offscreen(ctx: &DeviceContext, desc: &RingDesc) -> Result<Self> {
        if desc.depth == 0 {
            return Err(FrameError::InvalidDepth);
        }
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(FrameError::InvalidConfig(format!(
                "render target extent {}x{} is empty",
                desc.extent.width, desc.extent.height
            )));
        }
        if desc.readback && !is_readback_format(desc.color_format) {
            return Err(FrameError::InvalidConfig(format!(
                "{:?} cannot be read back as 4-byte pixels",
                desc.color_format
            )));
        }

        log::info!(
            "Creating offscreen ring: depth {}, {}x{} {:?}, readback {}",
            desc.depth,
            desc.extent.width,
            desc.extent.height,
            desc.color_format,
            desc.readback
        );

        let slot_desc = SlotDesc {
            extent: desc.extent,
            depth_format: desc.depth_format,
            hooks: if desc.readback {
                SlotHooks::TransitionAndReadback
            } else {
                SlotHooks::TransitionOnly {
                    final_layout: desc.final_layout,
                }
            },
            row_alignment: desc.row_alignment,
            extra_sync: desc.extra_sync.clone(),
        };

        let mut slots = Vec::with_capacity(desc.depth);
        for index in 0..desc.depth {
            let color = ctx.allocator.create_image(&ImageDesc {
                name: "ring color",
                extent: desc.extent,
                format: desc.color_format,
                usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::SAMPLED,
                aspect: vk::ImageAspectFlags::COLOR,
                location: MemoryLocation::GpuOnly,
            })?;
            slots.push(RenderSlot::new(ctx, index, TargetImage::Owned(color), &slot_desc)?);
        }

        let mut ring = Self::from_slots(slots, desc.color_format)?;
        ring.fence_timeout_ns = desc.fence_timeout_ns;
        Ok(ring)
    }

    /// Ring over prebuilt slots. Slot `i` must have index `i`.
    pub fn from_slots(slots: Vec<RenderSlot>, color_format: vk::Format) -> Result<Self> {
        let first = slots.first().ok_or(FrameError::InvalidDepth)?;
        let extent = first.extent();
        debug_assert!(slots.iter().enumerate().all(|(i, slot)| slot.index() == i));
        Ok(Self {
            slots,
            write_cursor: 0,
            filled: 0,
            extent,
            color_format,
            fence_timeout_ns: WAIT_FOREVER,
        })
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn write_cursor(&self) -> usize {
        self.write_cursor
    }

    /// Produced frames not yet consumed.
    #[inline]
    pub fn filled(&self) -> usize {
        self.filled
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn color_format(&self) -> vk::Format {
        self.color_format
    }

    pub fn fence_timeout(&self) -> u64 {
        self.fence_timeout_ns
    }

    pub fn set_fence_timeout(&mut self, timeout_ns: u64) {
        self.fence_timeout_ns = timeout_ns;
    }

    pub fn target_views(&self) -> Vec<vk::ImageView> {
        self.slots.iter().map(|slot| slot.target_view()).collect()
    }

    pub fn slot(&self, index: usize) -> Result<&RenderSlot> {
        let depth = self.depth();
        self.slots.get(index).ok_or(FrameError::SlotOutOfRange { index, depth })
    }

    pub(crate) fn slots(&self) -> &[RenderSlot] {
        &self.slots
    }

    pub(crate) fn slot_mut(&mut self, index: usize) -> Result<&mut RenderSlot> {
        let depth = self.depth();
        self.slots
            .get_mut(index)
            .ok_or(FrameError::SlotOutOfRange { index, depth })
    }

    /// Begin recording into the slot at the write cursor. Blocks while that
    /// slot's previous frame is still in flight.
    pub fn begin_phase(
        &mut self,
        rect: Option<vk::Rect2D>,
        usage: vk::CommandBufferUsageFlags,
    ) -> Result<PhaseContext<'_>> {
        let timeout = self.fence_timeout_ns;
        log::debug!("Begin phase on slot {}", self.write_cursor);
        self.slots[self.write_cursor].begin(rect, usage, timeout)
    }

    /// Submit the current slot and advance the write cursor.
    pub fn end_phase(&mut self, sync: &SyncPoints) -> Result<()> {
        self.slots[self.write_cursor].finish(sync)?;
        self.write_cursor = (self.write_cursor + 1) % self.depth();
        self.filled = (self.filled + 1).min(self.depth());
        log::debug!(
            "End phase: write cursor {}, {} frame(s) buffered",
            self.write_cursor,
            self.filled
        );
        Ok(())
    }

    // Oldest buffered slot, if enough frames are buffered
    fn peek_read_slot(&self, flush: bool) -> Option<usize> {
        let depth = self.depth();
        let required = if flush { 1 } else { depth };
        if self.filled < required {
            return None;
        }
        Some((self.write_cursor + depth - self.filled) % depth)
    }

    /// Take the oldest buffered frame. Without `flush` a frame is only
    /// handed out once all `depth` slots are buffered; `None` means "not
    /// yet", not an error.
    pub fn consume_read_slot(&mut self, flush: bool) -> Option<usize> {
        let index = self.peek_read_slot(flush)?;
        self.filled -= 1;
        log::trace!("Consumed slot {}, {} frame(s) left", index, self.filled);
        Some(index)
    }

    /// `consume_read_slot` followed by a readback of that slot. A failed
    /// readback (timeout, no readback configured) consumes nothing.
    pub fn read(&mut self, flush: bool) -> Result<Option<PixelView<'_>>> {
        let Some(index) = self.peek_read_slot(flush) else {
            return Ok(None);
        };
        let timeout = self.fence_timeout_ns;
        let view = self.slots[index].read_result(timeout)?;
        self.filled -= 1;
        Ok(Some(view))
    }

    /// Read back a specific slot without touching the consume order.
    pub fn read_slot(&mut self, index: usize) -> Result<PixelView<'_>> {
        let timeout = self.fence_timeout_ns;
        self.slot_mut(index)?.read_result(timeout)
    }

    /// Wait for every in-flight slot.
    pub fn wait_idle(&mut self) -> Result<()> {
        let timeout = self.fence_timeout_ns;
        for slot in &mut self.slots {
            slot.wait_idle(timeout)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RenderTargetRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderTargetRing")
            .field("depth", &self.depth())
            .field("write_cursor", &self.write_cursor)
            .field("filled", &self.filled)
            .finish()
    }
}
