// Presentation adapter - the ring specialized for a swapchain
//
// One render slot per swapchain image, each borrowing its image. The slot
// for a frame is picked by the presentation engine (acquire), not by the
// ring's write cursor. A frame goes through:
//
//   acquire -> WorkingSet (recording, dynamic rendering begun)
//           -> WorkingSet::finish (end rendering, submit, present)
//
// Frame sync points (one per image) hold the image-available semaphore
// handed to acquire and remember which slot they were last used with, so
// the next use of the sync point waits for that slot's work first. Each
// image has its own render-finished semaphore that present waits on.
//
// Acquire/present conditions (not ready, timeout, suboptimal, out of date)
// are returned as values so a resize-and-retry loop needs no error paths.
// An image whose slot fails to begin (fence timeout) stays acquired; the
// next `acquire` resumes with it instead of asking the swapchain again.

use crate::backend::queue::PresentTarget;
use crate::backend::{
    DeviceContext, RenderingInfo, Semaphore, SwapchainTargets, SyncPoints, WaitSemaphore,
    WAIT_FOREVER,
};
use crate::error::{AcquisitionFailure, FrameError, Result};
use crate::ring::{PhaseContext, RenderSlot, RenderTargetRing, SlotDesc, SlotHooks, TargetImage};
use ash::vk;

/// Values written by the render pass clear at acquire.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClearValues {
    pub color: [f32; 4],
    /// Only used when the slots have a depth attachment.
    pub depth: f32,
}

impl Default for ClearValues {
    fn default() -> Self {
        Self {
            color: [0.0, 0.0, 0.0, 1.0],
            depth: 1.0,
        }
    }
}

/// Construction parameters for `PresentationAdapter`.
#[derive(Clone, Debug)]
pub struct PresentDesc {
    pub depth_format: Option<vk::Format>,
    pub acquire_timeout_ns: u64,
    pub fence_timeout_ns: u64,
    /// Merged into every frame submission.
    pub extra_sync: SyncPoints,
}

impl Default for PresentDesc {
    fn default() -> Self {
        Self {
            depth_format: None,
            acquire_timeout_ns: WAIT_FOREVER,
            fence_timeout_ns: WAIT_FOREVER,
            extra_sync: SyncPoints::default(),
        }
    }
}

/// Result of `PresentationAdapter::acquire`.
///
/// `working_set` is present on success and on `Suboptimal` (which also sets
/// `failure`). For every other failure no recording was started.
pub struct AcquireOutcome<'a> {
    pub working_set: Option<WorkingSet<'a>>,
    pub failure: Option<AcquisitionFailure>,
}

struct FrameSync {
    image_available: Semaphore,
    last_slot: Option<usize>,
}

impl FrameSync {
    fn new(ctx: &DeviceContext) -> Result<Self> {
        Ok(Self {
            image_available: Semaphore::new(ctx.backend.clone())?,
            last_slot: None,
        })
    }
}

#[derive(Clone, Copy, Debug)]
struct AcquiredImage {
    image_index: u32,
    frame: usize,
    failure: Option<AcquisitionFailure>,
}

#[derive(Clone, Copy, Debug)]
struct ActiveFrame {
    image_index: u32,
    frame: usize,
    rect: vk::Rect2D,
}

pub struct PresentationAdapter {
    ctx: DeviceContext,
    swapchain: vk::SwapchainKHR,
    // Slots wait on their fences when dropped; keep before the semaphores
    ring: RenderTargetRing,
    frames: Vec<FrameSync>,
    render_finished: Vec<Semaphore>,
    next_frame: usize,
    // Acquired but its slot has not begun recording
    pending: Option<AcquiredImage>,
    active: Option<ActiveFrame>,
    clear: ClearValues,
    acquire_timeout_ns: u64,
    depth_format: Option<vk::Format>,
    extra_sync: SyncPoints,
}

impl PresentationAdapter {
    pub fn new(ctx: &DeviceContext, targets: SwapchainTargets, desc: &PresentDesc) -> Result<Self> {
        log::info!(
            "Creating presentation adapter: {} images, {}x{} {:?}",
            targets.images.len(),
            targets.extent.width,
            targets.extent.height,
            targets.format
        );

        let mut ring = build_ring(ctx, &targets, desc.depth_format, &desc.extra_sync)?;
        ring.set_fence_timeout(desc.fence_timeout_ns);

        let count = ring.depth();
        let frames = (0..count).map(|_| FrameSync::new(ctx)).collect::<Result<Vec<_>>>()?;
        let render_finished = (0..count)
            .map(|_| Semaphore::new(ctx.backend.clone()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            ctx: ctx.clone(),
            swapchain: targets.swapchain,
            ring,
            frames,
            render_finished,
            next_frame: 0,
            pending: None,
            active: None,
            clear: ClearValues::default(),
            acquire_timeout_ns: desc.acquire_timeout_ns,
            depth_format: desc.depth_format,
            extra_sync: desc.extra_sync.clone(),
        })
    }

    /// Number of presentable images (and slots).
    pub fn depth(&self) -> usize {
        self.ring.depth()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.ring.extent()
    }

    pub fn color_format(&self) -> vk::Format {
        self.ring.color_format()
    }

    pub fn output_views(&self) -> Vec<vk::ImageView> {
        self.ring.target_views()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Clear values used by `RenderTarget::begin`.
    pub fn set_clear_values(&mut self, clear: ClearValues) {
        self.clear = clear;
    }

    pub fn clear_values(&self) -> ClearValues {
        self.clear
    }

    /// Acquire the next presentable image and start recording into its slot
    /// with a cleared dynamic rendering scope over `rect` (default: whole
    /// image).
    pub fn acquire(
        &mut self,
        rect: Option<vk::Rect2D>,
        clear: ClearValues,
    ) -> Result<AcquireOutcome<'_>> {
        if self.active.is_some() {
            return Err(FrameError::WorkingSetActive);
        }

        let timeout = self.ring.fence_timeout();
        let acquired = match self.pending.take() {
            Some(pending) => {
                log::debug!("Resuming acquired image {}", pending.image_index);
                pending
            }
            None => match self.acquire_image(timeout)? {
                Ok(acquired) => acquired,
                Err(failure) => {
                    return Ok(AcquireOutcome {
                        working_set: None,
                        failure,
                    });
                }
            },
        };
        let AcquiredImage {
            image_index, frame, ..
        } = acquired;

        let slot_index = image_index as usize;
        let begun = self
            .ring
            .slot_mut(slot_index)?
            .begin(rect, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT, timeout);
        let resolved = match begun {
            Ok(phase) => {
                phase.commands.begin_rendering(&RenderingInfo {
                    color_view: phase.target_view,
                    depth_view: phase.depth_view,
                    area: phase.rect,
                    clear_color: Some(clear.color),
                    clear_depth: phase.depth_view.map(|_| clear.depth),
                });
                phase.rect
            }
            Err(e) => {
                log::warn!("Acquired image {} could not begin: {}", image_index, e);
                self.pending = Some(acquired);
                return Err(e);
            }
        };

        self.frames[frame].last_slot = Some(slot_index);
        self.next_frame = (frame + 1) % self.frames.len();
        self.active = Some(ActiveFrame {
            image_index,
            frame,
            rect: resolved,
        });
        log::debug!("Acquired image {} (frame sync point {})", image_index, frame);

        Ok(AcquireOutcome {
            working_set: Some(WorkingSet {
                adapter: self,
                image_index,
            }),
            failure: acquired.failure,
        })
    }

    /// Ask the swapchain for an image, signaling the next frame sync point.
    /// `Err` carries the failure when no image was handed out.
    fn acquire_image(
        &mut self,
        timeout_ns: u64,
    ) -> Result<std::result::Result<AcquiredImage, Option<AcquisitionFailure>>> {
        let frame = self.next_frame;

        // Bound frames in flight: the sync point's previous frame must be done
        if let Some(last) = self.frames[frame].last_slot {
            self.ring.slot_mut(last)?.wait_idle(timeout_ns)?;
        }

        let acquired = self.ctx.backend.acquire_next_image(
            self.swapchain,
            self.acquire_timeout_ns,
            self.frames[frame].image_available.handle(),
            vk::Fence::null(),
        )?;

        let Some(image_index) = acquired.image_index else {
            if let Some(failure) = acquired.failure {
                log::warn!("Acquire failed: {}", failure);
            }
            return Ok(Err(acquired.failure));
        };
        if let Some(failure) = acquired.failure {
            log::warn!("Acquired image {} is {}", image_index, failure);
        }
        Ok(Ok(AcquiredImage {
            image_index,
            frame,
            failure: acquired.failure,
        }))
    }

    /// Finish the frame started by the last successful acquire. Used by
    /// `WorkingSet::finish`, and to recover when a working set was dropped
    /// without finishing.
    pub fn finish_active(&mut self, sync: &SyncPoints) -> Result<Option<AcquisitionFailure>> {
        let active = self.active.take().ok_or(FrameError::NoActiveWorkingSet)?;
        let slot_index = active.image_index as usize;
        let render_finished = self.render_finished[slot_index].handle();

        let mut merged = sync.clone();
        merged.extend_waits([WaitSemaphore::new(
            self.frames[active.frame].image_available.handle(),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        )]);
        merged.extend_signals([render_finished]);

        let slot = self.ring.slot_mut(slot_index)?;
        if let Some(phase) = slot.current(None) {
            phase.commands.end_rendering();
        }
        slot.finish(&merged)?;

        let failure = self.ctx.present_queue.present(
            PresentTarget {
                swapchain: self.swapchain,
                image_index: active.image_index,
            },
            &[render_finished],
        )?;
        match failure {
            Some(failure) => {
                log::warn!("Present of image {} reported {}", active.image_index, failure)
            }
            None => log::debug!("Presented image {}", active.image_index),
        }
        Ok(failure)
    }

    /// Rebuild the slots and sync points over a new generation of swapchain
    /// images (after a resize). On error the adapter is left unchanged.
    pub fn replace_targets(&mut self, targets: SwapchainTargets) -> Result<()> {
        if self.active.is_some() {
            return Err(FrameError::WorkingSetActive);
        }
        self.wait_idle()?;

        let timeout = self.ring.fence_timeout();
        let mut ring = build_ring(&self.ctx, &targets, self.depth_format, &self.extra_sync)?;
        ring.set_fence_timeout(timeout);
        let count = ring.depth();
        // Fresh sync points: a pending acquire may still signal an old one
        let frames = (0..count)
            .map(|_| FrameSync::new(&self.ctx))
            .collect::<Result<Vec<_>>>()?;
        let render_finished = (0..count)
            .map(|_| Semaphore::new(self.ctx.backend.clone()))
            .collect::<Result<Vec<_>>>()?;

        if let Some(pending) = self.pending.take() {
            log::debug!("Dropping acquired image {} of the old swapchain", pending.image_index);
        }
        self.ring = ring;
        self.frames = frames;
        self.render_finished = render_finished;
        self.swapchain = targets.swapchain;
        self.next_frame = 0;

        log::info!(
            "Replaced presentation targets: {} images, {}x{}",
            count,
            targets.extent.width,
            targets.extent.height
        );
        Ok(())
    }

    /// Wait for every slot and for the present queue.
    pub fn wait_idle(&mut self) -> Result<()> {
        self.ring.wait_idle()?;
        self.ctx.present_queue.wait_idle()
    }

    pub(crate) fn active_phase(&self) -> Option<PhaseContext<'_>> {
        let active = self.active.as_ref()?;
        self.ring
            .slots()
            .get(active.image_index as usize)?
            .current(Some(active.rect))
    }
}

impl Drop for PresentationAdapter {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.present_queue.wait_idle() {
            log::error!("Failed to idle present queue: {}", e);
        }
    }
}

impl std::fmt::Debug for PresentationAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresentationAdapter")
            .field("images", &self.ring.depth())
            .field("next_frame", &self.next_frame)
            .field("active", &self.active.map(|active| active.image_index))
            .finish()
    }
}

fn build_ring(
    ctx: &DeviceContext,
    targets: &SwapchainTargets,
    depth_format: Option<vk::Format>,
    extra_sync: &SyncPoints,
) -> Result<RenderTargetRing> {
    if targets.images.len() != targets.views.len() {
        return Err(FrameError::InvalidConfig(format!(
            "{} swapchain images but {} views",
            targets.images.len(),
            targets.views.len()
        )));
    }

    let desc = SlotDesc {
        extent: targets.extent,
        depth_format,
        hooks: SlotHooks::TransitionOnly {
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        },
        row_alignment: 4,
        extra_sync: extra_sync.clone(),
    };
    let slots = targets
        .images
        .iter()
        .zip(&targets.views)
        .enumerate()
        .map(|(index, (&image, &view))| {
            RenderSlot::new(ctx, index, TargetImage::Borrowed { image, view }, &desc)
        })
        .collect::<Result<Vec<_>>>()?;
    RenderTargetRing::from_slots(slots, targets.format)
}

/// Live recording bound to one acquired swapchain image. Holds the adapter
/// mutably until finished.
pub struct WorkingSet<'a> {
    adapter: &'a mut PresentationAdapter,
    image_index: u32,
}

impl WorkingSet<'_> {
    /// Acquired swapchain image index.
    pub fn index(&self) -> u32 {
        self.image_index
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.adapter.extent()
    }

    /// Slot recording state for this frame.
    pub fn phase(&self) -> PhaseContext<'_> {
        let rect = self
            .adapter
            .active
            .map(|active| active.rect)
            .unwrap_or_default();
        self.adapter.ring.slots()[self.image_index as usize].context(rect)
    }

    /// End rendering, submit and present. Returns `Suboptimal`/`OutOfDate`
    /// from present as a value.
    pub fn finish(self, sync: &SyncPoints) -> Result<Option<AcquisitionFailure>> {
        self.adapter.finish_active(sync)
    }
}
