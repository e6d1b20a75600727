// Render target - one begin/end interface over offscreen and swapchain output
//
// Code that draws a frame does not care whether it lands in an offscreen
// ring or on screen. Acquisition conditions have no typed channel here, so
// the swapchain implementation reports them as `FrameError::Acquisition`.

use crate::backend::SyncPoints;
use crate::error::{FrameError, Result};
use crate::present::PresentationAdapter;
use crate::ring::{PhaseContext, RenderTargetRing};
use ash::vk;

pub trait RenderTarget {
    /// Number of slots frames rotate through.
    fn depth(&self) -> usize;

    fn extent(&self) -> vk::Extent2D;

    /// Whether the output is stored upside down relative to the window.
    fn flipped(&self) -> bool {
        false
    }

    /// Whole-target rectangle.
    fn rect(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: self.extent(),
        }
    }

    fn begin(&mut self, rect: Option<vk::Rect2D>) -> Result<PhaseContext<'_>>;

    fn end(&mut self, sync: &SyncPoints) -> Result<()>;
}

impl RenderTarget for RenderTargetRing {
    fn depth(&self) -> usize {
        RenderTargetRing::depth(self)
    }

    fn extent(&self) -> vk::Extent2D {
        RenderTargetRing::extent(self)
    }

    fn begin(&mut self, rect: Option<vk::Rect2D>) -> Result<PhaseContext<'_>> {
        self.begin_phase(rect, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
    }

    fn end(&mut self, sync: &SyncPoints) -> Result<()> {
        self.end_phase(sync)
    }
}

impl RenderTarget for PresentationAdapter {
    fn depth(&self) -> usize {
        PresentationAdapter::depth(self)
    }

    fn extent(&self) -> vk::Extent2D {
        PresentationAdapter::extent(self)
    }

    fn begin(&mut self, rect: Option<vk::Rect2D>) -> Result<PhaseContext<'_>> {
        let clear = self.clear_values();
        {
            let outcome = self.acquire(rect, clear)?;
            if outcome.working_set.is_none() {
                let failure = outcome.failure.ok_or(FrameError::Unsupported(
                    "acquire returned neither an image nor a failure",
                ))?;
                return Err(FrameError::Acquisition(failure));
            }
        }
        self.active_phase().ok_or(FrameError::NoActiveWorkingSet)
    }

    fn end(&mut self, sync: &SyncPoints) -> Result<()> {
        match self.finish_active(sync)? {
            Some(failure) => Err(FrameError::Acquisition(failure)),
            None => Ok(()),
        }
    }
}
