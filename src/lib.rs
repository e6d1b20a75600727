// =============================================================================
// FRAME PIPELINE - N-buffered render targets over Vulkan
// =============================================================================
//
// LAYERS:
// ┌─────────────────────────────────────────────────────────────────┐
// │  RenderTarget (uniform begin/end)                               │
// │    ├── RenderTargetRing      offscreen, FIFO readback           │
// │    └── PresentationAdapter   swapchain acquire/present          │
// │          └── RenderSlot (command buffer, fence, readback)       │
// │                └── DeviceBackend + ResourceAllocator            │
// │                      └── ash / gpu-allocator                    │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW (offscreen):
// 1. begin_phase: wait for the slot's previous frame, start recording
// 2. record commands into the returned PhaseContext
// 3. end_phase: submit, advance the write cursor
// 4. read / consume_read_slot: take the oldest finished frame back out
//
// =============================================================================

pub mod backend;
pub mod config;
pub mod error;
pub mod present;
pub mod ring;
pub mod target;

pub use backend::{DeviceContext, SyncPoints, VulkanDevice, WAIT_FOREVER};
pub use error::{AcquisitionFailure, FrameError, Result};
pub use present::{AcquireOutcome, ClearValues, PresentDesc, PresentationAdapter, WorkingSet};
pub use ring::{PhaseContext, PixelView, RenderTargetRing, RingDesc};
pub use target::RenderTarget;
