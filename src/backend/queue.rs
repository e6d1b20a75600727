// Queue reference
//
// Non-owning handle to a device queue. The native queue must not be used
// from two threads at once, so submit/present/wait_idle all go through one
// lock per queue.

use super::sync::SyncPoints;
use super::{DeviceBackend, Submission};
use crate::error::{AcquisitionFailure, Result};
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// Target of a present call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresentTarget {
    pub swapchain: vk::SwapchainKHR,
    pub image_index: u32,
}

pub struct QueueRef {
    backend: Arc<dyn DeviceBackend>,
    queue: vk::Queue,
    family_index: u32,
    lock: Mutex<()>,
}

impl QueueRef {
    pub fn new(backend: Arc<dyn DeviceBackend>, queue: vk::Queue, family_index: u32) -> Self {
        Self {
            backend,
            queue,
            family_index,
            lock: Mutex::new(()),
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::Queue {
        self.queue
    }

    #[inline]
    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    /// Submit one command buffer with no semaphores.
    pub fn submit(&self, buffer: vk::CommandBuffer, fence: vk::Fence) -> Result<()> {
        self.submit_with(buffer, &SyncPoints::default(), fence)
    }

    /// Submit one command buffer with explicit wait/signal lists. `fence` may
    /// be null.
    pub fn submit_with(
        &self,
        buffer: vk::CommandBuffer,
        sync: &SyncPoints,
        fence: vk::Fence,
    ) -> Result<()> {
        let buffers = [buffer];
        let submission = Submission {
            command_buffers: &buffers,
            waits: &sync.waits,
            signals: &sync.signals,
        };
        let _guard = self.lock.lock();
        log::trace!("Submitting {:?} ({}) to queue {:?}", buffer, sync, self.queue);
        self.backend.queue_submit(self.queue, &submission, fence)
    }

    /// Present, returning `Suboptimal`/`OutOfDate` as values.
    pub fn present(
        &self,
        target: PresentTarget,
        waits: &[vk::Semaphore],
    ) -> Result<Option<AcquisitionFailure>> {
        let _guard = self.lock.lock();
        self.backend
            .queue_present(self.queue, target.swapchain, target.image_index, waits)
    }

    pub fn wait_idle(&self) -> Result<()> {
        let _guard = self.lock.lock();
        self.backend.queue_wait_idle(self.queue)
    }
}

impl std::fmt::Debug for QueueRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRef")
            .field("queue", &self.queue)
            .field("family_index", &self.family_index)
            .finish()
    }
}
