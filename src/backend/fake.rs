// In-memory device used by the unit tests
//
// Implements both capabilities without a GPU:
// - fences complete on submit (or stay pending until `complete_pending`)
// - recorded copies/clears run against host-side image memory at submit
// - acquire/present results can be scripted
// - every created handle is counted so tests can check for leaks

use super::swapchain::SwapchainTargets;
use super::sync::WaitSemaphore;
use super::{
    AcquireResult, BufferImageCopy, DeviceBackend, DeviceContext, DeviceImage, ExternalHandleType,
    FenceWait, HostBuffer, ImageBarrier, ImageDesc, MemoryBarrier, QueueRef, RenderingInfo,
    ResourceAllocator, Submission, WAIT_FOREVER,
};
use crate::error::{AcquisitionFailure, FrameError, Result};
use ash::vk;
use ash::vk::Handle;
use gpu_allocator::MemoryLocation;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum FakeCommand {
    ImageBarrier(ImageBarrier),
    MemoryBarrier(MemoryBarrier),
    CopyImageToBuffer(BufferImageCopy),
    CopyBufferToImage(BufferImageCopy),
    ClearColor { image: vk::Image, color: [f32; 4] },
    BeginRendering(RenderingInfo),
    EndRendering,
}

#[derive(Clone, Debug)]
pub(crate) struct FakeSubmission {
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub waits: Vec<WaitSemaphore>,
    pub signals: Vec<vk::Semaphore>,
    pub fence: vk::Fence,
}

#[derive(Clone, Debug)]
pub(crate) struct FakePresent {
    pub swapchain: vk::SwapchainKHR,
    pub image_index: u32,
    pub waits: Vec<vk::Semaphore>,
}

struct ImageMemory {
    extent: vk::Extent2D,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    live: HashSet<u64>,
    fences: HashMap<u64, bool>,
    pending: Vec<u64>,
    auto_complete: bool,
    commands: HashMap<u64, Vec<FakeCommand>>,
    open: HashSet<u64>,
    begin_recording_calls: usize,
    images: HashMap<u64, ImageMemory>,
    views: HashMap<u64, u64>,
    buffers: HashMap<u64, Vec<u8>>,
    invalidations: usize,
    allocation_budget: Option<usize>,
    semaphore_budget: Option<usize>,
    submissions: Vec<FakeSubmission>,
    acquire_script: VecDeque<AcquireResult>,
    acquire_calls: usize,
    image_count: u32,
    next_image: u32,
    present_script: VecDeque<Option<AcquisitionFailure>>,
    presents: Vec<FakePresent>,
}

impl State {
    fn mint(&mut self) -> u64 {
        self.next_handle += 1;
        self.live.insert(self.next_handle);
        self.next_handle
    }

    fn execute(&mut self, command: &FakeCommand) {
        match command {
            FakeCommand::CopyBufferToImage(copy) => {
                let mut src = self.buffers.get(&copy.buffer.as_raw()).cloned().unwrap_or_default();
                if let Some(image) = self.images.get_mut(&copy.image.as_raw()) {
                    copy_rows(&mut src, copy, image, true);
                }
            }
            FakeCommand::CopyImageToBuffer(copy) => {
                let Some(image) = self.images.get_mut(&copy.image.as_raw()) else {
                    return;
                };
                let mut dst = self.buffers.remove(&copy.buffer.as_raw()).unwrap_or_default();
                copy_rows(&mut dst, copy, image, false);
                self.buffers.insert(copy.buffer.as_raw(), dst);
            }
            FakeCommand::ClearColor { image, color } => {
                if let Some(image) = self.images.get_mut(&image.as_raw()) {
                    fill(image, *color);
                }
            }
            FakeCommand::BeginRendering(info) => {
                if let Some(color) = info.clear_color {
                    let image = self.views.get(&info.color_view.as_raw()).copied();
                    if let Some(image) = image.and_then(|image| self.images.get_mut(&image)) {
                        fill(image, color);
                    }
                }
            }
            _ => {}
        }
    }
}

fn color_bytes(color: [f32; 4]) -> [u8; 4] {
    color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8)
}

fn fill(image: &mut ImageMemory, color: [f32; 4]) {
    let texel = color_bytes(color);
    for chunk in image.bytes.chunks_exact_mut(4) {
        chunk.copy_from_slice(&texel);
    }
}

// Moves `copy.extent` rows between a pitched buffer and tightly packed
// image memory. `to_image` picks the direction.
fn copy_rows(
    buffer: &mut Vec<u8>,
    copy: &BufferImageCopy,
    image: &mut ImageMemory,
    to_image: bool,
) {
    let width = copy.extent.width.min(image.extent.width) as usize;
    let height = copy.extent.height.min(image.extent.height) as usize;
    let row_texels = if copy.row_length == 0 {
        copy.extent.width
    } else {
        copy.row_length
    } as usize;
    let pitch = row_texels * 4;
    let image_pitch = image.extent.width as usize * 4;
    let base = copy.buffer_offset as usize;
    for y in 0..height {
        let buffer_start = base + y * pitch;
        let image_start = y * image_pitch;
        let len = width * 4;
        if buffer.len() < buffer_start + len {
            return;
        }
        let image_range = image_start..image_start + len;
        let buffer_range = buffer_start..buffer_start + len;
        if to_image {
            image.bytes[image_range].copy_from_slice(&buffer[buffer_range]);
        } else {
            buffer[buffer_range].copy_from_slice(&image.bytes[image_range]);
        }
    }
}

fn validation(op: &'static str) -> FrameError {
    FrameError::Vulkan {
        op,
        result: vk::Result::ERROR_VALIDATION_FAILED_EXT,
    }
}

pub(crate) struct FakeDevice {
    this: Weak<FakeDevice>,
    state: Mutex<State>,
    fence_signal: Condvar,
    queue_calls: AtomicUsize,
    max_queue_calls: AtomicUsize,
}

impl FakeDevice {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            state: Mutex::new(State {
                auto_complete: true,
                image_count: 3,
                ..State::default()
            }),
            fence_signal: Condvar::new(),
            queue_calls: AtomicUsize::new(0),
            max_queue_calls: AtomicUsize::new(0),
        })
    }

    fn arc(&self) -> Arc<FakeDevice> {
        self.this.upgrade().expect("fake device dropped while in use")
    }

    pub fn context(self: &Arc<Self>) -> DeviceContext {
        let queue = Arc::new(QueueRef::new(self.clone(), vk::Queue::from_raw(QUEUE_RAW), 0));
        DeviceContext {
            backend: self.clone(),
            allocator: self.clone(),
            graphics_queue: queue.clone(),
            present_queue: queue,
        }
    }

    /// When off, submitted fences stay unsignaled until `complete_pending`.
    pub fn set_auto_complete(&self, enabled: bool) {
        self.state.lock().auto_complete = enabled;
    }

    pub fn complete_pending(&self) {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending);
        for fence in pending {
            state.fences.insert(fence, true);
        }
        self.fence_signal.notify_all();
    }

    pub fn pending_fences(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Allow `count` more allocations, then fail with out-of-memory.
    pub fn limit_allocations(&self, count: usize) {
        self.state.lock().allocation_budget = Some(count);
    }

    /// Allow `count` more semaphores, then fail with out-of-memory.
    pub fn limit_semaphores(&self, count: usize) {
        self.state.lock().semaphore_budget = Some(count);
    }

    pub fn live_objects(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn begin_recording_calls(&self) -> usize {
        self.state.lock().begin_recording_calls
    }

    pub fn invalidations(&self) -> usize {
        self.state.lock().invalidations
    }

    pub fn submissions(&self) -> Vec<FakeSubmission> {
        self.state.lock().submissions.clone()
    }

    pub fn recorded(&self, buffer: vk::CommandBuffer) -> Vec<FakeCommand> {
        self.state.lock().commands.get(&buffer.as_raw()).cloned().unwrap_or_default()
    }

    pub fn script_acquire(&self, result: AcquireResult) {
        self.state.lock().acquire_script.push_back(result);
    }

    pub fn acquire_calls(&self) -> usize {
        self.state.lock().acquire_calls
    }

    pub fn script_present(&self, result: Option<AcquisitionFailure>) {
        self.state.lock().present_script.push_back(result);
    }

    pub fn presents(&self) -> Vec<FakePresent> {
        self.state.lock().presents.clone()
    }

    /// Leave the recording state without going through the backend.
    pub fn force_end(&self, buffer: vk::CommandBuffer) {
        self.state.lock().open.remove(&buffer.as_raw());
    }

    pub fn max_concurrent_queue_calls(&self) -> usize {
        self.max_queue_calls.load(Ordering::SeqCst)
    }

    /// Presentable images for a fake swapchain. The images are backed by
    /// host memory but not counted as live objects; the swapchain owns them.
    pub fn swapchain_targets(&self, count: u32, extent: vk::Extent2D) -> SwapchainTargets {
        let mut state = self.state.lock();
        state.image_count = count;
        state.next_image = 0;
        let swapchain = vk::SwapchainKHR::from_raw(state.mint());
        state.live.remove(&swapchain.as_raw());
        let mut images = Vec::new();
        let mut views = Vec::new();
        for _ in 0..count {
            let image = state.mint();
            let view = state.mint();
            state.live.remove(&image);
            state.live.remove(&view);
            state.images.insert(
                image,
                ImageMemory {
                    extent,
                    bytes: vec![0; (extent.width * extent.height * 4) as usize],
                },
            );
            state.views.insert(view, image);
            images.push(vk::Image::from_raw(image));
            views.push(vk::ImageView::from_raw(view));
        }
        SwapchainTargets {
            swapchain,
            images,
            views,
            extent,
            format: vk::Format::B8G8R8A8_UNORM,
        }
    }

    /// Raw bytes of an image, tightly packed.
    pub fn image_bytes(&self, image: vk::Image) -> Vec<u8> {
        self.state
            .lock()
            .images
            .get(&image.as_raw())
            .map(|memory| memory.bytes.clone())
            .unwrap_or_default()
    }

    fn release(&self, raw: u64) {
        let mut state = self.state.lock();
        state.live.remove(&raw);
        state.fences.remove(&raw);
        state.commands.remove(&raw);
        state.open.remove(&raw);
    }

    fn take_allocation(state: &mut State, op: &'static str) -> Result<()> {
        if let Some(budget) = state.allocation_budget.as_mut() {
            if *budget == 0 {
                return Err(FrameError::Vulkan {
                    op,
                    result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
                });
            }
            *budget -= 1;
        }
        Ok(())
    }

    fn record(&self, buffer: vk::CommandBuffer, command: FakeCommand) {
        let mut state = self.state.lock();
        if state.open.contains(&buffer.as_raw()) {
            state.commands.entry(buffer.as_raw()).or_default().push(command);
        }
    }

    fn enter_queue(&self) {
        let now = self.queue_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_queue_calls.fetch_max(now, Ordering::SeqCst);
        std::thread::yield_now();
    }

    fn leave_queue(&self) {
        self.queue_calls.fetch_sub(1, Ordering::SeqCst);
    }
}

// Distinct, recognizable queue handle.
const QUEUE_RAW: u64 = 0x51;

impl DeviceBackend for FakeDevice {
    fn create_command_pool(&self, _queue_family: u32) -> Result<vk::CommandPool> {
        Ok(vk::CommandPool::from_raw(self.state.lock().mint()))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.release(pool.as_raw());
    }

    fn allocate_command_buffer(&self, _pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        Ok(vk::CommandBuffer::from_raw(self.state.lock().mint()))
    }

    fn free_command_buffer(&self, _pool: vk::CommandPool, buffer: vk::CommandBuffer) {
        self.release(buffer.as_raw());
    }

    fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        _usage: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open.insert(buffer.as_raw()) {
            return Err(validation("begin command buffer while recording"));
        }
        state.commands.insert(buffer.as_raw(), Vec::new());
        state.begin_recording_calls += 1;
        Ok(())
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> Result<()> {
        if self.state.lock().open.remove(&buffer.as_raw()) {
            Ok(())
        } else {
            Err(validation("end command buffer that is not recording"))
        }
    }

    fn reset_command_buffer(&self, buffer: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        state.open.remove(&buffer.as_raw());
        state.commands.remove(&buffer.as_raw());
        Ok(())
    }

    fn cmd_image_barrier(&self, buffer: vk::CommandBuffer, barrier: &ImageBarrier) {
        self.record(buffer, FakeCommand::ImageBarrier(*barrier));
    }

    fn cmd_memory_barrier(&self, buffer: vk::CommandBuffer, barrier: &MemoryBarrier) {
        self.record(buffer, FakeCommand::MemoryBarrier(*barrier));
    }

    fn cmd_copy_image_to_buffer(&self, buffer: vk::CommandBuffer, copy: &BufferImageCopy) {
        self.record(buffer, FakeCommand::CopyImageToBuffer(*copy));
    }

    fn cmd_copy_buffer_to_image(&self, buffer: vk::CommandBuffer, copy: &BufferImageCopy) {
        self.record(buffer, FakeCommand::CopyBufferToImage(*copy));
    }

    fn cmd_clear_color_image(
        &self,
        buffer: vk::CommandBuffer,
        image: vk::Image,
        _layout: vk::ImageLayout,
        color: [f32; 4],
    ) {
        self.record(buffer, FakeCommand::ClearColor { image, color });
    }

    fn cmd_begin_rendering(&self, buffer: vk::CommandBuffer, info: &RenderingInfo) {
        self.record(buffer, FakeCommand::BeginRendering(*info));
    }

    fn cmd_end_rendering(&self, buffer: vk::CommandBuffer) {
        self.record(buffer, FakeCommand::EndRendering);
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let mut state = self.state.lock();
        let raw = state.mint();
        state.fences.insert(raw, signaled);
        Ok(vk::Fence::from_raw(raw))
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.state.lock();
        if state.pending.contains(&fence.as_raw()) {
            return Err(validation("reset fence used by pending submission"));
        }
        state.fences.insert(fence.as_raw(), false);
        Ok(())
    }

    fn wait_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<FenceWait> {
        let deadline =
            (timeout_ns != WAIT_FOREVER).then(|| Instant::now() + Duration::from_nanos(timeout_ns));
        let mut state = self.state.lock();
        loop {
            match state.fences.get(&fence.as_raw()) {
                Some(true) => return Ok(FenceWait::Signaled),
                Some(false) => {}
                None => return Err(validation("wait on unknown fence")),
            }
            match deadline {
                None => self.fence_signal.wait(&mut state),
                Some(deadline) => {
                    if self.fence_signal.wait_until(&mut state, deadline).timed_out() {
                        let signaled = state.fences.get(&fence.as_raw()).copied().unwrap_or(false);
                        return Ok(if signaled { FenceWait::Signaled } else { FenceWait::TimedOut });
                    }
                }
            }
        }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        Ok(self.state.lock().fences.get(&fence.as_raw()).copied().unwrap_or(false))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.release(fence.as_raw());
    }

    fn create_semaphore(&self, _export: &[ExternalHandleType]) -> Result<vk::Semaphore> {
        let mut state = self.state.lock();
        if let Some(budget) = state.semaphore_budget.as_mut() {
            if *budget == 0 {
                return Err(FrameError::Vulkan {
                    op: "create semaphore",
                    result: vk::Result::ERROR_OUT_OF_HOST_MEMORY,
                });
            }
            *budget -= 1;
        }
        Ok(vk::Semaphore::from_raw(state.mint()))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.release(semaphore.as_raw());
    }

    #[cfg(unix)]
    fn export_semaphore_fd(
        &self,
        _semaphore: vk::Semaphore,
        _handle_type: ExternalHandleType,
    ) -> Result<i32> {
        use std::os::fd::IntoRawFd;
        let file =
            std::fs::File::open("/dev/null").map_err(|_| validation("open export handle"))?;
        Ok(file.into_raw_fd())
    }

    fn queue_submit(
        &self,
        _queue: vk::Queue,
        submission: &Submission<'_>,
        fence: vk::Fence,
    ) -> Result<()> {
        self.enter_queue();
        let result = (|| {
            let mut state = self.state.lock();
            for buffer in submission.command_buffers {
                if state.open.contains(&buffer.as_raw()) {
                    return Err(validation("submit command buffer that is still recording"));
                }
            }
            let signaled = state.fences.get(&fence.as_raw()).copied().unwrap_or(false);
            if fence != vk::Fence::null() && signaled {
                return Err(validation("submit with signaled fence"));
            }
            for buffer in submission.command_buffers {
                let commands = state.commands.get(&buffer.as_raw()).cloned().unwrap_or_default();
                for command in &commands {
                    state.execute(command);
                }
            }
            state.submissions.push(FakeSubmission {
                command_buffers: submission.command_buffers.to_vec(),
                waits: submission.waits.to_vec(),
                signals: submission.signals.to_vec(),
                fence,
            });
            if fence != vk::Fence::null() {
                if state.auto_complete {
                    state.fences.insert(fence.as_raw(), true);
                    self.fence_signal.notify_all();
                } else {
                    state.pending.push(fence.as_raw());
                }
            }
            Ok(())
        })();
        self.leave_queue();
        result
    }

    fn queue_wait_idle(&self, _queue: vk::Queue) -> Result<()> {
        self.complete_pending();
        Ok(())
    }

    fn acquire_next_image(
        &self,
        _swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        _semaphore: vk::Semaphore,
        _fence: vk::Fence,
    ) -> Result<AcquireResult> {
        let mut state = self.state.lock();
        state.acquire_calls += 1;
        if let Some(result) = state.acquire_script.pop_front() {
            return Ok(result);
        }
        let index = state.next_image;
        state.next_image = (state.next_image + 1) % state.image_count.max(1);
        Ok(AcquireResult::acquired(index))
    }

    fn queue_present(
        &self,
        _queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        waits: &[vk::Semaphore],
    ) -> Result<Option<AcquisitionFailure>> {
        self.enter_queue();
        let mut state = self.state.lock();
        state.presents.push(FakePresent {
            swapchain,
            image_index,
            waits: waits.to_vec(),
        });
        let result = state.present_script.pop_front().flatten();
        drop(state);
        self.leave_queue();
        Ok(result)
    }
}

struct FakeImage {
    device: Arc<FakeDevice>,
    image: vk::Image,
    view: vk::ImageView,
    extent: vk::Extent2D,
    format: vk::Format,
}

impl DeviceImage for FakeImage {
    fn image(&self) -> vk::Image {
        self.image
    }

    fn view(&self) -> vk::ImageView {
        self.view
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn format(&self) -> vk::Format {
        self.format
    }
}

impl Drop for FakeImage {
    fn drop(&mut self) {
        let mut state = self.device.state.lock();
        state.live.remove(&self.view.as_raw());
        state.live.remove(&self.image.as_raw());
        state.views.remove(&self.view.as_raw());
        state.images.remove(&self.image.as_raw());
    }
}

struct FakeHostBuffer {
    device: Arc<FakeDevice>,
    buffer: vk::Buffer,
    mapped: Vec<u8>,
}

impl HostBuffer for FakeHostBuffer {
    fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    fn size(&self) -> vk::DeviceSize {
        self.mapped.len() as vk::DeviceSize
    }

    fn is_coherent(&self) -> bool {
        false
    }

    fn invalidate(&mut self) -> Result<()> {
        let mut state = self.device.state.lock();
        state.invalidations += 1;
        if let Some(device_side) = state.buffers.get(&self.buffer.as_raw()) {
            self.mapped.copy_from_slice(device_side);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.device
            .state
            .lock()
            .buffers
            .insert(self.buffer.as_raw(), self.mapped.clone());
        Ok(())
    }

    fn bytes(&self) -> &[u8] {
        &self.mapped
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mapped
    }
}

impl Drop for FakeHostBuffer {
    fn drop(&mut self) {
        let mut state = self.device.state.lock();
        state.live.remove(&self.buffer.as_raw());
        state.buffers.remove(&self.buffer.as_raw());
    }
}

impl ResourceAllocator for FakeDevice {
    fn create_image(&self, desc: &ImageDesc) -> Result<Box<dyn DeviceImage>> {
        let mut state = self.state.lock();
        Self::take_allocation(&mut state, "allocating image")?;
        let image = state.mint();
        let view = state.mint();
        state.images.insert(
            image,
            ImageMemory {
                extent: desc.extent,
                bytes: vec![0; (desc.extent.width * desc.extent.height * 4) as usize],
            },
        );
        state.views.insert(view, image);
        drop(state);
        Ok(Box::new(FakeImage {
            device: self.arc(),
            image: vk::Image::from_raw(image),
            view: vk::ImageView::from_raw(view),
            extent: desc.extent,
            format: desc.format,
        }))
    }

    fn create_host_buffer(
        &self,
        _name: &'static str,
        size: vk::DeviceSize,
        _usage: vk::BufferUsageFlags,
        _location: MemoryLocation,
    ) -> Result<Box<dyn HostBuffer>> {
        let mut state = self.state.lock();
        Self::take_allocation(&mut state, "allocating buffer")?;
        let buffer = state.mint();
        state.buffers.insert(buffer, vec![0; size as usize]);
        drop(state);
        Ok(Box::new(FakeHostBuffer {
            device: self.arc(),
            buffer: vk::Buffer::from_raw(buffer),
            mapped: vec![0; size as usize],
        }))
    }
}
