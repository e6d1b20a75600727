// Vulkan Device - ash implementation of DeviceBackend
//
// Responsibilities:
// - Instance creation with optional validation layers
// - Physical device selection (prefer discrete GPU, require Vulkan 1.3)
// - Logical device + graphics queue creation, dynamic rendering enabled
// - Extension loaders (swapchain, external semaphore fd) resolved once here
//   and held as plain fields; nothing is looked up lazily afterwards

use super::buffer::VulkanAllocator;
use super::{
    AcquireResult, BufferImageCopy, DeviceBackend, DeviceContext, ExternalHandleType, FenceWait,
    ImageBarrier, MemoryBarrier, QueueRef, RenderingInfo, Submission,
};
use crate::error::{AcquisitionFailure, FrameError, Result, VkResultExt};
use ash::extensions::{ext, khr};
use ash::{vk, Entry};
use std::ffi::{CStr, CString};
use std::sync::Arc;

/// What the device must be able to do.
#[derive(Clone, Debug)]
pub struct DeviceDesc {
    pub app_name: String,
    pub validation: bool,
    /// Extra instance extensions, typically the surface extensions the
    /// windowing layer asks for.
    pub instance_extensions: Vec<&'static CStr>,
    /// Enable the swapchain extension and presentation calls.
    pub presentation: bool,
    /// Enable exporting semaphores as POSIX file descriptors.
    pub external_semaphores: bool,
}

impl Default for DeviceDesc {
    fn default() -> Self {
        Self {
            app_name: "frame-pipeline".to_string(),
            validation: cfg!(debug_assertions),
            instance_extensions: Vec::new(),
            presentation: false,
            external_semaphores: false,
        }
    }
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Extension loaders resolved at construction
    swapchain_loader: Option<khr::Swapchain>,
    external_semaphore: Option<khr::ExternalSemaphoreFd>,

    // Vulkan handles (order matters for drop!)
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    entry: Entry,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl VulkanDevice {
    pub fn new(desc: &DeviceDesc) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", desc.app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }.map_err(|e| {
            FrameError::DeviceCreation(format!("failed to load Vulkan library: {}", e))
        })?;

        // Step 2: Create instance
        let instance = Self::create_instance(&entry, desc)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if desc.validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Step 4: Pick physical device (GPU)
        let device_extensions = Self::device_extensions(desc);
        let (physical_device, graphics_queue_family) =
            Self::pick_physical_device(&instance, &device_extensions)?;

        // Step 5: Create logical device
        let (device, graphics_queue) = Self::create_logical_device(
            &instance,
            physical_device,
            graphics_queue_family,
            &device_extensions,
        )?;

        // Step 6: Resolve extension loaders once
        let swapchain_loader = desc.presentation.then(|| khr::Swapchain::new(&instance, &device));
        let external_semaphore = desc
            .external_semaphores
            .then(|| khr::ExternalSemaphoreFd::new(&instance, &device));

        // Step 7: Cache device properties
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        Ok(Arc::new(Self {
            swapchain_loader,
            external_semaphore,
            device,
            physical_device,
            instance,
            entry,
            graphics_queue,
            graphics_queue_family,
            debug_utils,
            properties,
            memory_properties,
        }))
    }

    /// Bundle this device with a gpu-allocator backed allocator. Graphics and
    /// present share the single queue the device was created with.
    pub fn context(self: &Arc<Self>) -> Result<DeviceContext> {
        let allocator = Arc::new(VulkanAllocator::new(self.clone())?);
        let queue = Arc::new(QueueRef::new(
            self.clone(),
            self.graphics_queue,
            self.graphics_queue_family,
        ));
        Ok(DeviceContext {
            backend: self.clone(),
            allocator,
            graphics_queue: queue.clone(),
            present_queue: queue,
        })
    }

    /// Surface loader for the caller's windowing layer.
    pub fn surface_loader(&self) -> khr::Surface {
        khr::Surface::new(&self.entry, &self.instance)
    }

    pub(crate) fn swapchain_loader(&self) -> Result<&khr::Swapchain> {
        self.swapchain_loader
            .as_ref()
            .ok_or(FrameError::Unsupported("presentation was not enabled on this device"))
    }

    /// Alignment for flush/invalidate ranges on non-coherent memory.
    pub fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        self.properties.limits.non_coherent_atom_size.max(1)
    }

    fn create_instance(entry: &Entry, desc: &DeviceDesc) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(desc.app_name.as_str()).map_err(|_| {
            FrameError::DeviceCreation("application name contains a NUL byte".to_string())
        })?;
        let engine_name = c"frame-pipeline";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut extensions: Vec<*const std::ffi::c_char> =
            desc.instance_extensions.iter().map(|name| name.as_ptr()).collect();
        if desc.validation {
            extensions.push(ext::DebugUtils::name().as_ptr());
        }
        if desc.presentation && !desc.instance_extensions.contains(&khr::Surface::name()) {
            extensions.push(khr::Surface::name().as_ptr());
        }

        // Validation layers
        let layer_names = if desc.validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        unsafe { entry.create_instance(&create_info, None) }.require("creating instance")
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .require("creating debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn device_extensions(desc: &DeviceDesc) -> Vec<&'static CStr> {
        let mut extensions = Vec::new();
        if desc.presentation {
            extensions.push(khr::Swapchain::name());
        }
        if desc.external_semaphores {
            extensions.push(khr::ExternalSemaphoreFd::name());
        }
        extensions
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        extensions: &[&CStr],
    ) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .require("enumerating physical devices")?;

        if devices.is_empty() {
            return Err(FrameError::DeviceCreation("no Vulkan-capable GPU found".to_string()));
        }

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            if props.api_version < vk::API_VERSION_1_3 {
                continue;
            }
            if !Self::supports_extensions(instance, device, extensions)? {
                continue;
            }

            // Find graphics queue family
            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };

            let graphics_family = queue_families
                .iter()
                .enumerate()
                .find(|(_, props)| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                .map(|(i, _)| i as u32);

            if let Some(graphics_family) = graphics_family {
                // Score device (prefer discrete GPU)
                let score = match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                    _ => 1,
                };

                if score > best_score {
                    best_score = score;
                    best_device = Some((device, graphics_family));
                }
            }
        }

        best_device.ok_or_else(|| FrameError::DeviceCreation("no suitable GPU found".to_string()))
    }

    fn supports_extensions(
        instance: &ash::Instance,
        device: vk::PhysicalDevice,
        required: &[&CStr],
    ) -> Result<bool> {
        let available = unsafe { instance.enumerate_device_extension_properties(device) }
            .require("enumerating device extensions")?;
        Ok(required.iter().all(|name| {
            available
                .iter()
                .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == *name)
        }))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
        extensions: &[&CStr],
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let extension_names: Vec<_> = extensions.iter().map(|name| name.as_ptr()).collect();

        // Dynamic rendering is core in 1.3 but still has to be switched on
        let mut dynamic_rendering =
            vk::PhysicalDeviceDynamicRenderingFeatures::builder().dynamic_rendering(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extension_names)
            .push_next(&mut dynamic_rendering);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .require("creating logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        Ok((device, graphics_queue))
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.require("waiting for device idle")
    }
}

fn color_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn copy_region(copy: &BufferImageCopy) -> vk::BufferImageCopy {
    vk::BufferImageCopy {
        buffer_offset: copy.buffer_offset,
        buffer_row_length: copy.row_length,
        buffer_image_height: 0,
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        },
        image_offset: vk::Offset3D::default(),
        image_extent: vk::Extent3D {
            width: copy.extent.width,
            height: copy.extent.height,
            depth: 1,
        },
    }
}

impl DeviceBackend for VulkanDevice {
    fn create_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);
        unsafe { self.device.create_command_pool(&info, None) }.require("creating command pool")
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info) }
            .require("allocating command buffer")?;
        buffers.into_iter().next().ok_or(FrameError::Vulkan {
            op: "allocating command buffer",
            result: vk::Result::ERROR_UNKNOWN,
        })
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, buffer: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(pool, &[buffer]) }
    }

    fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        let info = vk::CommandBufferBeginInfo::builder().flags(usage);
        unsafe { self.device.begin_command_buffer(buffer, &info) }
            .require("beginning command buffer")
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.end_command_buffer(buffer) }.require("ending command buffer")
    }

    fn reset_command_buffer(&self, buffer: vk::CommandBuffer) -> Result<()> {
        unsafe {
            self.device
                .reset_command_buffer(buffer, vk::CommandBufferResetFlags::empty())
        }
        .require("resetting command buffer")
    }

    fn cmd_image_barrier(&self, buffer: vk::CommandBuffer, barrier: &ImageBarrier) {
        let native = vk::ImageMemoryBarrier::builder()
            .src_access_mask(barrier.src_access)
            .dst_access_mask(barrier.dst_access)
            .old_layout(barrier.old_layout)
            .new_layout(barrier.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(barrier.image)
            .subresource_range(color_range(barrier.aspect))
            .build();
        unsafe {
            self.device.cmd_pipeline_barrier(
                buffer,
                barrier.src_stage,
                barrier.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[native],
            )
        }
    }

    fn cmd_memory_barrier(&self, buffer: vk::CommandBuffer, barrier: &MemoryBarrier) {
        let native = vk::MemoryBarrier::builder()
            .src_access_mask(barrier.src_access)
            .dst_access_mask(barrier.dst_access)
            .build();
        unsafe {
            self.device.cmd_pipeline_barrier(
                buffer,
                barrier.src_stage,
                barrier.dst_stage,
                vk::DependencyFlags::empty(),
                &[native],
                &[],
                &[],
            )
        }
    }

    fn cmd_copy_image_to_buffer(&self, buffer: vk::CommandBuffer, copy: &BufferImageCopy) {
        unsafe {
            self.device.cmd_copy_image_to_buffer(
                buffer,
                copy.image,
                copy.image_layout,
                copy.buffer,
                &[copy_region(copy)],
            )
        }
    }

    fn cmd_copy_buffer_to_image(&self, buffer: vk::CommandBuffer, copy: &BufferImageCopy) {
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                buffer,
                copy.buffer,
                copy.image,
                copy.image_layout,
                &[copy_region(copy)],
            )
        }
    }

    fn cmd_clear_color_image(
        &self,
        buffer: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: [f32; 4],
    ) {
        let value = vk::ClearColorValue { float32: color };
        let range = color_range(vk::ImageAspectFlags::COLOR);
        unsafe {
            self.device.cmd_clear_color_image(buffer, image, layout, &value, &[range])
        }
    }

    fn cmd_begin_rendering(&self, buffer: vk::CommandBuffer, info: &RenderingInfo) {
        let color = vk::RenderingAttachmentInfo::builder()
            .image_view(info.color_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(if info.clear_color.is_some() {
                vk::AttachmentLoadOp::CLEAR
            } else {
                vk::AttachmentLoadOp::LOAD
            })
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: info.clear_color.unwrap_or_default(),
                },
            })
            .build();
        let depth = info.depth_view.map(|view| {
            vk::RenderingAttachmentInfo::builder()
                .image_view(view)
                .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                .load_op(if info.clear_depth.is_some() {
                    vk::AttachmentLoadOp::CLEAR
                } else {
                    vk::AttachmentLoadOp::LOAD
                })
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: info.clear_depth.unwrap_or(1.0),
                        stencil: 0,
                    },
                })
                .build()
        });

        let mut rendering = vk::RenderingInfo::builder()
            .render_area(info.area)
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&color));
        if let Some(depth) = depth.as_ref() {
            rendering = rendering.depth_attachment(depth);
        }
        unsafe { self.device.cmd_begin_rendering(buffer, &rendering) }
    }

    fn cmd_end_rendering(&self, buffer: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_rendering(buffer) }
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.device.create_fence(&info, None) }.require("creating fence")
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.reset_fences(&[fence]) }.require("resetting fence")
    }

    fn wait_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<FenceWait> {
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(FenceWait::Signaled),
            Err(vk::Result::TIMEOUT) => Ok(FenceWait::TimedOut),
            Err(result) => Err(FrameError::Vulkan {
                op: "waiting for fence",
                result,
            }),
        }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        unsafe { self.device.get_fence_status(fence) }.require("querying fence status")
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn create_semaphore(&self, export: &[ExternalHandleType]) -> Result<vk::Semaphore> {
        if !export.is_empty() && self.external_semaphore.is_none() {
            return Err(FrameError::Unsupported(
                "external semaphores were not enabled on this device",
            ));
        }
        let handle_types = export
            .iter()
            .fold(vk::ExternalSemaphoreHandleTypeFlags::empty(), |acc, t| {
                acc | t.semaphore_flags()
            });
        let mut export_info = vk::ExportSemaphoreCreateInfo::builder().handle_types(handle_types);
        let mut info = vk::SemaphoreCreateInfo::builder();
        if !export.is_empty() {
            info = info.push_next(&mut export_info);
        }
        unsafe { self.device.create_semaphore(&info, None) }.require("creating semaphore")
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn export_semaphore_fd(
        &self,
        semaphore: vk::Semaphore,
        handle_type: ExternalHandleType,
    ) -> Result<i32> {
        let loader = self
            .external_semaphore
            .as_ref()
            .ok_or(FrameError::Unsupported("external semaphores were not enabled on this device"))?;
        let info = vk::SemaphoreGetFdInfoKHR::builder()
            .semaphore(semaphore)
            .handle_type(handle_type.semaphore_flags());
        unsafe { loader.get_semaphore_fd(&info) }.require("exporting semaphore fd")
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submission: &Submission<'_>,
        fence: vk::Fence,
    ) -> Result<()> {
        let wait_semaphores: Vec<_> = submission.waits.iter().map(|w| w.semaphore).collect();
        let wait_stages: Vec<_> = submission.waits.iter().map(|w| w.stage).collect();
        let info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(submission.command_buffers)
            .signal_semaphores(submission.signals)
            .build();
        unsafe { self.device.queue_submit(queue, &[info], fence) }.require("submitting to queue")
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()> {
        unsafe { self.device.queue_wait_idle(queue) }.require("waiting for queue idle")
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<AcquireResult> {
        let loader = self.swapchain_loader()?;
        match unsafe { loader.acquire_next_image(swapchain, timeout_ns, semaphore, fence) } {
            Ok((index, false)) => Ok(AcquireResult::acquired(index)),
            Ok((index, true)) => Ok(AcquireResult {
                image_index: Some(index),
                failure: Some(AcquisitionFailure::Suboptimal),
            }),
            Err(result) => match AcquisitionFailure::from_vk(result) {
                Some(failure) => Ok(AcquireResult::failed(failure)),
                None => Err(FrameError::Vulkan {
                    op: "acquiring swapchain image",
                    result,
                }),
            },
        }
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        waits: &[vk::Semaphore],
    ) -> Result<Option<AcquisitionFailure>> {
        let loader = self.swapchain_loader()?;
        let swapchains = [swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(waits)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(None),
            Ok(true) => Ok(Some(AcquisitionFailure::Suboptimal)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Some(AcquisitionFailure::OutOfDate)),
            Err(result) => Err(FrameError::Vulkan {
                op: "presenting swapchain image",
                result,
            }),
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        if let Err(e) = self.wait_idle() {
            log::error!("Device did not go idle before destruction: {}", e);
        }

        // Cleanup in reverse order
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
