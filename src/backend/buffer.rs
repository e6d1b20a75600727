// GPU memory - images and host-visible buffers through gpu-allocator
//
// `VulkanAllocator` implements ResourceAllocator. The gpu-allocator
// `Allocator` sits behind a mutex and holds an Arc to the device so it is
// always torn down before the device is destroyed.

use super::device::VulkanDevice;
use super::{DeviceImage, HostBuffer, ImageDesc, ResourceAllocator};
use crate::error::{FrameError, Result, VkResultExt};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::Arc;

struct AllocatorInner {
    // Declared before `device`: dropped first
    allocator: Mutex<Option<Allocator>>,
    device: Arc<VulkanDevice>,
}

impl AllocatorInner {
    fn allocate(
        &self,
        op: &'static str,
        name: &'static str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        let mut guard = self.allocator.lock();
        let allocator = guard
            .as_mut()
            .ok_or(FrameError::Unsupported("allocator already shut down"))?;
        allocator
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|source| FrameError::Allocation { op, source })
    }

    fn free(&self, allocation: Allocation) {
        if let Some(allocator) = self.allocator.lock().as_mut() {
            if let Err(e) = allocator.free(allocation) {
                log::error!("Failed to free GPU memory: {}", e);
            }
        }
    }
}

impl Drop for AllocatorInner {
    fn drop(&mut self) {
        // gpu-allocator frees its memory blocks here, while the device is
        // still alive
        drop(self.allocator.lock().take());
    }
}

/// gpu-allocator backed `ResourceAllocator`.
#[derive(Clone)]
pub struct VulkanAllocator {
    inner: Arc<AllocatorInner>,
}

impl VulkanAllocator {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: device.instance.clone(),
            device: device.device.clone(),
            physical_device: device.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|source| FrameError::Allocation {
            op: "creating allocator",
            source,
        })?;

        Ok(Self {
            inner: Arc::new(AllocatorInner {
                allocator: Mutex::new(Some(allocator)),
                device,
            }),
        })
    }
}

/// Image, its memory and a single-mip 2D view.
pub struct AllocatedImage {
    inner: Arc<AllocatorInner>,
    image: vk::Image,
    view: vk::ImageView,
    allocation: Option<Allocation>,
    extent: vk::Extent2D,
    format: vk::Format,
}

impl DeviceImage for AllocatedImage {
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

impl Drop for AllocatedImage {
    fn drop(&mut self) {
        let device = &self.inner.device.device;
        unsafe {
            if self.view != vk::ImageView::null() {
                device.destroy_image_view(self.view, None);
            }
            device.destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            self.inner.free(allocation);
        }
    }
}

/// Persistently mapped buffer.
pub struct AllocatedBuffer {
    inner: Arc<AllocatorInner>,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
    coherent: bool,
}

impl AllocatedBuffer {
    // Range covering the whole allocation, widened to nonCoherentAtomSize
    fn mapped_range(&self) -> Option<vk::MappedMemoryRange> {
        let allocation = self.allocation.as_ref()?;
        let atom = self.inner.device.non_coherent_atom_size();
        let (offset, size) = atom_range(allocation.offset(), allocation.size(), atom);
        Some(
            vk::MappedMemoryRange::builder()
                .memory(unsafe { allocation.memory() })
                .offset(offset)
                .size(size)
                .build(),
        )
    }
}

impl HostBuffer for AllocatedBuffer {
    fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    fn size(&self) -> vk::DeviceSize {
        self.size
    }

    fn is_coherent(&self) -> bool {
        self.coherent
    }

    fn invalidate(&mut self) -> Result<()> {
        if self.coherent {
            return Ok(());
        }
        match self.mapped_range() {
            Some(range) => {
                unsafe { self.inner.device.device.invalidate_mapped_memory_ranges(&[range]) }
                    .require("invalidating mapped memory")
            }
            None => Ok(()),
        }
    }

    fn flush(&mut self) -> Result<()> {
        if self.coherent {
            return Ok(());
        }
        match self.mapped_range() {
            Some(range) => {
                unsafe { self.inner.device.device.flush_mapped_memory_ranges(&[range]) }
                    .require("flushing mapped memory")
            }
            None => Ok(()),
        }
    }

    fn bytes(&self) -> &[u8] {
        let len = self.size as usize;
        self.allocation
            .as_ref()
            .and_then(|allocation| allocation.mapped_slice())
            .map(|slice| &slice[..len.min(slice.len())])
            .unwrap_or(&[])
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        let len = self.size as usize;
        match self.allocation.as_mut().and_then(|allocation| allocation.mapped_slice_mut()) {
            Some(slice) => {
                let len = len.min(slice.len());
                &mut slice[..len]
            }
            None => &mut [],
        }
    }
}

impl Drop for AllocatedBuffer {
    fn drop(&mut self) {
        unsafe { self.inner.device.device.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            self.inner.free(allocation);
        }
    }
}

impl ResourceAllocator for VulkanAllocator {
    fn create_image(&self, desc: &ImageDesc) -> Result<Box<dyn DeviceImage>> {
        let device = &self.inner.device.device;

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.create_image(&image_info, None) }.require("creating image")?;

        // From here on the image is owned by `AllocatedImage`, whose drop
        // releases whatever has been created so far
        let mut owned = AllocatedImage {
            inner: self.inner.clone(),
            image,
            view: vk::ImageView::null(),
            allocation: None,
            extent: desc.extent,
            format: desc.format,
        };

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let allocation = self
            .inner
            .allocate("allocating image memory", desc.name, requirements, desc.location, false)?;
        let (memory, offset) = (unsafe { allocation.memory() }, allocation.offset());
        owned.allocation = Some(allocation);
        unsafe { device.bind_image_memory(image, memory, offset) }.require("binding image memory")?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: desc.aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        owned.view =
            unsafe { device.create_image_view(&view_info, None) }.require("creating image view")?;

        log::debug!(
            "Allocated image '{}' {}x{} {:?}",
            desc.name,
            desc.extent.width,
            desc.extent.height,
            desc.format
        );
        Ok(Box::new(owned))
    }

    fn create_host_buffer(
        &self,
        name: &'static str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Box<dyn HostBuffer>> {
        let device = &self.inner.device.device;

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer =
            unsafe { device.create_buffer(&buffer_info, None) }.require("creating buffer")?;

        let mut owned = AllocatedBuffer {
            inner: self.inner.clone(),
            buffer,
            allocation: None,
            size,
            coherent: true,
        };

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let allocation = self
            .inner
            .allocate("allocating buffer memory", name, requirements, location, true)?;
        let (memory, offset) = (unsafe { allocation.memory() }, allocation.offset());
        owned.coherent = allocation
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT);
        owned.allocation = Some(allocation);
        unsafe { device.bind_buffer_memory(buffer, memory, offset) }
            .require("binding buffer memory")?;

        if owned.bytes().len() < size as usize {
            return Err(FrameError::Unsupported("buffer memory is not host mapped"));
        }

        log::debug!(
            "Allocated buffer '{}' ({} bytes, {})",
            name,
            size,
            if owned.coherent { "coherent" } else { "non-coherent" }
        );
        Ok(Box::new(owned))
    }
}

/// Widen `[offset, offset + size)` to whole `atom`-sized blocks.
fn atom_range(
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    atom: vk::DeviceSize,
) -> (vk::DeviceSize, vk::DeviceSize) {
    let start = offset / atom * atom;
    let end = (offset + size).div_ceil(atom) * atom;
    (start, end - start)
}
