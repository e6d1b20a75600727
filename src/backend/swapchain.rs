// Swapchain - presentable images for a caller-owned surface
//
// The surface comes from the windowing layer and outlives the swapchain.
// Acquire/present go through DeviceBackend (see device.rs); this type only
// creates, recreates and destroys the chain and hands its images out as
// `SwapchainTargets` for the presentation adapter.

use super::VulkanDevice;
use crate::error::{FrameError, Result, VkResultExt};
use ash::extensions::khr;
use ash::vk;
use std::sync::Arc;

/// Presentable images of one swapchain generation, borrowed by the
/// presentation adapter. `images[i]` and `views[i]` belong together.
#[derive(Clone, Debug)]
pub struct SwapchainTargets {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    surface: vk::SurfaceKHR,
    surface_loader: khr::Surface,
    present_mode: vk::PresentModeKHR,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    pub fn new(
        device: Arc<VulkanDevice>,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
        preferred_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        log::info!("Creating swapchain: {}x{}", width, height);

        let surface_loader = device.surface_loader();
        let supported = unsafe {
            surface_loader.get_physical_device_surface_support(
                device.physical_device,
                device.graphics_queue_family,
                surface,
            )
        }
        .require("querying surface support")?;
        if !supported {
            return Err(FrameError::Unsupported("graphics queue cannot present to this surface"));
        }

        let mut this = Self {
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            format: vk::Format::UNDEFINED,
            extent: vk::Extent2D::default(),
            surface,
            surface_loader,
            present_mode: preferred_mode,
            device,
        };
        this.build(width, height)?;
        Ok(this)
    }

    /// Rebuild for a new window size. Callers must make sure no submitted
    /// work still references the old images (`PresentationAdapter::wait_idle`).
    pub fn recreate(&mut self, width: u32, height: u32) -> Result<()> {
        log::info!("Recreating swapchain: {}x{}", width, height);
        self.build(width, height)
    }

    pub fn targets(&self) -> SwapchainTargets {
        SwapchainTargets {
            swapchain: self.swapchain,
            images: self.images.clone(),
            views: self.image_views.clone(),
            extent: self.extent,
            format: self.format,
        }
    }

    fn build(&mut self, width: u32, height: u32) -> Result<()> {
        let physical_device = self.device.physical_device;

        // Query surface capabilities
        let surface_caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)
        }
        .require("querying surface capabilities")?;

        // Query supported formats
        let formats = unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(physical_device, self.surface)
        }
        .require("querying surface formats")?;

        // Query supported present modes
        let present_modes = unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)
        }
        .require("querying present modes")?;

        // Choose surface format (prefer UNORM BGRA so readbacks are raw BGRA)
        let surface_format = choose_format(&formats)
            .ok_or(FrameError::Unsupported("surface reports no formats"))?;

        let present_mode = choose_present_mode(&present_modes, self.present_mode);
        log::info!("Present mode: {:?}", present_mode);

        let extent = choose_extent(&surface_caps, width, height);

        // Choose image count (one more than the minimum)
        let mut image_count = surface_caps.min_image_count + 1;
        if surface_caps.max_image_count > 0 && image_count > surface_caps.max_image_count {
            image_count = surface_caps.max_image_count;
        }

        let device = self.device.clone();
        let loader = device.swapchain_loader()?;
        let old_swapchain = self.swapchain;

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::TRANSFER_SRC,
            )
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain =
            unsafe { loader.create_swapchain(&create_info, None) }.require("creating swapchain")?;

        // The old chain is retired by the create call; release it and its views
        self.destroy_current();
        self.swapchain = swapchain;

        // Get swapchain images
        self.images = unsafe { loader.get_swapchain_images(swapchain) }
            .require("getting swapchain images")?;
        log::info!("Created swapchain with {} images", self.images.len());

        // Create image views
        for &image in &self.images {
            let create_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            let view = unsafe { device.device.create_image_view(&create_info, None) }
                .require("creating swapchain image view")?;
            self.image_views.push(view);
        }

        self.format = surface_format.format;
        self.extent = extent;
        self.present_mode = present_mode;
        Ok(())
    }

    fn destroy_current(&mut self) {
        unsafe {
            for view in self.image_views.drain(..) {
                self.device.device.destroy_image_view(view, None);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                if let Ok(loader) = self.device.swapchain_loader() {
                    loader.destroy_swapchain(self.swapchain, None);
                }
            }
        }
        self.swapchain = vk::SwapchainKHR::null();
        self.images.clear();
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_current();
    }
}

fn choose_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_UNORM
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

// FIFO is always supported
fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_present_mode_falls_back_to_fifo() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_is_clamped_when_surface_leaves_it_open() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 1024,
                height: 768,
            },
            ..Default::default()
        };
        assert_eq!(
            choose_extent(&caps, 4000, 10),
            vk::Extent2D {
                width: 1024,
                height: 10
            }
        );
    }

    #[test]
    fn prefers_unorm_bgra() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(choose_format(&formats).map(|f| f.format), Some(vk::Format::B8G8R8A8_UNORM));
        assert!(choose_format(&[]).is_none());
    }
}
