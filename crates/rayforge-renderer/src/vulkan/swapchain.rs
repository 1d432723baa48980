//! Vulkan swapchain creation and recreation.
//!
//! The swapchain only owns the presentable images. Frame synchronization
//! lives in [`crate::vulkan::frame::FrameScheduler`], which sizes itself from
//! [`Swapchain::image_count`] rather than from the requested count.

use ash::vk;

use super::{VulkanContext, VulkanSurface};
use crate::error::{RenderError, Result};

/// Vulkan swapchain and its presentable images.
pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    /// Image count that was asked for, after clamping to surface limits.
    pub requested_image_count: u32,
}

impl Swapchain {
    /// Create a new swapchain.
    ///
    /// # Safety
    /// `surface` must belong to `ctx`. If `old_swapchain` is given it is
    /// retired and destroyed; no frame may still be using it.
    pub unsafe fn new(
        ctx: &VulkanContext,
        surface: &VulkanSurface,
        width: u32,
        height: u32,
        requested_frames: u32,
        old_swapchain: Option<vk::SwapchainKHR>,
    ) -> Result<Self> {
        let extent = surface.get_extent(width, height);
        let image_count = surface.clamp_image_count(requested_frames);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle)
            .min_image_count(image_count)
            .image_format(surface.format.format)
            .image_color_space(surface.format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(surface.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain.unwrap_or(vk::SwapchainKHR::null()));

        let handle = ctx.swapchain_loader
            .create_swapchain(&create_info, None)
            .map_err(RenderError::vk("vkCreateSwapchainKHR"))?;

        if let Some(old) = old_swapchain {
            ctx.swapchain_loader.destroy_swapchain(old, None);
        }

        let images = ctx.swapchain_loader
            .get_swapchain_images(handle)
            .map_err(RenderError::vk("vkGetSwapchainImagesKHR"))?;

        if images.len() != image_count as usize {
            log::warn!(
                "Requested {} swapchain images, platform created {}; using the actual count",
                image_count,
                images.len()
            );
        }
        log::info!(
            "Swapchain created: {}x{}, {} images, {:?}",
            extent.width, extent.height, images.len(), surface.present_mode
        );

        Ok(Self {
            handle,
            images,
            format: surface.format.format,
            extent,
            requested_image_count: image_count,
        })
    }

    /// Number of presentable images the platform actually created.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Recreate the swapchain (e.g., after window resize or surface loss).
    ///
    /// # Safety
    /// Every frame scheduler built on this swapchain must already be destroyed.
    pub unsafe fn recreate(
        &mut self,
        ctx: &VulkanContext,
        surface: &mut VulkanSurface,
        width: u32,
        height: u32,
    ) -> Result<()> {
        ctx.wait_idle();
        surface.refresh_capabilities(ctx)?;

        let new = Self::new(ctx, surface, width, height, self.requested_image_count, Some(self.handle))?;
        *self = new;

        Ok(())
    }

    /// Destroy the swapchain.
    ///
    /// # Safety
    /// No frame may still be in flight on this swapchain.
    pub unsafe fn destroy(&mut self, ctx: &VulkanContext) {
        ctx.wait_idle();
        ctx.swapchain_loader.destroy_swapchain(self.handle, None);
        self.handle = vk::SwapchainKHR::null();
        self.images.clear();
    }
}
