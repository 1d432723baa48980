//! Vulkan surface creation from window handles.

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use super::VulkanContext;
use crate::error::{RenderError, Result};

/// Wrapper around a Vulkan surface.
pub struct VulkanSurface {
    pub handle: vk::SurfaceKHR,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub capabilities: vk::SurfaceCapabilitiesKHR,
}

impl VulkanSurface {
    /// Create a new Vulkan surface from window handles.
    ///
    /// # Safety
    /// The window handles must be valid and outlive the surface.
    pub unsafe fn new(
        ctx: &VulkanContext,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        vsync: bool,
    ) -> Result<Self> {
        let handle = ash_window::create_surface(
            &ctx.entry,
            &ctx.instance,
            display_handle,
            window_handle,
            None,
        ).map_err(RenderError::vk("vkCreateSurfaceKHR"))?;

        if !ctx.supports_present(handle)? {
            ctx.surface_loader.destroy_surface(handle, None);
            return Err(RenderError::SurfaceOutOfDate(vk::Result::ERROR_SURFACE_LOST_KHR));
        }

        let capabilities = ctx.surface_loader
            .get_physical_device_surface_capabilities(ctx.physical_device, handle)
            .map_err(RenderError::vk("vkGetPhysicalDeviceSurfaceCapabilitiesKHR"))?;

        let formats = ctx.surface_loader
            .get_physical_device_surface_formats(ctx.physical_device, handle)
            .map_err(RenderError::vk("vkGetPhysicalDeviceSurfaceFormatsKHR"))?;

        let present_modes = ctx.surface_loader
            .get_physical_device_surface_present_modes(ctx.physical_device, handle)
            .map_err(RenderError::vk("vkGetPhysicalDeviceSurfacePresentModesKHR"))?;

        Ok(Self {
            handle,
            format: choose_surface_format(&formats),
            present_mode: choose_present_mode(&present_modes, vsync),
            capabilities,
        })
    }

    /// Refresh surface capabilities (e.g., after window resize).
    ///
    /// # Safety
    /// The surface must still be alive.
    pub unsafe fn refresh_capabilities(&mut self, ctx: &VulkanContext) -> Result<()> {
        self.capabilities = ctx.surface_loader
            .get_physical_device_surface_capabilities(ctx.physical_device, self.handle)
            .map_err(RenderError::vk("vkGetPhysicalDeviceSurfaceCapabilitiesKHR"))?;
        Ok(())
    }

    /// Get the current extent, clamped to surface capabilities.
    pub fn get_extent(&self, desired_width: u32, desired_height: u32) -> vk::Extent2D {
        if self.capabilities.current_extent.width != u32::MAX {
            self.capabilities.current_extent
        } else {
            vk::Extent2D {
                width: desired_width.clamp(
                    self.capabilities.min_image_extent.width,
                    self.capabilities.max_image_extent.width,
                ),
                height: desired_height.clamp(
                    self.capabilities.min_image_extent.height,
                    self.capabilities.max_image_extent.height,
                ),
            }
        }
    }

    /// Clamp a requested image count into what the surface allows.
    /// A `max_image_count` of zero means "no upper limit".
    pub fn clamp_image_count(&self, requested: u32) -> u32 {
        clamp_image_count(&self.capabilities, requested)
    }

    /// Destroy the surface.
    ///
    /// # Safety
    /// No swapchain may still reference the surface.
    pub unsafe fn destroy(&mut self, ctx: &VulkanContext) {
        ctx.surface_loader.destroy_surface(self.handle, None);
        self.handle = vk::SurfaceKHR::null();
    }
}

fn clamp_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, requested: u32) -> u32 {
    let max = if capabilities.max_image_count == 0 {
        u32::MAX
    } else {
        capabilities.max_image_count
    };
    requested.max(capabilities.min_image_count).min(max)
}

/// Prefer SRGB B8G8R8A8, then UNORM, then whatever comes first.
fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    let srgb = formats.iter().find(|f| {
        f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
    });
    let unorm = formats.iter().find(|f| f.format == vk::Format::B8G8R8A8_UNORM);

    srgb.or(unorm)
        .or(formats.first())
        .copied()
        .unwrap_or(vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        })
}

fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        // FIFO is guaranteed to be available
        return vk::PresentModeKHR::FIFO;
    }

    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| modes.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}
