//! [`FrameBackend`] over a live device and swapchain.

use ash::khr::swapchain;
use ash::vk;

use super::frame::{FrameBackend, FrameSubmission};
use super::{Swapchain, VulkanContext};
use crate::error::{RenderError, Result};

/// Drives one swapchain's acquire/submit/present cycle.
///
/// Holds a copy of the swapchain handle, so it must be rebuilt (together with
/// the frame scheduler that owns it) whenever the swapchain is recreated.
pub struct SwapchainPresenter {
    device: ash::Device,
    swapchain_loader: swapchain::Device,
    swapchain: vk::SwapchainKHR,
    image_count: usize,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    command_pool: vk::CommandPool,
}

impl SwapchainPresenter {
    pub fn new(ctx: &VulkanContext, swapchain: &Swapchain) -> Result<Self> {
        let graphics_family = ctx.queue_families.graphics
            .ok_or(RenderError::InvalidUsage("no graphics queue family"))?;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(graphics_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        // SAFETY: the device outlives the presenter.
        let command_pool = unsafe { ctx.device.create_command_pool(&pool_info, None) }
            .map_err(RenderError::vk("vkCreateCommandPool"))?;

        Ok(Self {
            device: ctx.device.clone(),
            swapchain_loader: ctx.swapchain_loader.clone(),
            swapchain: swapchain.handle,
            image_count: swapchain.image_count(),
            graphics_queue: ctx.graphics_queue,
            present_queue: ctx.present_queue,
            command_pool,
        })
    }

    /// Destroy the per-frame command pool.
    ///
    /// # Safety
    /// The frame scheduler using this presenter must already be destroyed.
    pub unsafe fn destroy(self) {
        self.device.destroy_command_pool(self.command_pool, None);
    }
}

impl FrameBackend for SwapchainPresenter {
    fn image_count(&self) -> usize {
        self.image_count
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        unsafe { self.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
            .map_err(RenderError::vk("vkCreateSemaphore"))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() };
        unsafe { self.device.create_fence(&vk::FenceCreateInfo::default().flags(flags), None) }
            .map_err(RenderError::vk("vkCreateFence"))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn allocate_command_buffers(&self, count: usize) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count as u32);

        unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(RenderError::vk("vkAllocateCommandBuffers"))
    }

    fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]) {
        if !buffers.is_empty() {
            unsafe { self.device.free_command_buffers(self.command_pool, buffers) };
        }
    }

    fn acquire_next_image(&self, semaphore: vk::Semaphore, timeout_ns: u64) -> Result<u32> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(self.swapchain, timeout_ns, semaphore, vk::Fence::null())
        };

        match result {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::warn!("Swapchain is suboptimal for the surface; continuing until present");
                }
                Ok(index)
            }
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => Err(RenderError::FenceTimeout),
            Err(e @ (vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR)) => {
                Err(RenderError::SurfaceOutOfDate(e))
            }
            Err(e) => Err(RenderError::vk("vkAcquireNextImageKHR")(e)),
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(RenderError::FenceTimeout),
            Err(e) => Err(RenderError::vk("vkWaitForFences")(e)),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.reset_fences(&[fence]) }
            .map_err(RenderError::vk("vkResetFences"))
    }

    fn begin_commands(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        // SAFETY: the scheduler only calls this after the slot's fence signaled.
        unsafe {
            self.device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(RenderError::vk("vkResetCommandBuffer"))?;
            self.device.begin_command_buffer(command_buffer, &begin_info)
                .map_err(RenderError::vk("vkBeginCommandBuffer"))
        }
    }

    fn end_commands(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.end_command_buffer(command_buffer) }
            .map_err(RenderError::vk("vkEndCommandBuffer"))
    }

    fn submit(&self, submission: &FrameSubmission) -> Result<()> {
        let wait_semaphores = [submission.wait_semaphore];
        let wait_stages = [submission.wait_stage];
        let command_buffers = [submission.command_buffer];
        let signal_semaphores = [submission.signal_semaphore];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe { self.device.queue_submit(self.graphics_queue, &[submit_info], submission.fence) }
            .map_err(RenderError::vk("vkQueueSubmit"))
    }

    fn present(&self, image_index: u32, wait_semaphore: vk::Semaphore) -> Result<()> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.swapchain_loader.queue_present(self.present_queue, &present_info) } {
            Ok(false) => Ok(()),
            Ok(true) => Err(RenderError::SurfaceOutOfDate(vk::Result::SUBOPTIMAL_KHR)),
            Err(e) => Err(RenderError::SurfaceOutOfDate(e)),
        }
    }

    fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }
            .map_err(RenderError::vk("vkDeviceWaitIdle"))
    }
}
