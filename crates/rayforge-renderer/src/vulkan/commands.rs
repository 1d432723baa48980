//! One-shot command recording and image layout transitions.
//!
//! Per-frame command buffers belong to the frame scheduler; this manager only
//! serves work that is recorded, submitted and waited on immediately, such as
//! an acceleration-structure `build_and_submit`.

use ash::vk;

use super::VulkanContext;
use crate::error::{RenderError, Result};

/// Transient command pool for single-use command buffers.
pub struct CommandManager {
    transient_pool: vk::CommandPool,
    queue: vk::Queue,
    device: ash::Device,
}

impl CommandManager {
    /// Create a new command manager on the graphics queue family.
    pub fn new(ctx: &VulkanContext) -> Result<Self> {
        let graphics_family = ctx.queue_families.graphics
            .ok_or(RenderError::InvalidUsage("no graphics queue family"))?;

        let transient_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(graphics_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        // SAFETY: the device is alive for the lifetime of the context.
        let transient_pool = unsafe { ctx.device.create_command_pool(&transient_info, None) }
            .map_err(RenderError::vk("vkCreateCommandPool"))?;

        Ok(Self {
            transient_pool,
            queue: ctx.graphics_queue,
            device: ctx.device.clone(),
        })
    }

    /// Begin a single-use command buffer.
    pub fn begin_single_time(&self) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.transient_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(RenderError::vk("vkAllocateCommandBuffers"))?[0];

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe { self.device.begin_command_buffer(cmd, &begin_info) }
            .map_err(RenderError::vk("vkBeginCommandBuffer"))?;

        Ok(cmd)
    }

    /// End and submit a single-use command buffer, waiting for completion.
    pub fn end_single_time(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let command_buffers = [cmd];

        let result = unsafe {
            self.device.end_command_buffer(cmd)
                .map_err(RenderError::vk("vkEndCommandBuffer"))
                .and_then(|()| {
                    let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
                    self.device.queue_submit(self.queue, &[submit_info], vk::Fence::null())
                        .map_err(RenderError::vk("vkQueueSubmit"))
                })
                .and_then(|()| {
                    self.device.queue_wait_idle(self.queue)
                        .map_err(RenderError::vk("vkQueueWaitIdle"))
                })
        };

        unsafe { self.device.free_command_buffers(self.transient_pool, &command_buffers) };
        result
    }

    /// Destroy the transient pool.
    ///
    /// # Safety
    /// No one-shot command buffer may still be executing.
    pub unsafe fn destroy(&mut self) {
        self.device.destroy_command_pool(self.transient_pool, None);
        self.transient_pool = vk::CommandPool::null();
    }
}

/// Access masks and stages for a layout transition.
fn transition_masks(
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> (vk::AccessFlags, vk::AccessFlags, vk::PipelineStageFlags, vk::PipelineStageFlags) {
    match (old_layout, new_layout) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::PRESENT_SRC_KHR) => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        ),
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::PRESENT_SRC_KHR) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        ),
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    }
}

/// Record an image layout transition for a single-mip color image.
///
/// # Safety
/// `cmd` must be in the recording state and `image` must outlive its execution.
pub unsafe fn transition_image_layout(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let (src_access, dst_access, src_stage, dst_stage) = transition_masks(old_layout, new_layout);

    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        });

    device.cmd_pipeline_barrier(
        cmd,
        src_stage,
        dst_stage,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[barrier],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_to_transfer_dst() {
        let (src, dst, src_stage, dst_stage) =
            transition_masks(vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert!(src.is_empty());
        assert_eq!(dst, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(dst_stage, vk::PipelineStageFlags::TRANSFER);
    }

    #[test]
    fn test_transition_to_present() {
        let (src, _, src_stage, dst_stage) =
            transition_masks(vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(src, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(dst_stage, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
    }

    #[test]
    fn test_unknown_transition_is_full_barrier() {
        let (src, dst, src_stage, dst_stage) =
            transition_masks(vk::ImageLayout::GENERAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert!(src.contains(vk::AccessFlags::MEMORY_WRITE));
        assert!(dst.contains(vk::AccessFlags::MEMORY_READ));
        assert_eq!(src_stage, vk::PipelineStageFlags::ALL_COMMANDS);
        assert_eq!(dst_stage, vk::PipelineStageFlags::ALL_COMMANDS);
    }
}
