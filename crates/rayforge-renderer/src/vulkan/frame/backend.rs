//! The narrow device/presentation contract the frame scheduler drives.

use ash::vk;

use crate::error::Result;

/// One queue submission for a frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSubmission {
    pub command_buffer: vk::CommandBuffer,
    /// Acquisition semaphore; the submission waits on it before any stage runs.
    pub wait_semaphore: vk::Semaphore,
    pub wait_stage: vk::PipelineStageFlags,
    /// Signaled when the commands finish; presentation waits on it.
    pub signal_semaphore: vk::Semaphore,
    /// Signaled when the commands finish; the CPU waits on it before reuse.
    pub fence: vk::Fence,
}

/// Everything [`super::FrameScheduler`] needs from the device and the
/// presentation engine.
///
/// Implementations report failures as [`crate::RenderError`]; presentation
/// results other than plain success must surface as
/// [`crate::RenderError::SurfaceOutOfDate`].
pub trait FrameBackend {
    /// Number of presentable images the platform actually created.
    fn image_count(&self) -> usize;

    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);

    /// Allocate one resettable primary command buffer per frame slot.
    fn allocate_command_buffers(&self, count: usize) -> Result<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]);

    /// Ask the presentation engine for the next image, signaling `semaphore`
    /// once it is available.
    fn acquire_next_image(&self, semaphore: vk::Semaphore, timeout_ns: u64) -> Result<u32>;

    /// Block until `fence` is signaled. A timeout is an error.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;

    /// Reset `command_buffer` and put it into the recording state.
    fn begin_commands(&self, command_buffer: vk::CommandBuffer) -> Result<()>;
    fn end_commands(&self, command_buffer: vk::CommandBuffer) -> Result<()>;

    fn submit(&self, submission: &FrameSubmission) -> Result<()>;

    /// Queue `image_index` for presentation once `wait_semaphore` is signaled.
    fn present(&self, image_index: u32, wait_semaphore: vk::Semaphore) -> Result<()>;

    fn wait_idle(&self) -> Result<()>;
}
