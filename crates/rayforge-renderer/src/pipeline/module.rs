//! The render-module interface.

use std::any::Any;

use ash::vk;

use crate::error::Result;

/// Index of a module in its graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub usize);

/// An image of the graph's shared pool.
///
/// `image` and `view` stay null until the host binds real images with
/// [`super::PipelineGraph::bind_image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolImage {
    pub index: usize,
    pub format: vk::Format,
    pub image: vk::Image,
    pub view: vk::ImageView,
}

impl PoolImage {
    pub fn unbound(index: usize, format: vk::Format) -> Self {
        Self {
            index,
            format,
            image: vk::Image::null(),
            view: vk::ImageView::null(),
        }
    }
}

/// Per-frame, per-module state, owned by the graph.
///
/// Refers back to its module by [`ModuleId`] only.
pub struct FrameContext {
    pub module: ModuleId,
    pub frame_index: u32,
    /// Frames recorded with this context.
    pub frames_recorded: u64,
    /// Serial of the last frame recorded with this context.
    pub last_serial: u64,
    state: Option<Box<dyn Any>>,
}

impl FrameContext {
    pub fn new(module: ModuleId, frame_index: u32) -> Self {
        Self {
            module,
            frame_index,
            frames_recorded: 0,
            last_serial: 0,
            state: None,
        }
    }

    /// Attach module-specific state, replacing any previous value.
    pub fn set_state<T: Any>(&mut self, state: T) {
        self.state = Some(Box::new(state));
    }

    pub fn state<T: Any>(&self) -> Option<&T> {
        self.state.as_ref()?.downcast_ref()
    }

    pub fn state_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.state.as_mut()?.downcast_mut()
    }
}

impl std::fmt::Debug for FrameContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameContext")
            .field("module", &self.module)
            .field("frame_index", &self.frame_index)
            .field("frames_recorded", &self.frames_recorded)
            .field("last_serial", &self.last_serial)
            .field("has_state", &self.state.is_some())
            .finish()
    }
}

/// What a module records into for one frame.
#[derive(Debug, Clone, Copy)]
pub struct RecordContext<'a> {
    pub command_buffer: vk::CommandBuffer,
    pub frame_index: u32,
    pub serial: u64,
    /// Presentable image of this frame.
    pub target: vk::Image,
    pub extent: vk::Extent2D,
    pub images: &'a [PoolImage],
}

/// One stage of the render pipeline.
///
/// Called in this order: image setup, `set_attributes`, `build`, then
/// `render` once per frame, and `pre_close` before the device goes away.
pub trait RenderModule {
    fn input_image_count(&self) -> usize;
    fn output_image_count(&self) -> usize;

    /// Take (or create) the input images. Returns false if they do not match
    /// what the module expects.
    fn set_or_create_input_images(&mut self, images: &[PoolImage]) -> bool;
    fn set_or_create_output_images(&mut self, images: &[PoolImage]) -> bool;

    fn set_attributes(&mut self, attributes: &[(String, String)]) -> Result<()>;

    fn build(&mut self) -> Result<()>;

    /// Create the context used for frame slot `frame_index`.
    fn create_context(&self, module: ModuleId, frame_index: u32) -> FrameContext {
        FrameContext::new(module, frame_index)
    }

    fn render(&mut self, context: &mut FrameContext, record: &RecordContext<'_>) -> Result<()>;

    fn bind_texture(&mut self, _sampler: vk::Sampler, _view: vk::ImageView, _index: u32) {}

    fn pre_close(&mut self) {}
}
