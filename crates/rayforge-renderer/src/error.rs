//! Error types for the renderer core.
//!
//! Every fallible operation in the core returns [`Result<T>`]. The core never
//! terminates the process itself; the frame loop that owns the device decides
//! what to do with a fatal error (see [`RenderError::is_fatal`]).

use ash::vk;
use thiserror::Error;

/// Errors produced by the frame scheduler, acceleration-structure builders
/// and the module graph.
#[derive(Error, Debug)]
pub enum RenderError {
    /// A Vulkan entry point returned a failure code.
    #[error("{call} failed: {result:?}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },

    /// gpu-allocator could not satisfy a memory request.
    #[error("GPU memory allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    /// The Vulkan loader could not be found or initialized.
    #[error("Failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    /// The driver refused to create an acceleration structure object.
    #[error("Acceleration structure creation failed: {0:?}")]
    StructureCreation(vk::Result),

    /// The presentation surface was lost, is out of date, or is suboptimal.
    #[error("Presentation surface needs recreation: {0:?}")]
    SurfaceOutOfDate(vk::Result),

    /// A fence wait exceeded the configured deadline.
    #[error("Timed out waiting for a frame fence")]
    FenceTimeout,

    /// The selected physical device has no acceleration-structure support.
    #[error("Ray tracing not supported by the selected device")]
    RayTracingUnsupported,

    /// An operation was called out of order or with arguments that break its
    /// contract. Always a programming error in the caller.
    #[error("Invalid usage: {0}")]
    InvalidUsage(&'static str),

    /// A module was handed a different number of images than it declares.
    #[error("Module '{module}' expects {expected} images but was given {actual}")]
    ImageMismatch {
        module: String,
        expected: usize,
        actual: usize,
    },

    /// A blueprint named a module kind the registry does not know.
    #[error("No module registered under the name '{0}'")]
    UnknownModule(String),

    /// A blueprint failed validation.
    #[error("Invalid pipeline blueprint: {0}")]
    Blueprint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl RenderError {
    /// Returns a closure that wraps a `vk::Result` for use with `map_err`.
    pub fn vk(call: &'static str) -> impl FnOnce(vk::Result) -> RenderError {
        move |result| RenderError::Vulkan { call, result }
    }

    /// Whether this error leaves the device or surface in a state the core
    /// cannot recover from. Contract violations and configuration problems are
    /// not fatal; they are reported to the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RenderError::Vulkan { .. }
                | RenderError::Allocation(_)
                | RenderError::Loading(_)
                | RenderError::StructureCreation(_)
                | RenderError::SurfaceOutOfDate(_)
                | RenderError::FenceTimeout
                | RenderError::RayTracingUnsupported
        )
    }

    /// Whether the error can be cleared by recreating the swapchain.
    pub fn needs_surface_recreation(&self) -> bool {
        matches!(self, RenderError::SurfaceOutOfDate(_))
    }
}

pub type Result<T> = std::result::Result<T, RenderError>;
