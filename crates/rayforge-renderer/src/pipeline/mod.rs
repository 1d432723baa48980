//! Render-module graph: blueprint data, the module interface, the module
//! registry, and the graph that owns modules and their per-frame contexts.

pub mod blueprint;
pub mod graph;
pub mod module;
pub mod registry;

pub use blueprint::{ModuleBlueprint, PipelineBlueprint, PixelFormat};
pub use graph::PipelineGraph;
pub use module::{FrameContext, ModuleId, PoolImage, RecordContext, RenderModule};
pub use registry::{ModuleFactory, ModuleRegistry};
