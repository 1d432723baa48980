//! Rayforge renderer core.
//!
//! Frame pipelining ([`vulkan::FrameScheduler`]), acceleration-structure
//! builds ([`vulkan::raytracing`]) and the render-module graph
//! ([`pipeline`]). Every fallible operation returns [`Result`]; deciding
//! whether an error ends the process is left to the caller.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod vulkan;

pub use config::RenderConfig;
pub use error::{RenderError, Result};
