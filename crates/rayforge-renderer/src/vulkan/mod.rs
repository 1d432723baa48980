//! Vulkan 1.3 backend: device bring-up, presentation, frame pipelining and
//! ray-tracing acceleration structures.

pub mod context;
pub mod surface;
pub mod swapchain;
pub mod memory;
pub mod commands;
pub mod presenter;
pub mod frame;
pub mod raytracing;

#[cfg(any(test, feature = "test-fakes"))]
pub mod fakes;

pub use context::{QueueFamilyIndices, RtCapabilities, VulkanContext};
pub use surface::VulkanSurface;
pub use swapchain::Swapchain;
pub use memory::{Buffer, BufferDesc, MemoryManager};
pub use gpu_allocator::MemoryLocation;
pub use commands::{transition_image_layout, CommandManager};
pub use presenter::SwapchainPresenter;
pub use frame::{FrameBackend, FramePhase, FrameScheduler, FrameSlot, RetireQueue};

use ash::vk;
use std::ffi::CStr;

/// Minimum Vulkan version the renderer runs on.
pub const REQUIRED_VK_VERSION: u32 = vk::make_api_version(0, 1, 3, 0);

/// Application name for Vulkan instance.
pub const APP_NAME: &CStr = c"Rayforge";

/// Engine name for Vulkan instance.
pub const ENGINE_NAME: &CStr = c"Rayforge Engine";

/// Engine version.
pub const ENGINE_VERSION: u32 = vk::make_api_version(0, 0, 1, 0);
