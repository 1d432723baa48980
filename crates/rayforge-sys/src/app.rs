//! Device bring-up, the per-frame loop and the fatal-error policy.

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::window::Window;

use rayforge_renderer::pipeline::{ModuleRegistry, PipelineBlueprint, PipelineGraph};
use rayforge_renderer::vulkan::raytracing::VulkanAccelerationDevice;
use rayforge_renderer::vulkan::{
    transition_image_layout, CommandManager, FrameScheduler, FrameSlot, MemoryManager, RetireQueue,
    Swapchain, SwapchainPresenter, VulkanContext, VulkanSurface,
};
use rayforge_renderer::{RenderConfig, RenderError, Result};

use crate::modules;
use crate::scene::DemoScene;

/// Blueprint used when the configuration names none.
const DEFAULT_BLUEPRINT: &str = include_str!("../assets/blueprint.json");

/// Everything that lives on the GPU.
///
/// Fields are declared in teardown order; `shutdown` releases them
/// explicitly and the context goes last when it drops.
pub struct Engine {
    graph: PipelineGraph,
    scene: Option<DemoScene>,
    retired_scenes: RetireQueue<DemoScene>,
    scheduler: Option<FrameScheduler<SwapchainPresenter>>,
    commands: CommandManager,
    memory: MemoryManager,
    swapchain: Swapchain,
    surface: VulkanSurface,
    ctx: VulkanContext,

    config: RenderConfig,
    width: u32,
    height: u32,
    swapchain_dirty: bool,
    frames_drawn: u64,
}

impl Engine {
    pub fn new(window: &Window, config: RenderConfig) -> Result<Self> {
        let display = window.display_handle()
            .map_err(|_| RenderError::InvalidUsage("window has no display handle"))?
            .as_raw();
        let handle = window.window_handle()
            .map_err(|_| RenderError::InvalidUsage("window has no window handle"))?
            .as_raw();
        let size = window.inner_size();

        // SAFETY: the window outlives the engine; the caller drops the engine first.
        let ctx = unsafe { VulkanContext::new(display, config.enable_validation)? };
        let mut surface = unsafe { VulkanSurface::new(&ctx, display, handle, config.vsync)? };

        // SAFETY: surface and swapchain are destroyed before the context.
        let swapchain = match unsafe {
            Swapchain::new(&ctx, &surface, size.width, size.height, config.requested_frame_count(), None)
        } {
            Ok(swapchain) => swapchain,
            Err(e) => {
                unsafe { surface.destroy(&ctx) };
                return Err(e);
            }
        };

        let memory = MemoryManager::new(&ctx)?;
        let commands = CommandManager::new(&ctx)?;

        let presenter = SwapchainPresenter::new(&ctx, &swapchain)?;
        let scheduler = FrameScheduler::new(presenter, config.requested_frame_count(), config.fence_timeout_ns)?;

        let blueprint = match &config.blueprint {
            Some(path) => PipelineBlueprint::load(path)?,
            None => PipelineBlueprint::from_json_str(DEFAULT_BLUEPRINT)?,
        };
        let mut registry = ModuleRegistry::new();
        modules::register_builtin_modules(&mut registry, &ctx.device);
        log::info!("Registered render modules: {:?}", registry.names());

        let graph = PipelineGraph::new(&blueprint, &registry, scheduler.slot_count())?;
        if !graph.images().is_empty() {
            log::warn!("Blueprint declares {} pool images; built-in modules do not allocate them", graph.images().len());
        }

        let scene = build_scene(&ctx, &memory, &commands)?;

        Ok(Self {
            graph,
            scene,
            retired_scenes: RetireQueue::new(),
            scheduler: Some(scheduler),
            commands,
            memory,
            swapchain,
            surface,
            ctx,
            config,
            width: size.width,
            height: size.height,
            swapchain_dirty: false,
            frames_drawn: 0,
        })
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if (width, height) != (self.width, self.height) {
            self.width = width;
            self.height = height;
            self.swapchain_dirty = true;
        }
    }

    /// Draw one frame. Surface loss triggers a swapchain rebuild; any other
    /// error ends the process.
    pub fn tick(&mut self) {
        if self.width == 0 || self.height == 0 {
            return;
        }

        let result = if self.swapchain_dirty {
            self.recreate_swapchain()
        } else {
            self.draw_frame()
        };

        match result {
            Ok(()) => {}
            Err(e) if e.needs_surface_recreation() => {
                log::info!("Surface changed ({}); rebuilding swapchain", e);
                if let Err(e) = self.recreate_swapchain() {
                    fatal(&e);
                }
            }
            Err(e) => fatal(&e),
        }
    }

    fn draw_frame(&mut self) -> Result<()> {
        let scheduler = self.scheduler.as_mut()
            .ok_or(RenderError::InvalidUsage("frame scheduler missing"))?;

        let frame = scheduler.acquire()?;
        let completed = scheduler.completed_serial();
        self.release_retired(completed)?;

        self.record_frame(&frame)?;

        let scheduler = self.scheduler.as_mut()
            .ok_or(RenderError::InvalidUsage("frame scheduler missing"))?;
        scheduler.submit(&frame)?;
        scheduler.present(&frame)?;

        self.frames_drawn += 1;
        if self.frames_drawn % 600 == 0 {
            log::debug!("{} frames drawn, GPU finished through serial {}", self.frames_drawn, completed);
        }
        Ok(())
    }

    fn record_frame(&mut self, frame: &FrameSlot) -> Result<()> {
        let target = self.swapchain.images.get(frame.index as usize).copied()
            .ok_or(RenderError::InvalidUsage("acquired image outside the swapchain"))?;
        let device = &self.ctx.device;

        // SAFETY: the scheduler began this command buffer in `acquire`.
        unsafe {
            transition_image_layout(device, frame.command_buffer, target,
                vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        }
        self.graph.record(frame, target, self.swapchain.extent)?;
        unsafe {
            transition_image_layout(device, frame.command_buffer, target,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::PRESENT_SRC_KHR);
        }
        Ok(())
    }

    fn recreate_swapchain(&mut self) -> Result<()> {
        self.teardown_scheduler()?;

        // SAFETY: the scheduler is gone and the device is idle.
        unsafe { self.swapchain.recreate(&self.ctx, &mut self.surface, self.width, self.height)? };

        let presenter = SwapchainPresenter::new(&self.ctx, &self.swapchain)?;
        let scheduler = FrameScheduler::new(presenter, self.config.requested_frame_count(), self.config.fence_timeout_ns)?;
        self.graph.resize_frames(scheduler.slot_count());
        self.scheduler = Some(scheduler);
        self.swapchain_dirty = false;

        log::info!("Swapchain rebuilt at {}x{}", self.swapchain.extent.width, self.swapchain.extent.height);
        Ok(())
    }

    /// Build a fresh demo scene; the old one is destroyed once the frames
    /// that may still use it have finished.
    pub fn rebuild_scene(&mut self) {
        let scene = match build_scene(&self.ctx, &self.memory, &self.commands) {
            Ok(scene) => scene,
            Err(e) => fatal(&e),
        };
        let last_use = self.scheduler.as_ref().map_or(0, FrameScheduler::current_serial);
        if let Some(old) = std::mem::replace(&mut self.scene, scene) {
            self.retired_scenes.retire(last_use, old);
        }
    }

    fn release_retired(&mut self, completed_serial: u64) -> Result<()> {
        let scenes = self.retired_scenes.drain_completed(completed_serial);
        if scenes.is_empty() {
            return Ok(());
        }
        let device = VulkanAccelerationDevice::new(&self.ctx, &self.memory, &self.commands)?;
        for scene in scenes {
            // SAFETY: every frame that could reference the scene has completed.
            unsafe { scene.destroy(&device) };
        }
        Ok(())
    }

    /// Destroy the scheduler and presenter. Serials restart with the next
    /// scheduler, so anything still retired is released here, after idle.
    fn teardown_scheduler(&mut self) -> Result<()> {
        if let Some(scheduler) = self.scheduler.take() {
            let presenter = scheduler.destroy();
            // SAFETY: the scheduler waited for idle and freed its command buffers.
            unsafe { presenter.destroy() };
        }
        self.release_retired(u64::MAX)
    }

    /// Release every GPU resource. The context itself goes when `self` drops.
    pub fn shutdown(mut self) {
        log::info!("Shutting down after {} frames", self.frames_drawn);
        self.graph.close();

        if let Err(e) = self.teardown_scheduler() {
            log::warn!("Failed to release retired scenes: {}", e);
        }
        if let Some(scene) = self.scene.take() {
            match VulkanAccelerationDevice::new(&self.ctx, &self.memory, &self.commands) {
                // SAFETY: no frames are in flight after scheduler teardown.
                Ok(device) => unsafe { scene.destroy(&device) },
                Err(e) => log::warn!("Leaking demo scene: {}", e),
            }
        }

        unsafe {
            self.commands.destroy();
            self.swapchain.destroy(&self.ctx);
            self.surface.destroy(&self.ctx);
        }
    }
}

/// Build the demo scene, or nothing when the device cannot trace rays.
fn build_scene(ctx: &VulkanContext, memory: &MemoryManager, commands: &CommandManager) -> Result<Option<DemoScene>> {
    match VulkanAccelerationDevice::new(ctx, memory, commands) {
        Ok(device) => DemoScene::build(&device).map(Some),
        Err(RenderError::RayTracingUnsupported) => {
            log::info!("Device has no acceleration-structure support; skipping demo scene");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Log `error` and end the process.
pub fn fatal(error: &RenderError) -> ! {
    log::error!("Fatal render error: {}", error);
    std::process::exit(1);
}
