//! Rayforge entry point: winit event loop driving the renderer.

mod app;
mod modules;
mod scene;

use std::path::{Path, PathBuf};

use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowId};

use rayforge_renderer::RenderConfig;

use app::Engine;

const DEFAULT_CONFIG_PATH: &str = "rayforge.toml";

struct RayforgeApp {
    config: RenderConfig,
    // Dropped before the window it draws into.
    engine: Option<Engine>,
    window: Option<Window>,
}

impl RayforgeApp {
    fn new(config: RenderConfig) -> Self {
        Self {
            config,
            engine: None,
            window: None,
        }
    }

    fn shutdown(&mut self) {
        if let Some(engine) = self.engine.take() {
            engine.shutdown();
        }
        self.window = None;
    }
}

impl ApplicationHandler for RayforgeApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let attrs = Window::default_attributes()
            .with_title("Rayforge")
            .with_inner_size(PhysicalSize::new(self.config.window_width, self.config.window_height));

        let window = match event_loop.create_window(attrs) {
            Ok(window) => window,
            Err(e) => {
                log::error!("Failed to create window: {}", e);
                std::process::exit(1);
            }
        };

        match Engine::new(&window, self.config.clone()) {
            Ok(engine) => self.engine = Some(engine),
            Err(e) => app::fatal(&e),
        }
        window.request_redraw();
        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                if let Some(engine) = &mut self.engine {
                    engine.resize(size.width, size.height);
                }
            }

            WindowEvent::KeyboardInput {
                event: KeyEvent { logical_key, state: ElementState::Pressed, repeat: false, .. },
                ..
            } => match logical_key {
                Key::Named(NamedKey::Escape) => event_loop.exit(),
                Key::Named(NamedKey::Space) => {
                    if let Some(engine) = &mut self.engine {
                        engine.rebuild_scene();
                    }
                }
                _ => {}
            },

            WindowEvent::RedrawRequested => {
                if let Some(engine) = &mut self.engine {
                    engine.tick();
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.shutdown();
    }
}

/// Load the config named on the command line, else `rayforge.toml` if it
/// exists, else defaults.
fn load_config(arg: Option<PathBuf>) -> RenderConfig {
    let (path, explicit) = match arg {
        Some(path) => (path, true),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
    };

    if !explicit && !Path::new(&path).exists() {
        log::info!("No {} found; using default configuration", DEFAULT_CONFIG_PATH);
        return RenderConfig::default();
    }

    match RenderConfig::load(&path) {
        Ok(config) => {
            log::info!("Loaded configuration from {}", path.display());
            config
        }
        Err(e) => app::fatal(&e),
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = load_config(std::env::args_os().nth(1).map(PathBuf::from));
    log::debug!("{:?}", config);

    let event_loop = match EventLoop::new() {
        Ok(event_loop) => event_loop,
        Err(e) => {
            log::error!("Failed to create event loop: {}", e);
            std::process::exit(1);
        }
    };
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = RayforgeApp::new(config);
    if let Err(e) = event_loop.run_app(&mut app) {
        log::error!("Event loop error: {}", e);
        app.shutdown();
        std::process::exit(1);
    }
}
