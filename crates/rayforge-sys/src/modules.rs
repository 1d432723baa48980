//! Built-in render modules.

use ash::vk;
use rayforge_renderer::pipeline::{FrameContext, ModuleRegistry, PoolImage, RecordContext, RenderModule};
use rayforge_renderer::{RenderError, Result};

/// Fills the frame's presentable image with a solid color.
///
/// The target must be in `TRANSFER_DST_OPTIMAL` when `render` is recorded.
pub struct ClearModule {
    device: ash::Device,
    color: [f32; 4],
}

impl ClearModule {
    pub const NAME: &'static str = "clear";

    pub fn new(device: ash::Device) -> Self {
        Self {
            device,
            color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl RenderModule for ClearModule {
    fn input_image_count(&self) -> usize {
        0
    }

    fn output_image_count(&self) -> usize {
        0
    }

    fn set_or_create_input_images(&mut self, images: &[PoolImage]) -> bool {
        images.is_empty()
    }

    fn set_or_create_output_images(&mut self, images: &[PoolImage]) -> bool {
        images.is_empty()
    }

    fn set_attributes(&mut self, attributes: &[(String, String)]) -> Result<()> {
        for (key, value) in attributes {
            match key.as_str() {
                "color" => self.color = parse_color(value)?,
                _ => log::warn!("{}: ignoring unknown attribute '{}'", Self::NAME, key),
            }
        }
        Ok(())
    }

    fn build(&mut self) -> Result<()> {
        log::debug!("{}: color {:?}", Self::NAME, self.color);
        Ok(())
    }

    fn render(&mut self, _context: &mut FrameContext, record: &RecordContext<'_>) -> Result<()> {
        if record.target == vk::Image::null() {
            return Err(RenderError::InvalidUsage("clear module recorded without a target image"));
        }

        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };

        // SAFETY: the graph only records into a command buffer the scheduler
        // has put in the recording state.
        unsafe {
            self.device.cmd_clear_color_image(
                record.command_buffer,
                record.target,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &vk::ClearColorValue { float32: self.color },
                &[range],
            );
        }
        Ok(())
    }
}

/// Parse `"r g b"` or `"r g b a"` with components in 0..=1.
pub fn parse_color(text: &str) -> Result<[f32; 4]> {
    let components = text
        .split_whitespace()
        .map(str::parse::<f32>)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| RenderError::Blueprint(format!("bad color '{text}': {e}")))?;

    let mut color = match components.as_slice() {
        &[r, g, b] => [r, g, b, 1.0],
        &[r, g, b, a] => [r, g, b, a],
        _ => {
            return Err(RenderError::Blueprint(format!(
                "color '{text}' needs 3 or 4 components, got {}",
                components.len()
            )))
        }
    };
    for c in &mut color {
        *c = c.clamp(0.0, 1.0);
    }
    Ok(color)
}

/// Register every built-in module kind.
pub fn register_builtin_modules(registry: &mut ModuleRegistry, device: &ash::Device) {
    let device = device.clone();
    registry.register(ClearModule::NAME, move || Box::new(ClearModule::new(device.clone())));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rgb_defaults_alpha() {
        assert_eq!(parse_color("0.1 0.2 0.3").unwrap(), [0.1, 0.2, 0.3, 1.0]);
    }

    #[test]
    fn test_parse_rgba_clamps() {
        assert_eq!(parse_color(" 2.0 -1  0.5 0.25 ").unwrap(), [1.0, 0.0, 0.5, 0.25]);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(parse_color("red"), Err(RenderError::Blueprint(_))));
        assert!(matches!(parse_color("0.1 0.2"), Err(RenderError::Blueprint(msg)) if msg.contains("got 2")));
        assert!(parse_color("").is_err());
    }
}
