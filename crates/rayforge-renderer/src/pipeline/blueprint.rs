//! Pipeline blueprints: the data that wires render modules together.
//!
//! ```json
//! {
//!   "image_formats": ["rgba16_sfloat", "bgra8_srgb"],
//!   "modules": [
//!     { "name": "clear", "outputs": [0], "attributes": ["color", "0.1 0.1 0.1 1.0"] },
//!     { "name": "tonemap", "inputs": [0], "outputs": [1] }
//!   ]
//! }
//! ```
//!
//! Image indices refer to `image_formats`, so two modules naming the same
//! index share one image.

use std::path::Path;

use ash::vk;
use serde::Deserialize;

use crate::error::{RenderError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    Rgba16Sfloat,
    Rgba32Sfloat,
    R32Sfloat,
    D32Sfloat,
}

impl PixelFormat {
    pub fn vk_format(self) -> vk::Format {
        match self {
            PixelFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
            PixelFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
            PixelFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
            PixelFormat::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
            PixelFormat::Rgba16Sfloat => vk::Format::R16G16B16A16_SFLOAT,
            PixelFormat::Rgba32Sfloat => vk::Format::R32G32B32A32_SFLOAT,
            PixelFormat::R32Sfloat => vk::Format::R32_SFLOAT,
            PixelFormat::D32Sfloat => vk::Format::D32_SFLOAT,
        }
    }
}

/// One module instance in the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleBlueprint {
    /// Registry name of the module kind.
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<usize>,
    #[serde(default)]
    pub outputs: Vec<usize>,
    /// Flat key, value, key, value, ... list.
    #[serde(default)]
    pub attributes: Vec<String>,
}

impl ModuleBlueprint {
    /// Attributes as (key, value) pairs. A trailing unpaired key is dropped;
    /// `PipelineBlueprint::validate` rejects that case.
    pub fn attribute_pairs(&self) -> Vec<(String, String)> {
        self.attributes
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineBlueprint {
    pub image_formats: Vec<PixelFormat>,
    pub modules: Vec<ModuleBlueprint>,
}

impl PipelineBlueprint {
    /// Parse and validate.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let blueprint: Self = serde_json::from_str(text)?;
        blueprint.validate()?;
        Ok(blueprint)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        log::info!("Loading pipeline blueprint from {}", path.as_ref().display());
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.modules.is_empty() {
            return Err(RenderError::Blueprint("pipeline has no modules".into()));
        }

        let image_count = self.image_formats.len();
        for (position, module) in self.modules.iter().enumerate() {
            if module.name.is_empty() {
                return Err(RenderError::Blueprint(format!("module #{position} has no name")));
            }
            if let Some(&index) = module.inputs.iter().chain(&module.outputs).find(|&&i| i >= image_count) {
                return Err(RenderError::Blueprint(format!(
                    "module #{position} ('{}') references image {index} but only {image_count} image formats are declared",
                    module.name
                )));
            }
            if module.attributes.len() % 2 != 0 {
                return Err(RenderError::Blueprint(format!(
                    "module #{position} ('{}') has an attribute key without a value",
                    module.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "image_formats": ["rgba16_sfloat", "bgra8_srgb"],
        "modules": [
            { "name": "clear", "outputs": [0], "attributes": ["color", "0.1 0.2 0.3 1.0"] },
            { "name": "tonemap", "inputs": [0], "outputs": [1], "attributes": ["exposure", "1.5", "curve", "aces"] }
        ]
    }"#;

    #[test]
    fn test_parse_sample() {
        let blueprint = PipelineBlueprint::from_json_str(SAMPLE).unwrap();
        assert_eq!(blueprint.image_formats, vec![PixelFormat::Rgba16Sfloat, PixelFormat::Bgra8Srgb]);
        assert_eq!(blueprint.modules.len(), 2);
        assert_eq!(blueprint.modules[1].inputs, vec![0]);
        assert_eq!(
            blueprint.modules[1].attribute_pairs(),
            vec![("exposure".to_string(), "1.5".to_string()), ("curve".to_string(), "aces".to_string())]
        );
    }

    #[test]
    fn test_missing_lists_default_empty() {
        let blueprint = PipelineBlueprint::from_json_str(
            r#"{ "image_formats": [], "modules": [{ "name": "noop" }] }"#,
        ).unwrap();
        let module = &blueprint.modules[0];
        assert!(module.inputs.is_empty() && module.outputs.is_empty() && module.attributes.is_empty());
    }

    #[test]
    fn test_format_mapping() {
        assert_eq!(PixelFormat::Bgra8Srgb.vk_format(), vk::Format::B8G8R8A8_SRGB);
        assert_eq!(PixelFormat::D32Sfloat.vk_format(), vk::Format::D32_SFLOAT);
    }

    // ============================================================
    // Validation
    // ============================================================

    #[test]
    fn test_empty_pipeline_rejected() {
        let err = PipelineBlueprint::from_json_str(r#"{ "image_formats": [], "modules": [] }"#).unwrap_err();
        assert!(matches!(err, RenderError::Blueprint(_)));
    }

    #[test]
    fn test_out_of_range_image_rejected() {
        let err = PipelineBlueprint::from_json_str(
            r#"{ "image_formats": ["rgba8_unorm"], "modules": [{ "name": "blit", "inputs": [0], "outputs": [1] }] }"#,
        ).unwrap_err();
        assert!(matches!(err, RenderError::Blueprint(msg) if msg.contains("image 1")));
    }

    #[test]
    fn test_odd_attribute_list_rejected() {
        let err = PipelineBlueprint::from_json_str(
            r#"{ "image_formats": [], "modules": [{ "name": "clear", "attributes": ["color"] }] }"#,
        ).unwrap_err();
        assert!(matches!(err, RenderError::Blueprint(_)));
    }

    #[test]
    fn test_unknown_format_is_json_error() {
        let err = PipelineBlueprint::from_json_str(
            r#"{ "image_formats": ["rgb565"], "modules": [{ "name": "clear" }] }"#,
        ).unwrap_err();
        assert!(matches!(err, RenderError::Json(_)));
    }
}
