//! The pipeline graph: modules built from a blueprint, plus their per-frame
//! contexts.

use ash::vk;

use super::blueprint::PipelineBlueprint;
use super::module::{FrameContext, ModuleId, PoolImage, RecordContext, RenderModule};
use super::registry::ModuleRegistry;
use crate::error::{RenderError, Result};
use crate::vulkan::FrameSlot;

/// Owns every module (an arena indexed by [`ModuleId`]) and one context per
/// (frame slot, module) pair.
pub struct PipelineGraph {
    modules: Vec<Box<dyn RenderModule>>,
    names: Vec<String>,
    /// Pool image indices per module, from the blueprint.
    wiring: Vec<(Vec<usize>, Vec<usize>)>,
    images: Vec<PoolImage>,
    /// `frame_count * modules.len()` entries, frame-major.
    contexts: Vec<FrameContext>,
    frame_count: usize,
    closed: bool,
}

impl PipelineGraph {
    /// Instantiate and build every module of `blueprint`, in order.
    pub fn new(blueprint: &PipelineBlueprint, registry: &ModuleRegistry, frame_count: usize) -> Result<Self> {
        blueprint.validate()?;

        let images: Vec<PoolImage> = blueprint.image_formats.iter()
            .enumerate()
            .map(|(index, format)| PoolImage::unbound(index, format.vk_format()))
            .collect();

        let mut modules = Vec::with_capacity(blueprint.modules.len());
        let mut names = Vec::with_capacity(blueprint.modules.len());
        let mut wiring = Vec::with_capacity(blueprint.modules.len());

        for spec in &blueprint.modules {
            let mut module = registry.create(&spec.name)?;

            let inputs: Vec<PoolImage> = spec.inputs.iter().map(|&i| images[i]).collect();
            let outputs: Vec<PoolImage> = spec.outputs.iter().map(|&i| images[i]).collect();
            attach_images(module.as_mut(), &spec.name, &inputs, &outputs)?;

            module.set_attributes(&spec.attribute_pairs())?;
            module.build()?;
            log::debug!("Built module '{}' ({} in, {} out)", spec.name, inputs.len(), outputs.len());

            modules.push(module);
            names.push(spec.name.clone());
            wiring.push((spec.inputs.clone(), spec.outputs.clone()));
        }

        let mut graph = Self {
            modules,
            names,
            wiring,
            images,
            contexts: Vec::new(),
            frame_count: 0,
            closed: false,
        };
        graph.resize_frames(frame_count);

        log::info!("Pipeline graph ready: {} modules, {} pooled images, {} frame slots",
            graph.modules.len(), graph.images.len(), frame_count);
        Ok(graph)
    }

    /// Recreate every frame context for a new frame-slot count.
    pub fn resize_frames(&mut self, frame_count: usize) {
        self.contexts = (0..frame_count)
            .flat_map(|frame| (0..self.modules.len()).map(move |module| (frame, module)))
            .map(|(frame, module)| self.modules[module].create_context(ModuleId(module), frame as u32))
            .collect();
        self.frame_count = frame_count;
    }

    /// Bind a real image to pool slot `index` and hand it to every module
    /// wired to that slot.
    pub fn bind_image(&mut self, index: usize, image: vk::Image, view: vk::ImageView) -> Result<()> {
        let slot = self.images.get_mut(index)
            .ok_or(RenderError::InvalidUsage("pool image index out of range"))?;
        slot.image = image;
        slot.view = view;

        for (id, (inputs, outputs)) in self.wiring.iter().enumerate() {
            if !inputs.contains(&index) && !outputs.contains(&index) {
                continue;
            }
            let ins: Vec<PoolImage> = inputs.iter().map(|&i| self.images[i]).collect();
            let outs: Vec<PoolImage> = outputs.iter().map(|&i| self.images[i]).collect();
            attach_images(self.modules[id].as_mut(), &self.names[id], &ins, &outs)?;
        }
        Ok(())
    }

    /// Render every module, in blueprint order, into `frame`'s command buffer.
    pub fn record(&mut self, frame: &FrameSlot, target: vk::Image, extent: vk::Extent2D) -> Result<()> {
        if self.closed {
            return Err(RenderError::InvalidUsage("record called after close"));
        }
        let frame_index = frame.index as usize;
        if frame_index >= self.frame_count {
            return Err(RenderError::InvalidUsage("frame slot outside the graph's context arena"));
        }

        let record = RecordContext {
            command_buffer: frame.command_buffer,
            frame_index: frame.index,
            serial: frame.serial,
            target,
            extent,
            images: &self.images,
        };

        let base = frame_index * self.modules.len();
        for (module, context) in self.modules.iter_mut().zip(&mut self.contexts[base..]) {
            context.frames_recorded += 1;
            context.last_serial = frame.serial;
            module.render(context, &record)?;
        }
        Ok(())
    }

    /// Forward a texture binding to one module.
    pub fn bind_texture(&mut self, module: ModuleId, sampler: vk::Sampler, view: vk::ImageView, index: u32) -> Result<()> {
        let module = self.modules.get_mut(module.0)
            .ok_or(RenderError::InvalidUsage("module id out of range"))?;
        module.bind_texture(sampler, view, index);
        Ok(())
    }

    /// Call `pre_close` on every module, once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        for module in &mut self.modules {
            module.pre_close();
        }
        self.closed = true;
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// First module created under `name`.
    pub fn module_id(&self, name: &str) -> Option<ModuleId> {
        self.names.iter().position(|n| n == name).map(ModuleId)
    }

    pub fn module(&self, id: ModuleId) -> Option<&dyn RenderModule> {
        self.modules.get(id.0).map(|m| m.as_ref())
    }

    pub fn context(&self, frame_index: usize, id: ModuleId) -> Option<&FrameContext> {
        if frame_index >= self.frame_count || id.0 >= self.modules.len() {
            return None;
        }
        self.contexts.get(frame_index * self.modules.len() + id.0)
    }

    pub fn images(&self) -> &[PoolImage] {
        &self.images
    }
}

impl Drop for PipelineGraph {
    fn drop(&mut self) {
        self.close();
    }
}

fn attach_images(module: &mut dyn RenderModule, name: &str, inputs: &[PoolImage], outputs: &[PoolImage]) -> Result<()> {
    let mismatch = |expected: usize, actual: usize| RenderError::ImageMismatch {
        module: name.to_string(),
        expected,
        actual,
    };

    if module.input_image_count() != inputs.len() {
        return Err(mismatch(module.input_image_count(), inputs.len()));
    }
    if module.output_image_count() != outputs.len() {
        return Err(mismatch(module.output_image_count(), outputs.len()));
    }
    if !module.set_or_create_input_images(inputs) {
        return Err(mismatch(module.input_image_count(), inputs.len()));
    }
    if !module.set_or_create_output_images(outputs) {
        return Err(mismatch(module.output_image_count(), outputs.len()));
    }
    Ok(())
}
