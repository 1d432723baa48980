//! Demo acceleration structures: two meshes and a reserved placeholder in
//! one batched bottom-level build, plus a top-level structure instancing the
//! meshes.

use ash::vk;
use rayforge_renderer::vulkan::raytracing::{
    AccelerationDevice, AccelerationStructureBatchBuilder, AccelerationStructureBuilder, BuildMode,
    BuiltStructure, GeometryBuildRequest, InstanceRecord, Transform, TriangleGeometry,
};
use rayforge_renderer::vulkan::{Buffer, BufferDesc, MemoryLocation};
use rayforge_renderer::Result;

const TRIANGLE_VERTICES: [[f32; 3]; 3] = [[0.0, -0.5, 0.0], [0.5, 0.5, 0.0], [-0.5, 0.5, 0.0]];
const TRIANGLE_INDICES: [u32; 3] = [0, 1, 2];

const QUAD_VERTICES: [[f32; 3]; 4] = [
    [-0.5, -0.5, 0.0],
    [0.5, -0.5, 0.0],
    [0.5, 0.5, 0.0],
    [-0.5, 0.5, 0.0],
];
const QUAD_INDICES: [u32; 6] = [0, 1, 2, 2, 3, 0];

/// Slot kept free for geometry that streams in later.
const RESERVED_FLAGS: vk::BuildAccelerationStructureFlagsKHR = vk::BuildAccelerationStructureFlagsKHR::from_raw(
    vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE.as_raw()
        | vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD.as_raw(),
);

pub struct DemoScene {
    geometry: Vec<Buffer>,
    batch: Option<AccelerationStructureBatchBuilder>,
    bottom_levels: Vec<BuiltStructure>,
    top_level: Option<BuiltStructure>,
}

impl DemoScene {
    /// Upload the meshes and build every structure, waiting for the GPU.
    ///
    /// On failure everything created so far is destroyed.
    pub fn build<D: AccelerationDevice + ?Sized>(device: &D) -> Result<Self> {
        let mut scene = Self {
            geometry: Vec::new(),
            batch: None,
            bottom_levels: Vec::new(),
            top_level: None,
        };

        match scene.populate(device) {
            Ok(()) => {
                log::info!(
                    "Demo scene: {} bottom-level structures, TLAS at {:#x}",
                    scene.bottom_levels.len(),
                    scene.tlas_address().unwrap_or(0)
                );
                Ok(scene)
            }
            Err(e) => {
                // SAFETY: every one-shot submission waits, so nothing is in flight.
                unsafe { scene.destroy(device) };
                Err(e)
            }
        }
    }

    pub fn tlas_address(&self) -> Option<vk::DeviceAddress> {
        self.top_level.as_ref().map(BuiltStructure::device_address)
    }

    fn populate<D: AccelerationDevice + ?Sized>(&mut self, device: &D) -> Result<()> {
        let triangle = self.upload_mesh(device, "triangle", &TRIANGLE_VERTICES, &TRIANGLE_INDICES)?;
        let quad = self.upload_mesh(device, "quad", &QUAD_VERTICES, &QUAD_INDICES)?;

        let fast_trace = vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
        let requests = [
            GeometryBuildRequest {
                name: "reserved",
                geometry: TriangleGeometry::placeholder(),
                flags: RESERVED_FLAGS,
                mode: BuildMode::Build,
                source: None,
            },
            GeometryBuildRequest {
                name: "triangle",
                geometry: triangle,
                flags: fast_trace,
                mode: BuildMode::Build,
                source: None,
            },
            GeometryBuildRequest {
                name: "quad",
                geometry: quad,
                flags: fast_trace,
                mode: BuildMode::Build,
                source: None,
            },
        ];

        let batch = self.batch.insert(AccelerationStructureBatchBuilder::new("demo_blas"));
        for request in &requests {
            batch.push(AccelerationStructureBuilder::try_from(request)?)?;
        }
        batch.query_size_info(device)?;
        batch.allocate_buffers(device)?;
        self.bottom_levels = batch.build_and_submit(device)?;

        // Skip the placeholder; it has no primitives to trace.
        let records: Vec<InstanceRecord> = self.bottom_levels[1..]
            .iter()
            .enumerate()
            .map(|(i, blas)| {
                InstanceRecord::new(blas)
                    .with_transform(translation(i as f32 * 1.5 - 0.75, 0.0, 0.0))
                    .with_custom_index(i as u32)
            })
            .collect();

        let mut tlas = AccelerationStructureBuilder::top_level("demo_tlas");
        let built = tlas
            .define_instance_records(device, &records)
            .and_then(|()| tlas.define_build_property(fast_trace))
            .and_then(|()| tlas.query_size_info(device))
            .and_then(|_| tlas.allocate_buffers(device))
            .and_then(|()| tlas.build_and_submit(device));
        // SAFETY: build_and_submit waited for the build.
        unsafe { tlas.release(device) };

        self.top_level = Some(built?);
        Ok(())
    }

    fn upload_mesh<D: AccelerationDevice + ?Sized>(
        &mut self,
        device: &D,
        name: &str,
        vertices: &[[f32; 3]],
        indices: &[u32],
    ) -> Result<TriangleGeometry> {
        let vertex_address = self.upload(device, &format!("{name}_vertices"), bytemuck::cast_slice(vertices))?;
        let index_address = self.upload(device, &format!("{name}_indices"), bytemuck::cast_slice(indices))?;

        Ok(TriangleGeometry {
            vertex_address,
            vertex_stride: std::mem::size_of::<[f32; 3]>() as vk::DeviceSize,
            vertex_count: vertices.len() as u32,
            index_address,
            index_count: indices.len() as u32,
            opaque: true,
        })
    }

    fn upload<D: AccelerationDevice + ?Sized>(&mut self, device: &D, name: &str, bytes: &[u8]) -> Result<vk::DeviceAddress> {
        let buffer = device.create_buffer(&BufferDesc {
            size: bytes.len() as vk::DeviceSize,
            usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: MemoryLocation::CpuToGpu,
            alignment: 16,
            name,
        })?;
        if let Err(e) = device.write_buffer(&buffer, bytes) {
            // SAFETY: the buffer was never handed to the GPU.
            unsafe { device.destroy_buffer(buffer) };
            return Err(e);
        }
        let address = buffer.address();
        self.geometry.push(buffer);
        address
    }

    /// Destroy every structure and buffer of the scene.
    ///
    /// # Safety
    /// No frame that may reference the scene can still be in flight.
    pub unsafe fn destroy<D: AccelerationDevice + ?Sized>(mut self, device: &D) {
        if let Some(tlas) = self.top_level.take() {
            tlas.destroy(device);
        }
        for blas in self.bottom_levels.drain(..) {
            blas.destroy(device);
        }
        if let Some(batch) = self.batch.take() {
            batch.release(device);
        }
        for buffer in self.geometry.drain(..) {
            device.destroy_buffer(buffer);
        }
    }
}

fn translation(x: f32, y: f32, z: f32) -> Transform {
    [
        [1.0, 0.0, 0.0, x],
        [0.0, 1.0, 0.0, y],
        [0.0, 0.0, 1.0, z],
    ]
}
