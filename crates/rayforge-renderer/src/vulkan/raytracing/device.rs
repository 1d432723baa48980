//! Device seam for acceleration-structure builds.
//!
//! The builders only talk to the GPU through [`AccelerationDevice`]. The ash
//! implementation translates builder descriptions into
//! `VK_KHR_acceleration_structure` calls; tests drive the builders with a fake.

use ash::khr::acceleration_structure;
use ash::vk;

use super::builder::{BuildMode, StructureGeometry, StructureKind};
use crate::error::{RenderError, Result};
use crate::vulkan::{Buffer, BufferDesc, CommandManager, MemoryManager, VulkanContext};

/// Sizes reported by a build-size query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StructureSizeInfo {
    pub acceleration_structure_size: vk::DeviceSize,
    pub build_scratch_size: vk::DeviceSize,
    pub update_scratch_size: vk::DeviceSize,
}

impl StructureSizeInfo {
    /// Scratch bytes needed for the given mode.
    pub fn scratch_size(&self, mode: BuildMode) -> vk::DeviceSize {
        match mode {
            BuildMode::Build => self.build_scratch_size,
            BuildMode::Update => self.update_scratch_size,
        }
    }
}

/// One structure's part of a (possibly batched) build command.
#[derive(Debug, Clone, Copy)]
pub struct BuildCommand<'a> {
    pub kind: StructureKind,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub mode: BuildMode,
    /// Null unless `mode` is [`BuildMode::Update`].
    pub src: vk::AccelerationStructureKHR,
    pub dst: vk::AccelerationStructureKHR,
    pub geometries: &'a [StructureGeometry],
    pub scratch_address: vk::DeviceAddress,
}

/// GPU operations needed to size, allocate, create and build acceleration
/// structures.
pub trait AccelerationDevice {
    /// `minAccelerationStructureScratchOffsetAlignment`.
    fn min_scratch_alignment(&self) -> vk::DeviceSize;

    fn build_sizes(
        &self,
        kind: StructureKind,
        flags: vk::BuildAccelerationStructureFlagsKHR,
        geometries: &[StructureGeometry],
    ) -> StructureSizeInfo;

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<Buffer>;

    /// # Safety
    /// No pending GPU work may reference the buffer.
    unsafe fn destroy_buffer(&self, buffer: Buffer);

    /// Copy `bytes` to the start of a host-visible buffer.
    fn write_buffer(&self, buffer: &Buffer, bytes: &[u8]) -> Result<()>;

    /// Create a structure object over `size` bytes of `buffer` at `offset`.
    /// Failure is reported as [`RenderError::StructureCreation`].
    fn create_acceleration_structure(
        &self,
        kind: StructureKind,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<vk::AccelerationStructureKHR>;

    fn acceleration_structure_address(&self, handle: vk::AccelerationStructureKHR) -> vk::DeviceAddress;

    /// # Safety
    /// No pending GPU work may reference the structure.
    unsafe fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR);

    /// Record a single build call covering every entry of `builds`.
    fn cmd_build_acceleration_structures(&self, cmd: vk::CommandBuffer, builds: &[BuildCommand<'_>]);

    fn begin_one_shot(&self) -> Result<vk::CommandBuffer>;

    /// Submit a command buffer from [`Self::begin_one_shot`] and wait for it.
    fn end_one_shot(&self, cmd: vk::CommandBuffer) -> Result<()>;
}

/// [`AccelerationDevice`] over a live Vulkan device.
pub struct VulkanAccelerationDevice<'a> {
    loader: &'a acceleration_structure::Device,
    memory: &'a MemoryManager,
    commands: &'a CommandManager,
    min_scratch_alignment: vk::DeviceSize,
}

impl<'a> VulkanAccelerationDevice<'a> {
    pub fn new(ctx: &'a VulkanContext, memory: &'a MemoryManager, commands: &'a CommandManager) -> Result<Self> {
        let loader = ctx.accel_struct_loader.as_ref()
            .ok_or(RenderError::RayTracingUnsupported)?;

        Ok(Self {
            loader,
            memory,
            commands,
            min_scratch_alignment: ctx.rt_capabilities.min_scratch_alignment.max(1),
        })
    }
}

impl StructureKind {
    fn vk_type(self) -> vk::AccelerationStructureTypeKHR {
        match self {
            StructureKind::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            StructureKind::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        }
    }
}

impl BuildMode {
    fn vk_mode(self) -> vk::BuildAccelerationStructureModeKHR {
        match self {
            BuildMode::Build => vk::BuildAccelerationStructureModeKHR::BUILD,
            BuildMode::Update => vk::BuildAccelerationStructureModeKHR::UPDATE,
        }
    }
}

fn vk_geometry(geometry: &StructureGeometry) -> vk::AccelerationStructureGeometryKHR<'static> {
    match geometry {
        StructureGeometry::Triangles(tri) => {
            let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                .vertex_format(vk::Format::R32G32B32_SFLOAT)
                .vertex_data(vk::DeviceOrHostAddressConstKHR { device_address: tri.vertex_address })
                .vertex_stride(tri.vertex_stride)
                .max_vertex(tri.vertex_count.saturating_sub(1))
                .index_type(vk::IndexType::UINT32)
                .index_data(vk::DeviceOrHostAddressConstKHR { device_address: tri.index_address });

            vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                .flags(if tri.opaque { vk::GeometryFlagsKHR::OPAQUE } else { vk::GeometryFlagsKHR::empty() })
        }
        StructureGeometry::Instances(inst) => {
            let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR { device_address: inst.address });

            vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
        }
    }
}

impl AccelerationDevice for VulkanAccelerationDevice<'_> {
    fn min_scratch_alignment(&self) -> vk::DeviceSize {
        self.min_scratch_alignment
    }

    fn build_sizes(
        &self,
        kind: StructureKind,
        flags: vk::BuildAccelerationStructureFlagsKHR,
        geometries: &[StructureGeometry],
    ) -> StructureSizeInfo {
        let vk_geometries: Vec<_> = geometries.iter().map(vk_geometry).collect();
        let max_primitive_counts: Vec<u32> = geometries.iter().map(StructureGeometry::primitive_count).collect();

        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(kind.vk_type())
            .flags(flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&vk_geometries);

        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        // SAFETY: the geometry array and primitive counts have matching lengths.
        unsafe {
            self.loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &max_primitive_counts,
                &mut size_info,
            );
        }

        StructureSizeInfo {
            acceleration_structure_size: size_info.acceleration_structure_size,
            build_scratch_size: size_info.build_scratch_size,
            update_scratch_size: size_info.update_scratch_size,
        }
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<Buffer> {
        self.memory.create_buffer(desc)
    }

    unsafe fn destroy_buffer(&self, buffer: Buffer) {
        self.memory.destroy_buffer(buffer);
    }

    fn write_buffer(&self, buffer: &Buffer, bytes: &[u8]) -> Result<()> {
        buffer.write_bytes(bytes)
    }

    fn create_acceleration_structure(
        &self,
        kind: StructureKind,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<vk::AccelerationStructureKHR> {
        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer)
            .offset(offset)
            .size(size)
            .ty(kind.vk_type());

        unsafe { self.loader.create_acceleration_structure(&create_info, None) }
            .map_err(RenderError::StructureCreation)
    }

    fn acceleration_structure_address(&self, handle: vk::AccelerationStructureKHR) -> vk::DeviceAddress {
        let addr_info = vk::AccelerationStructureDeviceAddressInfoKHR::default()
            .acceleration_structure(handle);
        unsafe { self.loader.get_acceleration_structure_device_address(&addr_info) }
    }

    unsafe fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR) {
        self.loader.destroy_acceleration_structure(handle, None);
    }

    fn cmd_build_acceleration_structures(&self, cmd: vk::CommandBuffer, builds: &[BuildCommand<'_>]) {
        let vk_geometries: Vec<Vec<_>> = builds.iter()
            .map(|build| build.geometries.iter().map(vk_geometry).collect())
            .collect();

        let ranges: Vec<Vec<vk::AccelerationStructureBuildRangeInfoKHR>> = builds.iter()
            .map(|build| {
                build.geometries.iter()
                    .map(|geometry| {
                        vk::AccelerationStructureBuildRangeInfoKHR::default()
                            .primitive_count(geometry.primitive_count())
                    })
                    .collect()
            })
            .collect();

        let infos: Vec<_> = builds.iter().zip(&vk_geometries)
            .map(|(build, geometries)| {
                vk::AccelerationStructureBuildGeometryInfoKHR::default()
                    .ty(build.kind.vk_type())
                    .flags(build.flags)
                    .mode(build.mode.vk_mode())
                    .src_acceleration_structure(build.src)
                    .dst_acceleration_structure(build.dst)
                    .geometries(geometries)
                    .scratch_data(vk::DeviceOrHostAddressKHR { device_address: build.scratch_address })
            })
            .collect();

        let range_refs: Vec<&[vk::AccelerationStructureBuildRangeInfoKHR]> =
            ranges.iter().map(Vec::as_slice).collect();

        // SAFETY: `cmd` is recording; every info has a range slice of the same geometry count.
        unsafe { self.loader.cmd_build_acceleration_structures(cmd, &infos, &range_refs) };
    }

    fn begin_one_shot(&self) -> Result<vk::CommandBuffer> {
        self.commands.begin_single_time()
    }

    fn end_one_shot(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.commands.end_single_time(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_size_follows_mode() {
        let sizes = StructureSizeInfo {
            acceleration_structure_size: 1024,
            build_scratch_size: 512,
            update_scratch_size: 128,
        };
        assert_eq!(sizes.scratch_size(BuildMode::Build), 512);
        assert_eq!(sizes.scratch_size(BuildMode::Update), 128);
    }
}
