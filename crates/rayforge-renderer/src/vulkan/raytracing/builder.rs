//! Single acceleration-structure builds.
//!
//! A builder accumulates geometry, selects build or update mode, queries
//! sizes, gets storage (its own buffers or a region of a batch's), and
//! finally creates the structure object and records its build command.
//! Each step checks that the previous one happened; calling them out of order
//! is an [`RenderError::InvalidUsage`].

use ash::vk;
use gpu_allocator::MemoryLocation;

use super::align::{is_aligned, ACCELERATION_STRUCTURE_ALIGNMENT, INSTANCE_BUFFER_ALIGNMENT};
use super::device::{AccelerationDevice, BuildCommand, StructureSizeInfo};
use super::instance::{serialize_instances, InstanceRecord, RtInstance};
use crate::error::{RenderError, Result};
use crate::vulkan::{Buffer, BufferDesc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StructureKind {
    BottomLevel,
    TopLevel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BuildMode {
    #[default]
    Build,
    /// Refit an existing structure built with `ALLOW_UPDATE`.
    Update,
}

/// Indexed triangle geometry: `R32G32B32_SFLOAT` positions, `u32` indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriangleGeometry {
    pub vertex_address: vk::DeviceAddress,
    pub vertex_stride: vk::DeviceSize,
    pub vertex_count: u32,
    pub index_address: vk::DeviceAddress,
    pub index_count: u32,
    pub opaque: bool,
}

impl TriangleGeometry {
    /// Zero-primitive geometry reserving a structure that will later be
    /// updated with real triangles.
    pub fn placeholder() -> Self {
        Self {
            vertex_address: 0,
            vertex_stride: 12,
            vertex_count: 0,
            index_address: 0,
            index_count: 0,
            opaque: true,
        }
    }

    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }
}

/// Instance buffer input of a top-level structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceGeometry {
    /// Device address of tightly packed `VkAccelerationStructureInstanceKHR` records.
    pub address: vk::DeviceAddress,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureGeometry {
    Triangles(TriangleGeometry),
    Instances(InstanceGeometry),
}

impl StructureGeometry {
    pub fn primitive_count(&self) -> u32 {
        match self {
            StructureGeometry::Triangles(tri) => tri.triangle_count(),
            StructureGeometry::Instances(inst) => inst.count,
        }
    }
}

/// One bottom-level build input, as produced per mesh by the module graph.
#[derive(Debug, Clone, Copy)]
pub struct GeometryBuildRequest<'a> {
    pub name: &'a str,
    pub geometry: TriangleGeometry,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub mode: BuildMode,
    /// Required in update mode, ignored otherwise.
    pub source: Option<&'a BuiltStructure>,
}

/// Backing memory of a built structure.
#[derive(Debug)]
pub enum StructureStorage {
    /// The structure owns its buffer.
    Owned(Buffer),
    /// A region of a buffer owned by a batch.
    Shared {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    },
}

/// A created acceleration structure.
///
/// The device address is resolved once, right after creation. Destroying the
/// structure is only valid once every frame that referenced that address has
/// completed.
#[derive(Debug)]
pub struct BuiltStructure {
    handle: vk::AccelerationStructureKHR,
    kind: StructureKind,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    geometry_count: usize,
    device_address: vk::DeviceAddress,
    storage: StructureStorage,
}

impl BuiltStructure {
    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }

    pub fn kind(&self) -> StructureKind {
        self.kind
    }

    pub fn flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        self.flags
    }

    pub fn geometry_count(&self) -> usize {
        self.geometry_count
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    pub fn storage(&self) -> &StructureStorage {
        &self.storage
    }

    pub fn allows_update(&self) -> bool {
        self.flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE)
    }

    /// Destroy the structure object, and its storage buffer if it owns one.
    /// Shared storage is released by the batch that allocated it.
    ///
    /// # Safety
    /// No pending GPU work may reference the structure or its storage.
    pub unsafe fn destroy<D: AccelerationDevice + ?Sized>(self, device: &D) {
        device.destroy_acceleration_structure(self.handle);
        if let StructureStorage::Owned(buffer) = self.storage {
            device.destroy_buffer(buffer);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct UpdateSource {
    handle: vk::AccelerationStructureKHR,
    geometry_count: usize,
}

/// Builds one bottom- or top-level acceleration structure.
pub struct AccelerationStructureBuilder {
    name: String,
    kind: StructureKind,
    geometries: Vec<StructureGeometry>,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    mode: BuildMode,
    source: Option<UpdateSource>,
    sizes: Option<StructureSizeInfo>,
    /// Storage buffer and offset the structure will be created in.
    region: Option<(vk::Buffer, vk::DeviceSize)>,
    storage: Option<Buffer>,
    scratch: Option<Buffer>,
    scratch_address: Option<vk::DeviceAddress>,
    instance_buffer: Option<Buffer>,
    dst: Option<vk::AccelerationStructureKHR>,
}

impl AccelerationStructureBuilder {
    pub fn new(kind: StructureKind, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            geometries: Vec::new(),
            flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            mode: BuildMode::Build,
            source: None,
            sizes: None,
            region: None,
            storage: None,
            scratch: None,
            scratch_address: None,
            instance_buffer: None,
            dst: None,
        }
    }

    pub fn bottom_level(name: impl Into<String>) -> Self {
        Self::new(StructureKind::BottomLevel, name)
    }

    pub fn top_level(name: impl Into<String>) -> Self {
        Self::new(StructureKind::TopLevel, name)
    }

    /// Bottom-level builder over zero-primitive geometry, built updatable so
    /// real triangles can be refit into it later.
    pub fn placeholder(name: impl Into<String>) -> Self {
        let mut builder = Self::bottom_level(name);
        builder.geometries.push(StructureGeometry::Triangles(TriangleGeometry::placeholder()));
        builder.flags |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;
        builder
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StructureKind {
        self.kind
    }

    pub fn mode(&self) -> BuildMode {
        self.mode
    }

    pub fn flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        self.flags
    }

    pub fn geometries(&self) -> &[StructureGeometry] {
        &self.geometries
    }

    /// Sizes from the last `query_size_info`, if still valid.
    pub fn size_info(&self) -> Option<StructureSizeInfo> {
        self.sizes
    }

    pub fn scratch_address(&self) -> Option<vk::DeviceAddress> {
        self.scratch_address
    }

    /// Storage buffer and byte offset the structure is (or will be) created at.
    pub fn storage_region(&self) -> Option<(vk::Buffer, vk::DeviceSize)> {
        self.region
    }

    fn ensure_unallocated(&self) -> Result<()> {
        if self.region.is_some() {
            return Err(RenderError::InvalidUsage("build description changed after buffers were assigned"));
        }
        Ok(())
    }

    /// Add a triangle geometry. Bottom-level only.
    pub fn define_geometry(&mut self, geometry: TriangleGeometry) -> Result<()> {
        self.ensure_unallocated()?;
        if self.kind != StructureKind::BottomLevel {
            return Err(RenderError::InvalidUsage("triangle geometry on a top-level structure"));
        }
        self.geometries.push(StructureGeometry::Triangles(geometry));
        self.sizes = None;
        Ok(())
    }

    /// Set the instance buffer. Top-level only, and only once.
    pub fn define_instances(&mut self, instances: InstanceGeometry) -> Result<()> {
        self.ensure_unallocated()?;
        if self.kind != StructureKind::TopLevel {
            return Err(RenderError::InvalidUsage("instance geometry on a bottom-level structure"));
        }
        if !self.geometries.is_empty() {
            return Err(RenderError::InvalidUsage("top-level structure already has an instance buffer"));
        }
        self.geometries.push(StructureGeometry::Instances(instances));
        self.sizes = None;
        Ok(())
    }

    /// Serialize `records` into a host-visible instance buffer owned by this
    /// builder and define it as the instance geometry.
    pub fn define_instance_records<D: AccelerationDevice + ?Sized>(
        &mut self,
        device: &D,
        records: &[InstanceRecord],
    ) -> Result<()> {
        self.ensure_unallocated()?;
        if self.kind != StructureKind::TopLevel {
            return Err(RenderError::InvalidUsage("instance geometry on a bottom-level structure"));
        }
        if !self.geometries.is_empty() {
            return Err(RenderError::InvalidUsage("top-level structure already has an instance buffer"));
        }

        let count = instance_count(records.len())?;
        let bytes = serialize_instances(records);
        let size = (bytes.len() as vk::DeviceSize).max(std::mem::size_of::<RtInstance>() as vk::DeviceSize);
        let name = format!("{}_instances", self.name);

        let buffer = device.create_buffer(&BufferDesc {
            size,
            usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: MemoryLocation::CpuToGpu,
            alignment: INSTANCE_BUFFER_ALIGNMENT,
            name: &name,
        })?;

        let address = match device.write_buffer(&buffer, &bytes).and_then(|()| buffer.address()) {
            Ok(address) => address,
            Err(e) => {
                // SAFETY: the buffer was never handed to the GPU.
                unsafe { device.destroy_buffer(buffer) };
                return Err(e);
            }
        };

        self.geometries.push(StructureGeometry::Instances(InstanceGeometry {
            address,
            count,
        }));
        self.instance_buffer = Some(buffer);
        self.sizes = None;
        Ok(())
    }

    /// Select a full build with `flags`.
    pub fn define_build_property(&mut self, flags: vk::BuildAccelerationStructureFlagsKHR) -> Result<()> {
        self.ensure_unallocated()?;
        self.flags = flags;
        self.mode = BuildMode::Build;
        self.source = None;
        self.sizes = None;
        Ok(())
    }

    /// Select an update of `source`.
    ///
    /// The source must be the same kind of structure, built with
    /// `ALLOW_UPDATE` and the same flags. Its geometry count is checked
    /// against this builder's at `query_size_info`.
    pub fn define_update_property(
        &mut self,
        flags: vk::BuildAccelerationStructureFlagsKHR,
        source: &BuiltStructure,
    ) -> Result<()> {
        self.ensure_unallocated()?;
        if source.kind() != self.kind {
            return Err(RenderError::InvalidUsage("update source is a different kind of structure"));
        }
        if !source.allows_update() {
            return Err(RenderError::InvalidUsage("update source was not built with ALLOW_UPDATE"));
        }
        let flags = flags | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;
        if flags != source.flags() {
            return Err(RenderError::InvalidUsage("update flags differ from the source structure's build flags"));
        }

        self.flags = flags;
        self.mode = BuildMode::Update;
        self.source = Some(UpdateSource {
            handle: source.handle(),
            geometry_count: source.geometry_count(),
        });
        self.sizes = None;
        Ok(())
    }

    /// Query storage and scratch sizes for the current description.
    pub fn query_size_info<D: AccelerationDevice + ?Sized>(&mut self, device: &D) -> Result<StructureSizeInfo> {
        if self.geometries.is_empty() {
            return Err(RenderError::InvalidUsage("query_size_info called with no geometry defined"));
        }
        if let Some(source) = self.source {
            if source.geometry_count != self.geometries.len() {
                return Err(RenderError::InvalidUsage("update geometry does not match the source structure's topology"));
            }
        }

        let mut sizes = device.build_sizes(self.kind, self.flags, &self.geometries);
        // The structure header still needs space when there are no primitives.
        if sizes.acceleration_structure_size == 0 {
            sizes.acceleration_structure_size = ACCELERATION_STRUCTURE_ALIGNMENT;
        }

        log::debug!(
            "AS '{}' sizes: storage {}, build scratch {}, update scratch {}",
            self.name, sizes.acceleration_structure_size, sizes.build_scratch_size, sizes.update_scratch_size
        );

        self.sizes = Some(sizes);
        Ok(sizes)
    }

    fn require_sizes(&self, message: &'static str) -> Result<StructureSizeInfo> {
        self.sizes.ok_or(RenderError::InvalidUsage(message))
    }

    /// Scratch bytes for the selected mode. Requires `query_size_info`.
    pub fn scratch_size(&self) -> Result<vk::DeviceSize> {
        Ok(self.require_sizes("scratch_size called before query_size_info")?.scratch_size(self.mode))
    }

    /// Allocate a dedicated storage buffer and scratch buffer.
    pub fn allocate_buffers<D: AccelerationDevice + ?Sized>(&mut self, device: &D) -> Result<()> {
        let sizes = self.require_sizes("allocate_buffers called before query_size_info")?;
        if self.region.is_some() {
            return Err(RenderError::InvalidUsage("buffers already assigned to this builder"));
        }

        let storage_name = format!("{}_storage", self.name);
        let storage = device.create_buffer(&storage_desc(sizes.acceleration_structure_size, &storage_name))?;

        let scratch_name = format!("{}_scratch", self.name);
        let scratch = device.create_buffer(&scratch_desc(
            sizes.scratch_size(self.mode),
            device.min_scratch_alignment(),
            &scratch_name,
        ));

        // SAFETY (both arms): neither buffer has been used by the GPU.
        let scratch = match scratch {
            Ok(scratch) => scratch,
            Err(e) => {
                unsafe { device.destroy_buffer(storage) };
                return Err(e);
            }
        };
        let scratch_address = match scratch.address() {
            Ok(address) => address,
            Err(e) => {
                unsafe {
                    device.destroy_buffer(scratch);
                    device.destroy_buffer(storage);
                }
                return Err(e);
            }
        };

        self.region = Some((storage.handle, 0));
        self.storage = Some(storage);
        self.scratch = Some(scratch);
        self.scratch_address = Some(scratch_address);
        Ok(())
    }

    /// Use a region of externally owned buffers instead of allocating.
    ///
    /// `storage_offset` must be a multiple of
    /// [`ACCELERATION_STRUCTURE_ALIGNMENT`]; the region must hold at least the
    /// queried storage size, and `scratch_address` the scratch size for the
    /// selected mode.
    pub fn use_external_region(
        &mut self,
        storage_buffer: vk::Buffer,
        storage_offset: vk::DeviceSize,
        scratch_address: vk::DeviceAddress,
    ) -> Result<()> {
        self.require_sizes("external region assigned before query_size_info")?;
        if self.region.is_some() {
            return Err(RenderError::InvalidUsage("buffers already assigned to this builder"));
        }
        if !is_aligned(storage_offset, ACCELERATION_STRUCTURE_ALIGNMENT) {
            return Err(RenderError::InvalidUsage("structure storage offset is not 256-byte aligned"));
        }

        self.region = Some((storage_buffer, storage_offset));
        self.scratch_address = Some(scratch_address);
        Ok(())
    }

    /// Create the structure object in the assigned storage without recording
    /// a build.
    pub fn create_structure<D: AccelerationDevice + ?Sized>(&mut self, device: &D) -> Result<BuiltStructure> {
        let sizes = self.require_sizes("create_structure called before query_size_info")?;
        let (buffer, offset) = self.region
            .ok_or(RenderError::InvalidUsage("create_structure called before buffers were assigned"))?;
        if self.dst.is_some() {
            return Err(RenderError::InvalidUsage("structure already created from this builder"));
        }

        let handle = device
            .create_acceleration_structure(self.kind, buffer, offset, sizes.acceleration_structure_size)
            .inspect_err(|e| log::error!("Failed to create acceleration structure '{}': {}", self.name, e))?;

        // Resolved exactly once; the structure never moves.
        let device_address = device.acceleration_structure_address(handle);
        self.dst = Some(handle);

        let storage = match self.storage.take() {
            Some(owned) => StructureStorage::Owned(owned),
            None => StructureStorage::Shared { buffer, offset },
        };

        Ok(BuiltStructure {
            handle,
            kind: self.kind,
            flags: self.flags,
            geometry_count: self.geometries.len(),
            device_address,
            storage,
        })
    }

    /// Build command for the structure created by `create_structure`.
    pub fn build_command(&self) -> Result<BuildCommand<'_>> {
        let dst = self.dst
            .ok_or(RenderError::InvalidUsage("build recorded before the structure was created"))?;
        let scratch_address = self.scratch_address
            .ok_or(RenderError::InvalidUsage("build recorded without scratch memory"))?;

        Ok(BuildCommand {
            kind: self.kind,
            flags: self.flags,
            mode: self.mode,
            src: self.source.map_or(vk::AccelerationStructureKHR::null(), |source| source.handle),
            dst,
            geometries: &self.geometries,
            scratch_address,
        })
    }

    /// Take back a structure whose build never reached the GPU.
    ///
    /// The structure object is destroyed, owned storage returns to the
    /// builder, and `build_command` fails until the structure is created
    /// again.
    ///
    /// # Safety
    /// No submitted GPU work may reference the structure.
    pub(super) unsafe fn discard_structure<D: AccelerationDevice + ?Sized>(&mut self, device: &D, built: BuiltStructure) {
        let ours = self.dst == Some(built.handle);
        if ours {
            self.dst = None;
        }
        device.destroy_acceleration_structure(built.handle);
        if let StructureStorage::Owned(buffer) = built.storage {
            if ours && self.storage.is_none() {
                self.storage = Some(buffer);
            } else {
                device.destroy_buffer(buffer);
            }
        }
    }

    /// Create the structure and record its build into `cmd`.
    pub fn build<D: AccelerationDevice + ?Sized>(&mut self, device: &D, cmd: vk::CommandBuffer) -> Result<BuiltStructure> {
        let built = self.create_structure(device)?;
        let recorded = self.build_command()
            .map(|command| device.cmd_build_acceleration_structures(cmd, &[command]));
        if let Err(e) = recorded {
            // SAFETY: nothing was recorded against the structure.
            unsafe { self.discard_structure(device, built) };
            return Err(e);
        }
        Ok(built)
    }

    /// Create, record into a one-shot command buffer, submit and wait.
    pub fn build_and_submit<D: AccelerationDevice + ?Sized>(&mut self, device: &D) -> Result<BuiltStructure> {
        let cmd = device.begin_one_shot()?;

        let built = match self.build(device, cmd) {
            Ok(built) => built,
            Err(e) => {
                if let Err(end_err) = device.end_one_shot(cmd) {
                    log::warn!("Failed to retire one-shot command buffer: {}", end_err);
                }
                return Err(e);
            }
        };

        if let Err(e) = device.end_one_shot(cmd) {
            // SAFETY: the submission failed, so the GPU never saw the structure.
            unsafe { self.discard_structure(device, built) };
            return Err(e);
        }

        Ok(built)
    }

    /// Free the builder's scratch and instance buffers, and its storage if no
    /// structure took ownership of it.
    ///
    /// # Safety
    /// The build command must have completed on the GPU.
    pub unsafe fn release<D: AccelerationDevice + ?Sized>(mut self, device: &D) {
        for buffer in [self.scratch.take(), self.instance_buffer.take(), self.storage.take()].into_iter().flatten() {
            device.destroy_buffer(buffer);
        }
    }
}

impl TryFrom<&GeometryBuildRequest<'_>> for AccelerationStructureBuilder {
    type Error = RenderError;

    fn try_from(request: &GeometryBuildRequest<'_>) -> Result<Self> {
        let mut builder = Self::bottom_level(request.name);
        builder.define_geometry(request.geometry)?;
        match (request.mode, request.source) {
            (BuildMode::Build, _) => builder.define_build_property(request.flags)?,
            (BuildMode::Update, Some(source)) => builder.define_update_property(request.flags, source)?,
            (BuildMode::Update, None) => {
                return Err(RenderError::InvalidUsage("update request without a source structure"));
            }
        }
        Ok(builder)
    }
}

/// Instance count of a top-level build; the API counts in `u32`.
fn instance_count(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| RenderError::InvalidUsage("more instance records than a top-level structure can hold"))
}

pub(super) fn storage_desc(size: vk::DeviceSize, name: &str) -> BufferDesc<'_> {
    BufferDesc {
        size,
        usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        location: MemoryLocation::GpuOnly,
        alignment: ACCELERATION_STRUCTURE_ALIGNMENT,
        name,
    }
}

/// Zero-sized buffers are invalid, so an empty scratch request still gets
/// one alignment unit.
pub(super) fn scratch_desc(size: vk::DeviceSize, alignment: vk::DeviceSize, name: &str) -> BufferDesc<'_> {
    BufferDesc {
        size: size.max(alignment).max(1),
        usage: vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        location: MemoryLocation::GpuOnly,
        alignment,
        name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vulkan::fakes::FakeAccelerationDevice;
    use ash::vk::Handle;

    fn triangles(count: u32) -> TriangleGeometry {
        TriangleGeometry {
            vertex_address: 0xA000,
            vertex_stride: 12,
            vertex_count: count * 3,
            index_address: 0xB000,
            index_count: count * 3,
            opaque: true,
        }
    }

    fn built_blas(device: &FakeAccelerationDevice, flags: vk::BuildAccelerationStructureFlagsKHR) -> BuiltStructure {
        let mut builder = AccelerationStructureBuilder::bottom_level("blas");
        builder.define_geometry(triangles(4)).unwrap();
        builder.define_build_property(flags).unwrap();
        builder.query_size_info(device).unwrap();
        builder.allocate_buffers(device).unwrap();
        builder.build_and_submit(device).unwrap()
    }

    // ============================================================
    // Call ordering
    // ============================================================

    #[test]
    fn test_query_without_geometry_rejected() {
        let device = FakeAccelerationDevice::new(128);
        let mut builder = AccelerationStructureBuilder::bottom_level("empty");
        assert!(matches!(builder.query_size_info(&device), Err(RenderError::InvalidUsage(_))));
    }

    #[test]
    fn test_allocate_before_query_rejected() {
        let device = FakeAccelerationDevice::new(128);
        let mut builder = AccelerationStructureBuilder::bottom_level("blas");
        builder.define_geometry(triangles(1)).unwrap();

        assert!(matches!(builder.allocate_buffers(&device), Err(RenderError::InvalidUsage(_))));
        assert!(device.created_buffers().is_empty());
    }

    #[test]
    fn test_build_before_allocate_rejected() {
        let device = FakeAccelerationDevice::new(128);
        let mut builder = AccelerationStructureBuilder::bottom_level("blas");
        builder.define_geometry(triangles(1)).unwrap();
        builder.query_size_info(&device).unwrap();

        assert!(matches!(builder.build_and_submit(&device), Err(RenderError::InvalidUsage(_))));
        assert!(device.created_structures().is_empty());
    }

    #[test]
    fn test_geometry_change_invalidates_sizes() {
        let device = FakeAccelerationDevice::new(128);
        let mut builder = AccelerationStructureBuilder::bottom_level("blas");
        builder.define_geometry(triangles(1)).unwrap();
        builder.query_size_info(&device).unwrap();
        builder.define_geometry(triangles(2)).unwrap();

        assert!(builder.size_info().is_none());
        assert!(matches!(builder.allocate_buffers(&device), Err(RenderError::InvalidUsage(_))));
    }

    #[test]
    fn test_geometry_kind_checked() {
        let device = FakeAccelerationDevice::new(128);
        let mut blas = AccelerationStructureBuilder::bottom_level("blas");
        let mut tlas = AccelerationStructureBuilder::top_level("tlas");

        assert!(blas.define_instances(InstanceGeometry { address: 0x100, count: 1 }).is_err());
        assert!(blas.define_instance_records(&device, &[]).is_err());
        assert!(tlas.define_geometry(triangles(1)).is_err());
    }

    // ============================================================
    // Build
    // ============================================================

    #[test]
    fn test_build_and_submit_blas() {
        let device = FakeAccelerationDevice::new(128);
        let mut builder = AccelerationStructureBuilder::bottom_level("mesh");
        builder.define_geometry(triangles(10)).unwrap();
        let sizes = builder.query_size_info(&device).unwrap();
        builder.allocate_buffers(&device).unwrap();
        let blas = builder.build_and_submit(&device).unwrap();

        let buffers = device.created_buffers();
        assert_eq!(buffers.len(), 2);
        let storage = &buffers[0];
        let scratch = &buffers[1];
        assert_eq!(storage.size, sizes.acceleration_structure_size);
        assert_eq!(storage.alignment, ACCELERATION_STRUCTURE_ALIGNMENT);
        assert!(storage.usage.contains(vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR));
        assert_eq!(scratch.size, sizes.build_scratch_size);
        assert_eq!(scratch.alignment, 128);

        let calls = device.build_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 1);
        let build = &calls[0][0];
        assert_eq!(build.mode, BuildMode::Build);
        assert_eq!(build.dst, blas.handle());
        assert_eq!(build.src, vk::AccelerationStructureKHR::null());
        assert_eq!(build.scratch_address, scratch.address);
        assert_eq!(build.primitive_counts, vec![10]);

        assert_eq!(blas.device_address(), storage.address);
        assert_eq!(device.one_shots_submitted(), 1);
        assert!(matches!(blas.storage(), StructureStorage::Owned(_)));
    }

    #[test]
    fn test_device_address_resolved_once() {
        let device = FakeAccelerationDevice::new(128);
        let blas = built_blas(&device, vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE);
        for _ in 0..5 {
            assert_ne!(blas.device_address(), 0);
        }
        assert_eq!(device.address_queries(), 1);
    }

    #[test]
    fn test_record_into_caller_command_buffer() {
        let device = FakeAccelerationDevice::new(128);
        let mut builder = AccelerationStructureBuilder::bottom_level("frame-blas");
        builder.define_geometry(triangles(3)).unwrap();
        builder.query_size_info(&device).unwrap();
        builder.allocate_buffers(&device).unwrap();

        let cmd = vk::CommandBuffer::from_raw(0xC0FFEE);
        builder.build(&device, cmd).unwrap();

        assert_eq!(device.build_command_buffers(), vec![cmd]);
        assert_eq!(device.one_shots_submitted(), 0);
    }

    #[test]
    fn test_creation_failure_is_fatal() {
        let device = FakeAccelerationDevice::new(128);
        device.fail_creation_at(0);

        let mut builder = AccelerationStructureBuilder::bottom_level("doomed");
        builder.define_geometry(triangles(1)).unwrap();
        builder.query_size_info(&device).unwrap();
        builder.allocate_buffers(&device).unwrap();

        let err = builder.build_and_submit(&device).unwrap_err();
        assert!(matches!(err, RenderError::StructureCreation(_)));
        assert!(err.is_fatal());
        assert!(device.build_calls().is_empty());
    }

    #[test]
    fn test_failed_submit_discards_structure() {
        let device = FakeAccelerationDevice::new(128);
        let mut builder = AccelerationStructureBuilder::bottom_level("blas");
        builder.define_geometry(triangles(2)).unwrap();
        builder.query_size_info(&device).unwrap();
        builder.allocate_buffers(&device).unwrap();
        device.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);

        let err = builder.build_and_submit(&device).unwrap_err();
        assert!(matches!(err, RenderError::Vulkan { result: vk::Result::ERROR_DEVICE_LOST, .. }));
        let first = device.created_structures()[0].handle;
        assert_eq!(device.destroyed_structures(), vec![first]);
        assert!(matches!(builder.build_command(), Err(RenderError::InvalidUsage(_))));
        // The storage buffer went back to the builder instead of being freed.
        assert!(device.destroyed_buffers().is_empty());

        let blas = builder.build_and_submit(&device).unwrap();
        assert_ne!(blas.handle(), first);
        assert_eq!(builder.build_command().unwrap().dst, blas.handle());

        unsafe {
            builder.release(&device);
            blas.destroy(&device);
        }
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_release_and_destroy_free_everything() {
        let device = FakeAccelerationDevice::new(128);
        let mut builder = AccelerationStructureBuilder::bottom_level("blas");
        builder.define_geometry(triangles(2)).unwrap();
        builder.query_size_info(&device).unwrap();
        builder.allocate_buffers(&device).unwrap();
        let blas = builder.build_and_submit(&device).unwrap();
        let handle = blas.handle();

        unsafe {
            builder.release(&device);
            blas.destroy(&device);
        }

        assert_eq!(device.destroyed_buffers().len(), 2);
        assert_eq!(device.destroyed_structures(), vec![handle]);
    }

    // ============================================================
    // Placeholder and update mode
    // ============================================================

    #[test]
    fn test_placeholder_sizes_are_not_degenerate() {
        let device = FakeAccelerationDevice::new(128);
        device.script_sizes(&[StructureSizeInfo::default()]);

        let mut builder = AccelerationStructureBuilder::placeholder("slot");
        let sizes = builder.query_size_info(&device).unwrap();
        assert_eq!(sizes.acceleration_structure_size, ACCELERATION_STRUCTURE_ALIGNMENT);

        builder.allocate_buffers(&device).unwrap();
        let buffers = device.created_buffers();
        // Zero scratch still gets one alignment unit.
        assert_eq!(buffers[1].size, 128);

        let blas = builder.build_and_submit(&device).unwrap();
        assert_eq!(device.build_calls()[0][0].primitive_counts, vec![0]);
        assert!(blas.allows_update());
    }

    #[test]
    fn test_placeholder_update_with_real_geometry() {
        let device = FakeAccelerationDevice::new(128);
        let mut placeholder = AccelerationStructureBuilder::placeholder("slot");
        placeholder.query_size_info(&device).unwrap();
        placeholder.allocate_buffers(&device).unwrap();
        let source = placeholder.build_and_submit(&device).unwrap();

        let request = GeometryBuildRequest {
            name: "slot-refit",
            geometry: triangles(8),
            flags: source.flags(),
            mode: BuildMode::Update,
            source: Some(&source),
        };
        let mut update = AccelerationStructureBuilder::try_from(&request).unwrap();
        let sizes = update.query_size_info(&device).unwrap();
        update.allocate_buffers(&device).unwrap();
        let refit = update.build_and_submit(&device).unwrap();

        assert_ne!(refit.device_address(), 0);
        let build = &device.build_calls()[1][0];
        assert_eq!(build.mode, BuildMode::Update);
        assert_eq!(build.src, source.handle());
        assert_eq!(build.dst, refit.handle());
        // Update mode allocates update scratch.
        assert_eq!(device.created_buffers()[3].size, sizes.update_scratch_size);
    }

    #[test]
    fn test_update_requires_updatable_source() {
        let device = FakeAccelerationDevice::new(128);
        let source = built_blas(&device, vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE);

        let mut builder = AccelerationStructureBuilder::bottom_level("refit");
        let result = builder.define_update_property(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE, &source);
        assert!(matches!(result, Err(RenderError::InvalidUsage(_))));
    }

    #[test]
    fn test_update_requires_same_topology() {
        let device = FakeAccelerationDevice::new(128);
        let flags = vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
            | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;
        let source = built_blas(&device, flags);

        let mut tlas = AccelerationStructureBuilder::top_level("tlas");
        assert!(tlas.define_update_property(flags, &source).is_err());

        let mut builder = AccelerationStructureBuilder::bottom_level("refit");
        builder.define_geometry(triangles(1)).unwrap();
        builder.define_geometry(triangles(1)).unwrap();
        builder.define_update_property(flags, &source).unwrap();
        assert!(matches!(builder.query_size_info(&device), Err(RenderError::InvalidUsage(_))));
    }

    #[test]
    fn test_update_request_without_source_rejected() {
        let request = GeometryBuildRequest {
            name: "orphan",
            geometry: triangles(1),
            flags: vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE,
            mode: BuildMode::Update,
            source: None,
        };
        assert!(AccelerationStructureBuilder::try_from(&request).is_err());
    }

    // ============================================================
    // Top-level
    // ============================================================

    #[test]
    fn test_tlas_from_instance_records() {
        let device = FakeAccelerationDevice::new(128);
        let flags = vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
        let blas_a = built_blas(&device, flags);
        let blas_b = built_blas(&device, flags);
        let records = [
            InstanceRecord::new(&blas_a),
            InstanceRecord::new(&blas_b).with_custom_index(1),
            InstanceRecord::new(&blas_a).with_custom_index(2),
        ];

        let mut tlas = AccelerationStructureBuilder::top_level("scene");
        tlas.define_instance_records(&device, &records).unwrap();
        tlas.query_size_info(&device).unwrap();
        tlas.allocate_buffers(&device).unwrap();
        let built = tlas.build_and_submit(&device).unwrap();

        let instance_buffer = device.created_buffers()
            .into_iter()
            .find(|buffer| buffer.name == "scene_instances")
            .unwrap();
        assert_eq!(instance_buffer.alignment, INSTANCE_BUFFER_ALIGNMENT);
        assert_eq!(device.written_bytes(instance_buffer.handle), Some(serialize_instances(&records)));

        let build = device.build_calls().last().unwrap()[0].clone();
        assert_eq!(build.kind, StructureKind::TopLevel);
        assert_eq!(build.primitive_counts, vec![3]);
        assert_eq!(tlas.geometries(), &[StructureGeometry::Instances(InstanceGeometry {
            address: instance_buffer.address,
            count: 3,
        })]);
        assert_eq!(built.kind(), StructureKind::TopLevel);
    }

    #[test]
    fn test_instance_count_must_fit_u32() {
        assert_eq!(instance_count(3).unwrap(), 3);
        assert_eq!(instance_count(u32::MAX as usize).unwrap(), u32::MAX);
        if cfg!(target_pointer_width = "64") {
            let too_many = (u32::MAX as u64 + 1) as usize;
            assert!(matches!(instance_count(too_many), Err(RenderError::InvalidUsage(_))));
        }
    }

    #[test]
    fn test_second_instance_buffer_rejected() {
        let device = FakeAccelerationDevice::new(128);
        let mut tlas = AccelerationStructureBuilder::top_level("scene");
        tlas.define_instances(InstanceGeometry { address: 0x4000, count: 2 }).unwrap();
        assert!(tlas.define_instances(InstanceGeometry { address: 0x5000, count: 2 }).is_err());
        assert!(tlas.define_instance_records(&device, &[]).is_err());
    }
}
