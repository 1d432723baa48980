//! Acceleration-structure builds via `VK_KHR_acceleration_structure`.
//!
//! Single builds go through [`AccelerationStructureBuilder`]; many
//! bottom-level builds in one frame go through
//! [`AccelerationStructureBatchBuilder`], which packs them into one storage
//! buffer and one scratch buffer.

pub mod align;
pub mod batch;
pub mod builder;
pub mod device;
pub mod instance;

pub use align::{align_up, ACCELERATION_STRUCTURE_ALIGNMENT};
pub use batch::{AccelerationStructureBatchBuilder, BatchOffsetTable};
pub use builder::{
    AccelerationStructureBuilder, BuildMode, BuiltStructure, GeometryBuildRequest, InstanceGeometry,
    StructureGeometry, StructureKind, StructureStorage, TriangleGeometry,
};
pub use device::{AccelerationDevice, BuildCommand, StructureSizeInfo, VulkanAccelerationDevice};
pub use instance::{serialize_instances, InstanceRecord, RtInstance, Transform, IDENTITY_TRANSFORM};
