//! Top-level instance records and their GPU layout.

use ash::vk;
use bytemuck::{Pod, Zeroable};

use super::builder::BuiltStructure;

/// Row-major 3x4 affine transform.
pub type Transform = [[f32; 4]; 3];

pub const IDENTITY_TRANSFORM: Transform = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
];

/// One placement of a bottom-level structure in a top-level structure.
///
/// Holds the BLAS by device address only. The caller keeps the BLAS alive
/// for as long as any TLAS built from this record may be traced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceRecord {
    pub transform: Transform,
    /// Low 24 bits are used.
    pub custom_index: u32,
    pub mask: u8,
    /// Low 24 bits are used.
    pub sbt_offset: u32,
    pub flags: vk::GeometryInstanceFlagsKHR,
    pub blas_address: vk::DeviceAddress,
}

impl InstanceRecord {
    /// Identity-transformed, fully visible instance of `blas`.
    pub fn new(blas: &BuiltStructure) -> Self {
        Self::from_address(blas.device_address())
    }

    pub fn from_address(blas_address: vk::DeviceAddress) -> Self {
        Self {
            transform: IDENTITY_TRANSFORM,
            custom_index: 0,
            mask: 0xFF,
            sbt_offset: 0,
            flags: vk::GeometryInstanceFlagsKHR::empty(),
            blas_address,
        }
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_custom_index(mut self, custom_index: u32) -> Self {
        self.custom_index = custom_index;
        self
    }

    pub fn with_mask(mut self, mask: u8) -> Self {
        self.mask = mask;
        self
    }

    pub fn with_sbt_offset(mut self, offset: u32, flags: vk::GeometryInstanceFlagsKHR) -> Self {
        self.sbt_offset = offset;
        self.flags = flags;
        self
    }
}

/// `VkAccelerationStructureInstanceKHR` as laid out in the instance buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct RtInstance {
    pub transform: Transform,
    pub instance_custom_index_and_mask: u32,
    pub instance_shader_binding_table_record_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

impl From<&InstanceRecord> for RtInstance {
    fn from(record: &InstanceRecord) -> Self {
        Self {
            transform: record.transform,
            instance_custom_index_and_mask: ((record.mask as u32) << 24) | (record.custom_index & 0xFF_FFFF),
            instance_shader_binding_table_record_offset_and_flags:
                ((record.flags.as_raw() & 0xFF) << 24) | (record.sbt_offset & 0xFF_FFFF),
            acceleration_structure_reference: record.blas_address,
        }
    }
}

/// Serialize records in order into instance-buffer bytes.
pub fn serialize_instances(records: &[InstanceRecord]) -> Vec<u8> {
    let instances: Vec<RtInstance> = records.iter().map(RtInstance::from).collect();
    bytemuck::cast_slice(&instances).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_layout_matches_vulkan() {
        assert_eq!(std::mem::size_of::<RtInstance>(), 64);
        assert_eq!(
            std::mem::size_of::<RtInstance>(),
            std::mem::size_of::<vk::AccelerationStructureInstanceKHR>()
        );
    }

    #[test]
    fn test_packed_fields() {
        let record = InstanceRecord::from_address(0xDEAD_0000)
            .with_custom_index(0x0123_4567)
            .with_mask(0x0F)
            .with_sbt_offset(2, vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE);
        let instance = RtInstance::from(&record);

        // Custom index is truncated to 24 bits.
        assert_eq!(instance.instance_custom_index_and_mask, 0x0F23_4567);
        assert_eq!(instance.instance_shader_binding_table_record_offset_and_flags, 0x0100_0002);
        assert_eq!(instance.acceleration_structure_reference, 0xDEAD_0000);
    }

    #[test]
    fn test_serialized_order_preserves_blas_references() {
        let addresses = [0x1000u64, 0x2400, 0x0800, 0x9100];
        let records: Vec<_> = addresses.iter()
            .enumerate()
            .map(|(i, &addr)| InstanceRecord::from_address(addr).with_custom_index(i as u32))
            .collect();

        let bytes = serialize_instances(&records);
        assert_eq!(bytes.len(), records.len() * 64);

        let decoded: Vec<RtInstance> = bytes.chunks_exact(64)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        for (i, instance) in decoded.iter().enumerate() {
            assert_eq!(instance.acceleration_structure_reference, addresses[i]);
            assert_eq!(instance.instance_custom_index_and_mask & 0xFF_FFFF, i as u32);
        }
    }

    #[test]
    fn test_empty_instance_list() {
        assert!(serialize_instances(&[]).is_empty());
    }
}
