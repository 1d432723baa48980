//! Alignment helpers for acceleration-structure storage and scratch memory.

use ash::vk;

/// Required alignment of an acceleration structure's offset within its
/// backing buffer. Fixed by the API, unlike the device-reported scratch
/// alignment.
pub const ACCELERATION_STRUCTURE_ALIGNMENT: vk::DeviceSize = 256;

/// Required alignment of the instance buffer handed to a top-level build.
pub const INSTANCE_BUFFER_ALIGNMENT: vk::DeviceSize = 16;

/// Round `value` up to the next multiple of `alignment`.
///
/// An alignment of zero or one leaves the value unchanged.
#[inline]
pub fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

#[inline]
pub fn is_aligned(value: vk::DeviceSize, alignment: vk::DeviceSize) -> bool {
    alignment <= 1 || value % alignment == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(90, 64), 128);
    }

    #[test]
    fn test_degenerate_alignment() {
        assert_eq!(align_up(37, 0), 37);
        assert_eq!(align_up(37, 1), 37);
        assert!(is_aligned(37, 0));
    }

    #[test]
    fn test_is_aligned() {
        assert!(is_aligned(512, ACCELERATION_STRUCTURE_ALIGNMENT));
        assert!(!is_aligned(100, ACCELERATION_STRUCTURE_ALIGNMENT));
        assert!(is_aligned(48, INSTANCE_BUFFER_ALIGNMENT));
    }
}
