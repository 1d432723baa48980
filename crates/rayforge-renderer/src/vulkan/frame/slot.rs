//! Frame slots: one per presentable image.

use ash::vk;

/// Where a slot is in its frame cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    /// Never acquired.
    Idle,
    /// Handed to the caller by `acquire`; commands are being recorded.
    Recording,
    /// Commands submitted; the fence will signal when the GPU is done.
    Submitted,
    /// Present request queued.
    Presented,
}

/// The caller's view of an acquired frame slot.
///
/// This is a copy of the slot's handles at acquisition time. `serial`
/// identifies the frame, so a stale copy from an earlier cycle is rejected
/// by `submit` and `present`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    /// Presentable image index; also the slot index.
    pub index: u32,
    pub command_buffer: vk::CommandBuffer,
    pub image_acquired: vk::Semaphore,
    pub image_presented: vk::Semaphore,
    pub commands_finished: vk::Fence,
    pub serial: u64,
}

/// Scheduler-owned state of one slot.
#[derive(Debug)]
pub(super) struct SlotRecord {
    pub command_buffer: vk::CommandBuffer,
    pub image_presented: vk::Semaphore,
    pub commands_finished: vk::Fence,
    /// Reassigned every cycle from the semaphore pool.
    pub image_acquired: Option<vk::Semaphore>,
    pub phase: FramePhase,
    /// Serial of the frame currently using the slot.
    pub serial: u64,
    /// Serial submitted on this slot whose fence has not been observed yet.
    pub pending_serial: Option<u64>,
}

impl SlotRecord {
    pub fn new(command_buffer: vk::CommandBuffer, image_presented: vk::Semaphore, commands_finished: vk::Fence) -> Self {
        Self {
            command_buffer,
            image_presented,
            commands_finished,
            image_acquired: None,
            phase: FramePhase::Idle,
            serial: 0,
            pending_serial: None,
        }
    }

    pub fn view(&self, index: u32) -> Option<FrameSlot> {
        Some(FrameSlot {
            index,
            command_buffer: self.command_buffer,
            image_acquired: self.image_acquired?,
            image_presented: self.image_presented,
            commands_finished: self.commands_finished,
            serial: self.serial,
        })
    }
}
