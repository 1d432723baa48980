//! Frame pipelining: keeps the CPU a bounded number of frames ahead of the GPU.
//!
//! Each presentable image owns one frame slot (command buffer, "image
//! presented" semaphore, "commands finished" fence). `acquire` blocks on the
//! slot's fence before handing it out, so anything recorded into or
//! referenced by the previous frame on that slot is safe to reuse.
//!
//! Acquisition semaphores cannot be tied to a slot up front because the image
//! index is only known after acquisition. They come from a [`SemaphorePool`]
//! instead and are bound to whichever slot the presentation engine returns.
//! One that was signaled but cannot be bound may still be pending, so it
//! never goes back to the pool; it is destroyed with the scheduler.

pub mod backend;
pub mod retire;
pub mod semaphore_pool;
pub mod slot;

pub use backend::{FrameBackend, FrameSubmission};
pub use retire::RetireQueue;
pub use semaphore_pool::SemaphorePool;
pub use slot::{FramePhase, FrameSlot};

use ash::vk;

use crate::error::{RenderError, Result};
use slot::SlotRecord;

/// Serializes CPU frame preparation against the GPU frames in flight.
pub struct FrameScheduler<B: FrameBackend> {
    backend: B,
    slots: Vec<SlotRecord>,
    semaphore_pool: SemaphorePool,
    /// Signaled by an acquire whose frame was abandoned.
    stranded: Vec<vk::Semaphore>,
    fence_timeout_ns: u64,
    /// Serial of the most recently acquired frame.
    serial: u64,
    /// Serial of the most recently submitted frame.
    last_submitted: u64,
}

impl<B: FrameBackend> FrameScheduler<B> {
    /// Create one slot per presentable image.
    ///
    /// `requested_frames` is only used for diagnostics: the slot count always
    /// follows `backend.image_count()`.
    pub fn new(backend: B, requested_frames: u32, fence_timeout_ns: u64) -> Result<Self> {
        let count = backend.image_count();
        if count == 0 {
            return Err(RenderError::InvalidUsage("presentation layer reported zero images"));
        }
        if count != requested_frames as usize {
            log::warn!("Requested {} frame slots, sizing to the {} images the platform returned", requested_frames, count);
        }

        let command_buffers = backend.allocate_command_buffers(count)?;
        let mut slots: Vec<SlotRecord> = Vec::with_capacity(count);

        for &command_buffer in &command_buffers {
            let sync = backend.create_semaphore().and_then(|semaphore| {
                // Created signaled so the first wait on each slot returns at once.
                match backend.create_fence(true) {
                    Ok(fence) => Ok((semaphore, fence)),
                    Err(e) => {
                        backend.destroy_semaphore(semaphore);
                        Err(e)
                    }
                }
            });

            match sync {
                Ok((image_presented, fence)) => slots.push(SlotRecord::new(command_buffer, image_presented, fence)),
                Err(e) => {
                    for slot in &slots {
                        backend.destroy_semaphore(slot.image_presented);
                        backend.destroy_fence(slot.commands_finished);
                    }
                    backend.free_command_buffers(&command_buffers);
                    return Err(e);
                }
            }
        }

        log::debug!("Frame scheduler ready with {} slots", count);

        Ok(Self {
            backend,
            slots,
            semaphore_pool: SemaphorePool::new(),
            stranded: Vec::new(),
            fence_timeout_ns,
            serial: 0,
            last_submitted: 0,
        })
    }

    /// Acquire the next presentable slot.
    ///
    /// Blocks until the GPU has finished the previous frame recorded on the
    /// returned slot. The slot's command buffer is reset and recording when
    /// this returns.
    pub fn acquire(&mut self) -> Result<FrameSlot> {
        let semaphore = self.semaphore_pool.acquire(&self.backend)?;

        let image_index = match self.backend.acquire_next_image(semaphore, self.fence_timeout_ns) {
            Ok(index) => index,
            Err(e) => {
                // Nothing was signaled, so the semaphore is still clean.
                self.semaphore_pool.release(semaphore);
                return Err(e);
            }
        };

        let slot_count = self.slots.len();
        let Some(slot) = self.slots.get_mut(image_index as usize) else {
            log::error!("Presentation engine returned image {} but only {} slots exist", image_index, slot_count);
            self.stranded.push(semaphore);
            return Err(RenderError::SurfaceOutOfDate(vk::Result::ERROR_OUT_OF_DATE_KHR));
        };

        if slot.phase == FramePhase::Recording {
            self.stranded.push(semaphore);
            return Err(RenderError::InvalidUsage("image acquired again before its previous frame was submitted"));
        }

        let fence = slot.commands_finished;
        let ready = self.backend.wait_for_fence(fence, self.fence_timeout_ns)
            .and_then(|()| self.backend.reset_fence(fence));
        if let Err(e) = ready {
            self.stranded.push(semaphore);
            return Err(e);
        }
        slot.pending_serial = None;

        if let Some(previous) = slot.image_acquired.replace(semaphore) {
            if previous != semaphore {
                self.semaphore_pool.release(previous);
            }
        }

        self.backend.begin_commands(slot.command_buffer)?;

        self.serial += 1;
        slot.serial = self.serial;
        slot.phase = FramePhase::Recording;

        slot.view(image_index)
            .ok_or(RenderError::InvalidUsage("slot has no acquisition semaphore"))
    }

    /// Submit the slot's recorded commands.
    ///
    /// The submission waits on the acquisition semaphore before any stage
    /// executes and signals the slot's "image presented" semaphore and fence.
    pub fn submit(&mut self, frame: &FrameSlot) -> Result<()> {
        let slot = checked_slot(&mut self.slots, frame, FramePhase::Recording)?;

        self.backend.end_commands(slot.command_buffer)?;

        // ALL_COMMANDS rather than TOP_OF_PIPE: as a destination stage,
        // TOP_OF_PIPE blocks nothing.
        self.backend.submit(&FrameSubmission {
            command_buffer: slot.command_buffer,
            wait_semaphore: frame.image_acquired,
            wait_stage: vk::PipelineStageFlags::ALL_COMMANDS,
            signal_semaphore: slot.image_presented,
            fence: slot.commands_finished,
        })?;

        slot.phase = FramePhase::Submitted;
        slot.pending_serial = Some(slot.serial);
        self.last_submitted = self.last_submitted.max(slot.serial);
        Ok(())
    }

    /// Present a submitted slot.
    ///
    /// Any result other than plain success is returned as
    /// [`RenderError::SurfaceOutOfDate`] and is not retried.
    pub fn present(&mut self, frame: &FrameSlot) -> Result<()> {
        let slot = checked_slot(&mut self.slots, frame, FramePhase::Submitted)?;
        slot.phase = FramePhase::Presented;
        self.backend.present(frame.index, slot.image_presented)
    }

    /// Highest serial S such that every submitted frame with serial <= S has
    /// had its fence observed signaled.
    pub fn completed_serial(&self) -> u64 {
        self.slots.iter()
            .filter_map(|slot| slot.pending_serial)
            .min()
            .map_or(self.last_submitted, |oldest| oldest - 1)
    }

    /// Serial of the most recently acquired frame.
    pub fn current_serial(&self) -> u64 {
        self.serial
    }

    /// Number of frame slots (equal to the actual presentable image count).
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn phase(&self, index: u32) -> Option<FramePhase> {
        self.slots.get(index as usize).map(|slot| slot.phase)
    }

    /// Acquisition semaphores created over the scheduler's lifetime.
    pub fn acquisition_semaphores_created(&self) -> usize {
        self.semaphore_pool.created()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Wait for the device to go idle, destroy every synchronization object
    /// and command buffer, and hand back the backend.
    pub fn destroy(mut self) -> B {
        if let Err(e) = self.backend.wait_idle() {
            log::warn!("Device wait idle failed during frame scheduler teardown: {}", e);
        }

        let command_buffers: Vec<_> = self.slots.iter().map(|slot| slot.command_buffer).collect();
        for slot in self.slots.drain(..) {
            self.backend.destroy_semaphore(slot.image_presented);
            self.backend.destroy_fence(slot.commands_finished);
            if let Some(semaphore) = slot.image_acquired {
                self.backend.destroy_semaphore(semaphore);
            }
        }
        self.backend.free_command_buffers(&command_buffers);
        for semaphore in self.stranded.drain(..) {
            self.backend.destroy_semaphore(semaphore);
        }
        self.semaphore_pool.destroy(&self.backend);

        self.backend
    }
}

fn checked_slot<'a>(slots: &'a mut [SlotRecord], frame: &FrameSlot, expected: FramePhase) -> Result<&'a mut SlotRecord> {
    let slot = slots.get_mut(frame.index as usize)
        .ok_or(RenderError::InvalidUsage("frame slot index out of range"))?;

    if slot.serial != frame.serial {
        return Err(RenderError::InvalidUsage("stale frame slot from an earlier cycle"));
    }
    if slot.phase != expected {
        return Err(match expected {
            FramePhase::Recording => RenderError::InvalidUsage("submit called on a frame that is not recording"),
            _ => RenderError::InvalidUsage("present called on a frame that was not submitted"),
        });
    }

    Ok(slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vulkan::fakes::FakeFrameBackend;
    use std::collections::HashSet;
    use std::time::{Duration, Instant};

    fn scheduler(images: usize) -> FrameScheduler<FakeFrameBackend> {
        FrameScheduler::new(FakeFrameBackend::new(images), 3, u64::MAX).unwrap()
    }

    fn run_frame(scheduler: &mut FrameScheduler<FakeFrameBackend>) -> FrameSlot {
        let frame = scheduler.acquire().unwrap();
        scheduler.submit(&frame).unwrap();
        scheduler.present(&frame).unwrap();
        frame
    }

    // ============================================================
    // Construction
    // ============================================================

    #[test]
    fn test_slots_follow_actual_image_count() {
        assert_eq!(scheduler(2).slot_count(), 2);
        assert_eq!(scheduler(3).slot_count(), 3);
        // More images than the 2..=3 range still gets one slot each.
        assert_eq!(scheduler(5).slot_count(), 5);
    }

    #[test]
    fn test_zero_images_rejected() {
        let result = FrameScheduler::new(FakeFrameBackend::new(0), 3, u64::MAX);
        assert!(matches!(result, Err(RenderError::InvalidUsage(_))));
    }

    #[test]
    fn test_new_slots_are_idle() {
        let scheduler = scheduler(3);
        for i in 0..3 {
            assert_eq!(scheduler.phase(i), Some(FramePhase::Idle));
        }
        assert_eq!(scheduler.phase(3), None);
    }

    // ============================================================
    // Frame cycle
    // ============================================================

    #[test]
    fn test_frame_cycle_phases() {
        let mut scheduler = scheduler(2);

        let frame = scheduler.acquire().unwrap();
        assert_eq!(scheduler.phase(frame.index), Some(FramePhase::Recording));

        scheduler.submit(&frame).unwrap();
        assert_eq!(scheduler.phase(frame.index), Some(FramePhase::Submitted));

        scheduler.present(&frame).unwrap();
        assert_eq!(scheduler.phase(frame.index), Some(FramePhase::Presented));
    }

    #[test]
    fn test_submission_wiring() {
        let mut scheduler = scheduler(2);
        let frame = run_frame(&mut scheduler);

        let submissions = scheduler.backend().submissions();
        assert_eq!(submissions.len(), 1);
        let submission = submissions[0];
        assert_eq!(submission.command_buffer, frame.command_buffer);
        assert_eq!(submission.wait_semaphore, frame.image_acquired);
        assert_eq!(submission.signal_semaphore, frame.image_presented);
        assert_eq!(submission.fence, frame.commands_finished);
        assert_eq!(submission.wait_stage, vk::PipelineStageFlags::ALL_COMMANDS);

        assert_eq!(scheduler.backend().presents(), vec![(frame.index, frame.image_presented)]);
    }

    #[test]
    fn test_acquire_follows_presentation_engine_order() {
        let backend = FakeFrameBackend::new(3);
        backend.script_images(&[2, 0, 1]);
        let mut scheduler = FrameScheduler::new(backend, 3, u64::MAX).unwrap();

        let order: Vec<u32> = (0..3).map(|_| run_frame(&mut scheduler).index).collect();
        assert_eq!(order, vec![2, 0, 1]);
    }

    #[test]
    fn test_serials_increase() {
        let mut scheduler = scheduler(2);
        let a = run_frame(&mut scheduler);
        let b = run_frame(&mut scheduler);
        assert_eq!(a.serial, 1);
        assert_eq!(b.serial, 2);
        assert_eq!(scheduler.current_serial(), 2);
    }

    // ============================================================
    // Contract violations
    // ============================================================

    #[test]
    fn test_present_before_submit_rejected() {
        let mut scheduler = scheduler(2);
        let frame = scheduler.acquire().unwrap();
        assert!(matches!(scheduler.present(&frame), Err(RenderError::InvalidUsage(_))));
    }

    #[test]
    fn test_double_submit_rejected() {
        let mut scheduler = scheduler(2);
        let frame = scheduler.acquire().unwrap();
        scheduler.submit(&frame).unwrap();
        assert!(matches!(scheduler.submit(&frame), Err(RenderError::InvalidUsage(_))));
    }

    #[test]
    fn test_stale_frame_rejected() {
        let mut scheduler = scheduler(2);
        let first = run_frame(&mut scheduler);
        run_frame(&mut scheduler);
        let reused = scheduler.acquire().unwrap();
        assert_eq!(reused.index, first.index);

        assert!(matches!(scheduler.submit(&first), Err(RenderError::InvalidUsage(_))));
        scheduler.submit(&reused).unwrap();
    }

    // ============================================================
    // Fence-gated reuse
    // ============================================================

    #[test]
    fn test_acquire_blocks_until_fence_signaled() {
        let latency = Duration::from_millis(60);
        let backend = FakeFrameBackend::new(2);
        backend.set_gpu_latency(latency);
        let mut scheduler = FrameScheduler::new(backend, 2, u64::MAX).unwrap();

        let first = scheduler.acquire().unwrap();
        let submitted_at = Instant::now();
        scheduler.submit(&first).unwrap();
        scheduler.present(&first).unwrap();

        run_frame(&mut scheduler);

        // Round-robin hands slot 0 back; its fence signals `latency` after submit.
        let again = scheduler.acquire().unwrap();
        assert_eq!(again.index, first.index);
        assert!(submitted_at.elapsed() >= latency);
        // The fake panics if a command buffer is begun while its fence is unsignaled.
        assert_eq!(again.command_buffer, first.command_buffer);
    }

    #[test]
    fn test_fence_timeout_is_error() {
        let backend = FakeFrameBackend::new(1);
        backend.set_gpu_latency(Duration::from_secs(30));
        let mut scheduler = FrameScheduler::new(backend, 2, 1_000_000).unwrap();

        run_frame(&mut scheduler);
        let err = scheduler.acquire().unwrap_err();
        assert!(matches!(err, RenderError::FenceTimeout));
        assert!(err.is_fatal());
    }

    // ============================================================
    // Semaphore pool closure
    // ============================================================

    fn assert_semaphore_ownership(scheduler: &FrameScheduler<FakeFrameBackend>) {
        let mut seen = HashSet::new();
        for slot in &scheduler.slots {
            if let Some(semaphore) = slot.image_acquired {
                assert!(seen.insert(semaphore), "semaphore bound to two slots");
            }
        }
        for &semaphore in scheduler.semaphore_pool.pooled() {
            assert!(seen.insert(semaphore), "semaphore both bound and pooled");
        }
        for &semaphore in &scheduler.stranded {
            assert!(seen.insert(semaphore), "stranded semaphore also bound or pooled");
        }
        assert_eq!(seen.len(), scheduler.acquisition_semaphores_created());
    }

    #[test]
    fn test_semaphore_pool_is_bounded() {
        for images in 2..=3usize {
            let mut scheduler = scheduler(images);
            for _ in 0..(images * 10) {
                run_frame(&mut scheduler);
                assert_semaphore_ownership(&scheduler);
            }
            assert!(scheduler.acquisition_semaphores_created() <= images + 1);
        }
    }

    #[test]
    fn test_semaphore_pool_bounded_with_irregular_order() {
        let backend = FakeFrameBackend::new(3);
        backend.script_images(&[0, 1, 0, 2, 2, 1, 0, 1, 2, 0, 0, 1]);
        let mut scheduler = FrameScheduler::new(backend, 3, u64::MAX).unwrap();

        for _ in 0..12 {
            run_frame(&mut scheduler);
            assert_semaphore_ownership(&scheduler);
        }
        assert!(scheduler.acquisition_semaphores_created() <= 4);
    }

    #[test]
    fn test_failed_acquire_returns_semaphore() {
        let mut scheduler = scheduler(2);
        scheduler.backend().fail_next_acquire(vk::Result::ERROR_OUT_OF_DATE_KHR);

        let err = scheduler.acquire().unwrap_err();
        assert!(err.needs_surface_recreation());
        assert_eq!(scheduler.semaphore_pool.len(), 1);

        // The recycled semaphore is used by the next successful acquire.
        run_frame(&mut scheduler);
        assert_eq!(scheduler.acquisition_semaphores_created(), 1);
    }

    #[test]
    fn test_out_of_range_image_strands_semaphore() {
        let backend = FakeFrameBackend::new(2);
        backend.script_images(&[5]);
        let mut scheduler = FrameScheduler::new(backend, 2, u64::MAX).unwrap();

        let err = scheduler.acquire().unwrap_err();
        assert!(err.needs_surface_recreation());
        assert_eq!(scheduler.stranded.len(), 1);
        // Possibly still signaled, so it must not be reused.
        assert_eq!(scheduler.semaphore_pool.len(), 0);
        assert_semaphore_ownership(&scheduler);

        run_frame(&mut scheduler);
        assert_eq!(scheduler.acquisition_semaphores_created(), 2);

        let backend = scheduler.destroy();
        assert_eq!(backend.live_semaphores(), 0);
    }

    #[test]
    fn test_reacquiring_recording_slot_strands_semaphore() {
        let backend = FakeFrameBackend::new(2);
        backend.script_images(&[0, 0]);
        let mut scheduler = FrameScheduler::new(backend, 2, u64::MAX).unwrap();

        let frame = scheduler.acquire().unwrap();
        let err = scheduler.acquire().unwrap_err();
        assert!(matches!(err, RenderError::InvalidUsage(_)));
        assert_eq!(scheduler.stranded.len(), 1);
        assert_ne!(scheduler.stranded[0], frame.image_acquired);
        assert_semaphore_ownership(&scheduler);

        let backend = scheduler.destroy();
        assert_eq!(backend.live_semaphores(), 0);
    }

    #[test]
    fn test_fence_timeout_strands_semaphore() {
        let backend = FakeFrameBackend::new(1);
        backend.set_gpu_latency(Duration::from_millis(200));
        let mut scheduler = FrameScheduler::new(backend, 1, 1_000_000).unwrap();

        run_frame(&mut scheduler);
        assert!(matches!(scheduler.acquire(), Err(RenderError::FenceTimeout)));
        assert_eq!(scheduler.stranded.len(), 1);
        assert_semaphore_ownership(&scheduler);

        let backend = scheduler.destroy();
        assert_eq!(backend.live_semaphores(), 0);
    }

    // ============================================================
    // Presentation failures
    // ============================================================

    #[test]
    fn test_present_failure_is_fatal_and_not_retried() {
        let mut scheduler = scheduler(2);
        scheduler.backend().fail_next_present(vk::Result::ERROR_SURFACE_LOST_KHR);

        let frame = scheduler.acquire().unwrap();
        scheduler.submit(&frame).unwrap();
        let err = scheduler.present(&frame).unwrap_err();

        assert!(matches!(err, RenderError::SurfaceOutOfDate(vk::Result::ERROR_SURFACE_LOST_KHR)));
        assert!(err.is_fatal());
        assert!(scheduler.backend().presents().is_empty());
    }

    // ============================================================
    // Completion tracking and deferred destruction
    // ============================================================

    #[test]
    fn test_completed_serial_tracks_observed_fences() {
        let mut scheduler = scheduler(2);
        assert_eq!(scheduler.completed_serial(), 0);

        run_frame(&mut scheduler); // serial 1, slot 0
        run_frame(&mut scheduler); // serial 2, slot 1
        assert_eq!(scheduler.completed_serial(), 0);

        // Reacquiring slot 0 observes serial 1's fence.
        let frame = scheduler.acquire().unwrap();
        assert_eq!(scheduler.completed_serial(), 1);
        scheduler.submit(&frame).unwrap();
        scheduler.present(&frame).unwrap();

        run_frame(&mut scheduler); // observes serial 2
        assert_eq!(scheduler.completed_serial(), 2);
    }

    #[test]
    fn test_retire_queue_waits_for_referencing_frames() {
        let mut scheduler = scheduler(2);
        let mut retired = RetireQueue::new();

        let frame = scheduler.acquire().unwrap();
        retired.retire(scheduler.current_serial(), "old-blas");
        scheduler.submit(&frame).unwrap();
        scheduler.present(&frame).unwrap();

        run_frame(&mut scheduler);
        assert!(retired.drain_completed(scheduler.completed_serial()).is_empty());

        run_frame(&mut scheduler);
        assert_eq!(retired.drain_completed(scheduler.completed_serial()), vec!["old-blas"]);
    }

    // ============================================================
    // Teardown
    // ============================================================

    #[test]
    fn test_destroy_releases_everything() {
        let mut scheduler = scheduler(3);
        for _ in 0..7 {
            run_frame(&mut scheduler);
        }
        let acquisition = scheduler.acquisition_semaphores_created();

        let backend = scheduler.destroy();
        // One "image presented" semaphore per slot plus every acquisition semaphore.
        assert_eq!(backend.destroyed_semaphores().len(), 3 + acquisition);
        assert_eq!(backend.destroyed_fences().len(), 3);
        assert_eq!(backend.freed_command_buffers().len(), 3);
        assert_eq!(backend.live_semaphores(), 0);
    }
}
