//! In-memory stand-ins for the GPU, used by unit tests here and, through
//! the `test-fakes` feature, by crates driving the renderer.
//!
//! Both fakes hand out fabricated handles and record every call. They panic
//! on misuse the Vulkan validation layers would flag (reusing a busy command
//! buffer, waiting on a semaphore nothing signaled) so the tests fail loudly.

use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::frame::{FrameBackend, FrameSubmission};
use super::raytracing::align::align_up;
use super::raytracing::builder::{BuildMode, StructureGeometry, StructureKind};
use super::raytracing::device::{AccelerationDevice, BuildCommand, StructureSizeInfo};
use super::{Buffer, BufferDesc};
use crate::error::{RenderError, Result};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(0x1000);

fn next_raw() -> u64 {
    NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)
}

// ============================================================
// Frame backend
// ============================================================

#[derive(Debug, Clone, Copy)]
struct FenceState {
    signaled: bool,
    signal_at: Option<Instant>,
}

impl FenceState {
    fn is_signaled(&self, now: Instant) -> bool {
        self.signaled || self.signal_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct FrameState {
    gpu_latency: Duration,
    image_script: VecDeque<u32>,
    next_image: u32,
    acquire_error: Option<vk::Result>,
    present_error: Option<vk::Result>,

    live_semaphores: HashSet<vk::Semaphore>,
    destroyed_semaphores: Vec<vk::Semaphore>,
    /// Signaled by an acquire and not yet waited on by a submission.
    pending_acquire: HashSet<vk::Semaphore>,

    fences: HashMap<vk::Fence, FenceState>,
    destroyed_fences: Vec<vk::Fence>,

    recording: HashSet<vk::CommandBuffer>,
    /// Command buffer and the fence its latest submission signals.
    in_flight: HashMap<vk::CommandBuffer, vk::Fence>,
    freed_command_buffers: Vec<vk::CommandBuffer>,

    submissions: Vec<FrameSubmission>,
    presents: Vec<(u32, vk::Semaphore)>,
}

/// Presentation engine and queue with a configurable GPU delay.
pub struct FakeFrameBackend {
    image_count: usize,
    state: Mutex<FrameState>,
}

impl FakeFrameBackend {
    pub fn new(image_count: usize) -> Self {
        Self {
            image_count,
            state: Mutex::new(FrameState::default()),
        }
    }

    /// Fences signal this long after their submission.
    pub fn set_gpu_latency(&self, latency: Duration) {
        self.state.lock().gpu_latency = latency;
    }

    /// Return these image indices from the next acquires, then fall back to
    /// round-robin.
    pub fn script_images(&self, order: &[u32]) {
        self.state.lock().image_script.extend(order.iter().copied());
    }

    pub fn fail_next_acquire(&self, result: vk::Result) {
        self.state.lock().acquire_error = Some(result);
    }

    pub fn fail_next_present(&self, result: vk::Result) {
        self.state.lock().present_error = Some(result);
    }

    pub fn submissions(&self) -> Vec<FrameSubmission> {
        self.state.lock().submissions.clone()
    }

    pub fn presents(&self) -> Vec<(u32, vk::Semaphore)> {
        self.state.lock().presents.clone()
    }

    pub fn destroyed_semaphores(&self) -> Vec<vk::Semaphore> {
        self.state.lock().destroyed_semaphores.clone()
    }

    pub fn destroyed_fences(&self) -> Vec<vk::Fence> {
        self.state.lock().destroyed_fences.clone()
    }

    pub fn freed_command_buffers(&self) -> Vec<vk::CommandBuffer> {
        self.state.lock().freed_command_buffers.clone()
    }

    pub fn live_semaphores(&self) -> usize {
        self.state.lock().live_semaphores.len()
    }
}

impl FrameBackend for FakeFrameBackend {
    fn image_count(&self) -> usize {
        self.image_count
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let semaphore = vk::Semaphore::from_raw(next_raw());
        self.state.lock().live_semaphores.insert(semaphore);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        assert!(state.live_semaphores.remove(&semaphore), "destroying unknown semaphore {semaphore:?}");
        state.destroyed_semaphores.push(semaphore);
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let fence = vk::Fence::from_raw(next_raw());
        self.state.lock().fences.insert(fence, FenceState { signaled, signal_at: None });
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        assert!(state.fences.remove(&fence).is_some(), "destroying unknown fence {fence:?}");
        state.destroyed_fences.push(fence);
    }

    fn allocate_command_buffers(&self, count: usize) -> Result<Vec<vk::CommandBuffer>> {
        Ok((0..count).map(|_| vk::CommandBuffer::from_raw(next_raw())).collect())
    }

    fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]) {
        self.state.lock().freed_command_buffers.extend_from_slice(buffers);
    }

    fn acquire_next_image(&self, semaphore: vk::Semaphore, _timeout_ns: u64) -> Result<u32> {
        let mut state = self.state.lock();
        if let Some(result) = state.acquire_error.take() {
            return Err(RenderError::SurfaceOutOfDate(result));
        }
        assert!(
            state.pending_acquire.insert(semaphore),
            "semaphore {semaphore:?} handed to acquire while a previous signal is still pending"
        );

        let index = match state.image_script.pop_front() {
            Some(index) => index,
            None => {
                let index = state.next_image;
                state.next_image = (index + 1) % self.image_count.max(1) as u32;
                index
            }
        };
        Ok(index)
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        let remaining = {
            let state = self.state.lock();
            let fence_state = state.fences.get(&fence).copied()
                .unwrap_or_else(|| panic!("waiting on unknown fence {fence:?}"));
            let now = Instant::now();
            if fence_state.is_signaled(now) {
                None
            } else {
                // Unsignaled and never submitted: nothing will ever signal it.
                let at = fence_state.signal_at.ok_or(RenderError::FenceTimeout)?;
                Some(at.saturating_duration_since(now))
            }
        };

        if let Some(remaining) = remaining {
            if remaining > Duration::from_nanos(timeout_ns) {
                return Err(RenderError::FenceTimeout);
            }
            std::thread::sleep(remaining);
        }

        let mut state = self.state.lock();
        if let Some(fence_state) = state.fences.get_mut(&fence) {
            fence_state.signaled = true;
        }
        state.in_flight.retain(|_, f| *f != fence);
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let fence_state = state.fences.get_mut(&fence)
            .unwrap_or_else(|| panic!("resetting unknown fence {fence:?}"));
        assert!(fence_state.is_signaled(now) || fence_state.signal_at.is_none(), "resetting a fence with pending work");
        *fence_state = FenceState { signaled: false, signal_at: None };
        Ok(())
    }

    fn begin_commands(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        let now = Instant::now();
        if let Some(fence) = state.in_flight.get(&command_buffer) {
            let busy = state.fences.get(fence).is_some_and(|f| !f.is_signaled(now));
            assert!(!busy, "command buffer {command_buffer:?} reset while the GPU may still execute it");
        }
        assert!(state.recording.insert(command_buffer), "command buffer {command_buffer:?} begun twice");
        Ok(())
    }

    fn end_commands(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        assert!(state.recording.remove(&command_buffer), "ending command buffer {command_buffer:?} that is not recording");
        Ok(())
    }

    fn submit(&self, submission: &FrameSubmission) -> Result<()> {
        let mut state = self.state.lock();
        assert!(
            state.pending_acquire.remove(&submission.wait_semaphore),
            "submission waits on semaphore {:?} that no acquire signaled",
            submission.wait_semaphore
        );

        let signal_at = Instant::now() + state.gpu_latency;
        let fence_state = state.fences.get_mut(&submission.fence)
            .unwrap_or_else(|| panic!("submitting with unknown fence {:?}", submission.fence));
        assert!(!fence_state.signaled && fence_state.signal_at.is_none(), "submitting with a fence that was not reset");
        fence_state.signal_at = Some(signal_at);

        state.in_flight.insert(submission.command_buffer, submission.fence);
        state.submissions.push(*submission);
        Ok(())
    }

    fn present(&self, image_index: u32, wait_semaphore: vk::Semaphore) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(result) = state.present_error.take() {
            return Err(RenderError::SurfaceOutOfDate(result));
        }
        state.presents.push((image_index, wait_semaphore));
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        let latest = self.state.lock().fences.values().filter_map(|f| f.signal_at).max();
        if let Some(latest) = latest {
            std::thread::sleep(latest.saturating_duration_since(Instant::now()));
        }
        let mut state = self.state.lock();
        for fence in state.fences.values_mut() {
            if fence.signal_at.is_some() {
                fence.signaled = true;
            }
        }
        state.in_flight.clear();
        Ok(())
    }
}

// ============================================================
// Acceleration device
// ============================================================

#[derive(Debug, Clone)]
pub struct BufferRecord {
    pub handle: vk::Buffer,
    pub name: String,
    pub size: vk::DeviceSize,
    pub alignment: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub address: vk::DeviceAddress,
}

#[derive(Debug, Clone)]
pub struct StructureRecord {
    pub handle: vk::AccelerationStructureKHR,
    pub kind: StructureKind,
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub address: vk::DeviceAddress,
}

#[derive(Debug, Clone)]
pub struct RecordedBuild {
    pub kind: StructureKind,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub mode: BuildMode,
    pub src: vk::AccelerationStructureKHR,
    pub dst: vk::AccelerationStructureKHR,
    pub primitive_counts: Vec<u32>,
    pub scratch_address: vk::DeviceAddress,
}

#[derive(Default)]
struct AccelState {
    scripted_sizes: VecDeque<StructureSizeInfo>,
    next_address: vk::DeviceAddress,

    buffers: Vec<BufferRecord>,
    live_buffers: HashSet<vk::Buffer>,
    destroyed_buffers: Vec<vk::Buffer>,
    writes: HashMap<vk::Buffer, Vec<u8>>,

    structures: Vec<StructureRecord>,
    destroyed_structures: Vec<vk::AccelerationStructureKHR>,
    creation_attempts: usize,
    fail_creation_at: Option<usize>,
    address_queries: usize,

    build_calls: Vec<Vec<RecordedBuild>>,
    build_command_buffers: Vec<vk::CommandBuffer>,
    one_shots_open: HashSet<vk::CommandBuffer>,
    one_shots_submitted: usize,
    submit_error: Option<vk::Result>,
}

/// Acceleration-structure device with deterministic sizes and addresses.
///
/// Unless sizes are scripted, a query over `p` primitives reports storage
/// `256 + 64p`, build scratch `128 + 32p` and update scratch `64 + 16p`.
pub struct FakeAccelerationDevice {
    scratch_alignment: vk::DeviceSize,
    state: Mutex<AccelState>,
}

impl FakeAccelerationDevice {
    pub fn new(scratch_alignment: vk::DeviceSize) -> Self {
        Self {
            scratch_alignment,
            state: Mutex::new(AccelState {
                next_address: 0x10_0000,
                ..AccelState::default()
            }),
        }
    }

    /// Answer the next size queries with `sizes`, in order.
    pub fn script_sizes(&self, sizes: &[StructureSizeInfo]) {
        self.state.lock().scripted_sizes.extend(sizes.iter().copied());
    }

    /// Make the `index`-th structure creation (0-based) fail.
    pub fn fail_creation_at(&self, index: usize) {
        self.state.lock().fail_creation_at = Some(index);
    }

    /// Make the next one-shot submission fail with `result`.
    pub fn fail_next_submit(&self, result: vk::Result) {
        self.state.lock().submit_error = Some(result);
    }

    pub fn created_buffers(&self) -> Vec<BufferRecord> {
        self.state.lock().buffers.clone()
    }

    pub fn destroyed_buffers(&self) -> Vec<vk::Buffer> {
        self.state.lock().destroyed_buffers.clone()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().live_buffers.len()
    }

    pub fn written_bytes(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.state.lock().writes.get(&buffer).cloned()
    }

    pub fn created_structures(&self) -> Vec<StructureRecord> {
        self.state.lock().structures.clone()
    }

    pub fn destroyed_structures(&self) -> Vec<vk::AccelerationStructureKHR> {
        self.state.lock().destroyed_structures.clone()
    }

    pub fn address_queries(&self) -> usize {
        self.state.lock().address_queries
    }

    pub fn build_calls(&self) -> Vec<Vec<RecordedBuild>> {
        self.state.lock().build_calls.clone()
    }

    pub fn build_command_buffers(&self) -> Vec<vk::CommandBuffer> {
        self.state.lock().build_command_buffers.clone()
    }

    pub fn one_shots_submitted(&self) -> usize {
        self.state.lock().one_shots_submitted
    }
}

impl AccelerationDevice for FakeAccelerationDevice {
    fn min_scratch_alignment(&self) -> vk::DeviceSize {
        self.scratch_alignment
    }

    fn build_sizes(
        &self,
        _kind: StructureKind,
        _flags: vk::BuildAccelerationStructureFlagsKHR,
        geometries: &[StructureGeometry],
    ) -> StructureSizeInfo {
        if let Some(sizes) = self.state.lock().scripted_sizes.pop_front() {
            return sizes;
        }
        let primitives: u64 = geometries.iter().map(|g| g.primitive_count() as u64).sum();
        StructureSizeInfo {
            acceleration_structure_size: 256 + 64 * primitives,
            build_scratch_size: 128 + 32 * primitives,
            update_scratch_size: 64 + 16 * primitives,
        }
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<Buffer> {
        assert!(desc.size > 0, "zero-sized buffer '{}'", desc.name);
        let mut state = self.state.lock();

        let handle = vk::Buffer::from_raw(next_raw());
        let address = align_up(state.next_address, desc.alignment.max(256));
        state.next_address = address + desc.size;

        state.buffers.push(BufferRecord {
            handle,
            name: desc.name.to_string(),
            size: desc.size,
            alignment: desc.alignment,
            usage: desc.usage,
            address,
        });
        state.live_buffers.insert(handle);

        Ok(Buffer {
            handle,
            allocation: None,
            size: desc.size,
            usage: desc.usage,
            device_address: desc.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS).then_some(address),
        })
    }

    unsafe fn destroy_buffer(&self, buffer: Buffer) {
        let mut state = self.state.lock();
        assert!(state.live_buffers.remove(&buffer.handle), "destroying unknown buffer {:?}", buffer.handle);
        state.destroyed_buffers.push(buffer.handle);
    }

    fn write_buffer(&self, buffer: &Buffer, bytes: &[u8]) -> Result<()> {
        if bytes.len() as vk::DeviceSize > buffer.size {
            return Err(RenderError::InvalidUsage("write exceeds buffer size"));
        }
        self.state.lock().writes.insert(buffer.handle, bytes.to_vec());
        Ok(())
    }

    fn create_acceleration_structure(
        &self,
        kind: StructureKind,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<vk::AccelerationStructureKHR> {
        let mut state = self.state.lock();
        let attempt = state.creation_attempts;
        state.creation_attempts += 1;
        if state.fail_creation_at == Some(attempt) {
            return Err(RenderError::StructureCreation(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }

        let record = state.buffers.iter().find(|b| b.handle == buffer)
            .unwrap_or_else(|| panic!("structure created in unknown buffer {buffer:?}"));
        assert!(offset + size <= record.size, "structure overruns its storage buffer");
        let address = record.address + offset;

        let handle = vk::AccelerationStructureKHR::from_raw(next_raw());
        state.structures.push(StructureRecord { handle, kind, buffer, offset, size, address });
        Ok(handle)
    }

    fn acceleration_structure_address(&self, handle: vk::AccelerationStructureKHR) -> vk::DeviceAddress {
        let mut state = self.state.lock();
        state.address_queries += 1;
        state.structures.iter()
            .find(|s| s.handle == handle)
            .map(|s| s.address)
            .unwrap_or_else(|| panic!("address of unknown structure {handle:?}"))
    }

    unsafe fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR) {
        self.state.lock().destroyed_structures.push(handle);
    }

    fn cmd_build_acceleration_structures(&self, cmd: vk::CommandBuffer, builds: &[BuildCommand<'_>]) {
        let recorded = builds.iter()
            .map(|build| {
                assert_eq!(build.mode == BuildMode::Update, !build.src.is_null(), "update source mismatch");
                RecordedBuild {
                    kind: build.kind,
                    flags: build.flags,
                    mode: build.mode,
                    src: build.src,
                    dst: build.dst,
                    primitive_counts: build.geometries.iter().map(StructureGeometry::primitive_count).collect(),
                    scratch_address: build.scratch_address,
                }
            })
            .collect();

        let mut state = self.state.lock();
        state.build_calls.push(recorded);
        state.build_command_buffers.push(cmd);
    }

    fn begin_one_shot(&self) -> Result<vk::CommandBuffer> {
        let cmd = vk::CommandBuffer::from_raw(next_raw());
        self.state.lock().one_shots_open.insert(cmd);
        Ok(cmd)
    }

    fn end_one_shot(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        assert!(state.one_shots_open.remove(&cmd), "ending unknown one-shot command buffer");
        if let Some(result) = state.submit_error.take() {
            return Err(RenderError::Vulkan { call: "vkQueueSubmit", result });
        }
        state.one_shots_submitted += 1;
        Ok(())
    }
}
