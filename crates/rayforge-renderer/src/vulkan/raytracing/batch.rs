//! Batched bottom-level builds sharing one storage buffer and one scratch
//! buffer, recorded with a single build call.

use ash::vk;

use super::align::{align_up, ACCELERATION_STRUCTURE_ALIGNMENT};
use super::builder::{scratch_desc, storage_desc, AccelerationStructureBuilder, BuiltStructure};
use super::device::{AccelerationDevice, BuildCommand, StructureSizeInfo};
use crate::error::{RenderError, Result};
use crate::vulkan::Buffer;

/// Where each queued build lives inside the shared buffers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOffsetTable {
    pub structure_offsets: Vec<vk::DeviceSize>,
    pub scratch_offsets: Vec<vk::DeviceSize>,
    /// Filled by [`BatchOffsetTable::resolve_scratch_addresses`].
    pub scratch_addresses: Vec<vk::DeviceAddress>,
    pub total_storage: vk::DeviceSize,
    pub total_scratch: vk::DeviceSize,
}

impl BatchOffsetTable {
    /// Lay out `sizes` (storage bytes, scratch bytes) in order.
    ///
    /// Each entry starts at the running total, and the running total is
    /// rounded up to the alignment after each entry, so every offset is
    /// aligned and no two entries overlap.
    pub fn compute(
        sizes: &[(vk::DeviceSize, vk::DeviceSize)],
        structure_alignment: vk::DeviceSize,
        scratch_alignment: vk::DeviceSize,
    ) -> Self {
        let mut table = Self {
            structure_offsets: Vec::with_capacity(sizes.len()),
            scratch_offsets: Vec::with_capacity(sizes.len()),
            ..Self::default()
        };

        for &(storage, scratch) in sizes {
            table.structure_offsets.push(table.total_storage);
            table.total_storage = align_up(table.total_storage + storage, structure_alignment);

            table.scratch_offsets.push(table.total_scratch);
            table.total_scratch = align_up(table.total_scratch + scratch, scratch_alignment);
        }

        table
    }

    pub fn resolve_scratch_addresses(&mut self, scratch_base: vk::DeviceAddress) {
        self.scratch_addresses = self.scratch_offsets.iter()
            .map(|offset| scratch_base + offset)
            .collect();
    }

    pub fn len(&self) -> usize {
        self.structure_offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.structure_offsets.is_empty()
    }
}

/// Queues bottom-level builders and builds them out of shared buffers.
///
/// The structures returned by [`Self::build`] live in the batch's storage
/// buffer. Destroy them before calling [`Self::release`].
pub struct AccelerationStructureBatchBuilder {
    name: String,
    builders: Vec<AccelerationStructureBuilder>,
    table: Option<BatchOffsetTable>,
    storage: Option<Buffer>,
    scratch: Option<Buffer>,
}

impl AccelerationStructureBatchBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            builders: Vec::new(),
            table: None,
            storage: None,
            scratch: None,
        }
    }

    /// Queue a builder. Builds are laid out and recorded in push order.
    pub fn push(&mut self, builder: AccelerationStructureBuilder) -> Result<()> {
        if self.table.is_some() {
            return Err(RenderError::InvalidUsage("builder pushed after batch buffers were allocated"));
        }
        if builder.storage_region().is_some() {
            return Err(RenderError::InvalidUsage("batched builder already has its own buffers"));
        }
        self.builders.push(builder);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }

    pub fn builders(&self) -> &[AccelerationStructureBuilder] {
        &self.builders
    }

    pub fn table(&self) -> Option<&BatchOffsetTable> {
        self.table.as_ref()
    }

    /// Query sizes for every builder that has none yet.
    pub fn query_size_info<D: AccelerationDevice + ?Sized>(&mut self, device: &D) -> Result<Vec<StructureSizeInfo>> {
        self.builders.iter_mut()
            .map(|builder| match builder.size_info() {
                Some(sizes) => Ok(sizes),
                None => builder.query_size_info(device),
            })
            .collect()
    }

    /// Lay out every queued build and allocate the shared buffers.
    pub fn allocate_buffers<D: AccelerationDevice + ?Sized>(&mut self, device: &D) -> Result<&BatchOffsetTable> {
        if self.builders.is_empty() {
            return Err(RenderError::InvalidUsage("allocate_buffers called on an empty batch"));
        }
        if self.table.is_some() {
            return Err(RenderError::InvalidUsage("batch buffers already allocated"));
        }

        let sizes = self.builders.iter()
            .map(|builder| {
                let info = builder.size_info()
                    .ok_or(RenderError::InvalidUsage("allocate_buffers called before query_size_info"))?;
                Ok((info.acceleration_structure_size, builder.scratch_size()?))
            })
            .collect::<Result<Vec<_>>>()?;

        let scratch_alignment = device.min_scratch_alignment();
        let mut table = BatchOffsetTable::compute(&sizes, ACCELERATION_STRUCTURE_ALIGNMENT, scratch_alignment);

        let storage_name = format!("{}_storage", self.name);
        let storage = device.create_buffer(&storage_desc(table.total_storage, &storage_name))?;

        let scratch_name = format!("{}_scratch", self.name);
        // SAFETY (both arms): neither buffer has been used by the GPU.
        let scratch = match device.create_buffer(&scratch_desc(table.total_scratch, scratch_alignment, &scratch_name)) {
            Ok(scratch) => scratch,
            Err(e) => {
                unsafe { device.destroy_buffer(storage) };
                return Err(e);
            }
        };
        let scratch_base = match scratch.address() {
            Ok(address) => address,
            Err(e) => {
                unsafe {
                    device.destroy_buffer(scratch);
                    device.destroy_buffer(storage);
                }
                return Err(e);
            }
        };
        table.resolve_scratch_addresses(scratch_base);

        for (i, builder) in self.builders.iter_mut().enumerate() {
            builder.use_external_region(storage.handle, table.structure_offsets[i], table.scratch_addresses[i])?;
        }

        log::debug!(
            "AS batch '{}': {} builds, storage {} bytes, scratch {} bytes (align {})",
            self.name, self.builders.len(), table.total_storage, table.total_scratch, scratch_alignment
        );

        self.storage = Some(storage);
        self.scratch = Some(scratch);
        Ok(self.table.insert(table))
    }

    /// Create every structure in the shared storage buffer.
    ///
    /// If any creation fails, the structures already created are destroyed
    /// and the error is returned; a partial batch is never handed out.
    pub fn build<D: AccelerationDevice + ?Sized>(&mut self, device: &D) -> Result<Vec<BuiltStructure>> {
        if self.table.is_none() {
            return Err(RenderError::InvalidUsage("batch built before allocate_buffers"));
        }

        let mut built = Vec::with_capacity(self.builders.len());
        let mut failure = None;
        for builder in &mut self.builders {
            match builder.create_structure(device) {
                Ok(structure) => built.push(structure),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            log::error!("AS batch '{}' aborted after {} of {} structures", self.name, built.len(), self.builders.len());
            // SAFETY: no build has been recorded for these structures.
            unsafe { self.discard(device, built) };
            return Err(e);
        }
        Ok(built)
    }

    /// Destroy structures from `build`, in builder order, and reset their
    /// builders so nothing can be recorded against them.
    ///
    /// # Safety
    /// No submitted GPU work may reference the structures.
    unsafe fn discard<D: AccelerationDevice + ?Sized>(&mut self, device: &D, built: Vec<BuiltStructure>) {
        for (builder, structure) in self.builders.iter_mut().zip(built) {
            builder.discard_structure(device, structure);
        }
    }

    /// Record one build call covering every queued structure.
    pub fn submit<D: AccelerationDevice + ?Sized>(&self, device: &D, cmd: vk::CommandBuffer) -> Result<()> {
        let commands = self.builders.iter()
            .map(AccelerationStructureBuilder::build_command)
            .collect::<Result<Vec<BuildCommand<'_>>>>()?;
        device.cmd_build_acceleration_structures(cmd, &commands);
        Ok(())
    }

    /// `build`, then `submit` into a one-shot command buffer and wait.
    pub fn build_and_submit<D: AccelerationDevice + ?Sized>(&mut self, device: &D) -> Result<Vec<BuiltStructure>> {
        let built = self.build(device)?;

        let submitted = device.begin_one_shot().and_then(|cmd| {
            let recorded = self.submit(device, cmd);
            let ended = device.end_one_shot(cmd);
            recorded.and(ended)
        });

        if let Err(e) = submitted {
            // SAFETY: the submission failed, so the GPU never saw these structures.
            unsafe { self.discard(device, built) };
            return Err(e);
        }
        Ok(built)
    }

    /// Free the shared storage and scratch buffers and every builder.
    ///
    /// # Safety
    /// The batch's build must have completed and every structure created in
    /// the shared storage must already be destroyed.
    pub unsafe fn release<D: AccelerationDevice + ?Sized>(mut self, device: &D) {
        for builder in self.builders.drain(..) {
            builder.release(device);
        }
        for buffer in [self.scratch.take(), self.storage.take()].into_iter().flatten() {
            device.destroy_buffer(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vulkan::fakes::FakeAccelerationDevice;
    use crate::vulkan::raytracing::align::is_aligned;
    use crate::vulkan::raytracing::builder::{BuildMode, StructureStorage, TriangleGeometry};
    use ash::vk::Handle;

    fn mesh(name: &str, triangles: u32) -> AccelerationStructureBuilder {
        let mut builder = AccelerationStructureBuilder::bottom_level(name);
        builder.define_geometry(TriangleGeometry {
            vertex_address: 0x1_0000,
            vertex_stride: 12,
            vertex_count: triangles * 3,
            index_address: 0x2_0000,
            index_count: triangles * 3,
            opaque: true,
        }).unwrap();
        builder
    }

    fn sizes(storage: u64, build_scratch: u64) -> StructureSizeInfo {
        StructureSizeInfo {
            acceleration_structure_size: storage,
            build_scratch_size: build_scratch,
            update_scratch_size: build_scratch / 2,
        }
    }

    /// Deterministic pseudo-random sizes.
    fn lcg_sizes(seed: u64, count: usize) -> Vec<(u64, u64)> {
        let mut state = seed;
        (0..count)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let storage = (state >> 33) % 5000 + 1;
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let scratch = (state >> 33) % 3000;
                (storage, scratch)
            })
            .collect()
    }

    // ============================================================
    // Offset table
    // ============================================================

    #[test]
    fn test_offsets_aligned_and_disjoint() {
        for (seed, scratch_alignment) in [(1, 64), (7, 128), (42, 256), (99, 512)] {
            let sizes = lcg_sizes(seed, 40);
            let table = BatchOffsetTable::compute(&sizes, ACCELERATION_STRUCTURE_ALIGNMENT, scratch_alignment);

            for i in 0..sizes.len() {
                assert!(is_aligned(table.structure_offsets[i], ACCELERATION_STRUCTURE_ALIGNMENT));
                assert!(is_aligned(table.scratch_offsets[i], scratch_alignment));
                if i + 1 < sizes.len() {
                    assert!(table.structure_offsets[i] + sizes[i].0 <= table.structure_offsets[i + 1]);
                    assert!(table.scratch_offsets[i] + sizes[i].1 <= table.scratch_offsets[i + 1]);
                }
            }
            let last = sizes.len() - 1;
            assert!(table.structure_offsets[last] + sizes[last].0 <= table.total_storage);
            assert!(table.scratch_offsets[last] + sizes[last].1 <= table.total_scratch);
        }
    }

    #[test]
    fn test_totals_are_sum_of_aligned_sizes() {
        let sizes = lcg_sizes(3, 25);
        let table = BatchOffsetTable::compute(&sizes, 256, 128);

        let storage: u64 = sizes.iter().map(|&(s, _)| align_up(s, 256)).sum();
        let scratch: u64 = sizes.iter().map(|&(_, s)| align_up(s, 128)).sum();
        assert_eq!(table.total_storage, storage);
        assert_eq!(table.total_scratch, scratch);
    }

    #[test]
    fn test_totals_independent_of_order() {
        let uniform = vec![(300u64, 70u64); 6];
        let forward = BatchOffsetTable::compute(&uniform, 256, 64);

        let mut mixed = lcg_sizes(11, 12);
        let original = BatchOffsetTable::compute(&mixed, 256, 64);
        mixed.reverse();
        let reversed = BatchOffsetTable::compute(&mixed, 256, 64);

        assert_eq!(forward.total_storage, 6 * 512);
        assert_eq!(forward.total_scratch, 6 * 128);
        assert_eq!(original.total_storage, reversed.total_storage);
        assert_eq!(original.total_scratch, reversed.total_scratch);
    }

    #[test]
    fn test_three_build_scenario() {
        let sizes = [(100, 40), (250, 90), (64, 10)];
        let mut table = BatchOffsetTable::compute(&sizes, 256, 64);

        assert_eq!(table.structure_offsets, vec![0, 256, 512]);
        assert_eq!(table.total_storage, 768);
        // 64 + 90 rounds up to 192, so the third scratch region starts there.
        assert_eq!(table.scratch_offsets, vec![0, 64, 192]);
        assert_eq!(table.total_scratch, 256);

        table.resolve_scratch_addresses(0x8000);
        assert_eq!(table.scratch_addresses, vec![0x8000, 0x8040, 0x80C0]);
    }

    #[test]
    fn test_empty_table() {
        let table = BatchOffsetTable::compute(&[], 256, 64);
        assert!(table.is_empty());
        assert_eq!(table.total_storage, 0);
    }

    // ============================================================
    // Batch builds
    // ============================================================

    fn scenario_batch(device: &FakeAccelerationDevice) -> AccelerationStructureBatchBuilder {
        device.script_sizes(&[sizes(100, 40), sizes(250, 90), sizes(64, 10)]);
        let mut batch = AccelerationStructureBatchBuilder::new("chunks");
        for (i, triangles) in [12, 30, 7].into_iter().enumerate() {
            batch.push(mesh(&format!("chunk{i}"), triangles)).unwrap();
        }
        batch.query_size_info(device).unwrap();
        batch
    }

    #[test]
    fn test_batch_allocates_two_shared_buffers() {
        let device = FakeAccelerationDevice::new(64);
        let mut batch = scenario_batch(&device);
        let table = batch.allocate_buffers(&device).unwrap().clone();

        let buffers = device.created_buffers();
        assert_eq!(buffers.len(), 2);
        assert_eq!(buffers[0].size, 768);
        assert_eq!(buffers[0].alignment, ACCELERATION_STRUCTURE_ALIGNMENT);
        assert_eq!(buffers[1].size, 256);
        assert_eq!(buffers[1].alignment, 64);

        let base = buffers[1].address;
        assert_eq!(table.scratch_addresses, vec![base, base + 64, base + 192]);
        for (i, builder) in batch.builders().iter().enumerate() {
            assert_eq!(builder.storage_region(), Some((buffers[0].handle, table.structure_offsets[i])));
            assert_eq!(builder.scratch_address(), Some(table.scratch_addresses[i]));
        }
    }

    #[test]
    fn test_batch_builds_in_shared_storage_with_one_call() {
        let device = FakeAccelerationDevice::new(64);
        let mut batch = scenario_batch(&device);
        batch.allocate_buffers(&device).unwrap();
        let built = batch.build_and_submit(&device).unwrap();

        let storage = device.created_buffers()[0].clone();
        let structures = device.created_structures();
        let offsets: Vec<_> = structures.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![0, 256, 512]);
        assert!(structures.iter().all(|s| s.buffer == storage.handle));

        for (structure, offset) in built.iter().zip([0u64, 256, 512]) {
            assert_eq!(structure.device_address(), storage.address + offset);
            assert!(matches!(structure.storage(), StructureStorage::Shared { offset: o, .. } if *o == offset));
        }

        let calls = device.build_calls();
        assert_eq!(calls.len(), 1, "batch must record a single build call");
        assert_eq!(calls[0].len(), 3);
        let scratch_base = device.created_buffers()[1].address;
        let scratch: Vec<_> = calls[0].iter().map(|b| b.scratch_address - scratch_base).collect();
        assert_eq!(scratch, vec![0, 64, 192]);
        let primitives: Vec<_> = calls[0].iter().map(|b| b.primitive_counts[0]).collect();
        assert_eq!(primitives, vec![12, 30, 7]);
    }

    #[test]
    fn test_batch_creation_failure_aborts_whole_batch() {
        let device = FakeAccelerationDevice::new(64);
        let mut batch = scenario_batch(&device);
        batch.allocate_buffers(&device).unwrap();
        device.fail_creation_at(1);

        let err = batch.build_and_submit(&device).unwrap_err();
        assert!(matches!(err, RenderError::StructureCreation(_)));
        assert!(err.is_fatal());

        let created = device.created_structures();
        assert_eq!(created.len(), 1);
        assert_eq!(device.destroyed_structures(), vec![created[0].handle]);
        assert!(device.build_calls().is_empty());
    }

    #[test]
    fn test_failed_submission_discards_batch() {
        let device = FakeAccelerationDevice::new(64);
        let mut batch = scenario_batch(&device);
        batch.allocate_buffers(&device).unwrap();
        device.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);

        let err = batch.build_and_submit(&device).unwrap_err();
        assert!(matches!(err, RenderError::Vulkan { result: vk::Result::ERROR_DEVICE_LOST, .. }));
        let destroyed = device.destroyed_structures();
        assert_eq!(destroyed.len(), 3);

        // Recording again must not target the destroyed structures.
        let cmd = vk::CommandBuffer::from_raw(0xBAD);
        assert!(matches!(batch.submit(&device, cmd), Err(RenderError::InvalidUsage(_))));
        assert_eq!(device.build_calls().len(), 1);

        // The shared buffers survive, so the batch can be built again.
        let built = batch.build_and_submit(&device).unwrap();
        assert!(built.iter().all(|s| !destroyed.contains(&s.handle())));
        assert_eq!(device.one_shots_submitted(), 1);
        assert!(device.destroyed_buffers().is_empty());
    }

    #[test]
    fn test_creation_failure_resets_created_builders() {
        let device = FakeAccelerationDevice::new(64);
        let mut batch = scenario_batch(&device);
        batch.allocate_buffers(&device).unwrap();
        device.fail_creation_at(2);

        assert!(batch.build(&device).is_err());
        assert_eq!(device.destroyed_structures().len(), 2);
        assert!(batch.builders().iter().all(|b| b.build_command().is_err()));
    }

    #[test]
    fn test_batch_mixes_placeholder_update() {
        let device = FakeAccelerationDevice::new(64);
        let mut placeholder = AccelerationStructureBuilder::placeholder("slot");
        placeholder.query_size_info(&device).unwrap();
        placeholder.allocate_buffers(&device).unwrap();
        let source = placeholder.build_and_submit(&device).unwrap();

        let mut refit = mesh("slot-refit", 9);
        refit.define_update_property(source.flags(), &source).unwrap();

        let mut batch = AccelerationStructureBatchBuilder::new("frame");
        batch.push(mesh("fresh", 4)).unwrap();
        batch.push(refit).unwrap();
        let sizes = batch.query_size_info(&device).unwrap();
        let table = batch.allocate_buffers(&device).unwrap().clone();

        // Update entries are laid out with their update scratch size.
        assert_eq!(table.scratch_offsets[1], align_up(sizes[0].build_scratch_size, 64));
        assert_eq!(table.total_scratch, table.scratch_offsets[1] + align_up(sizes[1].update_scratch_size, 64));

        let built = batch.build_and_submit(&device).unwrap();
        let call = device.build_calls().last().unwrap().clone();
        assert_eq!(call[0].mode, BuildMode::Build);
        assert_eq!(call[1].mode, BuildMode::Update);
        assert_eq!(call[1].src, source.handle());
        assert_ne!(built[1].device_address(), 0);
    }

    #[test]
    fn test_batch_ordering_violations() {
        let device = FakeAccelerationDevice::new(64);
        let mut empty = AccelerationStructureBatchBuilder::new("empty");
        assert!(matches!(empty.allocate_buffers(&device), Err(RenderError::InvalidUsage(_))));

        let mut unqueried = AccelerationStructureBatchBuilder::new("unqueried");
        unqueried.push(mesh("a", 1)).unwrap();
        assert!(matches!(unqueried.allocate_buffers(&device), Err(RenderError::InvalidUsage(_))));
        assert!(matches!(unqueried.build(&device), Err(RenderError::InvalidUsage(_))));

        let mut batch = scenario_batch(&device);
        batch.allocate_buffers(&device).unwrap();
        assert!(batch.push(mesh("late", 1)).is_err());
    }

    #[test]
    fn test_release_frees_shared_buffers() {
        let device = FakeAccelerationDevice::new(64);
        let mut batch = scenario_batch(&device);
        batch.allocate_buffers(&device).unwrap();
        let built = batch.build_and_submit(&device).unwrap();

        unsafe {
            for structure in built {
                structure.destroy(&device);
            }
            batch.release(&device);
        }

        assert_eq!(device.destroyed_structures().len(), 3);
        // Only the shared storage and scratch buffers existed.
        assert_eq!(device.destroyed_buffers().len(), 2);
        assert_eq!(device.live_buffers(), 0);
    }
}
