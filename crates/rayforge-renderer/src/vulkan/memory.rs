//! GPU buffer allocation through gpu-allocator.

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc, Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::Arc;

use super::VulkanContext;
use crate::error::{RenderError, Result};

/// Parameters for a single buffer allocation.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    /// Minimum alignment of the bound memory, on top of whatever the driver
    /// reports for the buffer. Zero means "driver requirement only".
    pub alignment: vk::DeviceSize,
    pub name: &'a str,
}

/// GPU buffer with associated memory.
#[derive(Debug)]
pub struct Buffer {
    pub handle: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub device_address: Option<vk::DeviceAddress>,
}

impl Buffer {
    /// Device address, or an error if the buffer was created without
    /// `SHADER_DEVICE_ADDRESS` usage.
    pub fn address(&self) -> Result<vk::DeviceAddress> {
        self.device_address
            .ok_or(RenderError::InvalidUsage("buffer has no device address"))
    }

    /// Host pointer for CPU-visible allocations.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation.as_ref().and_then(|a| a.mapped_ptr()).map(|p| p.as_ptr() as *mut u8)
    }

    /// Copy `bytes` to the start of a host-visible buffer.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() as vk::DeviceSize > self.size {
            return Err(RenderError::InvalidUsage("write exceeds buffer size"));
        }
        let ptr = self.mapped_ptr()
            .ok_or(RenderError::InvalidUsage("buffer is not host visible"))?;

        // SAFETY: the mapping covers `self.size` bytes and the length was checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
        }
        Ok(())
    }
}

/// Memory manager wrapping gpu-allocator.
pub struct MemoryManager {
    allocator: Arc<Mutex<Allocator>>,
    device: ash::Device,
}

impl MemoryManager {
    /// Create a new memory manager.
    pub fn new(ctx: &VulkanContext) -> Result<Self> {
        let mut debug_settings = gpu_allocator::AllocatorDebugSettings::default();
        debug_settings.log_memory_information = cfg!(debug_assertions);
        debug_settings.log_leaks_on_shutdown = true;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: ctx.instance.clone(),
            device: ctx.device.clone(),
            physical_device: ctx.physical_device,
            debug_settings,
            buffer_device_address: ctx.rt_capabilities.supported,
            allocation_sizes: Default::default(),
        })?;

        Ok(Self {
            allocator: Arc::new(Mutex::new(allocator)),
            device: ctx.device.clone(),
        })
    }

    /// Create a buffer and bind freshly allocated memory to it.
    pub fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<Buffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: the device outlives the manager; the create info is fully initialized.
        let handle = unsafe { self.device.create_buffer(&buffer_info, None) }
            .map_err(RenderError::vk("vkCreateBuffer"))?;

        let mut requirements = unsafe { self.device.get_buffer_memory_requirements(handle) };
        requirements.alignment = requirements.alignment.max(desc.alignment);

        let allocation = self.allocator.lock().allocate(&AllocationCreateDesc {
            name: desc.name,
            requirements,
            location: desc.location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(handle, None) };
                return Err(e.into());
            }
        };

        // SAFETY: the allocation satisfies `requirements` and is not bound
        // elsewhere; on failure neither handle was ever seen by the GPU.
        let allocation = bind_or_release(
            allocation,
            |allocation| unsafe { self.device.bind_buffer_memory(handle, allocation.memory(), allocation.offset()) },
            |allocation| unsafe { self.release(handle, Some(allocation)) },
        )?;

        let device_address = desc.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS).then(|| {
            let addr_info = vk::BufferDeviceAddressInfo::default().buffer(handle);
            unsafe { self.device.get_buffer_device_address(&addr_info) }
        });

        log::debug!(
            "Allocated buffer '{}': {} bytes (align {}), address {:?}",
            desc.name, desc.size, requirements.alignment, device_address
        );

        Ok(Buffer {
            handle,
            allocation: Some(allocation),
            size: desc.size,
            usage: desc.usage,
            device_address,
        })
    }

    /// Destroy a buffer and return its memory to the allocator.
    ///
    /// # Safety
    /// No pending GPU work may reference the buffer.
    pub unsafe fn destroy_buffer(&self, buffer: Buffer) {
        self.release(buffer.handle, buffer.allocation);
    }

    unsafe fn release(&self, handle: vk::Buffer, allocation: Option<Allocation>) {
        self.device.destroy_buffer(handle, None);
        if let Some(allocation) = allocation {
            if let Err(e) = self.allocator.lock().free(allocation) {
                log::warn!("Failed to free buffer allocation: {}", e);
            }
        }
    }
}

/// Bind `allocation` with `bind`; if binding fails, hand it to `release`
/// so neither the buffer nor its memory outlives the error.
fn bind_or_release<A>(
    allocation: A,
    bind: impl FnOnce(&A) -> ash::prelude::VkResult<()>,
    release: impl FnOnce(A),
) -> Result<A> {
    match bind(&allocation) {
        Ok(()) => Ok(allocation),
        Err(result) => {
            release(allocation);
            Err(RenderError::vk("vkBindBufferMemory")(result))
        }
    }
}
