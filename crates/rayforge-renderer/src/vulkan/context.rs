//! Vulkan context: instance, physical device, logical device, and queues.

use ash::{vk, Entry, Instance, Device};
use ash::khr::{surface, swapchain};
use ash::khr::{acceleration_structure, deferred_host_operations, ray_query};
use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use super::{APP_NAME, ENGINE_NAME, ENGINE_VERSION, REQUIRED_VK_VERSION};
use crate::error::{RenderError, Result};

/// Acceleration-structure capabilities of the selected physical device.
#[derive(Debug, Clone, Default)]
pub struct RtCapabilities {
    pub supported: bool,
    pub supports_ray_query: bool,
    /// `minAccelerationStructureScratchOffsetAlignment`. May exceed the fixed
    /// 256-byte structure alignment.
    pub min_scratch_alignment: u64,
    pub max_geometry_count: u64,
    pub max_instance_count: u64,
    pub max_primitive_count: u64,
}

/// Queue family indices.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }
}

/// Core Vulkan objects shared by every other module.
pub struct VulkanContext {
    pub entry: Entry,
    pub instance: Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: Device,
    pub queue_families: QueueFamilyIndices,

    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,

    pub surface_loader: surface::Instance,
    pub swapchain_loader: swapchain::Device,
    pub accel_struct_loader: Option<acceleration_structure::Device>,

    pub rt_capabilities: RtCapabilities,
    pub device_properties: vk::PhysicalDeviceProperties,

    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    debug_utils_loader: Option<ash::ext::debug_utils::Instance>,
}

impl VulkanContext {
    /// Create a new Vulkan context.
    ///
    /// # Safety
    /// `display_handle` must be a valid display for the lifetime of the context.
    pub unsafe fn new(
        display_handle: raw_window_handle::RawDisplayHandle,
        enable_validation: bool,
    ) -> Result<Self> {
        let entry = Entry::load()?;

        let api_version = entry.try_enumerate_instance_version()
            .map_err(RenderError::vk("vkEnumerateInstanceVersion"))?
            .unwrap_or(vk::API_VERSION_1_0);

        if api_version < REQUIRED_VK_VERSION {
            log::error!(
                "Vulkan 1.3 required, but only {}.{}.{} available",
                vk::api_version_major(api_version),
                vk::api_version_minor(api_version),
                vk::api_version_patch(api_version)
            );
            return Err(RenderError::Vulkan {
                call: "vkEnumerateInstanceVersion",
                result: vk::Result::ERROR_INCOMPATIBLE_DRIVER,
            });
        }

        let instance = Self::create_instance(&entry, display_handle, enable_validation)?;

        let (debug_utils_loader, debug_messenger) = if enable_validation {
            Self::setup_debug_messenger(&entry, &instance)?
        } else {
            (None, None)
        };

        let surface_loader = surface::Instance::new(&entry, &instance);

        let (physical_device, queue_families, rt_caps) =
            Self::pick_physical_device(&instance)?;
        let device_properties = instance.get_physical_device_properties(physical_device);

        let (device, graphics_queue, present_queue) =
            Self::create_logical_device(&instance, physical_device, &queue_families, &rt_caps)?;

        let swapchain_loader = swapchain::Device::new(&instance, &device);
        let accel_struct_loader = rt_caps.supported
            .then(|| acceleration_structure::Device::new(&instance, &device));

        Ok(Self {
            entry,
            instance,
            physical_device,
            device,
            queue_families,
            graphics_queue,
            present_queue,
            surface_loader,
            swapchain_loader,
            accel_struct_loader,
            rt_capabilities: rt_caps,
            device_properties,
            debug_messenger,
            debug_utils_loader,
        })
    }

    unsafe fn create_instance(
        entry: &Entry,
        display_handle: raw_window_handle::RawDisplayHandle,
        enable_validation: bool,
    ) -> Result<Instance> {
        let app_info = vk::ApplicationInfo::default()
            .application_name(APP_NAME)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(ENGINE_NAME)
            .engine_version(ENGINE_VERSION)
            .api_version(REQUIRED_VK_VERSION);

        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .map_err(RenderError::vk("vkEnumerateInstanceExtensionProperties"))?
            .to_vec();

        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let layer_names: Vec<CString> = if enable_validation {
            vec![CString::from(c"VK_LAYER_KHRONOS_validation")]
        } else {
            vec![]
        };
        let layer_name_ptrs: Vec<*const c_char> = layer_names.iter()
            .map(|n| n.as_ptr())
            .collect();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_name_ptrs);

        entry.create_instance(&create_info, None)
            .map_err(RenderError::vk("vkCreateInstance"))
    }

    unsafe fn setup_debug_messenger(
        entry: &Entry,
        instance: &Instance,
    ) -> Result<(Option<ash::ext::debug_utils::Instance>, Option<vk::DebugUtilsMessengerEXT>)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR |
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL |
                vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION |
                vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = debug_utils
            .create_debug_utils_messenger(&create_info, None)
            .map_err(RenderError::vk("vkCreateDebugUtilsMessengerEXT"))?;

        Ok((Some(debug_utils), Some(messenger)))
    }

    unsafe fn pick_physical_device(
        instance: &Instance,
    ) -> Result<(vk::PhysicalDevice, QueueFamilyIndices, RtCapabilities)> {
        let devices = instance.enumerate_physical_devices()
            .map_err(RenderError::vk("vkEnumeratePhysicalDevices"))?;

        let best = devices.iter()
            .map(|&device| (device, Self::rate_device(instance, device)))
            .filter(|&(_, score)| score > 0)
            .max_by_key(|&(_, score)| score);

        let Some((physical_device, _)) = best else {
            log::error!("No suitable Vulkan GPU found ({} enumerated)", devices.len());
            return Err(RenderError::Vulkan {
                call: "vkEnumeratePhysicalDevices",
                result: vk::Result::ERROR_INITIALIZATION_FAILED,
            });
        };

        let queue_families = Self::find_queue_families(instance, physical_device);
        let rt_caps = Self::check_rt_support(instance, physical_device);

        let props = instance.get_physical_device_properties(physical_device);
        let name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy();
        log::info!(
            "Selected GPU: {} (RT: {}, scratch alignment: {})",
            name,
            if rt_caps.supported { "yes" } else { "no" },
            rt_caps.min_scratch_alignment
        );

        Ok((physical_device, queue_families, rt_caps))
    }

    /// Rate a physical device (higher is better, 0 is unusable).
    unsafe fn rate_device(instance: &Instance, device: vk::PhysicalDevice) -> u32 {
        let props = instance.get_physical_device_properties(device);

        if !Self::find_queue_families(instance, device).is_complete() {
            return 0;
        }

        let mut score = 1u32;

        if props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 10000;
        } else if props.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 1000;
        }

        if Self::check_rt_support(instance, device).supported {
            score += 5000;
        }

        let memory_props = instance.get_physical_device_memory_properties(device);
        for heap in &memory_props.memory_heaps[..memory_props.memory_heap_count as usize] {
            if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
                score = score.saturating_add((heap.size / (1024 * 1024)) as u32);
            }
        }

        score
    }

    /// Present support is verified against the real surface when the
    /// swapchain is created; here any graphics family is assumed to present.
    unsafe fn find_queue_families(instance: &Instance, device: vk::PhysicalDevice) -> QueueFamilyIndices {
        let families = instance.get_physical_device_queue_family_properties(device);

        let graphics = families.iter()
            .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|i| i as u32);

        QueueFamilyIndices { graphics, present: graphics }
    }

    unsafe fn check_rt_support(instance: &Instance, device: vk::PhysicalDevice) -> RtCapabilities {
        let Ok(extensions) = instance.enumerate_device_extension_properties(device) else {
            return RtCapabilities::default();
        };

        let has_extension = |wanted: &CStr| extensions.iter().any(|e| {
            CStr::from_ptr(e.extension_name.as_ptr()) == wanted
        });

        if !has_extension(acceleration_structure::NAME) || !has_extension(deferred_host_operations::NAME) {
            return RtCapabilities::default();
        }
        let has_ray_query = has_extension(ray_query::NAME);

        let mut accel_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut accel_props);
        instance.get_physical_device_properties2(device, &mut props2);

        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut ray_query_features = vk::PhysicalDeviceRayQueryFeaturesKHR::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut accel_features);
        if has_ray_query {
            features2 = features2.push_next(&mut ray_query_features);
        }
        instance.get_physical_device_features2(device, &mut features2);

        RtCapabilities {
            supported: accel_features.acceleration_structure == vk::TRUE,
            supports_ray_query: ray_query_features.ray_query == vk::TRUE,
            min_scratch_alignment: u64::from(accel_props.min_acceleration_structure_scratch_offset_alignment),
            max_geometry_count: accel_props.max_geometry_count,
            max_instance_count: accel_props.max_instance_count,
            max_primitive_count: accel_props.max_primitive_count,
        }
    }

    unsafe fn create_logical_device(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: &QueueFamilyIndices,
        rt_caps: &RtCapabilities,
    ) -> Result<(Device, vk::Queue, vk::Queue)> {
        let graphics_family = queue_families.graphics
            .ok_or(RenderError::InvalidUsage("physical device has no graphics queue"))?;
        let present_family = queue_families.present.unwrap_or(graphics_family);

        let mut unique_families = vec![graphics_family];
        if present_family != graphics_family {
            unique_families.push(present_family);
        }

        let queue_priorities = [1.0f32];
        let queue_create_infos: Vec<_> = unique_families.iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        let enable_rt = rt_caps.supported;
        let mut extensions: Vec<*const c_char> = vec![swapchain::NAME.as_ptr()];
        if enable_rt {
            extensions.push(acceleration_structure::NAME.as_ptr());
            extensions.push(deferred_host_operations::NAME.as_ptr());
            if rt_caps.supports_ray_query {
                extensions.push(ray_query::NAME.as_ptr());
            }
        }

        let mut vulkan_13_features = vk::PhysicalDeviceVulkan13Features::default()
            .synchronization2(true)
            .maintenance4(true);

        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(enable_rt);

        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(enable_rt);

        let mut ray_query_features = vk::PhysicalDeviceRayQueryFeaturesKHR::default()
            .ray_query(rt_caps.supports_ray_query);

        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vulkan_13_features)
            .push_next(&mut vulkan_12_features);

        if enable_rt {
            features2 = features2.push_next(&mut accel_features);
            if rt_caps.supports_ray_query {
                features2 = features2.push_next(&mut ray_query_features);
            }
        }

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features2);

        let device = instance.create_device(physical_device, &create_info, None)
            .map_err(RenderError::vk("vkCreateDevice"))?;

        let graphics_queue = device.get_device_queue(graphics_family, 0);
        let present_queue = device.get_device_queue(present_family, 0);

        Ok((device, graphics_queue, present_queue))
    }

    /// Check that the graphics family can present to `surface`.
    ///
    /// # Safety
    /// `surface` must have been created from this context's instance.
    pub unsafe fn supports_present(&self, surface: vk::SurfaceKHR) -> Result<bool> {
        let family = self.queue_families.present
            .ok_or(RenderError::InvalidUsage("no present queue family"))?;
        self.surface_loader
            .get_physical_device_surface_support(self.physical_device, family, surface)
            .map_err(RenderError::vk("vkGetPhysicalDeviceSurfaceSupportKHR"))
    }

    /// Wait for all device operations to complete.
    pub fn wait_idle(&self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            self.wait_idle();

            if let (Some(loader), Some(messenger)) = (&self.debug_utils_loader, self.debug_messenger) {
                loader.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _ty: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!(target: "vulkan", "{}", message);
    } else {
        log::warn!(target: "vulkan", "{}", message);
    }

    vk::FALSE
}
