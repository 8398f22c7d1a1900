// Vulkan device - core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Validation message routing: scoped muting, error-severity escalation
// - Physical device selection (prefer discrete GPU)
// - Logical device + queue creation, extension loaders
// - Memory allocator setup and cached device limits

use crate::command;
use crate::error::{vk_check, BackendError};
use crate::handle::CommandPool;
use anyhow::{Context, Result};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::ffi::{c_void, CStr, CString};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Device-reported limits the core consults at runtime.
#[derive(Clone, Copy)]
pub struct DeviceLimits {
    pub descriptor_buffer: vk::PhysicalDeviceDescriptorBufferPropertiesEXT,
    pub non_coherent_atom_size: vk::DeviceSize,
}

/// State shared with the validation-layer callback. Lives behind a stable
/// heap address for the lifetime of the messenger; the mutex is required
/// because drivers may invoke the callback from internal threads.
struct DebugState {
    ignored_messages: Mutex<HashSet<i32>>,
    fatal: AtomicBool,
}

/// Token returned by [`VulkanDevice::mute_message`]; hand it back to
/// [`VulkanDevice::unmute_message`] to re-enable the message. A token from a
/// message that was already muted is inert.
#[must_use]
pub struct MessageMute {
    id: i32,
    newly_muted: bool,
}

/// Owns the raw instance/device pair. Declared as the last field of
/// [`VulkanDevice`] so every other field (pools, allocator, loaders) is
/// dropped while the device is still alive.
struct DeviceCore {
    device: ash::Device,
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    instance: ash::Instance,
    _entry: Entry,
}

impl Drop for DeviceCore {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Vulkan device wrapper with automatic cleanup.
///
/// Field order matters for drop: allocator and pools go first, `core` tears
/// down the device last, and `debug_state` outlives the messenger that
/// references it.
pub struct VulkanDevice {
    allocator: Arc<Mutex<Allocator>>,
    transient_pool: CommandPool,

    descriptor_buffer_loader: ash::extensions::ext::DescriptorBuffer,
    accel_loader: ash::extensions::khr::AccelerationStructure,

    physical_device: vk::PhysicalDevice,
    queue: vk::Queue,
    queue_family: u32,
    limits: DeviceLimits,

    core: DeviceCore,
    debug_state: Option<Box<DebugState>>,
}

impl VulkanDevice {
    /// Create the Vulkan device from configuration. Validation layers are
    /// only ever enabled in debug builds.
    pub fn new(config: &crate::config::Config) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", config.device.app_name);

        let enable_validation = cfg!(debug_assertions) && config.device.validation_layers;

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let instance = Self::create_instance(&entry, &config.device.app_name, enable_validation)?;

        let (debug_state, debug_utils) = if enable_validation {
            let state = Box::new(DebugState {
                ignored_messages: Mutex::new(HashSet::new()),
                fatal: AtomicBool::new(false),
            });
            let messenger = Self::setup_debug_messenger(&entry, &instance, &state)?;
            (Some(state), Some(messenger))
        } else {
            (None, None)
        };

        let (physical_device, queue_family) =
            Self::pick_physical_device(&instance, config.device.prefer_discrete)?;

        let device = Self::create_logical_device(&instance, physical_device, queue_family)?;
        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        let limits = Self::query_limits(&instance, physical_device);

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        // Externally synchronized: this design records and submits from one
        // CPU thread, so the allocator is not internally thread-safe.
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create GPU allocator")?;

        let descriptor_buffer_loader =
            ash::extensions::ext::DescriptorBuffer::new(&instance, &device);
        let accel_loader = ash::extensions::khr::AccelerationStructure::new(&instance, &device);

        let transient_pool = command::create_command_pool(
            &device,
            vk::CommandPoolCreateFlags::TRANSIENT,
            queue_family,
        )?;

        log::info!("Vulkan device initialized");

        Ok(Arc::new(Self {
            allocator: Arc::new(Mutex::new(allocator)),
            transient_pool,
            descriptor_buffer_loader,
            accel_loader,
            physical_device,
            queue,
            queue_family,
            limits,
            core: DeviceCore {
                device,
                debug_utils,
                instance,
                _entry: entry,
            },
            debug_state,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = c"Renderer Backend";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut extensions = Vec::new();
        let mut layers = Vec::new();
        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
            layers.push(c"VK_LAYER_KHRONOS_validation".as_ptr());
        }

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);

        let instance = vk_check(
            unsafe { entry.create_instance(&create_info, None) },
            "vkCreateInstance",
        )?;
        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
        state: &DebugState,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback))
            .user_data(state as *const DebugState as *mut c_void);

        let messenger = vk_check(
            unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) },
            "vkCreateDebugUtilsMessengerEXT",
        )?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        prefer_discrete: bool,
    ) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = vk_check(
            unsafe { instance.enumerate_physical_devices() },
            "vkEnumeratePhysicalDevices",
        )?;
        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        let required = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER;

        let mut best_device = None;
        let mut best_score = 0;
        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };

            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };
            let queue_family = queue_families
                .iter()
                .enumerate()
                .find(|(_, family)| family.queue_flags.contains(required))
                .map(|(i, _)| i as u32);

            if let Some(queue_family) = queue_family {
                let score = match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU if prefer_discrete => 1000,
                    vk::PhysicalDeviceType::DISCRETE_GPU => 100,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                    _ => 1,
                };
                if score > best_score {
                    best_score = score;
                    best_device = Some((device, queue_family));
                }
            }
        }

        best_device.ok_or_else(|| anyhow::anyhow!("No suitable GPU found"))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let extensions = [
            ash::extensions::khr::Swapchain::name().as_ptr(),
            ash::extensions::khr::AccelerationStructure::name().as_ptr(),
            ash::extensions::khr::DeferredHostOperations::name().as_ptr(),
            ash::extensions::ext::DescriptorBuffer::name().as_ptr(),
        ];

        let mut features12 = vk::PhysicalDeviceVulkan12Features::builder()
            .timeline_semaphore(true)
            .buffer_device_address(true);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::builder()
            .synchronization2(true)
            .maintenance4(true)
            .dynamic_rendering(true);
        let mut descriptor_buffer =
            vk::PhysicalDeviceDescriptorBufferFeaturesEXT::builder().descriptor_buffer(true);
        let mut accel_structure = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder()
            .acceleration_structure(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .push_next(&mut features12)
            .push_next(&mut features13)
            .push_next(&mut descriptor_buffer)
            .push_next(&mut accel_structure);

        let device = vk_check(
            unsafe { instance.create_device(physical_device, &create_info, None) },
            "vkCreateDevice",
        )?;
        Ok(device)
    }

    fn query_limits(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> DeviceLimits {
        let mut descriptor_buffer = vk::PhysicalDeviceDescriptorBufferPropertiesEXT::default();
        let mut properties2 =
            vk::PhysicalDeviceProperties2::builder().push_next(&mut descriptor_buffer);
        unsafe { instance.get_physical_device_properties2(physical_device, &mut properties2) };
        let non_coherent_atom_size = properties2.properties.limits.non_coherent_atom_size;

        DeviceLimits {
            descriptor_buffer,
            non_coherent_atom_size,
        }
    }

    pub fn device(&self) -> &ash::Device {
        &self.core.device
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.core.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn allocator(&self) -> &Arc<Mutex<Allocator>> {
        &self.allocator
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    pub fn descriptor_buffer_loader(&self) -> &ash::extensions::ext::DescriptorBuffer {
        &self.descriptor_buffer_loader
    }

    pub fn accel_loader(&self) -> &ash::extensions::khr::AccelerationStructure {
        &self.accel_loader
    }

    /// Pool for one-time setup command buffers.
    pub fn transient_pool(&self) -> vk::CommandPool {
        self.transient_pool.get()
    }

    /// Wait for the device to be idle (e.g. before teardown).
    pub fn wait_idle(&self) -> Result<()> {
        vk_check(
            unsafe { self.core.device.device_wait_idle() },
            "vkDeviceWaitIdle",
        )?;
        Ok(())
    }

    /// Error out if the validation layer has reported an error-severity
    /// message since startup. Raising from the callback itself would unwind
    /// across the FFI boundary, so the failure is latched and surfaced here.
    pub fn ensure_validation_clean(&self) -> Result<(), BackendError> {
        match &self.debug_state {
            Some(state) if state.fatal.load(Ordering::Relaxed) => {
                Err(BackendError::ValidationFailure)
            }
            _ => Ok(()),
        }
    }

    /// Suppress a known-benign validation message by ID. Returns a token;
    /// re-enabling takes the token back.
    pub fn mute_message(&self, id: i32) -> MessageMute {
        let newly_muted = match &self.debug_state {
            Some(state) => state.ignored_messages.lock().insert(id),
            None => false,
        };
        MessageMute { id, newly_muted }
    }

    /// Re-enable a previously muted validation message.
    pub fn unmute_message(&self, token: MessageMute) {
        if !token.newly_muted {
            return;
        }
        if let Some(state) = &self.debug_state {
            state.ignored_messages.lock().remove(&token.id);
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");
        // the GPU must be idle before pools and allocator start dropping
        if let Err(e) = self.wait_idle() {
            log::error!("Device teardown: {e:#}");
        }
    }
}

// Debug callback for validation layers. Severity >= ERROR latches the fatal
// flag; the frame pacer turns it into a hard error at the next frame.
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    p_user_data: *mut c_void,
) -> vk::Bool32 {
    let data = &*p_callback_data;
    let state = &*(p_user_data as *const DebugState);

    if state.ignored_messages.lock().contains(&data.message_id_number) {
        return vk::FALSE;
    }

    let message = CStr::from_ptr(data.p_message);
    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
            state.fatal.store(true, Ordering::Relaxed);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
