// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers and the window's surface extensions
// - Window surface creation
// - Physical device selection (prefer discrete GPU with graphics + present)
// - Logical device + queue creation
// - Memory allocator setup
// - The GpuDevice implementation everything else goes through

use std::collections::HashMap;
use std::ffi::{c_void, CStr, CString};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};

use super::error::{self, GpuError};
use super::gpu::{GpuDevice, MemoryBlock, QueueFamilyIndices};


/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    _entry: Entry,
    pub instance: ash::Instance,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    surface_loader: khr::Surface,
    surface: vk::SurfaceKHR,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    swapchain_loader: khr::Swapchain,

    // Queue handles
    pub queue_families: QueueFamilyIndices,
    pub graphics_queue: vk::Queue,
    pub compute_queue: vk::Queue,
    pub present_queue: vk::Queue,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Optional features turned on at device creation
    pub enabled_features: vk::PhysicalDeviceFeatures,

    // Taken in Drop so the allocator goes away before the device
    allocator: Mutex<Option<Allocator>>,
    allocations: Mutex<HashMap<u64, Allocation>>,
    next_allocation: AtomicU64,
}

impl VulkanDevice {
    /// Create Vulkan device presenting to `window`
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers (debug only)
    /// * `window` - Native window the surface is created for
    pub fn new<W>(app_name: &str, enable_validation: bool, window: &W) -> Result<Arc<Self>>
    where
        W: HasRawDisplayHandle + HasRawWindowHandle,
    {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance
        let instance = Self::create_instance(&entry, app_name, enable_validation, window)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Step 4: Window surface
        let surface_loader = khr::Surface::new(&entry, &instance);
        let surface = unsafe {
            ash_window::create_surface(
                &entry,
                &instance,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )
        }
        .context("Failed to create window surface")?;

        // Step 5: Pick physical device (GPU)
        let (physical_device, queue_families) =
            Self::pick_physical_device(&instance, &surface_loader, surface)?;

        // Step 6: Create logical device
        let supported_features = unsafe { instance.get_physical_device_features(physical_device) };
        let enabled_features = Self::optional_features(&supported_features);
        let device =
            Self::create_logical_device(&instance, physical_device, &queue_families, &enabled_features)?;
        let (graphics_queue, compute_queue, present_queue) = unsafe {
            (
                device.get_device_queue(queue_families.graphics, 0),
                device.get_device_queue(queue_families.compute, 0),
                device.get_device_queue(queue_families.present, 0),
            )
        };
        let swapchain_loader = khr::Swapchain::new(&instance, &device);

        // Step 7: Cache device properties
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };

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
        log::info!(
            "Queue families: graphics {}, compute {}, present {}",
            queue_families.graphics,
            queue_families.compute,
            queue_families.present
        );

        // Step 8: Create memory allocator
        let allocator = Self::create_allocator(&instance, physical_device, &device)?;

        Ok(Arc::new(Self {
            _entry: entry,
            instance,
            debug_utils,
            surface_loader,
            surface,
            physical_device,
            device,
            swapchain_loader,
            queue_families,
            graphics_queue,
            compute_queue,
            present_queue,
            properties,
            memory_properties,
            enabled_features,
            allocator: Mutex::new(Some(allocator)),
            allocations: Mutex::new(HashMap::new()),
            next_allocation: AtomicU64::new(1),
        }))
    }

    fn create_instance<W: HasRawDisplayHandle>(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        window: &W,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("swapframe")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        // Platform-specific surface extensions
        let mut extensions = ash_window::enumerate_required_extensions(window.raw_display_handle())
            .context("Window system is not supported by Vulkan")?
            .to_vec();
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        // Validation layers
        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

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
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, QueueFamilyIndices)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let Some(families) = Self::find_queue_families(instance, surface_loader, surface, device)? else {
                continue;
            };

            // Score device (prefer discrete GPU)
            let score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };

            if score > best_score {
                best_score = score;
                best_device = Some((device, families));
            }
        }

        best_device.ok_or_else(|| anyhow::anyhow!("No GPU can render to this window"))
    }

    /// Graphics family first; present prefers the graphics family, compute
    /// prefers a dedicated family. `None` when graphics or present is missing.
    fn find_queue_families(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
        device: vk::PhysicalDevice,
    ) -> Result<Option<QueueFamilyIndices>> {
        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        let Some(graphics) = queue_families
            .iter()
            .position(|props| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|i| i as u32)
        else {
            return Ok(None);
        };

        let supports_present = |family: u32| unsafe {
            surface_loader.get_physical_device_surface_support(device, family, surface)
        };

        let present = if supports_present(graphics)? {
            Some(graphics)
        } else {
            let mut found = None;
            for family in 0..queue_families.len() as u32 {
                if supports_present(family)? {
                    found = Some(family);
                    break;
                }
            }
            found
        };
        let Some(present) = present else {
            return Ok(None);
        };

        let compute = queue_families
            .iter()
            .position(|props| {
                props.queue_flags.contains(vk::QueueFlags::COMPUTE)
                    && !props.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            })
            .map_or(graphics, |i| i as u32);

        Ok(Some(QueueFamilyIndices { graphics, compute, present }))
    }

    /// Optional features we turn on when the GPU has them. None are required.
    fn optional_features(supported: &vk::PhysicalDeviceFeatures) -> vk::PhysicalDeviceFeatures {
        vk::PhysicalDeviceFeatures {
            // Wireframe / point pipelines
            fill_mode_non_solid: supported.fill_mode_non_solid,
            ..Default::default()
        }
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: &QueueFamilyIndices,
        features: &vk::PhysicalDeviceFeatures,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        // Required device extensions
        let extensions = [khr::Swapchain::name().as_ptr()];

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        Ok(device)
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create memory allocator")?;

        Ok(allocator)
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }
}

impl GpuDevice for VulkanDevice {
    fn queue_families(&self) -> QueueFamilyIndices {
        self.queue_families
    }

    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.memory_properties
    }

    fn enabled_features(&self) -> vk::PhysicalDeviceFeatures {
        self.enabled_features
    }

    fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        }
    }

    fn supported_sample_counts(&self) -> vk::SampleCountFlags {
        let limits = &self.properties.limits;
        limits.framebuffer_color_sample_counts & limits.framebuffer_depth_sample_counts
    }

    fn surface_capabilities(&self, surface: vk::SurfaceKHR) -> error::Result<vk::SurfaceCapabilitiesKHR> {
        Ok(unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, surface)
        }?)
    }

    fn surface_formats(&self, surface: vk::SurfaceKHR) -> error::Result<Vec<vk::SurfaceFormatKHR>> {
        Ok(unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(self.physical_device, surface)
        }?)
    }

    fn surface_present_modes(&self, surface: vk::SurfaceKHR) -> error::Result<Vec<vk::PresentModeKHR>> {
        Ok(unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(self.physical_device, surface)
        }?)
    }

    fn create_swapchain(&self, info: &vk::SwapchainCreateInfoKHR) -> error::Result<vk::SwapchainKHR> {
        Ok(unsafe { self.swapchain_loader.create_swapchain(info, None) }?)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> error::Result<Vec<vk::Image>> {
        Ok(unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }?)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> std::result::Result<(u32, bool), vk::Result> {
        unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout, semaphore, vk::Fence::null())
        }
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> std::result::Result<bool, vk::Result> {
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe { self.swapchain_loader.queue_present(queue, &present_info) }
    }

    fn create_image(&self, info: &vk::ImageCreateInfo) -> error::Result<vk::Image> {
        Ok(unsafe { self.device.create_image(info, None) }?)
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) }
    }

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo) -> error::Result<vk::ImageView> {
        Ok(unsafe { self.device.create_image_view(info, None) }?)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) }
    }

    fn allocate_image_memory(&self, image: vk::Image, name: &str) -> error::Result<MemoryBlock> {
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let mut allocator = self.allocator.lock();
        let allocator = allocator
            .as_mut()
            .ok_or_else(|| GpuError::AllocationFailure("allocator already destroyed".into()))?;

        let allocation = allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        let memory = unsafe { allocation.memory() };
        let offset = allocation.offset();
        if let Err(e) = unsafe { self.device.bind_image_memory(image, memory, offset) } {
            if let Err(free) = allocator.free(allocation) {
                log::warn!("Failed to free allocation for {}: {}", name, free);
            }
            return Err(e.into());
        }

        let id = self.next_allocation.fetch_add(1, Ordering::Relaxed);
        self.allocations.lock().insert(id, allocation);
        Ok(MemoryBlock { id, memory, offset })
    }

    fn free_image_memory(&self, block: MemoryBlock) {
        let Some(allocation) = self.allocations.lock().remove(&block.id) else {
            log::warn!("Freeing unknown allocation {}", block.id);
            return;
        };
        if let Some(allocator) = self.allocator.lock().as_mut() {
            if let Err(e) = allocator.free(allocation) {
                log::warn!("Failed to free allocation {}: {}", block.id, e);
            }
        }
    }

    fn create_buffer(&self, info: &vk::BufferCreateInfo) -> error::Result<vk::Buffer> {
        Ok(unsafe { self.device.create_buffer(info, None) }?)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn allocate_memory(&self, info: &vk::MemoryAllocateInfo) -> error::Result<vk::DeviceMemory> {
        Ok(unsafe { self.device.allocate_memory(info, None) }?)
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) }
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> error::Result<()> {
        Ok(unsafe { self.device.bind_buffer_memory(buffer, memory, 0) }?)
    }

    fn map_memory(&self, memory: vk::DeviceMemory, size: vk::DeviceSize) -> error::Result<*mut c_void> {
        Ok(unsafe {
            self.device
                .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
        }?)
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.unmap_memory(memory) }
    }

    fn flush_memory(&self, memory: vk::DeviceMemory, size: vk::DeviceSize) -> error::Result<()> {
        // Ranges must be a multiple of the atom size or reach the end of the allocation
        let atom = self.properties.limits.non_coherent_atom_size.max(1);
        let size = if size % atom == 0 { size } else { vk::WHOLE_SIZE };
        let range = vk::MappedMemoryRange::builder()
            .memory(memory)
            .offset(0)
            .size(size)
            .build();

        Ok(unsafe { self.device.flush_mapped_memory_ranges(&[range]) }?)
    }

    fn create_render_pass(&self, info: &vk::RenderPassCreateInfo) -> error::Result<vk::RenderPass> {
        Ok(unsafe { self.device.create_render_pass(info, None) }?)
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) }
    }

    fn create_framebuffer(&self, info: &vk::FramebufferCreateInfo) -> error::Result<vk::Framebuffer> {
        Ok(unsafe { self.device.create_framebuffer(info, None) }?)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) }
    }

    fn create_descriptor_set_layout(
        &self,
        info: &vk::DescriptorSetLayoutCreateInfo,
    ) -> error::Result<vk::DescriptorSetLayout> {
        Ok(unsafe { self.device.create_descriptor_set_layout(info, None) }?)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) }
    }

    fn create_pipeline_layout(&self, info: &vk::PipelineLayoutCreateInfo) -> error::Result<vk::PipelineLayout> {
        Ok(unsafe { self.device.create_pipeline_layout(info, None) }?)
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) }
    }

    fn create_graphics_pipeline(&self, info: &vk::GraphicsPipelineCreateInfo) -> error::Result<vk::Pipeline> {
        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), std::slice::from_ref(info), None)
        }
        .map_err(|(_, e)| GpuError::from(e))?;

        pipelines
            .into_iter()
            .next()
            .ok_or(GpuError::Vulkan(vk::Result::ERROR_UNKNOWN))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) }
    }

    /// Wait for device to be idle (e.g., before recreate or cleanup)
    fn wait_idle(&self) -> error::Result<()> {
        Ok(unsafe { self.device.device_wait_idle() }?)
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        if let Err(e) = GpuDevice::wait_idle(self) {
            log::warn!("wait_idle failed during teardown: {}", e);
        }

        let leaked: Vec<Allocation> = self.allocations.lock().drain().map(|(_, a)| a).collect();
        if !leaked.is_empty() {
            log::warn!("{} image allocations still alive at teardown", leaked.len());
        }

        // Cleanup in reverse order
        if let Some(mut allocator) = self.allocator.lock().take() {
            for allocation in leaked {
                if let Err(e) = allocator.free(allocation) {
                    log::warn!("Failed to free allocation: {}", e);
                }
            }
            drop(allocator);
        }

        unsafe {
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
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
