// GpuDevice - the device seam
//
// Every device call made by the presentation layer goes through this trait.
// VulkanDevice implements it on top of ash; tests plug in a recording fake.
// Create-info structs are passed as-is, so the usual Vulkan validity rules
// for pointers inside them apply to callers.

use ash::vk;
use super::error::Result;

/// Queue family indices used by the presentation layer. Any of them may alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub compute: u32,
    pub present: u32,
}

impl QueueFamilyIndices {
    /// Distinct family indices, sorted.
    pub fn unique(&self) -> Vec<u32> {
        let mut families = vec![self.graphics, self.present, self.compute];
        families.sort_unstable();
        families.dedup();
        families
    }
}

/// A device-local memory range handed out by the device allocator.
///
/// The `id` identifies the sub-allocation inside the allocator; `memory` and
/// `offset` are what the image was bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBlock {
    pub id: u64,
    pub memory: vk::DeviceMemory,
    pub offset: vk::DeviceSize,
}

pub trait GpuDevice: Send + Sync {
    fn queue_families(&self) -> QueueFamilyIndices;
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties;
    /// Features the logical device was created with.
    fn enabled_features(&self) -> vk::PhysicalDeviceFeatures;
    fn format_properties(&self, format: vk::Format) -> vk::FormatProperties;
    /// Sample counts usable for both color and depth framebuffer attachments.
    fn supported_sample_counts(&self) -> vk::SampleCountFlags;

    // Surface
    fn surface_capabilities(&self, surface: vk::SurfaceKHR) -> Result<vk::SurfaceCapabilitiesKHR>;
    fn surface_formats(&self, surface: vk::SurfaceKHR) -> Result<Vec<vk::SurfaceFormatKHR>>;
    fn surface_present_modes(&self, surface: vk::SurfaceKHR) -> Result<Vec<vk::PresentModeKHR>>;

    // Swapchain
    fn create_swapchain(&self, info: &vk::SwapchainCreateInfoKHR) -> Result<vk::SwapchainKHR>;
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    /// Raw acquire. `Ok((index, suboptimal))` or the untranslated `vk::Result`,
    /// since TIMEOUT and OUT_OF_DATE are statuses rather than failures here.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> std::result::Result<(u32, bool), vk::Result>;
    /// Raw present. `Ok(suboptimal)` or the untranslated `vk::Result`.
    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> std::result::Result<bool, vk::Result>;

    // Images
    fn create_image(&self, info: &vk::ImageCreateInfo) -> Result<vk::Image>;
    fn destroy_image(&self, image: vk::Image);
    fn create_image_view(&self, info: &vk::ImageViewCreateInfo) -> Result<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    /// Sub-allocate device-local memory for `image` and bind it.
    fn allocate_image_memory(&self, image: vk::Image, name: &str) -> Result<MemoryBlock>;
    fn free_image_memory(&self, block: MemoryBlock);

    // Buffers and raw memory
    fn create_buffer(&self, info: &vk::BufferCreateInfo) -> Result<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    fn allocate_memory(&self, info: &vk::MemoryAllocateInfo) -> Result<vk::DeviceMemory>;
    fn free_memory(&self, memory: vk::DeviceMemory);
    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> Result<()>;
    fn map_memory(&self, memory: vk::DeviceMemory, size: vk::DeviceSize) -> Result<*mut std::ffi::c_void>;
    fn unmap_memory(&self, memory: vk::DeviceMemory);
    fn flush_memory(&self, memory: vk::DeviceMemory, size: vk::DeviceSize) -> Result<()>;

    // Render passes and framebuffers
    fn create_render_pass(&self, info: &vk::RenderPassCreateInfo) -> Result<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    fn create_framebuffer(&self, info: &vk::FramebufferCreateInfo) -> Result<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    // Pipelines
    fn create_descriptor_set_layout(
        &self,
        info: &vk::DescriptorSetLayoutCreateInfo,
    ) -> Result<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_pipeline_layout(&self, info: &vk::PipelineLayoutCreateInfo) -> Result<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    fn create_graphics_pipeline(&self, info: &vk::GraphicsPipelineCreateInfo) -> Result<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    fn wait_idle(&self) -> Result<()>;
}
