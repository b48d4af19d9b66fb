// Backend module - Vulkan presentation layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// Everything except `device` and `sync` talks to the GPU through `GpuDevice`.

pub mod buffer;
pub mod device;
pub mod error;
pub mod frame_resources;
pub mod gpu;
pub mod pipeline;
pub mod presenter;
pub mod render_pass;
pub mod resource_table;
pub mod surface;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use buffer::DeviceMemoryBuffer;
pub use device::VulkanDevice;
pub use error::{GpuError, Result};
pub use frame_resources::FrameResourceSet;
pub use gpu::{GpuDevice, MemoryBlock, QueueFamilyIndices};
pub use pipeline::{
    build_graphics_pipeline, DescriptorSetLayoutBuilder, GraphicsPipeline, GraphicsPipelineSpec,
    PipelineLayoutBuilder, ShaderStage, VertexInputLayout,
};
pub use presenter::{PresentationConfig, Presenter};
pub use render_pass::{AttachmentLayout, AttachmentRole, RenderPass, RenderPassSpec};
pub use resource_table::{FrameIndex, GenerationTable};
pub use surface::PresentationCapabilities;
pub use swapchain::{AcquireStatus, PresentStatus, Swapchain, SwapchainConfig};
