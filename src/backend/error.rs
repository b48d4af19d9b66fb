// Error taxonomy for the presentation layer
//
// Stale is recoverable (recreate and retry the frame). DeviceLost and
// AllocationFailure go up to the application. Contract violations such as
// IncompatibleRenderPass fail at construction time.

use ash::vk;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GpuError>;

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("surface reports no supported formats")]
    NoSupportedFormat,

    #[error("surface reports no supported present modes")]
    NoSupportedPresentMode,

    #[error("no depth format supports optimal-tiling depth attachments")]
    NoSupportedDepthFormat,

    /// The surface no longer matches the swapchain. Recreate and retry.
    #[error("swapchain is out of date with its surface")]
    Stale,

    #[error("frame belongs to generation {found}, current generation is {current}")]
    StaleGeneration { found: u64, current: u64 },

    #[error("no frame slot {index} in generation {generation}")]
    NoSuchFrame { index: u32, generation: u64 },

    #[error("resources of generation {0} are still alive")]
    LiveGeneration(u64),

    #[error("device lost")]
    DeviceLost,

    #[error("allocation failed: {0}")]
    AllocationFailure(String),

    #[error("no memory type satisfies {0:?}")]
    NoSuitableMemoryType(vk::MemoryPropertyFlags),

    #[error("incompatible render pass: {0}")]
    IncompatibleRenderPass(String),

    #[error("buffer memory is not host visible")]
    NotHostVisible,

    #[error("buffer memory is not mapped")]
    NotMapped,

    #[error("device feature {0} is not enabled")]
    MissingFeature(&'static str),

    #[error("vertex attribute format {0:?} has no known size")]
    UnsupportedVertexFormat(vk::Format),

    #[error("surface extent is zero")]
    ZeroExtent,

    #[error("Vulkan call failed: {0}")]
    Vulkan(vk::Result),
}

impl GpuError {
    /// True for errors that a swapchain recreate can recover from.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, GpuError::Stale | GpuError::StaleGeneration { .. })
    }
}

impl From<vk::Result> for GpuError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => GpuError::DeviceLost,
            vk::Result::ERROR_OUT_OF_DATE_KHR => GpuError::Stale,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                GpuError::AllocationFailure(result.to_string())
            }
            other => GpuError::Vulkan(other),
        }
    }
}

impl From<gpu_allocator::AllocationError> for GpuError {
    fn from(err: gpu_allocator::AllocationError) -> Self {
        GpuError::AllocationFailure(err.to_string())
    }
}
