// Surface capability probe
//
// Queries what a device/surface pair supports and resolves the concrete
// choices the swapchain is created with. All choosers are pure functions of
// their inputs so the same capabilities always produce the same swapchain.

use ash::vk;
use super::error::{GpuError, Result};
use super::gpu::GpuDevice;

/// Formats tried in order before falling back to whatever the surface lists first.
const PREFERRED_SURFACE_FORMATS: [vk::Format; 4] = [
    vk::Format::B8G8R8A8_SRGB,
    vk::Format::R8G8B8A8_SRGB,
    vk::Format::B8G8R8A8_UNORM,
    vk::Format::R8G8B8A8_UNORM,
];

const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Everything the surface supports, in the order the driver reported it.
#[derive(Debug, Clone)]
pub struct PresentationCapabilities {
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
    pub min_image_count: u32,
    /// 0 means no upper bound.
    pub max_image_count: u32,
    /// `None` when the surface lets the caller pick the size.
    pub current_extent: Option<vk::Extent2D>,
    pub min_image_extent: vk::Extent2D,
    pub max_image_extent: vk::Extent2D,
    pub current_transform: vk::SurfaceTransformFlagsKHR,
    pub supported_composite_alpha: vk::CompositeAlphaFlagsKHR,
}

impl PresentationCapabilities {
    pub fn query(device: &dyn GpuDevice, surface: vk::SurfaceKHR) -> Result<Self> {
        let caps = device.surface_capabilities(surface)?;
        let formats = device.surface_formats(surface)?;
        let present_modes = device.surface_present_modes(surface)?;

        if formats.is_empty() {
            return Err(GpuError::NoSupportedFormat);
        }
        if present_modes.is_empty() {
            return Err(GpuError::NoSupportedPresentMode);
        }

        log::debug!(
            "Surface support: {} formats, {} present modes, image count {}-{}",
            formats.len(),
            present_modes.len(),
            caps.min_image_count,
            if caps.max_image_count == 0 {
                "unlimited".to_string()
            } else {
                caps.max_image_count.to_string()
            }
        );

        Ok(Self::from_raw(caps, formats, present_modes))
    }

    pub fn from_raw(
        caps: vk::SurfaceCapabilitiesKHR,
        formats: Vec<vk::SurfaceFormatKHR>,
        present_modes: Vec<vk::PresentModeKHR>,
    ) -> Self {
        // u32::MAX is the "caller decides" sentinel
        let current_extent = if caps.current_extent.width == u32::MAX {
            None
        } else {
            Some(caps.current_extent)
        };

        Self {
            formats,
            present_modes,
            min_image_count: caps.min_image_count,
            max_image_count: caps.max_image_count,
            current_extent,
            min_image_extent: caps.min_image_extent,
            max_image_extent: caps.max_image_extent,
            current_transform: caps.current_transform,
            supported_composite_alpha: caps.supported_composite_alpha,
        }
    }

    pub fn surface_format(&self, preferred: Option<vk::Format>) -> vk::SurfaceFormatKHR {
        choose_surface_format(&self.formats, preferred)
    }

    pub fn present_mode(&self, vsync: bool) -> vk::PresentModeKHR {
        choose_present_mode(&self.present_modes, vsync)
    }

    pub fn extent(&self, requested: vk::Extent2D) -> vk::Extent2D {
        choose_extent(self.current_extent, requested, self.min_image_extent, self.max_image_extent)
    }

    /// One more than the minimum so we never wait on the driver, clamped to the maximum.
    pub fn image_count(&self) -> u32 {
        let count = self.min_image_count.saturating_add(1).max(self.min_image_count);
        if self.max_image_count > 0 {
            count.min(self.max_image_count)
        } else {
            count
        }
    }

    pub fn composite_alpha(&self) -> vk::CompositeAlphaFlagsKHR {
        [
            vk::CompositeAlphaFlagsKHR::OPAQUE,
            vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
            vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
            vk::CompositeAlphaFlagsKHR::INHERIT,
        ]
        .into_iter()
        .find(|&flag| self.supported_composite_alpha.contains(flag))
        .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
    }
}

/// Pick the surface format.
///
/// A configured format wins if the surface lists it with sRGB-nonlinear color
/// space. Otherwise 8-bit BGRA/RGBA with sRGB-nonlinear, otherwise the first entry.
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferred: Option<vk::Format>,
) -> vk::SurfaceFormatKHR {
    let srgb_nonlinear = |format: vk::Format| {
        formats.iter().copied().find(|f| {
            f.format == format && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
    };

    // A lone UNDEFINED entry means the surface takes anything
    if let [only] = formats {
        if only.format == vk::Format::UNDEFINED {
            return vk::SurfaceFormatKHR {
                format: preferred.unwrap_or(vk::Format::B8G8R8A8_SRGB),
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            };
        }
    }

    if let Some(found) = preferred.and_then(srgb_nonlinear) {
        return found;
    }

    PREFERRED_SURFACE_FORMATS
        .iter()
        .find_map(|&format| srgb_nonlinear(format))
        .or_else(|| formats.first().copied())
        .unwrap_or(vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        })
}

/// MAILBOX: no vsync, no tearing, triple buffered
/// IMMEDIATE: no vsync, lowest latency, may tear
/// FIFO: vsync, always supported
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if !vsync {
        for candidate in [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE] {
            if modes.contains(&candidate) {
                return candidate;
            }
        }
    }
    vk::PresentModeKHR::FIFO
}

pub fn choose_extent(
    current: Option<vk::Extent2D>,
    requested: vk::Extent2D,
    min: vk::Extent2D,
    max: vk::Extent2D,
) -> vk::Extent2D {
    match current {
        Some(extent) => extent,
        None => vk::Extent2D {
            width: requested.width.clamp(min.width, max.width.max(min.width)),
            height: requested.height.clamp(min.height, max.height.max(min.height)),
        },
    }
}

/// Highest supported sample count not above `requested`.
pub fn choose_sample_count(
    requested: vk::SampleCountFlags,
    supported: vk::SampleCountFlags,
) -> vk::SampleCountFlags {
    [
        vk::SampleCountFlags::TYPE_64,
        vk::SampleCountFlags::TYPE_32,
        vk::SampleCountFlags::TYPE_16,
        vk::SampleCountFlags::TYPE_8,
        vk::SampleCountFlags::TYPE_4,
        vk::SampleCountFlags::TYPE_2,
    ]
    .into_iter()
    .find(|&count| count.as_raw() <= requested.as_raw() && supported.contains(count))
    .unwrap_or(vk::SampleCountFlags::TYPE_1)
}

pub fn choose_depth_format(device: &dyn GpuDevice, preferred: Option<vk::Format>) -> Result<vk::Format> {
    let supports_depth = |format: vk::Format| {
        device
            .format_properties(format)
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    };

    preferred
        .into_iter()
        .chain(DEPTH_FORMAT_CANDIDATES)
        .find(|&format| supports_depth(format))
        .ok_or(GpuError::NoSupportedDepthFormat)
}
