// Presenter - everything between the device and the renderer
//
// Owns the swapchain, the render pass matched to its format and the frame
// resources built from both. Recreation is driven by the caller: acquire and
// present report Stale/Suboptimal, the caller waits for the device and calls
// `recreate`.

use std::sync::Arc;

use ash::vk;
use super::error::Result;
use super::frame_resources::FrameResourceSet;
use super::gpu::GpuDevice;
use super::render_pass::{RenderPass, RenderPassSpec};
use super::resource_table::FrameIndex;
use super::surface::{choose_depth_format, choose_sample_count, PresentationCapabilities};
use super::swapchain::{AcquireStatus, PresentStatus, Swapchain, SwapchainConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentationConfig {
    pub vsync: bool,
    /// Requested MSAA sample count; clamped to what the device supports.
    pub sample_count: vk::SampleCountFlags,
    pub color_format: Option<vk::Format>,
    pub depth_format: Option<vk::Format>,
}

impl Default for PresentationConfig {
    fn default() -> Self {
        Self {
            vsync: true,
            sample_count: vk::SampleCountFlags::TYPE_1,
            color_format: None,
            depth_format: None,
        }
    }
}

pub struct Presenter {
    device: Arc<dyn GpuDevice>,
    config: PresentationConfig,
    samples: vk::SampleCountFlags,
    depth_format: vk::Format,
    swapchain: Swapchain,
    render_pass: RenderPass,
    frames: FrameResourceSet,
}

impl Presenter {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        surface: vk::SurfaceKHR,
        requested_extent: vk::Extent2D,
        config: PresentationConfig,
    ) -> Result<Self> {
        let samples = choose_sample_count(config.sample_count, device.supported_sample_counts());
        if samples != config.sample_count {
            log::warn!(
                "{:?} samples not supported, using {:?}",
                config.sample_count,
                samples
            );
        }
        let depth_format = choose_depth_format(&*device, config.depth_format)?;

        let swapchain = Swapchain::new(
            device.clone(),
            surface,
            requested_extent,
            SwapchainConfig { vsync: config.vsync, preferred_format: config.color_format },
        )?;
        let render_pass = RenderPass::new(
            device.clone(),
            RenderPassSpec::describe(swapchain.format(), depth_format, samples),
        )?;
        let mut frames = FrameResourceSet::new(device.clone());
        frames.build(&render_pass, &swapchain)?;

        log::info!(
            "Presenter ready: {:?} + {:?}, {:?} samples",
            swapchain.format(),
            depth_format,
            samples
        );

        Ok(Self { device, config, samples, depth_format, swapchain, render_pass, frames })
    }

    pub fn acquire_next_image(
        &self,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> Result<AcquireStatus> {
        self.swapchain.acquire_next_image(timeout, semaphore)
    }

    pub fn present(
        &self,
        queue: vk::Queue,
        frame: FrameIndex,
        wait_semaphore: Option<vk::Semaphore>,
    ) -> Result<PresentStatus> {
        self.swapchain.present(queue, frame, wait_semaphore)
    }

    /// Rebuild swapchain and frame resources for the current surface.
    ///
    /// Returns true when the render pass had to be rebuilt as well (the
    /// surface format changed); pipelines built against the old one must be
    /// rebuilt by the caller. If the swapchain or the new render pass cannot
    /// be created the current generation stays usable.
    pub fn recreate(&mut self, requested_extent: vk::Extent2D) -> Result<bool> {
        let surface = self.swapchain.surface();
        let capabilities = PresentationCapabilities::query(&*self.device, surface)?;
        let next_format = capabilities
            .surface_format(self.swapchain.config().preferred_format)
            .format;

        // Built up front so a failure leaves the current frames untouched
        let next_pass = if next_format != self.render_pass.spec().color_format() {
            log::info!("Surface format changed to {:?}, rebuilding render pass", next_format);
            Some(RenderPass::new(
                self.device.clone(),
                RenderPassSpec::describe(next_format, self.depth_format, self.samples),
            )?)
        } else {
            None
        };

        self.frames.destroy();

        if let Err(e) = self.swapchain.recreate_with(&capabilities, requested_extent) {
            if !self.swapchain.is_destroyed() {
                if let Err(restore) = self.frames.build(&self.render_pass, &self.swapchain) {
                    log::warn!("Could not restore frame resources: {}", restore);
                }
            }
            return Err(e);
        }

        let rebuilt_pass = next_pass.is_some();
        if let Some(pass) = next_pass {
            self.render_pass = pass;
        }

        self.frames.build(&self.render_pass, &self.swapchain)?;
        Ok(rebuilt_pass)
    }

    /// Returns whether the setting changed; takes effect on the next `recreate`.
    pub fn set_vsync(&mut self, vsync: bool) -> bool {
        if self.config.vsync == vsync {
            return false;
        }
        self.config.vsync = vsync;
        self.swapchain.set_vsync(vsync);
        true
    }

    pub fn render_pass(&self) -> &RenderPass {
        &self.render_pass
    }

    pub fn framebuffer(&self, frame: FrameIndex) -> Result<vk::Framebuffer> {
        self.frames.framebuffer(frame)
    }

    pub fn clear_values(&self, color: [f32; 4]) -> Vec<vk::ClearValue> {
        self.render_pass.spec().clear_values(color)
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    pub fn generation(&self) -> u64 {
        self.swapchain.generation()
    }

    pub fn samples(&self) -> vk::SampleCountFlags {
        self.samples
    }

    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    pub fn config(&self) -> PresentationConfig {
        self.config
    }

    /// Frame resources, render pass, then swapchain. Safe to call twice.
    pub fn destroy(&mut self) {
        self.frames.destroy();
        self.render_pass.destroy();
        self.swapchain.destroy();
    }
}

impl Drop for Presenter {
    fn drop(&mut self) {
        self.destroy();
    }
}
