// Frame resources - attachment images and per-swapchain-image framebuffers
//
// Framebuffers reference the swapchain views without owning them; only the
// msaa color and depth images (plus their views and memory) are ours.

use std::sync::Arc;

use ash::vk;
use super::error::{GpuError, Result};
use super::gpu::{GpuDevice, MemoryBlock};
use super::render_pass::{AttachmentLayout, AttachmentRole, RenderPass, RenderPassSpec};
use super::resource_table::{FrameIndex, GenerationTable};
use super::swapchain::Swapchain;

struct AttachmentImage {
    image: vk::Image,
    view: vk::ImageView,
    memory: MemoryBlock,
    format: vk::Format,
    samples: vk::SampleCountFlags,
}

/// One entry of a framebuffer's attachment list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Binding {
    role: AttachmentRole,
    format: vk::Format,
    samples: vk::SampleCountFlags,
    view: vk::ImageView,
}

pub struct FrameResourceSet {
    device: Arc<dyn GpuDevice>,
    extent: vk::Extent2D,
    samples: vk::SampleCountFlags,
    /// Multisample color target, only when samples > 1.
    color: Option<AttachmentImage>,
    depth: Option<AttachmentImage>,
    framebuffers: GenerationTable<vk::Framebuffer>,
}

impl FrameResourceSet {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            extent: vk::Extent2D { width: 0, height: 0 },
            samples: vk::SampleCountFlags::TYPE_1,
            color: None,
            depth: None,
            framebuffers: GenerationTable::new(),
        }
    }

    /// Build attachments and framebuffers for `swapchain` in `render_pass` layout.
    pub fn build(&mut self, render_pass: &RenderPass, swapchain: &Swapchain) -> Result<()> {
        let spec = render_pass.spec();
        self.build_attachments(swapchain.extent(), spec.color_format(), spec.depth_format(), spec.samples())?;
        self.build_framebuffers(render_pass, swapchain)
    }

    /// Allocate the depth image and, when multisampling, the color image.
    /// Anything built before is destroyed first.
    pub fn build_attachments(
        &mut self,
        extent: vk::Extent2D,
        color_format: vk::Format,
        depth_format: vk::Format,
        samples: vk::SampleCountFlags,
    ) -> Result<()> {
        self.destroy();

        let layout = AttachmentLayout::from_samples(samples);

        let color = if layout.is_multisampled() {
            Some(create_attachment_image(
                &*self.device,
                extent,
                color_format,
                layout.samples(),
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
                vk::ImageAspectFlags::COLOR,
                "msaa color attachment",
            )?)
        } else {
            None
        };

        let depth = match create_attachment_image(
            &*self.device,
            extent,
            depth_format,
            layout.samples(),
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            depth_aspect(depth_format),
            "depth attachment",
        ) {
            Ok(depth) => depth,
            Err(e) => {
                if let Some(color) = color {
                    release_attachments(&*self.device, vec![color]);
                }
                return Err(e);
            }
        };

        log::debug!(
            "Built attachments {}x{} ({:?}, depth {:?}, {:?})",
            extent.width,
            extent.height,
            color.as_ref().map(|c| c.format),
            depth_format,
            layout.samples()
        );

        self.extent = extent;
        self.samples = layout.samples();
        self.color = color;
        self.depth = Some(depth);
        Ok(())
    }

    /// One framebuffer per swapchain image, attachments in render pass order.
    ///
    /// Fails with `IncompatibleRenderPass` if the attachment list we would bind
    /// differs from the render pass declaration in count, role, format or
    /// sample count. Framebuffers of a previous build are destroyed first.
    pub fn build_framebuffers(&mut self, render_pass: &RenderPass, swapchain: &Swapchain) -> Result<()> {
        self.destroy_framebuffers();

        let depth = self.depth.as_ref().ok_or_else(|| {
            GpuError::IncompatibleRenderPass("depth attachment has not been built".into())
        })?;
        if self.extent != swapchain.extent() {
            return Err(GpuError::IncompatibleRenderPass(format!(
                "attachments are {}x{} but the swapchain is {}x{}",
                self.extent.width,
                self.extent.height,
                swapchain.extent().width,
                swapchain.extent().height
            )));
        }

        let layout = AttachmentLayout::from_samples(self.samples);
        let mut framebuffers = Vec::with_capacity(swapchain.image_count());

        for image in swapchain.images() {
            let target = Binding {
                role: layout.swapchain_role(),
                format: swapchain.format(),
                samples: vk::SampleCountFlags::TYPE_1,
                view: image.view,
            };
            let bindings = self.bindings(layout, depth, target);

            if let Err(e) = check_compatible(&bindings, render_pass.spec()) {
                self.release_framebuffers(framebuffers);
                return Err(e);
            }

            let views: Vec<vk::ImageView> = bindings.iter().map(|b| b.view).collect();
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass.handle())
                .attachments(&views)
                .width(self.extent.width)
                .height(self.extent.height)
                .layers(1);

            match self.device.create_framebuffer(&framebuffer_info) {
                Ok(framebuffer) => framebuffers.push(framebuffer),
                Err(e) => {
                    self.release_framebuffers(framebuffers);
                    return Err(e);
                }
            }
        }

        log::debug!(
            "Built {} framebuffers for swapchain generation {}",
            framebuffers.len(),
            swapchain.generation()
        );

        if let Err(e) = self.framebuffers.install(swapchain.generation(), framebuffers.clone()) {
            self.release_framebuffers(framebuffers);
            return Err(e);
        }
        Ok(())
    }

    fn bindings(&self, layout: AttachmentLayout, depth: &AttachmentImage, target: Binding) -> Vec<Binding> {
        layout
            .roles()
            .iter()
            .map(|&role| match (role, self.color.as_ref()) {
                (AttachmentRole::Depth, _) => Binding {
                    role,
                    format: depth.format,
                    samples: depth.samples,
                    view: depth.view,
                },
                (AttachmentRole::Color, Some(color)) if layout.is_multisampled() => Binding {
                    role,
                    format: color.format,
                    samples: color.samples,
                    view: color.view,
                },
                _ => Binding { role, ..target },
            })
            .collect()
    }

    pub fn framebuffer(&self, frame: FrameIndex) -> Result<vk::Framebuffer> {
        self.framebuffers.get(frame).copied()
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn generation(&self) -> u64 {
        self.framebuffers.generation()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn samples(&self) -> vk::SampleCountFlags {
        self.samples
    }

    /// Framebuffers, then views, then images, then memory. Safe to call twice.
    pub fn destroy(&mut self) {
        self.destroy_framebuffers();

        let attachments: Vec<AttachmentImage> = self.color.take().into_iter().chain(self.depth.take()).collect();
        if !attachments.is_empty() {
            release_attachments(&*self.device, attachments);
        }
    }

    fn destroy_framebuffers(&mut self) {
        let framebuffers = self.framebuffers.drain();
        self.release_framebuffers(framebuffers);
    }

    fn release_framebuffers(&self, framebuffers: Vec<vk::Framebuffer>) {
        for framebuffer in framebuffers {
            self.device.destroy_framebuffer(framebuffer);
        }
    }
}

impl Drop for FrameResourceSet {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn check_compatible(bindings: &[Binding], spec: &RenderPassSpec) -> Result<()> {
    let declared = spec.attachments();
    if bindings.len() != declared.len() {
        return Err(GpuError::IncompatibleRenderPass(format!(
            "framebuffer has {} attachments, render pass declares {}",
            bindings.len(),
            declared.len()
        )));
    }

    for (index, (binding, attachment)) in bindings.iter().zip(declared).enumerate() {
        if binding.role != attachment.role
            || binding.format != attachment.format
            || binding.samples != attachment.samples
        {
            return Err(GpuError::IncompatibleRenderPass(format!(
                "attachment {}: framebuffer binds {:?} {:?} x{:?}, render pass declares {:?} {:?} x{:?}",
                index,
                binding.role,
                binding.format,
                binding.samples,
                attachment.role,
                attachment.format,
                attachment.samples
            )));
        }
    }
    Ok(())
}

fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::DEPTH,
    }
}

/// Create an image with device-local memory and a view of it.
fn create_attachment_image(
    device: &dyn GpuDevice,
    extent: vk::Extent2D,
    format: vk::Format,
    samples: vk::SampleCountFlags,
    usage: vk::ImageUsageFlags,
    aspect_mask: vk::ImageAspectFlags,
    name: &str,
) -> Result<AttachmentImage> {
    let image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .format(format)
        .tiling(vk::ImageTiling::OPTIMAL)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(usage)
        .samples(samples)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let image = device.create_image(&image_info)?;

    let memory = match device.allocate_image_memory(image, name) {
        Ok(memory) => memory,
        Err(e) => {
            device.destroy_image(image);
            return Err(e);
        }
    };

    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    let view = match device.create_image_view(&view_info) {
        Ok(view) => view,
        Err(e) => {
            device.destroy_image(image);
            device.free_image_memory(memory);
            return Err(e);
        }
    };

    Ok(AttachmentImage { image, view, memory, format, samples })
}

fn release_attachments(device: &dyn GpuDevice, attachments: Vec<AttachmentImage>) {
    for attachment in &attachments {
        device.destroy_image_view(attachment.view);
    }
    for attachment in &attachments {
        device.destroy_image(attachment.image);
    }
    for attachment in attachments {
        device.free_image_memory(attachment.memory);
    }
}
