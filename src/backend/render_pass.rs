// Render pass description and creation
//
// The attachment order declared here is the contract framebuffers and
// pipelines are checked against:
//   single sample: { swapchain color, depth }
//   multisampled:  { msaa color, depth, swapchain resolve target }

use std::sync::Arc;

use ash::vk;
use super::error::Result;
use super::gpu::GpuDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentRole {
    Color,
    Depth,
    Resolve,
}

/// Attachment layout variant, keyed by sample count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentLayout {
    SingleSample,
    Multisampled(vk::SampleCountFlags),
}

impl AttachmentLayout {
    pub fn from_samples(samples: vk::SampleCountFlags) -> Self {
        if samples.is_empty() || samples == vk::SampleCountFlags::TYPE_1 {
            AttachmentLayout::SingleSample
        } else {
            AttachmentLayout::Multisampled(samples)
        }
    }

    pub fn samples(&self) -> vk::SampleCountFlags {
        match *self {
            AttachmentLayout::SingleSample => vk::SampleCountFlags::TYPE_1,
            AttachmentLayout::Multisampled(samples) => samples,
        }
    }

    pub fn is_multisampled(&self) -> bool {
        matches!(self, AttachmentLayout::Multisampled(_))
    }

    pub fn roles(&self) -> &'static [AttachmentRole] {
        match self {
            AttachmentLayout::SingleSample => &[AttachmentRole::Color, AttachmentRole::Depth],
            AttachmentLayout::Multisampled(_) => {
                &[AttachmentRole::Color, AttachmentRole::Depth, AttachmentRole::Resolve]
            }
        }
    }

    /// Which attachment the swapchain image is bound to.
    pub fn swapchain_role(&self) -> AttachmentRole {
        match self {
            AttachmentLayout::SingleSample => AttachmentRole::Color,
            AttachmentLayout::Multisampled(_) => AttachmentRole::Resolve,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AttachmentSpec {
    pub role: AttachmentRole,
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

impl AttachmentSpec {
    fn description(&self) -> vk::AttachmentDescription {
        vk::AttachmentDescription::builder()
            .format(self.format)
            .samples(self.samples)
            .load_op(self.load_op)
            .store_op(self.store_op)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(self.initial_layout)
            .final_layout(self.final_layout)
            .build()
    }
}

#[derive(Debug, Clone)]
pub struct RenderPassSpec {
    layout: AttachmentLayout,
    attachments: Vec<AttachmentSpec>,
    dependencies: Vec<vk::SubpassDependency>,
}

impl RenderPassSpec {
    pub fn describe(
        color_format: vk::Format,
        depth_format: vk::Format,
        samples: vk::SampleCountFlags,
    ) -> Self {
        let layout = AttachmentLayout::from_samples(samples);
        let samples = layout.samples();

        let attachments = layout
            .roles()
            .iter()
            .map(|&role| match role {
                AttachmentRole::Color if layout.is_multisampled() => AttachmentSpec {
                    role,
                    format: color_format,
                    samples,
                    load_op: vk::AttachmentLoadOp::CLEAR,
                    // Resolved at the end of the subpass, the samples themselves are dropped
                    store_op: vk::AttachmentStoreOp::DONT_CARE,
                    initial_layout: vk::ImageLayout::UNDEFINED,
                    final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                },
                AttachmentRole::Color => AttachmentSpec {
                    role,
                    format: color_format,
                    samples,
                    load_op: vk::AttachmentLoadOp::CLEAR,
                    store_op: vk::AttachmentStoreOp::STORE,
                    initial_layout: vk::ImageLayout::UNDEFINED,
                    final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                },
                AttachmentRole::Depth => AttachmentSpec {
                    role,
                    format: depth_format,
                    samples,
                    load_op: vk::AttachmentLoadOp::CLEAR,
                    store_op: vk::AttachmentStoreOp::DONT_CARE,
                    initial_layout: vk::ImageLayout::UNDEFINED,
                    final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                },
                AttachmentRole::Resolve => AttachmentSpec {
                    role,
                    format: color_format,
                    samples: vk::SampleCountFlags::TYPE_1,
                    load_op: vk::AttachmentLoadOp::DONT_CARE,
                    store_op: vk::AttachmentStoreOp::STORE,
                    initial_layout: vk::ImageLayout::UNDEFINED,
                    final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                },
            })
            .collect();

        // The depth image (and the msaa color image) is shared by every frame in
        // flight, so the previous frame's attachment writes must finish before
        // this subpass clears and writes them again.
        let attachment_stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        let dependency = vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(attachment_stages)
            .src_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )
            .dst_stage_mask(attachment_stages)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )
            .build();

        Self { layout, attachments, dependencies: vec![dependency] }
    }

    pub fn layout(&self) -> AttachmentLayout {
        self.layout
    }

    pub fn attachments(&self) -> &[AttachmentSpec] {
        &self.attachments
    }

    pub fn dependencies(&self) -> &[vk::SubpassDependency] {
        &self.dependencies
    }

    pub fn samples(&self) -> vk::SampleCountFlags {
        self.layout.samples()
    }

    /// Always a single graphics subpass.
    pub fn subpass_count(&self) -> u32 {
        1
    }

    pub fn attachment(&self, role: AttachmentRole) -> Option<&AttachmentSpec> {
        self.attachments.iter().find(|a| a.role == role)
    }

    pub fn index_of(&self, role: AttachmentRole) -> Option<u32> {
        self.attachments.iter().position(|a| a.role == role).map(|i| i as u32)
    }

    pub fn color_format(&self) -> vk::Format {
        self.attachment(AttachmentRole::Color).map_or(vk::Format::UNDEFINED, |a| a.format)
    }

    pub fn depth_format(&self) -> vk::Format {
        self.attachment(AttachmentRole::Depth).map_or(vk::Format::UNDEFINED, |a| a.format)
    }

    /// Clear values in attachment order.
    pub fn clear_values(&self, color: [f32; 4]) -> Vec<vk::ClearValue> {
        self.attachments
            .iter()
            .map(|a| match a.role {
                AttachmentRole::Depth => vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
                },
                AttachmentRole::Color | AttachmentRole::Resolve => vk::ClearValue {
                    color: vk::ClearColorValue { float32: color },
                },
            })
            .collect()
    }
}

/// Owned render pass handle together with the spec it was created from.
pub struct RenderPass {
    device: Arc<dyn GpuDevice>,
    handle: vk::RenderPass,
    spec: RenderPassSpec,
}

impl RenderPass {
    pub fn new(device: Arc<dyn GpuDevice>, spec: RenderPassSpec) -> Result<Self> {
        let reference = |role: AttachmentRole, layout: vk::ImageLayout| {
            spec.index_of(role).map(|index| {
                vk::AttachmentReference::builder().attachment(index).layout(layout).build()
            })
        };

        let color_layout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
        let color_refs: Vec<_> =
            reference(AttachmentRole::Color, color_layout).into_iter().collect();
        let resolve_refs: Vec<_> =
            reference(AttachmentRole::Resolve, color_layout).into_iter().collect();
        let depth_ref = reference(
            AttachmentRole::Depth,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        );

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if let Some(depth_ref) = depth_ref.as_ref() {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }
        if !resolve_refs.is_empty() {
            subpass = subpass.resolve_attachments(&resolve_refs);
        }
        let subpasses = [subpass.build()];

        let attachments: Vec<_> =
            spec.attachments.iter().map(AttachmentSpec::description).collect();

        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&spec.dependencies);

        let handle = device.create_render_pass(&render_pass_info)?;
        log::debug!(
            "Created render pass with {} attachments ({:?})",
            attachments.len(),
            spec.layout
        );

        Ok(Self { device, handle, spec })
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn spec(&self) -> &RenderPassSpec {
        &self.spec
    }

    pub fn destroy(&mut self) {
        if self.handle != vk::RenderPass::null() {
            self.device.destroy_render_pass(self.handle);
            self.handle = vk::RenderPass::null();
        }
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        self.destroy();
    }
}
