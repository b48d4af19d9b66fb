// Graphics pipeline creation and management
//
// The graphics pipeline defines how vertices are processed and rasterized.
// It includes: vertex input, shaders, rasterization, depth/stencil, blending.
// Pipelines are validated against the render pass they target; viewport and
// scissor are dynamic so a pipeline survives swapchain resizes.

use std::ffi::{CStr, CString};
use std::sync::Arc;

use ash::vk;
use super::error::{GpuError, Result};
use super::gpu::GpuDevice;
use super::render_pass::RenderPass;

pub const DEFAULT_ENTRY_POINT: &CStr = c"main";

/// Declarative descriptor set layout.
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stages)
                .build(),
        );
        self
    }

    pub fn build(&self, device: Arc<dyn GpuDevice>) -> Result<DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&self.bindings);
        let handle = device.create_descriptor_set_layout(&layout_info)?;
        Ok(DescriptorSetLayout { device, handle })
    }
}

pub struct DescriptorSetLayout {
    device: Arc<dyn GpuDevice>,
    handle: vk::DescriptorSetLayout,
}

impl DescriptorSetLayout {
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.handle
    }

    pub fn destroy(&mut self) {
        if self.handle != vk::DescriptorSetLayout::null() {
            self.device.destroy_descriptor_set_layout(self.handle);
            self.handle = vk::DescriptorSetLayout::null();
        }
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[derive(Default)]
pub struct PipelineLayoutBuilder {
    set_layouts: Vec<vk::DescriptorSetLayout>,
    push_constants: Vec<vk::PushConstantRange>,
}

impl PipelineLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets are numbered in the order they are added.
    pub fn set_layout(mut self, layout: &DescriptorSetLayout) -> Self {
        self.set_layouts.push(layout.handle());
        self
    }

    pub fn push_constants(mut self, stages: vk::ShaderStageFlags, offset: u32, size: u32) -> Self {
        self.push_constants.push(
            vk::PushConstantRange::builder()
                .stage_flags(stages)
                .offset(offset)
                .size(size)
                .build(),
        );
        self
    }

    pub fn build(&self, device: Arc<dyn GpuDevice>) -> Result<PipelineLayout> {
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&self.set_layouts)
            .push_constant_ranges(&self.push_constants);
        let handle = device.create_pipeline_layout(&layout_info)?;
        Ok(PipelineLayout { device, handle })
    }
}

pub struct PipelineLayout {
    device: Arc<dyn GpuDevice>,
    handle: vk::PipelineLayout,
}

impl PipelineLayout {
    pub fn handle(&self) -> vk::PipelineLayout {
        self.handle
    }

    pub fn destroy(&mut self) {
        if self.handle != vk::PipelineLayout::null() {
            self.device.destroy_pipeline_layout(self.handle);
            self.handle = vk::PipelineLayout::null();
        }
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// A compiled shader module bound to a pipeline stage. The module is owned
/// by whoever loaded it.
#[derive(Debug, Clone)]
pub struct ShaderStage {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
    pub entry: CString,
}

impl ShaderStage {
    pub fn new(stage: vk::ShaderStageFlags, module: vk::ShaderModule) -> Self {
        Self { stage, module, entry: DEFAULT_ENTRY_POINT.to_owned() }
    }

    pub fn vertex(module: vk::ShaderModule) -> Self {
        Self::new(vk::ShaderStageFlags::VERTEX, module)
    }

    pub fn fragment(module: vk::ShaderModule) -> Self {
        Self::new(vk::ShaderStageFlags::FRAGMENT, module)
    }
}

#[derive(Debug, Clone, Default)]
pub struct VertexInputLayout {
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

impl VertexInputLayout {
    /// One interleaved per-vertex binding; attributes get consecutive
    /// locations and packed offsets. Fails on a format we cannot size.
    pub fn interleaved(binding: u32, formats: &[vk::Format]) -> Result<Self> {
        let mut offset = 0;
        let mut attributes = Vec::with_capacity(formats.len());
        for (location, &format) in formats.iter().enumerate() {
            let size = format_size(format).ok_or(GpuError::UnsupportedVertexFormat(format))?;
            attributes.push(
                vk::VertexInputAttributeDescription::builder()
                    .binding(binding)
                    .location(location as u32)
                    .format(format)
                    .offset(offset)
                    .build(),
            );
            offset += size;
        }

        let binding = vk::VertexInputBindingDescription::builder()
            .binding(binding)
            .stride(offset)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build();

        Ok(Self { bindings: vec![binding], attributes })
    }
}

/// Size in bytes of one vertex attribute of `format`.
fn format_size(format: vk::Format) -> Option<u32> {
    use vk::Format as F;
    let size = match format {
        F::R8_UNORM | F::R8_SNORM | F::R8_UINT | F::R8_SINT | F::R8_SRGB => 1,

        F::R8G8_UNORM | F::R8G8_SNORM | F::R8G8_UINT | F::R8G8_SINT | F::R8G8_SRGB
        | F::R16_UNORM | F::R16_SNORM | F::R16_UINT | F::R16_SINT | F::R16_SFLOAT => 2,

        F::R8G8B8_UNORM | F::R8G8B8_SNORM | F::R8G8B8_UINT | F::R8G8B8_SINT | F::R8G8B8_SRGB => 3,

        F::R8G8B8A8_UNORM | F::R8G8B8A8_SNORM | F::R8G8B8A8_UINT | F::R8G8B8A8_SINT
        | F::R8G8B8A8_SRGB | F::B8G8R8A8_UNORM | F::B8G8R8A8_SRGB
        | F::A2B10G10R10_UNORM_PACK32 | F::A2R10G10B10_UNORM_PACK32
        | F::R16G16_UNORM | F::R16G16_SNORM | F::R16G16_UINT | F::R16G16_SINT | F::R16G16_SFLOAT
        | F::R32_UINT | F::R32_SINT | F::R32_SFLOAT => 4,

        F::R16G16B16_UNORM | F::R16G16B16_SNORM | F::R16G16B16_UINT | F::R16G16B16_SINT
        | F::R16G16B16_SFLOAT => 6,

        F::R16G16B16A16_UNORM | F::R16G16B16A16_SNORM | F::R16G16B16A16_UINT
        | F::R16G16B16A16_SINT | F::R16G16B16A16_SFLOAT
        | F::R32G32_UINT | F::R32G32_SINT | F::R32G32_SFLOAT | F::R64_SFLOAT => 8,

        F::R32G32B32_UINT | F::R32G32B32_SINT | F::R32G32B32_SFLOAT => 12,

        F::R32G32B32A32_UINT | F::R32G32B32A32_SINT | F::R32G32B32A32_SFLOAT
        | F::R64G64_SFLOAT => 16,

        F::R64G64B64_SFLOAT => 24,
        F::R64G64B64A64_SFLOAT => 32,
        _ => return None,
    };
    Some(size)
}

/// Everything needed to build a graphics pipeline against a render pass.
#[derive(Debug, Clone)]
pub struct GraphicsPipelineSpec {
    pub stages: Vec<ShaderStage>,
    pub vertex_input: VertexInputLayout,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare_op: vk::CompareOp,
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub subpass: u32,
    pub layout: vk::PipelineLayout,
}

impl GraphicsPipelineSpec {
    /// Opaque, depth-tested triangle list matching `render_pass`.
    pub fn for_render_pass(
        render_pass: &RenderPass,
        layout: &PipelineLayout,
        stages: Vec<ShaderStage>,
    ) -> Self {
        let pass = render_pass.spec();
        Self {
            stages,
            vertex_input: VertexInputLayout::default(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: true,
            depth_write: true,
            depth_compare_op: vk::CompareOp::LESS,
            color_format: pass.color_format(),
            depth_format: pass.depth_format(),
            samples: pass.samples(),
            subpass: 0,
            layout: layout.handle(),
        }
    }

    pub fn vertex_input(mut self, vertex_input: VertexInputLayout) -> Self {
        self.vertex_input = vertex_input;
        self
    }

    /// Fails with `IncompatibleRenderPass` when the targets disagree with `render_pass`.
    pub fn check_compatible(&self, render_pass: &RenderPass) -> Result<()> {
        let pass = render_pass.spec();
        if self.subpass >= pass.subpass_count() {
            return Err(GpuError::IncompatibleRenderPass(format!(
                "subpass {} does not exist, render pass has {}",
                self.subpass,
                pass.subpass_count()
            )));
        }
        if self.color_format != pass.color_format() {
            return Err(GpuError::IncompatibleRenderPass(format!(
                "pipeline color format {:?}, render pass {:?}",
                self.color_format,
                pass.color_format()
            )));
        }
        if self.depth_format != pass.depth_format() {
            return Err(GpuError::IncompatibleRenderPass(format!(
                "pipeline depth format {:?}, render pass {:?}",
                self.depth_format,
                pass.depth_format()
            )));
        }
        if self.samples != pass.samples() {
            return Err(GpuError::IncompatibleRenderPass(format!(
                "pipeline samples {:?}, render pass {:?}",
                self.samples,
                pass.samples()
            )));
        }
        Ok(())
    }
}

pub struct GraphicsPipeline {
    device: Arc<dyn GpuDevice>,
    handle: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl GraphicsPipeline {
    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn destroy(&mut self) {
        if self.handle != vk::Pipeline::null() {
            self.device.destroy_pipeline(self.handle);
            self.handle = vk::Pipeline::null();
        }
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        self.destroy();
    }
}

pub fn build_graphics_pipeline(
    device: Arc<dyn GpuDevice>,
    render_pass: &RenderPass,
    spec: &GraphicsPipelineSpec,
) -> Result<GraphicsPipeline> {
    spec.check_compatible(render_pass)?;
    if spec.polygon_mode != vk::PolygonMode::FILL
        && device.enabled_features().fill_mode_non_solid != vk::TRUE
    {
        return Err(GpuError::MissingFeature("fillModeNonSolid"));
    }

    // Shader stages
    let shader_stages: Vec<_> = spec
        .stages
        .iter()
        .map(|stage| {
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(stage.stage)
                .module(stage.module)
                .name(&stage.entry)
                .build()
        })
        .collect();

    // Vertex input
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&spec.vertex_input.bindings)
        .vertex_attribute_descriptions(&spec.vertex_input.attributes);

    // Input assembly
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(spec.topology)
        .primitive_restart_enable(false);

    // Viewport and scissor are set per frame
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    // Rasterization
    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(spec.polygon_mode)
        .line_width(1.0)
        .cull_mode(spec.cull_mode)
        .front_face(spec.front_face)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(spec.samples);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(spec.depth_test)
        .depth_write_enable(spec.depth_write)
        .depth_compare_op(spec.depth_compare_op)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    // Color blending (no blending, opaque)
    let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)
        .build();

    let color_blend_attachments = &[color_blend_attachment];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(color_blend_attachments);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(spec.layout)
        .render_pass(render_pass.handle())
        .subpass(spec.subpass);

    let handle = device.create_graphics_pipeline(&pipeline_info)?;
    log::debug!(
        "Created graphics pipeline ({} stages, {:?})",
        shader_stages.len(),
        spec.samples
    );

    Ok(GraphicsPipeline { device, handle, layout: spec.layout })
}
