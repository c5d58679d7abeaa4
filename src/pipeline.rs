//! Shader modules and the graphics pipeline.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use vulkanalia::prelude::v1_0::*;

use crate::descriptor::DescriptorSetLayout;
use crate::device::VulkanDevice;
use crate::error::{RenderError, VkResultExt};
use crate::mesh::Vertex;
use crate::render_pass::RenderPass;

/// Splits SPIR-V bytecode into 32-bit words. The length must be a non-zero
/// multiple of 4.
pub fn spirv_words(bytecode: &[u8]) -> Result<Vec<u32>, RenderError> {
    if bytecode.is_empty() || bytecode.len() % 4 != 0 {
        return Err(RenderError::InvalidShaderBytecode {
            len: bytecode.len(),
        });
    }
    Ok(bytecode
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect())
}

pub struct ShaderModule {
    device: Arc<VulkanDevice>,
    handle: vk::ShaderModule,
}

impl ShaderModule {
    pub unsafe fn new(device: Arc<VulkanDevice>, bytecode: &[u8]) -> Result<Self> {
        let code = spirv_words(bytecode)?;
        let info = vk::ShaderModuleCreateInfo::builder()
            .code_size(bytecode.len())
            .code(&code);

        let handle = device
            .create_shader_module(&info, None)
            .or_fail("shader module")?;

        Ok(Self { device, handle })
    }

    pub unsafe fn load<P: AsRef<Path>>(device: Arc<VulkanDevice>, path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytecode =
            std::fs::read(path).with_context(|| format!("Failed to read shader {:?}", path))?;
        log::debug!("Loaded shader {:?} ({} bytes)", path, bytecode.len());
        Self::new(device, &bytecode).with_context(|| format!("Invalid shader {:?}", path))
    }

    pub fn handle(&self) -> vk::ShaderModule {
        self.handle
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.destroy_shader_module(self.handle, None) };
    }
}

/// The one graphics pipeline: depth-tested, back-face culled triangles with
/// a fixed viewport matching the swapchain extent.
pub struct GraphicsPipeline {
    device: Arc<VulkanDevice>,
    layout: vk::PipelineLayout,
    handle: vk::Pipeline,
}

impl GraphicsPipeline {
    pub unsafe fn new(
        device: Arc<VulkanDevice>,
        render_pass: &RenderPass,
        descriptor_set_layout: &DescriptorSetLayout,
        vertex_shader: &ShaderModule,
        fragment_shader: &ShaderModule,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let vert_stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex_shader.handle())
            .name(b"main\0");

        let frag_stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(fragment_shader.handle())
            .name(b"main\0");

        let binding_descriptions = &[Vertex::binding_description()];
        let attribute_descriptions = &Vertex::attribute_descriptions();
        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(binding_descriptions)
            .vertex_attribute_descriptions(attribute_descriptions);

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let viewport = vk::Viewport::builder()
            .x(0.0)
            .y(0.0)
            .width(extent.width as f32)
            .height(extent.height as f32)
            .min_depth(0.0)
            .max_depth(1.0);

        let scissor = vk::Rect2D::builder()
            .offset(vk::Offset2D { x: 0, y: 0 })
            .extent(extent);

        let viewports = &[viewport];
        let scissors = &[scissor];
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewports(viewports)
            .scissors(scissors);

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(render_pass.samples());

        let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0)
            .stencil_test_enable(false);

        let attachment = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::all())
            .blend_enable(false)
            .src_color_blend_factor(vk::BlendFactor::ONE)
            .dst_color_blend_factor(vk::BlendFactor::ZERO)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD);

        let attachments = &[attachment];
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(attachments)
            .blend_constants([0.0, 0.0, 0.0, 0.0]);

        let set_layouts = &[descriptor_set_layout.handle()];
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(set_layouts);
        let layout = device
            .create_pipeline_layout(&layout_info, None)
            .or_fail("pipeline layout")?;

        let stages = &[vert_stage, frag_stage];
        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .layout(layout)
            .render_pass(render_pass.handle())
            .subpass(0);

        let handle = match device.create_graphics_pipelines(vk::PipelineCache::null(), &[info], None) {
            Ok((pipelines, _)) => pipelines[0],
            Err(code) => {
                device.destroy_pipeline_layout(layout, None);
                return Err(RenderError::Creation {
                    what: "graphics pipeline",
                    code,
                }
                .into());
            }
        };

        Ok(Self {
            device,
            layout,
            handle,
        })
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.handle, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_are_little_endian() {
        let words = spirv_words(&[0x03, 0x02, 0x23, 0x07, 1, 0, 0, 0]).unwrap();
        assert_eq!(words, vec![0x0723_0203, 1]);
    }

    #[test]
    fn rejects_partial_words() {
        assert!(matches!(
            spirv_words(&[0x03, 0x02, 0x23]),
            Err(RenderError::InvalidShaderBytecode { len: 3 })
        ));
        assert!(spirv_words(&[0; 6]).is_err());
    }

    #[test]
    fn rejects_empty_bytecode() {
        assert!(matches!(
            spirv_words(&[]),
            Err(RenderError::InvalidShaderBytecode { len: 0 })
        ));
    }
}
