use std::ffi::CString;

use ash::vk;
use kiln::{
    resources::{GraphicsState, KernelDesc, ShaderStage},
    sync_state::KernelKind,
};

use crate::{VkBackendError, resources::VkPipeline};

///Shader modules of one pipeline creation. Modules are only needed until the pipeline exists.
struct Modules<'a> {
    device: &'a ash::Device,
    modules: Vec<vk::ShaderModule>,
    entries: Vec<CString>,
}

impl<'a> Modules<'a> {
    fn new(device: &'a ash::Device, stages: &[ShaderStage]) -> Result<Self, VkBackendError> {
        let mut modules = Modules {
            device,
            modules: Vec::with_capacity(stages.len()),
            entries: Vec::with_capacity(stages.len()),
        };
        for stage in stages {
            let entry = CString::new(stage.entry.as_str())
                .map_err(|_| VkBackendError::Pipeline(format!("entry point {:?}", stage.entry)))?;
            let module = unsafe {
                device.create_shader_module(
                    &vk::ShaderModuleCreateInfo::default().code(&stage.code),
                    None,
                )?
            };
            modules.modules.push(module);
            modules.entries.push(entry);
        }
        Ok(modules)
    }

    fn stage_infos(&self, stages: &[ShaderStage]) -> Vec<vk::PipelineShaderStageCreateInfo<'_>> {
        stages
            .iter()
            .zip(self.modules.iter().zip(self.entries.iter()))
            .map(|(stage, (module, entry))| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage.stage)
                    .module(*module)
                    .name(entry.as_c_str())
            })
            .collect()
    }
}

impl Drop for Modules<'_> {
    fn drop(&mut self) {
        for module in self.modules.drain(..) {
            unsafe { self.device.destroy_shader_module(module, None) };
        }
    }
}

///Creates the pipeline for `desc` on the shared bindless `layout`.
pub(crate) fn create_pipeline(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    desc: &KernelDesc,
) -> Result<VkPipeline, VkBackendError> {
    desc.validate()
        .map_err(|e| VkBackendError::Pipeline(format!("{}: {}", desc.name, e)))?;
    let modules = Modules::new(device, &desc.stages)?;
    let stages = modules.stage_infos(&desc.stages);

    match (desc.kind, &desc.graphics) {
        (KernelKind::Compute, _) => {
            let create_info = vk::ComputePipelineCreateInfo::default()
                .stage(stages[0])
                .layout(layout);
            let mut pipelines = unsafe {
                device
                    .create_compute_pipelines(
                        vk::PipelineCache::null(),
                        core::slice::from_ref(&create_info),
                        None,
                    )
                    .map_err(|(_plines, err)| err)?
            };
            if pipelines.len() != 1 {
                return Err(VkBackendError::Pipeline(desc.name.clone()));
            }
            Ok(VkPipeline {
                inner: pipelines.remove(0),
                bind_point: vk::PipelineBindPoint::COMPUTE,
            })
        }
        (KernelKind::Graphics, Some(state)) => {
            let inner = create_graphics(device, layout, &stages, state)
                .map_err(|e| {
                    #[cfg(feature = "logging")]
                    log::error!("Failed to create graphics pipeline {}: {}", desc.name, e);
                    e
                })?;
            Ok(VkPipeline {
                inner,
                bind_point: vk::PipelineBindPoint::GRAPHICS,
            })
        }
        _ => Err(VkBackendError::Pipeline(desc.name.clone())),
    }
}

fn create_graphics(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    stages: &[vk::PipelineShaderStageCreateInfo<'_>],
    state: &GraphicsState,
) -> Result<vk::Pipeline, VkBackendError> {
    let blend_attachment = if state.alpha_blend {
        vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(vk::ColorComponentFlags::RGBA)
    } else {
        vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(false)
            .color_write_mask(vk::ColorComponentFlags::RGBA)
    };
    let blend_attachments = vec![blend_attachment; state.color_formats.len()];
    let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
        .blend_constants([0.0; 4])
        .attachments(&blend_attachments);

    let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL)
        .depth_write_enable(state.depth_test)
        .depth_test_enable(state.depth_test)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let dynamic_state = vk::PipelineDynamicStateCreateInfo::default()
        .dynamic_states(&[vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR]);
    let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
        .primitive_restart_enable(false)
        .topology(state.topology);
    let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
        .min_sample_shading(1.0)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);
    let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
        .cull_mode(state.cull_mode)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0)
        .polygon_mode(vk::PolygonMode::FILL);
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let (bindings, attributes) = vertex_input(state);
    let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
        .color_attachment_formats(&state.color_formats)
        .depth_attachment_format(state.depth_format.unwrap_or(vk::Format::UNDEFINED));

    let create_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(stages)
        .color_blend_state(&color_blend_state)
        .depth_stencil_state(&depth_stencil_state)
        .dynamic_state(&dynamic_state)
        .input_assembly_state(&input_assembly_state)
        .multisample_state(&multisample_state)
        .rasterization_state(&rasterization_state)
        .viewport_state(&viewport_state)
        .vertex_input_state(&vertex_input_state)
        .render_pass(vk::RenderPass::null())
        .layout(layout)
        .push_next(&mut rendering_info);

    let mut pipelines = unsafe {
        device
            .create_graphics_pipelines(
                vk::PipelineCache::null(),
                core::slice::from_ref(&create_info),
                None,
            )
            .map_err(|(_plines, err)| err)?
    };
    if pipelines.len() != 1 {
        return Err(VkBackendError::Vk(vk::Result::ERROR_INITIALIZATION_FAILED));
    }
    Ok(pipelines.remove(0))
}

///Vertex bindings are numbered in declaration order.
fn vertex_input(
    state: &GraphicsState,
) -> (
    Vec<vk::VertexInputBindingDescription>,
    Vec<vk::VertexInputAttributeDescription>,
) {
    let bindings = state
        .vertex_bindings
        .iter()
        .enumerate()
        .map(|(idx, b)| {
            vk::VertexInputBindingDescription::default()
                .binding(idx as u32)
                .stride(b.stride)
                .input_rate(vk::VertexInputRate::VERTEX)
        })
        .collect();
    let attributes = state
        .vertex_bindings
        .iter()
        .enumerate()
        .flat_map(|(idx, b)| {
            b.attributes.iter().map(move |a| {
                vk::VertexInputAttributeDescription::default()
                    .location(a.location)
                    .binding(idx as u32)
                    .format(a.format)
                    .offset(a.offset)
            })
        })
        .collect();
    (bindings, attributes)
}
