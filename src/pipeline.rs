// Pipeline layout and pipeline creation
//
// Only the lifetime-relevant seam lives here: content renderers own their
// full graphics pipeline state and receive owned handles back.

use crate::error::vk_check;
use crate::handle::{
    Pipeline, PipelineDestroyer, PipelineLayout, PipelineLayoutDestroyer, UniqueHandle,
};
use anyhow::Result;
use ash::vk;

/// Create a pipeline layout over the given set layouts and push ranges.
pub fn create_pipeline_layout(
    device: &ash::Device,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constant_ranges: &[vk::PushConstantRange],
) -> Result<PipelineLayout> {
    let info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(set_layouts)
        .push_constant_ranges(push_constant_ranges);
    let layout = vk_check(
        unsafe { device.create_pipeline_layout(&info, None) },
        "vkCreatePipelineLayout",
    )?;
    Ok(UniqueHandle::new(
        layout,
        PipelineLayoutDestroyer {
            device: device.clone(),
        },
    ))
}

/// Create a compute pipeline. Pass
/// `vk::PipelineCreateFlags::DESCRIPTOR_BUFFER_EXT` when the pipeline binds
/// through a descriptor buffer.
pub fn create_compute_pipeline(
    device: &ash::Device,
    flags: vk::PipelineCreateFlags,
    layout: vk::PipelineLayout,
    stage: vk::PipelineShaderStageCreateInfo,
) -> Result<Pipeline> {
    let info = vk::ComputePipelineCreateInfo::builder()
        .flags(flags)
        .stage(stage)
        .layout(layout)
        .build();

    let pipelines = vk_check(
        unsafe {
            device
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
                .map_err(|(_, e)| e)
        },
        "vkCreateComputePipelines",
    )?;

    Ok(UniqueHandle::new(
        pipelines[0],
        PipelineDestroyer {
            device: device.clone(),
        },
    ))
}
