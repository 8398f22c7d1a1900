// Shader module creation from caller-supplied SPIR-V byte spans
//
// Compilation happens outside this crate; bytecode arrives as opaque bytes.

use crate::error::vk_check;
use crate::handle::{ShaderModule, ShaderModuleDestroyer, UniqueHandle};
use anyhow::{bail, Result};
use ash::vk;
use std::ffi::CStr;

/// Reinterpret a SPIR-V byte span as 4-byte words, copying so the result is
/// aligned regardless of the input.
fn spirv_words(code: &[u8]) -> Result<Vec<u32>> {
    if code.is_empty() || code.len() % 4 != 0 {
        bail!(
            "SPIR-V bytecode must be a non-empty multiple of 4 bytes, got {}",
            code.len()
        );
    }
    Ok(code
        .chunks_exact(4)
        .map(|chunk| u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Create a shader module from SPIR-V bytes.
pub fn create_shader_module(device: &ash::Device, code: &[u8]) -> Result<ShaderModule> {
    let words = spirv_words(code)?;
    let info = vk::ShaderModuleCreateInfo::builder().code(&words);
    let module = vk_check(
        unsafe { device.create_shader_module(&info, None) },
        "vkCreateShaderModule",
    )?;
    Ok(UniqueHandle::new(
        module,
        ShaderModuleDestroyer {
            device: device.clone(),
        },
    ))
}

/// One compiled stage of a pipeline.
pub struct ShaderStage {
    pub stage: vk::ShaderStageFlags,
    pub module: ShaderModule,
}

/// Build all stages of a pipeline eagerly, in the given order. All stages
/// are known up front and consumed immediately by pipeline creation, so a
/// strict collection is sufficient.
pub fn load_stages(
    device: &ash::Device,
    sources: &[(vk::ShaderStageFlags, &[u8])],
) -> Result<Vec<ShaderStage>> {
    sources
        .iter()
        .map(|&(stage, code)| {
            Ok(ShaderStage {
                stage,
                module: create_shader_module(device, code)?,
            })
        })
        .collect()
}

/// Flatten loaded stages into pipeline stage create infos. The entry point
/// must outlive pipeline creation.
pub fn stage_create_infos(
    stages: &[ShaderStage],
    entry_point: &CStr,
) -> Vec<vk::PipelineShaderStageCreateInfo> {
    stages
        .iter()
        .map(|s| {
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(s.stage)
                .module(s.module.get())
                .name(entry_point)
                .build()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_word_multiple_spans() {
        assert!(spirv_words(&[0u8; 7]).is_err());
        assert!(spirv_words(&[]).is_err());
    }

    #[test]
    fn preserves_word_count_and_content() {
        let bytes = 0x0723_0203u32.to_ne_bytes();
        let mut code = Vec::new();
        code.extend_from_slice(&bytes);
        code.extend_from_slice(&bytes);
        let words = spirv_words(&code).unwrap();
        assert_eq!(words, vec![0x0723_0203, 0x0723_0203]);
    }
}
