// Command pool and submission management
//
// Recording is a two-phase protocol: begin-one-time for primary buffers that
// are executed once then recycled by a pool reset, and a secondary variant
// for buffers only ever executed through vkCmdExecuteCommands. Submission
// goes through vkQueueSubmit2 with explicit wait/signal semaphore operations.

use crate::error::vk_check;
use crate::handle::{CommandBufferSet, CommandPool, CommandPoolDestroyer, UniqueHandle};
use anyhow::Result;
use ash::vk;

/// A semaphore paired with the pipeline stage at which it takes effect.
/// `value` is only meaningful for timeline semaphores.
#[derive(Debug, Clone, Copy)]
pub struct SemaphoreOp {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags2,
    pub value: u64,
}

impl SemaphoreOp {
    pub fn binary(semaphore: vk::Semaphore, stage: vk::PipelineStageFlags2) -> Self {
        Self {
            semaphore,
            stage,
            value: 0,
        }
    }

    pub fn timeline(semaphore: vk::Semaphore, stage: vk::PipelineStageFlags2, value: u64) -> Self {
        Self {
            semaphore,
            stage,
            value,
        }
    }
}

/// Create a command pool for the given queue family.
pub fn create_command_pool(
    device: &ash::Device,
    flags: vk::CommandPoolCreateFlags,
    queue_family: u32,
) -> Result<CommandPool> {
    let info = vk::CommandPoolCreateInfo::builder()
        .flags(flags)
        .queue_family_index(queue_family);
    let pool = vk_check(
        unsafe { device.create_command_pool(&info, None) },
        "vkCreateCommandPool",
    )?;
    Ok(UniqueHandle::new(
        pool,
        CommandPoolDestroyer {
            device: device.clone(),
        },
    ))
}

/// Allocate `count` command buffers from one pool in a single API call;
/// they are freed together when the returned set is dropped.
pub fn allocate_command_buffers(
    device: &ash::Device,
    pool: vk::CommandPool,
    level: vk::CommandBufferLevel,
    count: u32,
) -> Result<CommandBufferSet> {
    let info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(pool)
        .level(level)
        .command_buffer_count(count);
    let buffers = vk_check(
        unsafe { device.allocate_command_buffers(&info) },
        "vkAllocateCommandBuffers",
    )?;
    Ok(CommandBufferSet::from_raw(buffers, pool, device.clone()))
}

/// Begin a primary command buffer for one-time submission.
pub fn begin_one_time(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    let info =
        vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    vk_check(
        unsafe { device.begin_command_buffer(cmd, &info) },
        "vkBeginCommandBuffer",
    )?;
    Ok(())
}

/// Begin a secondary command buffer for one-time submission, with no
/// inherited render pass state.
pub fn begin_one_time_secondary(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    let inheritance = vk::CommandBufferInheritanceInfo::builder();
    let info = vk::CommandBufferBeginInfo::builder()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
        .inheritance_info(&inheritance);
    vk_check(
        unsafe { device.begin_command_buffer(cmd, &info) },
        "vkBeginCommandBuffer",
    )?;
    Ok(())
}

/// End recording. Ending a buffer that was never begun is caught by the
/// validation layer and escalated through the device's fatal latch.
pub fn end(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    vk_check(
        unsafe { device.end_command_buffer(cmd) },
        "vkEndCommandBuffer",
    )?;
    Ok(())
}

/// Submit command buffers with their wait/signal semaphore operations.
///
/// If a fence is supplied it is reset immediately BEFORE submission, never
/// after. Submission errors are fatal to the frame and propagated; there is
/// no retry.
pub fn submit(
    device: &ash::Device,
    queue: vk::Queue,
    commands: &[vk::CommandBuffer],
    waits: &[SemaphoreOp],
    signals: &[SemaphoreOp],
    fence: Option<vk::Fence>,
) -> Result<()> {
    let command_infos: Vec<vk::CommandBufferSubmitInfo> = commands
        .iter()
        .map(|&cmd| {
            vk::CommandBufferSubmitInfo::builder()
                .command_buffer(cmd)
                .build()
        })
        .collect();
    let wait_infos: Vec<vk::SemaphoreSubmitInfo> =
        waits.iter().map(|op| semaphore_submit_info(op)).collect();
    let signal_infos: Vec<vk::SemaphoreSubmitInfo> =
        signals.iter().map(|op| semaphore_submit_info(op)).collect();

    let submit_info = vk::SubmitInfo2::builder()
        .wait_semaphore_infos(&wait_infos)
        .command_buffer_infos(&command_infos)
        .signal_semaphore_infos(&signal_infos);

    let fence = fence.unwrap_or_else(vk::Fence::null);
    unsafe {
        if fence != vk::Fence::null() {
            vk_check(device.reset_fences(&[fence]), "vkResetFences")?;
        }
        vk_check(
            device.queue_submit2(queue, &[submit_info.build()], fence),
            "vkQueueSubmit2",
        )?;
    }
    Ok(())
}

fn semaphore_submit_info(op: &SemaphoreOp) -> vk::SemaphoreSubmitInfo {
    vk::SemaphoreSubmitInfo::builder()
        .semaphore(op.semaphore)
        .value(op.value)
        .stage_mask(op.stage)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_op_carries_no_counter_value() {
        let op = SemaphoreOp::binary(vk::Semaphore::null(), vk::PipelineStageFlags2::ALL_COMMANDS);
        assert_eq!(op.value, 0);
    }

    #[test]
    fn submit_info_mirrors_the_operation() {
        let op = SemaphoreOp::timeline(
            vk::Semaphore::null(),
            vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
            41,
        );
        let info = semaphore_submit_info(&op);
        assert_eq!(info.value, 41);
        assert_eq!(
            info.stage_mask,
            vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR
        );
    }
}
