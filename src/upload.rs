// One-time setup submissions
//
// Transient commands (uploads, acceleration structure builds) are submitted
// once and host-waited through a throwaway timeline semaphore, which is what
// makes destroying staging resources immediately afterwards legal.

use crate::buffer;
use crate::command::{self, SemaphoreOp};
use crate::device::VulkanDevice;
use crate::handle::BufferAllocation;
use crate::sync;
use anyhow::{Context, Result};
use ash::vk;

/// Record commands through `record`, submit them once, and block until the
/// GPU has executed them. Resources referenced only by the recorded commands
/// may be dropped as soon as this returns.
pub fn submit_once<F>(device: &VulkanDevice, record: F) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer) -> Result<()>,
{
    let commands = command::allocate_command_buffers(
        device.device(),
        device.transient_pool(),
        vk::CommandBufferLevel::PRIMARY,
        1,
    )?;
    let cmd = commands.get(0);

    command::begin_one_time(device.device(), cmd)?;
    record(cmd)?;
    command::end(device.device(), cmd)?;

    let done = sync::create_timeline_semaphore(device.device(), 0)?;
    command::submit(
        device.device(),
        device.queue(),
        &[cmd],
        &[],
        &[SemaphoreOp::timeline(
            done.get(),
            vk::PipelineStageFlags2::ALL_COMMANDS,
            1,
        )],
        None,
    )
    .context("one-time submission")?;
    sync::wait_semaphores(device.device(), &[(done.get(), 1)], u64::MAX)
        .context("waiting for one-time submission")?;

    Ok(())
}

/// Upload `data` into a new device-local buffer through a staging buffer.
/// The staging buffer is destroyed once the copy has executed.
pub fn upload_device_buffer<T: Copy>(
    device: &VulkanDevice,
    usage: vk::BufferUsageFlags,
    data: &[T],
) -> Result<BufferAllocation> {
    let staging = buffer::create_buffer_with_data(device, vk::BufferUsageFlags::TRANSFER_SRC, data)?;
    let size = staging.size();
    let destination =
        buffer::create_device_buffer(device, size, usage | vk::BufferUsageFlags::TRANSFER_DST)?;

    submit_once(device, |cmd| {
        buffer::record_copy_buffer(
            device.device(),
            cmd,
            staging.buffer(),
            destination.buffer(),
            size,
        );
        Ok(())
    })?;

    Ok(destination)
}
