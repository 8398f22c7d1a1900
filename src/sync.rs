// Synchronization primitives
//
// Binary semaphores are GPU-to-GPU, single-shot: one pending signal,
// consumed by exactly one wait. Timeline semaphores carry a monotonically
// non-decreasing 64-bit counter observable from host and GPU; for a given
// logical meaning there must be exactly one incrementing writer.

use crate::error::vk_check;
use crate::handle::{Semaphore, SemaphoreDestroyer, UniqueHandle};
use anyhow::Result;
use ash::vk;

/// Create a binary semaphore.
pub fn create_binary_semaphore(device: &ash::Device) -> Result<Semaphore> {
    let info = vk::SemaphoreCreateInfo::builder();
    let semaphore = vk_check(
        unsafe { device.create_semaphore(&info, None) },
        "vkCreateSemaphore",
    )?;
    Ok(UniqueHandle::new(
        semaphore,
        SemaphoreDestroyer {
            device: device.clone(),
        },
    ))
}

/// Create a timeline semaphore starting at `initial_value`.
pub fn create_timeline_semaphore(device: &ash::Device, initial_value: u64) -> Result<Semaphore> {
    let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
        .semaphore_type(vk::SemaphoreType::TIMELINE)
        .initial_value(initial_value);
    let info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);
    let semaphore = vk_check(
        unsafe { device.create_semaphore(&info, None) },
        "vkCreateSemaphore",
    )?;
    Ok(UniqueHandle::new(
        semaphore,
        SemaphoreDestroyer {
            device: device.clone(),
        },
    ))
}

/// Host-wait until every listed timeline semaphore reaches its value.
///
/// `timeout_ns` bounds the wait; pass [`u64::MAX`] where the bound is
/// enforced by construction instead (frame pacing, one-time setup).
pub fn wait_semaphores(
    device: &ash::Device,
    waits: &[(vk::Semaphore, u64)],
    timeout_ns: u64,
) -> Result<()> {
    // transform from AoS to SoA as the wait info wants parallel arrays
    let semaphores: Vec<vk::Semaphore> = waits.iter().map(|&(s, _)| s).collect();
    let values: Vec<u64> = waits.iter().map(|&(_, v)| v).collect();

    let wait_info = vk::SemaphoreWaitInfo::builder()
        .semaphores(&semaphores)
        .values(&values);

    vk_check(
        unsafe { device.wait_semaphores(&wait_info, timeout_ns) },
        "vkWaitSemaphores",
    )?;
    Ok(())
}

/// Read the current counter of a timeline semaphore from the host.
pub fn counter_value(device: &ash::Device, semaphore: vk::Semaphore) -> Result<u64> {
    let value = vk_check(
        unsafe { device.get_semaphore_counter_value(semaphore) },
        "vkGetSemaphoreCounterValue",
    )?;
    Ok(value)
}
