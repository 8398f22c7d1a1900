// Buffer factories over the shared GPU allocator
//
// Each factory fixes the usage/memory-location pairing for one role:
// staging, transient host, device-local, global storage, descriptor.

use crate::device::VulkanDevice;
use crate::error::vk_check;
use crate::handle::{BufferAllocation, BufferDestroyer, MemoryBlock, UniqueHandle};
use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

fn create_buffer(
    device: &VulkanDevice,
    name: &str,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
) -> Result<BufferAllocation> {
    let info = vk::BufferCreateInfo::builder()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let raw = vk_check(
        unsafe { device.device().create_buffer(&info, None) },
        "vkCreateBuffer",
    )?;
    // wrap immediately so the buffer is reclaimed if allocation fails
    let buffer = UniqueHandle::new(
        raw,
        BufferDestroyer {
            device: device.device().clone(),
        },
    );

    let requirements = unsafe { device.device().get_buffer_memory_requirements(raw) };
    let allocation = device
        .allocator()
        .lock()
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .with_context(|| format!("Failed to allocate memory for buffer '{name}'"))?;
    let memory = MemoryBlock::new(allocation, device.allocator().clone());

    unsafe {
        vk_check(
            device.device().bind_buffer_memory(
                raw,
                memory.allocation().memory(),
                memory.allocation().offset(),
            ),
            "vkBindBufferMemory",
        )?;
    }

    Ok(BufferAllocation::new(buffer, memory, size))
}

/// Host-visible staging buffer for memory transfer to the device.
pub fn create_staging_buffer(device: &VulkanDevice, size: vk::DeviceSize) -> Result<BufferAllocation> {
    create_buffer(
        device,
        "staging",
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryLocation::CpuToGpu,
    )
}

/// Host-visible buffer for temporary use with caller-chosen usage.
pub fn create_transient_host_buffer(
    device: &VulkanDevice,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
) -> Result<BufferAllocation> {
    create_buffer(device, "transient-host", size, usage, MemoryLocation::CpuToGpu)
}

/// Device-local buffer.
pub fn create_device_buffer(
    device: &VulkanDevice,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
) -> Result<BufferAllocation> {
    create_buffer(device, "device-local", size, usage, MemoryLocation::GpuOnly)
}

/// Persistently mapped storage buffer shared with all shaders (camera-buffer
/// pattern); its device address may be fetched.
pub fn create_global_storage_buffer(
    device: &VulkanDevice,
    size: vk::DeviceSize,
) -> Result<BufferAllocation> {
    create_buffer(
        device,
        "global-storage",
        size,
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::CpuToGpu,
    )
}

/// Persistently mapped buffer backing a descriptor buffer; a device address
/// usage is implicitly applied.
pub fn create_descriptor_buffer(
    device: &VulkanDevice,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
) -> Result<BufferAllocation> {
    create_buffer(
        device,
        "descriptor",
        size,
        usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::CpuToGpu,
    )
}

/// Create a host-visible buffer and fill it with `data`, flushing the
/// written range so the device observes it.
pub fn create_buffer_with_data<T: Copy>(
    device: &VulkanDevice,
    usage: vk::BufferUsageFlags,
    data: &[T],
) -> Result<BufferAllocation> {
    let size = std::mem::size_of_val(data) as vk::DeviceSize;
    let buffer = create_transient_host_buffer(device, size, usage)?;

    let ptr = buffer
        .mapped_ptr()
        .context("host-visible buffer is not mapped")?;
    unsafe {
        std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr() as *mut T, data.len());
    }
    flush_ranges(device, buffer.memory(), &[(0, size)])?;

    Ok(buffer)
}

/// Get the device address of a buffer.
pub fn device_address(device: &VulkanDevice, buffer: vk::Buffer) -> vk::DeviceAddress {
    let info = vk::BufferDeviceAddressInfo::builder().buffer(buffer);
    unsafe { device.device().get_buffer_device_address(&info) }
}

/// Record a copy between two buffers, from the start of each. The
/// destination must have at least as much space as the copied size.
pub fn record_copy_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    source: vk::Buffer,
    destination: vk::Buffer,
    size: vk::DeviceSize,
) {
    let region = vk::BufferCopy2::builder().size(size).build();
    let regions = [region];
    let info = vk::CopyBufferInfo2::builder()
        .src_buffer(source)
        .dst_buffer(destination)
        .regions(&regions);
    unsafe { device.cmd_copy_buffer2(cmd, &info) };
}

/// Flush host writes in the given (offset, size) ranges of one allocation in
/// a single batched call. Ranges are expanded to nonCoherentAtomSize
/// boundaries as the API requires.
pub fn flush_ranges(
    device: &VulkanDevice,
    memory: &MemoryBlock,
    ranges: &[(vk::DeviceSize, vk::DeviceSize)],
) -> Result<()> {
    if ranges.is_empty() {
        return Ok(());
    }
    let atom = device.limits().non_coherent_atom_size;
    let allocation = memory.allocation();
    let mapped_ranges: Vec<vk::MappedMemoryRange> = ranges
        .iter()
        .map(|&(offset, size)| {
            let (offset, size) = align_flush_range(offset, size, atom);
            vk::MappedMemoryRange::builder()
                .memory(unsafe { allocation.memory() })
                .offset(allocation.offset() + offset)
                .size(size)
                .build()
        })
        .collect();

    vk_check(
        unsafe { device.device().flush_mapped_memory_ranges(&mapped_ranges) },
        "vkFlushMappedMemoryRanges",
    )?;
    Ok(())
}

/// Expand a byte range to `atom`-aligned boundaries. `atom` must be a power
/// of two (device-reported nonCoherentAtomSize always is).
pub(crate) fn align_flush_range(
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    atom: vk::DeviceSize,
) -> (vk::DeviceSize, vk::DeviceSize) {
    debug_assert!(atom.is_power_of_two());
    let start = offset & !(atom - 1);
    let end = (offset + size + atom - 1) & !(atom - 1);
    (start, end - start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_range_expands_to_atom_boundaries() {
        assert_eq!(align_flush_range(65, 10, 64), (64, 64));
        assert_eq!(align_flush_range(64, 64, 64), (64, 64));
        assert_eq!(align_flush_range(60, 10, 64), (0, 128));
    }

    #[test]
    fn aligned_range_never_shrinks() {
        for offset in [0u64, 1, 63, 64, 100, 4095] {
            for size in [1u64, 64, 100, 4096] {
                let (start, aligned) = align_flush_range(offset, size, 256);
                assert!(start <= offset);
                assert!(start + aligned >= offset + size);
                assert_eq!(start % 256, 0);
                assert_eq!(aligned % 256, 0);
            }
        }
    }
}
