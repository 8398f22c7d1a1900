// Image factories over the shared GPU allocator

use crate::device::VulkanDevice;
use crate::error::vk_check;
use crate::handle::{
    ImageAllocation, ImageDestroyer, ImageView, ImageViewDestroyer, MemoryBlock, UniqueHandle,
};
use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

/// Create a device-local image from the given create info.
pub fn create_device_image(
    device: &VulkanDevice,
    name: &str,
    info: &vk::ImageCreateInfo,
) -> Result<ImageAllocation> {
    let raw = vk_check(
        unsafe { device.device().create_image(info, None) },
        "vkCreateImage",
    )?;
    let image = UniqueHandle::new(
        raw,
        ImageDestroyer {
            device: device.device().clone(),
        },
    );

    let requirements = unsafe { device.device().get_image_memory_requirements(raw) };
    let allocation = device
        .allocator()
        .lock()
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .with_context(|| format!("Failed to allocate memory for image '{name}'"))?;
    let memory = MemoryBlock::new(allocation, device.allocator().clone());

    unsafe {
        vk_check(
            device.device().bind_image_memory(
                raw,
                memory.allocation().memory(),
                memory.allocation().offset(),
            ),
            "vkBindImageMemory",
        )?;
    }

    Ok(ImageAllocation::new(image, memory))
}

/// Create an image view.
pub fn create_image_view(
    device: &ash::Device,
    info: &vk::ImageViewCreateInfo,
) -> Result<ImageView> {
    let view = vk_check(
        unsafe { device.create_image_view(info, None) },
        "vkCreateImageView",
    )?;
    Ok(UniqueHandle::new(
        view,
        ImageViewDestroyer {
            device: device.clone(),
        },
    ))
}

/// Create a depth buffer image and its view for the given extent.
pub fn create_depth_buffer(
    device: &VulkanDevice,
    extent: vk::Extent2D,
) -> Result<(ImageAllocation, ImageView)> {
    let format = vk::Format::D32_SFLOAT;

    let image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .format(format)
        .tiling(vk::ImageTiling::OPTIMAL)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
        .samples(vk::SampleCountFlags::TYPE_1)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let image = create_device_image(device, "depth", &image_info)?;

    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image.image())
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::DEPTH,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });
    let view = create_image_view(device.device(), &view_info)?;

    Ok((image, view))
}
