// Descriptor buffer management
//
// One packed, linearly addressed buffer holds the binding tables of a set of
// descriptor set layouts. Updates go through an updater session: at most one
// may be alive per manager, writes land in the persistently mapped backing
// allocation, and the recorded ranges are flushed in one batched call when
// the session ends.

use crate::buffer::{self, flush_ranges};
use crate::device::{DeviceLimits, VulkanDevice};
use crate::error::{vk_check, BackendError};
use crate::handle::{
    BufferAllocation, DescriptorSetLayout, DescriptorSetLayoutDestroyer, UniqueHandle,
};
use anyhow::Result;
use ash::vk;
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

/// Create a descriptor set layout usable with descriptor buffers.
pub fn create_descriptor_set_layout(
    device: &ash::Device,
    bindings: &[vk::DescriptorSetLayoutBinding],
) -> Result<DescriptorSetLayout> {
    let info = vk::DescriptorSetLayoutCreateInfo::builder()
        .flags(vk::DescriptorSetLayoutCreateFlags::DESCRIPTOR_BUFFER_EXT)
        .bindings(bindings);
    let layout = vk_check(
        unsafe { device.create_descriptor_set_layout(&info, None) },
        "vkCreateDescriptorSetLayout",
    )?;
    Ok(UniqueHandle::new(
        layout,
        DescriptorSetLayoutDestroyer {
            device: device.clone(),
        },
    ))
}

/// Byte size of one descriptor of the given type, per device limits.
pub fn descriptor_size(
    limits: &DeviceLimits,
    ty: vk::DescriptorType,
) -> Result<usize, BackendError> {
    let props = &limits.descriptor_buffer;
    match ty {
        vk::DescriptorType::SAMPLER => Ok(props.sampler_descriptor_size),
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER => Ok(props.combined_image_sampler_descriptor_size),
        vk::DescriptorType::UNIFORM_BUFFER => Ok(props.uniform_buffer_descriptor_size),
        vk::DescriptorType::STORAGE_BUFFER => Ok(props.storage_buffer_descriptor_size),
        vk::DescriptorType::ACCELERATION_STRUCTURE_KHR => {
            Ok(props.acceleration_structure_descriptor_size)
        }
        other => Err(BackendError::UnsupportedDescriptor(other)),
    }
}

/// Round every size except the last up to `alignment`, then convert to
/// offsets by exclusive prefix sum. Returns (offsets, total buffer size).
/// `alignment` must be a power of two.
pub(crate) fn pack_set_offsets(
    sizes: &[vk::DeviceSize],
    alignment: vk::DeviceSize,
) -> (Vec<vk::DeviceSize>, vk::DeviceSize) {
    debug_assert!(alignment.is_power_of_two());
    let round_up = |v: vk::DeviceSize| (v + alignment - 1) & !(alignment - 1);

    let mut slots: Vec<vk::DeviceSize> = sizes
        .iter()
        .enumerate()
        .map(|(i, &size)| {
            if i + 1 == sizes.len() {
                size
            } else {
                round_up(size)
            }
        })
        .collect();
    let total = slots.iter().sum();

    let mut running = 0;
    for slot in slots.iter_mut() {
        let size = *slot;
        *slot = running;
        running += size;
    }
    (slots, total)
}

/// Single-writer session gate. A runtime check rather than a borrow because
/// the busy state must be observable (and reportable) across call sites.
struct UpdaterGate(Cell<bool>);

impl UpdaterGate {
    fn acquire(&self) -> Result<(), BackendError> {
        if self.0.get() {
            return Err(BackendError::UpdaterBusy);
        }
        self.0.set(true);
        Ok(())
    }

    fn release(&self) {
        self.0.set(false);
    }
}

/// The raw descriptor payload for one update.
pub enum DescriptorPayload {
    Sampler(vk::Sampler),
    CombinedImageSampler(vk::DescriptorImageInfo),
    UniformBuffer(vk::DescriptorAddressInfoEXT),
    StorageBuffer(vk::DescriptorAddressInfoEXT),
    AccelerationStructure(vk::DeviceAddress),
}

impl DescriptorPayload {
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            Self::Sampler(_) => vk::DescriptorType::SAMPLER,
            Self::CombinedImageSampler(_) => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            Self::UniformBuffer(_) => vk::DescriptorType::UNIFORM_BUFFER,
            Self::StorageBuffer(_) => vk::DescriptorType::STORAGE_BUFFER,
            Self::AccelerationStructure(_) => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        }
    }
}

/// One descriptor write.
pub struct DescriptorUpdate {
    /// Must be the layout passed at the same index during construction.
    pub set_layout: vk::DescriptorSetLayout,
    /// Index into the layout array the manager was constructed with.
    pub set_index: usize,
    /// Binding location within the set.
    pub binding: u32,
    /// Array layer index within the binding.
    pub array_layer: u32,
    pub payload: DescriptorPayload,
}

/// A packed descriptor buffer over a fixed set of descriptor set layouts.
pub struct DescriptorBufferManager {
    buffer: BufferAllocation,
    offsets: Vec<vk::DeviceSize>,
    flush: RefCell<Vec<(vk::DeviceSize, vk::DeviceSize)>>,
    gate: UpdaterGate,
}

impl DescriptorBufferManager {
    /// Build the backing buffer for `set_layouts`. A buffer device address
    /// usage is implicitly applied on top of `usage`.
    pub fn new(
        device: &VulkanDevice,
        set_layouts: &[vk::DescriptorSetLayout],
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        let loader = device.descriptor_buffer_loader();
        let sizes: Vec<vk::DeviceSize> = set_layouts
            .iter()
            .map(|&layout| unsafe { loader.get_descriptor_set_layout_size(layout) })
            .collect();

        let alignment = device
            .limits()
            .descriptor_buffer
            .descriptor_buffer_offset_alignment;
        let (offsets, total_size) = pack_set_offsets(&sizes, alignment);

        let buffer = buffer::create_descriptor_buffer(device, total_size, usage)?;
        log::debug!(
            "Descriptor buffer: {} sets, {} bytes, alignment {}",
            set_layouts.len(),
            total_size,
            alignment
        );

        Ok(Self {
            buffer,
            offsets,
            flush: RefCell::new(Vec::new()),
            gate: UpdaterGate(Cell::new(false)),
        })
    }

    /// Open an updater session. Fails if another session is alive, before
    /// any memory is touched.
    pub fn updater<'a>(&'a self, device: &'a VulkanDevice) -> Result<DescriptorUpdater<'a>> {
        self.gate.acquire()?;
        self.flush.borrow_mut().clear();

        let mapped = match self.buffer.mapped_ptr() {
            Some(ptr) => ptr.cast::<u8>(),
            None => {
                self.gate.release();
                return Err(anyhow::anyhow!("descriptor buffer is not host mapped"));
            }
        };
        Ok(DescriptorUpdater {
            device,
            manager: self,
            mapped,
        })
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer.buffer()
    }

    /// Offsets of every descriptor set within the buffer.
    pub fn offsets(&self) -> &[vk::DeviceSize] {
        &self.offsets
    }

    /// Offset of the descriptor set at `index`.
    pub fn offset(&self, index: usize) -> vk::DeviceSize {
        self.offsets[index]
    }
}

/// Live update session for one descriptor buffer. Writes take effect on the
/// device only after the session ends, when all recorded ranges are flushed
/// in one batch.
pub struct DescriptorUpdater<'a> {
    device: &'a VulkanDevice,
    manager: &'a DescriptorBufferManager,
    mapped: NonNull<u8>,
}

impl DescriptorUpdater<'_> {
    /// Record one descriptor write at its packed position.
    pub fn update(&self, update: &DescriptorUpdate) -> Result<()> {
        let manager = self.manager;
        let loader = self.device.descriptor_buffer_loader();

        let set_offset = manager.offsets[update.set_index];
        let binding_offset = unsafe {
            loader.get_descriptor_set_layout_binding_offset(update.set_layout, update.binding)
        };

        let ty = update.payload.descriptor_type();
        let size = descriptor_size(self.device.limits(), ty)?;
        // descriptor arrays within a binding are tightly packed
        let layer_offset = update.array_layer as vk::DeviceSize * size as vk::DeviceSize;

        let data = match &update.payload {
            DescriptorPayload::Sampler(sampler) => vk::DescriptorDataEXT {
                p_sampler: sampler as *const vk::Sampler,
            },
            DescriptorPayload::CombinedImageSampler(image) => vk::DescriptorDataEXT {
                p_combined_image_sampler: image as *const vk::DescriptorImageInfo,
            },
            DescriptorPayload::UniformBuffer(address) => vk::DescriptorDataEXT {
                p_uniform_buffer: address as *const vk::DescriptorAddressInfoEXT,
            },
            DescriptorPayload::StorageBuffer(address) => vk::DescriptorDataEXT {
                p_storage_buffer: address as *const vk::DescriptorAddressInfoEXT,
            },
            DescriptorPayload::AccelerationStructure(address) => vk::DescriptorDataEXT {
                acceleration_structure: *address,
            },
        };
        let get_info = vk::DescriptorGetInfoEXT {
            ty,
            data,
            ..Default::default()
        };

        let update_offset = set_offset + binding_offset + layer_offset;
        unsafe {
            let destination =
                std::slice::from_raw_parts_mut(self.mapped.as_ptr().add(update_offset as usize), size);
            loader.get_descriptor(&get_info, destination);
        }

        manager
            .flush
            .borrow_mut()
            .push((update_offset, size as vk::DeviceSize));
        Ok(())
    }
}

impl Drop for DescriptorUpdater<'_> {
    fn drop(&mut self) {
        let ranges = self.manager.flush.borrow();
        if let Err(e) = flush_ranges(self.device, self.manager.buffer.memory(), &ranges) {
            log::error!("Failed to flush descriptor buffer updates: {e:#}");
        }
        self.manager.gate.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_exclusive_prefix_sums_of_rounded_sizes() {
        let sizes = [100u64, 256, 1, 77];
        let (offsets, total) = pack_set_offsets(&sizes, 64);

        assert_eq!(offsets, vec![0, 128, 384, 448]);
        // last size is not rounded
        assert_eq!(total, 128 + 256 + 64 + 77);

        // strictly increasing, each step at least the predecessor's rounding
        assert_eq!(offsets[0], 0);
        for window in offsets.windows(2) {
            assert!(window[1] > window[0]);
        }
    }

    #[test]
    fn single_set_has_zero_offset_and_unrounded_total() {
        let (offsets, total) = pack_set_offsets(&[33], 64);
        assert_eq!(offsets, vec![0]);
        assert_eq!(total, 33);
    }

    #[test]
    fn rounded_sizes_sum_to_total() {
        let sizes = [5u64, 5, 5];
        let (offsets, total) = pack_set_offsets(&sizes, 8);
        assert_eq!(offsets, vec![0, 8, 16]);
        assert_eq!(total, 8 + 8 + 5);
    }

    #[test]
    fn gate_rejects_second_session_and_recovers() {
        let gate = UpdaterGate(Cell::new(false));
        gate.acquire().unwrap();
        assert!(matches!(gate.acquire(), Err(BackendError::UpdaterBusy)));
        gate.release();
        gate.acquire().unwrap();
    }

    #[test]
    fn descriptor_size_rejects_unsupported_types() {
        let limits = DeviceLimits {
            descriptor_buffer: vk::PhysicalDeviceDescriptorBufferPropertiesEXT {
                sampler_descriptor_size: 16,
                uniform_buffer_descriptor_size: 32,
                ..Default::default()
            },
            non_coherent_atom_size: 64,
        };
        assert_eq!(
            descriptor_size(&limits, vk::DescriptorType::SAMPLER).unwrap(),
            16
        );
        assert_eq!(
            descriptor_size(&limits, vk::DescriptorType::UNIFORM_BUFFER).unwrap(),
            32
        );
        assert!(matches!(
            descriptor_size(&limits, vk::DescriptorType::STORAGE_IMAGE),
            Err(BackendError::UnsupportedDescriptor(_))
        ));
    }
}
