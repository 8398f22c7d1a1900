// Owned handle wrappers for native Vulkan objects
//
// Each wrapper pairs a raw handle with the minimal destruction context the
// destructor needs (device clone, extension loader, allocator), so handles
// stay cheap to move and independently destructible. A handle must never be
// dropped while GPU work referencing it may still execute; the frame pacer
// and the one-time submit path exist to uphold that.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, Allocator};
use parking_lot::Mutex;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Arc;

/// Destruction context for one native handle type. Implementors are plain
/// value types holding only what the free call needs.
pub trait DestroyHandle {
    type Handle: Copy + Eq + Default;

    /// # Safety
    /// The handle must be valid and no longer referenced by pending GPU work.
    unsafe fn destroy(&self, handle: Self::Handle);
}

/// Unique ownership of one native handle plus its destroyer.
///
/// Exactly one owner at a time: moves transfer ownership, there is no
/// `Clone`. Dropping a released (null) handle performs no native free call.
pub struct UniqueHandle<D: DestroyHandle> {
    handle: D::Handle,
    destroyer: D,
}

impl<D: DestroyHandle> UniqueHandle<D> {
    /// Take ownership of `handle` immediately.
    pub fn new(handle: D::Handle, destroyer: D) -> Self {
        Self { handle, destroyer }
    }

    /// The wrapped native handle.
    pub fn get(&self) -> D::Handle {
        self.handle
    }

    /// Give up ownership, leaving this wrapper empty; dropping it afterwards
    /// is a no-op. The caller becomes responsible for the native object.
    pub fn release(&mut self) -> D::Handle {
        std::mem::take(&mut self.handle)
    }

    /// Consume the wrapper without destroying the handle.
    pub fn into_raw(mut self) -> D::Handle {
        self.release()
    }
}

impl<D: DestroyHandle> Drop for UniqueHandle<D> {
    fn drop(&mut self) {
        if self.handle != D::Handle::default() {
            unsafe { self.destroyer.destroy(self.handle) };
        }
    }
}

/// Declare a destroyer whose free call is a plain `ash::Device` method.
macro_rules! device_destroyer {
    ($(#[$doc:meta])* $name:ident, $handle:ty, $destroy:ident) => {
        $(#[$doc])*
        pub struct $name {
            pub device: ash::Device,
        }

        impl DestroyHandle for $name {
            type Handle = $handle;

            unsafe fn destroy(&self, handle: $handle) {
                self.device.$destroy(handle, None);
            }
        }
    };
}

device_destroyer!(SemaphoreDestroyer, vk::Semaphore, destroy_semaphore);
device_destroyer!(FenceDestroyer, vk::Fence, destroy_fence);
device_destroyer!(CommandPoolDestroyer, vk::CommandPool, destroy_command_pool);
device_destroyer!(QueryPoolDestroyer, vk::QueryPool, destroy_query_pool);
device_destroyer!(BufferDestroyer, vk::Buffer, destroy_buffer);
device_destroyer!(ImageDestroyer, vk::Image, destroy_image);
device_destroyer!(ImageViewDestroyer, vk::ImageView, destroy_image_view);
device_destroyer!(ShaderModuleDestroyer, vk::ShaderModule, destroy_shader_module);
device_destroyer!(PipelineDestroyer, vk::Pipeline, destroy_pipeline);
device_destroyer!(PipelineLayoutDestroyer, vk::PipelineLayout, destroy_pipeline_layout);
device_destroyer!(SamplerDestroyer, vk::Sampler, destroy_sampler);
device_destroyer!(
    DescriptorSetLayoutDestroyer,
    vk::DescriptorSetLayout,
    destroy_descriptor_set_layout
);

/// Destroying an acceleration structure goes through the extension loader.
pub struct AccelerationStructureDestroyer {
    pub loader: ash::extensions::khr::AccelerationStructure,
}

impl DestroyHandle for AccelerationStructureDestroyer {
    type Handle = vk::AccelerationStructureKHR;

    unsafe fn destroy(&self, handle: vk::AccelerationStructureKHR) {
        self.loader.destroy_acceleration_structure(handle, None);
    }
}

pub type Semaphore = UniqueHandle<SemaphoreDestroyer>;
pub type Fence = UniqueHandle<FenceDestroyer>;
pub type CommandPool = UniqueHandle<CommandPoolDestroyer>;
pub type QueryPool = UniqueHandle<QueryPoolDestroyer>;
pub type Buffer = UniqueHandle<BufferDestroyer>;
pub type Image = UniqueHandle<ImageDestroyer>;
pub type ImageView = UniqueHandle<ImageViewDestroyer>;
pub type ShaderModule = UniqueHandle<ShaderModuleDestroyer>;
pub type Pipeline = UniqueHandle<PipelineDestroyer>;
pub type PipelineLayout = UniqueHandle<PipelineLayoutDestroyer>;
pub type Sampler = UniqueHandle<SamplerDestroyer>;
pub type DescriptorSetLayout = UniqueHandle<DescriptorSetLayoutDestroyer>;
pub type AccelerationStructureHandle = UniqueHandle<AccelerationStructureDestroyer>;

/// A batch of command buffers from one pool, freed in a single API call.
///
/// Owns both the buffer array and its storage: this is one resource entity
/// with a count, not N individually-owned buffers.
pub struct CommandBufferSet {
    buffers: Vec<vk::CommandBuffer>,
    pool: vk::CommandPool,
    device: ash::Device,
}

impl CommandBufferSet {
    pub(crate) fn from_raw(
        buffers: Vec<vk::CommandBuffer>,
        pool: vk::CommandPool,
        device: ash::Device,
    ) -> Self {
        Self {
            buffers,
            pool,
            device,
        }
    }

    pub fn as_slice(&self) -> &[vk::CommandBuffer] {
        &self.buffers
    }

    pub fn get(&self, index: usize) -> vk::CommandBuffer {
        self.buffers[index]
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

impl Drop for CommandBufferSet {
    fn drop(&mut self) {
        if !self.buffers.is_empty() {
            unsafe { self.device.free_command_buffers(self.pool, &self.buffers) };
        }
    }
}

/// A device memory allocation returned to the shared allocator on drop.
pub struct MemoryBlock {
    allocation: Option<Allocation>,
    allocator: Arc<Mutex<Allocator>>,
}

impl MemoryBlock {
    pub(crate) fn new(allocation: Allocation, allocator: Arc<Mutex<Allocator>>) -> Self {
        Self {
            allocation: Some(allocation),
            allocator,
        }
    }

    pub fn allocation(&self) -> &Allocation {
        self.allocation.as_ref().expect("memory block already reclaimed")
    }

    /// Host pointer into the allocation, if it was created mapped.
    pub fn mapped_ptr(&self) -> Option<NonNull<c_void>> {
        self.allocation().mapped_ptr()
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.allocator.lock().free(allocation) {
                log::error!("Failed to free GPU memory: {e}");
            }
        }
    }
}

/// A buffer bound to its memory. The buffer field precedes the memory field
/// so the container is destroyed strictly before the memory backing it.
pub struct BufferAllocation {
    buffer: Buffer,
    memory: MemoryBlock,
    size: vk::DeviceSize,
}

impl BufferAllocation {
    pub(crate) fn new(buffer: Buffer, memory: MemoryBlock, size: vk::DeviceSize) -> Self {
        Self {
            buffer,
            memory,
            size,
        }
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer.get()
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn memory(&self) -> &MemoryBlock {
        &self.memory
    }

    pub fn mapped_ptr(&self) -> Option<NonNull<c_void>> {
        self.memory.mapped_ptr()
    }
}

/// An image bound to its memory, with the same destruction ordering as
/// [`BufferAllocation`].
pub struct ImageAllocation {
    image: Image,
    memory: MemoryBlock,
}

impl ImageAllocation {
    pub(crate) fn new(image: Image, memory: MemoryBlock) -> Self {
        Self { image, memory }
    }

    pub fn image(&self) -> vk::Image {
        self.image.get()
    }

    pub fn memory(&self) -> &MemoryBlock {
        &self.memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct CountingDestroyer {
        count: Rc<Cell<u32>>,
    }

    impl DestroyHandle for CountingDestroyer {
        type Handle = u64;

        unsafe fn destroy(&self, _handle: u64) {
            self.count.set(self.count.get() + 1);
        }
    }

    #[test]
    fn drop_destroys_exactly_once() {
        let count = Rc::new(Cell::new(0));
        {
            let _handle = UniqueHandle::new(
                42u64,
                CountingDestroyer {
                    count: count.clone(),
                },
            );
        }
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn released_handle_drops_without_destroying() {
        let count = Rc::new(Cell::new(0));
        let mut handle = UniqueHandle::new(
            42u64,
            CountingDestroyer {
                count: count.clone(),
            },
        );
        assert_eq!(handle.release(), 42);
        assert_eq!(handle.get(), 0);
        drop(handle);
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn transferred_ownership_destroys_once() {
        let count = Rc::new(Cell::new(0));
        let mut source = UniqueHandle::new(
            7u64,
            CountingDestroyer {
                count: count.clone(),
            },
        );
        let moved = UniqueHandle::new(
            source.release(),
            CountingDestroyer {
                count: count.clone(),
            },
        );
        drop(source);
        assert_eq!(count.get(), 0, "empty source must not free");
        drop(moved);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn null_handle_is_never_destroyed() {
        let count = Rc::new(Cell::new(0));
        drop(UniqueHandle::new(
            0u64,
            CountingDestroyer {
                count: count.clone(),
            },
        ));
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn into_raw_forfeits_destruction() {
        let count = Rc::new(Cell::new(0));
        let handle = UniqueHandle::new(
            9u64,
            CountingDestroyer {
                count: count.clone(),
            },
        );
        assert_eq!(handle.into_raw(), 9);
        assert_eq!(count.get(), 0);
    }
}
