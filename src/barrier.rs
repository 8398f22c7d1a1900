// Pipeline barrier batching
//
// Many small barrier calls serialize more GPU work than one combined call
// carrying the same dependency information, so barriers are accumulated and
// recorded as a single vkCmdPipelineBarrier2. Capacities are declared up
// front; exceeding one is a programming error reported eagerly, never a
// silent truncation.

use crate::error::BackendError;
use ash::vk;

/// Source/destination stage and access masks shared by all barrier kinds.
#[derive(Debug, Clone, Copy)]
pub struct BarrierScope {
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

/// Image layout transition carried by an image barrier. Identical layouts
/// degenerate the barrier to a plain access/stage dependency, which is valid.
#[derive(Debug, Clone, Copy)]
pub struct LayoutTransition {
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
}

/// Queue family ownership transfer; defaults to no transfer.
#[derive(Debug, Clone, Copy)]
pub struct QueueFamilyTransfer {
    pub source: u32,
    pub target: u32,
}

impl Default for QueueFamilyTransfer {
    fn default() -> Self {
        Self {
            source: vk::QUEUE_FAMILY_IGNORED,
            target: vk::QUEUE_FAMILY_IGNORED,
        }
    }
}

/// One-shot accumulator for memory, buffer, and image barriers.
///
/// The owner records the batch into a command buffer, then must `clear` it
/// before reuse; the batch is a builder, not a persistent structure.
pub struct PipelineBarrierBatch {
    memory: Vec<vk::MemoryBarrier2>,
    buffer: Vec<vk::BufferMemoryBarrier2>,
    image: Vec<vk::ImageMemoryBarrier2>,
    memory_capacity: usize,
    buffer_capacity: usize,
    image_capacity: usize,
}

impl PipelineBarrierBatch {
    /// Declare the upper bound of each barrier kind this batch may hold.
    pub fn with_capacity(memory: usize, buffer: usize, image: usize) -> Self {
        Self {
            memory: Vec::with_capacity(memory),
            buffer: Vec::with_capacity(buffer),
            image: Vec::with_capacity(image),
            memory_capacity: memory,
            buffer_capacity: buffer,
            image_capacity: image,
        }
    }

    /// Add a global memory barrier. Prefer the narrower buffer/image kinds
    /// where possible: broad memory barriers stall more of the pipeline.
    pub fn add_memory_barrier(&mut self, scope: BarrierScope) -> Result<(), BackendError> {
        if self.memory.len() == self.memory_capacity {
            return Err(BackendError::BarrierCapacityExceeded {
                kind: "memory",
                capacity: self.memory_capacity,
            });
        }
        self.memory.push(
            vk::MemoryBarrier2::builder()
                .src_stage_mask(scope.src_stage)
                .src_access_mask(scope.src_access)
                .dst_stage_mask(scope.dst_stage)
                .dst_access_mask(scope.dst_access)
                .build(),
        );
        Ok(())
    }

    /// Add a buffer range barrier with full information.
    pub fn add_buffer_barrier(
        &mut self,
        scope: BarrierScope,
        queue_family: QueueFamilyTransfer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<(), BackendError> {
        if self.buffer.len() == self.buffer_capacity {
            return Err(BackendError::BarrierCapacityExceeded {
                kind: "buffer",
                capacity: self.buffer_capacity,
            });
        }
        self.buffer.push(
            vk::BufferMemoryBarrier2::builder()
                .src_stage_mask(scope.src_stage)
                .src_access_mask(scope.src_access)
                .dst_stage_mask(scope.dst_stage)
                .dst_access_mask(scope.dst_access)
                .src_queue_family_index(queue_family.source)
                .dst_queue_family_index(queue_family.target)
                .buffer(buffer)
                .offset(offset)
                .size(size)
                .build(),
        );
        Ok(())
    }

    /// Add a barrier over a whole buffer with no queue family transfer.
    pub fn add_whole_buffer_barrier(
        &mut self,
        scope: BarrierScope,
        buffer: vk::Buffer,
    ) -> Result<(), BackendError> {
        self.add_buffer_barrier(scope, QueueFamilyTransfer::default(), buffer, 0, vk::WHOLE_SIZE)
    }

    /// Add an image subresource barrier with full information.
    pub fn add_image_barrier(
        &mut self,
        scope: BarrierScope,
        layout: LayoutTransition,
        queue_family: QueueFamilyTransfer,
        image: vk::Image,
        subresource_range: vk::ImageSubresourceRange,
    ) -> Result<(), BackendError> {
        if self.image.len() == self.image_capacity {
            return Err(BackendError::BarrierCapacityExceeded {
                kind: "image",
                capacity: self.image_capacity,
            });
        }
        self.image.push(
            vk::ImageMemoryBarrier2::builder()
                .src_stage_mask(scope.src_stage)
                .src_access_mask(scope.src_access)
                .dst_stage_mask(scope.dst_stage)
                .dst_access_mask(scope.dst_access)
                .old_layout(layout.old_layout)
                .new_layout(layout.new_layout)
                .src_queue_family_index(queue_family.source)
                .dst_queue_family_index(queue_family.target)
                .image(image)
                .subresource_range(subresource_range)
                .build(),
        );
        Ok(())
    }

    /// Add an image barrier that does not care about queue family transfer.
    pub fn add_image_layout_barrier(
        &mut self,
        scope: BarrierScope,
        layout: LayoutTransition,
        image: vk::Image,
        subresource_range: vk::ImageSubresourceRange,
    ) -> Result<(), BackendError> {
        self.add_image_barrier(scope, layout, QueueFamilyTransfer::default(), image, subresource_range)
    }

    /// Record one dependency command covering all accumulated barriers.
    pub fn record(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        dependency_flags: vk::DependencyFlags,
    ) {
        let dependency = vk::DependencyInfo::builder()
            .dependency_flags(dependency_flags)
            .memory_barriers(&self.memory)
            .buffer_memory_barriers(&self.buffer)
            .image_memory_barriers(&self.image);

        unsafe { device.cmd_pipeline_barrier2(cmd, &dependency) };
    }

    /// Clear all previously added barriers, keeping the declared capacities.
    pub fn clear(&mut self) {
        self.memory.clear();
        self.buffer.clear();
        self.image.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty() && self.buffer.is_empty() && self.image.is_empty()
    }

    pub fn len(&self) -> usize {
        self.memory.len() + self.buffer.len() + self.image.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> BarrierScope {
        BarrierScope {
            src_stage: vk::PipelineStageFlags2::TRANSFER,
            src_access: vk::AccessFlags2::TRANSFER_WRITE,
            dst_stage: vk::PipelineStageFlags2::VERTEX_SHADER,
            dst_access: vk::AccessFlags2::SHADER_READ,
        }
    }

    #[test]
    fn rejects_append_beyond_declared_capacity() {
        let mut batch = PipelineBarrierBatch::with_capacity(1, 0, 0);
        batch.add_memory_barrier(scope()).unwrap();
        let err = batch.add_memory_barrier(scope()).unwrap_err();
        assert!(matches!(
            err,
            BackendError::BarrierCapacityExceeded {
                kind: "memory",
                capacity: 1
            }
        ));
        // rejected, not truncated: the accepted entry is still there
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn buffer_and_image_capacities_are_independent() {
        let mut batch = PipelineBarrierBatch::with_capacity(0, 1, 1);
        batch
            .add_whole_buffer_barrier(scope(), vk::Buffer::null())
            .unwrap();
        batch
            .add_image_layout_barrier(
                scope(),
                LayoutTransition {
                    old_layout: vk::ImageLayout::UNDEFINED,
                    new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                },
                vk::Image::null(),
                vk::ImageSubresourceRange::default(),
            )
            .unwrap();
        assert!(batch.add_memory_barrier(scope()).is_err());
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn clear_empties_the_batch_for_reuse() {
        let mut batch = PipelineBarrierBatch::with_capacity(2, 2, 0);
        batch.add_memory_barrier(scope()).unwrap();
        batch
            .add_whole_buffer_barrier(scope(), vk::Buffer::null())
            .unwrap();
        assert!(!batch.is_empty());

        batch.clear();
        assert!(batch.is_empty());
        // capacity survives a clear
        batch.add_memory_barrier(scope()).unwrap();
        batch.add_memory_barrier(scope()).unwrap();
        assert!(batch.add_memory_barrier(scope()).is_err());
    }

    #[test]
    fn degenerate_image_barrier_is_accepted() {
        // no layout change and no queue transfer: a plain access/stage barrier
        let mut batch = PipelineBarrierBatch::with_capacity(0, 0, 1);
        batch
            .add_image_layout_barrier(
                scope(),
                LayoutTransition {
                    old_layout: vk::ImageLayout::GENERAL,
                    new_layout: vk::ImageLayout::GENERAL,
                },
                vk::Image::null(),
                vk::ImageSubresourceRange::default(),
            )
            .unwrap();
        assert_eq!(batch.len(), 1);
    }
}
