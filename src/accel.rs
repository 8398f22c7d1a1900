// Acceleration structure build and compaction
//
// A build records one device-side command and returns the structure plus the
// scratch buffer, which must stay alive until the build has executed.
// Compaction reads the compacted size back on the host (bounded wait,
// acceptable off the hot path), then records a compacting copy; the source
// structure must stay alive until that copy has executed.

use crate::barrier::{BarrierScope, PipelineBarrierBatch};
use crate::buffer::{self, create_device_buffer};
use crate::device::VulkanDevice;
use crate::error::{vk_check, BackendError};
use crate::handle::{
    AccelerationStructureDestroyer, AccelerationStructureHandle, BufferAllocation, QueryPool,
    QueryPoolDestroyer, UniqueHandle,
};
use anyhow::{ensure, Result};
use ash::vk;

/// A built acceleration structure over its backing buffer. The structure
/// handle precedes the buffer so it is destroyed first.
pub struct AccelerationStructure {
    handle: AccelerationStructureHandle,
    buffer: BufferAllocation,
}

impl AccelerationStructure {
    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.handle.get()
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer.buffer()
    }
}

/// Result of recording a build command.
pub struct AccelerationStructureBuild {
    pub structure: AccelerationStructure,
    /// Scratch memory referenced by the build command; retain until the
    /// build has been executed.
    pub scratch: BufferAllocation,
}

/// Where a compacted-size query is written and later read back.
#[derive(Debug, Clone, Copy)]
pub struct CompactionQuery {
    pub pool: vk::QueryPool,
    pub index: u32,
}

/// Inputs for one acceleration structure build.
pub struct BuildInput<'a> {
    pub ty: vk::AccelerationStructureTypeKHR,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub geometries: &'a [vk::AccelerationStructureGeometryKHR],
    pub ranges: &'a [vk::AccelerationStructureBuildRangeInfoKHR],
    /// When set, the build also writes the compacted size to this query.
    pub compaction_query: Option<CompactionQuery>,
}

fn validate_build_extents(
    geometry_count: usize,
    range_count: usize,
    primitive_counts: &[u32],
) -> Result<(), BackendError> {
    if geometry_count == 0
        || geometry_count != range_count
        || primitive_counts.iter().all(|&count| count == 0)
    {
        return Err(BackendError::EmptyAccelerationStructure);
    }
    Ok(())
}

/// Create a query pool for acceleration structure compacted-size queries.
pub fn create_compaction_query_pool(device: &ash::Device, count: u32) -> Result<QueryPool> {
    let info = vk::QueryPoolCreateInfo::builder()
        .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
        .query_count(count);
    let pool = vk_check(
        unsafe { device.create_query_pool(&info, None) },
        "vkCreateQueryPool",
    )?;
    Ok(UniqueHandle::new(
        pool,
        QueryPoolDestroyer {
            device: device.clone(),
        },
    ))
}

/// Record one build command for the given geometry.
///
/// Queries the required sizes, allocates the structure and scratch buffers
/// device-locally, creates the structure, and records the build referencing
/// the scratch buffer's device address. No pipeline barrier for downstream
/// consumers is recorded; only the compaction-size query (when requested)
/// gets its build-write to build-read barrier.
pub fn build(
    device: &VulkanDevice,
    cmd: vk::CommandBuffer,
    input: &BuildInput,
) -> Result<AccelerationStructureBuild> {
    let loader = device.accel_loader();

    let primitive_counts: Vec<u32> = input.ranges.iter().map(|r| r.primitive_count).collect();
    validate_build_extents(input.geometries.len(), input.ranges.len(), &primitive_counts)?;

    let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
        .ty(input.ty)
        .flags(input.flags)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(input.geometries)
        .build();

    let size_info = unsafe {
        loader.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &primitive_counts,
        )
    };

    let structure_buffer = create_device_buffer(
        device,
        size_info.acceleration_structure_size,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR,
    )?;
    let scratch = create_device_buffer(
        device,
        size_info.build_scratch_size,
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
    )?;

    let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
        .buffer(structure_buffer.buffer())
        .offset(0)
        .size(size_info.acceleration_structure_size)
        .ty(input.ty);
    let raw = vk_check(
        unsafe { loader.create_acceleration_structure(&create_info, None) },
        "vkCreateAccelerationStructureKHR",
    )?;
    let handle = UniqueHandle::new(
        raw,
        AccelerationStructureDestroyer {
            loader: loader.clone(),
        },
    );

    build_info.dst_acceleration_structure = raw;
    build_info.scratch_data = vk::DeviceOrHostAddressKHR {
        device_address: buffer::device_address(device, scratch.buffer()),
    };

    unsafe {
        loader.cmd_build_acceleration_structures(cmd, &[build_info], &[input.ranges]);
    }

    if let Some(query) = input.compaction_query {
        // the size query must observe the finished build
        let mut barrier = PipelineBarrierBatch::with_capacity(0, 1, 0);
        barrier.add_whole_buffer_barrier(
            BarrierScope {
                src_stage: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                src_access: vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
                dst_stage: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                dst_access: vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
            },
            structure_buffer.buffer(),
        )?;
        barrier.record(device.device(), cmd, vk::DependencyFlags::empty());

        unsafe {
            device
                .device()
                .cmd_reset_query_pool(cmd, query.pool, query.index, 1);
            loader.cmd_write_acceleration_structures_properties(
                cmd,
                &[raw],
                vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                query.pool,
                query.index,
            );
        }
    }

    Ok(AccelerationStructureBuild {
        structure: AccelerationStructure {
            handle,
            buffer: structure_buffer,
        },
        scratch,
    })
}

/// Read back the compacted size and record a compacting copy into a new,
/// smaller structure.
///
/// Blocks until the originating build's query write has landed (WAIT flag),
/// so a premature call can never observe a stale or zero size. The source
/// structure stays valid and must be kept alive by the caller until a
/// barrier confirms the copy has executed; only then may it be discarded.
pub fn compact(
    device: &VulkanDevice,
    cmd: vk::CommandBuffer,
    source: &AccelerationStructure,
    ty: vk::AccelerationStructureTypeKHR,
    query: CompactionQuery,
) -> Result<AccelerationStructure> {
    let loader = device.accel_loader();

    let mut compacted_size = [0u32];
    vk_check(
        unsafe {
            device.device().get_query_pool_results(
                query.pool,
                query.index,
                1,
                &mut compacted_size,
                vk::QueryResultFlags::WAIT,
            )
        },
        "vkGetQueryPoolResults",
    )?;
    let compacted_size = vk::DeviceSize::from(compacted_size[0]);
    ensure!(compacted_size > 0, "compacted size query returned zero");
    log::debug!("Compacting acceleration structure to {compacted_size} bytes");

    let compacted_buffer = create_device_buffer(
        device,
        compacted_size,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR,
    )?;
    let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
        .buffer(compacted_buffer.buffer())
        .offset(0)
        .size(compacted_size)
        .ty(ty);
    let raw = vk_check(
        unsafe { loader.create_acceleration_structure(&create_info, None) },
        "vkCreateAccelerationStructureKHR",
    )?;
    let handle = UniqueHandle::new(
        raw,
        AccelerationStructureDestroyer {
            loader: loader.clone(),
        },
    );

    let copy_info = vk::CopyAccelerationStructureInfoKHR::builder()
        .src(source.handle())
        .dst(raw)
        .mode(vk::CopyAccelerationStructureModeKHR::COMPACT);
    unsafe { loader.cmd_copy_acceleration_structure(cmd, &copy_info) };

    Ok(AccelerationStructure {
        handle,
        buffer: compacted_buffer,
    })
}

/// Retrieve the device address of an acceleration structure.
pub fn device_address(
    loader: &ash::extensions::khr::AccelerationStructure,
    structure: vk::AccelerationStructureKHR,
) -> vk::DeviceAddress {
    let info =
        vk::AccelerationStructureDeviceAddressInfoKHR::builder().acceleration_structure(structure);
    unsafe { loader.get_acceleration_structure_device_address(&info) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_geometry() {
        assert!(matches!(
            validate_build_extents(0, 0, &[]),
            Err(BackendError::EmptyAccelerationStructure)
        ));
    }

    #[test]
    fn rejects_zero_total_primitives() {
        assert!(matches!(
            validate_build_extents(2, 2, &[0, 0]),
            Err(BackendError::EmptyAccelerationStructure)
        ));
    }

    #[test]
    fn rejects_mismatched_range_count() {
        assert!(validate_build_extents(2, 1, &[3]).is_err());
    }

    #[test]
    fn accepts_any_nonzero_primitive_count() {
        validate_build_extents(2, 2, &[0, 1]).unwrap();
    }
}
