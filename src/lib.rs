// Renderer backend - Vulkan resource-lifetime and synchronization core
//
// Design: thin wrappers around ash with explicit control
//
// What lives here: owned handle lifetimes, frame-in-flight pacing over
// timeline semaphores, command submission, pipeline barrier batching, the
// descriptor buffer update protocol, and the acceleration structure
// build/compaction pipeline. Window management, shader compilation, image
// decoding, and draw content are collaborators layered on top.

pub mod accel;
pub mod barrier;
pub mod buffer;
pub mod command;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod frame;
pub mod handle;
pub mod image;
pub mod pipeline;
pub mod shader;
pub mod sync;
pub mod upload;

pub use barrier::{BarrierScope, LayoutTransition, PipelineBarrierBatch, QueueFamilyTransfer};
pub use command::SemaphoreOp;
pub use config::Config;
pub use descriptor::{DescriptorBufferManager, DescriptorPayload, DescriptorUpdate};
pub use device::VulkanDevice;
pub use error::BackendError;
pub use frame::{FramePacer, FrameSlot};
pub use handle::{BufferAllocation, CommandBufferSet, ImageAllocation, UniqueHandle};

/// Initialize logging with optional file output for validation errors
pub fn init_logging(config: &Config) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::fs::OpenOptions;
    use std::io::Write;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();

    // Create/clear log file if enabled
    if config.debug.log_to_file {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            let _ = writeln!(file, "=== Renderer Backend Log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
    }
}
