// Error handling for Vulkan API calls and core invariants
//
// Every raw API call goes through `vk_check` so the failing call's name,
// result code, and call site survive into the error chain.

use ash::vk;
use std::panic::Location;
use thiserror::Error;

/// Errors raised by the backend core.
#[derive(Debug, Error)]
pub enum BackendError {
    /// An underlying Vulkan call returned a non-success code. Never retried:
    /// these indicate device loss, out-of-memory, or a logic error.
    #[error("{call} failed with {code:?} at {location}")]
    Api {
        call: &'static str,
        code: vk::Result,
        location: &'static Location<'static>,
    },

    /// A second descriptor updater was opened while one is still alive.
    #[error("only one descriptor updater may be alive at a time")]
    UpdaterBusy,

    /// A barrier batch was appended beyond its declared capacity.
    #[error("{kind} barrier capacity exceeded (declared {capacity})")]
    BarrierCapacityExceeded {
        kind: &'static str,
        capacity: usize,
    },

    /// The descriptor type is not supported by the descriptor buffer manager.
    #[error("unsupported descriptor type {0:?}")]
    UnsupportedDescriptor(vk::DescriptorType),

    /// An acceleration structure build was requested over no primitives.
    #[error("acceleration structure build requires at least one primitive")]
    EmptyAccelerationStructure,

    /// The validation layer reported an error-severity message.
    #[error("validation layer reported a fatal error; see the log")]
    ValidationFailure,

    /// A frame slot was driven through an illegal state transition.
    #[error("frame slot is {actual}, expected {expected}")]
    SlotState {
        expected: &'static str,
        actual: &'static str,
    },
}

/// Wrap a raw `VkResult`, capturing the call name and call site on failure.
#[track_caller]
pub fn vk_check<T>(result: Result<T, vk::Result>, call: &'static str) -> Result<T, BackendError> {
    match result {
        Ok(value) => Ok(value),
        Err(code) => Err(BackendError::Api {
            call,
            code,
            location: Location::caller(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_carries_call_and_code() {
        let err = vk_check::<()>(Err(vk::Result::ERROR_DEVICE_LOST), "vkQueueSubmit2").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("vkQueueSubmit2"));
        assert!(msg.contains("ERROR_DEVICE_LOST"));
        assert!(msg.contains("error.rs"));
    }

    #[test]
    fn success_passes_through() {
        assert_eq!(vk_check(Ok(7u32), "vkAnything").unwrap(), 7);
    }
}
