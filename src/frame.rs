// Frame-in-flight pacing
//
// Each slot owns one command pool and one set of synchronization primitives.
// A slot's pool is reset once per period of N frames, and only after a host
// wait on the slot's timeline semaphore has confirmed the GPU finished the
// slot's previous occupant. That wait is the sole ordering mechanism: work
// in different slots has no ordering beyond explicit barriers.

use crate::command::{self, SemaphoreOp};
use crate::device::VulkanDevice;
use crate::error::{vk_check, BackendError};
use crate::handle::{CommandPool, Semaphore};
use crate::sync;
use anyhow::{ensure, Context, Result};
use ash::vk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    Recording,
    Submitted,
}

impl SlotState {
    fn name(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Recording => "Recording",
            Self::Submitted => "Submitted",
        }
    }
}

/// Pacing bookkeeping for one slot: its state and the last timeline value it
/// issued. The timeline counter never decreases and this schedule is its
/// only writer.
struct SlotSchedule {
    state: SlotState,
    last_issued: u64,
}

impl SlotSchedule {
    fn new() -> Self {
        Self {
            state: SlotState::Idle,
            last_issued: 0,
        }
    }

    /// Enter Recording; returns the timeline value that must be observed by
    /// a host wait before the slot's pool may be reset.
    fn begin(&mut self) -> Result<u64, BackendError> {
        if self.state == SlotState::Recording {
            return Err(BackendError::SlotState {
                expected: "Idle or Submitted",
                actual: self.state.name(),
            });
        }
        self.state = SlotState::Recording;
        Ok(self.last_issued)
    }

    /// Enter Submitted; returns the value to signal for this frame.
    fn submit(&mut self) -> Result<u64, BackendError> {
        if self.state != SlotState::Recording {
            return Err(BackendError::SlotState {
                expected: "Recording",
                actual: self.state.name(),
            });
        }
        self.state = SlotState::Submitted;
        self.last_issued += 1;
        Ok(self.last_issued)
    }

    fn cancel(&mut self) {
        if self.state == SlotState::Recording {
            self.state = SlotState::Idle;
        }
    }
}

/// Per-in-flight-frame resources, created once at startup.
pub struct FrameSlot {
    command_pool: CommandPool,
    image_available: Semaphore,
    render_finished: Semaphore,
    timeline: Semaphore,
    schedule: SlotSchedule,
}

impl FrameSlot {
    fn new(device: &VulkanDevice) -> Result<Self> {
        // pool-level reset only: no per-buffer reset flag
        let command_pool = command::create_command_pool(
            device.device(),
            vk::CommandPoolCreateFlags::empty(),
            device.queue_family(),
        )?;
        Ok(Self {
            command_pool,
            image_available: sync::create_binary_semaphore(device.device())?,
            render_finished: sync::create_binary_semaphore(device.device())?,
            timeline: sync::create_timeline_semaphore(device.device(), 0)?,
            schedule: SlotSchedule::new(),
        })
    }

    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool.get()
    }

    /// Binary semaphore to pass to image acquisition.
    pub fn image_available(&self) -> vk::Semaphore {
        self.image_available.get()
    }

    /// Binary semaphore to wait on for presentation.
    pub fn render_finished(&self) -> vk::Semaphore {
        self.render_finished.get()
    }

    /// This slot's timeline semaphore.
    pub fn timeline(&self) -> vk::Semaphore {
        self.timeline.get()
    }

    /// The timeline value signalled by this slot's most recent submission.
    pub fn last_issued(&self) -> u64 {
        self.schedule.last_issued
    }
}

/// Bounds how many frames' worth of GPU work may be outstanding.
pub struct FramePacer {
    slots: Vec<FrameSlot>,
    current: usize,
}

impl FramePacer {
    pub fn new(device: &VulkanDevice, frames_in_flight: usize) -> Result<Self> {
        ensure!(frames_in_flight >= 1, "at least one frame in flight required");
        let slots = (0..frames_in_flight)
            .map(|_| FrameSlot::new(device))
            .collect::<Result<Vec<_>>>()?;
        log::info!("Frame pacer: {frames_in_flight} frames in flight");
        Ok(Self { slots, current: 0 })
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current_slot(&self) -> &FrameSlot {
        &self.slots[self.current]
    }

    /// Begin the current slot's frame: fail fast if validation has latched a
    /// fatal error, host-wait until the GPU has left this slot, then reset
    /// the slot's command pool for re-recording.
    pub fn begin(&mut self, device: &VulkanDevice) -> Result<&FrameSlot> {
        device.ensure_validation_clean()?;

        let slot = &mut self.slots[self.current];
        let wait_value = slot.schedule.begin()?;
        sync::wait_semaphores(
            device.device(),
            &[(slot.timeline.get(), wait_value)],
            u64::MAX,
        )
        .context("waiting for frame slot reuse")?;

        // legal only because the wait above observed the slot's last signal
        vk_check(
            unsafe {
                device
                    .device()
                    .reset_command_pool(slot.command_pool.get(), vk::CommandPoolResetFlags::empty())
            },
            "vkResetCommandPool",
        )?;

        Ok(&self.slots[self.current])
    }

    /// Submit the recorded command buffers for the current slot and advance
    /// to the next one.
    ///
    /// Waits on the slot's `image_available` at `acquire_wait_stage` (the
    /// caller must have registered that semaphore with its image
    /// acquisition) plus any `extra_waits`; signals `render_finished` and
    /// the slot timeline at its next value. Returns the signalled value.
    pub fn submit(
        &mut self,
        device: &VulkanDevice,
        commands: &[vk::CommandBuffer],
        extra_waits: &[SemaphoreOp],
        acquire_wait_stage: vk::PipelineStageFlags2,
    ) -> Result<u64> {
        let slot = &mut self.slots[self.current];
        let signal_value = slot.schedule.submit()?;

        let mut waits = Vec::with_capacity(1 + extra_waits.len());
        waits.push(SemaphoreOp::binary(
            slot.image_available.get(),
            acquire_wait_stage,
        ));
        waits.extend_from_slice(extra_waits);

        let signals = [
            SemaphoreOp::binary(
                slot.render_finished.get(),
                vk::PipelineStageFlags2::ALL_COMMANDS,
            ),
            SemaphoreOp::timeline(
                slot.timeline.get(),
                vk::PipelineStageFlags2::ALL_COMMANDS,
                signal_value,
            ),
        ];

        command::submit(
            device.device(),
            device.queue(),
            commands,
            &waits,
            &signals,
            None,
        )
        .context("frame submission")?;

        self.current = (self.current + 1) % self.slots.len();
        Ok(signal_value)
    }

    /// Abandon a frame after `begin` without submitting; the slot returns to
    /// Idle and the cursor does not advance.
    pub fn cancel(&mut self) {
        self.slots[self.current].schedule.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_returns_last_signalled_value() {
        let mut schedule = SlotSchedule::new();
        assert_eq!(schedule.begin().unwrap(), 0);
        assert_eq!(schedule.submit().unwrap(), 1);
        assert_eq!(schedule.begin().unwrap(), 1);
        assert_eq!(schedule.submit().unwrap(), 2);
    }

    #[test]
    fn double_begin_is_rejected() {
        let mut schedule = SlotSchedule::new();
        schedule.begin().unwrap();
        assert!(matches!(
            schedule.begin(),
            Err(BackendError::SlotState { .. })
        ));
    }

    #[test]
    fn submit_without_recording_is_rejected() {
        let mut schedule = SlotSchedule::new();
        assert!(schedule.submit().is_err());
        schedule.begin().unwrap();
        schedule.submit().unwrap();
        assert!(schedule.submit().is_err());
    }

    #[test]
    fn cancel_returns_to_idle_without_consuming_a_value() {
        let mut schedule = SlotSchedule::new();
        schedule.begin().unwrap();
        schedule.cancel();
        assert_eq!(schedule.begin().unwrap(), 0);
        assert_eq!(schedule.submit().unwrap(), 1);
    }

    #[test]
    fn slot_wait_value_always_precedes_signal_value() {
        // simulate N slots over many frames: the value waited at reset time
        // is exactly the value the slot signalled N frames earlier, and
        // signal values are strictly monotonic per slot
        const SLOTS: usize = 2;
        let mut schedules: Vec<SlotSchedule> = (0..SLOTS).map(|_| SlotSchedule::new()).collect();
        let mut previous_signal = [0u64; SLOTS];

        for frame in 0..100usize {
            let index = frame % SLOTS;
            let schedule = &mut schedules[index];

            let wait_value = schedule.begin().unwrap();
            assert_eq!(wait_value, previous_signal[index]);

            let signal_value = schedule.submit().unwrap();
            assert!(signal_value > wait_value);
            previous_signal[index] = signal_value;
        }
    }
}
