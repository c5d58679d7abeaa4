//! Command pools and the command buffer recording state machine.

use std::sync::Arc;

use anyhow::Result;
use vulkanalia::prelude::v1_0::*;

use crate::device::VulkanDevice;
use crate::error::{submit_error, RenderError, VkResultExt};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Usage {
    /// Recorded once, submitted once, then freed after the queue drains.
    SingleTime,
    /// Kept across frames and reset before each recording.
    Reusable,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording(Usage),
    Executable(Usage),
    Pending(Usage),
    Freed,
}

impl CommandBufferState {
    pub fn begin(self, usage: Usage) -> Result<Self, RenderError> {
        match self {
            Self::Initial => Ok(Self::Recording(usage)),
            state => Err(RenderError::InvalidCommandBufferState { op: "begin", state }),
        }
    }

    pub fn end(self) -> Result<Self, RenderError> {
        match self {
            Self::Recording(usage) => Ok(Self::Executable(usage)),
            state => Err(RenderError::InvalidCommandBufferState { op: "end", state }),
        }
    }

    pub fn submit(self) -> Result<Self, RenderError> {
        match self {
            Self::Executable(usage) => Ok(Self::Pending(usage)),
            state => Err(RenderError::InvalidCommandBufferState { op: "submit", state }),
        }
    }

    /// A pending reusable buffer may be reset once the caller has waited on
    /// the fence guarding its submission.
    pub fn reset(self) -> Result<Self, RenderError> {
        match self {
            Self::Initial
            | Self::Recording(_)
            | Self::Executable(_)
            | Self::Pending(Usage::Reusable) => Ok(Self::Initial),
            state => Err(RenderError::InvalidCommandBufferState { op: "reset", state }),
        }
    }

    /// Moves to `Freed`. Returns whether the handle still has to be given
    /// back to the pool.
    pub fn free(&mut self) -> bool {
        let live = *self != Self::Freed;
        *self = Self::Freed;
        live
    }
}

pub struct CommandPool {
    device: Arc<VulkanDevice>,
    handle: vk::CommandPool,
}

impl CommandPool {
    /// Pool on the graphics family whose buffers can be reset individually.
    pub unsafe fn new(device: Arc<VulkanDevice>) -> Result<Arc<Self>> {
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(device.instance().queue_families().graphics);

        let handle = device
            .create_command_pool(&info, None)
            .or_fail("command pool")?;

        Ok(Arc::new(Self { device, handle }))
    }

    pub fn handle(&self) -> vk::CommandPool {
        self.handle
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    pub unsafe fn allocate(self: &Arc<Self>, count: u32) -> Result<Vec<CommandBuffer>> {
        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.handle)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        let handles = self
            .device
            .allocate_command_buffers(&allocate_info)
            .or_fail("command buffers")?;

        Ok(handles
            .into_iter()
            .map(|handle| CommandBuffer {
                pool: self.clone(),
                handle,
                state: CommandBufferState::Initial,
            })
            .collect())
    }

    /// Allocates one buffer and begins it for one-time submission.
    pub unsafe fn begin_single_time(self: &Arc<Self>) -> Result<CommandBuffer> {
        let mut buffers = self.allocate(1)?;
        let mut buffer = buffers.remove(0);
        buffer.begin(Usage::SingleTime)?;
        Ok(buffer)
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        log::debug!("Destroying command pool");
        unsafe { self.device.destroy_command_pool(self.handle, None) };
    }
}

pub struct CommandBuffer {
    pool: Arc<CommandPool>,
    handle: vk::CommandBuffer,
    state: CommandBufferState,
}

impl CommandBuffer {
    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.pool.device
    }

    /// Handle for recording commands. Only valid while recording.
    pub fn recording(&self) -> Result<vk::CommandBuffer, RenderError> {
        match self.state {
            CommandBufferState::Recording(_) => Ok(self.handle),
            state => Err(RenderError::InvalidCommandBufferState { op: "record into", state }),
        }
    }

    pub unsafe fn begin(&mut self, usage: Usage) -> Result<()> {
        let next = self.state.begin(usage)?;

        let flags = match usage {
            Usage::SingleTime => vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            Usage::Reusable => vk::CommandBufferUsageFlags::empty(),
        };
        let info = vk::CommandBufferBeginInfo::builder().flags(flags);
        self.pool.device.begin_command_buffer(self.handle, &info)?;

        self.state = next;
        Ok(())
    }

    pub unsafe fn end(&mut self) -> Result<()> {
        let next = self.state.end()?;
        self.pool.device.end_command_buffer(self.handle)?;
        self.state = next;
        Ok(())
    }

    /// Ends recording, submits to the graphics queue, waits for the queue to
    /// drain and frees the buffer.
    pub unsafe fn end_and_submit(&mut self) -> Result<()> {
        self.end()?;
        let next = self.state.submit()?;

        let device = &self.pool.device;
        let command_buffers = &[self.handle];
        let info = vk::SubmitInfo::builder().command_buffers(command_buffers);

        device
            .queue_submit(device.graphics_queue(), &[info], vk::Fence::null())
            .map_err(submit_error)?;
        self.state = next;
        device.queue_wait_idle(device.graphics_queue())?;

        self.free();
        Ok(())
    }

    /// Handle to hand to a queue submission. The buffer must be executable.
    pub fn executable(&self) -> Result<vk::CommandBuffer, RenderError> {
        match self.state {
            CommandBufferState::Executable(_) => Ok(self.handle),
            state => Err(RenderError::InvalidCommandBufferState { op: "submit", state }),
        }
    }

    /// Records that the buffer was handed to a queue outside `end_and_submit`.
    pub fn mark_submitted(&mut self) -> Result<(), RenderError> {
        self.state = self.state.submit()?;
        Ok(())
    }

    pub unsafe fn reset(&mut self) -> Result<()> {
        let next = self.state.reset()?;
        self.pool
            .device
            .reset_command_buffer(self.handle, vk::CommandBufferResetFlags::RELEASE_RESOURCES)?;
        self.state = next;
        Ok(())
    }

    /// Returns the buffer to its pool. Safe to call more than once.
    pub fn free(&mut self) {
        if self.state.free() {
            unsafe {
                self.pool
                    .device
                    .free_command_buffers(self.pool.handle, &[self.handle])
            };
        }
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CommandBufferState::*;

    #[test]
    fn single_time_lifecycle() {
        let state = Initial.begin(Usage::SingleTime).unwrap();
        assert_eq!(state, Recording(Usage::SingleTime));
        let state = state.end().unwrap();
        assert_eq!(state, Executable(Usage::SingleTime));
        let mut state = state.submit().unwrap();
        assert_eq!(state, Pending(Usage::SingleTime));
        assert!(state.free());
        assert_eq!(state, Freed);
    }

    #[test]
    fn submit_requires_begin_and_end() {
        assert!(Initial.end().is_err());
        assert!(Initial.submit().is_err());
        let recording = Initial.begin(Usage::SingleTime).unwrap();
        assert!(recording.submit().is_err());
    }

    #[test]
    fn reset_returns_reusable_buffer_to_initial() {
        let pending = Initial
            .begin(Usage::Reusable)
            .and_then(CommandBufferState::end)
            .and_then(CommandBufferState::submit)
            .unwrap();
        let state = pending.reset().unwrap();
        assert_eq!(state, Initial);
        assert_eq!(state.begin(Usage::Reusable).unwrap(), Recording(Usage::Reusable));
    }

    #[test]
    fn begin_twice_is_rejected() {
        let recording = Initial.begin(Usage::Reusable).unwrap();
        let error = recording.begin(Usage::Reusable).unwrap_err();
        assert!(matches!(
            error,
            RenderError::InvalidCommandBufferState { op: "begin", state: Recording(Usage::Reusable) }
        ));
    }

    #[test]
    fn pending_single_time_cannot_be_reset() {
        let pending = Pending(Usage::SingleTime);
        assert!(pending.reset().is_err());
    }

    #[test]
    fn free_is_reported_once() {
        let mut state = Executable(Usage::SingleTime);
        assert!(state.free());
        assert!(!state.free());
        assert!(!state.free());
    }

    #[test]
    fn freed_buffer_cannot_be_reused() {
        assert!(Freed.begin(Usage::SingleTime).is_err());
        assert!(Freed.reset().is_err());
        assert!(Freed.end().is_err());
    }
}
