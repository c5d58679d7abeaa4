//! Failure taxonomy for GPU object management.
//!
//! Creation failures and policy violations are fatal: they propagate to
//! `main` and end the process. Presentation staleness is not represented here
//! at all; it is reported through [`crate::swapchain::SurfaceStatus`].

use thiserror::Error;
use vulkanalia::prelude::v1_0::*;
use vulkanalia::VkResult;

#[derive(Debug, Error)]
pub enum RenderError {
    /// A `vkCreate*`/`vkAllocate*` call failed.
    #[error("failed to create {what}: {code}")]
    Creation {
        what: &'static str,
        code: vk::ErrorCode,
    },

    /// The device is gone; nothing built on it can be used again.
    #[error("device lost during queue submission")]
    DeviceLost,

    #[error("failed to submit draw command buffer: {0}")]
    Submit(vk::ErrorCode),

    #[error("failed to acquire swapchain image: {0}")]
    Acquire(vk::ErrorCode),

    #[error("failed to present swapchain image: {0}")]
    Present(vk::ErrorCode),

    #[error("unsupported layout transition: {old:?} -> {new:?}")]
    UnsupportedLayoutTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    #[error("failed to find suitable memory type (filter {type_filter:#b}, properties {properties:?})")]
    NoSuitableMemoryType {
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    },

    #[error("texture image format {0:?} does not support linear blitting")]
    LinearBlitUnsupported(vk::Format),

    #[error("failed to find supported depth format")]
    NoSupportedDepthFormat,

    #[error("buffers must be at least one byte long")]
    ZeroSizedBuffer,

    #[error("buffer memory is not host visible")]
    NotHostVisible,

    #[error("copy of {len} bytes does not fit in a buffer of {size} bytes")]
    CopyOutOfBounds { len: u64, size: u64 },

    #[error("cannot {op} a command buffer in the {state:?} state")]
    InvalidCommandBufferState {
        op: &'static str,
        state: crate::command::CommandBufferState,
    },

    #[error("shader bytecode length {len} is not a non-zero multiple of 4")]
    InvalidShaderBytecode { len: usize },
}

pub trait VkResultExt<T> {
    /// Tags a creation failure with the kind of object that could not be made.
    fn or_fail(self, what: &'static str) -> Result<T, RenderError>;
}

impl<T> VkResultExt<T> for VkResult<T> {
    fn or_fail(self, what: &'static str) -> Result<T, RenderError> {
        self.map_err(|code| RenderError::Creation { what, code })
    }
}

/// Classifies a failed `vkQueueSubmit`.
pub fn submit_error(code: vk::ErrorCode) -> RenderError {
    if code == vk::ErrorCode::DEVICE_LOST {
        RenderError::DeviceLost
    } else {
        RenderError::Submit(code)
    }
}
