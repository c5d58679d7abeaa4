//! Textured model viewer on Vulkan: swapchain management, GPU resources and
//! the per-frame acquire, record, submit and present loop.

pub mod buffer;
pub mod command;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod framebuffer;
pub mod image;
pub mod instance;
pub mod memory;
pub mod mesh;
pub mod pipeline;
pub mod render_pass;
pub mod renderer;
pub mod sampler;
pub mod scene;
pub mod swapchain;
pub mod sync;
pub mod uniform;
pub mod validation;

/// Frames the CPU may record ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;
