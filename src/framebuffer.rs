//! Framebuffers.

use std::sync::Arc;

use anyhow::Result;
use vulkanalia::prelude::v1_0::*;

use crate::device::VulkanDevice;
use crate::error::VkResultExt;
use crate::render_pass::RenderPass;

pub struct Framebuffer {
    device: Arc<VulkanDevice>,
    handle: vk::Framebuffer,
}

impl Framebuffer {
    /// `attachments` must follow the render pass attachment order.
    pub unsafe fn new(
        device: Arc<VulkanDevice>,
        render_pass: &RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass.handle())
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        let handle = device
            .create_framebuffer(&info, None)
            .or_fail("framebuffer")?;

        Ok(Self { device, handle })
    }

    pub fn handle(&self) -> vk::Framebuffer {
        self.handle
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        unsafe { self.device.destroy_framebuffer(self.handle, None) };
    }
}
