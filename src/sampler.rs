//! The texture sampler.

use std::sync::Arc;

use anyhow::Result;
use vulkanalia::prelude::v1_0::*;

use crate::device::VulkanDevice;
use crate::error::VkResultExt;

pub struct TextureSampler {
    device: Arc<VulkanDevice>,
    handle: vk::Sampler,
}

impl TextureSampler {
    /// Linear, repeating sampler covering `mip_levels` levels of detail.
    /// Anisotropic filtering is used at the device limit when available.
    pub unsafe fn new(device: Arc<VulkanDevice>, mip_levels: u32) -> Result<Self> {
        let max_anisotropy = device.instance().max_anisotropy();

        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(max_anisotropy.is_some())
            .max_anisotropy(max_anisotropy.unwrap_or(1.0))
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .mip_lod_bias(0.0)
            .min_lod(0.0)
            .max_lod(mip_levels as f32);

        let handle = device.create_sampler(&info, None).or_fail("texture sampler")?;

        Ok(Self { device, handle })
    }

    pub fn handle(&self) -> vk::Sampler {
        self.handle
    }
}

impl Drop for TextureSampler {
    fn drop(&mut self) {
        unsafe { self.device.destroy_sampler(self.handle, None) };
    }
}
