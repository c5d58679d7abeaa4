//! Descriptor set layout and the per-image descriptor pool.

use std::sync::Arc;

use anyhow::Result;
use vulkanalia::prelude::v1_0::*;

use crate::buffer::Buffer;
use crate::device::VulkanDevice;
use crate::error::VkResultExt;

/// Binding 0: uniform buffer read by the vertex stage.
/// Binding 1: combined image sampler read by the fragment stage.
pub struct DescriptorSetLayout {
    device: Arc<VulkanDevice>,
    handle: vk::DescriptorSetLayout,
}

impl DescriptorSetLayout {
    pub unsafe fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let ubo_binding = vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX);

        let sampler_binding = vk::DescriptorSetLayoutBinding::builder()
            .binding(1)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT);

        let bindings = &[ubo_binding, sampler_binding];
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);

        let handle = device
            .create_descriptor_set_layout(&info, None)
            .or_fail("descriptor set layout")?;

        Ok(Self { device, handle })
    }

    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.handle
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe { self.device.destroy_descriptor_set_layout(self.handle, None) };
    }
}

/// Pool holding one descriptor set per swapchain image. The sets are freed
/// with the pool.
pub struct DescriptorPool {
    device: Arc<VulkanDevice>,
    handle: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
}

impl DescriptorPool {
    pub unsafe fn new(
        device: Arc<VulkanDevice>,
        layout: &DescriptorSetLayout,
        count: u32,
    ) -> Result<Self> {
        let ubo_size = vk::DescriptorPoolSize::builder()
            .type_(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(count);

        let sampler_size = vk::DescriptorPoolSize::builder()
            .type_(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(count);

        let pool_sizes = &[ubo_size, sampler_size];
        let info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(pool_sizes)
            .max_sets(count);

        let handle = device
            .create_descriptor_pool(&info, None)
            .or_fail("descriptor pool")?;

        let layouts = vec![layout.handle(); count as usize];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(handle)
            .set_layouts(&layouts);

        let sets = match device.allocate_descriptor_sets(&info) {
            Ok(sets) => sets,
            Err(code) => {
                device.destroy_descriptor_pool(handle, None);
                return Err(crate::error::RenderError::Creation {
                    what: "descriptor sets",
                    code,
                }
                .into());
            }
        };

        Ok(Self {
            device,
            handle,
            sets,
        })
    }

    pub fn set(&self, index: usize) -> vk::DescriptorSet {
        self.sets[index]
    }

    /// Points set `index` at a uniform buffer and a sampled texture view.
    pub unsafe fn write(
        &self,
        index: usize,
        uniform_buffer: &Buffer,
        texture_view: vk::ImageView,
        sampler: vk::Sampler,
    ) {
        let info = vk::DescriptorBufferInfo::builder()
            .buffer(uniform_buffer.handle())
            .offset(0)
            .range(uniform_buffer.size());

        let buffer_info = &[info];
        let ubo_write = vk::WriteDescriptorSet::builder()
            .dst_set(self.sets[index])
            .dst_binding(0)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(buffer_info);

        let info = vk::DescriptorImageInfo::builder()
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .image_view(texture_view)
            .sampler(sampler);

        let image_info = &[info];
        let sampler_write = vk::WriteDescriptorSet::builder()
            .dst_set(self.sets[index])
            .dst_binding(1)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(image_info);

        self.device.update_descriptor_sets(
            &[ubo_write, sampler_write],
            &[] as &[vk::CopyDescriptorSet],
        );
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe { self.device.destroy_descriptor_pool(self.handle, None) };
    }
}
