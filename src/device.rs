//! Logical device and queues.

use std::ops::Deref;
use std::sync::Arc;

use anyhow::Result;
use vulkanalia::prelude::v1_0::*;

use crate::error::VkResultExt;
use crate::instance::{VulkanInstance, DEVICE_EXTENSIONS};

/// Logical device plus its graphics and present queues. The two queues are
/// the same handle when both roles share a family.
pub struct VulkanDevice {
    instance: Arc<VulkanInstance>,
    device: Device,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
}

impl VulkanDevice {
    pub unsafe fn new(instance: Arc<VulkanInstance>) -> Result<Arc<Self>> {
        let indices = instance.queue_families();

        let queue_priorities = &[1.0];
        let queue_infos = indices
            .unique()
            .into_iter()
            .map(|i| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(i)
                    .queue_priorities(queue_priorities)
            })
            .collect::<Vec<_>>();

        let layers = instance.validation_layers();

        let extensions = DEVICE_EXTENSIONS
            .iter()
            .map(|n| n.as_ptr())
            .collect::<Vec<_>>();

        let features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(instance.max_anisotropy().is_some());

        let info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = instance
            .create_device(instance.physical_device(), &info, None)
            .or_fail("logical device")?;

        let graphics_queue = device.get_device_queue(indices.graphics, 0);
        let present_queue = device.get_device_queue(indices.present, 0);

        if indices.graphics == indices.present {
            log::info!("Graphics and present share queue family {}", indices.graphics);
        } else {
            log::info!(
                "Graphics queue family {}, present queue family {}",
                indices.graphics, indices.present
            );
        }

        Ok(Arc::new(Self {
            instance,
            device,
            graphics_queue,
            present_queue,
        }))
    }

    pub fn instance(&self) -> &Arc<VulkanInstance> {
        &self.instance
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    /// Blocks until every queue on the device is idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    pub unsafe fn memory_type(
        &self,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        let memory = self.instance.memory_properties();
        Ok(crate::memory::find_memory_type(
            &memory,
            requirements.memory_type_bits,
            properties,
        )?)
    }
}

impl Deref for VulkanDevice {
    type Target = Device;

    fn deref(&self) -> &Device {
        &self.device
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::debug!("Destroying logical device");
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::warn!("Device wait idle failed during teardown: {}", e);
            }
            self.device.destroy_device(None);
        }
    }
}
