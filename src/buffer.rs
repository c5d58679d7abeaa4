//! Buffers with their own memory, staging uploads and host copies.

use std::sync::Arc;

use anyhow::Result;
use vulkanalia::prelude::v1_0::*;
use vulkanalia::VkResult;

use crate::command::CommandPool;
use crate::device::VulkanDevice;
use crate::error::{RenderError, VkResultExt};
use crate::image::Image;

/// A buffer bound to its own memory allocation.
pub struct Buffer {
    device: Arc<VulkanDevice>,
    handle: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    properties: vk::MemoryPropertyFlags,
}

impl Buffer {
    pub unsafe fn new(
        device: Arc<VulkanDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        check_buffer_size(size)?;

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = device.create_buffer(&buffer_info, None).or_fail("buffer")?;

        let requirements = device.get_buffer_memory_requirements(handle);
        let memory = match allocate(&device, requirements, properties) {
            Ok(memory) => memory,
            Err(e) => {
                device.destroy_buffer(handle, None);
                return Err(e);
            }
        };
        release_on_failure(
            device.bind_buffer_memory(handle, memory, 0),
            "buffer memory binding",
            || {
                device.destroy_buffer(handle, None);
                device.free_memory(memory, None);
            },
        )?;

        Ok(Self {
            device,
            handle,
            memory,
            size,
            properties,
        })
    }

    /// Host-visible, host-coherent buffer filled with `data`, for staging
    /// uploads into device-local resources.
    pub unsafe fn staging(device: Arc<VulkanDevice>, data: &[u8]) -> Result<Self> {
        let buffer = Self::new(
            device,
            data.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        buffer.copy_from(data)?;
        Ok(buffer)
    }

    /// Device-local buffer with `usage` populated from `data` through a
    /// staging copy.
    pub unsafe fn device_local(
        pool: &Arc<CommandPool>,
        data: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        let device = pool.device().clone();
        let staging = Self::staging(device.clone(), data)?;
        let buffer = Self::new(
            device,
            data.len() as vk::DeviceSize,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        staging.copy_to(pool, &buffer, data.len() as vk::DeviceSize)?;
        Ok(buffer)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Maps, copies and unmaps. The caller must not overlap this with GPU use
    /// of the same buffer.
    pub unsafe fn copy_from(&self, data: &[u8]) -> Result<()> {
        check_host_copy(self.properties, data.len() as u64, self.size)?;
        if data.is_empty() {
            return Ok(());
        }

        let memory = self.device.map_memory(
            self.memory,
            0,
            data.len() as vk::DeviceSize,
            vk::MemoryMapFlags::empty(),
        )?;
        std::ptr::copy_nonoverlapping(data.as_ptr(), memory.cast(), data.len());
        self.device.unmap_memory(self.memory);

        Ok(())
    }

    /// Blocking buffer-to-buffer copy through a single-time command buffer.
    pub unsafe fn copy_to(
        &self,
        pool: &Arc<CommandPool>,
        destination: &Buffer,
        size: vk::DeviceSize,
    ) -> Result<()> {
        let mut command_buffer = pool.begin_single_time()?;

        let regions = vk::BufferCopy::builder()
            .src_offset(0)
            .dst_offset(0)
            .size(size);
        self.device.cmd_copy_buffer(
            command_buffer.recording()?,
            self.handle,
            destination.handle,
            &[regions],
        );

        command_buffer.end_and_submit()
    }

    /// Blocking copy into mip level 0 of an image in `TRANSFER_DST_OPTIMAL`.
    pub unsafe fn copy_to_image(
        &self,
        pool: &Arc<CommandPool>,
        destination: &Image,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let mut command_buffer = pool.begin_single_time()?;

        let region = vk::BufferImageCopy::builder()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(
                vk::ImageSubresourceLayers::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1)
                    .build(),
            )
            .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .image_extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            });

        self.device.cmd_copy_buffer_to_image(
            command_buffer.recording()?,
            self.handle,
            destination.handle(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );

        command_buffer.end_and_submit()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(self.handle, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

pub(crate) unsafe fn allocate(
    device: &VulkanDevice,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
) -> Result<vk::DeviceMemory> {
    let memory_type = device.memory_type(requirements, properties)?;

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type);

    Ok(device
        .allocate_memory(&alloc_info, None)
        .or_fail("device memory")?)
}

/// Runs `release` before reporting a failed step of a multi-call creation,
/// so nothing created by the earlier calls leaks.
pub(crate) fn release_on_failure<T>(
    result: VkResult<T>,
    what: &'static str,
    release: impl FnOnce(),
) -> Result<T, RenderError> {
    result.or_fail(what).inspect_err(|_| release())
}

fn check_buffer_size(size: vk::DeviceSize) -> Result<(), RenderError> {
    if size == 0 {
        return Err(RenderError::ZeroSizedBuffer);
    }
    Ok(())
}

fn check_host_copy(
    properties: vk::MemoryPropertyFlags,
    len: u64,
    size: vk::DeviceSize,
) -> Result<(), RenderError> {
    if !properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
        return Err(RenderError::NotHostVisible);
    }
    if len > size {
        return Err(RenderError::CopyOutOfBounds { len, size });
    }
    Ok(())
}
