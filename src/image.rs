//! Images, their view cache, layout transitions and mip generation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use vulkanalia::prelude::v1_0::*;

use crate::buffer::{allocate, release_on_failure, Buffer};
use crate::command::{CommandBuffer, CommandPool};
use crate::device::VulkanDevice;
use crate::error::{RenderError, VkResultExt};

/// Number of levels in a full mip chain: `floor(log2(max(w, h))) + 1`.
pub fn mip_levels(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Extent of every level of a full mip chain, base level first. Each level
/// halves the previous one with a floor of 1 per dimension.
pub fn mip_extents(width: u32, height: u32) -> Vec<(u32, u32)> {
    let mut extents = Vec::with_capacity(mip_levels(width, height) as usize);
    let (mut w, mut h) = (width.max(1), height.max(1));
    extents.push((w, h));
    while w > 1 || h > 1 {
        w = (w / 2).max(1);
        h = (h / 2).max(1);
        extents.push((w, h));
    }
    extents
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Barrier masks for the two layout transitions images go through during an
/// upload. Anything else is rejected.
pub fn transition_masks(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<TransitionMasks, RenderError> {
    match (old, new) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => Ok(TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        }),
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => {
            Ok(TransitionMasks {
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::SHADER_READ,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            })
        }
        _ => Err(RenderError::UnsupportedLayoutTransition { old, new }),
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ViewKey {
    pub format: vk::Format,
    pub aspect: vk::ImageAspectFlags,
    pub mip_levels: u32,
}

/// Views created on demand, one per distinct key, kept until the owning
/// image is destroyed.
#[derive(Debug)]
pub struct ViewCache<V> {
    views: HashMap<ViewKey, V>,
}

impl<V> Default for ViewCache<V> {
    fn default() -> Self {
        Self {
            views: HashMap::new(),
        }
    }
}

impl<V: Copy> ViewCache<V> {
    pub fn get_or_insert_with<E>(
        &mut self,
        key: ViewKey,
        create: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        if let Some(view) = self.views.get(&key) {
            return Ok(*view);
        }
        let view = create()?;
        self.views.insert(key, view);
        Ok(view)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.views.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = V> + '_ {
        self.views.drain().map(|(_, view)| view)
    }
}

/// Parameters for an image that owns its memory.
#[derive(Copy, Clone, Debug)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    /// Allocate a full mip chain instead of a single level.
    pub mipmapped: bool,
    pub samples: vk::SampleCountFlags,
    pub format: vk::Format,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub properties: vk::MemoryPropertyFlags,
}

pub struct Image {
    device: Arc<VulkanDevice>,
    handle: vk::Image,
    /// `None` for images owned by someone else, such as the swapchain.
    memory: Option<vk::DeviceMemory>,
    format: vk::Format,
    extent: vk::Extent2D,
    mip_levels: u32,
    views: ViewCache<vk::ImageView>,
}

impl Image {
    /// Wraps an image whose memory is managed elsewhere.
    pub fn wrap(
        device: Arc<VulkanDevice>,
        handle: vk::Image,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> Self {
        Self {
            device,
            handle,
            memory: None,
            format,
            extent,
            mip_levels: 1,
            views: ViewCache::default(),
        }
    }

    pub unsafe fn new(device: Arc<VulkanDevice>, desc: ImageDesc) -> Result<Self> {
        let mip_levels = if desc.mipmapped {
            mip_levels(desc.width, desc.height)
        } else {
            1
        };

        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::_2D)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(mip_levels)
            .array_layers(1)
            .format(desc.format)
            .tiling(desc.tiling)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(desc.samples);

        let handle = device.create_image(&info, None).or_fail("image")?;

        let requirements = device.get_image_memory_requirements(handle);
        let memory = match allocate(&device, requirements, desc.properties) {
            Ok(memory) => memory,
            Err(e) => {
                device.destroy_image(handle, None);
                return Err(e);
            }
        };
        release_on_failure(
            device.bind_image_memory(handle, memory, 0),
            "image memory binding",
            || {
                device.destroy_image(handle, None);
                device.free_memory(memory, None);
            },
        )?;

        Ok(Self {
            device,
            handle,
            memory: Some(memory),
            format: desc.format,
            extent: vk::Extent2D {
                width: desc.width,
                height: desc.height,
            },
            mip_levels,
            views: ViewCache::default(),
        })
    }

    /// Decodes an image file and uploads it as a mipmapped, sampled
    /// `R8G8B8A8_SRGB` texture left in `SHADER_READ_ONLY_OPTIMAL`.
    pub unsafe fn load_from<P: AsRef<Path>>(pool: &Arc<CommandPool>, path: P) -> Result<Self> {
        let path = path.as_ref();
        let pixels = ::image::open(path)
            .with_context(|| format!("Failed to load texture {:?}", path))?
            .to_rgba8();
        let (width, height) = pixels.dimensions();

        let device = pool.device().clone();
        let staging = Buffer::staging(device.clone(), pixels.as_raw())?;

        let texture = Self::new(
            device,
            ImageDesc {
                width,
                height,
                mipmapped: true,
                samples: vk::SampleCountFlags::_1,
                format: vk::Format::R8G8B8A8_SRGB,
                tiling: vk::ImageTiling::OPTIMAL,
                usage: vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::TRANSFER_SRC,
                properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            },
        )?;

        let mut command_buffer = pool.begin_single_time()?;
        texture.change_layout(
            &command_buffer,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;
        command_buffer.end_and_submit()?;

        staging.copy_to_image(pool, &texture, width, height)?;

        texture.generate_mipmaps(pool)?;

        log::info!(
            "Loaded texture {:?} ({}x{}, {} mip levels)",
            path, width, height, texture.mip_levels
        );

        Ok(texture)
    }

    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    /// Cached view covering every mip level of the image.
    pub unsafe fn get_view(
        &mut self,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView> {
        let key = ViewKey {
            format,
            aspect,
            mip_levels: self.mip_levels,
        };
        let device = &self.device;
        let handle = self.handle;

        Ok(self.views.get_or_insert_with(key, || {
            log::debug!("Creating {:?} view of {:?} image", aspect, format);
            let info = vk::ImageViewCreateInfo::builder()
                .image(handle)
                .view_type(vk::ImageViewType::_2D)
                .format(format)
                .subresource_range(
                    vk::ImageSubresourceRange::builder()
                        .aspect_mask(aspect)
                        .base_mip_level(0)
                        .level_count(key.mip_levels)
                        .base_array_layer(0)
                        .layer_count(1)
                        .build(),
                );
            device.create_image_view(&info, None).or_fail("image view")
        })?)
    }

    /// Records a barrier moving every mip level from `old` to `new`.
    pub unsafe fn change_layout(
        &self,
        command_buffer: &CommandBuffer,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) -> Result<()> {
        let masks = transition_masks(old, new)?;

        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(old)
            .new_layout(new)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.handle)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(self.mip_levels)
                    .base_array_layer(0)
                    .layer_count(1)
                    .build(),
            )
            .src_access_mask(masks.src_access)
            .dst_access_mask(masks.dst_access);

        self.device.cmd_pipeline_barrier(
            command_buffer.recording()?,
            masks.src_stage,
            masks.dst_stage,
            vk::DependencyFlags::empty(),
            &[] as &[vk::MemoryBarrier],
            &[] as &[vk::BufferMemoryBarrier],
            &[barrier],
        );

        Ok(())
    }

    /// Fills mip levels 1.. by blitting from the level above. Expects every
    /// level in `TRANSFER_DST_OPTIMAL` and leaves all of them in
    /// `SHADER_READ_ONLY_OPTIMAL`.
    pub unsafe fn generate_mipmaps(&self, pool: &Arc<CommandPool>) -> Result<()> {
        let properties = self.device.instance().format_properties(self.format);
        if !properties
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
        {
            return Err(RenderError::LinearBlitUnsupported(self.format).into());
        }

        let mut command_buffer = pool.begin_single_time()?;
        let cb = command_buffer.recording()?;

        let subresource = vk::ImageSubresourceRange::builder()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .base_array_layer(0)
            .layer_count(1)
            .level_count(1);

        let mut barrier = vk::ImageMemoryBarrier::builder()
            .image(self.handle)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(subresource);

        let extents = mip_extents(self.extent.width, self.extent.height);
        for (level, pair) in (1..self.mip_levels).zip(extents.windows(2)) {
            let (src_width, src_height) = pair[0];
            let (dst_width, dst_height) = pair[1];

            barrier.subresource_range.base_mip_level = level - 1;
            barrier.old_layout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
            barrier.new_layout = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
            barrier.src_access_mask = vk::AccessFlags::TRANSFER_WRITE;
            barrier.dst_access_mask = vk::AccessFlags::TRANSFER_READ;

            self.device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[] as &[vk::MemoryBarrier],
                &[] as &[vk::BufferMemoryBarrier],
                &[barrier],
            );

            let src_subresource = vk::ImageSubresourceLayers::builder()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .mip_level(level - 1)
                .base_array_layer(0)
                .layer_count(1);

            let dst_subresource = vk::ImageSubresourceLayers::builder()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .mip_level(level)
                .base_array_layer(0)
                .layer_count(1);

            let blit = vk::ImageBlit::builder()
                .src_offsets([
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: src_width as i32,
                        y: src_height as i32,
                        z: 1,
                    },
                ])
                .src_subresource(src_subresource)
                .dst_offsets([
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: dst_width as i32,
                        y: dst_height as i32,
                        z: 1,
                    },
                ])
                .dst_subresource(dst_subresource);

            self.device.cmd_blit_image(
                cb,
                self.handle,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                self.handle,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::LINEAR,
            );

            barrier.old_layout = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
            barrier.new_layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
            barrier.src_access_mask = vk::AccessFlags::TRANSFER_READ;
            barrier.dst_access_mask = vk::AccessFlags::SHADER_READ;

            self.device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[] as &[vk::MemoryBarrier],
                &[] as &[vk::BufferMemoryBarrier],
                &[barrier],
            );
        }

        barrier.subresource_range.base_mip_level = self.mip_levels - 1;
        barrier.old_layout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
        barrier.new_layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        barrier.src_access_mask = vk::AccessFlags::TRANSFER_WRITE;
        barrier.dst_access_mask = vk::AccessFlags::SHADER_READ;

        self.device.cmd_pipeline_barrier(
            cb,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::DependencyFlags::empty(),
            &[] as &[vk::MemoryBarrier],
            &[] as &[vk::BufferMemoryBarrier],
            &[barrier],
        );

        command_buffer.end_and_submit()
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            for view in self.views.drain() {
                self.device.destroy_image_view(view, None);
            }
            if let Some(memory) = self.memory.take() {
                self.device.destroy_image(self.handle, None);
                self.device.free_memory(memory, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_levels_for_non_square_image() {
        assert_eq!(mip_levels(512, 300), 10);
        assert_eq!(mip_levels(1, 1), 1);
        assert_eq!(mip_levels(1024, 1024), 11);
        assert_eq!(mip_levels(3, 700), 10);
    }

    #[test]
    fn mip_extents_halve_with_floor_of_one() {
        let extents = mip_extents(512, 300);
        assert_eq!(extents.len(), mip_levels(512, 300) as usize);
        assert_eq!(
            &extents[..5],
            &[(512, 300), (256, 150), (128, 75), (64, 37), (32, 18)]
        );
        assert_eq!(&extents[7..], &[(4, 2), (2, 1), (1, 1)]);
    }

    #[test]
    fn supported_transitions() {
        let upload = transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert!(upload.src_access.is_empty());
        assert_eq!(upload.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(upload.dst_stage, vk::PipelineStageFlags::TRANSFER);

        let sample = transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(sample.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(sample.dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(sample.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn other_transitions_are_rejected() {
        let layouts = [
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        ];
        let mut accepted = 0;
        for old in layouts {
            for new in layouts {
                match transition_masks(old, new) {
                    Ok(_) => accepted += 1,
                    Err(RenderError::UnsupportedLayoutTransition { old: o, new: n }) => {
                        assert_eq!((o, n), (old, new));
                    }
                    Err(e) => panic!("unexpected error {e}"),
                }
            }
        }
        assert_eq!(accepted, 2);
        assert!(transition_masks(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        )
        .is_err());
    }

    fn key(format: vk::Format, aspect: vk::ImageAspectFlags) -> ViewKey {
        ViewKey {
            format,
            aspect,
            mip_levels: 1,
        }
    }

    #[test]
    fn view_cache_creates_once_per_key() {
        let mut cache = ViewCache::default();
        let mut created = 0u32;
        let mut create = || -> Result<u32, ()> {
            created += 1;
            Ok(created)
        };

        let color = key(vk::Format::B8G8R8A8_SRGB, vk::ImageAspectFlags::COLOR);
        let first = cache.get_or_insert_with(color, &mut create).unwrap();
        let second = cache.get_or_insert_with(color, &mut create).unwrap();
        assert_eq!(first, second);

        let depth = key(vk::Format::D32_SFLOAT_S8_UINT, vk::ImageAspectFlags::DEPTH);
        let third = cache.get_or_insert_with(depth, &mut create).unwrap();
        assert_ne!(first, third);

        let mut more_levels = color;
        more_levels.mip_levels = 4;
        let fourth = cache.get_or_insert_with(more_levels, &mut create).unwrap();
        assert_ne!(first, fourth);

        assert_eq!(cache.len(), 3);
        drop(create);
        assert_eq!(created, 3);
    }

    #[test]
    fn failed_creation_is_not_cached() {
        let mut cache: ViewCache<u32> = ViewCache::default();
        let color = key(vk::Format::R8G8B8A8_SRGB, vk::ImageAspectFlags::COLOR);
        assert!(cache.get_or_insert_with(color, || Err("boom")).is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.get_or_insert_with(color, || Ok::<_, ()>(7)), Ok(7));
    }

    #[test]
    fn new_cache_starts_empty() {
        let mut old: ViewCache<u32> = ViewCache::default();
        let color = key(vk::Format::R8G8B8A8_SRGB, vk::ImageAspectFlags::COLOR);
        old.get_or_insert_with(color, || Ok::<_, ()>(1)).unwrap();

        let mut fresh: ViewCache<u32> = ViewCache::default();
        assert_eq!(fresh.get_or_insert_with(color, || Ok::<_, ()>(2)), Ok(2));
    }
}
