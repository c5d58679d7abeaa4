//! Presentable images and the acquire, submit, present protocol.

use std::sync::Arc;

use anyhow::Result;
use vulkanalia::prelude::v1_0::*;
use vulkanalia::vk::KhrSwapchainExtension;
use vulkanalia::VkResult;

use crate::command::CommandBuffer;
use crate::device::VulkanDevice;
use crate::error::{submit_error, RenderError, VkResultExt};
use crate::image::Image;
use crate::sync::{FrameScheduler, FrameSync, ImagesInFlight};

/// Health of the surface as last reported by acquire or present. Ordered
/// from best to worst.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SurfaceStatus {
    Optimal,
    /// Still presentable but no longer matches the surface exactly.
    Suboptimal,
    /// Unusable until the swapchain is rebuilt.
    OutOfDate,
}

pub fn acquire_outcome(
    result: VkResult<(u32, vk::SuccessCode)>,
) -> Result<(Option<u32>, SurfaceStatus), RenderError> {
    match result {
        Ok((index, vk::SuccessCode::SUBOPTIMAL_KHR)) => Ok((Some(index), SurfaceStatus::Suboptimal)),
        Ok((index, _)) => Ok((Some(index), SurfaceStatus::Optimal)),
        Err(vk::ErrorCode::OUT_OF_DATE_KHR) => Ok((None, SurfaceStatus::OutOfDate)),
        Err(e) => Err(RenderError::Acquire(e)),
    }
}

pub fn present_outcome(result: VkResult<vk::SuccessCode>) -> Result<SurfaceStatus, RenderError> {
    match result {
        Ok(vk::SuccessCode::SUBOPTIMAL_KHR) => Ok(SurfaceStatus::Suboptimal),
        Ok(_) => Ok(SurfaceStatus::Optimal),
        Err(vk::ErrorCode::OUT_OF_DATE_KHR) => Ok(SurfaceStatus::OutOfDate),
        Err(e) => Err(RenderError::Present(e)),
    }
}

/// 8-bit sRGB BGRA with the sRGB nonlinear color space, else the first
/// format reported.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    formats
        .iter()
        .cloned()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .unwrap_or_else(|| formats[0])
}

/// Mailbox when available, FIFO otherwise. The `vsync` feature always
/// picks FIFO.
pub fn choose_present_mode(present_modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if cfg!(feature = "vsync") {
        return vk::PresentModeKHR::FIFO;
    }
    present_modes
        .iter()
        .cloned()
        .find(|m| *m == vk::PresentModeKHR::MAILBOX)
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    framebuffer_size: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        let clamp = |min: u32, max: u32, v: u32| min.max(max.min(v));
        vk::Extent2D::builder()
            .width(clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
                framebuffer_size.width,
            ))
            .height(clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
                framebuffer_size.height,
            ))
            .build()
    }
}

/// One more than the minimum, bounded by the maximum when there is one.
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut image_count = capabilities.min_image_count + 1;
    if capabilities.max_image_count != 0 && image_count > capabilities.max_image_count {
        image_count = capabilities.max_image_count;
    }
    image_count
}

pub struct Swapchain {
    device: Arc<VulkanDevice>,
    handle: vk::SwapchainKHR,
    format: vk::Format,
    extent: vk::Extent2D,
    images: Vec<Image>,
    frames: Vec<FrameSync>,
    scheduler: FrameScheduler,
    images_in_flight: ImagesInFlight,
    current_image: usize,
    status: SurfaceStatus,
}

impl Swapchain {
    pub unsafe fn new(
        device: Arc<VulkanDevice>,
        framebuffer_size: vk::Extent2D,
        frames_in_flight: usize,
    ) -> Result<Self> {
        let instance = device.instance().clone();
        let indices = instance.queue_families();
        let support = instance.swapchain_support()?;

        let surface_format = choose_surface_format(&support.formats);
        let present_mode = choose_present_mode(&support.present_modes);
        let extent = choose_extent(&support.capabilities, framebuffer_size);
        let image_count = choose_image_count(&support.capabilities);

        let queue_family_indices = indices.unique();
        let image_sharing_mode = if queue_family_indices.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        };

        let info = vk::SwapchainCreateInfoKHR::builder()
            .surface(instance.surface())
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(image_sharing_mode)
            .queue_family_indices(&queue_family_indices)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(vk::SwapchainKHR::null());

        let handle = device
            .create_swapchain_khr(&info, None)
            .or_fail("swapchain")?;

        let images = device
            .get_swapchain_images_khr(handle)?
            .into_iter()
            .map(|i| Image::wrap(device.clone(), i, surface_format.format, extent))
            .collect::<Vec<_>>();

        let frames = (0..frames_in_flight)
            .map(|_| FrameSync::new(device.clone()))
            .collect::<Result<Vec<_>>>()?;

        log::info!(
            "Created swapchain: {}x{}, {:?}, {:?}, {} images",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode,
            images.len()
        );

        Ok(Self {
            images_in_flight: ImagesInFlight::new(images.len()),
            scheduler: FrameScheduler::new(frames_in_flight),
            device,
            handle,
            format: surface_format.format,
            extent,
            images,
            frames,
            current_image: 0,
            status: SurfaceStatus::Optimal,
        })
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// True once acquire or present has reported the surface as suboptimal
    /// or out of date.
    pub fn is_invalid(&self) -> bool {
        self.status != SurfaceStatus::Optimal
    }

    pub unsafe fn image_view(&mut self, index: usize) -> Result<vk::ImageView> {
        let format = self.format;
        self.images[index].get_view(format, vk::ImageAspectFlags::COLOR)
    }

    /// Waits for the current slot's previous submission, then acquires the
    /// next image. Returns `None` when the surface is out of date.
    pub unsafe fn acquire_next_image(&mut self) -> Result<Option<usize>> {
        let slot = self.scheduler.slot();
        let frame = &self.frames[slot];

        self.device
            .wait_for_fences(&[frame.in_flight], true, u64::MAX)?;

        let result = self.device.acquire_next_image_khr(
            self.handle,
            u64::MAX,
            frame.image_available,
            vk::Fence::null(),
        );

        let (index, status) = acquire_outcome(result)?;
        self.status = status;

        let Some(index) = index else {
            log::info!("Swapchain out of date on acquire");
            return Ok(None);
        };
        if status == SurfaceStatus::Suboptimal {
            log::warn!("Swapchain suboptimal on acquire");
        }

        let index = index as usize;
        if let Some(owner) = self.images_in_flight.claim(index, slot) {
            log::trace!("Image {} still owned by slot {}, waiting", index, owner);
            self.device
                .wait_for_fences(&[self.frames[owner].in_flight], true, u64::MAX)?;
        }

        self.current_image = index;
        Ok(Some(index))
    }

    /// Submits `command_buffer` for the current slot. Waits on the image
    /// available semaphore at color attachment output, then signals render
    /// finished and the slot's fence.
    pub unsafe fn submit(&mut self, command_buffer: &mut CommandBuffer) -> Result<()> {
        let frame = &self.frames[self.scheduler.slot()];
        let handle = command_buffer.executable()?;

        self.device.reset_fences(&[frame.in_flight])?;

        let wait_semaphores = &[frame.image_available];
        let wait_stages = &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = &[handle];
        let signal_semaphores = &[frame.render_finished];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(wait_stages)
            .command_buffers(command_buffers)
            .signal_semaphores(signal_semaphores);

        self.device
            .queue_submit(self.device.graphics_queue(), &[submit_info], frame.in_flight)
            .map_err(submit_error)?;

        command_buffer.mark_submitted()?;
        Ok(())
    }

    /// Presents the current image once rendering has finished. Staleness is
    /// recorded for [`Self::is_invalid`] rather than returned as an error.
    pub unsafe fn present(&mut self) -> Result<SurfaceStatus> {
        let frame = &self.frames[self.scheduler.slot()];

        let swapchains = &[self.handle];
        let image_indices = &[self.current_image as u32];
        let wait_semaphores = &[frame.render_finished];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(swapchains)
            .image_indices(image_indices);

        let result = self
            .device
            .queue_present_khr(self.device.present_queue(), &present_info);
        let status = present_outcome(result)?;
        if status != SurfaceStatus::Optimal {
            log::info!("Swapchain {:?} on present", status);
        }

        self.status = self.status.max(status);
        Ok(status)
    }

    pub fn advance_frame(&mut self) {
        self.scheduler.advance();
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        log::debug!(
            "Destroying swapchain after {} frames",
            self.scheduler.frame_count()
        );
        self.images.clear();
        self.frames.clear();
        unsafe { self.device.destroy_swapchain_khr(self.handle, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(current: (u32, u32), min: (u32, u32), max: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: current.0, height: current.1 },
            min_image_extent: vk::Extent2D { width: min.0, height: min.1 },
            max_image_extent: vk::Extent2D { width: max.0, height: max.1 },
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        }
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn prefers_srgb_bgra() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(choose_surface_format(&formats).format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn falls_back_to_first_format() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(choose_surface_format(&formats).format, vk::Format::R8G8B8A8_UNORM);
    }

    #[cfg(not(feature = "vsync"))]
    #[test]
    fn prefers_mailbox() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(choose_present_mode(&modes), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn fifo_without_mailbox() {
        let modes = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO];
        assert_eq!(choose_present_mode(&modes), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn current_extent_wins_unless_sentinel() {
        let fixed = capabilities((1024, 768), (1, 1), (4096, 4096));
        assert_eq!(choose_extent(&fixed, extent(800, 600)), extent(1024, 768));

        let open = capabilities((u32::MAX, u32::MAX), (200, 100), (1920, 1080));
        assert_eq!(choose_extent(&open, extent(800, 600)), extent(800, 600));
        assert_eq!(choose_extent(&open, extent(4000, 50)), extent(1920, 100));
    }

    #[test]
    fn image_count_respects_maximum() {
        let mut caps = capabilities((800, 600), (1, 1), (800, 600));
        assert_eq!(choose_image_count(&caps), 3);
        caps.max_image_count = 2;
        assert_eq!(choose_image_count(&caps), 2);
    }

    #[test]
    fn acquire_classification() {
        assert_eq!(
            acquire_outcome(Ok((1, vk::SuccessCode::SUCCESS))).unwrap(),
            (Some(1), SurfaceStatus::Optimal)
        );
        assert_eq!(
            acquire_outcome(Ok((2, vk::SuccessCode::SUBOPTIMAL_KHR))).unwrap(),
            (Some(2), SurfaceStatus::Suboptimal)
        );
        assert_eq!(
            acquire_outcome(Err(vk::ErrorCode::OUT_OF_DATE_KHR)).unwrap(),
            (None, SurfaceStatus::OutOfDate)
        );
        assert!(matches!(
            acquire_outcome(Err(vk::ErrorCode::SURFACE_LOST_KHR)),
            Err(RenderError::Acquire(vk::ErrorCode::SURFACE_LOST_KHR))
        ));
    }

    #[test]
    fn present_classification() {
        assert_eq!(
            present_outcome(Ok(vk::SuccessCode::SUCCESS)).unwrap(),
            SurfaceStatus::Optimal
        );
        assert_eq!(
            present_outcome(Ok(vk::SuccessCode::SUBOPTIMAL_KHR)).unwrap(),
            SurfaceStatus::Suboptimal
        );
        assert_eq!(
            present_outcome(Err(vk::ErrorCode::OUT_OF_DATE_KHR)).unwrap(),
            SurfaceStatus::OutOfDate
        );
        assert!(present_outcome(Err(vk::ErrorCode::DEVICE_LOST)).is_err());
    }

    #[test]
    fn status_ordering_keeps_worst() {
        assert!(SurfaceStatus::OutOfDate > SurfaceStatus::Suboptimal);
        assert_eq!(
            SurfaceStatus::Suboptimal.max(SurfaceStatus::Optimal),
            SurfaceStatus::Suboptimal
        );
    }
}
