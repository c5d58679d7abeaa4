//! Per-frame synchronization primitives and frame slot bookkeeping.

use std::sync::Arc;

use anyhow::Result;
use vulkanalia::prelude::v1_0::*;

use crate::device::VulkanDevice;
use crate::error::VkResultExt;

/// Semaphores and fence owned by one frame slot.
pub struct FrameSync {
    device: Arc<VulkanDevice>,
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    /// Created signaled so the first wait on a fresh slot returns at once.
    pub in_flight: vk::Fence,
}

impl FrameSync {
    pub unsafe fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        let image_available = device
            .create_semaphore(&semaphore_info, None)
            .or_fail("image available semaphore")?;
        let render_finished = device
            .create_semaphore(&semaphore_info, None)
            .or_fail("render finished semaphore")?;
        let in_flight = device
            .create_fence(&fence_info, None)
            .or_fail("in flight fence")?;

        Ok(Self {
            device,
            image_available,
            render_finished,
            in_flight,
        })
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.image_available, None);
            self.device.destroy_semaphore(self.render_finished, None);
            self.device.destroy_fence(self.in_flight, None);
        }
    }
}

/// Counts frames and maps each one to a slot. The slot depends only on the
/// frame count, never on the image the presentation engine hands back.
#[derive(Clone, Debug)]
pub struct FrameScheduler {
    frame_count: u64,
    frames_in_flight: usize,
}

impl FrameScheduler {
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            frame_count: 0,
            frames_in_flight: frames_in_flight.max(1),
        }
    }

    pub fn slot(&self) -> usize {
        (self.frame_count % self.frames_in_flight as u64) as usize
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn advance(&mut self) {
        self.frame_count += 1;
    }
}

/// Remembers which slot last submitted work against each swapchain image.
#[derive(Clone, Debug)]
pub struct ImagesInFlight {
    owners: Vec<Option<usize>>,
}

impl ImagesInFlight {
    pub fn new(image_count: usize) -> Self {
        Self {
            owners: vec![None; image_count],
        }
    }

    /// Assigns `image` to `slot`. Returns the previous owner when it is a
    /// different slot, whose fence must be waited before the image's
    /// resources are reused.
    pub fn claim(&mut self, image: usize, slot: usize) -> Option<usize> {
        let previous = self.owners[image].replace(slot);
        previous.filter(|p| *p != slot)
    }

    pub fn owner(&self, image: usize) -> Option<usize> {
        self.owners[image]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_cycles_with_frame_count() {
        let mut scheduler = FrameScheduler::new(2);
        let slots: Vec<usize> = (0..6)
            .map(|_| {
                let slot = scheduler.slot();
                scheduler.advance();
                slot
            })
            .collect();
        assert_eq!(slots, vec![0, 1, 0, 1, 0, 1]);
        assert_eq!(scheduler.frame_count(), 6);
    }

    #[test]
    fn slot_ignores_acquired_image_order() {
        // Presentation engines may return images out of order.
        let acquired = [2usize, 0, 0, 1, 2, 2, 1];
        let mut scheduler = FrameScheduler::new(2);
        let mut images = ImagesInFlight::new(3);

        for (frame, image) in acquired.iter().enumerate() {
            assert_eq!(scheduler.slot(), frame % 2);
            images.claim(*image, scheduler.slot());
            scheduler.advance();
        }
    }

    #[test]
    fn claim_reports_foreign_owner_only() {
        let mut images = ImagesInFlight::new(3);
        assert_eq!(images.claim(0, 0), None);
        assert_eq!(images.claim(1, 1), None);
        // Same slot comes back to the same image: its own fence was waited.
        assert_eq!(images.claim(0, 0), None);
        // Slot 1 picks up image 0 while slot 0 may still be using it.
        assert_eq!(images.claim(0, 1), Some(0));
        assert_eq!(images.owner(0), Some(1));
        assert_eq!(images.owner(2), None);
    }

    #[test]
    fn three_images_two_slots() {
        let mut scheduler = FrameScheduler::new(2);
        let mut images = ImagesInFlight::new(3);
        let mut waits = Vec::new();
        for image in [0usize, 1, 2, 0, 1, 2] {
            if let Some(previous) = images.claim(image, scheduler.slot()) {
                waits.push((image, previous));
            }
            scheduler.advance();
        }
        // Frame 3 reuses image 0 (owned by slot 0) from slot 1, and so on.
        assert_eq!(waits, vec![(0, 0), (1, 1), (2, 0)]);
    }
}
