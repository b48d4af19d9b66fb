// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync
// One set per frame in flight; the presentation layer itself never waits on
// them, the frame loop does.

use anyhow::{Context, Result};
use ash::vk;
use super::VulkanDevice;

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let device = &device.device;
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder()
            .flags(vk::FenceCreateFlags::SIGNALED); // Start signaled

        unsafe {
            let image_available = device.create_semaphore(&semaphore_info, None)?;
            let render_finished = match device.create_semaphore(&semaphore_info, None) {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    device.destroy_semaphore(image_available, None);
                    return Err(e.into());
                }
            };
            let in_flight_fence = match device.create_fence(&fence_info, None) {
                Ok(fence) => fence,
                Err(e) => {
                    device.destroy_semaphore(render_finished, None);
                    device.destroy_semaphore(image_available, None);
                    return Err(e.into());
                }
            };

            Ok(Self { image_available, render_finished, in_flight_fence })
        }
    }

    /// `count` independent sets, at least one. Nothing is left behind on failure.
    pub fn create_frames(device: &VulkanDevice, count: usize) -> Result<Vec<Self>> {
        create_all(
            count.max(1),
            |_| Self::new(device),
            |sync| sync.destroy(&device.device),
        )
        .context("Failed to create frame sync objects")
    }

    /// Block until the GPU finished the last submission that used this set.
    pub fn wait(&self, device: &VulkanDevice) -> Result<()> {
        unsafe { device.device.wait_for_fences(&[self.in_flight_fence], true, u64::MAX) }
            .context("Failed to wait for in-flight fence")
    }

    /// Only reset once work is about to be submitted, or the next `wait` hangs.
    pub fn reset(&self, device: &VulkanDevice) -> Result<()> {
        unsafe { device.device.reset_fences(&[self.in_flight_fence]) }
            .context("Failed to reset in-flight fence")
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Create `count` objects in order. If one fails, the ones already created are
/// handed to `destroy` before the error is returned.
fn create_all<T>(
    count: usize,
    mut create: impl FnMut(usize) -> Result<T>,
    mut destroy: impl FnMut(T),
) -> Result<Vec<T>> {
    let mut created = Vec::with_capacity(count);
    for i in 0..count {
        match create(i) {
            Ok(item) => created.push(item),
            Err(e) => {
                for item in created.drain(..).rev() {
                    destroy(item);
                }
                return Err(e.context(format!("object {} of {}", i, count)));
            }
        }
    }
    Ok(created)
}
