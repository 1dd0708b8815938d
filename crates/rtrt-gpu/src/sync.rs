//! Synchronization primitives.

use crate::device::Device;
use crate::error::{GpuError, Result};
use ash::vk;
use std::sync::Arc;

/// The single in-flight frame's synchronization objects.
///
/// One set per device, not per swapchain image: the host records into the
/// one command buffer only after `wait_fence` confirms the prior submission
/// retired.
pub struct SyncPrimitives {
    device: Arc<Device>,
    /// Signaled when GPU work for the frame completes. Created signaled.
    pub wait_fence: vk::Fence,
    /// Signaled when a swapchain image has been acquired.
    pub read_semaphore: vk::Semaphore,
    /// Signaled when rendering is complete and the image may be presented.
    pub written_semaphore: vk::Semaphore,
}

impl SyncPrimitives {
    /// Create the fence (pre-signaled) and both semaphores.
    pub fn new(device: Arc<Device>) -> Result<Self> {
        let raw = device.handle();
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        let semaphore_info = vk::SemaphoreCreateInfo::default();

        // SAFETY: the device is valid while the Arc is held. Objects created
        // before a failure are released before returning.
        unsafe {
            let wait_fence = raw.create_fence(&fence_info, None).map_err(creation_error("fence"))?;
            let read_semaphore = match raw.create_semaphore(&semaphore_info, None) {
                Ok(s) => s,
                Err(e) => {
                    raw.destroy_fence(wait_fence, None);
                    return Err(creation_error("read semaphore")(e));
                }
            };
            let written_semaphore = match raw.create_semaphore(&semaphore_info, None) {
                Ok(s) => s,
                Err(e) => {
                    raw.destroy_semaphore(read_semaphore, None);
                    raw.destroy_fence(wait_fence, None);
                    return Err(creation_error("written semaphore")(e));
                }
            };

            device.set_object_name(wait_fence, c"wait_fence");
            device.set_object_name(read_semaphore, c"read_semaphore");
            device.set_object_name(written_semaphore, c"written_semaphore");

            Ok(Self {
                device,
                wait_fence,
                read_semaphore,
                written_semaphore,
            })
        }
    }

    /// Block until the frame fence is signaled. No timeout.
    pub fn wait(&self) -> Result<()> {
        // SAFETY: the fence belongs to this device.
        unsafe {
            self.device
                .handle()
                .wait_for_fences(&[self.wait_fence], true, u64::MAX)?;
        }
        Ok(())
    }

    /// Return the frame fence to the unsignaled state.
    pub fn reset(&self) -> Result<()> {
        // SAFETY: the fence belongs to this device and is not pending.
        unsafe { self.device.handle().reset_fences(&[self.wait_fence])? };
        Ok(())
    }
}

fn creation_error(step: &'static str) -> impl Fn(vk::Result) -> GpuError {
    move |result| GpuError::SwapchainCreation { step, result }
}

impl Drop for SyncPrimitives {
    fn drop(&mut self) {
        tracing::debug!("Destroying frame sync primitives");
        // SAFETY: teardown waits for the fence and device idle first.
        unsafe {
            let raw = self.device.handle();
            raw.destroy_semaphore(self.read_semaphore, None);
            raw.destroy_semaphore(self.written_semaphore, None);
            raw.destroy_fence(self.wait_fence, None);
        }
    }
}
