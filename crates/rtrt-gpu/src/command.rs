//! Command buffer management.

use crate::device::Device;
use crate::error::{GpuError, Result};
use ash::prelude::VkResult;
use ash::vk;
use std::sync::Arc;

/// Command pool owning the single reusable primary command buffer.
///
/// Created with `RESET_COMMAND_BUFFER` so the buffer can be re-recorded each
/// frame without reallocation. The buffer is freed with the pool.
pub struct CommandPool {
    device: Arc<Device>,
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
}

impl CommandPool {
    /// Create the pool on the device's queue family and allocate its buffer.
    pub fn new(device: Arc<Device>) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(device.queue_family())
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        // SAFETY: the device is valid while the Arc is held.
        let pool = unsafe { device.handle().create_command_pool(&create_info, None) }.map_err(
            |result| GpuError::CommandPoolCreation {
                step: "command pool",
                result,
            },
        )?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        // SAFETY: pool was just created from this device.
        let allocated = unsafe { device.handle().allocate_command_buffers(&alloc_info) };
        let command_buffer = match allocated {
            Ok(buffers) => buffers[0],
            Err(result) => {
                unsafe { device.handle().destroy_command_pool(pool, None) };
                return Err(GpuError::CommandPoolCreation {
                    step: "command buffer",
                    result,
                });
            }
        };

        tracing::debug!("Command pool created on queue family {}", device.queue_family());

        Ok(Self {
            device,
            pool,
            command_buffer,
        })
    }

    /// The raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// The reusable primary command buffer.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// Allocate a temporary primary buffer, record into it, submit it to the
    /// device queue, wait for the queue to drain and free the buffer.
    ///
    /// Returns the raw driver result so the caller can name the step it
    /// was submitting for.
    pub fn submit_one_shot<F>(&self, record: F) -> VkResult<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let device = self.device.handle();
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        // SAFETY: the pool belongs to this device and is externally
        // synchronized by &self on the single setup thread.
        unsafe {
            let cmd = device.allocate_command_buffers(&alloc_info)?[0];
            let result = record_and_submit(device, self.device.queue(), cmd, record);
            device.free_command_buffers(self.pool, &[cmd]);
            result
        }
    }
}

unsafe fn record_and_submit<F>(
    device: &ash::Device,
    queue: vk::Queue,
    cmd: vk::CommandBuffer,
    record: F,
) -> VkResult<()>
where
    F: FnOnce(&ash::Device, vk::CommandBuffer),
{
    let begin_info =
        vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    // SAFETY: caller passes a freshly allocated buffer from this device.
    unsafe {
        device.begin_command_buffer(cmd, &begin_info)?;
        record(device, cmd);
        device.end_command_buffer(cmd)?;

        let cmd_buffers = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&cmd_buffers);
        device.queue_submit(queue, &[submit_info], vk::Fence::null())?;
        device.queue_wait_idle(queue)?;
    }
    Ok(())
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        tracing::debug!("Destroying command pool");
        // SAFETY: teardown waits for device idle before dropping the pool.
        unsafe { self.device.handle().destroy_command_pool(self.pool, None) };
    }
}
