//! GPU memory management.

use crate::device::Device;
use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::Arc;

/// Allocator shared between the context and the buffers it hands out.
pub type SharedAllocator = Arc<Mutex<GpuAllocator>>;

/// GPU memory allocator wrapper.
///
/// Holds the device alive; every outstanding [`GpuBuffer`] holds the
/// allocator alive, so memory is always returned before the device goes.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<Device>,
}

impl GpuAllocator {
    /// Create an allocator for `device`.
    pub fn new(device: Arc<Device>) -> Result<Self> {
        let buffer_device_address =
            device.features().vulkan12.buffer_device_address == vk::TRUE;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: device.instance().handle().clone(),
            device: device.handle().clone(),
            physical_device: device.physical_device(),
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::Allocation(e.to_string()))?;

        tracing::debug!("GPU allocator created (buffer device address: {buffer_device_address})");

        Ok(Self {
            allocator: Some(allocator),
            device,
        })
    }

    /// Wrap into the shared form buffers expect.
    pub fn into_shared(self) -> SharedAllocator {
        Arc::new(Mutex::new(self))
    }

    fn inner(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator already shut down".to_string()))
    }

    /// Shut the allocator down, freeing all GPU memory.
    ///
    /// Remaining allocations are reported as leaks.
    pub fn shutdown(&mut self) {
        if self.allocator.take().is_some() {
            tracing::debug!("GPU allocator shut down");
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A buffer bound to allocator-managed memory. Freed on drop.
pub struct GpuBuffer {
    allocator: SharedAllocator,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
}

impl GpuBuffer {
    /// Create a buffer of `size` bytes and bind fresh memory to it.
    pub fn new(
        allocator: &SharedAllocator,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Self> {
        let mut guard = allocator.lock();
        let device = Arc::clone(&guard.device);
        let raw = device.handle();

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: the device is valid while the allocator holds it.
        let buffer = unsafe { raw.create_buffer(&buffer_info, None) }?;
        let requirements = unsafe { raw.get_buffer_memory_requirements(buffer) };

        let allocated = guard.inner().and_then(|inner| {
            inner
                .allocate(&AllocationCreateDesc {
                    name,
                    requirements,
                    location,
                    linear: true,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| GpuError::Allocation(format!("{name}: {e}")))
        });
        let allocation = match allocated {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { raw.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        // SAFETY: the allocation satisfies the buffer's requirements.
        if let Err(result) =
            unsafe { raw.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) }
        {
            unsafe { raw.destroy_buffer(buffer, None) };
            if let Ok(inner) = guard.inner() {
                if let Err(e) = inner.free(allocation) {
                    tracing::warn!("Failed to free allocation for '{name}': {e}");
                }
            }
            return Err(result.into());
        }
        drop(guard);

        device.set_object_name(buffer, &std::ffi::CString::new(name).unwrap_or_default());
        tracing::debug!("Allocated buffer '{name}' ({size} bytes, {location:?})");

        Ok(Self {
            allocator: Arc::clone(allocator),
            buffer,
            allocation: Some(allocation),
            size,
        })
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        let mut guard = self.allocator.lock();
        if let Some(allocation) = self.allocation.take() {
            match guard.inner() {
                Ok(inner) => {
                    if let Err(e) = inner.free(allocation) {
                        tracing::warn!("Failed to free buffer allocation: {e}");
                    }
                }
                Err(e) => tracing::warn!("{e}"),
            }
        }
        // SAFETY: teardown waits for device idle before dropping buffers.
        unsafe { guard.device.handle().destroy_buffer(self.buffer, None) };
    }
}
