//! Descriptor pool reserved for the optional UI overlay.
//!
//! The overlay library allocates and frees its own sets from this pool; the
//! context only owns the pool so it can be released first at teardown.

use crate::device::Device;
use crate::error::{GpuError, Result};
use ash::vk;
use std::sync::Arc;

/// Descriptors reserved per type.
pub const DESCRIPTORS_PER_TYPE: u32 = 1000;

const OVERLAY_DESCRIPTOR_TYPES: [vk::DescriptorType; 11] = [
    vk::DescriptorType::SAMPLER,
    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    vk::DescriptorType::SAMPLED_IMAGE,
    vk::DescriptorType::STORAGE_IMAGE,
    vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
    vk::DescriptorType::STORAGE_TEXEL_BUFFER,
    vk::DescriptorType::UNIFORM_BUFFER,
    vk::DescriptorType::STORAGE_BUFFER,
    vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
    vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
    vk::DescriptorType::INPUT_ATTACHMENT,
];

/// One pool size entry per common descriptor type.
pub fn overlay_pool_sizes() -> Vec<vk::DescriptorPoolSize> {
    OVERLAY_DESCRIPTOR_TYPES
        .iter()
        .map(|&ty| vk::DescriptorPoolSize {
            ty,
            descriptor_count: DESCRIPTORS_PER_TYPE,
        })
        .collect()
}

pub struct OverlayResources {
    device: Arc<Device>,
    descriptor_pool: vk::DescriptorPool,
}

impl OverlayResources {
    pub fn new(device: Arc<Device>) -> Result<Self> {
        let sizes = overlay_pool_sizes();
        let max_sets = DESCRIPTORS_PER_TYPE * sizes.len() as u32;
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(max_sets)
            .pool_sizes(&sizes);

        // SAFETY: the device is valid while the Arc is held.
        let descriptor_pool = unsafe { device.handle().create_descriptor_pool(&create_info, None) }
            .map_err(|e| GpuError::PipelineCreation(format!("overlay descriptor pool: {e}")))?;
        device.set_object_name(descriptor_pool, c"overlay_descriptor_pool");
        tracing::debug!("Overlay descriptor pool created ({max_sets} sets)");

        Ok(Self {
            device,
            descriptor_pool,
        })
    }

    pub fn descriptor_pool(&self) -> vk::DescriptorPool {
        self.descriptor_pool
    }
}

impl Drop for OverlayResources {
    fn drop(&mut self) {
        tracing::debug!("Destroying overlay descriptor pool");
        // SAFETY: teardown waits for device idle first.
        unsafe {
            self.device
                .handle()
                .destroy_descriptor_pool(self.descriptor_pool, None)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn one_entry_per_distinct_type() {
        let sizes = overlay_pool_sizes();
        let distinct: HashSet<_> = sizes.iter().map(|s| s.ty).collect();
        assert_eq!(distinct.len(), sizes.len());
        assert!(sizes.iter().all(|s| s.descriptor_count == DESCRIPTORS_PER_TYPE));
        assert!(distinct.contains(&vk::DescriptorType::COMBINED_IMAGE_SAMPLER));
    }
}
