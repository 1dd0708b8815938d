//! Chained device feature negotiation.
//!
//! [`DeviceFeatureChain`] owns one struct per feature tier and links them
//! into a single `VkPhysicalDeviceFeatures2` chain on demand. The same chain
//! is first filled by the driver and then handed to device creation, which
//! enables every feature the device reported as supported.

use ash::vk;
use std::ffi::CStr;

/// One link of the feature chain, in chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureTier {
    Core,
    Vulkan11,
    Vulkan12,
    Vulkan13,
    AccelerationStructure,
    RayTracingPipeline,
}

/// Owned feature structures for every requested tier.
pub struct DeviceFeatureChain {
    pub core: vk::PhysicalDeviceFeatures,
    pub vulkan11: vk::PhysicalDeviceVulkan11Features<'static>,
    pub vulkan12: vk::PhysicalDeviceVulkan12Features<'static>,
    pub vulkan13: vk::PhysicalDeviceVulkan13Features<'static>,
    pub acceleration_structure: vk::PhysicalDeviceAccelerationStructureFeaturesKHR<'static>,
    pub ray_tracing_pipeline: vk::PhysicalDeviceRayTracingPipelineFeaturesKHR<'static>,
    tiers: Vec<FeatureTier>,
}

impl Default for DeviceFeatureChain {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceFeatureChain {
    /// Core and versioned tiers only.
    pub fn new() -> Self {
        Self {
            core: vk::PhysicalDeviceFeatures::default(),
            vulkan11: vk::PhysicalDeviceVulkan11Features::default(),
            vulkan12: vk::PhysicalDeviceVulkan12Features::default(),
            vulkan13: vk::PhysicalDeviceVulkan13Features::default(),
            acceleration_structure: vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default(),
            ray_tracing_pipeline: vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default(),
            tiers: vec![
                FeatureTier::Core,
                FeatureTier::Vulkan11,
                FeatureTier::Vulkan12,
                FeatureTier::Vulkan13,
            ],
        }
    }

    /// Chain sized for a device extension list: ray tracing tiers are only
    /// linked when their extension will be enabled.
    pub fn for_extensions(extensions: &[&CStr]) -> Self {
        let mut chain = Self::new();
        if extensions.contains(&ash::khr::acceleration_structure::NAME) {
            chain = chain.with_acceleration_structure();
        }
        if extensions.contains(&ash::khr::ray_tracing_pipeline::NAME) {
            chain = chain.with_ray_tracing_pipeline();
        }
        chain
    }

    /// Link the acceleration structure tier.
    pub fn with_acceleration_structure(mut self) -> Self {
        self.add(FeatureTier::AccelerationStructure);
        self
    }

    /// Link the ray tracing pipeline tier.
    pub fn with_ray_tracing_pipeline(mut self) -> Self {
        self.add(FeatureTier::RayTracingPipeline);
        self
    }

    fn add(&mut self, tier: FeatureTier) {
        if !self.tiers.contains(&tier) {
            self.tiers.push(tier);
            // Keep chain order independent of call order.
            self.tiers.sort_by_key(|t| *t as u8);
        }
    }

    /// Tiers in chain order.
    pub fn tiers(&self) -> &[FeatureTier] {
        &self.tiers
    }

    /// Whether a tier is linked.
    pub fn has(&self, tier: FeatureTier) -> bool {
        self.tiers.contains(&tier)
    }

    /// Link the chain, hand its head to `f`, then unlink it.
    ///
    /// Values the driver writes into any tier during `f` are kept.
    pub fn with_chain<R>(
        &mut self,
        f: impl FnOnce(&mut vk::PhysicalDeviceFeatures2<'_>) -> R,
    ) -> R {
        let Self {
            core,
            vulkan11,
            vulkan12,
            vulkan13,
            acceleration_structure,
            ray_tracing_pipeline,
            tiers,
        } = self;

        // push_next prepends, so link from the tail of the chain backwards.
        let mut head = vk::PhysicalDeviceFeatures2::default().features(*core);
        if tiers.contains(&FeatureTier::RayTracingPipeline) {
            head = head.push_next(&mut *ray_tracing_pipeline);
        }
        if tiers.contains(&FeatureTier::AccelerationStructure) {
            head = head.push_next(&mut *acceleration_structure);
        }
        head = head
            .push_next(&mut *vulkan13)
            .push_next(&mut *vulkan12)
            .push_next(&mut *vulkan11);

        let result = f(&mut head);
        *core = head.features;

        vulkan11.p_next = std::ptr::null_mut();
        vulkan12.p_next = std::ptr::null_mut();
        vulkan13.p_next = std::ptr::null_mut();
        acceleration_structure.p_next = std::ptr::null_mut();
        ray_tracing_pipeline.p_next = std::ptr::null_mut();

        result
    }

    /// Ask the driver to fill every linked tier.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(&mut self, instance: &ash::Instance, physical_device: vk::PhysicalDevice) {
        self.with_chain(|head| {
            // SAFETY: caller guarantees the handles; the chain is well formed.
            unsafe { instance.get_physical_device_features2(physical_device, head) };
        });
    }

    /// One-line description of the headline features for logging.
    pub fn summary(&self) -> String {
        let flag = |v: vk::Bool32| if v == vk::TRUE { "yes" } else { "no" };
        let mut out = format!(
            "bufferDeviceAddress={} descriptorIndexing={} synchronization2={} dynamicRendering={}",
            flag(self.vulkan12.buffer_device_address),
            flag(self.vulkan12.descriptor_indexing),
            flag(self.vulkan13.synchronization2),
            flag(self.vulkan13.dynamic_rendering),
        );
        if self.has(FeatureTier::AccelerationStructure) {
            out.push_str(&format!(
                " accelerationStructure={}",
                flag(self.acceleration_structure.acceleration_structure)
            ));
        }
        if self.has(FeatureTier::RayTracingPipeline) {
            out.push_str(&format!(
                " rayTracingPipeline={}",
                flag(self.ray_tracing_pipeline.ray_tracing_pipeline)
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_types(chain: &mut DeviceFeatureChain) -> Vec<vk::StructureType> {
        chain.with_chain(|head| {
            let mut types = vec![head.s_type];
            let mut next = head.p_next.cast::<vk::BaseOutStructure<'_>>();
            while !next.is_null() {
                unsafe {
                    types.push((*next).s_type);
                    next = (*next).p_next;
                }
            }
            types
        })
    }

    #[test]
    fn base_chain_order() {
        let mut chain = DeviceFeatureChain::new();
        assert_eq!(
            chain_types(&mut chain),
            vec![
                vk::StructureType::PHYSICAL_DEVICE_FEATURES_2,
                vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_1_FEATURES,
                vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_2_FEATURES,
                vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_3_FEATURES,
            ]
        );
    }

    #[test]
    fn ray_tracing_tiers_follow_versioned_tiers() {
        let mut chain = DeviceFeatureChain::new()
            .with_ray_tracing_pipeline()
            .with_acceleration_structure();
        assert_eq!(
            chain.tiers(),
            &[
                FeatureTier::Core,
                FeatureTier::Vulkan11,
                FeatureTier::Vulkan12,
                FeatureTier::Vulkan13,
                FeatureTier::AccelerationStructure,
                FeatureTier::RayTracingPipeline,
            ]
        );
        let types = chain_types(&mut chain);
        assert_eq!(
            &types[4..],
            &[
                vk::StructureType::PHYSICAL_DEVICE_ACCELERATION_STRUCTURE_FEATURES_KHR,
                vk::StructureType::PHYSICAL_DEVICE_RAY_TRACING_PIPELINE_FEATURES_KHR,
            ]
        );
    }

    #[test]
    fn chain_follows_extension_list() {
        let chain = DeviceFeatureChain::for_extensions(&[ash::khr::swapchain::NAME]);
        assert!(!chain.has(FeatureTier::AccelerationStructure));
        assert!(!chain.has(FeatureTier::RayTracingPipeline));

        let chain = DeviceFeatureChain::for_extensions(&crate::config::default_device_extensions());
        assert!(chain.has(FeatureTier::AccelerationStructure));
        assert!(chain.has(FeatureTier::RayTracingPipeline));
    }

    #[test]
    fn chain_is_unlinked_and_reusable() {
        let mut chain = DeviceFeatureChain::new().with_acceleration_structure();
        let first = chain_types(&mut chain);
        assert!(chain.vulkan11.p_next.is_null());
        assert!(chain.acceleration_structure.p_next.is_null());
        assert_eq!(chain_types(&mut chain), first);
    }

    #[test]
    fn writes_through_the_chain_are_kept() {
        let mut chain = DeviceFeatureChain::new();
        chain.with_chain(|head| {
            head.features.shader_int64 = vk::TRUE;
            let v11 = head.p_next.cast::<vk::PhysicalDeviceVulkan11Features<'_>>();
            unsafe { (*v11).multiview = vk::TRUE };
        });
        assert_eq!(chain.core.shader_int64, vk::TRUE);
        assert_eq!(chain.vulkan11.multiview, vk::TRUE);
    }
}
