//! Physical device selection, queue selection and logical device creation.
//!
//! Selection is split into pure policy over plain descriptors
//! ([`check_compatibility`], [`select_device`], [`select_queue_family`]) and
//! thin driver-facing wrappers that produce those descriptors and log every
//! decision.

use crate::enumerate::{device_extensions, enumerate_two_call, extension_name, names_to_strings};
use crate::error::{GpuError, Result};
use crate::features::{DeviceFeatureChain, FeatureTier};
use crate::instance::Instance;
use ash::vk;
use std::collections::HashSet;
use std::ffi::{c_char, CStr};
use std::sync::Arc;

/// Snapshot of one candidate GPU as reported by the driver.
#[derive(Debug, Clone)]
pub struct PhysicalDeviceDescriptor {
    /// Raw handle. Owned by the instance.
    pub handle: vk::PhysicalDevice,
    /// Position in driver enumeration order.
    pub index: usize,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub extensions: HashSet<String>,
}

impl PhysicalDeviceDescriptor {
    /// Human-readable API version.
    pub fn api_version_string(&self) -> String {
        format!(
            "{}.{}.{}",
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version)
        )
    }
}

/// Why a device was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    WrongType {
        found: vk::PhysicalDeviceType,
        required: vk::PhysicalDeviceType,
    },
    MissingExtension(String),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WrongType { found, required } => {
                write!(f, "device type {found:?}, need {required:?}")
            }
            Self::MissingExtension(name) => write!(f, "missing extension {name}"),
        }
    }
}

/// Outcome of the compatibility predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compatibility {
    Compatible,
    Rejected(Vec<RejectReason>),
}

impl Compatibility {
    pub fn is_compatible(&self) -> bool {
        matches!(self, Self::Compatible)
    }
}

/// A device is compatible iff its type matches and every required
/// extension is in its extension set.
pub fn check_compatibility(
    device: &PhysicalDeviceDescriptor,
    required_type: vk::PhysicalDeviceType,
    required_extensions: &[String],
) -> Compatibility {
    let mut reasons = Vec::new();
    if device.device_type != required_type {
        reasons.push(RejectReason::WrongType {
            found: device.device_type,
            required: required_type,
        });
    }
    reasons.extend(
        required_extensions
            .iter()
            .filter(|ext| !device.extensions.contains(ext.as_str()))
            .map(|ext| RejectReason::MissingExtension(ext.clone())),
    );

    if reasons.is_empty() {
        Compatibility::Compatible
    } else {
        Compatibility::Rejected(reasons)
    }
}

/// Pick the first compatible device in enumeration order.
///
/// Every candidate and every rejection reason is logged.
pub fn select_device<'a>(
    devices: &'a [PhysicalDeviceDescriptor],
    required_type: vk::PhysicalDeviceType,
    required_extensions: &[String],
) -> Result<&'a PhysicalDeviceDescriptor> {
    tracing::info!("{} physical device(s)", devices.len());

    let mut compatible = Vec::new();
    for device in devices {
        tracing::info!(
            "Device {}: {} - type {:?} - Vulkan {} - {} extension(s)",
            device.index,
            device.name,
            device.device_type,
            device.api_version_string(),
            device.extensions.len()
        );
        match check_compatibility(device, required_type, required_extensions) {
            Compatibility::Compatible => {
                tracing::info!("Device {} is compatible", device.index);
                compatible.push(device);
            }
            Compatibility::Rejected(reasons) => {
                for reason in reasons {
                    tracing::warn!("Device {} rejected: {reason}", device.index);
                }
            }
        }
    }

    if compatible.len() > 1 {
        let indices: Vec<usize> = compatible.iter().map(|d| d.index).collect();
        tracing::info!("Compatible devices: {indices:?}, using the first");
    }

    let selected = compatible.first().copied().ok_or(GpuError::NoCompatibleDevice {
        examined: devices.len(),
    })?;
    tracing::info!("Selected GPU {}: {}", selected.index, selected.name);
    Ok(selected)
}

/// Describe every physical device the instance can see.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn enumerate_physical_devices(
    instance: &ash::Instance,
) -> Result<Vec<PhysicalDeviceDescriptor>> {
    let fp = instance.fp_v1_0().enumerate_physical_devices;
    let raw = instance.handle();
    // SAFETY: caller guarantees the instance is valid.
    let handles = unsafe {
        enumerate_two_call("physical devices", |count, data| fp(raw, count, data))
    }?;

    handles
        .into_iter()
        .enumerate()
        .map(|(index, handle)| {
            // SAFETY: handle came from this instance.
            let properties = unsafe { instance.get_physical_device_properties(handle) };
            let extensions = unsafe { device_extensions(instance, handle) }?
                .iter()
                .map(extension_name)
                .collect();
            let name = properties
                .device_name_as_c_str()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            Ok(PhysicalDeviceDescriptor {
                handle,
                index,
                name,
                device_type: properties.device_type,
                api_version: properties.api_version,
                extensions,
            })
        })
        .collect()
}

/// One queue family of the selected device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyDescriptor {
    pub index: u32,
    pub flags: vk::QueueFlags,
}

/// Index of the first family whose flags include all of `required`.
pub fn select_queue_family(
    families: &[QueueFamilyDescriptor],
    required: vk::QueueFlags,
) -> Result<u32> {
    tracing::info!("{} queue famil(ies)", families.len());
    let yes_no = |flags: vk::QueueFlags, bit| if flags.contains(bit) { "yes" } else { "no" };

    for family in families {
        tracing::debug!(
            "Queue family {}: graphics={} compute={} transfer={}",
            family.index,
            yes_no(family.flags, vk::QueueFlags::GRAPHICS),
            yes_no(family.flags, vk::QueueFlags::COMPUTE),
            yes_no(family.flags, vk::QueueFlags::TRANSFER),
        );
        if family.flags.contains(required) {
            tracing::info!("Selected queue family {}", family.index);
            return Ok(family.index);
        }
    }

    Err(GpuError::NoSuitableQueue { required })
}

/// Queue families of a physical device, in driver order.
///
/// # Safety
/// The instance and physical device must be valid.
pub unsafe fn queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<Vec<QueueFamilyDescriptor>> {
    let fp = instance.fp_v1_0().get_physical_device_queue_family_properties;
    // SAFETY: caller guarantees the handles; this query cannot fail.
    let properties = unsafe {
        enumerate_two_call("queue families", |count, data| {
            fp(physical_device, count, data);
            vk::Result::SUCCESS
        })
    }?;

    Ok(properties
        .iter()
        .zip(0u32..)
        .map(|(props, index)| QueueFamilyDescriptor {
            index,
            flags: props.queue_flags,
        })
        .collect())
}

/// Owned logical device and its single command queue.
///
/// Every device-owned wrapper in this crate holds an `Arc<Device>`, so the
/// device outlives all of them; it in turn keeps the instance alive.
pub struct Device {
    instance: Arc<Instance>,
    physical_device: vk::PhysicalDevice,
    handle: ash::Device,
    queue: vk::Queue,
    queue_family: u32,
    swapchain_loader: ash::khr::swapchain::Device,
    acceleration_structure_loader: Option<ash::khr::acceleration_structure::Device>,
    ray_tracing_loader: Option<ash::khr::ray_tracing_pipeline::Device>,
    debug_utils: Option<ash::ext::debug_utils::Device>,
    features: DeviceFeatureChain,
}

impl Device {
    /// Create the logical device with one queue from `queue_family`.
    pub fn new(
        instance: Arc<Instance>,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
        extensions: &[&CStr],
    ) -> Result<Self> {
        let mut features = DeviceFeatureChain::for_extensions(extensions);
        // SAFETY: the physical device was enumerated from this instance.
        unsafe { features.query(instance.handle(), physical_device) };
        tracing::info!("Device features: {}", features.summary());

        let priorities = [1.0_f32];
        let queue_info = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities)];
        let extension_names: Vec<*const c_char> = extensions.iter().map(|e| e.as_ptr()).collect();
        tracing::debug!("Enabling device extensions: {:?}", names_to_strings(extensions));

        // vkCreateDevice hands back no handle on failure, so there is nothing
        // to release on the error path.
        let handle = features.with_chain(|head| {
            let create_info = vk::DeviceCreateInfo::default()
                .queue_create_infos(&queue_info)
                .enabled_extension_names(&extension_names)
                .push_next(head);
            // SAFETY: create_info and the feature chain outlive the call.
            unsafe {
                instance
                    .handle()
                    .create_device(physical_device, &create_info, None)
            }
        });
        let handle = handle.map_err(GpuError::DeviceCreation)?;

        // SAFETY: one queue was requested from this family.
        let queue = unsafe { handle.get_device_queue(queue_family, 0) };
        let swapchain_loader = ash::khr::swapchain::Device::new(instance.handle(), &handle);
        let acceleration_structure_loader = features
            .has(FeatureTier::AccelerationStructure)
            .then(|| ash::khr::acceleration_structure::Device::new(instance.handle(), &handle));
        let ray_tracing_loader = features
            .has(FeatureTier::RayTracingPipeline)
            .then(|| ash::khr::ray_tracing_pipeline::Device::new(instance.handle(), &handle));
        let debug_utils = instance
            .debug_utils_enabled()
            .then(|| ash::ext::debug_utils::Device::new(instance.handle(), &handle));

        tracing::info!("Logical device created on queue family {queue_family}");

        Ok(Self {
            instance,
            physical_device,
            handle,
            queue,
            queue_family,
            swapchain_loader,
            acceleration_structure_loader,
            ray_tracing_loader,
            debug_utils,
            features,
        })
    }

    /// The raw device.
    pub fn handle(&self) -> &ash::Device {
        &self.handle
    }

    /// The owning instance.
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// The single command queue.
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Family index used for every queue-scoped resource.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Swapchain extension loader.
    pub fn swapchain_loader(&self) -> &ash::khr::swapchain::Device {
        &self.swapchain_loader
    }

    /// Acceleration structure loader, when that extension is enabled.
    pub fn acceleration_structure_loader(
        &self,
    ) -> Option<&ash::khr::acceleration_structure::Device> {
        self.acceleration_structure_loader.as_ref()
    }

    /// Ray tracing pipeline loader, when that extension is enabled.
    pub fn ray_tracing_loader(&self) -> Option<&ash::khr::ray_tracing_pipeline::Device> {
        self.ray_tracing_loader.as_ref()
    }

    /// Features negotiated at creation.
    pub fn features(&self) -> &DeviceFeatureChain {
        &self.features
    }

    /// Block until the device has no work in flight.
    pub fn wait_idle(&self) -> Result<()> {
        // SAFETY: the device is valid for the lifetime of self.
        unsafe { self.handle.device_wait_idle() }?;
        Ok(())
    }

    /// Attach a debug name to an object. No-op without debug utils.
    pub fn set_object_name<H: vk::Handle>(&self, object: H, name: &CStr) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(object)
            .object_name(name);
        // SAFETY: the object was created from this device.
        if let Err(e) = unsafe { debug_utils.set_debug_utils_object_name(&info) } {
            tracing::debug!("Failed to name {}: {e}", name.to_string_lossy());
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::debug!("Destroying logical device");
        // SAFETY: dependents hold an Arc<Device>, so none remain.
        unsafe {
            if let Err(e) = self.handle.device_wait_idle() {
                tracing::warn!("Device wait idle failed before destruction: {e}");
            }
            self.handle.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(
        index: usize,
        device_type: vk::PhysicalDeviceType,
        exts: &[&str],
    ) -> PhysicalDeviceDescriptor {
        PhysicalDeviceDescriptor {
            handle: vk::PhysicalDevice::null(),
            index,
            name: format!("gpu{index}"),
            device_type,
            api_version: vk::API_VERSION_1_3,
            extensions: exts.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    fn required(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    const DISCRETE: vk::PhysicalDeviceType = vk::PhysicalDeviceType::DISCRETE_GPU;
    const INTEGRATED: vk::PhysicalDeviceType = vk::PhysicalDeviceType::INTEGRATED_GPU;

    #[test]
    fn compatible_iff_discrete_and_superset() {
        let req = required(&["VK_KHR_swapchain", "VK_KHR_ray_tracing_pipeline"]);

        let good = descriptor(
            0,
            DISCRETE,
            &["VK_KHR_ray_tracing_pipeline", "X", "VK_KHR_swapchain"],
        );
        assert!(check_compatibility(&good, DISCRETE, &req).is_compatible());

        let integrated = descriptor(
            1,
            INTEGRATED,
            &["VK_KHR_swapchain", "VK_KHR_ray_tracing_pipeline"],
        );
        assert_eq!(
            check_compatibility(&integrated, DISCRETE, &req),
            Compatibility::Rejected(vec![RejectReason::WrongType {
                found: INTEGRATED,
                required: DISCRETE
            }])
        );

        let missing = descriptor(2, DISCRETE, &["VK_KHR_swapchain"]);
        assert_eq!(
            check_compatibility(&missing, DISCRETE, &req),
            Compatibility::Rejected(vec![RejectReason::MissingExtension(
                "VK_KHR_ray_tracing_pipeline".to_string()
            )])
        );
    }

    #[test]
    fn compatibility_independent_of_list_order() {
        let exts = ["a", "b", "c", "d"];
        let reversed: Vec<&str> = exts.iter().rev().copied().collect();
        let req = required(&["d", "b"]);
        let req_rev = required(&["b", "d"]);

        let forward = descriptor(0, DISCRETE, &exts);
        let backward = descriptor(0, DISCRETE, &reversed);
        for dev in [&forward, &backward] {
            assert!(check_compatibility(dev, DISCRETE, &req).is_compatible());
            assert!(check_compatibility(dev, DISCRETE, &req_rev).is_compatible());
        }
    }

    #[test]
    fn empty_requirement_only_checks_type() {
        let dev = descriptor(0, DISCRETE, &[]);
        assert!(check_compatibility(&dev, DISCRETE, &[]).is_compatible());
    }

    #[test]
    fn first_compatible_device_wins() {
        let req = required(&["VK_KHR_swapchain"]);
        let devices = vec![
            descriptor(0, INTEGRATED, &["VK_KHR_swapchain"]),
            descriptor(1, DISCRETE, &["VK_KHR_swapchain"]),
            descriptor(2, DISCRETE, &["VK_KHR_swapchain"]),
        ];
        let selected = select_device(&devices, DISCRETE, &req).unwrap();
        assert_eq!(selected.index, 1);
    }

    #[test]
    fn no_compatible_device_is_fatal() {
        let req = required(&["VK_KHR_swapchain"]);
        let devices = vec![descriptor(0, INTEGRATED, &["VK_KHR_swapchain"])];
        assert!(matches!(
            select_device(&devices, DISCRETE, &req),
            Err(GpuError::NoCompatibleDevice { examined: 1 })
        ));
        assert!(matches!(
            select_device(&[], DISCRETE, &req),
            Err(GpuError::NoCompatibleDevice { examined: 0 })
        ));
    }

    fn families(flags: &[vk::QueueFlags]) -> Vec<QueueFamilyDescriptor> {
        flags
            .iter()
            .zip(0u32..)
            .map(|(flags, index)| QueueFamilyDescriptor { index, flags: *flags })
            .collect()
    }

    #[test]
    fn first_superset_queue_family_is_selected() {
        let all = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER;
        let list = families(&[
            vk::QueueFlags::TRANSFER,
            vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            all | vk::QueueFlags::SPARSE_BINDING,
            all,
        ]);
        assert_eq!(select_queue_family(&list, all).unwrap(), 2);
        assert_eq!(select_queue_family(&list, vk::QueueFlags::COMPUTE).unwrap(), 1);
        assert_eq!(select_queue_family(&list, vk::QueueFlags::TRANSFER).unwrap(), 0);
    }

    #[test]
    fn no_matching_queue_family_is_fatal() {
        let list = families(&[vk::QueueFlags::TRANSFER, vk::QueueFlags::COMPUTE]);
        let err = select_queue_family(&list, vk::QueueFlags::GRAPHICS).unwrap_err();
        assert!(matches!(
            err,
            GpuError::NoSuitableQueue { required } if required == vk::QueueFlags::GRAPHICS
        ));
        assert!(select_queue_family(&[], vk::QueueFlags::GRAPHICS).is_err());
    }

    #[test]
    fn api_version_formats_components() {
        let mut dev = descriptor(0, DISCRETE, &[]);
        dev.api_version = vk::make_api_version(0, 1, 3, 275);
        assert_eq!(dev.api_version_string(), "1.3.275");
    }
}
