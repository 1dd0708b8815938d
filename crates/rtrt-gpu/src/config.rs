//! Context configuration.

use ash::vk;
use std::ffi::CStr;

/// What to do when the swapchain resolves a different image count than
/// [`ContextConfig::expected_image_count`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageCountPolicy {
    /// Log the mismatch and continue with the resolved count.
    #[default]
    Warn,
    /// Abort context setup with [`crate::GpuError::UnexpectedImageCount`].
    Strict,
}

/// Configuration for building a [`crate::GpuContext`].
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Application name reported to the driver.
    pub app_name: String,
    /// Enable the Khronos validation layer and debug messenger.
    pub validation: bool,
    /// Prepend the LunarG API dump layer.
    pub api_dump: bool,
    /// Device extensions a physical device must support to be selected.
    pub required_device_extensions: Vec<&'static CStr>,
    /// Capabilities the single queue family must provide.
    pub required_queue_flags: vk::QueueFlags,
    /// Device type a physical device must report to be selected.
    pub device_type: vk::PhysicalDeviceType,
    /// Swapchain image count the rest of the renderer is sized for.
    pub expected_image_count: Option<u32>,
    /// Reaction to a differing image count.
    pub image_count_policy: ImageCountPolicy,
    /// Pick MAILBOX when the surface offers it. FIFO otherwise.
    pub prefer_mailbox: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            app_name: "rtrt".to_string(),
            validation: cfg!(debug_assertions),
            api_dump: false,
            required_device_extensions: default_device_extensions(),
            required_queue_flags: vk::QueueFlags::GRAPHICS
                | vk::QueueFlags::COMPUTE
                | vk::QueueFlags::TRANSFER,
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            expected_image_count: Some(3),
            image_count_policy: ImageCountPolicy::Warn,
            prefer_mailbox: true,
        }
    }
}

/// Device extensions needed for presentation and hardware ray tracing.
pub fn default_device_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::swapchain::NAME,
        ash::khr::acceleration_structure::NAME,
        ash::khr::ray_tracing_pipeline::NAME,
        ash::khr::deferred_host_operations::NAME,
    ]
}

impl ContextConfig {
    /// Create a new config with the given application name.
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Enable or disable the API dump layer.
    pub fn with_api_dump(mut self, api_dump: bool) -> Self {
        self.api_dump = api_dump;
        self
    }

    /// Replace the required device extension list.
    pub fn with_device_extensions(mut self, extensions: Vec<&'static CStr>) -> Self {
        self.required_device_extensions = extensions;
        self
    }

    /// Set the required queue capabilities.
    pub fn with_queue_flags(mut self, flags: vk::QueueFlags) -> Self {
        self.required_queue_flags = flags;
        self
    }

    /// Set the required physical device type.
    pub fn with_device_type(mut self, device_type: vk::PhysicalDeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    /// Set the expected swapchain image count (`None` accepts any count).
    pub fn with_expected_image_count(mut self, count: Option<u32>) -> Self {
        self.expected_image_count = count;
        self
    }

    /// Set the image count mismatch policy.
    pub fn with_image_count_policy(mut self, policy: ImageCountPolicy) -> Self {
        self.image_count_policy = policy;
        self
    }

    /// Prefer MAILBOX presentation when available.
    pub fn with_mailbox(mut self, prefer_mailbox: bool) -> Self {
        self.prefer_mailbox = prefer_mailbox;
        self
    }

    /// Whether a required extension is requested.
    pub fn requires_extension(&self, name: &CStr) -> bool {
        self.required_device_extensions.contains(&name)
    }
}
