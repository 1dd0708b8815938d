//! Vulkan instance creation.

use crate::config::ContextConfig;
use crate::enumerate::{extension_name, instance_extensions, instance_layers, layer_name};
use crate::error::{GpuError, Result};
use ash::vk;
use std::collections::HashSet;
use std::ffi::{c_char, c_void, CStr, CString};

/// Standard validation layer.
pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// API call tracing layer. Must be first in the layer list to see every call.
pub const API_DUMP_LAYER: &CStr = c"VK_LAYER_LUNARG_api_dump";

/// Layers to request, in the order they should be enabled.
pub fn requested_layers(validation: bool, api_dump: bool) -> Vec<&'static CStr> {
    let mut layers = Vec::new();
    if validation {
        layers.push(VALIDATION_LAYER);
    }
    if api_dump {
        layers.insert(0, API_DUMP_LAYER);
    }
    layers
}

/// Instance extensions to request: the windowing layer's list followed by
/// debug utils when validation is on. Duplicates are dropped.
pub fn requested_extensions<'a>(windowing: &[&'a CStr], validation: bool) -> Vec<&'a CStr> {
    let mut seen = HashSet::new();
    let mut extensions: Vec<&CStr> = windowing
        .iter()
        .copied()
        .filter(|name| seen.insert(*name))
        .collect();
    if validation && seen.insert(ash::ext::debug_utils::NAME) {
        extensions.push(ash::ext::debug_utils::NAME);
    }
    extensions
}

/// Owned Vulkan instance.
///
/// Process-wide: exactly one is created by [`crate::GpuContextBuilder`]
/// and it is the last object destroyed. Everything created from it holds
/// an `Arc<Instance>`, so it cannot be dropped while a dependent lives.
pub struct Instance {
    entry: ash::Entry,
    handle: ash::Instance,
    debug_messenger: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl Instance {
    /// Create the instance.
    ///
    /// `windowing_extensions` is the list the windowing collaborator needs
    /// enabled for surface creation.
    pub fn new(config: &ContextConfig, windowing_extensions: &[&CStr]) -> Result<Self> {
        // SAFETY: loading the system Vulkan library has no other preconditions.
        let entry = unsafe { ash::Entry::load() }.map_err(|e| GpuError::Loading(e.to_string()))?;

        tracing::info!("Windowing layer requires {} extension(s):", windowing_extensions.len());
        for ext in windowing_extensions {
            tracing::info!("\t{}", ext.to_string_lossy());
        }

        let available_layers: HashSet<String> = instance_layers(&entry)?
            .iter()
            .map(layer_name)
            .collect();
        let available_extensions: HashSet<String> = instance_extensions(&entry)?
            .iter()
            .map(extension_name)
            .collect();

        let layers: Vec<&CStr> = requested_layers(config.validation, config.api_dump)
            .into_iter()
            .filter(|layer| {
                let found = available_layers.contains(layer.to_string_lossy().as_ref());
                if !found {
                    tracing::warn!("Layer {} not available, skipping", layer.to_string_lossy());
                }
                found
            })
            .collect();
        let debug_utils_name = ash::ext::debug_utils::NAME.to_string_lossy();
        let debug_utils =
            config.validation && available_extensions.contains(debug_utils_name.as_ref());
        if config.validation && !debug_utils {
            tracing::warn!(
                "VK_EXT_debug_utils not available, validation messages will not be logged"
            );
        }
        let extensions = requested_extensions(windowing_extensions, debug_utils);

        let app_name = CString::new(config.app_name.as_str())
            .map_err(|e| GpuError::InvalidState(format!("Invalid application name: {e}")))?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"rtrt")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let extension_names: Vec<*const c_char> =
            extensions.iter().map(|ext| ext.as_ptr()).collect();
        let layer_names: Vec<*const c_char> = layers.iter().map(|l| l.as_ptr()).collect();

        let mut messenger_info = debug_messenger_info();
        let mut create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_names);
        if debug_utils {
            // Also covers messages emitted during vkCreateInstance itself.
            create_info = create_info.push_next(&mut messenger_info);
        }

        // SAFETY: create_info and everything it points to outlive the call.
        let handle = unsafe { entry.create_instance(&create_info, None) }
            .map_err(GpuError::Initialization)?;
        tracing::info!(
            "Vulkan instance created ({} layer(s), {} extension(s))",
            layers.len(),
            extensions.len()
        );

        let debug_messenger = if debug_utils {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &handle);
            let info = debug_messenger_info();
            // SAFETY: the instance was created with debug utils enabled.
            match unsafe { loader.create_debug_utils_messenger(&info, None) } {
                Ok(messenger) => Some((loader, messenger)),
                Err(e) => {
                    tracing::warn!("Debug messenger unavailable: {e}");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            entry,
            handle,
            debug_messenger,
        })
    }

    /// The loader entry points.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// The raw instance.
    pub fn handle(&self) -> &ash::Instance {
        &self.handle
    }

    /// Whether `VK_EXT_debug_utils` was enabled.
    pub fn debug_utils_enabled(&self) -> bool {
        self.debug_messenger.is_some()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        tracing::debug!("Destroying instance");
        // SAFETY: every child holds an Arc<Instance>, so none remain.
        unsafe {
            if let Some((loader, messenger)) = self.debug_messenger.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.handle.destroy_instance(None);
        }
    }
}

fn debug_messenger_info() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(vulkan_debug_callback))
}

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: Vulkan guarantees the callback data is valid for this call.
    let message = unsafe { (*p_callback_data).message_as_c_str() }
        .map_or_else(|| "<no message>".into(), CStr::to_string_lossy);

    let kind = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "VALIDATION",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "PERFORMANCE",
        _ => "GENERAL",
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            tracing::error!(target: "rtrt-vk", "[{kind}] {message}");
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!(target: "rtrt-vk", "[{kind}] {message}");
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            tracing::debug!(target: "rtrt-vk", "[{kind}] {message}");
        }
        _ => tracing::trace!(target: "rtrt-vk", "[{kind}] {message}"),
    }

    vk::FALSE
}
