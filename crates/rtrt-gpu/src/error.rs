//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU context errors.
///
/// Every variant is fatal at this layer. Context setup is all-or-nothing, so
/// the variant names the step that failed and nothing is retried.
#[derive(Error, Debug)]
pub enum GpuError {
    /// The Vulkan loader library could not be found or opened.
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// Instance creation failed.
    #[error("Instance creation failed: {0}")]
    Initialization(vk::Result),

    /// No physical device satisfies the type and extension predicate.
    #[error("No compatible GPU found ({examined} device(s) examined)")]
    NoCompatibleDevice { examined: usize },

    /// No queue family of the selected device carries the required flags.
    #[error("No queue family supports {required:?}")]
    NoSuitableQueue { required: vk::QueueFlags },

    /// Logical device creation failed.
    #[error("Logical device creation failed: {0}")]
    DeviceCreation(vk::Result),

    /// Command pool or command buffer creation failed.
    #[error("Command pool creation failed ({step}): {result}")]
    CommandPoolCreation {
        step: &'static str,
        result: vk::Result,
    },

    /// The window surface could not be created.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// The surface exists and the query succeeded, but the chosen queue
    /// family cannot present to it.
    #[error("Queue family {queue_family} cannot present to this surface")]
    PresentationUnsupported { queue_family: u32 },

    /// Swapchain creation, or one of its dependent objects, failed.
    #[error("Swapchain creation failed ({step}): {result}")]
    SwapchainCreation {
        step: &'static str,
        result: vk::Result,
    },

    /// A capability or list query returned a failure code.
    #[error("Query for {what} failed: {result}")]
    ResourceQuery {
        what: &'static str,
        result: vk::Result,
    },

    /// The negotiated swapchain image count differs from the expected count.
    #[error("Swapchain resolved {resolved} images, expected {expected}")]
    UnexpectedImageCount { expected: u32, resolved: u32 },

    /// Swapchain recreation for a new window size is not implemented.
    #[error("Resize to {width}x{height} is not supported")]
    ResizeUnsupported { width: u32, height: u32 },

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    Allocation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failing_step() {
        let err = GpuError::SwapchainCreation {
            step: "image view",
            result: vk::Result::ERROR_OUT_OF_HOST_MEMORY,
        };
        assert!(err.to_string().contains("image view"));

        let err = GpuError::ResourceQuery {
            what: "present modes",
            result: vk::Result::ERROR_SURFACE_LOST_KHR,
        };
        assert!(err.to_string().contains("present modes"));
    }

    #[test]
    fn presentation_unsupported_is_distinct_from_surface_creation() {
        let unsupported = GpuError::PresentationUnsupported { queue_family: 0 };
        let creation = GpuError::SurfaceCreation("lost".to_string());
        assert!(matches!(
            unsupported,
            GpuError::PresentationUnsupported { .. }
        ));
        assert!(!matches!(creation, GpuError::PresentationUnsupported { .. }));
    }
}
