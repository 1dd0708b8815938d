//! Surface management for windowed rendering.
//!
//! The window itself belongs to the windowing collaborator, which is seen
//! here only through [`PresentationTarget`]: native handles for surface
//! creation and the live framebuffer size for extent resolution.

use crate::enumerate::enumerate_two_call;
use crate::error::{GpuError, Result};
use crate::instance::Instance;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::CStr;
use std::sync::Arc;

/// A window that can be presented to.
pub trait PresentationTarget: HasDisplayHandle + HasWindowHandle {
    /// Current framebuffer size in physical pixels.
    fn framebuffer_size(&self) -> (u32, u32);
}

/// Instance extensions the platform needs for surface creation.
pub fn required_surface_extensions<T>(target: &T) -> Result<Vec<&'static CStr>>
where
    T: HasDisplayHandle + ?Sized,
{
    let display = target
        .display_handle()
        .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
    let names = ash_window::enumerate_required_extensions(display.as_raw()).map_err(|result| {
        GpuError::ResourceQuery {
            what: "windowing instance extensions",
            result,
        }
    })?;

    // SAFETY: ash-window returns pointers to static NUL-terminated names.
    Ok(names
        .iter()
        .map(|&name| unsafe { CStr::from_ptr(name) })
        .collect())
}

/// Owned presentation surface.
pub struct Surface {
    instance: Arc<Instance>,
    loader: ash::khr::surface::Instance,
    handle: vk::SurfaceKHR,
}

impl Surface {
    /// Create a surface for the window.
    pub fn new<T>(instance: Arc<Instance>, target: &T) -> Result<Self>
    where
        T: PresentationTarget + ?Sized,
    {
        let display = target
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window = target
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        // SAFETY: the handles come from a live window and the instance was
        // created with the extensions ash-window asked for.
        let handle = unsafe {
            ash_window::create_surface(
                instance.entry(),
                instance.handle(),
                display.as_raw(),
                window.as_raw(),
                None,
            )
        }
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        let loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());
        tracing::debug!("Surface created");

        Ok(Self {
            instance,
            loader,
            handle,
        })
    }

    /// The instance this surface belongs to.
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    /// The raw surface handle.
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// Check that `queue_family` of `physical_device` can present here.
    ///
    /// A failed query and a successful query answering "no" are reported as
    /// different errors.
    pub fn verify_presentation(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<()> {
        // SAFETY: the physical device belongs to this surface's instance.
        let supported = unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, queue_family, self.handle)
        }
        .map_err(|result| GpuError::ResourceQuery {
            what: "surface presentation support",
            result,
        })?;

        if !supported {
            return Err(GpuError::PresentationUnsupported { queue_family });
        }
        tracing::info!("Queue family {queue_family} supports presentation to the surface");
        Ok(())
    }

    /// Current surface capabilities.
    pub fn capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<vk::SurfaceCapabilitiesKHR> {
        // SAFETY: the physical device belongs to this surface's instance.
        unsafe {
            self.loader
                .get_physical_device_surface_capabilities(physical_device, self.handle)
        }
        .map_err(|result| GpuError::ResourceQuery {
            what: "surface capabilities",
            result,
        })
    }

    /// Supported present modes.
    pub fn present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::PresentModeKHR>> {
        let fp = self.loader.fp().get_physical_device_surface_present_modes_khr;
        let surface = self.handle;
        // SAFETY: the handles are valid for the lifetime of self.
        unsafe {
            enumerate_two_call("present modes", |count, data| {
                fp(physical_device, surface, count, data)
            })
        }
    }

    /// Supported format and color space pairs.
    pub fn formats(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::SurfaceFormatKHR>> {
        let fp = self.loader.fp().get_physical_device_surface_formats_khr;
        let surface = self.handle;
        // SAFETY: the handles are valid for the lifetime of self.
        unsafe {
            enumerate_two_call("surface formats", |count, data| {
                fp(physical_device, surface, count, data)
            })
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        tracing::debug!("Destroying surface");
        // SAFETY: the swapchain holds an Arc<Surface>, so it is already gone.
        unsafe { self.loader.destroy_surface(self.handle, None) };
    }
}
