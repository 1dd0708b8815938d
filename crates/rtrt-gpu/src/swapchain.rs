//! Swapchain management.
//!
//! Creation follows a fixed sequence: query surface capabilities, pick the
//! present mode and format, resolve extent and image count, create the
//! swapchain, fetch its images, create one view per image, move every image
//! to `PRESENT_SRC_KHR` with a single one-shot barrier submission, and create
//! the frame synchronization objects. The policy steps are free functions so
//! they can be exercised without a device.

use crate::command::CommandPool;
use crate::config::{ContextConfig, ImageCountPolicy};
use crate::device::Device;
use crate::enumerate::enumerate_two_call;
use crate::error::{GpuError, Result};
use crate::surface::Surface;
use crate::sync::SyncPrimitives;
use ash::vk;
use std::sync::Arc;

/// Step named when the initial layout transition fails.
pub const LAYOUT_TRANSITION_STEP: &str = "layout transition";

/// Format preferred over whatever the surface lists first.
pub const PREFERRED_FORMAT: vk::Format = vk::Format::B8G8R8A8_UNORM;

/// Usage every swapchain image is created with.
pub const IMAGE_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
    vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw()
        | vk::ImageUsageFlags::STORAGE.as_raw()
        | vk::ImageUsageFlags::TRANSFER_DST.as_raw(),
);

/// Lifecycle of the presentation surface's swapchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainState {
    Uninitialized,
    Built,
    Destroyed,
}

impl SwapchainState {
    /// Transition after a successful build.
    pub fn on_build(self) -> Result<Self> {
        match self {
            Self::Uninitialized => Ok(Self::Built),
            other => Err(GpuError::InvalidState(format!(
                "Cannot build swapchain in state {other:?}"
            ))),
        }
    }

    /// Transition for a window resize.
    ///
    /// Rebuilding would re-run the build procedure with the current handle
    /// passed as the old swapchain. That path does not exist yet, so a
    /// `Built` swapchain reports [`GpuError::ResizeUnsupported`].
    pub fn on_rebuild(self, extent: vk::Extent2D) -> Result<Self> {
        match self {
            Self::Built => Err(GpuError::ResizeUnsupported {
                width: extent.width,
                height: extent.height,
            }),
            other => Err(GpuError::InvalidState(format!(
                "Cannot rebuild swapchain in state {other:?}"
            ))),
        }
    }

    /// Transition at teardown.
    pub fn on_destroy(self) -> Self {
        Self::Destroyed
    }
}

/// MAILBOX when offered and preferred, otherwise FIFO, which every surface
/// is required to support.
pub fn select_present_mode(
    available: &[vk::PresentModeKHR],
    prefer_mailbox: bool,
) -> vk::PresentModeKHR {
    if prefer_mailbox && available.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// First `B8G8R8A8_UNORM` entry if any, otherwise the first entry.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    available
        .iter()
        .find(|f| f.format == PREFERRED_FORMAT)
        .or_else(|| available.first())
        .copied()
}

/// Clamp without panicking when a driver reports `min > max`; the maximum
/// wins.
fn clamp_dimension(value: u32, min: u32, max: u32) -> u32 {
    value.max(min).min(max)
}

/// The surface's current extent, or the framebuffer size clamped to the
/// surface limits when the surface leaves it undefined.
///
/// A zero-area result means the window is minimized; the caller must not
/// build a swapchain in that state.
pub fn resolve_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    framebuffer_size: (u32, u32),
) -> Result<vk::Extent2D> {
    let extent = if capabilities.current_extent.width == u32::MAX {
        let (width, height) = framebuffer_size;
        vk::Extent2D {
            width: clamp_dimension(
                width,
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: clamp_dimension(
                height,
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    } else {
        capabilities.current_extent
    };

    if extent.width == 0 || extent.height == 0 {
        return Err(GpuError::InvalidState(format!(
            "Swapchain extent {}x{} has zero area (window minimized?)",
            extent.width, extent.height
        )));
    }
    Ok(extent)
}

/// Result of image count negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageCountResolution {
    pub count: u32,
    pub expected: Option<u32>,
}

impl ImageCountResolution {
    /// Whether the resolved count matches what the renderer is sized for.
    pub fn matches_expectation(&self) -> bool {
        self.expected.map_or(true, |expected| expected == self.count)
    }

    /// Apply the mismatch policy, returning the count to create.
    pub fn enforce(self, policy: ImageCountPolicy) -> Result<u32> {
        match (self.matches_expectation(), policy, self.expected) {
            (true, _, _) | (false, _, None) => Ok(self.count),
            (false, ImageCountPolicy::Warn, Some(expected)) => {
                tracing::warn!(
                    "Swapchain resolved {} images but {expected} were expected; per-image \
                     resources will follow the resolved count",
                    self.count
                );
                Ok(self.count)
            }
            (false, ImageCountPolicy::Strict, Some(expected)) => {
                Err(GpuError::UnexpectedImageCount {
                    expected,
                    resolved: self.count,
                })
            }
        }
    }
}

/// `minImageCount + 1`, clamped to `maxImageCount` when that is bounded.
pub fn resolve_image_count(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    expected: Option<u32>,
) -> ImageCountResolution {
    let mut count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 && count > capabilities.max_image_count {
        count = capabilities.max_image_count;
    }
    ImageCountResolution { count, expected }
}

/// Error for a failed submission of [`present_layout_barriers`].
pub fn layout_transition_error(result: vk::Result) -> GpuError {
    GpuError::SwapchainCreation {
        step: LAYOUT_TRANSITION_STEP,
        result,
    }
}

/// One `UNDEFINED -> PRESENT_SRC_KHR` barrier per image.
pub fn present_layout_barriers(images: &[vk::Image]) -> Vec<vk::ImageMemoryBarrier<'static>> {
    let range = vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(vk::REMAINING_MIP_LEVELS)
        .base_array_layer(0)
        .layer_count(vk::REMAINING_ARRAY_LAYERS);

    images
        .iter()
        .map(|&image| {
            vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::empty())
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(range)
        })
        .collect()
}

/// Swapchain, its per-image views and the frame synchronization objects.
///
/// Dropping releases, in order: image views, semaphores and fence, then
/// the swapchain. The surface is kept alive until after that.
pub struct Swapchain {
    device: Arc<Device>,
    surface: Arc<Surface>,
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    sync: Option<SyncPrimitives>,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
}

impl Swapchain {
    /// Build a swapchain for `surface`.
    ///
    /// `old_swapchain` is null on the first build. Any failure releases what
    /// was created so far and aborts.
    pub fn new(
        device: Arc<Device>,
        surface: Arc<Surface>,
        command_pool: &CommandPool,
        framebuffer_size: (u32, u32),
        config: &ContextConfig,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Self> {
        let physical_device = device.physical_device();
        let capabilities = surface.capabilities(physical_device)?;

        let present_modes = surface.present_modes(physical_device)?;
        tracing::debug!("Available present modes: {present_modes:?}");
        let present_mode = select_present_mode(&present_modes, config.prefer_mailbox);
        tracing::info!("Selected present mode: {present_mode:?}");

        let formats = surface.formats(physical_device)?;
        for format in &formats {
            tracing::debug!(
                "Surface format {:?}, color space {:?}",
                format.format,
                format.color_space
            );
        }
        let format = select_surface_format(&formats).ok_or(GpuError::ResourceQuery {
            what: "surface formats",
            result: vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
        })?;
        tracing::info!(
            "Selected format {:?}, color space {:?}",
            format.format,
            format.color_space
        );

        let extent = resolve_extent(&capabilities, framebuffer_size)?;
        let image_count = resolve_image_count(&capabilities, config.expected_image_count)
            .enforce(config.image_count_policy)?;
        tracing::info!(
            "Swapchain extent {}x{}, {image_count} image(s) (surface allows {}..={})",
            extent.width,
            extent.height,
            capabilities.min_image_count,
            capabilities.max_image_count
        );

        let queue_families = [device.queue_family()];
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle())
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(IMAGE_USAGE)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_families)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let loader = device.swapchain_loader();
        // SAFETY: the surface and device are valid while their Arcs are held.
        let handle = unsafe { loader.create_swapchain(&create_info, None) }.map_err(|result| {
            GpuError::SwapchainCreation {
                step: "swapchain",
                result,
            }
        })?;

        let fp = loader.fp().get_swapchain_images_khr;
        let raw_device = device.handle().handle();
        // From here on, an early return drops `swapchain` and releases
        // whatever has been created.
        let mut swapchain = Self {
            device: Arc::clone(&device),
            surface,
            handle,
            images: Vec::new(),
            image_views: Vec::new(),
            sync: None,
            format,
            present_mode,
            extent,
        };

        // SAFETY: the swapchain was just created from this device.
        swapchain.images = unsafe {
            enumerate_two_call("swapchain images", |count, data| {
                fp(raw_device, handle, count, data)
            })
        }?;
        swapchain.image_views.reserve(swapchain.images.len());

        for &image in &swapchain.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .base_mip_level(0)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(1),
                );
            // SAFETY: the image belongs to this swapchain.
            let view = unsafe { device.handle().create_image_view(&view_info, None) }.map_err(
                |result| GpuError::SwapchainCreation {
                    step: "image view",
                    result,
                },
            )?;
            swapchain.image_views.push(view);
        }

        let barriers = present_layout_barriers(&swapchain.images);
        command_pool
            .submit_one_shot(|raw, cmd| {
                // SAFETY: cmd is in the recording state.
                unsafe {
                    raw.cmd_pipeline_barrier(
                        cmd,
                        vk::PipelineStageFlags::TOP_OF_PIPE,
                        vk::PipelineStageFlags::TOP_OF_PIPE,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &barriers,
                    );
                }
            })
            .map_err(layout_transition_error)?;

        swapchain.sync = Some(SyncPrimitives::new(device)?);

        tracing::info!(
            "Swapchain created: {}x{} ({} images)",
            extent.width,
            extent.height,
            swapchain.images.len()
        );
        Ok(swapchain)
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// The surface presented to.
    pub fn surface(&self) -> &Arc<Surface> {
        &self.surface
    }

    /// Frame synchronization objects.
    pub fn sync(&self) -> Result<&SyncPrimitives> {
        self.sync
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("Swapchain sync objects missing".to_string()))
    }

    /// Acquire the next image, signaling the read semaphore.
    ///
    /// Returns the image index and whether the swapchain is suboptimal.
    pub fn acquire_next_image(&self) -> Result<(u32, bool)> {
        let sync = self.sync()?;
        // SAFETY: the semaphore is unsignaled between frames.
        let result = unsafe {
            self.device.swapchain_loader().acquire_next_image(
                self.handle,
                u64::MAX,
                sync.read_semaphore,
                vk::Fence::null(),
            )
        }?;
        Ok(result)
    }

    /// Present `image_index` once the written semaphore signals.
    ///
    /// Returns whether the swapchain is suboptimal.
    pub fn present(&self, image_index: u32) -> Result<bool> {
        let sync = self.sync()?;
        let wait_semaphores = [sync.written_semaphore];
        let swapchains = [self.handle];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        // SAFETY: the queue belongs to the device and presents to this surface.
        let suboptimal = unsafe {
            self.device
                .swapchain_loader()
                .queue_present(self.device.queue(), &present_info)
        }?;
        Ok(suboptimal)
    }
}

impl Swapchain {
    /// Destroy the per-image views. Idempotent.
    pub(crate) fn release_image_views(&mut self) {
        if self.image_views.is_empty() {
            return;
        }
        tracing::debug!("Destroying {} swapchain image view(s)", self.image_views.len());
        // SAFETY: teardown waits for device idle first.
        unsafe {
            for view in self.image_views.drain(..) {
                self.device.handle().destroy_image_view(view, None);
            }
        }
    }

    /// Destroy the fence and semaphores. Idempotent.
    pub(crate) fn release_sync(&mut self) {
        self.sync = None;
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.release_image_views();
        self.release_sync();
        tracing::debug!("Destroying swapchain");
        // SAFETY: views are gone and the device is idle.
        unsafe {
            self.device
                .swapchain_loader()
                .destroy_swapchain(self.handle, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    fn undefined_extent() -> vk::SurfaceCapabilitiesKHR {
        let mut c = caps(2, 0);
        c.current_extent = vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        };
        c.min_image_extent = vk::Extent2D {
            width: 64,
            height: 64,
        };
        c.max_image_extent = vk::Extent2D {
            width: 2048,
            height: 1024,
        };
        c
    }

    #[test]
    fn mailbox_preferred_when_present() {
        let modes = [
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
        ];
        assert_eq!(select_present_mode(&modes, true), vk::PresentModeKHR::MAILBOX);
        assert_eq!(select_present_mode(&modes, false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn fifo_fallback_without_mailbox() {
        let modes = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO_RELAXED];
        assert_eq!(select_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
        assert_eq!(select_present_mode(&[], true), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn preferred_format_keeps_its_color_space() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        let chosen = select_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(chosen.color_space, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT);
    }

    #[test]
    fn first_format_when_preferred_absent() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R16G16B16A16_SFLOAT,
                color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(select_surface_format(&formats), Some(formats[0]));
        assert_eq!(select_surface_format(&[]), None);
    }

    #[test]
    fn current_extent_used_when_defined() {
        let extent = resolve_extent(&caps(2, 0), (10, 10)).unwrap();
        assert_eq!((extent.width, extent.height), (1280, 720));
    }

    #[test]
    fn framebuffer_size_clamped_when_extent_undefined() {
        let c = undefined_extent();
        let extent = resolve_extent(&c, (4000, 500)).unwrap();
        assert_eq!((extent.width, extent.height), (2048, 500));

        let extent = resolve_extent(&c, (8, 8)).unwrap();
        assert_eq!((extent.width, extent.height), (64, 64));
    }

    #[test]
    fn inverted_extent_limits_do_not_panic() {
        let mut c = undefined_extent();
        c.min_image_extent = vk::Extent2D {
            width: 4096,
            height: 4096,
        };
        let extent = resolve_extent(&c, (800, 600)).unwrap();
        assert_eq!((extent.width, extent.height), (2048, 1024));
    }

    #[test]
    fn zero_area_extent_is_rejected() {
        let mut c = caps(2, 0);
        c.current_extent = vk::Extent2D {
            width: 0,
            height: 0,
        };
        assert!(matches!(
            resolve_extent(&c, (0, 0)),
            Err(GpuError::InvalidState(_))
        ));
    }

    #[test]
    fn unbounded_max_gives_min_plus_one() {
        let resolution = resolve_image_count(&caps(2, 0), Some(3));
        assert_eq!(resolution.count, 3);
        assert!(resolution.matches_expectation());
        assert_eq!(resolution.enforce(ImageCountPolicy::Strict).unwrap(), 3);
    }

    #[test]
    fn bounded_max_clamps_and_flags_expectation() {
        let resolution = resolve_image_count(&caps(2, 2), Some(3));
        assert_eq!(resolution.count, 2);
        assert!(!resolution.matches_expectation());

        assert_eq!(resolution.enforce(ImageCountPolicy::Warn).unwrap(), 2);
        assert!(matches!(
            resolution.enforce(ImageCountPolicy::Strict),
            Err(GpuError::UnexpectedImageCount {
                expected: 3,
                resolved: 2
            })
        ));
    }

    #[test]
    fn no_expectation_accepts_any_count() {
        let resolution = resolve_image_count(&caps(4, 8), None);
        assert_eq!(resolution.count, 5);
        assert_eq!(resolution.enforce(ImageCountPolicy::Strict).unwrap(), 5);
    }

    #[test]
    fn barriers_transition_every_image_to_present() {
        use ash::vk::Handle;
        let images: Vec<vk::Image> = (1..=3).map(vk::Image::from_raw).collect();
        let barriers = present_layout_barriers(&images);
        assert_eq!(barriers.len(), images.len());
        for (barrier, image) in barriers.iter().zip(&images) {
            assert_eq!(barrier.image, *image);
            assert_eq!(barrier.old_layout, vk::ImageLayout::UNDEFINED);
            assert_eq!(barrier.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
            assert_eq!(barrier.subresource_range.level_count, vk::REMAINING_MIP_LEVELS);
        }
    }

    #[test]
    fn failed_layout_transition_names_its_step() {
        let err = layout_transition_error(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert!(matches!(
            err,
            GpuError::SwapchainCreation {
                step: LAYOUT_TRANSITION_STEP,
                result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            }
        ));
        let message = err.to_string();
        assert!(message.starts_with("Swapchain creation failed (layout transition)"));
        assert!(!message.starts_with("Vulkan error"));
    }

    #[test]
    fn state_machine() {
        let state = SwapchainState::Uninitialized.on_build().unwrap();
        assert_eq!(state, SwapchainState::Built);
        assert!(state.on_build().is_err());

        let extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        assert!(matches!(
            state.on_rebuild(extent),
            Err(GpuError::ResizeUnsupported {
                width: 800,
                height: 600
            })
        ));
        assert!(matches!(
            SwapchainState::Uninitialized.on_rebuild(extent),
            Err(GpuError::InvalidState(_))
        ));
        assert_eq!(state.on_destroy(), SwapchainState::Destroyed);
    }

    #[test]
    fn image_usage_combines_attachment_storage_and_transfer() {
        assert!(IMAGE_USAGE.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));
        assert!(IMAGE_USAGE.contains(vk::ImageUsageFlags::STORAGE));
        assert!(IMAGE_USAGE.contains(vk::ImageUsageFlags::TRANSFER_DST));
        assert!(!IMAGE_USAGE.contains(vk::ImageUsageFlags::SAMPLED));
    }
}
