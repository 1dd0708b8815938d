//! GPU context management.

use crate::command::CommandPool;
use crate::config::ContextConfig;
use crate::denoise::DenoisePass;
use crate::device::{
    enumerate_physical_devices, queue_families, select_device, select_queue_family, Device,
};
use crate::enumerate::names_to_strings;
use crate::error::{GpuError, Result};
use crate::instance::Instance;
use crate::lifecycle::{teardown_plan, ResourceKind, ResourceLedger, TeardownStep};
use crate::memory::{GpuAllocator, SharedAllocator};
use crate::overlay::OverlayResources;
use crate::surface::{required_surface_extensions, PresentationTarget, Surface};
use crate::swapchain::{Swapchain, SwapchainState};
use ash::vk;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Set by the first [`GpuContextBuilder::build`]; never cleared.
static INSTANCE_CLAIMED: AtomicBool = AtomicBool::new(false);

/// Take `flag` if nobody has yet. Later claims fail.
fn claim_once(flag: &AtomicBool, what: &str) -> Result<()> {
    flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .map(|_| ())
        .map_err(|_| GpuError::InvalidState(format!("{what} was already created in this process")))
}

/// Owns every GPU resource of the renderer's presentation context.
///
/// One per process: a second [`GpuContextBuilder::build`] fails, even
/// after the first context is dropped. Members are held in `Option`s so `Drop` can release
/// them one at a time in the order [`teardown_plan`] gives.
pub struct GpuContext {
    config: ContextConfig,
    ledger: ResourceLedger,
    swapchain_state: SwapchainState,

    overlay: Option<OverlayResources>,
    swapchain: Option<Swapchain>,
    surface: Option<Arc<Surface>>,
    denoise: Option<DenoisePass>,
    command_pool: Option<CommandPool>,
    allocator: Option<SharedAllocator>,
    device: Option<Arc<Device>>,
    instance: Option<Arc<Instance>>,
}

fn live<'a, T>(slot: &'a Option<T>, kind: ResourceKind) -> Result<&'a T> {
    slot.as_ref()
        .ok_or_else(|| GpuError::InvalidState(format!("{kind} is not live")))
}

impl GpuContext {
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn instance(&self) -> Result<&Arc<Instance>> {
        live(&self.instance, ResourceKind::Instance)
    }

    pub fn device(&self) -> Result<&Arc<Device>> {
        live(&self.device, ResourceKind::Device)
    }

    pub fn command_pool(&self) -> Result<&CommandPool> {
        live(&self.command_pool, ResourceKind::CommandPool)
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> Result<&SharedAllocator> {
        live(&self.allocator, ResourceKind::Allocator)
    }

    pub fn surface(&self) -> Result<&Arc<Surface>> {
        live(&self.surface, ResourceKind::Surface)
    }

    pub fn swapchain(&self) -> Result<&Swapchain> {
        live(&self.swapchain, ResourceKind::Swapchain)
    }

    pub fn swapchain_state(&self) -> SwapchainState {
        self.swapchain_state
    }

    pub fn overlay(&self) -> Option<&OverlayResources> {
        self.overlay.as_ref()
    }

    pub fn denoise(&self) -> Option<&DenoisePass> {
        self.denoise.as_ref()
    }

    /// Live-resource bookkeeping.
    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// Wait for device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        self.device()?.wait_idle()
    }

    /// Create the UI overlay's descriptor pool.
    pub fn attach_overlay(&mut self) -> Result<()> {
        if self.overlay.is_some() {
            return Err(GpuError::InvalidState("Overlay already attached".to_string()));
        }
        let overlay = OverlayResources::new(Arc::clone(self.device()?))?;
        self.ledger.record_created(ResourceKind::Overlay)?;
        self.overlay = Some(overlay);
        Ok(())
    }

    /// Create the denoise pass from its compute shader.
    pub fn attach_denoise(&mut self, spirv: &[u32], guide_size: u64) -> Result<()> {
        if self.denoise.is_some() {
            return Err(GpuError::InvalidState("Denoise pass already attached".to_string()));
        }
        let pass = DenoisePass::new(
            Arc::clone(self.device()?),
            self.allocator()?,
            spirv,
            guide_size,
        )?;
        self.ledger.record_created(ResourceKind::DenoisePass)?;
        self.denoise = Some(pass);
        Ok(())
    }

    /// React to a window resize.
    ///
    /// Rebuilding the swapchain and everything sized to it is not supported;
    /// this always fails and leaves the context untouched.
    pub fn recreate_sized_resources(&mut self, width: u32, height: u32) -> Result<()> {
        let extent = vk::Extent2D { width, height };
        self.swapchain_state = self.swapchain_state.on_rebuild(extent)?;
        Ok(())
    }

    fn run_teardown_step(&mut self, step: TeardownStep) -> Result<()> {
        match step {
            TeardownStep::WaitFrameFence => {
                if let Some(swapchain) = &self.swapchain {
                    swapchain.sync()?.wait()?;
                }
            }
            TeardownStep::ResetFrameFence => {
                if let Some(swapchain) = &self.swapchain {
                    swapchain.sync()?.reset()?;
                }
            }
            TeardownStep::WaitDeviceIdle => {
                if let Some(device) = &self.device {
                    device.wait_idle()?;
                }
            }
            TeardownStep::Destroy(kind) => {
                match kind {
                    ResourceKind::Overlay => self.overlay = None,
                    ResourceKind::ImageViews => {
                        if let Some(swapchain) = &mut self.swapchain {
                            swapchain.release_image_views();
                        }
                    }
                    ResourceKind::SyncPrimitives => {
                        if let Some(swapchain) = &mut self.swapchain {
                            swapchain.release_sync();
                        }
                    }
                    ResourceKind::Swapchain => {
                        self.swapchain = None;
                        self.swapchain_state = self.swapchain_state.on_destroy();
                    }
                    ResourceKind::Surface => self.surface = None,
                    ResourceKind::DenoisePass => self.denoise = None,
                    ResourceKind::CommandPool => self.command_pool = None,
                    ResourceKind::Allocator => self.allocator = None,
                    ResourceKind::Device => self.device = None,
                    ResourceKind::Instance => self.instance = None,
                }
                self.ledger.record_destroyed(kind)?;
            }
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        tracing::info!("Tearing down GPU context");
        for step in teardown_plan(self.ledger.optional_resources()) {
            if let Err(e) = self.run_teardown_step(step) {
                tracing::warn!("Teardown step {step:?} failed: {e}");
            }
        }
        if self.ledger.live_count() > 0 {
            tracing::warn!("{} resource(s) still live after teardown", self.ledger.live_count());
        }
    }
}

/// Builder for creating a GPU context.
#[derive(Default)]
pub struct GpuContextBuilder {
    config: ContextConfig,
}

impl GpuContextBuilder {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    /// Run the full bootstrap against `target`'s window.
    ///
    /// Any failing step aborts; everything created before it is released
    /// in reverse order as the locals drop. The Vulkan instance is created
    /// at most once per process, so only the first call gets that far.
    pub fn build<T>(self, target: &T) -> Result<GpuContext>
    where
        T: PresentationTarget + ?Sized,
    {
        let config = self.config;
        let mut ledger = ResourceLedger::new();

        let windowing_extensions = required_surface_extensions(target)?;
        claim_once(&INSTANCE_CLAIMED, "The Vulkan instance")?;
        let instance = Arc::new(Instance::new(&config, &windowing_extensions)?);
        ledger.record_created(ResourceKind::Instance)?;

        // SAFETY: the instance is live.
        let devices = unsafe { enumerate_physical_devices(instance.handle()) }?;
        let required_extensions = names_to_strings(&config.required_device_extensions);
        let selected = select_device(&devices, config.device_type, &required_extensions)?;

        // SAFETY: the physical device came from this instance.
        let families = unsafe { queue_families(instance.handle(), selected.handle) }?;
        let queue_family = select_queue_family(&families, config.required_queue_flags)?;

        let device = Arc::new(Device::new(
            Arc::clone(&instance),
            selected.handle,
            queue_family,
            &config.required_device_extensions,
        )?);
        ledger.record_created(ResourceKind::Device)?;

        let command_pool = CommandPool::new(Arc::clone(&device))?;
        ledger.record_created(ResourceKind::CommandPool)?;

        let allocator = GpuAllocator::new(Arc::clone(&device))?.into_shared();
        ledger.record_created(ResourceKind::Allocator)?;

        let surface = Arc::new(Surface::new(Arc::clone(&instance), target)?);
        ledger.record_created(ResourceKind::Surface)?;
        surface.verify_presentation(device.physical_device(), queue_family)?;

        let swapchain = Swapchain::new(
            Arc::clone(&device),
            Arc::clone(&surface),
            &command_pool,
            target.framebuffer_size(),
            &config,
            vk::SwapchainKHR::null(),
        )?;
        ledger.record_created(ResourceKind::Swapchain)?;
        ledger.record_created(ResourceKind::ImageViews)?;
        ledger.record_created(ResourceKind::SyncPrimitives)?;
        let swapchain_state = SwapchainState::Uninitialized.on_build()?;

        tracing::info!("GPU context ready ({} live resources)", ledger.live_count());

        Ok(GpuContext {
            config,
            ledger,
            swapchain_state,
            overlay: None,
            swapchain: Some(swapchain),
            surface: Some(surface),
            denoise: None,
            command_pool: Some(command_pool),
            allocator: Some(allocator),
            device: Some(device),
            instance: Some(instance),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_is_rejected() {
        let flag = AtomicBool::new(false);
        claim_once(&flag, "The Vulkan instance").unwrap();
        let err = claim_once(&flag, "The Vulkan instance").unwrap_err();
        assert!(matches!(err, GpuError::InvalidState(_)));
        assert!(err.to_string().contains("already created"));
        assert!(flag.load(Ordering::Acquire));
    }
}
