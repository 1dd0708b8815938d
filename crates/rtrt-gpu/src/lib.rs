//! Vulkan context bootstrap for the rtrt ray tracer.
//!
//! This crate provides:
//! - Capability enumeration and instance creation
//! - Physical device, queue family and logical device selection
//! - Command pool and one-shot submission
//! - Surface and swapchain management
//! - Ordered teardown of everything above

pub mod command;
pub mod config;
pub mod context;
pub mod denoise;
pub mod device;
pub mod enumerate;
pub mod error;
pub mod features;
pub mod instance;
pub mod lifecycle;
pub mod memory;
pub mod overlay;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use command::CommandPool;
pub use config::{ContextConfig, ImageCountPolicy};
pub use context::{GpuContext, GpuContextBuilder};
pub use denoise::{DenoisePass, DenoiseParams};
pub use device::{Device, PhysicalDeviceDescriptor, QueueFamilyDescriptor};
pub use error::{GpuError, Result};
pub use features::{DeviceFeatureChain, FeatureTier};
pub use instance::Instance;
pub use lifecycle::{
    build_plan, teardown_plan, OptionalResources, ResourceKind, ResourceLedger, TeardownStep,
};
pub use memory::{GpuAllocator, GpuBuffer, SharedAllocator};
pub use overlay::OverlayResources;
pub use surface::{PresentationTarget, Surface};
pub use swapchain::{Swapchain, SwapchainState};
pub use sync::SyncPrimitives;
