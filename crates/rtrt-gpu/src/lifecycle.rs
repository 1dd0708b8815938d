//! Creation and teardown ordering of the context's resources.
//!
//! Ownership already prevents most misorderings (every wrapper holds an
//! `Arc` of what it was created from), but the context keeps its members in
//! `Option`s and releases them explicitly. The plans here fix that order in
//! one place, and [`ResourceLedger`] checks it as resources come and go.

use crate::error::{GpuError, Result};
use std::collections::HashSet;
use std::fmt;

/// Every resource the context tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Instance,
    Device,
    CommandPool,
    Allocator,
    Surface,
    Swapchain,
    ImageViews,
    SyncPrimitives,
    DenoisePass,
    Overlay,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 10] = [
        ResourceKind::Instance,
        ResourceKind::Device,
        ResourceKind::CommandPool,
        ResourceKind::Allocator,
        ResourceKind::Surface,
        ResourceKind::Swapchain,
        ResourceKind::ImageViews,
        ResourceKind::SyncPrimitives,
        ResourceKind::DenoisePass,
        ResourceKind::Overlay,
    ];

    /// Resources that must be live while this one exists.
    pub fn dependencies(self) -> &'static [ResourceKind] {
        use ResourceKind::*;
        match self {
            Instance => &[],
            Device => &[Instance],
            CommandPool => &[Device],
            Allocator => &[Device],
            Surface => &[Instance],
            Swapchain => &[Device, Surface],
            ImageViews => &[Device, Swapchain],
            SyncPrimitives => &[Device, Swapchain],
            DenoisePass => &[Device, Allocator],
            Overlay => &[Device, Swapchain],
        }
    }

    /// Whether the context can run without it.
    pub fn is_optional(self) -> bool {
        matches!(self, ResourceKind::DenoisePass | ResourceKind::Overlay)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Instance => "instance",
            ResourceKind::Device => "logical device",
            ResourceKind::CommandPool => "command pool",
            ResourceKind::Allocator => "memory allocator",
            ResourceKind::Surface => "surface",
            ResourceKind::Swapchain => "swapchain",
            ResourceKind::ImageViews => "swapchain image views",
            ResourceKind::SyncPrimitives => "frame sync primitives",
            ResourceKind::DenoisePass => "denoise pass",
            ResourceKind::Overlay => "overlay descriptor pool",
        };
        f.write_str(name)
    }
}

/// Which optional resources are attached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptionalResources {
    pub overlay: bool,
    pub denoise: bool,
}

impl OptionalResources {
    /// All four combinations.
    pub fn permutations() -> [OptionalResources; 4] {
        [
            Self { overlay: false, denoise: false },
            Self { overlay: true, denoise: false },
            Self { overlay: false, denoise: true },
            Self { overlay: true, denoise: true },
        ]
    }

    fn includes(self, kind: ResourceKind) -> bool {
        match kind {
            ResourceKind::Overlay => self.overlay,
            ResourceKind::DenoisePass => self.denoise,
            _ => true,
        }
    }
}

/// One step of teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    /// Block on the frame fence.
    WaitFrameFence,
    ResetFrameFence,
    WaitDeviceIdle,
    Destroy(ResourceKind),
}

const BUILD_ORDER: [ResourceKind; 10] = [
    ResourceKind::Instance,
    ResourceKind::Device,
    ResourceKind::CommandPool,
    ResourceKind::Allocator,
    ResourceKind::Surface,
    ResourceKind::Swapchain,
    ResourceKind::ImageViews,
    ResourceKind::SyncPrimitives,
    ResourceKind::DenoisePass,
    ResourceKind::Overlay,
];

const TEARDOWN_ORDER: [ResourceKind; 10] = [
    ResourceKind::Overlay,
    ResourceKind::ImageViews,
    ResourceKind::SyncPrimitives,
    ResourceKind::Swapchain,
    ResourceKind::Surface,
    ResourceKind::DenoisePass,
    ResourceKind::CommandPool,
    ResourceKind::Allocator,
    ResourceKind::Device,
    ResourceKind::Instance,
];

/// Creation order for the given optional resources.
pub fn build_plan(optional: OptionalResources) -> Vec<ResourceKind> {
    BUILD_ORDER
        .iter()
        .copied()
        .filter(|&kind| optional.includes(kind))
        .collect()
}

/// Teardown order for the given optional resources: the idle waits, then
/// every destroy step.
pub fn teardown_plan(optional: OptionalResources) -> Vec<TeardownStep> {
    let mut steps = vec![
        TeardownStep::WaitFrameFence,
        TeardownStep::ResetFrameFence,
        TeardownStep::WaitDeviceIdle,
    ];
    steps.extend(
        TEARDOWN_ORDER
            .iter()
            .copied()
            .filter(|&kind| optional.includes(kind))
            .map(TeardownStep::Destroy),
    );
    steps
}

/// Tracks which resources are live and rejects out-of-order transitions.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    live: HashSet<ResourceKind>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `kind` live. Fails if it already is or a dependency is not.
    pub fn record_created(&mut self, kind: ResourceKind) -> Result<()> {
        if self.live.contains(&kind) {
            return Err(GpuError::InvalidState(format!("{kind} created twice")));
        }
        if let Some(missing) = kind
            .dependencies()
            .iter()
            .find(|dep| !self.live.contains(dep))
        {
            return Err(GpuError::InvalidState(format!(
                "{kind} created before its dependency {missing}"
            )));
        }
        self.live.insert(kind);
        Ok(())
    }

    /// Mark `kind` released. Fails if it is not live or something live
    /// still depends on it.
    pub fn record_destroyed(&mut self, kind: ResourceKind) -> Result<()> {
        if !self.live.contains(&kind) {
            return Err(GpuError::InvalidState(format!("{kind} destroyed but not live")));
        }
        if let Some(dependent) = self
            .live
            .iter()
            .find(|live| live.dependencies().contains(&kind))
        {
            return Err(GpuError::InvalidState(format!(
                "{kind} destroyed while {dependent} still depends on it"
            )));
        }
        self.live.remove(&kind);
        Ok(())
    }

    pub fn is_live(&self, kind: ResourceKind) -> bool {
        self.live.contains(&kind)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Which optional resources are currently live.
    pub fn optional_resources(&self) -> OptionalResources {
        OptionalResources {
            overlay: self.is_live(ResourceKind::Overlay),
            denoise: self.is_live(ResourceKind::DenoisePass),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plans_cover_every_required_kind_once() {
        for optional in OptionalResources::permutations() {
            let build = build_plan(optional);
            let destroys: Vec<_> = teardown_plan(optional)
                .into_iter()
                .filter_map(|step| match step {
                    TeardownStep::Destroy(kind) => Some(kind),
                    _ => None,
                })
                .collect();
            assert_eq!(build.len(), destroys.len());
            for kind in ResourceKind::ALL {
                let expected = usize::from(optional.includes(kind));
                assert_eq!(build.iter().filter(|&&k| k == kind).count(), expected);
                assert_eq!(destroys.iter().filter(|&&k| k == kind).count(), expected);
            }
        }
    }

    #[test]
    fn teardown_starts_with_waits() {
        let plan = teardown_plan(OptionalResources::default());
        assert_eq!(
            &plan[..3],
            &[
                TeardownStep::WaitFrameFence,
                TeardownStep::ResetFrameFence,
                TeardownStep::WaitDeviceIdle
            ]
        );
        assert_eq!(plan[3], TeardownStep::Destroy(ResourceKind::ImageViews));
        assert_eq!(
            plan.last(),
            Some(&TeardownStep::Destroy(ResourceKind::Instance))
        );
    }

    #[test]
    fn overlay_is_released_first() {
        let plan = teardown_plan(OptionalResources {
            overlay: true,
            denoise: true,
        });
        assert_eq!(plan[3], TeardownStep::Destroy(ResourceKind::Overlay));
    }

    #[test]
    fn ledger_rejects_missing_dependency() {
        let mut ledger = ResourceLedger::new();
        assert!(ledger.record_created(ResourceKind::Device).is_err());
        ledger.record_created(ResourceKind::Instance).unwrap();
        ledger.record_created(ResourceKind::Device).unwrap();
        assert!(ledger.record_created(ResourceKind::Swapchain).is_err());
        assert!(ledger.record_created(ResourceKind::Device).is_err());
    }

    #[test]
    fn ledger_rejects_destroying_a_dependency() {
        let mut ledger = ResourceLedger::new();
        ledger.record_created(ResourceKind::Instance).unwrap();
        ledger.record_created(ResourceKind::Surface).unwrap();
        assert!(matches!(
            ledger.record_destroyed(ResourceKind::Instance),
            Err(GpuError::InvalidState(_))
        ));
        ledger.record_destroyed(ResourceKind::Surface).unwrap();
        ledger.record_destroyed(ResourceKind::Instance).unwrap();
        assert!(ledger.record_destroyed(ResourceKind::Instance).is_err());
        assert_eq!(ledger.live_count(), 0);
    }

    #[test]
    fn optional_resources_reflect_ledger() {
        let mut ledger = ResourceLedger::new();
        for kind in build_plan(OptionalResources::default()) {
            ledger.record_created(kind).unwrap();
        }
        assert_eq!(ledger.optional_resources(), OptionalResources::default());
        ledger.record_created(ResourceKind::Overlay).unwrap();
        assert!(ledger.optional_resources().overlay);
        assert!(!ledger.optional_resources().denoise);
    }
}
