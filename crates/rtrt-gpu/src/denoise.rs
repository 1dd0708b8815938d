//! Resources for the auxiliary denoising compute pass.
//!
//! Only acquisition and release live here; dispatching the pass is the
//! renderer's job. The pass reads a storage buffer of per-pixel guide data
//! (binding 0) and filters a storage image in place (binding 1), with its
//! tuning values supplied as push constants.

use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::memory::{GpuBuffer, SharedAllocator};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// Binding of the guide buffer.
pub const GUIDE_BUFFER_BINDING: u32 = 0;
/// Binding of the filtered image.
pub const TARGET_IMAGE_BINDING: u32 = 1;

/// Push constants for one filter iteration.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct DenoiseParams {
    /// Weight of the normal difference term.
    pub normal_factor: f32,
    /// Weight of the depth difference term.
    pub depth_factor: f32,
    /// Pixel stride of this iteration.
    pub step_width: i32,
    pub _pad: i32,
}

impl Default for DenoiseParams {
    fn default() -> Self {
        Self {
            normal_factor: 1.0e-2,
            depth_factor: 1.0e-2,
            step_width: 1,
            _pad: 0,
        }
    }
}

/// Descriptor bindings of the pass, all compute-stage.
pub fn layout_bindings() -> [vk::DescriptorSetLayoutBinding<'static>; 2] {
    [
        vk::DescriptorSetLayoutBinding::default()
            .binding(GUIDE_BUFFER_BINDING)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::COMPUTE),
        vk::DescriptorSetLayoutBinding::default()
            .binding(TARGET_IMAGE_BINDING)
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::COMPUTE),
    ]
}

/// Pool sizes covering exactly one set of [`layout_bindings`].
pub fn pool_sizes() -> Vec<vk::DescriptorPoolSize> {
    layout_bindings()
        .iter()
        .map(|b| vk::DescriptorPoolSize {
            ty: b.descriptor_type,
            descriptor_count: b.descriptor_count,
        })
        .collect()
}

/// Push constant range carrying [`DenoiseParams`].
pub fn push_constant_range() -> vk::PushConstantRange {
    vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::COMPUTE,
        offset: 0,
        size: std::mem::size_of::<DenoiseParams>() as u32,
    }
}

/// Reject a guide buffer the driver cannot create.
pub fn validate_guide_size(guide_size: u64) -> Result<()> {
    if guide_size == 0 {
        return Err(GpuError::InvalidState(
            "Denoise guide buffer size must be non-zero".to_string(),
        ));
    }
    Ok(())
}

/// Descriptor set, guide buffer and compute pipeline of the pass.
///
/// Handles start out null and are filled in as they are created, so a
/// failure part way through is cleaned up by `Drop` (destroying a null
/// handle is a no-op).
pub struct DenoisePass {
    device: Arc<Device>,
    descriptor_set_layout: vk::DescriptorSetLayout,
    descriptor_pool: vk::DescriptorPool,
    descriptor_set: vk::DescriptorSet,
    guide_buffer: Option<GpuBuffer>,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
}

impl DenoisePass {
    /// Create every resource of the pass.
    ///
    /// `spirv` is the compute shader, entry point `main`. `guide_size` is the
    /// guide buffer size in bytes.
    pub fn new(
        device: Arc<Device>,
        allocator: &SharedAllocator,
        spirv: &[u32],
        guide_size: u64,
    ) -> Result<Self> {
        validate_guide_size(guide_size)?;
        let mut pass = Self {
            device: Arc::clone(&device),
            descriptor_set_layout: vk::DescriptorSetLayout::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_set: vk::DescriptorSet::null(),
            guide_buffer: None,
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
        };
        let raw = device.handle();

        let bindings = layout_bindings();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        // SAFETY: the device is valid while the Arc is held; every handle
        // created below is recorded in `pass` before the next fallible call.
        unsafe {
            pass.descriptor_set_layout = raw
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(|e| pipeline_error("descriptor set layout", e))?;

            let sizes = pool_sizes();
            let pool_info = vk::DescriptorPoolCreateInfo::default()
                .max_sets(1)
                .pool_sizes(&sizes);
            pass.descriptor_pool = raw
                .create_descriptor_pool(&pool_info, None)
                .map_err(|e| pipeline_error("descriptor pool", e))?;

            let set_layouts = [pass.descriptor_set_layout];
            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(pass.descriptor_pool)
                .set_layouts(&set_layouts);
            pass.descriptor_set = raw
                .allocate_descriptor_sets(&alloc_info)
                .map_err(|e| pipeline_error("descriptor set", e))?[0];
        }

        let guide = GpuBuffer::new(
            allocator,
            guide_size,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            "denoise_guide",
        )?;
        let buffer_info = [vk::DescriptorBufferInfo::default()
            .buffer(guide.handle())
            .offset(0)
            .range(vk::WHOLE_SIZE)];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(pass.descriptor_set)
            .dst_binding(GUIDE_BUFFER_BINDING)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(&buffer_info);
        // SAFETY: set and buffer are live and not in use.
        unsafe { raw.update_descriptor_sets(&[write], &[]) };
        pass.guide_buffer = Some(guide);

        let set_layouts = [pass.descriptor_set_layout];
        let push_constants = [push_constant_range()];
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constants);

        // SAFETY: as above.
        unsafe {
            pass.pipeline_layout = raw
                .create_pipeline_layout(&pipeline_layout_info, None)
                .map_err(|e| pipeline_error("pipeline layout", e))?;

            let shader_info = vk::ShaderModuleCreateInfo::default().code(spirv);
            let module = raw
                .create_shader_module(&shader_info, None)
                .map_err(|e| pipeline_error("shader module", e))?;

            let stage = vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::COMPUTE)
                .module(module)
                .name(c"main");
            let pipeline_info = vk::ComputePipelineCreateInfo::default()
                .stage(stage)
                .layout(pass.pipeline_layout);
            let created =
                raw.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None);
            raw.destroy_shader_module(module, None);
            pass.pipeline = created.map_err(|(_, e)| pipeline_error("compute pipeline", e))?[0];
        }

        device.set_object_name(pass.pipeline, c"denoise_pipeline");
        tracing::info!("Denoise pass created ({guide_size} byte guide buffer)");
        Ok(pass)
    }

    /// Point binding 1 at the image to filter, in `GENERAL` layout.
    pub fn bind_target(&self, view: vk::ImageView) {
        let image_info = [vk::DescriptorImageInfo::default()
            .image_view(view)
            .image_layout(vk::ImageLayout::GENERAL)];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.descriptor_set)
            .dst_binding(TARGET_IMAGE_BINDING)
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .image_info(&image_info);
        // SAFETY: the caller does not rebind while the set is in use.
        unsafe { self.device.handle().update_descriptor_sets(&[write], &[]) };
    }

    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.descriptor_set
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    pub fn pipeline(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Guide buffer, if it was created.
    pub fn guide_buffer(&self) -> Option<&GpuBuffer> {
        self.guide_buffer.as_ref()
    }
}

fn pipeline_error(step: &str, result: vk::Result) -> GpuError {
    GpuError::PipelineCreation(format!("denoise {step}: {result}"))
}

impl Drop for DenoisePass {
    fn drop(&mut self) {
        tracing::debug!("Destroying denoise pass");
        // SAFETY: teardown waits for device idle; null handles are ignored.
        unsafe {
            let raw = self.device.handle();
            raw.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
            // Destroying the pool frees the set.
            raw.destroy_descriptor_pool(self.descriptor_pool, None);
            self.guide_buffer = None;
            raw.destroy_pipeline_layout(self.pipeline_layout, None);
            raw.destroy_pipeline(self.pipeline, None);
        }
    }
}
