//! Vulkan backend
//!
//! Renders with Vulkan 1.3 dynamic rendering. All commands go into one
//! command buffer that is submitted when a readback needs the results,
//! or after a fixed number of draws. Every image stays in the `GENERAL`
//! layout, and transfers and draws are separated by full memory barriers.

use std::collections::HashMap;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use op_core::error::VideoError;

use super::pixel::{self, DepthStencil, Texels};
use super::*;
use crate::pica::{BlendEquation, BlendFactor, CompareFunc, StencilAction, TextureFilter, WrapMode};
use crate::shader::glsl::{BINDING_SAMPLERS, BINDING_TEXTURES, BINDING_UNIFORMS};
use crate::shader::spirv::glsl_to_spirv;
use crate::shader::UniformData;

/// Draws recorded before the command buffer is submitted
const MAX_DRAWS_PER_SUBMIT: u32 = 256;

const COLOR_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
const VALIDATION_LAYER: &std::ffi::CStr = c"VK_LAYER_KHRONOS_validation";

fn vk_err(what: &'static str) -> impl Fn(vk::Result) -> VideoError {
    move |e| VideoError::Vulkan(format!("{}: {:?}", what, e))
}

fn alloc_err(e: gpu_allocator::AllocationError) -> VideoError {
    VideoError::Vulkan(format!("allocation failed: {}", e))
}

fn not_initialized() -> VideoError {
    VideoError::Backend("Vulkan backend not initialized".into())
}

struct Buffer {
    buffer: vk::Buffer,
    allocation: Allocation,
}

struct Image {
    image: vk::Image,
    view: vk::ImageView,
    allocation: Allocation,
    format: vk::Format,
    internal: InternalFormat,
    width: u32,
    height: u32,
}

impl Image {
    fn aspect(&self) -> vk::ImageAspectFlags {
        aspect_of(self.internal)
    }
}

fn aspect_of(internal: InternalFormat) -> vk::ImageAspectFlags {
    match internal {
        InternalFormat::Depth24Stencil8 => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
        InternalFormat::Depth16 | InternalFormat::Depth24 => vk::ImageAspectFlags::DEPTH,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

struct Program {
    vertex: vk::ShaderModule,
    fragment: vk::ShaderModule,
}

struct Sampler {
    sampler: vk::Sampler,
    state: SamplerState,
}

/// Objects that may still be in use by submitted work
enum Garbage {
    Buffer(Buffer),
    Image(Image),
    Sampler(vk::Sampler),
    Pipeline(vk::Pipeline),
    ShaderModule(vk::ShaderModule),
}

/// Fixed-function state baked into a pipeline object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PipelineKey {
    program: ProgramHandle,
    blend_enabled: bool,
    blend: BlendFuncs,
    logic_op: Option<LogicOp>,
    color_mask: ColorMask,
    color_format: Option<vk::Format>,
    depth_format: Option<vk::Format>,
    stencil: bool,
}

/// Storage chosen for each host depth format
#[derive(Debug, Clone, Copy)]
struct DepthFormats {
    depth24: vk::Format,
    depth24_stencil8: vk::Format,
}

struct Context {
    _entry: ash::Entry,
    instance: ash::Instance,
    device: ash::Device,
    queue: vk::Queue,
    allocator: Option<Allocator>,
    command_pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
    descriptor_pool: vk::DescriptorPool,
    descriptor_set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    dummy: Option<Image>,
    default_sampler: vk::Sampler,
    depth_formats: DepthFormats,
    logic_op_supported: bool,
    recording: bool,
}

/// Vulkan graphics backend
pub struct VulkanBackend {
    ctx: Option<Context>,
    validation: bool,
    next_handle: u32,
    textures: HashMap<TextureHandle, Option<Image>>,
    samplers: HashMap<SamplerHandle, Sampler>,
    programs: HashMap<ProgramHandle, Program>,
    pipelines: HashMap<PipelineKey, vk::Pipeline>,
    garbage: Vec<Garbage>,
    draws_since_submit: u32,

    program: Option<ProgramHandle>,
    cull: CullState,
    blend_enabled: bool,
    blend_funcs: BlendFuncs,
    blend_color: [f32; 4],
    logic_op: LogicOp,
    stencil: StencilState,
    depth: DepthState,
    color_mask: ColorMask,
    viewport: Viewport,
    framebuffer: FramebufferAttachments,
    units: [(Option<TextureHandle>, Option<SamplerHandle>); 3],
    uniforms: Vec<u8>,
    vertex_buffer: Option<vk::Buffer>,
    vertex_count: u32,
}

impl VulkanBackend {
    pub fn new() -> Self {
        Self::with_validation(false)
    }

    /// Create a backend that enables the Khronos validation layer when available
    pub fn with_validation(validation: bool) -> Self {
        Self {
            ctx: None,
            validation,
            next_handle: 1,
            textures: HashMap::new(),
            samplers: HashMap::new(),
            programs: HashMap::new(),
            pipelines: HashMap::new(),
            garbage: Vec::new(),
            draws_since_submit: 0,
            program: None,
            cull: CullState::default(),
            blend_enabled: false,
            blend_funcs: BlendFuncs::default(),
            blend_color: [0.0; 4],
            logic_op: LogicOp::Copy,
            stencil: StencilState::default(),
            depth: DepthState::default(),
            color_mask: ColorMask::default(),
            viewport: Viewport::default(),
            framebuffer: FramebufferAttachments::default(),
            units: [(None, None); 3],
            uniforms: Vec::new(),
            vertex_buffer: None,
            vertex_count: 0,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.ctx.is_some()
    }

    fn alloc_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn create_instance(entry: &ash::Entry, validation: bool) -> Result<ash::Instance, VideoError> {
        let app_info = vk::ApplicationInfo::default()
            .application_name(c"oxidized-pica")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"oxidized-pica")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut layers = Vec::new();
        if validation {
            let available = unsafe { entry.enumerate_instance_layer_properties() }
                .map_err(vk_err("enumerate instance layers"))?;
            let found = available
                .iter()
                .any(|layer| layer.layer_name_as_c_str().is_ok_and(|name| name == VALIDATION_LAYER));
            if found {
                layers.push(VALIDATION_LAYER.as_ptr());
            } else {
                tracing::warn!("Vulkan validation layer requested but not installed");
            }
        }

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layers);

        unsafe { entry.create_instance(&create_info, None) }.map_err(vk_err("create instance"))
    }

    /// Pick the first Vulkan 1.3 device with dynamic rendering and a graphics queue
    fn select_physical_device(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, u32), VideoError> {
        let devices =
            unsafe { instance.enumerate_physical_devices() }.map_err(vk_err("enumerate physical devices"))?;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            if vk::api_version_minor(props.api_version) < 3 {
                continue;
            }

            let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
            {
                let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut features13);
                unsafe { instance.get_physical_device_features2(device, &mut features) };
            }
            if features13.dynamic_rendering == vk::FALSE {
                continue;
            }

            let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };
            let family = queue_families
                .iter()
                .position(|props| props.queue_flags.contains(vk::QueueFlags::GRAPHICS));
            if let Some(family) = family {
                let name = props.device_name_as_c_str().map(|n| n.to_string_lossy().into_owned());
                tracing::info!("Using Vulkan device {}", name.unwrap_or_default());
                return Ok((device, family as u32));
            }
        }

        Err(VideoError::Vulkan("no Vulkan 1.3 device with dynamic rendering found".into()))
    }

    fn select_depth_formats(instance: &ash::Instance, device: vk::PhysicalDevice) -> DepthFormats {
        let supported = |format| {
            let props = unsafe { instance.get_physical_device_format_properties(device, format) };
            props
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        };
        let pick = |preferred, fallback| if supported(preferred) { preferred } else { fallback };

        DepthFormats {
            depth24: pick(vk::Format::X8_D24_UNORM_PACK32, vk::Format::D32_SFLOAT),
            depth24_stencil8: pick(vk::Format::D24_UNORM_S8_UINT, vk::Format::D32_SFLOAT_S8_UINT),
        }
    }

    fn create_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
        logic_op: bool,
    ) -> Result<(ash::Device, vk::Queue), VideoError> {
        let priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities);

        let features = vk::PhysicalDeviceFeatures::default().logic_op(logic_op);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default().dynamic_rendering(true);
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_info))
            .enabled_features(&features)
            .push_next(&mut features13);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .map_err(vk_err("create device"))?;
        let queue = unsafe { device.get_device_queue(queue_family, 0) };
        Ok((device, queue))
    }

    fn create_descriptor_objects(
        device: &ash::Device,
    ) -> Result<(vk::DescriptorSetLayout, vk::PipelineLayout, vk::DescriptorPool), VideoError> {
        let mut bindings = vec![vk::DescriptorSetLayoutBinding::default()
            .binding(BINDING_UNIFORMS)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)];
        for binding in BINDING_TEXTURES {
            bindings.push(
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::FRAGMENT),
            );
        }
        for binding in BINDING_SAMPLERS {
            bindings.push(
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::SAMPLER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::FRAGMENT),
            );
        }

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let set_layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(vk_err("create descriptor set layout"))?;

        let set_layouts = [set_layout];
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        let pipeline_layout = unsafe { device.create_pipeline_layout(&pipeline_layout_info, None) }
            .map_err(vk_err("create pipeline layout"))?;

        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(MAX_DRAWS_PER_SUBMIT),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(3 * MAX_DRAWS_PER_SUBMIT),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::SAMPLER)
                .descriptor_count(3 * MAX_DRAWS_PER_SUBMIT),
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(MAX_DRAWS_PER_SUBMIT)
            .pool_sizes(&pool_sizes);
        let pool =
            unsafe { device.create_descriptor_pool(&pool_info, None) }.map_err(vk_err("create descriptor pool"))?;

        Ok((set_layout, pipeline_layout, pool))
    }

    fn ctx(&self) -> Result<&Context, VideoError> {
        self.ctx.as_ref().ok_or_else(not_initialized)
    }

    /// Command buffer in the recording state
    fn recording_cmd(&mut self) -> Result<vk::CommandBuffer, VideoError> {
        let ctx = self.ctx.as_mut().ok_or_else(not_initialized)?;
        if !ctx.recording {
            let begin = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { ctx.device.begin_command_buffer(ctx.cmd, &begin) }.map_err(vk_err("begin command buffer"))?;
            ctx.recording = true;
        }
        Ok(ctx.cmd)
    }

    /// Submit recorded work, wait for it and release retired objects
    fn submit_and_wait(&mut self) -> Result<(), VideoError> {
        let ctx = self.ctx.as_mut().ok_or_else(not_initialized)?;
        if ctx.recording {
            unsafe {
                ctx.device
                    .end_command_buffer(ctx.cmd)
                    .map_err(vk_err("end command buffer"))?;
                let cmds = [ctx.cmd];
                let submit = vk::SubmitInfo::default().command_buffers(&cmds);
                ctx.device
                    .queue_submit(ctx.queue, &[submit], ctx.fence)
                    .map_err(vk_err("queue submit"))?;
                ctx.device
                    .wait_for_fences(&[ctx.fence], true, u64::MAX)
                    .map_err(vk_err("wait for fence"))?;
                ctx.device.reset_fences(&[ctx.fence]).map_err(vk_err("reset fence"))?;
                ctx.device
                    .reset_command_buffer(ctx.cmd, vk::CommandBufferResetFlags::empty())
                    .map_err(vk_err("reset command buffer"))?;
                ctx.device
                    .reset_descriptor_pool(ctx.descriptor_pool, vk::DescriptorPoolResetFlags::empty())
                    .map_err(vk_err("reset descriptor pool"))?;
            }
            ctx.recording = false;
        }

        self.draws_since_submit = 0;
        self.vertex_buffer = None;
        self.vertex_count = 0;
        let garbage = std::mem::take(&mut self.garbage);
        for item in garbage {
            Self::destroy(ctx, item);
        }
        Ok(())
    }

    fn destroy(ctx: &mut Context, item: Garbage) {
        let device = &ctx.device;
        let free = |allocator: &mut Option<Allocator>, allocation: Allocation| {
            if let Some(allocator) = allocator {
                if let Err(e) = allocator.free(allocation) {
                    tracing::error!("Failed to free GPU memory: {}", e);
                }
            }
        };
        unsafe {
            match item {
                Garbage::Buffer(buffer) => {
                    device.destroy_buffer(buffer.buffer, None);
                    free(&mut ctx.allocator, buffer.allocation);
                }
                Garbage::Image(image) => {
                    device.destroy_image_view(image.view, None);
                    device.destroy_image(image.image, None);
                    free(&mut ctx.allocator, image.allocation);
                }
                Garbage::Sampler(sampler) => device.destroy_sampler(sampler, None),
                Garbage::Pipeline(pipeline) => device.destroy_pipeline(pipeline, None),
                Garbage::ShaderModule(module) => device.destroy_shader_module(module, None),
            }
        }
    }

    fn create_buffer(
        &mut self,
        size: usize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Buffer, VideoError> {
        let ctx = self.ctx.as_mut().ok_or_else(not_initialized)?;
        let allocator = ctx.allocator.as_mut().ok_or_else(not_initialized)?;

        let info = vk::BufferCreateInfo::default()
            .size(size.max(4) as u64)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { ctx.device.create_buffer(&info, None) }.map_err(vk_err("create buffer"))?;
        let requirements = unsafe { ctx.device.get_buffer_memory_requirements(buffer) };

        let allocation = match allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { ctx.device.destroy_buffer(buffer, None) };
                return Err(alloc_err(e));
            }
        };

        let bound = unsafe { ctx.device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) };
        let buffer = Buffer { buffer, allocation };
        if let Err(e) = bound {
            Self::destroy(ctx, Garbage::Buffer(buffer));
            return Err(vk_err("bind buffer memory")(e));
        }
        Ok(buffer)
    }

    /// Host-visible buffer holding `data`, released after the next submission
    fn staging_buffer(&mut self, data: &[u8], usage: vk::BufferUsageFlags, name: &str) -> Result<vk::Buffer, VideoError> {
        let mut buffer = self.create_buffer(data.len(), usage, MemoryLocation::CpuToGpu, name)?;
        let written = match buffer.allocation.mapped_slice_mut() {
            Some(mapped) => {
                mapped[..data.len()].copy_from_slice(data);
                true
            }
            None => false,
        };
        let handle = buffer.buffer;
        self.garbage.push(Garbage::Buffer(buffer));
        if !written {
            return Err(VideoError::Vulkan(format!("{} is not host visible", name)));
        }
        Ok(handle)
    }

    fn vk_format(&self, internal: InternalFormat) -> Result<vk::Format, VideoError> {
        let formats = self.ctx()?.depth_formats;
        Ok(match internal {
            InternalFormat::Depth16 => vk::Format::D16_UNORM,
            InternalFormat::Depth24 => formats.depth24,
            InternalFormat::Depth24Stencil8 => formats.depth24_stencil8,
            _ => COLOR_FORMAT,
        })
    }

    fn create_image(&mut self, width: u32, height: u32, internal: InternalFormat) -> Result<Image, VideoError> {
        let format = self.vk_format(internal)?;
        let ctx = self.ctx.as_mut().ok_or_else(not_initialized)?;
        let allocator = ctx.allocator.as_mut().ok_or_else(not_initialized)?;

        let attachment = if internal.is_depth() {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        } else {
            vk::ImageUsageFlags::COLOR_ATTACHMENT
        };
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                attachment
                    | vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { ctx.device.create_image(&info, None) }.map_err(vk_err("create image"))?;
        let requirements = unsafe { ctx.device.get_image_memory_requirements(image) };

        let allocation = match allocator.allocate(&AllocationCreateDesc {
            name: "surface",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { ctx.device.destroy_image(image, None) };
                return Err(alloc_err(e));
            }
        };
        if let Err(e) = unsafe { ctx.device.bind_image_memory(image, allocation.memory(), allocation.offset()) } {
            unsafe { ctx.device.destroy_image(image, None) };
            if let Some(allocator) = ctx.allocator.as_mut() {
                let _ = allocator.free(allocation);
            }
            return Err(vk_err("bind image memory")(e));
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(subresource_range(aspect_of(internal)));
        let view = match unsafe { ctx.device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                unsafe { ctx.device.destroy_image(image, None) };
                if let Some(allocator) = ctx.allocator.as_mut() {
                    let _ = allocator.free(allocation);
                }
                return Err(vk_err("create image view")(e));
            }
        };

        let image = Image {
            image,
            view,
            allocation,
            format,
            internal,
            width,
            height,
        };

        let cmd = self.recording_cmd()?;
        let ctx = self.ctx()?;
        let barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::GENERAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image.image)
            .subresource_range(subresource_range(image.aspect()));
        unsafe {
            ctx.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
        Ok(image)
    }

    fn full_barrier(&mut self) -> Result<(), VideoError> {
        let cmd = self.recording_cmd()?;
        let ctx = self.ctx()?;
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE);
        unsafe {
            ctx.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
        Ok(())
    }

    /// Copy regions between a buffer laid out as `encode_texels` produces and an image
    fn copy_regions(image: &Image) -> Vec<vk::BufferImageCopy> {
        let region = |offset: u64, aspect| {
            vk::BufferImageCopy::default()
                .buffer_offset(offset)
                .image_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(aspect)
                        .mip_level(0)
                        .base_array_layer(0)
                        .layer_count(1),
                )
                .image_extent(vk::Extent3D {
                    width: image.width,
                    height: image.height,
                    depth: 1,
                })
        };
        let texels = (image.width * image.height) as u64;
        match image.internal {
            InternalFormat::Depth24Stencil8 => vec![
                region(0, vk::ImageAspectFlags::DEPTH),
                region(4 * texels, vk::ImageAspectFlags::STENCIL),
            ],
            InternalFormat::Depth16 | InternalFormat::Depth24 => vec![region(0, vk::ImageAspectFlags::DEPTH)],
            _ => vec![region(0, vk::ImageAspectFlags::COLOR)],
        }
    }

    fn get_or_create_pipeline(&mut self, key: PipelineKey) -> Result<vk::Pipeline, VideoError> {
        if let Some(&pipeline) = self.pipelines.get(&key) {
            return Ok(pipeline);
        }
        let program = self
            .programs
            .get(&key.program)
            .ok_or_else(|| VideoError::Backend(format!("unknown program {}", key.program.0)))?;
        let ctx = self.ctx()?;
        tracing::debug!("Creating pipeline for program {}", key.program.0);

        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(program.vertex)
                .name(c"main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(program.fragment)
                .name(c"main"),
        ];

        let bindings = [vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(std::mem::size_of::<HardwareVertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)];
        let attribute = |location, format, offset: usize| {
            vk::VertexInputAttributeDescription::default()
                .location(location)
                .binding(0)
                .format(format)
                .offset(offset as u32)
        };
        let attributes = [
            attribute(0, vk::Format::R32G32B32A32_SFLOAT, std::mem::offset_of!(HardwareVertex, position)),
            attribute(1, vk::Format::R32G32B32A32_SFLOAT, std::mem::offset_of!(HardwareVertex, color)),
            attribute(2, vk::Format::R32G32_SFLOAT, std::mem::offset_of!(HardwareVertex, tex_coord0)),
            attribute(3, vk::Format::R32G32_SFLOAT, std::mem::offset_of!(HardwareVertex, tex_coord1)),
            attribute(4, vk::Format::R32G32_SFLOAT, std::mem::offset_of!(HardwareVertex, tex_coord2)),
        ];
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);
        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(vk::PrimitiveTopology::TRIANGLE_LIST);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0);
        let multisample =
            vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default();

        let mut write_mask = vk::ColorComponentFlags::empty();
        for (enabled, flag) in [
            (key.color_mask.red, vk::ColorComponentFlags::R),
            (key.color_mask.green, vk::ColorComponentFlags::G),
            (key.color_mask.blue, vk::ColorComponentFlags::B),
            (key.color_mask.alpha, vk::ColorComponentFlags::A),
        ] {
            if enabled {
                write_mask |= flag;
            }
        }
        let blend_attachment = vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(key.blend_enabled)
            .src_color_blend_factor(blend_factor(key.blend.src_rgb))
            .dst_color_blend_factor(blend_factor(key.blend.dst_rgb))
            .color_blend_op(blend_op(key.blend.equation_rgb))
            .src_alpha_blend_factor(blend_factor(key.blend.src_a))
            .dst_alpha_blend_factor(blend_factor(key.blend.dst_a))
            .alpha_blend_op(blend_op(key.blend.equation_a))
            .color_write_mask(write_mask);
        let blend_attachments: &[vk::PipelineColorBlendAttachmentState] = if key.color_format.is_some() {
            std::slice::from_ref(&blend_attachment)
        } else {
            &[]
        };
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(key.logic_op.is_some())
            .logic_op(key.logic_op.map_or(vk::LogicOp::COPY, logic_op))
            .attachments(blend_attachments);

        let dynamic_states = [
            vk::DynamicState::VIEWPORT,
            vk::DynamicState::SCISSOR,
            vk::DynamicState::BLEND_CONSTANTS,
            vk::DynamicState::CULL_MODE,
            vk::DynamicState::FRONT_FACE,
            vk::DynamicState::DEPTH_TEST_ENABLE,
            vk::DynamicState::DEPTH_WRITE_ENABLE,
            vk::DynamicState::DEPTH_COMPARE_OP,
            vk::DynamicState::STENCIL_TEST_ENABLE,
            vk::DynamicState::STENCIL_OP,
            vk::DynamicState::STENCIL_COMPARE_MASK,
            vk::DynamicState::STENCIL_WRITE_MASK,
            vk::DynamicState::STENCIL_REFERENCE,
        ];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats: Vec<vk::Format> = key.color_format.into_iter().collect();
        let mut rendering = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(key.depth_format.unwrap_or(vk::Format::UNDEFINED))
            .stencil_attachment_format(if key.stencil {
                key.depth_format.unwrap_or(vk::Format::UNDEFINED)
            } else {
                vk::Format::UNDEFINED
            });

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(ctx.pipeline_layout)
            .push_next(&mut rendering);

        let pipelines =
            unsafe { ctx.device.create_graphics_pipelines(vk::PipelineCache::null(), &[info], None) }
                .map_err(|(_, e)| vk_err("create graphics pipeline")(e))?;
        let pipeline = pipelines
            .into_iter()
            .next()
            .ok_or_else(|| VideoError::Vulkan("no pipeline returned".into()))?;
        self.pipelines.insert(key, pipeline);
        Ok(pipeline)
    }

    fn image(&self, texture: TextureHandle) -> Option<&Image> {
        self.textures.get(&texture).and_then(|t| t.as_ref())
    }

    fn write_descriptor_set(&mut self) -> Result<vk::DescriptorSet, VideoError> {
        let uniform_data = if self.uniforms.is_empty() {
            vec![0u8; std::mem::size_of::<UniformData>()]
        } else {
            self.uniforms.clone()
        };
        let uniform_buffer = self.staging_buffer(&uniform_data, vk::BufferUsageFlags::UNIFORM_BUFFER, "uniforms")?;

        let ctx = self.ctx()?;
        let layouts = [ctx.descriptor_set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(ctx.descriptor_pool)
            .set_layouts(&layouts);
        let set = unsafe { ctx.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(vk_err("allocate descriptor set"))?
            .into_iter()
            .next()
            .ok_or_else(|| VideoError::Vulkan("no descriptor set returned".into()))?;

        let dummy_view = ctx.dummy.as_ref().map(|d| d.view).unwrap_or_default();
        let buffer_info = [vk::DescriptorBufferInfo::default()
            .buffer(uniform_buffer)
            .offset(0)
            .range(vk::WHOLE_SIZE)];
        let image_infos: Vec<[vk::DescriptorImageInfo; 1]> = self
            .units
            .iter()
            .map(|(texture, _)| {
                let view = texture
                    .and_then(|t| self.image(t))
                    .filter(|image| !image.internal.is_depth())
                    .map_or(dummy_view, |image| image.view);
                [vk::DescriptorImageInfo::default()
                    .image_view(view)
                    .image_layout(vk::ImageLayout::GENERAL)]
            })
            .collect();
        let sampler_infos: Vec<[vk::DescriptorImageInfo; 1]> = self
            .units
            .iter()
            .map(|(_, sampler)| {
                let sampler = sampler
                    .and_then(|s| self.samplers.get(&s))
                    .map_or(ctx.default_sampler, |s| s.sampler);
                [vk::DescriptorImageInfo::default().sampler(sampler)]
            })
            .collect();

        let mut writes = vec![vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(BINDING_UNIFORMS)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&buffer_info)];
        for (info, binding) in image_infos.iter().zip(BINDING_TEXTURES) {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(binding)
                    .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                    .image_info(info),
            );
        }
        for (info, binding) in sampler_infos.iter().zip(BINDING_SAMPLERS) {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(binding)
                    .descriptor_type(vk::DescriptorType::SAMPLER)
                    .image_info(info),
            );
        }
        unsafe { ctx.device.update_descriptor_sets(&writes, &[]) };
        Ok(set)
    }

    fn retire_image(&mut self, image: Image) {
        self.garbage.push(Garbage::Image(image));
    }
}

impl Default for VulkanBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn subresource_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(aspect)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
}

fn depth_to_f32(depth: u32) -> [u8; 4] {
    ((depth as f64 / 0xFF_FFFF as f64) as f32).to_le_bytes()
}

fn f32_to_depth(bytes: [u8; 4]) -> u32 {
    (f32::from_le_bytes(bytes) as f64 * 0xFF_FFFF as f64).round().clamp(0.0, 0xFF_FFFF as f64) as u32
}

/// Texels in the byte layout the image format expects from a buffer copy.
/// Combined depth/stencil images take all depth values followed by all stencil bytes.
fn encode_texels(format: vk::Format, texels: &Texels) -> Result<Vec<u8>, VideoError> {
    match texels {
        Texels::Color(t) => Ok(t.iter().flatten().copied().collect()),
        Texels::DepthStencil(t) => {
            let depth: Vec<u8> = match format {
                vk::Format::D16_UNORM => t.iter().flat_map(|d| ((d.depth >> 8) as u16).to_le_bytes()).collect(),
                vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D24_UNORM_S8_UINT => {
                    t.iter().flat_map(|d| (d.depth & 0xFF_FFFF).to_le_bytes()).collect()
                }
                vk::Format::D32_SFLOAT | vk::Format::D32_SFLOAT_S8_UINT => {
                    t.iter().flat_map(|d| depth_to_f32(d.depth)).collect()
                }
                other => return Err(VideoError::Vulkan(format!("unexpected depth format {:?}", other))),
            };
            let mut out = depth;
            if matches!(format, vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT) {
                out.extend(t.iter().map(|d| d.stencil));
            }
            Ok(out)
        }
    }
}

/// Inverse of [`encode_texels`]
fn decode_texels(format: vk::Format, internal: InternalFormat, data: &[u8], count: usize) -> Result<Texels, VideoError> {
    if !internal.is_depth() {
        return Ok(Texels::Color(
            data.chunks_exact(4).take(count).map(|c| [c[0], c[1], c[2], c[3]]).collect(),
        ));
    }

    let depth: Vec<u32> = match format {
        vk::Format::D16_UNORM => data
            .chunks_exact(2)
            .take(count)
            .map(|c| pixel::d16_to_d24(u16::from_le_bytes([c[0], c[1]])))
            .collect(),
        vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D24_UNORM_S8_UINT => data
            .chunks_exact(4)
            .take(count)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) & 0xFF_FFFF)
            .collect(),
        vk::Format::D32_SFLOAT | vk::Format::D32_SFLOAT_S8_UINT => data
            .chunks_exact(4)
            .take(count)
            .map(|c| f32_to_depth([c[0], c[1], c[2], c[3]]))
            .collect(),
        other => return Err(VideoError::Vulkan(format!("unexpected depth format {:?}", other))),
    };
    let stencil = if internal.has_stencil() {
        data.get(4 * count..5 * count)
            .ok_or_else(|| VideoError::Vulkan("short stencil readback".into()))?
    } else {
        &[]
    };

    Ok(Texels::DepthStencil(
        depth
            .into_iter()
            .enumerate()
            .map(|(i, depth)| DepthStencil {
                depth,
                stencil: stencil.get(i).copied().unwrap_or(0),
            })
            .collect(),
    ))
}

fn readback_size(format: vk::Format, count: usize) -> usize {
    match format {
        vk::Format::D16_UNORM => 2 * count,
        vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => 5 * count,
        _ => 4 * count,
    }
}

fn blend_factor(factor: BlendFactor) -> vk::BlendFactor {
    match factor {
        BlendFactor::Zero => vk::BlendFactor::ZERO,
        BlendFactor::One => vk::BlendFactor::ONE,
        BlendFactor::SourceColor => vk::BlendFactor::SRC_COLOR,
        BlendFactor::OneMinusSourceColor => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
        BlendFactor::DestColor => vk::BlendFactor::DST_COLOR,
        BlendFactor::OneMinusDestColor => vk::BlendFactor::ONE_MINUS_DST_COLOR,
        BlendFactor::SourceAlpha => vk::BlendFactor::SRC_ALPHA,
        BlendFactor::OneMinusSourceAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        BlendFactor::DestAlpha => vk::BlendFactor::DST_ALPHA,
        BlendFactor::OneMinusDestAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
        BlendFactor::ConstantColor => vk::BlendFactor::CONSTANT_COLOR,
        BlendFactor::OneMinusConstantColor => vk::BlendFactor::ONE_MINUS_CONSTANT_COLOR,
        BlendFactor::ConstantAlpha => vk::BlendFactor::CONSTANT_ALPHA,
        BlendFactor::OneMinusConstantAlpha => vk::BlendFactor::ONE_MINUS_CONSTANT_ALPHA,
        BlendFactor::SourceAlphaSaturate => vk::BlendFactor::SRC_ALPHA_SATURATE,
    }
}

fn blend_op(equation: BlendEquation) -> vk::BlendOp {
    match equation {
        BlendEquation::Add => vk::BlendOp::ADD,
        BlendEquation::Subtract => vk::BlendOp::SUBTRACT,
        BlendEquation::ReverseSubtract => vk::BlendOp::REVERSE_SUBTRACT,
        BlendEquation::Min => vk::BlendOp::MIN,
        BlendEquation::Max => vk::BlendOp::MAX,
    }
}

fn logic_op(op: LogicOp) -> vk::LogicOp {
    match op {
        LogicOp::Clear => vk::LogicOp::CLEAR,
        LogicOp::And => vk::LogicOp::AND,
        LogicOp::AndReverse => vk::LogicOp::AND_REVERSE,
        LogicOp::Copy => vk::LogicOp::COPY,
        LogicOp::Set => vk::LogicOp::SET,
        LogicOp::CopyInverted => vk::LogicOp::COPY_INVERTED,
        LogicOp::NoOp => vk::LogicOp::NO_OP,
        LogicOp::Invert => vk::LogicOp::INVERT,
        LogicOp::Nand => vk::LogicOp::NAND,
        LogicOp::Or => vk::LogicOp::OR,
        LogicOp::Nor => vk::LogicOp::NOR,
        LogicOp::Xor => vk::LogicOp::XOR,
        LogicOp::Equiv => vk::LogicOp::EQUIVALENT,
        LogicOp::AndInverted => vk::LogicOp::AND_INVERTED,
        LogicOp::OrReverse => vk::LogicOp::OR_REVERSE,
        LogicOp::OrInverted => vk::LogicOp::OR_INVERTED,
    }
}

fn compare_op(func: CompareFunc) -> vk::CompareOp {
    match func {
        CompareFunc::Never => vk::CompareOp::NEVER,
        CompareFunc::Always => vk::CompareOp::ALWAYS,
        CompareFunc::Equal => vk::CompareOp::EQUAL,
        CompareFunc::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareFunc::LessThan => vk::CompareOp::LESS,
        CompareFunc::LessThanOrEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareFunc::GreaterThan => vk::CompareOp::GREATER,
        CompareFunc::GreaterThanOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
    }
}

fn stencil_op(action: StencilAction) -> vk::StencilOp {
    match action {
        StencilAction::Keep => vk::StencilOp::KEEP,
        StencilAction::Zero => vk::StencilOp::ZERO,
        StencilAction::Replace => vk::StencilOp::REPLACE,
        StencilAction::Increment => vk::StencilOp::INCREMENT_AND_CLAMP,
        StencilAction::Decrement => vk::StencilOp::DECREMENT_AND_CLAMP,
        StencilAction::Invert => vk::StencilOp::INVERT,
        StencilAction::IncrementWrap => vk::StencilOp::INCREMENT_AND_WRAP,
        StencilAction::DecrementWrap => vk::StencilOp::DECREMENT_AND_WRAP,
    }
}

fn filter(filter: TextureFilter) -> vk::Filter {
    match filter {
        TextureFilter::Nearest => vk::Filter::NEAREST,
        TextureFilter::Linear => vk::Filter::LINEAR,
    }
}

fn address_mode(mode: WrapMode) -> vk::SamplerAddressMode {
    match mode {
        WrapMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        WrapMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
        WrapMode::Repeat => vk::SamplerAddressMode::REPEAT,
        WrapMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
    }
}

/// Closest fixed border color. Arbitrary border colors need an extension.
fn border_color(color: u32) -> vk::BorderColor {
    let [r, g, b, a] = color.to_le_bytes();
    if a < 0x80 {
        vk::BorderColor::FLOAT_TRANSPARENT_BLACK
    } else if (r as u32 + g as u32 + b as u32) < 3 * 0x80 {
        vk::BorderColor::FLOAT_OPAQUE_BLACK
    } else {
        vk::BorderColor::FLOAT_OPAQUE_WHITE
    }
}

fn create_vk_sampler(device: &ash::Device, state: &SamplerState) -> Result<vk::Sampler, VideoError> {
    let info = vk::SamplerCreateInfo::default()
        .mag_filter(filter(state.mag_filter))
        .min_filter(filter(state.min_filter))
        .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
        .address_mode_u(address_mode(state.wrap_s))
        .address_mode_v(address_mode(state.wrap_t))
        .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .max_lod(0.0)
        .border_color(border_color(state.border_color));
    unsafe { device.create_sampler(&info, None) }.map_err(vk_err("create sampler"))
}

impl GraphicsBackend for VulkanBackend {
    fn init(&mut self) -> Result<(), VideoError> {
        if self.ctx.is_some() {
            return Ok(());
        }
        tracing::info!("Initializing Vulkan backend");

        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| VideoError::Vulkan(format!("failed to load Vulkan library: {}", e)))?;
        let instance = Self::create_instance(&entry, self.validation)?;

        let setup = (|| {
            let (physical_device, queue_family) = Self::select_physical_device(&instance)?;
            let supported = unsafe { instance.get_physical_device_features(physical_device) };
            let logic_op_supported = supported.logic_op == vk::TRUE;
            let depth_formats = Self::select_depth_formats(&instance, physical_device);
            let (device, queue) = Self::create_device(&instance, physical_device, queue_family, logic_op_supported)?;
            Ok::<_, VideoError>((physical_device, queue_family, logic_op_supported, depth_formats, device, queue))
        })();
        let (physical_device, queue_family, logic_op_supported, depth_formats, device, queue) = match setup {
            Ok(setup) => setup,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(alloc_err);

        let objects = allocator.and_then(|allocator| unsafe {
            let pool_info = vk::CommandPoolCreateInfo::default()
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                .queue_family_index(queue_family);
            let command_pool = device
                .create_command_pool(&pool_info, None)
                .map_err(vk_err("create command pool"))?;
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cmd = device
                .allocate_command_buffers(&alloc_info)
                .map_err(vk_err("allocate command buffer"))?[0];
            let fence = device
                .create_fence(&vk::FenceCreateInfo::default(), None)
                .map_err(vk_err("create fence"))?;
            let (descriptor_set_layout, pipeline_layout, descriptor_pool) = Self::create_descriptor_objects(&device)?;
            let default_sampler = create_vk_sampler(&device, &SamplerState::default())?;
            Ok((allocator, command_pool, cmd, fence, descriptor_set_layout, pipeline_layout, descriptor_pool, default_sampler))
        });
        let (allocator, command_pool, cmd, fence, descriptor_set_layout, pipeline_layout, descriptor_pool, default_sampler) =
            match objects {
                Ok(objects) => objects,
                Err(e) => {
                    unsafe {
                        let _ = device.device_wait_idle();
                        device.destroy_device(None);
                        instance.destroy_instance(None);
                    }
                    return Err(e);
                }
            };

        self.ctx = Some(Context {
            _entry: entry,
            instance,
            device,
            queue,
            allocator: Some(allocator),
            command_pool,
            cmd,
            fence,
            descriptor_pool,
            descriptor_set_layout,
            pipeline_layout,
            dummy: None,
            default_sampler,
            depth_formats,
            logic_op_supported,
            recording: false,
        });

        // 1x1 black texture for units without a usable texture
        let dummy = self.create_image(1, 1, InternalFormat::Rgba8)?;
        let cmd = self.recording_cmd()?;
        let ctx = self.ctx.as_mut().ok_or_else(not_initialized)?;
        unsafe {
            ctx.device.cmd_clear_color_image(
                cmd,
                dummy.image,
                vk::ImageLayout::GENERAL,
                &vk::ClearColorValue { float32: [0.0; 4] },
                &[subresource_range(vk::ImageAspectFlags::COLOR)],
            );
        }
        ctx.dummy = Some(dummy);
        self.submit_and_wait()?;

        tracing::info!("Vulkan backend initialized");
        Ok(())
    }

    fn shutdown(&mut self) {
        if self.ctx.is_none() {
            return;
        }
        tracing::info!("Shutting down Vulkan backend");

        if let Err(e) = self.submit_and_wait() {
            tracing::error!("Failed to finish pending work: {}", e);
        }

        let mut retired: Vec<Garbage> = Vec::new();
        retired.extend(self.textures.drain().filter_map(|(_, image)| image).map(Garbage::Image));
        retired.extend(self.samplers.drain().map(|(_, s)| Garbage::Sampler(s.sampler)));
        for (_, program) in self.programs.drain() {
            retired.push(Garbage::ShaderModule(program.vertex));
            retired.push(Garbage::ShaderModule(program.fragment));
        }
        retired.extend(self.pipelines.drain().map(|(_, p)| Garbage::Pipeline(p)));

        let Some(mut ctx) = self.ctx.take() else {
            return;
        };
        unsafe {
            let _ = ctx.device.device_wait_idle();
        }
        if let Some(dummy) = ctx.dummy.take() {
            retired.push(Garbage::Image(dummy));
        }
        for item in retired {
            Self::destroy(&mut ctx, item);
        }

        // The allocator must go before the device
        drop(ctx.allocator.take());
        unsafe {
            ctx.device.destroy_sampler(ctx.default_sampler, None);
            ctx.device.destroy_descriptor_pool(ctx.descriptor_pool, None);
            ctx.device.destroy_pipeline_layout(ctx.pipeline_layout, None);
            ctx.device.destroy_descriptor_set_layout(ctx.descriptor_set_layout, None);
            ctx.device.destroy_fence(ctx.fence, None);
            ctx.device.destroy_command_pool(ctx.command_pool, None);
            ctx.device.destroy_device(None);
            ctx.instance.destroy_instance(None);
        }

        self.vertex_buffer = None;
        self.framebuffer = FramebufferAttachments::default();
        self.program = None;
        tracing::info!("Vulkan backend shut down");
    }

    fn create_texture(&mut self) -> Result<TextureHandle, VideoError> {
        self.ctx()?;
        let handle = TextureHandle(self.alloc_handle());
        self.textures.insert(handle, None);
        Ok(handle)
    }

    fn delete_texture(&mut self, texture: TextureHandle) {
        if let Some(Some(image)) = self.textures.remove(&texture) {
            self.retire_image(image);
        }
    }

    fn upload_texture(
        &mut self,
        texture: TextureHandle,
        width: u32,
        height: u32,
        format: &HostFormat,
        data: &[u8],
    ) -> Result<(), VideoError> {
        if !self.textures.contains_key(&texture) {
            return Err(VideoError::Backend(format!("unknown texture {}", texture.0)));
        }
        let count = (width * height) as usize;
        let texels = pixel::store(format.internal, pixel::unpack(format, data, count)?)?;

        let reusable = self
            .image(texture)
            .is_some_and(|i| i.width == width && i.height == height && i.internal == format.internal);
        if !reusable {
            let image = self.create_image(width, height, format.internal)?;
            if let Some(Some(old)) = self.textures.insert(texture, Some(image)) {
                self.retire_image(old);
            }
        }
        if count == 0 {
            return Ok(());
        }

        let (vk_format, regions, dst) = match self.image(texture) {
            Some(image) => (image.format, Self::copy_regions(image), image.image),
            None => return Err(VideoError::Backend(format!("texture {} has no storage", texture.0))),
        };
        let bytes = encode_texels(vk_format, &texels)?;
        let staging = self.staging_buffer(&bytes, vk::BufferUsageFlags::TRANSFER_SRC, "texture upload")?;

        self.full_barrier()?;
        let cmd = self.recording_cmd()?;
        let ctx = self.ctx()?;
        unsafe {
            ctx.device
                .cmd_copy_buffer_to_image(cmd, staging, dst, vk::ImageLayout::GENERAL, &regions);
        }
        self.full_barrier()
    }

    fn download_texture(&mut self, texture: TextureHandle, format: &HostFormat) -> Result<Vec<u8>, VideoError> {
        let (vk_format, internal, regions, src, count) = match self.image(texture) {
            Some(image) => (
                image.format,
                image.internal,
                Self::copy_regions(image),
                image.image,
                (image.width * image.height) as usize,
            ),
            None => return Err(VideoError::Backend(format!("texture {} has no storage", texture.0))),
        };
        if format.internal.is_depth() != internal.is_depth() {
            return Err(VideoError::InvalidPixelTransfer(format!(
                "cannot read {:?} storage as {:?}",
                internal, format.internal
            )));
        }

        let size = readback_size(vk_format, count);
        let readback = self.create_buffer(size, vk::BufferUsageFlags::TRANSFER_DST, MemoryLocation::GpuToCpu, "readback")?;
        let readback_handle = readback.buffer;
        self.garbage.push(Garbage::Buffer(readback));

        self.full_barrier()?;
        let cmd = self.recording_cmd()?;
        {
            let ctx = self.ctx()?;
            unsafe {
                ctx.device
                    .cmd_copy_image_to_buffer(cmd, src, vk::ImageLayout::GENERAL, readback_handle, &regions);
            }
        }
        self.full_barrier()?;

        // Keep the readback buffer alive across the submission
        let readback = match self.garbage.iter().position(|g| matches!(g, Garbage::Buffer(b) if b.buffer == readback_handle)) {
            Some(index) => self.garbage.swap_remove(index),
            None => return Err(VideoError::Backend("readback buffer lost".into())),
        };
        let waited = self.submit_and_wait();
        let data = match &readback {
            Garbage::Buffer(buffer) => buffer.allocation.mapped_slice().map(|m| m[..size].to_vec()),
            _ => None,
        };
        if let Some(ctx) = self.ctx.as_mut() {
            Self::destroy(ctx, readback);
        }
        waited?;

        let data = data.ok_or_else(|| VideoError::Vulkan("readback buffer is not host visible".into()))?;
        let texels = decode_texels(vk_format, internal, &data, count)?;
        pixel::pack(format, &texels)
    }

    fn create_sampler(&mut self) -> Result<SamplerHandle, VideoError> {
        let state = SamplerState::default();
        let sampler = create_vk_sampler(&self.ctx()?.device, &state)?;
        let handle = SamplerHandle(self.alloc_handle());
        self.samplers.insert(handle, Sampler { sampler, state });
        Ok(handle)
    }

    fn set_sampler_state(&mut self, sampler: SamplerHandle, state: &SamplerState) {
        let Some(current) = self.samplers.get(&sampler) else {
            tracing::warn!("set_sampler_state on unknown sampler {}", sampler.0);
            return;
        };
        if current.state == *state {
            return;
        }
        let created = match self.ctx() {
            Ok(ctx) => create_vk_sampler(&ctx.device, state),
            Err(e) => Err(e),
        };
        match created {
            Ok(new) => {
                if let Some(entry) = self.samplers.get_mut(&sampler) {
                    let old = std::mem::replace(entry, Sampler { sampler: new, state: *state });
                    self.garbage.push(Garbage::Sampler(old.sampler));
                }
            }
            Err(e) => tracing::error!("Failed to update sampler {}: {}", sampler.0, e),
        }
    }

    fn create_program(&mut self, vertex_source: &str, fragment_source: &str) -> Result<ProgramHandle, VideoError> {
        let vertex_code = glsl_to_spirv(vertex_source, naga::ShaderStage::Vertex)?;
        let fragment_code = glsl_to_spirv(fragment_source, naga::ShaderStage::Fragment)?;

        let ctx = self.ctx()?;
        let create = |code: &[u32]| {
            let info = vk::ShaderModuleCreateInfo::default().code(code);
            unsafe { ctx.device.create_shader_module(&info, None) }.map_err(vk_err("create shader module"))
        };
        let vertex = create(&vertex_code)?;
        let fragment = match create(&fragment_code) {
            Ok(module) => module,
            Err(e) => {
                unsafe { ctx.device.destroy_shader_module(vertex, None) };
                return Err(e);
            }
        };

        let handle = ProgramHandle(self.alloc_handle());
        self.programs.insert(handle, Program { vertex, fragment });
        Ok(handle)
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        if let Some(removed) = self.programs.remove(&program) {
            self.garbage.push(Garbage::ShaderModule(removed.vertex));
            self.garbage.push(Garbage::ShaderModule(removed.fragment));
        }
        let stale: Vec<PipelineKey> = self.pipelines.keys().filter(|k| k.program == program).copied().collect();
        for key in stale {
            if let Some(pipeline) = self.pipelines.remove(&key) {
                self.garbage.push(Garbage::Pipeline(pipeline));
            }
        }
        if self.program == Some(program) {
            self.program = None;
        }
    }

    fn use_program(&mut self, program: Option<ProgramHandle>) {
        self.program = program;
    }

    fn set_cull_state(&mut self, state: &CullState) {
        self.cull = *state;
    }

    fn set_blend_enabled(&mut self, enabled: bool) {
        self.blend_enabled = enabled;
    }

    fn set_blend_funcs(&mut self, funcs: &BlendFuncs) {
        self.blend_funcs = *funcs;
    }

    fn set_blend_color(&mut self, color: [f32; 4]) {
        self.blend_color = color;
    }

    fn set_logic_op(&mut self, op: LogicOp) {
        self.logic_op = op;
    }

    fn set_stencil_state(&mut self, state: &StencilState) {
        self.stencil = *state;
    }

    fn set_depth_state(&mut self, state: &DepthState) {
        self.depth = *state;
    }

    fn set_color_mask(&mut self, mask: &ColorMask) {
        self.color_mask = *mask;
    }

    fn set_viewport(&mut self, viewport: &Viewport) {
        self.viewport = *viewport;
    }

    fn bind_texture(&mut self, unit: u32, texture: Option<TextureHandle>) {
        if let Some(slot) = self.units.get_mut(unit as usize) {
            slot.0 = texture;
        }
    }

    fn bind_sampler(&mut self, unit: u32, sampler: Option<SamplerHandle>) {
        if let Some(slot) = self.units.get_mut(unit as usize) {
            slot.1 = sampler;
        }
    }

    fn set_framebuffer(&mut self, attachments: &FramebufferAttachments) -> Result<(), VideoError> {
        let lookup = |texture: Option<TextureHandle>, what: &str| -> Result<Option<&Image>, VideoError> {
            match texture {
                None => Ok(None),
                Some(handle) => self
                    .image(handle)
                    .map(Some)
                    .ok_or_else(|| VideoError::IncompleteFramebuffer(format!("{} texture {} has no storage", what, handle.0))),
            }
        };
        let color = lookup(attachments.color, "color")?;
        let depth = lookup(attachments.depth, "depth")?;

        if color.is_some_and(|c| c.internal.is_depth()) {
            return Err(VideoError::IncompleteFramebuffer("depth texture in color slot".into()));
        }
        if depth.is_some_and(|d| !d.internal.is_depth()) {
            return Err(VideoError::IncompleteFramebuffer("color texture in depth slot".into()));
        }
        if let Some(stencil) = attachments.stencil {
            if attachments.depth != Some(stencil) || !depth.is_some_and(|d| d.internal.has_stencil()) {
                return Err(VideoError::IncompleteFramebuffer(
                    "stencil must share a depth-stencil texture".into(),
                ));
            }
        }
        if let (Some(c), Some(d)) = (color, depth) {
            if (c.width, c.height) != (d.width, d.height) {
                return Err(VideoError::IncompleteFramebuffer(format!(
                    "color {}x{} and depth {}x{} differ",
                    c.width, c.height, d.width, d.height
                )));
            }
        }

        self.framebuffer = *attachments;
        Ok(())
    }

    fn upload_uniforms(&mut self, data: &[u8]) {
        self.uniforms = data.to_vec();
    }

    fn upload_vertices(&mut self, vertices: &[HardwareVertex]) {
        self.vertex_buffer = None;
        self.vertex_count = 0;
        if vertices.is_empty() {
            return;
        }
        match self.staging_buffer(bytemuck::cast_slice(vertices), vk::BufferUsageFlags::VERTEX_BUFFER, "vertices") {
            Ok(buffer) => {
                self.vertex_buffer = Some(buffer);
                self.vertex_count = vertices.len() as u32;
            }
            Err(e) => tracing::error!("Failed to upload vertices: {}", e),
        }
    }

    fn draw_triangles(&mut self, first: u32, count: u32) -> Result<(), VideoError> {
        if count == 0 {
            return Ok(());
        }
        let vertex_buffer = self
            .vertex_buffer
            .ok_or_else(|| VideoError::Backend("draw without vertex data".into()))?;
        if first as u64 + count as u64 > self.vertex_count as u64 {
            return Err(VideoError::Backend(format!(
                "draw of {}+{} exceeds {} vertices",
                first, count, self.vertex_count
            )));
        }
        let Some(program) = self.program else {
            tracing::warn!("Draw without a program, skipped");
            return Ok(());
        };

        let attachments = self.framebuffer;
        let color = attachments.color.and_then(|t| self.image(t)).map(|i| (i.view, i.format, i.width, i.height));
        let depth = attachments.depth.and_then(|t| self.image(t)).map(|i| (i.view, i.format, i.width, i.height));
        let Some((_, _, width, height)) = color.or(depth) else {
            tracing::warn!("Draw without render targets, skipped");
            return Ok(());
        };
        let stencil = attachments.stencil.is_some();

        let logic_op_supported = self.ctx()?.logic_op_supported;
        let key = PipelineKey {
            program,
            blend_enabled: self.blend_enabled,
            blend: self.blend_funcs,
            logic_op: (logic_op_supported && !self.blend_enabled && self.logic_op != LogicOp::Copy)
                .then_some(self.logic_op),
            color_mask: self.color_mask,
            color_format: color.map(|c| c.1),
            depth_format: depth.map(|d| d.1),
            stencil,
        };
        let pipeline = self.get_or_create_pipeline(key)?;
        let descriptor_set = self.write_descriptor_set()?;

        self.full_barrier()?;
        let cmd = self.recording_cmd()?;
        let ctx = self.ctx()?;

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D { width, height },
        };
        let attachment = |view| {
            vk::RenderingAttachmentInfo::default()
                .image_view(view)
                .image_layout(vk::ImageLayout::GENERAL)
                .load_op(vk::AttachmentLoadOp::LOAD)
                .store_op(vk::AttachmentStoreOp::STORE)
        };
        let color_attachments: Vec<vk::RenderingAttachmentInfo> = color.map(|c| attachment(c.0)).into_iter().collect();
        let depth_attachment = depth.map(|d| attachment(d.0));
        let mut rendering = vk::RenderingInfo::default()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some(depth_attachment) = &depth_attachment {
            rendering = rendering.depth_attachment(depth_attachment);
            if stencil {
                rendering = rendering.stencil_attachment(depth_attachment);
            }
        }

        let viewport = vk::Viewport {
            x: self.viewport.x as f32,
            y: self.viewport.y as f32,
            width: self.viewport.width.max(1) as f32,
            height: self.viewport.height.max(1) as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let cull_mode = if self.cull.enabled {
            vk::CullModeFlags::BACK
        } else {
            vk::CullModeFlags::NONE
        };
        // Framebuffer y points the other way, which mirrors the winding
        let front_face = match self.cull.front_face {
            FrontFace::Clockwise => vk::FrontFace::COUNTER_CLOCKWISE,
            FrontFace::CounterClockwise => vk::FrontFace::CLOCKWISE,
        };
        let faces = vk::StencilFaceFlags::FRONT_AND_BACK;

        unsafe {
            let device = &ctx.device;
            device.cmd_begin_rendering(cmd, &rendering);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[render_area]);
            device.cmd_set_blend_constants(cmd, &self.blend_color);
            device.cmd_set_cull_mode(cmd, cull_mode);
            device.cmd_set_front_face(cmd, front_face);
            device.cmd_set_depth_test_enable(cmd, self.depth.test_enabled);
            device.cmd_set_depth_write_enable(cmd, self.depth.write_enabled);
            device.cmd_set_depth_compare_op(cmd, compare_op(self.depth.func));
            device.cmd_set_stencil_test_enable(cmd, self.stencil.test_enabled && stencil);
            device.cmd_set_stencil_op(
                cmd,
                faces,
                stencil_op(self.stencil.action_stencil_fail),
                stencil_op(self.stencil.action_depth_pass),
                stencil_op(self.stencil.action_depth_fail),
                compare_op(self.stencil.func),
            );
            device.cmd_set_stencil_compare_mask(cmd, faces, self.stencil.compare_mask as u32);
            device.cmd_set_stencil_write_mask(cmd, faces, self.stencil.write_mask as u32);
            device.cmd_set_stencil_reference(cmd, faces, self.stencil.reference as u32);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                ctx.pipeline_layout,
                0,
                &[descriptor_set],
                &[],
            );
            device.cmd_bind_vertex_buffers(cmd, 0, &[vertex_buffer], &[0]);
            device.cmd_draw(cmd, count, 1, first, 0);
            device.cmd_end_rendering(cmd);
        }

        self.draws_since_submit += 1;
        if self.draws_since_submit >= MAX_DRAWS_PER_SUBMIT {
            self.submit_and_wait()?;
        }
        Ok(())
    }
}
