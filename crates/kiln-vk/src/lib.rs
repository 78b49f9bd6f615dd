//! # Kiln-Vk
//!
//! Vulkan 1.3 implementation of kiln's [Backend]. Memory is managed through `gpu-allocator`, rendering uses dynamic
//! rendering and all barriers are recorded through synchronization2.
//!
//! The host creates instance, device and (optionally) the surface and hands them over through a
//! [VulkanBackendDesc]. The backend never destroys those. It does destroy everything it created itself once it is
//! dropped, so drop the backend (or the [Engine](kiln::Engine) owning it) before destroying the device.
//!
//! The device must support Vulkan 1.3 and have the features returned by [required_features] enabled, as well as
//! `VK_KHR_swapchain` if a surface is used.

use std::sync::{Mutex, MutexGuard, PoisonError};

use ash::vk;
use gpu_allocator::{
    MemoryLocation,
    vulkan::{AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc},
};
use kiln::{
    Backend,
    backend::{
        BindlessWrite, CommandLevel, LoadOp, NativeBarrier, NativeCommand, SurfaceImage,
    },
    resources::{BufferDesc, BufferViewDesc, KernelDesc, MemoryUsage, TextureDesc, TextureViewDesc},
};
use smallvec::SmallVec;

mod barrier;
mod bindless;
mod error;
mod pipeline;
pub mod resources;
mod swapchain;

pub use barrier::BarrierBuilder;
pub use error::VkBackendError;
pub use swapchain::SurfacePreference;

use bindless::BindlessDescriptor;
use resources::{
    VkBuffer, VkBufferView, VkCommandBuffer, VkCommandPool, VkFence, VkPipeline, VkTexture,
    VkTextureView,
};
use swapchain::Swapchain;

///Everything the host created that the backend builds on.
pub struct VulkanBackendDesc {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    ///Family of the graphics queue used for everything. Queue 0 of that family is used.
    pub queue_family: u32,
    ///If set, a swapchain is created on it.
    pub surface: Option<vk::SurfaceKHR>,
    pub surface_preference: SurfacePreference,
    ///Should match [EngineConfig](kiln::EngineConfig)'s limits. Clamped to the device limits.
    pub max_bindless_textures: u32,
    pub max_bindless_buffers: u32,
}

///Vulkan 1.2 and 1.3 features kiln relies on. Chain them into the device create info.
pub fn required_features() -> (
    vk::PhysicalDeviceVulkan12Features<'static>,
    vk::PhysicalDeviceVulkan13Features<'static>,
) {
    (
        vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_variable_descriptor_count(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_storage_image_update_after_bind(true)
            .descriptor_binding_storage_buffer_update_after_bind(true)
            .shader_sampled_image_array_non_uniform_indexing(true)
            .shader_storage_image_array_non_uniform_indexing(true)
            .shader_storage_buffer_array_non_uniform_indexing(true),
        vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true),
    )
}

fn memory_usage_to_location(usage: MemoryUsage) -> MemoryLocation {
    match usage {
        MemoryUsage::GpuOnly => MemoryLocation::GpuOnly,
        MemoryUsage::CpuToGpu => MemoryLocation::CpuToGpu,
        MemoryUsage::GpuToCpu => MemoryLocation::GpuToCpu,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct VulkanBackend {
    device: ash::Device,
    queue_family: u32,
    ///Queue access must be externally synchronised.
    queue: Mutex<vk::Queue>,
    allocator: Mutex<Allocator>,
    bindless: BindlessDescriptor,
    swapchain: Mutex<Option<Swapchain>>,
}

impl VulkanBackend {
    pub fn new(desc: VulkanBackendDesc) -> Result<Self, VkBackendError> {
        let VulkanBackendDesc {
            entry,
            instance,
            device,
            physical_device,
            queue_family,
            surface,
            surface_preference,
            max_bindless_textures,
            max_bindless_buffers,
        } = desc;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        if properties.api_version < vk::API_VERSION_1_3 {
            #[cfg(feature = "logging")]
            log::error!(
                "Device supports Vulkan {}.{}, need 1.3",
                vk::api_version_major(properties.api_version),
                vk::api_version_minor(properties.api_version)
            );
            return Err(VkBackendError::Vk(vk::Result::ERROR_INCOMPATIBLE_DRIVER));
        }

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })?;

        let mut bindless = BindlessDescriptor::new(
            &device,
            &properties.limits,
            max_bindless_textures,
            max_bindless_buffers,
        )?;

        let swapchain = match surface {
            Some(surface) => match Swapchain::new(
                &entry,
                &instance,
                &device,
                physical_device,
                surface,
                surface_preference,
            ) {
                Ok(sc) => Some(sc),
                Err(e) => {
                    bindless.destroy(&device);
                    return Err(e);
                }
            },
            None => None,
        };

        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        #[cfg(feature = "logging")]
        log::info!(
            "Created Vulkan backend on {:?}, surface: {}",
            properties
                .device_name_as_c_str()
                .unwrap_or(c"unknown device"),
            swapchain.is_some()
        );

        Ok(VulkanBackend {
            device,
            queue_family,
            queue: Mutex::new(queue),
            allocator: Mutex::new(allocator),
            bindless,
            swapchain: Mutex::new(swapchain),
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    ///Maximum push constant size of the shared pipeline layout.
    pub fn push_constant_size(&self) -> u32 {
        self.bindless.push_constant_size()
    }

    ///Requests a new surface extent, usually after the window was resized. The swapchain is recreated on the
    /// next acquire.
    pub fn resize_surface(&self, extent: vk::Extent2D) {
        if let Some(sc) = lock(&self.swapchain).as_mut() {
            sc.resize(extent);
        }
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<gpu_allocator::vulkan::Allocation, VkBackendError> {
        let allocation = lock(&self.allocator).allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;
        Ok(allocation)
    }

    fn free(&self, allocation: Option<gpu_allocator::vulkan::Allocation>) {
        if let Some(allocation) = allocation {
            if let Err(e) = lock(&self.allocator).free(allocation) {
                //NOTE: the allocator won't hand out the memory again, so a failed free only leaks.
                #[cfg(feature = "logging")]
                log::error!("Freeing allocation failed with: {}", e);
                #[cfg(not(feature = "logging"))]
                let _ = e;
            }
        }
    }

    fn record_barriers(&self, command_buffer: vk::CommandBuffer, barriers: &[NativeBarrier<'_, Self>]) {
        let mut builder = BarrierBuilder::new();
        for barrier in barriers {
            match barrier {
                NativeBarrier::Buffer { buffer, barrier } => {
                    builder.buffer(buffer.inner, barrier);
                }
                NativeBarrier::Texture {
                    texture,
                    aspect,
                    barrier,
                } => {
                    builder.image(texture.inner, *aspect, barrier);
                }
            }
        }
        builder.record(&self.device, command_buffer);
    }

    fn record_blit(
        &self,
        command_buffer: vk::CommandBuffer,
        src: &VkTexture,
        src_extent: vk::Extent2D,
        surface: SurfaceImage,
    ) {
        let Some(dst) = lock(&self.swapchain)
            .as_ref()
            .and_then(|sc| sc.image(&surface))
        else {
            #[cfg(feature = "logging")]
            log::error!("No swapchain image {} to blit to", surface.index);
            return;
        };

        let mut to_dst = BarrierBuilder::new();
        to_dst.image_raw(
            dst,
            vk::ImageAspectFlags::COLOR,
            (
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::NONE,
                vk::ImageLayout::UNDEFINED,
            ),
            (
                vk::PipelineStageFlags2::BLIT,
                vk::AccessFlags2::TRANSFER_WRITE,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ),
        );
        to_dst.record(&self.device, command_buffer);

        let subresource = vk::ImageSubresourceLayers::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .mip_level(0)
            .base_array_layer(0)
            .layer_count(1);
        let corner = |e: vk::Extent2D| vk::Offset3D {
            x: e.width as i32,
            y: e.height as i32,
            z: 1,
        };
        let region = vk::ImageBlit::default()
            .src_subresource(subresource)
            .src_offsets([vk::Offset3D::default(), corner(src_extent)])
            .dst_subresource(subresource)
            .dst_offsets([vk::Offset3D::default(), corner(surface.extent)]);
        unsafe {
            self.device.cmd_blit_image(
                command_buffer,
                src.inner,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                core::slice::from_ref(&region),
                vk::Filter::LINEAR,
            )
        };

        let mut to_present = BarrierBuilder::new();
        to_present.image_raw(
            dst,
            vk::ImageAspectFlags::COLOR,
            (
                vk::PipelineStageFlags2::BLIT,
                vk::AccessFlags2::TRANSFER_WRITE,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ),
            (
                vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                vk::AccessFlags2::NONE,
                vk::ImageLayout::PRESENT_SRC_KHR,
            ),
        );
        to_present.record(&self.device, command_buffer);
    }
}

fn color_clear(load: &LoadOp<[f32; 4]>) -> (vk::AttachmentLoadOp, vk::ClearValue) {
    match load {
        LoadOp::Load => (vk::AttachmentLoadOp::LOAD, vk::ClearValue::default()),
        LoadOp::DontCare => (vk::AttachmentLoadOp::DONT_CARE, vk::ClearValue::default()),
        LoadOp::Clear(color) => (
            vk::AttachmentLoadOp::CLEAR,
            vk::ClearValue {
                color: vk::ClearColorValue { float32: *color },
            },
        ),
    }
}

fn depth_clear(load: &LoadOp<f32>) -> (vk::AttachmentLoadOp, vk::ClearValue) {
    match load {
        LoadOp::Load => (vk::AttachmentLoadOp::LOAD, vk::ClearValue::default()),
        LoadOp::DontCare => (vk::AttachmentLoadOp::DONT_CARE, vk::ClearValue::default()),
        LoadOp::Clear(depth) => (
            vk::AttachmentLoadOp::CLEAR,
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: *depth,
                    stencil: 0,
                },
            },
        ),
    }
}

impl Backend for VulkanBackend {
    type Error = VkBackendError;

    type Buffer = VkBuffer;
    type BufferView = VkBufferView;
    type Texture = VkTexture;
    type TextureView = VkTextureView;
    type Pipeline = VkPipeline;
    type CommandPool = VkCommandPool;
    type CommandBuffer = VkCommandBuffer;
    type Fence = VkFence;

    fn create_buffer(&self, desc: &BufferDesc) -> Result<Self::Buffer, Self::Error> {
        let create_info = vk::BufferCreateInfo::default()
            .size(desc.size.max(1))
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&create_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        //NOTE: Buffers are always "linear" in memory
        let allocation = match self.allocate(
            desc.name.as_deref().unwrap_or("kiln buffer"),
            requirements,
            memory_usage_to_location(desc.memory),
            true,
        ) {
            Ok(a) => a,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.free(Some(allocation));
            return Err(e.into());
        }

        let device_address = if desc.has_device_address() {
            Some(unsafe {
                self.device
                    .get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
            })
        } else {
            None
        };

        Ok(VkBuffer {
            inner: buffer,
            size: desc.size,
            allocation: Some(allocation),
            device_address,
        })
    }

    fn destroy_buffer(&self, mut buffer: Self::Buffer) {
        unsafe { self.device.destroy_buffer(buffer.inner, None) };
        self.free(buffer.allocation.take());
    }

    fn create_buffer_view(
        &self,
        buffer: &Self::Buffer,
        desc: &BufferViewDesc,
    ) -> Result<Self::BufferView, Self::Error> {
        let create_info = vk::BufferViewCreateInfo::default()
            .buffer(buffer.inner)
            .format(desc.format)
            .offset(desc.offset)
            .range(desc.range);
        let inner = unsafe { self.device.create_buffer_view(&create_info, None)? };
        Ok(VkBufferView { inner })
    }

    fn destroy_buffer_view(&self, view: Self::BufferView) {
        unsafe { self.device.destroy_buffer_view(view.inner, None) };
    }

    fn write_buffer(
        &self,
        buffer: &mut Self::Buffer,
        offset: u64,
        data: &[u8],
    ) -> Result<(), Self::Error> {
        let size = buffer.size;
        let slice = buffer
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .ok_or(VkBackendError::NotMappable)?;
        let len = data.len() as u64;
        let end = offset.checked_add(len).filter(|end| *end <= size);
        let Some(end) = end.map(|e| e as usize).filter(|e| *e <= slice.len()) else {
            return Err(VkBackendError::OutOfBounds {
                offset,
                len,
                size,
            });
        };
        slice[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn buffer_device_address(&self, buffer: &Self::Buffer) -> Option<u64> {
        buffer.device_address
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<Self::Texture, Self::Error> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&create_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.allocate(
            desc.name.as_deref().unwrap_or("kiln texture"),
            requirements,
            MemoryLocation::GpuOnly,
            false,
        ) {
            Ok(a) => a,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_image(image, None) };
            self.free(Some(allocation));
            return Err(e.into());
        }

        Ok(VkTexture {
            inner: image,
            format: desc.format,
            extent: desc.extent,
            allocation: Some(allocation),
        })
    }

    fn destroy_texture(&self, mut texture: Self::Texture) {
        unsafe { self.device.destroy_image(texture.inner, None) };
        self.free(texture.allocation.take());
    }

    fn create_texture_view(
        &self,
        texture: &Self::Texture,
        desc: &TextureViewDesc,
    ) -> Result<Self::TextureView, Self::Error> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(texture.inner)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(texture.format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(desc.aspect)
                    .base_mip_level(desc.base_mip)
                    .level_count(desc.mip_count)
                    .base_array_layer(0)
                    .layer_count(1),
            );
        let inner = unsafe { self.device.create_image_view(&create_info, None)? };
        Ok(VkTextureView {
            inner,
            aspect: desc.aspect,
        })
    }

    fn destroy_texture_view(&self, view: Self::TextureView) {
        unsafe { self.device.destroy_image_view(view.inner, None) };
    }

    fn write_bindless(&self, write: BindlessWrite<'_, Self>) {
        match write {
            BindlessWrite::Buffer { slot, buffer } => {
                self.bindless.write_buffer(&self.device, slot, buffer.inner)
            }
            BindlessWrite::Texture {
                slot,
                view,
                sampled,
                storage,
            } => self
                .bindless
                .write_texture(&self.device, slot, view.inner, sampled, storage),
        }
    }

    fn create_pipeline(&self, desc: &KernelDesc) -> Result<Self::Pipeline, Self::Error> {
        pipeline::create_pipeline(&self.device, self.bindless.pipeline_layout(), desc)
    }

    fn destroy_pipeline(&self, pipeline: Self::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline.inner, None) };
    }

    fn create_command_pool(&self) -> Result<Self::CommandPool, Self::Error> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(self.queue_family);
        let inner = unsafe { self.device.create_command_pool(&create_info, None)? };
        Ok(VkCommandPool { inner })
    }

    fn reset_command_pool(&self, pool: &mut Self::CommandPool) -> Result<(), Self::Error> {
        unsafe {
            self.device
                .reset_command_pool(pool.inner, vk::CommandPoolResetFlags::empty())?
        };
        Ok(())
    }

    fn allocate_command_buffer(
        &self,
        pool: &mut Self::CommandPool,
        level: CommandLevel,
    ) -> Result<Self::CommandBuffer, Self::Error> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool.inner)
            .level(match level {
                CommandLevel::Primary => vk::CommandBufferLevel::PRIMARY,
                CommandLevel::Secondary => vk::CommandBufferLevel::SECONDARY,
            })
            .command_buffer_count(1);
        let mut buffers = unsafe { self.device.allocate_command_buffers(&allocate_info)? };
        if buffers.len() != 1 {
            return Err(VkBackendError::Vk(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        }
        Ok(VkCommandBuffer {
            inner: buffers.remove(0),
            level,
        })
    }

    fn destroy_command_pool(&self, pool: Self::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool.inner, None) };
    }

    fn begin(&self, command_buffer: &mut Self::CommandBuffer) -> Result<(), Self::Error> {
        //Secondaries open their own rendering scopes, so nothing is inherited.
        let inheritance = vk::CommandBufferInheritanceInfo::default();
        let mut begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if command_buffer.level == CommandLevel::Secondary {
            begin_info = begin_info.inheritance_info(&inheritance);
        }
        unsafe {
            self.device
                .begin_command_buffer(command_buffer.inner, &begin_info)?
        };
        Ok(())
    }

    fn end(&self, command_buffer: &mut Self::CommandBuffer) -> Result<(), Self::Error> {
        unsafe { self.device.end_command_buffer(command_buffer.inner)? };
        Ok(())
    }

    fn record(&self, command_buffer: &mut Self::CommandBuffer, command: NativeCommand<'_, Self>) {
        let cb = command_buffer.inner;
        match command {
            NativeCommand::Barriers(barriers) => self.record_barriers(cb, barriers),
            NativeCommand::BeginRendering {
                extent,
                colors,
                depth,
            } => {
                let color_attachments = colors
                    .iter()
                    .map(|c| {
                        let (load_op, clear_value) = color_clear(&c.load);
                        vk::RenderingAttachmentInfo::default()
                            .image_view(c.view.inner)
                            .image_layout(c.view.attachment_layout())
                            .load_op(load_op)
                            .store_op(vk::AttachmentStoreOp::STORE)
                            .clear_value(clear_value)
                    })
                    .collect::<SmallVec<[_; 4]>>();
                let depth_attachment = depth.as_ref().map(|d| {
                    let (load_op, clear_value) = depth_clear(&d.load);
                    vk::RenderingAttachmentInfo::default()
                        .image_view(d.view.inner)
                        .image_layout(d.view.attachment_layout())
                        .load_op(load_op)
                        .store_op(vk::AttachmentStoreOp::STORE)
                        .clear_value(clear_value)
                });

                let mut render_info = vk::RenderingInfo::default()
                    .render_area(vk::Rect2D {
                        offset: vk::Offset2D { x: 0, y: 0 },
                        extent,
                    })
                    .layer_count(1)
                    .color_attachments(&color_attachments);
                if let Some(depth) = depth_attachment.as_ref() {
                    render_info = render_info.depth_attachment(depth);
                }
                unsafe { self.device.cmd_begin_rendering(cb, &render_info) };
            }
            NativeCommand::EndRendering => unsafe { self.device.cmd_end_rendering(cb) },
            NativeCommand::BindPipeline(pipeline) => unsafe {
                //Descriptor state is not inherited by secondaries, so the sets are bound with every pipeline.
                self.device
                    .cmd_bind_pipeline(cb, pipeline.bind_point, pipeline.inner);
                self.device.cmd_bind_descriptor_sets(
                    cb,
                    pipeline.bind_point,
                    self.bindless.pipeline_layout(),
                    0,
                    &self.bindless.sets(),
                    &[],
                );
            },
            NativeCommand::BindVertexBuffers { first, buffers } => {
                let (handles, offsets): (SmallVec<[vk::Buffer; 4]>, SmallVec<[u64; 4]>) =
                    buffers.iter().map(|(b, o)| (b.inner, *o)).unzip();
                unsafe {
                    self.device
                        .cmd_bind_vertex_buffers(cb, first, &handles, &offsets)
                };
            }
            NativeCommand::BindIndexBuffer {
                buffer,
                offset,
                index_type,
            } => unsafe {
                self.device
                    .cmd_bind_index_buffer(cb, buffer.inner, offset, index_type)
            },
            NativeCommand::SetViewport(viewport) => unsafe {
                self.device
                    .cmd_set_viewport(cb, 0, core::slice::from_ref(&viewport))
            },
            NativeCommand::SetScissor(scissor) => unsafe {
                self.device
                    .cmd_set_scissor(cb, 0, core::slice::from_ref(&scissor))
            },
            NativeCommand::PushConstants(data) => unsafe {
                self.device.cmd_push_constants(
                    cb,
                    self.bindless.pipeline_layout(),
                    vk::ShaderStageFlags::ALL,
                    0,
                    data,
                )
            },
            NativeCommand::Draw {
                vertices,
                instances,
            } => unsafe {
                self.device.cmd_draw(
                    cb,
                    vertices.end.saturating_sub(vertices.start),
                    instances.end.saturating_sub(instances.start),
                    vertices.start,
                    instances.start,
                )
            },
            NativeCommand::DrawIndexed {
                indices,
                vertex_offset,
                instances,
            } => unsafe {
                self.device.cmd_draw_indexed(
                    cb,
                    indices.end.saturating_sub(indices.start),
                    instances.end.saturating_sub(instances.start),
                    indices.start,
                    vertex_offset,
                    instances.start,
                )
            },
            NativeCommand::DrawIndexedIndirect {
                buffer,
                offset,
                draw_count,
                stride,
            } => unsafe {
                self.device
                    .cmd_draw_indexed_indirect(cb, buffer.inner, offset, draw_count, stride)
            },
            NativeCommand::Dispatch([x, y, z]) => unsafe { self.device.cmd_dispatch(cb, x, y, z) },
            NativeCommand::CopyBuffer { src, dst, regions } => unsafe {
                self.device
                    .cmd_copy_buffer(cb, src.inner, dst.inner, regions)
            },
            NativeCommand::BlitToSurface {
                src,
                src_extent,
                surface,
            } => self.record_blit(cb, src, src_extent, surface),
            NativeCommand::ExecuteSecondary(buffers) => {
                let handles = buffers
                    .iter()
                    .map(|b| b.inner)
                    .collect::<SmallVec<[vk::CommandBuffer; 8]>>();
                if !handles.is_empty() {
                    unsafe { self.device.cmd_execute_commands(cb, &handles) };
                }
            }
        }
    }

    fn create_fence(&self, signaled: bool) -> Result<Self::Fence, Self::Error> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let inner = unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)?
        };
        Ok(VkFence { inner })
    }

    fn wait_fence(&self, fence: &Self::Fence, timeout: u64) -> Result<(), Self::Error> {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();
        unsafe {
            self.device
                .wait_for_fences(core::slice::from_ref(&fence.inner), true, timeout)?
        };
        Ok(())
    }

    fn reset_fence(&self, fence: &Self::Fence) -> Result<(), Self::Error> {
        unsafe {
            self.device
                .reset_fences(core::slice::from_ref(&fence.inner))?
        };
        Ok(())
    }

    fn destroy_fence(&self, fence: Self::Fence) {
        unsafe { self.device.destroy_fence(fence.inner, None) };
    }

    fn acquire_surface(&self, slot: usize) -> Result<Option<SurfaceImage>, Self::Error> {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();
        let mut swapchain = lock(&self.swapchain);
        let Some(sc) = swapchain.as_mut() else {
            return Ok(None);
        };
        if let Some(stale) = sc.take_stale(slot) {
            //nothing waited on the last acquire of this slot, consume it before the chain is replaced.
            let wait = vk::SemaphoreSubmitInfo::default()
                .semaphore(stale)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS);
            let submit =
                vk::SubmitInfo2::default().wait_semaphore_infos(core::slice::from_ref(&wait));
            let queue = lock(&self.queue);
            unsafe {
                self.device.queue_submit2(
                    *queue,
                    core::slice::from_ref(&submit),
                    vk::Fence::null(),
                )?
            };
        }
        sc.acquire(&self.device, slot).map(Some)
    }

    fn submit(
        &self,
        slot: usize,
        command_buffer: &Self::CommandBuffer,
        fence: &Self::Fence,
        surface: Option<&SurfaceImage>,
    ) -> Result<(), Self::Error> {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        let mut swapchain = lock(&self.swapchain);
        let (wait, signal) = match (surface, swapchain.as_ref()) {
            (Some(image), Some(sc)) => {
                let signal = sc.render_finished_semaphore(image).ok_or_else(|| {
                    VkBackendError::Swapchain(format!("no image {}", image.index))
                })?;
                (
                    Some(
                        vk::SemaphoreSubmitInfo::default()
                            .semaphore(sc.acquire_semaphore(slot))
                            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
                    ),
                    Some(
                        vk::SemaphoreSubmitInfo::default()
                            .semaphore(signal)
                            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
                    ),
                )
            }
            _ => (None, None),
        };

        let command_buffer_info =
            vk::CommandBufferSubmitInfo::default().command_buffer(command_buffer.inner);
        let submit = vk::SubmitInfo2::default()
            .command_buffer_infos(core::slice::from_ref(&command_buffer_info))
            .wait_semaphore_infos(wait.as_slice())
            .signal_semaphore_infos(signal.as_slice());

        let queue = lock(&self.queue);
        unsafe {
            self.device
                .queue_submit2(*queue, core::slice::from_ref(&submit), fence.inner)
                .map_err(|e| {
                    #[cfg(feature = "logging")]
                    log::error!("Queue submit failed: {}", e);
                    e
                })?
        };
        drop(queue);
        if wait.is_some() {
            if let Some(sc) = swapchain.as_mut() {
                sc.consume(slot);
            }
        }
        Ok(())
    }

    fn present(&self, _slot: usize, surface: &SurfaceImage) -> Result<(), Self::Error> {
        let mut swapchain = lock(&self.swapchain);
        let Some(sc) = swapchain.as_mut() else {
            return Err(VkBackendError::Swapchain("no surface to present to".to_owned()));
        };
        let queue = lock(&self.queue);
        sc.present(*queue, surface)
    }

    fn wait_idle(&self) -> Result<(), Self::Error> {
        let _queue = lock(&self.queue);
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            #[cfg(feature = "logging")]
            log::error!("Failed to wait for idle device on drop: {}", e);
            #[cfg(not(feature = "logging"))]
            let _ = e;
        }
        let swapchain = self
            .swapchain
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sc) = swapchain {
            sc.destroy(&self.device);
        }
        self.bindless.destroy(&self.device);
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    #[test]
    fn assure_send_sync() {
        assert_impl_all!(VulkanBackend: Send, Sync);
    }

    #[test]
    fn load_ops_map_to_clear_values() {
        let (op, value) = color_clear(&LoadOp::Clear([1.0, 0.5, 0.25, 1.0]));
        assert_eq!(op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(unsafe { value.color.float32 }, [1.0, 0.5, 0.25, 1.0]);

        let (op, value) = depth_clear(&LoadOp::Clear(1.0));
        assert_eq!(op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(unsafe { value.depth_stencil.depth }, 1.0);

        assert_eq!(color_clear(&LoadOp::Load).0, vk::AttachmentLoadOp::LOAD);
        assert_eq!(depth_clear(&LoadOp::DontCare).0, vk::AttachmentLoadOp::DONT_CARE);
    }

    #[test]
    fn memory_locations() {
        assert_eq!(
            memory_usage_to_location(MemoryUsage::GpuOnly),
            MemoryLocation::GpuOnly
        );
        assert_eq!(
            memory_usage_to_location(MemoryUsage::CpuToGpu),
            MemoryLocation::CpuToGpu
        );
    }
}
