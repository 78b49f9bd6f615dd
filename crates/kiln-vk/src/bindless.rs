use std::sync::Mutex;

use ash::vk;

use crate::VkBackendError;

///One bindless array. Slot allocation happens in kiln, this only writes descriptors into the array.
struct DescriptorArray {
    ty: vk::DescriptorType,
    layout: vk::DescriptorSetLayout,
    set: vk::DescriptorSet,
    max_count: u32,
}

impl DescriptorArray {
    fn new(
        device: &ash::Device,
        pool: vk::DescriptorPool,
        ty: vk::DescriptorType,
        max_count: u32,
    ) -> Result<Self, VkBackendError> {
        let binding_layout = vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(ty)
            .descriptor_count(max_count)
            .stage_flags(vk::ShaderStageFlags::ALL);

        #[cfg(feature = "logging")]
        log::trace!("Allocating @ {:?} size={}", ty, max_count);

        let flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT
            | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND; 1];
        let mut ext_flags =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&flags);

        let layout = unsafe {
            device.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::default()
                    .bindings(core::slice::from_ref(&binding_layout))
                    .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
                    .push_next(&mut ext_flags),
                None,
            )?
        };

        let mut allocate_count_info = vk::DescriptorSetVariableDescriptorCountAllocateInfo::default()
            .descriptor_counts(core::slice::from_ref(&max_count));
        let descriptor_set_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(core::slice::from_ref(&layout))
            .push_next(&mut allocate_count_info);

        let set = match unsafe { device.allocate_descriptor_sets(&descriptor_set_info) } {
            Ok(mut sets) if sets.len() == 1 => sets.remove(0),
            Ok(_) => {
                unsafe { device.destroy_descriptor_set_layout(layout, None) };
                return Err(VkBackendError::Vk(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
            }
            Err(e) => {
                unsafe { device.destroy_descriptor_set_layout(layout, None) };
                return Err(e.into());
            }
        };

        Ok(DescriptorArray {
            ty,
            layout,
            set,
            max_count,
        })
    }

    fn write(&self, device: &ash::Device, slot: u32, mut write: vk::WriteDescriptorSet<'_>) {
        if slot >= self.max_count {
            #[cfg(feature = "logging")]
            log::error!(
                "Bindless slot {} out of range for {:?} (max {})",
                slot,
                self.ty,
                self.max_count
            );
            return;
        }
        write = write
            .dst_set(self.set)
            .dst_binding(0)
            .dst_array_element(slot)
            .descriptor_type(self.ty);
        unsafe { device.update_descriptor_sets(core::slice::from_ref(&write), &[]) };
    }
}

///Bindless setup
///
/// Four descriptor sets, each with one variable sized array:
///
/// - 0: StorageBuffer
/// - 1: StorageImage
/// - 2: SampledImage (without combined sampler)
/// - 3: Sampler, slot 0 is a linear sampler, slot 1 a nearest sampler.
///
/// Buffers and textures share their slot between the sets, so a texture with bindless slot `n` is found at `n` in
/// both image arrays, if it supports the usage.
pub(crate) struct BindlessDescriptor {
    pool: vk::DescriptorPool,
    stbuffer: DescriptorArray,
    stimage: DescriptorArray,
    saimage: DescriptorArray,
    sampler: DescriptorArray,
    samplers: [vk::Sampler; 2],
    pipeline_layout: vk::PipelineLayout,
    push_constant_size: u32,
    ///Descriptor writes need external synchronisation on the set.
    write_lock: Mutex<()>,
}

impl BindlessDescriptor {
    const NUM_SETS: u32 = 4;
    const NUM_SAMPLERS: u32 = 2;

    pub(crate) fn new(
        device: &ash::Device,
        limits: &vk::PhysicalDeviceLimits,
        max_textures: u32,
        max_buffers: u32,
    ) -> Result<Self, VkBackendError> {
        if limits.max_bound_descriptor_sets < Self::NUM_SETS {
            return Err(VkBackendError::Vk(vk::Result::ERROR_FEATURE_NOT_PRESENT));
        }

        let max_sampled = max_textures.min(limits.max_descriptor_set_sampled_images);
        let max_storage_image = max_textures.min(limits.max_descriptor_set_storage_images);
        let max_storage_buffer = max_buffers.min(limits.max_descriptor_set_storage_buffers);

        let descriptor_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: max_sampled,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: max_storage_image,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: max_storage_buffer,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: Self::NUM_SAMPLERS,
            },
        ];

        let pool = unsafe {
            device.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::default()
                    .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
                    .pool_sizes(&descriptor_sizes)
                    .max_sets(Self::NUM_SETS),
                None,
            )?
        };

        let push_constant_size = limits.max_push_constants_size;
        #[cfg(feature = "logging")]
        log::info!(
            "Creating bindless layout with max push_constant_size={}",
            push_constant_size
        );

        //Layouts are only destroyed on failure. The sets themselves go away with the pool.
        let mut arrays: Vec<DescriptorArray> = Vec::with_capacity(Self::NUM_SETS as usize);
        let destroy_partial = |arrays: &[DescriptorArray]| unsafe {
            for a in arrays {
                device.destroy_descriptor_set_layout(a.layout, None);
            }
            device.destroy_descriptor_pool(pool, None);
        };
        for (ty, count) in [
            (vk::DescriptorType::STORAGE_BUFFER, max_storage_buffer),
            (vk::DescriptorType::STORAGE_IMAGE, max_storage_image),
            (vk::DescriptorType::SAMPLED_IMAGE, max_sampled),
            (vk::DescriptorType::SAMPLER, Self::NUM_SAMPLERS),
        ] {
            match DescriptorArray::new(device, pool, ty, count) {
                Ok(a) => arrays.push(a),
                Err(e) => {
                    destroy_partial(&arrays);
                    return Err(e);
                }
            }
        }

        let arrays: [DescriptorArray; 4] = match arrays.try_into() {
            Ok(a) => a,
            Err(arrays) => {
                destroy_partial(&arrays);
                return Err(VkBackendError::Vk(vk::Result::ERROR_INITIALIZATION_FAILED));
            }
        };

        let samplers = match Self::create_samplers(device) {
            Ok(s) => s,
            Err(e) => {
                destroy_partial(&arrays);
                return Err(e);
            }
        };

        let layouts = arrays.each_ref().map(|a| a.layout);
        let push_range = vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::ALL,
            offset: 0,
            size: push_constant_size,
        };
        let pipeline_layout = match unsafe {
            device.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::default()
                    .set_layouts(&layouts)
                    .push_constant_ranges(core::slice::from_ref(&push_range)),
                None,
            )
        } {
            Ok(l) => l,
            Err(e) => {
                unsafe {
                    for s in samplers {
                        device.destroy_sampler(s, None);
                    }
                }
                destroy_partial(&arrays);
                return Err(e.into());
            }
        };

        let [stbuffer, stimage, saimage, sampler] = arrays;

        let bindless = BindlessDescriptor {
            pool,
            stbuffer,
            stimage,
            saimage,
            sampler,
            samplers,
            pipeline_layout,
            push_constant_size,
            write_lock: Mutex::new(()),
        };

        for (slot, sampler) in bindless.samplers.iter().enumerate() {
            let info = vk::DescriptorImageInfo::default().sampler(*sampler);
            bindless.sampler.write(
                device,
                slot as u32,
                vk::WriteDescriptorSet::default().image_info(core::slice::from_ref(&info)),
            );
        }

        Ok(bindless)
    }

    fn create_samplers(device: &ash::Device) -> Result<[vk::Sampler; 2], VkBackendError> {
        let info = |filter: vk::Filter, mip: vk::SamplerMipmapMode| {
            vk::SamplerCreateInfo::default()
                .mag_filter(filter)
                .min_filter(filter)
                .mipmap_mode(mip)
                .address_mode_u(vk::SamplerAddressMode::REPEAT)
                .address_mode_v(vk::SamplerAddressMode::REPEAT)
                .address_mode_w(vk::SamplerAddressMode::REPEAT)
                .max_lod(vk::LOD_CLAMP_NONE)
        };
        let linear = unsafe {
            device.create_sampler(
                &info(vk::Filter::LINEAR, vk::SamplerMipmapMode::LINEAR),
                None,
            )?
        };
        let nearest = match unsafe {
            device.create_sampler(
                &info(vk::Filter::NEAREST, vk::SamplerMipmapMode::NEAREST),
                None,
            )
        } {
            Ok(s) => s,
            Err(e) => {
                unsafe { device.destroy_sampler(linear, None) };
                return Err(e.into());
            }
        };
        Ok([linear, nearest])
    }

    ///Layout every kernel is created with.
    pub(crate) fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    pub(crate) fn push_constant_size(&self) -> u32 {
        self.push_constant_size
    }

    pub(crate) fn sets(&self) -> [vk::DescriptorSet; 4] {
        [
            self.stbuffer.set,
            self.stimage.set,
            self.saimage.set,
            self.sampler.set,
        ]
    }

    pub(crate) fn write_buffer(&self, device: &ash::Device, slot: u32, buffer: vk::Buffer) {
        let info = vk::DescriptorBufferInfo::default()
            .buffer(buffer)
            .offset(0)
            .range(vk::WHOLE_SIZE);
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.stbuffer.write(
            device,
            slot,
            vk::WriteDescriptorSet::default().buffer_info(core::slice::from_ref(&info)),
        );
    }

    pub(crate) fn write_texture(
        &self,
        device: &ash::Device,
        slot: u32,
        view: vk::ImageView,
        sampled: bool,
        storage: bool,
    ) {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if sampled {
            let info = vk::DescriptorImageInfo::default()
                .image_view(view)
                .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
            self.saimage.write(
                device,
                slot,
                vk::WriteDescriptorSet::default().image_info(core::slice::from_ref(&info)),
            );
        }
        if storage {
            let info = vk::DescriptorImageInfo::default()
                .image_view(view)
                .image_layout(vk::ImageLayout::GENERAL);
            self.stimage.write(
                device,
                slot,
                vk::WriteDescriptorSet::default().image_info(core::slice::from_ref(&info)),
            );
        }
    }

    ///Destroys all native objects. Only valid once the device is idle.
    pub(crate) fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            for s in self.samplers {
                device.destroy_sampler(s, None);
            }
            for layout in [
                self.stbuffer.layout,
                self.stimage.layout,
                self.saimage.layout,
                self.sampler.layout,
            ] {
                device.destroy_descriptor_set_layout(layout, None);
            }
            device.destroy_descriptor_pool(self.pool, None);
        }
    }
}
