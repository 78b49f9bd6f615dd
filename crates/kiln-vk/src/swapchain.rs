use ash::vk;
use kiln::{FRAMES_IN_FLIGHT, backend::SurfaceImage};

use crate::VkBackendError;

///Presentation preferences. If a preference is not supported by the surface the first supported value (or FIFO
/// for present modes) is used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfacePreference {
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    ///Used if the surface does not report a current extent, which happens on Wayland.
    pub extent: vk::Extent2D,
}

impl Default for SurfacePreference {
    fn default() -> Self {
        SurfacePreference {
            format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            present_mode: vk::PresentModeKHR::FIFO,
            extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
        }
    }
}

///Swapchain images and the properties they were created with. Replaced as a whole on recreation.
struct Chain {
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    ///Signaled once the image with the same index is ready for presentation.
    render_finished: Vec<vk::Semaphore>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
}

pub(crate) struct Swapchain {
    loader: ash::khr::swapchain::Device,
    surface_loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    preference: SurfacePreference,
    chain: Chain,
    ///One acquire semaphore per frame slot. A slot is only reused after its fence was waited, so the semaphore
    /// is unsignaled again by then.
    acquire: [vk::Semaphore; FRAMES_IN_FLIGHT],
    ///Images acquired for a slot whose acquire semaphore no submission waited on yet.
    unconsumed: [Option<SurfaceImage>; FRAMES_IN_FLIGHT],
    needs_recreate: bool,
}

impl Swapchain {
    pub(crate) fn new(
        entry: &ash::Entry,
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        preference: SurfacePreference,
    ) -> Result<Self, VkBackendError> {
        let loader = ash::khr::swapchain::Device::new(instance, device);
        let surface_loader = ash::khr::surface::Instance::new(entry, instance);

        let mut acquire = [vk::Semaphore::null(); FRAMES_IN_FLIGHT];
        for idx in 0..FRAMES_IN_FLIGHT {
            match unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) } {
                Ok(s) => acquire[idx] = s,
                Err(e) => {
                    for s in &acquire[..idx] {
                        unsafe { device.destroy_semaphore(*s, None) };
                    }
                    return Err(e.into());
                }
            }
        }

        let chain = match Self::create_chain(
            &loader,
            &surface_loader,
            device,
            physical_device,
            surface,
            &preference,
            vk::SwapchainKHR::null(),
        ) {
            Ok(c) => c,
            Err(e) => {
                for s in acquire {
                    unsafe { device.destroy_semaphore(s, None) };
                }
                return Err(e);
            }
        };

        Ok(Swapchain {
            loader,
            surface_loader,
            surface,
            physical_device,
            preference,
            chain,
            acquire,
            unconsumed: [None; FRAMES_IN_FLIGHT],
            needs_recreate: false,
        })
    }

    fn create_chain(
        loader: &ash::khr::swapchain::Device,
        surface_loader: &ash::khr::surface::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        preference: &SurfacePreference,
        old: vk::SwapchainKHR,
    ) -> Result<Chain, VkBackendError> {
        let (capabilities, formats, present_modes) = unsafe {
            (
                surface_loader
                    .get_physical_device_surface_capabilities(physical_device, surface)?,
                surface_loader.get_physical_device_surface_formats(physical_device, surface)?,
                surface_loader
                    .get_physical_device_surface_present_modes(physical_device, surface)?,
            )
        };

        let format = if formats.contains(&preference.format) {
            preference.format
        } else {
            *formats
                .first()
                .ok_or_else(|| VkBackendError::Swapchain("surface reports no format".to_owned()))?
        };
        let present_mode = if present_modes.contains(&preference.present_mode) {
            preference.present_mode
        } else {
            vk::PresentModeKHR::FIFO
        };
        let extent = choose_extent(&capabilities, preference.extent);
        if extent.width == 0 || extent.height == 0 {
            return Err(VkBackendError::Swapchain(format!(
                "Could not create swapchain, choosen extent had a zero-axis: {:?}",
                extent
            )));
        }
        let image_count = if capabilities.max_image_count == 0 {
            capabilities.min_image_count + 1
        } else {
            (capabilities.min_image_count + 1).min(capabilities.max_image_count)
        };
        let transform = if capabilities
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            capabilities.current_transform
        };

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old);

        let swapchain = unsafe { loader.create_swapchain(&create_info, None)? };
        let images = match unsafe { loader.get_swapchain_images(swapchain) } {
            Ok(i) => i,
            Err(e) => {
                unsafe { loader.destroy_swapchain(swapchain, None) };
                return Err(e.into());
            }
        };

        let mut render_finished = Vec::with_capacity(images.len());
        for _ in 0..images.len() {
            match unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) } {
                Ok(s) => render_finished.push(s),
                Err(e) => {
                    for s in render_finished {
                        unsafe { device.destroy_semaphore(s, None) };
                    }
                    unsafe { loader.destroy_swapchain(swapchain, None) };
                    return Err(e.into());
                }
            }
        }

        #[cfg(feature = "logging")]
        log::info!(
            "Created swapchain: {} images, {:?}, {:?}, {:?}",
            images.len(),
            extent,
            format.format,
            present_mode
        );

        Ok(Chain {
            swapchain,
            images,
            render_finished,
            format,
            extent,
        })
    }

    ///Recreates the swapchain. The old chain is only replaced once the new one exists.
    fn recreate(&mut self, device: &ash::Device) -> Result<(), VkBackendError> {
        unsafe { device.device_wait_idle()? };
        let chain = Self::create_chain(
            &self.loader,
            &self.surface_loader,
            device,
            self.physical_device,
            self.surface,
            &self.preference,
            self.chain.swapchain,
        )?;
        let old = std::mem::replace(&mut self.chain, chain);
        Self::destroy_chain(&self.loader, device, old);
        self.needs_recreate = false;
        Ok(())
    }

    fn destroy_chain(loader: &ash::khr::swapchain::Device, device: &ash::Device, chain: Chain) {
        unsafe {
            for s in chain.render_finished {
                device.destroy_semaphore(s, None);
            }
            loader.destroy_swapchain(chain.swapchain, None);
        }
    }

    ///Requests a new extent. Takes effect on the next acquire.
    pub(crate) fn resize(&mut self, extent: vk::Extent2D) {
        self.preference.extent = extent;
        self.needs_recreate = true;
    }

    ///Acquires the next image for frame slot `slot`. Out-of-date chains are recreated and the acquisition retried
    /// once.
    ///
    /// If the last image acquired for `slot` was never submitted, that image is handed out again, its semaphore is
    /// still pending.
    pub(crate) fn acquire(
        &mut self,
        device: &ash::Device,
        slot: usize,
    ) -> Result<SurfaceImage, VkBackendError> {
        if let Some(image) = self.unconsumed[slot] {
            if !self.needs_recreate {
                #[cfg(feature = "logging")]
                log::warn!("Reusing image {} that was acquired but never submitted", image.index);
                return Ok(image);
            }
            #[cfg(feature = "logging")]
            log::error!("Acquire semaphore of slot {} is still pending", slot);
            return Err(VkBackendError::Swapchain(format!(
                "slot {slot} has an unconsumed acquire"
            )));
        }

        if self.needs_recreate {
            #[cfg(feature = "logging")]
            log::warn!("Recreating swapchain before acquire");
            self.recreate(device)?;
        }

        for _ in 0..2 {
            match unsafe {
                self.loader.acquire_next_image(
                    self.chain.swapchain,
                    u64::MAX,
                    self.acquire[slot],
                    vk::Fence::null(),
                )
            } {
                Ok((index, is_suboptimal)) => {
                    if is_suboptimal {
                        #[cfg(feature = "logging")]
                        log::warn!("Acquired image is suboptimal, recreating next frame");
                        self.needs_recreate = true;
                    }
                    let image = SurfaceImage {
                        index,
                        extent: self.chain.extent,
                        format: self.chain.format.format,
                    };
                    self.unconsumed[slot] = Some(image);
                    return Ok(image);
                }
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    #[cfg(feature = "logging")]
                    log::warn!("Swapchain out of date on acquire, recreating");
                    self.recreate(device)?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(VkBackendError::Swapchain(
            "surface stayed out of date after recreation".to_owned(),
        ))
    }

    pub(crate) fn acquire_semaphore(&self, slot: usize) -> vk::Semaphore {
        self.acquire[slot]
    }

    ///Marks the acquire semaphore of `slot` as waited on by a submission.
    pub(crate) fn consume(&mut self, slot: usize) {
        self.unconsumed[slot] = None;
    }

    ///Returns the acquire semaphore of `slot` if it is pending while the chain has to be recreated. The caller has to
    /// wait on it before the next acquire.
    pub(crate) fn take_stale(&mut self, slot: usize) -> Option<vk::Semaphore> {
        if self.needs_recreate && self.unconsumed[slot].take().is_some() {
            Some(self.acquire[slot])
        } else {
            None
        }
    }

    pub(crate) fn render_finished_semaphore(&self, image: &SurfaceImage) -> Option<vk::Semaphore> {
        self.chain.render_finished.get(image.index as usize).copied()
    }

    pub(crate) fn image(&self, image: &SurfaceImage) -> Option<vk::Image> {
        self.chain.images.get(image.index as usize).copied()
    }

    ///Enqueues the present of `image`. Out-of-date and suboptimal results only flag a recreation.
    pub(crate) fn present(
        &mut self,
        queue: vk::Queue,
        image: &SurfaceImage,
    ) -> Result<(), VkBackendError> {
        let wait = self
            .render_finished_semaphore(image)
            .ok_or_else(|| VkBackendError::Swapchain(format!("no image {}", image.index)))?;
        let present_info = vk::PresentInfoKHR::default()
            .swapchains(core::slice::from_ref(&self.chain.swapchain))
            .image_indices(core::slice::from_ref(&image.index))
            .wait_semaphores(core::slice::from_ref(&wait));

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(()),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                #[cfg(feature = "logging")]
                log::warn!("Suboptimal or out of date image on present, recreating next frame");
                self.needs_recreate = true;
                Ok(())
            }
            Err(e) => {
                #[cfg(feature = "logging")]
                log::error!("Error while presenting image: {}", e);
                Err(e.into())
            }
        }
    }

    ///Destroys the swapchain and its semaphores. The surface stays owned by the host.
    pub(crate) fn destroy(self, device: &ash::Device) {
        let Swapchain {
            loader,
            chain,
            acquire,
            ..
        } = self;
        Self::destroy_chain(&loader, device, chain);
        for s in acquire {
            unsafe { device.destroy_semaphore(s, None) };
        }
    }
}

///Current extent of the surface, or `fallback` clamped into the supported range if the surface leaves the
/// choice to the swapchain.
fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, fallback: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: fallback.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: fallback.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}
