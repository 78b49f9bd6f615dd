//! Native objects handed out to kiln. All of them are plain handles plus the data needed to use or destroy them
//! later. Destruction always goes through [VulkanBackend](crate::VulkanBackend).

use ash::vk;
use gpu_allocator::vulkan::Allocation;
use kiln::backend::CommandLevel;

pub struct VkBuffer {
    pub inner: vk::Buffer,
    pub size: u64,
    pub(crate) allocation: Option<Allocation>,
    pub(crate) device_address: Option<u64>,
}

impl VkBuffer {
    pub fn is_mappable(&self) -> bool {
        self.allocation
            .as_ref()
            .map(|a| a.mapped_ptr().is_some())
            .unwrap_or(false)
    }
}

pub struct VkBufferView {
    pub inner: vk::BufferView,
}

pub struct VkTexture {
    pub inner: vk::Image,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub(crate) allocation: Option<Allocation>,
}

pub struct VkTextureView {
    pub inner: vk::ImageView,
    pub aspect: vk::ImageAspectFlags,
}

impl VkTextureView {
    ///Layout the view is in while being used as render pass attachment.
    pub(crate) fn attachment_layout(&self) -> vk::ImageLayout {
        if self.aspect.contains(vk::ImageAspectFlags::DEPTH) {
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        }
    }
}

pub struct VkPipeline {
    pub inner: vk::Pipeline,
    pub bind_point: vk::PipelineBindPoint,
}

pub struct VkCommandPool {
    pub inner: vk::CommandPool,
}

pub struct VkCommandBuffer {
    pub inner: vk::CommandBuffer,
    pub level: CommandLevel,
}

pub struct VkFence {
    pub inner: vk::Fence,
}
