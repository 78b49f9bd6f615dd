use ash::vk;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VkBackendError {
    #[error("Vulkan error: {0}")]
    Vk(#[from] vk::Result),
    #[error("GpuAllocator error: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),
    #[error("Buffer memory is not host visible")]
    NotMappable,
    #[error("Write of {len} bytes at {offset} exceeds buffer of size {size}")]
    OutOfBounds { offset: u64, len: u64, size: u64 },
    #[error("Swapchain error: {0}")]
    Swapchain(String),
    #[error("Pipeline creation failed for {0}")]
    Pipeline(String),
}
