use ash::vk;

use crate::{
    backend::Backend,
    sync_state::{SyncState, UsageKind},
};

///Where a buffer's memory should live. Mirrors the locations exposed by common GPU allocators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum MemoryUsage {
    #[default]
    GpuOnly,
    CpuToGpu,
    GpuToCpu,
}

impl MemoryUsage {
    pub fn is_host_visible(&self) -> bool {
        !matches!(self, MemoryUsage::GpuOnly)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub memory: MemoryUsage,
    pub name: Option<String>,
}

impl Default for BufferDesc {
    fn default() -> Self {
        BufferDesc {
            size: 0,
            usage: vk::BufferUsageFlags::empty(),
            memory: MemoryUsage::GpuOnly,
            name: None,
        }
    }
}

impl BufferDesc {
    ///Device local storage buffer that can be addressed bindlessly and through its device address.
    pub fn storage(size: u64) -> Self {
        BufferDesc {
            size,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::TRANSFER_DST,
            ..Default::default()
        }
    }

    pub fn vertex(size: u64) -> Self {
        BufferDesc {
            size,
            usage: vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            ..Default::default()
        }
    }

    pub fn index(size: u64) -> Self {
        BufferDesc {
            size,
            usage: vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            ..Default::default()
        }
    }

    ///Host visible buffer used to funnel bytes into device local buffers.
    pub fn staging(size: u64) -> Self {
        BufferDesc {
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            memory: MemoryUsage::CpuToGpu,
            name: Some("kiln staging".to_owned()),
        }
    }

    pub fn with_usage(mut self, usage: vk::BufferUsageFlags) -> Self {
        self.usage |= usage;
        self
    }

    pub fn with_memory(mut self, memory: MemoryUsage) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    ///True if a buffer created from `self` can be used as `usage`.
    pub fn supports(&self, usage: UsageKind) -> bool {
        let needed = match usage {
            UsageKind::Undefined => return true,
            UsageKind::ReadBuffer | UsageKind::WriteBuffer => vk::BufferUsageFlags::STORAGE_BUFFER,
            UsageKind::UniformBuffer => vk::BufferUsageFlags::UNIFORM_BUFFER,
            UsageKind::VertexBuffer => vk::BufferUsageFlags::VERTEX_BUFFER,
            UsageKind::IndexBuffer => vk::BufferUsageFlags::INDEX_BUFFER,
            UsageKind::IndirectBuffer => vk::BufferUsageFlags::INDIRECT_BUFFER,
            UsageKind::TransferSrc => vk::BufferUsageFlags::TRANSFER_SRC,
            UsageKind::TransferDst => vk::BufferUsageFlags::TRANSFER_DST,
            _ => return false,
        };
        self.usage.contains(needed)
    }

    ///True if the buffer gets a bindless slot.
    pub fn is_bindless(&self) -> bool {
        self.usage.intersects(
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::UNIFORM_BUFFER,
        )
    }

    pub fn has_device_address(&self) -> bool {
        self.usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
    }
}

///Texel view into a buffer. Stored on the buffer and reissued whenever the buffer is recreated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferViewDesc {
    pub offset: u64,
    ///Size of the view in bytes. [vk::WHOLE_SIZE] spans the rest of the buffer.
    pub range: u64,
    pub format: vk::Format,
}

impl BufferViewDesc {
    pub fn whole(format: vk::Format) -> Self {
        BufferViewDesc {
            offset: 0,
            range: vk::WHOLE_SIZE,
            format,
        }
    }
}

///Host visible sibling of a device local buffer.
pub(crate) struct Staging<B: Backend> {
    pub(crate) native: B::Buffer,
    pub(crate) size: u64,
    ///Frame the staging buffer was last read by the GPU.
    pub(crate) last_frame: Option<u64>,
}

impl<B: Backend> Staging<B> {
    ///True if the GPU can not be reading the staging buffer anymore at `frame`, and it holds at least `size` bytes.
    pub(crate) fn is_reusable(&self, frame: u64, size: u64) -> bool {
        let idle = match self.last_frame {
            None => true,
            Some(last) => frame.saturating_sub(last) >= crate::FRAMES_IN_FLIGHT as u64,
        };
        idle && self.size >= size
    }
}

///Buffer resource with its native allocation, views and bindless registration.
pub struct Buffer<B: Backend> {
    pub(crate) desc: BufferDesc,
    pub(crate) native: B::Buffer,
    pub(crate) views: Vec<(BufferViewDesc, B::BufferView)>,
    pub(crate) sync: SyncState,
    pub(crate) bindless: Option<u32>,
    pub(crate) address: Option<u64>,
    pub(crate) staging: Option<Staging<B>>,
    ///Last submitted frame that declared a use of the buffer.
    pub(crate) last_use: Option<u64>,
}

impl<B: Backend> Buffer<B> {
    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    pub fn size(&self) -> u64 {
        self.desc.size
    }

    pub fn native(&self) -> &B::Buffer {
        &self.native
    }

    pub fn view(&self, index: usize) -> Option<&B::BufferView> {
        self.views.get(index).map(|(_, v)| v)
    }

    pub fn view_descs(&self) -> impl Iterator<Item = &BufferViewDesc> {
        self.views.iter().map(|(d, _)| d)
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync
    }

    pub fn bindless_index(&self) -> Option<u32> {
        self.bindless
    }

    pub fn device_address(&self) -> Option<u64> {
        self.address
    }

    pub fn has_staging(&self) -> bool {
        self.staging.is_some()
    }

    ///True if a frame that is possibly still executing at `frame` used the buffer.
    pub(crate) fn in_flight(&self, frame: u64) -> bool {
        self.last_use
            .map(|last| frame.saturating_sub(last) < crate::FRAMES_IN_FLIGHT as u64)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_flags_gate_roles() {
        let desc = BufferDesc::storage(64);
        assert!(desc.supports(UsageKind::ReadBuffer));
        assert!(desc.supports(UsageKind::WriteBuffer));
        assert!(desc.supports(UsageKind::TransferDst));
        assert!(!desc.supports(UsageKind::VertexBuffer));
        assert!(!desc.supports(UsageKind::RenderTarget));
        assert!(desc.is_bindless());
        assert!(desc.has_device_address());

        let vertex = BufferDesc::vertex(64);
        assert!(vertex.supports(UsageKind::VertexBuffer));
        assert!(!vertex.is_bindless());
    }
}
