use ash::vk;

use crate::{
    backend::Backend,
    sync_state::{SyncState, UsageKind},
};

///True for all formats that carry a depth aspect.
pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub mip_levels: u32,
    pub name: Option<String>,
}

impl TextureDesc {
    pub fn new(extent: vk::Extent2D, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        TextureDesc {
            extent,
            format,
            usage,
            mip_levels: 1,
            name: None,
        }
    }

    ///Color attachment that can also be sampled and copied from.
    pub fn render_target(extent: vk::Extent2D, format: vk::Format) -> Self {
        Self::new(
            extent,
            format,
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC,
        )
    }

    pub fn depth(extent: vk::Extent2D, format: vk::Format) -> Self {
        Self::new(
            extent,
            format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
        )
    }

    ///Storage image for compute kernels.
    pub fn storage(extent: vk::Extent2D, format: vk::Format) -> Self {
        Self::new(
            extent,
            format,
            vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC,
        )
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_mip_levels(mut self, levels: u32) -> Self {
        self.mip_levels = levels.max(1);
        self
    }

    pub fn is_depth(&self) -> bool {
        is_depth_format(self.format)
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        if self.is_depth() {
            let mut aspect = vk::ImageAspectFlags::DEPTH;
            if has_stencil(self.format) {
                aspect |= vk::ImageAspectFlags::STENCIL;
            }
            aspect
        } else {
            vk::ImageAspectFlags::COLOR
        }
    }

    ///View over all mip levels. Every texture gets this view on creation.
    pub fn default_view(&self) -> TextureViewDesc {
        TextureViewDesc {
            aspect: if self.is_depth() {
                vk::ImageAspectFlags::DEPTH
            } else {
                vk::ImageAspectFlags::COLOR
            },
            base_mip: 0,
            mip_count: self.mip_levels,
        }
    }

    ///True if a texture created from `self` can be used as `usage`. Depth textures can't be used as color targets and
    /// the other way around.
    pub fn supports(&self, usage: UsageKind) -> bool {
        let (needed, depth) = match usage {
            UsageKind::Undefined => return true,
            UsageKind::Sampled | UsageKind::ReadTexture => (vk::ImageUsageFlags::SAMPLED, None),
            UsageKind::WriteTexture => (vk::ImageUsageFlags::STORAGE, Some(false)),
            UsageKind::RenderTarget => (vk::ImageUsageFlags::COLOR_ATTACHMENT, Some(false)),
            UsageKind::DepthTarget => (vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT, Some(true)),
            UsageKind::DepthRead => (vk::ImageUsageFlags::SAMPLED, Some(true)),
            UsageKind::TransferSrc => (vk::ImageUsageFlags::TRANSFER_SRC, None),
            UsageKind::TransferDst => (vk::ImageUsageFlags::TRANSFER_DST, None),
            _ => return false,
        };
        let format_ok = depth.map(|d| d == self.is_depth()).unwrap_or(true);
        format_ok && self.usage.contains(needed)
    }

    pub fn is_bindless(&self) -> bool {
        self.usage
            .intersects(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::STORAGE)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureViewDesc {
    pub aspect: vk::ImageAspectFlags,
    pub base_mip: u32,
    pub mip_count: u32,
}

///Texture resource. View 0 is always the default view over the whole texture.
pub struct Texture<B: Backend> {
    pub(crate) desc: TextureDesc,
    pub(crate) native: B::Texture,
    pub(crate) views: Vec<(TextureViewDesc, B::TextureView)>,
    pub(crate) sync: SyncState,
    pub(crate) bindless: Option<u32>,
}

impl<B: Backend> Texture<B> {
    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.desc.extent
    }

    pub fn native(&self) -> &B::Texture {
        &self.native
    }

    pub fn view(&self, index: usize) -> Option<&B::TextureView> {
        self.views.get(index).map(|(_, v)| v)
    }

    ///The view created alongside the texture.
    pub fn default_view(&self) -> Option<&B::TextureView> {
        self.view(0)
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync
    }

    pub fn bindless_index(&self) -> Option<u32> {
        self.bindless
    }
}
