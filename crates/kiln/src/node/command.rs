use std::ops::Range;

use ash::vk;
use smallvec::SmallVec;

use crate::{
    backend::LoadOp, handle::Handle, resources::ParamBlock, sync_state::SyncState,
};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ColorTarget {
    pub texture: Handle,
    pub load: LoadOp<[f32; 4]>,
}

impl ColorTarget {
    pub fn clear(texture: Handle, color: [f32; 4]) -> Self {
        ColorTarget {
            texture,
            load: LoadOp::Clear(color),
        }
    }

    pub fn load(texture: Handle) -> Self {
        ColorTarget {
            texture,
            load: LoadOp::Load,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DepthTarget {
    pub texture: Handle,
    pub load: LoadOp<f32>,
}

impl DepthTarget {
    pub fn clear(texture: Handle, depth: f32) -> Self {
        DepthTarget {
            texture,
            load: LoadOp::Clear(depth),
        }
    }
}

///Attachments of a render pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RenderPassDesc {
    pub colors: SmallVec<[ColorTarget; 4]>,
    pub depth: Option<DepthTarget>,
}

impl RenderPassDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_color(mut self, target: ColorTarget) -> Self {
        self.colors.push(target);
        self
    }

    pub fn with_depth(mut self, target: DepthTarget) -> Self {
        self.depth = Some(target);
        self
    }

    ///Handles of all attachments, colors first.
    pub fn attachments(&self) -> impl Iterator<Item = Handle> + '_ {
        self.colors
            .iter()
            .map(|c| c.texture)
            .chain(self.depth.iter().map(|d| d.texture))
    }
}

///Area for viewport and scissor. `Auto` covers the first attachment of the open render pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Region {
    #[default]
    Auto,
    Explicit(vk::Rect2D),
}

impl Region {
    pub(crate) fn resolve(&self, pass_extent: vk::Extent2D) -> vk::Rect2D {
        match self {
            Region::Auto => vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: pass_extent,
            },
            Region::Explicit(rect) => *rect,
        }
    }
}

///Entry of a node's command log. Only references resources by handle, natives are resolved on replay.
#[derive(Clone, Debug)]
pub(crate) enum NodeCommand {
    ///Usage declaration.
    Use {
        handle: Handle,
        state: SyncState,
    },
    BeginCompute,
    BeginRender(RenderPassDesc),
    EndPass,
    BindKernel(Handle),
    BindVertexBuffers {
        first: u32,
        buffers: SmallVec<[(Handle, u64); 4]>,
    },
    BindIndexBuffer {
        buffer: Handle,
        offset: u64,
        index_type: vk::IndexType,
    },
    SetViewport(Region),
    SetScissor(Region),
    PushConstants(Vec<u8>),
    PushParams(ParamBlock),
    Draw {
        vertices: Range<u32>,
        instances: Range<u32>,
    },
    DrawIndexed {
        indices: Range<u32>,
        vertex_offset: i32,
        instances: Range<u32>,
    },
    DrawIndexedIndirect {
        buffer: Handle,
        offset: u64,
        draw_count: u32,
        stride: u32,
    },
    Dispatch([u32; 3]),
    CopyBuffer {
        src: Handle,
        dst: Handle,
        regions: SmallVec<[vk::BufferCopy; 1]>,
    },
}
