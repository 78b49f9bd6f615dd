//! Resource objects stored in the [ResourceStore](crate::ResourceStore) and the descriptions they are created from.

mod buffer;
mod kernel;
mod texture;

pub use buffer::{Buffer, BufferDesc, BufferViewDesc, MemoryUsage};
pub(crate) use buffer::Staging;
pub use kernel::{
    GraphicsState, Kernel, KernelDesc, ParamBlock, ParamEntry, ParamTable, ShaderStage,
    VertexAttribute, VertexBinding,
};
pub use texture::{Texture, TextureDesc, TextureViewDesc, is_depth_format};
