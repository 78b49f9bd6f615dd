//! The seam between kiln and a native graphics API.
//!
//! Kiln itself never talks to a driver. It decides *what* has to happen (which barrier, which copy, which pass in
//! which order) and hands the native work to a [Backend]. All recording goes through the single
//! [Backend::record] entry point taking a [NativeCommand].

use std::ops::Range;

use ash::vk;

use crate::{
    resources::{BufferDesc, BufferViewDesc, KernelDesc, TextureDesc, TextureViewDesc},
    sync_state::Barrier,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandLevel {
    Primary,
    Secondary,
}

///Image of the presentation surface acquired for one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceImage {
    pub index: u32,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LoadOp<T> {
    Load,
    Clear(T),
    DontCare,
}

pub enum NativeBarrier<'a, B: Backend> {
    Buffer {
        buffer: &'a B::Buffer,
        barrier: Barrier,
    },
    Texture {
        texture: &'a B::Texture,
        aspect: vk::ImageAspectFlags,
        barrier: Barrier,
    },
}

pub struct ColorAttachment<'a, B: Backend> {
    pub view: &'a B::TextureView,
    pub load: LoadOp<[f32; 4]>,
}

pub struct DepthAttachment<'a, B: Backend> {
    pub view: &'a B::TextureView,
    pub load: LoadOp<f32>,
}

///Every command kiln records into a command buffer.
pub enum NativeCommand<'a, B: Backend> {
    Barriers(&'a [NativeBarrier<'a, B>]),
    BeginRendering {
        extent: vk::Extent2D,
        colors: &'a [ColorAttachment<'a, B>],
        depth: Option<DepthAttachment<'a, B>>,
    },
    EndRendering,
    BindPipeline(&'a B::Pipeline),
    BindVertexBuffers {
        first: u32,
        buffers: &'a [(&'a B::Buffer, u64)],
    },
    BindIndexBuffer {
        buffer: &'a B::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    },
    SetViewport(vk::Viewport),
    SetScissor(vk::Rect2D),
    ///Push constants of the bound pipeline. All kernels share one layout.
    PushConstants(&'a [u8]),
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
        buffer: &'a B::Buffer,
        offset: u64,
        draw_count: u32,
        stride: u32,
    },
    Dispatch([u32; 3]),
    CopyBuffer {
        src: &'a B::Buffer,
        dst: &'a B::Buffer,
        regions: &'a [vk::BufferCopy],
    },
    ///Blits `src` (in `TRANSFER_SRC_OPTIMAL`) onto the surface image and leaves the surface image ready for
    /// presentation.
    BlitToSurface {
        src: &'a B::Texture,
        src_extent: vk::Extent2D,
        surface: SurfaceImage,
    },
    ExecuteSecondary(&'a [&'a B::CommandBuffer]),
}

///Write into the bindless descriptor arrays.
pub enum BindlessWrite<'a, B: Backend> {
    Buffer {
        slot: u32,
        buffer: &'a B::Buffer,
    },
    Texture {
        slot: u32,
        view: &'a B::TextureView,
        sampled: bool,
        storage: bool,
    },
}

///Native graphics API implementation.
///
/// Objects are created and destroyed through `&self`, since creation might happen from multiple threads. Destruction
/// is only ever called once the GPU can not be using the object anymore.
pub trait Backend: Sized + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    type Buffer: Send + Sync;
    type BufferView: Send + Sync;
    type Texture: Send + Sync;
    type TextureView: Send + Sync;
    type Pipeline: Send + Sync;
    type CommandPool: Send + Sync;
    type CommandBuffer: Send + Sync;
    type Fence: Send + Sync;

    fn create_buffer(&self, desc: &BufferDesc) -> Result<Self::Buffer, Self::Error>;
    fn destroy_buffer(&self, buffer: Self::Buffer);
    fn create_buffer_view(
        &self,
        buffer: &Self::Buffer,
        desc: &BufferViewDesc,
    ) -> Result<Self::BufferView, Self::Error>;
    fn destroy_buffer_view(&self, view: Self::BufferView);
    ///Writes `data` at `offset` into a host visible buffer.
    fn write_buffer(
        &self,
        buffer: &mut Self::Buffer,
        offset: u64,
        data: &[u8],
    ) -> Result<(), Self::Error>;
    ///Device address of `buffer`, if it was created with `SHADER_DEVICE_ADDRESS` usage.
    fn buffer_device_address(&self, buffer: &Self::Buffer) -> Option<u64>;

    fn create_texture(&self, desc: &TextureDesc) -> Result<Self::Texture, Self::Error>;
    fn destroy_texture(&self, texture: Self::Texture);
    fn create_texture_view(
        &self,
        texture: &Self::Texture,
        desc: &TextureViewDesc,
    ) -> Result<Self::TextureView, Self::Error>;
    fn destroy_texture_view(&self, view: Self::TextureView);

    fn write_bindless(&self, write: BindlessWrite<'_, Self>);

    fn create_pipeline(&self, desc: &KernelDesc) -> Result<Self::Pipeline, Self::Error>;
    fn destroy_pipeline(&self, pipeline: Self::Pipeline);

    fn create_command_pool(&self) -> Result<Self::CommandPool, Self::Error>;
    ///Resets all command buffers allocated from `pool`.
    fn reset_command_pool(&self, pool: &mut Self::CommandPool) -> Result<(), Self::Error>;
    fn allocate_command_buffer(
        &self,
        pool: &mut Self::CommandPool,
        level: CommandLevel,
    ) -> Result<Self::CommandBuffer, Self::Error>;
    ///Destroys the pool and every command buffer allocated from it.
    fn destroy_command_pool(&self, pool: Self::CommandPool);
    fn begin(&self, command_buffer: &mut Self::CommandBuffer) -> Result<(), Self::Error>;
    fn end(&self, command_buffer: &mut Self::CommandBuffer) -> Result<(), Self::Error>;
    fn record(&self, command_buffer: &mut Self::CommandBuffer, command: NativeCommand<'_, Self>);

    fn create_fence(&self, signaled: bool) -> Result<Self::Fence, Self::Error>;
    fn wait_fence(&self, fence: &Self::Fence, timeout: u64) -> Result<(), Self::Error>;
    fn reset_fence(&self, fence: &Self::Fence) -> Result<(), Self::Error>;
    fn destroy_fence(&self, fence: Self::Fence);

    ///Acquires the next surface image for frame slot `slot`. Returns `None` if the backend has no surface.
    /// Out-of-date surfaces are recreated internally.
    fn acquire_surface(&self, slot: usize) -> Result<Option<SurfaceImage>, Self::Error>;
    ///Submits `command_buffer` and signals `fence` once it finished. If `surface` is set, the submission waits for
    /// the surface image to be acquired and signals its readiness for presentation.
    fn submit(
        &self,
        slot: usize,
        command_buffer: &Self::CommandBuffer,
        fence: &Self::Fence,
        surface: Option<&SurfaceImage>,
    ) -> Result<(), Self::Error>;
    fn present(&self, slot: usize, surface: &SurfaceImage) -> Result<(), Self::Error>;
    fn wait_idle(&self) -> Result<(), Self::Error>;
}
