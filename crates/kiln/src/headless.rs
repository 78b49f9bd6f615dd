//! Backend that executes nothing but records everything.
//!
//! Every native object is a plain id. Command buffers keep the list of commands recorded into them, submissions
//! snapshot the primary command buffer (including executed secondaries). Submitted work "finishes" immediately,
//! so fences are signaled by [Backend::submit]. Waiting on a fence that was reset but never submitted is an error,
//! since that would dead-lock on a real device.

use std::{
    ops::Range,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
};

use ash::vk;
use thiserror::Error;

use crate::{
    backend::{
        Backend, BindlessWrite, CommandLevel, LoadOp, NativeBarrier, NativeCommand, SurfaceImage,
    },
    resources::{BufferDesc, BufferViewDesc, KernelDesc, TextureDesc, TextureViewDesc},
    sync_state::{Barrier, KernelKind},
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeadlessError {
    #[error("Buffer {0} is not host visible")]
    NotHostVisible(u64),
    #[error("Write of {len} bytes at {offset} exceeds buffer {id} of size {size}")]
    OutOfBounds {
        id: u64,
        offset: u64,
        len: u64,
        size: u64,
    },
    #[error("Fence {0} was never submitted and would block forever")]
    FenceNeverSignaled(u64),
    #[error("Command buffer {0} is not recording")]
    NotRecording(u64),
    #[error("Injected failure at {0:?}")]
    Injected(FailPoint),
    #[error("Invalid kernel: {0}")]
    InvalidKernel(&'static str),
}

///Calls that can be made to fail through [HeadlessBackend::fail_next].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailPoint {
    CreateBuffer,
    CreateBufferView,
    CreateTexture,
    CreateTextureView,
    CreatePipeline,
    ///Beginning a secondary command buffer, which happens while a node is replayed.
    BeginSecondary,
    Acquire,
    Submit,
}

#[derive(Debug)]
pub struct HeadlessBuffer {
    pub id: u64,
    pub size: u64,
    pub host_visible: bool,
    pub address: Option<u64>,
    ///Content of host visible buffers.
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct HeadlessTexture {
    pub id: u64,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
}

#[derive(Debug)]
pub struct HeadlessView {
    pub id: u64,
    pub parent: u64,
}

#[derive(Debug)]
pub struct HeadlessPipeline {
    pub id: u64,
    pub kind: KernelKind,
}

#[derive(Debug)]
pub struct HeadlessCommandPool {
    pub id: u64,
    pub resets: u64,
}

#[derive(Debug)]
pub struct HeadlessCommandBuffer {
    pub id: u64,
    pub pool: u64,
    pub level: CommandLevel,
    pub commands: Vec<RecordedCommand>,
    recording: bool,
}

#[derive(Debug)]
pub struct HeadlessFence {
    pub id: u64,
    signaled: AtomicBool,
    pending: AtomicBool,
}

///Plain copy of a [NativeCommand] where every native object is replaced by its id.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordedCommand {
    Barrier {
        resource: u64,
        barrier: Barrier,
    },
    BeginRendering {
        extent: vk::Extent2D,
        colors: Vec<u64>,
        cleared: Vec<bool>,
        depth: Option<u64>,
    },
    EndRendering,
    BindPipeline(u64),
    BindVertexBuffers {
        first: u32,
        buffers: Vec<(u64, u64)>,
    },
    BindIndexBuffer {
        buffer: u64,
        offset: u64,
    },
    ///`[x, y, width, height]`
    SetViewport([f32; 4]),
    ///`(offset, extent)`
    SetScissor((i32, i32), (u32, u32)),
    PushConstants(Vec<u8>),
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
        buffer: u64,
        offset: u64,
        draw_count: u32,
        stride: u32,
    },
    Dispatch([u32; 3]),
    CopyBuffer {
        src: u64,
        dst: u64,
        ///`(src_offset, dst_offset, size)`
        regions: Vec<(u64, u64, u64)>,
    },
    BlitToSurface {
        src: u64,
        image: u32,
    },
    ///Commands of each executed secondary command buffer, in order.
    Execute(Vec<(u64, Vec<RecordedCommand>)>),
}

impl RecordedCommand {
    pub fn is_barrier(&self) -> bool {
        matches!(self, RecordedCommand::Barrier { .. })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    CreateBuffer { id: u64, size: u64 },
    DestroyBuffer(u64),
    CreateBufferView { id: u64, buffer: u64 },
    DestroyBufferView(u64),
    CreateTexture { id: u64 },
    DestroyTexture(u64),
    CreateTextureView { id: u64, texture: u64 },
    DestroyTextureView(u64),
    BindlessBuffer { slot: u32, buffer: u64 },
    BindlessTexture { slot: u32, view: u64 },
    CreatePipeline { id: u64, kind: KernelKind },
    DestroyPipeline(u64),
    CreateCommandPool(u64),
    ResetCommandPool(u64),
    DestroyCommandPool(u64),
    CreateFence(u64),
    WaitFence(u64),
    ResetFence(u64),
    DestroyFence(u64),
    Acquire { slot: usize, image: u32 },
    Submit {
        slot: usize,
        fence: u64,
        commands: Vec<RecordedCommand>,
    },
    Present { slot: usize, image: u32 },
    WaitIdle,
}

pub struct HeadlessBackend {
    next_id: AtomicU64,
    surface: Option<vk::Extent2D>,
    next_image: AtomicU32,
    events: Mutex<Vec<Event>>,
    fail: Mutex<Vec<FailPoint>>,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    ///Number of images the simulated surface rotates through.
    pub const SURFACE_IMAGES: u32 = 3;

    pub fn new() -> Self {
        HeadlessBackend {
            next_id: AtomicU64::new(1),
            surface: None,
            next_image: AtomicU32::new(0),
            events: Mutex::new(Vec::new()),
            fail: Mutex::new(Vec::new()),
        }
    }

    ///Simulates a presentation surface of `extent`.
    pub fn with_surface(mut self, extent: vk::Extent2D) -> Self {
        self.surface = Some(extent);
        self
    }

    ///Makes the next call of `point` fail.
    pub fn fail_next(&self, point: FailPoint) {
        self.fail.lock().unwrap_or_else(PoisonError::into_inner).push(point);
    }

    pub fn events(&self) -> Vec<Event> {
        self.lock_events().clone()
    }

    pub fn clear_events(&self) {
        self.lock_events().clear();
    }

    ///All submitted primary command buffers in submission order.
    pub fn submissions(&self) -> Vec<Vec<RecordedCommand>> {
        self.lock_events()
            .iter()
            .filter_map(|e| match e {
                Event::Submit { commands, .. } => Some(commands.clone()),
                _ => None,
            })
            .collect()
    }

    ///Index of the first event matching `filter`.
    pub fn position(&self, filter: impl Fn(&Event) -> bool) -> Option<usize> {
        self.lock_events().iter().position(filter)
    }

    pub fn was_destroyed(&self, id: u64) -> bool {
        self.lock_events().iter().any(|e| match e {
            Event::DestroyBuffer(i)
            | Event::DestroyBufferView(i)
            | Event::DestroyTexture(i)
            | Event::DestroyTextureView(i)
            | Event::DestroyPipeline(i)
            | Event::DestroyCommandPool(i)
            | Event::DestroyFence(i) => *i == id,
            _ => false,
        })
    }

    fn lock_events(&self) -> MutexGuard<'_, Vec<Event>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, event: Event) {
        self.lock_events().push(event);
    }

    fn id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check(&self, point: FailPoint) -> Result<(), HeadlessError> {
        let mut fail = self.fail.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(at) = fail.iter().position(|p| *p == point) {
            fail.remove(at);
            Err(HeadlessError::Injected(point))
        } else {
            Ok(())
        }
    }

    fn translate(&self, command: NativeCommand<'_, Self>, out: &mut Vec<RecordedCommand>) {
        let recorded = match command {
            NativeCommand::Barriers(barriers) => {
                for barrier in barriers {
                    let (resource, barrier) = match barrier {
                        NativeBarrier::Buffer { buffer, barrier } => (buffer.id, *barrier),
                        NativeBarrier::Texture {
                            texture, barrier, ..
                        } => (texture.id, *barrier),
                    };
                    out.push(RecordedCommand::Barrier { resource, barrier });
                }
                return;
            }
            NativeCommand::BeginRendering {
                extent,
                colors,
                depth,
            } => RecordedCommand::BeginRendering {
                extent,
                colors: colors.iter().map(|c| c.view.id).collect(),
                cleared: colors
                    .iter()
                    .map(|c| matches!(c.load, LoadOp::Clear(_)))
                    .collect(),
                depth: depth.map(|d| d.view.id),
            },
            NativeCommand::EndRendering => RecordedCommand::EndRendering,
            NativeCommand::BindPipeline(p) => RecordedCommand::BindPipeline(p.id),
            NativeCommand::BindVertexBuffers { first, buffers } => {
                RecordedCommand::BindVertexBuffers {
                    first,
                    buffers: buffers.iter().map(|(b, o)| (b.id, *o)).collect(),
                }
            }
            NativeCommand::BindIndexBuffer { buffer, offset, .. } => {
                RecordedCommand::BindIndexBuffer {
                    buffer: buffer.id,
                    offset,
                }
            }
            NativeCommand::SetViewport(v) => {
                RecordedCommand::SetViewport([v.x, v.y, v.width, v.height])
            }
            NativeCommand::SetScissor(r) => RecordedCommand::SetScissor(
                (r.offset.x, r.offset.y),
                (r.extent.width, r.extent.height),
            ),
            NativeCommand::PushConstants(data) => RecordedCommand::PushConstants(data.to_vec()),
            NativeCommand::Draw {
                vertices,
                instances,
            } => RecordedCommand::Draw {
                vertices,
                instances,
            },
            NativeCommand::DrawIndexed {
                indices,
                vertex_offset,
                instances,
            } => RecordedCommand::DrawIndexed {
                indices,
                vertex_offset,
                instances,
            },
            NativeCommand::DrawIndexedIndirect {
                buffer,
                offset,
                draw_count,
                stride,
            } => RecordedCommand::DrawIndexedIndirect {
                buffer: buffer.id,
                offset,
                draw_count,
                stride,
            },
            NativeCommand::Dispatch(groups) => RecordedCommand::Dispatch(groups),
            NativeCommand::CopyBuffer { src, dst, regions } => RecordedCommand::CopyBuffer {
                src: src.id,
                dst: dst.id,
                regions: regions
                    .iter()
                    .map(|r| (r.src_offset, r.dst_offset, r.size))
                    .collect(),
            },
            NativeCommand::BlitToSurface { src, surface, .. } => RecordedCommand::BlitToSurface {
                src: src.id,
                image: surface.index,
            },
            NativeCommand::ExecuteSecondary(buffers) => RecordedCommand::Execute(
                buffers
                    .iter()
                    .map(|cb| (cb.id, cb.commands.clone()))
                    .collect(),
            ),
        };
        out.push(recorded);
    }
}

impl Backend for HeadlessBackend {
    type Error = HeadlessError;
    type Buffer = HeadlessBuffer;
    type BufferView = HeadlessView;
    type Texture = HeadlessTexture;
    type TextureView = HeadlessView;
    type Pipeline = HeadlessPipeline;
    type CommandPool = HeadlessCommandPool;
    type CommandBuffer = HeadlessCommandBuffer;
    type Fence = HeadlessFence;

    fn create_buffer(&self, desc: &BufferDesc) -> Result<Self::Buffer, Self::Error> {
        self.check(FailPoint::CreateBuffer)?;
        let id = self.id();
        let host_visible = desc.memory.is_host_visible();
        self.push(Event::CreateBuffer {
            id,
            size: desc.size,
        });
        Ok(HeadlessBuffer {
            id,
            size: desc.size,
            host_visible,
            address: desc.has_device_address().then_some(0x1000_0000 + id * 0x1_0000),
            data: if host_visible {
                vec![0; desc.size as usize]
            } else {
                Vec::new()
            },
        })
    }

    fn destroy_buffer(&self, buffer: Self::Buffer) {
        self.push(Event::DestroyBuffer(buffer.id));
    }

    fn create_buffer_view(
        &self,
        buffer: &Self::Buffer,
        _desc: &BufferViewDesc,
    ) -> Result<Self::BufferView, Self::Error> {
        self.check(FailPoint::CreateBufferView)?;
        let id = self.id();
        self.push(Event::CreateBufferView {
            id,
            buffer: buffer.id,
        });
        Ok(HeadlessView {
            id,
            parent: buffer.id,
        })
    }

    fn destroy_buffer_view(&self, view: Self::BufferView) {
        self.push(Event::DestroyBufferView(view.id));
    }

    fn write_buffer(
        &self,
        buffer: &mut Self::Buffer,
        offset: u64,
        data: &[u8],
    ) -> Result<(), Self::Error> {
        if !buffer.host_visible {
            return Err(HeadlessError::NotHostVisible(buffer.id));
        }
        let end = offset + data.len() as u64;
        if end > buffer.size {
            return Err(HeadlessError::OutOfBounds {
                id: buffer.id,
                offset,
                len: data.len() as u64,
                size: buffer.size,
            });
        }
        buffer.data[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn buffer_device_address(&self, buffer: &Self::Buffer) -> Option<u64> {
        buffer.address
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<Self::Texture, Self::Error> {
        self.check(FailPoint::CreateTexture)?;
        let id = self.id();
        self.push(Event::CreateTexture { id });
        Ok(HeadlessTexture {
            id,
            extent: desc.extent,
            format: desc.format,
        })
    }

    fn destroy_texture(&self, texture: Self::Texture) {
        self.push(Event::DestroyTexture(texture.id));
    }

    fn create_texture_view(
        &self,
        texture: &Self::Texture,
        _desc: &TextureViewDesc,
    ) -> Result<Self::TextureView, Self::Error> {
        self.check(FailPoint::CreateTextureView)?;
        let id = self.id();
        self.push(Event::CreateTextureView {
            id,
            texture: texture.id,
        });
        Ok(HeadlessView {
            id,
            parent: texture.id,
        })
    }

    fn destroy_texture_view(&self, view: Self::TextureView) {
        self.push(Event::DestroyTextureView(view.id));
    }

    fn write_bindless(&self, write: BindlessWrite<'_, Self>) {
        match write {
            BindlessWrite::Buffer { slot, buffer } => self.push(Event::BindlessBuffer {
                slot,
                buffer: buffer.id,
            }),
            BindlessWrite::Texture { slot, view, .. } => {
                self.push(Event::BindlessTexture { slot, view: view.id })
            }
        }
    }

    fn create_pipeline(&self, desc: &KernelDesc) -> Result<Self::Pipeline, Self::Error> {
        self.check(FailPoint::CreatePipeline)?;
        desc.validate().map_err(HeadlessError::InvalidKernel)?;
        let id = self.id();
        self.push(Event::CreatePipeline {
            id,
            kind: desc.kind,
        });
        Ok(HeadlessPipeline {
            id,
            kind: desc.kind,
        })
    }

    fn destroy_pipeline(&self, pipeline: Self::Pipeline) {
        self.push(Event::DestroyPipeline(pipeline.id));
    }

    fn create_command_pool(&self) -> Result<Self::CommandPool, Self::Error> {
        let id = self.id();
        self.push(Event::CreateCommandPool(id));
        Ok(HeadlessCommandPool { id, resets: 0 })
    }

    fn reset_command_pool(&self, pool: &mut Self::CommandPool) -> Result<(), Self::Error> {
        pool.resets += 1;
        self.push(Event::ResetCommandPool(pool.id));
        Ok(())
    }

    fn allocate_command_buffer(
        &self,
        pool: &mut Self::CommandPool,
        level: CommandLevel,
    ) -> Result<Self::CommandBuffer, Self::Error> {
        Ok(HeadlessCommandBuffer {
            id: self.id(),
            pool: pool.id,
            level,
            commands: Vec::new(),
            recording: false,
        })
    }

    fn destroy_command_pool(&self, pool: Self::CommandPool) {
        self.push(Event::DestroyCommandPool(pool.id));
    }

    fn begin(&self, command_buffer: &mut Self::CommandBuffer) -> Result<(), Self::Error> {
        if command_buffer.level == CommandLevel::Secondary {
            self.check(FailPoint::BeginSecondary)?;
        }
        command_buffer.commands.clear();
        command_buffer.recording = true;
        Ok(())
    }

    fn end(&self, command_buffer: &mut Self::CommandBuffer) -> Result<(), Self::Error> {
        if !command_buffer.recording {
            return Err(HeadlessError::NotRecording(command_buffer.id));
        }
        command_buffer.recording = false;
        Ok(())
    }

    fn record(&self, command_buffer: &mut Self::CommandBuffer, command: NativeCommand<'_, Self>) {
        self.translate(command, &mut command_buffer.commands);
    }

    fn create_fence(&self, signaled: bool) -> Result<Self::Fence, Self::Error> {
        let id = self.id();
        self.push(Event::CreateFence(id));
        Ok(HeadlessFence {
            id,
            signaled: AtomicBool::new(signaled),
            pending: AtomicBool::new(false),
        })
    }

    fn wait_fence(&self, fence: &Self::Fence, _timeout: u64) -> Result<(), Self::Error> {
        self.push(Event::WaitFence(fence.id));
        if fence.signaled.load(Ordering::Acquire) || fence.pending.load(Ordering::Acquire) {
            fence.signaled.store(true, Ordering::Release);
            Ok(())
        } else {
            Err(HeadlessError::FenceNeverSignaled(fence.id))
        }
    }

    fn reset_fence(&self, fence: &Self::Fence) -> Result<(), Self::Error> {
        self.push(Event::ResetFence(fence.id));
        fence.signaled.store(false, Ordering::Release);
        fence.pending.store(false, Ordering::Release);
        Ok(())
    }

    fn destroy_fence(&self, fence: Self::Fence) {
        self.push(Event::DestroyFence(fence.id));
    }

    fn acquire_surface(&self, slot: usize) -> Result<Option<SurfaceImage>, Self::Error> {
        let Some(extent) = self.surface else {
            return Ok(None);
        };
        self.check(FailPoint::Acquire)?;
        let image = self.next_image.fetch_add(1, Ordering::Relaxed) % Self::SURFACE_IMAGES;
        self.push(Event::Acquire { slot, image });
        Ok(Some(SurfaceImage {
            index: image,
            extent,
            format: vk::Format::B8G8R8A8_SRGB,
        }))
    }

    fn submit(
        &self,
        slot: usize,
        command_buffer: &Self::CommandBuffer,
        fence: &Self::Fence,
        _surface: Option<&SurfaceImage>,
    ) -> Result<(), Self::Error> {
        self.check(FailPoint::Submit)?;
        if command_buffer.recording {
            return Err(HeadlessError::NotRecording(command_buffer.id));
        }
        self.push(Event::Submit {
            slot,
            fence: fence.id,
            commands: command_buffer.commands.clone(),
        });
        //execution is instant, the fence is signaled once somebody looks at it.
        fence.pending.store(true, Ordering::Release);
        Ok(())
    }

    fn present(&self, slot: usize, surface: &SurfaceImage) -> Result<(), Self::Error> {
        self.push(Event::Present {
            slot,
            image: surface.index,
        });
        Ok(())
    }

    fn wait_idle(&self) -> Result<(), Self::Error> {
        self.push(Event::WaitIdle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    #[test]
    fn headless_is_send_sync() {
        assert_impl_all!(HeadlessBackend: Send, Sync);
    }

    #[test]
    fn unsubmitted_fence_does_not_block() {
        let backend = HeadlessBackend::new();
        let fence = backend.create_fence(true).unwrap();
        assert!(backend.wait_fence(&fence, u64::MAX).is_ok());
        backend.reset_fence(&fence).unwrap();
        assert_eq!(
            backend.wait_fence(&fence, u64::MAX),
            Err(HeadlessError::FenceNeverSignaled(fence.id))
        );
    }

    #[test]
    fn device_local_buffers_are_not_mappable() {
        let backend = HeadlessBackend::new();
        let mut buffer = backend.create_buffer(&BufferDesc::storage(16)).unwrap();
        assert!(matches!(
            backend.write_buffer(&mut buffer, 0, &[1, 2, 3]),
            Err(HeadlessError::NotHostVisible(_))
        ));
        let mut staging = backend.create_buffer(&BufferDesc::staging(4)).unwrap();
        backend.write_buffer(&mut staging, 1, &[1, 2, 3]).unwrap();
        assert_eq!(staging.data, vec![0, 1, 2, 3]);
        assert!(backend.write_buffer(&mut staging, 2, &[1, 2, 3]).is_err());
    }

    #[test]
    fn injected_failure_fires_once() {
        let backend = HeadlessBackend::new();
        backend.fail_next(FailPoint::CreateTexture);
        let desc = TextureDesc::render_target(
            vk::Extent2D {
                width: 4,
                height: 4,
            },
            vk::Format::R8G8B8A8_UNORM,
        );
        assert!(backend.create_texture(&desc).is_err());
        assert!(backend.create_texture(&desc).is_ok());
    }
}
