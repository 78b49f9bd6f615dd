use std::ops::Range;

use ash::vk;
use smallvec::SmallVec;

use super::{NodeCommand, Region, RenderNode, RenderPassDesc};
use crate::{
    backend::Backend,
    error::RecordError,
    handle::{Handle, ResourceKind},
    resources::ParamBlock,
    store::ResourceStore,
    sync_state::{KernelKind, SyncState, UsageKind, scope},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PassState {
    OutOfPass,
    ComputePass,
    RenderPass,
}

impl PassState {
    fn kernel_kind(&self) -> Option<KernelKind> {
        match self {
            PassState::OutOfPass => None,
            PassState::ComputePass => Some(KernelKind::Compute),
            PassState::RenderPass => Some(KernelKind::Graphics),
        }
    }
}

///Records commands into a [RenderNode].
///
/// Every call is validated immediately. A rejected call is logged, returns an error and leaves the node exactly as it
/// was before the call. Starting a recorder clears the node's previous log.
///
/// All barriers of a node are recorded in front of all of its commands, including the barriers for a change of use
/// in the middle of the node. Using a texture as render target and then sampling it within the same node therefore
/// transitions it to the sampled layout *before* the render pass runs. Split such work into two nodes, the second
/// one waiting for the first.
pub struct NodeRecorder<'a, B: Backend> {
    node: &'a mut RenderNode<B>,
    store: &'a ResourceStore<B>,
    push_constant_size: u32,
    pass: PassState,
    kernel: Option<(Handle, KernelKind)>,
}

impl<'a, B: Backend> NodeRecorder<'a, B> {
    pub(crate) fn new(
        node: &'a mut RenderNode<B>,
        store: &'a ResourceStore<B>,
        push_constant_size: u32,
    ) -> Self {
        node.clear();
        NodeRecorder {
            node,
            store,
            push_constant_size,
            pass: PassState::OutOfPass,
            kernel: None,
        }
    }

    pub fn node_name(&self) -> &str {
        self.node.name()
    }

    fn reject<T>(&self, error: RecordError) -> Result<T, RecordError> {
        #[cfg(feature = "logging")]
        log::error!("Node {}: rejected command: {}", self.node.name(), error);
        Err(error)
    }

    fn open_pass_kind(&self) -> Result<KernelKind, RecordError> {
        match self.pass.kernel_kind() {
            Some(kind) => Ok(kind),
            None => self.reject(RecordError::NotInPass("compute or render")),
        }
    }

    fn bound_kernel(&self) -> Result<(Handle, KernelKind), RecordError> {
        match self.kernel {
            Some(k) => Ok(k),
            None => self.reject(RecordError::NoKernelBound),
        }
    }

    ///Checks that `handle` can be used as `usage` by a kernel of kind `kernel`.
    fn check_use(
        &self,
        handle: Handle,
        usage: UsageKind,
        kernel: KernelKind,
    ) -> Result<(), RecordError> {
        if handle.kind() == ResourceKind::Kernel || !usage.applies_to(handle.kind()) {
            let expected = if usage.is_texture_only() {
                ResourceKind::Texture
            } else {
                ResourceKind::Buffer
            };
            return self.reject(RecordError::WrongKind { handle, expected });
        }

        let supported = {
            let arenas = self.store.read();
            match handle.kind() {
                ResourceKind::Buffer => arenas.buffer(handle).map(|b| b.desc.supports(usage)),
                _ => arenas.texture(handle).map(|t| t.desc.supports(usage)),
            }
        };
        match supported {
            None => return self.reject(RecordError::InvalidHandle(handle)),
            Some(false) => return self.reject(RecordError::RoleForbidden { handle, usage }),
            Some(true) => {}
        }

        if let Err(e) = scope(handle.kind(), SyncState::new(kernel, usage)) {
            return self.reject(e.into());
        }
        Ok(())
    }

    fn push_use(&mut self, handle: Handle, kernel: KernelKind, usage: UsageKind) {
        self.node.push(NodeCommand::Use {
            handle,
            state: SyncState::new(kernel, usage),
        });
    }

    pub fn begin_compute_pass(&mut self) -> Result<&mut Self, RecordError> {
        if self.pass != PassState::OutOfPass {
            return self.reject(RecordError::PassNesting);
        }
        self.pass = PassState::ComputePass;
        self.node.push(NodeCommand::BeginCompute);
        Ok(self)
    }

    ///Begins a render pass on the given attachments. Color attachments are declared as render targets, the depth
    /// attachment as depth target.
    pub fn begin_render_pass(&mut self, desc: RenderPassDesc) -> Result<&mut Self, RecordError> {
        if self.pass != PassState::OutOfPass {
            return self.reject(RecordError::PassNesting);
        }
        if desc.colors.is_empty() && desc.depth.is_none() {
            return self.reject(RecordError::NoAttachments);
        }
        for color in desc.colors.iter() {
            self.check_use(color.texture, UsageKind::RenderTarget, KernelKind::Graphics)?;
        }
        if let Some(depth) = &desc.depth {
            self.check_use(depth.texture, UsageKind::DepthTarget, KernelKind::Graphics)?;
        }
        let same_extent = {
            let arenas = self.store.read();
            let mut extents = desc
                .attachments()
                .filter_map(|h| arenas.texture(h).map(|t| t.extent()));
            match extents.next() {
                Some(first) => extents.all(|e| e == first),
                None => false,
            }
        };
        if !same_extent {
            return self.reject(RecordError::ExtentMismatch);
        }

        for color in desc.colors.iter() {
            self.push_use(color.texture, KernelKind::Graphics, UsageKind::RenderTarget);
        }
        if let Some(depth) = &desc.depth {
            self.push_use(depth.texture, KernelKind::Graphics, UsageKind::DepthTarget);
        }
        self.pass = PassState::RenderPass;
        self.node.push(NodeCommand::BeginRender(desc));
        Ok(self)
    }

    pub fn end_pass(&mut self) -> Result<&mut Self, RecordError> {
        if self.pass == PassState::OutOfPass {
            return self.reject(RecordError::NotInPass("compute or render"));
        }
        self.pass = PassState::OutOfPass;
        self.kernel = None;
        self.node.push(NodeCommand::EndPass);
        Ok(self)
    }

    pub fn bind_kernel(&mut self, kernel: Handle) -> Result<&mut Self, RecordError> {
        let pass = self.open_pass_kind()?;
        if kernel.kind() != ResourceKind::Kernel {
            return self.reject(RecordError::WrongKind {
                handle: kernel,
                expected: ResourceKind::Kernel,
            });
        }
        let kind = self.store.read().kernel(kernel).map(|k| k.kind());
        let Some(kind) = kind else {
            return self.reject(RecordError::InvalidHandle(kernel));
        };
        if kind != pass {
            return self.reject(RecordError::KernelMismatch { kernel: kind, pass });
        }
        self.kernel = Some((kernel, kind));
        self.node.push(NodeCommand::BindKernel(kernel));
        Ok(self)
    }

    ///Declares that the open pass uses `handle` as `usage`.
    ///
    /// The barrier for this use is executed before any command of the node, see [NodeRecorder].
    pub fn declare(&mut self, handle: Handle, usage: UsageKind) -> Result<&mut Self, RecordError> {
        let kernel = self.open_pass_kind()?;
        self.check_use(handle, usage, kernel)?;
        self.push_use(handle, kernel, usage);
        Ok(self)
    }

    pub fn as_sampled_texture(&mut self, texture: Handle) -> Result<&mut Self, RecordError> {
        self.declare(texture, UsageKind::Sampled)
    }

    pub fn as_read_texture(&mut self, texture: Handle) -> Result<&mut Self, RecordError> {
        self.declare(texture, UsageKind::ReadTexture)
    }

    pub fn as_write_texture(&mut self, texture: Handle) -> Result<&mut Self, RecordError> {
        self.declare(texture, UsageKind::WriteTexture)
    }

    pub fn as_depth_read(&mut self, texture: Handle) -> Result<&mut Self, RecordError> {
        self.declare(texture, UsageKind::DepthRead)
    }

    pub fn as_read_buffer(&mut self, buffer: Handle) -> Result<&mut Self, RecordError> {
        self.declare(buffer, UsageKind::ReadBuffer)
    }

    pub fn as_write_buffer(&mut self, buffer: Handle) -> Result<&mut Self, RecordError> {
        self.declare(buffer, UsageKind::WriteBuffer)
    }

    pub fn as_uniform_buffer(&mut self, buffer: Handle) -> Result<&mut Self, RecordError> {
        self.declare(buffer, UsageKind::UniformBuffer)
    }

    ///Binds `(buffer, offset)` pairs starting at binding `first`. Each buffer is declared as vertex buffer.
    pub fn bind_vertex_buffers(
        &mut self,
        first: u32,
        buffers: &[(Handle, u64)],
    ) -> Result<&mut Self, RecordError> {
        if self.pass != PassState::RenderPass {
            return self.reject(RecordError::NotInPass("render"));
        }
        for (buffer, _) in buffers {
            self.check_use(*buffer, UsageKind::VertexBuffer, KernelKind::Graphics)?;
        }
        for (buffer, _) in buffers {
            self.push_use(*buffer, KernelKind::Graphics, UsageKind::VertexBuffer);
        }
        self.node.push(NodeCommand::BindVertexBuffers {
            first,
            buffers: SmallVec::from_slice(buffers),
        });
        Ok(self)
    }

    pub fn bind_index_buffer(
        &mut self,
        buffer: Handle,
        offset: u64,
        index_type: vk::IndexType,
    ) -> Result<&mut Self, RecordError> {
        if self.pass != PassState::RenderPass {
            return self.reject(RecordError::NotInPass("render"));
        }
        self.check_use(buffer, UsageKind::IndexBuffer, KernelKind::Graphics)?;
        self.push_use(buffer, KernelKind::Graphics, UsageKind::IndexBuffer);
        self.node.push(NodeCommand::BindIndexBuffer {
            buffer,
            offset,
            index_type,
        });
        Ok(self)
    }

    pub fn set_viewport(&mut self, region: Region) -> Result<&mut Self, RecordError> {
        if self.pass != PassState::RenderPass {
            return self.reject(RecordError::NotInPass("render"));
        }
        self.node.push(NodeCommand::SetViewport(region));
        Ok(self)
    }

    pub fn set_scissor(&mut self, region: Region) -> Result<&mut Self, RecordError> {
        if self.pass != PassState::RenderPass {
            return self.reject(RecordError::NotInPass("render"));
        }
        self.node.push(NodeCommand::SetScissor(region));
        Ok(self)
    }

    ///Pushes raw constants for the bound kernel.
    pub fn push_constants(&mut self, data: &[u8]) -> Result<&mut Self, RecordError> {
        self.bound_kernel()?;
        if data.len() as u32 > self.push_constant_size {
            return self.reject(RecordError::PushConstantsTooBig {
                size: data.len() as u32,
                max: self.push_constant_size,
            });
        }
        self.node.push(NodeCommand::PushConstants(data.to_vec()));
        Ok(self)
    }

    ///Pushes the parameter block of the bound kernel. Every resource in the block is declared with the usage the
    /// kernel's parameter table records for it.
    pub fn push_params(&mut self, block: &ParamBlock) -> Result<&mut Self, RecordError> {
        let (kernel, kind) = self.bound_kernel()?;
        if block.kernel() != kernel {
            return self.reject(RecordError::ForeignParameters);
        }
        for (handle, usage, entry) in block.resources() {
            self.check_use(handle, usage, kind)?;
            if entry.size == 8 {
                let addressable = self
                    .store
                    .read()
                    .buffer(handle)
                    .map(|b| b.desc.has_device_address())
                    .unwrap_or(false);
                if !addressable {
                    return self.reject(RecordError::RoleForbidden { handle, usage });
                }
            }
        }
        for (handle, usage, _) in block.resources() {
            self.push_use(handle, kind, usage);
        }
        self.node.push(NodeCommand::PushParams(block.clone()));
        Ok(self)
    }

    pub fn draw(
        &mut self,
        vertices: Range<u32>,
        instances: Range<u32>,
    ) -> Result<&mut Self, RecordError> {
        if self.pass != PassState::RenderPass {
            return self.reject(RecordError::NotInPass("render"));
        }
        self.bound_kernel()?;
        self.node.push(NodeCommand::Draw {
            vertices,
            instances,
        });
        Ok(self)
    }

    pub fn draw_indexed(
        &mut self,
        indices: Range<u32>,
        vertex_offset: i32,
        instances: Range<u32>,
    ) -> Result<&mut Self, RecordError> {
        if self.pass != PassState::RenderPass {
            return self.reject(RecordError::NotInPass("render"));
        }
        self.bound_kernel()?;
        self.node.push(NodeCommand::DrawIndexed {
            indices,
            vertex_offset,
            instances,
        });
        Ok(self)
    }

    ///Indexed draws read from `buffer`, which is declared as indirect buffer.
    pub fn draw_indexed_indirect(
        &mut self,
        buffer: Handle,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) -> Result<&mut Self, RecordError> {
        if self.pass != PassState::RenderPass {
            return self.reject(RecordError::NotInPass("render"));
        }
        self.bound_kernel()?;
        self.check_use(buffer, UsageKind::IndirectBuffer, KernelKind::Graphics)?;
        self.push_use(buffer, KernelKind::Graphics, UsageKind::IndirectBuffer);
        self.node.push(NodeCommand::DrawIndexedIndirect {
            buffer,
            offset,
            draw_count,
            stride,
        });
        Ok(self)
    }

    pub fn dispatch(&mut self, groups: [u32; 3]) -> Result<&mut Self, RecordError> {
        if self.pass != PassState::ComputePass {
            return self.reject(RecordError::NotInPass("compute"));
        }
        self.bound_kernel()?;
        self.node.push(NodeCommand::Dispatch(groups));
        Ok(self)
    }

    ///Copies between two buffers. Only valid outside of passes.
    pub fn copy_buffer(
        &mut self,
        src: Handle,
        dst: Handle,
        regions: &[vk::BufferCopy],
    ) -> Result<&mut Self, RecordError> {
        if self.pass != PassState::OutOfPass {
            return self.reject(RecordError::InPass);
        }
        self.check_use(src, UsageKind::TransferSrc, KernelKind::Transfer)?;
        self.check_use(dst, UsageKind::TransferDst, KernelKind::Transfer)?;
        self.push_use(src, KernelKind::Transfer, UsageKind::TransferSrc);
        self.push_use(dst, KernelKind::Transfer, UsageKind::TransferDst);
        self.node.push(NodeCommand::CopyBuffer {
            src,
            dst,
            regions: SmallVec::from_slice(regions),
        });
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;

    use crate::{
        Engine, EngineConfig,
        error::RecordError,
        handle::ResourceKind,
        headless::HeadlessBackend,
        node::{ColorTarget, DepthTarget, Region, RenderPassDesc},
        resources::{BufferDesc, GraphicsState, KernelDesc, ParamTable, TextureDesc},
        sync_state::UsageKind,
    };

    const EXT: vk::Extent2D = vk::Extent2D {
        width: 32,
        height: 32,
    };

    fn engine() -> Engine<HeadlessBackend> {
        Engine::new(HeadlessBackend::new(), EngineConfig::default()).unwrap()
    }

    fn color(engine: &Engine<HeadlessBackend>) -> crate::Handle {
        engine
            .create_texture(TextureDesc::render_target(EXT, vk::Format::R8G8B8A8_UNORM))
            .unwrap()
    }

    fn compute_kernel(engine: &Engine<HeadlessBackend>) -> crate::Handle {
        engine
            .create_kernel(KernelDesc::compute("cs", vec![0x0723_0203], ParamTable::new()))
            .unwrap()
    }

    fn graphics_kernel(engine: &Engine<HeadlessBackend>) -> crate::Handle {
        engine
            .create_kernel(KernelDesc::graphics(
                "gfx",
                vec![0x0723_0203],
                vec![0x0723_0203],
                GraphicsState {
                    color_formats: vec![vk::Format::R8G8B8A8_UNORM],
                    ..Default::default()
                },
                ParamTable::new(),
            ))
            .unwrap()
    }

    #[test]
    fn nested_passes_are_rejected() {
        let mut engine = engine();
        let node = engine.add_node("a").unwrap();
        let target = color(&engine);
        let mut rec = engine.record_frame(node).unwrap();
        rec.begin_compute_pass().unwrap();
        assert_eq!(
            rec.begin_compute_pass().err(),
            Some(RecordError::PassNesting)
        );
        assert_eq!(
            rec.begin_render_pass(RenderPassDesc::new().with_color(ColorTarget::load(target)))
                .err(),
            Some(RecordError::PassNesting)
        );
        rec.end_pass().unwrap();
        assert!(matches!(
            rec.end_pass().err(),
            Some(RecordError::NotInPass(_))
        ));
        drop(rec);
        //begin + end only
        assert_eq!(engine.graph().node(node).unwrap().len(), 2);
    }

    #[test]
    fn kernel_kind_must_match_pass() {
        let mut engine = engine();
        let node = engine.add_node("a").unwrap();
        let cs = compute_kernel(&engine);
        let gfx = graphics_kernel(&engine);
        let target = color(&engine);

        let mut rec = engine.record_frame(node).unwrap();
        assert!(matches!(
            rec.bind_kernel(cs).err(),
            Some(RecordError::NotInPass(_))
        ));
        rec.begin_render_pass(RenderPassDesc::new().with_color(ColorTarget::load(target)))
            .unwrap();
        assert!(matches!(
            rec.bind_kernel(cs).err(),
            Some(RecordError::KernelMismatch { .. })
        ));
        assert_eq!(rec.draw(0..3, 0..1).err(), Some(RecordError::NoKernelBound));
        rec.bind_kernel(gfx).unwrap().draw(0..3, 0..1).unwrap();
        assert!(matches!(
            rec.dispatch([1, 1, 1]).err(),
            Some(RecordError::NotInPass(_))
        ));
        rec.end_pass().unwrap();
    }

    #[test]
    fn forbidden_roles_leave_the_log_untouched() {
        let mut engine = engine();
        let node = engine.add_node("a").unwrap();
        let depth = engine
            .create_texture(TextureDesc::depth(EXT, vk::Format::D32_SFLOAT))
            .unwrap();
        let buffer = engine.create_buffer(BufferDesc::vertex(64)).unwrap();
        let target = color(&engine);

        let mut rec = engine.record_frame(node).unwrap();
        assert_eq!(
            rec.begin_render_pass(RenderPassDesc::new().with_color(ColorTarget::load(depth)))
                .err(),
            Some(RecordError::RoleForbidden {
                handle: depth,
                usage: UsageKind::RenderTarget
            })
        );
        assert_eq!(
            rec.begin_render_pass(
                RenderPassDesc::new()
                    .with_color(ColorTarget::load(target))
                    .with_depth(DepthTarget::clear(target, 1.0))
            )
            .err(),
            Some(RecordError::RoleForbidden {
                handle: target,
                usage: UsageKind::DepthTarget
            })
        );
        rec.begin_compute_pass().unwrap();
        assert_eq!(
            rec.as_read_texture(buffer).err(),
            Some(RecordError::WrongKind {
                handle: buffer,
                expected: ResourceKind::Texture
            })
        );
        assert_eq!(
            rec.as_write_buffer(buffer).err(),
            Some(RecordError::RoleForbidden {
                handle: buffer,
                usage: UsageKind::WriteBuffer
            })
        );
        drop(rec);
        assert_eq!(engine.graph().node(node).unwrap().len(), 1);
    }

    #[test]
    fn destroyed_handles_are_rejected() {
        let mut engine = engine();
        let node = engine.add_node("a").unwrap();
        let buffer = engine.create_buffer(BufferDesc::storage(64)).unwrap();
        engine.destroy(buffer).unwrap();
        let mut rec = engine.record_frame(node).unwrap();
        rec.begin_compute_pass().unwrap();
        assert_eq!(
            rec.as_read_buffer(buffer).err(),
            Some(RecordError::InvalidHandle(buffer))
        );
    }

    #[test]
    fn copies_only_outside_of_passes() {
        let mut engine = engine();
        let node = engine.add_node("a").unwrap();
        let a = engine.create_buffer(BufferDesc::storage(64)).unwrap();
        let b = engine.create_buffer(BufferDesc::storage(64)).unwrap();
        let copy = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: 64,
        };
        let mut rec = engine.record_frame(node).unwrap();
        rec.copy_buffer(a, b, &[copy]).unwrap();
        rec.begin_compute_pass().unwrap();
        assert_eq!(rec.copy_buffer(a, b, &[copy]).err(), Some(RecordError::InPass));
    }

    #[test]
    fn viewport_needs_render_pass() {
        let mut engine = engine();
        let node = engine.add_node("a").unwrap();
        let mut rec = engine.record_frame(node).unwrap();
        assert!(rec.set_viewport(Region::Auto).is_err());
        rec.begin_compute_pass().unwrap();
        assert!(rec.set_scissor(Region::Auto).is_err());
    }

    #[test]
    fn oversized_push_constants_are_rejected() {
        let mut engine = engine();
        let node = engine.add_node("a").unwrap();
        let cs = compute_kernel(&engine);
        let mut rec = engine.record_frame(node).unwrap();
        rec.begin_compute_pass().unwrap().bind_kernel(cs).unwrap();
        rec.push_constants(&[0u8; 16]).unwrap();
        assert_eq!(
            rec.push_constants(&[0u8; 256]).err(),
            Some(RecordError::PushConstantsTooBig { size: 256, max: 128 })
        );
    }
}
