use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ahash::AHashMap;
use ash::vk;

use crate::{
    backend::{Backend, BindlessWrite, NativeCommand, SurfaceImage},
    bindless::BindlessAllocator,
    config::EngineConfig,
    error::{BackendError, FrameError, GraphError, KilnError, ResourceError},
    frame::FramePacer,
    graph::{FrameGraph, NodeHandle},
    handle::{Handle, ResourceKind},
    node::{NodeRecorder, frame_state, native_barrier},
    reclaim::{Reclaim, ReclaimQueue, ReclaimSender},
    resources::{
        Buffer, BufferDesc, BufferViewDesc, Kernel, KernelDesc, ParamBlock, Staging, Texture,
        TextureDesc, TextureViewDesc,
    },
    store::{AnyResource, Arenas, ResourceStore},
    sync_state::{KernelKind, SyncState, UsageKind, transition},
};

///The explicit context that owns every resource, node and frame slot.
///
/// Resource creation and destruction only need `&self` and can happen from any thread. Recording nodes and
/// generating frames needs `&mut self`.
pub struct Engine<B: Backend> {
    backend: B,
    config: EngineConfig,
    store: ResourceStore<B>,
    buffer_slots: BindlessAllocator,
    texture_slots: BindlessAllocator,
    reclaim: ReclaimQueue<B>,
    reclaim_tx: ReclaimSender<B>,
    graph: FrameGraph<B>,
    pacing: FramePacer<B>,
    ///Byte count of the latest pending upload per buffer.
    uploads: Mutex<AHashMap<Handle, u64>>,
    present_source: Option<Handle>,
}

impl<B: Backend> Engine<B> {
    pub fn new(backend: B, config: EngineConfig) -> Result<Self, KilnError> {
        let pacing = FramePacer::new(&backend).map_err(BackendError::new)?;
        let reclaim = ReclaimQueue::new();
        let reclaim_tx = reclaim.sender();

        #[cfg(feature = "logging")]
        log::info!(
            "Created engine with {} bindless textures and {} bindless buffers",
            config.max_bindless_textures,
            config.max_bindless_buffers
        );

        Ok(Engine {
            buffer_slots: BindlessAllocator::new(config.max_bindless_buffers),
            texture_slots: BindlessAllocator::new(config.max_bindless_textures),
            backend,
            config,
            store: ResourceStore::new(),
            reclaim,
            reclaim_tx,
            graph: FrameGraph::new(),
            pacing,
            uploads: Mutex::new(AHashMap::default()),
            present_source: None,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &ResourceStore<B> {
        &self.store
    }

    pub fn graph(&self) -> &FrameGraph<B> {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut FrameGraph<B> {
        &mut self.graph
    }

    ///Sender that can be moved to other threads to hand native objects over for deferred destruction.
    pub fn reclaim_sender(&self) -> ReclaimSender<B> {
        self.reclaim_tx.clone()
    }

    ///Index of the active frame slot.
    pub fn frame_index(&self) -> usize {
        self.pacing.slot()
    }

    ///Number of generated frames.
    pub fn frame_count(&self) -> u64 {
        self.pacing.frame()
    }

    fn exhausted(&self, kind: ResourceKind) -> ResourceError {
        let max = match kind {
            ResourceKind::Texture => self.texture_slots.capacity(),
            _ => self.buffer_slots.capacity(),
        };
        #[cfg(feature = "logging")]
        log::error!("Out of bindless {:?} slots ({})", kind, max);
        ResourceError::BindlessExhausted { kind, max }
    }

    pub fn create_buffer(&self, desc: BufferDesc) -> Result<Handle, ResourceError> {
        let native = self
            .backend
            .create_buffer(&desc)
            .map_err(BackendError::new)?;
        let bindless = if desc.is_bindless() {
            match self.buffer_slots.allocate() {
                Some(slot) => {
                    self.backend.write_bindless(BindlessWrite::Buffer {
                        slot,
                        buffer: &native,
                    });
                    Some(slot)
                }
                None => {
                    self.backend.destroy_buffer(native);
                    return Err(self.exhausted(ResourceKind::Buffer));
                }
            }
        } else {
            None
        };
        let address = self.backend.buffer_device_address(&native);

        #[cfg(feature = "logging")]
        log::trace!(
            "Created buffer {:?} of {} bytes, bindless={:?}",
            desc.name,
            desc.size,
            bindless
        );

        Ok(self.store.insert(Buffer {
            desc,
            native,
            views: Vec::new(),
            sync: SyncState::UNDEFINED,
            bindless,
            address,
            staging: None,
            last_use: None,
        }))
    }

    ///Adds a view to `buffer`. Returns the index of the view. Views survive resizing.
    pub fn create_buffer_view(
        &self,
        buffer: Handle,
        desc: BufferViewDesc,
    ) -> Result<usize, ResourceError> {
        let mut arenas = self.store.write();
        let buf = buffer_mut(&mut arenas, buffer)?;
        let view = self
            .backend
            .create_buffer_view(&buf.native, &desc)
            .map_err(BackendError::new)?;
        buf.views.push((desc, view));
        Ok(buf.views.len() - 1)
    }

    pub fn create_texture(&self, desc: TextureDesc) -> Result<Handle, ResourceError> {
        let native = self
            .backend
            .create_texture(&desc)
            .map_err(BackendError::new)?;
        let view_desc = desc.default_view();
        let view = match self.backend.create_texture_view(&native, &view_desc) {
            Ok(view) => view,
            Err(e) => {
                self.backend.destroy_texture(native);
                return Err(BackendError::new(e).into());
            }
        };

        let bindless = if desc.is_bindless() {
            match self.texture_slots.allocate() {
                Some(slot) => {
                    self.backend.write_bindless(BindlessWrite::Texture {
                        slot,
                        view: &view,
                        sampled: desc.usage.contains(vk::ImageUsageFlags::SAMPLED),
                        storage: desc.usage.contains(vk::ImageUsageFlags::STORAGE),
                    });
                    Some(slot)
                }
                None => {
                    self.backend.destroy_texture_view(view);
                    self.backend.destroy_texture(native);
                    return Err(self.exhausted(ResourceKind::Texture));
                }
            }
        } else {
            None
        };

        #[cfg(feature = "logging")]
        log::trace!(
            "Created texture {:?} {}x{}, bindless={:?}",
            desc.name,
            desc.extent.width,
            desc.extent.height,
            bindless
        );

        Ok(self.store.insert(Texture {
            desc,
            native,
            views: vec![(view_desc, view)],
            sync: SyncState::UNDEFINED,
            bindless,
        }))
    }

    ///Adds a view to `texture`. Returns the index of the view, view 0 is the default view.
    pub fn create_texture_view(
        &self,
        texture: Handle,
        desc: TextureViewDesc,
    ) -> Result<usize, ResourceError> {
        if texture.kind() != ResourceKind::Texture {
            return Err(ResourceError::WrongKind {
                handle: texture,
                expected: ResourceKind::Texture,
            });
        }
        let mut arenas = self.store.write();
        let tex = arenas
            .get_mut::<Texture<B>>(texture)
            .ok_or(ResourceError::InvalidHandle(texture))?;
        let view = self
            .backend
            .create_texture_view(&tex.native, &desc)
            .map_err(BackendError::new)?;
        tex.views.push((desc, view));
        Ok(tex.views.len() - 1)
    }

    pub fn create_kernel(&self, desc: KernelDesc) -> Result<Handle, ResourceError> {
        if desc.params.size() > self.config.push_constant_size {
            #[cfg(feature = "logging")]
            log::error!("Parameters of kernel {} do not fit into push constants", desc.name);
            return Err(ResourceError::ParameterBlockTooBig {
                size: desc.params.size(),
                max: self.config.push_constant_size,
            });
        }
        if let Err(reason) = desc.validate() {
            #[cfg(feature = "logging")]
            log::error!("Kernel {} is invalid: {}", desc.name, reason);
            return Err(ResourceError::InvalidKernel {
                name: desc.name,
                reason,
            });
        }
        let pipeline = self
            .backend
            .create_pipeline(&desc)
            .map_err(BackendError::new)?;
        Ok(self.store.insert(Kernel {
            name: desc.name,
            kind: desc.kind,
            pipeline,
            params: Arc::new(desc.params),
        }))
    }

    ///Creates an empty parameter block for `kernel`.
    pub fn param_block(&self, kernel: Handle) -> Result<ParamBlock, ResourceError> {
        if kernel.kind() != ResourceKind::Kernel {
            return Err(ResourceError::WrongKind {
                handle: kernel,
                expected: ResourceKind::Kernel,
            });
        }
        self.store
            .read()
            .kernel(kernel)
            .map(|k| ParamBlock::new(kernel, k.params.clone()))
            .ok_or(ResourceError::InvalidHandle(kernel))
    }

    ///Invalidates `handle` immediately. Native objects are destroyed once no frame in flight can use them.
    pub fn destroy(&self, handle: Handle) -> Result<(), ResourceError> {
        let Some(resource) = self.store.remove(handle) else {
            #[cfg(feature = "logging")]
            log::error!("Tried to destroy invalid handle {:?}", handle);
            return Err(ResourceError::InvalidHandle(handle));
        };
        self.lock_uploads().remove(&handle);
        for item in into_reclaims(resource) {
            self.reclaim_tx.recover(item);
        }
        Ok(())
    }

    pub fn valid(&self, handle: Handle) -> bool {
        self.store.valid(handle)
    }

    pub fn sync_state(&self, handle: Handle) -> Option<SyncState> {
        self.store.read().sync_state(handle)
    }

    ///Bindless slot of a buffer or texture, if it has one.
    pub fn bindless_index(&self, handle: Handle) -> Option<u32> {
        let arenas = self.store.read();
        match handle.kind() {
            ResourceKind::Buffer => arenas.buffer(handle).and_then(|b| b.bindless),
            ResourceKind::Texture => arenas.texture(handle).and_then(|t| t.bindless),
            ResourceKind::Kernel => None,
        }
    }

    pub fn device_address(&self, handle: Handle) -> Option<u64> {
        self.store.read().buffer(handle).and_then(|b| b.address)
    }

    fn lock_uploads(&self) -> MutexGuard<'_, AHashMap<Handle, u64>> {
        self.uploads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    ///Writes `data` to the start of `buffer`, growing it if needed.
    ///
    /// Device local buffers are written into their staging buffer and copied at the start of the next frame. So are
    /// host visible buffers that a frame in flight may still read, as long as they are transfer destinations. All
    /// other host visible buffers are written through their mapping right away. For those the caller has to make
    /// sure no frame in flight reads the written range.
    pub fn set_buffer_data(&self, buffer: Handle, data: &[u8]) -> Result<(), ResourceError> {
        if data.is_empty() {
            return Ok(());
        }
        let len = data.len() as u64;
        let frame = self.pacing.frame();
        let mut arenas = self.store.write();
        let buf = buffer_mut(&mut arenas, buffer)?;

        let host_visible = buf.desc.memory.is_host_visible();
        if !host_visible && !buf.desc.usage.contains(vk::BufferUsageFlags::TRANSFER_DST) {
            #[cfg(feature = "logging")]
            log::error!("Buffer {:?} is neither host visible nor a transfer destination", buffer);
            return Err(ResourceError::NotWritable(buffer));
        }

        if len > buf.desc.size {
            self.resize(buf, len.next_power_of_two())?;
        }

        let transfer_dst = buf.desc.usage.contains(vk::BufferUsageFlags::TRANSFER_DST);
        if host_visible && !(transfer_dst && buf.in_flight(frame)) {
            self.backend
                .write_buffer(&mut buf.native, 0, data)
                .map_err(BackendError::new)?;
            drop(arenas);
            //an older staged copy must not overwrite this write
            self.lock_uploads().remove(&buffer);
            return Ok(());
        }

        let reusable = buf
            .staging
            .as_ref()
            .map(|s| s.is_reusable(frame, len))
            .unwrap_or(false);
        if !reusable {
            let size = len.max(buf.desc.size);
            let native = self
                .backend
                .create_buffer(&BufferDesc::staging(size))
                .map_err(BackendError::new)?;
            let fresh = Staging {
                native,
                size,
                last_frame: None,
            };
            if let Some(old) = buf.staging.replace(fresh) {
                self.reclaim_tx.recover(Reclaim::Buffer {
                    native: old.native,
                    views: Vec::new(),
                });
            }
        }
        if let Some(staging) = buf.staging.as_mut() {
            self.backend
                .write_buffer(&mut staging.native, 0, data)
                .map_err(BackendError::new)?;
        }
        drop(arenas);

        self.lock_uploads().insert(buffer, len);
        Ok(())
    }

    pub fn set_buffer_data_pod<T: bytemuck::Pod>(
        &self,
        buffer: Handle,
        data: &[T],
    ) -> Result<(), ResourceError> {
        self.set_buffer_data(buffer, bytemuck::cast_slice(data))
    }

    ///Recreates `buffer` with `size` bytes. Views and the bindless registration are reissued, the old natives are
    /// reclaimed.
    fn resize(&self, buffer: &mut Buffer<B>, size: u64) -> Result<(), ResourceError> {
        let mut desc = buffer.desc.clone();
        desc.size = size;

        let native = self
            .backend
            .create_buffer(&desc)
            .map_err(BackendError::new)?;
        let mut views = Vec::with_capacity(buffer.views.len());
        for (view_desc, _) in buffer.views.iter() {
            match self.backend.create_buffer_view(&native, view_desc) {
                Ok(view) => views.push((*view_desc, view)),
                Err(e) => {
                    self.discard_buffer(native, views);
                    return Err(BackendError::new(e).into());
                }
            }
        }
        let bindless = if desc.is_bindless() {
            match self.buffer_slots.allocate() {
                Some(slot) => Some(slot),
                None => {
                    self.discard_buffer(native, views);
                    return Err(self.exhausted(ResourceKind::Buffer));
                }
            }
        } else {
            None
        };
        if let Some(slot) = bindless {
            self.backend.write_bindless(BindlessWrite::Buffer {
                slot,
                buffer: &native,
            });
        }

        #[cfg(feature = "logging")]
        log::trace!(
            "Resizing buffer {:?} from {} to {} bytes",
            desc.name,
            buffer.desc.size,
            size
        );

        buffer.address = self.backend.buffer_device_address(&native);
        let old_native = std::mem::replace(&mut buffer.native, native);
        let old_views = std::mem::replace(&mut buffer.views, views);
        self.reclaim_tx.recover(Reclaim::Buffer {
            native: old_native,
            views: old_views.into_iter().map(|(_, v)| v).collect(),
        });
        if let Some(old) = std::mem::replace(&mut buffer.bindless, bindless) {
            self.reclaim_tx.recover(Reclaim::BufferSlot(old));
        }
        buffer.desc = desc;
        buffer.sync = SyncState::UNDEFINED;
        buffer.last_use = None;
        Ok(())
    }

    fn discard_buffer(&self, native: B::Buffer, views: Vec<(BufferViewDesc, B::BufferView)>) {
        for (_, view) in views {
            self.backend.destroy_buffer_view(view);
        }
        self.backend.destroy_buffer(native);
    }

    pub fn add_node(&mut self, name: &str) -> Result<NodeHandle, KilnError> {
        self.graph.add_node(name, &self.backend)
    }

    ///Removes the node. Its command pools are reclaimed like any other native object.
    pub fn remove_node(&mut self, node: NodeHandle) -> Result<(), GraphError> {
        let node = self.graph.remove_node(node)?;
        for pool in node.into_pools() {
            self.reclaim_tx.recover(Reclaim::CommandPool(pool));
        }
        Ok(())
    }

    pub fn set_wait_list<S: AsRef<str>>(
        &mut self,
        node: NodeHandle,
        waits: &[S],
    ) -> Result<(), GraphError> {
        self.graph.set_wait_list(node, waits)
    }

    pub fn set_root(&mut self, node: Option<NodeHandle>) -> Result<(), GraphError> {
        self.graph.set_root(node)
    }

    ///Starts a new recording session for `node`. The node's previous commands are discarded.
    pub fn record_frame(&mut self, node: NodeHandle) -> Result<NodeRecorder<'_, B>, GraphError> {
        let push_constant_size = self.config.push_constant_size;
        let node = self
            .graph
            .node_mut(node)
            .ok_or(GraphError::NoSuchNode(node))?;
        Ok(NodeRecorder::new(node, &self.store, push_constant_size))
    }

    ///Sets the texture that is blitted to the surface at the end of each frame.
    pub fn set_present_source(&mut self, texture: Option<Handle>) -> Result<(), FrameError> {
        if let Some(texture) = texture {
            let usable = self
                .store
                .read()
                .texture(texture)
                .map(|t| t.desc.supports(UsageKind::TransferSrc))
                .unwrap_or(false);
            if !usable {
                #[cfg(feature = "logging")]
                log::error!("{:?} can not be presented", texture);
                return Err(FrameError::InvalidPresentSource(texture));
            }
        }
        self.present_source = texture;
        Ok(())
    }

    ///Generates, submits and presents one frame, then moves on to the next frame slot.
    ///
    /// A frame that fails before its submission leaves no trace: resource states stay as they were, pending uploads
    /// are kept for the next frame and nothing destroyed in the meantime is released early.
    pub fn gen_frame(&mut self) -> Result<(), FrameError> {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        let slot = self.pacing.slot();
        let timeout = self.config.fence_timeout;
        self.pacing
            .wait(&self.backend, timeout)
            .map_err(BackendError::new)?;
        self.reclaim.release_slot(
            slot,
            &self.backend,
            &self.buffer_slots,
            &self.texture_slots,
        );
        self.pacing
            .begin(&self.backend)
            .map_err(BackendError::new)?;

        let uploads = std::mem::take(&mut *self.lock_uploads());
        let mut frame = AHashMap::default();
        let surface = match self.record_frame_commands(slot, &uploads, &mut frame) {
            Ok(surface) => surface,
            Err(e) => {
                self.restore_uploads(uploads);
                return Err(e);
            }
        };
        if let Err(e) = self.pacing.submit(&self.backend, surface.as_ref()) {
            #[cfg(feature = "logging")]
            log::error!("Dropping frame {}, submission failed: {}", self.pacing.frame(), e);
            self.restore_uploads(uploads);
            return Err(BackendError::new(e).into());
        }

        self.reclaim.stage_slot(slot);
        self.commit(&uploads, frame);

        let presented = match surface.as_ref() {
            Some(surface) => self
                .backend
                .present(slot, surface)
                .map_err(BackendError::new),
            None => Ok(()),
        };
        self.pacing.advance();
        self.pacing
            .wait(&self.backend, timeout)
            .map_err(BackendError::new)?;
        presented?;
        Ok(())
    }

    ///Records uploads, the frame graph and the surface blit into the active primary command buffer. Resource states
    /// are only written to `frame`.
    fn record_frame_commands(
        &mut self,
        slot: usize,
        uploads: &AHashMap<Handle, u64>,
        frame: &mut AHashMap<Handle, SyncState>,
    ) -> Result<Option<SurfaceImage>, FrameError> {
        let source = match self.present_source {
            Some(source) if self.store.valid(source) => Some(source),
            Some(_gone) => {
                #[cfg(feature = "logging")]
                log::warn!("Present source {:?} was destroyed", _gone);
                self.present_source = None;
                None
            }
            None => None,
        };

        self.record_uploads(uploads, frame);

        {
            #[cfg(feature = "profiling")]
            puffin::profile_scope!("frame graph");
            let _executed = self.graph.execute(
                slot,
                &self.backend,
                &self.store,
                self.pacing.primary_mut(),
                frame,
            )?;
            #[cfg(feature = "logging")]
            log::trace!("Frame {}: executed {} nodes", self.pacing.frame(), _executed);
        }

        //Acquired after the graph, a failing node must not leave an acquired image without a submission waiting on it.
        let surface = match source {
            Some(_) => self
                .backend
                .acquire_surface(slot)
                .map_err(BackendError::new)?,
            None => None,
        };
        if let (Some(source), Some(surface)) = (source, surface.as_ref()) {
            self.record_blit(source, surface, frame);
        }
        self.pacing.end(&self.backend).map_err(BackendError::new)?;
        Ok(surface)
    }

    ///Puts the uploads of a dropped frame back. Uploads requested since take precedence.
    fn restore_uploads(&self, uploads: AHashMap<Handle, u64>) {
        let mut pending = self.lock_uploads();
        for (handle, len) in uploads {
            pending.entry(handle).or_insert(len);
        }
    }

    ///Makes the states of a submitted frame the global states.
    fn commit(&mut self, uploads: &AHashMap<Handle, u64>, frame: AHashMap<Handle, SyncState>) {
        let number = self.pacing.frame();
        let mut arenas = self.store.write();
        for handle in uploads.keys() {
            if let Some(staging) = arenas
                .get_mut::<Buffer<B>>(*handle)
                .and_then(|b| b.staging.as_mut())
            {
                staging.last_frame = Some(number);
            }
        }
        for (handle, state) in frame {
            arenas.set_sync_state(handle, state);
            if let Some(buffer) = arenas.get_mut::<Buffer<B>>(handle) {
                buffer.last_use = Some(number);
            }
        }
    }

    ///Records the copies of all `uploads` into the active primary command buffer.
    fn record_uploads(
        &mut self,
        uploads: &AHashMap<Handle, u64>,
        frame: &mut AHashMap<Handle, SyncState>,
    ) {
        if uploads.is_empty() {
            return;
        }

        let target = SyncState::new(KernelKind::Transfer, UsageKind::TransferDst);
        let arenas = self.store.read();
        let mut barriers = Vec::with_capacity(uploads.len());
        for handle in uploads.keys() {
            let Some(state) = frame_state(&arenas, frame, *handle) else {
                continue;
            };
            match transition(ResourceKind::Buffer, state, target) {
                Ok(Some(barrier)) => barriers.push((*handle, barrier)),
                Ok(None) => {}
                Err(_e) => {
                    #[cfg(feature = "logging")]
                    log::error!("No upload barrier for {:?}: {}", handle, _e);
                }
            }
        }
        let natives: Vec<_> = barriers
            .iter()
            .filter_map(|(h, b)| native_barrier(&arenas, *h, *b))
            .collect();
        let primary = self.pacing.primary_mut();
        if !natives.is_empty() {
            self.backend
                .record(primary, NativeCommand::Barriers(&natives));
        }
        for (handle, len) in uploads.iter() {
            let Some(buffer) = arenas.buffer(*handle) else {
                continue;
            };
            let Some(staging) = buffer.staging.as_ref() else {
                continue;
            };
            self.backend.record(
                primary,
                NativeCommand::CopyBuffer {
                    src: &staging.native,
                    dst: &buffer.native,
                    regions: &[vk::BufferCopy {
                        src_offset: 0,
                        dst_offset: 0,
                        size: *len,
                    }],
                },
            );
            frame.insert(*handle, target);
        }
    }

    fn record_blit(
        &mut self,
        source: Handle,
        surface: &SurfaceImage,
        frame: &mut AHashMap<Handle, SyncState>,
    ) {
        let target = SyncState::new(KernelKind::Transfer, UsageKind::TransferSrc);
        let arenas = self.store.read();
        let Some(state) = frame_state(&arenas, frame, source) else {
            return;
        };
        let primary = self.pacing.primary_mut();
        match transition(ResourceKind::Texture, state, target) {
            Ok(Some(barrier)) => {
                if let Some(native) = native_barrier(&arenas, source, barrier) {
                    self.backend
                        .record(primary, NativeCommand::Barriers(&[native]));
                }
            }
            Ok(None) => {}
            Err(_e) => {
                #[cfg(feature = "logging")]
                log::error!("No present barrier for {:?}: {}", source, _e);
            }
        }
        if let Some(texture) = arenas.texture(source) {
            self.backend.record(
                primary,
                NativeCommand::BlitToSurface {
                    src: &texture.native,
                    src_extent: texture.extent(),
                    surface: *surface,
                },
            );
        }
        frame.insert(source, target);
    }

    ///Blocks until the device is idle and every frame slot finished.
    pub fn wait_idle(&mut self) -> Result<(), FrameError> {
        self.backend.wait_idle().map_err(BackendError::new)?;
        self.pacing
            .wait_all(&self.backend, self.config.fence_timeout)
            .map_err(BackendError::new)?;
        Ok(())
    }
}

impl<B: Backend> Drop for Engine<B> {
    fn drop(&mut self) {
        if let Err(_e) = self.wait_idle() {
            #[cfg(feature = "logging")]
            log::error!("Failed to wait for idle on shutdown: {}", _e);
        }
        self.reclaim
            .flush_all(&self.backend, &self.buffer_slots, &self.texture_slots);
        for node in self.graph.drain() {
            for pool in node.into_pools() {
                self.backend.destroy_command_pool(pool);
            }
        }
        self.pacing.destroy(&self.backend);

        let resources = self.store.write().drain();
        #[cfg(feature = "logging")]
        log::info!("Destroying {} remaining resources", resources.len());
        for resource in resources {
            for item in into_reclaims(resource) {
                item.execute(&self.backend, &self.buffer_slots, &self.texture_slots);
            }
        }
    }
}

fn buffer_mut<B: Backend>(
    arenas: &mut Arenas<B>,
    handle: Handle,
) -> Result<&mut Buffer<B>, ResourceError> {
    if handle.kind() != ResourceKind::Buffer {
        return Err(ResourceError::WrongKind {
            handle,
            expected: ResourceKind::Buffer,
        });
    }
    arenas
        .get_mut::<Buffer<B>>(handle)
        .ok_or(ResourceError::InvalidHandle(handle))
}

///Everything native a removed resource owns.
fn into_reclaims<B: Backend>(resource: AnyResource<B>) -> Vec<Reclaim<B>> {
    let mut items = Vec::with_capacity(3);
    match resource {
        AnyResource::Buffer(buffer) => {
            if let Some(staging) = buffer.staging {
                items.push(Reclaim::Buffer {
                    native: staging.native,
                    views: Vec::new(),
                });
            }
            items.push(Reclaim::Buffer {
                native: buffer.native,
                views: buffer.views.into_iter().map(|(_, v)| v).collect(),
            });
            if let Some(slot) = buffer.bindless {
                items.push(Reclaim::BufferSlot(slot));
            }
        }
        AnyResource::Texture(texture) => {
            items.push(Reclaim::Texture {
                native: texture.native,
                views: texture.views.into_iter().map(|(_, v)| v).collect(),
            });
            if let Some(slot) = texture.bindless {
                items.push(Reclaim::TextureSlot(slot));
            }
        }
        AnyResource::Kernel(kernel) => items.push(Reclaim::Pipeline(kernel.pipeline)),
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        headless::{Event, FailPoint, HeadlessBackend, RecordedCommand},
        node::{ColorTarget, RenderPassDesc},
        resources::{GraphicsState, MemoryUsage, ParamTable},
    };
    use static_assertions::assert_impl_all;

    const EXT: vk::Extent2D = vk::Extent2D {
        width: 64,
        height: 64,
    };
    const SPIRV: u32 = 0x0723_0203;

    fn engine() -> Engine<HeadlessBackend> {
        //several tests race to install the logger, only the first one wins.
        let _ = simple_logger::SimpleLogger::new().env().init();
        Engine::new(HeadlessBackend::new(), EngineConfig::default()).unwrap()
    }

    fn compute(engine: &Engine<HeadlessBackend>, params: ParamTable) -> Handle {
        engine
            .create_kernel(KernelDesc::compute("cs", vec![SPIRV], params))
            .unwrap()
    }

    fn graphics(engine: &Engine<HeadlessBackend>) -> Handle {
        engine
            .create_kernel(KernelDesc::graphics(
                "gfx",
                vec![SPIRV],
                vec![SPIRV],
                GraphicsState {
                    color_formats: vec![vk::Format::R8G8B8A8_UNORM],
                    ..Default::default()
                },
                ParamTable::new(),
            ))
            .unwrap()
    }

    ///`(prev, current)` commands of every executed node of a submission.
    fn executed(commands: &[RecordedCommand]) -> Vec<(Vec<RecordedCommand>, Vec<RecordedCommand>)> {
        commands
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::Execute(buffers) if buffers.len() == 2 => {
                    Some((buffers[0].1.clone(), buffers[1].1.clone()))
                }
                _ => None,
            })
            .collect()
    }

    fn barriers(commands: &[RecordedCommand]) -> Vec<crate::sync_state::Barrier> {
        commands
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::Barrier { barrier, .. } => Some(*barrier),
                _ => None,
            })
            .collect()
    }

    fn buffer_id(engine: &Engine<HeadlessBackend>, handle: Handle) -> u64 {
        engine.store().read().buffer(handle).unwrap().native().id
    }

    #[test]
    fn engine_is_send_sync() {
        assert_impl_all!(Engine<HeadlessBackend>: Send, Sync);
        assert_impl_all!(ReclaimSender<HeadlessBackend>: Send, Sync, Clone);
    }

    #[test]
    fn render_target_then_compute_read_needs_one_barrier() {
        let mut engine = engine();
        let target = engine
            .create_texture(TextureDesc::render_target(EXT, vk::Format::R8G8B8A8_UNORM))
            .unwrap();
        let gfx = graphics(&engine);
        let cs = compute(&engine, ParamTable::new());
        let a = engine.add_node("A").unwrap();
        let b = engine.add_node("B").unwrap();
        engine.set_wait_list(b, &["A"]).unwrap();

        engine
            .record_frame(a)
            .unwrap()
            .begin_render_pass(
                RenderPassDesc::new().with_color(ColorTarget::clear(target, [0.0; 4])),
            )
            .unwrap()
            .bind_kernel(gfx)
            .unwrap()
            .draw(0..3, 0..1)
            .unwrap()
            .end_pass()
            .unwrap();
        engine
            .record_frame(b)
            .unwrap()
            .begin_compute_pass()
            .unwrap()
            .bind_kernel(cs)
            .unwrap()
            .as_read_texture(target)
            .unwrap()
            .dispatch([8, 8, 1])
            .unwrap()
            .end_pass()
            .unwrap();

        engine.gen_frame().unwrap();
        let submissions = engine.backend().submissions();
        assert_eq!(submissions.len(), 1);
        let nodes = executed(&submissions[0]);
        assert_eq!(nodes.len(), 2);
        let (a_prev, a_current) = &nodes[0];
        let (b_prev, b_current) = &nodes[1];

        assert_eq!(barriers(a_prev).len(), 1);
        assert!(barriers(a_current).is_empty());
        assert!(barriers(b_current).is_empty());
        let between = barriers(b_prev);
        assert_eq!(between.len(), 1);
        assert_eq!(between[0].old_layout(), vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(between[0].new_layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(
            engine.sync_state(target),
            Some(SyncState::new(KernelKind::Compute, UsageKind::ReadTexture))
        );

        //the log is replayed again and A picks up where B left off.
        engine.gen_frame().unwrap();
        let submissions = engine.backend().submissions();
        let nodes = executed(&submissions[1]);
        let back = barriers(&nodes[0].0);
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].old_layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(back[0].new_layout(), vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    }

    #[test]
    fn repeated_use_in_one_node_is_one_barrier() {
        let mut engine = engine();
        let buffer = engine.create_buffer(BufferDesc::storage(64)).unwrap();
        let cs = compute(&engine, ParamTable::new());
        let node = engine.add_node("A").unwrap();
        {
            let mut rec = engine.record_frame(node).unwrap();
            rec.begin_compute_pass().unwrap().bind_kernel(cs).unwrap();
            for _ in 0..4 {
                rec.as_write_buffer(buffer).unwrap().dispatch([1, 1, 1]).unwrap();
            }
            rec.end_pass().unwrap();
        }
        engine.gen_frame().unwrap();
        let nodes = executed(&engine.backend().submissions()[0]);
        assert_eq!(barriers(&nodes[0].0).len(), 1);
        assert!(barriers(&nodes[0].1).is_empty());
    }

    #[test]
    fn growing_a_buffer_recreates_it_with_its_views() {
        let mut engine = engine();
        let buffer = engine
            .create_buffer(
                BufferDesc::storage(64).with_usage(vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER),
            )
            .unwrap();
        engine
            .create_buffer_view(buffer, BufferViewDesc::whole(vk::Format::R32_UINT))
            .unwrap();
        engine
            .create_buffer_view(
                buffer,
                BufferViewDesc {
                    offset: 0,
                    range: 32,
                    format: vk::Format::R32_UINT,
                },
            )
            .unwrap();
        let old_id = buffer_id(&engine, buffer);
        let old_slot = engine.bindless_index(buffer);

        engine.set_buffer_data(buffer, &[7u8; 128]).unwrap();

        let new_id = buffer_id(&engine, buffer);
        let new_slot = engine.bindless_index(buffer);
        assert_ne!(new_id, old_id);
        assert_ne!(new_slot, old_slot);
        {
            let arenas = engine.store().read();
            let buf = arenas.buffer(buffer).unwrap();
            assert!(buf.size() >= 128);
            assert_eq!(buf.view_descs().count(), 2);
            assert!(buf.view(1).is_some());
        }
        let events = engine.backend().events();
        let new_views = events
            .iter()
            .filter(|e| matches!(e, Event::CreateBufferView { buffer, .. } if *buffer == new_id))
            .count();
        assert_eq!(new_views, 2);
        assert!(events.contains(&Event::BindlessBuffer {
            slot: new_slot.unwrap(),
            buffer: new_id
        }));
        assert!(!engine.backend().was_destroyed(old_id));

        engine.gen_frame().unwrap();
        let submission = &engine.backend().submissions()[0];
        let copy = submission.iter().find_map(|c| match c {
            RecordedCommand::CopyBuffer { dst, regions, .. } => Some((*dst, regions.clone())),
            _ => None,
        });
        assert_eq!(copy, Some((new_id, vec![(0, 0, 128)])));
    }

    #[test]
    fn destruction_is_deferred_until_the_slot_is_idle() {
        let mut engine = engine();
        let buffer = engine.create_buffer(BufferDesc::storage(64)).unwrap();
        let id = buffer_id(&engine, buffer);
        let slot = engine.bindless_index(buffer);
        engine.gen_frame().unwrap();

        engine.destroy(buffer).unwrap();
        assert!(!engine.valid(buffer));
        assert!(engine.destroy(buffer).is_err());

        for _ in 0..3 {
            engine.gen_frame().unwrap();
            assert!(!engine.backend().was_destroyed(id));
        }
        engine.gen_frame().unwrap();
        assert!(engine.backend().was_destroyed(id));

        //the slot's fence was waited on between the submission that could use the buffer and its destruction.
        let events = engine.backend().events();
        let submit = events
            .iter()
            .filter_map(|e| match e {
                Event::Submit { fence, .. } => Some(*fence),
                _ => None,
            })
            .nth(1)
            .unwrap();
        let submitted_at = engine
            .backend()
            .position(|e| matches!(e, Event::Submit { fence, .. } if *fence == submit))
            .unwrap();
        let destroyed_at = engine
            .backend()
            .position(|e| *e == Event::DestroyBuffer(id))
            .unwrap();
        assert!(
            events[submitted_at..destroyed_at]
                .iter()
                .any(|e| *e == Event::WaitFence(submit))
        );

        let again = engine.create_buffer(BufferDesc::storage(64)).unwrap();
        assert_eq!(engine.bindless_index(again), slot);
    }

    #[test]
    fn device_local_uploads_go_through_staging() {
        let mut engine = engine();
        let buffer = engine.create_buffer(BufferDesc::storage(16)).unwrap();
        let id = buffer_id(&engine, buffer);
        engine.set_buffer_data_pod(buffer, &[1u32, 2, 3, 4]).unwrap();
        engine.set_buffer_data_pod(buffer, &[5u32, 6, 7, 8]).unwrap();

        let creations = |engine: &Engine<HeadlessBackend>| {
            engine
                .backend()
                .events()
                .iter()
                .filter(|e| matches!(e, Event::CreateBuffer { .. }))
                .count()
        };
        //the buffer and a single staging buffer
        assert_eq!(creations(&engine), 2);
        {
            let arenas = engine.store().read();
            let staging = arenas.buffer(buffer).unwrap().staging.as_ref().unwrap();
            assert_eq!(
                staging.native.data.as_slice(),
                bytemuck::cast_slice::<u32, u8>(&[5, 6, 7, 8])
            );
        }

        engine.gen_frame().unwrap();
        let submission = &engine.backend().submissions()[0];
        let copies: Vec<_> = submission
            .iter()
            .filter(|c| matches!(c, RecordedCommand::CopyBuffer { dst, .. } if *dst == id))
            .collect();
        assert_eq!(copies.len(), 1);
        let first_barrier = submission.iter().position(|c| c.is_barrier()).unwrap();
        let copy_at = submission
            .iter()
            .position(|c| matches!(c, RecordedCommand::CopyBuffer { .. }))
            .unwrap();
        assert!(first_barrier < copy_at);
        assert_eq!(
            engine.sync_state(buffer),
            Some(SyncState::new(KernelKind::Transfer, UsageKind::TransferDst))
        );

        //the staging buffer might still be read by the last frame
        engine.set_buffer_data_pod(buffer, &[9u32]).unwrap();
        assert_eq!(creations(&engine), 3);
    }

    #[test]
    fn host_visible_buffers_are_written_directly() {
        let mut engine = engine();
        let buffer = engine
            .create_buffer(BufferDesc::storage(16).with_memory(MemoryUsage::CpuToGpu))
            .unwrap();
        engine.set_buffer_data_pod(buffer, &[1u32, 2, 3, 4]).unwrap();
        {
            let arenas = engine.store().read();
            let buf = arenas.buffer(buffer).unwrap();
            assert!(!buf.has_staging());
            assert_eq!(
                buf.native().data.as_slice(),
                bytemuck::cast_slice::<u32, u8>(&[1, 2, 3, 4])
            );
        }
        engine.gen_frame().unwrap();
        assert!(
            !engine.backend().submissions()[0]
                .iter()
                .any(|c| matches!(c, RecordedCommand::CopyBuffer { .. }))
        );
    }

    #[test]
    fn unwritable_buffers_are_rejected() {
        let engine = engine();
        let buffer = engine
            .create_buffer(BufferDesc {
                size: 16,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                ..Default::default()
            })
            .unwrap();
        assert!(matches!(
            engine.set_buffer_data(buffer, &[0u8; 32]),
            Err(ResourceError::NotWritable(_))
        ));
        assert_eq!(engine.store().read().buffer(buffer).unwrap().size(), 16);
    }

    #[test]
    fn present_source_is_blitted_to_the_surface() {
        let mut engine = Engine::new(
            HeadlessBackend::new().with_surface(EXT),
            EngineConfig::default(),
        )
        .unwrap();
        let target = engine
            .create_texture(TextureDesc::render_target(EXT, vk::Format::R8G8B8A8_UNORM))
            .unwrap();
        let depth = engine
            .create_texture(TextureDesc::depth(EXT, vk::Format::D32_SFLOAT))
            .unwrap();
        assert!(matches!(
            engine.set_present_source(Some(depth)),
            Err(FrameError::InvalidPresentSource(_))
        ));
        engine.set_present_source(Some(target)).unwrap();
        engine.gen_frame().unwrap();

        let acquire = engine
            .backend()
            .position(|e| matches!(e, Event::Acquire { slot: 0, .. }))
            .unwrap();
        let submit = engine
            .backend()
            .position(|e| matches!(e, Event::Submit { .. }))
            .unwrap();
        let present = engine
            .backend()
            .position(|e| matches!(e, Event::Present { slot: 0, .. }))
            .unwrap();
        assert!(acquire < submit && submit < present);

        let submission = &engine.backend().submissions()[0];
        let to_src = barriers(submission);
        assert_eq!(to_src.len(), 1);
        assert_eq!(to_src[0].new_layout(), vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert!(matches!(
            submission.last(),
            Some(RecordedCommand::BlitToSurface { image: 0, .. })
        ));
    }

    #[test]
    fn failed_creation_leaves_no_trace() {
        let engine = engine();
        engine.backend().fail_next(FailPoint::CreateTextureView);
        assert!(
            engine
                .create_texture(TextureDesc::storage(EXT, vk::Format::R8G8B8A8_UNORM))
                .is_err()
        );
        assert!(engine.store().read().is_empty());
        let events = engine.backend().events();
        let Some(Event::CreateTexture { id }) = events
            .iter()
            .find(|e| matches!(e, Event::CreateTexture { .. }))
            .cloned()
        else {
            panic!("texture was never created");
        };
        assert!(engine.backend().was_destroyed(id));
        assert_eq!(engine.texture_slots.high_water_mark(), 0);
    }

    #[test]
    fn bindless_exhaustion_is_reported() {
        let engine = Engine::new(
            HeadlessBackend::new(),
            EngineConfig::default().with_bindless_limits(4, 1),
        )
        .unwrap();
        engine.create_buffer(BufferDesc::storage(16)).unwrap();
        assert!(matches!(
            engine.create_buffer(BufferDesc::storage(16)),
            Err(ResourceError::BindlessExhausted {
                kind: ResourceKind::Buffer,
                max: 1
            })
        ));
        assert_eq!(engine.store().read().len(), 1);
        assert!(matches!(
            engine.backend().events().last(),
            Some(Event::DestroyBuffer(_))
        ));
        //vertex buffers need no slot
        assert!(engine.create_buffer(BufferDesc::vertex(16)).is_ok());
    }

    #[test]
    fn invalid_kernels_are_rejected_before_creation() {
        let engine = engine();
        assert!(matches!(
            engine.create_kernel(KernelDesc::compute(
                "big",
                vec![SPIRV],
                ParamTable::new().value("blob", 256)
            )),
            Err(ResourceError::ParameterBlockTooBig { .. })
        ));
        let mut desc = KernelDesc::compute("broken", vec![SPIRV], ParamTable::new());
        desc.kind = KernelKind::Graphics;
        assert!(matches!(
            engine.create_kernel(desc),
            Err(ResourceError::InvalidKernel { .. })
        ));
        assert!(
            !engine
                .backend()
                .events()
                .iter()
                .any(|e| matches!(e, Event::CreatePipeline { .. }))
        );
    }

    #[test]
    fn parameter_blocks_resolve_bindless_indices_and_addresses() {
        let mut engine = engine();
        let texture = engine
            .create_texture(TextureDesc::storage(EXT, vk::Format::R8G8B8A8_UNORM))
            .unwrap();
        let output = engine.create_buffer(BufferDesc::storage(256)).unwrap();
        let cs = compute(
            &engine,
            ParamTable::new()
                .resource("src", UsageKind::ReadTexture)
                .address("dst", UsageKind::WriteBuffer)
                .value("scale", 4),
        );
        let mut block = engine.param_block(cs).unwrap();
        block
            .set_resource("src", texture)
            .unwrap()
            .set_resource("dst", output)
            .unwrap()
            .set_value("scale", &2.0f32)
            .unwrap();

        let node = engine.add_node("A").unwrap();
        engine
            .record_frame(node)
            .unwrap()
            .begin_compute_pass()
            .unwrap()
            .bind_kernel(cs)
            .unwrap()
            .push_params(&block)
            .unwrap()
            .dispatch([1, 1, 1])
            .unwrap()
            .end_pass()
            .unwrap();
        engine.gen_frame().unwrap();

        let nodes = executed(&engine.backend().submissions()[0]);
        let data = nodes[0]
            .1
            .iter()
            .find_map(|c| match c {
                RecordedCommand::PushConstants(data) => Some(data.clone()),
                _ => None,
            })
            .unwrap();
        let (src, dst, scale) = {
            let arenas = engine.store().read();
            let params = arenas.kernel(cs).unwrap().params();
            (
                params.entry("src").unwrap().1.offset as usize,
                params.entry("dst").unwrap().1.offset as usize,
                params.entry("scale").unwrap().1.offset as usize,
            )
        };
        let index = engine.bindless_index(texture).unwrap();
        let address = engine.device_address(output).unwrap();
        assert_eq!(data[src..src + 4], index.to_le_bytes());
        assert_eq!(data[dst..dst + 8], address.to_le_bytes());
        assert_eq!(data[scale..scale + 4], 2.0f32.to_le_bytes());

        assert_eq!(
            engine.sync_state(texture),
            Some(SyncState::new(KernelKind::Compute, UsageKind::ReadTexture))
        );
        assert_eq!(
            engine.sync_state(output),
            Some(SyncState::new(KernelKind::Compute, UsageKind::WriteBuffer))
        );
    }

    #[test]
    fn empty_nodes_are_skipped_and_logs_persist() {
        let mut engine = engine();
        let cs = compute(&engine, ParamTable::new());
        let busy = engine.add_node("busy").unwrap();
        engine.add_node("idle").unwrap();
        engine
            .record_frame(busy)
            .unwrap()
            .begin_compute_pass()
            .unwrap()
            .bind_kernel(cs)
            .unwrap()
            .dispatch([1, 1, 1])
            .unwrap()
            .end_pass()
            .unwrap();

        engine.gen_frame().unwrap();
        engine.gen_frame().unwrap();
        for submission in engine.backend().submissions() {
            assert_eq!(executed(&submission).len(), 1);
        }

        engine.record_frame(busy).unwrap();
        engine.gen_frame().unwrap();
        let submissions = engine.backend().submissions();
        assert!(executed(&submissions[2]).is_empty());
    }

    #[test]
    fn resources_destroyed_after_recording_are_skipped() {
        let mut engine = engine();
        let cs = compute(&engine, ParamTable::new());
        let buffer = engine.create_buffer(BufferDesc::storage(64)).unwrap();
        let node = engine.add_node("A").unwrap();
        engine
            .record_frame(node)
            .unwrap()
            .begin_compute_pass()
            .unwrap()
            .bind_kernel(cs)
            .unwrap()
            .as_read_buffer(buffer)
            .unwrap()
            .dispatch([1, 1, 1])
            .unwrap()
            .end_pass()
            .unwrap();
        engine.destroy(buffer).unwrap();

        engine.gen_frame().unwrap();
        let nodes = executed(&engine.backend().submissions()[0]);
        assert!(barriers(&nodes[0].0).is_empty());
        assert!(
            nodes[0]
                .1
                .iter()
                .any(|c| matches!(c, RecordedCommand::Dispatch(_)))
        );
    }

    #[test]
    fn removed_nodes_release_their_pools_later() {
        let mut engine = engine();
        let node = engine.add_node("A").unwrap();
        let pool_destructions = |engine: &Engine<HeadlessBackend>| {
            engine
                .backend()
                .events()
                .iter()
                .filter(|e| matches!(e, Event::DestroyCommandPool(_)))
                .count()
        };
        engine.remove_node(node).unwrap();
        assert!(engine.graph().is_empty());
        assert_eq!(pool_destructions(&engine), 0);
        for _ in 0..crate::FRAMES_IN_FLIGHT {
            engine.gen_frame().unwrap();
        }
        assert_eq!(pool_destructions(&engine), 0);
        engine.gen_frame().unwrap();
        assert_eq!(pool_destructions(&engine), crate::FRAMES_IN_FLIGHT);
    }

    #[test]
    fn frame_slots_rotate() {
        let mut engine = engine();
        let slots: Vec<usize> = (0..5)
            .map(|_| {
                let slot = engine.frame_index();
                engine.gen_frame().unwrap();
                slot
            })
            .collect();
        assert_eq!(slots, [0, 1, 2, 0, 1]);
        assert_eq!(engine.frame_count(), 5);
        engine.wait_idle().unwrap();
    }

    fn texture_id(engine: &Engine<HeadlessBackend>, handle: Handle) -> u64 {
        engine.store().read().texture(handle).unwrap().native().id
    }

    ///Barriers on `resource` in recording order, including those inside executed secondaries.
    fn barriers_of(
        commands: &[RecordedCommand],
        resource: u64,
        out: &mut Vec<crate::sync_state::Barrier>,
    ) {
        for command in commands {
            match command {
                RecordedCommand::Barrier {
                    resource: r,
                    barrier,
                } if *r == resource => out.push(*barrier),
                RecordedCommand::Execute(buffers) => {
                    for (_, nested) in buffers {
                        barriers_of(nested, resource, out);
                    }
                }
                _ => {}
            }
        }
    }

    fn chain(kind: ResourceKind, states: &[SyncState]) -> Vec<crate::sync_state::Barrier> {
        states
            .windows(2)
            .filter_map(|w| crate::sync_state::transition(kind, w[0], w[1]).unwrap())
            .collect()
    }

    #[test]
    fn failed_submission_releases_nothing_early() {
        let mut engine = engine();
        let buffer = engine.create_buffer(BufferDesc::storage(64)).unwrap();
        let id = buffer_id(&engine, buffer);
        engine.gen_frame().unwrap();
        engine.gen_frame().unwrap();

        engine.destroy(buffer).unwrap();
        engine.backend().fail_next(FailPoint::Submit);
        assert!(engine.gen_frame().is_err());
        assert_eq!(engine.frame_index(), 2);
        assert_eq!(engine.frame_count(), 2);

        //the retried frame is the first submission that could have used the buffer.
        engine.gen_frame().unwrap();
        assert!(!engine.backend().was_destroyed(id));
        for _ in 0..2 {
            engine.gen_frame().unwrap();
            assert!(!engine.backend().was_destroyed(id));
        }
        engine.gen_frame().unwrap();
        assert!(engine.backend().was_destroyed(id));
    }

    #[test]
    fn failed_submission_keeps_states_and_uploads() {
        let mut engine = Engine::new(
            HeadlessBackend::new().with_surface(EXT),
            EngineConfig::default(),
        )
        .unwrap();
        let target = engine
            .create_texture(TextureDesc::render_target(EXT, vk::Format::R8G8B8A8_UNORM))
            .unwrap();
        let buffer = engine.create_buffer(BufferDesc::storage(16)).unwrap();
        let id = buffer_id(&engine, buffer);
        let gfx = graphics(&engine);
        let node = engine.add_node("A").unwrap();
        engine
            .record_frame(node)
            .unwrap()
            .begin_render_pass(
                RenderPassDesc::new().with_color(ColorTarget::clear(target, [0.0; 4])),
            )
            .unwrap()
            .bind_kernel(gfx)
            .unwrap()
            .draw(0..3, 0..1)
            .unwrap()
            .end_pass()
            .unwrap();
        engine.set_buffer_data_pod(buffer, &[1u32, 2, 3, 4]).unwrap();
        engine.set_present_source(Some(target)).unwrap();

        engine.backend().fail_next(FailPoint::Submit);
        assert!(engine.gen_frame().is_err());
        assert!(engine.backend().submissions().is_empty());
        assert_eq!(engine.sync_state(target), Some(SyncState::UNDEFINED));
        assert_eq!(engine.sync_state(buffer), Some(SyncState::UNDEFINED));

        engine.gen_frame().unwrap();
        let submissions = engine.backend().submissions();
        assert_eq!(submissions.len(), 1);
        assert!(
            submissions[0]
                .iter()
                .any(|c| matches!(c, RecordedCommand::CopyBuffer { dst, .. } if *dst == id))
        );
        let nodes = executed(&submissions[0]);
        let first = barriers(&nodes[0].0);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].old_layout(), vk::ImageLayout::UNDEFINED);
        assert_eq!(
            engine.sync_state(target),
            Some(SyncState::new(KernelKind::Transfer, UsageKind::TransferSrc))
        );
    }

    #[test]
    fn failed_node_replay_acquires_no_surface_image() {
        let mut engine = Engine::new(
            HeadlessBackend::new().with_surface(EXT),
            EngineConfig::default(),
        )
        .unwrap();
        let target = engine
            .create_texture(TextureDesc::render_target(EXT, vk::Format::R8G8B8A8_UNORM))
            .unwrap();
        let cs = compute(&engine, ParamTable::new());
        let node = engine.add_node("A").unwrap();
        engine
            .record_frame(node)
            .unwrap()
            .begin_compute_pass()
            .unwrap()
            .bind_kernel(cs)
            .unwrap()
            .dispatch([1, 1, 1])
            .unwrap()
            .end_pass()
            .unwrap();
        engine.set_present_source(Some(target)).unwrap();

        engine.backend().fail_next(FailPoint::BeginSecondary);
        assert!(engine.gen_frame().is_err());
        assert!(
            engine
                .backend()
                .position(|e| matches!(e, Event::Acquire { .. }))
                .is_none()
        );
        assert!(engine.backend().submissions().is_empty());

        engine.gen_frame().unwrap();
        let acquire = engine
            .backend()
            .position(|e| matches!(e, Event::Acquire { .. }))
            .unwrap();
        let submit = engine
            .backend()
            .position(|e| matches!(e, Event::Submit { .. }))
            .unwrap();
        assert!(acquire < submit);
        assert_eq!(executed(&engine.backend().submissions()[0]).len(), 1);
    }

    #[test]
    fn failed_acquire_drops_the_frame() {
        let mut engine = Engine::new(
            HeadlessBackend::new().with_surface(EXT),
            EngineConfig::default(),
        )
        .unwrap();
        let target = engine
            .create_texture(TextureDesc::render_target(EXT, vk::Format::R8G8B8A8_UNORM))
            .unwrap();
        engine.set_present_source(Some(target)).unwrap();

        engine.backend().fail_next(FailPoint::Acquire);
        assert!(engine.gen_frame().is_err());
        assert!(engine.backend().submissions().is_empty());
        assert_eq!(engine.sync_state(target), Some(SyncState::UNDEFINED));
        assert_eq!(engine.frame_count(), 0);

        engine.gen_frame().unwrap();
        assert_eq!(engine.backend().submissions().len(), 1);
        assert!(
            engine
                .backend()
                .position(|e| matches!(e, Event::Present { slot: 0, .. }))
                .is_some()
        );
    }

    #[test]
    fn barriers_chain_across_nodes_and_frames() {
        let mut engine = engine();
        let texture = engine
            .create_texture(TextureDesc::storage(EXT, vk::Format::R8G8B8A8_UNORM))
            .unwrap();
        let target = engine
            .create_texture(TextureDesc::render_target(EXT, vk::Format::R8G8B8A8_UNORM))
            .unwrap();
        let buffer = engine.create_buffer(BufferDesc::storage(256)).unwrap();
        let cs = compute(&engine, ParamTable::new());
        let gfx = graphics(&engine);

        let write = engine.add_node("W").unwrap();
        let read = engine.add_node("R").unwrap();
        let sample = engine.add_node("S").unwrap();
        engine.set_wait_list(read, &["W"]).unwrap();
        engine.set_wait_list(sample, &["R"]).unwrap();

        engine
            .record_frame(write)
            .unwrap()
            .begin_compute_pass()
            .unwrap()
            .bind_kernel(cs)
            .unwrap()
            .as_write_texture(texture)
            .unwrap()
            .as_write_buffer(buffer)
            .unwrap()
            .dispatch([8, 8, 1])
            .unwrap()
            .end_pass()
            .unwrap();
        engine
            .record_frame(read)
            .unwrap()
            .begin_compute_pass()
            .unwrap()
            .bind_kernel(cs)
            .unwrap()
            .as_read_texture(texture)
            .unwrap()
            .as_read_buffer(buffer)
            .unwrap()
            .dispatch([8, 8, 1])
            .unwrap()
            .end_pass()
            .unwrap();
        engine
            .record_frame(sample)
            .unwrap()
            .begin_render_pass(
                RenderPassDesc::new().with_color(ColorTarget::clear(target, [0.0; 4])),
            )
            .unwrap()
            .bind_kernel(gfx)
            .unwrap()
            .as_sampled_texture(texture)
            .unwrap()
            .draw(0..3, 0..1)
            .unwrap()
            .end_pass()
            .unwrap();

        engine.gen_frame().unwrap();
        engine.gen_frame().unwrap();

        let submissions = engine.backend().submissions();
        assert_eq!(submissions.len(), 2);
        let recorded = |resource: u64| {
            let mut out = Vec::new();
            for submission in submissions.iter() {
                barriers_of(submission, resource, &mut out);
            }
            out
        };

        let write_tex = SyncState::new(KernelKind::Compute, UsageKind::WriteTexture);
        let read_tex = SyncState::new(KernelKind::Compute, UsageKind::ReadTexture);
        let sampled = SyncState::new(KernelKind::Graphics, UsageKind::Sampled);
        assert_eq!(
            recorded(texture_id(&engine, texture)),
            chain(
                ResourceKind::Texture,
                &[
                    SyncState::UNDEFINED,
                    write_tex,
                    read_tex,
                    sampled,
                    write_tex,
                    read_tex,
                    sampled
                ]
            )
        );

        let write_buf = SyncState::new(KernelKind::Compute, UsageKind::WriteBuffer);
        let read_buf = SyncState::new(KernelKind::Compute, UsageKind::ReadBuffer);
        assert_eq!(
            recorded(buffer_id(&engine, buffer)),
            chain(
                ResourceKind::Buffer,
                &[SyncState::UNDEFINED, write_buf, read_buf, write_buf, read_buf]
            )
        );

        let render_target = SyncState::new(KernelKind::Graphics, UsageKind::RenderTarget);
        assert_eq!(
            recorded(texture_id(&engine, target)),
            chain(ResourceKind::Texture, &[SyncState::UNDEFINED, render_target])
        );

        //every node records its barriers into prev, none end up between its commands.
        for submission in submissions.iter() {
            let nodes = executed(submission);
            assert_eq!(nodes.len(), 3);
            for (_, current) in nodes.iter() {
                assert!(barriers(current).is_empty());
            }
        }
        assert_eq!(engine.sync_state(texture), Some(sampled));
        assert_eq!(engine.sync_state(buffer), Some(read_buf));
    }

    #[test]
    fn mid_node_transitions_are_recorded_before_the_node() {
        let mut engine = engine();
        let texture = engine
            .create_texture(TextureDesc::render_target(EXT, vk::Format::R8G8B8A8_UNORM))
            .unwrap();
        let target = engine
            .create_texture(TextureDesc::render_target(EXT, vk::Format::R8G8B8A8_UNORM))
            .unwrap();
        let gfx = graphics(&engine);
        let node = engine.add_node("A").unwrap();
        engine
            .record_frame(node)
            .unwrap()
            .begin_render_pass(
                RenderPassDesc::new().with_color(ColorTarget::clear(texture, [0.0; 4])),
            )
            .unwrap()
            .bind_kernel(gfx)
            .unwrap()
            .draw(0..3, 0..1)
            .unwrap()
            .end_pass()
            .unwrap()
            .begin_render_pass(
                RenderPassDesc::new().with_color(ColorTarget::clear(target, [0.0; 4])),
            )
            .unwrap()
            .bind_kernel(gfx)
            .unwrap()
            .as_sampled_texture(texture)
            .unwrap()
            .draw(0..3, 0..1)
            .unwrap()
            .end_pass()
            .unwrap();

        engine.gen_frame().unwrap();
        let nodes = executed(&engine.backend().submissions()[0]);
        let (prev, current) = &nodes[0];
        assert!(barriers(current).is_empty());
        let hoisted = barriers(prev);
        assert_eq!(hoisted.len(), 3);
        assert_eq!(hoisted[2].old_layout(), vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(hoisted[2].new_layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(
            engine.sync_state(texture),
            Some(SyncState::new(KernelKind::Graphics, UsageKind::Sampled))
        );
    }

    #[test]
    fn host_visible_buffers_in_flight_are_staged() {
        let mut engine = engine();
        let cs = compute(&engine, ParamTable::new());
        let buffer = engine
            .create_buffer(BufferDesc::storage(16).with_memory(MemoryUsage::CpuToGpu))
            .unwrap();
        let id = buffer_id(&engine, buffer);
        let node = engine.add_node("A").unwrap();
        engine
            .record_frame(node)
            .unwrap()
            .begin_compute_pass()
            .unwrap()
            .bind_kernel(cs)
            .unwrap()
            .as_read_buffer(buffer)
            .unwrap()
            .dispatch([1, 1, 1])
            .unwrap()
            .end_pass()
            .unwrap();

        let contents = |engine: &Engine<HeadlessBackend>| {
            engine
                .store()
                .read()
                .buffer(buffer)
                .unwrap()
                .native()
                .data
                .clone()
        };

        //nothing read the buffer yet
        engine.set_buffer_data_pod(buffer, &[1u32, 2, 3, 4]).unwrap();
        engine.gen_frame().unwrap();

        engine.set_buffer_data_pod(buffer, &[5u32, 6, 7, 8]).unwrap();
        assert_eq!(contents(&engine), bytemuck::cast_slice::<u32, u8>(&[1, 2, 3, 4]));
        assert!(engine.store().read().buffer(buffer).unwrap().has_staging());

        engine.gen_frame().unwrap();
        let submission = &engine.backend().submissions()[1];
        let copy_at = submission
            .iter()
            .position(|c| matches!(c, RecordedCommand::CopyBuffer { dst, .. } if *dst == id))
            .unwrap();
        let execute_at = submission
            .iter()
            .position(|c| matches!(c, RecordedCommand::Execute(_)))
            .unwrap();
        assert!(copy_at < execute_at);

        //once no frame in flight used it, writes go straight through the mapping again.
        engine.record_frame(node).unwrap();
        for _ in 0..crate::FRAMES_IN_FLIGHT {
            engine.gen_frame().unwrap();
        }
        engine.set_buffer_data_pod(buffer, &[9u32, 9, 9, 9]).unwrap();
        assert_eq!(contents(&engine), bytemuck::cast_slice::<u32, u8>(&[9, 9, 9, 9]));
        engine.gen_frame().unwrap();
        assert!(
            !engine
                .backend()
                .submissions()
                .last()
                .unwrap()
                .iter()
                .any(|c| matches!(c, RecordedCommand::CopyBuffer { .. }))
        );
    }
}
