//! Render nodes, the unit of work scheduled by the [FrameGraph](crate::FrameGraph).
//!
//! A node owns a log of [NodeCommand]s written through a [NodeRecorder]. Each frame the log is replayed into two
//! secondary command buffers of the current frame slot:
//!
//! - `prev` only contains barriers,
//! - `current` contains the actual commands.
//!
//! Both are executed back to back, so every barrier that is discovered while walking the log still ends up in front
//! of the node's work. The first use of a resource within the node is resolved against the resource's *global*
//! state, every following change of use against the node-local state. After the replay the last local state of every
//! touched resource becomes its state for the rest of the frame, and its global state once the frame was submitted.

mod command;
mod recorder;

use ahash::AHashMap;
use ash::vk;
use smallvec::SmallVec;

pub use command::{ColorTarget, DepthTarget, Region, RenderPassDesc};
pub(crate) use command::NodeCommand;
pub use recorder::NodeRecorder;

use crate::{
    FRAMES_IN_FLIGHT,
    backend::{
        Backend, ColorAttachment, CommandLevel, DepthAttachment, NativeBarrier, NativeCommand,
    },
    error::BackendError,
    handle::{Handle, ResourceKind},
    resources::{Kernel, ParamBlock},
    store::Arenas,
    sync_state::{Barrier, SyncState, transition},
};

struct NodeSlot<B: Backend> {
    pool: B::CommandPool,
    prev: B::CommandBuffer,
    current: B::CommandBuffer,
}

pub struct RenderNode<B: Backend> {
    name: String,
    log: Vec<NodeCommand>,
    slots: Vec<NodeSlot<B>>,
    ///Node-local state of every resource touched in this frame.
    local: AHashMap<Handle, SyncState>,
    ///First use of each resource, resolved against the global state.
    begin_of_node: Vec<(Handle, SyncState)>,
    ///Changes of use after the first one.
    mid_node: Vec<(Handle, Barrier)>,
}

///Pass state while a node's log is replayed.
struct ReplayPass {
    extent: Option<vk::Extent2D>,
    //true while commands are dropped because the pass could not be started.
    skipping: bool,
    rendering: bool,
}

impl<B: Backend> RenderNode<B> {
    pub(crate) fn new(name: String, backend: &B) -> Result<Self, B::Error> {
        let mut slots = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for _ in 0..FRAMES_IN_FLIGHT {
            let mut pool = backend.create_command_pool()?;
            let buffers = backend
                .allocate_command_buffer(&mut pool, CommandLevel::Secondary)
                .and_then(|prev| {
                    backend
                        .allocate_command_buffer(&mut pool, CommandLevel::Secondary)
                        .map(|current| (prev, current))
                });
            match buffers {
                Ok((prev, current)) => slots.push(NodeSlot {
                    pool,
                    prev,
                    current,
                }),
                Err(e) => {
                    backend.destroy_command_pool(pool);
                    for slot in slots {
                        backend.destroy_command_pool(slot.pool);
                    }
                    return Err(e);
                }
            }
        }

        Ok(RenderNode {
            name,
            log: Vec::new(),
            slots,
            local: AHashMap::default(),
            begin_of_node: Vec::new(),
            mid_node: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    ///Number of commands in the log.
    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    ///Clears the command log. The node is skipped until something is recorded again.
    pub fn clear(&mut self) {
        self.log.clear();
    }

    ///The `(prev, current)` command buffers of `slot`.
    pub fn command_buffers(&self, slot: usize) -> (&B::CommandBuffer, &B::CommandBuffer) {
        let slot = &self.slots[slot % FRAMES_IN_FLIGHT];
        (&slot.prev, &slot.current)
    }

    pub(crate) fn push(&mut self, command: NodeCommand) {
        self.log.push(command);
    }

    ///Resets the per-frame state and the command pool of `slot`.
    pub(crate) fn prepare_frame(&mut self, slot: usize, backend: &B) -> Result<(), B::Error> {
        self.local.clear();
        self.begin_of_node.clear();
        self.mid_node.clear();
        backend.reset_command_pool(&mut self.slots[slot % FRAMES_IN_FLIGHT].pool)
    }

    ///Hands the native objects over for destruction.
    pub(crate) fn into_pools(self) -> impl Iterator<Item = B::CommandPool> {
        self.slots.into_iter().map(|s| s.pool)
    }

    fn declare(&mut self, handle: Handle, state: SyncState) {
        match self.local.get(&handle).copied() {
            None => {
                self.begin_of_node.push((handle, state));
                self.local.insert(handle, state);
            }
            Some(old) if old == state => {}
            Some(old) => {
                match transition(handle.kind(), old, state) {
                    Ok(Some(barrier)) => self.mid_node.push((handle, barrier)),
                    Ok(None) => {}
                    Err(_e) => {
                        #[cfg(feature = "logging")]
                        log::error!("Node {}: ignoring invalid use of {:?}: {}", self.name, handle, _e);
                        return;
                    }
                }
                self.local.insert(handle, state);
            }
        }
    }

    ///Replays the log into the command buffers of `slot`. Returns `None` if there is nothing to record, otherwise
    /// the final state of every resource touched by the node.
    ///
    /// `frame` holds the states earlier work of the same frame left resources in. It takes precedence over the
    /// store, which only holds states of submitted frames.
    pub(crate) fn replay(
        &mut self,
        slot: usize,
        backend: &B,
        arenas: &Arenas<B>,
        frame: &AHashMap<Handle, SyncState>,
    ) -> Result<Option<Vec<(Handle, SyncState)>>, BackendError> {
        if self.log.is_empty() {
            return Ok(None);
        }

        let log = std::mem::take(&mut self.log);
        let result = self.replay_log(&log, slot, backend, arenas, frame);
        self.log = log;
        result.map(Some)
    }

    fn replay_log(
        &mut self,
        log: &[NodeCommand],
        slot: usize,
        backend: &B,
        arenas: &Arenas<B>,
        frame: &AHashMap<Handle, SyncState>,
    ) -> Result<Vec<(Handle, SyncState)>, BackendError> {
        let slot = slot % FRAMES_IN_FLIGHT;
        {
            let s = &mut self.slots[slot];
            backend.begin(&mut s.prev).map_err(BackendError::new)?;
            backend.begin(&mut s.current).map_err(BackendError::new)?;
        }

        let mut pass = ReplayPass {
            extent: None,
            skipping: false,
            rendering: false,
        };
        let mut kernel: Option<&Kernel<B>> = None;

        for command in log {
            if pass.skipping && !matches!(command, NodeCommand::EndPass) {
                continue;
            }
            match command {
                NodeCommand::Use { handle, state } => {
                    if arenas.contains(*handle) {
                        self.declare(*handle, *state);
                    } else {
                        self.skipped(command);
                    }
                }
                NodeCommand::BeginCompute => {}
                NodeCommand::BeginRender(desc) => {
                    if !self.begin_rendering(desc, slot, backend, arenas, &mut pass) {
                        self.skipped(command);
                        pass.skipping = true;
                    }
                }
                NodeCommand::EndPass => {
                    if pass.rendering {
                        backend.record(&mut self.slots[slot].current, NativeCommand::EndRendering);
                    }
                    pass = ReplayPass {
                        extent: None,
                        skipping: false,
                        rendering: false,
                    };
                    kernel = None;
                }
                NodeCommand::BindKernel(handle) => {
                    kernel = arenas.kernel(*handle);
                    match kernel {
                        Some(k) => backend.record(
                            &mut self.slots[slot].current,
                            NativeCommand::BindPipeline(&k.pipeline),
                        ),
                        None => self.skipped(command),
                    }
                }
                NodeCommand::BindVertexBuffers { first, buffers } => {
                    let natives: Option<SmallVec<[(&B::Buffer, u64); 4]>> = buffers
                        .iter()
                        .map(|(h, offset)| arenas.buffer(*h).map(|b| (&b.native, *offset)))
                        .collect();
                    match natives {
                        Some(natives) => backend.record(
                            &mut self.slots[slot].current,
                            NativeCommand::BindVertexBuffers {
                                first: *first,
                                buffers: &natives,
                            },
                        ),
                        None => self.skipped(command),
                    }
                }
                NodeCommand::BindIndexBuffer {
                    buffer,
                    offset,
                    index_type,
                } => match arenas.buffer(*buffer) {
                    Some(b) => backend.record(
                        &mut self.slots[slot].current,
                        NativeCommand::BindIndexBuffer {
                            buffer: &b.native,
                            offset: *offset,
                            index_type: *index_type,
                        },
                    ),
                    None => self.skipped(command),
                },
                NodeCommand::SetViewport(region) => match pass.extent {
                    Some(extent) => {
                        let rect = region.resolve(extent);
                        backend.record(
                            &mut self.slots[slot].current,
                            NativeCommand::SetViewport(vk::Viewport {
                                x: rect.offset.x as f32,
                                y: rect.offset.y as f32,
                                width: rect.extent.width as f32,
                                height: rect.extent.height as f32,
                                min_depth: 0.0,
                                max_depth: 1.0,
                            }),
                        );
                    }
                    None => self.skipped(command),
                },
                NodeCommand::SetScissor(region) => match pass.extent {
                    Some(extent) => backend.record(
                        &mut self.slots[slot].current,
                        NativeCommand::SetScissor(region.resolve(extent)),
                    ),
                    None => self.skipped(command),
                },
                NodeCommand::PushConstants(data) => {
                    if kernel.is_some() {
                        backend.record(
                            &mut self.slots[slot].current,
                            NativeCommand::PushConstants(data),
                        );
                    } else {
                        self.skipped(command);
                    }
                }
                NodeCommand::PushParams(block) => match (kernel, resolve_params(block, arenas)) {
                    (Some(_), Some(data)) => backend.record(
                        &mut self.slots[slot].current,
                        NativeCommand::PushConstants(&data),
                    ),
                    _ => self.skipped(command),
                },
                NodeCommand::Draw {
                    vertices,
                    instances,
                } => {
                    if kernel.is_some() {
                        backend.record(
                            &mut self.slots[slot].current,
                            NativeCommand::Draw {
                                vertices: vertices.clone(),
                                instances: instances.clone(),
                            },
                        );
                    } else {
                        self.skipped(command);
                    }
                }
                NodeCommand::DrawIndexed {
                    indices,
                    vertex_offset,
                    instances,
                } => {
                    if kernel.is_some() {
                        backend.record(
                            &mut self.slots[slot].current,
                            NativeCommand::DrawIndexed {
                                indices: indices.clone(),
                                vertex_offset: *vertex_offset,
                                instances: instances.clone(),
                            },
                        );
                    } else {
                        self.skipped(command);
                    }
                }
                NodeCommand::DrawIndexedIndirect {
                    buffer,
                    offset,
                    draw_count,
                    stride,
                } => match (kernel, arenas.buffer(*buffer)) {
                    (Some(_), Some(b)) => backend.record(
                        &mut self.slots[slot].current,
                        NativeCommand::DrawIndexedIndirect {
                            buffer: &b.native,
                            offset: *offset,
                            draw_count: *draw_count,
                            stride: *stride,
                        },
                    ),
                    _ => self.skipped(command),
                },
                NodeCommand::Dispatch(groups) => {
                    if kernel.is_some() {
                        backend.record(
                            &mut self.slots[slot].current,
                            NativeCommand::Dispatch(*groups),
                        );
                    } else {
                        self.skipped(command);
                    }
                }
                NodeCommand::CopyBuffer { src, dst, regions } => {
                    match (arenas.buffer(*src), arenas.buffer(*dst)) {
                        (Some(s), Some(d)) => backend.record(
                            &mut self.slots[slot].current,
                            NativeCommand::CopyBuffer {
                                src: &s.native,
                                dst: &d.native,
                                regions: regions.as_slice(),
                            },
                        ),
                        _ => self.skipped(command),
                    }
                }
            }
        }

        if pass.rendering {
            #[cfg(feature = "logging")]
            log::warn!("Node {} left its render pass open, closing it", self.name);
            backend.record(&mut self.slots[slot].current, NativeCommand::EndRendering);
        }

        //Begin-of-node barriers first, resolved against the global state.
        let mut barriers: Vec<(Handle, Barrier)> =
            Vec::with_capacity(self.begin_of_node.len() + self.mid_node.len());
        for (handle, first) in self.begin_of_node.iter() {
            let Some(global) = frame_state(arenas, frame, *handle) else {
                continue;
            };
            match transition(handle.kind(), global, *first) {
                Ok(Some(barrier)) => barriers.push((*handle, barrier)),
                Ok(None) => {}
                Err(_e) => {
                    #[cfg(feature = "logging")]
                    log::error!("Node {}: no barrier from {:?} for {:?}: {}", self.name, global, handle, _e);
                }
            }
        }
        barriers.extend(self.mid_node.iter().copied());

        let natives: Vec<NativeBarrier<'_, B>> = barriers
            .iter()
            .filter_map(|(handle, barrier)| native_barrier(arenas, *handle, *barrier))
            .collect();

        let s = &mut self.slots[slot];
        if !natives.is_empty() {
            backend.record(&mut s.prev, NativeCommand::Barriers(&natives));
        }
        backend.end(&mut s.prev).map_err(BackendError::new)?;
        backend.end(&mut s.current).map_err(BackendError::new)?;

        Ok(self.local.iter().map(|(h, s)| (*h, *s)).collect())
    }

    ///Records the begin of a render pass. Returns false if any attachment is gone.
    fn begin_rendering(
        &mut self,
        desc: &RenderPassDesc,
        slot: usize,
        backend: &B,
        arenas: &Arenas<B>,
        pass: &mut ReplayPass,
    ) -> bool {
        let colors: Option<SmallVec<[ColorAttachment<'_, B>; 4]>> = desc
            .colors
            .iter()
            .map(|c| {
                arenas
                    .texture(c.texture)
                    .and_then(|t| t.default_view())
                    .map(|view| ColorAttachment { view, load: c.load })
            })
            .collect();
        let Some(colors) = colors else {
            return false;
        };
        let depth = match &desc.depth {
            Some(d) => match arenas.texture(d.texture).and_then(|t| t.default_view()) {
                Some(view) => Some(DepthAttachment { view, load: d.load }),
                None => return false,
            },
            None => None,
        };
        let Some(extent) = desc
            .attachments()
            .next()
            .and_then(|h| arenas.texture(h))
            .map(|t| t.extent())
        else {
            return false;
        };

        backend.record(
            &mut self.slots[slot].current,
            NativeCommand::BeginRendering {
                extent,
                colors: &colors,
                depth,
            },
        );
        pass.extent = Some(extent);
        pass.rendering = true;
        true
    }

    fn skipped(&self, _command: &NodeCommand) {
        #[cfg(feature = "logging")]
        log::warn!(
            "Node {}: skipping {:?}, a referenced resource is gone",
            self.name,
            _command
        );
    }
}

///State of `handle` as left by the work recorded so far in this frame.
pub(crate) fn frame_state<B: Backend>(
    arenas: &Arenas<B>,
    frame: &AHashMap<Handle, SyncState>,
    handle: Handle,
) -> Option<SyncState> {
    if !arenas.contains(handle) {
        return None;
    }
    frame
        .get(&handle)
        .copied()
        .or_else(|| arenas.sync_state(handle))
}

///Copies the parameter data and patches in the current bindless index or device address of every bound resource.
fn resolve_params<B: Backend>(block: &ParamBlock, arenas: &Arenas<B>) -> Option<Vec<u8>> {
    let mut data = block.data.clone();
    for (handle, _usage, entry) in block.resources() {
        let value = match handle.kind() {
            ResourceKind::Buffer => {
                let buffer = arenas.buffer(handle)?;
                if entry.size == 8 {
                    buffer.address?
                } else {
                    buffer.bindless? as u64
                }
            }
            ResourceKind::Texture => arenas.texture(handle)?.bindless? as u64,
            ResourceKind::Kernel => return None,
        };
        ParamBlock::patch(&mut data, entry, value);
    }
    Some(data)
}

pub(crate) fn native_barrier<B: Backend>(
    arenas: &Arenas<B>,
    handle: Handle,
    barrier: Barrier,
) -> Option<NativeBarrier<'_, B>> {
    match handle.kind() {
        ResourceKind::Buffer => arenas.buffer(handle).map(|b| NativeBarrier::Buffer {
            buffer: &b.native,
            barrier,
        }),
        ResourceKind::Texture => arenas.texture(handle).map(|t| NativeBarrier::Texture {
            texture: &t.native,
            aspect: t.desc.aspect(),
            barrier,
        }),
        ResourceKind::Kernel => None,
    }
}
