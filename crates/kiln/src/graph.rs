//! The frame graph owns all [RenderNode]s and decides in which order they are executed.
//!
//! Dependencies are declared by name: a node's wait list names the nodes that have to run before it. Names that are
//! not (yet) known are ignored, so nodes can be created in any order. The order is a post-order depth-first walk that
//! starts at the root node and then visits every node in insertion order.

use ahash::AHashMap;
use slotmap::{SecondaryMap, SlotMap};

use crate::{
    backend::{Backend, NativeCommand},
    error::{BackendError, GraphError, KilnError},
    handle::Handle,
    node::RenderNode,
    store::ResourceStore,
    sync_state::SyncState,
};

slotmap::new_key_type! {
    ///Identifies a [RenderNode] within a [FrameGraph].
    pub struct NodeHandle;
}

struct GraphNode<B: Backend> {
    node: RenderNode<B>,
    waits: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    OnStack,
    Done,
}

pub struct FrameGraph<B: Backend> {
    nodes: SlotMap<NodeHandle, GraphNode<B>>,
    names: AHashMap<String, NodeHandle>,
    insertion: Vec<NodeHandle>,
    root: Option<NodeHandle>,
    order: Vec<NodeHandle>,
    dirty: bool,
    sort_count: u64,
}

impl<B: Backend> Default for FrameGraph<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> FrameGraph<B> {
    pub fn new() -> Self {
        FrameGraph {
            nodes: SlotMap::with_key(),
            names: AHashMap::default(),
            insertion: Vec::new(),
            root: None,
            order: Vec::new(),
            dirty: false,
            sort_count: 0,
        }
    }

    ///Creates a new, empty node called `name`. Names are unique within the graph.
    pub fn add_node(&mut self, name: &str, backend: &B) -> Result<NodeHandle, KilnError> {
        if self.names.contains_key(name) {
            #[cfg(feature = "logging")]
            log::error!("Node {} already exists", name);
            return Err(GraphError::DuplicateName(name.to_owned()).into());
        }
        let node = RenderNode::new(name.to_owned(), backend).map_err(BackendError::new)?;
        let handle = self.nodes.insert(GraphNode {
            node,
            waits: Vec::new(),
        });
        self.names.insert(name.to_owned(), handle);
        self.insertion.push(handle);
        self.dirty = true;
        Ok(handle)
    }

    ///Removes the node and returns it. The caller is responsible for reclaiming its native objects.
    pub(crate) fn remove_node(&mut self, handle: NodeHandle) -> Result<RenderNode<B>, GraphError> {
        let Some(removed) = self.nodes.remove(handle) else {
            return Err(GraphError::NoSuchNode(handle));
        };
        self.names.remove(removed.node.name());
        self.insertion.retain(|h| *h != handle);
        if self.root == Some(handle) {
            self.root = None;
        }
        self.dirty = true;
        Ok(removed.node)
    }

    ///Replaces the wait list of `handle`. If the new list would introduce a cycle, the old list and order are kept.
    pub fn set_wait_list<S: AsRef<str>>(
        &mut self,
        handle: NodeHandle,
        waits: &[S],
    ) -> Result<(), GraphError> {
        let Some(node) = self.nodes.get_mut(handle) else {
            return Err(GraphError::NoSuchNode(handle));
        };
        let new = waits.iter().map(|s| s.as_ref().to_owned()).collect();
        let old = std::mem::replace(&mut node.waits, new);

        match self.sort() {
            Ok(order) => {
                self.order = order;
                self.dirty = false;
                Ok(())
            }
            Err(e) => {
                #[cfg(feature = "logging")]
                log::error!("Rejecting wait list: {}", e);
                if let Some(node) = self.nodes.get_mut(handle) {
                    node.waits = old;
                }
                Err(e)
            }
        }
    }

    pub fn wait_list(&self, handle: NodeHandle) -> Option<&[String]> {
        self.nodes.get(handle).map(|n| n.waits.as_slice())
    }

    ///Sets the node that is visited first. `None` falls back to pure insertion order.
    pub fn set_root(&mut self, root: Option<NodeHandle>) -> Result<(), GraphError> {
        if let Some(r) = root {
            if !self.nodes.contains_key(r) {
                return Err(GraphError::NoSuchNode(r));
            }
        }
        self.root = root;
        self.dirty = true;
        Ok(())
    }

    pub fn root(&self) -> Option<NodeHandle> {
        self.root
    }

    ///Forces a new sort before the next frame.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    ///Number of times the order was computed.
    pub fn sort_count(&self) -> u64 {
        self.sort_count
    }

    ///Current execution order. Sorts if the graph is dirty.
    pub fn order(&mut self) -> &[NodeHandle] {
        self.ensure_sorted();
        &self.order
    }

    pub fn node(&self, handle: NodeHandle) -> Option<&RenderNode<B>> {
        self.nodes.get(handle).map(|n| &n.node)
    }

    pub(crate) fn node_mut(&mut self, handle: NodeHandle) -> Option<&mut RenderNode<B>> {
        self.nodes.get_mut(handle).map(|n| &mut n.node)
    }

    pub fn by_name(&self, name: &str) -> Option<NodeHandle> {
        self.names.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn ensure_sorted(&mut self) {
        if !self.dirty {
            return;
        }
        match self.sort() {
            Ok(order) => self.order = order,
            Err(_e) => {
                //wait lists are checked when set, so only a bug gets here.
                #[cfg(feature = "logging")]
                log::error!("Keeping previous node order: {}", _e);
                let nodes = &self.nodes;
                self.order.retain(|h| nodes.contains_key(*h));
            }
        }
        self.dirty = false;
    }

    fn sort(&mut self) -> Result<Vec<NodeHandle>, GraphError> {
        self.sort_count += 1;
        let mut visits = SecondaryMap::with_capacity(self.nodes.len());
        let mut order = Vec::with_capacity(self.nodes.len());
        for start in self.root.into_iter().chain(self.insertion.iter().copied()) {
            if !visits.contains_key(start) {
                self.visit(start, &mut visits, &mut order)?;
            }
        }

        #[cfg(feature = "logging")]
        log::trace!("Sorted {} nodes", order.len());

        Ok(order)
    }

    fn visit(
        &self,
        handle: NodeHandle,
        visits: &mut SecondaryMap<NodeHandle, Visit>,
        order: &mut Vec<NodeHandle>,
    ) -> Result<(), GraphError> {
        let Some(node) = self.nodes.get(handle) else {
            return Ok(());
        };
        visits.insert(handle, Visit::OnStack);
        for name in node.waits.iter() {
            let Some(dep) = self.names.get(name).copied() else {
                #[cfg(feature = "logging")]
                log::warn!("Node {} waits for unknown node {}", node.node.name(), name);
                continue;
            };
            match visits.get(dep) {
                Some(Visit::Done) => {}
                Some(Visit::OnStack) => {
                    return Err(GraphError::Cycle {
                        node: node.node.name().to_owned(),
                        via: name.clone(),
                    });
                }
                None => self.visit(dep, visits, order)?,
            }
        }
        visits.insert(handle, Visit::Done);
        order.push(handle);
        Ok(())
    }

    ///Replays every node in order into `slot` and executes the recorded buffers from `primary`. Returns the number of
    /// executed nodes.
    ///
    /// The final state of every touched resource is written to `frame`, the store is not modified. The caller commits
    /// `frame` once the primary command buffer was submitted.
    pub(crate) fn execute(
        &mut self,
        slot: usize,
        backend: &B,
        store: &ResourceStore<B>,
        primary: &mut B::CommandBuffer,
        frame: &mut AHashMap<Handle, SyncState>,
    ) -> Result<usize, BackendError> {
        self.ensure_sorted();
        let arenas = store.read();
        let mut executed = 0;
        for handle in self.order.iter() {
            let Some(entry) = self.nodes.get_mut(*handle) else {
                continue;
            };
            let node = &mut entry.node;
            node.prepare_frame(slot, backend).map_err(BackendError::new)?;

            let Some(updates) = node.replay(slot, backend, &arenas, frame)? else {
                continue;
            };
            frame.extend(updates);

            let (prev, current) = node.command_buffers(slot);
            backend.record(primary, NativeCommand::ExecuteSecondary(&[prev, current]));
            executed += 1;
        }
        Ok(executed)
    }

    ///Removes every node, for shutdown.
    pub(crate) fn drain(&mut self) -> Vec<RenderNode<B>> {
        self.names.clear();
        self.insertion.clear();
        self.order.clear();
        self.root = None;
        self.nodes.drain().map(|(_, n)| n.node).collect()
    }
}
