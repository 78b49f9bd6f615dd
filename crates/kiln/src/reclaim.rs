//! Deferred destruction of native objects.
//!
//! Destroying a resource only removes its handle. Everything native goes through a [ReclaimSender] into a
//! multi-producer queue. Once a frame was submitted successfully, the queue is drained into the pending list of that
//! frame's slot. That list is executed the next time the same slot comes around, after its fence has signaled.
//! By then the GPU can not be using any of the objects anymore. A frame that fails to submit stages nothing, so its
//! items wait for the next successful submission.

use crossbeam_channel::{Receiver, Sender};

use crate::{FRAMES_IN_FLIGHT, backend::Backend, bindless::BindlessAllocator};

///Single deferred destruction.
pub enum Reclaim<B: Backend> {
    Buffer {
        native: B::Buffer,
        views: Vec<B::BufferView>,
    },
    Texture {
        native: B::Texture,
        views: Vec<B::TextureView>,
    },
    Pipeline(B::Pipeline),
    CommandPool(B::CommandPool),
    BufferSlot(u32),
    TextureSlot(u32),
}

impl<B: Backend> Reclaim<B> {
    pub(crate) fn execute(
        self,
        backend: &B,
        buffer_slots: &BindlessAllocator,
        texture_slots: &BindlessAllocator,
    ) {
        match self {
            Reclaim::Buffer { native, views } => {
                for view in views {
                    backend.destroy_buffer_view(view);
                }
                backend.destroy_buffer(native);
            }
            Reclaim::Texture { native, views } => {
                for view in views {
                    backend.destroy_texture_view(view);
                }
                backend.destroy_texture(native);
            }
            Reclaim::Pipeline(pipeline) => backend.destroy_pipeline(pipeline),
            Reclaim::CommandPool(pool) => backend.destroy_command_pool(pool),
            Reclaim::BufferSlot(slot) => buffer_slots.free(slot),
            Reclaim::TextureSlot(slot) => texture_slots.free(slot),
        }
    }
}

///Cloneable producer side of the reclamation queue.
pub struct ReclaimSender<B: Backend> {
    tx: Sender<Reclaim<B>>,
}

impl<B: Backend> Clone for ReclaimSender<B> {
    fn clone(&self) -> Self {
        ReclaimSender {
            tx: self.tx.clone(),
        }
    }
}

impl<B: Backend> ReclaimSender<B> {
    ///Enqueues `item` for destruction once no frame in flight can reference it.
    pub fn recover(&self, item: Reclaim<B>) {
        if self.tx.send(item).is_err() {
            #[cfg(feature = "logging")]
            log::error!("Reclamation queue is closed, leaking native object");
        }
    }
}

pub struct ReclaimQueue<B: Backend> {
    tx: Sender<Reclaim<B>>,
    rx: Receiver<Reclaim<B>>,
    pending: [Vec<Reclaim<B>>; FRAMES_IN_FLIGHT],
}

impl<B: Backend> Default for ReclaimQueue<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> ReclaimQueue<B> {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        ReclaimQueue {
            tx,
            rx,
            pending: std::array::from_fn(|_| Vec::new()),
        }
    }

    pub fn sender(&self) -> ReclaimSender<B> {
        ReclaimSender {
            tx: self.tx.clone(),
        }
    }

    ///Executes everything pending for `slot`. Returns the number of executed items.
    ///
    /// Must only be called once `slot`'s fence confirmed that its last submission finished.
    pub fn release_slot(
        &mut self,
        slot: usize,
        backend: &B,
        buffer_slots: &BindlessAllocator,
        texture_slots: &BindlessAllocator,
    ) -> usize {
        let pending = &mut self.pending[slot % FRAMES_IN_FLIGHT];
        let executed = pending.len();
        for item in pending.drain(..) {
            item.execute(backend, buffer_slots, texture_slots);
        }

        #[cfg(feature = "logging")]
        if executed > 0 {
            log::trace!("Reclaimed {} objects for slot {}", executed, slot);
        }

        executed
    }

    ///Moves everything enqueued so far into `slot`'s pending list. Must only be called once a submission on `slot`
    /// succeeded, so that the list is guarded by that submission's fence. Returns the number of staged items.
    pub fn stage_slot(&mut self, slot: usize) -> usize {
        let pending = &mut self.pending[slot % FRAMES_IN_FLIGHT];
        let before = pending.len();
        pending.extend(self.rx.try_iter());
        let staged = pending.len() - before;

        #[cfg(feature = "logging")]
        if staged > 0 {
            log::trace!("Staged {} objects for slot {}", staged, slot);
        }

        staged
    }

    ///Executes every pending and queued item. Only valid once the device is idle.
    pub fn flush_all(
        &mut self,
        backend: &B,
        buffer_slots: &BindlessAllocator,
        texture_slots: &BindlessAllocator,
    ) {
        for pending in self.pending.iter_mut() {
            for item in pending.drain(..) {
                item.execute(backend, buffer_slots, texture_slots);
            }
        }
        for item in self.rx.try_iter() {
            item.execute(backend, buffer_slots, texture_slots);
        }
    }

    ///Number of items staged for `slot`.
    pub fn pending(&self, slot: usize) -> usize {
        self.pending[slot % FRAMES_IN_FLIGHT].len()
    }

    ///Number of items not yet staged to any slot.
    pub fn queued(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{headless::HeadlessBackend, resources::BufferDesc};
    use static_assertions::assert_impl_all;

    #[test]
    fn sender_is_send_sync() {
        assert_impl_all!(ReclaimSender<HeadlessBackend>: Send, Sync, Clone);
    }

    #[test]
    fn destruction_waits_for_the_slot_to_come_around() {
        let backend = HeadlessBackend::new();
        let buffers = BindlessAllocator::new(4);
        let textures = BindlessAllocator::new(4);
        let mut queue = ReclaimQueue::<HeadlessBackend>::new();

        let native = backend.create_buffer(&BufferDesc::storage(4)).unwrap();
        let id = native.id;
        let slot = buffers.allocate().unwrap();
        let sender = queue.sender();
        sender.recover(Reclaim::Buffer {
            native,
            views: Vec::new(),
        });
        sender.recover(Reclaim::BufferSlot(slot));
        assert_eq!(queue.queued(), 2);

        //slot 0 submitted: staged, not executed
        assert_eq!(queue.release_slot(0, &backend, &buffers, &textures), 0);
        assert_eq!(queue.stage_slot(0), 2);
        assert_eq!(queue.pending(0), 2);
        assert!(!backend.was_destroyed(id));

        //other slots don't touch it
        for slot in 1..3 {
            queue.release_slot(slot, &backend, &buffers, &textures);
            queue.stage_slot(slot);
        }
        assert!(!backend.was_destroyed(id));
        assert_eq!(buffers.free_count(), 0);

        //slot 0 is reused
        assert_eq!(queue.release_slot(0, &backend, &buffers, &textures), 2);
        assert!(backend.was_destroyed(id));
        assert_eq!(buffers.allocate(), Some(slot));
    }

    #[test]
    fn flush_executes_everything() {
        let backend = HeadlessBackend::new();
        let buffers = BindlessAllocator::new(4);
        let textures = BindlessAllocator::new(4);
        let mut queue = ReclaimQueue::<HeadlessBackend>::new();
        let staged = backend.create_buffer(&BufferDesc::storage(4)).unwrap();
        let queued = backend.create_buffer(&BufferDesc::storage(4)).unwrap();
        let (staged_id, queued_id) = (staged.id, queued.id);

        queue.sender().recover(Reclaim::Buffer {
            native: staged,
            views: Vec::new(),
        });
        queue.stage_slot(1);
        queue.sender().recover(Reclaim::Buffer {
            native: queued,
            views: Vec::new(),
        });

        queue.flush_all(&backend, &buffers, &textures);
        assert!(backend.was_destroyed(staged_id));
        assert!(backend.was_destroyed(queued_id));
        assert_eq!(queue.pending(1), 0);
        assert_eq!(queue.queued(), 0);
    }

    #[test]
    fn unstaged_items_survive_release() {
        let backend = HeadlessBackend::new();
        let buffers = BindlessAllocator::new(4);
        let textures = BindlessAllocator::new(4);
        let mut queue = ReclaimQueue::<HeadlessBackend>::new();
        let native = backend.create_buffer(&BufferDesc::storage(4)).unwrap();
        let id = native.id;
        queue.sender().recover(Reclaim::Buffer {
            native,
            views: Vec::new(),
        });

        //nothing was submitted on slot 2, so nothing got staged there
        assert_eq!(queue.release_slot(2, &backend, &buffers, &textures), 0);
        assert_eq!(queue.release_slot(2, &backend, &buffers, &textures), 0);
        assert!(!backend.was_destroyed(id));
        assert_eq!(queue.queued(), 1);
    }
}
