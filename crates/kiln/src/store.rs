use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use slotmap::SlotMap;

use crate::{
    backend::Backend,
    handle::{Handle, ResKey, ResourceKind},
    resources::{Buffer, Kernel, Texture},
    sync_state::SyncState,
};

///One arena per resource kind.
pub struct Arenas<B: Backend> {
    buffers: SlotMap<ResKey, Buffer<B>>,
    textures: SlotMap<ResKey, Texture<B>>,
    kernels: SlotMap<ResKey, Kernel<B>>,
}

///Types that live in one of the [Arenas].
pub trait Storable<B: Backend>: Sized {
    const KIND: ResourceKind;
    fn arena(arenas: &Arenas<B>) -> &SlotMap<ResKey, Self>;
    fn arena_mut(arenas: &mut Arenas<B>) -> &mut SlotMap<ResKey, Self>;
}

impl<B: Backend> Storable<B> for Buffer<B> {
    const KIND: ResourceKind = ResourceKind::Buffer;
    fn arena(arenas: &Arenas<B>) -> &SlotMap<ResKey, Self> {
        &arenas.buffers
    }
    fn arena_mut(arenas: &mut Arenas<B>) -> &mut SlotMap<ResKey, Self> {
        &mut arenas.buffers
    }
}

impl<B: Backend> Storable<B> for Texture<B> {
    const KIND: ResourceKind = ResourceKind::Texture;
    fn arena(arenas: &Arenas<B>) -> &SlotMap<ResKey, Self> {
        &arenas.textures
    }
    fn arena_mut(arenas: &mut Arenas<B>) -> &mut SlotMap<ResKey, Self> {
        &mut arenas.textures
    }
}

impl<B: Backend> Storable<B> for Kernel<B> {
    const KIND: ResourceKind = ResourceKind::Kernel;
    fn arena(arenas: &Arenas<B>) -> &SlotMap<ResKey, Self> {
        &arenas.kernels
    }
    fn arena_mut(arenas: &mut Arenas<B>) -> &mut SlotMap<ResKey, Self> {
        &mut arenas.kernels
    }
}

///A resource removed from the store.
pub enum AnyResource<B: Backend> {
    Buffer(Buffer<B>),
    Texture(Texture<B>),
    Kernel(Kernel<B>),
}

impl<B: Backend> Arenas<B> {
    fn new() -> Self {
        Arenas {
            buffers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            kernels: SlotMap::with_key(),
        }
    }

    ///Typed fetch. Returns `None` if `handle` is invalid, or does not reference a `T`.
    pub fn get<T: Storable<B>>(&self, handle: Handle) -> Option<&T> {
        if handle.kind != T::KIND {
            return None;
        }
        T::arena(self).get(handle.key)
    }

    pub fn get_mut<T: Storable<B>>(&mut self, handle: Handle) -> Option<&mut T> {
        if handle.kind != T::KIND {
            return None;
        }
        T::arena_mut(self).get_mut(handle.key)
    }

    pub fn buffer(&self, handle: Handle) -> Option<&Buffer<B>> {
        self.get(handle)
    }

    pub fn texture(&self, handle: Handle) -> Option<&Texture<B>> {
        self.get(handle)
    }

    pub fn kernel(&self, handle: Handle) -> Option<&Kernel<B>> {
        self.get(handle)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        match handle.kind {
            ResourceKind::Buffer => self.buffers.contains_key(handle.key),
            ResourceKind::Texture => self.textures.contains_key(handle.key),
            ResourceKind::Kernel => self.kernels.contains_key(handle.key),
        }
    }

    pub fn insert<T: Storable<B>>(&mut self, value: T) -> Handle {
        let key = T::arena_mut(self).insert(value);
        Handle { kind: T::KIND, key }
    }

    pub fn remove(&mut self, handle: Handle) -> Option<AnyResource<B>> {
        match handle.kind {
            ResourceKind::Buffer => self.buffers.remove(handle.key).map(AnyResource::Buffer),
            ResourceKind::Texture => self.textures.remove(handle.key).map(AnyResource::Texture),
            ResourceKind::Kernel => self.kernels.remove(handle.key).map(AnyResource::Kernel),
        }
    }

    ///Global synchronisation state of a buffer or texture.
    pub fn sync_state(&self, handle: Handle) -> Option<SyncState> {
        match handle.kind {
            ResourceKind::Buffer => self.buffers.get(handle.key).map(|b| b.sync),
            ResourceKind::Texture => self.textures.get(handle.key).map(|t| t.sync),
            ResourceKind::Kernel => None,
        }
    }

    pub(crate) fn set_sync_state(&mut self, handle: Handle, state: SyncState) {
        match handle.kind {
            ResourceKind::Buffer => {
                if let Some(b) = self.buffers.get_mut(handle.key) {
                    b.sync = state;
                }
            }
            ResourceKind::Texture => {
                if let Some(t) = self.textures.get_mut(handle.key) {
                    t.sync = state;
                }
            }
            ResourceKind::Kernel => {}
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len() + self.textures.len() + self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    ///Removes every resource.
    pub(crate) fn drain(&mut self) -> Vec<AnyResource<B>> {
        let mut all = Vec::with_capacity(self.len());
        all.extend(self.buffers.drain().map(|(_, b)| AnyResource::Buffer(b)));
        all.extend(self.textures.drain().map(|(_, t)| AnyResource::Texture(t)));
        all.extend(self.kernels.drain().map(|(_, k)| AnyResource::Kernel(k)));
        all
    }
}

///Handle to resource table. Reads can happen concurrently, creation and destruction exclude all reads.
pub struct ResourceStore<B: Backend> {
    arenas: RwLock<Arenas<B>>,
}

impl<B: Backend> Default for ResourceStore<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> ResourceStore<B> {
    pub fn new() -> Self {
        ResourceStore {
            arenas: RwLock::new(Arenas::new()),
        }
    }

    ///Read access to all resources. A lock poisoned by a panicking writer is taken over, the arenas are never left
    /// half-updated by a single operation.
    pub fn read(&self) -> RwLockReadGuard<'_, Arenas<B>> {
        self.arenas.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Arenas<B>> {
        self.arenas.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn valid(&self, handle: Handle) -> bool {
        self.read().contains(handle)
    }

    pub fn insert<T: Storable<B>>(&self, value: T) -> Handle {
        self.write().insert(value)
    }

    ///Removes `handle` from the store. The handle is invalid immediately, the native objects are handed back to the
    /// caller.
    pub fn remove(&self, handle: Handle) -> Option<AnyResource<B>> {
        self.write().remove(handle)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        headless::HeadlessBackend,
        resources::{BufferDesc, ParamTable},
        sync_state::KernelKind,
    };
    use static_assertions::assert_impl_all;

    fn buffer(backend: &HeadlessBackend) -> Buffer<HeadlessBackend> {
        let desc = BufferDesc::storage(64);
        Buffer {
            native: backend.create_buffer(&desc).unwrap(),
            desc,
            views: Vec::new(),
            sync: SyncState::UNDEFINED,
            bindless: None,
            address: None,
            staging: None,
            last_use: None,
        }
    }

    fn kernel(backend: &HeadlessBackend) -> Kernel<HeadlessBackend> {
        let desc = crate::resources::KernelDesc::compute("k", vec![0], ParamTable::new());
        Kernel {
            name: "k".to_owned(),
            kind: KernelKind::Compute,
            pipeline: backend.create_pipeline(&desc).unwrap(),
            params: Arc::new(ParamTable::new()),
        }
    }

    #[test]
    fn store_is_send_sync() {
        assert_impl_all!(ResourceStore<HeadlessBackend>: Send, Sync);
    }

    #[test]
    fn wrong_kind_fetch_is_none() {
        let backend = HeadlessBackend::new();
        let store = ResourceStore::<HeadlessBackend>::new();
        let hdl = store.insert(buffer(&backend));
        assert!(store.valid(hdl));
        assert!(store.read().get::<Buffer<HeadlessBackend>>(hdl).is_some());
        assert!(store.read().get::<Texture<HeadlessBackend>>(hdl).is_none());
        assert!(store.read().get::<Kernel<HeadlessBackend>>(hdl).is_none());

        let khdl = store.insert(kernel(&backend));
        assert!(store.read().kernel(khdl).is_some());
        assert!(store.read().buffer(khdl).is_none());
        assert_eq!(store.read().sync_state(khdl), None);
    }

    #[test]
    fn removed_handle_is_invalid_and_not_aliased() {
        let backend = HeadlessBackend::new();
        let store = ResourceStore::<HeadlessBackend>::new();
        let first = store.insert(buffer(&backend));
        assert!(matches!(store.remove(first), Some(AnyResource::Buffer(_))));
        assert!(!store.valid(first));
        assert!(store.remove(first).is_none());

        //reuses the slot, but with a new generation.
        let second = store.insert(buffer(&backend));
        assert!(store.valid(second));
        assert!(!store.valid(first));
        assert!(store.read().buffer(first).is_none());
    }

    #[test]
    fn sync_state_roundtrip() {
        let backend = HeadlessBackend::new();
        let store = ResourceStore::<HeadlessBackend>::new();
        let hdl = store.insert(buffer(&backend));
        let state = SyncState::new(KernelKind::Compute, crate::sync_state::UsageKind::ReadBuffer);
        store.write().set_sync_state(hdl, state);
        assert_eq!(store.read().sync_state(hdl), Some(state));
    }
}
