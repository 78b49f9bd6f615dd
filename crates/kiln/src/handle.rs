slotmap::new_key_type!(
    ///Generational key into one of the resource arenas. Use [Handle] on the user facing API.
    pub struct ResKey;
);

///The three kinds of objects the [ResourceStore](crate::ResourceStore) manages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Buffer,
    Texture,
    Kernel,
}

///Opaque, stable identity of a resource. Becomes invalid once the resource is destroyed. Since the
/// key is generational a stale handle never aliases a resource that reused its slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    pub(crate) kind: ResourceKind,
    pub(crate) key: ResKey,
}

impl Handle {
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn is_buffer(&self) -> bool {
        self.kind == ResourceKind::Buffer
    }

    pub fn is_texture(&self) -> bool {
        self.kind == ResourceKind::Texture
    }

    pub fn is_kernel(&self) -> bool {
        self.kind == ResourceKind::Kernel
    }
}
