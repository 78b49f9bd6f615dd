///Engine wide limits and timeouts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    ///Number of slots in the bindless texture array.
    pub max_bindless_textures: u32,
    ///Number of slots in the bindless buffer array.
    pub max_bindless_buffers: u32,
    ///Timeout in nanoseconds when waiting for a frame slot's fence.
    pub fence_timeout: u64,
    ///Maximum size of a kernel's parameter block in bytes. Vulkan guarantees 128.
    pub push_constant_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_bindless_textures: 1024,
            max_bindless_buffers: 1024,
            fence_timeout: u64::MAX,
            push_constant_size: 128,
        }
    }
}

impl EngineConfig {
    pub fn with_bindless_limits(mut self, textures: u32, buffers: u32) -> Self {
        self.max_bindless_textures = textures;
        self.max_bindless_buffers = buffers;
        self
    }

    pub fn with_fence_timeout(mut self, timeout: u64) -> Self {
        self.fence_timeout = timeout;
        self
    }
}
