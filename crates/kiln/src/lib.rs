//! # Kiln
//!
//! Kiln is a small render graph on top of a native graphics API. It takes care of the parts of a renderer that are
//! easy to get wrong:
//!
//! - resources are addressed by typed [Handle]s and registered in bindless descriptor arrays,
//! - every usage declaration is turned into the barrier it needs, see [sync_state],
//! - [RenderNode](node::RenderNode)s are ordered by their declared wait lists in a [FrameGraph],
//! - native objects are only destroyed once no frame in flight can reference them anymore, see [reclaim].
//!
//! The driving entry point is [Engine::gen_frame]. The native side is abstracted by the [Backend] trait. `kiln-vk`
//! implements it for Vulkan 1.3, [headless::HeadlessBackend] implements it without any GPU and records everything
//! for inspection.

pub use ash;

pub mod backend;
pub mod bindless;
mod config;
mod engine;
pub mod error;
pub mod frame;
pub mod graph;
mod handle;
pub mod headless;
pub mod node;
pub mod reclaim;
pub mod resources;
pub mod store;
pub mod sync_state;

pub use backend::Backend;
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{
    BackendError, FrameError, GraphError, KilnError, RecordError, ResourceError, SyncError,
};
pub use graph::{FrameGraph, NodeHandle};
pub use handle::{Handle, ResKey, ResourceKind};
pub use node::NodeRecorder;
pub use store::ResourceStore;
pub use sync_state::{KernelKind, SyncState, UsageKind};

///Number of frames that can be in flight at the same time.
pub const FRAMES_IN_FLIGHT: usize = 3;
