use std::error::Error;

use thiserror::Error;

use crate::{
    graph::NodeHandle,
    handle::{Handle, ResourceKind},
    sync_state::{KernelKind, SyncState, UsageKind},
};

///Type erased error of a [Backend](crate::Backend) implementation.
#[derive(Error, Debug)]
#[error("Backend error: {0}")]
pub struct BackendError(#[from] pub Box<dyn Error + Send + Sync + 'static>);

impl BackendError {
    pub fn new(error: impl Error + Send + Sync + 'static) -> Self {
        BackendError(Box::new(error))
    }
}

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Handle {0:?} is invalid or was destroyed")]
    InvalidHandle(Handle),
    #[error("Handle {handle:?} is not of kind {expected:?}")]
    WrongKind {
        handle: Handle,
        expected: ResourceKind,
    },
    #[error("All {max} bindless slots of kind {kind:?} are in use")]
    BindlessExhausted { kind: ResourceKind, max: u32 },
    #[error("Buffer {0:?} can not be written, no staging path available")]
    NotWritable(Handle),
    #[error("Parameter block exceeds push constant size: {size} > {max}")]
    ParameterBlockTooBig { size: u32, max: u32 },
    #[error("Invalid kernel {name}: {reason}")]
    InvalidKernel { name: String, reason: &'static str },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    #[error("Usage {usage:?} is not supported by kernel {kernel:?} on a {resource:?}")]
    UnsupportedUsage {
        resource: ResourceKind,
        kernel: KernelKind,
        usage: UsageKind,
    },
}

impl SyncError {
    pub(crate) fn unsupported(resource: ResourceKind, state: SyncState) -> Self {
        SyncError::UnsupportedUsage {
            resource,
            kernel: state.kernel,
            usage: state.usage,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("Can not begin a pass while another pass is open")]
    PassNesting,
    #[error("Command requires an open {0} pass")]
    NotInPass(&'static str),
    #[error("Command requires that no pass is open")]
    InPass,
    #[error("Kernel of kind {kernel:?} can not be used in a {pass:?} pass")]
    KernelMismatch { kernel: KernelKind, pass: KernelKind },
    #[error("No kernel bound")]
    NoKernelBound,
    #[error("Parameter block was built for another kernel than the bound one")]
    ForeignParameters,
    #[error("Kernel has no parameter named {0}")]
    UnknownParameter(String),
    #[error("Parameter {name} has size {expected}, but {got} bytes were supplied")]
    ParameterSize {
        name: String,
        expected: u32,
        got: u32,
    },
    #[error("Handle {0:?} is invalid or was destroyed")]
    InvalidHandle(Handle),
    #[error("Handle {handle:?} is not of kind {expected:?}")]
    WrongKind {
        handle: Handle,
        expected: ResourceKind,
    },
    #[error("Resource {handle:?} was not created to be used as {usage:?}")]
    RoleForbidden { handle: Handle, usage: UsageKind },
    #[error("Push constants of {size} bytes exceed the maximum of {max}")]
    PushConstantsTooBig { size: u32, max: u32 },
    #[error("Render pass needs at least one attachment")]
    NoAttachments,
    #[error("Attachments of a render pass must share one extent")]
    ExtentMismatch,
    #[error(transparent)]
    Sync(#[from] SyncError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Waiting on {via} from {node} would introduce a cycle")]
    Cycle { node: String, via: String },
    #[error("A node named {0} already exists")]
    DuplicateName(String),
    #[error("Node {0:?} does not exist")]
    NoSuchNode(NodeHandle),
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Present source {0:?} is not a texture usable as transfer source")]
    InvalidPresentSource(Handle),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Error, Debug)]
pub enum KilnError {
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
    #[error("Record error: {0}")]
    Record(#[from] RecordError),
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}
