//! Per resource synchronisation state and the barrier classification between two states.
//!
//! Every resource carries exactly one [SyncState], the kind of kernel that used it last and how it was used.
//! Whenever a resource is about to be used differently, [transition] yields the [Barrier] that has to be executed
//! in between. The mapping from state to stage, access and layout is a fixed table, see [scope].

use ash::vk;

use crate::{error::SyncError, handle::ResourceKind};

///Kind of work a resource is used by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KernelKind {
    Graphics,
    Compute,
    Transfer,
}

///Logical usage of a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UsageKind {
    ///Initial state of each resource. Contents are not preserved when leaving this state.
    Undefined,
    Sampled,
    ReadTexture,
    WriteTexture,
    ReadBuffer,
    WriteBuffer,
    UniformBuffer,
    RenderTarget,
    DepthTarget,
    DepthRead,
    VertexBuffer,
    IndexBuffer,
    IndirectBuffer,
    TransferSrc,
    TransferDst,
}

impl UsageKind {
    pub fn is_buffer_only(&self) -> bool {
        matches!(
            self,
            UsageKind::ReadBuffer
                | UsageKind::WriteBuffer
                | UsageKind::UniformBuffer
                | UsageKind::VertexBuffer
                | UsageKind::IndexBuffer
                | UsageKind::IndirectBuffer
        )
    }

    pub fn is_texture_only(&self) -> bool {
        matches!(
            self,
            UsageKind::Sampled
                | UsageKind::ReadTexture
                | UsageKind::WriteTexture
                | UsageKind::RenderTarget
                | UsageKind::DepthTarget
                | UsageKind::DepthRead
        )
    }

    ///True if this usage can be applied to a resource of `kind`.
    pub fn applies_to(&self, kind: ResourceKind) -> bool {
        match kind {
            ResourceKind::Buffer => !self.is_texture_only(),
            ResourceKind::Texture => !self.is_buffer_only(),
            ResourceKind::Kernel => false,
        }
    }

    ///True if the usage might write to the resource.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            UsageKind::WriteTexture
                | UsageKind::WriteBuffer
                | UsageKind::RenderTarget
                | UsageKind::DepthTarget
                | UsageKind::TransferDst
        )
    }
}

///`(kernel, usage)` pair a resource is currently in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SyncState {
    pub kernel: KernelKind,
    pub usage: UsageKind,
}

impl SyncState {
    ///State of a freshly created resource.
    pub const UNDEFINED: SyncState = SyncState {
        kernel: KernelKind::Graphics,
        usage: UsageKind::Undefined,
    };

    pub const fn new(kernel: KernelKind, usage: UsageKind) -> Self {
        SyncState { kernel, usage }
    }

    pub fn is_undefined(&self) -> bool {
        self.usage == UsageKind::Undefined
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

///Pipeline stage, memory access and (for textures) image layout of a [SyncState].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessScope {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    ///Ignored for buffers.
    pub layout: vk::ImageLayout,
}

impl AccessScope {
    const fn new(
        stage: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
        layout: vk::ImageLayout,
    ) -> Self {
        AccessScope {
            stage,
            access,
            layout,
        }
    }
}

///Barrier description between two uses of a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Barrier {
    pub src: AccessScope,
    pub dst: AccessScope,
}

impl Barrier {
    pub fn old_layout(&self) -> vk::ImageLayout {
        self.src.layout
    }

    pub fn new_layout(&self) -> vk::ImageLayout {
        self.dst.layout
    }

    pub fn is_layout_transition(&self) -> bool {
        self.src.layout != self.dst.layout
    }
}

fn shader_stages(kernel: KernelKind) -> Option<vk::PipelineStageFlags2> {
    match kernel {
        KernelKind::Graphics => {
            Some(vk::PipelineStageFlags2::VERTEX_SHADER | vk::PipelineStageFlags2::FRAGMENT_SHADER)
        }
        KernelKind::Compute => Some(vk::PipelineStageFlags2::COMPUTE_SHADER),
        KernelKind::Transfer => None,
    }
}

///Maps `state` of a resource of kind `resource` to its access scope. Returns an error for combinations that
/// can not occur, for instance a buffer used as render target, or a compute kernel reading a vertex buffer.
pub fn scope(resource: ResourceKind, state: SyncState) -> Result<AccessScope, SyncError> {
    let err = || SyncError::unsupported(resource, state);
    if !state.usage.applies_to(resource) {
        return Err(err());
    }

    let graphics_only = || {
        if state.kernel == KernelKind::Graphics {
            Ok(())
        } else {
            Err(err())
        }
    };

    let scope = match state.usage {
        UsageKind::Undefined => AccessScope::new(
            vk::PipelineStageFlags2::NONE,
            vk::AccessFlags2::NONE,
            vk::ImageLayout::UNDEFINED,
        ),
        UsageKind::Sampled | UsageKind::ReadTexture => AccessScope::new(
            shader_stages(state.kernel).ok_or_else(err)?,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ),
        UsageKind::WriteTexture => AccessScope::new(
            shader_stages(state.kernel).ok_or_else(err)?,
            vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
            vk::ImageLayout::GENERAL,
        ),
        UsageKind::ReadBuffer => AccessScope::new(
            shader_stages(state.kernel).ok_or_else(err)?,
            vk::AccessFlags2::SHADER_STORAGE_READ,
            vk::ImageLayout::UNDEFINED,
        ),
        UsageKind::WriteBuffer => AccessScope::new(
            shader_stages(state.kernel).ok_or_else(err)?,
            vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
            vk::ImageLayout::UNDEFINED,
        ),
        UsageKind::UniformBuffer => AccessScope::new(
            shader_stages(state.kernel).ok_or_else(err)?,
            vk::AccessFlags2::UNIFORM_READ,
            vk::ImageLayout::UNDEFINED,
        ),
        UsageKind::RenderTarget => {
            graphics_only()?;
            AccessScope::new(
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            )
        }
        UsageKind::DepthTarget => {
            graphics_only()?;
            AccessScope::new(
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            )
        }
        UsageKind::DepthRead => {
            graphics_only()?;
            AccessScope::new(
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS
                    | vk::PipelineStageFlags2::FRAGMENT_SHADER,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags2::SHADER_SAMPLED_READ,
                vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            )
        }
        UsageKind::VertexBuffer => {
            graphics_only()?;
            AccessScope::new(
                vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
                vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
                vk::ImageLayout::UNDEFINED,
            )
        }
        UsageKind::IndexBuffer => {
            graphics_only()?;
            AccessScope::new(
                vk::PipelineStageFlags2::INDEX_INPUT,
                vk::AccessFlags2::INDEX_READ,
                vk::ImageLayout::UNDEFINED,
            )
        }
        UsageKind::IndirectBuffer => {
            if state.kernel == KernelKind::Transfer {
                return Err(err());
            }
            AccessScope::new(
                vk::PipelineStageFlags2::DRAW_INDIRECT,
                vk::AccessFlags2::INDIRECT_COMMAND_READ,
                vk::ImageLayout::UNDEFINED,
            )
        }
        UsageKind::TransferSrc | UsageKind::TransferDst => {
            if state.kernel != KernelKind::Transfer {
                return Err(err());
            }
            let (access, layout) = if state.usage == UsageKind::TransferSrc {
                (
                    vk::AccessFlags2::TRANSFER_READ,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                )
            } else {
                (
                    vk::AccessFlags2::TRANSFER_WRITE,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                )
            };
            AccessScope::new(
                vk::PipelineStageFlags2::COPY | vk::PipelineStageFlags2::BLIT,
                access,
                layout,
            )
        }
    };

    let scope = if resource == ResourceKind::Buffer {
        AccessScope {
            layout: vk::ImageLayout::UNDEFINED,
            ..scope
        }
    } else {
        scope
    };

    Ok(scope)
}

///Computes the barrier needed to move a resource of kind `resource` from `old` to `new`. Returns `Ok(None)` if
/// both states are identical.
pub fn transition(
    resource: ResourceKind,
    old: SyncState,
    new: SyncState,
) -> Result<Option<Barrier>, SyncError> {
    //Transitioning into undefined would discard the content, which is never what a user asks for.
    if new.is_undefined() {
        return Err(SyncError::unsupported(resource, new));
    }
    let dst = scope(resource, new)?;
    if old == new {
        return Ok(None);
    }
    let src = scope(resource, old)?;

    #[cfg(feature = "logging")]
    log::trace!(
        "{:?}: {:?}/{:?} -> {:?}/{:?}",
        resource,
        old.kernel,
        old.usage,
        new.kernel,
        new.usage
    );

    Ok(Some(Barrier { src, dst }))
}
