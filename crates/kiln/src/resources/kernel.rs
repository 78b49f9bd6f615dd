use std::sync::Arc;

use ash::vk;

use crate::{
    backend::Backend,
    error::RecordError,
    handle::{Handle, ResourceKind},
    sync_state::{KernelKind, UsageKind},
};

///One SPIR-V entry point of a kernel.
#[derive(Clone, Debug)]
pub struct ShaderStage {
    pub stage: vk::ShaderStageFlags,
    pub code: Vec<u32>,
    pub entry: String,
}

impl ShaderStage {
    pub fn new(stage: vk::ShaderStageFlags, code: Vec<u32>, entry: impl Into<String>) -> Self {
        ShaderStage {
            stage,
            code,
            entry: entry.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: vk::Format,
    pub offset: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VertexBinding {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

///Fixed function state of a graphics kernel. Kernels render through dynamic rendering, so only the attachment
/// formats need to be known upfront. Viewport and scissor are always dynamic.
#[derive(Clone, Debug, PartialEq)]
pub struct GraphicsState {
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
    pub topology: vk::PrimitiveTopology,
    pub vertex_bindings: Vec<VertexBinding>,
    pub cull_mode: vk::CullModeFlags,
    pub depth_test: bool,
    pub alpha_blend: bool,
}

impl Default for GraphicsState {
    fn default() -> Self {
        GraphicsState {
            color_formats: Vec::new(),
            depth_format: None,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            vertex_bindings: Vec::new(),
            cull_mode: vk::CullModeFlags::NONE,
            depth_test: false,
            alpha_blend: false,
        }
    }
}

///Single entry of a kernel's parameter block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParamEntry {
    pub name: String,
    ///Byte offset within the parameter block.
    pub offset: u32,
    pub size: u32,
    ///Some if the entry references a resource. 4 byte entries receive the bindless index, 8 byte entries of buffers
    /// the device address.
    pub usage: Option<UsageKind>,
}

///Layout of the constant parameter block of a kernel. Usually generated through reflection from the shader source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParamTable {
    entries: Vec<ParamEntry>,
    size: u32,
}

impl ParamTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<ParamEntry>) -> Self {
        let size = entries.iter().map(|e| e.offset + e.size).max().unwrap_or(0);
        ParamTable { entries, size }
    }

    fn push(mut self, name: &str, size: u32, align: u32, usage: Option<UsageKind>) -> Self {
        let offset = self.size.next_multiple_of(align);
        self.entries.push(ParamEntry {
            name: name.to_owned(),
            offset,
            size,
            usage,
        });
        self.size = offset + size;
        self
    }

    ///Appends a plain value of `size` bytes.
    pub fn value(self, name: &str, size: u32) -> Self {
        let align = size.clamp(1, 16).next_power_of_two().min(16);
        self.push(name, size, align, None)
    }

    ///Appends a resource that is referenced through its bindless index.
    pub fn resource(self, name: &str, usage: UsageKind) -> Self {
        self.push(name, 4, 4, Some(usage))
    }

    ///Appends a buffer that is referenced through its device address.
    pub fn address(self, name: &str, usage: UsageKind) -> Self {
        self.push(name, 8, 8, Some(usage))
    }

    pub fn entries(&self) -> &[ParamEntry] {
        &self.entries
    }

    pub fn entry(&self, name: &str) -> Option<(usize, &ParamEntry)> {
        self.entries.iter().enumerate().find(|(_, e)| e.name == name)
    }

    ///Size of the whole block in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }
}

///Everything needed to build a [Kernel].
#[derive(Clone, Debug)]
pub struct KernelDesc {
    pub name: String,
    pub kind: KernelKind,
    pub stages: Vec<ShaderStage>,
    ///Must be Some for graphics kernels.
    pub graphics: Option<GraphicsState>,
    pub params: ParamTable,
}

impl KernelDesc {
    pub fn compute(name: impl Into<String>, code: Vec<u32>, params: ParamTable) -> Self {
        KernelDesc {
            name: name.into(),
            kind: KernelKind::Compute,
            stages: vec![ShaderStage::new(vk::ShaderStageFlags::COMPUTE, code, "main")],
            graphics: None,
            params,
        }
    }

    pub fn graphics(
        name: impl Into<String>,
        vertex: Vec<u32>,
        fragment: Vec<u32>,
        state: GraphicsState,
        params: ParamTable,
    ) -> Self {
        KernelDesc {
            name: name.into(),
            kind: KernelKind::Graphics,
            stages: vec![
                ShaderStage::new(vk::ShaderStageFlags::VERTEX, vertex, "main"),
                ShaderStage::new(vk::ShaderStageFlags::FRAGMENT, fragment, "main"),
            ],
            graphics: Some(state),
            params,
        }
    }

    ///Checks the structural requirements a backend relies on.
    pub fn validate(&self) -> Result<(), &'static str> {
        match self.kind {
            KernelKind::Transfer => Err("transfer work has no kernel"),
            KernelKind::Compute => {
                if self.stages.len() != 1 || self.stages[0].stage != vk::ShaderStageFlags::COMPUTE {
                    Err("compute kernels need exactly one compute stage")
                } else {
                    Ok(())
                }
            }
            KernelKind::Graphics => {
                if self.graphics.is_none() {
                    Err("graphics kernels need a graphics state")
                } else if !self
                    .stages
                    .iter()
                    .any(|s| s.stage == vk::ShaderStageFlags::VERTEX)
                {
                    Err("graphics kernels need a vertex stage")
                } else {
                    Ok(())
                }
            }
        }
    }
}

///Immutable compiled kernel.
pub struct Kernel<B: Backend> {
    pub(crate) name: String,
    pub(crate) kind: KernelKind,
    pub(crate) pipeline: B::Pipeline,
    pub(crate) params: Arc<ParamTable>,
}

impl<B: Backend> Kernel<B> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> KernelKind {
        self.kind
    }

    pub fn pipeline(&self) -> &B::Pipeline {
        &self.pipeline
    }

    pub fn params(&self) -> &ParamTable {
        &self.params
    }
}

///Per instance parameter data of a kernel. Resources are bound by handle, their bindless index or device address
/// is patched in when the block is replayed, so resizing a buffer does not invalidate a block.
#[derive(Clone, Debug)]
pub struct ParamBlock {
    pub(crate) kernel: Handle,
    pub(crate) table: Arc<ParamTable>,
    pub(crate) data: Vec<u8>,
    ///`(entry index, resource)` pairs.
    pub(crate) bindings: Vec<(usize, Handle)>,
}

impl ParamBlock {
    pub(crate) fn new(kernel: Handle, table: Arc<ParamTable>) -> Self {
        ParamBlock {
            kernel,
            data: vec![0; table.size() as usize],
            table,
            bindings: Vec::new(),
        }
    }

    pub fn kernel(&self) -> Handle {
        self.kernel
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    ///Writes `value` to the parameter `name`.
    pub fn set_value<T: bytemuck::Pod>(
        &mut self,
        name: &str,
        value: &T,
    ) -> Result<&mut Self, RecordError> {
        let (_, entry) = self
            .table
            .entry(name)
            .ok_or_else(|| RecordError::UnknownParameter(name.to_owned()))?;
        let bytes = bytemuck::bytes_of(value);
        if bytes.len() != entry.size as usize || entry.usage.is_some() {
            return Err(RecordError::ParameterSize {
                name: name.to_owned(),
                expected: entry.size,
                got: bytes.len() as u32,
            });
        }
        let start = entry.offset as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(self)
    }

    ///Binds `resource` to the resource parameter `name`.
    pub fn set_resource(&mut self, name: &str, resource: Handle) -> Result<&mut Self, RecordError> {
        let (index, entry) = self
            .table
            .entry(name)
            .ok_or_else(|| RecordError::UnknownParameter(name.to_owned()))?;
        let usage = entry
            .usage
            .ok_or_else(|| RecordError::UnknownParameter(name.to_owned()))?;
        if resource.kind() == ResourceKind::Kernel || !usage.applies_to(resource.kind()) {
            return Err(RecordError::RoleForbidden {
                handle: resource,
                usage,
            });
        }
        if entry.size == 8 && resource.kind() != ResourceKind::Buffer {
            return Err(RecordError::WrongKind {
                handle: resource,
                expected: ResourceKind::Buffer,
            });
        }
        match self.bindings.iter_mut().find(|(i, _)| *i == index) {
            Some(binding) => binding.1 = resource,
            None => self.bindings.push((index, resource)),
        }
        Ok(self)
    }

    ///Resources bound to the block together with the usage declared by the kernel.
    pub fn resources(&self) -> impl Iterator<Item = (Handle, UsageKind, &ParamEntry)> + '_ {
        self.bindings.iter().filter_map(|(index, handle)| {
            let entry = &self.table.entries()[*index];
            entry.usage.map(|usage| (*handle, usage, entry))
        })
    }

    ///Writes `value` into the slot of `entry`. Used when resolving resources.
    pub(crate) fn patch(data: &mut [u8], entry: &ParamEntry, value: u64) {
        let start = entry.offset as usize;
        if entry.size == 8 {
            data[start..start + 8].copy_from_slice(&value.to_le_bytes());
        } else {
            data[start..start + 4].copy_from_slice(&(value as u32).to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ParamTable {
        ParamTable::new()
            .resource("src", UsageKind::ReadTexture)
            .value("scale", 4)
            .address("dst", UsageKind::WriteBuffer)
            .value("tint", 16)
    }

    #[test]
    fn table_offsets_are_aligned() {
        let table = table();
        let offsets: Vec<_> = table.entries().iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![0, 4, 8, 16]);
        assert_eq!(table.size(), 32);
    }

    #[test]
    fn from_entries_computes_size() {
        let table = ParamTable::from_entries(vec![ParamEntry {
            name: "a".to_owned(),
            offset: 12,
            size: 4,
            usage: None,
        }]);
        assert_eq!(table.size(), 16);
    }

    #[test]
    fn values_land_at_their_offset() {
        let mut block = ParamBlock::new(dummy_handle(), Arc::new(table()));
        block.set_value("scale", &2.0f32).unwrap();
        assert_eq!(&block.data()[4..8], &2.0f32.to_le_bytes());
        assert!(matches!(
            block.set_value("scale", &1u64),
            Err(RecordError::ParameterSize { .. })
        ));
        assert!(matches!(
            block.set_value("nope", &1u32),
            Err(RecordError::UnknownParameter(_))
        ));
    }

    fn dummy_handle() -> Handle {
        Handle {
            kind: ResourceKind::Kernel,
            key: Default::default(),
        }
    }
}
