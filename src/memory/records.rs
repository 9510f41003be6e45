//! 宿主定义的常用记录

use tracing::debug;

use super::{MAPPING_DESCRIPTOR, MemoryError, MemoryView, StructValues};

/// `shared_file_mapping_np` 记录
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SharedFileMapping {
    pub address: u64,
    pub size: u64,
    pub file_offset: u64,
    pub max_prot: u32,
    pub init_prot: u32,
}

impl SharedFileMapping {
    pub const SIZE: usize = MAPPING_DESCRIPTOR.size;

    pub fn read_from(view: &MemoryView<'_>, addr: u64) -> Result<Self, MemoryError> {
        let values = view.read_struct(addr, &MAPPING_DESCRIPTOR)?;
        let field = |name: &'static str| {
            values.get(name).ok_or(MemoryError::MissingField {
                schema: MAPPING_DESCRIPTOR.name,
                field: name,
            })
        };
        let mapping = Self {
            address: field("address")?,
            size: field("size")?,
            file_offset: field("file_offset")?,
            max_prot: field("max_prot")? as u32,
            init_prot: field("init_prot")? as u32,
        };
        debug!(
            "共享文件映射: addr: {:#x}, size: {:#x}, file_offset: {:#x}, max_prot: {}, init_prot: {}",
            mapping.address, mapping.size, mapping.file_offset, mapping.max_prot, mapping.init_prot
        );
        Ok(mapping)
    }

    pub fn write_to(&self, view: &mut MemoryView<'_>, addr: u64) -> Result<(), MemoryError> {
        let values = StructValues::new()
            .with("address", self.address)
            .with("size", self.size)
            .with("file_offset", self.file_offset)
            .with("max_prot", self.max_prot as u64)
            .with("init_prot", self.init_prot as u64);
        view.write_struct(addr, &MAPPING_DESCRIPTOR, &values)
    }
}

/// `proc_regionwithpathinfo` 中路径字段的偏移
pub const PATH_INFO_PATH_OFFSET: usize = 248;

/// 区域路径信息记录，只填写其中的路径字段
#[derive(Debug, Clone, Default)]
pub struct ProcRegionPathInfo {
    path: String,
}

impl ProcRegionPathInfo {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// 在记录起始地址 `addr` 的固定偏移处写入以 0 结尾的路径
    pub fn write_to(&self, view: &mut MemoryView<'_>, addr: u64) -> Result<(), MemoryError> {
        let mut bytes = Vec::with_capacity(self.path.len() + 1);
        bytes.extend_from_slice(self.path.as_bytes());
        bytes.push(0);
        view.write_field(addr, PATH_INFO_PATH_OFFSET, &bytes)
    }
}
