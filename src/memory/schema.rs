//! 定长记录布局描述

use super::MemoryError;

/// 字段宽度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldWidth {
    U8,
    U16,
    U32,
    U64,
}

impl FieldWidth {
    #[inline(always)]
    pub fn bytes(self) -> usize {
        match self {
            FieldWidth::U8 => 1,
            FieldWidth::U16 => 2,
            FieldWidth::U32 => 4,
            FieldWidth::U64 => 8,
        }
    }

    pub fn from_bytes(bytes: usize) -> Result<Self, MemoryError> {
        match bytes {
            1 => Ok(FieldWidth::U8),
            2 => Ok(FieldWidth::U16),
            4 => Ok(FieldWidth::U32),
            8 => Ok(FieldWidth::U64),
            other => Err(MemoryError::UnsupportedWidth(other)),
        }
    }

    /// 该宽度能表示的最大值
    #[inline(always)]
    pub fn max_value(self) -> u64 {
        match self {
            FieldWidth::U64 => u64::MAX,
            _ => (1u64 << (self.bytes() * 8)) - 1,
        }
    }

    /// 按小端序编码，调用方保证 value 不超过 max_value
    pub fn encode(self, value: u64) -> Vec<u8> {
        value.to_le_bytes()[..self.bytes()].to_vec()
    }

    /// 按小端序解码，bytes 长度必须等于字段宽度
    pub fn decode(self, bytes: &[u8]) -> u64 {
        let mut buf = [0u8; 8];
        buf[..self.bytes()].copy_from_slice(&bytes[..self.bytes()]);
        u64::from_le_bytes(buf)
    }
}

/// 单个字段: 名字、相对记录起始的偏移、宽度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub offset: usize,
    pub width: FieldWidth,
}

impl FieldSpec {
    pub const fn new(name: &'static str, offset: usize, width: FieldWidth) -> Self {
        Self { name, offset, width }
    }
}

/// 记录布局，字段按声明顺序编解码
#[derive(Debug, Clone, Copy)]
pub struct StructSchema {
    pub name: &'static str,
    pub size: usize,
    pub fields: &'static [FieldSpec],
}

impl StructSchema {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }
}

/// 解码后的记录值，保持字段声明顺序
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructValues {
    entries: Vec<(&'static str, u64)>,
}

impl StructValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置字段值，已存在则覆盖
    pub fn set(&mut self, name: &'static str, value: u64) -> &mut Self {
        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
        self
    }

    pub fn with(mut self, name: &'static str, value: u64) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.entries
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| *value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        self.entries.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 共享文件映射描述记录（32 字节，无填充）
pub const MAPPING_DESCRIPTOR: StructSchema = StructSchema {
    name: "shared_file_mapping_np",
    size: 32,
    fields: &[
        FieldSpec::new("address", 0, FieldWidth::U64),
        FieldSpec::new("size", 8, FieldWidth::U64),
        FieldSpec::new("file_offset", 16, FieldWidth::U64),
        FieldSpec::new("max_prot", 24, FieldWidth::U32),
        FieldSpec::new("init_prot", 28, FieldWidth::U32),
    ],
};
