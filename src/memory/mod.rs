//! 客户机内存访问模块
//!
//! 所有读写都先确认地址范围完整落在已映射区域内，
//! 越界访问以 [`MemoryError::InvalidMemoryAccess`] 报告给调用方，不做截断。

mod records;
mod schema;

use guest_cpu::{Arch, CpuError, GuestCpu, Perm, Register};
use thiserror::Error;

use crate::const_values::MAX_GUEST_STRING_LEN;

pub use records::{PATH_INFO_PATH_OFFSET, ProcRegionPathInfo, SharedFileMapping};
pub use schema::{FieldSpec, FieldWidth, MAPPING_DESCRIPTOR, StructSchema, StructValues};

/// 内存错误类型
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("非法内存访问: 地址 {addr:#x}, 大小 {size}")]
    InvalidMemoryAccess { addr: u64, size: usize },
    #[error("字符串未终止: 地址 {addr:#x}, 上限 {limit} 字节")]
    UnterminatedString { addr: u64, limit: usize },
    #[error("记录 {schema} 缺少字段 {field}")]
    MissingField { schema: &'static str, field: &'static str },
    #[error("字段 {field} 的值 {value:#x} 超出 {width} 字节宽度")]
    FieldOverflow { field: &'static str, value: u64, width: usize },
    #[error("不支持的字段宽度: {0}")]
    UnsupportedWidth(usize),
    #[error("后端错误: {0}")]
    Cpu(CpuError),
}

impl From<CpuError> for MemoryError {
    fn from(err: CpuError) -> Self {
        match err {
            CpuError::Unmapped { addr, size } => MemoryError::InvalidMemoryAccess { addr, size },
            other => MemoryError::Cpu(other),
        }
    }
}

/// 字符串读取时每次取的块大小
const STRING_CHUNK: usize = 64;

/// 客户机线性地址空间的结构化访问器
pub struct MemoryView<'a> {
    cpu: &'a mut dyn GuestCpu,
    max_string_len: usize,
}

impl<'a> MemoryView<'a> {
    pub fn new(cpu: &'a mut dyn GuestCpu) -> Self {
        Self {
            cpu,
            max_string_len: MAX_GUEST_STRING_LEN,
        }
    }

    /// 设置字符串读取上限（字节，不含终止符）
    pub fn with_max_string_len(mut self, limit: usize) -> Self {
        self.max_string_len = limit;
        self
    }

    /// 目标架构
    #[inline(always)]
    pub fn arch(&self) -> Arch {
        self.cpu.arch()
    }

    /// 读取寄存器（由模拟器提供）
    #[inline(always)]
    pub fn reg_read(&self, reg: Register) -> Result<u64, MemoryError> {
        Ok(self.cpu.reg_read(reg)?)
    }

    /// 写入寄存器（由模拟器提供）
    #[inline(always)]
    pub fn reg_write(&mut self, reg: Register, value: u64) -> Result<(), MemoryError> {
        Ok(self.cpu.reg_write(reg, value)?)
    }

    /// 映射新区域，与已有区域重叠时失败
    pub fn map(&mut self, base: u64, size: u64, perms: Perm, name: &str) -> Result<(), MemoryError> {
        Ok(self.cpu.mem_map(base, size, perms, name)?)
    }

    pub fn is_mapped(&self, addr: u64, size: usize) -> bool {
        self.cpu.is_mapped(addr, size)
    }

    #[inline(always)]
    fn check(&self, addr: u64, size: usize) -> Result<(), MemoryError> {
        if size == 0 || self.cpu.is_mapped(addr, size) {
            Ok(())
        } else {
            Err(MemoryError::InvalidMemoryAccess { addr, size })
        }
    }

    /// 读取内存
    pub fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>, MemoryError> {
        if size == 0 {
            return Ok(Vec::new());
        }
        self.check(addr, size)?;
        Ok(self.cpu.mem_read(addr, size)?)
    }

    /// 写入内存
    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        if data.is_empty() {
            return Ok(());
        }
        self.check(addr, data.len())?;
        Ok(self.cpu.mem_write(addr, data)?)
    }

    /// 读取 `base + offset` 处宽度为 `width` 的单个字段
    pub fn read_field(&self, base: u64, offset: usize, width: usize) -> Result<u64, MemoryError> {
        let width = FieldWidth::from_bytes(width)?;
        let addr = field_addr(base, offset, width.bytes())?;
        let bytes = self.read(addr, width.bytes())?;
        Ok(width.decode(&bytes))
    }

    /// 在 `base + offset` 处写入原始字节
    pub fn write_field(&mut self, base: u64, offset: usize, bytes: &[u8]) -> Result<(), MemoryError> {
        let addr = field_addr(base, offset, bytes.len())?;
        self.write(addr, bytes)
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, MemoryError> {
        Ok(self.read_field(addr, 0, 4)? as u32)
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, MemoryError> {
        self.read_field(addr, 0, 8)
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    /// 按当前架构的指针宽度读取
    pub fn read_pointer(&self, addr: u64) -> Result<u64, MemoryError> {
        self.read_field(addr, 0, self.cpu.arch().pointer_width())
    }

    /// 按当前架构的指针宽度写入
    pub fn write_pointer(&mut self, addr: u64, value: u64) -> Result<(), MemoryError> {
        let width = self.cpu.arch().pointer_width();
        self.write(addr, &value.to_le_bytes()[..width])
    }

    /// 按布局解码定长记录
    pub fn read_struct(&self, addr: u64, schema: &StructSchema) -> Result<StructValues, MemoryError> {
        let raw = self.read(addr, schema.size)?;
        let mut values = StructValues::new();
        for field in schema.fields {
            let end = field.offset + field.width.bytes();
            values.set(field.name, field.width.decode(&raw[field.offset..end]));
        }
        Ok(values)
    }

    /// 按布局编码定长记录，先校验全部字段再写入
    pub fn write_struct(
        &mut self,
        addr: u64,
        schema: &StructSchema,
        values: &StructValues,
    ) -> Result<(), MemoryError> {
        self.check(addr, schema.size)?;
        let mut encoded = Vec::with_capacity(schema.fields.len());
        for field in schema.fields {
            let value = values.get(field.name).ok_or(MemoryError::MissingField {
                schema: schema.name,
                field: field.name,
            })?;
            if value > field.width.max_value() {
                return Err(MemoryError::FieldOverflow {
                    field: field.name,
                    value,
                    width: field.width.bytes(),
                });
            }
            encoded.push((field.offset, field.width.encode(value)));
        }
        for (offset, bytes) in encoded {
            self.write_field(addr, offset, &bytes)?;
        }
        Ok(())
    }

    /// 读取以 0 字节结尾的窄字符串
    pub fn read_cstring(&self, addr: u64) -> Result<String, MemoryError> {
        let bytes = self.read_terminated(addr, 1)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// 读取以 16 位 0 结尾的宽字符串（UTF-16LE）
    pub fn read_wstring(&self, addr: u64) -> Result<String, MemoryError> {
        let bytes = self.read_terminated(addr, 2)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Ok(String::from_utf16_lossy(&units))
    }

    /// 写入窄字符串并补 0 字节
    pub fn write_cstring(&mut self, addr: u64, value: &str) -> Result<(), MemoryError> {
        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        self.write(addr, &bytes)
    }

    /// 按 `unit` 字节为单位读取直到遇到全 0 单元，返回不含终止符的内容
    fn read_terminated(&self, addr: u64, unit: usize) -> Result<Vec<u8>, MemoryError> {
        let limit = self.max_string_len;
        let mut out = Vec::new();
        let mut cursor = addr;
        loop {
            // 块可能跨过映射末尾，此时退化为逐单元读取
            let remaining = limit.saturating_sub(out.len());
            let mut chunk = (STRING_CHUNK / unit).min(remaining / unit + 1) * unit;
            if !self.cpu.is_mapped(cursor, chunk) {
                chunk = unit;
            }
            let bytes = self.read(cursor, chunk)?;
            for piece in bytes.chunks_exact(unit) {
                if piece.iter().all(|b| *b == 0) {
                    return Ok(out);
                }
                if out.len() + unit > limit {
                    return Err(MemoryError::UnterminatedString { addr, limit });
                }
                out.extend_from_slice(piece);
            }
            cursor = cursor
                .checked_add(chunk as u64)
                .ok_or(MemoryError::InvalidMemoryAccess { addr: cursor, size: chunk })?;
        }
    }
}

#[inline(always)]
fn field_addr(base: u64, offset: usize, size: usize) -> Result<u64, MemoryError> {
    base.checked_add(offset as u64)
        .ok_or(MemoryError::InvalidMemoryAccess { addr: base, size: offset + size })
}
