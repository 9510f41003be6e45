//! 垫片层错误类型

use std::path::PathBuf;

use guest_cpu::CpuError;
use thiserror::Error;

use crate::const_values::Personality;
use crate::memory::MemoryError;

#[derive(Debug, Error)]
pub enum ShimError {
    #[error("未实现的例程: {0}")]
    UnimplementedRoutine(String),
    #[error("内存错误: {0}")]
    Memory(#[from] MemoryError),
    #[error("后端错误: {0}")]
    Cpu(#[from] CpuError),
    #[error("客户机路径逃逸出沙箱: {0:?}")]
    PathEscape(PathBuf),
    #[error("文件不存在: {0}")]
    NotFound(String),
    #[error("无效的资源句柄: {0}")]
    ResourceNotFound(u64),
    #[error("参数错误: {0}")]
    InvalidArgument(String),
}

impl ShimError {
    /// 违反宿主侧不变量的错误，整个客户机进程应当终止
    pub fn is_fatal(&self) -> bool {
        match self {
            ShimError::PathEscape(_) => true,
            ShimError::Cpu(_) => true,
            ShimError::Memory(MemoryError::InvalidMemoryAccess { .. }) => true,
            ShimError::Memory(MemoryError::Cpu(_)) => true,
            _ => false,
        }
    }

    /// 转换为客户机可见的错误码（GetLastError / errno），致命错误返回 None
    pub fn guest_code(&self, personality: Personality) -> Option<u32> {
        if self.is_fatal() {
            return None;
        }
        let code = match (self, personality) {
            (ShimError::NotFound(_), Personality::Windows) => ERROR_FILE_NOT_FOUND,
            (ShimError::NotFound(_), Personality::Macos) => ENOENT,
            (ShimError::ResourceNotFound(_), Personality::Windows) => ERROR_INVALID_HANDLE,
            (ShimError::ResourceNotFound(_), Personality::Macos) => EBADF,
            (ShimError::UnimplementedRoutine(_), Personality::Windows) => ERROR_CALL_NOT_IMPLEMENTED,
            (ShimError::UnimplementedRoutine(_), Personality::Macos) => ENOSYS,
            (_, Personality::Windows) => ERROR_INVALID_PARAMETER,
            (_, Personality::Macos) => EINVAL,
        };
        Some(code)
    }
}

pub const ERROR_FILE_NOT_FOUND: u32 = 2;
pub const ERROR_INVALID_HANDLE: u32 = 6;
pub const ERROR_INVALID_PARAMETER: u32 = 87;
pub const ERROR_CALL_NOT_IMPLEMENTED: u32 = 120;

pub const ENOENT: u32 = 2;
pub const EBADF: u32 = 9;
pub const EINVAL: u32 = 22;
pub const ENOSYS: u32 = 78;
