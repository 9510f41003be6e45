//! 客户机 CPU 后端 trait 定义
//!
//! 指令模拟器（unicorn 之类）只需实现 [`GuestCpu`]，
//! 系统调用垫片层就能通过它访问寄存器和线性地址空间。

use bitflags::bitflags;
use thiserror::Error;

/// 后端错误类型
#[derive(Debug, Error)]
pub enum CpuError {
    #[error("未映射的内存访问: 地址 {addr:#x}, 大小 {size}")]
    Unmapped { addr: u64, size: usize },
    #[error("内存区域重叠: 地址 {addr:#x}")]
    Overlap { addr: u64 },
    #[error("当前架构 {arch:?} 不支持寄存器 {reg:?}")]
    InvalidRegister { arch: Arch, reg: Register },
    #[error("后端内部错误: {0}")]
    Internal(String),
}

/// 目标架构
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86,
    X8664,
    Arm64,
}

impl Arch {
    /// 指针宽度（字节）
    #[inline(always)]
    pub fn pointer_width(self) -> usize {
        match self {
            Arch::X86 => 4,
            Arch::X8664 | Arch::Arm64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Arch::X86 => "x86",
            Arch::X8664 => "x8664",
            Arch::Arm64 => "arm64",
        }
    }
}

/// 寄存器
///
/// x86 与 x86-64 共用同一组名字，32 位下按低 32 位访问。
/// arm64 的通用寄存器用 `X(n)` 表示，`X(30)` 即链接寄存器。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    Rip,
    X(u8),
    Sp,
    Pc,
}

impl Register {
    /// arm64 链接寄存器
    pub const LR: Register = Register::X(30);

    /// 栈指针
    pub fn stack_pointer(arch: Arch) -> Register {
        match arch {
            Arch::X86 | Arch::X8664 => Register::Rsp,
            Arch::Arm64 => Register::Sp,
        }
    }

    /// 程序计数器
    pub fn program_counter(arch: Arch) -> Register {
        match arch {
            Arch::X86 | Arch::X8664 => Register::Rip,
            Arch::Arm64 => Register::Pc,
        }
    }

    /// 寄存器是否属于该架构
    pub fn valid_for(self, arch: Arch) -> bool {
        match self {
            Register::R8 | Register::R9 => arch == Arch::X8664,
            Register::X(n) => arch == Arch::Arm64 && n <= 30,
            Register::Sp | Register::Pc => arch == Arch::Arm64,
            _ => arch != Arch::Arm64,
        }
    }
}

bitflags! {
    /// 内存区域权限
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Perm: u32 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXEC = 0b100;
        const RW = Self::READ.bits() | Self::WRITE.bits();
        const ALL = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

/// 客户机 CPU trait
///
/// 宿主侧的读写不受区域权限约束（权限只约束客户机指令），
/// 但必须落在已映射区域内。
pub trait GuestCpu {
    /// 目标架构
    fn arch(&self) -> Arch;

    /// 读取寄存器
    fn reg_read(&self, reg: Register) -> Result<u64, CpuError>;

    /// 写入寄存器
    fn reg_write(&mut self, reg: Register, value: u64) -> Result<(), CpuError>;

    /// 读取线性地址空间
    ///
    /// # 参数
    /// - addr: 客户机虚拟地址
    /// - size: 读取的字节数
    fn mem_read(&self, addr: u64, size: usize) -> Result<Vec<u8>, CpuError>;

    /// 写入线性地址空间
    fn mem_write(&mut self, addr: u64, data: &[u8]) -> Result<(), CpuError>;

    /// 建立新的映射，已存在的映射不会被移动或改变大小
    fn mem_map(&mut self, base: u64, size: u64, perms: Perm, name: &str) -> Result<(), CpuError>;

    /// `[addr, addr + size)` 是否完整落在已映射区域内
    fn is_mapped(&self, addr: u64, size: usize) -> bool;

    /// 后端名称（用于调试）
    fn name(&self) -> &str {
        "unknown"
    }
}
