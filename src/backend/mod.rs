//! 参考 CPU 后端
//!
//! 不执行指令，只保存寄存器和分区内存，供命令行驱动和测试使用。
//! 真实的指令模拟器通过实现 [`GuestCpu`] 接入。

mod memory;

use std::fmt;

use guest_cpu::{Arch, CpuError, GuestCpu, Perm, Register};
use rustc_hash::FxHashMap;

pub use memory::{MappedRegion, RegionMemory};

/// 参考后端
#[derive(Debug)]
pub struct RefCpu {
    arch: Arch,
    // 寄存器
    registers: FxHashMap<Register, u64>,
    // 内存
    memory: RegionMemory,
}

impl RefCpu {
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            registers: FxHashMap::default(),
            memory: RegionMemory::new(),
        }
    }

    pub fn memory(&self) -> &RegionMemory {
        &self.memory
    }

    #[inline(always)]
    fn check_reg(&self, reg: Register) -> Result<(), CpuError> {
        if reg.valid_for(self.arch) {
            Ok(())
        } else {
            Err(CpuError::InvalidRegister { arch: self.arch, reg })
        }
    }
}

impl GuestCpu for RefCpu {
    fn arch(&self) -> Arch {
        self.arch
    }

    fn reg_read(&self, reg: Register) -> Result<u64, CpuError> {
        self.check_reg(reg)?;
        Ok(self.registers.get(&reg).copied().unwrap_or(0))
    }

    fn reg_write(&mut self, reg: Register, value: u64) -> Result<(), CpuError> {
        self.check_reg(reg)?;
        let value = if self.arch == Arch::X86 { value as u32 as u64 } else { value };
        self.registers.insert(reg, value);
        Ok(())
    }

    fn mem_read(&self, addr: u64, size: usize) -> Result<Vec<u8>, CpuError> {
        self.memory.read(addr, size)
    }

    fn mem_write(&mut self, addr: u64, data: &[u8]) -> Result<(), CpuError> {
        self.memory.write(addr, data)
    }

    fn mem_map(&mut self, base: u64, size: u64, perms: Perm, name: &str) -> Result<(), CpuError> {
        self.memory.map(base, size, perms, name)
    }

    fn is_mapped(&self, addr: u64, size: usize) -> bool {
        self.memory.is_mapped(addr, size)
    }

    fn name(&self) -> &str {
        "ref-cpu"
    }
}

impl fmt::Display for RefCpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "arch: {}", self.arch.name())?;
        let mut regs: Vec<_> = self.registers.iter().collect();
        regs.sort_by_key(|(reg, _)| format!("{:?}", reg));
        for (reg, value) in regs {
            writeln!(f, "{:>6?}: {:#018x}", reg, value)?;
        }
        for region in self.memory.regions() {
            writeln!(f, "{:?}", region)?;
        }
        Ok(())
    }
}
