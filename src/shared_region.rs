//! commpage 与共享缓存区域
//!
//! 客户机运行时启动代码会读取固定地址上的只读常量页，
//! 这里负责按架构映射并填充它。每个进程最多建立一次。

use guest_cpu::{Arch, Perm};
use tracing::{debug, info};

use crate::error::ShimError;
use crate::memory::MemoryView;
use crate::resource::{Resource, ResourceKind, ResourceRegistry};

pub const COMMPAGE_BASE_X86_64: u64 = 0x7fff_ffe0_0000;
pub const COMMPAGE_BASE_ARM64: u64 = 0x0000_000f_ffff_c000;
pub const COMMPAGE_SIZE: u64 = 0x1000;

pub const SHARED_REGION_BASE_X86_64: u64 = 0x7fff_0000_0000;
pub const SHARED_REGION_SIZE_X86_64: u64 = 0xffe0_0000;

/// 启动代码读取的初始化标志位置（time lock slide），语义不明，只保留写入
pub const TIME_LOCK_SLIDE_OFFSET: u64 = 0x68;

// x86-64 commpage 字段偏移
#[allow(dead_code)]
const COMM_PAGE_CPU_CAPABILITIES64: u64 = 0x10;
const COMM_PAGE_VERSION: u64 = 0x1e;
const COMM_PAGE_CPU_CAPABILITIES: u64 = 0x20;
const COMM_PAGE_CPUFAMILY: u64 = 0x40;

/// (偏移, 内容)，按写入顺序排列
const X86_64_COMMPAGE_CONSTANTS: [(u64, &[u8]); 3] = [
    (COMM_PAGE_CPU_CAPABILITIES, &[0, 0, 0, 0]),
    (COMM_PAGE_VERSION, &[0x0d]),
    (COMM_PAGE_CPUFAMILY, &[0xec, 0x5e, 0x3b, 0x57]),
];

fn commpage_layout(arch: Arch) -> Result<(u64, u64), ShimError> {
    match arch {
        Arch::X8664 => Ok((COMMPAGE_BASE_X86_64, COMMPAGE_SIZE)),
        Arch::Arm64 => Ok((COMMPAGE_BASE_ARM64, COMMPAGE_SIZE)),
        Arch::X86 => Err(ShimError::InvalidArgument(format!("{} 没有 commpage", arch.name()))),
    }
}

/// 共享区域状态
#[derive(Debug, Default)]
pub struct SharedRegionProvider {
    commpage_loaded: bool,
    /// 已进入共享区域时保存分配到的端口 id
    shared_region_port: Option<u64>,
}

impl SharedRegionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commpage_loaded(&self) -> bool {
        self.commpage_loaded
    }

    pub fn shared_region_port(&self) -> Option<u64> {
        self.shared_region_port
    }

    /// 映射 commpage 并写入版本 / 能力常量和初始化标志，重复调用不做任何事
    pub fn establish(&mut self, view: &mut MemoryView<'_>) -> Result<(), ShimError> {
        if self.commpage_loaded {
            debug!("commpage 已建立，跳过");
            return Ok(());
        }
        let arch = view.arch();
        let (base, size) = commpage_layout(arch)?;
        view.map(base, size, Perm::READ, "commpage")?;

        if arch == Arch::X8664 {
            // CPU_CAPABILITIES64 保持为 0，不写入
            for (offset, bytes) in X86_64_COMMPAGE_CONSTANTS {
                view.write(base + offset, bytes)?;
            }
        }
        view.write_u32(base + TIME_LOCK_SLIDE_OFFSET, 1)?;

        self.commpage_loaded = true;
        info!(arch = arch.name(), base = %format!("{:#x}", base), "commpage 已建立");
        Ok(())
    }

    /// 映射 x86-64 共享缓存区域并分配端口，返回端口 id
    pub fn enter_shared_region(
        &mut self,
        view: &mut MemoryView<'_>,
        resources: &mut ResourceRegistry,
    ) -> Result<u64, ShimError> {
        if let Some(port) = self.shared_region_port {
            return Ok(port);
        }
        if view.arch() != Arch::X8664 {
            return Err(ShimError::InvalidArgument(format!(
                "{} 不支持共享缓存区域",
                view.arch().name()
            )));
        }
        view.map(
            SHARED_REGION_BASE_X86_64,
            SHARED_REGION_SIZE_X86_64,
            Perm::READ | Perm::EXEC,
            "shared_region",
        )?;
        let port = resources.create(
            ResourceKind::Port,
            Resource::Port { name: "shared_region".to_string() },
        );
        self.shared_region_port = Some(port);
        info!(port, "进入共享缓存区域");
        Ok(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RefCpu;

    #[test]
    fn test_x86_64_commpage() {
        let mut cpu = RefCpu::new(Arch::X8664);
        let mut view = MemoryView::new(&mut cpu);
        let mut provider = SharedRegionProvider::new();
        provider.establish(&mut view).unwrap();

        assert!(provider.commpage_loaded());
        assert_eq!(view.read(COMMPAGE_BASE_X86_64 + COMM_PAGE_VERSION, 1).unwrap(), vec![0x0d]);
        assert_eq!(view.read_u32(COMMPAGE_BASE_X86_64 + COMM_PAGE_CPUFAMILY).unwrap(), 0x573b_5eec);
        assert_eq!(view.read_u32(COMMPAGE_BASE_X86_64 + COMM_PAGE_CPU_CAPABILITIES64).unwrap(), 0);
        assert_eq!(view.read_u32(COMMPAGE_BASE_X86_64 + TIME_LOCK_SLIDE_OFFSET).unwrap(), 1);
    }

    #[test]
    fn test_establish_is_idempotent() {
        let mut cpu = RefCpu::new(Arch::X8664);
        let mut view = MemoryView::new(&mut cpu);
        let mut provider = SharedRegionProvider::new();
        provider.establish(&mut view).unwrap();
        view.write_u32(COMMPAGE_BASE_X86_64 + 0x100, 0xdead_beef).unwrap();
        let before = view.read(COMMPAGE_BASE_X86_64, COMMPAGE_SIZE as usize).unwrap();

        // 第二次调用既不重新映射也不覆盖内容
        provider.establish(&mut view).unwrap();
        assert_eq!(view.read(COMMPAGE_BASE_X86_64, COMMPAGE_SIZE as usize).unwrap(), before);
        drop(view);
        assert_eq!(cpu.memory().regions().len(), 1);
    }

    #[test]
    fn test_arm64_commpage() {
        let mut cpu = RefCpu::new(Arch::Arm64);
        let mut view = MemoryView::new(&mut cpu);
        let mut provider = SharedRegionProvider::new();
        provider.establish(&mut view).unwrap();

        assert_eq!(view.read_u32(COMMPAGE_BASE_ARM64 + TIME_LOCK_SLIDE_OFFSET).unwrap(), 1);
        // arm64 不写 x86-64 常量
        assert_eq!(view.read(COMMPAGE_BASE_ARM64 + COMM_PAGE_VERSION, 1).unwrap(), vec![0]);
    }

    #[test]
    fn test_x86_is_rejected() {
        let mut cpu = RefCpu::new(Arch::X86);
        let mut view = MemoryView::new(&mut cpu);
        let mut provider = SharedRegionProvider::new();
        assert!(matches!(provider.establish(&mut view), Err(ShimError::InvalidArgument(_))));
        assert!(!provider.commpage_loaded());
    }

    #[test]
    fn test_enter_shared_region_once() {
        let mut cpu = RefCpu::new(Arch::X8664);
        let mut view = MemoryView::new(&mut cpu);
        let mut resources = ResourceRegistry::new();
        let mut provider = SharedRegionProvider::new();

        let port = provider.enter_shared_region(&mut view, &mut resources).unwrap();
        assert!(matches!(resources.lookup(port), Ok(Resource::Port { .. })));
        assert!(view.is_mapped(SHARED_REGION_BASE_X86_64, 8));

        assert_eq!(provider.enter_shared_region(&mut view, &mut resources).unwrap(), port);
        assert_eq!(resources.len(), 1);
    }
}
