//! 客户机进程上下文
//!
//! 每个客户机进程一个，显式传给每个处理函数，不使用全局状态。

use anyhow::Context;
use guest_cpu::{Arch, GuestCpu, Perm, Register};
use tracing::info;

use crate::const_values::{MAX_GUEST_STRING_LEN, Personality, ShimConfig};
use crate::error::ShimError;
use crate::fs::PathTranslator;
use crate::memory::MemoryView;
use crate::resource::ResourceRegistry;
use crate::shared_region::SharedRegionProvider;

/// 栈顶保留的红区
const STACK_TOP_RESERVE: u64 = 0x100;

pub struct ShimContext {
    cpu: Box<dyn GuestCpu>,
    personality: Personality,
    max_string_len: usize,
    pub paths: PathTranslator,
    pub resources: ResourceRegistry,
    pub shared_region: SharedRegionProvider,
    /// GetLastError / errno
    last_error: u32,
}

impl ShimContext {
    pub fn new(cpu: Box<dyn GuestCpu>, personality: Personality, paths: PathTranslator) -> Self {
        Self {
            cpu,
            personality,
            max_string_len: MAX_GUEST_STRING_LEN,
            paths,
            resources: ResourceRegistry::new(),
            shared_region: SharedRegionProvider::new(),
            last_error: 0,
        }
    }

    /// 按配置建立上下文并映射栈
    pub fn from_config(config: &ShimConfig, cpu: Box<dyn GuestCpu>) -> anyhow::Result<Self> {
        let arch = config.process.arch()?;
        anyhow::ensure!(
            cpu.arch() == arch,
            "后端 {} 的架构 {} 与配置 {} 不符",
            cpu.name(),
            cpu.arch().name(),
            arch.name()
        );

        let mut ctx = Self::new(cpu, config.process.personality, PathTranslator::new(&config.process.rootfs));
        ctx.max_string_len = config.memory.max_string_len;
        ctx.map_stack(config.memory.stack_base, config.memory.stack_size)
            .context("无法映射客户机栈")?;
        info!(
            arch = arch.name(),
            personality = ?ctx.personality,
            rootfs = %config.process.rootfs.display(),
            "客户机进程上下文已建立"
        );
        Ok(ctx)
    }

    pub fn with_max_string_len(mut self, limit: usize) -> Self {
        self.max_string_len = limit;
        self
    }

    /// 映射栈区域，栈指针指向栈顶下方
    pub fn map_stack(&mut self, base: u64, size: u64) -> Result<u64, ShimError> {
        let arch = self.arch();
        let top = base
            .checked_add(size)
            .and_then(|end| end.checked_sub(STACK_TOP_RESERVE))
            .ok_or_else(|| ShimError::InvalidArgument(format!("栈区域 {:#x}+{:#x} 无效", base, size)))?;
        self.cpu.mem_map(base, size, Perm::RW, "stack")?;
        self.cpu.reg_write(Register::stack_pointer(arch), top)?;
        Ok(top)
    }

    /// 当前进程的内存访问器
    pub fn memory(&mut self) -> MemoryView<'_> {
        MemoryView::new(self.cpu.as_mut()).with_max_string_len(self.max_string_len)
    }

    #[inline(always)]
    pub fn arch(&self) -> Arch {
        self.cpu.arch()
    }

    #[inline(always)]
    pub fn personality(&self) -> Personality {
        self.personality
    }

    pub fn cpu(&self) -> &dyn GuestCpu {
        self.cpu.as_ref()
    }

    pub fn cpu_mut(&mut self) -> &mut dyn GuestCpu {
        self.cpu.as_mut()
    }

    pub fn last_error(&self) -> u32 {
        self.last_error
    }

    pub fn set_last_error(&mut self, code: u32) {
        self.last_error = code;
    }

    /// 建立 commpage，重复调用无效果
    pub fn establish_shared_region(&mut self) -> Result<(), ShimError> {
        let mut view = MemoryView::new(self.cpu.as_mut()).with_max_string_len(self.max_string_len);
        self.shared_region.establish(&mut view)
    }

    /// 进入共享缓存区域，返回端口 id
    pub fn enter_shared_region(&mut self) -> Result<u64, ShimError> {
        let mut view = MemoryView::new(self.cpu.as_mut()).with_max_string_len(self.max_string_len);
        self.shared_region.enter_shared_region(&mut view, &mut self.resources)
    }
}
