use anyhow::{self, Context, bail};
use guest_cpu::Arch;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// 客户机操作系统人格
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Personality {
    Windows,
    Macos,
}

/// 进程配置
#[derive(Deserialize, Debug, Clone)]
pub struct ProcessConfig {
    /// 目标架构名: x86 / x8664 / arm64
    pub arch: String,
    pub personality: Personality,
    /// 沙箱根目录
    pub rootfs: PathBuf,
}

impl ProcessConfig {
    pub fn arch(&self) -> anyhow::Result<Arch> {
        match self.arch.as_str() {
            "x86" => Ok(Arch::X86),
            "x8664" | "x86_64" => Ok(Arch::X8664),
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            other => bail!("未知的目标架构: {}", other),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct MemoryConfig {
    pub stack_base: u64,
    pub stack_size: u64,
    /// 客户机字符串读取上限（字节）
    #[serde(default = "default_max_string_len")]
    pub max_string_len: usize,
}

fn default_max_string_len() -> usize {
    MAX_GUEST_STRING_LEN
}

#[derive(Deserialize, Debug, Clone)]
pub struct DebugConfig {
    pub diagnostic_list_size: usize,
}

/// 垫片层配置（来自 profile/config.toml）
#[derive(Deserialize, Debug, Clone)]
pub struct ShimConfig {
    pub process: ProcessConfig,
    pub memory: MemoryConfig,
    pub debug: DebugConfig,
}

impl ShimConfig {
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<ShimConfig> {
        let toml_str = std::fs::read_to_string(&path)
            .with_context(|| format!("无法读取配置文件: {:?}", &path.as_ref().as_os_str()))?;
        let config: ShimConfig = toml::from_str(&toml_str)
            .with_context(|| format!("无法解析配置文件: {:?}", &path.as_ref().as_os_str()))?;
        anyhow::Ok(config)
    }
}

/// 默认的客户机字符串读取上限
pub const MAX_GUEST_STRING_LEN: usize = 0x1000;
