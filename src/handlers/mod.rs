//! 内置处理函数表
//!
//! 每种人格一张表，按目标架构选定调用约定后注册进分发表。

mod macos;
mod windows;

use guest_cpu::Arch;
use tracing::info;

use crate::const_values::Personality;
use crate::dispatch::{CallDispatchRegistry, CallingConvention, HandlerDescriptor};
use crate::error::ShimError;

/// 人格和架构对应的原生调用约定
pub fn native_convention(personality: Personality, arch: Arch) -> Result<CallingConvention, ShimError> {
    match (personality, arch) {
        (Personality::Windows, Arch::X86) => Ok(CallingConvention::Stdcall),
        (Personality::Windows, Arch::X8664) => Ok(CallingConvention::Ms64),
        (Personality::Macos, Arch::X8664) => Ok(CallingConvention::SysV64),
        (Personality::Macos, Arch::Arm64) => Ok(CallingConvention::Aapcs64),
        (personality, arch) => Err(ShimError::InvalidArgument(format!(
            "{:?} 不支持架构 {}",
            personality,
            arch.name()
        ))),
    }
}

/// 某人格的全部内置处理函数描述
pub fn builtin_descriptors(personality: Personality, convention: CallingConvention) -> Vec<HandlerDescriptor> {
    match personality {
        Personality::Windows => windows::descriptors(convention),
        Personality::Macos => macos::descriptors(convention),
    }
}

/// 注册内置处理函数，返回注册数量
pub fn register_builtin(
    registry: &mut CallDispatchRegistry,
    personality: Personality,
    arch: Arch,
) -> Result<usize, ShimError> {
    let convention = native_convention(personality, arch)?;
    let descriptors = builtin_descriptors(personality, convention);
    let count = descriptors.len();
    for descriptor in descriptors {
        registry.register(descriptor);
    }
    info!(?personality, ?convention, count, "内置处理函数已注册");
    Ok(count)
}
