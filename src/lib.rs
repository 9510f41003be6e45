//! 客户机操作系统人格垫片库
pub mod backend;
pub mod const_values;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod fs;
pub mod handlers;
pub mod memory;
pub mod resource;
pub mod shared_region;
pub mod utils;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use tracing::info;

use backend::RefCpu;
use const_values::{Personality, ShimConfig};
use context::ShimContext;
use dispatch::{CallDispatchRegistry, DiagnosticKind, DispatchOutcome};

/// 命令行驱动调用结束后返回的地址
const HOST_RETURN_ADDRESS: u64 = 0x0000_dead_0000;

/// 客户机操作系统人格垫片
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// 配置文件地址
    #[arg(short, long, default_value = "profile/config.toml")]
    pub config: String,

    /// 覆盖配置中的沙箱根目录
    #[arg(short, long)]
    pub rootfs: Option<PathBuf>,

    /// 要调用的例程，可重复
    #[arg(long = "call")]
    pub calls: Vec<String>,

    /// 传给每个例程的整数参数（支持 0x 前缀），可重复
    #[arg(long = "arg", value_parser = parse_u64)]
    pub args: Vec<u64>,
}

fn parse_u64(text: &str) -> Result<u64, String> {
    let text = text.replace('_', "");
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|err| format!("无效的整数 {}: {}", text, err))
}

fn resolve_config_path(config: &str) -> PathBuf {
    let prj_base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let path = PathBuf::from(config);
    if path.is_absolute() { path } else { prj_base.join(path) }
}

fn print_outcome(outcome: &DispatchOutcome, last_error: u32) {
    let status = if outcome.implemented { "ok".green() } else { "unimplemented".yellow() };
    println!(
        "{} {} -> {} (cleanup {}, resume {:#x}, last error {})",
        status.bold(),
        outcome.routine.cyan(),
        format!("{:#x}", outcome.return_value).bold(),
        outcome.stack_cleanup,
        outcome.resume_at,
        last_error
    );
}

pub fn build_shim_run_blocking(args: Args) -> Result<()> {
    let config_path = resolve_config_path(&args.config);
    let mut config = ShimConfig::new(&config_path)?;
    if let Some(rootfs) = args.rootfs {
        config.process.rootfs = rootfs;
    }
    let arch = config.process.arch()?;
    let personality = config.process.personality;

    let mut ctx = ShimContext::from_config(&config, Box::new(RefCpu::new(arch)))?;
    if personality == Personality::Macos {
        ctx.establish_shared_region().context("无法建立 commpage")?;
    }

    let convention = handlers::native_convention(personality, arch)?;
    let mut registry = CallDispatchRegistry::new(convention, config.debug.diagnostic_list_size);
    handlers::register_builtin(&mut registry, personality, arch)?;
    info!(routines = ?registry.routines(), "可用例程");

    for routine in &args.calls {
        convention
            .stage_call(&mut ctx.memory(), HOST_RETURN_ADDRESS, &args.args)
            .with_context(|| format!("无法为 {} 布置调用", routine))?;
        let outcome = registry
            .dispatch(routine, &mut ctx)
            .with_context(|| format!("{} 执行失败", routine))?;
        print_outcome(&outcome, ctx.last_error());
    }

    for diagnostic in registry.diagnostics() {
        let kind = match diagnostic.kind {
            DiagnosticKind::UnimplementedRoutine => "unimplemented".yellow(),
            DiagnosticKind::DuplicateRegistration => "duplicate".yellow(),
            DiagnosticKind::GuestError => "guest error".red(),
        };
        println!("{}: {} {}", kind, diagnostic.routine, diagnostic.detail.dimmed());
    }
    Ok(())
}
