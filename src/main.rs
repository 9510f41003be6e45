use anyhow::Result;
use clap::Parser;
use osshim::{Args, build_shim_run_blocking};
use tracing::{Level, info};
use tracing_subscriber::{self, EnvFilter, fmt::format::FmtSpan};

fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .with_target(false) // 不显示目标模块
        .with_file(true) // 显示文件名
        .with_line_number(true) // 显示行号
        .with_span_events(FmtSpan::CLOSE) // 分发结束时记录 span
        .init();

    // 解析命令行参数
    let args = Args::parse();

    info!(version = env!("CARGO_PKG_VERSION"), config = %args.config, "启动人格垫片");

    build_shim_run_blocking(args)
}
