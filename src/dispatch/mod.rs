//! 调用分发模块
//!
//! 例程名到处理函数描述的显式注册表。模拟器停在被拦截的调用点时调用
//! [`CallDispatchRegistry::dispatch`]，由调用约定适配器完成参数解码、
//! 返回值写回和栈修复。

mod convention;

use std::fmt;

use rustc_hash::FxHashMap;
use tracing::{debug, debug_span, trace, warn};

use crate::context::ShimContext;
use crate::error::ShimError;
use crate::utils::ringbuf::RingBuffer;

pub use convention::{ArgLocation, CallingConvention};

/// 参数解码方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Int,
    Pointer,
    /// 以 0 字节结尾的窄字符串
    CString,
    /// 以 16 位 0 结尾的宽字符串
    WString,
    /// 不透明指针（句柄）
    Handle,
}

/// 参数声明
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
}

/// 解码后的参数值
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Int(u64),
    Pointer(u64),
    Handle(u64),
    /// 字符串参数: 原始指针和解引用结果，空指针时为 None
    Str { ptr: u64, value: Option<String> },
}

impl ParamValue {
    /// 寄存器或栈槽中的原始值
    pub fn raw(&self) -> u64 {
        match self {
            ParamValue::Int(v) | ParamValue::Pointer(v) | ParamValue::Handle(v) => *v,
            ParamValue::Str { ptr, .. } => *ptr,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str { value, .. } => value.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{:#x}", v),
            ParamValue::Pointer(v) | ParamValue::Handle(v) => write!(f, "{:#x}", v),
            ParamValue::Str { value: Some(s), .. } => write!(f, "{:?}", s),
            ParamValue::Str { ptr, value: None } => write!(f, "{:#x}", ptr),
        }
    }
}

/// 单次调用的上下文快照
#[derive(Debug, Clone)]
pub struct CallContext {
    pub routine: String,
    pub convention: CallingConvention,
    /// 进入时的栈指针
    pub stack_pointer: u64,
    pub return_address: u64,
    /// 按声明顺序排列的参数
    pub params: Vec<(&'static str, ParamValue)>,
}

impl CallContext {
    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }

    /// 按名字取原始整数值
    pub fn raw(&self, name: &str) -> Result<u64, ShimError> {
        self.param(name)
            .map(ParamValue::raw)
            .ok_or_else(|| ShimError::InvalidArgument(format!("{} 没有参数 {}", self.routine, name)))
    }

    /// 按名字取字符串参数，空指针返回 None
    pub fn string(&self, name: &str) -> Result<Option<&str>, ShimError> {
        match self.param(name) {
            Some(ParamValue::Str { value, .. }) => Ok(value.as_deref()),
            Some(_) => Err(ShimError::InvalidArgument(format!("参数 {} 不是字符串", name))),
            None => Err(ShimError::InvalidArgument(format!("{} 没有参数 {}", self.routine, name))),
        }
    }
}

/// 处理函数: 只产生返回值，返回寄存器由适配器写入
pub type HandlerFn = fn(&mut ShimContext, &CallContext) -> Result<u64, ShimError>;

/// 处理函数描述
#[derive(Clone)]
pub struct HandlerDescriptor {
    pub routine: String,
    pub convention: CallingConvention,
    pub params: Vec<ParamSpec>,
    pub handler: HandlerFn,
    /// 处理函数报告客户机可见错误时返回给客户机的值
    pub failure_return: u64,
}

impl HandlerDescriptor {
    pub fn new(routine: impl Into<String>, convention: CallingConvention, handler: HandlerFn) -> Self {
        Self {
            routine: routine.into(),
            convention,
            params: Vec::new(),
            handler,
            failure_return: 0,
        }
    }

    pub fn param(mut self, name: &'static str, kind: ParamKind) -> Self {
        self.params.push(ParamSpec { name, kind });
        self
    }

    pub fn failure_return(mut self, value: u64) -> Self {
        self.failure_return = value;
        self
    }
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("routine", &self.routine)
            .field("convention", &self.convention)
            .field("params", &self.params)
            .field("failure_return", &format_args!("{:#x}", self.failure_return))
            .finish()
    }
}

/// 诊断类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiagnosticKind {
    #[default]
    UnimplementedRoutine,
    DuplicateRegistration,
    GuestError,
}

/// 非致命诊断记录
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub routine: String,
    pub detail: String,
}

/// 一次分发的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub routine: String,
    pub return_value: u64,
    /// 被调用方清理的参数区字节数
    pub stack_cleanup: u64,
    pub resume_at: u64,
    pub implemented: bool,
}

/// 调用分发注册表
pub struct CallDispatchRegistry {
    table: FxHashMap<String, HandlerDescriptor>,
    /// 未注册例程使用的约定
    default_convention: CallingConvention,
    diagnostics: RingBuffer<Diagnostic>,
    call_counts: FxHashMap<String, u64>,
}

impl CallDispatchRegistry {
    pub fn new(default_convention: CallingConvention, diagnostic_list_size: usize) -> Self {
        Self {
            table: FxHashMap::default(),
            default_convention,
            diagnostics: RingBuffer::new(diagnostic_list_size),
            call_counts: FxHashMap::default(),
        }
    }

    /// 注册处理函数，重复注册时替换旧项并记录诊断
    pub fn register(&mut self, descriptor: HandlerDescriptor) {
        debug!(routine = %descriptor.routine, convention = ?descriptor.convention, "注册处理函数");
        let routine = descriptor.routine.clone();
        if self.table.insert(routine.clone(), descriptor).is_some() {
            warn!(routine = %routine, "重复注册，旧的处理函数被替换");
            self.diagnostics.push_overwrite(Diagnostic {
                kind: DiagnosticKind::DuplicateRegistration,
                routine,
                detail: "旧的处理函数被替换".to_string(),
            });
        }
    }

    pub fn lookup(&self, routine: &str) -> Option<&HandlerDescriptor> {
        self.table.get(routine)
    }

    pub fn contains(&self, routine: &str) -> bool {
        self.table.contains_key(routine)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// 已注册的例程名，按字典序
    pub fn routines(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.table.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn call_count(&self, routine: &str) -> u64 {
        self.call_counts.get(routine).copied().unwrap_or(0)
    }

    pub fn diagnostics(&self) -> impl Iterator<Item = &Diagnostic> + '_ {
        self.diagnostics.iter()
    }

    /// 取出并清空诊断记录
    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        while let Some(diagnostic) = self.diagnostics.pop() {
            out.push(diagnostic);
        }
        out
    }

    /// 分发一次被拦截的调用
    ///
    /// 客户机可见的失败（文件不存在、无效句柄、未实现例程）转换成客户机的错误约定；
    /// 只有违反宿主侧不变量的错误才以 `Err` 返回。
    pub fn dispatch(&mut self, routine: &str, ctx: &mut ShimContext) -> Result<DispatchOutcome, ShimError> {
        let _span = debug_span!("dispatch", routine).entered();
        *self.call_counts.entry(routine.to_string()).or_insert(0) += 1;

        let Some(descriptor) = self.table.get(routine) else {
            return self.dispatch_unimplemented(routine, ctx);
        };
        let convention = descriptor.convention;
        if convention.arch() != ctx.arch() {
            return Err(ShimError::InvalidArgument(format!(
                "{} 的调用约定 {:?} 与目标架构 {} 不符",
                routine,
                convention,
                ctx.arch().name()
            )));
        }

        let decoded = convention
            .decode(&ctx.memory(), routine, &descriptor.params)
            .map_err(ShimError::from);
        let (call, return_value) = match decoded {
            Ok(call) => {
                for (name, value) in &call.params {
                    trace!("{} = {}", name, value);
                }
                let return_value = match (descriptor.handler)(ctx, &call) {
                    Ok(value) => value,
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        record_guest_error(&mut self.diagnostics, ctx, routine, &err);
                        descriptor.failure_return
                    }
                };
                (call, return_value)
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                // 参数无法解引用，处理函数不执行；按原始值重新解码以便按声明的参数个数修复栈
                record_guest_error(&mut self.diagnostics, ctx, routine, &err);
                let raw: Vec<ParamSpec> = descriptor
                    .params
                    .iter()
                    .map(|spec| ParamSpec { name: spec.name, kind: ParamKind::Int })
                    .collect();
                (convention.decode(&ctx.memory(), routine, &raw)?, descriptor.failure_return)
            }
        };

        let stack_cleanup = convention.commit(&mut ctx.memory(), &call, return_value)?;
        debug!(ret = %format!("{:#x}", return_value), stack_cleanup, "调用完成");
        Ok(DispatchOutcome {
            routine: routine.to_string(),
            return_value,
            stack_cleanup,
            resume_at: call.return_address,
            implemented: true,
        })
    }

    /// 未注册的例程: 记录诊断，返回 0 并让调用方继续执行
    fn dispatch_unimplemented(&mut self, routine: &str, ctx: &mut ShimContext) -> Result<DispatchOutcome, ShimError> {
        let err = ShimError::UnimplementedRoutine(routine.to_string());
        warn!("{}，返回默认值", err);
        self.diagnostics.push_overwrite(Diagnostic {
            kind: DiagnosticKind::UnimplementedRoutine,
            routine: routine.to_string(),
            detail: err.to_string(),
        });

        let convention = self.default_convention;
        let call = convention.decode(&ctx.memory(), routine, &[])?;
        let stack_cleanup = convention.commit(&mut ctx.memory(), &call, 0)?;
        Ok(DispatchOutcome {
            routine: routine.to_string(),
            return_value: 0,
            stack_cleanup,
            resume_at: call.return_address,
            implemented: false,
        })
    }
}

/// 客户机可见错误: 设置错误码并记录诊断
fn record_guest_error(
    diagnostics: &mut RingBuffer<Diagnostic>,
    ctx: &mut ShimContext,
    routine: &str,
    err: &ShimError,
) {
    if let Some(code) = err.guest_code(ctx.personality()) {
        ctx.set_last_error(code);
    }
    warn!(error = %err, "客户机可见错误");
    diagnostics.push_overwrite(Diagnostic {
        kind: DiagnosticKind::GuestError,
        routine: routine.to_string(),
        detail: err.to_string(),
    });
}
