//! 调用约定适配
//!
//! 从寄存器和栈中取出参数，提交返回值并修复栈，然后让调用方继续执行。

use guest_cpu::{Arch, Register};
use tracing::trace;

use super::{CallContext, ParamKind, ParamSpec, ParamValue};
use crate::memory::{MemoryError, MemoryView};

/// 调用约定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    /// x86，参数全部在栈上，被调用方清栈
    Stdcall,
    /// x86，参数全部在栈上，调用方清栈
    Cdecl,
    /// Windows x86-64: rcx, rdx, r8, r9，其余参数位于 32 字节影子空间之后
    Ms64,
    /// System V x86-64: rdi, rsi, rdx, rcx, r8, r9
    SysV64,
    /// arm64: x0 - x7，返回地址在链接寄存器中
    Aapcs64,
}

/// 参数位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLocation {
    Register(Register),
    /// 相对于进入时栈指针的偏移
    Stack(u64),
}

const MS64_ARGS: [Register; 4] = [Register::Rcx, Register::Rdx, Register::R8, Register::R9];
const SYSV64_ARGS: [Register; 6] = [
    Register::Rdi,
    Register::Rsi,
    Register::Rdx,
    Register::Rcx,
    Register::R8,
    Register::R9,
];
const AAPCS64_ARGS: [Register; 8] = [
    Register::X(0),
    Register::X(1),
    Register::X(2),
    Register::X(3),
    Register::X(4),
    Register::X(5),
    Register::X(6),
    Register::X(7),
];

/// Windows x64 影子空间大小
const MS64_SHADOW_SPACE: u64 = 32;

impl CallingConvention {
    pub fn arch(self) -> Arch {
        match self {
            CallingConvention::Stdcall | CallingConvention::Cdecl => Arch::X86,
            CallingConvention::Ms64 | CallingConvention::SysV64 => Arch::X8664,
            CallingConvention::Aapcs64 => Arch::Arm64,
        }
    }

    /// 栈槽宽度，等于指针宽度
    #[inline(always)]
    pub fn slot_width(self) -> usize {
        self.arch().pointer_width()
    }

    fn arg_registers(self) -> &'static [Register] {
        match self {
            CallingConvention::Stdcall | CallingConvention::Cdecl => &[],
            CallingConvention::Ms64 => &MS64_ARGS,
            CallingConvention::SysV64 => &SYSV64_ARGS,
            CallingConvention::Aapcs64 => &AAPCS64_ARGS,
        }
    }

    pub fn return_register(self) -> Register {
        match self {
            CallingConvention::Aapcs64 => Register::X(0),
            _ => Register::Rax,
        }
    }

    /// 被调用方是否负责清理参数区
    pub fn callee_cleanup(self) -> bool {
        self == CallingConvention::Stdcall
    }

    /// 返回地址是否由 call 指令压在栈顶
    fn return_address_on_stack(self) -> bool {
        self != CallingConvention::Aapcs64
    }

    /// 第一个栈参数相对进入时栈指针的偏移
    fn stack_args_base(self) -> u64 {
        let slot = self.slot_width() as u64;
        match self {
            CallingConvention::Stdcall | CallingConvention::Cdecl | CallingConvention::SysV64 => slot,
            CallingConvention::Ms64 => slot + MS64_SHADOW_SPACE,
            CallingConvention::Aapcs64 => 0,
        }
    }

    /// 第 `index` 个参数的位置
    pub fn arg_location(self, index: usize) -> ArgLocation {
        let registers = self.arg_registers();
        if index < registers.len() {
            return ArgLocation::Register(registers[index]);
        }
        let stack_index = (index - registers.len()) as u64;
        ArgLocation::Stack(self.stack_args_base() + stack_index * self.slot_width() as u64)
    }

    /// 返回后需要额外弹出的参数区字节数
    pub fn stack_cleanup(self, param_count: usize) -> u64 {
        if self.callee_cleanup() {
            (param_count * self.slot_width()) as u64
        } else {
            0
        }
    }

    #[inline(always)]
    fn mask(self, value: u64) -> u64 {
        match self.slot_width() {
            4 => value & 0xffff_ffff,
            _ => value,
        }
    }

    /// 按参数表解码一次调用
    pub fn decode(
        self,
        view: &MemoryView<'_>,
        routine: &str,
        params: &[ParamSpec],
    ) -> Result<CallContext, MemoryError> {
        let sp = view.reg_read(Register::stack_pointer(self.arch()))?;
        let return_address = if self.return_address_on_stack() {
            view.read_pointer(sp)?
        } else {
            view.reg_read(Register::LR)?
        };

        let mut decoded = Vec::with_capacity(params.len());
        for (index, spec) in params.iter().enumerate() {
            let raw = match self.arg_location(index) {
                ArgLocation::Register(reg) => self.mask(view.reg_read(reg)?),
                ArgLocation::Stack(offset) => {
                    let addr = sp
                        .checked_add(offset)
                        .ok_or(MemoryError::InvalidMemoryAccess { addr: sp, size: offset as usize })?;
                    view.read_pointer(addr)?
                }
            };
            decoded.push((spec.name, decode_param(view, spec.kind, raw)?));
        }
        trace!(routine, sp = %format!("{:#x}", sp), ret = %format!("{:#x}", return_address), "解码参数");

        Ok(CallContext {
            routine: routine.to_string(),
            convention: self,
            stack_pointer: sp,
            return_address,
            params: decoded,
        })
    }

    /// 写返回值并让调用方继续执行，返回清理的参数区字节数
    pub fn commit(
        self,
        view: &mut MemoryView<'_>,
        call: &CallContext,
        return_value: u64,
    ) -> Result<u64, MemoryError> {
        let arch = self.arch();
        view.reg_write(self.return_register(), self.mask(return_value))?;

        let cleanup = self.stack_cleanup(call.params.len());
        if self.return_address_on_stack() {
            // 等价于 `ret imm16`: 弹出返回地址，再弹出参数区
            let sp = call.stack_pointer + self.slot_width() as u64 + cleanup;
            view.reg_write(Register::stack_pointer(arch), sp)?;
        }
        view.reg_write(Register::program_counter(arch), call.return_address)?;
        Ok(cleanup)
    }

    /// 按约定布置一次调用的入口状态，相当于调用方执行 call 指令
    ///
    /// 寄存器参数写入参数寄存器，其余参数和返回地址写到栈上，返回新的栈指针。
    pub fn stage_call(
        self,
        view: &mut MemoryView<'_>,
        return_address: u64,
        args: &[u64],
    ) -> Result<u64, MemoryError> {
        let arch = self.arch();
        let slot = self.slot_width() as u64;
        let stack_args = args.len().saturating_sub(self.arg_registers().len()) as u64;
        let frame = if self.return_address_on_stack() {
            self.stack_args_base() + stack_args * slot
        } else {
            stack_args * slot
        };

        let sp = view.reg_read(Register::stack_pointer(arch))?;
        let entry_sp = sp
            .checked_sub(frame)
            .ok_or(MemoryError::InvalidMemoryAccess { addr: sp, size: frame as usize })?;
        for (index, &value) in args.iter().enumerate() {
            match self.arg_location(index) {
                ArgLocation::Register(reg) => view.reg_write(reg, self.mask(value))?,
                ArgLocation::Stack(offset) => view.write_pointer(entry_sp + offset, value)?,
            }
        }
        if self.return_address_on_stack() {
            view.write_pointer(entry_sp, return_address)?;
        } else {
            view.reg_write(Register::LR, return_address)?;
        }
        view.reg_write(Register::stack_pointer(arch), entry_sp)?;
        Ok(entry_sp)
    }
}

fn decode_param(view: &MemoryView<'_>, kind: ParamKind, raw: u64) -> Result<ParamValue, MemoryError> {
    let value = match kind {
        ParamKind::Int => ParamValue::Int(raw),
        ParamKind::Pointer => ParamValue::Pointer(raw),
        ParamKind::Handle => ParamValue::Handle(raw),
        // 空指针不解引用
        ParamKind::CString if raw == 0 => ParamValue::Str { ptr: 0, value: None },
        ParamKind::WString if raw == 0 => ParamValue::Str { ptr: 0, value: None },
        ParamKind::CString => ParamValue::Str { ptr: raw, value: Some(view.read_cstring(raw)?) },
        ParamKind::WString => ParamValue::Str { ptr: raw, value: Some(view.read_wstring(raw)?) },
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_locations() {
        assert_eq!(CallingConvention::Stdcall.arg_location(0), ArgLocation::Stack(4));
        assert_eq!(CallingConvention::Stdcall.arg_location(2), ArgLocation::Stack(12));
        assert_eq!(CallingConvention::Cdecl.arg_location(1), ArgLocation::Stack(8));
    }

    #[test]
    fn test_register_locations() {
        assert_eq!(CallingConvention::Ms64.arg_location(0), ArgLocation::Register(Register::Rcx));
        assert_eq!(CallingConvention::Ms64.arg_location(3), ArgLocation::Register(Register::R9));
        // 影子空间之后
        assert_eq!(CallingConvention::Ms64.arg_location(4), ArgLocation::Stack(40));
        assert_eq!(CallingConvention::SysV64.arg_location(0), ArgLocation::Register(Register::Rdi));
        assert_eq!(CallingConvention::SysV64.arg_location(6), ArgLocation::Stack(8));
        assert_eq!(CallingConvention::Aapcs64.arg_location(7), ArgLocation::Register(Register::X(7)));
        assert_eq!(CallingConvention::Aapcs64.arg_location(9), ArgLocation::Stack(8));
    }

    #[test]
    fn test_stack_cleanup() {
        assert_eq!(CallingConvention::Stdcall.stack_cleanup(3), 12);
        assert_eq!(CallingConvention::Cdecl.stack_cleanup(3), 0);
        assert_eq!(CallingConvention::Ms64.stack_cleanup(6), 0);
        assert_eq!(CallingConvention::Aapcs64.stack_cleanup(9), 0);
    }

    fn staged(arch: Arch) -> crate::backend::RefCpu {
        use guest_cpu::{GuestCpu, Perm};
        let mut cpu = crate::backend::RefCpu::new(arch);
        cpu.mem_map(0x10_0000, 0x1000, Perm::RW, "stack").unwrap();
        cpu.reg_write(Register::stack_pointer(arch), 0x10_0800).unwrap();
        cpu
    }

    fn int_params(count: usize) -> Vec<ParamSpec> {
        const NAMES: [&str; 10] = ["a0", "a1", "a2", "a3", "a4", "a5", "a6", "a7", "a8", "a9"];
        NAMES[..count]
            .iter()
            .map(|&name| ParamSpec { name, kind: ParamKind::Int })
            .collect()
    }

    #[test]
    fn test_stage_then_decode() {
        for (cc, count) in [
            (CallingConvention::Stdcall, 3),
            (CallingConvention::Cdecl, 2),
            (CallingConvention::Ms64, 6),
            (CallingConvention::SysV64, 8),
            (CallingConvention::Aapcs64, 10),
        ] {
            let mut cpu = staged(cc.arch());
            let mut view = MemoryView::new(&mut cpu);
            let args: Vec<u64> = (0..count as u64).map(|i| 0x100 + i).collect();
            let sp = cc.stage_call(&mut view, 0x4000, &args).unwrap();

            let call = cc.decode(&view, "f", &int_params(count)).unwrap();
            assert_eq!(call.stack_pointer, sp, "{:?}", cc);
            assert_eq!(call.return_address, 0x4000, "{:?}", cc);
            let raw: Vec<u64> = call.params.iter().map(|(_, value)| value.raw()).collect();
            assert_eq!(raw, args, "{:?}", cc);
        }
    }

    #[test]
    fn test_ms64_skips_shadow_space() {
        let mut cpu = staged(Arch::X8664);
        let mut view = MemoryView::new(&mut cpu);
        let sp = CallingConvention::Ms64
            .stage_call(&mut view, 0x4000, &[1, 2, 3, 4, 5])
            .unwrap();
        assert_eq!(view.read_u64(sp + 8 + 32).unwrap(), 5);
        assert_eq!(view.reg_read(Register::R9).unwrap(), 4);
    }

    #[test]
    fn test_stdcall_commit_adjusts_stack() {
        let mut cpu = staged(Arch::X86);
        let mut view = MemoryView::new(&mut cpu);
        let sp = CallingConvention::Stdcall
            .stage_call(&mut view, 0x4000, &[7, 8, 9])
            .unwrap();
        let call = CallingConvention::Stdcall.decode(&view, "f", &int_params(3)).unwrap();
        let cleanup = CallingConvention::Stdcall.commit(&mut view, &call, 0x1_2345_6789).unwrap();

        assert_eq!(cleanup, 12);
        assert_eq!(view.reg_read(Register::Rsp).unwrap(), sp + 4 + 12);
        assert_eq!(view.reg_read(Register::Rip).unwrap(), 0x4000);
        // x86 返回值截断为 32 位
        assert_eq!(view.reg_read(Register::Rax).unwrap(), 0x2345_6789);
    }

    #[test]
    fn test_aapcs64_resumes_from_lr() {
        let mut cpu = staged(Arch::Arm64);
        let mut view = MemoryView::new(&mut cpu);
        let sp = CallingConvention::Aapcs64.stage_call(&mut view, 0x8000, &[1]).unwrap();
        let call = CallingConvention::Aapcs64.decode(&view, "f", &int_params(1)).unwrap();
        CallingConvention::Aapcs64.commit(&mut view, &call, 42).unwrap();

        assert_eq!(view.reg_read(Register::X(0)).unwrap(), 42);
        assert_eq!(view.reg_read(Register::Pc).unwrap(), 0x8000);
        assert_eq!(view.reg_read(Register::Sp).unwrap(), sp);
    }

    #[test]
    fn test_string_params() {
        let mut cpu = staged(Arch::X8664);
        let mut view = MemoryView::new(&mut cpu);
        view.write_cstring(0x10_0100, "/etc/hosts").unwrap();
        let wide: Vec<u8> = "C:\\a".encode_utf16().flat_map(u16::to_le_bytes).chain([0, 0]).collect();
        view.write(0x10_0200, &wide).unwrap();
        CallingConvention::SysV64
            .stage_call(&mut view, 0x4000, &[0x10_0100, 0x10_0200, 0])
            .unwrap();

        let params = [
            ParamSpec { name: "path", kind: ParamKind::CString },
            ParamSpec { name: "wide", kind: ParamKind::WString },
            ParamSpec { name: "null", kind: ParamKind::CString },
        ];
        let call = CallingConvention::SysV64.decode(&view, "f", &params).unwrap();
        assert_eq!(call.string("path").unwrap(), Some("/etc/hosts"));
        assert_eq!(call.string("wide").unwrap(), Some("C:\\a"));
        assert_eq!(call.string("null").unwrap(), None);
    }

    #[test]
    fn test_bad_string_pointer() {
        let mut cpu = staged(Arch::X8664);
        let mut view = MemoryView::new(&mut cpu);
        CallingConvention::SysV64.stage_call(&mut view, 0x4000, &[0xdead_0000]).unwrap();
        let params = [ParamSpec { name: "path", kind: ParamKind::CString }];
        assert!(matches!(
            CallingConvention::SysV64.decode(&view, "f", &params),
            Err(MemoryError::InvalidMemoryAccess { .. })
        ));
    }
}
