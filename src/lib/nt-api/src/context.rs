//! The emulated CPU context.
//!
//! [`Context`] is the x64 `CONTEXT` structure up to and including `rip`. The
//! floating point save area and vector registers that follow `rip` on Windows
//! are not emulated; `FLOATING_POINT` covers only `mx_csr`.

use bitflags::bitflags;
use static_assertions::{assert_eq_size, const_assert_eq};

use crate::status::{NtResult, NtStatus};

bitflags! {
    /// `CONTEXT_*` flags. Every valid mask carries [`ContextFlags::AMD64`].
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct ContextFlags: u32 {
        const AMD64 = 0x0010_0000;
        const CONTROL = Self::AMD64.bits() | 0x01;
        const INTEGER = Self::AMD64.bits() | 0x02;
        const SEGMENTS = Self::AMD64.bits() | 0x04;
        const FLOATING_POINT = Self::AMD64.bits() | 0x08;
        const DEBUG_REGISTERS = Self::AMD64.bits() | 0x10;
        const FULL = Self::CONTROL.bits() | Self::INTEGER.bits() | Self::FLOATING_POINT.bits();
        const ALL = Self::FULL.bits() | Self::SEGMENTS.bits() | Self::DEBUG_REGISTERS.bits();
    }
}

impl ContextFlags {
    /// Group bits only, without the architecture tag.
    const GROUP_MASK: u32 = 0x1f;

    /// Checks a caller-supplied mask.
    pub fn validate(raw: u32) -> NtResult<Self> {
        let flags = Self::from_bits(raw).ok_or(NtStatus::INVALID_PARAMETER)?;
        if !flags.contains(Self::AMD64) {
            return Err(NtStatus::INVALID_PARAMETER);
        }
        Ok(flags)
    }

    fn has_group(self, group: Self) -> bool {
        (self.bits() & group.bits() & Self::GROUP_MASK) != 0
    }

    pub fn has_control(self) -> bool {
        self.has_group(Self::CONTROL)
    }

    pub fn has_integer(self) -> bool {
        self.has_group(Self::INTEGER)
    }

    pub fn has_segments(self) -> bool {
        self.has_group(Self::SEGMENTS)
    }

    pub fn has_floating_point(self) -> bool {
        self.has_group(Self::FLOATING_POINT)
    }

    pub fn has_debug_registers(self) -> bool {
        self.has_group(Self::DEBUG_REGISTERS)
    }

    /// The same mask with the debug-register group removed.
    pub fn without_debug_registers(self) -> Self {
        Self::from_bits_retain(self.bits() & !(Self::DEBUG_REGISTERS.bits() & Self::GROUP_MASK))
    }

    /// True if no register group is selected.
    pub fn is_empty_selection(self) -> bool {
        (self.bits() & Self::GROUP_MASK) == 0
    }
}

/// The debug-register subset of a [`Context`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct DebugRegisters {
    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(C, align(16))]
pub struct Context {
    pub p1_home: u64,
    pub p2_home: u64,
    pub p3_home: u64,
    pub p4_home: u64,
    pub p5_home: u64,
    pub p6_home: u64,

    pub context_flags: u32,
    pub mx_csr: u32,

    pub seg_cs: u16,
    pub seg_ds: u16,
    pub seg_es: u16,
    pub seg_fs: u16,
    pub seg_gs: u16,
    pub seg_ss: u16,
    pub eflags: u32,

    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,

    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,

    pub rip: u64,
}

assert_eq_size!(Context, [u8; 0x100]);
const_assert_eq!(memoffset::offset_of!(Context, context_flags), 0x30);
const_assert_eq!(memoffset::offset_of!(Context, mx_csr), 0x34);
const_assert_eq!(memoffset::offset_of!(Context, seg_cs), 0x38);
const_assert_eq!(memoffset::offset_of!(Context, eflags), 0x44);
const_assert_eq!(memoffset::offset_of!(Context, dr0), 0x48);
const_assert_eq!(memoffset::offset_of!(Context, dr7), 0x70);
const_assert_eq!(memoffset::offset_of!(Context, rax), 0x78);
const_assert_eq!(memoffset::offset_of!(Context, rsp), 0x98);
const_assert_eq!(memoffset::offset_of!(Context, r8), 0xb8);
const_assert_eq!(memoffset::offset_of!(Context, rip), 0xf8);

/// Selectors a freshly created user-mode thread starts with.
const USER_CS: u16 = 0x33;
const USER_DS: u16 = 0x2b;
const USER_FS: u16 = 0x53;
/// Interrupt flag plus the always-one reserved bit.
const INITIAL_EFLAGS: u32 = 0x202;
/// All floating point exceptions masked.
const INITIAL_MXCSR: u32 = 0x1f80;

impl Context {
    /// Zeroed context with only `context_flags` set.
    pub fn with_flags(flags: ContextFlags) -> Self {
        Self {
            context_flags: flags.bits(),
            ..Default::default()
        }
    }

    /// Context a new thread starts from: `rip` at `entry`, the single argument in
    /// `rcx`, and `rsp` at the top of its stack.
    pub fn initial(entry: u64, arg: u64, stack_top: u64) -> Self {
        Self {
            context_flags: ContextFlags::ALL.bits(),
            mx_csr: INITIAL_MXCSR,
            seg_cs: USER_CS,
            seg_ds: USER_DS,
            seg_es: USER_DS,
            seg_fs: USER_FS,
            seg_gs: USER_DS,
            seg_ss: USER_DS,
            eflags: INITIAL_EFLAGS,
            rcx: arg,
            rsp: stack_top,
            rip: entry,
            ..Default::default()
        }
    }

    /// The raw `context_flags` checked and typed.
    pub fn flags(&self) -> NtResult<ContextFlags> {
        ContextFlags::validate(self.context_flags)
    }

    pub fn debug_registers(&self) -> DebugRegisters {
        DebugRegisters {
            dr0: self.dr0,
            dr1: self.dr1,
            dr2: self.dr2,
            dr3: self.dr3,
            dr6: self.dr6,
            dr7: self.dr7,
        }
    }

    pub fn set_debug_registers(&mut self, regs: &DebugRegisters) {
        self.dr0 = regs.dr0;
        self.dr1 = regs.dr1;
        self.dr2 = regs.dr2;
        self.dr3 = regs.dr3;
        self.dr6 = regs.dr6;
        self.dr7 = regs.dr7;
    }

    /// Copies the register groups selected by `flags` from `src` into `self`.
    /// Groups not selected are left untouched; `context_flags` is not modified.
    pub fn copy_groups_from(&mut self, src: &Context, flags: ContextFlags) {
        if flags.has_control() {
            self.seg_cs = src.seg_cs;
            self.seg_ss = src.seg_ss;
            self.eflags = src.eflags;
            self.rsp = src.rsp;
            self.rbp = src.rbp;
            self.rip = src.rip;
        }
        if flags.has_integer() {
            self.rax = src.rax;
            self.rcx = src.rcx;
            self.rdx = src.rdx;
            self.rbx = src.rbx;
            self.rsi = src.rsi;
            self.rdi = src.rdi;
            self.r8 = src.r8;
            self.r9 = src.r9;
            self.r10 = src.r10;
            self.r11 = src.r11;
            self.r12 = src.r12;
            self.r13 = src.r13;
            self.r14 = src.r14;
            self.r15 = src.r15;
        }
        if flags.has_segments() {
            self.seg_ds = src.seg_ds;
            self.seg_es = src.seg_es;
            self.seg_fs = src.seg_fs;
            self.seg_gs = src.seg_gs;
        }
        if flags.has_floating_point() {
            self.mx_csr = src.mx_csr;
        }
        if flags.has_debug_registers() {
            self.set_debug_registers(&src.debug_registers());
        }
    }

    /// A context holding only the groups selected by `flags` from `self`, with
    /// `context_flags` set to `flags`.
    pub fn subset(&self, flags: ContextFlags) -> Context {
        let mut out = Context::with_flags(flags);
        out.copy_groups_from(self, flags);
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_validate() {
        assert_eq!(
            ContextFlags::validate(0x0010_0003),
            Ok(ContextFlags::CONTROL | ContextFlags::INTEGER)
        );
        // Missing architecture tag.
        assert_eq!(ContextFlags::validate(0x3), Err(NtStatus::INVALID_PARAMETER));
        // Unknown group bit.
        assert_eq!(
            ContextFlags::validate(0x0010_0040),
            Err(NtStatus::INVALID_PARAMETER)
        );
        // Wrong architecture (CONTEXT_i386).
        assert_eq!(
            ContextFlags::validate(0x0001_0001),
            Err(NtStatus::INVALID_PARAMETER)
        );
    }

    #[test]
    fn test_group_queries() {
        let flags = ContextFlags::INTEGER | ContextFlags::DEBUG_REGISTERS;
        assert!(flags.has_integer());
        assert!(flags.has_debug_registers());
        assert!(!flags.has_control());
        // The architecture tag alone doesn't select a group.
        assert!(!ContextFlags::AMD64.has_control());
        assert!(ContextFlags::AMD64.is_empty_selection());

        let stripped = flags.without_debug_registers();
        assert_eq!(stripped, ContextFlags::INTEGER);
        assert!(stripped.contains(ContextFlags::AMD64));
    }

    #[test]
    fn test_copy_groups() {
        let mut src = Context::initial(0x1000, 7, 0x8000);
        src.rax = 42;
        src.r15 = 15;
        src.dr7 = 0x401;
        src.seg_gs = 0x99;

        let mut dst = Context::default();
        dst.copy_groups_from(&src, ContextFlags::INTEGER);
        assert_eq!(dst.rax, 42);
        assert_eq!(dst.rcx, 7);
        assert_eq!(dst.r15, 15);
        assert_eq!(dst.rip, 0);
        assert_eq!(dst.dr7, 0);
        assert_eq!(dst.seg_gs, 0);

        dst.copy_groups_from(&src, ContextFlags::CONTROL | ContextFlags::DEBUG_REGISTERS);
        assert_eq!(dst.rip, 0x1000);
        assert_eq!(dst.rsp, 0x8000);
        assert_eq!(dst.dr7, 0x401);
        assert_eq!(dst.seg_gs, 0);
    }

    #[test]
    fn test_subset_sets_flags() {
        let src = Context::initial(0x1000, 7, 0x8000);
        let sub = src.subset(ContextFlags::CONTROL);
        assert_eq!(sub.flags(), Ok(ContextFlags::CONTROL));
        assert_eq!(sub.rip, 0x1000);
        assert_eq!(sub.rcx, 0);
    }
}
