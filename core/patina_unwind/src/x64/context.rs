//! x64 register state used while unwinding.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
use core::fmt;

/// General-purpose register, numbered the way unwind codes encode them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Register {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Register {
    const ALL: [Register; 16] = [
        Register::Rax,
        Register::Rcx,
        Register::Rdx,
        Register::Rbx,
        Register::Rsp,
        Register::Rbp,
        Register::Rsi,
        Register::Rdi,
        Register::R8,
        Register::R9,
        Register::R10,
        Register::R11,
        Register::R12,
        Register::R13,
        Register::R14,
        Register::R15,
    ];

    /// Registers a callee must preserve across a call.
    pub const NONVOLATILE: [Register; 8] = [
        Register::Rbx,
        Register::Rbp,
        Register::Rdi,
        Register::Rsi,
        Register::R12,
        Register::R13,
        Register::R14,
        Register::R15,
    ];

    /// Maps the 4-bit register number of an unwind code to a register.
    pub fn from_index(index: u8) -> Option<Register> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Register::Rax => "rax",
            Register::Rcx => "rcx",
            Register::Rdx => "rdx",
            Register::Rbx => "rbx",
            Register::Rsp => "rsp",
            Register::Rbp => "rbp",
            Register::Rsi => "rsi",
            Register::Rdi => "rdi",
            Register::R8 => "r8",
            Register::R9 => "r9",
            Register::R10 => "r10",
            Register::R11 => "r11",
            Register::R12 => "r12",
            Register::R13 => "r13",
            Register::R14 => "r14",
            Register::R15 => "r15",
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Snapshot of the integer register state of one frame.
///
/// `rsp` and `rbp` live in the general-purpose array at their encoded
/// positions so unwind codes can address them like any other register.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegisterContext {
    /// The instruction pointer of the frame.
    pub rip: u64,

    gpr: [u64; 16],
}

impl RegisterContext {
    pub fn new(rip: u64, rsp: u64) -> Self {
        let mut context = Self { rip, ..Default::default() };
        context.set(Register::Rsp, rsp);
        context
    }

    /// Builds a context from registers in unwind-code order.
    pub const fn from_gpr(rip: u64, gpr: [u64; 16]) -> Self {
        Self { rip, gpr }
    }

    pub fn get(&self, register: Register) -> u64 {
        self.gpr[register as usize]
    }

    pub fn set(&mut self, register: Register, value: u64) {
        self.gpr[register as usize] = value;
    }

    pub fn rsp(&self) -> u64 {
        self.get(Register::Rsp)
    }

    pub fn set_rsp(&mut self, value: u64) {
        self.set(Register::Rsp, value);
    }

    pub fn rbp(&self) -> u64 {
        self.get(Register::Rbp)
    }

    /// Builder-style register assignment for synthetic contexts.
    pub fn with(mut self, register: Register, value: u64) -> Self {
        self.set(register, value);
        self
    }

    /// The stack pointer of a caller at a call site is 16-byte aligned.
    pub fn is_call_boundary_aligned(&self) -> bool {
        self.rsp() % 16 == 0
    }

    /// Nonvolatile registers paired with their current values.
    pub fn nonvolatile(&self) -> impl Iterator<Item = (Register, u64)> + '_ {
        Register::NONVOLATILE.iter().map(move |&register| (register, self.get(register)))
    }
}

impl fmt::Display for RegisterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RIP: {:016X}, RSP: {:016X}, RBP: {:016X}", self.rip, self.rsp(), self.rbp())
    }
}

/// 128-bit vector register slot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct M128A {
    pub low: u64,
    pub high: i64,
}

/// Legacy FXSAVE layout embedded in the machine context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct XmmSaveArea32 {
    pub control_word: u16,
    pub status_word: u16,
    pub tag_word: u8,
    pub reserved1: u8,
    pub error_opcode: u16,
    pub error_offset: u32,
    pub error_selector: u16,
    pub reserved2: u16,
    pub data_offset: u32,
    pub data_selector: u16,
    pub reserved3: u16,
    pub mx_csr: u32,
    pub mx_csr_mask: u32,
    pub float_registers: [M128A; 8],
    pub xmm_registers: [M128A; 16],
    pub reserved4: [u8; 96],
}

impl Default for XmmSaveArea32 {
    fn default() -> Self {
        Self {
            control_word: 0,
            status_word: 0,
            tag_word: 0,
            reserved1: 0,
            error_opcode: 0,
            error_offset: 0,
            error_selector: 0,
            reserved2: 0,
            data_offset: 0,
            data_selector: 0,
            reserved3: 0,
            mx_csr: 0,
            mx_csr_mask: 0,
            float_registers: [M128A::default(); 8],
            xmm_registers: [M128A::default(); 16],
            reserved4: [0; 96],
        }
    }
}

/// Mirror of the host's native x64 exception context (`CONTEXT`).
///
/// Only the integer registers and `rip` take part in unwinding; everything
/// else passes through [`RegisterContext::write_to`] untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct MachineContext {
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
    pub flt_save: XmmSaveArea32,
    pub vector_register: [M128A; 26],
    pub vector_control: u64,
    pub debug_control: u64,
    pub last_branch_to_rip: u64,
    pub last_branch_from_rip: u64,
    pub last_exception_to_rip: u64,
    pub last_exception_from_rip: u64,
}

impl Default for MachineContext {
    fn default() -> Self {
        Self {
            p1_home: 0,
            p2_home: 0,
            p3_home: 0,
            p4_home: 0,
            p5_home: 0,
            p6_home: 0,
            context_flags: 0,
            mx_csr: 0,
            seg_cs: 0,
            seg_ds: 0,
            seg_es: 0,
            seg_fs: 0,
            seg_gs: 0,
            seg_ss: 0,
            eflags: 0,
            dr0: 0,
            dr1: 0,
            dr2: 0,
            dr3: 0,
            dr6: 0,
            dr7: 0,
            rax: 0,
            rcx: 0,
            rdx: 0,
            rbx: 0,
            rsp: 0,
            rbp: 0,
            rsi: 0,
            rdi: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
            flt_save: XmmSaveArea32::default(),
            vector_register: [M128A::default(); 26],
            vector_control: 0,
            debug_control: 0,
            last_branch_to_rip: 0,
            last_branch_from_rip: 0,
            last_exception_to_rip: 0,
            last_exception_from_rip: 0,
        }
    }
}

impl MachineContext {
    fn gpr(&self) -> [u64; 16] {
        [
            self.rax, self.rcx, self.rdx, self.rbx, self.rsp, self.rbp, self.rsi, self.rdi, self.r8, self.r9,
            self.r10, self.r11, self.r12, self.r13, self.r14, self.r15,
        ]
    }
}

impl From<&MachineContext> for RegisterContext {
    fn from(machine: &MachineContext) -> Self {
        Self { rip: machine.rip, gpr: machine.gpr() }
    }
}

impl RegisterContext {
    /// Writes the integer registers and `rip` back into a host context.
    pub fn write_to(&self, machine: &mut MachineContext) {
        let [rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15] = self.gpr;
        machine.rax = rax;
        machine.rcx = rcx;
        machine.rdx = rdx;
        machine.rbx = rbx;
        machine.rsp = rsp;
        machine.rbp = rbp;
        machine.rsi = rsi;
        machine.rdi = rdi;
        machine.r8 = r8;
        machine.r9 = r9;
        machine.r10 = r10;
        machine.r11 = r11;
        machine.r12 = r12;
        machine.r13 = r13;
        machine.r14 = r14;
        machine.r15 = r15;
        machine.rip = self.rip;
    }
}
