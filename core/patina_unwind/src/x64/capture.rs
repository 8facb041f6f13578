//! Register capture for live unwinding.
//!
//! Capturing is architecture specific, so the unwinder only depends on the
//! [`ContextCapture`] capability. Tests substitute synthetic contexts.
use super::context::RegisterContext;

/// Produces a register snapshot to start unwinding from.
#[cfg_attr(test, mockall::automock)]
pub trait ContextCapture {
    fn capture(&self) -> RegisterContext;
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        use core::arch::asm;

        /// Snapshots the nonvolatile registers, `rsp` and `rip` of the caller.
        #[derive(Debug, Default, Clone, Copy)]
        pub struct LiveCapture;

        impl ContextCapture for LiveCapture {
            #[inline(always)]
            fn capture(&self) -> RegisterContext {
                let mut registers = [0u64; 16];
                let rip: u64;

                // SAFETY: The assembly only stores register values into the
                // local `registers` array and reads the current rip. It does
                // not touch the stack or any other memory.
                unsafe {
                    asm!(
                        "mov [{regs} + 3*8], rbx",
                        "mov [{regs} + 4*8], rsp",
                        "mov [{regs} + 5*8], rbp",
                        "mov [{regs} + 6*8], rsi",
                        "mov [{regs} + 7*8], rdi",
                        "mov [{regs} + 12*8], r12",
                        "mov [{regs} + 13*8], r13",
                        "mov [{regs} + 14*8], r14",
                        "mov [{regs} + 15*8], r15",
                        "lea {rip}, [rip]",
                        regs = in(reg) registers.as_mut_ptr(),
                        rip = out(reg) rip,
                        options(nostack, preserves_flags),
                    );
                }

                RegisterContext::from_gpr(rip, registers)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::context::Register;

    #[test]
    fn mock_capture_supplies_synthetic_context() {
        let mut capture = MockContextCapture::new();
        capture.expect_capture().times(1).returning(|| RegisterContext::new(0x1234, 0x8000));
        let context = capture.capture();
        assert_eq!(context.rip, 0x1234);
        assert_eq!(context.get(Register::Rsp), 0x8000);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn live_capture_reads_current_stack() {
        let marker = 0u64;
        let context = LiveCapture.capture();
        let local = &marker as *const u64 as u64;

        assert_ne!(context.rip, 0);
        assert!(context.rsp() <= local + 0x1000 && local <= context.rsp() + 0x1_0000);
        assert_eq!(context.get(Register::Rax), 0);
        core::hint::black_box(marker);
    }
}
