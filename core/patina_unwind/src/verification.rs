//! Built-in self tests for the unwinder.
//!
//! Each test builds a synthetic call stack from hand-encoded unwind metadata,
//! unwinds it and compares every recovered register against the values the
//! simulated callers held. Both are exported with C linkage so firmware test
//! runners and foreign harnesses can call them directly.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
use alloc::{vec, vec::Vec};

use crate::{
    config::UnwinderConfig,
    error::FrameError,
    memory::SimulatedStack,
    unwinder::Unwinder,
    x64::{
        context::{Register, RegisterContext},
        runtime_function::{FunctionEntry, FunctionTable},
        unwind::UnwindInfo,
    },
};

const STACK_TOP: u64 = 0x20_0000;

const A_PRIMARY: u64 = 0x1000;
const A_SECONDARY: u64 = 0x1800;
const B_START: u64 = 0x2000;
const C_START: u64 = 0x3000;

const RET_INTO_A: u64 = A_SECONDARY + 0x25;
const RET_INTO_B: u64 = B_START + 0x45;

const R12_IN_ENTRY: u64 = 0x1200_0000_0000_0E0E;
const R12_IN_A: u64 = 0x1200_0000_0000_0A0A;
const RBX_IN_A: u64 = 0x0B00_0000_0000_0A0A;
const RSI_IN_A: u64 = 0x0500_0000_0000_0A0A;

/// Image offsets of the encoded unwind records.
const A_PRIMARY_RVA: usize = 0x10;
const A_SECONDARY_RVA: usize = 0x20;
const B_RVA: usize = 0x40;

/// `push r12; sub rsp, 0x20`
const A_PRIMARY_UNWIND: [u8; 8] = [0x01, 0x06, 0x02, 0x00, 0x06, 0x32, 0x02, 0xC0];

/// No codes of its own; continues with the record at `A_PRIMARY_RVA`.
const A_SECONDARY_UNWIND: [u8; 16] = [
    0x21, 0x00, 0x00, 0x00, // version 1, CHAININFO
    0x00, 0x10, 0x00, 0x00, // begin
    0x80, 0x10, 0x00, 0x00, // end
    0x10, 0x00, 0x00, 0x00, // unwind info
];

/// `push rbx; push rsi; sub rsp, 0x28`
const B_UNWIND: [u8; 12] = [0x01, 0x06, 0x03, 0x00, 0x06, 0x42, 0x02, 0x60, 0x01, 0x30, 0x00, 0x00];

/// Unwinds a single leaf frame and checks that only `rip` and `rsp` moved.
pub fn run_leaf_test() -> bool {
    report("leaf", leaf_scenario())
}

/// Unwinds `entry -> a -> b -> c` to the stack base and checks every frame.
pub fn run_full_unwind_test() -> bool {
    report("full unwind", full_unwind_scenario())
}

#[no_mangle]
pub extern "C" fn unwinder_test_leaf() -> bool {
    run_leaf_test()
}

#[no_mangle]
pub extern "C" fn unwinder_test_full_unwind() -> bool {
    run_full_unwind_test()
}

fn report(name: &str, result: Result<bool, FrameError>) -> bool {
    match result {
        Ok(true) => {
            log::info!("Unwinder {name} test passed");
            true
        }
        Ok(false) => {
            log::error!("Unwinder {name} test recovered unexpected state");
            false
        }
        Err(err) => {
            log::error!("Unwinder {name} test failed at {err}");
            false
        }
    }
}

fn expect(label: &str, actual: u64, expected: u64) -> bool {
    if actual != expected {
        log::error!("{label}: expected {expected:016X}, found {actual:016X}");
        return false;
    }
    true
}

fn image() -> Vec<u8> {
    let mut image = vec![0u8; 0x60];
    image[A_PRIMARY_RVA..A_PRIMARY_RVA + A_PRIMARY_UNWIND.len()].copy_from_slice(&A_PRIMARY_UNWIND);
    image[A_SECONDARY_RVA..A_SECONDARY_RVA + A_SECONDARY_UNWIND.len()].copy_from_slice(&A_SECONDARY_UNWIND);
    image[B_RVA..B_RVA + B_UNWIND.len()].copy_from_slice(&B_UNWIND);
    image
}

fn function_table(context: &RegisterContext) -> Result<FunctionTable, FrameError> {
    let image = image();
    let parse = |rva: usize| UnwindInfo::parse_in_image(&image, rva as u32).map_err(|err| err.at_frame(0, context));

    FunctionTable::builder()
        .function(FunctionEntry::new(A_PRIMARY, A_PRIMARY + 0x80, parse(A_PRIMARY_RVA)?))
        .function(FunctionEntry::new(A_SECONDARY, A_SECONDARY + 0x40, parse(A_SECONDARY_RVA)?))
        .function(FunctionEntry::new(B_START, B_START + 0x80, parse(B_RVA)?))
        .function(FunctionEntry::leaf(C_START, C_START + 0x20))
        .build()
        .map_err(|err| err.at_frame(0, context))
}

fn leaf_scenario() -> Result<bool, FrameError> {
    let mut stack = SimulatedStack::new(STACK_TOP);
    stack.call(0).push(R12_IN_ENTRY).allocate(0x20).call(RET_INTO_A);

    let mut context = RegisterContext::new(C_START + 0x4, stack.rsp()).with(Register::R12, R12_IN_A);
    let before = context;

    let table = function_table(&context)?;
    let unwinder = Unwinder::with_config(&table, &stack, UnwinderConfig::default().with_strict_alignment(true));
    let Some(frame) = unwinder.step(&mut context).map_err(|err| err.at_frame(0, &before))? else {
        log::error!("Leaf frame was treated as the stack base");
        return Ok(false);
    };

    let mut passed = expect("leaf function start", frame.function_start, C_START);
    passed &= expect("leaf return address", context.rip, RET_INTO_A);
    passed &= expect("leaf caller rsp", context.rsp(), before.rsp() + 8);
    for (register, value) in before.nonvolatile() {
        passed &= expect(register.name(), context.get(register), value);
    }
    Ok(passed)
}

fn full_unwind_scenario() -> Result<bool, FrameError> {
    let mut stack = SimulatedStack::new(STACK_TOP);
    stack.call(0).push(R12_IN_ENTRY).allocate(0x20);
    stack.call(RET_INTO_A).push(RBX_IN_A).push(RSI_IN_A).allocate(0x28);
    stack.call(RET_INTO_B);

    let context = RegisterContext::new(C_START + 0x8, stack.rsp())
        .with(Register::Rbx, 0xC0C0)
        .with(Register::Rsi, 0xC1C1)
        .with(Register::R12, R12_IN_A);

    let table = function_table(&context)?;
    let unwinder = Unwinder::with_config(&table, &stack, UnwinderConfig::default().with_strict_alignment(true));
    let backtrace = unwinder.walk(context)?;
    log::info!("Unwound synthetic stack:\n{backtrace}");

    let [c, b, a] = backtrace.frames.as_slice() else {
        log::error!("Expected 3 frames, unwound {}", backtrace.len());
        return Ok(false);
    };

    let mut passed = expect("c return address", c.return_address(), RET_INTO_B);
    passed &= expect("c caller rsp", c.caller.rsp(), STACK_TOP - 0x70);

    passed &= expect("b function start", b.function_start, B_START);
    passed &= expect("b return address", b.return_address(), RET_INTO_A);
    passed &= expect("b caller rsp", b.caller.rsp(), STACK_TOP - 0x30);
    passed &= expect("b caller rbx", b.caller.get(Register::Rbx), RBX_IN_A);
    passed &= expect("b caller rsi", b.caller.get(Register::Rsi), RSI_IN_A);
    passed &= expect("b caller r12", b.caller.get(Register::R12), R12_IN_A);

    passed &= expect("a function start", a.function_start, A_SECONDARY);
    passed &= expect("a return address", a.return_address(), 0);
    passed &= expect("a caller rsp", a.caller.rsp(), STACK_TOP);
    passed &= expect("a caller r12", a.caller.get(Register::R12), R12_IN_ENTRY);
    Ok(passed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::unwind::{UnwindCode, UnwindOp};

    #[test]
    fn leaf_test_passes() {
        assert!(run_leaf_test());
        assert!(unwinder_test_leaf());
    }

    #[test]
    fn full_unwind_test_passes() {
        assert!(run_full_unwind_test());
        assert!(unwinder_test_full_unwind());
    }

    #[test]
    fn encoded_records_decode_as_expected() {
        let image = image();
        let a = UnwindInfo::parse_in_image(&image, A_SECONDARY_RVA as u32).unwrap();
        assert!(a.codes.is_empty());
        let primary = a.chained.expect("chain is followed");
        assert_eq!(primary.codes, vec![
            UnwindCode::new(0x06, UnwindOp::AllocSmall { size: 0x20 }),
            UnwindCode::new(0x02, UnwindOp::PushNonVolatile(Register::R12)),
        ]);

        let b = UnwindInfo::parse_in_image(&image, B_RVA as u32).unwrap();
        assert_eq!(b.size_of_prolog, 6);
        assert_eq!(b.codes, vec![
            UnwindCode::new(0x06, UnwindOp::AllocSmall { size: 0x28 }),
            UnwindCode::new(0x02, UnwindOp::PushNonVolatile(Register::Rsi)),
            UnwindCode::new(0x01, UnwindOp::PushNonVolatile(Register::Rbx)),
        ]);
    }
}
