//! # x64 Unwind Library
//!
//! ## Introduction
//!
//! This library walks x64 call stacks that follow the Windows x64 calling
//! convention. Given a register snapshot, it uses the unwind metadata that the
//! compiler records for every non-leaf function (the `.pdata` and `.xdata`
//! sections of a PE image) to recover the register state of each caller in
//! turn, until the stack base is reached.
//!
//! Unwinding one frame means locating the function that owns `rip`, undoing
//! the effects of its prologue in reverse (pushes, stack allocations, frame
//! pointer setup and register saves), and popping the return address. Functions
//! without unwind metadata are leaves: they only consumed the return address.
//!
//! ```text
//!       # Child-SP              Return Address         Call Site
//!       0 00000000001FFF88      0000000000002045       3000+8
//!       1 00000000001FFF90      0000000000001825       2000+45
//!       2 00000000001FFFD0      0000000000000000       1800+25
//! ```
//!
//! ## Prerequisites
//!
//! Compile every image that should be walkable with unwind tables:
//!
//! `RUSTFLAGS=-Cforce-unwind-tables`
//!
//! ## Public API
//!
//! - [`FunctionTable`] maps addresses to function entries. Build it from
//!   explicit [`FunctionEntry`] values or from loaded PE images. It is
//!   read-only once built and can be shared by any number of unwinders.
//! - [`Unwinder`] performs single steps ([`Unwinder::step`]), lazy walks
//!   ([`Unwinder::frames`]) and complete walks ([`Unwinder::walk`]) over any
//!   [`StackMemory`].
//! - [`ContextCapture`] supplies the starting [`RegisterContext`];
//!   [`LiveCapture`] snapshots the running thread on x86_64.
//! - [`run_leaf_test`] and [`run_full_unwind_test`] verify the engine against
//!   synthetic stacks and are exported with C linkage.
//!
//! ## API usage
//!
//! ```ignore
//!     // Inside an exception handler
//!     let table = FunctionTable::builder().image(&unsafe { PE::from_base_address(image_base) }?)?.build()?;
//!     let context = RegisterContext::from(&machine_context);
//!     let unwinder = Unwinder::new(&table, unsafe { LiveMemory::new() });
//!     match unwinder.walk(context) {
//!         Ok(backtrace) => log::error!("{backtrace}"),
//!         Err(err) => log::error!("Stack walk stopped at {err}"),
//!     }
//! ```
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0

#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

extern crate alloc;

mod byte_reader;
pub mod config;
pub mod error;
pub mod memory;
pub mod pe;
pub mod unwinder;
pub mod verification;
pub mod x64;

pub use config::UnwinderConfig;
pub use error::{Error, FrameError, UnwindResult};
pub use memory::{LiveMemory, SimulatedStack, StackMemory};
pub use pe::PE;
pub use unwinder::{Backtrace, Frame, Frames, Unwinder};
pub use verification::{run_full_unwind_test, run_leaf_test};
pub use x64::{
    capture::ContextCapture,
    context::{MachineContext, Register, RegisterContext},
    runtime_function::{FunctionEntry, FunctionTable, RuntimeFunction},
    unwind::{UnwindCode, UnwindFlags, UnwindInfo, UnwindOp},
};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use x64::capture::LiveCapture;
    }
}
