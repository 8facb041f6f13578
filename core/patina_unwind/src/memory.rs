//! Stack memory the unwinder reads return addresses and saved registers from.
use alloc::collections::BTreeMap;

use crate::error::{Error, UnwindResult};

/// Reads 64-bit words from the stack being unwound.
pub trait StackMemory {
    fn read_u64(&self, address: u64) -> UnwindResult<u64>;
}

impl<M: StackMemory + ?Sized> StackMemory for &M {
    fn read_u64(&self, address: u64) -> UnwindResult<u64> {
        (**self).read_u64(address)
    }
}

/// A stack built word by word, growing down from `top` the way `call`,
/// `push` and `sub rsp` grow a real one.
///
/// Addresses between the lowest stack pointer reached and `top` read as
/// zero unless written; everything else faults.
#[derive(Debug, Clone)]
pub struct SimulatedStack {
    top: u64,
    rsp: u64,
    words: BTreeMap<u64, u64>,
}

impl SimulatedStack {
    /// `top` is the exclusive upper bound of the stack.
    pub fn new(top: u64) -> Self {
        Self { top, rsp: top, words: BTreeMap::new() }
    }

    pub fn rsp(&self) -> u64 {
        self.rsp
    }

    pub fn push(&mut self, value: u64) -> &mut Self {
        self.rsp = self.rsp.wrapping_sub(8);
        self.words.insert(self.rsp, value);
        self
    }

    /// Models `call`: pushes the return address.
    pub fn call(&mut self, return_address: u64) -> &mut Self {
        self.push(return_address)
    }

    /// Models `sub rsp, size`.
    pub fn allocate(&mut self, size: u64) -> &mut Self {
        self.rsp = self.rsp.wrapping_sub(size);
        self
    }

    /// Stores `value` at `rsp + offset`, the way `mov [rsp + offset], reg` does.
    pub fn store(&mut self, offset: u64, value: u64) -> &mut Self {
        self.words.insert(self.rsp.wrapping_add(offset), value);
        self
    }

    /// Overwrites the word at `address`.
    pub fn write(&mut self, address: u64, value: u64) -> &mut Self {
        self.words.insert(address, value);
        self
    }
}

impl StackMemory for SimulatedStack {
    fn read_u64(&self, address: u64) -> UnwindResult<u64> {
        let lowest = self.words.keys().next().map_or(self.rsp, |&first| first.min(self.rsp));
        if address % 8 != 0 || address < lowest || address.checked_add(8).map_or(true, |end| end > self.top) {
            return Err(Error::StackReadFault { address });
        }
        Ok(self.words.get(&address).copied().unwrap_or(0))
    }
}

/// Reads the stack of the running thread directly.
#[derive(Debug)]
pub struct LiveMemory {
    _private: (),
}

impl LiveMemory {
    /// # Safety
    ///
    /// Every address the unwinder derives from the captured context must be
    /// mapped and readable while this value is in use. Unwinding a live stack
    /// is only sound while the frames being walked stay intact.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl StackMemory for LiveMemory {
    fn read_u64(&self, address: u64) -> UnwindResult<u64> {
        if address == 0 || address % 8 != 0 {
            return Err(Error::StackReadFault { address });
        }

        // SAFETY: `LiveMemory::new` obliges the caller to keep every derived
        // stack address readable, and the address is non-null and 8-byte aligned.
        Ok(unsafe { core::ptr::read(address as *const u64) })
    }
}
