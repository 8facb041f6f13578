use alloc::vec::Vec;
use core::fmt;

use crate::{
    config::UnwinderConfig,
    error::{Error, FrameError, UnwindResult},
    memory::StackMemory,
    x64::{
        capture::ContextCapture,
        context::RegisterContext,
        runtime_function::FunctionTable,
        unwind::{UnwindCode, UnwindFlags, UnwindInfo, UnwindOp},
    },
};

const WORD: u64 = core::mem::size_of::<u64>() as u64;

/// One unwound frame: the callee state and the caller state recovered from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Register state inside the unwound function.
    pub context: RegisterContext,

    /// Start of the function owning `context.rip`.
    pub function_start: u64,

    /// Register state of the caller right after the call returns.
    pub caller: RegisterContext,
}

impl Frame {
    pub fn return_address(&self) -> u64 {
        self.caller.rip
    }
}

/// Walks x64 call stacks using a shared [`FunctionTable`].
///
/// The table is only read, so any number of unwinders (one per inspected
/// thread, say) can share it. Each unwinder owns its stack memory view.
pub struct Unwinder<'t, M> {
    table: &'t FunctionTable,
    memory: M,
    config: UnwinderConfig,
}

impl<'t, M: StackMemory> Unwinder<'t, M> {
    pub fn new(table: &'t FunctionTable, memory: M) -> Self {
        Self::with_config(table, memory, UnwinderConfig::default())
    }

    pub fn with_config(table: &'t FunctionTable, memory: M, config: UnwinderConfig) -> Self {
        Self { table, memory, config }
    }

    pub fn config(&self) -> &UnwinderConfig {
        &self.config
    }

    /// Unwinds one frame in place.
    ///
    /// Returns `Ok(None)` without touching `context` when `context.rip` is a
    /// stack-base sentinel. On error `context` is left unchanged.
    pub fn step(&self, context: &mut RegisterContext) -> UnwindResult<Option<Frame>> {
        if self.config.is_sentinel(context.rip) {
            return Ok(None);
        }

        let frame = self.unwind_frame(context)?;
        log::debug!("Unwound {} -> {}", frame.context, frame.caller);
        *context = frame.caller;
        Ok(Some(frame))
    }

    /// Iterates the frames above `context`, one unwind step per item.
    pub fn frames(&self, context: RegisterContext) -> Frames<'_, 't, M> {
        Frames { unwinder: self, context, index: 0, done: false }
    }

    /// Unwinds until a sentinel is reached.
    pub fn walk(&self, context: RegisterContext) -> Result<Backtrace, FrameError> {
        log::debug!("Walking stack from {context}");
        let frames = self.frames(context).collect::<Result<Vec<_>, _>>()?;
        Ok(Backtrace { frames })
    }

    /// Captures the current context with `capture` and walks from it.
    pub fn walk_from(&self, capture: &impl ContextCapture) -> Result<Backtrace, FrameError> {
        self.walk(capture.capture())
    }

    fn unwind_frame(&self, context: &RegisterContext) -> UnwindResult<Frame> {
        let function = self.table.resolve(context.rip)?;
        let mut caller = *context;

        let machine_frame = match function.unwind_info {
            Some(info) if !function.is_leaf() => self.replay(info, Some(context.rip - function.start), &mut caller)?,
            _ => false,
        };

        // A machine frame already restored rip and rsp from the interrupt frame.
        if !machine_frame {
            let return_address = self.memory.read_u64(caller.rsp())?;
            caller.rip = return_address;
            caller.set_rsp(caller.rsp().wrapping_add(WORD));

            if !caller.is_call_boundary_aligned() {
                if self.config.strict_alignment {
                    return Err(Error::MisalignedStack { rsp: caller.rsp() });
                }
                log::warn!("Caller stack pointer {:016X} is not 16-byte aligned", caller.rsp());
            }
        }

        Ok(Frame { context: *context, function_start: function.start, caller })
    }

    /// Undoes the prologue effects recorded in `info` and any chained record.
    /// `function_offset` is `None` for chained records, whose prologue always
    /// completed. Returns whether a machine frame was popped.
    fn replay(
        &self,
        info: &UnwindInfo,
        function_offset: Option<u64>,
        context: &mut RegisterContext,
    ) -> UnwindResult<bool> {
        let in_prolog = function_offset.filter(|&offset| offset < u64::from(info.size_of_prolog));
        let executed = |code: &UnwindCode| in_prolog.map_or(true, |offset| u64::from(code.prolog_offset) <= offset);

        // Save slots are addressed from the establisher frame: the frame
        // register minus its offset once it is set, otherwise rsp.
        let frame_pointer_set =
            info.codes.iter().any(|code| code.op == UnwindOp::SetFramePointer && executed(code));
        let frame_base = match info.frame_register {
            Some(register) if frame_pointer_set || in_prolog.is_none() => {
                context.get(register).wrapping_sub(u64::from(info.frame_register_offset))
            }
            _ => context.rsp(),
        };

        let mut machine_frame = false;
        for code in info.codes.iter().filter(|code| executed(code)) {
            match code.op {
                UnwindOp::PushNonVolatile(register) => {
                    let rsp = context.rsp();
                    let value = self.memory.read_u64(rsp)?;
                    context.set(register, value);
                    context.set_rsp(rsp.wrapping_add(WORD));
                }
                UnwindOp::AllocLarge { size } | UnwindOp::AllocSmall { size } => {
                    context.set_rsp(context.rsp().wrapping_add(u64::from(size)));
                }
                UnwindOp::SetFramePointer => {
                    let Some(register) = info.frame_register else {
                        return Err(Error::MalformedUnwindInfo { reason: "SET_FPREG without a frame register" });
                    };
                    context.set_rsp(context.get(register).wrapping_sub(u64::from(info.frame_register_offset)));
                }
                UnwindOp::SaveNonVolatile { register, offset } | UnwindOp::SaveNonVolatileFar { register, offset } => {
                    let value = self.memory.read_u64(frame_base.wrapping_add(u64::from(offset)))?;
                    context.set(register, value);
                }
                // Vector state is not tracked and epilog descriptors have no
                // prologue effect to undo.
                UnwindOp::SaveXmm { .. }
                | UnwindOp::SaveXmmFar { .. }
                | UnwindOp::SaveXmm128 { .. }
                | UnwindOp::SaveXmm128Far { .. }
                | UnwindOp::Epilog { .. } => (),
                UnwindOp::PushMachineFrame { error_code } => {
                    let mut rsp = context.rsp();
                    if error_code {
                        rsp = rsp.wrapping_add(WORD);
                    }
                    // RIP, CS, RFLAGS, RSP, SS from the lowest address up.
                    context.rip = self.memory.read_u64(rsp)?;
                    context.set_rsp(self.memory.read_u64(rsp.wrapping_add(3 * WORD))?);
                    machine_frame = true;
                }
            }
        }

        if info.flags.contains(UnwindFlags::CHAININFO) {
            let Some(chained) = info.chained.as_deref() else {
                return Err(Error::MalformedUnwindInfo { reason: "Chained unwind info was not resolved" });
            };
            machine_frame |= self.replay(chained, None, context)?;
        }

        Ok(machine_frame)
    }
}

/// Iterator returned by [`Unwinder::frames`].
pub struct Frames<'u, 't, M> {
    unwinder: &'u Unwinder<'t, M>,
    context: RegisterContext,
    index: usize,
    done: bool,
}

impl<M: StackMemory> Frames<'_, '_, M> {
    /// The register state at the current frame boundary.
    pub fn context(&self) -> &RegisterContext {
        &self.context
    }
}

impl<M: StackMemory> Iterator for Frames<'_, '_, M> {
    type Item = Result<Frame, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if self.unwinder.config.is_sentinel(self.context.rip) {
            self.done = true;
            return None;
        }

        // Kill switch for cyclic or corrupted stacks.
        if self.index >= self.unwinder.config.max_frames {
            self.done = true;
            let limit = self.unwinder.config.max_frames;
            return Some(Err(Error::FrameLimitExceeded { limit }.at_frame(self.index, &self.context)));
        }

        match self.unwinder.step(&mut self.context) {
            Ok(Some(frame)) => {
                if frame.caller.rip == frame.context.rip && frame.caller.rsp() == frame.context.rsp() {
                    log::warn!("Frame {} did not advance. Possible stack corruption.", self.index);
                }
                self.index += 1;
                Some(Ok(frame))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(error) => {
                self.done = true;
                Some(Err(error.at_frame(self.index, &self.context)))
            }
        }
    }
}

/// The frames of a completed walk, innermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backtrace {
    pub frames: Vec<Frame>,
}

impl Backtrace {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn return_addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.frames.iter().map(Frame::return_address)
    }
}

impl fmt::Display for Backtrace {
    /// ```text
    ///       # Child-SP              Return Address         Call Site
    ///       0 00000000000FFF88      0000000000002045       2000+10
    ///       1 00000000000FFFC8      0000000000001825       1800+25
    /// ```
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "      # Child-SP              Return Address         Call Site")?;
        for (i, frame) in self.frames.iter().enumerate() {
            writeln!(
                f,
                "     {i:>2} {:016X}      {:016X}       {:X}+{:X}",
                frame.context.rsp(),
                frame.return_address(),
                frame.function_start,
                frame.context.rip - frame.function_start
            )?;
        }
        Ok(())
    }
}
