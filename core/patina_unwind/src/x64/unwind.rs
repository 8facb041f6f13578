//! Decodes x64 unwind data referenced from the `.pdata` section.
//!
//! Source: <https://learn.microsoft.com/en-us/cpp/build/exception-handling-x64?view=msvc-170#struct-unwind_info>
use alloc::{boxed::Box, vec::Vec};
use core::fmt;

use bitflags::bitflags;

use super::{context::Register, runtime_function::RuntimeFunction};
use crate::{
    byte_reader::ByteReader,
    error::{Error, UnwindResult},
};

/// Chained records nest at most this deep; anything deeper is treated as a cycle.
pub const MAX_CHAIN_DEPTH: usize = 32;

const UNWIND_INFO_HEADER_SIZE: usize = 4;
const UNWIND_CODE_SIZE: usize = 2;
const RUNTIME_FUNCTION_SIZE: usize = 12;

bitflags! {
    /// `UNW_FLAG_*` bits from the unwind info header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UnwindFlags: u8 {
        const EHANDLER = 0x1;
        const UHANDLER = 0x2;
        const CHAININFO = 0x4;
    }
}

/// One decoded prologue operation, operands already scaled to bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindOp {
    /// push <reg>
    PushNonVolatile(Register),
    /// sub rsp, imm32
    AllocLarge { size: u32 },
    /// sub rsp, imm8
    AllocSmall { size: u32 },
    /// lea <frame reg>, [rsp + offset]
    SetFramePointer,
    /// mov [rsp + offset], <reg>
    SaveNonVolatile { register: Register, offset: u32 },
    SaveNonVolatileFar { register: Register, offset: u32 },
    /// Version 1 only. Opcode 6 means an epilog descriptor in version 2.
    SaveXmm { register: u8, offset: u32 },
    SaveXmmFar { register: u8, offset: u32 },
    SaveXmm128 { register: u8, offset: u32 },
    SaveXmm128Far { register: u8, offset: u32 },
    /// Version 2 epilog descriptor. Describes epilog locations, not prologue effects.
    Epilog { info: u8 },
    /// Hardware interrupt or exception frame, optionally with an error code.
    PushMachineFrame { error_code: bool },
}

/// `UnwindCode`
/// Source: <https://learn.microsoft.com/en-us/cpp/build/exception-handling-x64?view=msvc-170#struct-unwind_code>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindCode {
    /// Offset from the function start of the end of the prologue instruction.
    pub prolog_offset: u8,
    pub op: UnwindOp,
}

impl UnwindCode {
    pub const fn new(prolog_offset: u8, op: UnwindOp) -> Self {
        Self { prolog_offset, op }
    }

    /// Decodes a packed unwind code array. `bytes` must cover exactly the
    /// declared code count, so an operand running past it is malformed rather
    /// than silently read from whatever follows.
    pub fn decode_all(bytes: &[u8], version: u8) -> UnwindResult<Vec<UnwindCode>> {
        let operand = |err: Error| match err {
            Error::OutOfBoundsRead { .. } => {
                Error::MalformedUnwindInfo { reason: "Unwind code operand exceeds the code count" }
            }
            other => other,
        };

        let mut codes = Vec::new();
        let mut index = 0usize;
        while index < bytes.len() {
            let prolog_offset = bytes.read8_with(&mut index).map_err(operand)?;
            let opcode_opinfo = bytes.read8_with(&mut index).map_err(operand)?;
            let opcode = opcode_opinfo & 0xF;
            let opinfo = opcode_opinfo >> 4;
            let register = || {
                Register::from_index(opinfo).ok_or(Error::MalformedUnwindInfo { reason: "Invalid register" })
            };

            let op = match opcode {
                0 => UnwindOp::PushNonVolatile(register()?),
                1 => {
                    let size = match opinfo {
                        // If the operation info equals 0, then the size of the
                        // allocation divided by 8 is recorded in the next slot,
                        // allowing an allocation up to 512K - 8.
                        0 => u32::from(bytes.read16_with(&mut index).map_err(operand)?) * 8,
                        // If the operation info equals 1, then the unscaled
                        // size of the allocation is recorded in the next two
                        // slots in little-endian format, allowing allocations
                        // up to 4GB - 8.
                        1 => bytes.read32_with(&mut index).map_err(operand)?,
                        _ => return Err(Error::MalformedUnwindInfo { reason: "Unexpected opinfo" }),
                    };
                    UnwindOp::AllocLarge { size }
                }
                2 => UnwindOp::AllocSmall { size: u32::from(opinfo) * 8 + 8 },
                3 => UnwindOp::SetFramePointer,
                4 => {
                    let offset = u32::from(bytes.read16_with(&mut index).map_err(operand)?) * 8;
                    UnwindOp::SaveNonVolatile { register: register()?, offset }
                }
                5 => {
                    let offset = bytes.read32_with(&mut index).map_err(operand)?;
                    UnwindOp::SaveNonVolatileFar { register: register()?, offset }
                }
                6 if version >= 2 => UnwindOp::Epilog { info: opinfo },
                6 => {
                    let offset = u32::from(bytes.read16_with(&mut index).map_err(operand)?) * 8;
                    UnwindOp::SaveXmm { register: opinfo, offset }
                }
                // Reserved in version 2.
                7 if version >= 2 => return Err(Error::MalformedUnwindInfo { reason: "Unexpected opcode" }),
                7 => {
                    let offset = bytes.read32_with(&mut index).map_err(operand)?;
                    UnwindOp::SaveXmmFar { register: opinfo, offset }
                }
                8 => {
                    let offset = u32::from(bytes.read16_with(&mut index).map_err(operand)?) * 16;
                    UnwindOp::SaveXmm128 { register: opinfo, offset }
                }
                9 => {
                    let offset = bytes.read32_with(&mut index).map_err(operand)?;
                    UnwindOp::SaveXmm128Far { register: opinfo, offset }
                }
                10 => match opinfo {
                    0 | 1 => UnwindOp::PushMachineFrame { error_code: opinfo == 1 },
                    _ => return Err(Error::MalformedUnwindInfo { reason: "Unexpected opinfo" }),
                },
                _ => return Err(Error::MalformedUnwindInfo { reason: "Unexpected opcode" }),
            };

            codes.push(UnwindCode { prolog_offset, op });
        }
        Ok(codes)
    }
}

/// `UnwindInfo`
/// Source: <https://learn.microsoft.com/en-us/cpp/build/exception-handling-x64?view=msvc-170#struct-unwind_info>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindInfo {
    pub version: u8,
    pub flags: UnwindFlags,
    pub size_of_prolog: u8,
    pub frame_register: Option<Register>,
    /// Already scaled by 16.
    pub frame_register_offset: u32,
    /// In unwind order: the most recent prologue action first.
    pub codes: Vec<UnwindCode>,
    /// Language-specific handler RVA when `EHANDLER` or `UHANDLER` is set.
    pub handler_rva: Option<u32>,
    /// Raw chain reference when `CHAININFO` is set.
    pub chained_function: Option<RuntimeFunction>,
    /// The chained record, once resolved against the image or supplied directly.
    pub chained: Option<Box<UnwindInfo>>,
}

impl fmt::Display for UnwindInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UnwindInfo {{ version: 0x{:02X}, flags: 0x{:02X}, size_of_prolog: 0x{:02X}, count_of_unwind_codes: 0x{:02X}, frame_register: {}, frame_register_offset: 0x{:08X} }}",
            self.version,
            self.flags.bits(),
            self.size_of_prolog,
            self.codes.len(),
            self.frame_register.map(Register::name).unwrap_or("none"),
            self.frame_register_offset
        )
    }
}

impl UnwindInfo {
    /// Builds a version 1 record from already decoded codes.
    pub fn new(size_of_prolog: u8, codes: Vec<UnwindCode>) -> Self {
        Self {
            version: 1,
            flags: UnwindFlags::empty(),
            size_of_prolog,
            frame_register: None,
            frame_register_offset: 0,
            codes,
            handler_rva: None,
            chained_function: None,
            chained: None,
        }
    }

    pub fn with_frame_register(mut self, register: Register, offset: u32) -> Self {
        self.frame_register = Some(register);
        self.frame_register_offset = offset;
        self
    }

    /// Attaches a chained record that continues this one.
    pub fn with_chained(mut self, chained: UnwindInfo) -> Self {
        self.flags |= UnwindFlags::CHAININFO;
        self.chained = Some(Box::new(chained));
        self
    }

    /// A record with nothing to undo behaves like a leaf.
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty() && !self.flags.contains(UnwindFlags::CHAININFO)
    }

    /// Parses one unwind info record. A chain reference is decoded but not
    /// followed; see [`UnwindInfo::parse_in_image`].
    pub fn parse(bytes: &[u8]) -> UnwindResult<UnwindInfo> {
        let header = |err: Error| match err {
            Error::OutOfBoundsRead { .. } => Error::MalformedUnwindInfo { reason: "Truncated unwind info" },
            other => other,
        };

        let mut offset = 0usize;
        let byte = bytes.read8_with(&mut offset).map_err(header)?;
        let version = byte & 0b111;
        let flags = UnwindFlags::from_bits_retain(byte >> 3);

        if version != 1 && version != 2 {
            return Err(Error::MalformedUnwindInfo { reason: "Unsupported unwind code version" });
        }

        let size_of_prolog = bytes.read8_with(&mut offset).map_err(header)?;
        let count_of_unwind_codes = bytes.read8_with(&mut offset).map_err(header)? as usize;
        let frame = bytes.read8_with(&mut offset).map_err(header)?;
        let frame_register = match frame & 0xF {
            0 => None,
            register => Register::from_index(register),
        };
        let frame_register_offset = u32::from(frame >> 4) * 16;

        let codes_end = UNWIND_INFO_HEADER_SIZE + count_of_unwind_codes * UNWIND_CODE_SIZE;
        let Some(code_bytes) = bytes.get(UNWIND_INFO_HEADER_SIZE..codes_end) else {
            return Err(Error::MalformedUnwindInfo { reason: "Malformed unwind code bytes" });
        };
        let codes = UnwindCode::decode_all(code_bytes, version)?;

        // The code array is padded to an even number of slots.
        let trailer = UNWIND_INFO_HEADER_SIZE + count_of_unwind_codes.next_multiple_of(2) * UNWIND_CODE_SIZE;
        let truncated = |_| Error::MalformedUnwindInfo { reason: "Truncated unwind info trailer" };

        let mut handler_rva = None;
        let mut chained_function = None;
        if flags.contains(UnwindFlags::CHAININFO) {
            let Some(entry) = bytes.get(trailer..trailer + RUNTIME_FUNCTION_SIZE) else {
                return Err(Error::MalformedUnwindInfo { reason: "Truncated chained function entry" });
            };
            chained_function = Some(RuntimeFunction::parse(entry).map_err(truncated)?);
        } else if flags.intersects(UnwindFlags::EHANDLER | UnwindFlags::UHANDLER) {
            handler_rva = Some(bytes.read32(trailer).map_err(truncated)?);
        }

        let info = Self {
            version,
            flags,
            size_of_prolog,
            frame_register,
            frame_register_offset,
            codes,
            handler_rva,
            chained_function,
            chained: None,
        };
        log::debug!("{info}");
        Ok(info)
    }

    /// Parses the record at `rva` inside a mapped image and follows its chain.
    pub fn parse_in_image(image: &[u8], rva: u32) -> UnwindResult<UnwindInfo> {
        Self::parse_chain(image, rva, 0)
    }

    fn parse_chain(image: &[u8], rva: u32, depth: usize) -> UnwindResult<UnwindInfo> {
        if depth > MAX_CHAIN_DEPTH {
            return Err(Error::MalformedUnwindInfo { reason: "Chained unwind info is too deep or cyclic" });
        }

        let Some(bytes) = image.get(rva as usize..) else {
            return Err(Error::MalformedUnwindInfo { reason: "Unwind info lies outside the image" });
        };

        let mut info = Self::parse(bytes)?;
        if let Some(function) = &info.chained_function {
            let chained = Self::parse_chain(image, function.unwind_info_rva, depth + 1)?;
            info.chained = Some(Box::new(chained));
        }
        Ok(info)
    }
}
