//! Error codes for the patina_unwind crate
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
use core::fmt;

use crate::x64::context::RegisterContext;

/// The error type for unwind operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Attempted to read past the end of a backing buffer while decoding structured data.
    OutOfBoundsRead {
        /// Position in the buffer that triggered the out-of-bounds access.
        index: usize,
    },

    /// The instruction pointer is not covered by any known function and is not a sentinel.
    UnresolvedAddress {
        /// Instruction pointer that failed to resolve.
        rip: u64,
    },

    /// The unwind metadata is inconsistent with its declared structure.
    MalformedUnwindInfo {
        /// Static description of why the data is considered malformed.
        reason: &'static str,
    },

    /// The PE image headers are inconsistent or unsupported.
    MalformedImage {
        /// Static description of why the image is considered malformed.
        reason: &'static str,
    },

    /// The target PE image does not expose an exception directory.
    ExceptionDirectoryNotFound,

    /// The stack memory backing the unwind could not provide a word at the given address.
    StackReadFault {
        /// Address that could not be read.
        address: u64,
    },

    /// More frames were unwound than the configured safety bound.
    FrameLimitExceeded {
        /// The configured bound.
        limit: usize,
    },

    /// The recovered stack pointer violates the ABI alignment at a call boundary.
    MisalignedStack {
        /// Offending stack pointer.
        rsp: u64,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::OutOfBoundsRead { index } => write!(fmt, "Attempted to read past buffer bounds at index {index}"),
            Error::UnresolvedAddress { rip } => {
                write!(fmt, "No function entry covers rip: {rip:X}")
            }
            Error::MalformedUnwindInfo { reason } => write!(fmt, "Malformed unwind info: {reason}"),
            Error::MalformedImage { reason } => write!(fmt, "Malformed PE image: {reason}"),
            Error::ExceptionDirectoryNotFound => write!(
                fmt,
                "Exception directory not found. Make sure to build with RUSTFLAGS=-Cforce-unwind-tables"
            ),
            Error::StackReadFault { address } => write!(fmt, "Failed to read stack memory at {address:X}"),
            Error::FrameLimitExceeded { limit } => write!(fmt, "Unwound more than {limit} frames"),
            Error::MisalignedStack { rsp } => write!(fmt, "Stack pointer {rsp:X} is not 16-byte aligned"),
        }
    }
}

/// A specialized result type for the patina_unwind crate.
pub type UnwindResult<T> = Result<T, Error>;

/// A failed walk: the error plus where it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameError {
    /// What went wrong.
    pub error: Error,

    /// Index of the frame that could not be unwound.
    pub frame_index: usize,

    /// The register state at the last frame boundary that was fully resolved.
    pub last_good: RegisterContext,
}

impl fmt::Display for FrameError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "frame {} (rip: {:016X}, rsp: {:016X}): {}",
            self.frame_index,
            self.last_good.rip,
            self.last_good.rsp(),
            self.error
        )
    }
}

impl Error {
    /// Tag the error with the frame index and the last known-good register state.
    pub fn at_frame(self, frame_index: usize, last_good: &RegisterContext) -> FrameError {
        FrameError { error: self, frame_index, last_good: *last_good }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::context::Register;

    fn assert_display(err: Error, expected: &str) {
        assert_eq!(format!("{err}"), expected);
    }

    #[test]
    fn out_of_bounds_display() {
        assert_display(Error::OutOfBoundsRead { index: 5 }, "Attempted to read past buffer bounds at index 5");
    }

    #[test]
    fn unresolved_address_display() {
        assert_display(Error::UnresolvedAddress { rip: 0x1234 }, "No function entry covers rip: 1234");
    }

    #[test]
    fn malformed_display() {
        assert_display(Error::MalformedUnwindInfo { reason: "bad" }, "Malformed unwind info: bad");
        assert_display(Error::MalformedImage { reason: "bad" }, "Malformed PE image: bad");
    }

    #[test]
    fn exception_directory_display() {
        assert_display(
            Error::ExceptionDirectoryNotFound,
            "Exception directory not found. Make sure to build with RUSTFLAGS=-Cforce-unwind-tables",
        );
    }

    #[test]
    fn walk_errors_display() {
        assert_display(Error::StackReadFault { address: 0xFF0 }, "Failed to read stack memory at FF0");
        assert_display(Error::FrameLimitExceeded { limit: 4 }, "Unwound more than 4 frames");
        assert_display(Error::MisalignedStack { rsp: 0x1008 }, "Stack pointer 1008 is not 16-byte aligned");
    }

    #[test]
    fn at_frame_captures_last_good_state() {
        let context = RegisterContext::new(0x1000, 0x8000).with(Register::Rbx, 0x55);

        let failure = Error::UnresolvedAddress { rip: 0xBAD }.at_frame(3, &context);
        assert_eq!(failure.frame_index, 3);
        assert_eq!(failure.last_good, context);
        assert_eq!(failure.error, Error::UnresolvedAddress { rip: 0xBAD });
        assert_eq!(
            format!("{failure}"),
            "frame 3 (rip: 0000000000001000, rsp: 0000000000008000): No function entry covers rip: BAD"
        );
    }
}
