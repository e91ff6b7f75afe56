//! Error taxonomy surfaced to the host.

use thiserror::Error;

use crate::core::types::C8Addr;

/// Every fatal condition the core can encounter while decoding or executing
/// an instruction, or while loading host-supplied data.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum CoreError {
    /// `RET` executed with an empty call stack.
    #[error("stack underflow: RET at pc {pc:04X} with an empty call stack")]
    StackUnderflow {
        /// Program counter of the offending `RET`.
        pc: C8Addr,
    },

    /// `CALL` executed with the call stack already at capacity.
    #[error("stack overflow: CALL at pc {pc:04X} exceeds capacity {capacity}")]
    StackOverflow {
        /// Program counter of the offending `CALL`.
        pc: C8Addr,
        /// Stack capacity.
        capacity: usize,
    },

    /// A read or write touched an address at or beyond RAM size.
    #[error("memory out of range: address {address:04X} beyond RAM size {ram_size}")]
    MemoryOutOfRange {
        /// Offending address.
        address: usize,
        /// RAM size in bytes.
        ram_size: usize,
    },

    /// The fetched instruction word does not decode to any known opcode.
    #[error("unknown opcode {opcode:04X} at pc {pc:04X}")]
    UnknownOpcode {
        /// Offending instruction word.
        opcode: C8Addr,
        /// Program counter the word was fetched from.
        pc: C8Addr,
    },

    /// `load_rom` was given a program larger than the available program area.
    #[error("ROM too large: {size} bytes exceeds capacity {capacity}")]
    RomTooLarge {
        /// Size of the rejected ROM, in bytes.
        size: usize,
        /// Maximum accepted size, in bytes.
        capacity: usize,
    },

    /// A `SYS addr` (0nnn, not CLS/RET) instruction was executed.
    #[error("unimplemented SYS call {opcode:04X} at pc {pc:04X}")]
    UnimplementedSys {
        /// Offending instruction word.
        opcode: C8Addr,
        /// Program counter the word was fetched from.
        pc: C8Addr,
    },
}

impl CoreError {
    /// Build a [`CoreError::MemoryOutOfRange`] for an access of `len` bytes
    /// starting at `offset`, against a RAM of size `ram_size`.
    ///
    /// # Arguments
    ///
    /// * `offset` - Starting address of the access.
    /// * `len` - Number of bytes touched.
    /// * `ram_size` - Total RAM size.
    pub(crate) fn memory_out_of_range(offset: C8Addr, len: usize, ram_size: usize) -> CoreError {
        CoreError::MemoryOutOfRange {
            address: offset as usize + len,
            ram_size,
        }
    }
}

/// Convenience alias kept short to avoid `Result<T, CoreError>` clutter at
/// call sites throughout `machine` and `core`.
pub type CoreResult<T> = Result<T, CoreError>;
