//! CHIP-8 core.

#![warn(missing_docs)]

pub mod core;
pub mod error;
pub mod machine;
pub mod peripherals;
pub mod quirks;

pub use error::CoreError;
pub use machine::Machine;
pub use quirks::Quirks;
