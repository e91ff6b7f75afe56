//! Peripherals: devices the CPU drives but does not itself decode.

pub mod keypad;
pub mod screen;
