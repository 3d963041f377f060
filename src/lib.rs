//! Embeddable BASIC runtime: one-pass compiler to stack-machine
//! bytecode, linker, peephole optimizer and time-sliced interpreter.

pub mod debug;
pub mod image;
pub mod interpreter;
pub mod linker;
pub mod optimizer;
pub mod parser;
