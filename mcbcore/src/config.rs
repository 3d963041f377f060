//! Capacity constants of the embedding. Small on purpose, the target
//! hosts are microcontrollers.

/// Bytes of code store.
pub const CODE_MEM: usize = 8192;
/// Bytes of string pool.
pub const STRING_MEM: usize = 1024;
/// Evaluation stack cells.
pub const STACK_SIZE: usize = 256;
/// Identifier length bound.
pub const MAX_NAME: usize = 16;
/// Lexer window, one word plus boundary characters.
pub const LOOKAHEAD: usize = MAX_NAME + 2;
/// Register table capacity.
pub const MAX_REG_NUM: usize = 16;
/// Service table capacity.
pub const MAX_SVC_NUM: usize = 16;
/// Parse-time variable table capacity.
pub const MAX_VAR_NUM: usize = 64;
/// Label table capacity, named labels plus synthetic loop exits.
pub const MAX_LABEL_NUM: usize = 32;
/// Sub table capacity.
pub const MAX_SUB_NUM: usize = 16;
/// Optimizer bound when following GOTO chains.
pub const GOTO_CHAIN_MAX: usize = 100;
