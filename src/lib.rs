//! gdbmi-session
//!
//! Drives GDB over its machine interface: parses MI output, correlates
//! replies with commands by token and keeps a debugging session (execution
//! state, stack, locals, breakpoints, variable objects) in sync with GDB.

pub mod gdb;
