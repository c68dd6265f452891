//! GDB (GNU Debugger) MI Interface Module

pub mod types;
pub mod error;
pub mod parser;
pub mod transport;
pub mod channel;
pub mod router;
pub mod debugger;
pub mod stack;
pub mod locals;
pub mod varobj;

#[cfg(test)]
pub(crate) mod testing;

pub use debugger::GdbDebugger;
pub use error::{GdbError, ParseError, Result, TransportError};
pub use transport::{timeout_handler, MiTransport, ProcessTransport, ReadMode, TimeoutHandler};
pub use types::*;
pub use varobj::VariableObject;
