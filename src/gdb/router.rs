//! Out-of-band and stream record routing

use crate::gdb::debugger::GdbDebugger;
use crate::gdb::parser::{parse_async_tail, parse_breakpoint, parse_stream_text};
use crate::gdb::types::*;
use tracing::{debug, info, warn};

/// What a non-result record means for the session
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Stopped(MiHash),
    Running,
    BreakpointChanged(Breakpoint),
    BreakpointDeleted(String),
    Stream { sigil: Sigil, text: String },
    /// Known but uninteresting (`+` status, thread and library notices)
    Logged(String),
    Unimplemented(String),
    Malformed(String),
}

/// Classify a queued record that is not a result record
pub fn classify(record: &PendingRecord) -> Route {
    if record.sigil.is_stream() {
        return match parse_stream_text(&record.tail) {
            Ok(text) => Route::Stream {
                sigil: record.sigil,
                text,
            },
            Err(e) => Route::Malformed(format!("{}{}: {}", record.sigil.as_char(), record.tail, e)),
        };
    }

    let (class, body) = match parse_async_tail(&record.tail) {
        Ok(parsed) => parsed,
        Err(e) => {
            return Route::Malformed(format!("{}{}: {}", record.sigil.as_char(), record.tail, e))
        }
    };

    match (record.sigil, class.as_str()) {
        (Sigil::Exec, "stopped") => Route::Stopped(body),
        (Sigil::Exec, "running") => Route::Running,
        (Sigil::Notify, "breakpoint-created") | (Sigil::Notify, "breakpoint-modified") => {
            match body
                .get("bkpt")
                .and_then(MiValue::as_hash)
                .and_then(parse_breakpoint)
            {
                Some(bp) => Route::BreakpointChanged(bp),
                None => Route::Malformed(format!("={} without a breakpoint", class)),
            }
        }
        (Sigil::Notify, "breakpoint-deleted") => {
            match body.get_str("id").or_else(|| body.get_str("number")) {
                Some(id) => Route::BreakpointDeleted(id.to_string()),
                None => Route::Malformed("=breakpoint-deleted without an id".to_string()),
            }
        }
        (Sigil::Status, _) => Route::Logged(format!("+{}", class)),
        (Sigil::Notify, c)
            if c.starts_with("thread-")
                || c.starts_with("library-")
                || c == "cmd-param-changed"
                || c == "memory-changed" =>
        {
            Route::Logged(format!("={}", c))
        }
        (sigil, c) => Route::Unimplemented(format!("{}{}", sigil.as_char(), c)),
    }
}

impl GdbDebugger {
    /// Act on one out-of-band or stream record
    pub(crate) fn route_record(&mut self, record: &PendingRecord) {
        match classify(record) {
            Route::Stopped(body) => self.on_stopped(&body),
            Route::Running => self.enter_running(),
            Route::BreakpointChanged(bp) => self.upsert_breakpoint(bp),
            Route::BreakpointDeleted(number) => self.remove_breakpoint(&number),
            Route::Stream { sigil, text } => {
                let text = text.trim_end_matches('\n');
                match sigil {
                    Sigil::Console => info!("GDB: {}", text),
                    Sigil::Target => debug!("Target: {}", text),
                    _ => debug!("GDB log: {}", text),
                }
            }
            Route::Logged(what) => debug!("Ignoring {}", what),
            Route::Unimplemented(what) => warn!("Unimplemented MI record: {}", what),
            Route::Malformed(what) => warn!("Malformed MI record: {}", what),
        }
    }
}
