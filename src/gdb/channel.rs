//! Command channel: token allocation, handler registry and the pending
//! record queue shared by the polling and blocking read paths.

use crate::gdb::debugger::GdbDebugger;
use crate::gdb::error::{GdbError, TransportError};
use crate::gdb::parser::{error_message, lex_line, parse_result_record, LexedLine};
use crate::gdb::transport::{MiTransport, ReadMode, TimeoutHandler};
use crate::gdb::types::*;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, error, info, warn};

/// Outcome of a command as seen by its completion
pub type MiReply = Result<ResultRecord, GdbError>;

/// Invoked once with the session and the command's result record
pub type Completion = Box<dyn FnOnce(&mut GdbDebugger, MiReply)>;

/// What the registry holds for a token when its result record shows up
pub(crate) enum HandlerSlot {
    Callback(Completion),
    /// A blocking waiter owns the token; the record must stay queued
    Claimed,
    Missing,
}

pub struct MiChannel {
    transport: Option<Box<dyn MiTransport>>,
    next_token: u64,
    queue: VecDeque<PendingRecord>,
    /// `None` marks a token claimed by a synchronous waiter
    handlers: HashMap<u64, Option<Completion>>,
    failure: Option<TransportError>,
}

impl Default for MiChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MiChannel {
    pub fn new() -> Self {
        Self {
            transport: None,
            next_token: 1,
            queue: VecDeque::new(),
            handlers: HashMap::new(),
            failure: None,
        }
    }

    pub fn attach(&mut self, transport: Box<dyn MiTransport>) {
        self.kill();
        self.failure = None;
        self.transport = Some(transport);
    }

    /// Forward to the live transport, if any
    pub fn set_timeout_handler(&mut self, handler: Option<TimeoutHandler>) {
        if let Some(transport) = self.transport.as_mut() {
            transport.set_timeout_handler(handler);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Shut the transport down. Later sends are no-ops returning 0.
    pub fn kill(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.shutdown();
        }
    }

    /// Drop every queued record and registered handler
    pub fn clear(&mut self) {
        self.queue.clear();
        self.handlers.clear();
    }

    /// A write failure recorded by `send_command`, if any
    pub fn take_failure(&mut self) -> Option<TransportError> {
        self.failure.take()
    }

    /// Send `text` under a fresh token and return it.
    ///
    /// With `completion` the reply is delivered by the next drain; without
    /// one the token is claimed for `wait_for`. Returns 0 and does nothing
    /// when there is no live transport.
    pub fn send_command(&mut self, text: &str, completion: Option<Completion>) -> u64 {
        let Some(transport) = self.transport.as_mut() else {
            debug!("Not connected, dropping command: {}", text);
            return 0;
        };

        let token = self.next_token;
        self.next_token += 1;

        let line = format!("{}{}", token, text);
        debug!("Sending command: {}", line);
        if let Err(e) = transport.write_line(&line) {
            error!("Failed to send command to GDB: {}", e);
            self.failure = Some(e);
            self.kill();
            return 0;
        }

        if !self.register(token, completion) {
            return 0;
        }
        token
    }

    /// Register the handler for `token`; refuses a token that already has one
    pub(crate) fn register(&mut self, token: u64, completion: Option<Completion>) -> bool {
        use std::collections::hash_map::Entry;
        match self.handlers.entry(token) {
            Entry::Occupied(_) => {
                warn!("Token {} already has a handler", token);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(completion);
                true
            }
        }
    }

    pub fn has_handler(&self, token: u64) -> bool {
        self.handlers.contains_key(&token)
    }

    /// Read one line and queue it if it is a record.
    ///
    /// Returns `Ok(false)` only in poll mode when nothing was ready.
    pub fn read_next_line(&mut self, mode: ReadMode) -> Result<bool, TransportError> {
        let transport = self.transport.as_mut().ok_or(TransportError::Closed)?;
        let Some(line) = transport.read_line(mode)? else {
            return Ok(false);
        };
        debug!("GDB output: {}", line);

        match lex_line(&line) {
            LexedLine::Prompt => {}
            LexedLine::Record {
                record,
                malformed_token,
            } => {
                if malformed_token {
                    warn!("Malformed MI record token: {}", line);
                }
                self.queue.push_back(record);
            }
            LexedLine::Unframed(text) => {
                if !text.is_empty() {
                    info!("Inferior output: {}", text);
                }
            }
        }
        Ok(true)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Take the whole queue for a drain pass
    pub(crate) fn take_queue(&mut self) -> VecDeque<PendingRecord> {
        std::mem::take(&mut self.queue)
    }

    /// Put retained records back ahead of whatever arrived during the pass
    pub(crate) fn restore_queue(&mut self, retained: VecDeque<PendingRecord>) {
        let arrived = std::mem::replace(&mut self.queue, retained);
        self.queue.extend(arrived);
    }

    #[cfg(test)]
    pub(crate) fn push_record(&mut self, record: PendingRecord) {
        self.queue.push_back(record);
    }

    pub(crate) fn take_handler(&mut self, token: u64) -> HandlerSlot {
        match self.handlers.get(&token) {
            None => HandlerSlot::Missing,
            Some(None) => HandlerSlot::Claimed,
            Some(Some(_)) => match self.handlers.remove(&token) {
                Some(Some(completion)) => HandlerSlot::Callback(completion),
                _ => HandlerSlot::Missing,
            },
        }
    }

    /// Block until the result record for `token` is queued, then remove
    /// exactly that record and its handler. Other records stay queued.
    pub fn wait_for(&mut self, token: u64) -> MiReply {
        if token == 0 {
            return Err(GdbError::NotConnected);
        }
        loop {
            let found = self
                .queue
                .iter()
                .position(|r| r.sigil == Sigil::Result && r.token == token);
            if let Some(record) = found.and_then(|pos| self.queue.remove(pos)) {
                self.handlers.remove(&token);
                return reply_from(&record);
            }
            if let Err(e) = self.read_next_line(ReadMode::Wait) {
                // A late reply becomes an orphan instead of sticking around
                self.handlers.remove(&token);
                return Err(e.into());
            }
        }
    }

    /// Send and block for the reply
    pub fn send_command_sync(&mut self, text: &str) -> MiReply {
        let token = self.send_command(text, None);
        self.wait_for(token)
    }
}

/// Parse a queued `^` record into the reply handed to its owner
pub(crate) fn reply_from(record: &PendingRecord) -> MiReply {
    let result = parse_result_record(record).map_err(|e| {
        warn!("Failed to parse result record ^{}: {}", record.tail, e);
        GdbError::Parse(e)
    })?;
    if result.class == ResultClass::Error {
        return Err(GdbError::Mi(error_message(&result.body)));
    }
    Ok(result)
}
