//! GDB Debugging Session
//!
//! Owns the command channel and everything derived from GDB's replies:
//! execution state, stack, locals, breakpoints and variable objects.
//! Everything runs on the caller's thread; [`GdbDebugger::poll`] is the
//! event loop hook that reads ready output and runs the deferred drain.

use crate::gdb::channel::{reply_from, Completion, HandlerSlot, MiChannel, MiReply};
use crate::gdb::error::{GdbError, Result};
use crate::gdb::locals::LocalsMachine;
use crate::gdb::parser::{mi_quote, parse_breakpoint, parse_location};
use crate::gdb::stack::StackMachine;
use crate::gdb::transport::{MiTransport, ProcessTransport, ReadMode, TimeoutHandler};
use crate::gdb::types::*;
use crate::gdb::varobj::VarRegistry;
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use tracing::{debug, error, info, warn};

/// A debugging session driving one GDB process
pub struct GdbDebugger {
    pub(crate) config: GdbConfig,
    pub(crate) channel: MiChannel,
    pub(crate) state: DebuggerState,
    /// Bumped on every stop; variable caches are stamped with it
    pub(crate) interrupt_count: u32,
    pub(crate) active_frame: u32,
    source_uri: Option<String>,
    source_line: Option<u32>,
    pub(crate) stack: StackMachine,
    pub(crate) locals: LocalsMachine,
    pub(crate) varobjs: VarRegistry,
    breakpoints: Vec<Breakpoint>,
    /// Requested while disconnected, inserted on the next connect
    pending_breakpoints: Vec<BreakpointRequest>,
    timeout_handler: Option<TimeoutHandler>,
    event_tx: Sender<DebuggerEvent>,
    event_rx: Option<Receiver<DebuggerEvent>>,
    drain_queued: bool,
    /// Changes on every disconnect so a drain pass can tell it was cut short
    session: u64,
}

impl GdbDebugger {
    pub fn new(config: GdbConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel();
        Self {
            config,
            channel: MiChannel::new(),
            state: DebuggerState::Disconnected,
            interrupt_count: 0,
            active_frame: 0,
            source_uri: None,
            source_line: None,
            stack: StackMachine::default(),
            locals: LocalsMachine::default(),
            varobjs: VarRegistry::default(),
            breakpoints: Vec::new(),
            pending_breakpoints: Vec::new(),
            timeout_handler: None,
            event_tx,
            event_rx: Some(event_rx),
            drain_queued: false,
            session: 0,
        }
    }

    pub fn config(&self) -> &GdbConfig {
        &self.config
    }

    /// Get the event receiver
    pub fn event_receiver(&mut self) -> Option<Receiver<DebuggerEvent>> {
        self.event_rx.take()
    }

    /// Handler for blocking reads that run past the configured timeout.
    /// Applies to the live GDB at once and to every later connection.
    pub fn set_timeout_handler(&mut self, handler: Option<TimeoutHandler>) {
        self.channel.set_timeout_handler(handler.clone());
        self.timeout_handler = handler;
    }

    pub fn state(&self) -> DebuggerState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    pub fn interrupt_count(&self) -> u32 {
        self.interrupt_count
    }

    pub fn active_frame(&self) -> u32 {
        self.active_frame
    }

    pub fn source_uri(&self) -> Option<&str> {
        self.source_uri.as_deref()
    }

    pub fn source_line(&self) -> Option<u32> {
        self.source_line
    }

    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    pub fn pending_breakpoints(&self) -> &[BreakpointRequest] {
        &self.pending_breakpoints
    }

    pub(crate) fn emit(&self, event: DebuggerEvent) {
        debug!("Event: {:?}", event);
        let _ = self.event_tx.send(event);
    }

    fn set_state(&mut self, state: DebuggerState) {
        if self.state != state {
            info!("Debugger state: {} -> {}", self.state, state);
            self.state = state;
            self.emit(DebuggerEvent::StateChanged(state));
        }
    }

    pub(crate) fn set_source(&mut self, uri: Option<String>, line: Option<u32>) {
        if self.source_uri != uri || self.source_line != line {
            self.source_uri = uri.clone();
            self.source_line = line;
            self.emit(DebuggerEvent::SourceChanged { uri, line });
        }
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Spawn GDB for `target` and start the program
    pub fn connect(&mut self, target: DebugTarget) -> Result<()> {
        self.check_can_connect(&target)?;
        let transport = ProcessTransport::spawn(&self.config)
            .map_err(|e| GdbError::Connect(e.to_string()))?;
        self.connect_with_transport(target, Box::new(transport))
    }

    /// Start `target` over an already established transport
    pub fn connect_with_transport(
        &mut self,
        target: DebugTarget,
        transport: Box<dyn MiTransport>,
    ) -> Result<()> {
        self.check_can_connect(&target)?;
        self.channel.attach(transport);
        self.channel.set_timeout_handler(self.timeout_handler.clone());
        info!("Connecting to {}", target.program.display());

        if let Err(e) = self.initialize(&target) {
            error!("Failed to start {}: {}", target.program.display(), e);
            self.emit(DebuggerEvent::Error {
                message: e.to_string(),
            });
            self.disconnect();
            return Err(e);
        }
        Ok(())
    }

    fn check_can_connect(&self, target: &DebugTarget) -> Result<()> {
        if self.state != DebuggerState::Disconnected || self.channel.is_connected() {
            return Err(GdbError::InvalidState(self.state));
        }
        if !target.program.exists() {
            return Err(GdbError::Connect(format!(
                "program {} does not exist",
                target.program.display()
            )));
        }
        Ok(())
    }

    fn initialize(&mut self, target: &DebugTarget) -> Result<()> {
        if let Err(e) = self.send_sync("-gdb-set mi-async on") {
            warn!("mi-async not supported ({}), falling back to target-async", e);
            self.send_sync("-gdb-set target-async on")?;
        }
        self.send_sync("-gdb-set pagination off")?;
        self.send_sync("-gdb-set confirm off")?;

        let program = target.program.to_string_lossy();
        self.send_sync(&format!("-file-exec-and-symbols {}", mi_quote(&program)))
            .map_err(|e| GdbError::Connect(format!("cannot load {}: {}", program, e)))?;
        if let Some(dir) = &target.working_dir {
            self.send_sync(&format!(
                "-environment-cd {}",
                mi_quote(&dir.to_string_lossy())
            ))
            .map_err(|e| GdbError::Connect(format!("cannot enter {}: {}", dir.display(), e)))?;
        }
        if !target.args.is_empty() {
            let args: Vec<String> = target.args.iter().map(|a| mi_quote(a)).collect();
            self.send_sync(&format!("-exec-arguments {}", args.join(" ")))
                .map_err(|e| GdbError::Connect(format!("cannot set arguments: {}", e)))?;
        }

        for request in std::mem::take(&mut self.pending_breakpoints) {
            self.insert_breakpoint(&request);
        }
        if self.config.stop_at_main {
            self.channel.send_command(
                "-break-insert -t main",
                Some(Box::new(|_, reply| {
                    if let Err(e) = reply {
                        warn!("No temporary breakpoint on main: {}", e);
                    }
                })),
            );
        }

        let token = self
            .channel
            .send_command("-exec-run", Some(Box::new(|dbg, reply| dbg.on_resumed(reply))));
        if token == 0 {
            return Err(GdbError::NotConnected);
        }
        info!("Started {}", program);
        Ok(())
    }

    /// Tear the session down. A no-op when already disconnected.
    pub fn disconnect(&mut self) {
        if self.state == DebuggerState::Disconnected && !self.channel.is_connected() {
            return;
        }
        info!("Disconnecting from GDB");

        // Variable teardown below runs against the dead channel on purpose
        self.channel.kill();
        self.release_all_variables();

        self.drain_queued = false;
        self.session += 1;
        self.channel.clear();
        let _ = self.channel.take_failure();

        let had_stack = self.stack.valid;
        self.stack.invalidate();
        if had_stack {
            self.emit(DebuggerEvent::StackChanged);
        }
        self.locals.clear();
        if !self.breakpoints.is_empty() {
            self.breakpoints.clear();
            self.emit(DebuggerEvent::BreakpointsChanged);
        }
        self.active_frame = 0;
        self.set_source(None, None);

        self.state = DebuggerState::Disconnected;
        self.emit(DebuggerEvent::StateChanged(DebuggerState::Disconnected));
    }

    fn fail(&mut self, error: GdbError) {
        error!("GDB connection failed: {}", error);
        self.emit(DebuggerEvent::Error {
            message: error.to_string(),
        });
        self.disconnect();
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// Read every line GDB has ready and process what was queued
    pub fn poll(&mut self) {
        if let Some(e) = self.channel.take_failure() {
            self.fail(e.into());
            return;
        }
        if !self.channel.is_connected() {
            return;
        }
        loop {
            match self.channel.read_next_line(ReadMode::Poll) {
                Ok(true) => self.schedule_drain(),
                Ok(false) => break,
                Err(e) => {
                    self.fail(e.into());
                    return;
                }
            }
        }
        self.run_deferred();
        if let Some(e) = self.channel.take_failure() {
            self.fail(e.into());
        }
    }

    fn schedule_drain(&mut self) {
        self.drain_queued = true;
    }

    fn run_deferred(&mut self) {
        while self.drain_queued {
            self.drain_queued = false;
            self.process_pending();
        }
    }

    /// One drain pass over a snapshot of the queue
    pub(crate) fn process_pending(&mut self) {
        let session = self.session;
        let mut snapshot = self.channel.take_queue();
        let mut retained = VecDeque::new();

        while let Some(record) = snapshot.pop_front() {
            if self.session != session {
                debug!("Dropping {} records after disconnect", snapshot.len() + 1);
                return;
            }
            if record.sigil != Sigil::Result {
                self.route_record(&record);
                continue;
            }
            match self.channel.take_handler(record.token) {
                HandlerSlot::Callback(completion) => {
                    let reply = reply_from(&record);
                    completion(self, reply);
                }
                HandlerSlot::Claimed => retained.push_back(record),
                HandlerSlot::Missing => {
                    warn!("Orphan result record {}^{}", record.token, record.tail);
                }
            }
        }

        if self.session == session {
            self.channel.restore_queue(retained);
        }
    }

    /// Blocking request; anything else that arrives meanwhile is left for
    /// the next drain
    pub(crate) fn send_sync(&mut self, command: &str) -> Result<ResultRecord> {
        let reply = self.channel.send_command_sync(command);
        if self.channel.queue_len() > 0 {
            self.schedule_drain();
        }
        reply
    }

    // ------------------------------------------------------------------
    // Execution control
    // ------------------------------------------------------------------

    pub(crate) fn on_stopped(&mut self, body: &MiHash) {
        self.interrupt_count += 1;
        let reason = body.get_str("reason").map(StopReason::from);
        match &reason {
            Some(r) if r.is_exit() => {
                info!(
                    "Program exited ({:?}, code {})",
                    r,
                    body.get_str("exit-code").unwrap_or("0")
                );
                self.disconnect();
                return;
            }
            Some(StopReason::Unknown(name)) => warn!("Unrecognized stop reason: {}", name),
            None => warn!("Stop record without a reason"),
            Some(r) => debug!("Stopped: {:?}", r),
        }

        self.set_state(DebuggerState::Interrupted);
        let had_stack = self.stack.valid;
        self.stack.invalidate();
        if had_stack {
            self.emit(DebuggerEvent::StackChanged);
        }
        if self.active_frame != 0 {
            self.active_frame = 0;
            self.emit(DebuggerEvent::ActiveFrameChanged(0));
        }
        self.locals.invalidate();

        // The stop frame is enough to show the location right away
        if let Some(frame) = body.get("frame").and_then(MiValue::as_hash) {
            let (uri, line) = parse_location(frame);
            self.set_source(uri, line);
        }

        self.update_variables();
        self.update_stack();
        self.update_locals();
    }

    pub(crate) fn enter_running(&mut self) {
        if self.state == DebuggerState::Running || !self.channel.is_connected() {
            return;
        }
        self.set_state(DebuggerState::Running);
        let had_stack = self.stack.valid;
        self.stack.invalidate();
        if had_stack {
            self.emit(DebuggerEvent::StackChanged);
        }
        self.locals.invalidate();
    }

    fn on_resumed(&mut self, reply: MiReply) {
        match reply {
            Ok(reply) if reply.class == ResultClass::Running => self.enter_running(),
            Ok(reply) => debug!("Resume acknowledged with {:?}", reply.class),
            Err(e) => {
                warn!("Resuming failed: {}", e);
                self.emit(DebuggerEvent::Error {
                    message: e.to_string(),
                });
            }
        }
    }

    fn reset_active_frame(&mut self) {
        if self.active_frame == 0 {
            return;
        }
        self.channel
            .send_command("-stack-select-frame 0", Some(report_failure("Selecting frame 0")));
        self.active_frame = 0;
        self.emit(DebuggerEvent::ActiveFrameChanged(0));
    }

    fn resume(&mut self, command: &str, allowed: &[DebuggerState]) -> Result<()> {
        if !allowed.contains(&self.state) {
            return Err(GdbError::InvalidState(self.state));
        }
        self.reset_active_frame();
        let token = self
            .channel
            .send_command(command, Some(Box::new(|dbg, reply| dbg.on_resumed(reply))));
        if token == 0 {
            return Err(GdbError::NotConnected);
        }
        Ok(())
    }

    pub fn continue_execution(&mut self) -> Result<()> {
        self.resume("-exec-continue", &[DebuggerState::Interrupted])
    }

    pub fn next(&mut self) -> Result<()> {
        self.resume("-exec-next", &[DebuggerState::Interrupted])
    }

    pub fn step(&mut self) -> Result<()> {
        self.resume("-exec-step", &[DebuggerState::Interrupted])
    }

    pub fn finish(&mut self) -> Result<()> {
        self.resume("-exec-finish", &[DebuggerState::Interrupted])
    }

    /// Run the program again from the start
    pub fn restart(&mut self) -> Result<()> {
        if self.state == DebuggerState::Running {
            self.channel
                .send_command("-exec-interrupt", Some(report_failure("Interrupting")));
        }
        self.resume(
            "-exec-run",
            &[DebuggerState::Running, DebuggerState::Interrupted],
        )
    }

    /// Stop the running program; the stop itself arrives as `*stopped`
    pub fn interrupt(&mut self) -> Result<()> {
        if self.state != DebuggerState::Running {
            return Err(GdbError::InvalidState(self.state));
        }
        let token = self
            .channel
            .send_command("-exec-interrupt", Some(report_failure("Interrupting")));
        if token == 0 {
            return Err(GdbError::NotConnected);
        }
        Ok(())
    }

    /// Select frame `level` for locals and source display
    pub fn set_active_frame(&mut self, level: u32) -> Result<()> {
        if self.state != DebuggerState::Interrupted {
            return Err(GdbError::InvalidState(self.state));
        }
        if level == self.active_frame {
            return Ok(());
        }
        self.send_sync(&format!("-stack-select-frame {}", level))?;
        self.active_frame = level;
        self.emit(DebuggerEvent::ActiveFrameChanged(level));

        let location = self
            .stack
            .frames
            .get(level as usize)
            .map(|f| (f.source_uri.clone(), f.line));
        if let Some((uri, line)) = location {
            self.set_source(uri, line);
        }
        self.locals.invalidate();
        self.update_locals();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Breakpoints
    // ------------------------------------------------------------------

    pub fn request_line_breakpoint(&mut self, file: &str, line: u32) -> Result<()> {
        self.request_breakpoint(BreakpointRequest::Line {
            file: file.to_string(),
            line,
        })
    }

    pub fn request_function_breakpoint(&mut self, name: &str) -> Result<()> {
        self.request_breakpoint(BreakpointRequest::Function {
            name: name.to_string(),
        })
    }

    fn request_breakpoint(&mut self, request: BreakpointRequest) -> Result<()> {
        if !self.channel.is_connected() {
            debug!("Queueing breakpoint at {} until connected", request.location());
            self.pending_breakpoints.push(request);
            return Ok(());
        }
        if self.insert_breakpoint(&request) == 0 {
            return Err(GdbError::NotConnected);
        }
        Ok(())
    }

    fn insert_breakpoint(&mut self, request: &BreakpointRequest) -> u64 {
        let location = request.location();
        let command = format!("-break-insert {}", mi_quote(&location));
        self.channel.send_command(
            &command,
            Some(Box::new(move |dbg, reply| match reply {
                Ok(reply) => match reply
                    .body
                    .get("bkpt")
                    .and_then(MiValue::as_hash)
                    .and_then(parse_breakpoint)
                {
                    Some(bp) => dbg.upsert_breakpoint(bp),
                    None => warn!("break-insert reply for {} without a breakpoint", location),
                },
                Err(e) => {
                    warn!("Cannot set breakpoint at {}: {}", location, e);
                    dbg.emit(DebuggerEvent::Error {
                        message: format!("Cannot set breakpoint at {}: {}", location, e),
                    });
                }
            })),
        )
    }

    pub(crate) fn upsert_breakpoint(&mut self, breakpoint: Breakpoint) {
        match self
            .breakpoints
            .iter_mut()
            .find(|b| b.number == breakpoint.number)
        {
            Some(existing) => *existing = breakpoint,
            None => self.breakpoints.push(breakpoint),
        }
        self.emit(DebuggerEvent::BreakpointsChanged);
    }

    pub(crate) fn remove_breakpoint(&mut self, number: &str) {
        let before = self.breakpoints.len();
        self.breakpoints.retain(|b| b.number != number);
        if self.breakpoints.len() != before {
            self.emit(DebuggerEvent::BreakpointsChanged);
        }
    }

    #[cfg(test)]
    pub(crate) fn take_events(&self) -> Vec<DebuggerEvent> {
        self.event_rx
            .as_ref()
            .map(|rx| rx.try_iter().collect())
            .unwrap_or_default()
    }
}

impl Drop for GdbDebugger {
    fn drop(&mut self) {
        self.channel.kill();
    }
}

/// Completion that only reports failures
fn report_failure(what: &'static str) -> Completion {
    Box::new(move |dbg, reply| {
        if let Err(e) = reply {
            warn!("{} failed: {}", what, e);
            dbg.emit(DebuggerEvent::Error {
                message: format!("{} failed: {}", what, e),
            });
        }
    })
}
