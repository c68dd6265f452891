//! Stack refresh
//!
//! A snapshot needs two replies: `-stack-list-frames` for the frames and
//! `-stack-list-arguments 1` for their arguments. Nothing is committed
//! until both are in.

use crate::gdb::debugger::GdbDebugger;
use crate::gdb::error::{GdbError, Result};
use crate::gdb::parser::{parse_stack, parse_stack_arguments};
use crate::gdb::types::*;
use tracing::{debug, warn};

const LIST_FRAMES: &str = "-stack-list-frames";
const LIST_ARGUMENTS: &str = "-stack-list-arguments 1";

#[derive(Debug, Default)]
enum FramesPhase {
    #[default]
    Waiting,
    Done(Vec<Frame>),
    /// Levels did not match positions; the snapshot is worthless
    Poisoned,
    Failed,
}

#[derive(Debug, Default)]
pub(crate) struct StackMachine {
    pub frames: Vec<Frame>,
    pub valid: bool,
    in_use: bool,
    /// Bumped by every invalidation and every synchronous commit
    epoch: u64,
    phase: FramesPhase,
    refetched: bool,
}

impl StackMachine {
    /// Drop the snapshot; callbacks of an in-flight update become stale
    pub fn invalidate(&mut self) {
        self.frames.clear();
        self.valid = false;
        self.in_use = false;
        self.epoch += 1;
        self.phase = FramesPhase::Waiting;
        self.refetched = false;
    }

    fn is_current(&self, epoch: u64) -> bool {
        epoch == self.epoch && !self.valid
    }
}

fn attach_arguments(frames: &mut [Frame], body: &MiHash) {
    for (level, arguments) in parse_stack_arguments(body) {
        match frames.iter_mut().find(|f| f.level == level) {
            Some(frame) => frame.arguments = arguments,
            None => warn!("Arguments for unknown frame level {}", level),
        }
    }
}

impl GdbDebugger {
    /// Start an asynchronous refresh unless one is running or not needed
    pub(crate) fn update_stack(&mut self) {
        if self.stack.in_use || self.stack.valid || self.state != DebuggerState::Interrupted {
            return;
        }
        self.stack.in_use = true;
        self.stack.phase = FramesPhase::Waiting;
        let epoch = self.stack.epoch;

        let frames = self.channel.send_command(
            LIST_FRAMES,
            Some(Box::new(move |dbg, reply| dbg.on_stack_frames(epoch, reply))),
        );
        let arguments = self.channel.send_command(
            LIST_ARGUMENTS,
            Some(Box::new(move |dbg, reply| dbg.on_stack_arguments(epoch, reply))),
        );
        if frames == 0 || arguments == 0 {
            self.stack.in_use = false;
        }
    }

    fn on_stack_frames(&mut self, epoch: u64, reply: Result<ResultRecord>) {
        if !self.stack.is_current(epoch) {
            debug!("Discarding stale stack frames");
            return;
        }
        self.stack.phase = match reply.and_then(|r| parse_stack(&r.body)) {
            Ok(frames) => FramesPhase::Done(frames),
            Err(GdbError::Protocol(message)) => {
                warn!("Stack snapshot out of sync: {}", message);
                FramesPhase::Poisoned
            }
            Err(e) => {
                warn!("Listing frames failed: {}", e);
                FramesPhase::Failed
            }
        };
    }

    fn on_stack_arguments(&mut self, epoch: u64, reply: Result<ResultRecord>) {
        if !self.stack.is_current(epoch) {
            debug!("Discarding stale stack arguments");
            return;
        }
        self.stack.in_use = false;

        let mut frames = match std::mem::take(&mut self.stack.phase) {
            FramesPhase::Done(frames) => frames,
            FramesPhase::Poisoned => {
                if !self.stack.refetched {
                    self.stack.refetched = true;
                    self.update_stack();
                }
                return;
            }
            FramesPhase::Failed => return,
            FramesPhase::Waiting => {
                warn!("Stack arguments arrived before the frames");
                return;
            }
        };
        match reply {
            Ok(reply) => attach_arguments(&mut frames, &reply.body),
            Err(e) => warn!("Listing frame arguments failed: {}", e),
        }
        self.commit_stack(frames);
    }

    fn commit_stack(&mut self, frames: Vec<Frame>) {
        self.stack.frames = frames;
        self.stack.valid = true;
        self.stack.refetched = false;
        let top = self
            .stack
            .frames
            .first()
            .map(|f| (f.source_uri.clone(), f.line));
        if let Some((uri, line)) = top {
            self.set_source(uri, line);
        }
        self.emit(DebuggerEvent::StackChanged);
    }

    fn refresh_stack_sync(&mut self) -> Result<()> {
        let mut frames = match parse_stack(&self.send_sync(LIST_FRAMES)?.body) {
            Ok(frames) => frames,
            Err(GdbError::Protocol(message)) => {
                warn!("Stack snapshot out of sync, fetching again: {}", message);
                parse_stack(&self.send_sync(LIST_FRAMES)?.body)?
            }
            Err(e) => return Err(e),
        };
        let arguments = self.send_sync(LIST_ARGUMENTS)?;
        attach_arguments(&mut frames, &arguments.body);

        // Whatever is still in flight now describes an older snapshot
        self.stack.epoch += 1;
        self.stack.in_use = false;
        self.stack.phase = FramesPhase::Waiting;
        self.commit_stack(frames);
        Ok(())
    }

    /// Frames of the stopped program, innermost first. Empty unless
    /// interrupted; refreshed synchronously when the snapshot is stale.
    pub fn stack(&mut self) -> Result<&[Frame]> {
        if !self.stack.valid && self.state == DebuggerState::Interrupted {
            self.refresh_stack_sync()?;
        }
        Ok(&self.stack.frames)
    }
}
