//! Locals refresh
//!
//! Collects the argument and local names of the active frame, then brings
//! the set of variable objects standing for them in line with that list.
//! Objects are only reused while the frame stays the same one: same level,
//! same function and same stack depth.

use crate::gdb::debugger::GdbDebugger;
use crate::gdb::error::Result;
use crate::gdb::parser::{parse_local_names, parse_stack_arguments};
use crate::gdb::types::*;
use tracing::{debug, warn};

/// Which frame a set of locals was created in
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FrameIdentity {
    pub level: u32,
    pub function: String,
    pub depth: u32,
}

impl FrameIdentity {
    fn from_parts(level: u32, depth: Option<u32>, function: Option<String>) -> Option<Self> {
        Some(Self {
            level,
            function: function?,
            depth: depth?,
        })
    }
}

#[derive(Debug, Default)]
pub(crate) struct LocalsMachine {
    /// One object per name, arguments first
    pub vars: Vec<VarId>,
    pub valid: bool,
    /// Frame `vars` were created in
    frame: Option<FrameIdentity>,
    in_use: bool,
    epoch: u64,
    depth: Option<u32>,
    function: Option<String>,
    arguments: Option<Vec<String>>,
}

impl LocalsMachine {
    /// Mark the list stale. The objects stay around to be reused.
    pub fn invalidate(&mut self) {
        self.valid = false;
        self.in_use = false;
        self.epoch += 1;
        self.reset_flight();
    }

    fn reset_flight(&mut self) {
        self.depth = None;
        self.function = None;
        self.arguments = None;
    }

    /// Drop a released object from the list
    pub fn forget(&mut self, id: VarId) {
        self.vars.retain(|&v| v != id);
    }

    pub fn clear(&mut self) {
        self.invalidate();
        self.vars.clear();
        self.frame = None;
    }

    fn is_current(&self, epoch: u64) -> bool {
        epoch == self.epoch && !self.valid
    }
}

fn argument_names(body: &MiHash, frame: u32) -> Vec<String> {
    parse_stack_arguments(body)
        .into_iter()
        .find(|(level, _)| *level == frame)
        .map(|(_, args)| args.into_iter().map(|a| a.name).collect())
        .unwrap_or_default()
}

fn stack_depth(body: &MiHash) -> Option<u32> {
    body.get_u32("depth")
}

fn frame_function(body: &MiHash) -> Option<String> {
    body.get("frame")
        .and_then(MiValue::as_hash)
        .and_then(|frame| frame.get_str("func"))
        .map(str::to_string)
}

fn arguments_command(frame: u32) -> String {
    format!("-stack-list-arguments 0 {} {}", frame, frame)
}

const STACK_DEPTH: &str = "-stack-info-depth";
const FRAME_INFO: &str = "-stack-info-frame";
const LIST_LOCALS: &str = "-stack-list-locals 0";

impl GdbDebugger {
    pub(crate) fn update_locals(&mut self) {
        if self.locals.in_use || self.locals.valid || self.state != DebuggerState::Interrupted {
            return;
        }
        self.locals.in_use = true;
        self.locals.reset_flight();
        let epoch = self.locals.epoch;
        let frame = self.active_frame;

        let tokens = [
            self.channel.send_command(
                STACK_DEPTH,
                Some(Box::new(move |dbg, reply| dbg.on_stack_depth(epoch, reply))),
            ),
            self.channel.send_command(
                FRAME_INFO,
                Some(Box::new(move |dbg, reply| dbg.on_frame_info(epoch, reply))),
            ),
            self.channel.send_command(
                &arguments_command(frame),
                Some(Box::new(move |dbg, reply| dbg.on_local_arguments(epoch, frame, reply))),
            ),
            self.channel.send_command(
                LIST_LOCALS,
                Some(Box::new(move |dbg, reply| dbg.on_local_names(epoch, frame, reply))),
            ),
        ];
        if tokens.contains(&0) {
            self.locals.in_use = false;
        }
    }

    fn on_stack_depth(&mut self, epoch: u64, reply: Result<ResultRecord>) {
        if !self.locals.is_current(epoch) {
            return;
        }
        match reply {
            Ok(reply) => self.locals.depth = stack_depth(&reply.body),
            Err(e) => warn!("Reading the stack depth failed: {}", e),
        }
    }

    fn on_frame_info(&mut self, epoch: u64, reply: Result<ResultRecord>) {
        if !self.locals.is_current(epoch) {
            return;
        }
        match reply {
            Ok(reply) => self.locals.function = frame_function(&reply.body),
            Err(e) => warn!("Reading the selected frame failed: {}", e),
        }
    }

    fn on_local_arguments(&mut self, epoch: u64, frame: u32, reply: Result<ResultRecord>) {
        if !self.locals.is_current(epoch) {
            debug!("Discarding stale argument names");
            return;
        }
        self.locals.arguments = Some(match reply {
            Ok(reply) => argument_names(&reply.body, frame),
            Err(e) => {
                warn!("Listing arguments of frame {} failed: {}", frame, e);
                Vec::new()
            }
        });
    }

    fn on_local_names(&mut self, epoch: u64, frame: u32, reply: Result<ResultRecord>) {
        if !self.locals.is_current(epoch) {
            debug!("Discarding stale local names");
            return;
        }
        self.locals.in_use = false;
        let identity = FrameIdentity::from_parts(
            frame,
            self.locals.depth.take(),
            self.locals.function.take(),
        );
        let Some(mut names) = self.locals.arguments.take() else {
            warn!("Local names arrived before the arguments");
            return;
        };
        match reply {
            Ok(reply) => names.extend(parse_local_names(&reply.body)),
            Err(e) => {
                warn!("Listing locals of frame {} failed: {}", frame, e);
                return;
            }
        }
        self.commit_locals(identity, names);
    }

    fn commit_locals(&mut self, identity: Option<FrameIdentity>, names: Vec<String>) {
        self.reconcile_locals(identity, names);
        self.locals.valid = true;
        self.emit(DebuggerEvent::LocalsChanged);
    }

    /// Reuse, create and release objects so `vars` matches `names`.
    /// An unknown identity never matches, not even another unknown one.
    fn reconcile_locals(&mut self, identity: Option<FrameIdentity>, names: Vec<String>) {
        if identity.is_none() || self.locals.frame != identity {
            debug!("Locals frame changed to {:?}", identity);
            for id in std::mem::take(&mut self.locals.vars) {
                self.release_variable(id, true);
            }
            self.locals.frame = identity;
        }

        let mut previous = std::mem::take(&mut self.locals.vars);
        let mut next = Vec::with_capacity(names.len());
        for name in names {
            let reused = previous.iter().position(|&id| {
                self.varobjs
                    .get(id)
                    .is_some_and(|o| o.expression == name)
            });
            match reused {
                Some(pos) => {
                    let id = previous.remove(pos);
                    if let Some(object) = self.varobjs.get_mut(id) {
                        object.synced = None;
                    }
                    next.push(id);
                }
                None => match self.create_variable(&name, FrameBinding::CurrentFrame) {
                    Ok(id) => next.push(id),
                    Err(e) => warn!("Cannot watch local {}: {}", name, e),
                },
            }
        }
        for id in previous {
            self.release_variable(id, true);
        }
        self.locals.vars = next;
    }

    fn refresh_locals_sync(&mut self) -> Result<()> {
        let frame = self.active_frame;
        let depth = self.send_sync(STACK_DEPTH).ok().and_then(|r| stack_depth(&r.body));
        let function = self.send_sync(FRAME_INFO).ok().and_then(|r| frame_function(&r.body));
        let arguments = self.send_sync(&arguments_command(frame))?;
        let mut names = argument_names(&arguments.body, frame);
        names.extend(parse_local_names(&self.send_sync(LIST_LOCALS)?.body));

        self.locals.epoch += 1;
        self.locals.in_use = false;
        self.locals.reset_flight();
        self.commit_locals(FrameIdentity::from_parts(frame, depth, function), names);
        Ok(())
    }

    /// Variable objects for the active frame's arguments and locals
    pub fn locals(&mut self) -> Result<Vec<VarId>> {
        if !self.locals.valid && self.state == DebuggerState::Interrupted {
            self.refresh_locals_sync()?;
        }
        Ok(self.locals.vars.clone())
    }
}
